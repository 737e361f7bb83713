mod pipeline;
mod split_check;

pub use pipeline::{ApplyPipeline, ApplyRunner, Job};
pub use split_check::{SplitCheckRunner, SplitCheckTask};
