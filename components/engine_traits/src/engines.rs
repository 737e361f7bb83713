use crate::engine::KvEngine;

/// The pair of engines backing one store: shard/raft metadata and user
/// data. They may be two handles to the same underlying engine or two
/// distinct ones; the store never assumes cross-engine atomicity.
#[derive(Clone, Debug)]
pub struct Engines<E: KvEngine> {
    pub meta: E,
    pub data: E,
}

impl<E: KvEngine> Engines<E> {
    pub fn new(meta: E, data: E) -> Self {
        Engines { meta, data }
    }
}
