//! Store configuration.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::metapb::Shard;
use crate::util::config::{ReadableDuration, ReadableSize};
use crate::box_err;

/// Custom split check: given a shard, returns its observed size and
/// explicit split keys (raw user keys).
pub type SplitCheckFn = Arc<dyn Fn(&Shard) -> Result<(u64, Vec<Vec<u8>>)> + Send + Sync>;
/// Supplies the bootstrap shards at cluster init.
pub type InitialShardsFn = Arc<dyn Fn() -> Vec<Shard> + Send + Sync>;
/// Rewrites the applied index on replica init; disaster-recovery escape
/// hatch.
pub type AdjustAppliedIndexFn = Arc<dyn Fn(&Shard, u64) -> u64 + Send + Sync>;

#[derive(Clone, Default)]
pub struct CustomizeConfig {
    pub initial_shards_factory: Option<InitialShardsFn>,
    pub split_check_factory: Option<Arc<dyn Fn(u64) -> SplitCheckFn + Send + Sync>>,
    pub adjust_init_applied_index_factory:
        Option<Arc<dyn Fn(u64) -> AdjustAppliedIndexFn + Send + Sync>>,
}

impl Debug for CustomizeConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomizeConfig")
            .field(
                "initial_shards_factory",
                &self.initial_shards_factory.is_some(),
            )
            .field("split_check_factory", &self.split_check_factory.is_some())
            .field(
                "adjust_init_applied_index_factory",
                &self.adjust_init_applied_index_factory.is_some(),
            )
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RaftConfig {
    /// Raft logical-clock period.
    pub tick_interval: ReadableDuration,
    pub election_interval_ticks: usize,
    pub heartbeat_interval_ticks: usize,
    pub max_size_per_msg: ReadableSize,
    pub max_inflight_msgs: usize,
    /// Propose a log compaction once this many entries sit between the
    /// truncated index and the applied index.
    pub log_gc_threshold: u64,
    pub log_gc_interval_ticks: usize,
    pub split_check_interval_ticks: usize,
    pub pd_heartbeat_interval_ticks: usize,
}

impl Default for RaftConfig {
    fn default() -> RaftConfig {
        RaftConfig {
            tick_interval: ReadableDuration::millis(100),
            election_interval_ticks: 10,
            heartbeat_interval_ticks: 2,
            max_size_per_msg: ReadableSize::mb(1),
            max_inflight_msgs: 256,
            log_gc_threshold: 64,
            log_gc_interval_ticks: 10,
            split_check_interval_ticks: 10,
            pd_heartbeat_interval_ticks: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReplicationConfig {
    /// Soft upper bound of a shard before it is split.
    pub shard_capacity_bytes: ReadableSize,
    /// A split check fires once the size hint grows past this.
    pub shard_split_check_bytes: ReadableSize,
    pub max_replicas: usize,
    /// Also invalidate a split check when `conf_version` changed between
    /// enqueue and check, not just `version`.
    pub split_epoch_check_conf_version: bool,
}

impl Default for ReplicationConfig {
    fn default() -> ReplicationConfig {
        ReplicationConfig {
            shard_capacity_bytes: ReadableSize::mb(96),
            shard_split_check_bytes: ReadableSize::mb(64),
            max_replicas: 3,
            split_epoch_check_conf_version: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub raft: RaftConfig,
    pub replication: ReplicationConfig,
    /// Number of independent key-space routing trees.
    pub shard_groups: u64,
    /// Where snapshot artifacts are staged.
    pub snap_dir: String,
    /// Number of apply worker threads shared by all shards.
    pub apply_pool_size: usize,
    #[serde(skip)]
    pub customize: CustomizeConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            raft: RaftConfig::default(),
            replication: ReplicationConfig::default(),
            shard_groups: 1,
            snap_dir: "snap".to_owned(),
            apply_pool_size: 2,
            customize: CustomizeConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.raft.tick_interval.is_zero() {
            return Err(box_err!("raft.tick-interval must be greater than 0"));
        }
        if self.raft.heartbeat_interval_ticks == 0 {
            return Err(box_err!("raft.heartbeat-interval-ticks must be greater than 0"));
        }
        if self.raft.election_interval_ticks < 2 * self.raft.heartbeat_interval_ticks {
            return Err(box_err!(
                "raft.election-interval-ticks {} must be at least twice raft.heartbeat-interval-ticks {}",
                self.raft.election_interval_ticks,
                self.raft.heartbeat_interval_ticks
            ));
        }
        if self.replication.shard_capacity_bytes < self.replication.shard_split_check_bytes {
            return Err(box_err!(
                "replication.shard-capacity-bytes {} must not be less than replication.shard-split-check-bytes {}",
                self.replication.shard_capacity_bytes,
                self.replication.shard_split_check_bytes
            ));
        }
        if self.replication.max_replicas == 0 {
            return Err(box_err!("replication.max-replicas must be greater than 0"));
        }
        if self.shard_groups == 0 {
            return Err(box_err!("shard-groups must be greater than 0"));
        }
        if self.apply_pool_size == 0 {
            return Err(box_err!("apply-pool-size must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validate() {
        let mut cfg = Config::default();
        cfg.validate().unwrap();

        cfg.raft.tick_interval = ReadableDuration::millis(0);
        assert!(cfg.validate().is_err());

        cfg = Config::default();
        cfg.replication.shard_capacity_bytes = ReadableSize(10);
        cfg.replication.shard_split_check_bytes = ReadableSize(20);
        assert!(cfg.validate().is_err());

        cfg = Config::default();
        cfg.apply_pool_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let text = r#"
            shard-groups = 2

            [raft]
            tick-interval = "50ms"
            log-gc-threshold = 16

            [replication]
            shard-capacity-bytes = "20B"
            shard-split-check-bytes = "10B"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.shard_groups, 2);
        assert_eq!(cfg.raft.tick_interval, ReadableDuration::millis(50));
        assert_eq!(cfg.raft.log_gc_threshold, 16);
        assert_eq!(cfg.replication.shard_capacity_bytes.0, 20);
        assert_eq!(cfg.replication.shard_split_check_bytes.0, 10);
        cfg.validate().unwrap();
    }
}
