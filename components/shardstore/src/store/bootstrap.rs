//! First-boot persistence: store identity and initial shards.

use engine_traits::{Engines, KvEngine, Mutable, Peekable, WriteBatchExt, WriteOptions};

use crate::errors::Result;
use crate::keys;
use crate::metapb::{Shard, StoreIdent};
use crate::raftpb::PeerState;
use crate::store::apply::{write_initial_apply_state, write_shard_state};
use crate::box_err;

/// Loads the store identity, if this store was bootstrapped before.
pub fn load_store_ident<E: KvEngine>(engines: &Engines<E>) -> Result<Option<StoreIdent>> {
    Ok(engines.meta.get_msg(keys::STORE_IDENT_KEY)?)
}

/// Marks the store as bootstrapped. Fails if it already is.
pub fn bootstrap_store<E: KvEngine>(
    engines: &Engines<E>,
    cluster_id: u64,
    store_id: u64,
) -> Result<()> {
    if load_store_ident(engines)?.is_some() {
        return Err(box_err!("store {} is already bootstrapped", store_id));
    }
    let ident = StoreIdent {
        cluster_id,
        store_id,
    };
    let mut wb = engines.meta.write_batch();
    wb.put_msg(keys::STORE_IDENT_KEY, &ident)?;
    engines.meta.write_opt(&wb, &WriteOptions { sync: true })?;
    Ok(())
}

/// Persists the metadata of a newly created shard: local state, shard
/// descriptor and the initial apply state, in one batch.
pub fn bootstrap_shard<E: KvEngine>(engines: &Engines<E>, shard: &Shard, tag: &str) -> Result<()> {
    if engines
        .meta
        .get_value(&keys::local_state_key(shard.id))?
        .is_some()
    {
        return Err(box_err!("shard {} already exists", shard.id));
    }
    let mut wb = engines.meta.write_batch();
    write_shard_state(&mut wb, shard, PeerState::Normal, tag);
    write_initial_apply_state(&mut wb, shard.id, tag);
    engines.meta.write_opt(&wb, &WriteOptions { sync: true })?;
    Ok(())
}
