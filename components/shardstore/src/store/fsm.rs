//! The store: one process-wide event loop owning every shard replica on
//! this node, the apply pipeline, the split-check worker and the
//! periodic tick driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use engine_traits::{Engines, Iterable, KvEngine, Peekable};
use prost::Message;
use slog::{error, info, warn, Logger};

use crate::cmdpb::{CmdRequest, CmdResponse};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::keys;
use crate::metapb::{new_peer, Shard, ShardEpoch, Store};
use crate::pd::PlacementDriver;
use crate::raftpb::{PeerState, ShardLocalState};
use crate::store::bootstrap;
use crate::store::cmd_resp;
use crate::store::msg::{Callback, PeerMsg, RaftCommand, ShardMessage, StoreMsg};
use crate::store::peer::{PeerReplica, StoreAction};
use crate::store::router::Router;
use crate::store::shard_state::{SnapState, JOB_STATUS_PENDING};
use crate::store::snap::SnapManager;
use crate::store::transport::Transport;
use crate::store::util;
use crate::store::worker::{ApplyPipeline, Job, SplitCheckRunner, SplitCheckTask};
use crate::util::worker::{Scheduler, Worker};
use crate::box_err;

/// Shared, read-mostly view of the shards hosted on this store; what
/// admin tooling and tests observe.
#[derive(Default)]
pub struct StoreMeta {
    pub store_id: u64,
    pub shards: HashMap<u64, Shard>,
    /// Shards whose local replica is currently leader.
    pub leaders: HashMap<u64, u64>,
}

impl StoreMeta {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn leader_count(&self) -> usize {
        self.leaders.len()
    }

    /// Shards of one group ordered by start key.
    pub fn sorted_shards(&self, group: u64) -> Vec<Shard> {
        let mut shards: Vec<Shard> = self
            .shards
            .values()
            .filter(|s| s.group == group)
            .cloned()
            .collect();
        shards.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        shards
    }
}

/// Everything peer handlers need from the store.
pub struct StoreContext<E: KvEngine> {
    pub cfg: Config,
    pub store: Store,
    pub engines: Engines<E>,
    pub snap_mgr: SnapManager,
    pub pipeline: ApplyPipeline,
    pub split_scheduler: Scheduler<SplitCheckTask>,
    pub pd: Arc<dyn PlacementDriver>,
    pub trans: Arc<dyn Transport>,
    pub router: Router,
    pub meta: Arc<Mutex<StoreMeta>>,
    pub logger: Logger,
}

impl<E: KvEngine> StoreContext<E> {
    pub fn update_shard(&self, shard: &Shard) {
        self.meta
            .lock()
            .unwrap()
            .shards
            .insert(shard.id, shard.clone());
    }

    pub fn remove_shard(&self, shard_id: u64) {
        let mut meta = self.meta.lock().unwrap();
        meta.shards.remove(&shard_id);
        meta.leaders.remove(&shard_id);
    }

    pub fn on_role_changed(&self, shard_id: u64, peer_id: u64, is_leader: bool) {
        let mut meta = self.meta.lock().unwrap();
        if is_leader {
            meta.leaders.insert(shard_id, peer_id);
        } else {
            meta.leaders.remove(&shard_id);
        }
    }
}

struct StoreFsm<E: KvEngine> {
    ctx: StoreContext<E>,
    peers: HashMap<u64, PeerReplica<E>>,
    receiver: Receiver<StoreMsg>,
    /// Destroys deferred on a snapshot install that would not cancel.
    destroy_retry: HashMap<u64, bool>,
    /// Merge sources waiting for their applied index to reach the merge
    /// barrier, keyed by source shard id.
    pending_merges: HashMap<u64, u64>,
    store_tick: usize,
}

impl<E: KvEngine> StoreFsm<E> {
    fn run(mut self) {
        info!(self.ctx.logger, "store started"; "store_id" => self.ctx.store.id);
        while let Ok(msg) = self.receiver.recv() {
            match msg {
                StoreMsg::Peer { shard_id, msg } => self.on_peer_msg(shard_id, msg),
                StoreMsg::RaftMessage(m) => self.on_raft_message(m),
                StoreMsg::CreatePeer { shard, campaign } => {
                    self.create_peer(shard, campaign, true);
                }
                StoreMsg::Tick => self.on_tick(),
                StoreMsg::Stop => break,
            }
        }
        self.ctx.pipeline.shutdown();
        info!(self.ctx.logger, "store stopped"; "store_id" => self.ctx.store.id);
    }

    fn on_peer_msg(&mut self, shard_id: u64, msg: PeerMsg) {
        if !self.peers.contains_key(&shard_id) {
            match msg {
                PeerMsg::RaftCommand(cmd) => {
                    cmd.callback
                        .invoke_with_response(cmd_resp::new_error(Error::ShardNotFound(shard_id)));
                }
                PeerMsg::RaftMessage(m) => self.on_raft_message(m),
                _ => {}
            }
            return;
        }

        match msg {
            PeerMsg::RaftMessage(m) => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                peer.step(m);
                peer.handle_raft_ready(&mut self.ctx);
            }
            PeerMsg::RaftCommand(cmd) => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                peer.propose(&mut self.ctx, cmd);
                peer.handle_raft_ready(&mut self.ctx);
            }
            PeerMsg::Tick => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                peer.on_tick(&mut self.ctx);
                peer.handle_raft_ready(&mut self.ctx);
            }
            PeerMsg::ApplyRes(res) => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                let actions = peer.post_apply(&mut self.ctx, res);
                let applied = peer.applied_index();
                peer.handle_raft_ready(&mut self.ctx);
                self.process_actions(shard_id, actions);
                self.check_merge_barrier(shard_id, applied);
            }
            PeerMsg::SplitCheckResult {
                epoch_at_check,
                size,
                split_keys,
            } => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                peer.on_split_check_result(&mut self.ctx, epoch_at_check, size, split_keys);
                peer.handle_raft_ready(&mut self.ctx);
            }
            PeerMsg::SnapshotGenerated => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                peer.ping();
                peer.handle_raft_ready(&mut self.ctx);
            }
            PeerMsg::SnapshotApplied { success } => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                peer.on_snapshot_applied(&mut self.ctx, success);
                if let Some(keep_data) = self.destroy_retry.remove(&shard_id) {
                    self.destroy_peer(shard_id, keep_data);
                }
            }
            PeerMsg::DestroyRes { merged } => {
                self.peers.remove(&shard_id);
                self.ctx.remove_shard(shard_id);
                info!(
                    self.ctx.logger,
                    "peer removed from store";
                    "shard_id" => shard_id,
                    "merged" => merged,
                );
            }
            PeerMsg::HeartbeatPd => {
                let peer = self.peers.get_mut(&shard_id).unwrap();
                peer.heartbeat_pd(&mut self.ctx);
                peer.handle_raft_ready(&mut self.ctx);
            }
        }
    }

    fn on_raft_message(&mut self, msg: ShardMessage) {
        if msg.to_peer.store_id != self.ctx.store.id {
            warn!(
                self.ctx.logger,
                "raft message for another store, drop";
                "shard_id" => msg.shard_id,
                "to_store" => msg.to_peer.store_id,
                "my_store" => self.ctx.store.id,
            );
            return;
        }
        if !self.peers.contains_key(&msg.shard_id) && !self.maybe_create_peer(&msg) {
            return;
        }
        let peer = self.peers.get_mut(&msg.shard_id).unwrap();
        peer.step(msg);
        peer.handle_raft_ready(&mut self.ctx);
    }

    /// Creates an uninitialized replica for a raft message addressed to
    /// an unknown shard; a snapshot will populate it.
    fn maybe_create_peer(&mut self, msg: &ShardMessage) -> bool {
        let shard_id = msg.shard_id;
        if self.ctx.pipeline.is_destroyed(shard_id) {
            return false;
        }
        // A tombstone on disk outlives the in-memory peer; never revive.
        match self
            .ctx
            .engines
            .meta
            .get_msg::<ShardLocalState>(&keys::local_state_key(shard_id))
        {
            Ok(Some(state)) if state.state() == PeerState::Tombstone => return false,
            Ok(_) => {}
            Err(e) => {
                error!(
                    self.ctx.logger,
                    "failed to read local state";
                    "shard_id" => shard_id,
                    "err" => %e,
                );
                return false;
            }
        }

        let shard = Shard {
            id: shard_id,
            group: msg.group,
            ..Default::default()
        };
        info!(
            self.ctx.logger,
            "create replica on demand";
            "shard_id" => shard_id,
            "peer_id" => msg.to_peer.id,
        );
        match PeerReplica::create(
            &self.ctx.cfg,
            self.ctx.engines.clone(),
            &shard,
            msg.to_peer.clone(),
            self.ctx.logger.clone(),
        ) {
            Ok(peer) => {
                self.ctx
                    .pipeline
                    .schedule(Job::Registration(peer.registration()));
                self.peers.insert(shard_id, peer);
                true
            }
            Err(e) => {
                error!(
                    self.ctx.logger,
                    "failed to create replica on demand";
                    "shard_id" => shard_id,
                    "err" => %e,
                );
                false
            }
        }
    }

    /// Creates a replica for a fully described shard (bootstrap, split
    /// result or placement-driver assignment). `persist` writes the
    /// initial metadata; split results were already persisted by apply.
    fn create_peer(&mut self, shard: Shard, campaign: bool, persist: bool) {
        if self.peers.contains_key(&shard.id) || self.ctx.pipeline.is_destroyed(shard.id) {
            return;
        }
        let peer = match util::find_peer(&shard, self.ctx.store.id) {
            Some(p) => p.clone(),
            None => {
                warn!(
                    self.ctx.logger,
                    "no local peer in shard, skip create";
                    "shard_id" => shard.id,
                );
                return;
            }
        };
        if persist {
            if let Err(e) = bootstrap::bootstrap_shard(&self.ctx.engines, &shard, "create-peer") {
                // Already persisted on a previous run.
                info!(
                    self.ctx.logger,
                    "shard metadata exists, reuse";
                    "shard_id" => shard.id,
                    "err" => %e,
                );
            }
        }
        match PeerReplica::create(
            &self.ctx.cfg,
            self.ctx.engines.clone(),
            &shard,
            peer.clone(),
            self.ctx.logger.clone(),
        ) {
            Ok(mut peer_replica) => {
                self.ctx
                    .pipeline
                    .schedule(Job::Registration(peer_replica.registration()));
                self.ctx.update_shard(&shard);
                // New shards may already exceed the split threshold (a
                // split half, say); make sure they get checked soon.
                peer_replica
                    .set_size_diff_hint(self.ctx.cfg.replication.shard_split_check_bytes.0);
                let min_peer_id = shard.peers.iter().map(|p| p.id).min().unwrap_or(0);
                if campaign || shard.peers.len() == 1 || peer.id == min_peer_id {
                    let _ = peer_replica.campaign();
                }
                peer_replica.handle_raft_ready(&mut self.ctx);
                self.peers.insert(shard.id, peer_replica);
            }
            Err(e) => {
                error!(
                    self.ctx.logger,
                    "failed to create replica";
                    "shard_id" => shard.id,
                    "err" => %e,
                );
            }
        }
    }

    fn process_actions(&mut self, shard_id: u64, actions: Vec<StoreAction>) {
        for action in actions {
            match action {
                StoreAction::CreatePeer { shard, campaign } => {
                    self.create_peer(shard, campaign, false);
                }
                StoreAction::DestroySelf => {
                    self.destroy_peer(shard_id, false);
                }
                StoreAction::TombstoneSource { source, commit } => {
                    if let Some(source_peer) = self.peers.get(&source.id) {
                        if source_peer.applied_index() >= commit {
                            self.destroy_peer(source.id, true);
                        } else {
                            self.pending_merges.insert(source.id, commit);
                        }
                    }
                }
            }
        }
    }

    /// The merge source may only be tombstoned once its applied index
    /// crossed the merge barrier.
    fn check_merge_barrier(&mut self, shard_id: u64, applied: u64) {
        if let Some(commit) = self.pending_merges.get(&shard_id).copied() {
            if applied >= commit {
                self.pending_merges.remove(&shard_id);
                self.destroy_peer(shard_id, true);
            }
        }
    }

    fn destroy_peer(&mut self, shard_id: u64, keep_data: bool) {
        if let Some(peer) = self.peers.get_mut(&shard_id) {
            if !peer.prepare_destroy(&mut self.ctx, keep_data) {
                self.destroy_retry.insert(shard_id, keep_data);
            }
        }
    }

    fn on_tick(&mut self) {
        let shard_ids: Vec<u64> = self.peers.keys().copied().collect();
        for shard_id in shard_ids {
            if let Some(peer) = self.peers.get_mut(&shard_id) {
                peer.on_tick(&mut self.ctx);
                peer.handle_raft_ready(&mut self.ctx);
            }
        }

        self.store_tick += 1;
        if self.store_tick >= self.ctx.cfg.raft.pd_heartbeat_interval_ticks {
            self.store_tick = 0;
            self.on_store_heartbeat();
        }
    }

    fn on_store_heartbeat(&mut self) {
        if let Err(e) = self.ctx.pd.put_store(self.ctx.store.clone()) {
            warn!(self.ctx.logger, "store heartbeat failed"; "err" => %e);
        }
        let to_create = match self.ctx.pd.store_heartbeat(self.ctx.store.id) {
            Ok(shards) => shards,
            Err(e) => {
                warn!(self.ctx.logger, "store heartbeat failed"; "err" => %e);
                return;
            }
        };
        for shard in to_create {
            self.create_peer(shard, false, true);
        }
    }
}

/// Creates the channel pair a store is driven by. The router half may be
/// registered with a transport before the store starts.
pub fn create_router() -> (Router, Receiver<StoreMsg>) {
    let (tx, rx) = channel::unbounded();
    (Router::new(tx), rx)
}

/// A running store; the public handle.
pub struct ShardStore<E: KvEngine> {
    store: Store,
    cfg: Config,
    engines: Engines<E>,
    router: Router,
    meta: Arc<Mutex<StoreMeta>>,
    snap_mgr: SnapManager,
    pd: Arc<dyn PlacementDriver>,
    ticker_stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    split_check_worker: Option<Worker<SplitCheckTask>>,
    logger: Logger,
}

impl<E: KvEngine> ShardStore<E> {
    /// Boots (or recovers) a store and starts its event loop.
    pub fn start(
        mut store: Store,
        cfg: Config,
        engines: Engines<E>,
        pd: Arc<dyn PlacementDriver>,
        trans: Arc<dyn Transport>,
        router: Router,
        receiver: Receiver<StoreMsg>,
        logger: Logger,
    ) -> Result<ShardStore<E>> {
        cfg.validate()?;
        let snap_mgr = SnapManager::new(cfg.snap_dir.clone(), logger.clone());
        snap_mgr.init()?;

        // First boot allocates an identity; later boots reuse it.
        let store_id = match bootstrap::load_store_ident(&engines)? {
            Some(ident) => {
                if ident.cluster_id != pd.cluster_id() {
                    return Err(box_err!(
                        "cluster id mismatch: store {}, placement driver {}",
                        ident.cluster_id,
                        pd.cluster_id()
                    ));
                }
                ident.store_id
            }
            None => {
                let store_id = pd.alloc_id()?;
                bootstrap::bootstrap_store(&engines, pd.cluster_id(), store_id)?;
                store_id
            }
        };
        store.id = store_id;

        let meta = Arc::new(Mutex::new(StoreMeta {
            store_id,
            ..Default::default()
        }));

        let pipeline = ApplyPipeline::new(
            "apply",
            cfg.apply_pool_size,
            store_id,
            &engines,
            &snap_mgr,
            &router,
            &logger,
        )?;

        let mut split_check_worker = Worker::new("split-check");
        split_check_worker.start(SplitCheckRunner::new(
            engines.data.clone(),
            router.clone(),
            logger.clone(),
        ))?;
        let split_scheduler = split_check_worker.scheduler();

        let mut fsm = StoreFsm {
            ctx: StoreContext {
                cfg: cfg.clone(),
                store: store.clone(),
                engines: engines.clone(),
                snap_mgr: snap_mgr.clone(),
                pipeline,
                split_scheduler,
                pd: pd.clone(),
                trans,
                router: router.clone(),
                meta: meta.clone(),
                logger: logger.clone(),
            },
            peers: HashMap::new(),
            receiver,
            destroy_retry: HashMap::new(),
            pending_merges: HashMap::new(),
            store_tick: 0,
        };

        // Recover replicas persisted by earlier runs.
        fsm.recover_shards()?;

        // First store in the cluster seeds the initial shards.
        if !pd.is_bootstrapped() {
            let initial = initial_shards(&fsm.ctx.cfg, pd.as_ref(), store_id)?;
            if pd.bootstrap(store.clone(), initial.clone())? {
                for shard in initial {
                    bootstrap::bootstrap_shard(&engines, &shard, "bootstrap")?;
                    fsm.create_peer(shard, true, false);
                }
            }
        } else {
            pd.put_store(store.clone())?;
        }

        let loop_handle = std::thread::Builder::new()
            .name(format!("store-{}", store_id))
            .spawn(move || fsm.run())?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let tick_router = router.clone();
        let tick_interval: Duration = cfg.raft.tick_interval.into();
        let stop_flag = ticker_stop.clone();
        let ticker_handle = std::thread::Builder::new()
            .name(format!("ticker-{}", store_id))
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(tick_interval);
                    if tick_router.send_store(StoreMsg::Tick).is_err() {
                        break;
                    }
                }
            })?;

        Ok(ShardStore {
            store,
            cfg,
            engines,
            router,
            meta,
            snap_mgr,
            pd,
            ticker_stop,
            handles: vec![loop_handle, ticker_handle],
            split_check_worker: Some(split_check_worker),
            logger,
        })
    }

    pub fn store_id(&self) -> u64 {
        self.store.id
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn meta(&self) -> Arc<Mutex<StoreMeta>> {
        self.meta.clone()
    }

    pub fn engines(&self) -> &Engines<E> {
        &self.engines
    }

    pub fn snap_manager(&self) -> &SnapManager {
        &self.snap_mgr
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn placement_driver(&self) -> Arc<dyn PlacementDriver> {
        self.pd.clone()
    }

    /// Sends a proposal to the shard leader replica on this store.
    pub fn propose(&self, shard_id: u64, request: CmdRequest, cb: Callback) -> Result<()> {
        self.router
            .send_peer(shard_id, PeerMsg::RaftCommand(RaftCommand::new(request, cb)))
    }

    /// Proposes and waits for the reply.
    pub fn exec_command(
        &self,
        shard_id: u64,
        request: CmdRequest,
        timeout: Duration,
    ) -> Result<CmdResponse> {
        let (tx, rx) = channel::bounded(1);
        let deadline = Instant::now() + timeout;
        let cmd = RaftCommand::with_deadline(
            request,
            Callback::Respond(Box::new(move |resp| {
                let _ = tx.send(resp);
            })),
            deadline,
        );
        self.router
            .send_peer(shard_id, PeerMsg::RaftCommand(cmd))?;
        rx.recv_timeout(timeout)
            .map_err(|_| Error::Timeout(format!("no response within {:?}", timeout)))
    }

    pub fn shutdown(&mut self) {
        self.ticker_stop.store(true, Ordering::SeqCst);
        let _ = self.router.send_store(StoreMsg::Stop);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(mut worker) = self.split_check_worker.take() {
            worker.stop();
        }
        info!(self.logger, "store shut down"; "store_id" => self.store.id);
    }
}

impl<E: KvEngine> Drop for ShardStore<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<E: KvEngine> StoreFsm<E> {
    /// Rebuilds in-memory replicas from the persisted local states. A
    /// replica left in `Applying` resumes its snapshot install; a
    /// tombstone is never activated.
    fn recover_shards(&mut self) -> Result<()> {
        let (start, end) = keys::local_state_scan_range();
        let mut states = Vec::new();
        self.ctx.engines.meta.scan(&start, &end, |_, value| {
            let state = ShardLocalState::decode(value)?;
            states.push(state);
            Ok(true)
        })?;

        for state in states {
            let shard = state.shard().clone();
            match state.state() {
                PeerState::Tombstone => {
                    self.ctx.pipeline.mark_destroyed(shard.id);
                    continue;
                }
                PeerState::Normal => {
                    self.create_peer(shard, false, false);
                }
                PeerState::Applying => {
                    let shard_id = shard.id;
                    self.create_peer(shard.clone(), false, false);
                    if let Some(peer) = self.peers.get_mut(&shard_id) {
                        info!(
                            self.ctx.logger,
                            "resume applying snapshot";
                            "shard_id" => shard_id,
                        );
                        let status = Arc::new(AtomicUsize::new(JOB_STATUS_PENDING));
                        peer.set_snap_state(SnapState::Applying(status.clone()));
                        self.ctx.pipeline.schedule(Job::ApplySnapshot {
                            shard_id,
                            status,
                            snap_key: None,
                            clear_ranges: vec![(
                                keys::enc_start_key(&shard),
                                keys::enc_end_key(&shard),
                            )],
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// The bootstrap shards: the customize factory's, or one shard spanning
/// the whole key space per routing group. Ids and the first peer come
/// from the placement driver.
fn initial_shards(
    cfg: &Config,
    pd: &dyn PlacementDriver,
    store_id: u64,
) -> Result<Vec<Shard>> {
    let mut shards = match &cfg.customize.initial_shards_factory {
        Some(factory) => factory(),
        None => (0..cfg.shard_groups)
            .map(|group| Shard {
                group,
                ..Default::default()
            })
            .collect(),
    };
    for shard in &mut shards {
        shard.id = pd.alloc_id()?;
        shard.epoch = Some(ShardEpoch {
            version: util::INIT_EPOCH_VER,
            conf_version: util::INIT_EPOCH_CONF_VER,
        });
        let mut peer = new_peer(pd.alloc_id()?, store_id);
        peer.initial_member = true;
        shard.peers = vec![peer];
    }
    Ok(shards)
}
