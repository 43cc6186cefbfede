//! In-memory pool state: self, the followed master, and admitted slaves.
//!
//! `PoolSelf` owns this process's record and identity; `PoolMaster` holds
//! the snapshot of the master this process follows; `PoolSlaves` holds
//! the roster this process supervises while it is master.  Worker handles
//! live next to the peer state they watch: the slave supervisor (which
//! probes the master) under `PoolMaster`, the master supervisor under
//! `PoolSlaves`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, RwLock as StdRwLock};

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::{IDENTITY_MASTER, IDENTITY_SLAVE};
use crate::errors::{NodeError, StopCause};
use crate::store::records::{FreshNodeInfo, NodeRecord, RegisteredNodeInfo};

/// Retry counters saturate here; they never wrap.
pub const RETRY_CEILING: u8 = u8::MAX;

/// Callback invoked on an identity bit transition.
pub type IdentityCallback = Box<dyn Fn() + Send + Sync>;

/// A running supervisor: its cancellation channel and task handle.
///
/// Cancellation is cooperative — the loop observes the channel between
/// ticks, logs the carried cause and returns.
pub struct WorkerHandle {
    cancel: watch::Sender<Option<StopCause>>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn new(cancel: watch::Sender<Option<StopCause>>, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Signal the supervisor to stop with the given cause.  The task
    /// keeps running until it observes the channel.
    pub fn cancel(self, cause: StopCause) {
        let _ = self.cancel.send(Some(cause));
    }
}

// -- PoolSelf ----------------------------------------------------------------

/// This process's own record, identity bitset and liveness counter.
pub struct PoolSelf {
    identity: Mutex<u8>,
    node: StdRwLock<NodeRecord>,
    alive: Mutex<u8>,
    master_on_callbacks: StdRwLock<Vec<IdentityCallback>>,
    master_off_callbacks: StdRwLock<Vec<IdentityCallback>>,
    slave_on_callbacks: StdRwLock<Vec<IdentityCallback>>,
    slave_off_callbacks: StdRwLock<Vec<IdentityCallback>>,
}

impl PoolSelf {
    pub fn new(node: NodeRecord) -> Self {
        Self {
            identity: Mutex::new(0),
            node: StdRwLock::new(node),
            alive: Mutex::new(0),
            master_on_callbacks: StdRwLock::new(Vec::new()),
            master_off_callbacks: StdRwLock::new(Vec::new()),
            slave_on_callbacks: StdRwLock::new(Vec::new()),
            slave_off_callbacks: StdRwLock::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> u8 {
        *self.identity.lock().expect("mutex poisoned")
    }

    pub fn is_master(&self) -> bool {
        self.identity() & IDENTITY_MASTER > 0
    }

    pub fn is_slave(&self) -> bool {
        self.identity() & IDENTITY_SLAVE > 0
    }

    pub fn is_not_determined(&self) -> bool {
        self.identity() == 0
    }

    /// Set the MASTER bit and run the registered transition callbacks.
    /// Transitions serialize on the identity lock.
    pub fn switch_master_on(&self) {
        let mut identity = self.identity.lock().expect("mutex poisoned");
        *identity |= IDENTITY_MASTER;
        Self::run_callbacks(&self.master_on_callbacks);
    }

    pub fn switch_master_off(&self) {
        let mut identity = self.identity.lock().expect("mutex poisoned");
        *identity &= !IDENTITY_MASTER;
        Self::run_callbacks(&self.master_off_callbacks);
    }

    pub fn switch_slave_on(&self) {
        let mut identity = self.identity.lock().expect("mutex poisoned");
        *identity |= IDENTITY_SLAVE;
        Self::run_callbacks(&self.slave_on_callbacks);
    }

    pub fn switch_slave_off(&self) {
        let mut identity = self.identity.lock().expect("mutex poisoned");
        *identity &= !IDENTITY_SLAVE;
        Self::run_callbacks(&self.slave_off_callbacks);
    }

    fn run_callbacks(callbacks: &StdRwLock<Vec<IdentityCallback>>) {
        let callbacks = callbacks.read().expect("lock poisoned");
        for callback in callbacks.iter() {
            callback();
        }
    }

    pub fn attach_master_on_callback(&self, callback: IdentityCallback) {
        self.master_on_callbacks
            .write()
            .expect("lock poisoned")
            .push(callback);
    }

    pub fn attach_master_off_callback(&self, callback: IdentityCallback) {
        self.master_off_callbacks
            .write()
            .expect("lock poisoned")
            .push(callback);
    }

    pub fn attach_slave_on_callback(&self, callback: IdentityCallback) {
        self.slave_on_callbacks
            .write()
            .expect("lock poisoned")
            .push(callback);
    }

    pub fn attach_slave_off_callback(&self, callback: IdentityCallback) {
        self.slave_off_callbacks
            .write()
            .expect("lock poisoned")
            .push(callback);
    }

    /// Snapshot of this process's record.
    pub fn node(&self) -> NodeRecord {
        self.node.read().expect("lock poisoned").clone()
    }

    pub fn set_node(&self, node: NodeRecord) {
        *self.node.write().expect("lock poisoned") = node;
    }

    pub fn set_level(&self, level: u8) {
        self.node.write().expect("lock poisoned").level = level;
    }

    /// Bump the alive counter and clear it at the threshold.  The
    /// returned value is therefore always below `threshold`; a return of
    /// `threshold - 1` marks the heartbeat tick.
    pub fn alive_up_and_clear_if(&self, threshold: u8) -> u8 {
        let mut alive = self.alive.lock().expect("mutex poisoned");
        if *alive < RETRY_CEILING {
            *alive += 1;
        }
        if *alive >= threshold {
            *alive = 0;
        }
        *alive
    }
}

// -- PoolMaster --------------------------------------------------------------

/// The master this process currently follows.  Empty while this process
/// is itself the top-level master.
#[derive(Default)]
pub struct PoolMaster {
    node: StdRwLock<Option<NodeRecord>>,
    retry: AtomicU8,
    /// Slave supervisor handle: the worker probing this master.
    pub(crate) worker: Mutex<Option<WorkerHandle>>,
}

impl PoolMaster {
    /// Adopt a master snapshot and reset the probe counter.
    pub fn accept(&self, master: NodeRecord) {
        *self.node.write().expect("lock poisoned") = Some(master);
        self.retry_clear();
    }

    pub fn clear(&self) {
        *self.node.write().expect("lock poisoned") = None;
    }

    pub fn node(&self) -> Option<NodeRecord> {
        self.node.read().expect("lock poisoned").clone()
    }

    pub fn retry(&self) -> u8 {
        self.retry.load(Ordering::Relaxed)
    }

    /// Count a missed probe, saturating at the ceiling.
    pub fn retry_up(&self) -> u8 {
        self.retry
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(1))
            })
            .map(|v| v.saturating_add(1))
            .unwrap_or(RETRY_CEILING)
    }

    pub fn retry_clear(&self) {
        self.retry.store(0, Ordering::Relaxed);
    }

    pub fn is_working(&self) -> bool {
        self.worker.lock().expect("mutex poisoned").is_some()
    }

    /// Cancel the slave supervisor, if running.
    pub fn stop_worker(&self, cause: StopCause) {
        let mut slot = self.worker.lock().expect("mutex poisoned");
        if let Some(handle) = slot.take() {
            handle.cancel(cause);
        }
    }
}

// -- PoolSlaves --------------------------------------------------------------

/// Roster of admitted slaves with per-slave retry counters and the turn
/// allocator.  All three live under one lock so admission, pruning and
/// fan-out iterate over a consistent view.
#[derive(Debug, Default)]
pub struct SlaveTable {
    pub nodes: HashMap<u64, NodeRecord>,
    pub retry: HashMap<u64, u8>,
    /// Next turn to hand out; floored at 1 because 0 is the master's own
    /// slot.
    pub next_turn: u64,
}

impl SlaveTable {
    /// Allocate the next takeover ordinal.
    pub fn take_turn(&mut self) -> u64 {
        if self.next_turn == 0 {
            self.next_turn = 1;
        }
        let turn = self.next_turn;
        self.next_turn += 1;
        turn
    }

    /// Replace the roster with rows reloaded from the store, keeping the
    /// retry counters of surviving ids and re-basing `next_turn` above
    /// the largest observed turn.
    pub fn refresh(&mut self, nodes: Vec<NodeRecord>) {
        let mut fresh_nodes = HashMap::with_capacity(nodes.len());
        let mut fresh_retry = HashMap::with_capacity(nodes.len());
        let mut max_turn = 0u64;
        for node in nodes {
            max_turn = max_turn.max(node.turn);
            fresh_retry.insert(node.id, self.retry.get(&node.id).copied().unwrap_or(0));
            fresh_nodes.insert(node.id, node);
        }
        self.nodes = fresh_nodes;
        self.retry = fresh_retry;
        self.next_turn = (max_turn + 1).max(1);
    }

    /// The id of the slave first in line to take over: smallest turn, or
    /// 0 when there is no successor.
    pub fn turn_candidate(&self) -> u64 {
        self.nodes
            .values()
            .min_by_key(|node| node.turn)
            .map(|node| node.id)
            .unwrap_or(0)
    }

    /// Find an already-admitted slave presenting the same identity.
    pub fn find_fresh(&self, fresh: &FreshNodeInfo) -> Option<&NodeRecord> {
        self.nodes
            .values()
            .find(|node| node.fresh_info() == *fresh)
    }

    /// Validate a caller-presented identity against the roster.
    pub fn check(&self, id: u64, fresh: &FreshNodeInfo) -> Result<NodeRecord, NodeError> {
        let slave = self
            .nodes
            .get(&id)
            .ok_or(NodeError::MasterDoesNotHaveSpecifiedSlave)?;
        if slave.fresh_info() == *fresh {
            Ok(slave.clone())
        } else {
            Err(NodeError::SlaveFreshInfoInvalid)
        }
    }

    /// Bump every slave's retry counter.  Returns the slaves newly in the
    /// inactive band and those past the removal threshold; the latter are
    /// dropped from the table (the caller clears their store rows).
    pub fn retry_up_all(&mut self, inactive: u8, remove: u8) -> (Vec<NodeRecord>, Vec<NodeRecord>) {
        let mut flagged = Vec::new();
        let mut removed = Vec::new();
        let ids: Vec<u64> = self.nodes.keys().copied().collect();
        for id in ids {
            let counter = self.retry.entry(id).or_insert(0);
            *counter = counter.saturating_add(1);
            let retry = *counter;
            if retry >= remove {
                if let Some(node) = self.nodes.remove(&id) {
                    removed.push(node);
                }
                self.retry.remove(&id);
            } else if retry >= inactive {
                if let Some(node) = self.nodes.get(&id) {
                    flagged.push(node.clone());
                }
            }
        }
        (flagged, removed)
    }
}

/// Slaves admitted by this process, plus the master supervisor handle.
#[derive(Default)]
pub struct PoolSlaves {
    pub(crate) table: RwLock<SlaveTable>,
    /// Master supervisor handle: the worker watching this roster.
    pub(crate) worker: Mutex<Option<WorkerHandle>>,
}

impl PoolSlaves {
    pub async fn get(&self, id: u64) -> Option<NodeRecord> {
        self.table.read().await.nodes.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.table.read().await.nodes.len()
    }

    pub async fn next_turn(&self) -> u64 {
        self.table.read().await.next_turn
    }

    pub async fn turn_candidate(&self) -> u64 {
        self.table.read().await.turn_candidate()
    }

    /// Clear the probe counter of a slave that just reported in.
    pub async fn retry_clear(&self, id: u64) {
        let mut table = self.table.write().await;
        if let Some(counter) = table.retry.get_mut(&id) {
            *counter = 0;
        }
    }

    /// Bump all probe counters; see [`SlaveTable::retry_up_all`].
    pub async fn retry_up_all(&self, inactive: u8, remove: u8) -> (Vec<NodeRecord>, Vec<NodeRecord>) {
        self.table.write().await.retry_up_all(inactive, remove)
    }

    /// The registered view of the roster, with retry counters attached.
    pub async fn registered_infos(&self) -> HashMap<u64, RegisteredNodeInfo> {
        let table = self.table.read().await;
        table
            .nodes
            .iter()
            .map(|(id, node)| {
                let retry = table.retry.get(id).copied().unwrap_or(0);
                (*id, node.to_registered(retry))
            })
            .collect()
    }

    pub fn is_working(&self) -> bool {
        self.worker.lock().expect("mutex poisoned").is_some()
    }

    /// Cancel the master supervisor, if running.
    pub fn stop_worker(&self, cause: StopCause) {
        let mut slot = self.worker.lock().expect("mutex poisoned");
        if let Some(handle) = slot.take() {
            handle.cancel(cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave(id: u64, turn: u64) -> NodeRecord {
        let mut node = NodeRecord::new(&format!("P{id}"), "0.0.1", 8080 + id as u16, 2);
        node.id = id;
        node.host = format!("192.168.1.{id}");
        node.superior_id = 1;
        node.turn = turn;
        node
    }

    #[test]
    fn test_take_turn_monotonic() {
        let mut table = SlaveTable::default();
        assert_eq!(table.take_turn(), 1);
        assert_eq!(table.take_turn(), 2);
        assert_eq!(table.take_turn(), 3);
    }

    #[test]
    fn test_refresh_rebases_next_turn() {
        let mut table = SlaveTable::default();
        table.refresh(vec![slave(2, 1), slave(3, 4)]);
        assert_eq!(table.next_turn, 5);
        assert!(table.next_turn > table.nodes.values().map(|n| n.turn).max().unwrap());

        // An empty roster still hands out turns from 1.
        table.refresh(Vec::new());
        assert_eq!(table.next_turn, 1);
    }

    #[test]
    fn test_refresh_keeps_surviving_retry() {
        let mut table = SlaveTable::default();
        table.refresh(vec![slave(2, 1), slave(3, 2)]);
        table.retry.insert(2, 2);
        table.retry.insert(3, 1);
        table.refresh(vec![slave(2, 1)]);
        assert_eq!(table.retry.get(&2), Some(&2));
        assert!(table.retry.get(&3).is_none());
    }

    #[test]
    fn test_turn_candidate_prefers_smallest_turn() {
        let mut table = SlaveTable::default();
        assert_eq!(table.turn_candidate(), 0);
        table.refresh(vec![slave(2, 3), slave(3, 1), slave(4, 2)]);
        assert_eq!(table.turn_candidate(), 3);
    }

    #[test]
    fn test_check_roster_identity() {
        let mut table = SlaveTable::default();
        table.refresh(vec![slave(2, 1)]);

        let good = table.nodes[&2].fresh_info();
        assert!(table.check(2, &good).is_ok());

        let err = table.check(9, &good).unwrap_err();
        assert!(matches!(err, NodeError::MasterDoesNotHaveSpecifiedSlave));

        let mut bad = good.clone();
        bad.port += 1;
        let err = table.check(2, &bad).unwrap_err();
        assert!(matches!(err, NodeError::SlaveFreshInfoInvalid));
    }

    #[test]
    fn test_retry_up_all_flags_then_removes() {
        let mut table = SlaveTable::default();
        table.refresh(vec![slave(2, 1)]);

        let (flagged, removed) = table.retry_up_all(2, 3);
        assert!(flagged.is_empty() && removed.is_empty());

        let (flagged, removed) = table.retry_up_all(2, 3);
        assert_eq!(flagged.len(), 1);
        assert!(removed.is_empty());

        let (flagged, removed) = table.retry_up_all(2, 3);
        assert!(flagged.is_empty());
        assert_eq!(removed.len(), 1);
        assert!(table.nodes.is_empty());
        assert!(table.retry.is_empty());
    }

    #[test]
    fn test_master_retry_saturates() {
        let master = PoolMaster::default();
        for _ in 0..300 {
            master.retry_up();
        }
        assert_eq!(master.retry(), RETRY_CEILING);
        master.retry_clear();
        assert_eq!(master.retry(), 0);
    }

    #[test]
    fn test_alive_up_and_clear() {
        let local = PoolSelf::new(NodeRecord::new("P0", "0.0.1", 8080, 1));
        let mut reports = 0;
        for _ in 0..30 {
            if local.alive_up_and_clear_if(10) == 9 {
                reports += 1;
            }
        }
        assert_eq!(reports, 3);
    }

    #[test]
    fn test_identity_transitions_run_callbacks() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let local = PoolSelf::new(NodeRecord::new("P0", "0.0.1", 8080, 1));
        let on_count = Arc::new(AtomicUsize::new(0));
        let off_count = Arc::new(AtomicUsize::new(0));
        let on = on_count.clone();
        let off = off_count.clone();
        local.attach_master_on_callback(Box::new(move || {
            on.fetch_add(1, Ordering::SeqCst);
        }));
        local.attach_master_off_callback(Box::new(move || {
            off.fetch_add(1, Ordering::SeqCst);
        }));

        local.switch_master_on();
        assert!(local.is_master());
        assert!(!local.is_slave());
        assert_eq!(on_count.load(Ordering::SeqCst), 1);

        local.switch_slave_on();
        assert!(local.is_master() && local.is_slave());

        local.switch_master_off();
        assert!(!local.is_master());
        assert_eq!(off_count.load(Ordering::SeqCst), 1);
    }
}
