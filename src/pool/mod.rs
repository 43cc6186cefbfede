//! The process-wide node pool.
//!
//! A `Pool` is the membership singleton: this process's own record and
//! identity, the master it follows, the slaves it supervises, and the
//! handles to the store and the peer RPC client.  The membership state
//! machine lives in [`membership`]; the supervisor loops in [`worker`].

pub mod membership;
pub mod state;
pub mod worker;

use std::sync::{Arc, RwLock as StdRwLock};

use tracing::{debug, info, warn};

use crate::errors::NodeError;
use crate::netutil;
use crate::rpc::NodeClient;
use crate::store::records::{FreshNodeInfo, NodeEventType, NodeRecord, RegisteredNodeInfo};
use crate::store::NodeStore;
use self::state::{PoolMaster, PoolSelf, PoolSlaves};

/// Callback invoked on every supervisor tick.
pub type TickCallback = Box<dyn Fn(&Pool) + Send + Sync>;

/// Process singleton holding all membership state.
pub struct Pool {
    pub local: PoolSelf,
    pub master: PoolMaster,
    pub slaves: PoolSlaves,
    pub(crate) store: Arc<NodeStore>,
    pub(crate) client: NodeClient,
    master_tick_callbacks: StdRwLock<Vec<TickCallback>>,
    slave_tick_callbacks: StdRwLock<Vec<TickCallback>>,
}

impl Pool {
    /// Build the pool around a pre-registration self record, resolving
    /// the host to advertise.
    pub fn new(
        store: Arc<NodeStore>,
        mut self_node: NodeRecord,
        localhost: bool,
    ) -> Result<Arc<Self>, NodeError> {
        self_node.host = netutil::advertised_host(localhost)?;
        Ok(Arc::new(Pool {
            local: PoolSelf::new(self_node),
            master: PoolMaster::default(),
            slaves: PoolSlaves::default(),
            store,
            client: NodeClient::new(),
            master_tick_callbacks: StdRwLock::new(Vec::new()),
            slave_tick_callbacks: StdRwLock::new(Vec::new()),
        }))
    }

    /// Whether the master supervisor is running.
    pub fn is_master_working(&self) -> bool {
        self.slaves.is_working()
    }

    /// Whether the slave supervisor is running.
    pub fn is_slave_working(&self) -> bool {
        self.master.is_working()
    }

    // -- Tick callbacks ------------------------------------------------------

    pub fn attach_master_tick_callback(&self, callback: TickCallback) {
        self.master_tick_callbacks
            .write()
            .expect("lock poisoned")
            .push(callback);
    }

    pub fn attach_slave_tick_callback(&self, callback: TickCallback) {
        self.slave_tick_callbacks
            .write()
            .expect("lock poisoned")
            .push(callback);
    }

    pub(crate) fn run_master_tick_callbacks(&self) {
        let callbacks = self.master_tick_callbacks.read().expect("lock poisoned");
        for callback in callbacks.iter() {
            callback(self);
        }
    }

    pub(crate) fn run_slave_tick_callbacks(&self) {
        let callbacks = self.slave_tick_callbacks.read().expect("lock poisoned");
        for callback in callbacks.iter() {
            callback(self);
        }
    }

    // -- Master reference ----------------------------------------------------

    /// Adopt a master: record the snapshot, reset the probe counter and
    /// place self one level below it.
    pub fn accept_master(&self, master: NodeRecord) {
        self.local.set_level(master.level + 1);
        self.master.accept(master);
    }

    /// The registered view of the master this node answers for: the
    /// followed master, or self when this process holds the role.
    pub fn current_master_registered(&self) -> Option<RegisteredNodeInfo> {
        match self.master.node() {
            Some(master) => Some(master.to_registered(self.master.retry())),
            None if self.local.is_master() => Some(self.local.node().to_registered(0)),
            None => None,
        }
    }

    // -- Slave admission and removal -----------------------------------------

    /// Admit a fresh peer as a slave.
    ///
    /// Re-reads the roster from the store first, so a re-sent admission
    /// is answered with the existing record.  A live node already holding
    /// the requested socket refuses the admission; a dead one is
    /// tombstoned and replaced.
    pub async fn accept_slave(&self, fresh: &FreshNodeInfo) -> Result<NodeRecord, NodeError> {
        info!("{fresh}");
        let mut table = self.slaves.table.write().await;
        let me = self.local.node();
        match self.store.get_all_slaves(&me) {
            Ok(nodes) => table.refresh(nodes),
            Err(e) => debug!("failed to refresh slaves: {e}"),
        }
        if let Some(existing) = table.find_fresh(fresh) {
            info!("the specified slave node record already exists");
            return Ok(existing.clone());
        }
        if let Some(existed) = self.store.get_by_socket(&fresh.host, fresh.port)? {
            self.check_node_status(&existed).await?;
        }
        let turn = table.take_turn();
        let slave = self.store.insert_as_slave(&me, fresh, turn)?;
        table.nodes.insert(slave.id, slave.clone());
        table.retry.insert(slave.id, 0);
        self.store
            .log_event(me.id, NodeEventType::FreshSlaveJoined, slave.id)?;
        Ok(slave)
    }

    /// Remove a slave at its own request, after validating the caller's
    /// identity fields against the roster.
    pub async fn remove_slave(&self, id: u64, fresh: &FreshNodeInfo) -> Result<(), NodeError> {
        info!("remove slave: {id}");
        let mut table = self.slaves.table.write().await;
        let slave = table.check(id, fresh)?;
        self.store.delete(&slave)?;
        table.nodes.remove(&id);
        table.retry.remove(&id);
        let me = self.local.node();
        self.store
            .log_event(me.id, NodeEventType::ExistedSlaveWithdrawn, id)?;
        Ok(())
    }

    /// Reload the roster from the store.
    pub async fn refresh_slaves(&self) {
        let me = self.local.node();
        match self.store.get_all_slaves(&me) {
            Ok(nodes) => self.slaves.table.write().await.refresh(nodes),
            Err(e) => debug!("failed to refresh slaves: {e}"),
        }
    }

    // -- Peer probes ---------------------------------------------------------

    /// Probe the occupant of a socket this process wants to claim.
    ///
    /// A live occupant means the claim must be refused
    /// ([`NodeError::NodeExisted`]); a dead one is reported inactive and
    /// its stale row cleared.
    pub async fn check_node_status(&self, node: &NodeRecord) -> Result<(), NodeError> {
        let me = self.local.node();
        if self.client.node_status(&me, node).await.is_ok() {
            return Err(NodeError::NodeExisted);
        }
        warn!("stale row at {} is unresponsive, clearing it", node.socket());
        self.store
            .log_event(me.id, NodeEventType::MasterReportedSlaveInactive, node.id)?;
        self.store.delete(node)?;
        Ok(())
    }

    /// Compare this process's record against the stored row.
    ///
    /// A mismatch means the row was rewritten behind this process's back
    /// (it has been superseded while unaware).
    pub fn check_self(&self) -> bool {
        let me = self.local.node();
        match self.store.get_node(me.id) {
            Ok(Some(stored)) => {
                let valid = stored.matches(&me);
                if valid {
                    debug!("check self: valid");
                } else {
                    warn!("check self: stored record does not match");
                }
                valid
            }
            Ok(None) => {
                warn!("check self: record is gone");
                false
            }
            Err(e) => {
                warn!("check self: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> (Arc<NodeStore>, Arc<Pool>) {
        let store = Arc::new(NodeStore::new(":memory:").unwrap());
        let node = NodeRecord::new("P0", "0.0.1", 8080, 1);
        let pool = Pool::new(store.clone(), node, true).unwrap();
        (store, pool)
    }

    /// Commit the pool's own record as the master row, as `start_master`
    /// does on the insert path.
    fn commit_as_master(store: &NodeStore, pool: &Pool) -> NodeRecord {
        let mut me = pool.local.node();
        store.insert_as_master(&mut me).unwrap();
        pool.local.set_node(me.clone());
        me
    }

    fn fresh(name: &str, host: &str, port: u16) -> FreshNodeInfo {
        FreshNodeInfo {
            name: name.to_string(),
            node_version: "0.0.1".to_string(),
            host: host.to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_accept_slave_assigns_turn_and_logs() {
        let (store, pool) = test_pool();
        let me = commit_as_master(&store, &pool);

        let slave = pool
            .accept_slave(&fresh("P1", "192.168.1.20", 8081))
            .await
            .unwrap();
        assert_eq!(slave.id, 2);
        assert_eq!(slave.turn, 1);
        assert_eq!(slave.level, me.level + 1);
        assert_eq!(slave.superior_id, me.id);
        assert_eq!(pool.slaves.count().await, 1);
        assert_eq!(pool.slaves.next_turn().await, 2);

        let event = store
            .get_event(me.id, NodeEventType::FreshSlaveJoined, slave.id)
            .unwrap();
        assert!(event.is_some());
    }

    #[tokio::test]
    async fn test_accept_slave_idempotent() {
        let (_store, pool) = test_pool();
        commit_as_master(&pool.store, &pool);

        let info = fresh("P1", "192.168.1.20", 8081);
        let first = pool.accept_slave(&info).await.unwrap();
        let second = pool.accept_slave(&info).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(pool.slaves.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_slave_validates_identity() {
        let (store, pool) = test_pool();
        let me = commit_as_master(&store, &pool);

        let info = fresh("P1", "192.168.1.20", 8081);
        let slave = pool.accept_slave(&info).await.unwrap();

        let err = pool.remove_slave(99, &info).await.unwrap_err();
        assert!(matches!(err, NodeError::MasterDoesNotHaveSpecifiedSlave));

        let mut wrong = info.clone();
        wrong.name = "imposter".to_string();
        let err = pool.remove_slave(slave.id, &wrong).await.unwrap_err();
        assert!(matches!(err, NodeError::SlaveFreshInfoInvalid));
        assert_eq!(pool.slaves.count().await, 1);

        pool.remove_slave(slave.id, &info).await.unwrap();
        assert_eq!(pool.slaves.count().await, 0);
        assert!(store.get_node(slave.id).unwrap().is_none());
        assert!(store.get_legacy(slave.id).unwrap().is_some());

        // One joined row, one withdrawn row.
        assert!(store
            .get_event(me.id, NodeEventType::FreshSlaveJoined, slave.id)
            .unwrap()
            .is_some());
        assert!(store
            .get_event(me.id, NodeEventType::ExistedSlaveWithdrawn, slave.id)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_check_self_detects_rewrite() {
        let (store, pool) = test_pool();
        let me = commit_as_master(&store, &pool);
        assert!(pool.check_self());

        store.delete(&me).unwrap();
        assert!(!pool.check_self());
    }

    #[tokio::test]
    async fn test_accept_master_places_self_below() {
        let (_store, pool) = test_pool();
        let mut master = NodeRecord::new("M", "0.0.1", 8079, 1);
        master.id = 7;
        master.host = "192.168.1.2".to_string();
        pool.accept_master(master.clone());
        assert_eq!(pool.local.node().level, master.level + 1);
        assert_eq!(pool.master.node().unwrap().id, 7);
        assert_eq!(pool.master.retry(), 0);
    }

    #[tokio::test]
    async fn test_current_master_registered_prefers_followed() {
        let (store, pool) = test_pool();
        assert!(pool.current_master_registered().is_none());

        commit_as_master(&store, &pool);
        pool.local.switch_master_on();
        let registered = pool.current_master_registered().unwrap();
        assert_eq!(registered.id, pool.local.node().id);
    }
}
