//! The membership state machine.
//!
//! `start` discovers the current master, probes it, and dispatches on
//! `(identity, outcome)`; `stop` hands the role over or says goodbye;
//! `supersede` completes a won takeover race; `switch_superior`
//! re-parents this slave onto a new master.  Outcomes are the error
//! kinds produced by the store and the RPC client — the dispatch tables
//! branch on them directly.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{IDENTITY_ALL, IDENTITY_MASTER, IDENTITY_SLAVE};
use crate::errors::{NodeError, StopCause};
use crate::pool::{worker, Pool};
use crate::rpc::MasterStatusResponse;
use crate::store::records::{NodeEventType, NodeRecord, RegisteredNodeInfo};

impl Pool {
    // -- Discovery and probing -----------------------------------------------

    /// Find the master one level above self in the store.
    pub fn discover_master(&self) -> Result<NodeRecord, NodeError> {
        let me = self.local.node();
        self.store.get_superior(me.level, None)
    }

    /// Check a discovered master's validity.
    ///
    /// No master → [`NodeError::MasterInvalid`].  A probe that cannot be
    /// built → [`NodeError::RequestInvalid`].  When the master holds this
    /// process's own socket: an answering peer there is
    /// [`NodeError::MasterExisted`], a silent one is
    /// [`NodeError::MasterIsSelf`] (a stale row from a previous
    /// incarnation).  Otherwise transport failures and refusals surface
    /// as themselves, and a 200 answer returns the parsed status.
    pub async fn check_master(
        &self,
        master: Option<&NodeRecord>,
    ) -> Result<MasterStatusResponse, NodeError> {
        let Some(master) = master else {
            warn!("master not specified");
            return Err(NodeError::MasterInvalid);
        };
        debug!("checking master [id: {} - {}]", master.id, master.socket());
        let me = self.local.node();
        let probe = self.client.master_status(&me, master).await;
        if matches!(probe, Err(NodeError::RequestInvalid)) {
            return Err(NodeError::RequestInvalid);
        }
        if me.is_socket_equal(master) {
            let answered = !matches!(probe, Err(NodeError::RequestResponseError));
            return Err(if answered {
                NodeError::MasterExisted
            } else {
                NodeError::MasterIsSelf
            });
        }
        probe
    }

    // -- Start ---------------------------------------------------------------

    /// Enter the cluster with the given identity (1 = master, 2 = slave,
    /// 3 = either).
    pub async fn start(self: &Arc<Self>, identity: u8) -> Result<(), NodeError> {
        info!("starting membership, identity {identity}");
        let (master, outcome) = match self.discover_master() {
            Ok(found) => {
                let outcome = self.check_master(Some(&found)).await.err();
                (Some(found), outcome)
            }
            Err(e) => (None, Some(e)),
        };

        match identity {
            IDENTITY_MASTER => self.start_master(master, outcome).await,
            IDENTITY_SLAVE => self.start_slave(master, outcome).await,
            IDENTITY_ALL => match outcome {
                None => self.start_slave(master, None).await,
                Some(e) => match e {
                    NodeError::LevelAlreadyHighest
                    | NodeError::SuperiorNotExist
                    | NodeError::MasterIsSelf => self.start_master(master, Some(e)).await,
                    NodeError::RequestResponseError | NodeError::MasterValidButRefused => {
                        // The stored master is unreachable or refusing:
                        // clear the stale row and claim the role.
                        if let Some(stale) = &master {
                            self.store.delete(stale)?;
                        }
                        self.start_master(None, Some(NodeError::RequestResponseError))
                            .await
                    }
                    NodeError::MasterExisted => self.start_slave(master, None).await,
                    other => Err(other),
                },
            },
            _ => {
                warn!("identity {identity} does not start any role");
                Ok(())
            }
        }
    }

    /// Assume the master role.
    ///
    /// The cause selects the path in: a missing or unreachable superior
    /// means claiming the slot in the store (after clearing any stale row
    /// on this socket); an already-highest or self-owned row is adopted
    /// without a store write; anything else aborts with that cause.
    pub(crate) async fn start_master(
        self: &Arc<Self>,
        master: Option<NodeRecord>,
        cause: Option<NodeError>,
    ) -> Result<(), NodeError> {
        let mut fresh = false;
        match cause {
            Some(NodeError::SuperiorNotExist) | Some(NodeError::RequestResponseError) => {
                let mut me = self.local.node();
                if let Some(existed) = self.store.get_by_socket(&me.host, me.port)? {
                    self.check_node_status(&existed).await.map_err(|e| match e {
                        NodeError::NodeExisted => NodeError::MasterExisted,
                        other => other,
                    })?;
                }
                self.store.insert_as_master(&mut me)?;
                info!("committed self as master: {me}");
                self.local.set_node(me);
                fresh = true;
            }
            Some(NodeError::LevelAlreadyHighest) | Some(NodeError::MasterIsSelf) | None => {
                if let Some(own) = master {
                    self.local.set_node(own);
                }
            }
            Some(other) => return Err(other),
        }

        self.master.clear();
        self.local.switch_master_on();
        if fresh {
            let me = self.local.node();
            self.store
                .log_event(me.id, NodeEventType::FreshMasterJoined, 0)?;
        }
        worker::spawn_master_supervisor(self);
        Ok(())
    }

    /// Assume the slave role under `master`.
    ///
    /// Registers with the master; the response carries the freshly
    /// assigned id, whose stored row replaces the pre-registration self.
    pub(crate) async fn start_slave(
        self: &Arc<Self>,
        master: Option<NodeRecord>,
        cause: Option<NodeError>,
    ) -> Result<(), NodeError> {
        if let Some(e) = cause {
            return Err(e);
        }
        let master = master.ok_or(NodeError::MasterInvalid)?;
        self.local.switch_slave_on();
        self.accept_master(master.clone());

        let me = self.local.node();
        let registration = self.client.notify_master_to_add(&me, &master).await?;
        let registered = self
            .store
            .get_node(registration.id)?
            .ok_or(NodeError::RecordNotFound)?;
        info!("registered as slave: {registered}");
        self.local.set_node(registered);

        worker::spawn_slave_supervisor(self);
        Ok(())
    }

    // -- Stop ----------------------------------------------------------------

    /// Leave the cluster, handing over or saying goodbye as the current
    /// identity requires.
    pub async fn stop(self: &Arc<Self>, cause: StopCause) {
        if self.local.is_not_determined() {
            return;
        }
        if self.local.is_master() {
            if let Err(e) = self.stop_master(cause).await {
                warn!("stop master: {e}");
            }
        }
        if self.local.is_slave() {
            self.stop_slave(cause).await;
        }
    }

    /// Drop the master role.
    ///
    /// A supersession victim (`MasterRecordInvalid`) neither notifies nor
    /// deletes — its row is already someone else's.  Otherwise the slave
    /// first in turn is promoted through the store and told to take over
    /// while the rest re-parent; with no successor the row is simply
    /// removed.
    pub(crate) async fn stop_master(self: &Arc<Self>, cause: StopCause) -> Result<(), NodeError> {
        self.slaves.stop_worker(cause);
        self.local.switch_master_off();
        if cause == StopCause::MasterRecordInvalid {
            return Ok(());
        }

        let me = self.local.node();
        let candidate_id = self.slaves.turn_candidate().await;
        if candidate_id == 0 {
            self.store.delete(&me)?;
        } else {
            let candidate = self
                .slaves
                .get(candidate_id)
                .await
                .ok_or(NodeError::SlaveInvalid)?;
            self.store.handover(&me, &candidate)?;
            let (switched, takeover) = tokio::join!(
                self.notify_all_slaves_to_switch_superior(candidate_id),
                self.notify_slave_to_takeover(candidate_id),
            );
            if let Err(e) = switched {
                warn!("notify slaves to switch superior: {e}");
            }
            if let Err(e) = takeover {
                warn!("notify slave[{candidate_id}] to take over: {e}");
            }
        }
        self.store
            .log_event(me.id, NodeEventType::ExistedMasterWithdrawn, 0)?;
        Ok(())
    }

    /// Drop the slave role.  A taking-over slave skips the goodbye call;
    /// everyone else tells the master to remove them (errors ignored).
    pub(crate) async fn stop_slave(self: &Arc<Self>, cause: StopCause) {
        self.master.stop_worker(cause);
        self.local.switch_slave_off();
        if cause == StopCause::TakeoverMaster {
            return;
        }
        let me = self.local.node();
        if let Some(master) = self.master.node() {
            if let Err(e) = self.client.notify_master_to_remove(&me, &master).await {
                debug!("notify master to remove self: {e}");
            }
        }
    }

    // -- Role transitions ----------------------------------------------------

    /// Complete a won supersession: the departing master's row must be
    /// gone, self's row now holds its slot.  Reload self, swap the
    /// supervisors and take the roster.
    pub async fn supersede(
        self: &Arc<Self>,
        departing: &RegisteredNodeInfo,
    ) -> Result<(), NodeError> {
        if self.store.get_node(departing.id)?.is_some() {
            // The row still lives: the race was not actually won.
            return Err(NodeError::MasterInvalid);
        }
        let me = self.local.node();
        let reloaded = self
            .store
            .get_node(me.id)?
            .ok_or(NodeError::RecordNotFound)?;
        info!("taking over from master[{}]: {reloaded}", departing.id);
        self.local.set_node(reloaded.clone());

        self.stop_slave(StopCause::TakeoverMaster).await;
        self.master.clear();
        self.refresh_slaves().await;
        self.start_master(Some(reloaded), None).await
    }

    /// Race for the dead master's slot in the store.  Success returns the
    /// updated self record; a conflict means another node already acted.
    pub(crate) fn try_supersede(&self) -> Result<NodeRecord, NodeError> {
        let me = self.local.node();
        let master = self.master.node().ok_or(NodeError::MasterInvalid)?;
        self.store.supersede(&me, &master)
    }

    /// Promote a chosen slave through the store.  The candidate must be
    /// on the roster.
    pub async fn handover(&self, candidate_id: u64) -> Result<(), NodeError> {
        let candidate = self
            .slaves
            .get(candidate_id)
            .await
            .ok_or(NodeError::SlaveInvalid)?;
        let me = self.local.node();
        self.store.handover(&me, &candidate)?;
        Ok(())
    }

    /// Adopt a new master announced by the outgoing one.  The new master
    /// must already be in the store; reachability is probed but a failure
    /// is left to the retry counter.
    pub async fn switch_superior(
        self: &Arc<Self>,
        new_master: &RegisteredNodeInfo,
    ) -> Result<(), NodeError> {
        let reloaded = self
            .store
            .get_node(new_master.id)?
            .ok_or(NodeError::MasterInvalid)?;
        info!("switching superior to: {reloaded}");
        self.accept_master(reloaded.clone());
        if let Err(e) = self.check_master(Some(&reloaded)).await {
            warn!("new master not answering yet: {e}");
        }
        Ok(())
    }

    // -- Handover fan-out ----------------------------------------------------

    /// Tell the chosen candidate to take over from this master.
    pub(crate) async fn notify_slave_to_takeover(&self, candidate_id: u64) -> Result<(), NodeError> {
        let candidate = {
            let table = self.slaves.table.read().await;
            if table.nodes.is_empty() {
                info!("no slave nodes");
                return Ok(());
            }
            table
                .nodes
                .get(&candidate_id)
                .cloned()
                .ok_or(NodeError::SlaveInvalid)?
        };
        info!("notify slave[{candidate_id}] to take over");
        let me = self.local.node();
        self.client.notify_slave_to_takeover(&me, &candidate).await
    }

    /// Tell every other slave to re-parent onto the candidate.  The
    /// target set is captured under the roster's write lock so the
    /// fan-out matches the map contents; the sends run concurrently.
    pub(crate) async fn notify_all_slaves_to_switch_superior(
        &self,
        candidate_id: u64,
    ) -> Result<(), NodeError> {
        let table = self.slaves.table.write().await;
        if table.nodes.len() <= 1 {
            info!("no other slaves to be notified to switch superior");
            return Ok(());
        }
        let candidate = table
            .nodes
            .get(&candidate_id)
            .ok_or(NodeError::MasterInvalid)?;
        let new_master = candidate.to_registered(0);
        let me = self.local.node();
        for (id, slave) in table.nodes.iter() {
            if *id == candidate_id {
                continue;
            }
            info!("notify slave[{}] to switch superior[{}]", id, candidate_id);
            let client = self.client.clone();
            let me = me.clone();
            let slave = slave.clone();
            let new_master = new_master.clone();
            tokio::spawn(async move {
                if let Err(e) = client
                    .notify_slave_to_switch_superior(&me, &slave, &new_master)
                    .await
                {
                    warn!("notify slave[{}] to switch superior: {e}", slave.id);
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::FreshNodeInfo;
    use crate::store::NodeStore;

    fn test_pool(name: &str, port: u16) -> (Arc<NodeStore>, Arc<Pool>) {
        let store = Arc::new(NodeStore::new(":memory:").unwrap());
        let pool = Pool::new(store.clone(), NodeRecord::new(name, "0.0.1", port, 1), true).unwrap();
        (store, pool)
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
    async fn test_discover_master_empty_store() {
        let (_store, pool) = test_pool("P0", 8080);
        let err = pool.discover_master().unwrap_err();
        assert!(matches!(err, NodeError::SuperiorNotExist));
    }

    #[tokio::test]
    async fn test_check_master_none_is_invalid() {
        let (_store, pool) = test_pool("P0", 8080);
        let err = pool.check_master(None).await.unwrap_err();
        assert!(matches!(err, NodeError::MasterInvalid));
    }

    #[tokio::test]
    async fn test_check_master_own_stale_row_is_self() {
        let (store, pool) = test_pool("P0", 8080);
        // A row from a previous incarnation: same socket, nobody serving.
        let mut stale = pool.local.node();
        store.insert_as_master(&mut stale).unwrap();
        let err = pool.check_master(Some(&stale)).await.unwrap_err();
        assert!(matches!(err, NodeError::MasterIsSelf));
    }

    #[tokio::test]
    async fn test_stop_master_without_successor_deletes_row() {
        let (store, pool) = test_pool("P0", 8080);
        let mut me = pool.local.node();
        store.insert_as_master(&mut me).unwrap();
        pool.local.set_node(me.clone());
        pool.local.switch_master_on();

        pool.stop(StopCause::EndpointStopped).await;

        assert!(!pool.local.is_master());
        assert!(store.get_node(me.id).unwrap().is_none());
        assert!(store.get_legacy(me.id).unwrap().is_some());
        assert!(store
            .get_event(me.id, NodeEventType::ExistedMasterWithdrawn, 0)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_stop_master_superseded_leaves_store_alone() {
        let (store, pool) = test_pool("P0", 8080);
        let mut me = pool.local.node();
        store.insert_as_master(&mut me).unwrap();
        pool.local.set_node(me.clone());
        pool.local.switch_master_on();

        pool.stop_master(StopCause::MasterRecordInvalid).await.unwrap();

        assert!(!pool.local.is_master());
        // The row is already someone else's business; no delete, no event.
        assert!(store.get_node(me.id).unwrap().is_some());
        assert!(store
            .get_event(me.id, NodeEventType::ExistedMasterWithdrawn, 0)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_handover_requires_known_candidate() {
        let (store, pool) = test_pool("P0", 8080);
        let mut me = pool.local.node();
        store.insert_as_master(&mut me).unwrap();
        pool.local.set_node(me);

        let err = pool.handover(42).await.unwrap_err();
        assert!(matches!(err, NodeError::SlaveInvalid));
    }

    #[tokio::test]
    async fn test_handover_promotes_roster_member() {
        let (store, pool) = test_pool("P0", 8080);
        let mut me = pool.local.node();
        store.insert_as_master(&mut me).unwrap();
        pool.local.set_node(me.clone());

        let slave = pool
            .accept_slave(&fresh("P1", "192.168.1.20", 8081))
            .await
            .unwrap();
        pool.handover(slave.id).await.unwrap();

        assert!(store.get_node(me.id).unwrap().is_none());
        let promoted = store.get_node(slave.id).unwrap().unwrap();
        assert_eq!(promoted.level, me.level);
        assert_eq!(promoted.turn, me.turn);
    }

    #[tokio::test]
    async fn test_supersede_rejected_while_master_row_lives() {
        let (store, pool) = test_pool("P1", 8081);
        let mut master = NodeRecord::new("P0", "0.0.1", 8080, 1);
        master.host = "192.168.1.2".to_string();
        store.insert_as_master(&mut master).unwrap();

        let err = pool.supersede(&master.to_registered(0)).await.unwrap_err();
        assert!(matches!(err, NodeError::MasterInvalid));
    }

    #[tokio::test]
    async fn test_supersede_after_won_race_becomes_master() {
        let (store, pool) = test_pool("P1", 8081);

        // A master at level 1 and this process registered under it.
        let mut master = NodeRecord::new("P0", "0.0.1", 8080, 1);
        master.host = "192.168.1.2".to_string();
        store.insert_as_master(&mut master).unwrap();
        let me = store
            .insert_as_slave(&master, &fresh("P1", "192.168.1.3", 8081), 1)
            .unwrap();
        pool.local.set_node(me.clone());
        pool.accept_master(master.clone());
        pool.local.switch_slave_on();

        // Win the race, then complete the transition.
        pool.try_supersede().unwrap();
        pool.supersede(&master.to_registered(3)).await.unwrap();

        assert!(pool.local.is_master());
        assert!(!pool.local.is_slave());
        assert!(pool.master.node().is_none());
        let promoted = pool.local.node();
        assert_eq!(promoted.id, me.id);
        assert_eq!(promoted.level, master.level);
        assert_eq!(promoted.superior_id, 0);
        assert!(pool.is_master_working());

        pool.stop(StopCause::EndpointStopped).await;
    }

    #[tokio::test]
    async fn test_switch_superior_unknown_master() {
        let (_store, pool) = test_pool("P1", 8081);
        let mut ghost = NodeRecord::new("PX", "0.0.1", 9000, 1);
        ghost.id = 99;
        let err = pool.switch_superior(&ghost.to_registered(0)).await.unwrap_err();
        assert!(matches!(err, NodeError::MasterInvalid));
    }
}
