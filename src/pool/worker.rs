//! Master and slave supervisor loops.
//!
//! Each supervisor is a tokio task ticking at a base interval.
//! Cancellation is cooperative: a `watch` channel carries the stop
//! cause, observed between ticks; the loop logs it and returns.  A tick
//! that overruns the interval is tolerated; ticks never pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::IDENTITY_SLAVE;
use crate::errors::StopCause;
use crate::pool::state::WorkerHandle;
use crate::pool::Pool;
use crate::store::records::NodeEventType;

/// Base tick interval in milliseconds.
const INTERVAL_BASE_MS: u64 = 1000;
/// Missed probes before a slave is reported inactive.
const SLAVE_INACTIVE_THRESHOLD: u8 = 2;
/// Missed probes before a slave is removed outright.
const SLAVE_REMOVE_THRESHOLD: u8 = 3;
/// Failed master probes before attempting to supersede.
const MASTER_SUPERSEDE_THRESHOLD: u8 = 3;
/// Master ticks per liveness heartbeat.
const ALIVE_REPORT_THRESHOLD: u8 = 10;
/// Master ticks between stored-self consistency checks.
const CHECK_SELF_INTERVAL_TICKS: u32 = 10;

/// Launch the master supervisor if it is not already running.  The
/// handle lives with the roster it watches.
pub(crate) fn spawn_master_supervisor(pool: &Arc<Pool>) {
    let mut slot = pool.slaves.worker.lock().expect("mutex poisoned");
    if slot.is_some() {
        return;
    }
    let (cancel_tx, cancel_rx) = watch::channel(None);
    let task = tokio::spawn(master_loop(pool.clone(), cancel_rx));
    *slot = Some(WorkerHandle::new(cancel_tx, task));
}

/// Launch the slave supervisor if it is not already running.  The
/// handle lives with the master reference it watches.
pub(crate) fn spawn_slave_supervisor(pool: &Arc<Pool>) {
    let mut slot = pool.master.worker.lock().expect("mutex poisoned");
    if slot.is_some() {
        return;
    }
    let (cancel_tx, cancel_rx) = watch::channel(None);
    let task = tokio::spawn(slave_loop(pool.clone(), cancel_rx));
    *slot = Some(WorkerHandle::new(cancel_tx, task));
}

fn stop_cause(
    changed: Result<(), watch::error::RecvError>,
    cancel: &watch::Receiver<Option<StopCause>>,
) -> StopCause {
    if changed.is_ok() {
        (*cancel.borrow()).unwrap_or(StopCause::WorkerStopped)
    } else {
        StopCause::WorkerStopped
    }
}

// -- Master supervisor -------------------------------------------------------

async fn master_loop(pool: Arc<Pool>, mut cancel: watch::Receiver<Option<StopCause>>) {
    info!("master worker is working");
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(INTERVAL_BASE_MS)) => {}
            changed = cancel.changed() => {
                info!("master worker stopped, due to: {}", stop_cause(changed, &cancel));
                return;
            }
        }
        ticks = ticks.wrapping_add(1);
        master_tick(&pool, ticks).await;
        pool.run_master_tick_callbacks();
    }
}

/// One master tick: age the roster, heartbeat, verify the stored self.
async fn master_tick(pool: &Arc<Pool>, ticks: u32) {
    debug!("master tick {ticks}");
    let me = pool.local.node();

    // Slaves report in by probing /server/master; their counters are
    // cleared there.  Here the counters age, and the silent get flagged
    // and eventually pruned without notification.
    let (flagged, removed) = pool
        .slaves
        .retry_up_all(SLAVE_INACTIVE_THRESHOLD, SLAVE_REMOVE_THRESHOLD)
        .await;
    for slave in &flagged {
        debug!("slave[{}] has gone quiet", slave.id);
        if let Err(e) =
            pool.store
                .log_event(me.id, NodeEventType::MasterReportedSlaveInactive, slave.id)
        {
            warn!("report slave[{}] inactive: {e}", slave.id);
        }
    }
    for slave in &removed {
        warn!("slave[{}] retried out, removing", slave.id);
        if let Err(e) = pool.store.delete(slave) {
            warn!("remove slave[{}]: {e}", slave.id);
        }
    }

    if pool.local.alive_up_and_clear_if(ALIVE_REPORT_THRESHOLD) == ALIVE_REPORT_THRESHOLD - 1 {
        if let Err(e) = pool.store.log_event(me.id, NodeEventType::ReportActive, 0) {
            warn!("report active: {e}");
        }
    }

    if ticks % CHECK_SELF_INTERVAL_TICKS == 0 && !pool.check_self() {
        // The stored row was rewritten behind this process's back: it
        // has been superseded while unaware.
        if let Err(e) = pool.stop_master(StopCause::MasterRecordInvalid).await {
            warn!("stop master: {e}");
        }
    }
}

// -- Slave supervisor --------------------------------------------------------

async fn slave_loop(pool: Arc<Pool>, mut cancel: watch::Receiver<Option<StopCause>>) {
    info!("slave worker is working");
    if pool.master.node().is_none() {
        warn!("slave worker has no master to watch");
        return;
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(INTERVAL_BASE_MS)) => {}
            changed = cancel.changed() => {
                info!("slave worker stopped, due to: {}", stop_cause(changed, &cancel));
                return;
            }
        }
        if slave_tick(&pool).await {
            pool.run_slave_tick_callbacks();
        }
    }
}

/// One slave tick: probe the master, account the result, and supersede
/// once the probes have run out.  Returns false when the role changed
/// under this tick.
async fn slave_tick(pool: &Arc<Pool>) -> bool {
    let master = pool.master.node();
    match pool.check_master(master.as_ref()).await {
        Ok(status) => {
            let data = status.data.unwrap_or_default();
            if !data.attended {
                // The master no longer counts us among its slaves:
                // stop and register afresh.
                warn!("master does not recognize this node, re-joining");
                pool.stop_slave(StopCause::SlaveEvicted).await;
                schedule_rejoin(pool.clone());
                return false;
            }
            if data.is_master_working {
                pool.master.retry_clear();
            } else {
                pool.master.retry_up();
            }
        }
        Err(e) => {
            let retry = pool.master.retry_up();
            debug!("master probe failed (retry {retry}): {e}");
        }
    }

    if pool.master.retry() >= MASTER_SUPERSEDE_THRESHOLD {
        let Some(master) = master else { return true };
        let me = pool.local.node();
        if let Err(e) =
            pool.store
                .log_event(me.id, NodeEventType::SlaveReportedMasterInactive, master.id)
        {
            warn!("report master inactive: {e}");
        }
        info!("master probes retried out, trying to supersede");
        match pool.try_supersede() {
            Ok(_) => {
                let departing = master.to_registered(pool.master.retry());
                if let Err(e) = pool.supersede(&departing).await {
                    warn!("complete takeover: {e}");
                }
                return false;
            }
            Err(e) => {
                // Another node already acted: adopt whatever master the
                // store shows now.
                debug!("supersede lost: {e}");
                match pool.discover_master() {
                    Ok(current) => pool.accept_master(current),
                    Err(e) => debug!("re-discover master: {e}"),
                }
            }
        }
    }
    true
}

/// Re-enter the cluster as a slave from a fresh task.  Boxed so the
/// restart path does not nest the supervisor future inside itself.
fn schedule_rejoin(pool: Arc<Pool>) {
    let rejoin: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
        if let Err(e) = pool.start(IDENTITY_SLAVE).await {
            warn!("re-join as slave: {e}");
        }
    });
    tokio::spawn(rejoin);
}
