//! Durable coordination store.
//!
//! All fleet members share these three tables: `node_info` (live
//! membership rows), `node_info_legacy` (append-only tombstones) and
//! `node_log` (cluster events).  Uses `rusqlite` with the `bundled`
//! feature; the synchronous calls run under a `Mutex` and every mutation
//! touching more than one row opens a transaction.
//!
//! Ids are assigned by `AUTOINCREMENT` and never reused.  Every row
//! mutation bumps `version`; the supersede and handover transactions
//! condition their updates on the observed version, so a conflict rolls
//! the whole transaction back and surfaces as "another node already
//! acted".

pub mod records;

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::errors::NodeError;
use self::records::{FreshNodeInfo, NodeEvent, NodeEventType, NodeLegacyRecord, NodeRecord};

/// Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Store handle over a single shared database.
pub struct NodeStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl NodeStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for
    /// tests).
    pub fn new(path: &str) -> Result<Self, NodeError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> Result<(), NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already
    /// exist.  Idempotent; safe to call on every startup.
    fn init_db(&self) -> Result<(), NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Live membership rows.  Socket uniqueness among live rows is
            -- application-enforced inside the insert transaction.
            CREATE TABLE IF NOT EXISTS node_info (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                name         TEXT NOT NULL DEFAULT '',
                node_version TEXT NOT NULL DEFAULT '',
                host         TEXT NOT NULL,
                port         INTEGER NOT NULL,
                level        INTEGER NOT NULL,
                superior_id  INTEGER NOT NULL DEFAULT 0,
                turn         INTEGER NOT NULL DEFAULT 0,
                version      INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_node_info_level
                ON node_info(level);
            CREATE INDEX IF NOT EXISTS idx_node_info_superior
                ON node_info(superior_id);

            -- Tombstones: the last-observed snapshot of every deleted row.
            -- Never mutated after insert.
            CREATE TABLE IF NOT EXISTS node_info_legacy (
                id           INTEGER PRIMARY KEY,
                name         TEXT NOT NULL DEFAULT '',
                node_version TEXT NOT NULL DEFAULT '',
                host         TEXT NOT NULL,
                port         INTEGER NOT NULL,
                level        INTEGER NOT NULL,
                superior_id  INTEGER NOT NULL DEFAULT 0,
                turn         INTEGER NOT NULL DEFAULT 0,
                version      INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );

            -- Cluster events, keyed (node_id, type, target_node_id): the
            -- first occurrence inserts, later occurrences touch the row.
            CREATE TABLE IF NOT EXISTS node_log (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id        INTEGER NOT NULL,
                type           INTEGER NOT NULL,
                target_node_id INTEGER NOT NULL DEFAULT 0,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL,
                version        INTEGER NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_node_log_key
                ON node_log(node_id, type, target_node_id);
            ",
        )?;
        Ok(())
    }

    // -- Row mapping ---------------------------------------------------------

    fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRecord> {
        Ok(NodeRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            node_version: row.get(2)?,
            host: row.get(3)?,
            port: row.get(4)?,
            level: row.get(5)?,
            superior_id: row.get(6)?,
            turn: row.get(7)?,
            version: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    const NODE_COLUMNS: &'static str =
        "id, name, node_version, host, port, level, superior_id, turn, version, \
         created_at, updated_at";

    fn query_node(conn: &Connection, id: u64) -> Result<Option<NodeRecord>, rusqlite::Error> {
        conn.query_row(
            &format!(
                "SELECT {} FROM node_info WHERE id = ?1",
                Self::NODE_COLUMNS
            ),
            params![id],
            Self::row_to_node,
        )
        .optional()
    }

    // -- Reads ---------------------------------------------------------------

    /// Load a live record by id.
    pub fn get_node(&self, id: u64) -> Result<Option<NodeRecord>, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Ok(Self::query_node(&conn, id)?)
    }

    /// Load a live record by socket.  Used to detect stale rows holding
    /// the socket this process wants to claim.
    pub fn get_by_socket(&self, host: &str, port: u16) -> Result<Option<NodeRecord>, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let node = conn
            .query_row(
                &format!(
                    "SELECT {} FROM node_info WHERE host = ?1 AND port = ?2",
                    Self::NODE_COLUMNS
                ),
                params![host, port],
                Self::row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// Find the superior one level above `level`.
    ///
    /// With `superior_id` given, the row must also carry that id.  Fails
    /// with [`NodeError::LevelAlreadyHighest`] at the top of the
    /// hierarchy and [`NodeError::SuperiorNotExist`] when no row
    /// qualifies.
    pub fn get_superior(
        &self,
        level: u8,
        superior_id: Option<u64>,
    ) -> Result<NodeRecord, NodeError> {
        if level == 0 {
            return Err(NodeError::LevelAlreadyHighest);
        }
        let conn = self.conn.lock().expect("mutex poisoned");
        let node = match superior_id {
            Some(id) => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM node_info WHERE level = ?1 AND id = ?2",
                        Self::NODE_COLUMNS
                    ),
                    params![level - 1, id],
                    Self::row_to_node,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM node_info WHERE level = ?1 ORDER BY id LIMIT 1",
                        Self::NODE_COLUMNS
                    ),
                    params![level - 1],
                    Self::row_to_node,
                )
                .optional()?,
        };
        node.ok_or(NodeError::SuperiorNotExist)
    }

    /// All immediate subordinates of `master`, ordered by turn.
    pub fn get_all_slaves(&self, master: &NodeRecord) -> Result<Vec<NodeRecord>, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM node_info WHERE level = ?1 AND superior_id = ?2 ORDER BY turn",
            Self::NODE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![master.level + 1, master.id], Self::row_to_node)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- Inserts -------------------------------------------------------------

    /// Persist `node` as a master row with whatever `(host, port, level)`
    /// it holds.  Assigns the id and timestamps on success.  Fails with
    /// [`NodeError::NodeExisted`] when a live row already holds the
    /// socket.
    pub fn insert_as_master(&self, node: &mut NodeRecord) -> Result<(), NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.unchecked_transaction()?;
        let occupied: Option<u64> = tx
            .query_row(
                "SELECT id FROM node_info WHERE host = ?1 AND port = ?2",
                params![node.host, node.port],
                |row| row.get(0),
            )
            .optional()?;
        if occupied.is_some() {
            return Err(NodeError::NodeExisted);
        }
        let now = now_ms();
        tx.execute(
            "INSERT INTO node_info \
             (name, node_version, host, port, level, superior_id, turn, version, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
            params![
                node.name,
                node.node_version,
                node.host,
                node.port,
                node.level,
                node.superior_id,
                node.turn,
                now,
            ],
        )?;
        node.id = tx.last_insert_rowid() as u64;
        node.version = 0;
        node.created_at = now;
        node.updated_at = now;
        tx.commit()?;
        Ok(())
    }

    /// Insert a fresh peer as a subordinate of `master` with the given
    /// turn.  Returns the stored record with its assigned id.
    pub fn insert_as_slave(
        &self,
        master: &NodeRecord,
        fresh: &FreshNodeInfo,
        turn: u64,
    ) -> Result<NodeRecord, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let now = now_ms();
        conn.execute(
            "INSERT INTO node_info \
             (name, node_version, host, port, level, superior_id, turn, version, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
            params![
                fresh.name,
                fresh.node_version,
                fresh.host,
                fresh.port,
                master.level + 1,
                master.id,
                turn,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid() as u64;
        Ok(NodeRecord {
            id,
            name: fresh.name.clone(),
            node_version: fresh.node_version.clone(),
            host: fresh.host.clone(),
            port: fresh.port,
            level: master.level + 1,
            superior_id: master.id,
            turn,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    // -- Deletes -------------------------------------------------------------

    /// Soft delete: remove the live row and write its tombstone in one
    /// transaction.
    pub fn delete(&self, node: &NodeRecord) -> Result<(), NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.unchecked_transaction()?;
        Self::delete_in_tx(&tx, node.id)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_in_tx(tx: &Transaction<'_>, id: u64) -> Result<(), rusqlite::Error> {
        tx.execute(
            "INSERT INTO node_info_legacy \
             (id, name, node_version, host, port, level, superior_id, turn, version, \
              created_at, updated_at) \
             SELECT id, name, node_version, host, port, level, superior_id, turn, version, \
                    created_at, updated_at \
             FROM node_info WHERE id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM node_info WHERE id = ?1", params![id])?;
        Ok(())
    }

    // -- Transitions ---------------------------------------------------------

    /// Atomically replace a dead master: delete it, move `me` into its
    /// slot, and re-parent every former sibling.
    ///
    /// `me` and `master` are the caller's snapshots.  The master is
    /// reloaded by `(id, host, port, level)` and must still match; `me`
    /// must be its immediate subordinate; the update of `me` is
    /// conditioned on `me.version`.  Any disagreement rolls the whole
    /// transaction back.  Returns the updated self record.
    pub fn supersede(
        &self,
        me: &NodeRecord,
        master: &NodeRecord,
    ) -> Result<NodeRecord, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.unchecked_transaction()?;

        let found = tx
            .query_row(
                &format!(
                    "SELECT {} FROM node_info \
                     WHERE id = ?1 AND host = ?2 AND port = ?3 AND level = ?4",
                    Self::NODE_COLUMNS
                ),
                params![master.id, master.host, master.port, master.level],
                Self::row_to_node,
            )
            .optional()?;
        let found = found.ok_or(NodeError::MasterRecordInvalid)?;

        if me.superior_id != found.id || me.level != found.level + 1 {
            return Err(NodeError::MasterNotSuperior);
        }

        let prev_id = found.id;
        let superior_id = found.superior_id;
        let turn = found.turn;
        Self::delete_in_tx(&tx, prev_id)?;

        let now = now_ms();
        let affected = tx.execute(
            "UPDATE node_info \
             SET level = level - 1, superior_id = ?1, turn = ?2, \
                 version = version + 1, updated_at = ?3 \
             WHERE id = ?4 AND version = ?5",
            params![superior_id, turn, now, me.id, me.version],
        )?;
        if affected == 0 {
            return Err(NodeError::MasterRecordInvalid);
        }

        tx.execute(
            "UPDATE node_info \
             SET superior_id = ?1, version = version + 1, updated_at = ?2 \
             WHERE superior_id = ?3 AND id != ?1",
            params![me.id, now, prev_id],
        )?;

        tx.commit()?;
        Self::query_node(&conn, me.id)?.ok_or(NodeError::RecordNotFound)
    }

    /// Atomically promote `candidate` into this master's slot before the
    /// master departs: delete self, move the candidate up, and re-parent
    /// the remaining siblings.  Returns the updated candidate record.
    pub fn handover(
        &self,
        me: &NodeRecord,
        candidate: &NodeRecord,
    ) -> Result<NodeRecord, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.unchecked_transaction()?;

        let found = tx
            .query_row(
                &format!(
                    "SELECT {} FROM node_info \
                     WHERE id = ?1 AND host = ?2 AND port = ?3 AND level = ?4",
                    Self::NODE_COLUMNS
                ),
                params![candidate.id, candidate.host, candidate.port, candidate.level],
                Self::row_to_node,
            )
            .optional()?;
        let found = found.ok_or(NodeError::SlaveNotSubordinate)?;

        if found.superior_id != me.id || found.level != me.level + 1 {
            return Err(NodeError::SlaveNotSubordinate);
        }

        let prev_id = me.id;
        let superior_id = me.superior_id;
        let turn = me.turn;
        Self::delete_in_tx(&tx, prev_id)?;

        let now = now_ms();
        let affected = tx.execute(
            "UPDATE node_info \
             SET level = level - 1, superior_id = ?1, turn = ?2, \
                 version = version + 1, updated_at = ?3 \
             WHERE id = ?4 AND version = ?5",
            params![superior_id, turn, now, found.id, found.version],
        )?;
        if affected == 0 {
            return Err(NodeError::SlaveNotSubordinate);
        }

        tx.execute(
            "UPDATE node_info \
             SET superior_id = ?1, version = version + 1, updated_at = ?2 \
             WHERE superior_id = ?3 AND level = ?4 AND id != ?1",
            params![found.id, now, prev_id, found.level],
        )?;

        tx.commit()?;
        Self::query_node(&conn, found.id)?.ok_or(NodeError::RecordNotFound)
    }

    // -- Event log -----------------------------------------------------------

    /// Record a cluster event.  The first occurrence of
    /// `(node_id, type, target)` inserts a row; later occurrences bump
    /// `updated_at` and `version` on the existing one.  The
    /// read-then-update is not atomic; double-counting is acceptable.
    pub fn log_event(
        &self,
        node_id: u64,
        event_type: NodeEventType,
        target_node_id: u64,
    ) -> Result<(), NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let now = now_ms();
        let existing: Option<u64> = conn
            .query_row(
                "SELECT id FROM node_log \
                 WHERE node_id = ?1 AND type = ?2 AND target_node_id = ?3",
                params![node_id, event_type as u8, target_node_id],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE node_log SET updated_at = ?1, version = version + 1 WHERE id = ?2",
                    params![now, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO node_log \
                     (node_id, type, target_node_id, created_at, updated_at, version) \
                     VALUES (?1, ?2, ?3, ?4, ?4, 0)",
                    params![node_id, event_type as u8, target_node_id, now],
                )?;
            }
        }
        Ok(())
    }

    /// Load a single event row, if present.
    pub fn get_event(
        &self,
        node_id: u64,
        event_type: NodeEventType,
        target_node_id: u64,
    ) -> Result<Option<NodeEvent>, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let event = conn
            .query_row(
                "SELECT id, node_id, type, target_node_id, created_at, updated_at, version \
                 FROM node_log \
                 WHERE node_id = ?1 AND type = ?2 AND target_node_id = ?3",
                params![node_id, event_type as u8, target_node_id],
                |row| {
                    Ok(NodeEvent {
                        id: row.get(0)?,
                        node_id: row.get(1)?,
                        event_type: row.get(2)?,
                        target_node_id: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                        version: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(event)
    }

    /// Load a tombstone by node id.
    pub fn get_legacy(&self, id: u64) -> Result<Option<NodeLegacyRecord>, NodeError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let legacy = conn
            .query_row(
                &format!(
                    "SELECT {} FROM node_info_legacy WHERE id = ?1",
                    Self::NODE_COLUMNS
                ),
                params![id],
                |row| {
                    Ok(NodeLegacyRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        node_version: row.get(2)?,
                        host: row.get(3)?,
                        port: row.get(4)?,
                        level: row.get(5)?,
                        superior_id: row.get(6)?,
                        turn: row.get(7)?,
                        version: row.get(8)?,
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(legacy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> NodeStore {
        NodeStore::new(":memory:").expect("failed to create in-memory store")
    }

    fn fresh(name: &str, host: &str, port: u16) -> FreshNodeInfo {
        FreshNodeInfo {
            name: name.to_string(),
            node_version: "0.0.1".to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// Insert a level-1 master at 127.0.0.1:8080, as a bootstrapping
    /// process would.
    fn bootstrap_master(store: &NodeStore) -> NodeRecord {
        let mut me = NodeRecord::new("P0", "0.0.1", 8080, 1);
        me.host = "127.0.0.1".to_string();
        store.insert_as_master(&mut me).unwrap();
        me
    }

    #[test]
    fn test_schema_idempotent() {
        let store = test_store();
        store.init_db().expect("second init_db failed");
        store.init_db().expect("third init_db failed");
    }

    #[test]
    fn test_bootstrap_as_sole_master() {
        let store = test_store();
        let me = bootstrap_master(&store);
        assert_eq!(me.id, 1);
        assert_eq!(me.level, 1);
        assert_eq!(me.superior_id, 0);
        assert_eq!(me.turn, 0);

        let stored = store.get_node(1).unwrap().unwrap();
        assert!(stored.matches(&me));
    }

    #[test]
    fn test_insert_as_master_socket_collision() {
        let store = test_store();
        bootstrap_master(&store);

        let mut rival = NodeRecord::new("P1", "0.0.1", 8080, 1);
        rival.host = "127.0.0.1".to_string();
        let err = store.insert_as_master(&mut rival).unwrap_err();
        assert!(matches!(err, NodeError::NodeExisted));
        // The losing insert must not have claimed an id.
        assert_eq!(rival.id, 0);
    }

    #[test]
    fn test_get_superior_level_boundary() {
        let store = test_store();
        let err = store.get_superior(0, None).unwrap_err();
        assert!(matches!(err, NodeError::LevelAlreadyHighest));
    }

    #[test]
    fn test_get_superior_not_exist() {
        let store = test_store();
        let err = store.get_superior(1, None).unwrap_err();
        assert!(matches!(err, NodeError::SuperiorNotExist));
    }

    #[test]
    fn test_get_superior_finds_master() {
        let store = test_store();
        let me = bootstrap_master(&store);
        let superior = store.get_superior(2, None).unwrap();
        assert_eq!(superior.id, me.id);

        // Specifying the superior id narrows the match.
        let superior = store.get_superior(2, Some(me.id)).unwrap();
        assert_eq!(superior.id, me.id);
        let err = store.get_superior(2, Some(99)).unwrap_err();
        assert!(matches!(err, NodeError::SuperiorNotExist));
    }

    #[test]
    fn test_insert_as_slave_assigns_fields() {
        let store = test_store();
        let master = bootstrap_master(&store);
        let slave = store
            .insert_as_slave(&master, &fresh("P1", "192.168.1.20", 8081), 1)
            .unwrap();
        assert_eq!(slave.id, 2);
        assert_eq!(slave.level, master.level + 1);
        assert_eq!(slave.superior_id, master.id);
        assert_eq!(slave.turn, 1);

        let slaves = store.get_all_slaves(&master).unwrap();
        assert_eq!(slaves.len(), 1);
        assert_eq!(slaves[0].id, slave.id);
    }

    #[test]
    fn test_delete_writes_tombstone() {
        let store = test_store();
        let me = bootstrap_master(&store);
        store.delete(&me).unwrap();

        assert!(store.get_node(me.id).unwrap().is_none());
        let legacy = store.get_legacy(me.id).unwrap().unwrap();
        assert_eq!(legacy.host, me.host);
        assert_eq!(legacy.port, me.port);
        assert_eq!(legacy.level, me.level);
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let store = test_store();
        let me = bootstrap_master(&store);
        store.delete(&me).unwrap();

        let mut next = NodeRecord::new("P1", "0.0.1", 8080, 1);
        next.host = "127.0.0.1".to_string();
        store.insert_as_master(&mut next).unwrap();
        assert!(next.id > me.id);
    }

    #[test]
    fn test_supersede_replaces_master() {
        let store = test_store();
        let master = bootstrap_master(&store);
        let me = store
            .insert_as_slave(&master, &fresh("P1", "192.168.1.20", 8081), 1)
            .unwrap();
        let other = store
            .insert_as_slave(&master, &fresh("P2", "192.168.1.21", 8082), 2)
            .unwrap();

        let updated = store.supersede(&me, &master).unwrap();
        assert_eq!(updated.id, me.id);
        assert_eq!(updated.level, master.level);
        assert_eq!(updated.superior_id, 0);
        assert_eq!(updated.turn, 0);
        assert_eq!(updated.version, me.version + 1);

        // The dead master is gone and tombstoned.
        assert!(store.get_node(master.id).unwrap().is_none());
        assert!(store.get_legacy(master.id).unwrap().is_some());

        // The former sibling now points at the new master.
        let sibling = store.get_node(other.id).unwrap().unwrap();
        assert_eq!(sibling.superior_id, me.id);

        // Hierarchy invariant: every non-top row has a live parent one
        // level up.
        let slaves = store.get_all_slaves(&updated).unwrap();
        assert_eq!(slaves.len(), 1);
        assert_eq!(slaves[0].id, other.id);
    }

    #[test]
    fn test_get_by_socket() {
        let store = test_store();
        let me = bootstrap_master(&store);
        let found = store.get_by_socket("127.0.0.1", 8080).unwrap().unwrap();
        assert_eq!(found.id, me.id);
        assert!(store.get_by_socket("127.0.0.1", 9999).unwrap().is_none());
        assert!(store.get_by_socket("10.0.0.9", 8080).unwrap().is_none());
    }

    #[test]
    fn test_get_all_slaves_ordered_by_turn() {
        let store = test_store();
        let master = bootstrap_master(&store);
        store
            .insert_as_slave(&master, &fresh("P3", "192.168.1.23", 8083), 3)
            .unwrap();
        store
            .insert_as_slave(&master, &fresh("P1", "192.168.1.21", 8081), 1)
            .unwrap();
        store
            .insert_as_slave(&master, &fresh("P2", "192.168.1.22", 8082), 2)
            .unwrap();

        let slaves = store.get_all_slaves(&master).unwrap();
        let turns: Vec<u64> = slaves.iter().map(|s| s.turn).collect();
        assert_eq!(turns, vec![1, 2, 3]);
    }

    #[test]
    fn test_supersede_reparents_every_sibling() {
        let store = test_store();
        let master = bootstrap_master(&store);
        let me = store
            .insert_as_slave(&master, &fresh("P2", "192.168.1.22", 8082), 2)
            .unwrap();
        let first = store
            .insert_as_slave(&master, &fresh("P1", "192.168.1.21", 8081), 1)
            .unwrap();
        let third = store
            .insert_as_slave(&master, &fresh("P3", "192.168.1.23", 8083), 3)
            .unwrap();

        let updated = store.supersede(&me, &master).unwrap();

        for sibling in [&first, &third] {
            let row = store.get_node(sibling.id).unwrap().unwrap();
            assert_eq!(row.superior_id, updated.id);
            // Re-parenting is a mutation like any other.
            assert_eq!(row.version, sibling.version + 1);
            assert_eq!(row.turn, sibling.turn);
        }
        assert_eq!(store.get_all_slaves(&updated).unwrap().len(), 2);
    }

    #[test]
    fn test_handover_candidate_at_wrong_level() {
        let store = test_store();
        let me = bootstrap_master(&store);
        let slave = store
            .insert_as_slave(&me, &fresh("P1", "192.168.1.21", 8081), 1)
            .unwrap();
        let grandchild = store
            .insert_as_slave(&slave, &fresh("P2", "192.168.1.22", 8082), 1)
            .unwrap();

        let err = store.handover(&me, &grandchild).unwrap_err();
        assert!(matches!(err, NodeError::SlaveNotSubordinate));
        assert!(store.get_node(me.id).unwrap().is_some());
    }

    #[test]
    fn test_supersede_stale_master_snapshot() {
        let store = test_store();
        let master = bootstrap_master(&store);
        let me = store
            .insert_as_slave(&master, &fresh("P1", "192.168.1.20", 8081), 1)
            .unwrap();

        let mut wrong = master.clone();
        wrong.host = "10.9.9.9".to_string();
        let err = store.supersede(&me, &wrong).unwrap_err();
        assert!(matches!(err, NodeError::MasterRecordInvalid));
        // Nothing was mutated.
        assert!(store.get_node(master.id).unwrap().is_some());
    }

    #[test]
    fn test_supersede_not_subordinate() {
        let store = test_store();
        let master = bootstrap_master(&store);
        let mut stranger = NodeRecord::new("PX", "0.0.1", 9000, 2);
        stranger.host = "192.168.1.30".to_string();
        stranger.superior_id = 42;
        let err = store.supersede(&stranger, &master).unwrap_err();
        assert!(matches!(err, NodeError::MasterNotSuperior));
    }

    #[test]
    fn test_supersede_version_conflict_rolls_back() {
        let store = test_store();
        let master = bootstrap_master(&store);
        let me = store
            .insert_as_slave(&master, &fresh("P1", "192.168.1.20", 8081), 1)
            .unwrap();

        let mut stale = me.clone();
        stale.version = me.version + 5;
        let err = store.supersede(&stale, &master).unwrap_err();
        assert!(matches!(err, NodeError::MasterRecordInvalid));

        // The rollback must have restored the master row deleted inside
        // the transaction.
        assert!(store.get_node(master.id).unwrap().is_some());
        assert!(store.get_legacy(master.id).unwrap().is_none());
    }

    #[test]
    fn test_handover_promotes_earliest_turn() {
        let store = test_store();
        let me = bootstrap_master(&store);
        let candidate = store
            .insert_as_slave(&me, &fresh("P1", "192.168.1.20", 8081), 1)
            .unwrap();
        let other = store
            .insert_as_slave(&me, &fresh("P2", "192.168.1.21", 8082), 2)
            .unwrap();

        let promoted = store.handover(&me, &candidate).unwrap();
        assert_eq!(promoted.id, candidate.id);
        assert_eq!(promoted.level, me.level);
        assert_eq!(promoted.turn, me.turn);
        assert_eq!(promoted.superior_id, me.superior_id);

        assert!(store.get_node(me.id).unwrap().is_none());
        assert!(store.get_legacy(me.id).unwrap().is_some());

        let reparented = store.get_node(other.id).unwrap().unwrap();
        assert_eq!(reparented.superior_id, candidate.id);
        assert_eq!(reparented.level, promoted.level + 1);
    }

    #[test]
    fn test_handover_unknown_candidate() {
        let store = test_store();
        let me = bootstrap_master(&store);
        let mut ghost = NodeRecord::new("PX", "0.0.1", 9000, 2);
        ghost.id = 99;
        ghost.host = "192.168.1.30".to_string();
        let err = store.handover(&me, &ghost).unwrap_err();
        assert!(matches!(err, NodeError::SlaveNotSubordinate));
        assert!(store.get_node(me.id).unwrap().is_some());
    }

    #[test]
    fn test_log_event_touch_semantics() {
        let store = test_store();
        for _ in 0..3 {
            store
                .log_event(1, NodeEventType::ReportActive, 0)
                .unwrap();
        }
        let event = store
            .get_event(1, NodeEventType::ReportActive, 0)
            .unwrap()
            .unwrap();
        assert!(event.version >= 2);

        // A different target is a different row.
        store
            .log_event(1, NodeEventType::MasterReportedSlaveInactive, 7)
            .unwrap();
        let other = store
            .get_event(1, NodeEventType::MasterReportedSlaveInactive, 7)
            .unwrap()
            .unwrap();
        assert_eq!(other.version, 0);
        assert_eq!(other.target_node_id, 7);
    }
}
