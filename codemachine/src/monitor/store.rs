//! SQLite-backed agent monitor.
//!
//! [`AgentMonitor`] persists agent records and telemetry in a SQLite
//! database, surviving process restarts for post-mortem inspection. Uses
//! [`rusqlite`] for synchronous access, bridged to async via
//! [`tokio::task::spawn_blocking`].
//!
//! # Storage Model
//!
//! Two tables, `agents` and `telemetry`, written under one transaction per
//! update. WAL journal mode keeps concurrent readers cheap; busy/locked
//! contention is absorbed by the retry wrapper in [`super::retry`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{Error, Result, StoreError, ValidationError};

use super::record::{
    AgentQuery, AgentRecord, AgentStatus, AgentTelemetry, NewAgent, truncate_prompt,
};
use super::retry::{RetryPolicy, with_retry};

/// Durable agent lifecycle store.
///
/// Cloneable via `Arc<Mutex<Connection>>`; every handle shares one
/// database. Schema is auto-created on construction and all blocking I/O
/// is offloaded to the tokio blocking thread pool.
#[derive(Debug, Clone)]
pub struct AgentMonitor {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl AgentMonitor {
    /// Opens (or creates) the database at `path` and initialises the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Opens an ephemeral in-memory store (data lost on drop).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Wraps an existing [`Connection`], applying pragmas and schema setup.
    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                name             TEXT    NOT NULL,
                engine           TEXT    NOT NULL,
                model            TEXT,
                status           TEXT    NOT NULL,
                parent_id        INTEGER REFERENCES agents(id),
                prompt_truncated TEXT    NOT NULL,
                start_time       TEXT    NOT NULL,
                end_time         TEXT,
                error            TEXT
            );

            CREATE TABLE IF NOT EXISTS telemetry (
                agent_id   INTEGER PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
                tokens_in  INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                cached     INTEGER,
                cost       REAL,
                duration   INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_agents_status ON agents (status);
            CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents (parent_id);",
        )
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        })
    }

    /// Bridges a synchronous closure onto the blocking thread pool, inside
    /// the busy-retry loop. The closure must be pure over its captures: it
    /// may run more than once.
    async fn run_op<T, F>(&self, op_name: &'static str, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> std::result::Result<T, StoreError> + Send + Sync + Clone + 'static,
        T: Send + 'static,
    {
        with_retry(&self.retry, op_name, || {
            let conn = Arc::clone(&self.conn);
            let f = f.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let guard = conn
                        .lock()
                        .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
                    f(&guard)
                })
                .await
                .map_err(|e| Error::from(StoreError::ConnectionFailed(e.to_string())))?
                .map_err(Error::from)
            }
        })
        .await
    }

    /// Registers a new agent and returns its monotonically assigned id.
    ///
    /// The record starts in [`AgentStatus::Pending`].
    pub async fn register(&self, new: NewAgent) -> Result<i64> {
        let prompt = truncate_prompt(&new.prompt);
        let start = Utc::now().to_rfc3339();
        let id = self
            .run_op("register", move |conn| {
                conn.execute(
                    "INSERT INTO agents (name, engine, model, status, parent_id, prompt_truncated, start_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        new.name,
                        new.engine,
                        new.model,
                        AgentStatus::Pending.as_str(),
                        new.parent_id,
                        prompt,
                        start,
                    ],
                )
                .map_err(map_sqlite)?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!(agent = id, "registered agent");
        Ok(id)
    }

    /// Moves the record to `status`, enforcing the transition graph.
    ///
    /// Terminal statuses also stamp `end_time`. An off-graph transition is
    /// a validation error; the record is left untouched.
    pub async fn set_status(&self, id: i64, status: AgentStatus) -> Result<()> {
        self.update_record(id, status, None, None).await
    }

    /// Marks the record completed, folding in final telemetry.
    pub async fn mark_completed(&self, id: i64, telemetry: Option<AgentTelemetry>) -> Result<()> {
        self.update_record(id, AgentStatus::Completed, None, telemetry)
            .await
    }

    /// Marks the record failed with `error`.
    pub async fn mark_failed(&self, id: i64, error: impl Into<String>) -> Result<()> {
        self.update_record(id, AgentStatus::Failed, Some(error.into()), None)
            .await
    }

    async fn update_record(
        &self,
        id: i64,
        status: AgentStatus,
        error: Option<String>,
        telemetry: Option<AgentTelemetry>,
    ) -> Result<()> {
        // The closure reports off-graph transitions through its success
        // payload: they are caller bugs, not store contention, and must
        // not burn the retry budget.
        let outcome: std::result::Result<(), AgentStatus> = self
            .run_op("update_record", move |conn| {
                let tx = conn.unchecked_transaction().map_err(map_sqlite)?;

                let current: String = tx
                    .query_row("SELECT status FROM agents WHERE id = ?1", params![id], |r| {
                        r.get(0)
                    })
                    .optional()
                    .map_err(map_sqlite)?
                    .ok_or(StoreError::RecordNotFound(id))?;
                let current: AgentStatus = current
                    .parse()
                    .map_err(StoreError::TransactionFailed)?;
                if !current.can_transition_to(status) {
                    return Ok(Err(current));
                }

                let end_time = status.is_terminal().then(|| Utc::now().to_rfc3339());
                tx.execute(
                    "UPDATE agents SET status = ?2, end_time = COALESCE(?3, end_time), error = COALESCE(?4, error)
                     WHERE id = ?1",
                    params![id, status.as_str(), end_time, error.clone()],
                )
                .map_err(map_sqlite)?;

                if let Some(update) = telemetry {
                    upsert_telemetry(&tx, id, update)?;
                }

                tx.commit().map_err(map_sqlite)?;
                Ok(Ok(()))
            })
            .await?;

        outcome.map_err(|current| {
            ValidationError::InvalidField {
                field: "status".to_string(),
                message: format!("agent {id}: transition {current} -> {status} is off-graph"),
            }
            .into()
        })
    }

    /// Folds a telemetry update into the record, recomputing duration from
    /// the record's start time.
    pub async fn record_telemetry(&self, id: i64, update: AgentTelemetry) -> Result<()> {
        self.run_op("record_telemetry", move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_sqlite)?;

            let start: String = tx
                .query_row(
                    "SELECT start_time FROM agents WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_sqlite)?
                .ok_or(StoreError::RecordNotFound(id))?;

            let mut update = update;
            if update.duration_ms.is_none() {
                if let Ok(start) = DateTime::parse_from_rfc3339(&start) {
                    let elapsed = Utc::now().signed_duration_since(start.with_timezone(&Utc));
                    update.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
                }
            }

            upsert_telemetry(&tx, id, update)?;
            tx.commit().map_err(map_sqlite)?;
            Ok(())
        })
        .await
    }

    /// Fetches one record.
    pub async fn get_agent(&self, id: i64) -> Result<AgentRecord> {
        self.run_op("get_agent", move |conn| {
            conn.query_row(
                &format!("{SELECT_RECORD} WHERE a.id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()
            .map_err(map_sqlite)?
            .ok_or(StoreError::RecordNotFound(id))
        })
        .await
    }

    /// Fetches records matching `query`, ordered by id.
    pub async fn query_agents(&self, query: AgentQuery) -> Result<Vec<AgentRecord>> {
        self.run_op("query_agents", move |conn| {
            let mut sql = format!("{SELECT_RECORD} WHERE 1=1");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(status) = query.status {
                sql.push_str(" AND a.status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            if let Some(name) = &query.name {
                sql.push_str(" AND a.name = ?");
                args.push(Box::new(name.clone()));
            }
            if let Some(parent) = query.parent_id {
                sql.push_str(" AND a.parent_id = ?");
                args.push(Box::new(parent));
            }
            sql.push_str(" ORDER BY a.id");

            let mut stmt = conn.prepare(&sql).map_err(map_sqlite)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(args.iter().map(AsRef::as_ref)),
                    row_to_record,
                )
                .map_err(map_sqlite)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite)?;
            Ok(rows)
        })
        .await
    }

    /// Fetches the children of `parent_id`, ordered by id.
    pub async fn get_children(&self, parent_id: i64) -> Result<Vec<AgentRecord>> {
        self.query_agents(AgentQuery {
            parent_id: Some(parent_id),
            ..AgentQuery::default()
        })
        .await
    }
}

const SELECT_RECORD: &str = "SELECT a.id, a.name, a.engine, a.model, a.status, a.parent_id,
        a.prompt_truncated, a.start_time, a.end_time, a.error,
        t.tokens_in, t.tokens_out, t.cached, t.cost, t.duration
 FROM agents a LEFT JOIN telemetry t ON t.agent_id = a.id";

fn upsert_telemetry(
    tx: &rusqlite::Transaction<'_>,
    id: i64,
    update: AgentTelemetry,
) -> std::result::Result<(), StoreError> {
    let existing: Option<AgentTelemetry> = tx
        .query_row(
            "SELECT tokens_in, tokens_out, cached, cost, duration FROM telemetry WHERE agent_id = ?1",
            params![id],
            |r| {
                Ok(AgentTelemetry {
                    tokens_in: r.get::<_, i64>(0)? as u64,
                    tokens_out: r.get::<_, i64>(1)? as u64,
                    cached: r.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                    cost: r.get(3)?,
                    duration_ms: r.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                })
            },
        )
        .optional()
        .map_err(map_sqlite)?;

    let mut merged = existing.unwrap_or_default();
    merged.merge(&update);

    tx.execute(
        "INSERT INTO telemetry (agent_id, tokens_in, tokens_out, cached, cost, duration)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(agent_id) DO UPDATE SET
             tokens_in = excluded.tokens_in,
             tokens_out = excluded.tokens_out,
             cached = excluded.cached,
             cost = excluded.cost,
             duration = excluded.duration",
        params![
            id,
            merged.tokens_in as i64,
            merged.tokens_out as i64,
            merged.cached.map(|v| v as i64),
            merged.cost,
            merged.duration_ms.map(|v| v as i64),
        ],
    )
    .map_err(map_sqlite)?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let status: String = row.get(4)?;
    let start: String = row.get(7)?;
    let end: Option<String> = row.get(8)?;

    let tokens_in: Option<i64> = row.get(10)?;
    let telemetry = tokens_in.map(|tin| {
        Ok::<_, rusqlite::Error>(AgentTelemetry {
            tokens_in: tin as u64,
            tokens_out: row.get::<_, i64>(11)? as u64,
            cached: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
            cost: row.get(13)?,
            duration_ms: row.get::<_, Option<i64>>(14)?.map(|v| v as u64),
        })
    });
    let telemetry = match telemetry {
        Some(t) => Some(t?),
        None => None,
    };

    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        engine: row.get(2)?,
        model: row.get(3)?,
        status: status.parse().unwrap_or(AgentStatus::Failed),
        parent_id: row.get(5)?,
        prompt: row.get(6)?,
        start_time: parse_instant(&start),
        end_time: end.as_deref().map(parse_instant),
        telemetry,
        error: row.get(9)?,
    })
}

fn parse_instant(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn map_sqlite(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            rusqlite::ErrorCode::DatabaseBusy => StoreError::Busy(e.to_string()),
            rusqlite::ErrorCode::DatabaseLocked => StoreError::Locked(e.to_string()),
            _ => StoreError::TransactionFailed(e.to_string()),
        },
        _ => StoreError::TransactionFailed(e.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn new_store() -> AgentMonitor {
        AgentMonitor::in_memory().unwrap()
    }

    async fn register_one(store: &AgentMonitor, name: &str) -> i64 {
        store
            .register(
                NewAgent::new(name, "mock").with_prompt(format!("prompt for {name}")),
            )
            .await
            .unwrap()
    }

    mod registration {
        use super::*;

        #[tokio::test]
        async fn ids_are_monotonic() {
            let store = new_store();
            let a = register_one(&store, "planner").await;
            let b = register_one(&store, "builder").await;
            let c = register_one(&store, "tester").await;
            assert!(a < b && b < c);
        }

        #[tokio::test]
        async fn new_records_are_pending() {
            let store = new_store();
            let id = register_one(&store, "planner").await;
            let record = store.get_agent(id).await.unwrap();
            assert_eq!(record.status, AgentStatus::Pending);
            assert_eq!(record.name, "planner");
            assert!(record.end_time.is_none());
        }

        #[tokio::test]
        async fn prompt_is_truncated() {
            let store = new_store();
            let long = "p".repeat(2_000);
            let id = store
                .register(NewAgent::new("x", "mock").with_prompt(long))
                .await
                .unwrap();
            let record = store.get_agent(id).await.unwrap();
            assert_eq!(record.prompt.chars().count(), crate::monitor::PROMPT_LIMIT);
        }

        #[tokio::test]
        async fn parent_links_resolve() {
            let store = new_store();
            let parent = register_one(&store, "coordinator").await;
            let child = store
                .register(NewAgent::new("worker", "mock").with_parent(parent))
                .await
                .unwrap();

            let children = store.get_children(parent).await.unwrap();
            assert_eq!(children.len(), 1);
            assert_eq!(children[0].id, child);
        }
    }

    mod status {
        use super::*;

        #[tokio::test]
        async fn full_lifecycle() {
            let store = new_store();
            let id = register_one(&store, "builder").await;

            store.set_status(id, AgentStatus::Running).await.unwrap();
            store
                .mark_completed(
                    id,
                    Some(AgentTelemetry {
                        tokens_in: 100,
                        tokens_out: 40,
                        ..AgentTelemetry::default()
                    }),
                )
                .await
                .unwrap();

            let record = store.get_agent(id).await.unwrap();
            assert_eq!(record.status, AgentStatus::Completed);
            assert!(record.end_time.is_some());
            assert!(record.end_time.unwrap() >= record.start_time);
            assert_eq!(record.telemetry.unwrap().tokens_in, 100);
        }

        #[tokio::test]
        async fn terminal_records_reject_further_transitions() {
            let store = new_store();
            let id = register_one(&store, "builder").await;
            store.set_status(id, AgentStatus::Running).await.unwrap();
            store.set_status(id, AgentStatus::Skipped).await.unwrap();

            let err = store.set_status(id, AgentStatus::Running).await.unwrap_err();
            assert_eq!(err.code(), "validation.invalid_field");

            let record = store.get_agent(id).await.unwrap();
            assert_eq!(record.status, AgentStatus::Skipped);
        }

        #[tokio::test]
        async fn off_graph_transition_is_rejected() {
            let store = new_store();
            let id = register_one(&store, "builder").await;
            // pending → completed is not on the graph
            let err = store
                .set_status(id, AgentStatus::Completed)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "validation.invalid_field");
        }

        #[tokio::test]
        async fn failure_records_error_text() {
            let store = new_store();
            let id = register_one(&store, "builder").await;
            store.set_status(id, AgentStatus::Running).await.unwrap();
            store.mark_failed(id, "engine exploded").await.unwrap();

            let record = store.get_agent(id).await.unwrap();
            assert_eq!(record.status, AgentStatus::Failed);
            assert_eq!(record.error.as_deref(), Some("engine exploded"));
        }

        #[tokio::test]
        async fn missing_record_is_not_found() {
            let store = new_store();
            let err = store.set_status(999, AgentStatus::Running).await.unwrap_err();
            assert_eq!(err.code(), "store.record_not_found");
        }
    }

    mod telemetry {
        use super::*;

        #[tokio::test]
        async fn updates_are_monotone_across_writes() {
            let store = new_store();
            let id = register_one(&store, "builder").await;

            store
                .record_telemetry(
                    id,
                    AgentTelemetry {
                        tokens_in: 100,
                        tokens_out: 20,
                        ..AgentTelemetry::default()
                    },
                )
                .await
                .unwrap();
            store
                .record_telemetry(
                    id,
                    AgentTelemetry {
                        tokens_in: 60, // lower — must not regress
                        tokens_out: 90,
                        cost: Some(0.12),
                        ..AgentTelemetry::default()
                    },
                )
                .await
                .unwrap();

            let t = store.get_agent(id).await.unwrap().telemetry.unwrap();
            assert_eq!(t.tokens_in, 100);
            assert_eq!(t.tokens_out, 90);
            assert_eq!(t.cost, Some(0.12));
        }

        #[tokio::test]
        async fn duration_is_recomputed_from_start_time() {
            let store = new_store();
            let id = register_one(&store, "builder").await;
            store
                .record_telemetry(id, AgentTelemetry::default())
                .await
                .unwrap();
            let t = store.get_agent(id).await.unwrap().telemetry.unwrap();
            assert!(t.duration_ms.is_some());
        }
    }

    mod queries {
        use super::*;

        #[tokio::test]
        async fn filter_by_status_and_name() {
            let store = new_store();
            let a = register_one(&store, "planner").await;
            let b = register_one(&store, "builder").await;
            let _c = register_one(&store, "builder").await;
            store.set_status(a, AgentStatus::Running).await.unwrap();
            store.set_status(b, AgentStatus::Running).await.unwrap();

            let running = store
                .query_agents(AgentQuery {
                    status: Some(AgentStatus::Running),
                    ..AgentQuery::default()
                })
                .await
                .unwrap();
            assert_eq!(running.len(), 2);

            let builders = store
                .query_agents(AgentQuery {
                    name: Some("builder".into()),
                    ..AgentQuery::default()
                })
                .await
                .unwrap();
            assert_eq!(builders.len(), 2);

            let running_builders = store
                .query_agents(AgentQuery {
                    status: Some(AgentStatus::Running),
                    name: Some("builder".into()),
                    ..AgentQuery::default()
                })
                .await
                .unwrap();
            assert_eq!(running_builders.len(), 1);
            assert_eq!(running_builders[0].id, b);
        }
    }

    mod durability {
        use super::*;

        #[tokio::test]
        async fn records_survive_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let db = dir.path().join("registry.db");

            let id = {
                let store = AgentMonitor::open(&db).unwrap();
                let id = register_one(&store, "survivor").await;
                store.set_status(id, AgentStatus::Running).await.unwrap();
                store.mark_completed(id, None).await.unwrap();
                id
            };

            let reopened = AgentMonitor::open(&db).unwrap();
            let record = reopened.get_agent(id).await.unwrap();
            assert_eq!(record.name, "survivor");
            assert_eq!(record.status, AgentStatus::Completed);
        }
    }
}
