// In-memory stand-in for a Postgres server.
//
// Understands exactly the statements the pipeline issues (catalog checks,
// CREATE DATABASE / USER, the ledger table, GRANTs, ROLLBACK) and treats
// everything else as an opaque patch script. Every successful `execute` is
// recorded so tests can assert on what ran, in which database, in which order.
//
// Failure injection: connects, probes, and any statement containing a
// marker string.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::applier::ROLLBACK_SQL;
use crate::bootstrap::{DATABASE_EXISTS_SQL, ROLE_EXISTS_SQL};
use crate::connection::{Connection, Connector, DbResult, Row, Value};
use crate::ledger::{
    CREATE_TABLE_SQL, INSERT_SQL, LEDGER_TABLE, SELECT_FILENAMES_SQL, SELECT_RECORDS_SQL,
    TABLE_EXISTS_SQL,
};
use crate::target::ConnectionTarget;

// ---------------------------------------------------------------------------
// FakeServer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bootstrap,
    Ledger,
    Grant,
    Rollback,
    Script,
}

struct Executed {
    database: String,
    sql: String,
    kind: Kind,
}

struct State {
    databases: BTreeSet<String>,
    roles: BTreeSet<String>,
    /// database → ledger rows. A key exists once the ledger table exists.
    ledgers: BTreeMap<String, BTreeMap<String, DateTime<Utc>>>,
    executed: Vec<Executed>,
    failing: Vec<String>,
    connect_failures: u32,
    probe_failures: u32,
    connect_attempts: u32,
    open: usize,
    connection_log: Vec<String>,
}

/// Shared handle; clones see the same server.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    /// A server with only the `postgres` database and role.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                databases: BTreeSet::from(["postgres".to_string()]),
                roles: BTreeSet::from(["postgres".to_string()]),
                ledgers: BTreeMap::new(),
                executed: Vec::new(),
                failing: Vec::new(),
                connect_failures: 0,
                probe_failures: 0,
                connect_attempts: 0,
                open: 0,
                connection_log: Vec::new(),
            })),
        }
    }

    pub fn with_database(self, name: &str) -> Self {
        self.state.lock().unwrap().databases.insert(name.to_string());
        self
    }

    pub fn with_role(self, name: &str) -> Self {
        self.state.lock().unwrap().roles.insert(name.to_string());
        self
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    /// Open a connection directly, bypassing connect failure injection.
    pub fn open(&self, database: &str) -> FakeConnection {
        let mut state = self.state.lock().unwrap();
        state.open += 1;
        state.connection_log.push(format!("open {database}"));
        FakeConnection {
            server: self.clone(),
            database: database.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    // --- failure injection ---

    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().unwrap().connect_failures = n;
    }

    pub fn fail_next_probes(&self, n: u32) {
        self.state.lock().unwrap().probe_failures = n;
    }

    /// Any statement or query containing `marker` fails.
    pub fn fail_statements_containing(&self, marker: &str) {
        self.state.lock().unwrap().failing.push(marker.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing.clear();
        state.connect_failures = 0;
        state.probe_failures = 0;
    }

    pub fn clear_statements(&self) {
        let mut state = self.state.lock().unwrap();
        state.executed.clear();
        state.connection_log.clear();
    }

    // --- inspection ---

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains(name)
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.state.lock().unwrap().roles.contains(name)
    }

    /// Ledger filenames for `database`, sorted. Empty if there is no table.
    pub fn ledger(&self, database: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .ledgers
            .get(database)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every successfully executed statement, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .map(|e| e.sql.clone())
            .collect()
    }

    pub fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.trim_start().starts_with(prefix))
            .collect()
    }

    /// Patch scripts executed against `database`, in order.
    pub fn scripts(&self, database: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|e| e.kind == Kind::Script && e.database == database)
            .map(|e| e.sql.clone())
            .collect()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().unwrap().open
    }

    /// `open <db>` / `close <db>` entries in order.
    pub fn connection_log(&self) -> Vec<String> {
        self.state.lock().unwrap().connection_log.clone()
    }
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// FakeConnector
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &ConnectionTarget) -> DbResult<Box<dyn Connection>> {
        let database = if target.database.is_empty() {
            target.user.clone()
        } else {
            target.database.clone()
        };

        {
            let mut state = self.server.state.lock().unwrap();
            state.connect_attempts += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(simulated("connection refused"));
            }
            if !state.databases.contains(&database) {
                return Err(simulated(&format!("database \"{database}\" does not exist")));
            }
        }

        Ok(Box::new(self.server.open(&database)))
    }
}

// ---------------------------------------------------------------------------
// FakeConnection
// ---------------------------------------------------------------------------

pub struct FakeConnection {
    server: FakeServer,
    database: String,
    closed: AtomicBool,
}

impl FakeConnection {
    fn state(&self) -> DbResult<std::sync::MutexGuard<'_, State>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolClosed);
        }
        Ok(self.server.state.lock().unwrap())
    }

    fn check_failing(state: &State, sql: &str) -> DbResult<()> {
        match state.failing.iter().find(|m| sql.contains(m.as_str())) {
            Some(marker) => Err(simulated(&format!("injected failure ({marker})"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn probe(&self) -> DbResult<()> {
        let mut state = self.state()?;
        if state.probe_failures > 0 {
            state.probe_failures -= 1;
            return Err(simulated("the database system is starting up"));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[&str]) -> DbResult<u64> {
        let mut state = self.state()?;
        Self::check_failing(&state, sql)?;

        let kind = if let Some(rest) = sql.strip_prefix("CREATE DATABASE ") {
            let name = unquote(rest).ok_or_else(|| simulated("bad identifier"))?;
            if !state.databases.insert(name.clone()) {
                return Err(simulated(&format!("database \"{name}\" already exists")));
            }
            Kind::Bootstrap
        } else if let Some(rest) = sql.strip_prefix("CREATE USER ") {
            let name = unquote(rest).ok_or_else(|| simulated("bad identifier"))?;
            if !state.roles.insert(name.clone()) {
                return Err(simulated(&format!("role \"{name}\" already exists")));
            }
            Kind::Bootstrap
        } else if sql == CREATE_TABLE_SQL {
            state.ledgers.entry(self.database.clone()).or_default();
            Kind::Ledger
        } else if sql == INSERT_SQL {
            let filename = params.first().ok_or_else(|| simulated("missing param"))?;
            let rows = state
                .ledgers
                .get_mut(&self.database)
                .ok_or_else(|| simulated("relation \"public.migrations\" does not exist"))?;
            if rows.contains_key(*filename) {
                return Err(simulated(
                    "duplicate key value violates unique constraint \"migrations_pkey\"",
                ));
            }
            rows.insert(filename.to_string(), Utc::now());
            Kind::Ledger
        } else if sql.starts_with("GRANT ") {
            Kind::Grant
        } else if sql == ROLLBACK_SQL {
            Kind::Rollback
        } else {
            Kind::Script
        };

        let database = self.database.clone();
        state.executed.push(Executed {
            database,
            sql: sql.to_string(),
            kind,
        });
        Ok(1)
    }

    async fn query_one(&self, sql: &str, params: &[&str]) -> DbResult<Option<Row>> {
        let state = self.state()?;
        Self::check_failing(&state, sql)?;
        let param = params.first().copied().unwrap_or_default();

        let exists = if sql == DATABASE_EXISTS_SQL {
            state.databases.contains(param)
        } else if sql == ROLE_EXISTS_SQL {
            state.roles.contains(param)
        } else if sql == TABLE_EXISTS_SQL {
            param == LEDGER_TABLE && state.ledgers.contains_key(&self.database)
        } else {
            return Err(simulated(&format!("unsupported query: {sql}")));
        };
        Ok(Some(Row(vec![Value::Bool(exists)])))
    }

    async fn query_many(&self, sql: &str, _params: &[&str]) -> DbResult<Vec<Row>> {
        let state = self.state()?;
        Self::check_failing(&state, sql)?;

        let rows = state
            .ledgers
            .get(&self.database)
            .ok_or_else(|| simulated("relation \"public.migrations\" does not exist"))?;

        if sql == SELECT_FILENAMES_SQL {
            Ok(rows
                .keys()
                .map(|f| Row(vec![Value::Text(f.clone())]))
                .collect())
        } else if sql == SELECT_RECORDS_SQL {
            Ok(rows
                .iter()
                .map(|(f, ts)| Row(vec![Value::Text(f.clone()), Value::Timestamp(*ts)]))
                .collect())
        } else {
            Err(simulated(&format!("unsupported query: {sql}")))
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.server.state.lock().unwrap();
        state.open -= 1;
        state.connection_log.push(format!("close {}", self.database));
    }
}

fn simulated(msg: &str) -> sqlx::Error {
    sqlx::Error::Protocol(msg.to_string())
}

/// Read a leading double-quoted identifier, undoing `""` escapes.
fn unquote(s: &str) -> Option<String> {
    let mut chars = s.strip_prefix('"')?.chars().peekable();
    let mut out = String::new();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unquote_handles_escaped_quotes() {
        assert_eq!(unquote("\"tasky\""), Some("tasky".into()));
        assert_eq!(
            unquote("\"a\"\"b\" WITH NOCREATEDB"),
            Some("a\"b".into())
        );
        assert_eq!(unquote("tasky"), None);
        assert_eq!(unquote("\"open"), None);
    }

    #[tokio::test]
    async fn closed_connection_rejects_work_and_closes_once() {
        let server = FakeServer::new();
        let conn = server.open("postgres");

        conn.close().await;
        conn.close().await;

        assert!(conn.probe().await.is_err());
        assert_eq!(server.open_connections(), 0);
        assert_eq!(server.connection_log(), vec!["open postgres", "close postgres"]);
    }
}
