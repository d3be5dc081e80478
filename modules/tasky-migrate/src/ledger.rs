//! The `migrations` ledger table: which patch files have been applied.
//!
//! Rows are only ever inserted. The primary key on `filename` is what makes
//! a second insert for the same patch fail.

use std::collections::BTreeSet;

use tracing::info;

use crate::connection::{Connection, DbResult};
use crate::error::{MigrateError, MigrateResult};
use crate::types::{LedgerRecord, Stage};

pub const LEDGER_TABLE: &str = "migrations";

pub(crate) const TABLE_EXISTS_SQL: &str = "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1)";

pub(crate) const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS public.migrations (
        filename TEXT PRIMARY KEY NOT NULL,
        created  TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now()
    )
"#;

pub(crate) const SELECT_FILENAMES_SQL: &str = "SELECT filename FROM public.migrations";

pub(crate) const SELECT_RECORDS_SQL: &str =
    "SELECT filename, created FROM public.migrations ORDER BY filename ASC";

pub(crate) const INSERT_SQL: &str = "INSERT INTO public.migrations (filename) VALUES ($1)";

pub async fn table_exists(conn: &dyn Connection) -> MigrateResult<bool> {
    check_table(conn).await.map_err(|source| MigrateError::Ledger {
        stage: Stage::EnsureLedgerTable,
        source,
    })
}

/// Create the ledger table if missing. Returns `true` when it was created.
pub async fn ensure_table(conn: &dyn Connection) -> MigrateResult<bool> {
    let fail = |source| MigrateError::Ledger {
        stage: Stage::EnsureLedgerTable,
        source,
    };

    info!(table = LEDGER_TABLE, "Checking migration table exists");
    if check_table(conn).await.map_err(fail)? {
        return Ok(false);
    }

    info!(table = LEDGER_TABLE, "Creating migration table");
    conn.execute(CREATE_TABLE_SQL, &[]).await.map_err(fail)?;
    Ok(true)
}

/// Filenames already recorded.
pub async fn load_applied(conn: &dyn Connection) -> MigrateResult<BTreeSet<String>> {
    let fail = |source| MigrateError::Ledger {
        stage: Stage::LoadLedger,
        source,
    };

    let rows = conn
        .query_many(SELECT_FILENAMES_SQL, &[])
        .await
        .map_err(fail)?;
    rows.iter()
        .map(|row| row.text(0))
        .collect::<DbResult<BTreeSet<_>>>()
        .map_err(fail)
}

/// Full ledger rows ordered by filename.
pub async fn load_records(conn: &dyn Connection) -> MigrateResult<Vec<LedgerRecord>> {
    let fail = |source| MigrateError::Ledger {
        stage: Stage::LoadLedger,
        source,
    };

    let rows = conn
        .query_many(SELECT_RECORDS_SQL, &[])
        .await
        .map_err(fail)?;
    rows.iter()
        .map(|row| -> DbResult<LedgerRecord> {
            Ok(LedgerRecord {
                filename: row.text(0)?,
                created: row.timestamp(1)?,
            })
        })
        .collect::<DbResult<Vec<_>>>()
        .map_err(fail)
}

/// Insert one ledger row. Errors are returned raw: the applier decides
/// what a failed insert means for the patch.
pub async fn record_applied(conn: &dyn Connection, filename: &str) -> DbResult<()> {
    conn.execute(INSERT_SQL, &[filename]).await?;
    Ok(())
}

async fn check_table(conn: &dyn Connection) -> DbResult<bool> {
    match conn.query_one(TABLE_EXISTS_SQL, &[LEDGER_TABLE]).await? {
        Some(row) => row.bool(0),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;

    #[tokio::test]
    async fn ensure_table_is_idempotent() {
        let server = FakeServer::new().with_database("tasky");
        let conn = server.open("tasky");

        assert!(!table_exists(&conn).await.unwrap());
        assert!(ensure_table(&conn).await.unwrap());
        assert!(!ensure_table(&conn).await.unwrap());
        assert!(table_exists(&conn).await.unwrap());
        assert_eq!(server.statements_starting_with("CREATE TABLE").len(), 1);
    }

    #[tokio::test]
    async fn records_round_trip_through_the_ledger() {
        let server = FakeServer::new().with_database("tasky");
        let conn = server.open("tasky");
        ensure_table(&conn).await.unwrap();

        record_applied(&conn, "0002_b.sql").await.unwrap();
        record_applied(&conn, "0001_a.sql").await.unwrap();

        let applied = load_applied(&conn).await.unwrap();
        assert_eq!(
            applied.into_iter().collect::<Vec<_>>(),
            vec!["0001_a.sql", "0002_b.sql"]
        );

        let records = load_records(&conn).await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["0001_a.sql", "0002_b.sql"]);
    }

    #[tokio::test]
    async fn duplicate_record_is_rejected() {
        let server = FakeServer::new().with_database("tasky");
        let conn = server.open("tasky");
        ensure_table(&conn).await.unwrap();

        record_applied(&conn, "0001_a.sql").await.unwrap();
        assert!(record_applied(&conn, "0001_a.sql").await.is_err());
        assert_eq!(server.ledger("tasky"), vec!["0001_a.sql"]);
    }

    #[tokio::test]
    async fn read_failure_is_a_ledger_error() {
        let server = FakeServer::new().with_database("tasky");
        let conn = server.open("tasky");
        ensure_table(&conn).await.unwrap();
        server.fail_statements_containing("SELECT filename");

        let err = load_applied(&conn).await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::Ledger {
                stage: Stage::LoadLedger,
                ..
            }
        ));
    }
}
