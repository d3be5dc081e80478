//! Create the app database and role when they do not exist yet.

use tracing::info;

use crate::connection::Connection;
use crate::error::{MigrateError, MigrateResult};
use crate::sql::{quote_ident, quote_literal};
use crate::types::Stage;

pub(crate) const DATABASE_EXISTS_SQL: &str =
    "SELECT EXISTS (SELECT FROM pg_database WHERE datname = $1)";

pub(crate) const ROLE_EXISTS_SQL: &str = "SELECT EXISTS (SELECT FROM pg_roles WHERE rolname = $1)";

/// Create `database` through the admin connection if it is missing.
/// Returns `true` when it was created.
pub async fn ensure_database(admin: &dyn Connection, database: &str) -> MigrateResult<bool> {
    let fail = |source| MigrateError::Bootstrap {
        stage: Stage::EnsureDatabase,
        identifier: database.to_string(),
        source,
    };

    info!(database, "Checking database exists");
    if exists(admin, DATABASE_EXISTS_SQL, database).await.map_err(fail)? {
        return Ok(false);
    }

    info!(database, "Creating database");
    admin
        .execute(&create_database_sql(database), &[])
        .await
        .map_err(fail)?;
    Ok(true)
}

/// Create the login role `user` through the target connection if it is
/// missing. Returns `true` when it was created.
pub async fn ensure_role(target: &dyn Connection, user: &str, password: &str) -> MigrateResult<bool> {
    let fail = |source| MigrateError::Bootstrap {
        stage: Stage::EnsureRole,
        identifier: user.to_string(),
        source,
    };

    info!(role = user, "Checking role exists");
    if exists(target, ROLE_EXISTS_SQL, user).await.map_err(fail)? {
        return Ok(false);
    }

    info!(role = user, "Creating role");
    target
        .execute(&create_role_sql(user, password), &[])
        .await
        .map_err(fail)?;
    Ok(true)
}

async fn exists(conn: &dyn Connection, sql: &str, name: &str) -> Result<bool, sqlx::Error> {
    match conn.query_one(sql, &[name]).await? {
        Some(row) => row.bool(0),
        None => Ok(false),
    }
}

pub(crate) fn create_database_sql(database: &str) -> String {
    format!("CREATE DATABASE {}", quote_ident(database))
}

pub(crate) fn create_role_sql(user: &str, password: &str) -> String {
    format!(
        "CREATE USER {} WITH NOCREATEDB ENCRYPTED PASSWORD {}",
        quote_ident(user),
        quote_literal(password)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;

    #[test]
    fn ddl_quotes_names_and_password() {
        assert_eq!(create_database_sql("tasky"), "CREATE DATABASE \"tasky\"");
        assert_eq!(
            create_role_sql("app\"user", "it's"),
            "CREATE USER \"app\"\"user\" WITH NOCREATEDB ENCRYPTED PASSWORD 'it''s'"
        );
    }

    #[tokio::test]
    async fn creates_missing_database_once() {
        let server = FakeServer::new();
        let admin = server.open("postgres");

        assert!(ensure_database(&admin, "tasky").await.unwrap());
        assert!(!ensure_database(&admin, "tasky").await.unwrap());

        assert!(server.has_database("tasky"));
        assert_eq!(server.statements_starting_with("CREATE DATABASE").len(), 1);
    }

    #[tokio::test]
    async fn existing_role_is_left_alone() {
        let server = FakeServer::new().with_role("tasky");
        let conn = server.open("tasky");

        assert!(!ensure_role(&conn, "tasky", "pw").await.unwrap());
        assert!(server.statements_starting_with("CREATE USER").is_empty());
    }

    #[tokio::test]
    async fn creates_missing_role() {
        let server = FakeServer::new();
        let conn = server.open("tasky");

        assert!(ensure_role(&conn, "tasky", "pw").await.unwrap());
        assert!(server.has_role("tasky"));
    }

    #[tokio::test]
    async fn catalog_failure_is_a_bootstrap_error() {
        let server = FakeServer::new();
        server.fail_statements_containing("pg_database");
        let admin = server.open("postgres");

        let err = ensure_database(&admin, "tasky").await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::Bootstrap { stage: Stage::EnsureDatabase, ref identifier, .. } if identifier == "tasky"
        ));
        assert!(!server.has_database("tasky"));
    }
}
