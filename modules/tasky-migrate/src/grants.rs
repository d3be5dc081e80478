//! Re-assert the app role's privileges. Runs on every migration run so
//! privilege drift heals itself; `GRANT` of an existing privilege is a no-op.

use tracing::info;

use crate::connection::Connection;
use crate::error::{MigrateError, MigrateResult};
use crate::sql::quote_ident;

/// The grant statements, in execution order.
pub fn grant_statements(database: &str, role: &str) -> Vec<String> {
    let database = quote_ident(database);
    let role = quote_ident(role);
    vec![
        format!("GRANT CONNECT, TEMP ON DATABASE {database} TO {role}"),
        format!("GRANT USAGE ON SCHEMA public TO {role}"),
        format!(
            "GRANT SELECT, INSERT, UPDATE, DELETE, REFERENCES, TRIGGER ON ALL TABLES IN SCHEMA public TO {role}"
        ),
        format!("GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA public TO {role}"),
        format!("GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA public TO {role}"),
    ]
}

/// Issue every grant; stop at the first failure.
pub async fn grant_privileges(conn: &dyn Connection, database: &str, role: &str) -> MigrateResult<()> {
    info!(database, role, "Granting privileges");

    for statement in grant_statements(database, role) {
        if let Err(source) = conn.execute(&statement, &[]).await {
            return Err(MigrateError::Grant { statement, source });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;

    #[test]
    fn statements_are_fixed_and_quoted() {
        let statements = grant_statements("tasky", "tasky_app");
        assert_eq!(statements.len(), 5);
        assert_eq!(
            statements[0],
            "GRANT CONNECT, TEMP ON DATABASE \"tasky\" TO \"tasky_app\""
        );
        assert_eq!(
            statements[4],
            "GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA public TO \"tasky_app\""
        );
    }

    #[tokio::test]
    async fn issues_all_grants_in_order() {
        let server = FakeServer::new().with_database("tasky");
        let conn = server.open("tasky");

        grant_privileges(&conn, "tasky", "tasky_app").await.unwrap();

        assert_eq!(
            server.statements_starting_with("GRANT"),
            grant_statements("tasky", "tasky_app")
        );
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let server = FakeServer::new().with_database("tasky");
        server.fail_statements_containing("ON ALL SEQUENCES");
        let conn = server.open("tasky");

        let err = grant_privileges(&conn, "tasky", "tasky_app")
            .await
            .unwrap_err();

        assert!(
            matches!(err, MigrateError::Grant { ref statement, .. } if statement.contains("SEQUENCES"))
        );
        assert_eq!(server.statements_starting_with("GRANT").len(), 3);
    }
}
