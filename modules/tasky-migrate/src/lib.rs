//! Database bootstrap and migration engine for the Tasky API.
//!
//! Given an admin connection, an app connection and a directory of ordered
//! SQL patch files, a run waits for the server, creates the app database
//! and role if missing, applies pending patches exactly once (recorded in
//! the `migrations` ledger table) and re-grants the role's privileges.
//!
//! The service awaits [`run_migrations`] before it starts accepting traffic.

pub mod applier;
pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod error;
pub mod file_config;
pub mod grants;
pub mod ledger;
pub mod migrator;
pub mod scanner;
pub mod sql;
pub mod target;
pub mod telemetry;
pub mod types;
pub mod waiter;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::sync::Arc;

pub use config::{MigrateConfig, Settings};
pub use connection::{Connection, Connector, PgConnector};
pub use error::{ConfigError, MigrateError, MigrateResult};
pub use migrator::Migrator;
pub use target::ConnectionTarget;
pub use types::{
    LedgerRecord, MigrationRunReport, PatchFile, PatchOutcome, PatchResult, Stage, StatusReport,
};
pub use waiter::RetryPolicy;

/// Run the full pipeline against Postgres.
pub async fn run_migrations(config: MigrateConfig) -> MigrateResult<MigrationRunReport> {
    Migrator::new(config, Arc::new(PgConnector)).run().await
}
