//! Sequences the bootstrap and migration stages.
//!
//! Validate config → wait for admin → ensure database → close admin →
//! wait for target → ensure role → ensure ledger → scan → apply → grant →
//! close target. Strictly sequential: each stage depends on the one before.
//!
//! Each connection is closed on every exit path, including errors. The admin
//! connection is closed before the target connection is opened.
//!
//! Concurrent runs against the same database are not coordinated. Callers
//! run one migrator at a time.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::applier::apply_pending;
use crate::bootstrap::{ensure_database, ensure_role};
use crate::config::MigrateConfig;
use crate::connection::{Connection, Connector};
use crate::error::{MigrateError, MigrateResult};
use crate::grants::grant_privileges;
use crate::ledger;
use crate::scanner::scan_patches;
use crate::types::{MigrationRunReport, Stage, StatusReport};
use crate::waiter::wait_for_connection;

pub struct Migrator {
    config: MigrateConfig,
    connector: Arc<dyn Connector>,
}

impl Migrator {
    pub fn new(config: MigrateConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    /// Run the whole pipeline. `Ok` means completed (individual patches may
    /// still have failed, see the report); `Err` means aborted.
    pub async fn run(&self) -> MigrateResult<MigrationRunReport> {
        info!("Starting DB migrations");
        let result = self.run_stages().await;

        match &result {
            Ok(report) => {
                if report.has_failures() {
                    warn!(
                        failed = ?report.failed(),
                        "DB migrations completed with failed patches; they will be retried next run"
                    );
                }
                info!(summary = %report, "DB migrations completed");
            }
            Err(e) => error!(error = %e, "Error running migrations"),
        }
        result
    }

    /// Compare the ledger with the patch directory without changing anything.
    pub async fn status(&self) -> MigrateResult<StatusReport> {
        self.stage(Stage::ValidateConfig, async {
            self.config.validate().map_err(MigrateError::from)
        })
        .await?;

        let conn = self
            .stage(
                Stage::WaitTargetConnection,
                wait_for_connection(self.connector.as_ref(), &self.config.target(), &self.config.retry),
            )
            .await?;
        let result = self.read_status(conn.as_ref()).await;
        conn.close().await;
        result
    }

    async fn run_stages(&self) -> MigrateResult<MigrationRunReport> {
        self.stage(Stage::ValidateConfig, async {
            self.config.validate().map_err(MigrateError::from)
        })
        .await?;

        let database = self.config.app.database.as_str();

        let admin = self
            .stage(
                Stage::WaitAdminConnection,
                wait_for_connection(self.connector.as_ref(), &self.config.admin, &self.config.retry),
            )
            .await?;
        let created = self
            .stage(Stage::EnsureDatabase, ensure_database(admin.as_ref(), database))
            .await;
        admin.close().await;
        if created? {
            info!(database, "Database created");
        }

        let target = self
            .stage(
                Stage::WaitTargetConnection,
                wait_for_connection(self.connector.as_ref(), &self.config.target(), &self.config.retry),
            )
            .await?;
        let result = self.migrate_target(target.as_ref()).await;
        target.close().await;
        result
    }

    async fn migrate_target(&self, conn: &dyn Connection) -> MigrateResult<MigrationRunReport> {
        let app = &self.config.app;

        if app.password.is_empty() {
            warn!(role = %app.user, "No password configured for app role; skipping role provisioning");
        } else if self
            .stage(Stage::EnsureRole, ensure_role(conn, &app.user, &app.password))
            .await?
        {
            info!(role = %app.user, "Role created");
        }

        self.stage(Stage::EnsureLedgerTable, ledger::ensure_table(conn))
            .await?;
        let applied = self
            .stage(Stage::LoadLedger, ledger::load_applied(conn))
            .await?;
        let patches = self
            .stage(Stage::ScanPatches, scan_patches(&self.config.patch_dir))
            .await?;
        info!(
            found = patches.len(),
            already_applied = applied.len(),
            "Patches scanned"
        );

        let report = apply_pending(conn, &patches, &applied).await;

        self.stage(
            Stage::GrantPrivileges,
            grant_privileges(conn, &app.database, &app.user),
        )
        .await?;

        Ok(report)
    }

    async fn read_status(&self, conn: &dyn Connection) -> MigrateResult<StatusReport> {
        let applied = if self
            .stage(Stage::EnsureLedgerTable, ledger::table_exists(conn))
            .await?
        {
            self.stage(Stage::LoadLedger, ledger::load_records(conn))
                .await?
        } else {
            Vec::new()
        };
        let pending = self
            .stage(Stage::ScanPatches, scan_patches(&self.config.patch_dir))
            .await?
            .into_iter()
            .filter(|p| !applied.iter().any(|r| r.filename == p.filename))
            .collect();

        Ok(StatusReport { applied, pending })
    }

    /// Await one stage, logging its failure with the stage name.
    async fn stage<T>(
        &self,
        stage: Stage,
        fut: impl std::future::Future<Output = MigrateResult<T>>,
    ) -> MigrateResult<T> {
        fut.await.map_err(|e| {
            error!(
                stage = stage.as_str(),
                database = %self.config.app.database,
                role = %self.config.app.user,
                error = %e,
                "Migration stage failed"
            );
            e
        })
    }
}
