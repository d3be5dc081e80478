//! Apply pending patches and record them in the ledger.
//!
//! A failing patch does not stop the loop. It is reported as failed, left
//! out of the ledger, and picked up again on the next run. Patches after it
//! are still attempted. No transaction is wrapped around a patch; a file
//! that needs atomicity says `BEGIN; ... COMMIT;` itself. After a failed
//! patch the session is rolled back so an aborted transaction block cannot
//! leak into the ledger insert, later patches or the grants.

use std::collections::BTreeSet;

use tracing::{error, info, warn};

use crate::connection::Connection;
use crate::ledger;
use crate::types::{MigrationRunReport, PatchFile, PatchOutcome};

/// Outside a transaction block the server only warns.
pub(crate) const ROLLBACK_SQL: &str = "ROLLBACK";

/// Apply every patch not in `applied`, in the order given.
pub async fn apply_pending(
    conn: &dyn Connection,
    patches: &[PatchFile],
    applied: &BTreeSet<String>,
) -> MigrationRunReport {
    let mut report = MigrationRunReport::new();

    for patch in patches {
        if applied.contains(&patch.filename) {
            report.push(&patch.filename, PatchOutcome::SkippedAlreadyApplied);
            continue;
        }

        info!(filename = %patch.filename, "Running patch");
        let outcome = match apply_one(conn, patch).await {
            Ok(()) => {
                info!(filename = %patch.filename, "Patch applied");
                PatchOutcome::Applied
            }
            Err(reason) => {
                error!(filename = %patch.filename, error = %reason, "Error running patch");
                PatchOutcome::Failed { reason }
            }
        };
        report.push(&patch.filename, outcome);
    }

    report
}

async fn apply_one(conn: &dyn Connection, patch: &PatchFile) -> Result<(), String> {
    let sql = tokio::fs::read_to_string(&patch.path)
        .await
        .map_err(|e| format!("failed to read {}: {e}", patch.path.display()))?;

    if let Err(e) = conn.execute(&sql, &[]).await {
        rollback(conn, &patch.filename).await;
        return Err(format!("patch failed: {e}"));
    }

    // The statements ran but the ledger insert did not: the next run will
    // execute this patch again.
    ledger::record_applied(conn, &patch.filename)
        .await
        .map_err(|e| format!("patch ran but could not be recorded: {e}"))
}

async fn rollback(conn: &dyn Connection, filename: &str) {
    if let Err(e) = conn.execute(ROLLBACK_SQL, &[]).await {
        warn!(filename, error = %e, "Rollback after failed patch did not succeed");
    }
}
