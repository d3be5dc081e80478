//! Wait for a database to accept connections.
//!
//! Both the admin and the target server may come up after this process
//! (container start ordering), so every connection goes through here.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::connection::{Connection, Connector, DbResult};
use crate::error::{MigrateError, MigrateResult};
use crate::target::ConnectionTarget;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one. `retries = 6` means up to 7 probes.
    pub retries: u32,
    pub min_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// Optional wall-clock bound on the whole wait.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 6,
            min_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts. For tests.
    pub fn immediate(retries: u32) -> Self {
        Self {
            retries,
            min_delay: Duration::ZERO,
            factor: 1,
            max_delay: Duration::ZERO,
            timeout: None,
        }
    }

    /// Delay before retry `n` (1-based): `min_delay * factor^(n-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1);
        let multiplier = self.factor.max(1).checked_pow(exp).unwrap_or(u32::MAX);
        self.min_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Connect and probe `target`, retrying per `policy`.
/// Returns the live connection, or `Connection`/`ConnectionTimeout` errors.
pub async fn wait_for_connection(
    connector: &dyn Connector,
    target: &ConnectionTarget,
    policy: &RetryPolicy,
) -> MigrateResult<Box<dyn Connection>> {
    let started = Instant::now();
    let attempts = retry_loop(connector, target, policy);

    let result = match policy.timeout {
        Some(limit) => match tokio::time::timeout(limit, attempts).await {
            Ok(result) => result,
            Err(_) => {
                return Err(MigrateError::ConnectionTimeout {
                    target: target.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        },
        None => attempts.await,
    };

    result.map_err(|(attempts, source)| MigrateError::Connection {
        target: target.to_string(),
        attempts,
        source,
    })
}

async fn retry_loop(
    connector: &dyn Connector,
    target: &ConnectionTarget,
    policy: &RetryPolicy,
) -> Result<Box<dyn Connection>, (u32, sqlx::Error)> {
    let max_attempts = policy.retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match try_once(connector, target).await {
            Ok(conn) => {
                info!(target_db = %target, attempt, "Database connection established");
                return Ok(conn);
            }
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    target_db = %target,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Database not reachable yet, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err((attempt, e)),
        }
    }
}

async fn try_once(connector: &dyn Connector, target: &ConnectionTarget) -> DbResult<Box<dyn Connection>> {
    let conn = connector.connect(target).await?;
    if let Err(e) = conn.probe().await {
        conn.close().await;
        return Err(e);
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;

    fn target() -> ConnectionTarget {
        ConnectionTarget {
            host: "localhost".into(),
            user: "postgres".into(),
            database: "postgres".into(),
            ..ConnectionTarget::default()
        }
    }

    #[tokio::test]
    async fn succeeds_immediately_when_reachable() {
        let server = FakeServer::new();
        let conn = wait_for_connection(&server.connector(), &target(), &RetryPolicy::immediate(6))
            .await
            .unwrap();

        conn.close().await;
        assert_eq!(server.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn fifth_attempt_succeeds_within_budget() {
        let server = FakeServer::new();
        server.fail_next_connects(4);

        let conn = wait_for_connection(&server.connector(), &target(), &RetryPolicy::immediate(6))
            .await
            .unwrap();

        conn.close().await;
        assert_eq!(server.connect_attempts(), 5);
    }

    #[tokio::test]
    async fn seven_failures_exhaust_budget() {
        let server = FakeServer::new();
        server.fail_next_connects(7);

        let err = wait_for_connection(&server.connector(), &target(), &RetryPolicy::immediate(6))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, MigrateError::Connection { attempts: 7, .. }));
        assert_eq!(server.connect_attempts(), 7);
    }

    #[tokio::test]
    async fn failed_probe_closes_connection_before_retry() {
        let server = FakeServer::new();
        server.fail_next_probes(2);

        let conn = wait_for_connection(&server.connector(), &target(), &RetryPolicy::immediate(6))
            .await
            .unwrap();
        conn.close().await;

        assert_eq!(server.connect_attempts(), 3);
        assert_eq!(server.open_connections(), 0);
    }

    #[tokio::test]
    async fn timeout_bounds_the_whole_wait() {
        let server = FakeServer::new();
        server.fail_next_connects(100);
        let policy = RetryPolicy {
            retries: 100,
            min_delay: Duration::from_millis(20),
            factor: 1,
            max_delay: Duration::from_millis(20),
            timeout: Some(Duration::from_millis(50)),
        };

        let err = wait_for_connection(&server.connector(), &target(), &policy)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, MigrateError::ConnectionTimeout { .. }));
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
