use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Target under which every statement is logged at `debug`.
pub const SQL_LOG_TARGET: &str = "tasky_migrate::sql";

/// Install the JSON tracing subscriber.
///
/// Filter precedence: `RUST_LOG`, then `LOG_LEVEL`, then `info`.
/// `SHOW_SQL=1` additionally turns on statement logging.
pub fn init() -> Result<()> {
    let directives = filter_directives(
        std::env::var("RUST_LOG").ok(),
        std::env::var("LOG_LEVEL").ok(),
        std::env::var("SHOW_SQL").is_ok_and(|v| v == "1"),
    );

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&directives)?)
        .json()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

fn filter_directives(rust_log: Option<String>, log_level: Option<String>, show_sql: bool) -> String {
    let base = rust_log
        .filter(|v| !v.trim().is_empty())
        .or_else(|| log_level.map(|l| l.trim().to_ascii_lowercase()))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "info".to_string());

    if show_sql {
        format!("{base},{SQL_LOG_TARGET}=debug")
    } else {
        base
    }
}
