use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

/// Connection pool sizing and per-session settings for the job ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side cap on a single ledger statement. `None` leaves the
    /// server default.
    pub statement_timeout: Option<Duration>,
    pub disable_jit: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Some(Duration::from_secs(15)),
            disable_jit: true,
        }
    }
}

impl PoolSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let num = |key: &str| get(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            max_connections: num("LOGOFLOW_DB_MAX_CONNECTIONS")
                .map_or(defaults.max_connections, |n| n.clamp(1, 64) as u32),
            acquire_timeout: num("LOGOFLOW_DB_ACQUIRE_TIMEOUT_SECS")
                .map_or(defaults.acquire_timeout, |s| {
                    Duration::from_secs(s.clamp(1, 60))
                }),
            statement_timeout: match num("LOGOFLOW_DB_STATEMENT_TIMEOUT_MS") {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.statement_timeout,
            },
            disable_jit: get("LOGOFLOW_DISABLE_JIT")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.disable_jit),
        }
    }

    fn session_sql(&self) -> Vec<String> {
        let mut stmts = vec!["SET application_name = 'logoflow'".to_string()];
        if let Some(t) = self.statement_timeout {
            stmts.push(format!("SET statement_timeout = {}", t.as_millis()));
        }
        if self.disable_jit {
            stmts.push("SET jit = OFF".to_string());
        }
        stmts
    }
}

pub async fn make_pool(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let session = settings.session_sql();

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            let session = session.clone();
            Box::pin(async move {
                for stmt in &session {
                    sqlx::query(stmt.as_str()).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    info!(
        max_connections = settings.max_connections,
        acquire_timeout_ms = settings.acquire_timeout.as_millis() as u64,
        statement_timeout_ms = settings.statement_timeout.map(|t| t.as_millis() as u64),
        "ledger pool ready"
    );

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("ledger migrations applied");
    Ok(())
}
