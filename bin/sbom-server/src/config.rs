//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use sbom_core::{CommandProcessor, JanitorConfig, RunningTimeoutAction, SchedulerConfig};

/// Runtime configuration for sbom-server.
///
/// Every field has a default so the server starts without any environment
/// variables beyond a reachable database.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8082"`).
    pub bind_address: String,

    /// PostgreSQL connection string (`DATABASE_URL`).
    pub database_url: String,
    pub db_max_connections: u32,

    /// Shared upload volume; blob directories are created beneath it.
    pub upload_dir: PathBuf,

    /// Largest accepted upload body, in bytes.
    pub max_upload_bytes: u64,

    /// `tracing` filter string, e.g. `"info"` or `"sbom_core=debug,info"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    // ── scheduler ────────────────────────────────────────────────────────────
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub keep_input_on_success: bool,
    /// Must stay below `tmp_max_age`, or running scans lose their output.
    pub temp_heartbeat: Duration,

    // ── scanner ──────────────────────────────────────────────────────────────
    pub scanner_program: String,
    /// Whitespace-separated; `{input}` is replaced by the archive path.
    pub scanner_args: String,

    // ── janitor ──────────────────────────────────────────────────────────────
    pub janitor_every: Duration,
    pub retention: Duration,
    pub running_timeout: Duration,
    pub running_timeout_action: RunningTimeoutAction,
    pub max_attempts: u32,
    pub tmp_max_age: Duration,
    pub janitor_batch_size: usize,
    pub janitor_lock_key: i64,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("SBOM_BIND", "0.0.0.0:8082"),
            database_url: env_or("DATABASE_URL", "postgres://localhost/sbom"),
            db_max_connections: parse_env("SBOM_DB_MAX_CONNECTIONS", 20),
            upload_dir: PathBuf::from(env_or("SBOM_UPLOAD_DIR", "./uploads")),
            max_upload_bytes: parse_env("SBOM_MAX_UPLOAD_BYTES", 1500 << 20),
            log_level: env_or("SBOM_LOG", "info"),
            log_json: env_flag("SBOM_LOG_JSON"),
            worker_concurrency: parse_env("SBOM_WORKER_CONCURRENCY", 5),
            poll_interval: Duration::from_millis(parse_env("SBOM_POLL_INTERVAL_MS", 500)),
            shutdown_grace: secs_env("SBOM_SHUTDOWN_GRACE_SECS", 30),
            keep_input_on_success: env_flag("SBOM_KEEP_INPUT_ON_SUCCESS"),
            temp_heartbeat: secs_env("SBOM_TEMP_HEARTBEAT_SECS", 60),
            scanner_program: env_or("SBOM_SCANNER_PROGRAM", "syft"),
            scanner_args: env_or("SBOM_SCANNER_ARGS", "{input} -o json"),
            janitor_every: secs_env("SBOM_JANITOR_EVERY_SECS", 3600),
            retention: secs_env("SBOM_RETENTION_SECS", 86_400),
            running_timeout: secs_env("SBOM_RUNNING_TIMEOUT_SECS", 10_800),
            running_timeout_action: parse_env(
                "SBOM_RUNNING_TIMEOUT_ACTION",
                RunningTimeoutAction::Fail,
            ),
            max_attempts: parse_env("SBOM_MAX_ATTEMPTS", 3),
            tmp_max_age: secs_env("SBOM_TMP_MAX_AGE_SECS", 600),
            janitor_batch_size: parse_env("SBOM_JANITOR_BATCH_SIZE", 500),
            janitor_lock_key: parse_env("SBOM_JANITOR_LOCK_KEY", 9_876_543),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.worker_concurrency,
            poll_interval: self.poll_interval,
            shutdown_grace: self.shutdown_grace,
            keep_input_on_success: self.keep_input_on_success,
            temp_heartbeat: self.temp_heartbeat,
        }
    }

    pub fn janitor(&self) -> JanitorConfig {
        JanitorConfig {
            every: self.janitor_every,
            retention: self.retention,
            running_timeout: self.running_timeout,
            running_timeout_action: self.running_timeout_action,
            max_attempts: self.max_attempts,
            tmp_max_age: self.tmp_max_age,
            batch_size: self.janitor_batch_size,
            lock_key: self.janitor_lock_key,
        }
    }

    pub fn processor(&self) -> CommandProcessor {
        CommandProcessor::from_template(&self.scanner_program, &self.scanner_args)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8082".to_owned(),
            database_url: "postgres://localhost/sbom".to_owned(),
            db_max_connections: 20,
            upload_dir: PathBuf::from("./uploads"),
            max_upload_bytes: 1500 << 20,
            log_level: "info".to_owned(),
            log_json: false,
            worker_concurrency: 5,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
            keep_input_on_success: false,
            temp_heartbeat: Duration::from_secs(60),
            scanner_program: "syft".to_owned(),
            scanner_args: "{input} -o json".to_owned(),
            janitor_every: Duration::from_secs(3600),
            retention: Duration::from_secs(86_400),
            running_timeout: Duration::from_secs(10_800),
            running_timeout_action: RunningTimeoutAction::Fail,
            max_attempts: 3,
            tmp_max_age: Duration::from_secs(600),
            janitor_batch_size: 500,
            janitor_lock_key: 9_876_543,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        // Tracing is not up yet when configuration is read.
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            eprintln!("WARN: {key}='{raw}' is not a valid value; using the default");
            default
        }),
        Err(_) => default,
    }
}

fn secs_env(key: &str, default: u64) -> Duration {
    Duration::from_secs(parse_env(key, default))
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scanner_is_syft_json() {
        let cfg = Config::default();
        let p = cfg.processor();
        assert_eq!(p.program(), "syft");
    }

    #[test]
    fn conversions_carry_every_field() {
        let cfg = Config {
            worker_concurrency: 7,
            keep_input_on_success: true,
            running_timeout_action: RunningTimeoutAction::Requeue,
            janitor_lock_key: 42,
            ..Config::default()
        };
        let sched = cfg.scheduler();
        assert_eq!(sched.concurrency, 7);
        assert!(sched.keep_input_on_success);

        let jan = cfg.janitor();
        assert_eq!(jan.running_timeout_action, RunningTimeoutAction::Requeue);
        assert_eq!(jan.lock_key, 42);
        assert_eq!(jan.running_timeout, Duration::from_secs(3 * 3600));
    }

    #[test]
    fn unparseable_values_fall_back() {
        // SAFETY: this is the only test that touches this variable.
        unsafe { std::env::set_var("SBOM_TEST_PARSE_FALLBACK", "not-a-number") };
        assert_eq!(parse_env("SBOM_TEST_PARSE_FALLBACK", 5_usize), 5);
        assert_eq!(
            parse_env("SBOM_TEST_PARSE_FALLBACK", RunningTimeoutAction::Fail),
            RunningTimeoutAction::Fail
        );
        unsafe { std::env::remove_var("SBOM_TEST_PARSE_FALLBACK") };
    }
}
