use std::env;
use std::time::Duration;

/// Broker-side tunables, read from the environment.
///
/// Mirrors the one-shot `from_env()` construction pattern used throughout
/// this workspace: read once at process start, pass the typed config down.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind: String,
    pub port: u16,
    /// Base URL advertised to workers as the `status_callback_url` origin.
    /// Defaults to `http://127.0.0.1:{port}` since `bind` itself (e.g.
    /// `0.0.0.0`) is not reachable from a peer.
    pub public_url: String,
    /// Number of concurrent delivery-loop workers.
    pub delivery_concurrency: usize,
    /// Delivery-loop polling cadence.
    pub delivery_tick: Duration,
    /// Delivery attempt ceiling before a task becomes `undeliverable`
    /// (default 10).
    pub retry_ceiling: u32,
    /// Default `processing_deadline` window stamped at delivery (default
    /// 1h).
    pub processing_deadline: Duration,
    /// Consumer health-probe cadence.
    pub health_probe_interval: Duration,
    /// Consecutive health-probe failures before a consumer flips
    /// `ready=false`.
    pub health_failure_threshold: u32,
}

impl BrokerConfig {
    pub const DEFAULT_BIND: &str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 8080;

    pub fn from_env() -> Self {
        let port = env_parse("TASKFLOW_BROKER_PORT", Self::DEFAULT_PORT);
        Self {
            bind: env::var("TASKFLOW_BROKER_BIND").unwrap_or_else(|_| Self::DEFAULT_BIND.to_owned()),
            port,
            public_url: env::var("TASKFLOW_BROKER_PUBLIC_URL")
                .unwrap_or_else(|_| format!("http://127.0.0.1:{port}")),
            delivery_concurrency: env_parse("TASKFLOW_DELIVERY_CONCURRENCY", 4),
            delivery_tick: Duration::from_millis(env_parse("TASKFLOW_DELIVERY_TICK_MS", 200)),
            retry_ceiling: env_parse("TASKFLOW_RETRY_CEILING", 10),
            processing_deadline: Duration::from_secs(env_parse(
                "TASKFLOW_PROCESSING_DEADLINE_SECS",
                3600,
            )),
            health_probe_interval: Duration::from_secs(env_parse(
                "TASKFLOW_HEALTH_PROBE_INTERVAL_SECS",
                15,
            )),
            health_failure_threshold: env_parse("TASKFLOW_HEALTH_FAILURE_THRESHOLD", 3),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Orchestrator-side tunables, read from the environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bind: String,
    pub port: u16,
    /// Base URL of the broker this orchestrator polls and mutates tasks on.
    pub broker_url: String,
    /// Default per-step wall-clock timeout (default 30min).
    pub step_timeout: Duration,
    /// Default per-step retry cap (default 3).
    pub step_retry_cap: u32,
    /// Default fan-out concurrency cap (default 8).
    pub fanout_concurrency: usize,
    /// Child-status poll cadence.
    pub poll_interval: Duration,
    /// Jittered poll-backoff ceiling after repeated polls.
    pub poll_max_backoff: Duration,
}

impl OrchestratorConfig {
    pub const DEFAULT_BIND: &str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 8090;
    pub const DEFAULT_BROKER_URL: &str = "http://127.0.0.1:8080";

    pub fn from_env() -> Self {
        Self {
            bind: env::var("TASKFLOW_ORCHESTRATOR_BIND")
                .unwrap_or_else(|_| Self::DEFAULT_BIND.to_owned()),
            port: env_parse("TASKFLOW_ORCHESTRATOR_PORT", Self::DEFAULT_PORT),
            broker_url: env::var("TASKFLOW_BROKER_URL")
                .unwrap_or_else(|_| Self::DEFAULT_BROKER_URL.to_owned()),
            step_timeout: Duration::from_secs(env_parse("TASKFLOW_STEP_TIMEOUT_SECS", 1800)),
            step_retry_cap: env_parse("TASKFLOW_STEP_RETRY_CAP", 3),
            fanout_concurrency: env_parse("TASKFLOW_FANOUT_CONCURRENCY", 8),
            poll_interval: Duration::from_millis(env_parse("TASKFLOW_POLL_INTERVAL_MS", 500)),
            poll_max_backoff: Duration::from_millis(env_parse(
                "TASKFLOW_POLL_MAX_BACKOFF_MS",
                5000,
            )),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_defaults() {
        // SAFETY: test runs single-threaded w.r.t. this env var; no other
        // test in this crate reads TASKFLOW_BROKER_PORT.
        unsafe {
            std::env::remove_var("TASKFLOW_BROKER_PORT");
        }
        let cfg = BrokerConfig::from_env();
        assert_eq!(cfg.port, BrokerConfig::DEFAULT_PORT);
        assert_eq!(cfg.retry_ceiling, 10);
    }

    #[test]
    fn orchestrator_defaults() {
        unsafe {
            std::env::remove_var("TASKFLOW_BROKER_URL");
        }
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.broker_url, OrchestratorConfig::DEFAULT_BROKER_URL);
        assert_eq!(cfg.step_retry_cap, 3);
        assert_eq!(cfg.fanout_concurrency, 8);
    }
}
