//! Scheduler configuration, loaded from environment variables.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use persys_reconcile::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE, DEFAULT_RETRY_MAX};

use crate::model::WorkloadType;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gRPC and metrics listeners bind to.
    pub bind_addr: IpAddr,
    pub grpc_port: u16,
    pub metrics_port: u16,

    pub store: StoreConfig,
    pub discovery: DiscoveryConfig,
    pub intervals: IntervalConfig,
    pub policy: PolicyConfig,
    pub agent: AgentConfig,
    pub tls: TlsConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    pub log_format: LogFormat,

    /// Recorded at startup; spans are not exported.
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    /// Attempts per store operation before entering degraded mode.
    pub max_retries: u32,
    /// Fixed delay between store attempts.
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub domain: String,
    /// Address published in this instance's A record.
    pub advertise_addr: String,
    pub instance_id: String,
}

#[derive(Debug, Clone)]
pub struct IntervalConfig {
    /// Heartbeat interval handed to agents at registration.
    pub heartbeat: Duration,
    pub reconcile: Duration,
    pub monitor: Duration,
    pub drift: Duration,
    pub mode_probe: Duration,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// How long a node may go without heartbeat before failover starts.
    pub node_unavailable_grace: Duration,
    /// Nodes with older heartbeats are not placement candidates.
    pub placement_heartbeat_max_age: Duration,
    /// A just-launched workload the agent doesn't report yet is not drift.
    pub missing_grace: Duration,
    /// Same revision on the same node is not re-applied inside this window.
    pub reapply_guard: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// How long ApplyWorkload waits for the triggered reconcile.
    pub apply_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub apply_timeout: Duration,
    pub vm_apply_timeout: Duration,
    pub delete_timeout: Duration,
    pub status_timeout: Duration,
    pub converge_poll_interval: Duration,
}

impl AgentConfig {
    /// Apply deadline for a workload type; VMs get the long one.
    pub fn apply_timeout_for(&self, workload_type: WorkloadType) -> Duration {
        match workload_type {
            WorkloadType::Vm => self.vm_apply_timeout,
            WorkloadType::Container | WorkloadType::Compose => self.apply_timeout,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(45),
            vm_apply_timeout: Duration::from_secs(240),
            delete_timeout: Duration::from_secs(60),
            status_timeout: Duration::from_secs(10),
            converge_poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            node_unavailable_grace: Duration::from_secs(180),
            placement_heartbeat_max_age: Duration::from_secs(600),
            missing_grace: Duration::from_secs(15),
            reapply_guard: Duration::from_secs(15),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
            apply_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    /// Server name expected on agent certificates.
    pub agent_domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let bind_addr = vars
            .string("BIND_ADDR", "0.0.0.0")
            .parse()
            .context("BIND_ADDR must be an IP address")?;

        let store = StoreConfig {
            endpoints: vars
                .string("ETCD_ENDPOINTS", "localhost:2379")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            dial_timeout: vars.duration("ETCD_DIAL_TIMEOUT", Duration::from_secs(5))?,
            request_timeout: vars.duration("ETCD_REQUEST_TIMEOUT", Duration::from_secs(5))?,
            max_retries: vars.parsed("STORE_MAX_RETRIES", 5)?,
            retry_backoff: vars.duration("STORE_RETRY_BACKOFF", Duration::from_millis(200))?,
        };
        if store.endpoints.is_empty() {
            bail!("ETCD_ENDPOINTS must name at least one endpoint");
        }

        let discovery = DiscoveryConfig {
            domain: vars.string("DOMAIN", "persys.local"),
            advertise_addr: vars.string("SCHEDULER_ADVERTISE_ADDR", "127.0.0.1"),
            instance_id: lookup("SCHEDULER_INSTANCE_ID")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(default_instance_id),
        };

        let intervals = IntervalConfig {
            heartbeat: vars.duration("HEARTBEAT_INTERVAL", Duration::from_secs(60))?,
            reconcile: vars.duration("SCHEDULER_RECONCILE_INTERVAL", Duration::from_secs(5))?,
            monitor: vars.duration("SCHEDULER_MONITOR_INTERVAL", Duration::from_secs(60))?,
            drift: vars.duration("SCHEDULER_DRIFT_INTERVAL", Duration::from_secs(300))?,
            mode_probe: vars.duration("SCHEDULER_MODE_PROBE_INTERVAL", Duration::from_secs(3))?,
        };

        let policy = PolicyConfig {
            node_unavailable_grace: vars
                .duration("SCHEDULER_NODE_UNAVAILABLE_GRACE", Duration::from_secs(180))?,
            placement_heartbeat_max_age: vars.duration(
                "SCHEDULER_PLACEMENT_HEARTBEAT_MAX_AGE",
                Duration::from_secs(600),
            )?,
            missing_grace: vars
                .duration("SCHEDULER_MISSING_GRACE_PERIOD", Duration::from_secs(15))?,
            reapply_guard: vars.duration("SCHEDULER_REAPPLY_GUARD", Duration::from_secs(15))?,
            max_attempts: vars.parsed("SCHEDULER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            retry_base: vars.duration("SCHEDULER_RETRY_BASE", DEFAULT_RETRY_BASE)?,
            retry_max: vars.duration("SCHEDULER_RETRY_MAX", DEFAULT_RETRY_MAX)?,
            apply_wait: vars.duration("SCHEDULER_APPLY_WAIT", Duration::from_secs(5))?,
        };
        if policy.max_attempts == 0 {
            bail!("SCHEDULER_MAX_ATTEMPTS must be at least 1");
        }

        let agent = AgentConfig {
            apply_timeout: vars.duration("AGENT_APPLY_TIMEOUT", Duration::from_secs(45))?,
            vm_apply_timeout: vars.duration("AGENT_APPLY_VM_TIMEOUT", Duration::from_secs(240))?,
            delete_timeout: vars.duration("AGENT_DELETE_TIMEOUT", Duration::from_secs(60))?,
            status_timeout: vars.duration("AGENT_STATUS_TIMEOUT", Duration::from_secs(10))?,
            converge_poll_interval: vars
                .duration("AGENT_CONVERGE_POLL_INTERVAL", Duration::from_secs(1))?,
        };

        let tls = TlsConfig {
            enabled: vars.flag("TLS_ENABLED"),
            cert_path: lookup("TLS_CERT_PATH").map(PathBuf::from),
            key_path: lookup("TLS_KEY_PATH").map(PathBuf::from),
            ca_path: lookup("TLS_CA_PATH").map(PathBuf::from),
            agent_domain: vars.string("AGENT_TLS_DOMAIN", "persys-agent"),
        };
        if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none() || tls.ca_path.is_none())
        {
            bail!("TLS_ENABLED requires TLS_CERT_PATH, TLS_KEY_PATH and TLS_CA_PATH");
        }

        let log_format = match vars.string("LOG_FORMAT", "json").to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" | "pretty" => LogFormat::Text,
            other => bail!("LOG_FORMAT must be json or text, got {other:?}"),
        };

        Ok(Self {
            bind_addr,
            grpc_port: vars.parsed("GRPC_PORT", 8085)?,
            metrics_port: vars.parsed("METRICS_PORT", 8084)?,
            store,
            discovery,
            intervals,
            policy,
            agent,
            tls,
            log_level: vars.string("LOG_LEVEL", "info"),
            log_format,
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|s| !s.is_empty()),
        })
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.grpc_port)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.metrics_port)
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key).filter(|s| !s.is_empty()) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
            None => Ok(default),
        }
    }

    fn duration(&self, key: &str, default: Duration) -> Result<Duration> {
        match (self.0)(key).filter(|s| !s.is_empty()) {
            Some(raw) => parse_duration(&raw).with_context(|| format!("invalid {key}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str) -> bool {
        (self.0)(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

fn default_instance_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "scheduler-0".to_string())
}

/// Parse a duration such as `15s`, `500ms`, `3m`, `1h` or bare seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    if digits.is_empty() {
        bail!("duration {raw:?} has no magnitude");
    }
    let value: u64 = digits.parse()?;
    let duration = match unit {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => bail!("unknown duration unit {other:?} in {raw:?}"),
    };
    Ok(duration)
}
