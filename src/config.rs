//! Orchestrator configuration
//!
//! Timing knobs, the jail whitelist, the network wrapper and the optional sampler.
//! Values come from [`OrchestratorConfig::default`], the environment
//! ([`OrchestratorConfig::from_env`]) or the fluent [`OrchestratorBuilder`].

use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use crate::controller::Orchestrator;
use crate::errors::{JailwatchError, Result};
use crate::events::EventSink;
use crate::execution::DEFAULT_CHUNK_CAP;
use crate::isolation::{NetworkIsolation, Whitelist};
use crate::monitoring::{GuardPolicy, SamplerConfig};

/// Sampler executable
pub const ENV_SAMPLER: &str = "JAILWATCH_SAMPLER";
/// Directory for the per-run telemetry files written by the sampler
pub const ENV_TELEMETRY_DIR: &str = "JAILWATCH_TELEMETRY_DIR";
/// Extra whitelist prefixes, colon separated
pub const ENV_WHITELIST: &str = "JAILWATCH_WHITELIST";
/// Network isolation prefix, whitespace separated
pub const ENV_NETWORK_WRAPPER: &str = "JAILWATCH_NETWORK_WRAPPER";
/// Compatibility shim prefix for non-native hosts, whitespace separated
pub const ENV_COMPAT_SHIM: &str = "JAILWATCH_COMPAT_SHIM";

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Jail poll period
    pub poll_interval: Duration,
    /// Output flush period
    pub flush_interval: Duration,
    /// Largest payload of one output event
    pub flush_chunk_bytes: usize,
    /// Prefixes exempt from jail checks
    pub whitelist: Whitelist,
    /// Prefix used for network-disabled requests
    pub network: NetworkIsolation,
    /// Prefix that runs commands on hosts without native process namespaces
    pub compat_shim: Vec<String>,
    /// External sampler; telemetry is off when unset
    pub sampler: Option<SamplerConfig>,
    /// How long `stop` waits for the execution to finish tearing down
    pub stop_grace: Duration,
    /// How long to wait for output pipes to reach end of file after exit
    pub drain_grace: Duration,
    /// Anomaly guard thresholds
    pub guard_policy: GuardPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            flush_interval: Duration::from_millis(300),
            flush_chunk_bytes: DEFAULT_CHUNK_CAP,
            whitelist: Whitelist::default(),
            network: NetworkIsolation::default(),
            compat_shim: Vec::new(),
            sampler: None,
            stop_grace: Duration::from_secs(2),
            drain_grace: Duration::from_millis(500),
            guard_policy: GuardPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `JAILWATCH_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(program) = non_empty(ENV_SAMPLER) {
            let output_dir = non_empty(ENV_TELEMETRY_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir);
            debug!("Sampler {} writing under {}", program, output_dir.display());
            config.sampler = Some(SamplerConfig::new(program, output_dir));
        }

        if let Some(list) = non_empty(ENV_WHITELIST) {
            config
                .whitelist
                .extend(list.split(':').filter(|p| !p.is_empty()));
        }

        if let Some(wrapper) = non_empty(ENV_NETWORK_WRAPPER) {
            config.network = NetworkIsolation::with_wrapper(wrapper.split_whitespace())?;
        }

        if let Some(shim) = non_empty(ENV_COMPAT_SHIM) {
            config.compat_shim = shim.split_whitespace().map(String::from).collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("poll interval", self.poll_interval),
            ("flush interval", self.flush_interval),
        ] {
            if value.is_zero() {
                return Err(JailwatchError::InvalidConfig(format!(
                    "The {} must be greater than zero",
                    name
                )));
            }
        }

        if self.flush_chunk_bytes == 0 {
            return Err(JailwatchError::InvalidConfig(
                "Flush chunk size must be greater than zero".to_string(),
            ));
        }

        let policy = &self.guard_policy;
        if !(policy.kill_threshold > 0.0 && policy.kill_threshold <= 1.0) {
            return Err(JailwatchError::InvalidConfig(format!(
                "Kill threshold must be in (0, 1], got {}",
                policy.kill_threshold
            )));
        }
        if policy.window == 0 || policy.min_samples > policy.window {
            return Err(JailwatchError::InvalidConfig(format!(
                "Guard window of {} cannot hold {} samples",
                policy.window, policy.min_samples
            )));
        }

        if let Some(sampler) = &self.sampler {
            if sampler.program.as_os_str().is_empty() {
                return Err(JailwatchError::InvalidConfig(
                    "Sampler program cannot be empty".to_string(),
                ));
            }
            if sampler.tailer.read_period.is_zero() || sampler.tailer.max_batch == 0 {
                return Err(JailwatchError::InvalidConfig(
                    "Telemetry tailer needs a read period and a batch size".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Builder pattern for orchestrator creation
#[derive(Debug, Clone, Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn poll_interval(mut self, period: Duration) -> Self {
        self.config.poll_interval = period;
        self
    }

    pub fn flush_interval(mut self, period: Duration) -> Self {
        self.config.flush_interval = period;
        self
    }

    pub fn flush_chunk_bytes(mut self, bytes: usize) -> Self {
        self.config.flush_chunk_bytes = bytes;
        self
    }

    /// Append whitelist prefixes
    pub fn whitelist<I, P>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.whitelist.extend(prefixes);
        self
    }

    /// Replace the whole whitelist
    pub fn replace_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.config.whitelist = whitelist;
        self
    }

    /// Set the network isolation prefix
    pub fn network_wrapper<I, S>(mut self, wrapper: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.network = NetworkIsolation::with_wrapper(wrapper)?;
        Ok(self)
    }

    pub fn compat_shim<I, S>(mut self, shim: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.compat_shim = shim.into_iter().map(Into::into).collect();
        self
    }

    pub fn sampler(mut self, sampler: SamplerConfig) -> Self {
        self.config.sampler = Some(sampler);
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.config.drain_grace = grace;
        self
    }

    pub fn guard_policy(mut self, policy: GuardPolicy) -> Self {
        self.config.guard_policy = policy;
        self
    }

    /// Validated configuration
    pub fn build_config(self) -> Result<OrchestratorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build an orchestrator publishing into `sink`
    pub fn build(self, sink: EventSink) -> Result<Orchestrator> {
        Ok(Orchestrator::new(self.build_config()?, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_timings() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.flush_interval, Duration::from_millis(300));
        assert_eq!(config.flush_chunk_bytes, 64 * 1024);
        assert_eq!(config.stop_grace, Duration::from_secs(2));
        assert!(config.sampler.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overlays_sampler_whitelist_and_wrapper() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            (ENV_SAMPLER, "/usr/local/bin/jailwatch-sampler"),
            (ENV_TELEMETRY_DIR, "/var/lib/jailwatch"),
            (ENV_WHITELIST, "/opt/python:/nix/store"),
            (ENV_NETWORK_WRAPPER, "firejail --net=none"),
            (ENV_COMPAT_SHIM, "wsl --exec"),
        ]))
        .unwrap();

        let sampler = config.sampler.unwrap();
        assert_eq!(sampler.program, Path::new("/usr/local/bin/jailwatch-sampler"));
        assert_eq!(sampler.output_dir, Path::new("/var/lib/jailwatch"));
        assert!(config.whitelist.covers(Path::new("/nix/store/abc")));
        assert!(config.whitelist.covers(Path::new("/dev/null")));
        assert_eq!(config.network.wrapper(), ["firejail", "--net=none"]);
        assert_eq!(config.compat_shim, ["wsl", "--exec"]);
    }

    #[test]
    fn telemetry_dir_defaults_to_temp_dir() {
        let config =
            OrchestratorConfig::from_lookup(lookup(&[(ENV_SAMPLER, "jailwatch-sampler")])).unwrap();
        let sampler = config.sampler.unwrap();
        assert_eq!(sampler.output_dir, std::env::temp_dir());
        assert_ne!(sampler.output_path("a"), sampler.output_path("b"));
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let config =
            OrchestratorConfig::from_lookup(lookup(&[(ENV_SAMPLER, " "), (ENV_WHITELIST, "")]))
                .unwrap();
        assert!(config.sampler.is_none());
        assert_eq!(config.whitelist, Whitelist::default());
    }

    #[test]
    fn builder_validates() {
        assert!(OrchestratorBuilder::new()
            .poll_interval(Duration::ZERO)
            .build_config()
            .is_err());
        assert!(OrchestratorBuilder::new()
            .flush_chunk_bytes(0)
            .build_config()
            .is_err());
        assert!(OrchestratorBuilder::new()
            .guard_policy(GuardPolicy {
                kill_threshold: 1.5,
                ..Default::default()
            })
            .build_config()
            .is_err());
        assert!(OrchestratorBuilder::new()
            .network_wrapper(Vec::<String>::new())
            .is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = OrchestratorBuilder::new()
            .flush_interval(Duration::from_millis(50))
            .whitelist(["/opt/tools"])
            .stop_grace(Duration::from_secs(1))
            .build_config()
            .unwrap();
        assert_eq!(config.flush_interval, Duration::from_millis(50));
        assert!(config.whitelist.covers(Path::new("/opt/tools/bin")));
        assert_eq!(config.stop_grace, Duration::from_secs(1));
    }
}
