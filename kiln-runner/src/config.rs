//! Runner configuration
//!
//! Defines all configurable parameters for the runner: polling, output
//! flushing, the build substrate and the paths and addresses the build
//! scripts rely on.

use std::time::Duration;

use crate::basher::DEFAULT_BITBUCKET_URL;
use crate::builder::BuilderKind;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this runner instance
    pub runner_id: String,

    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// How often to ask the orchestrator for queued builds
    pub poll_interval: Duration,

    /// How often buffered build output is flushed to the orchestrator
    pub log_send_interval: Duration,

    /// Maximum time a build can run before it is cancelled
    pub build_timeout: Duration,

    /// Max builds the runner handles at once
    pub max_parallel_builds: usize,

    /// Substrate builds run on
    pub builder_kind: BuilderKind,

    /// Machine tags served by this runner; empty means container builds only
    pub machine_tags: Vec<String>,

    /// Port of the template file server reachable from build substrates
    pub template_port: String,

    /// Address build substrates use to reach this host
    pub loopback_ip: String,

    /// Root under which `.kiln` and clone directories are created
    pub prefix: String,

    /// Docker daemon socket
    pub docker_socket: String,

    /// Secret store address handed to setup scripts
    pub vault_addr: String,

    /// Clone URL template for Bitbucket repositories
    pub bitbucket_download_url: String,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(runner_id: String, orchestrator_url: String) -> Self {
        Self {
            runner_id,
            orchestrator_url,
            poll_interval: Duration::from_secs(5),
            log_send_interval: Duration::from_secs(10),
            build_timeout: Duration::from_secs(3600),
            max_parallel_builds: 2,
            builder_kind: BuilderKind::Docker,
            machine_tags: Vec::new(),
            template_port: "9090".to_string(),
            loopback_ip: "172.17.0.1".to_string(),
            prefix: String::new(),
            docker_socket: "/var/run/docker.sock".to_string(),
            vault_addr: "http://127.0.0.1:8200".to_string(),
            bitbucket_download_url: DEFAULT_BITBUCKET_URL.to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - RUNNER_ID (required)
    /// - ORCHESTRATOR_URL (required)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - LOG_SEND_INTERVAL (optional, seconds, default: 10)
    /// - BUILD_TIMEOUT (optional, seconds, default: 3600)
    /// - MAX_PARALLEL_BUILDS (optional, default: 2)
    /// - BUILDER_KIND (optional, docker|vagrant|host, default: docker)
    /// - RUNNER_TAGS (optional, comma separated machine tags, default: none)
    /// - TEMPLATE_PORT (optional, default: 9090)
    /// - LOOPBACK_IP (optional, default: 172.17.0.1)
    /// - KILN_PREFIX (optional, default: empty)
    /// - DOCKER_SOCKET (optional, default: /var/run/docker.sock)
    /// - VAULT_ADDR (optional, default: http://127.0.0.1:8200)
    /// - BITBUCKET_DOWNLOAD_URL (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let runner_id = std::env::var("RUNNER_ID")
            .map_err(|_| anyhow::anyhow!("RUNNER_ID environment variable not set"))?;

        let orchestrator_url = std::env::var("ORCHESTRATOR_URL")
            .map_err(|_| anyhow::anyhow!("ORCHESTRATOR_URL environment variable not set"))?;

        let mut config = Self::new(runner_id, orchestrator_url);

        if let Some(secs) = env_parse::<u64>("POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("LOG_SEND_INTERVAL") {
            config.log_send_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("BUILD_TIMEOUT") {
            config.build_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<usize>("MAX_PARALLEL_BUILDS") {
            config.max_parallel_builds = max;
        }
        if let Ok(kind) = std::env::var("BUILDER_KIND") {
            config.builder_kind = kind.parse()?;
        }
        if let Ok(tags) = std::env::var("RUNNER_TAGS") {
            config.machine_tags = parse_tags(&tags);
        }
        if let Ok(port) = std::env::var("TEMPLATE_PORT") {
            config.template_port = port;
        }
        if let Ok(ip) = std::env::var("LOOPBACK_IP") {
            config.loopback_ip = ip;
        }
        if let Ok(prefix) = std::env::var("KILN_PREFIX") {
            config.prefix = prefix;
        }
        if let Ok(socket) = std::env::var("DOCKER_SOCKET") {
            config.docker_socket = socket;
        }
        if let Ok(addr) = std::env::var("VAULT_ADDR") {
            config.vault_addr = addr;
        }
        if let Ok(url) = std::env::var("BITBUCKET_DOWNLOAD_URL") {
            config.bitbucket_download_url = url;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runner_id.is_empty() {
            anyhow::bail!("runner_id cannot be empty");
        }

        if self.orchestrator_url.is_empty() {
            anyhow::bail!("orchestrator_url cannot be empty");
        }

        if !self.orchestrator_url.starts_with("http://")
            && !self.orchestrator_url.starts_with("https://")
        {
            anyhow::bail!("orchestrator_url must start with http:// or https://");
        }

        if self.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.log_send_interval.as_secs() == 0 {
            anyhow::bail!("log_send_interval must be greater than 0");
        }

        if self.build_timeout.as_secs() == 0 {
            anyhow::bail!("build_timeout must be greater than 0");
        }

        if self.max_parallel_builds == 0 {
            anyhow::bail!("max_parallel_builds must be greater than 0");
        }

        match (self.builder_kind, self.machine_tags.is_empty()) {
            (BuilderKind::Docker, false) => {
                anyhow::bail!("machine tags are served by vagrant or host runners, not docker")
            }
            (BuilderKind::Vagrant | BuilderKind::Host, true) => {
                anyhow::bail!("{} runners need at least one machine tag", self.builder_kind)
            }
            _ => {}
        }

        if !self.prefix.is_empty() && !self.prefix.starts_with('/') {
            anyhow::bail!("prefix must be an absolute path");
        }

        Ok(())
    }
}

fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8080".to_string(),
        )
    }
}
