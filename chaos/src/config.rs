//! Operator configuration (`chaos.toml`).
//!
//! Lookup order: `--config`, then the first `chaos.toml` / `.chaos.toml` in
//! the current directory or any parent, then the user config directory.
//! Without a file every section takes its defaults.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE_NAMES: &[&str] = &["chaos.toml", ".chaos.toml"];

const ENV_SSH_USER: &str = "CHAOS_SSH_USER";
const ENV_SSH_KEY: &str = "CHAOS_SSH_KEY";
const ENV_SSH_PORT: &str = "CHAOS_SSH_PORT";
const ENV_API_PORT: &str = "CHAOS_API_PORT";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub discovery: DiscoveryConfig,
    pub ssh: SshConfig,
    pub api: ApiConfig,
    pub runner: RunnerSection,
    pub scenarios: ScenariosConfig,
    pub state: StateConfig,

    /// File this configuration was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "chaos-test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    #[default]
    Terraform,
    Static,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub method: DiscoveryMethod,
    pub terraform: TerraformConfig,
    #[serde(rename = "static")]
    pub static_nodes: StaticConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerraformConfig {
    pub working_dir: PathBuf,
    /// Terraform binary; overridable for wrappers such as `tofu`.
    pub binary: String,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("./terraform"),
            binary: "terraform".to_string(),
        }
    }
}

/// Inventory entries are `public` or `public/private`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StaticConfig {
    pub servers: Vec<String>,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: String,
    pub key_path: PathBuf,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Reject hosts missing from `known_hosts` instead of accepting new keys.
    pub strict_host_keys: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            key_path: PathBuf::from("~/.ssh/id_rsa"),
            port: 22,
            connect_timeout_secs: 10,
            strict_host_keys: false,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub scheme: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    /// Sent as `X-Nomad-Token` when set.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 4646,
            request_timeout_secs: 5,
            token: None,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSection {
    pub retry_interval_ms: u64,
    pub teardown_timeout_secs: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            teardown_timeout_secs: 120,
        }
    }
}

impl RunnerSection {
    pub fn to_runner_config(&self) -> chaos_core::RunnerConfig {
        chaos_core::RunnerConfig {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            teardown_timeout: Duration::from_secs(self.teardown_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenariosConfig {
    pub search_paths: Vec<PathBuf>,
}

impl Default for ScenariosConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from("scenarios"), PathBuf::from("chaos/scenarios")],
        }
    }
}

/// Where `inject` records what `heal` has to undo.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".chaos-state.json"),
        }
    }
}

impl Config {
    /// Load from `explicit`, or search for a config file, or fall back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let cwd = std::env::current_dir().context("reading current directory")?;
                find_config_file(&cwd).or_else(user_config_file)
            }
        };
        let mut config = match path {
            Some(p) => Self::from_file(&p)?,
            None => {
                debug!("no config file found, using defaults");
                let cwd = std::env::current_dir().context("reading current directory")?;
                let mut config = Self::default();
                config.resolve_paths(&cwd);
                config
            }
        };
        config.apply_env(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.resolve_paths(&base);
        config.source = Some(path.to_path_buf());
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.name.trim().is_empty() {
            bail!("cluster.name must not be empty");
        }
        match self.discovery.method {
            DiscoveryMethod::Terraform => {
                if self.discovery.terraform.working_dir.as_os_str().is_empty() {
                    bail!("discovery.terraform.working_dir must not be empty");
                }
            }
            DiscoveryMethod::Static => {
                if self.discovery.static_nodes.servers.is_empty() {
                    bail!("discovery.static.servers must list at least one server");
                }
            }
        }
        if self.ssh.user.trim().is_empty() {
            bail!("ssh.user must not be empty");
        }
        if self.ssh.key_path.as_os_str().is_empty() {
            bail!("ssh.key_path must not be empty");
        }
        if self.api.port == 0 {
            bail!("api.port must not be 0");
        }
        if !matches!(self.api.scheme.as_str(), "http" | "https") {
            bail!("api.scheme must be http or https, got {:?}", self.api.scheme);
        }
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(user) = lookup(ENV_SSH_USER).filter(|v| !v.is_empty()) {
            self.ssh.user = user;
        }
        if let Some(key) = lookup(ENV_SSH_KEY).filter(|v| !v.is_empty()) {
            self.ssh.key_path = expand_tilde(Path::new(&key));
        }
        if let Some(port) = lookup(ENV_SSH_PORT) {
            self.ssh.port = port
                .parse()
                .with_context(|| format!("{ENV_SSH_PORT}: expected a port, got {port:?}"))?;
        }
        if let Some(port) = lookup(ENV_API_PORT) {
            self.api.port = port
                .parse()
                .with_context(|| format!("{ENV_API_PORT}: expected a port, got {port:?}"))?;
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            let p = expand_tilde(p);
            if p.is_absolute() { p } else { base.join(p) }
        };
        self.discovery.terraform.working_dir = resolve(&self.discovery.terraform.working_dir);
        self.ssh.key_path = resolve(&self.ssh.key_path);
        self.scenarios.search_paths = self.scenarios.search_paths.iter().map(|p| resolve(p)).collect();
        self.state.path = resolve(&self.state.path);
    }
}

/// Walk from `start` up to the filesystem root looking for a config file.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

fn user_config_file() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "chaos")?;
    let path = dirs.config_dir().join("chaos.toml");
    path.is_file().then_some(path)
}

fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}
