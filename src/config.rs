use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level daemon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and filesystem settings
    pub server: ServerConfig,

    /// Timing settings shared by every app
    #[serde(default)]
    pub defaults: Defaults,

    /// Managed applications keyed by name
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,

    /// Host header to application name
    #[serde(default)]
    pub hosts: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port receiving push webhooks
    pub hook_port: u16,

    /// Port receiving proxied traffic
    pub proxy_port: u16,

    /// Bind address for both listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Base directory holding one working copy per app and the `.log` directory
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// git executable used for clone/checkout/pull
    #[serde(default = "default_git")]
    pub git: String,

    /// Maximum idle upstream connections per app (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Defaults {
    /// Upper bound for the post-launch readiness wait
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// First readiness poll delay; doubles after every failed probe
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,

    /// Ceiling for the readiness poll delay
    #[serde(default = "default_startup_max_poll_interval")]
    pub startup_max_poll_interval_ms: u64,

    /// Interval of the background heartbeat
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Timeout of a single heartbeat probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Max time to wait for an upstream response when proxying
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            startup_poll_interval_ms: default_startup_poll_interval(),
            startup_max_poll_interval_ms: default_startup_max_poll_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            probe_timeout_ms: default_probe_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl Defaults {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }

    pub fn startup_max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_max_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Zero intervals would turn the probe loops into busy loops
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let nonzero = [
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("startup_poll_interval_ms", self.startup_poll_interval_ms),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                errors.push(format!("Defaults: '{}' must be greater than 0", field));
            }
        }

        if self.startup_max_poll_interval_ms < self.startup_poll_interval_ms {
            errors.push(
                "Defaults: 'startup_max_poll_interval_ms' must not be less than 'startup_poll_interval_ms'"
                    .to_string(),
            );
        }

        errors
    }
}

/// Configuration for a single managed application
///
/// # Security Warning
///
/// `build` and `entry` are executed as-is with the daemon's permissions, and
/// anyone able to push to `repo` controls what they run. Protect the config
/// file and the repositories accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Clone URL; must match `repository.clone_url` of incoming pushes
    pub repo: String,

    /// Tracked branch
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Webhook events allowed to trigger a redeploy. Only `push` is
    /// delivered; an empty list turns webhook redeploys off.
    #[serde(default = "default_events")]
    pub events: Vec<String>,

    /// Build command argv (empty: no build step)
    #[serde(default)]
    pub build: Vec<String>,

    /// Entry command argv
    #[serde(default)]
    pub entry: Vec<String>,

    /// Extra environment, wins over the daemon's own environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the app binds; also exported as `PORT`
    pub port: u16,
}

impl AppConfig {
    /// Create an app config tracking `main` with defaults
    pub fn new(repo: &str, port: u16) -> Self {
        Self {
            repo: repo.to_string(),
            branch: default_branch(),
            events: default_events(),
            build: Vec::new(),
            entry: Vec::new(),
            env: HashMap::new(),
            port,
        }
    }

    /// Set the tracked branch (builder pattern)
    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = branch.to_string();
        self
    }

    /// Set the build argv (builder pattern)
    pub fn with_build(mut self, build: &[&str]) -> Self {
        self.build = build.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the entry argv (builder pattern)
    pub fn with_entry(mut self, entry: &[&str]) -> Self {
        self.entry = entry.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Validate the app configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(format!(
                "App '{}': name must be a plain directory name",
                name
            ));
        }

        if self.repo.trim().is_empty() {
            return Err(format!("App '{}': 'repo' must not be empty", name));
        }

        if self.branch.trim().is_empty() {
            return Err(format!("App '{}': 'branch' must not be empty", name));
        }

        if let Some(event) = self.events.iter().find(|e| e.as_str() != "push") {
            return Err(format!(
                "App '{}': event '{}' is not supported, only 'push'",
                name, event
            ));
        }

        if self.entry.is_empty() || self.entry[0].is_empty() {
            return Err(format!("App '{}': 'entry' must name a command", name));
        }

        if !self.build.is_empty() && self.build[0].is_empty() {
            return Err(format!("App '{}': 'build' must name a command", name));
        }

        if self.port == 0 {
            return Err(format!("App '{}': 'port' must be greater than 0", name));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from(".tinyhook")
}

fn default_git() -> String {
    "git".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_events() -> Vec<String> {
    vec!["push".to_string()]
}

fn default_startup_timeout() -> u64 {
    300 // builds can leave slow first starts
}

fn default_startup_poll_interval() -> u64 {
    2000
}

fn default_startup_max_poll_interval() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.hook_port == 0 {
            errors.push("Server: 'hook_port' must be greater than 0".to_string());
        }
        if self.server.proxy_port == 0 {
            errors.push("Server: 'proxy_port' must be greater than 0".to_string());
        }
        if self.server.hook_port != 0 && self.server.hook_port == self.server.proxy_port {
            errors.push("Server: 'hook_port' and 'proxy_port' must differ".to_string());
        }

        errors.extend(self.defaults.validate());

        let mut repos: HashMap<&str, &str> = HashMap::new();
        let mut ports: HashMap<u16, &str> = HashMap::new();

        for (name, app) in &self.apps {
            if let Err(e) = app.validate(name) {
                errors.push(e);
            }

            if let Some(other) = repos.insert(app.repo.as_str(), name.as_str()) {
                errors.push(format!(
                    "App '{}': repo '{}' is already used by app '{}'",
                    name, app.repo, other
                ));
            }

            if app.port != 0 {
                if let Some(other) = ports.insert(app.port, name.as_str()) {
                    errors.push(format!(
                        "App '{}': port {} is already used by app '{}'",
                        name, app.port, other
                    ));
                }
            }
        }

        let mut hosts: Vec<(&String, &String)> = self.hosts.iter().collect();
        hosts.sort();
        for (host, name) in hosts {
            if !self.apps.contains_key(name) {
                errors.push(format!("Host '{}': unknown app '{}'", host, name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[server]
hook_port = 8090
proxy_port = 8080
bind = "127.0.0.1"
directory = "/srv/tinyhook"

[defaults]
startup_timeout_secs = 60
heartbeat_interval_secs = 10

[apps.api]
repo = "https://example.com/api.git"
branch = "main"
events = ["push"]
build = ["cargo", "build", "--release"]
entry = ["./target/release/api"]
port = 9001

[apps.api.env]
RUST_LOG = "info"

[apps.web]
repo = "https://example.com/web.git"
branch = "develop"
entry = ["node", "server.js"]
port = 9002

[hosts]
"a.example.com" = "api"
"www.example.com" = "web"
"#;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(FULL).unwrap();
        assert_eq!(config.server.hook_port, 8090);
        assert_eq!(config.server.proxy_port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.directory, PathBuf::from("/srv/tinyhook"));
        assert_eq!(config.defaults.startup_timeout_secs, 60);
        assert_eq!(config.apps.len(), 2);

        let api = &config.apps["api"];
        assert_eq!(api.build, vec!["cargo", "build", "--release"]);
        assert_eq!(api.env.get("RUST_LOG"), Some(&"info".to_string()));
        assert_eq!(config.hosts.get("a.example.com"), Some(&"api".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_settings() {
        let config: Config = toml::from_str(
            r#"
[server]
hook_port = 1
proxy_port = 2
"#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.directory, PathBuf::from(".tinyhook"));
        assert_eq!(config.server.git, "git");
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.server.pool_idle_timeout_secs, 90);
        assert!(config.apps.is_empty());
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_default_timings() {
        let defaults = Defaults::default();
        assert_eq!(defaults.startup_timeout(), Duration::from_secs(300));
        assert_eq!(defaults.startup_poll_interval(), Duration::from_millis(2000));
        assert_eq!(defaults.startup_max_poll_interval(), Duration::from_secs(30));
        assert_eq!(defaults.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(defaults.probe_timeout(), Duration::from_millis(2000));
        assert_eq!(defaults.request_timeout(), Duration::from_secs(30));
        assert_eq!(defaults.shutdown_grace_period(), Duration::from_secs(10));
    }

    #[test]
    fn test_app_defaults() {
        let app: AppConfig = toml::from_str(
            r#"
repo = "https://example.com/x.git"
entry = ["./x"]
port = 3000
"#,
        )
        .unwrap();

        assert_eq!(app.branch, "main");
        assert_eq!(app.events, vec!["push"]);
        assert!(app.build.is_empty());
        assert!(app.env.is_empty());
        assert!(app.validate("x").is_ok());
    }

    #[test]
    fn test_missing_server_section_is_an_error() {
        let result: Result<Config, _> = toml::from_str("[apps]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_entry() {
        let app = AppConfig::new("https://example.com/x.git", 3000);
        let err = app.validate("x").unwrap_err();
        assert!(err.contains("'entry' must name a command"));
    }

    #[test]
    fn test_validate_port_nonzero() {
        let app = AppConfig::new("https://example.com/x.git", 0).with_entry(&["./x"]);
        let err = app.validate("x").unwrap_err();
        assert!(err.contains("'port' must be greater than 0"));
    }

    #[test]
    fn test_validate_events() {
        let mut app = AppConfig::new("https://example.com/x.git", 3000).with_entry(&["./x"]);
        app.events = vec!["push".to_string(), "release".to_string()];
        let err = app.validate("x").unwrap_err();
        assert!(err.contains("event 'release' is not supported"));

        app.events.clear();
        assert!(app.validate("x").is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timings() {
        let mut config: Config = toml::from_str(FULL).unwrap();
        config.defaults = Defaults {
            startup_timeout_secs: 0,
            startup_poll_interval_ms: 0,
            startup_max_poll_interval_ms: 0,
            heartbeat_interval_secs: 0,
            probe_timeout_ms: 0,
            request_timeout_secs: 0,
            shutdown_grace_period_secs: 0,
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'startup_timeout_secs' must be greater than 0"));
        assert!(err.contains("'startup_poll_interval_ms' must be greater than 0"));
        assert!(err.contains("'heartbeat_interval_secs' must be greater than 0"));
        assert!(err.contains("'probe_timeout_ms' must be greater than 0"));
        assert!(err.contains("'request_timeout_secs' must be greater than 0"));
        // an immediate SIGKILL is a valid choice
        assert!(!err.contains("shutdown_grace_period_secs"));
    }

    #[test]
    fn test_validate_poll_ceiling_below_first_interval() {
        let mut config: Config = toml::from_str(FULL).unwrap();
        config.defaults.startup_poll_interval_ms = 5000;
        config.defaults.startup_max_poll_interval_ms = 1000;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'startup_max_poll_interval_ms' must not be less than"));

        config.defaults.startup_max_poll_interval_ms = 5000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_path_like_names() {
        let app = AppConfig::new("https://example.com/x.git", 3000).with_entry(&["./x"]);
        assert!(app.validate("../x").is_err());
        assert!(app.validate(".log").is_err());
        assert!(app.validate("").is_err());
    }

    #[test]
    fn test_validate_duplicate_repo_and_port() {
        let toml = r#"
[server]
hook_port = 8090
proxy_port = 8080

[apps.a]
repo = "https://example.com/same.git"
entry = ["./a"]
port = 9000

[apps.b]
repo = "https://example.com/same.git"
entry = ["./b"]
port = 9000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("repo 'https://example.com/same.git' is already used by app 'a'"));
        assert!(err.contains("port 9000 is already used by app 'a'"));
    }

    #[test]
    fn test_validate_unknown_host_target() {
        let toml = r#"
[server]
hook_port = 8090
proxy_port = 8080

[hosts]
"ghost.example.com" = "ghost"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Host 'ghost.example.com': unknown app 'ghost'"));
    }

    #[test]
    fn test_validate_listener_ports() {
        let toml = r#"
[server]
hook_port = 8080
proxy_port = 8080
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tinyhook.toml");
        std::fs::write(&path, FULL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.apps.len(), 2);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
