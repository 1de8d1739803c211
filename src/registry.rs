//! Read-only table of application definitions
//!
//! Built once from [`Config`] at startup and shared behind an `Arc`; nothing
//! here is mutated afterwards, so lookups take no locks.

use crate::config::Config;
use std::collections::{BTreeMap, HashMap};

/// Reserved path every managed app must serve for liveness probes
pub const HEARTBEAT_PATH: &str = "/_/heartbeat";

/// Path prefix reserved for management endpoints, never proxied
pub const INTERNAL_PATH_PREFIX: &str = "/_/";

/// Immutable definition of one managed application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    pub repository_url: String,
    pub branch: String,
    /// Webhook event names that may trigger a redeploy
    pub events: Vec<String>,
    pub build_command: Vec<String>,
    pub entry_command: Vec<String>,
    pub environment: HashMap<String, String>,
    pub listen_port: u16,
}

impl AppSpec {
    /// The git ref a push must carry to redeploy this app
    pub fn expected_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    /// Whether a webhook event of this type may redeploy the app
    pub fn tracks_event(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

/// Application definitions plus the host routing table
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: BTreeMap<String, AppSpec>,
    /// Lower-cased host -> app name
    hosts: HashMap<String, String>,
}

impl AppRegistry {
    pub fn new(apps: impl IntoIterator<Item = AppSpec>, hosts: HashMap<String, String>) -> Self {
        Self {
            apps: apps.into_iter().map(|a| (a.name.clone(), a)).collect(),
            hosts: hosts
                .into_iter()
                .map(|(host, name)| (host.to_lowercase(), name))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let apps = config.apps.iter().map(|(name, app)| AppSpec {
            name: name.clone(),
            repository_url: app.repo.clone(),
            branch: app.branch.clone(),
            events: app.events.clone(),
            build_command: app.build.clone(),
            entry_command: app.entry.clone(),
            environment: app.env.clone(),
            listen_port: app.port,
        });
        Self::new(apps, config.hosts.clone())
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&AppSpec> {
        self.apps.get(name)
    }

    /// Reverse lookup used for push events. Linear: fleets are small.
    pub fn lookup_by_repository_url(&self, url: &str) -> Option<&str> {
        self.apps
            .values()
            .find(|app| app.repository_url == url)
            .map(|app| app.name.as_str())
    }

    /// Resolve an already-normalized hostname to an app name
    pub fn resolve_host(&self, host: &str) -> Option<&str> {
        self.hosts.get(host).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn spec(name: &str, repo: &str, port: u16) -> AppSpec {
        AppSpec {
            name: name.to_string(),
            repository_url: repo.to_string(),
            branch: "main".to_string(),
            events: vec!["push".to_string()],
            build_command: Vec::new(),
            entry_command: vec!["./run".to_string()],
            environment: HashMap::new(),
            listen_port: port,
        }
    }

    fn create_test_registry() -> AppRegistry {
        let mut hosts = HashMap::new();
        hosts.insert("A.Example.com".to_string(), "api".to_string());
        hosts.insert("www.example.com".to_string(), "web".to_string());
        AppRegistry::new(
            vec![
                spec("api", "https://example.com/api.git", 9001),
                spec("web", "https://example.com/web.git", 9002),
            ],
            hosts,
        )
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = create_test_registry();
        assert_eq!(registry.lookup_by_name("api").unwrap().listen_port, 9001);
        assert!(registry.lookup_by_name("missing").is_none());
    }

    #[test]
    fn test_lookup_by_repository_url() {
        let registry = create_test_registry();
        assert_eq!(
            registry.lookup_by_repository_url("https://example.com/web.git"),
            Some("web")
        );
        assert_eq!(
            registry.lookup_by_repository_url("https://example.com/web"),
            None
        );
    }

    #[test]
    fn test_resolve_host_is_lowercased() {
        let registry = create_test_registry();
        assert_eq!(registry.resolve_host("a.example.com"), Some("api"));
        assert_eq!(registry.resolve_host("unknown.example.com"), None);
    }

    #[test]
    fn test_expected_ref_and_events() {
        let mut app = spec("x", "https://example.com/x.git", 9000);
        app.branch = "develop".to_string();
        assert_eq!(app.expected_ref(), "refs/heads/develop");
        assert!(app.tracks_event("push"));
        assert!(!app.tracks_event("ping"));
    }

    #[test]
    fn test_from_config() {
        let mut config: Config = toml::from_str(
            r#"
[server]
hook_port = 8090
proxy_port = 8080
"#,
        )
        .unwrap();
        config.apps.insert(
            "x".to_string(),
            AppConfig::new("https://example.com/x.git", 9000)
                .with_branch("develop")
                .with_build(&["make"])
                .with_entry(&["./x", "--serve"]),
        );
        config.hosts.insert("x.example.com".to_string(), "x".to_string());

        let registry = AppRegistry::from_config(&config);
        let app = registry.lookup_by_name("x").unwrap();
        assert_eq!(app.branch, "develop");
        assert_eq!(app.build_command, vec!["make"]);
        assert_eq!(app.entry_command, vec!["./x", "--serve"]);
        assert_eq!(registry.resolve_host("x.example.com"), Some("x"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["x"]);
        assert_eq!(registry.len(), 1);
    }
}
