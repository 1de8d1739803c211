//! Redeploy dispatcher
//!
//! Maps a GitHub push notification to the app it belongs to and asks the
//! deployer for a redeploy when the pushed ref is the app's tracked branch.
//!
//! Senders are not authenticated: anyone who can reach the webhook port can
//! trigger a redeploy of any configured app.

use crate::registry::AppRegistry;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// GitHub push event payload. Other fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct PushNotification {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub repository: PushRepository,
    /// Commit the ref now points to, for logging only
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub clone_url: String,
}

impl PushNotification {
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Result of asking for a redeploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A new redeploy was queued
    Scheduled,
    /// Merged into a redeploy that has not started yet
    Coalesced,
    /// No such app
    UnknownApp,
}

/// Something that can redeploy an app by name
pub trait RedeployTarget: Send + Sync {
    fn schedule_redeploy(&self, name: &str) -> ScheduleOutcome;
}

/// What the dispatcher did with a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    UnknownRepository,
    EventNotTracked,
    RefMismatch,
    Scheduled,
    Coalesced,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::UnknownRepository => "unknown repository",
            DispatchOutcome::EventNotTracked => "event not tracked",
            DispatchOutcome::RefMismatch => "ref not tracked",
            DispatchOutcome::Scheduled => "redeploy scheduled",
            DispatchOutcome::Coalesced => "redeploy already queued",
        }
    }
}

pub struct Dispatcher {
    apps: Arc<AppRegistry>,
    target: Arc<dyn RedeployTarget>,
}

impl Dispatcher {
    pub fn new(apps: Arc<AppRegistry>, target: Arc<dyn RedeployTarget>) -> Self {
        Self { apps, target }
    }

    pub fn on_push_notification(
        &self,
        event: &str,
        notification: &PushNotification,
    ) -> DispatchOutcome {
        let clone_url = notification.repository.clone_url.as_str();

        let Some(name) = self.apps.lookup_by_repository_url(clone_url) else {
            debug!(repo = clone_url, "Push for unknown repository");
            return DispatchOutcome::UnknownRepository;
        };
        let Some(app) = self.apps.lookup_by_name(name) else {
            return DispatchOutcome::UnknownRepository;
        };

        if !app.tracks_event(event) {
            debug!(app = name, event, "Event not tracked");
            return DispatchOutcome::EventNotTracked;
        }

        let expected = app.expected_ref();
        if notification.ref_name != expected {
            debug!(
                app = name,
                pushed = %notification.ref_name,
                expected = %expected,
                "Push to untracked ref"
            );
            return DispatchOutcome::RefMismatch;
        }

        info!(
            app = name,
            git_ref = %notification.ref_name,
            commit = notification.after.as_deref().unwrap_or("-"),
            "Push to tracked branch, redeploying"
        );

        match self.target.schedule_redeploy(name) {
            ScheduleOutcome::Scheduled => DispatchOutcome::Scheduled,
            ScheduleOutcome::Coalesced => DispatchOutcome::Coalesced,
            ScheduleOutcome::UnknownApp => DispatchOutcome::UnknownRepository,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::process::tests::test_spec;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records every requested redeploy instead of running it
    #[derive(Default)]
    pub(crate) struct RecordingTarget {
        pub calls: Mutex<Vec<String>>,
    }

    impl RedeployTarget for RecordingTarget {
        fn schedule_redeploy(&self, name: &str) -> ScheduleOutcome {
            self.calls.lock().push(name.to_string());
            ScheduleOutcome::Scheduled
        }
    }

    fn push(git_ref: &str, clone_url: &str) -> PushNotification {
        PushNotification {
            ref_name: git_ref.to_string(),
            repository: PushRepository {
                clone_url: clone_url.to_string(),
            },
            after: None,
        }
    }

    fn create_dispatcher(branch: &str) -> (Dispatcher, Arc<RecordingTarget>) {
        let mut app = test_spec("api", 5301, &["sleep", "60"]);
        app.branch = branch.to_string();
        let apps = Arc::new(AppRegistry::new(vec![app], HashMap::new()));
        let target = Arc::new(RecordingTarget::default());
        (Dispatcher::new(apps, target.clone()), target)
    }

    #[test]
    fn test_push_to_tracked_branch_redeploys_once() {
        let (dispatcher, target) = create_dispatcher("main");

        let outcome =
            dispatcher.on_push_notification("push", &push("refs/heads/main", "https://example.com/api.git"));

        assert_eq!(outcome, DispatchOutcome::Scheduled);
        assert_eq!(*target.calls.lock(), vec!["api".to_string()]);
    }

    #[test]
    fn test_push_to_other_branch_is_ignored() {
        let (dispatcher, target) = create_dispatcher("develop");

        let outcome =
            dispatcher.on_push_notification("push", &push("refs/heads/main", "https://example.com/api.git"));

        assert_eq!(outcome, DispatchOutcome::RefMismatch);
        assert!(target.calls.lock().is_empty());
    }

    #[test]
    fn test_ref_must_match_exactly() {
        let (dispatcher, target) = create_dispatcher("main");

        for git_ref in ["main", "refs/heads/main2", "refs/tags/main", "refs/heads/Main"] {
            let outcome = dispatcher
                .on_push_notification("push", &push(git_ref, "https://example.com/api.git"));
            assert_eq!(outcome, DispatchOutcome::RefMismatch, "ref {}", git_ref);
        }
        assert!(target.calls.lock().is_empty());
    }

    #[test]
    fn test_unknown_repository() {
        let (dispatcher, target) = create_dispatcher("main");

        let outcome = dispatcher
            .on_push_notification("push", &push("refs/heads/main", "https://example.com/other.git"));

        assert_eq!(outcome, DispatchOutcome::UnknownRepository);
        assert!(target.calls.lock().is_empty());
    }

    #[test]
    fn test_untracked_event() {
        let (dispatcher, target) = create_dispatcher("main");

        let outcome = dispatcher
            .on_push_notification("release", &push("refs/heads/main", "https://example.com/api.git"));

        assert_eq!(outcome, DispatchOutcome::EventNotTracked);
        assert!(target.calls.lock().is_empty());
    }

    #[test]
    fn test_parse_github_payload() {
        let payload = br#"{
            "ref": "refs/heads/main",
            "after": "0123abcd",
            "repository": {"clone_url": "https://example.com/api.git", "full_name": "acme/api"},
            "pusher": {"name": "dev"}
        }"#;

        let notification = PushNotification::from_slice(payload).unwrap();
        assert_eq!(notification.ref_name, "refs/heads/main");
        assert_eq!(notification.repository.clone_url, "https://example.com/api.git");
        assert_eq!(notification.after.as_deref(), Some("0123abcd"));

        assert!(PushNotification::from_slice(b"not json").is_err());
        assert!(PushNotification::from_slice(br#"{"ref": "refs/heads/main"}"#).is_err());
    }
}
