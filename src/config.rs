//! Engine configuration.
//!
//! One process-wide object wires the engine: the web base URL used in
//! published target links, the monitored projects and their pipeline
//! factories, optional canary filters, and the store connector the
//! supervisor calls on (re)connect.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::constants::RECONNECT_BACKOFF;
use crate::path::ProjectId;
use crate::path::TargetId;
use crate::path::TargetKind;
use crate::store::StoreResult;
use crate::store::TreeStore;
use crate::term::Term;

/// The pipelines of one target: job name to term.
pub type PipelineMap = BTreeMap<String, Term>;

/// Produces the pipeline map for each target of a project.
pub type PipelineFactory = Arc<dyn Fn(&TargetKind) -> PipelineMap + Send + Sync>;

/// Factory opening a connection to the tree store.
pub type StoreConnector =
    Arc<dyn Fn() -> BoxFuture<'static, StoreResult<Arc<dyn TreeStore>>> + Send + Sync>;

/// Process-wide engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    /// Base URL of the web UI, used for published status links.
    pub web_base_url: String,
    /// Optional per-project whitelist; targets outside it are dropped.
    pub canaries: Option<HashMap<ProjectId, HashSet<TargetKind>>>,
    /// Monitored projects and their pipeline factories.
    pub projects: BTreeMap<ProjectId, PipelineFactory>,
    /// Store connection factory.
    pub connector: StoreConnector,
    /// Backoff between reconnection attempts.
    pub reconnect_backoff: Duration,
}

impl EngineConfig {
    /// Configuration with no projects and the default backoff.
    pub fn new(web_base_url: impl Into<String>, connector: StoreConnector) -> Self {
        Self {
            web_base_url: web_base_url.into(),
            canaries: None,
            projects: BTreeMap::new(),
            connector,
            reconnect_backoff: RECONNECT_BACKOFF,
        }
    }

    /// Add a monitored project.
    pub fn with_project(mut self, project: ProjectId, pipelines: PipelineFactory) -> Self {
        self.projects.insert(project, pipelines);
        self
    }

    /// Restrict a project to a canary set of targets.
    pub fn with_canaries(mut self, project: ProjectId, targets: HashSet<TargetKind>) -> Self {
        self.canaries
            .get_or_insert_with(HashMap::new)
            .insert(project, targets);
        self
    }

    /// Shorten the reconnect backoff (tests).
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// The web URL published as a status target link.
    pub fn target_url(&self, target: &TargetId) -> String {
        let base = self.web_base_url.trim_end_matches('/');
        let project = &target.project;
        match &target.kind {
            TargetKind::Pr(number) => {
                format!("{base}/pr/{}/{}/{number}", project.user, project.repo)
            }
            TargetKind::Ref(name) => {
                format!("{base}/ref/{}/{}/{name}", project.user, project.repo)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::TreePath;
    use crate::store::MemoryStore;

    fn config() -> EngineConfig {
        let connector: StoreConnector =
            Arc::new(|| Box::pin(async { Ok(MemoryStore::new() as Arc<dyn TreeStore>) }));
        EngineConfig::new("https://ci.example.org/", connector)
    }

    #[test]
    fn test_target_urls() {
        let config = config();
        let project = ProjectId::new("foo", "bar").unwrap();
        assert_eq!(
            config.target_url(&TargetId {
                project: project.clone(),
                kind: TargetKind::Pr(7),
            }),
            "https://ci.example.org/pr/foo/bar/7"
        );
        assert_eq!(
            config.target_url(&TargetId {
                project,
                kind: TargetKind::Ref(TreePath::parse("heads/main").unwrap()),
            }),
            "https://ci.example.org/ref/foo/bar/heads/main"
        );
    }
}
