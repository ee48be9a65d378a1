//! Picks the models a turn is tried against.

pub mod arch;
pub mod policy;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use arch::{ArchClassifier, ArchSettings, ClassifierError};
pub use policy::{PolicyError, PolicyStore, Route, RoutePolicy};

use crate::message::Message;

pub const MULTIMODAL_ROUTE: &str = "multimodal";
pub const AGENTIC_ROUTE: &str = "agentic";
pub const DEFAULT_OTHER_ROUTE: &str = "casual_conversation";

/// A route name and the models to try for it, in order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResolution {
    pub route: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Route used when classification yields an unknown name.
    pub other_route: String,
    /// The only candidate when classification fails.
    pub fallback_model: String,
    pub multimodal_model: Option<String>,
    pub tools_model: Option<String>,
}

pub struct Router {
    policy: Arc<PolicyStore>,
    classifier: Option<ArchClassifier>,
    config: RouterConfig,
}

impl Router {
    pub fn new(policy: Arc<PolicyStore>, classifier: Option<ArchClassifier>, config: RouterConfig) -> Self {
        Router {
            policy,
            classifier,
            config,
        }
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn fallback(&self) -> RouteResolution {
        RouteResolution {
            route: self.config.other_route.clone(),
            candidates: vec![self.config.fallback_model.clone()],
        }
    }

    /// Candidates for a named route, falling back to the default route and then
    /// to the fallback model.
    pub fn candidates_for(&self, route: &str) -> RouteResolution {
        let policy = self.policy.snapshot();
        if let Some(found) = policy.get(route) {
            return RouteResolution {
                route: found.name.clone(),
                candidates: found.candidates(),
            };
        }
        debug!(%route, "unknown route, using {}", self.config.other_route);
        match policy.get(&self.config.other_route) {
            Some(other) => RouteResolution {
                route: other.name.clone(),
                candidates: other.candidates(),
            },
            None => self.fallback(),
        }
    }

    fn heuristic(&self, messages: &[Message], tools_active: bool) -> Option<RouteResolution> {
        if messages.iter().any(Message::has_images) {
            if let Some(route) = self.policy.snapshot().get(MULTIMODAL_ROUTE) {
                return Some(RouteResolution {
                    route: route.name.clone(),
                    candidates: route.candidates(),
                });
            }
            if let Some(model) = &self.config.multimodal_model {
                return Some(RouteResolution {
                    route: MULTIMODAL_ROUTE.to_string(),
                    candidates: vec![model.clone()],
                });
            }
        }

        if tools_active {
            if let Some(model) = &self.config.tools_model {
                return Some(RouteResolution {
                    route: AGENTIC_ROUTE.to_string(),
                    candidates: vec![model.clone()],
                });
            }
        }
        None
    }

    /// Decide the route for a conversation. Never fails: classification
    /// problems resolve to the fallback model.
    #[tracing::instrument(skip_all, fields(tools_active = tools_active))]
    pub async fn resolve(
        &self,
        messages: &[Message],
        tools_active: bool,
        cancel: &CancellationToken,
    ) -> RouteResolution {
        if let Some(resolution) = self.heuristic(messages, tools_active) {
            debug!(route = %resolution.route, "route chosen by heuristic");
            return resolution;
        }

        let Some(classifier) = &self.classifier else {
            return self.candidates_for(&self.config.other_route);
        };

        let policy = self.policy.snapshot();
        match classifier.classify(policy.routes(), messages, cancel).await {
            Ok(route) => {
                let resolution = self.candidates_for(&route);
                info!(classified = %route, route = %resolution.route, "route chosen by classifier");
                resolution
            }
            Err(ClassifierError::Cancelled) => {
                debug!("classification cancelled");
                self.fallback()
            }
            Err(e) => {
                warn!("route classification failed, using fallback model: {}", e);
                self.fallback()
            }
        }
    }
}
