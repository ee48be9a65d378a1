use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub description: String,
    pub primary_model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

impl Route {
    /// The primary model followed by the fallbacks, without repeats.
    pub fn candidates(&self) -> Vec<String> {
        let mut candidates = vec![self.primary_model.clone()];
        for model in &self.fallback_models {
            if !candidates.contains(model) {
                candidates.push(model.clone());
            }
        }
        candidates
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read routing policy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("routing policy is not a JSON array of routes: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("route #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("route `{0}` is defined more than once")]
    DuplicateRoute(String),
    #[error("no routing policy is configured")]
    NotConfigured,
}

#[derive(Deserialize)]
struct RawRoute {
    name: Option<String>,
    description: Option<String>,
    primary_model: Option<String>,
    #[serde(default)]
    fallback_models: Option<Vec<String>>,
}

fn required(value: Option<String>, index: usize, field: &'static str) -> Result<String, PolicyError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(PolicyError::MissingField { index, field })
}

/// A validated set of routes. Names are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutePolicy {
    routes: Vec<Route>,
    by_name: HashMap<String, usize>,
}

impl RoutePolicy {
    pub fn from_routes(routes: Vec<Route>) -> Result<Self, PolicyError> {
        let mut by_name = HashMap::with_capacity(routes.len());
        for (index, route) in routes.iter().enumerate() {
            if by_name.insert(route.name.clone(), index).is_some() {
                return Err(PolicyError::DuplicateRoute(route.name.clone()));
            }
        }
        Ok(RoutePolicy { routes, by_name })
    }

    /// Parse and validate a policy document. Any incomplete or duplicate entry
    /// rejects the whole document.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let raw: Vec<RawRoute> = serde_json::from_str(json)?;
        let routes = raw
            .into_iter()
            .enumerate()
            .map(|(index, r)| {
                Ok(Route {
                    name: required(r.name, index, "name")?,
                    description: required(r.description, index, "description")?,
                    primary_model: required(r.primary_model, index, "primary_model")?,
                    fallback_models: r
                        .fallback_models
                        .unwrap_or_default()
                        .into_iter()
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;
        Self::from_routes(routes)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let json = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn get(&self, name: &str) -> Option<&Route> {
        self.by_name.get(name).map(|&i| &self.routes[i])
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The active policy. Readers take a snapshot; a reload swaps the whole table
/// at once and leaves the old one in place when the new document is invalid.
#[derive(Debug)]
pub struct PolicyStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<RoutePolicy>>,
}

impl PolicyStore {
    pub fn new(policy: RoutePolicy) -> Self {
        PolicyStore {
            path: None,
            current: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn from_path<P: Into<PathBuf>>(path: P) -> Result<Self, PolicyError> {
        let path = path.into();
        let policy = RoutePolicy::load(&path)?;
        tracing::info!(path = %path.display(), routes = policy.routes().len(), "loaded routing policy");
        Ok(PolicyStore {
            path: Some(path),
            current: RwLock::new(Arc::new(policy)),
        })
    }

    pub fn snapshot(&self) -> Arc<RoutePolicy> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, policy: RoutePolicy) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
    }

    /// Re-read the policy file this store was loaded from.
    pub fn reload(&self) -> Result<(), PolicyError> {
        let path = self.path.as_ref().ok_or(PolicyError::NotConfigured)?;
        let policy = RoutePolicy::load(path)?;
        tracing::info!(path = %path.display(), routes = policy.routes().len(), "reloaded routing policy");
        self.replace(policy);
        Ok(())
    }
}
