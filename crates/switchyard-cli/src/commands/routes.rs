use std::path::Path;

use anyhow::{anyhow, Result};
use switchyard::router::{Route, RoutePolicy};
use switchyard::Gateway;
use tokio_util::sync::CancellationToken;

use super::run::load_request;

/// Route candidates that name models missing from `known`.
pub fn unknown_models<'a>(routes: &'a [Route], known: &[String]) -> Vec<(&'a str, &'a str)> {
    routes
        .iter()
        .flat_map(|route| {
            std::iter::once(&route.primary_model)
                .chain(&route.fallback_models)
                .filter(|model| !known.contains(model))
                .map(move |model| (route.name.as_str(), model.as_str()))
        })
        .collect()
}

pub fn handle_validate(path: &Path, known_models: &[String]) -> Result<()> {
    let policy = RoutePolicy::load(path)?;
    for route in policy.routes() {
        println!("{:<24} {}", route.name, route.candidates().join(" -> "));
    }

    if !known_models.is_empty() {
        let missing = unknown_models(policy.routes(), known_models);
        for (route, model) in &missing {
            eprintln!("route `{}` names unconfigured model `{}`", route, model);
        }
        if !missing.is_empty() {
            return Err(anyhow!("{} route candidate(s) are not configured", missing.len()));
        }
    }
    println!("{} route(s) OK", policy.routes().len());
    Ok(())
}

pub async fn handle_classify(gateway: &Gateway, file: &Path) -> Result<()> {
    let router = gateway
        .router()
        .ok_or_else(|| anyhow!("routing is not configured; set router_policy_path"))?;
    let request = load_request(file)?;
    let resolution = router
        .resolve(&request.messages, false, &CancellationToken::new())
        .await;
    println!("{}", serde_json::to_string_pretty(&resolution)?);
    Ok(())
}
