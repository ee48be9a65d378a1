//! Tool discovery: lists every configured server's tools, exposes them under
//! unique function names and remembers which server owns each name.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::join_all;
use mcp_client::{McpClientTrait, PoolKey, ServerConfig, ToolClientPool};
use rmcp::model::Tool;
use serde_json::Value;

use super::names::NameAllocator;
use crate::providers::ToolDefinition;

/// Upper bound on `tools/list` pages fetched from one server.
const MAX_LIST_PAGES: usize = 32;

/// Where a function name exposed to the model is actually served.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolMapping {
    pub server: ServerConfig,
    pub tool_name: String,
}

/// The function definitions offered in one turn, with their routing table.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    definitions: Vec<ToolDefinition>,
    mapping: HashMap<String, ToolMapping>,
}

impl ToolCatalog {
    /// Build a catalog from per-server listings, in server order.
    pub fn from_listings(listings: Vec<(ServerConfig, Vec<Tool>)>) -> Self {
        let mut names = NameAllocator::new();
        let mut catalog = ToolCatalog::default();
        for (server, tools) in listings {
            for tool in tools {
                let name = names.allocate(&tool.name, &server.name);
                catalog.definitions.push(ToolDefinition {
                    name: name.clone(),
                    description: tool.description.as_deref().unwrap_or_default().to_string(),
                    parameters: Value::Object(tool.input_schema.as_ref().clone()),
                });
                catalog.mapping.insert(
                    name,
                    ToolMapping {
                        server: server.clone(),
                        tool_name: tool.name.to_string(),
                    },
                );
            }
        }
        catalog
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn resolve(&self, function_name: &str) -> Option<&ToolMapping> {
        self.mapping.get(function_name)
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}

/// Tool listings by connection key, reused until they are older than the TTL.
#[derive(Debug)]
pub struct ToolListCache {
    ttl: Duration,
    entries: Mutex<HashMap<PoolKey, (Instant, Vec<Tool>)>>,
}

impl ToolListCache {
    pub fn new(ttl: Duration) -> Self {
        ToolListCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &PoolKey) -> Option<Vec<Tool>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, tools)| tools.clone())
    }

    pub fn insert(&self, key: PoolKey, tools: Vec<Tool>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, (Instant::now(), tools));
    }

    /// Drop every cached listing, e.g. after the server configuration changed.
    pub fn invalidate(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }
}

async fn list_all(client: &dyn McpClientTrait) -> Result<Vec<Tool>, mcp_client::Error> {
    let mut tools = Vec::new();
    let mut cursor = None;
    for _ in 0..MAX_LIST_PAGES {
        let page = client.list_tools(cursor).await?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }
    tracing::warn!("tool listing exceeded {} pages, truncating", MAX_LIST_PAGES);
    Ok(tools)
}

/// List one server's tools through the pool, retrying once on a fresh
/// connection when the pooled one turns out to be closed.
pub async fn list_server_tools(
    pool: &ToolClientPool,
    server: &ServerConfig,
) -> anyhow::Result<Vec<Tool>> {
    let mut retried = false;
    loop {
        let client = pool.get(server).await?;
        match list_all(client.as_ref()).await {
            Ok(tools) => return Ok(tools),
            Err(e) if e.is_connection_closed() && !retried => {
                tracing::debug!(server = %server.name, "connection closed while listing tools, reconnecting");
                if let Some(stale) = pool.evict(server) {
                    if let Err(e) = stale.close().await {
                        tracing::debug!(server = %server.name, "closing evicted client failed: {}", e);
                    }
                }
                retried = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Collect the catalog for a turn. Servers that fail to list are skipped so one
/// broken server does not disable the others.
#[tracing::instrument(skip_all, fields(servers = servers.len()))]
pub async fn build_catalog(
    pool: &ToolClientPool,
    cache: &ToolListCache,
    servers: &[ServerConfig],
) -> ToolCatalog {
    let listings = join_all(servers.iter().map(|server| async move {
        let key = server.key();
        if let Some(tools) = cache.get(&key) {
            return Some((server.clone(), tools));
        }
        match list_server_tools(pool, server).await {
            Ok(tools) => {
                cache.insert(key, tools.clone());
                Some((server.clone(), tools))
            }
            Err(e) => {
                tracing::warn!(server = %server.name, "failed to list tools: {:#}", e);
                None
            }
        }
    }))
    .await;

    let catalog = ToolCatalog::from_listings(listings.into_iter().flatten().collect());
    tracing::debug!(tools = catalog.len(), "tool catalog ready");
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::object;

    fn tool(name: &'static str) -> Tool {
        Tool::new(name, format!("{} things", name), object!({"type": "object"}))
    }

    #[test]
    fn test_catalog_maps_disambiguated_names_back() {
        let web = ServerConfig::new("web", "http://web.local/mcp");
        let docs = ServerConfig::new("docs", "http://docs.local/mcp");
        let catalog = ToolCatalog::from_listings(vec![
            (web.clone(), vec![tool("search"), tool("fetch.page")]),
            (docs.clone(), vec![tool("search")]),
        ]);

        let names: Vec<_> = catalog.definitions().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["search", "fetch_page", "search_docs"]);
        assert_eq!(catalog.resolve("search").unwrap().server, web);
        assert_eq!(catalog.resolve("fetch_page").unwrap().tool_name, "fetch.page");
        let mapped = catalog.resolve("search_docs").unwrap();
        assert_eq!(mapped.server, docs);
        assert_eq!(mapped.tool_name, "search");
        assert!(catalog.resolve("unknown").is_none());
    }

    #[test]
    fn test_cache_ttl_and_invalidate() {
        let key = ServerConfig::new("web", "http://web.local/mcp").key();

        let cache = ToolListCache::new(Duration::from_secs(60));
        cache.insert(key.clone(), vec![tool("search")]);
        assert_eq!(cache.get(&key).map(|t| t.len()), Some(1));
        cache.invalidate();
        assert!(cache.get(&key).is_none());

        let expired = ToolListCache::new(Duration::ZERO);
        expired.insert(key.clone(), vec![tool("search")]);
        assert!(expired.get(&key).is_none());
    }
}
