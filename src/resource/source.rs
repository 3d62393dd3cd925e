//! Source strategies
//!
//! A source decides how a manager obtains its population: live describe
//! calls (optionally fanned out per parent) or the config service's
//! recorded snapshots.

use super::augment::{detail_augment, universal_augment};
use super::manager::ManagerCore;
use super::pool::{chunks, TaskGroup};
use super::query::{call, invoke_enum, ChildResourceQuery, ResourceQuery};
use super::registry::{api_name, PluginRegistry};
use crate::error::{Error, Result};
use crate::provider::{Params, ProviderClient};
use crate::retry::Retry;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

pub const DESCRIBE: &str = "describe";
pub const DESCRIBE_CHILD: &str = "describe-child";
pub const CONFIG: &str = "config";

/// Enumeration and augmentation strategy for one manager
#[async_trait]
pub trait Source: Send + Sync {
    fn source_type(&self) -> &'static str;

    /// Enumerate raw records
    async fn resources(&self, query: Params) -> Result<Vec<Value>>;

    /// Fetch raw records by identity
    async fn get_resources(&self, ids: &[String]) -> Result<Vec<Value>>;

    /// Enrich raw records with detail
    async fn augment(&self, resources: Vec<Value>) -> Result<Vec<Value>>;

    /// Provider permissions this source needs
    fn permissions(&self) -> Vec<String>;
}

pub type SourceFactory = fn(Arc<ManagerCore>) -> Box<dyn Source>;
pub type SourceRegistry = PluginRegistry<SourceFactory>;

/// Registry of the built-in sources
pub fn default_sources() -> SourceRegistry {
    let mut registry = SourceRegistry::new("sources");
    registry.register(DESCRIBE, describe_source);
    registry.register(DESCRIBE_CHILD, describe_child_source);
    registry.register(CONFIG, config_source);
    registry
}

fn describe_source(core: Arc<ManagerCore>) -> Box<dyn Source> {
    Box::new(DescribeSource::new(core))
}

fn describe_child_source(core: Arc<ManagerCore>) -> Box<dyn Source> {
    Box::new(DescribeSource::child(core))
}

fn config_source(core: Arc<ManagerCore>) -> Box<dyn Source> {
    Box::new(ConfigSource::new(core))
}

enum Enumerator {
    Plain(ResourceQuery),
    Child(ChildResourceQuery),
}

/// Live enumeration through the describe/list APIs
pub struct DescribeSource {
    core: Arc<ManagerCore>,
    query: Enumerator,
}

impl DescribeSource {
    pub fn new(core: Arc<ManagerCore>) -> Self {
        Self {
            query: Enumerator::Plain(ResourceQuery::new(core.clone())),
            core,
        }
    }

    /// Describe bound to the per-parent query
    pub fn child(core: Arc<ManagerCore>) -> Self {
        Self {
            query: Enumerator::Child(ChildResourceQuery::new(core.clone())),
            core,
        }
    }
}

#[async_trait]
impl Source for DescribeSource {
    fn source_type(&self) -> &'static str {
        match self.query {
            Enumerator::Plain(_) => DESCRIBE,
            Enumerator::Child(_) => DESCRIBE_CHILD,
        }
    }

    async fn resources(&self, query: Params) -> Result<Vec<Value>> {
        match &self.query {
            Enumerator::Plain(q) => q.filter(query).await,
            Enumerator::Child(q) => q.filter(query).await,
        }
    }

    async fn get_resources(&self, ids: &[String]) -> Result<Vec<Value>> {
        match &self.query {
            Enumerator::Plain(q) => q.get(ids).await,
            Enumerator::Child(q) => q.get(ids).await,
        }
    }

    async fn augment(&self, resources: Vec<Value>) -> Result<Vec<Value>> {
        let resources = detail_augment(&self.core, resources).await?;
        if self.core.resource_type().universal_taggable {
            return universal_augment(&self.core, resources).await;
        }
        Ok(resources)
    }

    fn permissions(&self) -> Vec<String> {
        let rt = self.core.resource_type();
        let mut perms = vec![format!("{}:{}", rt.service, api_name(&rt.enum_spec.operation))];
        if let Some(detail) = &rt.detail_spec {
            perms.push(format!("{}:{}", rt.service, api_name(detail.operation())));
        }
        if rt.universal_taggable {
            perms.push("tag:GetResources".to_string());
        }
        perms
    }
}

/// Chunk size for config history lookups
const CONFIG_CHUNK_SIZE: usize = 50;

/// Worker count for config history lookups
const CONFIG_WORKERS: usize = 5;

/// Recorded configuration snapshots from the config service
pub struct ConfigSource {
    core: Arc<ManagerCore>,
    retry: Retry,
}

impl ConfigSource {
    pub fn new(core: Arc<ManagerCore>) -> Self {
        let retry = Retry::new(["ThrottlingException"]).with_sleeper(core.sleeper());
        Self { core, retry }
    }

    fn config_type(&self) -> Result<&str> {
        self.core
            .resource_type()
            .config_type
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("resource:{} does not support config source", self.core.kind_name())))
    }

    fn client(&self) -> Result<Arc<dyn ProviderClient>> {
        self.core.client(CONFIG)
    }

    /// Latest snapshot per id; ids with no history are dropped
    async fn load_history(&self, client: &dyn ProviderClient, config_type: &str, ids: Vec<String>) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        for id in ids {
            let mut params = Params::new();
            params.insert("resourceId".to_string(), Value::String(id.clone()));
            params.insert("resourceType".to_string(), Value::String(config_type.to_string()));
            params.insert("limit".to_string(), Value::from(1));

            let response = call(client, "get_resource_config_history", &params, Some(&self.retry)).await?;
            let Some(item) = response
                .get("configurationItems")
                .and_then(|v| v.as_array())
                .and_then(|items| items.first())
            else {
                tracing::debug!("no config history for {}", id);
                continue;
            };
            if let Some(resource) = load_resource(item)? {
                results.push(resource);
            }
        }
        Ok(results)
    }
}

/// Materialize a configuration item into a resource record
fn load_resource(item: &Value) -> Result<Option<Value>> {
    let config = match item.get("configuration") {
        Some(Value::String(raw)) => serde_json::from_str(raw)?,
        Some(Value::Null) | None => return Ok(None),
        Some(other) => other.clone(),
    };
    let mut resource = camel_resource(config);

    if let (Value::Object(map), Some(Value::Object(tags))) = (&mut resource, item.get("tags")) {
        if !map.contains_key("Tags") {
            let tags = tags
                .iter()
                .map(|(k, v)| {
                    let mut tag = Map::new();
                    tag.insert("Key".to_string(), Value::String(k.clone()));
                    tag.insert("Value".to_string(), v.clone());
                    Value::Object(tag)
                })
                .collect();
            map.insert("Tags".to_string(), Value::Array(tags));
        }
    }
    Ok(Some(resource))
}

/// Capitalize the first letter of every key, recursively
pub fn camel_resource(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, v)| {
                    let mut chars = key.chars();
                    let key = match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    };
                    (key, camel_resource(v))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(camel_resource).collect()),
        other => other,
    }
}

#[async_trait]
impl Source for ConfigSource {
    fn source_type(&self) -> &'static str {
        CONFIG
    }

    async fn resources(&self, _query: Params) -> Result<Vec<Value>> {
        let config_type = self.config_type()?;
        let client = self.client()?;

        let mut params = Params::new();
        params.insert("resourceType".to_string(), Value::String(config_type.to_string()));
        let identifiers = invoke_enum(
            client.as_ref(),
            "list_discovered_resources",
            &params,
            Some("resourceIdentifiers"),
            Some(&self.retry),
        )
        .await?;

        let ids: Vec<String> = identifiers
            .iter()
            .filter_map(|r| r.get("resourceId").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .collect();
        tracing::debug!("querying {} {} resources", ids.len(), self.core.kind_name());

        let group = TaskGroup::new(CONFIG_WORKERS);
        let results = group
            .run(chunks(&ids, CONFIG_CHUNK_SIZE), |set| {
                self.load_history(client.as_ref(), config_type, set)
            })
            .await;

        let mut resources = Vec::new();
        for result in results {
            match result {
                Ok(batch) => resources.extend(batch),
                Err(e) => tracing::error!("Exception getting resources from config: {}", e),
            }
        }
        Ok(resources)
    }

    async fn get_resources(&self, ids: &[String]) -> Result<Vec<Value>> {
        let config_type = self.config_type()?;
        let client = self.client()?;
        self.load_history(client.as_ref(), config_type, ids.to_vec()).await
    }

    async fn augment(&self, resources: Vec<Value>) -> Result<Vec<Value>> {
        Ok(resources)
    }

    fn permissions(&self) -> Vec<String> {
        vec![
            "config:GetResourceConfigHistory".to_string(),
            "config:ListDiscoveredResources".to_string(),
        ]
    }
}
