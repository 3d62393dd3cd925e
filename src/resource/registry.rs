//! Resource Registry - Load resource type descriptors from JSON
//!
//! Descriptors are loaded from embedded JSON catalogs (plus any user catalog
//! files) and assembled into [`ResourceKind`]s, each with its own filter and
//! action registries derived from the descriptor's capability flags.

use super::source::{default_sources, SourceRegistry};
use crate::actions::{self, ActionRegistry};
use crate::error::{Error, Result};
use crate::filters::{self, FilterRegistry};
use crate::provider::{Params, ServiceModel};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Embedded catalog files (compiled into the binary)
const CATALOG_FILES: &[&str] = &[
    include_str!("../resources/compute.json"),
    include_str!("../resources/security.json"),
    include_str!("../resources/management.json"),
];

/// Enumeration operation for a resource kind
#[derive(Debug, Clone, Deserialize)]
pub struct EnumSpec {
    pub operation: String,
    /// Result path projecting records out of the response
    #[serde(default)]
    pub path: Option<String>,
    /// Static parameters merged into every enumeration call
    #[serde(default)]
    pub extra_args: Option<Params>,
}

/// Detail call used to augment enumerated records
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum DetailSpec {
    /// One call per record
    Scalar {
        operation: String,
        param_name: String,
        #[serde(default)]
        param_key: Option<String>,
        #[serde(default)]
        path: Option<String>,
    },
    /// One call per chunk of records
    Batch {
        operation: String,
        param_name: String,
        #[serde(default)]
        param_key: Option<String>,
        path: String,
        #[serde(default)]
        args: Option<Params>,
        #[serde(default)]
        batch_size: Option<usize>,
    },
}

impl DetailSpec {
    pub fn operation(&self) -> &str {
        match self {
            DetailSpec::Scalar { operation, .. } | DetailSpec::Batch { operation, .. } => operation,
        }
    }
}

/// Link from a child kind to the kind it is enumerated under
#[derive(Debug, Clone, Deserialize)]
pub struct ParentSpec {
    /// Parent resource kind name
    pub kind: String,
    /// Parameter carrying the parent identity
    pub key: String,
    /// Stamp each child with its parent id
    #[serde(default)]
    pub annotate: bool,
}

/// Shape of records returned by the enumeration call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityShape {
    /// Mappings carrying the identity field
    #[default]
    Structured,
    /// Bare identifier strings
    Raw,
}

/// Server-side identity filter parameter form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerFilter {
    Scalar,
    List,
}

fn default_true() -> bool {
    true
}

/// Static description of one resource kind
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceType {
    pub service: String,
    pub enum_spec: EnumSpec,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    /// Field holding the global identifier
    #[serde(default)]
    pub arn: Option<String>,
    /// Resource segment used when generating identifiers
    #[serde(default)]
    pub arn_type: Option<String>,
    #[serde(default)]
    pub detail_spec: Option<DetailSpec>,
    #[serde(default)]
    pub filter_name: Option<String>,
    #[serde(default)]
    pub filter_type: Option<ServerFilter>,
    #[serde(default)]
    pub parent_spec: Option<ParentSpec>,
    #[serde(default)]
    pub id_prefix: Option<String>,
    #[serde(default)]
    pub identity: IdentityShape,
    #[serde(default)]
    pub config_type: Option<String>,
    #[serde(default)]
    pub dimension: Option<String>,
    #[serde(default = "default_true")]
    pub taggable: bool,
    #[serde(default)]
    pub universal_taggable: bool,
    #[serde(default)]
    pub tagging_type: Option<String>,
    #[serde(default)]
    pub global_resource: bool,
    /// Throttle codes overriding the manager default
    #[serde(default)]
    pub retry_codes: Option<Vec<String>>,
    /// Extra permissions required beyond the enumeration calls
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Capability flags consumed by [`assemble_kind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub metrics: bool,
    pub ec2_taggable: bool,
    pub universal_taggable: bool,
}

impl ResourceType {
    /// Check the descriptor is usable
    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidResourceType {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if self.enum_spec.operation.trim().is_empty() {
            return Err(invalid("empty enumeration operation"));
        }
        if self.id.trim().is_empty() {
            return Err(invalid("empty identity field"));
        }
        if self.filter_name.is_some() != self.filter_type.is_some() {
            return Err(invalid("filter_name and filter_type must be declared together"));
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            metrics: self.dimension.is_some(),
            ec2_taggable: self.service == "ec2" && self.taggable,
            universal_taggable: self.universal_taggable,
        }
    }

    /// Identity of a record, bare identifier or mapping
    pub fn record_id(&self, record: &Value) -> Option<String> {
        let value = match record {
            Value::String(s) => return Some(s.clone()),
            r => r.get(&self.id)?,
        };
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Type filter used against the tagging API
    pub fn tagging_resource_type(&self) -> String {
        if let Some(t) = &self.tagging_type {
            return t.clone();
        }
        match &self.arn_type {
            Some(t) if !t.is_empty() => format!("{}:{}", self.service, t),
            _ => self.service.clone(),
        }
    }
}

/// Convert an operation name to its API form
/// e.g., "describe_db_clusters" -> "DescribeDbClusters"
pub fn api_name(operation: &str) -> String {
    operation
        .split('_')
        .filter(|p| !p.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect()
}

/// Name -> factory map with typed lookup failures
pub struct PluginRegistry<F> {
    plugin_type: String,
    factories: BTreeMap<String, F>,
}

impl<F> PluginRegistry<F> {
    pub fn new(plugin_type: &str) -> Self {
        Self {
            plugin_type: plugin_type.to_string(),
            factories: BTreeMap::new(),
        }
    }

    pub fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    pub fn register(&mut self, name: &str, factory: F) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Result<&F> {
        self.factories
            .get(name)
            .ok_or_else(|| Error::not_registered(&self.plugin_type, name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|k| k.as_str())
    }
}

/// A registered resource kind
pub struct ResourceKind {
    pub name: String,
    pub resource_type: ResourceType,
    pub filters: FilterRegistry,
    pub actions: ActionRegistry,
}

/// Build a kind's filter and action registries from its capabilities
pub fn assemble_kind(name: &str, resource_type: ResourceType) -> Result<ResourceKind> {
    resource_type.validate(name)?;

    let mut filter_registry = FilterRegistry::new(&format!("{}.filters", name));
    let mut action_registry = ActionRegistry::new(&format!("{}.actions", name));
    filter_registry.register("value", filters::value_filter);

    let caps = resource_type.capabilities();
    if caps.metrics {
        filter_registry.register("metrics", filters::metrics_filter);
    }
    if caps.ec2_taggable {
        filters::register_tag_filters(&mut filter_registry);
        actions::register_ec2_tags(&mut action_registry);
    }
    if caps.universal_taggable {
        filters::register_tag_filters(&mut filter_registry);
        actions::register_universal_tags(&mut action_registry);
    }

    Ok(ResourceKind {
        name: name.to_string(),
        resource_type,
        filters: filter_registry,
        actions: action_registry,
    })
}

/// Root structure of resources/*.json
#[derive(Debug, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub services: HashMap<String, ServiceModel>,
    #[serde(default)]
    pub resources: HashMap<String, ResourceType>,
}

/// All resource kinds, service models and sources known to a process
pub struct Registry {
    kinds: BTreeMap<String, Arc<ResourceKind>>,
    services: HashMap<String, ServiceModel>,
    sources: SourceRegistry,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// An empty registry with the standard sources
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
            services: HashMap::new(),
            sources: default_sources(),
        }
    }

    /// Registry loaded from the embedded catalogs
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        for content in CATALOG_FILES {
            registry.load_catalog_str(content)?;
        }
        Ok(registry)
    }

    pub fn load_catalog_str(&mut self, content: &str) -> Result<()> {
        let catalog: Catalog = serde_json::from_str(content)?;
        self.load_catalog(catalog)
    }

    pub fn load_catalog_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.load_catalog_str(&content)
    }

    pub fn load_catalog(&mut self, catalog: Catalog) -> Result<()> {
        for (name, model) in catalog.services {
            self.register_service(&name, model);
        }
        for (name, resource_type) in catalog.resources {
            self.register(&name, resource_type)?;
        }
        Ok(())
    }

    /// Register one resource kind
    pub fn register(&mut self, name: &str, resource_type: ResourceType) -> Result<()> {
        let kind = assemble_kind(name, resource_type)?;
        tracing::debug!("registered resource kind {}", name);
        self.kinds.insert(name.to_string(), Arc::new(kind));
        Ok(())
    }

    /// Register or extend a service model
    pub fn register_service(&mut self, name: &str, model: ServiceModel) {
        let entry = self.services.entry(name.to_string()).or_default();
        entry.paginators.extend(model.paginators);
        entry.not_found.extend(model.not_found);
        entry.throttling.extend(model.throttling);
    }

    /// Look up a resource kind
    pub fn get(&self, kind: &str) -> Result<Arc<ResourceKind>> {
        self.kinds
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::not_registered("resources", kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(|k| k.as_str())
    }

    pub fn services(&self) -> &HashMap<String, ServiceModel> {
        &self.services
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }
}
