//! Resource Manager
//!
//! The facade a policy run holds. [`QueryResourceManager`] orchestrates
//! cache lookup, source enumeration, augmentation, filtering and the
//! resource-limit circuit breaker.

use super::cache::CacheKey;
use super::registry::{ResourceKind, ResourceType};
use super::source::{Source, DESCRIBE, DESCRIBE_CHILD};
use crate::error::{Error, LimitKind, ResourceLimitExceeded, Result};
use crate::filters::Filter;
use crate::policy::ExecutionContext;
use crate::provider::{Params, ProviderClient};
use crate::retry::{Retry, Sleeper};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Default fan-out workers per call site
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Default records per augmentation chunk
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// State shared by a manager, its source and its filters
pub struct ManagerCore {
    ctx: Arc<ExecutionContext>,
    kind: Arc<ResourceKind>,
    retry: Option<Retry>,
    max_workers: usize,
    chunk_size: usize,
}

impl ManagerCore {
    /// Core with the descriptor's retry codes (or the service defaults)
    pub fn new(ctx: Arc<ExecutionContext>, kind: Arc<ResourceKind>) -> Self {
        let rt = &kind.resource_type;
        let codes = match &rt.retry_codes {
            Some(codes) => codes.clone(),
            None => ctx
                .registry
                .services()
                .get(&rt.service)
                .cloned()
                .unwrap_or_default()
                .throttling_codes(),
        };
        let retry = Retry::new(codes).with_sleeper(ctx.sleeper.clone());

        Self {
            ctx,
            kind,
            retry: Some(retry),
            max_workers: DEFAULT_MAX_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Replace (or disable) the retry policy
    pub fn with_retry(mut self, retry: Option<Retry>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn ctx(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &str {
        &self.kind.name
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.kind.resource_type
    }

    pub fn retry(&self) -> Option<&Retry> {
        self.retry.as_ref()
    }

    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.ctx.sleeper.clone()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn region(&self) -> &str {
        &self.ctx.region
    }

    pub fn account_id(&self) -> &str {
        &self.ctx.account_id
    }

    /// Client for `service` in the run's region
    pub fn client(&self, service: &str) -> Result<Arc<dyn ProviderClient>> {
        self.client_in(service, &self.ctx.region)
    }

    pub fn client_in(&self, service: &str, region: &str) -> Result<Arc<dyn ProviderClient>> {
        self.ctx.session.client(service, region)
    }

    /// Nested manager for another kind (never checks resource limits)
    pub fn get_resource_manager(&self, kind: &str) -> Result<QueryResourceManager> {
        let kind = self.ctx.registry.get(kind)?;
        let core = ManagerCore::new(self.ctx.clone(), kind);
        QueryResourceManager::new(Arc::new(core), None)
    }

    pub fn cache_key(&self, query: Option<&Params>) -> CacheKey {
        CacheKey {
            account: self.ctx.account_id.clone(),
            region: self.ctx.region.clone(),
            resource: self.kind.name.clone(),
            query: query.map(|q| Value::Object(q.clone())),
        }
    }

    /// Ids shaped like this kind's identifiers
    pub fn match_ids(&self, ids: &[String]) -> Vec<String> {
        match &self.resource_type().id_prefix {
            Some(prefix) => ids.iter().filter(|i| i.starts_with(prefix.as_str())).cloned().collect(),
            None => ids.to_vec(),
        }
    }

    /// Global identifier of one record
    pub fn get_arn(&self, record: &Value) -> Option<String> {
        let rt = self.resource_type();
        if let Some(arn_field) = &rt.arn {
            if let Some(arn) = record.get(arn_field).and_then(|v| v.as_str()) {
                return Some(arn.to_string());
            }
        }
        let id = rt.record_id(record)?;
        if id.starts_with("arn") {
            return Some(id);
        }
        Some(self.generate_arn(&id))
    }

    /// Global identifiers of `resources`, skipping records without one
    pub fn get_arns(&self, resources: &[Value]) -> Vec<String> {
        resources.iter().filter_map(|r| self.get_arn(r)).collect()
    }

    /// Build an identifier for a resource id of this kind
    pub fn generate_arn(&self, id: &str) -> String {
        let rt = self.resource_type();
        let region = if rt.global_resource { "" } else { self.region() };
        generate_arn(&rt.service, id, region, self.account_id(), rt.arn_type.as_deref())
    }
}

fn partition(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

/// `arn:{partition}:{service}:{region}:{account}:{type}/{id}`
pub fn generate_arn(service: &str, id: &str, region: &str, account_id: &str, resource_type: Option<&str>) -> String {
    let base = format!("arn:{}:{}:{}:{}:", partition(region), service, region, account_id);
    match resource_type {
        Some(t) if id.starts_with('/') => format!("{}{}{}", base, t, id),
        Some(t) => format!("{}{}/{}", base, t, id),
        None => format!("{}{}", base, id),
    }
}

/// Abort when a selection exceeds the policy's limits
///
/// A percent limit of zero is treated as unset.
pub fn check_resource_limit(
    policy: &str,
    max_resources: Option<u64>,
    max_resources_percent: Option<f64>,
    selection_count: usize,
    population_count: usize,
) -> std::result::Result<(), ResourceLimitExceeded> {
    let exceeded = |limit| ResourceLimitExceeded {
        policy: policy.to_string(),
        limit,
        selection_count,
        population_count,
    };

    if let Some(max) = max_resources {
        if selection_count as u64 > max {
            return Err(exceeded(LimitKind::MaxResources(max)));
        }
    }
    if let Some(percent) = max_resources_percent.filter(|p| *p > 0.0) {
        if selection_count as f64 > population_count as f64 * (percent / 100.0) {
            return Err(exceeded(LimitKind::MaxPercent(percent)));
        }
    }
    Ok(())
}

/// Result of one selection pass
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub resources: Vec<Value>,
    /// Augmented, pre-filter collection size
    pub population: usize,
}

/// Manager for one resource kind within a run
pub struct QueryResourceManager {
    core: Arc<ManagerCore>,
    source: Box<dyn Source>,
    filters: Vec<Box<dyn Filter>>,
    top_level: bool,
}

impl QueryResourceManager {
    /// Manager using the named source (default `describe`)
    ///
    /// Kinds with a parent link run `describe` as `describe-child`.
    pub fn new(core: Arc<ManagerCore>, source: Option<&str>) -> Result<Self> {
        let mut source_type = source.unwrap_or(DESCRIBE);
        if source_type == DESCRIBE && core.resource_type().parent_spec.is_some() {
            source_type = DESCRIBE_CHILD;
        }
        let factory = core.ctx().registry.sources().get(source_type)?;
        let source = factory(core.clone());

        Ok(Self {
            core,
            source,
            filters: Vec::new(),
            top_level: false,
        })
    }

    pub fn with_filters(mut self, filters: Vec<Box<dyn Filter>>) -> Self {
        self.filters = filters;
        self
    }

    /// Mark as the policy's own manager; enables the circuit breaker
    pub fn top_level(mut self) -> Self {
        self.top_level = true;
        self
    }

    pub fn core(&self) -> &Arc<ManagerCore> {
        &self.core
    }

    pub fn source_type(&self) -> &'static str {
        self.source.source_type()
    }

    /// Cached or freshly enumerated collection, before filtering
    ///
    /// Only fully augmented collections are written to the cache.
    pub async fn population(&self, query: Option<&Params>, augment: bool) -> Result<Vec<Value>> {
        let cache = &self.core.ctx().cache;
        let key = self.core.cache_key(query);

        if cache.load() {
            if let Some(resources) = cache.get(&key) {
                tracing::debug!("Using cached {}: {}", self.core.kind_name(), resources.len());
                return Ok(resources);
            }
        }

        let resources = self.source.resources(query.cloned().unwrap_or_default()).await?;
        if !augment {
            return Ok(resources);
        }
        let resources = self.source.augment(resources).await?;

        if let Err(e) = cache.save(&key, &resources) {
            tracing::warn!("failed to cache {}: {}", self.core.kind_name(), e);
        }
        Ok(resources)
    }

    /// Population and filtered selection
    pub async fn select(&self, query: Option<&Params>) -> Result<Selection> {
        let mut resources = self.population(query, true).await?;
        let population = resources.len();

        for filter in &self.filters {
            resources = filter.process(&self.core, resources).await?;
        }

        tracing::debug!(
            "{}: selected {} of {} resources",
            self.core.kind_name(),
            resources.len(),
            population
        );

        if self.top_level {
            let policy = &self.core.ctx().policy;
            check_resource_limit(
                &policy.name,
                policy.max_resources,
                policy.max_resources_percent,
                resources.len(),
                population,
            )
            .inspect_err(|e| tracing::error!("{}", e))?;
        }

        Ok(Selection { resources, population })
    }

    /// Filtered resources
    pub async fn resources(&self, query: Option<&Params>) -> Result<Vec<Value>> {
        Ok(self.select(query).await?.resources)
    }

    /// Resolve resources by identity
    ///
    /// Provider failures degrade to an empty result.
    pub async fn get_resources(&self, ids: &[String], cache: bool, augment: bool) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if cache {
            if let Some(resources) = self.cached_resources(ids) {
                return Ok(resources);
            }
        }

        let resolved: Result<Vec<Value>> = async {
            let resources = self.source.get_resources(ids).await?;
            if augment {
                self.source.augment(resources).await
            } else {
                Ok(resources)
            }
        }
        .await;

        match resolved {
            Err(Error::Provider(e)) => {
                tracing::warn!("event ids not resolved: {:?} error:{}", ids, e);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn cached_resources(&self, ids: &[String]) -> Option<Vec<Value>> {
        let cache = &self.core.ctx().cache;
        if !cache.load() {
            return None;
        }
        let resources = cache.get(&self.core.cache_key(None))?;
        tracing::debug!("Using cached results for get_resources");

        let wanted: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        let rt = self.core.resource_type();
        Some(
            resources
                .into_iter()
                .filter(|r| rt.record_id(r).is_some_and(|id| wanted.contains(id.as_str())))
                .collect(),
        )
    }

    /// Source permissions plus the descriptor's extras
    pub fn permissions(&self) -> Vec<String> {
        let mut perms = self.source.permissions();
        perms.extend(self.core.resource_type().permissions.iter().cloned());
        perms
    }
}
