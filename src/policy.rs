//! Policy driver
//!
//! A thin driver over the resource layer: loads YAML policy documents,
//! validates them against the registry, and runs one policy at a time
//! (select, then act).

use crate::actions::{parse_action, Action};
use crate::error::{Error, Result};
use crate::filters::{parse_filter, Filter};
use crate::provider::{Params, SessionFactory};
use crate::resource::source::CONFIG;
use crate::resource::{Cache, ManagerCore, MemoryCache, QueryResourceManager, Registry, ResourceKind};
use crate::retry::{Sleeper, TokioSleeper};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// One policy as declared in a policy file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyData {
    pub name: String,
    pub resource: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub query: Option<Params>,
    #[serde(default)]
    pub filters: Vec<Value>,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub max_resources: Option<u64>,
    #[serde(default)]
    pub max_resources_percent: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<PolicyData>,
}

/// Parse a policy document; names must be unique
pub fn load_policies_str(content: &str) -> Result<Vec<PolicyData>> {
    let file: PolicyFile = serde_yaml::from_str(content)?;
    let mut seen = HashSet::new();
    for policy in &file.policies {
        if policy.name.is_empty() {
            return Err(Error::Validation("policy without a name".to_string()));
        }
        if !seen.insert(policy.name.as_str()) {
            return Err(Error::Validation(format!("duplicate policy name: {}", policy.name)));
        }
    }
    Ok(file.policies)
}

pub fn load_policies(path: &Path) -> Result<Vec<PolicyData>> {
    let content = std::fs::read_to_string(path)?;
    load_policies_str(&content)
}

/// Run-wide settings shared by every policy of one invocation
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub account_id: String,
    pub region: String,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            region: "us-east-1".to_string(),
            dry_run: false,
        }
    }
}

/// Everything a manager reads from the run it belongs to
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub account_id: String,
    pub region: String,
    pub dry_run: bool,
    pub policy: PolicyData,
    pub session: Arc<dyn SessionFactory>,
    pub cache: Arc<dyn Cache>,
    pub registry: Arc<Registry>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl ExecutionContext {
    /// Context with a run-scoped memory cache and real sleeps
    pub fn new(
        policy: PolicyData,
        options: &RunOptions,
        session: Arc<dyn SessionFactory>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            account_id: options.account_id.clone(),
            region: options.region.clone(),
            dry_run: options.dry_run,
            policy,
            session,
            cache: Arc::new(MemoryCache::new()),
            registry,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

/// Outcome of one policy run
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRun {
    pub policy: String,
    pub resource: String,
    pub execution_id: String,
    pub population: usize,
    pub selection: Vec<Value>,
    pub dry_run: bool,
}

pub struct Policy {
    ctx: Arc<ExecutionContext>,
}

impl Policy {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn ctx(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        &self.ctx.policy.name
    }

    fn kind(&self) -> Result<Arc<ResourceKind>> {
        self.ctx.registry.get(&self.ctx.policy.resource)
    }

    fn filters(&self, kind: &ResourceKind) -> Result<Vec<Box<dyn Filter>>> {
        self.ctx.policy.filters.iter().map(|f| parse_filter(kind, f)).collect()
    }

    fn actions(&self, kind: &ResourceKind) -> Result<Vec<Box<dyn Action>>> {
        self.ctx.policy.actions.iter().map(|a| parse_action(kind, a)).collect()
    }

    /// Check the policy against the registry without touching the provider
    pub fn validate(&self) -> Result<()> {
        let policy = &self.ctx.policy;
        let kind = self.kind()?;

        if let Some(source) = &policy.source {
            self.ctx.registry.sources().get(source)?;
            if source == CONFIG && kind.resource_type.config_type.is_none() {
                return Err(Error::Validation(format!(
                    "policy:{} resource:{} does not support config source",
                    policy.name, policy.resource
                )));
            }
        }
        if let Some(percent) = policy.max_resources_percent {
            if !(0.0..=100.0).contains(&percent) {
                return Err(Error::Validation(format!(
                    "policy:{} max-resources-percent must be between 0 and 100, got {}",
                    policy.name, percent
                )));
            }
        }

        self.filters(&kind)?;
        self.actions(&kind)?;
        Ok(())
    }

    /// The policy's own manager, with filters and the limit breaker
    pub fn resource_manager(&self) -> Result<QueryResourceManager> {
        let kind = self.kind()?;
        let filters = self.filters(&kind)?;
        let core = Arc::new(ManagerCore::new(self.ctx.clone(), kind));
        Ok(QueryResourceManager::new(core, self.ctx.policy.source.as_deref())?
            .with_filters(filters)
            .top_level())
    }

    pub async fn run(&self) -> Result<PolicyRun> {
        let span = tracing::info_span!(
            "policy",
            name = %self.name(),
            execution_id = %self.ctx.execution_id
        );
        self.execute().instrument(span).await
    }

    async fn execute(&self) -> Result<PolicyRun> {
        let policy = &self.ctx.policy;
        let kind = self.kind()?;
        let actions = self.actions(&kind)?;
        let manager = self.resource_manager()?;

        let selection = manager.select(policy.query.as_ref()).await?;
        tracing::info!(
            "policy:{} resource:{} region:{} count:{} population:{}",
            policy.name,
            policy.resource,
            self.ctx.region,
            selection.resources.len(),
            selection.population
        );

        if self.ctx.dry_run {
            tracing::info!("dry run, skipping {} actions", actions.len());
        } else if !selection.resources.is_empty() {
            for action in &actions {
                tracing::info!("policy:{} invoking action:{}", policy.name, action.name());
                action.process(manager.core(), &selection.resources).await?;
            }
        }

        Ok(PolicyRun {
            policy: policy.name.clone(),
            resource: policy.resource.clone(),
            execution_id: self.ctx.execution_id.to_string(),
            population: selection.population,
            selection: selection.resources,
            dry_run: self.ctx.dry_run,
        })
    }

    /// Every provider permission the policy may exercise
    pub fn permissions(&self) -> Result<BTreeSet<String>> {
        let kind = self.kind()?;
        let manager = self.resource_manager()?;

        let mut perms: BTreeSet<String> = manager.permissions().into_iter().collect();
        for filter in self.filters(&kind)? {
            perms.extend(filter.permissions());
        }
        for action in self.actions(&kind)? {
            perms.extend(action.permissions());
        }
        Ok(perms)
    }
}
