//! Resource Query - Enumerate resources through the provider client
//!
//! Handles paginated enumeration, server-side identity filters and the
//! per-parent fan-out used by child resource kinds.

use super::manager::ManagerCore;
use super::path::search_items;
use super::pool::TaskGroup;
use super::registry::{IdentityShape, ResourceType, ServerFilter};
use crate::error::{Error, Result};
use crate::provider::{PaginatorSpec, Params, ProviderClient, ProviderError};
use crate::retry::Retry;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Reserved field stamped on child records
pub const PARENT_ANNOTATION: &str = "custodia:parent-id";

/// Single provider call, retried when a policy is given
pub async fn call(
    client: &dyn ProviderClient,
    operation: &str,
    params: &Params,
    retry: Option<&Retry>,
) -> std::result::Result<Value, ProviderError> {
    match retry {
        Some(retry) => retry.call(|| client.invoke(operation, params)).await,
        None => client.invoke(operation, params).await,
    }
}

/// Fetch every page of `operation` and merge them into one response
///
/// Result key arrays are concatenated in page order; every other key is
/// taken from the first page.
pub async fn paginate(
    client: &dyn ProviderClient,
    operation: &str,
    spec: &PaginatorSpec,
    params: &Params,
    retry: Option<&Retry>,
) -> std::result::Result<Value, ProviderError> {
    let mut params = params.clone();
    let mut full: Option<Map<String, Value>> = None;
    let mut last_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = call(client, operation, &params, retry).await?;
        pages += 1;

        let next_token = page
            .get(&spec.output_token)
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string());

        merge_page(&mut full, page, spec);

        match next_token {
            Some(token) if last_token.as_deref() != Some(token.as_str()) => {
                params.insert(spec.input_token.clone(), Value::String(token.clone()));
                last_token = Some(token);
            }
            Some(token) => {
                tracing::warn!("{} returned the same page token twice ({}), stopping", operation, token);
                break;
            }
            None => break,
        }
    }

    tracing::debug!("{}.{}: fetched {} pages", client.service(), operation, pages);

    let mut full = full.unwrap_or_default();
    full.remove(&spec.output_token);
    Ok(Value::Object(full))
}

fn merge_page(full: &mut Option<Map<String, Value>>, page: Value, spec: &PaginatorSpec) {
    let Value::Object(page) = page else {
        return;
    };

    let Some(acc) = full.as_mut() else {
        *full = Some(page);
        return;
    };

    for (key, value) in page {
        let is_result = if spec.result_keys.is_empty() {
            value.is_array() && key != spec.output_token
        } else {
            spec.result_keys.contains(&key)
        };
        if !is_result {
            continue;
        }
        let Value::Array(items) = value else {
            continue;
        };
        match acc.get_mut(&key) {
            Some(Value::Array(existing)) => existing.extend(items),
            _ => {
                acc.insert(key, Value::Array(items));
            }
        }
    }
}

/// Invoke an enumeration operation and project its records
pub async fn invoke_enum(
    client: &dyn ProviderClient,
    operation: &str,
    params: &Params,
    path: Option<&str>,
    retry: Option<&Retry>,
) -> Result<Vec<Value>> {
    let response = match client.paginator(operation) {
        Some(spec) => paginate(client, operation, &spec, params, retry).await?,
        None => call(client, operation, params, retry).await?,
    };
    Ok(search_items(&response, path))
}

/// Descriptor extra arguments fill keys the caller left unset
fn merge_extra_args(resource_type: &ResourceType, mut params: Params) -> Params {
    if let Some(extra) = &resource_type.enum_spec.extra_args {
        for (key, value) in extra {
            params.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    params
}

/// Keep only records whose identity is in `ids`
pub fn match_identities(resource_type: &ResourceType, resources: Vec<Value>, ids: &[String]) -> Vec<Value> {
    let wanted: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
    resources
        .into_iter()
        .filter(|r| match resource_type.identity {
            IdentityShape::Raw => r.as_str().is_some_and(|s| wanted.contains(s)),
            IdentityShape::Structured => r
                .get(&resource_type.id)
                .and_then(|v| v.as_str())
                .is_some_and(|s| wanted.contains(s)),
        })
        .collect()
}

/// Enumeration for top-level resource kinds
pub struct ResourceQuery {
    core: Arc<ManagerCore>,
}

impl ResourceQuery {
    pub fn new(core: Arc<ManagerCore>) -> Self {
        Self { core }
    }

    /// Enumerate all resources matching `params`
    pub async fn filter(&self, params: Params) -> Result<Vec<Value>> {
        let rt = self.core.resource_type();
        let client = self.core.client(&rt.service)?;
        let params = merge_extra_args(rt, params);

        tracing::debug!(
            "enumerating {} via {}.{}",
            self.core.kind_name(),
            rt.service,
            rt.enum_spec.operation
        );

        invoke_enum(
            client.as_ref(),
            &rt.enum_spec.operation,
            &params,
            rt.enum_spec.path.as_deref(),
            self.core.retry(),
        )
        .await
    }

    /// Fetch resources by identity
    pub async fn get(&self, ids: &[String]) -> Result<Vec<Value>> {
        match server_filter_params(&self.core, ids)? {
            Some(params) => self.filter(params).await,
            None => {
                let resources = self.filter(Params::new()).await?;
                Ok(match_identities(self.core.resource_type(), resources, ids))
            }
        }
    }
}

/// Parameters narrowing an enumeration to `ids` on the provider side
///
/// `None` when the kind declares no server filter and identities have to be
/// matched client-side.
fn server_filter_params(core: &ManagerCore, ids: &[String]) -> Result<Option<Params>> {
    let rt = core.resource_type();
    let mut params = Params::new();

    match (&rt.filter_name, rt.filter_type) {
        (Some(name), Some(ServerFilter::Scalar)) => {
            let [id] = ids else {
                return Err(Error::Contract(format!(
                    "{} filters on a single {}, got {} identities",
                    core.kind_name(),
                    name,
                    ids.len()
                )));
            };
            params.insert(name.clone(), Value::String(id.clone()));
        }
        (Some(name), Some(ServerFilter::List)) => {
            let values = ids.iter().cloned().map(Value::String).collect();
            params.insert(name.clone(), Value::Array(values));
        }
        _ => return Ok(None),
    }
    Ok(Some(params))
}

/// Enumeration for kinds listed per parent resource
pub struct ChildResourceQuery {
    core: Arc<ManagerCore>,
}

impl ChildResourceQuery {
    pub fn new(core: Arc<ManagerCore>) -> Self {
        Self { core }
    }

    /// Enumerate children across all parents
    ///
    /// Records are stamped with [`PARENT_ANNOTATION`] when the parent link
    /// asks for it.
    pub async fn filter(&self, params: Params) -> Result<Vec<Value>> {
        let annotate = self
            .core
            .resource_type()
            .parent_spec
            .as_ref()
            .is_some_and(|p| p.annotate);

        let pairs = self.filter_pairs(params).await?;
        Ok(pairs
            .into_iter()
            .map(|(parent_id, mut record)| {
                if annotate {
                    if let Value::Object(map) = &mut record {
                        map.insert(PARENT_ANNOTATION.to_string(), Value::String(parent_id));
                    }
                }
                record
            })
            .collect())
    }

    /// Enumerate children paired with their parent's identity
    pub async fn filter_pairs(&self, params: Params) -> Result<Vec<(String, Value)>> {
        let rt = self.core.resource_type();
        let parent = rt.parent_spec.as_ref().ok_or_else(|| {
            Error::Contract(format!("{} has no parent resource", self.core.kind_name()))
        })?;
        let client = self.core.client(&rt.service)?;
        let params = merge_extra_args(rt, params);
        let operation = rt.enum_spec.operation.as_str();
        let path = rt.enum_spec.path.as_deref();
        let retry = self.core.retry();

        // Caller already scoped the query to one parent
        if let Some(value) = params.get(&parent.key) {
            let parent_id = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let records = invoke_enum(client.as_ref(), operation, &params, path, retry).await?;
            return Ok(records.into_iter().map(|r| (parent_id.clone(), r)).collect());
        }

        let parent_manager = self.core.get_resource_manager(&parent.kind)?;
        let parent_type = parent_manager.core().resource_type();
        let parent_ids: Vec<String> = parent_manager
            .population(None, false)
            .await?
            .iter()
            .filter_map(|p| parent_type.record_id(p))
            .collect();

        if parent_ids.is_empty() {
            tracing::debug!("{}: no {} parents", self.core.kind_name(), parent.kind);
            return Ok(Vec::new());
        }

        tracing::debug!(
            "{}: querying {} {} parents",
            self.core.kind_name(),
            parent_ids.len(),
            parent.kind
        );

        let group = TaskGroup::new(self.core.max_workers());
        let results = group
            .run_ordered(parent_ids, |parent_id| {
                let client = client.clone();
                let mut merged = params.clone();
                merged.insert(parent.key.clone(), Value::String(parent_id.clone()));
                async move {
                    match invoke_enum(client.as_ref(), operation, &merged, path, retry).await {
                        Ok(records) => Ok::<_, Error>(
                            records
                                .into_iter()
                                .map(|r| (parent_id.clone(), r))
                                .collect::<Vec<_>>(),
                        ),
                        // Parent vanished between listing and fan-out
                        Err(Error::Provider(err)) if client.is_not_found(&err) => {
                            tracing::debug!("parent {} gone: {}", parent_id, err);
                            Ok(Vec::new())
                        }
                        Err(err) => Err(err),
                    }
                }
            })
            .await;

        let mut pairs = Vec::new();
        for result in results {
            let batch: Vec<(String, Value)> = result?;
            pairs.extend(batch);
        }
        Ok(pairs)
    }

    /// Fetch children by identity
    ///
    /// A declared server filter is applied to every parent's call; otherwise
    /// the full fan-out is matched client-side.
    pub async fn get(&self, ids: &[String]) -> Result<Vec<Value>> {
        match server_filter_params(&self.core, ids)? {
            Some(params) => self.filter(params).await,
            None => {
                let resources = self.filter(Params::new()).await?;
                Ok(match_identities(self.core.resource_type(), resources, ids))
            }
        }
    }
}
