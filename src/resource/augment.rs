//! Augmentation Engine
//!
//! Enriches enumerated records with detail calls. Scalar mode issues one
//! call per record, batch mode one call per chunk. Chunks run concurrently
//! on a [`TaskGroup`]; merged output order is unspecified.

use super::manager::ManagerCore;
use super::path::{search, search_items};
use super::pool::{chunks, TaskGroup};
use super::query::invoke_enum;
use super::registry::DetailSpec;
use crate::error::Result;
use crate::provider::{Params, ProviderClient};
use crate::retry::Retry;
use serde_json::Value;
use std::collections::HashMap;

/// Tagging service used for universal tag lookups
pub const TAGGING_SERVICE: &str = "resourcegroupstaggingapi";

/// Region the tagging API is queried in for global resources
const GLOBAL_REGION: &str = "us-east-1";

/// Apply the descriptor's detail spec to `resources`
pub async fn detail_augment(core: &ManagerCore, resources: Vec<Value>) -> Result<Vec<Value>> {
    let rt = core.resource_type();
    let Some(detail) = &rt.detail_spec else {
        return Ok(resources);
    };
    if resources.is_empty() {
        return Ok(resources);
    }

    let client = core.client(&rt.service)?;
    let chunk_size = match detail {
        DetailSpec::Batch {
            batch_size: Some(size),
            ..
        } => *size,
        _ => core.chunk_size(),
    };
    let sets = chunks(&resources, chunk_size);

    tracing::debug!(
        "augmenting {} {} resources with {} in {} chunks",
        resources.len(),
        core.kind_name(),
        detail.operation(),
        sets.len()
    );

    let group = TaskGroup::new(core.max_workers());
    let results = group
        .run(sets, |set| {
            let client = client.clone();
            async move {
                match detail {
                    DetailSpec::Scalar { .. } => scalar_augment(core, client.as_ref(), detail, set).await,
                    DetailSpec::Batch { .. } => batch_augment(client.as_ref(), core.retry(), detail, set).await,
                }
            }
        })
        .await;

    let mut augmented = Vec::with_capacity(resources.len());
    for result in results {
        augmented.extend(result?);
    }
    Ok(augmented)
}

/// Parameter value for one record: a declared field or the record itself
fn param_value(record: &Value, param_key: Option<&str>) -> Value {
    match param_key {
        Some(key) => record.get(key).cloned().unwrap_or(Value::Null),
        None => record.clone(),
    }
}

/// One detail call per record
async fn scalar_augment(
    core: &ManagerCore,
    client: &dyn ProviderClient,
    detail: &DetailSpec,
    set: Vec<Value>,
) -> Result<Vec<Value>> {
    let DetailSpec::Scalar {
        operation,
        param_name,
        param_key,
        path,
    } = detail
    else {
        return Ok(set);
    };
    let id_field = &core.resource_type().id;
    let retry = core.retry();

    let mut results = Vec::with_capacity(set.len());
    for record in set {
        let mut params = Params::new();
        params.insert(param_name.clone(), param_value(&record, param_key.as_deref()));

        let response = match super::query::call(client, operation, &params, retry).await {
            Ok(response) => response,
            Err(err) if client.is_not_found(&err) => {
                tracing::debug!("{} vanished before {}: {}", param_value(&record, param_key.as_deref()), operation, err);
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let detail = match path {
            Some(p) => search(&response, p),
            None => response,
        };

        let merged = if param_key.is_none() {
            // The detail response replaces the record; carry the identity over
            match detail {
                Value::Object(mut map) => {
                    if !map.contains_key(id_field) {
                        let id = core.resource_type().record_id(&record).map(Value::String).unwrap_or(record);
                        map.insert(id_field.clone(), id);
                    }
                    Value::Object(map)
                }
                _ => record,
            }
        } else {
            match (record, detail) {
                (Value::Object(mut base), Value::Object(extra)) => {
                    base.extend(extra);
                    Value::Object(base)
                }
                (record, _) => record,
            }
        };
        results.push(merged);
    }
    Ok(results)
}

/// One detail call for the whole chunk
async fn batch_augment(
    client: &dyn ProviderClient,
    retry: Option<&Retry>,
    detail: &DetailSpec,
    set: Vec<Value>,
) -> Result<Vec<Value>> {
    let DetailSpec::Batch {
        operation,
        param_name,
        param_key,
        path,
        args,
        ..
    } = detail
    else {
        return Ok(set);
    };

    let mut params = Params::new();
    params.insert(
        param_name.clone(),
        Value::Array(set.iter().map(|r| param_value(r, param_key.as_deref())).collect()),
    );
    if let Some(args) = args {
        params.extend(args.clone());
    }

    let response = super::query::call(client, operation, &params, retry).await?;
    Ok(search_items(&response, Some(path)))
}

/// Attach tags from the tagging API to universally taggable records
///
/// Records whose identifier is unknown to the tagging API keep their
/// existing fields untouched.
pub async fn universal_augment(core: &ManagerCore, mut resources: Vec<Value>) -> Result<Vec<Value>> {
    if resources.is_empty() {
        return Ok(resources);
    }
    let rt = core.resource_type();
    let region = if rt.global_resource {
        GLOBAL_REGION.to_string()
    } else {
        core.region().to_string()
    };
    let client = core.client_in(TAGGING_SERVICE, &region)?;
    let resource_type = rt.tagging_resource_type();

    let mut params = Params::new();
    params.insert(
        "ResourceTypeFilters".to_string(),
        Value::Array(vec![Value::String(resource_type.clone())]),
    );
    let mappings = invoke_enum(
        client.as_ref(),
        "get_resources",
        &params,
        Some("ResourceTagMappingList"),
        core.retry(),
    )
    .await?;

    let tag_map: HashMap<String, Value> = mappings
        .into_iter()
        .filter_map(|m| {
            let arn = m.get("ResourceARN")?.as_str()?.to_string();
            let tags = m.get("Tags").cloned().unwrap_or(Value::Array(Vec::new()));
            Some((arn, tags))
        })
        .collect();

    tracing::debug!("tagging api returned {} {} mappings", tag_map.len(), resource_type);

    for record in resources.iter_mut() {
        let Some(arn) = core.get_arn(record) else {
            continue;
        };
        if let (Some(tags), Value::Object(map)) = (tag_map.get(&arn), record) {
            map.insert("Tags".to_string(), tags.clone());
        }
    }
    Ok(resources)
}
