//! Resource actions
//!
//! Actions run against a policy's selection once filtering completes. The
//! built-in set covers tagging, both through the EC2 tag APIs and through
//! the universal tagging service.

use crate::error::{Error, Result};
use crate::provider::{Params, ProviderClient};
use crate::resource::augment::TAGGING_SERVICE;
use crate::resource::pool::{chunks, TaskGroup};
use crate::resource::query::call;
use crate::resource::registry::{PluginRegistry, ResourceKind};
use crate::resource::ManagerCore;
use crate::retry::universal_retry;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tag key used when a policy names none
pub const DEFAULT_TAG: &str = "maid_status";

/// An operation applied to selected resources
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, core: &ManagerCore, resources: &[Value]) -> Result<()>;

    fn permissions(&self) -> Vec<String>;
}

pub type ActionFactory = fn(&Value) -> Result<Box<dyn Action>>;
pub type ActionRegistry = PluginRegistry<ActionFactory>;

const TAG_NAMES: &[&str] = &["tag", "mark"];
const UNTAG_NAMES: &[&str] = &["remove-tag", "untag", "unmark"];

/// Parse one policy action entry: a bare name or `{type: <name>, ...}`
pub fn parse_action(kind: &ResourceKind, data: &Value) -> Result<Box<dyn Action>> {
    let name = match data {
        Value::String(name) => name.as_str(),
        Value::Object(map) => map
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Validation(format!("{}: action requires a type", kind.name)))?,
        other => {
            return Err(Error::Validation(format!("{}: invalid action {}", kind.name, other)));
        }
    };
    let factory = kind.actions.get(name)?;
    let data = match data {
        Value::String(_) => Value::Object(Map::new()),
        other => other.clone(),
    };
    factory(&data)
}

pub fn register_ec2_tags(registry: &mut ActionRegistry) {
    for name in TAG_NAMES {
        registry.register(name, ec2_tag);
    }
    for name in UNTAG_NAMES {
        registry.register(name, ec2_remove_tag);
    }
}

pub fn register_universal_tags(registry: &mut ActionRegistry) {
    for name in TAG_NAMES {
        registry.register(name, universal_tag);
    }
    for name in UNTAG_NAMES {
        registry.register(name, universal_untag);
    }
}

fn str_field<'a>(data: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| data.get(*n).and_then(|v| v.as_str()))
}

/// Tags to apply: a `tags` mapping or a key/value pair
fn tags_to_add(data: &Value) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    if let Some(map) = data.get("tags").and_then(|t| t.as_object()) {
        for (k, v) in map {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            tags.insert(k.clone(), value);
        }
    }

    let key = str_field(data, &["key", "tag"]);
    let value = str_field(data, &["value", "msg"]);
    match (key, value) {
        (Some(key), None) => {
            return Err(Error::Validation(format!("tag action must specify a value for key {}", key)));
        }
        (key, Some(value)) => {
            tags.insert(key.unwrap_or(DEFAULT_TAG).to_string(), value.to_string());
        }
        (None, None) => {}
    }

    if tags.is_empty() {
        return Err(Error::Validation("tag action must specify tags".to_string()));
    }
    Ok(tags)
}

/// Tag keys to remove: `tags` list, a single key, or the default
fn tags_to_remove(data: &Value) -> Result<Vec<String>> {
    if let Some(tags) = data.get("tags") {
        let keys: Vec<String> = tags
            .as_array()
            .map(|items| items.iter().filter_map(|t| t.as_str()).map(|t| t.to_string()).collect())
            .unwrap_or_default();
        if keys.is_empty() {
            return Err(Error::Validation("remove-tag tags must be a list of keys".to_string()));
        }
        return Ok(keys);
    }
    Ok(vec![str_field(data, &["key", "tag"]).unwrap_or(DEFAULT_TAG).to_string()])
}

/// Run one task per batch and report failures after all are observed
async fn run_batches<F, Fut>(action: &str, batches: Vec<Vec<String>>, concurrency: usize, task: F) -> Result<()>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let total = batches.len();
    let results = TaskGroup::new(concurrency).run(batches, task).await;

    let mut errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    for err in &errors {
        tracing::error!("{} batch failed: {}", action, err);
    }
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        failed => Err(Error::ActionFailed {
            action: action.to_string(),
            failed,
            total,
            first: Box::new(errors.remove(0)),
        }),
    }
}

const EC2_BATCH_SIZE: usize = 25;
const EC2_CONCURRENCY: usize = 2;

fn ec2_ids(core: &ManagerCore, resources: &[Value]) -> Vec<String> {
    resources
        .iter()
        .filter_map(|r| core.resource_type().record_id(r))
        .collect()
}

/// `create_tags` on the EC2 API
pub struct Ec2Tag {
    tags: BTreeMap<String, String>,
}

fn ec2_tag(data: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(Ec2Tag {
        tags: tags_to_add(data)?,
    }))
}

#[async_trait]
impl Action for Ec2Tag {
    fn name(&self) -> &str {
        "tag"
    }

    async fn process(&self, core: &ManagerCore, resources: &[Value]) -> Result<()> {
        let client = core.client("ec2")?;
        let tags: Vec<Value> = self
            .tags
            .iter()
            .map(|(k, v)| {
                let mut tag = Map::new();
                tag.insert("Key".to_string(), Value::String(k.clone()));
                tag.insert("Value".to_string(), Value::String(v.clone()));
                Value::Object(tag)
            })
            .collect();

        let batches = chunks(&ec2_ids(core, resources), EC2_BATCH_SIZE);
        run_batches("tag", batches, EC2_CONCURRENCY, |ids| {
            let client = client.clone();
            let mut params = Params::new();
            params.insert("Resources".to_string(), Value::Array(ids.into_iter().map(Value::String).collect()));
            params.insert("Tags".to_string(), Value::Array(tags.clone()));
            async move {
                call(client.as_ref(), "create_tags", &params, core.retry()).await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    fn permissions(&self) -> Vec<String> {
        vec!["ec2:CreateTags".to_string()]
    }
}

/// `delete_tags` on the EC2 API
pub struct Ec2RemoveTag {
    keys: Vec<String>,
}

fn ec2_remove_tag(data: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(Ec2RemoveTag {
        keys: tags_to_remove(data)?,
    }))
}

#[async_trait]
impl Action for Ec2RemoveTag {
    fn name(&self) -> &str {
        "remove-tag"
    }

    async fn process(&self, core: &ManagerCore, resources: &[Value]) -> Result<()> {
        let client = core.client("ec2")?;
        let tags: Vec<Value> = self
            .keys
            .iter()
            .map(|k| {
                let mut tag = Map::new();
                tag.insert("Key".to_string(), Value::String(k.clone()));
                Value::Object(tag)
            })
            .collect();

        let batches = chunks(&ec2_ids(core, resources), EC2_BATCH_SIZE);
        run_batches("remove-tag", batches, EC2_CONCURRENCY, |ids| {
            let client = client.clone();
            let mut params = Params::new();
            params.insert("Resources".to_string(), Value::Array(ids.into_iter().map(Value::String).collect()));
            params.insert("Tags".to_string(), Value::Array(tags.clone()));
            async move {
                call(client.as_ref(), "delete_tags", &params, core.retry()).await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    fn permissions(&self) -> Vec<String> {
        vec!["ec2:DeleteTags".to_string()]
    }
}

const UNIVERSAL_BATCH_SIZE: usize = 20;
const UNIVERSAL_CONCURRENCY: usize = 1;

/// Tagging service client, in us-east-1 for global kinds
fn tagging_client(core: &ManagerCore) -> Result<Arc<dyn ProviderClient>> {
    if core.resource_type().global_resource {
        core.client_in(TAGGING_SERVICE, "us-east-1")
    } else {
        core.client(TAGGING_SERVICE)
    }
}

/// `tag_resources` on the tagging service
pub struct UniversalTag {
    tags: BTreeMap<String, String>,
}

fn universal_tag(data: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(UniversalTag {
        tags: tags_to_add(data)?,
    }))
}

#[async_trait]
impl Action for UniversalTag {
    fn name(&self) -> &str {
        "tag"
    }

    async fn process(&self, core: &ManagerCore, resources: &[Value]) -> Result<()> {
        let client = tagging_client(core)?;
        let sleeper = core.sleeper();
        let tags: Map<String, Value> = self
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let batches = chunks(&core.get_arns(resources), UNIVERSAL_BATCH_SIZE);
        run_batches("tag", batches, UNIVERSAL_CONCURRENCY, |arns| {
            let client = client.clone();
            let sleeper = sleeper.clone();
            let tags = tags.clone();
            async move {
                universal_retry(
                    sleeper.as_ref(),
                    |arns| {
                        let client = client.clone();
                        let mut params = Params::new();
                        params.insert(
                            "ResourceARNList".to_string(),
                            Value::Array(arns.into_iter().map(Value::String).collect()),
                        );
                        params.insert("Tags".to_string(), Value::Object(tags.clone()));
                        async move { client.invoke("tag_resources", &params).await }
                    },
                    arns,
                )
                .await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    fn permissions(&self) -> Vec<String> {
        vec!["tag:TagResources".to_string()]
    }
}

/// `untag_resources` on the tagging service
pub struct UniversalUntag {
    keys: Vec<String>,
}

fn universal_untag(data: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(UniversalUntag {
        keys: tags_to_remove(data)?,
    }))
}

#[async_trait]
impl Action for UniversalUntag {
    fn name(&self) -> &str {
        "remove-tag"
    }

    async fn process(&self, core: &ManagerCore, resources: &[Value]) -> Result<()> {
        let client = tagging_client(core)?;
        let sleeper = core.sleeper();
        let keys: Vec<Value> = self.keys.iter().cloned().map(Value::String).collect();

        let batches = chunks(&core.get_arns(resources), UNIVERSAL_BATCH_SIZE);
        run_batches("remove-tag", batches, UNIVERSAL_CONCURRENCY, |arns| {
            let client = client.clone();
            let sleeper = sleeper.clone();
            let keys = keys.clone();
            async move {
                universal_retry(
                    sleeper.as_ref(),
                    |arns| {
                        let client = client.clone();
                        let mut params = Params::new();
                        params.insert(
                            "ResourceARNList".to_string(),
                            Value::Array(arns.into_iter().map(Value::String).collect()),
                        );
                        params.insert("TagKeys".to_string(), Value::Array(keys.clone()));
                        async move { client.invoke("untag_resources", &params).await }
                    },
                    arns,
                )
                .await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    fn permissions(&self) -> Vec<String> {
        vec!["tag:UntagResources".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tags_to_add_forms() {
        let tags = tags_to_add(&json!({"key": "Owner", "value": "ops"})).unwrap();
        assert_eq!(tags.get("Owner").map(String::as_str), Some("ops"));

        let tags = tags_to_add(&json!({"msg": "stop soon"})).unwrap();
        assert_eq!(tags.get(DEFAULT_TAG).map(String::as_str), Some("stop soon"));

        let tags = tags_to_add(&json!({"tags": {"a": "1", "b": 2}})).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["b"], "2");

        assert!(tags_to_add(&json!({"key": "Owner"})).is_err());
        assert!(tags_to_add(&json!({})).is_err());
    }

    #[test]
    fn test_tags_to_remove_forms() {
        assert_eq!(tags_to_remove(&json!({})).unwrap(), vec![DEFAULT_TAG.to_string()]);
        assert_eq!(tags_to_remove(&json!({"tags": ["a", "b"]})).unwrap(), vec!["a", "b"]);
        assert_eq!(tags_to_remove(&json!({"key": "Owner"})).unwrap(), vec!["Owner"]);
        assert!(tags_to_remove(&json!({"tags": "a"})).is_err());
    }

    #[tokio::test]
    async fn test_run_batches_aggregates_failures() {
        let batches = vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]];
        let err = run_batches("tag", batches, 2, |ids| async move {
            if ids[0] == "b" {
                Ok(())
            } else {
                Err(Error::Contract(format!("bad {}", ids[0])))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ActionFailed { failed: 2, total: 3, .. }));
    }

    #[tokio::test]
    async fn test_run_batches_single_failure_passes_through() {
        let batches = vec![vec!["a".to_string()], vec!["b".to_string()]];
        let err = run_batches("tag", batches, 1, |ids| async move {
            if ids[0] == "a" {
                Err(Error::Contract("bad a".to_string()))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Contract(ref msg) if msg == "bad a"));
    }
}
