//! Resource filters
//!
//! Filters narrow a manager's population into its selection. Each resource
//! kind carries its own [`FilterRegistry`]; entries are parsed from policy
//! data either as `{type: <name>, ...}` or as the `{<key>: <value>}`
//! shorthand for a value filter.

use crate::error::{Error, Result};
use crate::provider::Params;
use crate::resource::path::search;
use crate::resource::pool::TaskGroup;
use crate::resource::query::call;
use crate::resource::registry::{PluginRegistry, ResourceKind};
use crate::resource::ManagerCore;
use async_trait::async_trait;
use chrono::{SecondsFormat, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Annotation holding datapoints matched by the metrics filter
pub const METRICS_ANNOTATION: &str = "custodia:metrics";

/// A resource filter
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, core: &ManagerCore, resources: Vec<Value>) -> Result<Vec<Value>>;

    fn permissions(&self) -> Vec<String> {
        Vec::new()
    }
}

pub type FilterFactory = fn(&Value) -> Result<Box<dyn Filter>>;
pub type FilterRegistry = PluginRegistry<FilterFactory>;

/// Parse one policy filter entry for `kind`
pub fn parse_filter(kind: &ResourceKind, data: &Value) -> Result<Box<dyn Filter>> {
    let Value::Object(map) = data else {
        return Err(Error::Validation(format!("{}: filter must be a mapping, got {}", kind.name, data)));
    };

    if let Some(filter_type) = map.get("type") {
        let name = filter_type
            .as_str()
            .ok_or_else(|| Error::Validation(format!("{}: filter type must be a string", kind.name)))?;
        let factory = kind.filters.get(name)?;
        return factory(data);
    }

    // {<key>: <value>} shorthand
    match map.iter().next() {
        Some((key, value)) if map.len() == 1 => Ok(Box::new(ValueFilter::new(key, None, value.clone())?)),
        _ => Err(Error::Validation(format!("{}: invalid filter {}", kind.name, data))),
    }
}

/// Comparison operator shared by the built-in filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    #[default]
    #[serde(alias = "equal")]
    Eq,
    #[serde(alias = "not-equal")]
    Ne,
    In,
    NotIn,
    Present,
    Absent,
    #[serde(alias = "greater-than")]
    Gt,
    Gte,
    #[serde(alias = "less-than")]
    Lt,
    Lte,
}

fn scalar_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => matches!((scalar_str(a), scalar_str(b)), (Some(x), Some(y)) if x == y),
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

impl Op {
    pub fn compare(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Op::Present => !actual.is_null(),
            Op::Absent => actual.is_null(),
            Op::Eq => values_equal(actual, expected),
            Op::Ne => !values_equal(actual, expected),
            Op::In => expected
                .as_array()
                .is_some_and(|items| items.iter().any(|e| values_equal(actual, e))),
            Op::NotIn => !expected
                .as_array()
                .is_some_and(|items| items.iter().any(|e| values_equal(actual, e))),
            Op::Gt => order(actual, expected) == Some(Ordering::Greater),
            Op::Gte => matches!(order(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
            Op::Lt => order(actual, expected) == Some(Ordering::Less),
            Op::Lte => matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Read a tag value from `Tags` (key/value list or plain mapping)
pub fn tag_value(record: &Value, key: &str) -> Option<Value> {
    match record.get("Tags")? {
        Value::Array(tags) => tags
            .iter()
            .find(|t| t.get("Key").and_then(|k| k.as_str()) == Some(key))
            .and_then(|t| t.get("Value").cloned()),
        Value::Object(map) => map.get(key).cloned(),
        _ => None,
    }
}

/// Resolve a filter key against a record
pub fn resolve_key(record: &Value, key: &str) -> Value {
    match key.strip_prefix("tag:") {
        Some(tag) => tag_value(record, tag).unwrap_or(Value::Null),
        None => search(record, key),
    }
}

/// Compare one field of each record against a value
#[derive(Debug, Clone)]
pub struct ValueFilter {
    key: String,
    op: Op,
    value: Value,
}

impl ValueFilter {
    /// With no `op`, the literal values `present`/`absent` select those ops
    pub fn new(key: &str, op: Option<Op>, value: Value) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::Validation("value filter requires a key".to_string()));
        }
        let op = op.unwrap_or(match value.as_str() {
            Some("present") => Op::Present,
            Some("absent") => Op::Absent,
            _ => Op::Eq,
        });
        if !matches!(op, Op::Present | Op::Absent) && value.is_null() {
            return Err(Error::Validation(format!("value filter on {} requires a value", key)));
        }
        if matches!(op, Op::In | Op::NotIn) && !value.is_array() {
            return Err(Error::Validation(format!("value filter on {} needs a list for {:?}", key, op)));
        }
        Ok(Self {
            key: key.to_string(),
            op,
            value,
        })
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.op.compare(&resolve_key(record, &self.key), &self.value)
    }
}

#[async_trait]
impl Filter for ValueFilter {
    fn name(&self) -> &str {
        "value"
    }

    async fn process(&self, _core: &ManagerCore, resources: Vec<Value>) -> Result<Vec<Value>> {
        Ok(resources.into_iter().filter(|r| self.matches(r)).collect())
    }
}

fn parse_data<T: for<'de> Deserialize<'de>>(filter: &str, data: &Value) -> Result<T> {
    serde_json::from_value(data.clone()).map_err(|e| Error::Validation(format!("invalid {} filter: {}", filter, e)))
}

pub fn value_filter(data: &Value) -> Result<Box<dyn Filter>> {
    #[derive(Deserialize)]
    struct Data {
        key: String,
        #[serde(default)]
        op: Option<Op>,
        #[serde(default)]
        value: Value,
    }
    let data: Data = parse_data("value", data)?;
    Ok(Box::new(ValueFilter::new(&data.key, data.op, data.value)?))
}

/// Count of user tags (ignores the provider's `aws:` tags)
#[derive(Debug, Clone, Deserialize)]
pub struct TagCountFilter {
    #[serde(default = "default_tag_count")]
    count: u64,
    #[serde(default = "default_tag_op")]
    op: Op,
}

fn default_tag_count() -> u64 {
    10
}

fn default_tag_op() -> Op {
    Op::Gte
}

fn user_tag_count(record: &Value) -> u64 {
    record
        .get("Tags")
        .and_then(|t| t.as_array())
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("Key").and_then(|k| k.as_str()))
                .filter(|k| !k.starts_with("aws:"))
                .count() as u64
        })
        .unwrap_or(0)
}

#[async_trait]
impl Filter for TagCountFilter {
    fn name(&self) -> &str {
        "tag-count"
    }

    async fn process(&self, _core: &ManagerCore, resources: Vec<Value>) -> Result<Vec<Value>> {
        let expected = Value::from(self.count);
        Ok(resources
            .into_iter()
            .filter(|r| self.op.compare(&Value::from(user_tag_count(r)), &expected))
            .collect())
    }
}

pub fn tag_count_filter(data: &Value) -> Result<Box<dyn Filter>> {
    Ok(Box::new(parse_data::<TagCountFilter>("tag-count", data)?))
}

/// Tag filters available on taggable kinds
pub fn register_tag_filters(registry: &mut FilterRegistry) {
    registry.register("tag-count", tag_count_filter);
}

/// Compare a metric statistic over a trailing window
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsFilter {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default = "default_statistic")]
    statistics: String,
    #[serde(default = "default_days")]
    days: u32,
    #[serde(default)]
    period: Option<u32>,
    op: Op,
    value: f64,
    #[serde(default)]
    missing_value: Option<f64>,
}

fn default_statistic() -> String {
    "Average".to_string()
}

fn default_days() -> u32 {
    14
}

const STATISTICS: &[&str] = &["Average", "Sum", "Maximum", "Minimum", "SampleCount"];

/// Longest metrics window; datapoints older than 15 months are not retained
pub const MAX_METRIC_DAYS: u32 = 455;

const SECONDS_PER_DAY: u32 = 86_400;

/// Reduce datapoints for one statistic
fn aggregate(statistic: &str, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match statistic {
        "Average" => Some(values.iter().sum::<f64>() / values.len() as f64),
        "Maximum" => values.iter().copied().reduce(f64::max),
        "Minimum" => values.iter().copied().reduce(f64::min),
        _ => Some(values.iter().sum()),
    }
}

impl MetricsFilter {
    fn annotation_key(&self, namespace: &str) -> String {
        format!("{}.{}.{}.{}", namespace, self.name, self.statistics, self.days)
    }

    /// Window length in seconds, used when no period is given
    fn window_seconds(&self) -> Result<u32> {
        self.days
            .checked_mul(SECONDS_PER_DAY)
            .ok_or_else(|| Error::Validation(format!("metrics window of {} days is too long", self.days)))
    }

    fn request(&self, namespace: &str, dimension: &str, dimension_value: Value) -> Result<Params> {
        let end = Utc::now();
        let start = TimeDelta::try_days(i64::from(self.days))
            .and_then(|window| end.checked_sub_signed(window))
            .ok_or_else(|| Error::Validation(format!("metrics window of {} days is too long", self.days)))?;
        let period = match self.period {
            Some(period) => period,
            None => self.window_seconds()?,
        };

        let mut dim = Map::new();
        dim.insert("Name".to_string(), Value::String(dimension.to_string()));
        dim.insert("Value".to_string(), dimension_value);

        let mut params = Params::new();
        params.insert("Namespace".to_string(), Value::String(namespace.to_string()));
        params.insert("MetricName".to_string(), Value::String(self.name.clone()));
        params.insert("Dimensions".to_string(), Value::Array(vec![Value::Object(dim)]));
        params.insert(
            "StartTime".to_string(),
            Value::String(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        params.insert(
            "EndTime".to_string(),
            Value::String(end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        params.insert("Period".to_string(), Value::from(period));
        params.insert(
            "Statistics".to_string(),
            Value::Array(vec![Value::String(self.statistics.clone())]),
        );
        Ok(params)
    }
}

#[async_trait]
impl Filter for MetricsFilter {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn process(&self, core: &ManagerCore, resources: Vec<Value>) -> Result<Vec<Value>> {
        let rt = core.resource_type();
        let dimension = rt
            .dimension
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("{} has no metrics dimension", core.kind_name())))?;
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| format!("AWS/{}", rt.service.to_uppercase()));
        let annotation_key = self.annotation_key(&namespace);
        let client = core.client("cloudwatch")?;
        let expected = Value::from(self.value);

        let group = TaskGroup::new(core.max_workers());
        let results = group
            .run_ordered(resources, |mut record| {
                let client = client.clone();
                let namespace = namespace.as_str();
                let annotation_key = annotation_key.as_str();
                let expected = &expected;
                async move {
                    let Some(dimension_value) = record.get(dimension).cloned() else {
                        return Ok::<_, Error>(None);
                    };
                    let params = self.request(namespace, dimension, dimension_value)?;
                    let response = call(client.as_ref(), "get_metric_statistics", &params, core.retry()).await?;

                    let datapoints = response
                        .get("Datapoints")
                        .and_then(|d| d.as_array())
                        .cloned()
                        .unwrap_or_default();
                    let values: Vec<f64> = datapoints
                        .iter()
                        .filter_map(|d| d.get(&self.statistics).and_then(|v| v.as_f64()))
                        .collect();

                    let Some(observed) = aggregate(&self.statistics, &values).or(self.missing_value) else {
                        return Ok(None);
                    };
                    if !self.op.compare(&Value::from(observed), expected) {
                        return Ok(None);
                    }

                    if let Value::Object(map) = &mut record {
                        let metrics = map
                            .entry(METRICS_ANNOTATION.to_string())
                            .or_insert_with(|| Value::Object(Map::new()));
                        if let Value::Object(metrics) = metrics {
                            metrics.insert(annotation_key.to_string(), Value::Array(datapoints));
                        }
                    }
                    Ok(Some(record))
                }
            })
            .await;

        let mut matched = Vec::new();
        for result in results {
            if let Some(record) = result? {
                matched.push(record);
            }
        }
        Ok(matched)
    }

    fn permissions(&self) -> Vec<String> {
        vec!["cloudwatch:GetMetricStatistics".to_string()]
    }
}

pub fn metrics_filter(data: &Value) -> Result<Box<dyn Filter>> {
    let filter: MetricsFilter = parse_data("metrics", data)?;
    if !STATISTICS.contains(&filter.statistics.as_str()) {
        return Err(Error::Validation(format!("invalid metrics statistic {}", filter.statistics)));
    }
    if filter.days == 0 || filter.days > MAX_METRIC_DAYS {
        return Err(Error::Validation(format!(
            "metrics days must be between 1 and {}, got {}",
            MAX_METRIC_DAYS, filter.days
        )));
    }
    let window = filter.window_seconds()?;
    if let Some(period) = filter.period {
        if period == 0 || period > window {
            return Err(Error::Validation(format!(
                "metrics period must be between 1 and {} seconds, got {}",
                window, period
            )));
        }
    }
    Ok(Box::new(filter))
}
