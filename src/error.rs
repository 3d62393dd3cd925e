//! Error types
//!
//! Every fallible library operation returns [`Result`]. Provider failures keep
//! their error code so callers can classify them (throttling, not-found).

use crate::provider::ProviderError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Which resource limit a policy run breached
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitKind {
    /// Absolute ceiling on the selection size
    MaxResources(u64),
    /// Ceiling as a percentage of the population
    MaxPercent(f64),
}

impl LimitKind {
    /// Short name used in reports ("max-resources" / "max-percent")
    pub fn name(&self) -> &'static str {
        match self {
            LimitKind::MaxResources(_) => "max-resources",
            LimitKind::MaxPercent(_) => "max-percent",
        }
    }
}

/// Raised when a policy would act on more resources than it allows
#[derive(Error, Debug, Clone, PartialEq)]
#[error("policy: {policy} exceeded resource limit: {}", limit_detail(.limit, .selection_count, .population_count))]
pub struct ResourceLimitExceeded {
    pub policy: String,
    pub limit: LimitKind,
    pub selection_count: usize,
    pub population_count: usize,
}

fn limit_detail(limit: &LimitKind, selection: &usize, population: &usize) -> String {
    match limit {
        LimitKind::MaxResources(limit) => format!("{} found: {}", limit, selection),
        LimitKind::MaxPercent(limit) => format!("{}% found: {} total: {}", limit, selection, population),
    }
}

/// Library error
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{registry} not registered: {name}")]
    NotRegistered { registry: String, name: String },

    #[error("invalid resource type {name}: {reason}")]
    InvalidResourceType { name: String, reason: String },

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("invalid policy: {0}")]
    Validation(String),

    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitExceeded),

    #[error("resource tag errors: {errors:?}")]
    TagErrors { errors: BTreeMap<String, String> },

    #[error("resource tag throttled: {}", arns.join(", "))]
    TagThrottled { arns: Vec<String> },

    #[error("{action} failed on {failed} of {total} batches: {first}")]
    ActionFailed {
        action: String,
        failed: usize,
        total: usize,
        first: Box<Error>,
    },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub(crate) fn not_registered(registry: &str, name: &str) -> Self {
        Error::NotRegistered {
            registry: registry.to_string(),
            name: name.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
