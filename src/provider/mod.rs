//! Provider client boundary
//!
//! The core never talks to a cloud API directly. It asks a [`SessionFactory`]
//! for a [`ProviderClient`] scoped to a service and region, and invokes
//! operations by name with JSON parameters.
//!
//! # Module Structure
//!
//! - [`http`] - REST/JSON client against a control-plane gateway
//! - [`stub`] - In-memory programmable client for tests and offline replay

pub mod http;
pub mod stub;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Keyword parameters for a provider operation
pub type Params = Map<String, Value>;

/// Codes treated as "resource vanished" by every service
pub const DEFAULT_NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "NotFoundException",
    "NotFound",
];

/// Codes treated as rate limiting by every service
pub const DEFAULT_THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestLimitExceeded",
    "Throttled",
    "Throttling",
    "Client.RequestLimitExceeded",
];

/// Error returned by a provider operation
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the code is one of `codes`
    pub fn is_any(&self, codes: &[String]) -> bool {
        codes.iter().any(|c| *c == self.code)
    }
}

/// Pagination description for one operation
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaginatorSpec {
    pub input_token: String,
    pub output_token: String,
    #[serde(default)]
    pub result_keys: Vec<String>,
}

/// Per-service model declared in the catalog
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceModel {
    #[serde(default)]
    pub paginators: HashMap<String, PaginatorSpec>,
    #[serde(default)]
    pub not_found: Vec<String>,
    #[serde(default)]
    pub throttling: Vec<String>,
}

impl ServiceModel {
    /// Declared not-found codes merged with the defaults
    pub fn not_found_codes(&self) -> Vec<String> {
        merge_codes(&self.not_found, DEFAULT_NOT_FOUND_CODES)
    }

    /// Declared throttling codes merged with the defaults
    pub fn throttling_codes(&self) -> Vec<String> {
        merge_codes(&self.throttling, DEFAULT_THROTTLING_CODES)
    }
}

fn merge_codes(declared: &[String], defaults: &[&str]) -> Vec<String> {
    let mut codes: Vec<String> = defaults.iter().map(|s| s.to_string()).collect();
    for code in declared {
        if !codes.contains(code) {
            codes.push(code.clone());
        }
    }
    codes
}

/// A client bound to one service in one region
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn service(&self) -> &str;

    fn region(&self) -> &str;

    /// Pagination capability probe; `None` means single-shot
    fn paginator(&self, operation: &str) -> Option<PaginatorSpec>;

    async fn invoke(&self, operation: &str, params: &Params) -> Result<Value, ProviderError>;

    fn not_found_codes(&self) -> Vec<String> {
        merge_codes(&[], DEFAULT_NOT_FOUND_CODES)
    }

    fn throttling_codes(&self) -> Vec<String> {
        merge_codes(&[], DEFAULT_THROTTLING_CODES)
    }

    fn is_not_found(&self, error: &ProviderError) -> bool {
        error.is_any(&self.not_found_codes())
    }
}

/// Resolves service clients for a run
pub trait SessionFactory: Send + Sync {
    fn client(&self, service: &str, region: &str) -> crate::Result<Arc<dyn ProviderClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_model_merges_codes() {
        let model = ServiceModel {
            not_found: vec!["NoSuchEntity".into(), "NotFound".into()],
            ..Default::default()
        };
        let codes = model.not_found_codes();
        assert!(codes.contains(&"NoSuchEntity".to_string()));
        assert_eq!(codes.iter().filter(|c| *c == "NotFound").count(), 1);
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new("Throttling", "slow down").with_status(429);
        assert_eq!(err.to_string(), "Throttling: slow down");
        assert_eq!(err.status, Some(429));
    }
}
