//! HTTP provider client
//!
//! Speaks a plain JSON protocol to a control-plane gateway:
//! `POST {endpoint}/{service}/{operation}` with the parameters as the body.

use super::{PaginatorSpec, Params, ProviderClient, ProviderError, ServiceModel, SessionFactory};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Header carrying the target region
pub const REGION_HEADER: &str = "x-custodia-region";

/// Sanitize response body for logging
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Build a provider error from a failed response
fn error_from_response(status: u16, body: &str) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = |keys: &[&str]| -> Option<String> {
        let parsed = parsed.as_ref()?;
        let scope = parsed.get("Error").or_else(|| parsed.get("error")).unwrap_or(parsed);
        keys.iter()
            .find_map(|k| scope.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.to_string())
    };

    let code = field(&["code", "Code", "__type"])
        .map(|c| c.rsplit('#').next().unwrap_or(&c).to_string())
        .unwrap_or_else(|| match status {
            429 => "Throttling".to_string(),
            404 => "NotFound".to_string(),
            other => format!("Http{}", other),
        });
    let message = field(&["message", "Message"]).unwrap_or_else(|| "API request failed".to_string());

    ProviderError::new(code, message).with_status(status)
}

/// Client for one service/region against the gateway
#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    endpoint: Url,
    token: Option<String>,
    service: String,
    region: String,
    model: ServiceModel,
}

impl HttpProviderClient {
    fn operation_url(&self, operation: &str) -> Result<Url, ProviderError> {
        self.endpoint
            .join(&format!("{}/{}", self.service, operation))
            .map_err(|e| ProviderError::new("InvalidEndpoint", e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn service(&self) -> &str {
        &self.service
    }

    fn region(&self) -> &str {
        &self.region
    }

    fn paginator(&self, operation: &str) -> Option<PaginatorSpec> {
        self.model.paginators.get(operation).cloned()
    }

    async fn invoke(&self, operation: &str, params: &Params) -> Result<Value, ProviderError> {
        let url = self.operation_url(operation)?;
        tracing::debug!("POST {} region={}", url, self.region);

        let mut request = self
            .http
            .post(url)
            .header(REGION_HEADER, &self.region)
            .json(params);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::new("RequestFailed", e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::new("RequestFailed", e.to_string()))?;

        if !status.is_success() {
            // Security: Only log sanitized/truncated error body to avoid leaking sensitive data
            tracing::debug!("API error: {} - {}", status, sanitize_for_log(&body));
            return Err(error_from_response(status.as_u16(), &body));
        }

        if body.trim().is_empty() {
            return Ok(Value::Object(Params::new()));
        }

        serde_json::from_str(&body)
            .map_err(|e| ProviderError::new("InvalidResponse", format!("Failed to parse response JSON: {}", e)))
    }

    fn not_found_codes(&self) -> Vec<String> {
        self.model.not_found_codes()
    }

    fn throttling_codes(&self) -> Vec<String> {
        self.model.throttling_codes()
    }
}

/// Session producing HTTP clients that share one connection pool
#[derive(Clone)]
pub struct HttpSession {
    http: Client,
    endpoint: Url,
    token: Option<String>,
    services: Arc<HashMap<String, ServiceModel>>,
}

impl HttpSession {
    /// Create a session against `endpoint`
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        services: HashMap<String, ServiceModel>,
    ) -> crate::Result<Self> {
        let mut endpoint = Url::parse(endpoint)
            .map_err(|e| crate::Error::Validation(format!("invalid endpoint {}: {}", endpoint, e)))?;
        // Url::join drops the last path segment unless it ends with '/'
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(concat!("custodia/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            token,
            services: Arc::new(services),
        })
    }
}

impl SessionFactory for HttpSession {
    fn client(&self, service: &str, region: &str) -> crate::Result<Arc<dyn ProviderClient>> {
        let model = self.services.get(service).cloned().unwrap_or_default();
        Ok(Arc::new(HttpProviderClient {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            token: self.token.clone(),
            service: service.to_string(),
            region: region.to_string(),
            model,
        }))
    }
}
