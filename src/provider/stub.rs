//! Stub provider
//!
//! An in-memory [`SessionFactory`] whose operations are answered by
//! registered handlers. Every call is recorded so tests can assert on the
//! exact sequence of provider requests.
//!
//! Recorded responses can also be replayed from a directory of JSON files
//! named `{service}.{OperationName}_{n}.json`, each holding
//! `{"status_code": 200, "data": {...}}`.

use super::{PaginatorSpec, Params, ProviderClient, ProviderError, ServiceModel, SessionFactory};
use crate::resource::api_name;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(&Params) -> Result<Value, ProviderError> + Send + Sync>;

/// A single recorded provider call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub service: String,
    pub region: String,
    pub operation: String,
    pub params: Params,
}

/// Programmable session for tests and offline runs
#[derive(Clone, Default)]
pub struct StubSession {
    handlers: HashMap<(String, String), Handler>,
    services: HashMap<String, ServiceModel>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl StubSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the service model (paginators, error codes)
    pub fn with_service(mut self, service: &str, model: ServiceModel) -> Self {
        self.services.insert(service.to_string(), model);
        self
    }

    /// Declare one paginator
    pub fn paginate(mut self, service: &str, operation: &str, input: &str, output: &str, keys: &[&str]) -> Self {
        let spec = PaginatorSpec {
            input_token: input.to_string(),
            output_token: output.to_string(),
            result_keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        self.services
            .entry(service.to_string())
            .or_default()
            .paginators
            .insert(operation.to_string(), spec);
        self
    }

    /// Answer an operation with a handler
    pub fn on<F>(mut self, service: &str, operation: &str, handler: F) -> Self
    where
        F: Fn(&Params) -> Result<Value, ProviderError> + Send + Sync + 'static,
    {
        self.handlers
            .insert((service.to_string(), operation.to_string()), Arc::new(handler));
        self
    }

    /// Answer an operation with a fixed value
    pub fn respond(self, service: &str, operation: &str, value: Value) -> Self {
        self.on(service, operation, move |_| Ok(value.clone()))
    }

    /// Answer successive calls in order, repeating the last response
    pub fn sequence(mut self, service: &str, operation: &str, responses: Vec<Result<Value, ProviderError>>) -> Self {
        self.handlers
            .insert((service.to_string(), operation.to_string()), sequence_handler(responses));
        self
    }

    /// Load recorded responses from a flight-data directory
    pub fn from_flight_data(dir: &Path) -> crate::Result<Self> {
        #[derive(Deserialize)]
        struct Recorded {
            #[serde(default = "default_status")]
            status_code: u16,
            #[serde(default)]
            data: Value,
        }
        fn default_status() -> u16 {
            200
        }

        // (service, OperationName) -> ordered responses
        let mut recorded: BTreeMap<(String, String), BTreeMap<u32, Result<Value, ProviderError>>> =
            BTreeMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((service, rest)) = stem.split_once('.') else {
                continue;
            };
            let Some((operation, index)) = rest.rsplit_once('_') else {
                continue;
            };
            let Ok(index) = index.parse::<u32>() else {
                continue;
            };

            let content = std::fs::read_to_string(&path)?;
            let record: Recorded = serde_json::from_str(&content)?;
            let response = if (200..300).contains(&record.status_code) {
                Ok(record.data)
            } else {
                let code = record
                    .data
                    .pointer("/Error/Code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string();
                let message = record
                    .data
                    .pointer("/Error/Message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Err(ProviderError::new(code, message).with_status(record.status_code))
            };
            recorded
                .entry((service.to_string(), operation.to_string()))
                .or_default()
                .insert(index, response);
        }

        tracing::debug!("loaded {} recorded operations from {:?}", recorded.len(), dir);

        let mut session = Self::new();
        for (key, responses) in recorded {
            session
                .handlers
                .insert(key, sequence_handler(responses.into_values().collect()));
        }
        Ok(session)
    }

    /// Merge service models into a session built from flight data
    pub fn with_services(mut self, services: &HashMap<String, ServiceModel>) -> Self {
        for (name, model) in services {
            self.services.entry(name.clone()).or_insert_with(|| model.clone());
        }
        self
    }

    /// All calls made so far
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Calls made to one operation
    pub fn calls_to(&self, service: &str, operation: &str) -> Vec<Params> {
        self.calls()
            .into_iter()
            .filter(|c| c.service == service && c.operation == operation)
            .map(|c| c.params)
            .collect()
    }
}

/// Serve `responses` in order, repeating the last one
fn sequence_handler(responses: Vec<Result<Value, ProviderError>>) -> Handler {
    let state = Mutex::new(0usize);
    Arc::new(move |_| {
        let mut idx = state.lock().unwrap_or_else(|e| e.into_inner());
        let pick = (*idx).min(responses.len().saturating_sub(1));
        *idx += 1;
        responses
            .get(pick)
            .cloned()
            .unwrap_or_else(|| Ok(Value::Object(Params::new())))
    })
}

impl SessionFactory for StubSession {
    fn client(&self, service: &str, region: &str) -> crate::Result<Arc<dyn ProviderClient>> {
        let handlers = self
            .handlers
            .iter()
            .filter(|((svc, _), _)| svc == service)
            .map(|((_, op), h)| (op.clone(), h.clone()))
            .collect();
        Ok(Arc::new(StubClient {
            handlers,
            model: self.services.get(service).cloned().unwrap_or_default(),
            calls: self.calls.clone(),
            service: service.to_string(),
            region: region.to_string(),
        }))
    }
}

/// Client handed out by [`StubSession`]
pub struct StubClient {
    handlers: HashMap<String, Handler>,
    model: ServiceModel,
    calls: Arc<Mutex<Vec<Call>>>,
    service: String,
    region: String,
}

impl StubClient {
    fn handler(&self, operation: &str) -> Option<Handler> {
        // Flight data is keyed by the API name
        self.handlers
            .get(operation)
            .or_else(|| self.handlers.get(&api_name(operation)))
            .cloned()
    }
}

#[async_trait]
impl ProviderClient for StubClient {
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
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Call {
                service: self.service.clone(),
                region: self.region.clone(),
                operation: operation.to_string(),
                params: params.clone(),
            });

        match self.handler(operation) {
            Some(handler) => handler(params),
            None => Err(ProviderError::new(
                "UnknownOperation",
                format!("no stub for {}.{}", self.service, operation),
            )),
        }
    }

    fn not_found_codes(&self) -> Vec<String> {
        self.model.not_found_codes()
    }

    fn throttling_codes(&self) -> Vec<String> {
        self.model.throttling_codes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let session = StubSession::new().sequence(
            "ec2",
            "describe_images",
            vec![Err(ProviderError::new("Throttling", "")), Ok(json!({"Images": []}))],
        );
        let client = session.client("ec2", "us-east-1").unwrap();
        let params = Params::new();
        assert!(client.invoke("describe_images", &params).await.is_err());
        assert!(client.invoke("describe_images", &params).await.is_ok());
        assert!(client.invoke("describe_images", &params).await.is_ok());
        assert_eq!(session.calls_to("ec2", "describe_images").len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_operation_errors() {
        let session = StubSession::new();
        let client = session.client("ec2", "us-east-1").unwrap();
        let err = client.invoke("describe_nothing", &Params::new()).await.unwrap_err();
        assert_eq!(err.code, "UnknownOperation");
    }

    #[tokio::test]
    async fn test_flight_data_replay() {
        let dir = std::env::temp_dir().join(format!("custodia-flight-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("acm.ListCertificates_1.json"),
            r#"{"status_code": 200, "data": {"CertificateSummaryList": [{"CertificateArn": "arn:1"}]}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("acm.DescribeCertificate_1.json"),
            r#"{"status_code": 400, "data": {"Error": {"Code": "ResourceNotFoundException", "Message": "gone"}}}"#,
        )
        .unwrap();

        let session = StubSession::from_flight_data(&dir).unwrap();
        let client = session.client("acm", "us-east-1").unwrap();
        let listed = client.invoke("list_certificates", &Params::new()).await.unwrap();
        assert_eq!(listed["CertificateSummaryList"][0]["CertificateArn"], "arn:1");
        let err = client.invoke("describe_certificate", &Params::new()).await.unwrap_err();
        assert_eq!(err.code, "ResourceNotFoundException");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
