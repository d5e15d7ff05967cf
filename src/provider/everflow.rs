use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::core::config::EverflowConfig;
use crate::core::shared::enums::ProviderType;
use crate::entities::EntityKind;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API_KEY_HEADER: &str = "X-Eflow-API-Key";

/// Raw provider representation of a mirrored row.
pub type ProviderRecord = Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Provider is not configured")]
    NotConfigured,
}

impl ProviderError {
    /// Message as the provider reported it, for `sync_error`.
    pub fn provider_message(&self) -> String {
        match self {
            Self::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Outbound mirror operations against one provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    async fn create(&self, kind: EntityKind, body: &Value) -> Result<ProviderRecord, ProviderError>;

    async fn update(
        &self,
        kind: EntityKind,
        provider_id: &str,
        body: &Value,
    ) -> Result<ProviderRecord, ProviderError>;

    async fn fetch(
        &self,
        kind: EntityKind,
        provider_id: &str,
    ) -> Result<Option<ProviderRecord>, ProviderError>;

    /// Looks a row up by the label written on create. Used to recover a
    /// create whose response was lost.
    async fn find_by_reference(
        &self,
        kind: EntityKind,
        reference: &str,
    ) -> Result<Option<ProviderRecord>, ProviderError>;
}

#[async_trait]
pub trait ProviderReporting: Send + Sync {
    async fn entity_report(&self, query: &Value) -> Result<Value, ProviderError>;
    async fn conversions(&self, query: &Value) -> Result<Value, ProviderError>;
    async fn conversion(&self, conversion_id: &str) -> Result<Value, ProviderError>;
    async fn export_conversions(&self, query: &Value) -> Result<Value, ProviderError>;
    async fn dashboard_summary(&self, query: &Value) -> Result<Value, ProviderError>;
}

/// Network collection an entity kind lives in.
pub fn collection(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Advertiser => "advertisers",
        EntityKind::Affiliate => "affiliates",
        EntityKind::Campaign => "offers",
        EntityKind::TrackingLink => "tracking/offers/clicks",
    }
}

#[derive(Clone)]
pub struct EverflowClient {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for EverflowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EverflowClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl EverflowClient {
    pub fn new(config: &EverflowConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(API_KEY_HEADER, api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json"))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Network(format!("request timed out: {}", e))
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;
        handle_response(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ProviderError> {
        debug!("Everflow POST {}", path);
        self.send(self.request(reqwest::Method::POST, path)?.json(body)).await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<Value, ProviderError> {
        debug!("Everflow PUT {}", path);
        self.send(self.request(reqwest::Method::PUT, path)?.json(body)).await
    }

    async fn get(&self, path: &str) -> Result<Value, ProviderError> {
        debug!("Everflow GET {}", path);
        self.send(self.request(reqwest::Method::GET, path)?).await
    }
}

async fn handle_response(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;

    if !status.is_success() {
        #[derive(Deserialize)]
        struct EverflowApiError {
            message: String,
        }

        let message = match serde_json::from_str::<EverflowApiError>(&body) {
            Ok(error) => error.message,
            Err(_) => body,
        };
        return Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        });
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| ProviderError::Parse(e.to_string()))
}

#[async_trait]
impl ProviderClient for EverflowClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Everflow
    }

    async fn create(&self, kind: EntityKind, body: &Value) -> Result<ProviderRecord, ProviderError> {
        self.post(&format!("/networks/{}", collection(kind)), body).await
    }

    async fn update(
        &self,
        kind: EntityKind,
        provider_id: &str,
        body: &Value,
    ) -> Result<ProviderRecord, ProviderError> {
        match kind {
            // Link generation is idempotent for an offer/affiliate pair.
            EntityKind::TrackingLink => self.create(kind, body).await,
            _ => {
                self.put(&format!("/networks/{}/{}", collection(kind), provider_id), body)
                    .await
            }
        }
    }

    async fn fetch(
        &self,
        kind: EntityKind,
        provider_id: &str,
    ) -> Result<Option<ProviderRecord>, ProviderError> {
        if kind == EntityKind::TrackingLink {
            return Ok(None);
        }
        match self
            .get(&format!("/networks/{}/{}", collection(kind), provider_id))
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(ProviderError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_by_reference(
        &self,
        kind: EntityKind,
        reference: &str,
    ) -> Result<Option<ProviderRecord>, ProviderError> {
        if kind == EntityKind::TrackingLink {
            return Ok(None);
        }
        let body = json!({
            "filters": {},
            "search_terms": [{ "search_type": "label", "value": reference }],
        });
        let table = self
            .post(&format!("/networks/{}/table", collection(kind)), &body)
            .await?;
        let rows = table
            .get(collection(kind))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows.into_iter().find(|row| has_label(row, reference)))
    }
}

fn has_label(row: &Value, reference: &str) -> bool {
    let direct = row.get("labels").and_then(Value::as_array);
    let related = row
        .pointer("/relationship/labels/entries")
        .and_then(Value::as_array);
    direct
        .into_iter()
        .chain(related)
        .flatten()
        .any(|label| label.as_str() == Some(reference))
}

#[async_trait]
impl ProviderReporting for EverflowClient {
    async fn entity_report(&self, query: &Value) -> Result<Value, ProviderError> {
        self.post("/advertisers/reporting/entity", query).await
    }

    async fn conversions(&self, query: &Value) -> Result<Value, ProviderError> {
        self.post("/advertisers/reporting/conversions", query).await
    }

    async fn conversion(&self, conversion_id: &str) -> Result<Value, ProviderError> {
        self.get(&format!("/advertisers/reporting/conversions/{}", conversion_id))
            .await
    }

    async fn export_conversions(&self, query: &Value) -> Result<Value, ProviderError> {
        self.post("/advertisers/reporting/conversions/export", query)
            .await
    }

    async fn dashboard_summary(&self, query: &Value) -> Result<Value, ProviderError> {
        self.post("/advertisers/dashboard/summary", query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::Server) -> EverflowClient {
        EverflowClient::new(&EverflowConfig {
            api_key: Some("ef-test-key".to_string()),
            base_url: server.url(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_sends_api_key_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/networks/advertisers")
            .match_header("x-eflow-api-key", "ef-test-key")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({ "name": "Acme" })))
            .with_status(200)
            .with_body(r#"{"network_advertiser_id": 991, "name": "Acme"}"#)
            .create_async()
            .await;

        let record = client_for(&server)
            .create(EntityKind::Advertiser, &json!({ "name": "Acme" }))
            .await
            .unwrap();
        assert_eq!(record["network_advertiser_id"], 991);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_message_is_preserved_verbatim() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/networks/offers/55")
            .with_status(422)
            .with_body(r#"{"message": "Invalid destination_url: must start with https://"}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .update(EntityKind::Campaign, "55", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 422, .. }));
        assert_eq!(
            err.provider_message(),
            "Invalid destination_url: must start with https://"
        );
    }

    #[tokio::test]
    async fn test_non_json_error_body_kept_as_is() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/networks/affiliates")
            .with_status(502)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let err = client_for(&server)
            .create(EntityKind::Affiliate, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.provider_message(), "upstream unavailable");
    }

    #[tokio::test]
    async fn test_fetch_missing_row_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/networks/affiliates/404")
            .with_status(404)
            .with_body(r#"{"message": "not found"}"#)
            .create_async()
            .await;

        let record = client_for(&server)
            .fetch(EntityKind::Affiliate, "404")
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_find_by_reference_matches_label() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/networks/advertisers/table")
            .match_body(Matcher::PartialJson(json!({
                "search_terms": [{ "search_type": "label", "value": "advertiser_id:7" }]
            })))
            .with_status(200)
            .with_body(
                json!({
                    "advertisers": [
                        { "network_advertiser_id": 1, "labels": ["advertiser_id:70"] },
                        { "network_advertiser_id": 2, "labels": ["advertiser_id:7"] }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let found = client_for(&server)
            .find_by_reference(EntityKind::Advertiser, "advertiser_id:7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["network_advertiser_id"], 2);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_not_configured() {
        let client = EverflowClient::new(&EverflowConfig {
            api_key: None,
            base_url: "http://127.0.0.1:1".to_string(),
        })
        .unwrap();
        let err = client
            .create(EntityKind::Advertiser, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured));
    }

    #[tokio::test]
    async fn test_reporting_paths() {
        let mut server = mockito::Server::new_async().await;
        let entity = server
            .mock("POST", "/advertisers/reporting/entity")
            .with_status(200)
            .with_body(r#"{"table": []}"#)
            .create_async()
            .await;
        let single = server
            .mock("GET", "/advertisers/reporting/conversions/abc")
            .with_status(200)
            .with_body(r#"{"conversion_id": "abc"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        client.entity_report(&json!({})).await.unwrap();
        let conversion = client.conversion("abc").await.unwrap();
        assert_eq!(conversion["conversion_id"], "abc");
        entity.assert_async().await;
        single.assert_async().await;
    }
}
