use bigdecimal::{BigDecimal, ToPrimitive};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::config::StripeConfig;
use crate::core::shared::enums::TransactionStatus;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct StripeClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePaymentIntent {
    pub id: String,
    /// Minor units (cents).
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub customer: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateCustomerParams {
    pub organization_id: i64,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentIntentParams {
    pub organization_id: i64,
    pub customer_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeWebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeWebhookData,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeWebhookData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StripeError {
    #[error("Stripe API error: {0}")]
    Api(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Stripe is not configured")]
    NotConfigured,
}

/// Ledger status for a payment intent status.
pub fn transaction_status_for(intent_status: &str) -> TransactionStatus {
    match intent_status {
        "succeeded" => TransactionStatus::Completed,
        "processing" => TransactionStatus::Pending,
        s if s.starts_with("requires_") => TransactionStatus::Pending,
        "canceled" => TransactionStatus::Reversed,
        _ => TransactionStatus::Failed,
    }
}

/// Decimal major units to integer minor units, rounded to the nearest cent.
pub fn to_cents(amount: &BigDecimal) -> Option<i64> {
    (amount * BigDecimal::from(100)).round(0).to_i64()
}

pub fn from_cents(cents: i64) -> BigDecimal {
    (BigDecimal::from(cents) / BigDecimal::from(100)).with_scale(2)
}

/// Verifies a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=...]`) against
/// the raw payload and parses the event envelope.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: i64,
) -> Result<StripeWebhookEvent, StripeError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(|| StripeError::InvalidWebhook("Missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(StripeError::InvalidWebhook("Missing signature".into()));
    }
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| StripeError::InvalidWebhook("Invalid timestamp".into()))?;
    if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(StripeError::InvalidWebhook("Timestamp outside tolerance".into()));
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected).is_ok()
    });
    if !matched {
        return Err(StripeError::InvalidWebhook("Signature mismatch".into()));
    }
    parse_event(payload)
}

pub fn parse_event(payload: &str) -> Result<StripeWebhookEvent, StripeError> {
    serde_json::from_str(payload).map_err(|e| StripeError::Parse(e.to_string()))
}

/// Builds a header value the way Stripe signs test payloads.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> Result<String, StripeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| StripeError::InvalidWebhook("Invalid webhook secret".into()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

impl StripeClient {
    pub fn new(api_key: String, base_url: String) -> Result<Self, StripeError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StripeError::Network(e.to_string()))?;
        Ok(Self {
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `None` when no secret key is configured.
    pub fn from_config(config: &StripeConfig) -> Result<Option<Self>, StripeError> {
        match &config.secret_key {
            Some(key) => Self::new(key.clone(), config.base_url.clone()).map(Some),
            None => Ok(None),
        }
    }

    pub async fn create_customer(
        &self,
        params: CreateCustomerParams,
    ) -> Result<StripeCustomer, StripeError> {
        let mut form: Vec<(String, String)> = vec![(
            "metadata[organization_id]".to_string(),
            params.organization_id.to_string(),
        )];
        if let Some(email) = params.email {
            form.push(("email".to_string(), email));
        }
        if let Some(name) = params.name {
            form.push(("name".to_string(), name));
        }

        let response = self
            .client
            .post(format!("{}/customers", self.base_url))
            .bearer_auth(&self.api_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        handle_response(response).await
    }

    pub async fn create_payment_intent(
        &self,
        params: CreatePaymentIntentParams,
    ) -> Result<StripePaymentIntent, StripeError> {
        let cents = to_cents(&params.amount)
            .filter(|c| *c > 0)
            .ok_or_else(|| StripeError::Api(format!("invalid amount {}", params.amount)))?;
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), cents.to_string()),
            ("currency".to_string(), params.currency.to_lowercase()),
            (
                "metadata[organization_id]".to_string(),
                params.organization_id.to_string(),
            ),
            ("metadata[purpose]".to_string(), "recharge".to_string()),
        ];
        if let Some(customer) = params.customer_id {
            form.push(("customer".to_string(), customer));
        }
        if let Some(method) = params.payment_method {
            form.push(("payment_method".to_string(), method));
            form.push(("confirm".to_string(), "true".to_string()));
            form.push(("off_session".to_string(), "true".to_string()));
        }

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .bearer_auth(&self.api_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        handle_response(response).await
    }

    pub async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<StripePaymentIntent, StripeError> {
        let response = self
            .client
            .get(format!("{}/payment_intents/{}", self.base_url, payment_intent_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        handle_response(response).await
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, StripeError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| StripeError::Network(e.to_string()))?;

    if !status.is_success() {
        #[derive(Deserialize)]
        struct StripeApiError {
            error: StripeApiErrorDetail,
        }

        #[derive(Deserialize)]
        struct StripeApiErrorDetail {
            message: String,
        }

        if let Ok(error) = serde_json::from_str::<StripeApiError>(&body) {
            return Err(StripeError::Api(error.error.message));
        }
        return Err(StripeError::Api(format!("HTTP {}: {}", status, body)));
    }

    serde_json::from_str(&body).map_err(|e| StripeError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_1"}}}"#;

    #[test]
    fn test_valid_signature_parses_event() {
        let now = 1_700_000_000;
        let header = sign_payload(PAYLOAD, SECRET, now).unwrap();
        let event = verify_signature(PAYLOAD, &header, SECRET, now + 10).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(event.data.object["id"], "pi_1");
    }

    #[test]
    fn test_stale_signature_rejected() {
        let now = 1_700_000_000;
        let header = sign_payload(PAYLOAD, SECRET, now).unwrap();
        let err = verify_signature(PAYLOAD, &header, SECRET, now + 301).unwrap_err();
        assert!(matches!(err, StripeError::InvalidWebhook(_)));
    }

    #[test]
    fn test_forged_signature_rejected() {
        let now = 1_700_000_000;
        let header = sign_payload(PAYLOAD, "whsec_other", now).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_err());

        let header = sign_payload(PAYLOAD, SECRET, now).unwrap();
        let tampered = PAYLOAD.replace("pi_1", "pi_2");
        assert!(verify_signature(&tampered, &header, SECRET, now).is_err());

        assert!(verify_signature(PAYLOAD, "v1=deadbeef", SECRET, now).is_err());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let now = 1_700_000_000;
        let good = sign_payload(PAYLOAD, SECRET, now).unwrap();
        let v1 = good.split_once(",v1=").unwrap().1;
        let header = format!("t={},v1=00ff,v1={}", now, v1);
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(transaction_status_for("succeeded"), TransactionStatus::Completed);
        assert_eq!(transaction_status_for("processing"), TransactionStatus::Pending);
        assert_eq!(
            transaction_status_for("requires_payment_method"),
            TransactionStatus::Pending
        );
        assert_eq!(transaction_status_for("canceled"), TransactionStatus::Reversed);
        assert_eq!(transaction_status_for("exploded"), TransactionStatus::Failed);
    }

    #[test]
    fn test_cents_conversion() {
        let amount = BigDecimal::from_str("25.507").unwrap();
        assert_eq!(to_cents(&amount), Some(2551));
        assert_eq!(from_cents(2550), BigDecimal::from_str("25.50").unwrap());
    }

    #[tokio::test]
    async fn test_create_payment_intent_posts_cents() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payment_intents")
            .match_header("authorization", "Bearer sk_test")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("amount".into(), "5000".into()),
                mockito::Matcher::UrlEncoded("currency".into(), "usd".into()),
                mockito::Matcher::UrlEncoded("metadata[organization_id]".into(), "7".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"id":"pi_9","amount":5000,"currency":"usd","status":"requires_payment_method","customer":null,"client_secret":"cs","metadata":{"organization_id":"7"}}"#,
            )
            .create_async()
            .await;

        let client = StripeClient::new("sk_test".into(), server.url()).unwrap();
        let intent = client
            .create_payment_intent(CreatePaymentIntentParams {
                organization_id: 7,
                customer_id: None,
                amount: BigDecimal::from(50),
                currency: "USD".into(),
                payment_method: None,
            })
            .await
            .unwrap();
        assert_eq!(intent.id, "pi_9");
        assert_eq!(intent.metadata.get("organization_id").map(String::as_str), Some("7"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_message_surfaces() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/payment_intents/pi_missing")
            .with_status(404)
            .with_body(r#"{"error":{"message":"No such payment_intent: 'pi_missing'"}}"#)
            .create_async()
            .await;

        let client = StripeClient::new("sk_test".into(), server.url()).unwrap();
        let err = client.retrieve_payment_intent("pi_missing").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Stripe API error: No such payment_intent: 'pi_missing'"
        );
    }
}
