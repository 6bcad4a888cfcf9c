//! Stripe payment provider client.
//!
//! Creates hosted checkout sessions for invoices and issues refunds. Webhook
//! payload types used by the reconciler live here as well.

use crate::config::StripeConfig;
use crate::models::{Invoice, StaffingRequest};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentProviderError {
    #[error("Payment provider credentials not configured")]
    NotConfigured,

    #[error("Payment provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Payment provider error: {code} - {message}")]
    Api { code: String, message: String },

    #[error("Invalid payment provider response: {0}")]
    InvalidResponse(String),
}

impl From<PaymentProviderError> for AppError {
    fn from(err: PaymentProviderError) -> Self {
        match err {
            PaymentProviderError::NotConfigured => AppError::ServiceUnavailable,
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

/// Hosted checkout page for an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        invoice: &Invoice,
        request: &StaffingRequest,
    ) -> Result<CheckoutSession, PaymentProviderError>;

    /// Refund a captured payment in full. Returns the provider's refund id.
    async fn refund_payment(&self, payment_intent: &str) -> Result<String, PaymentProviderError>;

    fn is_configured(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
}

/// Webhook event envelope.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// `data.object` of a `checkout.session.completed` event.
#[derive(Debug, Deserialize)]
pub struct CheckoutSessionObject {
    #[serde(default)]
    pub payment_status: Option<String>,
    /// Amount in cents.
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `data.object` of a `charge.refunded` event.
#[derive(Debug, Deserialize)]
pub struct ChargeObject {
    #[serde(default)]
    pub payment_intent: Option<String>,
}

/// Convert dollars to cents, rounding to the nearest cent.
pub fn to_cents(amount: Decimal) -> i64 {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Convert cents to dollars.
pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Stripe client for interacting with the Stripe API.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Result<Self, PaymentProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    fn checkout_params(
        &self,
        invoice: &Invoice,
        request: &StaffingRequest,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), self.config.success_url.clone()),
            ("customer_email".to_string(), request.email.clone()),
            (
                "metadata[invoice_id]".to_string(),
                invoice.invoice_id.to_string(),
            ),
            (
                "metadata[request_id]".to_string(),
                invoice.request_id.to_string(),
            ),
            (
                "payment_intent_data[metadata][invoice_id]".to_string(),
                invoice.invoice_id.to_string(),
            ),
        ];

        // after a partial payment only what is still owed is charged
        let lines = if invoice.amount_paid > Decimal::ZERO {
            vec![("Outstanding Balance", invoice.balance)]
        } else {
            vec![
                ("Event Staff Services", invoice.subtotal),
                ("Service Fee", invoice.service_fee),
                ("Transaction Fee", invoice.transaction_fee),
            ]
        };

        let mut index = 0;
        for (name, amount) in lines {
            let cents = to_cents(amount);
            if cents <= 0 {
                continue;
            }
            let prefix = format!("line_items[{}]", index);
            params.push((format!("{}[price_data][currency]", prefix), "usd".to_string()));
            params.push((
                format!("{}[price_data][product_data][name]", prefix),
                name.to_string(),
            ));
            params.push((
                format!("{}[price_data][unit_amount]", prefix),
                cents.to_string(),
            ));
            params.push((format!("{}[quantity]", prefix), "1".to_string()));
            index += 1;
        }

        params
    }

    async fn parse_error(response: reqwest::Response) -> PaymentProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match serde_json::from_str::<StripeErrorResponse>(&body) {
            Ok(parsed) => PaymentProviderError::Api {
                code: parsed
                    .error
                    .code
                    .or(parsed.error.error_type)
                    .unwrap_or_else(|| status.as_u16().to_string()),
                message: parsed.error.message.unwrap_or_default(),
            },
            Err(_) => PaymentProviderError::Api {
                code: status.as_u16().to_string(),
                message: body,
            },
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        invoice: &Invoice,
        request: &StaffingRequest,
    ) -> Result<CheckoutSession, PaymentProviderError> {
        if !self.is_configured() {
            return Err(PaymentProviderError::NotConfigured);
        }

        let url = format!("{}/v1/checkout/sessions", self.config.api_base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .form(&self.checkout_params(invoice, request))
            .send()
            .await?;

        if !response.status().is_success() {
            let error = Self::parse_error(response).await;
            tracing::error!(
                invoice_id = %invoice.invoice_id,
                error = %error,
                "Stripe checkout session creation failed"
            );
            return Err(error);
        }

        let session: CheckoutSession = response
            .json()
            .await
            .map_err(|e| PaymentProviderError::InvalidResponse(e.to_string()))?;

        tracing::info!(
            invoice_id = %invoice.invoice_id,
            session_id = %session.id,
            "Stripe checkout session created"
        );
        Ok(session)
    }

    async fn refund_payment(&self, payment_intent: &str) -> Result<String, PaymentProviderError> {
        if !self.is_configured() {
            return Err(PaymentProviderError::NotConfigured);
        }

        let url = format!("{}/v1/refunds", self.config.api_base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .form(&[("payment_intent", payment_intent)])
            .send()
            .await?;

        if !response.status().is_success() {
            let error = Self::parse_error(response).await;
            tracing::error!(payment_intent = %payment_intent, error = %error, "Stripe refund failed");
            return Err(error);
        }

        let refund: RefundResponse = response
            .json()
            .await
            .map_err(|e| PaymentProviderError::InvalidResponse(e.to_string()))?;

        tracing::info!(payment_intent = %payment_intent, refund_id = %refund.id, "Stripe refund created");
        Ok(refund.id)
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }
}

/// In-memory payment provider for tests.
#[derive(Default)]
pub struct MockPaymentProvider {
    pub fail: AtomicBool,
    pub checkout_calls: AtomicUsize,
    pub refunds: Mutex<Vec<String>>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_checkout_session(
        &self,
        invoice: &Invoice,
        _request: &StaffingRequest,
    ) -> Result<CheckoutSession, PaymentProviderError> {
        self.checkout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PaymentProviderError::Api {
                code: "api_error".to_string(),
                message: "mock failure".to_string(),
            });
        }
        Ok(CheckoutSession {
            id: format!("cs_test_{}", invoice.invoice_id.simple()),
            url: format!("https://checkout.test/pay/{}", invoice.invoice_id),
        })
    }

    async fn refund_payment(&self, payment_intent: &str) -> Result<String, PaymentProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PaymentProviderError::Api {
                code: "charge_already_refunded".to_string(),
                message: "mock failure".to_string(),
            });
        }
        if let Ok(mut refunds) = self.refunds.lock() {
            refunds.push(payment_intent.to_string());
        }
        Ok(format!("re_{}", payment_intent))
    }

    fn is_configured(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceBreakdown;
    use chrono::Utc;
    use secrecy::Secret;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> StripeConfig {
        StripeConfig {
            api_key: Secret::new("sk_test_123".to_string()),
            webhook_secret: Secret::new("whsec_test".to_string()),
            api_base_url: base_url.to_string(),
            success_url: "https://example.com/paid".to_string(),
            webhook_tolerance_seconds: 300,
            timeout_seconds: 5,
        }
    }

    fn fixture(service_fee: Decimal) -> (Invoice, StaffingRequest) {
        let now = Utc::now();
        let request = StaffingRequest {
            request_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            event_location: None,
            start_date: now,
            created_utc: now,
        };
        let breakdown = PriceBreakdown {
            subtotal: Decimal::new(650, 0),
            transaction_fee: Decimal::new(2275, 2),
            service_fee,
            total: Decimal::new(650, 0) + Decimal::new(2275, 2) + service_fee,
        };
        (Invoice::for_request(&request, &breakdown, None, now), request)
    }

    #[test]
    fn test_cents_conversion() {
        assert_eq!(to_cents(Decimal::new(87458, 2)), 87458);
        assert_eq!(to_cents(Decimal::new(1005, 3)), 101);
        assert_eq!(from_cents(87458), Decimal::new(87458, 2));
    }

    #[test]
    fn test_zero_line_items_are_omitted() {
        let client = StripeClient::new(test_config("http://localhost")).unwrap();
        let (invoice, request) = fixture(Decimal::ZERO);

        let params = client.checkout_params(&invoice, &request);
        let names: Vec<&str> = params
            .iter()
            .filter(|(k, _)| k.ends_with("[product_data][name]"))
            .map(|(_, v)| v.as_str())
            .collect();

        assert_eq!(names, vec!["Event Staff Services", "Transaction Fee"]);
        assert!(params
            .iter()
            .any(|(k, v)| k == "line_items[1][price_data][unit_amount]" && v == "2275"));
    }

    fn charged_cents(params: &[(String, String)]) -> i64 {
        params
            .iter()
            .filter(|(k, _)| k.ends_with("[unit_amount]"))
            .map(|(_, v)| v.parse::<i64>().unwrap())
            .sum()
    }

    #[test]
    fn test_partially_paid_invoice_charges_balance() {
        let client = StripeClient::new(test_config("http://localhost")).unwrap();
        let (mut invoice, request) = fixture(Decimal::new(20183, 2));
        assert_eq!(
            charged_cents(&client.checkout_params(&invoice, &request)),
            to_cents(invoice.amount)
        );

        invoice.apply_payment(Decimal::new(800, 0), None);
        assert_eq!(invoice.balance, Decimal::new(7458, 2));

        let params = client.checkout_params(&invoice, &request);
        assert_eq!(charged_cents(&params), 7458);
        assert!(params
            .iter()
            .any(|(k, v)| k == "line_items[0][price_data][product_data][name]"
                && v == "Outstanding Balance"));
        assert!(!params.iter().any(|(k, _)| k.starts_with("line_items[1]")));
    }

    #[test]
    fn test_is_configured() {
        let client = StripeClient::new(test_config("http://localhost")).unwrap();
        assert!(client.is_configured());

        let mut config = test_config("http://localhost");
        config.api_key = Secret::new(String::new());
        let client = StripeClient::new(config).unwrap();
        assert!(!client.is_configured());
    }

    #[tokio::test]
    async fn test_create_checkout_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(body_string_contains("customer_email=ada%40example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.com/c/pay/cs_test_1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = StripeClient::new(test_config(&server.uri())).unwrap();
        let (invoice, request) = fixture(Decimal::new(20183, 2));

        let session = client
            .create_checkout_session(&invoice, &request)
            .await
            .unwrap();
        assert_eq!(session.id, "cs_test_1");
        assert!(session.url.ends_with("cs_test_1"));
    }

    #[tokio::test]
    async fn test_api_error_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/refunds"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "type": "invalid_request_error",
                    "code": "charge_already_refunded",
                    "message": "Charge has already been refunded."
                }
            })))
            .mount(&server)
            .await;

        let client = StripeClient::new(test_config(&server.uri())).unwrap();
        let err = client.refund_payment("pi_123").await.unwrap_err();

        match err {
            PaymentProviderError::Api { code, message } => {
                assert_eq!(code, "charge_already_refunded");
                assert_eq!(message, "Charge has already been refunded.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refund_payment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/refunds"))
            .and(body_string_contains("payment_intent=pi_123"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "re_1" })),
            )
            .mount(&server)
            .await;

        let client = StripeClient::new(test_config(&server.uri())).unwrap();
        assert_eq!(client.refund_payment("pi_123").await.unwrap(), "re_1");
    }

    #[tokio::test]
    async fn test_unconfigured_client_refuses() {
        let mut config = test_config("http://localhost");
        config.api_key = Secret::new(String::new());
        let client = StripeClient::new(config).unwrap();

        let err = client.refund_payment("pi_123").await.unwrap_err();
        assert!(matches!(err, PaymentProviderError::NotConfigured));
    }
}
