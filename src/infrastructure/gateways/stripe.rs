use crate::domain::gateway::{
    ChargeRequest, GatewayError, GatewayErrorCode, GatewayResult, Lookup, PaymentGateway,
    RefundRequest, VoidRequest,
};
use crate::domain::payment::{FeeBreakdown, PaymentMethod};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub const NAME: &str = "stripe";

const SUPPORTED: &[PaymentMethod] = &[
    PaymentMethod::CreditCard,
    PaymentMethod::DebitCard,
    PaymentMethod::DigitalWallet,
];

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    last_payment_error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
    payment_intent: Option<IntentRef>,
}

#[derive(Debug, Deserialize)]
struct IntentRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResult<T> {
    data: Vec<T>,
}

impl ApiError {
    fn into_result(self, raw: serde_json::Value) -> GatewayResult {
        let code = self
            .decline_code
            .as_deref()
            .or(self.code.as_deref())
            .map(GatewayErrorCode::from_decline_code)
            .unwrap_or(GatewayErrorCode::ProcessingError);
        let message = self
            .message
            .unwrap_or_else(|| "payment declined".to_string());
        let result = GatewayResult::declined(code, message, raw);
        match self.payment_intent {
            Some(intent) => result.with_external_id(intent.id),
            None => result,
        }
    }
}

/// Card and wallet payments through the Stripe Payment Intents API.
///
/// Raw card numbers are never sent: the caller must supply a payment method
/// token (`pm_…`) obtained client-side. Every mutating call carries the
/// correlation id as `Idempotency-Key`, so a retried request cannot charge
/// twice, and as `metadata[correlation_id]`, which [`PaymentGateway::lookup`]
/// searches on.
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl StripeGateway {
    pub fn new(secret_key: &str, api_base: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("stripe http client: {e}")))?;
        Ok(Self {
            client,
            secret_key: secret_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Sends the request and splits the answer into business outcomes
    /// (`Ok`, including 4xx declines) and transport failures (`Err`).
    async fn send(
        &self,
        request: RequestBuilder,
    ) -> std::result::Result<(StatusCode, serde_json::Value), GatewayError> {
        let response = request
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GatewayError::Unavailable {
                status: status.as_u16(),
            });
        }
        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        debug!(status = status.as_u16(), "stripe response");
        Ok((status, body))
    }

    fn intent_result(intent: PaymentIntent, amount: Decimal, raw: serde_json::Value) -> GatewayResult {
        match intent.status.as_str() {
            "succeeded" => GatewayResult::completed(intent.id, FeeBreakdown::card_rate(amount), raw),
            "processing" | "requires_action" | "requires_confirmation" | "requires_capture" => {
                GatewayResult::pending(intent.id, FeeBreakdown::card_rate(amount), raw)
            }
            _ => match intent.last_payment_error {
                Some(error) => error.into_result(raw).with_external_id(intent.id),
                None => GatewayResult::declined(
                    GatewayErrorCode::Other(intent.status.clone()),
                    format!("payment intent {}", intent.status),
                    raw,
                )
                .with_external_id(intent.id),
            },
        }
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(e.to_string())
    }
}

fn parse<T: DeserializeOwned>(raw: &serde_json::Value) -> std::result::Result<T, GatewayError> {
    serde_json::from_value(raw.clone()).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}

fn decline(raw: serde_json::Value) -> std::result::Result<GatewayResult, GatewayError> {
    let envelope: ErrorEnvelope = parse(&raw)?;
    Ok(envelope.error.into_result(raw))
}

fn payment_token(request: &ChargeRequest) -> Option<&str> {
    match request.method {
        PaymentMethod::DigitalWallet => request.wallet.as_ref().map(|w| w.token.as_str()),
        _ => request.card.as_ref().and_then(|c| c.token.as_deref()),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_methods(&self) -> &[PaymentMethod] {
        SUPPORTED
    }

    fn validate_payment_method(&self, request: &ChargeRequest) -> std::result::Result<(), GatewayErrorCode> {
        if !SUPPORTED.contains(&request.method) {
            return Err(GatewayErrorCode::InvalidPaymentMethod);
        }
        match payment_token(request) {
            Some(token) if !token.is_empty() => Ok(()),
            _ => Err(GatewayErrorCode::InvalidPaymentMethod),
        }
    }

    async fn process_payment(&self, request: &ChargeRequest) -> std::result::Result<GatewayResult, GatewayError> {
        let token = payment_token(request).unwrap_or_default();
        let mut form = vec![
            ("amount".to_string(), request.amount.minor_units().to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("payment_method".to_string(), token.to_string()),
            ("confirm".to_string(), "true".to_string()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
            (
                "automatic_payment_methods[allow_redirects]".to_string(),
                "never".to_string(),
            ),
            (
                "metadata[correlation_id]".to_string(),
                request.correlation_id.clone(),
            ),
        ];
        form.extend(
            request
                .metadata
                .iter()
                .map(|(k, v)| (format!("metadata[{k}]"), v.clone())),
        );

        let (status, raw) = self
            .send(
                self.client
                    .post(self.url("/v1/payment_intents"))
                    .header("Idempotency-Key", &request.correlation_id)
                    .form(&form),
            )
            .await?;
        if !status.is_success() {
            return decline(raw);
        }
        let intent: PaymentIntent = parse(&raw)?;
        Ok(Self::intent_result(intent, request.amount.value(), raw))
    }

    async fn process_refund(&self, request: &RefundRequest) -> std::result::Result<GatewayResult, GatewayError> {
        let form = [
            ("payment_intent", request.external_transaction_id.clone()),
            ("amount", request.amount.minor_units().to_string()),
            ("metadata[correlation_id]", request.correlation_id.clone()),
            ("metadata[reason]", request.reason.clone()),
        ];
        let (status, raw) = self
            .send(
                self.client
                    .post(self.url("/v1/refunds"))
                    .header("Idempotency-Key", &request.correlation_id)
                    .form(&form),
            )
            .await?;
        if !status.is_success() {
            return decline(raw);
        }
        let refund: StripeRefund = parse(&raw)?;
        let fees = FeeBreakdown::none(request.amount.value());
        Ok(match refund.status.as_str() {
            "succeeded" => GatewayResult::completed(refund.id, fees, raw),
            "pending" | "requires_action" => GatewayResult::pending(refund.id, fees, raw),
            _ => GatewayResult::declined(
                GatewayErrorCode::from_decline_code(
                    refund.failure_reason.as_deref().unwrap_or("processing_error"),
                ),
                format!("refund {}", refund.status),
                raw,
            )
            .with_external_id(refund.id),
        })
    }

    async fn process_void(&self, request: &VoidRequest) -> std::result::Result<GatewayResult, GatewayError> {
        let path = format!("/v1/payment_intents/{}/cancel", request.external_transaction_id);
        let (status, raw) = self
            .send(
                self.client
                    .post(self.url(&path))
                    .header("Idempotency-Key", &request.correlation_id)
                    .form(&[("cancellation_reason", "requested_by_customer")]),
            )
            .await?;
        if !status.is_success() {
            return decline(raw);
        }
        let intent: PaymentIntent = parse(&raw)?;
        Ok(if intent.status == "canceled" {
            GatewayResult::completed(intent.id, FeeBreakdown::default(), raw)
        } else {
            GatewayResult::declined(
                GatewayErrorCode::UnsupportedOperation,
                format!("payment intent is {}", intent.status),
                raw,
            )
        })
    }

    async fn lookup(&self, correlation_id: &str) -> std::result::Result<Lookup, GatewayError> {
        let query = format!("metadata['correlation_id']:'{correlation_id}'");
        let (status, raw) = self
            .send(
                self.client
                    .get(self.url("/v1/payment_intents/search"))
                    .query(&[("query", query)]),
            )
            .await?;
        if !status.is_success() {
            return Err(GatewayError::InvalidResponse(format!(
                "search failed with HTTP {status}"
            )));
        }
        let found: SearchResult<serde_json::Value> = parse(&raw)?;
        let Some(first) = found.data.into_iter().next() else {
            return Ok(Lookup::NotFound);
        };
        let intent: PaymentIntent = parse(&first)?;
        let amount = first
            .get("amount")
            .and_then(serde_json::Value::as_i64)
            .map(|cents| Decimal::new(cents, 2))
            .unwrap_or_default();
        Ok(Lookup::Found(Self::intent_result(intent, amount, first)))
    }
}
