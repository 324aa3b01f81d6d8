//! loyal-accrual
//!
//! Client for the external accrual authority, the service that decides how
//! many points an order earns.
//!
//! The gateway performs exactly one bounded request per call and folds every
//! result, failures included, into an [`AccrualOutcome`]. Retries and rate
//! limit handling belong to the caller.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use loyal_schemas::Points;
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// What the accrual authority said about one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualOutcome {
    /// Known to the authority, not yet being computed.
    Registered,
    Processing,
    /// Rejected; no points will be awarded.
    Invalid,
    /// Final; the order earned this many points.
    Processed(Points),
    /// The authority has never heard of this order.
    NotFound,
    /// Back off for this long before asking again.
    RateLimited(Duration),
    /// Anything else: connection failures, timeouts, unexpected codes,
    /// undecodable bodies.
    TransportError(String),
}

impl AccrualOutcome {
    /// Short label for logs and event payloads.
    pub fn label(&self) -> &'static str {
        match self {
            AccrualOutcome::Registered => "registered",
            AccrualOutcome::Processing => "processing",
            AccrualOutcome::Invalid => "invalid",
            AccrualOutcome::Processed(_) => "processed",
            AccrualOutcome::NotFound => "not_found",
            AccrualOutcome::RateLimited(_) => "rate_limited",
            AccrualOutcome::TransportError(_) => "transport_error",
        }
    }
}

/// Pluggable accrual authority interface.
#[async_trait]
pub trait AccrualGateway: Send + Sync {
    async fn fetch_status(&self, number: &str) -> AccrualOutcome;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Scheme and authority of the accrual service, e.g. `http://localhost:8081`.
    pub base_url: String,
    /// Upper bound for one request, connect through body.
    pub timeout: Duration,
}

impl GatewayConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// reqwest-backed gateway.
#[derive(Debug, Clone)]
pub struct HttpAccrualGateway {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccrualGateway {
    pub fn new(cfg: GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("build accrual http client failed")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn order_url(&self, number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, number)
    }
}

#[async_trait]
impl AccrualGateway for HttpAccrualGateway {
    async fn fetch_status(&self, number: &str) -> AccrualOutcome {
        let url = self.order_url(number);
        debug!(order = %number, %url, "querying accrual authority");

        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => return AccrualOutcome::TransportError(format!("request failed: {e}")),
        };

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT => return AccrualOutcome::NotFound,
            StatusCode::TOO_MANY_REQUESTS => {
                let header = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                return match header.and_then(parse_retry_after) {
                    Some(wait) => AccrualOutcome::RateLimited(wait),
                    None => AccrualOutcome::TransportError(format!(
                        "429 with unusable Retry-After: {:?}",
                        header
                    )),
                };
            }
            other => {
                return AccrualOutcome::TransportError(format!(
                    "unexpected http status {}",
                    other.as_u16()
                ))
            }
        }

        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => return AccrualOutcome::TransportError(format!("body read failed: {e}")),
        };
        match decode_status(&body) {
            Ok(outcome) => outcome,
            Err(e) => AccrualOutcome::TransportError(format!("{e:#}")),
        }
    }
}

/// Retry-After in delta-seconds form. HTTP-date values are not accepted.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct AccrualResponse {
    status: String,
    #[serde(default)]
    accrual: Option<f64>,
}

fn decode_status(body: &[u8]) -> Result<AccrualOutcome> {
    let resp: AccrualResponse =
        serde_json::from_slice(body).context("accrual response json decode failed")?;

    Ok(match resp.status.as_str() {
        "REGISTERED" => AccrualOutcome::Registered,
        "PROCESSING" => AccrualOutcome::Processing,
        "INVALID" => AccrualOutcome::Invalid,
        "PROCESSED" => {
            let raw = resp.accrual.unwrap_or(0.0);
            let amount = Points::from_f64(raw)
                .filter(|p| !p.is_negative())
                .with_context(|| format!("unusable accrual value {raw}"))?;
            AccrualOutcome::Processed(amount)
        }
        other => anyhow::bail!("unknown accrual status {other:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_accepts_delta_seconds_only() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn decode_maps_each_status() {
        let cases = [
            (r#"{"order":"1","status":"REGISTERED"}"#, AccrualOutcome::Registered),
            (r#"{"order":"1","status":"PROCESSING"}"#, AccrualOutcome::Processing),
            (r#"{"order":"1","status":"INVALID"}"#, AccrualOutcome::Invalid),
            (
                r#"{"order":"1","status":"PROCESSED","accrual":729.98}"#,
                AccrualOutcome::Processed(Points::new(729_980_000)),
            ),
        ];
        for (body, want) in cases {
            assert_eq!(decode_status(body.as_bytes()).unwrap(), want, "{body}");
        }
    }

    #[test]
    fn processed_without_accrual_is_zero() {
        let got = decode_status(br#"{"order":"1","status":"PROCESSED"}"#).unwrap();
        assert_eq!(got, AccrualOutcome::Processed(Points::ZERO));
    }

    #[test]
    fn decode_rejects_unknown_status_and_negative_accrual() {
        assert!(decode_status(br#"{"order":"1","status":"LOST"}"#).is_err());
        assert!(decode_status(br#"{"order":"1","status":"PROCESSED","accrual":-5}"#).is_err());
        assert!(decode_status(b"not json").is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let gw = HttpAccrualGateway::new(GatewayConfig::new("http://accrual:8080/")).unwrap();
        assert_eq!(gw.order_url("42"), "http://accrual:8080/api/orders/42");
    }
}
