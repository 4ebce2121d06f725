//! # HTTP Uplink
//!
//! The outbound contract: `POST <url>` with a JSON body of patient
//! bundles. Any 2xx commits the batch; 408, 429 and 5xx reschedule it;
//! any other 4xx poisons the rows.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use lablink_core::{LabOrder, Patient, TestResult};

use crate::auth::AuthProvider;
use crate::error::SyncResult;

// =============================================================================
// Payload Shapes
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PatientPayload {
    pub patient_id: String,
    pub name: Option<String>,
    pub dob: Option<String>,
    pub sex: Option<String>,
    pub physician: Option<String>,
}

impl From<&Patient> for PatientPayload {
    fn from(patient: &Patient) -> Self {
        PatientPayload {
            patient_id: if patient.external_id.is_empty() {
                patient.internal_id.clone()
            } else {
                patient.external_id.clone()
            },
            name: patient.name.clone(),
            dob: patient.dob.clone(),
            sex: patient.sex.clone(),
            physician: patient.physician.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderPayload {
    pub sample_id: String,
    pub universal_service_id: Option<String>,
    pub ordered_at: Option<String>,
    /// Order-level comment lines, newline-joined.
    pub comments: Option<String>,
}

impl From<&LabOrder> for OrderPayload {
    fn from(order: &LabOrder) -> Self {
        OrderPayload {
            sample_id: order.sample_id.clone(),
            universal_service_id: order.universal_service_id.clone(),
            ordered_at: order.ordered_at.clone(),
            comments: order.comments.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultPayload {
    pub id: i64,
    pub test_code: String,
    pub value: String,
    pub unit: Option<String>,
    pub reference_range: Option<String>,
    pub flags: Option<String>,
    pub observed_at: String,
    /// Result-level comment lines, newline-joined.
    pub comments: Option<String>,
}

impl From<&TestResult> for ResultPayload {
    fn from(result: &TestResult) -> Self {
        ResultPayload {
            id: result.id,
            test_code: result.test_code.clone(),
            value: result.value.clone(),
            unit: result.units.clone(),
            reference_range: result.reference_range.clone(),
            flags: result.flags.clone(),
            observed_at: result.observed_at.clone(),
            comments: result.comments.clone(),
        }
    }
}

/// One patient bundle inside a batch.
#[derive(Debug, Serialize)]
pub struct BatchBundle {
    pub patient: PatientPayload,
    pub order: OrderPayload,
    pub results: Vec<ResultPayload>,
}

/// The request body.
#[derive(Debug, Serialize)]
pub struct BatchPayload {
    pub instance_id: String,
    pub batch: Vec<BatchBundle>,
}

// =============================================================================
// Delivery Outcome
// =============================================================================

/// How one POST ended, already classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx: commit the rows as synced.
    Accepted { status: u16 },
    /// Transient: reschedule with backoff.
    Retryable { detail: String },
    /// Permanent rejection: poison the rows.
    Poisoned { detail: String },
}

fn classify(status: StatusCode, body: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Accepted {
            status: status.as_u16(),
        };
    }

    let detail = format!("HTTP {}: {:.120}", status.as_u16(), body);
    match status.as_u16() {
        408 | 429 => DeliveryOutcome::Retryable { detail },
        400..=499 => DeliveryOutcome::Poisoned { detail },
        _ => DeliveryOutcome::Retryable { detail },
    }
}

// =============================================================================
// Uplink
// =============================================================================

/// HTTP client for the external server.
pub struct Uplink {
    http: reqwest::Client,
    url: Url,
    auth: AuthProvider,
}

impl Uplink {
    pub fn new(
        url: &str,
        auth_config: lablink_core::AuthConfig,
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let url = Url::parse(url)?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let auth = AuthProvider::new(auth_config, http.clone());

        Ok(Uplink { http, url, auth })
    }

    /// Sends one batch and classifies the outcome. Network errors come
    /// back as `Retryable`; a 401 against an OAuth credential is retried
    /// once with a fresh token.
    pub async fn send(&self, payload: &BatchPayload) -> DeliveryOutcome {
        match self.send_once(payload).await {
            DeliveryOutcome::Poisoned { detail }
                if detail.starts_with("HTTP 401") && self.auth.supports_refresh() =>
            {
                self.auth.invalidate().await;
                debug!("Retrying batch with refreshed credential");
                self.send_once(payload).await
            }
            outcome => outcome,
        }
    }

    async fn send_once(&self, payload: &BatchPayload) -> DeliveryOutcome {
        let builder = self.http.post(self.url.clone()).json(payload);

        let builder = match self.auth.apply(builder).await {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "Could not authenticate outbound request");
                return DeliveryOutcome::Retryable {
                    detail: e.to_string(),
                };
            }
        };

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                debug!(status = status.as_u16(), "Batch response");
                classify(status, &body)
            }
            Err(e) => DeliveryOutcome::Retryable {
                detail: format!("transport: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_the_policy() {
        assert_eq!(
            classify(StatusCode::OK, ""),
            DeliveryOutcome::Accepted { status: 200 }
        );
        assert_eq!(
            classify(StatusCode::ACCEPTED, ""),
            DeliveryOutcome::Accepted { status: 202 }
        );

        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, "down"),
            DeliveryOutcome::Retryable { .. }
        ));
        assert!(matches!(
            classify(StatusCode::REQUEST_TIMEOUT, ""),
            DeliveryOutcome::Retryable { .. }
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, ""),
            DeliveryOutcome::Retryable { .. }
        ));

        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "no"),
            DeliveryOutcome::Poisoned { .. }
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, ""),
            DeliveryOutcome::Poisoned { .. }
        ));
    }

    #[test]
    fn payload_serializes_to_the_wire_shape() {
        let payload = BatchPayload {
            instance_id: "XN-L-001".into(),
            batch: vec![BatchBundle {
                patient: PatientPayload {
                    patient_id: "322288".into(),
                    name: Some("WORLANYO TIMOTHY".into()),
                    dob: None,
                    sex: Some("M".into()),
                    physician: None,
                },
                order: OrderPayload {
                    sample_id: "SID01".into(),
                    universal_service_id: None,
                    ordered_at: None,
                    comments: Some("Fasting sample".into()),
                },
                results: vec![],
            }],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["instance_id"], "XN-L-001");
        assert_eq!(json["batch"][0]["patient"]["patient_id"], "322288");
        assert_eq!(json["batch"][0]["order"]["sample_id"], "SID01");
        assert_eq!(json["batch"][0]["order"]["comments"], "Fasting sample");
    }
}
