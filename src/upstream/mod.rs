//! Outbound like requests.
//!
//! [`LikeTransport`] performs a single attempt against the like service;
//! [`Dispatcher`] wraps it with the hard timeout and the bounded retry loop
//! and turns whatever came back into an [`UpstreamResult`].

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DispatchPolicy;

pub use http::HttpTransport;
pub use mock::MockTransport;

const STATUS_SUCCESS: i64 = 1;
const STATUS_REJECTED: i64 = 2;
const STATUS_FAILED: i64 = 0;

const PLACEHOLDER_NICKNAME: &str = "Unknown";

/// Why a single attempt did not produce a usable body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(String),
    #[error("upstream returned http {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The JSON body the like service answers with. Every field is optional and
/// loosely typed; numbers may arrive as strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamBody {
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub player: Option<PlayerBody>,
    #[serde(default)]
    pub likes: Option<LikesBody>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerBody {
    #[serde(default)]
    pub nickname: Option<Value>,
    #[serde(default)]
    pub uid: Option<Value>,
    #[serde(default)]
    pub region: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LikesBody {
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
    #[serde(default)]
    pub added_by_api: Option<Value>,
}

impl UpstreamBody {
    pub fn success(nickname: &str, uid: &str, region: &str, before: u64, after: u64) -> Self {
        Self {
            status: Some(json!(STATUS_SUCCESS)),
            player: Some(PlayerBody {
                nickname: Some(json!(nickname)),
                uid: Some(json!(uid)),
                region: Some(json!(region)),
            }),
            likes: Some(LikesBody {
                before: Some(json!(before)),
                after: Some(json!(after)),
                added_by_api: Some(json!(after.saturating_sub(before))),
            }),
            error: None,
        }
    }

    pub fn with_status(status: i64, error: Option<&str>) -> Self {
        Self {
            status: Some(json!(status)),
            error: error.map(|e| json!(e)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeReceipt {
    pub nickname: String,
    pub target_id: String,
    pub region: String,
    pub before: u64,
    pub after: u64,
    pub added: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamResult {
    Success(LikeReceipt),
    Rejected { reason: String },
    TransportFailure { error: String },
}

/// One attempt against the like service. `region` is already uppercased.
#[async_trait]
pub trait LikeTransport: Send + Sync {
    async fn fetch(&self, target_id: &str, region: &str) -> Result<UpstreamBody, TransportError>;
}

pub struct Dispatcher {
    transport: Arc<dyn LikeTransport>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn LikeTransport>, policy: DispatchPolicy) -> Self {
        Self { transport, policy }
    }

    /// Send the like request, retrying transport failures up to
    /// `retry_budget` times with a fixed backoff. A well-formed body is
    /// never retried.
    pub async fn dispatch(&self, target_id: &str, region: &str) -> UpstreamResult {
        let region = region.trim().to_uppercase();
        let mut retries = 0u32;
        loop {
            let attempt = tokio::time::timeout(
                self.policy.timeout,
                self.transport.fetch(target_id, &region),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout));

            match attempt {
                Ok(body) => return interpret(body, target_id, &region),
                Err(e) if retries >= self.policy.retry_budget => {
                    warn!(
                        "like request for {} failed after {} attempt(s): {}",
                        target_id,
                        retries + 1,
                        e
                    );
                    return UpstreamResult::TransportFailure {
                        error: e.to_string(),
                    };
                }
                Err(e) => {
                    retries += 1;
                    warn!(
                        "like request attempt {} for {} failed: {}; retrying in {:?}",
                        retries, target_id, e, self.policy.backoff
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                }
            }
        }
    }
}

/// Map a body onto exactly one result variant.
pub fn interpret(body: UpstreamBody, target_id: &str, region: &str) -> UpstreamResult {
    let error = body.error.as_ref().and_then(text_of);
    let status = match &body.status {
        None | Some(Value::Null) => Some(STATUS_FAILED),
        Some(v) => count_of(v).and_then(|n| i64::try_from(n).ok()),
    };
    debug!(?status, target = target_id, "upstream answered");

    match status {
        Some(STATUS_SUCCESS) => UpstreamResult::Success(receipt(&body, target_id, region)),
        Some(STATUS_REJECTED) => UpstreamResult::Rejected {
            reason: error.unwrap_or_else(|| "target already at upstream limit".into()),
        },
        Some(STATUS_FAILED) => UpstreamResult::Rejected {
            reason: error.unwrap_or_else(|| "upstream reported failure".into()),
        },
        _ => UpstreamResult::Rejected {
            reason: "unrecognized status".into(),
        },
    }
}

fn receipt(body: &UpstreamBody, target_id: &str, region: &str) -> LikeReceipt {
    let player = body.player.clone().unwrap_or_default();
    let likes = body.likes.clone().unwrap_or_default();

    let before = likes.before.as_ref().and_then(count_of).unwrap_or(0);
    let after = likes.after.as_ref().and_then(count_of).unwrap_or(0);
    let added = likes
        .added_by_api
        .as_ref()
        .and_then(count_of)
        .unwrap_or_else(|| after.saturating_sub(before));

    LikeReceipt {
        nickname: player
            .nickname
            .as_ref()
            .and_then(text_of)
            .unwrap_or_else(|| PLACEHOLDER_NICKNAME.into()),
        target_id: player
            .uid
            .as_ref()
            .and_then(text_of)
            .unwrap_or_else(|| target_id.to_string()),
        region: player
            .region
            .as_ref()
            .and_then(text_of)
            .map(|r| r.to_uppercase())
            .unwrap_or_else(|| region.to_string()),
        before,
        after,
        added,
    }
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn count_of(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(retry_budget: u32) -> DispatchPolicy {
        DispatchPolicy {
            timeout: Duration::from_secs(5),
            retry_budget,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn status_one_extracts_receipt() {
        let body: UpstreamBody = serde_json::from_value(json!({
            "status": 1,
            "player": { "nickname": "Neo", "uid": 123456789, "region": "ind" },
            "likes": { "before": "100", "after": 200, "added_by_api": 100 }
        }))
        .unwrap();

        let r = interpret(body, "123456789", "IND");
        assert_eq!(
            r,
            UpstreamResult::Success(LikeReceipt {
                nickname: "Neo".into(),
                target_id: "123456789".into(),
                region: "IND".into(),
                before: 100,
                after: 200,
                added: 100,
            })
        );
    }

    #[test]
    fn missing_success_fields_use_placeholders() {
        let body = UpstreamBody::with_status(1, None);
        let UpstreamResult::Success(r) = interpret(body, "42", "BR") else {
            panic!("expected success");
        };
        assert_eq!(r.nickname, "Unknown");
        assert_eq!(r.target_id, "42");
        assert_eq!(r.region, "BR");
        assert_eq!((r.before, r.after, r.added), (0, 0, 0));
    }

    #[test]
    fn added_is_derived_when_absent() {
        let body: UpstreamBody = serde_json::from_value(json!({
            "status": "1",
            "likes": { "before": 10, "after": 35 }
        }))
        .unwrap();
        let UpstreamResult::Success(r) = interpret(body, "42", "BR") else {
            panic!("expected success");
        };
        assert_eq!(r.added, 25);
    }

    #[test]
    fn absent_after_counts_as_zero() {
        let body: UpstreamBody = serde_json::from_value(json!({
            "status": 1,
            "likes": { "before": 10 }
        }))
        .unwrap();
        let UpstreamResult::Success(r) = interpret(body, "42", "BR") else {
            panic!("expected success");
        };
        assert_eq!((r.before, r.after, r.added), (10, 0, 0));
    }

    #[test]
    fn every_status_maps_to_one_variant() {
        let cases = [
            (UpstreamBody::with_status(2, None), "target already at upstream limit"),
            (UpstreamBody::with_status(2, Some("max likes")), "max likes"),
            (UpstreamBody::with_status(0, Some("bad uid")), "bad uid"),
            (UpstreamBody::default(), "upstream reported failure"),
            (UpstreamBody::with_status(7, Some("ignored")), "unrecognized status"),
            (UpstreamBody::with_status(-1, None), "unrecognized status"),
        ];
        for (body, want) in cases {
            assert_eq!(
                interpret(body, "1", "IND"),
                UpstreamResult::Rejected {
                    reason: want.into()
                }
            );
        }

        let weird = UpstreamBody {
            status: Some(json!("ok")),
            ..Default::default()
        };
        assert_eq!(
            interpret(weird, "1", "IND"),
            UpstreamResult::Rejected {
                reason: "unrecognized status".into()
            }
        );
    }

    #[tokio::test]
    async fn transport_failure_is_retried_exactly_budget_times() {
        let transport = Arc::new(MockTransport::failing(TransportError::Http("refused".into())));
        let dispatcher = Dispatcher::new(transport.clone(), policy(2));

        let r = dispatcher.dispatch("1", "ind").await;

        assert_eq!(transport.call_count(), 3);
        assert_eq!(
            r,
            UpstreamResult::TransportFailure {
                error: "http error: refused".into()
            }
        );
    }

    #[tokio::test]
    async fn recovered_attempt_returns_success() {
        let transport = Arc::new(MockTransport::new());
        transport.push(Err(TransportError::Timeout));
        transport.push(Ok(UpstreamBody::success("Neo", "1", "IND", 5, 105)));
        let dispatcher = Dispatcher::new(transport.clone(), policy(1));

        let r = dispatcher.dispatch("1", "ind").await;

        assert_eq!(transport.call_count(), 2);
        assert!(matches!(r, UpstreamResult::Success(_)));
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let transport = Arc::new(MockTransport::new());
        transport.push(Ok(UpstreamBody::with_status(2, None)));
        let dispatcher = Dispatcher::new(transport.clone(), policy(3));

        let r = dispatcher.dispatch("1", "ind").await;

        assert_eq!(transport.call_count(), 1);
        assert!(matches!(r, UpstreamResult::Rejected { .. }));
    }

    #[tokio::test]
    async fn region_is_uppercased_before_sending() {
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), policy(0));

        dispatcher.dispatch("77", " sg ").await;

        assert_eq!(transport.calls(), vec![("77".to_string(), "SG".to_string())]);
    }

    #[tokio::test]
    async fn slow_transport_hits_the_hard_timeout() {
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(500)));
        let dispatcher = Dispatcher::new(
            transport.clone(),
            DispatchPolicy {
                timeout: Duration::from_millis(20),
                retry_budget: 1,
                backoff: Duration::ZERO,
            },
        );

        let r = dispatcher.dispatch("1", "ind").await;

        assert_eq!(transport.call_count(), 2);
        assert_eq!(
            r,
            UpstreamResult::TransportFailure {
                error: "request timed out".into()
            }
        );
    }
}
