//! # Legacy Command Server Client
//!
//! [`CommandDispatcher`] for the older command server, which takes one JSON
//! command per device and a per-device push endpoint:
//!
//! ```text
//! enqueue(D1,D2, cmd)  ─►  POST /v1/commands {"udid":"D1", ...}
//!                          POST /v1/commands {"udid":"D2", ...}
//! push(D1, exp)        ─►  GET  /push/D1?expiration=1700000000
//! ```
//!
//! The server has no batch endpoint, so a multi-target call is fanned out
//! per target. A target whose request fails is reported in the per-target
//! status; only when every target fails does the call itself fail.
//! The server pushes on enqueue by itself; `no_push` is not honoured.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{
    require_targets, ApiResult, CommandDispatcher, EnqueueOptions, EnrollmentStatus, QueuedCommand,
};
use crate::config::CommandDialect;
use crate::error::{SyncError, SyncResult};
use crate::transport::{success_body, Endpoint, RetryingTransport};
use fleet_core::CommandSpec;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct LegacyCommand<'a> {
    udid: &'a str,
    request_type: String,

    /// Base64 `.mobileconfig`.
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    identifier: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_url: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    queries: Option<&'a [String]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pin: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl<'a> LegacyCommand<'a> {
    fn new(udid: &'a str, command: &'a CommandSpec) -> Self {
        let mut body = LegacyCommand {
            udid,
            request_type: command.request_type().to_string(),
            payload: None,
            identifier: None,
            manifest_url: None,
            queries: None,
            pin: None,
            message: None,
        };

        match command {
            CommandSpec::InstallProfile { payload } => body.payload = Some(STANDARD.encode(payload)),
            CommandSpec::RemoveProfile { identifier } => body.identifier = Some(identifier),
            CommandSpec::InstallApplication { manifest_url } => body.manifest_url = Some(manifest_url),
            CommandSpec::DeviceInformation { queries } => body.queries = Some(queries),
            CommandSpec::DeviceLock { pin, message } => {
                body.pin = pin.as_deref();
                body.message = message.as_deref();
            }
            CommandSpec::EraseDevice { pin } => body.pin = pin.as_deref(),
            CommandSpec::InstalledApplicationList
            | CommandSpec::SecurityInfo
            | CommandSpec::ProfileList
            | CommandSpec::CertificateList => {}
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    payload: CommandPayload,
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    command_uuid: String,
}

#[derive(Debug, Default, Deserialize)]
struct PushResponse {
    #[serde(default)]
    id: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Client for the legacy command server.
#[derive(Debug, Clone)]
pub struct LegacyCommandClient {
    transport: RetryingTransport,
    endpoint: Endpoint,
    cancel: CancellationToken,
}

impl LegacyCommandClient {
    pub fn new(transport: RetryingTransport, endpoint: Endpoint) -> Self {
        LegacyCommandClient {
            transport,
            endpoint,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn post_command(&self, udid: &str, command: &CommandSpec) -> SyncResult<String> {
        let url = self.endpoint.url(&["v1", "commands"])?;
        let request = self
            .endpoint
            .request(self.transport.client(), Method::POST, url)
            .json(&LegacyCommand::new(udid, command))
            .build()?;

        let body = success_body(self.transport.send(request, &self.cancel).await?).await?;
        let response: CommandResponse = serde_json::from_slice(&body)?;
        Ok(response.payload.command_uuid)
    }

    async fn push_one(&self, udid: &str, expiration: Option<DateTime<Utc>>) -> SyncResult<Option<String>> {
        let mut url = self.endpoint.url(&["push", udid])?;
        if let Some(expiration) = expiration {
            url.query_pairs_mut()
                .append_pair("expiration", &expiration.timestamp().to_string());
        }

        let request = self
            .endpoint
            .request(self.transport.client(), Method::GET, url)
            .build()?;
        let body = success_body(self.transport.send(request, &self.cancel).await?).await?;

        let response: PushResponse = serde_json::from_slice(&body).unwrap_or_default();
        Ok(response.id)
    }
}

/// Server-side rejections are per-target; anything else fails the call.
fn is_per_target(err: &SyncError) -> bool {
    matches!(err, SyncError::Protocol { .. } | SyncError::RetriesExhausted { .. })
}

#[async_trait]
impl CommandDispatcher for LegacyCommandClient {
    fn dialect(&self) -> CommandDialect {
        CommandDialect::Legacy
    }

    async fn push(&self, ids: &[String], expiration: Option<DateTime<Utc>>) -> SyncResult<ApiResult> {
        require_targets(ids)?;
        let mut result = ApiResult::default();
        let mut last_error = None;

        for id in ids {
            let status = match self.push_one(id, expiration).await {
                Ok(push_id) => EnrollmentStatus {
                    push_result: push_id,
                    ..Default::default()
                },
                Err(err) if is_per_target(&err) => {
                    warn!(udid = %id, error = %err, "Legacy push failed");
                    let status = EnrollmentStatus {
                        push_error: Some(err.to_string()),
                        ..Default::default()
                    };
                    last_error = Some(err);
                    status
                }
                Err(err) => return Err(err),
            };
            result.status.insert(id.clone(), status);
        }

        if result.failed_targets().len() == result.status.len() {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        debug!(targets = ids.len(), "Legacy push sent");
        Ok(result)
    }

    async fn enqueue(
        &self,
        ids: &[String],
        command: &CommandSpec,
        _options: EnqueueOptions,
    ) -> SyncResult<ApiResult> {
        require_targets(ids)?;
        command.validate()?;

        let mut result = ApiResult {
            request_type: Some(command.request_type().to_string()),
            ..Default::default()
        };

        let mut last_error = None;

        for id in ids {
            let status = match self.post_command(id, command).await {
                Ok(command_uuid) => EnrollmentStatus {
                    command_uuid: Some(command_uuid),
                    ..Default::default()
                },
                Err(err) if is_per_target(&err) => {
                    warn!(udid = %id, error = %err, "Legacy command rejected");
                    let status = EnrollmentStatus {
                        command_error: Some(err.to_string()),
                        ..Default::default()
                    };
                    last_error = Some(err);
                    status
                }
                Err(err) => return Err(err),
            };
            result.status.insert(id.clone(), status);
        }

        // Every target failed: the call itself failed.
        if result.failed_targets().len() == result.status.len() {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        if let [only] = ids {
            result.command_uuid = result.status.get(only).and_then(|s| s.command_uuid.clone());
        }

        info!(
            targets = ids.len(),
            request_type = %command.request_type(),
            "Command posted to legacy server"
        );
        Ok(result)
    }

    async fn inspect_queue(&self, id: &str) -> SyncResult<Vec<QueuedCommand>> {
        require_targets(&[id])?;
        Err(SyncError::Unsupported {
            dialect: "legacy",
            operation: "inspect_queue",
        })
    }

    async fn clear_queue(&self, ids: &[String]) -> SyncResult<()> {
        require_targets(ids)?;
        Err(SyncError::Unsupported {
            dialect: "legacy",
            operation: "clear_queue",
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_server;
    use crate::transport::RetryConfig;
    use axum::extract::{Path, RawQuery, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    type Bodies = Arc<Mutex<Vec<serde_json::Value>>>;

    fn client(base: &str) -> LegacyCommandClient {
        let transport = RetryingTransport::new(reqwest::Client::new(), RetryConfig::no_retry());
        LegacyCommandClient::new(transport, Endpoint::new(base, "micromdm", "secret").unwrap())
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn command_handler(
        State(bodies): State<Bodies>,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        bodies.lock().unwrap().push(body.clone());
        if body["udid"] == "BAD" {
            return (StatusCode::BAD_REQUEST, "unknown udid").into_response();
        }
        let uuid = format!("UUID-{}", body["udid"].as_str().unwrap_or_default());
        Json(serde_json::json!({"payload": {"command_uuid": uuid}})).into_response()
    }

    fn command_router(bodies: Bodies) -> Router {
        Router::new()
            .route("/v1/commands", post(command_handler))
            .with_state(bodies)
    }

    #[tokio::test]
    async fn test_install_profile_payload_is_base64() {
        let bodies: Bodies = Arc::default();
        let base = spawn_server(command_router(bodies.clone())).await;

        let result = client(&base)
            .enqueue(
                &ids(&["D1"]),
                &CommandSpec::InstallProfile {
                    payload: b"profile".to_vec(),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.command_uuid.as_deref(), Some("UUID-D1"));
        let body = bodies.lock().unwrap()[0].clone();
        assert_eq!(body["request_type"], "InstallProfile");
        assert_eq!(body["payload"], STANDARD.encode(b"profile"));
        assert!(body.get("identifier").is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_per_target() {
        let bodies: Bodies = Arc::default();
        let base = spawn_server(command_router(bodies.clone())).await;

        let result = client(&base)
            .enqueue(&ids(&["D1", "BAD"]), &CommandSpec::ProfileList, EnqueueOptions::default())
            .await
            .unwrap();

        assert_eq!(result.command_uuid_for("D1"), Some("UUID-D1"));
        assert!(result.command_error_for("BAD").unwrap().contains("unknown udid"));
        assert_eq!(result.command_error_for("D1"), None);
        assert_eq!(bodies.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_every_target_failing_is_call_level_error() {
        let base = spawn_server(command_router(Arc::default())).await;

        let err = client(&base)
            .enqueue(&ids(&["BAD"]), &CommandSpec::ProfileList, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_push_sends_expiration_as_unix_seconds() {
        let seen: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::default();
        let app = Router::new()
            .route(
                "/push/{udid}",
                get(
                    |State(seen): State<Arc<Mutex<Vec<(String, Option<String>)>>>>,
                     Path(udid): Path<String>,
                     RawQuery(query): RawQuery| async move {
                        seen.lock().unwrap().push((udid.clone(), query));
                        Json(serde_json::json!({"status": "success", "id": format!("push-{udid}")}))
                    },
                ),
            )
            .with_state(seen.clone());
        let base = spawn_server(app).await;

        let expiry = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        let result = client(&base)
            .push(&ids(&["D1", "D2"]), Some(expiry))
            .await
            .unwrap();

        assert_eq!(result.status["D2"].push_result.as_deref(), Some("push-D2"));
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "D1");
        assert_eq!(seen[0].1.as_deref(), Some("expiration=1700000000"));
    }

    #[tokio::test]
    async fn test_queue_operations_are_unsupported() {
        let client = client("http://127.0.0.1:9");

        assert!(matches!(
            client.inspect_queue("D1").await,
            Err(SyncError::Unsupported { operation: "inspect_queue", .. })
        ));
        assert!(matches!(
            client.clear_queue(&ids(&["D1"])).await,
            Err(SyncError::Unsupported { operation: "clear_queue", .. })
        ));
        assert!(matches!(client.push(&[], None).await, Err(SyncError::EmptyTargets)));
        assert_eq!(client.dialect(), CommandDialect::Legacy);
    }

    #[tokio::test]
    async fn test_queue_operations_validate_targets_first() {
        let client = client("http://127.0.0.1:9");

        assert!(matches!(client.clear_queue(&[]).await, Err(SyncError::EmptyTargets)));
        assert!(client.inspect_queue("").await.unwrap_err().is_validation());
    }
}
