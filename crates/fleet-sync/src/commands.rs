//! # Command Protocol Client
//!
//! The [`CommandDispatcher`] capability and its structured ("enqueue")
//! implementation.
//!
//! ## Wire Calls
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  push(ids)            GET    /v1/push/D1,D2                            │
//! │  enqueue(ids, cmd)    PUT    /v1/enqueue/D1,D2[?nopush=1]  (plist)     │
//! │  inspect_queue(id)    GET    /v1/queue/D1                              │
//! │  clear_queue(ids)     DELETE /v1/queue/D1,D2          404 ⇒ success    │
//! │  fetch_page(...)      POST   /v1/enrollments/query?limit=N&offset=M    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Call-Level vs Per-Target Failure
//! A non-2xx response is a call-level failure and surfaces as
//! `SyncError::Protocol`. A 2xx response may still carry per-target push or
//! command errors inside [`ApiResult`]; those are returned as `Ok` and the
//! caller decides what they mean. Bulk callers rely on this to keep going.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plist::{Dictionary, Value};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CommandDialect;
use crate::enrollment::{EnrollmentFilter, EnrollmentSource};
use crate::error::{SyncError, SyncResult};
use crate::transport::{success_body, Endpoint, RetryingTransport};
use fleet_core::validation::validate_targets;
use fleet_core::{CommandSpec, Enrollment, ValidationError};

// =============================================================================
// Results
// =============================================================================

/// Outcome for one target inside an otherwise successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_error: Option<String>,

    /// Set when the server assigned a UUID per target (legacy dialect).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_uuid: Option<String>,
}

/// Result of a push or enqueue call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResult {
    #[serde(default)]
    pub status: HashMap<String, EnrollmentStatus>,

    #[serde(default)]
    pub no_push: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl ApiResult {
    /// Command-level error for one target, falling back to the call-wide one.
    pub fn command_error_for(&self, id: &str) -> Option<&str> {
        self.status
            .get(id)
            .and_then(|s| non_empty(&s.command_error))
            .or_else(|| non_empty(&self.command_error))
    }

    /// Push (wake) error for one target, falling back to the call-wide one.
    pub fn push_error_for(&self, id: &str) -> Option<&str> {
        self.status
            .get(id)
            .and_then(|s| non_empty(&s.push_error))
            .or_else(|| non_empty(&self.push_error))
    }

    /// Command UUID assigned for one target.
    pub fn command_uuid_for(&self, id: &str) -> Option<&str> {
        self.status
            .get(id)
            .and_then(|s| non_empty(&s.command_uuid))
            .or_else(|| non_empty(&self.command_uuid))
    }

    /// Targets that reported any error.
    pub fn failed_targets(&self) -> Vec<&str> {
        let mut failed: Vec<&str> = self
            .status
            .iter()
            .filter(|(_, s)| non_empty(&s.push_error).is_some() || non_empty(&s.command_error).is_some())
            .map(|(id, _)| id.as_str())
            .collect();
        failed.sort_unstable();
        failed
    }
}

/// One pending entry in a target's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub command_uuid: String,

    #[serde(default)]
    pub request_type: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Queue the command without sending a wake signal.
    pub no_push: bool,
}

// =============================================================================
// Dispatcher Capability
// =============================================================================

/// Command-dispatch capability shared by both protocol dialects.
///
/// Every operation rejects an empty target list with
/// `SyncError::EmptyTargets` before touching the network.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    fn dialect(&self) -> CommandDialect;

    /// Requests an out-of-band wake signal.
    async fn push(&self, ids: &[String], expiration: Option<DateTime<Utc>>) -> SyncResult<ApiResult>;

    /// Serializes and queues a command for every target.
    async fn enqueue(
        &self,
        ids: &[String],
        command: &CommandSpec,
        options: EnqueueOptions,
    ) -> SyncResult<ApiResult>;

    async fn inspect_queue(&self, id: &str) -> SyncResult<Vec<QueuedCommand>>;

    /// Removes pending commands; nothing to remove is success.
    async fn clear_queue(&self, ids: &[String]) -> SyncResult<()>;
}

/// Target-list check shared by both dialects.
pub(crate) fn require_targets<S: AsRef<str>>(ids: &[S]) -> SyncResult<()> {
    match validate_targets(ids) {
        Ok(()) => Ok(()),
        Err(ValidationError::Empty { .. }) => Err(SyncError::EmptyTargets),
        Err(err) => Err(err.into()),
    }
}

// =============================================================================
// Plist Command Encoding
// =============================================================================

/// Encodes a command as the XML plist the enqueue API expects.
///
/// ```text
/// <dict>
///   <key>CommandUUID</key> <string>…</string>
///   <key>Command</key>
///   <dict>
///     <key>RequestType</key> <string>InstallProfile</string>
///     <key>Payload</key>     <data>…</data>
///   </dict>
/// </dict>
/// ```
pub fn encode_command(command_uuid: &str, command: &CommandSpec) -> SyncResult<Vec<u8>> {
    command.validate()?;

    let mut inner = Dictionary::new();
    inner.insert(
        "RequestType".to_string(),
        Value::String(command.request_type().to_string()),
    );

    match command {
        CommandSpec::InstallProfile { payload } => {
            inner.insert("Payload".to_string(), Value::Data(payload.clone()));
        }
        CommandSpec::RemoveProfile { identifier } => {
            inner.insert("Identifier".to_string(), Value::String(identifier.clone()));
        }
        CommandSpec::InstallApplication { manifest_url } => {
            inner.insert("ManifestURL".to_string(), Value::String(manifest_url.clone()));
        }
        CommandSpec::DeviceInformation { queries } => {
            let queries = queries.iter().cloned().map(Value::String).collect();
            inner.insert("Queries".to_string(), Value::Array(queries));
        }
        CommandSpec::DeviceLock { pin, message } => {
            if let Some(pin) = pin {
                inner.insert("PIN".to_string(), Value::String(pin.clone()));
            }
            if let Some(message) = message {
                inner.insert("Message".to_string(), Value::String(message.clone()));
            }
        }
        CommandSpec::EraseDevice { pin } => {
            if let Some(pin) = pin {
                inner.insert("PIN".to_string(), Value::String(pin.clone()));
            }
        }
        CommandSpec::InstalledApplicationList
        | CommandSpec::SecurityInfo
        | CommandSpec::ProfileList
        | CommandSpec::CertificateList => {}
    }

    let mut outer = Dictionary::new();
    outer.insert("CommandUUID".to_string(), Value::String(command_uuid.to_string()));
    outer.insert("Command".to_string(), Value::Dictionary(inner));

    let mut buf = Vec::new();
    Value::Dictionary(outer).to_writer_xml(&mut buf)?;
    Ok(buf)
}

// =============================================================================
// Enqueue Client
// =============================================================================

#[derive(Debug, Deserialize)]
struct EnrollmentPage {
    #[serde(default)]
    enrollments: Vec<Enrollment>,
}

#[derive(Debug, Serialize)]
struct EnrollmentQuery<'a> {
    filter: &'a EnrollmentFilter,
}

/// Client for the structured enqueue API.
#[derive(Debug, Clone)]
pub struct EnqueueClient {
    transport: RetryingTransport,
    endpoint: Endpoint,
    cancel: CancellationToken,
}

impl EnqueueClient {
    pub fn new(transport: RetryingTransport, endpoint: Endpoint) -> Self {
        EnqueueClient {
            transport,
            endpoint,
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts in-flight retry waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> SyncResult<reqwest::Response> {
        self.transport.send(request.build()?, &self.cancel).await
    }

    async fn api_result(&self, request: reqwest::RequestBuilder) -> SyncResult<ApiResult> {
        let response = self.send(request).await?;
        let body = success_body(response).await?;
        if body.is_empty() {
            return Ok(ApiResult::default());
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl CommandDispatcher for EnqueueClient {
    fn dialect(&self) -> CommandDialect {
        CommandDialect::Enqueue
    }

    async fn push(&self, ids: &[String], expiration: Option<DateTime<Utc>>) -> SyncResult<ApiResult> {
        require_targets(ids)?;
        let targets = ids.join(",");
        let url = self.endpoint.url(&["v1", "push", &targets])?;

        // The enqueue API manages wake-signal expiry itself.
        debug!(targets = %targets, ?expiration, "Sending push");
        let result = self
            .api_result(self.endpoint.request(self.transport.client(), Method::GET, url))
            .await?;

        debug!(targets = %targets, failed = result.failed_targets().len(), "Push sent");
        Ok(result)
    }

    async fn enqueue(
        &self,
        ids: &[String],
        command: &CommandSpec,
        options: EnqueueOptions,
    ) -> SyncResult<ApiResult> {
        require_targets(ids)?;
        let command_uuid = Uuid::new_v4().to_string().to_uppercase();
        let body = encode_command(&command_uuid, command)?;

        let targets = ids.join(",");
        let mut url = self.endpoint.url(&["v1", "enqueue", &targets])?;
        if options.no_push {
            url.query_pairs_mut().append_pair("nopush", "1");
        }

        let request = self
            .endpoint
            .request(self.transport.client(), Method::PUT, url)
            .header(CONTENT_TYPE, "application/xml")
            .body(body);
        let mut result = self.api_result(request).await?;

        if result.command_uuid.is_none() {
            result.command_uuid = Some(command_uuid);
        }
        if result.request_type.is_none() {
            result.request_type = Some(command.request_type().to_string());
        }

        info!(
            targets = %targets,
            request_type = %command.request_type(),
            command_uuid = ?result.command_uuid,
            no_push = options.no_push,
            "Command enqueued"
        );
        Ok(result)
    }

    async fn inspect_queue(&self, id: &str) -> SyncResult<Vec<QueuedCommand>> {
        require_targets(&[id])?;
        let url = self.endpoint.url(&["v1", "queue", id])?;
        let response = self
            .send(self.endpoint.request(self.transport.client(), Method::GET, url))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = success_body(response).await?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn clear_queue(&self, ids: &[String]) -> SyncResult<()> {
        require_targets(ids)?;
        let targets = ids.join(",");
        let url = self.endpoint.url(&["v1", "queue", &targets])?;
        let response = self
            .send(self.endpoint.request(self.transport.client(), Method::DELETE, url))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(targets = %targets, "Queue already empty");
            return Ok(());
        }
        success_body(response).await?;
        debug!(targets = %targets, "Queue cleared");
        Ok(())
    }
}

#[async_trait]
impl EnrollmentSource for EnqueueClient {
    async fn fetch_page(
        &self,
        filter: &EnrollmentFilter,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<Enrollment>> {
        let mut url = self.endpoint.url(&["v1", "enrollments", "query"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());

        let request = self
            .endpoint
            .request(self.transport.client(), Method::POST, url)
            .json(&EnrollmentQuery { filter });
        let body = success_body(self.send(request).await?).await?;
        let page: EnrollmentPage = serde_json::from_slice(&body)?;

        debug!(limit, offset, count = page.enrollments.len(), "Fetched enrollment page");
        Ok(page.enrollments)
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
    use axum::body::Bytes;
    use axum::extract::{Path, RawQuery, State};
    use axum::http::HeaderMap;
    use axum::routing::{delete, get, post, put};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Seen {
        path: String,
        query: Option<String>,
        authorization: Option<String>,
        body: Vec<u8>,
    }

    type Log = Arc<Mutex<Vec<Seen>>>;

    fn record(log: &Log, path: String, query: Option<String>, headers: &HeaderMap, body: &[u8]) {
        log.lock().unwrap().push(Seen {
            path,
            query,
            authorization: headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: body.to_vec(),
        });
    }

    fn client(base: &str) -> EnqueueClient {
        let transport = RetryingTransport::new(reqwest::Client::new(), RetryConfig::no_retry());
        EnqueueClient::new(transport, Endpoint::new(base, "fleet", "secret").unwrap())
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_encode_install_profile() {
        let spec = CommandSpec::InstallProfile {
            payload: b"<mobileconfig/>".to_vec(),
        };
        let body = encode_command("CMD-1", &spec).unwrap();
        let value: Value = plist::from_bytes(&body).unwrap();
        let dict = value.as_dictionary().unwrap();

        assert_eq!(dict.get("CommandUUID").and_then(Value::as_string), Some("CMD-1"));
        let command = dict.get("Command").and_then(Value::as_dictionary).unwrap();
        assert_eq!(
            command.get("RequestType").and_then(Value::as_string),
            Some("InstallProfile")
        );
        assert_eq!(
            command.get("Payload").and_then(Value::as_data),
            Some(&b"<mobileconfig/>"[..])
        );
    }

    #[test]
    fn test_encode_device_information_queries() {
        let body = encode_command("CMD-2", &CommandSpec::device_information()).unwrap();
        let value: Value = plist::from_bytes(&body).unwrap();
        let queries = value
            .as_dictionary()
            .and_then(|d| d.get("Command"))
            .and_then(Value::as_dictionary)
            .and_then(|c| c.get("Queries"))
            .and_then(Value::as_array)
            .unwrap();
        assert!(queries.iter().any(|q| q.as_string() == Some("UDID")));
    }

    #[test]
    fn test_encode_rejects_invalid_command() {
        let err = encode_command("CMD-3", &CommandSpec::InstallProfile { payload: vec![] }).unwrap_err();
        assert!(matches!(err, SyncError::InvalidCommand(_)));
    }

    #[test]
    fn test_api_result_per_target_lookup() {
        let result: ApiResult = serde_json::from_value(serde_json::json!({
            "status": {
                "D1": {"push_result": "ok"},
                "D2": {"command_error": "device not enrolled", "push_error": ""},
                "D3": {"push_error": "apns: bad token"}
            },
            "command_uuid": "CMD-9",
            "request_type": "ProfileList"
        }))
        .unwrap();

        assert_eq!(result.command_error_for("D1"), None);
        assert_eq!(result.command_error_for("D2"), Some("device not enrolled"));
        assert_eq!(result.push_error_for("D2"), None);
        assert_eq!(result.push_error_for("D3"), Some("apns: bad token"));
        assert_eq!(result.command_uuid_for("D1"), Some("CMD-9"));
        assert_eq!(result.failed_targets(), vec!["D2", "D3"]);
    }

    #[tokio::test]
    async fn test_empty_targets_make_no_request() {
        let client = client("http://127.0.0.1:9");

        assert!(matches!(client.push(&[], None).await, Err(SyncError::EmptyTargets)));
        assert!(matches!(
            client
                .enqueue(&[], &CommandSpec::ProfileList, EnqueueOptions::default())
                .await,
            Err(SyncError::EmptyTargets)
        ));
        assert!(matches!(client.clear_queue(&[]).await, Err(SyncError::EmptyTargets)));
        assert!(client.inspect_queue("").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_enqueue_sends_plist_to_joined_targets() {
        let log: Log = Arc::default();
        let app = Router::new()
            .route(
                "/v1/enqueue/{ids}",
                put(
                    |State(log): State<Log>,
                     Path(ids): Path<String>,
                     RawQuery(query): RawQuery,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        record(&log, ids, query, &headers, &body);
                        Json(serde_json::json!({
                            "status": {"D2": {"command_error": "unknown enrollment"}},
                            "no_push": true
                        }))
                    },
                ),
            )
            .with_state(log.clone());
        let base = spawn_server(app).await;

        let result = client(&base)
            .enqueue(
                &ids(&["D1", "D2"]),
                &CommandSpec::RemoveProfile {
                    identifier: "com.example.wifi".to_string(),
                },
                EnqueueOptions { no_push: true },
            )
            .await
            .unwrap();

        // Per-target failure is still a successful call.
        assert_eq!(result.command_error_for("D2"), Some("unknown enrollment"));
        assert_eq!(result.command_error_for("D1"), None);
        assert_eq!(result.request_type.as_deref(), Some("RemoveProfile"));

        let seen = log.lock().unwrap()[0].clone();
        assert_eq!(seen.path, "D1,D2");
        assert_eq!(seen.query.as_deref(), Some("nopush=1"));
        assert!(seen.authorization.unwrap().starts_with("Basic "));

        let value: Value = plist::from_bytes(&seen.body).unwrap();
        let dict = value.as_dictionary().unwrap();
        assert_eq!(
            dict.get("CommandUUID").and_then(Value::as_string),
            result.command_uuid.as_deref()
        );
    }

    #[tokio::test]
    async fn test_server_rejection_is_call_level_error() {
        let app = Router::new().route(
            "/v1/push/{ids}",
            get(|| async { (axum::http::StatusCode::BAD_REQUEST, "no such enrollment") }),
        );
        let base = spawn_server(app).await;

        let err = client(&base).push(&ids(&["D1"]), None).await.unwrap_err();
        match err {
            SyncError::Protocol { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "no such enrollment");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clear_queue_treats_not_found_as_success() {
        let app = Router::new().route(
            "/v1/queue/{ids}",
            delete(|| async { axum::http::StatusCode::NOT_FOUND }),
        );
        let base = spawn_server(app).await;

        client(&base).clear_queue(&ids(&["D1", "D2"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_inspect_queue_decodes_entries() {
        let app = Router::new().route(
            "/v1/queue/{id}",
            get(|| async {
                Json(serde_json::json!([
                    {"command_uuid": "C1", "request_type": "ProfileList", "status": ""},
                    {"command_uuid": "C2"}
                ]))
            }),
        );
        let base = spawn_server(app).await;

        let queue = client(&base).inspect_queue("D1").await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].request_type.as_deref(), Some("ProfileList"));
        assert_eq!(queue[1].command_uuid, "C2");
    }

    #[tokio::test]
    async fn test_enrollment_query_paging_parameters() {
        let log: Log = Arc::default();
        let app = Router::new()
            .route(
                "/v1/enrollments/query",
                post(
                    |State(log): State<Log>,
                     RawQuery(query): RawQuery,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        record(&log, "query".to_string(), query, &headers, &body);
                        Json(serde_json::json!({
                            "enrollments": [
                                {"id": "D1", "type": "Device", "enabled": true, "serial_number": "S1"}
                            ]
                        }))
                    },
                ),
            )
            .with_state(log.clone());
        let base = spawn_server(app).await;

        let filter = EnrollmentFilter {
            enabled: Some(true),
            ..Default::default()
        };
        let page = client(&base).fetch_page(&filter, 50, 100).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].enrollment_type, "Device");

        let seen = log.lock().unwrap()[0].clone();
        assert_eq!(seen.query.as_deref(), Some("limit=50&offset=100"));
        let body: serde_json::Value = serde_json::from_slice(&seen.body).unwrap();
        assert_eq!(body, serde_json::json!({"filter": {"enabled": true}}));
    }
}
