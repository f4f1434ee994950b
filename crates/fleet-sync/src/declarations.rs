//! # Declaration Protocol Client
//!
//! [`DeclarationApi`] is the capability the synchronizer drives;
//! [`DeclarationClient`] implements it over HTTP.
//!
//! ## Status Mapping
//! ```text
//! ┌───────────────────────────────────────────┬──────────────────────────────┐
//! │ Call                                      │ Outcome                      │
//! ├───────────────────────────────────────────┼──────────────────────────────┤
//! │ PUT  /v1/declarations[?nonotify=true]     │ 304 Changed, 204 Unchanged   │
//! │ POST /v1/declarations/{id}/touch          │ 204 ok, 404 NotFound         │
//! │ DELETE /v1/declarations/{id}              │ 2xx/304 ok, 404 NotFound     │
//! │ PUT|DELETE /v1/set-declarations/{set}     │ 204/304 ok, 404 NotFound     │
//! │ PUT  /v1/enrollment-sets/{id}?set=        │ 204/304 ok                   │
//! │ anything else                             │ SyncError::Protocol          │
//! └───────────────────────────────────────────┴──────────────────────────────┘
//! ```
//! Callers decide whether `NotFound` is fatal; deletion steps treat it as
//! already done.

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::transport::{Endpoint, RetryingTransport};
use fleet_core::Declaration;

/// Result of storing a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New content, or first write.
    Changed,
    /// Byte-identical to what the server already stores.
    Unchanged,
}

/// Declaration-server capability.
#[async_trait]
pub trait DeclarationApi: Send + Sync {
    async fn put_declaration(&self, declaration: &Declaration, notify: bool) -> SyncResult<PutOutcome>;

    /// Bumps the server token without changing content.
    async fn touch_declaration(&self, id: &str, notify: bool) -> SyncResult<()>;

    async fn get_declaration(&self, id: &str) -> SyncResult<Declaration>;

    async fn delete_declaration(&self, id: &str, notify: bool) -> SyncResult<()>;

    async fn put_set_declaration(&self, set: &str, declaration_id: &str, notify: bool) -> SyncResult<()>;

    async fn delete_set_declaration(
        &self,
        set: &str,
        declaration_id: &str,
        notify: bool,
    ) -> SyncResult<()>;

    /// Declaration identifiers in a set.
    async fn set_declarations(&self, set: &str) -> SyncResult<Vec<String>>;

    async fn put_enrollment_set(&self, enrollment_id: &str, set: &str, notify: bool) -> SyncResult<()>;

    /// Sets associated with an enrollment.
    async fn enrollment_sets(&self, enrollment_id: &str) -> SyncResult<Vec<String>>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// Client for the declaration server.
#[derive(Debug, Clone)]
pub struct DeclarationClient {
    transport: RetryingTransport,
    endpoint: Endpoint,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdList {
    Plain(Vec<String>),
    Null(Option<()>),
}

impl IdList {
    fn into_vec(self) -> Vec<String> {
        match self {
            IdList::Plain(ids) => ids,
            IdList::Null(_) => Vec::new(),
        }
    }
}

fn with_notify(mut url: Url, notify: bool) -> Url {
    if !notify {
        url.query_pairs_mut().append_pair("nonotify", "true");
    }
    url
}

impl DeclarationClient {
    pub fn new(transport: RetryingTransport, endpoint: Endpoint) -> Self {
        DeclarationClient {
            transport,
            endpoint,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> SyncResult<Response> {
        self.transport.send(request.build()?, &self.cancel).await
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.endpoint.request(self.transport.client(), method, url)
    }

    /// 2xx and 304 are success; 404 is `NotFound(subject)`.
    async fn expect_ok(response: Response, subject: &str) -> SyncResult<StatusCode> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(status);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(subject.to_string()));
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(SyncError::protocol(status, &body))
    }

    async fn set_association(
        &self,
        method: Method,
        set: &str,
        declaration_id: &str,
        notify: bool,
    ) -> SyncResult<()> {
        let mut url = self.endpoint.url(&["v1", "set-declarations", set])?;
        url.query_pairs_mut().append_pair("declaration", declaration_id);
        let url = with_notify(url, notify);

        let response = self.call(self.request(method.clone(), url)).await?;
        let status = Self::expect_ok(response, &format!("{} in {}", declaration_id, set)).await?;
        debug!(%method, set, declaration_id, status = status.as_u16(), "Set association updated");
        Ok(())
    }
}

#[async_trait]
impl DeclarationApi for DeclarationClient {
    async fn put_declaration(&self, declaration: &Declaration, notify: bool) -> SyncResult<PutOutcome> {
        let url = with_notify(self.endpoint.url(&["v1", "declarations"])?, notify);
        let response = self.call(self.request(Method::PUT, url).json(declaration)).await?;

        let outcome = match response.status() {
            StatusCode::NOT_MODIFIED => PutOutcome::Changed,
            StatusCode::NO_CONTENT => PutOutcome::Unchanged,
            status if status.is_success() => PutOutcome::Changed,
            status => {
                let body = response.bytes().await.unwrap_or_default();
                return Err(SyncError::protocol(status, &body));
            }
        };

        debug!(id = %declaration.identifier, ?outcome, notify, "Declaration stored");
        Ok(outcome)
    }

    async fn touch_declaration(&self, id: &str, notify: bool) -> SyncResult<()> {
        let url = with_notify(self.endpoint.url(&["v1", "declarations", id, "touch"])?, notify);
        let response = self.call(self.request(Method::POST, url)).await?;
        Self::expect_ok(response, id).await?;
        debug!(id, "Declaration touched");
        Ok(())
    }

    async fn get_declaration(&self, id: &str) -> SyncResult<Declaration> {
        let url = self.endpoint.url(&["v1", "declarations", id])?;
        let response = self.call(self.request(Method::GET, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(id.to_string()));
        }
        let body = crate::transport::success_body(response).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn delete_declaration(&self, id: &str, notify: bool) -> SyncResult<()> {
        let url = with_notify(self.endpoint.url(&["v1", "declarations", id])?, notify);
        let response = self.call(self.request(Method::DELETE, url)).await?;
        Self::expect_ok(response, id).await?;
        debug!(id, "Declaration deleted");
        Ok(())
    }

    async fn put_set_declaration(&self, set: &str, declaration_id: &str, notify: bool) -> SyncResult<()> {
        self.set_association(Method::PUT, set, declaration_id, notify).await
    }

    async fn delete_set_declaration(
        &self,
        set: &str,
        declaration_id: &str,
        notify: bool,
    ) -> SyncResult<()> {
        self.set_association(Method::DELETE, set, declaration_id, notify)
            .await
    }

    async fn set_declarations(&self, set: &str) -> SyncResult<Vec<String>> {
        let url = self.endpoint.url(&["v1", "set-declarations", set])?;
        let response = self.call(self.request(Method::GET, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = crate::transport::success_body(response).await?;
        Ok(serde_json::from_slice::<IdList>(&body)?.into_vec())
    }

    async fn put_enrollment_set(&self, enrollment_id: &str, set: &str, notify: bool) -> SyncResult<()> {
        let mut url = self.endpoint.url(&["v1", "enrollment-sets", enrollment_id])?;
        url.query_pairs_mut().append_pair("set", set);
        let url = with_notify(url, notify);

        let response = self.call(self.request(Method::PUT, url)).await?;
        let status = Self::expect_ok(response, enrollment_id).await?;
        debug!(enrollment_id, set, notify, status = status.as_u16(), "Enrollment set associated");
        Ok(())
    }

    async fn enrollment_sets(&self, enrollment_id: &str) -> SyncResult<Vec<String>> {
        let url = self.endpoint.url(&["v1", "enrollment-sets", enrollment_id])?;
        let response = self.call(self.request(Method::GET, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = crate::transport::success_body(response).await?;
        Ok(serde_json::from_slice::<IdList>(&body)?.into_vec())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
