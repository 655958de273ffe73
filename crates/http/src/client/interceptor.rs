//! Request/response interceptor chain
//!
//! Request phase: add `Authorization: Bearer <access>` when the request has no
//! credentials of its own, and tag it with an `X-Request-ID`.
//! Response phase: on `401`, refresh once and replay the request once. The
//! replay goes straight to the transport, so a second `401` is returned as-is
//! and can never start another refresh.

use super::ApiClient;
use super::error::ClientError;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use reqwest::{Request, Response, StatusCode};
use tracing::{debug, warn};

/// Header carrying the per-request correlation id
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

impl ApiClient {
    /// Send a request through the interceptor chain
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Request`] for transport failures; HTTP error
    /// statuses are returned as responses
    pub async fn send(&self, mut request: Request) -> Result<Response, ClientError> {
        self.authorize(&mut request);
        let replay = request.try_clone();

        let response = self.inner.http.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            debug!("401 on a request with a streaming body; not replaying");
            return Ok(response);
        };

        debug!(path = replay.url().path(), "401 received; attempting silent refresh");
        match self.silent_refresh_access_token().await {
            Some(token) => {
                set_bearer(&mut replay, &token);
                let retried = self.inner.http.execute(replay).await?;
                if retried.status() == StatusCode::UNAUTHORIZED {
                    warn!("Request still unauthorized after refresh");
                }
                Ok(retried)
            }
            None => {
                self.notify_session_lost();
                Ok(response)
            }
        }
    }

    fn authorize(&self, request: &mut Request) {
        let headers = request.headers_mut();

        if !headers.contains_key(AUTHORIZATION) {
            if let Some(value) = self.inner.tokens.authorization_header() {
                headers.insert(AUTHORIZATION, value);
            }
        }

        if !headers.contains_key(&REQUEST_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
                headers.insert(REQUEST_ID_HEADER, value);
            }
        }
    }
}

fn set_bearer(request: &mut Request, token: &str) {
    match HeaderValue::from_str(&format!("Bearer {token}")) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(_) => warn!("Refreshed token is not a valid header value"),
    }
}
