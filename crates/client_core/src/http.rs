use std::{sync::Arc, time::Duration};

use reqwest::{header::AUTHORIZATION, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use shared::error::ApiErrorBody;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    credentials::CredentialSlot,
    error::{ClientError, ClientResult},
    notice::Notices,
};

/// How a failed request is reported beyond its returned error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    /// 401 raises the session-expired signal; other failures raise a notice.
    Global,
    /// Classified only. Used for identity probes and best-effort calls.
    Quiet,
}

/// Request/response layer. Every request carries the credential slot's
/// current bearer value and the shared cookie jar.
pub struct ApiClient {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialSlot>,
    notices: Notices,
    expired: broadcast::Sender<()>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<CredentialSlot>,
        notices: Notices,
    ) -> ClientResult<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Config(format!("http client: {err}")))?;
        let (expired, _) = broadcast::channel(16);
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            notices,
            expired,
        })
    }

    /// Fires once for every globally intercepted 401.
    pub fn subscribe_expired(&self) -> broadcast::Receiver<()> {
        self.expired.subscribe()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, intercept: Intercept) -> ClientResult<T> {
        self.execute(self.http.get(self.url(path)), intercept).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B, intercept: Intercept) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(self.http.post(self.url(path)).json(body), intercept)
            .await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B, intercept: Intercept) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(self.http.put(self.url(path)).json(body), intercept)
            .await
    }

    /// POST whose response body is irrelevant.
    pub async fn post_discarding<B>(
        &self,
        path: &str,
        body: &B,
        intercept: Intercept,
    ) -> ClientResult<()>
    where
        B: Serialize + ?Sized,
    {
        self.post::<B, serde::de::IgnoredAny>(path, body, intercept)
            .await
            .map(|_| ())
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        intercept: Intercept,
    ) -> ClientResult<T> {
        let result = self.send_and_decode(request).await;
        if let Err(err) = &result {
            self.intercept_failure(err, intercept);
        }
        result
    }

    async fn send_and_decode<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let request = match self.credentials.authorization_header() {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::from_transport(&err))?;
        let status = response.status();
        let url = response.url().path().to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ClientError::from_transport(&err))?;

        if !status.is_success() {
            let body = serde_json::from_slice::<ApiErrorBody>(&bytes).ok();
            let err = ClientError::classify(status, body.as_ref());
            debug!(path = %url, status = status.as_u16(), "http: request failed: {err}");
            return Err(err);
        }

        let body = if bytes.is_empty() { &b"null"[..] } else { &bytes[..] };
        serde_json::from_slice::<T>(body).map_err(|err| {
            warn!(path = %url, "http: response did not match the expected schema: {err}");
            ClientError::UnexpectedShape(format!("{url}: {err}"))
        })
    }

    fn intercept_failure(&self, err: &ClientError, intercept: Intercept) {
        if intercept == Intercept::Quiet {
            return;
        }
        match err {
            ClientError::Unauthorized => {
                let _ = self.expired.send(());
            }
            other => self.notices.error(other.user_message()),
        }
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
