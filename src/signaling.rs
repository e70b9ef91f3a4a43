//! One-shot offer/answer exchange with the signaling endpoint.
//!
//! The local offer is POSTed as a raw `application/sdp` body and the answer
//! comes back the same way. There are no internal retries; the recovery
//! controller owns retry policy so two handshakes never race.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, info};

use crate::config::SignalingConfig;
use crate::error::SignalingError;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description in SDP text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sdp)
    }
}

/// Exchanges a local offer for the remote answer.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn exchange(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, SignalingError>;
}

/// [`Signaling`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSignaling {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    bearer_token: Option<String>,
}

impl HttpSignaling {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            timeout: config.timeout(),
            bearer_token: config.bearer_token.clone(),
        }
    }

    async fn post(&self, offer: &SessionDescription) -> Result<SessionDescription, SignalingError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.sdp.clone());
        if let Some(token) = &self.bearer_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            // The status is the error; a body that fails to arrive is not.
            let body = response.text().await.unwrap_or_default();
            return Err(SignalingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(SignalingError::EmptyResponse);
        }

        Ok(SessionDescription::answer(body))
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn exchange(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, SignalingError> {
        info!(url = %self.url, "Sending offer to signaling endpoint");
        debug!("Offer SDP:\n{}", offer);

        let answer = tokio::time::timeout(self.timeout, self.post(offer))
            .await
            .map_err(|_| SignalingError::Timeout(self.timeout))??;

        debug!("Answer SDP:\n{}", answer);
        Ok(answer)
    }
}
