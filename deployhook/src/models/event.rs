//! Inbound push event

use axum::body::Bytes;
use axum::http::HeaderMap;
use serde::Deserialize;
use thiserror::Error;

use crate::authn::signature::{LEGACY_SIGNATURE_HEADER, SIGNATURE_256_HEADER};

/// Header carrying the sender's delivery id
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// The subset of a push payload the hook needs
#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,

    #[serde(default)]
    head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    #[serde(default)]
    message: Option<String>,
}

/// The request body is not a push payload
#[derive(Error, Debug)]
#[error("malformed push payload: {0}")]
pub struct MalformedEvent(#[from] serde_json::Error);

/// A parsed webhook request.
///
/// The raw body is kept untouched since the signature is computed over it.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    raw_body: Bytes,
    signature: Option<String>,
    target_ref: String,
    commit_message: Option<String>,
    delivery_id: Option<String>,
}

impl InboundEvent {
    pub fn new(
        raw_body: Bytes,
        signature: Option<String>,
        target_ref: impl Into<String>,
        commit_message: Option<String>,
    ) -> Self {
        Self {
            raw_body,
            signature,
            target_ref: target_ref.into(),
            commit_message,
            delivery_id: None,
        }
    }

    /// Parse a webhook request.
    ///
    /// The SHA-256 signature header wins over the legacy one when both are sent.
    pub fn parse(headers: &HeaderMap, raw_body: Bytes) -> Result<Self, MalformedEvent> {
        let payload: PushPayload = serde_json::from_slice(&raw_body)?;

        let signature = headers
            .get(SIGNATURE_256_HEADER)
            .or_else(|| headers.get(LEGACY_SIGNATURE_HEADER))
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

        let delivery_id = headers
            .get(DELIVERY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(Self {
            raw_body,
            signature,
            target_ref: payload.git_ref,
            commit_message: payload.head_commit.and_then(|commit| commit.message),
            delivery_id,
        })
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn target_ref(&self) -> &str {
        &self.target_ref
    }

    pub fn commit_message(&self) -> Option<&str> {
        self.commit_message.as_deref()
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.delivery_id.as_deref()
    }
}
