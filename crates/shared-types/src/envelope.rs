//! # Wire Envelope
//!
//! The `{header, payload}` wrapper transmitted for every request and reply.
//!
//! ## Properties
//!
//! - **Correlation**: request/response flows use `correlationId` and `replyTo`.
//! - **Status only on replies**: requests never set `status`.
//! - **Optional fields are omitted**, not sent as `null`, so older peers that
//!   do not know `deadline` still parse the header.

use crate::correlation::CorrelationId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// HTTP-status-like response codes.
pub mod codes {
    pub const OK: i32 = 200;
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const CONFLICT: i32 = 409;
    pub const INTERNAL_ERROR: i32 = 500;

    /// Returns true for the 2xx range.
    pub fn is_success(code: i32) -> bool {
        (200..300).contains(&code)
    }
}

/// Outcome flag carried on reply headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Caller-generated token echoed in the reply.
    pub correlation_id: CorrelationId,

    /// Channel the reply must be published to.
    pub reply_to: String,

    /// Optional secondary routing context for the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_exchange: Option<String>,

    pub source_service: String,

    pub target_service: String,

    /// Send time, epoch millis.
    pub timestamp: i64,

    /// Set only on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReplyStatus>,

    /// Absolute deadline (epoch millis) propagated from the caller.
    /// Nested calls made while handling this request must finish before it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
}

impl Header {
    /// Build a request header stamped with the current time.
    pub fn request(
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
        source_service: impl Into<String>,
        target_service: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            reply_to: reply_to.into(),
            reply_exchange: None,
            source_service: source_service.into(),
            target_service: target_service.into(),
            timestamp: now_millis(),
            status: None,
            deadline: None,
        }
    }

    /// Attach an absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline_ms: i64) -> Self {
        self.deadline = Some(deadline_ms);
        self
    }

    /// Build the reply header for this request.
    ///
    /// The correlation ID and reply address are preserved unchanged; source and
    /// target are swapped.
    pub fn reply(&self, responder: impl Into<String>, status: ReplyStatus) -> Self {
        Self {
            correlation_id: self.correlation_id,
            reply_to: self.reply_to.clone(),
            reply_exchange: self.reply_exchange.clone(),
            source_service: responder.into(),
            target_service: self.source_service.clone(),
            timestamp: now_millis(),
            status: Some(status),
            deadline: None,
        }
    }

    /// Milliseconds left before `deadline`, if one was propagated.
    /// Negative when the deadline already passed.
    pub fn remaining_ms(&self) -> Option<i64> {
        self.deadline.map(|d| d - now_millis())
    }
}

/// `{header, payload}` wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub header: Header,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(header: Header, payload: T) -> Self {
        Self { header, payload }
    }
}

/// Reply payload: `{code, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ResponseEnvelope<T> {
    /// `200 OK` carrying `data`.
    pub fn success(data: T) -> Self {
        Self {
            code: codes::OK,
            message: "OK".to_string(),
            data: Some(data),
        }
    }

    /// Failure reply with no data.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        codes::is_success(self.code)
    }

    /// Header status matching this response's code.
    pub fn status(&self) -> ReplyStatus {
        if self.is_success() {
            ReplyStatus::Success
        } else {
            ReplyStatus::Error
        }
    }
}

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
