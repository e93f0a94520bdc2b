//! # Shared Types Crate
//!
//! Wire-level types shared by every Courier component.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: the `{header, payload}` envelope is defined once, here.
//! - **Correlation by Header**: request/response pairs are matched only through
//!   `header.correlationId`; payloads never carry routing metadata.
//! - **Typed by Destination**: the payload type is implied by the routing key
//!   (`<domain>.<action>.request`), never by a free-form class name.
//!
//! ## Wire Format
//!
//! ```text
//! {"header": {"correlationId": "...", "replyTo": "user.reply.queue",
//!             "sourceService": "gateway", "targetService": "user",
//!             "timestamp": 1700000000000, "status": "SUCCESS"},
//!  "payload": {"code": 200, "message": "OK", "data": {...}}}
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod correlation;
pub mod envelope;
pub mod errors;
pub mod properties;
pub mod routing;

pub use correlation::CorrelationId;
pub use envelope::{codes, now_millis, Envelope, Header, ReplyStatus, ResponseEnvelope};
pub use errors::RouteError;
pub use properties::{DeathReason, MessageProperties, MALFORMED_REASON};
pub use routing::{reply_queue, RouteKey, POISON_BINDING, POISON_QUEUE};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;
