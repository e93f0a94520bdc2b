//! # Notification Handlers
//!
//! `notification.send-email` is a one-way command. Delivery goes through an
//! [`Outbox`]; a failed delivery fails the handler, which rejects the message
//! onto the dead-letter path for retry and, eventually, quarantine.

use cr_02_rpc_dispatcher::{handler_fn, HandlerError, RequestContext, RpcHandler};
use cr_03_idempotency::{IdempotencyService, Outcome};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared_types::{now_millis, RouteKey};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const SEND_EMAIL_ACTION: &str = "send-email";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl SendEmail {
    pub fn welcome(to: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Welcome".to_string(),
            body: format!("Your account {to} is now active."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    /// Epoch millis.
    pub sent_at: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Mail domain {0} is unreachable")]
    Unreachable(String),

    #[error("Address {0:?} has no domain")]
    NoDomain(String),
}

impl DeliveryError {
    /// Retrying cannot fix a bad address. An unreachable relay may recover.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoDomain(_))
    }
}

/// In-process stand-in for a mail relay.
#[derive(Debug, Default)]
pub struct Outbox {
    sent: Mutex<Vec<SentEmail>>,
    unreachable: RwLock<HashSet<String>>,
    invocations: AtomicU64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery to `domain` until [`restore_domain`](Self::restore_domain).
    pub fn fail_domain(&self, domain: &str) {
        self.unreachable.write().insert(domain.to_lowercase());
    }

    pub fn restore_domain(&self, domain: &str) {
        self.unreachable.write().remove(&domain.to_lowercase());
    }

    pub fn deliver(&self, email: &SendEmail) -> Result<SentEmail, DeliveryError> {
        let domain = email
            .to
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .ok_or_else(|| DeliveryError::NoDomain(email.to.clone()))?;
        if self.unreachable.read().contains(&domain) {
            return Err(DeliveryError::Unreachable(domain));
        }

        let sent = SentEmail {
            to: email.to.clone(),
            subject: email.subject.clone(),
            sent_at: now_millis(),
        };
        self.sent.lock().push(sent.clone());
        Ok(sent)
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Handler invocations, replays and failures included.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

pub fn send_email_route() -> Result<RouteKey, shared_types::RouteError> {
    RouteKey::new("notification", SEND_EMAIL_ACTION)
}

/// Handler for `notification.send-email`.
///
/// Keyed on the broker message ID, which survives redelivery and retry, so a
/// message is delivered at most once. An unreachable relay releases the key
/// and fails with 500, so the dead-letter retry delivers again. A bad address
/// is recorded and fails with 400, which quarantines the message at once.
pub fn send_email_handler(outbox: Arc<Outbox>, idempotency: IdempotencyService) -> Arc<dyn RpcHandler> {
    handler_fn(move |ctx: RequestContext, email: SendEmail| {
        let outbox = Arc::clone(&outbox);
        let idempotency = idempotency.clone();
        async move {
            outbox.invocations.fetch_add(1, Ordering::Relaxed);
            let key = format!("notification.send-email:{}", ctx.message_id);

            let outcome = idempotency
                .execute_once_or_release(
                    &key,
                    || async { outbox.deliver(&email) },
                    DeliveryError::is_permanent,
                )
                .await?;

            let (reason, error) = match outcome {
                Outcome::Executed(Ok(sent)) | Outcome::Duplicate(Ok(sent)) => {
                    info!(to = %sent.to, message_id = %ctx.message_id, "Email sent");
                    return Ok(serde_json::Value::Null);
                }
                Outcome::Released(reason) => (reason.clone(), HandlerError::internal(reason)),
                Outcome::Executed(Err(reason)) | Outcome::Duplicate(Err(reason)) => {
                    (reason.clone(), HandlerError::bad_request(reason))
                }
            };
            warn!(
                to = %email.to,
                message_id = %ctx.message_id,
                attempt = ctx.attempt,
                reason = %reason,
                code = error.code,
                "Email delivery failed"
            );
            Err(error)
        }
    })
}
