//! # User Handlers
//!
//! `user.activate` and `user.lookup` over an in-process directory.
//!
//! Activation is guarded by the idempotency service under
//! `user.activate:<email>`, so a redelivered or re-sent request neither
//! re-activates the user nor sends a second welcome email. Every caller gets
//! the first activation's result back.

use crate::handlers::notification::SendEmail;
use cr_01_rpc_client::RpcClient;
use cr_02_rpc_dispatcher::{handler_fn, HandlerError, RequestContext, RpcHandler};
use cr_03_idempotency::IdempotencyService;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared_types::{now_millis, RouteKey};
use std::sync::Arc;
use tracing::{debug, info};

pub const ACTIVATE_ACTION: &str = "activate";
pub const LOOKUP_ACTION: &str = "lookup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateUser {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedUser {
    pub email: String,
    pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupUser {
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub email: String,
    pub status: UserStatus,
    /// Epoch millis.
    pub activated_at: i64,
}

/// Users known to this process, keyed by lowercased email.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: DashMap<String, UserRecord>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `email` active. Keeps the first activation time.
    pub fn activate(&self, email: &str) -> UserRecord {
        self.users
            .entry(email.to_lowercase())
            .and_modify(|user| user.status = UserStatus::Active)
            .or_insert_with(|| UserRecord {
                email: email.to_string(),
                status: UserStatus::Active,
                activated_at: now_millis(),
            })
            .clone()
    }

    pub fn get(&self, email: &str) -> Option<UserRecord> {
        self.users.get(&email.to_lowercase()).map(|user| user.clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Minimal shape check: one `@`, non-empty local part, dotted domain.
pub fn validate_email(email: &str) -> Result<(), HandlerError> {
    let invalid = || HandlerError::bad_request(format!("invalid email: {email:?}"));
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.contains('@')
        || email.chars().any(char::is_whitespace)
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
    {
        return Err(invalid());
    }
    Ok(())
}

pub fn activate_route() -> Result<RouteKey, shared_types::RouteError> {
    RouteKey::new("user", ACTIVATE_ACTION)
}

pub fn lookup_route() -> Result<RouteKey, shared_types::RouteError> {
    RouteKey::new("user", LOOKUP_ACTION)
}

/// Handler for `user.activate`.
///
/// Replies `400` for a malformed email. The welcome email goes out as a
/// `notification.send-email` command from inside the idempotent section.
pub fn activate_handler(
    directory: Arc<UserDirectory>,
    idempotency: IdempotencyService,
    client: Arc<RpcClient>,
    welcome_route: RouteKey,
) -> Arc<dyn RpcHandler> {
    handler_fn(move |ctx: RequestContext, request: ActivateUser| {
        let directory = Arc::clone(&directory);
        let idempotency = idempotency.clone();
        let client = Arc::clone(&client);
        let welcome_route = welcome_route.clone();
        async move {
            validate_email(&request.email)?;
            let key = format!("user.activate:{}", request.email.to_lowercase());

            let outcome = idempotency
                .execute_once(&key, || async {
                    let user = directory.activate(&request.email);
                    client
                        .send(&welcome_route, &SendEmail::welcome(&user.email))
                        .await?;
                    info!(
                        email = %user.email,
                        correlation_id = %ctx.correlation_id(),
                        "User activated"
                    );
                    Ok::<_, cr_01_rpc_client::RpcError>(ActivatedUser {
                        email: user.email,
                        status: user.status,
                    })
                })
                .await?;

            if outcome.is_duplicate() {
                debug!(email = %request.email, attempt = ctx.attempt, "Activation replayed");
            }
            outcome.into_result().map_err(HandlerError::internal)
        }
    })
}

/// Handler for `user.lookup`. Unknown users are `404`.
pub fn lookup_handler(directory: Arc<UserDirectory>) -> Arc<dyn RpcHandler> {
    handler_fn(move |_ctx: RequestContext, request: LookupUser| {
        let directory = Arc::clone(&directory);
        async move {
            directory
                .get(&request.email)
                .ok_or_else(|| HandlerError::not_found(format!("no user {}", request.email)))
        }
    })
}
