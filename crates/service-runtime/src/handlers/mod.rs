//! # Handlers
//!
//! Demo services wired by the runtime: `user` answers RPCs, `notification`
//! consumes one-way commands.

pub mod notification;
pub mod user;

pub use notification::{send_email_handler, send_email_route, Outbox, SendEmail, SentEmail};
pub use user::{
    activate_handler, activate_route, lookup_handler, lookup_route, ActivateUser, ActivatedUser,
    UserDirectory, UserRecord, UserStatus,
};
