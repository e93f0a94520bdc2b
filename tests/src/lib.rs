//! # Courier Test Suite
//!
//! Cross-crate flows that no single crate can test alone.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/              # Criterion benchmarks
//! └── src/integration/
//!     ├── rpc_flow.rs        # client ⇄ dispatcher round trips, timeouts
//!     ├── idempotency_flow.rs# duplicate deliveries and concurrent claims
//!     └── dead_letter_flow.rs# retry, backoff and poison escalation
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p cr-tests
//! cargo test -p cr-tests integration::dead_letter_flow
//! cargo bench -p cr-tests
//! ```

pub mod integration;
