//! Integration tests for the availability controller
//!
//! # Test Organization
//!
//! - `discovery`: Stories about a single reconcile pass against a real HTTP
//!   backend (healthy, failing, redirecting, hanging)
//!
//! - `controller_loop`: Stories about the running controller: watch events
//!   in, status writes out
//!
//! - `fanout`: Stories about Service churn across many APIServices

mod discovery;
mod helpers;
