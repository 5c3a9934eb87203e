//! APIService availability controller for the Kubernetes API aggregation layer
//!
//! Keeps the `Available` condition of every registered `APIService` in line
//! with whether its backing Service can actually serve traffic. Local
//! APIServices are always available; remote ones must have their Service,
//! a matching port, ready endpoints and a discovery endpoint that answers.
//!
//! # Architecture
//!
//! - Watch streams ([`watch`]) feed reflector stores ([`cache`]) and the
//!   [`router`], which maps every event to the APIService names it affects
//!   through the [`index`].
//! - Names land in a deduplicating [`queue`] with per-key backoff.
//! - Workers in [`controller`] evaluate availability, probe the backend
//!   ([`probe`]) and write the condition back.
//! - [`metrics`] exposes per-APIService unavailability.
//!
//! # Modules
//!
//! - [`apiservice`] - Helpers over the APIService type
//! - [`cache`] - Read views over the reflector stores
//! - [`config`] - Controller configuration
//! - [`controller`] - Reconcile context, evaluator and status writer
//! - [`error`] - Error types
//! - [`index`] - Service -> APIService reverse index
//! - [`metrics`] - OpenTelemetry instruments
//! - [`probe`] - Service resolution and discovery probe
//! - [`queue`] - Work queue with backoff
//! - [`router`] - Watch event fan-out
//! - [`telemetry`] - Logging and OTLP setup
//! - [`watch`] - Watch streams

#![deny(missing_docs)]

pub mod apiservice;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod index;
pub mod metrics;
pub mod probe;
pub mod queue;
pub mod router;
pub mod telemetry;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
