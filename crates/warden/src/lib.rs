//! Warden — ACME certificate controller for HTTP-routable endpoints.
//!
//! Watches endpoint objects in a cluster-style object store and keeps
//! their TLS material provisioned and renewed against an RFC 8555
//! certificate authority:
//!
//! - **Account reconciler**: registers or recovers the ACME account from
//!   an issuer configuration and persists its private key
//! - **Endpoint reconciler**: a per-endpoint order state machine that
//!   survives restarts at every step
//! - **Challenge exposer**: ephemeral route/replica-set/service triples
//!   answering HTTP-01 validation
//! - **Renewal policy**: time-spread re-issuance before expiry
//!
//! The cluster client and the CA transport are seams: hosts wire their
//! own [`store::ObjectStore`] and [`acme::AcmeClient`] implementations
//! and run both controllers on a shared tokio runtime.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden::acme::SharedClientFactory;
//! use warden::endpoint::EndpointController;
//! use warden::events::LogEventSink;
//!
//! let factory = Arc::new(SharedClientFactory::new());
//! let controller = Arc::new(EndpointController::new(
//!     store,
//!     factory,
//!     Arc::new(LogEventSink),
//!     std::time::Duration::from_secs(30 * 60),
//! ));
//! tokio::spawn(controller.run(2, shutdown_rx));
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod account;
pub mod acme;
pub mod api;
pub mod cert;
pub mod endpoint;
pub mod events;
pub mod queue;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Reconcilers
pub use account::AccountController;
pub use endpoint::EndpointController;

// ACME seam
pub use acme::{AcmeClient, AcmeClientBuilder, SharedClientFactory};

// Object store seam
pub use store::{MemoryStore, ObjectStore};

// Events
pub use events::{EventSink, LogEventSink};

// Work queue
pub use queue::RateLimitedQueue;
