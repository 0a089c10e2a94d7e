//! Volume Upload - one-shot authenticated upload path into storage claims
//!
//! A claim annotated for upload gets an ephemeral receiver workload (a pod and
//! a service) that accepts exactly one streamed disk image, writes it into the
//! claim's volume, and exits. Clients authorize against a receiver with a
//! sealed token bound to the claim identity.
//!
//! # Architecture
//!
//! - The controller watches claims, receiver pods, and receiver services,
//!   funnels every event into a deduplicating work queue keyed by claim, and
//!   converges each claim's receiver workload with its annotations
//! - The receiver server runs inside the spawned pod and serves a single
//!   upload before shutting itself down
//! - The token subsystem seals a claim identity for one receiver and signs it
//!   for one issuer
//!
//! # Modules
//!
//! - [`claim`] - Claim keys and the annotation contract
//! - [`workload`] - Receiver pod/service templates and the provisioner
//! - [`controller`] - Watch, cache, work queue, and per-claim sync
//! - [`server`] - Single-flight upload receiver
//! - [`token`] - Sealed, signed upload tokens
//! - [`config`] - Process configuration
//! - [`retry`] - Backoff policy for re-queued work
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod claim;
pub mod config;
pub mod controller;
pub mod error;
pub mod retry;
pub mod server;
pub mod token;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// HTTP path served by the receiver
pub const UPLOAD_PATH: &str = "/v1alpha1/upload";

/// Default port the receiver listens on inside its pod
pub const DEFAULT_LISTEN_PORT: u16 = 8443;

/// Default bind address for the receiver
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

/// Directory where the claim volume is mounted in the receiver pod
pub const DEFAULT_PVC_DIR: &str = "/data";

/// File the uploaded image is written to inside the claim volume
pub const DEFAULT_DESTINATION: &str = "/data/disk.img";

/// Port exposed by the receiver service
pub const SERVICE_PORT: i32 = 443;
