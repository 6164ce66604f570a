//! End-to-end encrypted settings sync for settingsync.
//!
//! Replicates global and per-plugin settings between devices through an
//! untrusted relay:
//! - Debounced push of the local oplog in bounded, encrypted batches
//! - Cursor-paginated pull, resumable after a crash at page granularity
//! - Shared exponential backoff with jitter for both directions
//! - Recovery-code key bootstrap, restore on new devices, and two-phase reset
//!
//! [`SyncService`] is the entry point for hosts; the traits in
//! [`collaborators`], [`device`], and [`secret_store`] are the seams to the
//! rest of the application.

pub mod api_client;
pub mod backoff;
pub mod collaborators;
pub mod config;
pub mod crypto_provider;
pub mod debouncer;
pub mod device;
pub mod error;
pub mod key_manager;
pub mod secret_store;
pub mod service;
pub mod sync_manager;
pub mod types;

pub use config::{RelayClientConfig, ServiceConfig, SyncConfig};
pub use error::{CloudError, CloudResult};
pub use key_manager::{KeyManager, KeyObserver};
pub use service::{ServiceDeps, SyncService};
pub use sync_manager::{SyncDeps, SyncManager};
pub use types::*;
