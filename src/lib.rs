//! mixnotify - push-notification relay for mix-network clients.
//!
//! Clients never expose their real identity to the network. Instead they
//! register an intermediary identity here; every epoch the service derives a
//! short ephemeral id from it, the gateway reports which ephemeral ids have
//! messages waiting, and the service wakes the matching devices through a
//! push provider.
//!
//! # Architecture
//!
//! - **Storage** - users, tracked identities and epoch records; the only shared state
//! - **Registration** - signed requests that add and remove tokens and identities
//! - **Epoch manager** - creates the current epoch's records and prunes expired ones
//! - **Dispatch** - polls the gateway and notifies devices
//!
//! # Modules
//!
//! - [`storage`] - storage contract and the in-memory store
//! - [`registration`] - request validation
//! - [`epoch`] - creator and deleter passes
//! - [`dispatch`] - the notification loop
//! - [`api`] - HTTP registration endpoints
//! - [`service`] - wiring and lifecycle
//! - [`config`] - configuration loading/saving

pub mod api;
pub mod authority;
pub mod clock;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod dispatch;
pub mod epoch;
pub mod gateway;
pub mod notifications;
pub mod registration;
pub mod service;
pub mod storage;
pub mod topology;

// Re-export commonly used types
pub use config::Config;
pub use registration::{Registrar, RegistrationError};
pub use service::Service;
pub use storage::{MemoryStore, Storage, StorageError};
