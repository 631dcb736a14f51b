//! Vault coordinator for Lockbox.
//!
//! This module provides:
//! - Vault creation, unlocking and saving for both container versions
//! - Key slots with roles, identity hashes and hardware bindings
//! - Factor management and data key rotation
//! - Session handling with secure key management
//!
//! # Architecture
//! The vault sits between the user interface and the storage and crypto
//! crates. Storage sees raw bytes and opaque slot records; the vault turns
//! them into typed slots and decides which key unlocks what.

pub mod config;
mod container;
pub mod manager;
pub mod records;
pub mod session;
pub mod slot;

pub use config::{SecurityPolicy, VaultSettings};
pub use manager::VaultManager;
pub use records::{RecordSet, SecretRecord};
pub use session::{SessionState, VaultSession};
pub use slot::{Factor, HardwareBinding, KeySlot, SlotMetadata, SlotRole};
