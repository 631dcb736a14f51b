//! Common utilities and types shared across Lockbox modules.
//!
//! This module provides the error taxonomy and the small set of types used
//! by every layer of the vault core.

pub mod error;
pub mod types;

pub use error::{Error, HardwareError, Result};
pub use types::{SensitiveBytes, SlotId, MAX_SLOT_ID_LENGTH};
