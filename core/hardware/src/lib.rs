//! Hardware security key support for Lockbox.
//!
//! This module provides:
//! - A serialized challenge-response adapter with a lifecycle state machine
//! - A transport trait separating adapter logic from device plumbing
//! - A software authenticator implementing the transport in-process
//!
//! # Contract
//! A device answers a challenge of at most one 64-byte block with a
//! deterministic HMAC bound to one enrolled credential. Nothing else about
//! the device is relied upon.

pub mod adapter;
pub mod algorithm;
pub mod software;
pub mod transport;

pub use adapter::{
    pad_challenge, validate_pin, AdapterConfig, AdapterState, ChallengeRequest, Enrollment,
    HardwareAdapter, RespondOptions,
};
pub use algorithm::{ChallengeAlgorithm, CHALLENGE_BLOCK_SIZE};
pub use software::{SoftwareAuthenticator, TouchBehavior};
pub use transport::{CredentialHandle, DeviceInfo, DeviceTransport};
pub use tokio_util::sync::CancellationToken;
