//! Container persistence for Lockbox.
//!
//! This crate knows the on-disk byte layout of a vault but nothing about
//! keys or records: it detects the format version, encodes and decodes the
//! container header, protects sections with forward error correction and
//! writes files atomically with timestamped backups.
//!
//! # Design Principles
//! - Atomic replacement: a container is either fully old or fully new
//! - Self-describing files: the version is known from the first 8 bytes
//! - Opaque metadata: slot metadata is carried, never interpreted

pub mod backup;
pub mod fec;
pub mod file;
pub mod format;

pub use backup::BackupInfo;
pub use file::{StagedWrite, VaultFileService};
pub use format::{
    detect_version, FormatVersion, HeaderV2, SlotRecord, V1Container, V2Container,
    MAX_HEADER_SIZE, MAX_KEY_SLOTS, POLICY_REQUIRE_HARDWARE,
};
