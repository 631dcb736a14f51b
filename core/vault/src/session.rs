//! Vault session management.
//!
//! A session holds the decrypted data key and record set of one open vault.
//! Both are wiped when the session is locked or dropped.

use std::path::{Path, PathBuf};
use uuid::Uuid;

use lockbox_common::{Error, Result, SlotId};
use lockbox_crypto::{DataKey, PayloadCipher, Salt};
use lockbox_storage::{fec, FormatVersion};

use crate::config::SecurityPolicy;
use crate::records::{RecordSet, SecretRecord};
use crate::slot::{KeySlot, SlotRole};

/// State of the vault session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is active and keys are available.
    Active,
    /// Session is locked, keys have been cleared.
    Locked,
}

/// Container-specific part of a session.
#[derive(Debug, Clone)]
pub(crate) enum Layout {
    /// Single implicit slot; the data key is the password-derived key.
    V1 { iterations: u32, salt: Salt },
    /// Explicit slot table.
    V2 {
        cipher: PayloadCipher,
        fec_redundancy: u8,
        policy: SecurityPolicy,
        slots: Vec<KeySlot>,
    },
}

/// Open vault.
pub struct VaultSession {
    path: PathBuf,
    layout: Layout,
    data_key: Option<DataKey>,
    records: RecordSet,
    unlocked_slot: Option<SlotId>,
    state: SessionState,
    dirty: bool,
}

impl VaultSession {
    pub(crate) fn new(
        path: PathBuf,
        layout: Layout,
        data_key: DataKey,
        records: RecordSet,
        unlocked_slot: Option<SlotId>,
    ) -> Self {
        Self {
            path,
            layout,
            data_key: Some(data_key),
            records,
            unlocked_slot,
            state: SessionState::Active,
            dirty: false,
        }
    }

    /// Container file backing this session.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Container version the session will be saved as.
    pub fn version(&self) -> FormatVersion {
        match self.layout {
            Layout::V1 { .. } => FormatVersion::V1,
            Layout::V2 { .. } => FormatVersion::V2,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether there are changes not yet saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Key slots (empty for a version 1 vault).
    pub fn slots(&self) -> &[KeySlot] {
        match &self.layout {
            Layout::V1 { .. } => &[],
            Layout::V2 { slots, .. } => slots,
        }
    }

    /// Slot that unlocked this session.
    pub fn unlocked_slot(&self) -> Option<&SlotId> {
        self.unlocked_slot.as_ref()
    }

    /// Role of the user who unlocked this session.
    ///
    /// Version 1 vaults have no roles.
    pub fn current_role(&self) -> Option<SlotRole> {
        let id = self.unlocked_slot.as_ref()?;
        self.slots().iter().find(|s| &s.id == id).map(KeySlot::role)
    }

    /// Policy stored in the header (version 2 only).
    pub fn security_policy(&self) -> Option<SecurityPolicy> {
        match &self.layout {
            Layout::V1 { .. } => None,
            Layout::V2 { policy, .. } => Some(*policy),
        }
    }

    /// Payload cipher used on save.
    pub fn payload_cipher(&self) -> PayloadCipher {
        match &self.layout {
            Layout::V1 { .. } => PayloadCipher::Aes256Gcm,
            Layout::V2 { cipher, .. } => *cipher,
        }
    }

    /// Error-correction redundancy used on save (version 2 only, 0 when off).
    pub fn fec_redundancy(&self) -> Option<u8> {
        match &self.layout {
            Layout::V1 { .. } => None,
            Layout::V2 { fec_redundancy, .. } => Some(*fec_redundancy),
        }
    }

    /// Change the error-correction redundancy written on the next save.
    ///
    /// # Errors
    /// - `InvalidInput` if `redundancy` is neither 0 nor within 5..=50
    /// - `NotPermitted` for version 1 vaults
    pub fn set_fec_redundancy(&mut self, redundancy: u8) -> Result<()> {
        self.ensure_active()?;
        if redundancy != 0 {
            fec::validate_redundancy(redundancy)?;
        }
        match &mut self.layout {
            Layout::V1 { .. } => Err(Error::NotPermitted(
                "Version 1 vaults have no error correction; upgrade first".to_string(),
            )),
            Layout::V2 { fec_redundancy, .. } => {
                *fec_redundancy = redundancy;
                self.dirty = true;
                Ok(())
            }
        }
    }

    /// Decrypted records.
    ///
    /// # Errors
    /// - Returns error if session is locked
    pub fn records(&self) -> Result<&RecordSet> {
        self.ensure_active()?;
        Ok(&self.records)
    }

    /// Add a record.
    pub fn add_record(&mut self, record: SecretRecord) -> Result<Uuid> {
        self.ensure_active()?;
        let id = self.records.add(record)?;
        self.dirty = true;
        Ok(id)
    }

    /// Replace the contents of record `id`.
    pub fn update_record(&mut self, id: Uuid, record: SecretRecord) -> Result<()> {
        self.ensure_active()?;
        self.records.update(id, record)?;
        self.dirty = true;
        Ok(())
    }

    /// Delete record `id`.
    pub fn delete_record(&mut self, id: Uuid) -> Result<()> {
        self.ensure_active()?;
        self.records.remove(id)?;
        self.dirty = true;
        Ok(())
    }

    /// Lock the session, clearing the data key and records from memory.
    ///
    /// # Postconditions
    /// - Data key and records are zeroized and removed
    /// - Session state is Locked
    pub fn lock(&mut self) {
        // DataKey and SecretRecord zeroize themselves on drop
        self.data_key = None;
        self.records.clear();
        self.state = SessionState::Locked;
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Locked => Err(Error::NotPermitted("Session is locked".to_string())),
        }
    }

    pub(crate) fn data_key(&self) -> Result<&DataKey> {
        self.ensure_active()?;
        self.data_key
            .as_ref()
            .ok_or_else(|| Error::Vault("Data key not available".to_string()))
    }

    pub(crate) fn set_data_key(&mut self, key: DataKey) {
        self.data_key = Some(key);
        self.dirty = true;
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
        self.dirty = true;
    }

    pub(crate) fn set_unlocked_slot(&mut self, slot: Option<SlotId>) {
        self.unlocked_slot = slot;
    }

    /// Mutable slot table, marking the session dirty.
    pub(crate) fn slots_mut(&mut self) -> Result<&mut Vec<KeySlot>> {
        self.ensure_active()?;
        match &mut self.layout {
            Layout::V1 { .. } => Err(Error::NotPermitted(
                "Version 1 vaults have no key slots; upgrade first".to_string(),
            )),
            Layout::V2 { slots, .. } => {
                self.dirty = true;
                Ok(slots)
            }
        }
    }

    pub(crate) fn record_set(&self) -> &RecordSet {
        &self.records
    }

    pub(crate) fn mark_saved(&mut self) {
        self.dirty = false;
    }
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        self.lock();
    }
}

impl std::fmt::Debug for VaultSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSession")
            .field("path", &self.path)
            .field("version", &self.version())
            .field("state", &self.state)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}
