//! Decrypted secret records.
//!
//! The record set is the vault payload: it is serialized to JSON and
//! encrypted as a whole on every save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use lockbox_common::{Error, Result};

/// One stored credential.
///
/// Text fields are wiped when the record is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretRecord {
    #[zeroize(skip)]
    id: Uuid,
    /// Display title.
    pub title: String,
    /// Account name.
    #[serde(default)]
    pub username: String,
    /// Secret value.
    #[serde(default)]
    pub password: String,
    /// Associated URL.
    #[serde(default)]
    pub url: String,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    #[zeroize(skip)]
    modified_at: DateTime<Utc>,
}

impl SecretRecord {
    /// Create a record with a fresh id.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            username: String::new(),
            password: String::new(),
            url: String::new(),
            notes: String::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Set the account name.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the secret value.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the notes.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Stable record id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the record was first added.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the record was last updated.
    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// All records of an unlocked vault.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RecordSet {
    records: Vec<SecretRecord>,
}

impl RecordSet {
    /// Empty record set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning its id.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty title
    /// - `AlreadyExists` if a record with the same id is present
    pub fn add(&mut self, record: SecretRecord) -> Result<Uuid> {
        if record.title.trim().is_empty() {
            return Err(Error::InvalidInput("Record title cannot be empty".to_string()));
        }
        if self.get(record.id).is_some() {
            return Err(Error::AlreadyExists(format!("Record {}", record.id)));
        }
        let id = record.id;
        self.records.push(record);
        Ok(id)
    }

    /// Replace the fields of record `id` with those of `updated`.
    ///
    /// The id and creation time are kept; the modification time is bumped.
    pub fn update(&mut self, id: Uuid, updated: SecretRecord) -> Result<()> {
        if updated.title.trim().is_empty() {
            return Err(Error::InvalidInput("Record title cannot be empty".to_string()));
        }
        let existing = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("Record {}", id)))?;

        existing.title.clone_from(&updated.title);
        existing.username.clone_from(&updated.username);
        existing.password.clone_from(&updated.password);
        existing.url.clone_from(&updated.url);
        existing.notes.clone_from(&updated.notes);
        existing.modified_at = Utc::now();
        Ok(())
    }

    /// Remove record `id`.
    pub fn remove(&mut self, id: Uuid) -> Result<SecretRecord> {
        let index = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("Record {}", id)))?;
        Ok(self.records.remove(index))
    }

    /// Record with `id`, if present.
    pub fn get(&self, id: Uuid) -> Option<&SecretRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Records whose title contains `query`, case-insensitively.
    pub fn search<'a>(&'a self, query: &'a str) -> impl Iterator<Item = &'a SecretRecord> + 'a {
        let query = query.to_lowercase();
        self.records
            .iter()
            .filter(move |r| r.title.to_lowercase().contains(&query))
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &SecretRecord> {
        self.records.iter()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record, wiping their contents.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Serialize for encryption.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a decrypted payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl fmt::Debug for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordSet({} records)", self.records.len())
    }
}
