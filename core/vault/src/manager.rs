//! Vault manager for creating, opening and re-keying vaults.
//!
//! The manager owns the settings, the file service and the optional
//! hardware adapter. Sessions carry the decrypted state; every operation
//! that changes keys works on a session and takes effect on the next save.

use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use lockbox_common::{Error, HardwareError, Result, SensitiveBytes, SlotId};
use lockbox_crypto::{
    combine, derive_key, random_array, unwrap_key, wrap_key, DataKey, IdentityHashRecord,
    KdfAlgorithm, KdfParams, KeyEncryptionKey, Salt,
};
use lockbox_hardware::{
    CancellationToken, ChallengeAlgorithm, ChallengeRequest, HardwareAdapter, RespondOptions,
};
use lockbox_storage::{FormatVersion, VaultFileService, MAX_KEY_SLOTS};

use crate::config::{SecurityPolicy, VaultSettings};
use crate::container::{seal_v1, v1_key, ParsedV1, ParsedV2, SealV2};
use crate::records::RecordSet;
use crate::session::{Layout, VaultSession};
use crate::slot::{Factor, HardwareBinding, KeySlot, SlotMetadata, SlotRole};

/// Vault manager for creating and opening vaults.
pub struct VaultManager {
    settings: VaultSettings,
    files: VaultFileService,
    hardware: Option<Arc<HardwareAdapter>>,
    cancel: CancellationToken,
}

impl VaultManager {
    /// Create a manager with validated settings.
    ///
    /// # Errors
    /// - `InvalidInput` or `NotPermitted` from `VaultSettings::validate`
    pub fn new(settings: VaultSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            files: settings.file_service(),
            settings,
            hardware: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Attach a hardware adapter, initializing it if needed.
    pub fn with_hardware(mut self, adapter: Arc<HardwareAdapter>) -> Self {
        adapter.initialize();
        self.hardware = Some(adapter);
        self
    }

    /// Settings this manager was built with.
    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    /// File service used for containers and backups.
    pub fn files(&self) -> &VaultFileService {
        &self.files
    }

    /// Token that aborts any in-flight hardware operation when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create a new version 2 vault with one administrator slot.
    ///
    /// # Preconditions
    /// - No file exists at `path`
    /// - `factor` satisfies the configured security policy
    ///
    /// # Postconditions
    /// - The container is written and an active session returned
    ///
    /// # Errors
    /// - `AlreadyExists` if `path` exists
    /// - `InvalidInput` / `NotPermitted` from the security policy
    /// - Hardware errors when the factor carries a PIN
    pub async fn create_vault(
        &self,
        path: &Path,
        username: &str,
        factor: &Factor,
    ) -> Result<VaultSession> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::AlreadyExists(format!("{} already exists", path.display())));
        }

        let cipher = self.settings.payload_cipher;
        cipher.ensure_allowed(self.settings.crypto_policy())?;
        let policy = self.settings.security;

        let data_key = DataKey::generate();
        let slot = self
            .build_slot(username, SlotRole::Administrator, factor, &data_key, &policy)
            .await?;
        let slot_id = slot.id.clone();

        let mut session = VaultSession::new(
            path.to_path_buf(),
            Layout::V2 {
                cipher,
                fec_redundancy: self.settings.fec.header_value(),
                policy,
                slots: vec![slot],
            },
            data_key,
            RecordSet::new(),
            Some(slot_id),
        );
        self.save(&mut session).await?;

        info!(path = %path.display(), "Vault created");
        Ok(session)
    }

    /// Open and unlock a vault.
    ///
    /// Version 2 vaults select the slot whose identity hash matches
    /// `username` and derive only that slot's key. Version 1 vaults ignore
    /// `username`.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `AuthenticationFailure` for an unknown user or a wrong v1 password
    /// - `IntegrityFailure` for a wrong v2 factor
    /// - `Corrupted` / `UnsupportedVersion` for unreadable containers
    pub async fn open_vault(
        &self,
        path: &Path,
        username: &str,
        factor: &Factor,
    ) -> Result<VaultSession> {
        let (version, bytes) = self.files.read(path).await?;

        let session = match version {
            FormatVersion::V1 => {
                let parsed = ParsedV1::parse(&bytes)?;
                let kek = self
                    .derive_kek(
                        KdfAlgorithm::Pbkdf2HmacSha256,
                        v1_params(parsed.iterations),
                        &parsed.salt,
                        factor.password_bytes(),
                        None,
                    )
                    .await?;
                let data_key = v1_key(kek);
                let plaintext = Zeroizing::new(parsed.decrypt(&data_key)?);
                let records = RecordSet::from_bytes(&plaintext)?;

                VaultSession::new(
                    path.to_path_buf(),
                    Layout::V1 {
                        iterations: parsed.iterations,
                        salt: parsed.salt,
                    },
                    data_key,
                    records,
                    None,
                )
            }
            FormatVersion::V2 => {
                let parsed = ParsedV2::parse(&bytes)?;
                let index = self
                    .find_slot(&parsed.slots, username)
                    .await?
                    .ok_or(Error::AuthenticationFailure)?;
                let slot = &parsed.slots[index];
                let slot_id = slot.id.clone();

                let response = self.respond_for(slot, factor).await?;
                let data_key = self
                    .unwrap_slot(slot, factor.password_bytes(), response.as_ref())
                    .await?;
                let plaintext =
                    Zeroizing::new(parsed.decrypt(&data_key, self.settings.crypto_policy())?);
                let records = RecordSet::from_bytes(&plaintext)?;

                VaultSession::new(
                    path.to_path_buf(),
                    Layout::V2 {
                        cipher: parsed.cipher,
                        fec_redundancy: parsed.fec_redundancy,
                        policy: parsed.policy,
                        slots: parsed.slots,
                    },
                    data_key,
                    records,
                    Some(slot_id),
                )
            }
        };

        info!(path = %path.display(), ?version, "Vault opened");
        Ok(session)
    }

    /// Encrypt the session under a fresh nonce and write it atomically.
    ///
    /// The previous container is backed up first when backups are enabled,
    /// and old backups are pruned afterwards.
    pub async fn save(&self, session: &mut VaultSession) -> Result<()> {
        let data_key = session.data_key()?;
        let plaintext = session.record_set().to_bytes()?;

        let (version, bytes) = match session.layout() {
            Layout::V1 { iterations, salt } => (
                FormatVersion::V1,
                seal_v1(*iterations, salt, data_key, &plaintext)?,
            ),
            Layout::V2 {
                cipher,
                fec_redundancy,
                policy,
                slots,
            } => {
                cipher.ensure_allowed(self.settings.crypto_policy())?;
                let seal = SealV2 {
                    cipher: *cipher,
                    fec_redundancy: *fec_redundancy,
                    policy: *policy,
                    slots,
                };
                (FormatVersion::V2, seal.seal(data_key, &plaintext)?)
            }
        };

        let path = session.path();
        let backups = &self.settings.backups;
        if backups.enabled && tokio::fs::try_exists(path).await.unwrap_or(false) {
            self.files.create_backup(path).await?;
        }
        self.files.write(path, version, &bytes).await?;
        if backups.enabled {
            self.files
                .cleanup_old_backups(path, backups.max_backups)
                .await?;
        }

        session.mark_saved();
        debug!(path = %session.path().display(), ?version, "Vault saved");
        Ok(())
    }

    /// Index of the slot belonging to `username`, if any.
    ///
    /// Identity hashes may be PBKDF2 or Argon2id, so matching runs on the
    /// blocking pool.
    pub async fn find_slot(&self, slots: &[KeySlot], username: &str) -> Result<Option<usize>> {
        let identities: Vec<Option<IdentityHashRecord>> = slots
            .iter()
            .map(|slot| slot.metadata.identity.clone())
            .collect();
        let label = Zeroizing::new(username.as_bytes().to_vec());
        let policy = self.settings.crypto_policy();

        tokio::task::spawn_blocking(move || {
            identities.iter().position(|identity| {
                identity
                    .as_ref()
                    .is_some_and(|identity| identity.matches(&label, policy))
            })
        })
        .await
        .map_err(|e| Error::Crypto(format!("Identity lookup task failed: {}", e)))
    }

    /// Enroll a new user.
    ///
    /// # Preconditions
    /// - The session was unlocked by an administrator
    /// - `username` is not already enrolled
    ///
    /// # Errors
    /// - `NotPermitted` for non-administrators or version 1 vaults
    /// - `AlreadyExists` for a duplicate user
    /// - `InvalidInput` if the slot table is full or the factor is too weak
    pub async fn add_factor(
        &self,
        session: &mut VaultSession,
        username: &str,
        factor: &Factor,
        role: SlotRole,
    ) -> Result<SlotId> {
        require_admin(session)?;
        if session.slots().len() >= MAX_KEY_SLOTS {
            return Err(Error::InvalidInput(format!(
                "A vault holds at most {} key slots",
                MAX_KEY_SLOTS
            )));
        }
        if self.find_slot(session.slots(), username).await?.is_some() {
            return Err(Error::AlreadyExists(format!("User {} already enrolled", username)));
        }

        let policy = session.security_policy().unwrap_or_default();
        let data_key = session.data_key()?.clone();
        let slot = self
            .build_slot(username, role, factor, &data_key, &policy)
            .await?;
        let slot_id = slot.id.clone();

        session.slots_mut()?.push(slot);
        info!(slot = %slot_id, %role, hardware = factor.has_hardware(), "Key slot added");
        Ok(slot_id)
    }

    /// Revoke a slot, optionally rotating the data key in the same step.
    ///
    /// With `rotate_with`, every retained slot must have a factor in it;
    /// the data key is replaced and all retained slots are re-wrapped.
    ///
    /// # Errors
    /// - `NotPermitted` for non-administrators or the last administrator
    /// - `NotFound` for an unknown slot
    pub async fn remove_factor(
        &self,
        session: &mut VaultSession,
        slot_id: &SlotId,
        rotate_with: Option<&[(SlotId, Factor)]>,
    ) -> Result<()> {
        require_admin(session)?;
        let slots = session.slots();
        let index = slots
            .iter()
            .position(|s| &s.id == slot_id)
            .ok_or_else(|| Error::NotFound(format!("Key slot {}", slot_id)))?;

        let admins = slots.iter().filter(|s| s.role().is_admin()).count();
        if slots[index].role().is_admin() && admins == 1 {
            return Err(Error::NotPermitted(
                "Cannot remove the last administrator".to_string(),
            ));
        }

        let mut retained = slots.to_vec();
        retained.remove(index);

        match rotate_with {
            Some(factors) => {
                let current = session.data_key()?.clone();
                let (data_key, rekeyed) = self.rekey(&retained, &current, factors).await?;
                *session.slots_mut()? = rekeyed;
                session.set_data_key(data_key);
            }
            None => *session.slots_mut()? = retained,
        }

        if session.unlocked_slot() == Some(slot_id) {
            session.set_unlocked_slot(None);
        }
        info!(slot = %slot_id, rotated = rotate_with.is_some(), "Key slot removed");
        Ok(())
    }

    /// Replace a slot's password, keeping the data key.
    ///
    /// Users may change their own slot; administrators may change any
    /// slot. A hardware binding is kept and must answer with `old`'s PIN.
    ///
    /// # Errors
    /// - `NotPermitted` when changing someone else's slot without admin rights
    /// - `IntegrityFailure` if `old` does not unlock the slot
    pub async fn change_password(
        &self,
        session: &mut VaultSession,
        slot_id: &SlotId,
        old: &Factor,
        new: &Factor,
    ) -> Result<()> {
        let own_slot = session.unlocked_slot() == Some(slot_id);
        if !own_slot && session.current_role() != Some(SlotRole::Administrator) {
            return Err(Error::NotPermitted(
                "Only administrators may change another user's password".to_string(),
            ));
        }
        let slot = session
            .slots()
            .iter()
            .find(|s| &s.id == slot_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Key slot {}", slot_id)))?;

        let policy = session.security_policy().unwrap_or_default();
        policy.check_new_factor(new.password_bytes(), slot.hardware().is_some())?;

        let current = session.data_key()?.clone();
        let response = self.respond_for(&slot, old).await?;
        let unlocked = self
            .unwrap_slot(&slot, old.password_bytes(), response.as_ref())
            .await?;
        if !same_key(&unlocked, &current) {
            return Err(Error::IntegrityFailure);
        }

        let updated = self
            .rewrap_slot(&slot, new.password_bytes(), response.as_ref(), &current)
            .await?;
        if let Some(existing) = session.slots_mut()?.iter_mut().find(|s| &s.id == slot_id) {
            *existing = updated;
        }
        info!(slot = %slot_id, "Password changed");
        Ok(())
    }

    /// Replace the data key and re-wrap every slot under fresh salts.
    ///
    /// # Errors
    /// - `NotPermitted` for non-administrators
    /// - `InvalidInput` if any slot lacks a factor
    /// - `IntegrityFailure` if any factor does not unlock its slot
    pub async fn rotate_data_key(
        &self,
        session: &mut VaultSession,
        factors: &[(SlotId, Factor)],
    ) -> Result<()> {
        require_admin(session)?;
        let current = session.data_key()?.clone();
        let slots = session.slots().to_vec();

        let (data_key, rekeyed) = self.rekey(&slots, &current, factors).await?;
        *session.slots_mut()? = rekeyed;
        session.set_data_key(data_key);

        info!(slots = slots.len(), "Data key rotated");
        Ok(())
    }

    /// Convert an open version 1 vault to version 2 with one administrator.
    ///
    /// A fresh data key is generated. The file is rewritten on the next save.
    ///
    /// # Errors
    /// - `InvalidInput` if the vault is already version 2
    /// - `AuthenticationFailure` if `factor` is not the vault password
    pub async fn upgrade_to_v2(
        &self,
        session: &mut VaultSession,
        username: &str,
        factor: &Factor,
    ) -> Result<SlotId> {
        let (iterations, salt) = match session.layout() {
            Layout::V1 { iterations, salt } => (*iterations, salt.clone()),
            Layout::V2 { .. } => {
                return Err(Error::InvalidInput("Vault is already version 2".to_string()))
            }
        };

        let kek = self
            .derive_kek(
                KdfAlgorithm::Pbkdf2HmacSha256,
                v1_params(iterations),
                &salt,
                factor.password_bytes(),
                None,
            )
            .await?;
        if !same_key(&v1_key(kek), session.data_key()?) {
            return Err(Error::AuthenticationFailure);
        }

        let cipher = self.settings.payload_cipher;
        cipher.ensure_allowed(self.settings.crypto_policy())?;
        let policy = self.settings.security;
        let data_key = DataKey::generate();
        let slot = self
            .build_slot(username, SlotRole::Administrator, factor, &data_key, &policy)
            .await?;
        let slot_id = slot.id.clone();

        session.set_layout(Layout::V2 {
            cipher,
            fec_redundancy: self.settings.fec.header_value(),
            policy,
            slots: vec![slot],
        });
        session.set_data_key(data_key);
        session.set_unlocked_slot(Some(slot_id.clone()));

        info!(path = %session.path().display(), "Vault upgraded to version 2");
        Ok(slot_id)
    }

    async fn build_slot(
        &self,
        username: &str,
        role: SlotRole,
        factor: &Factor,
        data_key: &DataKey,
        policy: &SecurityPolicy,
    ) -> Result<KeySlot> {
        if username.trim().is_empty() {
            return Err(Error::InvalidInput("Username cannot be empty".to_string()));
        }
        policy.check_new_factor(factor.password_bytes(), factor.has_hardware())?;

        let kdf = self.settings.kdf_algorithm()?;
        let params = self.settings.kdf_params;
        params.validate(kdf)?;
        let identity = self.hash_identity(username).await?;

        let hardware = match factor.pin() {
            Some(pin) => {
                let enrollment = self.adapter()?.enroll(username, pin, &self.cancel).await?;
                Some(HardwareBinding {
                    credential: enrollment.credential,
                    challenge: random_array(),
                    algorithm: ChallengeAlgorithm::HmacSha256,
                    device_serial: enrollment.device.serial,
                    enrolled_at: chrono::Utc::now(),
                })
            }
            None => None,
        };

        let salt = Salt::generate();
        let response = match &hardware {
            Some(binding) => Some(self.challenge(binding, factor).await?),
            None => None,
        };
        let kek = self
            .derive_kek(kdf, params, &salt, factor.password_bytes(), response.as_ref())
            .await?;

        Ok(KeySlot {
            id: SlotId::generate(),
            kdf,
            params,
            salt,
            wrapped_key: wrap_key(&kek, data_key)?,
            metadata: SlotMetadata {
                role,
                identity: Some(identity),
                hardware,
                created_at: chrono::Utc::now(),
            },
        })
    }

    /// Same slot, new salt, key wrapped under `password`.
    async fn rewrap_slot(
        &self,
        slot: &KeySlot,
        password: &[u8],
        response: Option<&SensitiveBytes>,
        data_key: &DataKey,
    ) -> Result<KeySlot> {
        let salt = Salt::generate();
        let kek = self
            .derive_kek(slot.kdf, slot.params, &salt, password, response)
            .await?;
        Ok(KeySlot {
            salt,
            wrapped_key: wrap_key(&kek, data_key)?,
            ..slot.clone()
        })
    }

    async fn unwrap_slot(
        &self,
        slot: &KeySlot,
        password: &[u8],
        response: Option<&SensitiveBytes>,
    ) -> Result<DataKey> {
        let kek = self
            .derive_kek(slot.kdf, slot.params, &slot.salt, password, response)
            .await?;
        unwrap_key(&kek, &slot.wrapped_key)
    }

    /// Verify each slot's factor and re-wrap all slots under a new key.
    async fn rekey(
        &self,
        slots: &[KeySlot],
        current: &DataKey,
        factors: &[(SlotId, Factor)],
    ) -> Result<(DataKey, Vec<KeySlot>)> {
        let mut unlocked = Vec::with_capacity(slots.len());
        for slot in slots {
            let factor = factors
                .iter()
                .find(|(id, _)| id == &slot.id)
                .map(|(_, factor)| factor)
                .ok_or_else(|| {
                    Error::InvalidInput(format!("Missing factor for key slot {}", slot.id))
                })?;

            let response = self.respond_for(slot, factor).await?;
            let key = self
                .unwrap_slot(slot, factor.password_bytes(), response.as_ref())
                .await?;
            if !same_key(&key, current) {
                return Err(Error::IntegrityFailure);
            }
            unlocked.push((slot, factor, response));
        }
        if factors.len() > slots.len() {
            warn!(
                supplied = factors.len(),
                slots = slots.len(),
                "Ignoring factors for slots that are not retained"
            );
        }

        let data_key = DataKey::generate();
        let mut rekeyed = Vec::with_capacity(slots.len());
        for (slot, factor, response) in unlocked {
            rekeyed.push(
                self.rewrap_slot(slot, factor.password_bytes(), response.as_ref(), &data_key)
                    .await?,
            );
        }
        Ok((data_key, rekeyed))
    }

    async fn hash_identity(&self, username: &str) -> Result<IdentityHashRecord> {
        let label = Zeroizing::new(username.as_bytes().to_vec());
        let settings = self.settings.identity_hash;
        let policy = self.settings.crypto_policy();

        tokio::task::spawn_blocking(move || {
            IdentityHashRecord::create(&label, settings.algorithm, settings.iterations, policy)
        })
        .await
        .map_err(|e| Error::Crypto(format!("Identity hashing task failed: {}", e)))?
    }

    /// Run the KDF off the async runtime, then mix in a hardware response.
    async fn derive_kek(
        &self,
        kdf: KdfAlgorithm,
        params: KdfParams,
        salt: &Salt,
        password: &[u8],
        response: Option<&SensitiveBytes>,
    ) -> Result<KeyEncryptionKey> {
        let password = Zeroizing::new(password.to_vec());
        let salt = salt.clone();
        let policy = self.settings.crypto_policy();

        let kek = tokio::task::spawn_blocking(move || {
            derive_key(&password, kdf, &salt, &params, policy)
        })
        .await
        .map_err(|e| Error::Crypto(format!("Key derivation task failed: {}", e)))??;

        match response {
            Some(response) => combine(&kek, response.as_bytes()),
            None => Ok(kek),
        }
    }

    /// Hardware response for a slot, if it is hardware-bound.
    async fn respond_for(&self, slot: &KeySlot, factor: &Factor) -> Result<Option<SensitiveBytes>> {
        match slot.hardware() {
            Some(binding) => Ok(Some(self.challenge(binding, factor).await?)),
            None => Ok(None),
        }
    }

    async fn challenge(
        &self,
        binding: &HardwareBinding,
        factor: &Factor,
    ) -> Result<SensitiveBytes> {
        let pin = factor.pin().ok_or_else(|| {
            Error::InvalidInput("This key slot requires a hardware key PIN".to_string())
        })?;
        let request = ChallengeRequest {
            challenge: &binding.challenge,
            credential: &binding.credential,
            pin,
            algorithm: binding.algorithm,
        };
        let options = RespondOptions {
            retry_on_timeout: self.settings.hardware.retry_on_timeout,
        };
        self.adapter()?
            .respond(&request, options, &self.cancel)
            .await
    }

    fn adapter(&self) -> Result<&HardwareAdapter> {
        self.hardware
            .as_deref()
            .ok_or(Error::Hardware(HardwareError::NotInitialized))
    }
}

fn v1_params(iterations: u32) -> KdfParams {
    KdfParams {
        pbkdf2_iterations: iterations,
        ..KdfParams::default()
    }
}

fn same_key(a: &DataKey, b: &DataKey) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn require_admin(session: &VaultSession) -> Result<()> {
    if session.version() == FormatVersion::V1 {
        return Err(Error::NotPermitted(
            "Version 1 vaults have a single password; upgrade first".to_string(),
        ));
    }
    match session.current_role() {
        Some(SlotRole::Administrator) => Ok(()),
        _ => Err(Error::NotPermitted(
            "Only administrators may manage key slots".to_string(),
        )),
    }
}
