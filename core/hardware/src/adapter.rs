//! Hardware challenge-response adapter.
//!
//! The adapter is the only stateful piece of the vault core. Every device
//! call goes through a single async mutex because the underlying transports
//! are not reentrant, and enumeration results are cached briefly so bursts
//! of lookups do not hammer the bus.
//!
//! # State machine
//! `Uninitialized → Ready → (Enrolling | Authenticating) → Ready`
//!
//! The busy states are held by a guard, so an error, a timeout, a
//! cancellation or a dropped future all return the adapter to `Ready`.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::algorithm::{ChallengeAlgorithm, CHALLENGE_BLOCK_SIZE};
use crate::transport::{CredentialHandle, DeviceInfo, DeviceTransport};
use lockbox_common::{Error, HardwareError, Result, SensitiveBytes};

/// Default bound on a single device operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper bound accepted for the operation timeout.
pub const MAX_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default lifetime of a cached enumeration.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(2);
/// Shortest device PIN, in characters.
pub const MIN_PIN_LENGTH: usize = 4;
/// Longest device PIN, in characters.
pub const MAX_PIN_LENGTH: usize = 63;

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// `initialize` has not been called.
    Uninitialized,
    /// Idle and ready for an operation.
    Ready,
    /// Creating a credential.
    Enrolling,
    /// Computing a challenge response.
    Authenticating,
}

/// Adapter tuning.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Bound on each device call, including waiting for touch.
    pub operation_timeout: Duration,
    /// How long an enumeration result is reused.
    pub cache_ttl: Duration,
}

impl AdapterConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Set the operation timeout, capped at `MAX_OPERATION_TIMEOUT`.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout.min(MAX_OPERATION_TIMEOUT);
        self
    }

    /// Set the enumeration cache lifetime.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a successful enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Handle addressing the new credential.
    pub credential: CredentialHandle,
    /// Device that holds it.
    pub device: DeviceInfo,
}

/// Parameters of one challenge-response call.
#[derive(Clone, Copy)]
pub struct ChallengeRequest<'a> {
    /// Challenge bytes, at most one block.
    pub challenge: &'a [u8],
    /// Credential that should answer.
    pub credential: &'a CredentialHandle,
    /// Device PIN.
    pub pin: &'a str,
    /// HMAC family.
    pub algorithm: ChallengeAlgorithm,
}

/// Caller choices for `respond`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespondOptions {
    /// Retry once if the user does not touch the key in time.
    pub retry_on_timeout: bool,
}

struct EnumerationCache {
    devices: Vec<DeviceInfo>,
    fetched_at: Instant,
}

impl EnumerationCache {
    fn fresh(&self, ttl: Duration) -> Option<&[DeviceInfo]> {
        (self.fetched_at.elapsed() < ttl).then_some(self.devices.as_slice())
    }
}

/// State that only exists inside the serialization boundary.
#[derive(Default)]
struct Session {
    cache: Option<EnumerationCache>,
    credential: Option<CredentialHandle>,
}

/// Returns the adapter to `Ready` when an operation ends, however it ends.
struct BusyGuard<'a> {
    state: &'a StdMutex<AdapterState>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state = AdapterState::Ready;
    }
}

/// Serialized front end to one device transport.
///
/// Create one per process and share it behind an `Arc`.
pub struct HardwareAdapter {
    transport: Arc<dyn DeviceTransport>,
    config: AdapterConfig,
    state: StdMutex<AdapterState>,
    session: Mutex<Session>,
}

impl HardwareAdapter {
    /// Create an adapter over `transport`. It starts `Uninitialized`.
    pub fn new(transport: Arc<dyn DeviceTransport>, config: AdapterConfig) -> Self {
        Self {
            transport,
            config,
            state: StdMutex::new(AdapterState::Uninitialized),
            session: Mutex::new(Session::default()),
        }
    }

    /// Move from `Uninitialized` to `Ready`. Calling it again is a no-op.
    pub fn initialize(&self) {
        let mut state = self.lock_state();
        if *state == AdapterState::Uninitialized {
            *state = AdapterState::Ready;
            info!(transport = self.transport.name(), "Hardware adapter initialized");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.lock_state()
    }

    /// Operation timeout in effect.
    pub fn operation_timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    /// Credential handle from the most recent successful operation.
    pub async fn cached_credential(&self) -> Option<CredentialHandle> {
        self.session.lock().await.credential.clone()
    }

    /// List connected devices, served from the cache when it is fresh.
    ///
    /// # Errors
    /// - `NotInitialized` before `initialize`
    /// - `PresenceTimeout` or `Cancelled` if the bus hangs
    pub async fn list_devices(&self, cancel: &CancellationToken) -> Result<Vec<DeviceInfo>> {
        self.ensure_initialized()?;
        let mut session = self.acquire(cancel).await?;
        self.devices(&mut session, cancel).await
    }

    /// Enroll a new credential for `identity`.
    ///
    /// # Preconditions
    /// - Adapter is initialized
    /// - PIN is 4 to 63 characters
    ///
    /// # Postconditions
    /// - On success the credential is committed on the device and cached here
    /// - On cancellation or timeout no credential exists
    ///
    /// # Errors
    /// - `InvalidInput` for an empty identity or bad PIN length
    /// - `NoDevice`, `WrongPin`, `PinLocked`, `PresenceTimeout`, `Cancelled`
    pub async fn enroll(
        &self,
        identity: &str,
        pin: &str,
        cancel: &CancellationToken,
    ) -> Result<Enrollment> {
        if identity.is_empty() {
            return Err(Error::InvalidInput("Identity cannot be empty".to_string()));
        }
        validate_pin(pin)?;
        self.ensure_initialized()?;

        let mut session = self.acquire(cancel).await?;
        let _busy = self.enter(AdapterState::Enrolling)?;

        let device = self.select_device(&mut session, cancel).await?;
        debug!(device = %device.serial, "Waiting for touch to enroll credential");

        let credential = self
            .bounded(cancel, self.transport.make_credential(&device, identity, pin))
            .await
            .inspect_err(|e| self.note_failure(&mut session, e))?;

        info!(device = %device.serial, "Hardware credential enrolled");
        session.credential = Some(credential.clone());
        Ok(Enrollment { credential, device })
    }

    /// Ask the device to answer a challenge.
    ///
    /// The challenge is zero-padded to the 64-byte block before it is sent.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty or oversized challenge or bad PIN length
    /// - `UnsupportedAlgorithm` for a reserved algorithm; nothing is sent
    /// - `NoDevice`, `WrongPin`, `PinLocked`, `CredentialNotFound`,
    ///   `PresenceTimeout`, `Cancelled`
    pub async fn respond(
        &self,
        request: &ChallengeRequest<'_>,
        options: RespondOptions,
        cancel: &CancellationToken,
    ) -> Result<SensitiveBytes> {
        request.algorithm.ensure_supported()?;
        validate_pin(request.pin)?;
        let block = pad_challenge(request.challenge)?;
        self.ensure_initialized()?;

        let mut session = self.acquire(cancel).await?;
        let _busy = self.enter(AdapterState::Authenticating)?;

        let mut retried = false;
        loop {
            match self.respond_once(&mut session, request, &block, cancel).await {
                Err(e) if e.is_presence_timeout() && options.retry_on_timeout && !retried => {
                    warn!("No touch before timeout, retrying challenge once");
                    retried = true;
                }
                outcome => return outcome,
            }
        }
    }

    async fn respond_once(
        &self,
        session: &mut Session,
        request: &ChallengeRequest<'_>,
        block: &[u8; CHALLENGE_BLOCK_SIZE],
        cancel: &CancellationToken,
    ) -> Result<SensitiveBytes> {
        let device = self.select_device(session, cancel).await?;
        debug!(device = %device.serial, "Waiting for touch to answer challenge");

        let response = self
            .bounded(
                cancel,
                self.transport.challenge_response(
                    &device,
                    request.credential,
                    request.pin,
                    request.algorithm,
                    block,
                ),
            )
            .await
            .inspect_err(|e| self.note_failure(&mut *session, e))?;

        if response.len() != request.algorithm.response_size() {
            return Err(HardwareError::Transport(format!(
                "expected {}-byte response, got {}",
                request.algorithm.response_size(),
                response.len()
            ))
            .into());
        }

        session.credential = Some(request.credential.clone());
        Ok(response)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.state() == AdapterState::Uninitialized {
            return Err(HardwareError::NotInitialized.into());
        }
        Ok(())
    }

    fn enter(&self, busy: AdapterState) -> Result<BusyGuard<'_>> {
        let mut state = self.lock_state();
        if *state == AdapterState::Uninitialized {
            return Err(HardwareError::NotInitialized.into());
        }
        *state = busy;
        Ok(BusyGuard { state: &self.state })
    }

    /// Take the serialization lock, giving up if the caller cancels first.
    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, Session>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HardwareError::Cancelled.into()),
            guard = self.session.lock() => Ok(guard),
        }
    }

    /// Run a device call under the operation timeout and the caller's token.
    async fn bounded<T>(
        &self,
        cancel: &CancellationToken,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HardwareError::Cancelled.into()),
            outcome = tokio::time::timeout(self.config.operation_timeout, operation) => {
                outcome.unwrap_or_else(|_| Err(HardwareError::PresenceTimeout.into()))
            }
        }
    }

    async fn devices(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceInfo>> {
        if let Some(devices) = session
            .cache
            .as_ref()
            .and_then(|cache| cache.fresh(self.config.cache_ttl))
        {
            debug!(count = devices.len(), "Using cached device enumeration");
            return Ok(devices.to_vec());
        }

        let devices = self.bounded(cancel, self.transport.enumerate()).await?;
        debug!(count = devices.len(), "Enumerated security keys");
        session.cache = Some(EnumerationCache {
            devices: devices.clone(),
            fetched_at: Instant::now(),
        });
        Ok(devices)
    }

    async fn select_device(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<DeviceInfo> {
        self.devices(session, cancel)
            .await?
            .into_iter()
            .find(|device| device.algorithms.contains(&ChallengeAlgorithm::HmacSha256))
            .ok_or_else(|| HardwareError::NoDevice.into())
    }

    /// Drop the enumeration cache when the device went away mid-operation.
    fn note_failure(&self, session: &mut Session, err: &Error) {
        if matches!(err, Error::Hardware(HardwareError::NoDevice)) {
            session.cache = None;
        }
    }
}

/// Check PIN length in characters.
pub fn validate_pin(pin: &str) -> Result<()> {
    let length = pin.chars().count();
    if !(MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&length) {
        return Err(Error::InvalidInput(format!(
            "PIN must be {} to {} characters",
            MIN_PIN_LENGTH, MAX_PIN_LENGTH
        )));
    }
    Ok(())
}

/// Zero-pad a challenge to the device block size.
pub fn pad_challenge(challenge: &[u8]) -> Result<[u8; CHALLENGE_BLOCK_SIZE]> {
    if challenge.is_empty() || challenge.len() > CHALLENGE_BLOCK_SIZE {
        return Err(Error::InvalidInput(format!(
            "Challenge must be 1 to {} bytes, got {}",
            CHALLENGE_BLOCK_SIZE,
            challenge.len()
        )));
    }
    let mut block = [0u8; CHALLENGE_BLOCK_SIZE];
    block[..challenge.len()].copy_from_slice(challenge);
    Ok(block)
}
