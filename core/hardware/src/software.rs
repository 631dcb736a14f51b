//! In-process software authenticator.
//!
//! Behaves like a single HMAC-capable security key: it checks a PIN with a
//! retry counter, waits for a simulated touch and answers challenges with a
//! per-credential HMAC-SHA256 secret. Useful for tests and for exercising
//! the enrollment flow on machines without a physical key.

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::algorithm::{ChallengeAlgorithm, CHALLENGE_BLOCK_SIZE};
use crate::transport::{CredentialHandle, DeviceInfo, DeviceTransport};
use lockbox_common::{Error, HardwareError, Result, SensitiveBytes};

/// PIN attempts before the simulated device locks.
pub const DEFAULT_PIN_RETRIES: u8 = 8;

/// How the simulated user responds to a touch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchBehavior {
    /// Touch is confirmed immediately.
    Immediate,
    /// Touch is confirmed after a delay.
    After(Duration),
    /// Nobody ever touches the key.
    Never,
}

struct DeviceState {
    connected: bool,
    pin: Zeroizing<String>,
    pin_retries: u8,
    touch: TouchBehavior,
    credentials: HashSet<Vec<u8>>,
}

/// Software stand-in for a hardware security key.
pub struct SoftwareAuthenticator {
    serial: String,
    device_secret: Zeroizing<[u8; 32]>,
    state: Mutex<DeviceState>,
    enumerations: AtomicUsize,
}

impl SoftwareAuthenticator {
    /// Create a connected device with the given PIN and a random secret.
    pub fn new(pin: impl Into<String>) -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::with_secret(pin, secret)
    }

    /// Create a device with a fixed secret so responses are reproducible.
    pub fn with_secret(pin: impl Into<String>, secret: [u8; 32]) -> Self {
        let mut serial_bytes = [0u8; 4];
        OsRng.fill_bytes(&mut serial_bytes);
        Self {
            serial: format!("SW-{}", u32::from_be_bytes(serial_bytes)),
            device_secret: Zeroizing::new(secret),
            state: Mutex::new(DeviceState {
                connected: true,
                pin: Zeroizing::new(pin.into()),
                pin_retries: DEFAULT_PIN_RETRIES,
                touch: TouchBehavior::Immediate,
                credentials: HashSet::new(),
            }),
            enumerations: AtomicUsize::new(0),
        }
    }

    /// Simulate plugging the device in or pulling it out.
    pub fn set_connected(&self, connected: bool) {
        self.lock_state().connected = connected;
    }

    /// Change how the simulated user reacts to touch requests.
    pub fn set_touch(&self, touch: TouchBehavior) {
        self.lock_state().touch = touch;
    }

    /// Remaining PIN attempts.
    pub fn pin_retries(&self) -> u8 {
        self.lock_state().pin_retries
    }

    /// Number of committed credentials.
    pub fn credential_count(&self) -> usize {
        self.lock_state().credentials.len()
    }

    /// How many times `enumerate` reached the device.
    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        // A poisoned lock only means a test thread panicked mid-update;
        // the state itself is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial.clone(),
            product: "Lockbox Software Authenticator".to_string(),
            firmware: "1.0.0".to_string(),
            algorithms: vec![ChallengeAlgorithm::HmacSha256],
        }
    }

    /// Check presence and PIN, returning the touch behaviour to wait on.
    fn authorize(&self, device: &DeviceInfo, pin: &str) -> Result<TouchBehavior> {
        let mut state = self.lock_state();
        if !state.connected || device.serial != self.serial {
            return Err(HardwareError::NoDevice.into());
        }
        if state.pin_retries == 0 {
            return Err(HardwareError::PinLocked.into());
        }
        if state.pin.as_str() != pin {
            state.pin_retries -= 1;
            if state.pin_retries == 0 {
                return Err(HardwareError::PinLocked.into());
            }
            return Err(HardwareError::WrongPin {
                retries_left: Some(state.pin_retries),
            }
            .into());
        }
        state.pin_retries = DEFAULT_PIN_RETRIES;
        Ok(state.touch)
    }

    async fn wait_for_touch(touch: TouchBehavior) {
        match touch {
            TouchBehavior::Immediate => {}
            TouchBehavior::After(delay) => tokio::time::sleep(delay).await,
            TouchBehavior::Never => std::future::pending::<()>().await,
        }
    }

    fn credential_key(&self, credential: &CredentialHandle) -> Zeroizing<[u8; 32]> {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.device_secret.as_slice());
        hasher.update(credential.as_bytes());
        hasher.update(b"hmac-secret");

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&hasher.finalize());
        key
    }
}

#[async_trait]
impl DeviceTransport for SoftwareAuthenticator {
    fn name(&self) -> &str {
        "software"
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.lock_state().connected {
            Ok(vec![self.info()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn make_credential(
        &self,
        device: &DeviceInfo,
        _identity: &str,
        pin: &str,
    ) -> Result<CredentialHandle> {
        let touch = self.authorize(device, pin)?;
        Self::wait_for_touch(touch).await;

        let mut id = vec![0u8; 32];
        OsRng.fill_bytes(&mut id);
        self.lock_state().credentials.insert(id.clone());
        CredentialHandle::new(id)
    }

    async fn challenge_response(
        &self,
        device: &DeviceInfo,
        credential: &CredentialHandle,
        pin: &str,
        algorithm: ChallengeAlgorithm,
        challenge: &[u8; CHALLENGE_BLOCK_SIZE],
    ) -> Result<SensitiveBytes> {
        if algorithm != ChallengeAlgorithm::HmacSha256 {
            return Err(HardwareError::UnsupportedAlgorithm(format!("{:?}", algorithm)).into());
        }
        let touch = self.authorize(device, pin)?;
        if !self.lock_state().credentials.contains(credential.as_bytes()) {
            return Err(HardwareError::CredentialNotFound.into());
        }
        Self::wait_for_touch(touch).await;

        let key = self.credential_key(credential);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_slice())
            .map_err(|e| Error::Crypto(format!("HMAC init failed: {}", e)))?;
        mac.update(challenge);
        Ok(SensitiveBytes::new(mac.finalize().into_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enroll_and_respond_deterministic() {
        let device = SoftwareAuthenticator::new("123456");
        let info = device.enumerate().await.unwrap().remove(0);

        let handle = device.make_credential(&info, "alice", "123456").await.unwrap();
        let challenge = [7u8; CHALLENGE_BLOCK_SIZE];

        let algorithm = ChallengeAlgorithm::HmacSha256;

        let r1 = device
            .challenge_response(&info, &handle, "123456", algorithm, &challenge)
            .await
            .unwrap();
        let r2 = device
            .challenge_response(&info, &handle, "123456", algorithm, &challenge)
            .await
            .unwrap();
        assert_eq!(r1.len(), 32);
        assert_eq!(r1, r2);
    }

    #[tokio::test]
    async fn test_credentials_answer_differently() {
        let device = SoftwareAuthenticator::new("123456");
        let info = device.enumerate().await.unwrap().remove(0);
        let a = device.make_credential(&info, "alice", "123456").await.unwrap();
        let b = device.make_credential(&info, "bob", "123456").await.unwrap();
        let challenge = [1u8; CHALLENGE_BLOCK_SIZE];

        let ra = device
            .challenge_response(&info, &a, "123456", ChallengeAlgorithm::HmacSha256, &challenge)
            .await
            .unwrap();
        let rb = device
            .challenge_response(&info, &b, "123456", ChallengeAlgorithm::HmacSha256, &challenge)
            .await
            .unwrap();
        assert_ne!(ra, rb);
    }

    #[tokio::test]
    async fn test_pin_lockout() {
        let device = SoftwareAuthenticator::new("123456");
        let info = device.enumerate().await.unwrap().remove(0);

        for expected in (1..DEFAULT_PIN_RETRIES).rev() {
            let err = device.make_credential(&info, "alice", "000000").await.unwrap_err();
            assert!(matches!(
                err,
                Error::Hardware(HardwareError::WrongPin { retries_left: Some(r) }) if r == expected
            ));
        }
        let err = device.make_credential(&info, "alice", "000000").await.unwrap_err();
        assert!(matches!(err, Error::Hardware(HardwareError::PinLocked)));

        // Even the right PIN is refused once locked
        let err = device.make_credential(&info, "alice", "123456").await.unwrap_err();
        assert!(matches!(err, Error::Hardware(HardwareError::PinLocked)));
    }

    #[tokio::test]
    async fn test_unknown_credential() {
        let device = SoftwareAuthenticator::new("123456");
        let info = device.enumerate().await.unwrap().remove(0);
        let stranger = CredentialHandle::new(vec![9u8; 32]).unwrap();

        let challenge = [0u8; CHALLENGE_BLOCK_SIZE];
        let algorithm = ChallengeAlgorithm::HmacSha256;

        let err = device
            .challenge_response(&info, &stranger, "123456", algorithm, &challenge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Hardware(HardwareError::CredentialNotFound)));
    }

    #[tokio::test]
    async fn test_disconnected_device_not_listed() {
        let device = SoftwareAuthenticator::new("123456");
        device.set_connected(false);
        assert!(device.enumerate().await.unwrap().is_empty());
        assert_eq!(device.enumeration_count(), 1);
    }
}
