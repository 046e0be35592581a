//! Key material and rotation
//!
//! Each key version is derived with PBKDF2-HMAC-SHA256 from the instance master
//! secret and a fresh random salt. Rotation follows a dual-read model:
//! - Encrypt only with the current version
//! - Decrypt with the current version or any retained retired version
//! - Drop a retired version once no live entry references it

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::CryptoError;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// Per-version salt length in bytes
pub const SALT_LEN: usize = 16;

static PBKDF2_ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

// == Key Material ==
/// One version of derived encryption key.
///
/// Secret bytes are erased on drop via `ZeroizeOnDrop`. Clone is intentionally not
/// derived so key bytes are never duplicated in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    #[zeroize(skip)]
    version: u32,
    secret: [u8; KEY_LEN],
    #[zeroize(skip)]
    created_at: Instant,
    #[zeroize(skip)]
    encryptions: u64,
}

impl KeyMaterial {
    /// Monotonic version number of this key
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Time since this version was derived
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn secret(&self) -> &[u8; KEY_LEN] {
        &self.secret
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("version", &self.version)
            .field("encryptions", &self.encryptions)
            .field("age", &self.created_at.elapsed())
            .finish_non_exhaustive()
    }
}

/// Derive a 256-bit key from a secret and salt with PBKDF2-HMAC-SHA256.
///
/// The iteration count is the work factor; callers keep it fixed for the lifetime
/// of a cache instance.
pub fn derive_key(
    secret: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: NonZeroU32,
    version: u32,
) -> KeyMaterial {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(PBKDF2_ALGORITHM, iterations, salt, secret, &mut key);

    let material = KeyMaterial {
        version,
        secret: key,
        created_at: Instant::now(),
        encryptions: 0,
    };
    key.zeroize();
    material
}

// == Rotation Policy ==
/// When the active key must be replaced.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    /// Maximum age of the active key
    pub max_age: Duration,
    /// Maximum number of seal operations under one key
    pub max_encryptions: u64,
}

/// Outcome of a retired-key purge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    /// Versions whose key material was destroyed
    pub purged: Vec<u32>,
    /// Versions past their grace period that are still referenced
    pub deferred: Vec<u32>,
}

struct RetiredKey {
    material: KeyMaterial,
    retired_at: Instant,
}

// == Key Manager ==
/// Owns the master secret and every key version still needed for decryption.
pub struct KeyManager {
    master: Zeroizing<Vec<u8>>,
    iterations: NonZeroU32,
    policy: RotationPolicy,
    current: Option<KeyMaterial>,
    retired: BTreeMap<u32, RetiredKey>,
    rng: SystemRandom,
    rotations: u64,
}

impl KeyManager {
    /// Creates a key manager and derives key version 1.
    ///
    /// When `secret` is `None` a random 32-byte master secret is generated.
    pub fn new(
        secret: Option<&[u8]>,
        iterations: u32,
        policy: RotationPolicy,
    ) -> Result<Self, CryptoError> {
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| CryptoError::InvalidKey("iteration count must be non-zero".into()))?;
        let rng = SystemRandom::new();

        let master = match secret {
            Some(bytes) if bytes.len() < 16 => {
                return Err(CryptoError::InvalidKey(format!(
                    "master secret must be at least 16 bytes, got {}",
                    bytes.len()
                )));
            }
            Some(bytes) => Zeroizing::new(bytes.to_vec()),
            None => {
                let mut bytes = Zeroizing::new(vec![0u8; KEY_LEN]);
                rng.fill(&mut bytes).map_err(|_| CryptoError::RngFailure)?;
                bytes
            }
        };

        let mut manager = Self {
            master,
            iterations,
            policy,
            current: None,
            retired: BTreeMap::new(),
            rng,
            rotations: 0,
        };
        let initial = manager.derive_version(1)?;
        manager.current = Some(initial);
        Ok(manager)
    }

    fn derive_version(&self, version: u32) -> Result<KeyMaterial, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        self.rng
            .fill(&mut salt)
            .map_err(|_| CryptoError::RngFailure)?;
        Ok(derive_key(&self.master, &salt, self.iterations, version))
    }

    // == Current Key ==
    /// Returns the key used for all new encryptions.
    pub fn current_key(&self) -> Result<&KeyMaterial, CryptoError> {
        self.current.as_ref().ok_or(CryptoError::Released)
    }

    /// Counts one seal operation against the current key.
    pub fn record_encryption(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.encryptions = current.encryptions.saturating_add(1);
        }
    }

    // == Decryptable Key ==
    /// Returns the key for `version` if it is current or still retained.
    pub fn decryptable_key(&self, version: u32) -> Result<&KeyMaterial, CryptoError> {
        let current = self.current_key()?;
        if current.version == version {
            return Ok(current);
        }
        self.retired
            .get(&version)
            .map(|retired| &retired.material)
            .ok_or(CryptoError::KeyUnavailable(version))
    }

    // == Needs Rotation ==
    /// Returns true when the current key has exceeded its age or encryption budget.
    pub fn needs_rotation(&self) -> bool {
        match self.current.as_ref() {
            Some(current) => {
                current.age() >= self.policy.max_age
                    || current.encryptions >= self.policy.max_encryptions
            }
            None => false,
        }
    }

    // == Rotate ==
    /// Derives a new key version and retires the previous one.
    ///
    /// Returns the new version number.
    pub fn rotate(&mut self) -> Result<u32, CryptoError> {
        let previous_version = self.current_key()?.version;
        let next_version = previous_version
            .checked_add(1)
            .ok_or_else(|| CryptoError::InvalidKey("key version space exhausted".into()))?;

        let next = self.derive_version(next_version)?;
        if let Some(previous) = self.current.replace(next) {
            self.retired.insert(
                previous.version,
                RetiredKey {
                    material: previous,
                    retired_at: Instant::now(),
                },
            );
        }
        self.rotations += 1;

        info!(
            "Key rotated: version {} -> {} ({} retained)",
            previous_version,
            next_version,
            self.retired.len()
        );
        Ok(next_version)
    }

    // == Purge Retired ==
    /// Destroys retired versions that no live entry references.
    ///
    /// `live_refs` returns the number of live entries encrypted under a version.
    /// Versions still referenced after `grace` has elapsed are kept and reported as
    /// deferred rather than stranding their entries.
    pub fn purge_retired<F>(&mut self, live_refs: F, grace: Duration) -> PurgeReport
    where
        F: Fn(u32) -> usize,
    {
        let mut report = PurgeReport::default();

        self.retired.retain(|version, retired| {
            let refs = live_refs(*version);
            if refs == 0 {
                report.purged.push(*version);
                return false;
            }
            if retired.retired_at.elapsed() >= grace {
                report.deferred.push(*version);
            }
            true
        });

        if !report.purged.is_empty() {
            debug!("Purged retired key versions {:?}", report.purged);
        }
        if !report.deferred.is_empty() {
            warn!(
                "Deferred purge of key versions {:?}: still referenced after grace period",
                report.deferred
            );
        }
        report
    }

    /// Number of retired versions still held for decryption
    pub fn retained_versions(&self) -> usize {
        self.retired.len()
    }

    /// Version of the current key, or None after release
    pub fn active_version(&self) -> Option<u32> {
        self.current.as_ref().map(|k| k.version)
    }

    /// Number of rotations performed
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    // == Release ==
    /// Destroys all key material. Subsequent key lookups fail with `Released`.
    pub fn release(&mut self) {
        self.current = None;
        self.retired.clear();
        self.master.zeroize();
    }

    /// Returns true once `release` has been called
    pub fn is_released(&self) -> bool {
        self.current.is_none()
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("active_version", &self.active_version())
            .field("retired", &self.retired.keys().collect::<Vec<_>>())
            .field("rotations", &self.rotations)
            .finish_non_exhaustive()
    }
}
