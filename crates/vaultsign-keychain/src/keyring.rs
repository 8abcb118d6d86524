//! In-memory key registry over the file store.
//!
//! Each key has a runtime record guarded by its own async mutex; the lock
//! is held across the whole verify-sign-persist sequence so no two
//! concurrent signs on the same key can ever claim the same
//! (level, round). Secret material lives in the record only while the key
//! is unlocked and is wiped on lock, delete, and shutdown.

use crate::error::KeychainError;
use crate::payload::validate_sign_payload;
use crate::store::{FileStore, UnlockedMaterial};
use crate::watermark::{KeyState, SignKind, Watermark};
use dashmap::DashMap;
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use vaultsign_crypto::{
    blpk_from_pubkey_bytes, blsig_from_signature_bytes, clone_secret, derive_child_key,
    tz4_from_pubkey_bytes, wipe, BlsSecretKey, SecretBytes,
};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// Identity of a freshly created key.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub alias: String,
    pub bl_pubkey: String,
    pub tz4: String,
}

/// Status of one key as reported to the host.
#[derive(Debug, Clone)]
pub struct KeyStatusEntry {
    pub alias: String,
    pub tz4: String,
    pub bl_pubkey: String,
    pub pop: String,
    pub locked: bool,
    pub state_corrupted: bool,
    pub watermarks: KeyState,
}

/// Runtime record for one key. Secret fields are populated only while the
/// key is unlocked.
#[derive(Default)]
struct KeyRuntime {
    dek: Option<SecretBytes>,
    enc_secret: Vec<u8>,
    data_nonce: [u8; NONCE_LEN],
    bl_pubkey: String,
    tz4: String,
    watermarks: KeyState,
    state_corrupted: bool,
}

impl KeyRuntime {
    fn is_unlocked(&self) -> bool {
        self.dek.is_some() && !self.enc_secret.is_empty()
    }

    /// Wipe secret material; identity and flags survive.
    fn wipe_material(&mut self) {
        self.dek = None; // the secret box wipes its buffer on drop
        wipe(&mut self.enc_secret);
        self.enc_secret.clear();
        self.data_nonce = [0u8; NONCE_LEN];
        self.watermarks = KeyState::default();
    }
}

struct KeyEntry {
    runtime: Mutex<KeyRuntime>,
}

/// The keychain registry.
pub struct KeyRing {
    keys: DashMap<String, Arc<KeyEntry>>,
    next_auto_id: AtomicU64,
    store: Arc<FileStore>,
}

impl KeyRing {
    /// Create a registry over `store`.
    pub fn new(store: Arc<FileStore>) -> Self {
        Self {
            keys: DashMap::new(),
            next_auto_id: AtomicU64::new(0),
            store,
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Create a key. An empty `wanted` alias auto-assigns `key<N>`,
    /// retrying on collision; an explicit colliding alias fails with
    /// [`KeychainError::KeyExists`].
    ///
    /// In deterministic mode the scalar is derived from the device seed,
    /// the store salt, and a freshly reserved index; otherwise it is
    /// random. The new key is left locked.
    pub async fn create_key(
        &self,
        wanted: &str,
        master_password: &[u8],
    ) -> Result<NewKey, KeychainError> {
        let alias = normalize_alias(wanted);
        if !alias.is_empty() && !is_valid_alias(&alias) {
            return Err(KeychainError::InvalidAlias);
        }

        let password = Zeroizing::new(master_password.to_vec());
        let store = self.store.clone();
        let (deterministic, seed) = {
            let password = password.clone();
            run_blocking(move || store.read_seed(&password)).await?
        };

        let salt = if deterministic {
            Some(self.store.read_master()?.salt)
        } else {
            None
        };

        let mut reserved_index: Option<u32> = None;
        loop {
            let candidate = if alias.is_empty() {
                let n = self.next_auto_id.fetch_add(1, Ordering::SeqCst) + 1;
                format!("key{}", n)
            } else {
                alias.clone()
            };

            if self.store.has_key(&candidate) {
                if !alias.is_empty() {
                    return Err(KeychainError::KeyExists);
                }
                continue;
            }

            let (secret_key, index) = match &salt {
                Some(salt) => {
                    let index = match reserved_index {
                        Some(index) => index,
                        None => {
                            let store = self.store.clone();
                            let index =
                                run_blocking(move || store.next_deterministic_index()).await?;
                            reserved_index = Some(index);
                            index
                        }
                    };
                    (derive_child_key(&seed, salt, index)?, index)
                }
                None => (BlsSecretKey::generate(&mut rand::thread_rng()), 0),
            };

            let pubkey_bytes = secret_key.public_key().to_bytes();
            let bl_pubkey = blpk_from_pubkey_bytes(&pubkey_bytes);
            let tz4 = tz4_from_pubkey_bytes(&pubkey_bytes);
            let pop = blsig_from_signature_bytes(&secret_key.sign_pop().to_bytes());

            let result = {
                let store = self.store.clone();
                let password = password.clone();
                let scalar_le = secret_key.to_le_bytes();
                let candidate = candidate.clone();
                let bl_pubkey = bl_pubkey.clone();
                let tz4 = tz4.clone();
                run_blocking(move || {
                    store.create_key(&candidate, &password, &scalar_le, &bl_pubkey, &tz4, &pop)
                })
                .await
            };

            match result {
                Ok(()) => {
                    let entry = Arc::new(KeyEntry {
                        runtime: Mutex::new(KeyRuntime {
                            bl_pubkey: bl_pubkey.clone(),
                            tz4: tz4.clone(),
                            watermarks: KeyState::zeroed(),
                            ..KeyRuntime::default()
                        }),
                    });
                    self.keys.insert(candidate.clone(), entry);
                    info!(
                        alias = %candidate,
                        tz4 = %tz4,
                        deterministic,
                        index,
                        "key created"
                    );
                    return Ok(NewKey {
                        alias: candidate,
                        bl_pubkey,
                        tz4,
                    });
                }
                Err(KeychainError::KeyExists) if alias.is_empty() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Unlock a key: unwrap its DEK with the master password and load the
    /// persisted watermark state.
    pub async fn unlock(&self, wanted: &str, master_password: &[u8]) -> Result<(), KeychainError> {
        let alias = normalize_alias(wanted);

        let material = {
            let store = self.store.clone();
            let password = Zeroizing::new(master_password.to_vec());
            let alias = alias.clone();
            run_blocking(move || store.unlock(&alias, &password)).await?
        };

        let entry = self
            .keys
            .entry(alias.clone())
            .or_insert_with(|| {
                Arc::new(KeyEntry {
                    runtime: Mutex::new(KeyRuntime::default()),
                })
            })
            .clone();
        let mut runtime = entry.runtime.lock().await;

        let UnlockedMaterial {
            dek,
            enc_secret,
            data_nonce,
            bl_pubkey,
            tz4,
        } = material;

        let state = {
            let store = self.store.clone();
            let alias = alias.clone();
            let dek = clone_secret(&dek);
            let tz4 = tz4.clone();
            run_blocking(move || store.read_key_state(&alias, dek.expose_secret(), &tz4)).await
        };
        let (state, missing, corrupted) = match state {
            Ok(parts) => parts,
            Err(err) => {
                if matches!(err, KeychainError::KeyStateCorrupted) {
                    runtime.state_corrupted = true;
                }
                return Err(err);
            }
        };
        runtime.state_corrupted = corrupted;

        runtime.dek = Some(dek);
        runtime.enc_secret = enc_secret;
        runtime.data_nonce = data_nonce;
        runtime.bl_pubkey = bl_pubkey;
        runtime.tz4 = tz4;
        runtime.watermarks = if missing {
            KeyState::zeroed()
        } else {
            hydrate_state(&state)
        };

        info!(alias = %alias, "key unlocked");
        Ok(())
    }

    /// Lock a key: wipe its DEK and scalar ciphertext from memory. No disk
    /// writes.
    pub async fn lock(&self, wanted: &str) -> Result<(), KeychainError> {
        let alias = normalize_alias(wanted);
        let entry = self.get(&alias).ok_or(KeychainError::KeyNotFound)?;
        let mut runtime = entry.runtime.lock().await;
        runtime.wipe_material();
        info!(alias = %alias, "key locked");
        Ok(())
    }

    /// Delete a key: wipe any in-memory material and remove its directory.
    pub async fn delete_key(&self, wanted: &str) -> Result<(), KeychainError> {
        let alias = normalize_alias(wanted);
        if alias.is_empty() {
            return Err(KeychainError::InvalidAlias);
        }
        if !self.store.has_key(&alias) {
            return Err(KeychainError::KeyNotFound);
        }

        if let Some((_, entry)) = self.keys.remove(&alias) {
            let mut runtime = entry.runtime.lock().await;
            runtime.wipe_material();
        }

        let store = self.store.clone();
        let alias_owned = alias.clone();
        run_blocking(move || store.remove_key(&alias_owned)).await?;
        info!(alias = %alias, "key deleted");
        Ok(())
    }

    /// Verify the master password by decrypting the seed record.
    pub async fn verify_master(&self, master_password: &[u8]) -> Result<(), KeychainError> {
        let store = self.store.clone();
        let password = Zeroizing::new(master_password.to_vec());
        run_blocking(move || store.read_seed(&password).map(|_| ())).await
    }

    /// Report the status of every persisted key. Identity always comes
    /// from disk; watermark state is shown only for unlocked keys and is
    /// re-read so corruption shows up without a sign attempt.
    pub async fn status(&self) -> Result<Vec<KeyStatusEntry>, KeychainError> {
        let aliases = self.store.list()?;
        let mut out = Vec::with_capacity(aliases.len());

        for alias in aliases {
            let meta = match self.store.read_key_meta(&alias) {
                Ok(meta) => meta,
                Err(err) => {
                    error!(alias = %alias, %err, "status: reading key meta");
                    continue;
                }
            };

            let mut status = KeyStatusEntry {
                alias: alias.clone(),
                tz4: meta.tz4,
                bl_pubkey: meta.bl_pubkey,
                pop: meta.pop,
                locked: true,
                state_corrupted: false,
                watermarks: KeyState::default(),
            };

            if let Some(entry) = self.get(&alias) {
                let mut runtime = entry.runtime.lock().await;
                let dek = runtime
                    .dek
                    .as_ref()
                    .filter(|_| runtime.is_unlocked())
                    .map(clone_secret);
                if let Some(dek) = dek {
                    let fresh = {
                        let store = self.store.clone();
                        let alias = alias.clone();
                        let tz4 = runtime.tz4.clone();
                        run_blocking(move || {
                            store.read_key_state(&alias, dek.expose_secret(), &tz4)
                        })
                        .await
                    };
                    match fresh {
                        Ok((state, missing, corrupted)) => {
                            runtime.state_corrupted = corrupted;
                            runtime.watermarks = if missing || corrupted {
                                KeyState::zeroed()
                            } else {
                                hydrate_state(&state)
                            };
                        }
                        Err(KeychainError::KeyStateCorrupted) => {
                            runtime.state_corrupted = true;
                        }
                        Err(err) => {
                            error!(alias = %alias, %err, "status: reading key state");
                        }
                    }

                    if runtime.state_corrupted {
                        status.state_corrupted = true;
                    } else {
                        status.locked = false;
                        status.watermarks = runtime.watermarks.clone();
                    }
                }
            }
            out.push(status);
        }
        Ok(out)
    }

    /// Find the alias owning a tz4 address, scanning on-disk metadata so
    /// locked keys resolve too.
    pub fn resolve_by_tz4(&self, tz4: &str) -> Result<String, KeychainError> {
        if tz4.trim().is_empty() {
            return Err(KeychainError::KeyNotFound);
        }
        for alias in self.store.list()? {
            match self.store.read_key_meta(&alias) {
                Ok(meta) if meta.tz4 == tz4 => return Ok(alias),
                Ok(_) => {}
                Err(err) => error!(alias = %alias, %err, "resolve tz4: reading key meta"),
            }
        }
        Err(KeychainError::KeyNotFound)
    }

    /// Sign a payload with the key owning `tz4`, enforcing the monotonic
    /// watermark rule and persisting the advanced watermark before the
    /// signature is released.
    pub async fn sign(&self, tz4: &str, raw: &[u8]) -> Result<Vec<u8>, KeychainError> {
        let validated = validate_sign_payload(raw)?;

        let (alias, entry) = self.get_by_tz4(tz4).ok_or(KeychainError::KeyNotFound)?;
        let mut runtime = entry.runtime.lock().await;

        if !runtime.is_unlocked() {
            return Err(KeychainError::KeyLocked);
        }

        let next = Watermark::new(validated.level, validated.round);
        let prev = runtime.watermarks.watermark(validated.kind);
        if !next.supersedes(&prev) {
            return Err(KeychainError::StaleWatermark);
        }

        // Decrypt the scalar in memory; failure here means the at-rest
        // secret no longer authenticates and the key is unusable.
        let dek = clone_secret(runtime.dek.as_ref().ok_or(KeychainError::KeyLocked)?);
        let scalar = crate::store::open(
            dek.expose_secret(),
            &runtime.data_nonce,
            &runtime.enc_secret,
            &crate::store::data_aad(&runtime.bl_pubkey, &runtime.tz4),
        )
        .map_err(|_| KeychainError::SecretCorrupted)?;
        let scalar_le: Zeroizing<[u8; 32]> = Zeroizing::new(
            scalar
                .expose_secret()
                .as_slice()
                .try_into()
                .map_err(|_| KeychainError::SecretCorrupted)?,
        );
        let secret_key = BlsSecretKey::from_le_bytes(&scalar_le)
            .map_err(|_| KeychainError::SecretCorrupted)?;

        // Advance the watermark in memory and start persistence now; BLS
        // signing runs while the state hits the disk, but the signature is
        // only released once persistence succeeded.
        runtime.watermarks.set(validated.kind, next);
        let persist = {
            let store = self.store.clone();
            let alias = alias.clone();
            let tz4 = runtime.tz4.clone();
            let state = runtime.watermarks.clone();
            tokio::task::spawn_blocking(move || {
                store.write_key_state(&alias, dek.expose_secret(), &tz4, &state)
            })
        };

        let signature = secret_key.sign(raw);

        match persist.await {
            Ok(Ok(())) => {
                runtime.state_corrupted = false;
            }
            Ok(Err(err)) => return Err(KeychainError::PersistFailed(err.to_string())),
            Err(err) => return Err(KeychainError::PersistFailed(err.to_string())),
        }

        Ok(signature.to_bytes().to_vec())
    }

    /// Administrative watermark override: every per-kind watermark becomes
    /// `(level, 0)`, persisted before returning. `level` must strictly
    /// exceed every current per-kind level.
    pub async fn set_level(&self, wanted: &str, level: u64) -> Result<(), KeychainError> {
        let alias = normalize_alias(wanted);
        let entry = match self.get(&alias) {
            Some(entry) => entry,
            None => {
                if self.store.has_key(&alias) {
                    return Err(KeychainError::KeyLocked);
                }
                return Err(KeychainError::KeyNotFound);
            }
        };
        let mut runtime = entry.runtime.lock().await;
        if !runtime.is_unlocked() {
            return Err(KeychainError::KeyLocked);
        }

        for kind in SignKind::ALL {
            let current = runtime.watermarks.watermark(kind).level;
            if level <= current {
                return Err(KeychainError::LevelNotAbove {
                    kind: kind.name(),
                    current,
                });
            }
        }

        for kind in SignKind::ALL {
            runtime.watermarks.set(kind, Watermark::new(level, 0));
        }

        let dek = clone_secret(runtime.dek.as_ref().ok_or(KeychainError::KeyLocked)?);
        let result = {
            let store = self.store.clone();
            let alias = alias.clone();
            let tz4 = runtime.tz4.clone();
            let state = runtime.watermarks.clone();
            run_blocking(move || store.write_key_state(&alias, dek.expose_secret(), &tz4, &state))
                .await
        };
        result?;
        runtime.state_corrupted = false;
        info!(alias = %alias, level, "watermarks overridden");
        Ok(())
    }

    /// Wipe every unlocked key's material; used at shutdown.
    pub async fn lock_all(&self) {
        let entries: Vec<Arc<KeyEntry>> =
            self.keys.iter().map(|entry| entry.value().clone()).collect();
        for entry in entries {
            let mut runtime = entry.runtime.lock().await;
            runtime.wipe_material();
        }
    }

    fn get(&self, alias: &str) -> Option<Arc<KeyEntry>> {
        self.keys.get(alias).map(|entry| entry.value().clone())
    }

    fn get_by_tz4(&self, tz4: &str) -> Option<(String, Arc<KeyEntry>)> {
        for entry in self.keys.iter() {
            let candidate = entry.value().clone();
            // Identity fields are immutable after creation/unlock, but the
            // record lock may be held; try_lock avoids stalling scans and
            // falls back to the stored metadata.
            let matches = match candidate.runtime.try_lock() {
                Ok(runtime) => runtime.tz4 == tz4,
                Err(_) => self
                    .store
                    .read_key_meta(entry.key())
                    .map(|meta| meta.tz4 == tz4)
                    .unwrap_or(false),
            };
            if matches {
                return Some((entry.key().clone(), candidate));
            }
        }
        None
    }
}

/// Expand a persisted state over the zeroed baseline so every kind has an
/// entry.
fn hydrate_state(state: &KeyState) -> KeyState {
    let mut full = KeyState::zeroed();
    for (tag, wm) in &state.by_kind {
        full.by_kind.insert(*tag, *wm);
    }
    full
}

async fn run_blocking<T, F>(f: F) -> Result<T, KeychainError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, KeychainError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| KeychainError::PersistFailed(err.to_string()))?
}

fn normalize_alias(alias: &str) -> String {
    alias.trim().to_lowercase()
}

fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= 64
        && alias
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}
