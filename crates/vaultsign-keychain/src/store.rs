//! On-disk key store.
//!
//! Layout under the base directory:
//!
//! ```text
//! master.json                  Argon2id params + salt + next_det_index
//! seed.bin                     flag || nonce || GCM(seed32)
//! keys/<alias>/meta.json       identity + per-ciphertext nonces
//! keys/<alias>/encrypted.bin   wrapped DEK || encrypted scalar
//! keys/<alias>/level.bin       nonce || GCM(key state)
//! keys/<alias>/level.bin.tmp   possibly residual after a crash
//! ```
//!
//! Every write goes to a `.tmp` sibling, is synced, then renamed into
//! place. Readers of `level.bin` also consult the `.tmp` backup and merge
//! per-kind entries by larger level, so a crash between the two watermark
//! writes can never forget a signed (level, round).

use crate::error::KeychainError;
use crate::watermark::KeyState;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use vaultsign_crypto::{secret_bytes, SecretBytes};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use zeroize::Zeroizing;

const STORE_FORMAT_VERSION: u32 = 1;
const MASTER_FILE: &str = "master.json";
const SEED_FILE: &str = "seed.bin";
const KEYS_DIR: &str = "keys";
const META_FILE: &str = "meta.json";
const BUNDLE_FILE: &str = "encrypted.bin";
const STATE_FILE: &str = "level.bin";
const TMP_SUFFIX: &str = ".tmp";

const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const SEED_LEN: usize = 32;
const DEK_LEN: usize = 32;

/// Argon2id parameters stored alongside the salt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArgonParams {
    /// Iteration count.
    pub time: u32,
    /// Memory in KiB.
    pub memory: u32,
    /// Lane count.
    pub threads: u32,
    /// Derived key length in bytes.
    pub key_len: u32,
}

impl Default for ArgonParams {
    fn default() -> Self {
        Self {
            time: 3,
            memory: 64 * 1024,
            threads: 4,
            key_len: 32,
        }
    }
}

/// `master.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterFile {
    pub version: u32,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    pub params: ArgonParams,
    /// Unix seconds.
    pub created: u64,
    /// Next index handed out for deterministic derivation.
    pub next_det_index: u64,
}

/// `meta.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMeta {
    pub version: u32,
    pub alias: String,
    pub tz4: String,
    pub bl_pubkey: String,
    pub pop: String,
    /// Unix seconds.
    pub created: u64,
    /// Nonce for the KEK-wrapped DEK.
    #[serde(with = "hex")]
    pub wrap_nonce: Vec<u8>,
    /// Nonce for the DEK-encrypted scalar.
    #[serde(with = "hex")]
    pub data_nonce: Vec<u8>,
}

/// Decrypted material handed to the keyring on unlock.
#[derive(Debug)]
pub struct UnlockedMaterial {
    pub dek: SecretBytes,
    pub enc_secret: Vec<u8>,
    pub data_nonce: [u8; NONCE_LEN],
    pub bl_pubkey: String,
    pub tz4: String,
}

/// File-backed key store rooted at a base directory.
pub struct FileStore {
    base: PathBuf,
    /// Serializes read-modify-write of master.json.
    master_mu: Mutex<()>,
}

impl FileStore {
    /// Open (creating directories as needed) a store at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, KeychainError> {
        let base = base.into();
        fs::create_dir_all(base.join(KEYS_DIR))?;
        set_dir_permissions(&base)?;
        Ok(Self {
            base,
            master_mu: Mutex::new(()),
        })
    }

    fn master_path(&self) -> PathBuf {
        self.base.join(MASTER_FILE)
    }

    fn seed_path(&self) -> PathBuf {
        self.base.join(SEED_FILE)
    }

    fn keys_root(&self) -> PathBuf {
        self.base.join(KEYS_DIR)
    }

    fn key_dir(&self, alias: &str) -> PathBuf {
        self.keys_root().join(alias)
    }

    fn meta_path(&self, alias: &str) -> PathBuf {
        self.key_dir(alias).join(META_FILE)
    }

    fn bundle_path(&self, alias: &str) -> PathBuf {
        self.key_dir(alias).join(BUNDLE_FILE)
    }

    fn state_path(&self, alias: &str) -> PathBuf {
        self.key_dir(alias).join(STATE_FILE)
    }

    // ----- master & seed -----

    /// Create `master.json` with the standard Argon2id parameters and a
    /// fresh salt. Re-initialization fails.
    pub fn init_master(&self) -> Result<(), KeychainError> {
        self.init_master_with(ArgonParams::default())
    }

    /// [`FileStore::init_master`] with explicit KDF parameters, for
    /// provisioning tools and tests.
    pub fn init_master_with(&self, params: ArgonParams) -> Result<(), KeychainError> {
        let _guard = self.master_mu.lock().expect("master lock poisoned");
        if self.master_path().exists() {
            return Err(KeychainError::MasterAlreadyInitialized);
        }
        let master = MasterFile {
            version: STORE_FORMAT_VERSION,
            salt: rand_bytes(16),
            params,
            created: unix_now(),
            next_det_index: 1,
        };
        write_json_atomic(&self.master_path(), &master)
    }

    /// Read `master.json`.
    pub fn read_master(&self) -> Result<MasterFile, KeychainError> {
        read_master_at(&self.master_path())
    }

    /// Reserve the next deterministic derivation index, persisting the
    /// incremented counter before returning.
    pub fn next_deterministic_index(&self) -> Result<u32, KeychainError> {
        let _guard = self.master_mu.lock().expect("master lock poisoned");
        let mut master = read_master_at(&self.master_path())?;
        if master.next_det_index == 0 {
            master.next_det_index = self.list()?.len() as u64 + 1;
        }
        let index = master.next_det_index;
        master.next_det_index += 1;
        write_json_atomic(&self.master_path(), &master)?;
        Ok(index as u32)
    }

    /// Report (master present, deterministic flag) without a password.
    pub fn init_info(&self) -> Result<(bool, bool), KeychainError> {
        let master_present = self.master_path().exists();
        let deterministic = match fs::read(self.seed_path()) {
            Ok(bytes) => bytes.first().is_some_and(|b| *b == 0x01),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        Ok((master_present, deterministic))
    }

    /// Derive the KEK from the master password using the stored Argon2id
    /// parameters. CPU-heavy; call from a blocking context.
    pub fn derive_kek(&self, password: &[u8]) -> Result<SecretBytes, KeychainError> {
        let master = self.read_master()?;
        derive_kek_with(&master, password)
    }

    /// Write `seed.bin`: a fresh random seed encrypted under the KEK, with
    /// the deterministic-mode flag in front. The AAD binds the record to
    /// `master.json` so the two files cannot be swapped independently.
    pub fn write_seed(&self, password: &[u8], deterministic: bool) -> Result<(), KeychainError> {
        let master = self.read_master()?;
        let kek = derive_kek_with(&master, password)?;

        let seed = secret_bytes(rand_bytes(SEED_LEN));

        let nonce = rand_bytes(NONCE_LEN);
        let aad = seed_aad(&master);
        let ciphertext = seal(kek.expose_secret(), &nonce, seed.expose_secret(), &aad)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(u8::from(deterministic));
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        write_bytes_atomic(&self.seed_path(), &out)
    }

    /// Read `seed.bin`, returning (deterministic flag, seed). Decryption
    /// failure means a wrong password (or a corrupted record; the two are
    /// indistinguishable by design).
    pub fn read_seed(
        &self,
        password: &[u8],
    ) -> Result<(bool, Zeroizing<[u8; 32]>), KeychainError> {
        let bytes = match fs::read(self.seed_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeychainError::MasterMissing)
            }
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < 1 + NONCE_LEN + GCM_TAG_LEN {
            return Err(KeychainError::BadPassword);
        }
        let deterministic = bytes[0] == 0x01;
        let nonce = &bytes[1..1 + NONCE_LEN];
        let ciphertext = &bytes[1 + NONCE_LEN..];

        let master = self.read_master()?;
        let kek = derive_kek_with(&master, password)?;
        let aad = seed_aad(&master);
        let seed = open(kek.expose_secret(), nonce, ciphertext, &aad)
            .map_err(|_| KeychainError::BadPassword)?;
        if seed.expose_secret().len() != SEED_LEN {
            return Err(KeychainError::BadPassword);
        }
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(seed.expose_secret());
        Ok((deterministic, out))
    }

    // ----- keys -----

    /// List key aliases (directories with a complete meta/bundle pair).
    pub fn list(&self) -> Result<Vec<String>, KeychainError> {
        let mut aliases = Vec::new();
        for entry in fs::read_dir(self.keys_root())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(alias) = entry.file_name().to_str() {
                if self.has_key(alias) {
                    aliases.push(alias.to_string());
                }
            }
        }
        aliases.sort();
        Ok(aliases)
    }

    /// A key exists when both its meta and bundle files are present.
    pub fn has_key(&self, alias: &str) -> bool {
        self.meta_path(alias).exists() && self.bundle_path(alias).exists()
    }

    /// Persist a new key: wrap a fresh DEK under the KEK, encrypt the
    /// little-endian scalar under the DEK, and write meta + bundle
    /// atomically. Runs Argon2id exactly once.
    pub fn create_key(
        &self,
        alias: &str,
        password: &[u8],
        scalar_le: &[u8; 32],
        bl_pubkey: &str,
        tz4: &str,
        pop: &str,
    ) -> Result<(), KeychainError> {
        if alias.is_empty() {
            return Err(KeychainError::InvalidAlias);
        }
        if self.has_key(alias) {
            return Err(KeychainError::KeyExists);
        }

        let kek = self.derive_kek(password)?;
        let dek = secret_bytes(rand_bytes(DEK_LEN));

        let wrap_nonce = rand_bytes(NONCE_LEN);
        let wrapped_dek = seal(
            kek.expose_secret(),
            &wrap_nonce,
            dek.expose_secret(),
            &wrap_aad(alias, tz4),
        )?;

        let data_nonce = rand_bytes(NONCE_LEN);
        let enc_secret = seal(
            dek.expose_secret(),
            &data_nonce,
            scalar_le,
            &data_aad(bl_pubkey, tz4),
        )?;

        let meta = KeyMeta {
            version: STORE_FORMAT_VERSION,
            alias: alias.to_string(),
            tz4: tz4.to_string(),
            bl_pubkey: bl_pubkey.to_string(),
            pop: pop.to_string(),
            created: unix_now(),
            wrap_nonce,
            data_nonce,
        };
        let bundle = encode_bundle(&wrapped_dek, &enc_secret);

        fs::create_dir_all(self.key_dir(alias))?;
        set_dir_permissions(&self.key_dir(alias))?;
        write_json_atomic(&self.meta_path(alias), &meta)?;
        write_bytes_atomic(&self.bundle_path(alias), &bundle)
    }

    /// Remove a key directory entirely.
    pub fn remove_key(&self, alias: &str) -> Result<(), KeychainError> {
        if alias.is_empty() {
            return Err(KeychainError::InvalidAlias);
        }
        fs::remove_dir_all(self.key_dir(alias))?;
        Ok(())
    }

    /// Read `meta.json` for a key.
    pub fn read_key_meta(&self, alias: &str) -> Result<KeyMeta, KeychainError> {
        let file = File::open(self.meta_path(alias))?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Unwrap a key's DEK with the master password and return the material
    /// the keyring holds while the key is unlocked. A missing key and a
    /// wrong password are deliberately the same error.
    pub fn unlock(
        &self,
        alias: &str,
        password: &[u8],
    ) -> Result<UnlockedMaterial, KeychainError> {
        if !self.has_key(alias) {
            return Err(KeychainError::BadPassword);
        }
        let meta = self.read_key_meta(alias)?;
        let bundle = fs::read(self.bundle_path(alias))?;
        let (wrapped_dek, enc_secret) = decode_bundle(&bundle)?;

        let kek = self.derive_kek(password)?;
        let dek = open(
            kek.expose_secret(),
            &meta.wrap_nonce,
            &wrapped_dek,
            &wrap_aad(alias, &meta.tz4),
        )
        .map_err(|_| KeychainError::BadPassword)?;
        if dek.expose_secret().len() != DEK_LEN {
            return Err(KeychainError::BadPassword);
        }

        let data_nonce: [u8; NONCE_LEN] = meta
            .data_nonce
            .as_slice()
            .try_into()
            .map_err(|_| KeychainError::SecretCorrupted)?;

        Ok(UnlockedMaterial {
            dek,
            enc_secret,
            data_nonce,
            bl_pubkey: meta.bl_pubkey,
            tz4: meta.tz4,
        })
    }

    // ----- watermark state -----

    /// Read `level.bin` (and any residual `.tmp` backup) under the DEK.
    ///
    /// Returns `(state, missing, corrupted)`: `missing` is true when
    /// neither file exists (state starts zeroed); `corrupted` is true when
    /// at least one file failed authentication. When both files fail,
    /// the error is [`KeychainError::KeyStateCorrupted`] and signing must
    /// refuse.
    pub fn read_key_state(
        &self,
        alias: &str,
        dek: &[u8],
        tz4: &str,
    ) -> Result<(KeyState, bool, bool), KeychainError> {
        if dek.len() != DEK_LEN {
            return Err(KeychainError::SecretCorrupted);
        }
        let path = self.state_path(alias);
        let backup_path = tmp_path(&path);

        let main = read_state_file(&path, dek, alias, tz4);
        let backup = read_state_file(&backup_path, dek, alias, tz4);

        let corrupted = matches!(main, Err(KeychainError::KeyStateCorrupted))
            || matches!(backup, Err(KeychainError::KeyStateCorrupted));

        match (main, backup) {
            (Ok(main_state), Ok(backup_state)) => {
                let missing = main_state.is_none() && backup_state.is_none();
                let mut state = main_state.unwrap_or_default();
                if let Some(backup_state) = backup_state {
                    state.merge_max_level(&backup_state);
                }
                Ok((state, missing, corrupted))
            }
            (Ok(main_state), Err(_)) => Ok((main_state.unwrap_or_default(), false, corrupted)),
            (Err(_), Ok(backup_state)) => Ok((backup_state.unwrap_or_default(), false, corrupted)),
            (Err(err), Err(_)) => Err(err),
        }
    }

    /// Encrypt and persist the watermark state atomically.
    pub fn write_key_state(
        &self,
        alias: &str,
        dek: &[u8],
        tz4: &str,
        state: &KeyState,
    ) -> Result<(), KeychainError> {
        if dek.len() != DEK_LEN {
            return Err(KeychainError::SecretCorrupted);
        }
        let plain = bincode::serialize(state)?;
        let nonce = rand_bytes(NONCE_LEN);
        let ciphertext = seal(dek, &nonce, &plain, &state_aad(alias, tz4))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        write_bytes_atomic(&self.state_path(alias), &out)
    }
}

// ----- AADs bind every ciphertext to the key identity -----

fn wrap_aad(alias: &str, tz4: &str) -> Vec<u8> {
    format!("id={}|tz4={}", alias, tz4).into_bytes()
}

pub(crate) fn data_aad(bl_pubkey: &str, tz4: &str) -> Vec<u8> {
    format!("bl={}|tz4={}", bl_pubkey, tz4).into_bytes()
}

fn state_aad(alias: &str, tz4: &str) -> Vec<u8> {
    format!("state|id={}|tz4={}", alias, tz4).into_bytes()
}

fn seed_aad(master: &MasterFile) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + master.salt.len());
    aad.push(master.version as u8);
    aad.extend_from_slice(&master.salt);
    aad
}

// ----- helpers -----

fn read_master_at(path: &Path) -> Result<MasterFile, KeychainError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(KeychainError::MasterMissing)
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_reader(file)?)
}

fn derive_kek_with(master: &MasterFile, password: &[u8]) -> Result<SecretBytes, KeychainError> {
    let params = argon2::Params::new(
        master.params.memory,
        master.params.time,
        master.params.threads,
        Some(master.params.key_len as usize),
    )
    .map_err(|err| KeychainError::Kdf(err.to_string()))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    // A failed derivation never writes into the buffer, so the error path
    // leaks nothing.
    let mut kek = vec![0u8; master.params.key_len as usize];
    argon
        .hash_password_into(password, &master.salt, &mut kek)
        .map_err(|err| KeychainError::Kdf(err.to_string()))?;
    Ok(secret_bytes(kek))
}

fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeychainError> {
    if key.len() != DEK_LEN || nonce.len() != NONCE_LEN {
        return Err(KeychainError::Cipher);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| KeychainError::Cipher)
}

/// AEAD-open a ciphertext. The plaintext comes back wrapped so decrypted
/// key material never transits as a bare buffer.
pub(crate) fn open(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<SecretBytes, aes_gcm::Error> {
    if key.len() != DEK_LEN || nonce.len() != NONCE_LEN {
        return Err(aes_gcm::Error);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plain = cipher.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad,
        },
    )?;
    Ok(secret_bytes(plain))
}

/// Read one state file. `Ok(None)` means the file does not exist.
fn read_state_file(
    path: &Path,
    dek: &[u8],
    alias: &str,
    tz4: &str,
) -> Result<Option<KeyState>, KeychainError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if bytes.len() < NONCE_LEN + GCM_TAG_LEN {
        return Err(KeychainError::KeyStateCorrupted);
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let plain = open(dek, nonce, ciphertext, &state_aad(alias, tz4))
        .map_err(|_| KeychainError::KeyStateCorrupted)?;
    let state: KeyState = bincode::deserialize(plain.expose_secret())
        .map_err(|_| KeychainError::KeyStateCorrupted)?;
    Ok(Some(state))
}

/// Bundle layout: [u16 len][wrapped DEK][u16 len][encrypted scalar].
fn encode_bundle(wrapped_dek: &[u8], enc_secret: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + wrapped_dek.len() + enc_secret.len());
    out.extend_from_slice(&(wrapped_dek.len() as u16).to_be_bytes());
    out.extend_from_slice(wrapped_dek);
    out.extend_from_slice(&(enc_secret.len() as u16).to_be_bytes());
    out.extend_from_slice(enc_secret);
    out
}

fn decode_bundle(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeychainError> {
    let take = |bytes: &[u8], at: usize| -> Result<(Vec<u8>, usize), KeychainError> {
        if bytes.len() < at + 2 {
            return Err(KeychainError::SecretCorrupted);
        }
        let len = u16::from_be_bytes([bytes[at], bytes[at + 1]]) as usize;
        let start = at + 2;
        if bytes.len() < start + len {
            return Err(KeychainError::SecretCorrupted);
        }
        Ok((bytes[start..start + len].to_vec(), start + len))
    };
    let (wrapped_dek, next) = take(bytes, 0)?;
    let (enc_secret, _) = take(bytes, next)?;
    Ok((wrapped_dek, enc_secret))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), KeychainError> {
    let bytes = serde_json::to_vec(value)?;
    write_bytes_atomic(path, &bytes)
}

/// Write to `<path>.tmp` with fsync, then rename into place.
fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), KeychainError> {
    let tmp = tmp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        set_file_permissions(&file)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "persisted");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

fn rand_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), KeychainError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), KeychainError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(file: &File) -> Result<(), KeychainError> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_file: &File) -> Result<(), KeychainError> {
    Ok(())
}
