//! Signer request dispatcher.
//!
//! Runs behind the broker's handler callback on the gadget. Each request
//! payload is decoded into a tagged [`Request`], routed to the keychain or
//! store, and answered with the matching [`Response`] variant; application
//! failures become the shared `Error{code, message}` variant with stable
//! codes. Passphrase buffers are wiped as soon as the operation finishes,
//! and error messages never contain secrets.

use crate::logring::LogRing;
use crate::throttle::Throttle;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;
use vaultsign_broker::RequestHandler;
use vaultsign_keychain::{KeyRing, KeychainError, SignKind};
use vaultsign_protocol::{
    codes, decode_request, encode_response, KeyResult, KeyStatus, NewKeyResult, Request, Response,
    WatermarkStatus,
};
use zeroize::Zeroizing;

/// Request dispatcher for the gadget side of the link.
pub struct Dispatcher {
    keyring: Arc<KeyRing>,
    unlock_throttle: Throttle,
    delete_throttle: Throttle,
    logs: Arc<LogRing>,
}

impl Dispatcher {
    /// Build a dispatcher over the keyring and log ring.
    pub fn new(keyring: Arc<KeyRing>, logs: Arc<LogRing>) -> Arc<Self> {
        Arc::new(Self {
            keyring,
            unlock_throttle: Throttle::new(),
            delete_throttle: Throttle::new(),
            logs,
        })
    }

    async fn dispatch(&self, request: &Request) -> Response {
        match request {
            Request::InitInfo => self.init_info(),
            Request::InitMaster {
                deterministic,
                passphrase,
            } => self.init_master(*deterministic, passphrase).await,
            Request::Status => self.status().await,
            Request::NewKeys {
                aliases,
                passphrase,
            } => self.new_keys(aliases, passphrase).await,
            Request::Sign { tz4, message } => self.sign(tz4, message).await,
            Request::Unlock {
                aliases,
                passphrase,
            } => self.unlock(aliases, passphrase).await,
            Request::Lock { aliases } => self.lock(aliases).await,
            Request::DeleteKeys {
                aliases,
                passphrase,
            } => self.delete_keys(aliases, passphrase).await,
            Request::SetLevel { alias, level } => self.set_level(alias, *level).await,
            Request::Logs { limit } => Response::Logs {
                lines: self.logs.tail(*limit as usize),
            },
        }
    }

    fn init_info(&self) -> Response {
        match self.keyring.store().init_info() {
            Ok((master_present, deterministic)) => Response::InitInfo {
                master_present,
                deterministic,
            },
            Err(err) => error_response(&err),
        }
    }

    async fn init_master(&self, deterministic: bool, passphrase: &[u8]) -> Response {
        let store = self.keyring.store().clone();
        let password = Zeroizing::new(passphrase.to_vec());
        let result = tokio::task::spawn_blocking(move || {
            store.init_master()?;
            store.write_seed(&password, deterministic)
        })
        .await;

        match result {
            Ok(Ok(())) => Response::Ok { ok: true },
            Ok(Err(err)) => error_response(&err),
            Err(err) => internal_error(&err.to_string()),
        }
    }

    async fn status(&self) -> Response {
        match self.keyring.status().await {
            Ok(entries) => Response::Status {
                keys: entries
                    .into_iter()
                    .map(|entry| KeyStatus {
                        alias: entry.alias,
                        tz4: entry.tz4,
                        bl_pubkey: entry.bl_pubkey,
                        pop: entry.pop,
                        locked: entry.locked,
                        state_corrupted: entry.state_corrupted,
                        block: watermark_status(&entry.watermarks, SignKind::Block),
                        preattestation: watermark_status(
                            &entry.watermarks,
                            SignKind::Preattestation,
                        ),
                        attestation: watermark_status(&entry.watermarks, SignKind::Attestation),
                    })
                    .collect(),
            },
            Err(err) => error_response(&err),
        }
    }

    async fn new_keys(&self, aliases: &[String], passphrase: &[u8]) -> Response {
        // An empty request creates a single auto-named key.
        let wanted: Vec<String> = if aliases.is_empty() {
            vec![String::new()]
        } else {
            aliases.to_vec()
        };

        let mut results = Vec::with_capacity(wanted.len());
        for alias in wanted {
            match self.keyring.create_key(&alias, passphrase).await {
                Ok(key) => results.push(NewKeyResult {
                    alias: key.alias,
                    tz4: key.tz4,
                    bl_pubkey: key.bl_pubkey,
                    ok: true,
                    error: None,
                }),
                Err(err) => results.push(NewKeyResult {
                    alias,
                    tz4: String::new(),
                    bl_pubkey: String::new(),
                    ok: false,
                    error: Some(err.to_string()),
                }),
            }
        }
        Response::NewKeys { results }
    }

    async fn sign(&self, tz4: &str, message: &[u8]) -> Response {
        match self.keyring.sign(tz4, message).await {
            Ok(signature) => Response::Sign { signature },
            Err(err) => error_response(&err),
        }
    }

    async fn unlock(&self, aliases: &[String], passphrase: &[u8]) -> Response {
        if let Err(remaining) = self.unlock_throttle.check() {
            return Response::Error {
                code: codes::UNLOCK_THROTTLED,
                message: format!("unlock throttled; retry in {}s", remaining.as_secs() + 1),
            };
        }

        let mut results = Vec::with_capacity(aliases.len());
        let mut any_ok = false;
        let mut any_bad_password = false;
        for alias in aliases {
            match self.keyring.unlock(alias, passphrase).await {
                Ok(()) => {
                    any_ok = true;
                    results.push(KeyResult {
                        alias: alias.clone(),
                        ok: true,
                        error: None,
                    });
                }
                Err(err) => {
                    if matches!(err, KeychainError::BadPassword) {
                        any_bad_password = true;
                    }
                    results.push(KeyResult {
                        alias: alias.clone(),
                        ok: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        if any_ok {
            self.unlock_throttle.record_success();
        } else if any_bad_password {
            warn!("unlock failed for every key; throttling");
            self.unlock_throttle.record_failure();
        }

        Response::Unlock { results }
    }

    async fn lock(&self, aliases: &[String]) -> Response {
        let mut results = Vec::with_capacity(aliases.len());
        for alias in aliases {
            match self.keyring.lock(alias).await {
                Ok(()) => results.push(KeyResult {
                    alias: alias.clone(),
                    ok: true,
                    error: None,
                }),
                Err(err) => results.push(KeyResult {
                    alias: alias.clone(),
                    ok: false,
                    error: Some(err.to_string()),
                }),
            }
        }
        Response::Lock { results }
    }

    async fn delete_keys(&self, aliases: &[String], passphrase: &[u8]) -> Response {
        if let Err(remaining) = self.delete_throttle.check() {
            return Response::Error {
                code: codes::DELETE_THROTTLED,
                message: format!("delete throttled; retry in {}s", remaining.as_secs() + 1),
            };
        }

        // Deleting is irreversible: the master password is verified first.
        match self.keyring.verify_master(passphrase).await {
            Ok(()) => self.delete_throttle.record_success(),
            Err(KeychainError::BadPassword) => {
                warn!("delete rejected: bad master password");
                self.delete_throttle.record_failure();
                return Response::Error {
                    code: codes::DELETE_BAD_PASSWORD,
                    message: "bad master password".into(),
                };
            }
            Err(err) => return error_response(&err),
        }

        let mut results = Vec::with_capacity(aliases.len());
        for alias in aliases {
            match self.keyring.delete_key(alias).await {
                Ok(()) => results.push(KeyResult {
                    alias: alias.clone(),
                    ok: true,
                    error: None,
                }),
                Err(err) => results.push(KeyResult {
                    alias: alias.clone(),
                    ok: false,
                    error: Some(err.to_string()),
                }),
            }
        }
        Response::DeleteKeys { results }
    }

    async fn set_level(&self, alias: &str, level: u64) -> Response {
        match self.keyring.set_level(alias, level).await {
            Ok(()) => Response::Ok { ok: true },
            Err(err) => error_response(&err),
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, payload: Bytes) -> anyhow::Result<Bytes> {
        let mut request = decode_request(&payload)?;
        let response = self.dispatch(&request).await;
        request.wipe_secrets();
        Ok(encode_response(&response)?.into())
    }
}

fn watermark_status(state: &vaultsign_keychain::KeyState, kind: SignKind) -> WatermarkStatus {
    let watermark = state.watermark(kind);
    WatermarkStatus {
        level: watermark.level,
        round: watermark.round,
    }
}

fn error_response(err: &KeychainError) -> Response {
    Response::Error {
        code: error_code(err),
        message: err.to_string(),
    }
}

fn internal_error(message: &str) -> Response {
    Response::Error {
        code: codes::INTERNAL,
        message: message.to_string(),
    }
}

fn error_code(err: &KeychainError) -> u32 {
    match err {
        KeychainError::KeyNotFound => codes::KEY_NOT_FOUND,
        KeychainError::KeyLocked => codes::KEY_LOCKED,
        KeychainError::StaleWatermark => codes::STALE_WATERMARK,
        KeychainError::BadPayload => codes::BAD_PAYLOAD,
        _ => codes::INTERNAL,
    }
}
