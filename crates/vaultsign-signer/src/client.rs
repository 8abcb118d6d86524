//! Typed host-side client.
//!
//! One helper per request kind over [`Broker::request`], with per-kind
//! timeouts: management calls are quick, anything touching key material
//! (KDF, BLS, disk) gets a longer budget. A wire-level `Error{code}`
//! response surfaces as [`ClientError::Remote`].

use std::time::Duration;
use thiserror::Error;
use vaultsign_broker::{Broker, BrokerError};
use vaultsign_protocol::{
    decode_response, encode_request, KeyResult, KeyStatus, NewKeyResult, ProtocolError, Request,
    Response,
};
use zeroize::Zeroizing;

/// Timeout for management requests.
const MGMT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for requests that run the KDF or sign.
const KEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// The gadget answered with an error response.
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    /// The gadget answered with an unexpected response variant.
    #[error("unexpected response variant")]
    UnexpectedResponse,

    /// Broker-level failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Message codec failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Typed signer client over a broker.
pub struct SignerClient<'a> {
    broker: &'a Broker,
}

impl<'a> SignerClient<'a> {
    /// Wrap a broker.
    pub fn new(broker: &'a Broker) -> Self {
        Self { broker }
    }

    async fn call(&self, request: &Request, timeout: Duration) -> Result<Response, ClientError> {
        let encoded = Zeroizing::new(encode_request(request)?);
        let (raw, _id) = tokio::time::timeout(timeout, self.broker.request(&encoded))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let response = decode_response(&raw)?;
        if let Response::Error { code, message } = response {
            return Err(ClientError::Remote { code, message });
        }
        Ok(response)
    }

    /// Query master-store presence and mode.
    pub async fn init_info(&self) -> Result<(bool, bool), ClientError> {
        match self.call(&Request::InitInfo, MGMT_TIMEOUT).await? {
            Response::InitInfo {
                master_present,
                deterministic,
            } => Ok((master_present, deterministic)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Initialize the master store and seed record.
    pub async fn init_master(
        &self,
        deterministic: bool,
        passphrase: &[u8],
    ) -> Result<bool, ClientError> {
        let request = Request::InitMaster {
            deterministic,
            passphrase: passphrase.to_vec(),
        };
        match self.call(&request, KEY_TIMEOUT).await? {
            Response::Ok { ok } => Ok(ok),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetch per-key status.
    pub async fn status(&self) -> Result<Vec<KeyStatus>, ClientError> {
        match self.call(&Request::Status, MGMT_TIMEOUT).await? {
            Response::Status { keys } => Ok(keys),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Create keys.
    pub async fn new_keys(
        &self,
        aliases: &[String],
        passphrase: &[u8],
    ) -> Result<Vec<NewKeyResult>, ClientError> {
        let request = Request::NewKeys {
            aliases: aliases.to_vec(),
            passphrase: passphrase.to_vec(),
        };
        match self.call(&request, KEY_TIMEOUT).await? {
            Response::NewKeys { results } => Ok(results),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sign a payload with the key addressed by `tz4`.
    pub async fn sign(&self, tz4: &str, message: &[u8]) -> Result<Vec<u8>, ClientError> {
        let request = Request::Sign {
            tz4: tz4.to_string(),
            message: message.to_vec(),
        };
        match self.call(&request, KEY_TIMEOUT).await? {
            Response::Sign { signature } => Ok(signature),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Unlock keys.
    pub async fn unlock(
        &self,
        aliases: &[String],
        passphrase: &[u8],
    ) -> Result<Vec<KeyResult>, ClientError> {
        let request = Request::Unlock {
            aliases: aliases.to_vec(),
            passphrase: passphrase.to_vec(),
        };
        match self.call(&request, KEY_TIMEOUT).await? {
            Response::Unlock { results } => Ok(results),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Lock keys.
    pub async fn lock(&self, aliases: &[String]) -> Result<Vec<KeyResult>, ClientError> {
        let request = Request::Lock {
            aliases: aliases.to_vec(),
        };
        match self.call(&request, MGMT_TIMEOUT).await? {
            Response::Lock { results } => Ok(results),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Delete keys after master-password verification.
    pub async fn delete_keys(
        &self,
        aliases: &[String],
        passphrase: &[u8],
    ) -> Result<Vec<KeyResult>, ClientError> {
        let request = Request::DeleteKeys {
            aliases: aliases.to_vec(),
            passphrase: passphrase.to_vec(),
        };
        match self.call(&request, KEY_TIMEOUT).await? {
            Response::DeleteKeys { results } => Ok(results),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Override a key's watermark levels.
    pub async fn set_level(&self, alias: &str, level: u64) -> Result<bool, ClientError> {
        let request = Request::SetLevel {
            alias: alias.to_string(),
            level,
        };
        match self.call(&request, MGMT_TIMEOUT).await? {
            Response::Ok { ok } => Ok(ok),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetch recent device log lines.
    pub async fn logs(&self, limit: u32) -> Result<Vec<String>, ClientError> {
        match self.call(&Request::Logs { limit }, MGMT_TIMEOUT).await? {
            Response::Logs { lines } => Ok(lines),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
