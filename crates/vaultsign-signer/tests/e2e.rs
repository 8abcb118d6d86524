//! End-to-end scenarios: a host-side typed client and a gadget-side
//! dispatcher wired back-to-back through two brokers over an in-memory
//! duplex transport.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vaultsign_broker::{Broker, BrokerConfig, MemTransport, RequestHandler};
use vaultsign_keychain::payload::build_payload;
use vaultsign_keychain::{ArgonParams, FileStore, KeyRing, SignKind};
use vaultsign_protocol::codes;
use vaultsign_signer::{ClientError, Dispatcher, LogRing, SignerClient};

const PW: &[u8] = b"hunter2";

/// The host side never receives requests in these scenarios.
struct NullHandler;

#[async_trait]
impl RequestHandler for NullHandler {
    async fn handle(&self, _payload: Bytes) -> anyhow::Result<Bytes> {
        Ok(Bytes::new())
    }
}

fn fast_params() -> ArgonParams {
    ArgonParams {
        time: 1,
        memory: 8,
        threads: 1,
        key_len: 32,
    }
}

struct Rig {
    host: Broker,
    gadget: Broker,
    host_transport: Arc<MemTransport>,
    gadget_transport: Arc<MemTransport>,
    dir: Option<TempDir>,
}

impl Rig {
    /// Build the full stack over a freshly provisioned store: master file
    /// with test KDF parameters and a random-mode seed record.
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.init_master_with(fast_params()).unwrap();
        store.write_seed(PW, false).unwrap();
        Self::over(dir.path().to_path_buf(), Some(dir))
    }

    /// Build the stack over an existing store directory (device restart).
    fn over(base: PathBuf, dir: Option<TempDir>) -> Self {
        let store = Arc::new(FileStore::new(base).unwrap());
        let keyring = Arc::new(KeyRing::new(store));
        let dispatcher = Dispatcher::new(keyring, LogRing::new(256));

        let (host_transport, gadget_transport) = MemTransport::pair();
        let (host_transport, gadget_transport) =
            (Arc::new(host_transport), Arc::new(gadget_transport));

        let host = Broker::spawn(
            host_transport.clone(),
            Arc::new(NullHandler),
            BrokerConfig::default(),
        );
        let gadget = Broker::spawn(
            gadget_transport.clone(),
            dispatcher,
            BrokerConfig::default(),
        );

        Self {
            host,
            gadget,
            host_transport,
            gadget_transport,
            dir,
        }
    }

    fn client(&self) -> SignerClient<'_> {
        SignerClient::new(&self.host)
    }

    async fn shutdown(self) -> Option<TempDir> {
        self.host.shutdown().await;
        self.gadget.shutdown().await;
        self.dir
    }
}

/// Create and return the tz4 of a key named `key1`.
async fn create_key1(client: &SignerClient<'_>) -> String {
    let results = client.new_keys(&["key1".to_string()], PW).await.unwrap();
    assert!(results[0].ok, "create failed: {:?}", results[0].error);
    results[0].tz4.clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cold_init_create_sign() {
    let rig = Rig::new();
    let client = rig.client();

    let (master_present, deterministic) = client.init_info().await.unwrap();
    assert!(master_present);
    assert!(!deterministic);

    let tz4 = create_key1(&client).await;
    assert!(tz4.starts_with("tz4"));

    let unlocked = client.unlock(&["key1".to_string()], PW).await.unwrap();
    assert!(unlocked[0].ok);

    let payload = build_payload(SignKind::Block, 1, 0, b"block header");
    let signature = client.sign(&tz4, &payload).await.unwrap();
    assert_eq!(signature.len(), 96);

    // Replaying the same (level, round) is an equivocation attempt.
    match client.sign(&tz4, &payload).await {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::STALE_WATERMARK),
        other => panic!("expected stale watermark, got {:?}", other.map(|_| ())),
    }

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reinit_master_fails() {
    let rig = Rig::new();
    let client = rig.client();

    match client.init_master(false, PW).await {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::INTERNAL),
        other => panic!("expected remote error, got {:?}", other.map(|_| ())),
    }

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monotonic_stepping() {
    let rig = Rig::new();
    let client = rig.client();
    let tz4 = create_key1(&client).await;
    client.unlock(&["key1".to_string()], PW).await.unwrap();

    let sign = |level, round| {
        let payload = build_payload(SignKind::Block, level, round, b"");
        let tz4 = tz4.clone();
        let host = &rig.host;
        async move { SignerClient::new(host).sign(&tz4, &payload).await }
    };

    sign(1, 0).await.unwrap();
    sign(1, 1).await.unwrap();
    sign(2, 0).await.unwrap();
    match sign(1, 5).await {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::STALE_WATERMARK),
        other => panic!("expected stale watermark, got {:?}", other.map(|_| ())),
    }

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_flow_signs_exactly_once() {
    let rig = Rig::new();
    let client = rig.client();
    let tz4 = create_key1(&client).await;
    client.unlock(&["key1".to_string()], PW).await.unwrap();

    // The next host write (the sign request frame) vanishes on the wire,
    // as if the gadget lost power before accepting it. Shortly after, the
    // gadget hits a retryable read error and emits a Retry frame, which
    // makes the host retransmit the still-unconfirmed request.
    rig.host_transport.drop_next_writes(1);
    let payload = build_payload(SignKind::Attestation, 10, 0, b"");
    let inject = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.gadget_transport.inject_retryable_read();
    };
    let (result, ()) = tokio::join!(client.sign(&tz4, &payload), inject);
    assert_eq!(result.unwrap().len(), 96);

    // The handler ran exactly once: the watermark advanced one step, so
    // the next round is still signable and the same round is stale.
    match client.sign(&tz4, &payload).await {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::STALE_WATERMARK),
        other => panic!("expected stale watermark, got {:?}", other.map(|_| ())),
    }
    client
        .sign(&tz4, &build_payload(SignKind::Attestation, 10, 1, b""))
        .await
        .unwrap();

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_password_leaves_key_locked() {
    let rig = Rig::new();
    let client = rig.client();
    let tz4 = create_key1(&client).await;

    let results = client.unlock(&["key1".to_string()], b"wrong").await.unwrap();
    assert!(!results[0].ok);

    match client
        .sign(&tz4, &build_payload(SignKind::Block, 1, 0, b""))
        .await
    {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::KEY_LOCKED),
        other => panic!("expected key locked, got {:?}", other.map(|_| ())),
    }

    let statuses = client.status().await.unwrap();
    assert!(statuses[0].locked);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watermark_survives_device_restart() {
    let rig = Rig::new();
    let client = rig.client();
    let tz4 = create_key1(&client).await;
    client.unlock(&["key1".to_string()], PW).await.unwrap();
    client
        .sign(&tz4, &build_payload(SignKind::Block, 7, 2, b""))
        .await
        .unwrap();

    // Device restarts: brokers torn down, fresh stack, same directory.
    let dir = rig.shutdown().await.unwrap();
    let rig = Rig::over(dir.path().to_path_buf(), Some(dir));
    let client = rig.client();

    client.unlock(&["key1".to_string()], PW).await.unwrap();

    match client
        .sign(&tz4, &build_payload(SignKind::Block, 7, 2, b""))
        .await
    {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::STALE_WATERMARK),
        other => panic!("expected stale watermark, got {:?}", other.map(|_| ())),
    }
    client
        .sign(&tz4, &build_payload(SignKind::Block, 7, 3, b""))
        .await
        .unwrap();

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_level_then_lock_roundtrip() {
    let rig = Rig::new();
    let client = rig.client();
    let tz4 = create_key1(&client).await;
    client.unlock(&["key1".to_string()], PW).await.unwrap();

    assert!(client.set_level("key1", 50).await.unwrap());
    match client
        .sign(&tz4, &build_payload(SignKind::Preattestation, 50, 0, b""))
        .await
    {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::STALE_WATERMARK),
        other => panic!("expected stale watermark, got {:?}", other.map(|_| ())),
    }
    client
        .sign(&tz4, &build_payload(SignKind::Preattestation, 51, 0, b""))
        .await
        .unwrap();

    let locked = client.lock(&["key1".to_string()]).await.unwrap();
    assert!(locked[0].ok);
    match client
        .sign(&tz4, &build_payload(SignKind::Preattestation, 52, 0, b""))
        .await
    {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::KEY_LOCKED),
        other => panic!("expected key locked, got {:?}", other.map(|_| ())),
    }

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_keys_over_the_wire() {
    let rig = Rig::new();
    let client = rig.client();
    create_key1(&client).await;

    match client.delete_keys(&["key1".to_string()], b"wrong").await {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::DELETE_BAD_PASSWORD),
        other => panic!("expected bad password, got {:?}", other.map(|_| ())),
    }

    // The failed attempt armed the delete throttle.
    match client.delete_keys(&["key1".to_string()], PW).await {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, codes::DELETE_THROTTLED),
        other => panic!("expected throttled, got {:?}", other.map(|_| ())),
    }

    // After the cooldown the delete goes through.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let results = client.delete_keys(&["key1".to_string()], PW).await.unwrap();
    assert!(results[0].ok);
    assert!(client.status().await.unwrap().is_empty());

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logs_over_the_wire() {
    let rig = Rig::new();
    let client = rig.client();
    create_key1(&client).await;

    // The ring is fed by a tracing layer in the daemon; here it is empty,
    // but the request itself must round-trip.
    let lines = client.logs(50).await.unwrap();
    assert!(lines.is_empty());

    rig.shutdown().await;
}
