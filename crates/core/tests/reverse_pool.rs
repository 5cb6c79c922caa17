//! End-to-end coverage of the reverse pool's host-type isolation (§8
//! scenario 6) and registration validation (§4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use buildsched_core::pool::reverse::{builder_key_token, RegistrationRequest, ReversePool, MIN_PROTOCOL_VERSION};
use buildsched_core::{Pool, RequestClass, SchedItem, WorkerClient};
use buildsched_error::Result;

struct RecordingClient {
    remove_all_called: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerClient for RecordingClient {
    async fn status(&self) -> Result<()> {
        Ok(())
    }
    async fn remove_all(&self, _path: &str) -> Result<()> {
        self.remove_all_called.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
    fn set_description(&self, _description: &str) {}
    fn set_instance_name(&self, _name: &str) {}
    fn set_on_heartbeat_failure(&self, _callback: Box<dyn Fn() + Send + Sync>) {}
}

const MASTER_KEY: &[u8] = b"test-master-key";

fn register(pool: &Arc<ReversePool>, host_type: &str, hostname: &str) -> Arc<AtomicBool> {
    let remove_all_called = Arc::new(AtomicBool::new(false));
    let client = Box::new(RecordingClient {
        remove_all_called: remove_all_called.clone(),
    });
    let token = builder_key_token(MASTER_KEY, host_type);
    pool.register(
        RegistrationRequest {
            host_type: host_type.to_string(),
            hostname: hostname.to_string(),
            protocol_version: MIN_PROTOCOL_VERSION,
            builder_key_token: token,
        },
        client,
    )
    .unwrap();
    remove_all_called
}

#[tokio::test]
async fn acquire_for_wrong_host_type_blocks_until_cancelled_then_right_type_succeeds() {
    let pool = ReversePool::new(MASTER_KEY.to_vec());
    let remove_all_called = register(&pool, "linux-amd64", "worker-1");

    let item = SchedItem::new("darwin-arm64", RequestClass::Batch, "main");
    let cancel = CancellationToken::new();
    let wrong_type_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        wrong_type_cancel.cancel();
    });
    let err = pool.acquire("darwin-arm64", &item, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    let item = SchedItem::new("linux-amd64", RequestClass::Batch, "main");
    let cancel = CancellationToken::new();
    let client = pool.acquire("linux-amd64", &item, &cancel).await.unwrap();
    client.status().await.unwrap();
    assert!(remove_all_called.load(Ordering::SeqCst));

    pool.close_idle();
}

#[tokio::test]
async fn registration_rejects_wrong_builder_key() {
    let pool = ReversePool::new(MASTER_KEY.to_vec());
    let client = Box::new(RecordingClient {
        remove_all_called: Arc::new(AtomicBool::new(false)),
    });
    let err = pool
        .register(
            RegistrationRequest {
                host_type: "linux-amd64".to_string(),
                hostname: "worker-1".to_string(),
                protocol_version: MIN_PROTOCOL_VERSION,
                builder_key_token: "not-the-right-token".to_string(),
            },
            client,
        )
        .unwrap_err();
    assert!(!err.is_retryable());
    pool.close_idle();
}

#[tokio::test]
async fn registration_rejects_old_protocol_version() {
    let pool = ReversePool::new(MASTER_KEY.to_vec());
    let client = Box::new(RecordingClient {
        remove_all_called: Arc::new(AtomicBool::new(false)),
    });
    let token = builder_key_token(MASTER_KEY, "linux-amd64");
    let err = pool
        .register(
            RegistrationRequest {
                host_type: "linux-amd64".to_string(),
                hostname: "worker-1".to_string(),
                protocol_version: MIN_PROTOCOL_VERSION - 1,
                builder_key_token: token,
            },
            client,
        )
        .unwrap_err();
    assert!(!err.is_retryable());
    pool.close_idle();
}
