#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

use extension_bus::{
    BusConfig, ConnectionManager, ContextTag, Envelope, HostRuntime, MessageKind,
};

/// Installs a test subscriber once; level comes from `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short delays so tests do not sit on the production backoff.
pub fn fast_config() -> BusConfig {
    BusConfig::new()
        .with_initial_connect_delay(Duration::from_millis(1))
        .with_reconnect_delay(Duration::from_millis(20))
}

pub fn manager(runtime: impl HostRuntime + 'static, context: ContextTag) -> Result<ConnectionManager> {
    Ok(ConnectionManager::builder()
        .runtime(runtime)
        .config(fast_config())
        .context(context)
        .build()?)
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for {what}"))
}

/// Envelopes seen by one subscription.
pub type Inbox = Arc<Mutex<Vec<Envelope>>>;

pub fn record(manager: &ConnectionManager, kind: impl Into<MessageKind>) -> Inbox {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    manager.subscribe(kind, move |envelope| sink.lock().push(envelope.clone()));
    inbox
}
