//! Shared engine harness for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mvirt_tunnel::command::IpRoute2;
use mvirt_tunnel::config::EngineConfig;
use mvirt_tunnel::store::{self, MemoryStore, StoreError, TunnelStore};
use mvirt_tunnel::test_util::FakeHost;
use mvirt_tunnel::tunnel::{TunnelDescriptor, TunnelSpec};
use mvirt_tunnel::{TunnelEngine, TunnelFields};

pub struct Harness {
    pub host: Arc<FakeHost>,
    pub store: Arc<dyn TunnelStore>,
    pub engine: Arc<TunnelEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(FakeHost::new(), Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    /// Every host command takes `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self::build(
            FakeHost::with_delay(delay),
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
        )
    }

    pub fn build(host: FakeHost, store: Arc<dyn TunnelStore>, config: EngineConfig) -> Self {
        let host = Arc::new(host);
        let engine = TunnelEngine::new(
            store.clone(),
            host.clone(),
            host.clone(),
            Arc::new(IpRoute2::default()),
            config,
        );
        Self {
            host,
            store,
            engine: Arc::new(engine),
        }
    }

    /// Commands issued since the first `skip` ones.
    pub fn commands_after(&self, skip: usize) -> Vec<String> {
        self.host.command_lines().into_iter().skip(skip).collect()
    }
}

pub fn fields(
    kind: &str,
    local_ip: &str,
    remote_ip: &str,
    assigned_ip: &str,
    interface_name: &str,
) -> TunnelFields {
    TunnelFields {
        name: Some(format!("{} tunnel", interface_name)),
        kind: Some(kind.to_string()),
        local_ip: Some(local_ip.to_string()),
        remote_ip: Some(remote_ip.to_string()),
        assigned_ip: Some(assigned_ip.to_string()),
        mtu: None,
        interface_name: Some(interface_name.to_string()),
    }
}

/// The 6to4 tunnel used throughout the tests.
pub fn sit1() -> TunnelFields {
    fields(
        "6to4",
        "192.0.2.10",
        "198.51.100.1",
        "2002:c000:020a::1/48",
        "sit1",
    )
}

pub fn gre(interface_name: &str) -> TunnelFields {
    fields(
        "gre6",
        "2001:db8::1",
        "2001:db8::2",
        "fd03::1/126",
        interface_name,
    )
}

pub fn partial() -> TunnelFields {
    TunnelFields::default()
}

/// Memory store whose commits can be made to fail.
#[derive(Default)]
pub struct BrokenCommitStore {
    inner: MemoryStore,
    broken: AtomicBool,
}

impl BrokenCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_commits(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelStore for BrokenCommitStore {
    async fn list(&self) -> store::Result<Vec<TunnelDescriptor>> {
        self.inner.list().await
    }

    async fn get(&self, id: &str) -> store::Result<TunnelDescriptor> {
        self.inner.get(id).await
    }

    async fn reserve(&self, spec: TunnelSpec) -> store::Result<TunnelDescriptor> {
        self.inner.reserve(spec).await
    }

    async fn claim(&self, id: &str, interface_name: &str) -> store::Result<()> {
        self.inner.claim(id, interface_name).await
    }

    async fn commit(&self, tunnel: &TunnelDescriptor) -> store::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.commit(tunnel).await
    }

    async fn release(&self, id: &str) -> store::Result<()> {
        self.inner.release(id).await
    }

    async fn remove(&self, id: &str) -> store::Result<()> {
        self.inner.remove(id).await
    }
}
