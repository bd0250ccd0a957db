use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Result, StoreError, TunnelStore};
use crate::tunnel::{TunnelDescriptor, TunnelSpec};

#[derive(Default)]
struct Inner {
    /// Committed tunnels, creation order.
    tunnels: Vec<TunnelDescriptor>,
    /// Interface name -> tunnel id.
    claims: HashMap<String, String>,
}

impl Inner {
    fn position(&self, id: &str) -> Option<usize> {
        self.tunnels.iter().position(|t| t.id == id)
    }

    fn check_claim(&self, id: &str, interface_name: &str) -> Result<()> {
        match self.claims.get(interface_name) {
            Some(holder) if holder != id => Err(StoreError::Conflict {
                interface_name: interface_name.to_string(),
                holder: holder.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// In-memory store for tests and ephemeral use.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TunnelStore for MemoryStore {
    async fn list(&self) -> Result<Vec<TunnelDescriptor>> {
        Ok(self.inner.read().await.tunnels.clone())
    }

    async fn get(&self, id: &str) -> Result<TunnelDescriptor> {
        let inner = self.inner.read().await;
        inner
            .position(id)
            .map(|i| inner.tunnels[i].clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn reserve(&self, spec: TunnelSpec) -> Result<TunnelDescriptor> {
        let mut inner = self.inner.write().await;
        let id = Uuid::new_v4().to_string();
        inner.check_claim(&id, &spec.interface_name)?;
        inner
            .claims
            .insert(spec.interface_name.clone(), id.clone());
        Ok(TunnelDescriptor::new(id, spec))
    }

    async fn claim(&self, id: &str, interface_name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_claim(id, interface_name)?;
        inner
            .claims
            .insert(interface_name.to_string(), id.to_string());
        Ok(())
    }

    async fn commit(&self, tunnel: &TunnelDescriptor) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_claim(&tunnel.id, &tunnel.interface_name)?;

        match inner.position(&tunnel.id) {
            Some(i) => inner.tunnels[i] = tunnel.clone(),
            None => inner.tunnels.push(tunnel.clone()),
        }
        inner
            .claims
            .retain(|name, holder| holder != &tunnel.id || name == &tunnel.interface_name);
        inner
            .claims
            .insert(tunnel.interface_name.clone(), tunnel.id.clone());
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let committed = inner.position(id).map(|i| inner.tunnels[i].interface_name.clone());
        inner
            .claims
            .retain(|name, holder| holder != id || Some(name) == committed.as_ref());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let i = inner
            .position(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        inner.tunnels.remove(i);
        inner.claims.retain(|_, holder| holder != id);
        Ok(())
    }
}
