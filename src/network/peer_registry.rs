use crate::error::{BlockchainError, Result};
use crate::network::peer::PeerLink;
use crate::utils::sync::lock;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RegistryInner {
    /// Every live link, registered or still waiting for CONNECT
    links: HashMap<u64, Arc<PeerLink>>,
    /// Registered peers: advertised address -> link id
    by_addr: HashMap<SocketAddr, u64>,
}

/// Peer bookkeeping: at most one live link per peer address. Registered peers and links
/// still waiting for CONNECT are capped separately, so idle sockets cannot crowd out peers.
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
    max_connections: usize,
    max_pending: usize,
}

impl RegistryInner {
    fn pending(&self) -> usize {
        self.links.len().saturating_sub(self.by_addr.len())
    }
}

impl PeerRegistry {
    pub fn new(max_connections: usize, max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_connections,
            max_pending,
        }
    }

    /// Room for another registered peer
    pub fn should_accept_connection(&self) -> bool {
        lock(&self.inner).by_addr.len() < self.max_connections
    }

    /// Room for another inbound link that has not sent CONNECT yet
    pub fn should_accept_pending(&self) -> bool {
        lock(&self.inner).pending() < self.max_pending
    }

    /// Remember a link so shutdown can close it, before it has an address
    pub fn track(&self, link: Arc<PeerLink>) {
        lock(&self.inner).links.insert(link.id(), link);
    }

    /// Bind `link` to `addr`. Refuses when another link already owns the address (the
    /// incumbent is never replaced) or when the peer cap is reached.
    pub fn register(&self, addr: SocketAddr, link: &Arc<PeerLink>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.by_addr.contains_key(&addr) {
            return Err(BlockchainError::PeerRejected(format!(
                "already connected to {addr}"
            )));
        }
        if inner.by_addr.len() >= self.max_connections {
            return Err(BlockchainError::PeerRejected(
                "peer limit reached".to_string(),
            ));
        }
        inner.by_addr.insert(addr, link.id());
        inner.links.insert(link.id(), Arc::clone(link));
        link.set_peer_addr(addr);
        info!("Registered peer {addr}");
        Ok(())
    }

    /// Hand `addr` over to `link` when the current owner satisfies `should_yield`.
    /// Returns the displaced link, which the caller closes.
    pub fn replace_if<F>(
        &self,
        addr: SocketAddr,
        link: &Arc<PeerLink>,
        should_yield: F,
    ) -> Option<Arc<PeerLink>>
    where
        F: FnOnce(&PeerLink) -> bool,
    {
        let mut inner = lock(&self.inner);
        let current_id = *inner.by_addr.get(&addr)?;
        let current = inner.links.get(&current_id).cloned()?;
        if current_id == link.id() || !should_yield(&current) {
            return None;
        }
        inner.links.remove(&current_id);
        inner.by_addr.insert(addr, link.id());
        inner.links.insert(link.id(), Arc::clone(link));
        link.set_peer_addr(addr);
        info!("Peer {addr} moved from link {current_id} to link {}", link.id());
        Some(current)
    }

    /// Forget a link. Its address mapping is only dropped if it still points at this link.
    pub fn remove(&self, link_id: u64) -> Option<Arc<PeerLink>> {
        let mut inner = lock(&self.inner);
        let link = inner.links.remove(&link_id)?;
        if let Some(addr) = link.peer_addr() {
            if inner.by_addr.get(&addr) == Some(&link_id) {
                inner.by_addr.remove(&addr);
                info!("Unregistered peer {addr}");
            }
        }
        Some(link)
    }

    pub fn is_known(&self, addr: &SocketAddr) -> bool {
        lock(&self.inner).by_addr.contains_key(addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<PeerLink>> {
        let inner = lock(&self.inner);
        let id = inner.by_addr.get(addr)?;
        inner.links.get(id).cloned()
    }

    /// Snapshot of the registered links; the lock is released before the caller sends.
    pub fn registered_links(&self) -> Vec<Arc<PeerLink>> {
        let inner = lock(&self.inner);
        inner
            .by_addr
            .values()
            .filter_map(|id| inner.links.get(id).cloned())
            .collect()
    }

    pub fn connected_addresses(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = lock(&self.inner).by_addr.keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        lock(&self.inner).by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live link, registered or not
    pub fn link_count(&self) -> usize {
        lock(&self.inner).links.len()
    }

    /// Empty the registry, handing back every link for closing
    pub fn drain(&self) -> Vec<Arc<PeerLink>> {
        let mut inner = lock(&self.inner);
        inner.by_addr.clear();
        inner.links.drain().map(|(_, link)| link).collect()
    }
}
