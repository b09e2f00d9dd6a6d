//! The set of live connections.
//!
//! Inbound connections are buses this process drives (or reaches through a
//! remote server). Outbound endpoints are listening addresses for server
//! deployments; only their bookkeeping lives here.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::Connection;
use crate::adapter::{Adapter, Transport};
use crate::error::Result;
use crate::tracing::prelude::*;

/// A listening endpoint.
#[derive(Debug, Clone)]
pub struct OutboundEndpoint {
    pub index: usize,
    pub name: String,
    pub host: String,
    pub service: String,
    accept: Arc<Mutex<()>>,
}

impl OutboundEndpoint {
    /// Serialise accepts on this endpoint.
    pub fn accept_lock(&self) -> MutexGuard<'_, ()> {
        self.accept.lock()
    }
}

/// Registry of inbound connections and outbound endpoints.
pub struct ConnectionRegistry {
    inbound: RwLock<Vec<Arc<Connection>>>,
    outbound: RwLock<Vec<OutboundEndpoint>>,
    next_inbound: AtomicUsize,
    next_outbound: AtomicUsize,
    reconnect_limit: u32,
}

impl ConnectionRegistry {
    pub fn new(reconnect_limit: u32) -> Self {
        Self {
            inbound: RwLock::new(Vec::new()),
            outbound: RwLock::new(Vec::new()),
            next_inbound: AtomicUsize::new(0),
            next_outbound: AtomicUsize::new(0),
            reconnect_limit,
        }
    }

    /// Detect the adapter, then register it.
    pub fn open(&self, transport: Transport, mut adapter: Box<dyn Adapter>) -> Result<Arc<Connection>> {
        adapter.detect()?;
        self.add(transport, adapter)
    }

    /// Register an adapter that is already detected.
    pub fn add(&self, transport: Transport, adapter: Box<dyn Adapter>) -> Result<Arc<Connection>> {
        let index = self.next_inbound.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(
            index,
            transport,
            adapter,
            self.reconnect_limit,
        )?);
        self.inbound.write().push(Arc::clone(&connection));
        debug!(
            bus = index,
            kind = %connection.kind(),
            adapter = connection.adapter_name(),
            "connection added"
        );
        Ok(connection)
    }

    pub fn get(&self, index: usize) -> Option<Arc<Connection>> {
        self.inbound.read().iter().find(|c| c.index() == index).cloned()
    }

    /// Unregister and close a connection.
    pub fn remove(&self, index: usize) -> Option<Arc<Connection>> {
        let removed = {
            let mut inbound = self.inbound.write();
            let position = inbound.iter().position(|c| c.index() == index)?;
            inbound.remove(position)
        };
        removed.close();
        Some(removed)
    }

    /// Snapshot of the inbound connections, in index order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inbound.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inbound.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.read().is_empty()
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self.inbound.write().drain(..).collect();
        for connection in drained {
            connection.close();
        }
    }

    pub fn add_outbound(&self, name: &str, host: &str, service: &str) -> usize {
        let index = self.next_outbound.fetch_add(1, Ordering::Relaxed);
        self.outbound.write().push(OutboundEndpoint {
            index,
            name: name.to_string(),
            host: host.to_string(),
            service: service.to_string(),
            accept: Arc::new(Mutex::new(())),
        });
        debug!(index, host, service, "outbound endpoint added");
        index
    }

    pub fn outbound(&self) -> Vec<OutboundEndpoint> {
        self.outbound.read().clone()
    }
}
