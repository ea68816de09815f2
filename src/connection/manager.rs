//! Connection manager
//!
//! Tracks active client connections for logging and metrics. Phoenix's
//! per-connection count is request-scoped rather than QUIC-stream scale, so
//! lookup is a plain `DashMap` rather than a pre-sized slab.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use super::state::{ConnectionId, ConnectionInfo, ConnectionState};
use crate::metrics::METRICS;

/// Manages all active connections.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, ConnectionState>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a newly accepted connection, returning its id.
    pub fn register(&self, client_addr: SocketAddr) -> ConnectionId {
        let id = ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = ConnectionState::new(id, client_addr);
        state.set_active();
        self.connections.insert(id, state);
        METRICS.connection_opened();
        info!(conn_id = %id, %client_addr, "connection registered");
        id
    }

    /// Record request activity on a connection (used per accepted H2 stream).
    pub fn touch(&self, id: ConnectionId) {
        if let Some(mut state) = self.connections.get_mut(&id) {
            state.stream_opened();
            state.touch();
        }
    }

    pub fn remove(&self, id: ConnectionId) {
        if let Some((_, state)) = self.connections.remove(&id) {
            METRICS.connection_closed();
            info!(
                conn_id = %id,
                client_addr = %state.client_addr,
                duration_secs = state.duration().as_secs_f64(),
                "connection closed"
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|e| e.value().to_info()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let manager = ConnectionManager::new();
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let id = manager.register(addr);
        assert_eq!(manager.connection_count(), 1);
        manager.touch(id);
        assert_eq!(manager.list_connections()[0].active_streams, 1);
        manager.remove(id);
        assert_eq!(manager.connection_count(), 0);
    }
}
