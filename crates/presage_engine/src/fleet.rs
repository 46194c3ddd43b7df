//! Fleet membership and service placement table.
//!
//! The fleet is an explicit owned table keyed by server identity: joining
//! creates an entry, permanent removal deletes it. All mutation goes through
//! [`FleetStore`]; other components hold server/service ids only.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{ServerId, ServiceId};

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Healthy,
    /// Score below threshold but still serving; migration may be in flight.
    Degraded,
    /// Source of an executing migration plan.
    Migrating,
    Failed,
    /// Cut over away from; holds no authority and may be reclaimed.
    Drained,
}

/// Fleet member descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: ServerId,
    /// Service slots this server can host.
    pub capacity: u32,
    /// Slots held by in-flight migrations targeting this server.
    pub reserved: u32,
    pub state: ServerState,
    pub alive: bool,
}

/// Point-in-time view of the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub servers: BTreeMap<ServerId, ServerInfo>,
    /// Which server hosts each service.
    pub placements: BTreeMap<ServiceId, ServerId>,
}

impl FleetSnapshot {
    /// Number of services currently placed on `server_id`.
    pub fn load(&self, server_id: ServerId) -> u32 {
        self.placements.values().filter(|s| **s == server_id).count() as u32
    }

    /// Slots still available for new placements or reservations.
    pub fn spare_capacity(&self, server_id: ServerId) -> u32 {
        let Some(info) = self.servers.get(&server_id) else {
            return 0;
        };
        info.capacity
            .saturating_sub(self.load(server_id))
            .saturating_sub(info.reserved)
    }

    /// Services hosted on `server_id`, in id order.
    pub fn services_on(&self, server_id: ServerId) -> Vec<ServiceId> {
        self.placements
            .iter()
            .filter_map(|(svc, host)| (*host == server_id).then_some(*svc))
            .collect()
    }
}

/// Owned fleet table; lifecycle tied to membership events.
#[derive(Default)]
pub struct FleetStore {
    inner: RwLock<FleetSnapshot>,
}

impl FleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.inner.read().unwrap().clone()
    }

    pub fn join_server(&self, server_id: ServerId, capacity: u32) {
        let mut inner = self.inner.write().unwrap();
        inner.servers.insert(
            server_id,
            ServerInfo {
                server_id,
                capacity,
                reserved: 0,
                state: ServerState::Healthy,
                alive: true,
            },
        );
    }

    /// Permanently remove a server; returns the services it was hosting.
    pub fn remove_server(&self, server_id: ServerId) -> Vec<ServiceId> {
        let mut inner = self.inner.write().unwrap();
        inner.servers.remove(&server_id);
        let orphaned: Vec<ServiceId> = inner
            .placements
            .iter()
            .filter_map(|(svc, host)| (*host == server_id).then_some(*svc))
            .collect();
        for svc in &orphaned {
            inner.placements.remove(svc);
        }
        orphaned
    }

    pub fn contains(&self, server_id: ServerId) -> bool {
        self.inner.read().unwrap().servers.contains_key(&server_id)
    }

    /// Place a service; returns false when the server is unknown or full.
    pub fn assign_service(&self, service_id: ServiceId, server_id: ServerId) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(info) = inner.servers.get(&server_id) else {
            return false;
        };
        let load = inner
            .placements
            .values()
            .filter(|s| **s == server_id)
            .count() as u32;
        if load.saturating_add(info.reserved) >= info.capacity {
            return false;
        }
        inner.placements.insert(service_id, server_id);
        true
    }

    pub fn state_of(&self, server_id: ServerId) -> Option<ServerState> {
        self.inner
            .read()
            .unwrap()
            .servers
            .get(&server_id)
            .map(|info| info.state)
    }

    pub fn set_state(&self, server_id: ServerId, state: ServerState) {
        let mut inner = self.inner.write().unwrap();
        if let Some(info) = inner.servers.get_mut(&server_id) {
            info.state = state;
        }
    }

    /// Flip liveness; returns the lifecycle state prior to the change.
    pub fn set_alive(&self, server_id: ServerId, alive: bool) -> Option<ServerState> {
        let mut inner = self.inner.write().unwrap();
        let info = inner.servers.get_mut(&server_id)?;
        let prev = info.state;
        info.alive = alive;
        Some(prev)
    }

    pub fn is_alive(&self, server_id: ServerId) -> bool {
        self.inner
            .read()
            .unwrap()
            .servers
            .get(&server_id)
            .map(|info| info.alive)
            .unwrap_or(false)
    }

    /// Reserve `slots` on a migration target; fails when spare capacity is short.
    pub fn reserve(&self, server_id: ServerId, slots: u32) -> bool {
        let mut inner = self.inner.write().unwrap();
        let load = inner
            .placements
            .values()
            .filter(|s| **s == server_id)
            .count() as u32;
        let Some(info) = inner.servers.get_mut(&server_id) else {
            return false;
        };
        if info
            .capacity
            .saturating_sub(load)
            .saturating_sub(info.reserved)
            < slots
        {
            return false;
        }
        info.reserved = info.reserved.saturating_add(slots);
        true
    }

    pub fn release(&self, server_id: ServerId, slots: u32) {
        let mut inner = self.inner.write().unwrap();
        if let Some(info) = inner.servers.get_mut(&server_id) {
            info.reserved = info.reserved.saturating_sub(slots);
        }
    }

    /// Apply a completed cutover: placements move to the target, the target's
    /// reservation converts into load, and the source is marked `Drained`.
    pub fn commit_move(&self, services: &[ServiceId], source: ServerId, target: ServerId) {
        let mut inner = self.inner.write().unwrap();
        for svc in services {
            inner.placements.insert(*svc, target);
        }
        if let Some(info) = inner.servers.get_mut(&target) {
            info.reserved = info.reserved.saturating_sub(services.len() as u32);
        }
        if let Some(info) = inner.servers.get_mut(&source) {
            info.state = ServerState::Drained;
        }
    }
}
