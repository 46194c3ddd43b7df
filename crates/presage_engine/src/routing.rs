//! Routing collaborator: which server holds traffic authority per service.
//!
//! `repoint` is the cutover commit operation and must be atomic from the
//! caller's perspective: concurrent readers observe either the pre- or the
//! post-cutover mapping, never a partial state.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{ServerId, ServiceId};

pub trait RoutingTable: Send + Sync + 'static {
    /// Publish the initial authority for a service.
    fn publish(&self, service: ServiceId, server: ServerId);

    /// Atomically move authority for `service` from `from` to `to`. Fails
    /// without any change when the current authority is not `from`.
    fn repoint(&self, service: ServiceId, from: ServerId, to: ServerId) -> anyhow::Result<()>;

    /// Current traffic authority for a service.
    fn authority(&self, service: ServiceId) -> Option<ServerId>;

    /// Drop the entry for a decommissioned service.
    fn withdraw(&self, service: ServiceId);
}

/// Map-backed routing table; the write lock is the per-entry exclusive
/// section required by the cutover.
#[derive(Default)]
pub struct InMemoryRouting {
    inner: RwLock<BTreeMap<ServiceId, ServerId>>,
}

impl InMemoryRouting {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoutingTable for InMemoryRouting {
    fn publish(&self, service: ServiceId, server: ServerId) {
        self.inner.write().unwrap().insert(service, server);
    }

    fn repoint(&self, service: ServiceId, from: ServerId, to: ServerId) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.get(&service) {
            Some(current) if *current == from => {
                inner.insert(service, to);
                Ok(())
            }
            Some(current) => anyhow::bail!(
                "repoint of service {service} expected authority {from}, found {current}"
            ),
            None => anyhow::bail!("repoint of unrouted service {service}"),
        }
    }

    fn authority(&self, service: ServiceId) -> Option<ServerId> {
        self.inner.read().unwrap().get(&service).copied()
    }

    fn withdraw(&self, service: ServiceId) {
        self.inner.write().unwrap().remove(&service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repoint_validates_expected_authority() {
        let routing = InMemoryRouting::new();
        routing.publish(7, 1);

        assert!(routing.repoint(7, 2, 3).is_err());
        assert_eq!(routing.authority(7), Some(1));

        routing.repoint(7, 1, 2).unwrap();
        assert_eq!(routing.authority(7), Some(2));
    }

    #[test]
    fn repoint_of_unknown_service_fails() {
        let routing = InMemoryRouting::new();
        assert!(routing.repoint(9, 1, 2).is_err());
    }
}
