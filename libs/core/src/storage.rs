//! Broker-owned registries: connected service instances and in-flight ids.

use std::collections::{HashMap, HashSet};

use courier_fabric::Channel;
use parking_lot::Mutex;

use crate::id;

/// Maps a service type to its connected instances.
///
/// Instances of a type keep registration order; an unaddressed lookup
/// returns the oldest one. There is no load balancing.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Vec<(String, Channel)>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under `service_type` with a generated instance id.
    pub fn add(&self, service_type: &str, channel: Channel) -> String {
        self.add_instance(service_type, None, channel)
    }

    /// Register with a proposed instance id, falling back to a generated one
    /// if the proposal is empty or already taken for this type.
    pub fn add_instance(&self, service_type: &str, proposed: Option<&str>, channel: Channel) -> String {
        let mut services = self.services.lock();
        let instances = services.entry(service_type.to_string()).or_default();
        let taken = |candidate: &str| instances.iter().any(|(id, _)| id == candidate);
        let instance_id = match proposed {
            Some(candidate) if !candidate.is_empty() && !taken(candidate) => candidate.to_string(),
            _ => loop {
                let candidate = id::generate();
                if !taken(&candidate) {
                    break candidate;
                }
            },
        };
        instances.push((instance_id.clone(), channel));
        instance_id
    }

    /// Remove one instance. Removing an unknown instance is a no-op.
    pub fn remove(&self, service_type: &str, instance_id: &str) -> Option<Channel> {
        let mut services = self.services.lock();
        let instances = services.get_mut(service_type)?;
        let position = instances.iter().position(|(id, _)| id == instance_id)?;
        let (_, channel) = instances.remove(position);
        if instances.is_empty() {
            services.remove(service_type);
        }
        Some(channel)
    }

    /// Look up `target` exactly, or any instance of the type when `target` is `None`.
    pub fn get(&self, service_type: &str, target: Option<&str>) -> Option<Channel> {
        let services = self.services.lock();
        let instances = services.get(service_type)?;
        match target {
            Some(target) => instances
                .iter()
                .find(|(id, _)| id == target)
                .map(|(_, channel)| channel.clone()),
            None => instances.first().map(|(_, channel)| channel.clone()),
        }
    }

    /// Instance ids registered for a type, oldest first.
    pub fn instances(&self, service_type: &str) -> Vec<String> {
        self.services
            .lock()
            .get(service_type)
            .map(|instances| instances.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Visit every registered channel.
    pub fn for_each(&self, mut visit: impl FnMut(&Channel)) {
        // Snapshot so the visitor may call back into the registry
        let channels: Vec<Channel> = self
            .services
            .lock()
            .values()
            .flat_map(|instances| instances.iter().map(|(_, channel)| channel.clone()))
            .collect();
        channels.iter().for_each(|channel| visit(channel));
    }

    pub fn count(&self) -> usize {
        self.services.lock().values().map(Vec::len).sum()
    }

    pub(crate) fn clear(&self) -> Vec<Channel> {
        self.services
            .lock()
            .drain()
            .flat_map(|(_, instances)| instances.into_iter().map(|(_, channel)| channel))
            .collect()
    }
}

/// Invocation ids currently owned by a pending method call or live subscription.
#[derive(Default)]
pub struct InFlightIds {
    ids: Mutex<HashSet<String>>,
}

impl InFlightIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    /// Claim `id`. Returns `false` if it is already in flight.
    pub fn add(&self, id: &str) -> bool {
        self.ids.lock().insert(id.to_string())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.ids.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaddressed_lookup_is_stable_oldest_first() {
        let registry = ServiceRegistry::new();
        let (first, _) = Channel::pair();
        let (second, _) = Channel::pair();
        registry.add("worker", first.clone());
        registry.add("worker", second.clone());

        for _ in 0..3 {
            assert!(registry.get("worker", None).unwrap().same(&first));
        }
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn targeted_lookup_is_exact() {
        let registry = ServiceRegistry::new();
        let (a, _) = Channel::pair();
        let (b, _) = Channel::pair();
        registry.add("worker", a);
        let id = registry.add("worker", b.clone());

        assert!(registry.get("worker", Some(&id)).unwrap().same(&b));
        assert!(registry.get("worker", Some("missing")).is_none());
        assert!(registry.get("other", None).is_none());
    }

    #[test]
    fn proposed_instance_ids_never_duplicate() {
        let registry = ServiceRegistry::new();
        let (a, _) = Channel::pair();
        let (b, _) = Channel::pair();
        assert_eq!(registry.add_instance("worker", Some("w1"), a), "w1");
        let second = registry.add_instance("worker", Some("w1"), b);
        assert_ne!(second, "w1");
        assert_eq!(registry.instances("worker"), vec!["w1".to_string(), second]);
    }

    #[test]
    fn remove_drops_empty_types() {
        let registry = ServiceRegistry::new();
        let (a, _) = Channel::pair();
        let id = registry.add("worker", a);
        assert!(registry.remove("worker", &id).is_some());
        assert!(registry.remove("worker", &id).is_none());
        assert_eq!(registry.count(), 0);
        assert!(registry.instances("worker").is_empty());
    }

    #[test]
    fn for_each_visits_every_instance() {
        let registry = ServiceRegistry::new();
        for kind in ["a", "a", "b"] {
            let (channel, _) = Channel::pair();
            registry.add(kind, channel);
        }
        let mut visited = 0;
        registry.for_each(|_| visited += 1);
        assert_eq!(visited, 3);
    }

    #[test]
    fn in_flight_ids_reject_duplicates() {
        let ids = InFlightIds::new();
        assert!(ids.add("x"));
        assert!(!ids.add("x"));
        assert!(ids.has("x"));
        assert!(ids.remove("x"));
        assert!(!ids.remove("x"));
        assert!(ids.is_empty());
        assert!(ids.add("x"));
    }
}
