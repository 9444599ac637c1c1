//! Service registry: the authoritative in-process map of services to
//! their live instances.
//!
//! Local mutations ([`Registry::register`], [`Registry::deregister`]) are
//! broadcast to the cluster as [`Delta`]s through a [`DeltaSink`]; remote
//! deltas and full-state merges apply without re-broadcast. Every state
//! transition notifies subscribers with a defensive snapshot.

use crate::error::{ProxyError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Service names that collide with the proxy's own surface.
const RESERVED_SERVICE_NAMES: &[&str] = &["api", "health", "metrics", "v1"];

/// Returns true if the name is reserved and must not be registered.
///
/// Any name starting with `_` is reserved in addition to the fixed set.
/// This is enforced on the gossip receive path as well, so a peer that
/// skipped validation cannot poison the cluster.
pub fn is_reserved_service_name(name: &str) -> bool {
    name.starts_with('_') || RESERVED_SERVICE_NAMES.contains(&name)
}

/// One advertised endpoint of a service.
///
/// `id` is globally unique across the cluster; registering the same id
/// again replaces the previous record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Parses the `weight` metadata key; defaults to 1, rejects zero.
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|w| w.parse::<u32>().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }

    /// The backend URL this instance serves plain HTTP on.
    pub fn backend_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// A single incremental registry change, gossiped between nodes.
///
/// Serialized with a `kind` tag; unknown kinds fail to decode and are
/// dropped by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    Register { instance: ServiceInstance },
    Deregister { id: String },
}

/// Full registry contents, keyed by service name.
pub type ServiceMap = HashMap<String, Vec<ServiceInstance>>;

/// Outbound sink for locally originated deltas.
///
/// The gossip layer's broadcast queue implements this; the registry only
/// ever pushes into it, never reads membership state back.
pub trait DeltaSink: Send + Sync {
    fn broadcast(&self, delta: &Delta);
}

type ChangeListener = Arc<dyn Fn(ServiceMap) + Send + Sync>;

/// Cluster-wide service table replicated by gossip.
pub struct Registry {
    services: RwLock<ServiceMap>,
    listeners: RwLock<Vec<ChangeListener>>,
    sink: RwLock<Option<Arc<dyn DeltaSink>>>,
}

impl Registry {
    /// Creates an empty registry with no delta sink attached.
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            sink: RwLock::new(None),
        }
    }

    /// Attaches the broadcast queue that local mutations feed.
    pub fn set_delta_sink(&self, sink: Arc<dyn DeltaSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Registers an instance, upserting by id, and broadcasts the delta.
    pub fn register(&self, instance: ServiceInstance) -> Result<()> {
        if is_reserved_service_name(&instance.service) {
            return Err(ProxyError::ReservedName(instance.service));
        }

        {
            let mut services = self.services.write();
            Self::upsert(&mut services, instance.clone());
        }

        self.emit(&Delta::Register { instance });
        self.notify_listeners();
        Ok(())
    }

    /// Removes the instance with the given id from whichever service
    /// holds it, broadcasting the delta on success.
    pub fn deregister(&self, id: &str) -> Result<()> {
        let removed = {
            let mut services = self.services.write();
            Self::remove_by_id(&mut services, id)
        };

        if !removed {
            return Err(ProxyError::InstanceNotFound(id.to_string()));
        }

        self.emit(&Delta::Deregister { id: id.to_string() });
        self.notify_listeners();
        Ok(())
    }

    /// Returns a copy of one service's instances (empty if unknown).
    pub fn get_instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.services
            .read()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a copy of the full service table.
    pub fn get_all_services(&self) -> ServiceMap {
        self.services.read().clone()
    }

    /// Number of known services.
    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    /// Registers a change listener.
    ///
    /// Listeners run in their own task per change, after the lock is
    /// released, and receive a snapshot of the full table. They must be
    /// idempotent; ordering across changes is not guaranteed.
    pub fn subscribe(&self, listener: impl Fn(ServiceMap) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Applies a delta received from a peer.
    ///
    /// Never re-broadcasts: broadcasts originate only from local calls.
    pub fn apply_delta(&self, delta: Delta) {
        match delta {
            Delta::Register { instance } => {
                if is_reserved_service_name(&instance.service) {
                    warn!(
                        service = %instance.service,
                        "dropping gossiped registration for reserved service name"
                    );
                    return;
                }
                {
                    let mut services = self.services.write();
                    Self::upsert(&mut services, instance);
                }
                self.notify_listeners();
            }
            Delta::Deregister { id } => {
                let removed = {
                    let mut services = self.services.write();
                    Self::remove_by_id(&mut services, &id)
                };
                if removed {
                    self.notify_listeners();
                } else {
                    debug!(id = %id, "gossiped deregister for unknown instance");
                }
            }
        }
    }

    /// Merges a full-state snapshot from a peer: union by id, remote
    /// wins on collision. Used for anti-entropy on join and periodic
    /// full-state gossip.
    pub fn merge_remote_state(&self, remote: ServiceMap) {
        {
            let mut services = self.services.write();
            for (name, instances) in remote {
                if is_reserved_service_name(&name) {
                    warn!(service = %name, "dropping reserved service name in remote state");
                    continue;
                }
                for instance in instances {
                    Self::upsert(&mut services, instance);
                }
            }
        }
        self.notify_listeners();
    }

    fn upsert(services: &mut ServiceMap, instance: ServiceInstance) {
        let instances = services.entry(instance.service.clone()).or_default();
        match instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => instances.push(instance),
        }
    }

    fn remove_by_id(services: &mut ServiceMap, id: &str) -> bool {
        let mut emptied = None;
        let mut removed = false;
        for (name, instances) in services.iter_mut() {
            if let Some(pos) = instances.iter().position(|i| i.id == id) {
                instances.remove(pos);
                removed = true;
                if instances.is_empty() {
                    emptied = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            services.remove(&name);
        }
        removed
    }

    fn emit(&self, delta: &Delta) {
        if let Some(sink) = self.sink.read().as_ref() {
            sink.broadcast(delta);
        }
    }

    fn notify_listeners(&self) {
        let snapshot = self.services.read().clone();
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                listener(snapshot);
            });
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
