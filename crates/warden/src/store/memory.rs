//! In-memory object store with watch semantics and cascading deletes.
//!
//! Backs the test suite and self-contained deployments. Behaves like the
//! real thing where the controllers can tell: store-assigned uids,
//! monotonic resource versions, generation bumps on spec changes,
//! conflict detection on stale writes, and owner-reference cascade on
//! delete.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::objects::*;
use super::{Object, StoreError, WatchEvent};

const WATCH_CAPACITY: usize = 256;

/// Thread-safe in-memory implementation of [`super::ObjectStore`].
pub struct MemoryStore {
    endpoints: DashMap<String, Endpoint>,
    secrets: DashMap<String, Secret>,
    configs: DashMap<String, ConfigObject>,
    replica_sets: DashMap<String, ReplicaSet>,
    services: DashMap<String, Service>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            endpoints: DashMap::new(),
            secrets: DashMap::new(),
            configs: DashMap::new(),
            replica_sets: DashMap::new(),
            services: DashMap::new(),
            events,
        }
    }

    fn publish(&self, event: WatchEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn init_meta(meta: &mut Meta) {
        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        meta.resource_version = 1;
        meta.generation = 1;
    }

    /// Delete every object owner-referenced (directly or transitively) to
    /// the given uid.
    fn cascade(&self, owner_uid: &str) {
        let owned_by = |refs: &[OwnerReference]| refs.iter().any(|r| r.uid == owner_uid);

        let endpoints: Vec<String> = self
            .endpoints
            .iter()
            .filter(|e| owned_by(&e.meta.owner_references))
            .map(|e| e.key().clone())
            .collect();
        for key in endpoints {
            if let Some((_, ep)) = self.endpoints.remove(&key) {
                let uid = ep.meta.uid.clone();
                self.publish(WatchEvent::Deleted(Object::Endpoint(ep)));
                self.cascade(&uid);
            }
        }

        let secrets: Vec<String> = self
            .secrets
            .iter()
            .filter(|s| owned_by(&s.meta.owner_references))
            .map(|s| s.key().clone())
            .collect();
        for key in secrets {
            if let Some((_, secret)) = self.secrets.remove(&key) {
                let uid = secret.meta.uid.clone();
                self.publish(WatchEvent::Deleted(Object::Secret(secret)));
                self.cascade(&uid);
            }
        }

        let replica_sets: Vec<String> = self
            .replica_sets
            .iter()
            .filter(|rs| owned_by(&rs.meta.owner_references))
            .map(|rs| rs.key().clone())
            .collect();
        for key in replica_sets {
            if let Some((_, rs)) = self.replica_sets.remove(&key) {
                let uid = rs.meta.uid.clone();
                self.publish(WatchEvent::Deleted(Object::ReplicaSet(rs)));
                self.cascade(&uid);
            }
        }

        let services: Vec<String> = self
            .services
            .iter()
            .filter(|s| owned_by(&s.meta.owner_references))
            .map(|s| s.key().clone())
            .collect();
        for key in services {
            if let Some((_, service)) = self.services.remove(&key) {
                let uid = service.meta.uid.clone();
                self.publish(WatchEvent::Deleted(Object::Service(service)));
                self.cascade(&uid);
            }
        }
    }

    /// Insert a config object directly, the way an operator would apply it.
    pub fn seed_config(&self, mut config: ConfigObject) -> ConfigObject {
        Self::init_meta(&mut config.meta);
        self.configs.insert(config.meta.key(), config.clone());
        self.publish(WatchEvent::Added(Object::Config(config.clone())));
        config
    }

    /// Delete an endpoint, cascading over everything it owns.
    pub fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = format!("{namespace}/{name}");
        let (_, endpoint) = self.endpoints.remove(&key).ok_or(StoreError::NotFound {
            kind: KIND_ENDPOINT,
            key: key.clone(),
        })?;
        let uid = endpoint.meta.uid.clone();
        self.publish(WatchEvent::Deleted(Object::Endpoint(endpoint)));
        self.cascade(&uid);
        Ok(())
    }

    /// Delete a config object, cascading over everything it owns.
    pub fn delete_config(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = format!("{namespace}/{name}");
        let (_, config) = self.configs.remove(&key).ok_or(StoreError::NotFound {
            kind: KIND_CONFIG,
            key: key.clone(),
        })?;
        let uid = config.meta.uid.clone();
        self.publish(WatchEvent::Deleted(Object::Config(config)));
        self.cascade(&uid);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::ObjectStore for MemoryStore {
    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Endpoint, StoreError> {
        let key = format!("{namespace}/{name}");
        self.endpoints
            .get(&key)
            .map(|e| e.clone())
            .ok_or(StoreError::NotFound {
                kind: KIND_ENDPOINT,
                key,
            })
    }

    async fn create_endpoint(&self, mut endpoint: Endpoint) -> Result<Endpoint, StoreError> {
        let key = endpoint.meta.key();
        if self.endpoints.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: KIND_ENDPOINT,
                key,
            });
        }
        Self::init_meta(&mut endpoint.meta);
        self.endpoints.insert(key, endpoint.clone());
        self.publish(WatchEvent::Added(Object::Endpoint(endpoint.clone())));
        Ok(endpoint)
    }

    async fn update_endpoint(&self, mut endpoint: Endpoint) -> Result<Endpoint, StoreError> {
        let key = endpoint.meta.key();
        let Some(mut entry) = self.endpoints.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind: KIND_ENDPOINT,
                key,
            });
        };
        if entry.meta.resource_version != endpoint.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: KIND_ENDPOINT,
                key,
            });
        }
        let old = entry.clone();
        endpoint.meta.uid = old.meta.uid.clone();
        endpoint.meta.resource_version = old.meta.resource_version + 1;
        endpoint.meta.generation = old.meta.generation;
        if endpoint.spec != old.spec {
            endpoint.meta.generation += 1;
        }
        *entry = endpoint.clone();
        drop(entry);
        self.publish(WatchEvent::Updated {
            old: Object::Endpoint(old),
            new: Object::Endpoint(endpoint.clone()),
        });
        Ok(endpoint)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        let key = format!("{namespace}/{name}");
        self.secrets
            .get(&key)
            .map(|s| s.clone())
            .ok_or(StoreError::NotFound {
                kind: KIND_SECRET,
                key,
            })
    }

    async fn create_secret(&self, mut secret: Secret) -> Result<Secret, StoreError> {
        let key = secret.meta.key();
        if self.secrets.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: KIND_SECRET,
                key,
            });
        }
        Self::init_meta(&mut secret.meta);
        self.secrets.insert(key, secret.clone());
        self.publish(WatchEvent::Added(Object::Secret(secret.clone())));
        Ok(secret)
    }

    async fn update_secret(&self, mut secret: Secret) -> Result<Secret, StoreError> {
        let key = secret.meta.key();
        let Some(mut entry) = self.secrets.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind: KIND_SECRET,
                key,
            });
        };
        if entry.meta.resource_version != secret.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: KIND_SECRET,
                key,
            });
        }
        let old = entry.clone();
        secret.meta.uid = old.meta.uid.clone();
        secret.meta.resource_version = old.meta.resource_version + 1;
        *entry = secret.clone();
        drop(entry);
        self.publish(WatchEvent::Updated {
            old: Object::Secret(old),
            new: Object::Secret(secret.clone()),
        });
        Ok(secret)
    }

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = format!("{namespace}/{name}");
        if let Some(expected) = uid {
            let Some(current) = self.secrets.get(&key) else {
                return Err(StoreError::NotFound {
                    kind: KIND_SECRET,
                    key,
                });
            };
            if current.meta.uid != expected {
                drop(current);
                return Err(StoreError::Conflict {
                    kind: KIND_SECRET,
                    key,
                });
            }
        }
        let (_, secret) = self.secrets.remove(&key).ok_or(StoreError::NotFound {
            kind: KIND_SECRET,
            key,
        })?;
        let deleted_uid = secret.meta.uid.clone();
        self.publish(WatchEvent::Deleted(Object::Secret(secret)));
        self.cascade(&deleted_uid);
        Ok(())
    }

    async fn get_config(&self, namespace: &str, name: &str) -> Result<ConfigObject, StoreError> {
        let key = format!("{namespace}/{name}");
        self.configs
            .get(&key)
            .map(|c| c.clone())
            .ok_or(StoreError::NotFound {
                kind: KIND_CONFIG,
                key,
            })
    }

    async fn update_config(&self, mut config: ConfigObject) -> Result<ConfigObject, StoreError> {
        let key = config.meta.key();
        let Some(mut entry) = self.configs.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind: KIND_CONFIG,
                key,
            });
        };
        if entry.meta.resource_version != config.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: KIND_CONFIG,
                key,
            });
        }
        let old = entry.clone();
        config.meta.uid = old.meta.uid.clone();
        config.meta.resource_version = old.meta.resource_version + 1;
        *entry = config.clone();
        drop(entry);
        self.publish(WatchEvent::Updated {
            old: Object::Config(old),
            new: Object::Config(config.clone()),
        });
        Ok(config)
    }

    async fn list_configs(
        &self,
        namespace: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ConfigObject>, StoreError> {
        Ok(self
            .configs
            .iter()
            .filter(|c| c.meta.namespace == namespace && c.meta.has_label(label_key, label_value))
            .map(|c| c.clone())
            .collect())
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, StoreError> {
        let key = format!("{namespace}/{name}");
        self.replica_sets
            .get(&key)
            .map(|rs| rs.clone())
            .ok_or(StoreError::NotFound {
                kind: KIND_REPLICA_SET,
                key,
            })
    }

    async fn create_replica_set(&self, mut rs: ReplicaSet) -> Result<ReplicaSet, StoreError> {
        let key = rs.meta.key();
        if self.replica_sets.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: KIND_REPLICA_SET,
                key,
            });
        }
        Self::init_meta(&mut rs.meta);
        self.replica_sets.insert(key, rs.clone());
        self.publish(WatchEvent::Added(Object::ReplicaSet(rs.clone())));
        Ok(rs)
    }

    async fn update_replica_set(&self, mut rs: ReplicaSet) -> Result<ReplicaSet, StoreError> {
        let key = rs.meta.key();
        let Some(mut entry) = self.replica_sets.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind: KIND_REPLICA_SET,
                key,
            });
        };
        if entry.meta.resource_version != rs.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: KIND_REPLICA_SET,
                key,
            });
        }
        let old = entry.clone();
        rs.meta.uid = old.meta.uid.clone();
        rs.meta.resource_version = old.meta.resource_version + 1;
        *entry = rs.clone();
        drop(entry);
        self.publish(WatchEvent::Updated {
            old: Object::ReplicaSet(old),
            new: Object::ReplicaSet(rs.clone()),
        });
        Ok(rs)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError> {
        let key = format!("{namespace}/{name}");
        self.services
            .get(&key)
            .map(|s| s.clone())
            .ok_or(StoreError::NotFound {
                kind: KIND_SERVICE,
                key,
            })
    }

    async fn create_service(&self, mut service: Service) -> Result<Service, StoreError> {
        let key = service.meta.key();
        if self.services.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: KIND_SERVICE,
                key,
            });
        }
        Self::init_meta(&mut service.meta);
        self.services.insert(key, service.clone());
        self.publish(WatchEvent::Added(Object::Service(service.clone())));
        Ok(service)
    }

    async fn update_service(&self, mut service: Service) -> Result<Service, StoreError> {
        let key = service.meta.key();
        let Some(mut entry) = self.services.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind: KIND_SERVICE,
                key,
            });
        };
        if entry.meta.resource_version != service.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: KIND_SERVICE,
                key,
            });
        }
        let old = entry.clone();
        service.meta.uid = old.meta.uid.clone();
        service.meta.resource_version = old.meta.resource_version + 1;
        *entry = service.clone();
        drop(entry);
        self.publish(WatchEvent::Updated {
            old: Object::Service(old),
            new: Object::Service(service.clone()),
        });
        Ok(service)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
