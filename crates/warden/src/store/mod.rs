//! Cluster object store seam.
//!
//! The controllers talk to the cluster through [`ObjectStore`]; the host
//! supplies the production implementation, while [`MemoryStore`] serves
//! tests and self-contained deployments. The trait deliberately exposes
//! only the operations the reconcilers need: typed get/create/update,
//! label listing of config objects, preconditioned secret deletion, and a
//! watch stream of object events.

mod memory;
mod objects;

pub use memory::MemoryStore;
pub use objects::{
    ConfigObject, Endpoint, EndpointSpec, EndpointStatus, Meta, OwnerReference, PodTemplate,
    ReplicaSet, ReplicaSetSpec, Secret, SecretType, Service, ServiceSpec, ServiceType, TlsConfig,
    KIND_CONFIG, KIND_ENDPOINT, KIND_REPLICA_SET, KIND_SECRET, KIND_SERVICE,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("conflict writing {kind} {key}: stale resource version")]
    Conflict { kind: &'static str, key: String },

    #[error("object store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// An object as carried by watch events.
#[derive(Debug, Clone)]
pub enum Object {
    Endpoint(Endpoint),
    Secret(Secret),
    Config(ConfigObject),
    ReplicaSet(ReplicaSet),
    Service(Service),
}

/// A store change notification.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Object),
    Updated { old: Object, new: Object },
    Deleted(Object),
}

/// Split a `namespace/name` work queue key.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

/// Typed access to the cluster object store.
///
/// Update calls carry the caller's view of the object including its
/// `resource_version`; a stale version yields [`StoreError::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Endpoint, StoreError>;
    async fn create_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, StoreError>;
    async fn update_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError>;
    async fn create_secret(&self, secret: Secret) -> Result<Secret, StoreError>;
    async fn update_secret(&self, secret: Secret) -> Result<Secret, StoreError>;
    /// Delete a secret; when `uid` is given the deletion only happens if
    /// the live object still carries that uid.
    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_config(&self, namespace: &str, name: &str) -> Result<ConfigObject, StoreError>;
    async fn update_config(&self, config: ConfigObject) -> Result<ConfigObject, StoreError>;
    /// All config objects in a namespace carrying the label `key=value`.
    async fn list_configs(
        &self,
        namespace: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ConfigObject>, StoreError>;

    async fn get_replica_set(&self, namespace: &str, name: &str)
        -> Result<ReplicaSet, StoreError>;
    async fn create_replica_set(&self, rs: ReplicaSet) -> Result<ReplicaSet, StoreError>;
    async fn update_replica_set(&self, rs: ReplicaSet) -> Result<ReplicaSet, StoreError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError>;
    async fn create_service(&self, service: Service) -> Result<Service, StoreError>;
    async fn update_service(&self, service: Service) -> Result<Service, StoreError>;

    /// Subscribe to object change events.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
