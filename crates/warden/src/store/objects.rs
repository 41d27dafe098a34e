//! Typed objects held in the cluster object store.
//!
//! Every object embeds a common [`Meta`] carrying identity, versioning and
//! ownership. The shapes mirror the subset of fields the controllers read
//! and write; anything else the host's store may track is invisible here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object kind names used in owner references and event object refs.
pub const KIND_ENDPOINT: &str = "Endpoint";
pub const KIND_SECRET: &str = "Secret";
pub const KIND_REPLICA_SET: &str = "ReplicaSet";
pub const KIND_SERVICE: &str = "Service";
pub const KIND_CONFIG: &str = "ConfigObject";

/// A reference from a dependent object to its owner.
///
/// Owners with `controller == true` are the single managing controller of
/// the dependent; the store cascades deletion along these references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Build a controller owner reference to the given object.
    pub fn controller_of(kind: &str, meta: &Meta) -> Self {
        Self {
            kind: kind.to_string(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
            controller: true,
        }
    }
}

/// Common object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub namespace: String,
    pub name: String,
    /// Store-assigned unique id, stable for the object's lifetime.
    #[serde(default)]
    pub uid: String,
    /// Monotonic version, bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped by the store when the object's spec changes.
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

impl Meta {
    /// Create metadata for a namespaced name, everything else defaulted.
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Work queue key, `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The single owner reference marked as controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// Whether this object's controller reference points at `owner`.
    pub fn is_controlled_by(&self, kind: &str, owner: &Meta) -> bool {
        self.controller_ref()
            .is_some_and(|r| r.kind == kind && r.uid == owner.uid)
    }

    /// Whether the label is present with the exact value.
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }
}

/// TLS material installed on an endpoint, PEM-encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub key: String,
    pub certificate: String,
}

/// Routing spec of a managed endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Hostname this endpoint routes traffic for.
    pub host: String,
    /// Path prefix the router matches, empty for the whole host.
    #[serde(default)]
    pub path: String,
    /// Name of the backend service receiving the traffic.
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Router-reported endpoint state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatus {
    /// True once the ingress layer acknowledged the endpoint as routing
    /// traffic for its host. Only admitted endpoints own their domain.
    #[serde(default)]
    pub admitted: bool,
}

/// An HTTP-routable endpoint, the managed resource.
///
/// Responder routes created by the challenge exposer are endpoints too:
/// deep copies of their parent with path and backend redirected at the
/// challenge responder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub meta: Meta,
    pub spec: EndpointSpec,
    #[serde(default)]
    pub status: EndpointStatus,
}

/// Secret payload classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretType {
    #[default]
    #[serde(rename = "Opaque")]
    Opaque,
    #[serde(rename = "kubernetes.io/tls")]
    Tls,
}

/// An opaque or TLS secret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub meta: Meta,
    #[serde(default)]
    pub secret_type: SecretType,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Pod template stub. The responder container spec is supplied by the
/// surrounding deployment, so only the selector labels matter here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    pub replicas: i32,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub template: PodTemplate,
}

/// A replica-set running challenge responder pods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub meta: Meta,
    pub spec: ReplicaSetSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub service_type: ServiceType,
}

/// A service binding responder pods to the responder route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub meta: Meta,
    pub spec: ServiceSpec,
}

/// A config object holding string documents under named data keys.
/// Issuer configurations live in these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigObject {
    pub meta: Meta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}
