//! Challenge exposer.
//!
//! For every pending HTTP-01 challenge the reconciler materializes three
//! sibling objects sharing one deterministic name: a responder route (a
//! deep copy of the managed endpoint pointed at the challenge path), a
//! replica-set of responder pods, and the service binding them. The route
//! is controller-owned by the endpoint; replica-set and service are
//! controller-owned by the route, so a cascade delete of the parent tears
//! the whole triple down. Nothing here deletes explicitly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha512};
use tracing::{debug, warn};

use crate::api;
use crate::events::{EventSink, EventType, ObjectRef, REASON_COLLIDING_EXPOSER};
use crate::store::{
    Endpoint, Meta, ObjectStore, OwnerReference, PodTemplate, ReplicaSet, ReplicaSetSpec, Service,
    ServiceSpec, ServiceType, StoreError, KIND_ENDPOINT, KIND_REPLICA_SET, KIND_SERVICE,
};

use super::EndpointError;

/// Name prefix identifying exposer artifacts for operator triage.
pub const EXPOSER_NAME_PREFIX: &str = "acme-exposer-";

/// Responder pod count.
const RESPONDER_REPLICAS: i32 = 2;

/// Attempts at refreshing a stale resource version before giving up.
const CONFLICT_RETRY_LIMIT: usize = 5;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Deterministic name shared by the three exposer objects, derived from
/// the identity of the exact challenge being answered.
pub fn temporary_name(
    endpoint_name: &str,
    order_uri: &str,
    authz_uri: &str,
    challenge_uri: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(format!("{endpoint_name}:{order_uri}:{authz_uri}:{challenge_uri}").as_bytes());
    format!("{EXPOSER_NAME_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Create or adopt the exposer triple for one pending challenge.
pub async fn ensure_exposer(
    store: &Arc<dyn ObjectStore>,
    events: &Arc<dyn EventSink>,
    parent: &Endpoint,
    challenge_path: &str,
    tmp_name: &str,
) -> Result<(), EndpointError> {
    let route = ensure_route(store, events, parent, challenge_path, tmp_name).await?;
    ensure_replica_set(store, events, parent, &route, tmp_name).await?;
    ensure_service(store, events, parent, &route, tmp_name).await?;
    Ok(())
}

fn responder_pod_labels(tmp_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), tmp_name.to_string())])
}

fn collision(
    events: &Arc<dyn EventSink>,
    parent: &Endpoint,
    kind: &'static str,
    name: &str,
) -> EndpointError {
    let message = format!(
        "Exposer {kind} {}/{name} already exists and isn't owned by endpoint {}",
        parent.meta.namespace,
        parent.meta.key(),
    );
    warn!("{message}");
    events.record(
        &ObjectRef::new(KIND_ENDPOINT, &parent.meta),
        EventType::Warning,
        REASON_COLLIDING_EXPOSER,
        &message,
    );
    EndpointError::Collision {
        kind,
        key: format!("{}/{name}", parent.meta.namespace),
    }
}

async fn ensure_route(
    store: &Arc<dyn ObjectStore>,
    events: &Arc<dyn EventSink>,
    parent: &Endpoint,
    challenge_path: &str,
    tmp_name: &str,
) -> Result<Endpoint, EndpointError> {
    let mut desired = parent.clone();
    desired.meta.name = tmp_name.to_string();
    desired.meta.uid = String::new();
    desired.meta.resource_version = 0;
    desired.meta.owner_references = vec![OwnerReference::controller_of(KIND_ENDPOINT, &parent.meta)];
    desired.meta.set_label(api::TEMPORARY_LABEL, api::LABEL_TRUE);
    desired.spec.path = challenge_path.to_string();
    desired.spec.backend = tmp_name.to_string();

    match store.create_endpoint(desired.clone()).await {
        Ok(route) => {
            debug!(route = %route.meta.key(), "Created exposer route");
            return Ok(route);
        }
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e.into()),
    }

    let mut last_err = StoreError::Conflict {
        kind: KIND_ENDPOINT,
        key: format!("{}/{tmp_name}", parent.meta.namespace),
    };
    for _ in 0..CONFLICT_RETRY_LIMIT {
        let current = store.get_endpoint(&parent.meta.namespace, tmp_name).await?;
        if !current.meta.is_controlled_by(KIND_ENDPOINT, &parent.meta) {
            return Err(collision(events, parent, KIND_ENDPOINT, tmp_name));
        }
        // Replace whatever is there.
        desired.meta.uid = current.meta.uid.clone();
        desired.meta.resource_version = current.meta.resource_version;
        match store.update_endpoint(desired.clone()).await {
            Ok(route) => {
                debug!(route = %route.meta.key(), "Adopted exposer route");
                return Ok(route);
            }
            Err(e) if e.is_conflict() => {
                last_err = e;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_err.into())
}

async fn ensure_replica_set(
    store: &Arc<dyn ObjectStore>,
    events: &Arc<dyn EventSink>,
    parent: &Endpoint,
    route: &Endpoint,
    tmp_name: &str,
) -> Result<(), EndpointError> {
    let pod_labels = responder_pod_labels(tmp_name);
    let mut desired = ReplicaSet {
        meta: Meta::named(&parent.meta.namespace, tmp_name),
        spec: ReplicaSetSpec {
            replicas: RESPONDER_REPLICAS,
            selector: pod_labels.clone(),
            template: PodTemplate { labels: pod_labels },
        },
    };
    desired.meta.owner_references = vec![OwnerReference::controller_of(KIND_ENDPOINT, &route.meta)];
    desired.meta.set_label(api::TEMPORARY_LABEL, api::LABEL_TRUE);

    match store.create_replica_set(desired.clone()).await {
        Ok(_) => return Ok(()),
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e.into()),
    }

    let mut last_err = StoreError::Conflict {
        kind: KIND_REPLICA_SET,
        key: format!("{}/{tmp_name}", parent.meta.namespace),
    };
    for _ in 0..CONFLICT_RETRY_LIMIT {
        let current = store.get_replica_set(&parent.meta.namespace, tmp_name).await?;
        if !current.meta.is_controlled_by(KIND_ENDPOINT, &route.meta) {
            return Err(collision(events, parent, KIND_REPLICA_SET, tmp_name));
        }
        desired.meta.uid = current.meta.uid.clone();
        desired.meta.resource_version = current.meta.resource_version;
        match store.update_replica_set(desired.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => {
                last_err = e;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_err.into())
}

async fn ensure_service(
    store: &Arc<dyn ObjectStore>,
    events: &Arc<dyn EventSink>,
    parent: &Endpoint,
    route: &Endpoint,
    tmp_name: &str,
) -> Result<(), EndpointError> {
    let mut desired = Service {
        meta: Meta::named(&parent.meta.namespace, tmp_name),
        spec: ServiceSpec {
            selector: responder_pod_labels(tmp_name),
            service_type: ServiceType::ClusterIp,
        },
    };
    desired.meta.owner_references = vec![OwnerReference::controller_of(KIND_ENDPOINT, &route.meta)];
    desired.meta.set_label(api::TEMPORARY_LABEL, api::LABEL_TRUE);

    match store.create_service(desired.clone()).await {
        Ok(_) => return Ok(()),
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e.into()),
    }

    let mut last_err = StoreError::Conflict {
        kind: KIND_SERVICE,
        key: format!("{}/{tmp_name}", parent.meta.namespace),
    };
    for _ in 0..CONFLICT_RETRY_LIMIT {
        let current = store.get_service(&parent.meta.namespace, tmp_name).await?;
        if !current.meta.is_controlled_by(KIND_ENDPOINT, &route.meta) {
            return Err(collision(events, parent, KIND_SERVICE, tmp_name));
        }
        desired.meta.uid = current.meta.uid.clone();
        desired.meta.resource_version = current.meta.resource_version;
        match store.update_service(desired.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => {
                last_err = e;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::store::{EndpointSpec, EndpointStatus, MemoryStore};

    fn parent_endpoint() -> Endpoint {
        Endpoint {
            meta: Meta::named("ns", "web"),
            spec: EndpointSpec {
                host: "www.example.com".to_string(),
                backend: "web-svc".to_string(),
                ..Default::default()
            },
            status: EndpointStatus { admitted: true },
        }
    }

    #[test]
    fn temporary_name_is_deterministic_and_prefixed() {
        let a = temporary_name("web", "https://ca/order/1", "https://ca/authz/1", "https://ca/chall/1");
        let b = temporary_name("web", "https://ca/order/1", "https://ca/authz/1", "https://ca/chall/1");
        let c = temporary_name("web", "https://ca/order/2", "https://ca/authz/1", "https://ca/chall/1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(EXPOSER_NAME_PREFIX));
        assert_eq!(a.len(), EXPOSER_NAME_PREFIX.len() + 128);
    }

    #[tokio::test]
    async fn creates_the_full_triple_with_owner_chain() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn ObjectStore> = memory.clone();
        let events: Arc<dyn EventSink> = Arc::new(RecordingEventSink::new());

        let parent = store.create_endpoint(parent_endpoint()).await.unwrap();
        let tmp = temporary_name("web", "o", "a", "c");

        ensure_exposer(&store, &events, &parent, "/.well-known/acme-challenge/tok", &tmp)
            .await
            .unwrap();

        let route = store.get_endpoint("ns", &tmp).await.unwrap();
        assert!(route.meta.is_controlled_by(KIND_ENDPOINT, &parent.meta));
        assert!(route.meta.has_label(api::TEMPORARY_LABEL, api::LABEL_TRUE));
        assert_eq!(route.spec.path, "/.well-known/acme-challenge/tok");
        assert_eq!(route.spec.backend, tmp);
        assert_eq!(route.spec.host, "www.example.com");

        let rs = store.get_replica_set("ns", &tmp).await.unwrap();
        assert!(rs.meta.is_controlled_by(KIND_ENDPOINT, &route.meta));
        assert_eq!(rs.spec.replicas, RESPONDER_REPLICAS);
        assert_eq!(rs.spec.selector.get("app"), Some(&tmp));

        let svc = store.get_service("ns", &tmp).await.unwrap();
        assert!(svc.meta.is_controlled_by(KIND_ENDPOINT, &route.meta));
        assert_eq!(svc.spec.selector.get("app"), Some(&tmp));
        assert_eq!(svc.spec.service_type, ServiceType::ClusterIp);

        // Cascade: deleting the parent removes the whole triple.
        memory.delete_endpoint("ns", "web").unwrap();
        assert!(store.get_endpoint("ns", &tmp).await.unwrap_err().is_not_found());
        assert!(store.get_replica_set("ns", &tmp).await.unwrap_err().is_not_found());
        assert!(store.get_service("ns", &tmp).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn second_pass_adopts_existing_objects() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let events: Arc<dyn EventSink> = Arc::new(RecordingEventSink::new());

        let parent = store.create_endpoint(parent_endpoint()).await.unwrap();
        let tmp = temporary_name("web", "o", "a", "c");

        ensure_exposer(&store, &events, &parent, "/p", &tmp).await.unwrap();
        ensure_exposer(&store, &events, &parent, "/p", &tmp).await.unwrap();

        let route = store.get_endpoint("ns", &tmp).await.unwrap();
        assert_eq!(route.spec.path, "/p");
    }

    #[tokio::test]
    async fn foreign_route_is_a_collision() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingEventSink::new());
        let events: Arc<dyn EventSink> = sink.clone();

        let parent = store.create_endpoint(parent_endpoint()).await.unwrap();
        let tmp = temporary_name("web", "o", "a", "c");

        // Somebody else owns an object with our deterministic name.
        let mut foreign = parent_endpoint();
        foreign.meta.name = tmp.clone();
        foreign.meta.owner_references = vec![OwnerReference {
            kind: KIND_ENDPOINT.to_string(),
            name: "intruder".to_string(),
            uid: "intruder-uid".to_string(),
            controller: true,
        }];
        let foreign = store.create_endpoint(foreign).await.unwrap();

        let err = ensure_exposer(&store, &events, &parent, "/p", &tmp)
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Collision { .. }));
        assert_eq!(sink.reasons(), vec![REASON_COLLIDING_EXPOSER]);

        // The pre-existing object was not mutated.
        let still = store.get_endpoint("ns", &tmp).await.unwrap();
        assert_eq!(still.meta.resource_version, foreign.meta.resource_version);
    }
}
