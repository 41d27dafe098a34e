//! Endpoint reconciler.
//!
//! Drives one domain per endpoint through the ACME order lifecycle:
//! renewal decision, order allocation, authorization challenges via the
//! exposer triple, finalization, and installation of the issued material
//! onto the endpoint plus its mirror secret. The state machine is flat:
//! every reconcile advances one visible step, persists it, and relies on
//! the resulting watch event to be re-enqueued, so a crash at any point
//! resumes cleanly from the annotation.

mod exposer;
mod renewal;
mod status;

pub use exposer::{ensure_exposer, temporary_name, EXPOSER_NAME_PREFIX};
pub use renewal::needs_cert_key;
pub use status::{get_status, set_status, update_status};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace, warn};

use crate::acme::{
    AcmeError, AuthorizationStatus, ChallengeStatus, OrderStatus, SharedClientFactory,
};
use crate::api::{self, ProvisioningStatus};
use crate::cert::{self, CertBundle, CertError, DEFAULT_RSA_KEY_BITS};
use crate::events::{EventSink, EventType, ObjectRef, REASON_COLLIDING_SECRET, REASON_FAILED_AUTHORIZATION};
use crate::queue::RateLimitedQueue;
use crate::store::{
    split_key, Endpoint, Meta, Object, ObjectStore, OwnerReference, Secret, SecretType,
    StoreError, TlsConfig, WatchEvent, KIND_ENDPOINT,
};

/// Requeues with the same error before the key is dropped. Kept low until
/// ACME traffic gets its own rate limiting; the informer resync safety
/// net re-enqueues dropped keys eventually.
pub const MAX_RETRIES: u32 = 2;

/// Scoped deadline for all ACME traffic within one reconcile.
pub const ACME_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait before polling an order the CA is still validating.
const PROCESSING_REQUEUE_DELAY: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("invalid work queue key {0:?}")]
    InvalidKey(String),

    #[error("endpoint {key}: existing certificate doesn't match hostname {host:?}")]
    HostnameMismatch { key: String, host: String },

    #[error("endpoint {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("exposer {kind} {key} already exists and isn't owned by this endpoint")]
    Collision { kind: &'static str, key: String },

    #[error("endpoint {key}: order {order_uri:?}: {reason}")]
    ProtocolInvalid {
        key: String,
        order_uri: String,
        reason: String,
    },

    #[error("timed out waiting for {0}")]
    DeadlineExceeded(&'static str),
}

/// Per-endpoint ACME state machine, sharing nothing with the account
/// reconciler but the object store and the client factory.
pub struct EndpointController {
    store: Arc<dyn ObjectStore>,
    client_factory: Arc<SharedClientFactory>,
    events: Arc<dyn EventSink>,
    queue: RateLimitedQueue,
    /// How long an order may sit unfinished before it is declared stuck.
    order_timeout: chrono::Duration,
    rsa_key_bits: usize,
    now_fn: fn() -> DateTime<Utc>,
}

impl EndpointController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client_factory: Arc<SharedClientFactory>,
        events: Arc<dyn EventSink>,
        order_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client_factory,
            events,
            queue: RateLimitedQueue::new(),
            order_timeout: chrono::Duration::from_std(order_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            rsa_key_bits: DEFAULT_RSA_KEY_BITS,
            now_fn: Utc::now,
        }
    }

    /// Override the endpoint key size. Production stays on the default;
    /// tests shrink it to keep key generation fast.
    pub fn with_rsa_key_bits(mut self, bits: usize) -> Self {
        self.rsa_key_bits = bits;
        self
    }

    /// Inject a clock for deterministic tests.
    pub fn with_now_fn(mut self, now_fn: fn() -> DateTime<Utc>) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub fn queue(&self) -> &RateLimitedQueue {
        &self.queue
    }

    /// Run the reconciler until the shutdown signal flips. Workers drain
    /// the queue in parallel; the queue guarantees a key is never handled
    /// twice concurrently.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) {
        info!(workers, "Starting endpoint controller");

        let watch_task = {
            let ctl = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            let mut events = self.store.watch();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        event = events.recv() => match event {
                            Ok(event) => ctl.observe(event).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "Endpoint watch stream lagged; waiting for resync");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            })
        };

        let mut worker_handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let ctl = Arc::clone(&self);
            worker_handles.push(tokio::spawn(async move { ctl.worker_loop(worker).await }));
        }

        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Shutting down endpoint controller");
        self.queue.shut_down();
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = watch_task.await;
    }

    async fn worker_loop(&self, worker: usize) {
        while let Some(key) = self.queue.next().await {
            match AssertUnwindSafe(self.handle(&key)).catch_unwind().await {
                Ok(result) => self.handle_err(result, &key),
                Err(_) => {
                    error!(worker, key = %key, "Recovered from panic in endpoint handler");
                }
            }
            self.queue.done(&key);
        }
        debug!(worker, "Endpoint worker stopped");
    }

    fn handle_err(&self, result: Result<(), EndpointError>, key: &str) {
        match result {
            Ok(()) => self.queue.forget(key),
            Err(err) => {
                if self.queue.num_requeues(key) < MAX_RETRIES {
                    info!(key = %key, error = %err, "Error syncing endpoint");
                    self.queue.add_rate_limited(key);
                } else {
                    self.queue.forget(key);
                    error!(key = %key, error = %err, "Dropping endpoint out of the queue");
                }
            }
        }
    }

    async fn observe(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(Object::Endpoint(endpoint))
            | WatchEvent::Deleted(Object::Endpoint(endpoint)) => {
                self.maybe_enqueue_endpoint(&endpoint);
            }
            WatchEvent::Updated {
                new: Object::Endpoint(endpoint),
                ..
            } => {
                self.maybe_enqueue_endpoint(&endpoint);
            }
            WatchEvent::Updated {
                old: Object::Secret(old),
                new: Object::Secret(new),
            } => {
                // Periodic re-list echoes carry the same resource version.
                if old.meta.resource_version == new.meta.resource_version {
                    return;
                }
                if let Some(key) = self.resolve_secret_owner(&new).await {
                    debug!(secret = %new.meta.key(), endpoint = %key, "Owned secret updated");
                    self.queue.add(&key);
                }
            }
            WatchEvent::Deleted(Object::Secret(secret)) => {
                if let Some(key) = self.resolve_secret_owner(&secret).await {
                    debug!(secret = %secret.meta.key(), endpoint = %key, "Owned secret deleted");
                    self.queue.add(&key);
                }
            }
            _ => {}
        }
    }

    fn maybe_enqueue_endpoint(&self, endpoint: &Endpoint) {
        if !endpoint.meta.has_label(api::MANAGED_LABEL, api::LABEL_TRUE) {
            trace!(endpoint = %endpoint.meta.key(), "Skipping unmanaged endpoint");
            return;
        }
        // Responder routes are deep copies of their parent and inherit the
        // managed label; the temporary label keeps them out of the
        // reconciliation set.
        if endpoint.meta.has_label(api::TEMPORARY_LABEL, api::LABEL_TRUE) {
            trace!(endpoint = %endpoint.meta.key(), "Skipping exposer artifact");
            return;
        }
        self.queue.add(&endpoint.meta.key());
    }

    /// Resolve the managed endpoint a secret's controller reference
    /// points at, checking kind, name and uid.
    async fn resolve_secret_owner(&self, secret: &Secret) -> Option<String> {
        let owner = secret.meta.controller_ref()?;
        if owner.kind != KIND_ENDPOINT {
            return None;
        }
        let endpoint = self
            .store
            .get_endpoint(&secret.meta.namespace, &owner.name)
            .await
            .ok()?;
        if endpoint.meta.uid != owner.uid {
            return None;
        }
        if !endpoint.meta.has_label(api::MANAGED_LABEL, api::LABEL_TRUE)
            || endpoint.meta.has_label(api::TEMPORARY_LABEL, api::LABEL_TRUE)
        {
            return None;
        }
        Some(endpoint.meta.key())
    }

    /// The business logic for one key. Never invoked concurrently with
    /// the same key; retry policy lives in the worker loop, not here.
    pub async fn handle(&self, key: &str) -> Result<(), EndpointError> {
        let start = std::time::Instant::now();
        debug!(key = %key, "Started syncing endpoint");
        let result = self.sync(key).await;
        debug!(key = %key, elapsed_ms = start.elapsed().as_millis() as u64, "Finished syncing endpoint");
        result
    }

    async fn sync(&self, key: &str) -> Result<(), EndpointError> {
        let Some((namespace, name)) = split_key(key) else {
            return Err(EndpointError::InvalidKey(key.to_string()));
        };

        let endpoint = match self.store.get_endpoint(namespace, name).await {
            Ok(endpoint) => endpoint,
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Endpoint doesn't exist anymore");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Don't act on objects that are being deleted.
        if endpoint.meta.deletion_timestamp.is_some() {
            return Ok(());
        }

        // Only admitted endpoints are known to own their domain.
        if !endpoint.status.admitted {
            debug!(key = %key, "Skipping endpoint because it's not admitted");
            return Ok(());
        }

        self.sync_secret(&endpoint).await?;

        let deadline = tokio::time::Instant::now() + ACME_TIMEOUT;
        let client = tokio::time::timeout_at(deadline, self.client_factory.client())
            .await
            .map_err(|_| EndpointError::DeadlineExceeded("ACME account readiness"))?;

        let mut status = get_status(&endpoint)?;
        let now = (self.now_fn)();

        let mut provisioning = match status.provisioning_status.take() {
            Some(provisioning) => provisioning,
            None => match needs_cert_key(now, &endpoint)? {
                None => {
                    debug!(key = %key, "Endpoint doesn't need a new certificate");
                    return update_status(&self.store, &endpoint, &mut status).await;
                }
                Some(reason) => {
                    info!(key = %key, reason = %reason, "Endpoint needs a new certificate");
                    ProvisioningStatus::default()
                }
            },
        };

        let domain = endpoint.spec.host.clone();
        if domain.is_empty() {
            return Err(EndpointError::Config {
                key: key.to_string(),
                reason: "endpoint has no host".to_string(),
            });
        }

        if provisioning.order_uri.is_empty() {
            let order =
                with_deadline(deadline, "order allocation", client.authorize_order(&domain)).await?;
            info!(key = %key, order = %order.uri, "Created order");

            // Persist the order URI before touching anything else; a crash
            // here must lose at most this one order at the CA.
            provisioning.order_uri = order.uri;
            provisioning.started_at = Some(now);
            status.provisioning_status = Some(provisioning);
            return update_status(&self.store, &endpoint, &mut status).await;
        }

        // Clear stuck provisioning.
        let stuck = provisioning
            .started_at
            .map_or(true, |started| now > started + self.order_timeout);
        if stuck {
            warn!(key = %key, order = %provisioning.order_uri, "Clearing stuck order");
            status.provisioning_status = None;
            return update_status(&self.store, &endpoint, &mut status).await;
        }

        let order = match with_deadline(
            deadline,
            "order fetch",
            client.get_order(&provisioning.order_uri),
        )
        .await
        {
            Ok(order) => order,
            Err(EndpointError::Acme(e)) if e.is_not_found() => {
                // The order URI doesn't exist at the CA. Drop it and start
                // over on the next pass.
                warn!(key = %key, order = %provisioning.order_uri, "Found invalid order URI, removing it");
                provisioning.order_uri.clear();
                status.provisioning_status = Some(provisioning);
                return update_status(&self.store, &endpoint, &mut status).await;
            }
            Err(e) => return Err(e),
        };

        provisioning.order_status = order.status.as_str().to_string();
        debug!(key = %key, order = %order.uri, status = %order.status, "Order state");

        match order.status {
            OrderStatus::Pending => {
                debug!(
                    key = %key,
                    order = %order.uri,
                    authorizations = order.authorization_urls.len(),
                    "Satisfying pending authorizations"
                );

                for authz_url in &order.authorization_urls {
                    let authz = with_deadline(
                        deadline,
                        "authorization fetch",
                        client.get_authorization(authz_url),
                    )
                    .await?;
                    debug!(key = %key, authz = %authz.uri, status = %authz.status, "Authorization state");

                    match authz.status {
                        AuthorizationStatus::Pending => {}
                        AuthorizationStatus::Valid
                        | AuthorizationStatus::Invalid
                        | AuthorizationStatus::Deactivated
                        | AuthorizationStatus::Expired
                        | AuthorizationStatus::Revoked => continue,
                        ref other => {
                            return Err(EndpointError::ProtocolInvalid {
                                key: key.to_string(),
                                order_uri: order.uri.clone(),
                                reason: format!(
                                    "authorization {} has invalid status {other:?}",
                                    authz.uri
                                ),
                            });
                        }
                    }

                    let Some(challenge) = authz.http01_challenge() else {
                        return Err(EndpointError::ProtocolInvalid {
                            key: key.to_string(),
                            order_uri: order.uri.clone(),
                            reason: format!(
                                "no viable challenge type found in authorization {} for domain {domain:?}",
                                authz.uri
                            ),
                        });
                    };

                    match challenge.status {
                        ChallengeStatus::Pending => {
                            let tmp_name = temporary_name(
                                &endpoint.meta.name,
                                &order.uri,
                                authz_url,
                                &challenge.uri,
                            );
                            let challenge_path = client.http01_challenge_path(&challenge.token);
                            ensure_exposer(
                                &self.store,
                                &self.events,
                                &endpoint,
                                &challenge_path,
                                &tmp_name,
                            )
                            .await?;

                            with_deadline(
                                deadline,
                                "challenge acceptance",
                                client.accept_challenge(&challenge.uri),
                            )
                            .await?;
                        }
                        ChallengeStatus::Processing
                        | ChallengeStatus::Valid
                        | ChallengeStatus::Invalid => {
                            // These manifest in the order state over time;
                            // only pending challenges need attention.
                            continue;
                        }
                        ref other => {
                            return Err(EndpointError::ProtocolInvalid {
                                key: key.to_string(),
                                order_uri: order.uri.clone(),
                                reason: format!(
                                    "challenge {} has invalid status {other:?}",
                                    challenge.uri
                                ),
                            });
                        }
                    }
                }

                status.provisioning_status = Some(provisioning);
                update_status(&self.store, &endpoint, &mut status).await
            }

            OrderStatus::Ready | OrderStatus::Valid => {
                info!(key = %key, order = %order.uri, "Order successfully validated");

                let endpoint_key = cert::generate_rsa_key(self.rsa_key_bits)?;
                let csr = cert::build_csr(&domain, &endpoint_key)?;

                let issued = with_deadline(
                    deadline,
                    "order finalization",
                    client.finalize_order(&order.finalize_url, &csr),
                )
                .await?;
                debug!(key = %key, order = %order.uri, certificate = %issued.certificate_url, "Certificate issued");

                let bundle = CertBundle::from_der_chain(&issued.chain_der, &endpoint_key)?;

                let mut updated = endpoint.clone();
                updated.spec.tls = Some(TlsConfig {
                    key: bundle.key_pem,
                    certificate: bundle.cert_pem,
                });
                let updated = self.store.update_endpoint(updated).await?;

                status.provisioning_status = None;
                update_status(&self.store, &updated, &mut status).await
            }

            OrderStatus::Processing => {
                debug!(key = %key, order = %order.uri, "Waiting for the CA to validate the order");
                self.queue.add_after(key, PROCESSING_REQUEUE_DELAY);
                status.provisioning_status = Some(provisioning);
                update_status(&self.store, &endpoint, &mut status).await
            }

            OrderStatus::Invalid => {
                // Re-fetch the failed authorization for the event detail.
                let mut detail = format!("order {} is invalid", order.uri);
                for authz_url in &order.authorization_urls {
                    let authz = with_deadline(
                        deadline,
                        "authorization fetch",
                        client.get_authorization(authz_url),
                    )
                    .await?;
                    if authz.status == AuthorizationStatus::Invalid {
                        detail = authz.error_detail();
                        break;
                    }
                }

                self.events.record(
                    &ObjectRef::new(KIND_ENDPOINT, &endpoint.meta),
                    EventType::Warning,
                    REASON_FAILED_AUTHORIZATION,
                    &format!("ACME provider failed to validate domain {domain:?}: {detail}"),
                );

                // Keep the status; the order timeout will clear it.
                status.provisioning_status = Some(provisioning);
                update_status(&self.store, &endpoint, &mut status).await
            }

            ref other => Err(EndpointError::ProtocolInvalid {
                key: key.to_string(),
                order_uri: order.uri.clone(),
                reason: format!("invalid new order status {other:?}"),
            }),
        }
    }

    /// Mirror the endpoint's TLS material into a secret named after the
    /// endpoint, or remove the mirror when the endpoint has none.
    async fn sync_secret(&self, endpoint: &Endpoint) -> Result<(), EndpointError> {
        let secret_name = endpoint.meta.name.clone();

        let existing = match self
            .store
            .get_secret(&endpoint.meta.namespace, &secret_name)
            .await
        {
            Ok(secret) => Some(secret),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        // We may only touch a secret that carries our controller reference.
        if let Some(secret) = existing.as_ref() {
            if !secret.meta.is_controlled_by(KIND_ENDPOINT, &endpoint.meta) {
                let message = format!(
                    "Can't sync certificates for endpoint {} into secret {}: it already exists and isn't owned by the endpoint",
                    endpoint.meta.key(),
                    secret.meta.key(),
                );
                self.events.record(
                    &ObjectRef::new(KIND_ENDPOINT, &endpoint.meta),
                    EventType::Warning,
                    REASON_COLLIDING_SECRET,
                    &message,
                );
                return Ok(());
            }
        }

        let Some(tls) = endpoint.spec.tls.as_ref() else {
            if let Some(secret) = existing {
                match self
                    .store
                    .delete_secret(&endpoint.meta.namespace, &secret_name, Some(&secret.meta.uid))
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(());
        };

        let mut desired = match existing.clone() {
            Some(secret) => secret,
            None => Secret {
                meta: Meta::named(&endpoint.meta.namespace, &secret_name),
                ..Default::default()
            },
        };
        desired.meta.owner_references =
            vec![OwnerReference::controller_of(KIND_ENDPOINT, &endpoint.meta)];
        desired.secret_type = SecretType::Tls;
        desired.data.insert(
            api::TLS_CERT_DATA_KEY.to_string(),
            tls.certificate.clone().into_bytes(),
        );
        desired
            .data
            .insert(api::TLS_KEY_DATA_KEY.to_string(), tls.key.clone().into_bytes());

        match existing {
            None => {
                self.store.create_secret(desired).await?;
            }
            Some(old) if old != desired => {
                self.store.update_secret(desired).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }
}

async fn with_deadline<T>(
    deadline: tokio::time::Instant,
    what: &'static str,
    call: impl std::future::Future<Output = Result<T, AcmeError>>,
) -> Result<T, EndpointError> {
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result.map_err(EndpointError::from),
        Err(_) => Err(EndpointError::DeadlineExceeded(what)),
    }
}
