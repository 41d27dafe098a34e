//! Account reconciler.
//!
//! Materializes an ACME account from an issuer configuration object:
//! generates and persists the account key on first contact, registers the
//! account at the CA, recovers or refreshes it afterwards, and writes the
//! CA-assigned state back into the issuer document. On success the
//! account-bound session is published through the shared client factory
//! for the endpoint reconciler to pick up.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace, warn};

use crate::acme::{AccountInfo, AcmeClientBuilder, AcmeError, SharedClientFactory};
use crate::api::{self, CertIssuer, IssuerType};
use crate::cert::{self, CertError, DEFAULT_RSA_KEY_BITS};
use crate::queue::RateLimitedQueue;
use crate::store::{
    split_key, ConfigObject, Meta, Object, ObjectStore, Secret, SecretType, StoreError, WatchEvent,
};

/// Deadline for each account RPC against the CA.
pub const ACCOUNT_TIMEOUT: Duration = Duration::from_secs(15);

static TOS_ONCE: Once = Once::new();

/// Terms-of-service acceptance is unconditional but announced exactly
/// once per process, however many accounts this controller manages.
fn accept_terms(directory_url: &str) {
    TOS_ONCE.call_once(|| {
        info!(
            directory = %directory_url,
            "By continuing running this program you agree to the CA's Terms of Service. If you do not agree exit the program immediately!"
        );
    });
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("invalid work queue key {0:?}")]
    InvalidKey(String),

    #[error("config {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("timed out waiting for {0}")]
    DeadlineExceeded(&'static str),
}

/// Reconciles issuer configurations into registered ACME accounts.
pub struct AccountController {
    store: Arc<dyn ObjectStore>,
    client_builder: Arc<dyn AcmeClientBuilder>,
    client_factory: Arc<SharedClientFactory>,
    queue: RateLimitedQueue,
    account_key_bits: usize,
}

impl AccountController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client_builder: Arc<dyn AcmeClientBuilder>,
        client_factory: Arc<SharedClientFactory>,
    ) -> Self {
        Self {
            store,
            client_builder,
            client_factory,
            queue: RateLimitedQueue::new(),
            account_key_bits: DEFAULT_RSA_KEY_BITS,
        }
    }

    /// Override the account key size. Tests shrink it to keep key
    /// generation fast.
    pub fn with_account_key_bits(mut self, bits: usize) -> Self {
        self.account_key_bits = bits;
        self
    }

    pub fn queue(&self) -> &RateLimitedQueue {
        &self.queue
    }

    /// Run the reconciler until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) {
        info!(workers, "Starting account controller");

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
                                warn!(missed, "Account watch stream lagged; waiting for resync");
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

        info!("Shutting down account controller");
        self.queue.shut_down();
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = watch_task.await;
    }

    async fn worker_loop(&self, worker: usize) {
        while let Some(key) = self.queue.next().await {
            match AssertUnwindSafe(self.sync(&key)).catch_unwind().await {
                Ok(Ok(())) => self.queue.forget(&key),
                Ok(Err(err)) => {
                    // Account reconciliation retries indefinitely.
                    warn!(key = %key, error = %err, "Error syncing account");
                    self.queue.add_rate_limited(&key);
                }
                Err(_) => {
                    error!(worker, key = %key, "Recovered from panic in account handler");
                }
            }
            self.queue.done(&key);
        }
        debug!(worker, "Account worker stopped");
    }

    async fn observe(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(Object::Config(config))
            | WatchEvent::Deleted(Object::Config(config)) => {
                self.maybe_enqueue_config(&config);
            }
            WatchEvent::Updated {
                new: Object::Config(config),
                ..
            } => {
                self.maybe_enqueue_config(&config);
            }
            WatchEvent::Deleted(Object::Secret(secret)) => {
                self.enqueue_configs_for_secret(&secret.meta).await;
            }
            // The controller only provisions missing secrets, so secret
            // mutations are irrelevant; only deletions matter.
            _ => {}
        }
    }

    fn maybe_enqueue_config(&self, config: &ConfigObject) {
        if !config.meta.has_label(api::ACCOUNT_LABEL, api::LABEL_TRUE) {
            trace!(config = %config.meta.key(), "Skipping unlabeled config object");
            return;
        }
        self.queue.add(&config.meta.key());
    }

    /// Fan a secret deletion out to every issuer config whose credentials
    /// secret carries that name.
    async fn enqueue_configs_for_secret(&self, secret_meta: &Meta) {
        let configs = match self
            .store
            .list_configs(&secret_meta.namespace, api::ACCOUNT_LABEL, api::LABEL_TRUE)
            .await
        {
            Ok(configs) => configs,
            Err(err) => {
                warn!(error = %err, "Can't list issuer configs for deleted secret");
                return;
            }
        };

        for config in configs {
            let Some(raw) = config.data.get(api::ISSUER_DATA_KEY) else {
                warn!(
                    config = %config.meta.key(),
                    "Config object matches the issuer selector but is missing key {:?}",
                    api::ISSUER_DATA_KEY
                );
                continue;
            };
            let issuer: CertIssuer = match serde_yaml::from_str(raw) {
                Ok(issuer) => issuer,
                Err(err) => {
                    warn!(config = %config.meta.key(), error = %err, "Config object contains an invalid issuer document");
                    continue;
                }
            };
            match issuer.issuer_type {
                IssuerType::Acme => {
                    let Some(acme) = issuer.acme else { continue };
                    let mut secret_name = acme.account_credentials_secret_name;
                    if secret_name.is_empty() {
                        secret_name = config.meta.name.clone();
                    }
                    if secret_name == secret_meta.name {
                        self.queue.add(&config.meta.key());
                    }
                }
                IssuerType::Unknown => continue,
            }
        }
    }

    /// The business logic for one issuer config key.
    pub async fn sync(&self, key: &str) -> Result<(), AccountError> {
        debug!(key = %key, "Started syncing account");
        let result = self.sync_inner(key).await;
        debug!(key = %key, "Finished syncing account");
        result
    }

    async fn sync_inner(&self, key: &str) -> Result<(), AccountError> {
        let Some((namespace, name)) = split_key(key) else {
            return Err(AccountError::InvalidKey(key.to_string()));
        };

        let config = match self.store.get_config(namespace, name).await {
            Ok(config) => config,
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Config object doesn't exist anymore");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Don't act on objects that are being deleted.
        if config.meta.deletion_timestamp.is_some() {
            return Ok(());
        }

        let Some(raw_issuer) = config.data.get(api::ISSUER_DATA_KEY) else {
            return Err(AccountError::Config {
                key: key.to_string(),
                reason: format!(
                    "matches the issuer selector but is missing key {:?}",
                    api::ISSUER_DATA_KEY
                ),
            });
        };

        let mut issuer: CertIssuer =
            serde_yaml::from_str(raw_issuer).map_err(|e| AccountError::Config {
                key: key.to_string(),
                reason: format!("contains an invalid issuer document: {e}"),
            })?;

        match issuer.issuer_type {
            IssuerType::Acme => {}
            IssuerType::Unknown => return Ok(()),
        }

        let Some(mut acme_issuer) = issuer.acme.take() else {
            return Err(AccountError::Config {
                key: key.to_string(),
                reason: "acme issuer is missing its acme section".to_string(),
            });
        };

        if acme_issuer.account_credentials_secret_name.is_empty() {
            acme_issuer.account_credentials_secret_name = config.meta.name.clone();
        }
        let secret_name = acme_issuer.account_credentials_secret_name.clone();

        let existing_secret = match self.store.get_secret(namespace, &secret_name).await {
            Ok(secret) => Some(secret),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let account: AccountInfo;
        match existing_secret {
            None => {
                // Register a new account.
                let account_key = cert::generate_rsa_key(self.account_key_bits)?;
                let key_pem = cert::encode_key_pkcs1_pem(&account_key)?;

                let client = self
                    .client_builder
                    .build(&acme_issuer.directory_url, account_key);

                accept_terms(&acme_issuer.directory_url);
                account = with_deadline(
                    "account registration",
                    client.register(&acme_issuer.account.contacts, true),
                )
                .await?;
                info!(key = %key, account = %account.uri, "Registered ACME account");

                let secret = Secret {
                    meta: Meta::named(namespace, &secret_name),
                    secret_type: SecretType::Opaque,
                    data: [(api::TLS_KEY_DATA_KEY.to_string(), key_pem.into_bytes())]
                        .into_iter()
                        .collect(),
                };
                self.store.create_secret(secret).await?;

                self.client_factory.publish(client);
            }
            Some(secret) => {
                let key_bytes =
                    secret
                        .data
                        .get(api::TLS_KEY_DATA_KEY)
                        .ok_or_else(|| AccountError::Config {
                            key: key.to_string(),
                            reason: format!(
                                "credentials secret {namespace}/{secret_name} is missing key {:?}",
                                api::TLS_KEY_DATA_KEY
                            ),
                        })?;
                let key_pem =
                    std::str::from_utf8(key_bytes).map_err(|_| AccountError::Config {
                        key: key.to_string(),
                        reason: format!(
                            "credentials secret {namespace}/{secret_name} holds a non-UTF-8 key"
                        ),
                    })?;
                let account_key = cert::decode_key_pkcs1_pem(key_pem)?;

                let client = self
                    .client_builder
                    .build(&acme_issuer.directory_url, account_key);

                let contacts_hash = api::hash_contacts(&acme_issuer.account.contacts);
                if contacts_hash != acme_issuer.account.status.hash {
                    // The operator edited the contact list; push it to
                    // the CA.
                    account = with_deadline(
                        "account update",
                        client.update_registration(&acme_issuer.account.contacts),
                    )
                    .await?;
                    info!(key = %key, account = %account.uri, "Updated ACME account contacts");
                } else if acme_issuer.account.status.uri.is_empty() {
                    // Pre-existing account with no recorded URI; recover
                    // the server-assigned state.
                    account = with_deadline("account recovery", client.get_registration()).await?;
                    info!(key = %key, account = %account.uri, "Recovered ACME account");
                } else {
                    // Nothing changed; no RPC.
                    account = AccountInfo {
                        uri: acme_issuer.account.status.uri.clone(),
                        contacts: acme_issuer.account.contacts.clone(),
                        orders_url: acme_issuer.account.status.orders_url.clone(),
                        status: acme_issuer.account.status.account_status.clone(),
                    };
                }

                self.client_factory.publish(client);
            }
        }

        acme_issuer.account.status.uri = account.uri;
        acme_issuer.account.contacts = account.contacts;
        acme_issuer.account.status.orders_url = account.orders_url;
        acme_issuer.account.status.account_status = account.status;
        acme_issuer.account.status.hash = api::hash_contacts(&acme_issuer.account.contacts);

        issuer.acme = Some(acme_issuer);
        let serialized = serde_yaml::to_string(&issuer).map_err(|e| AccountError::Config {
            key: key.to_string(),
            reason: format!("can't encode issuer document: {e}"),
        })?;

        // Write back only on an actual change.
        if config.data.get(api::ISSUER_DATA_KEY) == Some(&serialized) {
            return Ok(());
        }

        let mut updated = config.clone();
        updated
            .data
            .insert(api::ISSUER_DATA_KEY.to_string(), serialized);
        self.store.update_config(updated).await?;

        Ok(())
    }
}

async fn with_deadline<T>(
    what: &'static str,
    call: impl std::future::Future<Output = Result<T, AcmeError>>,
) -> Result<T, AccountError> {
    match tokio::time::timeout(ACCOUNT_TIMEOUT, call).await {
        Ok(result) => result.map_err(AccountError::from),
        Err(_) => Err(AccountError::DeadlineExceeded(what)),
    }
}
