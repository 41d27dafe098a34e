//! Shared ACME session hand-off between the two reconcilers.
//!
//! The endpoint reconciler may start before the account reconciler has
//! registered anything; its workers park on [`SharedClientFactory::client`]
//! until a session is published. The caller is expected to bound the wait
//! with its own deadline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::client::AcmeClient;

/// Publishes the account-bound ACME session to anyone waiting on it.
pub struct SharedClientFactory {
    tx: watch::Sender<Option<Arc<dyn AcmeClient>>>,
}

impl SharedClientFactory {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Make a session available. Replaces any previously published one;
    /// waiters and future callers see the newest session.
    pub fn publish(&self, client: Arc<dyn AcmeClient>) {
        debug!("Publishing ACME client session");
        let _ = self.tx.send(Some(client));
    }

    /// The current session without waiting.
    pub fn try_client(&self) -> Option<Arc<dyn AcmeClient>> {
        self.tx.borrow().clone()
    }

    /// Wait until a session is available.
    pub async fn client(&self) -> Arc<dyn AcmeClient> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(client) = rx.borrow_and_update().clone() {
                return client;
            }
            // The sender lives in `self`, so `changed` only fails if the
            // factory is dropped mid-wait; looping keeps the contract.
            let _ = rx.changed().await;
        }
    }
}

impl Default for SharedClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::super::client::*;
    use super::*;

    struct NullClient;

    #[async_trait]
    impl AcmeClient for NullClient {
        async fn register(&self, _: &[String], _: bool) -> Result<AccountInfo, AcmeError> {
            Ok(AccountInfo::default())
        }
        async fn update_registration(&self, _: &[String]) -> Result<AccountInfo, AcmeError> {
            Ok(AccountInfo::default())
        }
        async fn get_registration(&self) -> Result<AccountInfo, AcmeError> {
            Ok(AccountInfo::default())
        }
        async fn authorize_order(&self, _: &str) -> Result<Order, AcmeError> {
            Err(AcmeError::Transport("null".to_string()))
        }
        async fn get_order(&self, _: &str) -> Result<Order, AcmeError> {
            Err(AcmeError::Transport("null".to_string()))
        }
        async fn get_authorization(&self, _: &str) -> Result<Authorization, AcmeError> {
            Err(AcmeError::Transport("null".to_string()))
        }
        async fn accept_challenge(&self, _: &str) -> Result<Challenge, AcmeError> {
            Err(AcmeError::Transport("null".to_string()))
        }
        async fn finalize_order(&self, _: &str, _: &[u8]) -> Result<IssuedCertificate, AcmeError> {
            Err(AcmeError::Transport("null".to_string()))
        }
    }

    #[tokio::test]
    async fn callers_block_until_published() {
        let factory = Arc::new(SharedClientFactory::new());
        assert!(factory.try_client().is_none());

        let waiter = {
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { factory.client().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        factory.publish(Arc::new(NullClient));
        let client = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(client.get_registration().await.is_ok());
    }

    #[tokio::test]
    async fn published_session_is_immediately_available() {
        let factory = SharedClientFactory::new();
        factory.publish(Arc::new(NullClient));
        assert!(factory.try_client().is_some());
        let _client = factory.client().await;
    }
}
