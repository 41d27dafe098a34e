//! Shared test fixtures: a stateful fake CA and endpoint builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rsa::RsaPrivateKey;

use warden::acme::{
    AccountInfo, AcmeClient, AcmeClientBuilder, AcmeError, AcmeProblem, Authorization,
    AuthorizationStatus, Challenge, ChallengeStatus, IssuedCertificate, Order, OrderStatus,
    CHALLENGE_TYPE_HTTP01,
};
use warden::api;
use warden::events::RecordingEventSink;
use warden::store::{
    Endpoint, EndpointSpec, EndpointStatus, MemoryStore, Meta, ObjectStore, TlsConfig,
};
use warden::{EndpointController, SharedClientFactory};

/// Key size used throughout the tests; big enough to sign, fast enough
/// to generate.
pub const TEST_KEY_BITS: usize = 1024;

struct FakeOrder {
    order: Order,
    domain: String,
}

#[derive(Default)]
struct CaState {
    counter: u64,
    orders: HashMap<String, FakeOrder>,
    authzs: HashMap<String, Authorization>,
    authz_to_order: HashMap<String, String>,
    account: Option<AccountInfo>,
    calls: Vec<String>,
    /// When set, accepting a challenge validates its whole order.
    auto_validate: bool,
}

/// In-memory CA implementing the [`AcmeClient`] contract. Orders move
/// `pending -> ready -> valid` as the controller drives them; tests can
/// push them into other states directly.
pub struct FakeCa {
    state: Mutex<CaState>,
}

impl FakeCa {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CaState {
                auto_validate: true,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CaState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// All RPC names, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn orders_created(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| *c == "authorize_order")
            .count()
    }

    /// Pretend the CA already knows an account for the key in use.
    pub fn seed_account(&self, account: AccountInfo) {
        self.lock().account = Some(account);
    }

    /// Make the order vanish, as if it expired server-side.
    pub fn remove_order(&self, order_uri: &str) {
        let mut state = self.lock();
        if let Some(removed) = state.orders.remove(order_uri) {
            for authz_url in &removed.order.authorization_urls {
                state.authzs.remove(authz_url);
                state.authz_to_order.remove(authz_url);
            }
        }
    }

    pub fn set_order_status(&self, order_uri: &str, status: OrderStatus) {
        if let Some(fake) = self.lock().orders.get_mut(order_uri) {
            fake.order.status = status;
        }
    }

    pub fn order_uris(&self) -> Vec<String> {
        self.lock().orders.keys().cloned().collect()
    }

    pub fn authz_uris_of(&self, order_uri: &str) -> Vec<String> {
        self.lock()
            .orders
            .get(order_uri)
            .map(|fake| fake.order.authorization_urls.clone())
            .unwrap_or_default()
    }

    /// Fail the authorization the way a CA reports a failed HTTP-01
    /// validation, and invalidate its order.
    pub fn fail_authorization(&self, authz_uri: &str, detail: &str) {
        let mut state = self.lock();
        let order_uri = state.authz_to_order.get(authz_uri).cloned();
        if let Some(authz) = state.authzs.get_mut(authz_uri) {
            authz.status = AuthorizationStatus::Invalid;
            for challenge in &mut authz.challenges {
                challenge.status = ChallengeStatus::Invalid;
                challenge.error = Some(AcmeProblem {
                    problem_type: "urn:ietf:params:acme:error:unauthorized".to_string(),
                    detail: detail.to_string(),
                });
            }
        }
        if let Some(order_uri) = order_uri {
            if let Some(fake) = state.orders.get_mut(&order_uri) {
                fake.order.status = OrderStatus::Invalid;
            }
        }
    }

    fn mint_chain(domain: &str) -> Vec<Vec<u8>> {
        let now = time::OffsetDateTime::now_utc();
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
            .expect("certificate params");
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::days(90);
        let key = rcgen::KeyPair::generate().expect("responder key");
        let cert = params.self_signed(&key).expect("self-signed cert");
        vec![cert.der().to_vec()]
    }
}

#[async_trait]
impl AcmeClient for FakeCa {
    async fn register(
        &self,
        contacts: &[String],
        _terms_agreed: bool,
    ) -> Result<AccountInfo, AcmeError> {
        let mut state = self.lock();
        state.calls.push("register".to_string());
        let account = AccountInfo {
            uri: "https://ca.test/acct/1".to_string(),
            contacts: contacts.to_vec(),
            orders_url: "https://ca.test/acct/1/orders".to_string(),
            status: "valid".to_string(),
        };
        state.account = Some(account.clone());
        Ok(account)
    }

    async fn update_registration(&self, contacts: &[String]) -> Result<AccountInfo, AcmeError> {
        let mut state = self.lock();
        state.calls.push("update_registration".to_string());
        let mut account = state.account.clone().unwrap_or(AccountInfo {
            uri: "https://ca.test/acct/1".to_string(),
            contacts: vec![],
            orders_url: "https://ca.test/acct/1/orders".to_string(),
            status: "valid".to_string(),
        });
        account.contacts = contacts.to_vec();
        state.account = Some(account.clone());
        Ok(account)
    }

    async fn get_registration(&self) -> Result<AccountInfo, AcmeError> {
        let mut state = self.lock();
        state.calls.push("get_registration".to_string());
        state
            .account
            .clone()
            .ok_or_else(|| AcmeError::not_found("no account for key"))
    }

    async fn authorize_order(&self, domain: &str) -> Result<Order, AcmeError> {
        let mut state = self.lock();
        state.calls.push("authorize_order".to_string());
        state.counter += 1;
        let n = state.counter;

        let order_uri = format!("https://ca.test/order/{n}");
        let authz_uri = format!("https://ca.test/authz/{n}");
        let challenge_uri = format!("https://ca.test/challenge/{n}");

        let authz = Authorization {
            uri: authz_uri.clone(),
            status: AuthorizationStatus::Pending,
            identifier: domain.to_string(),
            challenges: vec![Challenge {
                uri: challenge_uri,
                challenge_type: CHALLENGE_TYPE_HTTP01.to_string(),
                status: ChallengeStatus::Pending,
                token: format!("token-{n}"),
                error: None,
            }],
        };

        let order = Order {
            uri: order_uri.clone(),
            status: OrderStatus::Pending,
            authorization_urls: vec![authz_uri.clone()],
            finalize_url: format!("https://ca.test/finalize/{n}"),
            certificate_url: None,
            error: None,
        };

        state.authzs.insert(authz_uri.clone(), authz);
        state.authz_to_order.insert(authz_uri, order_uri.clone());
        state.orders.insert(
            order_uri,
            FakeOrder {
                order: order.clone(),
                domain: domain.to_string(),
            },
        );
        Ok(order)
    }

    async fn get_order(&self, order_uri: &str) -> Result<Order, AcmeError> {
        let mut state = self.lock();
        state.calls.push("get_order".to_string());
        state
            .orders
            .get(order_uri)
            .map(|fake| fake.order.clone())
            .ok_or_else(|| AcmeError::not_found(format!("no such order {order_uri}")))
    }

    async fn get_authorization(&self, authz_uri: &str) -> Result<Authorization, AcmeError> {
        let mut state = self.lock();
        state.calls.push("get_authorization".to_string());
        state
            .authzs
            .get(authz_uri)
            .cloned()
            .ok_or_else(|| AcmeError::not_found(format!("no such authorization {authz_uri}")))
    }

    async fn accept_challenge(&self, challenge_uri: &str) -> Result<Challenge, AcmeError> {
        let mut state = self.lock();
        state.calls.push("accept_challenge".to_string());
        let auto_validate = state.auto_validate;

        let Some((authz_uri, challenge)) = state.authzs.iter_mut().find_map(|(uri, authz)| {
            authz
                .challenges
                .iter_mut()
                .find(|c| c.uri == challenge_uri)
                .map(|c| (uri.clone(), c))
        }) else {
            return Err(AcmeError::not_found(format!(
                "no such challenge {challenge_uri}"
            )));
        };

        if auto_validate {
            challenge.status = ChallengeStatus::Valid;
        } else {
            challenge.status = ChallengeStatus::Processing;
        }
        let accepted = challenge.clone();

        if auto_validate {
            if let Some(authz) = state.authzs.get_mut(&authz_uri) {
                authz.status = AuthorizationStatus::Valid;
            }
            if let Some(order_uri) = state.authz_to_order.get(&authz_uri).cloned() {
                if let Some(fake) = state.orders.get_mut(&order_uri) {
                    fake.order.status = OrderStatus::Ready;
                }
            }
        }

        Ok(accepted)
    }

    async fn finalize_order(
        &self,
        finalize_url: &str,
        _csr_der: &[u8],
    ) -> Result<IssuedCertificate, AcmeError> {
        let mut state = self.lock();
        state.calls.push("finalize_order".to_string());

        let Some((order_uri, domain, status)) = state
            .orders
            .iter()
            .find(|(_, fake)| fake.order.finalize_url == finalize_url)
            .map(|(uri, fake)| (uri.clone(), fake.domain.clone(), fake.order.status.clone()))
        else {
            return Err(AcmeError::not_found(format!(
                "no order with finalize URL {finalize_url}"
            )));
        };

        if !matches!(status, OrderStatus::Ready | OrderStatus::Valid) {
            return Err(AcmeError::Protocol {
                status: 403,
                problem: AcmeProblem {
                    problem_type: "urn:ietf:params:acme:error:orderNotReady".to_string(),
                    detail: format!("order is {status}"),
                },
            });
        }

        let chain = Self::mint_chain(&domain);
        let certificate_url = format!("{order_uri}/certificate");
        if let Some(fake) = state.orders.get_mut(&order_uri) {
            fake.order.status = OrderStatus::Valid;
            fake.order.certificate_url = Some(certificate_url.clone());
        }

        Ok(IssuedCertificate {
            chain_der: chain,
            certificate_url,
        })
    }
}

/// Builder handing out the same fake session for every directory/key.
pub struct FakeCaBuilder {
    ca: Arc<FakeCa>,
}

impl FakeCaBuilder {
    pub fn new(ca: Arc<FakeCa>) -> Arc<Self> {
        Arc::new(Self { ca })
    }
}

impl AcmeClientBuilder for FakeCaBuilder {
    fn build(&self, _directory_url: &str, _account_key: RsaPrivateKey) -> Arc<dyn AcmeClient> {
        self.ca.clone()
    }
}

/// Everything an endpoint reconciliation test needs, wired together.
pub struct Harness {
    pub memory: Arc<MemoryStore>,
    pub store: Arc<dyn ObjectStore>,
    pub ca: Arc<FakeCa>,
    pub factory: Arc<SharedClientFactory>,
    pub events: Arc<RecordingEventSink>,
    pub controller: EndpointController,
}

impl Harness {
    pub fn new(order_timeout: Duration) -> Self {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn ObjectStore> = memory.clone();
        let ca = FakeCa::new();
        let factory = Arc::new(SharedClientFactory::new());
        factory.publish(ca.clone());
        let events = Arc::new(RecordingEventSink::new());

        let controller = EndpointController::new(
            store.clone(),
            factory.clone(),
            events.clone(),
            order_timeout,
        )
        .with_rsa_key_bits(TEST_KEY_BITS);

        Self {
            memory,
            store,
            ca,
            factory,
            events,
            controller,
        }
    }

    pub async fn stored_endpoint(&self, namespace: &str, name: &str) -> Endpoint {
        self.store
            .get_endpoint(namespace, name)
            .await
            .expect("endpoint should exist")
    }

    pub async fn stored_status(&self, namespace: &str, name: &str) -> warden::api::Status {
        let endpoint = self.stored_endpoint(namespace, name).await;
        warden::endpoint::get_status(&endpoint).expect("status should decode")
    }
}

/// A managed, admitted endpoint as the ingress layer would present it.
pub fn managed_endpoint(namespace: &str, name: &str, host: &str) -> Endpoint {
    let mut endpoint = Endpoint {
        meta: Meta::named(namespace, name),
        spec: EndpointSpec {
            host: host.to_string(),
            backend: format!("{name}-svc"),
            ..Default::default()
        },
        status: EndpointStatus { admitted: true },
    };
    endpoint
        .meta
        .set_label(api::MANAGED_LABEL, api::LABEL_TRUE);
    endpoint
}

/// Mint TLS material with the given validity window, host-matched.
pub fn minted_tls(host: &str, not_before_days_ago: i64, not_after_days_ahead: i64) -> TlsConfig {
    let now = time::OffsetDateTime::now_utc();
    let mut params =
        rcgen::CertificateParams::new(vec![host.to_string()]).expect("certificate params");
    params.not_before = now - time::Duration::days(not_before_days_ago);
    params.not_after = now + time::Duration::days(not_after_days_ahead);
    let key = rcgen::KeyPair::generate().expect("key pair");
    let cert = params.self_signed(&key).expect("self-signed cert");
    TlsConfig {
        key: key.serialize_pem(),
        certificate: cert.pem(),
    }
}
