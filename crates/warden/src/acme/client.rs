//! RFC 8555 client contract.
//!
//! The controllers drive the CA through [`AcmeClient`], a session already
//! bound to a directory URL and account key. The production
//! implementation wraps the host's HTTP/JWS stack; tests use a stateful
//! fake. [`AcmeClientBuilder`] constructs sessions, which is all the
//! account reconciler needs to bootstrap an account that doesn't exist
//! yet.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rsa::RsaPrivateKey;
use thiserror::Error;

/// Well-known path prefix the CA fetches HTTP-01 proofs from.
pub const HTTP01_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Challenge type driven by this controller.
pub const CHALLENGE_TYPE_HTTP01: &str = "http-01";

/// A problem document returned by the CA (RFC 7807).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcmeProblem {
    pub problem_type: String,
    pub detail: String,
}

impl fmt::Display for AcmeProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.problem_type)
        } else {
            write!(f, "{}: {}", self.problem_type, self.detail)
        }
    }
}

#[derive(Debug, Error)]
pub enum AcmeError {
    /// The CA answered with a problem document.
    #[error("CA returned HTTP {status}: {problem}")]
    Protocol { status: u16, problem: AcmeProblem },

    /// The CA was unreachable or the exchange failed below the protocol.
    #[error("ACME transport error: {0}")]
    Transport(String),
}

impl AcmeError {
    pub fn not_found(detail: impl Into<String>) -> Self {
        AcmeError::Protocol {
            status: 404,
            problem: AcmeProblem {
                problem_type: "urn:ietf:params:acme:error:malformed".to_string(),
                detail: detail.into(),
            },
        }
    }

    /// HTTP status carried by the error, if the CA answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AcmeError::Protocol { status, .. } => Some(*status),
            AcmeError::Transport(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }
}

/// CA-side account state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub uri: String,
    pub contacts: Vec<String>,
    pub orders_url: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Other(String),
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
            OrderStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
    Other(String),
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Revoked => "revoked",
            AuthorizationStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
    Other(String),
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Processing => "processing",
            ChallengeStatus::Valid => "valid",
            ChallengeStatus::Invalid => "invalid",
            ChallengeStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CA-side order (RFC 8555 §7.1.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub uri: String,
    pub status: OrderStatus,
    pub authorization_urls: Vec<String>,
    pub finalize_url: String,
    pub certificate_url: Option<String>,
    pub error: Option<AcmeProblem>,
}

/// A proof-of-control task for one identifier (RFC 8555 §7.1.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub uri: String,
    pub status: AuthorizationStatus,
    /// The DNS identifier this authorization covers.
    pub identifier: String,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// First HTTP-01 challenge, the only type this controller drives.
    pub fn http01_challenge(&self) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == CHALLENGE_TYPE_HTTP01)
    }

    /// Human-readable summary of challenge-level errors, for operator
    /// events on failed authorizations.
    pub fn error_detail(&self) -> String {
        let errors: Vec<String> = self
            .challenges
            .iter()
            .filter_map(|c| c.error.as_ref().map(|e| format!("{}: {e}", c.challenge_type)))
            .collect();
        if errors.is_empty() {
            format!("authorization {} is {}", self.uri, self.status)
        } else {
            errors.join("; ")
        }
    }
}

/// A validation method under an authorization (RFC 8555 §8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub uri: String,
    pub challenge_type: String,
    pub status: ChallengeStatus,
    pub token: String,
    pub error: Option<AcmeProblem>,
}

/// Certificate material returned by order finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// DER certificates, leaf first.
    pub chain_der: Vec<Vec<u8>>,
    /// Where the CA serves the certificate.
    pub certificate_url: String,
}

/// An ACME session bound to a directory URL and account key.
///
/// Implementations must be safe for concurrent use: endpoint workers
/// share one session across keys.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Create the account, or return the existing one for this key.
    /// Idempotent at the CA.
    async fn register(
        &self,
        contacts: &[String],
        terms_agreed: bool,
    ) -> Result<AccountInfo, AcmeError>;

    /// Push the contact list to the CA.
    async fn update_registration(&self, contacts: &[String]) -> Result<AccountInfo, AcmeError>;

    /// Recover the server-assigned account state for this key.
    async fn get_registration(&self) -> Result<AccountInfo, AcmeError>;

    /// Create a new order for a single DNS identifier.
    async fn authorize_order(&self, domain: &str) -> Result<Order, AcmeError>;

    async fn get_order(&self, order_uri: &str) -> Result<Order, AcmeError>;

    async fn get_authorization(&self, authz_uri: &str) -> Result<Authorization, AcmeError>;

    /// Tell the CA the challenge is ready to be validated.
    async fn accept_challenge(&self, challenge_uri: &str) -> Result<Challenge, AcmeError>;

    /// Path the CA will fetch for an HTTP-01 token.
    fn http01_challenge_path(&self, token: &str) -> String {
        format!("{HTTP01_CHALLENGE_PREFIX}{token}")
    }

    /// Submit the CSR and wait for the certificate to be issued.
    async fn finalize_order(
        &self,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<IssuedCertificate, AcmeError>;
}

/// Constructs [`AcmeClient`] sessions. The account reconciler uses this
/// to bootstrap accounts whose key it just generated.
pub trait AcmeClientBuilder: Send + Sync {
    fn build(&self, directory_url: &str, account_key: RsaPrivateKey) -> Arc<dyn AcmeClient>;
}
