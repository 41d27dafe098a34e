//! ACME (RFC 8555) client seam and session sharing.

mod client;
mod factory;

pub use client::{
    AccountInfo, AcmeClient, AcmeClientBuilder, AcmeError, AcmeProblem, Authorization,
    AuthorizationStatus, Challenge, ChallengeStatus, IssuedCertificate, Order, OrderStatus,
    CHALLENGE_TYPE_HTTP01, HTTP01_CHALLENGE_PREFIX,
};
pub use factory::SharedClientFactory;
