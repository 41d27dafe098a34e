//! Wire surface shared with operators.
//!
//! Label and annotation names, the issuer configuration document, and the
//! provisioning status blob. These names are load-bearing: operators
//! select on the labels and read the annotation, so changing them is a
//! breaking change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

/// Label opting an endpoint into certificate management.
pub const MANAGED_LABEL: &str = "acme.warden.dev/managed";

/// Label marking a config object as an issuer configuration.
pub const ACCOUNT_LABEL: &str = "acme.warden.dev/cert-issuer";

/// Label marking ephemeral challenge-responder artifacts.
pub const TEMPORARY_LABEL: &str = "acme.warden.dev/temporary";

/// Endpoint annotation holding the provisioning status JSON.
pub const STATUS_ANNOTATION: &str = "acme.warden.dev/status";

/// Value carried by the boolean-ish labels above.
pub const LABEL_TRUE: &str = "true";

/// Data key of the issuer document inside a config object.
pub const ISSUER_DATA_KEY: &str = "cert-issuer.yaml";

/// Secret data keys for key material and certificates.
pub const TLS_KEY_DATA_KEY: &str = "tls.key";
pub const TLS_CERT_DATA_KEY: &str = "tls.crt";

/// Issuer protocol discriminator. Unknown tags deserialize to
/// [`IssuerType::Unknown`] and are silently skipped by the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IssuerType {
    Acme,
    #[default]
    Unknown,
}

impl Serialize for IssuerType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IssuerType::Acme => serializer.serialize_str("acme"),
            IssuerType::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for IssuerType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "acme" => IssuerType::Acme,
            _ => IssuerType::Unknown,
        })
    }
}

/// The issuer configuration document stored under [`ISSUER_DATA_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertIssuer {
    #[serde(rename = "type", default)]
    pub issuer_type: IssuerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeCertIssuer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcmeCertIssuer {
    /// ACME directory URL of the CA.
    pub directory_url: String,
    /// Name of the secret holding the account key; defaults to the config
    /// object's own name when empty.
    #[serde(default)]
    pub account_credentials_secret_name: String,
    #[serde(default)]
    pub account: AcmeAccount,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcmeAccount {
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub status: AcmeAccountStatus,
}

/// CA-assigned account state, written back by the account reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcmeAccountStatus {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub orders_url: String,
    #[serde(default)]
    pub account_status: String,
    /// Hash of the contact set at the last reconcile, for change
    /// detection. Stored, not verified.
    #[serde(default)]
    pub hash: String,
}

/// SHA-512 over the stringified contact list, hex-encoded.
pub fn hash_contacts(contacts: &[String]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(format!("{contacts:?}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-endpoint provisioning state, persisted as JSON under
/// [`STATUS_ANNOTATION`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// `None` means no order in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_status: Option<ProvisioningStatus>,
    /// Endpoint generation observed at the last reconcile.
    #[serde(default)]
    pub observed_generation: i64,
}

/// The in-flight order. An empty `order_uri` means "allocate a new order
/// on the next reconcile"; otherwise the URI references an order known to
/// the CA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningStatus {
    #[serde(default)]
    pub order_uri: String,
    /// When the order was allocated; bounds how long we poll it before
    /// declaring it stuck.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Last observed CA-side order status.
    #[serde(default)]
    pub order_status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_contacts_is_stable_and_order_sensitive() {
        let a = vec!["mailto:a@example.com".to_string(), "mailto:b@example.com".to_string()];
        let b = a.clone();
        assert_eq!(hash_contacts(&a), hash_contacts(&b));
        assert_eq!(hash_contacts(&a).len(), 128);

        let reversed: Vec<String> = a.iter().rev().cloned().collect();
        assert_ne!(hash_contacts(&a), hash_contacts(&reversed));
    }

    #[test]
    fn unknown_issuer_type_is_tolerated() {
        let doc = "type: dns-magic\nacme:\n  directory_url: https://ca.example.com/dir\n";
        let issuer: CertIssuer = serde_yaml::from_str(doc).unwrap();
        assert_eq!(issuer.issuer_type, IssuerType::Unknown);
    }

    #[test]
    fn issuer_document_round_trips() {
        let issuer = CertIssuer {
            issuer_type: IssuerType::Acme,
            acme: Some(AcmeCertIssuer {
                directory_url: "https://ca.example.com/dir".to_string(),
                account_credentials_secret_name: String::new(),
                account: AcmeAccount {
                    contacts: vec!["mailto:ops@example.com".to_string()],
                    status: AcmeAccountStatus::default(),
                },
            }),
        };
        let yaml = serde_yaml::to_string(&issuer).unwrap();
        let back: CertIssuer = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, issuer);
    }

    #[test]
    fn status_annotation_defaults_are_empty() {
        let status: Status = serde_json::from_str("{}").unwrap();
        assert!(status.provisioning_status.is_none());
        assert_eq!(status.observed_generation, 0);
    }
}
