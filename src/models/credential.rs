//! Represents an uploaded Google service-account key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Value the `type` field of a service-account key must carry.
pub const SERVICE_ACCOUNT_TYPE: &str = "service_account";

/// Fields every uploaded key must contain, checked in this order.
pub const REQUIRED_FIELDS: [&str; 5] = [
    "type",
    "project_id",
    "private_key_id",
    "private_key",
    "client_email",
];

/// A service-account key as issued by Google Cloud.
///
/// Only the identity fields are typed. Everything else in the issued JSON
/// (`client_id`, `auth_uri`, certificate URLs, ...) is kept in `extra` so the
/// stored document matches what was uploaded.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct ServiceAccount {
    /// Identity type marker, always [`SERVICE_ACCOUNT_TYPE`] once validated.
    #[serde(rename = "type")]
    pub account_type: String,

    /// Google Cloud project the account belongs to.
    pub project_id: String,

    /// Identifier of the signing key.
    pub private_key_id: String,

    /// PEM-encoded RSA private key.
    pub private_key: String,

    /// Unique account email, used as the JWT issuer.
    pub client_email: String,

    /// OAuth token endpoint advertised by the key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}
