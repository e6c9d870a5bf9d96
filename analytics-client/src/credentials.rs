//! Authentication credentials for the analytics endpoint.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// How the client authenticates.
///
/// Basic credentials become an `Authorization` header; client certificates
/// become TLS key material and send no header at all. [`Credential::dynamic`]
/// re-resolves on every request, which is how short-lived passwords are
/// plugged in.
#[derive(Clone)]
pub enum Credential {
    Basic {
        username: String,
        password: String,
    },
    ClientCertificate {
        certificate_pem: String,
        key_pem: String,
    },
    Dynamic(Arc<dyn Fn() -> Credential + Send + Sync>),
}

/// Guard against suppliers that keep returning suppliers.
const MAX_DYNAMIC_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CredentialTag {
    Basic,
    ClientCertificate,
    Dynamic,
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn client_certificate(
        certificate_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        Credential::ClientCertificate {
            certificate_pem: certificate_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    pub fn dynamic(supplier: impl Fn() -> Credential + Send + Sync + 'static) -> Self {
        Credential::Dynamic(Arc::new(supplier))
    }

    pub(crate) fn tag(&self) -> CredentialTag {
        match self {
            Credential::Basic { .. } => CredentialTag::Basic,
            Credential::ClientCertificate { .. } => CredentialTag::ClientCertificate,
            Credential::Dynamic(_) => CredentialTag::Dynamic,
        }
    }

    /// Follow dynamic suppliers until a concrete variant comes out.
    fn resolved(&self) -> Result<Credential> {
        let mut current = self.clone();
        for _ in 0..MAX_DYNAMIC_DEPTH {
            match current {
                Credential::Dynamic(supplier) => current = supplier(),
                concrete => return Ok(concrete),
            }
        }
        Err(Error::invalid_argument(
            "dynamic credential never resolved to a concrete variant",
        ))
    }

    /// The `Authorization` header for one attempt, if this credential uses
    /// one.
    pub(crate) fn authorization_header(&self) -> Result<Option<String>> {
        match self.resolved()? {
            Credential::Basic { username, password } => {
                let token = base64::encode(format!("{username}:{password}"));
                Ok(Some(format!("Basic {token}")))
            }
            Credential::ClientCertificate { .. } => Ok(None),
            Credential::Dynamic(_) => unreachable!("resolved() returns concrete variants"),
        }
    }

    /// TLS client identity (certificate chain and key PEM), when mutual TLS
    /// is in play. Resolved once at transport construction: key material
    /// cannot be hot-swapped on a live connection pool.
    pub(crate) fn tls_identity(&self) -> Result<Option<(String, String)>> {
        match self.resolved()? {
            Credential::ClientCertificate {
                certificate_pem,
                key_pem,
            } => Ok(Some((certificate_pem, key_pem))),
            _ => Ok(None),
        }
    }
}

// Manually implemented to keep passwords and key material out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::ClientCertificate { .. } => {
                f.debug_struct("ClientCertificate").finish_non_exhaustive()
            }
            Credential::Dynamic(_) => f.debug_struct("Dynamic").finish_non_exhaustive(),
        }
    }
}
