//! Cluster-level configuration: trust material, options, and connection
//! strings.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::row::{Deserializer, JsonDeserializer};

/// Trust anchors baked in for non-production deployments, selected with the
/// `security.trust_only_non_prod` connection-string parameter.
pub(crate) const NON_PROD_CERTIFICATES: &str = "\
-----BEGIN CERTIFICATE-----
MIIDfTCCAmWgAwIBAgIUG4YZS3zMyt9cW6ATeW3PJfkx6g0wDQYJKoZIhvcNAQEL
BQAwTjELMAkGA1UEBhMCVVMxGDAWBgNVBAoMD0NvdWNoYmFzZSwgSW5jLjElMCMG
A1UEAwwcQ291Y2hiYXNlIFNlcnZlciBOb24tUHJvZCBDQTAeFw0yNjA4MDEwODI1
NDZaFw0zNjA3MjkwODI1NDZaME4xCzAJBgNVBAYTAlVTMRgwFgYDVQQKDA9Db3Vj
aGJhc2UsIEluYy4xJTAjBgNVBAMMHENvdWNoYmFzZSBTZXJ2ZXIgTm9uLVByb2Qg
Q0EwggEiMA0GCSqGSIb3DQEBAQUAA4IBDwAwggEKAoIBAQDJJdchamOXOJ9kWNIC
DiYYAf0eWtGcEFmwcbnDupbxrk9ZKb1c4nlf176UlCa7coCbV0BzRSwz/iiddKin
nLFEyTFrq97glGpMyC+svVFj4/Nwtc2yjN3YgrxouMZU3ODZVdGe5fujDnOma9HS
G3GB1KQpGVJPTmj37kb/XZSBUmpLp6lSV2DcRDVQT9sETQvVda/I8QOKNPZ8YUvZ
Fh/1+SjR6/0zYG7HxIz6QPXVv++lgHKZdLFgZoDwhPmndQrIuM7zjYwZQuklXyKd
L4j2hcQS7tqI4CXbwhJjlBG4wq/0JePYFEVACpg2ZZ9x7Y/vvVBkHE1zloFFZbpN
gzylAgMBAAGjUzBRMB0GA1UdDgQWBBQU9Wye6W01Gwu57uBoh0lIlFUO/jAfBgNV
HSMEGDAWgBQU9Wye6W01Gwu57uBoh0lIlFUO/jAPBgNVHRMBAf8EBTADAQH/MA0G
CSqGSIb3DQEBCwUAA4IBAQBP+lFu2MJJ7f35YigldKldriU8ZZtBsDHTldFvnEr2
Btc1ZnRimUnR/3iZ4HRV1slkTJ4yTiSIM3gRCh8HZpnPXjK/uXIicUVWJN+O4OIG
kOkEXqEgBk+yd0G2tOtN+ROBUJTaOaHpdN57uSJA5niICvTBB6ilbswnBCcG5OT0
i/6J/crCNARTq50MFjyRPfdIzn1qAnXYzd0CUXRaEC4VFrLhuE/snIhg5j0hKsq7
zM6ycvIKzQm1mm7G7wbtnXFxOtkw/6cwwTESygyhnq/P4gnEbN8SEOoUnPEPwJJi
FhH93a1v2KyLRLp57dHjJBj2oypZjyHSf5KslDkYmZHO
-----END CERTIFICATE-----
";

/// Exclusive selector of how server certificates are verified.
#[derive(Debug, Clone)]
pub enum TrustSource {
    /// Only the given PEM-encoded certificate(s) are trusted.
    Pem(String),
    /// Only the baked-in non-production certificates are trusted.
    OnlyNonProd,
    /// The bundled webpki trust anchors, i.e. the public web PKI.
    System,
    /// No verification at all. Never use this outside local development.
    Insecure,
}

/// Cluster-wide settings, frozen at connect time.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub(crate) timeout: Duration,
    pub(crate) trust: TrustSource,
    pub(crate) deserializer: Arc<dyn Deserializer>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            timeout: Duration::from_secs(75),
            trust: TrustSource::System,
            deserializer: Arc::new(JsonDeserializer),
        }
    }
}

impl ClusterOptions {
    pub fn new() -> Self {
        ClusterOptions::default()
    }

    /// Default timeout for queries that do not set their own.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn trust_source(mut self, trust: TrustSource) -> Self {
        self.trust = trust;
        self
    }

    /// Cluster-wide row deserializer; individual queries may override it.
    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }
}

/// Parse the connection string and fold its query parameters into
/// `options`. Returns the bare endpoint URL.
///
/// The accepted form is an `https` URL with no userinfo and no non-root
/// path. Parameters use snake_case keys; the last `security.trust_*`
/// parameter wins.
pub(crate) fn apply_connection_string(
    connection_string: &str,
    options: &mut ClusterOptions,
) -> Result<Url> {
    let url = Url::parse(connection_string)
        .map_err(|e| Error::invalid_argument(format!("malformed connection string: {e}")))?;

    if url.scheme() != "https" {
        return Err(Error::invalid_argument(format!(
            "connection string scheme must be https, got {:?}",
            url.scheme()
        )));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(Error::invalid_argument(
            "connection string must not carry userinfo; pass a Credential instead",
        ));
    }
    if !matches!(url.path(), "" | "/") {
        return Err(Error::invalid_argument(format!(
            "connection string must not have a path, got {:?}",
            url.path()
        )));
    }

    for (key, value) in url.query_pairs() {
        match &*key {
            "timeout" => {
                options.timeout = humantime::parse_duration(&value).map_err(|e| {
                    Error::invalid_argument(format!("bad timeout parameter {value:?}: {e}"))
                })?;
            }
            "security.trust_only_pem_file" => {
                let pem = std::fs::read_to_string(&*value).map_err(|e| {
                    Error::invalid_argument(format!("unreadable PEM file {value:?}: {e}"))
                })?;
                options.trust = TrustSource::Pem(pem);
            }
            "security.trust_only_pem_string" => {
                options.trust = TrustSource::Pem(value.into_owned());
            }
            "security.trust_only_non_prod" => match &*value {
                "" | "true" | "1" => options.trust = TrustSource::OnlyNonProd,
                other => {
                    return Err(Error::invalid_argument(format!(
                        "security.trust_only_non_prod accepts \"\", \"true\" or \"1\", got {other:?}"
                    )));
                }
            },
            "security.disable_server_certificate_verification" => match &*value {
                "true" | "1" => options.trust = TrustSource::Insecure,
                "false" | "0" => {}
                other => {
                    return Err(Error::invalid_argument(format!(
                        "security.disable_server_certificate_verification must be a \
                         boolean, got {other:?}"
                    )));
                }
            },
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown connection string parameter {other:?}"
                )));
            }
        }
    }

    let mut endpoint = url;
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    Ok(endpoint)
}
