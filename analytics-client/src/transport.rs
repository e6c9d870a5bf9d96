//! Pluggable HTTP transport and the default reqwest-based implementation.
//!
//! The executor only ever talks to [`HttpTransport`]; tests and alternative
//! stacks plug in their own. The default [`ReqwestTransport`] speaks
//! HTTP/1.1 over TLS 1.3 with a pooled client and a shuffling DNS resolver
//! for simple client-side load spreading.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use reqwest::header;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::config::TrustSource;
use crate::credentials::Credential;
use crate::error::{Error, Result};

/// Path of the analytics query service.
pub(crate) const ANALYTICS_PATH: &str = "/api/v1/request";

/// One dispatched request.
pub struct TransportRequest {
    /// JSON request body.
    pub body: Bytes,
    /// Pre-rendered Authorization header, absent for mutual TLS.
    pub authorization: Option<String>,
    /// Bounds connect plus total body read for this attempt.
    pub timeout: Duration,
}

/// Response status plus the body as a stream of chunks. The body must not
/// require buffering in full.
pub struct TransportResponse {
    pub status: u16,
    pub body: BodyStream,
}

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Contract between the executor and the HTTP/TLS layer.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST the request to the analytics endpoint. Must return promptly
    /// with [`Error::Cancelled`] when `cancel` fires mid-flight, and
    /// classify timeouts and TLS failures per the crate error taxonomy.
    async fn execute(
        &self,
        request: TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse>;

    /// Drop all idle pooled connections. Called after failures that may
    /// indicate a degraded server node.
    fn evict_pooled_connections(&self);
}

/// Process-wide User-Agent: product token, runtime descriptors, and a
/// per-process instance id (RFC 7231 §5.5.3).
pub(crate) fn user_agent() -> &'static str {
    static USER_AGENT: Lazy<String> = Lazy::new(|| {
        format!(
            "{}/{} (rust; {}; {}) {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
            Uuid::new_v4(),
        )
    });
    &USER_AGENT
}

/// Everything needed to (re)build the underlying client. Kept around so
/// that pool eviction can swap in a fresh client with identical TLS
/// material.
#[derive(Clone)]
struct ClientMaterial {
    trust: TrustSource,
    client_identity: Option<(String, String)>,
}

/// Default transport: a pooled reqwest client over rustls.
pub struct ReqwestTransport {
    url: Url,
    client: ArcSwap<reqwest::Client>,
    material: ClientMaterial,
}

impl ReqwestTransport {
    pub fn new(endpoint: &Url, trust: TrustSource, credential: &Credential) -> Result<Self> {
        let url = endpoint
            .join(ANALYTICS_PATH)
            .map_err(|e| Error::invalid_argument(format!("unusable endpoint url: {e}")))?;
        let material = ClientMaterial {
            trust,
            client_identity: credential.tls_identity()?,
        };
        let client = build_client(&material)?;
        Ok(ReqwestTransport {
            url,
            client: ArcSwap::from_pointee(client),
            material,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse> {
        let client = self.client.load_full();
        let mut builder = client
            .post(self.url.clone())
            .timeout(request.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, user_agent())
            .body(request.body);
        if let Some(authorization) = request.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = builder.send() => response.map_err(classify_reqwest_error)?,
        };

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_reqwest_error));
        Ok(TransportResponse {
            status,
            body: Box::pin(body),
        })
    }

    fn evict_pooled_connections(&self) {
        // reqwest exposes no way to poison a single pooled socket, so the
        // whole idle pool goes: a fresh client is swapped in and the old
        // pool drains as in-flight requests complete.
        match build_client(&self.material) {
            Ok(fresh) => {
                self.client.store(Arc::new(fresh));
                tracing::debug!("evicted pooled analytics connections");
            }
            Err(e) => tracing::warn!("failed to rebuild analytics HTTP client: {e}"),
        }
    }
}

fn build_client(material: &ClientMaterial) -> Result<reqwest::Client> {
    let tls = rustls_client_config(material)?;
    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .http1_only()
        .dns_resolver(Arc::new(ShufflingResolver))
        .build()
        .map_err(Error::transport)
}

/// TLS 1.3 only, AEAD suites only.
fn rustls_client_config(material: &ClientMaterial) -> Result<rustls::ClientConfig> {
    let suites = [
        rustls::cipher_suite::TLS13_AES_256_GCM_SHA384,
        rustls::cipher_suite::TLS13_AES_128_GCM_SHA256,
        rustls::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ];
    let builder = rustls::ClientConfig::builder()
        .with_cipher_suites(&suites)
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::invalid_argument(format!("unusable TLS configuration: {e}")))?;

    match &material.trust {
        TrustSource::Insecure => {
            let builder = builder.with_custom_certificate_verifier(Arc::new(DisabledVerifier));
            match &material.client_identity {
                Some((certificate_pem, key_pem)) => {
                    let chain = pem_certificates(certificate_pem)?;
                    let key = pem_private_key(key_pem)?;
                    builder.with_client_auth_cert(chain, key).map_err(|e| {
                        Error::invalid_argument(format!("invalid client certificate: {e}"))
                    })
                }
                None => Ok(builder.with_no_client_auth()),
            }
        }
        trust => {
            let mut roots = rustls::RootCertStore::empty();
            match trust {
                TrustSource::Pem(pem) => {
                    for cert in pem_certificates(pem)? {
                        roots
                            .add(&cert)
                            .map_err(|e| Error::invalid_argument(format!("bad trust anchor: {e}")))?;
                    }
                }
                TrustSource::OnlyNonProd => {
                    for cert in pem_certificates(crate::config::NON_PROD_CERTIFICATES)? {
                        roots
                            .add(&cert)
                            .map_err(|e| Error::invalid_argument(format!("bad trust anchor: {e}")))?;
                    }
                }
                TrustSource::System => {
                    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                            ta.subject,
                            ta.spki,
                            ta.name_constraints,
                        )
                    }));
                }
                TrustSource::Insecure => unreachable!("handled above"),
            }
            let builder = builder.with_root_certificates(roots);
            match &material.client_identity {
                Some((certificate_pem, key_pem)) => {
                    let chain = pem_certificates(certificate_pem)?;
                    let key = pem_private_key(key_pem)?;
                    builder.with_client_auth_cert(chain, key).map_err(|e| {
                        Error::invalid_argument(format!("invalid client certificate: {e}"))
                    })
                }
                None => Ok(builder.with_no_client_auth()),
            }
        }
    }
}

fn pem_certificates(pem: &str) -> Result<Vec<rustls::Certificate>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::invalid_argument(format!("undecodable PEM certificate: {e}")))?;
    if certs.is_empty() {
        return Err(Error::invalid_argument(
            "PEM input contains no certificates",
        ));
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn pem_private_key(pem: &str) -> Result<rustls::PrivateKey> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::invalid_argument(format!("undecodable PEM key: {e}")))?
        {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
            Some(_) => continue,
            None => {
                return Err(Error::invalid_argument("PEM input contains no private key"));
            }
        }
    }
}

/// Used for [`TrustSource::Insecure`]: accepts whatever the server
/// presents.
struct DisabledVerifier;

impl rustls::client::ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Shuffles resolved addresses so repeated connects spread across the
/// endpoint's A records.
struct ShufflingResolver;

impl reqwest::dns::Resolve for ShufflingResolver {
    fn resolve(&self, name: hyper::client::connect::dns::Name) -> reqwest::dns::Resolving {
        Box::pin(async move {
            let mut addrs: Vec<SocketAddr> =
                tokio::net::lookup_host((name.as_str(), 0)).await?.collect();
            addrs.shuffle(&mut rand::thread_rng());
            let addrs: reqwest::dns::Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        return Error::Timeout { last_error: None };
    }
    if is_tls_handshake(&e) {
        return Error::TlsHandshake {
            guidance: "the server certificate could not be verified; check that the cluster's \
                       TrustSource covers the certificate chain the endpoint presents \
                       (non-prod deployments usually need trust_only_non_prod or an explicit \
                       PEM trust anchor)"
                .to_owned(),
            source: Some(Box::new(e)),
        };
    }
    Error::transport(e)
}

fn is_tls_handshake(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        if inner.is::<rustls::Error>() {
            return true;
        }
        let rendered = inner.to_string();
        if rendered.contains("certificate") || rendered.contains("handshake") {
            return true;
        }
        source = inner.source();
    }
    false
}
