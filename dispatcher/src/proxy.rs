//! Dispatcher addon (C11): the intercepting-proxy binary that, per flow,
//! matches a pending session, invokes the attestor engine under a deadline,
//! and persists the receipt.
//!
//! Grounded almost wholesale on `ElusAegis-ai-passport/proxy-server/src/
//! proxy.rs`: `run_server`, `handle_connection`, `is_hop_by_hop`,
//! `load_certs`/`load_key`/`load_signing_key` are kept as-is; the teacher's
//! single always-on transcript recorder becomes a session-matched,
//! optionally-invoked attestor call (`handle_request` below).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use attestor_core::{AttestorRpcClient, ClaimRequest, WriteRedactionMode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use k256::ecdsa::SigningKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{debug, error, info, warn};

use crate::log_store::LogStore;
use crate::provider_registry::ProviderRegistry;
use crate::session_store::SessionStore;
use crate::tunnel_transport::RustlsTunnelTransport;
use crate::url_matcher;
use crate::worker_pool::WorkerPool;

/// Headers the composer treats as secret by default (§4.C11 step 3):
/// cookies, credentials, and fingerprint-y client headers stay out of the
/// public `parameters` that get hashed into the claim identifier.
const SECRET_HEADER_PREFIXES: &[&str] = &["sec-", "accept"];
const SECRET_HEADER_NAMES: &[&str] = &["cookie", "authorization", "user-agent", "origin", "referer"];
const PUBLIC_HEADER_NAMES: &[&str] = &["host", "connection", "content-length", "content-type"];

fn is_secret_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if PUBLIC_HEADER_NAMES.contains(&lower.as_str()) {
        return false;
    }
    SECRET_HEADER_NAMES.contains(&lower.as_str()) || SECRET_HEADER_PREFIXES.iter().any(|p| lower.starts_with(p))
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen_addr: SocketAddr,
    pub cert_path: String,
    pub key_path: String,
    pub store_dir: std::path::PathBuf,
    pub provider_registry_path: std::path::PathBuf,
    pub match_threshold: f64,
}

pub struct Dispatcher<R: AttestorRpcClient> {
    sessions: SessionStore,
    log: LogStore,
    registry: ProviderRegistry,
    pool: WorkerPool,
    rpc: Arc<R>,
    owner_key: SigningKey,
    match_threshold: f64,
}

impl<R: AttestorRpcClient + 'static> Dispatcher<R> {
    pub fn new(config: &DispatcherConfig, rpc: Arc<R>, owner_key: SigningKey, pool: WorkerPool) -> Result<Self> {
        Ok(Self {
            sessions: SessionStore::new(config.store_dir.join("sessions"), 7)?,
            log: LogStore::new(config.store_dir.join("log"))?,
            registry: ProviderRegistry::load_from_file(&config.provider_registry_path)?,
            pool,
            rpc,
            owner_key,
            match_threshold: config.match_threshold,
        })
    }

    /// §4.C11 steps 1-2: find the oldest pending session whose provider's
    /// URLs score above threshold against `live_url`, locking it for the
    /// remainder of this flow.
    fn match_session(&self, live_url: &str, method: &str) -> Result<Option<(uuid::Uuid, crate::provider_registry::ProviderRule)>> {
        let pending = self.sessions.list_pending()?;
        for session in pending {
            let Some(rule) = self.registry.get(&session.provider_id) else {
                continue;
            };
            if !rule.matches_method(method) {
                continue;
            }
            let matched = rule.urls.iter().any(|candidate| url_matcher::is_match(live_url, candidate, self.match_threshold));
            if matched {
                return Ok(Some((session.id, rule.clone())));
            }
        }
        Ok(None)
    }

    async fn dispatch(
        &self,
        session_id: uuid::Uuid,
        rule: &crate::provider_registry::ProviderRule,
        host: String,
        port: u16,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        body: Option<String>,
    ) -> Result<attestor_core::ClaimOutcome> {
        let (public_headers, secret_headers): (Vec<_>, Vec<_>) = headers.into_iter().partition(|(name, _)| !is_secret_header(name));

        let params = rule.to_params(url, method, body, public_headers);
        let secret = http_provider::SecretParams { headers: secret_headers, ..Default::default() };

        let (request_id, started_at) = self.log.start_request(serde_json::json!({
            "sessionId": session_id,
            "providerId": rule.id,
            "url": params.url,
            "method": params.method,
        }))?;

        let outcome = self.invoke_attestor(rule, &host, port, params, secret).await;

        match outcome {
            Ok(outcome) => {
                self.log.complete_success(
                    request_id,
                    started_at,
                    serde_json::json!({
                        "claim": outcome.claim,
                        "signatures": outcome.signatures.iter().map(hex::encode).collect::<Vec<_>>(),
                        "extractedParameters": outcome.extracted_parameters,
                    }),
                )?;
                self.sessions.mark_finished(session_id, Some(serde_json::json!({ "requestId": request_id })))?;
                Ok(outcome)
            }
            Err(err) => {
                self.log.complete_failure(request_id, started_at, serde_json::json!({ "error": err.to_string() }))?;
                self.sessions.mark_failed(session_id, err.to_string())?;
                Err(err)
            }
        }
    }

    async fn invoke_attestor(
        &self,
        rule: &crate::provider_registry::ProviderRule,
        host: &str,
        port: u16,
        params: http_provider::HttpProviderParams,
        secret: http_provider::SecretParams,
    ) -> Result<attestor_core::ClaimOutcome> {
        self.pool.admit(host, params.body.as_ref().map(|b| b.len()).unwrap_or(0)).map_err(|reason| anyhow::anyhow!("{reason}"))?;

        let host = host.to_string();
        let rpc = self.rpc.clone();
        let owner_key = self.owner_key.clone();
        let rule_id = rule.id.clone();

        // `create_claim_on_attestor`'s retrying entry point expects a
        // synchronous transport factory so it can reconnect between
        // attempts; a real TLS handshake is async, so the dispatcher
        // connects once per worker-pool invocation and calls `run_claim`
        // directly -- a transient-failure retry here means the *next*
        // dispatched flow gets a fresh attempt, not an in-place reconnect.
        self.pool
            .run(move || async move {
                let mut transport = RustlsTunnelTransport::connect(&host, port).await.context("opening origin tunnel")?;
                let request = ClaimRequest {
                    name: rule_id,
                    params,
                    secret,
                    owner_private_key: &owner_key,
                    host,
                    port,
                    context: None,
                    on_step: None,
                    timestamp_s: None,
                    zk_engine: "default".into(),
                    preferred_write_mode: WriteRedactionMode::KeyUpdate,
                };
                attestor_core::run_claim(request, &mut transport, rpc.as_ref()).await
            })
            .await
    }
}

/// TLS-terminating intercepting proxy connection handling, kept near
/// verbatim from the teacher's `proxy-server::proxy` module.
pub async fn run_server<R: AttestorRpcClient + 'static>(config: DispatcherConfig, dispatcher: Arc<Dispatcher<R>>) -> Result<()> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build server TLS config")?;

    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(&config.listen_addr).await?;

    info!("dispatcher proxy listening on {}", config.listen_addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let tls_acceptor = tls_acceptor.clone();
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, tls_acceptor, dispatcher).await {
                error!("connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_connection<R: AttestorRpcClient + 'static>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher<R>>,
) -> Result<()> {
    debug!("new connection from {}", peer_addr);

    let tls_stream = tls_acceptor.accept(stream).await.context("TLS handshake failed")?;

    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(
            TokioIo::new(tls_stream),
            service_fn({
                let dispatcher = dispatcher.clone();
                move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { handle_request(req, dispatcher).await }
                }
            }),
        )
        .await
        .context("HTTP connection error")?;

    debug!("connection closed from {}", peer_addr);
    Ok(())
}

async fn handle_request<R: AttestorRpcClient + 'static>(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher<R>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match handle_flow(req, dispatcher).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!("dispatcher flow error: {}", e);
            Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Full::new(Bytes::from(format!("dispatcher error: {e}"))))
                .unwrap())
        }
    }
}

/// Per-flow: pass the original request/response through unmodified
/// (§4.C11 step 5 -- "by default the original server response is passed
/// through unmodified, and the receipt is stored out-of-band"), attempting
/// an attestation in the background when a pending session matches.
async fn handle_flow<R: AttestorRpcClient + 'static>(req: Request<Incoming>, dispatcher: Arc<Dispatcher<R>>) -> Result<Response<Full<Bytes>>> {
    let host = req.headers().get("host").and_then(|v| v.to_str().ok()).context("missing Host header")?.to_string();

    let method = req.method().to_string();
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();
    let scheme = "https";
    let live_url = format!("{scheme}://{host}{path_and_query}");

    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let body_bytes = req.collect().await?.to_bytes();
    let body = if body_bytes.is_empty() { None } else { Some(String::from_utf8_lossy(&body_bytes).to_string()) };

    let (hostname, port) = parse_host(&host);

    if let Some((session_id, rule)) = dispatcher.match_session(&live_url, &method)? {
        let outcome = dispatcher
            .dispatch(session_id, &rule, hostname.to_string(), port, method.clone(), live_url.clone(), headers.clone(), body.clone())
            .await;
        if let Err(e) = outcome {
            warn!(session_id = %session_id, error = %e, "attestation failed, passing flow through regardless");
        }
    }

    forward_passthrough(&host, &method, &path_and_query, &headers, body_bytes.into()).await
}

async fn forward_passthrough(host: &str, method: &str, path: &str, headers: &[(String, String)], body: Bytes) -> Result<Response<Full<Bytes>>> {
    let (hostname, port) = parse_host(host);

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    let stream = TcpStream::connect((hostname, port)).await.with_context(|| format!("connecting to {hostname}:{port}"))?;
    let server_name: rustls::pki_types::ServerName = hostname.to_string().try_into().context("invalid server name")?;
    let tls_stream = connector.connect(server_name, stream).await.context("backend TLS handshake failed")?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream)).await.context("backend HTTP handshake failed")?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("backend connection closed: {}", e);
        }
    });

    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    let request = builder.body(Full::new(body)).context("building backend request")?;
    let response = sender.send_request(request).await.context("backend request failed")?;

    let status = response.status();
    let resp_headers: Vec<(String, String)> = response.headers().iter().map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string())).collect();
    let resp_body = response.collect().await?.to_bytes();

    let mut resp_builder = Response::builder().status(status);
    for (name, value) in &resp_headers {
        if !is_hop_by_hop(name) {
            resp_builder = resp_builder.header(name.as_str(), value.as_str());
        }
    }
    Ok(resp_builder.body(Full::new(resp_body)).unwrap())
}

fn parse_host(host: &str) -> (&str, u16) {
    match host.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().unwrap_or(443)),
        None => (host, 443),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailers" | "transfer-encoding" | "upgrade"
    )
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {path}"))?;
    rustls_pemfile::certs(&mut std::io::BufReader::new(file)).collect::<Result<Vec<_>, _>>().context("failed to parse certificates")
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {path}"))?;
    let mut reader = std::io::BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => anyhow::bail!("no private key found in {path}"),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_headers_include_cookie_auth_and_sec_prefixed() {
        assert!(is_secret_header("Cookie"));
        assert!(is_secret_header("Authorization"));
        assert!(is_secret_header("Sec-Fetch-Mode"));
        assert!(is_secret_header("User-Agent"));
        assert!(!is_secret_header("Host"));
        assert!(!is_secret_header("Content-Length"));
    }
}
