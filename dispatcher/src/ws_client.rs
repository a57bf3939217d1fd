//! WebSocket `AttestorRpcClient` (§6): the dispatcher's client-side
//! connection to an `attestor-server` process, keyed by URL per §5 ("the
//! WebSocket attestor-client pool is keyed by URL").

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use attestor_core::rpc::{ClaimTunnelRequest, ClaimTunnelResponse, RpcMessage, ToprfRequest, ToprfResponse};
use attestor_core::AttestorRpcClient;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One WebSocket connection to an attestor, demultiplexing concurrent
/// `claimTunnel` calls by holding the whole socket under a mutex -- simple
/// and correct for the common case of a handful of concurrent tunnels per
/// socket (§5 "multiple tunnels share one socket... concurrent tunnels on
/// one socket are safe").
pub struct WsAttestorClient {
    socket: Mutex<WsStream>,
}

impl WsAttestorClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _response) = tokio_tungstenite::connect_async(url).await.with_context(|| format!("connecting to attestor at {url}"))?;
        let mut socket = socket;

        // The opening `init` handshake: consume it so later RPC round
        // trips don't have to distinguish it from a claimTunnel reply.
        if let Some(Ok(Message::Text(text))) = socket.next().await {
            match serde_json::from_str::<RpcMessage>(&text) {
                Ok(RpcMessage::InitResponse(_)) => {}
                Ok(other) => bail!("expected InitResponse as the first attestor message, got {other:?}"),
                Err(e) => bail!("attestor sent an unparseable init message: {e}"),
            }
        } else {
            bail!("attestor closed the connection before sending init");
        }

        Ok(Self { socket: Mutex::new(socket) })
    }
}

#[async_trait]
impl AttestorRpcClient for WsAttestorClient {
    async fn claim_tunnel(&self, request: ClaimTunnelRequest) -> Result<ClaimTunnelResponse> {
        let mut socket = self.socket.lock().await;
        let outbound = RpcMessage::ClaimTunnel(Box::new(request));
        socket.send(Message::Text(serde_json::to_string(&outbound)?)).await.context("sending claimTunnel RPC")?;

        loop {
            let Some(msg) = socket.next().await else {
                bail!("attestor closed the connection while awaiting claimTunnel response");
            };
            let Message::Text(text) = msg.context("WebSocket read error")? else {
                continue;
            };
            match serde_json::from_str::<RpcMessage>(&text)? {
                RpcMessage::ClaimTunnelResponse(response) => return Ok(*response),
                _ => continue,
            }
        }
    }

    async fn toprf(&self, request: ToprfRequest) -> Result<ToprfResponse> {
        let mut socket = self.socket.lock().await;
        let outbound = RpcMessage::Toprf(request);
        socket.send(Message::Text(serde_json::to_string(&outbound)?)).await.context("sending toprf RPC")?;

        loop {
            let Some(msg) = socket.next().await else {
                bail!("attestor closed the connection while awaiting toprf response");
            };
            let Message::Text(text) = msg.context("WebSocket read error")? else {
                continue;
            };
            match serde_json::from_str::<RpcMessage>(&text)? {
                RpcMessage::ToprfResponse(response) => return Ok(response),
                _ => continue,
            }
        }
    }
}

/// A pool of [`WsAttestorClient`]s keyed by URL, so multiple tunnels to the
/// same attestor endpoint share one socket instead of opening a new
/// connection per flow.
#[derive(Default)]
pub struct AttestorClientPool {
    clients: Mutex<HashMap<String, Arc<WsAttestorClient>>>,
}

impl AttestorClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_connect(&self, url: &str) -> Result<Arc<WsAttestorClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(url) {
            return Ok(existing.clone());
        }
        let client = Arc::new(WsAttestorClient::connect(url).await?);
        clients.insert(url.to_string(), client.clone());
        Ok(client)
    }
}
