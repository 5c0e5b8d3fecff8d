//! UDP DNS proxy
//!
//! One task per inbound datagram: dial the upstream with a fresh socket,
//! forward the request verbatim, wait for the reply with a fixed deadline,
//! hand the parsed reply to the message handler, then send the raw upstream
//! bytes back to the client.
//!
//! Replies are never re-encoded. Clients expect a bit-exact response
//! (transaction id, compression pointers intact); re-encoding would change
//! the compression layout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::MessageHandler;
use crate::codec;
use crate::error::ProxyError;

/// Maximum DNS payload accepted on the listen path
pub const MAX_UDP_PACKET_SIZE: usize = 4096;

/// Fixed read deadline for the upstream exchange
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// The UDP DNS proxy
pub struct DnsProxy {
    socket: Arc<UdpSocket>,
    upstream: String,
    handler: Option<Arc<dyn MessageHandler>>,
    local_addr: SocketAddr,
}

impl DnsProxy {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::BindError`] when the socket cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        upstream: String,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ProxyError::bind(addr.to_string(), e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ProxyError::bind(addr.to_string(), e.to_string()))?;

        info!(addr = %local_addr, upstream = %upstream, "DNS proxy bound");

        Ok(Self {
            socket: Arc::new(socket),
            upstream,
            handler,
            local_addr,
        })
    }

    /// The address the listener actually bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown channel fires
    ///
    /// Receive errors are logged and the loop continues; only cancellation
    /// stops the listener.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ProxyError> {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, client)) => {
                            let request = buf[..len].to_vec();
                            let socket = Arc::clone(&self.socket);
                            let upstream = self.upstream.clone();
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                handle_request(socket, upstream, handler, client, request).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to read datagram");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("DNS proxy shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// One request/response exchange with the upstream resolver
async fn handle_request(
    listener: Arc<UdpSocket>,
    upstream: String,
    handler: Option<Arc<dyn MessageHandler>>,
    client: SocketAddr,
    request: Vec<u8>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            error!(error = %e, "failed to open upstream socket");
            return;
        }
    };
    if let Err(e) = socket.connect(&upstream).await {
        error!(upstream = %upstream, error = %e, "failed to dial upstream");
        return;
    }
    if let Err(e) = socket.send(&request).await {
        error!(upstream = %upstream, error = %e, "failed to send request upstream");
        return;
    }

    let mut reply = vec![0u8; MAX_UDP_PACKET_SIZE];
    let len = match timeout(UPSTREAM_TIMEOUT, socket.recv(&mut reply)).await {
        Ok(Ok(len)) => len,
        Ok(Err(e)) => {
            error!(upstream = %upstream, error = %e, "failed to read upstream reply");
            return;
        }
        Err(_) => {
            // The client retries on its own schedule; stay silent.
            debug!(upstream = %upstream, client = %client, "upstream timed out");
            return;
        }
    };
    let reply = &reply[..len];

    // Parse for the routing pipeline; a malformed reply is still the
    // client's reply.
    match codec::decode(reply) {
        Ok(msg) => {
            if let Some(handler) = &handler {
                handler.handle_message(&msg).await;
            }
        }
        Err(e) => {
            warn!(client = %client, error = %e, "failed to parse upstream reply, forwarding anyway");
        }
    }

    if let Err(e) = listener.send_to(reply, client).await {
        error!(client = %client, error = %e, "failed to send reply to client");
    }
}
