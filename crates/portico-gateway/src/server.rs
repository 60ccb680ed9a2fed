//! TCP/WebSocket hosting adapter
//!
//! Accepts sockets, performs the upgrade handshake against the router and
//! translates socket activity into router events. Each socket gets a reader
//! loop (this task) and a writer task fed by the connection's outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use portico_config::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::error::Elapsed;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::RequestContext;
use crate::connection::{outbound_channel, Outbound, OutboundReceiver};
use crate::error::{GatewayError, Result};
use crate::router::{DispatchRouter, UpgradeTicket};

/// How long a finished reader waits for its writer to flush
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// How long a server-closed socket waits for the peer's close frame
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Socket-level settings for [`serve`]
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Grace period for closing live connections on shutdown
    pub shutdown_grace: Duration,
    /// Ping interval; a peer silent for three intervals is dropped
    pub heartbeat_interval: Option<Duration>,
    /// Per-connection outbound queue depth
    pub outbound_buffer: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(2),
            heartbeat_interval: Some(Duration::from_secs(30)),
            outbound_buffer: 256,
        }
    }
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            heartbeat_interval: (config.heartbeat_interval_secs > 0)
                .then(|| Duration::from_secs(config.heartbeat_interval_secs)),
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }
}

/// Serve WebSocket upgrades until `shutdown` is cancelled, then stop the
/// router and wait for connection tasks to finish.
pub async fn serve(
    listener: TcpListener,
    router: Arc<DispatchRouter>,
    options: ServerOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Gateway listening on ws://{}", addr);
    for endpoint in router.endpoints() {
        info!(endpoint = %endpoint, "serving endpoint");
    }

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let router = Arc::clone(&router);
                    let options = options.clone();
                    tracker.spawn(async move {
                        if let Err(e) = handle_socket(stream, peer, router, options).await {
                            warn!("Connection error for {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed; continuing");
                }
            }
        }
    }

    info!("shutdown requested");
    drop(listener);
    let closed = router.stop(options.shutdown_grace).await;
    tracker.close();
    if tokio::time::timeout(options.shutdown_grace + WRITER_DRAIN, tracker.wait())
        .await
        .is_err()
    {
        warn!(remaining = tracker.len(), "connection tasks still running after shutdown");
    }
    info!(closed, "gateway stopped");
    Ok(())
}

async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<DispatchRouter>,
    options: ServerOptions,
) -> Result<()> {
    let ticket_slot: Arc<Mutex<Option<UpgradeTicket>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ticket_slot);
    let upgrade_router = Arc::clone(&router);

    let handshake = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)));
        let context = RequestContext::from_parts(req.uri().path(), req.uri().query(), headers)
            .with_peer(Some(peer));

        match upgrade_router.handle_upgrade(&context) {
            Ok(ticket) => {
                *slot.lock() = Some(ticket);
                Ok(resp)
            }
            Err(e) => Err(refusal(&e)),
        }
    })
    .await;

    let ws = match handshake {
        Ok(ws) => ws,
        Err(tungstenite::Error::Http(response)) => {
            debug!(%peer, status = %response.status(), "upgrade refused");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let Some(ticket) = ticket_slot.lock().take() else {
        return Ok(());
    };
    let endpoint = ticket.endpoint.clone();

    let (sink, mut stream) = ws.split();
    let (tx, rx) = outbound_channel(options.outbound_buffer);
    let mut writer = tokio::spawn(write_loop(sink, rx, options.heartbeat_interval));

    let connection = match router.open(ticket, tx.clone()).await {
        Ok(connection) => connection,
        Err(e) => {
            debug!(%peer, endpoint = %endpoint, error = %e, "connection refused");
            tx.close(Some(close_frame(&e)));
            drop(tx);
            finish_writer(&mut writer).await;
            return Ok(());
        }
    };
    let connection_id = connection.id().to_string();
    drop(connection);

    let idle_limit = options.heartbeat_interval.map(|interval| interval * 3);
    // Set once the manager has asked for the socket to close
    let mut closing = false;
    loop {
        let limit = if closing { Some(CLOSE_WAIT) } else { idle_limit };
        let next = tokio::select! {
            biased;
            _ = tx.close_requested(), if !closing => {
                closing = true;
                continue;
            }
            next = read_next(&mut stream, limit) => next,
        };

        match next {
            Err(_) if closing => {
                router.close(&endpoint, &connection_id).await;
                break;
            }
            Err(_) => {
                router.error(&endpoint, &connection_id, "heartbeat timeout").await;
                break;
            }
            Ok(Some(Ok(message @ (Message::Text(_) | Message::Binary(_))))) => {
                if !closing {
                    router.message(&endpoint, &connection_id, message).await;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                router.close(&endpoint, &connection_id).await;
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                router.error(&endpoint, &connection_id, e.to_string()).await;
                break;
            }
        }
    }

    tx.close(None);
    drop(tx);
    finish_writer(&mut writer).await;
    Ok(())
}

/// Next frame from the peer, or `Err` if nothing arrived within `limit`
async fn read_next(
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    limit: Option<Duration>,
) -> std::result::Result<Option<tungstenite::Result<Message>>, Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: OutboundReceiver,
    heartbeat: Option<Duration>,
) {
    let mut ticker = heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(message)) => {
                    if let Err(e) = sink.send(message).await {
                        debug!(error = %e, "socket write failed; writer exiting");
                        break;
                    }
                }
                Some(Outbound::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                None => break,
            },
            _ = next_tick(&mut ticker) => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn finish_writer(writer: &mut tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(WRITER_DRAIN, &mut *writer).await.is_err() {
        writer.abort();
    }
}

fn refusal(error: &GatewayError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = error.http_status();
    response
}

fn close_frame(error: &GatewayError) -> CloseFrame<'static> {
    CloseFrame {
        code: error.close_code(),
        reason: error.to_string().into(),
    }
}
