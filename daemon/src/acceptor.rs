//! Connection acceptor

use crate::connection_registry::{ConnectionId, ConnectionIds};
use crate::metrics::METRICS;
use crate::session::{Session, SessionContext, SessionError};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, warn};

/// WebSocket gateway listening on one TCP endpoint
pub struct Gateway {
    listener: TcpListener,
    context: SessionContext,
    ids: Arc<ConnectionIds>,
}

impl Gateway {
    pub async fn bind(addr: SocketAddr, context: SessionContext) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            context,
            ids: Arc::new(ConnectionIds::new()),
        })
    }

    /// Use `ids` to number accepted connections
    pub fn with_connection_ids(mut self, ids: Arc<ConnectionIds>) -> Self {
        self.ids = ids;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Accept connections forever
    pub async fn serve(self) -> io::Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running are left alone; each ends when its socket
    /// closes.
    pub async fn serve_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Gateway listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(
                        "Stopped accepting connections, {} still open",
                        self.context.registry.count()
                    );
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };

                    let id = self.ids.next();
                    METRICS.connections_accepted.inc();
                    debug!("{} Accepted TCP connection from {}", id, peer);
                    tokio::spawn(supervise(id, stream, peer, self.context.clone()));
                }
            }
        }
    }
}

/// Run one connection in its own task so that an error or panic is
/// contained and logged with the connection tag
async fn supervise(id: ConnectionId, stream: TcpStream, peer: SocketAddr, context: SessionContext) {
    match tokio::spawn(handle_connection(id, stream, peer, context)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} crashed: {}", id, e),
        Err(e) => error!("{} crashed: {}", id, e),
    }
}

async fn handle_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    context: SessionContext,
) -> Result<(), SessionError> {
    let mut forwarded_for = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        forwarded_for = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let socket = match accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("{} WebSocket handshake with {} failed: {}", id, peer, e);
            return Ok(());
        }
    };

    let address = forwarded_for.unwrap_or_else(|| peer.ip().to_string());
    Session::run(id, address, context, socket).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{User, UserTable};
    use evr_gateway_archive::Archive;
    use evr_gateway_archive::testing::ScriptedSpawner;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    async fn gateway() -> Gateway {
        let users: UserTable = [User::new("alice", "wonderland")].into_iter().collect();
        let context = SessionContext::new(users, Archive::new(Arc::new(ScriptedSpawner::new())));
        Gateway::bind("127.0.0.1:0".parse().unwrap(), context)
            .await
            .unwrap()
    }

    async fn wait_for_count(context: &SessionContext, count: usize) {
        for _ in 0..200 {
            if context.registry.count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} registered connections", count);
    }

    #[tokio::test]
    async fn test_failing_session_does_not_stop_acceptor() {
        let gateway = gateway().await;
        let addr = gateway.local_addr().unwrap();
        let context = gateway.context().clone();
        tokio::spawn(gateway.serve());

        let (mut bad, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let (mut good, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_count(&context, 2).await;

        bad.send(Message::text("not json")).await.unwrap();
        wait_for_count(&context, 1).await;

        good.send(Message::text(r#"{"cmd":"nope","ch":"still-here"}"#))
            .await
            .unwrap();
        let reply = good.next().await.unwrap().unwrap();
        assert_eq!(
            reply.into_text().unwrap().as_str(),
            r#"{"ch":"still-here","status":"unknown"}"#
        );

        let (mut late, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        late.send(Message::text(r#"{"cmd":"nope","ch":1}"#)).await.unwrap();
        assert!(late.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connection_ids_are_injected() {
        let ids = Arc::new(ConnectionIds::starting_at(0x41));
        let gateway = gateway().await.with_connection_ids(ids.clone());
        let addr = gateway.local_addr().unwrap();
        let context = gateway.context().clone();
        tokio::spawn(gateway.serve());

        let (_first, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_count(&context, 1).await;
        let (_second, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_count(&context, 2).await;

        assert!(context.registry.get(ConnectionId::new(0x41)).is_some());
        assert!(context.registry.get(ConnectionId::new(0x42)).is_some());
        assert_eq!(ids.next().to_string(), "[C43]");
    }

    #[tokio::test]
    async fn test_forwarded_address_is_recorded() {
        let gateway = gateway().await;
        let addr = gateway.local_addr().unwrap();
        let context = gateway.context().clone();
        tokio::spawn(gateway.serve());

        let mut request = format!("ws://{}", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("X-Forwarded-For", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let (_socket, _) = connect_async(request).await.unwrap();
        wait_for_count(&context, 1).await;

        let entry = context.registry.get(ConnectionId::new(1)).unwrap();
        assert_eq!(entry.address, "203.0.113.7, 10.0.0.1");
    }

    #[tokio::test]
    async fn test_shutdown_leaves_sessions_open() {
        let gateway = gateway().await;
        let addr = gateway.local_addr().unwrap();
        let context = gateway.context().clone();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(gateway.serve_until(async move {
            let _ = stopped.await;
        }));

        let (mut socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_count(&context, 1).await;

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();

        socket
            .send(Message::text(r#"{"cmd":"nope","ch":"open"}"#))
            .await
            .unwrap();
        let reply = socket.next().await.unwrap().unwrap();
        assert!(reply.into_text().unwrap().as_str().contains("open"));

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
