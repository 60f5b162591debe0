//! The socket session: owns the WebSocket, runs the authentication
//! handshake, multiplexes request/response frames by nonce, and drives
//! the heartbeat liveness state machine.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use futures::{SinkExt, StreamExt};
use teamchat_protocol::{
    AWAIT_FRAME_TIMEOUT_SECS, AuthenticationError, AuthenticationResponse, Filter, Frame,
    NonceCounter, PING_INTERVAL_SECS, PING_MAX_ATTEMPT, PING_TIMEOUT_SECS, frame_names,
};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio_tungstenite::{
    Connector, connect_async_tls_with_config,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

type WaiterResult = std::result::Result<Frame, ClientError>;

struct Waiter {
    id: u64,
    filter: Filter,
    tx: Option<oneshot::Sender<WaiterResult>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Connected,
    Closed,
}

struct Inner {
    write_tx: mpsc::UnboundedSender<Message>,
    nonce: NonceCounter,
    waiters: Mutex<Vec<Waiter>>,
    waiter_ids: AtomicU64,
    frame_tx: broadcast::Sender<Frame>,
    state: RwLock<SessionState>,
    cancel: CancellationToken,
    heartbeat_cancel: CancellationToken,
}

/// A live, authenticated WebSocket connection. One instance per connect
/// attempt — reconnection is the orchestrator's responsibility.
#[derive(Clone)]
pub struct SocketSession {
    inner: Arc<Inner>,
}

impl SocketSession {
    /// Open the WebSocket, run the authentication handshake, and start the
    /// heartbeat loop. Returns once the server has confirmed authentication.
    ///
    /// `auth` carries the account fields the server expects in the
    /// `authentication.response` frame (`authKey`/`userId`/
    /// `installationDomain`/`installationId`) — the caller must have
    /// already resolved these from `GET /chat/me.json?includeAuth=true`,
    /// since the cookie alone isn't sufficient per the handshake contract.
    pub async fn connect(url: &str, cookie: &str, auth: AuthenticationResponse) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let connector = build_tls_connector();

        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Connection(format!("invalid socket url: {e}")))?;
        request.headers_mut().insert(
            "Cookie",
            HeaderValue::from_str(&format!("tw-auth={cookie}"))
                .map_err(|e| ClientError::Connection(format!("invalid cookie header: {e}")))?,
        );

        let (ws_stream, _response) =
            connect_async_tls_with_config(request, None, false, Some(connector)).await?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        let (frame_tx, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            write_tx,
            nonce: NonceCounter::new(),
            waiters: Mutex::new(Vec::new()),
            waiter_ids: AtomicU64::new(0),
            frame_tx: frame_tx.clone(),
            state: RwLock::new(SessionState::Connecting),
            cancel: cancel.clone(),
            heartbeat_cancel: CancellationToken::new(),
        });

        let session = Self { inner };

        // Writer task: forwards queued outbound messages to the socket.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    },
                    msg = write_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if ws_sink.send(msg).await.is_err() {
                                    break;
                                }
                            },
                            None => break,
                        }
                    },
                }
            }
        });

        // Reader task: parses inbound frames, resolves waiters, and
        // broadcasts to the event router.
        let reader_session = session.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_reader.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<Frame>(&text) {
                                    Ok(frame) => reader_session.dispatch(frame).await,
                                    Err(e) => warn!(error = %e, "malformed inbound frame"),
                                }
                            },
                            Some(Ok(Message::Ping(data))) => {
                                let _ = reader_session.inner.write_tx.send(Message::Pong(data));
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("socket closed by server");
                                reader_session.close("socket closed by server").await;
                                break;
                            },
                            Some(Ok(_)) => {},
                            Some(Err(e)) => {
                                warn!(error = %e, "socket read error");
                                reader_session.close(format!("socket read error: {e}")).await;
                                break;
                            },
                        }
                    },
                }
            }
        });

        session.handshake(auth).await?;
        session.start_heartbeat();
        Ok(session)
    }

    async fn dispatch(&self, frame: Frame) {
        let mut waiters = self.inner.waiters.lock().await;
        waiters.retain_mut(|w| {
            if w.filter.matches(&frame) {
                if let Some(tx) = w.tx.take() {
                    let _ = tx.send(Ok(frame.clone()));
                }
                false
            } else {
                true
            }
        });
        drop(waiters);
        let _ = self.inner.frame_tx.send(frame);
    }

    async fn handshake(&self, auth: AuthenticationResponse) -> Result<()> {
        *self.inner.state.write().await = SessionState::Authenticating;

        self.await_frame(Filter::name(frame_names::AUTHENTICATION_REQUEST))
            .await?;

        self.send_frame(
            frame_names::AUTHENTICATION_RESPONSE,
            serde_json::to_value(auth)?,
            true,
        )
        .await?;

        let confirmation = self.await_frame(Filter::name(
            frame_names::AUTHENTICATION_CONFIRMATION,
        ));
        let error = self.await_frame(Filter::name(frame_names::AUTHENTICATION_ERROR));

        tokio::select! {
            result = confirmation => {
                result?;
                *self.inner.state.write().await = SessionState::Connected;
                info!("authenticated");
                Ok(())
            },
            result = error => {
                let frame = result?;
                let err: AuthenticationError = serde_json::from_value(frame.contents)?;
                Err(ClientError::Auth(err.message))
            },
        }
    }

    fn start_heartbeat(&self) {
        let session = self.clone();
        let cancel = self.inner.heartbeat_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(PING_INTERVAL_SECS)) => {},
                }

                let mut ok = false;
                for attempt in 0..PING_MAX_ATTEMPT {
                    match session
                        .socket_request(
                            frame_names::PING,
                            serde_json::json!({}),
                            std::time::Duration::from_secs(PING_TIMEOUT_SECS),
                        )
                        .await
                    {
                        Ok(_) => {
                            ok = true;
                            break;
                        },
                        Err(e) => {
                            debug!(attempt, error = %e, "heartbeat ping failed");
                        },
                    }
                }

                if !ok {
                    warn!("heartbeat exhausted retries, closing connection");
                    session.close("heartbeat liveness failure").await;
                    return;
                }
            }
        });
    }

    /// Subscribe to every inbound frame (used by the event router).
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inner.frame_tx.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    /// Send a frame without waiting for any response.
    pub async fn send_frame(&self, name: &str, contents: serde_json::Value, nonced: bool) -> Result<Frame> {
        let frame = Frame::new(name, contents, nonced.then_some(&self.inner.nonce));
        let text = serde_json::to_string(&frame)?;
        self.inner
            .write_tx
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::Connection("socket writer has shut down".into()))?;
        Ok(frame)
    }

    /// Register a waiter for the first inbound frame matching `filter`.
    pub async fn await_frame(&self, filter: Filter) -> Result<Frame> {
        self.await_frame_timeout(
            filter,
            std::time::Duration::from_secs(AWAIT_FRAME_TIMEOUT_SECS),
        )
        .await
    }

    pub async fn await_frame_timeout(
        &self,
        filter: Filter,
        timeout: std::time::Duration,
    ) -> Result<Frame> {
        assert!(!filter.is_empty(), "empty filter matches nothing usefully");

        let id = self.inner.waiter_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().await.push(Waiter {
            id,
            filter,
            tx: Some(tx),
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Connection(
                "waiter channel dropped before resolving".into(),
            )),
            Err(_) => {
                self.inner.waiters.lock().await.retain(|w| w.id != id);
                Err(ClientError::Timeout(format!(
                    "awaitFrame timed out after {}s",
                    timeout.as_secs()
                )))
            },
        }
    }

    /// Send a frame and await the response correlated by nonce.
    pub async fn socket_request(
        &self,
        name: &str,
        contents: serde_json::Value,
        timeout: std::time::Duration,
    ) -> Result<Frame> {
        let frame = self.send_frame(name, contents, true).await?;
        let nonce = frame
            .nonce
            .ok_or_else(|| ClientError::Contract("socket_request requires a nonced frame".into()))?;
        self.await_frame_timeout(Filter::any().with_nonce(nonce), timeout)
            .await
    }

    /// Tear down the connection. Does not wait for an orderly close
    /// handshake — pending waiters are rejected immediately so observers
    /// see the failure promptly.
    pub async fn close(&self, reason: impl Into<String> + Clone) {
        {
            let mut state = self.inner.state.write().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.inner.heartbeat_cancel.cancel();
        self.inner.cancel.cancel();

        let reason_string = reason.into();
        let mut waiters = self.inner.waiters.lock().await;
        for waiter in waiters.iter_mut() {
            if let Some(tx) = waiter.tx.take() {
                let _ = tx.send(Err(ClientError::Connection(reason_string.clone())));
            }
        }
        waiters.clear();
    }
}

/// Build a TLS connector trusting the platform's native root store.
fn build_tls_connector() -> Connector {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = root_store.add(cert);
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Connector::Rustls(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    fn test_auth_response() -> AuthenticationResponse {
        AuthenticationResponse {
            auth_key: "test-auth-key".into(),
            user_id: 1,
            installation_domain: "test.teamwork.com".into(),
            installation_id: 1,
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    /// Spawn a local WebSocket server that runs the authentication
    /// handshake and then echoes any frame whose name is `echo`.
    async fn spawn_handshake_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("accept_async");
            let (mut sink, mut stream) = ws.split();

            let request = Frame::new(
                frame_names::AUTHENTICATION_REQUEST,
                serde_json::json!({}),
                None,
            );
            sink.send(Message::Text(
                serde_json::to_string(&request).expect("serialize").into(),
            ))
            .await
            .expect("send request");

            // consume authentication.response
            let _ = stream.next().await;

            let confirmation = Frame::new(
                frame_names::AUTHENTICATION_CONFIRMATION,
                serde_json::json!({}),
                None,
            );
            sink.send(Message::Text(
                serde_json::to_string(&confirmation)
                    .expect("serialize")
                    .into(),
            ))
            .await
            .expect("send confirmation");

            while let Some(Ok(Message::Text(text))) = stream.next().await {
                if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                    let echo = Frame {
                        nonce: frame.nonce,
                        ..frame
                    };
                    let _ = sink
                        .send(Message::Text(
                            serde_json::to_string(&echo).expect("serialize").into(),
                        ))
                        .await;
                }
            }
        });

        format!("ws://{addr}")
    }

    /// Like [`spawn_handshake_server`], but goes silent after the
    /// handshake: it accepts and drops every subsequent frame without
    /// replying, so a `ping` never gets its `pong`.
    async fn spawn_handshake_server_silent_after_auth() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("accept_async");
            let (mut sink, mut stream) = ws.split();

            let request = Frame::new(
                frame_names::AUTHENTICATION_REQUEST,
                serde_json::json!({}),
                None,
            );
            sink.send(Message::Text(
                serde_json::to_string(&request).expect("serialize").into(),
            ))
            .await
            .expect("send request");

            // consume authentication.response
            let _ = stream.next().await;

            let confirmation = Frame::new(
                frame_names::AUTHENTICATION_CONFIRMATION,
                serde_json::json!({}),
                None,
            );
            sink.send(Message::Text(
                serde_json::to_string(&confirmation)
                    .expect("serialize")
                    .into(),
            ))
            .await
            .expect("send confirmation");

            // Drain every subsequent frame (including pings) without
            // ever replying.
            while stream.next().await.is_some() {}
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn handshake_completes_and_reaches_connected() {
        let url = spawn_handshake_server().await;
        let session = SocketSession::connect(&url, "test-cookie", test_auth_response())
            .await
            .expect("connect");
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn socket_request_resolves_by_nonce() {
        let url = spawn_handshake_server().await;
        let session = SocketSession::connect(&url, "test-cookie", test_auth_response())
            .await
            .expect("connect");

        let response = session
            .socket_request(
                "echo",
                serde_json::json!({"hello": "world"}),
                std::time::Duration::from_secs(5),
            )
            .await
            .expect("socket request resolves");
        assert_eq!(response.name, "echo");
    }

    #[tokio::test]
    async fn close_rejects_pending_waiters() {
        let url = spawn_handshake_server().await;
        let session = SocketSession::connect(&url, "test-cookie", test_auth_response())
            .await
            .expect("connect");

        let waiting = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .await_frame(Filter::name("will-never-arrive"))
                    .await
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        session.close("test teardown").await;

        let result = waiting.await.expect("task completes");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let url = spawn_handshake_server().await;
        let session = SocketSession::connect(&url, "test-cookie", test_auth_response())
            .await
            .expect("connect");

        session.close("first close").await;
        session.close("second close").await;

        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_exhaustion_closes_the_session() {
        let url = spawn_handshake_server_silent_after_auth().await;
        let session = SocketSession::connect(&url, "test-cookie", test_auth_response())
            .await
            .expect("connect");
        assert_eq!(session.state().await, SessionState::Connected);

        // One heartbeat interval, then `PING_MAX_ATTEMPT` timeouts that
        // never get a pong — all virtual time under `start_paused`.
        let budget = PING_INTERVAL_SECS + PING_TIMEOUT_SECS * u64::from(PING_MAX_ATTEMPT) + 1;
        tokio::time::sleep(std::time::Duration::from_secs(budget)).await;

        assert_eq!(session.state().await, SessionState::Closed);
    }
}
