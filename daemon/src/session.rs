//! Connection session
//!
//! One `Session` serves one WebSocket. Inbound frames are read and dispatched
//! in order; `watch`, `get-verify` and `sign-put` run as tasks in a per-session
//! `JoinSet` so several commands can be in flight at once. Responses from all
//! tasks go through one queue to a single writer task, in completion order.
//!
//! Ending the session aborts every task. Aborting a task drops its archive
//! streams, which kills the `evr` processes behind them.

use crate::auth::{AuthState, UserTable};
use crate::config::DaemonConfig;
use crate::connection_registry::{ConnectionId, ConnectionRegistry, Registration};
use crate::metrics::METRICS;
use evr_gateway_archive::{Archive, ArchiveError, ClaimSetFilter, FilterError};
use evr_gateway_protocol::{
    AuthRequest, Command, CommandKind, DecodeError, GetVerifyRequest, PROTOCOL_ERROR_CODE,
    Request, Response, SignPutRequest, Status, WatchRequest,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message, error::ProtocolError};
use tracing::{debug, error, info, trace, warn};

/// Conditions that end a session abnormally
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Failure of one command, reported on its channel as an `error` response
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    InvalidRequest(#[from] DecodeError),
}

impl CommandError {
    /// `errorCode` sent to the client
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Archive(e) => e.error_code(),
            Self::Filter(_) | Self::InvalidRequest(_) => PROTOCOL_ERROR_CODE,
        }
    }

    /// Outcomes the client handles itself; not server errors
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Archive(ArchiveError::ChildProcess(failure)) if failure.is_expected())
    }

    fn log(&self, id: ConnectionId) {
        match self {
            _ if self.is_expected() => debug!("{} {}", id, self),
            Self::Archive(ArchiveError::ChildProcess(failure)) => {
                METRICS.subprocess_failures.inc();
                error!(
                    "{} evr {} failed with exit code {}: {}",
                    id, failure.command, failure.exit_code, failure.stderr
                );
            }
            Self::Archive(e) => {
                METRICS.subprocess_failures.inc();
                error!("{} {}", id, e);
            }
            Self::Filter(e) => error!("{} Invalid watch filter: {}", id, e),
            Self::InvalidRequest(e) => error!("{} {}", id, e),
        }
    }
}

/// State shared by all sessions
#[derive(Clone)]
pub struct SessionContext {
    pub users: Arc<UserTable>,
    pub archive: Archive,
    pub registry: Arc<ConnectionRegistry>,
}

impl SessionContext {
    pub fn new(users: UserTable, archive: Archive) -> Self {
        Self {
            users: Arc::new(users),
            archive,
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(
            UserTable::from_config(&config.user),
            Archive::evr(config.archive.program.clone()),
        )
    }
}

/// Whether to keep reading after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Response target of one request
#[derive(Clone)]
struct Channel {
    id: ConnectionId,
    ch: Value,
    outbound: UnboundedSender<Response>,
}

impl Channel {
    fn send(&self, status: Status) {
        if self
            .outbound
            .send(Response::new(self.ch.clone(), status))
            .is_err()
        {
            trace!("{} Dropping response, socket closed", self.id);
        }
    }

    fn fail(&self, error: CommandError) {
        error.log(self.id);
        self.send(Status::Error {
            error_code: error.error_code(),
        });
    }
}

pub struct Session {
    id: ConnectionId,
    context: SessionContext,
    auth: AuthState,
    outbound: UnboundedSender<Response>,
    tasks: JoinSet<()>,
    registration: Registration,
}

impl Session {
    /// Serve one accepted WebSocket until either side closes it.
    ///
    /// `address` is the client address used for logging. Returns an error for
    /// session-fatal conditions such as a malformed message.
    pub async fn run<S>(
        id: ConnectionId,
        address: String,
        context: SessionContext,
        socket: WebSocketStream<S>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("{} Connection from {}", id, address);

        let (sink, mut stream) = socket.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_responses(id, sink, queue));

        let registration = context.registry.register(id, address);
        let mut session = Session {
            id,
            context,
            auth: AuthState::default(),
            outbound,
            tasks: JoinSet::new(),
            registration,
        };

        let result = session.read_messages(&mut stream).await;

        // queued responses are still flushed once every sender is gone
        session.tasks.shutdown().await;
        drop(session);
        if let Err(e) = writer.await {
            error!("{} Writer task failed: {}", id, e);
        }

        info!("{} Socket closed", id);
        result
    }

    async fn read_messages<S>(
        &mut self,
        stream: &mut SplitStream<WebSocketStream<S>>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                message = stream.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) if is_disconnect(&e) => {
                            debug!("{} Connection dropped: {}", self.id, e);
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };
                    if self.handle_frame(message)? == Flow::Close {
                        return Ok(());
                    }
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("{} Command task panicked: {}", self.id, e);
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, message: Message) -> Result<Flow, SessionError> {
        match message {
            Message::Text(text) => self.handle_message(text.as_str()),
            Message::Binary(data) => {
                let text = std::str::from_utf8(&data).map_err(|e| {
                    DecodeError::MalformedJson(format!("binary frame is not UTF-8: {}", e))
                })?;
                self.handle_message(text)
            }
            Message::Close(frame) => {
                debug!("{} Close frame received: {:?}", self.id, frame);
                Ok(Flow::Close)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(Flow::Continue),
        }
    }

    fn handle_message(&mut self, text: &str) -> Result<Flow, SessionError> {
        let request = Request::parse(text)?;
        let channel = Channel {
            id: self.id,
            ch: request.ch().clone(),
            outbound: self.outbound.clone(),
        };

        let Some(kind) = request.kind() else {
            warn!("{} Unknown command: {}", self.id, text);
            channel.send(Status::Unknown);
            return Ok(Flow::Continue);
        };
        METRICS.commands.with_label_values(&[kind.as_str()]).inc();

        if kind.requires_auth() && !self.auth.is_authenticated() {
            debug!("{} Rejecting unauthenticated {}", self.id, kind.as_str());
            channel.send(Status::Unauthenticated);
            return Ok(Flow::Continue);
        }

        let command = match request.decode() {
            Ok(command) => command,
            // malformed credentials are failed credentials
            Err(_) if kind == CommandKind::Auth => Command::Auth(AuthRequest::default()),
            Err(e) => {
                channel.fail(e.into());
                return Ok(Flow::Continue);
            }
        };

        Ok(match command {
            Command::Auth(auth) => self.authenticate(channel, &auth),
            Command::Watch(watch) => {
                self.watch(channel, watch);
                Flow::Continue
            }
            Command::GetVerify(get) => {
                self.get_verify(channel, get);
                Flow::Continue
            }
            Command::SignPut(put) => {
                self.sign_put(channel, put);
                Flow::Continue
            }
        })
    }

    fn authenticate(&mut self, channel: Channel, request: &AuthRequest) -> Flow {
        match self.context.users.authenticate(request) {
            Ok(user) => {
                info!("{} User {} connected", self.id, user.name());
                METRICS.auth_successes.inc();
                self.auth = AuthState::Authenticated(user.name().to_string());
                self.registration.set_user(self.auth.user().map(str::to_string));
                channel.send(Status::Authenticated);
                Flow::Continue
            }
            Err(e) => {
                warn!("{} Authentication failed: {}", self.id, e);
                METRICS.auth_failures.inc();
                self.registration.set_user(None);
                self.auth = AuthState::Unauthenticated;
                channel.send(Status::Unauthenticated);
                Flow::Close
            }
        }
    }

    fn watch(&mut self, channel: Channel, request: WatchRequest) {
        let filter = match ClaimSetFilter::from_spec(request.filter.as_ref()) {
            Ok(filter) => filter,
            Err(e) => return channel.fail(e.into()),
        };
        let archive = self.context.archive.clone();
        let claim_sets = match archive.watch(request.last_modified_after(), request.flags()) {
            Ok(claim_sets) => claim_sets,
            Err(e) => return channel.fail(e.into()),
        };
        let mut claim_sets = filter.apply(archive, claim_sets);

        self.tasks.spawn(async move {
            while let Some(claim_set) = claim_sets.next().await {
                match claim_set {
                    Ok(claim_set) => {
                        METRICS.notifications_sent.inc();
                        channel.send(Status::BlobModified(claim_set));
                    }
                    Err(e) => return channel.fail(e.into()),
                }
            }
            debug!("{} Watch on channel {} ended", channel.id, channel.ch);
        });
    }

    fn get_verify(&mut self, channel: Channel, request: GetVerifyRequest) {
        let archive = self.context.archive.clone();
        self.tasks.spawn(async move {
            match archive.get_and_verify(&request.reference).await {
                Ok(content) => channel.send(Status::Get {
                    body: String::from_utf8_lossy(&content).into_owned(),
                }),
                Err(e) => channel.fail(e.into()),
            }
        });
    }

    fn sign_put(&mut self, channel: Channel, request: SignPutRequest) {
        let archive = self.context.archive.clone();
        self.tasks.spawn(async move {
            match archive.sign_and_put(request.body).await {
                Ok(reference) => channel.send(Status::Put { reference }),
                Err(e) => channel.fail(e.into()),
            }
        });
    }
}

/// Send queued responses until every sender is dropped, then close the socket
async fn write_responses<S>(
    id: ConnectionId,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: UnboundedReceiver<Response>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(response) = queue.recv().await {
        let text = match response.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("{} Failed to encode response: {}", id, e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::text(text)).await {
            debug!("{} Failed to send response: {}", id, e);
            return;
        }
    }

    if let Err(e) = sink.close().await {
        trace!("{} Close after disconnect: {}", id, e);
    }
}

fn is_disconnect(error: &tungstenite::Error) -> bool {
    matches!(
        error,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    ) || matches!(error, tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionReset)
}
