//! Per-connection handler.
//!
//! Each accepted socket is split in two:
//! - a writer task owning the write half, fed by an outbound queue,
//! - the handler loop owning the read half, decoding frames and
//!   dispatching commands.
//!
//! Connection states: unauthenticated until a successful `login`, then
//! authenticated as one identity. Session commands (`get_users`, `msg`,
//! `typing`) received before login are ignored. Whichever way the loop
//! ends (EOF, read error, idle timeout, shutdown signal) the same cleanup
//! runs: the session is deregistered if this connection still owns it,
//! and the identity is announced offline.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use relay_core::{validate_credentials, ChatMessage, Credentials, Envelope, TypingNotice};
use relay_protocol::{encode_envelope, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::router::{Delivery, Router};
use crate::store::Registration;
use crate::types::{ConnectionId, OutboundRx, OutboundTx, SessionHandle};

const READ_CHUNK: usize = 4096;

/// Run the I/O loop for a single connection until it closes.
///
/// Transport errors are returned for logging; they only ever end this
/// connection.
pub async fn run_client(
    conn_id: ConnectionId,
    stream: TcpStream,
    router: Arc<Router>,
    config: Arc<Config>,
) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx): (OutboundTx, OutboundRx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());

    tokio::spawn(run_writer(
        conn_id,
        write_half,
        rx,
        shutdown.clone(),
        router.clone(),
    ));

    let mut conn = Connection {
        conn_id,
        router,
        tx,
        shutdown,
        state: ConnState::Unauthenticated,
    };

    let result = conn
        .read_loop(read_half, config.max_frame_bytes, config.idle_timeout())
        .await;
    conn.close().await;
    result
}

#[derive(Debug)]
enum ConnState {
    Unauthenticated,
    Authenticated(SessionHandle),
}

struct Connection {
    conn_id: ConnectionId,
    router: Arc<Router>,
    tx: OutboundTx,
    shutdown: Arc<Notify>,
    state: ConnState,
}

impl Connection {
    async fn read_loop(
        &mut self,
        mut read_half: OwnedReadHalf,
        max_frame_bytes: usize,
        idle: Option<Duration>,
    ) -> io::Result<()> {
        let mut decoder = FrameDecoder::new(max_frame_bytes);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let shutdown = self.shutdown.clone();
            let read = tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    debug!(conn = %self.conn_id, "shutdown requested");
                    return Ok(());
                }
                read = read_chunk(&mut read_half, &mut chunk, idle) => read?,
            };

            match read {
                None => {
                    info!(conn = %self.conn_id, "idle timeout");
                    return Ok(());
                }
                Some(0) => {
                    debug!(conn = %self.conn_id, "peer closed the stream");
                    return Ok(());
                }
                Some(n) => {
                    for env in decoder.feed(&chunk[..n]) {
                        self.dispatch(env).await;
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, env: Envelope) {
        if env.requires_auth() && matches!(self.state, ConnState::Unauthenticated) {
            debug!(
                conn = %self.conn_id,
                command = ?env.command(),
                "ignoring session command before login"
            );
            return;
        }

        match env {
            Envelope::Register(creds) => self.handle_register(creds).await,
            Envelope::Login(creds) => self.handle_login(creds).await,
            Envelope::GetUsers => {
                if let Some(session) = self.current_session().await {
                    if let Err(err) = self.router.send_user_list(&session).await {
                        error!(conn = %self.conn_id, error = %err, "failed to build user list");
                    }
                }
            }
            Envelope::Msg(msg) => self.handle_msg(msg).await,
            Envelope::Typing(notice) => self.handle_typing(notice).await,
            other => {
                debug!(
                    conn = %self.conn_id,
                    command = ?other.command(),
                    "ignoring server-side envelope from client"
                );
            }
        }
    }

    /// This connection's session, while the registry still maps its
    /// identity to this connection. A superseded connection may still have
    /// frames buffered; those are not routed.
    async fn current_session(&self) -> Option<SessionHandle> {
        let ConnState::Authenticated(session) = &self.state else {
            return None;
        };

        match self.router.registry().get(&session.identity).await {
            Some(current) if current.same_connection(session) => Some(session.clone()),
            _ => {
                debug!(conn = %self.conn_id, user = %session.identity, "session superseded, dropping command");
                None
            }
        }
    }

    async fn handle_register(&mut self, creds: Credentials) {
        let username = match validate_credentials(&creds) {
            Ok(username) => username,
            Err(err) => {
                self.reply(Envelope::auth_error(err.to_string()));
                return;
            }
        };

        let reply = match self.router.auth().register(&username, &creds.password).await {
            Ok(Registration::Created) => {
                info!(conn = %self.conn_id, user = %username, "registered");
                Envelope::auth_ok("Registered successfully.")
            }
            Ok(Registration::Duplicate) => Envelope::auth_error("Username already exists."),
            Err(err) => {
                error!(conn = %self.conn_id, error = %err, "registration failed");
                Envelope::auth_error("Registration failed, try again later.")
            }
        };
        self.reply(reply);
    }

    async fn handle_login(&mut self, creds: Credentials) {
        let username = match validate_credentials(&creds) {
            Ok(username) => username,
            Err(_) => {
                self.reply(Envelope::auth_error("Invalid username or password."));
                return;
            }
        };

        match self.router.auth().verify(&username, &creds.password).await {
            Ok(true) => {}
            Ok(false) => {
                info!(conn = %self.conn_id, user = %username, "login rejected");
                self.reply(Envelope::auth_error("Invalid username or password."));
                return;
            }
            Err(err) => {
                error!(conn = %self.conn_id, error = %err, "credential check failed");
                self.reply(Envelope::auth_error("Login failed, try again later."));
                return;
            }
        }

        // Switching identity on one connection ends the old session first.
        let switching = matches!(
            &self.state,
            ConnState::Authenticated(current) if current.identity != username
        );
        if switching {
            self.release_session().await;
        }

        let session = SessionHandle::new(
            self.conn_id,
            username.clone(),
            self.tx.clone(),
            self.shutdown.clone(),
        );
        self.reply(Envelope::auth_ok("Login successful."));
        self.state = ConnState::Authenticated(session.clone());
        info!(conn = %self.conn_id, user = %username, "logged in");

        match self.router.establish_session(&session).await {
            Ok(0) => {}
            Ok(n) => debug!(conn = %self.conn_id, user = %username, count = n, "flushed offline queue"),
            Err(err) => error!(conn = %self.conn_id, error = %err, "failed to finish login"),
        }
    }

    async fn handle_msg(&mut self, msg: ChatMessage) {
        let Some(session) = self.current_session().await else {
            return;
        };

        match self.router.route_message(&session.identity, msg).await {
            Ok(Delivery::Delivered) | Ok(Delivery::Queued) => {}
            Ok(Delivery::Dropped) => {
                debug!(conn = %self.conn_id, "message dropped");
            }
            Err(err) => error!(conn = %self.conn_id, error = %err, "failed to route message"),
        }
    }

    async fn handle_typing(&mut self, notice: TypingNotice) {
        let Some(session) = self.current_session().await else {
            return;
        };
        self.router.relay_typing(&session.identity, notice).await;
    }

    fn reply(&self, env: Envelope) {
        // The writer only goes away after signalling shutdown, which the
        // read loop picks up next.
        if self.tx.send(env).is_err() {
            debug!(conn = %self.conn_id, "reply dropped, writer closed");
        }
    }

    async fn release_session(&mut self) {
        let state = std::mem::replace(&mut self.state, ConnState::Unauthenticated);
        if let ConnState::Authenticated(session) = state {
            match self.router.end_session(&session).await {
                Ok(true) => info!(conn = %self.conn_id, user = %session.identity, "logged out"),
                Ok(false) => {
                    debug!(conn = %self.conn_id, user = %session.identity, "session already superseded")
                }
                Err(err) => error!(conn = %self.conn_id, error = %err, "failed to announce logout"),
            }
        }
    }

    async fn close(&mut self) {
        self.release_session().await;
        debug!(conn = %self.conn_id, "connection closed");
    }
}

/// One socket read; `None` when the idle timeout elapsed first.
async fn read_chunk(
    read_half: &mut OwnedReadHalf,
    chunk: &mut [u8],
    idle: Option<Duration>,
) -> io::Result<Option<usize>> {
    match idle {
        Some(limit) => match tokio::time::timeout(limit, read_half.read(chunk)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => read_half.read(chunk).await.map(Some),
    }
}

/// Writer task: consume outbound envelopes and write them as frames.
///
/// On a write failure the queue is closed, the handler is told to shut
/// down, and any messages still queued for this socket go back through
/// the router so they end up in the offline queue instead of being lost.
async fn run_writer(
    conn_id: ConnectionId,
    mut write_half: OwnedWriteHalf,
    mut rx: OutboundRx,
    shutdown: Arc<Notify>,
    router: Arc<Router>,
) {
    let mut frame = Vec::with_capacity(256);

    while let Some(env) = rx.recv().await {
        frame.clear();
        if let Err(err) = encode_envelope(&env, &mut frame) {
            warn!(conn = %conn_id, error = %err, "failed to encode envelope");
            continue;
        }

        if let Err(err) = write_frame(&mut write_half, &frame).await {
            debug!(conn = %conn_id, error = %err, "write failed");
            rx.close();
            shutdown.notify_one();

            let mut undelivered = vec![env];
            while let Ok(env) = rx.try_recv() {
                undelivered.push(env);
            }
            router.requeue_undelivered(undelivered).await;
            return;
        }
    }

    let _ = write_half.shutdown().await;
}

async fn write_frame(stream: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}
