//! TCP conversation host
//!
//! Holds one-to-one conversations in memory. Clients authenticate with a
//! bearer token, query conversations and subscribe to change notifications
//! for the peers whose conversation screen they have open.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duet_core::{ConversationSummary, MessageId, PeerId, PeerProfile, UserRecord};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Envelope, Request, Response, WireMessage};

/// Maximum number of simultaneous sessions
const MAX_SESSIONS: usize = 64;

/// Maximum messages kept per conversation
const MAX_MESSAGE_HISTORY: usize = 500;

/// Time a new connection has to authenticate
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Conversation key: the two participants, smaller id first
type PairKey = (PeerId, PeerId);

fn pair_key(a: &PeerId, b: &PeerId) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct StoredMessage {
    id: MessageId,
    sender: PeerId,
    text: String,
    created_at: DateTime<Utc>,
}

/// An authenticated connection
struct Session {
    user_id: PeerId,
    tx: mpsc::Sender<Envelope>,
    /// Peers whose conversation with `user_id` this session watches
    subscriptions: HashSet<PeerId>,
}

/// Server state shared across tasks
struct ServerState {
    users: Vec<UserRecord>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    conversations: HashMap<PairKey, VecDeque<StoredMessage>>,
    next_message: u64,
}

impl ServerState {
    fn user_by_token(&self, token: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.token == token)
    }

    fn user(&self, id: &PeerId) -> Option<&UserRecord> {
        self.users.iter().find(|u| &u.id == id)
    }

    fn is_live(&self, id: &PeerId) -> bool {
        self.sessions.values().any(|s| &s.user_id == id)
    }

    fn profile(&self, user: &UserRecord) -> PeerProfile {
        PeerProfile {
            is_live: self.is_live(&user.id),
            ..user.profile()
        }
    }

    fn chat_list(&self, user_id: &PeerId) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .iter()
            .filter_map(|((a, b), messages)| {
                let peer_id = if a == user_id {
                    b
                } else if b == user_id {
                    a
                } else {
                    return None;
                };
                let peer = self.user(peer_id)?;
                let last = messages.back();
                Some(ConversationSummary {
                    peer: self.profile(peer),
                    last_message: last.map(|m| m.text.clone()),
                    last_message_at: last.map(|m| m.created_at),
                })
            })
            .collect();

        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        summaries
    }

    fn chat_details(&self, user_id: &PeerId, peer_id: &PeerId) -> Response {
        let Some(peer) = self.user(peer_id) else {
            return Response::Error {
                reason: format!("Unknown user {}", peer_id),
            };
        };

        let messages = self
            .conversations
            .get(&pair_key(user_id, peer_id))
            .map(|history| {
                history
                    .iter()
                    .map(|m| WireMessage {
                        id: m.id.clone(),
                        text: m.text.clone(),
                        is_sender: &m.sender == user_id,
                        created_at: m.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Response::ChatDetails {
            user: self.profile(peer),
            messages,
        }
    }

    /// Store a message; returns the response and the change notifications to push
    fn send_message(
        &mut self,
        sender: &PeerId,
        receiver: &PeerId,
        text: &str,
    ) -> (Response, Vec<(mpsc::Sender<Envelope>, Envelope)>) {
        let text = text.trim();
        if text.is_empty() {
            return (error_response("Message is empty"), Vec::new());
        }
        if sender == receiver {
            return (error_response("Cannot message yourself"), Vec::new());
        }
        if self.user(receiver).is_none() {
            return (
                error_response(&format!("Unknown user {}", receiver)),
                Vec::new(),
            );
        }

        let id = MessageId::new(format!("m{}", self.next_message));
        self.next_message += 1;
        let created_at = Utc::now();

        let history = self
            .conversations
            .entry(pair_key(sender, receiver))
            .or_default();
        if history.len() >= MAX_MESSAGE_HISTORY {
            history.pop_front();
        }
        history.push_back(StoredMessage {
            id: id.clone(),
            sender: sender.clone(),
            text: text.to_string(),
            created_at,
        });

        // Both sides of the pair are notified, each keyed by its own peer
        let mut notify = Vec::new();
        for session in self.sessions.values() {
            let peer_id = if &session.user_id == sender {
                receiver
            } else if &session.user_id == receiver {
                sender
            } else {
                continue;
            };
            if session.subscriptions.contains(peer_id) {
                notify.push((
                    session.tx.clone(),
                    Envelope::Changed {
                        peer_id: peer_id.clone(),
                    },
                ));
            }
        }

        (
            Response::MessageSent {
                message_id: id,
                created_at,
            },
            notify,
        )
    }
}

fn error_response(reason: &str) -> Response {
    Response::Error {
        reason: reason.to_string(),
    }
}

/// Conversation host handle
pub struct ChatServer {
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    /// Start a new server on the given port
    pub async fn start(port: u16, users: Vec<UserRecord>) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, users = users.len(), "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            users,
            sessions: HashMap::new(),
            next_session: 1,
            conversations: HashMap::new(),
            next_message: 1,
        }));

        let state_clone = state.clone();
        let shutdown_clone = shutdown_tx.clone();
        tokio::spawn(accept_loop(listener, state_clone, shutdown_clone));

        Ok(ChatServer {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of authenticated connections
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    #[cfg(test)]
    pub(crate) async fn subscription_count(&self) -> usize {
        let s = self.state.read().await;
        s.sessions.values().map(|session| session.subscriptions.len()).sum()
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let state = state.clone();
                        tokio::spawn(handle_connection(stream, addr, state, shutdown_tx.subscribe()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // First envelope must be Hello
    let user = match tokio::time::timeout(HELLO_TIMEOUT, handle_hello(&mut reader, &state)).await {
        Ok(Ok(user)) => user,
        Ok(Err(e)) => {
            warn!(addr = %addr, error = %e, "Handshake failed");
            let reason = match e {
                Error::Rejected(reason) => reason,
                other => other.to_string(),
            };
            let _ = write_frame(&mut writer, &Envelope::Rejected { reason }).await;
            return;
        }
        Err(_) => {
            warn!(addr = %addr, "Handshake timed out");
            return;
        }
    };

    let (msg_tx, msg_rx) = mpsc::channel(64);
    let session_id = {
        let mut s = state.write().await;
        let id = s.next_session;
        s.next_session += 1;
        s.sessions.insert(
            id,
            Session {
                user_id: user.id.clone(),
                tx: msg_tx.clone(),
                subscriptions: HashSet::new(),
            },
        );
        id
    };

    info!(addr = %addr, user_id = %user.id, session_id = session_id, "User connected");

    let _ = msg_tx.send(Envelope::Welcome { user }).await;
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    // Read loop
    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(env) => handle_envelope(env, session_id, &msg_tx, &state).await,
                    Err(Error::ConnectionClosed) => {
                        debug!(session_id = session_id, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(session_id = session_id, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx.send(Envelope::ServerShutdown).await;
                break;
            }
        }
    }

    // Cleanup: once every sender is gone the writer drains and exits
    let user_id = state
        .write()
        .await
        .sessions
        .remove(&session_id)
        .map(|s| s.user_id);
    drop(msg_tx);
    if tokio::time::timeout(Duration::from_secs(1), writer_handle)
        .await
        .is_err()
    {
        debug!(session_id = session_id, "Writer did not drain in time");
    }

    if let Some(user_id) = user_id {
        info!(user_id = %user_id, session_id = session_id, "User disconnected");
    }
}

/// Authenticate the connection
async fn handle_hello(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<ServerState>>,
) -> Result<PeerProfile> {
    match read_frame(reader).await? {
        Envelope::Hello { token } => {
            let s = state.read().await;

            if s.sessions.len() >= MAX_SESSIONS {
                return Err(Error::Rejected("Server full".into()));
            }

            let user = s
                .user_by_token(&token)
                .ok_or_else(|| Error::Rejected("Invalid token".into()))?;

            Ok(PeerProfile {
                is_live: true,
                ..user.profile()
            })
        }
        _ => Err(Error::Protocol("Expected Hello".into())),
    }
}

/// Writer task - sends envelopes to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(env) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &env).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Handle an incoming envelope from an authenticated session
async fn handle_envelope(
    env: Envelope,
    session_id: u64,
    reply_tx: &mpsc::Sender<Envelope>,
    state: &Arc<RwLock<ServerState>>,
) {
    match env {
        Envelope::Request { request_id, body } => {
            let (response, notify) = handle_request(body, session_id, state).await;
            let _ = reply_tx
                .send(Envelope::Response {
                    request_id,
                    body: response,
                })
                .await;

            for (tx, env) in notify {
                if tx.send(env).await.is_err() {
                    debug!("Failed to queue change notification");
                }
            }
        }
        Envelope::Ping => {
            let _ = reply_tx.send(Envelope::Pong).await;
        }
        _ => {
            debug!(session_id = session_id, "Ignoring unexpected envelope");
        }
    }
}

async fn handle_request(
    request: Request,
    session_id: u64,
    state: &Arc<RwLock<ServerState>>,
) -> (Response, Vec<(mpsc::Sender<Envelope>, Envelope)>) {
    let mut s = state.write().await;
    let Some(user_id) = s.sessions.get(&session_id).map(|ses| ses.user_id.clone()) else {
        return (error_response("Session closed"), Vec::new());
    };

    match request {
        Request::ChatList => (
            Response::ChatList {
                conversations: s.chat_list(&user_id),
            },
            Vec::new(),
        ),
        Request::ChatDetails { peer_id } => (s.chat_details(&user_id, &peer_id), Vec::new()),
        Request::SendMessage { receiver, text } => {
            let (response, notify) = s.send_message(&user_id, &receiver, &text);
            if let Response::MessageSent { message_id, .. } = &response {
                debug!(sender = %user_id, receiver = %receiver, message_id = %message_id, "Stored message");
            }
            (response, notify)
        }
        Request::Subscribe { peer_id } => {
            if s.user(&peer_id).is_none() {
                return (
                    error_response(&format!("Unknown user {}", peer_id)),
                    Vec::new(),
                );
            }
            if let Some(session) = s.sessions.get_mut(&session_id) {
                session.subscriptions.insert(peer_id);
            }
            (Response::Subscribed, Vec::new())
        }
        Request::Unsubscribe { peer_id } => {
            if let Some(session) = s.sessions.get_mut(&session_id) {
                session.subscriptions.remove(&peer_id);
            }
            (Response::Unsubscribed, Vec::new())
        }
    }
}
