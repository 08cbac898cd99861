//! TCP client for a conversation host
//!
//! One connection task owns the socket, the in-flight requests and the
//! local subscribers; the `ChatClient` handle talks to it over a command
//! channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use duet_core::{ChatMessage, ConversationSnapshot, ConversationSummary, PeerId, PeerProfile, SendAck};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::api::{ConversationApi, NotificationSource, Subscription};
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame, FrameReader};
use crate::protocol::{Envelope, Request, Response};

/// Time allowed for the Hello/Welcome exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client handle for network operations
pub struct ChatClient {
    me: PeerProfile,
    cmd_tx: mpsc::Sender<ClientCommand>,
    /// Unbounded so a dropped `Subscription` never loses its unsubscribe
    cancel_tx: mpsc::UnboundedSender<Cancel>,
    request_timeout: Duration,
    next_subscriber: AtomicU64,
}

/// A local subscriber that went away
struct Cancel {
    peer_id: PeerId,
    subscriber_id: u64,
}

enum ClientCommand {
    Request {
        body: Request,
        reply: oneshot::Sender<Response>,
    },
    Subscribe {
        peer_id: PeerId,
        subscriber_id: u64,
        signals: mpsc::Sender<()>,
        reply: oneshot::Sender<Response>,
    },
    Disconnect,
}

impl ChatClient {
    /// Connect and authenticate with a bearer token
    pub async fn connect(addr: &str, token: &str, request_timeout: Duration) -> Result<Self> {
        info!(addr = %addr, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(
            &mut writer,
            &Envelope::Hello {
                token: token.to_string(),
            },
        )
        .await?;

        let me = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
            Err(_) => return Err(Error::Timeout(HANDSHAKE_TIMEOUT)),
            Ok(Ok(Envelope::Welcome { user })) => user,
            Ok(Ok(Envelope::Rejected { reason })) => {
                warn!(reason = %reason, "Connection rejected");
                return Err(Error::Rejected(reason));
            }
            Ok(Ok(_)) => return Err(Error::Protocol("Expected Welcome".into())),
            Ok(Err(e)) => return Err(e),
        };

        info!(user_id = %me.id, "Authenticated");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection_task(reader, writer, cmd_rx, cancel_rx));

        Ok(ChatClient {
            me,
            cmd_tx,
            cancel_tx,
            request_timeout,
            next_subscriber: AtomicU64::new(1),
        })
    }

    /// Profile of the authenticated user
    pub fn me(&self) -> &PeerProfile {
        &self.me
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    async fn request(&self, body: Request) -> Result<Response> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Request { body, reply })
            .await
            .map_err(|_| Error::NotConnected)?;
        self.await_response(reply_rx).await
    }

    async fn await_response(&self, reply_rx: oneshot::Receiver<Response>) -> Result<Response> {
        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Err(_) => Err(Error::Timeout(self.request_timeout)),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Ok(Ok(Response::Error { reason })) => Err(Error::Remote(reason)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

fn unexpected(response: Response) -> Error {
    Error::Protocol(format!("Unexpected response: {:?}", response))
}

impl ConversationApi for ChatClient {
    async fn fetch_conversation(&self, peer: &PeerId) -> Result<ConversationSnapshot> {
        let request = Request::ChatDetails {
            peer_id: peer.clone(),
        };
        match self.request(request).await? {
            Response::ChatDetails { user, messages } => Ok(ConversationSnapshot {
                profile: user,
                messages: messages.into_iter().map(ChatMessage::from).collect(),
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn send_message(&self, peer: &PeerId, text: &str) -> Result<SendAck> {
        let request = Request::SendMessage {
            receiver: peer.clone(),
            text: text.to_string(),
        };
        match self.request(request).await? {
            Response::MessageSent {
                message_id,
                created_at,
            } => Ok(SendAck {
                message_id,
                created_at,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn chat_list(&self) -> Result<Vec<ConversationSummary>> {
        match self.request(Request::ChatList).await? {
            Response::ChatList { conversations } => Ok(conversations),
            other => Err(unexpected(other)),
        }
    }
}

impl NotificationSource for ChatClient {
    async fn subscribe(&self, peer: &PeerId) -> Result<Subscription> {
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (signals_tx, signals_rx) = mpsc::channel(1);
        let (reply, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(ClientCommand::Subscribe {
                peer_id: peer.clone(),
                subscriber_id,
                signals: signals_tx,
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        let cancel_tx = self.cancel_tx.clone();
        let peer_id = peer.clone();
        let subscription = Subscription::new(signals_rx, move || {
            // Only fails once the connection task is gone, taking the session with it
            if cancel_tx
                .send(Cancel {
                    peer_id,
                    subscriber_id,
                })
                .is_err()
            {
                debug!(subscriber_id = subscriber_id, "Connection gone, nothing to unsubscribe");
            }
        });

        // On failure the dropped subscription unregisters itself
        match self.await_response(reply_rx).await? {
            Response::Subscribed => Ok(subscription),
            other => Err(unexpected(other)),
        }
    }
}

/// State owned by the connection task
struct Connection {
    writer: WriteHalf<TcpStream>,
    next_request_id: u64,
    pending: HashMap<u64, oneshot::Sender<Response>>,
    subscribers: HashMap<PeerId, HashMap<u64, mpsc::Sender<()>>>,
    /// Cancels that overtook their own queued Subscribe
    cancelled_early: HashSet<u64>,
}

impl Connection {
    async fn send_request(
        &mut self,
        body: Request,
        reply: Option<oneshot::Sender<Response>>,
    ) -> Result<()> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        if let Some(reply) = reply {
            self.pending.insert(request_id, reply);
        }
        write_frame(&mut self.writer, &Envelope::Request { request_id, body }).await
    }

    async fn subscribe(
        &mut self,
        peer_id: PeerId,
        subscriber_id: u64,
        signals: mpsc::Sender<()>,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        if self.cancelled_early.remove(&subscriber_id) {
            let _ = reply.send(Response::Subscribed);
            return Ok(());
        }
        let local = self.subscribers.entry(peer_id.clone()).or_default();
        let first = local.is_empty();
        local.insert(subscriber_id, signals);

        if first {
            self.send_request(Request::Subscribe { peer_id }, Some(reply))
                .await
        } else {
            let _ = reply.send(Response::Subscribed);
            Ok(())
        }
    }

    async fn unsubscribe(&mut self, peer_id: PeerId, subscriber_id: u64) -> Result<()> {
        let removed = self
            .subscribers
            .get_mut(&peer_id)
            .and_then(|local| local.remove(&subscriber_id));
        if removed.is_none() {
            self.cancelled_early.insert(subscriber_id);
            return Ok(());
        }
        let Some(local) = self.subscribers.get_mut(&peer_id) else {
            return Ok(());
        };
        if !local.is_empty() {
            return Ok(());
        }
        self.subscribers.remove(&peer_id);
        debug!(peer_id = %peer_id, "Last subscriber gone, unsubscribing");
        self.send_request(Request::Unsubscribe { peer_id }, None).await
    }

    fn handle_envelope(&mut self, env: Envelope) {
        match env {
            Envelope::Response { request_id, body } => match self.pending.remove(&request_id) {
                Some(reply) => {
                    let _ = reply.send(body);
                }
                None => debug!(request_id = request_id, "Response without waiter"),
            },
            Envelope::Changed { peer_id } => {
                // A full channel already holds an undelivered signal; closed
                // ones are removed by their subscriber's cancel
                if let Some(local) = self.subscribers.get(&peer_id) {
                    for tx in local.values() {
                        let _ = tx.try_send(());
                    }
                }
            }
            Envelope::Pong => {
                debug!("Received pong");
            }
            _ => {
                debug!("Ignoring unexpected envelope");
            }
        }
    }
}

/// Main connection task
async fn connection_task(
    reader: ReadHalf<TcpStream>,
    writer: WriteHalf<TcpStream>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    mut cancel_rx: mpsc::UnboundedReceiver<Cancel>,
) {
    let mut conn = Connection {
        writer,
        next_request_id: 1,
        pending: HashMap::new(),
        subscribers: HashMap::new(),
        cancelled_early: HashSet::new(),
    };

    let mut frames = FrameReader::spawn(reader);

    loop {
        // Cancels go out ahead of later requests
        tokio::select! {
            biased;

            Some(Cancel { peer_id, subscriber_id }) = cancel_rx.recv() => {
                if let Err(e) = conn.unsubscribe(peer_id, subscriber_id).await {
                    warn!(error = %e, "Write error");
                    break;
                }
            }

            result = frames.next() => {
                match result {
                    Ok(Envelope::ServerShutdown) => {
                        info!("Server is shutting down");
                        break;
                    }
                    Ok(env) => conn.handle_envelope(env),
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let result = match cmd {
                    Some(ClientCommand::Request { body, reply }) => {
                        conn.send_request(body, Some(reply)).await
                    }
                    Some(ClientCommand::Subscribe { peer_id, subscriber_id, signals, reply }) => {
                        conn.subscribe(peer_id, subscriber_id, signals, reply).await
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "Write error");
                    break;
                }
            }
        }
    }

    // Dropping the connection fails every waiter and ends every subscription
    info!(
        pending = conn.pending.len(),
        subscriptions = conn.subscribers.len(),
        "Disconnected from server"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ChatServer;
    use duet_core::UserRecord;

    fn users() -> Vec<UserRecord> {
        vec![
            UserRecord {
                id: PeerId::new("u1"),
                name: "Alice".into(),
                token: "alice-token".into(),
                profile_image: None,
            },
            UserRecord {
                id: PeerId::new("u2"),
                name: "Bob".into(),
                token: "bob-token".into(),
                profile_image: None,
            },
        ]
    }

    async fn connect(server: &ChatServer, token: &str) -> Result<ChatClient> {
        let addr = format!("127.0.0.1:{}", server.addr().port());
        ChatClient::connect(&addr, token, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn test_client_connect() {
        let server = ChatServer::start(0, users()).await.unwrap();

        let client = connect(&server, "alice-token").await.unwrap();
        assert_eq!(client.me().name, "Alice");
        assert!(client.chat_list().await.unwrap().is_empty());

        let rejected = connect(&server, "wrong").await;
        assert!(matches!(rejected, Err(Error::Rejected(_))));

        client.disconnect().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_notifies_subscriber_and_fetch_sees_message() {
        let server = ChatServer::start(0, users()).await.unwrap();
        let alice = connect(&server, "alice-token").await.unwrap();
        let bob = connect(&server, "bob-token").await.unwrap();

        let mut sub = alice.subscribe(&PeerId::new("u2")).await.unwrap();

        let ack = bob.send_message(&PeerId::new("u1"), "hi alice").await.unwrap();
        assert_eq!(ack.message_id.as_str(), "m1");

        let signal = tokio::time::timeout(Duration::from_secs(5), sub.next()).await;
        assert_eq!(signal.unwrap(), Some(()));

        let snapshot = alice.fetch_conversation(&PeerId::new("u2")).await.unwrap();
        assert_eq!(snapshot.profile.name, "Bob");
        assert!(snapshot.profile.is_live);
        assert_eq!(snapshot.messages.len(), 1);
        assert!(!snapshot.messages[0].sender_is_local_user);
        assert!(snapshot.messages[0].is_confirmed());

        let list = bob.chat_list().await.unwrap();
        assert_eq!(list[0].peer.name, "Alice");
        assert_eq!(list[0].last_message.as_deref(), Some("hi alice"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_remote_errors_surface() {
        let server = ChatServer::start(0, users()).await.unwrap();
        let alice = connect(&server, "alice-token").await.unwrap();

        let result = alice.fetch_conversation(&PeerId::new("ghost")).await;
        assert!(matches!(result, Err(Error::Remote(_))));

        let result = alice.subscribe(&PeerId::new("ghost")).await;
        assert!(matches!(result, Err(Error::Remote(_))));

        let result = alice.send_message(&PeerId::new("u2"), "  ").await;
        assert!(matches!(result, Err(Error::Remote(_))));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_signals() {
        let server = ChatServer::start(0, users()).await.unwrap();
        let alice = connect(&server, "alice-token").await.unwrap();
        let bob = connect(&server, "bob-token").await.unwrap();
        let bob_id = PeerId::new("u2");

        let first = alice.subscribe(&bob_id).await.unwrap();
        let mut second = alice.subscribe(&bob_id).await.unwrap();
        first.cancel();

        bob.send_message(&PeerId::new("u1"), "still here").await.unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(5), second.next()).await;
        assert_eq!(signal.unwrap(), Some(()));

        second.cancel();
        // Round-trip so the unsubscribe is processed before the next send
        alice.chat_list().await.unwrap();
        bob.send_message(&PeerId::new("u1"), "gone").await.unwrap();

        let mut third = alice.subscribe(&bob_id).await.unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(200), third.next()).await;
        assert!(quiet.is_err());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_shutdown_fails_requests() {
        let server = ChatServer::start(0, users()).await.unwrap();
        let alice = connect(&server, "alice-token").await.unwrap();
        let mut sub = alice.subscribe(&PeerId::new("u2")).await.unwrap();

        server.shutdown();

        let ended = tokio::time::timeout(Duration::from_secs(5), sub.next()).await;
        assert_eq!(ended.unwrap(), None);
        assert!(alice.chat_list().await.is_err());
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Accepts the handshake, then never answers a request
        let host = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = tokio::io::split(stream);
            assert!(matches!(read_frame(&mut reader).await.unwrap(), Envelope::Hello { .. }));
            let user = PeerProfile::new("u1", "Alice");
            write_frame(&mut writer, &Envelope::Welcome { user }).await.unwrap();
            while read_frame(&mut reader).await.is_ok() {}
        });

        let timeout = Duration::from_millis(50);
        let client = ChatClient::connect(&addr, "any", timeout).await.unwrap();
        match client.chat_list().await {
            Err(Error::Timeout(after)) => assert_eq!(after, timeout),
            other => panic!("expected timeout, got {:?}", other.map(|l| l.len())),
        }

        client.disconnect().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), host).await;
    }

    #[tokio::test]
    async fn test_burst_of_cancels_releases_host_subscription() {
        let server = ChatServer::start(0, users()).await.unwrap();
        let alice = connect(&server, "alice-token").await.unwrap();
        let bob_id = PeerId::new("u2");

        // More local subscribers than the command channel holds
        let mut subs = Vec::new();
        for _ in 0..100 {
            subs.push(alice.subscribe(&bob_id).await.unwrap());
        }
        assert_eq!(server.subscription_count().await, 1);

        drop(subs);
        let mut released = false;
        for _ in 0..200 {
            if server.subscription_count().await == 0 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);

        // A fresh subscriber is registered with the host again
        let mut sub = alice.subscribe(&bob_id).await.unwrap();
        assert_eq!(server.subscription_count().await, 1);
        let bob = connect(&server, "bob-token").await.unwrap();
        bob.send_message(&PeerId::new("u1"), "back").await.unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(5), sub.next()).await;
        assert_eq!(signal.unwrap(), Some(()));

        server.shutdown();
    }
}
