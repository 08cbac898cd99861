//! Conversation sync controller
//!
//! Owns the message list of one open conversation and reconciles three
//! inputs into it: fetches of the server's copy, change notifications, and
//! optimistic local sends.
//!
//! All state lives in a single actor task. Callers talk to it through
//! `ConversationSyncController`; every command is acknowledged only after
//! its effect has been published, so a caller that awaits `send_message`
//! already sees the pending message in `messages()`.

use std::sync::Arc;
use std::time::Duration;

use duet_core::invariants::{assert_peer_id_valid, assert_sequence_invariants};
use duet_core::{
    merge_fetched, ChatMessage, ConversationSnapshot, DeliveryState, MessageId, PeerId,
    PeerProfile, SendAck, SyncSettings,
};
use duet_net::{ConversationApi, NotificationSource, Subscription};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::viewmodel::{ConversationView, SyncFault};

/// Capacity of the command channel
const COMMAND_BUFFER: usize = 32;

/// Errors returned to callers of the controller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("Conversation controller has shut down")]
    Closed,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("No conversation is open")]
    NoConversation,

    #[error("Peer id must not be blank")]
    InvalidPeer,

    #[error("Unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("Message {0} has not failed")]
    NotFailed(MessageId),
}

/// Refresh behaviour of a controller
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub enable_realtime: bool,
    pub poll_interval: Option<Duration>,
    pub match_window: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl SyncOptions {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            enable_realtime: settings.enable_realtime,
            poll_interval: settings.poll_interval(),
            match_window: settings.match_window(),
        }
    }
}

enum Command {
    Initialize {
        peer: PeerId,
        done: oneshot::Sender<Result<(), ControllerError>>,
    },
    Signal {
        done: oneshot::Sender<()>,
    },
    Send {
        text: String,
        done: oneshot::Sender<Result<MessageId, ControllerError>>,
    },
    Retry {
        id: MessageId,
        done: oneshot::Sender<Result<(), ControllerError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Identity of the conversation a piece of async work was started for
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    generation: u64,
    peer: PeerId,
}

/// Results of work spawned by the actor
enum Completion {
    Fetched {
        ticket: Ticket,
        result: duet_net::Result<ConversationSnapshot>,
    },
    Sent {
        ticket: Ticket,
        local_id: MessageId,
        result: duet_net::Result<SendAck>,
    },
    Subscribed {
        ticket: Ticket,
        result: duet_net::Result<Subscription>,
    },
}

/// Handle to a running conversation controller
///
/// Dropping the handle tears the conversation down.
pub struct ConversationSyncController {
    cmd_tx: mpsc::Sender<Command>,
    view_rx: watch::Receiver<ConversationView>,
}

impl ConversationSyncController {
    /// Start a controller on the current tokio runtime
    pub fn spawn<A, N>(api: Arc<A>, notifier: Arc<N>, options: SyncOptions) -> Self
    where
        A: ConversationApi,
        N: NotificationSource,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view_rx) = watch::channel(ConversationView::default());
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let actor = SyncActor {
            api,
            notifier,
            options,
            view_tx,
            done_tx,
            generation: 0,
            peer: None,
            profile: None,
            messages: Vec::new(),
            fetch_in_flight: false,
            refetch_requested: false,
            error: None,
            subscription: None,
        };
        tokio::spawn(actor.run(cmd_rx, done_rx));

        Self { cmd_tx, view_rx }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (done, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(command(done))
            .await
            .map_err(|_| ControllerError::Closed)?;
        done_rx.await.map_err(|_| ControllerError::Closed)
    }

    /// Open the conversation with `peer`
    ///
    /// Resets state and starts the initial fetch. Calling it again for the
    /// conversation that is already open does nothing. A blank peer id is
    /// rejected and leaves the open conversation untouched.
    pub async fn initialize(&self, peer: PeerId) -> Result<(), ControllerError> {
        self.call(|done| Command::Initialize { peer, done }).await?
    }

    /// The conversation may have changed remotely; re-fetch (coalesced)
    pub async fn on_external_signal(&self) -> Result<(), ControllerError> {
        self.call(|done| Command::Signal { done }).await
    }

    /// Optimistically append a message and send it
    ///
    /// Returns the local id of the pending message.
    pub async fn send_message(&self, text: &str) -> Result<MessageId, ControllerError> {
        let text = text.to_string();
        self.call(|done| Command::Send { text, done }).await?
    }

    /// Re-send a message whose delivery failed
    pub async fn retry(&self, id: &MessageId) -> Result<(), ControllerError> {
        let id = id.clone();
        self.call(|done| Command::Retry { id, done }).await?
    }

    /// Tear down the conversation and stop the actor
    pub async fn shutdown(&self) {
        let _ = self.call(|done| Command::Shutdown { done }).await;
    }

    /// Current messages, newest first
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.view_rx.borrow().newest_first().cloned().collect()
    }

    /// Current snapshot of the conversation
    pub fn view(&self) -> ConversationView {
        self.view_rx.borrow().clone()
    }

    /// Receiver that is notified on every published change
    pub fn watch(&self) -> watch::Receiver<ConversationView> {
        self.view_rx.clone()
    }
}

struct SyncActor<A, N> {
    api: Arc<A>,
    notifier: Arc<N>,
    options: SyncOptions,
    view_tx: watch::Sender<ConversationView>,
    done_tx: mpsc::UnboundedSender<Completion>,
    /// Bumped whenever the open conversation changes
    generation: u64,
    peer: Option<PeerId>,
    profile: Option<PeerProfile>,
    /// Oldest first
    messages: Vec<ChatMessage>,
    fetch_in_flight: bool,
    /// A signal arrived while a fetch was in flight
    refetch_requested: bool,
    error: Option<SyncFault>,
    subscription: Option<Subscription>,
}

impl<A, N> SyncActor<A, N>
where
    A: ConversationApi,
    N: NotificationSource,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut poll: Option<Interval> = self.options.poll_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => {
                            debug!("Controller handle dropped");
                            self.close_conversation();
                            break;
                        }
                    }
                }

                Some(completion) = done_rx.recv() => {
                    self.handle_completion(completion);
                }

                signal = async {
                    match self.subscription.as_mut() {
                        Some(sub) => sub.next().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match signal {
                        Some(()) => {
                            debug!("Change notification received");
                            self.request_fetch();
                        }
                        None => {
                            warn!("Notification source closed; realtime updates stopped");
                            self.subscription = None;
                        }
                    }
                    self.publish();
                }

                _ = async {
                    match poll.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.request_fetch();
                    self.publish();
                }
            }
        }

        debug!("Conversation controller stopped");
    }

    /// Returns false once the actor should stop
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Initialize { peer, done } => {
                let result = self.open_conversation(peer);
                self.publish();
                let _ = done.send(result);
            }
            Command::Signal { done } => {
                self.request_fetch();
                self.publish();
                let _ = done.send(());
            }
            Command::Send { text, done } => {
                let result = self.send(text);
                self.publish();
                let _ = done.send(result);
            }
            Command::Retry { id, done } => {
                let result = self.retry(id);
                self.publish();
                let _ = done.send(result);
            }
            Command::Shutdown { done } => {
                self.close_conversation();
                self.publish();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn ticket(&self) -> Option<Ticket> {
        self.peer.as_ref().map(|peer| Ticket {
            generation: self.generation,
            peer: peer.clone(),
        })
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        ticket.generation == self.generation && self.peer.as_ref() == Some(&ticket.peer)
    }

    fn open_conversation(&mut self, peer: PeerId) -> Result<(), ControllerError> {
        if peer.is_empty() {
            warn!(peer = ?peer.as_str(), "Rejecting blank peer id");
            return Err(ControllerError::InvalidPeer);
        }
        if self.peer.as_ref() == Some(&peer) {
            debug!(peer = %peer, "Conversation already open");
            return Ok(());
        }
        assert_peer_id_valid(&peer, "open_conversation");

        self.close_conversation();
        info!(peer = %peer, generation = self.generation, "Opening conversation");
        self.peer = Some(peer);

        self.start_fetch();
        if self.options.enable_realtime {
            self.start_subscribe();
        }
        Ok(())
    }

    /// Forget the open conversation; late results become stale
    fn close_conversation(&mut self) {
        if let Some(sub) = self.subscription.take() {
            sub.cancel();
        }
        if let Some(peer) = self.peer.take() {
            info!(peer = %peer, "Closing conversation");
        }
        self.generation += 1;
        self.profile = None;
        self.messages.clear();
        self.fetch_in_flight = false;
        self.refetch_requested = false;
        self.error = None;
    }

    fn request_fetch(&mut self) {
        if self.peer.is_none() {
            return;
        }
        if self.fetch_in_flight {
            debug!("Fetch in flight, coalescing signal");
            self.refetch_requested = true;
        } else {
            self.start_fetch();
        }
    }

    fn start_fetch(&mut self) {
        let Some(ticket) = self.ticket() else {
            return;
        };
        self.fetch_in_flight = true;

        let api = self.api.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_conversation(&ticket.peer).await;
            let _ = done_tx.send(Completion::Fetched { ticket, result });
        });
    }

    fn start_subscribe(&mut self) {
        let Some(ticket) = self.ticket() else {
            return;
        };

        let notifier = self.notifier.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = notifier.subscribe(&ticket.peer).await;
            let _ = done_tx.send(Completion::Subscribed { ticket, result });
        });
    }

    fn start_send(&mut self, ticket: Ticket, local_id: MessageId, text: String) {
        let api = self.api.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = api.send_message(&ticket.peer, &text).await;
            let _ = done_tx.send(Completion::Sent {
                ticket,
                local_id,
                result,
            });
        });
    }

    /// Insert keeping the sequence ordered; equal timestamps go last
    fn insert_ordered(&mut self, msg: ChatMessage) {
        let at = self
            .messages
            .partition_point(|m| m.created_at <= msg.created_at);
        self.messages.insert(at, msg);
    }

    fn send(&mut self, text: String) -> Result<MessageId, ControllerError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ControllerError::EmptyMessage);
        }
        let ticket = self.ticket().ok_or(ControllerError::NoConversation)?;

        let msg = ChatMessage::pending(text);
        let local_id = msg.id.clone();
        debug!(peer = %ticket.peer, local_id = %local_id, "Sending message");

        self.insert_ordered(msg);
        self.start_send(ticket, local_id.clone(), text.to_string());
        Ok(local_id)
    }

    fn retry(&mut self, id: MessageId) -> Result<(), ControllerError> {
        let ticket = self.ticket().ok_or(ControllerError::NoConversation)?;
        let index = self
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| ControllerError::UnknownMessage(id.clone()))?;
        if self.messages[index].delivery != DeliveryState::Failed {
            return Err(ControllerError::NotFailed(id));
        }

        let mut msg = self.messages.remove(index);
        msg.delivery = DeliveryState::Pending;
        msg.created_at = chrono::Utc::now();
        let text = msg.text.clone();
        self.insert_ordered(msg);

        info!(peer = %ticket.peer, local_id = %id, "Retrying message");
        self.start_send(ticket, id, text);
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched { ticket, result } => {
                if !self.is_current(&ticket) {
                    debug!(peer = %ticket.peer, "Discarding stale fetch result");
                    return;
                }
                self.fetch_in_flight = false;
                self.apply_fetch(result);

                if self.refetch_requested {
                    self.refetch_requested = false;
                    self.start_fetch();
                }
            }
            Completion::Sent {
                ticket,
                local_id,
                result,
            } => {
                if !self.is_current(&ticket) {
                    debug!(peer = %ticket.peer, local_id = %local_id, "Discarding stale send result");
                    return;
                }
                match result {
                    Ok(ack) => {
                        debug!(local_id = %local_id, message_id = %ack.message_id, "Message accepted");
                    }
                    Err(e) => {
                        warn!(peer = %ticket.peer, local_id = %local_id, error = %e, "Send failed");
                        // Already reconciled by a fetch if the entry is gone
                        if let Some(msg) = self
                            .messages
                            .iter_mut()
                            .find(|m| m.id == local_id && m.delivery == DeliveryState::Pending)
                        {
                            msg.delivery = DeliveryState::Failed;
                        }
                    }
                }
            }
            Completion::Subscribed { ticket, result } => {
                if !self.is_current(&ticket) {
                    debug!(peer = %ticket.peer, "Discarding stale subscription");
                    return;
                }
                match result {
                    Ok(sub) => {
                        debug!(peer = %ticket.peer, "Subscribed to change notifications");
                        self.subscription = Some(sub);
                    }
                    Err(e) => {
                        warn!(peer = %ticket.peer, error = %e, "Realtime updates unavailable");
                    }
                }
            }
        }
        self.publish();
    }

    fn apply_fetch(&mut self, result: duet_net::Result<ConversationSnapshot>) {
        match result {
            Ok(snapshot) => {
                let window = chrono::Duration::from_std(self.options.match_window)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let fetched = snapshot.messages.len();
                self.messages = merge_fetched(&self.messages, snapshot.messages, window);
                assert_sequence_invariants(&self.messages);
                self.profile = Some(snapshot.profile);
                self.error = None;
                debug!(
                    fetched = fetched,
                    total = self.messages.len(),
                    "Merged conversation"
                );
            }
            Err(e) => {
                warn!(error = %e, "Conversation fetch failed");
                self.error = Some(SyncFault::Fetch(e.to_string()));
            }
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(ConversationView {
            peer: self.peer.clone(),
            profile: self.profile.clone(),
            messages: Arc::from(self.messages.as_slice()),
            loading: self.fetch_in_flight,
            error: self.error.clone(),
        });
    }
}
