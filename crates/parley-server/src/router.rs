//! Message router: validates inbound events, persists what must be
//! durable, fans out to the room via the connection registry, and
//! dispatches enrichment off the delivery path.
//!
//! Error discipline: validation and store failures are answered with an
//! `error` event to the requesting connection only and never broadcast;
//! enrichment failures never surface at all (the coordinator degrades to
//! fallbacks).

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, instrument, warn};

use parley_core::ids::{ChatId, ConnectionId};
use parley_core::protocol::{Attachment, ClientEvent, ServerEvent, WireMessage};
use parley_enrich::{ContextMessage, EnrichmentService};
use parley_store::contacts::ContactRepo;
use parley_store::messages::MessageRepo;
use parley_store::sessions::SessionRepo;
use parley_store::users::UserRepo;
use parley_store::{Database, StoreError};

use crate::registry::ConnectionRegistry;
use crate::rooms::RoomTable;

/// Most-recent messages kept per chat for enrichment context. An
/// optimization over the store, not a source of truth — rebuilt from the
/// store whenever it is missing.
pub const CACHE_WINDOW: usize = 50;

const DB_ERROR_MSG: &str = "A database error occurred. Please try again.";

struct MessageCache {
    inner: DashMap<ChatId, VecDeque<ContextMessage>>,
    window: usize,
}

impl MessageCache {
    fn new(window: usize) -> Self {
        Self {
            inner: DashMap::new(),
            window,
        }
    }

    fn push(&self, chat_id: &ChatId, sender: &str, body: &str) {
        let mut entry = self.inner.entry(chat_id.clone()).or_default();
        entry.push_back(ContextMessage {
            sender: sender.to_string(),
            body: body.to_string(),
        });
        while entry.len() > self.window {
            entry.pop_front();
        }
    }

    fn replace(&self, chat_id: &ChatId, messages: &[WireMessage]) {
        let start = messages.len().saturating_sub(self.window);
        let tail: VecDeque<ContextMessage> = messages[start..]
            .iter()
            .map(|m| ContextMessage {
                sender: m.sender.clone(),
                body: m.body.clone(),
            })
            .collect();
        self.inner.insert(chat_id.clone(), tail);
    }

    fn get(&self, chat_id: &ChatId) -> Vec<ContextMessage> {
        self.inner
            .get(chat_id)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn len(&self, chat_id: &ChatId) -> usize {
        self.inner.get(chat_id).map(|e| e.len()).unwrap_or(0)
    }
}

pub struct MessageRouter {
    db: Database,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomTable>,
    users: UserRepo,
    sessions: SessionRepo,
    messages: MessageRepo,
    contacts: ContactRepo,
    enrich: Arc<EnrichmentService>,
    cache: MessageCache,
}

impl MessageRouter {
    pub fn new(
        db: Database,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomTable>,
        enrich: Arc<EnrichmentService>,
    ) -> Self {
        Self {
            registry,
            rooms,
            users: UserRepo::new(db.clone()),
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            contacts: ContactRepo::new(db.clone()),
            db,
            enrich,
            cache: MessageCache::new(CACHE_WINDOW),
        }
    }

    /// Parse a raw frame and dispatch it. A frame that fails validation
    /// is answered with an error event to this connection only.
    pub async fn handle_raw(&self, conn_id: &ConnectionId, raw: &str) {
        match serde_json::from_str::<ClientEvent>(raw) {
            Ok(event) => self.dispatch(conn_id, event).await,
            Err(e) => {
                debug!(connection_id = %conn_id, error = %e, "malformed client event");
                self.reply_error(conn_id, format!("malformed request: {e}"))
                    .await;
            }
        }
    }

    #[instrument(skip(self, event), fields(connection_id = %conn_id))]
    pub async fn dispatch(&self, conn_id: &ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::RegisterIdentity { email } => {
                self.handle_register_identity(conn_id, email).await;
            }
            ClientEvent::CreateOrGetSession {
                participant_a,
                participant_b,
            } => {
                self.handle_create_session(conn_id, participant_a, participant_b)
                    .await;
            }
            ClientEvent::JoinRoom { chat_id } => {
                self.handle_join_room(conn_id, chat_id).await;
            }
            ClientEvent::SendMessage {
                chat_id,
                sender,
                receiver,
                body,
                attachment,
            } => {
                self.handle_send_message(conn_id, chat_id, sender, receiver, body, attachment)
                    .await;
            }
            ClientEvent::FetchHistory { chat_id } => {
                self.handle_fetch_history(conn_id, chat_id).await;
            }
            ClientEvent::RequestSmartReplies { chat_id } => {
                self.handle_smart_replies(conn_id, chat_id).await;
            }
            ClientEvent::RequestTranslation {
                text,
                target_language,
            } => {
                self.handle_translation(conn_id, text, target_language).await;
            }
            ClientEvent::RequestSummary { chat_id } => {
                self.handle_summary(conn_id, chat_id).await;
            }
            ClientEvent::AddContact {
                user_email,
                contact_email,
            } => {
                self.handle_contact_change(conn_id, user_email, contact_email, true)
                    .await;
            }
            ClientEvent::RemoveContact {
                user_email,
                contact_email,
            } => {
                self.handle_contact_change(conn_id, user_email, contact_email, false)
                    .await;
            }
        }
    }

    /// Full disconnect handling: drop the connection and, when it was the
    /// identity's current one, purge the identity from every room.
    pub fn handle_disconnect(&self, conn_id: &ConnectionId) {
        if let Some(email) = self.registry.unregister(conn_id) {
            self.rooms.purge(&email);
            info!(connection_id = %conn_id, email, "identity disconnected, rooms purged");
        } else {
            debug!(connection_id = %conn_id, "connection closed");
        }
    }

    // ── Handlers ──

    async fn handle_register_identity(&self, conn_id: &ConnectionId, email: String) {
        match self.users.find_by_email(&email) {
            Ok(Some(_)) => {
                if let Some(superseded) = self.registry.bind_identity(conn_id, &email) {
                    debug!(email, superseded = %superseded, "identity rebound to newer connection");
                }
                self.reply(conn_id, &ServerEvent::IdentityRegistered { email })
                    .await;
            }
            Ok(None) => {
                self.reply_error(conn_id, format!("unknown identity: {email}"))
                    .await;
            }
            Err(e) => {
                error!(error = %e, "identity lookup failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
            }
        }
    }

    async fn handle_create_session(
        &self,
        conn_id: &ConnectionId,
        participant_a: String,
        participant_b: String,
    ) {
        let participants = self
            .users
            .find_by_email(&participant_a)
            .and_then(|a| Ok((a, self.users.find_by_email(&participant_b)?)));

        match participants {
            Ok((Some(_), Some(_))) => {}
            Ok(_) => {
                self.reply_error(conn_id, "One or both participants do not exist.")
                    .await;
                return;
            }
            Err(e) => {
                error!(error = %e, "participant lookup failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
                return;
            }
        }

        match self.sessions.create_or_get(&participant_a, &participant_b) {
            Ok(session) => {
                self.reply(conn_id, &ServerEvent::SessionReady { chat_id: session.id })
                    .await;
            }
            Err(e) => {
                error!(error = %e, "session creation failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
            }
        }
    }

    async fn handle_join_room(&self, conn_id: &ConnectionId, chat_id: ChatId) {
        let Some(email) = self.registry.identity_of(conn_id) else {
            self.reply_error(conn_id, "register_identity is required before joining a room")
                .await;
            return;
        };

        let session = match self.sessions.get(&chat_id) {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => {
                self.reply_error(conn_id, format!("unknown chat: {chat_id}"))
                    .await;
                return;
            }
            Err(e) => {
                error!(error = %e, "session lookup failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
                return;
            }
        };

        if !session.is_participant(&email) {
            warn!(email, chat_id = %chat_id, "join rejected: not a participant");
            self.reply_error(conn_id, "only participants may join this room")
                .await;
            return;
        }

        self.rooms.join(&chat_id, &email);
        self.reply(conn_id, &ServerEvent::RoomJoined { chat_id }).await;
    }

    async fn handle_send_message(
        &self,
        conn_id: &ConnectionId,
        chat_id: ChatId,
        sender: String,
        receiver: String,
        body: String,
        attachment: Option<Attachment>,
    ) {
        if body.trim().is_empty() {
            self.reply_error(conn_id, "message body is required").await;
            return;
        }

        let session = match self.sessions.get(&chat_id) {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => {
                self.reply_error(conn_id, format!("unknown chat: {chat_id}"))
                    .await;
                return;
            }
            Err(e) => {
                error!(error = %e, "session lookup failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
                return;
            }
        };

        if !session.is_participant(&sender) {
            self.reply_error(conn_id, "sender is not a participant of this chat")
                .await;
            return;
        }
        if !session.is_participant(&receiver) {
            self.reply_error(conn_id, "receiver is not a participant of this chat")
                .await;
            return;
        }

        // Persist first — a failed write aborts the send with an error to
        // the sender only, and nothing is broadcast.
        let message = match self
            .messages
            .append(&chat_id, &sender, &receiver, &body, attachment.as_ref())
        {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, chat_id = %chat_id, "message persistence failed");
                self.reply_error(conn_id, "An error occurred while sending the message.")
                    .await;
                return;
            }
        };

        self.cache.push(&chat_id, &sender, &body);
        self.broadcast_to_room(
            &chat_id,
            &ServerEvent::MessageDelivered {
                message: message.clone(),
            },
        )
        .await;

        // Enrichment runs off the delivery path. The follow-up goes to
        // whoever is resolvable when it completes; per-connection queues
        // are FIFO, so it can never overtake the delivery above.
        let registry = Arc::clone(&self.registry);
        let rooms = Arc::clone(&self.rooms);
        let enrich = Arc::clone(&self.enrich);
        let messages = MessageRepo::new(self.db.clone());
        let message_id = message.message_id.clone();
        tokio::spawn(async move {
            let enrichment = enrich.enrich_message(&body).await;
            if let Err(e) = messages.set_enrichment(&message_id, &enrichment) {
                warn!(error = %e, message_id = %message_id, "failed to persist enrichment");
            }
            let event = ServerEvent::MessageEnriched {
                message_id,
                chat_id: chat_id.clone(),
                sentiment: enrichment.sentiment,
                language: enrichment.language,
            };
            let Ok(json) = serde_json::to_string(&event) else {
                return;
            };
            for member in rooms.members(&chat_id) {
                registry.send_to_identity(&member, json.clone()).await;
            }
        });
    }

    async fn handle_fetch_history(&self, conn_id: &ConnectionId, chat_id: ChatId) {
        if let Err(event) = self.require_session(&chat_id) {
            self.reply(conn_id, &event).await;
            return;
        }

        let mut messages = match self.messages.list_for_chat(&chat_id) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "history fetch failed");
                self.reply_error(conn_id, "An error occurred while fetching messages.")
                    .await;
                return;
            }
        };

        // Recompute enrichment for anything that still lacks it rather
        // than serving partially-analyzed history.
        for message in messages.iter_mut().filter(|m| m.enrichment.is_none()) {
            let enrichment = self.enrich.enrich_message(&message.body).await;
            if let Err(e) = self.messages.set_enrichment(&message.message_id, &enrichment) {
                warn!(error = %e, message_id = %message.message_id, "failed to persist enrichment");
            }
            message.enrichment = Some(enrichment);
        }

        self.cache.replace(&chat_id, &messages);
        self.reply(conn_id, &ServerEvent::History { chat_id, messages })
            .await;
    }

    async fn handle_smart_replies(&self, conn_id: &ConnectionId, chat_id: ChatId) {
        if let Err(event) = self.require_session(&chat_id) {
            self.reply(conn_id, &event).await;
            return;
        }

        let recent = match self.messages.recent(&chat_id, 5) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "recent message fetch failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
                return;
            }
        };

        let context: Vec<ContextMessage> = recent
            .iter()
            .map(|m| ContextMessage {
                sender: m.sender.clone(),
                body: m.body.clone(),
            })
            .collect();

        let suggestions = self.enrich.suggest_replies(&context).await;
        self.reply(conn_id, &ServerEvent::SmartReplies { chat_id, suggestions })
            .await;
    }

    async fn handle_translation(
        &self,
        conn_id: &ConnectionId,
        text: String,
        target_language: String,
    ) {
        if text.trim().is_empty() {
            self.reply_error(conn_id, "Text is required for translation.")
                .await;
            return;
        }

        let translated = self.enrich.translate(&text, &target_language).await;
        self.reply(
            conn_id,
            &ServerEvent::Translated {
                original: text,
                translated,
                target_language,
            },
        )
        .await;
    }

    async fn handle_summary(&self, conn_id: &ConnectionId, chat_id: ChatId) {
        if let Err(event) = self.require_session(&chat_id) {
            self.reply(conn_id, &event).await;
            return;
        }

        let mut context = self.cache.get(&chat_id);
        if context.is_empty() {
            // Cache was evicted or never seeded — rebuild from the store.
            match self.messages.list_for_chat(&chat_id) {
                Ok(messages) => {
                    self.cache.replace(&chat_id, &messages);
                    context = self.cache.get(&chat_id);
                }
                Err(e) => {
                    error!(error = %e, "history fetch for summary failed");
                    self.reply_error(conn_id, DB_ERROR_MSG).await;
                    return;
                }
            }
        }

        let text = self.enrich.summarize(&context).await;
        self.reply(conn_id, &ServerEvent::Summary { chat_id, text })
            .await;
    }

    async fn handle_contact_change(
        &self,
        conn_id: &ConnectionId,
        user_email: String,
        contact_email: String,
        add: bool,
    ) {
        let both_exist = self
            .users
            .find_by_email(&user_email)
            .and_then(|a| Ok((a, self.users.find_by_email(&contact_email)?)));

        match both_exist {
            Ok((Some(_), Some(_))) => {}
            Ok(_) => {
                self.reply_error(conn_id, "One or both users not found").await;
                return;
            }
            Err(e) => {
                error!(error = %e, "contact user lookup failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
                return;
            }
        }

        let result = if add {
            self.contacts.add_edge(&user_email, &contact_email)
        } else {
            self.contacts.remove_edge(&user_email, &contact_email)
        };

        match result {
            Ok(()) => {
                let event = if add {
                    ServerEvent::ContactAdded {
                        user_email: user_email.clone(),
                        contact_email: contact_email.clone(),
                    }
                } else {
                    ServerEvent::ContactRemoved {
                        user_email: user_email.clone(),
                        contact_email: contact_email.clone(),
                    }
                };
                self.reply(conn_id, &event).await;
                // Notify the other party's live connection, if any.
                if let Ok(json) = serde_json::to_string(&event) {
                    self.registry.send_to_identity(&contact_email, json).await;
                }
            }
            Err(StoreError::Conflict(_)) => {
                self.reply_error(conn_id, "Contact already exists").await;
            }
            Err(e) => {
                error!(error = %e, "contact mutation failed");
                self.reply_error(conn_id, DB_ERROR_MSG).await;
            }
        }
    }

    // ── Helpers ──

    fn require_session(&self, chat_id: &ChatId) -> Result<(), ServerEvent> {
        match self.sessions.get(chat_id) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                Err(ServerEvent::error(format!("unknown chat: {chat_id}")))
            }
            Err(e) => {
                error!(error = %e, "session lookup failed");
                Err(ServerEvent::error(DB_ERROR_MSG))
            }
        }
    }

    async fn reply(&self, conn_id: &ConnectionId, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                self.registry.send_to(conn_id, json).await;
            }
            Err(e) => error!(error = %e, "failed to serialize server event"),
        }
    }

    async fn reply_error(&self, conn_id: &ConnectionId, message: impl Into<String>) {
        self.reply(conn_id, &ServerEvent::error(message)).await;
    }

    /// Fan an event out to every room member with a resolvable
    /// connection. Members without one are silently skipped — they
    /// re-fetch history on reconnect.
    async fn broadcast_to_room(&self, chat_id: &ChatId, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize broadcast event");
                return;
            }
        };
        for member in self.rooms.members(chat_id) {
            self.registry.send_to_identity(&member, json.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parley_core::ids::MessageId;
    use parley_enrich::mock::{MockBackend, MockResponse};
    use parley_enrich::{EnrichConfig, RetryPolicy};
    use tokio::sync::mpsc;

    struct Harness {
        router: Arc<MessageRouter>,
        registry: Arc<ConnectionRegistry>,
        db: Database,
        backend: Arc<MockBackend>,
    }

    fn fast_config() -> EnrichConfig {
        EnrichConfig {
            request_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter_factor: 0.0,
            },
        }
    }

    fn harness(responses: Vec<MockResponse>) -> Harness {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        users.create("alice", "alice@x.com", None).unwrap();
        users.create("bob", "bob@x.com", None).unwrap();
        users.create("carol", "carol@x.com", None).unwrap();

        let registry = Arc::new(ConnectionRegistry::new(64));
        let rooms = Arc::new(RoomTable::new());
        let backend = Arc::new(MockBackend::new(responses));
        let enrich = Arc::new(EnrichmentService::new(backend.clone(), fast_config()));
        let router = Arc::new(MessageRouter::new(
            db.clone(),
            Arc::clone(&registry),
            rooms,
            enrich,
        ));

        Harness {
            router,
            registry,
            db,
            backend,
        }
    }

    async fn connect(h: &Harness, email: &str) -> (ConnectionId, mpsc::Receiver<String>) {
        let (id, mut rx) = h.registry.register();
        h.router
            .dispatch(
                &id,
                ClientEvent::RegisterIdentity {
                    email: email.to_string(),
                },
            )
            .await;
        let ack: ServerEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(ack, ServerEvent::IdentityRegistered { .. }));
        (id, rx)
    }

    async fn open_chat(h: &Harness, conn: &ConnectionId, rx: &mut mpsc::Receiver<String>, a: &str, b: &str) -> ChatId {
        h.router
            .dispatch(
                conn,
                ClientEvent::CreateOrGetSession {
                    participant_a: a.to_string(),
                    participant_b: b.to_string(),
                },
            )
            .await;
        match serde_json::from_str(&rx.recv().await.unwrap()).unwrap() {
            ServerEvent::SessionReady { chat_id } => chat_id,
            other => panic!("expected SessionReady, got {other:?}"),
        }
    }

    async fn join(h: &Harness, conn: &ConnectionId, rx: &mut mpsc::Receiver<String>, chat_id: &ChatId) {
        h.router
            .dispatch(conn, ClientEvent::JoinRoom { chat_id: chat_id.clone() })
            .await;
        match serde_json::from_str(&rx.recv().await.unwrap()).unwrap() {
            ServerEvent::RoomJoined { .. } => {}
            other => panic!("expected RoomJoined, got {other:?}"),
        }
    }

    async fn recv_event(rx: &mut mpsc::Receiver<String>) -> ServerEvent {
        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        serde_json::from_str(&raw).unwrap()
    }

    fn send_event(chat_id: &ChatId, sender: &str, receiver: &str, body: &str) -> ClientEvent {
        ClientEvent::SendMessage {
            chat_id: chat_id.clone(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            body: body.to_string(),
            attachment: None,
        }
    }

    // ── Identity ──

    #[tokio::test]
    async fn register_unknown_identity_errors() {
        let h = harness(vec![]);
        let (id, mut rx) = h.registry.register();
        h.router
            .dispatch(&id, ClientEvent::RegisterIdentity { email: "ghost@x.com".into() })
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::Error { message } => assert!(message.contains("ghost@x.com")),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    // ── Sessions ──

    #[tokio::test]
    async fn create_session_idempotent_across_both_ends() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (bob, mut bob_rx) = connect(&h, "bob@x.com").await;

        let c1 = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        let c2 = open_chat(&h, &bob, &mut bob_rx, "bob@x.com", "alice@x.com").await;
        assert_eq!(c1, c2);
    }

    #[tokio::test]
    async fn create_session_unknown_participant_errors() {
        let h = harness(vec![]);
        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(
                &alice,
                ClientEvent::CreateOrGetSession {
                    participant_a: "alice@x.com".into(),
                    participant_b: "ghost@x.com".into(),
                },
            )
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "One or both participants do not exist.");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    // ── Rooms ──

    #[tokio::test]
    async fn join_requires_registered_identity() {
        let h = harness(vec![]);
        let (id, mut rx) = h.registry.register();
        h.router
            .dispatch(&id, ClientEvent::JoinRoom { chat_id: ChatId::from_raw("c1") })
            .await;
        assert!(matches!(recv_event(&mut rx).await, ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn join_rejects_non_participant() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (carol, mut carol_rx) = connect(&h, "carol@x.com").await;

        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        h.router
            .dispatch(&carol, ClientEvent::JoinRoom { chat_id: chat.clone() })
            .await;
        match recv_event(&mut carol_rx).await {
            ServerEvent::Error { message } => {
                assert!(message.contains("participants"), "got: {message}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_unknown_chat_errors() {
        let h = harness(vec![]);
        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(&alice, ClientEvent::JoinRoom { chat_id: ChatId::from_raw("chat_nope") })
            .await;
        assert!(matches!(recv_event(&mut rx).await, ServerEvent::Error { .. }));
    }

    // ── Send + fan-out ──

    #[tokio::test]
    async fn message_delivered_once_to_each_connected_member() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (bob, mut bob_rx) = connect(&h, "bob@x.com").await;

        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        join(&h, &alice, &mut alice_rx, &chat).await;
        join(&h, &bob, &mut bob_rx, &chat).await;

        h.router
            .dispatch(&alice, send_event(&chat, "alice@x.com", "bob@x.com", "hi"))
            .await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            match recv_event(rx).await {
                ServerEvent::MessageDelivered { message } => {
                    assert_eq!(message.body, "hi");
                    assert_eq!(message.sender, "alice@x.com");
                }
                other => panic!("expected MessageDelivered, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn enrichment_follows_delivery_with_same_message_id() {
        let h = harness(vec![MockResponse::Json(serde_json::json!([
            {"label": "positive", "score": 0.91}
        ]))]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (bob, mut bob_rx) = connect(&h, "bob@x.com").await;

        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        join(&h, &alice, &mut alice_rx, &chat).await;
        join(&h, &bob, &mut bob_rx, &chat).await;

        h.router
            .dispatch(&alice, send_event(&chat, "alice@x.com", "bob@x.com", "hi"))
            .await;

        let delivered_id = match recv_event(&mut bob_rx).await {
            ServerEvent::MessageDelivered { message } => {
                assert_eq!(message.sender, "alice@x.com");
                assert_eq!(message.body, "hi");
                message.message_id
            }
            other => panic!("expected MessageDelivered, got {other:?}"),
        };

        match recv_event(&mut bob_rx).await {
            ServerEvent::MessageEnriched { message_id, sentiment, language, .. } => {
                assert_eq!(message_id, delivered_id);
                assert_eq!(sentiment.label, "positive");
                assert_eq!(language, "en");
            }
            other => panic!("expected MessageEnriched, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absent_member_gets_no_delivery_but_sees_history() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;

        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        join(&h, &alice, &mut alice_rx, &chat).await;

        // Bob never connects. Send succeeds and delivers to alice only.
        h.router
            .dispatch(&alice, send_event(&chat, "alice@x.com", "bob@x.com", "hi bob"))
            .await;
        assert!(matches!(
            recv_event(&mut alice_rx).await,
            ServerEvent::MessageDelivered { .. }
        ));

        // Bob connects later and fetches history.
        let (bob, mut bob_rx) = connect(&h, "bob@x.com").await;
        h.router
            .dispatch(&bob, ClientEvent::FetchHistory { chat_id: chat.clone() })
            .await;
        match recv_event(&mut bob_rx).await {
            ServerEvent::History { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].body, "hi bob");
            }
            other => panic!("expected History, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persistence_failure_sends_error_to_sender_only() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (bob, mut bob_rx) = connect(&h, "bob@x.com").await;

        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        join(&h, &alice, &mut alice_rx, &chat).await;
        join(&h, &bob, &mut bob_rx, &chat).await;

        // Break the messages table so the insert fails.
        h.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE messages")?;
            Ok(())
        })
        .unwrap();

        h.router
            .dispatch(&alice, send_event(&chat, "alice@x.com", "bob@x.com", "doomed"))
            .await;

        assert!(matches!(recv_event(&mut alice_rx).await, ServerEvent::Error { .. }));
        // Nothing was broadcast to bob.
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_participant_sender_rejected() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (carol, mut carol_rx) = connect(&h, "carol@x.com").await;

        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        h.router
            .dispatch(&carol, send_event(&chat, "carol@x.com", "bob@x.com", "hi"))
            .await;
        assert!(matches!(recv_event(&mut carol_rx).await, ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn empty_body_rejected() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;

        h.router
            .dispatch(&alice, send_event(&chat, "alice@x.com", "bob@x.com", "   "))
            .await;
        assert!(matches!(recv_event(&mut alice_rx).await, ServerEvent::Error { .. }));
    }

    // ── Disconnect ──

    #[tokio::test]
    async fn disconnect_purges_rooms_and_send_still_succeeds() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (bob, mut bob_rx) = connect(&h, "bob@x.com").await;

        let chat = open_chat(&h, &alice, &mut alice_rx, "alice@x.com", "bob@x.com").await;
        join(&h, &alice, &mut alice_rx, &chat).await;
        join(&h, &bob, &mut bob_rx, &chat).await;

        h.router.handle_disconnect(&bob);
        drop(bob_rx);

        h.router
            .dispatch(&alice, send_event(&chat, "alice@x.com", "bob@x.com", "still here"))
            .await;
        assert!(matches!(
            recv_event(&mut alice_rx).await,
            ServerEvent::MessageDelivered { .. }
        ));
    }

    // ── History ──

    #[tokio::test]
    async fn history_recomputes_missing_enrichment() {
        let h = harness(vec![MockResponse::Json(serde_json::json!([
            {"label": "positive", "score": 0.88}
        ]))]);
        // Seed a message directly, bypassing send (no enrichment yet).
        let sessions = SessionRepo::new(h.db.clone());
        let chat = sessions.create_or_get("alice@x.com", "bob@x.com").unwrap().id;
        let messages = MessageRepo::new(h.db.clone());
        messages
            .append(&chat, "alice@x.com", "bob@x.com", "what a great day", None)
            .unwrap();

        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(&alice, ClientEvent::FetchHistory { chat_id: chat.clone() })
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::History { messages, .. } => {
                let enrichment = messages[0].enrichment.as_ref().expect("enrichment recomputed");
                assert_eq!(enrichment.sentiment.label, "positive");
            }
            other => panic!("expected History, got {other:?}"),
        }

        // Second fetch serves the stored enrichment without a model call.
        let calls_after_first = h.backend.call_count();
        h.router
            .dispatch(&alice, ClientEvent::FetchHistory { chat_id: chat })
            .await;
        recv_event(&mut rx).await;
        assert_eq!(h.backend.call_count(), calls_after_first);
    }

    // ── Summary ──

    #[tokio::test]
    async fn summary_of_short_chat_is_not_enough_content_without_model_call() {
        let h = harness(vec![]);
        let sessions = SessionRepo::new(h.db.clone());
        let chat = sessions.create_or_get("alice@x.com", "bob@x.com").unwrap().id;
        let messages = MessageRepo::new(h.db.clone());
        messages.append(&chat, "alice@x.com", "bob@x.com", "hi", None).unwrap();
        messages.append(&chat, "bob@x.com", "alice@x.com", "hey", None).unwrap();

        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(&alice, ClientEvent::RequestSummary { chat_id: chat })
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::Summary { text, .. } => {
                assert_eq!(text, parley_enrich::service::NOT_ENOUGH_CONTENT);
            }
            other => panic!("expected Summary, got {other:?}"),
        }
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn summary_rebuilds_cache_from_store() {
        let h = harness(vec![MockResponse::Json(serde_json::json!([
            {"summary_text": "They made plans."}
        ]))]);
        let sessions = SessionRepo::new(h.db.clone());
        let chat = sessions.create_or_get("alice@x.com", "bob@x.com").unwrap().id;
        let messages = MessageRepo::new(h.db.clone());
        for body in [
            "shall we take that trip to the coast next weekend",
            "yes I was thinking exactly the same thing",
            "great, I will book the rooms tomorrow morning then",
        ] {
            messages.append(&chat, "alice@x.com", "bob@x.com", body, None).unwrap();
        }

        // Cache is cold — the router must rebuild it from the store.
        assert_eq!(h.router.cache.len(&chat), 0);

        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(&alice, ClientEvent::RequestSummary { chat_id: chat.clone() })
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::Summary { text, .. } => assert_eq!(text, "They made plans."),
            other => panic!("expected Summary, got {other:?}"),
        }
        assert_eq!(h.router.cache.len(&chat), 3);
    }

    // ── Translation ──

    #[tokio::test]
    async fn translation_replies_to_requester() {
        let h = harness(vec![MockResponse::Json(serde_json::json!([
            {"translation_text": "hola"}
        ]))]);
        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(
                &alice,
                ClientEvent::RequestTranslation {
                    text: "hello".into(),
                    target_language: "es".into(),
                },
            )
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::Translated { original, translated, target_language } => {
                assert_eq!(original, "hello");
                assert_eq!(translated, "hola");
                assert_eq!(target_language, "es");
            }
            other => panic!("expected Translated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn translation_empty_text_errors() {
        let h = harness(vec![]);
        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(
                &alice,
                ClientEvent::RequestTranslation {
                    text: "  ".into(),
                    target_language: "es".into(),
                },
            )
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "Text is required for translation.");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    // ── Smart replies ──

    #[tokio::test]
    async fn smart_replies_from_empty_chat_are_openers() {
        let h = harness(vec![]);
        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        let chat = open_chat(&h, &alice, &mut rx, "alice@x.com", "bob@x.com").await;

        h.router
            .dispatch(&alice, ClientEvent::RequestSmartReplies { chat_id: chat })
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::SmartReplies { suggestions, .. } => {
                assert_eq!(suggestions, parley_enrich::fallback::opener_replies());
            }
            other => panic!("expected SmartReplies, got {other:?}"),
        }
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn smart_replies_degrade_to_canned_acks_when_backend_down() {
        let h = harness(vec![]);
        let sessions = SessionRepo::new(h.db.clone());
        let chat = sessions.create_or_get("alice@x.com", "bob@x.com").unwrap().id;
        MessageRepo::new(h.db.clone())
            .append(&chat, "alice@x.com", "bob@x.com", "movie tonight?", None)
            .unwrap();

        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .dispatch(&alice, ClientEvent::RequestSmartReplies { chat_id: chat })
            .await;
        match recv_event(&mut rx).await {
            ServerEvent::SmartReplies { suggestions, .. } => {
                assert_eq!(suggestions, parley_enrich::fallback::ack_replies());
            }
            other => panic!("expected SmartReplies, got {other:?}"),
        }
    }

    // ── Contacts ──

    #[tokio::test]
    async fn add_contact_notifies_both_sides_and_is_symmetric() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (_bob, mut bob_rx) = connect(&h, "bob@x.com").await;

        h.router
            .dispatch(
                &alice,
                ClientEvent::AddContact {
                    user_email: "alice@x.com".into(),
                    contact_email: "bob@x.com".into(),
                },
            )
            .await;

        assert!(matches!(recv_event(&mut alice_rx).await, ServerEvent::ContactAdded { .. }));
        assert!(matches!(recv_event(&mut bob_rx).await, ServerEvent::ContactAdded { .. }));

        let contacts = ContactRepo::new(h.db.clone());
        assert_eq!(contacts.list("alice@x.com").unwrap(), vec!["bob@x.com"]);
        assert_eq!(contacts.list("bob@x.com").unwrap(), vec!["alice@x.com"]);
    }

    #[tokio::test]
    async fn remove_contact_clears_both_directions() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;

        ContactRepo::new(h.db.clone())
            .add_edge("alice@x.com", "bob@x.com")
            .unwrap();

        h.router
            .dispatch(
                &alice,
                ClientEvent::RemoveContact {
                    user_email: "alice@x.com".into(),
                    contact_email: "bob@x.com".into(),
                },
            )
            .await;
        assert!(matches!(recv_event(&mut alice_rx).await, ServerEvent::ContactRemoved { .. }));

        let contacts = ContactRepo::new(h.db.clone());
        assert!(contacts.list("alice@x.com").unwrap().is_empty());
        assert!(contacts.list("bob@x.com").unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_contact_errors() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;

        ContactRepo::new(h.db.clone())
            .add_edge("alice@x.com", "bob@x.com")
            .unwrap();

        h.router
            .dispatch(
                &alice,
                ClientEvent::AddContact {
                    user_email: "alice@x.com".into(),
                    contact_email: "bob@x.com".into(),
                },
            )
            .await;
        match recv_event(&mut alice_rx).await {
            ServerEvent::Error { message } => assert_eq!(message, "Contact already exists"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    // ── Raw frames ──

    #[tokio::test]
    async fn malformed_frame_answered_with_error_to_sender_only() {
        let h = harness(vec![]);
        let (alice, mut alice_rx) = connect(&h, "alice@x.com").await;
        let (_bob, mut bob_rx) = connect(&h, "bob@x.com").await;

        h.router.handle_raw(&alice, "{not json").await;
        match recv_event(&mut alice_rx).await {
            ServerEvent::Error { message } => assert!(message.contains("malformed")),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn well_formed_frame_dispatches() {
        let h = harness(vec![]);
        let (alice, mut rx) = connect(&h, "alice@x.com").await;
        h.router
            .handle_raw(
                &alice,
                r#"{"event":"create_or_get_session","participant_a":"alice@x.com","participant_b":"bob@x.com"}"#,
            )
            .await;
        assert!(matches!(recv_event(&mut rx).await, ServerEvent::SessionReady { .. }));
    }

    // ── Cache ──

    #[test]
    fn cache_window_is_bounded() {
        let cache = MessageCache::new(3);
        let chat = ChatId::from_raw("c1");
        for i in 0..10 {
            cache.push(&chat, "alice@x.com", &format!("m{i}"));
        }
        let context = cache.get(&chat);
        assert_eq!(context.len(), 3);
        assert_eq!(context[0].body, "m7");
        assert_eq!(context[2].body, "m9");
    }

    #[test]
    fn cache_replace_keeps_tail() {
        let cache = MessageCache::new(2);
        let chat = ChatId::from_raw("c1");
        let messages: Vec<WireMessage> = (0..4)
            .map(|i| WireMessage {
                message_id: MessageId::from_raw(format!("m{i}")),
                chat_id: chat.clone(),
                sender: "alice@x.com".into(),
                receiver: "bob@x.com".into(),
                body: format!("b{i}"),
                attachment: None,
                timestamp: "2026-01-01T00:00:00Z".into(),
                enrichment: None,
            })
            .collect();
        cache.replace(&chat, &messages);
        let context = cache.get(&chat);
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].body, "b2");
    }
}
