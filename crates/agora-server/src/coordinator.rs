//! Per-connection chat protocol.
//!
//! The coordinator authenticates a connection, registers it with presence,
//! sends the initial snapshot, routes inbound events to the store and fans
//! results out through the hub. Everything that broadcasts runs under one
//! ordering lock, so message ids, broadcast order and presence notices agree
//! for every connection. Work that writes the store and then broadcasts runs
//! on its own task: a caller that goes away mid-event (closed socket,
//! abandoned request) cannot leave a stored message that was never sent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agora_shared::constants::{
    DEFAULT_GRACE_PERIOD_MS, DEFAULT_HISTORY_PAGE_SIZE, MAX_MESSAGE_CHARS,
};
use agora_shared::protocol::{ChatMessageView, ClientEvent, ServerEvent, UserSummary};
use agora_shared::types::ConnectMode;
use agora_shared::{ConnectionId, MessageId, Reason, UserId};
use agora_store::{Mentions, SoftDeleted, Store, User};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::hub::{Hub, OUTBOUND_QUEUE};
use crate::presence::{DepartureToken, PresenceRegistry};
use crate::rate_limit::RateLimiter;
use crate::render::render_message;
use crate::scheduler::DepartureScheduler;
use crate::session::SessionTable;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub grace_period: Duration,
    pub history_page_size: usize,
    pub messages_per_minute: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            messages_per_minute: 30,
        }
    }
}

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user: UserId,
}

/// An accepted connection. `events` yields everything to write to the socket,
/// starting with the initial snapshot.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<ServerEvent>,
}

struct Inner {
    store: Store,
    sessions: Arc<SessionTable>,
    presence: PresenceRegistry,
    hub: Hub,
    scheduler: Arc<dyn DepartureScheduler>,
    chat_limiter: RateLimiter<UserId>,
    settings: CoordinatorSettings,
    order: Mutex<()>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: Store,
        sessions: Arc<SessionTable>,
        scheduler: Arc<dyn DepartureScheduler>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                sessions,
                presence: PresenceRegistry::new(),
                hub: Hub::new(),
                scheduler,
                chat_limiter: RateLimiter::per_minute(settings.messages_per_minute),
                settings,
                order: Mutex::new(()),
            }),
        }
    }

    pub async fn online_count(&self) -> usize {
        self.inner.presence.online_count().await
    }

    pub async fn roster(&self) -> Vec<UserSummary> {
        self.inner.presence.snapshot().await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.hub.connection_count().await
    }

    /// Accept a connection for the user behind `session`. `None` means the
    /// session is missing, expired or points at a deleted account; the caller
    /// answers `auth-required` and closes.
    pub async fn connect(&self, session: Option<&str>, mode: ConnectMode) -> Option<Connection> {
        let inner = &self.inner;
        let user_id = match session {
            Some(token) => inner.sessions.resolve(token).await,
            None => None,
        };
        let Some(user_id) = user_id else {
            debug!("connection rejected: no valid session");
            return None;
        };
        let Some(user) = inner.store.user(user_id).await else {
            info!(user = %user_id, "connection rejected: account no longer exists");
            return None;
        };

        let me = user.summary();
        let handle = ConnectionHandle {
            id: ConnectionId::new(),
            user: user_id,
        };
        let (tx, events) = mpsc::channel(OUTBOUND_QUEUE);

        let _order = inner.order.lock().await;
        inner.hub.add(handle.id, user_id, tx).await;
        let registered = inner.presence.register(me.clone(), handle.id).await;
        let roster = inner.presence.snapshot().await;
        let online_count = roster.len();

        let init = match mode {
            ConnectMode::Presence => ServerEvent::PresenceInit {
                me: me.clone(),
                roster: roster.clone(),
                online_count,
            },
            ConnectMode::Chat => {
                let (history, history_done) = self.history_page(None).await;
                ServerEvent::ChatInit {
                    me: me.clone(),
                    history,
                    history_done,
                    online_count,
                    roster: roster.clone(),
                }
            }
        };
        inner.hub.send_to(handle.id, init).await;

        if registered.is_first_connection {
            self.broadcast_presence(format!("{} joined", me.display_name), roster)
                .await;
        }

        debug!(conn = %handle.id, user = %user_id, ?mode, "connection accepted");
        Some(Connection { handle, events })
    }

    /// Tear down a connection. Dropping a user's last connection starts the
    /// departure grace period.
    pub async fn disconnect(&self, conn: ConnectionHandle) {
        let inner = &self.inner;
        inner.hub.remove(conn.id).await;
        let Some(token) = inner.presence.unregister(conn.user, conn.id).await else {
            return;
        };

        let this = self.clone();
        inner.scheduler.schedule(
            inner.settings.grace_period,
            Box::pin(async move { this.finish_departure(conn.user, token).await }),
        );
    }

    async fn finish_departure(&self, user: UserId, token: DepartureToken) {
        let inner = &self.inner;
        let _order = inner.order.lock().await;
        let Some(summary) = inner.presence.expire(user, token).await else {
            return;
        };
        let roster = inner.presence.snapshot().await;
        self.broadcast_presence(format!("{} left", summary.display_name), roster)
            .await;
    }

    /// System notice, then the new roster, then the new count.
    async fn broadcast_presence(&self, text: String, roster: Vec<UserSummary>) {
        let hub = &self.inner.hub;
        let n = roster.len();
        hub.broadcast(&ServerEvent::SystemMessage {
            text,
            time: Utc::now(),
        })
        .await;
        hub.broadcast(&ServerEvent::RosterUpdate { roster }).await;
        hub.broadcast(&ServerEvent::OnlineCount { n }).await;
    }

    pub async fn handle_event(&self, conn: ConnectionHandle, event: ClientEvent) {
        match event {
            ClientEvent::ChatMessage { content, reply_to } => {
                self.on_chat_message(conn, &content, reply_to).await
            }
            ClientEvent::DeleteMessage { message_id } => self.on_delete(conn, message_id).await,
            ClientEvent::HistoryRequest { before_id } => self.on_history(conn, before_id).await,
        }
    }

    /// Private error reply to one connection.
    pub async fn reject(&self, conn: ConnectionHandle, reason: Reason, detail: impl Into<String>) {
        let detail = detail.into();
        debug!(conn = %conn.id, reason = reason.as_str(), %detail, "event rejected");
        self.inner
            .hub
            .send_to(conn.id, ServerEvent::error(reason, detail))
            .await;
    }

    async fn on_chat_message(&self, conn: ConnectionHandle, content: &str, reply_to: Option<MessageId>) {
        let inner = &self.inner;
        let text = content.trim();
        if text.is_empty() {
            return self.reject(conn, Reason::ValidationFailed, "message is empty").await;
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return self
                .reject(
                    conn,
                    Reason::ValidationFailed,
                    format!("message longer than {MAX_MESSAGE_CHARS} characters"),
                )
                .await;
        }

        let Some(author) = inner.store.user(conn.user).await else {
            return self
                .reject(conn, Reason::Unauthenticated, "account no longer exists")
                .await;
        };
        if !author.verified {
            return self
                .reject(conn, Reason::PermissionDenied, "verify your email before chatting")
                .await;
        }
        if !inner.chat_limiter.check(conn.user).await {
            return self
                .reject(conn, Reason::RateLimited, "too many messages, slow down")
                .await;
        }

        let reply_to = match reply_to {
            Some(id) if inner.store.message(id).await.is_some() => Some(id),
            Some(id) => {
                debug!(reply_to = %id, "unknown reply target dropped");
                None
            }
            None => None,
        };
        let mentions = inner.store.resolve_mentions(text, author.id).await;

        let this = self.clone();
        let text = text.to_string();
        detached(async move { this.commit_chat_message(author, text, reply_to, mentions).await })
            .await;
    }

    async fn commit_chat_message(
        &self,
        author: User,
        text: String,
        reply_to: Option<MessageId>,
        mentions: Mentions,
    ) {
        let inner = &self.inner;
        let _order = inner.order.lock().await;
        let message = inner
            .store
            .append_message(Some(author.id), &text, Utc::now(), reply_to)
            .await;
        let view = render_message(&inner.store, &inner.presence, &message, Some(&mentions)).await;

        let notice = (!mentions.is_empty()).then(|| ServerEvent::Mention {
            from: author.summary(),
            text: message.content.clone(),
            html: view.html.clone(),
            time: message.created_at,
        });

        inner.hub.broadcast(&ServerEvent::ChatMessage(view)).await;
        if let Some(notice) = notice {
            for user in &mentions.ordered_ids {
                let reached = inner.hub.send_to_user(*user, &notice).await;
                debug!(message = %message.id, user = %user, reached, "mention delivered");
            }
        }
    }

    async fn on_delete(&self, conn: ConnectionHandle, message_id: MessageId) {
        let this = self.clone();
        detached(async move { this.commit_delete(conn, message_id).await }).await;
    }

    async fn commit_delete(&self, conn: ConnectionHandle, message_id: MessageId) {
        let inner = &self.inner;
        let _order = inner.order.lock().await;
        match inner.store.soft_delete_message(message_id, conn.user).await {
            Ok(SoftDeleted { already: false }) => {
                inner
                    .hub
                    .broadcast(&ServerEvent::MessageDeleted { message_id })
                    .await;
            }
            Ok(SoftDeleted { already: true }) => {
                inner
                    .hub
                    .send_to(conn.id, ServerEvent::MessageDeleted { message_id })
                    .await;
            }
            Err(e) => match e.reason() {
                Some(reason) => self.reject(conn, reason, e.to_string()).await,
                None => warn!(error = %e, "delete failed"),
            },
        }
    }

    async fn on_history(&self, conn: ConnectionHandle, before: Option<MessageId>) {
        let (messages, done) = self.history_page(before).await;
        self.inner
            .hub
            .send_to(conn.id, ServerEvent::History { messages, done })
            .await;
    }

    /// One rendered page of history older than `before`, and whether it was
    /// the last one.
    async fn history_page(&self, before: Option<MessageId>) -> (Vec<ChatMessageView>, bool) {
        let inner = &self.inner;
        let limit = inner.settings.history_page_size;
        let page = inner.store.page_messages(limit, before).await;
        let done = page.len() < limit;

        let mut views = Vec::with_capacity(page.len());
        for message in &page {
            views.push(render_message(&inner.store, &inner.presence, message, None).await);
        }
        (views, done)
    }

    /// Post a system-authored message to everyone.
    pub async fn announce(&self, text: &str) -> Result<ChatMessageView, ServerError> {
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ServerError::BadRequest(format!(
                "announcement must be 1 to {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let this = self.clone();
        let text = text.to_string();
        detached(async move { this.commit_announcement(text).await })
            .await
            .ok_or_else(|| ServerError::Internal("announcement task cancelled".into()))
    }

    async fn commit_announcement(&self, text: String) -> ChatMessageView {
        let inner = &self.inner;
        let _order = inner.order.lock().await;
        let message = inner.store.append_message(None, &text, Utc::now(), None).await;
        let view = render_message(&inner.store, &inner.presence, &message, None).await;
        inner
            .hub
            .broadcast(&ServerEvent::ChatMessage(view.clone()))
            .await;
        info!(message = %message.id, "announcement posted");
        view
    }

    /// Drop per-user chat buckets idle for longer than `max_idle`.
    pub async fn purge_idle_limits(&self, max_idle: Duration) {
        self.inner
            .chat_limiter
            .purge_stale(max_idle.as_secs_f64())
            .await;
    }
}

/// Run `work` on its own task and wait for it. Dropping the waiting future
/// leaves the task running to completion. `None` only if the runtime is
/// shutting down.
async fn detached<T, F>(work: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(value) => Some(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            warn!(error = %e, "ordered task cancelled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_store::{MemoryBackend, StoreConfig, User};

    use crate::scheduler::{ManualScheduler, TokioScheduler};

    struct Fixture {
        coordinator: Coordinator,
        scheduler: Arc<ManualScheduler>,
        store: Store,
        sessions: Arc<SessionTable>,
    }

    async fn fixture_with(settings: CoordinatorSettings) -> Fixture {
        let store = Store::open(Arc::new(MemoryBackend::new()), StoreConfig::default())
            .await
            .unwrap();
        let sessions = Arc::new(SessionTable::new(Duration::from_secs(3600)));
        let scheduler = Arc::new(ManualScheduler::default());
        let coordinator =
            Coordinator::new(store.clone(), sessions.clone(), scheduler.clone(), settings);
        Fixture {
            coordinator,
            scheduler,
            store,
            sessions,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(CoordinatorSettings {
            history_page_size: 5,
            ..Default::default()
        })
        .await
    }

    impl Fixture {
        async fn user(&self, name: &str, verified: bool) -> (User, String) {
            let email = format!("{}@example.com", name.to_lowercase());
            let user = self.store.create_user(&email, name, "hash").await.unwrap();
            let user = if verified {
                self.store.set_verified(user.id, true).await.unwrap()
            } else {
                user
            };
            let token = self.sessions.issue(user.id).await;
            (user, token)
        }

        async fn connect(&self, token: &str) -> Connection {
            self.coordinator
                .connect(Some(token), ConnectMode::Chat)
                .await
                .unwrap()
        }

        async fn say(&self, conn: &Connection, text: &str) {
            self.coordinator
                .handle_event(
                    conn.handle,
                    ClientEvent::ChatMessage {
                        content: text.into(),
                        reply_to: None,
                    },
                )
                .await;
        }
    }

    fn drain(conn: &mut Connection) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = conn.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn errors(events: &[ServerEvent]) -> Vec<Reason> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Error { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_message_with_mention_reaches_the_mentioned_user() {
        let f = fixture().await;
        let (_, token_a) = f.user("A", true).await;
        let (b, token_b) = f.user("B", true).await;
        let mut a_conn = f.connect(&token_a).await;
        let mut b_conn = f.connect(&token_b).await;
        drain(&mut a_conn);
        drain(&mut b_conn);

        f.say(&a_conn, "hello @B").await;

        let to_b = drain(&mut b_conn);
        let chat: Vec<_> = to_b
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ChatMessage(view) => Some(view),
                _ => None,
            })
            .collect();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].content, "hello @B");
        assert_eq!(chat[0].mentions, vec![b.id]);
        assert!(chat[0].html.contains(r#"class="mention""#));

        let mentions: Vec<_> = to_b
            .iter()
            .filter(|e| matches!(e, ServerEvent::Mention { .. }))
            .collect();
        assert_eq!(mentions.len(), 1);
        let ServerEvent::Mention { from, text, .. } = mentions[0] else {
            unreachable!()
        };
        assert_eq!(text, "hello @B");
        assert_eq!(from.display_name, "A");

        // The sender sees the message but no mention notice.
        let to_a = drain(&mut a_conn);
        assert!(matches!(to_a.as_slice(), [ServerEvent::ChatMessage(_)]));
    }

    #[tokio::test]
    async fn test_mention_reaches_every_connection_of_the_recipient() {
        let f = fixture().await;
        let (_, token_a) = f.user("A", true).await;
        let (_, token_b) = f.user("B", true).await;
        let a_conn = f.connect(&token_a).await;
        let mut b1 = f.connect(&token_b).await;
        let mut b2 = f.connect(&token_b).await;
        drain(&mut b1);
        drain(&mut b2);

        f.say(&a_conn, "@b @B ping").await;
        for conn in [&mut b1, &mut b2] {
            let events = drain(conn);
            let count = events
                .iter()
                .filter(|e| matches!(e, ServerEvent::Mention { .. }))
                .count();
            assert_eq!(count, 1);
        }
    }

    #[tokio::test]
    async fn test_last_connection_drop_broadcasts_leave_after_grace() {
        let f = fixture().await;
        let (_, token_x) = f.user("X", true).await;
        let (_, token_y) = f.user("Y", true).await;
        let x_conn = f.connect(&token_x).await;
        let mut y_conn = f.connect(&token_y).await;
        drain(&mut y_conn);

        f.coordinator.disconnect(x_conn.handle).await;
        assert_eq!(f.scheduler.pending(), 1);
        // Nothing happens until the grace period elapses.
        assert!(drain(&mut y_conn).is_empty());
        assert_eq!(f.coordinator.online_count().await, 2);

        f.scheduler.fire_all().await;
        let events = drain(&mut y_conn);
        assert_eq!(events.len(), 3);
        match &events[0] {
            ServerEvent::SystemMessage { text, .. } => assert_eq!(text, "X left"),
            other => panic!("expected system message, got {other:?}"),
        }
        match &events[1] {
            ServerEvent::RosterUpdate { roster } => {
                let names: Vec<_> = roster.iter().map(|u| u.display_name.as_str()).collect();
                assert_eq!(names, vec!["Y"]);
            }
            other => panic!("expected roster update, got {other:?}"),
        }
        assert_eq!(events[2], ServerEvent::OnlineCount { n: 1 });
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_suppresses_leave_and_join() {
        let f = fixture().await;
        let (_, token_x) = f.user("X", true).await;
        let (_, token_y) = f.user("Y", true).await;
        let x_conn = f.connect(&token_x).await;
        let mut y_conn = f.connect(&token_y).await;
        drain(&mut y_conn);

        f.coordinator.disconnect(x_conn.handle).await;
        let _x_again = f.connect(&token_x).await;
        // The departure fires after the reconnect won the race.
        f.scheduler.fire_all().await;

        assert!(drain(&mut y_conn).is_empty());
        assert_eq!(f.coordinator.online_count().await, 2);
    }

    #[tokio::test]
    async fn test_second_connection_joins_once_and_partial_drop_is_silent() {
        let f = fixture().await;
        let (_, token_y) = f.user("Y", true).await;
        let (_, token_x) = f.user("X", true).await;
        let mut y_conn = f.connect(&token_y).await;
        drain(&mut y_conn);

        let x1 = f.connect(&token_x).await;
        let _x2 = f.connect(&token_x).await;
        let joins: Vec<_> = drain(&mut y_conn)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::SystemMessage { text, .. } if text == "X joined"))
            .collect();
        assert_eq!(joins.len(), 1);

        f.coordinator.disconnect(x1.handle).await;
        assert_eq!(f.scheduler.pending(), 0);
        assert!(drain(&mut y_conn).is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_a_live_session_and_account() {
        let f = fixture().await;
        assert!(f.coordinator.connect(None, ConnectMode::Chat).await.is_none());
        assert!(f
            .coordinator
            .connect(Some("bogus"), ConnectMode::Chat)
            .await
            .is_none());

        let (user, token) = f.user("A", true).await;
        f.store.delete_user(user.id).await.unwrap();
        assert!(f
            .coordinator
            .connect(Some(&token), ConnectMode::Presence)
            .await
            .is_none());
        assert_eq!(f.coordinator.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_initial_payload_depends_on_mode() {
        let f = fixture().await;
        let (a, token) = f.user("A", true).await;
        for i in 0..7 {
            f.store
                .append_message(Some(a.id), &format!("m{i}"), Utc::now(), None)
                .await;
        }

        let mut presence = f
            .coordinator
            .connect(Some(&token), ConnectMode::Presence)
            .await
            .unwrap();
        match presence.events.try_recv().unwrap() {
            ServerEvent::PresenceInit {
                me,
                roster,
                online_count,
            } => {
                assert_eq!(me.id, a.id);
                assert_eq!(roster, vec![me]);
                assert_eq!(online_count, 1);
            }
            other => panic!("expected presence-init, got {other:?}"),
        }
        // First connection: the join notice follows the snapshot.
        assert!(matches!(
            presence.events.try_recv().unwrap(),
            ServerEvent::SystemMessage { .. }
        ));

        let mut chat = f.connect(&token).await;
        match chat.events.try_recv().unwrap() {
            ServerEvent::ChatInit {
                history,
                history_done,
                online_count,
                ..
            } => {
                let ids: Vec<u64> = history.iter().map(|m| m.id.0).collect();
                assert_eq!(ids, vec![3, 4, 5, 6, 7]);
                assert!(!history_done);
                assert_eq!(online_count, 1);
            }
            other => panic!("expected chat-init, got {other:?}"),
        }
        // Not the first connection, so no join notice.
        assert!(chat.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_request_walks_backwards() {
        let f = fixture().await;
        let (a, token) = f.user("A", true).await;
        for i in 0..7 {
            f.store
                .append_message(Some(a.id), &format!("m{i}"), Utc::now(), None)
                .await;
        }
        let mut conn = f.connect(&token).await;
        drain(&mut conn);

        f.coordinator
            .handle_event(
                conn.handle,
                ClientEvent::HistoryRequest {
                    before_id: Some(MessageId(3)),
                },
            )
            .await;
        match drain(&mut conn).as_slice() {
            [ServerEvent::History { messages, done }] => {
                let ids: Vec<u64> = messages.iter().map(|m| m.id.0).collect();
                assert_eq!(ids, vec![1, 2]);
                assert!(*done);
            }
            other => panic!("expected one history event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_messages_are_rejected_privately() {
        let f = fixture().await;
        let (_, token_a) = f.user("A", true).await;
        let (_, token_u) = f.user("U", false).await;
        let mut a_conn = f.connect(&token_a).await;
        let mut u_conn = f.connect(&token_u).await;
        drain(&mut a_conn);
        drain(&mut u_conn);

        f.say(&a_conn, "   ").await;
        f.say(&a_conn, &"x".repeat(MAX_MESSAGE_CHARS + 1)).await;
        f.say(&u_conn, "let me in").await;

        assert_eq!(
            errors(&drain(&mut a_conn)),
            vec![Reason::ValidationFailed, Reason::ValidationFailed]
        );
        assert_eq!(errors(&drain(&mut u_conn)), vec![Reason::PermissionDenied]);
        assert_eq!(f.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_message_at_the_length_limit_is_accepted() {
        let f = fixture().await;
        let (_, token) = f.user("A", true).await;
        let mut conn = f.connect(&token).await;
        drain(&mut conn);

        f.say(&conn, &"x".repeat(MAX_MESSAGE_CHARS)).await;
        assert!(matches!(
            drain(&mut conn).as_slice(),
            [ServerEvent::ChatMessage(_)]
        ));
    }

    #[tokio::test]
    async fn test_delete_flow() {
        let f = fixture().await;
        let (_, token_a) = f.user("A", true).await;
        let (_, token_b) = f.user("B", true).await;
        let mut a_conn = f.connect(&token_a).await;
        let mut b_conn = f.connect(&token_b).await;

        f.say(&a_conn, "oops").await;
        drain(&mut a_conn);
        drain(&mut b_conn);
        let id = MessageId(1);
        let delete = ClientEvent::DeleteMessage { message_id: id };

        // Non-author: private rejection, nothing broadcast.
        f.coordinator.handle_event(b_conn.handle, delete.clone()).await;
        assert_eq!(errors(&drain(&mut b_conn)), vec![Reason::PermissionDenied]);
        assert!(drain(&mut a_conn).is_empty());

        // Author: broadcast to everyone.
        f.coordinator.handle_event(a_conn.handle, delete.clone()).await;
        let deleted = ServerEvent::MessageDeleted { message_id: id };
        assert_eq!(drain(&mut a_conn), vec![deleted.clone()]);
        assert_eq!(drain(&mut b_conn), vec![deleted.clone()]);

        // Repeat: only the requester hears about it.
        f.coordinator.handle_event(a_conn.handle, delete).await;
        assert_eq!(drain(&mut a_conn), vec![deleted]);
        assert!(drain(&mut b_conn).is_empty());

        f.coordinator
            .handle_event(
                a_conn.handle,
                ClientEvent::DeleteMessage {
                    message_id: MessageId(42),
                },
            )
            .await;
        assert_eq!(errors(&drain(&mut a_conn)), vec![Reason::NotFound]);
    }

    #[tokio::test]
    async fn test_chat_rate_limit() {
        let f = fixture_with(CoordinatorSettings {
            messages_per_minute: 2,
            ..Default::default()
        })
        .await;
        let (_, token) = f.user("A", true).await;
        let mut conn = f.connect(&token).await;
        drain(&mut conn);

        for i in 0..3 {
            f.say(&conn, &format!("m{i}")).await;
        }
        let events = drain(&mut conn);
        assert_eq!(errors(&events), vec![Reason::RateLimited]);
        assert_eq!(f.store.message_count().await, 2);
    }

    #[tokio::test]
    async fn test_purging_idle_limits_drops_user_buckets() {
        let f = fixture_with(CoordinatorSettings {
            messages_per_minute: 1,
            ..Default::default()
        })
        .await;
        let (_, token) = f.user("A", true).await;
        let mut conn = f.connect(&token).await;
        drain(&mut conn);

        f.say(&conn, "first").await;
        f.say(&conn, "second").await;
        assert_eq!(errors(&drain(&mut conn)), vec![Reason::RateLimited]);

        f.coordinator.purge_idle_limits(Duration::ZERO).await;
        f.say(&conn, "third").await;
        assert!(errors(&drain(&mut conn)).is_empty());
        assert_eq!(f.store.message_count().await, 2);
    }

    #[tokio::test]
    async fn test_accepted_message_is_broadcast_when_sender_task_is_aborted() {
        let f = fixture().await;
        let (_, token_a) = f.user("A", true).await;
        let (_, token_b) = f.user("B", true).await;
        let a_conn = f.connect(&token_a).await;
        let mut b_conn = f.connect(&token_b).await;
        drain(&mut b_conn);

        // Stall the event between acceptance and commit.
        let order = f.coordinator.inner.order.lock().await;
        let coordinator = f.coordinator.clone();
        let handle = a_conn.handle;
        let sender = tokio::spawn(async move {
            coordinator
                .handle_event(
                    handle,
                    ClientEvent::ChatMessage {
                        content: "still delivered".into(),
                        reply_to: None,
                    },
                )
                .await
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        sender.abort();
        let _ = sender.await;
        drop(order);

        let event = tokio::time::timeout(Duration::from_secs(1), b_conn.events.recv())
            .await
            .unwrap()
            .unwrap();
        let ServerEvent::ChatMessage(view) = event else {
            panic!("expected a chat message, got {event:?}");
        };
        assert_eq!(view.content, "still delivered");
        assert_eq!(f.store.message_count().await, 1);
    }

    #[tokio::test]
    async fn test_accepted_delete_is_broadcast_when_sender_task_is_aborted() {
        let f = fixture().await;
        let (a, token_a) = f.user("A", true).await;
        let (_, token_b) = f.user("B", true).await;
        let a_conn = f.connect(&token_a).await;
        let mut b_conn = f.connect(&token_b).await;
        let message = f
            .store
            .append_message(Some(a.id), "oops", Utc::now(), None)
            .await;
        drain(&mut b_conn);

        let order = f.coordinator.inner.order.lock().await;
        let coordinator = f.coordinator.clone();
        let handle = a_conn.handle;
        let sender = tokio::spawn(async move {
            coordinator
                .handle_event(
                    handle,
                    ClientEvent::DeleteMessage {
                        message_id: message.id,
                    },
                )
                .await
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        sender.abort();
        let _ = sender.await;
        drop(order);

        let event = tokio::time::timeout(Duration::from_secs(1), b_conn.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ServerEvent::MessageDeleted {
                message_id: message.id
            }
        );
        assert!(f.store.message(message.id).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_broadcast_order_matches_id_order() {
        let f = fixture().await;
        let (_, token_a) = f.user("A", true).await;
        let (_, token_b) = f.user("B", true).await;
        let a_conn = f.connect(&token_a).await;
        let b_conn = f.connect(&token_b).await;
        let (_, token_o) = f.user("O", true).await;
        let mut observer = f.connect(&token_o).await;
        drain(&mut observer);

        let mut tasks = Vec::new();
        for i in 0..10 {
            let coordinator = f.coordinator.clone();
            let handle = if i % 2 == 0 { a_conn.handle } else { b_conn.handle };
            tasks.push(tokio::spawn(async move {
                coordinator
                    .handle_event(
                        handle,
                        ClientEvent::ChatMessage {
                            content: format!("m{i}"),
                            reply_to: None,
                        },
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let ids: Vec<u64> = drain(&mut observer)
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ChatMessage(view) => Some(view.id.0),
                _ => None,
            })
            .collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_announcement_is_system_authored() {
        let f = fixture().await;
        let (_, token) = f.user("A", true).await;
        let mut conn = f.connect(&token).await;
        drain(&mut conn);

        let view = f.coordinator.announce("maintenance at noon").await.unwrap();
        assert!(view.author.is_none());
        assert_eq!(drain(&mut conn), vec![ServerEvent::ChatMessage(view)]);
        assert!(matches!(
            f.coordinator.announce("  ").await,
            Err(ServerError::BadRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_with_real_timers() {
        let store = Store::open(Arc::new(MemoryBackend::new()), StoreConfig::default())
            .await
            .unwrap();
        let sessions = Arc::new(SessionTable::new(Duration::from_secs(3600)));
        let coordinator = Coordinator::new(
            store.clone(),
            sessions.clone(),
            Arc::new(TokioScheduler),
            CoordinatorSettings::default(),
        );
        let x = store.create_user("x@example.com", "X", "h").await.unwrap();
        let y = store.create_user("y@example.com", "Y", "h").await.unwrap();
        let token_x = sessions.issue(x.id).await;
        let token_y = sessions.issue(y.id).await;

        let x_conn = coordinator
            .connect(Some(&token_x), ConnectMode::Chat)
            .await
            .unwrap();
        let mut y_conn = coordinator
            .connect(Some(&token_y), ConnectMode::Chat)
            .await
            .unwrap();
        drain(&mut y_conn);

        // Flap: drop and come back after one second.
        coordinator.disconnect(x_conn.handle).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let x_again = coordinator
            .connect(Some(&token_x), ConnectMode::Chat)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut y_conn).is_empty());

        // Real departure.
        coordinator.disconnect(x_again.handle).await;
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(drain(&mut y_conn).is_empty());
        tokio::time::sleep(Duration::from_millis(600)).await;
        let events = drain(&mut y_conn);
        assert!(matches!(
            &events[0],
            ServerEvent::SystemMessage { text, .. } if text == "X left"
        ));
        assert_eq!(coordinator.online_count().await, 1);
    }
}
