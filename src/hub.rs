//! Hub actor implementation
//!
//! The single authority over the set of registered clients. Every membership
//! change and every fan-out runs inside the hub task, one command at a time,
//! so no broadcast ever sees a half-updated registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::client::{Client, Outbound};
use crate::config::HubConfig;
use crate::error::{AdmissionError, AppError, SendError};
use crate::message::{ErrorCode, Message, WELCOME_TEXT};
use crate::store::MessageStore;
use crate::types::ClientId;

/// Channel buffer size for hub commands
pub const COMMAND_BUFFER_SIZE: usize = 1024;

/// Commands sent from client actors to the hub
#[derive(Debug)]
pub enum HubCommand {
    /// Add a client; fails if the name is taken
    Register {
        client: Client,
        reply: oneshot::Sender<Result<(), AdmissionError>>,
    },
    /// Remove a client (no-op if absent)
    Unregister { client_id: ClientId },
    /// Persist, then fan out to everyone
    Broadcast { message: Message },
    /// Fan out to everyone without persisting
    Relay { message: Message },
    /// Deliver to one client only
    SendTo {
        client_id: ClientId,
        message: Message,
    },
    /// Deliver recent history to one client
    History { client_id: ClientId },
}

/// Cloneable handle used by every component that talks to the hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    roster: watch::Receiver<Vec<String>>,
}

impl HubHandle {
    /// Register a client, waiting for the hub's verdict
    pub async fn register(&self, client: Client) -> Result<(), AppError> {
        let (reply, verdict) = oneshot::channel();
        self.send(HubCommand::Register { client, reply }).await?;
        verdict.await.map_err(|_| AppError::HubClosed)??;
        Ok(())
    }

    pub async fn unregister(&self, client_id: ClientId) -> Result<(), AppError> {
        self.send(HubCommand::Unregister { client_id }).await
    }

    pub async fn broadcast(&self, message: Message) -> Result<(), AppError> {
        self.send(HubCommand::Broadcast { message }).await
    }

    pub async fn relay(&self, message: Message) -> Result<(), AppError> {
        self.send(HubCommand::Relay { message }).await
    }

    pub async fn send_to(&self, client_id: ClientId, message: Message) -> Result<(), AppError> {
        self.send(HubCommand::SendTo { client_id, message }).await
    }

    pub async fn request_history(&self, client_id: ClientId) -> Result<(), AppError> {
        self.send(HubCommand::History { client_id }).await
    }

    /// Names of all registered clients, sorted
    ///
    /// Reads the snapshot the hub publishes after each membership change.
    pub fn list_online(&self) -> Vec<String> {
        self.roster.borrow().clone()
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.roster.borrow().iter().any(|online| online == name)
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| AppError::HubClosed)
    }
}

/// Work queued within a single hub event
#[derive(Debug)]
enum Outgoing {
    /// Saved to the store before fan-out
    Persisted(Message),
    /// Fan-out only
    Transient(Message),
    /// Presence list built at dispatch time
    Presence,
}

/// The hub actor
///
/// Owns the registry and processes commands from client actors until every
/// handle is dropped.
pub struct Hub {
    /// All registered clients: ClientId -> Client
    clients: HashMap<ClientId, Client>,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
    /// Published list of online names
    roster: watch::Sender<Vec<String>>,
    store: Arc<dyn MessageStore>,
    config: HubConfig,
}

impl Hub {
    /// Create a hub and the handle used to reach it
    pub fn new(config: HubConfig, store: Arc<dyn MessageStore>) -> (Self, HubHandle) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (roster, roster_rx) = watch::channel(Vec::new());

        let hub = Self {
            clients: HashMap::new(),
            receiver,
            roster,
            store,
            config,
        };
        let handle = HubHandle {
            commands,
            roster: roster_rx,
        };
        (hub, handle)
    }

    /// Run the hub event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!("Hub shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { client, reply } => {
                self.handle_register(client, reply).await;
            }
            HubCommand::Unregister { client_id } => {
                self.handle_unregister(client_id).await;
            }
            HubCommand::Broadcast { message } => {
                self.dispatch(VecDeque::from([Outgoing::Persisted(message)]))
                    .await;
            }
            HubCommand::Relay { message } => {
                self.dispatch(VecDeque::from([Outgoing::Transient(message)]))
                    .await;
            }
            HubCommand::SendTo { client_id, message } => {
                self.send_direct(client_id, vec![message]).await;
            }
            HubCommand::History { client_id } => {
                self.handle_history(client_id).await;
            }
        }
    }

    /// Handle a registration request
    async fn handle_register(
        &mut self,
        client: Client,
        reply: oneshot::Sender<Result<(), AdmissionError>>,
    ) {
        let name = client.display_name().to_string();

        if self.is_name_taken(&name) {
            warn!("Registration refused, name '{}' already taken", name);
            let _ = reply.send(Err(AdmissionError::NameTaken(name)));
            return;
        }

        let client_id = client.id;
        self.clients.insert(client_id, client);
        self.publish_roster();

        if reply.send(Ok(())).is_err() {
            // Handler gave up before hearing back
            self.handle_unregister(client_id).await;
            return;
        }

        info!(
            client_id = %client_id,
            total_clients = self.clients.len(),
            "Client '{}' registered",
            name
        );

        let mut greeting = vec![Message::system(WELCOME_TEXT)];
        if self.config.history_on_join {
            match self.store.recent_messages(self.config.history_limit).await {
                Ok(history) => greeting.extend(history),
                Err(e) => warn!("Failed to load history for '{}': {}", name, e),
            }
        }
        self.send_direct(client_id, greeting).await;

        self.dispatch(VecDeque::from([
            Outgoing::Persisted(Message::joined(&name)),
            Outgoing::Presence,
        ]))
        .await;
    }

    /// Handle client removal
    async fn handle_unregister(&mut self, client_id: ClientId) {
        // Dropping the client closes its queue
        let Some(client) = self.clients.remove(&client_id) else {
            debug!("Unregister for unknown client {}", client_id);
            return;
        };
        self.publish_roster();

        info!(
            client_id = %client_id,
            total_clients = self.clients.len(),
            "Client '{}' unregistered",
            client.display_name()
        );

        let notices = Self::departure_notices(client.display_name());
        drop(client);
        self.dispatch(notices).await;
    }

    /// Handle a history request
    async fn handle_history(&mut self, client_id: ClientId) {
        let messages = match self.store.recent_messages(self.config.history_limit).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to load history for {}: {}", client_id, e);
                vec![Message::error(
                    ErrorCode::HistoryUnavailable,
                    "Failed to retrieve message history",
                )]
            }
        };
        debug!("Sending {} history messages to {}", messages.len(), client_id);
        self.send_direct(client_id, messages).await;
    }

    /// Enqueue messages on a single client's queue
    async fn send_direct(&mut self, client_id: ClientId, messages: Vec<Message>) {
        let Some(client) = self.clients.get(&client_id) else {
            return;
        };

        let mut failure = None;
        for message in messages {
            if let Err(e) = client.try_deliver(&Arc::new(message)) {
                failure = Some(e);
                break;
            }
        }

        if let Some(reason) = failure {
            if let Some(client) = self.clients.remove(&client_id) {
                Self::log_departure(&client, reason);
                self.publish_roster();
                let notices = Self::departure_notices(client.display_name());
                drop(client);
                self.dispatch(notices).await;
            }
        }
    }

    /// Persist and fan out queued work, including notices for evicted clients
    async fn dispatch(&mut self, mut pending: VecDeque<Outgoing>) {
        while let Some(outgoing) = pending.pop_front() {
            let message = match outgoing {
                Outgoing::Persisted(message) => {
                    self.persist(&message).await;
                    message
                }
                Outgoing::Transient(message) => message,
                Outgoing::Presence => Message::user_list(self.online_names()),
            };

            for name in self.fan_out(Arc::new(message)) {
                pending.extend(Self::departure_notices(&name));
            }
        }
    }

    /// Non-blocking enqueue on every client; returns names of evicted clients
    fn fan_out(&mut self, message: Outbound) -> Vec<String> {
        let mut departed = Vec::new();

        self.clients.retain(|_, client| match client.try_deliver(&message) {
            Ok(()) => true,
            Err(reason) => {
                Self::log_departure(client, reason);
                departed.push(client.display_name().to_string());
                false
            }
        });

        if !departed.is_empty() {
            self.publish_roster();
        }
        debug!(
            "Fanned out {} to {} clients",
            message.kind(),
            self.clients.len()
        );
        departed
    }

    async fn persist(&self, message: &Message) {
        if let Err(e) = self.store.save_message(message).await {
            warn!("Failed to persist {} message: {}", message.kind(), e);
        }
    }

    fn departure_notices(name: &str) -> VecDeque<Outgoing> {
        VecDeque::from([Outgoing::Persisted(Message::left(name)), Outgoing::Presence])
    }

    fn log_departure(client: &Client, reason: SendError) {
        match reason {
            SendError::Full => warn!(
                client_id = %client.id,
                "Client '{}' evicted, outbound queue full",
                client.display_name()
            ),
            SendError::ChannelClosed => debug!(
                client_id = %client.id,
                "Client '{}' removed, outbound queue closed",
                client.display_name()
            ),
        }
    }

    fn is_name_taken(&self, name: &str) -> bool {
        self.clients.values().any(|c| c.display_name() == name)
    }

    fn online_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clients
            .values()
            .map(|c| c.display_name().to_string())
            .collect();
        names.sort();
        names
    }

    fn publish_roster(&self) {
        self.roster.send_replace(self.online_names());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::message::{MessageKind, Payload};
    use crate::store::MemoryStore;
    use crate::types::Username;
    use async_trait::async_trait;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_config() -> HubConfig {
        HubConfig {
            history_limit: 10,
            history_on_join: false,
        }
    }

    fn start_hub(config: HubConfig, store: Arc<dyn MessageStore>) -> HubHandle {
        let (hub, handle) = Hub::new(config, store);
        tokio::spawn(hub.run());
        handle
    }

    async fn join(
        hub: &HubHandle,
        name: &str,
        capacity: usize,
    ) -> (ClientId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ClientId::new();
        hub.register(Client::new(id, Username::parse(name).unwrap(), tx))
            .await
            .unwrap();
        (id, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("queue closed")
    }

    /// Skip messages until one of the given kind arrives
    async fn next_of(rx: &mut mpsc::Receiver<Outbound>, kind: MessageKind) -> Outbound {
        loop {
            let msg = next(rx).await;
            if msg.kind() == kind {
                return msg;
            }
        }
    }

    /// Skip messages until a presence list equal to `names` arrives
    async fn until_roster(rx: &mut mpsc::Receiver<Outbound>, names: &[&str]) {
        loop {
            let msg = next_of(rx, MessageKind::UserList).await;
            if let Payload::UserList { content } = msg.payload() {
                if content.iter().map(String::as_str).eq(names.iter().copied()) {
                    return;
                }
            }
        }
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn save_message(&self, _message: &Message) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        async fn recent_messages(&self, _limit: usize) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }
    }

    #[tokio::test]
    async fn test_register_sends_welcome_join_and_presence() {
        let hub = start_hub(test_config(), Arc::new(MemoryStore::new(100)));
        let (_id, mut rx) = join(&hub, "alice", 16).await;

        let welcome = next(&mut rx).await;
        assert_eq!(welcome.content(), Some(WELCOME_TEXT));

        let joined = next(&mut rx).await;
        assert_eq!(joined.kind(), MessageKind::System);
        assert_eq!(joined.content(), Some("alice has joined the chat"));

        let presence = next(&mut rx).await;
        assert_eq!(
            presence.payload(),
            &Payload::UserList {
                content: vec!["alice".to_string()]
            }
        );
        assert_eq!(hub.list_online(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let hub = start_hub(test_config(), Arc::new(MemoryStore::new(100)));
        let (_alice, mut rx) = join(&hub, "alice", 16).await;

        let (tx, _rx2) = mpsc::channel(16);
        let result = hub
            .register(Client::new(ClientId::new(), Username::parse("alice").unwrap(), tx))
            .await;
        assert!(matches!(
            result,
            Err(AppError::Admission(AdmissionError::NameTaken(_)))
        ));

        assert!(hub.is_name_taken("alice"));
        assert_eq!(hub.list_online(), vec!["alice".to_string()]);

        // First client is unaffected
        until_roster(&mut rx, &["alice"]).await;
        hub.broadcast(Message::text("alice", "still here")).await.unwrap();
        let text = next_of(&mut rx, MessageKind::Text).await;
        assert_eq!(text.content(), Some("still here"));
    }

    #[tokio::test]
    async fn test_concurrent_registrations_admit_one() {
        let hub = start_hub(test_config(), Arc::new(MemoryStore::new(100)));
        let mut attempts = Vec::new();
        let mut queues = Vec::new();
        for _ in 0..8 {
            let (tx, rx) = mpsc::channel(16);
            queues.push(rx);
            let hub = hub.clone();
            attempts.push(tokio::spawn(async move {
                hub.register(Client::new(ClientId::new(), Username::parse("alice").unwrap(), tx))
                    .await
            }));
        }

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(hub.list_online(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_once_in_order() {
        let hub = start_hub(test_config(), Arc::new(MemoryStore::new(100)));
        let (_a, mut rx_a) = join(&hub, "alice", 64).await;
        let (_b, mut rx_b) = join(&hub, "bob", 64).await;
        until_roster(&mut rx_a, &["alice", "bob"]).await;
        until_roster(&mut rx_b, &["alice", "bob"]).await;

        for i in 0..5 {
            hub.broadcast(Message::text("alice", format!("m{i}")))
                .await
                .unwrap();
        }
        hub.broadcast(Message::system("end")).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let mut texts = Vec::new();
            loop {
                let msg = next(rx).await;
                if msg.content() == Some("end") {
                    break;
                }
                if msg.kind() == MessageKind::Text {
                    texts.push(msg.content().unwrap().to_string());
                }
            }
            assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_persists_but_relay_does_not() {
        let store = Arc::new(MemoryStore::new(100));
        let hub = start_hub(test_config(), store.clone());
        let (id, mut rx) = join(&hub, "alice", 64).await;
        until_roster(&mut rx, &["alice"]).await;

        hub.relay(Message::typing("alice", "")).await.unwrap();
        hub.broadcast(Message::text("alice", "saved")).await.unwrap();
        next_of(&mut rx, MessageKind::Typing).await;
        next_of(&mut rx, MessageKind::Text).await;

        let saved = store.recent_messages(10).await.unwrap();
        let kinds: Vec<MessageKind> = saved.iter().map(Message::kind).collect();
        assert_eq!(kinds, vec![MessageKind::System, MessageKind::Text]);

        hub.request_history(id).await.unwrap();
        let first = next(&mut rx).await;
        assert_eq!(first.content(), Some("alice has joined the chat"));
        let second = next(&mut rx).await;
        assert_eq!(second.content(), Some("saved"));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_block_delivery() {
        let hub = start_hub(test_config(), Arc::new(FailingStore));
        let (id, mut rx) = join(&hub, "alice", 64).await;

        hub.broadcast(Message::text("alice", "hi")).await.unwrap();
        let text = next_of(&mut rx, MessageKind::Text).await;
        assert_eq!(text.content(), Some("hi"));

        hub.request_history(id).await.unwrap();
        let error = next_of(&mut rx, MessageKind::Error).await;
        assert!(matches!(
            error.payload(),
            Payload::Error {
                code: ErrorCode::HistoryUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_full_queue_evicts_client() {
        let hub = start_hub(test_config(), Arc::new(MemoryStore::new(100)));
        let (_a, mut rx_a) = join(&hub, "alice", 64).await;
        until_roster(&mut rx_a, &["alice"]).await;

        // welcome + joined + presence leave room for exactly one more
        let (_s, mut rx_slow) = join(&hub, "slow", 4).await;
        until_roster(&mut rx_a, &["alice", "slow"]).await;

        hub.broadcast(Message::text("alice", "fits")).await.unwrap();
        hub.broadcast(Message::text("alice", "overflows")).await.unwrap();
        hub.broadcast(Message::text("alice", "after")).await.unwrap();

        let left = next_of(&mut rx_a, MessageKind::System).await;
        assert_eq!(left.content(), Some("slow has left the chat"));
        until_roster(&mut rx_a, &["alice"]).await;
        assert_eq!(hub.list_online(), vec!["alice".to_string()]);

        // The slow client keeps what was queued, then its queue is closed
        let mut drained = Vec::new();
        while let Some(msg) = rx_slow.recv().await {
            drained.push(msg);
        }
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[3].content(), Some("fits"));
    }

    #[tokio::test]
    async fn test_smallest_valid_queue_survives_join() {
        let config = crate::config::ChatConfig {
            queue_capacity: 3,
            hub: test_config(),
            ..Default::default()
        };
        config.validate().unwrap();

        let hub = start_hub(config.hub.clone(), Arc::new(MemoryStore::new(100)));
        let (_a, mut rx) = join(&hub, "alice", config.queue_capacity).await;

        assert_eq!(next(&mut rx).await.content(), Some(WELCOME_TEXT));
        assert_eq!(
            next(&mut rx).await.content(),
            Some("alice has joined the chat")
        );
        assert_eq!(next_of(&mut rx, MessageKind::UserList).await.sender(), "System");
        assert_eq!(hub.list_online(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = start_hub(test_config(), Arc::new(MemoryStore::new(100)));
        let (_a, mut rx_a) = join(&hub, "alice", 64).await;
        let (bob, mut rx_b) = join(&hub, "bob", 64).await;
        until_roster(&mut rx_a, &["alice", "bob"]).await;

        hub.unregister(bob).await.unwrap();
        hub.unregister(bob).await.unwrap();
        hub.broadcast(Message::system("marker")).await.unwrap();

        let mut left_notices = 0;
        loop {
            let msg = next(&mut rx_a).await;
            if msg.content() == Some("marker") {
                break;
            }
            if msg.content() == Some("bob has left the chat") {
                left_notices += 1;
            }
        }
        assert_eq!(left_notices, 1);
        assert_eq!(hub.list_online(), vec!["alice".to_string()]);

        // Bob's queue is closed once drained
        while rx_b.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_history_on_join() {
        let store = Arc::new(MemoryStore::new(100));
        store.save_message(&Message::text("bob", "earlier")).await.unwrap();
        let config = HubConfig {
            history_limit: 10,
            history_on_join: true,
        };
        let hub = start_hub(config, store);
        let (_a, mut rx) = join(&hub, "alice", 64).await;

        assert_eq!(next(&mut rx).await.content(), Some(WELCOME_TEXT));
        let history = next(&mut rx).await;
        assert_eq!(history.sender(), "bob");
        assert_eq!(history.content(), Some("earlier"));
    }

    #[tokio::test]
    async fn test_send_to_targets_one_client() {
        let hub = start_hub(test_config(), Arc::new(MemoryStore::new(100)));
        let (alice, mut rx_a) = join(&hub, "alice", 64).await;
        let (_b, mut rx_b) = join(&hub, "bob", 64).await;
        until_roster(&mut rx_a, &["alice", "bob"]).await;
        until_roster(&mut rx_b, &["alice", "bob"]).await;

        hub.send_to(alice, Message::error(ErrorCode::InvalidMessage, "nope"))
            .await
            .unwrap();
        hub.broadcast(Message::system("marker")).await.unwrap();

        next_of(&mut rx_a, MessageKind::Error).await;
        let first_for_bob = next(&mut rx_b).await;
        assert_eq!(first_for_bob.content(), Some("marker"));
    }
}
