use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header carrying the shared secret on every controller-to-agent request.
pub const SECRET_HEADER: &str = "x-secret-key";

/// Port the agent listens on unless configured otherwise.
pub const DEFAULT_AGENT_PORT: u16 = 5000;

pub const MAX_SERVER_NAME_CHARS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    #[serde(rename = "server_ip")]
    pub address: String,
    #[serde(rename = "secret_key")]
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserRegistry {
    pub servers: IndexMap<String, ServerEntry>,
    pub active_server: Option<String>,
}

/// The whole persisted store: one registry per chat-platform user id.
pub type RegistryDocument = BTreeMap<String, UserRegistry>;

#[derive(Debug, Clone, PartialEq)]
pub struct NamedServer {
    pub name: String,
    pub address: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListedServer {
    pub name: String,
    pub address: String,
    pub active: bool,
}

/// Agent wire schema. Size figures stay as the two-decimal GB strings the
/// agent emitted; the controller reports them verbatim, no recomputation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub cpu: f64,
    pub memory: UsageFigures,
    pub disk: UsageFigures,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageFigures {
    pub total: String,
    pub used: String,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub server: String,
    pub address: String,
    pub snapshot: StatusSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a server named '{0}' is already registered")]
    DuplicateName(String),

    #[error("invalid server name: {0}")]
    InvalidName(String),

    #[error("'{0}' is not a valid IPv4 address")]
    InvalidAddress(String),

    #[error("no server named '{0}' is registered")]
    NotFound(String),

    /// The in-memory mutation succeeded but could not be made durable. The
    /// caller must not assume the change took effect.
    #[error("registry store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// How a single agent request failed, as seen by the transport client.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent is unreachable")]
    Unreachable,

    #[error("agent rejected the secret key")]
    AuthRejected,

    #[error("agent has no secret key configured")]
    Misconfigured,

    #[error("agent response did not match the status schema")]
    MalformedResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no active server is configured")]
    NoActiveServer,

    #[error("server '{server}' is unreachable")]
    Unreachable { server: String },

    #[error("server '{server}' rejected the secret key")]
    AuthRejected { server: String },

    #[error("the agent on server '{server}' has no secret key configured")]
    AgentMisconfigured { server: String },

    #[error("server '{server}' returned a malformed status response")]
    MalformedResponse { server: String },

    #[error("registry store failure: {0}")]
    Store(#[from] anyhow::Error),
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self) -> Result<RegistryDocument>;
    async fn save(&self, document: &RegistryDocument) -> Result<()>;
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn fetch_status(
        &self,
        address: &str,
        secret: &str,
    ) -> std::result::Result<StatusSnapshot, AgentError>;
}

pub fn validate_server_name(name: &str) -> std::result::Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::InvalidName(
            "name must not be empty".to_string(),
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidName(
            "name must not contain whitespace".to_string(),
        ));
    }
    if name.chars().count() > MAX_SERVER_NAME_CHARS {
        return Err(RegistryError::InvalidName(format!(
            "name exceeds {MAX_SERVER_NAME_CHARS} characters"
        )));
    }
    Ok(())
}

pub fn is_valid_ipv4(address: &str) -> bool {
    let mut octets = 0;
    for part in address.split('.') {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        match part.parse::<u16>() {
            Ok(value) if value <= 255 => octets += 1,
            _ => return false,
        }
    }
    octets == 4
}

/// Fresh bearer token for a newly registered server. Generated here, never
/// chosen by the user, and shown to them exactly once.
pub fn generate_secret() -> String {
    Uuid::new_v4().to_string()
}

/// Registry manager and status relay. All store mutations run as
/// load -> mutate -> save under one exclusive lock; the lock is released
/// before any outbound agent call.
pub struct MonitorService<S, A>
where
    S: RegistryStore,
    A: AgentClient,
{
    store: Arc<S>,
    agent: Arc<A>,
    store_lock: tokio::sync::Mutex<()>,
}

impl<S, A> MonitorService<S, A>
where
    S: RegistryStore,
    A: AgentClient,
{
    pub fn new(store: Arc<S>, agent: Arc<A>) -> Self {
        Self {
            store,
            agent,
            store_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn add_server(
        &self,
        user_id: &str,
        name: &str,
        address: &str,
    ) -> std::result::Result<String, RegistryError> {
        validate_server_name(name)?;
        if !is_valid_ipv4(address) {
            return Err(RegistryError::InvalidAddress(address.to_string()));
        }

        let _guard = self.store_lock.lock().await;
        let mut document = self.store.load().await?;
        let registry = document.entry(user_id.to_string()).or_default();
        if registry.servers.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let secret = generate_secret();
        registry.servers.insert(
            name.to_string(),
            ServerEntry {
                address: address.to_string(),
                secret: secret.clone(),
            },
        );
        registry.active_server = Some(name.to_string());
        self.store.save(&document).await?;

        info!(user_id, server = name, address, "server registered");
        Ok(secret)
    }

    pub async fn rename_server(
        &self,
        user_id: &str,
        old_name: &str,
        new_name: &str,
    ) -> std::result::Result<(), RegistryError> {
        validate_server_name(new_name)?;

        let _guard = self.store_lock.lock().await;
        let mut document = self.store.load().await?;
        let registry = document
            .get_mut(user_id)
            .ok_or_else(|| RegistryError::NotFound(old_name.to_string()))?;

        if !registry.servers.contains_key(old_name) {
            return Err(RegistryError::NotFound(old_name.to_string()));
        }
        if new_name != old_name && registry.servers.contains_key(new_name) {
            return Err(RegistryError::DuplicateName(new_name.to_string()));
        }

        let Some((index, _, entry)) = registry.servers.shift_remove_full(old_name) else {
            return Err(RegistryError::NotFound(old_name.to_string()));
        };
        registry
            .servers
            .shift_insert(index, new_name.to_string(), entry);
        if registry.active_server.as_deref() == Some(old_name) {
            registry.active_server = Some(new_name.to_string());
        }
        self.store.save(&document).await?;

        info!(user_id, old_name, new_name, "server renamed");
        Ok(())
    }

    pub async fn set_active(
        &self,
        user_id: &str,
        name: &str,
    ) -> std::result::Result<(), RegistryError> {
        let _guard = self.store_lock.lock().await;
        let mut document = self.store.load().await?;
        let registry = document
            .get_mut(user_id)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !registry.servers.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        registry.active_server = Some(name.to_string());
        self.store.save(&document).await?;

        debug!(user_id, server = name, "active server changed");
        Ok(())
    }

    pub async fn delete_server(
        &self,
        user_id: &str,
        name: &str,
    ) -> std::result::Result<(), RegistryError> {
        let _guard = self.store_lock.lock().await;
        let mut document = self.store.load().await?;
        let registry = document
            .get_mut(user_id)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if registry.servers.shift_remove(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        // Never leave the active pointer dangling at a removed entry.
        if registry.active_server.as_deref() == Some(name) {
            registry.active_server = None;
        }
        self.store.save(&document).await?;

        info!(user_id, server = name, "server deleted");
        Ok(())
    }

    pub async fn get_active(
        &self,
        user_id: &str,
    ) -> std::result::Result<Option<NamedServer>, RegistryError> {
        let _guard = self.store_lock.lock().await;
        let document = self.store.load().await?;
        let Some(registry) = document.get(user_id) else {
            return Ok(None);
        };
        let Some(name) = registry.active_server.as_deref() else {
            return Ok(None);
        };
        Ok(registry.servers.get(name).map(|entry| NamedServer {
            name: name.to_string(),
            address: entry.address.clone(),
            secret: entry.secret.clone(),
        }))
    }

    pub async fn get_server(
        &self,
        user_id: &str,
        name: &str,
    ) -> std::result::Result<Option<NamedServer>, RegistryError> {
        let _guard = self.store_lock.lock().await;
        let document = self.store.load().await?;
        Ok(document
            .get(user_id)
            .and_then(|registry| registry.servers.get(name))
            .map(|entry| NamedServer {
                name: name.to_string(),
                address: entry.address.clone(),
                secret: entry.secret.clone(),
            }))
    }

    /// Insertion order, so the rendered list never reorders between calls.
    pub async fn list_servers(
        &self,
        user_id: &str,
    ) -> std::result::Result<Vec<ListedServer>, RegistryError> {
        let _guard = self.store_lock.lock().await;
        let document = self.store.load().await?;
        let Some(registry) = document.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(registry
            .servers
            .iter()
            .map(|(name, entry)| ListedServer {
                name: name.clone(),
                address: entry.address.clone(),
                active: registry.active_server.as_deref() == Some(name),
            })
            .collect())
    }

    /// One fetch per user action; a failed attempt is reported once and never
    /// retried here.
    pub async fn fetch_status(
        &self,
        user_id: &str,
    ) -> std::result::Result<ServerStatus, FetchError> {
        let Some(server) = self.get_active(user_id).await.map_err(store_failure)? else {
            return Err(FetchError::NoActiveServer);
        };

        match self
            .agent
            .fetch_status(&server.address, &server.secret)
            .await
        {
            Ok(snapshot) => {
                debug!(user_id, server = %server.name, "status fetched");
                Ok(ServerStatus {
                    server: server.name,
                    address: server.address,
                    snapshot,
                })
            }
            Err(err) => {
                warn!(
                    user_id,
                    server = %server.name,
                    address = %server.address,
                    error = %err,
                    "status fetch failed"
                );
                Err(match err {
                    AgentError::Unreachable => FetchError::Unreachable {
                        server: server.name,
                    },
                    AgentError::AuthRejected => FetchError::AuthRejected {
                        server: server.name,
                    },
                    AgentError::Misconfigured => FetchError::AgentMisconfigured {
                        server: server.name,
                    },
                    AgentError::MalformedResponse => FetchError::MalformedResponse {
                        server: server.name,
                    },
                })
            }
        }
    }
}

fn store_failure(err: RegistryError) -> FetchError {
    match err {
        RegistryError::Store(inner) => FetchError::Store(inner),
        other => FetchError::Store(anyhow::anyhow!(other)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DialogState {
    AwaitingName,
    AwaitingAddress { name: String },
    PendingDelete { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogStep {
    PromptName,
    NameRejected { reason: String },
    PromptAddress { name: String },
    AddressRejected { address: String },
    ReadyToCommit { name: String, address: String },
    ConfirmDelete { name: String },
    DeleteConfirmed { name: String },
    DeleteAbandoned { name: String },
}

/// At most one in-flight dialog per user, keyed by the chat-platform user id.
/// Dialogs for different users never interact.
#[derive(Default)]
pub struct DialogTable {
    states: Mutex<HashMap<String, DialogState>>,
}

impl DialogTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) the add-server dialog. A dialog already in
    /// progress for this user is discarded; the fresh action wins.
    pub fn begin_add(&self, user_id: &str) -> DialogStep {
        let mut states = self.states.lock().expect("dialog table poisoned");
        states.insert(user_id.to_string(), DialogState::AwaitingName);
        DialogStep::PromptName
    }

    pub fn begin_delete(&self, user_id: &str, name: &str) -> DialogStep {
        let mut states = self.states.lock().expect("dialog table poisoned");
        states.insert(
            user_id.to_string(),
            DialogState::PendingDelete {
                name: name.to_string(),
            },
        );
        DialogStep::ConfirmDelete {
            name: name.to_string(),
        }
    }

    /// Returns true when a dialog was actually abandoned.
    pub fn cancel(&self, user_id: &str) -> bool {
        let mut states = self.states.lock().expect("dialog table poisoned");
        states.remove(user_id).is_some()
    }

    /// Clears a pending delete confirmation, if any, and returns the name it
    /// targeted. Any action other than an explicit confirmation abandons the
    /// delete.
    pub fn abandon_delete(&self, user_id: &str) -> Option<String> {
        let mut states = self.states.lock().expect("dialog table poisoned");
        match states.get(user_id) {
            Some(DialogState::PendingDelete { name }) => {
                let name = name.clone();
                states.remove(user_id);
                Some(name)
            }
            _ => None,
        }
    }

    pub fn is_pending(&self, user_id: &str) -> bool {
        let states = self.states.lock().expect("dialog table poisoned");
        states.contains_key(user_id)
    }

    /// Feeds a free-text message into the user's pending dialog. `None` means
    /// no dialog is in progress. Name uniqueness is deliberately NOT checked
    /// here; it is re-validated at commit because another add may race in
    /// between.
    pub fn offer_text(&self, user_id: &str, text: &str) -> Option<DialogStep> {
        let mut states = self.states.lock().expect("dialog table poisoned");
        let state = states.get(user_id)?.clone();
        let input = text.trim();

        let step = match state {
            DialogState::AwaitingName => match validate_server_name(input) {
                Ok(()) => {
                    states.insert(
                        user_id.to_string(),
                        DialogState::AwaitingAddress {
                            name: input.to_string(),
                        },
                    );
                    DialogStep::PromptAddress {
                        name: input.to_string(),
                    }
                }
                Err(err) => DialogStep::NameRejected {
                    reason: err.to_string(),
                },
            },
            DialogState::AwaitingAddress { name } => {
                if is_valid_ipv4(input) {
                    states.remove(user_id);
                    DialogStep::ReadyToCommit {
                        name,
                        address: input.to_string(),
                    }
                } else {
                    // Keep the captured name; only the address is re-asked.
                    DialogStep::AddressRejected {
                        address: input.to_string(),
                    }
                }
            }
            DialogState::PendingDelete { name } => {
                states.remove(user_id);
                if input.eq_ignore_ascii_case("yes") {
                    DialogStep::DeleteConfirmed { name }
                } else {
                    DialogStep::DeleteAbandoned { name }
                }
            }
        };
        Some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct MemoryStore {
        document: Mutex<RegistryDocument>,
        fail_saves: bool,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self {
                document: Mutex::new(RegistryDocument::new()),
                fail_saves: false,
            }
        }

        fn failing() -> Self {
            Self {
                document: Mutex::new(RegistryDocument::new()),
                fail_saves: true,
            }
        }
    }

    #[async_trait]
    impl RegistryStore for MemoryStore {
        async fn load(&self) -> Result<RegistryDocument> {
            Ok(self.document.lock().unwrap().clone())
        }

        async fn save(&self, document: &RegistryDocument) -> Result<()> {
            if self.fail_saves {
                return Err(anyhow!("disk full"));
            }
            *self.document.lock().unwrap() = document.clone();
            Ok(())
        }
    }

    struct StubAgent {
        outcome: std::result::Result<StatusSnapshot, AgentError>,
    }

    #[async_trait]
    impl AgentClient for StubAgent {
        async fn fetch_status(
            &self,
            _address: &str,
            _secret: &str,
        ) -> std::result::Result<StatusSnapshot, AgentError> {
            self.outcome.clone()
        }
    }

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            cpu: 12.5,
            memory: UsageFigures {
                total: "7.80".to_string(),
                used: "3.20".to_string(),
                percent: 41.0,
            },
            disk: UsageFigures {
                total: "49.00".to_string(),
                used: "20.11".to_string(),
                percent: 45.2,
            },
        }
    }

    fn service_with(
        outcome: std::result::Result<StatusSnapshot, AgentError>,
    ) -> MonitorService<MemoryStore, StubAgent> {
        MonitorService::new(Arc::new(MemoryStore::new()), Arc::new(StubAgent { outcome }))
    }

    fn service() -> MonitorService<MemoryStore, StubAgent> {
        service_with(Ok(snapshot()))
    }

    #[test]
    fn ipv4_validation_accepts_full_range() {
        assert!(is_valid_ipv4("0.0.0.0"));
        assert!(is_valid_ipv4("255.255.255.255"));
        assert!(is_valid_ipv4("10.0.0.5"));
        assert!(is_valid_ipv4("192.168.1.100"));
    }

    #[test]
    fn ipv4_validation_rejects_bad_shapes() {
        assert!(!is_valid_ipv4(""));
        assert!(!is_valid_ipv4("10.0.0"));
        assert!(!is_valid_ipv4("10.0.0.5.1"));
        assert!(!is_valid_ipv4("256.0.0.1"));
        assert!(!is_valid_ipv4("10.0.0.-1"));
        assert!(!is_valid_ipv4("10.0.0."));
        assert!(!is_valid_ipv4("10.0..5"));
        assert!(!is_valid_ipv4("a.b.c.d"));
        assert!(!is_valid_ipv4("10.0.0.5 "));
        assert!(!is_valid_ipv4("1000.0.0.1"));
    }

    #[test]
    fn server_name_validation() {
        assert!(validate_server_name("de1").is_ok());
        assert!(matches!(
            validate_server_name(""),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            validate_server_name("two words"),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            validate_server_name(&"x".repeat(65)),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn add_server_lists_once_and_becomes_active() {
        let service = service();
        service.add_server("7", "de1", "10.0.0.5").await.unwrap();

        let listed = service.list_servers("7").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "de1");
        assert!(listed[0].active);

        let active = service.get_active("7").await.unwrap().unwrap();
        assert_eq!(active.name, "de1");
        assert_eq!(active.address, "10.0.0.5");
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected_and_secret_survives() {
        let service = service();
        let secret = service.add_server("7", "de1", "10.0.0.5").await.unwrap();

        let err = service.add_server("7", "de1", "10.0.0.6").await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "de1"));

        let kept = service.get_server("7", "de1").await.unwrap().unwrap();
        assert_eq!(kept.secret, secret);
        assert_eq!(kept.address, "10.0.0.5");
    }

    #[tokio::test]
    async fn add_server_rejects_bad_addresses() {
        let service = service();
        for address in ["10.0.0", "10.0.0.5.1", "256.0.0.1", "host.example"] {
            let err = service.add_server("7", "s", address).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidAddress(_)), "{address}");
        }
        assert!(service.list_servers("7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn distinct_servers_get_distinct_secrets() {
        let service = service();
        let first = service.add_server("7", "de1", "10.0.0.5").await.unwrap();
        let second = service.add_server("7", "de2", "10.0.0.6").await.unwrap();
        assert_ne!(first, second);

        let listed = service.list_servers("7").await.unwrap();
        assert_eq!(listed.len(), 2);
        // The newest addition takes over as the active server.
        assert!(!listed[0].active);
        assert!(listed[1].active);
    }

    #[tokio::test]
    async fn listing_keeps_insertion_order() {
        let service = service();
        for (name, address) in [("b", "10.0.0.2"), ("a", "10.0.0.1"), ("c", "10.0.0.3")] {
            service.add_server("7", name, address).await.unwrap();
        }
        let names = service
            .list_servers("7")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn deleting_active_server_clears_pointer() {
        let service = service();
        service.add_server("7", "de1", "10.0.0.5").await.unwrap();
        service.delete_server("7", "de1").await.unwrap();

        assert!(service.get_active("7").await.unwrap().is_none());
        assert!(service.list_servers("7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_inactive_server_keeps_active_pointer() {
        let service = service();
        service.add_server("7", "de1", "10.0.0.5").await.unwrap();
        service.add_server("7", "de2", "10.0.0.6").await.unwrap();
        service.delete_server("7", "de1").await.unwrap();

        let active = service.get_active("7").await.unwrap().unwrap();
        assert_eq!(active.name, "de2");
    }

    #[tokio::test]
    async fn set_active_unknown_name_leaves_pointer_alone() {
        let service = service();
        service.add_server("7", "de1", "10.0.0.5").await.unwrap();

        let err = service.set_active("7", "nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));

        let active = service.get_active("7").await.unwrap().unwrap();
        assert_eq!(active.name, "de1");
    }

    #[tokio::test]
    async fn set_active_switches_between_servers() {
        let service = service();
        service.add_server("7", "de1", "10.0.0.5").await.unwrap();
        service.add_server("7", "de2", "10.0.0.6").await.unwrap();

        service.set_active("7", "de1").await.unwrap();
        let active = service.get_active("7").await.unwrap().unwrap();
        assert_eq!(active.name, "de1");
    }

    #[tokio::test]
    async fn rename_preserves_entry_and_repoints_active() {
        let service = service();
        service.add_server("7", "b", "10.0.0.2").await.unwrap();
        let secret = service.add_server("7", "a", "10.0.0.1").await.unwrap();

        service.rename_server("7", "a", "alpha").await.unwrap();

        let names = service
            .list_servers("7")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "alpha"]);

        let active = service.get_active("7").await.unwrap().unwrap();
        assert_eq!(active.name, "alpha");
        assert_eq!(active.secret, secret);

        let err = service.rename_server("7", "alpha", "b").await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn registries_are_isolated_per_user() {
        let service = service();
        service.add_server("7", "de1", "10.0.0.5").await.unwrap();
        service.add_server("8", "de1", "10.0.0.9").await.unwrap();

        let seven = service.get_active("7").await.unwrap().unwrap();
        let eight = service.get_active("8").await.unwrap().unwrap();
        assert_eq!(seven.address, "10.0.0.5");
        assert_eq!(eight.address, "10.0.0.9");
        assert_ne!(seven.secret, eight.secret);
    }

    #[tokio::test]
    async fn concurrent_adds_both_persist() {
        let service = Arc::new(service());
        let a = {
            let service = service.clone();
            tokio::spawn(async move { service.add_server("7", "de1", "10.0.0.5").await })
        };
        let b = {
            let service = service.clone();
            tokio::spawn(async move { service.add_server("7", "de2", "10.0.0.6").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let listed = service.list_servers("7").await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn failed_save_is_surfaced() {
        let service = MonitorService::new(
            Arc::new(MemoryStore::failing()),
            Arc::new(StubAgent {
                outcome: Ok(snapshot()),
            }),
        );
        let err = service.add_server("7", "de1", "10.0.0.5").await.unwrap_err();
        assert!(matches!(err, RegistryError::Store(_)));
    }

    #[tokio::test]
    async fn fetch_status_without_active_server() {
        let service = service();
        let err = service.fetch_status("7").await.unwrap_err();
        assert!(matches!(err, FetchError::NoActiveServer));
    }

    #[tokio::test]
    async fn fetch_status_passes_snapshot_through() {
        let service = service();
        service.add_server("7", "de1", "10.0.0.5").await.unwrap();

        let status = service.fetch_status("7").await.unwrap();
        assert_eq!(status.server, "de1");
        assert_eq!(status.address, "10.0.0.5");
        assert_eq!(status.snapshot, snapshot());
    }

    #[tokio::test]
    async fn fetch_status_maps_agent_errors_to_server_name() {
        for (outcome, check) in [
            (
                AgentError::Unreachable,
                (|e: &FetchError| matches!(e, FetchError::Unreachable { server } if server == "de1"))
                    as fn(&FetchError) -> bool,
            ),
            (AgentError::AuthRejected, |e| {
                matches!(e, FetchError::AuthRejected { server } if server == "de1")
            }),
            (AgentError::Misconfigured, |e| {
                matches!(e, FetchError::AgentMisconfigured { server } if server == "de1")
            }),
            (AgentError::MalformedResponse, |e| {
                matches!(e, FetchError::MalformedResponse { server } if server == "de1")
            }),
        ] {
            let service = service_with(Err(outcome));
            service.add_server("7", "de1", "10.0.0.5").await.unwrap();
            let err = service.fetch_status("7").await.unwrap_err();
            assert!(check(&err), "{err}");
        }
    }

    #[test]
    fn dialog_happy_path() {
        let dialogs = DialogTable::new();
        assert_eq!(dialogs.begin_add("7"), DialogStep::PromptName);
        assert_eq!(
            dialogs.offer_text("7", "de1"),
            Some(DialogStep::PromptAddress {
                name: "de1".to_string()
            })
        );
        assert_eq!(
            dialogs.offer_text("7", "10.0.0.5"),
            Some(DialogStep::ReadyToCommit {
                name: "de1".to_string(),
                address: "10.0.0.5".to_string()
            })
        );
        assert!(!dialogs.is_pending("7"));
    }

    #[test]
    fn dialog_retries_address_without_losing_name() {
        let dialogs = DialogTable::new();
        dialogs.begin_add("7");
        dialogs.offer_text("7", "de1");

        assert_eq!(
            dialogs.offer_text("7", "not-an-ip"),
            Some(DialogStep::AddressRejected {
                address: "not-an-ip".to_string()
            })
        );
        assert_eq!(
            dialogs.offer_text("7", "10.0.0.5"),
            Some(DialogStep::ReadyToCommit {
                name: "de1".to_string(),
                address: "10.0.0.5".to_string()
            })
        );
    }

    #[test]
    fn dialog_rejects_bad_name_and_stays_waiting() {
        let dialogs = DialogTable::new();
        dialogs.begin_add("7");
        assert!(matches!(
            dialogs.offer_text("7", "two words"),
            Some(DialogStep::NameRejected { .. })
        ));
        assert!(dialogs.is_pending("7"));
    }

    #[test]
    fn second_add_restarts_the_dialog() {
        let dialogs = DialogTable::new();
        dialogs.begin_add("7");
        dialogs.offer_text("7", "de1");

        // A fresh add action discards the captured name.
        assert_eq!(dialogs.begin_add("7"), DialogStep::PromptName);
        assert_eq!(
            dialogs.offer_text("7", "de2"),
            Some(DialogStep::PromptAddress {
                name: "de2".to_string()
            })
        );
    }

    #[test]
    fn cancel_abandons_without_effect() {
        let dialogs = DialogTable::new();
        dialogs.begin_add("7");
        assert!(dialogs.cancel("7"));
        assert!(!dialogs.is_pending("7"));
        assert!(dialogs.offer_text("7", "de1").is_none());
        assert!(!dialogs.cancel("7"));
    }

    #[test]
    fn delete_confirmation_and_abandonment() {
        let dialogs = DialogTable::new();
        dialogs.begin_delete("7", "de1");
        assert_eq!(
            dialogs.offer_text("7", "yes"),
            Some(DialogStep::DeleteConfirmed {
                name: "de1".to_string()
            })
        );

        dialogs.begin_delete("7", "de1");
        assert_eq!(
            dialogs.offer_text("7", "no"),
            Some(DialogStep::DeleteAbandoned {
                name: "de1".to_string()
            })
        );
        assert!(!dialogs.is_pending("7"));
    }

    #[test]
    fn abandon_delete_only_touches_pending_deletes() {
        let dialogs = DialogTable::new();
        dialogs.begin_delete("7", "de1");
        assert_eq!(dialogs.abandon_delete("7"), Some("de1".to_string()));

        dialogs.begin_add("7");
        assert_eq!(dialogs.abandon_delete("7"), None);
        assert!(dialogs.is_pending("7"));
    }

    #[test]
    fn dialogs_are_independent_per_user() {
        let dialogs = DialogTable::new();
        dialogs.begin_add("7");
        dialogs.begin_delete("8", "web");

        assert!(matches!(
            dialogs.offer_text("7", "de1"),
            Some(DialogStep::PromptAddress { .. })
        ));
        assert_eq!(
            dialogs.offer_text("8", "yes"),
            Some(DialogStep::DeleteConfirmed {
                name: "web".to_string()
            })
        );
    }
}
