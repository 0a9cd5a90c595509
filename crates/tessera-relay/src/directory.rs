//! The relay's online directory.
//!
//! One entry per registered id, owned by exactly one connection. The
//! directory is the only shared state in the relay; connection tasks reach it
//! through the operations below and never hold references into it.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_common::{is_valid_peer_id, Certificate, RelayFrame, UserSummary};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// Queue of frames waiting to be written to one connection.
pub type Outbox = mpsc::Sender<RelayFrame>;

/// Identifies one WebSocket connection for the lifetime of the relay.
pub type ConnectionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("invalid id: {0:?}")]
    InvalidId(String),
}

/// What a peer registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    PublicKey(String),
    Certificate(Certificate),
}

#[derive(Debug, Clone)]
struct Entry {
    connection: ConnectionId,
    credential: Credential,
    outbox: Outbox,
}

/// Lock-protected map of online peers.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` for `connection`.
    ///
    /// Returns the outbox of the connection that previously held `id`, if it
    /// was a different one.
    pub async fn register(
        &self,
        id: &str,
        connection: ConnectionId,
        credential: Credential,
        outbox: Outbox,
    ) -> Result<Option<Outbox>, DirectoryError> {
        if !is_valid_peer_id(id) {
            return Err(DirectoryError::InvalidId(id.to_string()));
        }

        let previous = self.entries.write().await.insert(
            id.to_string(),
            Entry {
                connection,
                credential,
                outbox,
            },
        );
        Ok(previous
            .filter(|entry| entry.connection != connection)
            .map(|entry| entry.outbox))
    }

    /// Remove `id` if `connection` still owns it.
    pub async fn unregister(&self, id: &str, connection: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(id) {
            Some(entry) if entry.connection == connection => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// The online list, sorted by id.
    pub async fn snapshot(&self) -> Vec<UserSummary> {
        let entries = self.entries.read().await;
        let mut users: Vec<UserSummary> = entries
            .iter()
            .map(|(id, entry)| match &entry.credential {
                Credential::PublicKey(key) => UserSummary {
                    id: id.clone(),
                    public_key: Some(key.clone()),
                    has_cert: false,
                },
                Credential::Certificate(_) => UserSummary {
                    id: id.clone(),
                    public_key: None,
                    has_cert: true,
                },
            })
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    /// Whether `connection` currently holds `id`.
    pub async fn owns(&self, id: &str, connection: ConnectionId) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .is_some_and(|entry| entry.connection == connection)
    }

    pub async fn certificate_of(&self, id: &str) -> Option<Certificate> {
        match &self.entries.read().await.get(id)?.credential {
            Credential::Certificate(certificate) => Some(certificate.clone()),
            Credential::PublicKey(_) => None,
        }
    }

    pub async fn sender_for(&self, id: &str) -> Option<Outbox> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.outbox.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queue the current online list on every connection.
    pub async fn broadcast_user_list(&self) {
        let users = self.snapshot().await;
        let outboxes: Vec<(String, Outbox)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.outbox.clone()))
            .collect();

        for (id, outbox) in outboxes {
            let frame = RelayFrame::UserList {
                users: users.clone(),
            };
            if outbox.try_send(frame).is_err() {
                warn!("failed to queue user list for {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certificate(user_id: &str) -> Certificate {
        Certificate {
            user_id: user_id.into(),
            public_key: "-----BEGIN PUBLIC KEY-----".into(),
            issuer: "Test CA".into(),
            signature: "c2ln".into(),
        }
    }

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let directory = Directory::new();
        let (tx, _rx) = mpsc::channel(4);

        directory
            .register("bob", 1, Credential::PublicKey("KEY-B".into()), tx.clone())
            .await
            .unwrap();
        directory
            .register("alice", 2, Credential::Certificate(certificate("alice")), tx)
            .await
            .unwrap();

        let users = directory.snapshot().await;
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, "alice");
        assert!(users[0].has_cert);
        assert_eq!(users[0].public_key, None);
        assert_eq!(users[1].public_key.as_deref(), Some("KEY-B"));

        assert_eq!(
            directory.certificate_of("alice").await,
            Some(certificate("alice"))
        );
        assert_eq!(directory.certificate_of("bob").await, None);
        assert_eq!(directory.certificate_of("carol").await, None);
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let directory = Directory::new();
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(
            directory
                .register("", 1, Credential::PublicKey("K".into()), tx)
                .await,
            Err(DirectoryError::InvalidId(_))
        ));
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn test_newer_connection_replaces_older() {
        let directory = Directory::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);

        assert!(directory
            .register("alice", 1, Credential::PublicKey("K1".into()), old_tx.clone())
            .await
            .unwrap()
            .is_none());
        let replaced = directory
            .register("alice", 2, Credential::PublicKey("K2".into()), new_tx)
            .await
            .unwrap();
        assert!(replaced.unwrap().same_channel(&old_tx));

        // The old connection closing must not evict the new one.
        assert!(!directory.unregister("alice", 1).await);
        assert_eq!(directory.len().await, 1);
        assert!(directory.unregister("alice", 2).await);
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn test_reregister_same_connection_is_not_a_replacement() {
        let directory = Directory::new();
        let (tx, _rx) = mpsc::channel(4);
        directory
            .register("alice", 1, Credential::PublicKey("K1".into()), tx.clone())
            .await
            .unwrap();
        let replaced = directory
            .register("alice", 1, Credential::PublicKey("K2".into()), tx)
            .await
            .unwrap();
        assert!(replaced.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let directory = Directory::new();
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        directory
            .register("a", 1, Credential::PublicKey("KA".into()), a_tx)
            .await
            .unwrap();
        directory
            .register("b", 2, Credential::PublicKey("KB".into()), b_tx)
            .await
            .unwrap();

        directory.broadcast_user_list().await;

        for rx in [&mut a_rx, &mut b_rx] {
            match rx.recv().await.unwrap() {
                RelayFrame::UserList { users } => assert_eq!(users.len(), 2),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }
}
