//! Session directory: named sessions that participants can discover and
//! join by id.
//!
//! The directory only tracks identity (id + display name). Document
//! content and membership live in the registry's session actors; a
//! directory entry outliving its reaped actor is fine — joining it simply
//! starts an empty document.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub name: String,
}

/// Shared catalogue of known sessions.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    sessions: RwLock<HashMap<Uuid, SessionInfo>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named session and return its info.
    pub async fn create_session(&self, name: impl Into<String>) -> SessionInfo {
        let info = SessionInfo {
            id: Uuid::new_v4(),
            name: name.into(),
        };
        self.sessions.write().await.insert(info.id, info.clone());
        log::info!("session '{}' registered as {}", info.name, info.id);
        info
    }

    pub async fn get_session(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// All known sessions, unordered.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn remove_session(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let directory = SessionDirectory::new();
        let created = directory.create_session("design review").await;

        let fetched = directory.get_session(created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.name, "design review");
    }

    #[tokio::test]
    async fn test_unknown_session_is_none() {
        let directory = SessionDirectory::new();
        assert!(directory.get_session(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let directory = SessionDirectory::new();
        let a = directory.create_session("a").await;
        directory.create_session("b").await;
        assert_eq!(directory.len().await, 2);
        assert_eq!(directory.list_sessions().await.len(), 2);

        let removed = directory.remove_session(a.id).await.unwrap();
        assert_eq!(removed.name, "a");
        assert_eq!(directory.len().await, 1);
    }
}
