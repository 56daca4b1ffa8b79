//! Client seam for the external consensus coordinator (a ZooKeeper-style
//! hierarchical store with ephemeral nodes and watches).
//!
//! Group membership lives here: every member owns an ephemeral child under
//! the group's members node, so a lost session is indistinguishable from an
//! explicit leave and triggers a rebalance in the survivors.
//!
//! The wire binding is behind the [`CoordinatorService`] trait;
//! [`MemoryCoordinator`] implements it in-process for tests and embedding.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

mod party;
pub use party::Party;
mod shared_set;
pub use shared_set::SharedSet;

#[derive(Debug, Error)]
pub enum Error {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("coordinator session expired")]
    SessionExpired,

    #[error("coordinator backend error: {0}")]
    Backend(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The operations the engine needs from the consensus coordinator.
///
/// One instance represents one session; ephemeral nodes vanish with it.
#[async_trait]
pub trait CoordinatorService: Send + Sync + 'static {
    /// Create a node that is deleted when this session ends.
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Create a durable node.
    async fn create_persistent(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Delete a node.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// The names (not paths) of a node's children.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// A node's payload; `None` if the node does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a node's payload.
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Subscribe to membership changes of a node's children.
    ///
    /// The receiver yields the full child list after every change.
    async fn watch_children(&self, path: &str) -> Result<broadcast::Receiver<Vec<String>>>;

    /// Subscribe to payload changes of a node.
    async fn watch_data(&self, path: &str) -> Result<broadcast::Receiver<Option<Vec<u8>>>>;
}

/// Create `path` and all its ancestors as persistent nodes, ignoring the
/// ones that already exist.
pub(crate) async fn ensure_path<C>(service: &C, path: &str) -> Result<()>
where
    C: CoordinatorService + ?Sized,
{
    let mut prefix = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        prefix.push('/');
        prefix.push_str(segment);
        match service.create_persistent(&prefix, vec![]).await {
            Ok(()) | Err(Error::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct Store {
    nodes: BTreeMap<String, Node>,
    children_watches: BTreeMap<String, broadcast::Sender<Vec<String>>>,
    data_watches: BTreeMap<String, broadcast::Sender<Option<Vec<u8>>>>,
}

impl Store {
    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<_> = self
            .nodes
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_owned)
            .collect();
        children.sort();
        children
    }

    fn parent_of(path: &str) -> Option<&str> {
        path.rsplit_once('/').map(|(parent, _)| parent).filter(|p| !p.is_empty())
    }

    fn notify_children(&self, path: &str) {
        if let Some(tx) = self.children_watches.get(path) {
            tx.send(self.children_of(path)).ok();
        }
    }

    fn notify_data(&self, path: &str) {
        if let Some(tx) = self.data_watches.get(path) {
            tx.send(self.nodes.get(path).map(|n| n.data.clone())).ok();
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, ephemeral_owner: Option<u64>) -> Result<()> {
        if self.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_owned()));
        }
        self.nodes.insert(
            path.to_owned(),
            Node {
                data,
                ephemeral_owner,
            },
        );
        if let Some(parent) = Self::parent_of(path) {
            self.notify_children(parent);
        }
        self.notify_data(path);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        if self.nodes.remove(path).is_none() {
            return Err(Error::NoNode(path.to_owned()));
        }
        if let Some(parent) = Self::parent_of(path) {
            self.notify_children(parent);
        }
        self.notify_data(path);
        Ok(())
    }
}

/// An in-process coordinator store shared by any number of sessions.
#[derive(Debug, Default, Clone)]
pub struct MemoryCoordinator {
    store: Arc<Mutex<Store>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session; its ephemeral nodes die with it.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            store: Arc::clone(&self.store),
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            expired: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

/// One session against a [`MemoryCoordinator`].
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<Mutex<Store>>,
    session_id: u64,
    expired: Arc<std::sync::atomic::AtomicBool>,
}

impl MemorySession {
    /// Kill the session: its ephemeral nodes disappear and watchers fire,
    /// exactly as if the process had died.
    pub fn expire(&self) {
        if self.expired.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut store = self.store.lock();
        let owned: Vec<String> = store
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(self.session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            store.remove(&path).ok();
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.expire();
    }
}

#[async_trait]
impl CoordinatorService for MemorySession {
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        self.store.lock().insert(path, data, Some(self.session_id))
    }

    async fn create_persistent(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        self.store.lock().insert(path, data, None)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_alive()?;
        self.store.lock().remove(path)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_alive()?;
        Ok(self.store.lock().nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_alive()?;
        Ok(self.store.lock().children_of(path))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_alive()?;
        Ok(self.store.lock().nodes.get(path).map(|n| n.data.clone()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        let mut store = self.store.lock();
        match store.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                store.notify_data(path);
                Ok(())
            }
            None => Err(Error::NoNode(path.to_owned())),
        }
    }

    async fn watch_children(&self, path: &str) -> Result<broadcast::Receiver<Vec<String>>> {
        self.check_alive()?;
        let mut store = self.store.lock();
        let tx = store
            .children_watches
            .entry(path.to_owned())
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(tx.subscribe())
    }

    async fn watch_data(&self, path: &str) -> Result<broadcast::Receiver<Option<Vec<u8>>>> {
        self.check_alive()?;
        let mut store = self.store.lock();
        let tx = store
            .data_watches
            .entry(path.to_owned())
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_dies_with_session() {
        let coordinator = MemoryCoordinator::new();
        let observer = coordinator.session();
        ensure_path(&observer, "/groups/workers/members").await.unwrap();

        let mut watch = observer
            .watch_children("/groups/workers/members")
            .await
            .unwrap();

        let member = coordinator.session();
        member
            .create_ephemeral("/groups/workers/members/a", vec![])
            .await
            .unwrap();
        assert_eq!(watch.recv().await.unwrap(), vec!["a".to_owned()]);

        member.expire();
        assert_eq!(watch.recv().await.unwrap(), Vec::<String>::new());

        assert!(!observer
            .exists("/groups/workers/members/a")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.expire();

        let err = session.exists("/x").await.unwrap_err();
        assert!(matches!(err, Error::SessionExpired));
    }

    #[tokio::test]
    async fn test_data_watch_fires_on_set() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        ensure_path(&session, "/set").await.unwrap();

        let mut watch = session.watch_data("/set").await.unwrap();
        session.set_data("/set", b"hello".to_vec()).await.unwrap();

        assert_eq!(watch.recv().await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();

        ensure_path(&session, "/a/b/c").await.unwrap();
        ensure_path(&session, "/a/b/c").await.unwrap();
        assert!(session.exists("/a/b/c").await.unwrap());
        assert_eq!(
            session.get_children("/a/b").await.unwrap(),
            vec!["c".to_owned()]
        );
    }
}
