//! A shared set of strings stored at one coordinator node, with change
//! watches and a lock child guarding read-modify-write updates.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use super::{ensure_path, CoordinatorService, Error, Result};

/// How long to wait between attempts at the update lock.
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// A JSON-serialized set shared by all members of a group.
///
/// Used for the universe of partitions a group divides among itself.
pub struct SharedSet<C: CoordinatorService + ?Sized> {
    service: Arc<C>,
    path: String,
}

impl<C: CoordinatorService + ?Sized> SharedSet<C> {
    pub fn new(service: Arc<C>, path: impl Into<String>) -> Self {
        Self {
            service,
            path: path.into(),
        }
    }

    fn lock_path(&self) -> String {
        format!("{}/lock", self.path)
    }

    /// Create the set's node and subscribe to payload changes.
    pub async fn start(&self) -> Result<broadcast::Receiver<Option<Vec<u8>>>> {
        ensure_path(self.service.as_ref(), &self.path).await?;
        self.service.watch_data(&self.path).await
    }

    /// The current items.
    pub async fn items(&self) -> Result<BTreeSet<String>> {
        let raw = self.service.get_data(&self.path).await?;
        Ok(decode(raw.as_deref()))
    }

    /// Add `new_items`; a no-op if all are already present.
    pub async fn add_items(&self, new_items: &BTreeSet<String>) -> Result<()> {
        self.locked_update(|mut existing| {
            if new_items.is_subset(&existing) {
                None
            } else {
                existing.extend(new_items.iter().cloned());
                Some(existing)
            }
        })
        .await
    }

    /// Remove `old_items`; a no-op if none are present.
    pub async fn remove_items(&self, old_items: &BTreeSet<String>) -> Result<()> {
        self.locked_update(|mut existing| {
            if old_items.is_disjoint(&existing) {
                None
            } else {
                existing.retain(|item| !old_items.contains(item));
                Some(existing)
            }
        })
        .await
    }

    /// Run a read-modify-write under the set's lock node.
    ///
    /// The lock child is ephemeral, so a holder that dies releases it.
    async fn locked_update<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(BTreeSet<String>) -> Option<BTreeSet<String>> + Send,
    {
        let lock_path = self.lock_path();
        loop {
            match self.service.create_ephemeral(&lock_path, vec![]).await {
                Ok(()) => break,
                Err(Error::NodeExists(_)) => {
                    debug!(path = lock_path.as_str(), "Set is locked, waiting");
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e),
            }
        }

        let result = async {
            let existing = decode(self.service.get_data(&self.path).await?.as_deref());
            if let Some(updated) = update(existing) {
                self.service.set_data(&self.path, encode(&updated)).await?;
            }
            Ok(())
        }
        .await;

        self.service.delete(&lock_path).await.ok();
        result
    }
}

fn encode(items: &BTreeSet<String>) -> Vec<u8> {
    serde_json::to_vec(&items.iter().collect::<Vec<_>>()).expect("string sets serialize cleanly")
}

/// Parse a node payload as a set; garbage or absence decodes as empty.
pub(crate) fn decode(raw: Option<&[u8]>) -> BTreeSet<String> {
    raw.and_then(|raw| serde_json::from_slice::<Vec<String>>(raw).ok())
        .map(|items| items.into_iter().collect())
        .unwrap_or_default()
}
