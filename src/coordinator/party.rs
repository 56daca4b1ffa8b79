//! The "party" recipe: group membership as ephemeral children of one node.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ensure_path, CoordinatorService, Error, Result};

/// Membership of one consumer in a named group.
///
/// Joining creates an ephemeral child unique to this member under the
/// party's root path; losing the session is indistinguishable from leaving,
/// which is what lets the surviving members react to crashed peers.
pub struct Party<C: CoordinatorService + ?Sized> {
    service: Arc<C>,
    member_name: String,
    path: String,
}

impl<C: CoordinatorService + ?Sized> Party<C> {
    pub fn new(service: Arc<C>, member_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service,
            member_name: member_name.into(),
            path: path.into(),
        }
    }

    fn member_path(&self) -> String {
        format!("{}/{}", self.path, self.member_name)
    }

    /// Create the party root and subscribe to membership changes.
    ///
    /// Expected to be called before [`join`](Self::join).
    pub async fn start(&self) -> Result<broadcast::Receiver<Vec<String>>> {
        ensure_path(self.service.as_ref(), &self.path).await?;
        self.service.watch_children(&self.path).await
    }

    /// Establish this consumer as a member of the party.
    ///
    /// If a node with our name already exists it was left behind by an
    /// earlier session and is recreated to take ownership.
    pub async fn join(&self) -> Result<()> {
        info!(
            path = self.path.as_str(),
            member = self.member_name.as_str(),
            "Joining party"
        );

        let path = self.member_path();
        match self.service.create_ephemeral(&path, vec![]).await {
            Ok(()) => Ok(()),
            Err(Error::NodeExists(_)) => {
                debug!(path = path.as_str(), "Member node exists, re-creating");
                self.service.delete(&path).await.ok();
                self.service.create_ephemeral(&path, vec![]).await
            }
            Err(e) => Err(e),
        }
    }

    /// Leave the party; a no-op when the node is already gone.
    pub async fn leave(&self) -> Result<()> {
        info!(
            path = self.path.as_str(),
            member = self.member_name.as_str(),
            "Leaving party"
        );

        match self.service.delete(&self.member_path()).await {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The current member names, sorted.
    pub async fn members(&self) -> Result<Vec<String>> {
        self.service.get_children(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::coordinator::MemoryCoordinator;

    #[tokio::test]
    async fn test_join_members_leave() {
        let coordinator = MemoryCoordinator::new();

        let a = Party::new(
            Arc::new(coordinator.session()),
            "a",
            "/groups/workers/members",
        );
        let b = Party::new(
            Arc::new(coordinator.session()),
            "b",
            "/groups/workers/members",
        );

        let mut watch = a.start().await.unwrap();
        a.join().await.unwrap();
        assert_eq!(watch.recv().await.unwrap(), vec!["a".to_owned()]);

        b.start().await.unwrap();
        b.join().await.unwrap();
        assert_eq!(
            watch.recv().await.unwrap(),
            vec!["a".to_owned(), "b".to_owned()]
        );
        assert_eq!(
            a.members().await.unwrap(),
            vec!["a".to_owned(), "b".to_owned()]
        );

        b.leave().await.unwrap();
        assert_eq!(watch.recv().await.unwrap(), vec!["a".to_owned()]);

        // leaving twice is fine
        b.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_steals_abandoned_node() {
        let coordinator = MemoryCoordinator::new();

        let stale = coordinator.session();
        let party_stale = Party::new(Arc::new(stale), "a", "/groups/workers/members");
        party_stale.start().await.unwrap();
        party_stale.join().await.unwrap();

        // a new session with the same member name takes over
        let fresh = Party::new(
            Arc::new(coordinator.session()),
            "a",
            "/groups/workers/members",
        );
        fresh.join().await.unwrap();
        assert_eq!(fresh.members().await.unwrap(), vec!["a".to_owned()]);
    }
}
