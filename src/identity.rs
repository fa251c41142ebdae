//! User identity types and the directory collaborator.
//!
//! A `UserId` is the durable identifier a device proves possession of
//! during verification. Resolving ids to display names, and knowing who
//! the local authenticated user is, belongs to an external directory
//! (an account backend) that the core only talks to through a trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Durable user identifier (opaque string handed out by the account backend).
pub type UserId = String;

/// A directory entry for a known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub uid: UserId,
    pub username: String,
}

/// Resolves durable identifiers to human-readable profiles and exposes
/// the currently authenticated local identity.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// The locally authenticated user, if any.
    async fn current_user(&self) -> anyhow::Result<Profile>;

    /// Resolve a set of user ids to profiles. Unknown ids are omitted.
    async fn resolve(&self, uids: &[UserId]) -> anyhow::Result<Vec<Profile>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDirectory;

    #[tokio::test]
    async fn unknown_ids_are_omitted_from_resolution() {
        let mut directory = MemoryDirectory::new("u1", "alice");
        directory.insert("u2", "bob");

        let profiles = directory
            .resolve(&["u2".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].username, "bob");

        let me = directory.current_user().await.unwrap();
        assert_eq!(me.uid, "u1");
    }
}
