//! The access-control gate consulted before every mutating operation.
//!
//! The gate is a collaborator, not part of the booking core: the engine only
//! asks the two questions below and treats the answers as final.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

/// A user's standing against one piece of equipment, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Banned,
    Pending,
    Authorized,
    Administrator,
}

#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn is_authorized(&self, user: &str, equipment: Ulid) -> bool;
    async fn is_administrator(&self, user: &str, equipment: Ulid) -> bool;
}

/// Gate that admits everyone. Demo registries only.
pub struct AllowAll;

#[async_trait]
impl AccessGate for AllowAll {
    async fn is_authorized(&self, _user: &str, _equipment: Ulid) -> bool {
        true
    }

    async fn is_administrator(&self, _user: &str, _equipment: Ulid) -> bool {
        true
    }
}

/// In-memory role table keyed by (equipment, user). Users without a rule
/// have no access at all.
#[derive(Default)]
pub struct AclTable {
    rules: DashMap<(Ulid, String), Role>,
}

impl AclTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_role(&self, equipment: Ulid, user: &str, role: Role) {
        self.rules.insert((equipment, user.to_string()), role);
    }

    pub fn role_of(&self, equipment: Ulid, user: &str) -> Option<Role> {
        self.rules
            .get(&(equipment, user.to_string()))
            .map(|r| *r.value())
    }

    pub fn users_with_role(&self, equipment: Ulid, role: Role) -> Vec<String> {
        let mut users: Vec<String> = self
            .rules
            .iter()
            .filter(|e| e.key().0 == equipment && *e.value() == role)
            .map(|e| e.key().1.clone())
            .collect();
        users.sort();
        users
    }
}

#[async_trait]
impl AccessGate for AclTable {
    async fn is_authorized(&self, user: &str, equipment: Ulid) -> bool {
        matches!(
            self.role_of(equipment, user),
            Some(Role::Authorized) | Some(Role::Administrator)
        )
    }

    async fn is_administrator(&self, user: &str, equipment: Ulid) -> bool {
        self.role_of(equipment, user) == Some(Role::Administrator)
    }
}
