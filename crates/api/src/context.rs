use bulkjobs_auth::{Actor, Role};
use bulkjobs_core::UserId;

/// Principal context for a request (authenticated identity + roles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    actor: Actor,
}

impl PrincipalContext {
    pub fn new(actor: Actor) -> Self {
        Self { actor }
    }

    pub fn user_id(&self) -> UserId {
        self.actor.user_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.actor.roles
    }

    pub fn is_admin(&self) -> bool {
        self.actor.is_admin()
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }
}
