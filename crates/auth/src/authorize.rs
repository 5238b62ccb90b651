use thiserror::Error;

use bulkjobs_core::UserId;

use crate::{JwtClaims, Role};

/// The authenticated caller of a pipeline operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(user_id: UserId, roles: Vec<Role>) -> Self {
        Self { user_id, roles }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self::new(user_id, vec![Role::ADMIN])
    }

    pub fn member(user_id: UserId) -> Self {
        Self::new(user_id, Vec::new())
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }
}

impl From<&JwtClaims> for Actor {
    fn from(claims: &JwtClaims) -> Self {
        Self::new(claims.sub, claims.roles.clone())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
}

/// Only admins may submit bulk jobs.
pub fn authorize_submit(actor: &Actor) -> Result<(), AuthzError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(AuthzError::Forbidden("admin role required"))
    }
}

/// Owners and admins may read or cancel a job.
pub fn authorize_view(actor: &Actor, owner: UserId) -> Result<(), AuthzError> {
    if actor.is_admin() || actor.user_id == owner {
        Ok(())
    } else {
        Err(AuthzError::Forbidden("job belongs to another user"))
    }
}
