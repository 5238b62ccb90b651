use serde::{Deserialize, Serialize};

use bulkjobs_core::UserId;

/// Delivery target for a lifecycle event.
///
/// Every fact goes to the submitter's own channel and is mirrored to the
/// broadcast channel that privileged observers (admins) listen on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "user_id", rename_all = "snake_case")]
pub enum Channel {
    Submitter(UserId),
    Broadcast,
}

impl Channel {
    /// Room name as seen by real-time clients (`user:<id>` / `admin`).
    pub fn room(&self) -> String {
        match self {
            Channel::Submitter(user) => format!("user:{user}"),
            Channel::Broadcast => "admin".to_string(),
        }
    }

    /// Whether a viewer with the given identity and privilege reads this channel.
    pub fn is_visible_to(&self, viewer: UserId, privileged: bool) -> bool {
        match self {
            Channel::Submitter(user) => *user == viewer,
            Channel::Broadcast => privileged,
        }
    }
}

/// Marks messages that belong to one submitter.
///
/// Streaming endpoints use this to make sure a subscriber only ever sees
/// envelopes routed to them.
pub trait SubmitterScoped {
    fn channel(&self) -> Channel;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooms_follow_submitter_and_admin_naming() {
        let user = UserId::new();
        assert_eq!(Channel::Submitter(user).room(), format!("user:{user}"));
        assert_eq!(Channel::Broadcast.room(), "admin");
    }

    #[test]
    fn broadcast_is_privileged_only() {
        let owner = UserId::new();
        let other = UserId::new();

        assert!(Channel::Submitter(owner).is_visible_to(owner, false));
        assert!(!Channel::Submitter(owner).is_visible_to(other, true));
        assert!(Channel::Broadcast.is_visible_to(other, true));
        assert!(!Channel::Broadcast.is_visible_to(owner, false));
    }
}
