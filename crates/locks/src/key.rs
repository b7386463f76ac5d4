use std::fmt;

use switchboard_common::normalize_sender;

/// Lock key for one end-user session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// `session:<normalised sender>`, or `session:<sender>:<qualifier>` when
    /// a narrower action-level lock is wanted.
    pub fn for_sender(sender_id: &str, qualifier: Option<&str>) -> Self {
        let sender = normalize_sender(sender_id);
        match qualifier {
            Some(q) if !q.is_empty() => Self(format!("session:{sender}:{q}")),
            _ => Self(format!("session:{sender}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
