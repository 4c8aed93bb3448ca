use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

static ACTIVITY_TASK_TOKEN_PREFIX: &[u8] = b"act_";
const ATTEMPT_LEN: usize = 4;
const SALT_LEN: usize = 16;

/// Type-safe wrapper for task token bytes. A token is issued when a worker
/// claims an attempt and binds every response the worker sends back to that
/// exact attempt. Tokens embed the attempt number and activity id, plus a
/// random salt so two attempts can never produce colliding tokens.
#[derive(Hash, Eq, PartialEq, Clone, derive_more::From, derive_more::Into)]
pub struct TaskToken(pub Vec<u8>);

impl TaskToken {
    /// Mint the token for one specific attempt of an activity.
    pub(crate) fn for_attempt(activity_id: &str, attempt: u32) -> Self {
        let mut bytes = ACTIVITY_TASK_TOKEN_PREFIX.to_vec();
        bytes.extend_from_slice(&attempt.to_le_bytes());
        bytes.extend_from_slice(Uuid::new_v4().as_bytes());
        bytes.extend_from_slice(activity_id.as_bytes());
        TaskToken(bytes)
    }

    /// Extract the `(activity id, attempt)` pair this token was issued for.
    /// Returns `None` for tokens not minted by this crate.
    pub(crate) fn decode(&self) -> Option<(&str, u32)> {
        let rest = self.0.strip_prefix(ACTIVITY_TASK_TOKEN_PREFIX)?;
        if rest.len() < ATTEMPT_LEN + SALT_LEN {
            return None;
        }
        let (attempt_bytes, rest) = rest.split_at(ATTEMPT_LEN);
        let (_salt, id_bytes) = rest.split_at(SALT_LEN);
        let attempt = u32::from_le_bytes(attempt_bytes.try_into().ok()?);
        Some((std::str::from_utf8(id_bytes).ok()?, attempt))
    }
}

impl Display for TaskToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&fmt_tt(&self.0))
    }
}

impl Debug for TaskToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskToken({})", fmt_tt(&self.0))
    }
}

pub(crate) fn fmt_tt(tt: &[u8]) -> String {
    base64::encode(tt)
}
