//! Per-process consumer names

use std::fmt;
use uuid::Uuid;

/// Length of the random suffix
const SUFFIX_LEN: usize = 8;

/// Name under which the broker tracks this process's pending entries.
///
/// Generated once at startup and never reused across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerIdentity(String);

impl ConsumerIdentity {
    /// `<prefix>-<8 hex chars>`
    pub fn generate(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", prefix, &suffix[..SUFFIX_LEN]))
    }

    /// Name as sent to the broker
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerIdentity {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}
