//! Versioned cache key builders
//!
//! Keys are namespaced as `v1:<domain>:<entity>:<id>` so a schema change can
//! bump the version instead of flushing Redis.

use std::fmt;

const KEY_VERSION: &str = "v1";

pub mod payment {
    use super::*;
    use uuid::Uuid;

    /// Cached snapshot of a settled payment attempt
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttemptKey {
        attempt_id: Uuid,
    }

    impl AttemptKey {
        pub fn new(attempt_id: Uuid) -> Self {
            Self { attempt_id }
        }
    }

    impl fmt::Display for AttemptKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:payment:attempt:{}", KEY_VERSION, self.attempt_id)
        }
    }
}
