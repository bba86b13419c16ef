//! Prefixed ID generation.
//!
//! Request IDs use a `prefix_` followed by a UUIDv7 (time-ordered), which
//! keeps them unique across reconnects and sortable when reading logs.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a command request ID: `req_<uuid7>`
pub fn request_id() -> String {
    prefixed_id("req")
}

/// Generate a controller run ID: `run_<uuid7>`
pub fn run_id() -> String {
    prefixed_id("run")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_correct_prefix() {
        assert!(request_id().starts_with("req_"));
        assert!(run_id().starts_with("run_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = request_id();
        let b = request_id();
        assert_ne!(a, b);
    }
}
