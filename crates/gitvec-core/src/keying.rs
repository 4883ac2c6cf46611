//! Webhook identity keying.
//!
//! Derives a stable, collision-resistant key from an inbound event so
//! duplicate deliveries across server instances hash to the same dedup ledger
//! row. Pure function, no state.

use sha2::{Digest, Sha256};

/// Compute the dedup key for a webhook event.
///
/// The key is the hex-encoded SHA-256 of the platform, event type, project id,
/// and a payload-specific discriminator (commit SHA, note id, merge request
/// iid plus action plus updated-at, ...). Logically identical redeliveries
/// must pass the same discriminator; distinct actions on the same object must
/// not, which is why callers include the action and a platform-supplied
/// monotonic field in it.
pub fn webhook_key(platform: &str, event_type: &str, project_id: i64, discriminator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(platform.as_bytes());
    hasher.update(b":");
    hasher.update(event_type.as_bytes());
    hasher.update(b":");
    hasher.update(project_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(discriminator.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_event_same_key() {
        let a = webhook_key("gitlab", "push", 42, "abc123:refs/heads/main");
        let b = webhook_key("gitlab", "push", 42, "abc123:refs/heads/main");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key = webhook_key("gitlab", "push", 1, "sha");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinct_fields_distinct_keys() {
        let base = webhook_key("gitlab", "merge_request", 42, "7:open:2026-01-01T00:00:00Z");
        // Different action on the same object
        let merged = webhook_key("gitlab", "merge_request", 42, "7:merge:2026-01-02T00:00:00Z");
        // Same object/action, bumped revision
        let updated = webhook_key("gitlab", "merge_request", 42, "7:open:2026-01-03T00:00:00Z");
        let other_project = webhook_key("gitlab", "merge_request", 43, "7:open:2026-01-01T00:00:00Z");
        let other_platform = webhook_key("github", "merge_request", 42, "7:open:2026-01-01T00:00:00Z");

        for k in [&merged, &updated, &other_project, &other_platform] {
            assert_ne!(&base, k);
        }
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc"
        let a = webhook_key("gitlab", "ab", 1, "c");
        let b = webhook_key("gitlab", "a", 1, "bc");
        assert_ne!(a, b);
    }
}
