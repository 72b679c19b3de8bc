//! Canonical container names and the daemon's ownership marker.
//!
//! Every container this daemon manages carries a name of the form
//! `<service>-<hash16>__<index><POSTFIX>`. The name alone is enough to
//! recover ownership, service membership, generation, and replica index
//! without any persisted state.

use sha1::{Digest, Sha1};

use crate::manifest::ServiceSpec;

/// Marks a container as owned and managed by this daemon.
pub const POSTFIX: &str = "_kir";

/// Derives the 16 hex character generation hash for a service spec.
///
/// Hashes the spec's canonical JSON serialization together with the
/// daemon's own version, so a binary upgrade alone is enough to force a
/// hard redeploy of every service.
pub fn hash16(spec: &ServiceSpec, daemon_version: &str) -> String {
    let mut hasher = Sha1::new();
    let canonical =
        serde_json::to_vec(spec).expect("ServiceSpec always serializes");
    hasher.update(&canonical);
    hasher.update(daemon_version.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    hex[..16].to_string()
}

/// Builds the canonical name for replica `index` of `service_name` at
/// generation `hash16`.
pub fn container_name(service_name: &str, hash16: &str, index: usize) -> String {
    format!("{service_name}-{hash16}__{index}{POSTFIX}")
}

/// Prefix shared by every container belonging to `service_name`,
/// regardless of generation or index: `"<service>-"`.
pub fn service_prefix(service_name: &str) -> String {
    format!("{service_name}-")
}

/// True iff `name` is owned by this daemon.
pub fn is_owned(name: &str) -> bool {
    name.contains(POSTFIX)
}

/// True iff `name` belongs to `service_name`'s current generation.
pub fn is_current(name: &str, service_name: &str, hash16: &str) -> bool {
    name.starts_with(&service_prefix(service_name)) && name.contains(hash16)
}

/// True iff `name` is an "old" container of `service_name`: owned by us,
/// sharing the service prefix, but not a link-alias entry (those carry an
/// extra `/` from Docker's `/name/alias` link naming).
pub fn is_old_generation(name: &str, service_name: &str, current_hash16: &str) -> bool {
    let stripped = name.trim_start_matches('/');
    stripped.starts_with(&service_prefix(service_name))
        && is_owned(stripped)
        && stripped.matches('/').count() == 0
        && !stripped.contains(current_hash16)
}

/// Parses the service name component back out of a canonical container
/// name, e.g. `"web-abcdef0123456789__0_kir"` -> `"web"`.
pub fn service_name_of(name: &str) -> Option<&str> {
    let stripped = name.trim_start_matches('/');
    stripped.split_once('-').map(|(service, _rest)| service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ServiceSpec;

    fn spec(image: &str) -> ServiceSpec {
        ServiceSpec {
            image: image.to_string(),
            ..ServiceSpec::test_default()
        }
    }

    #[test]
    fn hash_is_stable_for_identical_specs() {
        let a = hash16(&spec("app"), "0.1.0");
        let b = hash16(&spec("app"), "0.1.0");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn hash_changes_with_version() {
        let a = hash16(&spec("app"), "0.1.0");
        let b = hash16(&spec("app"), "0.2.0");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_changes_with_image() {
        let a = hash16(&spec("app"), "0.1.0");
        let b = hash16(&spec("other"), "0.1.0");
        assert_ne!(a, b);
    }

    #[test]
    fn recognizes_old_generation_but_not_link_alias() {
        let current = "abcdef0123456789";
        assert!(is_old_generation("web-1111111111111111__0_kir", "web", current));
        assert!(!is_old_generation("web-abcdef0123456789__0_kir", "web", current));
        assert!(!is_old_generation(
            "/web-1111111111111111__0_kir/db",
            "web",
            current
        ));
    }

    #[test]
    fn service_name_of_roundtrips() {
        let name = container_name("web", "abcdef0123456789", 2);
        assert_eq!(service_name_of(&name), Some("web"));
    }
}
