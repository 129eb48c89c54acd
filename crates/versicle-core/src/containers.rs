//! Container registry
//!
//! Every top-level container in the shared document is declared here with
//! its kind. Checkpoint restore and the inspector use the registry instead
//! of probing a container to find out what it is.

/// Container names used in the shared document
pub mod names {
    pub const LIBRARY: &str = "library";
    pub const READING_LIST: &str = "reading-list";
    pub const PROGRESS: &str = "progress";
    pub const ANNOTATIONS: &str = "annotations";
    pub const LEXICON: &str = "lexicon";
    pub const CONTENT_ANALYSIS: &str = "contentAnalysis";

    /// Prefix for per-device preference maps (`preferences/<deviceId>`)
    pub const PREFERENCES_PREFIX: &str = "preferences/";
}

/// The declared kind of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Key → value map
    Map,
    /// Append-only ordered sequence
    Sequence,
}

/// Result of looking a container name up in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// One of the static containers
    Static(ContainerKind),
    /// A container matching a dynamic prefix
    Dynamic(ContainerKind),
    /// Not declared anywhere; only seen in historical data
    Unknown,
}

impl Resolved {
    /// The declared kind, if the name is known
    pub fn kind(self) -> Option<ContainerKind> {
        match self {
            Resolved::Static(kind) | Resolved::Dynamic(kind) => Some(kind),
            Resolved::Unknown => None,
        }
    }
}

/// Static containers, created in the genesis change of every document
pub const STATIC_CONTAINERS: &[(&str, ContainerKind)] = &[
    (names::LIBRARY, ContainerKind::Map),
    (names::READING_LIST, ContainerKind::Map),
    (names::PROGRESS, ContainerKind::Map),
    (names::ANNOTATIONS, ContainerKind::Map),
    (names::LEXICON, ContainerKind::Map),
    (names::CONTENT_ANALYSIS, ContainerKind::Map),
];

/// Dynamic container prefixes and the kind of containers they create
const DYNAMIC_PREFIXES: &[(&str, ContainerKind)] =
    &[(names::PREFERENCES_PREFIX, ContainerKind::Map)];

/// Registry mapping container names to declared kinds
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerRegistry;

impl ContainerRegistry {
    /// Resolve a container name
    pub fn resolve(name: &str) -> Resolved {
        if let Some((_, kind)) = STATIC_CONTAINERS.iter().find(|(n, _)| *n == name) {
            return Resolved::Static(*kind);
        }

        DYNAMIC_PREFIXES
            .iter()
            .find(|(prefix, _)| name.len() > prefix.len() && name.starts_with(prefix))
            .map(|(_, kind)| Resolved::Dynamic(*kind))
            .unwrap_or(Resolved::Unknown)
    }

    /// Names of all static containers
    pub fn static_names() -> impl Iterator<Item = &'static str> {
        STATIC_CONTAINERS.iter().map(|(name, _)| *name)
    }

    /// Name of the preferences container for a device
    pub fn preferences_for(device_id: &str) -> String {
        format!("{}{}", names::PREFERENCES_PREFIX, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_containers_resolve() {
        assert_eq!(
            ContainerRegistry::resolve("library"),
            Resolved::Static(ContainerKind::Map)
        );
        assert_eq!(
            ContainerRegistry::resolve("contentAnalysis"),
            Resolved::Static(ContainerKind::Map)
        );
    }

    #[test]
    fn test_dynamic_preferences() {
        let name = ContainerRegistry::preferences_for("device-a");
        assert_eq!(name, "preferences/device-a");
        assert_eq!(
            ContainerRegistry::resolve(&name),
            Resolved::Dynamic(ContainerKind::Map)
        );

        // Bare prefix is not a container
        assert_eq!(ContainerRegistry::resolve("preferences/"), Resolved::Unknown);
    }

    #[test]
    fn test_unknown_names() {
        assert_eq!(ContainerRegistry::resolve("legacy-cache"), Resolved::Unknown);
        assert!(ContainerRegistry::resolve("legacy-cache").kind().is_none());
    }
}
