use crate::model::Element;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const HASH_TOKEN_PREFIX: &str = "H";
const RANDOM_TOKEN_PREFIX: &str = "R";
const HASH_TOKEN_LENGTH: usize = 16;
const SEPARATOR: &str = "_";
/// Room for a system prefix and a random token that still tells names apart
pub const MIN_IDENTIFIER_LENGTH: usize = 12;

/// Prefix tree that turns external name paths into short, unique,
/// storage-safe identifiers.
///
/// Identifiers are built by appending the normalized last segment to the
/// identifier of the parent path. When that would exceed the length limit or
/// collide, a hash of the whole path is used instead, and a random token as
/// the last resort.
#[derive(Debug, Clone)]
pub struct NameRegistry {
    root: NameNode,
    used: HashSet<String>,
    max_length: usize,
    max_segment_length: usize,
}

#[derive(Debug, Clone, Default)]
pub struct NameNode {
    pub identifier: String,
    pub definition: Option<Element>,
    children: HashMap<String, NameNode>,
}

impl NameRegistry {
    pub fn new(max_length: usize, max_segment_length: usize) -> Self {
        Self {
            root: NameNode::default(),
            used: HashSet::new(),
            max_length: max_length.max(MIN_IDENTIFIER_LENGTH),
            max_segment_length: max_segment_length.max(1),
        }
    }

    /// Register `path` and return its identifier. Nodes of already registered
    /// prefixes are reused; `prefix` only applies to a newly created last node.
    pub fn register(
        &mut self,
        path: &[&str],
        prefix: &str,
        definition: Option<&Element>,
    ) -> String {
        let Self {
            root,
            used,
            max_length,
            max_segment_length,
        } = self;

        let mut node = root;
        for (depth, segment) in path.iter().enumerate() {
            let node_prefix = if depth + 1 == path.len() { prefix } else { "" };
            let parent_identifier = node.identifier.clone();
            node = node.children.entry(segment.to_string()).or_insert_with(|| {
                let identifier = generate(
                    used,
                    &parent_identifier,
                    &path[..=depth],
                    node_prefix,
                    *max_length,
                    *max_segment_length,
                );
                used.insert(identifier.clone());
                NameNode {
                    identifier,
                    ..NameNode::default()
                }
            });
        }

        if let Some(definition) = definition {
            node.definition = Some(definition.clone());
        }
        node.identifier.clone()
    }

    pub fn lookup(&self, path: &[&str]) -> Option<&NameNode> {
        let mut node = &self.root;
        for segment in path {
            node = node.children.get(*segment)?;
        }
        Some(node)
    }

    pub fn identifier(&self, path: &[&str]) -> Option<&str> {
        self.lookup(path).map(|node| node.identifier.as_str())
    }

    pub fn definition(&self, path: &[&str]) -> Option<&Element> {
        self.lookup(path).and_then(|node| node.definition.as_ref())
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

/// Strip everything but ASCII alphanumerics, uppercase, cap the length
pub fn normalize_segment(segment: &str, max_segment_length: usize) -> String {
    segment
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .take(max_segment_length)
        .collect()
}

fn hash_token(path: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.join("\u{1f}"));
    let digest = hex::encode_upper(hasher.finalize());
    format!("{}{}", HASH_TOKEN_PREFIX, &digest[..HASH_TOKEN_LENGTH])
}

fn join(prefix: &str, parent: &str, token: &str) -> String {
    if parent.is_empty() {
        format!("{}{}", prefix, token)
    } else {
        format!("{}{}{}{}", prefix, parent, SEPARATOR, token)
    }
}

/// `prefix + parent + token`, or `prefix + token` alone when that would not fit
fn fit(prefix: &str, parent: &str, token: &str, max_length: usize) -> String {
    let joined = join(prefix, parent, token);
    if joined.len() <= max_length {
        return joined;
    }
    let mut alone = format!("{}{}", prefix, token);
    alone.truncate(max_length);
    alone
}

fn generate(
    used: &HashSet<String>,
    parent: &str,
    path: &[&str],
    prefix: &str,
    max_length: usize,
    max_segment_length: usize,
) -> String {
    let last = path.last().copied().unwrap_or_default();
    let segment = normalize_segment(last, max_segment_length);
    if !segment.is_empty() {
        let candidate = join(prefix, parent, &segment);
        if candidate.len() <= max_length && !used.contains(&candidate) {
            return candidate;
        }
    }

    let candidate = fit(prefix, parent, &hash_token(path), max_length);
    if !used.contains(&candidate) {
        return candidate;
    }

    loop {
        let token = format!(
            "{}{}",
            RANDOM_TOKEN_PREFIX,
            Uuid::new_v4().simple().to_string().to_uppercase()
        );
        let candidate = fit(prefix, parent, &token, max_length);
        if !used.contains(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_normalized_segments_to_parent() {
        let mut registry = NameRegistry::new(127, 32);
        assert_eq!(registry.register(&["Person"], "", None), "PERSON");
        assert_eq!(
            registry.register(&["Person", "home-address"], "", None),
            "PERSON_HOMEADDRESS"
        );
        assert_eq!(
            registry.register(&["Person", "home-address", "street"], "", None),
            "PERSON_HOMEADDRESS_STREET"
        );
    }

    #[test]
    fn same_path_yields_same_identifier() {
        let mut registry = NameRegistry::new(127, 32);
        let first = registry.register(&["a", "b"], "", None);
        let second = registry.register(&["a", "b"], "", None);
        assert_eq!(first, second);
        assert_eq!(registry.identifier(&["a"]), Some("A"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn collisions_fall_back_to_path_hash() {
        let mut registry = NameRegistry::new(127, 32);
        let plain = registry.register(&["firstName"], "", None);
        let clash = registry.register(&["first_name"], "", None);
        assert_eq!(plain, "FIRSTNAME");
        assert_ne!(plain, clash);
        assert!(clash.starts_with("H"));
        assert_eq!(clash.len(), 1 + HASH_TOKEN_LENGTH);
        // Deterministic for the path
        assert_eq!(clash, hash_token(&["first_name"]));
    }

    #[test]
    fn prefix_applies_to_new_leaf() {
        let mut registry = NameRegistry::new(127, 32);
        assert_eq!(registry.register(&["$parent"], "_", None), "_PARENT");
        assert_eq!(registry.register(&["parent"], "", None), "PARENT");
        // Existing nodes are reused whatever the prefix
        assert_eq!(registry.register(&["$parent"], "", None), "_PARENT");
    }

    #[test]
    fn long_paths_stay_within_limit() {
        let mut registry = NameRegistry::new(24, 10);
        let path = ["averyveryverylongname", "anotherlongsegment", "third", "fourth"];
        for depth in 1..=path.len() {
            let identifier = registry.register(&path[..depth], "", None);
            assert!(identifier.len() <= 24, "{} too long", identifier);
        }
        assert_eq!(registry.identifier(&path[..1]), Some("AVERYVERYV"));
    }

    #[test]
    fn symbol_only_segments_use_hash() {
        let mut registry = NameRegistry::new(127, 32);
        let identifier = registry.register(&["$$"], "", None);
        assert!(identifier.starts_with("H"));
    }

    #[test]
    fn identifiers_are_unique_across_many_paths() {
        let mut registry = NameRegistry::new(12, 4);
        let mut seen = HashMap::new();
        for i in 0..200 {
            let a = format!("seg{}", i % 7);
            let b = format!("x-{}", i);
            let path = [a.as_str(), b.as_str()];
            let identifier = registry.register(&path, "", None);
            assert!(identifier.len() <= 12);
            if let Some(previous) = seen.insert(identifier.clone(), (a.clone(), b.clone())) {
                assert_eq!(previous, (a, b), "identifier {} reused", identifier);
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn tiny_limits_are_raised_to_the_minimum() {
        let mut registry = NameRegistry::new(1, 1);
        let mut seen = HashSet::new();
        for i in 0..50 {
            let segment = format!("same{}", i);
            let identifier = registry.register(&[segment.as_str()], "_", None);
            assert!(identifier.len() <= MIN_IDENTIFIER_LENGTH, "{} too long", identifier);
            assert!(seen.insert(identifier));
        }
        assert_eq!(registry.len(), 50);
    }

    #[test]
    fn keeps_leaf_definitions() {
        let element: Element =
            serde_json::from_value(serde_json::json!({ "type": "cds.String" })).unwrap();
        let mut registry = NameRegistry::new(127, 32);
        registry.register(&["T", "name"], "", Some(&element));
        assert_eq!(registry.definition(&["T", "name"]), Some(&element));
        assert!(registry.definition(&["T"]).is_none());
    }
}
