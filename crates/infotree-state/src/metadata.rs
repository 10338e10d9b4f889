//! Branch metadata: static attributes attached to branches by path pattern.
//!
//! Serializers use these attributes to describe a branch (for example
//! `pools.*` carrying `class = "pool"`). Metadata is looked up when a branch
//! enters the tree and travels with it; it never affects tree semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::path::Path;
use crate::predicate::Predicate;

/// Attribute map for one branch.
pub type BranchMetadata = BTreeMap<String, String>;

/// Ordered list of (pattern, attributes) rules. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    rules: Vec<(Predicate, Arc<BranchMetadata>)>,
}

impl MetadataRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; earlier rules take precedence.
    pub fn add_rule(&mut self, pattern: Predicate, attributes: BranchMetadata) {
        self.rules.push((pattern, Arc::new(attributes)));
    }

    /// Builder form of [`MetadataRegistry::add_rule`].
    pub fn with_rule(mut self, pattern: Predicate, attributes: BranchMetadata) -> Self {
        self.add_rule(pattern, attributes);
        self
    }

    /// Attributes of the first rule matching `path`.
    pub fn lookup(&self, path: &Path) -> Option<Arc<BranchMetadata>> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, attributes)| Arc::clone(attributes))
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
