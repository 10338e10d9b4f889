//! Dotted paths addressing nodes in the state tree.
//!
//! A `Path` is an immutable sequence of labels, written `pools.pool7.space.free`.
//! The empty path addresses the root branch. Every derivation (child, parent,
//! tail) returns a new `Path`; nothing is mutated in place.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{StateError, StateResult};

/// Separator between labels in the textual form of a path.
pub const SEPARATOR: char = '.';

/// An immutable, ordered list of labels.
///
/// Labels are shared `Arc<str>`s so cloning and deriving paths never copies
/// label text. Equality and hashing compare label contents, so two paths
/// built in different ways are equal iff they hold the same labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    labels: Vec<Arc<str>>,
}

impl Path {
    /// The root path (no labels).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a dotted path. The empty string parses to the root path.
    pub fn parse(s: &str) -> StateResult<Self> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut labels = Vec::new();
        for label in s.split(SEPARATOR) {
            if label.is_empty() {
                return Err(StateError::BadPath(format!("empty label in \"{s}\"")));
            }
            labels.push(Arc::from(label));
        }
        Ok(Self { labels })
    }

    /// Build a path from individual labels.
    pub fn from_labels<I, S>(labels: I) -> StateResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = Self::root();
        for label in labels {
            path = path.new_child(label.as_ref())?;
        }
        Ok(path)
    }

    /// A path one level below this one.
    pub fn new_child(&self, label: &str) -> StateResult<Self> {
        check_label(label)?;
        let mut labels = self.labels.clone();
        labels.push(Arc::from(label));
        Ok(Self { labels })
    }

    /// Child derivation for a label already known to be valid (a key taken
    /// from the tree itself).
    pub(crate) fn child(&self, label: &str) -> Self {
        let mut labels = self.labels.clone();
        labels.push(Arc::from(label));
        Self { labels }
    }

    /// Append every label of `other` below this path.
    pub fn new_child_path(&self, other: &Path) -> Self {
        let mut labels = self.labels.clone();
        labels.extend(other.labels.iter().cloned());
        Self { labels }
    }

    /// The enclosing path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.labels.is_empty() {
            return None;
        }
        Some(Self {
            labels: self.labels[..self.labels.len() - 1].to_vec(),
        })
    }

    /// This path without its first label. The tail of a one-label path is
    /// the root path.
    pub fn child_path(&self) -> Self {
        Self {
            labels: self.labels.iter().skip(1).cloned().collect(),
        }
    }

    /// The first label, or `None` for the root.
    pub fn first_label(&self) -> Option<&str> {
        self.labels.first().map(|l| l.as_ref())
    }

    /// The last label, or `None` for the root.
    pub fn last_label(&self) -> Option<&str> {
        self.labels.last().map(|l| l.as_ref())
    }

    /// Labels from the root downwards.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.as_ref())
    }

    /// Number of labels; zero for the root.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether this is the empty path addressing the root.
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// True for a path of exactly one label.
    pub fn is_simple(&self) -> bool {
        self.labels.len() == 1
    }

    /// True if `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        other.labels.len() > self.labels.len() && other.labels.starts_with(&self.labels)
    }

    /// True if `other` is exactly one level below this path.
    pub fn is_direct_parent_of(&self, other: &Path) -> bool {
        other.labels.len() == self.labels.len() + 1 && other.labels.starts_with(&self.labels)
    }

    /// True if `other` is this path or lies below it.
    pub fn equals_or_has_child(&self, other: &Path) -> bool {
        other.labels.starts_with(&self.labels)
    }
}

fn check_label(label: &str) -> StateResult<()> {
    if label.is_empty() {
        return Err(StateError::BadPath("empty label".to_string()));
    }
    if label.contains(SEPARATOR) {
        return Err(StateError::BadPath(format!(
            "label \"{label}\" contains '{SEPARATOR}'"
        )));
    }
    Ok(())
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            f.write_str(label)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
