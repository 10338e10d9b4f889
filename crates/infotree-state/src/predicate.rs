//! Path predicates: paths whose labels may be wildcards.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{StateError, StateResult};
use crate::path::{Path, SEPARATOR};

/// The wildcard label.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PredicateLabel {
    Any,
    Exact(Arc<str>),
}

impl PredicateLabel {
    fn matches(&self, label: &str) -> bool {
        match self {
            PredicateLabel::Any => true,
            PredicateLabel::Exact(exact) => exact.as_ref() == label,
        }
    }
}

/// A path pattern, e.g. `pools.*.queues.*`.
///
/// A predicate matches a path of the same length whose labels are equal to
/// the predicate's labels at every non-wildcard position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Predicate {
    labels: Vec<PredicateLabel>,
}

impl Predicate {
    /// Parse a dotted pattern. The empty string matches only the root path.
    pub fn parse(s: &str) -> StateResult<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let mut labels = Vec::new();
        for label in s.split(SEPARATOR) {
            let label = match label {
                "" => {
                    return Err(StateError::BadPath(format!(
                        "empty label in predicate \"{s}\""
                    )))
                }
                WILDCARD => PredicateLabel::Any,
                exact => PredicateLabel::Exact(Arc::from(exact)),
            };
            labels.push(label);
        }
        Ok(Self { labels })
    }

    /// Whether `path` has the same length and matches every label.
    pub fn matches(&self, path: &Path) -> bool {
        self.labels.len() == path.len()
            && self
                .labels
                .iter()
                .zip(path.labels())
                .all(|(pattern, label)| pattern.matches(label))
    }

    /// Whether the first pattern label accepts `label`. An empty predicate
    /// accepts nothing.
    pub fn top_label_matches(&self, label: &str) -> bool {
        self.labels.first().is_some_and(|p| p.matches(label))
    }

    /// The predicate without its first label, for descending one level.
    pub fn child_predicate(&self) -> Self {
        Self {
            labels: self.labels.iter().skip(1).cloned().collect(),
        }
    }

    /// Whether exactly one label remains.
    pub fn is_simple(&self) -> bool {
        self.labels.len() == 1
    }

    /// Whether no label remains.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

impl From<&Path> for Predicate {
    fn from(path: &Path) -> Self {
        Self {
            labels: path
                .labels()
                .map(|l| PredicateLabel::Exact(Arc::from(l)))
                .collect(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            match label {
                PredicateLabel::Any => f.write_str(WILDCARD)?,
                PredicateLabel::Exact(exact) => f.write_str(exact)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Predicate {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(s: &str) -> Predicate {
        Predicate::parse(s).unwrap()
    }

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn wildcard_matching() {
        let p = pred("pools.*.queues.*");
        assert!(p.matches(&path("pools.pool1.queues.mover")));
        assert!(p.matches(&path("pools.pool2.queues.restore")));
        assert!(!p.matches(&path("pools.pool1.other")));
        assert!(!p.matches(&path("pools.pool1.queues")));
        assert!(!p.matches(&path("pools.pool1.queues.mover.active")));
        assert!(!p.matches(&path("doors.pool1.queues.mover")));
    }

    #[test]
    fn exact_predicate() {
        let p = pred("doors.d1.load");
        assert!(p.matches(&path("doors.d1.load")));
        assert!(!p.matches(&path("doors.d2.load")));
        assert_eq!(Predicate::from(&path("doors.d1.load")), p);
    }

    #[test]
    fn empty_predicate_matches_root_only() {
        let p = pred("");
        assert!(p.is_empty());
        assert!(p.matches(&Path::root()));
        assert!(!p.matches(&path("a")));
        assert!(!p.top_label_matches("a"));
    }

    #[test]
    fn top_label_and_descent() {
        let p = pred("*.space.free");
        assert!(p.top_label_matches("anything"));

        let child = p.child_predicate();
        assert_eq!(child.to_string(), "space.free");
        assert!(child.top_label_matches("space"));
        assert!(!child.top_label_matches("queues"));

        let leaf = child.child_predicate();
        assert!(leaf.is_simple());
        assert!(leaf.child_predicate().is_empty());
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(pred("links.*.units.store.*").to_string(), "links.*.units.store.*");
    }

    #[test]
    fn parse_rejects_empty_labels() {
        assert!(Predicate::parse("a..*").is_err());
    }
}
