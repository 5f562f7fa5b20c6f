//! Hierarchical group paths used to serialize conflicting jobs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered segments naming a job's serialization group.
///
/// Two paths conflict when one is a prefix of the other (equal paths
/// included). Jobs whose paths conflict never run at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGroupPath(Vec<String>);

impl JobGroupPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The empty root path. It conflicts with every other path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// True when `self` is a prefix of `other` (or equal to it).
    pub fn is_prefix_of(&self, other: &JobGroupPath) -> bool {
        other.0.starts_with(&self.0)
    }

    pub fn conflicts(&self, other: &JobGroupPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Strict ancestors, longest first, ending with the root path.
    pub fn ancestors(&self) -> impl Iterator<Item = JobGroupPath> + '_ {
        (0..self.0.len()).rev().map(move |n| Self(self.0[..n].to_vec()))
    }
}

impl fmt::Display for JobGroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl<S: Into<String>> From<Vec<S>> for JobGroupPath {
    fn from(segments: Vec<S>) -> Self {
        Self::new(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> JobGroupPath {
        JobGroupPath::new(segments.iter().copied())
    }

    #[test]
    fn test_conflicts_on_prefix() {
        assert!(path(&["g"]).conflicts(&path(&["g", "x"])));
        assert!(path(&["g", "x"]).conflicts(&path(&["g"])));
        assert!(path(&["g", "x"]).conflicts(&path(&["g", "x"])));
        assert!(JobGroupPath::root().conflicts(&path(&["a"])));
    }

    #[test]
    fn test_disjoint_paths_do_not_conflict() {
        assert!(!path(&["g", "x"]).conflicts(&path(&["g", "y"])));
        assert!(!path(&["a"]).conflicts(&path(&["b", "a"])));
        // segment-wise, not string-wise
        assert!(!path(&["ab"]).conflicts(&path(&["a"])));
    }

    #[test]
    fn test_ancestors_longest_first() {
        let ancestors: Vec<_> = path(&["a", "b", "c"]).ancestors().collect();
        assert_eq!(
            ancestors,
            vec![path(&["a", "b"]), path(&["a"]), JobGroupPath::root()]
        );
        assert_eq!(JobGroupPath::root().ancestors().count(), 0);
    }

    #[test]
    fn test_parent_and_child() {
        let p = path(&["a"]).child("b");
        assert_eq!(p, path(&["a", "b"]));
        assert_eq!(p.parent(), Some(path(&["a"])));
        assert_eq!(JobGroupPath::root().parent(), None);
        assert_eq!(p.to_string(), "a/b");
    }
}
