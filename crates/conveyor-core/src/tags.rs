//! Capability tags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An ordered set of capability tags.
///
/// Jobs carry the tags they require; workers carry the tags they offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every tag in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &TagSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", tags.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset() {
        let docker: TagSet = ["docker"].into_iter().collect();
        let docker_linux: TagSet = ["linux", "docker"].into_iter().collect();

        assert!(docker.is_subset_of(&docker_linux));
        assert!(!docker_linux.is_subset_of(&docker));
        assert!(TagSet::new().is_subset_of(&docker));
        assert!(!docker.is_subset_of(&TagSet::new()));
    }

    #[test]
    fn test_display_is_sorted() {
        let tags: TagSet = ["b", "a"].into_iter().collect();
        assert_eq!(tags.to_string(), "[a,b]");
    }
}
