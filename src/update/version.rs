//! Version ordering for release comparison
//!
//! A version splits on the first `-` into numeric components and an optional
//! prerelease suffix. Numeric parts compare component-wise with zero padding;
//! a release with no suffix outranks the same numbers with one; two suffixes
//! compare lexicographically.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Version {
    numbers: Vec<u64>,
    prerelease: Option<String>,
}

// Equality follows the padded comparison, so "1.0" and "1.0.0" are equal.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Version {
    /// Parse a version string; a leading `v` (as in feed tags) is ignored.
    /// Non-numeric components read as 0, matching feed tags like `1.2.x`.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim().trim_start_matches('v');
        let (main, pre) = match trimmed.split_once('-') {
            Some((main, pre)) => (main, Some(pre.to_string())),
            None => (trimmed, None),
        };
        let numbers = main
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect();
        Self {
            numbers,
            prerelease: pre,
        }
    }

    /// Whether this version is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.numbers.len().max(other.numbers.len());
        for i in 0..width {
            let a = self.numbers.get(i).copied().unwrap_or(0);
            let b = other.numbers.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let main = self
            .numbers
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        match &self.prerelease {
            Some(pre) => write!(f, "{}-{}", main, pre),
            None => write!(f, "{}", main),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s)
    }

    #[test]
    fn numeric_components_compare_componentwise() {
        assert!(v("1.2.0").is_newer_than(&v("1.1.9")));
        assert!(v("2.0.0").is_newer_than(&v("1.9.9")));
        assert!(!v("1.1.9").is_newer_than(&v("1.2.0")));
    }

    #[test]
    fn shorter_versions_zero_pad() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert!(v("1.0.1").is_newer_than(&v("1.0")));
        assert!(!v("1.0").is_newer_than(&v("1.0.0")));
    }

    #[test]
    fn release_outranks_its_own_prerelease() {
        assert!(v("2.0.0").is_newer_than(&v("2.0.0-beta.1")));
        assert!(!v("2.0.0-beta.1").is_newer_than(&v("2.0.0")));
    }

    #[test]
    fn prereleases_compare_lexicographically() {
        assert!(v("1.0.0-beta.2").is_newer_than(&v("1.0.0-beta.1")));
        assert!(v("1.0.0-rc.1").is_newer_than(&v("1.0.0-beta.9")));
    }

    #[test]
    fn tag_prefix_and_junk_tolerated() {
        assert_eq!(v("v1.2.3"), v("1.2.3"));
        assert_eq!(v("1.x.3"), v("1.0.3"));
    }

    #[test]
    fn equal_versions_are_not_newer() {
        assert!(!v("1.2.3").is_newer_than(&v("1.2.3")));
        assert!(!v("1.0.0-beta.1").is_newer_than(&v("1.0.0-beta.1")));
    }
}
