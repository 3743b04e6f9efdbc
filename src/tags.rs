use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use thiserror::Error;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9._-]*$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("tag set is empty")]
    Empty,

    #[error("invalid tag {0:?}")]
    InvalidToken(String),
}

/// A set of bare string labels attached to a target. Membership only, no
/// values. Targets start with their role-derived tags and accumulate tag
/// engine output during a discovery cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    /// Parse a whitespace separated tag string, e.g. `"k8s pod local"`.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut tags = BTreeSet::new();
        for token in input.split_whitespace() {
            if !TOKEN.is_match(token) {
                return Err(ParseError::InvalidToken(token.to_string()));
            }

            tags.insert(token.to_string());
        }

        if tags.is_empty() {
            return Err(ParseError::Empty);
        }

        Ok(TagSet(tags))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn insert(&mut self, tag: impl Into<String>) {
        self.0.insert(tag.into());
    }

    pub fn merge(&mut self, other: &TagSet) {
        for tag in &other.0 {
            if !self.0.contains(tag) {
                self.0.insert(tag.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, tag) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }

            f.write_str(tag)?;
        }

        Ok(())
    }
}

impl FromStr for TagSet {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        TagSet::parse(input)
    }
}

impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let input = String::deserialize(deserializer)?;
        TagSet::parse(&input).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let tags = TagSet::parse("pod  k8s pod").unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags.contains("k8s"));
        assert!(tags.contains("pod"));
        assert!(!tags.contains("service"));
    }

    #[test]
    fn parse_invalid() {
        assert_eq!(TagSet::parse(""), Err(ParseError::Empty));
        assert_eq!(TagSet::parse("   "), Err(ParseError::Empty));
        assert_eq!(
            TagSet::parse("k8s !pod"),
            Err(ParseError::InvalidToken("!pod".to_string()))
        );
        assert_eq!(
            TagSet::parse("8080"),
            Err(ParseError::InvalidToken("8080".to_string()))
        );
    }

    #[test]
    fn merge() {
        let mut tags = TagSet::parse("k8s").unwrap();
        tags.merge(&TagSet::parse("pod k8s").unwrap());

        assert_eq!(tags, TagSet::parse("k8s pod").unwrap());
    }

    #[test]
    fn display() {
        let tags = TagSet::parse("pod k8s").unwrap();
        assert_eq!(tags.to_string(), "k8s pod");
    }

    #[test]
    fn deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            tags: TagSet,
        }

        let wrapper = serde_yaml::from_str::<Wrapper>("tags: k8s pod").unwrap();
        assert_eq!(wrapper.tags, TagSet::parse("k8s pod").unwrap());

        assert!(serde_yaml::from_str::<Wrapper>("tags: \"\"").is_err());
    }
}
