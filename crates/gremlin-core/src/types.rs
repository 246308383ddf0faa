//! Core identifiers: service references and recipe ids

use crate::error::ValidationError;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A service name with an optional set of version tags
///
/// Written as `name` or `name:tag1,tag2`. The tag list is split off at the
/// last `:` so names may themselves contain colons. Absent tags mean
/// "any version". Tags keep the order they were written in; equality
/// ignores that order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceRef {
    name: String,
    version_tags: Option<IndexSet<String>>,
}

impl ServiceRef {
    /// Untagged reference to `name`
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_tags: None,
        }
    }

    /// Reference restricted to the given version tags
    #[must_use]
    pub fn with_tags<I, S>(name: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: IndexSet<String> = tags.into_iter().map(Into::into).collect();
        Self {
            name: name.into(),
            version_tags: if tags.is_empty() { None } else { Some(tags) },
        }
    }

    /// Service name without tags
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version tags, if any
    #[inline]
    #[must_use]
    pub fn version_tags(&self) -> Option<&IndexSet<String>> {
        self.version_tags.as_ref()
    }

    /// Add the tags of another declaration of the same service
    ///
    /// New tags are appended after the existing ones. An untagged reference
    /// contributes nothing.
    pub fn merge_tags(&mut self, other: &ServiceRef) {
        let Some(extra) = &other.version_tags else {
            return;
        };
        self.version_tags
            .get_or_insert_with(IndexSet::new)
            .extend(extra.iter().cloned());
    }

    /// Version tags as an owned list, the form rules carry on the wire
    #[must_use]
    pub fn tag_list(&self) -> Option<Vec<String>> {
        self.version_tags
            .as_ref()
            .map(|tags| tags.iter().cloned().collect())
    }

    /// Whether this reference pins specific versions
    #[inline]
    #[must_use]
    pub fn is_tagged(&self) -> bool {
        self.version_tags.is_some()
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_tags {
            Some(tags) => {
                let joined: Vec<&str> = tags.iter().map(String::as_str).collect();
                write!(f, "{}:{}", self.name, joined.join(","))
            }
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ServiceRef {
    type Err = ValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidServiceRef {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (name, tags) = match input.rfind(':') {
            Some(colon) => (&input[..colon], Some(&input[colon + 1..])),
            None => (input, None),
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("service name is empty"));
        }

        let version_tags = match tags {
            None => None,
            Some(list) => {
                let mut set = IndexSet::new();
                for tag in list.split(',') {
                    let tag = tag.trim();
                    if tag.is_empty() {
                        return Err(invalid("empty version tag"));
                    }
                    set.insert(tag.to_string());
                }
                Some(set)
            }
        };

        Ok(Self {
            name: name.to_string(),
            version_tags,
        })
    }
}

impl TryFrom<String> for ServiceRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceRef> for String {
    fn from(value: ServiceRef) -> Self {
        value.to_string()
    }
}

/// Unique identifier of one fault-injection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeId(pub Uuid);

impl RecipeId {
    /// Generate new recipe ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecipeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecipeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untagged_reference() {
        let r: ServiceRef = "reviews".parse().unwrap();
        assert_eq!(r.name(), "reviews");
        assert!(r.version_tags().is_none());
        assert_eq!(r.to_string(), "reviews");
    }

    #[test]
    fn parses_tagged_reference() {
        let r: ServiceRef = "reviews:v2,canary".parse().unwrap();
        assert_eq!(r.name(), "reviews");
        assert_eq!(r.tag_list().unwrap(), vec!["v2", "canary"]);
        assert_eq!(r, ServiceRef::with_tags("reviews", ["canary", "v2"]));
    }

    #[test]
    fn tags_keep_declared_order() {
        let r: ServiceRef = "reviews:v2,v1".parse().unwrap();
        assert_eq!(r.to_string(), "reviews:v2,v1");
        assert_eq!(r.tag_list().unwrap(), vec!["v2", "v1"]);
    }

    #[test]
    fn merge_tags_appends_new_versions() {
        let mut r: ServiceRef = "reviews:v1".parse().unwrap();
        r.merge_tags(&"reviews:v2,v1".parse::<ServiceRef>().unwrap());
        r.merge_tags(&ServiceRef::new("reviews"));
        assert_eq!(r.to_string(), "reviews:v1,v2");

        let mut bare = ServiceRef::new("ratings");
        bare.merge_tags(&ServiceRef::with_tags("ratings", ["v3"]));
        assert_eq!(bare.tag_list().unwrap(), vec!["v3"]);
    }

    #[test]
    fn splits_on_last_colon() {
        let r: ServiceRef = "ns:reviews:v1".parse().unwrap();
        assert_eq!(r.name(), "ns:reviews");
        assert_eq!(r.tag_list().unwrap(), vec!["v1"]);
    }

    #[test]
    fn rejects_empty_name_and_tags() {
        assert!("".parse::<ServiceRef>().is_err());
        assert!(":v1".parse::<ServiceRef>().is_err());
        assert!("reviews:".parse::<ServiceRef>().is_err());
        assert!("reviews:v1,,v2".parse::<ServiceRef>().is_err());
    }

    #[test]
    fn tagged_and_untagged_are_distinct() {
        assert_ne!(ServiceRef::new("reviews"), ServiceRef::with_tags("reviews", ["v1"]));
    }

    #[test]
    fn serializes_as_string() {
        let r = ServiceRef::with_tags("ratings", ["v1"]);
        assert_eq!(serde_json::to_string(&r).unwrap(), "\"ratings:v1\"");
        let back: ServiceRef = serde_json::from_str("\"ratings:v1\"").unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn recipe_id_round_trips_through_display() {
        let id = RecipeId::new();
        assert_eq!(id.to_string().parse::<RecipeId>().unwrap(), id);
    }
}
