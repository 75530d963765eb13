//! Scope names such as `string.quoted.single.apex`.
//!
//! A scope is a dot-separated list of atoms. Tokens carry a list of scopes ordered from the
//! outermost (the grammar scope) to the innermost one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single scope name, cheap to clone since tokens repeat the same scopes a lot.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Scope(Arc<str>);

impl Scope {
    /// Create a scope from a dot-separated string. Surrounding whitespace is ignored.
    pub fn new(s: &str) -> Scope {
        Scope(Arc::from(s.trim()))
    }

    /// Splits a rule `name` like `"string.json support.type.property-name.json"` into
    /// its individual scopes.
    pub fn parse_names(name: &str) -> Vec<Scope> {
        name.split_whitespace().map(Scope::new).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The dot separated parts of that scope
    pub fn atoms(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|a| !a.is_empty())
    }

    /// Number of atoms in that scope
    pub fn len(&self) -> usize {
        self.atoms().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Atom-wise prefix check: `string.quoted` is a prefix of `string.quoted.single` but
    /// not of `string.quotedx`. The empty scope is a prefix of everything.
    pub fn is_prefix_of(&self, other: &Scope) -> bool {
        let mut theirs = other.atoms();
        self.atoms().all(|atom| theirs.next() == Some(atom))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope(\"{}\")", self.0)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Scope::new(value)
    }
}

impl Serialize for Scope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Scope::new(&s))
    }
}
