use std::fmt;

use crate::error::Error;

/// A hierarchical, `/`-separated key, in the style of file-system paths:
/// `/comedy`, `/comedy/monty-python`. Keys are stored in canonical form
/// (leading slash), so `"a"` and `"/a"` name the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HierarchicalKey {
    key: String,
}

impl HierarchicalKey {
    pub fn new(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        if s.is_empty() {
            return Err(Error::InvalidKey("key must not be empty".to_string()));
        }
        let key = if s.starts_with('/') { s } else { format!("/{s}") };
        Ok(Self { key })
    }

    /// The child of this key under `segment`:
    /// `key("/comedy").child_string("monty-python") == key("/comedy/monty-python")`.
    pub fn child_string(&self, segment: &str) -> Self {
        Self {
            key: format!("{}/{}", self.key, segment),
        }
    }

    /// Non-empty path segments, in order.
    pub fn list(&self) -> Vec<&str> {
        self.key.split('/').filter(|s| !s.is_empty()).collect()
    }

    pub fn is_top_level(&self) -> bool {
        self.list().len() == 1
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for HierarchicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form() -> Result<(), Error> {
        assert_eq!(HierarchicalKey::new("abc")?, HierarchicalKey::new("/abc")?);
        assert_eq!(HierarchicalKey::new("/abc")?.as_str(), "/abc");
        assert!(HierarchicalKey::new("").is_err());
        Ok(())
    }

    #[test]
    fn child_and_list() -> Result<(), Error> {
        let key = HierarchicalKey::new("/comedy")?.child_string("monty-python");
        assert_eq!(key.as_str(), "/comedy/monty-python");
        assert_eq!(key.list(), vec!["comedy", "monty-python"]);
        assert!(!key.is_top_level());
        assert!(HierarchicalKey::new("/comedy")?.is_top_level());
        Ok(())
    }
}
