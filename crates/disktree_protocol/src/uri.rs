//! Canonical origin-qualified names for scan roots and nodes.
//!
//! Two schemes exist: local absolute POSIX paths (`/var/log`) and object
//! store locations (`s3://bucket/key`). A `Uri` is always canonical: no
//! trailing slash except at a scheme root, no empty or relative components.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const OBJECT_PREFIX: &str = "s3://";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("Invalid URI '{uri}': {reason}")]
    Invalid { uri: String, reason: String },

    #[error("Unsupported scheme in '{0}'")]
    UnsupportedScheme(String),
}

impl UriError {
    fn invalid(uri: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}

/// URI scheme, which also selects the probe implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Local,
    Object,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "local",
            Scheme::Object => "object",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A canonical, origin-qualified name.
///
/// Stored as its canonical string form; all structural operations
/// (`parent`, `ancestors`, prefix tests) work on `/` boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri(String);

impl Uri {
    /// Parse and canonicalize a URI string.
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UriError::invalid(raw, "empty"));
        }

        if let Some(rest) = raw.strip_prefix(OBJECT_PREFIX) {
            return Self::parse_object(raw, rest);
        }

        if let Some(pos) = raw.find("://") {
            return Err(UriError::UnsupportedScheme(raw[..pos].to_string()));
        }

        Self::parse_local(raw)
    }

    fn parse_local(raw: &str) -> Result<Self, UriError> {
        if !raw.starts_with('/') {
            return Err(UriError::invalid(raw, "local path must be absolute"));
        }

        let mut components = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => continue,
                ".." => return Err(UriError::invalid(raw, "'..' component")),
                other => components.push(other),
            }
        }

        if components.is_empty() {
            return Ok(Uri("/".to_string()));
        }
        Ok(Uri(format!("/{}", components.join("/"))))
    }

    fn parse_object(raw: &str, rest: &str) -> Result<Self, UriError> {
        let mut parts = rest.splitn(2, '/');
        let bucket = parts.next().unwrap_or("");
        if bucket.is_empty() {
            return Err(UriError::invalid(raw, "missing bucket"));
        }

        let mut components = Vec::new();
        if let Some(key) = parts.next() {
            for part in key.split('/') {
                match part {
                    "" | "." => continue,
                    ".." => return Err(UriError::invalid(raw, "'..' component")),
                    other => components.push(other),
                }
            }
        }

        if components.is_empty() {
            return Ok(Uri(format!("{OBJECT_PREFIX}{bucket}")));
        }
        Ok(Uri(format!(
            "{OBJECT_PREFIX}{bucket}/{}",
            components.join("/")
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> Scheme {
        if self.0.starts_with(OBJECT_PREFIX) {
            Scheme::Object
        } else {
            Scheme::Local
        }
    }

    /// True at `/` or `s3://bucket`, the point where `parent` stops.
    pub fn is_scheme_root(&self) -> bool {
        match self.scheme() {
            Scheme::Local => self.0 == "/",
            Scheme::Object => !self.0[OBJECT_PREFIX.len()..].contains('/'),
        }
    }

    /// Parent URI; `None` at the scheme root.
    pub fn parent(&self) -> Option<Uri> {
        if self.is_scheme_root() {
            return None;
        }
        let cut = self.0.rfind('/')?;
        match self.scheme() {
            Scheme::Local => {
                if cut == 0 {
                    Some(Uri("/".to_string()))
                } else {
                    Some(Uri(self.0[..cut].to_string()))
                }
            }
            Scheme::Object => Some(Uri(self.0[..cut].to_string())),
        }
    }

    /// Last path component. For a scheme root, the whole URI.
    pub fn name(&self) -> &str {
        if self.is_scheme_root() {
            return &self.0;
        }
        match self.0.rfind('/') {
            Some(cut) => &self.0[cut + 1..],
            None => &self.0,
        }
    }

    /// Append one component.
    pub fn join(&self, name: &str) -> Uri {
        if self.0.ends_with('/') {
            Uri(format!("{}{name}", self.0))
        } else {
            Uri(format!("{}/{name}", self.0))
        }
    }

    /// True when `self` is equal to `other` or a `/`-boundary prefix of it.
    pub fn is_ancestor_of(&self, other: &Uri) -> bool {
        if self == other {
            return true;
        }
        if self.scheme() != other.scheme() {
            return false;
        }
        if self.0 == "/" {
            return other.0.starts_with('/');
        }
        other.0.starts_with(&self.0)
            && other.0.as_bytes().get(self.0.len()) == Some(&b'/')
    }

    /// Self first, then each parent up to and including the scheme root.
    pub fn ancestors(&self) -> Vec<Uri> {
        let mut out = vec![self.clone()];
        let mut cur = self.clone();
        while let Some(parent) = cur.parent() {
            out.push(parent.clone());
            cur = parent;
        }
        out
    }

    /// Number of components separating `self` from `ancestor` (0 if equal).
    pub fn depth_below(&self, ancestor: &Uri) -> Option<u32> {
        if !ancestor.is_ancestor_of(self) {
            return None;
        }
        if self == ancestor {
            return Some(0);
        }
        let suffix = if ancestor.0 == "/" {
            &self.0[1..]
        } else {
            &self.0[ancestor.0.len() + 1..]
        };
        Some(suffix.split('/').count() as u32)
    }

    /// Suffix of `self` relative to `ancestor`; `"."` when equal.
    pub fn relative_to(&self, ancestor: &Uri) -> Option<String> {
        if !ancestor.is_ancestor_of(self) {
            return None;
        }
        if self == ancestor {
            return Some(".".to_string());
        }
        let suffix = if ancestor.0 == "/" {
            &self.0[1..]
        } else {
            &self.0[ancestor.0.len() + 1..]
        };
        Some(suffix.to_string())
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::parse(s)
    }
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Uri::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_local_paths() {
        assert_eq!(Uri::parse("/a/b/").unwrap().as_str(), "/a/b");
        assert_eq!(Uri::parse("/a//b").unwrap().as_str(), "/a/b");
        assert_eq!(Uri::parse("/").unwrap().as_str(), "/");
        assert_eq!(Uri::parse("//").unwrap().as_str(), "/");
        assert!(Uri::parse("relative/path").is_err());
        assert!(Uri::parse("/a/../b").is_err());
        assert!(Uri::parse("").is_err());
    }

    #[test]
    fn canonicalizes_object_uris() {
        assert_eq!(Uri::parse("s3://b/k/").unwrap().as_str(), "s3://b/k");
        assert_eq!(Uri::parse("s3://b").unwrap().as_str(), "s3://b");
        assert_eq!(Uri::parse("s3://b/").unwrap().as_str(), "s3://b");
        assert!(Uri::parse("s3://").is_err());
        assert!(Uri::parse("gcs://b/k").is_err());
    }

    #[test]
    fn parent_chain_stops_at_scheme_root() {
        let uri = Uri::parse("/a/b/c").unwrap();
        let parents: Vec<String> = uri
            .ancestors()
            .iter()
            .map(|u| u.as_str().to_string())
            .collect();
        assert_eq!(parents, vec!["/a/b/c", "/a/b", "/a", "/"]);

        let obj = Uri::parse("s3://bucket/x/y").unwrap();
        let parents: Vec<String> = obj
            .ancestors()
            .iter()
            .map(|u| u.as_str().to_string())
            .collect();
        assert_eq!(parents, vec!["s3://bucket/x/y", "s3://bucket/x", "s3://bucket"]);
        assert!(Uri::parse("s3://bucket").unwrap().parent().is_none());
        assert!(Uri::parse("/").unwrap().parent().is_none());
    }

    #[test]
    fn ancestor_tests_respect_component_boundaries() {
        let a = Uri::parse("/a/b").unwrap();
        assert!(a.is_ancestor_of(&Uri::parse("/a/b/c").unwrap()));
        assert!(a.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&Uri::parse("/a/bc").unwrap()));
        assert!(Uri::parse("/").unwrap().is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&Uri::parse("s3://a/b/c").unwrap()));
    }

    #[test]
    fn relative_depth_and_suffix() {
        let root = Uri::parse("/home/u").unwrap();
        let deep = Uri::parse("/home/u/docs/tax").unwrap();
        assert_eq!(deep.depth_below(&root), Some(2));
        assert_eq!(deep.relative_to(&root).unwrap(), "docs/tax");
        assert_eq!(root.relative_to(&root).unwrap(), ".");
        assert_eq!(deep.depth_below(&Uri::parse("/").unwrap()), Some(4));
        assert!(deep.depth_below(&Uri::parse("/var").unwrap()).is_none());
        assert_eq!(deep.name(), "tax");
    }
}
