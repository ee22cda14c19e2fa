//! Container image references.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

const DEFAULT_DOMAIN: &str = "docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";

struct Patterns {
    digest: Regex,
    tag: Regex,
    path_component: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                digest: Regex::new(r"^[a-z0-9]+(?:[+._-][a-z0-9]+)*:[0-9a-fA-F]{32,}$").ok()?,
                tag: Regex::new(r"^[\w][\w.-]{0,127}$").ok()?,
                path_component: Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").ok()?,
            })
        })
        .as_ref()
}

/// A reference with a repository name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    /// Normalized repository name, domain included.
    pub name: String,
    /// Tag, if any.
    pub tag: Option<String>,
    /// Content digest, if any.
    pub digest: Option<String>,
}

impl fmt::Display for NamedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A bare content digest.
    Digest(String),
    /// A repository reference.
    Named(NamedRef),
}

/// Parses a bare digest or a repository reference.
pub fn parse_any(s: &str) -> Option<Reference> {
    if patterns()?.digest.is_match(s) && !s.contains('/') {
        return Some(Reference::Digest(s.to_string()));
    }
    parse_named(s).map(Reference::Named)
}

/// Parses a repository reference, normalizing short names onto the default
/// registry.
pub fn parse_named(s: &str) -> Option<NamedRef> {
    let patterns = patterns()?;
    let (rest, digest) = match s.split_once('@') {
        Some((rest, digest)) if patterns.digest.is_match(digest) => (rest, Some(digest.to_string())),
        Some(_) => return None,
        None => (s, None),
    };

    let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
    let (name, tag) = match rest[last_slash..].rfind(':') {
        Some(i) => {
            let tag = &rest[last_slash + i + 1..];
            if !patterns.tag.is_match(tag) {
                return None;
            }
            (&rest[..last_slash + i], Some(tag.to_string()))
        }
        None => (rest, None),
    };

    Some(NamedRef {
        name: normalize_name(patterns, name)?,
        tag,
        digest,
    })
}

fn normalize_name(patterns: &Patterns, name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }

    let (domain, path) = match name.split_once('/') {
        Some((first, path)) if first.contains(['.', ':']) || first == "localhost" => (first.to_string(), path.to_string()),
        Some(_) => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        None => (DEFAULT_DOMAIN.to_string(), format!("{OFFICIAL_REPO_PREFIX}{name}")),
    };

    if !path.split('/').all(|c| patterns.path_component.is_match(c)) {
        return None;
    }

    Some(format!("{domain}/{path}"))
}
