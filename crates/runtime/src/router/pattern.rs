//! Controller path patterns.
//!
//! A pattern is a `/`-separated list of literal segments and named
//! parameters (`:id`). Leading, trailing and repeated slashes are ignored.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern '{0}' must start with '/'")]
    NotAbsolute(String),

    #[error("pattern '{pattern}' has an empty parameter name")]
    EmptyParam { pattern: String },

    #[error("pattern '{pattern}' declares parameter ':{name}' twice")]
    DuplicateParam { pattern: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if !raw.starts_with('/') {
            return Err(PatternError::NotAbsolute(raw.to_string()));
        }

        let mut segments = Vec::new();
        for part in split(raw) {
            let segment = match part.strip_prefix(':') {
                Some("") => {
                    return Err(PatternError::EmptyParam {
                        pattern: raw.to_string(),
                    });
                }
                Some(name) => {
                    if segments
                        .iter()
                        .any(|s| matches!(s, Segment::Param(n) if n == name))
                    {
                        return Err(PatternError::DuplicateParam {
                            pattern: raw.to_string(),
                            name: name.to_string(),
                        });
                    }
                    Segment::Param(name.to_string())
                }
                None => Segment::Literal(part.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a percent-encoded request path. Segments are split on the raw
    /// `/` first and decoded once each, so an encoded slash stays part of
    /// its parameter.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let parts: Vec<&str> = split(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (segment, actual) in self.segments.iter().zip(parts) {
            let value = urlencoding::decode(actual)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| actual.to_string());
            match segment {
                Segment::Literal(literal) => {
                    if *literal != value {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), value);
                }
            }
        }
        Some(params)
    }

    /// Parameter names replaced by `:`; two patterns with the same shape
    /// match exactly the same paths.
    pub fn shape(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match segment {
                Segment::Literal(literal) => out.push_str(literal),
                Segment::Param(_) => out.push(':'),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Specificity ordering between two patterns that match the same path:
    /// at the first position where they differ, the literal wins.
    /// `Ordering::Equal` means neither is more specific.
    pub fn specificity_cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match (a, b) {
                (Segment::Literal(_), Segment::Param(_)) => return Ordering::Greater,
                (Segment::Param(_), Segment::Literal(_)) => return Ordering::Less,
                _ => {}
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
