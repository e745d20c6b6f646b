//! Channel name patterns.
//!
//! Names are `/`-separated hierarchies. A pattern is a name whose components
//! may be:
//!
//! - `*` matching exactly one component,
//! - `...` (last component only) matching zero or more components,
//! - `..` stepping back to the parent of the preceding component,
//! - `.` which is ignored.
//!
//! A pattern without wildcards that names a folder rather than a channel
//! selects every channel below that folder.

use crate::error::{DenError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Name(String),
    Any,
    Rest,
}

/// A parsed channel name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    segments: Vec<Segment>,
}

impl NamePattern {
    /// Parses a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidPattern`] for an empty pattern, a `..` that
    /// climbs above the root, a `...` that is not the last component, or a
    /// component that mixes `*` with other characters.
    pub fn parse(pattern: &str) -> Result<Self> {
        let illegal = |reason: &str| DenError::InvalidPattern(format!("{pattern:?}: {reason}"));

        let components: Vec<&str> = split_components(pattern).collect();
        if components.is_empty() {
            return Err(illegal("empty pattern"));
        }

        let mut segments = Vec::with_capacity(components.len());
        for (i, component) in components.iter().enumerate() {
            match *component {
                "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(illegal("'..' above root"));
                    }
                }
                "..." => {
                    if i + 1 != components.len() {
                        return Err(illegal("'...' must be the last component"));
                    }
                    segments.push(Segment::Rest);
                }
                "*" => segments.push(Segment::Any),
                name if name.contains('*') => {
                    return Err(illegal("'*' must be a whole component"));
                }
                name => segments.push(Segment::Name(name.to_string())),
            }
        }
        if segments.is_empty() {
            return Err(illegal("pattern resolves to the root"));
        }
        Ok(Self { segments })
    }

    /// Returns true if the pattern contains `*` or `...`.
    pub fn is_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Any | Segment::Rest))
    }

    /// Returns true if the pattern is a bare `...` selecting everything.
    pub fn is_everything(&self) -> bool {
        matches!(self.segments.as_slice(), [Segment::Rest])
    }

    /// Returns true if `name` matches the pattern itself (no folder expansion).
    pub fn matches(&self, name: &str) -> bool {
        let components: Vec<&str> = split_components(name).collect();
        match_segments(&self.segments, &components)
    }

    /// Returns true if `name` lies strictly below the folder this exact pattern names.
    fn contains_below(&self, name: &str) -> bool {
        let mut components = split_components(name);
        for segment in &self.segments {
            match (segment, components.next()) {
                (Segment::Name(expected), Some(actual)) if expected == actual => {}
                _ => return false,
            }
        }
        components.next().is_some()
    }

    /// Selects the matching names from `names`, preserving iteration order.
    ///
    /// An exact pattern that matches no name but names a folder selects
    /// every name below it.
    pub fn select<'a, I>(&self, names: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: Vec<&'a str> = names.into_iter().collect();
        let direct: Vec<&'a str> = names.iter().copied().filter(|n| self.matches(n)).collect();
        if !direct.is_empty() || self.is_wildcard() {
            return direct;
        }
        names
            .into_iter()
            .filter(|n| self.contains_below(n))
            .collect()
    }
}

fn split_components(name: &str) -> impl Iterator<Item = &str> {
    name.split('/').filter(|c| !c.is_empty())
}

fn match_segments(segments: &[Segment], components: &[&str]) -> bool {
    match segments.split_first() {
        None => components.is_empty(),
        Some((Segment::Rest, _)) => true,
        Some((Segment::Any, rest)) => {
            !components.is_empty() && match_segments(rest, &components[1..])
        }
        Some((Segment::Name(expected), rest)) => match components.split_first() {
            Some((actual, tail)) if expected == actual => match_segments(rest, tail),
            _ => false,
        },
    }
}
