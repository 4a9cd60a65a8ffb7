//! Path expressions that select which node properties a sequencer reacts to.
//!
//! Grammar:
//!
//! ```text
//! expression := [ "{" workspace "}" ] select [ "@" property ] [ "=>" output ]
//! select     := "/" | ( "/" segment )+
//! segment    := "*" | "**" | name-glob
//! property   := "*" | name
//! ```
//!
//! - `*` matches exactly one segment, `**` matches zero or more segments, and a
//!   name containing `*` (for example `*.jpg`) matches one segment by glob.
//! - Every wildcard segment is a capture, numbered from 1 left to right. The
//!   output template may reference them as `$1`..`$9`; `$0` is the full node path.
//! - The workspace, select path and property constraints compose with AND.
//! - `\` escapes the next character inside names.
//!
//! Expressions are compiled to an anchored regex once, at parse time, so
//! matching never fails.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::ConfigurationError;

const MAX_CAPTURE: usize = 9;

/// One segment of a compiled select path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `*`
    Any,
    /// `**`
    AnyDepth,
    /// A name containing wildcards, e.g. `*.jpg`.
    Glob(Vec<GlobPart>),
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobPart {
    Literal(String),
    Wildcard,
}

/// Constraint on the changed property's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyFilter {
    Any,
    Named(String),
}

impl PropertyFilter {
    fn accepts(&self, property: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => name == property,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputPart {
    Literal(String),
    Capture(usize),
}

/// Result of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    /// Captured wildcard values; index 0 is the full node path.
    pub captures: Vec<String>,
    /// The output template expanded with the captures, if the rule has one.
    pub output_path: Option<String>,
}

/// A parsed, compiled path expression.
#[derive(Debug, Clone)]
pub struct PathExpression {
    source: String,
    workspace: Option<String>,
    segments: Vec<Segment>,
    property: PropertyFilter,
    output: Option<Vec<OutputPart>>,
    regex: Regex,
}

impl PathExpression {
    /// Parses and compiles an expression.
    pub fn parse(expression: &str) -> Result<Self, ConfigurationError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ConfigurationError::BlankPathExpression);
        }

        let invalid = |position: usize, reason: &str| ConfigurationError::InvalidPathExpression {
            expression: trimmed.to_string(),
            position,
            reason: reason.to_string(),
        };

        let (select_src, output_src) = match find_unescaped(trimmed, "=>") {
            Some(idx) => {
                let output = trimmed[idx + 2..].trim();
                if output.is_empty() {
                    return Err(invalid(idx, "output path may not be blank"));
                }
                (trimmed[..idx].trim_end(), Some((idx + 2, output)))
            }
            None => (trimmed, None),
        };

        let mut offset = 0;
        let mut rest = select_src;
        let mut workspace = None;
        if let Some(after_brace) = rest.strip_prefix('{') {
            let Some(close) = find_unescaped(after_brace, "}") else {
                return Err(invalid(0, "unterminated workspace"));
            };
            let name = unescape(after_brace[..close].trim());
            if name.is_empty() {
                return Err(invalid(1, "workspace may not be blank"));
            }
            workspace = Some(name);
            offset = close + 2;
            rest = &rest[offset..];
        }

        if !rest.starts_with('/') {
            return Err(invalid(offset, "select path must be absolute"));
        }

        let (path_src, property_src) = match find_unescaped(rest, "@") {
            Some(idx) => (&rest[..idx], Some((offset + idx + 1, &rest[idx + 1..]))),
            None => (rest, None),
        };

        let segments = parse_segments(path_src, offset, &invalid)?;
        let property = match property_src {
            None => PropertyFilter::Any,
            Some((pos, src)) => parse_property(src, pos, &invalid)?,
        };

        let capture_count = segments
            .iter()
            .filter(|s| !matches!(s, Segment::Literal(_)))
            .count();

        let output = match output_src {
            None => None,
            Some((pos, src)) => Some(parse_output(src, pos, capture_count, &invalid)?),
        };

        let regex = compile(&segments).map_err(|e| invalid(offset, &e.to_string()))?;

        Ok(Self {
            source: trimmed.to_string(),
            workspace,
            segments,
            property,
            output,
            regex,
        })
    }

    /// The expression as written (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub const fn property(&self) -> &PropertyFilter {
        &self.property
    }

    #[must_use]
    pub const fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Evaluates the expression against a changed property.
    ///
    /// `path` must be a normalized absolute path (`/` for the root).
    #[must_use]
    pub fn matches(&self, workspace: &str, path: &str, property: &str) -> Option<PathMatch> {
        if let Some(ws) = &self.workspace {
            if ws != workspace {
                return None;
            }
        }
        if !self.property.accepts(property) {
            return None;
        }

        // The root is matched as the empty string so `**` can match zero segments.
        let subject = if path == "/" { "" } else { path };
        let caps = self.regex.captures(subject)?;

        let mut captures = Vec::with_capacity(caps.len());
        captures.push(path.to_string());
        for group in caps.iter().skip(1) {
            let value = group.map_or("", |m| m.as_str());
            captures.push(value.trim_start_matches('/').to_string());
        }

        let output_path = self.output.as_ref().map(|parts| {
            let mut out = String::new();
            for part in parts {
                match part {
                    OutputPart::Literal(s) => out.push_str(s),
                    OutputPart::Capture(i) => out.push_str(captures.get(*i).map_or("", String::as_str)),
                }
            }
            normalize(&out)
        });

        Some(PathMatch { captures, output_path })
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for PathExpression {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for PathExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathExpression {}

/// Collapses repeated and trailing separators: `//a//b/` becomes `/a/b`.
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Byte index of the first occurrence of `needle` not preceded by an escape.
fn find_unescaped(haystack: &str, needle: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, c) in haystack.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
        if haystack[idx..].starts_with(needle) {
            return Some(idx);
        }
    }
    None
}

/// Drops escape characters, keeping the character each one protects.
fn unescape(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            other => out.push(other),
        }
    }
    out
}

fn parse_segments(
    src: &str,
    offset: usize,
    invalid: &dyn Fn(usize, &str) -> ConfigurationError,
) -> Result<Vec<Segment>, ConfigurationError> {
    if src == "/" {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut start = offset + 1;
    let mut escaped = false;

    // Skip the leading '/'; every further unescaped '/' closes a segment.
    for (idx, c) in src.char_indices().skip(1) {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '/' => {
                segments.push(parse_segment(&current, start, invalid)?);
                current.clear();
                start = offset + idx + 1;
            }
            _ => current.push(c),
        }
    }
    if escaped {
        return Err(invalid(offset + src.len(), "dangling escape"));
    }
    segments.push(parse_segment(&current, start, invalid)?);
    Ok(segments)
}

fn parse_segment(
    raw: &str,
    position: usize,
    invalid: &dyn Fn(usize, &str) -> ConfigurationError,
) -> Result<Segment, ConfigurationError> {
    if raw.is_empty() {
        return Err(invalid(position, "empty path segment"));
    }
    if raw == "**" {
        return Ok(Segment::AnyDepth);
    }
    if raw == "*" {
        return Ok(Segment::Any);
    }

    let mut parts: Vec<GlobPart> = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('/') => return Err(invalid(position, "'/' cannot be escaped inside a name")),
                Some(next) => literal.push(next),
                None => {}
            },
            '*' => {
                if !literal.is_empty() {
                    parts.push(GlobPart::Literal(std::mem::take(&mut literal)));
                }
                if parts.last() != Some(&GlobPart::Wildcard) {
                    parts.push(GlobPart::Wildcard);
                }
            }
            '{' | '}' | '[' | ']' => {
                return Err(invalid(position, &format!("unexpected '{c}' in segment")));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        parts.push(GlobPart::Literal(literal));
    }

    match parts.as_slice() {
        [GlobPart::Literal(name)] => Ok(Segment::Literal(name.clone())),
        _ => Ok(Segment::Glob(parts)),
    }
}

fn parse_property(
    src: &str,
    position: usize,
    invalid: &dyn Fn(usize, &str) -> ConfigurationError,
) -> Result<PropertyFilter, ConfigurationError> {
    let src = src.trim();
    if src.is_empty() {
        return Err(invalid(position, "property name may not be blank"));
    }
    if src == "*" {
        return Ok(PropertyFilter::Any);
    }

    let mut name = String::with_capacity(src.len());
    let mut chars = src.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => name.push(next),
                None => return Err(invalid(position + src.len(), "dangling escape")),
            },
            '*' => return Err(invalid(position, "property name may only be '*' or a literal name")),
            '/' | '@' => return Err(invalid(position, &format!("unexpected '{c}' in property name"))),
            other => name.push(other),
        }
    }
    Ok(PropertyFilter::Named(name))
}

fn parse_output(
    src: &str,
    position: usize,
    capture_count: usize,
    invalid: &dyn Fn(usize, &str) -> ConfigurationError,
) -> Result<Vec<OutputPart>, ConfigurationError> {
    if !src.starts_with('/') && !src.starts_with('$') {
        return Err(invalid(position, "output path must be absolute"));
    }

    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = src.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => literal.push(next),
                None => return Err(invalid(position + src.len(), "dangling escape")),
            },
            '$' => {
                let Some(index) = chars.next().and_then(|d| d.to_digit(10)) else {
                    return Err(invalid(position, "'$' must be followed by a capture number"));
                };
                let index = index as usize;
                if index > capture_count || index > MAX_CAPTURE {
                    return Err(invalid(
                        position,
                        &format!("output references ${index} but select captures {capture_count}"),
                    ));
                }
                if !literal.is_empty() {
                    parts.push(OutputPart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(OutputPart::Capture(index));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        parts.push(OutputPart::Literal(literal));
    }
    Ok(parts)
}

fn compile(segments: &[Segment]) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    for segment in segments {
        match segment {
            Segment::Literal(name) => {
                pattern.push('/');
                pattern.push_str(&regex::escape(name));
            }
            Segment::Any => pattern.push_str("/([^/]+)"),
            Segment::AnyDepth => pattern.push_str("((?:/[^/]+)*)"),
            Segment::Glob(parts) => {
                pattern.push_str("/(");
                for part in parts {
                    match part {
                        GlobPart::Literal(s) => pattern.push_str(&regex::escape(s)),
                        GlobPart::Wildcard => pattern.push_str("[^/]*"),
                    }
                }
                pattern.push(')');
            }
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}
