//! Shortcode tokens: `[field:name]`, `[calc:name]`, `[lookup:name]`.
//!
//! Kind keywords are case-insensitive and names are normalized to trimmed
//! lowercase, so `[Calc: Total ]` and `[calc:total]` are the same token.
//! Brackets that don't form a valid shortcode are left as plain text.

pub mod closure;

use std::fmt;
use std::ops::Range;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

pub use closure::extract_field_dependencies;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortcodeKind {
    Field,
    Calc,
    Lookup,
}

impl ShortcodeKind {
    pub fn from_keyword(keyword: &str) -> Option<ShortcodeKind> {
        match keyword.trim().to_ascii_lowercase().as_str() {
            "field" => Some(ShortcodeKind::Field),
            "calc" => Some(ShortcodeKind::Calc),
            "lookup" => Some(ShortcodeKind::Lookup),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            ShortcodeKind::Field => "field",
            ShortcodeKind::Calc => "calc",
            ShortcodeKind::Lookup => "lookup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Shortcode {
    Field(String),
    Calc(String),
    Lookup(String),
}

impl Shortcode {
    pub fn new(kind: ShortcodeKind, name: &str) -> Shortcode {
        let name = normalize_name(name);
        match kind {
            ShortcodeKind::Field => Shortcode::Field(name),
            ShortcodeKind::Calc => Shortcode::Calc(name),
            ShortcodeKind::Lookup => Shortcode::Lookup(name),
        }
    }

    pub fn field(name: &str) -> Shortcode {
        Shortcode::new(ShortcodeKind::Field, name)
    }

    pub fn calc(name: &str) -> Shortcode {
        Shortcode::new(ShortcodeKind::Calc, name)
    }

    pub fn lookup(name: &str) -> Shortcode {
        Shortcode::new(ShortcodeKind::Lookup, name)
    }

    pub fn kind(&self) -> ShortcodeKind {
        match self {
            Shortcode::Field(_) => ShortcodeKind::Field,
            Shortcode::Calc(_) => ShortcodeKind::Calc,
            Shortcode::Lookup(_) => ShortcodeKind::Lookup,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Shortcode::Field(n) | Shortcode::Calc(n) | Shortcode::Lookup(n) => n,
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self, Shortcode::Field(_))
    }
}

impl fmt::Display for Shortcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().keyword(), self.name())
    }
}

pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A shortcode occurrence and its byte range in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcodeSpan {
    pub range: Range<usize>,
    pub code: Shortcode,
}

/// Find every shortcode occurrence, left to right.
pub fn scan(text: &str) -> Vec<ShortcodeSpan> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'[' {
            i += 1;
            continue;
        }
        match parse_at(text, i) {
            Some(span) => {
                i = span.range.end;
                spans.push(span);
            }
            None => i += 1,
        }
    }

    spans
}

// `start` points at '['. Brackets are ASCII so byte offsets stay on char boundaries.
fn parse_at(text: &str, start: usize) -> Option<ShortcodeSpan> {
    let rest = &text[start + 1..];
    let close = rest.find(|c| c == ']' || c == '[' || c == '\n')?;
    if rest.as_bytes()[close] != b']' {
        return None;
    }
    let inner = &rest[..close];
    let (keyword, name) = inner.split_once(':')?;
    let kind = ShortcodeKind::from_keyword(keyword)?;
    if name.trim().is_empty() {
        return None;
    }
    Some(ShortcodeSpan {
        range: start..start + close + 2,
        code: Shortcode::new(kind, name),
    })
}

/// Deduplicated set of tokens referenced by `text`.
pub fn extract_dependencies(text: &str) -> FxHashSet<Shortcode> {
    scan(text).into_iter().map(|s| s.code).collect()
}

/// Tokens in first-occurrence order, deduplicated.
pub fn extract_ordered(text: &str) -> Vec<Shortcode> {
    let mut seen = FxHashSet::default();
    scan(text)
        .into_iter()
        .map(|s| s.code)
        .filter(|code| seen.insert(code.clone()))
        .collect()
}

pub fn contains_shortcodes(text: &str) -> bool {
    !scan(text).is_empty()
}

/// Replace every occurrence with the callback's rendering.
pub fn substitute<F>(text: &str, mut render: F) -> String
where
    F: FnMut(&Shortcode) -> String,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for span in scan(text) {
        out.push_str(&text[last..span.range.start]);
        out.push_str(&render(&span.code));
        last = span.range.end;
    }
    out.push_str(&text[last..]);
    out
}

/// The single token `text` consists of, ignoring surrounding whitespace.
pub fn sole_shortcode(text: &str) -> Option<Shortcode> {
    let trimmed = text.trim();
    let spans = scan(trimmed);
    match spans.as_slice() {
        [only] if only.range == (0..trimmed.len()) => Some(only.code.clone()),
        _ => None,
    }
}
