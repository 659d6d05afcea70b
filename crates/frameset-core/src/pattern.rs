//! File selection patterns.
//!
//! Grammar, applied to `/`-separated relative paths:
//!
//! * `*` matches any run of characters inside one segment (possibly empty)
//! * `?` matches exactly one character inside one segment
//! * `**` as a whole segment matches zero or more segments
//! * every other character matches itself
//!
//! Patterns are always relative: a leading `/`, a `..` segment or an empty
//! pattern is rejected at parse time.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    AnyDepth,
    Glob(Vec<Token>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("pattern must not be empty"));
        }
        if trimmed.starts_with('/') || trimmed.starts_with('\\') {
            return Err(anyhow!("pattern must be relative: {raw}"));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('/') {
            match part {
                "" | "." => continue,
                ".." => return Err(anyhow!("pattern must not contain '..': {raw}")),
                "**" => {
                    // consecutive `**` segments are equivalent to one
                    if segments.last() != Some(&Segment::AnyDepth) {
                        segments.push(Segment::AnyDepth);
                    }
                }
                glob => segments.push(Segment::Glob(tokenize(glob))),
            }
        }
        if segments.is_empty() {
            return Err(anyhow!("pattern selects nothing: {raw}"));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Matches a relative path; platform separators are normalized to `/`.
    pub fn matches(&self, rel_path: &Path) -> bool {
        let parts = path_segments(rel_path);
        let parts = parts.iter().map(String::as_str).collect::<Vec<_>>();
        match_segments(&self.segments, &parts)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self> {
        let patterns = raw
            .iter()
            .map(|value| Pattern::parse(value.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, rel_path: &Path) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(rel_path))
    }
}

/// Lists regular files below `root` whose relative path matches `patterns`,
/// sorted by relative path. Symlinks are not followed.
pub fn select_files(root: &Path, patterns: &PatternSet) -> Result<Vec<PathBuf>> {
    let mut selected = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("failed to walk source directory: {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("walked outside of {}", root.display()))?;
        if patterns.matches(rel) {
            selected.push(rel.to_path_buf());
        }
    }
    selected.sort();
    Ok(selected)
}

fn path_segments(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn tokenize(glob: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for ch in glob.chars() {
        let token = match ch {
            '*' => Token::AnyRun,
            '?' => Token::AnyChar,
            other => Token::Literal(other),
        };
        if token == Token::AnyRun && tokens.last() == Some(&Token::AnyRun) {
            continue;
        }
        tokens.push(token);
    }
    tokens
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::AnyDepth, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((Segment::Glob(tokens), rest)) => match parts.split_first() {
            Some((first, remaining)) => {
                let chars = first.chars().collect::<Vec<_>>();
                match_tokens(tokens, &chars) && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}

fn match_tokens(tokens: &[Token], chars: &[char]) -> bool {
    match tokens.split_first() {
        None => chars.is_empty(),
        Some((Token::AnyRun, rest)) => (0..=chars.len()).any(|skip| match_tokens(rest, &chars[skip..])),
        Some((Token::AnyChar, rest)) => !chars.is_empty() && match_tokens(rest, &chars[1..]),
        Some((Token::Literal(expected), rest)) => {
            chars.first() == Some(expected) && match_tokens(rest, &chars[1..])
        }
    }
}
