// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Metadata corrections applied before an identity is computed.
//!
//! Some applications report a different binary or name from launch to launch
//! (versioned paths, wrapper scripts, sandbox launchers). A quirk rule matches
//! such a stream by name and/or binary and rewrites it to one canonical pair
//! so every launch lands on the same identity.

use crate::identity::StreamMetadata;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QuirksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// How a quirk pattern is compared against a metadata value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "pattern")]
pub enum MatchType {
    /// Pattern must be contained in the value (case-insensitive).
    Contains(String),
    /// Pattern must equal the value (case-insensitive).
    Exact(String),
    /// Pattern is a regular expression.
    Regex(String),
    /// Pattern is a glob pattern (*, ?, [abc]), case-insensitive.
    Glob(String),
}

impl MatchType {
    pub fn pattern(&self) -> &str {
        match self {
            MatchType::Contains(p) => p,
            MatchType::Exact(p) => p,
            MatchType::Regex(p) => p,
            MatchType::Glob(p) => p,
        }
    }

    fn compile(&self) -> Result<Matcher, QuirksError> {
        Ok(match self {
            MatchType::Contains(p) => Matcher::Contains(p.to_lowercase()),
            MatchType::Exact(p) => Matcher::Exact(p.clone()),
            MatchType::Regex(p) => Matcher::Regex(Regex::new(p).map_err(|source| {
                QuirksError::InvalidRegex {
                    pattern: p.clone(),
                    source,
                }
            })?),
            MatchType::Glob(p) => Matcher::Glob(p.to_lowercase().chars().collect()),
        })
    }
}

/// A pattern ready for matching.
#[derive(Debug)]
enum Matcher {
    Contains(String),
    Exact(String),
    Regex(Regex),
    Glob(Vec<char>),
}

impl Matcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Contains(p) => value.to_lowercase().contains(p.as_str()),
            Matcher::Exact(p) => value.eq_ignore_ascii_case(p),
            Matcher::Regex(re) => re.is_match(value),
            Matcher::Glob(p) => {
                let value: Vec<char> = value.to_lowercase().chars().collect();
                glob_match(p, &value)
            }
        }
    }
}

/// One correction rule as written in `quirks.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuirkRule {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub match_name: Option<MatchType>,
    #[serde(default)]
    pub match_binary: Option<MatchType>,
    /// Canonical name; `None` keeps the reported one.
    #[serde(default)]
    pub name: Option<String>,
    /// Canonical binary; `None` keeps the reported one.
    #[serde(default)]
    pub binary: Option<String>,
}

impl QuirkRule {
    /// Short human-readable name: the description, or the patterns.
    pub fn label(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        let patterns: Vec<String> = [("name", &self.match_name), ("binary", &self.match_binary)]
            .into_iter()
            .filter_map(|(field, m)| m.as_ref().map(|m| format!("{} ~ {}", field, m.pattern())))
            .collect();
        patterns.join(", ")
    }
}

#[derive(Debug, Default, Deserialize)]
struct QuirksFile {
    #[serde(default, rename = "quirk")]
    quirks: Vec<QuirkRule>,
}

#[derive(Debug)]
struct CompiledQuirk {
    rule: QuirkRule,
    name: Option<Matcher>,
    binary: Option<Matcher>,
}

impl CompiledQuirk {
    fn compile(rule: QuirkRule) -> Result<Self, QuirksError> {
        let name = rule.match_name.as_ref().map(MatchType::compile).transpose()?;
        let binary = rule.match_binary.as_ref().map(MatchType::compile).transpose()?;
        Ok(Self { rule, name, binary })
    }

    /// Every present pattern must match; a rule without patterns never does.
    fn matches(&self, meta: &StreamMetadata) -> bool {
        if self.name.is_none() && self.binary.is_none() {
            return false;
        }
        field_matches(self.name.as_ref(), meta.name.as_deref())
            && field_matches(self.binary.as_ref(), meta.binary.as_deref())
    }

    fn rewrite(&self, meta: &StreamMetadata) -> StreamMetadata {
        StreamMetadata {
            name: self.rule.name.clone().or_else(|| meta.name.clone()),
            binary: self.rule.binary.clone().or_else(|| meta.binary.clone()),
        }
    }
}

fn field_matches(matcher: Option<&Matcher>, value: Option<&str>) -> bool {
    match matcher {
        None => true,
        Some(m) => value.map(|v| m.matches(v)).unwrap_or(false),
    }
}

/// Ordered collection of quirk rules.
#[derive(Debug, Default)]
pub struct QuirksTable {
    quirks: Vec<CompiledQuirk>,
}

impl QuirksTable {
    /// Build a table, rejecting invalid regex patterns.
    pub fn new(rules: Vec<QuirkRule>) -> Result<Self, QuirksError> {
        let quirks = rules
            .into_iter()
            .map(CompiledQuirk::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { quirks })
    }

    pub fn from_toml(s: &str) -> Result<Self, QuirksError> {
        let file: QuirksFile = toml::from_str(s)?;
        Self::new(file.quirks)
    }

    /// Load from disk; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self, QuirksError> {
        if !path.exists() {
            debug!("No quirks file at {:?}, using none", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let table = Self::from_toml(&content)?;
        info!("Loaded {} quirks from {:?}", table.len(), path);
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.quirks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quirks.is_empty()
    }

    /// The rule that corrects `meta` first, if any.
    pub fn first_match(&self, meta: &StreamMetadata) -> Option<&QuirkRule> {
        self.first_step(meta).map(|(quirk, _)| &quirk.rule)
    }

    /// Correct metadata to its canonical form.
    ///
    /// Rules are applied until none of them changes the pair any more, so the
    /// result is itself a fixed point. Unmatched input comes back unchanged.
    pub fn correct(&self, meta: &StreamMetadata) -> StreamMetadata {
        let mut current = meta.clone();
        for _ in 0..=self.quirks.len() {
            match self.step(&current) {
                Some(next) => current = next,
                None => return current,
            }
        }
        warn!(
            "Quirks for '{}' do not settle, check quirks.toml for rules that undo each other",
            meta.display_name()
        );
        current
    }

    fn step(&self, meta: &StreamMetadata) -> Option<StreamMetadata> {
        self.first_step(meta).map(|(_, next)| next)
    }

    fn first_step(&self, meta: &StreamMetadata) -> Option<(&CompiledQuirk, StreamMetadata)> {
        self.quirks
            .iter()
            .filter(|q| q.matches(meta))
            .map(|q| (q, q.rewrite(meta)))
            .find(|(_, next)| next != meta)
    }
}

/// Glob matching over chars: `*` (any run), `?` (one char), `[abc]` / `[!abc]`.
fn glob_match(pattern: &[char], value: &[char]) -> bool {
    let Some((&pc, rest)) = pattern.split_first() else {
        return value.is_empty();
    };

    match pc {
        '*' => {
            let rest = trim_leading_stars(rest);
            if rest.is_empty() {
                return true;
            }
            (0..=value.len()).any(|i| glob_match(rest, &value[i..]))
        }
        '?' => match value.split_first() {
            Some((_, value_rest)) => glob_match(rest, value_rest),
            None => false,
        },
        '[' => {
            let Some((&vc, value_rest)) = value.split_first() else {
                return false;
            };
            let (negated, class) = match rest.first() {
                Some('!') | Some('^') => (true, &rest[1..]),
                _ => (false, rest),
            };
            let end = class.iter().position(|&c| c == ']').unwrap_or(class.len());
            let in_class = class[..end].contains(&vc);
            if in_class == negated {
                return false;
            }
            let after = if end < class.len() { &class[end + 1..] } else { &class[end..] };
            glob_match(after, value_rest)
        }
        c => match value.split_first() {
            Some((&vc, value_rest)) if vc == c => glob_match(rest, value_rest),
            _ => false,
        },
    }
}

fn trim_leading_stars(mut pattern: &[char]) -> &[char] {
    while let Some((&'*', rest)) = pattern.split_first() {
        pattern = rest;
    }
    pattern
}
