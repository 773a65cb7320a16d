//! Shell-style glob patterns over event identifiers.
//!
//! Semantics follow `fnmatch` in case-sensitive mode: `*` matches any run of
//! characters (including `:`), `?` matches one character, `[abc]` / `[!abc]`
//! match a character class. A pattern without wildcards is an exact match.
//! Patterns are translated to anchored regular expressions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::error::ValidationError;

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();

fn cached_regex(source: &str, pattern: &str) -> Result<Regex, ValidationError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(source) {
            return Ok(re.clone());
        }
    }

    let compiled = Regex::new(source).map_err(|e| ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    // A poisoned cache only costs a recompile next time.
    if let Ok(mut guard) = cache.write() {
        if guard.len() >= REGEX_CACHE_MAX {
            guard.clear();
        }
        guard
            .entry(source.to_string())
            .or_insert_with(|| compiled.clone());
    }
    Ok(compiled)
}

/// A compiled glob pattern.
#[derive(Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compiles `pattern`.
    pub fn new(pattern: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = pattern.into();
        if raw.is_empty() {
            return Err(ValidationError::InvalidPattern {
                pattern: raw,
                reason: "pattern cannot be empty".to_string(),
            });
        }
        let regex = cached_regex(&translate(&raw), &raw)?;
        Ok(Self { raw, regex })
    }

    /// True if `id` matches the whole pattern.
    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        self.regex.is_match(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobPattern").field(&self.raw).finish()
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let n = chars.len();
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("^(?s:");

    let mut i = 0;
    while i < n {
        let c = chars[i];
        i += 1;
        match c {
            '*' => {
                while i < n && chars[i] == '*' {
                    i += 1;
                }
                out.push_str(".*");
            }
            '?' => out.push('.'),
            '[' => {
                let mut j = i;
                if j < n && chars[j] == '!' {
                    j += 1;
                }
                if j < n && chars[j] == ']' {
                    j += 1;
                }
                while j < n && chars[j] != ']' {
                    j += 1;
                }
                if j >= n {
                    out.push_str("\\[");
                    continue;
                }
                let class: Vec<char> = chars[i..j].to_vec();
                i = j + 1;
                out.push('[');
                for (k, ch) in class.iter().enumerate() {
                    match ch {
                        '!' if k == 0 => out.push('^'),
                        '^' if k == 0 => out.push_str("\\^"),
                        '\\' | '[' | ']' | '&' | '~' => {
                            out.push('\\');
                            out.push(*ch);
                        }
                        other => out.push(*other),
                    }
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }

    out.push_str(")$");
    out
}
