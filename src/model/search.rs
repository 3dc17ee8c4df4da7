//! Search options and per-line matching.
//!
//! Queries compile to one [`Regex`]. Literal queries are escaped first, and
//! matching ignores case unless asked not to.

use crate::error::Result;
use regex::{Regex, RegexBuilder};
use std::ops::Range;

/// How a query is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchOptions {
    /// Off by default, so `foo` also finds `FOO`
    pub case_sensitive: bool,
    /// Treat the query as a regular expression. In replacements `$1`-style
    /// references then expand to capture groups.
    pub regex: bool,
    /// Only match whole words
    pub whole_word: bool,
    /// Stop after this many matches
    pub max_matches: Option<usize>,
}

impl SearchOptions {
    /// Exact literal matching
    pub fn literal() -> Self {
        Self {
            case_sensitive: true,
            ..Self::default()
        }
    }

    pub fn regex() -> Self {
        Self {
            regex: true,
            case_sensitive: true,
            ..Self::default()
        }
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn whole_word(mut self, whole_word: bool) -> Self {
        self.whole_word = whole_word;
        self
    }

    pub fn max_matches(mut self, max_matches: usize) -> Self {
        self.max_matches = Some(max_matches);
        self
    }

    /// Compile `query`. An empty query matches nothing and gives `None`.
    pub fn compile(&self, query: &str) -> Result<Option<Regex>> {
        if query.is_empty() {
            return Ok(None);
        }
        let pattern = if self.regex {
            query.to_string()
        } else {
            regex::escape(query)
        };
        let pattern = if self.whole_word {
            format!(r"\b(?:{})\b", pattern)
        } else {
            pattern
        };
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(!self.case_sensitive)
            .build()?;
        Ok(Some(regex))
    }
}

/// One match, located by line and character columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub line: usize,
    pub columns: Range<usize>,
}

/// Turns increasing byte offsets of one line into character columns
pub(crate) struct CharColumns<'a> {
    text: &'a str,
    byte: usize,
    column: usize,
}

impl<'a> CharColumns<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            column: 0,
        }
    }

    /// Column of byte offset `byte`. Offsets must not decrease between
    /// calls and must fall on character boundaries.
    pub(crate) fn column(&mut self, byte: usize) -> usize {
        if byte > self.byte {
            self.column += self.text[self.byte..byte].chars().count();
            self.byte = byte;
        }
        self.column
    }

    pub(crate) fn range(&mut self, bytes: Range<usize>) -> Range<usize> {
        let start = self.column(bytes.start);
        let end = self.column(bytes.end);
        start..end
    }
}

/// Matches of `pattern` on `text` as character columns, at most `limit`
pub(crate) fn line_matches(pattern: &Regex, text: &str, limit: usize) -> Vec<Range<usize>> {
    let mut columns = CharColumns::new(text);
    pattern
        .find_iter(text)
        .take(limit)
        .map(|found| columns.range(found.range()))
        .collect()
}
