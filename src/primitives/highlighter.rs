//! Per-line syntax state tracking
//!
//! # Design
//! - **Exit-state prefix**: the engine remembers the state each line ends in,
//!   for a contiguous prefix of the document. Entry state of line `n` is the
//!   exit state of line `n - 1`.
//! - **Lazy**: states are only computed up to the line being asked for, so
//!   opening a huge file costs nothing until a line is highlighted.
//! - **Forward propagation**: after an edit, lines are re-lexed from the edit
//!   onward until a line's exit state matches what it was before.
//! - **Token cache**: tokens are keyed by (line content, entry state), so
//!   identical lines entered in the same state are lexed once.

use crate::primitives::lexer::{LexState, Lexer, LineTokens, Token};
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::ops::Range;

/// Default capacity of the token cache
pub const DEFAULT_TOKEN_CACHE_SIZE: usize = 5000;

/// Where the engine reads line text from
pub trait LineSource {
    fn line_count(&self) -> usize;

    /// Text of `line` without its terminator, `None` if it is not available
    /// (out of range or not indexed yet)
    fn line_text(&self, line: usize) -> Option<String>;
}

impl LineSource for [String] {
    fn line_count(&self) -> usize {
        self.len()
    }

    fn line_text(&self, line: usize) -> Option<String> {
        self.get(line).cloned()
    }
}

impl LineSource for Vec<String> {
    fn line_count(&self) -> usize {
        self.len()
    }

    fn line_text(&self, line: usize) -> Option<String> {
        self.get(line).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    content: u64,
    entry: LexState,
}

impl CacheKey {
    fn new(text: &str, entry: LexState) -> Self {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        Self {
            content: hasher.finish(),
            entry,
        }
    }
}

pub struct SyntaxStateEngine {
    lexer: Box<dyn Lexer>,
    /// Exit state of lines `0..exit_states.len()`
    exit_states: Vec<LexState>,
    cache: LruCache<CacheKey, LineTokens>,
}

impl SyntaxStateEngine {
    pub fn new(lexer: Box<dyn Lexer>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            lexer,
            exit_states: Vec::new(),
            cache: LruCache::new(capacity),
        }
    }

    /// Swap the lexer; every computed state and cached token is dropped
    pub fn set_lexer(&mut self, lexer: Box<dyn Lexer>) {
        self.lexer = lexer;
        self.clear();
    }

    pub fn clear(&mut self) {
        self.exit_states.clear();
        self.cache.clear();
    }

    /// Number of lines whose exit state is known
    pub fn known_lines(&self) -> usize {
        self.exit_states.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// State `line` starts in, if known
    pub fn entry_state(&self, line: usize) -> Option<LexState> {
        match line {
            0 => Some(LexState::Normal),
            n => self.exit_states.get(n - 1).copied(),
        }
    }

    /// State `line` ends in, if known
    pub fn exit_state(&self, line: usize) -> Option<LexState> {
        self.exit_states.get(line).copied()
    }

    /// Forget states from `line` onward
    pub fn invalidate_from(&mut self, line: usize) {
        self.exit_states.truncate(line);
    }

    /// Tokens of `line`. `None` when the line, or a line before it whose
    /// state is still unknown, cannot be read from `source`.
    pub fn tokens<S: LineSource + ?Sized>(&mut self, line: usize, source: &S) -> Option<Vec<Token>> {
        if line >= source.line_count() || !self.ensure_states(line, source) {
            return None;
        }
        let text = source.line_text(line)?;
        let entry = self.entry_state(line)?;
        let lexed = self.lex(&text, entry);
        if self.exit_states.len() == line {
            self.exit_states.push(lexed.exit);
        }
        Some(lexed.tokens)
    }

    /// Update states after lines `first..first + removed` were replaced by
    /// `inserted` lines (numbered from `first` in `source`).
    ///
    /// Returns the lines whose tokens may differ from before the change.
    pub fn on_lines_changed<S: LineSource + ?Sized>(
        &mut self,
        first: usize,
        removed: usize,
        inserted: usize,
        source: &S,
    ) -> Range<usize> {
        let known = self.exit_states.len();
        if first >= known {
            // Nothing computed at or past the edit
            return first..first + inserted;
        }

        let old_boundary = if removed == 0 {
            self.entry_state(first)
        } else {
            self.exit_state(first + removed - 1)
        };
        let tail = if first + removed < known {
            self.exit_states.split_off(first + removed)
        } else {
            Vec::new()
        };
        self.exit_states.truncate(first);

        for line in first..first + inserted {
            let Some(text) = source.line_text(line) else {
                return first..first + inserted;
            };
            let entry = self.entry_state(line).unwrap_or_default();
            let exit = self.lex(&text, entry).exit;
            self.exit_states.push(exit);
        }

        let mut end = first + inserted;
        if old_boundary.is_some() && self.entry_state(end) == old_boundary {
            self.exit_states.extend(tail);
            return first..end;
        }

        let mut previous = tail.into_iter();
        while let Some(old_exit) = previous.next() {
            let Some(text) = source.line_text(end) else {
                break;
            };
            let entry = self.entry_state(end).unwrap_or_default();
            let exit = self.lex(&text, entry).exit;
            self.exit_states.push(exit);
            end += 1;
            if exit == old_exit {
                self.exit_states.extend(previous.by_ref());
                break;
            }
        }

        tracing::trace!(
            "syntax states changed for lines {}..{} ({} known)",
            first,
            end,
            self.exit_states.len()
        );
        first..end
    }

    fn ensure_states<S: LineSource + ?Sized>(&mut self, upto: usize, source: &S) -> bool {
        while self.exit_states.len() < upto {
            let line = self.exit_states.len();
            let Some(text) = source.line_text(line) else {
                return false;
            };
            let entry = self.entry_state(line).unwrap_or_default();
            let exit = self.lex(&text, entry).exit;
            self.exit_states.push(exit);
        }
        true
    }

    fn lex(&mut self, text: &str, entry: LexState) -> LineTokens {
        let key = CacheKey::new(text, entry);
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }
        let lexed = self.lexer.tokenize_line(text, entry);
        self.cache.put(key, lexed.clone());
        lexed
    }
}

impl std::fmt::Debug for SyntaxStateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntaxStateEngine")
            .field("known_lines", &self.exit_states.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}
