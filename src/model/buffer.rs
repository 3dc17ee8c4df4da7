//! Virtual buffer over a file of any size.
//!
//! # Design
//! - **Opens instantly**: the file is memory mapped and lines are indexed on
//!   a background worker. Lines the index has not reached read as
//!   [`Line::Pending`].
//! - **Sparse edits**: edits go into a rope covering only the lines that
//!   were touched; everything else is decoded from the mapping on demand.
//! - **One owner**: all edits, undo and syntax updates run on the thread
//!   that owns the buffer. The index worker never touches any of them.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::backing_store::BackingStore;
use crate::model::document::{Document, Line};
use crate::model::encoding::{detect_encoding_with_ratio, Encoding};
use crate::model::history::{Command, UndoRedoManager};
use crate::model::line_index::{IndexFinished, IndexProgress, LineEndingMode, LineIndex};
use crate::model::search::{line_matches, CharColumns, SearchMatch, SearchOptions};
use crate::primitives::highlighter::SyntaxStateEngine;
use crate::primitives::lexer::{LanguageSpec, PatternLexer, Token};
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Lines handled per [`ReplaceAll::step`] when the caller does not choose
pub const DEFAULT_REPLACE_CHUNK_LINES: usize = 1000;

/// Whether an edit goes on the undo stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Record {
    #[default]
    Undoable,
    /// Apply without recording, e.g. for edits replayed from elsewhere
    Skip,
}

/// Lines an edit touches, measured before it is applied
struct LineChange {
    first: usize,
    removed: usize,
    lines_before: usize,
}

pub struct VirtualBuffer {
    doc: Document,
    history: UndoRedoManager,
    syntax: SyntaxStateEngine,
    language: &'static LanguageSpec,
}

impl VirtualBuffer {
    /// Open `path` with the default configuration
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, &EngineConfig::default())
    }

    /// Map `path` and start indexing it in the background
    pub fn open_with_config(path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let store = Arc::new(BackingStore::open(path)?);
        let encoding = detect(&store, config);
        let index = LineIndex::spawn(store.clone(), encoding, &config.index)?;
        tracing::debug!(
            "opened {} ({} bytes, {})",
            path.display(),
            store.len(),
            encoding
        );
        Self::assemble(store, encoding, index, config, Some(path))
    }

    /// Buffer over bytes already in memory. Indexing happens right away on
    /// the calling thread.
    pub fn from_bytes(bytes: Vec<u8>, config: &EngineConfig) -> Result<Self> {
        let store = Arc::new(BackingStore::from_bytes(bytes));
        let encoding = detect(&store, config);
        let index = LineIndex::build(&store, encoding, &config.index);
        Self::assemble(store, encoding, index, config, None)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Self::from_bytes(text.as_bytes().to_vec(), &EngineConfig::default())
    }

    fn assemble(
        store: Arc<BackingStore>,
        encoding: Encoding,
        index: LineIndex,
        config: &EngineConfig,
        path: Option<&Path>,
    ) -> Result<Self> {
        let language = resolve_language(config, path);
        let lexer = PatternLexer::new(language)?;

        let mut history = UndoRedoManager::new(config.undo.max_history);
        history.set_merge_window(config.undo.merge_window());

        Ok(Self {
            doc: Document::new(store, encoding, index, &config.rope),
            history,
            syntax: SyntaxStateEngine::new(Box::new(lexer), config.syntax.token_cache_size),
            language,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.doc.store().path()
    }

    pub fn encoding(&self) -> Encoding {
        self.doc.encoding()
    }

    pub fn line_ending_mode(&self) -> LineEndingMode {
        self.doc.line_ending_mode()
    }

    pub fn language(&self) -> &'static LanguageSpec {
        self.language
    }

    /// Switch the syntax preset. Highlighting restarts from the top.
    pub fn set_language(&mut self, language: &'static LanguageSpec) -> Result<()> {
        let lexer = PatternLexer::new(language)?;
        self.syntax.set_lexer(Box::new(lexer));
        self.language = language;
        Ok(())
    }

    // Line access

    /// Number of lines known so far. While indexing, the last one is
    /// still pending.
    pub fn line_count(&self) -> usize {
        self.doc.line_count()
    }

    pub fn get_line(&self, n: usize) -> Result<Line> {
        self.doc.line(n)
    }

    /// Total length in characters. Needs the finished index.
    pub fn len_chars(&self) -> Result<usize> {
        self.doc.len_chars()
    }

    /// Character position of `column` (in characters) on `line`
    pub fn position_of(&self, line: usize, column: usize) -> Result<usize> {
        let Some(text) = self.doc.line(line)?.into_text() else {
            return Err(EngineError::Pending { line });
        };
        let len = text.chars().count();
        if column > len {
            return Err(EngineError::out_of_range(column, len));
        }
        Ok(self.doc.line_start(line)? + column)
    }

    /// Line containing character position `pos`
    pub fn line_of_char(&self, pos: usize) -> Result<usize> {
        self.doc.line_of_char(pos)
    }

    /// Text from (`start_line`, `start_col`) up to (`end_line`, `end_col`),
    /// columns in characters. Line breaks are kept as stored.
    pub fn text_range(
        &self,
        start_line: usize,
        start_col: usize,
        end_line: usize,
        end_col: usize,
    ) -> Result<String> {
        let start = self.position_of(start_line, start_col)?;
        let end = self.position_of(end_line, end_col)?;
        self.doc.text_range(start, end)
    }

    /// Full current text as UTF-8. Needs the finished index.
    pub fn contents(&self) -> Result<String> {
        self.doc.contents()
    }

    /// Stream the current text as UTF-8 for an external save routine
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        self.doc.write_to(writer)
    }

    // Editing

    pub fn insert(&mut self, pos: usize, text: &str) -> Result<()> {
        self.insert_with(pos, text, Record::Undoable)
    }

    pub fn insert_with(&mut self, pos: usize, text: &str, record: Record) -> Result<()> {
        let change = self.begin_change(pos, pos)?;
        self.doc.insert(pos, text)?;
        self.finish_change(change);
        if record == Record::Undoable {
            self.history.record(Command::insert(pos, text));
        }
        Ok(())
    }

    /// Remove `length` characters at `pos`, returning them
    pub fn delete(&mut self, pos: usize, length: usize) -> Result<String> {
        self.delete_with(pos, length, Record::Undoable)
    }

    pub fn delete_with(&mut self, pos: usize, length: usize, record: Record) -> Result<String> {
        let end = pos
            .checked_add(length)
            .ok_or_else(|| EngineError::out_of_range(usize::MAX, pos))?;
        let change = self.begin_change(pos, end)?;
        let removed = self.doc.delete(pos, length)?;
        self.finish_change(change);
        if record == Record::Undoable {
            self.history.record(Command::delete(pos, removed.clone()));
        }
        Ok(removed)
    }

    /// Replace `length` characters at `pos` with `text` as one undo step.
    /// Returns the replaced text.
    pub fn replace_range(&mut self, pos: usize, length: usize, text: &str) -> Result<String> {
        self.history.begin_batch();
        let result = self
            .delete(pos, length)
            .and_then(|removed| self.insert(pos, text).map(|()| removed));
        match result {
            Ok(removed) => {
                self.history.end_batch();
                Ok(removed)
            }
            Err(e) => {
                self.rollback_batch();
                Err(e)
            }
        }
    }

    // Search

    /// Every match of `query`, line by line. Lines the index has not
    /// reached yet are not searched.
    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchMatch>> {
        let Some(pattern) = options.compile(query)? else {
            return Ok(Vec::new());
        };
        let limit = options.max_matches.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        for line in 0..self.doc.line_count() {
            if found.len() >= limit {
                break;
            }
            let Some(text) = self.doc.line(line)?.into_text() else {
                break;
            };
            found.extend(
                line_matches(&pattern, &text, limit - found.len())
                    .into_iter()
                    .map(|columns| SearchMatch { line, columns }),
            );
        }
        tracing::debug!("search for {:?} found {} matches", query, found.len());
        Ok(found)
    }

    /// Replace every match of `query` with `replacement` as one undo step.
    /// Returns the number of replacements.
    pub fn replace_all(
        &mut self,
        query: &str,
        replacement: &str,
        options: &SearchOptions,
    ) -> Result<usize> {
        self.start_replace_all(query, replacement, options, DEFAULT_REPLACE_CHUNK_LINES)?
            .finish()
    }

    /// Begin a replace-all that rewrites `lines_per_chunk` lines per
    /// [`ReplaceAll::step`]. Needs the finished index.
    pub fn start_replace_all(
        &mut self,
        query: &str,
        replacement: &str,
        options: &SearchOptions,
        lines_per_chunk: usize,
    ) -> Result<ReplaceAll<'_>> {
        let pattern = options.compile(query)?;
        if !self.doc.is_complete() {
            return Err(EngineError::Pending {
                line: self.doc.line_count().saturating_sub(1),
            });
        }
        self.history.begin_batch();
        Ok(ReplaceAll {
            buffer: self,
            pattern,
            replacement: replacement.to_string(),
            expand: options.regex,
            remaining: options.max_matches,
            lines_per_chunk: lines_per_chunk.max(1),
            next_line: 0,
            replaced: 0,
            chunks: 0,
            open: true,
        })
    }

    fn replace_in_line(
        &mut self,
        line: usize,
        pattern: &Regex,
        replacement: &str,
        expand: bool,
        limit: Option<usize>,
    ) -> Result<usize> {
        let Some(text) = self.doc.line(line)?.into_text() else {
            return Err(EngineError::Pending { line });
        };

        let mut columns = CharColumns::new(&text);
        let mut matches = Vec::new();
        for caps in pattern.captures_iter(&text).take(limit.unwrap_or(usize::MAX)) {
            let Some(found) = caps.get(0) else {
                continue;
            };
            let mut with = String::new();
            if expand {
                caps.expand(replacement, &mut with);
            } else {
                with.push_str(replacement);
            }
            matches.push((columns.range(found.range()), with));
        }
        if matches.is_empty() {
            return Ok(0);
        }

        let line_start = self.doc.line_start(line)?;
        // Right to left so earlier positions stay valid
        for (columns, with) in matches.iter().rev() {
            self.replace_range(line_start + columns.start, columns.len(), with)?;
        }
        Ok(matches.len())
    }

    // Undo

    pub fn undo(&mut self) -> Result<bool> {
        self.close_batches();
        let start = self.history.peek_undo().and_then(Command::start);
        let undone = self.history.undo(&mut self.doc)?;
        if undone {
            self.doc.release_unchanged();
            self.invalidate_syntax_at(start);
        }
        Ok(undone)
    }

    pub fn redo(&mut self) -> Result<bool> {
        self.close_batches();
        let start = self.history.peek_redo().and_then(Command::start);
        let redone = self.history.redo(&mut self.doc)?;
        if redone {
            self.doc.release_unchanged();
            self.invalidate_syntax_at(start);
        }
        Ok(redone)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn is_modified(&self) -> bool {
        self.history.is_modified()
    }

    /// Mark the current state as saved
    pub fn mark_saved(&mut self) {
        self.history.mark_saved();
    }

    pub fn begin_batch(&mut self) {
        self.history.begin_batch();
    }

    pub fn end_batch(&mut self) {
        self.history.end_batch();
    }

    /// Drop the innermost batch and revert the edits made inside it
    pub fn cancel_batch(&mut self) -> Result<()> {
        if let Some(batch) = self.history.cancel_batch() {
            batch.inverse().apply(&mut self.doc)?;
            self.doc.release_unchanged();
            self.invalidate_syntax_at(batch.start());
        }
        Ok(())
    }

    pub fn history(&self) -> &UndoRedoManager {
        &self.history
    }

    // Indexing

    pub fn is_index_finished(&self) -> bool {
        self.doc.is_complete()
    }

    pub fn index_progress(&self) -> IndexProgress {
        self.doc.index().progress()
    }

    /// Failure reported by the index worker, if any
    pub fn index_error(&self) -> Option<&str> {
        self.doc.index().error()
    }

    pub fn on_index_progress(&mut self, observer: impl FnMut(&IndexProgress) + Send + 'static) {
        self.doc.index_mut().on_progress(observer);
    }

    pub fn on_index_finished(&mut self, observer: impl FnMut(&IndexFinished) + Send + 'static) {
        self.doc.index_mut().on_finished(observer);
    }

    /// Apply everything the index worker produced so far and run the
    /// observers. Returns the number of events applied.
    pub fn process_index_events(&mut self) -> usize {
        self.doc.index_mut().poll()
    }

    /// Block until indexing finishes or `timeout` passes. Returns whether
    /// the index is finished.
    pub fn wait_for_index(&mut self, timeout: Option<Duration>) -> bool {
        self.doc.index_mut().wait(timeout)
    }

    // Syntax

    /// Tokens of line `n`, computing syntax states up to it if needed
    pub fn highlight_tokens(&mut self, n: usize) -> Result<Vec<Token>> {
        if self.doc.line(n)?.is_pending() {
            return Err(EngineError::Pending { line: n });
        }
        self.syntax
            .tokens(n, &self.doc)
            .ok_or(EngineError::Pending { line: n })
    }

    pub fn syntax(&self) -> &SyntaxStateEngine {
        &self.syntax
    }

    /// Stop the index worker and release the file
    pub fn close(self) {
        if let Some(path) = self.path() {
            tracing::debug!("closing {}", path.display());
        }
        self.doc.close();
    }

    fn begin_change(&self, from: usize, to: usize) -> Result<LineChange> {
        if self.doc.is_complete() {
            let len = self.doc.len_chars()?;
            if to > len {
                return Err(EngineError::out_of_range(to, len));
            }
        }
        let first = self.doc.line_of_char(from)?;
        let last = if to == from {
            first
        } else {
            self.doc.line_of_char(to)?
        };
        Ok(LineChange {
            first,
            removed: last - first + 1,
            lines_before: self.doc.line_count(),
        })
    }

    fn finish_change(&mut self, change: LineChange) {
        let inserted = (change.removed + self.doc.line_count()).saturating_sub(change.lines_before);
        let changed = self
            .syntax
            .on_lines_changed(change.first, change.removed, inserted, &self.doc);
        tracing::trace!("highlighting changed for lines {:?}", changed);
    }

    fn invalidate_syntax_at(&mut self, pos: Option<usize>) {
        let line = pos
            .and_then(|pos| self.doc.line_of_char(pos).ok())
            .unwrap_or(0);
        self.syntax.invalidate_from(line);
    }

    fn close_batches(&mut self) {
        while self.history.in_batch() {
            self.history.end_batch();
        }
    }

    fn rollback_batch(&mut self) {
        if let Some(batch) = self.history.cancel_batch() {
            if let Err(e) = batch.inverse().apply(&mut self.doc) {
                tracing::warn!("failed to roll back batch: {}", e);
            }
            self.doc.release_unchanged();
            self.invalidate_syntax_at(batch.start());
        }
    }
}

impl std::fmt::Debug for VirtualBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualBuffer")
            .field("document", &self.doc)
            .field("language", &self.language.name)
            .field("undo", &self.history.undo_count())
            .finish()
    }
}

/// Replace-all in progress.
///
/// Each [`step`](Self::step) rewrites up to `lines_per_chunk` lines and
/// hands control back, so a caller can keep its own loop responsive. All
/// replacements form one undo batch: [`cancel`](Self::cancel) reverts them
/// and [`finish`](Self::finish) or dropping the job commits them.
pub struct ReplaceAll<'a> {
    buffer: &'a mut VirtualBuffer,
    pattern: Option<Regex>,
    replacement: String,
    expand: bool,
    remaining: Option<usize>,
    lines_per_chunk: usize,
    next_line: usize,
    replaced: usize,
    chunks: usize,
    /// The undo batch is still open
    open: bool,
}

impl ReplaceAll<'_> {
    /// Replacements made so far
    pub fn replaced(&self) -> usize {
        self.replaced
    }

    /// First line the next step looks at
    pub fn next_line(&self) -> usize {
        self.next_line
    }

    pub fn is_done(&self) -> bool {
        !self.open
            || self.pattern.is_none()
            || self.remaining == Some(0)
            || self.next_line >= self.buffer.doc.line_count()
    }

    /// Rewrite the next chunk of lines. Returns whether work remains. On
    /// error everything replaced so far is reverted.
    pub fn step(&mut self) -> Result<bool> {
        if self.is_done() {
            return Ok(false);
        }
        let Some(pattern) = &self.pattern else {
            return Ok(false);
        };

        let mut processed = 0;
        while processed < self.lines_per_chunk
            && self.remaining != Some(0)
            && self.next_line < self.buffer.doc.line_count()
        {
            let before = self.buffer.doc.line_count();
            let replaced = match self.buffer.replace_in_line(
                self.next_line,
                pattern,
                &self.replacement,
                self.expand,
                self.remaining,
            ) {
                Ok(replaced) => replaced,
                Err(e) => {
                    self.open = false;
                    self.buffer.rollback_batch();
                    return Err(e);
                }
            };
            self.replaced += replaced;
            if let Some(remaining) = &mut self.remaining {
                *remaining -= replaced;
            }
            // Replacements may contain line breaks; skip the lines they added
            self.next_line += 1 + self.buffer.doc.line_count().saturating_sub(before);
            processed += 1;
        }

        self.chunks += 1;
        tracing::trace!("replace chunk {} done, next line {}", self.chunks, self.next_line);
        Ok(!self.is_done())
    }

    /// Run the remaining chunks and commit. Returns the number of
    /// replacements.
    pub fn finish(mut self) -> Result<usize> {
        while self.step()? {}
        self.commit();
        Ok(self.replaced)
    }

    /// Stop and revert every replacement made so far
    pub fn cancel(mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        tracing::debug!("replace cancelled after {} replacements", self.replaced);
        self.buffer.cancel_batch()
    }

    fn commit(&mut self) {
        if self.open {
            self.open = false;
            self.buffer.history.end_batch();
            tracing::debug!("replaced {} occurrences", self.replaced);
        }
    }
}

impl Drop for ReplaceAll<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

impl std::fmt::Debug for ReplaceAll<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaceAll")
            .field("next_line", &self.next_line)
            .field("replaced", &self.replaced)
            .field("open", &self.open)
            .finish()
    }
}

fn detect(store: &BackingStore, config: &EngineConfig) -> Encoding {
    let bytes = store.bytes();
    let sample = &bytes[..bytes.len().min(config.encoding.sample_size)];
    detect_encoding_with_ratio(sample, config.encoding.utf16_null_ratio)
}

fn resolve_language(config: &EngineConfig, path: Option<&Path>) -> &'static LanguageSpec {
    if let Some(name) = &config.syntax.language {
        match LanguageSpec::from_name(name) {
            Some(spec) => return spec,
            None => tracing::warn!("unknown language {:?}, detecting from path", name),
        }
    }
    path.map_or(&LanguageSpec::GENERIC, LanguageSpec::from_path)
}
