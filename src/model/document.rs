//! Current text of a buffer: original lines plus the edit overlay.
//!
//! Lines outside the overlay windows are decoded from the backing store on
//! demand. Character positions outside the windows are resolved with
//! a lazily built table of per-block character counts, so only the lines
//! between the last known block and the target are ever decoded.

use crate::config::RopeConfig;
use crate::error::{EngineError, Result};
use crate::model::backing_store::BackingStore;
use crate::model::encoding::{decode_lossy, Encoding};
use crate::model::history::EditTarget;
use crate::model::line_index::{LineEndingMode, LineIndex};
use crate::model::overlay::{CharLocation, EditOverlay, LineLocation, Window};
use crate::model::rope::Rope;
use crate::primitives::highlighter::LineSource;
use std::cell::RefCell;
use std::io::Write;
use std::ops::Range;
use std::sync::Arc;

/// Original lines per entry of the character count table
const CHAR_BLOCK_LINES: usize = 256;

/// A line as far as the index knows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Line text without its terminator
    Text(String),
    /// The background index has not reached this line yet
    Pending,
}

impl Line {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Pending => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Strip the terminator `mode` recognises from the end of `raw`
pub(crate) fn strip_terminator(raw: &str, mode: LineEndingMode) -> &str {
    match mode {
        LineEndingMode::Lf => raw.strip_suffix('\n').unwrap_or(raw),
        LineEndingMode::Any => raw
            .strip_suffix("\r\n")
            .or_else(|| raw.strip_suffix('\n'))
            .or_else(|| raw.strip_suffix('\r'))
            .unwrap_or(raw),
    }
}

pub struct Document {
    store: Arc<BackingStore>,
    encoding: Encoding,
    bom_len: u64,
    index: LineIndex,
    overlay: EditOverlay,
    /// Entry `b` is the number of characters in original lines
    /// `0..b * CHAR_BLOCK_LINES`
    char_prefix: RefCell<Vec<usize>>,
}

impl Document {
    pub fn new(store: Arc<BackingStore>, encoding: Encoding, index: LineIndex, rope: &RopeConfig) -> Self {
        let bom_len = encoding.bom_len(store.bytes()) as u64;
        let overlay = EditOverlay::new(rope.leaf_size, rope.merge_gap_lines, index.line_ending_mode());
        Self {
            store,
            encoding,
            bom_len,
            index,
            overlay,
            char_prefix: RefCell::new(vec![0]),
        }
    }

    pub fn store(&self) -> &Arc<BackingStore> {
        &self.store
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn index(&self) -> &LineIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut LineIndex {
        &mut self.index
    }

    pub fn overlay(&self) -> &EditOverlay {
        &self.overlay
    }

    pub fn line_ending_mode(&self) -> LineEndingMode {
        self.index.line_ending_mode()
    }

    pub fn is_complete(&self) -> bool {
        self.index.is_finished()
    }

    /// Number of lines known so far. While indexing, the last one is
    /// still pending.
    pub fn line_count(&self) -> usize {
        self.overlay.line_count(self.index.line_count(), self.eof())
    }

    /// Text of line `n`.
    ///
    /// Lines the index has not reached yet are [`Line::Pending`]; past the
    /// end of a fully indexed document this is an error.
    pub fn line(&self, n: usize) -> Result<Line> {
        let count = self.line_count();
        let finished = self.index.is_finished();
        if n >= count {
            return if finished {
                Err(EngineError::out_of_range(n, count))
            } else {
                Ok(Line::Pending)
            };
        }
        if !finished && n + 1 == count {
            return Ok(Line::Pending);
        }

        let text = match self.overlay.locate(n, self.eof()) {
            LineLocation::Original { line, .. } => self
                .original_raw(line)
                .map(|raw| strip_terminator(&raw, self.line_ending_mode()).to_string()),
            LineLocation::Edited { window, line, .. } => {
                self.overlay.window(window).and_then(|w| w.line_text(line))
            }
        };
        Ok(text.map_or(Line::Pending, Line::Text))
    }

    /// Total number of characters. Needs the finished index.
    pub fn len_chars(&self) -> Result<usize> {
        if !self.index.is_finished() {
            return Err(EngineError::Pending {
                line: self.line_count().saturating_sub(1),
            });
        }
        let original = self.prefix(self.index.line_count())?;
        Ok(self.overlay.len_chars(original))
    }

    /// Character position where line `n` starts
    pub fn line_start(&self, n: usize) -> Result<usize> {
        match self.overlay.locate(n, self.eof()) {
            LineLocation::Original { line, shift } => Ok(shift.char(self.prefix(line)?)),
            LineLocation::Edited { window, line, shift } => {
                let window = self.window(window)?;
                let offset = window
                    .line_start(line)
                    .ok_or(EngineError::Pending { line: n })?;
                Ok(shift.char(window.char_start()) + offset)
            }
        }
    }

    /// Line containing character position `pos`. The end of the document
    /// belongs to the last line.
    pub fn line_of_char(&self, pos: usize) -> Result<usize> {
        match self.overlay.locate_char(pos, self.eof()) {
            CharLocation::Original { pos, shift } => Ok(shift.line(self.original_line_at(pos)?)),
            CharLocation::Edited { window, offset, shift } => {
                let window = self.window(window)?;
                Ok(shift.line(window.start()) + window.breaks_before(offset))
            }
        }
    }

    /// Text between character positions `start` and `end`, line breaks
    /// included as stored
    pub fn text_range(&self, start: usize, end: usize) -> Result<String> {
        if start > end {
            return Err(EngineError::out_of_range(start, end));
        }
        let mut n = self.line_of_char(start)?;
        self.line_of_char(end)?;

        let mut out = String::new();
        let mut pos = self.line_start(n)?;
        while pos < end {
            let raw = self.raw_line(n)?;
            let len = raw.chars().count();
            if len == 0 {
                break;
            }
            let skip = start.saturating_sub(pos);
            let take = end.min(pos + len).saturating_sub(pos.max(start));
            out.extend(raw.chars().skip(skip).take(take));
            pos += len;
            n += 1;
        }
        Ok(out)
    }

    /// Insert `text` at character position `pos`
    pub fn insert(&mut self, pos: usize, text: &str) -> Result<()> {
        self.check_position(pos)?;
        if text.is_empty() {
            return Ok(());
        }
        let (window, at) = self.ensure_window(pos, pos)?;
        self.edit_window(window, |rope| rope.insert(at, text))?;

        if let Err(e) = self.normalize(window) {
            let length = text.chars().count();
            if let Err(revert) = self.edit_at(pos, |rope, at| rope.delete(at, length).map(drop)) {
                tracing::warn!("failed to revert insert at {}: {}", pos, revert);
            }
            return Err(e);
        }
        tracing::trace!("inserted {} chars at {}", text.chars().count(), pos);
        Ok(())
    }

    /// Remove `length` characters at `pos`, returning them
    pub fn delete(&mut self, pos: usize, length: usize) -> Result<String> {
        let end = pos
            .checked_add(length)
            .ok_or_else(|| EngineError::out_of_range(usize::MAX, pos))?;
        self.check_position(end)?;
        if length == 0 {
            return Ok(String::new());
        }
        let (window, at) = self.ensure_window(pos, end)?;
        let removed = self.edit_window(window, |rope| rope.delete(at, length))?;

        if let Err(e) = self.normalize(window) {
            if let Err(revert) = self.edit_at(pos, |rope, at| rope.insert(at, &removed)) {
                tracing::warn!("failed to revert delete at {}: {}", pos, revert);
            }
            return Err(e);
        }
        tracing::trace!("deleted {} chars at {}", length, pos);
        Ok(removed)
    }

    /// Drop every window whose text is back to the original, so those lines
    /// are read from the backing store again. Returns how many were dropped.
    pub fn release_unchanged(&mut self) -> usize {
        let unchanged: Vec<usize> = self
            .overlay
            .windows()
            .filter(|window| window.rope().len_chars() == window.original_chars())
            .filter(|window| {
                self.original_span(window.lines())
                    .is_ok_and(|text| window.rope().to_string() == text)
            })
            .map(|window| window.start())
            .collect();
        for start in &unchanged {
            self.overlay.remove(*start);
        }
        if !unchanged.is_empty() {
            tracing::debug!("released {} unchanged edit windows", unchanged.len());
        }
        unchanged.len()
    }

    /// Full current text. Needs the finished index.
    pub fn contents(&self) -> Result<String> {
        let mut out = String::new();
        self.for_each_segment(|segment| {
            out.push_str(segment);
            Ok(())
        })?;
        Ok(out)
    }

    /// Stream the current text as UTF-8. Needs the finished index.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = std::io::BufWriter::new(writer);
        self.for_each_segment(|segment| {
            writer
                .write_all(segment.as_bytes())
                .map_err(EngineError::Write)
        })?;
        writer.flush().map_err(EngineError::Write)
    }

    /// Stop indexing and release the backing store
    pub fn close(self) {
        let Document { store, mut index, .. } = self;
        index.cancel();
        drop(index);
        match Arc::try_unwrap(store) {
            Ok(store) => store.close(),
            Err(_) => tracing::debug!("backing store still shared at close"),
        }
    }

    /// Original line count once the index is finished
    fn eof(&self) -> Option<usize> {
        self.index
            .is_finished()
            .then(|| self.index.line_count())
    }

    fn window(&self, start: usize) -> Result<&Window> {
        self.overlay
            .window(start)
            .ok_or_else(|| EngineError::out_of_range(start, self.index.line_count()))
    }

    fn edit_window<T>(&mut self, start: usize, f: impl FnOnce(&mut Rope) -> Result<T>) -> Result<T> {
        match self.overlay.edit(start, f) {
            Some(result) => result,
            None => Err(EngineError::out_of_range(start, self.index.line_count())),
        }
    }

    /// Run `f` on the rope holding document position `pos`, with the rope
    /// offset of `pos`
    fn edit_at(&mut self, pos: usize, f: impl FnOnce(&mut Rope, usize) -> Result<()>) -> Result<()> {
        match self.overlay.locate_char(pos, self.eof()) {
            CharLocation::Edited { window, offset, .. } => {
                self.edit_window(window, |rope| f(rope, offset))
            }
            CharLocation::Original { pos, .. } => Err(EngineError::out_of_range(pos, 0)),
        }
    }

    fn check_position(&self, pos: usize) -> Result<()> {
        if self.index.is_finished() {
            let len = self.len_chars()?;
            if pos > len {
                return Err(EngineError::out_of_range(pos, len));
            }
        }
        Ok(())
    }

    /// Document line `n` with its terminator
    fn raw_line(&self, n: usize) -> Result<String> {
        let raw = match self.overlay.locate(n, self.eof()) {
            LineLocation::Original { line, .. } => self.original_raw(line),
            LineLocation::Edited { window, line, .. } => {
                self.overlay.window(window).and_then(|w| w.line_raw(line))
            }
        };
        raw.ok_or(EngineError::Pending { line: n })
    }

    /// Original lines that must be in a window for position `pos` to be
    /// editable
    fn span_at(&self, pos: usize) -> Result<Range<usize>> {
        match self.overlay.locate_char(pos, self.eof()) {
            CharLocation::Edited { window, .. } => Ok(self.window(window)?.lines()),
            CharLocation::Original { pos, .. } => {
                let line = self.original_line_at(pos)?;
                Ok(line..line + 1)
            }
        }
    }

    /// Make sure character positions `from..=to` lie in one window.
    /// Returns the window and the rope offset of `from`.
    fn ensure_window(&mut self, from: usize, to: usize) -> Result<(usize, usize)> {
        let first = self.span_at(from)?;
        let last = self.span_at(to)?;
        let window = self.widen(first.start.min(last.start)..first.end.max(last.end))?;
        match self.overlay.locate_char(from, self.eof()) {
            CharLocation::Edited { window: found, offset, .. } if found == window => {
                Ok((window, offset))
            }
            _ => Err(EngineError::out_of_range(from, self.index.line_count())),
        }
    }

    /// Put original `lines` into a window, joining every window that
    /// overlaps them or lies within the merge gap. Returns the start of the
    /// resulting window. Nothing changes if reading the original text fails.
    fn widen(&mut self, lines: Range<usize>) -> Result<usize> {
        if let Some(start) = self.overlay.containing(&lines) {
            return Ok(start);
        }

        let near = self.overlay.near(&lines);
        let mut start = lines.start;
        let mut end = lines.end;
        for &key in &near {
            let window = self.window(key)?;
            start = start.min(window.start());
            end = end.max(window.end());
        }

        let mut gaps = Vec::with_capacity(near.len() + 1);
        let mut cursor = start;
        for &key in &near {
            gaps.push(self.original_span(cursor..key)?);
            cursor = self.window(key)?.end();
        }
        gaps.push(self.original_span(cursor..end)?);
        let char_start = self.prefix(start)?;
        let original_chars = self.prefix(end)? - char_start;

        let mut gaps = gaps.into_iter();
        let mut rope = self.overlay.rope_from(&gaps.next().unwrap_or_default());
        for &key in &near {
            if let Some(window) = self.overlay.remove(key) {
                rope.append(window.into_rope());
            }
            if let Some(gap) = gaps.next() {
                rope.append(self.overlay.rope_from(&gap));
            }
        }

        if near.is_empty() {
            tracing::debug!("opening edit window over lines {:?}", start..end);
        } else {
            tracing::trace!("joined {} edit windows into lines {:?}", near.len(), start..end);
        }
        let mode = self.line_ending_mode();
        self.overlay
            .insert(Window::new(start..end, char_start, original_chars, rope, mode));
        Ok(start)
    }

    /// Restore the shape of window `start` after an edit: its rope must end
    /// with a line break unless it reaches the end of the file, and in
    /// [`LineEndingMode::Any`] a `\r` `\n` pair may not straddle its edges.
    fn normalize(&mut self, start: usize) -> Result<()> {
        let any = self.line_ending_mode() == LineEndingMode::Any;
        let mut key = start;
        loop {
            let (lines, first, last, ends_with_break) = {
                let window = self.window(key)?;
                (
                    window.lines(),
                    window.rope().first_char(),
                    window.rope().last_char(),
                    window.ends_with_break(),
                )
            };

            if any && lines.start > 0 && first == Some('\n') {
                let previous = self.original_raw(lines.start - 1).ok_or(EngineError::Pending {
                    line: lines.start - 1,
                })?;
                if previous.ends_with('\r') {
                    key = self.widen(lines.start - 1..lines.end)?;
                    continue;
                }
            }

            if self.eof() == Some(lines.end) {
                return Ok(());
            }
            let absorb = !ends_with_break
                || (any
                    && last == Some('\r')
                    && self
                        .original_raw(lines.end)
                        .ok_or(EngineError::Pending { line: lines.end })?
                        .starts_with('\n'));
            if !absorb {
                return Ok(());
            }
            key = self.widen(lines.start..lines.end + 1)?;
        }
    }

    fn for_each_segment(&self, mut f: impl FnMut(&str) -> Result<()>) -> Result<()> {
        if !self.index.is_finished() {
            return Err(EngineError::Pending {
                line: self.line_count().saturating_sub(1),
            });
        }
        let mut cursor = 0;
        for window in self.overlay.windows() {
            self.for_each_original(cursor..window.start(), &mut f)?;
            for chunk in window.rope().chunks() {
                f(chunk)?;
            }
            cursor = window.end();
        }
        self.for_each_original(cursor..self.index.line_count(), &mut f)
    }

    fn for_each_original(
        &self,
        lines: Range<usize>,
        f: &mut impl FnMut(&str) -> Result<()>,
    ) -> Result<()> {
        let mut first = lines.start;
        while first < lines.end {
            let last = (first + CHAR_BLOCK_LINES).min(lines.end);
            f(&self.original_span(first..last)?)?;
            first = last;
        }
        Ok(())
    }

    /// Number of original lines that can be read right now
    fn original_available(&self) -> usize {
        let count = self.index.line_count();
        if self.index.is_finished() {
            count
        } else {
            count - 1
        }
    }

    /// Byte range of original line `n`, terminator included
    fn original_bounds(&self, n: usize) -> Option<(u64, u64)> {
        let start = match n {
            0 => self.bom_len,
            n => self.index.line_start_offset(n)?,
        };
        let end = match self.index.terminator_offset(n) {
            Some(terminator) => terminator + 1,
            None if self.index.is_finished() && n + 1 == self.index.line_count() => self.store.len(),
            None => return None,
        };
        Some((start.min(end), end))
    }

    /// Decoded text of original line `n`, terminator included
    fn original_raw(&self, n: usize) -> Option<String> {
        let (start, end) = self.original_bounds(n)?;
        let bytes = self.store.slice(start, end).ok()?;
        Some(decode_lossy(bytes, self.encoding).into_owned())
    }

    fn original_chars(&self, n: usize) -> Option<usize> {
        let (start, end) = self.original_bounds(n)?;
        let bytes = self.store.slice(start, end).ok()?;
        Some(decode_lossy(bytes, self.encoding).chars().count())
    }

    /// Decoded text of original `lines`, terminators included
    fn original_span(&self, lines: Range<usize>) -> Result<String> {
        if lines.is_empty() {
            return Ok(String::new());
        }
        let (start, _) = self
            .original_bounds(lines.start)
            .ok_or(EngineError::Pending { line: lines.start })?;
        let (_, end) = self
            .original_bounds(lines.end - 1)
            .ok_or(EngineError::Pending { line: lines.end - 1 })?;
        let bytes = self.store.slice(start, end)?;
        Ok(decode_lossy(bytes, self.encoding).into_owned())
    }

    /// Add the next block to the character count table if all its lines
    /// are available
    fn push_char_block(&self) -> bool {
        let block = self.char_prefix.borrow().len() - 1;
        let (first, last) = (block * CHAR_BLOCK_LINES, (block + 1) * CHAR_BLOCK_LINES);
        if last > self.original_available() {
            return false;
        }
        let mut total = self.char_prefix.borrow()[block];
        for n in first..last {
            match self.original_chars(n) {
                Some(chars) => total += chars,
                None => return false,
            }
        }
        self.char_prefix.borrow_mut().push(total);
        true
    }

    /// Characters in original lines `0..line`
    fn prefix(&self, line: usize) -> Result<usize> {
        let block = line / CHAR_BLOCK_LINES;
        while self.char_prefix.borrow().len() <= block {
            if !self.push_char_block() {
                break;
            }
        }
        let (mut n, mut total) = {
            let prefix = self.char_prefix.borrow();
            let block = block.min(prefix.len() - 1);
            (block * CHAR_BLOCK_LINES, prefix[block])
        };
        while n < line {
            total += self
                .original_chars(n)
                .ok_or(EngineError::Pending { line: n })?;
            n += 1;
        }
        Ok(total)
    }

    /// Original line containing original character position `pos`
    fn original_line_at(&self, pos: usize) -> Result<usize> {
        loop {
            let last = self.char_prefix.borrow().last().copied().unwrap_or(0);
            if last > pos || !self.push_char_block() {
                break;
            }
        }
        let (mut line, mut total) = {
            let prefix = self.char_prefix.borrow();
            let block = prefix.partition_point(|&p| p <= pos).saturating_sub(1);
            (block * CHAR_BLOCK_LINES, prefix[block])
        };

        let finished = self.index.is_finished();
        let available = self.original_available();
        while line < available {
            let chars = self
                .original_chars(line)
                .ok_or(EngineError::Pending { line })?;
            let is_last = finished && line + 1 == available;
            if pos < total + chars || (is_last && pos == total + chars) {
                return Ok(line);
            }
            total += chars;
            line += 1;
        }

        if finished {
            Err(EngineError::out_of_range(pos, total))
        } else {
            Err(EngineError::Pending { line })
        }
    }
}

impl EditTarget for Document {
    fn insert_text(&mut self, pos: usize, text: &str) -> Result<()> {
        self.insert(pos, text)
    }

    fn delete_text(&mut self, pos: usize, length: usize) -> Result<String> {
        self.delete(pos, length)
    }
}

impl LineSource for Document {
    fn line_count(&self) -> usize {
        Document::line_count(self)
    }

    fn line_text(&self, line: usize) -> Option<String> {
        self.line(line).ok().and_then(Line::into_text)
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("encoding", &self.encoding)
            .field("lines", &self.line_count())
            .field("windows", &self.overlay.window_ranges())
            .field("index", &self.index)
            .finish()
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::config::IndexConfig;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Edit {
        Insert(usize, String),
        Delete(usize, usize),
    }

    fn edit_strategy() -> impl Strategy<Value = Edit> {
        prop_oneof![
            (any::<usize>(), "[a-c\\n\\r]{0,6}").prop_map(|(p, t)| Edit::Insert(p, t)),
            (any::<usize>(), 0usize..8).prop_map(|(p, l)| Edit::Delete(p, l)),
        ]
    }

    fn expected_lines(text: &str, mode: LineEndingMode) -> Vec<String> {
        let mut lines = Vec::new();
        let mut current = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match (c, mode) {
                ('\n', _) => lines.push(std::mem::take(&mut current)),
                ('\r', LineEndingMode::Any) => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    lines.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }
        lines.push(current);
        lines
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 200, ..ProptestConfig::default() })]

        /// Every edit sequence matches a plain string model, line by line
        #[test]
        fn prop_document_matches_string_model(
            initial in "[a-c\\n\\r]{0,60}",
            any_mode in any::<bool>(),
            merge_gap_lines in 0usize..3,
            edits in prop::collection::vec(edit_strategy(), 1..20),
        ) {
            let mode = if any_mode { LineEndingMode::Any } else { LineEndingMode::Lf };
            let store = Arc::new(BackingStore::from_bytes(initial.clone().into_bytes()));
            let config = IndexConfig { line_endings: mode, chunk_size: 5, ..IndexConfig::default() };
            let index = LineIndex::build(&store, Encoding::Utf8, &config);
            let rope = RopeConfig { leaf_size: 3, merge_gap_lines };
            let mut doc = Document::new(store, Encoding::Utf8, index, &rope);
            let mut model: Vec<char> = initial.chars().collect();

            for edit in edits {
                match edit {
                    Edit::Insert(pos, text) => {
                        let pos = pos % (model.len() + 1);
                        doc.insert(pos, &text).unwrap();
                        model.splice(pos..pos, text.chars());
                    }
                    Edit::Delete(pos, len) => {
                        let pos = pos % (model.len() + 1);
                        let len = len.min(model.len() - pos);
                        let removed = doc.delete(pos, len).unwrap();
                        let expected: String = model.drain(pos..pos + len).collect();
                        prop_assert_eq!(removed, expected);
                    }
                }
                let text: String = model.iter().collect();
                prop_assert_eq!(doc.contents().unwrap(), text.clone());
                prop_assert_eq!(doc.len_chars().unwrap(), model.len());

                let expected = expected_lines(&text, mode);
                prop_assert_eq!(doc.line_count(), expected.len());
                for (n, line) in expected.iter().enumerate() {
                    let got = doc.line(n).unwrap();
                    prop_assert_eq!(got.text(), Some(line.as_str()));
                }

                // Windows stay sorted and apart
                let ranges = doc.overlay().window_ranges();
                prop_assert!(ranges.windows(2).all(|pair| pair[0].end < pair[1].start));
            }

            let before = doc.contents().unwrap();
            doc.release_unchanged();
            prop_assert_eq!(doc.contents().unwrap(), before.clone());
            prop_assert_eq!(doc.line_count(), expected_lines(&before, mode).len());
        }
    }
}
