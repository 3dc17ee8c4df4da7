//! Edited windows over the original lines of a document.
//!
//! Each [`Window`] holds a [`Rope`] that replaces a run of original lines
//! `start..end`. Lines outside every window are still read straight from the
//! backing store, so two edits far apart only ever materialize the lines
//! they touch. Windows are kept sorted by their first original line and never
//! touch: growing one up to a neighbour merges the two.
//!
//! A window's rope always starts at a line start. It also ends right after a
//! line break unless the window reaches the end of the file.

use crate::model::line_index::LineEndingMode;
use crate::model::rope::Rope;
use std::collections::BTreeMap;
use std::ops::{Add, Range};

/// How far the document has moved relative to the original text, summed
/// over the windows before some point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shift {
    pub lines: isize,
    pub chars: isize,
}

impl Shift {
    /// Document line of original line `n`
    pub fn line(self, n: usize) -> usize {
        n.saturating_add_signed(self.lines)
    }

    /// Document position of original character `pos`
    pub fn char(self, pos: usize) -> usize {
        pos.saturating_add_signed(self.chars)
    }

    /// Original line of document line `n`
    pub fn original_line(self, n: usize) -> usize {
        n.saturating_add_signed(-self.lines)
    }

    /// Original character of document position `pos`
    pub fn original_char(self, pos: usize) -> usize {
        pos.saturating_add_signed(-self.chars)
    }
}

impl Add for Shift {
    type Output = Shift;

    fn add(self, other: Shift) -> Shift {
        Shift {
            lines: self.lines + other.lines,
            chars: self.chars + other.chars,
        }
    }
}

/// Where a document line comes from. `shift` covers the windows before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLocation {
    /// Line of the backing store, by original line number
    Original { line: usize, shift: Shift },
    /// Line `line` of the rope of the window starting at original line
    /// `window`
    Edited {
        window: usize,
        line: usize,
        shift: Shift,
    },
}

/// Where a document character position falls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharLocation {
    /// Original character position `pos`
    Original { pos: usize, shift: Shift },
    /// Offset `offset` into the rope of window `window`. Both ends of a
    /// window's rope count as inside it.
    Edited {
        window: usize,
        offset: usize,
        shift: Shift,
    },
}

/// One run of original lines replaced by a rope
#[derive(Debug, Clone)]
pub struct Window {
    lines: Range<usize>,
    /// Characters in original lines `0..lines.start`. Fixed, since the
    /// original text never changes.
    char_start: usize,
    /// Characters in original `lines`
    original_chars: usize,
    rope: Rope,
    mode: LineEndingMode,
}

impl Window {
    pub fn new(
        lines: Range<usize>,
        char_start: usize,
        original_chars: usize,
        rope: Rope,
        mode: LineEndingMode,
    ) -> Self {
        Self {
            lines,
            char_start,
            original_chars,
            rope,
            mode,
        }
    }

    /// Original lines the window replaces
    pub fn lines(&self) -> Range<usize> {
        self.lines.clone()
    }

    pub fn start(&self) -> usize {
        self.lines.start
    }

    pub fn end(&self) -> usize {
        self.lines.end
    }

    pub fn char_start(&self) -> usize {
        self.char_start
    }

    pub fn original_chars(&self) -> usize {
        self.original_chars
    }

    pub fn rope(&self) -> &Rope {
        &self.rope
    }

    pub fn into_rope(self) -> Rope {
        self.rope
    }

    /// Whether the window reaches the end of a fully indexed file with
    /// `eof` original lines
    pub fn covers_eof(&self, eof: Option<usize>) -> bool {
        eof == Some(self.lines.end)
    }

    /// Lines the rope contributes to the document. The text after the last
    /// break only forms a line when the window reaches the end of the file.
    pub fn line_count(&self, eof: Option<usize>) -> usize {
        self.rope.line_breaks(self.mode) + usize::from(self.covers_eof(eof))
    }

    /// Difference the window makes to line and character counts
    pub fn shift(&self, eof: Option<usize>) -> Shift {
        Shift {
            lines: self.line_count(eof) as isize - self.lines.len() as isize,
            chars: self.rope.len_chars() as isize - self.original_chars as isize,
        }
    }

    /// Character offset of rope line `k` within the rope
    pub fn line_start(&self, k: usize) -> Option<usize> {
        match k {
            0 => Some(0),
            k => self.rope.line_break_offset(k - 1, self.mode).map(|off| off + 1),
        }
    }

    /// Text of rope line `k` with its terminator
    pub fn line_raw(&self, k: usize) -> Option<String> {
        let start = self.line_start(k)?;
        match self.rope.line_break_offset(k, self.mode) {
            Some(terminator) => self.rope.substring(start, terminator + 1).ok(),
            // Past the last break: the unterminated tail
            None if k == self.rope.line_breaks(self.mode) => {
                self.rope.substring(start, self.rope.len_chars()).ok()
            }
            None => None,
        }
    }

    /// Text of rope line `k` without its terminator
    pub fn line_text(&self, k: usize) -> Option<String> {
        let start = self.line_start(k)?;
        match self.rope.line_break_offset(k, self.mode) {
            Some(terminator) => {
                let mut text = self.rope.substring(start, terminator).ok()?;
                if self.mode == LineEndingMode::Any && text.ends_with('\r') {
                    text.pop();
                }
                Some(text)
            }
            None if k == self.rope.line_breaks(self.mode) => {
                self.rope.substring(start, self.rope.len_chars()).ok()
            }
            None => None,
        }
    }

    /// Number of breaks that end before character `pos` of the rope, which
    /// is also the rope line `pos` falls in
    pub fn breaks_before(&self, pos: usize) -> usize {
        let (mut lo, mut hi) = (0, self.rope.line_breaks(self.mode));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.rope.line_break_offset(mid, self.mode) {
                Some(offset) if offset < pos => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    /// Whether the rope's last character ends a line
    pub fn ends_with_break(&self) -> bool {
        match self.rope.last_char() {
            Some('\n') => true,
            Some('\r') => self.mode == LineEndingMode::Any,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EditOverlay {
    /// Keyed by the first original line of each window
    windows: BTreeMap<usize, Window>,
    leaf_size: usize,
    merge_gap: usize,
    mode: LineEndingMode,
    replaced_lines: usize,
    breaks: usize,
    original_chars: usize,
    edited_chars: usize,
}

impl EditOverlay {
    /// `merge_gap` is the number of untouched original lines below which
    /// two windows are joined when one of them grows
    pub fn new(leaf_size: usize, merge_gap: usize, mode: LineEndingMode) -> Self {
        Self {
            windows: BTreeMap::new(),
            leaf_size,
            merge_gap,
            mode,
            replaced_lines: 0,
            breaks: 0,
            original_chars: 0,
            edited_chars: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.windows.is_empty()
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    pub fn merge_gap(&self) -> usize {
        self.merge_gap
    }

    pub fn mode(&self) -> LineEndingMode {
        self.mode
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn window(&self, start: usize) -> Option<&Window> {
        self.windows.get(&start)
    }

    /// Windows in document order
    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.values()
    }

    /// Original line ranges of all windows, in order
    pub fn window_ranges(&self) -> Vec<Range<usize>> {
        self.windows.values().map(Window::lines).collect()
    }

    /// Original lines replaced by ropes
    pub fn replaced_lines(&self) -> usize {
        self.replaced_lines
    }

    /// Characters held in ropes
    pub fn edited_chars(&self) -> usize {
        self.edited_chars
    }

    /// Number of document lines given `original` lines in the index
    pub fn line_count(&self, original: usize, eof: Option<usize>) -> usize {
        let tail = self
            .windows
            .values()
            .next_back()
            .is_some_and(|window| window.covers_eof(eof));
        original - self.replaced_lines + self.breaks + usize::from(tail)
    }

    /// Document length given `original` characters in the backing store
    pub fn len_chars(&self, original: usize) -> usize {
        original - self.original_chars + self.edited_chars
    }

    /// Map document line `n` onto the original lines or a rope
    pub fn locate(&self, n: usize, eof: Option<usize>) -> LineLocation {
        let mut shift = Shift::default();
        for (&start, window) in &self.windows {
            let first = shift.line(start);
            if n < first {
                break;
            }
            if n < first + window.line_count(eof) {
                return LineLocation::Edited {
                    window: start,
                    line: n - first,
                    shift,
                };
            }
            shift = shift + window.shift(eof);
        }
        LineLocation::Original {
            line: shift.original_line(n),
            shift,
        }
    }

    /// Map document character position `pos` onto the original text or a
    /// rope
    pub fn locate_char(&self, pos: usize, eof: Option<usize>) -> CharLocation {
        let mut shift = Shift::default();
        for (&start, window) in &self.windows {
            let first = shift.char(window.char_start);
            if pos < first {
                break;
            }
            if pos <= first + window.rope.len_chars() {
                return CharLocation::Edited {
                    window: start,
                    offset: pos - first,
                    shift,
                };
            }
            shift = shift + window.shift(eof);
        }
        CharLocation::Original {
            pos: shift.original_char(pos),
            shift,
        }
    }

    /// Sum of the shifts of all windows ending at or before original line
    /// `line`
    pub fn shift_before(&self, line: usize, eof: Option<usize>) -> Shift {
        self.windows
            .range(..line)
            .map(|(_, window)| window)
            .filter(|window| window.end() <= line)
            .fold(Shift::default(), |shift, window| shift + window.shift(eof))
    }

    /// Starts of the windows that overlap original `lines` or lie within
    /// the merge gap of them, in order
    pub fn near(&self, lines: &Range<usize>) -> Vec<usize> {
        let gap = self.merge_gap;
        let mut found: Vec<usize> = self
            .windows
            .range(..=lines.end.saturating_add(gap))
            .rev()
            .take_while(|(_, window)| window.end() + gap >= lines.start)
            .map(|(&start, _)| start)
            .collect();
        found.reverse();
        found
    }

    /// Start of the window that already contains all of original `lines`
    pub fn containing(&self, lines: &Range<usize>) -> Option<usize> {
        let (&start, window) = self.windows.range(..=lines.start).next_back()?;
        (window.end() >= lines.end && window.end() > lines.start).then_some(start)
    }

    pub fn insert(&mut self, window: Window) {
        self.count(&window, true);
        if let Some(old) = self.windows.insert(window.start(), window) {
            self.count(&old, false);
        }
    }

    pub fn remove(&mut self, start: usize) -> Option<Window> {
        let window = self.windows.remove(&start)?;
        self.count(&window, false);
        Some(window)
    }

    /// Run `f` on the rope of window `start`, keeping the totals current
    pub fn edit<T>(&mut self, start: usize, f: impl FnOnce(&mut Rope) -> T) -> Option<T> {
        let mode = self.mode;
        let window = self.windows.get_mut(&start)?;
        let (breaks, chars) = (window.rope.line_breaks(mode), window.rope.len_chars());
        let result = f(&mut window.rope);
        let (new_breaks, new_chars) = (window.rope.line_breaks(mode), window.rope.len_chars());
        self.breaks = self.breaks - breaks + new_breaks;
        self.edited_chars = self.edited_chars - chars + new_chars;
        Some(result)
    }

    /// Rope built from `text` with the overlay's leaf size
    pub fn rope_from(&self, text: &str) -> Rope {
        Rope::from_text(text, self.leaf_size)
    }

    fn count(&mut self, window: &Window, add: bool) {
        let breaks = window.rope.line_breaks(self.mode);
        let chars = window.rope.len_chars();
        if add {
            self.replaced_lines += window.lines.len();
            self.breaks += breaks;
            self.original_chars += window.original_chars;
            self.edited_chars += chars;
        } else {
            self.replaced_lines -= window.lines.len();
            self.breaks -= breaks;
            self.original_chars -= window.original_chars;
            self.edited_chars -= chars;
        }
    }
}
