//! Undo/redo command log.
//!
//! Edits are recorded as [`Command`] values after they have been applied.
//! Undo applies the inverse of the newest command; redo re-applies it.
//! Neither path records anything, so replaying history never feeds back
//! into the log.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Something commands can be applied to
pub trait EditTarget {
    /// Insert `text` at character position `pos`
    fn insert_text(&mut self, pos: usize, text: &str) -> Result<()>;

    /// Remove `length` characters at `pos`, returning the removed text
    fn delete_text(&mut self, pos: usize, length: usize) -> Result<String>;
}

/// One undoable unit. Positions and lengths are in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Insert {
        pos: usize,
        text: String,
    },
    Delete {
        pos: usize,
        length: usize,
        removed: String,
    },
    /// Commands that undo and redo together, in application order
    Batch { commands: Vec<Command> },
}

impl Command {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(pos: usize, removed: impl Into<String>) -> Self {
        let removed = removed.into();
        Self::Delete {
            pos,
            length: removed.chars().count(),
            removed,
        }
    }

    /// The command that exactly reverts this one
    pub fn inverse(&self) -> Command {
        match self {
            Self::Insert { pos, text } => Self::delete(*pos, text.clone()),
            Self::Delete { pos, removed, .. } => Self::insert(*pos, removed.clone()),
            Self::Batch { commands } => Self::Batch {
                commands: commands.iter().rev().map(Command::inverse).collect(),
            },
        }
    }

    /// Apply to `target`. A batch is all-or-nothing: when a child fails,
    /// the children already applied are reverted before the error returns.
    pub fn apply<T: EditTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        match self {
            Self::Insert { pos, text } => target.insert_text(*pos, text),
            Self::Delete { pos, length, .. } => target.delete_text(*pos, *length).map(|_| ()),
            Self::Batch { commands } => {
                for (applied, command) in commands.iter().enumerate() {
                    if let Err(e) = command.apply(target) {
                        for done in commands[..applied].iter().rev() {
                            if let Err(rollback) = done.inverse().apply(target) {
                                tracing::warn!("batch rollback failed: {}", rollback);
                            }
                        }
                        return Err(e);
                    }
                }
                Ok(())
            }
        }
    }

    /// Net change in document length, in characters
    pub fn len_delta(&self) -> isize {
        match self {
            Self::Insert { text, .. } => text.chars().count() as isize,
            Self::Delete { length, .. } => -(*length as isize),
            Self::Batch { commands } => commands.iter().map(Command::len_delta).sum(),
        }
    }

    /// Lowest position the command touches
    pub fn start(&self) -> Option<usize> {
        match self {
            Self::Insert { pos, .. } | Self::Delete { pos, .. } => Some(*pos),
            Self::Batch { commands } => commands.iter().filter_map(Command::start).min(),
        }
    }

    /// True when applying the command changes nothing
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { length, .. } => *length == 0,
            Self::Batch { commands } => commands.iter().all(Command::is_empty),
        }
    }

    /// Single-character, non-newline insert or delete
    fn is_keystroke(&self) -> bool {
        let single = |text: &str| {
            let mut chars = text.chars();
            matches!((chars.next(), chars.next()), (Some(c), None) if c != '\n' && c != '\r')
        };
        match self {
            Self::Insert { text, .. } => single(text),
            Self::Delete { removed, .. } => single(removed),
            Self::Batch { .. } => false,
        }
    }

    fn last(&self) -> &Command {
        match self {
            Self::Batch { commands } => commands.last().map_or(self, Command::last),
            _ => self,
        }
    }

    /// Whether keystroke `next` continues the run ending with `self`
    fn continues(&self, next: &Command) -> bool {
        match (self.last(), next) {
            (Self::Insert { pos, .. }, Self::Insert { pos: next_pos, .. }) => *next_pos == pos + 1,
            // Backspace moves left, forward delete stays in place
            (Self::Delete { pos, .. }, Self::Delete { pos: next_pos, .. }) => {
                *next_pos + 1 == *pos || next_pos == pos
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    command: Command,
    /// Built only from keystrokes, so more may be merged in
    mergeable: bool,
    last_recorded: Instant,
}

/// Undo and redo stacks with batching, keystroke merging and a save point
#[derive(Debug)]
pub struct UndoRedoManager {
    undo_stack: VecDeque<Entry>,
    redo_stack: Vec<Command>,

    /// Undo depth at the last save. `None` once that state can no longer be
    /// reached (discarded redo entries or trimmed history).
    last_saved_index: Option<usize>,

    max_history: usize,
    merge_window: Option<Duration>,
    merge_open: bool,
    batches: Vec<Vec<Command>>,
}

impl Default for UndoRedoManager {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl UndoRedoManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            last_saved_index: Some(0),
            max_history: max_history.max(1),
            merge_window: None,
            merge_open: false,
            batches: Vec::new(),
        }
    }

    /// Merge adjacent keystrokes recorded within `window` of each other.
    /// `None` disables merging.
    pub fn set_merge_window(&mut self, window: Option<Duration>) {
        self.merge_window = window;
    }

    pub fn merge_window(&self) -> Option<Duration> {
        self.merge_window
    }

    /// The next recorded command starts a new undo step even if it would
    /// otherwise merge (cursor moved, focus changed, ...)
    pub fn break_merge(&mut self) {
        self.merge_open = false;
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Record a command that has already been applied
    pub fn record(&mut self, command: Command) {
        self.record_at(command, Instant::now());
    }

    /// Record with an explicit timestamp, which decides merging
    pub fn record_at(&mut self, command: Command, at: Instant) {
        if command.is_empty() {
            return;
        }
        if let Some(batch) = self.batches.last_mut() {
            batch.push(command);
            return;
        }

        self.discard_redo();

        if self.try_merge(&command, at) {
            return;
        }

        self.push(Entry {
            mergeable: command.is_keystroke(),
            command,
            last_recorded: at,
        });
        self.merge_open = true;
    }

    fn try_merge(&mut self, command: &Command, at: Instant) -> bool {
        let Some(window) = self.merge_window else {
            return false;
        };
        if !self.merge_open || !command.is_keystroke() {
            return false;
        }
        // Merging into the saved entry would silently change the saved state
        if self.last_saved_index == Some(self.undo_stack.len()) {
            return false;
        }
        let Some(top) = self.undo_stack.back_mut() else {
            return false;
        };
        let in_window = at
            .checked_duration_since(top.last_recorded)
            .is_some_and(|elapsed| elapsed <= window);
        if !top.mergeable || !in_window || !top.command.continues(command) {
            return false;
        }

        let previous = std::mem::replace(&mut top.command, Command::Batch { commands: Vec::new() });
        let mut commands = match previous {
            Command::Batch { commands } => commands,
            single => vec![single],
        };
        commands.push(command.clone());
        top.command = Command::Batch { commands };
        top.last_recorded = at;
        true
    }

    fn push(&mut self, entry: Entry) {
        self.undo_stack.push_back(entry);
        while self.undo_stack.len() > self.max_history {
            self.undo_stack.pop_front();
            self.last_saved_index = self.last_saved_index.and_then(|saved| saved.checked_sub(1));
        }
    }

    fn discard_redo(&mut self) {
        if self.redo_stack.is_empty() {
            return;
        }
        self.redo_stack.clear();
        if self
            .last_saved_index
            .is_some_and(|saved| saved > self.undo_stack.len())
        {
            self.last_saved_index = None;
        }
    }

    /// Start grouping recorded commands into one undo step. Batches nest;
    /// inner batches fold into the outermost one.
    pub fn begin_batch(&mut self) {
        self.batches.push(Vec::new());
    }

    /// Close the innermost batch. An empty batch records nothing.
    pub fn end_batch(&mut self) {
        let Some(commands) = self.batches.pop() else {
            return;
        };
        if commands.is_empty() {
            return;
        }
        let batch = Command::Batch { commands };
        match self.batches.last_mut() {
            Some(parent) => parent.push(batch),
            None => {
                self.discard_redo();
                self.push(Entry {
                    command: batch,
                    mergeable: false,
                    last_recorded: Instant::now(),
                });
                self.merge_open = false;
            }
        }
    }

    /// Drop the innermost batch without recording it. Returns what it held
    /// so the caller can revert those edits.
    pub fn cancel_batch(&mut self) -> Option<Command> {
        let commands = self.batches.pop()?;
        (!commands.is_empty()).then_some(Command::Batch { commands })
    }

    pub fn in_batch(&self) -> bool {
        !self.batches.is_empty()
    }

    /// Close every open batch
    fn end_all_batches(&mut self) {
        while self.in_batch() {
            self.end_batch();
        }
    }

    /// Revert the newest command. Returns `Ok(false)` when there is nothing
    /// to undo. On error the stacks are left as they were.
    pub fn undo<T: EditTarget + ?Sized>(&mut self, target: &mut T) -> Result<bool> {
        self.end_all_batches();
        let Some(entry) = self.undo_stack.pop_back() else {
            return Ok(false);
        };
        if let Err(e) = entry.command.inverse().apply(target) {
            self.undo_stack.push_back(entry);
            return Err(e);
        }
        tracing::trace!("undo {:?}", entry.command);
        self.redo_stack.push(entry.command);
        self.merge_open = false;
        Ok(true)
    }

    /// Re-apply the newest undone command
    pub fn redo<T: EditTarget + ?Sized>(&mut self, target: &mut T) -> Result<bool> {
        self.end_all_batches();
        let Some(command) = self.redo_stack.pop() else {
            return Ok(false);
        };
        if let Err(e) = command.apply(target) {
            self.redo_stack.push(command);
            return Err(e);
        }
        tracing::trace!("redo {:?}", command);
        self.undo_stack.push_back(Entry {
            command,
            mergeable: false,
            last_recorded: Instant::now(),
        });
        self.merge_open = false;
        Ok(true)
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Newest command on the undo stack
    pub fn peek_undo(&self) -> Option<&Command> {
        self.undo_stack.back().map(|entry| &entry.command)
    }

    /// Newest command on the redo stack
    pub fn peek_redo(&self) -> Option<&Command> {
        self.redo_stack.last()
    }

    pub fn mark_saved(&mut self) {
        self.last_saved_index = Some(self.undo_stack.len());
        self.merge_open = false;
    }

    pub fn last_saved_index(&self) -> Option<usize> {
        self.last_saved_index
    }

    pub fn is_modified(&self) -> bool {
        self.last_saved_index != Some(self.undo_stack.len())
    }

    /// Forget all history. Used when a fresh file is loaded, not on save.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.batches.clear();
        self.last_saved_index = Some(0);
        self.merge_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    /// Plain string target addressed in characters
    #[derive(Default)]
    struct Text(String);

    impl Text {
        fn byte(&self, pos: usize) -> usize {
            self.0.char_indices().nth(pos).map_or(self.0.len(), |(b, _)| b)
        }
    }

    impl EditTarget for Text {
        fn insert_text(&mut self, pos: usize, text: &str) -> Result<()> {
            let len = self.0.chars().count();
            if pos > len {
                return Err(EngineError::out_of_range(pos, len));
            }
            let at = self.byte(pos);
            self.0.insert_str(at, text);
            Ok(())
        }

        fn delete_text(&mut self, pos: usize, length: usize) -> Result<String> {
            let len = self.0.chars().count();
            if pos + length > len {
                return Err(EngineError::out_of_range(pos + length, len));
            }
            let (from, to) = (self.byte(pos), self.byte(pos + length));
            Ok(self.0.drain(from..to).collect())
        }
    }

    fn type_text(target: &mut Text, history: &mut UndoRedoManager, pos: usize, text: &str, at: Instant) {
        target.insert_text(pos, text).unwrap();
        history.record_at(Command::insert(pos, text), at);
    }

    #[test]
    fn test_inverse_of_batch_reverses_children() {
        let batch = Command::Batch {
            commands: vec![Command::insert(0, "ab"), Command::delete(1, "b")],
        };
        assert_eq!(
            batch.inverse(),
            Command::Batch {
                commands: vec![Command::insert(1, "b"), Command::delete(0, "ab")],
            }
        );
        assert_eq!(batch.len_delta(), 1);
        assert_eq!(batch.start(), Some(0));
        assert_eq!(Command::Batch { commands: vec![] }.start(), None);
    }

    #[test]
    fn test_undo_redo_sequence() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        let now = Instant::now();

        type_text(&mut text, &mut history, 0, "X", now);
        type_text(&mut text, &mut history, 1, "Y", now);
        assert_eq!(text.0, "XY");

        assert!(history.undo(&mut text).unwrap());
        assert_eq!(text.0, "X");
        assert!(history.undo(&mut text).unwrap());
        assert_eq!(text.0, "");
        assert!(!history.undo(&mut text).unwrap());

        assert!(history.redo(&mut text).unwrap());
        assert!(history.redo(&mut text).unwrap());
        assert_eq!(text.0, "XY");
        assert!(!history.redo(&mut text).unwrap());
    }

    #[test]
    fn test_record_clears_redo() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        let now = Instant::now();

        type_text(&mut text, &mut history, 0, "a", now);
        history.undo(&mut text).unwrap();
        assert_eq!(history.redo_count(), 1);

        type_text(&mut text, &mut history, 0, "b", now);
        assert_eq!(history.redo_count(), 0);
        assert_eq!(history.undo_count(), 1);
    }

    #[test]
    fn test_keystrokes_merge_within_window() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        history.set_merge_window(Some(Duration::from_millis(500)));
        let start = Instant::now();

        for (i, c) in ["h", "e", "y"].iter().enumerate() {
            type_text(&mut text, &mut history, i, c, start + Duration::from_millis(100 * i as u64));
        }
        assert_eq!(history.undo_count(), 1);

        // Too late to merge
        type_text(&mut text, &mut history, 3, "!", start + Duration::from_secs(5));
        assert_eq!(history.undo_count(), 2);

        history.undo(&mut text).unwrap();
        assert_eq!(text.0, "hey");
        history.undo(&mut text).unwrap();
        assert_eq!(text.0, "");
    }

    #[test]
    fn test_newlines_and_gaps_do_not_merge() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        history.set_merge_window(Some(Duration::from_secs(1)));
        let now = Instant::now();

        type_text(&mut text, &mut history, 0, "a", now);
        type_text(&mut text, &mut history, 1, "\n", now);
        type_text(&mut text, &mut history, 2, "b", now);
        // Not adjacent to the previous insert
        type_text(&mut text, &mut history, 0, "c", now);
        assert_eq!(history.undo_count(), 4);

        history.break_merge();
        type_text(&mut text, &mut history, 1, "d", now);
        assert_eq!(history.undo_count(), 5);
    }

    #[test]
    fn test_backspace_run_merges() {
        let mut text = Text("abc".to_string());
        let mut history = UndoRedoManager::default();
        history.set_merge_window(Some(Duration::from_secs(1)));
        let now = Instant::now();

        for pos in [2, 1, 0] {
            let removed = text.delete_text(pos, 1).unwrap();
            history.record_at(Command::delete(pos, removed), now);
        }
        assert_eq!(history.undo_count(), 1);
        history.undo(&mut text).unwrap();
        assert_eq!(text.0, "abc");
    }

    #[test]
    fn test_modified_tracks_save_point() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        let now = Instant::now();
        assert!(!history.is_modified());

        type_text(&mut text, &mut history, 0, "a", now);
        assert!(history.is_modified());
        history.mark_saved();
        assert!(!history.is_modified());

        type_text(&mut text, &mut history, 1, "b", now);
        assert!(history.is_modified());
        history.undo(&mut text).unwrap();
        assert!(!history.is_modified());
        history.undo(&mut text).unwrap();
        assert!(history.is_modified());
        history.redo(&mut text).unwrap();
        assert!(!history.is_modified());
    }

    #[test]
    fn test_save_point_lost_when_redo_discarded() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        let now = Instant::now();

        type_text(&mut text, &mut history, 0, "a", now);
        type_text(&mut text, &mut history, 1, "b", now);
        history.mark_saved();
        history.undo(&mut text).unwrap();
        type_text(&mut text, &mut history, 1, "c", now);

        // Same depth as the save, different content
        assert_eq!(history.undo_count(), 2);
        assert!(history.is_modified());
        assert_eq!(history.last_saved_index(), None);
    }

    #[test]
    fn test_batch_undoes_in_one_step() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        let now = Instant::now();

        history.begin_batch();
        type_text(&mut text, &mut history, 0, "one ", now);
        history.begin_batch();
        type_text(&mut text, &mut history, 4, "two", now);
        history.end_batch();
        history.end_batch();
        assert_eq!(history.undo_count(), 1);

        history.undo(&mut text).unwrap();
        assert_eq!(text.0, "");
        history.redo(&mut text).unwrap();
        assert_eq!(text.0, "one two");
    }

    #[test]
    fn test_empty_and_cancelled_batches() {
        let mut history = UndoRedoManager::default();
        history.begin_batch();
        history.end_batch();
        assert_eq!(history.undo_count(), 0);

        history.begin_batch();
        history.record(Command::insert(0, "x"));
        let cancelled = history.cancel_batch();
        assert_eq!(
            cancelled,
            Some(Command::Batch {
                commands: vec![Command::insert(0, "x")]
            })
        );
        assert_eq!(history.undo_count(), 0);
        assert!(!history.in_batch());
    }

    #[test]
    fn test_history_limit_drops_oldest() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::new(3);
        let now = Instant::now();
        history.mark_saved();

        for i in 0..5 {
            type_text(&mut text, &mut history, i, "x", now);
        }
        assert_eq!(history.undo_count(), 3);
        assert_eq!(history.last_saved_index(), None);
        while history.undo(&mut text).unwrap() {}
        assert_eq!(text.0, "xx");
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let mut text = Text("abc".to_string());
        let batch = Command::Batch {
            commands: vec![Command::insert(0, "zz"), Command::delete(10, "q")],
        };
        assert!(batch.apply(&mut text).is_err());
        assert_eq!(text.0, "abc");
    }

    #[test]
    fn test_failed_undo_keeps_stacks() {
        let mut text = Text::default();
        let mut history = UndoRedoManager::default();
        history.record(Command::insert(5, "abc"));

        assert!(history.undo(&mut text).is_err());
        assert_eq!(history.undo_count(), 1);
        assert_eq!(history.redo_count(), 0);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut history = UndoRedoManager::default();
        history.record(Command::insert(0, "a"));
        history.begin_batch();
        history.clear();
        assert_eq!(history.undo_count(), 0);
        assert!(!history.in_batch());
        assert!(!history.is_modified());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Insert(usize, String),
            Delete(usize, usize),
            Undo,
            Redo,
            Save,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => (0usize..40, "[a-z\n]{1,5}").prop_map(|(p, s)| Op::Insert(p, s)),
                2 => (0usize..40, 1usize..5).prop_map(|(p, l)| Op::Delete(p, l)),
                2 => Just(Op::Undo),
                1 => Just(Op::Redo),
                1 => Just(Op::Save),
            ]
        }

        proptest! {
            #[test]
            fn prop_undo_then_redo_is_identity(ops in prop::collection::vec(op_strategy(), 1..40)) {
                let mut text = Text::default();
                let mut history = UndoRedoManager::default();

                for op in ops {
                    match op {
                        Op::Insert(pos, s) => {
                            let pos = pos.min(text.0.chars().count());
                            text.insert_text(pos, &s).unwrap();
                            history.record(Command::insert(pos, s));
                        }
                        Op::Delete(pos, len) => {
                            let total = text.0.chars().count();
                            let pos = pos.min(total);
                            let len = len.min(total - pos);
                            if len == 0 {
                                continue;
                            }
                            let removed = text.delete_text(pos, len).unwrap();
                            history.record(Command::delete(pos, removed));
                        }
                        Op::Undo => {
                            history.undo(&mut text).unwrap();
                        }
                        Op::Redo => {
                            history.redo(&mut text).unwrap();
                        }
                        Op::Save => history.mark_saved(),
                    }

                    let after = text.0.clone();
                    let saved = history.is_modified();
                    if history.undo(&mut text).unwrap() {
                        prop_assert!(history.redo(&mut text).unwrap());
                    }
                    prop_assert_eq!(&text.0, &after);
                    prop_assert_eq!(history.is_modified(), saved);
                }

                // The undo stack always leads back to the initial empty text
                while history.undo(&mut text).unwrap() {}
                prop_assert_eq!(text.0.as_str(), "");
            }
        }
    }
}
