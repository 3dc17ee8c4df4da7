// Property-based tests using proptest
// These tests generate random sequences of edits and compare the buffer
// against a plain string model

use proptest::prelude::*;
use std::io::Write;
use tempfile::TempDir;
use vbuf::{EngineConfig, LineEndingMode, VirtualBuffer};

/// Random edit operation. Positions are seeds, reduced modulo the current
/// length when applied.
#[derive(Debug, Clone)]
enum EditOp {
    Insert(usize, String),
    Delete(usize, usize),
    Replace(usize, usize, String),
    Undo,
    Redo,
}

/// Shadow model: the current text plus the undo and redo snapshots
struct Shadow {
    text: Vec<char>,
    undo: Vec<Vec<char>>,
    redo: Vec<Vec<char>>,
}

impl Shadow {
    fn new(text: &str) -> Self {
        Self {
            text: text.chars().collect(),
            undo: Vec::new(),
            redo: Vec::new(),
        }
    }

    fn record(&mut self, before: Vec<char>) {
        self.undo.push(before);
        self.redo.clear();
    }

    fn current(&self) -> String {
        self.text.iter().collect()
    }
}

impl EditOp {
    /// Apply this operation to both the buffer and the shadow model
    fn apply(&self, buffer: &mut VirtualBuffer, shadow: &mut Shadow) {
        let len = shadow.text.len();
        match self {
            Self::Insert(seed, text) => {
                let pos = seed % (len + 1);
                buffer.insert(pos, text).unwrap();
                let before = shadow.text.clone();
                shadow.text.splice(pos..pos, text.chars());
                shadow.record(before);
            }
            Self::Delete(seed, count) => {
                if len == 0 {
                    return;
                }
                let pos = seed % len;
                let count = (*count).min(len - pos).max(1);
                let removed = buffer.delete(pos, count).unwrap();
                let before = shadow.text.clone();
                let expected: String = shadow.text.drain(pos..pos + count).collect();
                assert_eq!(removed, expected);
                shadow.record(before);
            }
            Self::Replace(seed, count, text) => {
                let pos = seed % (len + 1);
                let count = (*count).min(len - pos);
                buffer.replace_range(pos, count, text).unwrap();
                let before = shadow.text.clone();
                shadow.text.splice(pos..pos + count, text.chars());
                shadow.record(before);
            }
            Self::Undo => {
                let undone = buffer.undo().unwrap();
                assert_eq!(undone, !shadow.undo.is_empty());
                if let Some(previous) = shadow.undo.pop() {
                    shadow.redo.push(std::mem::replace(&mut shadow.text, previous));
                }
            }
            Self::Redo => {
                let redone = buffer.redo().unwrap();
                assert_eq!(redone, !shadow.redo.is_empty());
                if let Some(next) = shadow.redo.pop() {
                    shadow.undo.push(std::mem::replace(&mut shadow.text, next));
                }
            }
        }
    }
}

/// Lines of `text` the way the buffer splits them
fn split_lines(text: &str, mode: LineEndingMode) -> Vec<String> {
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

fn open_file(dir: &TempDir, text: &str, mode: LineEndingMode) -> VirtualBuffer {
    let path = dir.path().join("input.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
    drop(file);

    let mut config = EngineConfig::default();
    config.index.line_endings = mode;
    config.index.chunk_size = 16;
    config.rope.leaf_size = 8;
    let mut buffer = VirtualBuffer::open_with_config(&path, &config).unwrap();
    assert!(buffer.wait_for_index(None));
    buffer
}

fn text_strategy(alphabet: &'static str) -> impl Strategy<Value = String> {
    proptest::string::string_regex(alphabet).unwrap()
}

/// Strategy for generating random edit operations
fn edit_op_strategy(alphabet: &'static str) -> impl Strategy<Value = EditOp> {
    prop_oneof![
        4 => (any::<usize>(), text_strategy(alphabet).prop_filter("non-empty", |s| !s.is_empty()))
            .prop_map(|(pos, text)| EditOp::Insert(pos, text)),
        3 => (any::<usize>(), 1usize..12).prop_map(|(pos, count)| EditOp::Delete(pos, count)),
        1 => (any::<usize>(), 1usize..6, text_strategy(alphabet).prop_filter("non-empty", |s| !s.is_empty()))
            .prop_map(|(pos, count, text)| EditOp::Replace(pos, count, text)),
        1 => Just(EditOp::Undo),
        1 => Just(EditOp::Redo),
    ]
}

fn check_lines(buffer: &VirtualBuffer, expected: &str, mode: LineEndingMode) {
    let lines = split_lines(expected, mode);
    assert_eq!(buffer.line_count(), lines.len(), "line count of {:?}", expected);
    for (n, line) in lines.iter().enumerate() {
        assert_eq!(
            buffer.get_line(n).unwrap().text(),
            Some(line.as_str()),
            "line {} of {:?}",
            n,
            expected
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    /// Buffer text and lines always match the string model
    #[test]
    fn prop_buffer_matches_shadow(
        initial in text_strategy("[ab\n]{0,60}"),
        ops in prop::collection::vec(edit_op_strategy("[xy\n]{0,6}"), 1..40),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut buffer = open_file(&temp_dir, &initial, LineEndingMode::Lf);
        let mut shadow = Shadow::new(&initial);

        for op in &ops {
            op.apply(&mut buffer, &mut shadow);
            prop_assert_eq!(buffer.contents().unwrap(), shadow.current(), "after {:?}", op);
            prop_assert_eq!(buffer.len_chars().unwrap(), shadow.text.len());
        }
        check_lines(&buffer, &shadow.current(), LineEndingMode::Lf);
    }

    /// Mixed terminators in Any mode, including CR/LF pairs split and
    /// joined by edits
    #[test]
    fn prop_any_mode_matches_shadow(
        initial in text_strategy("[a\r\n]{0,40}"),
        ops in prop::collection::vec(edit_op_strategy("[b\r\n]{0,4}"), 1..30),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut buffer = open_file(&temp_dir, &initial, LineEndingMode::Any);
        let mut shadow = Shadow::new(&initial);

        for op in &ops {
            op.apply(&mut buffer, &mut shadow);
        }
        prop_assert_eq!(buffer.contents().unwrap(), shadow.current());
        check_lines(&buffer, &shadow.current(), LineEndingMode::Any);
    }

    /// Undoing everything restores the file and redoing everything
    /// reaches the newest edit
    #[test]
    fn prop_undo_all_restores_original(
        initial in text_strategy("[ab\n]{0,40}"),
        ops in prop::collection::vec(edit_op_strategy("[xy\n]{0,6}"), 1..30),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut buffer = open_file(&temp_dir, &initial, LineEndingMode::Lf);
        let mut shadow = Shadow::new(&initial);
        for op in &ops {
            op.apply(&mut buffer, &mut shadow);
        }
        // Redo runs forward to the newest state the history still holds
        let newest: String = match shadow.redo.first() {
            Some(text) => text.iter().collect(),
            None => shadow.current(),
        };

        while buffer.undo().unwrap() {}
        prop_assert_eq!(buffer.contents().unwrap(), initial);
        prop_assert!(!buffer.is_modified());

        while buffer.redo().unwrap() {}
        prop_assert_eq!(buffer.contents().unwrap(), newest);
    }

    /// Incrementally maintained highlighting matches highlighting a fresh
    /// buffer holding the same text
    #[test]
    fn prop_incremental_highlighting_matches_fresh(
        initial in text_strategy("[a \"/*\n]{0,40}"),
        ops in prop::collection::vec(edit_op_strategy("[a \"/*\n]{0,4}"), 1..20),
    ) {
        let mut buffer = VirtualBuffer::from_text(&initial).unwrap();
        let mut shadow = Shadow::new(&initial);
        for n in 0..buffer.line_count() {
            buffer.highlight_tokens(n).unwrap();
        }

        for op in &ops {
            op.apply(&mut buffer, &mut shadow);
        }

        let mut fresh = VirtualBuffer::from_text(&shadow.current()).unwrap();
        prop_assert_eq!(buffer.line_count(), fresh.line_count());
        for n in 0..fresh.line_count() {
            prop_assert_eq!(
                buffer.highlight_tokens(n).unwrap(),
                fresh.highlight_tokens(n).unwrap(),
                "line {}",
                n
            );
        }
    }
}
