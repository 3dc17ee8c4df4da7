//! Height-balanced rope holding the edited text of a buffer.
//!
//! # Design
//! - **Exclusive ownership**: every node is owned by exactly one parent
//!   (`Box`). Split and concatenation consume their inputs and rebuild the
//!   path to the root.
//! - **AVL balance**: joins walk down the spine of the taller tree and
//!   rotate on the way back up, so `|h(left) - h(right)| <= 1` holds at
//!   every node after each public operation.
//! - **Cached summaries**: internal nodes cache the character count of
//!   their left subtree (the weight), their total length, height and line
//!   break counts, so lookups never rescan descendants.
//! - **Bounded leaves**: a leaf holds at most `leaf_size` characters.
//!   Adjacent small leaves are merged during joins, which keeps repeated
//!   single-character inserts from growing the tree one node per keystroke.
//!
//! All indices are character (Unicode scalar value) offsets.

use crate::config::DEFAULT_LEAF_SIZE;
use crate::error::{EngineError, Result};
use crate::model::line_index::LineEndingMode;
use std::fmt;

/// Character and line break totals for a run of text.
///
/// `breaks` counts terminators as [`LineEndingMode::Any`] sees them when
/// the run stands alone: every `\n`, plus every `\r` not followed by `\n`.
/// A trailing `\r` followed by a leading `\n` of the next run is one break,
/// which `combine` accounts for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Summary {
    chars: usize,
    lf: usize,
    breaks: usize,
    starts_lf: bool,
    ends_cr: bool,
}

impl Summary {
    fn of(text: &str) -> Self {
        let mut summary = Summary {
            starts_lf: text.starts_with('\n'),
            ends_cr: text.ends_with('\r'),
            ..Summary::default()
        };
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            summary.chars += 1;
            match c {
                '\n' => {
                    summary.lf += 1;
                    summary.breaks += 1;
                }
                '\r' if chars.peek() != Some(&'\n') => summary.breaks += 1,
                _ => {}
            }
        }
        summary
    }

    fn combine(a: Summary, b: Summary) -> Summary {
        if a.chars == 0 {
            return b;
        }
        if b.chars == 0 {
            return a;
        }
        Summary {
            chars: a.chars + b.chars,
            lf: a.lf + b.lf,
            breaks: a.breaks + b.breaks - usize::from(a.ends_cr && b.starts_lf),
            starts_lf: a.starts_lf,
            ends_cr: b.ends_cr,
        }
    }

    fn breaks(&self, mode: LineEndingMode) -> usize {
        match mode {
            LineEndingMode::Lf => self.lf,
            LineEndingMode::Any => self.breaks,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        text: String,
        summary: Summary,
    },
    Internal {
        left: Box<Node>,
        right: Box<Node>,
        /// Characters in the left subtree
        weight: usize,
        summary: Summary,
        height: usize,
    },
}

type Tree = Option<Box<Node>>;

impl Node {
    fn leaf(text: String) -> Box<Node> {
        let summary = Summary::of(&text);
        Box::new(Node::Leaf { text, summary })
    }

    fn internal(left: Box<Node>, right: Box<Node>) -> Box<Node> {
        Box::new(Node::Internal {
            weight: left.len(),
            summary: Summary::combine(*left.summary(), *right.summary()),
            height: 1 + left.height().max(right.height()),
            left,
            right,
        })
    }

    fn summary(&self) -> &Summary {
        match self {
            Node::Leaf { summary, .. } | Node::Internal { summary, .. } => summary,
        }
    }

    fn len(&self) -> usize {
        self.summary().chars
    }

    fn height(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Internal { height, .. } => *height,
        }
    }

    fn balance_factor(&self) -> isize {
        match self {
            Node::Leaf { .. } => 0,
            Node::Internal { left, right, .. } => left.height() as isize - right.height() as isize,
        }
    }

    fn leaf_text(&self) -> Option<&str> {
        match self {
            Node::Leaf { text, .. } => Some(text),
            Node::Internal { .. } => None,
        }
    }
}

fn rotate_right(node: Box<Node>) -> Box<Node> {
    match *node {
        Node::Internal { left, right, .. } => match *left {
            Node::Internal {
                left: a, right: b, ..
            } => Node::internal(a, Node::internal(b, right)),
            leaf => Node::internal(Box::new(leaf), right),
        },
        leaf => Box::new(leaf),
    }
}

fn rotate_left(node: Box<Node>) -> Box<Node> {
    match *node {
        Node::Internal { left, right, .. } => match *right {
            Node::Internal {
                left: b, right: c, ..
            } => Node::internal(Node::internal(left, b), c),
            leaf => Node::internal(left, Box::new(leaf)),
        },
        leaf => Box::new(leaf),
    }
}

/// Build a node from two AVL subtrees whose heights differ by at most 2
fn balanced(left: Box<Node>, right: Box<Node>) -> Box<Node> {
    let (hl, hr) = (left.height(), right.height());
    if hl > hr + 1 {
        let left = if left.balance_factor() < 0 {
            rotate_left(left)
        } else {
            left
        };
        rotate_right(Node::internal(left, right))
    } else if hr > hl + 1 {
        let right = if right.balance_factor() > 0 {
            rotate_right(right)
        } else {
            right
        };
        rotate_left(Node::internal(left, right))
    } else {
        Node::internal(left, right)
    }
}

fn join(a: Tree, b: Tree, leaf_size: usize) -> Tree {
    match (a, b) {
        (None, tree) | (tree, None) => tree,
        (Some(a), Some(b)) => Some(join_nodes(a, b, leaf_size)),
    }
}

fn join_nodes(a: Box<Node>, b: Box<Node>, leaf_size: usize) -> Box<Node> {
    let (ha, hb) = (a.height(), b.height());
    if ha > hb + 1 {
        match *a {
            Node::Internal { left, right, .. } => {
                balanced(left, join_nodes(right, b, leaf_size))
            }
            leaf => Node::internal(Box::new(leaf), b),
        }
    } else if hb > ha + 1 {
        match *b {
            Node::Internal { left, right, .. } => {
                balanced(join_nodes(a, left, leaf_size), right)
            }
            leaf => Node::internal(a, Box::new(leaf)),
        }
    } else {
        join_adjacent(a, b, leaf_size)
    }
}

/// Join two trees of similar height, merging the leaves that meet at the
/// seam when they fit into one
fn join_adjacent(a: Box<Node>, b: Box<Node>, leaf_size: usize) -> Box<Node> {
    match (*a, *b) {
        (
            Node::Leaf {
                mut text,
                summary: head,
            },
            Node::Leaf {
                text: tail,
                summary: rest,
            },
        ) if head.chars + rest.chars <= leaf_size => {
            text.push_str(&tail);
            Node::leaf(text)
        }
        (
            Node::Internal {
                left, right, height, ..
            },
            Node::Leaf {
                text: tail,
                summary: rest,
            },
        ) if height == 2 && right.leaf_text().is_some() && right.len() + rest.chars <= leaf_size => {
            let mut text = right.leaf_text().unwrap_or_default().to_string();
            text.push_str(&tail);
            Node::internal(left, Node::leaf(text))
        }
        (
            Node::Leaf {
                mut text,
                summary: head,
            },
            Node::Internal {
                left, right, height, ..
            },
        ) if height == 2 && left.leaf_text().is_some() && head.chars + left.len() <= leaf_size => {
            text.push_str(left.leaf_text().unwrap_or_default());
            Node::internal(Node::leaf(text), right)
        }
        (a, b) => Node::internal(Box::new(a), Box::new(b)),
    }
}

/// Split into `[0, index)` and `[index, len)`
fn split(tree: Tree, index: usize, leaf_size: usize) -> (Tree, Tree) {
    match tree {
        None => (None, None),
        Some(node) => split_node(node, index, leaf_size),
    }
}

fn split_node(node: Box<Node>, index: usize, leaf_size: usize) -> (Tree, Tree) {
    if index == 0 {
        return (None, Some(node));
    }
    if index >= node.len() {
        return (Some(node), None);
    }
    match *node {
        Node::Leaf { mut text, .. } => {
            let at = byte_offset(&text, index);
            let tail = text.split_off(at);
            (Some(Node::leaf(text)), Some(Node::leaf(tail)))
        }
        Node::Internal {
            left,
            right,
            weight,
            ..
        } => {
            if index < weight {
                let (ll, lr) = split_node(left, index, leaf_size);
                (ll, join(lr, Some(right), leaf_size))
            } else {
                let (rl, rr) = split_node(right, index - weight, leaf_size);
                (join(Some(left), rl, leaf_size), rr)
            }
        }
    }
}

/// Balanced tree over `text` chopped into leaves of `leaf_size` characters
fn build(text: &str, leaf_size: usize) -> Tree {
    let mut leaves = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (i, _) in text.char_indices() {
        if count == leaf_size {
            leaves.push(Node::leaf(text[start..i].to_string()));
            start = i;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        leaves.push(Node::leaf(text[start..].to_string()));
    }
    build_balanced(leaves)
}

fn build_balanced(mut leaves: Vec<Box<Node>>) -> Tree {
    match leaves.len() {
        0 => None,
        1 => leaves.pop(),
        n => {
            let right = leaves.split_off(n / 2);
            match (build_balanced(leaves), build_balanced(right)) {
                (Some(left), Some(right)) => Some(Node::internal(left, right)),
                (left, right) => left.or(right),
            }
        }
    }
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map_or(text.len(), |(offset, _)| offset)
}

fn collect_range(node: &Node, start: usize, end: usize, out: &mut String) {
    if start >= end {
        return;
    }
    match node {
        Node::Leaf { text, .. } => {
            let from = byte_offset(text, start);
            let to = from + byte_offset(&text[from..], end - start);
            out.push_str(&text[from..to]);
        }
        Node::Internal {
            left,
            right,
            weight,
            ..
        } => {
            if start < *weight {
                collect_range(left, start, end.min(*weight), out);
            }
            if end > *weight {
                collect_range(right, start.saturating_sub(*weight), end - weight, out);
            }
        }
    }
}

/// Character offset of break `k` inside `node`. `next_is_lf` says whether
/// the text following this subtree starts with `\n`, which turns a
/// trailing `\r` into the first half of a `\r\n` pair.
fn find_break(node: &Node, k: usize, mode: LineEndingMode, next_is_lf: bool) -> Option<usize> {
    match node {
        Node::Leaf { text, .. } => {
            let mut remaining = k;
            let mut chars = text.chars().enumerate().peekable();
            while let Some((i, c)) = chars.next() {
                let is_break = match (mode, c) {
                    (_, '\n') => true,
                    (LineEndingMode::Any, '\r') => match chars.peek() {
                        Some((_, next)) => *next != '\n',
                        None => !next_is_lf,
                    },
                    _ => false,
                };
                if is_break {
                    if remaining == 0 {
                        return Some(i);
                    }
                    remaining -= 1;
                }
            }
            None
        }
        Node::Internal {
            left,
            right,
            weight,
            ..
        } => {
            let (ls, rs) = (left.summary(), right.summary());
            let left_breaks = match mode {
                LineEndingMode::Lf => ls.lf,
                LineEndingMode::Any => ls.breaks - usize::from(ls.ends_cr && rs.starts_lf),
            };
            if k < left_breaks {
                find_break(left, k, mode, rs.starts_lf)
            } else {
                find_break(right, k - left_breaks, mode, next_is_lf).map(|i| i + weight)
            }
        }
    }
}

/// Rope over text fragments
#[derive(Debug, Clone)]
pub struct Rope {
    root: Tree,
    leaf_size: usize,
}

impl Default for Rope {
    fn default() -> Self {
        Self::new()
    }
}

impl Rope {
    pub fn new() -> Self {
        Self::with_leaf_size(DEFAULT_LEAF_SIZE)
    }

    pub fn with_leaf_size(leaf_size: usize) -> Self {
        Self {
            root: None,
            leaf_size: leaf_size.max(1),
        }
    }

    pub fn from_text(text: &str, leaf_size: usize) -> Self {
        let leaf_size = leaf_size.max(1);
        Self {
            root: build(text, leaf_size),
            leaf_size,
        }
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    pub fn len_chars(&self) -> usize {
        self.root.as_ref().map_or(0, |node| node.len())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn height(&self) -> usize {
        self.root.as_ref().map_or(0, |node| node.height())
    }

    pub fn leaf_count(&self) -> usize {
        self.chunks().count()
    }

    /// Insert `text` before character `index`
    pub fn insert(&mut self, index: usize, text: &str) -> Result<()> {
        let len = self.len_chars();
        if index > len {
            return Err(EngineError::out_of_range(index, len));
        }
        if text.is_empty() {
            return Ok(());
        }
        let (left, right) = split(self.root.take(), index, self.leaf_size);
        let middle = build(text, self.leaf_size);
        self.root = join(join(left, middle, self.leaf_size), right, self.leaf_size);
        Ok(())
    }

    /// Remove `length` characters starting at `index`, returning them
    pub fn delete(&mut self, index: usize, length: usize) -> Result<String> {
        let len = self.len_chars();
        let end = index
            .checked_add(length)
            .filter(|&end| end <= len)
            .ok_or_else(|| EngineError::out_of_range(index.saturating_add(length), len))?;
        if length == 0 {
            return Ok(String::new());
        }
        let (left, rest) = split(self.root.take(), index, self.leaf_size);
        let (middle, right) = split(rest, end - index, self.leaf_size);
        let mut removed = String::new();
        if let Some(middle) = &middle {
            collect_range(middle, 0, length, &mut removed);
        }
        self.root = join(left, right, self.leaf_size);
        Ok(removed)
    }

    /// Text of `[start, end)`. Does not modify the tree.
    pub fn substring(&self, start: usize, end: usize) -> Result<String> {
        let len = self.len_chars();
        if end > len {
            return Err(EngineError::out_of_range(end, len));
        }
        if start > end {
            return Err(EngineError::out_of_range(start, end));
        }
        let mut out = String::new();
        if let Some(root) = &self.root {
            collect_range(root, start, end, &mut out);
        }
        Ok(out)
    }

    /// Partition into `[0, index)` and `[index, len)`
    pub fn split(self, index: usize) -> Result<(Rope, Rope)> {
        let len = self.len_chars();
        if index > len {
            return Err(EngineError::out_of_range(index, len));
        }
        let leaf_size = self.leaf_size;
        let (left, right) = split(self.root, index, leaf_size);
        Ok((
            Rope {
                root: left,
                leaf_size,
            },
            Rope {
                root: right,
                leaf_size,
            },
        ))
    }

    /// Join two ropes, keeping the leaf size of `a`
    pub fn concat(a: Rope, b: Rope) -> Rope {
        let leaf_size = a.leaf_size;
        Rope {
            root: join(a.root, b.root, leaf_size),
            leaf_size,
        }
    }

    /// Append `other` to the end of this rope
    pub fn append(&mut self, other: Rope) {
        self.root = join(self.root.take(), other.root, self.leaf_size);
    }

    /// Number of line breaks under `mode`
    pub fn line_breaks(&self, mode: LineEndingMode) -> usize {
        self.root.as_ref().map_or(0, |node| node.summary().breaks(mode))
    }

    /// Character offset of the last character of break `k` (0-based).
    /// For a `\r\n` pair that is the `\n`.
    pub fn line_break_offset(&self, k: usize, mode: LineEndingMode) -> Option<usize> {
        find_break(self.root.as_deref()?, k, mode, false)
    }

    pub fn first_char(&self) -> Option<char> {
        self.chunks().next().and_then(|chunk| chunk.chars().next())
    }

    pub fn last_char(&self) -> Option<char> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Leaf { text, .. } => return text.chars().next_back(),
                Node::Internal { right, .. } => node = right,
            }
        }
    }

    /// Leaf fragments in document order
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            stack: self.root.as_deref().into_iter().collect(),
        }
    }

    /// Check every cached summary and the balance invariant
    pub fn validate(&self) -> std::result::Result<(), String> {
        fn check(node: &Node, leaf_size: usize) -> std::result::Result<(), String> {
            match node {
                Node::Leaf { text, summary } => {
                    if text.is_empty() {
                        return Err("empty leaf".to_string());
                    }
                    if summary.chars > leaf_size {
                        return Err(format!("leaf of {} chars exceeds {}", summary.chars, leaf_size));
                    }
                    if *summary != Summary::of(text) {
                        return Err(format!("stale leaf summary for {text:?}"));
                    }
                    Ok(())
                }
                Node::Internal {
                    left,
                    right,
                    weight,
                    summary,
                    height,
                } => {
                    check(left, leaf_size)?;
                    check(right, leaf_size)?;
                    if *weight != left.len() {
                        return Err(format!("weight {} != left length {}", weight, left.len()));
                    }
                    if *summary != Summary::combine(*left.summary(), *right.summary()) {
                        return Err("stale internal summary".to_string());
                    }
                    if *height != 1 + left.height().max(right.height()) {
                        return Err("stale height".to_string());
                    }
                    if node.balance_factor().abs() > 1 {
                        return Err(format!("unbalanced node: factor {}", node.balance_factor()));
                    }
                    Ok(())
                }
            }
        }
        match &self.root {
            Some(root) => check(root, self.leaf_size),
            None => Ok(()),
        }
    }
}

impl From<&str> for Rope {
    fn from(text: &str) -> Self {
        Self::from_text(text, DEFAULT_LEAF_SIZE)
    }
}

impl fmt::Display for Rope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.chunks() {
            f.write_str(chunk)?;
        }
        Ok(())
    }
}

/// Iterator over the leaf fragments of a [`Rope`]
pub struct Chunks<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        while let Some(node) = self.stack.pop() {
            match node {
                Node::Leaf { text, .. } => return Some(text),
                Node::Internal { left, right, .. } => {
                    self.stack.push(right);
                    self.stack.push(left);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_substring() {
        let mut rope = Rope::new();
        rope.insert(0, "hello world").unwrap();
        rope.insert(5, ",").unwrap();
        assert_eq!(rope.to_string(), "hello, world");
        assert_eq!(rope.substring(7, 12).unwrap(), "world");
        assert_eq!(rope.len_chars(), 12);
    }

    #[test]
    fn test_delete_returns_removed_text() {
        let mut rope = Rope::from("abcdef");
        assert_eq!(rope.delete(1, 3).unwrap(), "bcd");
        assert_eq!(rope.to_string(), "aef");
        assert_eq!(rope.delete(0, 0).unwrap(), "");
    }

    #[test]
    fn test_out_of_range_leaves_rope_unchanged() {
        let mut rope = Rope::from("abc");
        assert!(matches!(rope.insert(4, "x"), Err(EngineError::OutOfRange { .. })));
        assert!(rope.delete(2, 2).is_err());
        assert!(rope.delete(usize::MAX, 2).is_err());
        assert!(rope.substring(2, 1).is_err());
        assert_eq!(rope.to_string(), "abc");
    }

    #[test]
    fn test_multibyte_characters() {
        let mut rope = Rope::from_text("héllo wörld", 3);
        assert_eq!(rope.len_chars(), 11);
        assert_eq!(rope.substring(1, 4).unwrap(), "éll");
        rope.insert(7, "ö").unwrap();
        assert_eq!(rope.to_string(), "héllo wöörld");
        assert_eq!(rope.delete(6, 3).unwrap(), "wöö");
        rope.validate().unwrap();
    }

    #[test]
    fn test_split_and_concat() {
        let rope = Rope::from_text("abcdefghij", 2);
        let (left, right) = rope.split(4).unwrap();
        assert_eq!(left.to_string(), "abcd");
        assert_eq!(right.to_string(), "efghij");
        left.validate().unwrap();
        right.validate().unwrap();

        let joined = Rope::concat(right, left);
        assert_eq!(joined.to_string(), "efghijabcd");
        joined.validate().unwrap();

        let (empty, all) = Rope::from("xy").split(0).unwrap();
        assert!(empty.is_empty());
        assert_eq!(all.to_string(), "xy");
    }

    #[test]
    fn test_leaves_are_capped() {
        let text = "x".repeat(5000);
        let rope = Rope::from_text(&text, 1024);
        assert_eq!(rope.leaf_count(), 5);
        assert!(rope.chunks().all(|chunk| chunk.len() <= 1024));
        rope.validate().unwrap();
    }

    #[test]
    fn test_typing_merges_small_leaves() {
        let mut rope = Rope::with_leaf_size(16);
        for i in 0..64 {
            rope.insert(i, "a").unwrap();
        }
        rope.validate().unwrap();
        assert_eq!(rope.len_chars(), 64);
        assert!(rope.leaf_count() <= 8, "leaf count {}", rope.leaf_count());
    }

    #[test]
    fn test_line_breaks_lf() {
        let rope = Rope::from_text("a\nbb\n\nc", 2);
        assert_eq!(rope.line_breaks(LineEndingMode::Lf), 3);
        assert_eq!(rope.line_break_offset(0, LineEndingMode::Lf), Some(1));
        assert_eq!(rope.line_break_offset(1, LineEndingMode::Lf), Some(4));
        assert_eq!(rope.line_break_offset(2, LineEndingMode::Lf), Some(5));
        assert_eq!(rope.line_break_offset(3, LineEndingMode::Lf), None);
    }

    #[test]
    fn test_line_breaks_any_across_leaves() {
        // The CRLF pair is split across leaves by the leaf size of 2
        let rope = Rope::from_text("a\r\nb\rc", 2);
        assert_eq!(rope.line_breaks(LineEndingMode::Any), 2);
        assert_eq!(rope.line_breaks(LineEndingMode::Lf), 1);
        assert_eq!(rope.line_break_offset(0, LineEndingMode::Any), Some(2));
        assert_eq!(rope.line_break_offset(1, LineEndingMode::Any), Some(4));
    }

    #[test]
    fn test_first_and_last_char() {
        let rope = Rope::from_text("hello\n", 2);
        assert_eq!(rope.first_char(), Some('h'));
        assert_eq!(rope.last_char(), Some('\n'));
        assert_eq!(Rope::new().last_char(), None);
    }
}
