//! Line-at-a-time lexing with explicit carry-over state.
//!
//! A lexer sees one line of text plus the state the previous line ended in
//! and returns the tokens of that line together with the state it ends in.
//! Multi-line constructs (block comments, strings) are expressed entirely
//! through that state, so any line can be re-lexed in isolation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// State carried from the end of one line to the start of the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LexState {
    #[default]
    Normal,
    /// Inside a single-quoted-style string opened with the given delimiter
    InString(char),
    /// Inside a triple-quoted string (`"""` / `'''`)
    InTripleString(char),
    /// Inside a block comment; the value is the nesting depth
    InBlockComment(u8),
    /// Inside a raw string; the value is the number of `#` guards
    InRawString(u8),
    /// Free for lexers other than [`PatternLexer`]
    Custom(u8),
}

impl LexState {
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

/// Highlight category of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Keyword,
    Type,
    Function,
    Identifier,
    Constant,
    Number,
    String,
    Comment,
    Operator,
    Punctuation,
}

/// A token within one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Byte range within the line text
    pub span: Range<usize>,
    pub kind: TokenKind,
}

impl Token {
    pub fn new(span: Range<usize>, kind: TokenKind) -> Self {
        Self { span, kind }
    }
}

/// Result of lexing one line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineTokens {
    pub tokens: Vec<Token>,
    pub exit: LexState,
}

pub trait Lexer: Send {
    /// Tokenize `text` (one line, terminator excluded) starting in `entry`
    fn tokenize_line(&self, text: &str, entry: LexState) -> LineTokens;
}

/// Lexical shape of a language, enough for [`PatternLexer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageSpec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub keywords: &'static [&'static str],
    pub constants: &'static [&'static str],
    pub line_comment: Option<&'static str>,
    pub block_comment: Option<(&'static str, &'static str)>,
    pub nested_comments: bool,
    pub quotes: &'static [char],
    pub triple_quotes: bool,
    pub raw_strings: bool,
}

impl LanguageSpec {
    pub const RUST: LanguageSpec = LanguageSpec {
        name: "rust",
        extensions: &["rs"],
        keywords: &[
            "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
            "extern", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
            "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait",
            "type", "unsafe", "use", "where", "while",
        ],
        constants: &["true", "false", "None", "Some", "Ok", "Err"],
        line_comment: Some("//"),
        block_comment: Some(("/*", "*/")),
        nested_comments: true,
        // Single quotes are left out: lifetimes make them ambiguous
        quotes: &['"'],
        triple_quotes: false,
        raw_strings: true,
    };

    pub const PYTHON: LanguageSpec = LanguageSpec {
        name: "python",
        extensions: &["py", "pyi", "pyw"],
        keywords: &[
            "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del",
            "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in",
            "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
            "with", "yield",
        ],
        constants: &["True", "False", "None"],
        line_comment: Some("#"),
        block_comment: None,
        nested_comments: false,
        quotes: &['"', '\''],
        triple_quotes: true,
        raw_strings: false,
    };

    pub const C_LIKE: LanguageSpec = LanguageSpec {
        name: "c",
        extensions: &[
            "c", "h", "cc", "cpp", "cxx", "hpp", "hh", "hxx", "java", "js", "jsx", "ts", "tsx",
            "go", "cs",
        ],
        keywords: &[
            "auto", "break", "case", "class", "const", "continue", "default", "do", "else",
            "enum", "extern", "for", "function", "goto", "if", "import", "let", "namespace",
            "new", "package", "private", "protected", "public", "return", "sizeof", "static",
            "struct", "switch", "template", "this", "typedef", "union", "var", "void",
            "volatile", "while",
        ],
        constants: &["true", "false", "null", "NULL", "nullptr", "undefined"],
        line_comment: Some("//"),
        block_comment: Some(("/*", "*/")),
        nested_comments: false,
        quotes: &['"', '\''],
        triple_quotes: false,
        raw_strings: false,
    };

    /// Strings and comments only; used when nothing more specific applies
    pub const GENERIC: LanguageSpec = LanguageSpec {
        name: "generic",
        extensions: &[],
        keywords: &[],
        constants: &[],
        line_comment: Some("//"),
        block_comment: Some(("/*", "*/")),
        nested_comments: false,
        quotes: &['"', '\''],
        triple_quotes: false,
        raw_strings: false,
    };

    pub const PLAIN: LanguageSpec = LanguageSpec {
        name: "plain",
        extensions: &["txt", "text", "log"],
        keywords: &[],
        constants: &[],
        line_comment: None,
        block_comment: None,
        nested_comments: false,
        quotes: &[],
        triple_quotes: false,
        raw_strings: false,
    };

    const PRESETS: [&'static LanguageSpec; 5] = [
        &Self::RUST,
        &Self::PYTHON,
        &Self::C_LIKE,
        &Self::GENERIC,
        &Self::PLAIN,
    ];

    /// Look up a preset by name (case-insensitive)
    pub fn from_name(name: &str) -> Option<&'static LanguageSpec> {
        let name = name.to_ascii_lowercase();
        let name = match name.as_str() {
            "rs" => "rust",
            "py" => "python",
            "text" | "txt" => "plain",
            "cpp" | "c++" | "java" | "javascript" | "typescript" | "go" => "c",
            other => other,
        };
        Self::PRESETS.into_iter().find(|spec| spec.name == name)
    }

    /// Pick a preset from a file extension, falling back to [`Self::GENERIC`]
    pub fn from_path(path: &Path) -> &'static LanguageSpec {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| {
                Self::PRESETS
                    .into_iter()
                    .find(|spec| spec.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            })
            .unwrap_or(&Self::GENERIC)
    }
}

const TOKEN_PATTERN: &str = r"^(?:(?P<ws>\s+)|(?P<num>(?:0[xXoObB][0-9A-Fa-f_]+|\d[\d_]*(?:\.\d[\d_]*)?(?:[eE][+-]?\d+)?)[A-Za-z0-9_]*)|(?P<ident>[\p{Alphabetic}_][\p{Alphabetic}\p{Nd}_]*)|(?P<op>[-+*/%=<>!&|^~?:.@]+)|(?P<punct>.))";

/// State-aware tokenizer driven by a [`LanguageSpec`].
///
/// Strings, comments and raw strings are scanned by hand so their state can
/// be carried across lines; everything in normal code goes through a single
/// anchored regex.
pub struct PatternLexer {
    spec: &'static LanguageSpec,
    pattern: Regex,
}

impl PatternLexer {
    pub fn new(spec: &'static LanguageSpec) -> Result<Self, regex::Error> {
        Ok(Self {
            spec,
            pattern: Regex::new(TOKEN_PATTERN)?,
        })
    }

    pub fn spec(&self) -> &'static LanguageSpec {
        self.spec
    }

    /// Try to open a string or comment at `rest`. Returns the state entered
    /// and the length of the opening delimiter.
    fn opener(&self, rest: &str) -> Option<(LexState, usize)> {
        let spec = self.spec;

        if let Some((open, _)) = spec.block_comment {
            if rest.starts_with(open) {
                return Some((LexState::InBlockComment(1), open.len()));
            }
        }

        if spec.raw_strings && rest.starts_with('r') {
            let hashes = rest[1..].bytes().take_while(|&b| b == b'#').count();
            if rest[1 + hashes..].starts_with('"') && hashes <= u8::MAX as usize {
                return Some((LexState::InRawString(hashes as u8), hashes + 2));
            }
        }

        let quote = rest.chars().next()?;
        if !spec.quotes.contains(&quote) {
            return None;
        }
        let len = quote.len_utf8();
        if spec.triple_quotes && rest[len..].starts_with(quote) && rest[2 * len..].starts_with(quote)
        {
            return Some((LexState::InTripleString(quote), 3 * len));
        }
        Some((LexState::InString(quote), len))
    }

    /// Scan a non-normal state starting at `pos`. Returns the byte position
    /// where the construct closes (just past its delimiter), or `None` if it
    /// runs to the end of the line, along with the state left over.
    fn continue_state(&self, text: &str, pos: usize, state: LexState) -> (Option<usize>, LexState) {
        match state {
            LexState::InString(quote) => match find_unescaped(text, pos, quote, 1) {
                Some(end) => (Some(end), LexState::Normal),
                None => (None, state),
            },
            LexState::InTripleString(quote) => match find_unescaped(text, pos, quote, 3) {
                Some(end) => (Some(end), LexState::Normal),
                None => (None, state),
            },
            LexState::InRawString(hashes) => {
                let mut closing = String::from("\"");
                closing.extend(std::iter::repeat('#').take(hashes as usize));
                match text[pos..].find(&closing) {
                    Some(at) => (Some(pos + at + closing.len()), LexState::Normal),
                    None => (None, state),
                }
            }
            LexState::InBlockComment(depth) => self.scan_block_comment(text, pos, depth),
            LexState::Normal | LexState::Custom(_) => (Some(pos), LexState::Normal),
        }
    }

    fn scan_block_comment(&self, text: &str, mut pos: usize, mut depth: u8) -> (Option<usize>, LexState) {
        let Some((open, close)) = self.spec.block_comment else {
            return (Some(pos), LexState::Normal);
        };
        while pos < text.len() {
            let rest = &text[pos..];
            if rest.starts_with(close) {
                pos += close.len();
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return (Some(pos), LexState::Normal);
                }
            } else if self.spec.nested_comments && rest.starts_with(open) {
                pos += open.len();
                depth = depth.saturating_add(1);
            } else {
                pos += rest.chars().next().map_or(1, char::len_utf8);
            }
        }
        (None, LexState::InBlockComment(depth))
    }

    fn classify_word(&self, text: &str, span: &Range<usize>) -> TokenKind {
        let word = &text[span.clone()];
        if self.spec.keywords.iter().any(|k| *k == word) {
            TokenKind::Keyword
        } else if self.spec.constants.iter().any(|k| *k == word) {
            TokenKind::Constant
        } else if text[span.end..].trim_start().starts_with('(') {
            TokenKind::Function
        } else if word.starts_with(|c: char| c.is_uppercase()) {
            TokenKind::Type
        } else {
            TokenKind::Identifier
        }
    }
}

impl Lexer for PatternLexer {
    fn tokenize_line(&self, text: &str, entry: LexState) -> LineTokens {
        let mut tokens = Vec::new();
        let mut state = match entry {
            LexState::Custom(_) => LexState::Normal,
            other => other,
        };
        let mut pos = 0;
        // Start of the string or comment currently being scanned
        let mut span_start = 0;

        while pos < text.len() || !state.is_normal() {
            if !state.is_normal() {
                let kind = match state {
                    LexState::InBlockComment(_) => TokenKind::Comment,
                    _ => TokenKind::String,
                };
                let (end, next) = self.continue_state(text, pos, state);
                let end = end.unwrap_or(text.len());
                if end > span_start {
                    tokens.push(Token::new(span_start..end, kind));
                }
                state = next;
                pos = end;
                if !state.is_normal() {
                    break;
                }
                continue;
            }

            let rest = &text[pos..];

            if let Some(prefix) = self.spec.line_comment {
                if rest.starts_with(prefix) {
                    tokens.push(Token::new(pos..text.len(), TokenKind::Comment));
                    break;
                }
            }

            if let Some((opened, len)) = self.opener(rest) {
                span_start = pos;
                pos += len;
                state = opened;
                continue;
            }

            let Some(caps) = self.pattern.captures(rest) else {
                // The pattern matches any single character; only reachable on
                // an empty remainder.
                break;
            };
            let Some(whole) = caps.get(0) else {
                break;
            };
            let span = pos..pos + whole.end();
            let kind = if caps.name("ws").is_some() {
                None
            } else if caps.name("num").is_some() {
                Some(TokenKind::Number)
            } else if caps.name("ident").is_some() {
                Some(self.classify_word(text, &span))
            } else if caps.name("op").is_some() {
                Some(TokenKind::Operator)
            } else {
                Some(TokenKind::Punctuation)
            };
            if let Some(kind) = kind {
                tokens.push(Token::new(span.clone(), kind));
            }
            pos = span.end.max(pos + 1);
        }

        LineTokens {
            tokens,
            exit: state,
        }
    }
}

/// Find `count` consecutive `quote` characters at or after `from` that are
/// not preceded by a backslash escape. Returns the position past them.
fn find_unescaped(text: &str, from: usize, quote: char, count: usize) -> Option<usize> {
    let mut chars = text[from..].char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
            continue;
        }
        if c == quote {
            let run = text[from + i..].chars().take_while(|&q| q == quote).count();
            if run >= count {
                return Some(from + i + count * quote.len_utf8());
            }
        }
    }
    None
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Spans are in order, non-overlapping and on char boundaries
        #[test]
        fn prop_spans_are_ordered(text in "[ -~äö]{0,60}", entry in 0u8..4) {
            let entry = match entry {
                0 => LexState::Normal,
                1 => LexState::InString('"'),
                2 => LexState::InBlockComment(1),
                _ => LexState::InRawString(0),
            };
            let lexer = PatternLexer::new(&LanguageSpec::RUST).unwrap();
            let out = lexer.tokenize_line(&text, entry);
            let mut last = 0;
            for token in &out.tokens {
                prop_assert!(token.span.start >= last);
                prop_assert!(token.span.end > token.span.start);
                prop_assert!(token.span.end <= text.len());
                prop_assert!(text.is_char_boundary(token.span.start));
                prop_assert!(text.is_char_boundary(token.span.end));
                last = token.span.end;
            }
        }
    }
}
