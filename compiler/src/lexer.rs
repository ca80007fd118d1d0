// lexer.rs — Lexer for the structured re-emission notation
//
// Tokenizes scripts written by `codegen::emit_script` and the symbolic
// sub-language (`N - 1`, `0:N, i`). Uses the `logos` crate for DFA-based
// lexing of each line; block structure is recovered from leading whitespace
// and reported as synthetic `Indent` / `Dedent` tokens, with a `Newline`
// closing every logical line.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
//                 Every `Indent` is balanced by a `Dedent` before end of input.
// Failure modes: unrecognized characters and inconsistent dedents produce
//                `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Script token types.
///
/// Keywords and symbols are matched as fixed strings. Identifiers carry no
/// value; use the span to retrieve the text from the source. `Indent`,
/// `Dedent` and `Newline` are produced by the layout pass, never by logos.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+|#[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("def")]
    Def,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("while")]
    While,
    #[token("do")]
    Do,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("stateif")]
    StateIf,
    #[token("gblock")]
    GBlock,
    #[token("label")]
    Label,
    #[token("goto")]
    Goto,
    #[token("assign")]
    Assign,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("pass")]
    Pass,
    #[token("with")]
    With,
    #[token("map")]
    Map,
    #[token("pipeline")]
    Pipeline,
    #[token("consume")]
    Consume,
    #[token("loop")]
    Loop,
    #[token("tasklet")]
    Tasklet,
    #[token("library")]
    Library,
    #[token("copy")]
    Copy,
    #[token("dscopy")]
    DsCopy,
    #[token("view")]
    View,
    #[token("nview")]
    NView,
    #[token("refset")]
    RefSet,
    #[token("ndarray")]
    NdArray,
    #[token("scalar")]
    Scalar,
    #[token("symbol")]
    Symbol,

    // ── Symbols ──
    #[token("@")]
    At,
    #[token(":")]
    Colon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token("=")]
    Equals,
    #[token("<<")]
    ShiftLeft,
    #[token(">>")]
    ShiftRight,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("//")]
    SlashSlash,
    #[token("%")]
    Percent,

    // ── Literals ──
    /// Non-negative integer literal; negation is a parser concern.
    #[regex(r"[0-9]+", parse_int)]
    Int(i64),

    /// String literal with `\"`, `\\` and `\n` escapes.
    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    StringLit(String),

    // ── Identifier ──
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // ── Layout ──
    Newline,
    Indent,
    Dedent,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Def => "def",
            Token::For => "for",
            Token::In => "in",
            Token::While => "while",
            Token::Do => "do",
            Token::If => "if",
            Token::Elif => "elif",
            Token::Else => "else",
            Token::StateIf => "stateif",
            Token::GBlock => "gblock",
            Token::Label => "label",
            Token::Goto => "goto",
            Token::Assign => "assign",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Pass => "pass",
            Token::With => "with",
            Token::Map => "map",
            Token::Pipeline => "pipeline",
            Token::Consume => "consume",
            Token::Loop => "loop",
            Token::Tasklet => "tasklet",
            Token::Library => "library",
            Token::Copy => "copy",
            Token::DsCopy => "dscopy",
            Token::View => "view",
            Token::NView => "nview",
            Token::RefSet => "refset",
            Token::NdArray => "ndarray",
            Token::Scalar => "scalar",
            Token::Symbol => "symbol",
            Token::At => "@",
            Token::Colon => ":",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Equals => "=",
            Token::ShiftLeft => "<<",
            Token::ShiftRight => ">>",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::SlashSlash => "//",
            Token::Percent => "%",
            Token::Int(v) => return write!(f, "{v}"),
            Token::StringLit(s) => return write!(f, "\"{s}\""),
            Token::Ident => "<ident>",
            Token::Newline => "<newline>",
            Token::Indent => "<indent>",
            Token::Dedent => "<dedent>",
        };
        f.write_str(text)
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                '"' => result.push('"'),
                '\\' => result.push('\\'),
                'n' => result.push('\n'),
                _ => return None,
            }
        } else {
            result.push(c);
        }
    }
    Some(result)
}

/// Escape a string for a script literal; inverse of the lexer's unescaping.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Whether `text` lexes as a single plain identifier (not a keyword).
pub fn is_identifier(text: &str) -> bool {
    let lexed = lex_inline(text);
    lexed.errors.is_empty()
        && matches!(lexed.tokens.as_slice(), [(Token::Ident, span)] if span.start == 0 && span.end == text.len())
}

/// Turn an arbitrary label into an identifier: invalid characters become
/// `_`, a leading digit gets a `_` prefix, and keywords get a `_` suffix.
pub fn sanitize_identifier(text: &str) -> String {
    let mut out: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if !is_identifier(&out) {
        out.push('_');
    }
    out
}

// ── Public API ──

/// Lex a single line of tokens with no layout handling. Used for the
/// symbolic sub-language.
pub fn lex_inline(source: &str) -> LexResult {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    lex_segment(source, 0, &mut tokens, &mut errors);
    LexResult { tokens, errors }
}

/// Lex a script, synthesising `Newline`, `Indent` and `Dedent`.
///
/// Blank and comment-only lines are ignored. A tab counts as four columns.
pub fn lex(source: &str) -> LexResult {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    let mut levels: Vec<usize> = vec![0];
    let mut offset = 0;

    for line in source.split('\n') {
        let line_start = offset;
        offset += line.len() + 1;

        let body = line.trim_start_matches([' ', '\t']);
        let content = body.trim_end_matches('\r').trim_end();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        let width: usize = line[..line.len() - body.len()]
            .chars()
            .map(|c| if c == '\t' { 4 } else { 1 })
            .sum();
        let at = line_start + (line.len() - body.len());
        let here = Span { start: at, end: at };

        let current = levels.last().copied().unwrap_or(0);
        if width > current {
            levels.push(width);
            tokens.push((Token::Indent, here));
        } else {
            while levels.last().is_some_and(|&l| l > width) {
                levels.pop();
                tokens.push((Token::Dedent, here));
            }
            if levels.last().copied().unwrap_or(0) != width {
                errors.push(LexError {
                    span: here,
                    message: "dedent does not match any enclosing indentation level".to_string(),
                });
                levels.push(width);
            }
        }

        lex_segment(body, at, &mut tokens, &mut errors);
        let end = at + body.len();
        tokens.push((Token::Newline, Span { start: end, end }));
    }

    let eof = Span {
        start: source.len(),
        end: source.len(),
    };
    while levels.len() > 1 {
        levels.pop();
        tokens.push((Token::Dedent, eof));
    }
    LexResult { tokens, errors }
}

fn lex_segment(text: &str, base: usize, tokens: &mut Vec<(Token, Span)>, errors: &mut Vec<LexError>) {
    for (result, range) in Token::lexer(text).spanned() {
        let span = Span {
            start: base + range.start,
            end: base + range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &text[range]),
            }),
        }
    }
}

// ── Tests ──
