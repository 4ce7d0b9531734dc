//! The token definition for lambda predicates and query pipelines.

/// A token is a single unit of the language, with a specific kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

/// The kind of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // Keywords
    True,
    False,
    Null,

    // Literals
    Identifier(&'a str),
    String(&'a str), // Contents between the quotes, escapes not yet resolved
    Int(i64),
    Float(f64),

    // Punctuation
    Arrow,    // =>
    Dot,      // .
    Comma,    // ,
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    Minus,    // -

    // Operators
    EqEq,   // ==
    NotEq,  // !=
    Gt,     // >
    Lt,     // <
    Gte,    // >=
    Lte,    // <=
    AndAnd, // &&
    OrOr,   // ||
    Amp,    // &
    Pipe,   // |
    Bang,   // !

    // Special
    Illegal, // An illegal/unknown character
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
