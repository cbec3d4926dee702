use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string at position {0}")]
    UnterminatedString(usize),
    #[error("invalid number at position {0}")]
    InvalidNumber(usize),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected token: expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("lexer error: {0}")]
    Lex(#[from] LexError),
}

#[derive(Debug, Error)]
pub enum MiniaError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("'{0}' expects {1} argument(s)")]
    ArityMismatch(&'static str, usize),
}
