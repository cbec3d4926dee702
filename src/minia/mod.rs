//! Minia: the small expression language that produces input features from a
//! request or pool `FeatureMap`.
//!
//! A program is a list of `output_name = expression;` assignments. The
//! expression grammar supports identifier lookup, integer/float/string
//! literals, arithmetic, and three builtins: `hash(x)` (string -> int64 key,
//! pass-through on values already hashed), `identity(x)`, and `cross(a, b)`
//! (hash-combine two keys, used in cross programs to build a joint
//! embedding key from a user feature and an item feature).

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;

pub use error::{LexError, MiniaError, ParseError};
pub use eval::Program;
