#![warn(missing_docs)]

//! Keel policy expressions: a Common Expression Language subset.
//!
//! Expressions are compiled once against an [`Env`] declaring variables,
//! constants and extension functions, then evaluated many times against an
//! [`Activation`] binding variable values.
//!
//! Supported: int/uint/double/string/bool/null literals, lists, maps,
//! arithmetic, comparisons, `in`, `&&`, `||`, `!`, the conditional operator,
//! member selection, indexing, optionals (`hasValue`, `orValue`, `value`) and
//! the conversion functions `int`, `uint`, `double`, `string`, `duration`,
//! `size` plus `startsWith`, `endsWith`, `contains` and `matches` on strings.

pub mod ast;
pub mod duration;
pub mod env;
pub mod envs;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

pub use env::{Activation, Env, Function};
pub use error::{ExprError, Result};
pub use eval::Expression;
pub use value::Value;
