//! Error types for expression compilation and evaluation.

use thiserror::Error;

/// Result type alias for expression operations.
pub type Result<T> = std::result::Result<T, ExprError>;

/// Error variants for expressions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// The source could not be tokenized or parsed.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax {
        /// Byte offset in the source.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// An identifier is not declared in the environment.
    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),

    /// A function is not known.
    #[error("undeclared function '{0}'")]
    UndeclaredFunction(String),

    /// No overload of an operator or function accepts the operand types.
    #[error("no such overload: {0}")]
    NoSuchOverload(String),

    /// Map lookup or field selection of a missing key.
    #[error("no such key: {0}")]
    NoSuchKey(String),

    /// Index out of range.
    #[error("index out of range: {0}")]
    IndexOutOfRange(i64),

    /// Integer overflow or division by zero.
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    /// Access to the value of an empty optional.
    #[error("optional.none() dereference")]
    EmptyOptional,

    /// Invalid argument to a conversion function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The result has an unexpected type.
    #[error("expression result is {actual}, expected {expected}")]
    UnexpectedType {
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        actual: &'static str,
    },
}
