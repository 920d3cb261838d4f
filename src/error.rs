use std::fmt;

use crate::Position;

/// The result of interpreting a piece of Lox source code.
#[derive(Debug)]
pub enum Error {
    /// A compilation error happened
    Compile,
    /// A runtime error happened
    Runtime,
}

impl std::error::Error for Error {}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => write!(f, "Compilation error(s) occured."),
            Self::Runtime => write!(f, "Runtime error(s) occured."),
        }
    }
}

/// Error while scanning Lox source code
#[derive(Debug, Clone)]
pub enum ScanError {
    /// A string literal is unterminated
    UnterminatedString(Position),
    /// Invalid character
    UnexpectedCharacter(Position, char),
}

impl std::error::Error for ScanError {}
impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnterminatedString(pos) => write!(f, "{pos} Error: Unterminated string."),
            Self::UnexpectedCharacter(pos, _) => write!(f, "{pos} Error: Unexpected character."),
        }
    }
}

/// Error while compiling Lox source code
#[derive(Debug, Clone)]
pub enum ParseError {
    /// A token that is not allowed where it was found
    UnexpectedToken(Position, String, String),
    /// Source ended while a construct was still incomplete
    UnexpectedEof(Position, String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedToken(pos, lexeme, message) => {
                write!(f, "{pos} Error at '{lexeme}': {message}")
            }
            Self::UnexpectedEof(pos, message) => {
                write!(f, "{pos} Error at end: {message}")
            }
        }
    }
}

/// Virtual machine errors
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// Exceeded the maximum number of call frames or value-stack slots
    StackOverflow,
    /// Unary '-' applied to a non-number
    NotNumber,
    /// A comparison or arithmetic operator applied to non-numbers
    NotNumbers,
    /// Operator '+' applied to mismatched operands
    NotNumbersOrStrings,
    /// Make a call on a value that is neither a function nor a class
    NotCallable,
    /// Inherit from a value that is not a class
    NotClass,
    /// Property access on a value that is not an instance
    NoProperties,
    /// Field assignment on a value that is not an instance
    NoFields,
    /// Method invocation on a value that is not an instance
    NoMethods,
    /// Call with the wrong number of arguments
    Arity(u8, u8),
    /// Accessing an undefined variable
    UndefinedVariable(String),
    /// Accessing an undefined property
    UndefinedProperty(String),
}

impl std::error::Error for RuntimeError {}
impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "Stack overflow."),
            Self::NotNumber => write!(f, "Operand must be a number."),
            Self::NotNumbers => write!(f, "Operands must be numbers."),
            Self::NotNumbersOrStrings => {
                write!(f, "Operands must be two numbers or two strings.")
            }
            Self::NotCallable => write!(f, "Can only call functions and classes."),
            Self::NotClass => write!(f, "Superclass must be a class."),
            Self::NoProperties => write!(f, "Only instances have properties."),
            Self::NoFields => write!(f, "Only instances have fields."),
            Self::NoMethods => write!(f, "Only instances have methods."),
            Self::Arity(expected, got) => {
                write!(f, "Expected {expected} arguments but got {got}.")
            }
            Self::UndefinedVariable(name) => write!(f, "Undefined variable '{name}'."),
            Self::UndefinedProperty(name) => write!(f, "Undefined property '{name}'."),
        }
    }
}
