//! Recoverable script-level faults.
//!
//! Every variant maps to the numeric error code a script observes through
//! `Err` and that `ON ERROR` handlers dispatch on.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BasicError {
    #[error("Return without Gosub")]
    ReturnWithoutGosub,
    #[error("Invalid procedure call or argument")]
    InvalidProcedureCall,
    #[error("Overflow")]
    Overflow,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Subscript out of range")]
    SubscriptOutOfRange,
    #[error("This array is fixed or temporarily locked")]
    ArrayFixed,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Type mismatch")]
    TypeMismatch,
    #[error("Resume without error")]
    ResumeWithoutError,
    #[error("Sub or Function not defined: {0}")]
    UndefinedProcedure(String),
    #[error("Object variable not set")]
    ObjectNotSet,
    #[error("For loop not initialized")]
    ForLoopNotInitialized,
    #[error("Invalid pattern string")]
    InvalidPattern,
    #[error("Can't assign to read-only variable: {0}")]
    ReadOnly(String),
    #[error("Property or method not found: {0}")]
    MemberNotFound(String),
    #[error("Object required")]
    ObjectRequired,
    #[error("Object doesn't support this property or method: {0}")]
    NotSupported(String),
    #[error("Named argument not found: {0}")]
    NamedArgumentNotFound(String),
    #[error("Argument not optional")]
    ArgumentNotOptional,
    #[error("Wrong number of arguments or invalid property assignment")]
    WrongArgumentCount,
    #[error("Bad file name or number")]
    BadChannel,
    #[error("Input past end of file")]
    InputPastEnd,
    #[error("Application-defined or object-defined error")]
    User(u32),
    #[error("{message}")]
    Host { code: u32, message: String },
}

impl BasicError {
    pub fn code(&self) -> u32 {
        match self {
            BasicError::ReturnWithoutGosub => 3,
            BasicError::InvalidProcedureCall => 5,
            BasicError::Overflow => 6,
            BasicError::OutOfMemory => 7,
            BasicError::SubscriptOutOfRange => 9,
            BasicError::ArrayFixed => 10,
            BasicError::DivisionByZero => 11,
            BasicError::TypeMismatch => 13,
            BasicError::ResumeWithoutError => 20,
            BasicError::UndefinedProcedure(_) => 35,
            BasicError::BadChannel => 52,
            BasicError::InputPastEnd => 62,
            BasicError::ObjectNotSet => 91,
            BasicError::ForLoopNotInitialized => 92,
            BasicError::InvalidPattern => 93,
            BasicError::ReadOnly(_) => 383,
            BasicError::MemberNotFound(_) => 423,
            BasicError::ObjectRequired => 424,
            BasicError::NotSupported(_) => 438,
            BasicError::NamedArgumentNotFound(_) => 448,
            BasicError::ArgumentNotOptional => 449,
            BasicError::WrongArgumentCount => 450,
            BasicError::User(code) => *code,
            BasicError::Host { code, .. } => *code,
        }
    }

    /// Build the fault raised by an `ERROR n` statement. Codes the engine
    /// knows keep their canonical message.
    pub fn from_code(code: u32) -> Self {
        match code {
            3 => BasicError::ReturnWithoutGosub,
            5 => BasicError::InvalidProcedureCall,
            6 => BasicError::Overflow,
            7 => BasicError::OutOfMemory,
            9 => BasicError::SubscriptOutOfRange,
            10 => BasicError::ArrayFixed,
            11 => BasicError::DivisionByZero,
            13 => BasicError::TypeMismatch,
            20 => BasicError::ResumeWithoutError,
            52 => BasicError::BadChannel,
            62 => BasicError::InputPastEnd,
            91 => BasicError::ObjectNotSet,
            92 => BasicError::ForLoopNotInitialized,
            93 => BasicError::InvalidPattern,
            424 => BasicError::ObjectRequired,
            449 => BasicError::ArgumentNotOptional,
            450 => BasicError::WrongArgumentCount,
            other => BasicError::User(other),
        }
    }

    pub fn host(code: u32, message: impl Into<String>) -> Self {
        BasicError::Host {
            code,
            message: message.into(),
        }
    }
}

/// Error context surfaced to scripts (`Err`, `Erl`) and to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl ErrorInfo {
    pub fn new(err: &BasicError, line: u32, column: u32) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            line,
            column,
        }
    }
}
