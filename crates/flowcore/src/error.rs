use crate::output::{status, Output, OutputKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Argument(#[from] ArgumentError),

    #[error("No flow with name \"{0}\" found")]
    FlowNotFound(String),

    #[error("Flow \"{0}\" already exists")]
    FlowExists(String),

    #[error("Operator \"{0}\" does not provide any functions")]
    NoFunctions(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn status_code(&self) -> u16 {
        match self {
            FlowError::Validation(e) => e.status_code(),
            FlowError::Argument(e) => e.status_code(),
            FlowError::FlowNotFound(_) => status::NOT_FOUND,
            FlowError::FlowExists(_) => status::CONFLICT,
            FlowError::Serialization(_) => status::BAD_REQUEST,
            FlowError::NoFunctions(_) | FlowError::Persistence(_) | FlowError::Io(_) => {
                status::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<FlowError> for Output {
    fn from(e: FlowError) -> Self {
        Output::error(e.status_code(), e.to_string())
    }
}

/// Reasons a flow descriptor is rejected before it may run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No operations defined")]
    NoOperations,

    #[error("Operation name cannot be \"{0}\"")]
    ReservedName(String),

    #[error("Operation name \"{0}\" is used multiple times")]
    DuplicateName(String),

    #[error("Operation \"{operation}\" references unknown operator \"{operator}\"")]
    UnknownOperator { operation: String, operator: String },

    #[error("Operation \"{operation}\" references unknown {field} \"{reference}\"")]
    UnknownReference {
        operation: String,
        field: &'static str,
        reference: String,
    },

    #[error("Operation \"{0}\" cannot take its input from the operation it is a fallback for")]
    FailSourceIsInput(String),

    #[error("Operation \"{0}\" cannot depend on success and failure of the same operation")]
    FailSourceIsSuccessSource(String),

    #[error("Flow has more than one operation and no outputFrom")]
    MissingOutput,

    #[error("outputFrom \"{0}\" does not name an operation of this flow")]
    UnknownOutput(String),

    #[error("Operation \"{0}\" not found")]
    UnknownOperation(String),
}

impl ValidationError {
    pub fn status_code(&self) -> u16 {
        match self {
            ValidationError::UnknownOperator { .. } | ValidationError::UnknownOperation(_) => {
                status::NOT_FOUND
            }
            _ => status::BAD_REQUEST,
        }
    }
}

impl From<ValidationError> for Output {
    fn from(e: ValidationError) -> Self {
        Output::error(e.status_code(), e.to_string())
    }
}

/// Failures while binding caller arguments to a function
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("required Parameter \"{0}\" is missing")]
    Missing(String),

    #[error("Parameter \"{name}\" is invalid: {reason}")]
    Invalid { name: String, reason: String },

    #[error("Function \"{0}\" not found")]
    UnknownFunction(String),
}

impl ArgumentError {
    pub fn status_code(&self) -> u16 {
        match self {
            ArgumentError::UnknownFunction(_) => status::NOT_FOUND,
            _ => status::BAD_REQUEST,
        }
    }
}

impl From<ArgumentError> for Output {
    fn from(e: ArgumentError) -> Self {
        Output::error(e.status_code(), e.to_string())
    }
}

/// An [`Output`] could not be read as the requested shape
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("output of kind {0} cannot be converted")]
    Unsupported(OutputKind),

    #[error("output is not a map")]
    NotAMap,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid form data: {0}")]
    Form(#[from] serde_urlencoded::de::Error),
}
