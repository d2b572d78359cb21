//! Error type for tensor graph construction.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

#[derive(Debug, Clone)]
pub enum ModelError {
    /// Error variant returned when a view edge cannot be attached, e.g. the
    /// child already has a parent or its usage does not allow aliasing.
    InvalidView(String),
    /// Error variant returned when a shape-source edge cannot be attached.
    InvalidShapeSource(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ModelError::InvalidView(s) => write!(f, "Invalid view edge: {}", s),
            ModelError::InvalidShapeSource(s) => write!(f, "Invalid shape-source edge: {}", s),
        }
    }
}

impl Error for ModelError {}
