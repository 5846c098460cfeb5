//! Error types shared by the resistor and pipe network solvers.

use thiserror::Error;

/// Result type alias using [`NetworkError`].
pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    /// A loop, path or query referenced an element or node that does not exist
    #[error("Unknown {kind} '{name}'")]
    Lookup { kind: &'static str, name: String },

    /// Network definition file could not be parsed
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Newton iteration ran out of iterations without meeting tolerance
    #[error("Solver did not converge after {iterations} iterations (residual norm {residual_norm:.3e})")]
    Convergence {
        iterations: usize,
        residual_norm: f64,
        residual: Vec<f64>,
    },

    /// Equation count does not match the number of unknowns
    #[error("Dimension mismatch: {equations} equations for {unknowns} unknowns")]
    DimensionMismatch { unknowns: usize, equations: usize },

    /// Structural problem in the network definition
    #[error("Invalid topology: {0}")]
    Topology(String),

    #[error("Invalid parameter '{param}' for '{element}': {message}")]
    InvalidParameter {
        element: String,
        param: String,
        message: String,
    },

    /// Solved currents or flows were requested before a successful solve
    #[error("Network '{0}' has not been solved")]
    NotSolved(String),

    /// Linear solve inside a Newton step failed
    #[error("Singular Jacobian: {0}")]
    Singular(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub fn lookup(kind: &'static str, name: impl Into<String>) -> Self {
        NetworkError::Lookup {
            kind,
            name: name.into(),
        }
    }

    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        NetworkError::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn invalid_parameter(
        element: impl Into<String>,
        param: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        NetworkError::InvalidParameter {
            element: element.into(),
            param: param.into(),
            message: message.into(),
        }
    }

    /// Initial guess whose length differs from the number of unknowns
    pub fn guess_length(expected: usize, got: usize) -> Self {
        NetworkError::invalid_parameter(
            "initial guess",
            "length",
            format!("expected {} values, got {}", expected, got),
        )
    }

    /// Returns true for errors a caller may retry with a different initial guess.
    pub fn is_convergence_failure(&self) -> bool {
        matches!(
            self,
            NetworkError::Convergence { .. } | NetworkError::Singular(_)
        )
    }
}
