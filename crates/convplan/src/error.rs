use thiserror::Error;

/// Failures surfaced by the handle, the solvers and the invokers.
///
/// "Not applicable" is deliberately absent: solvers report it as `false` /
/// `None` so registry searches can fall through without allocating errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvError {
    #[error("device context has no compute queue: {message}")]
    NoQueue { message: String },
    #[error("solver {solver}: internal inconsistency: {reason}")]
    InternalInconsistency { solver: String, reason: String },
    #[error("failed to build program '{program}': {message}")]
    Compile { program: String, message: String },
    #[error("failed to launch kernel '{kernel}': {message}")]
    Launch { kernel: String, message: String },
    #[error("device failure: {message}")]
    Device { message: String },
    #[error("invalid convolution problem: {message}")]
    InvalidProblem { message: String },
    #[error("invalid invocation: {message}")]
    InvalidInvocation { message: String },
    #[error("no applicable solver for problem {problem}")]
    NoSolution { problem: String },
    #[error("device driver '{name}' unavailable: {message}")]
    DriverUnavailable { name: String, message: String },
}

impl ConvError {
    pub fn no_queue(message: impl Into<String>) -> Self {
        ConvError::NoQueue {
            message: message.into(),
        }
    }

    pub fn inconsistency(solver: impl Into<String>, reason: impl Into<String>) -> Self {
        ConvError::InternalInconsistency {
            solver: solver.into(),
            reason: reason.into(),
        }
    }

    pub fn compile(program: impl Into<String>, message: impl Into<String>) -> Self {
        ConvError::Compile {
            program: program.into(),
            message: message.into(),
        }
    }

    pub fn launch(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        ConvError::Launch {
            kernel: kernel.into(),
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        ConvError::Device {
            message: message.into(),
        }
    }

    pub fn invalid_problem(message: impl Into<String>) -> Self {
        ConvError::InvalidProblem {
            message: message.into(),
        }
    }

    pub fn invalid_invocation(message: impl Into<String>) -> Self {
        ConvError::InvalidInvocation {
            message: message.into(),
        }
    }

    pub fn driver_unavailable(name: impl Into<String>, message: impl Into<String>) -> Self {
        ConvError::DriverUnavailable {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by convplan routines.
pub type ConvResult<T> = Result<T, ConvError>;
