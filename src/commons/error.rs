//! Defines all server side errors.

use std::{error, fmt, io};
use std::time::Duration;
use hyper::StatusCode;
use crate::api::status::ErrorResponse;


//------------ IoError -------------------------------------------------------

/// An I/O error with a description of what we were trying to do.
#[derive(Debug)]
pub struct IoError {
    context: String,
    cause: io::Error,
}

impl IoError {
    pub fn new(context: impl Into<String>, cause: io::Error) -> Self {
        IoError { context: context.into(), cause }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.cause)
    }
}

impl error::Error for IoError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.cause)
    }
}


//------------ ToolFailure ---------------------------------------------------

/// The redacted result of an external tool that exited unsuccessfully.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolFailure {
    /// The exit code, or `None` if the tool was killed by a signal.
    pub code: Option<i32>,

    /// What the tool had to say, with secrets and scratch paths removed.
    pub diagnostics: String,
}

impl ToolFailure {
    pub fn new(code: Option<i32>, diagnostics: impl Into<String>) -> Self {
        ToolFailure { code, diagnostics: diagnostics.into() }
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Start-up issues, these stop the process
    //-----------------------------------------------------------------
    StartupHealthCheckFailed(String),
    HttpsSetup(String),

    //-----------------------------------------------------------------
    // Signing issues
    //-----------------------------------------------------------------
    SigningFailed(ToolFailure),
    VerificationFailed(ToolFailure),
    ToolTimeout { tool: String, timeout: Duration },

    //-----------------------------------------------------------------
    // System issues
    //-----------------------------------------------------------------
    MissingKeyId,
    IoError(IoError),
    UnexpectedError(String),

    //-----------------------------------------------------------------
    // Request issues
    //-----------------------------------------------------------------
    InvalidForm(String),
    PostTooBig,
    PostCannotRead,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::StartupHealthCheckFailed(msg) => {
                write!(f, "Startup health check failed: {msg}")
            }
            Error::HttpsSetup(msg) => {
                write!(f, "Cannot set up HTTPS: {msg}")
            }
            Error::SigningFailed(failure) => {
                write!(f, "Signing failed: {}", failure.diagnostics)
            }
            Error::VerificationFailed(failure) => {
                write!(f, "Verification failed: {}", failure.diagnostics)
            }
            Error::ToolTimeout { tool, timeout } => {
                write!(
                    f, "{} did not finish within {} seconds",
                    tool, timeout.as_secs()
                )
            }
            Error::MissingKeyId => {
                write!(
                    f,
                    "No signing key configured: set 'key_id' in the config \
                     file or the {} environment variable",
                    crate::constants::TOKENSIGN_ENV_KEY_ID
                )
            }
            Error::IoError(err) => err.fmt(f),
            Error::UnexpectedError(msg) => {
                write!(f, "Unexpected error: {msg}")
            }
            Error::InvalidForm(msg) => {
                write!(f, "Invalid signing request: {msg}")
            }
            Error::PostTooBig => {
                f.write_str("POST body exceeds configured limit")
            }
            Error::PostCannotRead => {
                f.write_str("POST body cannot be read")
            }
        }
    }
}

impl error::Error for Error {}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Error::IoError(err)
    }
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::UnexpectedError(msg.to_string())
    }

    pub fn invalid_form(msg: impl fmt::Display) -> Self {
        Error::InvalidForm(msg.to_string())
    }

    /// Returns the HTTP status code for this error.
    ///
    /// Everything that goes wrong after the request was accepted is a
    /// server side problem. Only a malformed request is the client's fault.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidForm(_) | Error::PostCannotRead => {
                StatusCode::BAD_REQUEST
            }
            Error::PostTooBig => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Error::StartupHealthCheckFailed(_) => {
                ErrorResponse::new("sys-startup-health-check", self)
            }
            Error::HttpsSetup(_) => ErrorResponse::new("sys-https", self),
            Error::SigningFailed(failure) => {
                ErrorResponse::new("sign-failed", self)
                    .with_exit_code(failure.code)
            }
            Error::VerificationFailed(failure) => {
                ErrorResponse::new("sign-verification-failed", self)
                    .with_exit_code(failure.code)
            }
            Error::ToolTimeout { tool, .. } => {
                ErrorResponse::new("sign-tool-timeout", self).with_tool(tool)
            }
            Error::MissingKeyId => {
                ErrorResponse::new("sys-missing-key-id", self)
            }
            Error::IoError(_) => ErrorResponse::new("sys-io", self),
            Error::UnexpectedError(_) => {
                ErrorResponse::new("sys-unexpected", self)
            }
            Error::InvalidForm(_) => {
                ErrorResponse::new("api-invalid-form", self)
            }
            Error::PostTooBig => ErrorResponse::new("api-post-too-big", self),
            Error::PostCannotRead => {
                ErrorResponse::new("api-post-cannot-read", self)
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------
