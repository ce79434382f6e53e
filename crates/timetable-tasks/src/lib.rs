//! Helper backends for built-in scheduler tasks.
//!
//! The scheduling engine dispatches `SendMail` and `Download` builtins here.
//! Payloads arrive as JSON written by operators into the parameter table, so
//! every entry point validates before acting and reports problems as values.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod files;
pub mod mail;

pub use files::{download_urls, DownloadOpts};
pub use mail::{send_mail, EmailAttachment, EmailConn};

/// Failures of the task helper backends
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Payload failed validation
    #[error("{0}")]
    Invalid(String),
    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// HTTP request failure
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// One or more downloads failed
    #[error("download failed: {0}")]
    Download(String),
    /// SMTP conversation failure
    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),
    /// Malformed mail address
    #[error(transparent)]
    Address(#[from] lettre::address::AddressError),
    /// Message could not be assembled
    #[error(transparent)]
    Message(#[from] lettre::error::Error),
}

/// Result alias for task helpers
pub type Result<T> = std::result::Result<T, TaskError>;
