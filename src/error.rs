//! Error types for the session client.
//!
//! None of these are fatal to the controller: device errors become status
//! text, transport and API errors during connect send the controller back to
//! setup, and malformed inbound payloads never surface as errors at all.

use thiserror::Error;

/// Camera permission or acquisition failure.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("no camera found")]
    NoDevices,
    #[error("camera {0} is not available")]
    Unavailable(String),
    #[error("camera {device}: {message}")]
    Backend { device: String, message: String },
}

/// Socket could not be opened.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),
    #[error("socket connect failed: {0}")]
    Connect(String),
    #[error("socket connect timed out after {0}s")]
    Timeout(u64),
}

/// HTTP collaborator failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Frame encoding failure.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame buffer size {actual} does not match {width}x{height}x3")]
    BadLayout { width: u32, height: u32, actual: usize },
    #[error("encoder: {0}")]
    Backend(String),
}
