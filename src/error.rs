//! Error types for the voice room

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to spawn {0} thread: {1}")]
    ThreadSpawn(&'static str, String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket setup failed: {0}")]
    SocketSetup(String),

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Transport not initialized")]
    NotInitialized,

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Failed to spawn {0} thread: {1}")]
    ThreadSpawn(&'static str, String),
}

/// Peer session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Listener setup failed: {0}")]
    ListenFailed(String),

    #[error("Connect to {0} failed: {1}")]
    ConnectFailed(String, String),

    #[error("Failed to spawn {0} thread: {1}")]
    ThreadSpawn(&'static str, String),
}

impl From<cpal::DevicesError> for AudioError {
    fn from(e: cpal::DevicesError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::UnsupportedFormat(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
