//! Error taxonomy for the live session subsystem.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Device access denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Connection error: {0}")]
    Connection(#[source] anyhow::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Missing or placeholder API credential")]
    InvalidCredential,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Classify an ALSA open failure by errno. Busy or absent hardware is
    /// reported as unavailable; refused access as a permission problem.
    pub fn from_alsa_open(device: &str, err: &alsa::Error) -> Self {
        match err.errno() {
            errno::EACCES | errno::EPERM => {
                SessionError::PermissionDenied(format!("'{}': {}", device, err))
            }
            _ => SessionError::DeviceUnavailable(format!("'{}': {}", device, err)),
        }
    }
}

// Errno values used for classification, kept local to avoid a libc dependency.
mod errno {
    pub const EPERM: i32 = 1;
    pub const EACCES: i32 = 13;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let e = SessionError::DeviceUnavailable("'default': no such device".into());
        assert!(e.to_string().contains("default"));
        assert_eq!(
            SessionError::InvalidCredential.to_string(),
            "Missing or placeholder API credential"
        );
    }
}
