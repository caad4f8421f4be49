use std::fmt;

/// Error taxonomy for the encode/mux pump.
///
/// `NoSuitableEncoder` and `UnsupportedFormat` abort the current session
/// only; `InvalidState` marks a contract violation on the mux surface and
/// is treated as a no-op where that is safe (finalize-without-start);
/// `Fatal` carries an encoder hard-error code. Routine poll outcomes
/// (no slot free, no output ready) are not errors and never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpError {
    NoSuitableEncoder(String),
    UnsupportedFormat(String),
    InvalidState(String),
    Encoding(String),
    Muxing(String),
    Io(String),
    Fatal(i32),
}

impl PumpError {
    pub fn no_suitable_encoder(mime: &str) -> Self {
        PumpError::NoSuitableEncoder(format!("no encoder available for mime type {}", mime))
    }

    pub fn unsupported_format(what: impl Into<String>) -> Self {
        PumpError::UnsupportedFormat(what.into())
    }

    pub fn invalid_state(what: impl Into<String>) -> Self {
        PumpError::InvalidState(what.into())
    }
}

impl fmt::Display for PumpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PumpError::NoSuitableEncoder(msg) => write!(f, "No suitable encoder: {}", msg),
            PumpError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            PumpError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            PumpError::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            PumpError::Muxing(msg) => write!(f, "Muxing error: {}", msg),
            PumpError::Io(msg) => write!(f, "IO error: {}", msg),
            PumpError::Fatal(code) => write!(f, "Fatal encoder error: code {}", code),
        }
    }
}

impl std::error::Error for PumpError {}
