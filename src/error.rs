//! Error types for topology discovery.

use thiserror::Error;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while discovering the topology.
///
/// A geolocation service answering "not found" is not an error; see
/// [`crate::net_geo::resolver::Lookup::NotFound`].
#[derive(Debug, Error)]
pub enum Error {
    /// Connection table could not be read or had no header row
    #[error("Scan failed: {0}")]
    Scan(String),

    /// Geolocation or external-IP service failed (transport, status, payload)
    #[error("Resolver unavailable: {0}")]
    ResolverUnavailable(String),

    /// Trace subprocess could not be started
    #[error("Trace failed: {0}")]
    Trace(String),

    /// Service returned a position outside the valid lat/lon range
    #[error("Invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    /// Settings file could not be parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, response) => Error::ResolverUnavailable(format!(
                "{} returned status {}",
                response.get_url(),
                code
            )),
            ureq::Error::Transport(transport) => Error::ResolverUnavailable(transport.to_string()),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
