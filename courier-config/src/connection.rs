use std::fmt;
use std::str::FromStr;

use url::Url;

/// Path appended to an ingestion endpoint to form the track endpoint.
const TRACK_PATH: &str = "v2/track";

/// Raised if a connection string cannot be parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    /// A segment is not a `key=value` pair.
    #[error("invalid connection string: segment {0:?} is not a key=value pair")]
    MalformedPair(String),
    /// The ingestion endpoint is not a valid URL.
    #[error("invalid connection string: bad ingestion endpoint")]
    InvalidEndpoint(#[source] url::ParseError),
}

/// A parsed connection string.
///
/// Connection strings are `;`-separated `key=value` pairs with case-insensitive keys, for example
/// `InstrumentationKey=00000000-0000-0000-0000-000000000000;IngestionEndpoint=https://ingest/`.
/// Unknown keys are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionString {
    instrumentation_key: Option<String>,
    ingestion_endpoint: Option<Url>,
}

impl ConnectionString {
    /// Returns the instrumentation key, if present.
    pub fn instrumentation_key(&self) -> Option<&str> {
        self.instrumentation_key.as_deref()
    }

    /// Returns the ingestion endpoint, if present.
    pub fn ingestion_endpoint(&self) -> Option<&Url> {
        self.ingestion_endpoint.as_ref()
    }

    /// Returns the track URL derived from the ingestion endpoint.
    pub fn track_endpoint(&self) -> Option<Url> {
        let endpoint = self.ingestion_endpoint.as_ref()?;
        let base = endpoint.as_str().trim_end_matches('/');
        format!("{base}/{TRACK_PATH}").parse().ok()
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parsed = Self::default();

        for segment in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((key, value)) = segment.split_once('=') else {
                return Err(ConnectionStringError::MalformedPair(segment.to_owned()));
            };

            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "instrumentationkey" => parsed.instrumentation_key = Some(value.to_owned()),
                "ingestionendpoint" => {
                    let url = value.parse().map_err(ConnectionStringError::InvalidEndpoint)?;
                    parsed.ingestion_endpoint = Some(url);
                }
                _ => (),
            }
        }

        Ok(parsed)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut separator = "";

        if let Some(ref key) = self.instrumentation_key {
            write!(f, "InstrumentationKey={key}")?;
            separator = ";";
        }

        if let Some(ref endpoint) = self.ingestion_endpoint {
            write!(f, "{separator}IngestionEndpoint={endpoint}")?;
        }

        Ok(())
    }
}

courier_common::impl_str_serde!(ConnectionString, "a connection string");
