//! Configuration codec
//!
//! JSON encoding of the persisted configuration object.

use crate::error::Result;
use crate::model::Configuration;

/// Decode a configuration blob
pub fn decode(bytes: &[u8]) -> Result<Configuration> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a configuration for upload
pub fn encode(configuration: &Configuration) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(configuration)?)
}

/// Encode a configuration for humans
pub fn encode_pretty(configuration: &Configuration) -> Result<String> {
    Ok(serde_json::to_string_pretty(configuration)?)
}
