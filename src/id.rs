//! Configuration Content Ids
//!
//! The configuration id is the optimistic-concurrency token compared by
//! conditional writes. It is derived from content, so it changes exactly
//! when the configuration changes:
//!
//! - the configuration is encoded with its `id` field blanked
//! - the encoding is hashed with SHA-1
//! - the digest is rendered as 40 lowercase hex characters

use sha1::{Digest, Sha1};

use crate::codec;
use crate::error::Result;
use crate::model::Configuration;

/// Length of a rendered configuration id
pub const CONFIG_ID_LEN: usize = 40;

/// Generate the id a configuration will carry once written
pub fn generate_config_id(configuration: &Configuration) -> Result<String> {
    let mut unversioned = configuration.clone();
    unversioned.id.clear();

    let bytes = codec::encode(&unversioned)?;
    let digest = Sha1::digest(&bytes);
    Ok(format!("{:x}", digest))
}

/// Return a copy of the configuration stamped with its content id
pub fn with_new_id(configuration: &Configuration) -> Result<Configuration> {
    let mut stamped = configuration.clone();
    stamped.id = generate_config_id(configuration)?;
    Ok(stamped)
}
