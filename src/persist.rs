//! Persistence contract (C11, §4.11, §6 "Persisted state").
//!
//! The on-disk format is an internal, versioned JSON document — an
//! implementation detail the system boundary treats as opaque. `load`
//! re-applies stage (3) name normalization after deserializing, per §4.6's
//! note that the stage is deliberately re-run at load time rather than
//! trusted from what was stored.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::SizeInfo;
use crate::normalize::normalize_names;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Document {
    version: u32,
    info: SizeInfo,
}

/// Serializes `info` as the crate's internal `.size` document.
pub fn save(info: &SizeInfo, mut w: impl Write) -> Result<()> {
    let document = Document {
        version: FORMAT_VERSION,
        info: info.clone(),
    };
    serde_json::to_writer(&mut w, &document).map_err(|e| {
        crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

/// Deserializes a `.size` document, re-running stage (3) name normalization
/// on the recovered symbol list.
pub fn load(mut r: impl Read) -> Result<SizeInfo> {
    let mut text = String::new();
    r.read_to_string(&mut text)?;
    let document: Document = serde_json::from_str(&text).map_err(|e| {
        crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    let mut info = document.info;
    normalize_names(&mut info.symbols);
    Ok(info)
}
