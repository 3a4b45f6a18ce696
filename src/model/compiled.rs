use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::{EntityView, SchemaDefinition, StorageModel};

/// The immutable result of compiling one schema version.
/// Storage model and entity views are always rebuilt together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledModel {
    /// SHA-256 of the schema this model was compiled from
    pub schema_hash: String,
    pub storage: StorageModel,
    /// Entity type name -> view
    pub views: IndexMap<String, EntityView>,
}

impl CompiledModel {
    pub fn view(&self, entity: &str) -> Option<&EntityView> {
        self.views.get(entity)
    }

    /// Calculate the SHA-256 version hash of a schema document
    pub fn schema_hash(schema: &SchemaDefinition) -> Result<String> {
        use sha2::{Digest, Sha256};

        let canonical = serde_json::to_string(schema).context("Failed to serialize schema")?;
        let mut hasher = Sha256::new();
        hasher.update(format!("schema:{}\n", canonical));

        Ok(hex::encode(hasher.finalize()))
    }

    /// Serialize into a gzip-compressed JSON blob for persistence next to the schema
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let serialized = serde_json::to_vec(self).context("Failed to serialize compiled model")?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serialized)?;
        encoder.finish().context("Failed to compress compiled model")
    }

    /// Load a blob written by `to_blob`; uncompressed JSON is accepted as well
    pub fn from_blob(data: &[u8]) -> Result<Self> {
        use flate2::read::GzDecoder;
        use std::io::Read;

        // gzip magic bytes (1f 8b)
        let json = if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            let mut decoder = GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .context("Failed to decompress compiled model")?;
            decompressed
        } else {
            data.to_vec()
        };

        serde_json::from_slice(&json).context("Failed to deserialize compiled model")
    }
}
