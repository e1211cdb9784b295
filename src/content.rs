//! Format validation and content addressing for configuration documents.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::FileType;

/// Length of the display form of a content hash.
pub const SHORT_HASH_LEN: usize = 16;

/// Validate `content` against `file_type` and return what should be stored.
///
/// JSON is stored verbatim once it parses. YAML is translated into an
/// equivalent JSON tree and stored as compact JSON; documents that cannot be
/// expressed as a JSON tree are rejected.
/// Protobuf payloads are opaque and stored as-is.
pub fn normalize(file_type: FileType, content: &str) -> Result<String> {
    match file_type {
        FileType::Json => {
            serde_json::from_str::<Value>(content)
                .map_err(|e| Error::Validation(format!("invalid JSON: {}", e)))?;
            Ok(content.to_string())
        }
        FileType::Yaml => {
            let tree: Value = serde_yaml::from_str(content)
                .map_err(|e| Error::Validation(format!("invalid YAML: {}", e)))?;
            serde_json::to_string(&tree)
                .map_err(|e| Error::Validation(format!("YAML is not representable as JSON: {}", e)))
        }
        FileType::Protobuf => Ok(content.to_string()),
    }
}

/// Parse stored content into a JSON tree for structural comparison.
pub fn parse_tree(content: &str) -> Result<Value> {
    serde_json::from_str(content)
        .map_err(|e| Error::Validation(format!("content is not structured JSON: {}", e)))
}

/// Full lowercase hex SHA-256 of the content bytes. Depends on nothing but
/// the content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Display prefix of a full hash.
pub fn short_hash(full: &str) -> &str {
    full.get(..SHORT_HASH_LEN).unwrap_or(full)
}
