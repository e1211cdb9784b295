use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::short_hash;
use crate::error::Error;
use crate::gray::GrayRule;

pub const DEFAULT_NAMESPACE: &str = "application";
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Declared content format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Json,
    Yaml,
    Protobuf,
}

impl FromStr for FileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(FileType::Json),
            "yaml" | "yml" => Ok(FileType::Yaml),
            "protobuf" | "proto" => Ok(FileType::Protobuf),
            other => Err(Error::Validation(format!("unsupported file type: {}", other))),
        }
    }
}

/// The unique identity of a document: (project, namespace, environment, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub project: String,
    pub namespace: String,
    pub environment: String,
    pub name: String,
}

impl DocumentKey {
    /// Build a key, substituting the default namespace/environment for blanks.
    pub fn new(project: &str, namespace: &str, environment: &str, name: &str) -> Self {
        let or_default = |v: &str, d: &str| {
            let v = v.trim();
            if v.is_empty() {
                d.to_string()
            } else {
                v.to_string()
            }
        };
        Self {
            project: project.to_string(),
            namespace: or_default(namespace, DEFAULT_NAMESPACE),
            environment: or_default(environment, DEFAULT_ENVIRONMENT),
            name: name.trim().to_string(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project, self.namespace, self.environment, self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    #[serde(flatten)]
    pub key: DocumentKey,
    pub file_type: FileType,
    pub current_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable snapshot in a document's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub document_id: u64,
    pub version: u64,
    pub content: String,
    /// Full lowercase hex SHA-256 of `content`.
    pub content_hash: String,
    pub message: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

impl Version {
    /// Short commit hash for display.
    pub fn commit_hash(&self) -> &str {
        short_hash(&self.content_hash)
    }
}

/// Fields supplied by the caller when appending a version; the store assigns
/// the sequence number.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub content: String,
    pub content_hash: String,
    pub message: String,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    Pending,
    Released,
    Rollback,
    Gray,
    Promoted,
    Cancelled,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Released => "released",
            ReleaseStatus::Rollback => "rollback",
            ReleaseStatus::Gray => "gray",
            ReleaseStatus::Promoted => "promoted",
            ReleaseStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType {
    Full,
    Gray,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: u64,
    pub document_id: u64,
    pub environment: String,
    pub version: u64,
    pub status: ReleaseStatus,
    pub release_type: ReleaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gray_rule: Option<GrayRule>,
    pub released_by: String,
    pub released_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Release {
    pub fn is_active_gray(&self) -> bool {
        self.status == ReleaseStatus::Gray
    }
}

#[derive(Debug, Clone)]
pub struct NewRelease {
    pub document_id: u64,
    pub environment: String,
    pub version: u64,
    pub status: ReleaseStatus,
    pub release_type: ReleaseType,
    pub gray_rule: Option<GrayRule>,
    pub released_by: String,
}

impl NewRelease {
    pub fn full(document_id: u64, environment: &str, version: u64, author: &str) -> Self {
        Self {
            document_id,
            environment: environment.to_string(),
            version,
            status: ReleaseStatus::Released,
            release_type: ReleaseType::Full,
            gray_rule: None,
            released_by: author.to_string(),
        }
    }

    pub fn gray(
        document_id: u64,
        environment: &str,
        version: u64,
        rule: GrayRule,
        author: &str,
    ) -> Self {
        Self {
            document_id,
            environment: environment.to_string(),
            version,
            status: ReleaseStatus::Gray,
            release_type: ReleaseType::Gray,
            gray_rule: Some(rule),
            released_by: author.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Rollback,
    Release,
    ReleaseRollback,
    Gray,
    GrayUpdate,
    Promote,
    Cancel,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Rollback => "rollback",
            ChangeType::Release => "release",
            ChangeType::ReleaseRollback => "release_rollback",
            ChangeType::Gray => "gray",
            ChangeType::GrayUpdate => "gray_update",
            ChangeType::Promote => "promote",
            ChangeType::Cancel => "cancel",
            ChangeType::Delete => "delete",
        }
    }
}

/// Published whenever something a reader could observe has changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub document_id: u64,
    pub version: u64,
    pub change_type: ChangeType,
}

/// A capability an API key may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Delete,
    Release,
    Admin,
    Decrypt,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Delete => "delete",
            Capability::Release => "release",
            Capability::Admin => "admin",
            Capability::Decrypt => "decrypt",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub release: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub decrypt: bool,
}

impl Permissions {
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Read => self.read,
            Capability::Write => self.write,
            Capability::Delete => self.delete,
            Capability::Release => self.release,
            Capability::Admin => self.admin,
            Capability::Decrypt => self.decrypt,
        }
    }

    pub fn from_capabilities(caps: &[Capability]) -> Self {
        let mut perms = Permissions::default();
        for cap in caps {
            match cap {
                Capability::Read => perms.read = true,
                Capability::Write => perms.write = true,
                Capability::Delete => perms.delete = true,
                Capability::Release => perms.release = true,
                Capability::Admin => perms.admin = true,
                Capability::Decrypt => perms.decrypt = true,
            }
        }
        perms
    }
}

/// A registered API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessKey {
    pub access_key: String,
    pub secret: String,
    #[serde(default)]
    pub name: String,
    pub project: String,
    pub permissions: Permissions,
    /// Empty means no IP restriction.
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl AccessKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_key_defaults_blank_scope() {
        let key = DocumentKey::new("shop", "", "  ", "db");
        assert_eq!(key.namespace, DEFAULT_NAMESPACE);
        assert_eq!(key.environment, DEFAULT_ENVIRONMENT);
        assert_eq!(key.to_string(), "shop/application/default/db");
    }

    #[test]
    fn file_type_parse() {
        assert_eq!("JSON".parse::<FileType>().unwrap(), FileType::Json);
        assert_eq!("yml".parse::<FileType>().unwrap(), FileType::Yaml);
        assert!("toml".parse::<FileType>().is_err());
    }

    #[test]
    fn permissions_from_capabilities() {
        let perms = Permissions::from_capabilities(&[Capability::Read, Capability::Release]);
        assert!(perms.allows(Capability::Read));
        assert!(perms.allows(Capability::Release));
        assert!(!perms.allows(Capability::Write));
        assert!(!perms.allows(Capability::Admin));
    }

    #[test]
    fn release_status_serializes_lowercase() {
        let s = serde_json::to_string(&ReleaseStatus::Cancelled).unwrap();
        assert_eq!(s, "\"cancelled\"");
        let c = serde_json::to_string(&ChangeType::GrayUpdate).unwrap();
        assert_eq!(c, "\"gray_update\"");
    }
}
