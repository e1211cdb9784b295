pub mod memory;
pub mod sled_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use confighub_lib::{
    AccessKey, Document, DocumentKey, FileType, GrayRule, NewRelease, NewVersion, Release,
    ReleaseStatus, Result, Version,
};

/// Persistence for documents, their version history, releases and the
/// access-key registry. Implementations must be thread-safe.
///
/// Compound writes are atomic: a reader never sees `current_version`
/// advanced past a version row that is not yet visible, and the
/// single-active-gray slot per (document, environment) is checked and
/// claimed in one step.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Insert a document together with version 1. Fails with `Conflict` if
    /// the key already exists.
    async fn create_document(
        &self,
        key: &DocumentKey,
        file_type: FileType,
        first: NewVersion,
    ) -> Result<(Document, Version)>;

    async fn get_document(&self, id: u64) -> Result<Option<Document>>;

    async fn find_document(&self, key: &DocumentKey) -> Result<Option<Document>>;

    /// Remove a document and everything it owns.
    async fn delete_document(&self, id: u64) -> Result<()>;

    /// Append the next version and advance `current_version` with it.
    async fn append_version(&self, document_id: u64, version: NewVersion) -> Result<Version>;

    async fn get_version(&self, document_id: u64, version: u64) -> Result<Option<Version>>;

    /// All versions, oldest first.
    async fn list_versions(&self, document_id: u64) -> Result<Vec<Version>>;

    /// Insert a release. A gray release fails with `Conflict` while another
    /// gray release is active for the same (document, environment).
    async fn insert_release(&self, release: NewRelease) -> Result<Release>;

    async fn get_release(&self, id: u64) -> Result<Option<Release>>;

    /// All releases of a document, newest first.
    async fn list_releases(&self, document_id: u64) -> Result<Vec<Release>>;

    async fn active_gray(&self, document_id: u64, environment: &str) -> Result<Option<Release>>;

    /// Move a release from `from` to `to`, optionally inserting a follow-up
    /// release in the same step. `InvalidState` if the release is not in
    /// `from`.
    async fn transition_release(
        &self,
        id: u64,
        from: ReleaseStatus,
        to: ReleaseStatus,
        follow_up: Option<NewRelease>,
    ) -> Result<(Release, Option<Release>)>;

    /// Replace the rule of an active gray release in place.
    async fn update_gray_rule(&self, id: u64, rule: GrayRule) -> Result<Release>;

    async fn put_access_key(&self, key: AccessKey) -> Result<()>;

    async fn get_access_key(&self, access_key: &str) -> Result<Option<AccessKey>>;

    /// Cheap liveness probe used by `/readyz`.
    async fn ping(&self) -> Result<()>;
}

pub(crate) fn new_document(
    id: u64,
    key: &DocumentKey,
    file_type: FileType,
    now: DateTime<Utc>,
) -> Document {
    Document {
        id,
        key: key.clone(),
        file_type,
        current_version: 1,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn new_version(
    document_id: u64,
    number: u64,
    v: NewVersion,
    now: DateTime<Utc>,
) -> Version {
    Version {
        document_id,
        version: number,
        content: v.content,
        content_hash: v.content_hash,
        message: v.message,
        author: v.author,
        created_at: now,
    }
}

pub(crate) fn new_release(id: u64, r: NewRelease, now: DateTime<Utc>) -> Release {
    Release {
        id,
        document_id: r.document_id,
        environment: r.environment,
        version: r.version,
        status: r.status,
        release_type: r.release_type,
        gray_rule: r.gray_rule,
        released_by: r.released_by,
        released_at: now,
        updated_at: now,
    }
}

pub(crate) fn gray_conflict(document_id: u64, environment: &str) -> confighub_lib::Error {
    confighub_lib::Error::Conflict(format!(
        "a gray release is already active for document {} in {}",
        document_id, environment
    ))
}

pub(crate) fn wrong_status(id: u64, actual: ReleaseStatus, expected: ReleaseStatus) -> confighub_lib::Error {
    confighub_lib::Error::InvalidState(format!(
        "release {} is {}, expected {}",
        id, actual, expected
    ))
}
