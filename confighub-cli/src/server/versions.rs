use std::sync::Arc;

use confighub_lib::content::parse_tree;
use confighub_lib::{
    content_hash, diff_values, normalize, Change, ChangeEvent, ChangeType, Document, DocumentKey,
    Error, FileType, NewVersion, Result, Version,
};
use tracing::info;

use super::hub::NotificationHub;
use super::metrics::{metrics, timed_write};
use super::store::ConfigStore;

/// Owns document content history: creation, appends, reads, structural
/// diffs and rollback by re-append.
pub struct VersionStore {
    store: Arc<dyn ConfigStore>,
    hub: Arc<NotificationHub>,
}

impl VersionStore {
    pub fn new(store: Arc<dyn ConfigStore>, hub: Arc<NotificationHub>) -> Self {
        Self { store, hub }
    }

    fn notify(&self, document_id: u64, version: u64, change_type: ChangeType) {
        self.hub.publish(ChangeEvent {
            document_id,
            version,
            change_type,
        });
    }

    pub async fn create(
        &self,
        key: &DocumentKey,
        file_type: FileType,
        content: &str,
        message: &str,
        author: &str,
    ) -> Result<(Document, Version)> {
        if key.name.is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        let content = normalize(file_type, content)?;
        let first = NewVersion {
            content_hash: content_hash(&content),
            content,
            message: message.to_string(),
            author: author.to_string(),
        };

        let (document, version) =
            timed_write("create", self.store.create_document(key, file_type, first)).await?;
        metrics().version_appends.with_label_values(&["create"]).inc();
        info!(document = document.id, key = %document.key, "document created");

        self.notify(document.id, version.version, ChangeType::Create);
        Ok((document, version))
    }

    pub async fn document(&self, id: u64) -> Result<Document> {
        self.store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))
    }

    pub async fn find(&self, key: &DocumentKey) -> Result<Document> {
        self.store
            .find_document(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", key)))
    }

    pub async fn append(
        &self,
        document_id: u64,
        content: &str,
        message: &str,
        author: &str,
    ) -> Result<Version> {
        let document = self.document(document_id).await?;
        let content = normalize(document.file_type, content)?;
        let version = self
            .append_raw(document_id, content, message.to_string(), author, "update")
            .await?;
        self.notify(document_id, version.version, ChangeType::Update);
        Ok(version)
    }

    async fn append_raw(
        &self,
        document_id: u64,
        content: String,
        message: String,
        author: &str,
        kind: &str,
    ) -> Result<Version> {
        let next = NewVersion {
            content_hash: content_hash(&content),
            content,
            message,
            author: author.to_string(),
        };
        let version = timed_write("append", self.store.append_version(document_id, next)).await?;
        metrics().version_appends.with_label_values(&[kind]).inc();
        info!(
            document = document_id,
            version = version.version,
            commit = version.commit_hash(),
            kind,
            "version appended"
        );
        Ok(version)
    }

    pub async fn get_by_version(&self, document_id: u64, version: u64) -> Result<Version> {
        self.store
            .get_version(document_id, version)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("version {} of document {}", version, document_id))
            })
    }

    pub async fn latest(&self, document_id: u64) -> Result<Version> {
        let document = self.document(document_id).await?;
        self.get_by_version(document_id, document.current_version).await
    }

    pub async fn list(&self, document_id: u64) -> Result<Vec<Version>> {
        self.document(document_id).await?;
        self.store.list_versions(document_id).await
    }

    /// Structural changes turning version `from` into version `to`.
    pub async fn diff(&self, document_id: u64, from: u64, to: u64) -> Result<Vec<Change>> {
        let document = self.document(document_id).await?;
        if document.file_type == FileType::Protobuf {
            return Err(Error::Validation(
                "structural diff is not available for protobuf documents".into(),
            ));
        }
        let old = self.get_by_version(document_id, from).await?;
        let new = self.get_by_version(document_id, to).await?;
        Ok(diff_values(
            &parse_tree(&old.content)?,
            &parse_tree(&new.content)?,
        ))
    }

    /// Re-append the content of `target` as the next version. History is
    /// never rewritten.
    pub async fn rollback(&self, document_id: u64, target: u64, author: &str) -> Result<Version> {
        let source = self.get_by_version(document_id, target).await?;
        let version = self
            .append_raw(
                document_id,
                source.content,
                format!("rollback to version {}", target),
                author,
                "rollback",
            )
            .await?;
        self.notify(document_id, version.version, ChangeType::Rollback);
        Ok(version)
    }

    /// Remove a document with its versions and releases.
    pub async fn delete(&self, document_id: u64) -> Result<()> {
        let document = self.document(document_id).await?;
        timed_write("delete", self.store.delete_document(document_id)).await?;
        info!(document = document_id, key = %document.key, "document deleted");
        self.notify(document_id, document.current_version, ChangeType::Delete);
        Ok(())
    }
}
