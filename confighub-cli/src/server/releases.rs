use std::sync::Arc;

use confighub_lib::{
    ChangeEvent, ChangeType, Document, Error, GrayRule, NewRelease, Release, ReleaseStatus,
    ReleaseType, Result,
};
use tracing::{debug, info};

use super::hub::NotificationHub;
use super::metrics::{metrics, timed_write};
use super::store::ConfigStore;

async fn load_document(store: &dyn ConfigStore, id: u64) -> Result<Document> {
    store
        .get_document(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("document {}", id)))
}

async fn load_release(store: &dyn ConfigStore, id: u64) -> Result<Release> {
    store
        .get_release(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("release {}", id)))
}

/// The version a document is pinned to in `environment` before any gray
/// rule applies: the newest full release still in `released`, or the
/// document's current version when nothing was ever released.
async fn base_version(store: &dyn ConfigStore, document: &Document, environment: &str) -> Result<u64> {
    let releases = store.list_releases(document.id).await?;
    Ok(releases
        .iter()
        .find(|r| {
            r.environment == environment
                && r.release_type == ReleaseType::Full
                && r.status == ReleaseStatus::Released
        })
        .map(|r| r.version)
        .unwrap_or(document.current_version))
}

/// Pick the requested version, or the current one, and make sure it exists.
async fn target_version(
    store: &dyn ConfigStore,
    document: &Document,
    requested: Option<u64>,
) -> Result<u64> {
    let version = requested.unwrap_or(document.current_version);
    if store.get_version(document.id, version).await?.is_none() {
        return Err(Error::NotFound(format!(
            "version {} of document {}",
            version, document.id
        )));
    }
    Ok(version)
}

fn environment_or_default<'a>(requested: Option<&'a str>, document: &'a Document) -> &'a str {
    match requested.map(str::trim) {
        Some(env) if !env.is_empty() => env,
        _ => &document.key.environment,
    }
}

/// Full releases and rollback by pointer.
pub struct ReleaseTracker {
    store: Arc<dyn ConfigStore>,
    hub: Arc<NotificationHub>,
}

impl ReleaseTracker {
    pub fn new(store: Arc<dyn ConfigStore>, hub: Arc<NotificationHub>) -> Self {
        Self { store, hub }
    }

    pub async fn release(
        &self,
        document_id: u64,
        environment: Option<&str>,
        version: Option<u64>,
        author: &str,
    ) -> Result<Release> {
        let document = load_document(self.store.as_ref(), document_id).await?;
        let environment = environment_or_default(environment, &document);
        let version = target_version(self.store.as_ref(), &document, version).await?;

        let release = timed_write(
            "release",
            self.store
                .insert_release(NewRelease::full(document_id, environment, version, author)),
        )
        .await?;
        metrics().releases_total.with_label_values(&["full"]).inc();
        info!(
            release = release.id,
            document = document_id,
            environment,
            version,
            "full release"
        );

        self.hub.publish(ChangeEvent {
            document_id,
            version,
            change_type: ChangeType::Release,
        });
        Ok(release)
    }

    /// Retire a full release and point the environment back at the newest
    /// earlier one. Returns the new release.
    pub async fn rollback_release(&self, release_id: u64, author: &str) -> Result<Release> {
        let current = load_release(self.store.as_ref(), release_id).await?;
        if current.status != ReleaseStatus::Released {
            return Err(Error::InvalidState(format!(
                "release {} is {}, only released releases can be rolled back",
                release_id, current.status
            )));
        }
        let previous = self
            .store
            .list_releases(current.document_id)
            .await?
            .into_iter()
            .find(|r| {
                r.id < current.id
                    && r.environment == current.environment
                    && r.release_type == ReleaseType::Full
                    && r.status == ReleaseStatus::Released
            })
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "no earlier release of document {} in {} to roll back to",
                    current.document_id, current.environment
                ))
            })?;

        let (_, restored) = timed_write(
            "release",
            self.store.transition_release(
                release_id,
                ReleaseStatus::Released,
                ReleaseStatus::Rollback,
                Some(NewRelease::full(
                    current.document_id,
                    &current.environment,
                    previous.version,
                    author,
                )),
            ),
        )
        .await?;
        let restored =
            restored.ok_or_else(|| Error::Internal("rollback did not create a release".into()))?;

        metrics().releases_total.with_label_values(&["rollback"]).inc();
        info!(
            release = release_id,
            document = current.document_id,
            environment = %current.environment,
            version = previous.version,
            "release rolled back"
        );
        self.hub.publish(ChangeEvent {
            document_id: current.document_id,
            version: previous.version,
            change_type: ChangeType::ReleaseRollback,
        });
        Ok(restored)
    }

    pub async fn list(&self, document_id: u64) -> Result<Vec<Release>> {
        load_document(self.store.as_ref(), document_id).await?;
        self.store.list_releases(document_id).await
    }

    pub async fn get(&self, release_id: u64) -> Result<Release> {
        load_release(self.store.as_ref(), release_id).await
    }
}

/// Gray releases: creation, per-caller resolution, promotion, cancellation
/// and percentage ramps.
pub struct GrayReleaseEngine {
    store: Arc<dyn ConfigStore>,
    hub: Arc<NotificationHub>,
}

impl GrayReleaseEngine {
    pub fn new(store: Arc<dyn ConfigStore>, hub: Arc<NotificationHub>) -> Self {
        Self { store, hub }
    }

    fn notify(&self, release: &Release, change_type: ChangeType) {
        self.hub.publish(ChangeEvent {
            document_id: release.document_id,
            version: release.version,
            change_type,
        });
    }

    pub async fn create_gray(
        &self,
        document_id: u64,
        environment: Option<&str>,
        version: Option<u64>,
        rule: GrayRule,
        author: &str,
    ) -> Result<Release> {
        rule.validate()?;
        let document = load_document(self.store.as_ref(), document_id).await?;
        let environment = environment_or_default(environment, &document);
        let version = target_version(self.store.as_ref(), &document, version).await?;

        // The store claims the per-environment gray slot atomically.
        let release = timed_write(
            "release",
            self.store.insert_release(NewRelease::gray(
                document_id,
                environment,
                version,
                rule,
                author,
            )),
        )
        .await?;
        metrics().releases_total.with_label_values(&["gray"]).inc();
        info!(
            release = release.id,
            document = document_id,
            environment,
            version,
            "gray release started"
        );
        self.notify(&release, ChangeType::Gray);
        Ok(release)
    }

    /// The version `caller_id` should see for a document in `environment`.
    pub async fn resolve(
        &self,
        document_id: u64,
        environment: &str,
        caller_id: &str,
        caller_ip: Option<&str>,
    ) -> Result<u64> {
        let document = load_document(self.store.as_ref(), document_id).await?;
        let base = base_version(self.store.as_ref(), &document, environment).await?;

        let Some(gray) = self.store.active_gray(document_id, environment).await? else {
            return Ok(base);
        };
        let inside = gray
            .gray_rule
            .as_ref()
            .is_some_and(|rule| rule.matches(gray.id, caller_id, caller_ip));
        metrics()
            .gray_resolutions
            .with_label_values(&[if inside { "in" } else { "out" }])
            .inc();
        debug!(
            release = gray.id,
            caller = caller_id,
            inside,
            "gray resolution"
        );
        Ok(if inside { gray.version } else { base })
    }

    /// Make a gray release the full release for its environment. Returns
    /// the new full release.
    pub async fn promote(&self, release_id: u64, author: &str) -> Result<Release> {
        let gray = load_release(self.store.as_ref(), release_id).await?;
        let (_, full) = timed_write(
            "release",
            self.store.transition_release(
                release_id,
                ReleaseStatus::Gray,
                ReleaseStatus::Promoted,
                Some(NewRelease::full(
                    gray.document_id,
                    &gray.environment,
                    gray.version,
                    author,
                )),
            ),
        )
        .await?;
        let full = full.ok_or_else(|| Error::Internal("promotion did not create a release".into()))?;

        metrics().releases_total.with_label_values(&["promote"]).inc();
        info!(release = release_id, full_release = full.id, "gray release promoted");
        self.notify(&full, ChangeType::Promote);
        Ok(full)
    }

    pub async fn cancel(&self, release_id: u64) -> Result<Release> {
        let (cancelled, _) = timed_write(
            "release",
            self.store.transition_release(
                release_id,
                ReleaseStatus::Gray,
                ReleaseStatus::Cancelled,
                None,
            ),
        )
        .await?;
        metrics().releases_total.with_label_values(&["cancel"]).inc();
        info!(release = release_id, "gray release cancelled");
        self.notify(&cancelled, ChangeType::Cancel);
        Ok(cancelled)
    }

    /// Ramp a percentage rule up or down in place. Callers already in stay
    /// in when the percentage grows.
    pub async fn update_percentage(&self, release_id: u64, percentage: u32) -> Result<Release> {
        let release = load_release(self.store.as_ref(), release_id).await?;
        if !release.is_active_gray() {
            return Err(Error::InvalidState(format!(
                "release {} is {}, expected gray",
                release_id, release.status
            )));
        }
        if !matches!(release.gray_rule, Some(GrayRule::Percentage { .. })) {
            return Err(Error::Validation(format!(
                "release {} does not use a percentage rule",
                release_id
            )));
        }
        let rule = GrayRule::Percentage { percentage };
        rule.validate()?;

        let updated = timed_write("release", self.store.update_gray_rule(release_id, rule)).await?;
        metrics().releases_total.with_label_values(&["gray_update"]).inc();
        info!(release = release_id, percentage, "gray percentage updated");
        self.notify(&updated, ChangeType::GrayUpdate);
        Ok(updated)
    }
}
