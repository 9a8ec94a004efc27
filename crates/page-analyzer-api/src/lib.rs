use std::path::{Path, PathBuf};

use page_analyzer_core::{
    analyze, normalize, AddUrlError, CanonicalUrl, Check, CheckError, NewCheck, Notice, Pagination,
    StorageError, StorageErrorKind, Url, UrlId,
};
use page_analyzer_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

mod fetch;
#[cfg(test)]
mod mock_http;

pub use fetch::{FetchConfig, FetchedPage, PageFetcher};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Result of submitting an address: either a new row or the existing one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AddUrlOutcome {
    Created { url: Url },
    AlreadyExists { url: Url },
}

impl AddUrlOutcome {
    #[must_use]
    pub fn url(&self) -> &Url {
        match self {
            Self::Created { url } | Self::AlreadyExists { url } => url,
        }
    }

    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    #[must_use]
    pub fn notice(&self) -> Notice {
        match self {
            Self::Created { .. } => Notice::url_added(),
            Self::AlreadyExists { .. } => Notice::url_exists(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlListItem {
    pub url: Url,
    pub latest_check: Option<Check>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlListing {
    pub urls: Vec<UrlListItem>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlDetail {
    pub url: Url,
    /// Newest first.
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOutcome {
    pub check: Check,
    pub notice: Notice,
}

/// Entry point shared by the service and the CLI.
///
/// Each operation opens its own connection from `db_path` and brings the
/// schema up to date before touching data.
#[derive(Debug, Clone)]
pub struct PageAnalyzerApi {
    db_path: PathBuf,
    fetcher: PageFetcher,
}

impl PageAnalyzerApi {
    #[must_use]
    pub fn new(db_path: PathBuf, fetcher: PageFetcher) -> Self {
        Self { db_path, fetcher }
    }

    fn open_store(&self) -> StoreResult<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_ready_store(&self) -> StoreResult<SqliteStore> {
        open_ready_store(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the database cannot be opened or queried.
    pub fn schema_status(&self) -> StoreResult<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> StoreResult<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        if !planned_versions.is_empty() {
            info!(
                from_version = before.current_version,
                to_version = after.current_version,
                "database migrated"
            );
        }
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run `SQLite` health probes.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when a probe query fails.
    pub fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Cheap liveness probe against the database.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the database cannot be opened or read.
    pub fn health(&self) -> StoreResult<SchemaStatus> {
        self.schema_status()
    }

    /// Normalize `raw`, then store it unless an equal address already exists.
    ///
    /// # Errors
    /// Returns [`AddUrlError::Validation`] for unusable input and
    /// [`AddUrlError::Storage`] when the store fails.
    pub fn add_url(&self, raw: &str) -> Result<AddUrlOutcome, AddUrlError> {
        let canonical = match normalize(raw) {
            Ok(canonical) => canonical,
            Err(err) => {
                debug!(input = raw, error = %err, "rejected url");
                return Err(err.into());
            }
        };

        let store = self.open_ready_store()?;
        if let Some(url) = store.find_url_by_name(canonical.as_str())? {
            debug!(url_id = %url.id, name = %url.name, "url already stored");
            return Ok(AddUrlOutcome::AlreadyExists { url });
        }

        save_or_existing(&store, &canonical)
    }

    /// One page of stored URLs, most recent first, each with its latest check.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the store fails.
    pub fn list_urls(&self, page: u32, per_page: u32) -> StoreResult<UrlListing> {
        let store = self.open_ready_store()?;
        let pagination = Pagination::new(page, per_page, store.count_urls()?);
        let urls = store.list_urls_page(pagination.offset(), pagination.limit())?;
        let mut latest = store.latest_check_per_url()?;

        let urls = urls
            .into_iter()
            .map(|url| {
                let latest_check = latest.remove(&url.id);
                UrlListItem { url, latest_check }
            })
            .collect();
        Ok(UrlListing { urls, pagination })
    }

    /// A stored URL with its full check history, or `None` when absent.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the store fails.
    pub fn url_detail(&self, url_id: UrlId) -> StoreResult<Option<UrlDetail>> {
        let store = self.open_ready_store()?;
        let Some(url) = store.find_url_by_id(url_id)? else {
            return Ok(None);
        };
        let checks = store.all_checks_for_url(url_id)?;
        Ok(Some(UrlDetail { url, checks }))
    }

    /// Remove a URL and its checks. Returns whether it existed.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the store fails.
    pub fn delete_url(&self, url_id: UrlId) -> StoreResult<bool> {
        let store = self.open_ready_store()?;
        let removed = store.delete_url(url_id)?;
        if removed {
            info!(url_id = %url_id, "url deleted");
        }
        Ok(removed)
    }

    /// Fetch the stored page, analyze it, and record a check.
    ///
    /// Nothing is written unless the fetch succeeds. No store connection is
    /// held while the request is in flight.
    ///
    /// # Errors
    /// Returns [`CheckError::NotFound`] for an unknown id, [`CheckError::Fetch`]
    /// for transport failures, and [`CheckError::Storage`] when the store fails.
    pub async fn perform_check(&self, url_id: UrlId) -> Result<CheckOutcome, CheckError> {
        debug!(url_id = %url_id, state = "started", "check started");
        let url = self
            .blocking("find_url_by_id", move |store| store.find_url_by_id(url_id))
            .await?
            .ok_or(CheckError::NotFound(url_id))?;

        let page = match self.fetcher.fetch(&url.name).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url_id = %url_id, name = %url.name, error = %err, state = "failed", "check fetch failed");
                return Err(err.into());
            }
        };
        debug!(url_id = %url_id, status_code = page.status, state = "fetched", "page fetched");

        let summary = analyze(&page.body);
        debug!(url_id = %url_id, state = "analyzed", "page analyzed");

        let new_check = NewCheck::new(url_id, page.status, summary);
        let check = match self.blocking("save_check", move |store| store.save_check(&new_check)).await
        {
            Ok(check) => check,
            Err(err) => {
                error!(url_id = %url_id, error = %err, state = "failed", "failed to record check");
                return Err(err.into());
            }
        };

        info!(
            url_id = %url_id,
            check_id = %check.id,
            status_code = check.status_code,
            state = "recorded",
            "check recorded"
        );
        Ok(CheckOutcome { check, notice: Notice::page_checked() })
    }

    async fn blocking<T, F>(&self, operation: &'static str, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let store = open_ready_store(&db_path)?;
            work(&store)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(StorageError::new(
                operation,
                StorageErrorKind::Unavailable,
                format!("store task did not complete: {err}"),
            )),
        }
    }
}

/// Insert `canonical`, resolving a uniqueness conflict to the row that won.
fn save_or_existing(
    store: &SqliteStore,
    canonical: &CanonicalUrl,
) -> Result<AddUrlOutcome, AddUrlError> {
    match store.save_url(canonical) {
        Ok(url) => {
            info!(url_id = %url.id, name = %url.name, "url added");
            Ok(AddUrlOutcome::Created { url })
        }
        // Lost a race with a concurrent insert of the same name.
        Err(err) if err.is_conflict() => match store.find_url_by_name(canonical.as_str())? {
            Some(url) => {
                debug!(url_id = %url.id, name = %url.name, "url stored concurrently");
                Ok(AddUrlOutcome::AlreadyExists { url })
            }
            None => Err(err.into()),
        },
        Err(err) => {
            error!(name = %canonical, error = %err, "failed to store url");
            Err(err.into())
        }
    }
}

fn open_ready_store(db_path: &Path) -> StoreResult<SqliteStore> {
    let mut store = SqliteStore::open(db_path)?;
    store.migrate()?;
    Ok(store)
}
