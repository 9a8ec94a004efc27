use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod analyze;
mod normalize;

pub use analyze::analyze;
pub use normalize::{normalize, CanonicalUrl};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("url must not be empty")]
    Empty,
    #[error("url is not an absolute http(s) address: {0}")]
    Malformed(String),
    #[error("unsupported url scheme `{0}`; expected http or https")]
    UnsupportedScheme(String),
    #[error("url has no host: {0}")]
    MissingHost(String),
}

/// Transport-level failure while fetching a page.
///
/// Any HTTP response, whatever its status code, is a successful fetch.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("could not connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("failed to read response body from {url}: {message}")]
    Body { url: String, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorKind {
    Unavailable,
    Conflict,
    MissingId,
    Corrupt,
    Query,
}

impl StorageErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Conflict => "conflict",
            Self::MissingId => "missing_id",
            Self::Corrupt => "corrupt",
            Self::Query => "query",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("storage operation `{operation}` failed ({}): {message}", .kind.as_str())]
pub struct StorageError {
    pub operation: &'static str,
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    #[must_use]
    pub fn new(operation: &'static str, kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self { operation, kind, message: message.into() }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind == StorageErrorKind::Conflict
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AddUrlError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AddUrlError {
    #[must_use]
    pub fn notice(&self) -> Notice {
        match self {
            Self::Validation(_) => Notice::invalid_url(),
            Self::Storage(_) => Notice::storage_failed(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CheckError {
    #[error("url {0} not found")]
    NotFound(UrlId),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CheckError {
    #[must_use]
    pub fn notice(&self) -> Notice {
        match self {
            Self::NotFound(_) => Notice::url_not_found(),
            Self::Fetch(_) => Notice::invalid_address(),
            Self::Storage(_) => Notice::storage_failed(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UrlId(pub i64);

impl Display for UrlId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CheckId(pub i64);

impl Display for CheckId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Url {
    pub id: UrlId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageSummary {
    pub title: String,
    pub h1: String,
    pub description: String,
}

/// A check that has been fetched and analyzed but not yet persisted.
///
/// The store assigns the id and the creation timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewCheck {
    pub url_id: UrlId,
    pub status_code: u16,
    pub summary: PageSummary,
}

impl NewCheck {
    #[must_use]
    pub fn new(url_id: UrlId, status_code: u16, summary: PageSummary) -> Self {
        Self { url_id, status_code, summary }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Check {
    pub id: CheckId,
    pub url_id: UrlId,
    pub status_code: u16,
    pub title: String,
    pub h1: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Danger,
}

impl NoticeLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Danger => "danger",
        }
    }
}

/// User-facing outcome message for the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    #[must_use]
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self { level, message: message.into() }
    }

    #[must_use]
    pub fn url_added() -> Self {
        Self::new(NoticeLevel::Success, "Page added successfully")
    }

    #[must_use]
    pub fn url_exists() -> Self {
        Self::new(NoticeLevel::Info, "Page already exists")
    }

    #[must_use]
    pub fn invalid_url() -> Self {
        Self::new(NoticeLevel::Danger, "Incorrect URL")
    }

    #[must_use]
    pub fn page_checked() -> Self {
        Self::new(NoticeLevel::Success, "Page checked successfully")
    }

    #[must_use]
    pub fn invalid_address() -> Self {
        Self::new(NoticeLevel::Danger, "Invalid address")
    }

    #[must_use]
    pub fn url_not_found() -> Self {
        Self::new(NoticeLevel::Warning, "Page not found")
    }

    #[must_use]
    pub fn storage_failed() -> Self {
        Self::new(NoticeLevel::Danger, "Failed to access stored pages")
    }
}

/// Page window over a list ordered most-recent-first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub last_page: u32,
}

impl Pagination {
    /// Clamp `requested_page` into `1..=last_page`; `last_page` is at least 1.
    #[must_use]
    pub fn new(requested_page: u32, per_page: u32, total_items: u64) -> Self {
        let per_page = per_page.max(1);
        let pages = total_items.div_ceil(u64::from(per_page)).max(1);
        let last_page = u32::try_from(pages).unwrap_or(u32::MAX);
        let page = requested_page.clamp(1, last_page);
        Self { page, per_page, total_items, last_page }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        u64::from(self.per_page)
    }

    #[must_use]
    pub fn has_previous(&self) -> bool {
        self.page > 1
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.page < self.last_page
    }
}
