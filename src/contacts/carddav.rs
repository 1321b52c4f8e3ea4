//! Directory sync boundary and its CardDAV implementation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Method, StatusCode};
use tracing::debug;
use url::Url;

use super::cache::RECORD_EXTENSION;
use super::ContactsError;

/// One entry of the remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Directory entry id.
    pub id: String,
    /// Remote modification tag. `None` forces a re-fetch.
    pub modified: Option<DateTime<Utc>>,
}

/// The two operations the resolver needs from a directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Lightweight listing of entry ids with modification tags.
    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, ContactsError>;

    /// Full raw record of one entry.
    async fn fetch_entry(&self, id: &str) -> Result<String, ContactsError>;
}

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:getlastmodified/>
    <d:getetag/>
  </d:prop>
</d:propfind>"#;

/// CardDAV address book client.
pub struct CardDavClient {
    client: reqwest::Client,
    url: Url,
    username: String,
    password: String,
    hrefs: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for CardDavClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardDavClient")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl CardDavClient {
    /// Client for the address book at `url`.
    ///
    /// # Errors
    ///
    /// [`ContactsError::Protocol`] if `url` does not parse.
    pub fn new(url: &str, username: &str, password: &str) -> Result<Self, ContactsError> {
        let url = Url::parse(url)
            .map_err(|e| ContactsError::Protocol(format!("invalid address book URL: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            username: username.to_owned(),
            password: password.to_owned(),
            hrefs: Mutex::new(HashMap::new()),
        })
    }

    fn entry_url(&self, id: &str) -> Result<Url, ContactsError> {
        let remembered = self
            .hrefs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        let target = remembered.unwrap_or_else(|| format!("{id}.{RECORD_EXTENSION}"));
        self.url
            .join(&target)
            .map_err(|e| ContactsError::Protocol(format!("invalid entry href {target}: {e}")))
    }
}

#[async_trait]
impl DirectoryClient for CardDavClient {
    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, ContactsError> {
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|e| ContactsError::Protocol(e.to_string()))?;
        let response = self
            .client
            .request(method, self.url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header("Depth", "1")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(ContactsError::Protocol(format!(
                "listing answered HTTP {status}"
            )));
        }
        let body = response.text().await?;

        let listed = parse_multistatus(&body);
        debug!(entries = listed.len(), "directory listing fetched");
        let mut hrefs = self.hrefs.lock().unwrap_or_else(PoisonError::into_inner);
        hrefs.clear();
        let entries = listed
            .into_iter()
            .map(|item| {
                hrefs.insert(item.entry.id.clone(), item.href);
                item.entry
            })
            .collect();
        Ok(entries)
    }

    async fn fetch_entry(&self, id: &str) -> Result<String, ContactsError> {
        let url = self.entry_url(id)?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ContactsError::Protocol(format!(
                "fetching {id} answered HTTP {status}"
            )));
        }
        Ok(response.text().await?)
    }
}

/// A listing entry together with the href it was found at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Id and modification tag.
    pub entry: RemoteEntry,
    /// Href as returned by the server.
    pub href: String,
}

/// Extract card entries from a `207 Multi-Status` body.
///
/// Only hrefs ending in `.vcf` are kept; the collection itself and any
/// other resources are skipped.
pub fn parse_multistatus(body: &str) -> Vec<ListedEntry> {
    let (Ok(response_re), Ok(href_re), Ok(modified_re)) = (
        Regex::new(r"(?is)<(?:[a-z0-9]+:)?response\b.*?</(?:[a-z0-9]+:)?response>"),
        Regex::new(r"(?is)<(?:[a-z0-9]+:)?href\s*>\s*(.*?)\s*</(?:[a-z0-9]+:)?href>"),
        Regex::new(
            r"(?is)<(?:[a-z0-9]+:)?getlastmodified\s*>\s*(.*?)\s*</(?:[a-z0-9]+:)?getlastmodified>",
        ),
    ) else {
        return Vec::new();
    };

    response_re
        .find_iter(body)
        .filter_map(|block| {
            let block = block.as_str();
            let href = href_re.captures(block)?.get(1)?.as_str().to_owned();
            let id = entry_id(&href)?;
            let modified = modified_re
                .captures(block)
                .and_then(|c| c.get(1))
                .and_then(|m| DateTime::parse_from_rfc2822(m.as_str()).ok())
                .map(|dt| dt.with_timezone(&Utc));
            Some(ListedEntry {
                entry: RemoteEntry { id, modified },
                href,
            })
        })
        .collect()
}

/// File stem of a `.vcf` href.
fn entry_id(href: &str) -> Option<String> {
    let name = href.trim_end_matches('/').rsplit('/').next()?;
    let stem = name.strip_suffix(&format!(".{RECORD_EXTENSION}"))?;
    (!stem.is_empty()).then(|| stem.to_owned())
}
