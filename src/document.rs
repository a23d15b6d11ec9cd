//! Loading of static flag documents (GrowthBook features, Flagsmith environment and bootstrap).
//!
//! Documents are addressed by a path relative to a base that is either an HTTP(S) URL (the
//! front-end's static asset server) or a local directory.

use std::path::PathBuf;

use derive_more::From;
use reqwest::{header, Url};
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// Where flag documents are loaded from.
#[derive(Debug, Clone, PartialEq, Eq, From)]
pub enum DocumentBase {
    /// Documents are served over HTTP(S) below this URL.
    Http(Url),
    /// Documents are files below this directory.
    Directory(PathBuf),
}

impl DocumentBase {
    /// Parse a base location. Strings starting with `http://` or `https://` are URLs, anything else
    /// is a directory path.
    ///
    /// ```
    /// # use flagswitch::DocumentBase;
    /// assert!(matches!(DocumentBase::parse("http://localhost:3000").unwrap(), DocumentBase::Http(_)));
    /// assert!(matches!(DocumentBase::parse("./public").unwrap(), DocumentBase::Directory(_)));
    /// ```
    pub fn parse(base: &str) -> Result<DocumentBase> {
        if base.starts_with("http://") || base.starts_with("https://") {
            Ok(DocumentBase::Http(directory_url(base)?))
        } else {
            Ok(DocumentBase::Directory(PathBuf::from(base)))
        }
    }
}

/// Fetches JSON documents relative to a [`DocumentBase`].
#[derive(Clone)]
pub struct DocumentLoader {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base: DocumentBase,
}

impl DocumentLoader {
    /// Create a loader for `base`.
    pub fn new(base: DocumentBase) -> Self {
        DocumentLoader {
            client: reqwest::Client::new(),
            base,
        }
    }

    /// Load and parse the document at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::DocumentUnavailable`] if the document is missing or the server answers with a
    ///   non-success status.
    /// - [`Error::InvalidDocument`] if the body is not JSON of type `T`.
    /// - [`Error::Network`] for transport errors.
    pub async fn load<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = match &self.base {
            DocumentBase::Http(base) => self.fetch(base, path).await?,
            DocumentBase::Directory(dir) => {
                let file = dir.join(path);
                log::debug!(target: "flagswitch", file:display = file.display(); "reading document");
                tokio::fs::read(&file)
                    .await
                    .map_err(|err| Error::DocumentUnavailable {
                        path: path.to_owned(),
                        reason: err.to_string(),
                    })?
            }
        };

        serde_json::from_slice(&bytes).map_err(|err| {
            log::warn!(target: "flagswitch", path; "document is not valid: {:?}", err);
            Error::InvalidDocument {
                path: path.to_owned(),
                source: err.into(),
            }
        })
    }

    async fn fetch(&self, base: &Url, path: &str) -> Result<Vec<u8>> {
        let url = base.join(path).map_err(Error::InvalidBaseUrl)?;

        log::debug!(target: "flagswitch", url:display = url; "fetching document");
        let response = self
            .client
            .get(url)
            .header(header::CACHE_CONTROL, "no-store")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagswitch", path; "received non-200 response while fetching document: {}", status);
            return Err(Error::DocumentUnavailable {
                path: path.to_owned(),
                reason: format!("HTTP {}", status),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

/// Parse `base` as a URL that relative paths are joined below, adding a trailing slash if needed.
pub(crate) fn directory_url(base: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(Error::InvalidBaseUrl)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{directory_url, DocumentBase, DocumentLoader};
    use crate::Error;

    #[test]
    fn directory_url_keeps_nested_paths() {
        let url = directory_url("http://localhost:3000/static").unwrap();
        assert_eq!(
            url.join("growthbook/features.json").unwrap().as_str(),
            "http://localhost:3000/static/growthbook/features.json"
        );
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            DocumentBase::parse("http://"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[tokio::test]
    async fn reads_documents_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("growthbook")).unwrap();
        std::fs::write(
            dir.path().join("growthbook/features.json"),
            r#"{"new-badge": {"defaultValue": true}}"#,
        )
        .unwrap();

        let loader = DocumentLoader::new(dir.path().to_owned().into());
        let document: Value = loader.load("growthbook/features.json").await.unwrap();

        assert_eq!(document["new-badge"]["defaultValue"], Value::Bool(true));
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DocumentLoader::new(DocumentBase::Directory(dir.path().to_owned()));

        let result = loader.load::<Value>("flagsmith/environment.json").await;

        assert!(matches!(result, Err(Error::DocumentUnavailable { path, .. }) if path == "flagsmith/environment.json"));
    }
}
