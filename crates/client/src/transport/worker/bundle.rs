//! Filesystem bundles staged into the interpreter before the entry script runs.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashwire_shared::{ProtocolError, TransportError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
#[cfg(target_arch = "wasm32")]
use url::Url;

use crate::config::resolve_url;

/// Content of one staged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    /// Wire form used by the worker protocol; binary content travels as base64.
    pub fn to_json(&self) -> Value {
        match self {
            FileContent::Text(content) => json!({"type": "text", "content": content}),
            FileContent::Binary(bytes) => {
                json!({"type": "binary", "content": BASE64.encode(bytes)})
            }
        }
    }
}

/// `{ "entrypoint": "app.py", "files": { path: { "type": "text"|"binary", "content": ... } } }`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FsBundle {
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, BundleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BundleEntry {
    Text { content: String },
    /// Base64 encoded.
    Binary { content: String },
}

impl FsBundle {
    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| invalid_bundle(e.to_string()))
    }

    /// Decode every entry, failing on the first bad base64 payload.
    pub fn into_files(self) -> Result<BTreeMap<String, FileContent>, TransportError> {
        self.files
            .into_iter()
            .map(|(path, entry)| {
                let content = match entry {
                    BundleEntry::Text { content } => FileContent::Text(content),
                    BundleEntry::Binary { content } => {
                        let bytes = BASE64
                            .decode(content.as_bytes())
                            .map_err(|e| invalid_bundle(format!("{path}: {e}")))?;
                        FileContent::Binary(bytes)
                    }
                };
                Ok((path, content))
            })
            .collect()
    }
}

fn invalid_bundle(reason: String) -> TransportError {
    TransportError::Protocol(ProtocolError::InvalidPayload {
        kind: "fs_bundle".to_string(),
        reason,
    })
}

/// Download a bundle. In the browser a relative `url` is resolved against the
/// page; elsewhere it must be absolute.
pub async fn fetch_bundle(url: &str) -> Result<FsBundle, TransportError> {
    let url = absolute_bundle_url(url)?;
    let resp = Client::new()
        .get(&url)
        .send()
        .await
        .map_err(|e| TransportError::channel(format!("fetching bundle {url}: {e}")))?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| TransportError::channel(format!("failed to read bundle body: {e}")))?;

    if !status.is_success() {
        return Err(TransportError::channel(format!(
            "fetching bundle {url}: HTTP {}",
            status.as_u16()
        )));
    }

    FsBundle::from_json(&text)
}

#[cfg(target_arch = "wasm32")]
fn absolute_bundle_url(url: &str) -> Result<String, TransportError> {
    let page = Url::parse(&crate::config::page_href())
        .map_err(|e| TransportError::InvalidConfig(format!("page url: {e}")))?;
    resolve_url(url, Some(&page))
}

#[cfg(not(target_arch = "wasm32"))]
fn absolute_bundle_url(url: &str) -> Result<String, TransportError> {
    resolve_url(url, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_and_binary_entries() {
        let bundle = FsBundle::from_json(
            r#"{
                "entrypoint": "main.py",
                "files": {
                    "main.py": {"type": "text", "content": "print('hi')"},
                    "data/logo.png": {"type": "binary", "content": "iVBORw=="}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(bundle.entrypoint.as_deref(), Some("main.py"));

        let files = bundle.into_files().unwrap();
        assert_eq!(files["main.py"], FileContent::Text("print('hi')".into()));
        assert_eq!(
            files["data/logo.png"],
            FileContent::Binary(vec![0x89, 0x50, 0x4e, 0x47])
        );
    }

    #[test]
    fn bad_base64_names_the_file() {
        let bundle = FsBundle::from_json(
            r#"{"files": {"blob.bin": {"type": "binary", "content": "***"}}}"#,
        )
        .unwrap();
        let err = bundle.into_files().unwrap_err();
        assert!(err.to_string().contains("blob.bin"), "{err}");
    }

    #[test]
    fn unknown_entry_type_is_rejected() {
        let err = FsBundle::from_json(r#"{"files": {"a": {"type": "symlink", "content": "b"}}}"#)
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn binary_content_round_trips_to_wire_form() {
        let wire = FileContent::Binary(vec![1, 2, 3]).to_json();
        assert_eq!(wire, json!({"type": "binary", "content": "AQID"}));
    }
}
