//! HTTP client for the collaborator API.
//!
//! | Call | Endpoint |
//! |------|----------|
//! | [`CollaboratorApi::fetch_document`] | `GET /documents/{id}` |
//! | [`CollaboratorApi::persist_content`] | `PATCH /documents/{id}` |
//! | [`CollaboratorApi::create_version`] | `POST /documents/{id}/version` |
//! | [`CollaboratorApi::list_versions`] | `GET /documents/{id}/versions` |
//! | [`CollaboratorApi::rollback`] | `POST /documents/{id}/rollback/{versionId}` |
//! | [`CollaboratorApi::upload_file`] | `POST /files/upload` |
//! | [`CollaboratorApi::signed_url`] | `GET /files/signed-url?key=` |
//!
//! Every request carries the session's bearer token.

use chrono::{DateTime, Utc};
use inkpad_core::DocumentId;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::auth::AuthSession;
use crate::config::ClientConfig;
use crate::error::PersistenceError;
use crate::snapshot::{RestoredContent, VersionSnapshot};

/// Binary document state as the API transports it: a JSON integer array,
/// a Node `Buffer` object, or `null` for a document that has none yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WireBytes(pub Vec<u8>);

impl WireBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for WireBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Array(Vec<u8>),
            Buffer { data: Vec<u8> },
        }

        Ok(match Option::<Repr>::deserialize(deserializer)? {
            Some(Repr::Array(bytes)) | Some(Repr::Buffer { data: bytes }) => WireBytes(bytes),
            None => WireBytes::default(),
        })
    }
}

/// Server-side document metadata plus its persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    #[serde(deserialize_with = "crate::snapshot::string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: WireBytes,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<Value>,
    #[serde(default)]
    pub updated_by: Option<Value>,
    #[serde(default)]
    pub versions: Vec<VersionSnapshot>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct UploadResponse {
    key: String,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    url: String,
}

pub(crate) fn http_client(config: &ClientConfig) -> Result<Client, PersistenceError> {
    Ok(Client::builder().timeout(config.request_timeout()).build()?)
}

/// Map a non-2xx response to [`PersistenceError::Rejected`], preferring the
/// server's `{message}` body.
pub(crate) async fn check_status(call: &str, response: Response) -> Result<Response, PersistenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.to_string()
            } else {
                body
            }
        });
    log::error!("{call} failed with {status}: {message}");
    Err(PersistenceError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Authenticated collaborator API client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CollaboratorApi {
    http: Client,
    config: ClientConfig,
    session: AuthSession,
}

impl CollaboratorApi {
    pub fn new(config: &ClientConfig, session: AuthSession) -> Result<Self, PersistenceError> {
        Ok(Self {
            http: http_client(config)?,
            config: config.clone(),
            session,
        })
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(AUTHORIZATION, self.session.bearer())
    }

    fn document_url(&self, doc_id: &DocumentId, suffix: &str) -> String {
        self.config
            .api_url(&format!("/documents/{}{suffix}", doc_id.as_str()))
    }

    pub async fn fetch_document(&self, doc_id: &DocumentId) -> Result<DocumentRecord, PersistenceError> {
        let response = self
            .authorized(self.http.get(self.document_url(doc_id, "")))
            .send()
            .await?;
        let record: DocumentRecord = check_status("fetch document", response).await?.json().await?;
        log::debug!(
            "fetched document {doc_id} ({} state bytes, {} versions)",
            record.content.0.len(),
            record.versions.len()
        );
        Ok(record)
    }

    /// Store a full encoded state as the document's content.
    pub async fn persist_content(&self, doc_id: &DocumentId, state: &[u8]) -> Result<(), PersistenceError> {
        let response = self
            .authorized(self.http.patch(self.document_url(doc_id, "")))
            .json(&serde_json::json!({ "content": state }))
            .send()
            .await?;
        check_status("persist content", response).await?;
        log::info!("persisted {} state bytes for document {doc_id}", state.len());
        Ok(())
    }

    pub async fn create_version(
        &self,
        doc_id: &DocumentId,
        content: &Value,
    ) -> Result<VersionSnapshot, PersistenceError> {
        let response = self
            .authorized(self.http.post(self.document_url(doc_id, "/version")))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        Ok(check_status("create version", response).await?.json().await?)
    }

    pub async fn list_versions(&self, doc_id: &DocumentId) -> Result<Vec<VersionSnapshot>, PersistenceError> {
        let response = self
            .authorized(self.http.get(self.document_url(doc_id, "/versions")))
            .send()
            .await?;
        Ok(check_status("list versions", response).await?.json().await?)
    }

    pub async fn rollback(
        &self,
        doc_id: &DocumentId,
        version_id: &str,
    ) -> Result<RestoredContent, PersistenceError> {
        let url = self.document_url(doc_id, &format!("/rollback/{version_id}"));
        let response = self
            .authorized(self.http.post(url))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Ok(check_status("rollback", response).await?.json().await?)
    }

    /// Multipart upload; returns the storage key.
    pub async fn upload_file(
        &self,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<String, PersistenceError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)?;
        let response = self
            .authorized(self.http.post(self.config.api_url("/files/upload")))
            .multipart(Form::new().part("file", part))
            .send()
            .await?;
        let body: UploadResponse = check_status("upload file", response).await?.json().await?;
        log::debug!("uploaded {file_name} as {}", body.key);
        Ok(body.key)
    }

    /// Resolve a storage key to a fetchable URL.
    pub async fn signed_url(&self, key: &str) -> Result<String, PersistenceError> {
        let response = self
            .authorized(self.http.get(self.config.api_url("/files/signed-url")))
            .query(&[("key", key)])
            .send()
            .await?;
        let body: SignedUrlResponse = check_status("signed url", response).await?.json().await?;
        if body.url.is_empty() {
            return Err(PersistenceError::InvalidResponse("empty signed url".into()));
        }
        Ok(body.url)
    }
}
