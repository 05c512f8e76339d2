use std::fmt;

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::{digest::Digest, storage::StoreError};

/// What a `NotFound` was looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unknown {
    Blob(String),
    Manifest { repository: String, reference: String },
    Upload(String),
    Repository(String),
}

impl fmt::Display for Unknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blob(digest) => write!(f, "blob {digest} unknown to registry"),
            Self::Manifest {
                repository,
                reference,
            } => write!(f, "manifest {repository}:{reference} unknown to registry"),
            Self::Upload(id) => write!(f, "blob upload {id} unknown to registry"),
            Self::Repository(name) => write!(f, "repository {name} not known to registry"),
        }
    }
}

/// Why a manifest was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestProblem {
    #[error("malformed manifest: {0}")]
    Malformed(String),
    #[error("unsupported manifest media type {0:?}")]
    UnsupportedMediaType(String),
    #[error("manifest declares media type {declared:?} but was sent as {content_type:?}")]
    MediaTypeMismatch {
        declared: String,
        content_type: String,
    },
    #[error("referenced blob {0} is not present")]
    BlobUnknown(Digest),
    #[error("referenced manifest {0} is not present in this repository")]
    ManifestUnknown(Digest),
    #[error("descriptor for {digest} declares {declared} bytes but it has {actual}")]
    SizeMismatch {
        digest: Digest,
        declared: u64,
        actual: u64,
    },
    #[error("manifest of {0} bytes exceeds the size limit")]
    TooLarge(u64),
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    #[error("invalid repository name {0:?}")]
    InvalidName(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    NotFound(Unknown),
    #[error("digest mismatch: expected {expected}, content hashes to {actual}")]
    DigestMismatch { expected: String, actual: Digest },
    #[error("manifest invalid: {0}")]
    ManifestInvalid(ManifestProblem),
    #[error("quota exceeded for project {project}: {requested} bytes requested, {used} of {limit} used")]
    QuotaExceeded {
        project: String,
        requested: u64,
        used: u64,
        limit: u64,
    },
    #[error("upload {upload_id} expects offset {expected}, chunk starts at {received}")]
    UploadOutOfOrder {
        repository: String,
        upload_id: String,
        expected: u64,
        received: u64,
    },
    #[error("upload {0} expired")]
    UploadExpired(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable")]
    StorageUnavailable(#[source] anyhow::Error),
    #[error("integrity error: {digest} is stored with {stored} bytes, refusing {offered}")]
    Integrity {
        digest: Digest,
        stored: u64,
        offered: u64,
    },
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        Self::StorageUnavailable(err.into())
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let message = db.message();
            if message.contains("database is locked") || message.contains("database is busy") {
                return Self::Conflict("metadata store is busy, retry the request".into());
            }
        }

        Self::StorageUnavailable(anyhow::Error::new(err).context("metadata store"))
    }
}

impl From<axum::http::Error> for RegistryError {
    fn from(err: axum::http::Error) -> Self {
        Self::Unhandled(err.into())
    }
}

fn format_error(e: &anyhow::Error) -> String {
    let mut s = String::new();
    s.push_str(&format!("{}", e));
    for cause in e.chain().skip(1) {
        s.push_str(&format!("\nCaused by: {}", cause));
    }
    s
}

pub(crate) fn simple_oci_error(code: &str, message: &str) -> Body {
    Body::from(
        serde_json::json!({
            "errors": [{
                "code": code,
                "message": message
            }]
        })
        .to_string(),
    )
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let message = self.to_string();

        match self {
            Self::NotFound(unknown) => {
                let code = match unknown {
                    Unknown::Blob(_) => "BLOB_UNKNOWN",
                    Unknown::Manifest { .. } => "MANIFEST_UNKNOWN",
                    Unknown::Upload(_) => "BLOB_UPLOAD_UNKNOWN",
                    Unknown::Repository(_) => "NAME_UNKNOWN",
                };

                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(simple_oci_error(code, &message))
            }
            Self::DigestMismatch { .. } => Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(simple_oci_error("DIGEST_INVALID", &message)),
            Self::ManifestInvalid(problem) => {
                let code = match problem {
                    ManifestProblem::BlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
                    ManifestProblem::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
                    ManifestProblem::InvalidTag(_) => "TAG_INVALID",
                    ManifestProblem::InvalidName(_) => "NAME_INVALID",
                    ManifestProblem::TooLarge(_) => "SIZE_INVALID",
                    _ => "MANIFEST_INVALID",
                };

                Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(simple_oci_error(code, &message))
            }
            Self::QuotaExceeded { .. } => Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(simple_oci_error("DENIED", &message)),
            Self::UploadOutOfOrder {
                repository,
                upload_id,
                expected,
                ..
            } => {
                /*
                416 Range Not Satisfiable
                Location: /v2/<name>/blobs/uploads/<uuid>
                Range: 0-<offset>
                Content-Length: 0
                Docker-Upload-UUID: <uuid>
                */

                let range_end = if expected > 0 { expected - 1 } else { 0 };

                Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(
                        "Location",
                        format!("/v2/{repository}/blobs/uploads/{upload_id}"),
                    )
                    .header("Range", format!("0-{range_end}"))
                    .header("Content-Length", "0")
                    .header("Blob-Upload-Session-ID", upload_id.clone())
                    .header("Docker-Upload-UUID", upload_id.clone())
                    .body(Body::empty())
            }
            Self::UploadExpired(_) => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(simple_oci_error("BLOB_UPLOAD_UNKNOWN", &message)),
            Self::Conflict(_) => Response::builder()
                .status(StatusCode::CONFLICT)
                .body(simple_oci_error("CONFLICT", &message)),
            Self::StorageUnavailable(err) => {
                error!(error = %format_error(&err), "Storage unavailable");

                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(simple_oci_error("UNAVAILABLE", "storage is unavailable"))
            }
            Self::Integrity { .. } => {
                error!(error = %message, "Integrity error");

                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
            }
            Self::Unhandled(err) => {
                error!(
                    error = %format_error(&err),
                    backtrace = ?err.backtrace(),
                    "Registry error"
                );
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
            }
        }
        .unwrap_or_else(|err| {
            let err: anyhow::Error = err.into();
            error!(
                error = %format_error(&err),
                backtrace = ?err.backtrace(),
                "Registry error"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Body::empty()).into_response()
        })
    }
}
