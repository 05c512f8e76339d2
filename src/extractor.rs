use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{digest::Digest, error::ManifestProblem};

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

const DOCKER_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
const DOCKER_SCHEMA1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// Config plus layers.
    Image,
    /// A list of other manifests.
    Index,
}

pub fn kind_of(media_type: &str) -> Option<ManifestKind> {
    match media_type {
        DOCKER_MANIFEST | OCI_MANIFEST => Some(ManifestKind::Image),
        DOCKER_MANIFEST_LIST | OCI_INDEX => Some(ManifestKind::Index),
        _ => None,
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: Option<u32>,
    media_type: Option<String>,
    artifact_type: Option<String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
    subject: Option<Descriptor>,
    config: Option<Descriptor>,
    layers: Option<Vec<Descriptor>>,
    manifests: Option<Vec<Descriptor>>,
}

#[derive(Debug)]
pub struct ManifestInfo {
    pub media_type: String,
    pub kind: ManifestKind,
    pub artifact_type: Option<String>,
    pub annotations: HashMap<String, String>,
    pub size: u64,
    /// Child manifests of an index.
    pub manifests: Vec<Descriptor>,
    /// Config and layers of an image.
    pub blobs: Vec<Descriptor>,
    pub subject: Option<Descriptor>,
}

/// The media type a client declared, without parameters.
fn declared(content_type: Option<&str>) -> Option<&str> {
    let value = content_type?.split(';').next()?.trim();
    (!value.is_empty()).then_some(value)
}

/// Parse and structurally validate a manifest body.
///
/// The media type comes from the body, or from the request's content type
/// when the body does not carry one. A content type naming a different
/// manifest type than the body is rejected.
pub fn parse_manifest(
    body: &[u8],
    content_type: Option<&str>,
) -> Result<ManifestInfo, ManifestProblem> {
    let raw: RawManifest =
        serde_json::from_slice(body).map_err(|err| ManifestProblem::Malformed(err.to_string()))?;

    match raw.schema_version {
        None | Some(2) => {}
        Some(1) => return Err(ManifestProblem::UnsupportedMediaType(DOCKER_SCHEMA1.into())),
        Some(other) => {
            return Err(ManifestProblem::Malformed(format!(
                "unsupported schemaVersion {other}"
            )));
        }
    }

    let content_type = declared(content_type);
    if let Some(declared) = content_type
        && (declared == DOCKER_SCHEMA1 || declared == DOCKER_SCHEMA1_SIGNED)
    {
        return Err(ManifestProblem::UnsupportedMediaType(declared.into()));
    }

    let media_type = match (raw.media_type, content_type) {
        (Some(body_type), Some(declared))
            if body_type != declared && kind_of(declared).is_some() =>
        {
            return Err(ManifestProblem::MediaTypeMismatch {
                declared: body_type,
                content_type: declared.to_string(),
            });
        }
        (Some(body_type), _) => body_type,
        (None, Some(declared)) if kind_of(declared).is_some() => declared.to_string(),
        (None, _) if raw.manifests.is_some() => OCI_INDEX.to_string(),
        (None, _) => OCI_MANIFEST.to_string(),
    };

    let kind = kind_of(&media_type)
        .ok_or_else(|| ManifestProblem::UnsupportedMediaType(media_type.clone()))?;

    let (blobs, manifests) = match kind {
        ManifestKind::Image => {
            if raw.manifests.is_some() {
                return Err(ManifestProblem::Malformed(
                    "image manifest must not list manifests".into(),
                ));
            }
            let config = raw.config.ok_or_else(|| {
                ManifestProblem::Malformed("image manifest has no config".into())
            })?;

            let mut blobs = vec![config];
            blobs.extend(raw.layers.unwrap_or_default());
            (blobs, vec![])
        }
        ManifestKind::Index => {
            if raw.config.is_some() || raw.layers.is_some() {
                return Err(ManifestProblem::Malformed(
                    "index must not carry config or layers".into(),
                ));
            }
            let manifests = raw
                .manifests
                .ok_or_else(|| ManifestProblem::Malformed("index has no manifests".into()))?;
            (vec![], manifests)
        }
    };

    Ok(ManifestInfo {
        media_type,
        kind,
        artifact_type: raw.artifact_type,
        annotations: raw.annotations,
        size: body.len() as u64,
        manifests,
        blobs,
        subject: raw.subject,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_manifest_v2() {
        let input = r#"
        {
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "size": 7023
            },
            "layers": [
                {
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "digest": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                    "size": 32654
                }
            ]
        }
        "#;

        let info = parse_manifest(input.as_bytes(), None).unwrap();
        assert_eq!(info.media_type, DOCKER_MANIFEST);
        assert_eq!(info.kind, ManifestKind::Image);
        assert_eq!(info.manifests.len(), 0);
        assert_eq!(info.blobs.len(), 2);
        assert_eq!(
            info.blobs[0].digest,
            "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
                .parse()
                .unwrap()
        );
        assert_eq!(info.blobs[1].size, 32654);
        assert_eq!(info.size, input.len() as u64);
    }

    #[test]
    fn test_oci_image_index() {
        let input = r#"
        {
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "sha256:ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
                    "size": 8421,
                    "platform": {
                        "architecture": "arm64",
                        "os": "linux",
                        "variant": "v8"
                    }
                }
            ]
        }
        "#;

        let info = parse_manifest(input.as_bytes(), Some(OCI_INDEX)).unwrap();
        assert_eq!(info.media_type, OCI_INDEX);
        assert_eq!(info.kind, ManifestKind::Index);
        assert_eq!(info.blobs.len(), 0);
        assert_eq!(info.manifests.len(), 1);
        assert_eq!(
            info.manifests[0].platform.as_ref().and_then(|p| p.variant.as_deref()),
            Some("v8")
        );
    }

    #[test]
    fn media_type_from_content_type() {
        let input = r#"
        {
            "schemaVersion": 2,
            "manifests": []
        }
        "#;

        let info = parse_manifest(
            input.as_bytes(),
            Some("application/vnd.docker.distribution.manifest.list.v2+json; charset=utf-8"),
        )
        .unwrap();
        assert_eq!(info.media_type, DOCKER_MANIFEST_LIST);

        let info = parse_manifest(input.as_bytes(), None).unwrap();
        assert_eq!(info.media_type, OCI_INDEX);
    }

    #[test]
    fn conflicting_media_types() {
        let input = r#"
        {
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": []
        }
        "#;

        assert!(matches!(
            parse_manifest(input.as_bytes(), Some(OCI_MANIFEST)),
            Err(ManifestProblem::MediaTypeMismatch { .. })
        ));
        // Generic content types say nothing about the manifest.
        assert!(parse_manifest(input.as_bytes(), Some("application/json")).is_ok());
    }

    #[test]
    fn partial() {
        let info = parse_manifest(
            br#"
          {
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [
              {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "size": 7143,
                "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
                "platform": {
                  "architecture": "ppc64le",
                  "os": "linux"
                }
              },
        "#,
            None,
        );

        assert!(matches!(info, Err(ManifestProblem::Malformed(_))));
    }

    #[test]
    fn image_without_config() {
        let input = r#"
        {
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "layers": []
        }
        "#;

        assert!(matches!(
            parse_manifest(input.as_bytes(), None),
            Err(ManifestProblem::Malformed(_))
        ));
    }

    #[test]
    fn bad_reference() {
        let input = r#"
        {
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "md5:abcd",
                "size": 2
            },
            "layers": []
        }
        "#;

        assert!(matches!(
            parse_manifest(input.as_bytes(), None),
            Err(ManifestProblem::Malformed(_))
        ));
    }

    #[test]
    fn signed_v2_1_manifest() {
        let info = parse_manifest(br#"
            {
                "name": "hello-world",
                "tag": "latest",
                "architecture": "amd64",
                "fsLayers": [
                {
                    "blobSum": "sha256:5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef"
                }
                ],
                "history": [
                ],
                "schemaVersion": 1
            }
        "#, None);

        assert!(matches!(
            info,
            Err(ManifestProblem::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn oci_manifest_with_annotations() {
        let input = r#"
        {
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "artifactType": "application/vnd.example.sbom",
            "config": {
                "mediaType": "application/vnd.oci.empty.v1+json",
                "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
                "size": 2
            },
            "layers": [],
            "subject": {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:5b0bcabd1ed22e9fb1310cf6c2dec7cdef19f0ad69efa1f392e94a4333501270",
                "size": 7682
            },
            "annotations": {
                "org.opencontainers.image.created": "2025-06-01T00:00:00Z"
            }
        }
        "#;

        let info = parse_manifest(input.as_bytes(), None).unwrap();
        assert_eq!(info.media_type, OCI_MANIFEST);
        assert_eq!(
            info.artifact_type.as_deref(),
            Some("application/vnd.example.sbom")
        );
        assert_eq!(info.annotations.len(), 1);
        assert!(info.subject.is_some());
        assert_eq!(info.blobs.len(), 1);
    }
}
