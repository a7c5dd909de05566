//! Build descriptors and manifest decoding.
//!
//! A build is described by a set of manifest stubs, one per language tag.
//! Decoding a build means, for every stub the audio selection accepts:
//! fetch the compressed manifest blob, zstd-decode it into memory, gate it
//! on the embedded MD5, and parse the protobuf. A checksum mismatch aborts
//! the operation - a silently dropped manifest would let an install finish
//! with missing assets.

pub mod proto;

use std::io::Cursor;

use prost::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec;
use crate::error::{EngineError, EngineResult};
use crate::hash;
use crate::remote::RemoteSource;

pub use proto::{AssetChunk, AssetProperty, ManifestProto, DIRECTORY_ASSET_TYPE};

// =============================================================================
// Build descriptors (input from the endpoint client)
// =============================================================================

/// Language tag attached to a manifest stub.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MatchingField {
    /// Core game data; always included.
    Game,
    ZhCn,
    EnUs,
    JaJp,
    KoKr,
    /// Unknown tag; never included.
    Other(String),
}

impl MatchingField {
    /// Parse a wire tag, case-insensitively.
    pub fn parse(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "game" => MatchingField::Game,
            "zh-cn" => MatchingField::ZhCn,
            "en-us" => MatchingField::EnUs,
            "ja-jp" => MatchingField::JaJp,
            "ko-kr" => MatchingField::KoKr,
            _ => MatchingField::Other(tag.to_string()),
        }
    }

    /// Canonical wire spelling.
    pub fn as_tag(&self) -> &str {
        match self {
            MatchingField::Game => "game",
            MatchingField::ZhCn => "zh-cn",
            MatchingField::EnUs => "en-us",
            MatchingField::JaJp => "ja-jp",
            MatchingField::KoKr => "ko-kr",
            MatchingField::Other(tag) => tag,
        }
    }
}

/// Which audio language packs the user has enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct AudioSelection {
    pub zh_cn: bool,
    pub en_us: bool,
    pub ja_jp: bool,
    pub ko_kr: bool,
}

impl AudioSelection {
    /// Whether a manifest with this tag participates in the operation.
    pub fn accepts(&self, field: &MatchingField) -> bool {
        match field {
            MatchingField::Game => true,
            MatchingField::ZhCn => self.zh_cn,
            MatchingField::EnUs => self.en_us,
            MatchingField::JaJp => self.ja_jp,
            MatchingField::KoKr => self.ko_kr,
            MatchingField::Other(_) => false,
        }
    }
}

/// One manifest reference inside a build descriptor.
#[derive(Clone, Debug)]
pub struct ManifestStub {
    pub matching_field: MatchingField,
    /// Blob id appended to `manifest_url_prefix`.
    pub id: String,
    /// MD5 hex of the decompressed manifest bytes.
    pub checksum: String,
    pub manifest_url_prefix: String,
    pub chunk_url_prefix: String,
    /// Total decompressed bytes of the assets this manifest describes.
    pub uncompressed_size: u64,
}

/// A complete installable game version, as produced by the endpoint client.
#[derive(Clone, Debug)]
pub struct Build {
    /// Version string, e.g. "5.3.0".
    pub tag: String,
    pub manifests: Vec<ManifestStub>,
}

// =============================================================================
// Decoded forms
// =============================================================================

/// A fetched, verified and parsed manifest.
#[derive(Clone, Debug)]
pub struct DecodedManifest {
    pub matching_field: MatchingField,
    pub chunk_url_prefix: String,
    pub proto: ManifestProto,
}

/// All accepted manifests of one build.
#[derive(Clone, Debug)]
pub struct DecodedBuild {
    pub tag: String,
    /// Sum of `uncompressed_size` over accepted stubs.
    pub total_uncompressed_bytes: u64,
    pub manifests: Vec<DecodedManifest>,
}

/// URL of a chunk blob under its manifest's prefix.
pub fn chunk_url(prefix: &str, chunk_name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), chunk_name)
}

// =============================================================================
// Decoding
// =============================================================================

/// Fetch, verify and parse every accepted manifest of `build`.
///
/// Stubs run serially; the heavy lifting (zstd, MD5, protobuf decode)
/// happens on a blocking thread. Network and decode failures are fatal to
/// the operation.
pub async fn decode_build(
    remote: &dyn RemoteSource,
    build: &Build,
    audio: &AudioSelection,
    cancel: &CancellationToken,
) -> EngineResult<DecodedBuild> {
    let mut manifests = Vec::new();
    let mut total_uncompressed_bytes = 0u64;

    for stub in &build.manifests {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !audio.accepts(&stub.matching_field) {
            debug!(tag = stub.matching_field.as_tag(), "manifest skipped by selection");
            continue;
        }

        let url = chunk_url(&stub.manifest_url_prefix, &stub.id);
        let compressed = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            body = remote.fetch(&url) => body?,
        };

        let id = stub.id.clone();
        let expected = stub.checksum.clone();
        let proto = tokio::task::spawn_blocking(move || -> EngineResult<ManifestProto> {
            let decompressed = codec::decode_to_vec(Cursor::new(compressed))?;
            let actual = hash::md5_hex(&decompressed);
            if !hash::hex_eq(&actual, &expected) {
                return Err(EngineError::ManifestChecksum {
                    id: id.clone(),
                    expected,
                    actual,
                });
            }
            ManifestProto::decode(decompressed.as_slice()).map_err(|e| {
                EngineError::ManifestDecode {
                    id,
                    reason: e.to_string(),
                }
            })
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))??;

        debug!(
            tag = stub.matching_field.as_tag(),
            assets = proto.assets.len(),
            "manifest decoded"
        );
        total_uncompressed_bytes += stub.uncompressed_size;
        manifests.push(DecodedManifest {
            matching_field: stub.matching_field.clone(),
            chunk_url_prefix: stub.chunk_url_prefix.clone(),
            proto,
        });
    }

    Ok(DecodedBuild {
        tag: build.tag.clone(),
        total_uncompressed_bytes,
        manifests,
    })
}
