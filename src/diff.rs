//! Differential comparison of two decoded builds.
//!
//! Manifests are paired by language tag, so a changed audio selection between
//! operations cannot misalign the comparison. Asset identity is the
//! case-insensitive name; asset equality is the whole-file MD5; chunk reuse
//! is decided purely by decompressed MD5 - a chunk whose content is unchanged
//! but whose offset moved is copied from the old file at assembly time, never
//! refetched.

use std::collections::{HashMap, HashSet};

use crate::manifest::{AssetChunk, AssetProperty, DecodedBuild, DecodedManifest, MatchingField};

/// A remote asset scheduled for work, with the chunk URL prefix of the
/// manifest it came from.
#[derive(Clone, Debug)]
pub struct RemoteAsset {
    pub chunk_url_prefix: String,
    pub property: AssetProperty,
    /// For modified assets: the remote chunks whose decompressed content is
    /// new to this build. Empty for added assets (all chunks are fetched).
    pub diff_chunks: Vec<AssetChunk>,
}

/// A modified asset: the remote target plus the local asset it evolves from.
#[derive(Clone, Debug)]
pub struct ModifiedAsset {
    pub asset: RemoteAsset,
    /// The currently installed asset; unchanged ranges are copied from it.
    pub old: AssetProperty,
}

/// Added / modified / deleted sets between two builds.
#[derive(Clone, Debug, Default)]
pub struct BuildDiff {
    pub added: Vec<RemoteAsset>,
    pub modified: Vec<ModifiedAsset>,
    pub deleted: Vec<AssetProperty>,
}

impl BuildDiff {
    /// Bytes of new content this update has to materialize; drives the disk
    /// space admission check.
    pub fn bytes_needed(&self) -> u64 {
        let added: u64 = self.added.iter().map(|a| a.property.asset_size).sum();
        let modified: u64 = self
            .modified
            .iter()
            .flat_map(|m| m.asset.diff_chunks.iter())
            .map(|c| c.chunk_size_decompressed)
            .sum();
        added + modified
    }

    /// Number of chunk downloads the update or predownload will schedule.
    pub fn total_blocks(&self) -> u64 {
        let added: u64 = self.added.iter().map(|a| a.property.chunk_count()).sum();
        let modified: u64 = self
            .modified
            .iter()
            .map(|m| m.asset.diff_chunks.len() as u64)
            .sum();
        added + modified
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Every asset of a decoded build as a work item (used by install/verify).
pub fn all_assets(build: &DecodedBuild) -> Vec<RemoteAsset> {
    build
        .manifests
        .iter()
        .flat_map(|manifest| {
            manifest.proto.assets.iter().map(|asset| RemoteAsset {
                chunk_url_prefix: manifest.chunk_url_prefix.clone(),
                property: asset.clone(),
                diff_chunks: Vec::new(),
            })
        })
        .collect()
}

/// Compute the added/modified/deleted sets from `local` to `remote`.
pub fn diff_builds(local: &DecodedBuild, remote: &DecodedBuild) -> BuildDiff {
    let local_by_tag: HashMap<&MatchingField, &DecodedManifest> = local
        .manifests
        .iter()
        .map(|m| (&m.matching_field, m))
        .collect();
    let remote_by_tag: HashMap<&MatchingField, &DecodedManifest> = remote
        .manifests
        .iter()
        .map(|m| (&m.matching_field, m))
        .collect();

    let mut diff = BuildDiff::default();

    for remote_manifest in &remote.manifests {
        let local_manifest = local_by_tag.get(&remote_manifest.matching_field);
        let local_assets: HashMap<String, &AssetProperty> = local_manifest
            .map(|m| {
                m.proto
                    .assets
                    .iter()
                    .map(|a| (a.asset_name.to_ascii_lowercase(), a))
                    .collect()
            })
            .unwrap_or_default();

        for asset in &remote_manifest.proto.assets {
            let key = asset.asset_name.to_ascii_lowercase();
            match local_assets.get(&key) {
                None => diff.added.push(RemoteAsset {
                    chunk_url_prefix: remote_manifest.chunk_url_prefix.clone(),
                    property: asset.clone(),
                    diff_chunks: Vec::new(),
                }),
                Some(old) if !asset.asset_hash_md5.eq_ignore_ascii_case(&old.asset_hash_md5) => {
                    let old_chunk_md5s: HashSet<String> = old
                        .asset_chunks
                        .iter()
                        .map(|c| c.chunk_decompressed_hash_md5.to_ascii_lowercase())
                        .collect();
                    let diff_chunks: Vec<AssetChunk> = asset
                        .asset_chunks
                        .iter()
                        .filter(|c| {
                            !old_chunk_md5s
                                .contains(&c.chunk_decompressed_hash_md5.to_ascii_lowercase())
                        })
                        .cloned()
                        .collect();
                    diff.modified.push(ModifiedAsset {
                        asset: RemoteAsset {
                            chunk_url_prefix: remote_manifest.chunk_url_prefix.clone(),
                            property: asset.clone(),
                            diff_chunks,
                        },
                        old: (*old).clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    for local_manifest in &local.manifests {
        let remote_manifest = remote_by_tag.get(&local_manifest.matching_field);
        let remote_names: HashSet<String> = remote_manifest
            .map(|m| {
                m.proto
                    .assets
                    .iter()
                    .map(|a| a.asset_name.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        for asset in &local_manifest.proto.assets {
            if !remote_names.contains(&asset.asset_name.to_ascii_lowercase()) {
                diff.deleted.push(asset.clone());
            }
        }
    }

    diff
}
