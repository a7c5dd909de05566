//! Wire format of build manifests.
//!
//! A manifest is a zstd-compressed protobuf holding the ordered asset list
//! for one language tag. Chunks address a byte range of their asset: the
//! decompressed payload of chunk `c` occupies
//! `[c.chunk_on_file_offset, c.chunk_on_file_offset + c.chunk_size_decompressed)`
//! in the assembled file, and the ranges of an asset tile `[0, asset_size)`
//! without gaps or overlaps.

/// Asset type value marking a directory entry; all other values are regular
/// files.
pub const DIRECTORY_ASSET_TYPE: i32 = 64;

/// Ordered list of assets for one manifest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ManifestProto {
    #[prost(message, repeated, tag = "1")]
    pub assets: Vec<AssetProperty>,
}

/// One file or directory entry of the game tree. Immutable after decode.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssetProperty {
    /// Relative path under the game directory; identity is case-insensitive.
    #[prost(string, tag = "1")]
    pub asset_name: String,

    /// Entry kind; [`DIRECTORY_ASSET_TYPE`] marks a directory.
    #[prost(int32, tag = "2")]
    pub asset_type: i32,

    /// Decompressed size of the assembled file in bytes.
    #[prost(uint64, tag = "3")]
    pub asset_size: u64,

    /// MD5 of the assembled file, lowercase hex.
    #[prost(string, tag = "4")]
    pub asset_hash_md5: String,

    /// Chunks in file order. Empty for directory assets.
    #[prost(message, repeated, tag = "5")]
    pub asset_chunks: Vec<AssetChunk>,
}

/// One compressed byte range of an asset. Immutable after decode.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssetChunk {
    /// Store file name; the token before the first `_` is the XXH64 hex of
    /// the compressed blob.
    #[prost(string, tag = "1")]
    pub chunk_name: String,

    /// Compressed on-wire size.
    #[prost(uint64, tag = "2")]
    pub chunk_size: u64,

    /// Decompressed size.
    #[prost(uint64, tag = "3")]
    pub chunk_size_decompressed: u64,

    /// Byte offset of the decompressed payload in the assembled file.
    #[prost(uint64, tag = "4")]
    pub chunk_on_file_offset: u64,

    /// MD5 of the decompressed payload, lowercase hex.
    #[prost(string, tag = "5")]
    pub chunk_decompressed_hash_md5: String,
}

impl AssetProperty {
    /// Whether this entry is materialized as an empty directory.
    pub fn is_directory(&self) -> bool {
        self.asset_type == DIRECTORY_ASSET_TYPE
    }

    pub fn chunk_count(&self) -> u64 {
        self.asset_chunks.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_directory_detection() {
        let dir = AssetProperty {
            asset_name: "Audio/zh".to_string(),
            asset_type: DIRECTORY_ASSET_TYPE,
            ..Default::default()
        };
        assert!(dir.is_directory());

        let file = AssetProperty {
            asset_type: 0,
            ..Default::default()
        };
        assert!(!file.is_directory());
    }

    #[test]
    fn test_proto_roundtrip() {
        let proto = ManifestProto {
            assets: vec![AssetProperty {
                asset_name: "data/a.bin".to_string(),
                asset_type: 0,
                asset_size: 10,
                asset_hash_md5: "aa".to_string(),
                asset_chunks: vec![AssetChunk {
                    chunk_name: "ff00_1".to_string(),
                    chunk_size: 8,
                    chunk_size_decompressed: 10,
                    chunk_on_file_offset: 0,
                    chunk_decompressed_hash_md5: "bb".to_string(),
                }],
            }],
        };

        let bytes = proto.encode_to_vec();
        let decoded = ManifestProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, proto);
    }
}
