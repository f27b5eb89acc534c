//! Image manifest and configuration assembly.
//!
//! Produces the Docker "Image Manifest V2, Schema 2" JSON and the
//! accompanying image configuration blob from a list of layer
//! descriptors. Outside of this module both documents are treated as
//! opaque byte blobs addressed by their SHA256.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content type of the image manifest itself.
pub const MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Content type of a layer tarball.
pub const LAYER_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Content type of the image configuration blob.
pub const CONFIG_TYPE: &str = "application/vnd.docker.container.image.v1+json";

const SCHEMA_VERSION: u32 = 2;
const OS: &str = "linux";
const FS_TYPE: &str = "layers";

/// Descriptor of one built layer, as produced by the build pipeline and
/// stored in the layer cache.
///
/// `digest` and `size` describe the compressed tarball as served;
/// `tar_hash` is the digest of the uncompressed stream and ends up in
/// the image configuration's `diff_ids`. The merge rating orders layers
/// within the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub digest: String,
    pub size: u64,

    #[serde(default)]
    pub tar_hash: String,

    #[serde(default)]
    pub merge_rating: u64,
}

/// The image configuration blob referenced from the manifest, together
/// with its serialised content and hash.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub config: Vec<u8>,
    pub sha256: String,
}

#[derive(Serialize)]
struct WireEntry<'a> {
    #[serde(rename = "mediaType")]
    media_type: &'static str,
    size: u64,
    digest: &'a str,
}

#[derive(Serialize)]
struct WireManifest<'a> {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: &'static str,
    config: WireEntry<'a>,
    layers: Vec<WireEntry<'a>>,
}

#[derive(Serialize)]
struct RootFs<'a> {
    #[serde(rename = "type")]
    fs_type: &'static str,
    diff_ids: Vec<&'a str>,
}

// An empty struct serialises to `{}`; the image metadata deserialiser in
// Kubernetes requires an empty object rather than `null` here.
#[derive(Serialize)]
struct EmptyConfig {}

#[derive(Serialize)]
struct ImageConfig<'a> {
    architecture: &'a str,
    os: &'static str,
    rootfs: RootFs<'a>,
    config: EmptyConfig,
}

fn config_layer(architecture: &str, diff_ids: Vec<&str>) -> ConfigLayer {
    let config = ImageConfig {
        architecture,
        os: OS,
        rootfs: RootFs {
            fs_type: FS_TYPE,
            diff_ids,
        },
        config: EmptyConfig {},
    };

    // Serialising a struct of plain fields cannot fail.
    let bytes = serde_json::to_vec(&config).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);

    ConfigLayer {
        sha256: hex::encode(hasher.finalize()),
        config: bytes,
    }
}

/// Assemble the image manifest from the given layer descriptors.
///
/// Layers are emitted in descending merge-rating order: clients
/// re-download layers whenever their position changes, so the heaviest
/// shared layers come first to maximise prefix reuse across images.
/// The configuration's `diff_ids` follow the same order.
///
/// Returns the serialised manifest and the configuration blob, which the
/// caller still has to persist.
pub fn manifest(architecture: &str, mut entries: Vec<Entry>) -> (Vec<u8>, ConfigLayer) {
    entries.sort_by(|a, b| b.merge_rating.cmp(&a.merge_rating));

    let config = config_layer(
        architecture,
        entries.iter().map(|e| e.tar_hash.as_str()).collect(),
    );

    let config_digest = format!("sha256:{}", config.sha256);
    let wire = WireManifest {
        schema_version: SCHEMA_VERSION,
        media_type: MANIFEST_TYPE,
        config: WireEntry {
            media_type: CONFIG_TYPE,
            size: config.config.len() as u64,
            digest: &config_digest,
        },
        layers: entries
            .iter()
            .map(|e| WireEntry {
                media_type: LAYER_TYPE,
                size: e.size,
                digest: &e.digest,
            })
            .collect(),
    };

    let bytes = serde_json::to_vec(&wire).unwrap_or_default();

    (bytes, config)
}
