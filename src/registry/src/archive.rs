//! Deterministic layer tarball packing.
//!
//! Walks a set of store paths and writes them into a gzip-compressed
//! tarball in a single streaming pass, so that a layer can be packed,
//! hashed and uploaded without ever being buffered in full.
//!
//! Identical inputs must produce bit-identical tarballs, since layers are
//! content-addressed and cached across builds and replicas. To that end
//! entries are sorted by name, modification times are pinned to the
//! epoch, and ownership is normalised to root.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use nixery_core::error::{NixeryError, Result};

use crate::layers::Layer;

/// Writes every byte to both the hash and the inner writer. Used to
/// compute the uncompressed digest while the compressor consumes the
/// same stream.
struct TeeWriter<'a, W: Write> {
    hasher: &'a mut Sha256,
    inner: W,
}

impl<W: Write> Write for TeeWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(buf)?;
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum EntryKind {
    Directory,
    File { size: u64 },
    Symlink { target: PathBuf },
}

struct TarEntry {
    name: String,
    src: PathBuf,
    mode: u32,
    kind: EntryKind,
}

/// Tar entry name for a filesystem path: relative, with directories
/// carrying a trailing slash.
fn tar_name(path: &Path, is_dir: bool) -> String {
    let name = path.to_string_lossy();
    let name = name.trim_start_matches('/');
    if is_dir {
        format!("{}/", name)
    } else {
        name.to_string()
    }
}

fn collect_entries(path: &Path, entries: &mut Vec<TarEntry>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(path)
        .map_err(|e| NixeryError::Packing(format!("failed to stat {}: {}", path.display(), e)))?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(|e| {
            NixeryError::Packing(format!("failed to read link {}: {}", path.display(), e))
        })?;

        entries.push(TarEntry {
            name: tar_name(path, false),
            src: path.to_path_buf(),
            mode: 0o777,
            kind: EntryKind::Symlink { target },
        });
    } else if file_type.is_dir() {
        entries.push(TarEntry {
            name: tar_name(path, true),
            src: path.to_path_buf(),
            mode: meta.permissions().mode() & 0o7777,
            kind: EntryKind::Directory,
        });

        let mut children = fs::read_dir(path)
            .map_err(|e| {
                NixeryError::Packing(format!("failed to read dir {}: {}", path.display(), e))
            })?
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| {
                NixeryError::Packing(format!("failed to read dir {}: {}", path.display(), e))
            })?;
        children.sort_by_key(|c| c.file_name());

        for child in children {
            collect_entries(&child.path(), entries)?;
        }
    } else if file_type.is_file() {
        entries.push(TarEntry {
            name: tar_name(path, false),
            src: path.to_path_buf(),
            mode: meta.permissions().mode() & 0o7777,
            kind: EntryKind::File { size: meta.len() },
        });
    } else {
        // Sockets, fifos and device nodes cannot be represented in an
        // image layer.
        tracing::debug!(path = %path.display(), "skipping special file during packing");
    }

    Ok(())
}

fn base_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    header
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, entry: &TarEntry) -> Result<()> {
    let pack_err = |e: io::Error| {
        NixeryError::Packing(format!("failed to pack {}: {}", entry.src.display(), e))
    };

    match &entry.kind {
        EntryKind::Directory => {
            let mut header = base_header(tar::EntryType::Directory, entry.mode, 0);
            builder
                .append_data(&mut header, &entry.name, io::empty())
                .map_err(pack_err)?;
        }
        EntryKind::File { size } => {
            let mut header = base_header(tar::EntryType::Regular, entry.mode, *size);
            let file = fs::File::open(&entry.src).map_err(pack_err)?;
            builder
                .append_data(&mut header, &entry.name, file)
                .map_err(pack_err)?;
        }
        EntryKind::Symlink { target } => {
            let mut header = base_header(tar::EntryType::Symlink, entry.mode, 0);
            builder
                .append_link(&mut header, &entry.name, target)
                .map_err(pack_err)?;
        }
    }

    Ok(())
}

/// Pack the store paths of a layer into a gzip-compressed tarball
/// written to `out`, returning the SHA256 of the *uncompressed* tar
/// stream.
///
/// The uncompressed digest becomes the layer's `diff_id` in the image
/// configuration; hashing the compressed bytes as served is the
/// caller's concern, since only the caller sees the final sink.
pub fn pack_store_paths<W: Write>(layer: &Layer, out: W) -> Result<String> {
    let mut hasher = Sha256::new();
    let gz = GzEncoder::new(out, Compression::default());

    {
        let tee = TeeWriter {
            hasher: &mut hasher,
            inner: gz,
        };
        let mut builder = tar::Builder::new(tee);

        // Receiving filesystems need the store prefix itself in order to
        // resolve symlinks into it.
        for prefix in ["nix/", "nix/store/"] {
            let mut header = base_header(tar::EntryType::Directory, 0o755, 0);
            builder
                .append_data(&mut header, prefix, io::empty())
                .map_err(|e| NixeryError::Packing(format!("failed to write {}: {}", prefix, e)))?;
        }

        let mut entries = Vec::new();
        for path in &layer.contents {
            collect_entries(Path::new(path), &mut entries)?;
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        for entry in &entries {
            append_entry(&mut builder, entry)?;
        }

        let tee = builder
            .into_inner()
            .map_err(|e| NixeryError::Packing(format!("failed to finalise tar: {}", e)))?;
        tee.inner
            .finish()
            .map_err(|e| NixeryError::Packing(format!("failed to finalise gzip: {}", e)))?;
    }

    tracing::debug!(layer = %layer.hash(), "packed layer tarball");

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn test_layer(paths: &[&Path]) -> Layer {
        let mut contents: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        contents.sort();
        Layer {
            contents,
            merge_rating: 0,
        }
    }

    fn fixture_store_path(tmp: &TempDir) -> std::path::PathBuf {
        let root = tmp.path().join("store-path");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/hello"), "#!/bin/sh\necho hello\n").unwrap();
        fs::create_dir_all(root.join("share/doc")).unwrap();
        fs::write(root.join("share/doc/README"), "docs").unwrap();
        symlink("bin/hello", root.join("hello-link")).unwrap();
        root
    }

    fn unpack(compressed: &[u8]) -> Vec<(String, tar::Header, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(compressed));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().to_string();
                let header = e.header().clone();
                let mut content = Vec::new();
                e.read_to_end(&mut content).unwrap();
                (name, header, content)
            })
            .collect()
    }

    #[test]
    fn test_pack_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let root = fixture_store_path(&tmp);
        let layer = test_layer(&[&root]);

        let mut first = Vec::new();
        let hash1 = pack_store_paths(&layer, &mut first).unwrap();

        let mut second = Vec::new();
        let hash2 = pack_store_paths(&layer, &mut second).unwrap();

        assert_eq!(first, second);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_uncompressed_hash_matches_stream() {
        let tmp = TempDir::new().unwrap();
        let root = fixture_store_path(&tmp);
        let layer = test_layer(&[&root]);

        let mut compressed = Vec::new();
        let reported = pack_store_paths(&layer, &mut compressed).unwrap();

        let mut raw = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&raw);
        assert_eq!(reported, hex::encode(hasher.finalize()));
    }

    #[test]
    fn test_entries_sorted_and_prefixed() {
        let tmp = TempDir::new().unwrap();
        let root = fixture_store_path(&tmp);
        let layer = test_layer(&[&root]);

        let mut compressed = Vec::new();
        pack_store_paths(&layer, &mut compressed).unwrap();

        let names: Vec<String> = unpack(&compressed).into_iter().map(|(n, _, _)| n).collect();

        assert_eq!(names[0], "nix/");
        assert_eq!(names[1], "nix/store/");

        let mut sorted = names[2..].to_vec();
        sorted.sort();
        assert_eq!(&names[2..], sorted.as_slice());
    }

    #[test]
    fn test_ownership_and_mtime_normalised() {
        let tmp = TempDir::new().unwrap();
        let root = fixture_store_path(&tmp);
        let layer = test_layer(&[&root]);

        let mut compressed = Vec::new();
        pack_store_paths(&layer, &mut compressed).unwrap();

        for (name, header, _) in unpack(&compressed) {
            assert_eq!(header.uid().unwrap(), 0, "{} has non-root uid", name);
            assert_eq!(header.gid().unwrap(), 0, "{} has non-root gid", name);
            assert_eq!(header.mtime().unwrap(), 0, "{} has non-epoch mtime", name);
        }
    }

    #[test]
    fn test_file_content_preserved() {
        let tmp = TempDir::new().unwrap();
        let root = fixture_store_path(&tmp);
        let layer = test_layer(&[&root]);

        let mut compressed = Vec::new();
        pack_store_paths(&layer, &mut compressed).unwrap();

        let entries = unpack(&compressed);
        let (_, _, content) = entries
            .iter()
            .find(|(n, _, _)| n.ends_with("bin/hello"))
            .unwrap();
        assert_eq!(content, b"#!/bin/sh\necho hello\n");
    }

    #[test]
    fn test_symlink_preserved_not_followed() {
        let tmp = TempDir::new().unwrap();
        let root = fixture_store_path(&tmp);
        let layer = test_layer(&[&root]);

        let mut compressed = Vec::new();
        pack_store_paths(&layer, &mut compressed).unwrap();

        let entries = unpack(&compressed);
        let (_, header, content) = entries
            .iter()
            .find(|(n, _, _)| n.ends_with("hello-link"))
            .unwrap();

        assert_eq!(header.entry_type(), tar::EntryType::Symlink);
        assert_eq!(
            header.link_name().unwrap().unwrap().to_string_lossy(),
            "bin/hello"
        );
        assert!(content.is_empty());
    }

    #[test]
    fn test_special_files_skipped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store-path");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("regular"), "data").unwrap();
        // A unix socket is representative of inode types that have no
        // place in an image layer.
        std::os::unix::net::UnixListener::bind(root.join("socket")).unwrap();

        let layer = test_layer(&[&root]);
        let mut compressed = Vec::new();
        pack_store_paths(&layer, &mut compressed).unwrap();

        let names: Vec<String> = unpack(&compressed).into_iter().map(|(n, _, _)| n).collect();
        assert!(names.iter().any(|n| n.ends_with("regular")));
        assert!(!names.iter().any(|n| n.ends_with("socket")));
    }

    #[test]
    fn test_multiple_store_paths_in_one_layer() {
        let tmp = TempDir::new().unwrap();

        let a = tmp.path().join("path-a");
        fs::create_dir_all(&a).unwrap();
        fs::write(a.join("file-a"), "a").unwrap();

        let b = tmp.path().join("path-b");
        fs::create_dir_all(&b).unwrap();
        fs::write(b.join("file-b"), "b").unwrap();

        let layer = test_layer(&[&a, &b]);
        let mut compressed = Vec::new();
        pack_store_paths(&layer, &mut compressed).unwrap();

        let names: Vec<String> = unpack(&compressed).into_iter().map(|(n, _, _)| n).collect();
        assert!(names.iter().any(|n| n.ends_with("file-a")));
        assert!(names.iter().any(|n| n.ends_with("file-b")));
    }

    #[test]
    fn test_store_path_that_is_a_plain_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain-file");
        fs::write(&file, "just bytes").unwrap();

        let layer = test_layer(&[&file]);
        let mut compressed = Vec::new();
        pack_store_paths(&layer, &mut compressed).unwrap();

        let entries = unpack(&compressed);
        let (_, _, content) = entries
            .iter()
            .find(|(n, _, _)| n.ends_with("plain-file"))
            .unwrap();
        assert_eq!(content, b"just bytes");
    }

    #[test]
    fn test_missing_store_path_is_a_packing_error() {
        let layer = Layer {
            contents: vec!["/does/not/exist".to_string()],
            merge_rating: 0,
        };

        let err = pack_store_paths(&layer, Vec::new()).unwrap_err();
        assert!(matches!(err, NixeryError::Packing(_)));
    }
}
