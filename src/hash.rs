//! SHA-256 content hashing for byte buffers, files, and directory trees
//!
//! Every hash is a 64-character lowercase hex digest. Directory hashes cover
//! relative paths as well as file contents, so renaming a file inside a
//! mounted tree changes the hash even when no bytes changed.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Hash a byte buffer.
pub fn bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a file's content.
pub fn file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file or directory.
///
/// Files hash by content; directories hash the whole tree.
pub fn path(p: &Path) -> io::Result<String> {
    if p.is_dir() { dir_tree(p) } else { file(p) }
}

/// Hash a directory tree: each entry's path relative to the root, plus file
/// contents, in a deterministic traversal order.
pub fn dir_tree(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?;
        hasher.update(rel.to_string_lossy().as_bytes());

        if entry.file_type().is_file() {
            let mut f = File::open(entry.path())?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn bytes_hash_is_stable_sha256() {
        // sha256("hello") is a well-known vector.
        assert_eq!(
            bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(bytes(b"hello").len(), 64);
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.env");
        fs::write(&path, b"KEY=value\n").expect("write");

        assert_eq!(file(&path).expect("hash"), bytes(b"KEY=value\n"));
    }

    #[test]
    fn dir_hash_changes_when_content_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("sub")).expect("mkdir");
        fs::write(dir.path().join("sub/a.txt"), b"one").expect("write");

        let before = dir_tree(dir.path()).expect("hash");
        fs::write(dir.path().join("sub/a.txt"), b"two").expect("write");
        let after = dir_tree(dir.path()).expect("hash");

        assert_ne!(before, after);
    }

    #[test]
    fn dir_hash_changes_when_file_is_renamed() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"same bytes").expect("write");

        let before = dir_tree(dir.path()).expect("hash");
        fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).expect("rename");
        let after = dir_tree(dir.path()).expect("hash");

        assert_ne!(before, after);
    }

    #[test]
    fn identical_trees_at_different_roots_hash_equal() {
        let one = tempfile::tempdir().expect("tempdir");
        let two = tempfile::tempdir().expect("tempdir");
        for root in [one.path(), two.path()] {
            fs::write(root.join("x.conf"), b"listen 80;").expect("write");
        }

        assert_eq!(
            dir_tree(one.path()).expect("hash"),
            dir_tree(two.path()).expect("hash")
        );
    }
}
