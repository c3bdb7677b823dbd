//! On-disk build outputs: digests, sizes and tar archives.
//!
//! Filesystem work is blocking and runs on the blocking pool.

use sha2::{Digest as _, Sha256};
use shipyard_core::{ArtifactContent, BackendKind, Digest, Error, Platform, RawArtifact, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Describe a tool's on-disk output as a [`RawArtifact`].
pub async fn file_artifact(
    kind: BackendKind,
    platform: &Platform,
    content: ArtifactContent,
) -> Result<RawArtifact> {
    let path = content
        .path()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Internal("artifact content has no path".to_string()))?;

    let (digest, size) = blocking(move || measure(&path)).await?;

    Ok(RawArtifact {
        kind,
        platform: platform.clone(),
        digest,
        size,
        content,
    })
}

fn measure(path: &Path) -> std::io::Result<(Digest, u64)> {
    if path.is_dir() {
        digest_directory(path)
    } else {
        let size = std::fs::metadata(path)?.len();
        Ok((Digest::sha256_file(path)?, size))
    }
}

/// Digest over a directory tree: relative paths and file contents in sorted
/// order, so the same tree always hashes the same.
pub fn digest_directory(root: &Path) -> std::io::Result<(Digest, u64)> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];

    for relative in &files {
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let mut file = File::open(root.join(relative))?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            size += n as u64;
            hasher.update(&buf[..n]);
        }
        hasher.update([0u8]);
    }

    let digest = Digest::parse(&format!("sha256:{}", hex::encode(hasher.finalize())))
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok((digest, size))
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, files)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    Ok(())
}

/// Tar the contents of `dir` into memory, as a Docker build context.
pub async fn context_tarball(dir: PathBuf) -> Result<Vec<u8>> {
    blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &dir)?;
        builder.into_inner()
    })
    .await
}

/// Tar the contents of `dir` into the file `output`.
pub async fn tar_directory(dir: PathBuf, output: PathBuf) -> Result<()> {
    blocking(move || {
        let file = File::create(&output)?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &dir)?;
        builder.finish()
    })
    .await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
        .map_err(|e| Error::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_directory_digest_is_stable_and_content_sensitive() {
        let a = tempfile::tempdir().unwrap();
        write(a.path(), "x86_64/hello-1.0.apk", "package");
        write(a.path(), "x86_64/APKINDEX.tar.gz", "index");

        let b = tempfile::tempdir().unwrap();
        write(b.path(), "x86_64/APKINDEX.tar.gz", "index");
        write(b.path(), "x86_64/hello-1.0.apk", "package");

        let (da, size) = digest_directory(a.path()).unwrap();
        let (db, _) = digest_directory(b.path()).unwrap();
        assert_eq!(da, db);
        assert_eq!(size, 12);

        write(b.path(), "x86_64/hello-1.0.apk", "changed");
        let (changed, _) = digest_directory(b.path()).unwrap();
        assert_ne!(da, changed);
    }

    #[tokio::test]
    async fn test_file_artifact_for_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tar");
        std::fs::write(&path, b"oci layout").unwrap();

        let artifact = file_artifact(
            BackendKind::Apko,
            &Platform::new("linux", "amd64"),
            ArtifactContent::OciArchive { path: path.clone() },
        )
        .await
        .unwrap();

        assert_eq!(artifact.digest, Digest::sha256(b"oci layout"));
        assert_eq!(artifact.size, 10);
        assert_eq!(artifact.content.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_tar_directory_round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "repo/aarch64/hello.apk", "apk");
        let output = dir.path().join("layer.tar");

        tar_directory(dir.path().join("repo"), output.clone()).await.unwrap();

        let mut archive = tar::Archive::new(File::open(&output).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("aarch64/hello.apk")));
    }

    #[tokio::test]
    async fn test_context_tarball_contains_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Dockerfile", "FROM scratch\n");

        let bytes = context_tarball(dir.path().to_path_buf()).await.unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let found = archive
            .entries()
            .unwrap()
            .any(|e| e.unwrap().path().unwrap().ends_with("Dockerfile"));
        assert!(found);
    }
}
