//! Corruption-proof tag writing
//!
//! copy → modify → verify → atomic-replace. The original file is never
//! mutated in place: tags are written to a scratch copy, the content
//! fingerprint of the copy is recomputed and compared against the
//! expected value, and only a byte-for-byte-verified copy ever takes
//! the original's place. A crash at any step leaves either the
//! original or a fully written replacement, never a torn file.
//!
//! Two strategies, selected by a per-library-root hardlink capability
//! probe:
//!
//! * hardlink: scratch copy in a hidden `.sonotag-tmp` folder, swap
//!   via rename-to-`.bak` + hardlink + delete-`.bak`.
//! * fallback: `.tmp` sibling copy, delete original, rename into
//!   place. This touches the containing folder's mtime; callers that
//!   track folder mtimes must account for it.

use crate::types::Fingerprint;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Safe-write failures
#[derive(Debug, Error)]
pub enum WriteError {
    /// The tag-writing step altered audible content; the write was
    /// aborted with the original untouched.
    #[error("fingerprint mismatch after tag write: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("tag write callback failed: {0}")]
    WriteFn(#[source] anyhow::Error),

    #[error("fingerprint verification failed: {0}")]
    Fingerprint(#[source] anyhow::Error),

    #[error("IO error during safe write: {0}")]
    Io(#[from] std::io::Error),
}

/// Recomputes a file's content fingerprint; injected so the writer is
/// independent of the decode path.
pub type FingerprintFn = dyn Fn(&Path) -> anyhow::Result<String> + Send + Sync;

/// Hidden scratch folder per library root
const SCRATCH_DIR: &str = ".sonotag-tmp";

/// Safe tag writer
pub struct SafeWriter {
    fingerprint_fn: Box<FingerprintFn>,
    /// Hardlink capability probe result per library root
    probes: Mutex<HashMap<PathBuf, bool>>,
    hardlinks_disabled: bool,
}

impl SafeWriter {
    pub fn new<F>(fingerprint_fn: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            fingerprint_fn: Box::new(fingerprint_fn),
            probes: Mutex::new(HashMap::new()),
            hardlinks_disabled: false,
        }
    }

    /// Force the sibling-rename fallback (for filesystems whose probe
    /// misreports, and for tests).
    pub fn with_hardlinks_disabled(mut self) -> Self {
        self.hardlinks_disabled = true;
        self
    }

    /// Apply `write_fn` to a copy of `original` and atomically swap it
    /// into place once the fingerprint verifies.
    ///
    /// On any failure the original is untouched and scratch files are
    /// removed.
    pub fn write_safe<W>(
        &self,
        original: &Path,
        library_root: &Path,
        expected_fingerprint: &Fingerprint,
        write_fn: W,
    ) -> Result<(), WriteError>
    where
        W: FnOnce(&Path) -> anyhow::Result<()>,
    {
        if self.supports_hardlink(library_root) {
            self.write_hardlink(original, library_root, expected_fingerprint, write_fn)
        } else {
            self.write_fallback(original, expected_fingerprint, write_fn)
        }
    }

    fn write_hardlink<W>(
        &self,
        original: &Path,
        library_root: &Path,
        expected: &Fingerprint,
        write_fn: W,
    ) -> Result<(), WriteError>
    where
        W: FnOnce(&Path) -> anyhow::Result<()>,
    {
        let scratch_dir = library_root.join(SCRATCH_DIR);
        fs::create_dir_all(&scratch_dir)?;

        let temp = scratch_dir.join(scratch_name(original));
        fs::copy(original, &temp)?;

        let result = self.modify_verify_swap(original, &temp, expected, write_fn);

        // The scratch copy goes away regardless of outcome
        if let Err(e) = fs::remove_file(&temp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(temp = %temp.display(), error = %e, "Scratch copy cleanup failed");
            }
        }

        result
    }

    fn modify_verify_swap<W>(
        &self,
        original: &Path,
        temp: &Path,
        expected: &Fingerprint,
        write_fn: W,
    ) -> Result<(), WriteError>
    where
        W: FnOnce(&Path) -> anyhow::Result<()>,
    {
        write_fn(temp).map_err(WriteError::WriteFn)?;
        self.verify(temp, expected)?;

        let bak = sibling_with_suffix(original, ".bak");
        fs::rename(original, &bak)?;

        match fs::hard_link(temp, original) {
            Ok(()) => {
                fs::remove_file(&bak)?;
                debug!(path = %original.display(), "Safe write complete (hardlink strategy)");
                Ok(())
            }
            Err(e) => {
                // Put the original back before surfacing the error
                if let Err(undo) = fs::rename(&bak, original) {
                    warn!(
                        path = %original.display(),
                        error = %undo,
                        "Failed to restore original from .bak"
                    );
                }
                Err(e.into())
            }
        }
    }

    fn write_fallback<W>(
        &self,
        original: &Path,
        expected: &Fingerprint,
        write_fn: W,
    ) -> Result<(), WriteError>
    where
        W: FnOnce(&Path) -> anyhow::Result<()>,
    {
        let tmp = sibling_with_suffix(original, ".tmp");
        fs::copy(original, &tmp)?;

        let result = (|| {
            write_fn(&tmp).map_err(WriteError::WriteFn)?;
            self.verify(&tmp, expected)?;

            fs::remove_file(original)?;
            fs::rename(&tmp, original)?;
            debug!(path = %original.display(), "Safe write complete (fallback strategy)");
            Ok(())
        })();

        if result.is_err() && tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }

        result
    }

    /// A fingerprint mismatch always aborts: the tag step altered
    /// audible content, which must never reach the original file.
    fn verify(&self, candidate: &Path, expected: &Fingerprint) -> Result<(), WriteError> {
        let actual = (self.fingerprint_fn)(candidate).map_err(WriteError::Fingerprint)?;
        if actual != expected.as_str() {
            warn!(
                candidate = %candidate.display(),
                expected = %expected,
                actual = %actual,
                "Fingerprint mismatch; aborting write"
            );
            return Err(WriteError::FingerprintMismatch {
                expected: expected.as_str().to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Hardlink support, probed once per library root and cached.
    fn supports_hardlink(&self, library_root: &Path) -> bool {
        if self.hardlinks_disabled {
            return false;
        }

        let mut probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&supported) = probes.get(library_root) {
            return supported;
        }

        let supported = probe_hardlink(library_root);
        debug!(
            root = %library_root.display(),
            supported,
            "Hardlink capability probed"
        );
        probes.insert(library_root.to_path_buf(), supported);
        supported
    }
}

fn probe_hardlink(library_root: &Path) -> bool {
    let scratch_dir = library_root.join(SCRATCH_DIR);
    if fs::create_dir_all(&scratch_dir).is_err() {
        return false;
    }

    let probe = scratch_dir.join(format!("probe-{}", Uuid::new_v4()));
    let link = scratch_dir.join(format!("probe-link-{}", Uuid::new_v4()));

    if fs::write(&probe, b"probe").is_err() {
        return false;
    }
    let supported = fs::hard_link(&probe, &link).is_ok();

    let _ = fs::remove_file(&link);
    let _ = fs::remove_file(&probe);
    supported
}

/// `song.mp3` → `song.mp3.bak` (suffix appended, extension preserved)
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn scratch_name(original: &Path) -> String {
    match original.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test fingerprint: hash of everything before the first `|` byte,
    /// mimicking "audio content" that tag appends must not touch.
    fn test_fingerprint(path: &Path) -> anyhow::Result<String> {
        let bytes = fs::read(path)?;
        let audio_part: Vec<u8> = bytes.split(|&b| b == b'|').next().unwrap_or(&[]).to_vec();
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(&audio_part);
        Ok(format!("{:x}", digest).chars().take(32).collect())
    }

    fn setup(content: &[u8]) -> (tempfile::TempDir, PathBuf, Fingerprint) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("track.mp3");
        fs::write(&file, content).unwrap();
        let expected = Fingerprint::from_digest_hex(&test_fingerprint(&file).unwrap());
        (dir, file, expected)
    }

    fn append_tags(tags: &'static str) -> impl FnOnce(&Path) -> anyhow::Result<()> {
        move |path: &Path| {
            let mut bytes = fs::read(path)?;
            // Replace any previous tag suffix so the write is
            // idempotent, like a real tag rewrite
            bytes.truncate(
                bytes
                    .iter()
                    .position(|&b| b == b'|')
                    .unwrap_or(bytes.len()),
            );
            bytes.push(b'|');
            bytes.extend_from_slice(tags.as_bytes());
            fs::write(path, bytes)?;
            Ok(())
        }
    }

    fn writers() -> Vec<SafeWriter> {
        vec![
            SafeWriter::new(test_fingerprint),
            SafeWriter::new(test_fingerprint).with_hardlinks_disabled(),
        ]
    }

    #[test]
    fn test_write_safe_applies_tags() {
        for writer in writers() {
            let (dir, file, expected) = setup(b"AUDIODATA");

            writer
                .write_safe(&file, dir.path(), &expected, append_tags("mood=happy"))
                .unwrap();

            let content = fs::read(&file).unwrap();
            assert_eq!(content, b"AUDIODATA|mood=happy");
        }
    }

    #[test]
    fn test_write_safe_idempotent() {
        for writer in writers() {
            let (dir, file, expected) = setup(b"AUDIODATA");

            writer
                .write_safe(&file, dir.path(), &expected, append_tags("mood=happy"))
                .unwrap();
            let first = fs::read(&file).unwrap();

            writer
                .write_safe(&file, dir.path(), &expected, append_tags("mood=happy"))
                .unwrap();
            let second = fs::read(&file).unwrap();

            assert_eq!(first, second, "second identical write must be byte-identical");
        }
    }

    #[test]
    fn test_fingerprint_mismatch_leaves_original_untouched() {
        for writer in writers() {
            let (dir, file, expected) = setup(b"AUDIODATA");

            // Corrupts the "audio" portion → recomputed fingerprint changes
            let result = writer.write_safe(&file, dir.path(), &expected, |path: &Path| {
                fs::write(path, b"GARBAGE")?;
                Ok(())
            });

            assert!(matches!(result, Err(WriteError::FingerprintMismatch { .. })));
            assert_eq!(fs::read(&file).unwrap(), b"AUDIODATA");
        }
    }

    #[test]
    fn test_mismatch_cleans_scratch_files() {
        for writer in writers() {
            let (dir, file, expected) = setup(b"AUDIODATA");

            let _ = writer.write_safe(&file, dir.path(), &expected, |path: &Path| {
                fs::write(path, b"GARBAGE")?;
                Ok(())
            });

            assert_no_scratch(dir.path());
        }
    }

    #[test]
    fn test_write_fn_error_propagates_and_cleans_up() {
        for writer in writers() {
            let (dir, file, expected) = setup(b"AUDIODATA");

            let result = writer.write_safe(&file, dir.path(), &expected, |_: &Path| {
                anyhow::bail!("tag encoder exploded")
            });

            assert!(matches!(result, Err(WriteError::WriteFn(_))));
            assert_eq!(fs::read(&file).unwrap(), b"AUDIODATA");
            assert_no_scratch(dir.path());
        }
    }

    #[test]
    fn test_success_leaves_no_bak_or_scratch() {
        for writer in writers() {
            let (dir, file, expected) = setup(b"AUDIODATA");

            writer
                .write_safe(&file, dir.path(), &expected, append_tags("v=1"))
                .unwrap();

            assert_no_scratch(dir.path());
            assert!(!sibling_with_suffix(&file, ".bak").exists());
            assert!(!sibling_with_suffix(&file, ".tmp").exists());
        }
    }

    #[test]
    fn test_probe_caches_per_root() {
        let writer = SafeWriter::new(test_fingerprint);
        let dir = tempfile::tempdir().unwrap();

        let first = writer.supports_hardlink(dir.path());
        let second = writer.supports_hardlink(dir.path());
        assert_eq!(first, second);
    }

    #[test]
    fn test_sibling_with_suffix_preserves_extension() {
        let path = Path::new("/music/album/song.mp3");
        assert_eq!(
            sibling_with_suffix(path, ".bak"),
            PathBuf::from("/music/album/song.mp3.bak")
        );
    }

    fn assert_no_scratch(root: &Path) {
        let scratch = root.join(SCRATCH_DIR);
        if scratch.exists() {
            let leftovers: Vec<_> = fs::read_dir(&scratch)
                .unwrap()
                .filter_map(|e| e.ok())
                .collect();
            assert!(
                leftovers.is_empty(),
                "scratch files left behind: {:?}",
                leftovers.iter().map(|e| e.path()).collect::<Vec<_>>()
            );
        }
        for entry in fs::read_dir(root).unwrap().filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(
                !name.ends_with(".tmp") && !name.ends_with(".bak"),
                "stray scratch sibling: {}",
                name
            );
        }
    }
}
