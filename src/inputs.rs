//! Expansion of command-line inputs into NIfTI file lists.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const NIFTI_PATTERNS: [&str; 2] = ["*.nii", "*.nii.gz"];

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| Error::Configuration(format!("invalid pattern '{}': {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("skipping unreadable path: {}", e),
        }
    }
    files.sort();
    Ok(files)
}

/// NIfTI files directly inside `dir`, sorted by path.
pub fn nifti_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let mut files = Vec::new();
    for pattern in NIFTI_PATTERNS {
        files.extend(glob_files(&format!("{}/{}", escaped, pattern))?);
    }
    files.sort();
    Ok(files)
}

/// Resolve files, directories and glob patterns into an ordered list of
/// NIfTI files.
///
/// Directories contribute their `.nii` and `.nii.gz` files. Arguments that
/// match nothing are logged and skipped; duplicates keep their first
/// position. An empty result is [`Error::InputNotFound`].
pub fn expand_inputs<S: AsRef<str>>(args: &[S]) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for arg in args {
        let arg = arg.as_ref();
        let path = Path::new(arg);
        let matched = if path.is_dir() {
            nifti_files_in(path)?
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else if has_glob_meta(arg) {
            glob_files(arg)?
        } else {
            Vec::new()
        };

        if matched.is_empty() {
            warn!("no NIfTI files found for '{}'", arg);
            continue;
        }
        debug!(input = arg, count = matched.len(), "expanded input");
        for file in matched {
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }

    if files.is_empty() {
        let joined = args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ");
        return Err(Error::InputNotFound(joined));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_directory_expands_to_nifti_files() {
        let dir = tempfile::tempdir().unwrap();
        let b = touch(dir.path(), "b.nii.gz");
        let a = touch(dir.path(), "a.nii");
        touch(dir.path(), "notes.txt");

        let files = expand_inputs(&[dir.path().to_string_lossy()]).unwrap();
        assert_eq!(files, vec![a, b]);
    }

    #[test]
    fn test_glob_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let s1 = touch(dir.path(), "sub01.nii.gz");
        let s2 = touch(dir.path(), "sub02.nii.gz");
        touch(dir.path(), "other.nii.gz");

        let pattern = format!("{}/sub*.nii.gz", dir.path().display());
        let files = expand_inputs(&[pattern]).unwrap();
        assert_eq!(files, vec![s1, s2]);
    }

    #[test]
    fn test_duplicates_and_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.nii");
        let a_str = a.to_string_lossy().into_owned();
        let missing = dir.path().join("missing.nii").to_string_lossy().into_owned();

        let files = expand_inputs(&[a_str.clone(), missing, a_str]).unwrap();
        assert_eq!(files, vec![a]);
    }

    #[test]
    fn test_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/*.nii", dir.path().display());
        assert!(matches!(
            expand_inputs(&[pattern]),
            Err(Error::InputNotFound(_))
        ));
    }
}
