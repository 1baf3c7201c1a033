//! Workspace preparation: copying a checkout and applying file edits.
//!
//! Blocking filesystem work; callers run it on the blocking pool.

use std::fs;
use std::io;
use std::path::Path;

use cimend_core::domain::fix::{EditKind, FileEdit};
use cimend_core::fix::normalize_repo_path;
use cimend_core::sandbox::{SandboxError, SandboxResult};

/// Recursively copy `src` into `dst`, skipping any directory whose name is
/// in `skip`. Symlinks are not copied.
pub fn copy_tree(src: &Path, dst: &Path, skip: &[String]) -> io::Result<u64> {
    let mut copied = 0;
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let file_type = entry.file_type()?;
        let target = dst.join(&name);

        if file_type.is_dir() {
            if skip.iter().any(|s| name.to_string_lossy() == s.as_str()) {
                continue;
            }
            copied += copy_tree(&entry.path(), &target, skip)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Apply `edits` in order under `root`.
///
/// Paths are re-normalized here; a path that escapes the workspace is an
/// apply error even though the generator already rejects them.
pub fn apply_edits(root: &Path, edits: &[FileEdit]) -> SandboxResult<()> {
    for edit in edits {
        let rel = normalize_repo_path(&edit.path)
            .map_err(|e| SandboxError::Apply(e.to_string()))?;
        let path = root.join(&rel);
        let failed = |e: io::Error| SandboxError::Apply(format!("{rel}: {e}"));

        match edit.kind {
            EditKind::Delete => match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(SandboxError::Apply(format!("{rel}: file does not exist")))
                }
                Err(e) => return Err(failed(e)),
            },
            EditKind::Create | EditKind::Modify => {
                let content = edit
                    .content
                    .as_deref()
                    .ok_or_else(|| SandboxError::Apply(format!("{rel}: missing content")))?;
                if edit.kind == EditKind::Modify && !path.is_file() {
                    return Err(SandboxError::Apply(format!("{rel}: file does not exist")));
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(failed)?;
                }
                fs::write(&path, content).map_err(failed)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_tree_skips_build_dirs() {
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("src")).unwrap();
        fs::create_dir_all(src.path().join("target/debug")).unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::write(src.path().join("src/lib.rs"), "fn a() {}").unwrap();
        fs::write(src.path().join("target/debug/big"), "bin").unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();

        let dst = tempdir().unwrap();
        let skip = vec![".git".to_string(), "target".to_string()];
        let copied = copy_tree(src.path(), dst.path(), &skip).unwrap();

        assert_eq!(copied, 1);
        assert!(dst.path().join("src/lib.rs").is_file());
        assert!(!dst.path().join("target").exists());
        assert!(!dst.path().join(".git").exists());
    }

    #[test]
    fn test_apply_edits_in_order() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("old.txt"), "bye").unwrap();
        fs::write(root.path().join("keep.txt"), "v1").unwrap();

        apply_edits(
            root.path(),
            &[
                FileEdit::write("nested/new.txt", EditKind::Create, "hi"),
                FileEdit::write("keep.txt", EditKind::Modify, "v2"),
                FileEdit::delete("old.txt"),
            ],
        )
        .unwrap();

        assert_eq!(fs::read_to_string(root.path().join("nested/new.txt")).unwrap(), "hi");
        assert_eq!(fs::read_to_string(root.path().join("keep.txt")).unwrap(), "v2");
        assert!(!root.path().join("old.txt").exists());
    }

    #[test]
    fn test_apply_rejects_escaping_paths() {
        let root = tempdir().unwrap();
        let err = apply_edits(
            root.path(),
            &[FileEdit::write("../evil.txt", EditKind::Create, "x")],
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::Apply(_)));
    }

    #[test]
    fn test_modify_missing_file_fails() {
        let root = tempdir().unwrap();
        let err = apply_edits(
            root.path(),
            &[FileEdit::write("nope.rs", EditKind::Modify, "x")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
