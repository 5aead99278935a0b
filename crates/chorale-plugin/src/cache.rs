//! On-disk compilation cache maintenance.
//!
//! The engine owns the cache layout and content addressing; this module
//! only keeps the directory under a byte budget. Pruning runs once before
//! the cache is first used and deletes least-recently-modified files until
//! the total fits, then removes directories it emptied.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::PluginError;

/// Parse a human-readable byte budget. Returns `None` when the value is
/// "0" or unparseable, which disables pruning entirely.
pub fn parse_cache_budget(raw: &str) -> Option<u64> {
    match raw.trim().parse::<bytesize::ByteSize>() {
        Ok(size) if size.as_u64() > 0 => Some(size.as_u64()),
        Ok(_) => None,
        Err(_) => {
            if !raw.trim().is_empty() {
                warn!(value = raw, "unparseable cache size, pruning disabled");
            }
            None
        }
    }
}

/// Trim the cache directory down to `budget` bytes.
///
/// Oldest files (by modification time) go first. A missing directory is
/// fine; individual deletion failures are logged and skipped so one stuck
/// file cannot wedge startup.
pub fn prune_cache_by_size(dir: &Path, budget: u64) -> Result<(), PluginError> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;

    let mut total: u64 = files.iter().map(|f| f.size).sum();
    if total <= budget {
        return Ok(());
    }

    files.sort_by_key(|f| f.modified);

    let mut parents = Vec::new();
    for file in &files {
        if total <= budget {
            break;
        }
        match fs::remove_file(&file.path) {
            Ok(()) => {
                total = total.saturating_sub(file.size);
                debug!(path = %file.path.display(), size = file.size, "pruned cache file");
                if let Some(parent) = file.path.parent() {
                    let parent = parent.to_path_buf();
                    if !parents.contains(&parent) {
                        parents.push(parent);
                    }
                }
            }
            Err(e) => warn!(path = %file.path.display(), error = %e, "failed to prune cache file"),
        }
    }

    // Deepest directories first so emptied trees collapse bottom-up.
    parents.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for parent in parents {
        if parent != dir && is_empty_dir(&parent) {
            let _ = fs::remove_dir(&parent);
        }
    }

    Ok(())
}

/// Write the engine cache configuration file and return its path.
///
/// The compiled-module store lives in `<dir>/modules`; the engine reads
/// this TOML file and handles content addressing itself.
pub fn write_engine_cache_config(dir: &Path) -> Result<PathBuf, PluginError> {
    let modules = dir.join("modules");
    fs::create_dir_all(&modules)?;
    let config_path = dir.join("engine-cache.toml");
    let contents = format!(
        "[cache]\nenabled = true\ndirectory = {:?}\n",
        modules.display().to_string()
    );
    fs::write(&config_path, contents)?;
    Ok(config_path)
}

struct CacheFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn collect_files(dir: &Path, out: &mut Vec<CacheFile>) -> Result<(), PluginError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(CacheFile {
                path,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    Ok(())
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::File::create(path).unwrap();
        f.write_all(&vec![0u8; bytes]).unwrap();
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - std::time::Duration::from_secs(secs_ago);
        let f = fs::File::options().write(true).open(path).unwrap();
        f.set_modified(when).unwrap();
    }

    // ── Budget parsing ────────────────────────────────────────────────

    #[test]
    fn test_parse_budget() {
        assert_eq!(parse_cache_budget("100MB"), Some(100_000_000));
        assert_eq!(parse_cache_budget("1KB"), Some(1_000));
        assert_eq!(parse_cache_budget("0"), None);
        assert_eq!(parse_cache_budget("garbage"), None);
        assert_eq!(parse_cache_budget(""), None);
    }

    #[test]
    fn test_write_engine_cache_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_engine_cache_config(tmp.path()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("enabled = true"));
        assert!(contents.contains("modules"));
        assert!(tmp.path().join("modules").is_dir());
    }

    // ── Pruning ───────────────────────────────────────────────────────

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        prune_cache_by_size(&missing, 1024).unwrap();
    }

    #[test]
    fn test_prune_under_budget_keeps_everything() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(&tmp.path().join("a.bin"), 100);
        write_file(&tmp.path().join("b.bin"), 100);

        prune_cache_by_size(tmp.path(), 1024).unwrap();
        assert!(tmp.path().join("a.bin").exists());
        assert!(tmp.path().join("b.bin").exists());
    }

    #[test]
    fn test_prune_removes_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old.bin");
        let mid = tmp.path().join("mid.bin");
        let new = tmp.path().join("new.bin");
        write_file(&old, 400);
        write_file(&mid, 400);
        write_file(&new, 400);
        set_mtime(&old, 300);
        set_mtime(&mid, 200);
        set_mtime(&new, 100);

        // Budget fits one file only
        prune_cache_by_size(tmp.path(), 500).unwrap();
        assert!(!old.exists());
        assert!(!mid.exists());
        assert!(new.exists());
    }

    #[test]
    fn test_prune_removes_emptied_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("sub").join("entry.bin");
        let kept = tmp.path().join("kept.bin");
        write_file(&nested, 800);
        write_file(&kept, 100);
        set_mtime(&nested, 200);
        set_mtime(&kept, 100);

        prune_cache_by_size(tmp.path(), 200).unwrap();
        assert!(!nested.exists());
        assert!(!tmp.path().join("sub").exists());
        assert!(kept.exists());
        // Root cache dir itself stays
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_prune_stops_at_budget() {
        let tmp = tempfile::tempdir().unwrap();
        for (i, age) in [(0, 500u64), (1, 400), (2, 300), (3, 200)] {
            let path = tmp.path().join(format!("f{i}.bin"));
            write_file(&path, 250);
            set_mtime(&path, age);
        }

        prune_cache_by_size(tmp.path(), 600).unwrap();
        let remaining: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"f2.bin".to_string()));
        assert!(remaining.contains(&"f3.bin".to_string()));
    }
}
