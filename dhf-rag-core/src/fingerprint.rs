//! File-set fingerprints for cache validity

use crate::document::{DocumentKind, DocumentLoader, FileStat, ProjectLayout};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Fingerprint of the files that should invalidate a project's cache.
///
/// Walks the procedure and context roots, leaving out prompt folders at any
/// depth and, unless `track_on_demand` is set, the on-demand context folders.
pub fn compute_fingerprint(
    loader: &dyn DocumentLoader,
    project: &Path,
    layout: &ProjectLayout,
    track_on_demand: bool,
) -> crate::Result<String> {
    let mut files = loader.list_files(
        project,
        &layout.roots(),
        &layout.fingerprint_excludes(track_on_demand),
    )?;
    files.retain(|f| {
        layout
            .classify(&f.relative_path)
            .is_some_and(|c| c.kind != DocumentKind::Prompt)
    });
    Ok(fingerprint_stats(&files))
}

/// SHA-256 hex over `relative_path|size|mtime` lines, sorted by path.
///
/// Input order does not matter.
pub fn fingerprint_stats(files: &[FileStat]) -> String {
    let mut lines: Vec<String> = files
        .iter()
        .map(|f| format!("{}|{}|{}\n", f.relative_path, f.size, f.mtime_millis))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::document::FsDocumentLoader;
    use std::fs::{self, File};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, bytes: usize) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "a".repeat(bytes)).unwrap();
    }

    fn set_mtime(root: &Path, rel: &str, secs_ago: u64) {
        let file = File::options().write(true).open(root.join(rel)).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    fn fingerprint(root: &Path, track_on_demand: bool) -> String {
        let config = Config::default();
        let loader = FsDocumentLoader::new(&config.indexing).unwrap();
        let layout = ProjectLayout::new(&config.layout);
        compute_fingerprint(&loader, root, &layout, track_on_demand).unwrap()
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Procedures/Design/a.txt", 100);
        write(dir.path(), "Procedures/Design/b.txt", 200);
        write(dir.path(), "Procedures/Risk/c.txt", 300);
        write(dir.path(), "Context/Prompt/prompt.txt", 10);
        dir
    }

    #[test]
    fn prompt_edits_do_not_change_fingerprint() {
        let dir = project();
        let first = fingerprint(dir.path(), false);

        write(dir.path(), "Context/Prompt/prompt.txt", 999);
        set_mtime(dir.path(), "Context/Prompt/prompt.txt", 5);
        let second = fingerprint(dir.path(), false);

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn nested_prompt_folders_are_not_tracked() {
        let dir = project();
        write(dir.path(), "Procedures/Prompt/draft.txt", 10);
        write(dir.path(), "Procedures/Design/prompt/draft.txt", 10);
        let first = fingerprint(dir.path(), true);

        write(dir.path(), "Procedures/Prompt/draft.txt", 500);
        write(dir.path(), "Procedures/Design/prompt/draft.txt", 500);
        assert_eq!(first, fingerprint(dir.path(), true));
    }

    #[test]
    fn mtime_only_change_is_detected() {
        let dir = project();
        set_mtime(dir.path(), "Procedures/Design/a.txt", 3600);
        let before = fingerprint(dir.path(), false);
        assert_eq!(before, fingerprint(dir.path(), false));

        set_mtime(dir.path(), "Procedures/Design/a.txt", 60);
        let after = fingerprint(dir.path(), false);
        assert_ne!(before, after);
    }

    #[test]
    fn on_demand_edits_follow_tracking_setting() {
        let dir = project();
        write(dir.path(), "Context/General/notes.txt", 50);
        let untracked = fingerprint(dir.path(), false);
        let tracked = fingerprint(dir.path(), true);

        write(dir.path(), "Context/General/notes.txt", 80);
        assert_eq!(untracked, fingerprint(dir.path(), false));
        assert_ne!(tracked, fingerprint(dir.path(), true));
    }

    #[test]
    fn folder_names_match_loosely() {
        let dir = project();
        write(dir.path(), "Context/regulatory_strategy/plan.txt", 40);
        let before = fingerprint(dir.path(), false);
        write(dir.path(), "Context/regulatory_strategy/plan.txt", 41);
        assert_eq!(before, fingerprint(dir.path(), false));
    }

    #[test]
    fn stats_fingerprint_ignores_input_order() {
        let stat = |rel: &str, size| FileStat {
            path: rel.into(),
            relative_path: rel.to_string(),
            size,
            mtime_millis: 1,
        };
        let a = fingerprint_stats(&[stat("x", 1), stat("y", 2)]);
        let b = fingerprint_stats(&[stat("y", 2), stat("x", 1)]);
        assert_eq!(a, b);
        assert_ne!(a, fingerprint_stats(&[stat("x", 1), stat("y", 3)]));
    }
}
