//! Project documents: layout classification, loading, chunking

use crate::config::{IndexingConfig, LayoutConfig};
use crate::error::DhfError;
use crate::policy::Categorized;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use pulldown_cmark::{Event, Parser, TagEnd};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Case- and punctuation-insensitive key for folder and category names.
///
/// "Regulatory-Strategy", "regulatory_strategy" and " Regulatory  Strategy "
/// all map to "regulatory strategy".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CategoryKey(String);

impl CategoryKey {
    pub fn new(raw: &str) -> Self {
        let replaced: String = raw
            .chars()
            .map(|c| if c == '-' || c == '_' { ' ' } else { c })
            .collect();
        let normalized = replaced
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CategoryKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// File stats as reported by a document loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    /// Project-relative, '/'-separated
    pub relative_path: String,
    pub size: u64,
    pub mtime_millis: i64,
}

impl FileStat {
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// Extractive lead summary of one indexed document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub file_name: String,
    pub relative_path: String,
    pub category: String,
    pub subcategory: String,
    pub text: String,
}

impl Categorized for Summary {
    fn category(&self) -> &str {
        &self.category
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// Where a file sits in the project layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Procedure,
    Context,
    /// Context category retrieved only on explicit reference
    OnDemand,
    /// Never cached; read fresh by the generator
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentClass {
    pub kind: DocumentKind,
    pub category: String,
    pub subcategory: String,
}

/// Folder conventions of a project, derived from [`LayoutConfig`].
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    procedures_dir: String,
    context_dir: String,
    prompt_key: CategoryKey,
    on_demand: Vec<CategoryKey>,
}

impl ProjectLayout {
    pub fn new(config: &LayoutConfig) -> Self {
        Self {
            procedures_dir: config.procedures_dir.clone(),
            context_dir: config.context_dir.clone(),
            prompt_key: CategoryKey::new(&config.prompt_dir),
            on_demand: config.on_demand.iter().map(|c| CategoryKey::new(c)).collect(),
        }
    }

    pub fn procedures_dir(&self) -> &str {
        &self.procedures_dir
    }

    pub fn context_dir(&self) -> &str {
        &self.context_dir
    }

    pub fn on_demand(&self) -> &[CategoryKey] {
        &self.on_demand
    }

    pub fn is_on_demand(&self, category: &str) -> bool {
        let key = CategoryKey::new(category);
        self.on_demand.contains(&key)
    }

    /// Classify a project-relative path; `None` when outside both roots.
    pub fn classify(&self, relative_path: &str) -> Option<DocumentClass> {
        let parts: Vec<&str> = relative_path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return None;
        }
        let root = CategoryKey::new(parts[0]);
        // Folders between the root and the file name
        let folders = &parts[1..parts.len() - 1];

        let is_root = root == CategoryKey::new(&self.procedures_dir) || root == CategoryKey::new(&self.context_dir);
        if is_root && folders.iter().any(|f| CategoryKey::new(f) == self.prompt_key) {
            return Some(DocumentClass {
                kind: DocumentKind::Prompt,
                category: self.prompt_key.as_str().to_string(),
                subcategory: String::new(),
            });
        }

        if root == CategoryKey::new(&self.procedures_dir) {
            return Some(DocumentClass {
                kind: DocumentKind::Procedure,
                category: self.procedures_dir.clone(),
                subcategory: folders.first().map(|s| s.to_string()).unwrap_or_default(),
            });
        }

        if root == CategoryKey::new(&self.context_dir) {
            let Some(category) = folders.first() else {
                return Some(DocumentClass {
                    kind: DocumentKind::Context,
                    category: self.context_dir.clone(),
                    subcategory: String::new(),
                });
            };
            let key = CategoryKey::new(category);
            let kind = if self.on_demand.contains(&key) {
                DocumentKind::OnDemand
            } else {
                DocumentKind::Context
            };
            return Some(DocumentClass {
                kind,
                category: category.to_string(),
                subcategory: folders.get(1).map(|s| s.to_string()).unwrap_or_default(),
            });
        }

        None
    }

    /// Folders (relative to the project) excluded from the fingerprint.
    pub fn fingerprint_excludes(&self, track_on_demand: bool) -> Vec<String> {
        let mut excludes = vec![format!("{}/{}", self.context_dir, self.prompt_key.as_str())];
        if !track_on_demand {
            for key in &self.on_demand {
                excludes.push(format!("{}/{}", self.context_dir, key.as_str()));
            }
        }
        excludes
    }

    /// Roots walked for both fingerprinting and indexing.
    pub fn roots(&self) -> Vec<String> {
        vec![self.procedures_dir.clone(), self.context_dir.clone()]
    }
}

/// Source of document stats and text.
///
/// Fingerprint correctness depends on `list_files` reporting accurate
/// size and mtime.
pub trait DocumentLoader: Send + Sync {
    /// List files under `roots` (project-relative folders), skipping any file
    /// under one of `excludes`. Any order; callers sort.
    fn list_files(
        &self,
        project: &Path,
        roots: &[String],
        excludes: &[String],
    ) -> crate::Result<Vec<FileStat>>;

    /// Extract plain text from a file.
    fn read_text(&self, path: &Path) -> crate::Result<String>;
}

/// Filesystem loader for plain-text formats.
pub struct FsDocumentLoader {
    text_types: GlobSet,
}

impl FsDocumentLoader {
    pub fn new(config: &IndexingConfig) -> crate::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for ext in &config.extensions {
            let glob = GlobBuilder::new(&format!("*.{}", ext.trim_start_matches('.')))
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .map_err(|e| DhfError::GlobPattern(e.to_string()))?;
            builder.add(glob);
        }
        let text_types = builder
            .build()
            .map_err(|e| DhfError::GlobPattern(e.to_string()))?;
        Ok(Self { text_types })
    }
}

impl DocumentLoader for FsDocumentLoader {
    fn list_files(
        &self,
        project: &Path,
        roots: &[String],
        excludes: &[String],
    ) -> crate::Result<Vec<FileStat>> {
        if !project.is_dir() {
            return Err(DhfError::ProjectNotFound(project.to_path_buf()));
        }

        let exclude_keys: Vec<Vec<CategoryKey>> =
            excludes.iter().map(|e| path_keys(e)).collect();
        let mut files = Vec::new();

        for root_dir in resolve_roots(project, roots)? {
            let mut builder = WalkBuilder::new(&root_dir);
            builder.standard_filters(false);
            builder.hidden(true);
            builder.follow_links(false);

            for entry in builder.build() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping unreadable directory entry");
                        continue;
                    }
                };
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }

                let path = entry.path();
                let relative_path = relative_slash_path(project, path);
                let keys = path_keys(&relative_path);
                if exclude_keys
                    .iter()
                    .any(|ex| !ex.is_empty() && keys.len() > ex.len() && keys.starts_with(ex))
                {
                    continue;
                }

                // Stat failures here are transient IO; the caller decides whether to retry.
                let meta = fs::metadata(path).map_err(|e| DhfError::io_at(path, e))?;
                files.push(FileStat {
                    path: path.to_path_buf(),
                    relative_path,
                    size: meta.len(),
                    mtime_millis: mtime_millis(&meta),
                });
            }
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files.dedup_by(|a, b| a.relative_path == b.relative_path);
        Ok(files)
    }

    fn read_text(&self, path: &Path) -> crate::Result<String> {
        let name = path.file_name().map(Path::new).unwrap_or(path);
        if !self.text_types.is_match(name) {
            return Err(DhfError::Unsupported(path.to_path_buf()));
        }
        let bytes = fs::read(path).map_err(|e| DhfError::io_at(path, e))?;
        let source = String::from_utf8_lossy(&bytes).into_owned();

        let is_markdown = matches!(
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .as_deref(),
            Some("md" | "markdown")
        );
        if is_markdown {
            Ok(markdown_to_text(&source))
        } else {
            Ok(source)
        }
    }
}

/// Match configured root names against the project's top-level folders,
/// tolerating case and punctuation differences.
fn resolve_roots(project: &Path, roots: &[String]) -> crate::Result<Vec<PathBuf>> {
    let wanted: Vec<CategoryKey> = roots.iter().map(|r| CategoryKey::new(r)).collect();
    let mut found = Vec::new();
    let entries = fs::read_dir(project).map_err(|e| DhfError::io_at(project, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DhfError::io_at(project, e))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if wanted.contains(&CategoryKey::new(&name)) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn path_keys(relative: &str) -> Vec<CategoryKey> {
    relative
        .split('/')
        .filter(|p| !p.is_empty())
        .map(CategoryKey::new)
        .collect()
}

fn relative_slash_path(project: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(project).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn mtime_millis(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Render markdown to plain text, one block per line.
fn markdown_to_text(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for event in Parser::new(source) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item | TagEnd::CodeBlock) => {
                out.push('\n')
            }
            _ => {}
        }
    }
    out
}

/// Split text into overlapping chunks of roughly `chunk_chars` characters,
/// breaking on whitespace where possible.
pub fn chunk_text(text: &str, chunk_chars: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let chunk_chars = chunk_chars.max(1);
    let overlap = overlap.min(chunk_chars / 2);
    let mut chunks = Vec::new();

    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + chunk_chars).min(chars.len());
        if end < chars.len() {
            let floor = start + chunk_chars / 2;
            if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws;
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if end >= chars.len() {
            break;
        }

        let mut next = end.saturating_sub(overlap).max(start + 1);
        if overlap > 0 {
            // Start the overlap on a word boundary
            while next < end && !chars[next - 1].is_whitespace() {
                next += 1;
            }
        }
        start = next;
    }

    chunks
}

/// First `max_chars` characters of whitespace-collapsed text, cut on a word.
pub fn lead_summary(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    let trimmed = match cut.rfind(' ') {
        Some(pos) if pos > max_chars / 2 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}...", trimmed.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn layout() -> ProjectLayout {
        ProjectLayout::new(&Config::default().layout)
    }

    #[test]
    fn category_key_ignores_case_and_punctuation() {
        assert_eq!(
            CategoryKey::new("Regulatory-Strategy"),
            CategoryKey::new(" regulatory_strategy ")
        );
        assert_eq!(CategoryKey::new("Design  Controls").as_str(), "design controls");
    }

    #[test]
    fn classify_procedure_and_context_paths() {
        let layout = layout();
        let proc = layout.classify("Procedures/Design Controls/sop-01.txt").unwrap();
        assert_eq!(proc.kind, DocumentKind::Procedure);
        assert_eq!(proc.subcategory, "Design Controls");

        let general = layout.classify("Context/general/notes.txt").unwrap();
        assert_eq!(general.kind, DocumentKind::OnDemand);
        assert_eq!(general.category, "general");

        let prompt = layout.classify("context/Prompt/p.txt").unwrap();
        assert_eq!(prompt.kind, DocumentKind::Prompt);
        for nested in ["Procedures/Prompt/p.txt", "Procedures/Design/prompt/p.md", "Context/Risk/Prompt/p.txt"] {
            assert_eq!(layout.classify(nested).unwrap().kind, DocumentKind::Prompt, "{nested}");
        }

        let ctx = layout.classify("Context/Risk/fmea/a.txt").unwrap();
        assert_eq!(ctx.kind, DocumentKind::Context);
        assert_eq!(ctx.category, "Risk");
        assert_eq!(ctx.subcategory, "fmea");

        assert!(layout.classify("README.txt").is_none());
        assert!(layout.classify("Other/a.txt").is_none());
    }

    #[test]
    fn list_files_sorted_and_excluded() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for rel in [
            "Procedures/B/b.txt",
            "Procedures/A/a.txt",
            "Context/Prompt/p.txt",
            "Context/Risk/r.txt",
            "Context/.hidden.txt",
            "Unrelated/u.txt",
        ] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "x").unwrap();
        }

        let loader = FsDocumentLoader::new(&Config::default().indexing).unwrap();
        let layout = layout();
        let files = loader
            .list_files(root, &layout.roots(), &layout.fingerprint_excludes(false))
            .unwrap();
        let rels: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(
            rels,
            vec!["Context/Risk/r.txt", "Procedures/A/a.txt", "Procedures/B/b.txt"]
        );
        assert_eq!(files[0].size, 1);
    }

    #[test]
    fn read_text_rejects_unsupported_and_renders_markdown() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("scan.pdf");
        fs::write(&pdf, b"%PDF-1.4").unwrap();
        let md = dir.path().join("doc.MD");
        fs::write(&md, "# Title\n\nSome *emphasis* here.\n").unwrap();

        let loader = FsDocumentLoader::new(&Config::default().indexing).unwrap();
        assert!(matches!(
            loader.read_text(&pdf),
            Err(DhfError::Unsupported(_))
        ));
        let text = loader.read_text(&md).unwrap();
        assert!(text.contains("Title"));
        assert!(text.contains("Some emphasis here."));
        assert!(!text.contains('#'));
    }

    #[test]
    fn chunk_text_overlaps_and_covers() {
        let text = (0..200).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunk_text(&text, 100, 20);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert!(chunks[0].starts_with("word0"));
        assert!(chunks.last().unwrap().ends_with("word199"));
        // Overlap repeats the tail of one chunk at the head of the next
        let tail = chunks[0].split(' ').last().unwrap();
        assert!(chunks[1].contains(tail));
    }

    #[test]
    fn chunk_text_empty_input() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text("   \n ", 100, 10).is_empty());
    }

    #[test]
    fn lead_summary_cuts_on_word() {
        let summary = lead_summary("alpha beta\n\ngamma delta epsilon", 16);
        assert_eq!(summary, "alpha beta...");
        assert_eq!(lead_summary("short text", 100), "short text");
    }
}
