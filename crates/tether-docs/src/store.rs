//! File-backed document store shared by plans and jobs.
//!
//! Writes go through [`DocStore::modify`]: a read-modify-write that holds a
//! per-path async lock, checks the caller's expected version, and re-reads
//! the file right before the atomic rename. An edit made by another process
//! in between is reported as [`DocError::Conflict`] instead of being
//! overwritten.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::checklist::{self, Task};
use crate::errors::{DocError, Result};
use crate::frontmatter::{self, Frontmatter};

const FINGERPRINT_SLICE: usize = 64;

/// Content version: SHA-256 hex of the file bytes.
pub fn content_version(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Cheap change detector: length plus head and tail slices.
pub fn fingerprint(content: &str) -> String {
    let head_end = floor_char_boundary(content, FINGERPRINT_SLICE.min(content.len()));
    let tail_start = ceil_char_boundary(content, content.len().saturating_sub(FINGERPRINT_SLICE));
    format!(
        "{}:{}:{}",
        content.len(),
        &content[..head_end],
        &content[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// A parsed document, independent of plan/job semantics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Absolute path.
    pub path: PathBuf,
    /// Title from the header, first heading, or file stem.
    pub title: String,
    /// Header entries.
    pub frontmatter: Frontmatter,
    /// Checklist tasks.
    pub tasks: Vec<Task>,
    /// Number of tasks.
    pub task_count: usize,
    /// Number of ticked tasks.
    pub done_count: usize,
    /// Content version for optimistic writes.
    pub version: String,
    /// Raw file content.
    #[serde(skip)]
    pub content: String,
}

impl Document {
    /// Parse `content` read from `path`.
    pub fn parse(path: &Path, content: String) -> Self {
        let parts = frontmatter::split(&content);
        let tasks = checklist::parse_tasks(&content, parts.header_lines);
        let (task_count, done_count) = checklist::counts(&tasks);
        let title = parts
            .frontmatter
            .get_nonempty("title")
            .map(str::to_owned)
            .or_else(|| checklist::first_heading(parts.body))
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
        let frontmatter = parts.frontmatter;
        Self {
            path: path.to_path_buf(),
            title,
            frontmatter,
            tasks,
            task_count,
            done_count,
            version: content_version(&content),
            content,
        }
    }

    /// Every task ticked, and at least one task.
    pub fn all_done(&self) -> bool {
        self.task_count > 0 && self.done_count == self.task_count
    }

    /// Body text after the header block.
    pub fn body(&self) -> &str {
        frontmatter::split(&self.content).body
    }
}

/// Markdown documents under a set of directories of one workspace.
pub struct DocStore {
    root: PathBuf,
    dirs: Vec<PathBuf>,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DocStore {
    /// Store over `dirs`, each relative to `root` unless absolute.
    pub fn new(root: &Path, dirs: &[String]) -> Self {
        Self {
            root: root.to_path_buf(),
            dirs: dirs.iter().map(|d| root.join(d)).collect(),
            locks: DashMap::new(),
        }
    }

    /// Configured directories (existing or not).
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Resolve a client-supplied path and check it is inside the store.
    ///
    /// Relative paths are tried against the workspace root first, then
    /// against the first document directory.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let rooted = self.root.join(path);
            match self.dirs.first() {
                Some(dir) if !self.dirs.iter().any(|d| rooted.starts_with(d)) => dir.join(path),
                _ => rooted,
            }
        };
        if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(DocError::OutsideRoot(candidate));
        }
        if self.dirs.iter().any(|d| candidate.starts_with(d)) {
            Ok(candidate)
        } else {
            Err(DocError::OutsideRoot(candidate))
        }
    }

    /// All `*.md` documents directly inside the directories, sorted by path.
    /// Missing directories and unreadable files are skipped.
    pub async fn scan(&self) -> Vec<Document> {
        let mut docs = Vec::new();
        for dir in &self.dirs {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "document directory unavailable");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => docs.push(Document::parse(&path, content)),
                    Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable document"),
                }
            }
        }
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        docs
    }

    /// Read and parse one document.
    pub async fn read(&self, path: &Path) -> Result<Document> {
        let path = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DocError::io(&path, e))?;
        Ok(Document::parse(&path, content))
    }

    /// Create a new document named after `title`, never overwriting.
    pub async fn create(&self, title: &str, content: &str) -> Result<Document> {
        let dir = self
            .dirs
            .first()
            .ok_or_else(|| DocError::OutsideRoot(PathBuf::from(title)))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DocError::io(dir, e))?;

        let stem = slugify(title);
        let mut n = 1;
        loop {
            let path = if n == 1 {
                dir.join(format!("{stem}.md"))
            } else {
                dir.join(format!("{stem}-{n}.md"))
            };
            let _guard = self.lock(&path).await;
            // Reserve the name atomically; a concurrent create moves on.
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    n += 1;
                    continue;
                }
                Err(e) => return Err(DocError::io(&path, e)),
            }
            if let Err(e) = write_atomic(&path, content).await {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
            return Ok(Document::parse(&path, content.to_owned()));
        }
    }

    /// Replace a document's content wholesale.
    pub async fn write(
        &self,
        path: &Path,
        content: &str,
        expected_version: Option<&str>,
    ) -> Result<Document> {
        let content = content.to_owned();
        self.modify(path, expected_version, move |_| Ok(content)).await
    }

    /// Tick or untick the task on `line`.
    pub async fn update_task(
        &self,
        path: &Path,
        line: usize,
        done: bool,
        expected_version: Option<&str>,
    ) -> Result<Document> {
        let target = self.resolve(path)?;
        self.modify(path, expected_version, |current| {
            let header_lines = frontmatter::split(current).header_lines;
            checklist::set_task(current, header_lines, line, done)
                .ok_or(DocError::InvalidTask { path: target, line })
        })
        .await
    }

    /// Edit the header, leaving the body untouched.
    pub async fn edit_frontmatter(
        &self,
        path: &Path,
        expected_version: Option<&str>,
        edit: impl FnOnce(&mut Frontmatter) + Send,
    ) -> Result<Document> {
        self.modify(path, expected_version, |current| {
            Ok(frontmatter::edit(current, edit))
        })
        .await
    }

    /// Locked read-modify-write with optimistic version checks.
    pub async fn modify(
        &self,
        path: &Path,
        expected_version: Option<&str>,
        apply: impl FnOnce(&str) -> Result<String> + Send,
    ) -> Result<Document> {
        let path = self.resolve(path)?;
        let _guard = self.lock(&path).await;

        let current = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DocError::io(&path, e))?;
        let base_version = content_version(&current);
        if let Some(expected) = expected_version {
            if expected != base_version {
                return Err(DocError::Conflict {
                    path,
                    expected: expected.to_owned(),
                    actual: base_version,
                });
            }
        }

        let updated = apply(&current)?;
        if updated == current {
            return Ok(Document::parse(&path, current));
        }

        // Another process may have written since our read.
        let latest = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DocError::io(&path, e))?;
        if latest != current {
            return Err(DocError::Conflict {
                path,
                expected: base_version,
                actual: content_version(&latest),
            });
        }

        write_atomic(&path, &updated).await?;
        Ok(Document::parse(&path, updated))
    }

    async fn lock(&self, path: &Path) -> PathGuard<'_> {
        let mutex = self
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PathGuard {
            guard: Some(mutex.lock_owned().await),
            locks: &self.locks,
            path: path.to_path_buf(),
        }
    }
}

/// Held per-path lock. The map entry is dropped with its last holder.
struct PathGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<PathBuf, Arc<Mutex<()>>>,
    path: PathBuf,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let _ = self
            .locks
            .remove_if(&self.path, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Write through a sibling temp file and rename over the target.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| DocError::io(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(DocError::Io {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

/// Lowercase, dash-separated file stem for a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "untitled".to_owned()
    } else {
        slug.chars().take(60).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn store(dir: &Path) -> DocStore {
        DocStore::new(dir, &["plans".to_string()])
    }

    async fn seed(dir: &Path, name: &str, content: &str) -> PathBuf {
        let plans = dir.join("plans");
        tokio::fs::create_dir_all(&plans).await.unwrap();
        let path = plans.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[test]
    fn fingerprint_uses_length_head_and_tail() {
        let short = fingerprint("abc");
        assert_eq!(short, "3:abc:abc");
        let long = "x".repeat(200) + "tail";
        let fp = fingerprint(&long);
        assert!(fp.starts_with("204:"));
        assert!(fp.ends_with("tail"));
        assert_ne!(fingerprint("abcd"), fingerprint("abce"));
    }

    #[test]
    fn fingerprint_respects_char_boundaries() {
        let text = "é".repeat(100);
        let _ = fingerprint(&text);
    }

    #[test]
    fn version_changes_with_content() {
        assert_eq!(content_version("a"), content_version("a"));
        assert_ne!(content_version("a"), content_version("b"));
        assert_eq!(content_version("a").len(), 64);
    }

    #[test]
    fn document_title_fallbacks() {
        let with_header = Document::parse(Path::new("/p/x.md"), "---\ntitle: T\n---\n# H\n".into());
        assert_eq!(with_header.title, "T");
        let with_heading = Document::parse(Path::new("/p/x.md"), "# Heading\n".into());
        assert_eq!(with_heading.title, "Heading");
        let bare = Document::parse(Path::new("/p/stem.md"), "- [ ] a\n".into());
        assert_eq!(bare.title, "stem");
    }

    #[tokio::test]
    async fn scan_tolerates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).scan().await.is_empty());
    }

    #[tokio::test]
    async fn scan_tolerates_malformed_header() {
        let dir = tempfile::tempdir().unwrap();
        let _ = seed(dir.path(), "bad.md", "---\ntitle: never closed\n- [x] a\n").await;
        let _ = seed(dir.path(), "ok.md", "---\ntitle: fine\n---\n- [ ] b\n").await;
        let _ = seed(dir.path(), "notes.txt", "ignored").await;
        let docs = store(dir.path()).scan().await;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].done_count, 1);
        assert_eq!(docs[1].title, "fine");
    }

    #[tokio::test]
    async fn update_task_twice_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed(dir.path(), "p.md", "- [ ] a\n- [ ] b\n").await;
        let s = store(dir.path());
        let first = s.update_task(&path, 2, true, None).await.unwrap();
        let second = s.update_task(&path, 2, true, None).await.unwrap();
        assert_eq!((first.task_count, first.done_count), (2, 1));
        assert_eq!((second.task_count, second.done_count), (2, 1));
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn update_task_rejects_non_task_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed(dir.path(), "p.md", "# Title\n- [ ] a\n").await;
        let err = store(dir.path()).update_task(&path, 1, true, None).await.unwrap_err();
        assert_matches!(err, DocError::InvalidTask { line: 1, .. });
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed(dir.path(), "p.md", "- [ ] a\n").await;
        let s = store(dir.path());
        let before = s.read(&path).await.unwrap();
        tokio::fs::write(&path, "- [ ] a\n- [ ] added by agent\n").await.unwrap();
        let err = s
            .update_task(&path, 1, true, Some(&before.version))
            .await
            .unwrap_err();
        assert_matches!(err, DocError::Conflict { .. });
        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(on_disk.contains("added by agent"));
    }

    #[tokio::test]
    async fn paths_outside_store_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert_matches!(s.resolve(Path::new("/etc/passwd")), Err(DocError::OutsideRoot(_)));
        assert_matches!(s.resolve(Path::new("../secret.md")), Err(DocError::OutsideRoot(_)));
        assert!(s.resolve(Path::new("p.md")).unwrap().starts_with(dir.path().join("plans")));
        assert_eq!(
            s.resolve(Path::new("plans/p.md")).unwrap(),
            dir.path().join("plans").join("p.md")
        );
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path()).read(Path::new("gone.md")).await.unwrap_err();
        assert_matches!(err, DocError::NotFound(_));
    }

    #[tokio::test]
    async fn create_picks_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let a = s.create("Ship It!", "# Ship It\n").await.unwrap();
        let b = s.create("Ship It!", "# Ship It\n").await.unwrap();
        assert!(a.path.ends_with("ship-it.md"));
        assert!(b.path.ends_with("ship-it-2.md"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for _ in 0..10 {
            let (a, b) = tokio::join!(s.create("Same", "# A\n"), s.create("Same", "# B\n"));
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_ne!(a.path, b.path);
            assert_eq!(tokio::fs::read_to_string(&a.path).await.unwrap(), "# A\n");
            assert_eq!(tokio::fs::read_to_string(&b.path).await.unwrap(), "# B\n");
        }
        assert_eq!(s.scan().await.len(), 20);
        assert!(s.locks.is_empty());
    }

    #[tokio::test]
    async fn locks_are_released_after_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed(dir.path(), "p.md", "- [ ] a\n").await;
        let s = store(dir.path());
        let _ = s.update_task(&path, 1, true, None).await.unwrap();
        let _ = s.create("Other", "# Other\n").await.unwrap();
        assert!(s.locks.is_empty());
    }

    #[tokio::test]
    async fn failed_write_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed(dir.path(), "p.md", "- [ ] a\n").await;
        // A directory where the temp file goes makes the write fail for any user.
        tokio::fs::create_dir(dir.path().join("plans").join(".p.md.tmp")).await.unwrap();
        let err = store(dir.path()).update_task(&path, 1, true, None).await.unwrap_err();
        assert_matches!(err, DocError::Io { .. });
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"- [ ] a\n");
    }

    #[tokio::test]
    async fn edit_frontmatter_keeps_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed(dir.path(), "p.md", "---\nstatus: draft\n---\n- [x] a\n").await;
        let doc = store(dir.path())
            .edit_frontmatter(&path, None, |fm| fm.set("status", "complete"))
            .await
            .unwrap();
        assert_eq!(doc.frontmatter.get("status"), Some("complete"));
        assert_eq!(doc.body(), "- [x] a\n");
        assert_eq!(doc.tasks[0].line, 4);
    }

    #[test]
    fn slugify_titles() {
        assert_eq!(slugify("Ship It!"), "ship-it");
        assert_eq!(slugify("  "), "untitled");
        assert_eq!(slugify("a--b"), "a-b");
    }
}
