use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sleepwalk_protocol::{Discovery, DiscoveryKind, SleepwalkError, SleepwalkResult};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

pub const DEFAULT_PREVIEW_BYTES: usize = 256;
pub const DEFAULT_MAX_DEPTH: usize = 3;
pub const DEFAULT_IGNORED_NAMES: [&str; 9] = [
    ".git",
    "__pycache__",
    ".cache",
    "node_modules",
    ".venv",
    "venv",
    ".pytest_cache",
    ".mypy_cache",
    ".DS_Store",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerOptions {
    /// Byte cap for file previews; zero disables previews.
    pub preview_bytes: usize,
    /// Deepest directory level below a root that is reported and listed
    /// (children of a root are level 1). Files inside a listed directory are
    /// always reported, so they may sit one level deeper.
    pub max_depth: Option<usize>,
    /// Entry names that are neither reported nor descended into.
    pub ignored_names: Vec<String>,
}

impl Default for ExplorerOptions {
    fn default() -> Self {
        Self {
            preview_bytes: DEFAULT_PREVIEW_BYTES,
            max_depth: Some(DEFAULT_MAX_DEPTH),
            ignored_names: DEFAULT_IGNORED_NAMES
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
        }
    }
}

impl ExplorerOptions {
    pub fn preview_bytes(mut self, preview_bytes: usize) -> Self {
        self.preview_bytes = preview_bytes;
        self
    }

    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn ignored_names(mut self, ignored_names: Vec<String>) -> Self {
        self.ignored_names = ignored_names;
        self
    }

    fn is_ignored(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.ignored_names.iter().any(|ignored| ignored == name))
    }
}

/// Live counters for one `wander()` call.
#[derive(Debug, Default)]
pub struct WanderStats {
    discovered: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    unreadable_roots: AtomicU64,
}

impl WanderStats {
    pub fn snapshot(&self) -> ExplorationStats {
        ExplorationStats {
            discovered: self.discovered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unreadable_roots: self.unreadable_roots.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorationStats {
    pub discovered: u64,
    /// Entries that vanished or could not be read, and in-root symlinks,
    /// whose targets the walk reaches on their own.
    pub skipped: u64,
    /// Entries that resolved outside the allowed roots.
    pub rejected: u64,
    pub unreadable_roots: u64,
}

/// Walks a fixed set of allowed roots without ever leaving them.
#[derive(Debug, Clone)]
pub struct SafeExplorer {
    roots: Arc<Vec<PathBuf>>,
    options: Arc<ExplorerOptions>,
}

impl SafeExplorer {
    /// Canonicalizes `roots`, keeping their order. Roots that cannot be
    /// resolved are dropped, and roots nested inside an earlier root are
    /// folded into it so no entry is reported twice.
    pub fn new<I, P>(roots: I, options: ExplorerOptions) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical_roots: Vec<PathBuf> = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let canonical = match root.canonicalize() {
                Ok(canonical) => canonical,
                Err(error) => {
                    warn!(root = %root.display(), %error, "dropping unresolvable root");
                    continue;
                }
            };
            if canonical_roots
                .iter()
                .any(|existing| canonical.starts_with(existing))
            {
                debug!(root = %canonical.display(), "root already covered");
                continue;
            }
            canonical_roots.retain(|existing| !existing.starts_with(&canonical));
            canonical_roots.push(canonical);
        }

        Self {
            roots: Arc::new(canonical_roots),
            options: Arc::new(options),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn options(&self) -> &ExplorerOptions {
        &self.options
    }

    /// True iff `path` resolves (symlinks and `..` included) to one of the
    /// roots or a descendant of one. Paths that cannot be resolved are unsafe.
    pub fn is_safe_path(&self, path: impl AsRef<Path>) -> bool {
        match path.as_ref().canonicalize() {
            Ok(canonical) => contained(&self.roots, &canonical),
            Err(_) => false,
        }
    }

    /// Starts a fresh walk over every root. Each call is independent; for an
    /// unchanged filesystem two walks yield the same sequence.
    pub fn wander(&self) -> Wander {
        let stats = Arc::new(WanderStats::default());
        let inner = walk(self.roots.clone(), self.options.clone(), stats.clone()).boxed();
        Wander { inner, stats }
    }
}

/// Lazy stream of discoveries. Dropping it stops the walk.
pub struct Wander {
    inner: BoxStream<'static, Discovery>,
    stats: Arc<WanderStats>,
}

impl Wander {
    pub fn stats(&self) -> ExplorationStats {
        self.stats.snapshot()
    }
}

impl Stream for Wander {
    type Item = Discovery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

enum Inspection {
    Found(Discovery),
    Rejected,
    Alias,
    Skipped(SleepwalkError),
}

fn contained(roots: &[PathBuf], canonical: &Path) -> bool {
    roots.iter().any(|root| canonical.starts_with(root))
}

fn walk(
    roots: Arc<Vec<PathBuf>>,
    options: Arc<ExplorerOptions>,
    stats: Arc<WanderStats>,
) -> impl Stream<Item = Discovery> + Send + 'static {
    stream! {
        for root in roots.iter() {
            let mut pending = vec![(root.clone(), 0_usize)];

            while let Some((directory, depth)) = pending.pop() {
                let entries = match read_sorted(&directory).await {
                    Ok(entries) => entries,
                    Err(error) if directory == *root => {
                        warn!(%error, "allowed root unreadable, skipping");
                        WanderStats::bump(&stats.unreadable_roots);
                        continue;
                    }
                    Err(error) => {
                        debug!(%error, "directory skipped");
                        WanderStats::bump(&stats.skipped);
                        continue;
                    }
                };

                let level = depth + 1;
                let listed = options.max_depth.is_none_or(|max| level <= max);
                let mut subdirectories = Vec::new();
                for path in entries {
                    if options.is_ignored(&path) {
                        continue;
                    }
                    match inspect(&roots, &path, options.preview_bytes).await {
                        Inspection::Found(discovery) => {
                            if discovery.kind == DiscoveryKind::Directory {
                                if !listed {
                                    continue;
                                }
                                subdirectories.push(discovery.path.clone());
                            }
                            WanderStats::bump(&stats.discovered);
                            yield discovery;
                        }
                        Inspection::Rejected => WanderStats::bump(&stats.rejected),
                        Inspection::Alias => WanderStats::bump(&stats.skipped),
                        Inspection::Skipped(error) => {
                            debug!(%error, "entry skipped");
                            WanderStats::bump(&stats.skipped);
                        }
                    }
                }

                for subdirectory in subdirectories.into_iter().rev() {
                    pending.push((subdirectory, level));
                }
            }
        }
    }
}

fn traversal(path: &Path) -> impl FnOnce(std::io::Error) -> SleepwalkError + '_ {
    move |source| SleepwalkError::Traversal {
        path: path.to_path_buf(),
        source,
    }
}

async fn read_sorted(directory: &Path) -> SleepwalkResult<Vec<PathBuf>> {
    let mut reader = fs::read_dir(directory)
        .await
        .map_err(traversal(directory))?;
    let mut entries = Vec::new();
    loop {
        match reader.next_entry().await {
            Ok(Some(entry)) => entries.push(entry.path()),
            Ok(None) => break,
            Err(error) => {
                debug!(path = %directory.display(), %error, "directory listing cut short");
                break;
            }
        }
    }
    entries.sort();
    Ok(entries)
}

async fn inspect(roots: &[PathBuf], path: &Path, preview_bytes: usize) -> Inspection {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) => return Inspection::Skipped(traversal(path)(error)),
    };
    let canonical = match fs::canonicalize(path).await {
        Ok(canonical) => canonical,
        Err(error) => return Inspection::Skipped(traversal(path)(error)),
    };
    if !contained(roots, &canonical) {
        debug!(
            path = %path.display(),
            resolved = %canonical.display(),
            "entry resolves outside allowed roots"
        );
        return Inspection::Rejected;
    }

    // The target of an in-root link is reached by the walk itself.
    if metadata.file_type().is_symlink() {
        debug!(
            path = %path.display(),
            target = %canonical.display(),
            "symlink inside allowed roots, not reported twice"
        );
        return Inspection::Alias;
    }
    let modified_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    if metadata.is_dir() {
        Inspection::Found(Discovery::directory(canonical, modified_at))
    } else if metadata.is_file() {
        let preview = read_preview(&canonical, preview_bytes).await;
        Inspection::Found(Discovery::file(
            canonical,
            metadata.len(),
            modified_at,
            preview,
        ))
    } else {
        Inspection::Skipped(traversal(path)(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "neither a file nor a directory",
        )))
    }
}

async fn read_preview(path: &Path, cap: usize) -> Option<String> {
    if cap == 0 {
        return None;
    }
    let file = fs::File::open(path).await.ok()?;
    let mut buffer = Vec::with_capacity(cap);
    file.take(cap as u64).read_to_end(&mut buffer).await.ok()?;
    decode_preview(&buffer)
}

/// Decodes a raw preview. Binary content (any NUL byte) and invalid UTF-8
/// yield no preview; a character cut by the byte cap is dropped.
pub fn decode_preview(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(error) if error.error_len().is_none() => {
            std::str::from_utf8(&bytes[..error.valid_up_to()]).ok()?
        }
        Err(_) => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}
