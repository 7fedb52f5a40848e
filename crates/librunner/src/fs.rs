use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use runner_protocol::{EntryKind, TreeEntry};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::RunnerError;

/// File access confined to one workspace root.
///
/// Every operation resolves the client-supplied relative path first: the path
/// is normalized lexically, joined onto the root, and the longest existing
/// prefix is canonicalized so a symlink cannot lead outside the root. Paths
/// that are absolute or climb above the root are refused before any storage
/// is touched.
#[derive(Debug, Clone)]
pub struct WorkspaceFs {
    root: PathBuf,
}

/// A path that passed the sandbox check.
#[derive(Debug, Clone)]
struct Resolved {
    absolute: PathBuf,
    relative: String,
}

impl WorkspaceFs {
    /// Open (creating if needed) the workspace rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RunnerError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List one directory level, directories first, then by name.
    pub async fn list_dir(&self, relative_dir: &str) -> Result<Vec<TreeEntry>, RunnerError> {
        let resolved = self.resolve(relative_dir).await?;
        let mut reader = tokio::fs::read_dir(&resolved.absolute)
            .await
            .map_err(|e| not_found_or_io(e, relative_dir))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => EntryKind::Dir,
                Ok(ft) if ft.is_symlink() => self.symlink_kind(&entry.path()).await,
                Ok(_) => EntryKind::File,
                Err(e) => {
                    debug!(name = %name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            entries.push(TreeEntry {
                path: join_relative(&resolved.relative, &name),
                name,
                kind,
            });
        }

        entries.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// A symlink counts as a directory only when it points at one inside the
    /// root. Dangling links and links leaving the root are listed as files.
    async fn symlink_kind(&self, link: &Path) -> EntryKind {
        match tokio::fs::canonicalize(link).await {
            Ok(target) if target.starts_with(&self.root) => {
                match tokio::fs::metadata(&target).await {
                    Ok(meta) if meta.is_dir() => EntryKind::Dir,
                    _ => EntryKind::File,
                }
            }
            _ => EntryKind::File,
        }
    }

    pub async fn read_file(&self, relative_path: &str) -> Result<Vec<u8>, RunnerError> {
        let resolved = self.resolve(relative_path).await?;
        tokio::fs::read(&resolved.absolute)
            .await
            .map_err(|e| not_found_or_io(e, relative_path))
    }

    /// Write `bytes` to `relative_path`, creating parent directories.
    ///
    /// The content lands in a temporary sibling first and is renamed into
    /// place, so readers see either the old or the new file. Returns the
    /// normalized relative path that was written.
    pub async fn write_file(
        &self,
        relative_path: &str,
        bytes: &[u8],
    ) -> Result<String, RunnerError> {
        let resolved = self.resolve(relative_path).await?;
        if resolved.relative.is_empty() {
            return Err(root_write_error());
        }
        let (Some(parent), Some(file_name)) =
            (resolved.absolute.parent(), resolved.absolute.file_name())
        else {
            return Err(root_write_error());
        };

        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = write_and_rename(&tmp, &resolved.absolute, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %resolved.relative, bytes = bytes.len(), "file written");
        Ok(resolved.relative)
    }

    async fn resolve(&self, relative: &str) -> Result<Resolved, RunnerError> {
        let normalized = normalize_relative(relative)?;
        let joined = self.root.join(&normalized);
        let canonical = canonicalize_with_missing_tail(&joined).await?;
        if !canonical.starts_with(&self.root) {
            return Err(RunnerError::PathDenied(relative.to_string()));
        }

        let relative = normalized
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok(Resolved {
            absolute: joined,
            relative,
        })
    }
}

/// Lexically normalize a client path. `.` segments are dropped and `..`
/// pops a previous segment; popping past the root, absolute paths and
/// platform prefixes are denied.
fn normalize_relative(relative: &str) -> Result<PathBuf, RunnerError> {
    let mut out = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(RunnerError::PathDenied(relative.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(RunnerError::PathDenied(relative.to_string()));
            }
        }
    }
    Ok(out)
}

async fn canonicalize_with_missing_tail(path: &Path) -> Result<PathBuf, RunnerError> {
    let mut missing_components = Vec::new();
    let mut existing = path.to_path_buf();

    while !tokio::fs::try_exists(&existing).await.unwrap_or(false) {
        let Some(name) = existing.file_name() else {
            break;
        };
        missing_components.push(name.to_os_string());
        let Some(parent) = existing.parent() else {
            break;
        };
        existing = parent.to_path_buf();
    }

    let mut canonical = tokio::fs::canonicalize(&existing).await?;
    for component in missing_components.iter().rev() {
        canonical.push(component);
    }
    Ok(canonical)
}

async fn write_and_rename(tmp: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, target).await
}

fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn root_write_error() -> RunnerError {
    RunnerError::Io(std::io::Error::new(
        ErrorKind::InvalidInput,
        "cannot write to the workspace root",
    ))
}

fn not_found_or_io(err: std::io::Error, relative: &str) -> RunnerError {
    if err.kind() == ErrorKind::NotFound {
        RunnerError::NotFound(relative.to_string())
    } else {
        RunnerError::Io(err)
    }
}
