use crate::config::LinkMode;
use crate::matcher::{FileAction, FileMapping};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The result type for all reconcile operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// The prefix of the temporary staging directory placed next to the target root.
const STAGING_PREFIX: &str = ".nemorosa-stage";

/// The errors that can occur while materializing a file mapping.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReconcileError {
    /// A filesystem operation failed.
    #[error("an io error occurred on {0:?}, {1}")]
    Io(PathBuf, String),
    /// A target path would escape the target root.
    #[error("target path {0:?} escapes the target root")]
    InvalidTarget(PathBuf),
    /// Every linking fallback was exhausted for the given file.
    #[error("unable to link {0:?}, {1}")]
    LinkFailed(PathBuf, String),
    /// The filesystem doesn't support copy-on-write clones.
    #[error("reflink is not supported for {0:?}, {1}")]
    ReflinkUnsupported(PathBuf, String),
    /// The operation was cancelled while staging.
    #[error("reconciliation has been cancelled")]
    Cancelled,
}

/// Materializes accepted file mappings on the filesystem.
///
/// Non-skip actions are staged below a temporary sibling directory of the
/// target root first; only when every action staged successfully is the staged
/// tree swapped into place. A failure during staging removes the staging
/// directory and leaves the local files untouched.
///
/// An advisory lock per local save path prevents two pipelines from mutating
/// the same local files concurrently.
#[derive(Debug, Default)]
pub struct Reconciler {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the given mapping, projecting the local files below `local_root`
    /// into the layout the target expects below `target_root`.
    ///
    /// Applying an already applied mapping is a no-op.
    ///
    /// # Returns
    ///
    /// Returns an error when the staging couldn't be completed, in which case
    /// the filesystem is left as it was.
    pub async fn apply(
        &self,
        mapping: &FileMapping,
        local_root: &Path,
        target_root: &Path,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.save_path_lock(local_root).await;
        let staging_root = staging_path(target_root);

        let result = self
            .stage_and_commit(mapping, local_root, target_root, &staging_root, cancellation)
            .await;

        if result.is_err() && staging_root.exists() {
            trace!("Removing staging directory {:?}", staging_root);
            if let Err(e) = tokio::fs::remove_dir_all(&staging_root).await {
                warn!("Failed to remove staging directory {:?}, {}", staging_root, e);
            }
        }

        result
    }

    async fn stage_and_commit(
        &self,
        mapping: &FileMapping,
        local_root: &Path,
        target_root: &Path,
        staging_root: &Path,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        // (relative target, staged absolute) pairs which need the final swap
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
        // renames are deferred until staging succeeded so a rollback never
        // has to restore moved local files
        let mut renames: Vec<(PathBuf, PathBuf)> = Vec::new();

        for action in mapping.actions() {
            if cancellation.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }

            let target = validated(action.target())?;
            let final_path = target_root.join(&target);

            match action {
                FileAction::Identical { .. } | FileAction::Skip { .. } | FileAction::Missing { .. } => {}
                FileAction::Rename { local, .. } => {
                    let source = local_root.join(validated(local)?);
                    if is_applied(&source, &final_path).await {
                        continue;
                    }
                    renames.push((source, final_path));
                }
                FileAction::Link { local, mode, .. } => {
                    let source = local_root.join(validated(local)?);
                    if is_applied(&source, &final_path).await {
                        continue;
                    }

                    let stage_path = staging_root.join(&target);
                    create_parent(&stage_path).await?;
                    link_with_fallback(&source, &stage_path, *mode).await?;
                    staged.push((target, stage_path));
                }
            }
        }

        if staged.is_empty() && renames.is_empty() {
            trace!("Mapping below {:?} is already applied", target_root);
            return Ok(());
        }

        // everything staged, swap the tree in and perform the deferred renames
        for (target, stage_path) in staged {
            let final_path = target_root.join(&target);
            create_parent(&final_path).await?;
            tokio::fs::rename(&stage_path, &final_path)
                .await
                .map_err(|e| ReconcileError::Io(final_path.clone(), e.to_string()))?;
        }
        for (source, final_path) in renames {
            create_parent(&final_path).await?;
            match tokio::fs::rename(&source, &final_path).await {
                Ok(_) => {}
                // a cross device rename downgrades to a link into the new root
                Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
                    debug!(
                        "Cross device rename of {:?} downgraded to a link",
                        source
                    );
                    link_with_fallback(&source, &final_path, LinkMode::Hard).await?;
                }
                Err(e) => return Err(ReconcileError::Io(source.clone(), e.to_string())),
            }
        }

        if staging_root.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(staging_root).await {
                warn!("Failed to remove staging directory {:?}, {}", staging_root, e);
            }
        }

        debug!("Mapping materialized below {:?}", target_root);
        Ok(())
    }

    async fn save_path_lock(&self, local_root: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(local_root.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }
}

/// Get the staging directory for the given target root.
fn staging_path(target_root: &Path) -> PathBuf {
    target_root.join(STAGING_PREFIX)
}

/// Validate that the given relative path stays below its root.
fn validated(path: &Path) -> Result<PathBuf> {
    let valid = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));

    if valid && !path.as_os_str().is_empty() {
        Ok(path.to_path_buf())
    } else {
        Err(ReconcileError::InvalidTarget(path.to_path_buf()))
    }
}

/// Check if the action source has already been projected onto the final path.
async fn is_applied(source: &Path, final_path: &Path) -> bool {
    if source == final_path {
        return true;
    }

    let Ok(final_meta) = tokio::fs::metadata(final_path).await else {
        return false;
    };

    match tokio::fs::metadata(source).await {
        Ok(source_meta) => source_meta.len() == final_meta.len(),
        // the source has already moved away, the final file is the result
        Err(_) => true,
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ReconcileError::Io(parent.to_path_buf(), e.to_string()))?;
    }
    Ok(())
}

/// Project the source file onto the destination with the given mode,
/// degrading hard to sym to reflink. Reflink failures are final.
async fn link_with_fallback(source: &Path, destination: &Path, mode: LinkMode) -> Result<()> {
    if !source.exists() {
        return Err(ReconcileError::Io(
            source.to_path_buf(),
            "source file does not exist".to_string(),
        ));
    }

    match mode {
        LinkMode::None => Err(ReconcileError::LinkFailed(
            destination.to_path_buf(),
            "linking is disabled".to_string(),
        )),
        LinkMode::Hard => match tokio::fs::hard_link(source, destination).await {
            Ok(_) => Ok(()),
            Err(e) => {
                trace!(
                    "Hard link of {:?} failed ({}), falling back to symlink",
                    source,
                    e
                );
                Box::pin(link_with_fallback(source, destination, LinkMode::Sym)).await
            }
        },
        LinkMode::Sym => match symlink(source, destination).await {
            Ok(_) => Ok(()),
            Err(e) => {
                trace!(
                    "Symlink of {:?} failed ({}), falling back to reflink",
                    source,
                    e
                );
                Box::pin(link_with_fallback(source, destination, LinkMode::Reflink)).await
            }
        },
        LinkMode::Reflink => reflink(source, destination).await,
    }
}

async fn symlink(source: &Path, destination: &Path) -> std::io::Result<()> {
    // the torrent client needs to resolve the link, so the source is absolutized
    let absolute = if source.is_absolute() {
        source.to_path_buf()
    } else {
        std::env::current_dir()?.join(source)
    };

    #[cfg(unix)]
    {
        tokio::fs::symlink(absolute, destination).await
    }
    #[cfg(not(unix))]
    {
        tokio::fs::symlink_file(absolute, destination).await
    }
}

/// Clone the source file onto the destination with a copy-on-write reflink.
/// Fails hard when the filesystem doesn't support extent sharing.
#[cfg(target_os = "linux")]
async fn reflink(source: &Path, destination: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;

    // _IOW(0x94, 9, int)
    const FICLONE: libc::c_ulong = 0x40049409;

    let source = source.to_path_buf();
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let input = std::fs::File::open(&source)
            .map_err(|e| ReconcileError::Io(source.clone(), e.to_string()))?;
        let output = std::fs::File::create(&destination)
            .map_err(|e| ReconcileError::Io(destination.clone(), e.to_string()))?;

        let result = unsafe { libc::ioctl(output.as_raw_fd(), FICLONE, input.as_raw_fd()) };
        if result != 0 {
            let error = std::io::Error::last_os_error();
            let _ = std::fs::remove_file(&destination);
            return Err(ReconcileError::ReflinkUnsupported(
                destination.clone(),
                error.to_string(),
            ));
        }

        Ok(())
    })
    .await
    .map_err(|e| ReconcileError::Io(PathBuf::new(), e.to_string()))?
}

#[cfg(not(target_os = "linux"))]
async fn reflink(_source: &Path, destination: &Path) -> Result<()> {
    Err(ReconcileError::ReflinkUnsupported(
        destination.to_path_buf(),
        "reflink is only supported on linux".to_string(),
    ))
}

#[cfg(target_os = "linux")]
fn libc_exdev() -> i32 {
    libc::EXDEV
}

#[cfg(not(target_os = "linux"))]
fn libc_exdev() -> i32 {
    18
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use tempfile::tempdir;

    async fn write_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_link_into_new_root() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        write_file(&root.join("Album/01.flac"), b"audio data").await;
        let mapping = FileMapping::new(vec![
            FileAction::Link {
                local: PathBuf::from("Album/01.flac"),
                target: PathBuf::from("Artist - Album (2020)/01.flac"),
                mode: LinkMode::Hard,
            },
            FileAction::Missing {
                target: PathBuf::from("Artist - Album (2020)/cover.jpg"),
                length: 100,
            },
        ]);
        let reconciler = Reconciler::new();

        let result = reconciler
            .apply(&mapping, root, root, &CancellationToken::new())
            .await;

        assert_eq!(Ok(()), result);
        let linked = root.join("Artist - Album (2020)/01.flac");
        assert!(linked.exists(), "expected the link to have been created");
        assert_eq!(b"audio data".to_vec(), tokio::fs::read(&linked).await.unwrap());
        assert!(
            !root.join("Artist - Album (2020)/cover.jpg").exists(),
            "expected the missing file to stay absent"
        );
        assert!(
            !staging_path(root).exists(),
            "expected the staging directory to have been removed"
        );
        assert!(
            root.join("Album/01.flac").exists(),
            "expected the local file to stay in place"
        );
    }

    #[tokio::test]
    async fn test_reconcile_rename_in_place() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        write_file(&root.join("Album/01.flac"), b"audio data").await;
        let mapping = FileMapping::new(vec![FileAction::Rename {
            local: PathBuf::from("Album/01.flac"),
            target: PathBuf::from("Artist - Album/01.flac"),
        }]);
        let reconciler = Reconciler::new();

        let result = reconciler
            .apply(&mapping, root, root, &CancellationToken::new())
            .await;

        assert_eq!(Ok(()), result);
        assert!(
            !root.join("Album/01.flac").exists(),
            "expected the local file to have moved"
        );
        assert!(root.join("Artist - Album/01.flac").exists());
    }

    #[tokio::test]
    async fn test_reconcile_idempotent() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        write_file(&root.join("Album/01.flac"), b"audio data").await;
        let mapping = FileMapping::new(vec![FileAction::Link {
            local: PathBuf::from("Album/01.flac"),
            target: PathBuf::from("Other/01.flac"),
            mode: LinkMode::Hard,
        }]);
        let reconciler = Reconciler::new();
        let cancellation = CancellationToken::new();

        reconciler
            .apply(&mapping, root, root, &cancellation)
            .await
            .unwrap();
        let result = reconciler.apply(&mapping, root, root, &cancellation).await;

        assert_eq!(Ok(()), result, "expected the second run to be a no-op");
        assert!(root.join("Other/01.flac").exists());
    }

    #[tokio::test]
    async fn test_reconcile_failure_rolls_back() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        write_file(&root.join("Album/01.flac"), b"audio data").await;
        let mapping = FileMapping::new(vec![
            FileAction::Link {
                local: PathBuf::from("Album/01.flac"),
                target: PathBuf::from("Other/01.flac"),
                mode: LinkMode::Hard,
            },
            FileAction::Link {
                local: PathBuf::from("Album/does-not-exist.flac"),
                target: PathBuf::from("Other/02.flac"),
                mode: LinkMode::Hard,
            },
        ]);
        let reconciler = Reconciler::new();

        let result = reconciler
            .apply(&mapping, root, root, &CancellationToken::new())
            .await;

        assert!(result.is_err(), "expected the apply to fail");
        assert!(
            !staging_path(root).exists(),
            "expected the staging directory to have been removed"
        );
        assert!(
            !root.join("Other").exists(),
            "expected no target files to have appeared"
        );
    }

    #[tokio::test]
    async fn test_reconcile_rejects_escaping_target() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let mapping = FileMapping::new(vec![FileAction::Link {
            local: PathBuf::from("Album/01.flac"),
            target: PathBuf::from("../outside.flac"),
            mode: LinkMode::Hard,
        }]);
        let reconciler = Reconciler::new();

        let result = reconciler
            .apply(&mapping, root, root, &CancellationToken::new())
            .await;

        assert!(
            matches!(result, Err(ReconcileError::InvalidTarget(_))),
            "expected the escaping path to be rejected"
        );
    }

    #[tokio::test]
    async fn test_reconcile_cancelled() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        write_file(&root.join("Album/01.flac"), b"audio data").await;
        let mapping = FileMapping::new(vec![FileAction::Link {
            local: PathBuf::from("Album/01.flac"),
            target: PathBuf::from("Other/01.flac"),
            mode: LinkMode::Hard,
        }]);
        let reconciler = Reconciler::new();
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result = reconciler.apply(&mapping, root, root, &cancellation).await;

        assert_eq!(Err(ReconcileError::Cancelled), result);
        assert!(!root.join("Other").exists());
    }
}
