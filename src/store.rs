// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git-backed configuration store.
//!
//! The __store__ keeps rendered manifests as commits in a remote Git
//! repository. Locally, it works through one working copy that acts as a
//! cache of the remote (see [`cache`]).
//!
//! # Transactions
//!
//! Every mutation happens inside a __transaction__. A transaction takes the
//! store lock, brings the working copy up to date, and remembers the head
//! commit it started from. The unit of work then runs against a
//! [`Workspace`]. When the unit of work succeeds, any new commit is pushed.
//! When it fails, the working copy is forced back to the original head and
//! every untracked file is removed, so callers never observe a manifest whose
//! commit does not exist.
//!
//! A failed push is the one exception: the local commit is kept, because
//! dropping it could lose work whose push only failed transiently. The failure
//! is surfaced as [`ErrorKind::Push`] and recorded as [`PushPending`] until it
//! is reconciled.
//!
//! # Concurrency
//!
//! Only one store operation runs at a time per store. Other threads block until
//! the running one is done. A unit of work that calls back into its own store,
//! e.g., through a captured `Arc<Store>`, does not deadlock: the lock is
//! re-entrant, and the nested call fails with [`ErrorKind::Reentrant`] instead
//! of touching the working copy mid-transaction. Everything a unit of work
//! needs is on the [`Workspace`] it receives. There is no
//! coordination across processes. Several processes writing to the same
//! remote race at push time, and the loser is reset to the remote on its next
//! synchronization.

pub mod cache;
pub mod status;
pub mod workspace;

use crate::{
    config::{CommitterSettings, StoreSettings},
    manifest::ManifestError,
    store::{
        cache::{current_branch, CacheError, CloneCache, ORIGIN},
        status::{PushPending, StatusReport},
        workspace::{Workspace, WorkspaceError},
    },
};

use git2::{Oid, Repository};
use parking_lot::ReentrantMutex;
use std::{
    cell::{RefCell, RefMut},
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

/// Error type a unit of work may fail with.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Repository manager owning the working copy and its lock.
///
/// Only one store should exist per working copy in a process, otherwise the
/// lock guarantees nothing. Share it through an `Arc`.
pub struct Store {
    cache: CloneCache,
    committer: CommitterSettings,
    state: ReentrantMutex<RefCell<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    push_pending: Option<PushPending>,
}

impl Store {
    /// Construct new store over a clone cache.
    pub fn new(cache: CloneCache, committer: CommitterSettings) -> Self {
        Self {
            cache,
            committer,
            state: ReentrantMutex::new(RefCell::new(StoreState::default())),
        }
    }

    /// Construct new store from settings.
    pub fn from_settings(settings: &StoreSettings) -> Self {
        let cache = CloneCache::new(
            settings.working_copy(),
            settings.authenticated_url(),
            settings.credentials(),
            settings.remote.default_branches.iter().cloned(),
        );

        Self::new(cache, settings.committer.clone())
    }

    /// Path to working copy.
    pub fn working_copy(&self) -> &Path {
        self.cache.path()
    }

    /// Guarantee a current working copy exists, and return its path.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::Sync`] if clone or synchronization fails.
    /// - Return [`ErrorKind::EmptyRepository`] if remote has no commits.
    pub fn ensure(&self) -> Result<PathBuf> {
        let lock = self.state.lock();
        let mut state = enter(&lock, "ensure")?;
        self.prepare(&mut state, "ensure")?;

        Ok(self.cache.path().to_path_buf())
    }

    /// Run unit of work as one transaction.
    ///
    /// The unit of work may write files and create any number of local
    /// commits through the [`Workspace`] it receives. Afterwards, the
    /// transaction pushes if head moved, or if the working tree has
    /// modifications or untracked files. Otherwise it is a no-op.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::Sync`] or [`ErrorKind::EmptyRepository`] if the
    ///   working copy cannot be prepared. Nothing is rolled back, since nothing
    ///   was done.
    /// - Return [`ErrorKind::Push`] if push fails. Local commits are kept.
    /// - Return [`ErrorKind::Reentrant`] if called from inside a unit of work
    ///   of this store.
    /// - Return whatever kind the unit of work failed with otherwise, after
    ///   rolling back to the original head.
    pub fn transaction<T, E, F>(&self, operation: &str, unit: F) -> Result<T>
    where
        F: FnOnce(&Workspace<'_>) -> std::result::Result<T, E>,
        E: Into<BoxError>,
    {
        let lock = self.state.lock();
        let mut state = enter(&lock, operation)?;
        let workspace = self.prepare(&mut state, operation)?;
        let original = workspace
            .head()
            .map_err(|err| StoreError::new(operation, err))?;

        info!("starting transaction: {operation}");
        debug!(
            "original head: {original:?}, dirty: {:?}, untracked: {:?}",
            workspace.is_dirty().ok(),
            workspace.untracked_files().ok()
        );

        let guard = RollbackGuard::new(&workspace, original, operation);
        let value = unit(&workspace).map_err(|err| {
            let err = StoreError::new(operation, err);
            error!("transaction failed for {operation}: {err}");
            err
        })?;

        let needs_push = has_changes(&workspace, original).map_err(|err| {
            let err = StoreError::new(operation, err);
            error!("transaction failed for {operation}: {err}");
            err
        })?;
        guard.disarm();

        if !needs_push {
            info!("no changes to push for {operation}");
            return Ok(value);
        }

        info!("pushing changes for {operation}");
        match self.cache.push(workspace.repository()) {
            Ok(()) => {
                state.push_pending = None;
                Ok(value)
            }
            Err(err) => {
                error!("push failed for {operation}, local commits kept: {err}");
                let head = workspace.head().ok().flatten();
                state.push_pending = Some(PushPending {
                    operation: operation.to_string(),
                    head: head.map(|oid| oid.to_string()).unwrap_or_default(),
                    reason: err.to_string(),
                });
                Err(StoreError::new(operation, err))
            }
        }
    }

    /// Write manifest and commit it.
    ///
    /// Returns new commit, or the current head if content did not change. The
    /// first write into an empty repository always creates a root commit, so
    /// [`ErrorKind::NothingToCommit`] does not occur here.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::InvalidPath`] if path escapes repository.
    /// - Same as [`Store::transaction`] otherwise.
    pub fn write_manifest(
        &self,
        file_name: &str,
        content: &str,
        message: &str,
        subdirectory: Option<&str>,
    ) -> Result<Oid> {
        self.transaction(&format!("commit {file_name}"), |workspace| {
            workspace.write_manifest(file_name, content, message, subdirectory)
        })
    }

    /// Delete manifest and commit the removal.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::NotFound`] if manifest does not exist.
    /// - Return [`ErrorKind::InvalidPath`] if path escapes repository.
    /// - Same as [`Store::transaction`] otherwise.
    pub fn delete_manifest(
        &self,
        file_name: &str,
        message: &str,
        subdirectory: Option<&str>,
    ) -> Result<Oid> {
        self.transaction(&format!("delete {file_name}"), |workspace| {
            workspace.delete_manifest(file_name, message, subdirectory)
        })
    }

    /// Read manifest from an up to date working copy.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::NotFound`] if manifest does not exist.
    /// - Return [`ErrorKind::Sync`] if working copy cannot be synchronized.
    pub fn read_manifest(&self, file_name: &str, subdirectory: Option<&str>) -> Result<String> {
        self.inspect(&format!("read {file_name}"), |workspace| {
            workspace.read_manifest(file_name, subdirectory)
        })
    }

    /// List manifest file names of an up to date working copy.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::Sync`] if working copy cannot be synchronized.
    pub fn list_manifests(
        &self,
        subdirectory: Option<&str>,
        extension: Option<&str>,
    ) -> Result<Vec<String>> {
        self.inspect("list", |workspace| {
            workspace.list_manifests(subdirectory, extension)
        })
    }

    /// Push local commits that a failed push left behind.
    ///
    /// Returns number of commits pushed.
    ///
    /// # Errors
    ///
    /// - Return [`ErrorKind::Push`] if push fails again.
    /// - Return [`ErrorKind::Sync`] if working copy cannot be synchronized.
    pub fn reconcile(&self) -> Result<usize> {
        let operation = "reconcile";
        let lock = self.state.lock();
        let mut state = enter(&lock, operation)?;
        let workspace = self.prepare(&mut state, operation)?;
        let unpushed = self
            .cache
            .unpushed_commits(workspace.repository())
            .map_err(|err| StoreError::new(operation, err))?;
        if unpushed == 0 {
            return Ok(0);
        }

        info!("pushing {unpushed} pending commits");
        self.cache
            .push(workspace.repository())
            .map_err(|err| StoreError::new(operation, err))?;
        state.push_pending = None;

        Ok(unpushed)
    }

    /// Report working copy health.
    ///
    /// Never fails. Failures are described in [`StatusReport::error`].
    pub fn status(&self) -> StatusReport {
        let lock = self.state.lock();
        let mut state = match enter(&lock, "status") {
            Ok(state) => state,
            Err(err) => {
                error!("{err}");
                return StatusReport::failed(&err);
            }
        };

        match self.snapshot(&mut state) {
            Ok(report) => report,
            Err(err) => {
                error!("error getting repository status: {err}");
                let mut report = StatusReport::failed(&err);
                report.push_pending = state.push_pending.clone();
                report
            }
        }
    }

    fn snapshot(&self, state: &mut StoreState) -> Result<StatusReport> {
        let operation = "status";
        let workspace = self.prepare(state, operation)?;
        let repository = workspace.repository();
        let fail = |err: WorkspaceError| StoreError::new(operation, err);

        Ok(StatusReport {
            is_dirty: workspace.is_dirty().map_err(fail)?,
            untracked_files: workspace.untracked_files().map_err(fail)?,
            active_branch: current_branch(repository).ok(),
            latest_commit: workspace.head().map_err(fail)?.map(|oid| oid.to_string()),
            remote_url: repository
                .find_remote(ORIGIN)
                .ok()
                .map(|_| self.cache.url().to_string()),
            unpushed_commits: self.cache.unpushed_commits(repository).unwrap_or_default(),
            error: None,
            push_pending: state.push_pending.clone(),
        })
    }

    fn inspect<T, F>(&self, operation: &str, read: F) -> Result<T>
    where
        F: FnOnce(&Workspace<'_>) -> std::result::Result<T, WorkspaceError>,
    {
        let lock = self.state.lock();
        let mut state = enter(&lock, operation)?;
        let workspace = self.prepare(&mut state, operation)?;

        read(&workspace).map_err(|err| StoreError::new(operation, err))
    }

    fn prepare(&self, state: &mut StoreState, operation: &str) -> Result<Workspace<'_>> {
        let repository = self.cache.ensure().map_err(|err| {
            let err = StoreError::new(operation, err);
            error!("{err}");
            err
        })?;
        self.settle_push_pending(state, &repository);

        Workspace::new(repository, &self.committer).map_err(|err| StoreError::new(operation, err))
    }

    fn settle_push_pending(&self, state: &mut StoreState, repository: &Repository) {
        if state.push_pending.is_none() {
            return;
        }

        if let Ok(0) = self.cache.unpushed_commits(repository) {
            warn!("pending push settled by synchronization with remote");
            state.push_pending = None;
        }
    }
}

/// Claim store state for the calling operation.
///
/// # Errors
///
/// - Return [`ErrorKind::Reentrant`] if the current thread already runs an
///   operation on this store.
fn enter<'g>(state: &'g RefCell<StoreState>, operation: &str) -> Result<RefMut<'g, StoreState>> {
    state.try_borrow_mut().map_err(|_| {
        error!("{operation} called from inside another operation on the same store");
        StoreError::new(operation, NestedCall)
    })
}

/// Check whether anything happened that needs pushing.
fn has_changes(
    workspace: &Workspace<'_>,
    original: Option<Oid>,
) -> std::result::Result<bool, WorkspaceError> {
    let current = workspace.head()?;
    debug!("original head: {original:?}, current head: {current:?}");

    Ok(original != current || workspace.is_dirty()? || !workspace.untracked_files()?.is_empty())
}

/// Rolls working copy back to original head unless disarmed.
///
/// Dropping an armed guard, on early return or panic alike, performs the
/// rollback.
struct RollbackGuard<'w, 'a> {
    workspace: &'w Workspace<'a>,
    original: Option<Oid>,
    operation: &'w str,
    armed: bool,
}

impl<'w, 'a> RollbackGuard<'w, 'a> {
    fn new(workspace: &'w Workspace<'a>, original: Option<Oid>, operation: &'w str) -> Self {
        Self {
            workspace,
            original,
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Some(original) = self.original else {
            warn!("no original head for {}, nothing to roll back", self.operation);
            return;
        };

        warn!("rolling back changes of {}", self.operation);
        if let Err(err) = self.workspace.rollback(original) {
            error!("rollback failed for {}: {err}", self.operation);
        }
    }
}

/// Discriminator of store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Clone or synchronization with remote fails.
    Sync,

    /// Remote has no commits.
    EmptyRepository,

    /// Manifest does not exist.
    NotFound,

    /// Nothing to commit, and no prior commit to return.
    NothingToCommit,

    /// Local commit succeeded, but push did not.
    Push,

    /// Manifest path or name is not acceptable.
    InvalidPath,

    /// Store called again from inside one of its own units of work.
    Reentrant,

    /// Any other failure inside the unit of work.
    Transaction,
}

impl ErrorKind {
    fn classify(source: &(dyn StdError + 'static)) -> Self {
        if let Some(err) = source.downcast_ref::<CacheError>() {
            return match err {
                CacheError::Sync { .. } | CacheError::Prepare { .. } => Self::Sync,
                CacheError::EmptyRepository { .. } => Self::EmptyRepository,
                CacheError::Push { .. } => Self::Push,
            };
        }

        if let Some(err) = source.downcast_ref::<WorkspaceError>() {
            return match err {
                WorkspaceError::NotFound { .. } => Self::NotFound,
                WorkspaceError::NothingToCommit => Self::NothingToCommit,
                WorkspaceError::InvalidPath { .. } => Self::InvalidPath,
                _ => Self::Transaction,
            };
        }

        if source.downcast_ref::<NestedCall>().is_some() {
            return Self::Reentrant;
        }

        if source.downcast_ref::<ManifestError>().is_some() {
            return Self::InvalidPath;
        }

        if let Some(err) = source.downcast_ref::<StoreError>() {
            return err.kind;
        }

        Self::Transaction
    }
}

impl Display for ErrorKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let kind = match self {
            Self::Sync => "clone/synchronization failed",
            Self::EmptyRepository => "remote repository is empty",
            Self::NotFound => "not found",
            Self::NothingToCommit => "nothing to commit",
            Self::Push => "push failed",
            Self::InvalidPath => "invalid path",
            Self::Reentrant => "nested store operation",
            Self::Transaction => "transaction failed",
        };
        fmt.write_str(kind)
    }
}

/// Store operation started while the same thread runs another one.
#[derive(Debug, thiserror::Error)]
#[error("store is already in use by an operation on this thread")]
pub struct NestedCall;

/// Umbrella error of every store operation.
///
/// Branch on [`StoreError::kind`]; the underlying cause is available as the
/// error source.
#[derive(Debug, thiserror::Error)]
#[error("{operation}: {kind}: {source}")]
pub struct StoreError {
    operation: String,
    kind: ErrorKind,
    #[source]
    source: BoxError,
}

impl StoreError {
    /// Wrap failure of an operation.
    pub fn new(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let source = source.into();
        let kind = ErrorKind::classify(source.as_ref());

        Self {
            operation: operation.into(),
            kind,
            source,
        }
    }

    /// What kind of failure this is.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Name of operation that failed.
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn classify_workspace_failures() {
        let err = StoreError::new(
            "read demo.yaml",
            WorkspaceError::NotFound {
                path: PathBuf::from("demo.yaml"),
            },
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.operation(), "read demo.yaml");

        let err = StoreError::new("commit demo.yaml", WorkspaceError::NothingToCommit);
        assert_eq!(err.kind(), ErrorKind::NothingToCommit);
    }

    #[test]
    fn classify_cache_failures() {
        let err = StoreError::new(
            "ensure",
            CacheError::EmptyRepository {
                url: "https://git.example.org/vms.git".into(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::EmptyRepository);

        let err = StoreError::new(
            "commit demo.yaml",
            CacheError::Push {
                refspec: "refs/heads/main:refs/heads/main".into(),
                url: "https://git.example.org/vms.git".into(),
                reason: "rejected".into(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::Push);
    }

    #[test]
    fn classify_foreign_failures() {
        let err = StoreError::new("render demo", "template exploded");
        assert_eq!(err.kind(), ErrorKind::Transaction);
        assert_eq!(err.to_string(), "render demo: transaction failed: template exploded");

        let inner = StoreError::new("read demo.yaml", WorkspaceError::NothingToCommit);
        let outer = StoreError::new("update demo", inner);
        assert_eq!(outer.kind(), ErrorKind::NothingToCommit);
    }

    #[test]
    fn claim_state_once_per_thread() {
        let state = RefCell::new(StoreState::default());
        let held = enter(&state, "update demo").unwrap();

        let err = enter(&state, "commit demo.yaml").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reentrant);
        assert_eq!(err.operation(), "commit demo.yaml");

        drop(held);
        assert!(enter(&state, "commit demo.yaml").is_ok());
    }
}
