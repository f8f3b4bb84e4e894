// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File operations on the working copy.
//!
//! A [`Workspace`] is the handle a unit of work receives inside a store
//! transaction. It only ever lives as long as the transaction that created it,
//! and it never takes the store lock itself. Thus, a unit of work cannot start
//! a nested transaction by accident.
//!
//! All paths handed to a workspace are relative to the repository root, and
//! optionally nested under a subdirectory. Absolute paths and parent
//! components are rejected before anything touches the filesystem.

use crate::{config::CommitterSettings, store::cache::head_commit};

use git2::{
    build::CheckoutBuilder, Commit, ObjectType, Oid, Repository, ResetType, Signature,
    StatusOptions, Statuses,
};
use std::{
    ffi::OsStr,
    fs::{read_dir, read_to_string, remove_dir_all, remove_file, write},
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Prepared working copy borrowed for the duration of one transaction.
pub struct Workspace<'a> {
    repository: Repository,
    root: PathBuf,
    committer: &'a CommitterSettings,
}

impl<'a> Workspace<'a> {
    /// Construct new workspace over an opened working copy.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::Bare`] if repository has no working tree.
    pub fn new(repository: Repository, committer: &'a CommitterSettings) -> Result<Self> {
        let root = repository
            .workdir()
            .map(Path::to_path_buf)
            .ok_or(WorkspaceError::Bare)?;

        Ok(Self {
            repository,
            root,
            committer,
        })
    }

    /// Underlying repository, for units of work that need raw Git access.
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Root of working tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current head commit, or `None` if there are no commits yet.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::Git2`] if HEAD cannot be resolved.
    pub fn head(&self) -> Result<Option<Oid>> {
        Ok(head_commit(&self.repository)?)
    }

    /// Check if tracked files have uncommitted modifications.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::Git2`] if status cannot be gathered.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.statuses(false, false)?.is_empty())
    }

    /// List untracked files relative to repository root.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::Git2`] if status cannot be gathered.
    pub fn untracked_files(&self) -> Result<Vec<PathBuf>> {
        let statuses = self.statuses(true, true)?;
        let files = statuses
            .iter()
            .filter(|entry| entry.status().is_wt_new())
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect();

        Ok(files)
    }

    /// Write manifest, stage it, and commit it if anything changed.
    ///
    /// Parent directories are created as needed. When the staged tree matches
    /// the head commit's tree, no empty commit is created and the current
    /// head is returned instead. Without a head commit the staged manifest is
    /// always a change, so the first write creates a root commit.
    ///
    /// [`WorkspaceError::NothingToCommit`] is never returned from here. It
    /// only surfaces if the index ends up empty on an unborn branch.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::InvalidPath`] if path escapes repository.
    /// - Return [`WorkspaceError::Io`] if manifest cannot be written.
    /// - Return [`WorkspaceError::Git2`] if staging or committing fails.
    #[instrument(skip(self, content, message), level = "debug")]
    pub fn write_manifest(
        &self,
        file_name: &str,
        content: &str,
        message: &str,
        subdirectory: Option<&str>,
    ) -> Result<Oid> {
        let relative = relative_path(subdirectory, Some(file_name))?;
        let full_path = self.root.join(&relative);

        if let Some(parent) = full_path.parent() {
            mkdirp::mkdirp(parent)
                .map(|_| ())
                .map_err(|err| WorkspaceError::Io {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
        }

        info!("write {:?} ({} bytes)", full_path.display(), content.len());
        write(&full_path, content).map_err(|err| WorkspaceError::Io {
            path: full_path.clone(),
            source: err,
        })?;

        let mut index = self.repository.index()?;
        index.add_path(&relative)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let head = self.head_commit()?;
        let changed = match &head {
            Some(commit) => commit.tree_id() != tree_id,
            // INVARIANT: Index holds at least the manifest just staged.
            None => !index.is_empty(),
        };

        if !changed {
            warn!("no changes to commit, {:?} already up to date", relative.display());
            return head
                .map(|commit| commit.id())
                .ok_or(WorkspaceError::NothingToCommit);
        }

        self.commit(tree_id, message, head.as_ref())
    }

    /// Remove manifest from disk and index, then commit the removal.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::InvalidPath`] if path escapes repository.
    /// - Return [`WorkspaceError::NotFound`] if manifest does not exist.
    /// - Return [`WorkspaceError::Io`] if manifest cannot be removed.
    /// - Return [`WorkspaceError::Git2`] if staging or committing fails.
    #[instrument(skip(self, message), level = "debug")]
    pub fn delete_manifest(
        &self,
        file_name: &str,
        message: &str,
        subdirectory: Option<&str>,
    ) -> Result<Oid> {
        let relative = relative_path(subdirectory, Some(file_name))?;
        let full_path = self.root.join(&relative);
        if !full_path.is_file() {
            warn!("manifest does not exist: {:?}", full_path.display());
            return Err(WorkspaceError::NotFound { path: relative });
        }

        info!("remove {:?}", full_path.display());
        remove_file(&full_path).map_err(|err| WorkspaceError::Io {
            path: full_path.clone(),
            source: err,
        })?;

        let mut index = self.repository.index()?;
        index.remove_path(&relative)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let head = self.head_commit()?;
        self.commit(tree_id, message, head.as_ref())
    }

    /// Read manifest content.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::InvalidPath`] if path escapes repository.
    /// - Return [`WorkspaceError::NotFound`] if manifest does not exist.
    /// - Return [`WorkspaceError::Io`] if manifest cannot be read.
    pub fn read_manifest(&self, file_name: &str, subdirectory: Option<&str>) -> Result<String> {
        let relative = relative_path(subdirectory, Some(file_name))?;
        let full_path = self.root.join(&relative);
        if !full_path.is_file() {
            return Err(WorkspaceError::NotFound { path: relative });
        }

        read_to_string(&full_path).map_err(|err| WorkspaceError::Io {
            path: full_path,
            source: err,
        })
    }

    /// List manifest file names in a directory, sorted.
    ///
    /// Only regular files are listed, by name rather than full path. The
    /// extension filter may be given with or without its leading dot. A
    /// missing directory yields an empty listing.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::InvalidPath`] if path escapes repository.
    /// - Return [`WorkspaceError::Io`] if directory cannot be read.
    pub fn list_manifests(
        &self,
        subdirectory: Option<&str>,
        extension: Option<&str>,
    ) -> Result<Vec<String>> {
        let directory = self.root.join(relative_path(subdirectory, None)?);
        if !directory.is_dir() {
            warn!("directory does not exist: {:?}", directory.display());
            return Ok(Vec::new());
        }

        let io_error = |err| WorkspaceError::Io {
            path: directory.clone(),
            source: err,
        };
        let wanted = extension.map(|ext| ext.trim_start_matches('.'));
        let mut names = Vec::new();
        for entry in read_dir(&directory).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if !path.is_file() {
                continue;
            }

            if let Some(wanted) = wanted {
                if path.extension().and_then(OsStr::to_str) != Some(wanted) {
                    continue;
                }
            }

            if let Some(name) = path.file_name().and_then(OsStr::to_str) {
                names.push(name.to_string());
            }
        }
        names.sort();

        Ok(names)
    }

    /// Force working tree and branch back to a commit, discarding every
    /// modified and untracked file.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::Git2`] if reset fails.
    /// - Return [`WorkspaceError::Io`] if untracked files cannot be removed.
    #[instrument(skip(self), level = "debug")]
    pub fn rollback(&self, original: Oid) -> Result<()> {
        warn!("rolling back working copy to {original}");
        let target = self
            .repository
            .find_object(original, Some(ObjectType::Commit))?;
        self.repository
            .reset(&target, ResetType::Hard, Some(CheckoutBuilder::new().force()))?;

        // INVARIANT: Untracked directories are reported as one entry, so
        // removing it removes everything beneath it.
        let untracked = self
            .statuses(true, false)?
            .iter()
            .filter(|entry| entry.status().is_wt_new())
            .filter_map(|entry| entry.path().map(|path| self.root.join(path)))
            .collect::<Vec<_>>();

        for path in untracked {
            debug!("clean {:?}", path.display());
            let removed = if path.is_dir() {
                remove_dir_all(&path)
            } else {
                remove_file(&path)
            };
            removed.map_err(|err| WorkspaceError::Io { path, source: err })?;
        }

        Ok(())
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        Ok(self
            .head()?
            .map(|oid| self.repository.find_commit(oid))
            .transpose()?)
    }

    fn commit(&self, tree_id: Oid, message: &str, parent: Option<&Commit<'_>>) -> Result<Oid> {
        let tree = self.repository.find_tree(tree_id)?;
        let signature = Signature::now(&self.committer.name, &self.committer.email)?;
        let parents = parent.into_iter().collect::<Vec<_>>();
        let oid = self.repository.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        info!("created commit {oid}");

        Ok(oid)
    }

    fn statuses(&self, untracked: bool, recurse: bool) -> Result<Statuses<'_>> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(untracked)
            .recurse_untracked_dirs(recurse)
            .include_ignored(false);

        Ok(self.repository.statuses(Some(&mut options))?)
    }
}

/// Join subdirectory and file name into a path relative to repository root.
///
/// # Errors
///
/// - Return [`WorkspaceError::InvalidPath`] if the result is absolute or
///   contains anything but plain components.
fn relative_path(subdirectory: Option<&str>, file_name: Option<&str>) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for part in [subdirectory, file_name].into_iter().flatten() {
        let is_plain = Path::new(part)
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(WorkspaceError::InvalidPath {
                path: part.to_string(),
            });
        }
        relative.push(part);
    }

    if file_name.is_some_and(|name| name.is_empty() || name.ends_with('/')) {
        return Err(WorkspaceError::InvalidPath {
            path: relative.display().to_string(),
        });
    }

    Ok(relative)
}

/// Workspace error types.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Manifest does not exist.
    #[error("file not found: {:?}", path.display())]
    NotFound { path: PathBuf },

    /// Staged content equals head, and there is no head to return.
    #[error("no changes to commit and no prior commit exists")]
    NothingToCommit,

    /// Path is absolute or escapes repository root.
    #[error("invalid manifest path {path:?}")]
    InvalidPath { path: String },

    /// Repository has no working tree.
    #[error("working copy is a bare repository")]
    Bare,

    /// Filesystem operation fails.
    #[error("failed to access {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;
