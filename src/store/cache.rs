// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local clone cache.
//!
//! The store keeps exactly one working copy of the remote repository on disk.
//! The working copy is a __cache__: the remote is always the source of truth,
//! so anything only present locally can be thrown away when the two disagree.
//!
//! # Synchronization
//!
//! Before any operation proceeds, [`CloneCache::ensure`] makes sure the working
//! copy exists and is current:
//!
//! 1. No working copy yet? Clone it, trying each configured default branch in
//!    order before falling back to whatever the remote calls its default.
//! 2. Working copy present? Re-apply the configured remote URL, because the
//!    embedded credentials may have rotated since the last request. Then fetch
//!    and fast-forward. If fast-forward is impossible, e.g., upstream was
//!    force-pushed, hard reset to the remote's primary branch.
//!
//! Fetch failures are surfaced rather than papered over with a reset, so a
//! transient network error never discards a commit that is still waiting to
//! be pushed.

use crate::remote::{AuthenticatedUrl, Credentials};

use auth_git2::GitAuthenticator;
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config, ErrorCode, FetchOptions, ObjectType, Oid, PushOptions, RemoteCallbacks, Repository,
    ResetType,
};
use std::{
    cell::RefCell,
    fs::{create_dir_all, remove_dir_all},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Name of the remote every working copy tracks.
pub const ORIGIN: &str = "origin";

/// Owner of the on-disk working copy.
pub struct CloneCache {
    path: PathBuf,
    url: AuthenticatedUrl,
    credentials: Option<Credentials>,
    default_branches: Vec<String>,
}

impl CloneCache {
    /// Construct new clone cache.
    ///
    /// Nothing touches the filesystem until [`CloneCache::ensure`] is called.
    pub fn new(
        path: impl Into<PathBuf>,
        url: AuthenticatedUrl,
        credentials: Option<Credentials>,
        default_branches: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            path: path.into(),
            url,
            credentials,
            default_branches: default_branches.into_iter().map(Into::into).collect(),
        }
    }

    /// Path to working copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remote URL the working copy is synchronized with.
    pub fn url(&self) -> &AuthenticatedUrl {
        &self.url
    }

    /// Check if working copy metadata exists.
    pub fn is_present(&self) -> bool {
        self.path.join(".git").exists()
    }

    /// Guarantee a current working copy exists.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Sync`] if clone, fetch, or reset fails.
    /// - Return [`CacheError::EmptyRepository`] if remote has no commits.
    /// - Return [`CacheError::Prepare`] if clone directory cannot be created.
    #[instrument(skip(self), fields(path = %self.path.display()), level = "debug")]
    pub fn ensure(&self) -> Result<Repository> {
        if self.is_present() {
            debug!("working copy exists, synchronizing with {}", self.url);
            let repository = Repository::open(&self.path).map_err(|err| self.sync_error(err))?;
            self.synchronize(&repository)?;
            return Ok(repository);
        }

        self.bootstrap()
    }

    /// Open working copy without synchronizing it.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Sync`] if working copy cannot be opened.
    pub fn open(&self) -> Result<Repository> {
        Repository::open(&self.path).map_err(|err| self.sync_error(err))
    }

    /// Push current branch to remote.
    ///
    /// Per-reference rejections reported by the remote count as failure just
    /// like transport errors do.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Push`] if push fails or remote rejects it.
    #[instrument(skip(self, repository), level = "debug")]
    pub fn push(&self, repository: &Repository) -> Result<()> {
        let branch = current_branch(repository).map_err(|err| self.push_error("HEAD", err))?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        info!("push {refspec} to {}", self.url);

        let rejected = RefCell::new(Vec::new());
        {
            let authenticator = self.authenticator();
            let config = Config::new().map_err(|err| self.push_error(&refspec, err))?;
            let mut callbacks = remote_callbacks(&authenticator, &config);
            callbacks.push_update_reference(|reference, status| {
                if let Some(message) = status {
                    rejected.borrow_mut().push(format!("{reference}: {message}"));
                }
                Ok(())
            });

            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            let mut remote = repository
                .find_remote(ORIGIN)
                .map_err(|err| self.push_error(&refspec, err))?;
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|err| self.push_error(&refspec, err))?;
        }

        let rejected = rejected.into_inner();
        if !rejected.is_empty() {
            return Err(CacheError::Push {
                refspec,
                url: self.url.to_string(),
                reason: rejected.join("; "),
            });
        }

        Ok(())
    }

    /// Count commits on current branch not yet on its remote tracking branch.
    ///
    /// # Errors
    ///
    /// - Return [`git2::Error`] if branch or tracking branch cannot be
    ///   resolved.
    pub fn unpushed_commits(&self, repository: &Repository) -> Result<usize, git2::Error> {
        let branch = current_branch(repository)?;
        let local = repository.refname_to_id(&format!("refs/heads/{branch}"))?;
        let upstream = match repository.refname_to_id(&tracking_ref(&branch)) {
            Ok(oid) => oid,
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let (ahead, _) = repository.graph_ahead_behind(local, upstream)?;

        Ok(ahead)
    }

    fn bootstrap(&self) -> Result<Repository> {
        info!("clone {} into {:?}", self.url, self.path.display());
        if let Some(parent) = self.path.parent() {
            create_dir_all(parent).map_err(|err| CacheError::Prepare {
                path: parent.to_path_buf(),
                source: err,
            })?;
        }

        // INVARIANT: Never clone on top of leftovers from a broken working copy.
        self.discard_working_copy()?;

        let attempts = self
            .default_branches
            .iter()
            .map(|branch| Some(branch.as_str()))
            .chain(std::iter::once(None));

        let mut failure = git2::Error::from_str("no clone attempt was made");
        for branch in attempts {
            match self.clone_branch(branch) {
                Ok(repository) => return self.accept_clone(repository),
                Err(err) => {
                    warn!(
                        "clone of branch {} failed: {}",
                        branch.unwrap_or("<remote default>"),
                        err.message()
                    );
                    self.discard_working_copy()?;
                    failure = err;
                }
            }
        }

        Err(self.sync_error(failure))
    }

    fn clone_branch(&self, branch: Option<&str>) -> Result<Repository, git2::Error> {
        let authenticator = self.authenticator();
        let config = Config::new()?;
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks(&authenticator, &config));

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options);
        if let Some(branch) = branch {
            builder.branch(branch);
        }

        builder.clone(self.url.expose(), &self.path)
    }

    fn accept_clone(&self, repository: Repository) -> Result<Repository> {
        let is_empty = repository.is_empty().map_err(|err| self.sync_error(err))?;
        if is_empty {
            warn!("remote {} has no commits, discarding clone", self.url);
            drop(repository);
            self.discard_working_copy()?;
            return Err(CacheError::EmptyRepository {
                url: self.url.to_string(),
            });
        }

        let branch = current_branch(&repository).map_err(|err| self.sync_error(err))?;
        info!("working copy ready at {:?} on branch {branch}", self.path.display());

        Ok(repository)
    }

    fn synchronize(&self, repository: &Repository) -> Result<()> {
        self.sync_remote_url(repository)
            .map_err(|err| self.sync_error(err))?;
        self.fetch(repository).map_err(|err| self.sync_error(err))?;

        if let Err(err) = self.fast_forward(repository) {
            warn!("pull failed, resetting to remote: {}", err.message());
            self.reset_to_remote(repository)
                .map_err(|err| self.sync_error(err))?;
        }

        Ok(())
    }

    fn sync_remote_url(&self, repository: &Repository) -> Result<(), git2::Error> {
        match repository.find_remote(ORIGIN) {
            Ok(remote) if remote.url() == Some(self.url.expose()) => Ok(()),
            Ok(_) => {
                info!("remote url changed, updating {ORIGIN} to {}", self.url);
                repository.remote_set_url(ORIGIN, self.url.expose())
            }
            Err(err) if err.code() == ErrorCode::NotFound => {
                info!("remote {ORIGIN} missing, adding {}", self.url);
                repository.remote(ORIGIN, self.url.expose()).map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    fn fetch(&self, repository: &Repository) -> Result<(), git2::Error> {
        let authenticator = self.authenticator();
        let config = Config::new()?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(remote_callbacks(&authenticator, &config));

        let mut remote = repository.find_remote(ORIGIN)?;
        remote.fetch(&[] as &[&str], Some(&mut options), None)
    }

    fn fast_forward(&self, repository: &Repository) -> Result<(), git2::Error> {
        let branch = current_branch(repository)?;
        let upstream = repository.find_reference(&tracking_ref(&branch))?;
        let upstream = repository.reference_to_annotated_commit(&upstream)?;
        let (analysis, _) = repository.merge_analysis(&[&upstream])?;

        if analysis.is_up_to_date() {
            debug!("branch {branch} is up to date");
            return Ok(());
        }

        if !analysis.is_fast_forward() {
            return Err(git2::Error::from_str(&format!(
                "branch {branch} has diverged from {ORIGIN}/{branch}"
            )));
        }

        debug!("fast-forward {branch} to {}", upstream.id());
        let mut local = repository.find_reference(&format!("refs/heads/{branch}"))?;
        local.set_target(upstream.id(), "pull: fast-forward")?;
        repository.checkout_head(Some(CheckoutBuilder::new().force()))?;

        Ok(())
    }

    fn reset_to_remote(&self, repository: &Repository) -> Result<(), git2::Error> {
        let primary = self.remote_primary(repository)?;
        info!("hard reset to {primary}");
        let target = repository.find_reference(&primary)?.peel(ObjectType::Commit)?;
        repository.reset(&target, ResetType::Hard, Some(CheckoutBuilder::new().force()))
    }

    fn remote_primary(&self, repository: &Repository) -> Result<String, git2::Error> {
        let current = current_branch(repository).ok();
        current
            .iter()
            .chain(self.default_branches.iter())
            .map(|branch| tracking_ref(branch))
            .find(|reference| repository.find_reference(reference).is_ok())
            .ok_or_else(|| git2::Error::from_str("no primary branch found on remote"))
    }

    fn discard_working_copy(&self) -> Result<()> {
        if self.path.exists() {
            remove_dir_all(&self.path).map_err(|err| CacheError::Prepare {
                path: self.path.clone(),
                source: err,
            })?;
        }

        Ok(())
    }

    fn authenticator(&self) -> GitAuthenticator {
        let authenticator = GitAuthenticator::default()
            .try_cred_helper(false)
            .try_ssh_agent(false)
            .try_password_prompt(0);

        match &self.credentials {
            Some(credentials) => authenticator.add_plaintext_credentials(
                "*",
                credentials.username(),
                credentials.token(),
            ),
            None => authenticator,
        }
    }

    fn sync_error(&self, source: git2::Error) -> CacheError {
        CacheError::Sync {
            path: self.path.clone(),
            url: self.url.to_string(),
            source,
        }
    }

    fn push_error(&self, refspec: &str, source: git2::Error) -> CacheError {
        CacheError::Push {
            refspec: refspec.to_string(),
            url: self.url.to_string(),
            reason: source.message().to_string(),
        }
    }
}

/// Short name of branch HEAD points to.
///
/// # Errors
///
/// - Return [`git2::Error`] if HEAD is unborn or detached.
pub fn current_branch(repository: &Repository) -> Result<String, git2::Error> {
    let head = repository.head()?;
    if !head.is_branch() {
        return Err(git2::Error::from_str("HEAD is detached"));
    }

    head.shorthand()
        .map(ToString::to_string)
        .ok_or_else(|| git2::Error::from_str("branch name is not valid UTF-8"))
}

/// Commit HEAD points to, or `None` for a repository without commits.
///
/// # Errors
///
/// - Return [`git2::Error`] if HEAD cannot be resolved for any other reason.
pub fn head_commit(repository: &Repository) -> Result<Option<Oid>, git2::Error> {
    match repository.head() {
        Ok(head) => Ok(head.target()),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn tracking_ref(branch: &str) -> String {
    format!("refs/remotes/{ORIGIN}/{branch}")
}

fn remote_callbacks<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a Config,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(authenticator.credentials(config));
    callbacks
}

/// Clone cache error types.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Clone, fetch, or reset against remote fails.
    #[error("failed to synchronize working copy at {:?} with {url}", path.display())]
    Sync {
        path: PathBuf,
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Remote has no commits to work with.
    #[error("remote {url} has no commits")]
    EmptyRepository { url: String },

    /// Clone directory cannot be prepared.
    #[error("failed to prepare clone directory {:?}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Push fails, or remote rejects updated references.
    #[error("failed to push {refspec} to {url}: {reason}")]
    Push {
        refspec: String,
        url: String,
        reason: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CacheError> = std::result::Result<T, E>;
