// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations for the local working copy of the
//! configuration store.

use std::path::{Path, PathBuf};

/// Name of the working copy directory inside the clone directory.
pub const WORKING_COPY_DIR: &str = "repo";

/// Determine default absolute path to clone directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/portal-store` as the default
/// absolute path for the clone directory. Does not check if the path returned
/// actually exists.
///
/// # Errors
///
/// - Return [`NoDataDir`] if data directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_clone_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("portal-store"))
        .ok_or(NoDataDir)
}

/// Path to working copy inside of a clone directory.
pub fn working_copy_path(clone_dir: impl AsRef<Path>) -> PathBuf {
    clone_dir.as_ref().join(WORKING_COPY_DIR)
}

/// No way to determine user's data directory.
///
/// # See Also
///
/// - [`dirs::data_dir`](https://docs.rs/dirs/latest/dirs/fn.data_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's data directory")]
pub struct NoDataDir;

/// Friendly result alias :3
pub type Result<T, E = NoDataDir> = std::result::Result<T, E>;
