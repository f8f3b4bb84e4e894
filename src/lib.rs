// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git-backed store of VM manifests.
//!
//! Rendered KubeVirt manifests are persisted as commits in a remote Git
//! repository, which a GitOps reconciler consumes. This crate keeps a single
//! local working copy of that remote, and runs every change to it as a
//! transaction: either the change is committed and pushed, or the working copy
//! is forced back to where it was before the change started.
//!
//! Start from [`Store`], which is built from [`StoreSettings`].

pub mod config;
pub mod manifest;
pub mod path;
pub mod remote;
pub mod store;

pub use config::{CommitterSettings, StoreSettings};
pub use manifest::{CommitMessage, ManifestName};
pub use remote::{AuthenticatedUrl, Credentials};
pub use store::{
    status::{PushPending, StatusReport},
    workspace::Workspace,
    ErrorKind, Store, StoreError,
};
