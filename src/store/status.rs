// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Working copy health report.

use serde::Serialize;
use std::{fmt::Display, path::PathBuf};

/// Snapshot of working copy health.
///
/// Gathering a report never fails. Whatever went wrong while gathering it is
/// described by the `error` field instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Tracked files have uncommitted modifications.
    pub is_dirty: bool,

    /// Untracked files relative to repository root.
    pub untracked_files: Vec<PathBuf>,

    /// Branch HEAD points to, absent without commits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_branch: Option<String>,

    /// Head commit, absent without commits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_commit: Option<String>,

    /// Redacted URL of remote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,

    /// Local commits not yet on remote.
    pub unpushed_commits: usize,

    /// Description of failure while gathering report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Last push failure that has not been reconciled yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_pending: Option<PushPending>,
}

impl StatusReport {
    /// Construct report describing a failure.
    pub fn failed(error: impl Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Local commit whose push failed.
///
/// Local history is kept when a push fails. This record tells operators that
/// local and remote have diverged until the next successful push, or until
/// synchronization drops the commit in favor of the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushPending {
    /// Transaction whose push failed.
    pub operation: String,

    /// Local head at the time of failure.
    pub head: String,

    /// Why the push failed.
    pub reason: String,
}
