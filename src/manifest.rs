// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! VM manifest naming.
//!
//! Every VM definition is stored as exactly one rendered manifest whose file
//! name is derived from the VM's name plus a fixed extension. The VM name must
//! be a valid RFC 1123 label, since it ends up as the `metadata.name` of the
//! rendered KubeVirt objects.

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Extension of every manifest file.
pub const MANIFEST_EXTENSION: &str = ".yaml";

const MAX_NAME_LEN: usize = 63;

/// Validated VM name that maps to one manifest file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestName(String);

impl ManifestName {
    /// Construct new manifest name from VM name.
    ///
    /// # Errors
    ///
    /// - Return [`ManifestError::InvalidName`] if name is not an RFC 1123
    ///   label.
    pub fn new(vm_name: impl Into<String>) -> Result<Self> {
        let vm_name = vm_name.into();
        if !is_rfc1123_label(&vm_name) {
            return Err(ManifestError::InvalidName(vm_name));
        }

        Ok(Self(vm_name))
    }

    /// Recover manifest name from a file name, e.g., one returned by a
    /// listing.
    ///
    /// Returns `None` if the file does not carry the manifest extension or its
    /// stem is not a valid VM name.
    pub fn from_file_name(file_name: impl AsRef<str>) -> Option<Self> {
        file_name
            .as_ref()
            .strip_suffix(MANIFEST_EXTENSION)
            .and_then(|stem| Self::new(stem).ok())
    }

    /// VM name.
    pub fn vm_name(&self) -> &str {
        &self.0
    }

    /// File name of manifest.
    pub fn file_name(&self) -> String {
        format!("{}{MANIFEST_EXTENSION}", self.0)
    }
}

impl Display for ManifestName {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.0)
    }
}

/// Kind of change recorded by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMessage {
    Create,
    Update,
    Delete,
}

impl CommitMessage {
    /// Render commit message for target manifest.
    pub fn render(self, name: &ManifestName) -> String {
        match self {
            Self::Create => format!("Add VM configuration for {name}"),
            Self::Update => format!("Update VM configuration for {name}"),
            Self::Delete => format!("Delete VM configuration for {name}"),
        }
    }
}

fn is_rfc1123_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };

    bytes.len() <= MAX_NAME_LEN
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || *byte == b'-')
}

/// Manifest naming error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    /// VM name is not an RFC 1123 label.
    #[error("invalid VM name {0:?}: expected lowercase alphanumerics or '-', at most 63 characters")]
    InvalidName(String),
}

/// Friendly result alias :3
type Result<T, E = ManifestError> = std::result::Result<T, E>;
