// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

/// Failure reported by the remote authority for a single apply.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The mutation may succeed later, e.g. after a network error or server overload.
    #[error("Transient error: {0}")]
    Transient(anyhow::Error),
    /// The remote rejected the mutation; retrying would fail the same way.
    #[error("Permanent error: {0}")]
    Permanent(anyhow::Error),
}

impl ApplyError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
