// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Crate-wide error type.

use std::io;

use thiserror::Error as ThisError;

/// Errors the cache or its text-format collaborators can produce.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("device-mapper error: {0}")]
    Dm(#[from] devicemapper::DmError),

    /// A lookup that is expected to sometimes miss. Call sites that treat
    /// this as user-visible failure are doing it wrong; most of the
    /// registry's query surface returns `Option`/`bool` instead of this.
    #[error("not found: {0}")]
    NotFound(String),

    /// An internal consistency violation: nested locking of the same name,
    /// a non-global lock outstanding at destroy, a handle pointing at a
    /// freed slot. Logged via `log::error!` at the call site and, where
    /// the operation can still complete safely, swallowed there too.
    #[error("programming error: {0}")]
    Programming(String),

    /// The arena or an index could not grow to hold a new entry.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// A second scan was requested while one was already in progress.
    #[error("scan already in progress")]
    ReentrantScan,

    /// Malformed LVM text-format metadata.
    #[error("metadata parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
