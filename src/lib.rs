// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-memory metadata cache for an LVM-style volume manager.
//!
//! [`registry::Cache`] is the crate's single entry point: a multi-index
//! registry over discovered Physical Volumes and Volume Groups
//! ([`pv::PvInfo`] / [`vg::VgInfo`]), a duplicate-PV resolver
//! ([`duplicates`]), a lock-ordering registry ([`lock`]), and a saved-VG
//! double-buffer for cluster-daemon resume ([`saved_vg`]). [`parser`]
//! provides the LVM2 text-metadata format both [`pv`]/[`lv`]/[`vg`] and
//! [`saved_vg`] build on; [`lvmetad`] speaks to the external metadata
//! daemon that can seed the cache without a fresh label scan.

pub mod arena;
pub mod duplicates;
pub mod error;
pub mod lock;
pub mod lv;
pub mod lvmetad;
pub mod parser;
pub mod pv;
pub mod registry;
pub mod saved_vg;
pub mod update;
mod util;
pub mod vg;

pub use crate::error::{Error, Result};
pub use crate::registry::{Cache, DestroyReport, RescanPolicy};
