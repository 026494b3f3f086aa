// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Physical Volumes, both the parsed on-disk representation ([`PV`]) and
//! the registry's live record for one ([`PvInfo`]).

use std::fmt;
use std::str::FromStr;

use devicemapper::Device;
use uuid::Uuid;

use crate::parser::{status_from_textmap, strings_from_textmap, Entry, LvmTextMap, TextMapOps};
use crate::vg::VgHandle;
use crate::{Error, Result};

/// A PV's identity. Wraps the UUID every PV label carries so it can be used
/// as an index key without confusing it with a [`crate::vg::VgId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PvId(Uuid);

impl PvId {
    pub fn new() -> PvId {
        PvId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<PvId> {
        Uuid::parse_str(s)
            .map(PvId)
            .map_err(|e| Error::Parse(format!("bad PV id {:?}: {}", s, e)))
    }
}

impl Default for PvId {
    fn default() -> PvId {
        PvId::new()
    }
}

impl fmt::Display for PvId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for whichever labeller produced a PV's label.
///
/// The cache never invokes a labeller (label I/O is an external
/// collaborator's job); it only needs to tell whether the labeller backing
/// an already-known PV has changed, so a comparable token is enough.
pub type LabellerId = &'static str;

/// An opaque region of a PV: offset and size in bytes. Used for metadata
/// areas (MDAs), data areas (DAs), and bootloader areas (BAs) alike — the
/// cache stores these as inert handles handed to it by the label reader and
/// never parses their contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvArea {
    pub offset: u64,
    pub size: u64,
}

pub type MetadataArea = PvArea;
pub type DataArea = PvArea;
pub type BootloaderArea = PvArea;

/// The parsed on-disk fields of a PV, as they appear inside a VG's text
/// metadata.
#[derive(Debug, PartialEq, Clone)]
pub struct PV {
    pub name: String,
    pub id: String,
    pub device: Device,
    pub status: Vec<String>,
    pub flags: Vec<String>,
    pub dev_size: u64,
    pub pe_start: u64,
    pub pe_count: u64,
}

pub fn from_textmap(key: &str, map: &LvmTextMap) -> Result<PV> {
    let err = || Error::Parse("pv textmap parsing error".to_string());

    let id = map.string_from_textmap("id").ok_or_else(err)?;
    let device = crate::parser::device_from_textmap(map, "device")?;
    let dev_size = map.i64_from_textmap("dev_size").ok_or_else(err)?;
    let pe_start = map.i64_from_textmap("pe_start").ok_or_else(err)?;
    let pe_count = map.i64_from_textmap("pe_count").ok_or_else(err)?;

    let status = status_from_textmap(map)?;
    let flags = strings_from_textmap(map, "flags")?;

    Ok(PV {
        name: key.to_string(),
        id: id.to_string(),
        device,
        status,
        flags,
        dev_size: dev_size as u64,
        pe_start: pe_start as u64,
        pe_count: pe_count as u64,
    })
}

pub fn to_textmap(pv: &PV) -> LvmTextMap {
    let mut map = LvmTextMap::new();

    map.insert("id".to_string(), Entry::String(pv.id.clone()));
    map.insert(
        "device".to_string(),
        Entry::String(format!("{}", u64::from(pv.device))),
    );
    map.insert(
        "status".to_string(),
        Entry::List(pv.status.iter().map(|x| Entry::String(x.clone())).collect()),
    );
    map.insert(
        "flags".to_string(),
        Entry::List(pv.flags.iter().map(|x| Entry::String(x.clone())).collect()),
    );
    map.insert("dev_size".to_string(), Entry::Number(pv.dev_size as i64));
    map.insert("pe_start".to_string(), Entry::Number(pv.pe_start as i64));
    map.insert("pe_count".to_string(), Entry::Number(pv.pe_count as i64));

    map
}

/// `PvId`s are parsed from 32-hex-digit UUID strings, same as in the real
/// on-disk label, or via [`PvId::parse`] for the hyphenated form.
impl FromStr for PvId {
    type Err = Error;

    fn from_str(s: &str) -> Result<PvId> {
        PvId::parse(s)
    }
}

/// The registry's live record for one discovered PV (§3 `PVInfo`).
///
/// Owned by the [`crate::registry::Cache`] arena; other structures refer to
/// it by [`crate::registry::PvHandle`], never by reference, so the
/// PV-info/VG-info cycle never needs back-pointers.
#[derive(Debug, Clone)]
pub struct PvInfo {
    pub id: PvId,
    pub device: Device,
    pub dev_size: u64,
    pub labeller: Option<LabellerId>,
    pub mdas: Vec<MetadataArea>,
    pub das: Vec<DataArea>,
    pub bas: Vec<BootloaderArea>,
    /// Set while this PV's VG is held locked; mirrors the VG's lock state
    /// so callers checking a PV alone can see it without a second lookup.
    pub cache_locked: bool,
    pub ext_version: u32,
    pub ext_flags: u32,
    pub vg: Option<VgHandle>,
}

pub type PvHandle = crate::arena::Handle<PvInfo>;

impl PvInfo {
    pub fn new(id: PvId, device: Device, dev_size: u64, labeller: LabellerId) -> PvInfo {
        PvInfo {
            id,
            device,
            dev_size,
            labeller: Some(labeller),
            mdas: Vec::new(),
            das: Vec::new(),
            bas: Vec::new(),
            cache_locked: false,
            ext_version: 0,
            ext_flags: 0,
            vg: None,
        }
    }

    /// Whether this PV has at least one metadata area. A PV with none can
    /// never independently carry VG metadata and is treated specially by
    /// the update pipeline (it is folded into the orphan VG rather than
    /// creating a one-PV VG of its own).
    pub fn has_mda(&self) -> bool {
        !self.mdas.is_empty()
    }
}
