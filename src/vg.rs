// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Volume Groups: the parsed representation ([`VG`]) and the registry's
//! live record for one ([`VgInfo`]).

use std::collections::BTreeMap;
use std::fmt;

use devicemapper::Device;
use uuid::Uuid;

use crate::lv::{self, LV};
use crate::parser::{status_from_textmap, strings_from_textmap, Entry, LvmTextMap, TextMapOps};
use crate::pv::{self, PvHandle, PV};
use crate::{Error, Result};

const DEFAULT_EXTENT_SIZE: u64 = 8192; // 4MiB, in 512-byte sectors

/// A VG's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VgId(Uuid);

impl VgId {
    pub fn new() -> VgId {
        VgId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<VgId> {
        Uuid::parse_str(s)
            .map(VgId)
            .map_err(|e| Error::Parse(format!("bad VG id {:?}: {}", s, e)))
    }
}

impl Default for VgId {
    fn default() -> VgId {
        VgId::new()
    }
}

impl fmt::Display for VgId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Volume Group: multiple Physical Volumes treated as one allocation
/// pool for Logical Volumes. This is the *parsed* representation — what a
/// label scan or the saved-VG buffer hands back, not a live cache record.
#[derive(Debug, PartialEq, Clone)]
pub struct VG {
    pub name: String,
    pub id: String,
    /// The generation of metadata this VG represents.
    pub seqno: u64,
    /// Always "lvm2" for VGs actually on disk.
    pub format: String,
    pub status: Vec<String>,
    pub flags: Vec<String>,
    /// Size of each extent, in 512-byte sectors.
    pub extent_size: u64,
    pub max_lv: u64,
    pub max_pv: u64,
    pub metadata_copies: u64,
    pub pvs: BTreeMap<Device, PV>,
    pub lvs: BTreeMap<String, LV>,
}

impl VG {
    /// Construct a `VG` from its name and an `LvmTextMap`, the way a label
    /// scan's text-metadata parser would.
    pub fn from_textmap(name: &str, map: &LvmTextMap) -> Result<VG> {
        let err = || Error::Parse("vg textmap parsing error".to_string());

        let id = map.string_from_textmap("id").ok_or_else(err)?;
        let seqno = map.i64_from_textmap("seqno").ok_or_else(err)?;
        let format = map.string_from_textmap("format").ok_or_else(err)?;
        let extent_size = map.i64_from_textmap("extent_size").ok_or_else(err)?;
        let max_lv = map.i64_from_textmap("max_lv").ok_or_else(err)?;
        let max_pv = map.i64_from_textmap("max_pv").ok_or_else(err)?;
        let metadata_copies = map.i64_from_textmap("metadata_copies").ok_or_else(err)?;

        let status = status_from_textmap(map)?;
        let flags = strings_from_textmap(map, "flags")?;

        let pvs = map
            .textmap_from_textmap("physical_volumes")
            .ok_or_else(err)
            .and_then(|tm| {
                let mut ret = BTreeMap::new();
                for (key, value) in tm {
                    match value {
                        Entry::TextMap(pv_dict) => {
                            let parsed = pv::from_textmap(key, pv_dict)?;
                            ret.insert(parsed.device, parsed);
                        }
                        _ => return Err(Error::Parse("expected PV textmap".to_string())),
                    }
                }
                Ok(ret)
            })?;

        let lvs = match map.textmap_from_textmap("logical_volumes") {
            Some(tm) => {
                let mut ret = BTreeMap::new();
                for (key, value) in tm {
                    match value {
                        Entry::TextMap(lv_dict) => {
                            ret.insert(key.to_string(), lv::from_textmap(key, lv_dict)?);
                        }
                        _ => return Err(Error::Parse("expected LV textmap".to_string())),
                    }
                }
                ret
            }
            None => BTreeMap::new(),
        };

        Ok(VG {
            name: name.to_string(),
            id: id.to_string(),
            seqno: seqno as u64,
            format: format.to_string(),
            status,
            flags,
            extent_size: extent_size as u64,
            max_lv: max_lv as u64,
            max_pv: max_pv as u64,
            metadata_copies: metadata_copies as u64,
            pvs,
            lvs,
        })
    }

    /// The total number of extents in use in the volume group.
    pub fn extents_in_use(&self) -> u64 {
        self.lvs.values().map(|x| x.used_extents()).sum()
    }

    /// The total number of free extents in the volume group.
    pub fn extents_free(&self) -> u64 {
        self.extents() - self.extents_in_use()
    }

    /// The total number of extents in the volume group.
    pub fn extents(&self) -> u64 {
        self.pvs.values().map(|x| x.pe_count).sum()
    }

    /// Returns a list of PV Devices that make up the VG.
    pub fn pv_list(&self) -> Vec<Device> {
        self.pvs.keys().copied().collect()
    }

    /// Returns a reference to the PV matching the Device.
    pub fn pv_get(&self, dev: Device) -> Option<&PV> {
        self.pvs.get(&dev)
    }

    /// Returns a list of the names of LVs in the VG.
    pub fn lv_list(&self) -> Vec<String> {
        self.lvs.keys().cloned().collect()
    }

    /// Returns a reference to the LV matching the name.
    pub fn lv_get(&self, name: &str) -> Option<&LV> {
        self.lvs.get(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }
}

pub fn to_textmap(vg: &VG) -> LvmTextMap {
    let mut map = LvmTextMap::new();

    map.insert("id".to_string(), Entry::String(vg.id.clone()));
    map.insert("seqno".to_string(), Entry::Number(vg.seqno as i64));
    map.insert("format".to_string(), Entry::String(vg.format.clone()));
    map.insert("max_pv".to_string(), Entry::Number(vg.max_pv as i64));
    map.insert("max_lv".to_string(), Entry::Number(vg.max_lv as i64));

    map.insert(
        "status".to_string(),
        Entry::List(vg.status.iter().map(|x| Entry::String(x.clone())).collect()),
    );
    map.insert(
        "flags".to_string(),
        Entry::List(vg.flags.iter().map(|x| Entry::String(x.clone())).collect()),
    );

    map.insert(
        "extent_size".to_string(),
        Entry::Number(vg.extent_size as i64),
    );
    map.insert(
        "metadata_copies".to_string(),
        Entry::Number(vg.metadata_copies as i64),
    );

    map.insert(
        "physical_volumes".to_string(),
        Entry::TextMap(Box::new(
            vg.pvs
                .values()
                .map(|v| (v.name.clone(), Entry::TextMap(Box::new(pv::to_textmap(v)))))
                .collect(),
        )),
    );

    if !vg.lvs.is_empty() {
        map.insert(
            "logical_volumes".to_string(),
            Entry::TextMap(Box::new(
                vg.lvs
                    .iter()
                    .map(|(k, v)| (k.clone(), Entry::TextMap(Box::new(lv::to_textmap(v)))))
                    .collect(),
            )),
        );
    }

    map
}

/// Used only by [`crate::saved_vg`] and tests that want a throwaway VG
/// rather than one built through `from_textmap`.
pub fn empty(name: &str) -> VG {
    VG {
        name: name.to_string(),
        id: crate::util::make_uuid(),
        seqno: 1,
        format: "lvm2".to_string(),
        status: vec!["READ".to_string(), "WRITE".to_string(), "RESIZEABLE".to_string()],
        flags: Vec::new(),
        extent_size: DEFAULT_EXTENT_SIZE,
        max_lv: 0,
        max_pv: 0,
        metadata_copies: 0,
        pvs: BTreeMap::new(),
        lvs: BTreeMap::new(),
    }
}

/// The registry's live record for one VG (§3 `VGInfo`).
///
/// Owned by the [`crate::registry::Cache`] arena. Rather than a single VG
/// name mapping to a single `VgInfo`, duplicate/renamed VGs form a singly
/// linked alias chain via `next`; the registry's name index always points
/// at the chain's head.
#[derive(Debug, Clone)]
pub struct VgInfo {
    pub id: VgId,
    pub name: String,
    pub format: String,
    pub status: Vec<String>,
    pub lock_type: String,
    pub system_id: String,
    pub creation_host: String,
    pub exported: bool,
    /// The most recently observed metadata witness for this VG, or `None`
    /// if this VgInfo was created without ever having been scanned (e.g.
    /// a bare orphan-VG placeholder).
    pub witness: Option<Witness>,
    /// Set when two scans of this VG reported different witnesses without
    /// either being a strict subset — recorded, never evicts anything.
    pub scan_summary_mismatch: bool,
    /// When true, a rescan of this VG's PVs may be skipped because its
    /// metadata lives somewhere the normal scan path won't look again
    /// (e.g. it was seeded from the metadata daemon).
    pub independent_metadata_location: bool,
    pub pvs: Vec<PvHandle>,
    pub next: Option<VgHandle>,
}

impl VgInfo {
    pub fn new(id: VgId, name: String) -> VgInfo {
        VgInfo {
            id,
            name,
            format: "lvm2".to_string(),
            status: Vec::new(),
            lock_type: String::new(),
            system_id: String::new(),
            creation_host: String::new(),
            exported: false,
            witness: None,
            scan_summary_mismatch: false,
            independent_metadata_location: false,
            pvs: Vec::new(),
            next: None,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.name.starts_with('#')
    }
}

/// Witnessed metadata state for a VG: the fields a scan or a daemon
/// response can disagree about across PVs, and which identify which copy
/// is newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Witness {
    pub seqno: u64,
    pub mda_size: u64,
    pub mda_checksum: u32,
}

pub type VgHandle = crate::arena::Handle<VgInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vg() -> VG {
        let mut vg = empty("myvg");
        vg.pvs.insert(
            Device::from(0x0800u64),
            PV {
                name: "pv0".to_string(),
                id: "pv-uuid".to_string(),
                device: Device::from(0x0800u64),
                status: vec!["ALLOCATABLE".to_string()],
                flags: Vec::new(),
                dev_size: 2048,
                pe_start: 1,
                pe_count: 100,
            },
        );
        vg
    }

    #[test]
    fn round_trips_through_textmap() {
        let vg = sample_vg();
        let map = to_textmap(&vg);
        let back = VG::from_textmap(&vg.name, &map).unwrap();
        assert_eq!(vg, back);
    }

    #[test]
    fn extents_accounting_is_pure() {
        let vg = sample_vg();
        assert_eq!(vg.extents(), 100);
        assert_eq!(vg.extents_in_use(), 0);
        assert_eq!(vg.extents_free(), 100);
    }
}
