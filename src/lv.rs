// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logical Volumes, as they appear inside a VG's parsed metadata.
//!
//! The cache never creates, resizes or activates an LV — that is the
//! command layer's job, against the real device-mapper stack. What the
//! cache needs is this data shape purely so a saved VG round-trips through
//! [`crate::parser`] intact.

use devicemapper::Device;
use std::str::FromStr;

use crate::parser::{status_from_textmap, strings_from_textmap, Entry, LvmTextMap, TextMapOps};
use crate::{Error, Result};

#[derive(Debug, PartialEq, Clone)]
pub struct LV {
    pub name: String,
    pub id: String,
    pub status: Vec<String>,
    pub flags: Vec<String>,
    pub creation_host: String,
    pub creation_time: i64,
    pub segments: Vec<Segment>,
}

impl LV {
    /// The total number of extents used by this logical volume.
    pub fn used_extents(&self) -> u64 {
        self.segments.iter().map(|x| x.extent_count).sum()
    }

    /// `(Device, start_extent, extent_count)` for every segment, used by
    /// the VG's free/used-area accounting.
    pub fn used_areas(&self) -> Vec<(Device, u64, u64)> {
        self.segments
            .iter()
            .flat_map(|seg| {
                seg.stripes
                    .iter()
                    .map(move |&(dev, _)| (dev, seg.start_extent, seg.extent_count))
            })
            .collect()
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Segment {
    pub name: String,
    pub start_extent: u64,
    pub extent_count: u64,
    pub ty: String,
    /// If more than one entry, the segment is striped across multiple PVs.
    /// Each pair is the PV's device and the extent within it the stripe
    /// starts at.
    pub stripes: Vec<(Device, u64)>,
}

pub fn from_textmap(key: &str, map: &LvmTextMap) -> Result<LV> {
    let err = || Error::Parse("lv textmap parsing error".to_string());

    let id = map.string_from_textmap("id").ok_or_else(err)?;
    let creation_host = map.string_from_textmap("creation_host").ok_or_else(err)?;
    let creation_time = map.i64_from_textmap("creation_time").ok_or_else(err)?;
    let segment_count = map.i64_from_textmap("segment_count").ok_or_else(err)?;

    let segments = segments_from_textmap(segment_count as u64, map)?;
    let status = status_from_textmap(map)?;
    let flags = strings_from_textmap(map, "flags")?;

    Ok(LV {
        name: key.to_string(),
        id: id.to_string(),
        status,
        flags,
        creation_host: creation_host.to_string(),
        creation_time,
        segments,
    })
}

fn segments_from_textmap(segment_count: u64, map: &LvmTextMap) -> Result<Vec<Segment>> {
    let err = || Error::Parse("segment textmap parsing error".to_string());

    let mut segments = Vec::new();
    for i in 0..segment_count {
        let name = format!("segment{}", i + 1);
        let seg_dict = map.textmap_from_textmap(&name).ok_or_else(err)?;
        let stripe_list = seg_dict.list_from_textmap("stripes").ok_or_else(err)?;

        let mut stripes = Vec::new();
        for chunk in stripe_list.chunks(2) {
            let dev = match &chunk[0] {
                Entry::String(x) => {
                    Device::from_str(x).map_err(|_| err())?
                }
                _ => return Err(err()),
            };
            let start = match chunk[1] {
                Entry::Number(x) => x as u64,
                _ => return Err(err()),
            };
            stripes.push((dev, start));
        }

        segments.push(Segment {
            name,
            start_extent: seg_dict.i64_from_textmap("start_extent").ok_or_else(err)? as u64,
            extent_count: seg_dict.i64_from_textmap("extent_count").ok_or_else(err)? as u64,
            ty: seg_dict.string_from_textmap("type").ok_or_else(err)?.to_string(),
            stripes,
        });
    }

    Ok(segments)
}

pub fn to_textmap(lv: &LV) -> LvmTextMap {
    let mut map = LvmTextMap::new();

    map.insert("id".to_string(), Entry::String(lv.id.clone()));
    map.insert(
        "status".to_string(),
        Entry::List(lv.status.iter().map(|x| Entry::String(x.clone())).collect()),
    );
    map.insert(
        "flags".to_string(),
        Entry::List(lv.flags.iter().map(|x| Entry::String(x.clone())).collect()),
    );
    map.insert(
        "creation_host".to_string(),
        Entry::String(lv.creation_host.clone()),
    );
    map.insert(
        "creation_time".to_string(),
        Entry::Number(lv.creation_time),
    );
    map.insert(
        "segment_count".to_string(),
        Entry::Number(lv.segments.len() as i64),
    );

    for (i, seg) in lv.segments.iter().enumerate() {
        map.insert(
            format!("segment{}", i + 1),
            Entry::TextMap(Box::new(segment_to_textmap(seg))),
        );
    }

    map
}

fn segment_to_textmap(seg: &Segment) -> LvmTextMap {
    let mut map = LvmTextMap::new();

    map.insert(
        "start_extent".to_string(),
        Entry::Number(seg.start_extent as i64),
    );
    map.insert(
        "extent_count".to_string(),
        Entry::Number(seg.extent_count as i64),
    );
    map.insert("type".to_string(), Entry::String(seg.ty.clone()));
    map.insert(
        "stripe_count".to_string(),
        Entry::Number(seg.stripes.len() as i64),
    );

    let stripes = seg
        .stripes
        .iter()
        .flat_map(|&(dev, start)| {
            vec![
                Entry::String(format!("{}", u64::from(dev))),
                Entry::Number(start as i64),
            ]
        })
        .collect();
    map.insert("stripes".to_string(), Entry::List(stripes));

    map
}
