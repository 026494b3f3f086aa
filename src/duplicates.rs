// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Duplicate-PV resolution (§4.4).
//!
//! More than one device can carry the same PV UUID — multipath, stale
//! copies on a RAID member, a device cloned at the block level. The
//! resolver never treats this as an error; it records every candidate it
//! is told about and, on request, picks exactly one winner per PV id
//! through a fixed, deterministic ladder of checks so that repeated runs
//! against the same facts always make the same choice.

use std::collections::HashMap;

use devicemapper::Device;
use log::warn;

use crate::pv::PvId;

/// What the resolver is told about one candidate device claiming a given
/// PV id. All of this is supplied by the caller (derived from a label scan
/// or `udev` probe) — the resolver itself never inspects a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateCandidateFacts {
    pub pvid: PvId,
    pub device: Device,
    /// Previously resolved as a loser and flagged to stay that way even if
    /// later facts would otherwise favor it (rung 1).
    pub sticky_unpreferred: bool,
    /// Already backing a live LV (rung 2).
    pub is_in_use_by_lv: bool,
    /// Its reported size matches the PV header (rung 3).
    pub size_is_correct: bool,
    /// Carries a mounted filesystem (rung 4) — strong evidence of being
    /// the device actually in use.
    pub has_mounted_filesystem: bool,
    /// Device-mapper major, i.e. already layered (e.g. multipath) (rung 5).
    pub is_dm_major: bool,
    /// Member of a subsystem (e.g. multipath, a cluster mirror) that
    /// already claims the other candidate (rung 6).
    pub is_subsystem_member: bool,
    /// Component device of a software RAID (MD) set. Never itself a
    /// ladder rung — used only to filter `unused_duplicates()`'s report,
    /// since an MD component showing up as a "duplicate" of its own array
    /// is expected, not actionable.
    pub is_md_component: bool,
    /// Lower sorts earlier; used for the final first-seen tiebreaker
    /// (rung 7).
    pub first_seen_order: u64,
}

fn priority_key(f: &DuplicateCandidateFacts) -> (u8, u8, u8, u8, u8, u8, u64) {
    (
        f.sticky_unpreferred as u8,
        !f.is_in_use_by_lv as u8,
        !f.size_is_correct as u8,
        !f.has_mounted_filesystem as u8,
        !f.is_dm_major as u8,
        !f.is_subsystem_member as u8,
        f.first_seen_order,
    )
}

#[derive(Debug, Default)]
pub struct DuplicateResolver {
    found_duplicates: Vec<DuplicateCandidateFacts>,
    unused_duplicates: Vec<DuplicateCandidateFacts>,
    /// The device presently registered for a PV id — the baseline `resolve`
    /// compares every candidate against. Kept in step by the registry's
    /// `add` (set) and `del`/`del_dev` (cleared).
    current: HashMap<PvId, Device>,
    next_seen_order: u64,
}

impl DuplicateResolver {
    pub fn new() -> DuplicateResolver {
        DuplicateResolver::default()
    }

    /// Record a candidate device for a PV id, or refresh the facts already
    /// on file for it. Keyed by `(pvid, device)`: a second `record` call
    /// for a pair already known updates its facts in place rather than
    /// appending a second entry — a caller that learns more about a
    /// device (e.g. "it turns out this one backs a live LV") after an
    /// initial, sparser recording doesn't leave the stale entry behind to
    /// confuse `resolve`'s grouping. `first_seen_order` is assigned once,
    /// on first sight, and never changes afterward.
    pub fn record(&mut self, mut facts: DuplicateCandidateFacts) {
        if let Some(existing) = self
            .found_duplicates
            .iter_mut()
            .find(|f| f.pvid == facts.pvid && f.device == facts.device)
        {
            facts.first_seen_order = existing.first_seen_order;
            *existing = facts;
            return;
        }

        facts.first_seen_order = self.next_seen_order;
        self.next_seen_order += 1;
        self.found_duplicates.push(facts);
    }

    pub fn found_duplicates(&self) -> &[DuplicateCandidateFacts] {
        &self.found_duplicates
    }

    /// Record which device is presently the registry's live mapping for
    /// `pvid`. `resolve` uses this as the baseline a candidate must beat to
    /// become the new winner.
    pub fn set_current(&mut self, pvid: PvId, device: Device) {
        self.current.insert(pvid, device);
    }

    /// Forget the current device for `pvid`, e.g. because its PV was
    /// removed from the registry entirely.
    pub fn clear_current(&mut self, pvid: PvId) {
        self.current.remove(&pvid);
    }

    /// The process-wide unused-duplicates report, with software-RAID
    /// component devices filtered out: an MD component "duplicating" its
    /// own array is not actionable by a caller.
    pub fn unused_duplicates(&self) -> Vec<&DuplicateCandidateFacts> {
        self.unused_duplicates
            .iter()
            .filter(|f| !f.is_md_component)
            .collect()
    }

    /// Whether any of `pvids` currently has more than one recorded
    /// candidate device. A pure query; does not resolve anything.
    pub fn vg_has_duplicate_pvs(&self, pvids: &[PvId]) -> bool {
        let groups = self.group_by_pvid();
        pvids.iter().any(|id| groups.get(id).map_or(false, |g| g.len() > 1))
    }

    fn group_by_pvid(&self) -> HashMap<PvId, Vec<&DuplicateCandidateFacts>> {
        let mut groups: HashMap<PvId, Vec<&DuplicateCandidateFacts>> = HashMap::new();
        for f in &self.found_duplicates {
            groups.entry(f.pvid).or_default().push(f);
        }
        groups
    }

    /// Clear the process-wide `found_duplicates` list, as happens on
    /// `Cache::destroy`. `unused_duplicates` is left untouched — it is
    /// meant to carry forward across a destroy/init pair. `current` is
    /// cleared too, since `Cache::destroy` also drops the PV-id index it
    /// mirrors.
    pub fn clear_found(&mut self) {
        self.found_duplicates.clear();
        self.current.clear();
        self.next_seen_order = 0;
    }

    /// Resolve every group of >1 candidates sharing a PV id down to one
    /// winner, ranked against the group's `current` device (the one
    /// presently registered for that PV id — see `set_current`). A group
    /// whose PV id has no known `current` is skipped with a warning: there
    /// is nothing on file yet to compare candidates against.
    ///
    /// Returns `(losers_to_detach, winners_to_attach)`, populated only when
    /// the winner differs from `current` — a group that resolves back to
    /// the device already in the registry produces no output for it.
    /// Emits one `log::warn!` per resolved group. The new loser set
    /// atomically replaces the previous `unused_duplicates` — a device
    /// that resolves cleanly on a later call is not left behind in the
    /// report.
    pub fn resolve(&mut self) -> (Vec<Device>, Vec<Device>) {
        let mut del_out = Vec::new();
        let mut add_out = Vec::new();
        let mut new_unused = Vec::new();

        for (pvid, mut group) in self.group_by_pvid() {
            if group.len() < 2 {
                continue;
            }

            let current = match self.current.get(&pvid) {
                Some(&device) => device,
                None => {
                    warn!("duplicate PVs for {}: no current device on file, skipping", pvid);
                    continue;
                }
            };

            group.sort_by_key(|f| priority_key(f));
            let winner = *group[0];

            warn!(
                "duplicate PVs for {}: keeping {:?}, unpreferring {} other device(s)",
                pvid,
                winner.device,
                group.len() - 1
            );

            if winner.device != current {
                del_out.push(current);
                add_out.push(winner.device);
            }

            for loser in group.iter().filter(|f| f.device != winner.device) {
                new_unused.push(**loser);
            }
        }

        self.unused_duplicates = new_unused;
        (del_out, add_out)
    }
}
