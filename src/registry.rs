// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The multi-index registry (§4.1), PV/VG attach-detach (§4.2), and the
//! update pipeline (§4.3), all tied together as `Cache`, the crate's single
//! entry point.
//!
//! `Cache` is a plain value: there is no process-global instance, no
//! thread-local, nothing a test can leak across cases. A command layer
//! that wants one cache per process just keeps one around; a test wants a
//! fresh one per case and gets it for free.

use std::collections::HashMap;

use devicemapper::Device;
use log::{error, warn};

use crate::arena::Arena;
use crate::duplicates::{DuplicateCandidateFacts, DuplicateResolver};
use crate::lock::{LockRegistry, VG_GLOBAL};
use crate::pv::{LabellerId, PvHandle, PvId, PvInfo};
use crate::saved_vg::SavedVgBuffer;
use crate::update::{reconcile_witness, VgSummary};
use crate::vg::{VgHandle, VgId, VgInfo, Witness, VG};
use crate::{Error, Result};

/// What `destroy` reports back: any VG names whose lock was still held, a
/// programming error on the caller's part that destroy completes through
/// regardless.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    pub locked_vgs: Vec<String>,
}

/// Governs whether a VG flagged `independent_metadata_location` (its
/// metadata came from somewhere other than a direct label scan, e.g. the
/// metadata daemon) is skipped on the next rescan pass. Only one policy
/// exists today — skip unconditionally, matching the historical
/// contract — but call sites take the enum rather than a bare bool so a
/// future policy (e.g. periodic revalidation) doesn't have to change
/// every caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanPolicy {
    SkipIndependentLocations,
}

impl Default for RescanPolicy {
    fn default() -> RescanPolicy {
        RescanPolicy::SkipIndependentLocations
    }
}

fn chain_order_key(info: &VgInfo, local_host: &str) -> (u8, u8, u8) {
    let orphan_rank = u8::from(info.is_orphan());
    let exported_rank = u8::from(info.exported);
    let host_rank = if !local_host.is_empty() && info.creation_host == local_host {
        0
    } else if !info.creation_host.is_empty() {
        1
    } else {
        2
    };
    (orphan_rank, exported_rank, host_rank)
}

pub struct Cache {
    pvinfos: Arena<PvInfo>,
    vginfos: Arena<VgInfo>,
    pvid_index: HashMap<PvId, PvHandle>,
    dev_index: HashMap<Device, PvHandle>,
    vgid_index: HashMap<VgId, VgHandle>,
    /// Maps a VG name to the *head* of its alias chain; `VgInfo::next`
    /// links the rest.
    vgname_index: HashMap<String, VgHandle>,
    duplicates: DuplicateResolver,
    locks: LockRegistry,
    saved_vgs: SavedVgBuffer,
    scanning_in_progress: bool,
    is_cluster_daemon: bool,
    local_host: String,
    rescan_policy: RescanPolicy,
}

impl Default for Cache {
    fn default() -> Cache {
        Cache::new()
    }
}

impl Cache {
    pub fn new() -> Cache {
        Cache {
            pvinfos: Arena::new(),
            vginfos: Arena::new(),
            pvid_index: HashMap::new(),
            dev_index: HashMap::new(),
            vgid_index: HashMap::new(),
            vgname_index: HashMap::new(),
            duplicates: DuplicateResolver::new(),
            locks: LockRegistry::new(),
            saved_vgs: SavedVgBuffer::new(),
            scanning_in_progress: false,
            is_cluster_daemon: false,
            local_host: String::new(),
            rescan_policy: RescanPolicy::default(),
        }
    }

    pub fn set_rescan_policy(&mut self, policy: RescanPolicy) {
        self.rescan_policy = policy;
    }

    /// Whether a scan pass should bother rescanning `vg`'s PVs. A caller
    /// iterating PVs to rescan should skip any whose VG answers `false`
    /// here.
    pub fn should_rescan(&self, vg: &VgInfo) -> bool {
        match self.rescan_policy {
            RescanPolicy::SkipIndependentLocations => !vg.independent_metadata_location,
        }
    }

    // ---- Lifecycle --------------------------------------------------

    /// Bring the cache up. `local_host` is used only for the VG
    /// name-aliasing chain's host-match rung — it does not have to be the
    /// real hostname in tests. If `destroy` last left the global lock
    /// implicitly held (the cluster-daemon resume case), it is re-locked
    /// here rather than starting unlocked.
    pub fn init(&mut self, is_cluster_daemon: bool, local_host: &str) {
        self.is_cluster_daemon = is_cluster_daemon;
        self.local_host = local_host.to_string();
        if self.locks.needs_global_relock() {
            self.locks.lock(VG_GLOBAL);
        }
    }

    pub fn is_cluster_daemon(&self) -> bool {
        self.is_cluster_daemon
    }

    /// Tear the cache down: always safe, always completes, regardless of
    /// in-progress scans or outstanding locks (both are programming errors
    /// on the caller's part, logged here, never a reason to abort).
    pub fn destroy(&mut self) -> DestroyReport {
        if self.scanning_in_progress {
            error!("programming error: destroy called while a scan is in progress");
            self.scanning_in_progress = false;
        }

        let locked_vgs = self.locks.destroy();
        self.duplicates.clear_found();

        self.pvinfos.clear();
        self.vginfos.clear();
        self.pvid_index.clear();
        self.dev_index.clear();
        self.vgid_index.clear();
        self.vgname_index.clear();

        DestroyReport { locked_vgs }
    }

    /// Fold a list of VGs fetched from the metadata daemon (e.g.
    /// `crate::lvmetad::vg_list()`) into the registry through the same
    /// `add`/`attach` path a label scan would use.
    pub fn seed_from_metadata_daemon(&mut self, vgs: Vec<VG>) -> Result<()> {
        for vg in vgs {
            let vgid = VgId::parse(&vg.id)?;
            let vg_handle = self.ensure_vginfo(vgid, &vg.name);

            let witness = Witness {
                seqno: vg.seqno,
                mda_size: 0,
                mda_checksum: 0,
            };
            self.apply_witness(vg_handle, witness);
            if let Some(info) = self.vginfos.get_mut(vg_handle) {
                // Metadata came from the daemon's cache, not a label scan
                // of these PVs directly; a later rescan need not redo the
                // work the daemon already did.
                info.independent_metadata_location = true;
            }

            for (device, pv) in &vg.pvs {
                let pvid = PvId::parse(&pv.id)?;
                if let Some(handle) = self.add(pvid, *device, pv.dev_size, "lvmetad") {
                    self.attach(handle, vg_handle)?;
                }
            }
        }
        Ok(())
    }

    // ---- Registry (§4.1) --------------------------------------------

    pub fn get_info_by_pvid(&self, pvid: PvId) -> Option<&PvInfo> {
        self.pvid_index.get(&pvid).and_then(|&h| self.pvinfos.get(h))
    }

    pub fn get_info_by_device(&self, device: Device) -> Option<&PvInfo> {
        self.dev_index.get(&device).and_then(|&h| self.pvinfos.get(h))
    }

    pub fn get_vginfo_by_name(&self, name: &str) -> Option<&VgInfo> {
        self.vgname_index.get(name).and_then(|&h| self.vginfos.get(h))
    }

    pub fn get_vginfo_by_vgid(&self, vgid: VgId) -> Option<&VgInfo> {
        self.vgid_index.get(&vgid).and_then(|&h| self.vginfos.get(h))
    }

    pub fn vgid_from_vgname(&self, name: &str) -> Option<VgId> {
        self.get_vginfo_by_name(name).map(|v| v.id)
    }

    pub fn pvids(&self) -> Vec<PvId> {
        self.pvid_index.keys().copied().collect()
    }

    pub fn vg_names(&self) -> Vec<String> {
        self.vgname_index.keys().cloned().collect()
    }

    pub fn vg_ids(&self) -> Vec<VgId> {
        self.vgid_index.keys().copied().collect()
    }

    /// Record a newly discovered (or re-confirmed) PV. Returns the handle
    /// to use in subsequent calls, or `None` if `device` conflicts with an
    /// already-registered device for this `pvid` — in which case the
    /// conflict is recorded with the duplicate resolver instead of
    /// replacing the existing mapping.
    pub fn add(
        &mut self,
        pvid: PvId,
        device: Device,
        dev_size: u64,
        labeller: LabellerId,
    ) -> Option<PvHandle> {
        if let Some(&existing) = self.pvid_index.get(&pvid) {
            let existing_device = self.pvinfos.get(existing).map(|p| p.device);

            if existing_device != Some(device) {
                // Record the incumbent too, the first time this pair of
                // devices is seen claiming the same pvid, so the resolver
                // has a complete group to rank rather than just the new
                // arrival.
                if let Some(existing_device) = existing_device {
                    let already_known = self
                        .duplicates
                        .found_duplicates()
                        .iter()
                        .any(|f| f.pvid == pvid && f.device == existing_device);
                    if !already_known {
                        self.duplicates.record(DuplicateCandidateFacts {
                            pvid,
                            device: existing_device,
                            sticky_unpreferred: false,
                            is_in_use_by_lv: false,
                            size_is_correct: false,
                            has_mounted_filesystem: false,
                            is_dm_major: false,
                            is_subsystem_member: false,
                            is_md_component: false,
                            first_seen_order: 0,
                        });
                    }
                }

                self.duplicates.record(DuplicateCandidateFacts {
                    pvid,
                    device,
                    sticky_unpreferred: false,
                    is_in_use_by_lv: false,
                    size_is_correct: false,
                    has_mounted_filesystem: false,
                    is_dm_major: false,
                    is_subsystem_member: false,
                    is_md_component: false,
                    first_seen_order: 0,
                });
                return None;
            }

            if let Some(info) = self.pvinfos.get_mut(existing) {
                if info.labeller != Some(labeller) {
                    // The labeller differs from what we had on file:
                    // destroy and recreate the label-derived state, but
                    // keep the PV's identity and VG membership intact.
                    info.labeller = Some(labeller);
                    info.mdas.clear();
                    info.das.clear();
                    info.bas.clear();
                }
                info.dev_size = dev_size;
            }

            self.duplicates.set_current(pvid, device);
            return Some(existing);
        }

        let info = PvInfo::new(pvid, device, dev_size, labeller);
        let handle = self.pvinfos.insert(info);
        self.pvid_index.insert(pvid, handle);
        self.dev_index.insert(device, handle);
        self.duplicates.set_current(pvid, device);
        Some(handle)
    }

    /// Remove a PV entirely: detaches it from its VG first, then drops it
    /// from every index. Returns `false` if `pv` is not a live handle.
    pub fn del(&mut self, pv: PvHandle) -> bool {
        if self.pvinfos.get(pv).is_none() {
            return false;
        }
        if let Err(e) = self.detach(pv) {
            error!("programming error while removing PV: {}", e);
        }
        if let Some(info) = self.pvinfos.remove(pv) {
            self.pvid_index.remove(&info.id);
            self.dev_index.remove(&info.device);
            self.duplicates.clear_current(info.id);
            true
        } else {
            false
        }
    }

    pub fn del_dev(&mut self, device: Device) -> bool {
        match self.dev_index.get(&device).copied() {
            Some(h) => self.del(h),
            None => false,
        }
    }

    /// Create (if needed) the reserved orphan VG for `format` and return
    /// its handle. Orphan VGInfos are never freed by `detach`, even when
    /// they hold no PVs — per-invariant, they persist for the lifetime of
    /// the cache.
    pub fn add_orphan_vginfo(&mut self, format: &str) -> VgHandle {
        let name = format!("#orphans_{}", format);
        if let Some(&h) = self.vgname_index.get(&name) {
            return h;
        }

        let mut info = VgInfo::new(VgId::new(), name.clone());
        info.format = format.to_string();
        let id = info.id;
        let handle = self.vginfos.insert(info);
        self.vgid_index.insert(id, handle);
        self.vgname_index.insert(name, handle);
        handle
    }

    fn ensure_vginfo(&mut self, vgid: VgId, name: &str) -> VgHandle {
        if let Some(&h) = self.vgid_index.get(&vgid) {
            return h;
        }

        let info = VgInfo::new(vgid, name.to_string());
        let handle = self.vginfos.insert(info);
        self.vgid_index.insert(vgid, handle);
        self.insert_into_chain(name, handle);
        handle
    }

    /// Update a VG's name and/or id (e.g. a `vgrename`, or a VG whose
    /// UUID was reassigned by `vgimportclone`). Re-keys both indexes;
    /// relinks the name-alias chain if the name changed.
    pub fn update_vgname_and_id(&mut self, vg: VgHandle, new_name: &str, new_id: VgId) -> Result<()> {
        let old_name = self
            .vginfos
            .get(vg)
            .map(|v| v.name.clone())
            .ok_or_else(|| Error::Programming("update_vgname_and_id: unknown handle".to_string()))?;
        let old_id = self.vginfos.get(vg).unwrap().id;

        if old_name != new_name {
            self.unlink_from_chain(&old_name, vg);
            self.vginfos.get_mut(vg).unwrap().name = new_name.to_string();
            self.insert_into_chain(new_name, vg);
        }

        if old_id != new_id {
            self.vgid_index.remove(&old_id);
            self.vginfos.get_mut(vg).unwrap().id = new_id;
            self.vgid_index.insert(new_id, vg);
        }

        Ok(())
    }

    /// Overwrite a VgInfo's descriptive fields wholesale (used by callers
    /// that already have an authoritative `VG`, as opposed to the
    /// incremental field-at-a-time updates `update()` applies from a scan
    /// summary).
    pub fn update_vg(&mut self, vg: VgHandle, summary: &VgSummary) -> Result<()> {
        let info = self
            .vginfos
            .get_mut(vg)
            .ok_or_else(|| Error::Programming("update_vg: unknown handle".to_string()))?;
        info.format = summary.format.clone();
        info.status = summary.status.clone();
        info.lock_type = summary.lock_type.clone();
        info.system_id = summary.system_id.clone();
        info.creation_host = summary.creation_host.clone();
        info.exported = summary.exported;
        Ok(())
    }

    fn insert_into_chain(&mut self, name: &str, handle: VgHandle) {
        let new_key = chain_order_key(self.vginfos.get(handle).unwrap(), &self.local_host);

        let head = match self.vgname_index.get(name).copied() {
            None => {
                self.vgname_index.insert(name.to_string(), handle);
                return;
            }
            Some(h) => h,
        };

        let head_key = chain_order_key(self.vginfos.get(head).unwrap(), &self.local_host);
        if new_key < head_key {
            self.vginfos.get_mut(handle).unwrap().next = Some(head);
            self.vgname_index.insert(name.to_string(), handle);
            return;
        }

        let mut cur = head;
        loop {
            let cur_next = self.vginfos.get(cur).unwrap().next;
            match cur_next {
                None => {
                    self.vginfos.get_mut(cur).unwrap().next = Some(handle);
                    return;
                }
                Some(next) => {
                    let next_key = chain_order_key(self.vginfos.get(next).unwrap(), &self.local_host);
                    if new_key < next_key {
                        self.vginfos.get_mut(handle).unwrap().next = Some(next);
                        self.vginfos.get_mut(cur).unwrap().next = Some(handle);
                        return;
                    }
                    cur = next;
                }
            }
        }
    }

    fn unlink_from_chain(&mut self, name: &str, handle: VgHandle) {
        let head = match self.vgname_index.get(name).copied() {
            Some(h) => h,
            None => return,
        };

        if head == handle {
            match self.vginfos.get(handle).and_then(|v| v.next) {
                Some(next) => {
                    self.vgname_index.insert(name.to_string(), next);
                }
                None => {
                    self.vgname_index.remove(name);
                }
            }
            return;
        }

        let mut cur = head;
        loop {
            let next = self.vginfos.get(cur).and_then(|v| v.next);
            match next {
                Some(n) if n == handle => {
                    let after = self.vginfos.get(handle).and_then(|v| v.next);
                    self.vginfos.get_mut(cur).unwrap().next = after;
                    return;
                }
                Some(n) => cur = n,
                None => return,
            }
        }
    }

    // ---- Attach/Detach (§4.2) ----------------------------------------

    /// Attach `pv` to `vg`, inserting it into the VG's PV list and
    /// mirroring the VG's current lock state onto the PvInfo.
    pub fn attach(&mut self, pv: PvHandle, vg: VgHandle) -> Result<()> {
        let vg_name = self
            .vginfos
            .get(vg)
            .map(|v| v.name.clone())
            .ok_or_else(|| Error::Programming("attach: unknown vg handle".to_string()))?;
        let locked = self.locks.is_locked(&vg_name);

        let pvinfo = self
            .pvinfos
            .get_mut(pv)
            .ok_or_else(|| Error::Programming("attach: unknown pv handle".to_string()))?;
        pvinfo.vg = Some(vg);
        pvinfo.cache_locked = locked;

        self.vginfos.get_mut(vg).unwrap().pvs.push(pv);
        Ok(())
    }

    /// Detach `pv` from whatever VG it currently belongs to, if any. If
    /// that VG is left with no members and is not an orphan VG, it is
    /// freed: unlinked from its name-alias chain and removed from the
    /// VG-id index.
    pub fn detach(&mut self, pv: PvHandle) -> Result<()> {
        let vg_handle = match self.pvinfos.get(pv).and_then(|p| p.vg) {
            Some(v) => v,
            None => return Ok(()),
        };

        if let Some(pvinfo) = self.pvinfos.get_mut(pv) {
            pvinfo.vg = None;
            pvinfo.cache_locked = false;
        }

        if let Some(vginfo) = self.vginfos.get_mut(vg_handle) {
            vginfo.pvs.retain(|&h| h != pv);
        }

        let (now_empty, is_orphan, name, id) = match self.vginfos.get(vg_handle) {
            Some(v) => (v.pvs.is_empty(), v.is_orphan(), v.name.clone(), v.id),
            None => return Ok(()),
        };

        if now_empty && !is_orphan {
            self.unlink_from_chain(&name, vg_handle);
            self.vgid_index.remove(&id);
            self.vginfos.remove(vg_handle);
        }

        Ok(())
    }

    // ---- Update pipeline (§4.3) ---------------------------------------

    /// Reconcile one PV's scan result into the registry.
    ///
    /// A PV with no metadata area and no witness to report is suppressed
    /// from founding a brand-new VG during a scan's critical section — it
    /// is instead parked in its format's orphan VG if it isn't anywhere
    /// yet. Otherwise the PV is relocated to the VG the summary names (if
    /// it isn't there already), the VG's witness is reconciled
    /// first-wins, and descriptive fields are rewritten only where they
    /// actually changed.
    pub fn update(&mut self, pv: PvHandle, summary: VgSummary) -> Result<()> {
        if self.pvinfos.get(pv).is_none() {
            return Err(Error::Programming("update: unknown pv handle".to_string()));
        }

        let current_vg = self.pvinfos.get(pv).unwrap().vg;

        if summary.witness.is_none() && !summary.has_mda {
            if current_vg.is_none() {
                let orphan = self.add_orphan_vginfo(&summary.format);
                self.attach(pv, orphan)?;
            }
            return Ok(());
        }

        let needs_move = match current_vg {
            Some(h) => self.vginfos.get(h).map(|v| v.id != summary.id).unwrap_or(true),
            None => true,
        };

        if needs_move {
            self.detach(pv)?;
            let handle = self.ensure_vginfo(summary.id, &summary.name);
            self.attach(pv, handle)?;
        }

        let vg_handle = self.pvinfos.get(pv).and_then(|p| p.vg).ok_or_else(|| {
            Error::Programming("update: pv not attached after relocation".to_string())
        })?;

        if let Some(witness) = summary.witness {
            self.apply_witness(vg_handle, witness);
        }

        let info = self.vginfos.get_mut(vg_handle).unwrap();
        if info.format != summary.format {
            info.format = summary.format.clone();
        }
        if info.status != summary.status {
            info.status = summary.status.clone();
        }
        if info.lock_type != summary.lock_type {
            info.lock_type = summary.lock_type.clone();
        }
        if info.system_id != summary.system_id {
            info.system_id = summary.system_id.clone();
        }
        if info.creation_host != summary.creation_host {
            info.creation_host = summary.creation_host.clone();
        }
        if info.exported != summary.exported {
            info.exported = summary.exported;
        }

        Ok(())
    }

    fn apply_witness(&mut self, vg_handle: VgHandle, witness: Witness) {
        let info = match self.vginfos.get_mut(vg_handle) {
            Some(v) => v,
            None => return,
        };
        let (w, mismatch) = reconcile_witness(info.witness, witness);
        info.witness = Some(w);
        if mismatch && !info.scan_summary_mismatch {
            info.scan_summary_mismatch = true;
            warn!("scan summary mismatch for VG {}", info.name);
        }
    }

    pub fn lookup_mda(&self, pv: PvHandle) -> &[crate::pv::MetadataArea] {
        self.pvinfos.get(pv).map(|p| p.mdas.as_slice()).unwrap_or(&[])
    }

    pub fn scan_mismatch(&self, vgid: VgId) -> bool {
        self.get_vginfo_by_vgid(vgid)
            .map(|v| v.scan_summary_mismatch)
            .unwrap_or(false)
    }

    pub fn begin_scan(&mut self) -> Result<()> {
        if self.scanning_in_progress {
            return Err(Error::ReentrantScan);
        }
        self.scanning_in_progress = true;
        Ok(())
    }

    pub fn end_scan(&mut self) {
        self.scanning_in_progress = false;
    }

    // ---- Duplicate resolver (§4.4) -------------------------------------

    pub fn record_duplicate_candidate(&mut self, facts: DuplicateCandidateFacts) {
        self.duplicates.record(facts);
    }

    pub fn found_duplicates(&self) -> &[DuplicateCandidateFacts] {
        self.duplicates.found_duplicates()
    }

    pub fn unused_duplicates(&self) -> Vec<&DuplicateCandidateFacts> {
        self.duplicates.unused_duplicates()
    }

    pub fn vg_has_duplicate_pvs(&self, vg: &VgInfo) -> bool {
        let pvids: Vec<PvId> = vg
            .pvs
            .iter()
            .filter_map(|&h| self.pvinfos.get(h).map(|p| p.id))
            .collect();
        self.duplicates.vg_has_duplicate_pvs(&pvids)
    }

    /// Resolve every current duplicate group to one winner. Callers are
    /// expected to `del_dev` every returned loser and `add`/re-scan every
    /// returned winner.
    pub fn resolve_duplicates(&mut self) -> (Vec<Device>, Vec<Device>) {
        self.duplicates.resolve()
    }

    // ---- Lock registry (§4.5) ------------------------------------------

    pub fn lock(&mut self, name: &str) {
        self.locks.lock(name);
        self.propagate_lock_state(name);
    }

    pub fn unlock(&mut self, name: &str) {
        self.locks.unlock(name);
        self.propagate_lock_state(name);
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks.is_locked(name)
    }

    pub fn vgs_locked(&self) -> usize {
        self.locks.vgs_locked()
    }

    /// Checks the order locks were actually acquired in against the
    /// required alphabetical ordering. Returns the first violating pair,
    /// if any — a caller (or a test) can use this to catch a command that
    /// took VG locks out of order even though `lock` itself never refuses.
    pub fn verify_lock_order(&self) -> Option<(String, String)> {
        self.locks.verify_order()
    }

    /// Suppress (or re-enable) `verify_lock_order`'s check.
    pub fn set_ordering_enabled(&mut self, enabled: bool) {
        self.locks.set_ordering_enabled(enabled);
    }

    /// Monotonic counter bumped by every `unlock` of a non-global name,
    /// invalidating cached device sizes elsewhere.
    pub fn device_size_seqno(&self) -> u64 {
        self.locks.device_size_seqno()
    }

    fn propagate_lock_state(&mut self, name: &str) {
        let locked = self.locks.is_locked(name);
        if let Some(&vg_handle) = self.vgname_index.get(name) {
            let pvs = self.vginfos.get(vg_handle).map(|v| v.pvs.clone()).unwrap_or_default();
            for pv in pvs {
                if let Some(info) = self.pvinfos.get_mut(pv) {
                    info.cache_locked = locked;
                }
            }
        }
    }

    // ---- Saved VG buffer (§4.6, cluster daemon only) -------------------

    /// Save a snapshot of `vg` under `vgid`. `precommitted` selects the
    /// slot: `true` for `new`, `false` for `old`.
    pub fn save_vg(&mut self, vgid: VgId, vg: &VG, precommitted: bool) -> Result<()> {
        self.saved_vgs.save(vgid, vg, precommitted)
    }

    /// Fetch `vgid`'s snapshot. `precommitted` prefers `new`; its absence
    /// prefers `old`. Falls back to the other side (with a warning) if the
    /// requested one is missing.
    pub fn get_vg(&mut self, vgid: VgId, precommitted: bool) -> Option<&VG> {
        self.saved_vgs.get(vgid, precommitted)
    }

    pub fn get_latest_vg(&mut self, vgid: VgId) -> Option<&VG> {
        self.saved_vgs.get_latest(vgid)
    }

    /// Commit the saved snapshot for `vgname`. Resolves the name to a
    /// `VgId` through the registry, then delegates to the VG-id-keyed
    /// saved-VG buffer.
    pub fn commit_vg(&mut self, vgname: &str) -> Result<()> {
        let vgid = self
            .vgid_from_vgname(vgname)
            .ok_or_else(|| Error::NotFound(format!("no such VG: {}", vgname)))?;
        self.saved_vgs.commit(vgid)
    }

    /// Free the saved snapshot(s) for `vgname`. With `drop_precommitted`
    /// set, frees only `new`; otherwise both. The orphan VG pseudo-name is
    /// a wildcard for "both", overriding whatever flag is passed.
    pub fn drop_vg(&mut self, vgname: &str, drop_precommitted: bool) -> Result<()> {
        let drop_precommitted = if vgname.starts_with("#orphans") {
            false
        } else {
            drop_precommitted
        };
        let vgid = self
            .vgid_from_vgname(vgname)
            .ok_or_else(|| Error::NotFound(format!("no such VG: {}", vgname)))?;
        self.saved_vgs.drop(vgid, drop_precommitted);
        Ok(())
    }

    /// Invalidate both saved-VG slots for `vgid`.
    pub fn drop_vg_by_id(&mut self, vgid: VgId) {
        self.saved_vgs.drop_by_vgid(vgid)
    }

    pub fn take_deferred_free(&mut self) -> Vec<VG> {
        self.saved_vgs.take_deferred_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, id: VgId, seqno: u64) -> VgSummary {
        VgSummary {
            name: name.to_string(),
            id,
            format: "lvm2".to_string(),
            status: vec!["READ".to_string(), "WRITE".to_string()],
            lock_type: String::new(),
            system_id: String::new(),
            creation_host: "host1".to_string(),
            exported: false,
            witness: Some(Witness {
                seqno,
                mda_size: 4096,
                mda_checksum: 1,
            }),
            has_mda: true,
        }
    }

    #[test]
    fn add_then_lookup_by_pvid_and_device() {
        let mut cache = Cache::new();
        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let handle = cache.add(pvid, dev, 1024, "lvm2").unwrap();

        assert_eq!(cache.get_info_by_pvid(pvid).unwrap().device, dev);
        assert_eq!(cache.get_info_by_device(dev).unwrap().id, pvid);
        assert!(cache.pvinfos.contains(handle));
    }

    #[test]
    fn add_same_pvid_different_device_is_recorded_as_duplicate_not_replaced() {
        let mut cache = Cache::new();
        let pvid = PvId::new();
        let dev1 = Device::from(0x0800u64);
        let dev2 = Device::from(0x0810u64);

        let first = cache.add(pvid, dev1, 1024, "lvm2").unwrap();
        let second = cache.add(pvid, dev2, 1024, "lvm2");

        assert!(second.is_none());
        // Both the incumbent and the new arrival are recorded, so the
        // resolver sees a complete group of 2 for this pvid.
        assert_eq!(cache.found_duplicates().len(), 2);
        assert_eq!(cache.get_info_by_pvid(pvid).unwrap().device, dev1);
        assert!(cache.pvinfos.contains(first));
    }

    #[test]
    fn update_creates_vg_and_attaches_pv() {
        let mut cache = Cache::new();
        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let pv = cache.add(pvid, dev, 1024, "lvm2").unwrap();

        let vgid = VgId::new();
        cache.update(pv, summary("myvg", vgid, 1)).unwrap();

        let vginfo = cache.get_vginfo_by_name("myvg").unwrap();
        assert_eq!(vginfo.id, vgid);
        assert_eq!(vginfo.pvs.len(), 1);
        assert_eq!(cache.get_info_by_pvid(pvid).unwrap().vg.is_some(), true);
    }

    #[test]
    fn mismatched_witness_never_evicts_first_witness() {
        let mut cache = Cache::new();
        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let pv = cache.add(pvid, dev, 1024, "lvm2").unwrap();
        let vgid = VgId::new();

        cache.update(pv, summary("myvg", vgid, 1)).unwrap();
        cache.update(pv, summary("myvg", vgid, 2)).unwrap();

        let vginfo = cache.get_vginfo_by_name("myvg").unwrap();
        assert_eq!(vginfo.witness.unwrap().seqno, 1);
        assert!(vginfo.scan_summary_mismatch);
        assert!(cache.scan_mismatch(vgid));
    }

    #[test]
    fn detaching_last_pv_frees_non_orphan_vg_but_not_orphan() {
        let mut cache = Cache::new();
        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let pv = cache.add(pvid, dev, 1024, "lvm2").unwrap();
        let vgid = VgId::new();
        cache.update(pv, summary("myvg", vgid, 1)).unwrap();

        cache.detach(pv).unwrap();
        assert!(cache.get_vginfo_by_name("myvg").is_none());

        let orphan = cache.add_orphan_vginfo("lvm2");
        cache.attach(pv, orphan).unwrap();
        cache.detach(pv).unwrap();
        assert!(cache.get_vginfo_by_name("#orphans_lvm2").is_some());
    }

    #[test]
    fn lock_state_propagates_to_member_pvs() {
        let mut cache = Cache::new();
        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let pv = cache.add(pvid, dev, 1024, "lvm2").unwrap();
        let vgid = VgId::new();
        cache.update(pv, summary("myvg", vgid, 1)).unwrap();

        cache.lock("myvg");
        assert!(cache.get_info_by_pvid(pvid).unwrap().cache_locked);
        cache.unlock("myvg");
        assert!(!cache.get_info_by_pvid(pvid).unwrap().cache_locked);
    }

    #[test]
    fn destroy_reports_locked_vgs_and_drains_everything() {
        let mut cache = Cache::new();
        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let pv = cache.add(pvid, dev, 1024, "lvm2").unwrap();
        let vgid = VgId::new();
        cache.update(pv, summary("myvg", vgid, 1)).unwrap();
        cache.lock("myvg");

        let report = cache.destroy();
        assert_eq!(report.locked_vgs, vec!["myvg".to_string()]);
        assert!(cache.get_vginfo_by_name("myvg").is_none());
        assert!(cache.get_info_by_pvid(pvid).is_none());
    }

    #[test]
    fn saved_vg_commit_resolves_name_to_id() {
        let mut cache = Cache::new();
        let vgid = VgId::new();
        let mut vg = crate::vg::empty("myvg");
        vg.id = vgid.to_string();

        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let pv = cache.add(pvid, dev, 1024, "lvm2").unwrap();
        cache.update(pv, summary("myvg", vgid, 1)).unwrap();

        cache.save_vg(vgid, &vg, true).unwrap();
        cache.commit_vg("myvg").unwrap();
        assert_eq!(cache.get_latest_vg(vgid).unwrap().name, "myvg");
    }

    #[test]
    fn drop_vg_by_name_frees_only_new_when_precommitted() {
        let mut cache = Cache::new();
        let vgid = VgId::new();
        let mut vg_old = crate::vg::empty("myvg");
        vg_old.id = vgid.to_string();
        vg_old.seqno = 1;
        let mut vg_new = crate::vg::empty("myvg");
        vg_new.id = vgid.to_string();
        vg_new.seqno = 2;

        let pvid = PvId::new();
        let dev = Device::from(0x0800u64);
        let pv = cache.add(pvid, dev, 1024, "lvm2").unwrap();
        cache.update(pv, summary("myvg", vgid, 1)).unwrap();

        cache.save_vg(vgid, &vg_old, false).unwrap();
        cache.save_vg(vgid, &vg_new, true).unwrap();

        cache.drop_vg("myvg", true).unwrap();
        assert_eq!(cache.get_vg(vgid, false).unwrap().seqno, 1);
        assert!(cache.take_deferred_free().len() == 1);
    }
}
