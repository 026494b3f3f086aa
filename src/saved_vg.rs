// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The saved-VG buffer (§4.6), used only by the cluster daemon's resume
//! path: when a command is interrupted partway through committing new VG
//! metadata, the daemon needs both the pre-change and post-change metadata
//! on hand until the command either finishes or is abandoned.
//!
//! Each VG id gets up to two slots, `old` and `new`. Which slot a `save`
//! targets is picked by its caller (`precommitted` selects `new`), not by
//! seqno comparison. A deep copy is taken on `save` by round-tripping the
//! VG through [`crate::vg`]'s text exporter/importer, so the buffer never
//! aliases the caller's `VG` and a later mutation of the caller's copy
//! cannot reach back into the buffer. Superseded snapshots are never freed
//! immediately — they go on a deferred-free list a caller can drain once it
//! knows nothing still holds a reference into them (e.g. after the scan
//! that produced them is fully processed).

use std::collections::HashMap;

use log::warn;

use crate::vg::{VgId, VG};
use crate::{Error, Result};

fn deep_copy(vg: &VG) -> Result<VG> {
    let map = crate::vg::to_textmap(vg);
    VG::from_textmap(&vg.name, &map)
}

#[derive(Debug, Default)]
struct Slot {
    old: Option<VG>,
    new: Option<VG>,
    committed: bool,
}

/// If `new` is about to be handed out while `old` is present with a
/// strictly smaller seqno, `old` is stale by construction — eagerly
/// deferred-free it rather than waiting for the next `save` to displace it.
fn invalidate_stale_old(slot: &mut Slot, deferred_free: &mut Vec<VG>) {
    let old_is_stale = match (&slot.new, &slot.old) {
        (Some(new), Some(old)) => old.seqno < new.seqno,
        _ => false,
    };
    if old_is_stale {
        if let Some(old) = slot.old.take() {
            deferred_free.push(old);
        }
    }
}

#[derive(Debug, Default)]
pub struct SavedVgBuffer {
    slots: HashMap<VgId, Slot>,
    deferred_free: Vec<VG>,
}

impl SavedVgBuffer {
    pub fn new() -> SavedVgBuffer {
        SavedVgBuffer::default()
    }

    /// Save a snapshot of `vg` under `vgid`. `precommitted` selects which
    /// slot receives it: `true` targets `new`, `false` targets `old`.
    ///
    /// If the targeted slot already holds a snapshot with the same seqno,
    /// this is a no-op: no deep copy is made and nothing is invalidated.
    /// Otherwise the slot's current contents, if any, are moved onto the
    /// deferred-free list and the incoming VG is deep-copied into the slot.
    pub fn save(&mut self, vgid: VgId, vg: &VG, precommitted: bool) -> Result<()> {
        let slot = self.slots.entry(vgid).or_insert_with(Slot::default);
        let target = if precommitted { &slot.new } else { &slot.old };
        if target.as_ref().map_or(false, |existing| existing.seqno == vg.seqno) {
            return Ok(());
        }

        let copy = deep_copy(vg)?;
        let displaced = if precommitted {
            slot.new.replace(copy)
        } else {
            slot.old.replace(copy)
        };
        if let Some(displaced) = displaced {
            self.deferred_free.push(displaced);
        }
        if precommitted {
            slot.committed = false;
        }

        Ok(())
    }

    /// Fetch `vgid`'s snapshot on the requested side. `precommitted`
    /// prefers `new`, its absence prefers `old`; if the requested side is
    /// missing but the other is present, the other side is returned and a
    /// warning logged. When `new` is the side handed back, a stale `old`
    /// (strictly smaller seqno) is eagerly invalidated.
    pub fn get(&mut self, vgid: VgId, precommitted: bool) -> Option<&VG> {
        let SavedVgBuffer { slots, deferred_free } = self;
        let slot = slots.get_mut(&vgid)?;

        let return_new = if precommitted {
            if slot.new.is_some() {
                true
            } else {
                if slot.old.is_some() {
                    warn!("saved-VG buffer: precommitted snapshot for {} missing, returning committed", vgid);
                }
                false
            }
        } else if slot.old.is_some() {
            false
        } else {
            if slot.new.is_some() {
                warn!("saved-VG buffer: committed snapshot for {} missing, returning precommitted", vgid);
            }
            true
        };

        if return_new {
            invalidate_stale_old(slot, deferred_free);
            slot.new.as_ref()
        } else {
            slot.old.as_ref()
        }
    }

    /// The authoritative snapshot for `vgid`: `new` once `commit` has been
    /// called for it, `old` otherwise. Applies the same eager-invalidation
    /// rule as `get` when handing back `new`.
    pub fn get_latest(&mut self, vgid: VgId) -> Option<&VG> {
        let SavedVgBuffer { slots, deferred_free } = self;
        let slot = slots.get_mut(&vgid)?;

        if slot.committed && slot.new.is_some() {
            invalidate_stale_old(slot, deferred_free);
            slot.new.as_ref()
        } else {
            slot.old.as_ref()
        }
    }

    /// Mark `vgid`'s `new` snapshot as the committed one. No snapshot is
    /// moved between slots.
    pub fn commit(&mut self, vgid: VgId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(&vgid)
            .ok_or_else(|| Error::NotFound(format!("no saved VG for {}", vgid)))?;

        if slot.new.is_none() {
            return Err(Error::NotFound(format!(
                "no uncommitted snapshot to commit for {}",
                vgid
            )));
        }

        slot.committed = true;
        Ok(())
    }

    /// Free `new` only when `drop_precommitted` is set; otherwise free both
    /// slots and forget `vgid` entirely.
    pub fn drop(&mut self, vgid: VgId, drop_precommitted: bool) {
        if drop_precommitted {
            if let Some(slot) = self.slots.get_mut(&vgid) {
                if let Some(new) = slot.new.take() {
                    self.deferred_free.push(new);
                }
            }
        } else {
            self.drop_by_vgid(vgid);
        }
    }

    /// Invalidate both slots for `vgid`.
    pub fn drop_by_vgid(&mut self, vgid: VgId) {
        if let Some(slot) = self.slots.remove(&vgid) {
            if let Some(old) = slot.old {
                self.deferred_free.push(old);
            }
            if let Some(new) = slot.new {
                self.deferred_free.push(new);
            }
        }
    }

    /// Drain and return everything queued for deferred free. Once a
    /// caller has established nothing still references the snapshots
    /// (e.g. the in-flight command has fully completed), it calls this to
    /// actually reclaim them.
    pub fn take_deferred_free(&mut self) -> Vec<VG> {
        std::mem::take(&mut self.deferred_free)
    }

    pub fn is_committed(&self, vgid: VgId) -> bool {
        self.slots.get(&vgid).map_or(false, |s| s.committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vg_with_seqno(name: &str, seqno: u64) -> VG {
        let mut vg = crate::vg::empty(name);
        vg.seqno = seqno;
        vg
    }

    #[test]
    fn save_deep_copies_so_later_mutation_does_not_alias() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        let mut vg = vg_with_seqno("myvg", 1);
        buf.save(vgid, &vg, true).unwrap();

        vg.name = "mutated".to_string();
        assert_eq!(buf.get(vgid, true).unwrap().name, "myvg");
    }

    #[test]
    fn precommitted_flag_selects_the_slot_independent_of_seqno() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        // A higher-seqno snapshot saved as committed (`precommitted=false`)
        // still lands in `old`, not `new`.
        buf.save(vgid, &vg_with_seqno("myvg", 5), false).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 1), true).unwrap();

        assert_eq!(buf.get(vgid, false).unwrap().seqno, 5);
        assert_eq!(buf.get(vgid, true).unwrap().seqno, 1);
    }

    #[test]
    fn same_seqno_save_is_a_no_op() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), true).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 1), true).unwrap();

        assert_eq!(buf.get(vgid, true).unwrap().seqno, 1);
        assert!(buf.take_deferred_free().is_empty());
    }

    #[test]
    fn second_save_to_same_slot_defers_free_of_the_displaced_snapshot() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), true).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 2), true).unwrap();

        assert_eq!(buf.get(vgid, true).unwrap().seqno, 2);
        let freed = buf.take_deferred_free();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].seqno, 1);
    }

    #[test]
    fn get_falls_back_to_the_other_side_when_requested_side_is_missing() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), false).unwrap();

        assert_eq!(buf.get(vgid, true).unwrap().seqno, 1);
    }

    #[test]
    fn get_new_eagerly_invalidates_a_stale_old() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), false).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 2), true).unwrap();

        assert_eq!(buf.get(vgid, true).unwrap().seqno, 2);
        let freed = buf.take_deferred_free();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].seqno, 1);
    }

    #[test]
    fn get_latest_follows_the_committed_flag() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), false).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 2), true).unwrap();
        assert_eq!(buf.get_latest(vgid).unwrap().seqno, 1);

        buf.commit(vgid).unwrap();
        assert_eq!(buf.get_latest(vgid).unwrap().seqno, 2);
    }

    #[test]
    fn resume_path_promotes_new_after_commit_and_defers_old() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), false).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 2), true).unwrap();
        buf.commit(vgid).unwrap();

        assert_eq!(buf.get_latest(vgid).unwrap().seqno, 2);
        // `get_latest` just invalidated the stale `old`, so `get(.., false)`
        // now falls back to `new` too.
        assert_eq!(buf.get(vgid, false).unwrap().seqno, 2);

        let freed = buf.take_deferred_free();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].seqno, 1);
    }

    #[test]
    fn drop_precommitted_frees_only_new() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), false).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 2), true).unwrap();

        buf.drop(vgid, true);
        assert_eq!(buf.get(vgid, false).unwrap().seqno, 1);
        assert_eq!(buf.take_deferred_free().len(), 1);
    }

    #[test]
    fn drop_by_vgid_clears_and_defers_both_slots() {
        let mut buf = SavedVgBuffer::new();
        let vgid = VgId::new();
        buf.save(vgid, &vg_with_seqno("myvg", 1), false).unwrap();
        buf.save(vgid, &vg_with_seqno("myvg", 2), true).unwrap();

        buf.drop_by_vgid(vgid);
        assert!(buf.get(vgid, true).is_none());
        assert_eq!(buf.take_deferred_free().len(), 2);
    }
}
