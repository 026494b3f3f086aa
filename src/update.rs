// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Types and pure decision helpers for the update pipeline (§4.3).
//!
//! The pipeline itself (`Cache::update`) lives on [`crate::registry::Cache`]
//! because it has to touch the PV/VG arenas and indexes directly; this
//! module holds the parts of it that don't need arena access, so they can
//! be tested and reasoned about on their own.

use crate::vg::{VgId, Witness};

/// What one scan of a PV reports about the VG it currently claims
/// membership in. `None` fields mean the scan found nothing new to say
/// about that aspect of the VG (e.g. a daemon-seeded update that doesn't
/// carry a fresh witness) rather than that the field should be cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgSummary {
    pub name: String,
    pub id: VgId,
    pub format: String,
    pub status: Vec<String>,
    pub lock_type: String,
    pub system_id: String,
    pub creation_host: String,
    pub exported: bool,
    /// `None` when the PV backing this summary has no metadata area — the
    /// update pipeline treats this as "no opinion on the VG's witness",
    /// not as "the VG has no witness".
    pub witness: Option<Witness>,
    /// Whether the PV this summary came from carries a metadata area at
    /// all. A PV without one can't independently justify pulling a PV out
    /// of the orphan VG and into a new, as-yet-unwitnessed real VG during
    /// the scan's critical section.
    pub has_mda: bool,
}

/// First-witness-wins reconciliation: the first witness observed for a VG
/// becomes canonical. A later, differing witness never evicts it — it only
/// sets the mismatch flag the caller should record on the VgInfo. Returns
/// `(witness_to_keep, is_mismatch)`.
pub fn reconcile_witness(current: Option<Witness>, incoming: Witness) -> (Witness, bool) {
    match current {
        None => (incoming, false),
        Some(cur) if cur == incoming => (cur, false),
        Some(cur) => (cur, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn witness(seqno: u64) -> Witness {
        Witness {
            seqno,
            mda_size: 4096,
            mda_checksum: 0xdead_beef,
        }
    }

    #[test]
    fn first_witness_is_adopted_without_mismatch() {
        let (w, mismatch) = reconcile_witness(None, witness(1));
        assert_eq!(w, witness(1));
        assert!(!mismatch);
    }

    #[test]
    fn matching_later_witness_is_not_a_mismatch() {
        let (w, mismatch) = reconcile_witness(Some(witness(1)), witness(1));
        assert_eq!(w, witness(1));
        assert!(!mismatch);
    }

    #[test]
    fn differing_later_witness_is_flagged_but_never_evicts() {
        let (w, mismatch) = reconcile_witness(Some(witness(1)), witness(2));
        assert_eq!(w, witness(1));
        assert!(mismatch);
    }
}
