// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory lock-ordering discipline (§4.5).
//!
//! This tracks *that* a name is locked and in what order locks were taken;
//! it does not itself provide mutual exclusion across processes — the real
//! cross-host lock is acquired by an external collaborator before the
//! command layer ever touches the cache. What lives here exists to catch a
//! caller that locks VGs out of the alphabetical order the real lock
//! manager requires to avoid deadlock, and to let the cache answer
//! "is X locked" for callers that only have the cache in hand.

use std::collections::BTreeSet;

use log::error;

/// The name reserved for the lock that serializes global (not per-VG)
/// cache state, such as the PV-id index itself. Sorts before every real VG
/// name so it is always safe to take first.
pub const VG_GLOBAL: &str = "#global";

/// The name under which all orphan VGs (of every format) are locked as one
/// unit. Sorts after every real VG name.
pub const VG_ORPHANS: &str = "#orphans";

fn is_orphan_alias(name: &str) -> bool {
    name.starts_with("#orphans")
}

/// Resolve a query name to the key it is actually tracked under: any
/// orphan-VG pseudo-name (`#orphans`, `#orphans_lvm2`, ...) aliases to the
/// single [`VG_ORPHANS`] key.
fn canonical<'a>(name: &'a str) -> &'a str {
    if is_orphan_alias(name) {
        VG_ORPHANS
    } else {
        name
    }
}

/// Returns whether lock name `a` is required to be taken before lock name
/// `b`. `VG_GLOBAL` always precedes everything else; `VG_ORPHANS` always
/// follows everything else; real VG names sort alphabetically between the
/// two.
pub fn precedes(a: &str, b: &str) -> bool {
    rank(a) < rank(b) || (rank(a) == rank(b) && a < b)
}

fn rank(name: &str) -> u8 {
    match canonical(name) {
        VG_GLOBAL => 0,
        VG_ORPHANS => 2,
        _ => 1,
    }
}

#[derive(Debug)]
pub struct LockRegistry {
    held: BTreeSet<String>,
    /// The order locks were actually taken in, used by `verify_order`.
    order: Vec<String>,
    /// Set if `destroy` is called while `VG_GLOBAL` is still held, so the
    /// next `init` knows to silently re-take it rather than treating it as
    /// a leaked lock.
    global_carryover: bool,
    /// Bumped by every `unlock` of a non-global name, invalidating cached
    /// device sizes elsewhere. Nested locking of the same name is a fatal
    /// programming error, so a name is never held more than once at a
    /// time — "when the count drops to zero" and "unconditionally on
    /// unlock" coincide here.
    device_size_seqno: u64,
    /// Whether `verify_order` actually checks anything. A caller that
    /// deliberately needs to take locks out of order can suppress the
    /// check rather than have every call flag it.
    ordering_enabled: bool,
}

impl Default for LockRegistry {
    fn default() -> LockRegistry {
        LockRegistry {
            held: BTreeSet::new(),
            order: Vec::new(),
            global_carryover: false,
            device_size_seqno: 0,
            ordering_enabled: true,
        }
    }
}

impl LockRegistry {
    pub fn new() -> LockRegistry {
        LockRegistry::default()
    }

    /// Lock `name`. Locking a name that is already held by this process is
    /// a fatal programming error (nested locking of the same VG is never
    /// valid) and is logged rather than silently ignored or queued.
    pub fn lock(&mut self, name: &str) {
        let key = canonical(name).to_string();
        if self.held.contains(&key) {
            error!("programming error: {} locked while already held", key);
            return;
        }
        self.held.insert(key.clone());
        self.order.push(key);
    }

    /// Unlock `name`. Unlocking a name that was not held is a programming
    /// error, logged and otherwise ignored. For any non-global name this
    /// bumps the device-size seqno, invalidating cached device sizes
    /// elsewhere.
    pub fn unlock(&mut self, name: &str) {
        let key = canonical(name);
        if !self.held.remove(key) {
            error!("programming error: unlock of {} which was not held", key);
            return;
        }
        self.order.retain(|k| k != key);
        if key != VG_GLOBAL {
            self.device_size_seqno += 1;
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held.contains(canonical(name))
    }

    /// Monotonic counter bumped by every `unlock` of a non-global name.
    pub fn device_size_seqno(&self) -> u64 {
        self.device_size_seqno
    }

    /// Suppress (or re-enable) `verify_order`'s check. While suppressed,
    /// `verify_order` reports no violation regardless of acquisition order.
    pub fn set_ordering_enabled(&mut self, enabled: bool) {
        self.ordering_enabled = enabled;
    }

    /// The number of distinct names currently locked (`VG_GLOBAL` counts
    /// too).
    pub fn vgs_locked(&self) -> usize {
        self.held.len()
    }

    /// Checks that the order locks were actually acquired in
    /// (`self.order`) is alphabetical by [`precedes`]. Returns the first
    /// out-of-order pair, if any. Always reports no violation while
    /// ordering is suppressed via `set_ordering_enabled(false)`.
    pub fn verify_order(&self) -> Option<(String, String)> {
        if !self.ordering_enabled {
            return None;
        }
        for w in self.order.windows(2) {
            if !precedes(&w[0], &w[1]) && w[0] != w[1] {
                return Some((w[0].clone(), w[1].clone()));
            }
        }
        None
    }

    /// Tear down the registry. Any remaining non-global lock is a leak and
    /// is logged as a programming error; a remaining `VG_GLOBAL` is not an
    /// error — it is expected across a `destroy`/`init` pair on the
    /// cluster daemon's resume path — and is recorded so the next `init`
    /// can silently re-lock it.
    pub fn destroy(&mut self) -> Vec<String> {
        let mut leaked = Vec::new();
        self.global_carryover = false;

        for name in self.held.drain() {
            if name == VG_GLOBAL {
                self.global_carryover = true;
            } else {
                error!("programming error: {} still locked at destroy", name);
                leaked.push(name);
            }
        }
        self.order.clear();

        leaked
    }

    /// Whether the last `destroy` left `VG_GLOBAL` implicitly held, so
    /// `init` should re-lock it rather than start unlocked.
    pub fn needs_global_relock(&self) -> bool {
        self.global_carryover
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_precedes_everything_and_orphans_follow() {
        assert!(precedes(VG_GLOBAL, "myvg"));
        assert!(precedes("myvg", VG_ORPHANS));
        assert!(precedes(VG_GLOBAL, VG_ORPHANS));
        assert!(!precedes(VG_ORPHANS, "myvg"));
    }

    #[test]
    fn lock_unlock_round_trip() {
        let mut locks = LockRegistry::new();
        locks.lock("myvg");
        assert!(locks.is_locked("myvg"));
        assert_eq!(locks.vgs_locked(), 1);

        locks.unlock("myvg");
        assert!(!locks.is_locked("myvg"));
        assert_eq!(locks.vgs_locked(), 0);
    }

    #[test]
    fn orphan_pattern_names_alias_to_reserved_key() {
        let mut locks = LockRegistry::new();
        locks.lock(VG_ORPHANS);
        assert!(locks.is_locked("#orphans_vg_xyz"));
    }

    #[test]
    fn destroy_carries_global_forward_but_flags_other_leaks() {
        let mut locks = LockRegistry::new();
        locks.lock(VG_GLOBAL);
        locks.lock("myvg");

        let leaked = locks.destroy();
        assert_eq!(leaked, vec!["myvg".to_string()]);
        assert!(locks.needs_global_relock());
    }

    #[test]
    fn unlocking_a_non_global_name_bumps_the_device_size_seqno() {
        let mut locks = LockRegistry::new();
        assert_eq!(locks.device_size_seqno(), 0);

        locks.lock("myvg");
        locks.unlock("myvg");
        assert_eq!(locks.device_size_seqno(), 1);

        locks.lock(VG_GLOBAL);
        locks.unlock(VG_GLOBAL);
        assert_eq!(locks.device_size_seqno(), 1);
    }

    #[test]
    fn suppressed_ordering_never_reports_a_violation() {
        let mut locks = LockRegistry::new();
        locks.lock("b");
        locks.lock("a");
        assert_eq!(
            locks.verify_order(),
            Some(("b".to_string(), "a".to_string()))
        );

        locks.unlock("a");
        locks.unlock("b");
        locks.set_ordering_enabled(false);
        locks.lock("b");
        locks.lock("a");
        assert_eq!(locks.verify_order(), None);
    }
}
