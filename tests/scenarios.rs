// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end scenarios exercising [`lvmcache::Cache`] the way a command
//! layer would: through a sequence of scans, lock calls, and saved-VG
//! snapshots, rather than one method at a time.

use devicemapper::Device;

use lvmcache::duplicates::DuplicateCandidateFacts;
use lvmcache::lock::VG_ORPHANS;
use lvmcache::registry::Cache;
use lvmcache::update::VgSummary;
use lvmcache::vg::{VgId, Witness};

fn witnessed_summary(name: &str, id: VgId, seqno: u64, mda_checksum: u32) -> VgSummary {
    VgSummary {
        name: name.to_string(),
        id,
        format: "lvm2".to_string(),
        status: vec!["READ".to_string(), "WRITE".to_string()],
        lock_type: String::new(),
        system_id: String::new(),
        creation_host: String::new(),
        exported: false,
        witness: Some(Witness {
            seqno,
            mda_size: 4096,
            mda_checksum,
        }),
        has_mda: true,
    }
}

#[test]
fn scenario_1_simple_add() {
    let mut cache = Cache::new();
    cache.init(false, "host1");

    let pvid = lvmcache::pv::PvId::new();
    let dev_a = Device::from(0x0800u64);
    let pv = cache.add(pvid, dev_a, 1024, "lvm2").unwrap();

    let vgid = VgId::new();
    cache.update(pv, witnessed_summary("vg0", vgid, 1, 0xAAAA)).unwrap();

    let info = cache.get_info_by_pvid(pvid).unwrap();
    assert_eq!(info.device, dev_a);

    let vginfo = cache.get_vginfo_by_name("vg0").unwrap();
    assert_eq!(vginfo.name, "vg0");
    assert_eq!(cache.vg_names(), vec!["vg0".to_string()]);
}

#[test]
fn scenario_2_duplicate_detection_and_resolve() {
    let mut cache = Cache::new();
    cache.init(false, "host1");

    let pvid = lvmcache::pv::PvId::new();
    let dev_a = Device::from(0x0800u64);
    let dev_b = Device::from(0x0810u64);

    let pv = cache.add(pvid, dev_a, 1024, "lvm2").unwrap();
    let vgid = VgId::new();
    cache.update(pv, witnessed_summary("vg0", vgid, 1, 0xAAAA)).unwrap();

    // devB claims the same PV id as devA: `add` refuses to replace the
    // existing mapping and routes it through the duplicate resolver instead.
    let second = cache.add(pvid, dev_b, 1024, "lvm2");
    assert!(second.is_none());
    assert!(cache.vg_has_duplicate_pvs(cache.get_vginfo_by_name("vg0").unwrap()));

    // Tell the resolver devB is the one actually backing a live LV.
    cache.record_duplicate_candidate(DuplicateCandidateFacts {
        pvid,
        device: dev_a,
        sticky_unpreferred: false,
        is_in_use_by_lv: false,
        size_is_correct: true,
        has_mounted_filesystem: false,
        is_dm_major: false,
        is_subsystem_member: false,
        is_md_component: false,
        first_seen_order: 0,
    });
    cache.record_duplicate_candidate(DuplicateCandidateFacts {
        pvid,
        device: dev_b,
        sticky_unpreferred: false,
        is_in_use_by_lv: true,
        size_is_correct: true,
        has_mounted_filesystem: false,
        is_dm_major: false,
        is_subsystem_member: false,
        is_md_component: false,
        first_seen_order: 0,
    });

    let (del_out, add_out) = cache.resolve_duplicates();
    assert_eq!(del_out, vec![dev_a]);
    assert_eq!(add_out, vec![dev_b]);

    // A command layer processing the resolution result detaches the loser
    // and re-adds the winner under the same pvid.
    cache.del_dev(dev_a);
    let pv2 = cache.add(pvid, dev_b, 1024, "lvm2").unwrap();
    cache.update(pv2, witnessed_summary("vg0", vgid, 1, 0xAAAA)).unwrap();

    assert_eq!(cache.get_info_by_pvid(pvid).unwrap().device, dev_b);
    let unused: Vec<Device> = cache.unused_duplicates().into_iter().map(|f| f.device).collect();
    assert_eq!(unused, vec![dev_a]);
}

#[test]
fn scenario_3_witness_mismatch_never_evicts() {
    let mut cache = Cache::new();
    cache.init(false, "host1");

    let vgid = VgId::new();
    let pvid1 = lvmcache::pv::PvId::new();
    let pvid2 = lvmcache::pv::PvId::new();

    let pv1 = cache.add(pvid1, Device::from(0x0800u64), 1024, "lvm2").unwrap();
    let pv2 = cache.add(pvid2, Device::from(0x0810u64), 1024, "lvm2").unwrap();

    cache.update(pv1, witnessed_summary("vg0", vgid, 5, 0xAAAA)).unwrap();
    cache.update(pv2, witnessed_summary("vg0", vgid, 6, 0xAAAA)).unwrap();

    assert!(cache.scan_mismatch(vgid));
    let vginfo = cache.get_vginfo_by_vgid(vgid).unwrap();
    assert_eq!(vginfo.pvs.len(), 2);
    assert_eq!(vginfo.witness.unwrap().seqno, 5);
}

#[test]
fn scenario_4_lock_ordering_rejects_reversed_acquisition() {
    let mut cache = Cache::new();
    cache.init(false, "host1");

    cache.lock("a");
    cache.lock("b");
    cache.unlock("a");
    cache.unlock("b");

    cache.lock("b");
    cache.lock("a");

    // Both locks succeed — the registry logs a programming error rather
    // than refusing — but the order they were actually taken in violates
    // `a` preceding `b`, and `verify_lock_order` catches it.
    assert_eq!(
        cache.verify_lock_order(),
        Some(("b".to_string(), "a".to_string()))
    );
}

#[test]
fn scenario_5_saved_vg_resume_path() {
    let mut cache = Cache::new();
    cache.init(true, "host1");

    let vgid = VgId::new();
    let mut v_old = lvmcache::vg::empty("vg0");
    v_old.id = vgid.to_string();
    v_old.seqno = 1;

    let mut v_new = lvmcache::vg::empty("vg0");
    v_new.id = vgid.to_string();
    v_new.seqno = 2;

    let pvid = lvmcache::pv::PvId::new();
    let pv = cache.add(pvid, Device::from(0x0800u64), 1024, "lvm2").unwrap();
    cache.update(pv, witnessed_summary("vg0", vgid, 2, 0xAAAA)).unwrap();

    cache.save_vg(vgid, &v_old, false).unwrap();
    cache.save_vg(vgid, &v_new, true).unwrap();
    cache.commit_vg("vg0").unwrap();

    assert_eq!(cache.get_latest_vg(vgid).unwrap().seqno, 2);
    // `get_latest_vg` just eagerly invalidated the now-stale `old`, so the
    // committed-side lookup falls back to `new` too.
    assert_eq!(cache.get_vg(vgid, false).unwrap().seqno, 2);

    let deferred = cache.take_deferred_free();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].seqno, 1);
}

#[test]
fn scenario_6_orphan_lock_alias() {
    let mut cache = Cache::new();
    cache.init(false, "host1");

    cache.lock(VG_ORPHANS);
    assert!(cache.is_locked("#orphans_vg_xyz"));
}

#[test]
fn independent_metadata_location_vgs_are_skipped_on_rescan() {
    let mut cache = Cache::new();
    cache.init(false, "host1");

    let vgid = VgId::new();
    let pv = lvmcache::vg::VG {
        name: "vg0".to_string(),
        id: vgid.to_string(),
        seqno: 1,
        format: "lvm2".to_string(),
        status: Vec::new(),
        flags: Vec::new(),
        extent_size: 8192,
        max_lv: 0,
        max_pv: 0,
        metadata_copies: 0,
        pvs: Default::default(),
        lvs: Default::default(),
    };
    cache.seed_from_metadata_daemon(vec![pv]).unwrap();

    let vginfo = cache.get_vginfo_by_name("vg0").unwrap();
    assert!(vginfo.independent_metadata_location);
    assert!(!cache.should_rescan(vginfo));
}

#[test]
fn destroy_then_init_carries_global_lock_forward() {
    let mut cache = Cache::new();
    cache.init(false, "host1");
    cache.lock(lvmcache::lock::VG_GLOBAL);

    let report = cache.destroy();
    assert!(report.locked_vgs.is_empty());

    cache.init(false, "host1");
    assert!(cache.is_locked(lvmcache::lock::VG_GLOBAL));
}

#[test]
fn unlocking_a_vg_bumps_the_device_size_seqno_but_global_does_not() {
    let mut cache = Cache::new();
    cache.init(false, "host1");

    cache.lock("vg0");
    cache.unlock("vg0");
    assert_eq!(cache.device_size_seqno(), 1);

    cache.lock(lvmcache::lock::VG_GLOBAL);
    cache.unlock(lvmcache::lock::VG_GLOBAL);
    assert_eq!(cache.device_size_seqno(), 1);
}

#[test]
fn suppressed_lock_ordering_accepts_a_reversed_acquisition() {
    let mut cache = Cache::new();
    cache.init(false, "host1");
    cache.set_ordering_enabled(false);

    cache.lock("b");
    cache.lock("a");
    assert_eq!(cache.verify_lock_order(), None);
}

#[test]
fn drop_vg_by_name_treats_orphan_alias_as_both_regardless_of_flag() {
    let mut cache = Cache::new();
    cache.init(true, "host1");

    cache.add_orphan_vginfo("lvm2");
    let vgid = cache.vgid_from_vgname("#orphans_lvm2").unwrap();

    let mut v_old = lvmcache::vg::empty("#orphans_lvm2");
    v_old.id = vgid.to_string();
    v_old.seqno = 1;
    let mut v_new = lvmcache::vg::empty("#orphans_lvm2");
    v_new.id = vgid.to_string();
    v_new.seqno = 2;

    cache.save_vg(vgid, &v_old, false).unwrap();
    cache.save_vg(vgid, &v_new, true).unwrap();

    // `drop_precommitted: true` would normally free only `new`; the orphan
    // pseudo-name forces "both" regardless.
    cache.drop_vg("#orphans_lvm2", true).unwrap();
    assert!(cache.get_vg(vgid, true).is_none());
    assert_eq!(cache.take_deferred_free().len(), 2);
}
