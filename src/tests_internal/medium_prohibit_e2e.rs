use std::{sync::Arc, thread};

use crate::{
    compaction::{
        services::{LsInfo, MergeDagParam, MergeType},
        CompactionType, ProhibitFlag, TenantTabletScheduler,
    },
    error::ErrorKind,
    option::SchedulerConfig,
    test_util::{medium_info, tablet_status, FakeServices, LS_1, LS_2, TABLET_1, TABLET_2},
};

fn scheduler(fake: &FakeServices) -> Arc<TenantTabletScheduler> {
    let scheduler = TenantTabletScheduler::new(1002, SchedulerConfig::default(), fake.services());
    scheduler.init().expect("init");
    Arc::new(scheduler)
}

#[test]
fn transfer_blocks_periodic_proposals() {
    let fake = FakeServices::default();
    fake.set_sync_clog(true);
    fake.storage.add_leader_ls(LS_1, 500);
    fake.storage.put_tablet(tablet_status(TABLET_1, 1));
    let scheduler = scheduler(&fake);
    scheduler.schedule_merge(300).unwrap();

    scheduler.stop_ls_schedule_medium(LS_1).unwrap();
    scheduler.schedule_round().unwrap();
    assert!(fake.clogs().is_empty());
    assert_eq!(scheduler.prohibit_medium_map().transfer_flag_cnt(), 1);

    scheduler
        .clear_prohibit_medium_flag(LS_1, ProhibitFlag::Transfer)
        .unwrap();
    assert_eq!(
        scheduler
            .clear_prohibit_medium_flag(LS_1, ProhibitFlag::Transfer)
            .unwrap_err()
            .kind(),
        ErrorKind::StateMismatch
    );
    scheduler.schedule_round().unwrap();
    assert_eq!(fake.clogs().len(), 1);
    assert!(scheduler.prohibit_medium_map().is_empty());
}

#[test]
fn concurrent_requests_respect_transfer() {
    let fake = FakeServices::default();
    fake.storage.add_leader_ls(LS_1, 500);
    fake.storage.put_tablet(tablet_status(TABLET_1, 100));
    let scheduler = scheduler(&fake);

    scheduler.stop_ls_schedule_medium(LS_1).unwrap();
    thread::scope(|scope| {
        for _ in 0..4 {
            let scheduler = Arc::clone(&scheduler);
            scope.spawn(move || {
                scheduler
                    .try_schedule_tablet_medium_merge(LS_1, TABLET_1, false)
                    .unwrap();
            });
        }
    });
    assert!(fake.clogs().is_empty());
    assert_eq!(
        scheduler.prohibit_medium_map().get(LS_1).map(|status| status.flag),
        Some(ProhibitFlag::Transfer)
    );

    scheduler
        .clear_prohibit_medium_flag(LS_1, ProhibitFlag::Transfer)
        .unwrap();
    thread::scope(|scope| {
        for _ in 0..4 {
            let scheduler = Arc::clone(&scheduler);
            scope.spawn(move || {
                scheduler
                    .try_schedule_tablet_medium_merge(LS_1, TABLET_1, false)
                    .unwrap();
            });
        }
    });
    // medium holders share the flag, only one proposal goes out
    let clogs = fake.clogs();
    assert_eq!(clogs.len(), 1);
    assert_eq!(clogs[0].1.medium_snapshot, 500);
    assert_eq!(scheduler.pending_medium_proposals().len(), 1);
    assert!(scheduler.prohibit_medium_map().is_empty());
}

#[test]
fn repeated_requests_wait_for_the_log_to_sync() {
    let fake = FakeServices::default();
    fake.storage.add_leader_ls(LS_1, 500);
    fake.storage.put_tablet(tablet_status(TABLET_1, 100));
    let scheduler = scheduler(&fake);

    scheduler
        .try_schedule_tablet_medium_merge(LS_1, TABLET_1, false)
        .unwrap();
    scheduler
        .try_schedule_tablet_medium_merge(LS_1, TABLET_1, true)
        .unwrap();
    assert_eq!(fake.clogs().len(), 1);

    // the log applies the proposal and the merge finishes
    let (_, info) = fake.clogs()[0].clone();
    fake.storage
        .update_tablet(LS_1, TABLET_1, |tablet| {
            tablet.medium_list.add(info).unwrap();
            tablet.last_major_snapshot = 500;
        })
        .unwrap();
    fake.storage.update_ls(LS_1, |ls| ls.weak_read_ts = 700);
    scheduler
        .try_schedule_tablet_medium_merge(LS_1, TABLET_1, false)
        .unwrap();
    let snapshots: Vec<_> = fake
        .clogs()
        .iter()
        .map(|(_, info)| info.medium_snapshot)
        .collect();
    assert_eq!(snapshots, vec![500, 700]);
    assert_eq!(scheduler.pending_medium_proposals().len(), 1);
}

#[test]
fn losing_leadership_drops_unsynced_proposals() {
    let fake = FakeServices::default();
    fake.storage.add_leader_ls(LS_1, 500);
    fake.storage.put_tablet(tablet_status(TABLET_1, 100));
    let scheduler = scheduler(&fake);
    scheduler
        .try_schedule_tablet_medium_merge(LS_1, TABLET_1, false)
        .unwrap();
    assert_eq!(scheduler.pending_medium_proposals().len(), 1);

    fake.storage.update_ls(LS_1, |ls| ls.is_leader = false);
    scheduler.schedule_all_tablets_medium().unwrap();
    assert!(scheduler.pending_medium_proposals().is_empty());
}

#[test]
fn followers_merge_synced_infos_without_proposing() {
    let fake = FakeServices::default();
    fake.storage.add_ls(LsInfo {
        ls_id: LS_2,
        is_leader: false,
        weak_read_ts: 200,
        members: vec![1, 2, 3],
    });
    let mut tablet = tablet_status(TABLET_2, 50);
    tablet.ls_id = LS_2;
    tablet.tombstone_row_count = 300_000;
    tablet
        .medium_list
        .add(medium_info(100, CompactionType::Medium))
        .unwrap();
    fake.storage.put_tablet(tablet);
    let scheduler = scheduler(&fake);

    scheduler.schedule_all_tablets_medium().unwrap();
    assert!(fake.clogs().is_empty());
    assert_eq!(
        fake.dags(),
        vec![MergeDagParam {
            ls_id: LS_2,
            tablet_id: TABLET_2,
            merge_type: MergeType::Medium,
            merge_version: 100,
        }]
    );

    assert!(scheduler.try_schedule_tablet_medium_merge(LS_2, TABLET_2, false).is_ok());
    assert!(fake.clogs().is_empty());
}
