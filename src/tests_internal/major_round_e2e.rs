use crate::{
    compaction::{
        services::{MergeDagParam, MergeType, ReplicaStatus},
        CompactionType, MergeReason, TenantTabletScheduler,
    },
    id::TabletId,
    option::SchedulerConfig,
    test_util::{tablet_status, FakeServices, LS_1, TABLET_1, TABLET_2},
};

const FROZEN: i64 = 300;

fn setup(tablets: &[TabletId], weak_read_ts: i64) -> (FakeServices, TenantTabletScheduler) {
    let fake = FakeServices::default();
    fake.set_sync_clog(true);
    fake.storage.add_leader_ls(LS_1, weak_read_ts);
    for tablet_id in tablets {
        fake.storage.put_tablet(tablet_status(*tablet_id, 1));
    }
    let scheduler = TenantTabletScheduler::new(1002, SchedulerConfig::default(), fake.services());
    scheduler.init().expect("init");
    (fake, scheduler)
}

fn finish_major(fake: &FakeServices, tablet_id: TabletId, snapshot: i64) {
    fake.storage
        .update_tablet(LS_1, tablet_id, |tablet| tablet.last_major_snapshot = snapshot)
        .expect("tablet");
}

#[test]
fn major_round_advances_merged_version() {
    let (fake, scheduler) = setup(&[TABLET_1, TABLET_2], 500);
    scheduler.schedule_merge(FROZEN).unwrap();

    // the leader proposes the major on every tablet
    scheduler.schedule_round().unwrap();
    let clogs = fake.clogs();
    assert_eq!(clogs.len(), 2);
    for (_, info) in &clogs {
        assert_eq!(info.medium_snapshot, FROZEN);
        assert_eq!(info.compaction_type, CompactionType::Major);
        assert_eq!(info.merge_reason, MergeReason::TenantMajor);
    }
    assert!(fake.dags().is_empty());
    assert_eq!(scheduler.merged_version(), 1);

    // synced infos turn into major dags, nothing is proposed twice
    scheduler.schedule_round().unwrap();
    assert_eq!(fake.clogs().len(), 2);
    assert_eq!(
        fake.dags(),
        vec![
            MergeDagParam {
                ls_id: LS_1,
                tablet_id: TABLET_1,
                merge_type: MergeType::Major,
                merge_version: FROZEN,
            },
            MergeDagParam {
                ls_id: LS_1,
                tablet_id: TABLET_2,
                merge_type: MergeType::Major,
                merge_version: FROZEN,
            },
        ]
    );
    assert_eq!(scheduler.merged_version(), 1);

    finish_major(&fake, TABLET_1, FROZEN);
    scheduler.schedule_round().unwrap();
    assert_eq!(scheduler.merged_version(), 1);

    finish_major(&fake, TABLET_2, FROZEN);
    scheduler.schedule_round().unwrap();
    assert_eq!(scheduler.merged_version(), FROZEN);
    assert_eq!(scheduler.error_tablet_cnt(), 0);
}

#[test]
fn paused_major_proposes_nothing() {
    let (fake, scheduler) = setup(&[TABLET_1, TABLET_2], 500);
    scheduler.schedule_merge(FROZEN).unwrap();
    scheduler.stop_major_merge();

    scheduler.schedule_round().unwrap();
    scheduler.schedule_round().unwrap();
    assert!(fake.clogs().is_empty());
    assert_eq!(scheduler.merged_version(), 1);

    scheduler.resume_major_merge();
    scheduler.schedule_round().unwrap();
    assert_eq!(fake.clogs().len(), 2);
}

#[test]
fn major_waits_for_weak_read_ts() {
    let (fake, scheduler) = setup(&[TABLET_1], 200);
    scheduler.schedule_merge(FROZEN).unwrap();

    scheduler.schedule_round().unwrap();
    assert!(fake.clogs().is_empty());
    assert!(scheduler.stats().check_weak_read_ts_cnt >= 1);

    fake.storage
        .update_ls(LS_1, |ls| ls.weak_read_ts = 500);
    scheduler.schedule_round().unwrap();
    let clogs = fake.clogs();
    assert_eq!(clogs.len(), 1);
    assert_eq!(clogs[0].1.medium_snapshot, FROZEN);
}

#[test]
fn leader_waits_for_replicas_before_next_medium() {
    let (fake, scheduler) = setup(&[], 500);
    let mut tablet = tablet_status(TABLET_1, 100);
    tablet.tombstone_row_count = 300_000;
    tablet
        .medium_list
        .add(crate::test_util::medium_info(100, CompactionType::Medium))
        .unwrap();
    fake.storage.put_tablet(tablet);

    // replicas have not reported the previous round yet
    scheduler.schedule_round().unwrap();
    assert!(fake.clogs().is_empty());
    assert_eq!(fake.meta_table_queries(), 1);
    assert_eq!(scheduler.stats().wait_rs_validate_cnt, 1);

    fake.report_replicas(
        [1, 2, 3]
            .into_iter()
            .map(|server| ReplicaStatus {
                ls_id: LS_1,
                tablet_id: TABLET_1,
                server,
                compaction_scn: 100,
                data_checksum: 42,
            })
            .collect(),
    );
    scheduler.schedule_round().unwrap();
    let clogs = fake.clogs();
    assert_eq!(clogs.len(), 1);
    assert_eq!(clogs[0].1.merge_reason, MergeReason::Tombstone);
    assert_eq!(clogs[0].1.medium_snapshot, 500);
    assert_eq!(scheduler.stats().finish_cnt, 1);
}

#[test]
fn checksum_mismatch_counts_as_error_tablet() {
    let (fake, scheduler) = setup(&[], 500);
    let mut tablet = tablet_status(TABLET_1, 100);
    tablet.tombstone_row_count = 300_000;
    tablet
        .medium_list
        .add(crate::test_util::medium_info(100, CompactionType::Medium))
        .unwrap();
    fake.storage.put_tablet(tablet);
    fake.report_replicas(
        [(1, 42), (2, 42), (3, 43)]
            .into_iter()
            .map(|(server, data_checksum)| ReplicaStatus {
                ls_id: LS_1,
                tablet_id: TABLET_1,
                server,
                compaction_scn: 100,
                data_checksum,
            })
            .collect(),
    );

    scheduler.schedule_round().unwrap();
    assert!(fake.clogs().is_empty());
    assert_eq!(scheduler.error_tablet_cnt(), 1);
}
