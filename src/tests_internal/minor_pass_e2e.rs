use std::time::Duration;

use crate::{
    compaction::{
        now_us,
        services::{MemtableStats, MergeType},
        TenantTabletScheduler,
    },
    id::TabletLsPair,
    option::SchedulerConfig,
    test_util::{tablet_status, FakeServices, LS_1, TABLET_1, TABLET_2, TABLET_3},
};

fn scheduler(fake: &FakeServices, config: SchedulerConfig) -> TenantTabletScheduler {
    let scheduler = TenantTabletScheduler::new(1002, config, fake.services());
    scheduler.init().expect("init");
    scheduler
}

fn tombstone_heavy_memtable() -> MemtableStats {
    MemtableStats {
        is_active: true,
        create_time_us: now_us() - Duration::from_secs(600).as_micros() as i64,
        delete_row_count: 300_000,
        rec_scn: Some(10),
        ..Default::default()
    }
}

#[test]
fn minor_pass_freezes_and_queues_minor_merges() {
    let fake = FakeServices::default();
    fake.storage.add_leader_ls(LS_1, 500);
    let mut heavy = tablet_status(TABLET_1, 1);
    heavy.memtable = Some(tombstone_heavy_memtable());
    heavy.minor_sstable_cnt = 3;
    fake.storage.put_tablet(heavy);
    let mut quiet = tablet_status(TABLET_2, 1);
    quiet.memtable = Some(MemtableStats {
        is_active: true,
        create_time_us: now_us(),
        ..Default::default()
    });
    fake.storage.put_tablet(quiet);

    let scheduler = scheduler(&fake, SchedulerConfig::default());
    scheduler.schedule_all_tablets_minor().unwrap();

    assert_eq!(fake.freezes(), vec![TabletLsPair::new(LS_1, TABLET_1)]);
    let dags = fake.dags();
    assert_eq!(dags.len(), 1);
    assert_eq!(dags[0].tablet_id, TABLET_1);
    assert_eq!(dags[0].merge_type, MergeType::Minor);

    scheduler.reload_config(SchedulerConfig::default().enable_fast_freeze(false));
    scheduler.schedule_all_tablets_minor().unwrap();
    assert_eq!(fake.freezes().len(), 1);
}

#[test]
fn minor_pass_resumes_across_batches() {
    let fake = FakeServices::default();
    fake.storage.add_leader_ls(LS_1, 500);
    for tablet_id in [TABLET_1, TABLET_2, TABLET_3] {
        let mut tablet = tablet_status(tablet_id, 1);
        tablet.minor_sstable_cnt = 2;
        fake.storage.put_tablet(tablet);
    }
    let scheduler = scheduler(&fake, SchedulerConfig::default().tablet_batch_size(2));

    scheduler.schedule_all_tablets_minor().unwrap();
    assert_eq!(fake.dags().len(), 2);
    scheduler.schedule_all_tablets_minor().unwrap();
    let visited: Vec<_> = fake.dags().iter().map(|dag| dag.tablet_id).collect();
    assert_eq!(visited, vec![TABLET_1, TABLET_2, TABLET_3]);
}

#[test]
fn failing_tablet_does_not_abort_the_round() {
    let fake = FakeServices::default();
    fake.set_sync_clog(true);
    fake.storage.add_leader_ls(LS_1, 500);
    for tablet_id in [TABLET_1, TABLET_2, TABLET_3] {
        fake.storage.put_tablet(tablet_status(tablet_id, 1));
    }
    fake.storage.fail_tablet(LS_1, TABLET_2);
    let scheduler = scheduler(&fake, SchedulerConfig::default());
    scheduler.schedule_merge(300).unwrap();

    scheduler.schedule_round().unwrap();
    // one failure in the minor pass, one in the medium pass
    assert_eq!(scheduler.error_tablet_cnt(), 2);
    let proposed: Vec<_> = fake.clogs().iter().map(|(pair, _)| pair.tablet_id).collect();
    assert_eq!(proposed, vec![TABLET_1, TABLET_3]);

    scheduler.update_upper_trans_version_and_gc_sstable().unwrap();
    assert_eq!(
        fake.storage.gc_calls(),
        vec![
            TabletLsPair::new(LS_1, TABLET_1),
            TabletLsPair::new(LS_1, TABLET_3)
        ]
    );
    assert_eq!(scheduler.error_tablet_cnt(), 3);
}
