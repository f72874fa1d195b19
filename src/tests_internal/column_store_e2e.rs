use crate::{
    error::ErrorKind,
    test_util::{CoFixture, MemBlockRefManager},
};

#[test]
fn random_layouts_map_every_column_group() {
    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..32 {
        let column_group_cnt = rng.u32(2..12);
        let fixture = CoFixture::rowkey_base(column_group_cnt);
        let co = &fixture.co;
        assert_eq!(co.column_group_cnt(), column_group_cnt);

        for cg_idx in 0..column_group_cnt {
            let table = co.get_column_group(cg_idx).unwrap();
            assert_eq!(u32::from(table.key().column_group_idx), cg_idx);
        }
        assert_eq!(
            co.get_column_group(column_group_cnt).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        let beyond = rng.u32(column_group_cnt..u32::MAX);
        assert_eq!(
            co.get_column_group(beyond).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let order: Vec<_> = co
            .get_all_tables()
            .unwrap()
            .iter()
            .map(|table| u32::from(table.key().column_group_idx))
            .collect();
        assert_eq!(order, (0..column_group_cnt).collect::<Vec<_>>());

        let manager = MemBlockRefManager::default();
        co.inc_macro_ref(&manager).unwrap();
        assert_eq!(manager.total_refs(), fixture.macro_block_cnt());
        co.dec_macro_ref(&manager);
        assert_eq!(manager.total_refs(), 0);
    }
}
