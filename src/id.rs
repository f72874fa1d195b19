//! Identifiers shared by tables and the scheduler.

use std::fmt;

macro_rules! raw_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw identifier.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Access the raw identifier value.
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}

raw_id!(
    /// Identity of a replicated log stream within a tenant.
    LsId,
    "ls"
);
raw_id!(
    /// Identity of a tablet.
    TabletId,
    "tablet"
);
raw_id!(
    /// Identity of a physical macro block, the unit of reference-counted lifetime.
    MacroBlockId,
    "macro"
);

/// Column identifier. Rowkey columns occupy ids `0..rowkey_cnt`.
pub type ColumnId = u32;

/// Row position inside a physical table.
pub type RowId = u64;

/// Kind of physical table a [`TableKey`] names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TableType {
    /// Row-store major table.
    Major = 0,
    /// Minor table produced by a mini/minor merge.
    Minor = 1,
    /// Composite column-oriented major table.
    CoMajor = 2,
    /// Column group sub-table holding a subset of columns.
    NormalCg = 3,
    /// Column group sub-table holding only rowkey columns.
    RowkeyCg = 4,
}

impl TableType {
    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Major),
            1 => Some(Self::Minor),
            2 => Some(Self::CoMajor),
            3 => Some(Self::NormalCg),
            4 => Some(Self::RowkeyCg),
            _ => None,
        }
    }
}

/// Identity of a physical, versioned table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableKey {
    /// Owning tablet.
    pub tablet_id: TabletId,
    /// Physical table kind.
    pub table_type: TableType,
    /// Logical column group index the table occupies.
    pub column_group_idx: u16,
    /// Snapshot version the table was merged at.
    pub snapshot_version: i64,
}

impl TableKey {
    /// Build a key.
    pub fn new(
        tablet_id: TabletId,
        table_type: TableType,
        column_group_idx: u16,
        snapshot_version: i64,
    ) -> Self {
        Self {
            tablet_id,
            table_type,
            column_group_idx,
            snapshot_version,
        }
    }

    /// Column group index as the wider type used for lookups.
    pub fn column_group_id(&self) -> u32 {
        u32::from(self.column_group_idx)
    }

    /// Whether this key names a rowkey-only column group.
    pub fn is_rowkey_cg(&self) -> bool {
        self.table_type == TableType::RowkeyCg
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:?}/cg{}@{}",
            self.tablet_id, self.table_type, self.column_group_idx, self.snapshot_version
        )
    }
}

/// A tablet paired with the log stream that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabletLsPair {
    /// Owning log stream.
    pub ls_id: LsId,
    /// Tablet.
    pub tablet_id: TabletId,
}

impl TabletLsPair {
    /// Build a pair.
    pub fn new(ls_id: LsId, tablet_id: TabletId) -> Self {
        Self { ls_id, tablet_id }
    }
}
