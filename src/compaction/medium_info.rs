//! Medium compaction records replicated through the commit log.

use std::ops::Range;

use bytes::{Buf, BufMut};

use crate::{
    compaction::services::Scn,
    error::{StorageError, StorageResult},
    serdes::{CodecError, Decode, Encode},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompactionType {
    #[default]
    Medium = 0,
    Major = 1,
}

/// Why a medium compaction was proposed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MergeReason {
    #[default]
    None = 0,
    /// Tenant wide major freeze.
    TenantMajor = 1,
    UserRequest = 2,
    RebuildColumnGroup = 3,
    /// Bulk load doubled the tablet.
    LoadData = 4,
    /// Deleted and overwritten rows piled up.
    Tombstone = 5,
    /// Minor sstables piled up under a steady write load.
    FrequentWrite = 6,
}

impl MergeReason {
    /// Reasons that always pick the major snapshot strategy.
    pub fn is_user_request(self) -> bool {
        matches!(self, Self::UserRequest | Self::RebuildColumnGroup)
    }

    pub fn is_adaptive(self) -> bool {
        matches!(self, Self::LoadData | Self::Tombstone | Self::FrequentWrite)
    }

    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::TenantMajor,
            2 => Self::UserRequest,
            3 => Self::RebuildColumnGroup,
            4 => Self::LoadData,
            5 => Self::Tombstone,
            6 => Self::FrequentWrite,
            _ => return None,
        })
    }
}

/// One medium or major compaction every replica of a tablet executes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediumCompactionInfo {
    pub medium_snapshot: Scn,
    pub compaction_type: CompactionType,
    pub merge_reason: MergeReason,
    pub schema_version: i64,
    pub column_group_cnt: u32,
    /// Schema changed since the last major.
    pub is_schema_changed: bool,
    /// Row ranges merged in parallel, empty for a serial merge.
    pub parallel_ranges: Vec<Range<u64>>,
}

impl MediumCompactionInfo {
    pub fn is_major(&self) -> bool {
        self.compaction_type == CompactionType::Major
    }
}

impl Encode for MediumCompactionInfo {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.medium_snapshot.encode(buf);
        (self.compaction_type as u8).encode(buf);
        (self.merge_reason as u8).encode(buf);
        self.schema_version.encode(buf);
        self.column_group_cnt.encode(buf);
        self.is_schema_changed.encode(buf);
        (self.parallel_ranges.len() as u32).encode(buf);
        for range in &self.parallel_ranges {
            range.start.encode(buf);
            range.end.encode(buf);
        }
    }

    fn size(&self) -> usize {
        8 + 1 + 1 + 8 + 4 + 1 + 4 + 16 * self.parallel_ranges.len()
    }
}

impl Decode for MediumCompactionInfo {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let medium_snapshot = i64::decode(buf)?;
        let compaction_type = match u8::decode(buf)? {
            0 => CompactionType::Medium,
            1 => CompactionType::Major,
            tag => {
                return Err(CodecError::InvalidTag {
                    what: "compaction type",
                    tag: i64::from(tag),
                })
            }
        };
        let raw_reason = u8::decode(buf)?;
        let merge_reason = MergeReason::from_raw(raw_reason).ok_or(CodecError::InvalidTag {
            what: "merge reason",
            tag: i64::from(raw_reason),
        })?;
        let schema_version = i64::decode(buf)?;
        let column_group_cnt = u32::decode(buf)?;
        let is_schema_changed = bool::decode(buf)?;
        let range_cnt = u32::decode(buf)? as usize;
        let mut parallel_ranges = Vec::with_capacity(range_cnt.min(buf.remaining() / 16));
        for _ in 0..range_cnt {
            let start = u64::decode(buf)?;
            let end = u64::decode(buf)?;
            parallel_ranges.push(start..end);
        }
        Ok(Self {
            medium_snapshot,
            compaction_type,
            merge_reason,
            schema_version,
            column_group_cnt,
            is_schema_changed,
            parallel_ranges,
        })
    }
}

/// Synced medium infos of a tablet, snapshots strictly increasing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediumCompactionInfoList {
    infos: Vec<MediumCompactionInfo>,
}

impl MediumCompactionInfoList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an info whose snapshot is above every recorded one.
    pub fn add(&mut self, info: MediumCompactionInfo) -> StorageResult<()> {
        if let Some(last) = self.infos.last() {
            if info.medium_snapshot <= last.medium_snapshot {
                return Err(StorageError::invalid(format!(
                    "medium snapshot {} not above last {}",
                    info.medium_snapshot, last.medium_snapshot
                )));
            }
        }
        self.infos.push(info);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediumCompactionInfo> {
        self.infos.iter()
    }

    pub fn last(&self) -> Option<&MediumCompactionInfo> {
        self.infos.last()
    }

    /// Largest recorded snapshot, 0 when empty.
    pub fn max_medium_snapshot(&self) -> Scn {
        self.infos.last().map_or(0, |info| info.medium_snapshot)
    }

    /// Oldest info not yet covered by `last_major_snapshot`.
    pub fn first_unfinished(&self, last_major_snapshot: Scn) -> Option<&MediumCompactionInfo> {
        self.infos
            .iter()
            .find(|info| info.medium_snapshot > last_major_snapshot)
    }

    /// Drop infos already covered by `last_major_snapshot`.
    pub fn gc(&mut self, last_major_snapshot: Scn) -> usize {
        let before = self.infos.len();
        self.infos
            .retain(|info| info.medium_snapshot > last_major_snapshot);
        before - self.infos.len()
    }
}

impl Encode for MediumCompactionInfoList {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.infos.encode(buf);
    }

    fn size(&self) -> usize {
        self.infos.size()
    }
}

impl Decode for MediumCompactionInfoList {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let infos = Vec::<MediumCompactionInfo>::decode(buf)?;
        let increasing = infos
            .windows(2)
            .all(|pair| pair[0].medium_snapshot < pair[1].medium_snapshot);
        if !increasing {
            return Err(CodecError::InvalidTag {
                what: "medium list order",
                tag: infos.len() as i64,
            });
        }
        Ok(Self { infos })
    }
}
