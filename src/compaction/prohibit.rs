//! Per log stream flags that keep medium scheduling and transfer apart.

use std::{collections::HashMap, fmt};

use parking_lot::RwLock;

use crate::{
    error::{StorageError, StorageResult},
    id::LsId,
};

/// Who holds a log stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProhibitFlag {
    /// A tablet transfer is moving data out of the log stream.
    Transfer = 0,
    /// The scheduler is proposing medium compactions on the log stream.
    Medium = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProhibitMediumStatus {
    pub flag: ProhibitFlag,
    pub ref_cnt: u32,
}

#[derive(Debug, Default)]
struct ProhibitInner {
    entries: HashMap<LsId, ProhibitMediumStatus>,
    transfer_flag_cnt: u64,
}

/// Reference counted flag per log stream. A log stream is held by one kind
/// at a time.
#[derive(Debug, Default)]
pub struct ProhibitMediumMap {
    inner: RwLock<ProhibitInner>,
}

impl ProhibitMediumMap {
    /// Take a reference on `flag`. Fails with `Busy` while the other kind is held.
    pub fn add_flag(&self, ls_id: LsId, flag: ProhibitFlag) -> StorageResult<()> {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(&ls_id) {
            Some(status) if status.flag != flag => {
                return Err(StorageError::Busy(format!(
                    "{ls_id} is held by {:?}, cannot add {flag:?}",
                    status.flag
                )));
            }
            Some(status) => status.ref_cnt += 1,
            None => {
                inner
                    .entries
                    .insert(ls_id, ProhibitMediumStatus { flag, ref_cnt: 1 });
            }
        }
        if flag == ProhibitFlag::Transfer {
            inner.transfer_flag_cnt += 1;
        }
        Ok(())
    }

    /// Drop a reference on `flag`, removing the entry at zero.
    pub fn clear_flag(&self, ls_id: LsId, flag: ProhibitFlag) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let Some(status) = inner.entries.get_mut(&ls_id) else {
            return Err(StorageError::state(format!(
                "clear {flag:?} on {ls_id} which holds no flag"
            )));
        };
        if status.flag != flag {
            return Err(StorageError::state(format!(
                "clear {flag:?} on {ls_id} held by {:?}",
                status.flag
            )));
        }
        status.ref_cnt -= 1;
        if status.ref_cnt == 0 {
            inner.entries.remove(&ls_id);
        }
        if flag == ProhibitFlag::Transfer {
            inner.transfer_flag_cnt -= 1;
        }
        Ok(())
    }

    pub fn get(&self, ls_id: LsId) -> Option<ProhibitMediumStatus> {
        self.inner.read().entries.get(&ls_id).copied()
    }

    pub fn is_prohibited(&self, ls_id: LsId) -> bool {
        self.inner.read().entries.contains_key(&ls_id)
    }

    /// Outstanding transfer references across all log streams.
    pub fn transfer_flag_cnt(&self) -> u64 {
        self.inner.read().transfer_flag_cnt
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.transfer_flag_cnt = 0;
    }

    /// Hold the Medium flag for the guard's lifetime. `None` while a transfer
    /// holds the log stream.
    pub fn start_medium(&self, ls_id: LsId) -> StorageResult<Option<MediumScheduleGuard<'_>>> {
        match self.add_flag(ls_id, ProhibitFlag::Medium) {
            Ok(()) => Ok(Some(MediumScheduleGuard { map: self, ls_id })),
            Err(StorageError::Busy(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Display for ProhibitMediumMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.entries.iter().collect();
        entries.sort_by_key(|(ls_id, _)| **ls_id);
        write!(f, "transfer_flag_cnt={} {{", inner.transfer_flag_cnt)?;
        for (i, (ls_id, status)) in entries.into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ls_id}: {:?}*{}", status.flag, status.ref_cnt)?;
        }
        write!(f, "}}")
    }
}

/// Releases the Medium flag of one log stream on drop.
#[derive(Debug)]
pub struct MediumScheduleGuard<'a> {
    map: &'a ProhibitMediumMap,
    ls_id: LsId,
}

impl MediumScheduleGuard<'_> {
    pub fn ls_id(&self) -> LsId {
        self.ls_id
    }
}

impl Drop for MediumScheduleGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.map.clear_flag(self.ls_id, ProhibitFlag::Medium) {
            tracing::error!("release medium flag of {}: {err}", self.ls_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const LS: LsId = LsId::new(1001);

    #[test]
    fn ref_counted_same_kind() {
        let map = ProhibitMediumMap::default();
        map.add_flag(LS, ProhibitFlag::Transfer).unwrap();
        map.add_flag(LS, ProhibitFlag::Transfer).unwrap();
        assert_eq!(
            map.get(LS),
            Some(ProhibitMediumStatus {
                flag: ProhibitFlag::Transfer,
                ref_cnt: 2
            })
        );
        assert_eq!(map.transfer_flag_cnt(), 2);

        map.clear_flag(LS, ProhibitFlag::Transfer).unwrap();
        assert!(map.is_prohibited(LS));
        map.clear_flag(LS, ProhibitFlag::Transfer).unwrap();
        assert!(!map.is_prohibited(LS));
        assert_eq!(map.transfer_flag_cnt(), 0);
    }

    #[test]
    fn conflicting_kind_is_busy() {
        let map = ProhibitMediumMap::default();
        map.add_flag(LS, ProhibitFlag::Medium).unwrap();
        let err = map.add_flag(LS, ProhibitFlag::Transfer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(map.get(LS).unwrap().ref_cnt, 1);
        assert_eq!(map.transfer_flag_cnt(), 0);
    }

    #[test]
    fn over_clear_and_wrong_kind() {
        let map = ProhibitMediumMap::default();
        assert_eq!(
            map.clear_flag(LS, ProhibitFlag::Medium).unwrap_err().kind(),
            ErrorKind::StateMismatch
        );
        map.add_flag(LS, ProhibitFlag::Transfer).unwrap();
        assert_eq!(
            map.clear_flag(LS, ProhibitFlag::Medium).unwrap_err().kind(),
            ErrorKind::StateMismatch
        );
        map.clear_flag(LS, ProhibitFlag::Transfer).unwrap();
        assert_eq!(
            map.clear_flag(LS, ProhibitFlag::Transfer)
                .unwrap_err()
                .kind(),
            ErrorKind::StateMismatch
        );
        assert!(map.is_empty());
    }

    #[test]
    fn guard_releases_medium() {
        let map = ProhibitMediumMap::default();
        {
            let guard = map.start_medium(LS).unwrap().expect("schedulable");
            assert_eq!(guard.ls_id(), LS);
            assert_eq!(map.get(LS).unwrap().flag, ProhibitFlag::Medium);
            assert_eq!(
                map.add_flag(LS, ProhibitFlag::Transfer).unwrap_err().kind(),
                ErrorKind::Busy
            );
        }
        assert!(map.is_empty());

        map.add_flag(LS, ProhibitFlag::Transfer).unwrap();
        assert!(map.start_medium(LS).unwrap().is_none());
        assert_eq!(map.get(LS).unwrap().ref_cnt, 1);
    }

    #[test]
    fn display_is_sorted() {
        let map = ProhibitMediumMap::default();
        map.add_flag(LsId::new(2), ProhibitFlag::Medium).unwrap();
        map.add_flag(LsId::new(1), ProhibitFlag::Transfer).unwrap();
        assert_eq!(
            map.to_string(),
            "transfer_flag_cnt=1 {ls(1): Transfer*1, ls(2): Medium*1}"
        );
    }

    #[test]
    fn random_add_clear_sequences() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..200 {
            let map = ProhibitMediumMap::default();
            let mut balance = 0u32;
            for _ in 0..rng.usize(1..64) {
                if rng.bool() {
                    map.add_flag(LS, ProhibitFlag::Transfer).unwrap();
                    balance += 1;
                } else if balance > 0 {
                    map.clear_flag(LS, ProhibitFlag::Transfer).unwrap();
                    balance -= 1;
                } else {
                    assert!(map.clear_flag(LS, ProhibitFlag::Transfer).is_err());
                }
                assert_eq!(map.is_prohibited(LS), balance > 0);
                assert_eq!(map.get(LS).map_or(0, |s| s.ref_cnt), balance);
                assert_eq!(map.transfer_flag_cnt(), u64::from(balance));
            }
        }
    }
}
