//! 基于 `BTreeMap` 的内存事务库。

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    error::BoxError,
    resource::{Transaction, TransactionalResource},
};

/// 注入的驱动故障。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MemoryFault {
    #[error("injected failure while opening a memory transaction")]
    Open,
    #[error("injected failure while committing a memory transaction")]
    Commit,
    #[error("injected failure while rolling back a memory transaction")]
    Rollback,
    #[error("injected failure while closing a memory transaction")]
    Close,
}

/// 驱动调用计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub opened: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub closed: usize,
}

impl MemoryStats {
    /// 已打开但尚未关闭的事务数。
    pub fn open_transactions(&self) -> usize {
        self.opened - self.closed
    }
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    open: AtomicBool,
    commit: AtomicBool,
    rollback: AtomicBool,
    close: AtomicBool,
}

#[derive(Default)]
struct Shared {
    rows: Mutex<BTreeMap<String, String>>,
    counters: Counters,
    faults: Faults,
}

/// 内存事务库。
///
/// # 教案式说明
/// - **契约 (What)**：`Clone` 共享同一份数据与计数器；提交时把事务的写入集原子地合并到主表；
/// - **故障注入**：`fail_next_*` 只对下一次对应调用生效，触发后自动复位；
/// - **注意事项**：注入的提交失败不会合并写入集，语义等同于驱动回滚。
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取已提交的值。
    pub fn get(&self, key: &str) -> Option<String> {
        self.shared.rows.lock().get(key).cloned()
    }

    /// 已提交的行数。
    pub fn len(&self) -> usize {
        self.shared.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        let counters = &self.shared.counters;
        MemoryStats {
            opened: counters.opened.load(Ordering::SeqCst),
            committed: counters.committed.load(Ordering::SeqCst),
            rolled_back: counters.rolled_back.load(Ordering::SeqCst),
            closed: counters.closed.load(Ordering::SeqCst),
        }
    }

    pub fn fail_next_open(&self) {
        self.shared.faults.open.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.shared.faults.commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_rollback(&self) {
        self.shared.faults.rollback.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_close(&self) {
        self.shared.faults.close.store(true, Ordering::SeqCst);
    }
}

fn tripped(flag: &AtomicBool, fault: MemoryFault) -> Result<(), BoxError> {
    if flag.swap(false, Ordering::SeqCst) {
        Err(Box::new(fault))
    } else {
        Ok(())
    }
}

impl TransactionalResource for MemoryDatabase {
    type Transaction = MemoryTransaction;

    fn open(&self) -> Result<MemoryTransaction, BoxError> {
        tripped(&self.shared.faults.open, MemoryFault::Open)?;
        self.shared.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            writes: BTreeMap::new(),
        })
    }
}

/// 内存事务：写入先缓存在写入集中，提交时才可见。
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    writes: BTreeMap<String, Option<String>>,
}

impl MemoryTransaction {
    /// 读取值，优先返回本事务尚未提交的写入。
    pub fn get(&self, key: &str) -> Option<String> {
        match self.writes.get(key) {
            Some(pending) => pending.clone(),
            None => self.shared.rows.lock().get(key).cloned(),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.writes.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    /// 尚未提交的写入数。
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

impl Transaction for MemoryTransaction {
    fn commit(&mut self) -> Result<(), BoxError> {
        if let Err(err) = tripped(&self.shared.faults.commit, MemoryFault::Commit) {
            self.writes.clear();
            return Err(err);
        }
        let mut rows = self.shared.rows.lock();
        for (key, value) in std::mem::take(&mut self.writes) {
            match value {
                Some(value) => rows.insert(key, value),
                None => rows.remove(&key),
            };
        }
        self.shared.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        self.writes.clear();
        tripped(&self.shared.faults.rollback, MemoryFault::Rollback)?;
        self.shared.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(self) -> Result<(), BoxError> {
        self.shared.counters.closed.fetch_add(1, Ordering::SeqCst);
        tripped(&self.shared.faults.close, MemoryFault::Close)
    }
}
