//! 作用域记录的竞技场存储。
//!
//! # 教案式说明
//! - **契约 (What)**：所有存活作用域以 [`ScopeId`] 为键保存在 [`ScopeArena`] 中；父链接只是
//!   非拥有的 ID 回指，资源句柄的所有者通过 [`ResourceLink::Owner`] 显式标记，而非每次遍历推断；
//! - **实现 (How)**：记录在作用域销毁时从竞技场移除，因此“记录不存在”即等价于“已销毁”；
//! - **注意事项 (Trade-offs)**：竞技场本身不加锁，由 `ScopeManager` 以 `parking_lot::Mutex` 统一保护。

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{completion::CompletionContext, resource::HandleCell};

/// 作用域的稳定标识，在单个管理器内单调递增、永不复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 原始数值，适合写入日志字段。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// 作用域的构造方式。
///
/// - `Nested`：经 `create_scope` 创建，嵌套在当前环境作用域之下；
/// - `Detached`：经 `create_detached_scope` 创建，需显式附加/分离。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Nested,
    Detached,
}

/// 作用域与事务句柄之间的关联。
pub(crate) enum ResourceLink<T> {
    Unresolved,
    Owner(Arc<HandleCell<T>>),
    Shared(Arc<HandleCell<T>>),
}

impl<T> ResourceLink<T> {
    pub(crate) fn cell(&self) -> Option<&Arc<HandleCell<T>>> {
        match self {
            ResourceLink::Unresolved => None,
            ResourceLink::Owner(cell) | ResourceLink::Shared(cell) => Some(cell),
        }
    }

    pub(crate) fn is_owner(&self) -> bool {
        matches!(self, ResourceLink::Owner(_))
    }
}

/// 单个作用域的可变状态。
pub(crate) struct ScopeRecord<T> {
    pub(crate) parent: Option<ScopeId>,
    pub(crate) kind: ScopeKind,
    pub(crate) context: CompletionContext,
    /// 三态完成标记：`None` 表示未设置，解析时按 `false` 处理。
    pub(crate) completed: Option<bool>,
    /// 已销毁后代的完成结果按位与的累积值。
    pub(crate) subtree_complete: bool,
    pub(crate) resource: ResourceLink<T>,
    pub(crate) migrated: bool,
    pub(crate) live_children: usize,
    pub(crate) attached: bool,
}

impl<T> ScopeRecord<T> {
    pub(crate) fn new(parent: Option<ScopeId>, kind: ScopeKind, context: CompletionContext) -> Self {
        Self {
            parent,
            kind,
            context,
            completed: None,
            subtree_complete: true,
            resource: ResourceLink::Unresolved,
            migrated: false,
            live_children: 0,
            attached: false,
        }
    }

    /// 自身解析后的完成结果，未设置视为 `false`。
    pub(crate) fn resolved(&self) -> bool {
        self.completed == Some(true)
    }

    /// 自身与全部已销毁后代共同决定的结果。
    pub(crate) fn subtree_outcome(&self) -> bool {
        self.resolved() && self.subtree_complete
    }
}

pub(crate) struct ScopeArena<T> {
    next_id: u64,
    records: HashMap<ScopeId, ScopeRecord<T>>,
}

impl<T> Default for ScopeArena<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            records: HashMap::new(),
        }
    }
}

impl<T> ScopeArena<T> {
    pub(crate) fn insert(&mut self, record: ScopeRecord<T>) -> ScopeId {
        let id = ScopeId(self.next_id);
        self.next_id += 1;
        self.records.insert(id, record);
        id
    }

    pub(crate) fn get(&self, id: ScopeId) -> Option<&ScopeRecord<T>> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ScopeId) -> Option<&mut ScopeRecord<T>> {
        self.records.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: ScopeId) -> Option<ScopeRecord<T>> {
        self.records.remove(&id)
    }

    pub(crate) fn contains(&self, id: ScopeId) -> bool {
        self.records.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// 自 `start` 起沿父链查找最近的仍然打开的事务句柄（包含 `start` 本身）。
    pub(crate) fn nearest_open_handle(&self, start: Option<ScopeId>) -> Option<Arc<HandleCell<T>>> {
        let mut cursor = start;
        while let Some(id) = cursor {
            let record = self.records.get(&id)?;
            if let Some(cell) = record.resource.cell()
                && cell.is_open()
            {
                return Some(Arc::clone(cell));
            }
            cursor = record.parent;
        }
        None
    }

    /// 与给定完成上下文同属一条链的全部存活作用域。
    pub(crate) fn chain_members(&self, context: &CompletionContext) -> Vec<ScopeId> {
        let mut members: Vec<ScopeId> = self
            .records
            .iter()
            .filter(|(_, record)| record.context.ptr_eq(context))
            .map(|(id, _)| *id)
            .collect();
        members.sort_unstable();
        members
    }
}
