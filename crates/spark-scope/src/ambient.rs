//! # 环境存储（Ambient Storage）
//!
//! ## 定位（Why）
//! - 调用方不需要把作用域句柄层层传递：管理器从“当前执行流”的槽位中读出环境作用域；
//! - 同一执行流可以同时服务多个管理器，槽位内容按 [`StorageId`] 区分，互不干扰。
//!
//! ## 两种槽位（What）
//! - [`Slot::Local`]：`thread_local!`，绑定物理线程，不会跟随 `.await` 迁移到其它工作线程；
//! - [`Slot::Migrated`]：`tokio::task_local!`，绑定逻辑流（任务或 [`logical_flow`](crate::logical_flow)
//!   包裹的 Future），跨 `.await` 与工作线程保持，但不会流入兄弟任务；
//! - 同一执行流中，一个管理器的状态只会存在于其中一个槽位；迁移即整体搬移；
//! - 迁移时若本地槽位已有环境链，记录迁移起点；逻辑流内的作用域逐层销毁、状态退回起点时，
//!   整体搬回执行该次销毁的线程的本地槽位，外层作用域随后可在线程上照常销毁。
//!
//! ## 实现（How）
//! - 两个槽位都是 `RefCell<HashMap<StorageId, FlowState>>`，访问通过闭包完成，不向外泄漏借用；
//! - 状态清空后条目即被移除，除非该流被 `spawn_isolated` 钉为空状态（`pinned`），
//!   此时条目保留，确保后续访问仍停留在迁移槽位而不会回落到线程残留的本地状态。
//!
//! ## 风险（Trade-offs）
//! - 访问闭包内部禁止再次访问同一槽位，否则 `RefCell` 会因重复借用而 panic；管理器保证不在其中执行驱动或回调。

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{debug, warn};

use crate::{arena::ScopeId, completion::CompletionContext, error::ScopeError};

pub(crate) type SlotMap = HashMap<StorageId, FlowState>;

thread_local! {
    static LOCAL: RefCell<SlotMap> = RefCell::new(HashMap::new());
}

tokio::task_local! {
    static MIGRATED: RefCell<SlotMap>;
}

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// 每个管理器独占的存储键。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StorageId(u64);

/// 环境作用域及其完成上下文。
#[derive(Clone, Debug)]
pub(crate) struct AmbientFrame {
    pub(crate) scope: ScopeId,
    pub(crate) context: CompletionContext,
}

/// 分离式作用域附加时保存的先前帧。
#[derive(Clone, Debug)]
pub(crate) struct Attachment {
    pub(crate) scope: ScopeId,
    pub(crate) saved: Option<AmbientFrame>,
}

/// 从本地槽位迁入时的环境位置：当时的环境作用域与附加栈深度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MigrationOrigin {
    scope: Option<ScopeId>,
    attached: usize,
}

/// 单个执行流内、单个管理器的环境状态。
#[derive(Clone, Debug, Default)]
pub(crate) struct FlowState {
    pub(crate) current: Option<AmbientFrame>,
    pub(crate) attached: Vec<Attachment>,
    pub(crate) pinned: bool,
    origin: Option<MigrationOrigin>,
}

impl FlowState {
    pub(crate) fn with_frame(frame: Option<AmbientFrame>) -> Self {
        Self {
            current: frame,
            attached: Vec::new(),
            pinned: false,
            origin: None,
        }
    }

    pub(crate) fn pinned_empty() -> Self {
        Self {
            pinned: true,
            ..Self::default()
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.current.is_none() && self.attached.is_empty()
    }

    /// 状态为空且未被钉住时，条目可以从槽位中移除。
    fn is_vacant(&self) -> bool {
        self.is_empty() && !self.pinned
    }

    /// 迁入的状态已经退回迁移起点，应当交还本地槽位。
    fn returned_to_origin(&self) -> bool {
        !self.pinned
            && self.origin.is_some_and(|origin| {
                origin.scope == self.current.as_ref().map(|frame| frame.scope)
                    && origin.attached == self.attached.len()
            })
    }

    /// 当前帧、附加记录与其保存帧中出现的全部完成上下文（按身份去重）。
    pub(crate) fn contexts(&self) -> Vec<CompletionContext> {
        let mut contexts: Vec<CompletionContext> = Vec::new();
        let frames = self
            .current
            .iter()
            .chain(self.attached.iter().filter_map(|attachment| attachment.saved.as_ref()));
        for frame in frames {
            if !contexts.iter().any(|known| known.ptr_eq(&frame.context)) {
                contexts.push(frame.context.clone());
            }
        }
        contexts
    }
}

/// 管理器状态所在的槽位。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    /// 线程本地槽位。
    Local,
    /// 随逻辑流迁移的槽位。
    Migrated,
}

/// 当前执行是否位于逻辑流内（即迁移槽位可用）。
pub fn in_logical_flow() -> bool {
    MIGRATED.try_with(|_| ()).is_ok()
}

/// 在新的迁移槽位中运行 Future；Future 内部即为一个逻辑流。
///
/// Future 完成时，仍留在流内、由本地槽位迁入的状态交还给当前线程的本地槽位。
pub(crate) async fn run_in_flow<F: Future>(slots: SlotMap, future: F) -> F::Output {
    let mut flow = std::pin::pin!(MIGRATED.scope(RefCell::new(slots), future));
    let output = flow.as_mut().await;
    if let Some(slots) = flow.as_mut().take_value() {
        hand_back(slots.into_inner());
    }
    output
}

fn hand_back(slots: SlotMap) {
    for (id, mut state) in slots {
        if state.origin.is_none() || state.is_empty() {
            continue;
        }
        state.origin = None;
        let scope = state.current.as_ref().map(|frame| frame.scope.get());
        LOCAL.with(|cell| {
            let mut local = cell.borrow_mut();
            if local.get(&id).is_some_and(|existing| !existing.is_empty()) {
                warn!(storage = ?id, scope = ?scope, "local slot is occupied; ambient chain left by the logical flow is dropped");
            } else {
                debug!(storage = ?id, scope = ?scope, "logical flow ended; ambient chain handed back to the local slot");
                local.insert(id, state);
            }
        });
    }
}

/// 以单个管理器的状态构造迁移槽位初值。
pub(crate) fn seeded(id: StorageId, state: FlowState) -> SlotMap {
    let mut slots = HashMap::new();
    slots.insert(id, state);
    slots
}

fn apply<R>(cell: &RefCell<SlotMap>, id: StorageId, f: impl FnOnce(&mut FlowState) -> R) -> R {
    let mut slots = cell.borrow_mut();
    let state = slots.entry(id).or_default();
    let out = f(state);
    if state.is_vacant() {
        slots.remove(&id);
    }
    out
}

/// 管理器持有的环境存储视图。
pub(crate) struct AmbientStorage {
    id: StorageId,
}

impl AmbientStorage {
    pub(crate) fn new() -> Self {
        Self {
            id: StorageId(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub(crate) fn id(&self) -> StorageId {
        self.id
    }

    /// 当前执行流中该管理器状态所在的槽位。
    pub(crate) fn active_slot(&self) -> Slot {
        let migrated = MIGRATED
            .try_with(|cell| cell.borrow().contains_key(&self.id))
            .unwrap_or(false);
        if migrated { Slot::Migrated } else { Slot::Local }
    }

    /// 在活动槽位的状态上执行闭包；闭包结束后空状态会被清理。
    pub(crate) fn with_flow<R>(&self, f: impl FnOnce(&mut FlowState) -> R) -> R {
        match self.active_slot() {
            Slot::Migrated => MIGRATED.with(|cell| {
                let out = apply(cell, self.id, f);
                self.return_to_local(cell);
                out
            }),
            Slot::Local => LOCAL.with(|cell| apply(cell, self.id, f)),
        }
    }

    #[cfg(test)]
    fn peek(&self) -> Option<AmbientFrame> {
        self.with_flow(|state| state.current.clone())
    }

    /// 将本地槽位中的状态迁移到逻辑流槽位。
    ///
    /// 返回 `Ok(true)` 表示本次发生了迁移，`Ok(false)` 表示此前已迁移。
    pub(crate) fn migrate(&self) -> Result<bool, ScopeError> {
        if !in_logical_flow() {
            return Err(ScopeError::NoLogicalFlow);
        }
        if self.active_slot() == Slot::Migrated {
            return Ok(false);
        }
        let mut state = LOCAL
            .with(|cell| cell.borrow_mut().remove(&self.id))
            .unwrap_or_default();
        if !state.is_empty() {
            state.origin = Some(MigrationOrigin {
                scope: state.current.as_ref().map(|frame| frame.scope),
                attached: state.attached.len(),
            });
        }
        MIGRATED.with(|cell| cell.borrow_mut().insert(self.id, state));
        Ok(true)
    }

    /// 迁入的状态退回起点后，把它搬回当前线程的本地槽位。
    ///
    /// 本地槽位在此期间已被其它代码占用时保持迁移状态，并放弃起点记录。
    fn return_to_local(&self, migrated: &RefCell<SlotMap>) {
        let mut slots = migrated.borrow_mut();
        if !slots
            .get(&self.id)
            .is_some_and(FlowState::returned_to_origin)
        {
            return;
        }
        let Some(mut state) = slots.remove(&self.id) else {
            return;
        };
        state.origin = None;
        let resting = state.current.as_ref().map(|frame| frame.scope);
        let conflict = LOCAL.with(|cell| {
            let mut local = cell.borrow_mut();
            if local.get(&self.id).is_some_and(|existing| !existing.is_empty()) {
                return Some(state);
            }
            local.insert(self.id, state);
            None
        });
        match conflict {
            None => debug!(
                storage = ?self.id,
                scope = ?resting.map(ScopeId::get),
                "ambient chain returned to the local slot"
            ),
            Some(state) => {
                warn!(
                    storage = ?self.id,
                    scope = ?resting.map(ScopeId::get),
                    "local slot is occupied; ambient chain stays in the logical flow"
                );
                slots.insert(self.id, state);
            }
        }
    }

    /// 取走活动槽位的全部状态；钉住标记保留在原处。
    pub(crate) fn take(&self) -> FlowState {
        self.with_flow(|state| {
            let pinned = state.pinned;
            let mut taken = std::mem::take(state);
            state.pinned = pinned;
            taken.pinned = false;
            taken
        })
    }

    /// 用给定状态替换活动槽位的状态，返回旧状态；钉住标记保留在原处。
    pub(crate) fn swap(&self, mut next: FlowState) -> FlowState {
        self.with_flow(|state| {
            next.pinned = state.pinned;
            let mut previous = std::mem::replace(state, next);
            previous.pinned = false;
            previous
        })
    }

    /// 清空本执行流两个槽位中属于该管理器的状态。
    pub(crate) fn reset(&self) {
        LOCAL.with(|cell| cell.borrow_mut().remove(&self.id));
        // 迁移槽位中保留钉住标记，仅清空内容。
        let _ = MIGRATED.try_with(|cell| {
            let mut slots = cell.borrow_mut();
            let pinned = slots.get(&self.id).is_some_and(|state| state.pinned);
            if pinned {
                slots.insert(self.id, FlowState::pinned_empty());
            } else {
                slots.remove(&self.id);
            }
        });
    }
}
