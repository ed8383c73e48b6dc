//! # 执行流辅助函数
//!
//! ## 定位（Why）
//! - 环境状态默认不跨越执行流：新线程、新任务都从空状态开始；
//! - 需要传播时由调用方显式选择：线程使用 [`FlowSnapshot::enter`]，Future 使用 [`FlowSnapshot::scope`]，
//!   任务使用 [`ScopeManager::spawn_propagated`]。
//!
//! ## 契约（What）
//! - [`logical_flow`]：为 Future 开辟迁移槽位，使 `migrate` 请求与 `run_async` 可以跨 `.await` 保持作用域；
//! - [`ScopeManager::spawn_isolated`]：新任务的槽位被钉为空状态，即使工作线程上残留了本地状态也不可见；
//! - [`ScopeManager::spawn_propagated`]：新任务看到调用方当前帧，可在其下嵌套；
//!   被嵌套的父作用域在子作用域销毁前无法销毁（跨流的 `live_children` 检测）。
//!
//! ## 风险（Trade-offs）
//! - 传播只复制“当前帧”指针，不复制附加栈；传播出去的流若销毁共享帧，原流随后访问会被当作失效帧裁剪。

use tokio::task::JoinHandle;

use crate::{
    ambient::{AmbientFrame, FlowState, SlotMap, run_in_flow, seeded},
    arena::ScopeId,
    manager::ScopeManager,
    resource::TransactionalResource,
};

/// 在新的逻辑流中运行 Future。
///
/// 逻辑流内部的迁移槽位跟随该 Future 跨越 `.await` 与工作线程；嵌套调用会开辟新的空流，
/// 外层流迁移过的状态在内层不可见。
pub async fn logical_flow<F: Future>(future: F) -> F::Output {
    run_in_flow(SlotMap::new(), future).await
}

/// 当前环境帧的快照，用于显式传播到其它线程或 Future。
pub struct FlowSnapshot<P: TransactionalResource> {
    manager: ScopeManager<P>,
    frame: Option<AmbientFrame>,
}

impl<P: TransactionalResource> Clone for FlowSnapshot<P> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            frame: self.frame.clone(),
        }
    }
}

impl<P: TransactionalResource> FlowSnapshot<P> {
    /// 快照中的环境作用域。
    pub fn current_scope_id(&self) -> Option<ScopeId> {
        self.frame.as_ref().map(|frame| frame.scope)
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_none()
    }

    /// 在当前流安装快照，返回的守卫在丢弃时恢复原状态。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：安装后当前流只包含快照中的帧，不包含原有附加栈；
    ///   守卫丢弃时整体恢复安装前的状态，期间在该流创建且未销毁的作用域帧随之丢失；
    /// - **前置条件**：守卫应在安装它的同一线程上丢弃。
    pub fn enter(&self) -> FlowGuard<'_, P> {
        let previous = self
            .manager
            .inner
            .storage
            .swap(FlowState::with_frame(self.frame.clone()));
        FlowGuard {
            snapshot: self,
            previous: Some(previous),
        }
    }

    /// 在携带快照的新逻辑流中运行 Future。
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        run_in_flow(self.seed(), future).await
    }

    fn seed(&self) -> SlotMap {
        let mut state = FlowState::with_frame(self.frame.clone());
        state.pinned = true;
        seeded(self.manager.inner.storage.id(), state)
    }
}

impl<P: TransactionalResource> std::fmt::Debug for FlowSnapshot<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSnapshot")
            .field("scope", &self.current_scope_id())
            .finish()
    }
}

/// [`FlowSnapshot::enter`] 返回的恢复守卫。
pub struct FlowGuard<'a, P: TransactionalResource> {
    snapshot: &'a FlowSnapshot<P>,
    previous: Option<FlowState>,
}

impl<P: TransactionalResource> Drop for FlowGuard<'_, P> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.snapshot.manager.inner.storage.swap(previous);
        }
    }
}

impl<P: TransactionalResource> ScopeManager<P> {
    /// 捕获当前流的环境帧。
    pub fn capture_flow(&self) -> FlowSnapshot<P> {
        FlowSnapshot {
            manager: self.clone(),
            frame: self.current_frame(),
        }
    }

    /// 启动不继承任何环境状态的任务。
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn spawn_isolated<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slots = seeded(self.inner.storage.id(), FlowState::pinned_empty());
        tokio::spawn(run_in_flow(slots, future))
    }

    /// 启动继承调用方当前环境帧的任务。
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn spawn_propagated<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slots = self.capture_flow().seed();
        tokio::spawn(run_in_flow(slots, future))
    }
}
