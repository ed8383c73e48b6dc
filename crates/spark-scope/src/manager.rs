//! # 作用域管理器（Scope Manager）
//!
//! ## 定位（Why）
//! - 管理器是作用域的唯一入口：创建、附加、分离、销毁都经由它完成，并在每一步校验嵌套顺序；
//! - 它把“当前作用域”存放在环境存储中，调用方无需显式传递句柄即可嵌套工作单元。
//!
//! ## 销毁状态机（What）
//! 1. 目标必须是当前流的环境作用域，且在任何流中都没有存活的子作用域，否则返回顺序违规，状态不变；
//! 2. 环境帧弹回父作用域（分离式作用域则自动分离，恢复附加前的帧）；
//! 3. 子树结果 = 自身完成标记 ∧ 全部已销毁后代的结果；
//! 4. 所有者据此提交或回滚并关闭句柄；结果（提交失败视为未完成）按位与并入父作用域；
//! 5. 最外层作用域以链的最终结果解析完成上下文；
//! 6. 清理全部完成后才返回错误：驱动错误优先，其次为回调聚合错误。
//!
//! ## 实现（How）
//! - 竞技场由 `parking_lot::Mutex` 保护；驱动调用与回调执行都发生在锁外；
//! - 销毁分为“锁内校验并摘除记录 → 锁外结束事务 → 锁内回写父作用域 → 锁外解析上下文”四段；
//!   父作用域的 `live_children` 直到回写时才递减，期间父作用域无法被提前销毁。
//!
//! ## 风险（Trade-offs）
//! - 同一执行流内的访问是同步的；跨流传播只能通过 [`FlowSnapshot`](crate::FlowSnapshot)
//!   或 `spawn_propagated` 显式完成。

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    ambient::{AmbientFrame, AmbientStorage, Attachment, FlowState, Slot, in_logical_flow},
    arena::{ResourceLink, ScopeArena, ScopeId, ScopeKind, ScopeRecord},
    completion::CompletionContext,
    config::{ScopeSettings, SettingsError},
    error::{AggregateCallbackError, CallbackFailure, DriverStage, OrderViolation, ScopeError},
    reference::ScopeReference,
    resource::{HandleCell, ResourceHandle, Transaction, TransactionalResource},
    scope::Scope,
};

/// 创建作用域时的可选参数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    migrate: Option<bool>,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否把调用流迁移到逻辑流槽位；未设置时取 `ScopeSettings::default_migration`。
    pub fn migrate(mut self, migrate: bool) -> Self {
        self.migrate = Some(migrate);
        self
    }
}

/// 强制清理的统计结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForceClearReport {
    /// 被移除的作用域数量。
    pub scopes: usize,
    /// 被回滚的事务句柄数量。
    pub rolled_back: usize,
    /// 被结束的完成上下文数量。
    pub contexts: usize,
    /// 未执行即被丢弃的回调数量。
    pub discarded_callbacks: usize,
}

impl ForceClearReport {
    /// 本次清理是否没有触及任何状态。
    pub fn is_empty(&self) -> bool {
        self.scopes == 0 && self.contexts == 0
    }
}

pub(crate) struct ManagerInner<P: TransactionalResource> {
    provider: P,
    settings: ScopeSettings,
    pub(crate) storage: AmbientStorage,
    arena: Mutex<ScopeArena<P::Transaction>>,
}

/// 环境式嵌套作用域管理器。
///
/// # 教案式说明
/// - **意图 (Why)**：任意深度嵌套的工作单元共享同一个事务资源，并由最外层统一决定提交或回滚；
/// - **契约 (What)**：
///   - `Clone` 共享同一个竞技场与环境存储；
///   - 每个管理器拥有独立的环境存储键，多个管理器可以在同一执行流中并存；
///   - 所有返回 `Err` 的顺序违规都不会修改环境状态；
/// - **前置条件**：资源提供者的 `open` 不得回调同一管理器；
/// - **后置条件**：最外层作用域销毁后，当前流的环境作用域与完成上下文均为空。
pub struct ScopeManager<P: TransactionalResource> {
    pub(crate) inner: Arc<ManagerInner<P>>,
}

impl<P: TransactionalResource> Clone for ScopeManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: TransactionalResource> fmt::Debug for ScopeManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeManager")
            .field("storage", &self.inner.storage.id())
            .field("live_scopes", &self.live_scopes())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

/// 移除当前流中已被其它流强制清理的环境帧。
fn prune_stale<T>(flow: &mut FlowState, arena: &ScopeArena<T>) {
    while let Some(stale) = flow
        .current
        .as_ref()
        .filter(|frame| !arena.contains(frame.scope))
        .map(|frame| frame.scope)
    {
        warn!(scope = %stale, "pruning stale ambient frame left behind by a force clear");
        flow.current = match flow.attached.last() {
            Some(top) if !arena.contains(top.scope) => {
                flow.attached.pop().and_then(|attachment| attachment.saved)
            }
            _ => None,
        };
    }
}

impl<P: TransactionalResource> ScopeManager<P> {
    /// 以默认配置构造管理器。
    pub fn new(provider: P) -> Self {
        Self::build(provider, ScopeSettings::default())
    }

    /// 以自定义配置构造管理器；配置先经过校验。
    pub fn with_settings(provider: P, settings: ScopeSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self::build(provider, settings))
    }

    fn build(provider: P, settings: ScopeSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                provider,
                settings,
                storage: AmbientStorage::new(),
                arena: Mutex::new(ScopeArena::default()),
            }),
        }
    }

    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    pub fn settings(&self) -> &ScopeSettings {
        &self.inner.settings
    }

    /// 两个管理器是否共享同一份状态。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 尚未销毁的作用域总数（全部执行流）。
    pub fn live_scopes(&self) -> usize {
        self.inner.arena.lock().len()
    }

    /// 当前执行流中本管理器状态所在的槽位。
    pub fn active_slot(&self) -> Slot {
        self.inner.storage.active_slot()
    }

    /// 以默认选项创建作用域。
    pub fn create_scope(&self) -> Result<Scope<P>, ScopeError> {
        self.create_scope_with(ScopeOptions::default())
    }

    /// 创建嵌套在当前环境作用域之下的作用域，并将其设为环境作用域。
    ///
    /// # 契约
    /// - 当前流没有环境作用域时创建链根，并分配新的完成上下文；
    /// - 否则继承父作用域的完成上下文，父作用域的存活子计数加一；
    /// - 请求迁移但不在逻辑流内时返回 [`ScopeError::NoLogicalFlow`]，不创建任何东西；
    /// - 不会主动打开事务句柄。
    pub fn create_scope_with(&self, options: ScopeOptions) -> Result<Scope<P>, ScopeError> {
        let migrate = options
            .migrate
            .unwrap_or(self.inner.settings.default_migration);
        if migrate && self.inner.storage.migrate()? {
            debug!(storage = ?self.inner.storage.id(), "ambient chain migrated into the logical flow");
        }

        let mut arena = self.inner.arena.lock();
        let (id, parent) = self.inner.storage.with_flow(|flow| {
            prune_stale(flow, &arena);
            let (parent, context) = match &flow.current {
                Some(frame) => (Some(frame.scope), frame.context.clone()),
                None => (None, CompletionContext::new()),
            };
            let mut record = ScopeRecord::new(parent, ScopeKind::Nested, context.clone());
            record.migrated = migrate;
            let id = arena.insert(record);
            if let Some(parent) = parent
                && let Some(parent_record) = arena.get_mut(parent)
            {
                parent_record.live_children += 1;
            }
            flow.current = Some(AmbientFrame { scope: id, context });
            (id, parent)
        });
        drop(arena);

        debug!(scope = %id, parent = ?parent.map(ScopeId::get), migrated = migrate, "scope created");
        Ok(Scope::new(id, ScopeKind::Nested, self.clone()))
    }

    /// 创建分离式作用域：自带完成上下文，不成为环境作用域，需显式附加。
    pub fn create_detached_scope(&self) -> Scope<P> {
        let id = self.inner.arena.lock().insert(ScopeRecord::new(
            None,
            ScopeKind::Detached,
            CompletionContext::new(),
        ));
        debug!(scope = %id, "detached scope created");
        Scope::new(id, ScopeKind::Detached, self.clone())
    }

    /// 把分离式作用域附加到当前流，保存先前的环境帧。
    pub fn attach_scope(&self, scope: &Scope<P>) -> Result<(), ScopeError> {
        let id = scope.id();
        if !scope.manager().ptr_eq(self) {
            return Err(self.reject(OrderViolation::ForeignScope { scope: id }));
        }
        let mut arena = self.inner.arena.lock();
        let context = match arena.get(id) {
            None => return Err(self.reject(OrderViolation::Disposed { scope: id })),
            Some(record) if record.kind != ScopeKind::Detached => {
                return Err(self.reject(OrderViolation::NotDetachable { scope: id }));
            }
            Some(record) if record.attached => {
                return Err(self.reject(OrderViolation::AlreadyAttached { scope: id }));
            }
            Some(record) => record.context.clone(),
        };
        self.inner.storage.with_flow(|flow| {
            prune_stale(flow, &arena);
            let saved = flow.current.replace(AmbientFrame { scope: id, context });
            flow.attached.push(Attachment { scope: id, saved });
        });
        if let Some(record) = arena.get_mut(id) {
            record.attached = true;
        }
        drop(arena);
        debug!(scope = %id, "detached scope attached");
        Ok(())
    }

    /// 分离最近附加的作用域，恢复附加前的环境帧（同一作用域、同一上下文）。
    pub fn detach_scope(&self) -> Result<Scope<P>, ScopeError> {
        let mut arena = self.inner.arena.lock();
        let detached = self.inner.storage.with_flow(|flow| {
            prune_stale(flow, &arena);
            let Some(top) = flow.attached.last() else {
                return Err(OrderViolation::NothingAttached);
            };
            let ambient = flow.current.as_ref().map(|frame| frame.scope);
            let live = arena.get(top.scope).map_or(0, |record| record.live_children);
            if ambient != Some(top.scope) || live > 0 {
                return Err(OrderViolation::NestedOnTop {
                    attached: top.scope,
                    ambient,
                    live,
                });
            }
            let attachment = flow.attached.pop();
            flow.current = attachment.as_ref().and_then(|a| a.saved.clone());
            attachment.map(|a| a.scope).ok_or(OrderViolation::NothingAttached)
        });
        let id = match detached {
            Ok(id) => id,
            Err(violation) => {
                drop(arena);
                return Err(self.reject(violation));
            }
        };
        if let Some(record) = arena.get_mut(id) {
            record.attached = false;
        }
        drop(arena);
        debug!(scope = %id, "detached scope detached");
        Ok(Scope::new(id, ScopeKind::Detached, self.clone()))
    }

    /// 当前流的环境作用域。
    pub fn current_scope(&self) -> Option<Scope<P>> {
        let arena = self.inner.arena.lock();
        let frame = self.inner.storage.with_flow(|flow| {
            prune_stale(flow, &arena);
            flow.current.clone()
        })?;
        let kind = arena.get(frame.scope)?.kind;
        drop(arena);
        Some(Scope::new(frame.scope, kind, self.clone()))
    }

    /// 当前流的环境完成上下文。
    pub fn current_context(&self) -> Option<CompletionContext> {
        self.current_frame().map(|frame| frame.context)
    }

    pub(crate) fn current_frame(&self) -> Option<AmbientFrame> {
        let arena = self.inner.arena.lock();
        self.inner.storage.with_flow(|flow| {
            prune_stale(flow, &arena);
            flow.current.clone()
        })
    }

    /// 获取绑定当前流的作用域引用；释放时强制清空当前流的环境状态。
    pub fn scope_reference(&self) -> ScopeReference<P> {
        ScopeReference::new(self.clone())
    }

    /// 清空当前流（本线程与所在逻辑流）中属于本管理器的环境状态，不触碰作用域记录。
    ///
    /// 仅供测试在用例之间复位；生产代码应使用 [`ScopeReference`]。
    pub fn reset_ambient(&self) {
        self.inner.storage.reset();
    }

    /// 受治理的同步代码块。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：创建作用域并执行 `f`；`f` 返回 `Ok` 时标记完成；无论结果如何都会销毁，
    ///   包括 `f` panic 导致的栈展开；
    /// - **错误优先级**：`f` 的错误优先于销毁错误，后者仅记录日志。
    pub fn run<R, E>(&self, f: impl FnOnce(&Scope<P>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<ScopeError>,
    {
        let scope = self.create_scope()?;
        let mut guard = DisposeGuard::new(&scope);
        let result = f(&scope);
        guard.disarm();
        settle(&scope, result)
    }

    /// 受治理的异步代码块。
    ///
    /// 位于逻辑流内时自动迁移调用流，作用域因此跨越 `.await` 与工作线程保持；
    /// Future 在完成前被丢弃时会尝试销毁作用域，失败仅记录日志。
    pub async fn run_async<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(Scope<P>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<ScopeError>,
    {
        let scope = self.create_scope_with(ScopeOptions::new().migrate(in_logical_flow()))?;
        let mut guard = DisposeGuard::new(&scope);
        let result = f(scope.clone()).await;
        guard.disarm();
        settle(&scope, result)
    }

    fn reject(&self, violation: OrderViolation) -> ScopeError {
        warn!(error = %violation, "scope order violation");
        ScopeError::OrderViolation(violation)
    }

    pub(crate) fn inspect<R>(
        &self,
        id: ScopeId,
        f: impl FnOnce(&ScopeRecord<P::Transaction>) -> R,
    ) -> Option<R> {
        self.inner.arena.lock().get(id).map(f)
    }

    pub(crate) fn mark_complete(&self, id: ScopeId) -> Result<(), ScopeError> {
        let mut arena = self.inner.arena.lock();
        match arena.get_mut(id) {
            Some(record) => {
                record.completed = Some(true);
                drop(arena);
                debug!(scope = %id, "scope marked complete");
                Ok(())
            }
            None => {
                drop(arena);
                Err(self.reject(OrderViolation::Disposed { scope: id }))
            }
        }
    }

    /// 取得作用域的事务句柄：已有则复用，其次共享最近祖先的句柄，最后打开新句柄并成为所有者。
    pub(crate) fn resource_handle(
        &self,
        id: ScopeId,
    ) -> Result<ResourceHandle<P::Transaction>, ScopeError> {
        if let Some(existing) = self.link_existing(id)? {
            return Ok(existing);
        }

        let transaction = self
            .inner
            .provider
            .open()
            .map_err(|source| ScopeError::driver(DriverStage::Open, source))?;
        let cell = Arc::new(HandleCell::new(id, transaction));

        let raced = {
            let mut arena = self.inner.arena.lock();
            match arena.get(id) {
                None => Err(ScopeError::DisposedResource { scope: id }),
                Some(record) if record.resource.cell().is_some() => Ok(false),
                Some(record) => {
                    let parent = record.parent;
                    match arena.nearest_open_handle(parent) {
                        Some(_) => Ok(false),
                        None => {
                            if let Some(record) = arena.get_mut(id) {
                                record.resource = ResourceLink::Owner(Arc::clone(&cell));
                            }
                            Ok(true)
                        }
                    }
                }
            }
        };
        match raced {
            Ok(true) => {
                debug!(scope = %id, handle = %cell.id(), "transactional resource opened");
                Ok(ResourceHandle::new(cell))
            }
            Ok(false) => {
                discard_spare(id, &cell);
                self.link_existing(id)?
                    .ok_or(ScopeError::DisposedResource { scope: id })
            }
            Err(err) => {
                discard_spare(id, &cell);
                Err(err)
            }
        }
    }

    /// 复用已有链接或共享祖先句柄；都没有时返回 `Ok(None)`。
    fn link_existing(
        &self,
        id: ScopeId,
    ) -> Result<Option<ResourceHandle<P::Transaction>>, ScopeError> {
        let mut arena = self.inner.arena.lock();
        let Some(record) = arena.get(id) else {
            return Err(ScopeError::DisposedResource { scope: id });
        };
        if let Some(cell) = record.resource.cell() {
            return if cell.is_open() {
                Ok(Some(ResourceHandle::new(Arc::clone(cell))))
            } else {
                Err(ScopeError::DisposedResource { scope: cell.owner() })
            };
        }
        let parent = record.parent;
        let Some(cell) = arena.nearest_open_handle(parent) else {
            return Ok(None);
        };
        if let Some(record) = arena.get_mut(id) {
            record.resource = ResourceLink::Shared(Arc::clone(&cell));
        }
        Ok(Some(ResourceHandle::new(cell)))
    }

    /// 销毁作用域，见模块文档中的状态机。
    pub(crate) fn dispose(&self, id: ScopeId) -> Result<(), ScopeError> {
        let mut arena = self.inner.arena.lock();
        let removed = self.inner.storage.with_flow(|flow| {
            prune_stale(flow, &arena);
            let Some(record) = arena.get(id) else {
                return Err(OrderViolation::Disposed { scope: id });
            };
            let ambient = flow.current.as_ref().map(|frame| frame.scope);
            if ambient != Some(id) {
                return Err(OrderViolation::NotAmbient { scope: id, ambient });
            }
            if record.live_children > 0 {
                return Err(OrderViolation::LiveDescendants {
                    scope: id,
                    live: record.live_children,
                });
            }
            flow.current = match record.kind {
                ScopeKind::Detached => match flow.attached.last() {
                    Some(top) if top.scope == id => {
                        flow.attached.pop().and_then(|attachment| attachment.saved)
                    }
                    _ => None,
                },
                ScopeKind::Nested => record.parent.map(|parent| AmbientFrame {
                    scope: parent,
                    context: record.context.clone(),
                }),
            };
            arena.remove(id).ok_or(OrderViolation::Disposed { scope: id })
        });
        drop(arena);
        let record = removed.map_err(|violation| self.reject(violation))?;

        let outcome = record.subtree_outcome();
        let finalized = match &record.resource {
            ResourceLink::Owner(cell) => {
                info!(
                    scope = %id,
                    handle = %cell.id(),
                    decision = if outcome { "commit" } else { "rollback" },
                    "finalizing transactional resource"
                );
                cell.finalize(outcome)
            }
            _ => Ok(()),
        };
        let commit_failed = matches!(
            finalized,
            Err(ScopeError::Driver {
                stage: DriverStage::Commit,
                ..
            } | ScopeError::HandleInUse { .. })
        );
        let effective = outcome && !commit_failed;
        if let Err(err) = &finalized {
            warn!(scope = %id, error = %err, "driver failed while finalizing scope");
        }

        let failures = match record.parent {
            Some(parent) => {
                let mut arena = self.inner.arena.lock();
                if let Some(parent_record) = arena.get_mut(parent) {
                    parent_record.subtree_complete &= effective;
                    parent_record.live_children = parent_record.live_children.saturating_sub(1);
                }
                drop(arena);
                debug!(scope = %id, parent = %parent, outcome = effective, "scope disposed");
                Vec::new()
            }
            None => {
                info!(
                    scope = %id,
                    context = %record.context.id(),
                    outcome = effective,
                    "resolving completion context"
                );
                record
                    .context
                    .resolve(effective, self.inner.settings.resolve_policy())
            }
        };
        log_failures(id, &failures);

        finalized?;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateCallbackError::new(effective, failures).into())
        }
    }

    /// 强制清空当前流的环境状态：移除可达链上的全部作用域，回滚其句柄，以 `false` 结束上下文。
    pub(crate) fn force_clear(&self) -> Result<ForceClearReport, ScopeError> {
        let flow = self.inner.storage.take();
        if flow.is_empty() {
            return Ok(ForceClearReport::default());
        }

        let mut contexts = flow.contexts();
        let mut arena = self.inner.arena.lock();
        for attachment in &flow.attached {
            if let Some(record) = arena.get(attachment.scope)
                && !contexts.iter().any(|known| known.ptr_eq(&record.context))
            {
                contexts.push(record.context.clone());
            }
        }
        let mut removed = Vec::new();
        for context in &contexts {
            for id in arena.chain_members(context) {
                if let Some(record) = arena.remove(id) {
                    removed.push((id, record));
                }
            }
        }
        drop(arena);

        let mut report = ForceClearReport {
            scopes: removed.len(),
            contexts: contexts.len(),
            ..ForceClearReport::default()
        };
        let mut driver_error = None;
        for (id, record) in &removed {
            if let ResourceLink::Owner(cell) = &record.resource
                && cell.is_open()
            {
                report.rolled_back += 1;
                if let Err(err) = cell.finalize(false) {
                    warn!(scope = %id, error = %err, "driver failed while force-clearing scope");
                    if driver_error.is_none() {
                        driver_error = Some(err);
                    }
                }
            }
        }

        let mut failures = Vec::new();
        for context in &contexts {
            if self.inner.settings.force_clear_runs_callbacks {
                failures.extend(context.resolve(false, self.inner.settings.resolve_policy()));
            } else {
                report.discarded_callbacks += context.discard();
            }
        }
        warn!(
            scopes = report.scopes,
            rolled_back = report.rolled_back,
            contexts = report.contexts,
            discarded_callbacks = report.discarded_callbacks,
            "ambient state force-cleared"
        );
        for failure in &failures {
            warn!(callback = failure.name(), error = %failure, "completion callback failed during force clear");
        }

        if let Some(err) = driver_error {
            return Err(err);
        }
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(AggregateCallbackError::new(false, failures).into())
        }
    }
}

/// 竞争中落败或作用域已消失时多打开的事务：回滚并关闭，失败只记录日志。
fn discard_spare<T: Transaction>(scope: ScopeId, cell: &HandleCell<T>) {
    if let Err(err) = cell.finalize(false) {
        warn!(scope = %scope, handle = %cell.id(), error = %err, "driver failed while discarding a spare transaction");
    }
}

fn log_failures(scope: ScopeId, failures: &[CallbackFailure]) {
    for failure in failures {
        warn!(scope = %scope, callback = failure.name(), error = %failure, "completion callback failed");
    }
}

fn settle<P, R, E>(scope: &Scope<P>, result: Result<R, E>) -> Result<R, E>
where
    P: TransactionalResource,
    E: From<ScopeError>,
{
    match result {
        Ok(value) => {
            let marked = scope.mark_complete();
            let disposed = scope.dispose();
            marked?;
            disposed?;
            Ok(value)
        }
        Err(err) => {
            if let Err(dispose_err) = scope.dispose() {
                warn!(scope = %scope.id(), error = %dispose_err, "dispose failed after governed block error");
            }
            Err(err)
        }
    }
}

/// 代码块未正常返回（panic 或 Future 被丢弃）时销毁作用域。
struct DisposeGuard<'a, P: TransactionalResource> {
    scope: &'a Scope<P>,
    armed: bool,
}

impl<'a, P: TransactionalResource> DisposeGuard<'a, P> {
    fn new(scope: &'a Scope<P>) -> Self {
        Self { scope, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<P: TransactionalResource> Drop for DisposeGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed
            && let Err(err) = self.scope.dispose()
        {
            error!(scope = %self.scope.id(), error = %err, "dispose failed while abandoning governed block");
        }
    }
}
