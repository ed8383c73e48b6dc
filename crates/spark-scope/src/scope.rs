//! 调用方持有的作用域句柄。

use std::fmt;

use crate::{
    arena::{ScopeId, ScopeKind},
    completion::CompletionContext,
    error::ScopeError,
    manager::ScopeManager,
    resource::{ResourceHandle, TransactionalResource},
};

/// 作用域句柄。
///
/// # 教案式说明
/// - **契约 (What)**：句柄只是 `(ScopeId, 管理器)` 的轻量组合，`Clone` 不会创建新作用域；
///   所有状态都保存在管理器的竞技场中，销毁后查询类方法返回 `None`/`false`；
/// - **注意事项**：丢弃句柄不会销毁作用域，必须显式调用 [`Scope::dispose`]，
///   或使用 [`ScopeManager::run`] 这类受治理代码块。
pub struct Scope<P: TransactionalResource> {
    id: ScopeId,
    kind: ScopeKind,
    manager: ScopeManager<P>,
}

impl<P: TransactionalResource> Scope<P> {
    pub(crate) fn new(id: ScopeId, kind: ScopeKind, manager: ScopeManager<P>) -> Self {
        Self { id, kind, manager }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// 创建该作用域的管理器。
    pub fn manager(&self) -> &ScopeManager<P> {
        &self.manager
    }

    /// 标记本作用域的工作已完成；幂等。
    pub fn mark_complete(&self) -> Result<(), ScopeError> {
        self.manager.mark_complete(self.id)
    }

    /// 销毁作用域；只有当前流的环境作用域可以被销毁。
    pub fn dispose(&self) -> Result<(), ScopeError> {
        self.manager.dispose(self.id)
    }

    /// 取得链上共享的事务句柄，必要时打开新事务。
    pub fn resource_handle(&self) -> Result<ResourceHandle<P::Transaction>, ScopeError> {
        self.manager.resource_handle(self.id)
    }

    /// 完成标记：`Some(true)` 表示已标记完成；未标记或已销毁时为 `None`。
    pub fn completion(&self) -> Option<bool> {
        self.manager.inspect(self.id, |record| record.completed).flatten()
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.manager.inspect(self.id, |record| record.parent).flatten()
    }

    /// 本作用域所在链的完成上下文。
    pub fn context(&self) -> Option<CompletionContext> {
        self.manager.inspect(self.id, |record| record.context.clone())
    }

    pub fn is_detachable(&self) -> bool {
        self.kind == ScopeKind::Detached
    }

    /// 创建时是否请求了调用流迁移。
    pub fn is_migrated(&self) -> bool {
        self.manager
            .inspect(self.id, |record| record.migrated)
            .unwrap_or(false)
    }

    pub fn is_disposed(&self) -> bool {
        self.manager.inspect(self.id, |_| ()).is_none()
    }

    /// 是否为其事务句柄的所有者。
    pub fn is_owner(&self) -> bool {
        self.manager
            .inspect(self.id, |record| record.resource.is_owner())
            .unwrap_or(false)
    }
}

impl<P: TransactionalResource> Clone for Scope<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            manager: self.manager.clone(),
        }
    }
}

impl<P: TransactionalResource> PartialEq for Scope<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.manager.ptr_eq(&other.manager)
    }
}

impl<P: TransactionalResource> Eq for Scope<P> {}

impl<P: TransactionalResource> fmt::Debug for Scope<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
