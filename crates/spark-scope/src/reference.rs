//! # 作用域引用（Scope Reference）
//!
//! ## 定位（Why）
//! - 请求入口、后台任务等“边界”代码无法保证内部每一层都正确销毁作用域；
//!   作用域引用是边界处的安全网：释放时无视深度与完成状态，强制清空当前流的环境链；
//!
//! ## 契约（What）
//! - 可达链上的全部作用域被移除，所有者句柄一律回滚并关闭，之后访问返回 `DisposedResource`；
//! - 受影响的完成上下文以 `false` 解析，或在 `force_clear_runs_callbacks = false` 时直接丢弃回调；
//! - [`ScopeReference::release`] 返回错误（驱动错误优先），`Drop` 只能以 `tracing` 记录；
//! - 释放作用于**执行释放时**所在的流，因此应在获取引用的同一流中释放。

use tracing::{debug, error, warn};

use crate::{
    error::ScopeError,
    manager::{ForceClearReport, ScopeManager},
    resource::TransactionalResource,
};

/// 强制清理当前流环境状态的守卫。
#[must_use = "dropping a ScopeReference immediately clears the ambient chain"]
pub struct ScopeReference<P: TransactionalResource> {
    manager: Option<ScopeManager<P>>,
}

impl<P: TransactionalResource> ScopeReference<P> {
    pub(crate) fn new(manager: ScopeManager<P>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    /// 立即执行强制清理并返回统计；当前流为空时为空操作。
    pub fn release(mut self) -> Result<ForceClearReport, ScopeError> {
        match self.manager.take() {
            Some(manager) => manager.force_clear(),
            None => Ok(ForceClearReport::default()),
        }
    }
}

impl<P: TransactionalResource> Drop for ScopeReference<P> {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        match manager.force_clear() {
            Ok(report) if report.is_empty() => {}
            Ok(report) => debug!(scopes = report.scopes, "scope reference dropped"),
            Err(err @ ScopeError::Driver { .. }) => {
                error!(error = %err, code = err.code(), "scope reference failed to roll back");
            }
            Err(err) => warn!(error = %err, code = err.code(), "scope reference cleanup reported failures"),
        }
    }
}

impl<P: TransactionalResource> std::fmt::Debug for ScopeReference<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeReference")
            .field("released", &self.manager.is_none())
            .finish()
    }
}
