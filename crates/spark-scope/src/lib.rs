#![deny(unsafe_code)]

//! # spark-scope
//!
//! ## 定位与职责（Why）
//! - 提供环境式（ambient）嵌套作用域：任意深度嵌套的工作单元共享同一个事务资源，
//!   由最外层作用域根据整条链的完成情况统一提交或回滚；
//! - 在链最终解析时，按登记顺序执行一次完成回调（完成上下文），用于发送通知、刷新缓存等后置动作；
//! - 检测并报告任何违反 LIFO 的销毁顺序，而不是静默破坏状态。
//!
//! ## 架构嵌入（Where）
//! - `manager` 模块是唯一入口，负责创建、附加、分离与销毁作用域；
//! - `ambient` 模块保存“当前作用域”：线程本地槽位与随逻辑流迁移的 `tokio::task_local!` 槽位；
//! - `arena` 模块以稳定 [`ScopeId`] 保存作用域记录，父链接为非拥有的 ID 回指；
//! - `completion` 模块实现链共享的完成回调队列；
//! - `resource` 模块定义驱动能力（打开/提交/回滚/关闭）与对外的事务句柄；
//! - `reference` 模块提供边界处强制清理的安全网；`runtime` 模块提供显式跨流传播工具；
//! - `config` 模块定义可从 TOML 加载的运行时策略；`test_stubs` 模块提供内存事务库。
//!
//! ## 使用示例（How）
//! ```
//! use spark_scope::{ScopeError, ScopeManager, test_stubs::memory::MemoryDatabase};
//!
//! let db = MemoryDatabase::new();
//! let manager = ScopeManager::new(db.clone());
//!
//! let outer = manager.create_scope()?;
//! outer.resource_handle()?.with(|tx| tx.put("order:1", "paid"))?;
//! {
//!     let inner = manager.create_scope()?;
//!     inner.resource_handle()?.with(|tx| tx.put("stock:1", "reserved"))?;
//!     inner.mark_complete()?;
//!     inner.dispose()?;
//! }
//! outer.mark_complete()?;
//! outer.dispose()?;
//!
//! assert_eq!(db.get("stock:1").as_deref(), Some("reserved"));
//! # Ok::<(), ScopeError>(())
//! ```
//!
//! ## 风险提示（Trade-offs）
//! - 库只发出 `tracing` 事件，不安装任何订阅者；
//! - 提交失败不会重试，驱动错误原样上抛。

mod ambient;
mod arena;
mod completion;
mod config;
mod error;
mod manager;
mod reference;
mod resource;
mod runtime;
mod scope;

/// 契约测试与基准测试使用的桩实现。
pub mod test_stubs;

pub use ambient::{Slot, in_logical_flow};
pub use arena::{ScopeId, ScopeKind};
pub use completion::{CompletionContext, ContextId};
pub use config::{ScopeSettings, SettingsError};
pub use error::{
    AggregateCallbackError, BoxError, CallbackFailure, CallbackFault, DriverStage, OrderViolation,
    ScopeError,
};
pub use manager::{ForceClearReport, ScopeManager, ScopeOptions};
pub use reference::ScopeReference;
pub use resource::{HandleId, ResourceHandle, Transaction, TransactionalResource};
pub use runtime::{FlowGuard, FlowSnapshot, logical_flow};
pub use scope::Scope;
