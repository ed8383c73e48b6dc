//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中声明作用域管理器对外暴露的错误语义：顺序违规、句柄失效、回调聚合失败与驱动错误；
//! - 每个变体都带有稳定错误码（`scope.*`），便于日志与告警按码值聚合。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接交给 `?` 传播；
//! - 驱动层错误以 [`BoxError`] 原样保存，调用方可通过 [`ScopeError::into_driver_error`] 取回；
//! - 顺序违规与句柄失效属于编程错误，永不重试。

use std::{borrow::Cow, fmt};

use thiserror::Error;

use crate::{arena::ScopeId, completion::ContextId, resource::HandleId};

/// 驱动与回调错误的统一承载形式。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 作用域管理器的顶层错误域。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `OrderViolation`：销毁/分离顺序不满足 LIFO，或目标不是当前环境作用域；
///   - `DisposedResource`：在所属链释放资源句柄之后继续访问；
///   - `Callbacks`：最外层作用域解析时，至少一个完成回调失败；此时所有清理均已完成；
///   - `Driver`：打开/提交/回滚/关闭事务资源时驱动返回的错误，原样保留；
///   - `NoLogicalFlow`：请求调用流迁移，但当前执行不在任何逻辑流内；
///   - `ContextResolved`：完成上下文已经解析完毕，不再接受登记；
///   - `HandleInUse`：同一线程在 `with` 闭包内部再次独占同一事务（重入访问或销毁所有者）。
/// - **风险 (Trade-offs)**：`Driver` 与 `Callbacks` 同时出现时只返回 `Driver`，回调失败仅记录日志。
#[derive(Debug, Error)]
pub enum ScopeError {
    /// 销毁或分离顺序违规。
    #[error("scope order violation: {0}")]
    OrderViolation(#[from] OrderViolation),

    /// 资源句柄已随所属链释放。
    #[error("transactional resource of {scope} has already been released")]
    DisposedResource { scope: ScopeId },

    /// 完成回调聚合失败。
    #[error(transparent)]
    Callbacks(#[from] AggregateCallbackError),

    /// 驱动层错误，未经重试。
    #[error("driver failed to {stage} the transactional resource")]
    Driver {
        stage: DriverStage,
        #[source]
        source: BoxError,
    },

    /// 迁移请求发生在逻辑流之外。
    #[error("call-flow migration requested outside of a logical flow")]
    NoLogicalFlow,

    /// 完成上下文已解析。
    #[error("{context} has already resolved and no longer accepts callbacks")]
    ContextResolved { context: ContextId },

    /// 事务正被同一线程上外层的 `with` 闭包占用。
    #[error("{handle} is already borrowed by an enclosing `with` on this thread")]
    HandleInUse { handle: HandleId },
}

impl ScopeError {
    pub(crate) fn driver(stage: DriverStage, source: BoxError) -> Self {
        ScopeError::Driver { stage, source }
    }

    /// 稳定错误码，遵循 `<域>.<语义>` 约定。
    pub fn code(&self) -> &'static str {
        match self {
            ScopeError::OrderViolation(_) => "scope.order_violation",
            ScopeError::DisposedResource { .. } => "scope.disposed_resource",
            ScopeError::Callbacks(_) => "scope.callbacks_failed",
            ScopeError::Driver { .. } => "scope.driver",
            ScopeError::NoLogicalFlow => "scope.no_logical_flow",
            ScopeError::ContextResolved { .. } => "scope.context_resolved",
            ScopeError::HandleInUse { .. } => "scope.handle_in_use",
        }
    }

    /// 是否属于调用方代码缺陷（不可重试、不应被吞掉）。
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            ScopeError::OrderViolation(_)
                | ScopeError::DisposedResource { .. }
                | ScopeError::NoLogicalFlow
                | ScopeError::ContextResolved { .. }
                | ScopeError::HandleInUse { .. }
        )
    }

    /// 若为顺序违规，返回具体子类。
    pub fn order_violation(&self) -> Option<&OrderViolation> {
        match self {
            ScopeError::OrderViolation(violation) => Some(violation),
            _ => None,
        }
    }

    /// 若为回调聚合失败，返回聚合错误。
    pub fn callbacks(&self) -> Option<&AggregateCallbackError> {
        match self {
            ScopeError::Callbacks(aggregate) => Some(aggregate),
            _ => None,
        }
    }

    /// 取回驱动原始错误；非驱动错误原样返回。
    pub fn into_driver_error(self) -> Result<BoxError, Self> {
        match self {
            ScopeError::Driver { source, .. } => Ok(source),
            other => Err(other),
        }
    }
}

/// 顺序违规的细分类别。
///
/// - **契约 (What)**：违规被检测到时环境状态保持不变；
/// - **注意事项**：`ambient` 字段记录检测时的环境作用域，便于排查是哪一层仍未释放。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OrderViolation {
    /// 目标不是调用流的环境作用域。
    #[error("only the ambient scope may be disposed; {scope} is not ambient (ambient: {})", DisplayScope(.ambient))]
    NotAmbient {
        scope: ScopeId,
        ambient: Option<ScopeId>,
    },

    /// 目标仍有未销毁的子作用域（可能位于其它流）。
    #[error("{scope} still has {live} live nested scope(s)")]
    LiveDescendants { scope: ScopeId, live: usize },

    /// 目标已被销毁。
    #[error("{scope} has already been disposed")]
    Disposed { scope: ScopeId },

    /// 对非分离式作用域执行附加。
    #[error("{scope} was not created as a detached scope")]
    NotDetachable { scope: ScopeId },

    /// 分离式作用域已附加在某个流上。
    #[error("{scope} is already attached")]
    AlreadyAttached { scope: ScopeId },

    /// 当前流没有可分离的作用域。
    #[error("nothing detachable is attached to the current flow")]
    NothingAttached,

    /// 最近附加的作用域之上仍嵌套着存活的作用域。
    #[error("cannot detach {attached} while something is nested on top (ambient: {}, live nested: {live})", DisplayScope(.ambient))]
    NestedOnTop {
        attached: ScopeId,
        ambient: Option<ScopeId>,
        live: usize,
    },

    /// 作用域属于另一个管理器。
    #[error("{scope} belongs to a different scope manager")]
    ForeignScope { scope: ScopeId },
}

struct DisplayScope<'a>(&'a Option<ScopeId>);

impl fmt::Display for DisplayScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(scope) => write!(f, "{scope}"),
            None => f.write_str("none"),
        }
    }
}

/// 驱动调用阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverStage {
    Open,
    Commit,
    Rollback,
    Close,
}

impl fmt::Display for DriverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverStage::Open => "open",
            DriverStage::Commit => "commit",
            DriverStage::Rollback => "roll back",
            DriverStage::Close => "close",
        })
    }
}

/// 单个完成回调的失败记录。
#[derive(Debug, Error)]
#[error("completion callback `{name}` {fault}")]
pub struct CallbackFailure {
    name: Cow<'static, str>,
    #[source]
    fault: CallbackFault,
}

impl CallbackFailure {
    pub(crate) fn new(name: Cow<'static, str>, fault: CallbackFault) -> Self {
        Self { name, fault }
    }

    /// 登记时提供的回调名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 失败原因。
    pub fn fault(&self) -> &CallbackFault {
        &self.fault
    }
}

/// 回调失败的原因。
#[derive(Debug, Error)]
pub enum CallbackFault {
    /// 回调返回了错误。
    #[error("returned an error: {0}")]
    Failed(#[source] BoxError),

    /// 回调发生 panic（仅在 `catch_callback_panics` 开启时捕获）。
    #[error("panicked: {0}")]
    Panicked(String),

    /// 单次解析执行的回调数超过上限，剩余回调被丢弃。
    #[error("exceeded the limit of {limit} callbacks per resolution; {dropped} callback(s) dropped")]
    LimitExceeded { limit: usize, dropped: usize },
}

/// 最外层作用域解析时的聚合回调错误。
///
/// # 教案式说明
/// - **契约 (What)**：只在全部回调执行完毕、环境作用域与上下文已清空之后才构造；
///   `outcome` 为回调观察到的最终结果，`failures` 按执行顺序排列。
/// - **注意事项**：该错误不改变已经做出的提交/回滚决策。
#[derive(Debug)]
pub struct AggregateCallbackError {
    outcome: bool,
    failures: Vec<CallbackFailure>,
}

impl AggregateCallbackError {
    pub(crate) fn new(outcome: bool, failures: Vec<CallbackFailure>) -> Self {
        Self { outcome, failures }
    }

    /// 回调观察到的最终结果。
    pub fn outcome(&self) -> bool {
        self.outcome
    }

    /// 失败明细。
    pub fn failures(&self) -> &[CallbackFailure] {
        &self.failures
    }

    /// 失败数量。
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// 是否为空（正常构造路径下不会为空）。
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// 取出失败明细。
    pub fn into_failures(self) -> Vec<CallbackFailure> {
        self.failures
    }
}

impl fmt::Display for AggregateCallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completion callback(s) failed after resolving with outcome={}: ",
            self.failures.len(),
            self.outcome
        )?;
        for (index, failure) in self.failures.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "`{}`", failure.name)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateCallbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|failure| failure as &(dyn std::error::Error + 'static))
    }
}
