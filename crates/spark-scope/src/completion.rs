//! # 完成上下文（Completion Context）
//!
//! ## 定位（Why）
//! - 一条作用域链共享一个完成上下文，调用方在任意深度登记“链最终解析后执行”的回调；
//! - 上下文独立于单个作用域存活，直到最外层作用域解析并把回调队列清空。
//!
//! ## 行为契约（What）
//! - 状态机：`Pending` → `Resolving(outcome)` → `Resolved(outcome)`；
//! - 回调按登记顺序执行；回调执行期间登记的新回调追加到同一队列，并在本轮解析结束前执行；
//! - 单个回调失败（返回错误或 panic）只会被收集，其余回调照常执行；
//! - 解析完成后再登记返回 [`ScopeError::ContextResolved`]。
//!
//! ## 实现（How）
//! - 队列以 `VecDeque` 作为工作队列，每次加锁弹出一个回调、解锁后执行，直到队列为空；
//! - “队列为空”与“标记为已解析”在同一临界区完成，其它线程不会在两者之间插入回调。

use std::{
    any::Any,
    borrow::Cow,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::error::{BoxError, CallbackFailure, CallbackFault, ScopeError};

type Callback = Box<dyn FnOnce(bool) -> Result<(), BoxError> + Send + 'static>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 完成上下文的进程内唯一标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// 原始数值。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Pending,
    Resolving(bool),
    Resolved(bool),
}

struct Enlisted {
    name: Cow<'static, str>,
    action: Callback,
}

struct ContextState {
    phase: Phase,
    queue: VecDeque<Enlisted>,
}

struct ContextInner {
    id: ContextId,
    state: Mutex<ContextState>,
}

/// 解析回调时的执行策略，由 `ScopeSettings` 派生。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResolvePolicy {
    pub(crate) catch_panics: bool,
    pub(crate) limit: Option<usize>,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            catch_panics: true,
            limit: None,
        }
    }
}

/// 作用域链共享的完成回调容器。
///
/// # 教案式说明
/// - **契约 (What)**：`Clone` 只复制引用，所有克隆指向同一个队列；相等性按引用身份判定，
///   可用 [`CompletionContext::ptr_eq`] 或 `==` 校验“恢复的是同一个上下文”；
/// - **线程安全**：内部使用 `parking_lot::Mutex`，可在任意线程登记回调；
/// - **注意事项 (Trade-offs)**：回调执行时不持有锁，回调内部可以继续登记、甚至创建新的作用域链。
#[derive(Clone)]
pub struct CompletionContext {
    inner: Arc<ContextInner>,
}

impl CompletionContext {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
                state: Mutex::new(ContextState {
                    phase: Phase::Pending,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// 上下文标识。
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// 登记一个在链解析后执行的回调。
    ///
    /// # 参数与契约
    /// - `name`：回调名称，出现在失败记录与日志中；
    /// - `action`：接收最终结果（`true` 表示已提交/整体完成）的一次性动作；
    /// - **前置条件**：上下文尚未解析完毕；解析进行中（回调内部）登记是允许的；
    /// - **后置条件**：回调恰好执行一次，或在强制清理且关闭回调执行时被丢弃。
    pub fn enlist<F, E>(&self, name: impl Into<Cow<'static, str>>, action: F) -> Result<(), ScopeError>
    where
        F: FnOnce(bool) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let mut state = self.inner.state.lock();
        if let Phase::Resolved(_) = state.phase {
            return Err(ScopeError::ContextResolved {
                context: self.inner.id,
            });
        }
        state.queue.push_back(Enlisted {
            name: name.into(),
            action: Box::new(move |outcome| action(outcome).map_err(Into::into)),
        });
        Ok(())
    }

    /// 尚未执行的回调数量。
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// 是否没有待执行的回调。
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().queue.is_empty()
    }

    /// 待执行回调的名称，按执行顺序排列。
    pub fn callback_names(&self) -> Vec<Cow<'static, str>> {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// 解析中或已解析时的最终结果。
    pub fn outcome(&self) -> Option<bool> {
        match self.inner.state.lock().phase {
            Phase::Pending => None,
            Phase::Resolving(outcome) | Phase::Resolved(outcome) => Some(outcome),
        }
    }

    /// 是否已完成解析。
    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Resolved(_))
    }

    /// 引用身份比较。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 以给定结果解析上下文，排空回调队列。
    ///
    /// 重复解析或重入解析不会再次执行任何回调，返回空列表。
    pub(crate) fn resolve(&self, outcome: bool, policy: ResolvePolicy) -> Vec<CallbackFailure> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Pending {
                return Vec::new();
            }
            state.phase = Phase::Resolving(outcome);
        }

        let mut failures = Vec::new();
        let mut executed = 0usize;
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                if let Some(limit) = policy.limit
                    && executed >= limit
                    && !state.queue.is_empty()
                {
                    let dropped = state.queue.len();
                    state.queue.clear();
                    state.phase = Phase::Resolved(outcome);
                    failures.push(CallbackFailure::new(
                        Cow::Borrowed("callback_limit"),
                        CallbackFault::LimitExceeded { limit, dropped },
                    ));
                    break;
                }
                match state.queue.pop_front() {
                    Some(entry) => entry,
                    None => {
                        state.phase = Phase::Resolved(outcome);
                        break;
                    }
                }
            };
            executed += 1;
            if let Err(fault) = invoke(next.action, outcome, policy.catch_panics) {
                failures.push(CallbackFailure::new(next.name, fault));
            }
        }
        failures
    }

    /// 丢弃全部回调并以 `false` 结束上下文，不执行任何回调。返回被丢弃的数量。
    pub(crate) fn discard(&self) -> usize {
        let dropped = {
            let mut state = self.inner.state.lock();
            if let Phase::Resolved(_) = state.phase {
                return 0;
            }
            state.phase = Phase::Resolved(false);
            std::mem::take(&mut state.queue)
        };
        dropped.len()
    }
}

fn invoke(action: Callback, outcome: bool, catch_panics: bool) -> Result<(), CallbackFault> {
    if !catch_panics {
        return action(outcome).map_err(CallbackFault::Failed);
    }
    match panic::catch_unwind(AssertUnwindSafe(|| action(outcome))) {
        Ok(result) => result.map_err(CallbackFault::Failed),
        Err(payload) => Err(CallbackFault::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl PartialEq for CompletionContext {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for CompletionContext {}

impl fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionContext")
            .field("id", &self.inner.id)
            .field("phase", &state.phase)
            .field("queued", &state.queue.len())
            .finish()
    }
}
