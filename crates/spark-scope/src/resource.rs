//! # 事务资源能力
//!
//! ## 定位（Why）
//! - 作用域管理器不关心底层是哪种数据库驱动，只消费“打开事务 + 提交/回滚/关闭”这一最小能力；
//! - 句柄由链上第一个请求它的作用域打开并独占“所有者”身份，后代作用域共享同一句柄。
//!
//! ## 契约（What）
//! - [`TransactionalResource::open`] 打开新事务；驱动错误以 [`BoxError`] 原样上抛；
//! - [`Transaction`] 的 `commit`/`rollback` 只会被调用其一，随后必定调用 `close`；
//! - 所有者销毁后，所有克隆的 [`ResourceHandle`] 访问均返回 [`ScopeError::DisposedResource`]。
//!
//! ## 实现（How）
//! - 事务放在 `parking_lot::ReentrantMutex<RefCell<_>>` 中：跨线程访问互斥，同一线程在 `with`
//!   闭包内再次获取句柄、创建嵌套作用域都不会自锁；
//! - “是否仍打开”由独立的原子标记表示，祖先句柄查找与共享无需触碰事务锁；
//! - 同一线程的重入独占（嵌套 `with`、在 `with` 内销毁所有者）返回 [`ScopeError::HandleInUse`]；
//!   后一种情况下事务在外层 `with` 返回时被回滚并关闭。

use std::{
    cell::RefCell,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::ReentrantMutex;
use tracing::warn;

use crate::{
    arena::ScopeId,
    error::{BoxError, DriverStage, ScopeError},
};

/// 驱动侧的一次事务。
pub trait Transaction: Send + 'static {
    /// 提交全部写入。
    fn commit(&mut self) -> Result<(), BoxError>;

    /// 放弃全部写入。
    fn rollback(&mut self) -> Result<(), BoxError>;

    /// 释放底层连接；无论提交或回滚是否成功都会调用。
    fn close(self) -> Result<(), BoxError>;
}

/// 可以打开事务的资源（连接池、数据源等）。
///
/// # 教案式说明
/// - **意图 (Why)**：把“如何获得连接”留给宿主，作用域只决定“何时提交、何时回滚”；
/// - **契约 (What)**：`open` 可能在任意线程被调用，但调用时管理器内部锁一定已经释放；
/// - **风险 (Trade-offs)**：实现不应在 `open` 中访问同一个管理器的环境作用域，否则可能观察到半创建状态。
pub trait TransactionalResource: Send + Sync + 'static {
    type Transaction: Transaction;

    /// 打开一次新事务。
    fn open(&self) -> Result<Self::Transaction, BoxError>;
}

impl<R> TransactionalResource for Arc<R>
where
    R: TransactionalResource + ?Sized,
{
    type Transaction = R::Transaction;

    fn open(&self) -> Result<Self::Transaction, BoxError> {
        (**self).open()
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// 资源句柄标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// 所有者与共享者共同持有的事务单元格；槽位为 `None` 表示已结束。
pub(crate) struct HandleCell<T> {
    id: HandleId,
    owner: ScopeId,
    open: AtomicBool,
    slot: ReentrantMutex<RefCell<Option<T>>>,
}

impl<T> HandleCell<T> {
    /// 不获取事务锁，`with` 闭包内部调用也不会阻塞。
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn owner(&self) -> ScopeId {
        self.owner
    }
}

impl<T: Transaction> HandleCell<T> {
    pub(crate) fn new(owner: ScopeId, transaction: T) -> Self {
        Self {
            id: HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)),
            owner,
            open: AtomicBool::new(true),
            slot: ReentrantMutex::new(RefCell::new(Some(transaction))),
        }
    }

    /// 结束事务：先提交或回滚，再关闭。
    ///
    /// 提交/回滚失败时仍然关闭；两者都失败时返回前者。重复调用返回 `Ok(())`。
    /// 同一线程的 `with` 闭包仍在使用事务时返回 [`ScopeError::HandleInUse`]，
    /// 句柄立即失效，事务留待该闭包返回后回滚。
    pub(crate) fn finalize(&self, commit: bool) -> Result<(), ScopeError> {
        let taken = {
            let guard = self.slot.lock();
            let Ok(mut slot) = guard.try_borrow_mut() else {
                self.open.store(false, Ordering::Release);
                return Err(ScopeError::HandleInUse { handle: self.id });
            };
            let taken = slot.take();
            self.open.store(false, Ordering::Release);
            taken
        };
        match taken {
            Some(transaction) => conclude(transaction, commit),
            None => Ok(()),
        }
    }

    /// `with` 返回后回收被推迟结束的事务。
    fn reclaim_abandoned(&self, slot: &RefCell<Option<T>>) {
        if self.is_open() {
            return;
        }
        let Some(transaction) = slot.borrow_mut().take() else {
            return;
        };
        if let Err(err) = conclude(transaction, false) {
            warn!(handle = %self.id, error = %err, "driver failed while rolling back an abandoned transaction");
        }
    }
}

fn conclude<T: Transaction>(mut transaction: T, commit: bool) -> Result<(), ScopeError> {
    let decided = if commit {
        transaction
            .commit()
            .map_err(|source| ScopeError::driver(DriverStage::Commit, source))
    } else {
        transaction
            .rollback()
            .map_err(|source| ScopeError::driver(DriverStage::Rollback, source))
    };
    let closed = transaction
        .close()
        .map_err(|source| ScopeError::driver(DriverStage::Close, source));
    decided.and(closed)
}

/// 调用方持有的事务句柄。
///
/// `Clone` 共享同一个底层事务；链释放后所有克隆同时失效。
pub struct ResourceHandle<T> {
    cell: Arc<HandleCell<T>>,
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Transaction> ResourceHandle<T> {
    pub(crate) fn new(cell: Arc<HandleCell<T>>) -> Self {
        Self { cell }
    }

    /// 在事务上执行闭包。
    ///
    /// # 契约
    /// - 闭包执行期间持有句柄锁，其它线程上共享者的访问会阻塞；
    /// - 闭包内可以创建嵌套作用域并取得它们的句柄，但再次对同一事务调用 `with`
    ///   返回 [`ScopeError::HandleInUse`]；
    /// - 所属链已释放时返回 [`ScopeError::DisposedResource`]，闭包不会执行。
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, ScopeError> {
        let guard = self.cell.slot.lock();
        let result = {
            let Ok(mut slot) = guard.try_borrow_mut() else {
                return Err(ScopeError::HandleInUse { handle: self.cell.id });
            };
            match slot.as_mut() {
                Some(transaction) if self.cell.is_open() => Ok(f(transaction)),
                _ => Err(ScopeError::DisposedResource {
                    scope: self.cell.owner,
                }),
            }
        };
        self.cell.reclaim_abandoned(&guard);
        result
    }

    pub fn id(&self) -> HandleId {
        self.cell.id()
    }

    /// 打开该事务、负责最终提交/回滚的作用域。
    pub fn owner(&self) -> ScopeId {
        self.cell.owner()
    }

    pub fn is_open(&self) -> bool {
        self.cell.is_open()
    }

    /// 两个句柄是否指向同一个事务。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: Transaction> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.cell.id)
            .field("owner", &self.cell.owner)
            .field("open", &self.is_open())
            .finish()
    }
}
