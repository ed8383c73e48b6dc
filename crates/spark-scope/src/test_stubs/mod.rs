//! 作用域契约测试使用的桩实现集合。
//!
//! # 设计定位（Why）
//! - 单元测试、契约测试、基准测试都需要一个满足 [`TransactionalResource`](crate::TransactionalResource)
//!   契约、又能观察提交/回滚次数的资源；集中在此处定义，避免各测试文件重复实现；
//! - 桩对象支持故障注入，便于验证驱动错误的传播路径。
//!
//! # 使用方式（How）
//! - `use spark_scope::test_stubs::memory::MemoryDatabase;`，以 `ScopeManager::new(db.clone())` 构造管理器，
//!   再通过 [`MemoryDatabase::stats`](memory::MemoryDatabase::stats) 断言驱动调用次数。
//!
//! # 风险与权衡（Trade-offs）
//! - 内存库没有隔离级别，未提交写入只对持有同一事务的句柄可见；不适合验证并发可见性语义。

pub mod memory;
