//! 提交/回滚决策契约：当且仅当所有者子树全部完成时提交。

mod support;

use spark_scope::{DriverStage, ScopeError};

use support::{Recorder, manager};

#[test]
fn completed_chain_commits_and_is_observed_by_a_fresh_scope() {
    let (db, manager) = manager();
    let scope = manager.create_scope().unwrap();
    scope
        .resource_handle()
        .unwrap()
        .with(|tx| tx.put("account:7", "open"))
        .unwrap();
    scope.mark_complete().unwrap();
    scope.dispose().unwrap();

    let fresh = manager.create_scope().unwrap();
    let seen = fresh
        .resource_handle()
        .unwrap()
        .with(|tx| tx.get("account:7"))
        .unwrap();
    assert_eq!(seen.as_deref(), Some("open"));
    fresh.dispose().unwrap();
    assert_eq!(db.stats().committed, 1);
    assert_eq!(db.stats().rolled_back, 1, "未标记完成的只读作用域回滚");
}

#[test]
fn incomplete_chain_rolls_back() {
    let (db, manager) = manager();
    let scope = manager.create_scope().unwrap();
    scope
        .resource_handle()
        .unwrap()
        .with(|tx| tx.put("account:7", "open"))
        .unwrap();
    scope.dispose().unwrap();

    assert_eq!(db.get("account:7"), None);
    assert_eq!(db.stats().rolled_back, 1);
    assert_eq!(db.stats().open_transactions(), 0);
}

#[test]
fn one_incomplete_descendant_rolls_back_the_whole_chain() {
    let (db, manager) = manager();
    let recorder = Recorder::new();
    let root = manager.create_scope().unwrap();
    root.resource_handle()
        .unwrap()
        .with(|tx| tx.put("k", "v"))
        .unwrap();
    recorder.enlist(&root.context().unwrap(), "after");

    let failed = manager.create_scope().unwrap();
    failed.dispose().unwrap();
    let succeeded = manager.create_scope().unwrap();
    succeeded.mark_complete().unwrap();
    succeeded.dispose().unwrap();

    root.mark_complete().unwrap();
    root.dispose().unwrap();
    assert_eq!(db.get("k"), None, "任一后代未完成则整体回滚");
    assert_eq!(recorder.entries(), vec![("after".to_owned(), false)]);
}

#[test]
fn failing_governed_block_after_a_completed_one_rolls_back() {
    let (db, manager) = manager();
    let recorder = Recorder::new();
    let outer = manager.create_scope().unwrap();
    outer.resource_handle().unwrap();
    recorder.enlist(&outer.context().unwrap(), "notify");

    manager
        .run(|scope| -> Result<(), ScopeError> {
            scope.resource_handle()?.with(|tx| tx.put("step:1", "done"))?;
            Ok(())
        })
        .expect("第一个代码块成功");
    let failed: Result<(), ScopeError> = manager.run(|scope| {
        scope.resource_handle()?.with(|tx| tx.put("step:2", "done"))?;
        Err(ScopeError::NoLogicalFlow)
    });
    assert!(failed.is_err());

    outer.mark_complete().unwrap();
    outer.dispose().unwrap();
    assert!(db.is_empty());
    assert_eq!(recorder.outcomes(), vec![false]);
}

#[test]
fn descendants_share_the_owner_handle() {
    let (db, manager) = manager();
    let root = manager.create_scope().unwrap();
    let owned = root.resource_handle().unwrap();
    let child = manager.create_scope().unwrap();
    let shared = child.resource_handle().unwrap();
    assert!(owned.ptr_eq(&shared));
    assert!(root.is_owner());
    assert!(!child.is_owner());

    child.mark_complete().unwrap();
    child.dispose().unwrap();
    assert!(owned.is_open(), "非所有者销毁不结束事务");
    root.mark_complete().unwrap();
    root.dispose().unwrap();
    assert_eq!(db.stats().opened, 1);
    assert_eq!(db.stats().committed, 1);
}

#[test]
fn handles_fail_after_the_owner_disposed() {
    let (_, manager) = manager();
    let root = manager.create_scope().unwrap();
    let handle = root.resource_handle().unwrap();
    root.dispose().unwrap();

    let err = handle.with(|tx| tx.pending_writes()).expect_err("释放后访问必须失败");
    assert!(matches!(err, ScopeError::DisposedResource { scope } if scope == root.id()));
    let err = root.resource_handle().expect_err("已销毁作用域不可再取句柄");
    assert_eq!(err.code(), "scope.disposed_resource");
}

#[test]
fn commit_failure_surfaces_after_cleanup_and_flips_the_outcome() {
    let (db, manager) = manager();
    let recorder = Recorder::new();
    let root = manager.create_scope().unwrap();
    root.resource_handle()
        .unwrap()
        .with(|tx| tx.put("k", "v"))
        .unwrap();
    recorder.enlist(&root.context().unwrap(), "after");
    root.mark_complete().unwrap();
    db.fail_next_commit();

    let err = root.dispose().expect_err("注入的提交失败应上抛");
    assert!(matches!(
        err,
        ScopeError::Driver {
            stage: DriverStage::Commit,
            ..
        }
    ));
    assert!(manager.current_scope().is_none(), "错误返回前已完成清理");
    assert_eq!(db.stats().closed, 1);
    assert_eq!(recorder.outcomes(), vec![false], "提交失败视为未完成");
    assert!(err.into_driver_error().is_ok());
}

#[test]
fn close_failure_is_reported_without_undoing_the_commit() {
    let (db, manager) = manager();
    let recorder = Recorder::new();
    let root = manager.create_scope().unwrap();
    root.resource_handle()
        .unwrap()
        .with(|tx| tx.put("k", "v"))
        .unwrap();
    recorder.enlist(&root.context().unwrap(), "after");
    root.mark_complete().unwrap();
    db.fail_next_close();

    let err = root.dispose().expect_err("关闭失败应上抛");
    assert!(matches!(
        err,
        ScopeError::Driver {
            stage: DriverStage::Close,
            ..
        }
    ));
    assert_eq!(db.get("k").as_deref(), Some("v"));
    assert_eq!(recorder.outcomes(), vec![true]);
}

#[test]
fn nested_scopes_reach_the_shared_handle_from_inside_with() {
    let (db, manager) = manager();
    let outer = manager.create_scope().unwrap();
    let handle = outer.resource_handle().unwrap();

    let nested = handle
        .with(|tx| {
            tx.put("outer", "1");
            manager.run(|inner| {
                let shared = inner.resource_handle()?;
                assert!(shared.ptr_eq(&handle), "嵌套作用域共享外层句柄");
                assert!(shared.is_open());
                Ok::<_, ScopeError>(shared.with(|_| ()))
            })
        })
        .expect("外层 with 成功")
        .expect("嵌套受治理代码块成功");
    let err = nested.expect_err("同一线程重入同一事务");
    assert_eq!(err.code(), "scope.handle_in_use");

    handle.with(|tx| tx.put("inner", "2")).unwrap();
    outer.mark_complete().unwrap();
    outer.dispose().unwrap();
    assert_eq!(db.stats().committed, 1);
    assert_eq!(db.get("outer").as_deref(), Some("1"));
    assert_eq!(db.get("inner").as_deref(), Some("2"));
}
