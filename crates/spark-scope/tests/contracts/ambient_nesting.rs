//! 环境作用域嵌套契约：LIFO 展开、上下文继承与多管理器隔离。

mod support;

use spark_scope::{ScopeError, ScopeKind, ScopeManager, test_stubs::memory::MemoryDatabase};

use support::manager;

#[test]
fn full_unwind_empties_ambient_state_at_every_depth() {
    let (_, manager) = manager();
    for depth in 1..=8 {
        let mut stack = Vec::new();
        for _ in 0..depth {
            let scope = manager.create_scope().expect("创建作用域不应失败");
            assert_eq!(manager.current_scope().as_ref(), Some(&scope));
            stack.push(scope);
        }
        let root_context = stack[0].context().expect("根作用域存活");

        while let Some(scope) = stack.pop() {
            assert_eq!(
                manager.current_context().as_ref(),
                Some(&root_context),
                "最外层销毁前环境上下文保持不变"
            );
            scope.dispose().expect("按 LIFO 顺序销毁应成功");
            assert_eq!(manager.current_scope(), stack.last().cloned());
        }
        assert!(manager.current_scope().is_none());
        assert!(manager.current_context().is_none());
        assert!(root_context.is_resolved());
    }
    assert_eq!(manager.live_scopes(), 0);
}

#[test]
fn nested_scopes_inherit_the_chain_context() {
    let (_, manager) = manager();
    let root = manager.create_scope().unwrap();
    let child = manager.create_scope().unwrap();
    let grandchild = manager.create_scope().unwrap();

    assert_eq!(root.parent(), None);
    assert_eq!(child.parent(), Some(root.id()));
    assert_eq!(grandchild.parent(), Some(child.id()));
    assert_eq!(root.kind(), ScopeKind::Nested);
    let context = root.context().unwrap();
    assert!(context.ptr_eq(&grandchild.context().unwrap()));

    grandchild.dispose().unwrap();
    child.dispose().unwrap();
    root.dispose().unwrap();

    let next = manager.create_scope().unwrap();
    assert!(
        !next.context().unwrap().ptr_eq(&context),
        "新链必须分配新的完成上下文"
    );
    next.dispose().unwrap();
}

#[test]
fn managers_keep_independent_ambient_state() {
    let (_, orders) = manager();
    let (_, billing) = manager();

    let order_scope = orders.create_scope().unwrap();
    assert!(billing.current_scope().is_none());
    let billing_scope = billing.create_scope().unwrap();
    assert_eq!(billing_scope.parent(), None);

    order_scope.dispose().expect("不同管理器的作用域互不构成嵌套");
    billing_scope.dispose().unwrap();
}

#[test]
fn scopes_of_another_manager_cannot_be_attached() {
    let (_, first) = manager();
    let second = ScopeManager::new(MemoryDatabase::new());
    let detached = second.create_detached_scope();
    let err = first.attach_scope(&detached).expect_err("跨管理器附加必须失败");
    assert!(matches!(
        err.order_violation(),
        Some(spark_scope::OrderViolation::ForeignScope { .. })
    ));
}

#[test]
fn reset_ambient_forgets_the_current_flow() {
    let (_, manager) = manager();
    let scope = manager.create_scope().unwrap();
    manager.reset_ambient();
    assert!(manager.current_scope().is_none());

    let err = scope.dispose().expect_err("复位后该作用域不再是环境作用域");
    assert_eq!(err.code(), "scope.order_violation");
    assert!(!scope.is_disposed(), "复位只清空环境状态，不移除记录");
}

#[test]
fn frames_cleared_by_another_flow_are_pruned() {
    let (_, manager) = manager();
    let scope = manager.create_scope().unwrap();
    let snapshot = manager.capture_flow();

    std::thread::scope(|s| {
        s.spawn(|| {
            let _guard = snapshot.enter();
            let report = manager
                .scope_reference()
                .release()
                .expect("没有回调与句柄时清理不应失败");
            assert_eq!(report.scopes, 1);
        })
        .join()
        .unwrap();
    });

    assert!(scope.is_disposed());
    assert!(manager.current_scope().is_none(), "失效帧应被裁剪");
    let fresh = manager.create_scope().unwrap();
    assert_eq!(fresh.parent(), None, "裁剪后从新链开始");
    fresh.dispose().unwrap();

    let err = scope.dispose().expect_err("已强制清理的作用域不可再销毁");
    assert!(matches!(err, ScopeError::OrderViolation(_)));
}
