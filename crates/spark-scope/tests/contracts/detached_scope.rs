//! 分离式作用域契约：显式附加/分离，分离后恢复附加前的帧。

mod support;

use spark_scope::{OrderViolation, ScopeKind};

use support::{Recorder, manager};

#[test]
fn detach_is_rejected_while_a_child_is_nested_on_top() {
    let (_, manager) = manager();
    let prior = manager.create_scope().unwrap();
    let prior_context = manager.current_context().unwrap();

    let detached = manager.create_detached_scope();
    assert_eq!(detached.kind(), ScopeKind::Detached);
    assert!(detached.is_detachable());
    assert!(manager.current_scope() == Some(prior.clone()), "创建分离式作用域不改变环境");

    manager.attach_scope(&detached).unwrap();
    assert_eq!(manager.current_scope(), Some(detached.clone()));
    let child = manager.create_scope().unwrap();
    assert_eq!(child.parent(), Some(detached.id()));

    let err = manager.detach_scope().expect_err("子作用域存活时不可分离");
    assert_eq!(
        err.order_violation(),
        Some(&OrderViolation::NestedOnTop {
            attached: detached.id(),
            ambient: Some(child.id()),
            live: 1,
        })
    );

    child.dispose().unwrap();
    let returned = manager.detach_scope().expect("子作用域销毁后可以分离");
    assert_eq!(returned, detached);
    assert_eq!(manager.current_scope(), Some(prior.clone()));
    assert!(
        manager.current_context().unwrap().ptr_eq(&prior_context),
        "分离后恢复同一个上下文实例"
    );
    assert!(!detached.is_disposed(), "分离后的作用域仍然可用");

    prior.dispose().unwrap();
}

#[test]
fn attach_validates_the_target() {
    let (_, manager) = manager();
    let nested = manager.create_scope().unwrap();
    let err = manager.attach_scope(&nested).expect_err("普通作用域不可附加");
    assert_eq!(
        err.order_violation(),
        Some(&OrderViolation::NotDetachable { scope: nested.id() })
    );
    nested.dispose().unwrap();

    let detached = manager.create_detached_scope();
    manager.attach_scope(&detached).unwrap();
    let err = manager.attach_scope(&detached).expect_err("重复附加必须失败");
    assert_eq!(
        err.order_violation(),
        Some(&OrderViolation::AlreadyAttached { scope: detached.id() })
    );
    manager.detach_scope().unwrap();

    let err = manager.detach_scope().expect_err("没有附加的作用域");
    assert_eq!(err.order_violation(), Some(&OrderViolation::NothingAttached));
}

#[test]
fn disposing_an_attached_scope_self_detaches_and_resolves_its_context() {
    let (db, manager) = manager();
    let recorder = Recorder::new();
    let prior = manager.create_scope().unwrap();

    let detached = manager.create_detached_scope();
    manager.attach_scope(&detached).unwrap();
    detached
        .resource_handle()
        .unwrap()
        .with(|tx| tx.put("job:1", "queued"))
        .unwrap();
    recorder.enlist(&detached.context().unwrap(), "job-done");
    detached.mark_complete().unwrap();
    detached.dispose().unwrap();

    assert_eq!(recorder.entries(), vec![("job-done".to_owned(), true)]);
    assert_eq!(db.get("job:1").as_deref(), Some("queued"));
    assert_eq!(manager.current_scope(), Some(prior.clone()), "自动分离恢复先前帧");
    prior.dispose().unwrap();
}

#[test]
fn detached_scope_can_be_reattached_later_and_keeps_its_handle() {
    let (db, manager) = manager();
    let detached = manager.create_detached_scope();

    manager.attach_scope(&detached).unwrap();
    let first = detached.resource_handle().unwrap();
    first.with(|tx| tx.put("draft", "v1")).unwrap();
    manager.detach_scope().unwrap();
    assert!(manager.current_scope().is_none());

    manager.attach_scope(&detached).unwrap();
    let second = detached.resource_handle().unwrap();
    assert!(first.ptr_eq(&second));
    detached.mark_complete().unwrap();
    detached.dispose().unwrap();
    assert_eq!(db.get("draft").as_deref(), Some("v1"));
    assert_eq!(db.stats().opened, 1);
}

#[test]
fn disposing_an_unattached_detached_scope_is_rejected() {
    let (_, manager) = manager();
    let detached = manager.create_detached_scope();
    let err = detached.dispose().expect_err("未附加时不是环境作用域");
    assert!(matches!(
        err.order_violation(),
        Some(OrderViolation::NotAmbient { ambient: None, .. })
    ));
}
