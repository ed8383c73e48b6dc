//! 跨执行流传播契约：默认隔离，显式传播，迁移的作用域跟随逻辑流跨越工作线程。

mod support;

use std::time::Duration;

use spark_scope::{ScopeError, ScopeOptions, ScopeSettings, Slot, in_logical_flow, logical_flow};

use support::{manager, manager_with};

#[tokio::test]
async fn isolated_tasks_never_see_thread_leftovers() {
    let (_, manager) = manager();
    let scope = manager.create_scope().unwrap();
    assert_eq!(manager.active_slot(), Slot::Local);

    let task_manager = manager.clone();
    let seen = manager
        .spawn_isolated(async move {
            assert!(in_logical_flow());
            task_manager.current_scope().map(|scope| scope.id())
        })
        .await
        .expect("任务不应 panic");
    assert_eq!(seen, None, "单线程运行时上同一线程的本地状态也不可见");

    scope.dispose().unwrap();
}

#[tokio::test]
async fn propagated_tasks_nest_under_the_callers_scope() {
    let (db, manager) = manager();
    let root = manager.create_scope().unwrap();
    root.resource_handle().unwrap();

    let task_manager = manager.clone();
    let root_id = root.id();
    let child = manager
        .spawn_propagated(async move {
            let child = task_manager.create_scope().unwrap();
            assert_eq!(child.parent(), Some(root_id));
            child
                .resource_handle()
                .unwrap()
                .with(|tx| tx.put("from-task", "yes"))
                .unwrap();
            child.mark_complete().unwrap();
            child.dispose().unwrap();
            child.id()
        })
        .await
        .unwrap();
    assert_ne!(child, root_id);

    root.mark_complete().unwrap();
    root.dispose().unwrap();
    assert_eq!(db.get("from-task").as_deref(), Some("yes"), "子任务共享所有者句柄");
}

#[tokio::test]
async fn caller_cannot_dispose_while_a_propagated_child_is_open() {
    let (_, manager) = manager();
    let root = manager.create_scope().unwrap();
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let task_manager = manager.clone();
    let task = manager.spawn_propagated(async move {
        let child = task_manager.create_scope().unwrap();
        ready_tx.send(()).unwrap();
        release_rx.await.unwrap();
        child.dispose()
    });

    ready_rx.await.unwrap();
    let err = root.dispose().expect_err("其它任务中的子作用域仍存活");
    assert_eq!(err.code(), "scope.order_violation");

    release_tx.send(()).unwrap();
    task.await.unwrap().expect("子任务销毁自己的作用域");
    root.dispose().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn migrated_scopes_survive_awaits_across_worker_threads() {
    let (db, manager) = manager();
    let task_manager = manager.clone();
    tokio::spawn(logical_flow(async move {
        task_manager
            .run_async(|scope| async move {
                for round in 0..16 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    tokio::task::yield_now().await;
                    assert_eq!(
                        scope.manager().current_scope(),
                        Some(scope.clone()),
                        "第 {round} 轮后环境作用域应保持"
                    );
                }
                scope
                    .resource_handle()?
                    .with(|tx| tx.put("migrated", "ok"))?;
                Ok::<_, ScopeError>(())
            })
            .await
    }))
    .await
    .unwrap()
    .unwrap();

    assert_eq!(db.get("migrated").as_deref(), Some("ok"));
    assert_eq!(manager.live_scopes(), 0);
}

#[tokio::test]
async fn migrated_state_does_not_flow_into_sibling_tasks() {
    let (_, manager) = manager();
    logical_flow(async {
        let scope = manager
            .create_scope_with(spark_scope::ScopeOptions::new().migrate(true))
            .unwrap();
        assert_eq!(manager.active_slot(), Slot::Migrated);

        let sibling_manager = manager.clone();
        let seen = tokio::spawn(async move { sibling_manager.current_scope().is_some() })
            .await
            .unwrap();
        assert!(!seen, "兄弟任务不继承迁移槽位");

        scope.dispose().unwrap();
        assert_eq!(manager.active_slot(), Slot::Local, "链结束后迁移条目被移除");
    })
    .await;
}

#[tokio::test]
async fn snapshot_scope_runs_a_future_under_the_captured_frame() {
    let (_, manager) = manager();
    let root = manager.create_scope().unwrap();
    let snapshot = manager.capture_flow();
    assert_eq!(snapshot.current_scope_id(), Some(root.id()));

    let seen = snapshot
        .scope(async {
            tokio::task::yield_now().await;
            manager.current_scope().map(|scope| scope.id())
        })
        .await;
    assert_eq!(seen, Some(root.id()));
    root.dispose().unwrap();
}

#[tokio::test]
async fn default_migration_requires_a_logical_flow() {
    let (_, manager) = manager_with(ScopeSettings::default().with_default_migration(true));
    let err = manager.create_scope().expect_err("逻辑流外默认迁移必须失败");
    assert!(matches!(err, ScopeError::NoLogicalFlow));

    logical_flow(async {
        let scope = manager.create_scope().unwrap();
        assert!(scope.is_migrated());
        scope.dispose().unwrap();
    })
    .await;
}

fn current_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("构建单线程运行时")
}

#[test]
fn thread_chain_is_ambient_again_after_a_migrating_scope_unwinds() {
    let (db, manager) = manager();
    let outer = manager.create_scope().unwrap();
    outer.resource_handle().unwrap();

    current_thread_runtime().block_on(logical_flow(async {
        let inner = manager
            .create_scope_with(ScopeOptions::new().migrate(true))
            .unwrap();
        assert_eq!(inner.parent(), Some(outer.id()));
        assert_eq!(manager.active_slot(), Slot::Migrated);
        tokio::task::yield_now().await;

        inner
            .resource_handle()
            .unwrap()
            .with(|tx| tx.put("migrated", "yes"))
            .unwrap();
        inner.mark_complete().unwrap();
        inner.dispose().unwrap();
        assert_eq!(manager.active_slot(), Slot::Local, "退回迁移起点后交还本地槽位");
        assert_eq!(manager.current_scope(), Some(outer.clone()));
    }));

    assert_eq!(manager.current_scope(), Some(outer.clone()));
    outer.mark_complete().unwrap();
    outer.dispose().unwrap();
    assert!(manager.current_scope().is_none());
    assert_eq!(manager.live_scopes(), 0);
    assert_eq!(db.stats().committed, 1);
    assert_eq!(db.stats().open_transactions(), 0);
    assert_eq!(db.get("migrated").as_deref(), Some("yes"));
}

#[test]
fn chain_left_open_by_a_finished_flow_can_still_be_released_on_the_thread() {
    let (db, manager) = manager();
    let outer = manager.create_scope().unwrap();
    outer.resource_handle().unwrap();

    let inner = current_thread_runtime().block_on(logical_flow(async {
        manager
            .create_scope_with(ScopeOptions::new().migrate(true))
            .unwrap()
    }));

    assert_eq!(manager.active_slot(), Slot::Local);
    assert_eq!(manager.current_scope(), Some(inner.clone()), "流结束时链被交还线程");
    let err = outer.dispose().expect_err("内层仍存活");
    assert_eq!(err.code(), "scope.order_violation");

    let report = manager.scope_reference().release().expect("强制清理应成功");
    assert_eq!((report.scopes, report.rolled_back), (2, 1));
    assert_eq!(manager.live_scopes(), 0);
    assert!(manager.current_scope().is_none());
    assert_eq!(db.stats().open_transactions(), 0);
    assert!(inner.is_disposed() && outer.is_disposed());
}
