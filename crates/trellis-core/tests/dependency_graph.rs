//! Dependency-gated instantiation and disposal cascades.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use trellis_core::{Context, CoreError, HookKind, Plugin, RegistryStats, plugin_fn};

#[derive(Debug)]
struct Foo {
    bar: i64,
}

fn log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn test_using_is_gated_on_presence() {
    let app = Context::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let disposals = Arc::new(AtomicUsize::new(0));

    let (c, d) = (Arc::clone(&calls), Arc::clone(&disposals));
    let handle = app
        .using(["foo"], move |ctx| {
            c.fetch_add(1, Ordering::SeqCst);
            let d = Arc::clone(&d);
            ctx.on_dispose(move || {
                d.fetch_add(1, Ordering::SeqCst);
            });
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!handle.is_active());

    app.provide("foo", Arc::new(Foo { bar: 1 }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(handle.is_active());

    app.provide("foo", Arc::new(Foo { bar: 2 }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(disposals.load(Ordering::SeqCst), 1);

    app.remove("foo");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(disposals.load(Ordering::SeqCst), 2);
    assert!(!handle.is_active());
    assert!(handle.is_alive());
}

#[test]
fn test_replacing_a_dependency_recreates_the_fork() {
    let app = Context::new();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let disposed = Arc::new(AtomicUsize::new(0));

    let (c, d) = (Arc::clone(&captured), Arc::clone(&disposed));
    app.using(["foo"], move |ctx| {
        c.lock().push(ctx.get_as::<Foo>("foo").map(|foo| foo.bar));
        let d = Arc::clone(&d);
        ctx.on("dispose", move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
    })
    .unwrap();

    app.provide("foo", Arc::new(Foo { bar: 100 }));
    assert_eq!(*captured.lock(), vec![Some(100)]);
    assert_eq!(disposed.load(Ordering::SeqCst), 0);

    app.provide("foo", Arc::new(Foo { bar: 300 }));
    assert_eq!(*captured.lock(), vec![Some(100), Some(300)]);
    assert_eq!(disposed.load(Ordering::SeqCst), 1);

    app.set("foo", None);
    assert_eq!(captured.lock().len(), 2);
    assert_eq!(disposed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_identical_write_keeps_the_fork() {
    let app = Context::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    app.using(["foo"], move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let foo = Arc::new(Foo { bar: 1 });
    app.provide("foo", Arc::clone(&foo));
    app.provide("foo", Arc::clone(&foo));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_isolated_write_does_not_wake_outer_registrations() {
    let app = Context::new();
    let sandbox = app.isolate(["foo"]);
    let outer = Arc::new(AtomicUsize::new(0));
    let inner = Arc::new(AtomicUsize::new(0));

    let o = Arc::clone(&outer);
    app.using(["foo"], move |_| {
        o.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let i = Arc::clone(&inner);
    sandbox
        .using(["foo"], move |_| {
            i.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    sandbox.provide("foo", Arc::new(Foo { bar: 1 }));
    assert_eq!(outer.load(Ordering::SeqCst), 0);
    assert_eq!(inner.load(Ordering::SeqCst), 1);

    app.provide("foo", Arc::new(Foo { bar: 2 }));
    assert_eq!(outer.load(Ordering::SeqCst), 1);
    assert_eq!(inner.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fork_context_isolates_declared_names() {
    let app = Context::new();
    let plugin = plugin_fn("counter", |ctx: &Context, config: &Value| {
        ctx.provide("count", Arc::new(config["start"].as_i64().unwrap_or(0)));
    })
    .isolate(["count"])
    .reusable(true);
    let plugin: Arc<dyn Plugin> = Arc::new(plugin);

    let a = app.register(Arc::clone(&plugin), json!({ "start": 1 })).unwrap();
    let b = app.register(Arc::clone(&plugin), json!({ "start": 2 })).unwrap();

    assert!(app.get("count").is_none());
    assert!(a.is_active() && b.is_active());
    assert_ne!(a.fork(), b.fork());
    assert_eq!(app.registry_stats().runtimes, 1);
    assert_eq!(app.registry_stats().registrations, 2);
}

#[test]
fn test_children_are_disposed_before_parent() {
    let app = Context::new();
    let order = log();

    let o = Arc::clone(&order);
    let child = Arc::new(
        plugin_fn("child", move |ctx: &Context, _: &Value| {
            let o = Arc::clone(&o);
            ctx.on_dispose(move || o.lock().push("child".to_string()));
        })
        .reusable(true),
    );

    let o = Arc::clone(&order);
    let parent = plugin_fn("parent", move |ctx: &Context, _: &Value| {
        let o1 = Arc::clone(&o);
        ctx.on_dispose(move || o1.lock().push("parent".to_string()));
        ctx.register(child.clone(), Value::Null)?;
        let o2 = Arc::clone(&o);
        ctx.using(["bar"], move |inner| {
            let o2 = Arc::clone(&o2);
            inner.on_dispose(move || o2.lock().push("using".to_string()));
        })?;
        Ok::<(), CoreError>(())
    })
    .using(["foo"]);

    app.register(Arc::new(parent), Value::Null).unwrap();
    app.provide("bar", Arc::new(0));
    app.provide("foo", Arc::new(0));
    assert_eq!(app.registry_stats().forks, 3);

    app.remove("foo");
    assert_eq!(*order.lock(), vec!["child", "using", "parent"]);
    assert_eq!(app.registry_stats().forks, 0);
    // The nested registrations went away with their owner.
    assert_eq!(app.registry_stats().registrations, 1);
}

#[test]
fn test_disposal_is_idempotent() {
    let app = Context::new();
    let disposed = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&disposed);
    let plugin: Arc<dyn Plugin> = Arc::new(plugin_fn("once", move |ctx: &Context, _: &Value| {
        let d = Arc::clone(&d);
        ctx.on_dispose(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
    }));

    let handle = app.register(Arc::clone(&plugin), Value::Null).unwrap();
    assert!(handle.dispose());
    assert!(!handle.dispose());
    assert!(!app.dispose(&plugin));
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert!(!handle.is_alive());
}

#[test]
fn test_dispose_plugin_removes_every_registration() {
    let app = Context::new();
    let forks = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&forks);
    let plugin: Arc<dyn Plugin> = Arc::new(plugin_fn("twice", move |_: &Context, _: &Value| {
        f.fetch_add(1, Ordering::SeqCst);
    }));

    let a = app.register(Arc::clone(&plugin), Value::Null).unwrap();
    let b = app.register(Arc::clone(&plugin), Value::Null).unwrap();
    assert!(a.is_active() && b.is_active());
    // Single-instance plugin: the body runs once, both forks share it.
    assert_eq!(forks.load(Ordering::SeqCst), 1);

    assert!(app.dispose(&plugin));
    assert!(!a.is_alive() && !b.is_alive());
    assert_eq!(app.registry_stats(), RegistryStats::default());
}

#[test]
fn test_chained_plugins_react_in_order() {
    let app = Context::new();
    let order = log();

    let o = Arc::clone(&order);
    let producer = plugin_fn("producer", move |ctx: &Context, _: &Value| {
        o.lock().push("producer up".to_string());
        ctx.provide("bar", Arc::new(Foo { bar: 1 }));
        let o = Arc::clone(&o);
        let ctx2 = ctx.clone();
        ctx.on_dispose(move || {
            o.lock().push("producer down".to_string());
            ctx2.remove("bar");
        });
    })
    .using(["foo"]);

    let o = Arc::clone(&order);
    app.using(["bar"], move |ctx| {
        o.lock().push("consumer up".to_string());
        let o = Arc::clone(&o);
        ctx.on_dispose(move || o.lock().push("consumer down".to_string()));
    })
    .unwrap();
    app.register(Arc::new(producer), Value::Null).unwrap();

    app.provide("foo", Arc::new(0));
    assert_eq!(*order.lock(), vec!["producer up", "consumer up"]);

    app.remove("foo");
    assert_eq!(
        *order.lock(),
        vec!["producer up", "consumer up", "producer down", "consumer down"]
    );
    assert!(app.get("bar").is_none());
}

#[test]
fn test_fork_can_dispose_itself() {
    let app = Context::new();
    let handle = app
        .using(["foo"], |ctx| {
            assert!(ctx.dispose_state());
        })
        .unwrap();
    app.provide("foo", Arc::new(0));
    assert!(!handle.is_alive());
    assert_eq!(app.registry_stats().forks, 0);
}

#[test]
fn test_invalid_declarations_are_rejected() {
    let app = Context::new();
    let duplicate = plugin_fn("dup", |_: &Context, _: &Value| {}).using(["a", "a"]);
    let err = app.register(Arc::new(duplicate), Value::Null).unwrap_err();
    assert!(matches!(err, CoreError::Configuration { ref plugin, .. } if plugin == "dup"));

    let empty = plugin_fn("empty", |_: &Context, _: &Value| {}).using([""]);
    assert!(app.register(Arc::new(empty), Value::Null).is_err());
    assert_eq!(app.registry_stats().runtimes, 0);
}

#[test]
fn test_register_through_disposed_fork_fails() {
    let app = Context::new();
    let captured: Arc<Mutex<Option<Context>>> = Arc::new(Mutex::new(None));
    let c = Arc::clone(&captured);
    app.using(["foo"], move |ctx| {
        *c.lock() = Some(ctx.clone());
    })
    .unwrap();

    app.provide("foo", Arc::new(0));
    app.remove("foo");

    let stale = captured.lock().take().unwrap();
    let plugin = plugin_fn("late", |_: &Context, _: &Value| {});
    let err = stale.register(Arc::new(plugin), Value::Null).unwrap_err();
    assert!(matches!(err, CoreError::Inactive(_)));

    // Dispose listeners on a gone fork run right away.
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    stale.on_dispose(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_body_is_reported() {
    let app = Context::new();
    let plugin = plugin_fn("broken", |_: &Context, _: &Value| {
        Err::<(), _>(std::io::Error::other("no database"))
    });
    let handle = app.register(Arc::new(plugin), Value::Null).unwrap();
    assert!(!handle.is_active());

    let CoreError::Hooks(failures) = app.start().await.unwrap_err() else {
        panic!("expected hook failures");
    };
    assert_eq!(failures.len(), 1);
    let failure = failures.iter().next().unwrap();
    assert_eq!(failure.plugin, "broken");
    assert_eq!(failure.hook, HookKind::Apply);
    assert!(failure.message.contains("no database"));
}

#[test]
fn test_single_instance_plugin_is_rebuilt_when_a_dependency_changes() {
    let app = Context::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let plugin: Arc<dyn Plugin> = Arc::new(
        plugin_fn("db-user", move |ctx: &Context, _: &Value| {
            if let Some(foo) = ctx.get_as::<Foo>("foo") {
                s.lock().push(foo.bar);
            }
        })
        .using(["foo"]),
    );
    let first = app.register(Arc::clone(&plugin), Value::Null).unwrap();
    let second = app.register(Arc::clone(&plugin), Value::Null).unwrap();

    app.provide("foo", Arc::new(Foo { bar: 1 }));
    assert_eq!(*seen.lock(), vec![1]);
    assert_eq!(app.registry_stats().instances, 1);

    app.provide("foo", Arc::new(Foo { bar: 2 }));
    assert_eq!(*seen.lock(), vec![1, 2]);
    assert_eq!(app.registry_stats().instances, 1);
    assert!(first.is_active() && second.is_active());

    app.remove("foo");
    assert_eq!(app.registry_stats().instances, 0);
    assert!(!first.is_active() && !second.is_active());
}

#[test]
fn test_service_provided_and_used_in_one_body_forks_once() {
    let app = Context::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let disposals = Arc::new(AtomicUsize::new(0));

    let (c, d) = (Arc::clone(&calls), Arc::clone(&disposals));
    let parent = plugin_fn("parent", move |ctx: &Context, _: &Value| {
        ctx.provide("bar", Arc::new(Foo { bar: 7 }));
        let (c, d) = (Arc::clone(&c), Arc::clone(&d));
        ctx.using(["bar"], move |ctx| {
            c.fetch_add(1, Ordering::SeqCst);
            let d = Arc::clone(&d);
            ctx.on_dispose(move || {
                d.fetch_add(1, Ordering::SeqCst);
            });
        })
        .unwrap();
    });
    app.register(Arc::new(parent), Value::Null).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(disposals.load(Ordering::SeqCst), 0);

    // A later write still replaces the child's fork.
    app.provide("bar", Arc::new(Foo { bar: 8 }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
}

#[test]
fn test_write_after_fork_in_one_step_replaces_the_fork() {
    let app = Context::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    let parent = plugin_fn("parent", move |ctx: &Context, _: &Value| {
        ctx.provide("bar", Arc::new(Foo { bar: 1 }));
        let s = Arc::clone(&s);
        ctx.using(["bar"], move |ctx| {
            if let Some(bar) = ctx.get_as::<Foo>("bar") {
                s.lock().push(bar.bar);
            }
        })
        .unwrap();
        ctx.provide("bar", Arc::new(Foo { bar: 2 }));
    });
    app.register(Arc::new(parent), Value::Null).unwrap();
    assert_eq!(*seen.lock(), vec![1, 2]);
}
