//! Evaluation protocol tests: bindings, pooling, cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lua_expr_sandbox_rs::prelude::*;
use lua_expr_sandbox_rs::{mlua, DEFAULT_ALLOWED_FUNCTIONS};
use serde::Serialize;

/// Host callable adding its integer arguments.
fn add() -> Value {
    Value::function(|args| {
        let mut sum = 0;
        for arg in args {
            sum += arg
                .as_integer()
                .ok_or_else(|| SandboxError::Runtime(format!("cannot add a {}", arg.type_name())))?;
        }
        Ok(Value::Integer(sum))
    })
}

/// Host callable sleeping for `duration`, then returning true.
fn sleeper(duration: Duration) -> Value {
    Value::function(move |_| {
        thread::sleep(duration);
        Ok(Value::Boolean(true))
    })
}

#[test]
fn test_injected_values_and_host_callables() {
    let engine = ExprEngine::new(
        EngineConfig::builder()
            .env(Env::new().with("hoge", "foo"))
            .build(),
    )
    .unwrap();

    let expr = engine
        .compile(r#"hoge == "foo" and add(x, y) == 15"#)
        .unwrap();
    let env = Env::new().with("x", 5).with("y", 10).with("add", add());

    assert!(expr.eval_bool(Some(&env)).unwrap());
    assert_eq!(expr.eval(Some(&env)).unwrap(), Value::Boolean(true));
}

#[test]
fn test_unpooled_full_scenario() {
    #[derive(Serialize)]
    struct Person {
        name: String,
    }

    let engine = ExprEngine::new(
        EngineConfig::builder()
            .allowed_functions(format!("{DEFAULT_ALLOWED_FUNCTIONS} string.rep"))
            .pool_size(-1)
            .env(Env::new().with("hoge", "foo"))
            .build(),
    )
    .unwrap();

    let expr = engine
        .compile(
            r#"hoge == "foo" and add(x, y) == 15 and string.rep("ab", 5) == "ababababab" and d.name == "alice" "#,
        )
        .unwrap();
    let person = Person {
        name: "alice".to_string(),
    };
    let env = Env::new()
        .with("y", 10)
        .with("x", Value::Number(5.0))
        .with("d", Value::from_serialize(&person).unwrap())
        .with("add", add());

    assert!(expr.eval_bool(Some(&env)).unwrap());
}

#[test]
fn test_missing_capability_is_named() {
    let engine = ExprEngine::with_defaults().unwrap();

    let err = engine.compile("print('hi')").unwrap().eval(None).unwrap_err();
    assert!(err.is_runtime());
    assert_eq!(err.to_string(), "attempt to call a nil value (global 'print')");

    let err = engine
        .compile("math.floor(1) + string.rep('a', 2)")
        .unwrap()
        .eval(None)
        .unwrap_err();
    assert!(err.to_string().contains("'rep'"), "unexpected error: {err}");
}

#[test]
fn test_host_function_errors_propagate() {
    let engine = ExprEngine::with_defaults().unwrap();
    let expr = engine.compile("add(1, 'two')").unwrap();
    let err = expr
        .eval(Some(&Env::new().with("add", add())))
        .unwrap_err();
    assert!(err.is_runtime());
    assert!(err.to_string().contains("cannot add a string"), "unexpected error: {err}");
}

#[test]
fn test_runtime_errors_are_clean() {
    let engine = ExprEngine::with_defaults().unwrap();
    for (code, expected) in [
        ("1 + nil", "attempt to perform arithmetic on a nil value"),
        ("error('boom')", "boom"),
        ("error('boom', 0)", "boom"),
    ] {
        let err = engine.compile(code).unwrap().eval(None).unwrap_err();
        let message = err.to_string();
        assert_eq!(message, expected, "{code}");
        assert!(!message.contains("stack traceback"), "{code}");
    }
}

#[test]
fn test_native_values_pass_through() {
    struct Point {
        x: i64,
        y: i64,
    }

    impl mlua::UserData for Point {
        fn add_methods<M: mlua::UserDataMethods<Self>>(methods: &mut M) {
            methods.add_method("sum", |_, this, ()| Ok(this.x + this.y));
        }
    }

    let engine = ExprEngine::with_defaults().unwrap();
    let expr = engine.compile("type(p) == 'userdata' and p:sum() == 3").unwrap();
    let env = Env::new().with(
        "p",
        Value::native(|lua| {
            lua.create_userdata(Point { x: 1, y: 2 })
                .map(mlua::Value::UserData)
        }),
    );

    assert!(expr.eval_bool(Some(&env)).unwrap());
    assert!(expr.eval_bool(Some(&env)).unwrap());
    assert_eq!(
        engine.compile("p").unwrap().eval(Some(&env)).unwrap(),
        Value::Opaque("userdata")
    );
}

#[test]
fn test_truthiness_follows_lua() {
    let engine = ExprEngine::with_defaults().unwrap();
    for (code, expected) in [
        ("0", true),
        ("''", true),
        ("{}", true),
        ("nil", false),
        ("false", false),
        ("1 > 2", false),
        ("missing_name", false),
    ] {
        let expr = engine.compile(code).unwrap();
        assert_eq!(expr.eval_bool(None).unwrap(), expected, "{code}");
    }
}

#[test]
fn test_result_bridging() {
    let engine = ExprEngine::with_defaults().unwrap();
    let eval = |code: &str| engine.compile(code).unwrap().eval(None).unwrap();

    assert_eq!(eval("1 + 2"), Value::Integer(3));
    assert_eq!(eval("7 / 2"), Value::Number(3.5));
    assert_eq!(eval("'a' .. 'b'"), Value::from("ab"));
    assert_eq!(
        eval("{1, 2, 3}"),
        Value::Array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])
    );
    assert_eq!(eval("{name = 'x'}").get("name"), Some(&Value::from("x")));
    assert_eq!(eval("tostring"), Value::Opaque("function"));
    // Only the first value of a multi-value expression is kept.
    assert_eq!(eval("string.find('abc', 'b')"), Value::Integer(2));
}

#[test]
fn test_repeated_evaluation_is_stable() {
    let engine = ExprEngine::new(EngineConfig::builder().pool_size(3).build()).unwrap();
    let expr = engine.compile("math.max(a, b) * 2").unwrap();
    let env = Env::new().with("a", 4).with("b", 9);

    for _ in 0..100 {
        assert_eq!(expr.eval(Some(&env)).unwrap(), Value::Integer(18));
    }
    assert_eq!(engine.stats().created, 1);
}

#[test]
fn test_compile_errors() {
    let engine = ExprEngine::with_defaults().unwrap();

    for code in [
        "1 +",
        "x = 1",
        "return 1",
        "...",
        "1) end) os.exit() --",
        "1) end)(), (function() return (2",
    ] {
        let err = engine.compile(code).unwrap_err();
        assert!(err.is_compile(), "{code} should not compile");
    }
}

#[test]
fn test_expression_shared_across_threads() {
    let engine = ExprEngine::new(EngineConfig::builder().pool_size(4).build()).unwrap();
    let expr = engine.compile("n * n").unwrap();

    let handles: Vec<_> = (0..16)
        .map(|n| {
            let expr = expr.clone();
            thread::spawn(move || {
                let env = Env::new().with("n", n);
                for _ in 0..20 {
                    assert_eq!(expr.eval(Some(&env)).unwrap(), Value::Integer(i64::from(n * n)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = engine.stats();
    assert!(stats.created <= 4);
    assert_eq!(stats.in_use, 0);
}

#[test]
fn test_bounded_pool_blocks_extra_callers() {
    let engine = Arc::new(ExprEngine::new(EngineConfig::builder().pool_size(2).build()).unwrap());
    let (release, gate) = mpsc::channel::<()>();
    let gate = Arc::new(Mutex::new(gate));
    let wait = Value::function(move |_| {
        let gate = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gate.recv()
            .map(|_| Value::Boolean(true))
            .map_err(|e| SandboxError::Runtime(e.to_string()))
    });
    let expr = engine.compile("wait()").unwrap();
    let env = Env::new().with("wait", wait);

    let finished = Arc::new(AtomicBool::new(false));
    let spawn = |flag: Option<Arc<AtomicBool>>| {
        let expr = expr.clone();
        let env = env.clone();
        thread::spawn(move || {
            let result = expr.eval_bool(Some(&env));
            if let Some(flag) = flag {
                flag.store(true, Ordering::SeqCst);
            }
            result
        })
    };

    let first = spawn(None);
    let second = spawn(None);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.stats().in_use, 2);

    let third = spawn(Some(Arc::clone(&finished)));
    thread::sleep(Duration::from_millis(100));
    assert!(!finished.load(Ordering::SeqCst), "third caller should be blocked");
    assert_eq!(engine.stats().in_use, 2);
    assert!(engine.stats().created <= 2);

    for _ in 0..3 {
        release.send(()).unwrap();
    }
    for handle in [first, second, third] {
        assert!(handle.join().unwrap().unwrap());
    }
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(engine.stats().in_use, 0);
}

#[test]
fn test_context_bounds_pool_wait() {
    let engine = ExprEngine::new(EngineConfig::builder().pool_size(1).build()).unwrap();
    let expr = engine.compile("sleep()").unwrap();
    let env = Env::new().with("sleep", sleeper(Duration::from_millis(400)));

    let busy = {
        let expr = expr.clone();
        let env = env.clone();
        thread::spawn(move || expr.eval(Some(&env)))
    };
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let err = expr
        .eval_context(&Context::with_timeout(Duration::from_millis(50)), Some(&env))
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(300));

    assert!(busy.join().unwrap().is_ok());
}

#[test]
fn test_deadline_on_sleeping_callable_unpooled() {
    let engine = ExprEngine::new(
        EngineConfig::builder()
            .pool_size(-1)
            .env(Env::new().with("sleep", sleeper(Duration::from_millis(500))))
            .build(),
    )
    .unwrap();
    let expr = engine.compile("sleep()").unwrap();

    let ctx = Context::with_timeout(Duration::from_millis(200));
    let err = expr.eval_context_bool(&ctx, None).unwrap_err();
    assert!(
        err.to_string().starts_with("context deadline exceeded"),
        "unexpected error: {err}"
    );

    // Same shared instance, no deadline: still usable.
    assert!(expr.eval_bool(None).unwrap());
}

#[test]
fn test_infinite_loop_times_out_and_instance_is_reused() {
    let engine = ExprEngine::new(EngineConfig::builder().pool_size(1).build()).unwrap();
    let spin = engine
        .compile("(function() while true do end end)()")
        .unwrap();

    let started = Instant::now();
    let err = spin
        .eval_context(&Context::with_timeout(Duration::from_millis(100)), None)
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));

    let ok = engine.compile("1 + 1").unwrap();
    assert_eq!(ok.eval(None).unwrap(), Value::Integer(2));
    assert_eq!(
        ok.eval_context(&Context::with_timeout(Duration::from_secs(5)), None)
            .unwrap(),
        Value::Integer(2)
    );
    assert_eq!(engine.stats().created, 1);
}

#[test]
fn test_explicit_cancel() {
    let engine = ExprEngine::with_defaults().unwrap();
    let spin = engine
        .compile("(function() while true do end end)()")
        .unwrap();

    let ctx = Context::background();
    let canceller = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            ctx.cancel();
        })
    };
    let err = spin.eval_context(&ctx, None).unwrap_err();
    assert!(matches!(err, SandboxError::Cancelled));
    assert!(err.is_cancellation());
    canceller.join().unwrap();

    // A done context fails immediately without touching the pool.
    let created = engine.stats().created;
    let err = engine.compile("1").unwrap().eval_context(&ctx, None).unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(engine.stats().created, created);
}

#[test]
fn test_context_eval_without_expiry_matches_eval() {
    let engine = ExprEngine::with_defaults().unwrap();
    let expr = engine.compile("x * 2").unwrap();
    let env = Env::new().with("x", 21);
    let ctx = Context::with_timeout(Duration::from_secs(10));

    assert_eq!(expr.eval_context(&ctx, Some(&env)).unwrap(), Value::Integer(42));
    assert!(expr.eval_context_bool(&ctx, Some(&env)).unwrap());
}

#[test]
fn test_non_sandboxed_env_persists_on_instance() {
    let engine = ExprEngine::new(
        EngineConfig::builder()
            .disable_sandbox()
            .pool_size(1)
            .build(),
    )
    .unwrap();

    let expr = engine.compile("sticky").unwrap();
    assert_eq!(
        expr.eval(Some(&Env::new().with("sticky", "first"))).unwrap(),
        Value::from("first")
    );
    // Documented fast-path behavior: the binding stays in the globals.
    assert_eq!(expr.eval(None).unwrap(), Value::from("first"));
}

#[tokio::test]
async fn test_eval_async() {
    let engine = ExprEngine::with_defaults().unwrap();
    let expr = engine.compile("x + 1").unwrap();

    let value = expr
        .eval_async(&Context::background(), Env::new().with("x", 41))
        .await
        .unwrap();
    assert_eq!(value, Value::Integer(42));
}

#[tokio::test]
async fn test_eval_async_deadline() {
    let engine = ExprEngine::with_defaults().unwrap();
    let spin = engine
        .compile("(function() while true do end end)()")
        .unwrap();

    let err = spin
        .eval_async(&Context::with_timeout(Duration::from_millis(100)), Env::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_dropping_async_evaluation_cancels_it() {
    let engine = ExprEngine::new(EngineConfig::builder().pool_size(1).build()).unwrap();
    let spin = engine
        .compile("(function() while true do end end)()")
        .unwrap();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            spin.eval_async(&Context::background(), Env::new()),
        )
        .await;
        assert!(outcome.is_err(), "spin should still be running");
    });

    // The abandoned evaluation is cancelled and its instance returned.
    let ok = engine.compile("true").unwrap();
    let ctx = Context::with_timeout(Duration::from_secs(5));
    assert!(ok.eval_context_bool(&ctx, None).unwrap());
    drop(runtime);
}

#[test]
fn test_tokio_test_block_on() {
    let engine = ExprEngine::with_defaults().unwrap();
    let expr = engine.compile("'async'").unwrap();
    let value = tokio_test::block_on(expr.eval_async(&Context::background(), Env::new())).unwrap();
    assert_eq!(value, Value::from("async"));
}
