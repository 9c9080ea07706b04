use std::time::Duration;

use anyhow::Result;
use googletest::prelude::*;

use super::*;

/// Runs `source` as a classic script in a fresh context on the thread's isolate.
fn run_in_new_context(source: &'static str) -> Result<ExceptionResult<String>> {
    let result = try_with_isolate(|tls_isolate| -> ExceptionResult<String> {
        let ctx_global = tls_isolate.new_ctx();
        v8::scope!(let scope, tls_isolate.isolate());
        let ctx = v8::Local::new(scope, &ctx_global);
        v8::scope_with_context!(let scope, scope, ctx);
        v8::tc_scope!(let try_catch, scope);

        let value = run_script(try_catch, &ESScriptOrigin::named("test.js"), source)?;
        Ok(value.to_rust_string_lossy(try_catch))
    })?;
    Ok(result)
}

#[gtest]
fn test_run_script_declares_globals() -> Result<()> {
    init_v8_for_testing();
    let tls_isolate = TlsIsolate::for_current_thread()?;

    let names = try_with_isolate(|tls_isolate| -> Result<Vec<String>> {
        let ctx_global = tls_isolate.new_ctx();
        v8::scope!(let scope, tls_isolate.isolate());
        let ctx = v8::Local::new(scope, &ctx_global);
        v8::scope_with_context!(let scope, scope, ctx);
        v8::tc_scope!(let try_catch, scope);

        run_script(
            try_catch,
            &ESScriptOrigin::named("globals.js"),
            r#"
                function detect_one(input) { return {}; }
                var helper = 3;
                let hidden = 4;
            "#,
        )?;
        let global = ctx.global(try_catch);
        Ok(own_property_names(try_catch, global)?)
    })??;

    expect_that!(names, contains(eq(&"detect_one".to_string())));
    expect_that!(names, contains(eq(&"helper".to_string())));
    expect_that!(names, not(contains(eq(&"hidden".to_string()))));
    expect_that!(names, not(contains(eq(&"Object".to_string()))));

    drop(tls_isolate);
    Ok(())
}

#[gtest]
fn test_exception_reports_resource_and_line() -> Result<()> {
    init_v8_for_testing();
    let tls_isolate = TlsIsolate::for_current_thread()?;

    let result = run_in_new_context("\nthrow new Error('boom');")?;

    let err = result.expect_err("expected the script to throw");
    expect_that!(err.is_termination(), eq(false));
    expect_that!(err.to_string(), contains_substring("boom"));
    expect_that!(err.to_string(), contains_substring("test.js:2"));

    drop(tls_isolate);
    Ok(())
}

#[gtest]
fn test_watchdog_terminates_runaway_script() -> Result<()> {
    init_v8_for_testing();
    let tls_isolate = TlsIsolate::for_current_thread()?;
    let watchdog = Watchdog::new(try_with_isolate(|guard| guard.thread_safe_handle())?)?;

    let guard = watchdog.arm(Duration::from_millis(50));
    let result = run_in_new_context("while (true) {}")?;
    let fired = guard.disarm();

    expect_that!(fired, eq(true));
    expect_that!(result.map_err(|err| err.is_termination()), err(eq(&true)));

    // The isolate must be usable again once the guard is disarmed.
    let guard = watchdog.arm(Duration::from_secs(5));
    let result = run_in_new_context("'still alive'")?;
    let fired = guard.disarm();

    expect_that!(fired, eq(false));
    expect_that!(result.map_err(|err| err.to_string()), ok(eq(&"still alive".to_string())));

    drop(watchdog);
    drop(tls_isolate);
    Ok(())
}

#[gtest]
fn test_tls_isolate_rejects_second_instance() -> Result<()> {
    init_v8_for_testing();
    let tls_isolate = TlsIsolate::for_current_thread()?;

    expect_that!(TlsIsolate::for_current_thread().map(|_| ()), err(anything()));

    drop(tls_isolate);
    expect_that!(
        try_with_isolate(|_| ()).map_err(|err| err.to_string()),
        err(contains_substring("does not exist"))
    );
    Ok(())
}
