//! Predicate-controlled execution: resolved skips, speculation, quashing
//! and combinator predicates.

use parking_lot::Mutex;
use skein_core::{
    EventState, Future, Privilege, RegionHandle, RegionRequirement, Runtime, RuntimeConfig,
    TaskLaunch,
};
use std::sync::Arc;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn runtime() -> Arc<Runtime> {
    skein_tracing::init_from_env();
    Runtime::initialize(RuntimeConfig::default()).unwrap()
}

fn log_task(rt: &Runtime, func_id: u64, log: &Log, tag: &'static str) {
    let log = Arc::clone(log);
    rt.register_task(
        func_id,
        Arc::new(move |_args| {
            log.lock().push(tag);
            Vec::new()
        }),
    );
}

fn bool_future(rt: &Runtime) -> Future {
    Future::new(rt.events().create())
}

fn resolve(rt: &Runtime, fut: &Future, value: bool) {
    fut.set(vec![value as u8]);
    rt.events().trigger(fut.event());
}

#[test]
fn resolved_false_predicate_skips_without_failing() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "q");

    let r = RegionHandle(0);
    let ctx = rt.create_context(vec![(r, Privilege::ReadWrite)]);

    let fut = bool_future(&rt);
    resolve(&rt, &fut, false);
    let pred = ctx.create_future_predicate(fut).unwrap();
    // give the predicate resolution a moment to land
    std::thread::sleep(std::time::Duration::from_millis(10));

    let task = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(pred),
        })
        .unwrap();

    events.wait(task.event()).unwrap();
    assert!(log.lock().is_empty(), "skipped task must not run");
    ctx.release_predicate(pred);
    rt.shutdown();
}

#[test]
fn resolved_true_predicate_runs_normally() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "q");

    let r = RegionHandle(0);
    let ctx = rt.create_context(vec![(r, Privilege::ReadWrite)]);
    let fut = bool_future(&rt);
    resolve(&rt, &fut, true);
    let pred = ctx.create_future_predicate(fut).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));

    let task = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(pred),
        })
        .unwrap();
    events.wait(task.event()).unwrap();
    assert_eq!(*log.lock(), vec!["q"]);
    ctx.release_predicate(pred);
    rt.shutdown();
}

#[test]
fn quash_on_false_predicate_poisons_and_propagates() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "q");
    log_task(&rt, 2, &log, "dependent");

    let r = RegionHandle(0);
    let ctx = rt.create_context(vec![(r, Privilege::ReadWrite)]);

    // unresolved predicate that permits speculating true
    let fut = bool_future(&rt);
    let pred = ctx.create_future_predicate(fut.clone()).unwrap();
    ctx.set_predicate_speculation(pred, Some(true));

    let q = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(pred),
        })
        .unwrap();
    // a successor that observes q's writes
    let dependent = ctx
        .spawn_task(TaskLaunch {
            func_id: 2,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: None,
        })
        .unwrap();

    // the speculated task ran ahead
    for _ in 0..200 {
        if !log.lock().is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    assert_eq!(*log.lock(), vec!["q"], "speculated task should have run");
    assert_eq!(events.poll(q.event()), EventState::Pending);

    // the predicate comes back false: q is quashed
    resolve(&rt, &fut, false);

    match events.wait(q.event()) {
        Err(_) => {}
        Ok(()) => panic!("quashed op's completion must fire in the failed state"),
    }
    // the dependent observes the failure through its precondition
    assert!(events.wait(dependent.event()).is_err());

    ctx.release_predicate(pred);
    rt.shutdown();
}

#[test]
fn confirmed_speculation_completes_normally() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "q");

    let r = RegionHandle(0);
    let ctx = rt.create_context(vec![(r, Privilege::ReadWrite)]);
    let fut = bool_future(&rt);
    let pred = ctx.create_future_predicate(fut.clone()).unwrap();
    ctx.set_predicate_speculation(pred, Some(true));

    let q = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(pred),
        })
        .unwrap();

    resolve(&rt, &fut, true);
    events.wait(q.event()).unwrap();
    assert_eq!(*log.lock(), vec!["q"]);
    ctx.release_predicate(pred);
    rt.shutdown();
}

#[test]
fn speculated_skip_confirmed_by_false_resolution() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "q");

    let r = RegionHandle(0);
    let ctx = rt.create_context(vec![(r, Privilege::ReadWrite)]);
    let fut = bool_future(&rt);
    let pred = ctx.create_future_predicate(fut.clone()).unwrap();
    ctx.set_predicate_speculation(pred, Some(false));

    let q = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(pred),
        })
        .unwrap();

    resolve(&rt, &fut, false);
    events.wait(q.event()).unwrap();
    assert!(log.lock().is_empty(), "skipped work must not run");
    ctx.release_predicate(pred);
    rt.shutdown();
}

#[test]
fn mis_speculated_skip_is_quashed_with_restart() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "q");

    let r = RegionHandle(0);
    let ctx = rt.create_context(vec![(r, Privilege::ReadWrite)]);
    let fut = bool_future(&rt);
    let pred = ctx.create_future_predicate(fut.clone()).unwrap();
    ctx.set_predicate_speculation(pred, Some(false));

    let q = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(pred),
        })
        .unwrap();

    // the guess was wrong: the skipped operation is quashed
    resolve(&rt, &fut, true);
    assert!(events.wait(q.event()).is_err());
    ctx.release_predicate(pred);
    rt.shutdown();
}

#[test]
fn pending_predicate_parks_until_resolution() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "q");

    let r = RegionHandle(0);
    let ctx = rt.create_context(vec![(r, Privilege::ReadWrite)]);
    // no speculation permitted: the op parks
    let fut = bool_future(&rt);
    let pred = ctx.create_future_predicate(fut.clone()).unwrap();

    let q = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(pred),
        })
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(10));
    assert!(log.lock().is_empty(), "parked op must not run");
    assert_eq!(events.poll(q.event()), EventState::Pending);

    resolve(&rt, &fut, true);
    events.wait(q.event()).unwrap();
    assert_eq!(*log.lock(), vec!["q"]);
    ctx.release_predicate(pred);
    rt.shutdown();
}

#[test]
fn combinator_predicates_resolve_through_children() {
    let rt = runtime();
    let events = rt.events().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    log_task(&rt, 1, &log, "and_op");
    log_task(&rt, 2, &log, "not_op");

    let r = RegionHandle(0);
    let s = RegionHandle(1);
    let ctx = rt.create_context(vec![
        (r, Privilege::ReadWrite),
        (s, Privilege::ReadWrite),
    ]);

    let fa = bool_future(&rt);
    let fb = bool_future(&rt);
    let pa = ctx.create_future_predicate(fa.clone()).unwrap();
    let pb = ctx.create_future_predicate(fb.clone()).unwrap();
    let p_and = ctx.predicate_and(pa, pb).unwrap();
    let p_not = ctx.predicate_not(pb).unwrap();

    let and_task = ctx
        .spawn_task(TaskLaunch {
            func_id: 1,
            args: vec![],
            requirements: vec![RegionRequirement::write(r)],
            predicate: Some(p_and),
        })
        .unwrap();
    let not_task = ctx
        .spawn_task(TaskLaunch {
            func_id: 2,
            args: vec![],
            requirements: vec![RegionRequirement::write(s)],
            predicate: Some(p_not),
        })
        .unwrap();

    // a && b with b = false resolves false regardless of a;
    // !b resolves true
    resolve(&rt, &fb, false);
    events.wait(and_task.event()).unwrap();
    events.wait(not_task.event()).unwrap();
    assert_eq!(*log.lock(), vec!["not_op"]);

    resolve(&rt, &fa, true);
    for p in [p_and, p_not, pa, pb] {
        ctx.release_predicate(p);
    }
    rt.shutdown();
}
