use std::time::Duration;

use gearwork::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Log = Slot<Vec<String>>;

/// Counts invoke lifecycle calls without doing any work.
struct CountingInvoke {
    entered: Slot<u32>,
    exited: Slot<u32>,
    fail_enter: bool,
    fail_exit: bool,
}

impl CountingInvoke {
    fn new(entered: &Slot<u32>, exited: &Slot<u32>) -> Self {
        Self {
            entered: entered.clone(),
            exited: exited.clone(),
            fail_enter: false,
            fail_exit: false,
        }
    }
}

impl StateHooks<u32> for CountingInvoke {
    fn enter_invoke(&mut self) -> Result<(), Error> {
        self.entered.update(|c| *c += 1);
        if self.fail_enter {
            return Err(Error::hook("enter refused"));
        }
        Ok(())
    }

    fn exit_invoke(&mut self) -> Result<(), Error> {
        self.exited.update(|c| *c += 1);
        if self.fail_exit {
            return Err(Error::hook("exit refused"));
        }
        Ok(())
    }
}

#[test]
fn threaded_invoke_spans_the_states_active_time() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("invoke");
    let w = chart.add_child(chart.root(), "w");
    let idle = chart.add_child(chart.root(), "idle");
    chart.edge(w).on(1).to(idle).unwrap();

    let log: Log = Slot::default();
    let body_log = log.clone();
    chart.set_hooks(
        w,
        ThreadedInvoke::new(move |signal| {
            body_log.update(|v| v.push("invoke:running".into()));
            signal.wait();
            body_log.update(|v| v.push("invoke:cancelled".into()));
            Ok(())
        }),
    );

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    assert!(sm.is_active(w));

    // Exiting the state signals the token and joins the activity thread,
    // so both body entries are there once `post` returns.
    sm.post(1).unwrap();
    assert!(sm.is_active(idle));
    assert_eq!(log.get(), ["invoke:running", "invoke:cancelled"]);
}

#[test]
fn passthrough_states_never_start_their_invoke() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("passthrough");
    let a = chart.add_child(chart.root(), "a");
    let b = chart.add_child(chart.root(), "b");
    let c = chart.add_child(chart.root(), "c");
    chart.edge(a).on(1).to(b).unwrap();
    chart.edge(b).to(c).unwrap(); // eventless

    let b_entered = Slot::new(0);
    let b_exited = Slot::new(0);
    let c_entered = Slot::new(0);
    let c_exited = Slot::new(0);
    chart.set_hooks(b, CountingInvoke::new(&b_entered, &b_exited));
    chart.set_hooks(c, CountingInvoke::new(&c_entered, &c_exited));

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    sm.post(1).unwrap();
    assert!(sm.is_active(c));

    // `b` was entered and exited within the macrostep: its invoke never
    // ran, so there is nothing to exit either.
    assert_eq!(b_entered.get(), 0);
    assert_eq!(b_exited.get(), 0);
    // `c` survived to quiescence and got its invoke.
    assert_eq!(c_entered.get(), 1);
    assert_eq!(c_exited.get(), 0);

    sm.stop().unwrap();
    assert_eq!(c_exited.get(), 1);
}

#[test]
fn enter_invoke_failure_is_routed_and_skips_exit_invoke() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("bad-invoke");
    let w = chart.add_child(chart.root(), "w");

    let entered = Slot::new(0);
    let exited = Slot::new(0);
    let mut hooks = CountingInvoke::new(&entered, &exited);
    hooks.fail_enter = true;
    chart.set_hooks(w, hooks);

    let mut sm = StateMachine::new(chart);
    let errors: Slot<Vec<StateId>> = Slot::default();
    let sink = errors.clone();
    sm.on_state_error(move |state, _| sink.update(|v| v.push(state)));

    sm.start().unwrap();
    assert!(sm.running() && sm.is_active(w));
    assert_eq!(errors.get(), [w]);

    // The activity never started, so stopping must not try to end it.
    sm.stop().unwrap();
    assert_eq!(entered.get(), 1);
    assert_eq!(exited.get(), 0);
}

#[test]
fn exit_invoke_failure_without_error_callback_unwinds() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("bad-exit");
    let w = chart.add_child(chart.root(), "w");
    let idle = chart.add_child(chart.root(), "idle");
    chart.edge(w).on(1).to(idle).unwrap();

    let entered = Slot::new(0);
    let exited = Slot::new(0);
    let mut hooks = CountingInvoke::new(&entered, &exited);
    hooks.fail_exit = true;
    chart.set_hooks(w, hooks);

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();

    let err = sm.post(1).unwrap_err();
    assert!(matches!(err, Error::Hook(_)));
    assert!(!sm.running());
    assert_eq!(exited.get(), 1);
}

#[test]
fn pooled_invoke_borrows_and_returns_a_worker() {
    init_logging();
    let pool = WorkerPool::new(1);

    let mut chart: Chart<u32> = Chart::new("pooled");
    let w = chart.add_child(chart.root(), "w");
    let idle = chart.add_child(chart.root(), "idle");
    chart.edge(w).on(1).to(idle).unwrap();

    let log: Log = Slot::default();
    let body_log = log.clone();
    chart.set_hooks(
        w,
        PooledInvoke::new(pool.handle(), move |signal| {
            body_log.update(|v| v.push("pooled:running".into()));
            signal.wait();
            Ok(())
        }),
    );

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    sm.post(1).unwrap();
    assert_eq!(log.get(), ["pooled:running"]);

    // The worker is handed back once the task body returns; give the
    // bookkeeping a moment.
    let mut waited = Duration::ZERO;
    while pool.idle_workers() == 0 && waited < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(5));
        waited += Duration::from_millis(5);
    }
    assert_eq!(pool.idle_workers(), 1);
}

#[test]
fn pool_underflow_fails_the_second_invoke() {
    init_logging();
    let pool = WorkerPool::new(1);

    let mut chart: Chart<u32> = Chart::new("starved");
    let root = chart.root();
    chart.set_child_mode(root, ChildMode::Parallel);
    let p1 = chart.add_child(root, "p1");
    let p2 = chart.add_child(root, "p2");
    for state in [p1, p2] {
        chart.set_hooks(
            state,
            PooledInvoke::new(pool.handle(), |signal| {
                signal.wait();
                Ok(())
            }),
        );
    }

    let mut sm = StateMachine::new(chart);
    // Without a state-error callback the underflow unwinds the start.
    let err = sm.start().unwrap_err();
    assert!(matches!(err, Error::PoolUnderflow));
    assert!(!sm.running());
    assert!(!sm.is_active(p1) && !sm.is_active(p2));
}

#[test]
fn pool_underflow_can_be_routed_to_the_error_callback() {
    init_logging();
    let pool = WorkerPool::new(1);

    let mut chart: Chart<u32> = Chart::new("starved");
    let root = chart.root();
    chart.set_child_mode(root, ChildMode::Parallel);
    let p1 = chart.add_child(root, "p1");
    let p2 = chart.add_child(root, "p2");
    for state in [p1, p2] {
        chart.set_hooks(
            state,
            PooledInvoke::new(pool.handle(), |signal| {
                signal.wait();
                Ok(())
            }),
        );
    }

    let mut sm = StateMachine::new(chart);
    let errors: Slot<Vec<StateId>> = Slot::default();
    let sink = errors.clone();
    sm.on_state_error(move |state, _| sink.update(|v| v.push(state)));

    sm.start().unwrap();
    assert!(sm.running());
    assert!(sm.is_active(p1) && sm.is_active(p2));
    assert_eq!(errors.get(), [p2]);

    sm.stop().unwrap();
}
