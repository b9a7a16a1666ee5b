use std::collections::HashMap;

use gearwork::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Log = Slot<Vec<String>>;

fn name_map(chart: &Chart<u32>) -> HashMap<StateId, String> {
    chart
        .pre_order(chart.root())
        .map(|s| (s, chart.name(s).to_string()))
        .collect()
}

/// Installs enter/exit recording callbacks on a machine.
fn record_lifecycle(sm: &mut StateMachine<u32>, log: &Log) {
    let names = name_map(sm.chart());
    let enter_log = log.clone();
    let enter_names = names.clone();
    sm.on_state_entered(move |s| {
        enter_log.update(|v| v.push(format!("enter:{}", enter_names[&s])))
    });
    let exit_log = log.clone();
    sm.on_state_exited(move |s| exit_log.update(|v| v.push(format!("exit:{}", names[&s]))));
}

#[test]
fn eventless_transition_chains_within_one_macrostep() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("chain");
    let a = chart.add_child(chart.root(), "a");
    let b = chart.add_child(chart.root(), "b");
    let c = chart.add_child(chart.root(), "c");
    chart.edge(a).on(1).to(b).unwrap();
    chart.edge(b).to(c).unwrap(); // eventless

    let log: Log = Slot::default();
    let mut sm = StateMachine::new(chart);
    record_lifecycle(&mut sm, &log);

    sm.start().unwrap();
    assert_eq!(sm.configuration_changes(), 1);
    log.update(|v| v.clear());

    sm.post(1).unwrap();
    assert!(sm.is_active(c) && !sm.is_active(b));
    // One macrostep, one configuration change, even though two
    // transitions fired.
    assert_eq!(sm.configuration_changes(), 2);
    assert_eq!(
        log.get(),
        ["exit:a", "enter:b", "exit:b", "enter:c"]
    );
}

#[test]
fn exits_actions_and_entries_run_in_order() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("order");
    let a = chart.add_child(chart.root(), "a");
    let b = chart.add_child(a, "b");
    let c = chart.add_child(chart.root(), "c");

    let log: Log = Slot::default();
    let action_log = log.clone();
    chart
        .edge(b)
        .on(1)
        .run(move |_| {
            action_log.update(|v| v.push("action".into()));
            Ok(())
        })
        .to(c)
        .unwrap();

    let mut sm = StateMachine::new(chart);
    record_lifecycle(&mut sm, &log);
    sm.start().unwrap();
    log.update(|v| v.clear());

    sm.post(1).unwrap();
    // Exits post-order, then the transition action, then entries
    // pre-order.
    assert_eq!(log.get(), ["exit:b", "exit:a", "action", "enter:c"]);
}

#[test]
fn parallel_root_activates_every_region() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("par");
    let root = chart.root();
    chart.set_child_mode(root, ChildMode::Parallel);
    let a = chart.add_child(root, "a");
    let b = chart.add_child(root, "b");
    let c = chart.add_child(root, "c");

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    assert!(sm.is_active(a) && sm.is_active(b) && sm.is_active(c));
    assert_eq!(sm.configuration_changes(), 1);

    sm.stop().unwrap();
    assert!(!sm.is_active(a) && !sm.is_active(b) && !sm.is_active(c));
    assert!(!sm.is_active(root));
    assert_eq!(sm.configuration_changes(), 2);
}

#[test]
fn parallel_regions_transition_independently() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("regions");
    let root = chart.root();
    chart.set_child_mode(root, ChildMode::Parallel);
    let r1 = chart.add_child(root, "r1");
    let r1a = chart.add_child(r1, "r1a");
    let r1b = chart.add_child(r1, "r1b");
    let r2 = chart.add_child(root, "r2");
    let r2a = chart.add_child(r2, "r2a");
    let r2b = chart.add_child(r2, "r2b");
    chart.edge(r1a).on(1).to(r1b).unwrap();
    chart.edge(r2a).on(1).to(r2b).unwrap();

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    assert!(sm.is_active(r1a) && sm.is_active(r2a));

    // Both orthogonal regions react to the same event in one macrostep.
    sm.post(1).unwrap();
    assert!(sm.is_active(r1b) && sm.is_active(r2b));
    assert!(!sm.is_active(r1a) && !sm.is_active(r2a));
    assert_eq!(sm.configuration_changes(), 2);
}

#[test]
fn region_transition_leaves_the_other_region_alone() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("regions");
    let root = chart.root();
    chart.set_child_mode(root, ChildMode::Parallel);
    let r1 = chart.add_child(root, "r1");
    let r1a = chart.add_child(r1, "r1a");
    let r1b = chart.add_child(r1, "r1b");
    let r2 = chart.add_child(root, "r2");
    let r2a = chart.add_child(r2, "r2a");
    let r2b = chart.add_child(r2, "r2b");
    chart.edge(r2a).on(9).to(r2b).unwrap();
    chart.edge(r1a).on(1).to(r1b).unwrap();

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    sm.post(9).unwrap();
    assert!(sm.is_active(r2b));

    // Exactly one child per exclusive region stays active afterwards.
    sm.post(1).unwrap();
    assert!(sm.is_active(r1b) && !sm.is_active(r1a));
    assert!(sm.is_active(r2b) && !sm.is_active(r2a));
}

#[test]
fn external_self_transition_reenters_the_compound_source() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("self");
    let a = chart.add_child(chart.root(), "a");
    let a1 = chart.add_child(a, "a1");
    let a2 = chart.add_child(a, "a2");
    chart.edge(a).on(1).to(a2).unwrap();
    chart.edge(a).on(2).internal().to(a2).unwrap();

    let log: Log = Slot::default();
    let mut sm = StateMachine::new(chart);
    record_lifecycle(&mut sm, &log);

    sm.start().unwrap();
    assert!(sm.is_active(a1));
    log.update(|v| v.clear());

    // External: the source compound is exited and re-entered.
    sm.post(1).unwrap();
    assert!(sm.is_active(a2));
    assert_eq!(log.get(), ["exit:a1", "exit:a", "enter:a", "enter:a2"]);

    // Internal: only the active child changes hands.
    log.update(|v| v.clear());
    sm.post(2).unwrap();
    assert!(sm.is_active(a2) && sm.is_active(a));
    assert_eq!(log.get(), ["exit:a2", "enter:a2"]);
}

#[test]
fn history_restores_the_latest_child_over_the_initial_designator() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("hist");
    let root = chart.root();
    let h = chart.add_history_child(root, "h", History::Shallow);
    let c1 = chart.add_child(h, "c1");
    let c2 = chart.add_child(h, "c2");
    let x = chart.add_child(root, "x");
    chart.set_initial(h, c1).unwrap();
    chart.set_initial(root, x).unwrap();

    chart.edge(x).on(1).to(h).unwrap();
    chart.edge(c1).on(2).to(c2).unwrap();
    chart.edge(h).on(3).to(x).unwrap();

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    assert!(sm.is_active(x));

    // First visit follows the initial designator.
    sm.post(1).unwrap();
    assert!(sm.is_active(c1));
    sm.post(2).unwrap();
    assert!(sm.is_active(c2));

    // Leave and come back: the remembered child beats the designator.
    sm.post(3).unwrap();
    assert!(sm.is_active(x));
    sm.post(1).unwrap();
    assert!(sm.is_active(c2) && !sm.is_active(c1));
}

#[test]
fn history_slots_are_reset_by_start() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("hist");
    let root = chart.root();
    let h = chart.add_history_child(root, "h", History::Shallow);
    let c1 = chart.add_child(h, "c1");
    let c2 = chart.add_child(h, "c2");
    let x = chart.add_child(root, "x");
    chart.set_initial(h, c1).unwrap();
    chart.set_initial(root, x).unwrap();
    chart.edge(x).on(1).to(h).unwrap();
    chart.edge(c1).on(2).to(c2).unwrap();
    chart.edge(h).on(3).to(x).unwrap();

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    sm.post(1).unwrap();
    sm.post(2).unwrap();
    sm.post(3).unwrap();

    // Stop with c2 remembered, restart: the slot is empty again and the
    // initial designator applies.
    sm.stop().unwrap();
    sm.start().unwrap();
    sm.post(1).unwrap();
    assert!(sm.is_active(c1) && !sm.is_active(c2));
}

#[test]
fn deep_history_composes_through_nested_history_states() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("deep");
    let root = chart.root();
    let p = chart.add_history_child(root, "p", History::Deep);
    let m = chart.add_history_child(p, "m", History::Shallow);
    let m1 = chart.add_child(m, "m1");
    let m2 = chart.add_child(m, "m2");
    let y = chart.add_child(root, "y");
    chart.set_initial(root, y).unwrap();

    chart.edge(y).on(1).to(p).unwrap();
    chart.edge(m1).on(2).to(m2).unwrap();
    chart.edge(p).on(3).to(y).unwrap();

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    sm.post(1).unwrap();
    assert!(sm.is_active(m1));
    sm.post(2).unwrap();
    assert!(sm.is_active(m2));

    // Exit the whole nest, re-enter: every level restores its remembered
    // child, bringing back m2.
    sm.post(3).unwrap();
    assert!(sm.is_active(y));
    sm.post(1).unwrap();
    assert!(sm.is_active(p) && sm.is_active(m) && sm.is_active(m2));
    assert!(!sm.is_active(m1));
}

#[test]
fn initial_designator_may_point_deep_into_the_tree() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("deep-init");
    let root = chart.root();
    let g = chart.add_child(root, "g");
    let g1 = chart.add_child(g, "g1");
    let g1a = chart.add_child(g1, "g1a");
    let g1b = chart.add_child(g1, "g1b");
    chart.set_initial(root, g1b).unwrap();

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    assert!(sm.is_active(g) && sm.is_active(g1) && sm.is_active(g1b));
    assert!(!sm.is_active(g1a));
}

#[test]
fn entry_falls_back_to_the_first_child() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("first");
    let root = chart.root();
    let a = chart.add_child(root, "a");
    let a1 = chart.add_child(a, "a1");
    let a2 = chart.add_child(a, "a2");

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    assert!(sm.is_active(a1) && !sm.is_active(a2));
}

#[test]
fn entry_and_exit_hooks_see_the_triggering_event() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("hooks");
    let a = chart.add_child(chart.root(), "a");
    let b = chart.add_child(chart.root(), "b");
    chart.edge(a).on(7).to(b).unwrap();

    let seen: Slot<Vec<(String, u32)>> = Slot::default();
    let on_exit = seen.clone();
    chart.set_hooks(
        a,
        FnHooks::new().exit(move |event| {
            on_exit.update(|v| v.push(("exit-a".into(), *event)));
            Ok(())
        }),
    );
    let on_entry = seen.clone();
    chart.set_hooks(
        b,
        FnHooks::new().entry(move |event| {
            on_entry.update(|v| v.push(("enter-b".into(), *event)));
            Ok(())
        }),
    );

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    sm.post(7).unwrap();
    assert_eq!(
        seen.get(),
        vec![("exit-a".to_string(), 7), ("enter-b".to_string(), 7)]
    );
}

#[test]
fn entry_hook_failure_without_error_callback_unwinds() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("bad-entry");
    let a = chart.add_child(chart.root(), "a");
    let b = chart.add_child(chart.root(), "b");
    chart.edge(a).on(1).to(b).unwrap();
    chart.set_hooks(b, FnHooks::new().entry(|_| Err(Error::hook("refused"))));

    let mut sm = StateMachine::new(chart);
    sm.start().unwrap();
    let err = sm.post(1).unwrap_err();
    assert!(matches!(err, Error::Hook(_)));
    assert!(!sm.running());
}

#[test]
fn entry_hook_failure_is_routed_to_the_error_callback() {
    init_logging();
    let mut chart: Chart<u32> = Chart::new("routed");
    let a = chart.add_child(chart.root(), "a");
    let b = chart.add_child(chart.root(), "b");
    chart.edge(a).on(1).to(b).unwrap();
    chart.set_hooks(b, FnHooks::new().entry(|_| Err(Error::hook("refused"))));

    let mut sm = StateMachine::new(chart);
    let errors: Slot<Vec<StateId>> = Slot::default();
    let sink = errors.clone();
    sm.on_state_error(move |state, _| sink.update(|v| v.push(state)));

    sm.start().unwrap();
    sm.post(1).unwrap();
    // The failure was consumed; the machine keeps running and the entry
    // completed.
    assert!(sm.running());
    assert!(sm.is_active(b));
    assert_eq!(errors.get(), [b]);
}
