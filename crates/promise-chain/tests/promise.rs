use promise_chain::spawn::{block_on, spawn, ImmediateExecutor, ScopedExecutor, SimpleExecutor};
use promise_chain::{values, Promise, Reject, Rejection, Resolve, State, Values};
use std::cell::RefCell;
use std::rc::Rc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Gate = Rc<RefCell<Option<(Resolve, Reject)>>>;

/// A promise whose work parks its settlement handles in `slot` and returns
/// without settling, leaving the promise pending until the test decides.
fn gated(slot: &Gate) -> Promise {
    let slot = Rc::clone(slot);
    Promise::new(move |resolve, reject| async move {
        slot.borrow_mut().replace((resolve, reject));
        Ok(())
    })
}

fn open(slot: &Gate, values: impl Into<Values>) {
    let (resolve, _) = slot.borrow_mut().take().expect("gate work has not run yet");
    resolve.call(values);
}

fn fail(slot: &Gate, values: impl Into<Values>) {
    let (_, reject) = slot.borrow_mut().take().expect("gate work has not run yet");
    reject.call(values);
}

#[test]
fn wait_blocks_until_settled_after_suspension() {
    init_logging();
    let exec = SimpleExecutor::new();
    let gate_slot = Rc::new(RefCell::new(None));
    let gate = gated(&gate_slot);

    // the work suspends on the gate before resolving
    let promise = Promise::new(move |resolve, _| async move {
        let values = gate.wait().await?;
        resolve.call(values);
        Ok(())
    });

    let observed = Rc::new(RefCell::new(None));
    let out = Rc::clone(&observed);
    let waiter = promise.clone();
    spawn(async move {
        let outcome = waiter.wait().await;
        out.borrow_mut().replace(outcome);
    })
    .detach();

    exec.run_until_stalled();
    assert!(promise.is_pending());
    assert!(observed.borrow().is_none());

    open(&gate_slot, ("late", 2));
    exec.run_until_stalled();

    assert_eq!(promise.state(), State::Fulfilled);
    assert_eq!(*observed.borrow(), Some(Ok(values!["late", 2])));
}

#[test]
fn wait_raises_rejection_after_suspension() {
    init_logging();
    let exec = SimpleExecutor::new();
    let gate_slot = Rc::new(RefCell::new(None));
    let gate = gated(&gate_slot);

    let promise = Promise::new(move |_, reject| async move {
        let values = gate.wait().await?;
        reject.call(values);
        Ok(())
    });
    exec.run_until_stalled();

    open(&gate_slot, "denied");
    let result = exec.run_until(promise.wait()).unwrap();
    assert_eq!(
        result,
        Err(Rejection {
            values: values!["denied"]
        })
    );
}

#[test]
fn concurrent_waiters_all_observe_outcome() {
    init_logging();
    let exec = SimpleExecutor::new();
    let gate_slot = Rc::new(RefCell::new(None));
    let gate = gated(&gate_slot);

    let results = Rc::new(RefCell::new(vec![]));
    for id in 0..3 {
        let gate = gate.clone();
        let results = Rc::clone(&results);
        spawn(async move {
            let outcome = gate.wait().await;
            results.borrow_mut().push((id, outcome));
        })
        .detach();
    }
    exec.run_until_stalled();
    assert!(results.borrow().is_empty());

    open(&gate_slot, 9);
    exec.run_until_stalled();

    let results = results.borrow();
    assert_eq!(results.len(), 3);
    for (idx, (id, outcome)) in results.iter().enumerate() {
        assert_eq!(*id, idx);
        assert_eq!(*outcome, Ok(values![9]));
    }
}

#[test]
fn concurrent_waiters_all_observe_rejection() {
    init_logging();
    let exec = SimpleExecutor::new();
    let gate_slot = Rc::new(RefCell::new(None));
    let gate = gated(&gate_slot);

    let results = Rc::new(RefCell::new(vec![]));
    for id in 0..3 {
        let gate = gate.clone();
        let results = Rc::clone(&results);
        spawn(async move {
            let outcome = gate.wait().await;
            results.borrow_mut().push((id, outcome));
        })
        .detach();
    }
    exec.run_until_stalled();
    assert!(results.borrow().is_empty());

    fail(&gate_slot, ("refused", 4));
    exec.run_until_stalled();

    assert_eq!(gate.state(), State::Rejected);
    let results = results.borrow();
    assert_eq!(results.len(), 3);
    for (idx, (id, outcome)) in results.iter().enumerate() {
        assert_eq!(*id, idx);
        assert_eq!(
            *outcome,
            Err(Rejection {
                values: values!["refused", 4]
            })
        );
    }
}

#[test]
fn immediate_executor_resumes_waiters_before_settlement_returns() {
    init_logging();
    let _exec = ImmediateExecutor::new();
    let gate_slot = Rc::new(RefCell::new(None));
    let gate = gated(&gate_slot);
    assert!(gate.is_pending());

    let results = Rc::new(RefCell::new(vec![]));
    for _ in 0..2 {
        let gate = gate.clone();
        let results = Rc::clone(&results);
        spawn(async move {
            let outcome = gate.wait().await;
            results.borrow_mut().push(outcome);
        })
        .detach();
    }
    // both waiters ran inline and suspended on the gate
    assert!(results.borrow().is_empty());

    open(&gate_slot, 5);
    assert_eq!(*results.borrow(), vec![Ok(values![5]), Ok(values![5])]);
}

#[test]
fn work_error_propagates_through_await() {
    init_logging();
    let exec = SimpleExecutor::new();
    let failing = Promise::rejected("upstream");
    let promise = Promise::new(move |resolve, _| async move {
        // the rejection surfaces as an error and rejects this promise too
        let values = failing.await?;
        resolve.call(values);
        Ok(())
    });
    exec.run_until_stalled();
    assert_eq!(promise.state(), State::Rejected);
    assert_eq!(
        promise.value(),
        Some(values!["promise rejected: upstream"])
    );
}

#[test]
fn chain_recovers_and_continues() {
    init_logging();
    let exec = SimpleExecutor::new();
    let result = Promise::resolved(1)
        .then(|v| -> anyhow::Result<i64> { anyhow::bail!("failed at {}", v.integer(0)?) })
        .then(|_| Ok("skipped"))
        .catch(|v| Ok((v.string(0)?.to_string(), 0)))
        .then(|v| Ok(v.integer(1)? + 100));
    let values = exec.run_until(result.wait()).unwrap().unwrap();
    assert_eq!(values, values![100]);
}

#[test]
fn awaiting_a_reference_leaves_the_promise_usable() {
    init_logging();
    let exec = SimpleExecutor::new();
    let promise = Promise::resolved(3);
    let shared = promise.clone();
    let doubled = exec
        .run_until(async move {
            let first = (&shared).await?;
            let second = (&shared).await?;
            Ok::<_, Rejection>(first.integer(0).unwrap() + second.integer(0).unwrap())
        })
        .unwrap();
    assert_eq!(doubled, Ok(6));
    assert_eq!(promise.value(), Some(values![3]));
}

#[test]
fn scoped_executor_drives_promises() {
    init_logging();
    let exec = ScopedExecutor::new();
    let promise = Promise::resolved(20).then(|v| Ok(v.integer(0)? + 1));
    let result = block_on(exec.run(promise.wait()));
    assert_eq!(result, Ok(values![21]));
}

#[test]
fn immediate_executor_settles_synchronously() {
    init_logging();
    let _exec = ImmediateExecutor::new();
    let promise = Promise::new(|resolve, _| async move {
        resolve.call(1);
        Ok(())
    });
    assert_eq!(promise.state(), State::Fulfilled);
    assert_eq!(promise.value(), Some(values![1]));

    let recovered = Promise::rejected(1).catch(|v| Ok(v.integer(0)? + 1));
    assert_eq!(recovered.state(), State::Fulfilled);
    assert_eq!(recovered.value(), Some(values![2]));

    let failed = Promise::new(|_, _| async move { anyhow::bail!("boom") });
    assert_eq!(failed.state(), State::Rejected);
    assert!(failed.value().unwrap().string(0).unwrap().contains("boom"));
}

#[test]
fn side_effects_follow_queue_order() {
    init_logging();
    let exec = SimpleExecutor::new();
    let gate_slot = Rc::new(RefCell::new(None));
    let gate = gated(&gate_slot);
    exec.run_until_stalled();

    let log = Rc::new(RefCell::new(vec![]));
    let first = Rc::clone(&log);
    let second = Rc::clone(&log);
    let a = gate.then(move |_| {
        first.borrow_mut().push("first");
        Ok(())
    });
    let b = gate.finally(move |v| {
        second.borrow_mut().push("second");
        Ok(v)
    });

    open(&gate_slot, ());
    exec.run_until_stalled();
    assert_eq!(*log.borrow(), vec!["first", "second"]);
    assert_eq!(a.state(), State::Fulfilled);
    assert_eq!(b.value(), Some(values![]));
}
