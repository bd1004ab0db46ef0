//! Scheduling, thread lifecycle and cancellation behavior.
//!
//! The tests drive a kernel instance directly: they perform each thread's
//! calls while `current()` names that thread, and advance time with
//! `advance`, exactly as a port would.

use kairos::time::Duration;
use kairos::{priority, Errno, Kernel, Outcome, ThreadState, WakeReason};

fn noop(_arg: usize) -> i32 {
    0
}

#[test]
fn higher_priority_preempts_lower() {
    let k = Kernel::new();
    let a = k.spawn("a", priority::LOW, noop, 0).unwrap();
    assert_eq!(k.current(), a);

    let b = k.spawn("b", priority::HIGH, noop, 0).unwrap();
    assert_eq!(k.current(), b);
    assert_eq!(k.thread_state(a).unwrap(), ThreadState::Ready);

    // Equal priority never preempts.
    let c = k.spawn("c", priority::HIGH, noop, 0).unwrap();
    assert_eq!(k.current(), b);

    // FIFO within the band under yield.
    k.yield_now();
    assert_eq!(k.current(), c);
    k.yield_now();
    assert_eq!(k.current(), b);

    // Exits drain down the priority ladder to the idle thread.
    k.thread_exit(0).unwrap();
    assert_eq!(k.current(), c);
    k.thread_exit(0).unwrap();
    assert_eq!(k.current(), a);
    k.thread_exit(0).unwrap();
    assert_eq!(k.current(), k.idle_thread());

    let stats = k.stats();
    assert_eq!(stats.threads_created, 3);
    assert!(stats.preemptions >= 2);
}

#[test]
fn sleep_wakes_on_deadline_with_timeout_reason() {
    let k = Kernel::new();
    let t = k.spawn("sleeper", priority::NORMAL, noop, 0).unwrap();
    assert!(k.sleep_for(Duration::ticks(3)).is_parked());
    assert_eq!(k.current(), k.idle_thread());

    k.advance(2);
    assert_eq!(k.thread_state(t).unwrap(), ThreadState::Waiting);

    k.advance(1);
    assert_eq!(k.current(), t);
    assert_eq!(k.wake_reason(t).unwrap(), WakeReason::Timeout);
}

#[test]
fn zero_sleep_degrades_to_yield() {
    let k = Kernel::new();
    let a = k.spawn("a", priority::NORMAL, noop, 0).unwrap();
    let b = k.spawn("b", priority::NORMAL, noop, 0).unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.sleep_for(Duration::ZERO).done(), Ok(()));
    assert_eq!(k.current(), b);
}

#[test]
fn join_then_reap_returns_exit_code() {
    let k = Kernel::new();
    let a = k.spawn("a", priority::NORMAL, noop, 0).unwrap();
    let b = k.thread_create("b", priority::LOW, 512, noop, 0).unwrap();
    assert_eq!(k.thread_state(b).unwrap(), ThreadState::Inactive);
    k.thread_start(b).unwrap();

    // a parks joining b; b (lower priority) finally runs.
    assert!(k.thread_join(b).is_parked());
    assert_eq!(k.current(), b);

    // A second joiner is refused.
    let c = k.spawn("c", priority::NORMAL, noop, 0).unwrap();
    assert_eq!(k.thread_join(b).done(), Err(Errno::Busy));
    k.thread_exit(0).unwrap();
    assert_eq!(k.current(), b);

    k.thread_exit(42).unwrap();
    assert_eq!(k.current(), a);
    assert_eq!(k.wake_reason(a).unwrap(), WakeReason::Normal);

    // The target stays reapable until the joiner collects it.
    assert_eq!(k.thread_state(b).unwrap(), ThreadState::Terminated);
    assert_eq!(k.thread_join(b).done(), Ok(42));
    assert_eq!(k.thread_state(b), Err(Errno::InvalidArgument));
    let _ = c;
}

#[test]
fn join_self_is_a_deadlock() {
    let k = Kernel::new();
    let a = k.spawn("a", priority::NORMAL, noop, 0).unwrap();
    assert_eq!(k.thread_join(a).done(), Err(Errno::Deadlock));
}

#[test]
fn kill_unlinks_a_waiting_thread() {
    let k = Kernel::new();
    let s = k.sem_create("s", 0, 1).unwrap();
    let t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    assert!(k.sem_wait(s).is_parked());
    assert_eq!(k.current(), k.idle_thread());

    k.thread_kill(t).unwrap();
    assert_eq!(k.thread_state(t).unwrap(), ThreadState::Terminated);
    assert_eq!(k.thread_reap(t).unwrap(), -1);

    // The wait list no longer references the dead thread.
    k.sem_post(s).unwrap();
    assert_eq!(k.sem_value(s).unwrap(), 1);
}

#[test]
fn service_threads_cannot_be_killed_or_block() {
    let k = Kernel::new();
    assert_eq!(k.thread_kill(k.idle_thread()), Err(Errno::NotPermitted));
    // The idle thread is current at boot; blocking from it is refused.
    assert_eq!(
        k.sleep_for(Duration::ticks(1)).done(),
        Err(Errno::NotPermitted)
    );
}

#[test]
fn interrupt_wins_the_race_against_the_deadline() {
    let k = Kernel::new();
    let s = k.sem_create("s", 0, 1).unwrap();
    let t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();

    assert!(k.sem_wait_timed(s, Duration::ticks(3)).is_parked());
    k.thread_interrupt(t).unwrap();
    assert_eq!(k.current(), t);
    assert_eq!(k.wake_reason(t).unwrap(), WakeReason::Interrupted);

    // The stale deadline must not produce a second wake.
    k.advance(5);
    assert_eq!(k.thread_state(t).unwrap(), ThreadState::Running);
}

#[test]
fn deadline_wins_then_interrupt_pends() {
    let k = Kernel::new();
    let s = k.sem_create("s", 0, 1).unwrap();
    let t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();

    assert!(k.sem_wait_timed(s, Duration::ticks(2)).is_parked());
    k.advance(2);
    assert_eq!(k.current(), t);
    assert_eq!(k.wake_reason(t).unwrap(), WakeReason::Timeout);

    // t runs again; the late interrupt arms a pending flag instead.
    k.thread_interrupt(t).unwrap();
    assert_eq!(k.thread_state(t).unwrap(), ThreadState::Running);

    // The next blocking call consumes it without parking.
    assert_eq!(k.sem_wait(s), Outcome::Done(Err(Errno::Interrupted)));

    // Consumed: the one after parks normally.
    assert!(k.sem_wait_timed(s, Duration::ticks(1)).is_parked());
}

#[test]
fn priority_change_reorders_the_ready_queue() {
    let k = Kernel::new();
    let a = k.spawn("a", priority::NORMAL, noop, 0).unwrap();
    let b = k.spawn("b", priority::LOW, noop, 0).unwrap();
    assert_eq!(k.current(), a);

    // Raising b above a preempts immediately.
    k.thread_set_priority(b, priority::HIGH).unwrap();
    assert_eq!(k.current(), b);
    assert_eq!(k.thread_priority(b).unwrap(), priority::HIGH);
    assert_eq!(k.thread_effective_priority(b).unwrap(), priority::HIGH);

    // Reserved bands are rejected.
    assert_eq!(
        k.thread_set_priority(b, priority::IDLE),
        Err(Errno::InvalidArgument)
    );
    assert_eq!(k.thread_create("x", 240, 512, noop, 0), Err(Errno::InvalidArgument));
}

#[test]
fn wakeup_inside_interrupt_defers_the_switch() {
    let k = Kernel::new();
    let s = k.sem_create("s", 0, 1).unwrap();
    let t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    assert!(k.sem_wait(s).is_parked());
    assert_eq!(k.current(), k.idle_thread());

    k.interrupt(|k| {
        k.sem_post(s).unwrap();
        // Still inside the bracket: no hand-off yet.
        assert_eq!(k.current(), k.idle_thread());
    });
    assert_eq!(k.current(), t);
    assert_eq!(k.wake_reason(t).unwrap(), WakeReason::Normal);
}

#[test]
fn blocking_from_interrupt_context_is_refused() {
    let k = Kernel::new();
    let s = k.sem_create("s", 0, 1).unwrap();
    let _t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    k.interrupt(|k| {
        assert_eq!(k.sem_wait(s).done(), Err(Errno::NotPermitted));
    });
}

#[test]
fn satisfiable_waits_are_still_refused_in_interrupt_context() {
    use kairos::FlagsMode;

    let k = Kernel::new();
    let t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    let s = k.sem_create("s", 1, 1).unwrap();
    let f = k.flags_create("f", 0b1);
    let q = k.mq_create("q", 2, 8).unwrap();
    k.mq_try_send(q, b"m", 0).unwrap();
    let done = k.spawn("done", priority::HIGH, noop, 0).unwrap();
    k.thread_exit(7).unwrap();

    // Each wait would complete without parking, but the class of call is
    // what the gate rejects, not the would-block outcome.
    k.interrupt(|k| {
        assert_eq!(k.sem_wait(s).done(), Err(Errno::NotPermitted));
        assert_eq!(
            k.flags_wait(f, 0b1, FlagsMode::empty()).done(),
            Err(Errno::NotPermitted)
        );
        assert_eq!(
            k.thread_sig_wait(0b1, FlagsMode::empty()).done(),
            Err(Errno::NotPermitted)
        );
        assert_eq!(k.mq_recv(q).done().map(|_| ()), Err(Errno::NotPermitted));
        assert_eq!(k.mq_send(q, b"n", 0).done(), Err(Errno::NotPermitted));
        assert_eq!(k.thread_join(done).done().map(|_| ()), Err(Errno::NotPermitted));
    });

    // Nothing was consumed by the refused calls.
    assert_eq!(k.sem_value(s).unwrap(), 1);
    assert_eq!(k.flags_get(f).unwrap(), 0b1);
    assert_eq!(k.mq_len(q).unwrap(), 1);
    assert_eq!(k.current(), t);
    assert_eq!(k.thread_join(done).done().unwrap(), 7);
}

#[test]
fn signal_flags_wake_a_directed_waiter() {
    let k = Kernel::new();
    let t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    use kairos::FlagsMode;

    assert!(k
        .thread_sig_wait(0b11, FlagsMode::ALL | FlagsMode::CLEAR)
        .is_parked());
    assert_eq!(k.current(), k.idle_thread());

    k.thread_sig_raise(t, 0b01).unwrap();
    assert_eq!(k.thread_state(t).unwrap(), ThreadState::Waiting);

    k.thread_sig_raise(t, 0b10).unwrap();
    assert_eq!(k.current(), t);
    assert_eq!(k.won_flags(t).unwrap(), 0b11);
    assert_eq!(k.thread_sig_pending(), 0);
}
