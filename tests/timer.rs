//! Software timer arming, expiry and callback dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kairos::time::Duration;
use kairos::{priority, Errno, Kernel, TimerId, TimerKind};

fn noop(_arg: usize) -> i32 {
    0
}

fn counting(k: &Kernel, kind: TimerKind) -> (TimerId, Arc<AtomicU64>) {
    let hits = Arc::new(AtomicU64::new(0));
    let probe = Arc::clone(&hits);
    let id = k.timer_create(
        "t",
        kind,
        Box::new(move |_k| {
            probe.fetch_add(1, Ordering::Relaxed);
        }),
    );
    (id, hits)
}

#[test]
fn periodic_timer_fires_once_per_period() {
    let k = Kernel::new();
    let (t, hits) = counting(&k, TimerKind::Periodic);

    k.timer_start(t, Duration::ticks(10)).unwrap();
    k.advance(25);
    assert_eq!(hits.load(Ordering::Relaxed), 2);
    assert_eq!(k.timer_firings(t).unwrap(), 2);

    k.advance(10);
    assert_eq!(hits.load(Ordering::Relaxed), 3);
    assert!(k.timer_is_armed(t).unwrap());
}

#[test]
fn periodic_deadlines_do_not_drift() {
    let k = Kernel::new();
    let (t, hits) = counting(&k, TimerKind::Periodic);

    // With period 3 the expiries land on ticks 3, 6 and 9 exactly.
    k.timer_start(t, Duration::ticks(3)).unwrap();
    k.advance(2);
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    k.advance(1);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    k.advance(7);
    assert_eq!(hits.load(Ordering::Relaxed), 3);
}

#[test]
fn one_shot_fires_once_then_disarms() {
    let k = Kernel::new();
    let (t, hits) = counting(&k, TimerKind::OneShot);

    k.timer_start(t, Duration::ticks(5)).unwrap();
    k.advance(20);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert!(!k.timer_is_armed(t).unwrap());

    // Re-arming runs it again.
    k.timer_restart(t).unwrap();
    k.advance(5);
    assert_eq!(hits.load(Ordering::Relaxed), 2);
}

#[test]
fn stop_discards_a_queued_firing() {
    let k = Kernel::new();
    let (t, hits) = counting(&k, TimerKind::Periodic);
    k.timer_start(t, Duration::ticks(2)).unwrap();

    // Expiry in interrupt context queues the firing but defers dispatch;
    // stopping before the bracket closes discards it.
    k.interrupt(|k| {
        k.advance(2);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        k.timer_stop(t).unwrap();
        assert!(!k.timer_is_armed(t).unwrap());
    });
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    k.advance(4);
    assert_eq!(hits.load(Ordering::Relaxed), 0);
}

#[test]
fn stopping_a_disarmed_timer_is_an_error() {
    let k = Kernel::new();
    let (t, _hits) = counting(&k, TimerKind::OneShot);
    assert_eq!(k.timer_stop(t), Err(Errno::InvalidState));

    k.timer_delete(t).unwrap();
    assert_eq!(k.timer_start(t, Duration::ticks(1)), Err(Errno::InvalidArgument));
}

#[test]
fn zero_period_is_rejected() {
    let k = Kernel::new();
    let (t, _hits) = counting(&k, TimerKind::Periodic);
    assert_eq!(k.timer_start(t, Duration::ZERO), Err(Errno::InvalidArgument));
}

#[test]
fn restart_replaces_the_pending_deadline() {
    let k = Kernel::new();
    let (t, hits) = counting(&k, TimerKind::OneShot);

    k.timer_start(t, Duration::ticks(10)).unwrap();
    k.advance(8);
    // Restart pushes the deadline out to tick 18.
    k.timer_restart(t).unwrap();
    k.advance(9);
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    k.advance(1);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn callback_may_delete_its_own_timer() {
    let k = Kernel::new();
    let hits = Arc::new(AtomicU64::new(0));
    let probe = Arc::clone(&hits);
    let slot: Arc<std::sync::Mutex<Option<TimerId>>> = Arc::new(std::sync::Mutex::new(None));
    let slot2 = Arc::clone(&slot);
    let t = k.timer_create(
        "suicide",
        TimerKind::Periodic,
        Box::new(move |k| {
            probe.fetch_add(1, Ordering::Relaxed);
            let id = slot2.lock().unwrap().take().expect("timer id published");
            k.timer_delete(id).unwrap();
        }),
    );
    *slot.lock().unwrap() = Some(t);

    k.timer_start(t, Duration::ticks(1)).unwrap();
    k.advance(5);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert_eq!(k.timer_firings(t), Err(Errno::InvalidArgument));
}

#[test]
fn callbacks_run_on_the_service_thread_and_cannot_block() {
    let k = Kernel::new();
    let _t = k.spawn("app", priority::NORMAL, noop, 0).unwrap();
    let s = k.sem_create("s", 0, 1).unwrap();

    let verdict = Arc::new(AtomicU64::new(0));
    let probe = Arc::clone(&verdict);
    let tm = k.timer_create(
        "blocker",
        TimerKind::OneShot,
        Box::new(move |k| {
            match k.sem_wait(s).done() {
                Err(Errno::NotPermitted) => probe.store(1, Ordering::Relaxed),
                _ => probe.store(2, Ordering::Relaxed),
            }
        }),
    );
    k.timer_start(tm, Duration::ticks(1)).unwrap();
    k.advance(1);
    assert_eq!(verdict.load(Ordering::Relaxed), 1);
}
