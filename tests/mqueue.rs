//! Priority message queue delivery, back-pressure and hand-off.

use kairos::time::Duration;
use kairos::{priority, Errno, Kernel, ThreadState, WakeReason};

fn noop(_arg: usize) -> i32 {
    0
}

#[test]
fn receive_follows_priority_then_arrival() {
    let k = Kernel::new();
    let _t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 8, 16).unwrap();

    k.mq_send(q, b"low", 1).done().unwrap();
    k.mq_send(q, b"hi-1", 9).done().unwrap();
    k.mq_send(q, b"mid", 5).done().unwrap();
    k.mq_send(q, b"hi-2", 9).done().unwrap();
    assert_eq!(k.mq_len(q).unwrap(), 4);

    let got = k.mq_recv(q).done().unwrap();
    assert_eq!(&*got.data, b"hi-1");
    assert_eq!(got.priority, 9);
    assert_eq!(&*k.mq_recv(q).done().unwrap().data, b"hi-2");
    assert_eq!(&*k.mq_recv(q).done().unwrap().data, b"mid");
    assert_eq!(&*k.mq_recv(q).done().unwrap().data, b"low");
    assert!(k.mq_is_empty(q).unwrap());
}

#[test]
fn oversized_and_overfull_sends_are_refused() {
    let k = Kernel::new();
    let _t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 2, 4).unwrap();

    assert_eq!(k.mq_try_send(q, b"too-long", 0), Err(Errno::MessageTooLarge));

    k.mq_try_send(q, b"a", 0).unwrap();
    k.mq_try_send(q, b"b", 0).unwrap();
    assert!(k.mq_is_full(q).unwrap());
    assert_eq!(k.mq_try_send(q, b"c", 0), Err(Errno::Busy));
}

#[test]
fn send_hands_the_message_to_a_parked_receiver() {
    let k = Kernel::new();
    let rx = k.spawn("rx", priority::HIGH, noop, 0).unwrap();
    let q = k.mq_create("q", 1, 8).unwrap();

    assert!(k.mq_recv(q).is_parked());
    assert_eq!(k.current(), k.idle_thread());

    let tx = k.spawn("tx", priority::NORMAL, noop, 0).unwrap();
    k.mq_try_send(q, b"ping", 3).unwrap();
    // Direct hand-off: the slot was never consumed.
    assert!(k.mq_is_empty(q).unwrap());
    assert_eq!(k.current(), rx);
    let msg = k.take_received(rx).unwrap();
    assert_eq!(&*msg.data, b"ping");
    assert_eq!(msg.priority, 3);

    k.thread_exit(0).unwrap();
    assert_eq!(k.current(), tx);
}

#[test]
fn full_queue_parks_the_sender_until_a_slot_frees() {
    let k = Kernel::new();
    let tx = k.spawn("tx", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 2, 8).unwrap();

    k.mq_send(q, b"a", 0).done().unwrap();
    k.mq_send(q, b"b", 0).done().unwrap();
    assert!(k.mq_send(q, b"c", 9).is_parked());
    assert_eq!(k.current(), k.idle_thread());

    // Draining one slot promotes the blocked sender's message.
    let rx = k.spawn("rx", priority::HIGH, noop, 0).unwrap();
    assert_eq!(&*k.mq_recv(q).done().unwrap().data, b"a");
    assert_eq!(k.thread_state(tx).unwrap(), ThreadState::Ready);
    assert_eq!(k.wake_reason(tx).unwrap(), WakeReason::Normal);
    assert_eq!(k.mq_len(q).unwrap(), 2);

    // The promoted message keeps its own priority.
    assert_eq!(&*k.mq_recv(q).done().unwrap().data, b"c");
    assert_eq!(&*k.mq_recv(q).done().unwrap().data, b"b");
    let _ = rx;
}

#[test]
fn timed_send_gives_up_on_sustained_back_pressure() {
    let k = Kernel::new();
    let tx = k.spawn("tx", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 1, 8).unwrap();

    k.mq_send(q, b"a", 0).done().unwrap();
    assert!(k.mq_send_timed(q, b"b", 0, Duration::ticks(4)).is_parked());
    k.advance(4);
    assert_eq!(k.current(), tx);
    assert_eq!(k.wake_reason(tx).unwrap(), WakeReason::Timeout);
    // The abandoned message never entered the queue.
    assert_eq!(k.mq_len(q).unwrap(), 1);
}

#[test]
fn timed_recv_gives_up_on_an_empty_queue() {
    let k = Kernel::new();
    let rx = k.spawn("rx", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 1, 8).unwrap();

    assert!(k.mq_recv_timed(q, Duration::ticks(2)).is_parked());
    k.advance(2);
    assert_eq!(k.current(), rx);
    assert_eq!(k.wake_reason(rx).unwrap(), WakeReason::Timeout);
    assert!(k.take_received(rx).is_none());
}

#[test]
fn flush_drops_messages_and_readmits_senders() {
    let k = Kernel::new();
    let tx = k.spawn("tx", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 2, 8).unwrap();

    k.mq_send(q, b"a", 0).done().unwrap();
    k.mq_send(q, b"b", 0).done().unwrap();
    assert!(k.mq_send(q, b"c", 0).is_parked());

    let dropped = k.mq_flush(q).unwrap();
    assert_eq!(dropped, 2);
    // The blocked sender's message took a freed slot and the sender ran.
    assert_eq!(k.mq_len(q).unwrap(), 1);
    assert_eq!(k.current(), tx);
    assert_eq!(&*k.mq_recv(q).done().unwrap().data, b"c");
}

#[test]
fn refused_sends_leave_no_gap_in_arrival_order() {
    let k = Kernel::new();
    let _t = k.spawn("t", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 2, 4).unwrap();

    k.mq_try_send(q, b"a", 0).unwrap();
    k.mq_try_send(q, b"b", 0).unwrap();
    assert_eq!(k.mq_try_send(q, b"c", 0), Err(Errno::Busy));
    assert_eq!(k.mq_try_send(q, b"too-long", 0), Err(Errno::MessageTooLarge));

    assert_eq!(k.mq_try_recv(q).unwrap().seq, 0);
    k.mq_try_send(q, b"d", 0).unwrap();
    // The two refused sends consumed no stamps.
    assert_eq!(k.mq_try_recv(q).unwrap().seq, 1);
    assert_eq!(k.mq_try_recv(q).unwrap().seq, 2);
}

#[test]
fn queue_delete_refuses_while_threads_wait() {
    let k = Kernel::new();
    let _rx = k.spawn("rx", priority::NORMAL, noop, 0).unwrap();
    let q = k.mq_create("q", 1, 8).unwrap();
    assert!(k.mq_recv(q).is_parked());
    assert_eq!(k.mq_delete(q), Err(Errno::Busy));
}

#[test]
fn invalid_queue_geometry_is_rejected() {
    let k = Kernel::new();
    assert_eq!(k.mq_create("q", 0, 8).map(|_| ()), Err(Errno::InvalidArgument));
    assert_eq!(k.mq_create("q", 4, 0).map(|_| ()), Err(Errno::InvalidArgument));
}
