//! Priority message queue
//!
//! Bounded mailbox of byte messages ordered by message priority, FIFO within
//! a band, with a monotonic sequence number to make the stable order
//! auditable. A send with a receiver already parked hands the message over
//! directly, never touching the ring; a receive that frees a slot promotes
//! the best blocked sender's message into the ring.

use crate::contract;
use crate::error::{Errno, Outcome, Result};
use crate::kernel::{Kernel, KernelState};
use crate::scheduler::thread::{QueueLink, Tcb, ThreadId, WaitTarget, WakeReason};
use crate::time::Duration;
use crate::utils::{Handle, List};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Box<[u8]>,
    pub priority: u8,
    /// Arrival order within the queue, for stable-order auditing
    pub seq: u64,
}

/// Handle to a message queue.
pub type QueueId = Handle<QueueRec>;

/// Message queue record.
pub struct QueueRec {
    pub(crate) name: Box<str>,
    pub(crate) capacity: usize,
    pub(crate) msg_size: usize,
    /// Messages, priority descending then arrival order
    pub(crate) ring: VecDeque<Message>,
    pub(crate) next_seq: u64,
    pub(crate) senders: List<Tcb, QueueLink>,
    pub(crate) receivers: List<Tcb, QueueLink>,
}

impl QueueRec {
    /// Insert preserving priority-descending, FIFO-within-band order.
    fn push_ordered(&mut self, msg: Message) {
        let at = self
            .ring
            .iter()
            .position(|m| m.priority < msg.priority)
            .unwrap_or(self.ring.len());
        self.ring.insert(at, msg);
    }
}

impl KernelState {
    /// Promote the best blocked sender's message into a freed ring slot.
    fn promote_sender(&mut self, qid: QueueId) {
        let sender = match self.queues.get_mut(qid) {
            Some(q) if q.ring.len() < q.capacity => q.senders.pop_front(&mut self.threads),
            _ => None,
        };
        if let Some(s) = sender {
            let msg = self
                .threads
                .get_mut(s)
                .and_then(|t| t.outbox.take())
                .expect("blocked sender without a message");
            self.queues.get_mut(qid).expect("checked above").push_ordered(msg);
            self.make_ready(s, WakeReason::Normal);
        }
    }

    /// Deliver `msg` without blocking, if possible. Commits the message's
    /// sequence stamp on success.
    fn mq_offer(&mut self, qid: QueueId, msg: Message) -> core::result::Result<(), Message> {
        let receiver = match self.queues.get_mut(qid) {
            Some(q) => q.receivers.pop_front(&mut self.threads),
            None => return Err(msg),
        };
        if let Some(r) = receiver {
            // Direct hand-off to the best parked receiver.
            self.commit_seq(qid);
            self.threads.get_mut(r).expect("receiver vanished").inbox = Some(msg);
            self.make_ready(r, WakeReason::Normal);
            return Ok(());
        }
        let q = self.queues.get_mut(qid).expect("checked above");
        if q.ring.len() < q.capacity {
            q.next_seq += 1;
            q.push_ordered(msg);
            Ok(())
        } else {
            Err(msg)
        }
    }

    /// Build a message carrying the next sequence stamp without consuming
    /// it. A send that never enters the queue leaves no gap in the arrival
    /// order; [`commit_seq`] advances the counter once the message lands.
    ///
    /// [`commit_seq`]: KernelState::commit_seq
    fn stamp(&self, qid: QueueId, data: Box<[u8]>, priority: u8) -> Result<Message> {
        let q = match self.queues.get(qid) {
            Some(q) => q,
            None => return Err(Errno::InvalidArgument),
        };
        if data.len() > q.msg_size {
            return Err(Errno::MessageTooLarge);
        }
        Ok(Message {
            data,
            priority,
            seq: q.next_seq,
        })
    }

    fn commit_seq(&mut self, qid: QueueId) {
        if let Some(q) = self.queues.get_mut(qid) {
            q.next_seq += 1;
        }
    }
}

impl Kernel {
    /// Create a queue holding up to `capacity` messages of at most
    /// `msg_size` bytes.
    pub fn mq_create(&self, name: &str, capacity: usize, msg_size: usize) -> Result<QueueId> {
        if capacity == 0 || msg_size == 0 {
            return Err(Errno::InvalidArgument);
        }
        let name: Box<str> = if name.is_empty() {
            Box::from("-")
        } else {
            Box::from(name)
        };
        self.with_state(|st| {
            Ok(st.queues.insert(QueueRec {
                name,
                capacity,
                msg_size,
                ring: VecDeque::with_capacity(capacity),
                next_seq: 0,
                senders: List::new(),
                receivers: List::new(),
            }))
        })
    }

    fn mq_send_inner(
        &self,
        qid: QueueId,
        data: &[u8],
        priority: u8,
        timeout: Option<Duration>,
    ) -> Outcome {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation("isr", "mq_send", Errno::NotPermitted));
            }
            let msg = match st.stamp(qid, Box::from(data), priority) {
                Ok(m) => m,
                Err(e) => return Outcome::Done(Err(e)),
            };
            let msg = match st.mq_offer(qid, msg) {
                Ok(()) => return Outcome::Done(Ok(())),
                Err(msg) => msg,
            };
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            let tid = st.current;
            let deadline = timeout.map(|d| st.clock.deadline_after(d));
            let eff = u64::from(
                st.threads.get(tid).expect("current thread dead").effective_priority,
            );
            // A parked send is committed; the message rides in the outbox
            // until a slot frees.
            st.commit_seq(qid);
            st.threads.get_mut(tid).expect("current thread dead").outbox = Some(msg);
            st.queues
                .get_mut(qid)
                .expect("checked above")
                .senders
                .insert_descending(&mut st.threads, tid, eff);
            st.park_current(WaitTarget::QueueSend(qid), deadline);
            Outcome::Parked
        })
    }

    /// Send a message, parking while the queue is full.
    pub fn mq_send(&self, qid: QueueId, data: &[u8], priority: u8) -> Outcome {
        self.mq_send_inner(qid, data, priority, None)
    }

    /// As [`mq_send`], with a relative deadline.
    ///
    /// [`mq_send`]: Kernel::mq_send
    pub fn mq_send_timed(
        &self,
        qid: QueueId,
        data: &[u8],
        priority: u8,
        timeout: Duration,
    ) -> Outcome {
        self.mq_send_inner(qid, data, priority, Some(timeout))
    }

    /// Send without blocking; `Errno::Busy` when the queue is full and no
    /// receiver waits. Callable from interrupt context.
    pub fn mq_try_send(&self, qid: QueueId, data: &[u8], priority: u8) -> Result<()> {
        self.with_state(|st| {
            let msg = st.stamp(qid, Box::from(data), priority)?;
            st.mq_offer(qid, msg).map_err(|_| Errno::Busy)
        })
    }

    fn mq_recv_inner(&self, qid: QueueId, timeout: Option<Duration>) -> Outcome<Message> {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation("isr", "mq_recv", Errno::NotPermitted));
            }
            let front = match st.queues.get_mut(qid) {
                Some(q) => q.ring.pop_front(),
                None => return Outcome::Done(Err(Errno::InvalidArgument)),
            };
            if let Some(msg) = front {
                st.promote_sender(qid);
                return Outcome::Done(Ok(msg));
            }
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            let tid = st.current;
            let deadline = timeout.map(|d| st.clock.deadline_after(d));
            let eff = u64::from(
                st.threads.get(tid).expect("current thread dead").effective_priority,
            );
            st.queues
                .get_mut(qid)
                .expect("checked above")
                .receivers
                .insert_descending(&mut st.threads, tid, eff);
            st.park_current(WaitTarget::QueueRecv(qid), deadline);
            Outcome::Parked
        })
    }

    /// Receive the highest-priority message, parking while the queue is
    /// empty. After parking, the message is collected with
    /// [`take_received`].
    ///
    /// [`take_received`]: Kernel::take_received
    pub fn mq_recv(&self, qid: QueueId) -> Outcome<Message> {
        self.mq_recv_inner(qid, None)
    }

    /// As [`mq_recv`], with a relative deadline.
    ///
    /// [`mq_recv`]: Kernel::mq_recv
    pub fn mq_recv_timed(&self, qid: QueueId, timeout: Duration) -> Outcome<Message> {
        self.mq_recv_inner(qid, Some(timeout))
    }

    /// Receive without blocking; `Errno::Busy` when the queue is empty.
    pub fn mq_try_recv(&self, qid: QueueId) -> Result<Message> {
        self.with_state(|st| {
            let front = match st.queues.get_mut(qid) {
                Some(q) => q.ring.pop_front(),
                None => return Err(Errno::InvalidArgument),
            };
            match front {
                Some(msg) => {
                    st.promote_sender(qid);
                    Ok(msg)
                }
                None => Err(Errno::Busy),
            }
        })
    }

    /// Collect the message delivered to `tid` by a hand-off while it was
    /// parked receiving.
    pub fn take_received(&self, tid: ThreadId) -> Option<Message> {
        self.with_state(|st| st.threads.get_mut(tid).and_then(|t| t.inbox.take()))
    }

    /// Messages currently queued.
    pub fn mq_len(&self, qid: QueueId) -> Result<usize> {
        self.with_state(|st| st.queues.get(qid).map(|q| q.ring.len()).ok_or(Errno::InvalidArgument))
    }

    pub fn mq_is_empty(&self, qid: QueueId) -> Result<bool> {
        Ok(self.mq_len(qid)? == 0)
    }

    pub fn mq_is_full(&self, qid: QueueId) -> Result<bool> {
        self.with_state(|st| {
            st.queues
                .get(qid)
                .map(|q| q.ring.len() >= q.capacity)
                .ok_or(Errno::InvalidArgument)
        })
    }

    /// Discard every queued message, then refill from blocked senders.
    /// Returns the number discarded.
    pub fn mq_flush(&self, qid: QueueId) -> Result<usize> {
        self.with_state(|st| {
            let drained = match st.queues.get_mut(qid) {
                Some(q) => {
                    let n = q.ring.len();
                    q.ring.clear();
                    n
                }
                None => return Err(Errno::InvalidArgument),
            };
            loop {
                let blocked = st
                    .queues
                    .get(qid)
                    .map(|q| !q.senders.is_empty() && q.ring.len() < q.capacity)
                    .unwrap_or(false);
                if !blocked {
                    break;
                }
                st.promote_sender(qid);
            }
            Ok(drained)
        })
    }

    /// Destroy an uncontended queue; queued messages are dropped.
    pub fn mq_delete(&self, qid: QueueId) -> Result<()> {
        self.with_state(|st| {
            let q = match st.queues.get(qid) {
                Some(q) => q,
                None => return Err(Errno::InvalidArgument),
            };
            if !q.senders.is_empty() || !q.receivers.is_empty() {
                return Err(Errno::Busy);
            }
            st.queues.remove(qid);
            Ok(())
        })
    }

    pub fn mq_name(&self, qid: QueueId) -> Result<String> {
        self.with_state(|st| {
            st.queues
                .get(qid)
                .map(|q| String::from(&*q.name))
                .ok_or(Errno::InvalidArgument)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(p: u8, seq: u64) -> Message {
        Message {
            data: Box::from(&[p][..]),
            priority: p,
            seq,
        }
    }

    #[test]
    fn ring_orders_by_priority_then_arrival() {
        let mut q = QueueRec {
            name: Box::from("q"),
            capacity: 8,
            msg_size: 8,
            ring: VecDeque::new(),
            next_seq: 0,
            senders: List::new(),
            receivers: List::new(),
        };
        q.push_ordered(msg(1, 0));
        q.push_ordered(msg(3, 1));
        q.push_ordered(msg(3, 2));
        q.push_ordered(msg(2, 3));
        let order: alloc::vec::Vec<(u8, u64)> =
            q.ring.iter().map(|m| (m.priority, m.seq)).collect();
        assert_eq!(order, alloc::vec![(3, 1), (3, 2), (2, 3), (1, 0)]);
    }
}
