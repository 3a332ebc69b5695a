//! Time-ordered store of pending requests
//!
//! A stable priority queue over preallocated storage: earliest deadline
//! first, ties broken by insertion order via a monotonic sequence number.
//! `len` is constant time and pushing past capacity is an error, never a
//! reallocation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use aria_core::{EngineError, EngineResult, Time};

use crate::request::Request;

pub(crate) struct ScheduleItem {
    time: Time,
    seq: u64,
    pub request: Request,
}

impl ScheduleItem {
    pub fn time(&self) -> Time {
        self.time
    }
}

impl PartialEq for ScheduleItem {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduleItem {}

impl PartialOrd for ScheduleItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted on both keys: the max-heap surfaces the earliest
        // deadline, and of equal deadlines the earliest insertion.
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct Scheduler {
    queue: BinaryHeap<ScheduleItem>,
    capacity: usize,
    seq: u64,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: BinaryHeap::with_capacity(capacity),
            capacity,
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a request for `time`; fails when at capacity
    pub fn push(&mut self, time: Time, request: Request) -> EngineResult<()> {
        if self.queue.len() >= self.capacity {
            return Err(EngineError::QueueOverflow);
        }
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(ScheduleItem { time, seq, request });
        Ok(())
    }

    /// Deadline of the earliest item; the scheduler must not be empty
    pub fn time(&self) -> Time {
        self.queue.peek().expect("empty scheduler").time
    }

    /// Remove and return the earliest item; the scheduler must not be
    /// empty
    pub fn pop(&mut self) -> ScheduleItem {
        self.queue.pop().expect("empty scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosc::{OscMessage, OscPacket};

    fn request(tag: &str) -> Request {
        Request::from_packet(OscPacket::Message(OscMessage {
            addr: format!("/{tag}"),
            args: vec![],
        }))
    }

    fn addr(item: &ScheduleItem) -> String {
        match item.request.packet() {
            OscPacket::Message(m) => m.addr.clone(),
            OscPacket::Bundle(_) => unreachable!(),
        }
    }

    #[test]
    fn test_earliest_deadline_first() {
        let mut scheduler = Scheduler::new(8);
        scheduler.push(3.0, request("c")).unwrap();
        scheduler.push(1.0, request("a")).unwrap();
        scheduler.push(2.0, request("b")).unwrap();

        assert_eq!(scheduler.time(), 1.0);
        assert_eq!(addr(&scheduler.pop()), "/a");
        assert_eq!(addr(&scheduler.pop()), "/b");
        assert_eq!(addr(&scheduler.pop()), "/c");
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut scheduler = Scheduler::new(8);
        scheduler.push(1.0, request("first")).unwrap();
        scheduler.push(1.0, request("second")).unwrap();
        scheduler.push(1.0, request("third")).unwrap();

        assert_eq!(addr(&scheduler.pop()), "/first");
        assert_eq!(addr(&scheduler.pop()), "/second");
        assert_eq!(addr(&scheduler.pop()), "/third");
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut scheduler = Scheduler::new(2);
        scheduler.push(1.0, request("a")).unwrap();
        scheduler.push(2.0, request("b")).unwrap();
        assert_eq!(
            scheduler.push(3.0, request("c")),
            Err(EngineError::QueueOverflow)
        );
        // Existing items are untouched.
        assert_eq!(scheduler.len(), 2);
        assert_eq!(addr(&scheduler.pop()), "/a");
    }

    #[test]
    fn test_popped_deadlines_non_decreasing() {
        let mut scheduler = Scheduler::new(64);
        let times = [5.0, 1.0, 3.0, 1.0, 4.0, 2.0, 5.0, 0.5];
        for t in times {
            scheduler.push(t, request("x")).unwrap();
        }
        let mut last = f64::NEG_INFINITY;
        while !scheduler.is_empty() {
            let t = scheduler.time();
            assert!(t >= last);
            last = t;
            scheduler.pop();
        }
    }
}
