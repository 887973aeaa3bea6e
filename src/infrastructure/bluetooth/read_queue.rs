//! Read Queue
//!
//! Most BLE stacks reject a second read while one is outstanding on the
//! same connection, so one-shot reads go through this FIFO with at most
//! one request in flight. The queue only does the bookkeeping; the state
//! machine issues the read the queue hands out.

use crate::infrastructure::bluetooth::transport::{CharacteristicHandle, Generation, ReadRequestId};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightRead {
    pub request: ReadRequestId,
    pub handle: CharacteristicHandle,
}

#[derive(Debug)]
pub struct ReadQueue {
    generation: Generation,
    pending: VecDeque<CharacteristicHandle>,
    in_flight: Option<InFlightRead>,
    next_seq: u64,
}

impl ReadQueue {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            pending: VecDeque::new(),
            in_flight: None,
            next_seq: 0,
        }
    }

    /// Append to the tail. Returns false if the characteristic is already
    /// waiting; reads that were already serviced may be queued again.
    pub fn enqueue(&mut self, handle: CharacteristicHandle) -> bool {
        if self.pending.iter().any(|h| h.uuid == handle.uuid) {
            return false;
        }
        self.pending.push_back(handle);
        true
    }

    /// If idle, pop the head and mark it in flight. The caller must issue
    /// exactly one read for the returned request.
    pub fn next_read(&mut self) -> Option<InFlightRead> {
        if self.in_flight.is_some() {
            return None;
        }
        let handle = self.pending.pop_front()?;
        let read = InFlightRead {
            request: ReadRequestId {
                generation: self.generation,
                seq: self.next_seq,
            },
            handle,
        };
        self.next_seq += 1;
        self.in_flight = Some(read);
        Some(read)
    }

    /// Settle the in-flight read. Returns `None` for a request this queue
    /// is not waiting on, which the caller must discard.
    pub fn complete(&mut self, request: ReadRequestId) -> Option<CharacteristicHandle> {
        match self.in_flight {
            Some(read) if read.request == request => {
                self.in_flight = None;
                Some(read.handle)
            }
            _ => None,
        }
    }

    /// Drop pending entries. An in-flight read is left to complete.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn in_flight(&self) -> Option<&InFlightRead> {
        self.in_flight.as_ref()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &CharacteristicHandle> {
        self.pending.iter()
    }
}
