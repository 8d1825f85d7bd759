//! Extranonce1 allocation.
//!
//! Each connection leases a 4-byte extranonce1: the pool instance id
//! followed by a 24-bit counter. A value is never handed out twice while
//! its lease is alive, so no two live miners search the same coinbase
//! space. Instances sharing a daemon must use distinct instance ids.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

pub const EXTRANONCE1_SIZE: usize = 4;

const COUNTER_SPACE: u32 = 1 << 24;

#[derive(Debug)]
pub struct ExtranonceAllocator {
    instance_id: u8,
    state: Mutex<AllocatorState>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    next: u32,
    leased: HashSet<u32>,
}

impl ExtranonceAllocator {
    pub fn new(instance_id: u8) -> Arc<Self> {
        Arc::new(Self {
            instance_id,
            state: Mutex::new(AllocatorState::default()),
        })
    }

    /// Lease the next free value. `None` when all 2^24 values are live.
    pub fn lease(self: &Arc<Self>) -> Option<ExtranonceLease> {
        let mut state = self.state.lock();
        if state.leased.len() >= COUNTER_SPACE as usize {
            return None;
        }

        loop {
            let counter = state.next;
            state.next = (state.next + 1) % COUNTER_SPACE;
            if state.leased.insert(counter) {
                return Some(ExtranonceLease {
                    allocator: Arc::clone(self),
                    counter,
                });
            }
        }
    }

    pub fn leased(&self) -> usize {
        self.state.lock().leased.len()
    }
}

/// A live extranonce1; released on drop.
#[derive(Debug)]
pub struct ExtranonceLease {
    allocator: Arc<ExtranonceAllocator>,
    counter: u32,
}

impl ExtranonceLease {
    pub fn bytes(&self) -> [u8; EXTRANONCE1_SIZE] {
        let counter = self.counter.to_be_bytes();
        [self.allocator.instance_id, counter[1], counter[2], counter[3]]
    }
}

impl Drop for ExtranonceLease {
    fn drop(&mut self) {
        self.allocator.state.lock().leased.remove(&self.counter);
    }
}
