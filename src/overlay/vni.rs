// VXLAN Network Identifier allocation.
//
// VNIs are 24-bit with 0 reserved as "unallocated". The allocator never hands
// out a live id twice; exhaustion is reported, not fatal.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::overlay::error::{OverlayError, OverlayResult};

/// Highest valid VNI (24-bit space).
pub const VNI_MAX: u32 = (1 << 24) - 1;

#[derive(Debug)]
struct AllocatorState {
    in_use: HashSet<u32>,
    /// Next candidate to try, rotated on every allocation so released ids are
    /// not immediately reused.
    next: u32,
}

/// Concurrent-safe allocator for the 24-bit VNI space.
#[derive(Debug)]
pub struct VniAllocator {
    state: Mutex<AllocatorState>,
}

impl VniAllocator {
    pub fn new() -> Self {
        VniAllocator {
            state: Mutex::new(AllocatorState {
                in_use: HashSet::new(),
                next: 1,
            }),
        }
    }

    /// Reserve and return a free VNI.
    pub fn get_id(&self) -> OverlayResult<u32> {
        let mut state = self.state.lock();
        if state.in_use.len() as u32 >= VNI_MAX {
            return Err(OverlayError::ResourceExhausted);
        }

        let mut candidate = state.next;
        loop {
            if candidate == 0 || candidate > VNI_MAX {
                candidate = 1;
            }
            if !state.in_use.contains(&candidate) {
                state.in_use.insert(candidate);
                state.next = candidate + 1;
                return Ok(candidate);
            }
            candidate += 1;
        }
    }

    /// Return a VNI to the free pool. Releasing 0 or an id that was never
    /// handed out is a no-op.
    pub fn release(&self, id: u32) {
        if id == 0 {
            return;
        }
        self.state.lock().in_use.remove(&id);
    }

    /// Number of currently reserved ids.
    pub fn live(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

impl Default for VniAllocator {
    fn default() -> Self {
        Self::new()
    }
}
