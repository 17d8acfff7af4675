//! Handle types: the tagged handle seen by callers and the executor-side
//! table that maps small integers to live resources.

use crate::error::{FioError, Result};
use crate::protocol::{FDMAX, MAX_HANDLE_VALUE};

#[cfg(unix)]
pub type RawDescriptor = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawHandle;

/// Identifies which side owns an open file.
///
/// A remote index and a native descriptor never share one integer space;
/// the variant alone decides how an operation is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    /// Slot in the executor's handle table
    Remote(u8),
    /// Native descriptor owned by this process
    Local(RawDescriptor),
}

impl Handle {
    pub fn is_remote(&self) -> bool {
        matches!(self, Handle::Remote(_))
    }
}

/// Fixed-capacity table of live resources on the executing side.
///
/// Only the agent loop owns one, so there is no locking. Slots are handed
/// out lowest-first and reused only after `release`.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    live: usize,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::with_capacity(FDMAX)
    }

    /// Capacity is clamped to what the 7-bit handle field can address.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_HANDLE_VALUE as usize + 1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, live: 0 }
    }

    pub fn allocate(&mut self, resource: T) -> Result<u8> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FioError::OutOfHandles)?;
        self.slots[index] = Some(resource);
        self.live += 1;
        Ok(index as u8)
    }

    pub fn resolve(&mut self, handle: u8) -> Result<&mut T> {
        self.slots
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(FioError::InvalidHandle(handle))
    }

    pub fn release(&mut self, handle: u8) -> Result<T> {
        let resource = self
            .slots
            .get_mut(handle as usize)
            .and_then(Option::take)
            .ok_or(FioError::InvalidHandle(handle))?;
        self.live -= 1;
        Ok(resource)
    }

    /// Release every live slot, returning the resources in handle order.
    pub fn drain(&mut self) -> Vec<(u8, T)> {
        self.live = 0;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.take().map(|r| (i as u8, r)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
