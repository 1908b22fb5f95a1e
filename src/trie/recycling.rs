//! Slab-backed node allocation for the account modification log trie.
//!
//! The pointer-based [`super::merkle_trie::MerkleTrie`] is general-purpose
//! and used everywhere else in the engine. The account log, however, is
//! rebuilt from scratch every block (it only ever accumulates inserts
//! within a block before being merged into the persistent log and
//! discarded), so its nodes are ideal candidates for bump allocation out of
//! large reusable buffers instead of one `Box` per node. This module is
//! gated behind the `recycling-trie` feature and is grounded on
//! `trie/recycling_impl/allocator.h` in the original source: buffer-id +
//! offset packed into a 32-bit handle, buffers handed out from a shared
//! pool, reclaimed only by resetting the whole allocator between blocks.

#[allow(dead_code)]
const BUFFER_ID_BITS: u32 = 8;
const OFFSET_BITS: u32 = 24;
const OFFSET_MASK: u32 = (1u32 << OFFSET_BITS) - 1;
const BUF_SIZE: usize = 500_000;
const MAX_BUFFERS: usize = 256;

/// A handle into a [`SlabAllocator`]'s backing storage: buffer id in the
/// high 8 bits, offset within that buffer in the low 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabHandle(u32);

impl SlabHandle {
    pub const NULL: SlabHandle = SlabHandle(u32::MAX);

    fn new(buffer_id: u8, offset: u32) -> Self {
        debug_assert!(offset <= OFFSET_MASK);
        SlabHandle(((buffer_id as u32) << OFFSET_BITS) | offset)
    }

    fn buffer_id(self) -> u8 {
        (self.0 >> OFFSET_BITS) as u8
    }

    fn offset(self) -> u32 {
        self.0 & OFFSET_MASK
    }

    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

/// A shared pool of fixed-size buffers of `T`, handed out to
/// [`AllocationContext`]s on request. Never reclaims memory except via
/// [`SlabAllocator::reset`], at which point every outstanding context must
/// be discarded and recreated — mirroring the original's "contexts must be
/// nullified after reset" contract.
pub struct SlabAllocator<T> {
    buffers: Vec<std::sync::Mutex<Option<Box<[T]>>>>,
    next_buffer: std::sync::atomic::AtomicUsize,
}

impl<T: Clone + Default> SlabAllocator<T> {
    pub fn new() -> Self {
        let mut buffers = Vec::with_capacity(MAX_BUFFERS);
        for _ in 0..MAX_BUFFERS {
            buffers.push(std::sync::Mutex::new(None));
        }
        SlabAllocator {
            buffers,
            next_buffer: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Hand out a freshly claimed buffer id, allocating the backing
    /// storage lazily on first use.
    fn claim_buffer(&self) -> u8 {
        let idx = self
            .next_buffer
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if idx >= MAX_BUFFERS {
            panic!("recycling trie: exhausted all {MAX_BUFFERS} allocation buffers");
        }
        let mut guard = self.buffers[idx].lock().unwrap();
        if guard.is_none() {
            *guard = Some(vec![T::default(); BUF_SIZE].into_boxed_slice());
        }
        idx as u8
    }

    pub fn new_context(self: &std::sync::Arc<Self>) -> AllocationContext<T> {
        AllocationContext {
            allocator: self.clone(),
            cur_buffer: None,
            cur_offset: BUF_SIZE as u32,
        }
    }

    fn with_slot<R>(&self, handle: SlabHandle, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.buffers[handle.buffer_id() as usize].lock().unwrap();
        let buf = guard.as_ref().expect("slab buffer not yet allocated");
        f(&buf[handle.offset() as usize])
    }

    fn with_slot_mut<R>(&self, handle: SlabHandle, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.buffers[handle.buffer_id() as usize].lock().unwrap();
        let buf = guard.as_mut().expect("slab buffer not yet allocated");
        f(&mut buf[handle.offset() as usize])
    }

    /// Release all backing storage and reset the allocation cursor. Every
    /// [`AllocationContext`] derived from this allocator becomes invalid
    /// and must be replaced with a fresh one.
    pub fn reset(&self) {
        for slot in &self.buffers {
            *slot.lock().unwrap() = None;
        }
        self.next_buffer.store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

impl<T: Clone + Default> Default for SlabAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-threaded bump allocator drawing from a shared
/// [`SlabAllocator`]. When its current buffer is exhausted it claims a new
/// one from the shared pool. Allocations within a context are never
/// individually freed — only the whole allocator resets.
pub struct AllocationContext<T: Clone + Default> {
    allocator: std::sync::Arc<SlabAllocator<T>>,
    cur_buffer: Option<u8>,
    cur_offset: u32,
}

impl<T: Clone + Default> AllocationContext<T> {
    pub fn allocate(&mut self) -> SlabHandle {
        if self.cur_buffer.is_none() || self.cur_offset >= BUF_SIZE as u32 {
            self.cur_buffer = Some(self.allocator.claim_buffer());
            self.cur_offset = 0;
        }
        let handle = SlabHandle::new(self.cur_buffer.unwrap(), self.cur_offset);
        self.cur_offset += 1;
        handle
    }

    pub fn get(&self, handle: SlabHandle) -> T {
        self.allocator.with_slot(handle, |t| t.clone())
    }

    pub fn set(&self, handle: SlabHandle, value: T) {
        self.allocator.with_slot_mut(handle, |slot| *slot = value);
    }

    pub fn with_mut<R>(&self, handle: SlabHandle, f: impl FnOnce(&mut T) -> R) -> R {
        self.allocator.with_slot_mut(handle, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_round_trip() {
        let allocator = std::sync::Arc::new(SlabAllocator::<u64>::new());
        let mut ctx = allocator.new_context();
        let h1 = ctx.allocate();
        let h2 = ctx.allocate();
        ctx.set(h1, 41);
        ctx.set(h2, 42);
        assert_eq!(ctx.get(h1), 41);
        assert_eq!(ctx.get(h2), 42);
    }

    #[test]
    fn reset_allows_reuse() {
        let allocator = std::sync::Arc::new(SlabAllocator::<u64>::new());
        {
            let mut ctx = allocator.new_context();
            let h = ctx.allocate();
            ctx.set(h, 99);
        }
        allocator.reset();
        let mut ctx = allocator.new_context();
        let h = ctx.allocate();
        // freshly reset storage starts at default (0), not the stale value.
        assert_eq!(ctx.get(h), 0);
    }
}
