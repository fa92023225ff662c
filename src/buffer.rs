//! Zero-copy message buffers backed by size-class arenas.
//!
//! The pool allocates one page-aligned arena per size class up front and
//! hands the arena regions to the transport for registration exactly once,
//! so the datapath never registers (or copies) per allocation.

use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Arena page alignment.
pub const PAGE_SIZE: usize = 4096;

/// Smallest size class, in bytes.
pub const MIN_CLASS_BYTES: usize = 64;

/// A registered, DMA-capable memory region owned by the pool.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub addr: usize,
    pub len: usize,
}

/// Pool sizing parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of the largest size class; rounded up to a power of two.
    pub max_msg_size: usize,
    /// Buffer slots per size class.
    pub slots_per_class: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_msg_size: 1 << 20,
            slots_per_class: 64,
        }
    }
}

/// A message buffer: one slot of a size-class arena.
///
/// Holds a capacity fixed at allocation time and a logical length that
/// may be resized freely within that capacity. The value is exclusively
/// owned by whoever holds it; returning it to the pool is explicit via
/// [`BufferPool::free`]. Dropping a buffer without freeing it leaks the
/// slot until the pool itself is dropped.
pub struct MsgBuffer {
    ptr: NonNull<u8>,
    class: u16,
    slot: u32,
    capacity: usize,
    len: usize,
}

impl MsgBuffer {
    /// Logical data length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size-class capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the logical length in place.
    ///
    /// Fails with `InvalidArgument` if `new_len` exceeds the size-class
    /// capacity; the backing memory is never reallocated.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.capacity {
            return Err(Error::InvalidArgument("resize beyond buffer capacity"));
        }
        self.len = new_len;
        Ok(())
    }

    /// The valid data region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The valid data region, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The full capacity region, mutably. Useful for filling before a
    /// `resize`.
    #[inline]
    pub fn capacity_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Copy `data` into the buffer and set the length to match.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(Error::InvalidArgument("copy_from beyond buffer capacity"));
        }
        self.capacity_slice_mut()[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("class", &self.class)
            .field("slot", &self.slot)
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

/// Fixed-capacity ring of free slot indices.
///
/// O(1) push/pop with no per-operation allocation; capacity is a power
/// of two so the index mask is a single AND.
struct FreeRing {
    ring: Box<[u32]>,
    head: u32,
    tail: u32,
    mask: u32,
}

impl FreeRing {
    fn new_full(count: usize) -> Self {
        let cap = count.next_power_of_two().max(2);
        let mut ring = vec![0u32; cap].into_boxed_slice();
        for (i, entry) in ring.iter_mut().enumerate().take(count) {
            *entry = i as u32;
        }
        Self {
            ring,
            head: 0,
            tail: count as u32,
            mask: cap as u32 - 1,
        }
    }

    #[inline]
    fn pop(&mut self) -> Option<u32> {
        if self.head == self.tail {
            return None;
        }
        let idx = self.ring[(self.head & self.mask) as usize];
        self.head = self.head.wrapping_add(1);
        Some(idx)
    }

    #[inline]
    fn push(&mut self, idx: u32) {
        debug_assert!(self.len() <= self.mask as usize);
        self.ring[(self.tail & self.mask) as usize] = idx;
        self.tail = self.tail.wrapping_add(1);
    }

    #[inline]
    fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head) as usize
    }
}

/// One page-aligned allocation backing a size class.
struct Arena {
    base: *mut u8,
    len: usize,
}

impl Arena {
    fn new(len: usize) -> Result<Self> {
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut ptr, PAGE_SIZE, len) };
        if rc != 0 {
            return Err(Error::OutOfMemory { class_bytes: len });
        }
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        Ok(Self {
            base: ptr as *mut u8,
            len,
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { libc::free(self.base as *mut libc::c_void) };
    }
}

// The arena is only reachable through the owning pool.
unsafe impl Send for Arena {}

struct SizeClass {
    capacity: usize,
    arena: Arena,
    free: FreeRing,
    slots: usize,
}

/// Size-class buffer pool over pre-registered arenas.
///
/// Constructed once and passed to the endpoint by value; there is no
/// name-based pool lookup anywhere.
pub struct BufferPool {
    classes: Vec<SizeClass>,
}

impl BufferPool {
    /// Pre-allocate all size-class arenas.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        if config.slots_per_class == 0 {
            return Err(Error::InvalidArgument("slots_per_class must be nonzero"));
        }
        let max_class = config.max_msg_size.next_power_of_two().max(MIN_CLASS_BYTES);
        let mut classes = Vec::new();
        let mut cap = MIN_CLASS_BYTES;
        while cap <= max_class {
            let arena = Arena::new(cap * config.slots_per_class)?;
            classes.push(SizeClass {
                capacity: cap,
                arena,
                free: FreeRing::new_full(config.slots_per_class),
                slots: config.slots_per_class,
            });
            cap *= 2;
        }
        Ok(Self { classes })
    }

    fn class_for(&self, size: usize) -> Option<usize> {
        let want = size.next_power_of_two().max(MIN_CLASS_BYTES);
        let idx = (want / MIN_CLASS_BYTES).trailing_zeros() as usize;
        if idx < self.classes.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Allocate a buffer whose capacity is the smallest size class that
    /// fits `size`. The logical length starts at `size`.
    ///
    /// Exhaustion of the class is a hard `OutOfMemory` failure; the
    /// datapath never blocks waiting for reclamation.
    pub fn alloc(&mut self, size: usize) -> Result<MsgBuffer> {
        let class = self
            .class_for(size)
            .ok_or(Error::MsgTooLarge {
                size,
                max: self.max_buffer_size(),
            })?;
        let sc = &mut self.classes[class];
        let slot = sc.free.pop().ok_or(Error::OutOfMemory {
            class_bytes: sc.capacity,
        })?;
        let ptr = unsafe { sc.arena.base.add(slot as usize * sc.capacity) };
        Ok(MsgBuffer {
            // Arena allocations are non-null by construction.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            class: class as u16,
            slot,
            capacity: sc.capacity,
            len: size,
        })
    }

    /// Return a buffer to its size-class free list.
    ///
    /// Freeing a buffer twice is a caller-contract violation; the pool
    /// checks this only with debug assertions.
    pub fn free(&mut self, buf: MsgBuffer) {
        let sc = &mut self.classes[buf.class as usize];
        debug_assert!((buf.slot as usize) < sc.slots);
        sc.free.push(buf.slot);
    }

    /// Largest allocation the pool can satisfy.
    pub fn max_buffer_size(&self) -> usize {
        self.classes.last().map_or(0, |c| c.capacity)
    }

    /// Free slots currently available in the class that would serve
    /// `size`.
    pub fn available(&self, size: usize) -> usize {
        self.class_for(size)
            .map_or(0, |idx| self.classes[idx].free.len())
    }

    /// Arena regions for one-time transport registration.
    pub fn regions(&self) -> Vec<MemRegion> {
        self.classes
            .iter()
            .map(|c| MemRegion {
                addr: c.arena.base as usize,
                len: c.arena.len,
            })
            .collect()
    }
}
