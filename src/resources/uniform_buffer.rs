//! Free-list sub-allocator for the shared uniform buffer.
//!
//! A shader owns one large uniform buffer. The global block is carved out of
//! it first, then every material instance takes one stride-sized region. The
//! allocator only hands out offsets; writing the bytes is the backend's job.
//!
//! There is no growth: once the buffer is full, [`UniformBufferAllocator::allocate`]
//! fails with [`AllocError::Exhausted`] until something is freed.
//!
//! # Example
//!
//! ```
//! use lumen_engine::resources::UniformBufferAllocator;
//!
//! let allocator = UniformBufferAllocator::new(1024, 256).unwrap();
//! let globals = allocator.allocate(130).unwrap();
//! assert_eq!(globals.size, 256);
//!
//! let instance = allocator.allocate(16).unwrap();
//! assert_eq!(instance.offset, 256);
//!
//! allocator.free(instance).unwrap();
//! assert_eq!(allocator.free_space(), 768);
//! ```

use parking_lot::Mutex;
use thiserror::Error;

/// Uniform allocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Uniform buffer exhausted: requested {requested} bytes, {available} free")]
    Exhausted { requested: u64, available: u64 },
    #[error("Invalid free of {size} bytes at offset {offset}")]
    InvalidFree { offset: u64, size: u64 },
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// A region handed out by [`UniformBufferAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformAllocation {
    /// Byte offset into the buffer.
    pub offset: u64,
    /// Size of the region in bytes, already rounded to the alignment.
    pub size: u64,
}

impl UniformAllocation {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

impl FreeBlock {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Thread-safe first-fit allocator over a fixed byte range.
pub struct UniformBufferAllocator {
    capacity: u64,
    alignment: u64,
    /// Free blocks sorted by offset, never adjacent.
    free_list: Mutex<Vec<FreeBlock>>,
}

impl UniformBufferAllocator {
    /// Default alignment (256 bytes), the common minimum uniform offset alignment.
    pub const DEFAULT_ALIGNMENT: u64 = 256;

    pub fn new(capacity: u64, alignment: u64) -> Result<Self, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidParameter(format!(
                "alignment must be a power of 2, got {alignment}"
            )));
        }
        if capacity == 0 {
            return Err(AllocError::InvalidParameter(
                "uniform buffer capacity cannot be zero".to_string(),
            ));
        }
        if capacity % alignment != 0 {
            return Err(AllocError::InvalidParameter(format!(
                "capacity {capacity} is not a multiple of alignment {alignment}"
            )));
        }

        Ok(Self {
            capacity,
            alignment,
            free_list: Mutex::new(vec![FreeBlock {
                offset: 0,
                size: capacity,
            }]),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Total bytes currently free (possibly fragmented).
    pub fn free_space(&self) -> u64 {
        self.free_list.lock().iter().map(|b| b.size).sum()
    }

    /// Allocate at least `size` bytes. The returned size is rounded up to the
    /// alignment and the offset is aligned.
    pub fn allocate(&self, size: u64) -> Result<UniformAllocation, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidParameter(
                "cannot allocate zero bytes".to_string(),
            ));
        }
        let size = align_up(size, self.alignment);

        let mut free_list = self.free_list.lock();
        let Some(index) = free_list.iter().position(|b| b.size >= size) else {
            let available = free_list.iter().map(|b| b.size).sum();
            log::error!("Uniform buffer exhausted: requested {size} bytes, {available} free");
            return Err(AllocError::Exhausted {
                requested: size,
                available,
            });
        };

        let block = &mut free_list[index];
        let allocation = UniformAllocation::new(block.offset, size);
        if block.size == size {
            free_list.remove(index);
        } else {
            block.offset += size;
            block.size -= size;
        }

        log::trace!(
            "UniformBufferAllocator: allocated {} bytes at offset {}",
            allocation.size,
            allocation.offset
        );
        Ok(allocation)
    }

    /// Return a region to the free list, merging it with free neighbours.
    ///
    /// Freeing a region that is out of range, misaligned, or overlaps free
    /// space fails without touching the free list.
    pub fn free(&self, allocation: UniformAllocation) -> Result<(), AllocError> {
        let invalid = AllocError::InvalidFree {
            offset: allocation.offset,
            size: allocation.size,
        };
        if allocation.size == 0 || allocation.offset % self.alignment != 0 {
            return Err(invalid);
        }
        let size = align_up(allocation.size, self.alignment);
        let block = FreeBlock {
            offset: allocation.offset,
            size,
        };
        if block.end() > self.capacity {
            log::error!("Free of {size} bytes at offset {} is out of range", block.offset);
            return Err(invalid);
        }

        let mut free_list = self.free_list.lock();
        let index = free_list.partition_point(|b| b.offset < block.offset);

        let overlaps_prev = index > 0 && free_list[index - 1].end() > block.offset;
        let overlaps_next = index < free_list.len() && block.end() > free_list[index].offset;
        if overlaps_prev || overlaps_next {
            log::error!(
                "Free of {size} bytes at offset {} overlaps free space (double free?)",
                block.offset
            );
            return Err(invalid);
        }

        let merges_prev = index > 0 && free_list[index - 1].end() == block.offset;
        let merges_next = index < free_list.len() && block.end() == free_list[index].offset;
        match (merges_prev, merges_next) {
            (true, true) => {
                let next = free_list.remove(index);
                free_list[index - 1].size += block.size + next.size;
            }
            (true, false) => free_list[index - 1].size += block.size,
            (false, true) => {
                let next = &mut free_list[index];
                next.offset = block.offset;
                next.size += block.size;
            }
            (false, false) => free_list.insert(index, block),
        }

        log::trace!(
            "UniformBufferAllocator: freed {} bytes at offset {}",
            size,
            block.offset
        );
        Ok(())
    }

    /// Free everything.
    pub fn reset(&self) {
        let mut free_list = self.free_list.lock();
        free_list.clear();
        free_list.push(FreeBlock {
            offset: 0,
            size: self.capacity,
        });
    }
}

impl std::fmt::Debug for UniformBufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniformBufferAllocator")
            .field("capacity", &self.capacity)
            .field("alignment", &self.alignment)
            .field("free_space", &self.free_space())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(130, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(UniformBufferAllocator::new(1024, 100).is_err());
        assert!(UniformBufferAllocator::new(0, 256).is_err());
        assert!(UniformBufferAllocator::new(1000, 256).is_err());
    }

    #[test]
    fn test_sequential_offsets() {
        let allocator = UniformBufferAllocator::new(1024, 256).unwrap();
        let offsets: Vec<u64> = (0..4)
            .map(|_| allocator.allocate(16).unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![0, 256, 512, 768]);
        assert_eq!(allocator.free_space(), 0);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let allocator = UniformBufferAllocator::new(512, 256).unwrap();
        allocator.allocate(256).unwrap();
        allocator.allocate(256).unwrap();
        assert_eq!(
            allocator.allocate(1),
            Err(AllocError::Exhausted {
                requested: 256,
                available: 0
            })
        );
    }

    #[test]
    fn test_free_reuses_region() {
        let allocator = UniformBufferAllocator::new(1024, 256).unwrap();
        let _a = allocator.allocate(256).unwrap();
        let b = allocator.allocate(256).unwrap();
        let _c = allocator.allocate(256).unwrap();
        allocator.free(b).unwrap();
        assert_eq!(allocator.allocate(100).unwrap().offset, b.offset);
    }

    #[test]
    fn test_coalescing() {
        let allocator = UniformBufferAllocator::new(1024, 256).unwrap();
        let a = allocator.allocate(256).unwrap();
        let b = allocator.allocate(256).unwrap();
        let c = allocator.allocate(256).unwrap();
        allocator.free(a).unwrap();
        allocator.free(c).unwrap();
        allocator.free(b).unwrap();
        // All four blocks merged back into one.
        assert_eq!(allocator.allocate(1024).unwrap().offset, 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let allocator = UniformBufferAllocator::new(1024, 256).unwrap();
        let a = allocator.allocate(256).unwrap();
        allocator.free(a).unwrap();
        let before = allocator.free_space();
        assert!(matches!(allocator.free(a), Err(AllocError::InvalidFree { .. })));
        assert_eq!(allocator.free_space(), before);
    }

    #[test]
    fn test_out_of_range_free_rejected() {
        let allocator = UniformBufferAllocator::new(512, 256).unwrap();
        allocator.allocate(512).unwrap();
        assert!(allocator.free(UniformAllocation::new(512, 256)).is_err());
        assert!(allocator.free(UniformAllocation::new(100, 256)).is_err());
    }

    #[test]
    fn test_concurrent_allocation() {
        use std::sync::Arc;

        let allocator = Arc::new(UniformBufferAllocator::new(256 * 64, 256).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..16)
                        .map(|_| allocator.allocate(64).unwrap().offset)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut offsets: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 64);
        assert_eq!(allocator.free_space(), 0);
    }
}
