// GPU buffer heap
//
// One pre-sized device-local buffer carved into blocks. A block is addressed
// by a HeapIndex that stays valid until the block is freed. Free ranges are
// merged with their neighbours, but live blocks never move: there is no
// compaction, and the heap never grows.

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::buffer::{copy_buffer, GpuBuffer};
use super::VulkanDevice;
use crate::error::{BackendError, BackendResult};

pub type HeapIndex = u32;

/// Byte range and element count of one live block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    pub offset: u64,
    pub byte_size: u64,
    pub element_count: u32,
}

/// Result of `allocate_data` / `get_data_range_by_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapAllocation {
    pub heap_index: HeapIndex,
    pub offset: u64,
    pub element_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: u64,
    pub used: u64,
    pub live_blocks: usize,
    pub largest_free_range: u64,
}

/// First-fit sub-allocator over a byte range. Owns no GPU memory.
#[derive(Debug)]
pub struct BlockAllocator {
    name: &'static str,
    capacity: u64,
    alignment: u64,
    /// (offset, size), sorted by offset, never adjacent
    free_ranges: Vec<(u64, u64)>,
    blocks: HashMap<HeapIndex, HeapBlock>,
    free_indices: Vec<HeapIndex>,
    next_index: HeapIndex,
    used: u64,
}

impl BlockAllocator {
    pub fn new(name: &'static str, capacity: u64, alignment: u64) -> Self {
        let alignment = alignment.max(1);
        let capacity = capacity - capacity % alignment;
        Self {
            name,
            capacity,
            alignment,
            free_ranges: if capacity > 0 { vec![(0, capacity)] } else { vec![] },
            blocks: HashMap::new(),
            free_indices: Vec::new(),
            next_index: 0,
            used: 0,
        }
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    fn aligned_size(&self, bytes: u64) -> u64 {
        let bytes = bytes.max(1);
        bytes.div_ceil(self.alignment) * self.alignment
    }

    /// Reserve room for `element_count` elements of `element_size` bytes.
    ///
    /// Fails without touching any existing block when no free range fits.
    pub fn allocate(&mut self, element_count: u32, element_size: u64) -> BackendResult<(HeapIndex, HeapBlock)> {
        let requested = element_count as u64 * element_size;
        let size = self.aligned_size(requested);

        let Some(position) = self.free_ranges.iter().position(|&(_, len)| len >= size) else {
            return Err(BackendError::HeapExhausted {
                heap: self.name,
                requested: size,
                available: self.largest_free_range(),
            });
        };

        let (offset, len) = self.free_ranges[position];
        if len == size {
            self.free_ranges.remove(position);
        } else {
            self.free_ranges[position] = (offset + size, len - size);
        }

        let index = self.free_indices.pop().unwrap_or_else(|| {
            let index = self.next_index;
            self.next_index += 1;
            index
        });

        let block = HeapBlock {
            offset,
            byte_size: size,
            element_count,
        };
        self.blocks.insert(index, block);
        self.used += size;

        Ok((index, block))
    }

    pub fn get(&self, index: HeapIndex) -> Option<HeapBlock> {
        self.blocks.get(&index).copied()
    }

    /// Release a block and merge its range with free neighbours.
    pub fn free(&mut self, index: HeapIndex) -> BackendResult<HeapBlock> {
        let block = self
            .blocks
            .remove(&index)
            .ok_or(BackendError::UnknownHeapIndex(index))?;
        self.used -= block.byte_size;
        self.free_indices.push(index);

        let position = self
            .free_ranges
            .partition_point(|&(offset, _)| offset < block.offset);
        self.free_ranges.insert(position, (block.offset, block.byte_size));

        // Merge with the following range
        if position + 1 < self.free_ranges.len() {
            let (offset, len) = self.free_ranges[position];
            let (next_offset, next_len) = self.free_ranges[position + 1];
            if offset + len == next_offset {
                self.free_ranges[position].1 += next_len;
                self.free_ranges.remove(position + 1);
            }
        }
        // Merge with the preceding range
        if position > 0 {
            let (prev_offset, prev_len) = self.free_ranges[position - 1];
            let (offset, len) = self.free_ranges[position];
            if prev_offset + prev_len == offset {
                self.free_ranges[position - 1].1 += len;
                self.free_ranges.remove(position);
            }
        }

        Ok(block)
    }

    pub fn largest_free_range(&self) -> u64 {
        self.free_ranges.iter().map(|&(_, len)| len).max().unwrap_or(0)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.capacity,
            used: self.used,
            live_blocks: self.blocks.len(),
            largest_free_range: self.largest_free_range(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    Vertex,
    Index,
    Uniform,
}

impl HeapKind {
    pub fn name(self) -> &'static str {
        match self {
            HeapKind::Vertex => "vertex",
            HeapKind::Index => "index",
            HeapKind::Uniform => "uniform",
        }
    }

    fn usage(self) -> vk::BufferUsageFlags {
        let usage = match self {
            HeapKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            HeapKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            HeapKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        };
        usage | vk::BufferUsageFlags::TRANSFER_DST
    }

    fn min_alignment(self, limits: &vk::PhysicalDeviceLimits) -> u64 {
        match self {
            HeapKind::Vertex | HeapKind::Index => 4,
            HeapKind::Uniform => limits.min_uniform_buffer_offset_alignment.max(4),
        }
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Smallest alignment that is a multiple of both the element size and the API minimum.
pub fn heap_alignment(element_size: u64, min_alignment: u64) -> u64 {
    let element_size = element_size.max(1);
    let min_alignment = min_alignment.max(1);
    element_size / gcd(element_size, min_alignment) * min_alignment
}

/// Device buffer serving one element type `T`
pub struct BufferHeap<T: Pod> {
    kind: HeapKind,
    buffer: GpuBuffer,
    blocks: BlockAllocator,
    device: Arc<VulkanDevice>,
    _element: PhantomData<T>,
}

impl<T: Pod> BufferHeap<T> {
    pub fn new(device: Arc<VulkanDevice>, kind: HeapKind, capacity: u64) -> BackendResult<Self> {
        let element_size = std::mem::size_of::<T>() as u64;
        let alignment = heap_alignment(element_size, kind.min_alignment(&device.properties.limits));
        let blocks = BlockAllocator::new(kind.name(), capacity, alignment);

        let buffer = GpuBuffer::new(
            device.clone(),
            kind.name(),
            capacity,
            kind.usage(),
            MemoryLocation::GpuOnly,
        )?;

        log::info!(
            "Created {} heap: {} MiB, alignment {}",
            kind.name(),
            capacity / (1024 * 1024),
            alignment
        );

        Ok(Self {
            kind,
            buffer,
            blocks,
            device,
            _element: PhantomData,
        })
    }

    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    #[inline]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Reserve a block, stage `elements` through a host-visible buffer and copy them in.
    pub fn allocate_data(&mut self, elements: &[T]) -> BackendResult<HeapAllocation> {
        let (heap_index, block) = self.blocks.allocate(elements.len() as u32, std::mem::size_of::<T>() as u64)?;

        if !elements.is_empty() {
            if let Err(e) = self.upload(block.offset, bytemuck::cast_slice(elements)) {
                let _ = self.blocks.free(heap_index);
                return Err(e);
            }
        }

        log::trace!(
            "{} heap: block {} at {} ({} elements)",
            self.kind.name(),
            heap_index,
            block.offset,
            block.element_count
        );

        Ok(HeapAllocation {
            heap_index,
            offset: block.offset,
            element_count: block.element_count,
        })
    }

    fn upload(&self, offset: u64, bytes: &[u8]) -> BackendResult<()> {
        let staging = GpuBuffer::staging(self.device.clone(), bytes)?;
        copy_buffer(
            &self.device,
            staging.buffer,
            0,
            self.buffer.buffer,
            offset,
            bytes.len() as vk::DeviceSize,
        )
    }

    pub fn get_data_range_by_index(&self, heap_index: HeapIndex) -> BackendResult<HeapAllocation> {
        let block = self
            .blocks
            .get(heap_index)
            .ok_or(BackendError::UnknownHeapIndex(heap_index))?;
        Ok(HeapAllocation {
            heap_index,
            offset: block.offset,
            element_count: block.element_count,
        })
    }

    pub fn free_data_range_by_index(&mut self, heap_index: HeapIndex) -> BackendResult<()> {
        self.blocks.free(heap_index)?;
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        self.blocks.stats()
    }
}
