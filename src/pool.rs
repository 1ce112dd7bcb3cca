//! One `VkDeviceMemory` allocation of a single memory type, sub-divided by
//! a `ChunkList`, with refcounted host mapping shared across its chunks.

use {
    crate::{
        callbacks::AllocationCallbacks,
        chunk::{Chunk, ChunkId, ChunkList},
        error::{error_from_allocate_result, Error, MappingError},
    },
    erupt::{
        vk1_0::{self, Vk10DeviceLoaderExt as _},
        DeviceLoader,
    },
    std::ptr::NonNull,
};

#[derive(Debug)]
pub(crate) struct Pool {
    memory: vk1_0::DeviceMemory,
    memory_type_index: u32,
    chunks: ChunkList,
    map_count: u32,
    map_ptr: Option<NonNull<u8>>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    #[tracing::instrument(skip(device, allocation_callbacks), err)]
    pub fn create(
        device: &DeviceLoader,
        allocation_callbacks: Option<&vk1_0::AllocationCallbacks>,
        memory_type_index: u32,
        size: u64,
    ) -> Result<Self, Error> {
        let alloc_info = vk1_0::MemoryAllocateInfo::default()
            .builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, allocation_callbacks, None)
                .result()
        }
        .map_err(|err| {
            tracing::error!("vkAllocateMemory failed: {}", err);
            error_from_allocate_result(err)
        })?;

        tracing::trace!(?memory, size, memory_type_index, "pool created");

        Ok(Pool {
            memory,
            memory_type_index,
            chunks: ChunkList::new(size),
            map_count: 0,
            map_ptr: None,
        })
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn memory(&self) -> vk1_0::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> u64 {
        self.chunks.capacity()
    }

    pub fn is_entirely_free(&self) -> bool {
        self.chunks.is_entirely_free()
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    /// Carve a chunk out of this pool. See `ChunkList::allocate` for the
    /// exact first-fit/split semantics.
    pub fn allocate(
        &mut self,
        size: u64,
        align: u64,
        min_split_remainder: u64,
    ) -> Result<Option<ChunkId>, Error> {
        self.chunks
            .allocate(size, align, min_split_remainder)
            .map_err(Into::into)
    }

    pub fn deallocate(&mut self, id: ChunkId) -> Result<(), Error> {
        self.chunks.deallocate(id).map_err(Into::into)
    }

    #[cfg(feature = "track-allocations")]
    pub fn set_alloc_site(&mut self, id: ChunkId, site: crate::chunk::AllocSite) {
        if let Some(chunk) = self.chunks.get_mut(id) {
            chunk.set_alloc_site(Some(site));
        }
    }

    /// Map the chunk's data region, mapping the whole pool on first use and
    /// sharing the resulting pointer (and refcount) across every other
    /// chunk in the same pool. Implicitly invalidates the chunk's range
    /// when the pool was already mapped by someone else, matching the
    /// automatic-invalidate-on-piggyback-map behavior of the original
    /// design this mirrors.
    #[tracing::instrument(skip(self, device), err)]
    pub fn map(
        &mut self,
        device: &DeviceLoader,
        id: ChunkId,
    ) -> Result<NonNull<u8>, MappingError> {
        let (offset, extent, data_offset) = {
            let chunk = self
                .chunks
                .get(id)
                .expect("chunk id does not belong to this pool");
            if chunk.is_mapped() {
                return Err(MappingError::AlreadyMapped);
            }
            (chunk.offset(), chunk.extent(), chunk.data_offset())
        };

        let first_map = self.map_count == 0;
        if first_map {
            let mut ptr = std::ptr::null_mut();
            unsafe {
                device
                    .map_memory(
                        self.memory,
                        0,
                        self.chunks.capacity(),
                        vk1_0::MemoryMapFlags::empty(),
                        &mut ptr,
                    )
                    .result()
                    .map_err(|err| {
                        tracing::error!("vkMapMemory failed: {}", err);
                        match err {
                            vk1_0::Result::ERROR_OUT_OF_HOST_MEMORY => {
                                MappingError::OutOfHostMemory
                            }
                            other => MappingError::Driver(other),
                        }
                    })?;
            }
            self.map_ptr =
                Some(NonNull::new(ptr as *mut u8).expect("vkMapMemory returned null on success"));
        }

        self.map_count += 1;
        let pool_ptr = self.map_ptr.unwrap();
        let chunk_ptr =
            unsafe { NonNull::new_unchecked(pool_ptr.as_ptr().add(data_offset as usize)) };

        self.chunks.get_mut(id).unwrap().set_mapped(true);

        if !first_map {
            self.invalidate_range(device, offset, extent);
        }
        Ok(chunk_ptr)
    }

    #[tracing::instrument(skip(self, device), err)]
    pub fn unmap(
        &mut self,
        device: &DeviceLoader,
        id: ChunkId,
    ) -> Result<(), MappingError> {
        let chunk = self
            .chunks
            .get(id)
            .expect("chunk id does not belong to this pool");
        if !chunk.is_mapped() {
            return Err(MappingError::NotMapped);
        }

        let (offset, extent) = (chunk.offset(), chunk.extent());
        let last_unmap = self.map_count == 1;

        if !last_unmap {
            self.flush_range(device, offset, extent);
        }

        self.chunks.get_mut(id).unwrap().set_mapped(false);
        self.map_count -= 1;

        if last_unmap {
            unsafe { device.unmap_memory(self.memory) };
            self.map_ptr = None;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self, device))]
    pub fn flush(&self, device: &DeviceLoader, id: ChunkId) {
        let chunk = self.chunks.get(id).expect("chunk id does not belong to this pool");
        self.flush_range(device, chunk.offset(), chunk.extent());
    }

    #[tracing::instrument(skip(self, device))]
    pub fn invalidate(&self, device: &DeviceLoader, id: ChunkId) {
        let chunk = self.chunks.get(id).expect("chunk id does not belong to this pool");
        self.invalidate_range(device, chunk.offset(), chunk.extent());
    }

    fn flush_range(&self, device: &DeviceLoader, offset: u64, size: u64) {
        let range = vk1_0::MappedMemoryRange::default()
            .builder()
            .memory(self.memory)
            .offset(offset)
            .size(size);
        unsafe {
            let _ = device.flush_mapped_memory_ranges(&[range]).result();
        }
    }

    fn invalidate_range(&self, device: &DeviceLoader, offset: u64, size: u64) {
        let range = vk1_0::MappedMemoryRange::default()
            .builder()
            .memory(self.memory)
            .offset(offset)
            .size(size);
        unsafe {
            let _ = device.invalidate_mapped_memory_ranges(&[range]).result();
        }
    }

    /// Unconditionally releases this pool's `VkDeviceMemory` back to the
    /// driver, unmapping first if still mapped. Called both for a normal
    /// empty-pool sweep and for teardown, where any still-used chunks are
    /// reported through `error_callbacks` before the handle is freed
    /// regardless (see `Allocator::drop`).
    #[tracing::instrument(skip(self, device, allocation_callbacks))]
    pub fn destroy(
        mut self,
        device: &DeviceLoader,
        allocation_callbacks: Option<&vk1_0::AllocationCallbacks>,
    ) {
        if self.map_count > 0 {
            unsafe { device.unmap_memory(self.memory) };
            self.map_count = 0;
        }
        unsafe { device.free_memory(self.memory, allocation_callbacks) };
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.chunk_count()
    }

    pub fn chunks(&self) -> &[Chunk] {
        self.chunks.chunks()
    }
}
