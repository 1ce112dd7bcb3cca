//! Sub-allocator for Vulkan device memory.
//!
//! Applications using Vulkan must allocate device memory in large blocks —
//! the driver caps how many concurrent `VkDeviceMemory` objects can exist —
//! and then sub-allocate smaller regions out of those blocks to back
//! buffers and images. This crate is that sub-allocator: given a desired
//! resource and a set of memory-property preferences, it scores the
//! device's memory types, finds or creates a pool of the chosen type,
//! carves out a correctly aligned chunk, and binds the resource to it.
//!
//! It uses `erupt` as its Vulkan binding.
//!
//! The allocator is externally synchronized: it holds no internal locks,
//! and every entry point requires `&mut self`. Callers sharing an
//! `Allocator` across threads must provide their own synchronization.

mod callbacks;
mod chunk;
mod error;
mod pool;
mod resource;
mod scorer;

pub use self::{
    callbacks::{AllocationCallbacks, ErrorCallbacks},
    error::{Error, MappingError},
    resource::{BufferAllocation, ImageAllocation},
};

use {
    self::pool::Pool,
    erupt::{vk1_0, DeviceLoader, InstanceLoader},
    std::sync::Arc,
    tinyvec::ArrayVec,
};

/// Default size for a freshly created pool, applied when
/// [`AllocatorCreateInfo::min_pool_size`] is left at `0`.
const DEFAULT_MIN_POOL_SIZE: u64 = 4 * 1024 * 1024;

/// Policy and injected capabilities for an [`Allocator`].
///
/// Fields left at their zero value take the defaults documented on them,
/// mirroring the "if set to 0, this is set to ..." convention of the
/// allocator this crate's configuration surface is modeled on.
pub struct AllocatorCreateInfo {
    pub physical_device: vk1_0::PhysicalDevice,
    pub device: Arc<DeviceLoader>,

    /// Minimum size of a newly created pool. Defaults to 4 MiB when `0`.
    pub min_pool_size: u64,

    /// Remaining free space below which a chunk's leftover is absorbed
    /// into the allocation instead of becoming its own free chunk.
    /// Defaults to the device's `nonCoherentAtomSize` limit when `0`,
    /// since that is the minimum useful flush/invalidate granularity
    /// anyway.
    pub min_allocation_size: u64,

    /// Whether a pool that becomes entirely free is released back to the
    /// driver immediately, rather than kept around for reuse.
    pub automatically_free_unused: bool,

    pub allocation_callbacks: AllocationCallbacks,
    pub error_callbacks: ErrorCallbacks,

    /// Passed verbatim to every `erupt` call that accepts a
    /// `VkAllocationCallbacks`. Distinct from `allocation_callbacks`, which
    /// is this crate's own host-side allocation hook, not the driver's.
    pub vk_allocation_callbacks: Option<vk1_0::AllocationCallbacks>,
}

#[derive(Clone, Copy, Default)]
struct MemoryTypeInfo {
    property_flags: vk1_0::MemoryPropertyFlags,
    heap_index: u32,
}

/// Root entity. Owns every live pool and the capabilities an application
/// injected at construction time.
pub struct Allocator {
    device: Arc<DeviceLoader>,
    physical_device: vk1_0::PhysicalDevice,

    min_pool_size: u64,
    min_allocation_size: u64,
    min_map_alignment: u64,
    automatically_free_unused: bool,

    allocation_callbacks: AllocationCallbacks,
    error_callbacks: ErrorCallbacks,
    vk_allocation_callbacks: Option<vk1_0::AllocationCallbacks>,

    memory_types: ArrayVec<[MemoryTypeInfo; 32]>,
    memory_heaps: ArrayVec<[vk1_0::MemoryHeap; 16]>,

    /// Pools are addressed by a stable `slab` key rather than a plain
    /// `Vec` index: releasing a pool must not invalidate every
    /// higher-indexed pool's outstanding `Allocation`s, which a
    /// `Vec::remove`-based compaction would do silently.
    pools: slab::Slab<Pool>,
}

/// A handle identifying one chunk carved out of one of the allocator's
/// pools. Threaded through `BufferAllocation`/`ImageAllocation`, and
/// through `Allocator::deallocate`/`map`/`unmap`/`flush`/`invalidate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct Allocation {
    pool_key: usize,
    chunk_id: chunk::ChunkId,
}

impl Allocator {
    #[tracing::instrument(skip(instance, info))]
    pub fn new(instance: &InstanceLoader, info: AllocatorCreateInfo) -> Self {
        use vk1_0::Vk10InstanceLoaderExt as _;

        let properties =
            unsafe { instance.get_physical_device_properties(info.physical_device, None) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(info.physical_device, None) };

        let memory_types = memory_properties.memory_types
            [..memory_properties.memory_type_count as usize]
            .iter()
            .map(|ty| MemoryTypeInfo {
                property_flags: ty.property_flags,
                heap_index: ty.heap_index,
            })
            .collect::<ArrayVec<[_; 32]>>();

        let memory_heaps = memory_properties.memory_heaps
            [..memory_properties.memory_heap_count as usize]
            .iter()
            .copied()
            .collect::<ArrayVec<[_; 16]>>();

        let min_pool_size = if info.min_pool_size == 0 {
            DEFAULT_MIN_POOL_SIZE
        } else {
            info.min_pool_size
        };

        let min_allocation_size = if info.min_allocation_size == 0 {
            properties.limits.non_coherent_atom_size
        } else {
            info.min_allocation_size
        };

        let min_map_alignment = properties.limits.min_memory_map_alignment;

        tracing::info!(
            min_pool_size,
            min_allocation_size,
            min_map_alignment,
            memory_type_count = memory_types.len(),
            "allocator created"
        );

        Allocator {
            device: info.device,
            physical_device: info.physical_device,
            min_pool_size,
            min_allocation_size,
            min_map_alignment,
            automatically_free_unused: info.automatically_free_unused,
            allocation_callbacks: info.allocation_callbacks,
            error_callbacks: info.error_callbacks,
            vk_allocation_callbacks: info.vk_allocation_callbacks,
            memory_types,
            memory_heaps,
            pools: slab::Slab::new(),
        }
    }

    pub fn physical_device(&self) -> vk1_0::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &Arc<DeviceLoader> {
        &self.device
    }

    /// The driver-side allocation callbacks this allocator was configured
    /// with, for resource-creation call sites that need to pass the same
    /// callbacks to `vkCreateBuffer`/`vkCreateImage` as every pool
    /// allocation uses.
    pub fn vk_allocation_callbacks(&self) -> Option<&vk1_0::AllocationCallbacks> {
        self.vk_allocation_callbacks.as_ref()
    }

    /// The host allocation callbacks this allocator was configured with, for
    /// callers that want to observe or drive this crate's own host-side
    /// allocation activity. See `AllocationCallbacks`'s own docs for why
    /// this crate's internal collection growth does not route through it.
    pub fn allocation_callbacks(&self) -> &AllocationCallbacks {
        &self.allocation_callbacks
    }

    fn memory_type_property_flags(&self) -> ArrayVec<[vk1_0::MemoryType; 32]> {
        self.memory_types
            .iter()
            .map(|ty| vk1_0::MemoryType {
                property_flags: ty.property_flags,
                heap_index: ty.heap_index,
            })
            .collect()
    }

    /// Floor `size` against `min_allocation_size`, then `alignment`; if
    /// `memory_type_index` is host-visible, bump `alignment` up to the
    /// driver's minimum map alignment and re-floor `size` against the
    /// bumped alignment. Applied identically to every allocation request,
    /// dedicated or not — the allocator this crate generalizes duplicates
    /// this exact normalization in both its plain and dedicated allocation
    /// paths.
    fn normalize(&self, size: u64, alignment: u64, memory_type_index: u32) -> (u64, u64) {
        let mut size = size.max(self.min_allocation_size);
        let mut align = alignment.max(1);
        size = size.max(align);

        let host_visible = self.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk1_0::MemoryPropertyFlags::HOST_VISIBLE);
        if host_visible {
            align = align.max(self.min_map_alignment);
            size = size.max(align);
        }

        (size, align)
    }

    /// Choose a memory type, then allocate and bind a chunk satisfying
    /// `requirements` from it, creating a new pool if none of the existing
    /// ones of that type fit.
    #[tracing::instrument(skip(self), err)]
    #[cfg_attr(feature = "track-allocations", track_caller)]
    pub fn allocate(
        &mut self,
        requirements: vk1_0::MemoryRequirements,
        desired_flags: vk1_0::MemoryPropertyFlags,
        undesired_flags: vk1_0::MemoryPropertyFlags,
    ) -> Result<Allocation, Error> {
        #[cfg(feature = "track-allocations")]
        let site = {
            let location = std::panic::Location::caller();
            chunk::AllocSite {
                file: location.file(),
                line: location.line(),
            }
        };

        let vk_memory_types = self.memory_type_property_flags();
        let memory_type_index = scorer::select_memory_type(
            requirements.memory_type_bits,
            desired_flags,
            undesired_flags,
            &vk_memory_types,
            &self.memory_heaps,
        )
        .map_err(|_| {
            self.error_callbacks.report(
                format_args!(
                    "no memory type satisfies type_bits={:#x} desired={:?} undesired={:?}",
                    requirements.memory_type_bits, desired_flags, undesired_flags
                ),
                file!(),
                line!(),
                "Allocator::allocate",
            );
            Error::NoSuitableMemoryType
        })?;

        let (size, align) =
            self.normalize(requirements.size, requirements.alignment, memory_type_index);

        for (pool_key, pool) in self.pools.iter_mut() {
            if pool.memory_type_index() != memory_type_index {
                continue;
            }
            if let Some(chunk_id) =
                pool.allocate(size, align, self.min_allocation_size)?
            {
                #[cfg(feature = "track-allocations")]
                pool.set_alloc_site(chunk_id, site);
                return Ok(Allocation {
                    pool_key,
                    chunk_id,
                });
            }
        }

        let new_pool_size = self.min_pool_size.max(size);
        let pool = Pool::create(
            &self.device,
            self.vk_allocation_callbacks.as_ref(),
            memory_type_index,
            new_pool_size,
        )?;
        let pool_key = self.pools.insert(pool);

        let chunk_id = self.pools[pool_key]
            .allocate(size, align, self.min_allocation_size)?
            .expect("newly created pool must fit the allocation that sized it");
        #[cfg(feature = "track-allocations")]
        self.pools[pool_key].set_alloc_site(chunk_id, site);

        Ok(Allocation {
            pool_key,
            chunk_id,
        })
    }

    /// Allocate a chunk in a pool dedicated entirely to this one
    /// allocation — the pool is sized exactly to the normalized request
    /// and is never shared with another allocation.
    #[tracing::instrument(skip(self), err)]
    #[cfg_attr(feature = "track-allocations", track_caller)]
    pub fn allocate_dedicated(
        &mut self,
        requirements: vk1_0::MemoryRequirements,
        desired_flags: vk1_0::MemoryPropertyFlags,
        undesired_flags: vk1_0::MemoryPropertyFlags,
    ) -> Result<Allocation, Error> {
        #[cfg(feature = "track-allocations")]
        let site = {
            let location = std::panic::Location::caller();
            chunk::AllocSite {
                file: location.file(),
                line: location.line(),
            }
        };

        let vk_memory_types = self.memory_type_property_flags();
        let memory_type_index = scorer::select_memory_type(
            requirements.memory_type_bits,
            desired_flags,
            undesired_flags,
            &vk_memory_types,
            &self.memory_heaps,
        )
        .map_err(|_| {
            self.error_callbacks.report(
                format_args!(
                    "no memory type satisfies type_bits={:#x} desired={:?} undesired={:?}",
                    requirements.memory_type_bits, desired_flags, undesired_flags
                ),
                file!(),
                line!(),
                "Allocator::allocate_dedicated",
            );
            Error::NoSuitableMemoryType
        })?;

        let (size, align) =
            self.normalize(requirements.size, requirements.alignment, memory_type_index);

        let pool = Pool::create(
            &self.device,
            self.vk_allocation_callbacks.as_ref(),
            memory_type_index,
            size,
        )?;
        let pool_key = self.pools.insert(pool);

        let chunk_id = self.pools[pool_key]
            .allocate(size, align, 0)?
            .expect("a dedicated pool always fits its own allocation");
        #[cfg(feature = "track-allocations")]
        self.pools[pool_key].set_alloc_site(chunk_id, site);

        Ok(Allocation {
            pool_key,
            chunk_id,
        })
    }

    /// Release a chunk back to its pool and, if policy says so and the
    /// pool is now entirely free, release the pool back to the driver.
    /// Fails with [`Error::Unknown`] if `allocation` does not belong to
    /// this allocator — its pool was already released, or its chunk was
    /// already deallocated.
    #[tracing::instrument(skip(self), err)]
    pub fn deallocate(&mut self, allocation: Allocation) -> Result<(), Error> {
        if !self.pools.contains(allocation.pool_key) {
            self.error_callbacks.report(
                format_args!(
                    "deallocate: pool key {} is not known to this allocator",
                    allocation.pool_key
                ),
                file!(),
                line!(),
                "Allocator::deallocate",
            );
            return Err(Error::Unknown);
        }

        if let Err(err) = self.pools[allocation.pool_key].deallocate(allocation.chunk_id) {
            self.error_callbacks.report(
                format_args!(
                    "deallocate: chunk not found in pool of memory type {}",
                    self.pools[allocation.pool_key].memory_type_index()
                ),
                file!(),
                line!(),
                "Allocator::deallocate",
            );
            return Err(err);
        }

        if self.automatically_free_unused
            && self.pools[allocation.pool_key].is_entirely_free()
        {
            self.free_pool(allocation.pool_key);
        }

        Ok(())
    }

    /// Sweep every pool and release any that are entirely free. Applications
    /// call this when `automatically_free_unused` is disabled and they want
    /// to reclaim memory at a convenient point instead of on every
    /// deallocation.
    ///
    /// Finding a releasable pool here while `automatically_free_unused` is
    /// on would mean that policy's eager release already failed to run on
    /// some earlier deallocation — an invariant violation reported through
    /// `error_callbacks` in debug builds rather than silently compensated
    /// for.
    #[tracing::instrument(skip(self))]
    pub fn free_unused(&mut self) {
        let releasable: Vec<usize> = self
            .pools
            .iter()
            .filter(|(_, pool)| pool.is_entirely_free())
            .map(|(key, _)| key)
            .collect();

        #[cfg(debug_assertions)]
        if self.automatically_free_unused && !releasable.is_empty() {
            self.error_callbacks.report(
                format_args!(
                    "free_unused found {} releasable pool(s) while automatically_free_unused \
                     was on — auto-free should have released them already",
                    releasable.len()
                ),
                file!(),
                line!(),
                "Allocator::free_unused",
            );
        }

        for key in releasable {
            self.free_pool(key);
        }
    }

    fn free_pool(&mut self, key: usize) {
        let pool = self.pools.remove(key);
        pool.destroy(&self.device, self.vk_allocation_callbacks.as_ref());
    }

    /// Fails with [`Error::Unknown`] if `allocation`'s pool or chunk is not
    /// known to this allocator — see [`Allocator::deallocate`].
    fn chunk_extent(&self, allocation: Allocation) -> Result<(u64, u64), Error> {
        let chunk = self
            .pools
            .get(allocation.pool_key)
            .and_then(|pool| pool.chunk(allocation.chunk_id))
            .ok_or(Error::Unknown)?;
        Ok((chunk.data_offset(), chunk.data_size()))
    }

    pub fn memory(&self, allocation: Allocation) -> Result<vk1_0::DeviceMemory, Error> {
        self.pools
            .get(allocation.pool_key)
            .map(|pool| pool.memory())
            .ok_or(Error::Unknown)
    }

    /// Offset at which a resource allocated into `allocation` must be
    /// bound (`vkBindBufferMemory`/`vkBindImageMemory`'s third argument).
    pub fn bind_offset(&self, allocation: Allocation) -> Result<u64, Error> {
        self.chunk_extent(allocation).map(|(offset, _)| offset)
    }

    pub fn allocation_size(&self, allocation: Allocation) -> Result<u64, Error> {
        self.chunk_extent(allocation).map(|(_, size)| size)
    }

    /// Map a chunk's data region to a host pointer, mapping the whole pool
    /// on first use and sharing that map (and its refcount) with any other
    /// chunk already mapped in the same pool.
    #[tracing::instrument(skip(self), err)]
    pub fn map(
        &mut self,
        allocation: Allocation,
    ) -> Result<std::ptr::NonNull<u8>, MappingError> {
        let pool = self
            .pools
            .get_mut(allocation.pool_key)
            .ok_or(MappingError::Unknown)?;
        let host_visible = self.memory_types[pool.memory_type_index() as usize]
            .property_flags
            .contains(vk1_0::MemoryPropertyFlags::HOST_VISIBLE);
        if !host_visible {
            return Err(MappingError::NonHostVisible);
        }
        pool.map(&self.device, allocation.chunk_id)
    }

    #[tracing::instrument(skip(self), err)]
    pub fn unmap(&mut self, allocation: Allocation) -> Result<(), MappingError> {
        self.pools
            .get_mut(allocation.pool_key)
            .ok_or(MappingError::Unknown)?
            .unmap(&self.device, allocation.chunk_id)
    }

    /// Whether `allocation`'s chunk currently has a live host mapping.
    /// Used by `BufferAllocation`/`ImageAllocation` destruction to unmap
    /// a still-mapped chunk before releasing it, per the resource-binder
    /// teardown contract.
    pub(crate) fn is_mapped(&self, allocation: Allocation) -> Result<bool, Error> {
        self.pools
            .get(allocation.pool_key)
            .and_then(|pool| pool.chunk(allocation.chunk_id))
            .map(|chunk| chunk.is_mapped())
            .ok_or(Error::Unknown)
    }

    pub fn flush(&self, allocation: Allocation) -> Result<(), Error> {
        let pool = self
            .pools
            .get(allocation.pool_key)
            .ok_or(Error::Unknown)?;
        pool.flush(&self.device, allocation.chunk_id);
        Ok(())
    }

    pub fn invalidate(&self, allocation: Allocation) -> Result<(), Error> {
        let pool = self
            .pools
            .get(allocation.pool_key)
            .ok_or(Error::Unknown)?;
        pool.invalidate(&self.device, allocation.chunk_id);
        Ok(())
    }
}

impl Drop for Allocator {
    /// Unconditional teardown: every remaining pool is released to the
    /// driver regardless of whether it still has chunks marked used.
    /// Any pool with more than one chunk, or any still-used chunk, is
    /// reported through `error_callbacks` first — it indicates a caller
    /// leaked a `BufferAllocation`/`ImageAllocation` — but the handle is
    /// freed either way; an allocator that refused to tear down because a
    /// caller forgot to clean up would just turn one bug into a second,
    /// worse one (a leaked `VkDeviceMemory` alongside the original leak).
    fn drop(&mut self) {
        for (_, pool) in &self.pools {
            if pool.chunk_count() > 1 {
                self.error_callbacks.report(
                    format_args!(
                        "pool of memory type {} destroyed with {} live chunks",
                        pool.memory_type_index(),
                        pool.chunk_count()
                    ),
                    file!(),
                    line!(),
                    "Allocator::drop",
                );
            }

            #[cfg(feature = "track-allocations")]
            for chunk in pool.chunks() {
                if !chunk.is_used() {
                    continue;
                }
                match chunk.alloc_site() {
                    Some(site) => self.error_callbacks.report(
                        format_args!(
                            "chunk allocated at {}:{} was not freed",
                            site.file, site.line
                        ),
                        file!(),
                        line!(),
                        "Allocator::drop",
                    ),
                    None => self.error_callbacks.report(
                        format_args!("chunk was not freed (no allocation site recorded)"),
                        file!(),
                        line!(),
                        "Allocator::drop",
                    ),
                }
            }
        }

        for pool in self.pools.drain() {
            pool.destroy(&self.device, self.vk_allocation_callbacks.as_ref());
        }
    }
}
