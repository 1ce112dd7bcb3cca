//! The boundary between this crate's allocator and actual Vulkan resources:
//! create a buffer or image, ask the allocator for backing memory, bind it,
//! and reverse every step in order if a later one fails.

use {
    crate::{error::Error, Allocation, Allocator},
    erupt::{
        vk1_0::{self, Vk10DeviceLoaderExt as _},
        DeviceLoader,
    },
};

/// A `VkBuffer` bound to memory carved out of an [`Allocator`].
///
/// This does not store a back-reference to its owning `Allocator` — every
/// method that needs one (`create`, `destroy`) takes `&mut Allocator`
/// explicitly instead, since the caller always has one in hand (the
/// allocator is not reference-counted and cannot safely be aliased behind
/// a stored pointer). [`BufferAllocation::allocation`] returns the opaque
/// [`Allocation`] handle to pass to whichever `Allocator` the caller is
/// already holding.
#[derive(Debug)]
pub struct BufferAllocation {
    buffer: vk1_0::Buffer,
    allocation: Allocation,
}

impl BufferAllocation {
    pub fn handle(&self) -> vk1_0::Buffer {
        self.buffer
    }

    /// The [`Allocation`] handle backing this buffer, valid only against the
    /// `Allocator` that produced it via [`BufferAllocation::create`].
    pub fn allocation(&self) -> Allocation {
        self.allocation
    }

    /// Create a buffer, request memory satisfying `desired_flags` (and
    /// without `undesired_flags`) from `allocator`, and bind it. Unwinds in
    /// reverse — destroys the buffer — if allocation or binding fails.
    #[tracing::instrument(skip(device, allocator, create_info), err)]
    pub fn create(
        device: &DeviceLoader,
        allocator: &mut Allocator,
        create_info: &vk1_0::BufferCreateInfoBuilder<'_>,
        desired_flags: vk1_0::MemoryPropertyFlags,
        undesired_flags: vk1_0::MemoryPropertyFlags,
        dedicated: bool,
    ) -> Result<Self, Error> {
        let buffer = unsafe {
            device
                .create_buffer(create_info, allocator.vk_allocation_callbacks(), None)
                .result()
        }
        .map_err(|err| {
            tracing::error!("vkCreateBuffer failed: {}", err);
            crate::error::error_from_allocate_result(err)
        })?;

        let requirements =
            unsafe { device.get_buffer_memory_requirements(buffer, None) };

        let allocation = if dedicated {
            allocator.allocate_dedicated(requirements, desired_flags, undesired_flags)
        } else {
            allocator.allocate(requirements, desired_flags, undesired_flags)
        };

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe {
                    device.destroy_buffer(buffer, allocator.vk_allocation_callbacks())
                };
                return Err(err);
            }
        };

        let (memory, offset) = match allocator
            .memory(allocation)
            .and_then(|memory| allocator.bind_offset(allocation).map(|offset| (memory, offset)))
        {
            Ok(pair) => pair,
            Err(err) => {
                let _ = allocator.deallocate(allocation);
                unsafe {
                    device.destroy_buffer(buffer, allocator.vk_allocation_callbacks())
                };
                return Err(err);
            }
        };

        let bind_result =
            unsafe { device.bind_buffer_memory(buffer, memory, offset).result() };

        if let Err(err) = bind_result {
            tracing::error!("vkBindBufferMemory failed: {}", err);
            let _ = allocator.deallocate(allocation);
            unsafe { device.destroy_buffer(buffer, allocator.vk_allocation_callbacks()) };
            return Err(crate::error::error_from_allocate_result(err));
        }

        Ok(BufferAllocation { buffer, allocation })
    }

    /// Destroy the buffer and release its memory back to the allocator.
    /// If the chunk was still mapped, it is unmapped first and the result
    /// of that unmap is ignored, matching the boundary's destruction
    /// contract.
    #[tracing::instrument(skip(self, device, allocator))]
    pub fn destroy(self, device: &DeviceLoader, allocator: &mut Allocator) {
        unsafe { device.destroy_buffer(self.buffer, allocator.vk_allocation_callbacks()) };
        if allocator.is_mapped(self.allocation).unwrap_or(false) {
            let _ = allocator.unmap(self.allocation);
        }
        let _ = allocator.deallocate(self.allocation);
    }
}

/// A `VkImage` bound to memory carved out of an [`Allocator`].
///
/// Same deviation as [`BufferAllocation`]: no stored back-reference to its
/// owning `Allocator`. See that type's docs for why.
#[derive(Debug)]
pub struct ImageAllocation {
    image: vk1_0::Image,
    allocation: Allocation,
}

impl ImageAllocation {
    pub fn handle(&self) -> vk1_0::Image {
        self.image
    }

    /// The [`Allocation`] handle backing this image, valid only against the
    /// `Allocator` that produced it via [`ImageAllocation::create`].
    pub fn allocation(&self) -> Allocation {
        self.allocation
    }

    #[tracing::instrument(skip(device, allocator, create_info), err)]
    pub fn create(
        device: &DeviceLoader,
        allocator: &mut Allocator,
        create_info: &vk1_0::ImageCreateInfoBuilder<'_>,
        desired_flags: vk1_0::MemoryPropertyFlags,
        undesired_flags: vk1_0::MemoryPropertyFlags,
        dedicated: bool,
    ) -> Result<Self, Error> {
        let image = unsafe {
            device
                .create_image(create_info, allocator.vk_allocation_callbacks(), None)
                .result()
        }
        .map_err(|err| {
            tracing::error!("vkCreateImage failed: {}", err);
            crate::error::error_from_allocate_result(err)
        })?;

        let requirements =
            unsafe { device.get_image_memory_requirements(image, None) };

        let allocation = if dedicated {
            allocator.allocate_dedicated(requirements, desired_flags, undesired_flags)
        } else {
            allocator.allocate(requirements, desired_flags, undesired_flags)
        };

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe {
                    device.destroy_image(image, allocator.vk_allocation_callbacks())
                };
                return Err(err);
            }
        };

        let (memory, offset) = match allocator
            .memory(allocation)
            .and_then(|memory| allocator.bind_offset(allocation).map(|offset| (memory, offset)))
        {
            Ok(pair) => pair,
            Err(err) => {
                let _ = allocator.deallocate(allocation);
                unsafe { device.destroy_image(image, allocator.vk_allocation_callbacks()) };
                return Err(err);
            }
        };

        let bind_result =
            unsafe { device.bind_image_memory(image, memory, offset).result() };

        if let Err(err) = bind_result {
            tracing::error!("vkBindImageMemory failed: {}", err);
            let _ = allocator.deallocate(allocation);
            unsafe { device.destroy_image(image, allocator.vk_allocation_callbacks()) };
            return Err(crate::error::error_from_allocate_result(err));
        }

        Ok(ImageAllocation { image, allocation })
    }

    /// Destroy the image and release its memory back to the allocator.
    /// If the chunk was still mapped, it is unmapped first and the result
    /// of that unmap is ignored, matching the boundary's destruction
    /// contract.
    #[tracing::instrument(skip(self, device, allocator))]
    pub fn destroy(self, device: &DeviceLoader, allocator: &mut Allocator) {
        unsafe { device.destroy_image(self.image, allocator.vk_allocation_callbacks()) };
        if allocator.is_mapped(self.allocation).unwrap_or(false) {
            let _ = allocator.unmap(self.allocation);
        }
        let _ = allocator.deallocate(self.allocation);
    }
}

