use {
    erupt::vk1_0,
    std::fmt::{self, Display, Formatter},
};

/// Host memory is exhausted (growing an internal pool/chunk array failed, or
/// the driver itself reported `VK_ERROR_OUT_OF_HOST_MEMORY`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutOfHostMemory;

impl Display for OutOfHostMemory {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str("Host memory is exhausted")
    }
}

impl std::error::Error for OutOfHostMemory {}

/// Device memory of every eligible type is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutOfDeviceMemory;

impl Display for OutOfDeviceMemory {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str("Device memory is exhausted")
    }
}

impl std::error::Error for OutOfDeviceMemory {}

/// No memory type satisfies the requested type mask and property flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NoSuitableMemoryType;

impl Display for NoSuitableMemoryType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str("No memory type satisfies the request")
    }
}

impl std::error::Error for NoSuitableMemoryType {}

/// A chunk or pool referenced by an `Allocation` could not be found where
/// it was declared to live — the chunk was already deallocated, or the
/// `Allocation`/`ChunkId` does not belong to the structure it was handed
/// to. This is an internal consistency failure, not a resource condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkNotFound;

impl Display for ChunkNotFound {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str("chunk not found in its declared pool")
    }
}

impl std::error::Error for ChunkNotFound {}

/// Errors that can occur while allocating, binding or destroying a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    OutOfHostMemory,
    OutOfDeviceMemory,
    NoSuitableMemoryType,
    /// An internal consistency check failed: a chunk was not found in its
    /// declared pool, or a pool was not found in its declared allocator.
    /// Surfaced when an `Allocation` is reused after its pool has already
    /// been released, or otherwise does not belong to the `Allocator` it
    /// was handed to.
    Unknown,
    /// The driver returned a result code this crate does not special-case.
    Driver(vk1_0::Result),
}

impl Display for Error {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfHostMemory => Display::fmt(&OutOfHostMemory, fmt),
            Error::OutOfDeviceMemory => Display::fmt(&OutOfDeviceMemory, fmt),
            Error::NoSuitableMemoryType => {
                Display::fmt(&NoSuitableMemoryType, fmt)
            }
            Error::Unknown => {
                fmt.write_str("internal consistency check failed: allocation does not belong to this allocator")
            }
            Error::Driver(result) => {
                write!(fmt, "driver returned unexpected result: {}", result)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<OutOfHostMemory> for Error {
    fn from(_: OutOfHostMemory) -> Self {
        Error::OutOfHostMemory
    }
}

impl From<OutOfDeviceMemory> for Error {
    fn from(_: OutOfDeviceMemory) -> Self {
        Error::OutOfDeviceMemory
    }
}

impl From<NoSuitableMemoryType> for Error {
    fn from(_: NoSuitableMemoryType) -> Self {
        Error::NoSuitableMemoryType
    }
}

impl From<ChunkNotFound> for Error {
    fn from(_: ChunkNotFound) -> Self {
        Error::Unknown
    }
}

/// Translate a raw driver result from `vkAllocateMemory` into an `Error`.
/// Any code other than the two documented OOM codes is preserved verbatim
/// so callers and the error-report side channel can see exactly what the
/// driver said.
pub(crate) fn error_from_allocate_result(result: vk1_0::Result) -> Error {
    match result {
        vk1_0::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfHostMemory,
        vk1_0::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfDeviceMemory,
        other => Error::Driver(other),
    }
}

/// Errors that can occur while mapping or unmapping a chunk's host pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MappingError {
    OutOfHostMemory,

    /// The chunk's memory type is not `HOST_VISIBLE`.
    NonHostVisible,

    /// The chunk is already mapped, or already unmapped.
    AlreadyMapped,
    NotMapped,

    /// The allocation does not belong to this allocator — same internal
    /// consistency failure as [`Error::Unknown`], surfaced on this channel
    /// because map/unmap report through `MappingError` rather than `Error`.
    Unknown,

    /// `vkMapMemory` returned a result this crate does not special-case.
    Driver(vk1_0::Result),
}

impl Display for MappingError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::OutOfHostMemory => Display::fmt(&OutOfHostMemory, fmt),
            MappingError::NonHostVisible => {
                fmt.write_str("memory is not host-visible and cannot be mapped")
            }
            MappingError::AlreadyMapped => {
                fmt.write_str("chunk is already mapped")
            }
            MappingError::NotMapped => fmt.write_str("chunk is not mapped"),
            MappingError::Unknown => {
                fmt.write_str("internal consistency check failed: allocation does not belong to this allocator")
            }
            MappingError::Driver(result) => {
                write!(fmt, "driver returned unexpected result: {}", result)
            }
        }
    }
}

impl std::error::Error for MappingError {}
