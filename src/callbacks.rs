//! Host-side capability injection: pluggable host allocation and advisory
//! error reporting, independent of `tracing` instrumentation.

use std::{ffi::c_void, fmt};

/// Host allocation hooks, mirroring the allocate/reallocate/free triple a
/// Vulkan-adjacent allocator is conventionally handed. Stable Rust gives
/// collections no way to route their actual byte allocations through an
/// arbitrary function pointer, so these are stored for API parity and for
/// callers that want to observe host allocation activity; the fallible-OOM
/// contract they represent is honored instead via `Vec::try_reserve` at
/// every point this crate grows a pool or chunk array.
#[derive(Clone, Copy)]
pub struct AllocationCallbacks {
    pub state: *mut c_void,
    pub allocate: unsafe fn(state: *mut c_void, size: usize, align: usize) -> *mut c_void,
    pub reallocate: unsafe fn(
        state: *mut c_void,
        original: *mut c_void,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> *mut c_void,
    pub free: unsafe fn(state: *mut c_void, ptr: *mut c_void, size: usize, align: usize),
}

impl fmt::Debug for AllocationCallbacks {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AllocationCallbacks").finish()
    }
}

unsafe impl Send for AllocationCallbacks {}
unsafe impl Sync for AllocationCallbacks {}

unsafe fn default_allocate(
    _state: *mut c_void,
    size: usize,
    align: usize,
) -> *mut c_void {
    let layout = match std::alloc::Layout::from_size_align(size, align) {
        Ok(layout) => layout,
        Err(_) => return std::ptr::null_mut(),
    };
    std::alloc::alloc(layout) as *mut c_void
}

unsafe fn default_reallocate(
    _state: *mut c_void,
    original: *mut c_void,
    old_size: usize,
    new_size: usize,
    align: usize,
) -> *mut c_void {
    let layout = match std::alloc::Layout::from_size_align(old_size, align) {
        Ok(layout) => layout,
        Err(_) => return std::ptr::null_mut(),
    };
    std::alloc::realloc(original as *mut u8, layout, new_size) as *mut c_void
}

unsafe fn default_free(
    _state: *mut c_void,
    ptr: *mut c_void,
    size: usize,
    align: usize,
) {
    if let Ok(layout) = std::alloc::Layout::from_size_align(size, align) {
        std::alloc::dealloc(ptr as *mut u8, layout);
    }
}

impl Default for AllocationCallbacks {
    fn default() -> Self {
        AllocationCallbacks {
            state: std::ptr::null_mut(),
            allocate: default_allocate,
            reallocate: default_reallocate,
            free: default_free,
        }
    }
}

/// The advisory error-report side channel. Independent of the `Result`
/// return code every fallible operation also produces; a call can both
/// return `Err` *and* invoke this callback, or invoke it for conditions
/// (leaked allocations at teardown) that have no return code to carry them.
/// Every report carries the file, line and function of the call site inside
/// this crate that raised it, mirroring the `file`/`line`/`function` triple
/// the allocator this capability is modeled on threads into its own default
/// report handler.
#[derive(Clone, Copy)]
pub struct ErrorCallbacks {
    pub state: *mut c_void,
    pub report:
        unsafe fn(state: *mut c_void, message: &str, file: &str, line: u32, function: &str),
}

impl fmt::Debug for ErrorCallbacks {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ErrorCallbacks").finish()
    }
}

unsafe impl Send for ErrorCallbacks {}
unsafe impl Sync for ErrorCallbacks {}

unsafe fn default_report(
    _state: *mut c_void,
    message: &str,
    file: &str,
    line: u32,
    function: &str,
) {
    eprintln!("{}:{} - {}: {}", file, line, function, message);
}

impl Default for ErrorCallbacks {
    fn default() -> Self {
        ErrorCallbacks {
            state: std::ptr::null_mut(),
            report: default_report,
        }
    }
}

impl ErrorCallbacks {
    pub(crate) fn report(
        &self,
        message: fmt::Arguments<'_>,
        file: &str,
        line: u32,
        function: &str,
    ) {
        tracing::error!(file, line, function, "{}", message);
        let message = message.to_string();
        unsafe { (self.report)(self.state, &message, file, line, function) }
    }
}
