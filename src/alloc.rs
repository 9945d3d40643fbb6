//! Allocator facade: heap, node-bound, and persistent-memory allocation
//! behind one narrow interface.
//!
//! # Modes
//!
//! | Mode | Backing | Free path |
//! |------|---------|-----------|
//! | `Heap` | global allocator | `std::alloc::dealloc` |
//! | `NodeLocal(n)` | anonymous `mmap` + `mbind(MPOL_BIND)` | `munmap` |
//! | `Persistent` | file-backed region with size-class freelist | freelist push |
//!
//! Every allocation is prefixed by a small header recording its size and
//! mode, so a pointer alone is enough to free it. [`Region::bind_deleter`]
//! wraps that into a type-erased deleter that transaction payloads can own;
//! the free function then differs per allocation site without the payload
//! knowing which mode produced it.
//!
//! Plain worker allocations (projected databases, task captures) go through
//! the global allocator and land on the worker's node via the kernel's
//! first-touch policy, since workers are pinned. The facade is only for the
//! two placements first-touch cannot express: scatter targets on *other*
//! nodes, and the persistent region.
//!
//! Requested-but-unsupported modes fail fast with `MinerError::Resource`;
//! there is no silent fallback to the heap.

use std::alloc::Layout;
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;

use crate::error::{MinerError, Result};

/// Placement request for one allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Placement {
    /// Bind the pages to this node. `None` = caller's node (first touch).
    pub node: Option<usize>,
    /// Allocate from the persistent region instead of DRAM.
    pub persistent: bool,
}

impl Placement {
    pub const HEAP: Placement = Placement {
        node: None,
        persistent: false,
    };

    #[inline]
    pub fn on_node(node: usize) -> Self {
        Placement {
            node: Some(node),
            persistent: false,
        }
    }
}

/// Type-erased free function for a facade allocation.
pub type Deleter = Arc<dyn Fn(NonNull<u8>) + Send + Sync>;

// Header precedes every facade allocation. 16 bytes keeps the payload
// aligned for any transaction element type.
const HEADER: usize = 16;
const ALIGN: usize = 16;

const MODE_HEAP: usize = 0;
const MODE_MMAP: usize = 1;
const MODE_PMEM: usize = 2;

#[repr(C)]
struct AllocHeader {
    /// Payload size requested by the caller.
    size: usize,
    /// One of `MODE_*`.
    mode: usize,
}

const _: () = assert!(std::mem::size_of::<AllocHeader>() <= HEADER);

/// Process-wide allocation facade. Construct once, share via `Arc`.
pub struct Region {
    pmem: Option<PmemRegion>,
}

impl Region {
    /// A facade with no persistent backing; `persistent` requests fail.
    pub fn heap_only() -> Self {
        Self { pmem: None }
    }

    /// A facade backed by a persistent region file of `capacity` bytes.
    pub fn with_pmem(path: &Path, capacity: usize) -> Result<Self> {
        Ok(Self {
            pmem: Some(PmemRegion::create(path, capacity)?),
        })
    }

    pub fn has_pmem(&self) -> bool {
        self.pmem.is_some()
    }

    /// Allocate `size` payload bytes with the requested placement.
    pub fn alloc(&self, size: usize, placement: Placement) -> Result<NonNull<u8>> {
        if placement.persistent {
            let pmem = self.pmem.as_ref().ok_or_else(|| {
                MinerError::Resource("persistent allocation requested without a pmem region".into())
            })?;
            return pmem.alloc(size);
        }
        match placement.node {
            None => heap_alloc(size),
            Some(node) => node_alloc(size, node),
        }
    }

    /// Free a pointer previously returned by [`Region::alloc`].
    ///
    /// # Safety contract
    ///
    /// `ptr` must come from this facade (any mode) and must not be freed
    /// twice. The header in front of the payload selects the free path.
    pub fn dealloc(&self, ptr: NonNull<u8>) {
        // Pmem frees need the region's freelist; everything else is static.
        unsafe {
            let header = header_of(ptr);
            match (*header).mode {
                MODE_PMEM => {
                    if let Some(pmem) = self.pmem.as_ref() {
                        pmem.dealloc(ptr);
                    }
                }
                _ => dealloc_unbound(ptr),
            }
        }
    }

    /// Build a deleter bound to this facade for allocations of any mode.
    ///
    /// The returned closure owns whatever state the free path needs, so a
    /// transaction payload can carry it across threads and drop it long
    /// after the allocation site is gone.
    pub fn bind_deleter(region: &Arc<Region>, placement: Placement) -> Deleter {
        if placement.persistent {
            let region = Arc::clone(region);
            Arc::new(move |ptr| region.dealloc(ptr))
        } else {
            // Heap and mmap frees are self-describing.
            Arc::new(|ptr| unsafe { dealloc_unbound(ptr) })
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("pmem", &self.pmem.is_some())
            .finish()
    }
}

#[inline]
unsafe fn header_of(ptr: NonNull<u8>) -> *mut AllocHeader {
    ptr.as_ptr().sub(HEADER) as *mut AllocHeader
}

/// Free a heap or mmap allocation via its header. Pmem pointers must not
/// reach this path.
unsafe fn dealloc_unbound(ptr: NonNull<u8>) {
    let header = header_of(ptr);
    let size = (*header).size;
    match (*header).mode {
        MODE_HEAP => {
            let layout = Layout::from_size_align_unchecked(HEADER + size, ALIGN);
            std::alloc::dealloc(header as *mut u8, layout);
        }
        MODE_MMAP => {
            #[cfg(target_os = "linux")]
            {
                let total = page_round(HEADER + size);
                libc::munmap(header as *mut libc::c_void, total);
            }
            #[cfg(not(target_os = "linux"))]
            unreachable!("mmap mode never allocates off Linux");
        }
        mode => unreachable!("corrupt allocation header: mode {mode}"),
    }
}

fn heap_alloc(size: usize) -> Result<NonNull<u8>> {
    let layout = Layout::from_size_align(HEADER + size, ALIGN)
        .map_err(|e| MinerError::Internal(format!("bad layout for {size} bytes: {e}")))?;
    unsafe {
        let raw = std::alloc::alloc(layout);
        let Some(base) = NonNull::new(raw) else {
            return Err(MinerError::Resource(format!(
                "heap allocation of {size} bytes failed"
            )));
        };
        let header = base.as_ptr() as *mut AllocHeader;
        (*header).size = size;
        (*header).mode = MODE_HEAP;
        Ok(NonNull::new_unchecked(base.as_ptr().add(HEADER)))
    }
}

#[cfg(target_os = "linux")]
fn page_round(n: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    (n + page - 1) & !(page - 1)
}

/// Anonymous pages bound to `node` with `MPOL_BIND`. Strict: a node the
/// kernel cannot satisfy is an error, not a hint.
#[cfg(target_os = "linux")]
fn node_alloc(size: usize, node: usize) -> Result<NonNull<u8>> {
    if node >= 8 * std::mem::size_of::<libc::c_ulong>() {
        return Err(MinerError::Resource(format!(
            "node {node} out of range for the mbind mask"
        )));
    }
    let total = page_round(HEADER + size);
    unsafe {
        let raw = libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if raw == libc::MAP_FAILED {
            return Err(MinerError::Resource(format!(
                "mmap of {total} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let mask: libc::c_ulong = 1 << node;
        let rc = libc::syscall(
            libc::SYS_mbind,
            raw,
            total as libc::c_ulong,
            libc::MPOL_BIND,
            &mask,
            8 * std::mem::size_of::<libc::c_ulong>() as libc::c_ulong,
            0,
        );
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            libc::munmap(raw, total);
            return Err(MinerError::Resource(format!(
                "mbind to node {node} failed: {err}"
            )));
        }
        let header = raw as *mut AllocHeader;
        (*header).size = size;
        (*header).mode = MODE_MMAP;
        Ok(NonNull::new_unchecked((raw as *mut u8).add(HEADER)))
    }
}

#[cfg(not(target_os = "linux"))]
fn node_alloc(_size: usize, node: usize) -> Result<NonNull<u8>> {
    Err(MinerError::Resource(format!(
        "node-bound allocation (node {node}) is not supported on this platform"
    )))
}

// ============================================================================
// Persistent region
// ============================================================================

/// File-backed region carved by a bump pointer, recycled through size-class
/// freelists. The region is an allocation *target*, not a recovery log: the
/// file's contents are meaningless across runs.
struct PmemRegion {
    map: MmapMut,
    state: Mutex<PmemState>,
}

struct PmemState {
    bump: usize,
    /// `(payload_size, head_offset)` freelist bins; offset `usize::MAX` = empty.
    bins: Vec<(usize, usize)>,
}

impl PmemRegion {
    fn create(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| MinerError::Resource(format!("pmem open {}: {e}", path.display())))?;
        file.set_len(capacity as u64)
            .map_err(|e| MinerError::Resource(format!("pmem size {}: {e}", path.display())))?;
        let map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| MinerError::Resource(format!("pmem map {}: {e}", path.display())))?
        };
        Ok(Self {
            map,
            state: Mutex::new(PmemState {
                bump: 0,
                bins: Vec::new(),
            }),
        })
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let aligned = (HEADER + size + (ALIGN - 1)) & !(ALIGN - 1);
        let mut base = None;
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(bin) = state.bins.iter_mut().find(|(s, _)| *s == size) {
                if bin.1 != usize::MAX {
                    let offset = bin.1;
                    // First word of a freed block stores the next offset.
                    let next = unsafe { *(self.map.as_ptr().add(offset) as *const usize) };
                    bin.1 = next;
                    base = Some(offset);
                }
            }
            if base.is_none() && state.bump + aligned <= self.map.len() {
                base = Some(state.bump);
                state.bump += aligned;
            }
        }
        let Some(offset) = base else {
            return Err(MinerError::Resource(format!(
                "persistent region exhausted ({} bytes requested)",
                size
            )));
        };
        unsafe {
            let raw = self.map.as_ptr().add(offset) as *mut u8;
            let header = raw as *mut AllocHeader;
            (*header).size = size;
            (*header).mode = MODE_PMEM;
            Ok(NonNull::new_unchecked(raw.add(HEADER)))
        }
    }

    fn dealloc(&self, ptr: NonNull<u8>) {
        unsafe {
            let header = header_of(ptr);
            let size = (*header).size;
            let offset = (header as usize) - (self.map.as_ptr() as usize);
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let bin = match state.bins.iter_mut().find(|(s, _)| *s == size) {
                Some(bin) => bin,
                None => {
                    state.bins.push((size, usize::MAX));
                    state.bins.last_mut().unwrap()
                }
            };
            *(header as *mut usize) = bin.1;
            bin.1 = offset;
        }
    }
}
