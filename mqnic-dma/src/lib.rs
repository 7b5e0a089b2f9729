//! DMA-coherent memory allocation for userspace NIC drivers.
//!
//! This crate provides physically-contiguous, page-locked memory for
//! descriptor rings, completion rings, and packet-buffer mempools. It is the
//! allocator the driver core treats as an external collaborator: the core
//! only ever sees `{virt, phys}` pairs, never how they were obtained.
//!
//! # Allocation strategy
//!
//! Each call to [`allocate_dma`] maps one `hugetlbfs`-backed file (2 MB
//! hugepages keep a multi-megabyte ring or mempool region contiguous and
//! single-page-table-entry, which a long chain of 4 KB pages cannot
//! guarantee). If no hugetlbfs mount is available the allocator falls back
//! to anonymous `MAP_LOCKED | MAP_POPULATE` memory and logs the degraded
//! path; physical contiguity is then only as good as the kernel's page
//! allocator gives for a single `mmap`, which is adequate for the ring and
//! mempool sizes this driver uses but is not a hugepage-backed guarantee.
//!
//! Physical addresses are resolved per page via `/proc/self/pagemap`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Page size (4 KB) — used when resolving physical addresses via pagemap.
pub const PAGE_SIZE: usize = 4096;

/// Hugepage size (2 MB) — the unit `allocate_dma` rounds requests up to.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Mountpoint this driver expects for hugetlbfs allocations.
pub const HUGETLBFS_PATH: &str = "/mnt/huge";

/// Maximum allocation-tracking entries (mirrors the fixed-capacity tracking
/// table idiom this driver lineage's bare-metal DMA pool uses; a polling
/// driver opens a bounded number of regions at bring-up, never in the hot
/// path).
pub const MAX_ALLOCATIONS: usize = 256;

#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

#[inline]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}

/// DMA allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Requested a zero-byte region.
    ZeroSize,
    /// `mmap` failed (hugetlbfs and the anonymous fallback both failed).
    MmapFailed,
    /// Could not open `/proc/self/pagemap` to resolve a physical address.
    PagemapUnavailable,
    /// A mapped page was not present in RAM (should not happen for
    /// `MAP_POPULATE`d or hugepage memory, but the pagemap bit is checked).
    PageNotPresent,
    /// The allocation-tracking table is full.
    TrackingTableFull,
}

impl DmaError {
    pub fn description(&self) -> &'static str {
        match self {
            DmaError::ZeroSize => "requested a zero-byte DMA region",
            DmaError::MmapFailed => "mmap failed for both hugetlbfs and anonymous fallback",
            DmaError::PagemapUnavailable => "/proc/self/pagemap could not be opened",
            DmaError::PageNotPresent => "mapped page has no physical frame in pagemap",
            DmaError::TrackingTableFull => "DMA allocation-tracking table is full",
        }
    }
}

impl std::fmt::Display for DmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

impl std::error::Error for DmaError {}

pub type Result<T> = std::result::Result<T, DmaError>;

/// A DMA-coherent region: a CPU-visible pointer plus the physical address
/// the NIC must be programmed with.
#[derive(Debug)]
pub struct DmaMemory {
    pub virt: NonNull<u8>,
    pub phys: u64,
    pub size: usize,
    anonymous: bool,
}

// SAFETY: the region is exclusively owned by whoever holds the `DmaMemory`;
// moving ownership across threads is fine as long as the ring/mempool that
// wraps it upholds the single-owner-per-queue rule the driver core enforces.
unsafe impl Send for DmaMemory {}

impl DmaMemory {
    /// Raw byte slice view (for zeroing or carving into fixed-size
    /// entries). The caller is responsible for honoring the driver's
    /// single-writer-per-region discipline.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.virt.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.virt.as_ptr(), self.size) }
    }
}

#[derive(Clone, Copy)]
struct Allocation {
    virt: usize,
    size: usize,
    anonymous: bool,
    in_use: bool,
}

impl Allocation {
    const fn empty() -> Self {
        Self { virt: 0, size: 0, anonymous: false, in_use: false }
    }
}

struct TrackingTable {
    entries: std::cell::UnsafeCell<[Allocation; MAX_ALLOCATIONS]>,
    count: AtomicUsize,
}

// SAFETY: guarded by `TABLE_LOCK` below, same spinlock discipline this
// codebase's other DMA allocator uses around its allocation table.
unsafe impl Sync for TrackingTable {}

static TABLE: TrackingTable = TrackingTable {
    entries: std::cell::UnsafeCell::new([Allocation::empty(); MAX_ALLOCATIONS]),
    count: AtomicUsize::new(0),
};

static TABLE_LOCK: AtomicBool = AtomicBool::new(false);

#[inline]
fn lock() {
    while TABLE_LOCK
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
}

#[inline]
fn unlock() {
    TABLE_LOCK.store(false, Ordering::Release);
}

static HUGEPAGE_ID: AtomicUsize = AtomicUsize::new(0);

/// Allocate a physically-contiguous, page-locked region of at least `size`
/// bytes. Rounds up to a hugepage multiple when hugetlbfs is mounted,
/// otherwise to a regular page multiple.
pub fn allocate_dma(size: usize) -> Result<DmaMemory> {
    if size == 0 {
        return Err(DmaError::ZeroSize);
    }

    match allocate_hugepage(size) {
        Ok(mem) => return track(mem),
        Err(e) => {
            log::warn!(
                "hugepage DMA allocation failed ({}), falling back to anonymous MAP_LOCKED",
                e
            );
        }
    }

    let mem = allocate_anonymous(size)?;
    track(mem)
}

fn track(mem: DmaMemory) -> Result<DmaMemory> {
    lock();
    let idx = TABLE.count.load(Ordering::Relaxed);
    if idx >= MAX_ALLOCATIONS {
        unlock();
        return Err(DmaError::TrackingTableFull);
    }
    unsafe {
        (*TABLE.entries.get())[idx] = Allocation {
            virt: mem.virt.as_ptr() as usize,
            size: mem.size,
            anonymous: mem.anonymous,
            in_use: true,
        };
    }
    TABLE.count.fetch_add(1, Ordering::Relaxed);
    unlock();
    Ok(mem)
}

fn allocate_hugepage(size: usize) -> Result<DmaMemory> {
    let aligned_size = align_up(size, HUGE_PAGE_SIZE);
    let id = HUGEPAGE_ID.fetch_add(1, Ordering::Relaxed);
    let path = format!("{}/mqnic-{}-{}", HUGETLBFS_PATH, std::process::id(), id);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(|_| DmaError::MmapFailed)?;
    file.set_len(aligned_size as u64).map_err(|_| DmaError::MmapFailed)?;
    let _ = std::fs::remove_file(&path);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            aligned_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_HUGETLB,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(DmaError::MmapFailed);
    }

    unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, aligned_size) };
    let phys = resolve_physical(ptr as usize)?;

    Ok(DmaMemory {
        virt: NonNull::new(ptr as *mut u8).ok_or(DmaError::MmapFailed)?,
        phys,
        size: aligned_size,
        anonymous: false,
    })
}

fn allocate_anonymous(size: usize) -> Result<DmaMemory> {
    let aligned_size = align_up(size, PAGE_SIZE);
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            aligned_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_LOCKED | libc::MAP_POPULATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(DmaError::MmapFailed);
    }

    let phys = resolve_physical(ptr as usize)?;

    Ok(DmaMemory {
        virt: NonNull::new(ptr as *mut u8).ok_or(DmaError::MmapFailed)?,
        phys,
        size: aligned_size,
        anonymous: true,
    })
}

/// Resolve the physical address backing a virtual page via
/// `/proc/self/pagemap`. Each entry is 8 bytes; bits 0-54 hold the page
/// frame number when bit 63 (present) is set.
fn resolve_physical(virt: usize) -> Result<u64> {
    let mut pagemap =
        OpenOptions::new().read(true).open("/proc/self/pagemap").map_err(|_| DmaError::PagemapUnavailable)?;

    let page_index = (virt / PAGE_SIZE) as u64;
    pagemap
        .seek(SeekFrom::Start(page_index * 8))
        .map_err(|_| DmaError::PagemapUnavailable)?;

    let mut buf = [0u8; 8];
    pagemap.read_exact(&mut buf).map_err(|_| DmaError::PagemapUnavailable)?;
    let entry = u64::from_ne_bytes(buf);

    if entry & (1 << 63) == 0 {
        return Err(DmaError::PageNotPresent);
    }
    let pfn = entry & ((1u64 << 55) - 1);
    let page_offset = (virt % PAGE_SIZE) as u64;
    Ok(pfn * PAGE_SIZE as u64 + page_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_functions() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn test_pages_bytes_roundtrip() {
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(PAGE_SIZE), 1);
        assert_eq!(bytes_to_pages(PAGE_SIZE + 1), 2);
        assert_eq!(pages_to_bytes(3), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_anonymous_fallback_is_physically_resolvable() {
        // Does not require hugetlbfs to be mounted in the test environment.
        let mem = allocate_anonymous(8192).expect("anonymous mmap should succeed");
        assert_eq!(mem.size, 8192);
        assert_ne!(mem.phys, 0);
        unsafe {
            libc::munmap(mem.virt.as_ptr() as *mut libc::c_void, mem.size);
        }
    }
}
