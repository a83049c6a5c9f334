//! Hugepage backed memory region used for DMA capable allocations. All I/O
//! buffers handed to leaf drivers must come out of this region so that the
//! PCIe transport can translate them to bus addresses.
//!
//! The region is reserved once at environment initialization. When hugepages
//! are not available (unprivileged test runs) the reservation silently falls
//! back to plain anonymous memory, in which case translation only works in
//! `va` mode.

use std::ptr::NonNull;

use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

/// how addresses handed to devices are formed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IovaMode {
    /// virtual addresses are used as bus addresses
    Va,
    /// physical addresses resolved through the pagemap
    Pa,
}

impl Default for IovaMode {
    fn default() -> Self {
        IovaMode::Va
    }
}

#[derive(Debug)]
struct Region {
    base: NonNull<u8>,
    len: usize,
    hugepages: bool,
    iova_mode: IovaMode,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[derive(Debug)]
struct FreeList {
    /// (offset, len) pairs, kept sorted by offset
    holes: Vec<(usize, usize)>,
}

static REGION: OnceCell<Region> = OnceCell::new();
static FREE_LIST: OnceCell<Mutex<FreeList>> = OnceCell::new();

const HUGE_2MB: usize = 2 * 1024 * 1024;
const DEFAULT_REGION_MB: usize = 32;

/// Reserve the DMA region. `size_mb == 0` reserves the default test size.
/// Idempotent; the first call wins.
pub fn init(size_mb: usize, _single_segment: bool, iova_mode: IovaMode) {
    REGION.get_or_init(|| {
        let mb = if size_mb == 0 {
            DEFAULT_REGION_MB
        } else {
            size_mb
        };
        let len = mb * 1024 * 1024;

        let huge = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE
                    | MapFlags::MAP_ANONYMOUS
                    | MapFlags::MAP_HUGETLB,
                -1,
                0,
            )
        };

        let (ptr, hugepages) = match huge {
            Ok(p) => (p, true),
            Err(e) => {
                warn!(
                    "hugepage reservation of {} MiB failed ({}), \
                     falling back to anonymous memory",
                    mb, e
                );
                let p = unsafe {
                    mmap(
                        std::ptr::null_mut(),
                        len,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                }
                .expect("failed to reserve DMA memory region");
                (p, false)
            }
        };

        info!(
            "DMA region of {} MiB reserved at {:p} (hugepages: {})",
            mb, ptr, hugepages
        );

        FREE_LIST
            .set(Mutex::new(FreeList {
                holes: vec![(0, len)],
            }))
            .expect("memory free list already initialized");

        Region {
            base: NonNull::new(ptr as *mut u8).unwrap(),
            len,
            hugepages,
            iova_mode,
        }
    });
}

fn region() -> &'static Region {
    if REGION.get().is_none() {
        init(0, false, IovaMode::Va);
    }
    REGION.get().unwrap()
}

/// Allocate `size` bytes aligned to `align` from the region. Thread safe.
/// Returns None when the region is exhausted; this is the hard no-memory
/// condition of the allocator.
pub(crate) fn alloc(size: usize, align: usize) -> Option<NonNull<u8>> {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    let r = region();
    let mut fl = FREE_LIST.get().unwrap().lock();

    let base = r.base.as_ptr() as usize;
    for i in 0 .. fl.holes.len() {
        let (off, len) = fl.holes[i];
        let aligned = (base + off + align - 1) & !(align - 1);
        let pad = aligned - (base + off);
        if pad + size > len {
            continue;
        }

        // carve [pad, pad + size) out of the hole
        fl.holes.remove(i);
        if pad > 0 {
            fl.holes.insert(i, (off, pad));
        }
        let tail = len - pad - size;
        if tail > 0 {
            let at = if pad > 0 { i + 1 } else { i };
            fl.holes.insert(at, (off + pad + size, tail));
        }
        return NonNull::new(aligned as *mut u8);
    }
    None
}

/// Return an allocation to the region.
pub(crate) fn free(ptr: NonNull<u8>, size: usize) {
    let r = region();
    let off = ptr.as_ptr() as usize - r.base.as_ptr() as usize;
    assert!(off + size <= r.len, "free outside of the DMA region");

    let mut fl = FREE_LIST.get().unwrap().lock();
    let pos = fl
        .holes
        .iter()
        .position(|&(o, _)| o > off)
        .unwrap_or(fl.holes.len());
    fl.holes.insert(pos, (off, size));

    // coalesce with neighbours
    if pos + 1 < fl.holes.len() {
        let (o, l) = fl.holes[pos];
        let (no, nl) = fl.holes[pos + 1];
        if o + l == no {
            fl.holes[pos] = (o, l + nl);
            fl.holes.remove(pos + 1);
        }
    }
    if pos > 0 {
        let (po, pl) = fl.holes[pos - 1];
        let (o, l) = fl.holes[pos];
        if po + pl == o {
            fl.holes[pos - 1] = (po, pl + l);
            fl.holes.remove(pos);
        }
    }
}

/// Translate a virtual address inside the DMA region to the address a device
/// should be given. In `va` mode this is the identity; in `pa` mode the
/// pagemap is consulted.
pub fn virt_to_phys(ptr: *const u8) -> u64 {
    let r = region();
    match r.iova_mode {
        IovaMode::Va => ptr as u64,
        IovaMode::Pa => pagemap_translate(ptr).unwrap_or_else(|| {
            warn!("pagemap translation failed, falling back to VA");
            ptr as u64
        }),
    }
}

fn pagemap_translate(ptr: *const u8) -> Option<u64> {
    use std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
    };

    let page_size = 4096u64;
    let vaddr = ptr as u64;
    let mut f = File::open("/proc/self/pagemap").ok()?;
    f.seek(SeekFrom::Start((vaddr / page_size) * 8)).ok()?;
    let mut entry = [0u8; 8];
    f.read_exact(&mut entry).ok()?;
    let entry = u64::from_le_bytes(entry);
    // bit 63: present, bits 0-54: pfn
    if entry & (1 << 63) == 0 {
        return None;
    }
    let pfn = entry & ((1 << 55) - 1);
    Some(pfn * page_size + vaddr % page_size)
}

/// True when the backing region actually consists of hugepages.
pub fn backed_by_hugepages() -> bool {
    region().hugepages
}

/// Size of a single hugepage segment.
pub fn hugepage_size() -> usize {
    HUGE_2MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_coalesce() {
        init(0, false, IovaMode::Va);
        let a = alloc(4096, 4096).unwrap();
        let b = alloc(8192, 4096).unwrap();
        assert_eq!(a.as_ptr() as usize % 4096, 0);
        assert_ne!(a.as_ptr(), b.as_ptr());
        free(a, 4096);
        free(b, 8192);
        let c = alloc(12288, 4096).unwrap();
        free(c, 12288);
    }

    #[test]
    fn va_mode_translation_is_identity() {
        init(0, false, IovaMode::Va);
        let a = alloc(4096, 4096).unwrap();
        assert_eq!(virt_to_phys(a.as_ptr()), a.as_ptr() as u64);
        free(a, 4096);
    }
}
