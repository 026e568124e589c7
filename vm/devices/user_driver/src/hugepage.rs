// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinned, physically resolvable hugepage regions.
//!
//! Resolving physical addresses reads `/proc/self/pagemap`, which only
//! reports page frame numbers to processes holding `CAP_SYS_ADMIN`. Any
//! process allocating or importing DMA memory this way must therefore run
//! privileged. A privileged helper could instead resolve the addresses once
//! and publish them inside the shared region itself.

use crate::config::HostMemConfig;
use crate::config::HugepageBackend;
use crate::memory::MappedDmaTarget;
use crate::HostMemError;
use fs_err::os::unix::fs::OpenOptionsExt;
use std::ffi::c_void;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

/// Names hugetlbfs files uniquely within the process.
static HUGETLBFS_COUNT: AtomicU64 = AtomicU64::new(0);

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for Mapping {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for Mapping {}

/// An owned `mmap` result, unmapped on drop.
pub(crate) struct Mapping {
    addr: *mut c_void,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of anonymous private memory.
    pub(crate) fn anonymous(len: usize) -> std::io::Result<Self> {
        Self::map(len, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1)
    }

    /// Maps the first `len` bytes of `file` shared and writable.
    pub(crate) fn shared(file: &File, len: usize) -> std::io::Result<Self> {
        Self::map(len, libc::MAP_SHARED, file.as_raw_fd())
    }

    fn map(len: usize, flags: libc::c_int, fd: libc::c_int) -> std::io::Result<Self> {
        // SAFETY: No address is being passed, the file descriptor (if any) is
        // owned by the caller for the duration of the call. The result is
        // being validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }

        Ok(Self { addr, len })
    }

    pub(crate) fn lock(&self) -> std::io::Result<()> {
        // SAFETY: self contains a valid mmap result.
        if unsafe { libc::mlock(self.addr, self.len) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.addr.cast()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Writes to one byte of every page, then zeroes the mapping, so every
    /// page is faulted in and backed.
    fn touch_write(&self, page_size: usize) {
        for offset in (0..self.len).step_by(page_size) {
            // SAFETY: offset is within the mapping.
            unsafe { std::ptr::write_volatile(self.as_ptr().add(offset), 0) };
        }
        // SAFETY: the whole mapping is valid for writes.
        unsafe { std::ptr::write_bytes(self.as_ptr(), 0, self.len) };
    }

    /// Reads one byte of every page so the pages are mapped into this
    /// process.
    fn touch_read(&self, page_size: usize) {
        for offset in (0..self.len).step_by(page_size) {
            // SAFETY: offset is within the mapping.
            let _ = unsafe { std::ptr::read_volatile(self.as_ptr().add(offset)) };
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result.
        if unsafe { libc::munmap(self.addr, self.len) } < 0 {
            panic!("{:?}", std::io::Error::last_os_error());
        }
    }
}

/// Resolves the physical address backing `virt` through
/// `/proc/self/pagemap`.
pub fn virt_to_phys(virt: usize, page_size: usize) -> Result<u64, HostMemError> {
    let pagemap = fs_err::File::open("/proc/self/pagemap").map_err(|source| HostMemError::Os {
        op: "open pagemap",
        source,
    })?;
    let mut entry = [0; 8];
    pagemap
        .file()
        .read_exact_at(&mut entry, (virt / page_size * 8) as u64)
        .map_err(|source| HostMemError::Os {
            op: "read pagemap",
            source,
        })?;
    let entry = u64::from_ne_bytes(entry);
    if entry & PAGEMAP_PRESENT == 0 {
        return Err(HostMemError::NotPresent { virt });
    }
    let pfn = entry & PAGEMAP_PFN_MASK;
    if pfn == 0 {
        return Err(HostMemError::PrivilegeRequired { virt });
    }
    Ok(pfn * page_size as u64 + (virt % page_size) as u64)
}

/// A shared, locked mapping of one or more hugepages.
pub struct HugepageRegion {
    mapping: Mapping,
    // Held open so the region stays importable through /proc/<pid>/fd/<fd>.
    _file: File,
    path: PathBuf,
    phys: u64,
    hugepage_size: usize,
    page_size: usize,
    unlink_on_drop: bool,
}

impl std::fmt::Debug for HugepageRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HugepageRegion")
            .field("virt", &self.mapping.as_ptr())
            .field("len", &self.mapping.len())
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("path", &self.path)
            .finish()
    }
}

impl HugepageRegion {
    /// Allocates a new region of `len` bytes, which must be a multiple of the
    /// configured hugepage size.
    pub fn allocate(len: usize, config: &HostMemConfig) -> Result<Self, HostMemError> {
        if len == 0 || len % config.hugepage_size != 0 {
            return Err(HostMemError::InvalidArgument(
                "size must be a non-zero multiple of the hugepage size",
            ));
        }

        let (file, path, unlink_on_drop) = match config.backend {
            HugepageBackend::Memfd => {
                let flags = config.memfd_flags()?;
                // SAFETY: the name is a valid NUL-terminated string.
                let fd = unsafe { libc::memfd_create(c"hostmem".as_ptr(), flags) };
                if fd < 0 {
                    return Err(HostMemError::last_os_error("create hugepage memfd"));
                }
                // SAFETY: fd was just returned by memfd_create and is owned by
                // nothing else.
                let file = unsafe { File::from_raw_fd(fd) };
                let path = PathBuf::from(format!("/proc/{}/fd/{}", std::process::id(), fd));
                (file, path, false)
            }
            HugepageBackend::Hugetlbfs => {
                let path = config.hugetlb_path.join(format!(
                    "hostmem-{}-{}",
                    std::process::id(),
                    HUGETLBFS_COUNT.fetch_add(1, Ordering::Relaxed)
                ));
                let file = fs_err::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .mode(0o600)
                    .open(&path)
                    .map_err(|source| HostMemError::Os {
                        op: "create hugetlbfs file",
                        source,
                    })?;
                (file.into_parts().0, path, true)
            }
        };

        let result = Self::map_new(file, path.clone(), len, config, unlink_on_drop);
        if result.is_err() && unlink_on_drop {
            let _ = fs_err::remove_file(&path);
        }
        result
    }

    fn map_new(
        file: File,
        path: PathBuf,
        len: usize,
        config: &HostMemConfig,
        unlink_on_drop: bool,
    ) -> Result<Self, HostMemError> {
        file.set_len(len as u64)
            .map_err(|source| HostMemError::Os {
                op: "size hugepage file",
                source,
            })?;
        let mapping = Mapping::shared(&file, len).map_err(|source| HostMemError::Os {
            op: "map hugepages",
            source,
        })?;
        mapping.lock().map_err(|source| HostMemError::Os {
            op: "lock hugepages",
            source,
        })?;
        mapping.touch_write(config.page_size);
        let phys = virt_to_phys(mapping.as_ptr() as usize, config.page_size)?;

        let region = Self {
            mapping,
            _file: file,
            path,
            phys,
            hugepage_size: config.hugepage_size,
            page_size: config.page_size,
            unlink_on_drop,
        };
        tracing::debug!(?region, "allocated hugepage region");
        Ok(region)
    }

    /// Maps a region previously allocated by this or another process.
    ///
    /// The size is taken from the backing file. The region is not zeroed.
    pub fn import(path: impl AsRef<Path>, config: &HostMemConfig) -> Result<Self, HostMemError> {
        let path = path.as_ref();
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| HostMemError::Os {
                op: "open shared hugepages",
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| HostMemError::Os {
                op: "stat shared hugepages",
                source,
            })?
            .len() as usize;
        if len == 0 || len % config.hugepage_size != 0 {
            return Err(HostMemError::InvalidArgument(
                "imported size must be a non-zero multiple of the hugepage size",
            ));
        }
        let file = file.into_parts().0;
        let mapping = Mapping::shared(&file, len).map_err(|source| HostMemError::Os {
            op: "map shared hugepages",
            source,
        })?;
        mapping.touch_read(config.page_size);
        let phys = virt_to_phys(mapping.as_ptr() as usize, config.page_size)?;

        let region = Self {
            mapping,
            _file: file,
            path: path.to_owned(),
            phys,
            hugepage_size: config.hugepage_size,
            page_size: config.page_size,
            unlink_on_drop: false,
        };
        tracing::debug!(?region, "imported hugepage region");
        Ok(region)
    }
}

impl Drop for HugepageRegion {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            if let Err(err) = fs_err::remove_file(&self.path) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to remove hugetlbfs file"
                );
            }
        }
    }
}

// SAFETY: The stored mapping is valid for the lifetime of the region. It is
// locked at allocation and only unmapped on drop.
unsafe impl MappedDmaTarget for HugepageRegion {
    fn base(&self) -> *const u8 {
        self.mapping.as_ptr()
    }

    fn len(&self) -> usize {
        self.mapping.len()
    }

    fn hugepage_size(&self) -> usize {
        self.hugepage_size
    }

    fn phys(&self) -> u64 {
        self.phys
    }

    fn resolve_phys(&self, offset: usize) -> Result<u64, HostMemError> {
        if offset >= self.mapping.len() {
            return Err(HostMemError::InvalidArgument("offset outside region"));
        }
        virt_to_phys(self.mapping.as_ptr() as usize + offset, self.page_size)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
