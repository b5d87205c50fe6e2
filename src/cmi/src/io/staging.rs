use std::io;
use std::ptr::NonNull;

/// One page-aligned anonymous mapping, sliced into fixed slots by its pool.
pub(crate) struct StagingRegion {
    base: NonNull<u8>,
    len: usize,
}

// The region is plain memory; slot ownership is arbitrated by the pool.
unsafe impl Send for StagingRegion {}
unsafe impl Sync for StagingRegion {}

impl StagingRegion {
    pub(crate) fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty staging region",
            ));
        }
        let page = page_size();
        let len = (len + page - 1) / page * page;
        // SAFETY: anonymous private mapping with no address hint.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(StagingRegion { base, len })
    }

    #[inline]
    pub(crate) fn addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Raw pointer to `len` bytes at `offset`.
    ///
    /// Panics if the window leaves the mapping.
    #[inline]
    pub(crate) fn window(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(offset + len <= self.len, "staging window out of bounds");
        // SAFETY: checked to stay within the mapping above.
        unsafe { self.base.as_ptr().add(offset) }
    }
}

impl Drop for StagingRegion {
    fn drop(&mut self) {
        // SAFETY: base and len come from a successful mmap.
        let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            tracing::error!("munmap staging region: {}", io::Error::last_os_error());
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        4096
    } else {
        ret as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_page_aligned_and_zeroed() {
        let region = StagingRegion::new(10_000).unwrap();
        assert_eq!(region.addr() as usize % page_size(), 0);
        assert!(region.len() >= 10_000);
        let p = region.window(9_000, 16);
        // SAFETY: the window is inside the mapping and not shared.
        let bytes = unsafe { std::slice::from_raw_parts_mut(p, 16) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes.copy_from_slice(&[7; 16]);
    }

    #[test]
    fn empty_region_is_rejected() {
        assert!(StagingRegion::new(0).is_err());
    }
}
