//! Guest memory management.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{Error, Result};

/// A contiguous region of guest physical memory.
///
/// Backed by an anonymous shared host mapping so KVM can use it directly as
/// the guest's RAM. The same type backs the page-table region in long mode.
/// Anonymous mappings are zero-initialized, which is what gives the guest
/// zeroed memory beyond the loaded image.
pub struct GuestMemory {
    /// Pointer to the mapped region
    ptr: *mut u8,
    /// Size of the mapping in bytes
    size: usize,
}

// Safety: GuestMemory owns its mapping exclusively for its whole lifetime.
unsafe impl Send for GuestMemory {}

impl GuestMemory {
    /// Map a new region of `size` bytes.
    ///
    /// The caller is responsible for page-aligning `size`; mmap itself
    /// rejects zero.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryAllocation {
                size,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocation {
                size,
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Get the host address of the mapping, for slot registration.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Get the size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get a slice view of the region.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// Get a mutable slice view of the region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Load a flat binary image from `path` at offset 0.
    ///
    /// Reads until the file ends or the region is full, whichever comes
    /// first; an image smaller than memory is the normal case. Returns the
    /// number of bytes loaded.
    pub fn load_image(&mut self, path: &Path) -> Result<usize> {
        let mut file = File::open(path).map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?;
        self.fill_from(&mut file).map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
    }

    fn fill_from(&mut self, reader: &mut impl Read) -> io::Result<usize> {
        let buf = self.as_mut_slice();
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_mapping_has_exact_size() {
        let mem = GuestMemory::new(1024 * 1024).unwrap();
        assert_eq!(mem.size(), 1024 * 1024);
        assert!(!mem.as_ptr().is_null());
    }

    #[test]
    fn test_mapping_is_zeroed() {
        let mem = GuestMemory::new(8192).unwrap();
        assert!(mem.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(GuestMemory::new(0).is_err());
    }

    #[test]
    fn test_fill_places_image_at_zero() {
        let mut mem = GuestMemory::new(8192).unwrap();
        let image = b"\xBA\xF8\x03\xEC\xEE\xEB\xFC";
        let n = mem.fill_from(&mut Cursor::new(image)).unwrap();

        assert_eq!(n, image.len());
        assert_eq!(&mem.as_slice()[..image.len()], image);
        // Everything past the image stays zero.
        assert!(mem.as_slice()[image.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_truncates_oversized_image() {
        let mut mem = GuestMemory::new(4096).unwrap();
        let image = vec![0xAA; 6000];
        let n = mem.fill_from(&mut Cursor::new(image)).unwrap();

        assert_eq!(n, 4096);
        assert!(mem.as_slice().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_load_image_missing_file() {
        let mut mem = GuestMemory::new(4096).unwrap();
        let err = mem.load_image(Path::new("/nonexistent/guest.img"));
        assert!(matches!(err, Err(Error::ImageLoad { .. })));
    }
}
