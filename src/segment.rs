//! POSIX shared-memory segments and their mappings.
//!
//! A `Segment` is the file-descriptor side of a shared region: either a
//! named POSIX shm object other processes can open by name, or an anonymous
//! memfd for single-process and fork-style use. A `Mapping` is one `mmap` of
//! a segment into this address space, unmapped on drop.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

fn page_aligned(len: usize) -> usize {
    let page = page_size::get();
    // round up to nearest page
    ((len - 1) & !(page - 1)) + page
}

// POSIX shm names are one path component with a leading slash.
fn shm_name(name: &str) -> io::Result<CString> {
    let mut full = String::with_capacity(name.len() + 1);
    if !name.starts_with('/') {
        full.push('/');
    }
    full.push_str(name);
    CString::new(full)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment name contains NUL"))
}

#[derive(Debug)]
struct SegmentName {
    name: CString,
}

impl Drop for SegmentName {
    fn drop(&mut self) {
        let _ = shm_unlink(self.name.as_c_str());
    }
}

/// A shared-memory segment of fixed, page-aligned length.
///
/// The creator of a named segment owns the name and unlinks it when
/// dropped; processes that merely opened the name do not. Existing mappings
/// survive the unlink, so attached processes keep working after the creator
/// exits.
#[derive(Debug)]
pub(crate) struct Segment {
    fd: OwnedFd,
    len: usize,
    name: Option<SegmentName>,
}

impl Segment {
    /// Anonymous segment backed by a memfd. Visible only through this
    /// handle (and any process that inherits it).
    pub(crate) fn create_anon(len: usize) -> io::Result<Segment> {
        let len = page_aligned(len);
        let mfd = memfd::MemfdOptions::default()
            .create("shm-hashmap")
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let file = mfd.into_file();
        ftruncate(&file, len as libc::off_t)?;
        Ok(Segment {
            fd: file.into(),
            len,
            name: None,
        })
    }

    /// Creates a named segment, failing with `AlreadyExists` if the name is
    /// taken.
    pub(crate) fn create_named(name: &str, len: usize) -> io::Result<Segment> {
        let len = page_aligned(len);
        let cname = shm_name(name)?;
        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        if let Err(e) = ftruncate(&fd, len as libc::off_t) {
            let _ = shm_unlink(cname.as_c_str());
            return Err(e.into());
        }
        Ok(Segment {
            fd,
            len,
            name: Some(SegmentName { name: cname }),
        })
    }

    /// Opens an existing named segment; its length is whatever the creator
    /// sized it to.
    pub(crate) fn open_named(name: &str) -> io::Result<Segment> {
        let cname = shm_name(name)?;
        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty())?;
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        Ok(Segment {
            fd: file.into(),
            len,
            name: None,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn map(&self) -> io::Result<Mapping> {
        let len = NonZeroUsize::new(self.len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty segment"))?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.fd,
                0,
            )?
        };
        Ok(Mapping {
            ptr,
            len: self.len,
        })
    }
}

/// One shared mapping of a segment, valid for the mapping's lifetime.
pub(crate) struct Mapping {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl Mapping {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

// SAFETY: the mapping itself is an address range; what is stored there is
// shared with other processes regardless of which thread holds the handle.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[cfg(test)]
mod tests {
    use super::Segment;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn uniq(tag: &str) -> String {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "shm-hashmap-seg-{tag}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Invariant: two mappings of one segment see each other's writes.
    #[test]
    fn anon_segment_shared_between_mappings() {
        let seg = Segment::create_anon(64).unwrap();
        assert!(seg.len() >= 64);
        let a = seg.map().unwrap();
        let b = seg.map().unwrap();
        unsafe {
            a.as_ptr().write(0xa5);
            a.as_ptr().add(1).write(0x5a);
        }
        unsafe {
            assert_eq!(b.as_ptr().read(), 0xa5);
            assert_eq!(b.as_ptr().add(1).read(), 0x5a);
        }
    }

    /// Invariant: a named segment is reachable by name until its creator is
    /// dropped, and creation refuses to reuse a live name.
    #[test]
    fn named_segment_lifecycle() {
        let name = uniq("lifecycle");
        let creator = Segment::create_named(&name, 128).unwrap();

        let err = Segment::create_named(&name, 128).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);

        let opened = Segment::open_named(&name).unwrap();
        assert_eq!(opened.len(), creator.len());

        let w = creator.map().unwrap();
        let r = opened.map().unwrap();
        unsafe {
            w.as_ptr().write(7);
            assert_eq!(r.as_ptr().read(), 7);
        }

        drop(creator);
        assert!(Segment::open_named(&name).is_err());
        // the surviving mapping still reads the shared bytes
        unsafe {
            assert_eq!(r.as_ptr().read(), 7);
        }
    }

    #[test]
    fn name_with_nul_is_rejected() {
        assert!(Segment::open_named("bad\0name").is_err());
    }
}
