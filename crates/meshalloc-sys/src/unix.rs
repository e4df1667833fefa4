use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;

use crate::{
  prim::is_page_aligned,
  span::{
    Orphan,
    Span,
  },
  system::{
    SysError,
    SysResult,
    System,
  },
};

/// Hard cap on the backing file; shm objects on macOS cannot grow once sized.
#[cfg(target_os = "macos")]
const FIXED_BACKING_SIZE: usize = 1 << 34;

/// Free ranges of the backing file, sorted by offset and never adjacent.
struct FileState {
  end: usize,
  holes: Vec<(usize, usize)>,
}

impl FileState {
  const fn new() -> Self {
    Self {
      end: 0,
      holes: Vec::new(),
    }
  }

  fn take_hole(&mut self, size: usize) -> Option<usize> {
    let idx = self.holes.iter().position(|&(_, len)| len >= size)?;
    let (offset, len) = self.holes[idx];
    if len == size {
      self.holes.remove(idx);
    } else {
      self.holes[idx] = (offset + size, len - size);
    }
    Some(offset)
  }

  fn give_hole(&mut self, offset: usize, len: usize) {
    let idx = self.holes.partition_point(|&(start, _)| start < offset);

    let joins_prev = idx > 0 && {
      let (start, prev_len) = self.holes[idx - 1];
      start + prev_len == offset
    };
    let joins_next = self
      .holes
      .get(idx)
      .is_some_and(|&(start, _)| offset + len == start);

    match (joins_prev, joins_next) {
      (true, true) => {
        let (_, next_len) = self.holes.remove(idx);
        self.holes[idx - 1].1 += len + next_len;
      }
      (true, false) => self.holes[idx - 1].1 += len,
      (false, true) => {
        let next = &mut self.holes[idx];
        *next = (offset, len + next.1);
      }
      (false, false) => self.holes.insert(idx, (offset, len)),
    }
  }
}

/// Spans are `MAP_SHARED` views of one anonymous memory file (memfd on
/// Linux, an unlinked shm object on macOS). Aliasing remaps a span onto a
/// different file offset with `MAP_FIXED`.
pub struct UnixSystem {
  fd: libc::c_int,
  backing: Mutex<FileState>,
}

fn errno() -> i32 {
  #[cfg(target_os = "linux")]
  let err = unsafe { *libc::__errno_location() };
  #[cfg(target_os = "macos")]
  let err = unsafe { *libc::__error() };
  err
}

impl UnixSystem {
  pub fn new() -> SysResult<Self> {
    let fd = Self::open()?;
    Ok(Self {
      fd,
      backing: Mutex::new(FileState::new()),
    })
  }

  #[cfg(target_os = "linux")]
  fn open() -> SysResult<libc::c_int> {
    let fd = unsafe { libc::memfd_create(c"meshalloc".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
      return Err(SysError::Os(errno()));
    }
    Ok(fd)
  }

  #[cfg(target_os = "macos")]
  fn open() -> SysResult<libc::c_int> {
    use core::sync::atomic::{
      AtomicUsize,
      Ordering,
    };

    static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let pid = unsafe { libc::getpid() };
    let name = alloc::format!("/meshalloc.{pid}.{seq}\0");
    let name_ptr = name.as_ptr() as *const libc::c_char;

    let fd = unsafe {
      libc::shm_open(
        name_ptr,
        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
        0o600 as libc::c_uint,
      )
    };
    if fd < 0 {
      return Err(SysError::Os(errno()));
    }
    unsafe { libc::shm_unlink(name_ptr) };

    if unsafe { libc::ftruncate(fd, FIXED_BACKING_SIZE as libc::off_t) } != 0 {
      let err = errno();
      unsafe { libc::close(fd) };
      return Err(SysError::Os(err));
    }
    Ok(fd)
  }

  #[cfg(target_os = "linux")]
  fn grow(&self, end: usize) -> SysResult<()> {
    if unsafe { libc::ftruncate(self.fd, end as libc::off_t) } != 0 {
      return Err(SysError::OutOfMemory);
    }
    Ok(())
  }

  #[cfg(target_os = "macos")]
  fn grow(&self, end: usize) -> SysResult<()> {
    if end > FIXED_BACKING_SIZE {
      return Err(SysError::OutOfMemory);
    }
    Ok(())
  }

  fn reserve(&self, size: usize) -> SysResult<usize> {
    let mut backing = self.backing.lock();
    if let Some(offset) = backing.take_hole(size) {
      return Ok(offset);
    }

    let offset = backing.end;
    let end = offset.checked_add(size).ok_or(SysError::OutOfMemory)?;
    self.grow(end)?;
    backing.end = end;
    Ok(offset)
  }

  fn release(&self, offset: usize, len: usize) {
    #[cfg(target_os = "linux")]
    {
      let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
      let ret =
        unsafe { libc::fallocate(self.fd, mode, offset as libc::off_t, len as libc::off_t) };
      if ret != 0 {
        tracing::warn!(offset, len, errno = errno(), "failed to punch backing hole");
      }
    }

    self.backing.lock().give_hole(offset, len);
  }

  const fn prot() -> i32 {
    libc::PROT_READ | libc::PROT_WRITE
  }

  const fn as_c(ptr: *mut u8) -> *mut libc::c_void {
    ptr as *mut libc::c_void
  }
}

unsafe impl System for UnixSystem {
  fn alloc(&self, size: usize) -> SysResult<Span> {
    if size == 0 || is_page_aligned(size) != Ok(true) {
      return Err(SysError::InvalidArgument);
    }

    let offset = self.reserve(size)?;
    let ptr = unsafe {
      libc::mmap(
        core::ptr::null_mut(),
        size,
        Self::prot(),
        libc::MAP_SHARED,
        self.fd,
        offset as libc::off_t,
      )
    };

    if ptr == libc::MAP_FAILED {
      self.release(offset, size);
      return Err(SysError::OutOfMemory);
    }

    let ptr = NonNull::new(ptr as *mut u8).ok_or(SysError::OutOfMemory)?;
    Ok(unsafe { Span::from_raw(ptr, size, offset) })
  }

  unsafe fn alias(&self, target: &mut Span, source: &Span) -> SysResult<Option<Orphan>> {
    if target.len() != source.len() {
      return Err(SysError::InvalidArgument);
    }
    if target.offset() == source.offset() {
      return Ok(None);
    }

    let ptr = unsafe {
      libc::mmap(
        Self::as_c(target.as_ptr()),
        target.len(),
        Self::prot(),
        libc::MAP_SHARED | libc::MAP_FIXED,
        self.fd,
        source.offset() as libc::off_t,
      )
    };
    if ptr != Self::as_c(target.as_ptr()) {
      return Err(SysError::Os(errno()));
    }

    let orphan = (!target.is_shared()).then(|| Orphan {
      offset: target.offset(),
      len: target.len(),
    });
    target.rebind(source.offset());
    Ok(orphan)
  }

  fn discard(&self, orphan: Orphan) {
    self.release(orphan.offset, orphan.len);
  }

  unsafe fn dealloc(&self, span: Span) -> SysResult<()> {
    let result = unsafe { libc::munmap(Self::as_c(span.as_ptr()), span.len()) };
    if result != 0 {
      return Err(SysError::Os(errno()));
    }

    if !span.is_shared() {
      self.release(span.offset(), span.len());
    }
    Ok(())
  }
}

impl Drop for UnixSystem {
  fn drop(&mut self) {
    unsafe { libc::close(self.fd) };
  }
}
