//! FdEvent: satu file descriptor + callback readiness
//!
//! FdEvent hanya mendeskripsikan interest; yang meng-arm ke multiplexer adalah
//! `EventLoop::add_event`. Listen ulang untuk interest yang sama mengganti
//! callback lama, tidak menambah duplikat.

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use mio::Interest;

/// Callback readiness, dijalankan di thread loop pemilik
pub type Callback = Rc<dyn Fn()>;

/// Jenis readiness yang bisa di-listen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdInterest {
    Readable,
    Writable,
}

pub struct FdEvent {
    fd: RawFd,
    on_read: Option<Callback>,
    on_write: Option<Callback>,
    non_blocking: bool,
}

impl FdEvent {
    /// Bungkus fd dan set O_NONBLOCK
    pub fn new(fd: RawFd) -> io::Result<Self> {
        set_non_blocking(fd)?;
        Ok(Self {
            fd,
            on_read: None,
            on_write: None,
            non_blocking: true,
        })
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    /// Register atau ganti callback untuk satu interest
    pub fn listen<F>(&mut self, interest: FdInterest, callback: F)
    where
        F: Fn() + 'static,
    {
        let callback: Callback = Rc::new(callback);
        match interest {
            FdInterest::Readable => self.on_read = Some(callback),
            FdInterest::Writable => self.on_write = Some(callback),
        }
    }

    /// Hapus callback untuk satu interest
    pub fn cancel(&mut self, interest: FdInterest) {
        match interest {
            FdInterest::Readable => self.on_read = None,
            FdInterest::Writable => self.on_write = None,
        }
    }

    pub fn is_listening(&self, interest: FdInterest) -> bool {
        match interest {
            FdInterest::Readable => self.on_read.is_some(),
            FdInterest::Writable => self.on_write.is_some(),
        }
    }

    /// Interest set saat ini; `None` kalau tidak ada yang di-listen
    pub fn interest(&self) -> Option<Interest> {
        match (self.on_read.is_some(), self.on_write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn read_callback(&self) -> Option<Callback> {
        self.on_read.clone()
    }

    pub(crate) fn write_callback(&self) -> Option<Callback> {
        self.on_write.clone()
    }
}

impl std::fmt::Debug for FdEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdEvent")
            .field("fd", &self.fd)
            .field("readable", &self.on_read.is_some())
            .field("writable", &self.on_write.is_some())
            .field("non_blocking", &self.non_blocking)
            .finish()
    }
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl pada fd milik caller, tidak menyentuh memory Rust
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
