//! TcpConnection: state machine per socket
//!
//! ```text
//! NotConnected -> Connected -> HalfClosing -> Closed
//!        \____________\_____________________/^
//! ```
//!
//! Semua method dipanggil dari thread loop pemilik. Callback readiness hanya
//! memegang `Weak`, jadi connection hidup selama pemiliknya (worker atau
//! client) masih memegang `Rc`.
//!
//! Aturan borrow: tidak ada `RefCell` yang masih di-borrow saat continuation
//! user dijalankan, karena continuation boleh memanggil balik connection ini.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use super::net_addr::NetAddress;
use crate::core::{EventLoop, FdEvent, FdInterest, TcpBuffer};
use crate::error::Result;
use crate::protocol::{Codec, ErrorCode, TinyPbCodec, TinyPbFrame};

/// Batas byte per read burst. Sisa data dibaca di iterasi loop berikutnya
/// supaya satu peer tidak memonopoli worker.
pub const READ_BURST_BYTES: usize = 256 * 1024;

/// Continuation untuk read/write. Dipanggil tepat sekali.
pub type Continuation = Box<dyn FnOnce(TinyPbFrame)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    NotConnected,
    Connected,
    HalfClosing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Dibuat `TcpClient`
    Client,
    /// Hasil accept `TcpServer`
    Server,
}

/// Layer RPC di atas transport. Dipanggil sinkron di thread worker connection.
///
/// Implementasi wajib mengisi `response` (payload atau error) sebelum return;
/// `msg_id` dan `method_name` response sudah disalin dari request.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: &TinyPbFrame, response: &mut TinyPbFrame, connection: &TcpConnection);
}

pub struct TcpConnection {
    event_loop: EventLoop,
    stream: TcpStream,
    fd: RawFd,
    peer_addr: NetAddress,
    local_addr: Cell<Option<NetAddress>>,
    in_buffer: RefCell<TcpBuffer>,
    out_buffer: RefCell<TcpBuffer>,
    codec: TinyPbCodec,
    state: Cell<TcpState>,
    role: ConnectionRole,
    fd_event: RefCell<FdEvent>,
    read_dones: RefCell<HashMap<String, Continuation>>,
    // Belum di-encode
    write_dones: RefCell<VecDeque<(TinyPbFrame, Continuation)>>,
    // Sudah di-encode, menunggu out buffer flush penuh
    flush_dones: RefCell<VecDeque<(TinyPbFrame, Continuation)>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    last_active: Cell<Instant>,
    close_hook: RefCell<Option<Box<dyn FnOnce()>>>,
    self_ref: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Bungkus socket non-blocking. Role `Server` langsung `Connected`
    /// (socket hasil accept), role `Client` mulai dari `NotConnected`.
    pub fn new(
        event_loop: &EventLoop,
        stream: TcpStream,
        peer_addr: NetAddress,
        role: ConnectionRole,
        buffer_size: usize,
        codec: TinyPbCodec,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Rc<Self>> {
        let fd = stream.as_raw_fd();
        let fd_event = FdEvent::new(fd)?;

        let (state, local_addr) = match role {
            ConnectionRole::Server => (
                TcpState::Connected,
                stream.local_addr().ok().map(NetAddress::from),
            ),
            ConnectionRole::Client => (TcpState::NotConnected, None),
        };

        Ok(Rc::new_cyclic(|self_ref| Self {
            event_loop: event_loop.clone(),
            stream,
            fd,
            peer_addr,
            local_addr: Cell::new(local_addr),
            in_buffer: RefCell::new(TcpBuffer::new(buffer_size)),
            out_buffer: RefCell::new(TcpBuffer::new(buffer_size)),
            codec,
            state: Cell::new(state),
            role,
            fd_event: RefCell::new(fd_event),
            read_dones: RefCell::new(HashMap::new()),
            write_dones: RefCell::new(VecDeque::new()),
            flush_dones: RefCell::new(VecDeque::new()),
            dispatcher,
            last_active: Cell::new(Instant::now()),
            close_hook: RefCell::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn state(&self) -> TcpState {
        self.state.get()
    }

    #[inline(always)]
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn peer_addr(&self) -> NetAddress {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<NetAddress> {
        self.local_addr.get()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Waktu terakhir ada I/O di connection ini
    pub fn last_active(&self) -> Instant {
        self.last_active.get()
    }

    pub fn pending_reads(&self) -> usize {
        self.read_dones.borrow().len()
    }

    pub fn pending_writes(&self) -> usize {
        self.write_dones.borrow().len() + self.flush_dones.borrow().len()
    }

    /// Byte di in buffer yang belum membentuk record lengkap
    pub fn unread_bytes(&self) -> usize {
        self.in_buffer.borrow().readable_bytes()
    }

    /// Byte yang sudah di-encode tapi belum tertulis ke socket
    pub fn unsent_bytes(&self) -> usize {
        self.out_buffer.borrow().readable_bytes()
    }

    /// Dipanggil sekali saat connection masuk `Closed`, setelah semua
    /// continuation pending digagalkan
    pub fn set_close_hook<F>(&self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        *self.close_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Connect selesai (client): resolve local address dan masuk `Connected`
    pub(crate) fn mark_connected(&self) {
        if self.state.get() != TcpState::NotConnected {
            return;
        }
        self.local_addr
            .set(self.stream.local_addr().ok().map(NetAddress::from));
        self.state.set(TcpState::Connected);
        self.touch();
    }

    /// Arm read-readiness
    pub fn listen_read(&self) -> io::Result<()> {
        let weak = self.self_ref.clone();
        self.arm(FdInterest::Readable, move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_read();
            }
        })
    }

    /// Arm write-readiness
    pub fn listen_write(&self) -> io::Result<()> {
        let weak = self.self_ref.clone();
        self.arm(FdInterest::Writable, move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_write();
            }
        })
    }

    /// Arm write-readiness dengan callback khusus (cek hasil connect di client)
    pub(crate) fn listen_write_with<F>(&self, callback: F) -> io::Result<()>
    where
        F: Fn() + 'static,
    {
        self.arm(FdInterest::Writable, callback)
    }

    /// Disarm write-readiness. Kalau tidak ada interest tersisa, fd dilepas
    /// dari multiplexer.
    pub fn cancel_write(&self) -> io::Result<()> {
        let mut fd_event = self.fd_event.borrow_mut();
        if !fd_event.is_listening(FdInterest::Writable) {
            return Ok(());
        }
        fd_event.cancel(FdInterest::Writable);
        self.event_loop.add_event(&fd_event)
    }

    fn arm<F>(&self, interest: FdInterest, callback: F) -> io::Result<()>
    where
        F: Fn() + 'static,
    {
        if self.state.get() == TcpState::Closed {
            return Ok(());
        }
        let mut fd_event = self.fd_event.borrow_mut();
        fd_event.listen(interest, callback);
        self.event_loop.add_event(&fd_event)
    }

    /// Antrikan frame untuk dikirim. `on_sent` dipanggil setelah out buffer
    /// flush penuh, atau dengan frame error kalau connection ditutup duluan.
    pub fn push_send_message<F>(&self, frame: TinyPbFrame, on_sent: F)
    where
        F: FnOnce(TinyPbFrame) + 'static,
    {
        if self.state.get() == TcpState::Closed {
            let msg_id = frame.msg_id.clone();
            on_sent(TinyPbFrame::error(
                msg_id,
                ErrorCode::PeerClosed,
                "connection already closed",
            ));
            return;
        }
        self.write_dones
            .borrow_mut()
            .push_back((frame, Box::new(on_sent)));
    }

    /// Daftarkan continuation untuk reply dengan `msg_id`. Registrasi kedua
    /// untuk id yang sama menggantikan yang pertama.
    pub fn push_read_message<F>(&self, msg_id: impl Into<String>, on_received: F)
    where
        F: FnOnce(TinyPbFrame) + 'static,
    {
        let msg_id = msg_id.into();
        if self.state.get() == TcpState::Closed {
            on_received(TinyPbFrame::error(
                msg_id,
                ErrorCode::PeerClosed,
                "connection already closed",
            ));
            return;
        }
        let replaced = self
            .read_dones
            .borrow_mut()
            .insert(msg_id.clone(), Box::new(on_received));
        if replaced.is_some() {
            debug!(%msg_id, "read continuation replaced");
        }
    }

    /// Gagalkan read continuation yang masih pending. Returns `true` kalau ada.
    pub fn fail_pending_read(&self, msg_id: &str, code: ErrorCode, info: impl Into<String>) -> bool {
        let done = self.read_dones.borrow_mut().remove(msg_id);
        match done {
            Some(done) => {
                done(TinyPbFrame::error(msg_id, code, info));
                true
            }
            None => false,
        }
    }

    /// Encode response ke out buffer lalu arm write-readiness
    pub fn reply(&self, frames: &[TinyPbFrame]) {
        if frames.is_empty() || self.state.get() == TcpState::Closed {
            return;
        }

        {
            let mut out = self.out_buffer.borrow_mut();
            for frame in frames {
                if let Err(e) = self.codec.encode_frame(frame, &mut out) {
                    error!(msg_id = %frame.msg_id, error = %e, "failed to encode reply");
                    let fallback =
                        TinyPbFrame::error(frame.msg_id.clone(), e.error_code(), e.to_string());
                    if let Err(e) = self.codec.encode_frame(&fallback, &mut out) {
                        error!(msg_id = %frame.msg_id, error = %e, "failed to encode error reply");
                    }
                }
            }
        }

        if let Err(e) = self.listen_write() {
            error!(peer = %self.peer_addr, error = %e, "failed to arm write");
            self.clear();
        }
    }

    /// Half-close. No-op kecuali `Connected`.
    pub fn shutdown(&self) {
        if self.state.get() != TcpState::Connected {
            return;
        }
        self.state.set(TcpState::HalfClosing);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer_addr, error = %e, "shutdown failed");
        }
        if let Err(e) = self.cancel_write() {
            debug!(peer = %self.peer_addr, error = %e, "cancel write on shutdown failed");
        }
        info!(peer = %self.peer_addr, "connection half-closing");
    }

    /// Tutup connection: lepas dari loop, masuk `Closed`, dan gagalkan semua
    /// continuation yang masih pending. Idempotent.
    pub fn clear(&self) {
        if self.state.get() == TcpState::Closed {
            return;
        }
        self.state.set(TcpState::Closed);

        {
            let mut fd_event = self.fd_event.borrow_mut();
            fd_event.cancel(FdInterest::Readable);
            fd_event.cancel(FdInterest::Writable);
        }
        if let Err(e) = self.event_loop.delete_fd(self.fd) {
            warn!(fd = self.fd, error = %e, "failed to deregister fd");
        }

        let reads: Vec<(String, Continuation)> = self.read_dones.borrow_mut().drain().collect();
        let mut writes: Vec<(TinyPbFrame, Continuation)> =
            self.flush_dones.borrow_mut().drain(..).collect();
        writes.extend(self.write_dones.borrow_mut().drain(..));

        info!(
            peer = %self.peer_addr,
            fd = self.fd,
            pending_reads = reads.len(),
            pending_writes = writes.len(),
            "connection closed"
        );

        for (msg_id, done) in reads {
            done(TinyPbFrame::error(
                msg_id,
                ErrorCode::PeerClosed,
                "connection closed before reply arrived",
            ));
        }
        for (frame, done) in writes {
            done(TinyPbFrame::error(
                frame.msg_id,
                ErrorCode::PeerClosed,
                "connection closed before frame was flushed",
            ));
        }

        let hook = self.close_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    #[inline(always)]
    fn touch(&self) {
        self.last_active.set(Instant::now());
    }

    fn on_read(&self) {
        let state = self.state.get();
        if !matches!(state, TcpState::Connected | TcpState::HalfClosing) {
            debug!(fd = self.fd, ?state, "read event ignored");
            return;
        }
        self.touch();

        // Edge-triggered: baca sampai would-block, EOF, atau budget habis
        let mut peer_closed = false;
        let mut budget = READ_BURST_BYTES;
        {
            let mut buffer = self.in_buffer.borrow_mut();
            while budget > 0 {
                if buffer.writable_bytes() == 0 {
                    let grow = buffer.capacity().max(1);
                    buffer.ensure_writable(grow);
                }
                let window = buffer.writable_bytes().min(budget);
                match (&self.stream).read(&mut buffer.writable_slice_mut()[..window]) {
                    Ok(0) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(n) => {
                        buffer.advance_write(n);
                        budget -= n;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(peer = %self.peer_addr, error = %e, "read failed");
                        peer_closed = true;
                        break;
                    }
                }
            }
            trace!(fd = self.fd, buffered = buffer.readable_bytes(), "read drained");
        }

        // Record yang sudah lengkap tetap diproses sebelum teardown
        self.execute();

        if peer_closed {
            debug!(peer = %self.peer_addr, "peer closed");
            self.clear();
        } else if budget == 0 {
            // Socket belum would-block: edge berikutnya tidak akan datang,
            // lanjutkan sendiri setelah fd lain dapat giliran
            trace!(fd = self.fd, "read budget exhausted, resuming later");
            let weak = self.self_ref.clone();
            self.event_loop.run_after(Duration::ZERO, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.on_read();
                }
            });
        }
    }

    fn execute(&self) {
        let frames = self.codec.decode(&mut self.in_buffer.borrow_mut());
        if frames.is_empty() {
            return;
        }

        match self.role {
            ConnectionRole::Server => {
                let Some(dispatcher) = self.dispatcher.clone() else {
                    warn!(peer = %self.peer_addr, count = frames.len(), "no dispatcher, dropping requests");
                    return;
                };
                let mut replies = Vec::with_capacity(frames.len());
                for request in &frames {
                    let mut response = TinyPbFrame {
                        msg_id: request.msg_id.clone(),
                        method_name: request.method_name.clone(),
                        ..TinyPbFrame::default()
                    };
                    dispatcher.dispatch(request, &mut response, self);
                    replies.push(response);
                }
                self.reply(&replies);
            }
            ConnectionRole::Client => {
                for frame in frames {
                    let done = self.read_dones.borrow_mut().remove(&frame.msg_id);
                    match done {
                        Some(done) => done(frame),
                        None => {
                            debug!(msg_id = %frame.msg_id, "no pending read for reply, dropped")
                        }
                    }
                }
            }
        }
    }

    /// Pindahkan antrian write ke out buffer (sekali encode per frame)
    fn encode_pending(&self) {
        let queued: Vec<(TinyPbFrame, Continuation)> =
            self.write_dones.borrow_mut().drain(..).collect();
        if queued.is_empty() {
            return;
        }

        let mut failed = Vec::new();
        {
            let mut out = self.out_buffer.borrow_mut();
            let mut flushing = self.flush_dones.borrow_mut();
            for (frame, done) in queued {
                match self.codec.encode_frame(&frame, &mut out) {
                    Ok(_) => flushing.push_back((frame, done)),
                    Err(e) => {
                        warn!(msg_id = %frame.msg_id, error = %e, "failed to encode request");
                        let reply =
                            TinyPbFrame::error(frame.msg_id.clone(), e.error_code(), e.to_string());
                        failed.push((reply, done));
                    }
                }
            }
        }

        for (reply, done) in failed {
            done(reply);
        }
    }

    fn on_write(&self) {
        match self.state.get() {
            TcpState::Connected => {}
            TcpState::Closed => return,
            state => {
                debug!(fd = self.fd, ?state, "write event ignored");
                if let Err(e) = self.cancel_write() {
                    debug!(fd = self.fd, error = %e, "cancel write failed");
                }
                return;
            }
        }
        self.touch();

        if self.role == ConnectionRole::Client {
            self.encode_pending();
        }

        let mut fatal = false;
        let flushed = {
            let mut out = self.out_buffer.borrow_mut();
            loop {
                if out.readable_bytes() == 0 {
                    break true;
                }
                match (&self.stream).write(out.readable_slice()) {
                    Ok(0) => {
                        fatal = true;
                        break false;
                    }
                    Ok(n) => out.advance_read(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(peer = %self.peer_addr, error = %e, "write failed");
                        fatal = true;
                        break false;
                    }
                }
            }
        };

        if fatal {
            self.clear();
            return;
        }
        if !flushed {
            trace!(fd = self.fd, "socket would block, write stays armed");
            return;
        }

        if let Err(e) = self.cancel_write() {
            warn!(fd = self.fd, error = %e, "failed to disarm write");
        }

        let sent: Vec<(TinyPbFrame, Continuation)> =
            self.flush_dones.borrow_mut().drain(..).collect();
        for (frame, done) in sent {
            done(frame);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.fd)
            .field("peer", &self.peer_addr)
            .field("state", &self.state.get())
            .field("role", &self.role)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Pasangan socket loopback: (mio stream sisi server, std stream sisi peer)
    fn socket_pair() -> (TcpStream, NetAddress, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (TcpStream::from_std(accepted), NetAddress::from(addr), peer)
    }

    #[test]
    fn test_clear_twice_is_idempotent() {
        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let (stream, addr, _peer) = socket_pair();
            let conn = TcpConnection::new(
                &event_loop,
                stream,
                addr,
                ConnectionRole::Client,
                64,
                TinyPbCodec::default(),
                None,
            )
            .unwrap();
            conn.mark_connected();
            conn.listen_read().unwrap();
            assert!(event_loop.is_registered(conn.fd()));

            let failed = Rc::new(Cell::new(0));
            let f = failed.clone();
            conn.push_read_message("1", move |frame| {
                assert_eq!(frame.error_code(), Some(ErrorCode::PeerClosed));
                f.set(f.get() + 1);
            });

            conn.clear();
            conn.clear();
            assert_eq!(conn.state(), TcpState::Closed);
            assert!(!event_loop.is_registered(conn.fd()));
            assert_eq!(failed.get(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_shutdown_from_not_connected_is_noop() {
        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let (stream, addr, _peer) = socket_pair();
            let conn = TcpConnection::new(
                &event_loop,
                stream,
                addr,
                ConnectionRole::Client,
                64,
                TinyPbCodec::default(),
                None,
            )
            .unwrap();

            conn.shutdown();
            assert_eq!(conn.state(), TcpState::NotConnected);

            conn.mark_connected();
            conn.shutdown();
            assert_eq!(conn.state(), TcpState::HalfClosing);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_second_read_registration_replaces_first() {
        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let (stream, addr, _peer) = socket_pair();
            let conn = TcpConnection::new(
                &event_loop,
                stream,
                addr,
                ConnectionRole::Client,
                64,
                TinyPbCodec::default(),
                None,
            )
            .unwrap();

            let hits = Rc::new(RefCell::new(Vec::new()));
            let h = hits.clone();
            conn.push_read_message("7", move |_| h.borrow_mut().push("first"));
            let h = hits.clone();
            conn.push_read_message("7", move |_| h.borrow_mut().push("second"));
            assert_eq!(conn.pending_reads(), 1);

            assert!(conn.fail_pending_read("7", ErrorCode::RpcCallTimeout, "timeout"));
            assert!(!conn.fail_pending_read("7", ErrorCode::RpcCallTimeout, "timeout"));
            assert_eq!(*hits.borrow(), vec!["second"]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_client_write_then_read_over_loop() {
        use std::io::{Read as _, Write as _};

        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let (stream, addr, mut peer) = socket_pair();
            let conn = TcpConnection::new(
                &event_loop,
                stream,
                addr,
                ConnectionRole::Client,
                16,
                TinyPbCodec::default(),
                None,
            )
            .unwrap();
            conn.mark_connected();

            let events = Rc::new(RefCell::new(Vec::new()));
            let e = events.clone();
            conn.push_send_message(TinyPbFrame::new("1", "Echo.echo", b"ping".to_vec()), move |f| {
                e.borrow_mut().push(format!("sent {}", f.msg_id));
            });
            let e = events.clone();
            let lp = event_loop.clone();
            conn.push_read_message("1", move |f| {
                e.borrow_mut()
                    .push(format!("recv {}", String::from_utf8_lossy(&f.pb_data)));
                lp.stop();
            });
            conn.listen_write().unwrap();
            conn.listen_read().unwrap();

            // Peer di thread lain: baca request, kirim reply
            let codec = TinyPbCodec::default();
            let echo = thread::spawn(move || {
                let mut buf = TcpBuffer::new(64);
                let mut chunk = [0u8; 256];
                let request = loop {
                    let n = peer.read(&mut chunk).unwrap();
                    buf.append(&chunk[..n]);
                    if let Some(frame) = codec.decode(&mut buf).pop() {
                        break frame;
                    }
                };
                let mut out = TcpBuffer::new(64);
                codec
                    .encode_frame(&TinyPbFrame::new(request.msg_id, "", b"pong".to_vec()), &mut out)
                    .unwrap();
                peer.write_all(out.readable_slice()).unwrap();
                peer
            });

            event_loop.run().unwrap();
            let _peer = echo.join().unwrap();
            assert_eq!(*events.borrow(), vec!["sent 1", "recv pong"]);
            assert_eq!(conn.pending_writes(), 0);
        })
        .join()
        .unwrap();
    }
    #[test]
    fn test_large_write_stays_armed_until_flushed() {
        use std::io::Read as _;

        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let (stream, addr, peer) = socket_pair();
            let conn = TcpConnection::new(
                &event_loop,
                stream,
                addr,
                ConnectionRole::Client,
                128,
                TinyPbCodec::default(),
                None,
            )
            .unwrap();
            conn.mark_connected();

            let payload: Vec<u8> = (0..12 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
            let request = TinyPbFrame::new("big", "Echo.echo", payload.clone());
            let total = request.encoded_len();

            let sent = Rc::new(Cell::new(0));
            let s = sent.clone();
            let weak = Rc::downgrade(&conn);
            let lp = event_loop.clone();
            conn.push_send_message(request, move |frame| {
                assert!(frame.is_ok());
                if let Some(conn) = weak.upgrade() {
                    assert_eq!(conn.unsent_bytes(), 0);
                }
                s.set(s.get() + 1);
                lp.stop();
            });
            conn.listen_write().unwrap();

            // Peer belum membaca: flush berhenti di would-block, write tetap armed
            let checked = Rc::new(Cell::new(false));
            let reader = Rc::new(RefCell::new(None));
            let mut peer = Some(peer);
            let (ch, rd, s, c, lp) = (
                checked.clone(),
                reader.clone(),
                sent.clone(),
                conn.clone(),
                event_loop.clone(),
            );
            event_loop.run_after(Duration::from_millis(200), move || {
                assert_eq!(s.get(), 0);
                assert!(c.unsent_bytes() > 0);
                assert_eq!(c.pending_writes(), 1);
                assert!(lp.is_registered(c.fd()));
                ch.set(true);

                if let Some(mut peer) = peer.take() {
                    *rd.borrow_mut() = Some(thread::spawn(move || {
                        let mut bytes = vec![0u8; total];
                        peer.read_exact(&mut bytes).unwrap();
                        bytes
                    }));
                }
            });

            event_loop.run().unwrap();
            let bytes = reader.borrow_mut().take().unwrap().join().unwrap();

            assert!(checked.get());
            assert_eq!(sent.get(), 1);
            assert_eq!(conn.pending_writes(), 0);

            let mut buf = TcpBuffer::new(128);
            buf.append(&bytes);
            let decoded = TinyPbCodec::default().decode(&mut buf);
            assert_eq!(decoded.len(), 1);
            assert!(decoded[0].pb_data == payload);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_read_burst_is_capped_and_resumed() {
        use std::io::Write as _;

        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let (stream, addr, mut peer) = socket_pair();
            let conn = TcpConnection::new(
                &event_loop,
                stream,
                addr,
                ConnectionRole::Client,
                128,
                TinyPbCodec::default(),
                None,
            )
            .unwrap();
            conn.mark_connected();

            const FRAMES: usize = 4;
            let codec = TinyPbCodec::default();
            let mut out = TcpBuffer::new(128);
            for i in 0..FRAMES {
                let frame = TinyPbFrame::new(i.to_string(), "", vec![b'a' + i as u8; 600 * 1024]);
                codec.encode_frame(&frame, &mut out).unwrap();
            }
            let bytes = out.readable_slice().to_vec();

            let received = Rc::new(RefCell::new(Vec::new()));
            for i in 0..FRAMES {
                let r = received.clone();
                let weak = Rc::downgrade(&conn);
                let lp = event_loop.clone();
                conn.push_read_message(i.to_string(), move |frame| {
                    // Sisa setelah decode hanya berasal dari burst sekarang
                    if let Some(conn) = weak.upgrade() {
                        assert!(conn.unread_bytes() <= READ_BURST_BYTES);
                    }
                    r.borrow_mut().push(frame.msg_id);
                    if r.borrow().len() == FRAMES {
                        lp.stop();
                    }
                });
            }
            conn.listen_read().unwrap();

            let writer = thread::spawn(move || {
                peer.write_all(&bytes).unwrap();
                peer
            });

            event_loop.run().unwrap();
            let _peer = writer.join().unwrap();
            let expected: Vec<String> = (0..FRAMES).map(|i| i.to_string()).collect();
            assert_eq!(*received.borrow(), expected);
            assert_eq!(conn.unread_bytes(), 0);
        })
        .join()
        .unwrap();
    }
}
