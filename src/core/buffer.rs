//! Growable byte buffer dengan read/write cursor terpisah
//!
//! Layout:
//! ```text
//! ┌──────────────┬────────────────────┬──────────────────┐
//! │ consumed     │ readable           │ writable         │
//! └──────────────┴────────────────────┴──────────────────┘
//! 0         read_index          write_index        capacity
//! ```
//!
//! Invariant: `0 <= read_index <= write_index <= capacity`.
//! Satu buffer dimiliki tepat satu `TcpConnection`, tidak pernah di-share antar thread.

/// Kapasitas minimum agar doubling selalu bertambah
const MIN_CAPACITY: usize = 16;

/// Compaction dilakukan saat bagian yang sudah dikonsumsi melewati 1/3 kapasitas
const COMPACT_RATIO: usize = 3;

#[derive(Debug, Clone)]
pub struct TcpBuffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl TcpBuffer {
    /// Membuat buffer dengan kapasitas awal
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity.max(MIN_CAPACITY)],
            read_index: 0,
            write_index: 0,
        }
    }

    #[inline(always)]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline(always)]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    #[inline(always)]
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    #[inline(always)]
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Data yang belum dibaca (zero-copy)
    #[inline(always)]
    pub fn readable_slice(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Ruang kosong setelah write cursor, untuk `read()` langsung dari socket.
    /// Panggil `advance_write` dengan jumlah byte yang benar-benar terisi.
    #[inline(always)]
    pub fn writable_slice_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_index..]
    }

    /// Tulis bytes di write cursor, grow kalau ruang tidak cukup.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let end = self.write_index + bytes.len();
        self.storage[self.write_index..end].copy_from_slice(bytes);
        self.write_index = end;
    }

    /// Pastikan minimal `n` byte writable.
    ///
    /// Growth policy: dua kali kapasitas sekarang, atau ukuran minimum
    /// yang dibutuhkan kalau lebih besar.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        let needed = self.readable_bytes() + n;
        let new_capacity = (self.capacity() * 2).max(needed);
        self.resize(new_capacity);
    }

    /// Lihat `n` byte pertama tanpa menggeser read cursor
    #[inline]
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if n > self.readable_bytes() {
            return None;
        }
        Some(&self.storage[self.read_index..self.read_index + n])
    }

    /// Ambil `n` byte dan geser read cursor.
    ///
    /// Returns `None` kalau `n` melebihi readable bytes; buffer tidak berubah.
    pub fn consume(&mut self, n: usize) -> Option<Vec<u8>> {
        let bytes = self.peek(n)?.to_vec();
        self.advance_read(n);
        Some(bytes)
    }

    /// Geser read cursor, dibatasi oleh write cursor
    #[inline]
    pub fn advance_read(&mut self, n: usize) {
        self.read_index += n.min(self.readable_bytes());
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        } else if self.read_index * COMPACT_RATIO > self.capacity() {
            self.compact();
        }
    }

    /// Geser write cursor setelah data ditulis lewat `writable_slice_mut`,
    /// dibatasi oleh kapasitas
    #[inline]
    pub fn advance_write(&mut self, n: usize) {
        self.write_index += n.min(self.writable_bytes());
    }

    /// Ganti kapasitas storage. Data readable dipindah ke offset 0;
    /// kalau `new_capacity` lebih kecil dari readable bytes, sisanya dibuang.
    pub fn resize(&mut self, new_capacity: usize) {
        let new_capacity = new_capacity.max(MIN_CAPACITY);
        let keep = self.readable_bytes().min(new_capacity);
        let mut storage = vec![0u8; new_capacity];
        storage[..keep].copy_from_slice(&self.storage[self.read_index..self.read_index + keep]);
        self.storage = storage;
        self.read_index = 0;
        self.write_index = keep;
    }

    /// Pindahkan data unread ke offset 0
    pub fn compact(&mut self) {
        if self.read_index == 0 {
            return;
        }
        let remaining = self.readable_bytes();
        if remaining > 0 {
            self.storage
                .copy_within(self.read_index..self.write_index, 0);
        }
        self.read_index = 0;
        self.write_index = remaining;
    }

    /// Kosongkan buffer tanpa mengubah kapasitas
    #[inline]
    pub fn clear(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }
}

impl Default for TcpBuffer {
    fn default() -> Self {
        Self::new(128)
    }
}
