//! Byte cursors for the PVA wire encodings.
//!
//! Decoding never returns `Result`: a short buffer or malformed primitive
//! sets a sticky fault flag and every later operation becomes a no-op that
//! yields a default value. Callers check [`ReadBuf::good`] once at the end
//! and discard the partial result on failure. [`WriteBuf`] mirrors the flag
//! so composition helpers can bail out the same way.
//!
//! Base encodings:
//! - fixed-width integers and floats in the connection-negotiated byte order
//! - `Size`: one byte below 254; `0xFE` + 32-bit (or 64-bit escaped) count;
//!   `0xFF` as the "null" sentinel used by union selectors
//! - strings: `Size` followed by raw UTF-8 bytes
//! - bitsets: `Size` byte count followed by little-endian bytes

use crate::bitset::BitSet;

macro_rules! impl_put_int {
    ($name:ident, $typ:ty) => {
        pub fn $name(&mut self, value: $typ) {
            if self.good {
                if self.be {
                    self.out.extend_from_slice(&value.to_be_bytes());
                } else {
                    self.out.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    };
}

macro_rules! impl_get_int {
    ($name:ident, $typ:ty) => {
        pub fn $name(&mut self) -> $typ {
            const N: usize = size_of::<$typ>();
            let mut raw = [0u8; N];
            match self.take(N) {
                Some(bytes) => raw.copy_from_slice(bytes),
                None => return Default::default(),
            }
            if self.be {
                <$typ>::from_be_bytes(raw)
            } else {
                <$typ>::from_le_bytes(raw)
            }
        }
    };
}

/// Appends wire primitives to a byte vector.
pub struct WriteBuf<'a> {
    out: &'a mut Vec<u8>,
    be: bool,
    good: bool,
}

impl<'a> WriteBuf<'a> {
    pub fn new(out: &'a mut Vec<u8>, big_endian: bool) -> WriteBuf<'a> {
        WriteBuf {
            out,
            be: big_endian,
            good: true,
        }
    }

    /// Mark the buffer as failed; later writes are discarded.
    pub fn fault(&mut self) {
        self.good = false;
    }

    pub fn good(&self) -> bool {
        self.good
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if self.good {
            self.out.extend_from_slice(bytes);
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        if self.good {
            self.out.push(value);
        }
    }

    pub fn put_i8(&mut self, value: i8) {
        self.put_u8(value as u8);
    }

    impl_put_int!(put_u16, u16);
    impl_put_int!(put_u32, u32);
    impl_put_int!(put_u64, u64);
    impl_put_int!(put_i16, i16);
    impl_put_int!(put_i32, i32);
    impl_put_int!(put_i64, i64);
    impl_put_int!(put_f32, f32);
    impl_put_int!(put_f64, f64);

    pub fn put_size(&mut self, size: usize) {
        if size == usize::MAX {
            self.put_u8(0xFF);
        } else if size < 254 {
            self.put_u8(size as u8);
        } else if size < u32::MAX as usize {
            self.put_u8(0xFE);
            self.put_u32(size as u32);
        } else {
            self.put_u8(0xFE);
            self.put_u32(u32::MAX);
            self.put_u64(size as u64);
        }
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_size(value.len());
        self.put_bytes(value.as_bytes());
    }

    pub fn put_bitset(&mut self, bits: &BitSet) {
        let bytes = bits.to_le_bytes();
        self.put_size(bytes.len());
        self.put_bytes(&bytes);
    }
}

/// Consumes wire primitives from a byte slice.
pub struct ReadBuf<'a> {
    buf: &'a [u8],
    pos: usize,
    be: bool,
    good: bool,
}

impl<'a> ReadBuf<'a> {
    pub fn new(buf: &'a [u8], big_endian: bool) -> ReadBuf<'a> {
        ReadBuf {
            buf,
            pos: 0,
            be: big_endian,
            good: true,
        }
    }

    /// Mark the buffer as failed; later reads yield defaults.
    pub fn fault(&mut self) {
        self.good = false;
    }

    pub fn good(&self) -> bool {
        self.good
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Option<&'a [u8]> {
        if !self.good || self.remaining() < count {
            self.good = false;
            return None;
        }
        let bytes = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Some(bytes)
    }

    pub fn get_u8(&mut self) -> u8 {
        self.take(1).map(|b| b[0]).unwrap_or_default()
    }

    /// Fill `out` from the stream, or fault and leave it untouched.
    pub fn get_bytes(&mut self, out: &mut [u8]) {
        if let Some(bytes) = self.take(out.len()) {
            out.copy_from_slice(bytes);
        }
    }

    pub fn get_i8(&mut self) -> i8 {
        self.get_u8() as i8
    }

    impl_get_int!(get_u16, u16);
    impl_get_int!(get_u32, u32);
    impl_get_int!(get_u64, u64);
    impl_get_int!(get_i16, i16);
    impl_get_int!(get_i32, i32);
    impl_get_int!(get_i64, i64);
    impl_get_int!(get_f32, f32);
    impl_get_int!(get_f64, f64);

    pub fn get_size(&mut self) -> usize {
        match self.get_u8() {
            0xFF => usize::MAX,
            0xFE => {
                let count = self.get_u32();
                if count == u32::MAX {
                    self.get_u64() as usize
                } else {
                    count as usize
                }
            }
            byte => byte as usize,
        }
    }

    pub fn get_string(&mut self) -> String {
        let len = self.get_size();
        if len == usize::MAX {
            self.fault();
            return String::new();
        }
        match self.take(len).map(std::str::from_utf8) {
            Some(Ok(text)) => text.to_string(),
            _ => {
                self.fault();
                String::new()
            }
        }
    }

    pub fn get_bitset(&mut self) -> BitSet {
        let len = self.get_size();
        if len == usize::MAX {
            self.fault();
            return BitSet::default();
        }
        match self.take(len) {
            Some(bytes) => BitSet::from_le_bytes(bytes),
            None => BitSet::default(),
        }
    }
}
