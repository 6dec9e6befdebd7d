/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

fn overflow_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "buffer overflow")
}

/// A bounds checked I/O buffer for assembling and parsing wire frames.
///
/// Appends grow the buffer up to its fixed capacity L; reads go through an
/// external cursor so a frame can be picked apart field by field. All
/// multi-byte integers are big-endian on the wire.
pub struct Buffer<const L: usize>(usize, [u8; L]);

impl<const L: usize> Default for Buffer<L> {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl<const L: usize> Buffer<L> {
    pub const CAPACITY: usize = L;

    /// Create an empty zeroed buffer.
    #[inline(always)]
    pub fn new() -> Self {
        Self(0, [0_u8; L])
    }

    pub fn from_bytes(b: &[u8]) -> std::io::Result<Self> {
        let l = b.len();
        if l <= L {
            let mut tmp = Self::new();
            tmp.0 = l;
            tmp.1[0..l].copy_from_slice(b);
            Ok(tmp)
        } else {
            Err(overflow_err())
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.1[0..self.0]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.1[0..self.0].fill(0);
        self.0 = 0;
    }

    pub fn append_u8(&mut self, i: u8) -> std::io::Result<()> {
        let ptr = self.0;
        if ptr < L {
            self.0 = ptr + 1;
            self.1[ptr] = i;
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    pub fn append_u16(&mut self, i: u16) -> std::io::Result<()> {
        let ptr = self.0;
        let end = ptr + 2;
        if end <= L {
            self.0 = end;
            self.1[ptr..end].copy_from_slice(&i.to_be_bytes());
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    pub fn append_u32(&mut self, i: u32) -> std::io::Result<()> {
        let ptr = self.0;
        let end = ptr + 4;
        if end <= L {
            self.0 = end;
            self.1[ptr..end].copy_from_slice(&i.to_be_bytes());
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    pub fn append_bytes(&mut self, b: &[u8]) -> std::io::Result<()> {
        let ptr = self.0;
        let end = ptr + b.len();
        if end <= L {
            self.0 = end;
            self.1[ptr..end].copy_from_slice(b);
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    pub fn append_bytes_fixed<const S: usize>(&mut self, b: &[u8; S]) -> std::io::Result<()> {
        let ptr = self.0;
        let end = ptr + S;
        if end <= L {
            self.0 = end;
            self.1[ptr..end].copy_from_slice(b);
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    /// Patch a big-endian u16 at an absolute position already within the buffer.
    /// Used to back-fill size fields after a frame body has been appended.
    pub fn set_u16_at(&mut self, pos: usize, i: u16) -> std::io::Result<()> {
        let end = pos + 2;
        if end <= self.0 {
            self.1[pos..end].copy_from_slice(&i.to_be_bytes());
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    pub fn read_u8(&self, cursor: &mut usize) -> std::io::Result<u8> {
        let ptr = *cursor;
        if ptr < self.0 {
            *cursor = ptr + 1;
            Ok(self.1[ptr])
        } else {
            Err(overflow_err())
        }
    }

    pub fn read_u16(&self, cursor: &mut usize) -> std::io::Result<u16> {
        let ptr = *cursor;
        let end = ptr + 2;
        if end <= self.0 {
            *cursor = end;
            Ok(u16::from_be_bytes(self.1[ptr..end].try_into().unwrap()))
        } else {
            Err(overflow_err())
        }
    }

    pub fn read_u32(&self, cursor: &mut usize) -> std::io::Result<u32> {
        let ptr = *cursor;
        let end = ptr + 4;
        if end <= self.0 {
            *cursor = end;
            Ok(u32::from_be_bytes(self.1[ptr..end].try_into().unwrap()))
        } else {
            Err(overflow_err())
        }
    }

    pub fn read_bytes(&self, l: usize, cursor: &mut usize) -> std::io::Result<&[u8]> {
        let ptr = *cursor;
        let end = ptr + l;
        if end <= self.0 {
            *cursor = end;
            Ok(&self.1[ptr..end])
        } else {
            Err(overflow_err())
        }
    }

    pub fn read_bytes_fixed<const S: usize>(&self, cursor: &mut usize) -> std::io::Result<&[u8; S]> {
        let ptr = *cursor;
        let end = ptr + S;
        if end <= self.0 {
            *cursor = end;
            Ok((&self.1[ptr..end]).try_into().unwrap())
        } else {
            Err(overflow_err())
        }
    }
}

impl<const L: usize> AsRef<[u8]> for Buffer<L> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;

    #[test]
    fn append_and_read_back() {
        let mut b: Buffer<16> = Buffer::new();
        b.append_u8(1).unwrap();
        b.append_u16(0x1234).unwrap();
        b.append_u32(0xdeadbeef).unwrap();
        b.append_bytes(&[9, 8, 7]).unwrap();
        assert_eq!(b.len(), 10);

        let mut cursor = 0;
        assert_eq!(b.read_u8(&mut cursor).unwrap(), 1);
        assert_eq!(b.read_u16(&mut cursor).unwrap(), 0x1234);
        assert_eq!(b.read_u32(&mut cursor).unwrap(), 0xdeadbeef);
        assert_eq!(b.read_bytes(3, &mut cursor).unwrap(), &[9, 8, 7]);
        assert!(b.read_u8(&mut cursor).is_err());
    }

    #[test]
    fn overflow_is_an_error_not_a_panic() {
        let mut b: Buffer<4> = Buffer::new();
        b.append_u32(1).unwrap();
        assert!(b.append_u8(0).is_err());
        assert!(Buffer::<2>::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn size_backfill() {
        let mut b: Buffer<8> = Buffer::new();
        b.append_u16(0).unwrap();
        b.append_bytes(&[1, 2, 3, 4]).unwrap();
        b.set_u16_at(0, b.len() as u16).unwrap();
        let mut cursor = 0;
        assert_eq!(b.read_u16(&mut cursor).unwrap(), 6);
    }
}
