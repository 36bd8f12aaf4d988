//! The driver hand-off protocol
//!
//! The loader driver builds one contiguous, physically backed buffer
//! and calls the hypervisor entry on every target processor with a
//! pointer to it. The buffer starts with a fixed little-endian header:
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 8    | VMM entry virtual address          |
//! | 8      | 8    | per-PP stack virtual address, PP 0 |
//! | 16     | 8    | per-PP TLS virtual address, PP 0   |
//! | 24     | 8    | total buffer size                  |
//! | 32     | …    | embedded ELF images                |
//!
//! The image area holds a count, a size table, and the images
//! themselves, each 8-byte aligned, microkernel first and extensions
//! after it. Whatever remains past the last image backs the page pool.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    /// The buffer is smaller than its own header claims.
    Truncated,
    /// The header's total size disagrees with the buffer.
    BadTotalSize,
    /// The image directory walks out of the buffer.
    BadImageDirectory,
}

const HEADER_SIZE: usize = 32;

/// A parsed view of the driver buffer.
#[derive(Debug)]
pub struct DriverBuffer<'a> {
    bytes: &'a [u8],
    num_images: usize,
    /// Offset of the size table.
    dir_off: usize,
    /// Offset of the first image.
    images_off: usize,
}

fn read_u64(bytes: &[u8], off: usize) -> Result<u64, LaunchError> {
    bytes
        .get(off..off + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(LaunchError::Truncated)
}

impl<'a> DriverBuffer<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, LaunchError> {
        if bytes.len() < HEADER_SIZE + 8 {
            return Err(LaunchError::Truncated);
        }
        if read_u64(bytes, 24)? != bytes.len() as u64 {
            return Err(LaunchError::BadTotalSize);
        }

        let num_images = read_u64(bytes, HEADER_SIZE)? as usize;
        let dir_off = HEADER_SIZE + 8;
        let images_off = dir_off + num_images * 8;

        // Validate the directory up front so iteration cannot fall off
        // the end.
        let mut off = images_off;
        for i in 0..num_images {
            let size = read_u64(bytes, dir_off + i * 8)? as usize;
            off = off.checked_add(size).ok_or(LaunchError::BadImageDirectory)?;
            off = off.next_multiple_of(8);
            if off > bytes.len() {
                return Err(LaunchError::BadImageDirectory);
            }
        }

        Ok(Self { bytes, num_images, dir_off, images_off })
    }

    /// Virtual address of the VMM entry the driver will call.
    pub fn entry_vaddr(&self) -> u64 {
        read_u64(self.bytes, 0).unwrap_or(0)
    }

    /// Stack top for PP 0; stacks for further PPs follow contiguously.
    pub fn pp_stack_vaddr(&self) -> u64 {
        read_u64(self.bytes, 8).unwrap_or(0)
    }

    /// TLS block for PP 0; blocks for further PPs follow contiguously.
    pub fn pp_tls_vaddr(&self) -> u64 {
        read_u64(self.bytes, 16).unwrap_or(0)
    }

    pub fn total_size(&self) -> u64 {
        read_u64(self.bytes, 24).unwrap_or(0)
    }

    pub fn num_images(&self) -> usize {
        self.num_images
    }

    /// The `index`th embedded image; 0 is the microkernel, the rest
    /// are extensions.
    pub fn image(&self, index: usize) -> Option<&'a [u8]> {
        if index >= self.num_images {
            return None;
        }
        let mut off = self.images_off;
        for i in 0..index {
            let size = read_u64(self.bytes, self.dir_off + i * 8).ok()? as usize;
            off = (off + size).next_multiple_of(8);
        }
        let size = read_u64(self.bytes, self.dir_off + index * 8).ok()? as usize;
        self.bytes.get(off..off + size)
    }

    /// Extension images only.
    pub fn extensions(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (1..self.num_images).filter_map(move |i| self.image(i))
    }

    /// The tail of the buffer past the last image, page aligned: the
    /// page pool's backing store. Returns `(offset, len)`.
    pub fn pool_region(&self) -> (usize, usize) {
        let mut off = self.images_off;
        for i in 0..self.num_images {
            if let Ok(size) = read_u64(self.bytes, self.dir_off + i * 8) {
                off = (off + size as usize).next_multiple_of(8);
            }
        }
        let off = off.next_multiple_of(4096);
        (off, self.bytes.len().saturating_sub(off))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_images_parse() {
        let mk = [0xAAu8; 100];
        let ext = [0xBBu8; 33];
        let buf = build::driver_buffer(0x1000, 0x2000, 0x3000, &[&mk, &ext], 0x8000);

        let parsed = DriverBuffer::parse(&buf).unwrap();
        assert_eq!(parsed.entry_vaddr(), 0x1000);
        assert_eq!(parsed.pp_stack_vaddr(), 0x2000);
        assert_eq!(parsed.pp_tls_vaddr(), 0x3000);
        assert_eq!(parsed.total_size(), 0x8000);
        assert_eq!(parsed.num_images(), 2);
        assert_eq!(parsed.image(0).unwrap(), &mk[..]);
        assert_eq!(parsed.image(1).unwrap(), &ext[..]);
        assert_eq!(parsed.image(2), None);
        assert_eq!(parsed.extensions().count(), 1);

        let (off, len) = parsed.pool_region();
        assert_eq!(off % 4096, 0);
        assert_eq!(off + len, buf.len());
        assert!(len >= 0x4000);
    }

    #[test]
    fn truncated_and_inconsistent_buffers_are_rejected() {
        assert_eq!(DriverBuffer::parse(&[0u8; 16]).unwrap_err(), LaunchError::Truncated);

        let mut buf = build::driver_buffer(0, 0, 0, &[], 0x2000);
        buf[24] ^= 1;
        assert_eq!(DriverBuffer::parse(&buf).unwrap_err(), LaunchError::BadTotalSize);

        // An image claiming to be larger than the buffer.
        let mut buf = build::driver_buffer(0, 0, 0, &[&[1, 2, 3]], 0x2000);
        buf[40..48].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(DriverBuffer::parse(&buf).unwrap_err(), LaunchError::BadImageDirectory);
    }
}
