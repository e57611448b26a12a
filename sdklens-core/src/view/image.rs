use anyhow::{anyhow, Result};
use bytes::Bytes;

use super::vector::ElementReader;

/// A captured region of process memory starting at `base`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryImage {
    base: u64,
    bytes: Bytes,
}

impl MemoryImage {
    pub fn new(base: u64, bytes: impl Into<Bytes>) -> Self {
        Self {
            base,
            bytes: bytes.into(),
        }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `len` bytes at `address`, or `None` if any of them lies outside the image.
    pub fn slice(&self, address: u64, len: usize) -> Option<Bytes> {
        let start = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        if end > self.bytes.len() {
            return None;
        }
        Some(self.bytes.slice(start..end))
    }
}

impl ElementReader for MemoryImage {
    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.slice(address, len).map(|b| b.to_vec()).ok_or_else(|| {
            anyhow!(
                "0x{address:X}+0x{len:X} is outside the image [0x{:X}, 0x{:X})",
                self.base,
                self.base.saturating_add(self.bytes.len() as u64)
            )
        })
    }
}
