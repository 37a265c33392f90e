//! Pointer fixup for block-serialized chunks.
//!
//! Some compilers emit structures that are consumed in place after a
//! single fixup pass rather than field-by-field deserialization. The block
//! layout is:
//!
//! ```text
//! u64 fixup-count
//! fixup-count x u64     positions of pointer cells, relative to the body
//! body bytes
//! ```
//!
//! Each pointer cell initially holds an offset relative to the body start.
//! [`initialize`] rewrites every cell to the absolute address of its
//! target. The patched addresses stay valid only while the buffer's heap
//! allocation does; callers must not clone or reallocate the buffer after
//! the pass.

use crate::error::{AssetError, Result};

/// Runs the in-place fixup pass and returns the body slice.
pub fn initialize(buffer: &mut [u8]) -> Result<&mut [u8]> {
    let count = read_cell(buffer, 0)? as usize;
    let table_end = 8usize
        .checked_add(count.checked_mul(8).ok_or_else(malformed)?)
        .ok_or_else(malformed)?;
    if table_end > buffer.len() {
        return Err(malformed());
    }

    let (table, body) = buffer.split_at_mut(table_end);
    let base = body.as_ptr() as u64;
    for slot in 0..count {
        let position = read_cell(table, 8 + slot * 8)? as usize;
        let target = read_cell(body, position)?;
        if target > body.len() as u64 {
            return Err(malformed());
        }
        body[position..position + 8].copy_from_slice(&(base + target).to_le_bytes());
    }
    Ok(body)
}

fn read_cell(bytes: &[u8], offset: usize) -> Result<u64> {
    let cell = bytes
        .get(offset..offset + 8)
        .ok_or_else(malformed)?
        .try_into()
        .map_err(|_| malformed())?;
    Ok(u64::from_le_bytes(cell))
}

fn malformed() -> AssetError {
    AssetError::msg("malformed block-serialized chunk")
}

/// Builds a block in the layout [`initialize`] consumes. Producers append
/// raw bytes and pointer cells; `finish` prepends the fixup table.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    body: Vec<u8>,
    fixups: Vec<u64>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset within the body.
    pub fn position(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Appends a pointer cell referring to `target`, a body offset, and
    /// records it in the fixup table.
    pub fn write_pointer(&mut self, target: u64) {
        self.fixups.push(self.position());
        self.body.extend_from_slice(&target.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.fixups.len() * 8 + self.body.len());
        out.extend_from_slice(&(self.fixups.len() as u64).to_le_bytes());
        for fixup in &self.fixups {
            out.extend_from_slice(&fixup.to_le_bytes());
        }
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_pointers_to_absolute_addresses() {
        let mut builder = BlockBuilder::new();
        builder.write_pointer(16); // -> the string below
        builder.write_bytes(&4u64.to_le_bytes()); // length field
        builder.write_bytes(b"mesh");
        let mut block = builder.finish();

        let body = initialize(&mut block).unwrap();
        let base = body.as_ptr() as u64;
        let patched = u64::from_le_bytes(body[0..8].try_into().unwrap());
        assert_eq!(patched, base + 16);
        // the target itself is untouched
        assert_eq!(&body[16..20], b"mesh");
    }

    #[test]
    fn empty_block_has_empty_body() {
        let mut block = BlockBuilder::new().finish();
        assert!(initialize(&mut block).unwrap().is_empty());
    }

    #[test]
    fn rejects_truncated_table() {
        let mut block = 3u64.to_le_bytes().to_vec();
        assert!(initialize(&mut block).is_err());
    }

    #[test]
    fn rejects_out_of_range_target() {
        let mut builder = BlockBuilder::new();
        builder.write_pointer(1024);
        let mut block = builder.finish();
        assert!(initialize(&mut block).is_err());
    }
}
