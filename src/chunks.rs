//! Slicing a buffer into records framed by an embedded length field.

use crate::transport::WireType;

/// Iterator produced by [`chunk_by_embedded_size`].
///
/// Each yielded chunk starts at the current position and spans
/// `size_offset + 1 + n` elements, where `n` is the value of the element at
/// `size_offset` within the chunk. The chunk includes the prefix and the
/// length field itself. A record whose declared length runs past the end of
/// the buffer is clamped to the buffer end.
#[derive(Debug, Clone)]
pub struct ChunksByEmbeddedSize<'a, B> {
    rest: &'a [B],
    size_offset: usize,
}

impl<'a, B: WireType> Iterator for ChunksByEmbeddedSize<'a, B> {
    type Item = &'a [B];

    fn next(&mut self) -> Option<&'a [B]> {
        if self.rest.len() <= self.size_offset {
            return None;
        }
        let declared = self.rest[self.size_offset].to_usize();
        let end = (self.size_offset + 1 + declared).min(self.rest.len());
        let (chunk, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(chunk)
    }
}

/// Splits `buffer` into records whose length is stored at `size_offset`
/// inside each record. The length counts the elements following the length
/// field.
pub fn chunk_by_embedded_size<B: WireType>(
    buffer: &[B],
    size_offset: usize,
) -> ChunksByEmbeddedSize<'_, B> {
    ChunksByEmbeddedSize {
        rest: buffer,
        size_offset,
    }
}
