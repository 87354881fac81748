// SPDX-License-Identifier: LGPL-2.1-or-later

//! Block-oriented division of a byte source for chunked transfers.
//!
//! A [`ChunkArray`] carves an [`InputStream`] into fixed-size pieces, each
//! carrying the device address it should land at. When a page size is given
//! no chunk spans a page boundary: the chunker splits as needed and marks the
//! first chunk of each page.

use crate::stream::InputStream;
use crate::{FwError, ResultFw};

/// One addressed piece of a transfer
#[derive(Clone, Debug)]
pub struct Chunk {
    idx: u32,
    address: u64,
    page_boundary: bool,
    data: InputStream,
}

impl Chunk {
    /// Position of this chunk within the array
    #[must_use]
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Device address the chunk should be written to
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Whether this chunk starts a new page
    #[must_use]
    pub fn page_boundary(&self) -> bool {
        self.page_boundary
    }

    /// Payload bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Payload length in bytes
    #[must_use]
    pub fn data_sz(&self) -> usize {
        self.data.size() as usize
    }
}

/// An indexed sequence of [`Chunk`]s over shared storage
#[derive(Clone, Debug)]
pub struct ChunkArray {
    chunks: Vec<Chunk>,
}

impl ChunkArray {
    /// Divide a stream into `block_sz`-byte chunks.
    ///
    /// With `addr_base == None` chunk addresses equal their stream offsets;
    /// otherwise they are `base + offset`. With `page_sz` set, chunks are
    /// split so none crosses a page boundary.
    pub fn from_stream(
        stream: &InputStream,
        addr_base: Option<u64>,
        page_sz: Option<u32>,
        block_sz: u32,
    ) -> ResultFw<Self> {
        if block_sz == 0 {
            return Err(FwError::Internal("chunk block size is zero".into()));
        }
        if let Some(page) = page_sz
            && page == 0
        {
            return Err(FwError::Internal("chunk page size is zero".into()));
        }
        let base = addr_base.unwrap_or(0);
        let total = stream.size();
        let mut chunks = Vec::new();
        let mut pos: u64 = 0;
        while pos < total {
            let mut take = u64::from(block_sz).min(total - pos);
            let mut page_boundary = false;
            if let Some(page) = page_sz {
                let page = u64::from(page);
                let page_remaining = page - (pos % page);
                take = take.min(page_remaining);
                page_boundary = pos % page == 0;
            }
            chunks.push(Chunk {
                idx: chunks.len() as u32,
                address: base + pos,
                page_boundary,
                data: stream.partial(pos, take)?,
            });
            pos += take;
        }
        Ok(ChunkArray { chunks })
    }

    /// Divide an owned buffer without page splitting
    pub fn from_bytes(data: &[u8], addr_base: Option<u64>, block_sz: u32) -> ResultFw<Self> {
        Self::from_stream(&InputStream::from_slice(data), addr_base, None, block_sz)
    }

    /// Exact number of chunks
    #[must_use]
    pub fn length(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Retrieve one chunk; the returned value shares the underlying storage
    pub fn index(&self, idx: u32) -> ResultFw<Chunk> {
        self.chunks
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| FwError::NotFound(format!("no chunk with index {idx}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }
}

impl<'a> IntoIterator for &'a ChunkArray {
    type Item = &'a Chunk;
    type IntoIter = std::slice::Iter<'a, Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustive_and_addressed() {
        let stream = InputStream::from_vec((0u8..=99).collect());
        let chunks = ChunkArray::from_stream(&stream, Some(0x8000), None, 32).unwrap();
        assert_eq!(chunks.length(), 4);
        let total: usize = chunks.iter().map(Chunk::data_sz).sum();
        assert_eq!(total as u64, stream.size());
        assert_eq!(chunks.index(0).unwrap().address(), 0x8000);
        for i in 1..chunks.length() - 1 {
            let prev = chunks.index(i - 1).unwrap();
            let cur = chunks.index(i).unwrap();
            assert_eq!(cur.address() - prev.address(), 32);
        }
        assert_eq!(chunks.index(3).unwrap().data_sz(), 4);
        assert!(chunks.index(4).is_err());
    }

    #[test]
    fn test_offset_address_mode() {
        let chunks = ChunkArray::from_bytes(&[0u8; 10], None, 4).unwrap();
        assert_eq!(chunks.index(0).unwrap().address(), 0);
        assert_eq!(chunks.index(1).unwrap().address(), 4);
        assert_eq!(chunks.index(2).unwrap().address(), 8);
    }

    #[test]
    fn test_page_boundary_split() {
        // 10-byte pages, 8-byte blocks: chunks must not span a page
        let stream = InputStream::from_vec(vec![0u8; 30]);
        let chunks = ChunkArray::from_stream(&stream, None, Some(10), 8).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Chunk::data_sz).collect();
        assert_eq!(sizes, vec![8, 2, 8, 2, 8, 2]);
        let boundaries: Vec<bool> = chunks.iter().map(Chunk::page_boundary).collect();
        assert_eq!(boundaries, vec![true, false, true, false, true, false]);
        for chunk in &chunks {
            let page_start = chunk.address() / 10;
            let page_end = (chunk.address() + chunk.data_sz() as u64 - 1) / 10;
            assert_eq!(page_start, page_end);
        }
    }

    #[test]
    fn test_empty_stream() {
        let chunks = ChunkArray::from_bytes(&[], None, 16).unwrap();
        assert_eq!(chunks.length(), 0);
    }
}
