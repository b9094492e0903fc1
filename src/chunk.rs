// Apache License, Version 2.0

//! Chunks and chunk lists.
//!
//! A [`Chunk`] is an immutable span of array data, shared by reference
//! count between any number of chunk lists. A [`ChunkList`] is the ordered
//! sequence of chunks making up one fully expanded array.
//!
//! Appending goes through a size policy: neighboring chunks below the
//! minimum size are merged, chunks past the maximum are re-split at the
//! regular chunk size. Short term merging copies more memory, long term it
//! avoids the book-keeping overhead of maintaining many small chunks.

use std::cell::Cell;
use std::cmp::min;
use std::rc::Rc;

use crate::{
    ArrayInfo, HashKey, USE_MERGE_CHUNKS, USE_VALIDATE_LIST_DATA_PARTIAL, USE_VALIDATE_LIST_SIZE,
};

/// An immutable span of array data.
///
/// Shared as `Rc<Chunk>`: every chunk list slot referencing this chunk
/// holds one strong reference, the chunk is freed with the last of them.
pub(crate) struct Chunk {
    pub data: Vec<u8>,
    /// Search key for de-duplication, computed lazily and cached
    /// since the data never changes once the chunk is shared.
    pub key: Cell<Option<HashKey>>,
}

impl Chunk {
    pub fn from_vec(data: Vec<u8>) -> Rc<Chunk> {
        Rc::new(Chunk {
            data,
            key: Cell::new(None),
        })
    }

    pub fn from_slice(data: &[u8]) -> Rc<Chunk> {
        Chunk::from_vec(data.to_vec())
    }

    /// Byte equality test against `data` at `offset`.
    ///
    /// Bounds-checked: short-circuits false when this chunk's span would
    /// overrun `data`, callers rely on that for trailing chunks.
    pub fn data_compare(&self, data: &[u8], offset: usize) -> bool {
        if offset + self.data.len() <= data.len() {
            data[offset..(offset + self.data.len())] == self.data[..]
        } else {
            false
        }
    }
}

/// Ordered chunks making up one expanded array.
///
/// Shared as `Rc<ChunkList>`: each array state holding this list is one
/// strong reference. The list is only mutated while being built, never
/// once it's shared.
pub(crate) struct ChunkList {
    /// Chunks in array order, the order defines each chunk's byte offset.
    pub chunks: Vec<Rc<Chunk>>,
    /// Expanded size of all chunks, set up front so callers never
    /// recompute it by scanning (see `size_calc` for the validator).
    pub total_size: usize,
}

impl ChunkList {
    pub fn new(total_size: usize) -> ChunkList {
        ChunkList {
            chunks: Vec::new(),
            total_size,
        }
    }

    /// Append and don't manage merging small chunks.
    pub fn append_only(&mut self, chunk: Rc<Chunk>) {
        self.chunks.push(chunk);
    }

    /// Inspect the last two chunks, merging them when either is below the
    /// minimum size. When the merged size would pass the maximum, re-split
    /// so the left chunk is a regular sized chunk and the right absorbs
    /// the remainder.
    fn ensure_min_size_last(&mut self, info: &ArrayInfo) {
        if self.chunks.len() < 2 {
            return;
        }
        {
            let chunk_curr = &self.chunks[self.chunks.len() - 1];
            let chunk_prev = &self.chunks[self.chunks.len() - 2];
            if min(chunk_prev.data.len(), chunk_curr.data.len()) >= info.chunk_byte_size_min {
                return;
            }
        }

        let chunk_curr = self.chunks.pop().expect("checked above");
        let chunk_prev = self.chunks.pop().expect("checked above");
        let data_merge_len = chunk_prev.data.len() + chunk_curr.data.len();

        if data_merge_len <= info.chunk_byte_size_max {
            // enough space to merge
            let mut data_merge: Vec<u8> = Vec::with_capacity(data_merge_len);
            data_merge.extend_from_slice(&chunk_prev.data);
            data_merge.extend_from_slice(&chunk_curr.data);
            self.append_only(Chunk::from_vec(data_merge));
        } else {
            // Gradual expanding and contracting can grow a chunk past the
            // maximum, keep the chunk on the left hand side a regular size.
            let data_prev_len = info.chunk_byte_size;
            let data_curr_len = data_merge_len - data_prev_len;
            let mut data_prev: Vec<u8> = Vec::with_capacity(data_prev_len);
            let mut data_curr: Vec<u8> = Vec::with_capacity(data_curr_len);

            if data_prev_len <= chunk_prev.data.len() {
                data_prev.extend_from_slice(&chunk_prev.data[0..data_prev_len]);

                data_curr.extend_from_slice(&chunk_prev.data[data_prev_len..]);
                data_curr.extend_from_slice(&chunk_curr.data);
            } else {
                debug_assert!(data_curr_len <= chunk_curr.data.len());

                let data_prev_grow_len = data_prev_len - chunk_prev.data.len();

                data_prev.extend_from_slice(&chunk_prev.data);
                data_prev.extend_from_slice(&chunk_curr.data[0..data_prev_grow_len]);

                data_curr.extend_from_slice(&chunk_curr.data[data_prev_grow_len..]);
            }

            debug_assert_eq!(data_prev_len, data_prev.len());
            debug_assert_eq!(data_curr_len, data_curr.len());

            self.append_only(Chunk::from_vec(data_prev));
            self.append_only(Chunk::from_vec(data_curr));
        }
        // chunk_prev/chunk_curr drop here, freeing them at zero users
    }

    /// Write a single span of new data.
    ///
    /// When either the span or the current last chunk is below the minimum
    /// size the two are merged, growing the last chunk in place when this
    /// list is its only user.
    ///
    /// Use `append_data_n` when writing large spans that need splitting
    /// into multiple chunks.
    pub fn append_data(&mut self, info: &ArrayInfo, data: &[u8]) {
        debug_assert!(!data.is_empty());

        if USE_MERGE_CHUNKS {
            debug_assert!(data.len() <= info.chunk_byte_size_max);

            if let Some(cref) = self.chunks.last_mut() {
                if min(cref.data.len(), data.len()) < info.chunk_byte_size_min {
                    let data_merge_len = cref.data.len() + data.len();
                    if Rc::strong_count(cref) == 1 {
                        // grow in place for the single user;
                        // no weak references exist so this can't fail
                        let chunk = Rc::get_mut(cref).expect("single strong reference");
                        chunk.data.extend_from_slice(data);
                        chunk.key.set(None);
                    } else {
                        let mut data_merge: Vec<u8> = Vec::with_capacity(data_merge_len);
                        data_merge.extend_from_slice(&cref.data);
                        data_merge.extend_from_slice(data);
                        *cref = Chunk::from_vec(data_merge);
                    }
                    debug_assert_eq!(data_merge_len, cref.data.len());
                    return;
                }
            }
        }

        self.append_only(Chunk::from_slice(data));
    }

    /// Write a span of data of arbitrary size, splitting it into one
    /// regular sized chunk per trim step plus a remainder.
    ///
    /// Takes care not to perform redundant merge checks, so successive
    /// fixed size chunks are written quickly.
    pub fn append_data_n(&mut self, info: &ArrayInfo, data: &[u8]) {
        let (data_trim_len, data_last_chunk_len) = calc_trim_len(info, data.len());

        if data_trim_len != 0 {
            let mut i_prev;
            {
                // the first chunk may need to merge with this list's tail
                let i = info.chunk_byte_size;
                self.append_data(info, &data[0..i]);
                i_prev = i;
            }

            while i_prev != data_trim_len {
                let i = i_prev + info.chunk_byte_size;
                self.append_only(Chunk::from_slice(&data[i_prev..i]));
                i_prev = i;
            }

            if data_last_chunk_len != 0 {
                self.append_only(Chunk::from_slice(
                    &data[i_prev..(i_prev + data_last_chunk_len)],
                ));
            }
        } else if data_last_chunk_len != 0 {
            debug_assert_eq!(data.len(), data_last_chunk_len);
            self.append_data(info, data);
        }

        if USE_MERGE_CHUNKS && data.len() > info.chunk_byte_size {
            debug_assert!(
                self.chunks
                    .last()
                    .map_or(false, |c| c.data.len() >= info.chunk_byte_size_min)
            );
        }
    }

    /// Append an existing chunk by reference, then apply the merge policy
    /// to the lists's tail.
    pub fn append(&mut self, info: &ArrayInfo, chunk: Rc<Chunk>) {
        self.append_only(chunk);

        if USE_MERGE_CHUNKS {
            self.ensure_min_size_last(info);
        }
    }

    /// Build this (empty) list from a flat array.
    pub fn fill_from_array(&mut self, info: &ArrayInfo, data: &[u8]) {
        debug_assert!(self.chunks.is_empty());
        let (data_trim_len, data_last_chunk_len) = calc_trim_len(info, data.len());

        let mut i_prev = 0;
        while i_prev != data_trim_len {
            let i = i_prev + info.chunk_byte_size;
            self.append_only(Chunk::from_slice(&data[i_prev..i]));
            i_prev = i;
        }

        if data_last_chunk_len != 0 {
            self.append_only(Chunk::from_slice(
                &data[i_prev..(i_prev + data_last_chunk_len)],
            ));
        }

        if USE_MERGE_CHUNKS && data.len() > info.chunk_byte_size {
            debug_assert!(
                self.chunks
                    .last()
                    .map_or(false, |c| c.data.len() >= info.chunk_byte_size_min)
            );
        }

        debug_check_size(self, data.len());
        debug_check_data(self, data);
    }

    /// Recompute the expanded size by scanning, validation only.
    pub fn size_calc(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    /// Check this list is a prefix of `data`, validation only.
    pub fn data_check(&self, data: &[u8]) -> bool {
        let mut offset = 0;
        for chunk in &self.chunks {
            if data[offset..(offset + chunk.data.len())] != chunk.data[..] {
                return false;
            }
            offset += chunk.data.len();
        }
        true
    }
}

/// Split `data_len` into a trim length aligned to the regular chunk size
/// and the remaining bytes, returned as `(trim_len, last_chunk_len)`.
///
/// When merging is enabled the remainder is kept at or above
/// `chunk_byte_size_min`, avoiding creating a too-small chunk only to
/// merge it afterwards.
pub(crate) fn calc_trim_len(info: &ArrayInfo, data_len: usize) -> (usize, usize) {
    let mut data_last_chunk_len: usize;
    let mut data_trim_len: usize = data_len;

    if USE_MERGE_CHUNKS {
        if data_len > info.chunk_byte_size {
            data_last_chunk_len = data_trim_len % info.chunk_byte_size;
            data_trim_len -= data_last_chunk_len;
            if data_last_chunk_len != 0 && data_last_chunk_len < info.chunk_byte_size_min {
                // trim may drop to zero and that's OK
                data_trim_len -= info.chunk_byte_size;
                data_last_chunk_len += info.chunk_byte_size;
            }
        } else {
            data_trim_len = 0;
            data_last_chunk_len = data_len;
        }

        debug_assert!((data_trim_len == 0) || (data_trim_len >= info.chunk_byte_size));
    } else {
        data_last_chunk_len = data_trim_len % info.chunk_byte_size;
        data_trim_len -= data_last_chunk_len;
    }

    debug_assert_eq!(data_trim_len + data_last_chunk_len, data_len);

    (data_trim_len, data_last_chunk_len)
}

pub(crate) fn debug_check_size(chunk_list: &ChunkList, n: usize) {
    if USE_VALIDATE_LIST_SIZE {
        debug_assert_eq!(chunk_list.size_calc(), n);
    }
}

pub(crate) fn debug_check_data(chunk_list: &ChunkList, data: &[u8]) {
    if USE_VALIDATE_LIST_DATA_PARTIAL {
        debug_assert!(chunk_list.data_check(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArrayStore;

    fn info(stride: usize, chunk_count: usize) -> ArrayInfo {
        ArrayStore::new(stride, chunk_count).info
    }

    #[test]
    fn trim_len_small() {
        let info = info(1, 8);
        assert_eq!(calc_trim_len(&info, 0), (0, 0));
        assert_eq!(calc_trim_len(&info, 3), (0, 3));
        assert_eq!(calc_trim_len(&info, 8), (0, 8));
    }

    #[test]
    fn trim_len_remainder_kept_above_min() {
        // chunk size 32, min 4
        let info = info(1, 32);
        assert_eq!(calc_trim_len(&info, 64), (64, 0));
        // remainder of 2 would be below the minimum,
        // one trim step is given back to it
        assert_eq!(calc_trim_len(&info, 66), (32, 34));
        assert_eq!(calc_trim_len(&info, 40), (32, 8));
    }

    #[test]
    fn append_merges_small_tail() {
        let info = info(1, 32);
        let mut chunk_list = ChunkList::new(34);
        chunk_list.fill_from_array(&info, &[7u8; 32]);
        assert_eq!(chunk_list.chunks.len(), 1);
        // two bytes merge into the previous chunk rather than
        // surviving as an under-sized chunk
        chunk_list.append_data(&info, &[8u8; 2]);
        assert_eq!(chunk_list.chunks.len(), 1);
        assert_eq!(chunk_list.size_calc(), 34);
        // grown in place, the appended bytes must be present
        assert_eq!(&chunk_list.chunks[0].data[32..], &[8u8; 2][..]);
    }

    #[test]
    fn append_copies_shared_tail() {
        let info = info(1, 32);
        let mut chunk_list = ChunkList::new(35);
        chunk_list.fill_from_array(&info, &[7u8; 32]);
        let shared = Rc::clone(&chunk_list.chunks[0]);

        chunk_list.append_data(&info, &[8u8; 3]);
        assert_eq!(chunk_list.chunks.len(), 1);
        assert_eq!(chunk_list.size_calc(), 35);
        assert_eq!(&chunk_list.chunks[0].data[32..], &[8u8; 3][..]);
        // the shared chunk is replaced, never mutated
        assert_eq!(shared.data.len(), 32);
        assert!(!Rc::ptr_eq(&shared, &chunk_list.chunks[0]));
    }

    #[test]
    fn append_splits_oversized_merge() {
        // chunk size 32, min 4, max 64
        let info = info(1, 32);
        let mut chunk_list = ChunkList::new(66);
        chunk_list.append_only(Chunk::from_slice(&[1u8; 63]));
        chunk_list.append(&info, Chunk::from_slice(&[2u8; 3]));
        // merged size 66 passes the maximum, re-split at the chunk size
        assert_eq!(chunk_list.chunks.len(), 2);
        assert_eq!(chunk_list.chunks[0].data.len(), 32);
        assert_eq!(chunk_list.chunks[1].data.len(), 34);
        assert_eq!(chunk_list.size_calc(), 66);
    }
}
