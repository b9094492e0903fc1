// Apache License, Version 2.0

//! De-duplicating merge of new array data against a reference chunk list.
//!
//! Most state-to-state deltas touch a small contiguous region, so cheap
//! matching at both ends of the array handles the common case. What
//! remains is either stepped over chunk-for-chunk (arrays of equal size
//! that are still mostly aligned) or searched through a hash table built
//! over the reference chunks.
//!
//! A chunk's search key hashes the first `accum_read_ahead_bytes` of its
//! content at every element stride, then accumulates trailing hashes
//! backwards a fixed number of steps so nearby windows become more
//! distinguishable. Keys are cached on the chunk, the referenced data
//! never changes.
//!
//! A key match is never taken as proof: every table hit is verified with
//! a full byte compare, so hash collisions cost time, not correctness.

use std::rc::Rc;

use log::trace;

use crate::chunk::{debug_check_data, debug_check_size, Chunk, ChunkList};
use crate::{
    ArrayInfo, HashKey, ALIGN_CHUNKS_DIV, CHUNK_HASH_TABLE_MUL, USE_ALIGN_CHUNKS_TEST,
    USE_FASTPATH_CHUNKS_FIRST, USE_FASTPATH_CHUNKS_LAST, USE_PARANOID_CHECKS,
};

const HASH_INIT: u32 = 5381;

#[inline]
fn hash_data_single(p: u8) -> u32 {
    ((HASH_INIT << 5) + HASH_INIT).wrapping_add((p as i8) as u32)
}

fn hash_data(key: &[u8]) -> u32 {
    let mut h: u32 = HASH_INIT;
    for p in key {
        h = h.wrapping_shl(5).wrapping_add(h).wrapping_add((*p as i8) as u32);
    }
    h
}

/// Fill `hash_array` with one hash per element stride of `data_slice`.
fn hash_array_from_data(info: &ArrayInfo, data_slice: &[u8], hash_array: &mut [HashKey]) {
    if info.chunk_stride != 1 {
        let mut i_step = 0;
        let mut i = 0;
        while i_step != data_slice.len() {
            let i_next = i_step + info.chunk_stride;
            hash_array[i] = hash_data(&data_slice[i_step..i_next]) as HashKey;
            i_step = i_next;
            i += 1;
        }
    } else {
        // fast-path for bytes
        for (i, p) in data_slice.iter().enumerate() {
            hash_array[i] = hash_data_single(*p) as HashKey;
        }
    }
}

/// Like `hash_array_from_data`, stepping into the following chunks when
/// the first runs out of data.
///
/// The caller must have checked `data_len` bytes remain over `chunks`.
fn hash_array_from_chunks(
    info: &ArrayInfo,
    chunks: &[Rc<Chunk>],
    data_len: usize,
    hash_array: &mut [HashKey],
) {
    let hash_array_len = data_len / info.chunk_stride;
    let mut i = 0;
    for chunk in chunks {
        if i == hash_array_len {
            break;
        }
        let mut i_next = hash_array_len - i;
        let mut data_trim_len = i_next * info.chunk_stride;
        if data_trim_len > chunk.data.len() {
            data_trim_len = chunk.data.len();
            i_next = data_trim_len / info.chunk_stride;
        }
        hash_array_from_data(info, &chunk.data[0..data_trim_len], &mut hash_array[i..(i + i_next)]);
        i += i_next;
    }

    debug_assert_eq!(i, hash_array_len);
}

/// Accumulate trailing hashes into each entry of `hash_array`, repeated
/// `iter_steps` times.
fn hash_accum(hash_array: &mut [HashKey], mut iter_steps: usize) {
    // can happen with very small chunk sizes
    if iter_steps > hash_array.len() {
        iter_steps = hash_array.len();
    }

    let hash_array_search_len = hash_array.len() - iter_steps;
    while iter_steps != 0 {
        let hash_offset = iter_steps;
        for i in 0..hash_array_search_len {
            hash_array[i] = hash_array[i].wrapping_add(
                hash_array[i + hash_offset].wrapping_mul((hash_array[i] & 0xff) + 1),
            );
        }
        iter_steps -= 1;
    }
}

/// `hash_accum` when only `hash_array[0]` is needed: the tail of the
/// array can be accumulated a little less each iteration.
fn hash_accum_single(hash_array: &mut [HashKey], mut iter_steps: usize) {
    debug_assert!(iter_steps <= hash_array.len());
    if iter_steps > hash_array.len() {
        // while this shouldn't happen, avoid crashing
        iter_steps = hash_array.len();
    }

    let mut iter_steps_sub = iter_steps;
    while iter_steps != 0 {
        let hash_array_search_len = hash_array.len() - iter_steps_sub;
        let hash_offset = iter_steps;
        for i in 0..hash_array_search_len {
            hash_array[i] = hash_array[i].wrapping_add(
                hash_array[i + hash_offset].wrapping_mul((hash_array[i] & 0xff) + 1),
            );
        }
        iter_steps -= 1;
        iter_steps_sub += iter_steps;
    }
}

/// Search key for the chunk at `chunks[0]`, cached on the chunk when its
/// data covers the read-ahead span.
///
/// Undersized chunks read ahead into the chunks that follow, their key
/// depends on list position so it's recomputed each call.
fn key_from_chunk(info: &ArrayInfo, chunks: &[Rc<Chunk>], hash_store: &mut [HashKey]) -> HashKey {
    let chunk = &chunks[0];
    debug_assert_ne!(0, info.accum_read_ahead_bytes);

    if info.accum_read_ahead_bytes <= chunk.data.len() {
        if let Some(key) = chunk.key.get() {
            return key;
        }
        hash_array_from_chunks(info, chunks, info.accum_read_ahead_bytes, hash_store);
        hash_accum_single(hash_store, info.accum_steps);
        let key = hash_store[0];
        chunk.key.set(Some(key));
        key
    } else {
        hash_array_from_chunks(info, chunks, info.accum_read_ahead_bytes, hash_store);
        hash_accum_single(hash_store, info.accum_steps);
        hash_store[0]
    }
}

struct TableEntry {
    /// Position of the chunk in the reference list.
    chunk_index: usize,
    /// The key the chunk was inserted under. Stored here rather than read
    /// back from the chunk's cache, undersized chunks never cache theirs.
    key: HashKey,
    /// Next entry in the same bucket.
    next: Option<usize>,
}

/// Open hash table over candidate reference chunks, keyed by the
/// accumulated hash, bucket chains linked by index.
struct Table {
    buckets: Vec<Option<usize>>,
    entries: Vec<TableEntry>,
}

impl Table {
    fn with_capacity(bucket_count: usize, entry_capacity: usize) -> Table {
        Table {
            buckets: vec![None; bucket_count],
            entries: Vec::with_capacity(entry_capacity),
        }
    }

    fn insert(&mut self, refs: &[Rc<Chunk>], chunk_index: usize, key: HashKey) {
        let bucket = (key % self.buckets.len() as HashKey) as usize;

        // Suppress exact duplicates: highly repetitive content would
        // otherwise chain into a single pathological bucket.
        let mut entry_index = self.buckets[bucket];
        while let Some(i) = entry_index {
            let entry = &self.entries[i];
            if entry.key == key && refs[entry.chunk_index].data == refs[chunk_index].data {
                return;
            }
            entry_index = entry.next;
        }

        self.entries.push(TableEntry {
            chunk_index,
            key,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(self.entries.len() - 1);
    }

    /// Find a reference chunk whose bytes match `data` at `offset`.
    ///
    /// The key narrows candidates, the byte compare decides.
    fn lookup(&self, refs: &[Rc<Chunk>], data: &[u8], offset: usize, key: HashKey) -> Option<usize> {
        let bucket = (key % self.buckets.len() as HashKey) as usize;
        let mut entry_index = self.buckets[bucket];
        while let Some(i) = entry_index {
            let entry = &self.entries[i];
            if entry.key == key {
                let chunk_test = &refs[entry.chunk_index];
                if chunk_test.data_compare(data, offset) {
                    // we could remove the entry to avoid multiple hits
                    return Some(entry.chunk_index);
                }
            }
            entry_index = entry.next;
        }
        None
    }
}

/// Build a chunk list for `data`, reusing chunks of `reference` wherever
/// the bytes match.
///
/// The reference list is never modified; when `data` matches it exactly
/// the reference list itself is returned (no allocation at all).
pub(crate) fn chunk_list_from_data_merge(
    info: &ArrayInfo,
    data: &[u8],
    reference: &Rc<ChunkList>,
) -> Rc<ChunkList> {
    debug_check_size(reference, reference.total_size);

    let data_len_original = data.len();
    let refs: &[Rc<Chunk>] = &reference.chunks;

    // -----------------------------------------------------------------
    // Fast-path for an exact match: walk the reference and the new data
    // together, on a full match return the reference list itself.

    // number of reference chunks matched from the start
    let mut match_first_len: usize = 0;
    // chunks/bytes of the reference matched at either end
    let mut reference_skip_len: usize = 0;
    let mut reference_skip_bytes: usize = 0;
    let mut i_prev: usize = 0;

    if USE_FASTPATH_CHUNKS_FIRST {
        let mut full_match = true;

        let mut idx = 0;
        while i_prev < data_len_original {
            if idx < refs.len() && refs[idx].data_compare(data, i_prev) {
                match_first_len = idx + 1;
                reference_skip_len += 1;
                reference_skip_bytes += refs[idx].data.len();
                i_prev += refs[idx].data.len();
                idx += 1;
            } else {
                full_match = false;
                break;
            }
        }

        if full_match && reference.total_size == data_len_original {
            trace!("merge: exact match, reference list reused");
            return Rc::clone(reference);
        }
    }
    // End fast-path (first)

    // Copy the matching prefix by reference until the first mismatch.
    let mut chunk_list = ChunkList::new(data_len_original);
    if match_first_len != 0 {
        let mut chunk_size_step = 0;
        for cref in &refs[0..match_first_len] {
            chunk_size_step += cref.data.len();
            chunk_list.append_only(Rc::clone(cref));
            debug_check_size(&chunk_list, chunk_size_step);
            debug_check_data(&chunk_list, data);
        }
        // happens when bytes are removed from the end of the array
        if chunk_size_step == data_len_original {
            return Rc::new(chunk_list);
        }

        i_prev = chunk_size_step;
    } else {
        i_prev = 0;
    }

    // -----------------------------------------------------------------
    // Fast-path for end chunks.
    //
    // From now on `data_len` excludes the suffix-matched bytes,
    // don't use the full data length.

    let mut data_len = data_len_original;
    // position of the first suffix-matched chunk in the reference
    let mut suffix_start: Option<usize> = None;

    if USE_FASTPATH_CHUNKS_LAST && !refs.is_empty() {
        let mut idx = refs.len() - 1;
        while idx != 0
            && (match_first_len == 0 || idx != match_first_len - 1)
            && refs[idx].data.len() <= data_len - i_prev
        {
            let chunk_test = &refs[idx];
            let offset = data_len - chunk_test.data.len();
            if chunk_test.data_compare(&data[..data_len], offset) {
                data_len = offset;
                suffix_start = Some(idx);
                reference_skip_len += 1;
                reference_skip_bytes += chunk_test.data.len();
                idx -= 1;
            } else {
                break;
            }
        }
    }

    // index one past the last chunk available for matching
    let suffix_end = suffix_start.unwrap_or(refs.len());

    // End fast-path (last)

    // -----------------------------------------------------------------
    // Check for aligned chunks: for arrays of matching size with a small
    // unmatched middle, assume chunk boundaries still line up and avoid
    // the lookup table entirely.

    let mut use_aligned = false;

    if USE_ALIGN_CHUNKS_TEST && chunk_list.total_size == reference.total_size {
        // if we're already a quarter aligned
        if data_len - i_prev <= chunk_list.total_size / ALIGN_CHUNKS_DIV {
            use_aligned = true;
        }
    }

    // End aligned chunk case

    if use_aligned {
        // Step over both arrays chunk-for-chunk, reusing the layout of
        // the reference and regenerating chunks that changed.
        trace!("merge: aligned walk over {} bytes", data_len - i_prev);
        let mut idx = match_first_len;
        while i_prev != data_len {
            let i = i_prev + refs[idx].data.len();
            debug_assert_ne!(i, i_prev);

            if suffix_start != Some(idx) && refs[idx].data_compare(&data[..data_len], i_prev) {
                chunk_list.append(info, Rc::clone(&refs[idx]));
            } else {
                chunk_list.append_data(info, &data[i_prev..i]);
            }
            debug_check_size(&chunk_list, i);
            debug_check_data(&chunk_list, data);

            idx += 1;
            i_prev = i;
        }
    } else if data_len - i_prev >= info.chunk_byte_size
        && refs.len() >= reference_skip_len
        && !refs.is_empty()
    {
        // -------------------------------------------------------------
        // Non-aligned chunk de-duplication.
        //
        // Only build a table when there is at least one chunk worth of
        // unmatched data to search; supports re-arranged chunks.

        let i_table_start = i_prev;
        let table_hash_array_len = (data_len - i_prev) / info.chunk_stride;
        let mut table_hash_array: Vec<HashKey> = vec![0; table_hash_array_len];
        hash_array_from_data(info, &data[i_prev..data_len], &mut table_hash_array);
        hash_accum(&mut table_hash_array, info.accum_steps);

        let reference_remaining_len = (refs.len() - reference_skip_len) + 1;
        let table_len = reference_remaining_len * CHUNK_HASH_TABLE_MUL;
        let mut table = Table::with_capacity(table_len, reference_remaining_len);

        // Build the table. The last prefix-matched chunk is included,
        // allowing for repeating values.
        {
            let mut hash_store: Vec<HashKey> = vec![0; info.accum_read_ahead_len];

            let mut reference_bytes_remaining = reference.total_size - reference_skip_bytes;
            let mut idx = if match_first_len != 0 {
                reference_bytes_remaining += refs[match_first_len - 1].data.len();
                match_first_len - 1
            } else {
                0
            };

            if USE_PARANOID_CHECKS {
                let mut test_bytes_len = 0;
                for cref in &refs[idx..suffix_end] {
                    test_bytes_len += cref.data.len();
                }
                assert_eq!(test_bytes_len, reference_bytes_remaining);
            }

            while idx != suffix_end && reference_bytes_remaining >= info.accum_read_ahead_bytes {
                let key = key_from_chunk(info, &refs[idx..], &mut hash_store);
                table.insert(refs, idx, key);

                reference_bytes_remaining -= refs[idx].data.len();
                idx += 1;
            }

            debug_assert!(table.entries.len() <= reference_remaining_len);
        }
        // done making the table
        trace!(
            "merge: table over {} candidates, scanning {} bytes",
            table.entries.len(),
            data_len - i_prev
        );

        debug_assert!(i_prev <= data_len);
        let mut i = i_prev;
        while i < data_len {
            let key = table_hash_array[(i - i_table_start) / info.chunk_stride];
            if let Some(found) = table.lookup(refs, &data[..data_len], i, key) {
                // flush unmatched bytes accumulated since the last match
                if i != i_prev {
                    chunk_list.append_data_n(info, &data[i_prev..i]);
                }

                // now add the reference chunk
                i += refs[found].data.len();
                chunk_list.append(info, Rc::clone(&refs[found]));
                i_prev = i;
                debug_assert!(i_prev <= data_len);
                debug_check_size(&chunk_list, i_prev);
                debug_check_data(&chunk_list, data);

                // Matches tend to run contiguously, check the chunks that
                // follow in the reference order before going back to the
                // table.
                let mut idx_next = found + 1;
                while idx_next != suffix_end && idx_next < refs.len() {
                    let chunk_found = &refs[idx_next];
                    if chunk_found.data_compare(&data[..data_len], i_prev) {
                        i += chunk_found.data.len();
                        chunk_list.append(info, Rc::clone(chunk_found));
                        i_prev = i;
                        debug_assert!(i_prev <= data_len);
                        debug_check_size(&chunk_list, i_prev);
                        debug_check_data(&chunk_list, data);
                        idx_next += 1;
                    } else {
                        break;
                    }
                }
            } else {
                i += info.chunk_stride;
            }
        }

        // End table lookup
    }

    debug_check_size(&chunk_list, i_prev);
    debug_check_data(&chunk_list, data);

    // -----------------------------------------------------------------
    // No duplicates left to copy, write the remaining bytes as new
    // chunks.

    if i_prev != data_len {
        chunk_list.append_data_n(info, &data[i_prev..data_len]);
        i_prev = data_len;
    }

    debug_assert_eq!(i_prev, data_len);

    if USE_FASTPATH_CHUNKS_LAST {
        if let Some(suffix_start) = suffix_start {
            // Write the suffix-matched chunks last, in their original
            // order. Plain appends: the reference chunks are already
            // sized correctly.
            for cref in &refs[suffix_start..] {
                i_prev += cref.data.len();
                chunk_list.append_only(Rc::clone(cref));
                debug_check_data(&chunk_list, data);
            }
        }
    }

    debug_assert_eq!(i_prev, data_len_original);

    // correct size, and the reference wasn't accidentally modified
    debug_check_size(&chunk_list, data_len_original);
    debug_check_size(reference, reference.total_size);
    debug_check_data(&chunk_list, data);

    Rc::new(chunk_list)
}
