// Apache License, Version 2.0

//! Chunked copy-on-write array storage.
//!
//! An [`ArrayStore`] keeps any number of versions ("states") of a byte
//! array while sharing identical chunks of memory between them, so a
//! history of large, mostly-similar arrays costs little more than the
//! sum of its differences. From the user's perspective the chunking is
//! an implementation detail: arrays go in and come out as flat buffers.
//!
//! # Overview
//!
//! * [`ArrayStore`] owns the sizing parameters (a fixed element stride
//!   and a target chunk size) and the collection of live states. All
//!   arrays stored in one store must share the same stride.
//! * [`ArrayState`] is an opaque handle for one stored array. A state
//!   holds a reference-counted chunk list; states created from identical
//!   data share the whole list, states created from similar data share
//!   individual chunks.
//!
//! # De-duplication
//!
//! When adding a state, a previously added state may be passed as a
//! reference, typically the previous version of the same array although
//! any state from the same store works. Matching chunks at either end of
//! the array are detected first, which covers identical and
//! edited-in-place arrays cheaply. Remaining chunks are de-duplicated
//! through a hash over the first bytes of each candidate chunk; once one
//! chunk matches, the chunks that follow are checked directly since
//! matches tend to run contiguously.
//!
//! # Example
//!
//! ```
//! use array_store::ArrayStore;
//!
//! let mut bs = ArrayStore::new(1, 8);
//! let data_src_a = b"The quick brown fox jumps over the lazy dog";
//! let data_src_b = b"The quick brown fox almost jumps over the lazy dog";
//!
//! let state_a = bs.state_add(data_src_a, None);
//! let state_b = bs.state_add(data_src_b, Some(&state_a));
//!
//! assert_eq!(&state_a.data_get_alloc()[..], &data_src_a[..]);
//! assert_eq!(&state_b.data_get_alloc()[..], &data_src_b[..]);
//!
//! // the unchanged head and tail are stored once
//! assert!(bs.calc_size_compacted_get() < bs.calc_size_expanded_get());
//! ```

use std::cmp::max;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;

// -----------------------------------------------------------------------------
// Constants
//
// Some of the merge logic is quite involved, support disabling parts of it.

/// Scan first chunks (happy path when the beginning of the array matches).
/// When the array is a perfect match, the entire list is re-used.
///
/// Note that disabling makes some tests that check output sizes fail.
const USE_FASTPATH_CHUNKS_FIRST: bool = true;

/// Scan last chunks (happy path when the end of the array matches).
///
/// Matching trailing chunks would eventually be found as contiguous runs,
/// this mainly keeps them out of the lookup table so building it stays
/// cheap.
///
/// The merge engine's suffix bookkeeping assumes the first-chunks pass
/// ran, so this follows `USE_FASTPATH_CHUNKS_FIRST` instead of toggling
/// independently.
const USE_FASTPATH_CHUNKS_LAST: bool = USE_FASTPATH_CHUNKS_FIRST;

/// For arrays of matching length with a small unmatched middle, step over
/// both arrays reusing matching chunks instead of building a lookup table.
const USE_ALIGN_CHUNKS_TEST: bool = true;

/// The unmatched middle must be at most this fraction of the total for
/// the aligned walk to apply. Empirically tuned, its only contract is
/// performance.
const ALIGN_CHUNKS_DIV: usize = 4;

/// Accumulation passes per stride width. Narrow elements hash fewer bytes
/// each, so their raw hashes are less unique and need more accumulation
/// to tell nearby windows apart. Empirically tuned.
const ACCUM_STEPS_8BITS: usize = 5;
const ACCUM_STEPS_16BITS: usize = 4;
const ACCUM_STEPS_DEFAULT: usize = 3;

/// How much larger the lookup table is than the candidate chunk count.
const CHUNK_HASH_TABLE_MUL: usize = 3;

/// Merge too small/large chunks.
///
/// Chunks below a threshold are merged together; even though short term
/// this uses more memory, long term the overhead of maintaining many
/// small chunks is reduced. The threshold is the regular chunk size
/// divided by `CHUNK_SIZE_MIN_DIV`. Oversized chunks (from incrementally
/// growing an array) are split back down, capped at the regular size
/// scaled by `CHUNK_SIZE_MAX_MUL`.
const USE_MERGE_CHUNKS: bool = true;

/// `USE_MERGE_CHUNKS`: merge chunks smaller than `chunk_byte_size / CHUNK_SIZE_MIN_DIV`.
const CHUNK_SIZE_MIN_DIV: usize = 8;

/// `USE_MERGE_CHUNKS`: disallow chunks bigger than the regular chunk size
/// scaled by this value. Must be at least 2; the splitting code only runs
/// in tests when lowered to ~1.1.
const CHUNK_SIZE_MAX_MUL: usize = 2;

/// Slow, keep disabled; handy for debugging.
const USE_VALIDATE_LIST_SIZE: bool = false;

const USE_VALIDATE_LIST_DATA_PARTIAL: bool = false;

const USE_PARANOID_CHECKS: bool = false;

// -----------------------------------------------------------------------------
// Modules

mod chunk;
mod merge;

#[cfg(test)]
mod proptests;

use chunk::{Chunk, ChunkList};
use merge::chunk_list_from_data_merge;

type HashKey = u64;

// -----------------------------------------------------------------------------
// Internal structs

/// Sizes and offsets for one array store, created once and never mutated.
pub(crate) struct ArrayInfo {
    pub chunk_stride: usize,

    // pre-calculated
    pub chunk_byte_size: usize,
    // min/max merge limits (inclusive)
    pub chunk_byte_size_min: usize,
    pub chunk_byte_size_max: usize,

    pub accum_steps: usize,
    pub accum_read_ahead_len: usize,
    pub accum_read_ahead_bytes: usize,
}

/// Main storage for all states.
pub struct ArrayStore {
    // static data
    pub(crate) info: ArrayInfo,

    // May be in any order, logic should never depend on state order.
    states: Vec<Rc<ArrayState>>,
}

/// A single stored version of an array.
///
/// An opaque handle: holding one keeps the state's chunk list readable,
/// removal from the store is explicit via [`ArrayStore::state_remove`].
pub struct ArrayState {
    chunk_list: Rc<ChunkList>,
}

// -----------------------------------------------------------------------------
// Main array storage API

fn accum_steps_from_stride(stride: usize) -> usize {
    match stride {
        1 => ACCUM_STEPS_8BITS,
        2 | 3 => ACCUM_STEPS_16BITS,
        _ => ACCUM_STEPS_DEFAULT,
    }
}

impl ArrayStore {
    /// Create a new array store for any number of arrays sharing `stride`.
    ///
    /// * `stride`: size of each element in bytes. A stride of 1 always
    ///   works but is less efficient, duplicate spans are searched at
    ///   positions unaligned with the element data.
    /// * `chunk_count`: number of elements in a regular chunk. Small
    ///   values de-duplicate more aggressively at the cost of
    ///   book-keeping and reconstruction overhead; large values reduce
    ///   overhead but let a small isolated change duplicate more data.
    pub fn new(stride: usize, chunk_count: usize) -> ArrayStore {
        debug_assert!(stride > 0);
        debug_assert!(chunk_count > 0);

        let accum_steps = accum_steps_from_stride(stride);
        // Triangle number (+1) identifying how much read-ahead the
        // accumulation consumes: https://en.wikipedia.org/wiki/Triangular_number
        let accum_read_ahead_len = ((accum_steps * (accum_steps + 1)) / 2) + 1;
        let accum_read_ahead_bytes = accum_read_ahead_len * stride;

        ArrayStore {
            info: ArrayInfo {
                chunk_stride: stride,

                chunk_byte_size: chunk_count * stride,
                chunk_byte_size_min: max(1, chunk_count / CHUNK_SIZE_MIN_DIV) * stride,
                chunk_byte_size_max: (chunk_count * CHUNK_SIZE_MAX_MUL) * stride,

                accum_steps,
                accum_read_ahead_len,
                accum_read_ahead_bytes,
            },
            states: Vec::new(),
        }
    }

    /// Drop all states, allowing reuse of `self`.
    ///
    /// States the caller still holds stay readable but are detached: they
    /// no longer count toward this store's statistics and their memory is
    /// released when the last handle drops.
    pub fn clear(&mut self) {
        debug!("clear: dropping {} states", self.states.len());
        self.states.clear();
    }

    // -------------------------------------------------------------------------
    // Statistics

    /// Total memory the arrays of all states would use fully expanded.
    pub fn calc_size_expanded_get(&self) -> usize {
        self.states.iter().map(|s| s.chunk_list.total_size).sum()
    }

    /// Memory used by all chunk data, counting each shared chunk once.
    /// Comparing against [`Self::calc_size_expanded_get`] gives the
    /// de-duplication saving.
    pub fn calc_size_compacted_get(&self) -> usize {
        let mut chunks_seen: HashSet<*const Chunk> = HashSet::new();
        let mut size_total = 0;
        for state in &self.states {
            for chunk in &state.chunk_list.chunks {
                if chunks_seen.insert(Rc::as_ptr(chunk)) {
                    size_total += chunk.data.len();
                }
            }
        }
        size_total
    }

    // -------------------------------------------------------------------------
    // State access

    /// Store `data` as a new state.
    ///
    /// * `state_reference`: a state to use as a reference when adding,
    ///   typically the previous state, although any state created from
    ///   this store works. Chunks are re-used from it wherever the data
    ///   matches.
    ///
    /// `data.len()` must be a multiple of the store's stride.
    ///
    /// The returned handle reads the contents of `data` back until it is
    /// removed with [`Self::state_remove`] or the store is cleared.
    pub fn state_add(
        &mut self,
        data: &[u8],
        state_reference: Option<&ArrayState>,
    ) -> Rc<ArrayState> {
        // ensure we're aligned to the stride
        debug_assert_eq!(0, data.len() % self.info.chunk_stride);

        let chunk_list = match state_reference {
            Some(state_reference) => {
                // re-use reference chunks
                chunk_list_from_data_merge(&self.info, data, &state_reference.chunk_list)
            }
            None => {
                let mut chunk_list = ChunkList::new(data.len());
                chunk_list.fill_from_array(&self.info, data);
                Rc::new(chunk_list)
            }
        };

        let state = Rc::new(ArrayState { chunk_list });
        self.states.push(Rc::clone(&state));

        debug!(
            "state_add: {} bytes over {} chunks",
            data.len(),
            state.chunk_list.chunks.len()
        );

        if USE_PARANOID_CHECKS {
            assert_eq!(&state.data_get_alloc()[..], data);
        }

        state
    }

    /// Remove a state, freeing any chunks no other state shares.
    ///
    /// Consumes the handle: once this returns the state is gone and every
    /// reference count reflects the states the store still holds, so
    /// [`Self::is_valid`] holds immediately after. States can be removed
    /// in any order.
    pub fn state_remove(&mut self, state: Rc<ArrayState>) {
        let index = self.states.iter().position(|s| Rc::ptr_eq(s, &state));
        debug_assert!(index.is_some(), "state does not belong to this store");
        if let Some(index) = index {
            debug!("state_remove: {} bytes", state.chunk_list.total_size);
            // state order is insignificant
            self.states.swap_remove(index);
        }
    }

    // -------------------------------------------------------------------------
    // Validation (for tests)

    /// Check all cached sizes and reference counts from scratch.
    ///
    /// This is slow; the primary hook for testing the whole subsystem.
    pub fn is_valid(&self) -> bool {
        // Check lengths
        // -------------

        for state in &self.states {
            let chunk_list = &state.chunk_list;
            if chunk_list.size_calc() != chunk_list.total_size {
                return false;
            }

            if USE_MERGE_CHUNKS {
                // ensure all chunks that could be merged have been
                if chunk_list.total_size > self.info.chunk_byte_size_min {
                    for chunk in &chunk_list.chunks {
                        if chunk.data.len() < self.info.chunk_byte_size_min {
                            return false;
                        }
                    }
                }
            }
        }

        // Check user counts
        // -----------------
        //
        // Every strong reference must be accounted for by scanning the
        // states, anything else means a reference leaked.

        {
            let mut chunk_list_user_map: HashMap<*const ChunkList, usize> = HashMap::new();
            for state in &self.states {
                *chunk_list_user_map
                    .entry(Rc::as_ptr(&state.chunk_list))
                    .or_insert(0) += 1;
            }
            for state in &self.states {
                let users_real = Rc::strong_count(&state.chunk_list);
                if users_real != chunk_list_user_map[&Rc::as_ptr(&state.chunk_list)] {
                    return false;
                }
            }

            let mut chunk_user_map: HashMap<*const Chunk, usize> = HashMap::new();
            let mut chunk_lists_seen: HashSet<*const ChunkList> = HashSet::new();
            for state in &self.states {
                if chunk_lists_seen.insert(Rc::as_ptr(&state.chunk_list)) {
                    for chunk in &state.chunk_list.chunks {
                        *chunk_user_map.entry(Rc::as_ptr(chunk)).or_insert(0) += 1;
                    }
                }
            }
            for state in &self.states {
                for chunk in &state.chunk_list.chunks {
                    if Rc::strong_count(chunk) != chunk_user_map[&Rc::as_ptr(chunk)] {
                        return false;
                    }
                }
            }
        }

        true
    }
}

impl ArrayState {
    /// Expanded size of this state's array in bytes, O(1).
    ///
    /// Use this to size the argument of [`Self::data_get`].
    pub fn size(&self) -> usize {
        self.chunk_list.total_size
    }

    /// Fill `data` with the contents of this state.
    ///
    /// `data.len()` must equal [`Self::size`].
    pub fn data_get(&self, data: &mut [u8]) {
        debug_assert_eq!(self.chunk_list.total_size, data.len());

        let mut data_step = 0;
        for chunk in &self.chunk_list.chunks {
            let data_step_next = data_step + chunk.data.len();
            data[data_step..data_step_next].copy_from_slice(&chunk.data);
            data_step = data_step_next;
        }
    }

    /// Allocate and return the contents of this state.
    pub fn data_get_alloc(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.chunk_list.total_size];
        self.data_get(&mut data);
        data
    }
}
