// Apache License, Version 2.0

use super::*;

use proptest::prelude::*;

/// Mutations mirror how callers typically evolve an array between
/// versions: overwrite a region in place, shrink, or grow.
#[derive(Clone, Debug)]
enum Mutation {
    Overwrite { offset: usize, bytes: Vec<u8> },
    Truncate { len: usize },
    Extend { bytes: Vec<u8> },
}

fn apply_mutation(elems: &mut Vec<u8>, mutation: &Mutation) {
    match mutation {
        Mutation::Overwrite { offset, bytes } => {
            if elems.is_empty() {
                return;
            }
            let offset = offset % elems.len();
            let end = (offset + bytes.len()).min(elems.len());
            elems[offset..end].copy_from_slice(&bytes[0..(end - offset)]);
        }
        Mutation::Truncate { len } => {
            let len = len % (elems.len() + 1);
            elems.truncate(len);
        }
        Mutation::Extend { bytes } => {
            elems.extend_from_slice(bytes);
        }
    }
}

/// Repeat each element byte `stride` times, so any element array is
/// aligned for any store stride.
fn expand_stride(elems: &[u8], stride: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(elems.len() * stride);
    for e in elems {
        data.extend(std::iter::repeat(*e).take(stride));
    }
    data
}

fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        4 => (any::<usize>(), prop::collection::vec(any::<u8>(), 1..64))
            .prop_map(|(offset, bytes)| Mutation::Overwrite { offset, bytes }),
        1 => any::<usize>().prop_map(|len| Mutation::Truncate { len }),
        2 => prop::collection::vec(any::<u8>(), 1..128)
            .prop_map(|bytes| Mutation::Extend { bytes }),
    ]
}

/// (stride, chunk_count) pairs covering byte data, word-ish elements and
/// a stride that isn't a power of two.
fn params_strategy() -> impl Strategy<Value = (usize, usize)> {
    prop_oneof![
        Just((1, 8)),
        Just((1, 32)),
        Just((3, 5)),
        Just((4, 4)),
        Just((12, 8)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    /// Build a chain of versions, each derived from the previous by a few
    /// mutations, then tear it down again. The store must round-trip
    /// every version and `is_valid` must hold after every single
    /// operation, not only at the end.
    #[test]
    fn prop_version_chain(
        (stride, chunk_count) in params_strategy(),
        base in prop::collection::vec(any::<u8>(), 0..256),
        edits in prop::collection::vec(
            prop::collection::vec(mutation_strategy(), 0..4), 0..12),
    ) {
        let mut bs = ArrayStore::new(stride, chunk_count);
        let mut elems = base;

        let mut expect: Vec<Vec<u8>> = Vec::new();
        let mut states: Vec<Rc<ArrayState>> = Vec::new();

        let data = expand_stride(&elems, stride);
        states.push(bs.state_add(&data, None));
        expect.push(data);
        prop_assert!(bs.is_valid());

        for mutations in &edits {
            for m in mutations {
                apply_mutation(&mut elems, m);
            }
            let data = expand_stride(&elems, stride);
            let state = bs.state_add(&data, states.last().map(|s| &**s));
            prop_assert!(bs.is_valid());
            prop_assert_eq!(&state.data_get_alloc(), &data);
            states.push(state);
            expect.push(data);
        }

        prop_assert!(bs.calc_size_compacted_get() <= bs.calc_size_expanded_get());

        // removing states must never corrupt the states that remain
        while let Some(state) = states.pop() {
            let expect_data = expect.pop().unwrap();
            prop_assert_eq!(state.data_get_alloc(), expect_data);

            bs.state_remove(state);
            prop_assert!(bs.is_valid());

            for (s, d) in states.iter().zip(expect.iter()) {
                prop_assert_eq!(&s.data_get_alloc(), d);
            }
        }

        prop_assert_eq!(bs.calc_size_compacted_get(), 0);
    }

    /// Re-adding identical data against the previous state must re-use
    /// the whole chunk list: the compacted size stays put while the
    /// expanded size grows by a full copy.
    #[test]
    fn prop_idempotent_re_add(
        (stride, chunk_count) in params_strategy(),
        elems in prop::collection::vec(any::<u8>(), 1..256),
    ) {
        let mut bs = ArrayStore::new(stride, chunk_count);
        let data = expand_stride(&elems, stride);

        let state_a = bs.state_add(&data, None);
        let size_compacted = bs.calc_size_compacted_get();

        let state_b = bs.state_add(&data, Some(&state_a));
        prop_assert!(bs.is_valid());
        prop_assert_eq!(bs.calc_size_compacted_get(), size_compacted);
        prop_assert_eq!(bs.calc_size_expanded_get(), data.len() * 2);
        prop_assert_eq!(&state_b.data_get_alloc(), &data);
    }

    /// An edit confined to one contiguous region must not duplicate the
    /// whole array.
    #[test]
    fn prop_dedup_under_edit(
        elems in prop::collection::vec(any::<u8>(), 64..512),
        offset in any::<usize>(),
    ) {
        let chunk_count = 16;
        let mut bs = ArrayStore::new(1, chunk_count);

        let data_a = elems;
        let state_a = bs.state_add(&data_a, None);

        let mut data_b = data_a.clone();
        let offset = offset % (data_b.len() - 4);
        for b in &mut data_b[offset..(offset + 4)] {
            *b = b.wrapping_add(1);
        }

        let state_b = bs.state_add(&data_b, Some(&state_a));
        prop_assert!(bs.is_valid());
        prop_assert_eq!(&state_b.data_get_alloc(), &data_b);

        // the second state costs at most a few chunks, never a full copy
        let overhead = bs.calc_size_compacted_get() - data_a.len();
        prop_assert!(overhead <= chunk_count * 4);
    }
}
