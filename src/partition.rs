use std::{
    num::NonZeroUsize,
    ops::Range,
};


/// Contiguous range of task positions bound to one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub slot: usize,
    pub range: Range<usize>,
}

impl Chunk {
    #[inline]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// `ceil(len / workers)`
#[inline]
pub fn chunk_size(len: usize, workers: NonZeroUsize) -> usize {
    len.div_ceil(workers.get())
}

/// Splits `len` task positions into exactly `workers` contiguous chunks.
///
/// Chunk `k` covers `[k * size, min((k + 1) * size, len))`. Trailing chunks are
/// empty when `len` does not fill every slot; `len == 0` yields only empty chunks.
pub fn partition(len: usize, workers: NonZeroUsize) -> Vec<Chunk> {
    let size = chunk_size(len, workers);

    (0..workers.get())
        .map(|slot| {
            let start = slot.saturating_mul(size).min(len);
            let end = start.saturating_add(size).min(len);
            Chunk { slot, range: start..end }
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    fn workers(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn ranges(len: usize, w: usize) -> Vec<Range<usize>> {
        partition(len, workers(w)).into_iter().map(|c| c.range).collect()
    }

    #[test]
    fn uneven_split_shortens_last_chunk() {
        assert_eq!(ranges(10, 3), vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn more_workers_than_tasks_leaves_empty_chunks() {
        assert_eq!(ranges(2, 4), vec![0..1, 1..2, 2..2, 2..2]);
    }

    #[test]
    fn empty_input_yields_empty_chunks() {
        let chunks = partition(0, workers(3));
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(Chunk::is_empty));
    }

    #[test]
    fn chunks_cover_input_exactly_once() {
        for len in 0..64 {
            for w in 1..12 {
                let chunks = partition(len, workers(w));
                assert_eq!(chunks.len(), w, "len={len} w={w}");

                let mut next = 0;
                for (k, chunk) in chunks.iter().enumerate() {
                    assert_eq!(chunk.slot, k);
                    if chunk.is_empty() {
                        continue;
                    }
                    assert_eq!(chunk.range.start, next, "gap or overlap at len={len} w={w}");
                    next = chunk.range.end;
                }
                assert_eq!(next, len);
                assert_eq!(chunks.iter().map(Chunk::len).sum::<usize>(), len);
            }
        }
    }
}
