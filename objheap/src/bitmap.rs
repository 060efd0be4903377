/// Fixed-length bitmap backed by 64-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Box<[u64]>,
    len: usize,
}

const WORD_BITS: usize = 64;

impl Bitmap {
    pub fn new(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(WORD_BITS)];
        Self {
            words: words.into_boxed_slice(),
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len, "bit {index} out of {}", self.len);
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len, "bit {index} out of {}", self.len);
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }

    /// Sets the bit and returns its previous value.
    #[inline]
    pub fn test_and_set(&mut self, index: usize) -> bool {
        let was = self.get(index);
        self.set(index);
        was
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// First set bit in `start..end`.
    pub fn next_set(&self, start: usize, end: usize) -> Option<usize> {
        let end = end.min(self.len);
        let mut index = start;
        while index < end {
            let word_idx = index / WORD_BITS;
            let bit = index % WORD_BITS;
            let word = self.words[word_idx] >> bit;
            if word != 0 {
                let found = index + word.trailing_zeros() as usize;
                return (found < end).then_some(found);
            }
            index = (word_idx + 1) * WORD_BITS;
        }
        None
    }

    /// Last set bit in `start..=from`, scanning backwards.
    pub fn prev_set(&self, from: usize, start: usize) -> Option<usize> {
        if self.len == 0 || from < start {
            return None;
        }
        let mut index = from.min(self.len - 1) as isize;
        let start = start as isize;
        while index >= start {
            let word_idx = index as usize / WORD_BITS;
            let bit = index as usize % WORD_BITS;
            let word = self.words[word_idx] << (WORD_BITS - 1 - bit);
            if word != 0 {
                let found = index - word.leading_zeros() as isize;
                return (found >= start).then_some(found as usize);
            }
            index = (word_idx * WORD_BITS) as isize - 1;
        }
        None
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = 0;
        std::iter::from_fn(move || {
            let found = self.next_set(next, self.len)?;
            next = found + 1;
            Some(found)
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 8);
        for word in self.words.iter() {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Rebuilds a bitmap of `len` bits from [`Bitmap::to_bytes`] output.
    /// Missing trailing bytes read as zero.
    pub fn from_bytes(len: usize, bytes: &[u8]) -> Self {
        let mut bitmap = Self::new(len);
        for (word, chunk) in bitmap.words.iter_mut().zip(bytes.chunks(8)) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        bitmap
    }
}
