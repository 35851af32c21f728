//! Level-1 page bitmap: one bit per page, 1 = allocated.

/// Growable bitmap over page indices
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageBitmap {
    words: Vec<u64>,
    len: u64,
    set_count: u64,
}

impl PageBitmap {
    /// A bitmap of `len` pages, all clear
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; words_for(len)],
            len,
            set_count: 0,
        }
    }

    /// Rebuild from persisted words; bits beyond `len` are ignored
    pub fn from_words(mut words: Vec<u64>, len: u64) -> Self {
        words.resize(words_for(len), 0);
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        let set_count = words.iter().map(|w| w.count_ones() as u64).sum();
        Self { words, len, set_count }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Number of pages tracked
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set (allocated) bits
    pub fn count_set(&self) -> u64 {
        self.set_count
    }

    /// Extend to `new_len` pages; new pages are clear
    pub fn grow(&mut self, new_len: u64) {
        if new_len > self.len {
            self.words.resize(words_for(new_len), 0);
            self.len = new_len;
        }
    }

    pub fn is_set(&self, page: u64) -> bool {
        if page >= self.len {
            return false;
        }
        self.words[(page / 64) as usize] & (1u64 << (page % 64)) != 0
    }

    /// Set a bit, returning true if it was clear
    pub fn set(&mut self, page: u64) -> bool {
        debug_assert!(page < self.len);
        let word = &mut self.words[(page / 64) as usize];
        let mask = 1u64 << (page % 64);
        if *word & mask == 0 {
            *word |= mask;
            self.set_count += 1;
            true
        } else {
            false
        }
    }

    /// Clear a bit, returning true if it was set
    pub fn clear(&mut self, page: u64) -> bool {
        debug_assert!(page < self.len);
        let word = &mut self.words[(page / 64) as usize];
        let mask = 1u64 << (page % 64);
        if *word & mask != 0 {
            *word &= !mask;
            self.set_count -= 1;
            true
        } else {
            false
        }
    }

    /// Set `[start, start+count)`, returning how many bits changed
    pub fn set_range(&mut self, start: u64, count: u64) -> u64 {
        (start..start + count).filter(|&p| self.set(p)).count() as u64
    }

    /// Clear `[start, start+count)`, returning how many bits changed
    pub fn clear_range(&mut self, start: u64, count: u64) -> u64 {
        (start..start + count).filter(|&p| self.clear(p)).count() as u64
    }

    /// True when every page in the range is clear
    pub fn range_clear(&self, start: u64, count: u64) -> bool {
        (start..start + count).all(|p| !self.is_set(p))
    }

    /// Maximal runs of clear bits as `(start, len)`
    pub fn clear_runs(&self) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        let mut run_start = None;
        for page in 0..self.len {
            match (self.is_set(page), run_start) {
                (false, None) => run_start = Some(page),
                (true, Some(start)) => {
                    runs.push((start, page - start));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            runs.push((start, self.len - start));
        }
        runs
    }
}

fn words_for(len: u64) -> usize {
    len.div_ceil(64) as usize
}
