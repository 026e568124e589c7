// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue identifier bookkeeping.

use crate::Error;

/// Queue identifiers are below this value.
pub const MAX_QID: u16 = 0xffff;

const BITS_PER_WORD: usize = 64;
const WORDS: usize = (MAX_QID as usize).div_ceil(BITS_PER_WORD);

/// Tracks which queue identifiers are in use. QID 0 is the admin queue and
/// is reserved from construction.
#[derive(Clone)]
pub struct QidBitmap {
    words: Box<[u64; WORDS]>,
}

impl std::fmt::Debug for QidBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QidBitmap")
            .field(
                "allocated",
                &self.words.iter().map(|w| w.count_ones()).sum::<u32>(),
            )
            .finish()
    }
}

impl Default for QidBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl QidBitmap {
    pub fn new() -> Self {
        let mut words = Box::new([0; WORDS]);
        words[0] = 1;
        Self { words }
    }

    fn check(qid: u16) -> Result<(usize, u64), Error> {
        if qid >= MAX_QID {
            return Err(Error::InvalidArgument("queue identifier out of range"));
        }
        let qid = qid as usize;
        Ok((qid / BITS_PER_WORD, 1 << (qid % BITS_PER_WORD)))
    }

    pub fn is_allocated(&self, qid: u16) -> Result<bool, Error> {
        let (word, bit) = Self::check(qid)?;
        Ok(self.words[word] & bit != 0)
    }

    pub fn alloc(&mut self, qid: u16) -> Result<(), Error> {
        let (word, bit) = Self::check(qid)?;
        self.words[word] |= bit;
        Ok(())
    }

    pub fn free(&mut self, qid: u16) -> Result<(), Error> {
        if qid == 0 {
            return Err(Error::InvalidArgument("the admin queue identifier is reserved"));
        }
        let (word, bit) = Self::check(qid)?;
        self.words[word] &= !bit;
        Ok(())
    }

    /// Returns the lowest unallocated identifier without allocating it.
    pub fn find_free(&self) -> Result<u16, Error> {
        self.words
            .iter()
            .enumerate()
            .find(|&(_, &w)| w != u64::MAX)
            .map(|(i, w)| i * BITS_PER_WORD + w.trailing_ones() as usize)
            .filter(|&qid| qid < MAX_QID as usize)
            .map(|qid| qid as u16)
            .ok_or(Error::ResourceExhausted("queue identifier"))
    }
}
