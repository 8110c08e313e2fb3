//! Placement policies used to pick a free block for a request.

use core::fmt;
use core::str::FromStr;

use tracing::trace;

use crate::block::{Block, Chain};
use crate::freelist::Freelist;

/// How the free list is searched for a block that can hold a request.
///
/// All policies walk the explicit free list, never the allocated blocks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FitStrategy {
    /// Take the first listed block that is large enough.
    #[default]
    FirstFit,
    /// Like first fit, but resume where the previous search stopped and wrap around once.
    /// Cheaper for runs of similar requests at the cost of more fragmentation near the tail.
    NextFit,
    /// Take the smallest block that is large enough; ties go to the one seen first.
    BestFit,
}

impl FitStrategy {
    /// Searches `list` for a block of at least `size` bytes.
    ///
    /// # Safety
    /// `list` must be a consistent free list over `chain`.
    pub(crate) unsafe fn find(self, list: &mut Freelist, chain: &Chain, size: u32) -> Option<Block> {
        if list.is_empty() {
            return None;
        }
        match self {
            FitStrategy::FirstFit => first_fit(list, chain, list.head(), None, size),
            FitStrategy::NextFit => next_fit(list, chain, size),
            FitStrategy::BestFit => best_fit(list, chain, size),
        }
    }
}

/// Scans from `from` until the end of the list or until `until` is reached.
unsafe fn first_fit(
    list: &Freelist,
    chain: &Chain,
    from: Option<Block>,
    until: Option<Block>,
    size: u32,
) -> Option<Block> {
    let mut p = from;
    while let Some(block) = p {
        if Some(block) == until {
            break;
        }
        let block_size = chain.header(block).size();
        trace!(?block, block_size, "Visiting free block.");
        if block_size >= size {
            return Some(block);
        }
        p = list.next(chain, block);
    }
    None
}

unsafe fn next_fit(list: &mut Freelist, chain: &Chain, size: u32) -> Option<Block> {
    let start = list.rover().or(list.head());
    let found = match first_fit(list, chain, start, None, size) {
        Some(block) => Some(block),
        None if start != list.head() => first_fit(list, chain, list.head(), start, size),
        None => None,
    };
    if found.is_some() {
        list.set_rover(found);
    }
    found
}

unsafe fn best_fit(list: &Freelist, chain: &Chain, size: u32) -> Option<Block> {
    let mut best: Option<(Block, u32)> = None;
    let mut p = list.head();
    while let Some(block) = p {
        let block_size = chain.header(block).size();
        if block_size >= size && best.map_or(true, |(_, best_size)| block_size < best_size) {
            best = Some((block, block_size));
            if block_size == size {
                break;
            }
        }
        p = list.next(chain, block);
    }
    best.map(|(block, _)| block)
}

impl fmt::Display for FitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FitStrategy::FirstFit => "first",
            FitStrategy::NextFit => "next",
            FitStrategy::BestFit => "best",
        })
    }
}

/// Returned when a string names no known [`FitStrategy`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownStrategy(pub String);

impl fmt::Display for UnknownStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown fit strategy {:?}, expected first, next or best", self.0)
    }
}

impl std::error::Error for UnknownStrategy {}

impl FromStr for FitStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-fit" | "first_fit" => Ok(FitStrategy::FirstFit),
            "next" | "next-fit" | "next_fit" => Ok(FitStrategy::NextFit),
            "best" | "best-fit" | "best_fit" => Ok(FitStrategy::BestFit),
            _ => Err(UnknownStrategy(s.to_owned())),
        }
    }
}
