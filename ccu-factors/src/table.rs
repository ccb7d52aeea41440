//! Frequency/factor tables and the generic table search engine.
//!
//! Hardware families with an enumerable factor space ship a table of pre-encoded factor patterns
//! together with the resulting output frequency. Two search policies are supported:
//!
//! - [lookup_factors]: smallest table frequency which is not below the request. The table is
//!   treated as ascending and the search saturates at the last entry.
//! - [search_factors]: entry closest to the request inside a window of the table. The table does
//!   not need to be sorted.
//!
//! Both return the winning pattern already decoded with the clock's [FactorsLayout]. Table
//! patterns only carry the factor fields, the result is always in integer mode.
use crate::layout::{FactorValue, FactorsLayout};

/// One table entry: pre-encoded factor pattern and output frequency in Hz.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct FactorFreq {
    pub factor: u32,
    pub freq: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<FactorFreq>(), 8);

impl FactorFreq {
    pub const fn new(factor: u32, freq: u32) -> Self {
        Self { factor, freq }
    }

    /// Create an entry by packing the factors with the given layout.
    pub const fn from_factors(layout: &FactorsLayout, value: &FactorValue, freq: u32) -> Self {
        Self::new(layout.encode(value, 0), freq)
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SearchError {
    #[error("frequency table is empty")]
    EmptyTable,
    #[error("start index {index} out of range for table with {len} entries")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("search window is empty")]
    EmptyRange,
}

/// Result of a table search.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TableMatch {
    /// Table index of the winning entry.
    pub index: usize,
    /// Output frequency of the winning entry in Hz.
    pub freq: u32,
    pub factors: FactorValue,
}

impl TableMatch {
    fn new(layout: &FactorsLayout, table: &[FactorFreq], index: usize) -> Self {
        let entry = table[index];
        Self {
            index,
            freq: entry.freq,
            factors: layout.decode_factors(entry.factor),
        }
    }
}

fn check_start(table: &[FactorFreq], index: usize) -> Result<(), SearchError> {
    if table.is_empty() {
        return Err(SearchError::EmptyTable);
    }
    if index >= table.len() {
        return Err(SearchError::IndexOutOfRange {
            index,
            len: table.len(),
        });
    }
    Ok(())
}

/// Linear scan starting at `index` for the first entry whose frequency is not below `freq`.
///
/// If no entry qualifies, the last table entry is returned.
pub fn lookup_factors(
    layout: &FactorsLayout,
    table: &[FactorFreq],
    index: usize,
    freq: u32,
) -> Result<TableMatch, SearchError> {
    check_start(table, index)?;
    let found = table[index..]
        .iter()
        .position(|entry| entry.freq >= freq)
        .map(|pos| index + pos)
        .unwrap_or(table.len() - 1);
    Ok(TableMatch::new(layout, table, found))
}

/// Search the window `[index, index + count)` for the entry closest to `freq`.
///
/// The window is clamped to the table length. On equal distance, the entry with the lower index
/// wins.
pub fn search_factors(
    layout: &FactorsLayout,
    table: &[FactorFreq],
    index: usize,
    count: usize,
    freq: u32,
) -> Result<TableMatch, SearchError> {
    check_start(table, index)?;
    let end = index.saturating_add(count).min(table.len());
    if end == index {
        return Err(SearchError::EmptyRange);
    }
    let mut best = index;
    let mut best_distance = table[index].freq.abs_diff(freq);
    for (pos, entry) in table[index + 1..end].iter().enumerate() {
        let distance = entry.freq.abs_diff(freq);
        if distance < best_distance {
            best = index + 1 + pos;
            best_distance = distance;
        }
    }
    Ok(TableMatch::new(layout, table, best))
}

/// Find the entry whose factor pattern matches the factor fields of a raw register word.
///
/// Only the bits covered by the factor fields of the layout are compared.
pub fn lookup_freq<'a>(
    layout: &FactorsLayout,
    table: &'a [FactorFreq],
    raw: u32,
) -> Option<&'a FactorFreq> {
    let mask = layout.factor_mask();
    table
        .iter()
        .find(|entry| entry.factor & mask == raw & mask)
}
