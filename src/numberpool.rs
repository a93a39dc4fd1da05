//! Free Number Allocation
//!
//! Finds the smallest unused number of an inclusive range, given the sorted
//! list of numbers already in use. Used for DRBD node ids, TCP ports, minor
//! numbers and volume numbers.

use crate::error::{Error, Result};

/// Returns the smallest number in `[min, max]` that is not in `occupied`.
/// `occupied` must be sorted ascending and free of duplicates; numbers
/// outside of the range are ignored.
pub fn get_free_number(occupied: &[i64], min: i64, max: i64) -> Result<i64> {
    if min > max {
        return Err(Error::PoolExhausted { min, max });
    }
    let start = occupied.partition_point(|&nr| nr < min);
    let in_range = &occupied[start..occupied.partition_point(|&nr| nr <= max)];

    // in_range[i] == min + i holds for every index before the first gap
    let (mut low, mut high) = (0usize, in_range.len());
    while low < high {
        let mid = low + (high - low) / 2;
        if in_range[mid] == min + mid as i64 {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    let candidate = min + low as i64;
    if candidate > max {
        return Err(Error::PoolExhausted { min, max });
    }
    Ok(candidate)
}

/// Sorts and deduplicates numbers collected from the live graph
pub fn sorted_numbers(numbers: impl IntoIterator<Item = i64>) -> Vec<i64> {
    let mut numbers: Vec<i64> = numbers.into_iter().collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
}
