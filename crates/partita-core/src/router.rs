//! Deterministic key → partition routing.
//!
//! Integer keys route by value, text that spells an integer (of any width)
//! routes like that integer, and any other text routes by the sum of its character
//! codes. The result is taken modulo the partition count, which is fixed
//! for the life of the process.
//!
//! The character-code sum is not a uniform hash, and it ignores character
//! order. It stays as is: changing it would move existing records to
//! different partitions.

use std::num::NonZeroU32;

use crate::error::{PdalError, PdalResult};
use crate::model::{Key, PartitionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRouter {
    partitions: NonZeroU32,
}

impl PartitionRouter {
    pub fn new(partitions: u32) -> PdalResult<Self> {
        let partitions = NonZeroU32::new(partitions)
            .ok_or_else(|| PdalError::Config("partition count must be at least 1".to_string()))?;
        Ok(Self { partitions })
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.get()
    }

    /// The partition that owns `key`.
    pub fn route(&self, key: &Key) -> PartitionId {
        let n = self.partitions.get();
        let residue = match key {
            // rem_euclid keeps negative keys inside [0, n).
            Key::Integer(v) => v.rem_euclid(i64::from(n)) as u32,
            Key::Text(text) => match decimal_residue(text, n) {
                Some(r) => r,
                None => char_code_sum(text).rem_euclid(i64::from(n)) as u32,
            },
        };
        PartitionId(residue)
    }

    /// Every partition id, in order.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + use<> {
        (0..self.partitions.get()).map(PartitionId)
    }
}

/// `text mod n` when `text` spells a decimal integer of any width.
///
/// Digits are folded one at a time so keys wider than `i64` still route by
/// their numeric value.
fn decimal_residue(text: &str, n: u32) -> Option<u32> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.as_bytes().first()? {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n = u64::from(n);
    let r = digits
        .bytes()
        .fold(0u64, |acc, b| (acc * 10 + u64::from(b - b'0')) % n);
    let r = if negative { (n - r) % n } else { r };
    Some(r as u32)
}

/// Sum of the character codes of `text`, the routing value of non-numeric keys.
pub fn char_code_sum(text: &str) -> i64 {
    text.chars().fold(0i64, |acc, c| acc.wrapping_add(i64::from(u32::from(c))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_keys_route_by_modulo() {
        let router = PartitionRouter::new(2).unwrap();
        assert_eq!(router.route(&Key::Integer(1)), PartitionId(1));
        assert_eq!(router.route(&Key::Integer(2)), PartitionId(0));

        let router = PartitionRouter::new(7).unwrap();
        for k in 0..100i64 {
            assert_eq!(router.route(&Key::Integer(k)), PartitionId((k % 7) as u32));
        }
    }

    #[test]
    fn test_negative_keys_stay_in_range() {
        let router = PartitionRouter::new(3).unwrap();
        assert_eq!(router.route(&Key::Integer(-1)), PartitionId(2));
        assert!(router.route(&Key::Integer(i64::MIN)).0 < 3);
    }

    #[test]
    fn test_char_code_sum() {
        // 'a' = 97, 'b' = 98
        assert_eq!(char_code_sum("ab"), 195);
        assert_eq!(char_code_sum(""), 0);
    }

    #[test]
    fn test_decimal_residue() {
        assert_eq!(decimal_residue("42", 5), Some(2));
        assert_eq!(decimal_residue(" -1 ", 3), Some(2));
        assert_eq!(decimal_residue("+7", 7), Some(0));
        assert_eq!(decimal_residue("-", 3), None);
        assert_eq!(decimal_residue("12a", 3), None);
        assert_eq!(decimal_residue("", 3), None);
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert!(matches!(PartitionRouter::new(0), Err(PdalError::Config(_))));
    }

    #[test]
    fn test_partitions_iterates_all() {
        let router = PartitionRouter::new(3).unwrap();
        let ids: Vec<_> = router.partitions().collect();
        assert_eq!(ids, vec![PartitionId(0), PartitionId(1), PartitionId(2)]);
    }
}
