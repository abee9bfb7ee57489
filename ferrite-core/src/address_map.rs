use crate::{address_range, AddressRange};
use std::cmp::Ordering;
use thiserror::Error;

/// Generic map of 32-bit address ranges to values of type `T`.
///
/// The ranges cannot overlap. Vacant gaps between ranges are allowed.
#[derive(Debug)]
pub struct AddressMap<T> {
    ordered_ranges: Vec<(AddressRange, T)>,
}

impl<T> Default for AddressMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AddressMap<T> {
    /// Create new empty map.
    pub fn new() -> Self {
        Self {
            ordered_ranges: Vec::new(),
        }
    }

    /// Returns the value that the address range containing `address` maps to, or `None` if that
    /// address range is vacant.
    pub fn value(&self, address: u32) -> Option<&T> {
        self.range_value(address).1
    }

    /// Returns the address range that contains `address`, and the value that it maps to.
    ///
    /// The second item will be `None` if `address` is in a vacant region. In that case the
    /// returned range is the maximal vacant range around `address`.
    pub fn range_value(&self, address: u32) -> (AddressRange, Option<&T>) {
        match self.ordered_ranges.binary_search_by(|(range, _)| {
            if address < range.start() {
                Ordering::Greater
            } else if address <= range.end() {
                Ordering::Equal
            } else {
                Ordering::Less
            }
        }) {
            Ok(index) => {
                let (range, value) = &self.ordered_ranges[index];
                (*range, Some(value))
            }
            Err(index) => {
                let start = index
                    .checked_sub(1)
                    .and_then(|i| self.ordered_ranges.get(i))
                    // The addition cannot overflow, since that would mean
                    // `range.end() == u32::MAX`, which is impossible given `address > range.end()`
                    // according to the binary search.
                    .map(|(range, _)| range.end() + 1)
                    .unwrap_or(0);
                let end = self
                    .ordered_ranges
                    .get(index)
                    // The subtraction cannot underflow, since that would mean
                    // `range.start() == 0`, which is impossible given `address < range.start()`
                    // according to the binary search.
                    .map(|(range, _)| range.start() - 1)
                    .unwrap_or(u32::MAX);
                (address_range![start, end], None)
            }
        }
    }
}

impl<T> TryFrom<Vec<(AddressRange, T)>> for AddressMap<T> {
    type Error = AddressMapError;

    fn try_from(mut value: Vec<(AddressRange, T)>) -> Result<Self, Self::Error> {
        value.sort_by_key(|(range, _)| range.start());

        let mut iter = value.iter();
        if let Some((mut prev_range, _)) = iter.next() {
            for &(range, _) in iter {
                if range.start() <= prev_range.end() {
                    return Err(AddressMapError::OverlappingAddressRanges);
                }
                prev_range = range;
            }
        }

        Ok(Self {
            ordered_ranges: value,
        })
    }
}

#[derive(Error, Debug)]
pub enum AddressMapError {
    /// Attempt to add an address range that overlaps with a previously added address range.
    #[error("address range overlaps with previously added address range")]
    OverlappingAddressRanges,
}

#[macro_export]
macro_rules! addr_map {
    ($([$start:expr, $end:expr] => $value:expr,)*) => {
        $crate::address_map::AddressMap::try_from(vec![
            $(($crate::address_range![$start, $end], $value)),*
        ]).unwrap()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let map = addr_map! {
            [0x1000, 0x1FFF] => "a",
            [0x4000, 0x7FFF] => "b",
        };
        assert_eq!(map.value(0x0FFF), None);
        assert_eq!(map.value(0x1000), Some(&"a"));
        assert_eq!(map.value(0x1FFF), Some(&"a"));
        assert_eq!(map.value(0x2000), None);
        assert_eq!(map.value(0x4500), Some(&"b"));
        assert_eq!(map.value(u32::MAX), None);
    }

    #[test]
    fn test_vacant_range() {
        let map = addr_map! {
            [0x1000, 0x1FFF] => (),
        };
        let (range, value) = map.range_value(0x3000);
        assert!(value.is_none());
        assert_eq!(range.start(), 0x2000);
        assert_eq!(range.end(), u32::MAX);
    }

    #[test]
    fn test_overlap_rejected() {
        let ranges = vec![
            (address_range![0x1000, 0x2FFF], ()),
            (address_range![0x2000, 0x3FFF], ()),
        ];
        assert!(AddressMap::try_from(ranges).is_err());
    }
}
