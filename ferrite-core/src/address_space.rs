//! Physical address space fabric.
//!
//! The fabric is a flat, non-overlapping composition of regions over the 32-bit physical address
//! space. Each region is backed either by a plain byte buffer (RAM, flash) or by a memory-mapped
//! device. Accesses are routed to the containing region; accesses that touch no region, or that
//! are not fully contained in a single region, fail with [`InvalidAddress`].
//!
//! The fabric also owns the hart's load reservation for LR.W/SC.W, since it is the only component
//! that observes every store.

use crate::address_map::{AddressMap, AddressMapError};
use crate::AddressRange;
use std::fmt::Debug;
use thiserror::Error;

/// Interface of a memory-mapped peripheral attached to the address space.
///
/// Offsets are relative to the start of the region the device is mapped at. Reads may have side
/// effects visible only through subsequent reads; nothing above the device may cache its
/// registers. All multi-byte values are little-endian.
pub trait MmioDevice: Debug {
    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&mut self, buf: &mut [u8], offset: u32);

    /// Write `buf` starting at `offset`.
    fn write(&mut self, offset: u32, buf: &[u8]);
}

/// Backing storage of a single region of the address space.
#[derive(Debug)]
pub enum Region {
    /// Plain bytes, served directly by the fabric.
    Buffer(Vec<u8>),
    /// A device; all accesses are delegated to it.
    Device(Box<dyn MmioDevice>),
}

/// Access to an address that no region claims, or that is not fully contained in one region.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
#[error("unhandled physical access at {0:#010x}")]
pub struct InvalidAddress(pub u32);

/// The load reservation installed by LR.W.
///
/// SC.W succeeds iff the word currently in memory at `address` still equals `value`. This is the
/// value-snapshot form of the reservation; see also [`AddressSpace::write`], which drops the
/// reservation eagerly when a store hits the reserved word.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Reservation {
    address: u32,
    value: u32,
}

/// The composed physical address space of a machine.
#[derive(Debug)]
pub struct AddressSpace {
    map: AddressMap<usize>,
    regions: Vec<(AddressRange, Region)>,
    reservation: Option<Reservation>,
}

macro_rules! access_fns {
    ( $( $read_fn:ident, $write_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Little-endian typed read at `address`.
            pub fn $read_fn(&mut self, address: u32) -> Result<$u, InvalidAddress> {
                let mut buf = [0u8; std::mem::size_of::<$u>()];
                self.read(&mut buf, address)?;
                Ok($u::from_le_bytes(buf))
            }

            /// Little-endian typed write at `address`.
            pub fn $write_fn(&mut self, address: u32, value: $u) -> Result<(), InvalidAddress> {
                self.write(address, &value.to_le_bytes())
            }
        )*
    };
}

impl AddressSpace {
    /// Compose an address space from `(range, region)` pairs.
    ///
    /// The ranges must not overlap, and the length of every buffer region must equal the size of
    /// its range.
    pub fn new(regions: Vec<(AddressRange, Region)>) -> Result<Self, CompositionError> {
        for (range, region) in &regions {
            if let Region::Buffer(bytes) = region {
                if range.size() != Some(bytes.len()) {
                    return Err(CompositionError::BufferSizeMismatch(*range));
                }
            }
        }
        let map = AddressMap::try_from(
            regions
                .iter()
                .enumerate()
                .map(|(index, (range, _))| (*range, index))
                .collect::<Vec<_>>(),
        )?;
        Ok(Self {
            map,
            regions,
            reservation: None,
        })
    }

    /// Resolve `address` to its containing region, checking that the whole `(address, size)`
    /// access fits inside it.
    fn resolve(&self, address: u32, size: usize) -> Result<usize, InvalidAddress> {
        let (range, index) = self.map.range_value(address);
        let Some(&index) = index else {
            return Err(InvalidAddress(address));
        };
        let fits = size
            .checked_sub(1)
            .and_then(|delta| u32::try_from(delta).ok())
            .map(|delta| delta <= range.end() - address)
            .unwrap_or(size == 0);
        if !fits {
            return Err(InvalidAddress(address));
        }
        Ok(index)
    }

    /// Read `buf.len()` bytes starting at physical `address`.
    pub fn read(&mut self, buf: &mut [u8], address: u32) -> Result<(), InvalidAddress> {
        let index = self.resolve(address, buf.len())?;
        let (range, region) = &mut self.regions[index];
        let offset = address - range.start();
        match region {
            Region::Buffer(bytes) => {
                const_assert!(usize::BITS >= 32);
                let offset = offset as usize;
                buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
            }
            Region::Device(device) => device.read(buf, offset),
        }
        Ok(())
    }

    /// Write `buf` starting at physical `address`.
    ///
    /// A store that overlaps the word a reservation was installed on drops the reservation.
    pub fn write(&mut self, address: u32, buf: &[u8]) -> Result<(), InvalidAddress> {
        let index = self.resolve(address, buf.len())?;
        if let Some(reservation) = self.reservation {
            let end = address.wrapping_add(buf.len() as u32);
            let overlaps = address < reservation.address.wrapping_add(4)
                && reservation.address < end
                && !buf.is_empty();
            if overlaps {
                self.reservation = None;
            }
        }
        let (range, region) = &mut self.regions[index];
        let offset = address - range.start();
        match region {
            Region::Buffer(bytes) => {
                const_assert!(usize::BITS >= 32);
                let offset = offset as usize;
                bytes[offset..offset + buf.len()].copy_from_slice(buf);
            }
            Region::Device(device) => device.write(offset, buf),
        }
        Ok(())
    }

    access_fns! {
        read_u8, write_u8 => u8,
        read_u16, write_u16 => u16,
        read_u32, write_u32 => u32,
        read_u64, write_u64 => u64,
    }

    /// Install a load reservation on the word at `address`, remembering the value loaded from it.
    pub fn set_reservation(&mut self, address: u32, value: u32) {
        self.reservation = Some(Reservation { address, value });
    }

    /// Returns the current reservation as `(address, value)`, if any.
    pub fn reservation(&self) -> Option<(u32, u32)> {
        self.reservation
            .map(|reservation| (reservation.address, reservation.value))
    }

    /// Drop the current reservation. SC.W always does this, whether it succeeded or not.
    pub fn clear_reservation(&mut self) {
        self.reservation = None;
    }
}

#[derive(Error, Debug)]
pub enum CompositionError {
    #[error(transparent)]
    Map(#[from] AddressMapError),
    #[error("buffer length does not match region size for range {0}")]
    BufferSizeMismatch(AddressRange),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range;

    fn ram_space() -> AddressSpace {
        AddressSpace::new(vec![(
            address_range![0x8000_0000, 0x8000_0FFF],
            Region::Buffer(vec![0; 0x1000]),
        )])
        .unwrap()
    }

    #[derive(Debug)]
    struct Echo {
        last_write: u8,
    }

    impl MmioDevice for Echo {
        fn read(&mut self, buf: &mut [u8], offset: u32) {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = self.last_write.wrapping_add(offset as u8 + i as u8);
            }
        }

        fn write(&mut self, _offset: u32, buf: &[u8]) {
            if let Some(&byte) = buf.last() {
                self.last_write = byte;
            }
        }
    }

    #[test]
    fn test_buffer_round_trip() {
        let mut space = ram_space();
        space.write_u32(0x8000_0010, 0xDEAD_BEEF).unwrap();
        assert_eq!(space.read_u32(0x8000_0010).unwrap(), 0xDEAD_BEEF);
        // Little-endian byte order.
        assert_eq!(space.read_u8(0x8000_0010).unwrap(), 0xEF);
        assert_eq!(space.read_u8(0x8000_0013).unwrap(), 0xDE);
    }

    #[test]
    fn test_unmapped_access() {
        let mut space = ram_space();
        assert_eq!(space.read_u32(0x4000_0000), Err(InvalidAddress(0x4000_0000)));
        assert_eq!(space.write_u8(0, 0), Err(InvalidAddress(0)));
        // An access that starts in a region but runs past its end is also rejected.
        assert_eq!(
            space.read_u32(0x8000_0FFE),
            Err(InvalidAddress(0x8000_0FFE))
        );
    }

    #[test]
    fn test_device_dispatch() {
        let mut space = AddressSpace::new(vec![(
            address_range![0x1000_0000, 0x1000_00FF],
            Region::Device(Box::new(Echo { last_write: 0 })),
        )])
        .unwrap();
        space.write_u8(0x1000_0000, 7).unwrap();
        // The device sees offsets relative to its base.
        assert_eq!(space.read_u8(0x1000_0002).unwrap(), 9);
    }

    #[test]
    fn test_store_drops_reservation() {
        let mut space = ram_space();
        space.set_reservation(0x8000_0100, 0);
        space.write_u8(0x8000_0103, 0xFF).unwrap();
        assert_eq!(space.reservation(), None);

        space.set_reservation(0x8000_0100, 0);
        space.write_u32(0x8000_0104, 1).unwrap();
        assert_eq!(space.reservation(), Some((0x8000_0100, 0)));
    }
}
