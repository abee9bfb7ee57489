use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::{PrivilegeLevel, RawPrivilegeLevel};

// Mask to be applied to mstatus to get sstatus: SIE, SPIE, SPP, SUM, MXR.
const SSTATUS_MASK: u32 = 0x000C_0122;

/// Provides the mstatus register and its sstatus projection.
///
/// > The mstatus register keeps track of and controls the hart's current operating state. A
/// > restricted view of mstatus appears as the sstatus register in the S-level ISA.
///
/// The two views share this single backing word; sstatus reads are masked to the S-visible
/// fields, and sstatus writes can only touch those fields.
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u32,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        let mut status = Self { mstatus: 0 };
        // The boot contract starts the hart as if it had trapped into M-mode.
        status.set_mpp(RawPrivilegeLevel::Machine);
        status
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    /// Sets the MIE (M-mode Interrupt Enable) bit to `value`.
    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    /// Sets the SIE (S-mode Interrupt Enable) bit to `value`.
    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    /// Sets the MPIE (M-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is set.
    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    /// Sets the SPIE (S-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// Returns the privilege level encoded by the MPP (M-mode Previous Privilege level) field.
    ///
    /// The MPP field is **WARL**.
    pub fn mpp(&self) -> PrivilegeLevel {
        RawPrivilegeLevel::from_u2(
            self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le(),
        )
        .try_into()
        .unwrap()
    }

    /// Sets the privilege level encoded by the MPP (M-mode Previous Privilege level) field to
    /// `value`.
    ///
    /// The MPP field is **WARL**.
    pub fn set_mpp(&mut self, value: RawPrivilegeLevel) {
        let Ok(value) = PrivilegeLevel::try_from(value) else {
            // MPP is a WARL field, so ignore the reserved encoding.
            return;
        };
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..(idx::MPP + 2)].store_le(value as u8);
    }

    /// Returns the privilege level encoded by the SPP (S-mode Previous Privilege level) field.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.mstatus.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    /// Sets the privilege level encoded by the SPP (S-mode Previous Privilege level) field to
    /// `value`.
    ///
    /// The SPP field is **WARL**; M-mode cannot be encoded and is ignored.
    pub fn set_spp(&mut self, value: RawPrivilegeLevel) {
        match PrivilegeLevel::try_from(value) {
            Ok(value) if value <= PrivilegeLevel::Supervisor => {
                let bit = value == PrivilegeLevel::Supervisor;
                self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPP, bit);
            }
            _ => {} // SPP is a WARL field, so ignore illegal values.
        };
    }

    /// Returns `true` if the SUM (permit Supervisor User Memory access) bit is set.
    pub fn sum(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SUM]
    }

    /// Sets the SUM (permit Supervisor User Memory access) bit to `value`.
    pub fn set_sum(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SUM, value);
    }

    /// Returns `true` if the MXR (Make eXecutable Readable) bit is set.
    pub fn mxr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MXR]
    }

    /// Sets the MXR (Make eXecutable Readable) bit to `value`.
    pub fn set_mxr(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MXR, value);
    }

    /// Reads the mstatus register as a whole word.
    pub fn read_mstatus(&self) -> u32 {
        self.mstatus
    }

    /// Writes the bits of `value` selected by `mask` to the mstatus register.
    ///
    /// Fields are updated through their setters so WARL fields are treated correctly; WPRI bits
    /// are ignored.
    pub fn write_mstatus(&mut self, value: u32, mask: u32) {
        let mask_bits = mask.view_bits::<Lsb0>();
        let updated = self.mstatus & !mask | value & mask;
        let updated_bits = updated.view_bits::<Lsb0>();

        if mask_bits[idx::SIE] {
            self.set_sie(updated_bits[idx::SIE]);
        }
        if mask_bits[idx::MIE] {
            self.set_mie(updated_bits[idx::MIE]);
        }
        if mask_bits[idx::SPIE] {
            self.set_spie(updated_bits[idx::SPIE]);
        }
        if mask_bits[idx::MPIE] {
            self.set_mpie(updated_bits[idx::MPIE]);
        }
        if mask_bits[idx::SPP] {
            self.set_spp(RawPrivilegeLevel::from_u2(updated_bits[idx::SPP] as u8));
        }
        if mask_bits[idx::MPP] | mask_bits[idx::MPP + 1] {
            self.set_mpp(RawPrivilegeLevel::from_u2(
                updated_bits[idx::MPP..(idx::MPP + 2)].load_le(),
            ));
        }
        if mask_bits[idx::SUM] {
            self.set_sum(updated_bits[idx::SUM]);
        }
        if mask_bits[idx::MXR] {
            self.set_mxr(updated_bits[idx::MXR]);
        }
    }

    /// Reads the sstatus view: mstatus masked to the S-visible fields.
    pub fn read_sstatus(&self) -> u32 {
        self.mstatus & SSTATUS_MASK
    }

    /// Writes through the sstatus view, which can only touch the S-visible fields.
    pub fn write_sstatus(&mut self, value: u32, mask: u32) {
        self.write_mstatus(value, mask & SSTATUS_MASK);
    }
}

/// Bit indices into the mstatus register.
mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_state() {
        let status = Status::new();
        assert_eq!(status.mpp(), PrivilegeLevel::Machine);
        assert!(!status.mie());
        assert!(!status.sie());
    }

    #[test]
    fn test_sstatus_is_masked_view() {
        let mut status = Status::new();
        status.set_mie(true);
        status.set_sie(true);
        status.set_sum(true);
        let sstatus = status.read_sstatus();
        // SIE and SUM show through; MIE and MPP do not.
        assert_eq!(sstatus, (1 << 1) | (1 << 18));

        // Writing MIE through sstatus has no effect.
        status.write_sstatus(0, 1 << 3);
        assert!(status.mie());
        // Writing SIE through sstatus does.
        status.write_sstatus(0, 1 << 1);
        assert!(!status.sie());
    }

    #[test]
    fn test_mpp_warl() {
        let mut status = Status::new();
        // The reserved encoding 0b10 must be ignored.
        status.write_mstatus(0b10 << 11, 0b11 << 11);
        assert_eq!(status.mpp(), PrivilegeLevel::Machine);
        status.write_mstatus(0b01 << 11, 0b11 << 11);
        assert_eq!(status.mpp(), PrivilegeLevel::Supervisor);
    }
}
