use bitvec::{array::BitArray, field::BitField, order::Lsb0, view::BitView};

use super::Interrupt;

const SUPERVISOR_TIMER_INTERRUPT: usize = Interrupt::SupervisorTimer as usize;
const MACHINE_TIMER_INTERRUPT: usize = Interrupt::MachineTimer as usize;

#[allow(clippy::identity_op)]
const VALID_INTERRUPTS_MASK: u16 = 0
    | (1 << SUPERVISOR_TIMER_INTERRUPT)
    | (1 << MACHINE_TIMER_INTERRUPT);

/// Only the supervisor timer interrupt can be delegated; the machine timer interrupt always
/// traps to M-mode.
const DELEGATABLE_INTERRUPTS_MASK: u16 = 1 << SUPERVISOR_TIMER_INTERRUPT;

/// The interrupt-pending/enable/delegation CSRs (mip, mie, mideleg).
///
/// Only the two timer interrupts exist in this model. The sip and sie registers are not separate
/// storage: they are the mip/mie bits masked by mideleg, so an interrupt shows up in the S-view
/// exactly when its handling is delegated to S-mode.
#[derive(Debug, Clone)]
pub struct Interrupts {
    /// For each bit index matching an interrupt's code, whether handling that interrupt is
    /// delegated to S-mode (when not taken in M-mode).
    delegate: BitArray<[u16; 1], Lsb0>,
    mip: BitArray<[u16; 1], Lsb0>,
    mie: BitArray<[u16; 1], Lsb0>,
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupts {
    pub fn new() -> Self {
        Self {
            delegate: BitArray::new([0x0000]),
            mip: BitArray::new([0x0000]),
            mie: BitArray::new([0x0000]),
        }
    }

    pub fn should_delegate(&self, interrupt: Interrupt) -> bool {
        self.delegate[interrupt as usize]
    }

    /// Latch the M-level timer-interrupt-pending bit (MTIP).
    ///
    /// Driven at every timer poll from the `mtime >= mtimecmp` comparison; not writable by guest
    /// software.
    pub fn set_m_timer(&mut self, value: bool) {
        self.mip.set(MACHINE_TIMER_INTERRUPT, value);
    }

    pub fn mtip(&self) -> bool {
        self.mip[MACHINE_TIMER_INTERRUPT]
    }

    pub fn mtie(&self) -> bool {
        self.mie[MACHINE_TIMER_INTERRUPT]
    }

    pub fn stip(&self) -> bool {
        self.mip[SUPERVISOR_TIMER_INTERRUPT]
    }

    pub fn stie(&self) -> bool {
        self.mie[SUPERVISOR_TIMER_INTERRUPT]
    }

    pub fn read_mideleg(&self) -> u32 {
        self.delegate.load_le()
    }

    /// The mideleg register is **WARL**; only delegatable bits stick.
    pub fn write_mideleg(&mut self, value: u32, mask: u32) {
        let mask = mask as u16 & DELEGATABLE_INTERRUPTS_MASK;
        let updated = self.delegate.load_le::<u16>() & !mask | value as u16 & mask;
        self.delegate.store_le(updated);
    }

    pub fn read_mip(&self) -> u32 {
        self.mip.load_le()
    }

    /// Writes to MTIP are ignored: its value is managed by the timer poll. STIP is writable from
    /// M-mode, which is how an SBI implementation injects the supervisor timer interrupt.
    pub fn write_mip(&mut self, value: u32, mask: u32) {
        let mask = mask.view_bits::<Lsb0>();
        let value = value.view_bits::<Lsb0>();
        if mask[SUPERVISOR_TIMER_INTERRUPT] {
            self.mip
                .set(SUPERVISOR_TIMER_INTERRUPT, value[SUPERVISOR_TIMER_INTERRUPT]);
        }
    }

    pub fn read_mie(&self) -> u32 {
        self.mie.load_le()
    }

    pub fn write_mie(&mut self, value: u32, mask: u32) {
        let mask = mask as u16 & VALID_INTERRUPTS_MASK;
        let updated = self.mie.load_le::<u16>() & !mask | value as u16 & mask;
        self.mie.store_le(updated);
    }

    pub fn read_sip(&self) -> u32 {
        (self.mip & self.delegate).load_le()
    }

    /// STIP is read-only in sip (it can only be cleared by M-mode or by reprogramming the timer
    /// through an environment call), so sip writes are ignored.
    pub fn write_sip(&mut self, _value: u32, _mask: u32) {}

    pub fn read_sie(&self) -> u32 {
        (self.mie & self.delegate).load_le()
    }

    pub fn write_sie(&mut self, value: u32, mask: u32) {
        let delegate = self.delegate.load_le::<u16>();
        // Masking with `delegate` subsumes masking with VALID_INTERRUPTS_MASK.
        let mask = mask as u16 & delegate;
        let updated = self.mie.load_le::<u16>() & !mask | value as u16 & mask;
        self.mie.store_le(updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtip_not_guest_writable() {
        let mut interrupts = Interrupts::new();
        interrupts.write_mip(0xFFFF_FFFF, 0xFFFF_FFFF);
        assert!(!interrupts.mtip());
        assert!(interrupts.stip());
        interrupts.set_m_timer(true);
        assert!(interrupts.mtip());
        interrupts.write_mip(0, 0xFFFF_FFFF);
        assert!(interrupts.mtip());
    }

    #[test]
    fn test_s_views_masked_by_delegation() {
        let mut interrupts = Interrupts::new();
        interrupts.write_mie(0xFFFF_FFFF, 0xFFFF_FFFF);
        assert_eq!(interrupts.read_mie(), (1 << 5) | (1 << 7));
        // Nothing delegated yet, so the S-view is empty.
        assert_eq!(interrupts.read_sie(), 0);
        interrupts.write_mideleg(1 << 5, 0xFFFF_FFFF);
        assert_eq!(interrupts.read_sie(), 1 << 5);
        // sie writes can only touch delegated bits.
        interrupts.write_sie(0, 0xFFFF_FFFF);
        assert_eq!(interrupts.read_mie(), 1 << 7);
    }

    #[test]
    fn test_mideleg_warl() {
        let mut interrupts = Interrupts::new();
        interrupts.write_mideleg(0xFFFF_FFFF, 0xFFFF_FFFF);
        // Only the supervisor timer bit sticks.
        assert_eq!(interrupts.read_mideleg(), 1 << 5);
    }
}
