//! Provides the RV32IMA core: the fetch–decode–execute loop, the privilege/trap engine, and the
//! CSR file.

pub mod csr;
mod execute;
mod inst_cache;
mod interrupts;
mod mmu;
mod status;
mod trap;

use std::rc::Rc;
use std::time::Instant;

use log::{debug, trace};
use thiserror::Error;

use crate::address_space::{AddressSpace, InvalidAddress};
use crate::devices::clint;
use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, Instruction, LoadWidth, RegImmOp, RegRegOp, RegShiftImmOp,
    StoreWidth,
};
use crate::instruction::Decoder;
use crate::registers::Registers;
use crate::{PrivilegeLevel, RawPrivilegeLevel};
use execute::Executor;
use inst_cache::InstructionCache;
use interrupts::Interrupts;
use status::Status;
use trap::Trap;

pub use csr::CsrSpecifier;
pub use mmu::{AccessType, MemoryError, Mmu};

/// Instructions retired between two samplings of the host clock (and interrupt evaluations).
const POLL_INTERVAL: u32 = 2048;

/// Bit 31 of a cause value distinguishes interrupts from exceptions.
const INTERRUPT_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone)]
pub struct Config {
    /// > The mhartid CSR is an MXLEN-bit read-only register containing the integer ID of the
    /// > hardware thread running the code. [...] at least one hart must have a hart ID of zero.
    pub hart_id: u32,
    /// Address to which the core's pc register is reset.
    pub reset_vector: u32,
    /// Physical base address of the CLINT region holding the memory-mapped mtime and mtimecmp
    /// registers. Accessed physically at every timer poll, bypassing translation.
    pub clint_address: u32,
    /// Frequency (in Hz) of the guest-visible mtime counter. The host monotonic clock is scaled
    /// to this timebase.
    pub timebase_frequency: u64,
}

/// RISC-V core implementing the RV32IMA ISA with M/S/U privilege modes and Sv32 translation.
///
/// As hardware multithreading is not supported, every core always has exactly one hart, so
/// [`Core`] models the whole of a core with a single hart.
///
/// > From the perspective of software running in a given execution environment, a hart is a
/// > resource that autonomously fetches and executes RISC-V instructions within that execution
/// > environment.
///
/// The core owns its physical address space ([`AddressSpace`]), its architectural state
/// (registers, privilege mode, CSRs), and the derived state that makes it fast: the memoizing
/// decoder, the Sv32 translation caches, and the decoded-block cache.
#[derive(Debug)]
pub struct Core {
    config: Config,
    bus: AddressSpace,
    registers: Registers,
    privilege_mode: PrivilegeLevel,
    status: Status,
    trap: Trap,
    interrupts: Interrupts,
    /// Guest-visible time, projected into the time/timeh CSRs at every poll.
    time: u64,
    senvcfg: u32,
    decoder: Decoder,
    mmu: Mmu,
    inst_cache: InstructionCache,
    /// Instructions retired since the host clock was last sampled.
    retired_since_poll: u32,
    /// Privilege mode observed by the previous fetch iteration. A change invalidates the
    /// translation accelerator.
    fetch_mode: Option<PrivilegeLevel>,
    started_at: Instant,
}

impl Core {
    /// The misa CSR reports MXL=32 and the I, M, A, S, and U extension bits.
    pub const MISA: u32 = 0x4014_1101;
    /// The mvendorid CSR is a nonzero constant so the guest sees a concrete (if fictional)
    /// implementer.
    pub const MVENDORID: u32 = 0x0000_FE22;
    /// The marchid CSR is 0 to indicate it is not implemented.
    pub const MARCHID: u32 = 0;
    /// The mimpid CSR is 0 to indicate it is not implemented.
    pub const MIMPID: u32 = 0;
    /// The mconfigptr CSR is 0 to indicate no configuration structure exists.
    pub const MCONFIGPTR: u32 = 0;

    /// Create a core in its reset state, owning `bus` as its physical address space.
    ///
    /// The boot contract: `pc` at the reset vector, all `x` registers zero, M-mode, and
    /// `mstatus.MPP` = M.
    pub fn new(bus: AddressSpace, config: Config) -> Self {
        Self {
            registers: Registers::new(config.reset_vector),
            config,
            bus,
            privilege_mode: PrivilegeLevel::Machine,
            status: Status::new(),
            trap: Trap::new(),
            interrupts: Interrupts::new(),
            time: 0,
            senvcfg: 0,
            decoder: Decoder::new(),
            mmu: Mmu::new(),
            inst_cache: InstructionCache::new(),
            retired_since_poll: 0,
            fetch_mode: None,
            started_at: Instant::now(),
        }
    }

    /// Provide a read-only view of this core's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the current privilege mode. See also [`PrivilegeLevel`].
    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.privilege_mode
    }

    /// Provides immutable access to the general purpose (x) registers, and the pc register.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Provides mutable access to the general purpose (x) registers, and the pc register.
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    /// Provides immutable access to the physical address space.
    pub fn bus(&self) -> &AddressSpace {
        &self.bus
    }

    /// Provides mutable access to the physical address space, e.g. for loading images.
    pub fn bus_mut(&mut self) -> &mut AddressSpace {
        &mut self.bus
    }

    /// Fetch and execute decoded blocks until at least `steps` instructions have retired.
    ///
    /// Exceptions raised by the guest are handled internally by vectoring through the trap
    /// engine; they never end the run. The only error that surfaces is [`InvalidAddress`], a
    /// guest access to unmapped physical memory, which this emulator treats as fatal rather than
    /// converting to an access-fault trap.
    pub fn run(&mut self, steps: u64) -> Result<(), InvalidAddress> {
        let mut remaining = steps;
        while remaining > 0 {
            // The translation accelerator is keyed by neither satp nor mode, so it must be
            // dropped whenever either changes.
            if self.mmu.take_satp_dirty() || self.fetch_mode != Some(self.privilege_mode) {
                self.mmu.flush_accelerator();
                self.fetch_mode = Some(self.privilege_mode);
            }

            let pc = self.registers.pc();
            let pc_paddr = match self.translate(pc, AccessType::Execute) {
                Ok(paddr) => paddr,
                Err(MemoryError::PageFault(vaddr)) => {
                    self.trap(Exception::InstructionPageFault(vaddr));
                    continue;
                }
                Err(MemoryError::Bus(err)) => return Err(err),
            };

            let block = match self.inst_cache.lookup(pc_paddr) {
                Some(block) => block,
                None => {
                    let block = self.decode_block(pc_paddr)?;
                    if block.is_empty() {
                        // The very first word failed to decode.
                        self.trap(Exception::IllegalInstruction);
                        continue;
                    }
                    self.inst_cache.insert(pc_paddr, Rc::clone(&block));
                    block
                }
            };

            let mut retired = 0u64;
            let mut fatal = None;
            for &instruction in block.iter() {
                match self.execute_instruction(instruction) {
                    Ok(()) => retired += 1,
                    Err(ExecutionError::Exception(exception)) => {
                        retired += 1;
                        self.trap(exception);
                        break;
                    }
                    Err(ExecutionError::Bus(err)) => {
                        fatal = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = fatal {
                return Err(err);
            }

            self.retired_since_poll = self.retired_since_poll.saturating_add(retired as u32);
            remaining = remaining.saturating_sub(retired.max(1));

            if self.retired_since_poll > POLL_INTERVAL {
                self.poll_timer()?;
            }
        }
        Ok(())
    }

    /// Decode a straight-line block starting at physical address `paddr`.
    ///
    /// The block ends at the first may-jump instruction or at the 4 KiB page boundary. A word
    /// that fails to decode also ends the block; it will raise its illegal-instruction trap only
    /// once fetch actually reaches it. The returned block is empty iff the first word is
    /// undecodable.
    fn decode_block(&mut self, paddr: u32) -> Result<Rc<[Instruction]>, InvalidAddress> {
        let mut block = Vec::new();
        let mut fetch_paddr = paddr;
        loop {
            let word = match self.bus.read_u32(fetch_paddr) {
                Ok(word) => word,
                // Prefetch ran off the mapped region; keep what was decoded so far. Only the
                // first word of a block is fetched on behalf of the guest.
                Err(_) if !block.is_empty() => break,
                Err(err) => return Err(err),
            };
            let instruction = match self.decoder.decode(word) {
                Ok(instruction) => instruction,
                Err(_) => break,
            };
            block.push(instruction);
            fetch_paddr = fetch_paddr.wrapping_add(4);
            if fetch_paddr ^ paddr > 0xFFF || instruction.may_jump() {
                break;
            }
        }
        trace!(
            "Decoded block of {} instructions at paddr {paddr:#010x}",
            block.len()
        );
        Ok(Rc::from(block))
    }

    /// Sample the host clock, publish it to the CLINT and the time CSRs, latch MTIP, and
    /// evaluate pending timer interrupts.
    fn poll_timer(&mut self) -> Result<(), InvalidAddress> {
        let elapsed = self.started_at.elapsed();
        let now =
            (elapsed.as_nanos() * self.config.timebase_frequency as u128 / 1_000_000_000) as u64;
        self.bus
            .write_u64(self.config.clint_address + clint::MTIME_OFFSET, now)?;
        self.time = now;
        self.retired_since_poll = 0;

        let mtimecmp = self
            .bus
            .read_u64(self.config.clint_address + clint::MTIMECMP_OFFSET)?;
        self.interrupts.set_m_timer(now >= mtimecmp);

        if self.interrupts.mtip() && self.interrupts.mtie() {
            if self.interrupt_trap(Interrupt::MachineTimer) {
                return Ok(());
            }
        }
        if self.interrupts.stip() && self.interrupts.stie() {
            self.interrupt_trap(Interrupt::SupervisorTimer);
        }
        Ok(())
    }

    /// Map a virtual byte address to the corresponding physical byte address.
    pub(crate) fn translate(
        &mut self,
        vaddr: u32,
        access_type: AccessType,
    ) -> Result<u32, MemoryError> {
        self.mmu.translate(
            &mut self.bus,
            &self.trap,
            &self.status,
            self.privilege_mode,
            vaddr,
            access_type,
        )
    }

    fn load_byte(&mut self, vaddr: u32) -> Result<u8, MemoryError> {
        let paddr = self.translate(vaddr, AccessType::Read)?;
        Ok(self.bus.read_u8(paddr)?)
    }

    fn load_halfword(&mut self, vaddr: u32) -> Result<u16, MemoryError> {
        let paddr = self.translate(vaddr, AccessType::Read)?;
        Ok(self.bus.read_u16(paddr)?)
    }

    fn load_word(&mut self, vaddr: u32) -> Result<u32, MemoryError> {
        let paddr = self.translate(vaddr, AccessType::Read)?;
        Ok(self.bus.read_u32(paddr)?)
    }

    fn store_byte(&mut self, vaddr: u32, value: u8) -> Result<(), MemoryError> {
        let paddr = self.translate(vaddr, AccessType::Write)?;
        self.inst_cache.invalidate_frame(paddr >> 12);
        Ok(self.bus.write_u8(paddr, value)?)
    }

    fn store_halfword(&mut self, vaddr: u32, value: u16) -> Result<(), MemoryError> {
        let paddr = self.translate(vaddr, AccessType::Write)?;
        self.inst_cache.invalidate_frame(paddr >> 12);
        Ok(self.bus.write_u16(paddr, value)?)
    }

    fn store_word(&mut self, vaddr: u32, value: u32) -> Result<(), MemoryError> {
        let paddr = self.translate(vaddr, AccessType::Write)?;
        self.inst_cache.invalidate_frame(paddr >> 12);
        Ok(self.bus.write_u32(paddr, value)?)
    }

    /// Atomic read-modify-write of the word at virtual address `vaddr`, returning the pre-op
    /// value.
    fn amo_word(&mut self, vaddr: u32, op: impl FnOnce(u32) -> u32) -> Result<u32, MemoryError> {
        let paddr = self.translate(vaddr, AccessType::Write)?;
        let old_value = self.bus.read_u32(paddr)?;
        self.inst_cache.invalidate_frame(paddr >> 12);
        self.bus.write_u32(paddr, op(old_value))?;
        Ok(old_value)
    }

    /// Write one 4 KiB block of zeros at virtual address `vaddr` (CBO.ZERO).
    fn zero_block(&mut self, vaddr: u32) -> Result<(), MemoryError> {
        const ZEROS: [u8; 4096] = [0; 4096];
        let paddr = self.translate(vaddr, AccessType::Write)?;
        self.inst_cache.invalidate_frame(paddr >> 12);
        Ok(self.bus.write(paddr, &ZEROS)?)
    }

    /// Read the value of a CSR by its specifier.
    ///
    /// `privilege_level` indicates at what privilege level the read is performed. Accessing a CSR
    /// that requires a higher privilege level gives [`CsrAccessError::Privileged`].
    pub fn read_csr(
        &self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<u32, CsrAccessError> {
        self.check_csr_access(specifier, privilege_level)?;
        match specifier {
            //
            // Machine info registers
            //
            csr::MISA => Ok(Self::MISA),
            csr::MVENDORID => Ok(Self::MVENDORID),
            csr::MARCHID => Ok(Self::MARCHID),
            csr::MIMPID => Ok(Self::MIMPID),
            csr::MCONFIGPTR => Ok(Self::MCONFIGPTR),
            csr::MHARTID => Ok(self.config.hart_id),
            //
            // Status registers
            //
            csr::MSTATUS => Ok(self.status.read_mstatus()),
            csr::SSTATUS => Ok(self.status.read_sstatus()),
            //
            // Interrupt registers
            //
            csr::MIE => Ok(self.interrupts.read_mie()),
            csr::MIP => Ok(self.interrupts.read_mip()),
            csr::MIDELEG => Ok(self.interrupts.read_mideleg()),
            csr::SIE => Ok(self.interrupts.read_sie()),
            csr::SIP => Ok(self.interrupts.read_sip()),
            //
            // Machine trap handling
            //
            csr::MSCRATCH => Ok(self.trap.read_mscratch()),
            csr::MEPC => Ok(self.trap.read_mepc()),
            csr::MCAUSE => Ok(self.trap.read_mcause()),
            csr::MTVAL => Ok(self.trap.read_mtval()),
            csr::MTVEC => Ok(self.trap.read_mtvec()),
            csr::MEDELEG => Ok(self.trap.read_medeleg()),
            csr::MEDELEGH => Ok(self.trap.read_medelegh()),
            //
            // Supervisor trap handling
            //
            csr::SSCRATCH => Ok(self.trap.read_sscratch()),
            csr::SEPC => Ok(self.trap.read_sepc()),
            csr::SCAUSE => Ok(self.trap.read_scause()),
            csr::STVAL => Ok(self.trap.read_stval()),
            csr::STVEC => Ok(self.trap.read_stvec()),
            //
            // Supervisor protection and translation
            //
            csr::SATP => Ok(self.trap.read_satp()),
            csr::SENVCFG => Ok(self.senvcfg),
            //
            // Timer registers
            //
            csr::TIME => Ok(self.time as u32),
            csr::TIMEH => Ok((self.time >> 32) as u32),
            _ => Err(CsrAccessError::CsrUnsupported(specifier)),
        }
    }

    /// Write a (masked) value to a CSR by its specifier.
    ///
    /// Only the bits of `value` for which the corresponding bit in `mask` is `1` will be written;
    /// WARL fields may additionally legalize what is stored.
    pub fn write_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
        value: u32,
        mask: u32,
    ) -> Result<(), CsrWriteError> {
        self.check_csr_access(specifier, privilege_level)?;
        if csr::is_read_only(specifier) {
            return Err(CsrWriteError::WriteToReadOnly);
        }
        match specifier {
            // misa is WARL; this implementation ignores writes to it.
            csr::MISA => {}
            //
            // Status registers
            //
            csr::MSTATUS => self.status.write_mstatus(value, mask),
            csr::SSTATUS => self.status.write_sstatus(value, mask),
            //
            // Interrupt registers
            //
            csr::MIE => self.interrupts.write_mie(value, mask),
            csr::MIP => self.interrupts.write_mip(value, mask),
            csr::MIDELEG => self.interrupts.write_mideleg(value, mask),
            csr::SIE => self.interrupts.write_sie(value, mask),
            csr::SIP => self.interrupts.write_sip(value, mask),
            //
            // Machine trap handling
            //
            csr::MSCRATCH => self.trap.write_mscratch(value, mask),
            csr::MEPC => self.trap.write_mepc(value, mask),
            csr::MCAUSE => self.trap.write_mcause(value, mask),
            csr::MTVAL => self.trap.write_mtval(value, mask),
            csr::MTVEC => self.trap.write_mtvec(value, mask),
            csr::MEDELEG => self.trap.write_medeleg(value, mask),
            csr::MEDELEGH => self.trap.write_medelegh(value, mask),
            //
            // Supervisor trap handling
            //
            csr::SSCRATCH => self.trap.write_sscratch(value, mask),
            csr::SEPC => self.trap.write_sepc(value, mask),
            csr::SCAUSE => self.trap.write_scause(value, mask),
            csr::STVAL => self.trap.write_stval(value, mask),
            csr::STVEC => self.trap.write_stvec(value, mask),
            //
            // Supervisor protection and translation
            //
            csr::SATP => {
                self.trap.write_satp(value, mask);
                // The translation accelerator is flushed at the next fetch.
                self.mmu.note_satp_write();
            }
            csr::SENVCFG => self.senvcfg = self.senvcfg & !mask | value & mask,
            _ => Err(CsrAccessError::CsrUnsupported(specifier))?,
        }
        Ok(())
    }

    fn check_csr_access(
        &self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<(), CsrAccessError> {
        if !csr::is_valid(specifier) {
            return Err(CsrAccessError::CsrUnsupported(specifier));
        }
        let required_level = csr::required_privilege_level(specifier);
        if privilege_level < required_level {
            return Err(CsrAccessError::Privileged {
                specifier,
                required_level,
                actual_level: privilege_level,
            });
        }
        Ok(())
    }

    /// Take a trap for `exception`, vectoring to S-mode when delegated and to M-mode otherwise.
    ///
    /// Exceptions are always taken; delegation only selects the handling mode.
    fn trap(&mut self, exception: Exception) {
        let delegate = self.privilege_mode < PrivilegeLevel::Machine
            && self.trap.should_delegate_exception(exception.code());
        let tval = exception.tval(self.registers.pc());
        match delegate {
            true => self.enter_s_trap(exception.code(), tval),
            false => self.enter_m_trap(exception.code(), tval),
        }
    }

    /// Attempt to take an interrupt trap, honoring delegation and the per-mode global enables.
    ///
    /// Returns `false` when the interrupt is masked in the current mode; it stays pending and is
    /// re-evaluated at the next poll.
    fn interrupt_trap(&mut self, interrupt: Interrupt) -> bool {
        let delegate = self.interrupts.should_delegate(interrupt);
        let cause = interrupt.code() | INTERRUPT_BIT;
        let m_enabled = match self.privilege_mode {
            PrivilegeLevel::Machine => self.status.mie(),
            _ => true,
        };
        if m_enabled && !delegate {
            self.enter_m_trap(cause, 0);
            return true;
        }
        let s_enabled = match self.privilege_mode {
            PrivilegeLevel::Machine => false,
            PrivilegeLevel::Supervisor => self.status.sie(),
            PrivilegeLevel::User => true,
        };
        if s_enabled && delegate {
            self.enter_s_trap(cause, 0);
            return true;
        }
        debug!(
            cause, mode:% = self.privilege_mode;
            "Interrupt masked; deferring"
        );
        false
    }

    fn enter_m_trap(&mut self, cause: u32, tval: u32) {
        debug!(
            cause, tval, mode:% = self.privilege_mode;
            "Trapping to M-mode"
        );
        let pc = self.registers.pc();
        self.trap.write_mcause(cause, 0xFFFF_FFFF);
        self.trap.write_mepc(pc, 0xFFFF_FFFF);
        self.trap.write_mtval(tval, 0xFFFF_FFFF);
        let status = &mut self.status;
        status.set_mpie(status.mie());
        status.set_mie(false);
        status.set_mpp(RawPrivilegeLevel::from(self.privilege_mode));
        self.privilege_mode = PrivilegeLevel::Machine;
        // Only direct trap vectors are supported.
        self.registers.set_pc(self.trap.read_mtvec() & !0b11);
    }

    fn enter_s_trap(&mut self, cause: u32, tval: u32) {
        debug!(
            cause, tval, mode:% = self.privilege_mode;
            "Trapping to S-mode"
        );
        let pc = self.registers.pc();
        self.trap.write_scause(cause, 0xFFFF_FFFF);
        self.trap.write_sepc(pc, 0xFFFF_FFFF);
        self.trap.write_stval(tval, 0xFFFF_FFFF);
        let status = &mut self.status;
        status.set_spie(status.sie());
        status.set_sie(false);
        status.set_spp(RawPrivilegeLevel::from(self.privilege_mode));
        self.privilege_mode = PrivilegeLevel::Supervisor;
        self.registers.set_pc(self.trap.read_stvec() & !0b11);
    }

    /// Execute a single decoded instruction.
    ///
    /// This only performs the instruction-specific operations (registers, memory, CSRs, pc). The
    /// bookkeeping a full fetch iteration does on top (block accounting, timer polls) lives in
    /// [`run`](Self::run).
    fn execute_instruction(&mut self, instruction: Instruction) -> ExecutionResult {
        let mut executor = Executor { core: self };
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let op = match op {
                    RegImmOp::Addi => Executor::addi,
                    RegImmOp::Slti => Executor::slti,
                    RegImmOp::Sltiu => Executor::sltiu,
                    RegImmOp::Xori => Executor::xori,
                    RegImmOp::Ori => Executor::ori,
                    RegImmOp::Andi => Executor::andi,
                };
                op(&mut executor, dest, src, immediate)
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let op = match op {
                    RegShiftImmOp::Slli => Executor::slli,
                    RegShiftImmOp::Srli => Executor::srli,
                    RegShiftImmOp::Srai => Executor::srai,
                };
                op(&mut executor, dest, src, shift_amount_u5)
            }
            Instruction::Auipc { dest, immediate } => executor.auipc(dest, immediate),
            Instruction::Lui { dest, immediate } => executor.lui(dest, immediate),
            Instruction::Amo {
                op,
                aq: _,
                rl: _,
                src,
                addr,
                dest,
            } => match op {
                AmoOp::Lr => executor.lr(dest, addr),
                AmoOp::Sc => executor.sc(dest, src, addr),
                AmoOp::Swap => executor.amoswap(dest, src, addr),
                AmoOp::Add => executor.amoadd(dest, src, addr),
                AmoOp::Xor => executor.amoxor(dest, src, addr),
                AmoOp::And => executor.amoand(dest, src, addr),
                AmoOp::Or => executor.amoor(dest, src, addr),
                AmoOp::Min => executor.amomin(dest, src, addr),
                AmoOp::Max => executor.amomax(dest, src, addr),
                AmoOp::Minu => executor.amominu(dest, src, addr),
                AmoOp::Maxu => executor.amomaxu(dest, src, addr),
            },
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let op = match op {
                    RegRegOp::Add => Executor::add,
                    RegRegOp::Slt => Executor::slt,
                    RegRegOp::Sltu => Executor::sltu,
                    RegRegOp::And => Executor::and,
                    RegRegOp::Or => Executor::or,
                    RegRegOp::Xor => Executor::xor,
                    RegRegOp::Sll => Executor::sll,
                    RegRegOp::Srl => Executor::srl,
                    RegRegOp::Sub => Executor::sub,
                    RegRegOp::Sra => Executor::sra,
                    RegRegOp::Mul => Executor::mul,
                    RegRegOp::Mulh => Executor::mulh,
                    RegRegOp::Mulhsu => Executor::mulhsu,
                    RegRegOp::Mulhu => Executor::mulhu,
                    RegRegOp::Div => Executor::div,
                    RegRegOp::Divu => Executor::divu,
                    RegRegOp::Rem => Executor::rem,
                    RegRegOp::Remu => Executor::remu,
                };
                op(&mut executor, dest, src1, src2)
            }
            Instruction::Jal { dest, offset } => executor.jal(dest, offset),
            Instruction::Jalr { dest, base, offset } => executor.jalr(dest, base, offset),
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let op = match condition {
                    BranchCondition::Beq => Executor::beq,
                    BranchCondition::Bne => Executor::bne,
                    BranchCondition::Blt => Executor::blt,
                    BranchCondition::Bltu => Executor::bltu,
                    BranchCondition::Bge => Executor::bge,
                    BranchCondition::Bgeu => Executor::bgeu,
                };
                op(&mut executor, src1, src2, offset)
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let op = match width {
                    LoadWidth::Lb => Executor::lb,
                    LoadWidth::Lh => Executor::lh,
                    LoadWidth::Lw => Executor::lw,
                    LoadWidth::Lbu => Executor::lbu,
                    LoadWidth::Lhu => Executor::lhu,
                };
                op(&mut executor, dest, base, offset)
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let op = match width {
                    StoreWidth::Sb => Executor::sb,
                    StoreWidth::Sh => Executor::sh,
                    StoreWidth::Sw => Executor::sw,
                };
                op(&mut executor, src, base, offset)
            }
            Instruction::Fence | Instruction::FenceI => executor.fence(),
            Instruction::CboZero { base } => executor.cbo_zero(base),
            Instruction::Ecall => executor.ecall(),
            Instruction::Ebreak => executor.ebreak(),
            Instruction::Sret => executor.sret(),
            Instruction::Mret => executor.mret(),
            Instruction::Wfi => executor.wfi(),
            Instruction::SfenceVma { vaddr, asid } => executor.sfence_vma(vaddr, asid),
            Instruction::Csr { op, dest, csr, src } => {
                let op = match op {
                    CsrOp::ReadWrite => Executor::csrrw,
                    CsrOp::ReadSet => Executor::csrrs,
                    CsrOp::ReadClear => Executor::csrrc,
                };
                op(&mut executor, dest, csr, src)
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let op = match op {
                    CsrOp::ReadWrite => Executor::csrrwi,
                    CsrOp::ReadSet => Executor::csrrsi,
                    CsrOp::ReadClear => Executor::csrrci,
                };
                op(&mut executor, dest, csr, immediate)
            }
        }
    }
}

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug)]
pub enum CsrAccessError {
    #[error("unsupported CSR: {0:#05X}")]
    CsrUnsupported(CsrSpecifier),
    /// Attempt to access a CSR that requires a higher privilege level.
    #[error(
        "cannot access specifier {specifier:#05X} from privilege level {actual_level}, \
             since it requires privilege level {required_level}"
    )]
    Privileged {
        specifier: CsrSpecifier,
        required_level: RawPrivilegeLevel,
        actual_level: PrivilegeLevel,
    },
}

/// Errors that can occur when attempting to write to a CSR.
#[derive(Error, Debug)]
pub enum CsrWriteError {
    /// A non-write specific access error. See [`CsrAccessError`].
    #[error("{0}")]
    AccessError(#[from] CsrAccessError),
    /// Attempt to write to a read-only register.
    #[error("writing to read-only CSR is invalid")]
    WriteToReadOnly,
}

/// Result of executing a single instruction. [`Ok`] if execution went normally, [`Err`] if it was
/// cut short.
pub type ExecutionResult<T = ()> = Result<T, ExecutionError>;

/// The two ways an instruction can fail to complete.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExecutionError {
    /// An architectural exception; the fetch loop vectors it through the trap engine.
    #[error(transparent)]
    Exception(#[from] Exception),
    /// An access to unmapped physical memory; fatal to the run.
    #[error(transparent)]
    Bus(#[from] InvalidAddress),
}

/// The synchronous exceptions this core can raise.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exception {
    /// Raised for reserved encodings, accesses to non-existent CSRs, CSR accesses above the
    /// current privilege level, and writes to read-only CSRs.
    #[error("illegal instruction")]
    IllegalInstruction,
    #[error("breakpoint")]
    Breakpoint,
    #[error("environment call from U-mode")]
    EnvironmentCallFromUMode,
    #[error("environment call from S-mode")]
    EnvironmentCallFromSMode,
    #[error("environment call from M-mode")]
    EnvironmentCallFromMMode,
    /// The inner value is the faulting virtual address.
    #[error("instruction page fault at {0:#010x}")]
    InstructionPageFault(u32),
    /// The inner value is the faulting virtual address.
    #[error("load page fault at {0:#010x}")]
    LoadPageFault(u32),
    /// The inner value is the faulting virtual address.
    #[error("store/AMO page fault at {0:#010x}")]
    StoreOrAmoPageFault(u32),
}

impl Exception {
    pub const ILLEGAL_INSTRUCTION: u32 = 2;
    pub const BREAKPOINT: u32 = 3;
    pub const ENVIRONMENT_CALL_FROM_U_MODE: u32 = 8;
    pub const ENVIRONMENT_CALL_FROM_S_MODE: u32 = 9;
    pub const ENVIRONMENT_CALL_FROM_M_MODE: u32 = 11;
    pub const INSTRUCTION_PAGE_FAULT: u32 = 12;
    pub const LOAD_PAGE_FAULT: u32 = 13;
    pub const STORE_OR_AMO_PAGE_FAULT: u32 = 15;

    /// Returns the exception code (cause) for this exception.
    pub const fn code(&self) -> u32 {
        match self {
            Self::IllegalInstruction => Self::ILLEGAL_INSTRUCTION,
            Self::Breakpoint => Self::BREAKPOINT,
            Self::EnvironmentCallFromUMode => Self::ENVIRONMENT_CALL_FROM_U_MODE,
            Self::EnvironmentCallFromSMode => Self::ENVIRONMENT_CALL_FROM_S_MODE,
            Self::EnvironmentCallFromMMode => Self::ENVIRONMENT_CALL_FROM_M_MODE,
            Self::InstructionPageFault(_) => Self::INSTRUCTION_PAGE_FAULT,
            Self::LoadPageFault(_) => Self::LOAD_PAGE_FAULT,
            Self::StoreOrAmoPageFault(_) => Self::STORE_OR_AMO_PAGE_FAULT,
        }
    }

    /// Returns the value stored to `xtval` for this exception, given the pc of the faulting
    /// instruction.
    pub const fn tval(&self, pc: u32) -> u32 {
        match self {
            Self::IllegalInstruction | Self::Breakpoint => pc,
            Self::EnvironmentCallFromUMode
            | Self::EnvironmentCallFromSMode
            | Self::EnvironmentCallFromMMode => 0,
            Self::InstructionPageFault(vaddr)
            | Self::LoadPageFault(vaddr)
            | Self::StoreOrAmoPageFault(vaddr) => *vaddr,
        }
    }
}

/// The interrupts this core can take. Only the two timer interrupts exist; external and software
/// interrupts have no source in this machine model.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorTimer = 5,
    MachineTimer = 7,
}

impl Interrupt {
    /// Returns the exception code for this interrupt (without the interrupt bit).
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range;
    use crate::address_space::Region;
    use crate::registers::Specifier;

    const RAM_BASE: u32 = 0x8000_0000;
    const RAM_SIZE: usize = 0x0100_0000;

    fn test_core() -> Core {
        let bus = AddressSpace::new(vec![(
            address_range![RAM_BASE, RAM_BASE + RAM_SIZE as u32 - 1],
            Region::Buffer(vec![0; RAM_SIZE]),
        )])
        .unwrap();
        Core::new(
            bus,
            Config {
                hart_id: 0,
                reset_vector: RAM_BASE,
                clint_address: 0x0200_0000,
                timebase_frequency: 1_000_000,
            },
        )
    }

    fn load_program(core: &mut Core, address: u32, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            core.bus_mut()
                .write_u32(address + 4 * i as u32, word)
                .unwrap();
        }
    }

    fn x(core: &Core, index: u8) -> u32 {
        core.registers().x(Specifier::from_u5(index))
    }

    // jal x0, 0: an endless spin that terminates every test program's final block.
    const SPIN: u32 = 0x0000_006F;

    #[test]
    fn test_arithmetic_and_branch() {
        let mut core = test_core();
        load_program(
            &mut core,
            RAM_BASE,
            &[
                0x0050_0093, // addi x1, x0, 5
                0x0070_0113, // addi x2, x0, 7
                0x0020_81B3, // add  x3, x1, x2
                0x0001_8463, // beq  x3, x0, +8
                0x0010_0213, // addi x4, x0, 1
                SPIN,
            ],
        );
        core.run(6).unwrap();
        assert_eq!(x(&core, 1), 5);
        assert_eq!(x(&core, 2), 7);
        assert_eq!(x(&core, 3), 12);
        assert_eq!(x(&core, 4), 1);
        // The spin pins pc at its own address.
        assert_eq!(core.registers().pc(), RAM_BASE + 0x14);
        assert_eq!(x(&core, 0), 0);
    }

    #[test]
    fn test_sign_extension() {
        let mut core = test_core();
        load_program(
            &mut core,
            RAM_BASE,
            &[
                0xFFFF_F0B7, // lui  x1, 0xFFFFF
                0xFFF0_8113, // addi x2, x1, -1
                SPIN,
            ],
        );
        core.run(3).unwrap();
        assert_eq!(x(&core, 1), 0xFFFF_F000);
        assert_eq!(x(&core, 2), 0xFFFF_EFFF);
    }

    #[test]
    fn test_division_corner_cases() {
        let mut core = test_core();
        load_program(
            &mut core,
            RAM_BASE,
            &[
                0x8000_00B7, // lui  x1, 0x80000
                0xFFF0_0113, // addi x2, x0, -1
                0x0220_C1B3, // div  x3, x1, x2
                0x0220_E233, // rem  x4, x1, x2
                0x0200_D2B3, // divu x5, x1, x0
                SPIN,
            ],
        );
        core.run(6).unwrap();
        assert_eq!(x(&core, 3), 0x8000_0000);
        assert_eq!(x(&core, 4), 0);
        assert_eq!(x(&core, 5), 0xFFFF_FFFF);
    }

    #[test]
    fn test_lr_sc() {
        let mut core = test_core();
        core.bus_mut().write_u32(0x8000_1000, 0x1).unwrap();
        core.registers_mut()
            .set_x(Specifier::new(10).unwrap(), 0x8000_1000);
        core.registers_mut().set_x(Specifier::new(3).unwrap(), 0x2);
        load_program(
            &mut core,
            RAM_BASE,
            &[
                0x1005_20AF, // lr.w x1, (x10)
                0x1835_212F, // sc.w x2, x3, (x10)
                0x1835_22AF, // sc.w x5, x3, (x10)
                SPIN,
            ],
        );
        core.run(4).unwrap();
        assert_eq!(x(&core, 1), 0x1);
        // The first sc.w succeeds and stores.
        assert_eq!(x(&core, 2), 0);
        assert_eq!(core.bus_mut().read_u32(0x8000_1000).unwrap(), 0x2);
        // The second sc.w has no reservation and fails without storing.
        assert_eq!(x(&core, 5), 1);
        assert_eq!(core.bus_mut().read_u32(0x8000_1000).unwrap(), 0x2);
    }

    #[test]
    fn test_amo() {
        let mut core = test_core();
        core.bus_mut().write_u32(0x8000_1000, 10).unwrap();
        core.registers_mut()
            .set_x(Specifier::new(10).unwrap(), 0x8000_1000);
        core.registers_mut().set_x(Specifier::new(3).unwrap(), 5);
        load_program(
            &mut core,
            RAM_BASE,
            &[
                0x0035_20AF, // amoadd.w x1, x3, (x10)
                SPIN,
            ],
        );
        core.run(1).unwrap();
        // rd receives the pre-op value; memory the result.
        assert_eq!(x(&core, 1), 10);
        assert_eq!(core.bus_mut().read_u32(0x8000_1000).unwrap(), 15);
    }

    #[test]
    fn test_ecall_and_mret() {
        let mut core = test_core();
        core.trap.write_mtvec(0x8000_2000, 0xFFFF_FFFF);
        core.status.set_mie(true);
        load_program(&mut core, RAM_BASE, &[0x0000_0073]); // ecall
        load_program(&mut core, 0x8000_2000, &[0x3020_0073]); // mret

        core.run(1).unwrap();
        assert_eq!(
            core.trap.read_mcause(),
            Exception::ENVIRONMENT_CALL_FROM_M_MODE
        );
        assert_eq!(core.trap.read_mepc(), RAM_BASE);
        assert_eq!(core.status.mpp(), PrivilegeLevel::Machine);
        assert!(!core.status.mie());
        assert_eq!(core.registers().pc(), 0x8000_2000);
        assert_eq!(core.privilege_mode(), PrivilegeLevel::Machine);

        core.run(1).unwrap();
        // (pc, mode, MIE) restored from (mepc, MPP, MPIE).
        assert_eq!(core.registers().pc(), RAM_BASE);
        assert_eq!(core.privilege_mode(), PrivilegeLevel::Machine);
        assert!(core.status.mie());
    }

    #[test]
    fn test_exception_delegation() {
        let mut core = test_core();
        core.trap.write_stvec(0x8000_3000, 0xFFFF_FFFF);
        core.trap
            .write_medeleg(1 << Exception::ENVIRONMENT_CALL_FROM_U_MODE, 0xFFFF_FFFF);
        core.privilege_mode = PrivilegeLevel::User;
        load_program(&mut core, RAM_BASE, &[0x0000_0073]); // ecall
        load_program(&mut core, 0x8000_3000, &[SPIN]);

        core.run(1).unwrap();
        assert_eq!(core.privilege_mode(), PrivilegeLevel::Supervisor);
        assert_eq!(
            core.trap.read_scause(),
            Exception::ENVIRONMENT_CALL_FROM_U_MODE
        );
        assert_eq!(core.trap.read_sepc(), RAM_BASE);
        assert_eq!(core.status.spp(), PrivilegeLevel::User);
        assert_eq!(core.registers().pc(), 0x8000_3000);
    }

    #[test]
    fn test_illegal_csr_traps() {
        let mut core = test_core();
        core.trap.write_mtvec(0x8000_2000, 0xFFFF_FFFF);
        // csrrw x0, 0x7C0 (an unimplemented custom CSR), x0
        load_program(&mut core, RAM_BASE, &[0x7C00_1073]);
        load_program(&mut core, 0x8000_2000, &[SPIN]);
        core.run(1).unwrap();
        assert_eq!(core.trap.read_mcause(), Exception::ILLEGAL_INSTRUCTION);
        // tval records the pc of the faulting instruction.
        assert_eq!(core.trap.read_mtval(), RAM_BASE);
        assert_eq!(core.registers().pc(), 0x8000_2000);
    }

    #[test]
    fn test_sv32_translation_and_fault() {
        let mut core = test_core();
        const ROOT_TABLE: u32 = 0x8010_0000;
        const SECOND_LEVEL: u32 = 0x8010_1000;
        // First-level entry 0 points at the second-level table.
        core.bus_mut()
            .write_u32(ROOT_TABLE, (SECOND_LEVEL >> 12) << 10 | 0b1)
            .unwrap();
        // VA 0x1000 -> PA 0x8020_0000, V|R|W with A/D preset.
        core.bus_mut()
            .write_u32(SECOND_LEVEL + 4, (0x8020_0000 >> 12) << 10 | 0xC7)
            .unwrap();
        // VA 0x4000 -> PA 0x8030_0000, V|X with A preset (code page).
        core.bus_mut()
            .write_u32(SECOND_LEVEL + 4 * 4, (0x8030_0000 >> 12) << 10 | 0x49)
            .unwrap();
        core.bus_mut().write_u32(0x8020_0000, 0xDEAD_BEEF).unwrap();
        load_program(
            &mut core,
            0x8030_0000,
            &[
                0x0005_2083, // lw x1, 0(x10)
                SPIN,
            ],
        );

        core.write_csr(
            csr::SATP,
            PrivilegeLevel::Machine,
            (1 << 31) | (ROOT_TABLE >> 12),
            0xFFFF_FFFF,
        )
        .unwrap();
        core.trap.write_mtvec(0x8000_2000, 0xFFFF_FFFF);
        load_program(&mut core, 0x8000_2000, &[SPIN]);
        core.privilege_mode = PrivilegeLevel::Supervisor;
        core.registers_mut().set_pc(0x4000);
        core.registers_mut()
            .set_x(Specifier::new(10).unwrap(), 0x1000);

        core.run(2).unwrap();
        assert_eq!(x(&core, 1), 0xDEAD_BEEF);

        // A load from an unmapped page traps with cause 13 and the faulting vaddr.
        core.registers_mut()
            .set_x(Specifier::new(10).unwrap(), 0x2000);
        core.registers_mut().set_pc(0x4000);
        core.run(1).unwrap();
        assert_eq!(core.privilege_mode(), PrivilegeLevel::Machine);
        assert_eq!(core.trap.read_mcause(), Exception::LOAD_PAGE_FAULT);
        assert_eq!(core.trap.read_mtval(), 0x2000);
        assert_eq!(core.registers().pc(), 0x8000_2000);
    }

    #[test]
    fn test_interrupt_delegation() {
        let mut core = test_core();
        core.trap.write_stvec(0x8000_3000, 0xFFFF_FFFF);
        core.interrupts.write_mideleg(1 << 5, 0xFFFF_FFFF);
        core.privilege_mode = PrivilegeLevel::User;
        assert!(core.interrupt_trap(Interrupt::SupervisorTimer));
        assert_eq!(core.privilege_mode(), PrivilegeLevel::Supervisor);
        assert_eq!(core.trap.read_scause(), INTERRUPT_BIT | 5);
        assert_eq!(core.registers().pc(), 0x8000_3000);
    }

    #[test]
    fn test_masked_interrupt_deferred() {
        let mut core = test_core();
        // M-mode with MIE clear: the machine timer interrupt must stay pending.
        assert!(!core.status.mie());
        assert!(!core.interrupt_trap(Interrupt::MachineTimer));
        assert_eq!(core.privilege_mode(), PrivilegeLevel::Machine);

        // Delegated interrupt in S-mode with SIE clear is also deferred.
        core.interrupts.write_mideleg(1 << 5, 0xFFFF_FFFF);
        core.privilege_mode = PrivilegeLevel::Supervisor;
        assert!(!core.interrupt_trap(Interrupt::SupervisorTimer));
    }

    #[test]
    fn test_store_invalidates_block_cache() {
        let mut core = test_core();
        // A block that rewrites its own successor: the store must evict the frame's blocks so
        // the new instruction is fetched.
        load_program(
            &mut core,
            RAM_BASE,
            &[
                0x0050_0093, // addi x1, x0, 5
                SPIN,
            ],
        );
        core.run(2).unwrap();
        assert_eq!(x(&core, 1), 5);
        assert!(core.inst_cache.lookup(RAM_BASE).is_some());

        // Overwrite the first instruction through the store path.
        core.store_word(RAM_BASE, 0x0070_0093).unwrap(); // addi x1, x0, 7
        assert!(core.inst_cache.lookup(RAM_BASE).is_none());

        core.registers_mut().set_pc(RAM_BASE);
        core.run(2).unwrap();
        assert_eq!(x(&core, 1), 7);
    }

    #[test]
    fn test_cbo_zero() {
        let mut core = test_core();
        core.bus_mut().write_u32(0x8000_5000, 0x1234_5678).unwrap();
        core.bus_mut().write_u32(0x8000_5FFC, 0x9ABC_DEF0).unwrap();
        core.registers_mut()
            .set_x(Specifier::new(10).unwrap(), 0x8000_5000);
        // cbo.zero (x10)
        load_program(&mut core, RAM_BASE, &[0x0045_200F, SPIN]);
        core.run(1).unwrap();
        assert_eq!(core.bus_mut().read_u32(0x8000_5000).unwrap(), 0);
        assert_eq!(core.bus_mut().read_u32(0x8000_5FFC).unwrap(), 0);
    }

    #[test]
    fn test_unmapped_access_is_fatal() {
        let mut core = test_core();
        // lw x1, 0(x0): a load from unmapped physical address 0 in M-mode.
        load_program(&mut core, RAM_BASE, &[0x0000_2083, SPIN]);
        assert_eq!(core.run(1), Err(InvalidAddress(0)));
    }
}
