use log::trace;

use super::mmu::{AccessType, MemoryError};
use super::{Core, CsrSpecifier, Exception, ExecutionError, ExecutionResult};
use crate::instruction::CsrOp;
use crate::registers::{Registers, Specifier};
use crate::{PrivilegeLevel, RawPrivilegeLevel};

/// Executes decoded instructions against a core.
///
/// Every operation either writes `pc` itself (jumps, trap returns) or advances it by 4 after
/// succeeding. When an operation fails, `pc` is left pointing at the faulting instruction, so the
/// trap engine records the correct `xepc`.
#[derive(Debug)]
pub(super) struct Executor<'c> {
    pub core: &'c mut Core,
}

impl<'c> Executor<'c> {
    /// Executes an `addi` instruction.
    ///
    /// > ADDI adds the sign-extended 12-bit immediate to register rs1. Arithmetic overflow is
    /// > ignored and the result is simply the low XLEN bits of the result. ADDI rd, rs1, 0 is used
    /// > to implement the MV rd, rs1 assembler pseudoinstruction.
    pub fn addi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing addi {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s.wrapping_add_signed(imm))
    }

    /// Executes a `slti` instruction.
    ///
    /// > SLTI (set less than immediate) places the value 1 in register rd if register rs1 is less
    /// > than the sign-extended immediate when both are treated as signed numbers, else 0 is
    /// > written to rd.
    pub fn slti(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing slti {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| ((s as i32) < imm) as u32)
    }

    /// Executes a `sltiu` instruction.
    ///
    /// > SLTIU is similar but compares the values as unsigned numbers (i.e., the immediate is
    /// > first sign-extended to XLEN bits then treated as an unsigned number).
    pub fn sltiu(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing sltiu {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| (s < (imm as u32)) as u32)
    }

    /// Executes an `andi` instruction.
    pub fn andi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing andi {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s & (imm as u32))
    }

    /// Executes an `ori` instruction.
    pub fn ori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing ori {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s | (imm as u32))
    }

    /// Executes a `xori` instruction.
    pub fn xori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing xori {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s ^ (imm as u32))
    }

    /// Executes a `slli` instruction.
    pub fn slli(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    ) -> ExecutionResult {
        trace!("Executing slli {dest} {src} {shift_amount_u5}");
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| s << shamt)
    }

    /// Executes a `srli` instruction.
    pub fn srli(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    ) -> ExecutionResult {
        trace!("Executing srli {dest} {src} {shift_amount_u5}");
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| s >> shamt)
    }

    /// Executes a `srai` instruction.
    ///
    /// > SRAI is an arithmetic right shift (the original sign bit is copied into the vacated upper
    /// > bits).
    pub fn srai(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    ) -> ExecutionResult {
        trace!("Executing srai {dest} {src} {shift_amount_u5}");
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| {
            ((s as i32) >> shamt) as u32
        })
    }

    /// Executes a `lui` instruction.
    ///
    /// > LUI places the U-immediate value in the top 20 bits of the destination register rd,
    /// > filling in the lowest 12 bits with zeros.
    pub fn lui(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing lui {dest} {immediate}");
        let result = immediate as u32 & !0xFFF;
        let registers = &mut self.core.registers;
        registers.set_x(dest, result);
        increment_pc(registers);
        Ok(())
    }

    /// Executes an `auipc` instruction.
    ///
    /// > AUIPC forms a 32-bit offset from the 20-bit U-immediate, filling in the lowest 12 bits
    /// > with zeros, adds this offset to the address of the AUIPC instruction, then places the
    /// > result in register rd.
    pub fn auipc(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        trace!("Executing auipc {dest} {immediate}");
        let registers = &mut self.core.registers;
        let result = registers.pc().wrapping_add_signed(immediate & !0xFFF);
        registers.set_x(dest, result);
        increment_pc(registers);
        Ok(())
    }

    pub fn add(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing add {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_add(s2))
    }

    pub fn sub(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing sub {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_sub(s2))
    }

    pub fn slt(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing slt {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) < (s2 as i32)) as u32
        })
    }

    pub fn sltu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing sltu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| (s1 < s2) as u32)
    }

    pub fn and(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing and {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 & s2)
    }

    pub fn or(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing or {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 | s2)
    }

    pub fn xor(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing xor {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 ^ s2)
    }

    /// > SLL, SRL, and SRA perform logical left, logical right, and arithmetic right shifts on the
    /// > value in register rs1 by the shift amount held in the lower 5 bits of register rs2.
    pub fn sll(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing sll {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 << (s2 & 0x1F))
    }

    pub fn srl(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing srl {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 >> (s2 & 0x1F))
    }

    pub fn sra(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing sra {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) >> (s2 & 0x1F)) as u32
        })
    }

    /// Executes a `mul` instruction.
    ///
    /// > MUL performs an XLEN-bit×XLEN-bit multiplication of rs1 by rs2 and places the lower XLEN
    /// > bits in the destination register.
    pub fn mul(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing mul {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_mul(s2))
    }

    /// Executes a `mulh` instruction.
    ///
    /// > MULH, MULHU, and MULHSU perform the same multiplication but return the upper XLEN bits of
    /// > the full 2×XLEN-bit product, for signed×signed, unsigned×unsigned, and signed rs1×unsigned
    /// > rs2 multiplication, respectively.
    pub fn mulh(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing mulh {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32 as i64 * s2 as i32 as i64) >> 32) as u32
        })
    }

    pub fn mulhsu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing mulhsu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32 as i64 * s2 as i64) >> 32) as u32
        })
    }

    pub fn mulhu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing mulhu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as u64 * s2 as u64) >> 32) as u32
        })
    }

    /// Executes a `div` instruction.
    ///
    /// > DIV and DIVU perform an XLEN bits by XLEN bits signed and unsigned integer division of rs1
    /// > by rs2, rounding towards zero.
    ///
    /// > The quotient of division by zero has all bits set, and the remainder of division by zero
    /// > equals the dividend. Signed division overflow occurs only when the most-negative integer
    /// > is divided by −1. The quotient of a signed division with overflow is equal to the
    /// > dividend, and the remainder is zero. Unsigned division overflow cannot occur.
    pub fn div(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing div {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 == 0 {
            true => 0xFFFF_FFFF,
            false => (s1 as i32).overflowing_div(s2 as i32).0 as u32,
        })
    }

    pub fn divu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing divu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            s1.checked_div(s2).unwrap_or(0xFFFF_FFFF)
        })
    }

    /// Executes a `rem` instruction.
    ///
    /// > REM and REMU provide the remainder of the corresponding division operation. For REM, the
    /// > sign of the result equals the sign of the dividend.
    pub fn rem(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing rem {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 == 0 {
            true => s1,
            false => (s1 as i32).overflowing_rem(s2 as i32).0 as u32,
        })
    }

    pub fn remu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("Executing remu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.checked_rem(s2).unwrap_or(s1))
    }

    pub fn jal(&mut self, dest: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing jal {dest} {offset}");
        self.jump_op(dest, |registers| registers.pc().wrapping_add_signed(offset))
    }

    pub fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing jalr {dest} {base} {offset}");
        self.jump_op(dest, |registers| {
            registers.x(base).wrapping_add_signed(offset) & !1
        })
    }

    pub fn beq(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing beq {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 == s2)
    }

    pub fn bne(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing bne {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 != s2)
    }

    pub fn blt(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing blt {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) < (s2 as i32))
    }

    pub fn bltu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing bltu {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 < s2)
    }

    pub fn bge(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing bge {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) >= (s2 as i32))
    }

    pub fn bgeu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing bgeu {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 >= s2)
    }

    pub fn lb(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing lb {dest} {offset}({base})");
        self.load_op(dest, base, offset, |core, address| {
            core.load_byte(address).map(|value| value as i8 as u32)
        })
    }

    pub fn lbu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing lbu {dest} {offset}({base})");
        self.load_op(dest, base, offset, |core, address| {
            core.load_byte(address).map(|value| value as u32)
        })
    }

    pub fn lh(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing lh {dest} {offset}({base})");
        self.load_op(dest, base, offset, |core, address| {
            core.load_halfword(address).map(|value| value as i16 as u32)
        })
    }

    pub fn lhu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing lhu {dest} {offset}({base})");
        self.load_op(dest, base, offset, |core, address| {
            core.load_halfword(address).map(|value| value as u32)
        })
    }

    pub fn lw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing lw {dest} {offset}({base})");
        self.load_op(dest, base, offset, |core, address| core.load_word(address))
    }

    pub fn sb(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing sb {src} {offset}({base})");
        self.store_op(src, base, offset, |core, address, value| {
            core.store_byte(address, value as u8)
        })
    }

    pub fn sh(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing sh {src} {offset}({base})");
        self.store_op(src, base, offset, |core, address, value| {
            core.store_halfword(address, value as u16)
        })
    }

    pub fn sw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("Executing sw {src} {offset}({base})");
        self.store_op(src, base, offset, |core, address, value| {
            core.store_word(address, value)
        })
    }

    /// Executes an `lr.w` instruction: loads a word and installs a reservation on it.
    pub fn lr(&mut self, dest: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing lr.w {dest}, ({addr})");
        let address = self.core.registers.x(addr);
        let paddr = self
            .core
            .translate(address, AccessType::Read)
            .map_err(|err| convert_memory_error(err, AccessType::Read))?;
        let value = self.core.bus.read_u32(paddr).map_err(ExecutionError::Bus)?;
        self.core.bus.set_reservation(paddr, value);
        let registers = &mut self.core.registers;
        registers.set_x(dest, value);
        increment_pc(registers);
        Ok(())
    }

    /// Executes an `sc.w` instruction.
    ///
    /// The store succeeds iff a reservation is held on this word and the word still contains the
    /// value observed by the reserving LR.W. Writes 0 to `rd` on success and 1 on failure, and
    /// drops the reservation either way.
    pub fn sc(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing sc.w {dest}, {src}, ({addr})");
        let address = self.core.registers.x(addr);
        let paddr = self
            .core
            .translate(address, AccessType::Write)
            .map_err(|err| convert_memory_error(err, AccessType::Write))?;
        let current = self.core.bus.read_u32(paddr).map_err(ExecutionError::Bus)?;
        let success = matches!(
            self.core.bus.reservation(),
            Some((reserved, value)) if reserved == paddr && value == current
        );
        if success {
            let value = self.core.registers.x(src);
            self.core.inst_cache.invalidate_frame(paddr >> 12);
            self.core
                .bus
                .write_u32(paddr, value)
                .map_err(ExecutionError::Bus)?;
        }
        self.core.bus.clear_reservation();
        let registers = &mut self.core.registers;
        registers.set_x(dest, u32::from(!success));
        increment_pc(registers);
        Ok(())
    }

    pub fn amoswap(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amoswap.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |_, reg| reg)
    }

    pub fn amoadd(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amoadd.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| mem.wrapping_add(reg))
    }

    pub fn amoand(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amoand.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| mem & reg)
    }

    pub fn amoor(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amoor.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| mem | reg)
    }

    pub fn amoxor(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amoxor.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| mem ^ reg)
    }

    pub fn amomax(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amomax.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| {
            (mem as i32).max(reg as i32) as u32
        })
    }

    pub fn amomin(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amomin.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| {
            (mem as i32).min(reg as i32) as u32
        })
    }

    pub fn amomaxu(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amomaxu.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| mem.max(reg))
    }

    pub fn amominu(&mut self, dest: Specifier, src: Specifier, addr: Specifier) -> ExecutionResult {
        trace!("Executing amominu.w {dest}, {src}, ({addr})");
        self.amo_op(dest, src, addr, |mem, reg| mem.min(reg))
    }

    /// Executes a `fence` or `fence.i` instruction. With a single in-order hart all memory
    /// operations are already observed in program order, so both are no-ops.
    pub fn fence(&mut self) -> ExecutionResult {
        trace!("Executing fence");
        increment_pc(&mut self.core.registers);
        Ok(())
    }

    /// Executes a `cbo.zero` instruction: writes a full 4 KiB block of zeros at the virtual
    /// address in `base`.
    pub fn cbo_zero(&mut self, base: Specifier) -> ExecutionResult {
        trace!("Executing cbo.zero ({base})");
        let address = self.core.registers.x(base);
        self.core
            .zero_block(address)
            .map_err(|err| convert_memory_error(err, AccessType::Write))?;
        increment_pc(&mut self.core.registers);
        Ok(())
    }

    pub fn ecall(&mut self) -> ExecutionResult {
        trace!("Executing ecall");
        Err(match self.core.privilege_mode {
            PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
            PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
            PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
        }
        .into())
    }

    pub fn ebreak(&mut self) -> ExecutionResult {
        trace!("Executing ebreak");
        Err(Exception::Breakpoint.into())
    }

    pub fn csrrw(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        trace!("Executing csrrw {dest} {csr} {src}");
        self.csr_reg_op(CsrOp::ReadWrite, dest, csr, src)
    }

    pub fn csrrs(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        trace!("Executing csrrs {dest} {csr} {src}");
        self.csr_reg_op(CsrOp::ReadSet, dest, csr, src)
    }

    pub fn csrrc(&mut self, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> ExecutionResult {
        trace!("Executing csrrc {dest} {csr} {src}");
        self.csr_reg_op(CsrOp::ReadClear, dest, csr, src)
    }

    pub fn csrrwi(&mut self, dest: Specifier, csr: CsrSpecifier, immediate: u32) -> ExecutionResult {
        trace!("Executing csrrwi {dest} {csr} {immediate}");
        self.csr_imm_op(CsrOp::ReadWrite, dest, csr, immediate)
    }

    pub fn csrrsi(&mut self, dest: Specifier, csr: CsrSpecifier, immediate: u32) -> ExecutionResult {
        trace!("Executing csrrsi {dest} {csr} {immediate}");
        self.csr_imm_op(CsrOp::ReadSet, dest, csr, immediate)
    }

    pub fn csrrci(&mut self, dest: Specifier, csr: CsrSpecifier, immediate: u32) -> ExecutionResult {
        trace!("Executing csrrci {dest} {csr} {immediate}");
        self.csr_imm_op(CsrOp::ReadClear, dest, csr, immediate)
    }

    /// Executes an `sret` instruction.
    ///
    /// Restores `(pc, mode, sstatus.SIE)` from `(sepc, sstatus.SPP, sstatus.SPIE)`, then marks
    /// the previous-state fields as consumed (`SPIE = 1`, `SPP = U`).
    pub fn sret(&mut self) -> ExecutionResult {
        trace!("Executing sret");
        if self.core.privilege_mode < PrivilegeLevel::Supervisor {
            return Err(Exception::IllegalInstruction.into());
        }
        let status = &mut self.core.status;
        let pp = status.spp();
        status.set_sie(status.spie());
        status.set_spie(true);
        status.set_spp(RawPrivilegeLevel::User);
        self.core.privilege_mode = pp;
        let sepc = self.core.trap.read_sepc();
        self.core.registers.set_pc(sepc);
        Ok(())
    }

    /// Executes an `mret` instruction.
    ///
    /// Restores `(pc, mode, mstatus.MIE)` from `(mepc, mstatus.MPP, mstatus.MPIE)`, then marks
    /// the previous-state fields as consumed (`MPIE = 1`, `MPP = U`).
    pub fn mret(&mut self) -> ExecutionResult {
        trace!("Executing mret");
        if self.core.privilege_mode < PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction.into());
        }
        let status = &mut self.core.status;
        let pp = status.mpp();
        status.set_mie(status.mpie());
        status.set_mpie(true);
        status.set_mpp(RawPrivilegeLevel::User);
        self.core.privilege_mode = pp;
        let mepc = self.core.trap.read_mepc();
        self.core.registers.set_pc(mepc);
        Ok(())
    }

    /// Executes a `wfi` instruction.
    ///
    /// Implemented as a nop, which is allowed: the run loop polls for interrupts on its own
    /// schedule and never sleeps on behalf of the guest.
    pub fn wfi(&mut self) -> ExecutionResult {
        trace!("Executing wfi");
        increment_pc(&mut self.core.registers);
        Ok(())
    }

    /// Executes an `sfence.vma` instruction.
    ///
    /// Drops the cached page-table walks for the ASID in `x[asid]`, or for every ASID when `asid`
    /// is `x0`. The translation accelerator is dropped along with them; the block cache is not,
    /// because its keys are physical.
    pub fn sfence_vma(&mut self, vaddr: Specifier, asid: Specifier) -> ExecutionResult {
        trace!("Executing sfence.vma {vaddr} {asid}");
        // Per-address invalidation is folded into the per-ASID flush.
        let _ = vaddr;
        let asid_value = (asid != Specifier::X0).then(|| self.core.registers.x(asid));
        self.core.mmu.flush_pte_cache(asid_value);
        self.core.mmu.flush_accelerator();
        increment_pc(&mut self.core.registers);
        Ok(())
    }

    // Private generic implementations

    fn reg_imm_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, i32) -> u32,
    {
        let registers = &mut self.core.registers;
        registers.set_x(dest, op(registers.x(src), immediate));
        increment_pc(registers);
        Ok(())
    }

    fn reg_shamt_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        if shift_amount_u5 > 31 {
            panic!("out of range u5 used");
        }
        let registers = &mut self.core.registers;
        registers.set_x(dest, op(registers.x(src), shift_amount_u5));
        increment_pc(registers);
        Ok(())
    }

    fn reg_reg_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        let registers = &mut self.core.registers;
        registers.set_x(dest, op(registers.x(src1), registers.x(src2)));
        increment_pc(registers);
        Ok(())
    }

    /// First argument of `op` is the value from memory, the second the value of `src`.
    fn amo_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        addr: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: Fn(u32, u32) -> u32,
    {
        let address = self.core.registers.x(addr);
        let src_value = self.core.registers.x(src);
        let mem_value = self
            .core
            .amo_word(address, |mem| op(mem, src_value))
            .map_err(|err| convert_memory_error(err, AccessType::Write))?;
        let registers = &mut self.core.registers;
        registers.set_x(dest, mem_value);
        increment_pc(registers);
        Ok(())
    }

    fn jump_op<F>(&mut self, dest: Specifier, compute_target: F) -> ExecutionResult
    where
        F: FnOnce(&Registers) -> u32,
    {
        let registers = &mut self.core.registers;
        let new_pc = compute_target(registers);
        let old_pc = registers.pc();
        registers.set_pc(new_pc);
        registers.set_x(dest, old_pc.wrapping_add(4));
        Ok(())
    }

    // Takes the branch if `predicate` returns `true`.
    fn cond_branch<P>(
        &mut self,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        predicate: P,
    ) -> ExecutionResult
    where
        P: FnOnce(u32, u32) -> bool,
    {
        let registers = &mut self.core.registers;
        if predicate(registers.x(src1), registers.x(src2)) {
            let new_pc = registers.pc().wrapping_add_signed(offset);
            registers.set_pc(new_pc);
        } else {
            increment_pc(registers);
        }
        Ok(())
    }

    fn load_op<F>(
        &mut self,
        dest: Specifier,
        base: Specifier,
        offset: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(&mut Core, u32) -> Result<u32, MemoryError>,
    {
        let address = self.core.registers.x(base).wrapping_add_signed(offset);
        let value =
            op(self.core, address).map_err(|err| convert_memory_error(err, AccessType::Read))?;
        let registers = &mut self.core.registers;
        registers.set_x(dest, value);
        increment_pc(registers);
        Ok(())
    }

    fn store_op<F>(
        &mut self,
        src: Specifier,
        base: Specifier,
        offset: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(&mut Core, u32, u32) -> Result<(), MemoryError>,
    {
        let value = self.core.registers.x(src);
        let address = self.core.registers.x(base).wrapping_add_signed(offset);
        op(self.core, address, value)
            .map_err(|err| convert_memory_error(err, AccessType::Write))?;
        increment_pc(&mut self.core.registers);
        Ok(())
    }

    fn csr_reg_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    ) -> ExecutionResult {
        let src_value = (op == CsrOp::ReadWrite || src != Specifier::X0)
            .then(|| self.core.registers.x(src));
        self.csr_op(op, dest, csr, src_value)
    }

    fn csr_imm_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    ) -> ExecutionResult {
        self.csr_op(
            op,
            dest,
            csr,
            (op == CsrOp::ReadWrite || immediate != 0).then_some(immediate),
        )
    }

    /// Common implementation of the six Zicsr instructions.
    ///
    /// > If rd=x0, then CSRRW shall not read the CSR and shall not cause any of the side effects
    /// > that might occur on a CSR read. For both CSRRS and CSRRC, if rs1=x0, then the instruction
    /// > will not write to the CSR at all.
    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src_value: Option<u32>,
    ) -> ExecutionResult {
        let privilege_level = self.core.privilege_mode;
        if op != CsrOp::ReadWrite || dest != Specifier::X0 {
            let old_value = self
                .core
                .read_csr(csr, privilege_level)
                .map_err(|_| Exception::IllegalInstruction)?;
            self.core.registers.set_x(dest, old_value);
        };
        if let Some(src_value) = src_value {
            let (value, mask) = match op {
                CsrOp::ReadWrite => (src_value, 0xFFFF_FFFF),
                CsrOp::ReadSet => (0xFFFF_FFFF, src_value),
                CsrOp::ReadClear => (0x0000_0000, src_value),
            };
            self.core
                .write_csr(csr, privilege_level, value, mask)
                .map_err(|_| Exception::IllegalInstruction)?;
        }
        increment_pc(&mut self.core.registers);
        Ok(())
    }
}

/// Classify a memory error by the kind of access that produced it: page faults become the
/// matching exception, bus errors stay fatal.
fn convert_memory_error(err: MemoryError, access_type: AccessType) -> ExecutionError {
    match err {
        MemoryError::PageFault(vaddr) => ExecutionError::Exception(match access_type {
            AccessType::Read => Exception::LoadPageFault(vaddr),
            AccessType::Write => Exception::StoreOrAmoPageFault(vaddr),
            AccessType::Execute => Exception::InstructionPageFault(vaddr),
        }),
        MemoryError::Bus(err) => ExecutionError::Bus(err),
    }
}

fn increment_pc(registers: &mut Registers) {
    let pc = registers.pc();
    registers.set_pc(pc.wrapping_add(4));
}
