use std::error::Error;
use std::fmt;

// CPU flag bits as documented in gbdev.io/pandocs/The_CPU_Flags.html
const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half Carry
const FLAG_C: u8 = 0x10; // Carry

// Interrupt vectors (gbdev.io/pandocs/Interrupts.html)
const INTERRUPT_VBLANK: u16 = 0x40;
const INTERRUPT_STAT: u16 = 0x48;
const INTERRUPT_TIMER: u16 = 0x50;
const INTERRUPT_SERIAL: u16 = 0x58;
const INTERRUPT_JOYPAD: u16 = 0x60;

// Post-boot CPU state from gbdev.io/pandocs/Power_Up_State.html
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

const BOOT_A: u8 = 0x01;
const BOOT_F: u8 = 0xB0;
const BOOT_B: u8 = 0x00;
const BOOT_C: u8 = 0x13;
const BOOT_D: u8 = 0x00;
const BOOT_E: u8 = 0xD8;
const BOOT_H: u8 = 0x01;
const BOOT_L: u8 = 0x4D;

const CYCLES_PER_M_CYCLE: u16 = 4;

/// Raised when execution reaches one of the eleven opcodes with no defined
/// behavior. On hardware these lock up the CPU, so the machine cannot
/// meaningfully continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFault {
    pub opcode: u8,
    pub pc: u16,
}

impl fmt::Display for CpuFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal opcode {:02X} at PC={:04X}",
            self.opcode, self.pc
        )
    }
}

impl Error for CpuFault {}

pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub cycles: u64,
    pub ime: bool,
    pub halted: bool,
    pub stopped: bool,
    halt_bug: bool,
    ime_enable_delay: u8,
    halt_pc: Option<u16>,
    halt_pending: u8,
}

impl Cpu {
    /// Create a CPU initialized to the post-boot register state.
    pub fn new() -> Self {
        Self {
            a: BOOT_A,
            f: BOOT_F,
            b: BOOT_B,
            c: BOOT_C,
            d: BOOT_D,
            e: BOOT_E,
            h: BOOT_H,
            l: BOOT_L,
            pc: BOOT_PC,
            sp: BOOT_SP,
            cycles: 0,
            ime: false,
            halted: false,
            stopped: false,
            halt_bug: false,
            ime_enable_delay: 0,
            halt_pc: None,
            halt_pending: 0,
        }
    }

    /// Create a CPU in an approximate power-on state suitable for executing
    /// a boot ROM mapped at 0x0000.
    ///
    /// Boot ROMs re-initialize the registers early, so starting from zeroed
    /// registers at PC 0 is sufficient; the important part is not starting
    /// from the post-boot state.
    pub fn new_power_on() -> Self {
        Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            pc: 0x0000,
            sp: 0x0000,
            cycles: 0,
            ime: false,
            halted: false,
            stopped: false,
            halt_bug: false,
            ime_enable_delay: 0,
            halt_pc: None,
            halt_pending: 0,
        }
    }

    fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn enter_halt(&mut self, next_pc: u16, buffered: u8) {
        self.halted = true;
        self.halt_pc = Some(next_pc);
        self.halt_pending = buffered;
    }

    fn exit_halt(&mut self) {
        self.halted = false;
        self.halt_pc = None;
        self.halt_pending = 0;
    }

    fn next_interrupt(pending: u8) -> (u8, u16) {
        if pending & 0x01 != 0 {
            (0x01, INTERRUPT_VBLANK)
        } else if pending & 0x02 != 0 {
            (0x02, INTERRUPT_STAT)
        } else if pending & 0x04 != 0 {
            (0x04, INTERRUPT_TIMER)
        } else if pending & 0x08 != 0 {
            (0x08, INTERRUPT_SERIAL)
        } else {
            (0x10, INTERRUPT_JOYPAD)
        }
    }

    #[inline]
    fn tick(&mut self, mmu: &mut crate::mmu::Mmu, m_cycles: u8) {
        let cycles = CYCLES_PER_M_CYCLE * m_cycles as u16;
        self.cycles += cycles as u64;
        mmu.tick(cycles);
    }

    #[inline(always)]
    fn fetch8(&mut self, mmu: &mut crate::mmu::Mmu) -> u8 {
        let val = mmu.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn fetch16(&mut self, mmu: &mut crate::mmu::Mmu) -> u16 {
        let lo = self.fetch8(mmu) as u16;
        let hi = self.fetch8(mmu) as u16;
        (hi << 8) | lo
    }

    #[inline(always)]
    fn read8(&mut self, mmu: &mut crate::mmu::Mmu, addr: u16) -> u8 {
        let val = mmu.read_byte(addr);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn write8(&mut self, mmu: &mut crate::mmu::Mmu, addr: u16, val: u8) {
        mmu.write_byte(addr, val);
        self.tick(mmu, 1);
    }

    /// Formatted CPU state string for debugging.
    pub fn debug_state(&self) -> String {
        format!(
            "AF:{:04X} BC:{:04X} DE:{:04X} HL:{:04X} PC:{:04X} SP:{:04X} CY:{}",
            ((self.a as u16) << 8) | self.f as u16,
            ((self.b as u16) << 8) | self.c as u16,
            ((self.d as u16) << 8) | self.e as u16,
            self.get_hl(),
            self.pc,
            self.sp,
            self.cycles
        )
    }

    fn push_stack(&mut self, mmu: &mut crate::mmu::Mmu, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, val as u8);
    }

    fn pop_stack(&mut self, mmu: &mut crate::mmu::Mmu) -> u16 {
        let lo = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    fn read_reg(&mut self, mmu: &mut crate::mmu::Mmu, index: u8) -> u8 {
        match index {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(mmu, self.get_hl()),
            7 => self.a,
            _ => unreachable!(),
        }
    }

    fn write_reg(&mut self, mmu: &mut crate::mmu::Mmu, index: u8, val: u8) {
        match index {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, val);
            }
            7 => self.a = val,
            _ => unreachable!(),
        }
    }

    fn handle_cb(&mut self, opcode: u8, mmu: &mut crate::mmu::Mmu) {
        match opcode {
            0x00..=0x07 => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let res = val.rotate_left(1);
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x08..=0x0F => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let res = val.rotate_right(1);
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x10..=0x17 => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
                let res = (val << 1) | carry_in;
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x18..=0x1F => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
                let res = (val >> 1) | ((carry_in as u8) << 7);
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x20..=0x27 => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let res = val << 1;
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x28..=0x2F => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let res = (val >> 1) | (val & 0x80);
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x30..=0x37 => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let res = val.rotate_left(4);
                self.write_reg(mmu, r, res);
                self.f = if res == 0 { FLAG_Z } else { 0 };
            }
            0x38..=0x3F => {
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                let res = val >> 1;
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x40..=0x7F => {
                let bit = (opcode - 0x40) >> 3;
                let r = opcode & 0x07;
                let val = self.read_reg(mmu, r);
                self.f =
                    (self.f & FLAG_C) | FLAG_H | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
            }
            0x80..=0xBF => {
                let bit = (opcode - 0x80) >> 3;
                let r = opcode & 0x07;
                let mut val = self.read_reg(mmu, r);
                val &= !(1 << bit);
                self.write_reg(mmu, r, val);
            }
            0xC0..=0xFF => {
                let bit = (opcode - 0xC0) >> 3;
                let r = opcode & 0x07;
                let mut val = self.read_reg(mmu, r);
                val |= 1 << bit;
                self.write_reg(mmu, r, val);
            }
        }
    }

    fn handle_interrupts(&mut self, mmu: &mut crate::mmu::Mmu) {
        let pending = (mmu.if_reg & mmu.ie_reg) & 0x1F;
        if pending == 0 {
            return;
        }

        if self.ime {
            let (initial_bit, _) = Self::next_interrupt(pending);
            let mut return_pc = self.pc;

            if let Some(halt_pc) = self.halt_pc {
                if (self.halt_pending & initial_bit) != 0 {
                    return_pc = halt_pc.wrapping_sub(1);
                } else if self.halted {
                    return_pc = halt_pc;
                }
            }

            self.ime = false;

            // Interrupt entry pushes the return address onto the stack.
            // If the upper-byte push targets IE ($FFFF), the write can change
            // which interrupt is dispatched (or cancel dispatch entirely).
            // Re-check IE/IF after the upper-byte push but before the
            // lower-byte push.

            self.sp = self.sp.wrapping_sub(1);
            self.write8(mmu, self.sp, (return_pc >> 8) as u8);

            let queue = (mmu.ie_reg & mmu.if_reg) & 0x1F;
            if queue == 0 {
                // Lower byte push still occurs, but the dispatch is cancelled.
                self.sp = self.sp.wrapping_sub(1);
                self.write8(mmu, self.sp, return_pc as u8);

                self.exit_halt();
                self.pc = 0;
                self.tick(mmu, 3);
                return;
            }

            let (bit, vector) = Self::next_interrupt(queue);
            mmu.if_reg &= !bit;

            self.sp = self.sp.wrapping_sub(1);
            self.write8(mmu, self.sp, return_pc as u8);

            if (self.halt_pending & bit) != 0 {
                self.halt_pending &= !bit;
            } else {
                self.exit_halt();
            }

            self.pc = vector;
            self.tick(mmu, 3);
        } else if self.halted {
            self.exit_halt();
        }
    }

    /// Execute one instruction (or one halted/stopped machine cycle) and
    /// service interrupt dispatch.
    pub fn step(&mut self, mmu: &mut crate::mmu::Mmu) -> Result<(), CpuFault> {
        if self.stopped {
            // STOP mode ends when a selected joypad line goes low.
            self.tick(mmu, 1);
            if mmu.if_reg & 0x10 != 0 {
                self.stopped = false;
            }
            return Ok(());
        }

        if self.halted {
            self.tick(mmu, 1);
            self.handle_interrupts(mmu);
            return Ok(());
        }

        let enable_after = self.ime_enable_delay == 1;
        let opcode = if self.halt_bug {
            // The halt bug replays the byte after HALT: read it without
            // advancing PC.
            self.halt_bug = false;
            self.read8(mmu, self.pc)
        } else {
            self.fetch8(mmu)
        };
        match opcode {
            0x00 => {}
            0x01 => {
                let val = self.fetch16(mmu);
                self.set_bc(val);
            }
            0x02 => {
                let addr = self.get_bc();
                self.write8(mmu, addr, self.a);
            }
            0x03 => {
                let val = self.get_bc().wrapping_add(1);
                self.set_bc(val);
                self.tick(mmu, 1);
            }
            0x04 => {
                let res = self.b.wrapping_add(1);
                self.f = (self.f & FLAG_C)
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.b & 0x0F) + 1 > 0x0F {
                        FLAG_H
                    } else {
                        0
                    };
                self.b = res;
            }
            0x05 => {
                let res = self.b.wrapping_sub(1);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if self.b & 0x0F == 0 { FLAG_H } else { 0 };
                self.b = res;
            }
            0x06 => {
                let val = self.fetch8(mmu);
                self.b = val;
            }
            0x07 => {
                let carry = (self.a & 0x80) != 0;
                self.a = self.a.rotate_left(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x08 => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, (self.sp & 0xFF) as u8);
                self.write8(mmu, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x09 => {
                let hl = self.get_hl();
                let bc = self.get_bc();
                let res = hl.wrapping_add(bc);
                self.f = (self.f & FLAG_Z)
                    | if ((hl & 0x0FFF) + (bc & 0x0FFF)) & 0x1000 != 0 {
                        FLAG_H
                    } else {
                        0
                    }
                    | if (hl as u32 + bc as u32) > 0xFFFF {
                        FLAG_C
                    } else {
                        0
                    };
                self.set_hl(res);
                self.tick(mmu, 1);
            }
            0x0A => {
                let addr = self.get_bc();
                self.a = self.read8(mmu, addr);
            }
            0x0B => {
                let val = self.get_bc().wrapping_sub(1);
                self.set_bc(val);
                self.tick(mmu, 1);
            }
            0x0C => {
                let res = self.c.wrapping_add(1);
                self.f = (self.f & FLAG_C)
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.c & 0x0F) + 1 > 0x0F {
                        FLAG_H
                    } else {
                        0
                    };
                self.c = res;
            }
            0x0D => {
                let res = self.c.wrapping_sub(1);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if self.c & 0x0F == 0 { FLAG_H } else { 0 };
                self.c = res;
            }
            0x0E => {
                let val = self.fetch8(mmu);
                self.c = val;
            }
            0x0F => {
                let carry = (self.a & 0x01) != 0;
                self.a = self.a.rotate_right(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x10 => {
                // STOP
                let _ = self.fetch8(mmu);
                mmu.reset_div();
                self.stopped = true;
            }
            0x11 => {
                let val = self.fetch16(mmu);
                self.set_de(val);
            }
            0x12 => {
                let addr = self.get_de();
                self.write8(mmu, addr, self.a);
            }
            0x13 => {
                let val = self.get_de().wrapping_add(1);
                self.set_de(val);
                self.tick(mmu, 1);
            }
            0x14 => {
                let res = self.d.wrapping_add(1);
                self.f = (self.f & FLAG_C)
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.d & 0x0F) + 1 > 0x0F {
                        FLAG_H
                    } else {
                        0
                    };
                self.d = res;
            }
            0x15 => {
                let res = self.d.wrapping_sub(1);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if self.d & 0x0F == 0 { FLAG_H } else { 0 };
                self.d = res;
            }
            0x16 => {
                let val = self.fetch8(mmu);
                self.d = val;
            }
            0x17 => {
                let carry = (self.a & 0x80) != 0;
                self.a = (self.a << 1) | if self.f & FLAG_C != 0 { 1 } else { 0 };
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x18 => {
                let offset = self.fetch8(mmu) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
                self.tick(mmu, 1);
            }
            0x19 => {
                let hl = self.get_hl();
                let de = self.get_de();
                let res = hl.wrapping_add(de);
                self.f = (self.f & FLAG_Z)
                    | if ((hl & 0x0FFF) + (de & 0x0FFF)) & 0x1000 != 0 {
                        FLAG_H
                    } else {
                        0
                    }
                    | if (hl as u32 + de as u32) > 0xFFFF {
                        FLAG_C
                    } else {
                        0
                    };
                self.set_hl(res);
                self.tick(mmu, 1);
            }
            0x1A => {
                let addr = self.get_de();
                self.a = self.read8(mmu, addr);
            }
            0x1B => {
                let val = self.get_de().wrapping_sub(1);
                self.set_de(val);
                self.tick(mmu, 1);
            }
            0x1C => {
                let res = self.e.wrapping_add(1);
                self.f = (self.f & FLAG_C)
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.e & 0x0F) + 1 > 0x0F {
                        FLAG_H
                    } else {
                        0
                    };
                self.e = res;
            }
            0x1D => {
                let res = self.e.wrapping_sub(1);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if self.e & 0x0F == 0 { FLAG_H } else { 0 };
                self.e = res;
            }
            0x1E => {
                let val = self.fetch8(mmu);
                self.e = val;
            }
            0x1F => {
                let carry = (self.a & 0x01) != 0;
                self.a = (self.a >> 1) | if self.f & FLAG_C != 0 { 0x80 } else { 0 };
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x20 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_Z == 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x21 => {
                let val = self.fetch16(mmu);
                self.set_hl(val);
            }
            0x22 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, self.a);
                self.set_hl(addr.wrapping_add(1));
            }
            0x23 => {
                let val = self.get_hl().wrapping_add(1);
                self.set_hl(val);
                self.tick(mmu, 1);
            }
            0x24 => {
                let res = self.h.wrapping_add(1);
                self.f = (self.f & FLAG_C)
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.h & 0x0F) + 1 > 0x0F {
                        FLAG_H
                    } else {
                        0
                    };
                self.h = res;
            }
            0x25 => {
                let res = self.h.wrapping_sub(1);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if self.h & 0x0F == 0 { FLAG_H } else { 0 };
                self.h = res;
            }
            0x26 => {
                let val = self.fetch8(mmu);
                self.h = val;
            }
            0x27 => {
                let mut correction = 0u8;
                let mut carry = false;
                if self.f & FLAG_H != 0 || (self.f & FLAG_N == 0 && (self.a & 0x0F) > 9) {
                    correction |= 0x06;
                }
                if self.f & FLAG_C != 0 || (self.f & FLAG_N == 0 && self.a > 0x99) {
                    correction |= 0x60;
                    carry = true;
                }
                if self.f & FLAG_N == 0 {
                    self.a = self.a.wrapping_add(correction);
                } else {
                    self.a = self.a.wrapping_sub(correction);
                }
                self.f = if self.a == 0 { FLAG_Z } else { 0 }
                    | (self.f & FLAG_N)
                    | if carry { FLAG_C } else { 0 };
            }
            0x28 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_Z != 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x29 => {
                let hl = self.get_hl();
                let res = hl.wrapping_add(hl);
                self.f = (self.f & FLAG_Z)
                    | if ((hl & 0x0FFF) << 1) & 0x1000 != 0 {
                        FLAG_H
                    } else {
                        0
                    }
                    | if (hl as u32 * 2) > 0xFFFF { FLAG_C } else { 0 };
                self.set_hl(res);
                self.tick(mmu, 1);
            }
            0x2A => {
                let addr = self.get_hl();
                self.a = self.read8(mmu, addr);
                self.set_hl(addr.wrapping_add(1));
            }
            0x2B => {
                let val = self.get_hl().wrapping_sub(1);
                self.set_hl(val);
                self.tick(mmu, 1);
            }
            0x2C => {
                let res = self.l.wrapping_add(1);
                self.f = (self.f & FLAG_C)
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.l & 0x0F) + 1 > 0x0F {
                        FLAG_H
                    } else {
                        0
                    };
                self.l = res;
            }
            0x2D => {
                let res = self.l.wrapping_sub(1);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if self.l & 0x0F == 0 { FLAG_H } else { 0 };
                self.l = res;
            }
            0x2E => {
                let val = self.fetch8(mmu);
                self.l = val;
            }
            0x2F => {
                self.a ^= 0xFF;
                self.f = (self.f & 0x90) | FLAG_N | FLAG_H;
            }
            0x30 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_C == 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x31 => {
                let val = self.fetch16(mmu);
                self.sp = val;
            }
            0x32 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, self.a);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x33 => {
                self.sp = self.sp.wrapping_add(1);
                self.tick(mmu, 1);
            }
            0x34 => {
                let addr = self.get_hl();
                let old = self.read8(mmu, addr);
                let val = old.wrapping_add(1);
                self.write8(mmu, addr, val);
                self.f = (self.f & FLAG_C)
                    | if val == 0 { FLAG_Z } else { 0 }
                    | if (old & 0x0F) + 1 > 0x0F { FLAG_H } else { 0 };
            }
            0x35 => {
                let addr = self.get_hl();
                let old = self.read8(mmu, addr);
                let val = old.wrapping_sub(1);
                self.write8(mmu, addr, val);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if val == 0 { FLAG_Z } else { 0 }
                    | if old & 0x0F == 0 { FLAG_H } else { 0 };
            }
            0x36 => {
                let val = self.fetch8(mmu);
                let addr = self.get_hl();
                self.write8(mmu, addr, val);
            }
            0x37 => {
                self.f = (self.f & FLAG_Z) | FLAG_C;
            }
            0x38 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_C != 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x39 => {
                let hl = self.get_hl();
                let sp = self.sp;
                let res = hl.wrapping_add(sp);
                self.f = (self.f & FLAG_Z)
                    | if ((hl & 0x0FFF) + (sp & 0x0FFF)) & 0x1000 != 0 {
                        FLAG_H
                    } else {
                        0
                    }
                    | if (hl as u32 + sp as u32) > 0xFFFF {
                        FLAG_C
                    } else {
                        0
                    };
                self.set_hl(res);
                self.tick(mmu, 1);
            }
            0x3A => {
                let addr = self.get_hl();
                self.a = self.read8(mmu, addr);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x3B => {
                self.sp = self.sp.wrapping_sub(1);
                self.tick(mmu, 1);
            }
            0x3C => {
                let res = self.a.wrapping_add(1);
                self.f = (self.f & FLAG_C)
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) + 1 > 0x0F {
                        FLAG_H
                    } else {
                        0
                    };
                self.a = res;
            }
            0x3D => {
                let res = self.a.wrapping_sub(1);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if self.a & 0x0F == 0 { FLAG_H } else { 0 };
                self.a = res;
            }
            0x3E => {
                let val = self.fetch8(mmu);
                self.a = val;
            }
            0x3F => {
                self.f = (self.f & FLAG_Z) | if self.f & FLAG_C != 0 { 0 } else { FLAG_C };
            }
            opcode @ 0x40..=0x7F if opcode != 0x76 => {
                let dest = (opcode >> 3) & 0x07;
                let src = opcode & 0x07;
                let val = self.read_reg(mmu, src);
                self.write_reg(mmu, dest, val);
            }
            0x76 => {
                let pending = (mmu.if_reg & mmu.ie_reg) & 0x1F;
                if self.ime || pending == 0 {
                    self.enter_halt(self.pc, 0);
                } else if self.ime_enable_delay > 0 {
                    self.enter_halt(self.pc, pending);
                } else {
                    self.halt_bug = true;
                    self.exit_halt();
                }
            }
            opcode @ 0x80..=0x87 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                let (res, carry) = self.a.overflowing_add(val);
                self.f = if res == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) + (val & 0x0F) > 0x0F {
                        FLAG_H
                    } else {
                        0
                    }
                    | if carry { FLAG_C } else { 0 };
                self.a = res;
            }
            opcode @ 0x88..=0x8F => {
                let val = self.read_reg(mmu, opcode & 0x07);
                let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
                let (res1, carry1) = self.a.overflowing_add(val);
                let (res2, carry2) = res1.overflowing_add(carry_in);
                self.f = if res2 == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) + (val & 0x0F) + carry_in > 0x0F {
                        FLAG_H
                    } else {
                        0
                    }
                    | if carry1 || carry2 { FLAG_C } else { 0 };
                self.a = res2;
            }
            opcode @ 0x90..=0x97 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                let (res, borrow) = self.a.overflowing_sub(val);
                self.f = FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) < (val & 0x0F) {
                        FLAG_H
                    } else {
                        0
                    }
                    | if borrow { FLAG_C } else { 0 };
                self.a = res;
            }
            opcode @ 0x98..=0x9F => {
                let val = self.read_reg(mmu, opcode & 0x07);
                let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
                let (res1, borrow1) = self.a.overflowing_sub(val);
                let (res2, borrow2) = res1.overflowing_sub(carry_in);
                self.f = FLAG_N
                    | if res2 == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) < ((val & 0x0F) + carry_in) {
                        FLAG_H
                    } else {
                        0
                    }
                    | if borrow1 || borrow2 { FLAG_C } else { 0 };
                self.a = res2;
            }
            opcode @ 0xA0..=0xA7 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.a &= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
            }
            opcode @ 0xA8..=0xAF => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.a ^= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            opcode @ 0xB0..=0xB7 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.a |= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            opcode @ 0xB8..=0xBF => {
                let val = self.read_reg(mmu, opcode & 0x07);
                let res = self.a.wrapping_sub(val);
                self.f = FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) < (val & 0x0F) {
                        FLAG_H
                    } else {
                        0
                    }
                    | if self.a < val { FLAG_C } else { 0 };
            }
            0xC0 => {
                if self.f & FLAG_Z == 0 {
                    self.tick(mmu, 1);
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                } else {
                    self.tick(mmu, 1);
                }
            }
            0xC1 => {
                let val = self.pop_stack(mmu);
                self.set_bc(val);
            }
            0xC2 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z == 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xC3 => {
                let addr = self.fetch16(mmu);
                self.pc = addr;
                self.tick(mmu, 1);
            }
            0xC4 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z == 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xC5 => {
                let val = self.get_bc();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xC6 => {
                let val = self.fetch8(mmu);
                let (res, carry) = self.a.overflowing_add(val);
                self.f = if res == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) + (val & 0x0F) > 0x0F {
                        FLAG_H
                    } else {
                        0
                    }
                    | if carry { FLAG_C } else { 0 };
                self.a = res;
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let target = (opcode & 0x38) as u16;
                self.tick(mmu, 1);
                self.push_stack(mmu, self.pc);
                self.pc = target;
            }
            0xC8 => {
                if self.f & FLAG_Z != 0 {
                    self.tick(mmu, 1);
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                } else {
                    self.tick(mmu, 1);
                }
            }
            0xC9 => {
                self.pc = self.pop_stack(mmu);
                self.tick(mmu, 1);
            }
            0xCA => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z != 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xCB => {
                let op = self.fetch8(mmu);
                self.handle_cb(op, mmu);
            }
            0xCC => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z != 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xCD => {
                let addr = self.fetch16(mmu);
                self.tick(mmu, 1);
                self.push_stack(mmu, self.pc);
                self.pc = addr;
            }
            0xCE => {
                let val = self.fetch8(mmu);
                let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
                let (res1, carry1) = self.a.overflowing_add(val);
                let (res2, carry2) = res1.overflowing_add(carry_in);
                self.f = if res2 == 0 { FLAG_Z } else { 0 }
                    | if ((self.a & 0x0F) + (val & 0x0F) + carry_in) > 0x0F {
                        FLAG_H
                    } else {
                        0
                    }
                    | if carry1 || carry2 { FLAG_C } else { 0 };
                self.a = res2;
            }
            0xD0 => {
                if self.f & FLAG_C == 0 {
                    self.tick(mmu, 1);
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                } else {
                    self.tick(mmu, 1);
                }
            }
            0xD1 => {
                let val = self.pop_stack(mmu);
                self.set_de(val);
            }
            0xD2 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C == 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xD4 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C == 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xD5 => {
                let val = self.get_de();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xD6 => {
                let val = self.fetch8(mmu);
                let (res, borrow) = self.a.overflowing_sub(val);
                self.f = FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) < (val & 0x0F) {
                        FLAG_H
                    } else {
                        0
                    }
                    | if borrow { FLAG_C } else { 0 };
                self.a = res;
            }
            0xD8 => {
                if self.f & FLAG_C != 0 {
                    self.tick(mmu, 1);
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                } else {
                    self.tick(mmu, 1);
                }
            }
            0xD9 => {
                // RETI enables IME without the EI delay.
                self.pc = self.pop_stack(mmu);
                self.ime = true;
                self.tick(mmu, 1);
            }
            0xDA => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C != 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xDC => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C != 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xDE => {
                let val = self.fetch8(mmu);
                let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
                let (res1, borrow1) = self.a.overflowing_sub(val);
                let (res2, borrow2) = res1.overflowing_sub(carry_in);
                self.f = FLAG_N
                    | if res2 == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) < (val & 0x0F) + carry_in {
                        FLAG_H
                    } else {
                        0
                    }
                    | if borrow1 || borrow2 { FLAG_C } else { 0 };
                self.a = res2;
            }
            0xE0 => {
                let offset = self.fetch8(mmu);
                let addr = 0xFF00u16 | offset as u16;
                self.write8(mmu, addr, self.a);
            }
            0xE1 => {
                let val = self.pop_stack(mmu);
                self.set_hl(val);
            }
            0xE2 => {
                let addr = 0xFF00u16 | self.c as u16;
                self.write8(mmu, addr, self.a);
            }
            0xE5 => {
                let val = self.get_hl();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xE6 => {
                let val = self.fetch8(mmu);
                self.a &= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
            }
            0xE8 => {
                let val = self.fetch8(mmu) as i8 as i16 as u16;
                let sp = self.sp;
                let result = sp.wrapping_add(val);
                self.f = if ((sp & 0xF) + (val & 0xF)) > 0xF {
                    FLAG_H
                } else {
                    0
                } | if ((sp & 0xFF) + (val & 0xFF)) > 0xFF {
                    FLAG_C
                } else {
                    0
                };
                self.sp = result;
                self.tick(mmu, 2);
            }
            0xE9 => {
                self.pc = self.get_hl();
            }
            0xEA => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, self.a);
            }
            0xEE => {
                let val = self.fetch8(mmu);
                self.a ^= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            0xF0 => {
                let offset = self.fetch8(mmu);
                let addr = 0xFF00u16 | offset as u16;
                self.a = self.read8(mmu, addr);
            }
            0xF1 => {
                let val = self.pop_stack(mmu);
                self.a = (val >> 8) as u8;
                // The low nibble of F does not exist in hardware.
                self.f = (val as u8) & 0xF0;
            }
            0xF2 => {
                let addr = 0xFF00u16 | self.c as u16;
                self.a = self.read8(mmu, addr);
            }
            0xF3 => {
                self.ime = false;
                self.ime_enable_delay = 0;
            }
            0xF5 => {
                let val = ((self.a as u16) << 8) | (self.f as u16 & 0xF0);
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xF6 => {
                let val = self.fetch8(mmu);
                self.a |= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            0xF8 => {
                let val = self.fetch8(mmu) as i8 as i16 as u16;
                let sp = self.sp;
                let res = sp.wrapping_add(val);
                self.f = if ((sp & 0xF) + (val & 0xF)) > 0xF {
                    FLAG_H
                } else {
                    0
                } | if ((sp & 0xFF) + (val & 0xFF)) > 0xFF {
                    FLAG_C
                } else {
                    0
                };
                self.set_hl(res);
                self.tick(mmu, 1);
            }
            0xF9 => {
                self.sp = self.get_hl();
                self.tick(mmu, 1);
            }
            0xFA => {
                let addr = self.fetch16(mmu);
                self.a = self.read8(mmu, addr);
            }
            0xFB => {
                // EI takes effect after the following instruction.
                self.ime_enable_delay = 2;
            }
            0xFE => {
                let val = self.fetch8(mmu);
                let res = self.a.wrapping_sub(val);
                self.f = FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if (self.a & 0x0F) < (val & 0x0F) {
                        FLAG_H
                    } else {
                        0
                    }
                    | if self.a < val { FLAG_C } else { 0 };
            }
            _ => {
                return Err(CpuFault {
                    opcode,
                    pc: self.pc.wrapping_sub(1),
                });
            }
        }

        if enable_after && self.ime_enable_delay > 0 {
            self.ime = true;
        }
        if self.ime_enable_delay > 0 {
            self.ime_enable_delay -= 1;
        }
        self.handle_interrupts(mmu);
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
