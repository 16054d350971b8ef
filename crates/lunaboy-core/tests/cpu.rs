use lunaboy_core::{cpu::Cpu, mmu::Mmu};

/// Place a program in WRAM and point the CPU at it. The LCD is switched off
/// so the PPU never raises interrupts under the test's feet.
fn machine_with_program(program: &[u8]) -> (Cpu, Mmu) {
    let mut mmu = Mmu::new();
    mmu.write_byte(0xFF40, 0x00);
    for (i, &b) in program.iter().enumerate() {
        mmu.write_byte(0xC000 + i as u16, b);
    }
    let mut cpu = Cpu::new();
    cpu.pc = 0xC000;
    (cpu, mmu)
}

#[test]
fn nop_takes_one_machine_cycle() {
    let (mut cpu, mut mmu) = machine_with_program(&[0x00]);
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.cycles, 4);
    assert_eq!(cpu.pc, 0xC001);
}

#[test]
fn add_sets_half_and_full_carry() {
    // LD A,0x3C ; ADD A,0xC4
    let (mut cpu, mut mmu) = machine_with_program(&[0x3E, 0x3C, 0xC6, 0xC4]);
    cpu.step(&mut mmu).unwrap();
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.a, 0x00);
    // Z and C set, H set (0xC + 0x4 carries out of bit 3)
    assert_eq!(cpu.f, 0xB0);
}

#[test]
fn inc_preserves_carry_flag() {
    // SCF ; INC B
    let (mut cpu, mut mmu) = machine_with_program(&[0x37, 0x04]);
    cpu.b = 0x0F;
    cpu.step(&mut mmu).unwrap();
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.b, 0x10);
    assert_eq!(cpu.f & 0x10, 0x10, "carry survives INC");
    assert_eq!(cpu.f & 0x20, 0x20, "half carry from 0x0F");
}

#[test]
fn daa_adjusts_bcd_addition() {
    // LD A,0x15 ; ADD A,0x27 ; DAA
    let (mut cpu, mut mmu) = machine_with_program(&[0x3E, 0x15, 0xC6, 0x27, 0x27]);
    cpu.step(&mut mmu).unwrap();
    cpu.step(&mut mmu).unwrap();
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.a, 0x42);
}

#[test]
fn push_pop_round_trip_masks_flags() {
    // LD BC,0x12FF ; PUSH BC ; POP AF
    let (mut cpu, mut mmu) = machine_with_program(&[0x01, 0xFF, 0x12, 0xC5, 0xF1]);
    cpu.sp = 0xDFFF;
    cpu.step(&mut mmu).unwrap();
    cpu.step(&mut mmu).unwrap();
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.a, 0x12);
    // The low nibble of F always reads zero.
    assert_eq!(cpu.f, 0xF0);
    assert_eq!(cpu.sp, 0xDFFF);
}

#[test]
fn call_and_ret_cycle_counts() {
    // CALL 0xC010 ; ... at 0xC010: RET
    let mut program = [0x00u8; 0x11];
    program[0] = 0xCD;
    program[1] = 0x10;
    program[2] = 0xC0;
    program[0x10] = 0xC9;
    let (mut cpu, mut mmu) = machine_with_program(&program);
    cpu.sp = 0xDFFF;
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.pc, 0xC010);
    assert_eq!(cpu.cycles, 24);
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.pc, 0xC003);
    assert_eq!(cpu.cycles, 24 + 16);
}

#[test]
fn illegal_opcode_reports_fault() {
    let (mut cpu, mut mmu) = machine_with_program(&[0x00, 0xD3]);
    cpu.step(&mut mmu).unwrap();
    let fault = cpu.step(&mut mmu).unwrap_err();
    assert_eq!(fault.opcode, 0xD3);
    assert_eq!(fault.pc, 0xC001);
}

#[test]
fn every_documented_illegal_opcode_faults() {
    for opcode in [
        0xD3u8, 0xDB, 0xDD, 0xE3, 0xE4, 0xEB, 0xEC, 0xED, 0xF4, 0xFC, 0xFD,
    ] {
        let (mut cpu, mut mmu) = machine_with_program(&[opcode]);
        assert!(cpu.step(&mut mmu).is_err(), "opcode {opcode:#04X}");
    }
}

#[test]
fn ei_takes_effect_after_next_instruction() {
    // EI ; NOP ; NOP
    let (mut cpu, mut mmu) = machine_with_program(&[0xFB, 0x00, 0x00]);
    cpu.step(&mut mmu).unwrap();
    assert!(!cpu.ime, "IME still off directly after EI");
    cpu.step(&mut mmu).unwrap();
    assert!(cpu.ime, "IME on after the following instruction");
}

#[test]
fn interrupt_dispatch_jumps_to_vector() {
    let (mut cpu, mut mmu) = machine_with_program(&[0x00]);
    cpu.sp = 0xDFFF;
    cpu.ime = true;
    mmu.ie_reg = 0x04;
    mmu.if_reg |= 0x04;
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.pc, 0x0050);
    assert!(!cpu.ime);
    assert_eq!(mmu.if_reg & 0x04, 0, "IF bit acknowledged");
    assert_eq!(cpu.sp, 0xDFFD);
    // Return address on the stack points past the NOP.
    assert_eq!(mmu.read_byte(0xDFFD), 0x01);
    assert_eq!(mmu.read_byte(0xDFFE), 0xC0);
}

#[test]
fn interrupt_priority_prefers_lowest_bit() {
    let (mut cpu, mut mmu) = machine_with_program(&[0x00]);
    cpu.sp = 0xDFFF;
    cpu.ime = true;
    mmu.ie_reg = 0x1F;
    mmu.if_reg |= 0x12; // joypad and STAT both pending
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.pc, 0x0048, "STAT wins over joypad");
    assert_eq!(mmu.if_reg & 0x10, 0x10, "joypad stays pending");
}

#[test]
fn halt_resumes_on_interrupt_without_ime() {
    // HALT ; NOP
    let (mut cpu, mut mmu) = machine_with_program(&[0x76, 0x00]);
    cpu.step(&mut mmu).unwrap();
    assert!(cpu.halted);
    cpu.step(&mut mmu).unwrap();
    assert!(cpu.halted, "stays halted with nothing pending");

    mmu.ie_reg = 0x08;
    mmu.if_reg |= 0x08;
    cpu.step(&mut mmu).unwrap();
    assert!(!cpu.halted);
    // Without IME the pending interrupt is not dispatched.
    assert_eq!(mmu.if_reg & 0x08, 0x08);
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.pc, 0xC002);
}

#[test]
fn halt_bug_replays_following_byte() {
    // HALT with IME off and an interrupt already pending: the byte after
    // HALT executes twice. INC A lands twice here.
    let (mut cpu, mut mmu) = machine_with_program(&[0x76, 0x3C, 0x00]);
    cpu.a = 0;
    mmu.ie_reg = 0x01;
    mmu.if_reg |= 0x01;
    cpu.step(&mut mmu).unwrap(); // HALT, bug armed
    assert!(!cpu.halted);
    cpu.step(&mut mmu).unwrap(); // INC A without PC advance
    cpu.step(&mut mmu).unwrap(); // INC A again
    assert_eq!(cpu.a, 2);
    assert_eq!(cpu.pc, 0xC002);
}

#[test]
fn jr_signed_displacement() {
    // JR -2 loops onto itself
    let (mut cpu, mut mmu) = machine_with_program(&[0x18, 0xFE]);
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.pc, 0xC000);
    assert_eq!(cpu.cycles, 12);
}

#[test]
fn add_sp_signed_flags_from_low_byte() {
    // ADD SP,-1 with SP=0x0000
    let (mut cpu, mut mmu) = machine_with_program(&[0xE8, 0xFF]);
    cpu.sp = 0x0000;
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.sp, 0xFFFF);
    assert_eq!(cpu.f & 0x30, 0x00, "no carries out of a zero low byte");
    assert_eq!(cpu.f & 0x80, 0x00, "Z always cleared");
}

#[test]
fn cb_bit_preserves_carry() {
    // SCF ; BIT 7,A
    let (mut cpu, mut mmu) = machine_with_program(&[0x37, 0xCB, 0x7F]);
    cpu.a = 0x00;
    cpu.step(&mut mmu).unwrap();
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.f & 0x80, 0x80, "bit 7 clear sets Z");
    assert_eq!(cpu.f & 0x20, 0x20, "H forced");
    assert_eq!(cpu.f & 0x10, 0x10, "carry untouched");
}

#[test]
fn cb_swap_rotates_nibbles() {
    let (mut cpu, mut mmu) = machine_with_program(&[0xCB, 0x37]);
    cpu.a = 0xF1;
    cpu.step(&mut mmu).unwrap();
    assert_eq!(cpu.a, 0x1F);
    assert_eq!(cpu.f, 0x00);
}
