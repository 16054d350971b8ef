use lunaboy_core::{
    cartridge::{header_checksum, Cartridge},
    gameboy::GameBoy,
    ppu::DEFAULT_PALETTE,
};

/// A valid 32K ROM of NOPs. Execution walks through zeroed memory forever,
/// which is enough to exercise the frame loop.
fn nop_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 0x8000];
    rom[0x014D] = header_checksum(&rom);
    rom
}

#[test]
fn run_frame_renders_blank_background() {
    let mut gb = GameBoy::new();
    gb.load_cart(Cartridge::from_bytes(nop_rom()).unwrap());
    gb.run_frame().unwrap();

    // BGP is 0xFC post-boot, so color id 0 maps to shade 0.
    let expected = DEFAULT_PALETTE[0];
    assert!(gb.framebuffer().iter().all(|&px| px == expected));
}

#[test]
fn run_frame_advances_roughly_one_frame_of_cycles() {
    let mut gb = GameBoy::new();
    gb.load_cart(Cartridge::from_bytes(nop_rom()).unwrap());
    gb.run_frame().unwrap();
    let first = gb.cpu.cycles;
    gb.run_frame().unwrap();
    let second = gb.cpu.cycles - first;

    // 154 lines of 456 dots, give or take one instruction of overshoot.
    assert!((70224..70224 + 32).contains(&second), "frame took {second}");
}

#[test]
fn run_frame_with_lcd_off_still_returns() {
    let mut gb = GameBoy::new();
    gb.load_cart(Cartridge::from_bytes(nop_rom()).unwrap());
    // Disable the LCD before running.
    gb.mmu.write_byte(0xFF40, 0x00);
    gb.run_frame().unwrap();
    assert!(gb.cpu.cycles >= 70224);
}

#[test]
fn reset_preserves_cartridge() {
    let mut gb = GameBoy::new();
    gb.load_cart(Cartridge::from_bytes(nop_rom()).unwrap());
    gb.run_frame().unwrap();
    gb.reset();
    assert!(gb.mmu.cart.is_some());
    assert_eq!(gb.cpu.pc, 0x0100);
    assert_eq!(gb.cpu.cycles, 0);
}

#[test]
fn illegal_opcode_surfaces_from_run_frame() {
    let mut rom = nop_rom();
    rom[0x0100] = 0xDB;
    rom[0x014D] = header_checksum(&rom);
    let mut gb = GameBoy::new();
    gb.load_cart(Cartridge::from_bytes(rom).unwrap());
    let fault = gb.run_frame().unwrap_err();
    assert_eq!(fault.opcode, 0xDB);
    assert_eq!(fault.pc, 0x0100);
}
