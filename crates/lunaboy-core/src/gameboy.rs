use crate::{
    cpu::{Cpu, CpuFault},
    mmu::Mmu,
    ppu::SCREEN_HEIGHT,
    ppu::SCREEN_WIDTH,
    serial::LinkPort,
};

/// The complete machine: CPU plus everything hanging off the bus.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
}

impl GameBoy {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            mmu: Mmu::new(),
        }
    }

    /// Create a machine in an approximate power-on state suitable for
    /// executing a boot ROM.
    pub fn new_power_on() -> Self {
        Self {
            cpu: Cpu::new_power_on(),
            mmu: Mmu::new_power_on(),
        }
    }

    pub fn load_cart(&mut self, cart: crate::cartridge::Cartridge) {
        self.mmu.load_cart(cart);
    }

    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.mmu.load_boot_rom(data);
    }

    pub fn connect_link(&mut self, port: Box<dyn LinkPort>) {
        self.mmu.serial.connect(port);
    }

    /// Reset to the post-boot state while preserving the loaded cartridge
    /// and boot ROM.
    pub fn reset(&mut self) {
        let cart = self.mmu.cart.take();
        let boot = self.mmu.boot_rom.take();
        let palette = self.mmu.ppu.palette();
        self.cpu = Cpu::new();
        self.mmu = Mmu::new();
        self.mmu.ppu.set_palette(palette);
        if let Some(c) = cart {
            self.mmu.load_cart(c);
        }
        if let Some(b) = boot {
            self.mmu.load_boot_rom(b);
        }
    }

    /// Execute a single CPU instruction (and the peripheral time it carries).
    pub fn step(&mut self) -> Result<(), CpuFault> {
        self.cpu.step(&mut self.mmu)
    }

    /// Run until the PPU finishes the current frame.
    ///
    /// With the LCD disabled no frame is ever produced, so this falls back
    /// to running one frame's worth of cycles.
    pub fn run_frame(&mut self) -> Result<(), CpuFault> {
        const CYCLES_PER_FRAME: u64 = 70224;
        let start = self.cpu.cycles;
        while !self.mmu.ppu.frame_ready() {
            self.step()?;
            if self.cpu.cycles.wrapping_sub(start) >= CYCLES_PER_FRAME
                && !self.mmu.ppu.lcd_enabled()
            {
                break;
            }
        }
        self.mmu.ppu.clear_frame_flag();
        Ok(())
    }

    /// Latch the current button state. Active low: bits 0-3 are
    /// right/left/up/down, bits 4-7 are A/B/Select/Start, 0 meaning pressed.
    pub fn set_buttons(&mut self, state: u8) {
        self.mmu.update_input(state);
    }

    pub fn framebuffer(&self) -> &[u32; SCREEN_WIDTH * SCREEN_HEIGHT] {
        self.mmu.ppu.framebuffer()
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}
