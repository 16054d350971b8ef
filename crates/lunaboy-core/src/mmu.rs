use crate::{
    apu::Apu, cartridge::Cartridge, input::Input, ppu::Ppu, serial::Serial, timer::Timer,
};

const WRAM_SIZE: usize = 0x2000;
const HRAM_SIZE: usize = 0x7F;

// OAM DMA copies 160 bytes, one per M-cycle, and begins two M-cycles
// after the FF46 write.
const OAM_DMA_CYCLES: u16 = 640;
const OAM_DMA_START_DELAY: u16 = 8;
const CYCLES_PER_DMA_BYTE: u16 = 4;

pub struct Mmu {
    pub wram: [u8; WRAM_SIZE],
    pub hram: [u8; HRAM_SIZE],
    pub cart: Option<Cartridge>,
    pub boot_rom: Option<Vec<u8>>,
    pub boot_mapped: bool,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub input: Input,
    pub dma_cycles: u16,
    dma_source: u16,
    pending_dma: Option<u16>,
    pending_delay: u16,
}

impl Mmu {
    pub fn new() -> Self {
        let mut ppu = Ppu::new();
        ppu.apply_boot_state();

        Self {
            wram: [0; WRAM_SIZE],
            hram: [0; HRAM_SIZE],
            cart: None,
            boot_rom: None,
            boot_mapped: false,
            if_reg: 0xE1,
            ie_reg: 0,
            serial: Serial::new(),
            ppu,
            apu: Apu::new(),
            timer: Timer::new(),
            input: Input::new(),
            dma_cycles: 0,
            dma_source: 0,
            pending_dma: None,
            pending_delay: 0,
        }
    }

    /// State for a machine that will run a boot ROM instead of starting
    /// from the post-boot register values.
    pub fn new_power_on() -> Self {
        let mut mmu = Self::new();
        mmu.ppu = Ppu::new();
        mmu.if_reg = 0;
        mmu
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    pub fn save_cart_ram(&mut self) {
        if let Some(cart) = &mut self.cart
            && let Err(e) = cart.save_ram()
        {
            log::error!("failed to save cartridge RAM: {e}");
        }
    }

    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.boot_rom = Some(data);
        self.boot_mapped = true;
    }

    pub fn update_input(&mut self, state: u8) {
        self.input.update_state(state, &mut self.if_reg);
    }

    pub fn take_serial(&mut self) -> Vec<u8> {
        self.serial.take_output()
    }

    fn read_byte_inner(&mut self, addr: u16, allow_dma: bool) -> u8 {
        if !allow_dma && self.dma_cycles > 0 {
            // While OAM DMA runs the CPU can still reach ROM, WRAM/Echo and
            // the I/O/HRAM page; OAM itself reads back 0xFF.
            if let 0xFE00..=0xFEFF = addr {
                return 0xFF;
            }
        }
        match addr {
            0x0000..=0x00FF if self.boot_mapped => self
                .boot_rom
                .as_ref()
                .and_then(|b| b.get(addr as usize).copied())
                .unwrap_or(0xFF),
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                self.cart.as_ref().map(|c| c.read(addr)).unwrap_or(0xFF)
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[(addr - 0x8000) as usize]
                } else {
                    0xFF
                }
            }
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize],
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize],
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => self.input.read(),
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.if_reg | 0xE0,
            0xFF10..=0xFF3F => self.apu.read_reg(addr),
            0xFF46 => self.ppu.dma,
            0xFF40..=0xFF4B => self.ppu.read_reg(addr),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg,
            _ => 0xFF,
        }
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        self.read_byte_inner(addr, false)
    }

    fn dma_read_byte(&mut self, addr: u16) -> u8 {
        // The DMA engine cannot reach the OAM/HRAM page; reads there wrap to
        // the echo region below.
        let addr = if (0xFE00..=0xFF9F).contains(&addr) {
            addr.wrapping_sub(0x2000)
        } else {
            addr
        };

        self.read_byte_inner(addr, true)
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        if self.dma_cycles > 0 {
            if let 0xFE00..=0xFEFF = addr {
                return;
            }
        }

        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[(addr - 0x8000) as usize] = val;
                }
            }
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize] = val,
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize] = val,
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00 => self.input.write(val),
            0xFF01 | 0xFF02 => self.serial.write(addr, val),
            0xFF04..=0xFF07 => self.timer.write(addr, val, &mut self.if_reg),
            0xFF0F => self.if_reg = (val & 0x1F) | (self.if_reg & 0xE0),
            0xFF10..=0xFF3F => self.apu.write_reg(addr, val),
            0xFF46 => {
                self.ppu.dma = val;
                self.pending_dma = Some((val as u16) << 8);
                self.pending_delay = OAM_DMA_START_DELAY;
            }
            0xFF40..=0xFF4B => self.ppu.write_reg(addr, val),
            0xFF50 => {
                // Any nonzero write unmaps the boot ROM permanently.
                if val & 0x01 != 0 {
                    self.boot_mapped = false;
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val,
            _ => {}
        }
    }

    /// Advance the ongoing OAM DMA transfer if active.
    fn dma_step(&mut self, cycles: u16) {
        for _ in 0..cycles {
            if self.pending_delay > 0 {
                self.pending_delay -= 1;
                if self.pending_delay == 0
                    && let Some(src) = self.pending_dma.take()
                {
                    self.dma_source = src;
                    self.dma_cycles = OAM_DMA_CYCLES;
                }
            }

            if self.dma_cycles == 0 {
                continue;
            }

            let elapsed = OAM_DMA_CYCLES - self.dma_cycles;
            if elapsed % CYCLES_PER_DMA_BYTE == 0 {
                let idx = elapsed / CYCLES_PER_DMA_BYTE;
                if idx < 0xA0 {
                    let byte = self.dma_read_byte(self.dma_source.wrapping_add(idx));
                    self.ppu.oam[idx as usize] = byte;
                }
            }

            self.dma_cycles -= 1;
        }
    }

    /// Return true if an OAM DMA transfer is in progress.
    pub fn dma_active(&self) -> bool {
        self.dma_cycles > 0 || self.pending_delay > 0
    }

    pub fn reset_div(&mut self) {
        self.timer.reset_div(&mut self.if_reg);
    }

    /// Advance every clocked subsystem by `cycles` T-cycles. Called once per
    /// CPU memory access so peripherals observe mid-instruction time.
    pub fn tick(&mut self, cycles: u16) {
        if let Some(cart) = self.cart.as_mut() {
            cart.step_rtc(cycles);
        }
        self.timer.step(cycles, &mut self.if_reg);
        self.dma_step(cycles);
        self.apu.step(cycles);
        self.serial.step(cycles, &mut self.if_reg);
        self.ppu.step(cycles, &mut self.if_reg);
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
