// Screen resolution
pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

// Timing constants per LCD mode in T-cycles
const MODE0_CYCLES: u16 = 204; // HBlank
const MODE1_CYCLES: u16 = 456; // One line during VBlank
const MODE2_CYCLES: u16 = 80; // OAM scan
const MODE3_CYCLES: u16 = 172; // Pixel transfer

// Number of lines spent in VBlank
const VBLANK_LINES: u8 = 10;

// Sprite limits
const MAX_SPRITES_PER_LINE: usize = 10;
const TOTAL_SPRITES: usize = 40;

// Internal memory sizes
const VRAM_SIZE: usize = 0x2000;
const OAM_SIZE: usize = 0xA0;

// Window X position is clipped if greater than this value
const WINDOW_X_MAX: u8 = 166;

// VRAM layout constants
const BG_MAP_0_BASE: usize = 0x1800;
const BG_MAP_1_BASE: usize = 0x1C00;
const TILE_DATA_0_BASE: usize = 0x0000;
const TILE_DATA_1_BASE: usize = 0x0800;

// LCD modes used in the `mode` field
const MODE_HBLANK: u8 = 0;
const MODE_VBLANK: u8 = 1;
const MODE_OAM: u8 = 2;
const MODE_TRANSFER: u8 = 3;

/// Default shade colors in 0x00RRGGBB order for the `pixels` crate.
pub const DEFAULT_PALETTE: [u32; 4] = [0x009BBC0F, 0x008BAC0F, 0x00306230, 0x000F380F];

pub struct Ppu {
    pub vram: [u8; VRAM_SIZE],
    pub oam: [u8; OAM_SIZE],

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    lyc_eq_ly: bool,
    pub dma: u8,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,

    /// Internal window line counter
    win_line_counter: u8,

    mode_clock: u16,
    pub mode: u8,

    /// Host colors for the four shades, 0x00RRGGBB.
    palette: [u32; 4],
    /// A palette change requested mid-frame, applied at the next VBlank.
    pending_palette: Option<[u32; 4]>,

    pub framebuffer: [u32; SCREEN_WIDTH * SCREEN_HEIGHT],
    line_color_zero: [bool; SCREEN_WIDTH],
    /// Latched sprites for the current scanline
    line_sprites: [Sprite; MAX_SPRITES_PER_LINE],
    sprite_count: usize,
    /// Indicates a completed frame is available in `framebuffer`
    frame_ready: bool,
    stat_irq_line: bool,
}

#[derive(Copy, Clone, Default)]
struct Sprite {
    x: i16,
    y: i16,
    tile: u8,
    flags: u8,
    oam_index: usize,
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            vram: [0; VRAM_SIZE],
            oam: [0; OAM_SIZE],
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            lyc_eq_ly: false,
            dma: 0,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            win_line_counter: 0,
            mode_clock: 0,
            mode: MODE_OAM,
            palette: DEFAULT_PALETTE,
            pending_palette: None,
            framebuffer: [0; SCREEN_WIDTH * SCREEN_HEIGHT],
            line_color_zero: [false; SCREEN_WIDTH],
            line_sprites: [Sprite::default(); MAX_SPRITES_PER_LINE],
            sprite_count: 0,
            frame_ready: false,
            stat_irq_line: false,
        }
    }

    /// Collect up to 10 sprites visible on the current scanline.
    /// Drawing priority is X position, ties broken by OAM index.
    fn oam_scan(&mut self) {
        let sprite_height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        self.sprite_count = 0;
        for i in 0..TOTAL_SPRITES {
            if self.sprite_count >= MAX_SPRITES_PER_LINE {
                break;
            }
            let base = i * 4;
            let y = self.oam[base] as i16 - 16;
            if self.ly as i16 >= y && (self.ly as i16) < y + sprite_height {
                self.line_sprites[self.sprite_count] = Sprite {
                    x: self.oam[base + 1] as i16 - 8,
                    y,
                    tile: self.oam[base + 2],
                    flags: self.oam[base + 3],
                    oam_index: i,
                };
                self.sprite_count += 1;
            }
        }
        self.line_sprites[..self.sprite_count].sort_by_key(|s| (s.x, s.oam_index));
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc & 0x80 != 0
    }

    /// VRAM is inaccessible to the CPU during pixel transfer (mode 3).
    pub fn vram_accessible(&self) -> bool {
        !self.lcd_enabled() || self.mode != MODE_TRANSFER
    }

    /// OAM is inaccessible during OAM scan (mode 2) and pixel transfer.
    pub fn oam_accessible(&self) -> bool {
        !self.lcd_enabled() || self.mode == MODE_HBLANK || self.mode == MODE_VBLANK
    }

    /// Initialize registers to the state expected after the boot ROM
    /// has finished executing.
    pub fn apply_boot_state(&mut self) {
        self.lcdc = 0x91;
        self.stat = 0x00;
        self.dma = 0xFF;
        self.bgp = 0xFC;
        self.win_line_counter = 0;
        self.ly = 0;
        self.mode = MODE_OAM;
        self.mode_clock = 0;
        self.lyc_eq_ly = self.ly == self.lyc;
        self.stat_irq_line = false;
    }

    /// Returns true if a full frame has been rendered and is ready to display.
    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    /// Returns the current framebuffer. Call `frame_ready()` to check if a
    /// frame is complete. After presenting, call `clear_frame_flag()`.
    pub fn framebuffer(&self) -> &[u32; SCREEN_WIDTH * SCREEN_HEIGHT] {
        &self.framebuffer
    }

    /// Clears the frame ready flag after a frame has been consumed.
    pub fn clear_frame_flag(&mut self) {
        self.frame_ready = false;
    }

    /// Request new host colors for the four shades. The change is held until
    /// the next VBlank so a frame is never drawn with two palettes.
    pub fn set_palette(&mut self, colors: [u32; 4]) {
        if self.mode == MODE_VBLANK || self.lcdc & 0x80 == 0 {
            self.palette = colors;
            self.pending_palette = None;
        } else {
            self.pending_palette = Some(colors);
        }
    }

    /// The host colors currently in effect.
    pub fn palette(&self) -> [u32; 4] {
        self.palette
    }

    fn update_lyc_compare(&mut self) {
        if self.lcdc & 0x80 != 0 {
            self.lyc_eq_ly = self.ly == self.lyc;
        }
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                (self.stat & 0x78)
                    | 0x80
                    | (self.mode & 0x03)
                    | if self.lyc_eq_ly { 0x04 } else { 0 }
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF46 => self.dma,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF40 => {
                let was_on = self.lcdc & 0x80 != 0;
                self.lcdc = val;
                if was_on && self.lcdc & 0x80 == 0 {
                    self.mode = MODE_HBLANK;
                    self.mode_clock = 0;
                    self.win_line_counter = 0;
                    self.ly = 0;
                }
                if self.lcdc & 0x80 != 0 {
                    self.update_lyc_compare();
                }
            }
            0xFF41 => self.stat = (self.stat & 0x07) | (val & 0xF8),
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {}
            0xFF45 => {
                self.lyc = val;
                self.update_lyc_compare();
            }
            0xFF46 => self.dma = val,
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            _ => {}
        }
    }

    #[inline(always)]
    fn shade(palette: u8, color_id: u8) -> u8 {
        (palette >> (color_id * 2)) & 0x03
    }

    fn tile_data_addr(&self, tile_index: u8) -> usize {
        if self.lcdc & 0x10 != 0 {
            TILE_DATA_0_BASE + tile_index as usize * 16
        } else {
            TILE_DATA_1_BASE + ((tile_index as i8 as i16 + 128) as usize) * 16
        }
    }

    fn render_scanline(&mut self) {
        if self.lcdc & 0x80 == 0 || self.ly as usize >= SCREEN_HEIGHT {
            return;
        }

        self.line_color_zero.fill(false);

        let bg_enabled = self.lcdc & 0x01 != 0;

        // Pre-fill the scanline. When the background is disabled via LCDC
        // bit 0 the LCD outputs color 0 for every pixel and sprites treat
        // the line as having color 0.
        let bg_color = self.palette[Self::shade(self.bgp, 0) as usize];
        for x in 0..SCREEN_WIDTH {
            let idx = self.ly as usize * SCREEN_WIDTH + x;
            self.framebuffer[idx] = bg_color;
            self.line_color_zero[x] = true;
        }

        if bg_enabled {
            let tile_map_base = if self.lcdc & 0x08 != 0 {
                BG_MAP_1_BASE
            } else {
                BG_MAP_0_BASE
            };

            // draw background
            for x in 0..SCREEN_WIDTH as u16 {
                let px = x.wrapping_add(self.scx as u16) & 0xFF;
                let tile_col = (px / 8) as usize;
                let bg_y = (self.ly as u16 + self.scy as u16) & 0xFF;
                let tile_row = (bg_y / 8) as usize;
                let tile_y = (bg_y % 8) as usize;

                let tile_index = self.vram[tile_map_base + tile_row * 32 + tile_col];
                let addr = self.tile_data_addr(tile_index);
                let bit = 7 - (px % 8) as usize;
                let lo = self.vram[addr + tile_y * 2];
                let hi = self.vram[addr + tile_y * 2 + 1];
                let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                let shade = Self::shade(self.bgp, color_id);
                let idx = self.ly as usize * SCREEN_WIDTH + x as usize;
                self.framebuffer[idx] = self.palette[shade as usize];
                self.line_color_zero[x as usize] = color_id == 0;
            }

            // window
            if self.lcdc & 0x20 != 0 && self.ly >= self.wy && self.wx <= WINDOW_X_MAX {
                let wx = self.wx.wrapping_sub(7) as u16;
                let window_map_base = if self.lcdc & 0x40 != 0 {
                    BG_MAP_1_BASE
                } else {
                    BG_MAP_0_BASE
                };
                let window_y = self.win_line_counter as usize;
                for x in wx..SCREEN_WIDTH as u16 {
                    let window_x = (x - wx) as usize;
                    let tile_col = window_x / 8;
                    let tile_row = window_y / 8;
                    let tile_y = window_y % 8;
                    let tile_x = window_x % 8;
                    let tile_index = self.vram[window_map_base + tile_row * 32 + tile_col];
                    let addr = self.tile_data_addr(tile_index);
                    let bit = 7 - tile_x;
                    let lo = self.vram[addr + tile_y * 2];
                    let hi = self.vram[addr + tile_y * 2 + 1];
                    let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                    let shade = Self::shade(self.bgp, color_id);
                    let idx = self.ly as usize * SCREEN_WIDTH + x as usize;
                    self.framebuffer[idx] = self.palette[shade as usize];
                    self.line_color_zero[x as usize] = color_id == 0;
                }
                self.win_line_counter = self.win_line_counter.wrapping_add(1);
            }
        }

        // sprites
        if self.lcdc & 0x02 != 0 {
            let sprite_height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
            let mut drawn = [false; SCREEN_WIDTH];
            for s in &self.line_sprites[..self.sprite_count] {
                let mut tile = s.tile;
                if sprite_height == 16 {
                    tile &= 0xFE;
                }
                let mut line_idx = self.ly as i16 - s.y;
                if s.flags & 0x40 != 0 {
                    line_idx = sprite_height - 1 - line_idx;
                }
                for px in 0..8 {
                    let bit = if s.flags & 0x20 != 0 { px } else { 7 - px };
                    let addr = (tile + ((line_idx as usize) >> 3) as u8) as usize * 16
                        + (line_idx as usize & 7) * 2;
                    let lo = self.vram[addr];
                    let hi = self.vram[addr + 1];
                    let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                    if color_id == 0 {
                        continue;
                    }
                    let sx = s.x + px as i16;
                    if !(0i16..SCREEN_WIDTH as i16).contains(&sx) || drawn[sx as usize] {
                        continue;
                    }
                    let bg_zero = !bg_enabled || self.line_color_zero[sx as usize];
                    if s.flags & 0x80 != 0 && !bg_zero {
                        continue;
                    }
                    let obp = if s.flags & 0x10 != 0 {
                        self.obp1
                    } else {
                        self.obp0
                    };
                    let shade = Self::shade(obp, color_id);
                    let idx = self.ly as usize * SCREEN_WIDTH + sx as usize;
                    self.framebuffer[idx] = self.palette[shade as usize];
                    drawn[sx as usize] = true;
                }
            }
        }
    }

    pub fn step(&mut self, cycles: u16, if_reg: &mut u8) {
        let mut remaining = cycles;
        while remaining > 0 {
            let increment = remaining.min(4);
            remaining -= increment;
            if self.lcdc & 0x80 == 0 {
                self.mode = MODE_HBLANK;
                self.ly = 0;
                self.mode_clock = 0;
                self.win_line_counter = 0;
                continue;
            }

            self.update_lyc_compare();

            self.mode_clock += increment;

            match self.mode {
                MODE_HBLANK => {
                    if self.mode_clock >= MODE0_CYCLES {
                        self.mode_clock -= MODE0_CYCLES;
                        self.ly += 1;
                        self.update_lyc_compare();
                        if self.ly == SCREEN_HEIGHT as u8 {
                            self.frame_ready = true;
                            self.mode = MODE_VBLANK;
                            if let Some(colors) = self.pending_palette.take() {
                                self.palette = colors;
                            }
                            *if_reg |= 0x01;
                        } else {
                            self.mode = MODE_OAM;
                        }
                    }
                }
                MODE_VBLANK => {
                    if self.mode_clock >= MODE1_CYCLES {
                        self.mode_clock -= MODE1_CYCLES;
                        self.ly += 1;
                        self.update_lyc_compare();
                        if self.ly > SCREEN_HEIGHT as u8 + VBLANK_LINES - 1 {
                            self.ly = 0;
                            self.frame_ready = false;
                            self.win_line_counter = 0;
                            self.mode = MODE_OAM;
                            self.update_lyc_compare();
                        }
                    }
                }
                MODE_OAM => {
                    if self.mode_clock >= MODE2_CYCLES {
                        self.mode_clock -= MODE2_CYCLES;
                        self.oam_scan();
                        self.mode = MODE_TRANSFER;
                    }
                }
                MODE_TRANSFER => {
                    if self.mode_clock >= MODE3_CYCLES {
                        self.mode_clock -= MODE3_CYCLES;
                        self.render_scanline();
                        self.mode = MODE_HBLANK;
                    }
                }
                _ => {}
            }

            self.update_stat_irq(if_reg);
        }
    }

    fn update_stat_irq(&mut self, if_reg: &mut u8) {
        let coincidence = self.lyc_eq_ly && self.stat & 0x40 != 0;
        let mode_signal = match self.mode {
            MODE_HBLANK => self.stat & 0x08 != 0,
            MODE_VBLANK => self.stat & 0x10 != 0,
            MODE_OAM => self.stat & 0x20 != 0,
            _ => false,
        };
        let current = coincidence || mode_signal;
        if current && !self.stat_irq_line {
            *if_reg |= 0x02;
        }
        self.stat_irq_line = current;
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAYS: [u32; 4] = [0x00FFFFFF, 0x00AAAAAA, 0x00555555, 0x00000000];

    const CYCLES_PER_LINE: u16 = 456;

    fn lcd_on() -> Ppu {
        let mut ppu = Ppu::new();
        ppu.write_reg(0xFF40, 0x91);
        ppu
    }

    fn run_lines(ppu: &mut Ppu, lines: u32, if_reg: &mut u8) {
        for _ in 0..lines {
            ppu.step(CYCLES_PER_LINE, if_reg);
        }
    }

    #[test]
    fn ly_counts_through_vblank_and_wraps_to_zero() {
        let mut ppu = lcd_on();
        let mut if_reg = 0u8;

        run_lines(&mut ppu, 144, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF44), 144);
        assert_eq!(ppu.read_reg(0xFF41) & 0x03, MODE_VBLANK);
        assert!(ppu.frame_ready());

        run_lines(&mut ppu, 10, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF44), 0);
        assert_eq!(ppu.read_reg(0xFF41) & 0x03, MODE_OAM);
        assert!(!ppu.frame_ready());
    }

    #[test]
    fn ly_register_ignores_writes() {
        let mut ppu = lcd_on();
        let mut if_reg = 0u8;
        run_lines(&mut ppu, 1, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF44), 1);

        ppu.write_reg(0xFF44, 0x55);
        assert_eq!(ppu.read_reg(0xFF44), 1);
    }

    #[test]
    fn vblank_interrupt_raised_entering_line_144() {
        let mut ppu = lcd_on();
        let mut if_reg = 0u8;

        run_lines(&mut ppu, 143, &mut if_reg);
        assert_eq!(if_reg & 0x01, 0, "still drawing line 143");

        run_lines(&mut ppu, 1, &mut if_reg);
        assert_ne!(if_reg & 0x01, 0);
    }

    #[test]
    fn stat_coincidence_interrupt_fires_once_per_edge() {
        let mut ppu = lcd_on();
        ppu.write_reg(0xFF45, 1);
        ppu.write_reg(0xFF41, 0x40);
        let mut if_reg = 0u8;

        run_lines(&mut ppu, 1, &mut if_reg);
        assert_ne!(if_reg & 0x02, 0);
        assert_ne!(ppu.read_reg(0xFF41) & 0x04, 0, "coincidence bit reads back");

        // The line stays high for the rest of the scanline; no repeats.
        if_reg = 0;
        ppu.step(8, &mut if_reg);
        assert_eq!(if_reg & 0x02, 0);
    }

    #[test]
    fn stat_hblank_source_fires_on_mode_entry() {
        let mut ppu = lcd_on();
        ppu.write_reg(0xFF41, 0x08);
        let mut if_reg = 0u8;

        ppu.step(MODE2_CYCLES + MODE3_CYCLES, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF41) & 0x03, MODE_HBLANK);
        assert_ne!(if_reg & 0x02, 0);

        if_reg = 0;
        ppu.step(100, &mut if_reg);
        assert_eq!(if_reg & 0x02, 0, "still in the same hblank");
    }

    #[test]
    fn palette_swap_latches_at_vblank() {
        let mut ppu = lcd_on();
        let mut if_reg = 0u8;
        ppu.step(4, &mut if_reg);

        ppu.set_palette(GRAYS);
        assert_eq!(ppu.palette(), DEFAULT_PALETTE, "held until the frame ends");

        run_lines(&mut ppu, 144, &mut if_reg);
        assert_eq!(ppu.palette(), GRAYS);
        // The frame completed before the swap was drawn with the old colors.
        assert!(ppu.framebuffer().iter().all(|&p| p == DEFAULT_PALETTE[0]));
    }

    #[test]
    fn palette_swap_applies_immediately_while_lcd_off() {
        let mut ppu = Ppu::new();
        ppu.set_palette(GRAYS);
        assert_eq!(ppu.palette(), GRAYS);
    }

    #[test]
    fn lcd_off_holds_ly_at_zero() {
        let mut ppu = lcd_on();
        let mut if_reg = 0u8;
        run_lines(&mut ppu, 3, &mut if_reg);

        ppu.write_reg(0xFF40, 0x11);
        if_reg = 0;
        run_lines(&mut ppu, 200, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF44), 0);
        assert_eq!(ppu.read_reg(0xFF41) & 0x03, MODE_HBLANK);
        assert_eq!(if_reg, 0, "no interrupts while the LCD is off");
    }
}
