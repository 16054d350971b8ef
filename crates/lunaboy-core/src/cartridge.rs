use std::{
    error, fmt, fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc2,
    Mbc3,
}

/// Why a ROM image was rejected at load time. Loading never aborts the
/// process; the frontend decides what a fatal load looks like.
#[derive(Debug)]
pub enum CartridgeError {
    Io(io::Error),
    TooShort(usize),
    BadChecksum { expected: u8, computed: u8 },
    UnsupportedMbc(u8),
    CgbOnly,
}

impl fmt::Display for CartridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read ROM file: {e}"),
            Self::TooShort(len) => {
                write!(f, "ROM image is {len} bytes, too short to hold a header")
            }
            Self::BadChecksum { expected, computed } => write!(
                f,
                "header checksum mismatch (header says {expected:#04X}, computed {computed:#04X})"
            ),
            Self::UnsupportedMbc(code) => {
                write!(f, "unsupported cartridge type byte {code:#04X}")
            }
            Self::CgbOnly => write!(f, "cartridge requires the color hardware"),
        }
    }
}

impl error::Error for CartridgeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CartridgeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Header checksum over 0x0134-0x014C: `x = x - byte - 1` per byte, compared
/// against byte 0x014D.
pub fn header_checksum(rom: &[u8]) -> u8 {
    rom[0x0134..=0x014C]
        .iter()
        .fold(0u8, |x, &b| x.wrapping_sub(b).wrapping_sub(1))
}

#[derive(Debug)]
pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub title: String,
    cart_type: u8,
    save_path: Option<PathBuf>,
    rtc_path: Option<PathBuf>,
    mbc_state: MbcState,
}

#[derive(Debug)]
enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        mode: u8,
        ram_enable: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Mbc3Rtc>,
        latch_pending: bool,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

#[derive(Debug, Clone)]
struct Mbc3Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    last_update: SystemTime,
    subsecond_cycles: u32,
}

const RTC_CYCLES_PER_SECOND: u32 = 4_194_304;

const RTC_FILE_MAGIC: &[u8; 4] = b"RTC1";
const RTC_FILE_VERSION: u8 = 1;

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }
}

impl Mbc3Rtc {
    fn new(now: SystemTime) -> Self {
        let regs = RtcRegisters::default();
        Self {
            regs,
            latched: regs,
            last_update: now,
            subsecond_cycles: 0,
        }
    }

    fn latch(&mut self) {
        self.latched = self.regs;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds & 0x3F,
            0x09 => self.latched.minutes & 0x3F,
            0x0A => self.latched.hours & 0x1F,
            0x0B => (self.latched.days & 0x00FF) as u8,
            0x0C => self.latched.control_byte(),
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                self.subsecond_cycles = 0;
            }
            0x09 => {
                self.regs.minutes = value & 0x3F;
            }
            0x0A => {
                self.regs.hours = value & 0x1F;
            }
            0x0B => {
                self.regs.days = (self.regs.days & 0x0100) | value as u16;
            }
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (((value & 0x01) as u16) << 8);
                self.regs.halt = value & 0x40 != 0;
                self.regs.carry = value & 0x80 != 0;
            }
            _ => {}
        }
        self.latch();
    }

    fn step(&mut self, cpu_cycles: u64) {
        if self.regs.halt {
            return;
        }

        self.add_cycles(cpu_cycles);
    }

    fn sync_wall(&mut self, now: SystemTime) {
        let elapsed = now.duration_since(self.last_update).unwrap_or_default();
        self.last_update = now;
        if self.regs.halt {
            return;
        }

        let elapsed_cycles = (elapsed.as_secs() as u128)
            .saturating_mul(RTC_CYCLES_PER_SECOND as u128)
            .saturating_add(
                (elapsed.subsec_nanos() as u128).saturating_mul(RTC_CYCLES_PER_SECOND as u128)
                    / 1_000_000_000u128,
            );
        self.add_cycles(elapsed_cycles.min(u64::MAX as u128) as u64);
    }

    fn mark_persisted(&mut self, now: SystemTime) {
        self.last_update = now;
    }

    fn add_cycles(&mut self, cycles: u64) {
        debug_assert!(self.subsecond_cycles < RTC_CYCLES_PER_SECOND);

        let mut seconds = cycles / RTC_CYCLES_PER_SECOND as u64;
        let rem = (cycles % RTC_CYCLES_PER_SECOND as u64) as u32;

        let mut sub = self.subsecond_cycles + rem;
        if sub >= RTC_CYCLES_PER_SECOND {
            sub -= RTC_CYCLES_PER_SECOND;
            seconds += 1;
        }
        self.subsecond_cycles = sub;

        if seconds > 0 {
            self.advance_seconds(seconds);
        }
    }

    fn advance_seconds(&mut self, mut seconds: u64) {
        while seconds > 0 {
            let until_minute_tick = self.seconds_until_minute_tick();
            if seconds < until_minute_tick {
                self.regs.seconds = ((self.regs.seconds as u64 + seconds) & 0x3F) as u8;
                return;
            }

            seconds -= until_minute_tick;
            self.regs.seconds = 0;
            self.minute_tick();
        }
    }

    fn seconds_until_minute_tick(&self) -> u64 {
        // The seconds register is 6 bits wide; out-of-range values written by
        // the game still tick up to 63 before wrapping to the minute.
        let sec = self.regs.seconds as u64;
        if sec <= 59 {
            60 - sec
        } else {
            (63 - sec + 1) + 60
        }
    }

    fn minute_tick(&mut self) {
        let overflow = self.regs.minutes == 59;
        self.regs.minutes = ((self.regs.minutes as u16 + 1) & 0x3F) as u8;
        if overflow {
            self.regs.minutes = 0;
            self.hour_tick();
        }
    }

    fn hour_tick(&mut self) {
        let overflow = self.regs.hours == 23;
        self.regs.hours = ((self.regs.hours as u16 + 1) & 0x1F) as u8;
        if overflow {
            self.regs.hours = 0;
            self.day_tick();
        }
    }

    fn day_tick(&mut self) {
        if self.regs.days >= 0x01FF {
            self.regs.days = 0;
            self.regs.carry = true;
        } else {
            self.regs.days = (self.regs.days + 1) & 0x01FF;
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 1 + 8 + 4 + 1 + 1 + 1 + 2 + 1);
        data.extend_from_slice(RTC_FILE_MAGIC);
        data.push(RTC_FILE_VERSION);

        let saved_time = self
            .last_update
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        data.extend_from_slice(&saved_time.to_le_bytes());

        let subsecond_nanos = ((self.subsecond_cycles as u128).saturating_mul(1_000_000_000u128)
            / (RTC_CYCLES_PER_SECOND as u128))
            .min(u32::MAX as u128) as u32;
        data.extend_from_slice(&subsecond_nanos.to_le_bytes());
        data.push(self.regs.seconds & 0x3F);
        data.push(self.regs.minutes & 0x3F);
        data.push(self.regs.hours & 0x1F);
        data.extend_from_slice(&(self.regs.days & 0x01FF).to_le_bytes());

        let mut flags = 0u8;
        if self.regs.halt {
            flags |= 0x01;
        }
        if self.regs.carry {
            flags |= 0x02;
        }
        data.push(flags);

        data
    }

    fn load_from_bytes(&mut self, data: &[u8]) -> bool {
        if data.len() < 23 || &data[..4] != RTC_FILE_MAGIC || data[4] != RTC_FILE_VERSION {
            return false;
        }

        let secs = u64::from_le_bytes(data[5..13].try_into().unwrap_or_default());
        let nanos = u32::from_le_bytes(data[13..17].try_into().unwrap_or_default()).min(999_999_999);

        self.last_update = UNIX_EPOCH + Duration::from_secs(secs);
        self.subsecond_cycles = ((nanos as u128).saturating_mul(RTC_CYCLES_PER_SECOND as u128)
            / 1_000_000_000u128)
            .min((RTC_CYCLES_PER_SECOND - 1) as u128) as u32;
        self.regs.seconds = data[17] & 0x3F;
        self.regs.minutes = data[18] & 0x3F;
        self.regs.hours = data[19] & 0x1F;
        self.regs.days = u16::from_le_bytes([data[20], data[21]]) & 0x01FF;

        let flags = data[22];
        self.regs.halt = flags & 0x01 != 0;
        self.regs.carry = flags & 0x02 != 0;
        self.latch();
        true
    }
}

impl Cartridge {
    /// Load a ROM file, validating the header, and pick up the battery save
    /// and RTC anchor files next to it when present.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let data = fs::read(&path)?;
        let mut cart = Self::from_bytes(data)?;

        if cart.has_battery() {
            let mut save = PathBuf::from(path.as_ref());
            save.set_extension("sav");
            cart.save_path = Some(save.clone());
            if let Ok(bytes) = fs::read(&save) {
                for (d, s) in cart.ram.iter_mut().zip(bytes.iter()) {
                    *d = *s;
                }
            }
        }

        if cart.has_rtc() {
            let mut rtc_path = PathBuf::from(path.as_ref());
            rtc_path.set_extension("rtc");
            cart.rtc_path = Some(rtc_path.clone());
            if let Some(rtc) = cart.rtc_mut() {
                if let Ok(bytes) = fs::read(&rtc_path)
                    && !rtc.load_from_bytes(&bytes)
                {
                    warn!("Failed to parse RTC data from {}", rtc_path.display());
                }
                let now = SystemTime::now();
                rtc.sync_wall(now);
                rtc.latch();
            }
        }

        info!("Loaded ROM: {} (MBC: {:?})", cart.title, cart.mbc);
        Ok(cart)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.len() < 0x150 {
            return Err(CartridgeError::TooShort(data.len()));
        }

        let header = Header::parse(&data);
        if header.cgb_only() {
            return Err(CartridgeError::CgbOnly);
        }

        let expected = data[0x014D];
        let computed = header_checksum(&data);
        if expected != computed {
            return Err(CartridgeError::BadChecksum { expected, computed });
        }

        let cart_type = header.cart_type();
        let mbc = header.mbc_type().ok_or(CartridgeError::UnsupportedMbc(cart_type))?;
        let ram_size = header.ram_size();
        let title = header.title();
        let now = SystemTime::now();
        let has_rtc = header.has_rtc();

        let mbc_state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcType::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc.then(|| Mbc3Rtc::new(now)),
                latch_pending: false,
            },
        };

        Ok(Self {
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            title,
            cart_type,
            save_path: None,
            rtc_path: None,
            mbc_state,
        })
    }

    pub fn step_rtc(&mut self, cpu_cycles: u16) {
        if let Some(rtc) = self.rtc_mut() {
            rtc.step(cpu_cycles as u64);
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        let rom_bank_count = (self.rom.len() / 0x4000).max(1);
        match (&self.mbc_state, addr) {
            (MbcState::NoMbc, 0x0000..=0x7FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc2 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc2 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let mut bank = (*rom_bank & 0x0F) as usize;
                if bank == 0 {
                    bank = 1;
                }
                bank %= rom_bank_count;
                if bank == 0 && rom_bank_count > 1 {
                    bank = 1;
                }
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc1 { ram_bank, mode, .. }, 0x0000..=0x3FFF) => {
                // Mode 1 remaps the fixed region through the high bank bits
                // on large ROMs.
                let bank = if *mode == 0 {
                    0
                } else {
                    (((*ram_bank as usize) & 0x03) << 5) % rom_bank_count
                };
                let offset = bank * 0x4000 + addr as usize;
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (
                MbcState::Mbc1 {
                    rom_bank, ram_bank, ..
                },
                0x4000..=0x7FFF,
            ) => {
                let high = ((*ram_bank as usize) & 0x03) << 5;
                let mut bank = high | (*rom_bank as usize & 0x1F);
                if bank & 0x1F == 0 {
                    bank += 1;
                }
                bank %= rom_bank_count;
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc3 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let bank = if *rom_bank == 0 { 1 } else { *rom_bank } as usize;
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                let idx = addr as usize - 0xA000;
                self.ram.get(idx).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    // MBC2 has 512x4-bit internal RAM, mirrored across 0xA000-0xBFFF.
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    let nibble = self.ram.get(idx).copied().unwrap_or(0x0F) & 0x0F;
                    0xF0 | nibble
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    let idx = self.ram_index(addr);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if !*ram_enable {
                    0xFF
                } else {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            self.ram.get(idx).copied().unwrap_or(0xFF)
                        }
                        0x08..=0x0C => rtc
                            .as_ref()
                            .map(|r| r.read_latched(*ram_bank))
                            .unwrap_or(0xFF),
                        _ => 0xFF,
                    }
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match (&mut self.mbc_state, addr) {
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                let idx = addr as usize - 0xA000;
                if let Some(b) = self.ram.get_mut(idx) {
                    *b = val;
                }
            }
            (
                MbcState::Mbc2 {
                    rom_bank,
                    ram_enable,
                },
                0x0000..=0x3FFF,
            ) => {
                // MBC2 uses address bit 8 to select between RAMG and ROMB across
                // the entire 0x0000-0x3FFF range:
                // - bit8=0: RAM enable (RAMG)
                // - bit8=1: ROM bank select (ROMB)
                if (addr & 0x0100) == 0 {
                    *ram_enable = val & 0x0F == 0x0A;
                } else {
                    *rom_bank = val & 0x0F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
            }
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val & 0x0F;
                    }
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x1F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc1 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    // For small RAM sizes (2KB/8KB) MBC1 always maps the single
                    // available bank regardless of bank register writes;
                    // ram_index() handles wrapping.
                    let idx = self.ram_index(addr);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }
            (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x7F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc3 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val;
            }
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                // Writing 0x00 then 0x01 latches the live clock into the
                // readable registers.
                if val == 0 {
                    *latch_pending = true;
                } else if val == 1 && *latch_pending {
                    if let Some(rtc) = rtc {
                        rtc.latch();
                    }
                    *latch_pending = false;
                } else {
                    *latch_pending = false;
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_enable {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            if let Some(b) = self.ram.get_mut(idx) {
                                *b = val;
                            }
                        }
                        0x08..=0x0C => {
                            if let Some(rtc) = rtc.as_mut() {
                                rtc.write_register(*ram_bank, val);
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    fn ram_index(&self, addr: u16) -> usize {
        let ram_bank_count = if self.ram.is_empty() {
            0
        } else {
            (self.ram.len().saturating_add(0x1FFF)) / 0x2000
        };
        match &self.mbc_state {
            MbcState::NoMbc => addr as usize - 0xA000,
            MbcState::Mbc2 { .. } => (addr as usize - 0xA000) & 0x01FF,
            MbcState::Mbc1 { ram_bank, mode, .. } => {
                if *mode == 0 {
                    addr as usize - 0xA000
                } else {
                    let bank = if ram_bank_count == 0 {
                        0
                    } else {
                        (*ram_bank as usize) % ram_bank_count
                    };
                    bank * 0x2000 + addr as usize - 0xA000
                }
            }
            MbcState::Mbc3 { ram_bank, .. } => {
                ((*ram_bank as usize) & 0x03) * 0x2000 + addr as usize - 0xA000
            }
        }
    }

    fn has_battery(&self) -> bool {
        matches!(self.cart_type, 0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13)
    }

    fn has_rtc(&self) -> bool {
        matches!(self.cart_type, 0x0F | 0x10 | 0x13)
    }

    fn rtc_mut(&mut self) -> Option<&mut Mbc3Rtc> {
        match &mut self.mbc_state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }

    /// Flush battery RAM (and the RTC anchor, if any) to disk. Called once at
    /// shutdown.
    pub fn save_ram(&mut self) -> io::Result<()> {
        if let (true, Some(path)) = (self.has_battery(), &self.save_path)
            && !self.ram.is_empty()
        {
            fs::write(path, &self.ram)?;
        }

        let rtc_path = self.rtc_path.clone();
        if let (Some(path), Some(rtc)) = (rtc_path, self.rtc_mut()) {
            rtc.mark_persisted(SystemTime::now());
            fs::write(path, rtc.serialize())?;
        }
        Ok(())
    }
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let end = 0x0143.min(self.data.len());
        let mut slice = &self.data[0x0134.min(self.data.len())..end];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cgb_only(&self) -> bool {
        self.data.get(0x0143).copied().unwrap_or(0) == 0xC0
    }

    fn mbc_type(&self) -> Option<MbcType> {
        match self.cart_type() {
            0x00 | 0x08 | 0x09 => Some(MbcType::NoMbc),
            0x01..=0x03 => Some(MbcType::Mbc1),
            0x05 | 0x06 => Some(MbcType::Mbc2),
            0x0F..=0x13 => Some(MbcType::Mbc3),
            _ => None,
        }
    }

    fn cart_type(&self) -> u8 {
        self.data.get(0x0147).copied().unwrap_or(0)
    }

    fn has_rtc(&self) -> bool {
        matches!(self.cart_type(), 0x0F | 0x10 | 0x13)
    }

    fn ram_size(&self) -> usize {
        // MBC2 has 512x4-bit internal RAM regardless of the header RAM code.
        if matches!(self.cart_type(), 0x05 | 0x06) {
            return 0x200;
        }

        match self.data.get(0x0149).copied().unwrap_or(0) {
            0x00 => 0,
            0x01 => 0x800,   // 2KB
            0x02 => 0x2000,  // 8KB
            0x03 => 0x8000,  // 32KB (4 banks)
            0x04 => 0x20000, // 128KB (16 banks)
            0x05 => 0x10000, // 64KB (8 banks)
            _ => 0x2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms_to_cycles(ms: u64) -> u32 {
        ((ms as u128).saturating_mul(RTC_CYCLES_PER_SECOND as u128) / 1000u128) as u32
    }

    fn rom_with_header(cart_type: u8, ram_code: u8) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0147] = cart_type;
        rom[0x0149] = ram_code;
        rom[0x014D] = header_checksum(&rom);
        rom
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut rom = rom_with_header(0x00, 0x00);
        rom[0x0134] ^= 0xFF;
        match Cartridge::from_bytes(rom) {
            Err(CartridgeError::BadChecksum { .. }) => {}
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn color_only_rom_is_rejected() {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0143] = 0xC0;
        rom[0x014D] = header_checksum(&rom);
        assert!(matches!(
            Cartridge::from_bytes(rom),
            Err(CartridgeError::CgbOnly)
        ));
    }

    #[test]
    fn dual_mode_rom_loads_as_dmg() {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0143] = 0x80;
        rom[0x014D] = header_checksum(&rom);
        assert!(Cartridge::from_bytes(rom).is_ok());
    }

    #[test]
    fn unknown_mapper_byte_is_rejected() {
        let rom = rom_with_header(0x19, 0x00); // MBC5 is out of scope
        assert!(matches!(
            Cartridge::from_bytes(rom),
            Err(CartridgeError::UnsupportedMbc(0x19))
        ));
    }

    #[test]
    fn short_image_is_rejected() {
        assert!(matches!(
            Cartridge::from_bytes(vec![0u8; 0x100]),
            Err(CartridgeError::TooShort(0x100))
        ));
    }

    #[test]
    fn ram_sized_from_header() {
        let cart = Cartridge::from_bytes(rom_with_header(0x03, 0x03)).unwrap();
        assert_eq!(cart.ram.len(), 0x8000);
        let cart = Cartridge::from_bytes(rom_with_header(0x00, 0x00)).unwrap();
        assert!(cart.ram.is_empty());
    }

    #[test]
    fn rtc_ticks_through_invalid_values() {
        let now = SystemTime::UNIX_EPOCH;
        let mut rtc = Mbc3Rtc::new(now);

        rtc.regs.seconds = 59;
        rtc.regs.minutes = 60;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 61);

        rtc.regs.seconds = 63;
        rtc.regs.minutes = 5;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 5);

        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 24;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 0);
        assert_eq!(rtc.regs.hours, 25);
    }

    #[test]
    fn rtc_halt_preserves_subseconds() {
        let start = SystemTime::UNIX_EPOCH;
        let mut rtc = Mbc3Rtc::new(start);
        rtc.subsecond_cycles = RTC_CYCLES_PER_SECOND - 10_000;

        rtc.write_register(0x0C, 0x40);
        rtc.step(RTC_CYCLES_PER_SECOND as u64 * 2);
        assert_eq!(rtc.regs.seconds, 0);

        rtc.write_register(0x0C, 0x00);
        rtc.step(9_999);
        assert_eq!(rtc.regs.seconds, 0);
        rtc.step(1);
        assert_eq!(rtc.regs.seconds, 1);
    }

    #[test]
    fn rtc_seconds_write_resets_phase() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let mut rtc = Mbc3Rtc::new(now);
        rtc.subsecond_cycles = ms_to_cycles(750);

        rtc.step(ms_to_cycles(10) as u64);

        rtc.write_register(0x09, 0x01);
        assert_eq!(rtc.subsecond_cycles, ms_to_cycles(760));

        rtc.write_register(0x08, 0x02);
        assert_eq!(rtc.subsecond_cycles, 0);
    }

    #[test]
    fn rtc_day_overflow_sets_carry() {
        let mut rtc = Mbc3Rtc::new(SystemTime::UNIX_EPOCH);
        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 23;
        rtc.regs.days = 0x01FF;

        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.days, 0);
        assert!(rtc.regs.carry);
    }

    #[test]
    fn rtc_latch_sequence_snapshots_registers() {
        let mut rom = rom_with_header(0x10, 0x03); // MBC3 + RTC + RAM + battery
        rom[0x014D] = header_checksum(&rom);
        let mut cart = Cartridge::from_bytes(rom).unwrap();

        cart.write(0x0000, 0x0A); // enable RAM/RTC
        cart.write(0x4000, 0x08); // select seconds register
        cart.write(0xA000, 12);
        assert_eq!(cart.read(0xA000), 12);

        cart.step_rtc(u16::MAX);
        cart.step_rtc(u16::MAX);

        // The latched copy only moves on a 0x00 -> 0x01 write sequence.
        let before = cart.read(0xA000);
        cart.write(0x6000, 0x00);
        cart.write(0x6000, 0x01);
        assert_eq!(cart.read(0xA000), before);
    }
}
