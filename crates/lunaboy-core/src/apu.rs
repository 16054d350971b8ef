use crate::audio_queue::AudioProducer;

const CPU_CLOCK_HZ: u32 = 4_194_304;
// 512 Hz frame sequencer tick
const FRAME_SEQUENCER_PERIOD: u32 = 8192;
const VOLUME_FACTOR: i16 = 64;

pub const SAMPLE_RATE: u32 = 44_100;

// Duty table for pulse channels (CH1, CH2). Each entry is an 8-step
// waveform. Index (0..3) corresponds to duty selector in NRx1:
// 0 -> 00000001 (12.5%)
// 1 -> 10000001 (25%)
// 2 -> 10000111 (50%)
// 3 -> 01111110 (75%)
const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 1], // 12.5% -> 00000001
    [1, 0, 0, 0, 0, 0, 0, 1], // 25%   -> 10000001
    [1, 0, 0, 0, 0, 1, 1, 1], // 50%   -> 10000111
    [0, 1, 1, 1, 1, 1, 1, 0], // 75%   -> 01111110
];

#[derive(Default, Clone, Copy)]
struct Envelope {
    initial: u8,
    period: u8,
    add: bool,
    volume: u8,
    timer: u8,
}

impl Envelope {
    fn clock(&mut self) {
        if self.timer == 0 {
            self.timer = if self.period == 0 { 8 } else { self.period };
            if self.period != 0 {
                if self.add && self.volume < 15 {
                    self.volume += 1;
                } else if !self.add && self.volume > 0 {
                    self.volume -= 1;
                }
            }
        } else {
            self.timer -= 1;
        }
    }

    fn reset(&mut self, val: u8) {
        self.initial = val >> 4;
        self.volume = self.initial;
        self.period = val & 0x07;
        self.add = val & 0x08 != 0;
        self.timer = if self.period == 0 { 8 } else { self.period };
    }
}

// Channel 1 frequency sweep.
#[derive(Default)]
struct Sweep {
    period: u8,
    negate: bool,
    shift: u8,
    timer: u8,
    shadow: u16,
    enabled: bool,
    /// True if a subtraction sweep calculation has occurred since the last
    /// trigger.
    neg_used: bool,
}

impl Sweep {
    fn calculate(&self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow.wrapping_add(delta)
        }
    }

    /// Apply an NR10 write. Returns true if the channel must be disabled
    /// (leaving negate mode after a subtraction calculation).
    fn set_params(&mut self, val: u8) -> bool {
        let old_negate = self.negate;
        self.period = (val >> 4) & 0x07;
        self.negate = val & 0x08 != 0;
        self.shift = val & 0x07;
        if old_negate && !self.negate && self.neg_used {
            self.enabled = false;
            return true;
        }
        false
    }

    fn reload(&mut self, freq: u16) {
        self.shadow = freq;
        self.timer = if self.period == 0 { 8 } else { self.period };
        self.enabled = self.period != 0 || self.shift != 0;
        self.neg_used = false;
    }
}

#[derive(Default)]
struct SquareChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u8,
    length_enable: bool,
    duty: u8,
    duty_pos: u8,
    frequency: u16,
    timer: i32,
    envelope: Envelope,
    sweep: Option<Sweep>,
}

impl SquareChannel {
    fn new(with_sweep: bool) -> Self {
        Self {
            sweep: if with_sweep {
                Some(Sweep::default())
            } else {
                None
            },
            ..Default::default()
        }
    }

    fn period(&self) -> i32 {
        ((2048 - self.frequency) * 4) as i32
    }

    fn step(&mut self, cycles: u32) {
        if !self.enabled || !self.dac_enabled {
            return;
        }
        let mut cycles = cycles as i32;
        while self.timer <= cycles {
            cycles -= self.timer;
            self.timer = self.period();
            self.duty_pos = (self.duty_pos + 1) & 7;
        }
        self.timer -= cycles;
    }

    fn output(&self) -> u8 {
        if !self.enabled || !self.dac_enabled {
            return 0;
        }
        DUTY_TABLE[self.duty as usize][self.duty_pos as usize] * self.envelope.volume
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn clock_sweep(&mut self) {
        let mut freq_changed = false;
        if let Some(sweep) = self.sweep.as_mut() {
            if !sweep.enabled {
                return;
            }
            if sweep.timer > 0 {
                sweep.timer -= 1;
            }
            if sweep.timer == 0 {
                sweep.timer = if sweep.period == 0 { 8 } else { sweep.period };
                if sweep.period != 0 {
                    let mut new_freq = sweep.calculate();
                    if new_freq > 2047 {
                        self.enabled = false;
                        sweep.enabled = false;
                    } else if sweep.shift != 0 {
                        if sweep.negate {
                            sweep.neg_used = true;
                        }
                        sweep.shadow = new_freq;
                        self.frequency = new_freq;
                        freq_changed = true;
                        new_freq = sweep.calculate();
                        if new_freq > 2047 {
                            self.enabled = false;
                            sweep.enabled = false;
                        }
                    }
                }
            }
        }
        let _ = freq_changed;
    }
}

#[derive(Default)]
struct WaveChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    volume: u8,
    position: u8,
    last_sample: u8,
    frequency: u16,
    timer: i32,
}

impl WaveChannel {
    fn period(&self) -> i32 {
        ((2048 - self.frequency) * 2) as i32
    }

    fn step(&mut self, cycles: u32, wave_ram: &[u8; 0x10]) {
        if !self.enabled || !self.dac_enabled {
            return;
        }
        let mut cycles = cycles as i32;
        while self.timer <= cycles {
            cycles -= self.timer;
            self.timer = self.period();
            self.position = (self.position + 1) & 0x1F;
            let byte = wave_ram[(self.position / 2) as usize];
            self.last_sample = if self.position & 1 == 0 {
                byte >> 4
            } else {
                byte & 0x0F
            };
        }
        self.timer -= cycles;
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || !self.dac_enabled {
            return 0;
        }
        match self.volume {
            0 => 0,
            1 => self.last_sample,
            2 => self.last_sample >> 1,
            3 => self.last_sample >> 2,
            _ => 0,
        }
    }
}

#[derive(Default)]
struct NoiseChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u8,
    length_enable: bool,
    envelope: Envelope,
    clock_shift: u8,
    divisor: u8,
    width7: bool,
    lfsr: u16,
    timer: i32,
}

impl NoiseChannel {
    fn period(&self) -> i32 {
        let r = match self.divisor {
            0 => 8,
            _ => (self.divisor as i32) * 16,
        };
        r << self.clock_shift
    }

    fn step(&mut self, cycles: u32) {
        if !self.enabled || !self.dac_enabled {
            return;
        }
        if self.clock_shift >= 14 {
            return;
        }
        let mut cycles = cycles as i32;
        while self.timer <= cycles {
            cycles -= self.timer;
            self.timer = self.period();
            let bit0 = self.lfsr & 1;
            let bit1 = (self.lfsr >> 1) & 1;
            // The noise channel's LFSR feedback bit is the XNOR of bit 0 and
            // bit 1: 1 when the bits are identical, otherwise 0.
            let bit = (!(bit0 ^ bit1)) & 1;
            self.lfsr >>= 1;
            self.lfsr |= bit << 14;
            if self.width7 {
                self.lfsr = (self.lfsr & !0x40) | (bit << 6);
            }
        }
        self.timer -= cycles;
    }

    fn output(&self) -> u8 {
        if !self.enabled || !self.dac_enabled {
            return 0;
        }
        if self.lfsr & 1 == 0 {
            self.envelope.volume
        } else {
            0
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }
}

struct FrameSequencer {
    step: u8,
}

impl FrameSequencer {
    fn new() -> Self {
        Self { step: 0 }
    }

    fn advance(&mut self) -> u8 {
        let s = self.step;
        self.step = (self.step + 1) & 7;
        s
    }
}

pub struct Apu {
    ch1: SquareChannel,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,
    wave_ram: [u8; 0x10],
    nr50: u8,
    nr51: u8,
    nr52: u8,
    sequencer: FrameSequencer,
    seq_timer: u32,
    sample_timer: u32,
    sample_rate: u32,
    output: Option<AudioProducer>,
    hp_coef: f32,
    hp_prev_input_left: f32,
    hp_prev_output_left: f32,
    hp_prev_input_right: f32,
    hp_prev_output_right: f32,
    regs: [u8; 0x30],
}

impl Apu {
    fn calc_hp_coef(rate: u32) -> f32 {
        0.999_958_f32.powf(4_194_304.0 / rate as f32)
    }

    /// Read-back mask per register. Bits set here always read as 1.
    fn read_mask(addr: u16) -> u8 {
        match addr {
            0xFF10 => 0x80,
            0xFF11 => 0x3F,
            0xFF12 => 0x00,
            0xFF13 => 0xFF,
            0xFF14 => 0xBF,
            0xFF16 => 0x3F,
            0xFF17 => 0x00,
            0xFF18 => 0xFF,
            0xFF19 => 0xBF,
            0xFF1A => 0x7F,
            0xFF1B => 0xFF,
            0xFF1C => 0x9F,
            0xFF1D => 0xFF,
            0xFF1E => 0xBF,
            0xFF20 => 0xFF,
            0xFF21 => 0x00,
            0xFF22 => 0x00,
            0xFF23 => 0xBF,
            0xFF24 => 0x00,
            0xFF25 => 0x00,
            0xFF26 => 0x70,
            0xFF15 | 0xFF1F => 0xFF,
            0xFF30..=0xFF3F => 0x00,
            _ => 0xFF,
        }
    }

    fn power_off(&mut self) {
        self.ch1 = SquareChannel::new(true);
        self.ch2 = SquareChannel::new(false);
        self.ch3 = WaveChannel::default();
        self.ch4 = NoiseChannel::default();
        self.regs.fill(0);
        self.nr50 = 0;
        self.nr51 = 0;
        self.sequencer.step = 0;
        self.seq_timer = 0;
        self.hp_prev_input_left = 0.0;
        self.hp_prev_output_left = 0.0;
        self.hp_prev_input_right = 0.0;
        self.hp_prev_output_right = 0.0;
    }

    pub fn new() -> Self {
        let mut apu = Self {
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::default(),
            ch4: NoiseChannel::default(),
            wave_ram: [0; 0x10],
            nr50: 0x77,
            nr51: 0xF3,
            nr52: 0xF1,
            sequencer: FrameSequencer::new(),
            seq_timer: 0,
            sample_timer: 0,
            sample_rate: SAMPLE_RATE,
            output: None,
            hp_coef: Apu::calc_hp_coef(SAMPLE_RATE),
            hp_prev_input_left: 0.0,
            hp_prev_output_left: 0.0,
            hp_prev_input_right: 0.0,
            hp_prev_output_right: 0.0,
            regs: [0; 0x30],
        };

        // Power-on register defaults
        apu.regs[0x00] = 0x80;
        apu.regs[0x01] = 0xBF;
        apu.regs[0x02] = 0xF3;
        apu.regs[0x04] = 0xBF;
        apu.regs[0x14] = 0x77;
        apu.regs[0x15] = 0xF3;
        apu.regs[0x16] = 0xF1;

        apu.ch1.duty = 2;
        apu.ch1.length = 0x3F;
        apu.ch1.envelope.initial = 0xF;
        apu.ch1.envelope.volume = 0xF;
        apu.ch1.envelope.period = 3;
        apu.ch1.frequency = 0x03FF;
        apu.ch1.dac_enabled = true;

        apu.ch2.length = 0x3F;
        apu.ch2.frequency = 0x03FF;

        apu.ch3.dac_enabled = true;
        apu.ch3.length = 0xFF;
        apu.ch3.frequency = 0x03FF;

        apu.ch4.length = 0xFF;

        apu
    }

    /// Attach the producer side of the sample queue. Without one the mixer
    /// still runs but samples are discarded.
    pub fn attach_output(&mut self, producer: AudioProducer) {
        self.output = Some(producer);
    }

    /// Stereo frames currently queued for the audio device, if attached.
    pub fn queued_frames(&self) -> usize {
        self.output.as_ref().map_or(0, |p| p.len())
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
        self.hp_coef = Apu::calc_hp_coef(rate);
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        if addr == 0xFF26 {
            let mut val = self.nr52 & 0x80;
            if self.ch1.enabled {
                val |= 0x01;
            }
            if self.ch2.enabled {
                val |= 0x02;
            }
            if self.ch3.enabled {
                val |= 0x04;
            }
            if self.ch4.enabled {
                val |= 0x08;
            }
            return val | Apu::read_mask(addr);
        }

        if (0xFF30..=0xFF3F).contains(&addr) {
            if self.ch3.enabled && self.ch3.dac_enabled {
                return 0xFF;
            }
            return self.wave_ram[(addr - 0xFF30) as usize];
        }

        let idx = (addr - 0xFF10) as usize;
        self.regs[idx] | Apu::read_mask(addr)
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        // While powered off only NR52 and wave RAM accept writes.
        if self.nr52 & 0x80 == 0 && addr != 0xFF26 && !(0xFF30..=0xFF3F).contains(&addr) {
            return;
        }

        if addr != 0xFF26 && (0xFF10..=0xFF3F).contains(&addr) {
            self.regs[(addr - 0xFF10) as usize] = val;
        }

        match addr {
            0xFF10 => {
                if let Some(s) = self.ch1.sweep.as_mut() {
                    if s.set_params(val) {
                        self.ch1.enabled = false;
                    }
                }
            }
            0xFF11 => {
                self.ch1.duty = val >> 6;
                self.ch1.length = 64 - (val & 0x3F);
            }
            0xFF12 => {
                self.ch1.envelope.reset(val);
                self.ch1.dac_enabled = val & 0xF8 != 0;
                if !self.ch1.dac_enabled {
                    self.ch1.enabled = false;
                }
            }
            0xFF13 => self.ch1.frequency = (self.ch1.frequency & 0x700) | val as u16,
            0xFF14 => {
                let prev = self.ch1.length_enable;
                self.ch1.length_enable = val & 0x40 != 0;
                if !prev && self.ch1.length_enable {
                    let next_step = (self.sequencer.step + 1) & 7;
                    if !matches!(next_step, 0 | 2 | 4 | 6) && self.ch1.length > 0 {
                        self.ch1.clock_length();
                    }
                }
                self.ch1.frequency = (self.ch1.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                if val & 0x80 != 0 {
                    self.trigger_square(1);
                }
            }
            0xFF16 => {
                self.ch2.duty = val >> 6;
                self.ch2.length = 64 - (val & 0x3F);
            }
            0xFF17 => {
                self.ch2.envelope.reset(val);
                self.ch2.dac_enabled = val & 0xF8 != 0;
                if !self.ch2.dac_enabled {
                    self.ch2.enabled = false;
                }
            }
            0xFF18 => self.ch2.frequency = (self.ch2.frequency & 0x700) | val as u16,
            0xFF19 => {
                let prev = self.ch2.length_enable;
                self.ch2.length_enable = val & 0x40 != 0;
                if !prev && self.ch2.length_enable {
                    let next_step = (self.sequencer.step + 1) & 7;
                    if !matches!(next_step, 0 | 2 | 4 | 6) && self.ch2.length > 0 {
                        self.ch2.clock_length();
                    }
                }
                self.ch2.frequency = (self.ch2.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                if val & 0x80 != 0 {
                    self.trigger_square(2);
                }
            }
            0xFF1A => {
                self.ch3.dac_enabled = val & 0x80 != 0;
                if !self.ch3.dac_enabled {
                    self.ch3.enabled = false;
                }
            }
            0xFF1B => self.ch3.length = 256 - val as u16,
            0xFF1C => self.ch3.volume = (val >> 5) & 0x03,
            0xFF1D => self.ch3.frequency = (self.ch3.frequency & 0x700) | val as u16,
            0xFF1E => {
                let prev = self.ch3.length_enable;
                self.ch3.length_enable = val & 0x40 != 0;
                if !prev && self.ch3.length_enable {
                    let next_step = (self.sequencer.step + 1) & 7;
                    if !matches!(next_step, 0 | 2 | 4 | 6) && self.ch3.length > 0 {
                        self.ch3.clock_length();
                    }
                }
                self.ch3.frequency = (self.ch3.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                if val & 0x80 != 0 {
                    self.trigger_wave();
                }
            }
            0xFF20 => self.ch4.length = 64 - (val & 0x3F),
            0xFF21 => {
                self.ch4.envelope.reset(val);
                self.ch4.dac_enabled = val & 0xF8 != 0;
                if !self.ch4.dac_enabled {
                    self.ch4.enabled = false;
                }
            }
            0xFF22 => {
                self.ch4.clock_shift = val >> 4;
                self.ch4.width7 = val & 0x08 != 0;
                self.ch4.divisor = val & 0x07;
            }
            0xFF23 => {
                let prev = self.ch4.length_enable;
                self.ch4.length_enable = val & 0x40 != 0;
                if !prev && self.ch4.length_enable {
                    let next_step = (self.sequencer.step + 1) & 7;
                    if !matches!(next_step, 0 | 2 | 4 | 6) && self.ch4.length > 0 {
                        self.ch4.clock_length();
                    }
                }
                if val & 0x80 != 0 {
                    self.trigger_noise();
                }
            }
            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            0xFF26 => {
                if val & 0x80 == 0 {
                    self.nr52 &= !0x80;
                    self.power_off();
                } else {
                    if self.nr52 & 0x80 == 0 {
                        self.sequencer.step = 0;
                        self.seq_timer = 0;
                    }
                    self.nr52 |= 0x80;
                }
            }
            0xFF30..=0xFF3F => {
                if !(self.ch3.enabled && self.ch3.dac_enabled) {
                    self.wave_ram[(addr - 0xFF30) as usize] = val;
                }
            }
            _ => {}
        }
    }

    fn trigger_square(&mut self, idx: u8) {
        let seq_step = self.sequencer.step;
        let ch = if idx == 1 {
            &mut self.ch1
        } else {
            &mut self.ch2
        };

        ch.enabled = ch.dac_enabled;
        ch.timer = ch.period();
        ch.envelope.volume = ch.envelope.initial;
        ch.envelope.timer = if ch.envelope.period == 0 {
            8
        } else {
            ch.envelope.period
        };
        if ch.length == 0 {
            ch.length = 64;
            // A reloaded length is clocked immediately if the next sequencer
            // step is a length step.
            if ch.length_enable && matches!(seq_step, 0 | 2 | 4 | 6) {
                ch.length = 63;
            }
        }

        if idx == 1
            && let Some(s) = ch.sweep.as_mut()
        {
            s.reload(ch.frequency);
            if s.shift != 0 {
                let new_freq = s.calculate();
                if new_freq > 2047 {
                    ch.enabled = false;
                    s.enabled = false;
                } else {
                    if s.negate {
                        s.neg_used = true;
                    }
                    s.shadow = new_freq;
                    ch.frequency = new_freq;
                }
            }
        }
    }

    fn trigger_wave(&mut self) {
        self.ch3.enabled = self.ch3.dac_enabled;
        self.ch3.position = 0;
        self.ch3.timer = self.ch3.period();
        if self.ch3.length == 0 {
            self.ch3.length = 256;
            if self.ch3.length_enable && matches!(self.sequencer.step, 0 | 2 | 4 | 6) {
                self.ch3.length = 255;
            }
        }
    }

    fn trigger_noise(&mut self) {
        self.ch4.enabled = self.ch4.dac_enabled;
        // The LFSR is cleared on trigger; with XNOR feedback it then fills
        // with ones.
        self.ch4.lfsr = 0;
        self.ch4.timer = self.ch4.period();
        self.ch4.envelope.volume = self.ch4.envelope.initial;
        self.ch4.envelope.timer = if self.ch4.envelope.period == 0 {
            8
        } else {
            self.ch4.envelope.period
        };
        if self.ch4.length == 0 {
            self.ch4.length = 64;
            if self.ch4.length_enable && matches!(self.sequencer.step, 0 | 2 | 4 | 6) {
                self.ch4.length = 63;
            }
        }
    }

    fn clock_frame_sequencer(&mut self) {
        let step = self.sequencer.advance();
        if matches!(step, 0 | 2 | 4 | 6) {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if step == 2 || step == 6 {
            self.ch1.clock_sweep();
        }
        if step == 7 {
            self.ch1.envelope.clock();
            self.ch2.envelope.clock();
            self.ch4.envelope.clock();
        }
    }

    pub fn step(&mut self, cycles: u16) {
        let cps = CPU_CLOCK_HZ / self.sample_rate;
        for _ in 0..cycles {
            if self.nr52 & 0x80 != 0 {
                self.seq_timer += 1;
                if self.seq_timer >= FRAME_SEQUENCER_PERIOD {
                    self.seq_timer -= FRAME_SEQUENCER_PERIOD;
                    self.clock_frame_sequencer();
                }
                self.ch1.step(1);
                self.ch2.step(1);
                self.ch3.step(1, &self.wave_ram);
                self.ch4.step(1);
            }
            self.sample_timer += 1;
            if self.sample_timer >= cps {
                self.sample_timer -= cps;
                let (left, right) = self.mix_output();
                if let Some(out) = &self.output {
                    // Lossy when the device falls behind; the frontend paces
                    // emulation off queue depth.
                    out.push_stereo(left, right);
                }
            }
        }
    }

    fn mix_output(&mut self) -> (i16, i16) {
        let dacs_on = self.ch1.dac_enabled
            || self.ch2.dac_enabled
            || self.ch3.dac_enabled
            || self.ch4.dac_enabled;

        let ch1 = 8 - self.ch1.output() as i16;
        let ch2 = 8 - self.ch2.output() as i16;
        let ch3 = 8 - self.ch3.output() as i16;
        let ch4 = 8 - self.ch4.output() as i16;

        let mut left = 0i16;
        let mut right = 0i16;

        if self.nr51 & 0x10 != 0 {
            left += ch1;
        }
        if self.nr51 & 0x01 != 0 {
            right += ch1;
        }
        if self.nr51 & 0x20 != 0 {
            left += ch2;
        }
        if self.nr51 & 0x02 != 0 {
            right += ch2;
        }
        if self.nr51 & 0x40 != 0 {
            left += ch3;
        }
        if self.nr51 & 0x04 != 0 {
            right += ch3;
        }
        if self.nr51 & 0x80 != 0 {
            left += ch4;
        }
        if self.nr51 & 0x08 != 0 {
            right += ch4;
        }

        let left_vol = ((self.nr50 >> 4) & 0x07) + 1;
        let right_vol = (self.nr50 & 0x07) + 1;

        let left_sample = left * left_vol as i16 * VOLUME_FACTOR;
        let right_sample = right * right_vol as i16 * VOLUME_FACTOR;

        if !dacs_on {
            self.hp_prev_input_left = 0.0;
            self.hp_prev_output_left = 0.0;
            self.hp_prev_input_right = 0.0;
            self.hp_prev_output_right = 0.0;
            (0, 0)
        } else {
            self.dc_block(left_sample, right_sample)
        }
    }

    fn dc_block(&mut self, left: i16, right: i16) -> (i16, i16) {
        let r = self.hp_coef;
        let left_in = left as f32;
        let right_in = right as f32;
        let left_out = left_in - self.hp_prev_input_left + r * self.hp_prev_output_left;
        let right_out = right_in - self.hp_prev_input_right + r * self.hp_prev_output_right;
        self.hp_prev_input_left = left_in;
        self.hp_prev_output_left = left_out;
        self.hp_prev_input_right = right_in;
        self.hp_prev_output_right = right_out;
        (left_out.round() as i16, right_out.round() as i16)
    }
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn powered_apu() -> Apu {
        let mut apu = Apu::new();
        apu.write_reg(0xFF26, 0x80);
        apu
    }

    #[test]
    fn nr52_reports_channel_status() {
        let mut apu = powered_apu();
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF14, 0x80);
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x01);
    }

    #[test]
    fn power_off_clears_registers_and_blocks_writes() {
        let mut apu = powered_apu();
        apu.write_reg(0xFF24, 0x22);
        apu.write_reg(0xFF26, 0x00);
        assert_eq!(apu.read_reg(0xFF24), 0x00);
        apu.write_reg(0xFF24, 0x33);
        assert_eq!(apu.read_reg(0xFF24), 0x00);
    }

    #[test]
    fn wave_ram_writable_while_powered_off() {
        let mut apu = powered_apu();
        apu.write_reg(0xFF26, 0x00);
        apu.write_reg(0xFF30, 0xAB);
        assert_eq!(apu.read_reg(0xFF30), 0xAB);
    }

    #[test]
    fn masked_registers_read_back_with_forced_bits() {
        let mut apu = powered_apu();
        apu.write_reg(0xFF13, 0x12);
        assert_eq!(apu.read_reg(0xFF13), 0xFF);
        apu.write_reg(0xFF11, 0x80);
        assert_eq!(apu.read_reg(0xFF11), 0x80 | 0x3F);
        apu.write_reg(0xFF15, 0x00);
        assert_eq!(apu.read_reg(0xFF15), 0xFF);
    }

    #[test]
    fn length_counter_silences_channel() {
        let mut apu = powered_apu();
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF11, 0x3F); // length = 1
        apu.write_reg(0xFF14, 0xC0); // trigger with length enable
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x01);
        // Two sequencer periods guarantee at least one length step.
        apu.step(8192);
        apu.step(8192);
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x00);
    }

    #[test]
    fn dac_off_disables_channel() {
        let mut apu = powered_apu();
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF14, 0x80);
        apu.write_reg(0xFF12, 0x00);
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x00);
    }

    #[test]
    fn samples_flow_into_attached_queue() {
        let (tx, rx) = crate::audio_queue::audio_queue(4096);
        let mut apu = powered_apu();
        apu.attach_output(tx);
        apu.step(9600); // roughly 100 output frames at 44.1 kHz
        assert!(rx.len() >= 90);
    }

    #[test]
    fn dc_filter_reduces_constant_input() {
        let mut apu = Apu::new();
        let first = apu.dc_block(1000, 1000);
        let second = apu.dc_block(1000, 1000);
        assert!(second.0 < first.0);
        assert!(second.1 < first.1);
    }

    #[test]
    fn dc_filter_converges_to_zero() {
        let mut apu = Apu::new();
        let mut out = (0i16, 0i16);
        for _ in 0..8192 {
            out = apu.dc_block(1000, 1000);
        }
        assert!(out.0.abs() < 10);
        assert!(out.1.abs() < 10);
    }

    #[test]
    fn dc_filter_channels_independent() {
        let mut apu = Apu::new();
        let mut last_left = 0i16;
        let mut last_right = 0i16;
        for _ in 0..8 {
            let (l, r) = apu.dc_block(1000, 0);
            last_left = l;
            last_right = r;
        }
        assert!(last_left > 0);
        assert_eq!(last_right, 0);
    }

    #[test]
    fn mixer_silent_when_all_dacs_off() {
        let mut apu = powered_apu();
        apu.write_reg(0xFF12, 0x00);
        apu.write_reg(0xFF17, 0x00);
        apu.write_reg(0xFF1A, 0x00);
        apu.write_reg(0xFF21, 0x00);
        let (l, r) = apu.mix_output();
        assert_eq!(l, 0);
        assert_eq!(r, 0);
    }
}
