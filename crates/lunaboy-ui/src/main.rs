mod audio;
mod config;
mod link;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info};
use pixels::{Pixels, SurfaceTexture};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use lunaboy_core::audio_queue::audio_queue;
use lunaboy_core::cartridge::Cartridge;
use lunaboy_core::cpu::CpuFault;
use lunaboy_core::gameboy::GameBoy;
use lunaboy_core::ppu::{SCREEN_HEIGHT, SCREEN_WIDTH};

use config::PaletteName;
use link::TcpLinkPort;

const GB_FPS: f64 = 59.7275;

/// Frames of queued audio the emulation loop tries to keep ahead (about 50 ms
/// at 44.1 kHz).
const AUDIO_TARGET_FRACTION: u32 = 20;

/// Ring capacity between the APU and the audio callback.
const AUDIO_QUEUE_FRAMES: usize = 8192;

#[derive(Parser)]
struct Args {
    /// Path to ROM file
    rom: Option<PathBuf>,

    /// Path to boot ROM file
    #[arg(long)]
    bootrom: Option<PathBuf>,

    /// Shade palette
    #[arg(long, value_enum)]
    palette: Option<PaletteName>,

    /// Window scale factor
    #[arg(long)]
    scale: Option<u32>,

    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen for a link cable peer on this TCP port
    #[arg(long, conflicts_with = "connect")]
    listen: Option<u16>,

    /// Connect the link cable to host[:port]; with no value, the config
    /// file's link host and port are used
    #[arg(long)]
    connect: Option<Option<String>>,

    /// Enable periodic logging of CPU state and serial output
    #[arg(long)]
    debug: bool,

    /// Run without opening a window
    #[arg(long)]
    headless: bool,

    /// Number of frames to run in headless mode
    #[arg(long)]
    frames: Option<u64>,

    /// Number of seconds to run in headless mode
    #[arg(long)]
    seconds: Option<u64>,

    /// Number of machine cycles to run in headless mode
    #[arg(long)]
    cycles: Option<u64>,
}

fn frame_duration() -> Duration {
    Duration::from_secs_f64(1.0 / GB_FPS)
}

fn dump_serial(gb: &mut GameBoy) {
    let serial = gb.mmu.take_serial();
    if serial.is_empty() {
        return;
    }
    print!("[SERIAL] ");
    for b in &serial {
        if b.is_ascii_graphic() || *b == b' ' {
            print!("{}", *b as char);
        } else {
            print!("\\x{:02X}", b);
        }
    }
    println!();
}

struct App {
    gb: GameBoy,
    window: Option<Arc<Window>>,
    pixels: Option<Pixels<'static>>,
    scale: u32,
    palette: PaletteName,
    /// Active-low button byte mirrored into the joypad register.
    buttons: u8,
    audio_paced: bool,
    audio_rate: u32,
    next_frame: Instant,
    frame_count: u64,
    debug: bool,
    fault: Option<CpuFault>,
}

impl App {
    fn run_one_frame(&mut self, event_loop: &ActiveEventLoop) -> bool {
        match self.gb.run_frame() {
            Ok(()) => {
                self.frame_count += 1;
                if self.debug && self.frame_count % 60 == 0 {
                    dump_serial(&mut self.gb);
                    println!("{}", self.gb.cpu.debug_state());
                }
                true
            }
            Err(fault) => {
                error!("{fault}");
                self.fault = Some(fault);
                event_loop.exit();
                false
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let size = LogicalSize::new(
            (SCREEN_WIDTH as u32 * self.scale) as f64,
            (SCREEN_HEIGHT as u32 * self.scale) as f64,
        );
        let attrs = Window::default_attributes()
            .with_title("lunaboy")
            .with_inner_size(size);
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .expect("failed to create window"),
        );

        let inner = window.inner_size();
        let surface = SurfaceTexture::new(inner.width, inner.height, window.clone());
        let pixels = Pixels::new(SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32, surface)
            .expect("failed to create pixel surface");

        self.window = Some(window);
        self.pixels = Some(pixels);
        self.next_frame = Instant::now();
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if let Some(pixels) = &mut self.pixels {
                    let _ = pixels.resize_surface(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.repeat {
                    return;
                }
                let pressed = event.state == ElementState::Pressed;
                let mask = match event.physical_key {
                    PhysicalKey::Code(KeyCode::ArrowRight) => Some(0x01),
                    PhysicalKey::Code(KeyCode::ArrowLeft) => Some(0x02),
                    PhysicalKey::Code(KeyCode::ArrowUp) => Some(0x04),
                    PhysicalKey::Code(KeyCode::ArrowDown) => Some(0x08),
                    PhysicalKey::Code(KeyCode::KeyS) => Some(0x10),
                    PhysicalKey::Code(KeyCode::KeyA) => Some(0x20),
                    PhysicalKey::Code(KeyCode::ShiftLeft | KeyCode::ShiftRight) => Some(0x40),
                    PhysicalKey::Code(KeyCode::Enter) => Some(0x80),
                    PhysicalKey::Code(KeyCode::KeyP) => {
                        if pressed {
                            self.palette = self.palette.next();
                            self.gb.mmu.ppu.set_palette(self.palette.colors());
                        }
                        None
                    }
                    PhysicalKey::Code(KeyCode::Escape) => {
                        if pressed {
                            event_loop.exit();
                        }
                        None
                    }
                    _ => None,
                };
                if let Some(mask) = mask {
                    if pressed {
                        self.buttons &= !mask;
                    } else {
                        self.buttons |= mask;
                    }
                    self.gb.set_buttons(self.buttons);
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(pixels) = &mut self.pixels else {
                    return;
                };
                let frame = self.gb.framebuffer();
                for (dst, src) in pixels.frame_mut().chunks_exact_mut(4).zip(frame.iter()) {
                    dst[0] = (src >> 16) as u8;
                    dst[1] = (src >> 8) as u8;
                    dst[2] = *src as u8;
                    dst[3] = 0xFF;
                }
                if pixels.render().is_err() {
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.audio_paced {
            // Keep a cushion of queued audio; the sound card's consumption
            // rate is the real frame clock.
            let target = (self.audio_rate / AUDIO_TARGET_FRACTION) as usize;
            let mut budget = 4;
            while self.gb.mmu.apu.queued_frames() < target && budget > 0 {
                if !self.run_one_frame(event_loop) {
                    return;
                }
                budget -= 1;
            }
        } else {
            let now = Instant::now();
            if now >= self.next_frame {
                if !self.run_one_frame(event_loop) {
                    return;
                }
                self.next_frame += frame_duration();
                if self.next_frame < now {
                    // Fell behind (window drag, suspend); don't burst to
                    // catch up.
                    self.next_frame = now + frame_duration();
                }
            }
        }

        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

fn run_headless(mut gb: GameBoy, args: &Args) -> i32 {
    let frame_limit = args.frames;
    let second_limit = args.seconds.map(Duration::from_secs);
    let start = Instant::now();
    let mut frame_count = 0u64;

    loop {
        if let Err(fault) = gb.run_frame() {
            error!("{fault}");
            gb.mmu.save_cart_ram();
            return 1;
        }
        frame_count += 1;

        if args.debug && frame_count % 60 == 0 {
            dump_serial(&mut gb);
            println!("{}", gb.cpu.debug_state());
        }

        if let Some(max) = frame_limit
            && frame_count >= max
        {
            break;
        }
        if let Some(limit) = second_limit
            && start.elapsed() >= limit
        {
            break;
        }
        if let Some(max) = args.cycles
            && gb.cpu.cycles >= max
        {
            break;
        }
    }

    gb.mmu.save_cart_ram();
    0
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let cfg = config::load_from_file(&config_path);

    let rom_path = match &args.rom {
        Some(p) => p.clone(),
        None => {
            eprintln!("No ROM supplied");
            std::process::exit(2);
        }
    };

    let cart = match Cartridge::from_file(&rom_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load ROM: {e}");
            std::process::exit(2);
        }
    };
    info!("loaded {:?} ({:?})", cart.title, cart.mbc);

    let bootrom_path = args.bootrom.clone().or(cfg.bootrom_path.clone());
    let mut gb = match &bootrom_path {
        Some(path) => match std::fs::read(path) {
            Ok(data) => {
                let mut gb = GameBoy::new_power_on();
                gb.load_boot_rom(data);
                gb
            }
            Err(e) => {
                eprintln!("Failed to load boot ROM: {e}");
                GameBoy::new()
            }
        },
        None => GameBoy::new(),
    };
    gb.load_cart(cart);

    let palette = args.palette.unwrap_or(cfg.palette);
    gb.mmu.ppu.set_palette(palette.colors());

    if let Some(port) = args.listen {
        match TcpLinkPort::listen(port) {
            Ok(link) => gb.connect_link(Box::new(link)),
            Err(e) => eprintln!("Failed to listen on port {port}: {e}"),
        }
    } else if let Some(target) = &args.connect {
        let Some((host, port)) = config::resolve_link_target(target.as_deref(), &cfg) else {
            eprintln!("Invalid link port in {:?}", target.as_deref().unwrap_or(""));
            std::process::exit(2);
        };
        match TcpLinkPort::connect(&host, port) {
            Ok(link) => gb.connect_link(Box::new(link)),
            Err(e) => eprintln!("Failed to connect to {host}:{port}: {e}"),
        }
    }

    if args.headless {
        std::process::exit(run_headless(gb, &args));
    }

    let (producer, consumer) = audio_queue(AUDIO_QUEUE_FRAMES);
    let stream = audio::start_stream(consumer);
    let audio_rate = match &stream {
        Some((_, rate)) => {
            gb.mmu.apu.set_sample_rate(*rate);
            gb.mmu.apu.attach_output(producer);
            *rate
        }
        None => 0,
    };

    let event_loop = EventLoop::new().expect("failed to create event loop");
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App {
        gb,
        window: None,
        pixels: None,
        scale: args.scale.unwrap_or(cfg.scale).max(1),
        palette,
        buttons: 0xFF,
        audio_paced: stream.is_some(),
        audio_rate,
        next_frame: Instant::now(),
        frame_count: 0,
        debug: args.debug,
        fault: None,
    };

    if let Err(e) = event_loop.run_app(&mut app) {
        error!("event loop error: {e}");
    }

    app.gb.mmu.save_cart_ram();
    if app.fault.is_some() {
        std::process::exit(1);
    }
}
