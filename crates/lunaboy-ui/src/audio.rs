use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use lunaboy_core::audio_queue::AudioConsumer;

/// Start audio playback using `cpal`, draining sample frames from the queue
/// the emulator core pushes into.
///
/// Returns the active [`cpal::Stream`] and its sample rate if successful.
pub fn start_stream(consumer: AudioConsumer) -> Option<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host.default_output_device()?;
    let supported = match device.default_output_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("no supported output config: {e}");
            return None;
        }
    };
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let err_fn = |err| eprintln!("cpal stream error: {err}");

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    for frame in data.chunks_mut(channels) {
                        let (left, right) = consumer.pop_stereo().unwrap_or((0, 0));
                        frame[0] = left;
                        if channels > 1 {
                            frame[1] = right;
                        }
                    }
                },
                err_fn,
                None,
            )
            .unwrap(),
        cpal::SampleFormat::U16 => device
            .build_output_stream(
                &config,
                move |data: &mut [u16], _| {
                    for frame in data.chunks_mut(channels) {
                        let (left, right) = consumer.pop_stereo().unwrap_or((0, 0));
                        frame[0] = (left as i32 + 32768) as u16;
                        if channels > 1 {
                            frame[1] = (right as i32 + 32768) as u16;
                        }
                    }
                },
                err_fn,
                None,
            )
            .unwrap(),
        cpal::SampleFormat::F32 => device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    for frame in data.chunks_mut(channels) {
                        let (left, right) = consumer.pop_stereo().unwrap_or((0, 0));
                        frame[0] = left as f32 / 32768.0;
                        if channels > 1 {
                            frame[1] = right as f32 / 32768.0;
                        }
                    }
                },
                err_fn,
                None,
            )
            .unwrap(),
        _ => {
            eprintln!("unsupported sample format {sample_format:?}");
            return None;
        }
    };

    stream.play().expect("failed to play stream");
    Some((stream, sample_rate))
}
