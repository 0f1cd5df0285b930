//! Real output through the default audio device with `cpal`.

use super::{CancelToken, Playback, PlaybackError, CANCEL_POLL};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use hound::{SampleFormat, WavReader};
use log::warn;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Plays clips on the system's default output device. Every call opens a
/// fresh stream and closes it when the clip ends or is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalPlayer;

impl CpalPlayer {
    /// Fails if the system has no output device.
    pub fn new() -> Result<Self, PlaybackError> {
        cpal::default_host()
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("no default output device".to_owned()))?;
        Ok(Self)
    }
}

impl Playback for CpalPlayer {
    fn play(&self, path: &Path, cancel: &CancelToken) -> Result<(), PlaybackError> {
        if !path.exists() {
            return Err(PlaybackError::FileNotFound(path.to_owned()));
        }
        let clip = Clip::read(path)?;

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("no default output device".to_owned()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        let sample_format = supported.sample_format();
        let mut config: cpal::StreamConfig = supported.config();
        if config.sample_rate.0 != clip.sample_rate {
            // Ask for the clip's own rate; not every device will take it.
            let native = config.clone();
            config.sample_rate = cpal::SampleRate(clip.sample_rate);
            if device.supported_output_configs().map_or(true, |mut configs| {
                !configs.any(|c| {
                    c.min_sample_rate().0 <= clip.sample_rate && c.max_sample_rate().0 >= clip.sample_rate
                })
            }) {
                warn!(
                    "{}: device does not support {} Hz, playing at {} Hz",
                    path.display(),
                    clip.sample_rate,
                    native.sample_rate.0
                );
                config = native;
            }
        }

        let finished = Arc::new(AtomicBool::new(false));
        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, clip, finished.clone()),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, clip, finished.clone()),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, clip, finished.clone()),
            other => Err(PlaybackError::Device(format!("unsupported sample format {other:?}"))),
        }?;
        stream
            .play()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        loop {
            if finished.load(Ordering::SeqCst) {
                return Ok(());
            }
            if cancel.is_cancelled() {
                // dropping the stream silences it
                drop(stream);
                return Err(PlaybackError::Cancelled);
            }
            spin_sleep::sleep(CANCEL_POLL);
        }
    }
}

/// Interleaved samples scaled to `-1.0..1.0`.
struct Clip {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
}

impl Clip {
    fn read(path: &Path) -> Result<Self, PlaybackError> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(PlaybackError::Decode(hound::Error::FormatError(
                "sample rate of zero",
            )));
        }
        let samples = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let scale = 1.0 / (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(Self {
            samples,
            channels: spec.channels.max(1) as usize,
            sample_rate: spec.sample_rate,
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    clip: Clip,
    finished: Arc<AtomicBool>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: FromF32 + cpal::SizedSample + Send + 'static,
{
    let out_channels = config.channels.max(1) as usize;
    let frames = clip.samples.len() / clip.channels;
    let mut cursor = 0;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(out_channels) {
                    if cursor >= frames {
                        frame.fill(T::from_f32(0.0));
                        finished.store(true, Ordering::SeqCst);
                        continue;
                    }
                    for (ch, out) in frame.iter_mut().enumerate() {
                        // mono clips go to every output channel
                        let src = ch.min(clip.channels - 1);
                        *out = T::from_f32(clip.samples[cursor * clip.channels + src]);
                    }
                    cursor += 1;
                }
            },
            |err| warn!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| PlaybackError::Device(e.to_string()))
}

trait FromF32: Copy {
    fn from_f32(s: f32) -> Self;
}

impl FromF32 for f32 {
    fn from_f32(s: f32) -> Self {
        s.clamp(-1.0, 1.0)
    }
}

impl FromF32 for i16 {
    fn from_f32(s: f32) -> Self {
        (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
    }
}

impl FromF32 for u16 {
    fn from_f32(s: f32) -> Self {
        (((s.clamp(-1.0, 1.0) * 0.5) + 0.5) * u16::MAX as f32) as u16
    }
}
