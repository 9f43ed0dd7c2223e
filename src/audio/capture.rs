//! Piezo input capture.
//!
//! The input callback converts each device frame to a pair of 12-bit
//! magnitudes (kick, snare), averages `oversampling` consecutive frames into
//! one detector frame and fills pool blocks with them. A full block goes to
//! the detector thread, which is then unparked. The callback never blocks and
//! never allocates; when it runs out of free blocks or queue room the data is
//! dropped and counted as an overrun.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::PushError;

use super::buffer_pool::{CaptureChannels, SampleBlock};
use crate::config::AudioConfig;
use crate::error::InputError;
use crate::onset::DetectorWaker;
use crate::state::Micros;
use crate::timing::Clock;

/// Full scale of the averaged samples (12-bit converter range)
pub const ADC_FULL_SCALE: u16 = 4095;

/// Scale a float sample's magnitude to the converter range
pub fn f32_to_adc(sample: f32) -> u16 {
    (sample.abs().min(1.0) * ADC_FULL_SCALE as f32).round() as u16
}

pub fn i16_to_adc(sample: i16) -> u16 {
    (sample.unsigned_abs() as u32 * ADC_FULL_SCALE as u32 / 32_768) as u16
}

/// Unsigned device samples are offset binary around 32768
pub fn u16_to_adc(sample: u16) -> u16 {
    let magnitude = (sample as i32 - 32_768).unsigned_abs();
    (magnitude * ADC_FULL_SCALE as u32 / 32_768).min(ADC_FULL_SCALE as u32) as u16
}

/// Groups raw frames into averaged detector frames and pool blocks.
pub struct BlockAssembler {
    channels: CaptureChannels,
    waker: DetectorWaker,
    overruns: Arc<AtomicU64>,
    oversampling: u32,
    frame_period_us: f64,
    sums: [u32; 2],
    summed: u32,
    current: Option<SampleBlock>,
    starved_frames: u64,
    block_frames: u64,
}

impl BlockAssembler {
    pub fn new(
        channels: CaptureChannels,
        waker: DetectorWaker,
        overruns: Arc<AtomicU64>,
        audio: &AudioConfig,
    ) -> Self {
        Self {
            channels,
            waker,
            overruns,
            oversampling: audio.oversampling.max(1) as u32,
            frame_period_us: audio.frame_period_us(),
            sums: [0; 2],
            summed: 0,
            current: None,
            starved_frames: 0,
            block_frames: audio.block_frames.max(1) as u64,
        }
    }

    /// Feed one raw (kick, snare) frame captured at `at`.
    pub fn push_frame(&mut self, raw: [u16; 2], at: Micros) {
        self.sums[0] += raw[0] as u32;
        self.sums[1] += raw[1] as u32;
        self.summed += 1;
        if self.summed < self.oversampling {
            return;
        }
        let frame = [
            (self.sums[0] / self.summed) as u16,
            (self.sums[1] / self.summed) as u16,
        ];
        self.sums = [0; 2];
        self.summed = 0;
        self.push_averaged(frame, at);
    }

    fn push_averaged(&mut self, frame: [u16; 2], at: Micros) {
        if self.current.is_none() {
            match self.channels.pool_consumer.pop() {
                Ok(block) => self.current = Some(block),
                Err(_) => {
                    // One overrun per block's worth of frames lost
                    if self.starved_frames % self.block_frames == 0 {
                        self.overruns.fetch_add(1, Ordering::Relaxed);
                    }
                    self.starved_frames += 1;
                    return;
                }
            }
        }
        self.starved_frames = 0;

        let Some(block) = self.current.as_mut() else {
            return;
        };
        // A block is stamped by its first frame, whether fresh from the pool
        // or kept back after a rejected push
        if block.frames.is_empty() {
            block.reset(at, self.frame_period_us);
        }
        block.frames.push(frame);
        if !block.is_full() {
            return;
        }

        // The data queue holds every block of the pool, so Full only shows up
        // if the queues are ever sized apart
        if let Some(block) = self.current.take() {
            if let Err(PushError::Full(mut block)) = self.channels.data_producer.push(block) {
                self.overruns.fetch_add(1, Ordering::Relaxed);
                block.frames.clear();
                self.current = Some(block);
            }
        }
        self.waker.wake();
    }
}

/// Live input stream from a two-channel interface.
pub struct InputCapture {
    stream: cpal::Stream,
    device_name: String,
    sample_rate: u32,
}

impl InputCapture {
    /// Open the default input device (or the first whose name contains
    /// `device_filter`) and start streaming into the pool.
    ///
    /// The device's own sample rate replaces `audio.sample_rate`.
    pub fn open(
        device_filter: Option<&str>,
        audio: &AudioConfig,
        channels: CaptureChannels,
        waker: DetectorWaker,
        overruns: Arc<AtomicU64>,
        time: Arc<dyn Clock>,
    ) -> Result<Self, InputError> {
        let host = cpal::default_host();
        let device = match device_filter {
            None => host.default_input_device(),
            Some(filter) => host
                .input_devices()
                .map_err(|err| InputError::DeviceUnavailable {
                    details: err.to_string(),
                })?
                .find(|device| {
                    device
                        .name()
                        .map(|name| name.contains(filter))
                        .unwrap_or(false)
                }),
        }
        .ok_or_else(|| InputError::DeviceUnavailable {
            details: match device_filter {
                Some(filter) => format!("no input device matching '{}'", filter),
                None => "no default input device".to_string(),
            },
        })?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let supported = device
            .default_input_config()
            .map_err(|err| InputError::StreamOpenFailed {
                reason: format!("Failed to get default input config: {:?}", err),
            })?;
        let stream_config: cpal::StreamConfig = supported.config();
        if stream_config.channels < 2 {
            return Err(InputError::ChannelCountTooLow {
                channels: stream_config.channels,
            });
        }

        let sample_rate = stream_config.sample_rate.0;
        let audio = AudioConfig {
            sample_rate,
            ..*audio
        };
        let assembler = BlockAssembler::new(channels, waker, overruns, &audio);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &stream_config, assembler, time, f32_to_adc)
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &stream_config, assembler, time, i16_to_adc)
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &stream_config, assembler, time, u16_to_adc)
            }
            other => {
                return Err(InputError::UnsupportedFormat {
                    format: format!("{:?}", other),
                })
            }
        }?;

        stream.play().map_err(|err| InputError::StreamOpenFailed {
            reason: format!("{:?}", err),
        })?;

        log::info!(
            "[InputCapture] Streaming from '{}' at {} Hz, {} channels",
            device_name,
            sample_rate,
            stream_config.channels
        );
        Ok(Self {
            stream,
            device_name,
            sample_rate,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn pause(&self) -> Result<(), InputError> {
        self.stream
            .pause()
            .map_err(|err| InputError::StreamOpenFailed {
                reason: format!("{:?}", err),
            })
    }
}

fn build_stream<T: cpal::SizedSample + 'static>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: BlockAssembler,
    time: Arc<dyn Clock>,
    convert: fn(T) -> u16,
) -> Result<cpal::Stream, InputError> {
    let channel_count = config.channels as usize;
    let raw_period_us = 1_000_000.0 / config.sample_rate.0.max(1) as f64;
    let err_fn = |err| tracing::error!("[InputCapture] Input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let frames = data.len() / channel_count;
                // The last frame of the buffer was captured just now
                let start = time.now_us() as f64 - frames as f64 * raw_period_us;
                for (i, frame) in data.chunks_exact(channel_count).enumerate() {
                    let at = (start + (i + 1) as f64 * raw_period_us).round() as Micros;
                    assembler.push_frame([convert(frame[0]), convert(frame[1])], at);
                }
            },
            err_fn,
            None,
        )
        .map_err(|err| InputError::StreamOpenFailed {
            reason: format!("{:?}", err),
        })
}
