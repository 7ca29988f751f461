//! Native implementations of the platform seams.
//!
//! Capture uses CPAL with the stream owned by a dedicated thread (CPAL
//! streams are not `Send`), the encoder buffers PCM and assembles WAV via
//! hound, and playback goes through a rodio sink. Each piece communicates
//! with the async side over channels.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, StreamConfig};
use hound::{WavSpec, WavWriter};
use rodio::{Decoder, OutputStream, Sink};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::{
    ActivePlayback, AudioClip, AudioOutput, Capabilities, CaptureConstraints, CaptureStream,
    EncodedFragment, EncoderFactory, MicrophoneSource, PlaybackHandle, SampleReceiver,
    StreamEncoder,
};
use crate::error::{AcquisitionError, EncodingError, PlaybackError};

/// Capacity of the broadcast sample feed, in chunks.
const SAMPLE_FEED_CAPACITY: usize = 64;

/// Resolve platform capabilities once at startup.
pub fn detect_capabilities() -> Capabilities {
    // Native hosts always have a standard render context and an FFT at hand;
    // haptics has no desktop surface.
    Capabilities {
        render_context: super::RenderContext::Standard,
        frequency_analysis: true,
        haptics: false,
    }
}

/// Microphone acquisition via the default CPAL input device.
pub struct CpalMicrophone;

#[async_trait::async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, AcquisitionError> {
        let constraints = constraints.clone();
        tokio::task::spawn_blocking(move || acquire_blocking(&constraints))
            .await
            .map_err(|e| AcquisitionError::Failed(e.to_string()))?
    }
}

fn acquire_blocking(
    constraints: &CaptureConstraints,
) -> Result<Box<dyn CaptureStream>, AcquisitionError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AcquisitionError::DeviceNotFound)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AcquisitionError::NotSupported)?;

    let sample_format = supported_config.sample_format();
    let mut config: StreamConfig = supported_config.into();

    if let Some(rate) = constraints.sample_rate {
        config.sample_rate = cpal::SampleRate(rate);
    }

    log::info!(
        "Audio config: {} Hz, {} channels, {:?} (echo_cancellation={}, noise_suppression={})",
        config.sample_rate.0,
        config.channels,
        sample_format,
        constraints.echo_cancellation,
        constraints.noise_suppression,
    );

    let sample_rate = config.sample_rate.0;
    let channels = config.channels;

    let (sample_tx, _) = broadcast::channel::<Vec<i16>>(SAMPLE_FEED_CAPACITY);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AcquisitionError>>();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    // The CPAL stream is !Send, so it lives on its own thread and is dropped
    // there when the session stops the tracks.
    let thread_tx = sample_tx.clone();
    std::thread::spawn(move || {
        let stream = match build_input_stream(&device, &config, sample_format, channels, thread_tx)
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(AcquisitionError::Failed(format!(
                "Failed to start stream: {}",
                e
            ))));
            return;
        }

        let _ = ready_tx.send(Ok(()));

        // Park until stop_tracks() (or the stream handle drop) signals us.
        let _ = stop_rx.recv();
        drop(stream);
        log::debug!("Capture thread exited, hardware released");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Box::new(NativeCaptureStream {
            sample_rate,
            sample_tx,
            stop_tx: Some(stop_tx),
        })),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AcquisitionError::Failed("Capture thread died".to_string())),
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    channels: u16,
    tx: broadcast::Sender<Vec<i16>>,
) -> Result<cpal::Stream, AcquisitionError> {
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    match sample_format {
        SampleFormat::I16 => build_input_stream_typed::<i16>(device, config, channels, tx, err_fn),
        SampleFormat::U16 => build_input_stream_typed::<u16>(device, config, channels, tx, err_fn),
        SampleFormat::F32 => build_input_stream_typed::<f32>(device, config, channels, tx, err_fn),
        _ => Err(AcquisitionError::NotSupported),
    }
}

fn build_input_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: u16,
    tx: broadcast::Sender<Vec<i16>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AcquisitionError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix_to_mono(data, channels);
                // No subscribers is fine; the feed is best-effort.
                let _ = tx.send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| AcquisitionError::Failed(e.to_string()))?;

    Ok(stream)
}

/// Convert an interleaved frame buffer to mono i16, averaging channels.
fn downmix_to_mono<T>(data: &[T], channels: u16) -> Vec<i16>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let channels = channels.max(1) as usize;
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
            let avg = (sum / frame.len() as f32).clamp(-1.0, 1.0);
            (avg * i16::MAX as f32) as i16
        })
        .collect()
}

struct NativeCaptureStream {
    sample_rate: u32,
    sample_tx: broadcast::Sender<Vec<i16>>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl CaptureStream for NativeCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn subscribe(&self) -> SampleReceiver {
        self.sample_tx.subscribe()
    }

    fn stop_tracks(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for NativeCaptureStream {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}

/// WAV-only encoder factory. The negotiation fallback always lands on a
/// mime type this factory accepts.
pub struct WavEncoderFactory;

const WAV_MIME_TYPES: [&str; 3] = ["audio/wav", "audio/wave", "audio/x-wav"];

impl EncoderFactory for WavEncoderFactory {
    fn supports(&self, mime_type: &str) -> bool {
        WAV_MIME_TYPES.contains(&mime_type)
    }

    fn create(
        &self,
        stream: &dyn CaptureStream,
        mime_type: &str,
        timeslice: Duration,
    ) -> Box<dyn StreamEncoder> {
        log::debug!(
            "Creating WAV encoder: mime={}, timeslice={:?}",
            mime_type,
            timeslice
        );

        let mut samples_rx = stream.subscribe();
        let (frag_tx, frag_rx) = mpsc::channel::<EncodedFragment>(64);
        let (finalize_tx, mut finalize_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            let mut tick = tokio::time::interval(timeslice);

            loop {
                tokio::select! {
                    _ = finalize_rx.changed() => {
                        drain_samples(&mut samples_rx, &mut pending);
                        let _ = frag_tx
                            .send(EncodedFragment { data: std::mem::take(&mut pending), last: true })
                            .await;
                        break;
                    }
                    _ = tick.tick() => {
                        drain_samples(&mut samples_rx, &mut pending);
                        if !pending.is_empty() {
                            let fragment = EncodedFragment {
                                data: std::mem::take(&mut pending),
                                last: false,
                            };
                            if frag_tx.send(fragment).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Box::new(WavStreamEncoder {
            fragments_rx: Some(frag_rx),
            finalize_tx,
        })
    }

    fn assemble(
        &self,
        mime_type: &str,
        sample_rate: u32,
        fragments: &[EncodedFragment],
    ) -> Result<AudioClip, EncodingError> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| EncodingError::AssemblyFailed(e.to_string()))?;
            for fragment in fragments {
                for sample in fragment.data.chunks_exact(2) {
                    let value = i16::from_le_bytes([sample[0], sample[1]]);
                    writer
                        .write_sample(value)
                        .map_err(|e| EncodingError::AssemblyFailed(e.to_string()))?;
                }
            }
            writer
                .finalize()
                .map_err(|e| EncodingError::AssemblyFailed(e.to_string()))?;
        }

        Ok(AudioClip::new(cursor.into_inner(), mime_type))
    }
}

fn drain_samples(rx: &mut SampleReceiver, pending: &mut Vec<u8>) {
    loop {
        match rx.try_recv() {
            Ok(chunk) => {
                for sample in chunk {
                    pending.extend_from_slice(&sample.to_le_bytes());
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                log::warn!("Encoder lagged behind capture, {} chunks dropped", skipped);
            }
            Err(_) => break,
        }
    }
}

struct WavStreamEncoder {
    fragments_rx: Option<mpsc::Receiver<EncodedFragment>>,
    finalize_tx: watch::Sender<bool>,
}

impl StreamEncoder for WavStreamEncoder {
    fn fragments(&mut self) -> Option<mpsc::Receiver<EncodedFragment>> {
        self.fragments_rx.take()
    }

    fn finalize(&mut self) {
        let _ = self.finalize_tx.send(true);
    }
}

/// Playback via a rodio sink on the default output device.
///
/// Like capture, the output stream lives on a dedicated thread; the sink
/// itself is `Send` and shared back for stop control.
pub struct RodioOutput;

impl AudioOutput for RodioOutput {
    fn play(&self, clip: &AudioClip) -> Result<ActivePlayback, PlaybackError> {
        let bytes = (*clip.bytes).clone();
        let (ended_tx, ended_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) =
            std::sync::mpsc::channel::<Result<Arc<Sink>, PlaybackError>>();
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_thread = Arc::clone(&stopped);

        std::thread::spawn(move || {
            let (_stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(PlaybackError::OutputUnavailable(e.to_string())));
                    return;
                }
            };

            let sink = match Sink::try_new(&handle) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    let _ = ready_tx.send(Err(PlaybackError::OutputUnavailable(e.to_string())));
                    return;
                }
            };

            let source = match Decoder::new(Cursor::new(bytes)) {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready_tx.send(Err(PlaybackError::Decode(e.to_string())));
                    return;
                }
            };

            sink.append(source);
            let _ = ready_tx.send(Ok(Arc::clone(&sink)));

            // Blocks until the queue drains or stop() drops the sources.
            sink.sleep_until_end();

            if !stopped_thread.load(Ordering::SeqCst) {
                let _ = ended_tx.send(());
            }
        });

        match ready_rx.recv() {
            Ok(Ok(sink)) => Ok(ActivePlayback {
                handle: Box::new(RodioHandle { sink, stopped }),
                ended: ended_rx,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PlaybackError::OutputUnavailable(
                "Playback thread died".to_string(),
            )),
        }
    }
}

struct RodioHandle {
    sink: Arc<Sink>,
    stopped: Arc<AtomicBool>,
}

impl PlaybackHandle for RodioHandle {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.sink.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_factory_accepts_wav_mimes_only() {
        let factory = WavEncoderFactory;
        assert!(factory.supports("audio/wav"));
        assert!(factory.supports("audio/x-wav"));
        assert!(!factory.supports("audio/webm;codecs=opus"));
        assert!(!factory.supports("audio/mp4"));
    }

    #[test]
    fn assemble_produces_riff_header_and_all_samples() {
        let factory = WavEncoderFactory;
        let samples: Vec<u8> = (0..100i16).flat_map(|s| s.to_le_bytes()).collect();
        let fragments = vec![
            EncodedFragment { data: samples.clone(), last: false },
            EncodedFragment { data: samples, last: true },
        ];

        let clip = factory.assemble("audio/wav", 48_000, &fragments).unwrap();
        assert_eq!(&clip.bytes[0..4], b"RIFF");
        // 44-byte canonical header + 200 samples * 2 bytes
        assert_eq!(clip.len(), 44 + 400);
    }

    #[test]
    fn downmix_averages_stereo_frames() {
        let stereo: Vec<f32> = vec![0.5, -0.5, 1.0, 1.0];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert_eq!(mono[0], 0);
        assert_eq!(mono[1], i16::MAX);
    }
}
