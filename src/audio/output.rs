// Audio output using cpal
// Mixes every live voice inside the device callback; new voices reach the
// callback through a lock-free ring buffer.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::assets::{Track, TrackGain};
use crate::error::{self, PlayerError};
use crate::audio::decoder::DecodedBuffer;
use crate::transport::{AudioBackend, Voice, VoiceStart};

/// How often a full voice queue is retried before a voice is dropped
const SUBMIT_ATTEMPTS: usize = 50;

type VoiceProducer = ringbuf::HeapProd<MixVoice>;
type VoiceConsumer = ringbuf::HeapCons<MixVoice>;

/// Flags shared between a voice handle and the audio thread
#[derive(Debug, Default)]
struct VoiceFlags {
    stopped: AtomicBool,
    looping: AtomicBool,
}

/// Control-side handle of a voice being mixed. Dropping it stops the voice.
#[derive(Debug)]
pub struct OutputVoice {
    flags: Arc<VoiceFlags>,
}

impl Voice for OutputVoice {
    fn stop(&mut self) {
        self.flags.stopped.store(true, Ordering::Release);
    }

    fn set_looping(&mut self, looping: bool) {
        self.flags.looping.store(looping, Ordering::Release);
    }
}

impl Drop for OutputVoice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Audio-thread state of one voice
struct MixVoice {
    buffer: Arc<DecodedBuffer>,
    gain: TrackGain,
    flags: Arc<VoiceFlags>,
    /// Output frame at which the voice becomes audible
    start_frame: u64,
    /// Song position, in buffer frames
    position: f64,
    /// Song length, in buffer frames
    end: f64,
    /// Buffer frames per output frame
    step: f64,
    started: bool,
    finished: bool,
}

impl MixVoice {
    fn is_done(&self) -> bool {
        self.finished || self.flags.stopped.load(Ordering::Acquire)
    }

    fn mix_into(&mut self, out: &mut [f32], channels: usize, base_frame: u64) {
        let gain = self.gain.get();
        let looping = self.flags.looping.load(Ordering::Acquire);

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let now = base_frame + i as u64;
            if now < self.start_frame {
                continue;
            }
            if !self.started {
                // Arrived after its start frame; skip ahead to stay in step
                let late = now - self.start_frame;
                self.position += late as f64 * self.step;
                self.started = true;
            }
            if self.position >= self.end {
                if looping && self.end > 0.0 {
                    self.position %= self.end;
                } else {
                    self.finished = true;
                    return;
                }
            }

            let src = self.position as usize;
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample += self.buffer.sample(src, ch) * gain;
            }
            self.position += self.step;
        }
    }
}

/// Callback side: owns the voices and advances the hardware clock
pub struct Mixer {
    voices: Vec<MixVoice>,
    incoming: VoiceConsumer,
    channels: usize,
    frames_rendered: Arc<AtomicU64>,
}

impl Mixer {
    /// Fill `out` (interleaved) with the mix of every live voice
    pub fn render(&mut self, out: &mut [f32]) {
        while let Some(voice) = self.incoming.try_pop() {
            self.voices.push(voice);
        }
        self.voices.retain(|v| !v.is_done());

        out.fill(0.0);
        let base = self.frames_rendered.load(Ordering::Acquire);
        for voice in &mut self.voices {
            voice.mix_into(out, self.channels, base);
        }
        let frames = (out.len() / self.channels) as u64;
        self.frames_rendered.store(base + frames, Ordering::Release);
    }
}

/// Control side: schedules voices and reads the hardware clock
pub struct MixerHandle {
    producer: VoiceProducer,
    sample_rate: u32,
    frames_rendered: Arc<AtomicU64>,
}

impl MixerHandle {
    fn submit(&mut self, voice: MixVoice) -> Result<(), MixVoice> {
        let mut voice = voice;
        for _ in 0..SUBMIT_ATTEMPTS {
            match self.producer.try_push(voice) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    // Queue full, wait for the callback to drain it
                    voice = rejected;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
        Err(voice)
    }
}

impl AudioBackend for MixerHandle {
    type Voice = OutputVoice;

    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn start_voice(&mut self, track: &Track, start: VoiceStart) -> error::Result<OutputVoice> {
        let buffer = Arc::clone(track.buffer());
        let source_rate = buffer.sample_rate() as f64;
        if buffer.sample_rate() != self.sample_rate {
            log::warn!(
                "[Output] Track {} is {} Hz, device is {} Hz",
                track.id(),
                buffer.sample_rate(),
                self.sample_rate
            );
        }

        let flags = Arc::new(VoiceFlags::default());
        flags.looping.store(start.looping, Ordering::Release);

        let voice = MixVoice {
            gain: track.gain().clone(),
            flags: Arc::clone(&flags),
            start_frame: (start.at * self.sample_rate as f64).round().max(0.0) as u64,
            position: start.offset * source_rate,
            end: (start.end * source_rate).round(),
            step: source_rate / self.sample_rate as f64,
            started: false,
            finished: false,
            buffer,
        };
        if self.submit(voice).is_err() {
            log::warn!("[Output] Voice queue full, track {} not started", track.id());
            return Err(PlayerError::Output(format!(
                "voice queue full, track {} not started",
                track.id()
            )));
        }

        Ok(OutputVoice { flags })
    }
}

/// Create a connected mixer pair without any device attached
pub fn mixer(capacity: usize, sample_rate: u32, channels: usize) -> (MixerHandle, Mixer) {
    let (producer, consumer) = HeapRb::<MixVoice>::new(capacity.max(1)).split();
    let frames_rendered = Arc::new(AtomicU64::new(0));
    let handle = MixerHandle {
        producer,
        sample_rate: sample_rate.max(1),
        frames_rendered: Arc::clone(&frames_rendered),
    };
    let mixer = Mixer {
        voices: Vec::new(),
        incoming: consumer,
        channels: channels.max(1),
        frames_rendered,
    };
    (handle, mixer)
}

pub struct AudioOutput {
    _stream: Stream,
    handle: MixerHandle,
    sample_rate: u32,
}

impl AudioOutput {
    /// Open the default output device and start mixing
    pub fn new(voice_capacity: usize) -> Result<Self, String> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or("No output device available")?;

        let config = device
            .default_output_config()
            .map_err(|e| format!("Failed to get default output config: {}", e))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels();

        let (handle, mixer) = mixer(voice_capacity, sample_rate, channels as usize);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => Self::build_stream::<f32>(&device, &config.into(), mixer)?,
            cpal::SampleFormat::I16 => Self::build_stream::<i16>(&device, &config.into(), mixer)?,
            cpal::SampleFormat::U16 => Self::build_stream::<u16>(&device, &config.into(), mixer)?,
            format => return Err(format!("Unsupported sample format: {:?}", format)),
        };

        stream
            .play()
            .map_err(|e| format!("Failed to start stream: {}", e))?;

        log::info!(
            "[Output] Opened output at {} Hz, {} channels",
            sample_rate,
            channels
        );

        Ok(Self {
            _stream: stream,
            handle,
            sample_rate,
        })
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut mixer: Mixer,
    ) -> Result<Stream, String> {
        let mut scratch: Vec<f32> = Vec::new();
        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    mixer.render(&mut scratch);
                    for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                        *out = T::from_sample(value);
                    }
                },
                move |err| {
                    log::error!("[Output] Audio output error: {}", err);
                },
                None,
            )
            .map_err(|e| format!("Failed to build output stream: {}", e))?;

        Ok(stream)
    }

    /// Get the output sample rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioBackend for AudioOutput {
    type Voice = OutputVoice;

    fn now(&self) -> f64 {
        self.handle.now()
    }

    fn start_voice(&mut self, track: &Track, start: VoiceStart) -> error::Result<OutputVoice> {
        self.handle.start_voice(track, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::tests::stems;
    use crate::assets::{AssetSet, DurationPolicy, TrackId};
    use crate::transport::{Phase, Transport};

    const RATE: u32 = 100;

    fn render(mixer: &mut Mixer, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        mixer.render(&mut out);
        out
    }

    #[test]
    fn test_voices_start_on_the_same_frame() {
        let assets = stems(&[1.0, 1.0]);
        let (handle, mut mixer) = mixer(8, RATE, 1);
        let mut transport = Transport::new(handle, 0.05);

        transport.play(&assets).unwrap();
        let out = render(&mut mixer, 10);
        assert_eq!(&out[..5], &[0.0; 5]);
        assert_eq!(&out[5..], &[1.0; 5]);
        approx::assert_relative_eq!(transport.now(), 0.1);
    }

    #[test]
    fn test_mute_silences_without_moving_the_voice() {
        let tracks = (0..2)
            .map(|i| {
                let ramp = (0..100).map(|f| f as f32 / 100.0).collect();
                Track::new(TrackId(i), format!("{i}.wav"), DecodedBuffer::new(ramp, RATE, 1))
            })
            .collect();
        let mut assets = AssetSet::from_tracks(tracks, DurationPolicy::Fixed(1.0)).unwrap();
        let (handle, mut mixer) = mixer(8, RATE, 1);
        let mut transport = Transport::new(handle, 0.0);

        transport.play(&assets).unwrap();
        render(&mut mixer, 10);
        assets.set_muted(TrackId(1), true);
        let muted = render(&mut mixer, 10);
        approx::assert_relative_eq!(muted[0], 0.10);

        assets.set_muted(TrackId(1), false);
        let unmuted = render(&mut mixer, 10);
        // Both voices are at frame 20, in step
        approx::assert_relative_eq!(unmuted[0], 0.40);
    }

    #[test]
    fn test_stop_silences_on_next_callback() {
        let assets = stems(&[1.0, 1.0, 1.0]);
        let (handle, mut mixer) = mixer(8, RATE, 2);
        let mut transport = Transport::new(handle, 0.0);

        transport.play(&assets).unwrap();
        let out = render(&mut mixer, 4);
        assert_eq!(out, vec![1.5; 4]);

        transport.stop();
        assert_eq!(render(&mut mixer, 4), vec![0.0; 4]);
    }

    #[test]
    fn test_looping_voice_wraps_at_song_end() {
        let ramp = (0..10).map(|f| f as f32 / 10.0).collect();
        let tracks = vec![Track::new(TrackId(0), "ramp.wav", DecodedBuffer::new(ramp, RATE, 1))];
        let assets = AssetSet::from_tracks(tracks, DurationPolicy::Fixed(0.1)).unwrap();
        let (handle, mut mixer) = mixer(8, RATE, 1);
        let mut transport = Transport::new(handle, 0.0);

        transport.toggle_loop(&assets);
        transport.play(&assets).unwrap();
        let out = render(&mut mixer, 25);
        approx::assert_relative_eq!(out[3], 0.3);
        approx::assert_relative_eq!(out[13], 0.3);
        approx::assert_relative_eq!(out[24], 0.4);
    }

    #[test]
    fn test_voice_ends_at_song_end_without_loop() {
        let tracks = vec![Track::new(
            TrackId(0),
            "long.wav",
            DecodedBuffer::new(vec![0.5; 100], RATE, 1),
        )];
        let assets = AssetSet::from_tracks(tracks, DurationPolicy::Fixed(0.1)).unwrap();
        let (handle, mut mixer) = mixer(8, RATE, 1);
        let mut transport = Transport::new(handle, 0.0);

        transport.play(&assets).unwrap();
        let out = render(&mut mixer, 20);
        assert_eq!(&out[..10], &[0.5; 10]);
        assert_eq!(&out[10..], &[0.0; 10]);
    }

    #[test]
    fn test_full_queue_fails_the_whole_group() {
        let assets = stems(&[1.0, 1.0, 1.0]);
        let (handle, mut mixer) = mixer(2, RATE, 1);
        let mut transport = Transport::new(handle, 0.0);

        // The callback never runs, so the third voice finds the queue full
        let err = transport.play(&assets).unwrap_err();
        assert!(matches!(err, PlayerError::Output(ref m) if m.contains("track 2")));
        assert_eq!(transport.phase(), Phase::Stopped);

        // The two queued voices were released with the failed group
        assert_eq!(render(&mut mixer, 4), vec![0.0; 4]);
    }
}
