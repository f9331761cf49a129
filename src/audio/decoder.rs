// Stem decoding using Symphonia
// Decodes a whole file into an in-memory interleaved f32 buffer

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::{AudioBufferRef, AudioPlanes, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;

/// Input frames handed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Fully decoded PCM for one stem.
///
/// Samples are interleaved and shared, so handing the buffer to a voice
/// never copies audio data.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: usize,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: usize) -> Self {
        let channels = channels.max(1);
        let mut samples = samples;
        // Drop a trailing partial frame so every frame is complete
        samples.truncate(samples.len() - samples.len() % channels);
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample of `channel` in `frame`, or silence past the end
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        self.samples
            .get(frame * self.channels + channel % self.channels)
            .copied()
            .unwrap_or(0.0)
    }
}

pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
}

impl AudioDecoder {
    /// Open an audio file and prepare for decoding
    pub fn open(path: &Path) -> Result<Self, String> {
        let file = File::open(path).map_err(|e| format!("Failed to open file: {}", e))?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| format!("Failed to probe file format: {}", e))?;

        let format = probed.format;

        // First audio track only; stems are expected to be single-track files
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| "No audio track found".to_string())?;

        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
        let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| format!("Failed to create decoder: {}", e))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
        })
    }

    /// Decode next packet into interleaved f32 samples.
    /// Returns None at end of stream.
    pub fn decode_next(&mut self) -> Result<Option<Vec<f32>>, String> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(format!("Failed to read packet: {}", e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    // The codec knows the real layout better than the container
                    self.channels = decoded.spec().channels.count().max(1);
                    return Ok(Some(audio_buf_to_f32(&decoded)));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("[Decoder] Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(format!("Decode failed: {}", e)),
            }
        }
    }

    /// Decode the remaining stream into one buffer
    pub fn decode_to_end(mut self) -> Result<DecodedBuffer, String> {
        let mut samples = Vec::new();
        while let Some(chunk) = self.decode_next()? {
            samples.extend_from_slice(&chunk);
        }
        Ok(DecodedBuffer::new(samples, self.sample_rate, self.channels))
    }
}

/// Decode a whole file, optionally converting it to `target_rate`
pub fn decode_file(path: &Path, target_rate: Option<u32>) -> Result<DecodedBuffer, String> {
    let buffer = AudioDecoder::open(path)?.decode_to_end()?;
    match target_rate {
        Some(rate) if rate != buffer.sample_rate() => resample(&buffer, rate),
        _ => Ok(buffer),
    }
}

/// Convert a buffer to another sample rate, keeping its duration
pub fn resample(buffer: &DecodedBuffer, target_rate: u32) -> Result<DecodedBuffer, String> {
    let channels = buffer.channels();
    let frames = buffer.frames();
    if frames == 0 || target_rate == 0 || buffer.sample_rate() == 0 {
        return Ok(DecodedBuffer::new(Vec::new(), target_rate, channels));
    }

    let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for frame in buffer.samples().chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }

    let mut resampler = FftFixedIn::<f32>::new(
        buffer.sample_rate() as usize,
        target_rate as usize,
        RESAMPLE_CHUNK,
        2,
        channels,
    )
    .map_err(|e| format!("Failed to create resampler: {}", e))?;

    let expected =
        (frames as f64 * target_rate as f64 / buffer.sample_rate() as f64).round() as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

    let mut pos = 0;
    while pos < frames {
        let end = (pos + resampler.input_frames_next()).min(frames);
        let chunk: Vec<&[f32]> = planar.iter().map(|p| &p[pos..end]).collect();
        let produced = if end - pos == resampler.input_frames_next() {
            resampler.process(&chunk[..], None)
        } else {
            resampler.process_partial(Some(&chunk[..]), None)
        }
        .map_err(|e| format!("Resampling failed: {}", e))?;
        for (ch, data) in produced.into_iter().enumerate() {
            out[ch].extend(data);
        }
        pos = end;
    }

    // Flush what is still buffered inside the resampler
    while out[0].len() < expected + delay {
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| format!("Resampling failed: {}", e))?;
        if tail.first().map_or(true, |t| t.is_empty()) {
            break;
        }
        for (ch, data) in tail.into_iter().enumerate() {
            out[ch].extend(data);
        }
    }

    let available = out[0].len().saturating_sub(delay).min(expected);
    let mut interleaved = Vec::with_capacity(available * channels);
    for frame in delay..delay + available {
        for plane in &out {
            interleaved.push(plane[frame]);
        }
    }

    Ok(DecodedBuffer::new(interleaved, target_rate, channels))
}

/// Convert any AudioBufferRef to interleaved f32 samples
fn audio_buf_to_f32(buf: &AudioBufferRef) -> Vec<f32> {
    match buf {
        AudioBufferRef::F32(b) => interleave(b.planes(), b.frames(), |s: f32| s),
        AudioBufferRef::F64(b) => interleave(b.planes(), b.frames(), |s: f64| s as f32),
        AudioBufferRef::S8(b) => interleave(b.planes(), b.frames(), |s: i8| s as f32 / 128.0),
        AudioBufferRef::S16(b) => {
            interleave(b.planes(), b.frames(), |s: i16| s as f32 / 32768.0)
        }
        AudioBufferRef::S24(b) => {
            interleave(b.planes(), b.frames(), |s| s.inner() as f32 / 8388608.0)
        }
        AudioBufferRef::S32(b) => {
            interleave(b.planes(), b.frames(), |s: i32| s as f32 / 2147483648.0)
        }
        AudioBufferRef::U8(b) => {
            interleave(b.planes(), b.frames(), |s: u8| (s as f32 - 128.0) / 128.0)
        }
        AudioBufferRef::U16(b) => {
            interleave(b.planes(), b.frames(), |s: u16| (s as f32 - 32768.0) / 32768.0)
        }
        AudioBufferRef::U24(b) => interleave(b.planes(), b.frames(), |s| {
            (s.inner() as f32 - 8388608.0) / 8388608.0
        }),
        AudioBufferRef::U32(b) => interleave(b.planes(), b.frames(), |s: u32| {
            (s as f64 - 2147483648.0) as f32 / 2147483648.0
        }),
    }
}

fn interleave<T: Sample + Copy, F: Fn(T) -> f32>(
    planes: AudioPlanes<T>,
    frames: usize,
    convert: F,
) -> Vec<f32> {
    let planes = planes.planes();
    if planes.is_empty() || frames == 0 {
        return vec![];
    }

    let mut interleaved = Vec::with_capacity(frames * planes.len());
    for frame in 0..frames {
        for plane in planes {
            interleaved.push(convert(plane[frame]));
        }
    }
    interleaved
}
