//! Per-session audio accumulation buffer.
//!
//! Stores PCM16 little-endian mono 16 kHz samples appended from base64
//! WebSocket messages, and renders RIFF/WAVE blobs for the transcription
//! backend. Very short clips are zero-padded to a floor before encoding:
//! whisper hallucinates on sub-half-second inputs.

use crate::error::{GatewayError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::io::Cursor;
use std::sync::Mutex;

/// Fixed input format: mono 16 kHz PCM16.
pub const SAMPLE_RATE: u32 = 16_000;

/// Minimum WAV duration for interim transcriptions.
pub const INTERIM_PAD_MS: u32 = 500;

/// Minimum WAV duration for final/committed transcriptions.
pub const FINAL_PAD_MS: u32 = 1250;

/// Thread-safe PCM16 accumulation buffer.
#[derive(Default)]
pub struct AudioBuffer {
    samples: Mutex<Vec<i16>>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a base64 PCM16-LE chunk and append it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AudioFileInvalid`] when the payload is not
    /// valid base64.
    pub fn append_base64(&self, audio: &str) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let raw = BASE64
            .decode(audio)
            .map_err(|e| GatewayError::AudioFileInvalid(format!("bad base64 audio: {e}")))?;

        let mut samples = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks_exact(2) {
            samples.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        self.append_raw(&samples);
        Ok(())
    }

    /// Append raw samples.
    pub fn append_raw(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        self.lock().extend_from_slice(samples);
    }

    pub fn sample_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Buffered duration in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        (self.lock().len() as u64 * 1000 / u64::from(SAMPLE_RATE)) as u32
    }

    /// The last `ms` milliseconds of audio as float samples in [-1, 1].
    pub fn recent_samples(&self, ms: u32) -> Vec<f32> {
        let samples = self.lock();
        let want = (u64::from(ms) * u64::from(SAMPLE_RATE) / 1000) as usize;
        let start = samples.len().saturating_sub(want);
        samples[start..]
            .iter()
            .map(|s| f32::from(*s) / 32768.0)
            .collect()
    }

    /// Render the whole buffer as a WAV blob.
    pub fn wav(&self) -> Vec<u8> {
        encode_wav(&self.lock())
    }

    /// Render the buffer as WAV, zero-padded at the end to at least
    /// `min_duration_ms`.
    pub fn wav_padded(&self, min_duration_ms: u32) -> Vec<u8> {
        let samples = self.lock();
        let min_samples =
            (u64::from(min_duration_ms) * u64::from(SAMPLE_RATE) / 1000) as usize;
        if samples.len() >= min_samples {
            return encode_wav(&samples);
        }
        let mut padded = samples.clone();
        padded.resize(min_samples, 0);
        encode_wav(&padded)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<i16>> {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn encode_wav(samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = match hound::WavWriter::new(&mut cursor, spec) {
            Ok(writer) => writer,
            Err(_) => return Vec::new(),
        };
        for sample in samples {
            if writer.write_sample(*sample).is_err() {
                return Vec::new();
            }
        }
        if writer.finalize().is_err() {
            return Vec::new();
        }
    }
    cursor.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64_of(samples: &[i16]) -> String {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        BASE64.encode(bytes)
    }

    #[test]
    fn append_decodes_little_endian_pcm16() {
        let buffer = AudioBuffer::new();
        buffer
            .append_base64(&b64_of(&[0, 1000, -1000, i16::MAX]))
            .expect("valid base64");
        assert_eq!(buffer.sample_count(), 4);

        let recent = buffer.recent_samples(1000);
        assert_eq!(recent.len(), 4);
        assert!((recent[3] - (f32::from(i16::MAX) / 32768.0)).abs() < 1e-6);
    }

    #[test]
    fn append_rejects_bad_base64() {
        let buffer = AudioBuffer::new();
        let err = buffer.append_base64("not!!valid@@").expect_err("bad base64");
        assert_eq!(err.kind(), "audio_file_invalid");
    }

    #[test]
    fn duration_tracks_sample_rate() {
        let buffer = AudioBuffer::new();
        buffer.append_raw(&vec![0i16; SAMPLE_RATE as usize]);
        assert_eq!(buffer.duration_ms(), 1000);
        buffer.append_raw(&vec![0i16; (SAMPLE_RATE / 2) as usize]);
        assert_eq!(buffer.duration_ms(), 1500);
    }

    #[test]
    fn recent_samples_returns_tail() {
        let buffer = AudioBuffer::new();
        // 1 s of zeros, then 160 samples (10 ms) of ones.
        buffer.append_raw(&vec![0i16; SAMPLE_RATE as usize]);
        buffer.append_raw(&vec![1i16; 160]);
        let recent = buffer.recent_samples(10);
        assert_eq!(recent.len(), 160);
        assert!(recent.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn wav_has_riff_header_and_data() {
        let buffer = AudioBuffer::new();
        buffer.append_raw(&[1, 2, 3, 4]);
        let wav = buffer.wav();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte canonical header + 8 bytes of samples.
        assert_eq!(wav.len(), 44 + 8);
    }

    #[test]
    fn wav_padded_reaches_floor() {
        let buffer = AudioBuffer::new();
        buffer.append_raw(&vec![5i16; 160]); // 10 ms
        let wav = buffer.wav_padded(INTERIM_PAD_MS);
        let expected_samples = (INTERIM_PAD_MS as usize) * (SAMPLE_RATE as usize) / 1000;
        assert_eq!(wav.len(), 44 + expected_samples * 2);
    }

    #[test]
    fn wav_padded_does_not_truncate_long_buffers() {
        let buffer = AudioBuffer::new();
        let n = 2 * SAMPLE_RATE as usize; // 2 s
        buffer.append_raw(&vec![5i16; n]);
        let wav = buffer.wav_padded(FINAL_PAD_MS);
        assert_eq!(wav.len(), 44 + n * 2);
    }

    #[test]
    fn padding_does_not_mutate_buffer() {
        let buffer = AudioBuffer::new();
        buffer.append_raw(&vec![5i16; 160]);
        let _ = buffer.wav_padded(FINAL_PAD_MS);
        assert_eq!(buffer.sample_count(), 160);
    }

    #[test]
    fn clear_empties_buffer() {
        let buffer = AudioBuffer::new();
        buffer.append_raw(&[1, 2, 3]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.duration_ms(), 0);
    }
}
