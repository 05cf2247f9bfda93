//! Energy-based voice activity detection.
//!
//! A two-state machine over RMS frame energy. Onset counting debounces
//! the start of speech (one noisy frame never triggers), hangover frames
//! tolerate short intra-speech pauses before silence starts counting
//! toward the end of the utterance.

/// Tunable VAD parameters. All are adjustable per session via
/// `session.update`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS floor for a frame to count as voice.
    pub energy_threshold: f32,
    /// Minimum accumulated speech before `SpeechStart` fires.
    pub min_speech_ms: u32,
    /// Silence required (after hangover) before `SpeechEnd` fires.
    pub min_silence_ms: u32,
    /// Consecutive voice frames required to confirm an onset.
    pub onset_frames: u32,
    /// Tolerated silence frames after voice before silence counts.
    pub hangover_frames: u32,
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            min_speech_ms: 250,
            min_silence_ms: 800,
            onset_frames: 2,
            hangover_frames: 6,
            sample_rate: 16_000,
        }
    }
}

/// Boundary events produced by [`EnergyVad::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    None,
    SpeechStart,
    SpeechEnd,
}

/// The detector.
#[derive(Debug, Default)]
pub struct EnergyVad {
    config: VadConfig,
    speech_active: bool,
    onset_counter: u32,
    hangover_counter: u32,
    speech_frames: u32,
    silence_frames: u32,
    speech_start_ms: i64,
    speech_end_ms: i64,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> VadConfig {
        self.config
    }

    /// Replace the configuration without resetting detection state.
    pub fn set_config(&mut self, config: VadConfig) {
        self.config = config;
    }

    pub fn is_speech_active(&self) -> bool {
        self.speech_active
    }

    /// Wall-clock ms when the current/last utterance started.
    pub fn speech_start_ms(&self) -> i64 {
        self.speech_start_ms
    }

    /// Wall-clock ms when the last utterance ended.
    pub fn speech_end_ms(&self) -> i64 {
        self.speech_end_ms
    }

    /// Feed one frame of float samples; returns the boundary event it
    /// produced, if any.
    pub fn process(&mut self, frame: &[f32]) -> VadEvent {
        if frame.is_empty() {
            return VadEvent::None;
        }

        let rms = rms_energy(frame);
        let is_voice = rms > self.config.energy_threshold;
        let frame_ms = frame.len() as f32 * 1000.0 / self.config.sample_rate as f32;

        if !self.speech_active {
            if is_voice {
                self.onset_counter += 1;
                self.speech_frames += 1;

                let speech_ms = self.speech_frames as f32 * frame_ms;
                if self.onset_counter >= self.config.onset_frames
                    && speech_ms >= self.config.min_speech_ms as f32
                {
                    self.speech_active = true;
                    self.hangover_counter = self.config.hangover_frames;
                    self.speech_start_ms = now_ms() - speech_ms as i64;
                    return VadEvent::SpeechStart;
                }
            } else {
                // Silence resets a partial onset.
                self.onset_counter = 0;
                self.speech_frames = 0;
                self.silence_frames = 0;
            }
            return VadEvent::None;
        }

        if is_voice {
            self.hangover_counter = self.config.hangover_frames;
            self.silence_frames = 0;
            self.speech_frames += 1;
            return VadEvent::None;
        }

        if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            return VadEvent::None;
        }

        self.silence_frames += 1;
        let silence_ms = self.silence_frames as f32 * frame_ms;
        if silence_ms >= self.config.min_silence_ms as f32 {
            self.speech_active = false;
            self.speech_end_ms = now_ms();
            self.onset_counter = 0;
            self.speech_frames = 0;
            self.silence_frames = 0;
            return VadEvent::SpeechEnd;
        }
        VadEvent::None
    }

    /// Drop all detection state; configuration is kept.
    pub fn reset(&mut self) {
        let config = self.config;
        *self = Self::new(config);
    }
}

fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 100 ms frame at 16 kHz.
    const FRAME: usize = 1600;

    fn voice_frame() -> Vec<f32> {
        vec![0.1; FRAME]
    }

    fn silence_frame() -> Vec<f32> {
        vec![0.0005; FRAME]
    }

    fn default_vad() -> EnergyVad {
        EnergyVad::new(VadConfig::default())
    }

    fn feed(vad: &mut EnergyVad, frames: &[Vec<f32>]) -> Vec<VadEvent> {
        frames.iter().map(|f| vad.process(f)).collect()
    }

    #[test]
    fn rms_of_constant_signal() {
        let rms = rms_energy(&[0.5; 100]);
        assert!((rms - 0.5).abs() < 1e-6);
        assert!((rms_energy(&[]) - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn speech_start_requires_onset_and_duration() {
        let mut vad = default_vad();
        // First voice frame: onset=1 < 2, no event.
        assert_eq!(vad.process(&voice_frame()), VadEvent::None);
        // Second voice frame: onset=2, 200 ms < 250 ms min speech.
        assert_eq!(vad.process(&voice_frame()), VadEvent::None);
        // Third: 300 ms ≥ 250 ms.
        assert_eq!(vad.process(&voice_frame()), VadEvent::SpeechStart);
        assert!(vad.is_speech_active());
    }

    #[test]
    fn isolated_voice_frame_never_starts_speech() {
        let mut vad = default_vad();
        let events = feed(
            &mut vad,
            &[
                silence_frame(),
                voice_frame(),
                silence_frame(),
                silence_frame(),
            ],
        );
        assert!(events.iter().all(|e| *e == VadEvent::None));
        assert!(!vad.is_speech_active());
    }

    #[test]
    fn hangover_tolerates_short_pauses() {
        let mut vad = default_vad();
        feed(&mut vad, &[voice_frame(), voice_frame(), voice_frame()]);
        assert!(vad.is_speech_active());

        // A few silence frames eat the hangover; voice resets it.
        assert_eq!(vad.process(&silence_frame()), VadEvent::None);
        assert_eq!(vad.process(&silence_frame()), VadEvent::None);
        assert_eq!(vad.process(&voice_frame()), VadEvent::None);
        assert!(vad.is_speech_active());
    }

    #[test]
    fn speech_end_after_hangover_plus_silence() {
        let mut vad = default_vad();
        feed(&mut vad, &[voice_frame(), voice_frame(), voice_frame()]);
        assert!(vad.is_speech_active());

        // 6 hangover frames, then 8 × 100 ms of silence ≥ 800 ms.
        let mut events = Vec::new();
        for _ in 0..14 {
            events.push(vad.process(&silence_frame()));
        }
        assert_eq!(events.last(), Some(&VadEvent::SpeechEnd));
        assert!(!vad.is_speech_active());
        // Exactly one end event.
        assert_eq!(
            events.iter().filter(|e| **e == VadEvent::SpeechEnd).count(),
            1
        );
    }

    #[test]
    fn reset_clears_state_keeps_config() {
        let config = VadConfig {
            energy_threshold: 0.2,
            ..VadConfig::default()
        };
        let mut vad = EnergyVad::new(config);
        feed(
            &mut vad,
            &[vec![0.5; FRAME], vec![0.5; FRAME], vec![0.5; FRAME]],
        );
        assert!(vad.is_speech_active());
        vad.reset();
        assert!(!vad.is_speech_active());
        assert_eq!(vad.config(), config);
    }

    #[test]
    fn empty_frame_is_inert() {
        let mut vad = default_vad();
        assert_eq!(vad.process(&[]), VadEvent::None);
    }
}
