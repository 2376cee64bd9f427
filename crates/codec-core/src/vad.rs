//! Energy-based voice activity detection over decoded telephony frames
//!
//! Used when the relay, rather than the engine, decides when the caller is
//! speaking. A frame counts as voiced when its RMS level exceeds the
//! threshold; speech starts after `onset_frames` voiced frames in a row and
//! stops after `hangover_frames` unvoiced frames in a row.

/// Edge reported by [`EnergyVad::process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SpeechStopped,
}

/// Tuning for [`EnergyVad`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyVadConfig {
    /// RMS level (linear 16-bit units) above which a frame is voiced
    pub threshold: f32,
    pub onset_frames: u32,
    pub hangover_frames: u32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            threshold: 500.0,
            onset_frames: 2,
            hangover_frames: 25,
        }
    }
}

#[derive(Debug)]
pub struct EnergyVad {
    config: EnergyVadConfig,
    speaking: bool,
    voiced_run: u32,
    silent_run: u32,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self {
            config: EnergyVadConfig {
                onset_frames: config.onset_frames.max(1),
                hangover_frames: config.hangover_frames.max(1),
                ..config
            },
            speaking: false,
            voiced_run: 0,
            silent_run: 0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one frame of linear samples; returns an edge if one occurred
    pub fn process(&mut self, samples: &[i16]) -> Option<VadTransition> {
        let voiced = rms(samples) > self.config.threshold;

        if voiced {
            self.silent_run = 0;
            self.voiced_run = self.voiced_run.saturating_add(1);
            if !self.speaking && self.voiced_run >= self.config.onset_frames {
                self.speaking = true;
                return Some(VadTransition::SpeechStarted);
            }
        } else {
            self.voiced_run = 0;
            self.silent_run = self.silent_run.saturating_add(1);
            if self.speaking && self.silent_run >= self.config.hangover_frames {
                self.speaking = false;
                return Some(VadTransition::SpeechStopped);
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.voiced_run = 0;
        self.silent_run = 0;
    }
}

/// Root-mean-square level of a frame
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud() -> Vec<i16> {
        (0..160).map(|i| if i % 2 == 0 { 4000 } else { -4000 }).collect()
    }

    fn quiet() -> Vec<i16> {
        vec![0; 160]
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&quiet()), 0.0);
        assert!((rms(&loud()) - 4000.0).abs() < 0.5);
    }

    #[test]
    fn test_onset_and_hangover() {
        let mut vad = EnergyVad::new(EnergyVadConfig {
            threshold: 500.0,
            onset_frames: 2,
            hangover_frames: 3,
        });

        assert_eq!(vad.process(&loud()), None);
        assert_eq!(vad.process(&loud()), Some(VadTransition::SpeechStarted));
        assert_eq!(vad.process(&loud()), None);
        assert!(vad.is_speaking());

        assert_eq!(vad.process(&quiet()), None);
        assert_eq!(vad.process(&quiet()), None);
        assert_eq!(vad.process(&quiet()), Some(VadTransition::SpeechStopped));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_single_click_is_ignored() {
        let mut vad = EnergyVad::new(EnergyVadConfig::default());
        assert_eq!(vad.process(&loud()), None);
        assert_eq!(vad.process(&quiet()), None);
        assert_eq!(vad.process(&loud()), None);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_zero_counts_are_clamped() {
        let mut vad = EnergyVad::new(EnergyVadConfig {
            threshold: 100.0,
            onset_frames: 0,
            hangover_frames: 0,
        });
        assert_eq!(vad.process(&loud()), Some(VadTransition::SpeechStarted));
        assert_eq!(vad.process(&quiet()), Some(VadTransition::SpeechStopped));
    }
}
