//! Energy-based voice activity detection with a pre-roll ring buffer, §4.B.
//!
//! Unlike the hybrid adaptive-noise-floor detector this is descended from,
//! this VAD is deliberately simple: a fixed mean-square threshold and a
//! five-state machine. The threshold is tuned for translator-produced audio
//! where SNR is high, not for general-purpose noise rejection.

use super::resampler::upsample_16k_to_24k;

/// Current phase of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Idle,
    Onset,
    Speech,
    Tail,
    End,
}

/// What the caller should do with a processed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    /// Below threshold and not currently sending; frame was only buffered.
    Dropped,
    /// Threshold just crossed: the pre-roll buffer (oldest first) followed by
    /// the current frame should be sent as `voice`.
    Onset { pre_roll: Vec<Vec<i16>>, frame: Vec<i16> },
    /// Still sending; send `frame` as `voice`.
    Sending { frame: Vec<i16> },
    /// Silence tail just crossed `silence_tail_frames`: send `voice_end` and
    /// stop sending.
    End,
}

/// Combined resampler + VAD pipeline. Owns the pre-roll ring buffer and the
/// sending state machine; one instance per session.
pub struct VoicePipeline {
    rms_threshold: f64,
    silence_tail_frames: usize,
    pre_roll: Vec<Vec<i16>>,
    pre_roll_capacity: usize,
    pre_roll_pos: usize,
    pre_roll_len: usize,
    sending: bool,
    silence_frames: usize,
    last_audio_time: Option<std::time::Instant>,
}

impl VoicePipeline {
    pub fn new(rms_threshold: f64, pre_roll_frames: usize, silence_tail_frames: usize) -> Self {
        Self {
            rms_threshold,
            silence_tail_frames,
            pre_roll: vec![Vec::new(); pre_roll_frames.max(1)],
            pre_roll_capacity: pre_roll_frames.max(1),
            pre_roll_pos: 0,
            pre_roll_len: 0,
            sending: false,
            silence_frames: 0,
            last_audio_time: None,
        }
    }

    /// Timestamp of the last frame that was actually transmitted
    /// (onset/speech/tail), read by the idle-timeout trigger.
    pub fn last_audio_time(&self) -> Option<std::time::Instant> {
        self.last_audio_time
    }

    /// Feed one 16 kHz PCM16 input frame through the resampler and the
    /// state machine.
    pub fn process(&mut self, frame_16k: &[i16]) -> FrameAction {
        let s = mean_square(frame_16k);
        let frame_24k = upsample_16k_to_24k(frame_16k);
        let now = std::time::Instant::now();

        let voiced = s > self.rms_threshold;

        if !self.sending {
            if voiced {
                let pre_roll = self.drain_pre_roll();
                self.sending = true;
                self.silence_frames = 0;
                self.last_audio_time = Some(now);
                FrameAction::Onset {
                    pre_roll,
                    frame: frame_24k,
                }
            } else {
                self.push_pre_roll(frame_24k);
                FrameAction::Dropped
            }
        } else if voiced {
            self.silence_frames = 0;
            self.last_audio_time = Some(now);
            FrameAction::Sending { frame: frame_24k }
        } else {
            self.silence_frames += 1;
            if self.silence_frames >= self.silence_tail_frames {
                self.sending = false;
                self.silence_frames = 0;
                FrameAction::End
            } else {
                self.last_audio_time = Some(now);
                FrameAction::Sending { frame: frame_24k }
            }
        }
    }

    pub fn state(&self) -> VadState {
        if !self.sending {
            VadState::Idle
        } else if self.silence_frames == 0 {
            VadState::Speech
        } else {
            VadState::Tail
        }
    }

    fn push_pre_roll(&mut self, frame: Vec<i16>) {
        self.pre_roll[self.pre_roll_pos] = frame;
        self.pre_roll_pos = (self.pre_roll_pos + 1) % self.pre_roll_capacity;
        self.pre_roll_len = (self.pre_roll_len + 1).min(self.pre_roll_capacity);
    }

    /// Drain the ring buffer in insertion order (oldest first), leaving it
    /// empty for the next utterance.
    fn drain_pre_roll(&mut self) -> Vec<Vec<i16>> {
        let mut ordered = Vec::with_capacity(self.pre_roll_len);
        let start = (self.pre_roll_pos + self.pre_roll_capacity - self.pre_roll_len)
            % self.pre_roll_capacity;
        for i in 0..self.pre_roll_len {
            let idx = (start + i) % self.pre_roll_capacity;
            ordered.push(std::mem::take(&mut self.pre_roll[idx]));
        }
        self.pre_roll_len = 0;
        self.pre_roll_pos = 0;
        ordered
    }
}

/// Mean-square energy of a 16-bit PCM frame, in the same units as the
/// squared sample values (§4.B).
fn mean_square(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    sum_sq / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_frame() -> Vec<i16> {
        vec![0i16; 160]
    }

    fn loud_frame() -> Vec<i16> {
        vec![400i16; 160] // mean-square = 160000, well above default threshold 100
    }

    #[test]
    fn all_zero_frames_never_trigger_onset() {
        let mut pipeline = VoicePipeline::new(100.0, 10, 50);
        for _ in 0..20 {
            assert_eq!(pipeline.process(&silent_frame()), FrameAction::Dropped);
        }
    }

    #[test]
    fn onset_flushes_pre_roll_in_insertion_order() {
        let mut pipeline = VoicePipeline::new(100.0, 3, 50);
        let f1 = vec![1i16; 160];
        let f2 = vec![2i16; 160];
        let f3 = vec![3i16; 160];
        pipeline.process(&f1);
        pipeline.process(&f2);
        pipeline.process(&f3);

        match pipeline.process(&loud_frame()) {
            FrameAction::Onset { pre_roll, .. } => {
                assert_eq!(pre_roll.len(), 3);
                assert_eq!(pre_roll[0][0], 1);
                assert_eq!(pre_roll[1][0], 2);
                assert_eq!(pre_roll[2][0], 3);
            }
            other => panic!("expected onset, got {other:?}"),
        }
    }

    #[test]
    fn pre_roll_ring_wraps_and_keeps_only_the_most_recent_frames() {
        let mut pipeline = VoicePipeline::new(100.0, 2, 50);
        for v in [1i16, 2, 3] {
            pipeline.process(&vec![v; 160]);
        }
        match pipeline.process(&loud_frame()) {
            FrameAction::Onset { pre_roll, .. } => {
                assert_eq!(pre_roll.len(), 2);
                assert_eq!(pre_roll[0][0], 2);
                assert_eq!(pre_roll[1][0], 3);
            }
            other => panic!("expected onset, got {other:?}"),
        }
    }

    #[test]
    fn silence_tail_emits_voice_end_after_threshold_frames_not_before() {
        let mut pipeline = VoicePipeline::new(100.0, 10, 3);
        pipeline.process(&loud_frame()); // onset
        for _ in 0..2 {
            assert!(matches!(
                pipeline.process(&silent_frame()),
                FrameAction::Sending { .. }
            ));
        }
        assert_eq!(pipeline.process(&silent_frame()), FrameAction::End);
    }

    #[test]
    fn voiced_frame_during_tail_resets_the_silence_counter() {
        let mut pipeline = VoicePipeline::new(100.0, 10, 3);
        pipeline.process(&loud_frame());
        pipeline.process(&silent_frame());
        pipeline.process(&silent_frame());
        assert!(matches!(
            pipeline.process(&loud_frame()),
            FrameAction::Sending { .. }
        ));
        // counter reset, so two more silent frames should not yet end it
        assert!(matches!(
            pipeline.process(&silent_frame()),
            FrameAction::Sending { .. }
        ));
        assert!(matches!(
            pipeline.process(&silent_frame()),
            FrameAction::Sending { .. }
        ));
    }

    #[test]
    fn last_audio_time_updates_only_on_transmitted_frames() {
        let mut pipeline = VoicePipeline::new(100.0, 10, 50);
        assert!(pipeline.last_audio_time().is_none());
        pipeline.process(&silent_frame());
        assert!(pipeline.last_audio_time().is_none());
        pipeline.process(&loud_frame());
        assert!(pipeline.last_audio_time().is_some());
    }

    #[test]
    fn full_utterance_sequence_matches_the_onset_preroll_tail_end_pattern() {
        // 9 frames of silence, then 1 voiced frame: expect 10 total `voice`
        // sends (9 buffered + the triggering frame) once onset fires, then
        // continued sending until the silence tail elapses.
        let mut pipeline = VoicePipeline::new(100.0, 9, 2);
        for _ in 0..9 {
            assert_eq!(pipeline.process(&silent_frame()), FrameAction::Dropped);
        }
        match pipeline.process(&loud_frame()) {
            FrameAction::Onset { pre_roll, .. } => assert_eq!(pre_roll.len(), 9),
            other => panic!("expected onset, got {other:?}"),
        }
        pipeline.process(&silent_frame());
        assert_eq!(pipeline.process(&silent_frame()), FrameAction::End);
    }
}
