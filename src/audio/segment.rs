//! Utterance segmentation over 20 ms VAD frames.
//!
//! Pure state machine: the capture loop feeds it one frame plus the VAD
//! verdict at a time and acts on the events it emits. Keeping the logic
//! free of I/O makes the trigger/close hysteresis directly testable.

/// Samples per VAD frame (20 ms at 16 kHz).
pub const VAD_FRAME_SAMPLES: usize = 320;
/// Hard cap on one utterance: 8 seconds at 16 kHz.
pub const MAX_UTTERANCE_SAMPLES: usize = 16000 * 8;
/// Shortest utterance worth sending to recognition (0.3 s).
pub const MIN_DISPATCH_SAMPLES: usize = 4800;
/// Sliding pre-roll retained before the speech trigger (~0.5 s).
const PREROLL_MAX_SAMPLES: usize = 8000;
/// Consecutive speech frames before music is ducked.
const DUCK_SPEECH_FRAMES: u32 = 2;

/// What the capture loop should do after a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Speech onset confirmed — pull music down before the user finishes
    /// the first word.
    Duck,
    /// A complete utterance, pre-roll included, ready for recognition.
    Dispatch(Vec<i16>),
    /// The segment closed below the dispatch threshold; restore music.
    TooShort,
}

pub struct Segmenter {
    speech_trigger_frames: u32,
    silence_close_frames: u32,
    speech_count: u32,
    silence_count: u32,
    triggered: bool,
    ducked: bool,
    buf: Vec<i16>,
}

impl Segmenter {
    pub fn new(speech_trigger_frames: u32, silence_close_frames: u32) -> Self {
        Self {
            speech_trigger_frames,
            silence_close_frames,
            speech_count: 0,
            silence_count: 0,
            triggered: false,
            ducked: false,
            buf: Vec::new(),
        }
    }

    /// Feed one 320-sample frame and its VAD verdict.
    pub fn push(&mut self, frame: &[i16], is_speech: bool) -> Vec<SegmentEvent> {
        let mut events = Vec::new();

        if is_speech {
            self.speech_count += 1;
            self.silence_count = 0;
        } else {
            self.silence_count += 1;
            self.speech_count = 0;
        }

        if self.speech_count > DUCK_SPEECH_FRAMES && !self.ducked {
            self.ducked = true;
            events.push(SegmentEvent::Duck);
        }

        if self.speech_count > self.speech_trigger_frames && !self.triggered {
            self.triggered = true;
        }

        if self.triggered {
            self.buf.extend_from_slice(frame);
            if self.silence_count > self.silence_close_frames
                || self.buf.len() >= MAX_UTTERANCE_SAMPLES
            {
                if self.buf.len() >= MIN_DISPATCH_SAMPLES {
                    events.push(SegmentEvent::Dispatch(std::mem::take(&mut self.buf)));
                } else {
                    self.buf.clear();
                    events.push(SegmentEvent::TooShort);
                }
                self.triggered = false;
                self.ducked = false;
                self.silence_count = 0;
            }
        } else {
            // Sliding pre-roll: the utterance keeps the audio that ran up
            // to the trigger, which anchors the recognizer's onset.
            if self.buf.len() > PREROLL_MAX_SAMPLES {
                self.buf.drain(..VAD_FRAME_SAMPLES);
            }
            self.buf.extend_from_slice(frame);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fill: i16) -> Vec<i16> {
        vec![fill; VAD_FRAME_SAMPLES]
    }

    fn feed(seg: &mut Segmenter, speech: bool, n: usize) -> Vec<SegmentEvent> {
        let mut all = Vec::new();
        for _ in 0..n {
            all.extend(seg.push(&frame(100), speech));
        }
        all
    }

    #[test]
    fn test_duck_after_three_speech_frames() {
        let mut seg = Segmenter::new(10, 10);
        assert!(feed(&mut seg, true, 2).is_empty());
        let events = seg.push(&frame(100), true);
        assert_eq!(events, vec![SegmentEvent::Duck]);
        // No second duck while the segment is open.
        assert!(feed(&mut seg, true, 5).is_empty());
    }

    #[test]
    fn test_utterance_dispatch_after_trailing_silence() {
        let mut seg = Segmenter::new(10, 10);
        // 30 speech frames open the utterance and accumulate audio.
        let events = feed(&mut seg, true, 30);
        assert_eq!(events, vec![SegmentEvent::Duck]);

        // 10 silence frames keep it open; the 11th closes it.
        let mut events = feed(&mut seg, false, 10);
        assert!(events.is_empty());
        events.extend(seg.push(&frame(0), false));
        let Some(SegmentEvent::Dispatch(pcm)) = events.pop() else {
            panic!("expected a dispatch event");
        };
        assert!(pcm.len() >= MIN_DISPATCH_SAMPLES);
        assert!(pcm.len() <= MAX_UTTERANCE_SAMPLES);
    }

    #[test]
    fn test_short_segment_is_discarded() {
        // A permissive trigger opens the segment on the 3rd speech frame,
        // so only a handful of frames accumulate before silence closes it.
        let mut seg = Segmenter::new(2, 2);
        feed(&mut seg, true, 3);
        seg.buf.clear(); // discard pre-roll so the segment stays tiny
        let mut events = feed(&mut seg, false, 2);
        events.extend(seg.push(&frame(0), false));
        assert_eq!(events, vec![SegmentEvent::TooShort]);
    }

    #[test]
    fn test_cap_closes_long_utterance() {
        let mut seg = Segmenter::new(10, 10);
        let mut dispatched = None;
        // Continuous speech: the 8 s cap must close the segment.
        for _ in 0..600 {
            for ev in seg.push(&frame(1), true) {
                if let SegmentEvent::Dispatch(pcm) = ev {
                    dispatched = Some(pcm);
                }
            }
            if dispatched.is_some() {
                break;
            }
        }
        let pcm = dispatched.expect("cap never closed the utterance");
        assert!(pcm.len() >= MAX_UTTERANCE_SAMPLES);
        assert!(pcm.len() < MAX_UTTERANCE_SAMPLES + VAD_FRAME_SAMPLES);
    }

    #[test]
    fn test_preroll_included_and_bounded() {
        let mut seg = Segmenter::new(10, 10);
        // Long silence builds pre-roll but never beyond the window.
        feed(&mut seg, false, 100);
        assert!(seg.buf.len() <= PREROLL_MAX_SAMPLES + VAD_FRAME_SAMPLES);
        let preroll = seg.buf.len();

        // Trigger, then close; the dispatched utterance carries pre-roll.
        feed(&mut seg, true, 20);
        let mut events = feed(&mut seg, false, 11);
        let Some(SegmentEvent::Dispatch(pcm)) = events.pop() else {
            panic!("expected a dispatch event");
        };
        assert!(pcm.len() > preroll);
    }

    #[test]
    fn test_buffer_empty_after_close() {
        let mut seg = Segmenter::new(10, 10);
        feed(&mut seg, true, 30);
        feed(&mut seg, false, 11);
        assert!(seg.buf.is_empty());
        assert!(!seg.triggered);
        assert!(!seg.ducked);
    }
}
