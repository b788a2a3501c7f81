//! Per-frame control loop: acquire → detect → EAR → debounce → intervene → render.
//!
//! The loop is single-threaded. A drowsiness event runs the whole dialogue
//! session inline, so no frames are captured or rendered until it returns.

use crate::debouncer::{DebounceEvent, Debouncer, DrowsinessConfig};
use crate::geometry::{eye_aspect_ratio, EyeLandmarks};
use crate::session::{DialogueBackend, SessionDriver, SessionSummary, SpeechRecognizer, SpeechSynthesizer};
use crate::types::{Frame, LandmarkSet, StateView};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("frame source exhausted")]
    Exhausted,
    #[error("frame capture failed: {0}")]
    Capture(String),
}

/// Produces frames one at a time.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, AcquisitionError>;
}

/// Finds faces in a frame. Each returned set uses the same landmark indexing.
pub trait LandmarkDetector {
    type Error: std::error::Error;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>, Self::Error>;

    /// Drop any per-face tracking state. Called after each intervention
    /// session, since the face may have moved while capture was paused.
    fn reset(&mut self) {}
}

/// Displays a frame with optional landmark overlay and the drowsiness event count.
pub trait Renderer {
    type Error: std::error::Error;

    fn render(
        &mut self,
        frame: &Frame,
        landmarks: Option<&LandmarkSet>,
        blink_count: u64,
    ) -> Result<(), Self::Error>;
}

/// Polled once per frame after rendering.
pub trait QuitSignal {
    fn quit_requested(&mut self) -> bool;
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("frame acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Capturing,
    InSession,
}

/// Why `run` returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    QuitRequested,
}

/// What happened to a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    /// Landmarks of the face that was evaluated, if any.
    pub landmarks: Option<LandmarkSet>,
    pub ear: Option<f32>,
    pub event: DebounceEvent,
    /// Present when this frame triggered an intervention session.
    pub session: Option<SessionSummary>,
}

impl FrameOutcome {
    fn skipped(landmarks: Option<LandmarkSet>) -> Self {
        Self {
            landmarks,
            ear: None,
            event: DebounceEvent::NoEvent,
            session: None,
        }
    }
}

pub struct FrameLoop<D, R, S, B> {
    detector: D,
    eyes: EyeLandmarks,
    debouncer: Debouncer,
    session: SessionDriver<R, S, B>,
    blink_count: u64,
    state: Rc<Cell<LoopState>>,
}

impl<D, R, S, B> FrameLoop<D, R, S, B>
where
    D: LandmarkDetector,
    R: SpeechRecognizer,
    S: SpeechSynthesizer,
    B: DialogueBackend,
{
    pub fn new(
        detector: D,
        eyes: EyeLandmarks,
        drowsiness: DrowsinessConfig,
        session: SessionDriver<R, S, B>,
    ) -> Self {
        Self {
            detector,
            eyes,
            debouncer: Debouncer::new(drowsiness),
            session,
            blink_count: 0,
            state: Rc::new(Cell::new(LoopState::Capturing)),
        }
    }

    /// Number of drowsiness events since start. Never decreases.
    pub fn blink_count(&self) -> u64 {
        self.blink_count
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn state_view(&self) -> StateView<LoopState> {
        StateView::new(&self.state)
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    pub fn session(&self) -> &SessionDriver<R, S, B> {
        &self.session
    }

    /// Run detection, debouncing and (when triggered) one session for a frame.
    ///
    /// Only the first face the detector reports is evaluated. Frames without a
    /// usable face leave the closure timer untouched.
    pub fn process_frame(&mut self, frame: &Frame) -> FrameOutcome {
        let faces = match self.detector.detect(frame) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(error = %err, sequence = frame.sequence, "landmark detection failed");
                return FrameOutcome::skipped(None);
            }
        };

        if faces.len() > 1 {
            tracing::trace!(faces = faces.len(), "multiple faces; evaluating the first");
        }
        let Some(face) = faces.into_iter().next() else {
            return FrameOutcome::skipped(None);
        };

        let ear = match eye_aspect_ratio(&face, &self.eyes) {
            Ok(ear) => ear,
            Err(err) => {
                tracing::debug!(error = %err, sequence = frame.sequence, "EAR unavailable for frame");
                return FrameOutcome::skipped(Some(face));
            }
        };

        let event = self.debouncer.evaluate(ear, frame.timestamp);
        tracing::trace!(
            ear,
            sequence = frame.sequence,
            closed_ms = ?self
                .debouncer
                .closure_elapsed(frame.timestamp)
                .map(|d| d.as_millis()),
            "frame evaluated"
        );

        let session = match event {
            DebounceEvent::DrowsyDetected => Some(self.intervene()),
            DebounceEvent::NoEvent => None,
        };

        FrameOutcome {
            landmarks: Some(face),
            ear: Some(ear),
            event,
            session,
        }
    }

    fn intervene(&mut self) -> SessionSummary {
        // Counted at event time so a failed or abandoned session still counts.
        self.blink_count += 1;
        tracing::info!(blink_count = self.blink_count, "drowsiness detected; starting intervention");

        self.state.set(LoopState::InSession);
        let started = Instant::now();
        let summary = self.session.run();
        self.state.set(LoopState::Capturing);
        self.detector.reset();

        tracing::info!(
            blink_count = self.blink_count,
            paused_ms = started.elapsed().as_millis() as u64,
            "resuming capture"
        );
        summary
    }

    /// Run until quit is requested or the frame source fails.
    pub fn run<F, V>(&mut self, source: &mut F, display: &mut V) -> Result<Shutdown, ControllerError>
    where
        F: FrameSource,
        V: Renderer + QuitSignal,
    {
        tracing::info!("frame loop started");

        loop {
            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::error!(error = %err, blink_count = self.blink_count, "frame loop stopping");
                    return Err(err.into());
                }
            };

            let outcome = self.process_frame(&frame);

            if let Err(err) = display.render(&frame, outcome.landmarks.as_ref(), self.blink_count) {
                tracing::warn!(error = %err, "render failed");
            }

            if display.quit_requested() {
                tracing::info!(blink_count = self.blink_count, "quit requested");
                return Ok(Shutdown::QuitRequested);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{RecordingSynthesizer, ScriptedBackend, ScriptedRecognizer};
    use crate::session::{Recognition, SessionConfig, SessionState};
    use crate::types::Point;
    use std::cell::{OnceCell, RefCell};
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Debug, Error)]
    #[error("detector offline")]
    struct DetectorOffline;

    /// What the fake detector reports for one frame.
    #[derive(Clone, Copy)]
    enum Seen {
        Eyes(f32),
        NoFace,
        Broken,
        Degenerate,
        /// First face at the given EAR, a second with wide-open eyes.
        TwoFaces(f32),
        /// Every coordinate NaN.
        Corrupt,
    }

    /// Looks up `Seen` by frame sequence number.
    struct FakeDetector {
        script: Vec<Seen>,
        resets: usize,
    }

    impl LandmarkDetector for FakeDetector {
        type Error = DetectorOffline;

        fn detect(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>, DetectorOffline> {
            match self.script[frame.sequence as usize] {
                Seen::Eyes(ear) => Ok(vec![face_with_ear(ear)]),
                Seen::NoFace => Ok(Vec::new()),
                Seen::Broken => Err(DetectorOffline),
                Seen::TwoFaces(ear) => Ok(vec![face_with_ear(ear), face_with_ear(0.4)]),
                Seen::Corrupt => Ok(vec![LandmarkSet::new(vec![
                    Point::new(f32::NAN, f32::NAN);
                    EyeLandmarks::default().max_index() + 1
                ])]),
                // Every point at the origin: both eyes have zero width.
                Seen::Degenerate => Ok(vec![LandmarkSet::new(vec![
                    Point::default();
                    EyeLandmarks::default().max_index() + 1
                ])]),
            }
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    /// A face whose eyes both have the given EAR (eye width 10).
    fn face_with_ear(ear: f32) -> LandmarkSet {
        let eyes = EyeLandmarks::default();
        let mut points = vec![Point::default(); eyes.max_index() + 1];
        let open = ear * 10.0;
        for (indices, x) in [(eyes.left, 0.0), (eyes.right, 20.0)] {
            let eye = [
                Point::new(x, 0.0),
                Point::new(x + 3.0, -open / 2.0),
                Point::new(x + 7.0, -open / 2.0),
                Point::new(x + 10.0, 0.0),
                Point::new(x + 7.0, open / 2.0),
                Point::new(x + 3.0, open / 2.0),
            ];
            for (i, &idx) in indices.iter().enumerate() {
                points[idx] = eye[i];
            }
        }
        LandmarkSet::new(points)
    }

    /// Frames spaced `step_ms` apart, sequence numbers from 0.
    struct FakeCamera {
        base: Instant,
        step_ms: u64,
        next: u32,
        total: u32,
    }

    impl FakeCamera {
        fn new(total: u32, step_ms: u64) -> Self {
            Self {
                base: Instant::now(),
                step_ms,
                next: 0,
                total,
            }
        }

        fn frame(&self, sequence: u32) -> Frame {
            Frame {
                data: vec![0; 4],
                width: 2,
                height: 2,
                timestamp: self.base + Duration::from_millis(sequence as u64 * self.step_ms),
                sequence,
            }
        }
    }

    impl FrameSource for FakeCamera {
        fn next_frame(&mut self) -> Result<Frame, AcquisitionError> {
            if self.next >= self.total {
                return Err(AcquisitionError::Exhausted);
            }
            let frame = self.frame(self.next);
            self.next += 1;
            Ok(frame)
        }
    }

    #[derive(Debug, Error)]
    #[error("window closed")]
    struct WindowClosed;

    #[derive(Default)]
    struct FakeDisplay {
        /// (landmarks present, blink count) per rendered frame.
        rendered: Vec<(bool, u64)>,
        quit_after: Option<usize>,
        fail: bool,
    }

    impl Renderer for FakeDisplay {
        type Error = WindowClosed;

        fn render(
            &mut self,
            _frame: &Frame,
            landmarks: Option<&LandmarkSet>,
            blink_count: u64,
        ) -> Result<(), WindowClosed> {
            self.rendered.push((landmarks.is_some(), blink_count));
            if self.fail {
                Err(WindowClosed)
            } else {
                Ok(())
            }
        }
    }

    impl QuitSignal for FakeDisplay {
        fn quit_requested(&mut self) -> bool {
            self.quit_after
                .is_some_and(|limit| self.rendered.len() >= limit)
        }
    }

    type TestLoop = FrameLoop<FakeDetector, ScriptedRecognizer, RecordingSynthesizer, ScriptedBackend>;

    fn frame_loop(script: Vec<Seen>, recognitions: Vec<Recognition>) -> TestLoop {
        let session = SessionDriver::new(
            SessionConfig::default(),
            ScriptedRecognizer::new(recognitions),
            RecordingSynthesizer::default(),
            ScriptedBackend::default(),
        );
        FrameLoop::new(
            FakeDetector { script, resets: 0 },
            EyeLandmarks::default(),
            DrowsinessConfig::default(),
            session,
        )
    }

    fn exit() -> Vec<Recognition> {
        vec![Recognition::Recognized("종료".into())]
    }

    #[test]
    fn test_counter_increments_at_three_seconds() {
        // One frame per second, eyes shut throughout.
        let mut fl = frame_loop(vec![Seen::Eyes(0.1); 5], exit());
        let camera = FakeCamera::new(5, 1000);

        for seq in 0..3 {
            let outcome = fl.process_frame(&camera.frame(seq));
            assert_eq!(outcome.event, DebounceEvent::NoEvent);
            assert_eq!(fl.blink_count(), 0);
        }

        let outcome = fl.process_frame(&camera.frame(3));
        assert_eq!(outcome.event, DebounceEvent::DrowsyDetected);
        assert_eq!(fl.blink_count(), 1);
        let summary = outcome.session.unwrap();
        assert_eq!(summary.listens, 1);
        assert_eq!(fl.state(), LoopState::Capturing);
        assert!(!fl.debouncer().is_timing());
    }

    #[test]
    fn test_only_first_face_is_evaluated() {
        let mut fl = frame_loop(vec![Seen::TwoFaces(0.1); 4], exit());
        let camera = FakeCamera::new(4, 1000);
        let mut events = 0;
        for seq in 0..4 {
            let outcome = fl.process_frame(&camera.frame(seq));
            assert!(outcome.ear.is_some_and(|ear| (ear - 0.1).abs() < 1e-4));
            if outcome.event == DebounceEvent::DrowsyDetected {
                events += 1;
            }
        }
        assert_eq!(events, 1);
        assert_eq!(fl.blink_count(), 1);
    }

    #[test]
    fn test_in_session_while_listening() {
        let views: Rc<OnceCell<(StateView<LoopState>, StateView<SessionState>)>> =
            Rc::new(OnceCell::new());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let mut recognizer = ScriptedRecognizer::new(vec![
            Recognition::Recognized("졸려".into()),
            Recognition::Recognized("종료".into()),
        ]);
        recognizer.on_listen = Some(Box::new({
            let (views, seen) = (Rc::clone(&views), Rc::clone(&seen));
            move || {
                if let Some((lp, session)) = views.get() {
                    seen.borrow_mut().push((lp.get(), session.get()));
                }
            }
        }));
        let session = SessionDriver::new(
            SessionConfig::default(),
            recognizer,
            RecordingSynthesizer::default(),
            ScriptedBackend::default(),
        );
        let session_view = session.state_view();
        let mut fl = FrameLoop::new(
            FakeDetector {
                script: vec![Seen::Eyes(0.1); 4],
                resets: 0,
            },
            EyeLandmarks::default(),
            DrowsinessConfig::default(),
            session,
        );
        assert!(views.set((fl.state_view(), session_view)).is_ok());

        let camera = FakeCamera::new(4, 1000);
        for seq in 0..4 {
            fl.process_frame(&camera.frame(seq));
        }

        assert_eq!(
            *seen.borrow(),
            vec![(LoopState::InSession, SessionState::Active); 2]
        );
        assert_eq!(fl.state(), LoopState::Capturing);
        assert_eq!(fl.session().state(), SessionState::Idle);
        assert_eq!(fl.detector.resets, 1);
    }

    #[test]
    fn test_corrupt_landmarks_never_fire() {
        let mut fl = frame_loop(vec![Seen::Corrupt; 200], Vec::new());
        let camera = FakeCamera::new(200, 33);
        for seq in 0..200 {
            let outcome = fl.process_frame(&camera.frame(seq));
            assert_eq!(outcome.ear, None);
            assert_eq!(outcome.event, DebounceEvent::NoEvent);
        }
        assert!(!fl.debouncer().is_timing());
        assert_eq!(fl.blink_count(), 0);
    }

    #[test]
    fn test_open_eyes_no_event() {
        let mut fl = frame_loop(vec![Seen::Eyes(0.3); 200], Vec::new());
        let camera = FakeCamera::new(200, 33);
        for seq in 0..200 {
            let outcome = fl.process_frame(&camera.frame(seq));
            assert!((outcome.ear.unwrap() - 0.3).abs() < 1e-5);
        }
        assert_eq!(fl.blink_count(), 0);
        assert_eq!(fl.session().recognizer().calls, 0);
    }

    #[test]
    fn test_dropped_frames_keep_timer() {
        // Closed, then face lost / detector error / degenerate geometry,
        // then closed again 3 s after the first closed frame.
        let script = vec![
            Seen::Eyes(0.1),
            Seen::NoFace,
            Seen::Broken,
            Seen::Degenerate,
            Seen::Eyes(0.1),
        ];
        let mut fl = frame_loop(script, exit());
        let camera = FakeCamera::new(5, 750);

        for seq in 0..4 {
            let outcome = fl.process_frame(&camera.frame(seq));
            assert_eq!(outcome.event, DebounceEvent::NoEvent);
            assert!(fl.debouncer().is_timing());
        }
        assert!(fl.process_frame(&camera.frame(1)).landmarks.is_none());
        assert!(fl.process_frame(&camera.frame(3)).landmarks.is_some());
        assert!(fl.process_frame(&camera.frame(3)).ear.is_none());

        let outcome = fl.process_frame(&camera.frame(4));
        assert_eq!(outcome.event, DebounceEvent::DrowsyDetected);
        assert_eq!(fl.blink_count(), 1);
    }

    #[test]
    fn test_run_until_quit() {
        let mut fl = frame_loop(vec![Seen::Eyes(0.1); 10], exit());
        let mut camera = FakeCamera::new(10, 1000);
        let mut display = FakeDisplay {
            quit_after: Some(6),
            ..Default::default()
        };

        let result = fl.run(&mut camera, &mut display);
        assert!(matches!(result, Ok(Shutdown::QuitRequested)));
        assert_eq!(display.rendered.len(), 6);
        // Event on frame 3: the render of that frame already shows it.
        let counts: Vec<u64> = display.rendered.iter().map(|&(_, c)| c).collect();
        assert_eq!(counts, vec![0, 0, 0, 1, 1, 1]);
        assert!(display.rendered.iter().all(|&(face, _)| face));
        assert_eq!(camera.next, 6);
    }

    #[test]
    fn test_acquisition_failure_is_fatal() {
        let mut fl = frame_loop(vec![Seen::NoFace; 3], Vec::new());
        let mut camera = FakeCamera::new(3, 33);
        let mut display = FakeDisplay::default();

        let result = fl.run(&mut camera, &mut display);
        assert!(matches!(
            result,
            Err(ControllerError::Acquisition(AcquisitionError::Exhausted))
        ));
        assert_eq!(display.rendered, vec![(false, 0); 3]);
    }

    #[test]
    fn test_render_failure_not_fatal() {
        let mut fl = frame_loop(vec![Seen::Eyes(0.3); 4], Vec::new());
        let mut camera = FakeCamera::new(4, 33);
        let mut display = FakeDisplay {
            quit_after: Some(4),
            fail: true,
            ..Default::default()
        };
        assert!(matches!(
            fl.run(&mut camera, &mut display),
            Ok(Shutdown::QuitRequested)
        ));
    }

    #[test]
    fn test_second_event_needs_fresh_closure() {
        // 30 fps, eyes shut for 6.5 s: two events, one session each.
        let frames = 197;
        let mut recognitions = exit();
        recognitions.extend(exit());
        let mut fl = frame_loop(vec![Seen::Eyes(0.05); frames], recognitions);
        let camera = FakeCamera::new(frames as u32, 33);

        let mut events = VecDeque::new();
        for seq in 0..frames as u32 {
            if fl.process_frame(&camera.frame(seq)).event == DebounceEvent::DrowsyDetected {
                events.push_back(seq);
            }
        }
        // First closed frame 0 → fires at 3003 ms (frame 91); the timer restarts
        // on frame 92 and fires again at frame 183.
        assert_eq!(events, VecDeque::from([91, 183]));
        assert_eq!(fl.blink_count(), 2);
        assert_eq!(fl.session().recognizer().calls, 2);
    }
}
