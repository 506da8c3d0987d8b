/*!
 # Channel calibration

 Not every bulb shows the color whose bytes it was sent. The probe sends a
 list of candidate frames, collects what was actually seen for each one, and
 solves for the [`ChannelMapping`] that explains all observations.

 Candidate lists are plain data: alternative mode bytes or opcodes are just
 more entries, since firmware differs between models.
*/

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use crate::color::Rgb;
use crate::command::{Command, MODE_MANUAL_RGB, OPCODE_COLOR};
use crate::config::CalibrationConfig;
use crate::mapping::ChannelMapping;
use crate::packet::{self, DecodedFrame, Frame};
use crate::session::{DeviceSession, Step};
use crate::transport::Transport;
use crate::{Error, Result};

/// States of a calibration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Probing,
    AwaitingObservation,
    Computing,
    Done,
}

/// One entry of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Human readable description
    pub label: String,
    pub opcode: u8,
    pub payload: Vec<u8>,
    /// Wire color this candidate encodes, if it is usable for solving
    pub sent: Option<Rgb>,
}

impl Candidate {
    /// A candidate that is only logged, never used for solving
    pub fn new(label: impl Into<String>, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            opcode,
            payload,
            sent: None,
        }
    }

    /// A `[mode, r, g, b]` color candidate
    pub fn color(label: impl Into<String>, opcode: u8, mode: u8, rgb: Rgb) -> Self {
        Self {
            label: label.into(),
            opcode,
            payload: vec![mode, rgb.r, rgb.g, rgb.b],
            sent: Some(rgb),
        }
    }

    /// Marks the wire color a hand-built payload encodes
    pub fn with_sent(mut self, rgb: Rgb) -> Self {
        self.sent = Some(rgb);
        self
    }

    /// Pure red, green and blue in manual RGB mode
    pub fn primaries() -> Vec<Candidate> {
        [("red", Rgb::RED), ("green", Rgb::GREEN), ("blue", Rgb::BLUE)]
            .into_iter()
            .map(|(name, rgb)| Candidate::color(name, OPCODE_COLOR, MODE_MANUAL_RGB, rgb))
            .collect()
    }

    /// Alternative color encodings seen on related models, all carrying `rgb`
    pub fn format_variants(rgb: Rgb) -> Vec<Candidate> {
        let Rgb { r, g, b } = rgb;
        vec![
            Candidate::color("mode 0x02", 0x05, 0x02, rgb),
            Candidate::color("mode 0x01", 0x05, 0x01, rgb),
            Candidate::color("mode 0x04", 0x05, 0x04, rgb),
            Candidate::new("mode 0x15", 0x05, vec![0x15, 0x01, r, g, b]).with_sent(rgb),
            Candidate::color("opcode 0x0b", 0x0B, 0x02, rgb),
            Candidate::new("mode 0x02 padded", 0x05, vec![0x02, 0x00, r, g, b]).with_sent(rgb),
            Candidate::new("mode 0x0d", 0x05, vec![0x0D, 0x02, r, g, b]).with_sent(rgb),
        ]
    }

    pub fn frame(&self) -> Result<Frame> {
        packet::encode(self.opcode, &self.payload)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (opcode {:#04x})", self.label, self.opcode)
    }
}

/// What was seen after sending one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub candidate: Candidate,
    pub frame: Frame,
    /// Raw feedback, `None` if the observation window passed in silence
    pub report: Option<String>,
    /// Feedback interpreted as a color
    pub observed: Option<Rgb>,
    pub timestamp: DateTime<Local>,
}

/// Source of feedback about what the bulb is showing
#[async_trait]
pub trait ObservationSource: Send {
    /// Waits for feedback on `candidate`, or `None` if none will come.
    ///
    /// The probe cancels this future when the observation window closes.
    async fn observe(&mut self, candidate: &Candidate) -> Option<String>;

    /// Discards feedback already queued, returning how much was dropped.
    ///
    /// Called right after each candidate is sent, so an answer that missed
    /// the previous window is never taken for the next candidate.
    fn drain(&mut self) -> usize {
        0
    }
}

/// Observations typed by an operator and pushed through a channel
pub struct OperatorFeed {
    reports: mpsc::Receiver<String>,
}

impl OperatorFeed {
    /// Returns the sender reports are pushed into, and the feed
    pub fn channel(buffer: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, reports) = mpsc::channel(buffer);
        (tx, Self { reports })
    }
}

#[async_trait]
impl ObservationSource for OperatorFeed {
    async fn observe(&mut self, _candidate: &Candidate) -> Option<String> {
        self.reports.recv().await
    }

    fn drain(&mut self) -> usize {
        let mut stale = 0;
        while let Ok(report) = self.reports.try_recv() {
            debug!("Discarding late report '{}'", report);
            stale += 1;
        }
        stale
    }
}

/// Observations taken from device notifications
pub struct NotificationFeed {
    frames: mpsc::UnboundedReceiver<DecodedFrame>,
}

impl NotificationFeed {
    /// Returns the sender a notification handler should forward frames to, and the feed
    pub fn channel() -> (mpsc::UnboundedSender<DecodedFrame>, Self) {
        let (tx, frames) = mpsc::unbounded_channel();
        (tx, Self { frames })
    }

    fn describe(frame: &DecodedFrame) -> String {
        if frame.opcode == OPCODE_COLOR && frame.payload[0] == MODE_MANUAL_RGB {
            let [r, g, b] = [frame.payload[1], frame.payload[2], frame.payload[3]];
            return format!("{r},{g},{b}");
        }
        let hex: String = frame.payload.iter().map(|b| format!("{b:02x}")).collect();
        format!("opcode {:#04x} payload {}", frame.opcode, hex)
    }
}

#[async_trait]
impl ObservationSource for NotificationFeed {
    async fn observe(&mut self, _candidate: &Candidate) -> Option<String> {
        loop {
            let frame = self.frames.recv().await?;
            if frame.checksum_valid {
                return Some(Self::describe(&frame));
            }
            debug!("Ignoring notification with bad checksum");
        }
    }

    fn drain(&mut self) -> usize {
        let mut stale = 0;
        while let Ok(frame) = self.frames.try_recv() {
            trace!("Discarding queued notification opcode={:#04x}", frame.opcode);
            stale += 1;
        }
        stale
    }
}

/// Takes the first answer from either of two sources
pub struct FirstOf<A, B> {
    first: A,
    second: B,
}

impl<A: ObservationSource, B: ObservationSource> FirstOf<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl<A: ObservationSource, B: ObservationSource> ObservationSource for FirstOf<A, B> {
    async fn observe(&mut self, candidate: &Candidate) -> Option<String> {
        // A source that has closed stops competing
        tokio::select! {
            Some(report) = self.first.observe(candidate) => Some(report),
            Some(report) = self.second.observe(candidate) => Some(report),
            else => None,
        }
    }

    fn drain(&mut self) -> usize {
        self.first.drain() + self.second.drain()
    }
}

/// Outcome of a conclusive calibration run
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    /// How the device scrambles channels: wire color `c` shows as `mapping.forward(c)`
    pub mapping: ChannelMapping,
    pub observations: Vec<Observation>,
}

impl CalibrationReport {
    /// Mapping to pass with color commands so the bulb shows the requested color
    pub fn correction(&self) -> ChannelMapping {
        self.mapping.inverse()
    }

    /// Wire color to send so that `desired` is what the bulb shows
    pub fn resolve(&self, desired: Rgb) -> Rgb {
        self.correction().forward(desired)
    }
}

/// Finds the unique mapping explaining every color observation.
///
/// Channels are compared on/off at the midpoint so that approximate operator
/// reports still match.
pub fn solve(observations: &[Observation]) -> Result<ChannelMapping> {
    let pairs: Vec<(Rgb, Rgb)> = observations
        .iter()
        .filter_map(|o| Some((o.candidate.sent?, o.observed?)))
        .collect();

    if pairs.is_empty() {
        return Err(Error::CalibrationInconclusive(
            "no color observations were recorded".into(),
        ));
    }

    let fits: Vec<ChannelMapping> = ChannelMapping::all()
        .filter(|m| {
            pairs
                .iter()
                .all(|(sent, seen)| m.forward(*sent).quantized() == seen.quantized())
        })
        .collect();

    match fits.as_slice() {
        [mapping] => Ok(*mapping),
        [] => Err(Error::CalibrationInconclusive(format!(
            "no channel mapping fits {} observation(s)",
            pairs.len()
        ))),
        many => Err(Error::CalibrationInconclusive(format!(
            "{} channel mappings fit {} observation(s); probe more colors",
            many.len(),
            pairs.len()
        ))),
    }
}

/// Drives a sweep of candidates through a session and solves for the mapping
pub struct CalibrationProbe<S: ObservationSource> {
    source: S,
    config: CalibrationConfig,
    state: ProbeState,
    observations: Vec<Observation>,
}

impl<S: ObservationSource> CalibrationProbe<S> {
    pub fn new(source: S, config: CalibrationConfig) -> Self {
        Self {
            source,
            config,
            state: ProbeState::Idle,
            observations: Vec::new(),
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Everything observed so far, also available after an inconclusive run
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    fn transition(&mut self, next: ProbeState) {
        debug!("Calibration {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs the sweep. A probe runs once; build a new one to calibrate again.
    #[instrument(skip(self, session, candidates), fields(candidates = candidates.len()))]
    pub async fn run<T: Transport>(
        &mut self,
        session: &mut DeviceSession<T>,
        candidates: &[Candidate],
    ) -> Result<CalibrationReport> {
        if self.state != ProbeState::Idle {
            return Err(Error::NotSupported(format!(
                "calibration already in state {:?}",
                self.state
            )));
        }

        let result = self.sweep(session, candidates).await;
        let result = match result {
            Ok(()) => {
                self.transition(ProbeState::Computing);
                solve(&self.observations)
            }
            Err(e) => Err(e),
        };
        self.transition(ProbeState::Done);

        let mapping = result.inspect_err(|e| warn!("Calibration ended without a mapping: {}", e))?;
        info!("Calibrated channel mapping: {}", mapping);
        Ok(CalibrationReport {
            mapping,
            observations: self.observations.clone(),
        })
    }

    async fn sweep<T: Transport>(
        &mut self,
        session: &mut DeviceSession<T>,
        candidates: &[Candidate],
    ) -> Result<()> {
        self.transition(ProbeState::Probing);
        let preamble = [
            Step::once(Command::PowerOn),
            Step::once(Command::Brightness(self.config.preamble_brightness)),
        ];
        session
            .apply(&preamble, ChannelMapping::identity())
            .await?;

        let window: Duration = self.config.observation_window;
        for candidate in candidates {
            self.transition(ProbeState::Probing);
            let frame = candidate.frame()?;
            info!("Probing {}: {}", candidate, frame);
            session
                .send_raw(candidate.opcode, &candidate.payload)
                .await?;
            let stale = self.source.drain();
            if stale > 0 {
                debug!("Dropped {} answer(s) that arrived before {}", stale, candidate);
            }

            self.transition(ProbeState::AwaitingObservation);
            let report = match time::timeout(window, self.source.observe(candidate)).await {
                Ok(report) => report,
                Err(_) => {
                    warn!("No observation for {} within {:?}", candidate, window);
                    None
                }
            };
            let observed = report.as_deref().and_then(|r| r.parse::<Rgb>().ok());
            if let (Some(report), None) = (&report, observed) {
                debug!("Report '{}' is not a color, logging only", report);
            }

            self.observations.push(Observation {
                candidate: candidate.clone(),
                frame,
                report,
                observed,
                timestamp: Local::now(),
            });
        }
        Ok(())
    }
}
