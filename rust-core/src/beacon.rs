//! Capture-harness sync beacons.
//!
//! The harness announces replay boundaries with small datagrams of the form
//! `SYNC_BEACON|<phase>[|<replay_id>]`. Once stamped on the sample clock they
//! form a [`BeaconTimeline`], which slices a finished trajectory into
//! per-replay windows without touching it.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::sink::Trajectory;
use crate::types::PoseEstimate;

/// Payload prefix shared by all beacons.
pub const BEACON_PREFIX: &str = "SYNC_BEACON";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BeaconError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload does not start with SYNC_BEACON")]
    MissingPrefix,

    #[error("unknown beacon phase '{0}'")]
    UnknownPhase(String),

    #[error("{0} beacon requires a replay id")]
    MissingReplayId(BeaconPhase),

    #[error("unexpected trailing field '{0}'")]
    TrailingField(String),

    #[error("beacon at {current_us}us precedes {previous_us}us")]
    NonMonotonic { previous_us: u64, current_us: u64 },

    #[error("replay '{found}' started while '{open}' is still open")]
    OverlappingReplay { open: String, found: String },

    #[error("{phase} for replay '{replay_id}' without a matching start")]
    UnmatchedReplay {
        phase: BeaconPhase,
        replay_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeaconPhase {
    GlobalStart,
    ReplayPre,
    ReplayStart,
    ReplayMid,
    ReplayEnd,
}

impl BeaconPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BeaconPhase::GlobalStart => "global_start",
            BeaconPhase::ReplayPre => "replay_pre",
            BeaconPhase::ReplayStart => "replay_start",
            BeaconPhase::ReplayMid => "replay_mid",
            BeaconPhase::ReplayEnd => "replay_end",
        }
    }

    /// Replay phases name the replay they belong to.
    pub fn needs_replay_id(self) -> bool {
        !matches!(self, BeaconPhase::GlobalStart)
    }
}

impl fmt::Display for BeaconPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BeaconPhase {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global_start" => Ok(BeaconPhase::GlobalStart),
            "replay_pre" => Ok(BeaconPhase::ReplayPre),
            "replay_start" => Ok(BeaconPhase::ReplayStart),
            "replay_mid" => Ok(BeaconPhase::ReplayMid),
            "replay_end" => Ok(BeaconPhase::ReplayEnd),
            other => Err(BeaconError::UnknownPhase(other.to_string())),
        }
    }
}

/// One decoded beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBeacon {
    pub phase: BeaconPhase,
    pub replay_id: Option<String>,
}

impl SyncBeacon {
    pub fn parse(payload: &str) -> Result<Self, BeaconError> {
        let mut fields = payload.trim_end_matches(['\r', '\n']).split('|');

        if fields.next() != Some(BEACON_PREFIX) {
            return Err(BeaconError::MissingPrefix);
        }
        let phase: BeaconPhase = fields.next().unwrap_or_default().parse()?;
        let replay_id = fields
            .next()
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if let Some(extra) = fields.next() {
            return Err(BeaconError::TrailingField(extra.to_string()));
        }
        if replay_id.is_none() && phase.needs_replay_id() {
            return Err(BeaconError::MissingReplayId(phase));
        }

        Ok(Self { phase, replay_id })
    }

    /// Decode a raw datagram.
    pub fn parse_bytes(payload: &[u8]) -> Result<Self, BeaconError> {
        let text = std::str::from_utf8(payload).map_err(|_| BeaconError::InvalidUtf8)?;
        Self::parse(text)
    }
}

impl fmt::Display for SyncBeacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", BEACON_PREFIX, self.phase)?;
        if let Some(id) = &self.replay_id {
            write!(f, "|{}", id)?;
        }
        Ok(())
    }
}

/// Span of the sample clock covered by one replay, `[start_us, end_us)`.
///
/// The harness replays each recording several times under the same id;
/// `occurrence` counts those runs from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayWindow {
    pub replay_id: String,
    pub occurrence: usize,
    pub start_us: u64,
    pub end_us: u64,
    pub mid_us: Option<u64>,
}

impl ReplayWindow {
    pub fn contains(&self, timestamp_us: u64) -> bool {
        timestamp_us >= self.start_us && timestamp_us < self.end_us
    }

    pub fn duration_us(&self) -> u64 {
        self.end_us.saturating_sub(self.start_us)
    }
}

#[derive(Debug, Clone)]
struct OpenReplay {
    replay_id: String,
    start_us: u64,
    mid_us: Option<u64>,
}

/// Replay windows assembled from timestamped beacons.
#[derive(Debug, Clone, Default)]
pub struct BeaconTimeline {
    global_start_us: Option<u64>,
    windows: Vec<ReplayWindow>,
    open: Option<OpenReplay>,
    last_us: Option<u64>,
}

impl BeaconTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a timeline from `(timestamp_us, beacon)` pairs in arrival order.
    pub fn from_beacons<I>(beacons: I) -> Result<Self, BeaconError>
    where
        I: IntoIterator<Item = (u64, SyncBeacon)>,
    {
        let mut timeline = Self::new();
        for (timestamp_us, beacon) in beacons {
            timeline.record(timestamp_us, &beacon)?;
        }
        Ok(timeline)
    }

    pub fn record(&mut self, timestamp_us: u64, beacon: &SyncBeacon) -> Result<(), BeaconError> {
        if let Some(previous) = self.last_us {
            if timestamp_us < previous {
                return Err(BeaconError::NonMonotonic {
                    previous_us: previous,
                    current_us: timestamp_us,
                });
            }
        }
        self.last_us = Some(timestamp_us);

        let replay_id = beacon.replay_id.clone().unwrap_or_default();
        debug!(phase = %beacon.phase, replay = %replay_id, timestamp_us, "sync beacon");

        match beacon.phase {
            BeaconPhase::GlobalStart => {
                self.global_start_us.get_or_insert(timestamp_us);
            }
            BeaconPhase::ReplayPre => {}
            BeaconPhase::ReplayStart => {
                if let Some(open) = &self.open {
                    return Err(BeaconError::OverlappingReplay {
                        open: open.replay_id.clone(),
                        found: replay_id,
                    });
                }
                self.open = Some(OpenReplay {
                    replay_id,
                    start_us: timestamp_us,
                    mid_us: None,
                });
            }
            BeaconPhase::ReplayMid => match self.open.as_mut() {
                Some(open) if open.replay_id == replay_id => {
                    open.mid_us = Some(timestamp_us);
                }
                _ => {
                    return Err(BeaconError::UnmatchedReplay {
                        phase: beacon.phase,
                        replay_id,
                    })
                }
            },
            BeaconPhase::ReplayEnd => match self.open.take() {
                Some(open) if open.replay_id == replay_id => {
                    let occurrence = self.windows_for(&open.replay_id).count();
                    self.windows.push(ReplayWindow {
                        replay_id: open.replay_id,
                        occurrence,
                        start_us: open.start_us,
                        end_us: timestamp_us,
                        mid_us: open.mid_us,
                    });
                }
                other => {
                    self.open = other;
                    return Err(BeaconError::UnmatchedReplay {
                        phase: beacon.phase,
                        replay_id,
                    });
                }
            },
        }
        Ok(())
    }

    pub fn global_start_us(&self) -> Option<u64> {
        self.global_start_us
    }

    /// Completed replay windows in start order.
    pub fn windows(&self) -> &[ReplayWindow] {
        &self.windows
    }

    /// Id of a replay that has started but not ended.
    pub fn open_replay(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.replay_id.as_str())
    }

    /// Every run of one replay id, in start order.
    pub fn windows_for<'a>(&'a self, replay_id: &'a str) -> impl Iterator<Item = &'a ReplayWindow> + 'a {
        self.windows.iter().filter(move |w| w.replay_id == replay_id)
    }

    /// The `occurrence`-th run of a replay id, counting from zero.
    pub fn window(&self, replay_id: &str, occurrence: usize) -> Option<&ReplayWindow> {
        self.windows
            .iter()
            .filter(|w| w.replay_id == replay_id)
            .nth(occurrence)
    }

    pub fn window_at(&self, timestamp_us: u64) -> Option<&ReplayWindow> {
        self.windows.iter().find(|w| w.contains(timestamp_us))
    }

    /// Estimates of `trajectory` inside one run of the named replay.
    pub fn slice<'t>(
        &self,
        trajectory: &'t Trajectory,
        replay_id: &str,
        occurrence: usize,
    ) -> Option<&'t [PoseEstimate]> {
        self.window(replay_id, occurrence)
            .map(|w| trajectory.between(w.start_us, w.end_us))
    }

    /// Estimates of `trajectory` inside every run of the named replay, one
    /// slice per run. Empty when the id never completed.
    pub fn slices_for<'t>(&self, trajectory: &'t Trajectory, replay_id: &str) -> Vec<&'t [PoseEstimate]> {
        self.windows_for(replay_id)
            .map(|w| trajectory.between(w.start_us, w.end_us))
            .collect()
    }

    /// Every completed replay paired with its slice of `trajectory`.
    pub fn slices<'a, 't>(
        &'a self,
        trajectory: &'t Trajectory,
    ) -> Vec<(&'a ReplayWindow, &'t [PoseEstimate])> {
        self.windows
            .iter()
            .map(|w| (w, trajectory.between(w.start_us, w.end_us)))
            .collect()
    }
}
