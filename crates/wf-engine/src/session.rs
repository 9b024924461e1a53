//! Session persistence
//!
//! Saves and restores the control-side document: tracks with their mixer
//! state and automation lanes, the connection list, transport preferences,
//! and the metronome. Everything is plain serde_json; the audio context is
//! never involved (loading replays the document through the normal facade
//! operations, which ship state over the command ring as usual).

use std::path::Path;

use serde::{Deserialize, Serialize};

use wf_core::{EngineError, EngineResult, NodeId, ParamId, TrackConfig, TrackId};

use crate::automation::AutomationPoint;
use crate::click::ClickSettings;
use crate::engine::AudioEngine;

/// Current session schema version
pub const SESSION_VERSION: u32 = 1;

/// One automation lane of one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLane {
    pub param: ParamId,
    /// Points in timeline order
    pub points: Vec<AutomationPoint>,
}

/// Mixer state of one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTrack {
    pub name: String,
    pub gain: f64,
    pub pan: f64,
    pub muted: bool,
    pub soloed: bool,
    pub lanes: Vec<SessionLane>,
}

/// A channel edge stored by track position; `None` is the master bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionConnection {
    pub src_track: Option<usize>,
    pub src_channel: usize,
    pub dst_track: Option<usize>,
    pub dst_channel: usize,
}

/// Complete control-side session document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    /// Schema version
    pub version: u32,
    pub tempo_bpm: f64,
    pub master_gain: f64,
    pub loop_enabled: bool,
    pub loop_start_seconds: f64,
    pub loop_end_seconds: f64,
    pub click: ClickSettings,
    pub tracks: Vec<SessionTrack>,
    pub connections: Vec<SessionConnection>,
}

impl SessionDocument {
    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl AudioEngine {
    /// Snapshot the current control-side state as a document.
    pub fn session_document(&self) -> SessionDocument {
        let tracks = self
            .tracks()
            .map(|track| {
                let mut lanes: Vec<SessionLane> = self
                    .automation()
                    .iter()
                    .filter(|((owner, _), _)| *owner == track.id)
                    .map(|((_, param), stored)| SessionLane {
                        param: *param,
                        points: stored.points.clone(),
                    })
                    .collect();
                // Store iteration order is arbitrary; fix it for stable files
                lanes.sort_by_key(|lane| lane.param.0);
                SessionTrack {
                    name: track.name.clone(),
                    gain: track.gain,
                    pan: track.pan,
                    muted: track.muted,
                    soloed: track.soloed,
                    lanes,
                }
            })
            .collect();

        let mut connections = Vec::new();
        for conn in self.connections() {
            let (Some(src_track), Some(dst_track)) =
                (self.track_position(conn.src), self.track_position(conn.dst))
            else {
                log::warn!("skipping connection with unknown endpoint: {:?}", conn);
                continue;
            };
            connections.push(SessionConnection {
                src_track,
                src_channel: conn.src_channel,
                dst_track,
                dst_channel: conn.dst_channel,
            });
        }

        let (loop_enabled, loop_start_seconds, loop_end_seconds) =
            match self.loop_range_seconds() {
                Some((start, end)) => (true, start, end),
                None => (false, 0.0, 0.0),
            };

        SessionDocument {
            version: SESSION_VERSION,
            tempo_bpm: self.tempo_bpm(),
            master_gain: self.master_gain(),
            loop_enabled,
            loop_start_seconds,
            loop_end_seconds,
            click: *self.click_settings(),
            tracks,
            connections,
        }
    }

    /// Write the session document to `path` as pretty JSON.
    pub fn save_session(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = self
            .session_document()
            .to_json()
            .map_err(|e| EngineError::Session(e.to_string()))?;
        std::fs::write(path, json)?;
        log::info!("session saved to {}", path.display());
        Ok(())
    }

    /// Load a session document from `path` into a fresh engine.
    pub fn load_session(&mut self, path: &Path) -> EngineResult<()> {
        let json = std::fs::read_to_string(path)?;
        let document =
            SessionDocument::from_json(&json).map_err(|e| EngineError::Session(e.to_string()))?;
        self.apply_session(&document)?;
        log::info!(
            "session loaded from {} ({} tracks)",
            path.display(),
            document.tracks.len()
        );
        Ok(())
    }

    /// Replay a document through the normal facade operations. The engine
    /// must not have any tracks yet.
    pub fn apply_session(&mut self, document: &SessionDocument) -> EngineResult<()> {
        if document.version > SESSION_VERSION {
            return Err(EngineError::Session(format!(
                "session version {} is newer than supported ({})",
                document.version, SESSION_VERSION
            )));
        }
        if self.track_count() != 0 {
            return Err(EngineError::Session(
                "session load requires a fresh engine".to_string(),
            ));
        }
        for track in &document.tracks {
            for lane in &track.lanes {
                let bad = lane
                    .points
                    .iter()
                    .any(|p| !p.time.is_finite() || !p.value.is_finite() || !p.shape.is_finite());
                if bad {
                    return Err(EngineError::Session(format!(
                        "non-finite automation point in '{}'",
                        track.name
                    )));
                }
            }
        }

        self.set_tempo(document.tempo_bpm)?;
        self.set_master_gain(document.master_gain)?;
        self.set_click_enabled(document.click.enabled)?;
        self.set_click_level(document.click.level)?;
        self.set_click_rhythm(document.click.beats_per_bar, document.click.subdivision)?;
        if document.loop_enabled {
            self.set_loop(document.loop_start_seconds, document.loop_end_seconds)?;
        }

        // Solo fan-out settles per add, so mixed solo states land correctly
        let mut ids: Vec<TrackId> = Vec::with_capacity(document.tracks.len());
        for track in &document.tracks {
            let config = TrackConfig {
                name: track.name.clone(),
                gain: track.gain,
                pan: track.pan,
                muted: track.muted,
                soloed: track.soloed,
            };
            ids.push(self.add_track_inner(config, false)?);
        }

        for conn in &document.connections {
            let src = self.resolve_endpoint(&ids, conn.src_track)?;
            let dst = self.resolve_endpoint(&ids, conn.dst_track)?;
            self.connect(src, conn.src_channel, dst, conn.dst_channel)?;
        }

        for (track, &id) in document.tracks.iter().zip(&ids) {
            for lane in &track.lanes {
                self.restore_lane(id, lane.param, lane.points.clone())?;
            }
        }
        Ok(())
    }

    fn track_position(&self, node: NodeId) -> Option<Option<usize>> {
        if node == NodeId::MASTER {
            return Some(None);
        }
        self.tracks()
            .position(|track| track.node == node)
            .map(Some)
    }

    fn resolve_endpoint(
        &self,
        ids: &[TrackId],
        position: Option<usize>,
    ) -> EngineResult<NodeId> {
        match position {
            None => Ok(NodeId::MASTER),
            Some(index) => {
                let id = ids.get(index).ok_or_else(|| {
                    EngineError::Session(format!("connection references missing track {index}"))
                })?;
                Ok(self
                    .track(*id)
                    .ok_or(EngineError::UnknownTrack(*id))?
                    .node)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
