//! Native model of the script's peer-connection capture bookkeeping.
//!
//! Every wrapped peer connection reports the tracks it receives. While the
//! tap is armed (from page load on) each audio track gets exactly one
//! capture graph as it arrives. Video tracks never get one. Disarming
//! releases the graphs; re-arming builds them again for known tracks.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug)]
pub struct TapRegistry {
    /// Live inbound audio tracks, by track id.
    audio_tracks: BTreeSet<String>,
    /// Track ids that currently own a capture graph.
    graphs: BTreeSet<String>,
    /// Total graphs ever built, by track id.
    built: BTreeMap<String, u32>,
    armed: bool,
}

impl TapRegistry {
    pub fn new() -> Self {
        Self {
            audio_tracks: BTreeSet::new(),
            graphs: BTreeSet::new(),
            built: BTreeMap::new(),
            armed: true,
        }
    }

    /// Record a remote track. Returns `true` when a capture graph was built
    /// for it.
    pub fn on_track(&mut self, track_id: &str, kind: TrackKind) -> bool {
        if kind != TrackKind::Audio || !self.audio_tracks.insert(track_id.to_string()) {
            return false;
        }
        self.armed && self.build(track_id)
    }

    /// Build graphs for every live audio track lacking one, and for every
    /// later one. Returns how many graphs this call built.
    pub fn arm(&mut self) -> usize {
        self.armed = true;
        let pending: Vec<String> = self
            .audio_tracks
            .iter()
            .filter(|id| !self.graphs.contains(*id))
            .cloned()
            .collect();
        pending.iter().filter(|id| self.build(id)).count()
    }

    /// Release every graph and stop building new ones.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.graphs.clear();
    }

    pub fn graph_count(&self) -> usize {
        self.graphs.len()
    }

    pub fn graphs_built_for(&self, track_id: &str) -> u32 {
        self.built.get(track_id).copied().unwrap_or(0)
    }

    fn build(&mut self, track_id: &str) -> bool {
        if !self.graphs.insert(track_id.to_string()) {
            return false;
        }
        *self.built.entry(track_id.to_string()).or_default() += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_tracks_are_tapped_on_arrival_and_video_never() {
        let mut taps = TapRegistry::new();
        assert!(taps.on_track("a1", TrackKind::Audio));
        assert!(!taps.on_track("v1", TrackKind::Video));
        assert_eq!(taps.graph_count(), 1);
    }

    #[test]
    fn repeated_track_events_do_not_duplicate_graphs() {
        let mut taps = TapRegistry::new();
        assert!(taps.on_track("a1", TrackKind::Audio));
        assert!(!taps.on_track("a1", TrackKind::Audio));
        assert_eq!(taps.arm(), 0);
        assert_eq!(taps.graphs_built_for("a1"), 1);
    }

    #[test]
    fn disarmed_tap_ignores_new_tracks_until_rearmed() {
        let mut taps = TapRegistry::new();
        taps.on_track("a1", TrackKind::Audio);
        taps.disarm();
        assert_eq!(taps.graph_count(), 0);
        assert!(!taps.on_track("a2", TrackKind::Audio));

        assert_eq!(taps.arm(), 2);
        assert_eq!(taps.graphs_built_for("a1"), 2);
    }
}
