// Track Selector: decides which adaptation each period loads per track type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::manifest::{Adaptation, Period, Representation, TrackType};

/// How buffered data of other representations is handled on a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchingMode {
    /// Replace old data progressively, keeping what is around the position.
    #[default]
    Seamless,
    /// Remove old data and flush the decoder so the switch is visible at once.
    Direct,
    /// Reload the media pipeline.
    Reload,
    /// Keep old data, only new segments use the new choice.
    Lazy,
}

/// Selected adaptation and the representations it is allowed to play.
#[derive(Debug, Clone)]
pub struct AdaptationChoice {
    pub adaptation: Arc<Adaptation>,
    pub switching_mode: SwitchingMode,
    /// Authorized representations. Empty means every playable one.
    pub representations: Vec<Arc<Representation>>,
}

impl AdaptationChoice {
    pub fn new(adaptation: Arc<Adaptation>) -> Self {
        Self {
            adaptation,
            switching_mode: SwitchingMode::Seamless,
            representations: Vec::new(),
        }
    }

    pub fn with_switching_mode(mut self, mode: SwitchingMode) -> Self {
        self.switching_mode = mode;
        self
    }

    pub fn with_representations(mut self, representations: Vec<Arc<Representation>>) -> Self {
        self.representations = representations;
        self
    }

    pub fn authorized_representations(&self) -> Vec<Arc<Representation>> {
        if self.representations.is_empty() {
            self.adaptation.playable_representations()
        } else {
            self.representations
                .iter()
                .filter(|r| r.is_playable())
                .cloned()
                .collect()
        }
    }
}

pub trait TrackSelector: Send + Sync {
    /// Live choice for `track_type` in `period`. `None` disables the track.
    fn select(&self, period: &Arc<Period>, track_type: TrackType)
    -> watch::Receiver<Option<AdaptationChoice>>;
}

/// Selects the first adaptation of each type, or the first matching a preferred
/// language, and lets the embedder override choices at runtime.
#[derive(Debug, Default)]
pub struct DefaultTrackSelector {
    disabled: HashSet<TrackType>,
    preferred_languages: HashMap<TrackType, String>,
    choices: Mutex<HashMap<(String, TrackType), watch::Sender<Option<AdaptationChoice>>>>,
}

impl DefaultTrackSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(mut self, track_type: TrackType) -> Self {
        self.disabled.insert(track_type);
        self
    }

    pub fn prefer_language(mut self, track_type: TrackType, language: impl Into<String>) -> Self {
        self.preferred_languages.insert(track_type, language.into());
        self
    }

    fn initial_choice(&self, period: &Period, track_type: TrackType) -> Option<AdaptationChoice> {
        if self.disabled.contains(&track_type) {
            return None;
        }
        let adaptations = period.adaptations_for_type(track_type);
        let preferred = self.preferred_languages.get(&track_type).and_then(|lang| {
            adaptations
                .iter()
                .find(|a| a.language.as_deref() == Some(lang.as_str()))
        });
        preferred
            .or_else(|| adaptations.first())
            .map(|a| AdaptationChoice::new(Arc::clone(a)))
    }

    fn sender(
        &self,
        period: &Period,
        track_type: TrackType,
    ) -> watch::Sender<Option<AdaptationChoice>> {
        self.choices
            .lock()
            .entry((period.id.clone(), track_type))
            .or_insert_with(|| watch::Sender::new(self.initial_choice(period, track_type)))
            .clone()
    }

    /// Changes the choice for a period, notifying the scheduler loading it.
    pub fn set_choice(&self, period: &Period, track_type: TrackType, choice: Option<AdaptationChoice>) {
        debug!(
            period = %period.id,
            track = %track_type,
            adaptation = ?choice.as_ref().map(|c| c.adaptation.id.as_str()),
            "Track choice updated"
        );
        self.sender(period, track_type).send_replace(choice);
    }

    /// Restricts the representations of the current choice.
    pub fn lock_representations(
        &self,
        period: &Period,
        track_type: TrackType,
        representations: Vec<Arc<Representation>>,
        mode: SwitchingMode,
    ) {
        self.sender(period, track_type).send_modify(|choice| {
            if let Some(choice) = choice {
                choice.representations = representations;
                choice.switching_mode = mode;
            }
        });
    }
}

impl TrackSelector for DefaultTrackSelector {
    fn select(
        &self,
        period: &Arc<Period>,
        track_type: TrackType,
    ) -> watch::Receiver<Option<AdaptationChoice>> {
        self.sender(period, track_type).subscribe()
    }
}
