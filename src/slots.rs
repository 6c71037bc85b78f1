//! Logical stream slot configuration and the resolved slot table.
//!
//! A slot is "the Nth camera the application cares about". Configured slots
//! carry a preferred resolution and optional label matchers; resolution
//! against the device registry pins each slot to a concrete device id.

use crate::errors::CameraError;
use crate::types::{DeviceId, Resolution, StreamIdx};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Regex matcher for device labels.
#[derive(Debug, Clone)]
pub struct LabelPattern(Regex);

impl LabelPattern {
    pub fn new(pattern: &str) -> Result<Self, CameraError> {
        Regex::new(pattern)
            .map(LabelPattern)
            .map_err(|e| CameraError::InvalidConfig(format!("Invalid label pattern {:?}: {}", pattern, e)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, label: &str) -> bool {
        self.0.is_match(label)
    }
}

impl PartialEq for LabelPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for LabelPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LabelPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        LabelPattern::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// How a configured slot picks its device by label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MatchLabel {
    /// Case-sensitive substring of the device label (trimmed).
    Substring(String),
    /// Regular expression tested against the device label.
    Pattern(LabelPattern),
}

impl MatchLabel {
    pub fn substring(value: impl Into<String>) -> Self {
        MatchLabel::Substring(value.into())
    }

    pub fn pattern(value: &str) -> Result<Self, CameraError> {
        Ok(MatchLabel::Pattern(LabelPattern::new(value)?))
    }

    /// Empty labels and empty needles never match.
    pub fn matches(&self, label: &str) -> bool {
        if label.is_empty() {
            return false;
        }
        match self {
            MatchLabel::Substring(needle) => {
                let needle = needle.trim();
                !needle.is_empty() && label.contains(needle)
            }
            MatchLabel::Pattern(pattern) => pattern.is_match(label),
        }
    }
}

/// Resolution used for auto-generated slots and for configured slots that
/// leave their size unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseStreamConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<i32>,
}

impl Default for BaseStreamConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            min_width: None,
            min_height: None,
            rotate: None,
        }
    }
}

impl BaseStreamConfig {
    /// Slot config for a device nobody asked for by label.
    pub fn to_slot_config(&self) -> StreamSlotConfig {
        StreamSlotConfig {
            width: self.width,
            height: self.height,
            min_width: self.min_width,
            min_height: self.min_height,
            rotate: self.rotate,
            match_labels: Vec::new(),
        }
        .normalized(self)
    }
}

/// Per-slot configuration as supplied by the application.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamSlotConfig {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_labels: Vec<MatchLabel>,
}

impl StreamSlotConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_minimum(mut self, min_width: u32, min_height: u32) -> Self {
        self.min_width = Some(min_width);
        self.min_height = Some(min_height);
        self
    }

    pub fn with_rotate(mut self, rotate: i32) -> Self {
        self.rotate = Some(rotate);
        self
    }

    pub fn with_labels(mut self, labels: Vec<MatchLabel>) -> Self {
        self.match_labels = labels;
        self
    }

    /// Fill unset dimensions from `default` and clamp minimums down to the
    /// requested size.
    pub fn normalized(&self, default: &BaseStreamConfig) -> Self {
        let mut out = self.clone();
        if out.width == 0 {
            out.width = default.width.max(1);
        }
        if out.height == 0 {
            out.height = default.height.max(1);
        }
        out.clamp_minimum();
        out
    }

    /// Set the requested size, pulling minimums down so they never exceed it.
    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.width = resolution.width;
        self.height = resolution.height;
        self.clamp_minimum();
    }

    fn clamp_minimum(&mut self) {
        if let Some(min_width) = self.min_width {
            self.min_width = Some(min_width.min(self.width));
        }
        if let Some(min_height) = self.min_height {
            self.min_height = Some(min_height.min(self.height));
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// A slot pinned to a concrete device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSlot {
    pub index: StreamIdx,
    pub device_id: DeviceId,
    pub config: StreamSlotConfig,
}

impl ResolvedSlot {
    pub fn resolution(&self) -> Resolution {
        self.config.resolution()
    }

    pub fn min_width(&self) -> Option<u32> {
        self.config.min_width
    }

    pub fn min_height(&self) -> Option<u32> {
        self.config.min_height
    }

    pub fn rotate(&self) -> i32 {
        self.config.rotate.unwrap_or(0)
    }
}

/// Shared, swappable table of resolved slots indexed by logical index.
///
/// Resolutions negotiated through the degradation ladder are remembered per
/// device and outlive [`SlotTable::replace`] and [`SlotTable::clear`], so a
/// device that comes back after a topology change starts from its last
/// known-good size.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: RwLock<Vec<ResolvedSlot>>,
    negotiated: RwLock<HashMap<DeviceId, Resolution>>,
}

impl SlotTable {
    pub fn new(slots: Vec<ResolvedSlot>) -> Self {
        Self {
            slots: RwLock::new(slots),
            negotiated: RwLock::new(HashMap::new()),
        }
    }

    /// Replace every slot in one step, carrying over negotiated resolutions
    /// for devices seen before.
    pub async fn replace(&self, mut slots: Vec<ResolvedSlot>) {
        let mut current = self.slots.write().await;
        let negotiated = self.negotiated.read().await;
        for slot in slots.iter_mut() {
            if let Some(resolution) = negotiated.get(&slot.device_id) {
                log::debug!(
                    "Slot {} keeps negotiated {} for {}",
                    slot.index,
                    resolution,
                    slot.device_id
                );
                slot.config.set_resolution(*resolution);
            }
        }
        *current = slots;
    }

    pub async fn negotiated(&self, device_id: &str) -> Option<Resolution> {
        self.negotiated.read().await.get(device_id).copied()
    }

    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    pub async fn get(&self, index: StreamIdx) -> Option<ResolvedSlot> {
        self.slots.read().await.get(index).cloned()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ResolvedSlot> {
        self.slots.read().await.clone()
    }

    pub async fn device_ids(&self) -> Vec<DeviceId> {
        self.slots
            .read()
            .await
            .iter()
            .map(|slot| slot.device_id.clone())
            .collect()
    }

    /// Remember a negotiated resolution so later reconnects start from it.
    /// Returns false when the slot no longer exists.
    pub async fn update_resolution(&self, index: StreamIdx, resolution: Resolution) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get_mut(index) {
            Some(slot) => {
                if slot.config.resolution() != resolution {
                    log::debug!(
                        "Slot {} resolution {}x{} -> {}",
                        index,
                        slot.config.width,
                        slot.config.height,
                        resolution
                    );
                    slot.config.set_resolution(resolution);
                }
                self.negotiated
                    .write()
                    .await
                    .insert(slot.device_id.clone(), resolution);
                true
            }
            None => false,
        }
    }
}
