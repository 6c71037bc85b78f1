//! Device registry: known input devices plus the ordered logical index of
//! video inputs.
//!
//! The registry only ever grows on [`DeviceRegistry::refresh`]. When device
//! topology is known to have changed, callers reset first (or use
//! [`DeviceRegistry::rebuild`], which does both under one write lock) so
//! dead indices never linger.

use crate::errors::CameraError;
use crate::platform::CapabilityProvider;
use crate::slots::{BaseStreamConfig, MatchLabel, ResolvedSlot, StreamSlotConfig};
use crate::types::{DeviceId, DeviceRecord, StreamIdx};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    devices: HashMap<DeviceId, DeviceRecord>,
    order: Vec<DeviceId>,
    video_index: Vec<DeviceId>,
}

impl RegistrySnapshot {
    /// Build a snapshot as a refresh of an empty registry would.
    pub fn from_devices(devices: Vec<DeviceRecord>) -> Self {
        let mut snapshot = Self::default();
        snapshot.merge(devices);
        snapshot
    }

    /// Insert unseen devices; returns how many were added.
    fn merge(&mut self, devices: Vec<DeviceRecord>) -> usize {
        let mut added = 0;
        for device in devices {
            if device.device_id.is_empty() || self.devices.contains_key(&device.device_id) {
                continue;
            }
            if device.is_video() {
                self.video_index.push(device.device_id.clone());
            }
            self.order.push(device.device_id.clone());
            self.devices.insert(device.device_id.clone(), device);
            added += 1;
        }
        added
    }

    pub fn resolve(&self, index: StreamIdx) -> Option<&DeviceId> {
        self.video_index.get(index)
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn video_count(&self) -> usize {
        self.video_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Video device ids in logical index order
    pub fn video_device_ids(&self) -> &[DeviceId] {
        &self.video_index
    }

    /// All known devices in discovery order
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }

    fn find_unclaimed(&self, label: &MatchLabel, claimed: &HashSet<DeviceId>) -> Option<DeviceId> {
        self.video_index
            .iter()
            .filter(|id| !claimed.contains(*id))
            .find(|id| {
                self.devices
                    .get(*id)
                    .map(|d| label.matches(&d.label))
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// For each label, the first unclaimed video device it matches.
    /// Labels that match nothing are skipped.
    pub fn match_labels(&self, labels: &[MatchLabel]) -> Vec<DeviceId> {
        let mut claimed = HashSet::new();
        let mut matched = Vec::new();
        for label in labels {
            if let Some(id) = self.find_unclaimed(label, &claimed) {
                claimed.insert(id.clone());
                matched.push(id);
            }
        }
        matched
    }

    /// Label matches first, then every remaining video device in index
    /// order. Each device appears exactly once.
    pub fn resolve_by_label_order(&self, labels: &[MatchLabel]) -> Vec<DeviceId> {
        let mut ordered = self.match_labels(labels);
        let claimed: HashSet<DeviceId> = ordered.iter().cloned().collect();
        ordered.extend(
            self.video_index
                .iter()
                .filter(|id| !claimed.contains(*id))
                .cloned(),
        );
        ordered
    }

    /// Pin configured slots to devices and add a default slot for every
    /// device left over.
    ///
    /// Slots with labels claim their first matching unclaimed device. Slots
    /// without labels, or whose labels matched nothing, take leftover devices
    /// in enumeration order. Slots that end up without a device are dropped
    /// and later indices close up. The result holds every video device
    /// exactly once.
    pub fn resolve_slots(
        &self,
        configs: &[StreamSlotConfig],
        default: &BaseStreamConfig,
    ) -> Vec<ResolvedSlot> {
        let mut claimed: HashSet<DeviceId> = HashSet::new();
        let mut assigned: Vec<Option<DeviceId>> = vec![None; configs.len()];

        for (i, config) in configs.iter().enumerate() {
            for label in &config.match_labels {
                if let Some(id) = self.find_unclaimed(label, &claimed) {
                    claimed.insert(id.clone());
                    assigned[i] = Some(id);
                    break;
                }
            }
        }

        for slot in assigned.iter_mut().filter(|slot| slot.is_none()) {
            let next = self
                .video_index
                .iter()
                .find(|id| !claimed.contains(*id))
                .cloned();
            match next {
                Some(id) => {
                    claimed.insert(id.clone());
                    *slot = Some(id);
                }
                None => break,
            }
        }

        let mut resolved: Vec<ResolvedSlot> = configs
            .iter()
            .zip(assigned)
            .filter_map(|(config, device_id)| {
                device_id.map(|device_id| (config.normalized(default), device_id))
            })
            .enumerate()
            .map(|(index, (config, device_id))| ResolvedSlot {
                index,
                device_id,
                config,
            })
            .collect();

        for id in &self.video_index {
            if !claimed.contains(id) {
                resolved.push(ResolvedSlot {
                    index: resolved.len(),
                    device_id: id.clone(),
                    config: default.to_slot_config(),
                });
            }
        }

        for slot in &resolved {
            crate::check_invariant!(
                self.contains(&slot.device_id),
                "resolved slot device exists in registry",
                "registry::resolve_slots"
            );
            crate::check_invariant!(
                slot.config.width > 0 && slot.config.height > 0,
                "resolved slot dimensions are positive",
                "registry::resolve_slots"
            );
        }
        crate::check_invariant!(
            resolved.len() == self.video_index.len(),
            "every video device has exactly one slot",
            "registry::resolve_slots"
        );

        resolved
    }
}

/// Process-wide device state, injected into every component that needs it.
pub struct DeviceRegistry {
    provider: Arc<dyn CapabilityProvider>,
    state: RwLock<RegistrySnapshot>,
    enumeration_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(provider: Arc<dyn CapabilityProvider>, enumeration_timeout: Duration) -> Self {
        Self {
            provider,
            state: RwLock::new(RegistrySnapshot::default()),
            enumeration_timeout,
        }
    }

    async fn enumerate(&self) -> Result<Vec<DeviceRecord>, CameraError> {
        match tokio::time::timeout(self.enumeration_timeout, self.provider.list_devices()).await {
            Ok(Ok(devices)) => {
                log::debug!("Enumerated {} input devices", devices.len());
                Ok(devices)
            }
            Ok(Err(e)) => {
                log::error!("Device enumeration failed: {}", e);
                Err(match e {
                    CameraError::EnumerationFailed(_) => e,
                    other => CameraError::EnumerationFailed(other.to_string()),
                })
            }
            Err(_) => {
                log::error!(
                    "Device enumeration timed out after {:?}",
                    self.enumeration_timeout
                );
                Err(CameraError::EnumerationFailed(format!(
                    "timed out after {}ms",
                    self.enumeration_timeout.as_millis()
                )))
            }
        }
    }

    /// Enumerate and append unseen devices. Never removes stale entries.
    /// Returns the number of video devices now indexed.
    pub async fn refresh(&self) -> Result<usize, CameraError> {
        let devices = self.enumerate().await?;
        let mut state = self.state.write().await;
        let added = state.merge(devices);
        log::info!(
            "Device registry refreshed: {} new, {} video devices indexed",
            added,
            state.video_count()
        );
        Ok(state.video_count())
    }

    /// Clear both maps at once.
    pub async fn reset(&self) {
        *self.state.write().await = RegistrySnapshot::default();
        log::debug!("Device registry reset");
    }

    /// Reset and refresh as one step: readers see either the old topology or
    /// the new one. A failed enumeration leaves the registry empty.
    pub async fn rebuild(&self) -> Result<usize, CameraError> {
        match self.enumerate().await {
            Ok(devices) => {
                let fresh = RegistrySnapshot::from_devices(devices);
                let count = fresh.video_count();
                *self.state.write().await = fresh;
                log::info!("Device registry rebuilt: {} video devices", count);
                Ok(count)
            }
            Err(e) => {
                self.reset().await;
                Err(e)
            }
        }
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.state.read().await.clone()
    }

    pub async fn resolve(&self, index: StreamIdx) -> Option<DeviceId> {
        self.state.read().await.resolve(index).cloned()
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.state.read().await.device(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.state.read().await.contains(device_id)
    }

    pub async fn video_count(&self) -> usize {
        self.state.read().await.video_count()
    }

    pub async fn resolve_by_label_order(&self, labels: &[MatchLabel]) -> Vec<DeviceId> {
        self.state.read().await.resolve_by_label_order(labels)
    }

    pub async fn resolve_slots(
        &self,
        configs: &[StreamSlotConfig],
        default: &BaseStreamConfig,
    ) -> Vec<ResolvedSlot> {
        self.state.read().await.resolve_slots(configs, default)
    }

    pub fn provider(&self) -> &Arc<dyn CapabilityProvider> {
        &self.provider
    }
}
