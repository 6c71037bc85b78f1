//! Property-Based Tests for slot resolution and the degradation ladder
//!
//! Run with: cargo test --test registry_props

use crabstream::testing::{AcceptRule, SyntheticProvider};
use crabstream::{
    BaseStreamConfig, CameraError, ConnectorSettings, DeviceRecord, DeviceRegistry, EventBus,
    FrameSink, MatchLabel, RegistrySnapshot, Resolution, SlotTable, StreamConnector,
    StreamSlotConfig,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const LABELS: &[&str] = &["Front", "Rear", "USB", "Integrated", "Virtual", ""];

fn device_list() -> impl Strategy<Value = Vec<DeviceRecord>> {
    prop::collection::vec((any::<bool>(), 0..LABELS.len()), 1..8).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (video, label))| {
                let label = format!("{} {}", LABELS[label], i).trim().to_string();
                if video || i == 0 {
                    DeviceRecord::video(format!("dev-{}", i), label)
                } else {
                    DeviceRecord::audio(format!("dev-{}", i), label)
                }
            })
            .collect()
    })
}

fn slot_configs() -> impl Strategy<Value = Vec<StreamSlotConfig>> {
    prop::collection::vec(
        (
            prop::option::of(0..LABELS.len()),
            prop_oneof![Just((0u32, 0u32)), Just((1280, 720)), Just((320, 240))],
        ),
        0..6,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .map(|(label, (w, h))| {
                let config = StreamSlotConfig::new(w, h);
                match label {
                    Some(l) => config.with_labels(vec![MatchLabel::substring(LABELS[l])]),
                    None => config,
                }
            })
            .collect()
    })
}

fn ladder_attempts(width: u32, ratio: f64) -> usize {
    let mut attempts = 0;
    let mut request = Resolution::new(width, width * 3 / 4);
    loop {
        attempts += 1;
        let next = request.scaled(ratio);
        if next.width < 240 || next.height == 0 {
            return attempts;
        }
        request = next;
    }
}

proptest! {
    /// Every video device backs exactly one slot, and nothing else does.
    #[test]
    fn resolved_slots_cover_video_devices_exactly(
        devices in device_list(),
        configs in slot_configs(),
    ) {
        let registry = RegistrySnapshot::from_devices(devices.clone());
        let slots = registry.resolve_slots(&configs, &BaseStreamConfig::default());

        let video: HashSet<String> = devices
            .iter()
            .filter(|d| d.is_video())
            .map(|d| d.device_id.clone())
            .collect();
        let assigned: Vec<String> = slots.iter().map(|s| s.device_id.clone()).collect();
        let unique: HashSet<String> = assigned.iter().cloned().collect();

        prop_assert_eq!(assigned.len(), unique.len(), "duplicate device in {:?}", assigned);
        prop_assert_eq!(unique, video);
        for (i, slot) in slots.iter().enumerate() {
            prop_assert_eq!(slot.index, i);
            prop_assert!(slot.config.width > 0 && slot.config.height > 0);
        }
    }

    /// A lone matching label resolves to that device first; a label that
    /// matches nothing is skipped.
    #[test]
    fn label_order_puts_unique_match_first(count in 1usize..6, target in 0usize..6) {
        let target = target % count;
        let devices: Vec<DeviceRecord> = (0..count)
            .map(|i| {
                let label = if i == target { "Special Cam" } else { "Plain Cam" };
                DeviceRecord::video(format!("dev-{}", i), label)
            })
            .collect();
        let registry = RegistrySnapshot::from_devices(devices);

        let ordered = registry.resolve_by_label_order(&[MatchLabel::substring("Special")]);
        prop_assert_eq!(ordered.len(), count);
        prop_assert_eq!(&ordered[0], &format!("dev-{}", target));

        let unmatched = registry.resolve_by_label_order(&[MatchLabel::substring("Missing")]);
        prop_assert_eq!(unmatched, registry.video_device_ids().to_vec());
        prop_assert!(registry.match_labels(&[MatchLabel::substring("Missing")]).is_empty());
    }

    /// A device rejecting every size exhausts the ladder after the number of
    /// steps it takes to fall under the 240 px floor.
    #[test]
    fn ladder_attempts_are_bounded(width in 240u32..4000) {
        let (attempts, error) = tokio_test::block_on(async {
            let provider = Arc::new(SyntheticProvider::new(vec![DeviceRecord::video("a", "Cam")]));
            provider.set_default_rule(AcceptRule::reject_all());
            let registry = Arc::new(DeviceRegistry::new(provider.clone(), Duration::from_secs(1)));
            registry.refresh().await.unwrap();
            let slots = Arc::new(SlotTable::new(
                registry
                    .resolve_slots(&[StreamSlotConfig::new(width, width * 3 / 4)], &BaseStreamConfig::default())
                    .await,
            ));
            let connector = StreamConnector::new(
                registry,
                slots,
                Arc::new(FrameSink::default()),
                Arc::new(EventBus::default()),
                ConnectorSettings {
                    retry_ratio: Some(0.6),
                    disconnect_before_switch: false,
                },
            );
            let error = connector.connect(0).await.unwrap_err();
            (provider.acquire_count(), error)
        });

        prop_assert_eq!(attempts, ladder_attempts(width, 0.6));
        let is_exhausted = matches!(error, CameraError::ResolutionExhausted { .. });
        prop_assert!(is_exhausted);
    }
}

#[test]
fn ladder_attempts_match_closed_form_examples() {
    // ceil(log(240 / w) / log(0.6))
    assert_eq!(ladder_attempts(640, 0.6), 2);
    assert_eq!(ladder_attempts(1920, 0.6), 5);
    assert_eq!(ladder_attempts(300, 0.6), 1);
}
