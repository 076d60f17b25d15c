//! Tests for module identity, property tables and the registry container.

use rstest::rstest;
use tokio::time::{Duration, Instant};

use super::{Module, ModuleId, ModuleKind, ModuleRegistry, Property, PropertyType};
use crate::transport::TransportId;

const WINDOW: Duration = Duration::from_secs(1);

#[rstest]
#[case(0, true)]
#[case(31, true)]
#[case(32, false)]
#[case(300, false)]
fn property_tags_are_bounded(#[case] index: u16, #[case] valid: bool) {
    assert_eq!(PropertyType::new(index).is_some(), valid);
}

#[rstest]
#[case(0x0000_0000_0001, ModuleKind::Network)]
#[case(0x2030_1234_5678, ModuleKind::Button)]
#[case(0x4010_0000_0042, ModuleKind::Motor)]
#[case(0x4030_0000_0000, ModuleKind::Speaker)]
#[case(0x7777_0000_0000, ModuleKind::Unknown)]
fn kind_follows_uuid_category(#[case] uuid: u64, #[case] kind: ModuleKind) {
    assert_eq!(ModuleKind::from_uuid(uuid), kind);
}

#[test]
fn unrequested_property_needs_request() {
    assert!(Property::default().needs_request(Instant::now(), WINDOW));
}

#[test]
fn request_gate_follows_freshness_window() {
    let t0 = Instant::now();
    let property = Property {
        value: 0.0,
        last_update: None,
        last_request: Some(t0),
    };

    assert!(!property.needs_request(t0 + Duration::from_millis(500), WINDOW));
    assert!(!property.needs_request(t0 + WINDOW, WINDOW));
    assert!(property.needs_request(t0 + Duration::from_millis(1001), WINDOW));
}

#[test]
fn recent_update_suppresses_request() {
    let t0 = Instant::now();
    let property = Property {
        value: 4.0,
        last_update: Some(t0 + Duration::from_millis(900)),
        last_request: Some(t0),
    };

    assert!(!property.needs_request(t0 + Duration::from_millis(1500), WINDOW));
    assert!(property.needs_request(t0 + Duration::from_millis(2000), WINDOW));
}

#[test]
fn version_renders_major_minor_patch() {
    let mut module = Module::new(ModuleId::new(1), TransportId::new(0), Instant::now());
    module.version = 0x2A05;

    assert_eq!(module.version_string(), "1.10.5");
}

#[test]
fn upsert_creates_each_module_once() {
    let registry = ModuleRegistry::default();
    let now = Instant::now();

    let (entry, created) = registry.upsert(ModuleId::new(7), TransportId::new(0), now);
    drop(entry);
    assert!(created);
    let (mut entry, created) = registry.upsert(ModuleId::new(7), TransportId::new(1), now);
    assert!(!created);
    entry.kind = ModuleKind::Dial;
    drop(entry);

    let module = registry.get(ModuleId::new(7)).expect("module registered");
    assert_eq!(module.transport, TransportId::new(0));
    assert_eq!(module.kind, ModuleKind::Dial);
    assert_eq!(registry.len(), 1);
}

#[test]
fn snapshots_are_sorted_and_filterable() {
    let registry = ModuleRegistry::default();
    let now = Instant::now();
    for (id, kind) in [(9, ModuleKind::Led), (2, ModuleKind::Button), (5, ModuleKind::Led)] {
        let (mut entry, _) = registry.upsert(ModuleId::new(id), TransportId::new(0), now);
        entry.kind = kind;
    }

    let ids: Vec<u16> = registry.snapshot().iter().map(|m| m.id.as_u16()).collect();
    assert_eq!(ids, vec![2, 5, 9]);
    let leds: Vec<u16> = registry
        .of_kind(ModuleKind::Led)
        .iter()
        .map(|m| m.id.as_u16())
        .collect();
    assert_eq!(leds, vec![5, 9]);
    assert!(registry.get(ModuleId::new(3)).is_none());
}

#[test]
fn property_table_iterates_populated_slots() {
    let mut module = Module::new(ModuleId::new(1), TransportId::new(0), Instant::now());
    let slot = PropertyType::new(4).expect("slot in range");
    module.properties.get_or_insert(slot).value = 2.5;

    let populated: Vec<(u8, f32)> = module
        .properties
        .iter()
        .map(|(tag, p)| (tag.index(), p.value))
        .collect();
    assert_eq!(populated, vec![(4, 2.5)]);
    assert_eq!(module.cached_property(slot), Some(2.5));
}
