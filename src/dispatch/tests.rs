//! Tests for message application, staleness and liveness.

use std::time::Duration;

use bytes::Bytes;
use rstest::{fixture, rstest};
use tokio::{sync::mpsc, time::Instant};

use super::Dispatcher;
use crate::{
    config::SessionConfig,
    error::SendError,
    message::{Command, MalformedFrame, Message},
    registry::{ModuleId, ModuleKind, PropertyType},
    topology::{Neighbours, Position, TopologyState},
    transport::TransportId,
    worker::{OutboundHandle, TransportEvent, TransportEventKind},
};

const LINK: TransportId = TransportId::new(1);
const NETWORK: ModuleId = ModuleId::new(0x100);
const BUTTON: ModuleId = ModuleId::new(0x200);
const NETWORK_UUID: u64 = 0x0000_0000_0A01;
const BUTTON_UUID: u64 = 0x2030_0000_0B02;

struct Harness {
    dispatcher: Dispatcher,
    outgoing: mpsc::Receiver<Bytes>,
}

impl Harness {
    fn feed(&self, message: &Message) -> Result<(), MalformedFrame> {
        self.dispatcher
            .on_frame(LINK, message.encode().expect("encode"))
    }

    fn sent(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = self.outgoing.try_recv() {
            out.push(Message::decode(&frame).expect("outgoing frames decode"));
        }
        out
    }

    fn register(&self, id: ModuleId, uuid: u64) {
        self.feed(&Message::assign_id(id, uuid, 0x2A05))
            .expect("registration applies");
    }
}

fn prop(index: u16) -> PropertyType { PropertyType::new(index).expect("in range") }

#[fixture]
fn harness() -> Harness {
    let config = SessionConfig::builder()
        .expected_modules(Some(2))
        .build()
        .expect("config");
    let dispatcher = Dispatcher::new(&config);
    let (tx, outgoing) = mpsc::channel(64);
    dispatcher.add_route(OutboundHandle::new(LINK, tx));
    Harness {
        dispatcher,
        outgoing,
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn property_reads_follow_the_freshness_window(mut harness: Harness) {
    harness.register(BUTTON, BUTTON_UUID);
    harness.sent();

    assert_eq!(harness.dispatcher.property(BUTTON, prop(2)), Some(0.0));
    let requests = harness.sent();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].command, Command::RequestProperty);
    assert_eq!(requests[0].destination, BUTTON.as_u16());
    assert_eq!(requests[0].payload, vec![2, 0, 95, 0]);

    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(harness.dispatcher.property(BUTTON, prop(2)), Some(0.0));
    assert!(harness.sent().is_empty());

    tokio::time::advance(Duration::from_millis(501)).await;
    assert_eq!(harness.dispatcher.property(BUTTON, prop(2)), Some(0.0));
    assert_eq!(harness.sent().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn fresh_updates_suppress_requests(mut harness: Harness) {
    harness.register(BUTTON, BUTTON_UUID);
    harness.dispatcher.property(BUTTON, prop(3));
    harness.sent();

    for step in 0..4u8 {
        tokio::time::advance(Duration::from_millis(600)).await;
        harness
            .feed(&Message::property_update(BUTTON, prop(3), f32::from(step)))
            .expect("update applies");
        assert_eq!(
            harness.dispatcher.property(BUTTON, prop(3)),
            Some(f32::from(step))
        );
    }
    assert!(harness.sent().is_empty());
}

#[rstest]
#[tokio::test]
async fn unknown_modules_read_as_absent(mut harness: Harness) {
    assert_eq!(harness.dispatcher.property(ModuleId::new(0x42), prop(2)), None);
    assert!(harness.sent().is_empty());
}

#[rstest]
#[tokio::test]
async fn updates_write_through_and_create_modules(mut harness: Harness) {
    harness
        .feed(&Message::property_update(BUTTON, prop(4), 12.5))
        .expect("update applies");

    let module = harness.dispatcher.registry().get(BUTTON).expect("created");
    assert_eq!(module.cached_property(prop(4)), Some(12.5));
    assert!(module.connected);
    assert_eq!(module.kind, ModuleKind::Unknown);

    let sent = harness.sent();
    assert_eq!(sent.len(), 1, "unregistered sender is asked to register");
    assert_eq!(sent[0].command, Command::RequestUuid);
    assert_eq!(sent[0].destination, BUTTON.as_u16());
}

#[rstest]
#[tokio::test]
async fn reserved_properties_are_ignored(harness: Harness) {
    harness.register(BUTTON, BUTTON_UUID);
    let reserved = Message::new(Command::PropertyUpdate, BUTTON.as_u16(), 1, 5.0f32.to_le_bytes());
    harness.feed(&reserved).expect("ignored, not malformed");

    let module = harness.dispatcher.registry().get(BUTTON).expect("registered");
    assert!(module.properties.is_empty());
}

#[rstest]
#[tokio::test]
async fn registration_fills_identity(harness: Harness) {
    harness.register(BUTTON, BUTTON_UUID);

    let module = harness.dispatcher.registry().get(BUTTON).expect("registered");
    assert_eq!(module.uuid, BUTTON_UUID);
    assert_eq!(module.kind, ModuleKind::Button);
    assert_eq!(module.version_string(), "1.10.5");
    assert_eq!(module.transport, LINK);
    assert_eq!(harness.dispatcher.registry().connected_count(), 1);
}

#[rstest]
#[tokio::test]
async fn health_from_unknown_module_triggers_discovery(mut harness: Harness) {
    harness
        .feed(&Message::health(ModuleId::new(0x333)))
        .expect("health applies");

    assert!(!harness.dispatcher.registry().contains(ModuleId::new(0x333)));
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, Command::RequestUuid);
    assert_eq!(sent[0].destination, 0x333);
}

#[rstest]
#[tokio::test]
async fn topology_links_position_modules(harness: Harness) {
    let dispatcher = &harness.dispatcher;
    harness.register(NETWORK, NETWORK_UUID);
    harness.register(BUTTON, BUTTON_UUID);
    assert_eq!(dispatcher.topology_state(), TopologyState::Accumulating);

    harness
        .feed(&Message::topology(
            NETWORK,
            Neighbours {
                top: Some(BUTTON),
                ..Neighbours::default()
            },
        ))
        .expect("links apply");

    assert!(dispatcher.is_topology_complete());
    let ordered = dispatcher.ordered_modules();
    let ids: Vec<ModuleId> = ordered.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![NETWORK, BUTTON]);
    assert_eq!(ordered[0].position, Some(Position::ORIGIN));
    assert_eq!(ordered[1].position, Some(Position::new(0, 1)));
}

#[rstest]
#[case::not_json(&b"{\"c\":oops}"[..])]
#[case::missing_key(&br#"{"c":0,"s":1,"d":2,"b":""}"#[..])]
#[case::short_registration(&br#"{"c":5,"s":1,"d":4095,"b":"AQI=","l":2}"#[..])]
#[case::property_out_of_range(&br#"{"c":31,"s":1,"d":40,"b":"AAAAAA==","l":4}"#[..])]
#[tokio::test]
async fn malformed_frames_are_counted(harness: Harness, #[case] frame: &'static [u8]) {
    assert!(harness.dispatcher.on_frame(LINK, Bytes::from_static(frame)).is_err());
    assert_eq!(harness.dispatcher.malformed_frames(), 1);
    assert!(harness.dispatcher.registry().is_empty());
}

#[rstest]
#[tokio::test]
async fn transport_loss_disconnects_its_modules(harness: Harness) {
    let dispatcher = &harness.dispatcher;
    harness.register(NETWORK, NETWORK_UUID);
    harness.register(BUTTON, BUTTON_UUID);
    harness
        .feed(&Message::topology(
            NETWORK,
            Neighbours {
                right: Some(BUTTON),
                ..Neighbours::default()
            },
        ))
        .expect("links apply");
    assert!(dispatcher.is_topology_complete());

    dispatcher.on_event(TransportEvent {
        transport: LINK,
        kind: TransportEventKind::Lost,
    });

    assert_eq!(dispatcher.registry().connected_count(), 0);
    assert_eq!(dispatcher.registry().len(), 2, "entries are kept");
    assert!(!dispatcher.is_topology_complete());
    assert_eq!(dispatcher.route_count(), 0);
    assert_eq!(
        dispatcher.send_all(&Bytes::from_static(b"{}")),
        Err(SendError::NoTransport)
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn silent_modules_expire_and_return(harness: Harness) {
    let dispatcher = &harness.dispatcher;
    harness.register(BUTTON, BUTTON_UUID);

    tokio::time::advance(Duration::from_millis(1500)).await;
    assert!(dispatcher.expire_idle_modules(Instant::now()).is_empty());

    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(dispatcher.expire_idle_modules(Instant::now()), vec![BUTTON]);
    assert!(!dispatcher.registry().get(BUTTON).expect("kept").connected);

    harness.feed(&Message::health(BUTTON)).expect("health applies");
    assert!(dispatcher.registry().get(BUTTON).expect("kept").connected);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn maintenance_polls_only_requested_properties(mut harness: Harness) {
    harness.register(BUTTON, BUTTON_UUID);
    harness.dispatcher.property(BUTTON, prop(2));
    harness.sent();

    tokio::time::advance(Duration::from_millis(1001)).await;
    harness
        .feed(&Message::health(BUTTON))
        .expect("keep alive");
    harness.dispatcher.maintain(Instant::now());

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload[0], 2);
}

#[rstest]
#[tokio::test]
async fn frames_reach_the_passthrough_tap(harness: Harness) {
    let mut tap = harness.dispatcher.subscribe();
    let health = Message::health(BUTTON);
    harness.feed(&health).expect("health applies");

    let frame = tap.try_recv().expect("tapped frame");
    assert_eq!(Message::decode(&frame).expect("decode"), health);
}

#[rstest]
#[case::short_payload(&br#"{"c":31,"s":512,"d":2,"b":"AQ==","l":1}"#[..])]
#[case::property_out_of_range(&br#"{"c":31,"s":512,"d":40,"b":"AAAAAA==","l":4}"#[..])]
#[case::not_json(&b"{\"c\":oops}"[..])]
#[tokio::test]
async fn rejected_frames_never_reach_the_tap(harness: Harness, #[case] frame: &'static [u8]) {
    let mut tap = harness.dispatcher.subscribe();

    assert!(harness.dispatcher.on_frame(LINK, Bytes::from_static(frame)).is_err());
    assert!(tap.try_recv().is_err());

    let health = Message::health(BUTTON);
    harness.feed(&health).expect("health applies");
    let tapped = tap.try_recv().expect("valid frame is tapped");
    assert_eq!(Message::decode(&tapped).expect("decode"), health);
}

#[rstest]
#[tokio::test]
async fn links_from_unregistered_module_trigger_discovery(mut harness: Harness) {
    harness
        .feed(&Message::topology(
            BUTTON,
            Neighbours {
                left: Some(NETWORK),
                ..Neighbours::default()
            },
        ))
        .expect("links apply");

    let module = harness.dispatcher.registry().get(BUTTON).expect("created");
    assert_eq!(module.kind, ModuleKind::Unknown);
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, Command::RequestUuid);
    assert_eq!(sent[0].destination, BUTTON.as_u16());

    harness
        .feed(&Message::topology(BUTTON, Neighbours::default()))
        .expect("links apply");
    assert!(harness.sent().is_empty(), "known modules are not asked again");
}

#[rstest]
#[tokio::test]
async fn discovery_broadcasts_on_every_route(mut harness: Harness) {
    harness.dispatcher.discover();
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, Command::RequestUuid);
    assert_eq!(sent[0].destination, ModuleId::BROADCAST.as_u16());
}
