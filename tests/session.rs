//! End-to-end tests driving a `Session` against a simulated module bus.

use std::time::Duration;

use modilink::{
    Command,
    Message,
    ModiError,
    ModuleId,
    ModuleKind,
    Neighbours,
    Position,
    PropertyType,
    Session,
    SessionConfig,
    TopologyState,
};
use modilink_testing::{FakeBus, FakeModule, TestResult};
use rstest::{fixture, rstest};

const NETWORK: u16 = 0x100;
const BUTTON: u16 = 0x200;
const MOTOR: u16 = 0x300;
const WAIT: Duration = Duration::from_secs(2);

/// Poll `check` every 10 ms until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn id(raw: u16) -> ModuleId { ModuleId::new(raw) }

fn prop(index: u16) -> PropertyType { PropertyType::new(index).expect("in range") }

#[fixture]
fn three_modules() -> Vec<FakeModule> {
    vec![
        FakeModule::network(NETWORK).links(Neighbours {
            right: Some(id(BUTTON)),
            top: Some(id(MOTOR)),
            ..Neighbours::default()
        }),
        FakeModule::button(BUTTON).property(2, 1.0),
        FakeModule::motor(MOTOR),
    ]
}

async fn connect(modules: Vec<FakeModule>, config: SessionConfig) -> TestResult<(FakeBus, Session)> {
    let (bus, transport) = FakeBus::spawn(modules);
    let session = Session::builder()
        .config(config)
        .expected_modules(3)
        .transport(transport)
        .connect()
        .await?;
    Ok((bus, session))
}

#[rstest]
#[tokio::test]
async fn discovery_assembles_ordered_topology(three_modules: Vec<FakeModule>) -> TestResult {
    let (bus, session) = connect(three_modules, SessionConfig::default()).await?;

    let ordered = session.wait_for_topology(WAIT).await?;
    let placed: Vec<(u16, Position)> = ordered
        .iter()
        .map(|m| (m.id.as_u16(), m.position.unwrap_or_default()))
        .collect();
    assert_eq!(
        placed,
        vec![
            (NETWORK, Position::new(0, 0)),
            (MOTOR, Position::new(0, 1)),
            (BUTTON, Position::new(1, 0)),
        ]
    );
    assert_eq!(session.topology_state(), TopologyState::Complete);
    assert_eq!(session.transport_count(), 1);
    assert_eq!(session.modules_of_kind(ModuleKind::Button).len(), 1);
    assert!(bus.discovery_requests() >= 1);

    session.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn property_reads_start_cold_and_request_once(three_modules: Vec<FakeModule>) -> TestResult {
    let (bus, session) = connect(three_modules, SessionConfig::default()).await?;
    session.wait_for_topology(WAIT).await?;

    assert_eq!(session.property(id(BUTTON), prop(2)), Some(0.0));
    assert!(
        eventually(|| session.property(id(BUTTON), prop(2)) == Some(1.0)).await,
        "update arrives"
    );
    assert_eq!(bus.property_requests(BUTTON, 2), 1);
    assert_eq!(session.property(ModuleId::new(0x7FF), prop(2)), None);

    session.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn unsolicited_updates_refresh_the_cache(three_modules: Vec<FakeModule>) -> TestResult {
    let (bus, session) = connect(three_modules, SessionConfig::default()).await?;
    session.wait_for_topology(WAIT).await?;

    bus.push_update(MOTOR, 5, 42.0);
    assert!(
        eventually(|| {
            session
                .module(id(MOTOR))
                .and_then(|m| m.cached_property(prop(5)))
                == Some(42.0)
        })
        .await
    );

    session.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn unplugged_bus_disconnects_modules(three_modules: Vec<FakeModule>) -> TestResult {
    let (bus, session) = connect(three_modules, SessionConfig::default()).await?;
    session.wait_for_topology(WAIT).await?;

    bus.unplug();
    let registry = session.registry();
    assert!(eventually(|| registry.connected_count() == 0).await);
    assert!(!session.is_topology_complete());
    assert_eq!(registry.len(), 3, "modules are kept after disconnect");
    assert!(matches!(
        session.send(&b"{}"[..]),
        Err(ModiError::Send(_))
    ));

    session.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn silent_modules_time_out_and_return(three_modules: Vec<FakeModule>) -> TestResult {
    let config = SessionConfig::builder()
        .module_timeout(Duration::from_millis(300))
        .maintenance_interval(Duration::from_millis(20))
        .build()?;
    let (bus, session) = connect(three_modules, config).await?;
    session.wait_for_topology(WAIT).await?;

    let registry = session.registry();
    assert!(eventually(|| registry.connected_count() == 0).await);
    assert!(!session.is_topology_complete());

    bus.heartbeat(BUTTON);
    assert!(
        eventually(|| session.module(id(BUTTON)).is_some_and(|m| m.connected)).await
    );

    session.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn malformed_frames_are_dropped_and_counted(three_modules: Vec<FakeModule>) -> TestResult {
    let (bus, session) = connect(three_modules, SessionConfig::default()).await?;
    session.wait_for_topology(WAIT).await?;

    bus.emit_raw(&b"}{\"c\":zz}{\"c\":0,\"s\":256,\"d\":4095,\"b\":\"\",\"l\":0}"[..]);
    assert!(eventually(|| session.malformed_frames() == 1).await);
    assert!(session.is_topology_complete());

    session.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn passthrough_exposes_raw_frames(three_modules: Vec<FakeModule>) -> TestResult {
    let (bus, session) = connect(three_modules, SessionConfig::default()).await?;
    session.wait_for_topology(WAIT).await?;
    while session.recv().is_some() {}
    assert!(session.recv().is_none(), "recv never blocks");

    bus.heartbeat(NETWORK);
    let mut seen = None;
    assert!(
        eventually(|| {
            seen = session.recv();
            seen.is_some()
        })
        .await
    );
    let message = Message::decode(&seen.expect("frame"))?;
    assert_eq!(message.command, Command::Health);
    assert_eq!(message.source, NETWORK);

    session.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn raw_sends_reach_the_bus(three_modules: Vec<FakeModule>) -> TestResult {
    let (bus, session) = connect(three_modules, SessionConfig::default()).await?;
    session.wait_for_topology(WAIT).await?;

    let custom = Message::new(Command::Other(0x04), 0, MOTOR, [1u8, 2, 3, 4]);
    session.send_message(&custom)?;
    assert!(eventually(|| bus.written().contains(&custom)).await);

    session.discover();
    assert!(eventually(|| bus.discovery_requests() >= 2).await);

    session.close().await?;
    session.close().await?;
    assert!(matches!(session.send(&b"{}"[..]), Err(ModiError::Closed)));
    Ok(())
}

#[tokio::test]
async fn incomplete_topology_times_out() -> TestResult {
    let (_bus, session) = connect(vec![FakeModule::network(NETWORK)], SessionConfig::default()).await?;

    let result = session.wait_for_topology(Duration::from_millis(300)).await;
    assert!(matches!(result, Err(ModiError::TopologyTimeout)));
    assert_eq!(session.topology_state(), TopologyState::Accumulating);

    session.set_expected_modules(Some(1));
    assert_eq!(session.wait_for_topology(WAIT).await?.len(), 1);

    session.close().await?;
    Ok(())
}
