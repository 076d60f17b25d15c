//! A `Session` over a Tokio byte stream, fed one byte at a time.

use std::time::Duration;

use modilink::{
    Command,
    Message,
    ModuleId,
    ModuleKind,
    Session,
    transport::{StreamTransport, TransportKind},
};
use modilink_testing::TestResult;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Read bytes until one complete `{...}` frame has arrived.
async fn read_frame(device: &mut DuplexStream) -> TestResult<Message> {
    let mut frame = Vec::new();
    loop {
        let byte = device.read_u8().await?;
        if frame.is_empty() && byte != b'{' {
            continue;
        }
        frame.push(byte);
        if byte == b'}' {
            return Ok(Message::decode(&frame)?);
        }
    }
}

#[tokio::test]
async fn bytewise_stream_registers_a_module() -> TestResult {
    let (host, mut device) = tokio::io::duplex(1024);
    let session = Session::builder()
        .transport(StreamTransport::new(host, TransportKind::Serial))
        .expected_modules(1)
        .connect()
        .await?;

    let discovery = read_frame(&mut device).await?;
    assert_eq!(discovery.command, Command::RequestUuid);
    assert_eq!(discovery.destination, ModuleId::BROADCAST.as_u16());

    let network = ModuleId::new(0x0AB);
    let mut bytes = b"\x00garbage}".to_vec();
    bytes.extend_from_slice(&Message::assign_id(network, 0x0000_0000_0001, 0x2105).encode()?);
    for byte in bytes {
        device.write_all(&[byte]).await?;
        tokio::task::yield_now().await;
    }

    let modules = session.wait_for_topology(Duration::from_secs(2)).await?;
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].id, network);
    assert_eq!(modules[0].kind, ModuleKind::Network);
    assert_eq!(modules[0].version_string(), "1.1.5");
    assert_eq!(session.malformed_frames(), 0);

    drop(device);
    let registry = session.registry();
    for _ in 0..200 {
        if registry.connected_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.connected_count(), 0);

    session.close().await?;
    Ok(())
}
