use cycler_spoofer::protocol::*;
use cycler_spoofer::telemetry::SequenceCheck;
use cycler_spoofer::*;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const NUM_CHANNELS: u16 = 8;
const BUFFER_SIZE: usize = 1024;
const DEADLINE: Duration = Duration::from_secs(10);

async fn spawn_spoofer() -> SpooferHandle {
    let config = SpooferConfig {
        tick_period_ms: 10,
        telemetry_period_ms: 20,
        write_timeout_ms: 500,
        ..SpooferConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, NUM_CHANNELS, BUFFER_SIZE)
    };
    CyclerSpoofer::new(config).unwrap().start().await.unwrap()
}

async fn connect(handle: &SpooferHandle) -> CyclerInterface {
    let config = CyclerInterfaceConfig::new(
        "127.0.0.1",
        handle.json_addr.port(),
        handle.telemetry_addr.port(),
        BUFFER_SIZE,
    );
    CyclerInterface::connect(&config).await.unwrap()
}

async fn wait_for_sequence(client: &mut CyclerInterface, channel_id: ChannelId, sequence: u32) -> ChannelStatus {
    timeout(DEADLINE, async {
        loop {
            let status = client.read_measurement(channel_id).await.unwrap();
            if status.sequence >= sequence {
                return status;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_system_info_reports_identity_and_counts() {
    let handle = spawn_spoofer().await;
    let mut client = connect(&handle).await;

    let info = client.read_system_info().await.unwrap();
    assert_eq!(info.num_channels, NUM_CHANNELS);
    assert_eq!(info.json_port, handle.json_addr.port());
    assert_eq!(info.tcp_port, handle.telemetry_addr.port());
    assert_eq!(info.msg_buffer_size_bytes, BUFFER_SIZE);
    assert_eq!(info.channels.idle, NUM_CHANNELS);

    client.start_channel(5, SetPoint::constant_current(1.0)).await.unwrap();
    let info = client.read_system_info().await.unwrap();
    assert_eq!(info.channels.running, 1);
    assert_eq!(info.channels.idle, NUM_CHANNELS - 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_start_channel_three_and_read_measurement() {
    let handle = spawn_spoofer().await;
    let mut client = connect(&handle).await;

    let ack = client.start_channel(3, SetPoint::constant_current(1.0)).await.unwrap();
    assert_eq!(ack, ChannelAck { channel_id: 3, state: ChannelState::Running });

    let first = wait_for_sequence(&mut client, 3, 5).await;
    assert_eq!(first.state, ChannelState::Running);
    assert!(first.measurement.capacity_ah > 0.0);
    // Each sample advances test time by one tick
    assert_eq!(first.measurement.test_time_ms, u64::from(first.sequence) * 10);

    let later = wait_for_sequence(&mut client, 3, first.sequence + 1).await;
    assert!(later.measurement.capacity_ah > first.measurement.capacity_ah);

    // Other channels are untouched
    let other = client.read_measurement(2).await.unwrap();
    assert_eq!(other.state, ChannelState::Idle);
    assert_eq!(other.sequence, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_remote_errors_keep_the_connection() {
    let handle = spawn_spoofer().await;
    let mut client = connect(&handle).await;

    let err = client.pause_channel(NUM_CHANNELS).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidChannel));

    let err = client.pause_channel(1).await.unwrap_err();
    match err {
        ClientError::Remote { kind, message } => {
            assert_eq!(kind, ErrorKind::InvalidTransition);
            assert_eq!(message, "cannot pause channel 1 while Idle");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    // Registry untouched and connection still usable
    let status = client.read_measurement(1).await.unwrap();
    assert_eq!(status.state, ChannelState::Idle);
    assert_eq!(handle.registry.summary().idle, NUM_CHANNELS);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_fault_then_reset_over_the_wire() {
    let handle = spawn_spoofer().await;
    let mut client = connect(&handle).await;

    client.start_channel(0, SetPoint::constant_current(1.0)).await.unwrap();
    let ack = client.inject_fault(0, FaultKind::OverTemperature).await.unwrap();
    assert_eq!(ack.state, ChannelState::Faulted);

    let err = client.start_channel(0, SetPoint::constant_current(1.0)).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ChannelFaulted));

    let status = client.read_measurement(0).await.unwrap();
    assert_eq!(status.fault, Some(FaultKind::OverTemperature));

    let ack = client.reset_channel(0).await.unwrap();
    assert_eq!(ack.state, ChannelState::Idle);
    let ack = client.stop_channel(0).await.unwrap();
    assert_eq!(ack.state, ChannelState::Idle);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_two_clients_control_separate_channels_concurrently() {
    let handle = spawn_spoofer().await;
    let mut first = connect(&handle).await;
    let mut second = connect(&handle).await;

    async fn exercise(client: &mut CyclerInterface, channel_id: ChannelId) {
        for _ in 0..20 {
            client.start_channel(channel_id, SetPoint::constant_current(1.0)).await.unwrap();
            let status = client.read_measurement(channel_id).await.unwrap();
            assert_eq!(status.state, ChannelState::Running);
            client.pause_channel(channel_id).await.unwrap();
            client.stop_channel(channel_id).await.unwrap();
        }
    }

    timeout(DEADLINE, async {
        tokio::join!(exercise(&mut first, 1), exercise(&mut second, 2));
    })
    .await
    .unwrap();

    for channel_id in [1, 2] {
        let status = first.read_measurement(channel_id).await.unwrap();
        assert_eq!(status.state, ChannelState::Idle);
        assert_eq!(status.measurement.cycle, 20);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_closes_connection() {
    let handle = spawn_spoofer().await;
    let stream = TcpStream::connect(handle.json_addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"{\"type\": nope\n").await.unwrap();

    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let response = decode_response(line.trim_end().as_bytes()).unwrap();
    assert_eq!(response.error, Some(ErrorKind::MalformedMessage));

    // Server hangs up after the error response
    line.clear();
    let read = timeout(DEADLINE, reader.read_line(&mut line)).await.unwrap().unwrap();
    assert_eq!(read, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_keeps_connection() {
    let handle = spawn_spoofer().await;
    let stream = TcpStream::connect(handle.json_addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(b"{\"type\":\"warp\",\"channel_id\":0}\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    let response = decode_response(line.trim_end().as_bytes()).unwrap();
    assert_eq!(response.error, Some(ErrorKind::UnknownCommandType));

    line.clear();
    writer.write_all(b"{\"type\":\"read_system_info\"}\r\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    let response = decode_response(line.trim_end().as_bytes()).unwrap();
    assert!(response.error.is_none());
    assert_eq!(response.command_type.as_deref(), Some(CMD_READ_SYSTEM_INFO));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let handle = spawn_spoofer().await;
    let mut stream = TcpStream::connect(handle.json_addr).await.unwrap();

    // Just over the limit, but fully consumed by the server's bounded read
    let mut request = vec![b' '; MAX_COMMAND_SIZE + 2];
    request.push(b'\n');
    stream.write_all(&request).await.unwrap();

    let mut received = Vec::new();
    timeout(DEADLINE, stream.read_to_end(&mut received)).await.unwrap().unwrap();
    let response = decode_response(String::from_utf8(received).unwrap().trim_end().as_bytes()).unwrap();
    assert_eq!(response.error, Some(ErrorKind::MalformedMessage));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_telemetry_sequences_strictly_increase() {
    let handle = spawn_spoofer().await;
    let mut client = connect(&handle).await;

    client
        .subscribe(&Subscription::Channels(vec![0, 4]))
        .await
        .unwrap();
    client.start_channel(0, SetPoint::constant_current(1.0)).await.unwrap();
    client.start_channel(4, SetPoint::constant_current(-0.5)).await.unwrap();
    client.start_channel(6, SetPoint::constant_current(1.0)).await.unwrap();

    let mut last: HashMap<ChannelId, u32> = HashMap::new();
    let mut received = 0;
    timeout(DEADLINE, async {
        while received < 30 {
            let (frame, check) = client.next_frame().await.unwrap();
            assert_ne!(check, SequenceCheck::Stale);
            assert_ne!(frame.channel_id, 6, "unsubscribed channel streamed");
            assert_eq!(frame.state, ChannelState::Running);
            if let Some(previous) = last.insert(frame.channel_id, frame.sequence) {
                assert!(frame.sequence > previous);
            }
            received += 1;
        }
    })
    .await
    .unwrap();

    assert!(last.contains_key(&0));
    assert!(last.contains_key(&4));
    assert_eq!(client.sequence_tracker().stale_count(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_resubscribing_replaces_channel_set() {
    let handle = spawn_spoofer().await;
    let mut client = connect(&handle).await;

    client.start_channel(1, SetPoint::constant_current(1.0)).await.unwrap();
    client.start_channel(2, SetPoint::constant_current(1.0)).await.unwrap();
    client.subscribe(&Subscription::Channels(vec![1])).await.unwrap();

    timeout(DEADLINE, async {
        let (frame, _) = client.next_frame().await.unwrap();
        assert_eq!(frame.channel_id, 1);

        client.subscribe(&Subscription::Channels(vec![2])).await.unwrap();
        // Frames already in flight for channel 1 may still arrive
        loop {
            let (frame, _) = client.next_frame().await.unwrap();
            if frame.channel_id == 2 {
                break;
            }
        }
    })
    .await
    .unwrap();

    handle.shutdown().await;
}

#[tokio::test]
async fn test_telemetry_subscriber_count() {
    let handle = spawn_spoofer().await;
    assert_eq!(handle.telemetry_subscribers(), 0);

    let client = connect(&handle).await;
    timeout(DEADLINE, async {
        while handle.telemetry_subscribers() != 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    drop(client);
    timeout(DEADLINE, async {
        while handle.telemetry_subscribers() != 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_with_open_connections() {
    let handle = spawn_spoofer().await;
    let mut client = connect(&handle).await;
    client.subscribe(&Subscription::All).await.unwrap();
    client.start_channel(0, SetPoint::constant_current(1.0)).await.unwrap();

    let json_addr = handle.json_addr;
    timeout(DEADLINE, handle.shutdown()).await.unwrap();

    // Listener is gone and the open connection was closed
    assert!(TcpStream::connect(json_addr).await.is_err());
    assert!(client.read_system_info().await.is_err());
}

#[tokio::test]
async fn test_client_that_never_reads_cannot_block_shutdown() {
    let handle = spawn_spoofer().await;
    let mut stream = TcpStream::connect(handle.json_addr).await.unwrap();

    // Keep sending requests without reading a single response
    let flood = tokio::spawn(async move {
        let requests = b"{\"type\":\"read_system_info\"}\n".repeat(1024);
        while stream.write_all(&requests).await.is_ok() {}
    });
    sleep(Duration::from_millis(200)).await;

    timeout(DEADLINE, handle.shutdown()).await.unwrap();

    // The server dropped the connection, so the sender fails too
    timeout(DEADLINE, flood).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stalled_command_client_is_dropped() {
    let handle = spawn_spoofer().await;
    let mut stream = TcpStream::connect(handle.json_addr).await.unwrap();

    let requests = b"{\"type\":\"read_system_info\"}\n".repeat(1024);
    // Once the response write times out the server hangs up
    let flooded = timeout(DEADLINE, async {
        while stream.write_all(&requests).await.is_ok() {}
    })
    .await;
    assert!(flooded.is_ok(), "server kept a client that never reads");

    // Other clients are unaffected
    let mut client = connect(&handle).await;
    assert_eq!(client.read_system_info().await.unwrap().num_channels, NUM_CHANNELS);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let handle = spawn_spoofer().await;

    let taken = SpooferConfig::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        handle.json_addr.port(),
        0,
        1,
        BUFFER_SIZE,
    );
    match CyclerSpoofer::new(taken).unwrap().start().await {
        Err(SpooferError::Bind { addr, .. }) => assert_eq!(addr, handle.json_addr),
        Err(other) => panic!("expected a bind error, got {other:?}"),
        Ok(_) => panic!("second spoofer bound a port already in use"),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_binding() {
    let config = SpooferConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, 0, BUFFER_SIZE);
    assert!(matches!(
        CyclerSpoofer::new(config),
        Err(SpooferError::Config(ConfigError::Invalid { .. }))
    ));
}
