use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use gripsense::decoder::{ack_frame, Command, DecodedEvent, RawValue};
use gripsense::descriptor::{self, CharacteristicRef, BATTERY_LEVEL, PROGRESSOR_RX, PROGRESSOR_SERVICE};
use gripsense::mock_transport::MockTransport;
use gripsense::transport::Transport;
use gripsense::{CharacteristicIo, GripError, SlotState};

type Io = CharacteristicIo<MockTransport>;

/// A progressor behind a mock link, with notifications routed the way the
/// device pump routes them.
async fn progressor() -> (Arc<MockTransport>, Arc<Io>) {
    let transport = Arc::new(MockTransport::new());
    let io = Arc::new(CharacteristicIo::new(transport.clone(), descriptor::progressor()));
    let mut notifications = transport
        .subscribe(PROGRESSOR_SERVICE, PROGRESSOR_RX)
        .await
        .unwrap();
    let router = io.clone();
    tokio::spawn(async move {
        while let Some(Ok(bytes)) = notifications.next().await {
            router.route(&bytes, 0);
        }
    });
    (transport, io)
}

fn tx() -> CharacteristicRef {
    CharacteristicRef::new("progressor", "tx")
}

#[tokio::test(start_paused = true)]
async fn test_write_resolves_on_late_ack() {
    let (transport, io) = progressor().await;

    let pusher = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        pusher.push(&ack_frame(0, b"1.4.7"));
    });

    let response = io
        .write("progressor", "tx", &Command::GetAppVersion, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(response.text(), "1.4.7");
    assert_eq!(io.mailbox().state(&tx()), SlotState::Idle);
    assert_eq!(transport.writes(), vec![(descriptor::PROGRESSOR_TX, vec![0x6b, 0])]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_clears_slot() {
    let (transport, io) = progressor().await;

    let err = io
        .write("progressor", "tx", &Command::GetBattery, Duration::from_millis(5000))
        .await
        .unwrap_err();
    assert_eq!(err, GripError::Timeout { timeout_ms: 5000 });
    assert_eq!(io.mailbox().state(&tx()), SlotState::Idle);

    transport.reply_to(&[0x6b, 0], vec![ack_frame(0, b"2.0")]);
    let response = io
        .write("progressor", "tx", &Command::GetAppVersion, Duration::from_millis(5000))
        .await
        .unwrap();
    assert_eq!(response.text(), "2.0");
}

#[tokio::test(start_paused = true)]
async fn test_second_command_refused_while_pending() {
    let (transport, io) = progressor().await;

    let first = {
        let io = io.clone();
        tokio::spawn(async move {
            io.write("progressor", "tx", &Command::TareScale, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(io.mailbox().state(&tx()), SlotState::AwaitingResponse);

    let err = io
        .write("progressor", "tx", &Command::GetBattery, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, GripError::CommandInFlight(_)));

    transport.push(&ack_frame(0, &[]));
    assert!(first.await.unwrap().unwrap().is_success());
    // Only the first command reached the device.
    assert_eq!(transport.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_ack_is_returned() {
    let (_, io) = progressor().await;
    let events = io.route(&ack_frame(3, &[]), 0);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_response());
}

#[tokio::test]
async fn test_read_conventions() {
    let (transport, io) = progressor().await;
    transport.set_read(BATTERY_LEVEL, &[87]);
    transport.set_read(PROGRESSOR_RX, &[0x01, 0x02]);

    assert_eq!(io.read("battery", "level").await.unwrap(), RawValue::Number(87));
    assert_eq!(
        io.read("progressor", "rx").await.unwrap(),
        RawValue::Bytes(vec![0x01, 0x02])
    );
}

#[tokio::test]
async fn test_read_text_characteristic() {
    let transport = Arc::new(MockTransport::new());
    let io = CharacteristicIo::new(transport.clone(), descriptor::uart_bridge());
    transport.set_read(descriptor::FIRMWARE_REVISION, b"2.6.1\0");
    assert_eq!(
        io.read("device", "firmware").await.unwrap(),
        RawValue::Text("2.6.1".to_string())
    );
}

#[tokio::test]
async fn test_unknown_characteristic_and_disconnected() {
    let (transport, io) = progressor().await;

    let err = io.read("progressor", "nope").await.unwrap_err();
    assert_eq!(
        err,
        GripError::UnknownCharacteristic {
            service: "progressor".to_string(),
            characteristic: "nope".to_string(),
        }
    );

    transport.drop_connection();
    assert_eq!(io.read("battery", "level").await.unwrap_err(), GripError::NotConnected);
    assert_eq!(
        io.write("progressor", "tx", &Command::GetBattery, Duration::from_secs(1))
            .await
            .unwrap_err(),
        GripError::NotConnected
    );
}

#[tokio::test]
async fn test_text_family_writes_are_not_acknowledged() {
    let transport = Arc::new(MockTransport::new());
    let io = CharacteristicIo::new(transport.clone(), descriptor::uart_bridge());
    let response = io
        .write("uart", "tx", &Command::StartWeightMeasurement, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.return_code, 0);
    assert_eq!(transport.writes(), vec![(descriptor::NORDIC_UART_WRITE, b"S30".to_vec())]);

    assert_eq!(
        io.write("uart", "tx", &Command::TareScale, Duration::from_secs(1))
            .await
            .unwrap_err(),
        GripError::Unsupported("TARE_SCALE")
    );
}

fn error_info_frame(text: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x03, text.len() as u8];
    frame.extend_from_slice(text);
    frame
}

#[tokio::test(start_paused = true)]
async fn test_error_info_answers_get_error_info() {
    let (transport, io) = progressor().await;
    transport.reply_to(&[0x6c, 0], vec![error_info_frame(b"E12")]);

    let response = io
        .write("progressor", "tx", &Command::GetErrorInfo, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response.text(), "E12");
}

#[tokio::test(start_paused = true)]
async fn test_error_info_fails_other_commands() {
    let (transport, io) = progressor().await;
    transport.reply_to(&[0x6f, 0], vec![error_info_frame(b"E7")]);

    let err = io
        .write("progressor", "tx", &Command::GetBattery, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, GripError::DeviceError("E7".to_string()));
    assert_eq!(io.mailbox().state(&tx()), SlotState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_low_power_warning_leaves_command_pending() {
    let (transport, io) = progressor().await;

    let pending = {
        let io = io.clone();
        tokio::spawn(async move {
            io.write("progressor", "tx", &Command::GetBattery, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(io.route(&[0x04, 0], 0), vec![DecodedEvent::LowPower]);
    assert_eq!(io.mailbox().state(&tx()), SlotState::AwaitingResponse);

    transport.push(&ack_frame(0, &[0x10, 0x0e]));
    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.payload, vec![0x10, 0x0e]);
}
