use std::sync::Arc;
use std::time::Duration;

use gripsense::decoder::{ack_frame, weight_frame};
use gripsense::descriptor;
use gripsense::mock_transport::MockTransport;
use gripsense::protocol::PeakForceOptions;
use gripsense::{DeviceConfig, ForceDevice};

/// Replays a synthetic five second pull through a mock progressor and prints
/// the peak force result.
#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt().init();

    let transport = Arc::new(MockTransport::new());
    let pull: Vec<(u32, f32)> = (0..80)
        .map(|i| {
            let t = i as f32 / 10.0;
            (if i == 0 { 0 } else { 100 }, 45.0 * (t / 8.0 * std::f32::consts::PI).sin())
        })
        .collect();
    let mut notifications = vec![ack_frame(0, &[])];
    notifications.extend(pull.chunks(20).map(weight_frame));
    transport.reply_to(&[0x65, 0], notifications);
    transport.reply_to(&[0x66, 0], vec![ack_frame(0, &[])]);

    let device = ForceDevice::attach(transport, descriptor::progressor(), DeviceConfig::default())
        .await
        .unwrap();
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        device.run_peak_force_mvc(PeakForceOptions {
            countdown_ms: 1000,
            ..PeakForceOptions::default()
        }),
    )
    .await
    .unwrap()
    .unwrap();
    println!("{}", serde_json::to_string_pretty(&outcome).unwrap());
}
