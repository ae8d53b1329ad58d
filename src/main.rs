use std::sync::Arc;

use anyhow::anyhow;
use gripsense::{BluestTransport, DeviceConfig, ForceDevice, TestResult};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: gripsense [stream [ms] | tare | activity | rfd | critical-force | peak-force | battery]

environment:
  GRIPSENSE_DEVICE  progressor (default), motherboard or scale
  GRIPSENSE_CONFIG  path to a JSON settings file
  RUST_LOG          log filter, e.g. gripsense=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = args.first().map(String::as_str).unwrap_or("stream");

    let descriptor = match std::env::var("GRIPSENSE_DEVICE").as_deref() {
        Ok("progressor") | Err(_) => gripsense::descriptor::progressor(),
        Ok("motherboard") => gripsense::descriptor::uart_bridge(),
        Ok("scale") => gripsense::descriptor::passive_scale(),
        Ok(other) => return Err(anyhow!("unknown device {other:?}\n\n{USAGE}")),
    };
    let config = match std::env::var("GRIPSENSE_CONFIG") {
        Ok(path) => DeviceConfig::from_file(path)?,
        Err(_) => DeviceConfig::default(),
    };

    info!("looking for {}", descriptor.name);
    let transport = Arc::new(BluestTransport::connect(&descriptor).await?);
    let device = ForceDevice::attach(transport, descriptor, config).await?;

    let options = device.config().clone();
    match action {
        "stream" => {
            let duration_ms = args.get(1).map(|ms| ms.parse::<u64>()).transpose()?;
            device
                .stream(
                    |m| println!("{}", serde_json::to_string(m).unwrap_or_default()),
                    duration_ms,
                )
                .await?;
        }
        "tare" => {
            let outcome = device.tare(options.tare_duration_ms).await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        "activity" => {
            let outcome = device
                .run_activity_monitor(options.rfd.threshold, options.rfd.duration_ms, |activity| {
                    println!("{activity:?}")
                })
                .await?;
            info!("activity monitor ended: {outcome:?}");
        }
        "rfd" => {
            if let Some(result) = device.run_rfd(options.rfd).await?.complete() {
                println!("{}", serde_json::to_string(&TestResult::Rfd(result))?);
            }
        }
        "critical-force" => {
            if let Some(result) = device.run_critical_force(options.critical_force).await?.complete() {
                println!("{}", serde_json::to_string(&TestResult::CriticalForce(result))?);
            }
        }
        "peak-force" => {
            if let Some(result) = device.run_peak_force_mvc(options.peak_force).await?.complete() {
                println!("{}", serde_json::to_string(&TestResult::PeakForce(result))?);
            }
        }
        "battery" => println!("{}%", device.read_battery_level().await?),
        other => return Err(anyhow!("unknown action {other:?}\n\n{USAGE}")),
    }

    device.disconnect().await?;
    Ok(())
}
