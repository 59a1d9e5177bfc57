//! Secure channel and reader control over RS-485

use std::time::Duration;

use osdpcp::{
    BuzzerControl, Command, ControlPanel, LedControl, LedParams, PdInfo, PollingControlPanel,
};
use osdpcp_transport::{SerialChannel, SerialConfig};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let port = std::env::var("OSDP_PORT").unwrap_or_else(|_| "/dev/ttyUSB0".to_string());
    let channel = SerialChannel::open(SerialConfig::new(port, 115200))?;

    let mut cp = ControlPanel::new(Box::new(channel));
    let info = PdInfo::builder()
        .address(101)
        .baud_rate(115200)
        .secure_channel_key(&[
            0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D,
            0x3E, 0x3F,
        ])?
        .build()?;
    cp.register(info)?;

    let mut pcp = PollingControlPanel::new(cp);
    pcp.start()?;

    if !pcp.sc_wait(101, Duration::from_secs(10)).await? {
        println!("Secure channel not established");
        pcp.teardown().await;
        return Ok(());
    }
    println!("Secure channel active");

    // Green LED for two seconds
    let green = LedParams {
        control_code: 2,
        on_count: 10,
        off_count: 0,
        on_color: 2,
        off_color: 0,
        timer_count: 20,
    };
    pcp.send_command(
        101,
        Command::LedControl(LedControl {
            reader: 0,
            led_number: 0,
            temporary: green,
            permanent: LedParams::default(),
        }),
    )?;
    sleep(Duration::from_millis(200)).await;

    // Two short beeps
    pcp.send_command(
        101,
        Command::BuzzerControl(BuzzerControl {
            reader: 0,
            control_code: 2,
            on_count: 2,
            off_count: 2,
            rep_count: 2,
        }),
    )?;
    sleep(Duration::from_secs(2)).await;

    for event in pcp.drain_events() {
        println!("PD {}: {:?}", event.address, event.event);
    }

    println!("Done!");
    pcp.teardown().await;
    Ok(())
}
