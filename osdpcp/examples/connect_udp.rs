//! Poll a single PD behind a UDP bridge

use std::time::Duration;

use osdpcp::{ControlPanel, Event, PdInfo, PollingControlPanel};
use osdpcp_transport::UdpChannel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // Change to your bridge address
    let ip = std::env::var("OSDP_BRIDGE_IP").unwrap_or_else(|_| "192.168.1.50".to_string());

    println!("Connecting to {} via UDP...", ip);
    let mut channel = UdpChannel::new(ip, 4001);
    channel.connect().await?;

    let mut cp = ControlPanel::new(Box::new(channel));
    let reader = cp.register(PdInfo::builder().address(1).name("front-door").build()?)?;

    let mut pcp = PollingControlPanel::new(cp);
    pcp.start()?;

    if !pcp.online_wait(reader.address(), Duration::from_secs(5)).await? {
        println!("PD did not answer");
        pcp.teardown().await;
        return Ok(());
    }

    pcp.with_control_panel(|cp| {
        if let Some(id) = cp.pd_id(reader) {
            println!("Online: {}", id);
        }
    });

    // Print card reads for a minute
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, pcp.next_event()).await {
        match event.event {
            Event::CardRead { data, length, .. } => {
                println!("Card: {} ({} bits)", hex::encode(&data), length)
            }
            Event::Offline => println!("PD went offline"),
            other => println!("{:?}", other),
        }
    }

    pcp.teardown().await;
    Ok(())
}
