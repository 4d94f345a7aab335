use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

use voice_duplex::audio::DeviceEvent;
use voice_duplex::config::Config;
use voice_duplex::controller::{CoreController, SystemBackend};
use voice_duplex::net_link::{NetCommand, NetEvent, NetLink, session_url};
use voice_duplex::session::SessionConfig;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::load()?;
    let url = session_url(&config.server, &config.audio)?;

    let (tx_net_event, mut rx_net_event) = mpsc::channel::<NetEvent>(config.queues.net_events);
    let (tx_net_cmd, rx_net_cmd) = mpsc::channel::<NetCommand>(config.queues.net_commands);
    let (tx_device_event, mut rx_device_event) =
        mpsc::channel::<DeviceEvent>(config.queues.device_events);

    let net_link = NetLink::new(url.clone(), tx_net_event, rx_net_cmd);
    let net_handle = tokio::spawn(net_link.run());

    let mut controller = CoreController::new(
        SystemBackend::new(config.audio.clone()),
        SessionConfig::from_config(&config),
        tx_net_cmd,
        tx_device_event,
    );

    log::info!("Voice client started, server {}", url);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            Some(event) = rx_net_event.recv() => {
                controller.handle_net_event(event).await;
            }
            Some(event) = rx_device_event.recv() => {
                controller.handle_device_event(event).await;
            }
            else => break,
        }
    }

    controller.shutdown();
    // Dropping the controller closes the command queue, which stops the link
    drop(controller);
    match tokio::time::timeout(SHUTDOWN_GRACE, net_handle).await {
        Ok(Err(e)) => log::error!("Net link task failed: {}", e),
        Ok(Ok(())) => {}
        Err(_) => log::warn!("Net link did not stop within {:?}", SHUTDOWN_GRACE),
    }
    Ok(())
}
