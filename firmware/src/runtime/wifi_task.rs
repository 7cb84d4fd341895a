use button_core::connectivity::LinkParams;
use defmt::{info, warn};
use embassy_futures::select::{Either, select};
use embassy_net::{Runner, Stack};
use embassy_time::{Duration, Timer, WithTimeout};
use esp_radio::wifi::{ClientConfig, ModeConfig, ScanConfig, WifiController, WifiDevice, WifiError};

use super::{WIFI, WIFI_PASSWORD, WIFI_SSID};
use crate::mailbox::WifiCommand;

const DHCP_TIMEOUT: Duration = Duration::from_secs(15);
const LINK_CHECK: Duration = Duration::from_secs(1);

#[derive(defmt::Format)]
enum JoinError {
    NoCredentials,
    NotFound,
    Radio(WifiError),
    Dhcp,
}

impl From<WifiError> for JoinError {
    fn from(err: WifiError) -> Self {
        Self::Radio(err)
    }
}

#[embassy_executor::task]
pub async fn net_runner(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

/// Serves [`WifiCommand`]s and reports association state back to the
/// connectivity machine.
#[embassy_executor::task]
pub async fn run(mut controller: WifiController<'static>, stack: Stack<'static>) -> ! {
    let mut up = false;
    loop {
        let command = if up {
            match select(WIFI.next_command(), Timer::after(LINK_CHECK)).await {
                Either::First(command) => Some(command),
                Either::Second(()) => None,
            }
        } else {
            Some(WIFI.next_command().await)
        };

        match command {
            Some(WifiCommand::Begin(pinned)) => {
                up = false;
                match associate(&mut controller, stack, pinned).await {
                    Ok(joined) => {
                        info!(
                            "wifi: up bssid={=[u8]:02x} channel={=u8} pinned={=bool}",
                            joined.bssid[..],
                            joined.channel,
                            pinned.is_some()
                        );
                        WIFI.report_up(Some(joined));
                        up = true;
                    }
                    // The connectivity machine times the attempt out.
                    Err(err) => warn!("wifi: join failed: {}", err),
                }
            }
            Some(WifiCommand::Disconnect { erase }) => {
                up = false;
                WIFI.report_down();
                let _ = controller.disconnect_async().await;
                let _ = controller.stop_async().await;
                info!("wifi: stopped erase={=bool}", erase);
            }
            None => {
                if !stack.is_link_up() || stack.config_v4().is_none() {
                    warn!("wifi: link lost");
                    up = false;
                    WIFI.report_down();
                }
            }
        }
    }
}

fn client_config(target: Option<LinkParams>) -> ClientConfig {
    let config = ClientConfig::default()
        .with_ssid(WIFI_SSID.into())
        .with_password(WIFI_PASSWORD.into());
    match target {
        Some(params) => config.with_bssid(params.bssid).with_channel(params.channel),
        None => config,
    }
}

async fn associate(
    controller: &mut WifiController<'static>,
    stack: Stack<'static>,
    pinned: Option<LinkParams>,
) -> Result<LinkParams, JoinError> {
    if WIFI_SSID.is_empty() {
        return Err(JoinError::NoCredentials);
    }
    if matches!(controller.is_connected(), Ok(true)) {
        let _ = controller.disconnect_async().await;
    }
    if !matches!(controller.is_started(), Ok(true)) {
        controller.set_config(&ModeConfig::Client(client_config(pinned)))?;
        controller.start_async().await?;
    }

    let target = match pinned {
        Some(params) => params,
        None => strongest_access_point(controller).await?,
    };
    controller.set_config(&ModeConfig::Client(client_config(Some(target))))?;
    controller.connect_async().await?;
    stack
        .wait_config_up()
        .with_timeout(DHCP_TIMEOUT)
        .await
        .map_err(|_| JoinError::Dhcp)?;
    Ok(target)
}

/// Full scan; picks the strongest access point advertising the SSID so the
/// address and channel can be cached for the next quick connect.
async fn strongest_access_point(
    controller: &mut WifiController<'static>,
) -> Result<LinkParams, JoinError> {
    let results = controller
        .scan_with_config_async(ScanConfig::default())
        .await?;
    results
        .iter()
        .filter(|ap| ap.ssid == WIFI_SSID)
        .max_by_key(|ap| ap.signal_strength)
        .map(|ap| LinkParams {
            bssid: ap.bssid,
            channel: ap.channel,
        })
        .ok_or(JoinError::NotFound)
}
