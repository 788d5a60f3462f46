//! ShoeLink demonstration
//!
//! Finds a shoe, connects, authenticates with the PIN from `SHOELINK_PIN`
//! and lists the wallets it holds.

use anyhow::{bail, Context};
use shoelink::{gesture, DeviceEvent, ShoeClient, ShoeLinkConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting ShoeLink demonstration...");

    let config = load_config()?;
    let client = ShoeClient::with_central(config).await?;

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DeviceEvent::DeviceLocked => warn!("🔒 Device locked"),
                DeviceEvent::SessionExpired => warn!("⏰ Session expired, authenticate again"),
                DeviceEvent::Disconnected { error: Some(e) } => warn!("📴 Disconnected: {}", e),
                _ => {}
            }
        }
    });

    info!("🔍 Scanning for shoes...");
    let devices = client.discover().await?;
    let Some(shoe) = devices.into_iter().next() else {
        bail!("No shoe found nearby");
    };
    info!("🎯 Found {}", shoe.name);

    client.connect(shoe).await.context("connecting to shoe")?;

    let pin = std::env::var("SHOELINK_PIN").context("SHOELINK_PIN is not set")?;
    match client.authenticate(&pin).await {
        Ok(outcome) => info!("✅ Authenticated ({:?})", outcome.message),
        Err(e) => {
            error!("❌ Authentication failed: {}", e);
            client.destroy().await;
            return Err(e.into());
        }
    }

    match client.list_wallets().await {
        Ok(wallets) if wallets.is_empty() => info!("No wallets on device yet"),
        Ok(wallets) => {
            for wallet in wallets {
                info!("   #{} {}", wallet.index, shoelink::wallet::truncate_address(&wallet.address, 6, 4));
            }
        }
        Err(e) if e.is_timeout() => warn!("⏰ Shoe did not answer the wallet list in time"),
        Err(e) => error!("❌ Failed to list wallets: {}", e),
    }

    let saved = client.get_saved_gesture().await?;
    if saved.is_empty() {
        let challenge = gesture::AuthChallenge::random();
        if let Some(morse) = challenge.expected_morse() {
            info!("No gesture saved; try tapping {} as {}", challenge.as_wire(), morse);
        }
    } else {
        info!("Device has a saved gesture ({} symbols)", saved.len());
    }

    info!("📊 {:?}", client.connection_status().await);
    client.destroy().await;
    Ok(())
}

#[cfg(feature = "config-file")]
fn load_config() -> anyhow::Result<ShoeLinkConfig> {
    let path = std::env::var("SHOELINK_CONFIG").ok().map(std::path::PathBuf::from);
    ShoeLinkConfig::load(path.as_deref()).context("loading configuration")
}

#[cfg(not(feature = "config-file"))]
fn load_config() -> anyhow::Result<ShoeLinkConfig> {
    Ok(ShoeLinkConfig::default())
}
