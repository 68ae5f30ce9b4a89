use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loupedeck_link::{
    config::Config,
    device::{discover, vibration, DeviceManager, DeviceVariant},
    display::find_font,
    select_device, App,
};

#[derive(Parser, Debug)]
#[command(name = "loupedeck-link")]
#[command(about = "Serial driver for Loupedeck Live S and Razer Stream Controller")]
#[command(version)]
struct Cli {
    /// Serial port of the device (discovered by USB id when omitted)
    #[arg(long)]
    port: Option<String>,

    /// Device variant: live-s or razer-stream-controller
    #[arg(long)]
    variant: Option<DeviceVariant>,

    /// Override the variant's baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// List connected controllers and exit
    #[arg(long)]
    list: bool,

    /// Check device connection status and exit
    #[arg(long)]
    status: bool,

    /// Set device brightness (0-100)
    #[arg(long, value_name = "PERCENT")]
    brightness: Option<u8>,

    /// Play the default vibration pattern and exit
    #[arg(long)]
    vibrate: bool,

    /// Draw a text label on a key and exit
    #[arg(long, value_name = "TEXT")]
    label: Option<String>,

    /// Key for --label
    #[arg(long, default_value_t = 0)]
    key: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if cli.list {
        return list_devices();
    }

    // Load configuration, command line wins
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.device.port = Some(port);
    }
    if let Some(variant) = cli.variant {
        config.device.variant = variant;
    }
    if let Some(baud) = cli.baud {
        config.device.baud_rate = Some(baud);
    }

    if cli.status {
        return check_status(&config).await;
    }

    if let Some(brightness) = cli.brightness {
        return set_brightness(&config, brightness).await;
    }

    if cli.vibrate {
        return vibrate(&config).await;
    }

    if let Some(label) = cli.label {
        return draw_label(&config, cli.key, &label).await;
    }

    info!("Starting loupedeck-link");

    // Run the application with graceful shutdown
    let mut app = App::new(config).await?;

    // Set up signal handlers for graceful shutdown
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = sigterm.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    let result = tokio::select! {
        result = app.run() => {
            result
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    };

    // Always run shutdown
    app.shutdown().await;
    result
}

async fn connect(config: &Config) -> Result<DeviceManager> {
    let (port, variant) = select_device(config)?;
    let baud_rate = config.device.baud_rate.unwrap_or(variant.default_baud_rate());
    let manager = DeviceManager::connect(port, baud_rate, variant, config.link_config()).await?;
    Ok(manager)
}

fn list_devices() -> Result<()> {
    let devices = discover()?;
    if devices.is_empty() {
        println!("✗ No compatible device found");
        return Ok(());
    }

    for device in devices {
        println!("✓ {} on {}", device.variant, device.port);
        if let Some(serial) = device.serial_number {
            println!("  Serial: {}", serial);
        }
        if let Some(product) = device.product {
            println!("  Product: {}", product);
        }
    }
    Ok(())
}

async fn check_status(config: &Config) -> Result<()> {
    info!("Checking device status...");

    let manager = match connect(config).await {
        Ok(manager) => manager,
        Err(e) => {
            println!("✗ No device found: {}", e);
            std::process::exit(1);
        }
    };

    let info = manager.get_info().await;
    manager.close().await;
    let info = info?;

    println!("✓ Device found: {}", manager.variant());
    println!("  Port: {}", manager.port_name());
    println!("  Firmware: {}", info.version);
    println!("  Serial: {}", info.serial);
    Ok(())
}

async fn set_brightness(config: &Config, brightness: u8) -> Result<()> {
    let brightness = brightness.min(100);
    info!("Setting brightness to {}%", brightness);

    let manager = connect(config).await?;
    let result = manager.set_brightness(brightness as f64 / 100.0).await;
    manager.close().await;
    result?;
    println!("✓ Brightness set to {}%", brightness);
    Ok(())
}

async fn vibrate(config: &Config) -> Result<()> {
    let manager = connect(config).await?;
    let result = manager.vibrate(vibration::DEFAULT).await;
    manager.close().await;
    result?;
    println!("✓ Vibration sent");
    Ok(())
}

async fn draw_label(config: &Config, key: usize, label: &str) -> Result<()> {
    let font = find_font(config.display.font_path.as_deref())?;
    let manager = connect(config).await?;
    manager.set_font(font);
    let result = manager.draw_text_key(key, label).await;
    manager.close().await;
    result?;
    println!("✓ Drew \"{}\" on key {}", label, key);
    Ok(())
}
