//! Headless debug runner: start an embedded X11 display and log protocol
//! traffic. Point an X11 client at it with `DISPLAY=127.0.0.1:<n>`.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use x11host::DisplayRegistry;

#[derive(Parser)]
#[command(name = "x11host")]
#[command(about = "Embedded X11 server hosting plugin GUIs on a virtual display")]
#[command(version)]
struct Cli {
    /// Display number (TCP port = 6000 + number)
    #[arg(short, long, default_value = "10")]
    display: u32,

    /// Virtual surface width
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Virtual surface height
    #[arg(long, default_value = "720")]
    height: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(cli.display);
    display.attach_headless(cli.width, cli.height)?;
    eprintln!(
        "x11host ready - DISPLAY=127.0.0.1:{} ({}x{}, headless)",
        cli.display, cli.width, cli.height
    );

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
