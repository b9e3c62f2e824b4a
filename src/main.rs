//! `hwc-ctl`: drives one display through the composer backend for bring-up and debugging.
//!
//! Commands that need a frame commit an empty frame, so run this only while no compositor
//! holds DRM master.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use exynos_hwc::backend::drm::card::DrmCard;
use exynos_hwc::backend::drm::device::KmsDevice;
use exynos_hwc::backend::drm::types::{Frame, PowerMode};
use exynos_hwc::backend::drm::{DisplayDrmInterface, DisplayTarget, PlaneReservations};
use exynos_hwc::brightness::CabcMode;
use exynos_hwc::capability::DisplayCollaborators;
use exynos_hwc::context::HwcContext;
use hwc_config::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "exynos_hwc=info,hwc_config=info";

#[derive(Parser)]
#[command(name = "hwc-ctl")]
#[command(about = "Exynos DRM composer backend control")]
struct Cli {
    /// DRM card to open.
    #[arg(long, default_value = "/dev/dri/card0")]
    card: PathBuf,

    /// Path to the config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print display, mode and brightness state
    Info,
    /// Set the display brightness, 0.0 to 1.0
    Brightness { value: f32 },
    /// Turn local HBM on or off
    Lhbm { state: Toggle },
    /// Turn enhanced global HBM on or off
    Ghbm { state: Toggle },
    /// Set the content adaptive backlight mode
    Cabc { mode: Cabc },
    /// Check whether a display config would be accepted, without applying it
    TestConfig { id: u32 },
    /// Switch to a display config
    SetConfig { id: u32 },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn is_on(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Cabc {
    Off,
    User,
    Still,
    Movie,
}

impl From<Cabc> for CabcMode {
    fn from(mode: Cabc) -> Self {
        match mode {
            Cabc::Off => CabcMode::Off,
            Cabc::User => CabcMode::User,
            Cabc::Still => CabcMode::Still,
            Cabc::Movie => CabcMode::Movie,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    let path = Config::resolve_path(cli.config);
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            warn!("{err:?}");
            warn!("using the default config");
            Config::default()
        }
    };
    let ctx = HwcContext::new(config);

    let card = Arc::new(DrmCard::open(&cli.card)?);
    let res = card.resources().context("error getting DRM resources")?;
    let target =
        DisplayTarget::primary(&res).ok_or_else(|| anyhow!("no connected display found"))?;

    let mut display = DisplayDrmInterface::new(
        card,
        ctx,
        target,
        PlaneReservations::new(),
        DisplayCollaborators::default(),
    )?;

    match cli.command {
        Command::Info => {
            print!("{}", display.dump());
            return Ok(());
        }
        Command::TestConfig { id } => {
            display.set_active_config(id, true)?;
            info!("config {id} accepted");
            return Ok(());
        }
        _ => (),
    }

    display.set_power_mode(PowerMode::On)?;
    let brightness = display.brightness();
    match cli.command {
        Command::Brightness { value } => brightness.process_display_brightness(value, 0, true)?,
        Command::Lhbm { state } => brightness.process_local_hbm(state.is_on())?,
        Command::Ghbm { state } => brightness.process_enhanced_hbm(state.is_on())?,
        Command::Cabc { mode } => {
            brightness.process_cabc(mode.into())?;
            brightness.apply_pending_cabc()?;
        }
        Command::SetConfig { id } => display.set_active_config(id, false)?,
        Command::Info | Command::TestConfig { .. } => return Ok(()),
    }

    display.deliver_win_config_data(&Frame::default())?;
    print!("{}", display.dump());
    Ok(())
}
