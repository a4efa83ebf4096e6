// Rekey CLI
// Daemon bootstrap: key interception and substitution from the command line

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use rekey_core::{
    EvdevHook, KeyHook, KeyResolver, Remapper, RemapperEvent, Storage, X11GrabHook,
};

#[derive(Parser, Debug)]
#[command(name = "rekey")]
#[command(version = "0.2.1")]
#[command(about = "Intercept key presses and substitute different keys", long_about = None)]
struct Args {
    /// Interception backend
    #[arg(short, long, value_enum, default_value_t = Backend::Evdev)]
    backend: Backend,

    /// Directory holding mappings.json (defaults to ~/.config/rekey)
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// List detected keyboard devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    /// Grab raw input devices and mirror through a virtual keyboard
    Evdev,
    /// Ask the display server to route grabbed combinations only
    X11,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if args.list_devices {
        return list_devices();
    }

    let mut storage = match &args.config_dir {
        Some(dir) => Storage::with_dir(dir.clone()),
        None => Storage::new(),
    };
    let enable_on_startup = storage.get_bool("enable_on_startup", true);
    let resolver = Arc::new(KeyResolver::new());
    let hook: Arc<dyn KeyHook> = match args.backend {
        Backend::Evdev => Arc::new(EvdevHook::new()),
        Backend::X11 => Arc::new(X11GrabHook::new()),
    };

    let mut remapper = Remapper::new(Arc::clone(&hook), storage, resolver);
    let events = remapper.subscribe();

    remapper
        .start()
        .context("could not start the key hook; check device/display permissions")?;
    remapper.load();
    if !enable_on_startup {
        log::info!("enable_on_startup is off; disabling all mappings");
        remapper.disable_all();
    }
    log::info!(
        "rekey running with {} mapping(s) active ({:?} backend)",
        remapper.active_count(),
        args.backend
    );

    let stop_requested = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop_requested))
            .context("could not install signal handler")?;
    }

    while !stop_requested.load(Ordering::SeqCst) {
        hook.dispatch_pending(Duration::from_millis(100));
        while let Ok(event) = events.try_recv() {
            log_event(&event);
        }
    }

    log::info!("Shutting down");
    remapper.stop();
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let keyboards = EvdevHook::list_keyboards();
    if keyboards.is_empty() {
        println!("No keyboard devices found (do you have permission on /dev/input?)");
        return Ok(());
    }
    println!("Found {} keyboard device(s):", keyboards.len());
    for (path, name) in keyboards {
        println!("  {}: {}", path.display(), name);
    }
    Ok(())
}

fn log_event(event: &RemapperEvent) {
    match event {
        RemapperEvent::MappingAdded(mapping) => {
            log::info!("Mapping active: {} (id {})", mapping.description, mapping.id)
        }
        RemapperEvent::MappingRemoved(id) => log::info!("Mapping removed: {}", id),
        RemapperEvent::MappingToggled { id, enabled } => {
            log::info!("Mapping {}: {}", if *enabled { "enabled" } else { "disabled" }, id)
        }
        RemapperEvent::Error(message) => log::error!("{}", message),
    }
}
