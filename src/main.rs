use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use log::{error, info, warn, LevelFilter};

use tcmurfs::{
    Controller, DeviceTable, GatewayFs, HandlerRegistry, IoBridge, Vft, DEFAULT_CTL_NAME,
    DEFAULT_HANDLER_PREFIX, DEFAULT_MOUNTPOINT,
};

#[derive(Parser)]
#[command(version, about = "Expose pluggable block-storage handlers as files over FUSE")]
struct Args {
    /// Where to mount the gateway filesystem
    #[arg(long, default_value = DEFAULT_MOUNTPOINT)]
    mountpoint: PathBuf,

    /// Name of the control node under /dev
    #[arg(long, default_value = DEFAULT_CTL_NAME)]
    ctl_name: String,

    /// Path prefix handler modules are loaded from
    #[arg(long, default_value = DEFAULT_HANDLER_PREFIX)]
    handler_prefix: String,

    /// Control script to source once the filesystem is up
    #[arg(long)]
    script: Option<PathBuf>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Unmount automatically when the process exits
    #[arg(long)]
    auto_unmount: bool,

    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn prepare_mountpoint(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    if unsafe { libc::getuid() } == 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    prepare_mountpoint(&args.mountpoint)?;
    let mountpoint = args
        .mountpoint
        .to_str()
        .ok_or("mountpoint must be valid UTF-8")?;

    let tree = Arc::new(Vft::new());
    tree.init(mountpoint)?;
    let registry = Arc::new(HandlerRegistry::new(args.handler_prefix.clone()));
    let devices = Arc::new(DeviceTable::new(registry.clone()));
    let bridge = Arc::new(IoBridge::new(devices.clone()));
    let ctl = Controller::new(tree.clone(), registry.clone(), devices, bridge);
    ctl.install(&args.ctl_name)?;

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctl.set_shutdown(shutdown_tx);

    let mut options = vec![
        MountOption::FSName("tcmurfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }
    if args.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    let session = fuser::spawn_mount2(GatewayFs::new(tree.clone()), &args.mountpoint, &options)?;
    info!("mounted at {}", args.mountpoint.display());

    if let Some(script) = &args.script {
        ctl.write(format!("source {}\n", script.display()).as_bytes());
    }

    // Parked until the control channel's exit command fires.
    let _ = shutdown_rx.recv();
    info!("shutting down");
    drop(session);

    ctl.teardown(&args.ctl_name);
    if let Err(e) = tree.exit() {
        warn!("tree not empty at shutdown: {}", e);
    }
    if registry.shutdown().is_err() {
        warn!("handlers were still loaded at shutdown");
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
