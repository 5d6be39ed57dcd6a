use anyhow::{bail, Context};
use clap::Parser;
use eudebug::debugger::{
    ApiEvent, ApiEventKind, DebugSession, DeviceTopology, Error, HwLayout, RootSession,
    SessionConfig, Status, SysTransport,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// DRM device node of the GPU.
    #[arg(long, default_value = "/dev/dri/card0")]
    device: PathBuf,

    /// Pid of the debugged process.
    #[arg(long)]
    pid: u32,

    /// Session config file, `~/.config/eudebug/session.toml` if not set.
    #[arg(long, env = "EUDEBUG_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for the debuggee to start GPU work.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Acknowledge every event that needs it right after printing.
    #[arg(long)]
    auto_ack: bool,

    /// Attach a session per tile instead of the root one.
    #[arg(long)]
    tiles: bool,

    #[arg(long, default_value_t = 1)]
    tile_count: u32,

    #[arg(long, default_value_t = 1)]
    slices: u32,

    #[arg(long, default_value_t = 8)]
    subslices_per_slice: u32,

    #[arg(long, default_value_t = 16)]
    eus_per_subslice: u32,

    #[arg(long, default_value_t = 8)]
    threads_per_eu: u32,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone())?;

    let mut config = SessionConfig::load(args.config.as_deref());
    config.enable_tile_attach |= args.tiles;

    let (transport, version) = SysTransport::connect(&args.device, args.pid)
        .with_context(|| format!("attach to pid {} through {:?}", args.pid, args.device))?;
    let topology = DeviceTopology::new(
        args.tile_count,
        HwLayout {
            slices: args.slices,
            subslices_per_slice: args.subslices_per_slice,
            eus_per_subslice: args.eus_per_subslice,
            threads_per_eu: args.threads_per_eu,
        },
    );
    let mut root = RootSession::new(Arc::new(transport), Arc::new(topology), config, version);
    println!("protocol version {version}, ack mode: {}", root.ack_mode());

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    loop {
        match root.initialize() {
            Ok(()) => break,
            Err(Error::NotReady) if Instant::now() < deadline && !stop.load(Ordering::SeqCst) => {
                continue
            }
            Err(e) => bail!("session initialization: {e}"),
        }
    }
    println!("session initialized");

    let tiles = root.tile_sessions().to_vec();
    for tile in &tiles {
        tile.attach()?;
    }
    let sessions: Vec<DebugSession> = if tiles.is_empty() {
        vec![DebugSession::Root(&mut root)]
    } else {
        tiles.iter().map(DebugSession::Tile).collect()
    };

    while !stop.load(Ordering::SeqCst) {
        for (idx, session) in sessions.iter().enumerate() {
            let event = match session.read_event(Duration::from_millis(100)) {
                Ok(event) => event,
                Err(e) if e.status() == Status::NotReady => continue,
                Err(e) => bail!("read event: {e}"),
            };
            if session.is_tile() {
                println!("[tile {idx}] {event}");
            } else {
                println!("{event}");
            }
            if args.auto_ack && event.need_ack {
                session.acknowledge_event(&event)?;
            }
            if is_final(&event) {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Nothing to wait for after these.
fn is_final(event: &ApiEvent) -> bool {
    matches!(
        event.kind,
        ApiEventKind::Detached { .. } | ApiEventKind::ProcessExit
    )
}
