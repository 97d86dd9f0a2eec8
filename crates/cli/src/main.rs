use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use rtsp::{Codec, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

mod feeder;

use feeder::Feeder;

#[derive(Parser)]
#[command(
    name = "rtsp-live",
    about = "Standalone RTSP server for live H.264/H.265 streams"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Annex-B elementary stream to publish
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Codec of the input stream (h264 or h265)
    #[arg(long, default_value = "h264")]
    codec: Codec,

    /// Frames per second used to pace the input
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Maximum concurrent clients (0 = unlimited)
    #[arg(long, default_value_t = 32)]
    max_clients: usize,

    /// Seconds of silence before a session is evicted
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,

    /// Host advertised in SDP instead of the request host
    #[arg(long)]
    public_host: Option<String>,

    /// Publish the input once instead of looping
    #[arg(long)]
    no_loop: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::default()
        .bind(&args.bind)
        .max_clients(args.max_clients)
        .session_timeout(Duration::from_secs(args.session_timeout.max(1)));
    if let Some(host) = &args.public_host {
        config = config.public_host(host);
    }

    let feeder = match &args.input {
        Some(path) => match std::fs::read(path) {
            Ok(data) => Some(Feeder::from_annexb(args.codec, &data, args.fps, !args.no_loop)),
            Err(e) => {
                eprintln!("Failed to read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let mut server = Server::new(config);
    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        std::process::exit(1);
    }
    let addr = server.local_addr().map(|a| a.to_string()).unwrap_or(args.bind.clone());
    let server = Arc::new(server);

    let stop = Arc::new(AtomicBool::new(false));
    let publisher = match feeder {
        Some(feeder) => match feeder.spawn(server.clone(), stop.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("Failed to start feeder: {}", e);
                None
            }
        },
        None => None,
    };

    println!("RTSP server on rtsp://{addr}/stream, press Enter to stop");
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed");
    }

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = publisher {
        let _ = handle.join();
    }

    let stats = server.stats();
    match Arc::try_unwrap(server) {
        Ok(mut server) => server.stop(),
        Err(_) => tracing::warn!("server still shared at shutdown"),
    }

    println!(
        "served {} packets ({} bytes) from {} access units; {} dropped, {} sessions evicted, up {:.1}s",
        stats.total_packets_sent,
        stats.total_bytes_sent,
        stats.access_units_received,
        stats.access_units_dropped,
        stats.sessions_evicted,
        stats.uptime.as_secs_f64()
    );
}
