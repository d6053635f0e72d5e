use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};

use trackerd::host::{ResetKind, TrackerHost};
use trackerd::server::{ServerConfig, TrackerServer};
use trackerd::tracker::Tracker;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = 6969)]
    port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

/// A host that just logs what the devices are doing. Enough to watch real
///  trackers connect and stream.
#[derive(Default)]
struct LoggingHost {
    next_id: AtomicU32,
}

impl TrackerHost for LoggingHost {
    fn next_tracker_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn tracker_added(&self, tracker: Arc<Tracker>) {
        info!(
            id = tracker.id,
            name = %tracker.name,
            description = %tracker.description,
            "tracker added"
        );
    }

    fn console_line(&self, line: &str) {
        info!("{}", line);
    }

    fn reset_started(&self, kind: ResetKind) {
        info!(%kind, "reset started");
    }

    fn reset_full(&self, source: &str) {
        info!(source, "full reset");
    }

    fn reset_yaw(&self, source: &str) {
        info!(source, "yaw reset");
    }

    fn reset_mounting(&self, source: &str) {
        info!(source, "mounting reset");
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let server = TrackerServer::new(ServerConfig::new(args.port), Arc::new(LoggingHost::default())).await?;
    server.run().await
}
