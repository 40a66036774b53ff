use clap::{command, Parser};
use jcmp_relay::{common::box_error::BoxError, server, utils};

#[derive(Parser)]
#[command(version, about = "real time MIDI relay server", long_about = None)]
struct Args {
    /// listen port for signaling and status (overrides settings.json)
    #[arg(short, long)]
    port: Option<u32>,
}

fn main() -> Result<(), BoxError> {
    // Turn on the logger.  JCMP_DEBUG=1 pulls the default level down to
    // debug so the per-event timing logs show up; RUST_LOG still wins.
    let mut builder = env_logger::Builder::new();
    if utils::debug_events_enabled() {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.parse_default_env();
    builder.init();

    let args = Args::parse();
    server::run(args.port)?;
    Ok(())
}
