use std::{error::Error, net::SocketAddr, path::PathBuf, sync::Arc, thread};

use clap::Parser;
use courier::{
    CancellationToken, ChannelConfig, Context, FramedPipeline, Incoming, Listener, Runtime,
    Worker,
    cancel::DEFAULT_POLL_INTERVAL,
    channel::{listener::PipelineFactory, transport::PlainFactory},
    space::Entry,
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Path to a JSON channel configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Threads running I/O completions
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ChannelConfig::load(path)?,
        None => ChannelConfig {
            name: String::from("courier"),
            ..ChannelConfig::default()
        },
    };
    config.local_address = Some(cli.address.to_string());

    let token = CancellationToken::new();
    let stop = token.clone();
    ctrlc::set_handler(move || stop.cancel())?;

    let max_frame_size = config.max_frame_size;
    let pipelines: PipelineFactory<FramedPipeline> =
        Arc::new(move || FramedPipeline::new(max_frame_size));
    let inbound: Arc<Context<Incoming<FramedPipeline>>> = Arc::new(Context::new("inbound"));

    let runtime = Runtime::new(cli.workers.max(1));
    let mut listener = Listener::bind(
        config,
        pipelines,
        Arc::new(PlainFactory),
        runtime,
        Arc::clone(&inbound),
    )?;

    let mut echo = Worker::spawn(
        "echo",
        inbound,
        DEFAULT_POLL_INTERVAL,
        |entry: Entry<Incoming<FramedPipeline>>| {
            let incoming = entry.into_value();
            info!("echoing {} bytes", incoming.message().body.len());
            incoming.reply(incoming.message().clone());
        },
    )?;

    while !token.is_cancelled() {
        thread::sleep(DEFAULT_POLL_INTERVAL);
    }

    info!("shutting down");
    echo.stop();
    listener.shutdown();
    Ok(())
}
