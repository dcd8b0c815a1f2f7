use std::{
    error::Error,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use courier::{
    Channel, ChannelConfig, Context, Envelope, FramedPipeline, Incoming, Outcome, Request,
    Runtime, channel::transport::PlainFactory,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address (`host:port`)
    address: String,
    /// Payload sent with every request
    #[arg(default_value = "ping")]
    payload: String,
    /// Number of requests to send
    #[arg(short, long, default_value_t = 1)]
    count: usize,
    /// Milliseconds to wait for each response
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ChannelConfig {
        name: String::from("courier-client"),
        remote_address: Some(cli.address),
        ..ChannelConfig::default()
    };
    let connect_timeout = config.connect_timeout();
    let pipeline = FramedPipeline::new(config.max_frame_size);
    let inbound: Arc<Context<Incoming<FramedPipeline>>> = Arc::new(Context::new("inbound"));

    let channel = Channel::new(
        config,
        pipeline,
        Arc::new(PlainFactory),
        Runtime::new(2),
        inbound,
    )?;

    let connected = channel.connect();
    if connected.wait_completion(Some(connect_timeout), true) != Outcome::Succeeded {
        let reason = connected.message().unwrap_or_else(|| "timed out".into());
        return Err(format!("connect failed: {reason}").into());
    }

    let timeout = Duration::from_millis(cli.timeout_ms);
    for i in 0..cli.count {
        let key = format!("{i:06}");
        let envelope = Envelope::keyed(key.clone(), cli.payload.as_bytes());
        let request = Request::new(Some(key.clone()), envelope, timeout);

        let started = Instant::now();
        channel.request(&request);
        match request.wait_response(None) {
            Ok(response) => println!(
                "{key}: {} bytes in {:?}",
                response.body.len(),
                started.elapsed()
            ),
            Err(e) => eprintln!("{key}: {e}"),
        }
    }

    channel.close();
    Ok(())
}
