// ABOUTME: Command-line client binary
// ABOUTME: Argument parsing, logging setup and lifecycle glue

use anyhow::Result;
use clap::Parser;

use snapclient::audio::output::{AudioSink, CpalOutput};
use snapclient::controller::{ClientConfig, Controller, SinkBuilder};

/// Synchronized multi-room audio streaming client
#[derive(Parser, Debug)]
#[command(name = "snapclient")]
#[command(about = "Connect to a broadcast server and play audio in sync", long_about = None)]
struct Args {
    /// Server host name or address
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(long, default_value_t = 1704)]
    port: u16,

    /// Stable client id reported to the server (defaults to the MAC)
    #[arg(long)]
    host_id: Option<String>,

    /// Instance id, distinguishes several clients on one host
    #[arg(long, default_value_t = 1)]
    instance: u32,

    /// MAC address reported to the server
    #[arg(long)]
    mac: Option<String>,

    /// Local output latency compensation in milliseconds
    #[arg(long, default_value_t = 0)]
    latency_ms: i32,

    /// Output device name (the system default if omitted)
    #[arg(long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ClientConfig::new(args.host, args.port);
    config.host_id = args.host_id;
    config.instance = args.instance;
    config.mac = args.mac;
    config.latency_ms = args.latency_ms;

    let device = args.device;
    let sink_builder: SinkBuilder = Box::new(move |_format| {
        let sink: Box<dyn AudioSink> = match &device {
            Some(name) => Box::new(CpalOutput::with_device(name.clone())),
            None => Box::new(CpalOutput::new()),
        };
        Ok(sink)
    });

    let controller = Controller::new(config, sink_builder);
    controller.start();
    log::info!("client started; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    controller.stop().await;
    Ok(())
}
