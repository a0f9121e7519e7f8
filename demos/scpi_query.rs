// ABOUTME: Example application sending one SCPI query to an instrument and printing the reply
// ABOUTME: Shows the async adapter + Scpi protocol flow with optional debug logging

use argh::FromArgs;
use instrio::protocol::Scpi;
use instrio::{Adapter, Descriptor};
use std::error::Error;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Send one SCPI command to an instrument and print the response.
#[derive(FromArgs)]
struct CliArgs {
    /// enable debug logging of the worker and transport
    #[argh(switch, short = 'd')]
    debug: bool,

    /// instrument hostname or IP address
    #[argh(option)]
    host: String,

    /// TCP port (default: 5025)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the SCPI command to send (default: *IDN?)
    #[argh(option, short = 'c')]
    command: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: CliArgs = argh::from_env();

    let level = if args.debug { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let descriptor = match args.port {
        Some(port) => Descriptor::tcp(args.host, port),
        None => Descriptor::tcp_host(args.host),
    };

    let instrument = Scpi::new(Adapter::new(descriptor)).await?;
    instrument.open().await?;

    let command = args.command.unwrap_or_else(|| "*IDN?".to_owned());
    let response = instrument.query(&command).await?;
    println!("{response}");

    instrument.close().await?;
    Ok(())
}
