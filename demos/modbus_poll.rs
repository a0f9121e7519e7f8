// ABOUTME: Example application polling holding registers from a Modbus TCP server
// ABOUTME: Demonstrates the Modbus protocol layer and the multi-register value helpers

use argh::FromArgs;
use instrio::protocol::modbus::{Modbus, RegisterLayout};
use instrio::{Adapter, Descriptor};
use std::error::Error;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Poll holding registers from a Modbus TCP server.
#[derive(FromArgs)]
struct CliArgs {
    /// enable debug logging of the worker and transport
    #[argh(switch, short = 'd')]
    debug: bool,

    /// server hostname or IP address
    #[argh(option)]
    host: String,

    /// TCP port (default: 502)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// unit identifier (default: 255)
    #[argh(option, short = 'u')]
    unit: Option<u8>,

    /// first register address, 1-based (default: 1)
    #[argh(option, short = 'a')]
    address: Option<u16>,

    /// number of registers to read (default: 4)
    #[argh(option, short = 'n')]
    count: Option<u16>,

    /// poll interval in milliseconds; 0 reads once (default: 0)
    #[argh(option, short = 'i')]
    interval: Option<u64>,
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

    let mut server = Modbus::new(Adapter::new(descriptor))
        .await?
        .with_unit_id(args.unit.unwrap_or(0xFF));
    server.adapter().open().await?;

    let address = args.address.unwrap_or(1);
    let count = args.count.unwrap_or(4);
    let interval = args.interval.unwrap_or(0);
    let layout = RegisterLayout::default();

    loop {
        let registers = server.read_holding_registers(address, count).await?;
        print!("registers {address}..{}:", address + count - 1);
        for value in &registers {
            print!(" {value:#06x}");
        }
        if registers.len() == 2 {
            print!("  (as f32: {})", layout.decode_f32(&registers)?);
        }
        println!();

        if interval == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(interval)).await;
    }
    Ok(())
}
