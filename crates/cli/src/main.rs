//! lusb
//!
//! Command line tool for inspecting and talking to USB devices through the
//! host library.

mod commands;
mod output;
mod selector;

use anyhow::{Context as _, Result, bail};
use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand};
use commands::{ControlArgs, EndpointTarget};
use common::{LusbConfig, setup_logging};
use host::{Context, Payload};
use selector::{Selector, parse_hex_bytes, parse_ids, parse_slot, parse_u8, parse_u16};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "lusb")]
#[command(author, version, about = "Inspect and talk to USB devices")]
#[command(long_about = "
Enumerate USB devices, dump their descriptors and strings, and run control,
bulk and interrupt transfers from the command line.

EXAMPLES:
    # List attached devices
    lusb list

    # Dump all descriptors of a device as JSON
    lusb --json describe -d 1234:5678

    # Read up to 64 bytes from bulk endpoint 0x81 of the device at bus 1 address 4
    lusb read -s 1:4 --endpoint 0x81 --length 64 --interface 0

    # GET_STATUS on the device
    lusb control -d 1234:5678 --request-type 0x80 --request 0 --length 2

CONFIGURATION:
    Settings are read from, in order:
    1. Path specified with --config
    2. ~/.config/lusb/lusb.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Library debug level (0 none .. 4 debug)
    #[arg(long, value_name = "LEVEL")]
    debug: Option<u8>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    List,

    /// Print device and configuration descriptors
    Describe {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Print manufacturer, product and serial number strings
    Strings {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Issue a control request on endpoint 0
    Control {
        #[command(flatten)]
        device: DeviceArgs,

        /// bmRequestType; bit 7 set means device-to-host
        #[arg(long, value_parser = parse_u8)]
        request_type: u8,

        /// bRequest
        #[arg(long, value_parser = parse_u8)]
        request: u8,

        /// wValue
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        value: u16,

        /// wIndex
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        index: u16,

        /// Bytes to read for IN requests
        #[arg(long, default_value_t = 0)]
        length: usize,

        /// Hex data to send for OUT requests
        #[arg(long, value_parser = parse_hex_bytes)]
        data: Option<Vec<u8>>,

        /// Timeout in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Read from a bulk or interrupt IN endpoint
    Read {
        #[command(flatten)]
        device: DeviceArgs,

        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Maximum bytes to read
        #[arg(long, default_value_t = 64)]
        length: usize,
    },

    /// Write to a bulk or interrupt OUT endpoint
    Write {
        #[command(flatten)]
        device: DeviceArgs,

        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Hex data to send
        #[arg(long, value_parser = parse_hex_bytes)]
        data: Vec<u8>,
    },
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct DeviceArgs {
    /// Select by vendor and product id (hex VID:PID)
    #[arg(short = 'd', long = "device", value_name = "VID:PID", value_parser = parse_ids)]
    ids: Option<(u16, u16)>,

    /// Select by bus and device address (decimal BUS:ADDRESS)
    #[arg(short = 's', long = "slot", value_name = "BUS:ADDRESS", value_parser = parse_slot)]
    slot: Option<(u8, u8)>,
}

impl DeviceArgs {
    fn selector(&self) -> Result<Selector> {
        match (self.ids, self.slot) {
            (Some((vendor_id, product_id)), _) => Ok(Selector::Ids {
                vendor_id,
                product_id,
            }),
            (None, Some((bus, address))) => Ok(Selector::Slot { bus, address }),
            (None, None) => bail!("Select a device with --device or --slot"),
        }
    }
}

#[derive(ClapArgs, Debug)]
struct EndpointArgs {
    /// Endpoint address, e.g. 0x81
    #[arg(long, value_parser = parse_u8)]
    endpoint: u8,

    /// Interface to claim for the duration of the transfer
    #[arg(long)]
    interface: Option<u8>,

    /// Use an interrupt transfer instead of bulk
    #[arg(long)]
    interrupt: bool,

    /// Detach an active kernel driver from the interface first
    #[arg(long)]
    detach: bool,

    /// Timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,
}

impl EndpointArgs {
    fn target(&self, default_timeout: Duration) -> EndpointTarget {
        EndpointTarget {
            endpoint: self.endpoint,
            interface: self.interface,
            interrupt: self.interrupt,
            detach: self.detach,
            timeout: self
                .timeout_ms
                .map_or(default_timeout, Duration::from_millis),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = LusbConfig::default();
        let path = LusbConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            LusbConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => LusbConfig::load_or_default(),
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;
    debug!("lusb v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let context = Context::with_config(&config).context("Failed to initialize USB context")?;
    if let Some(level) = args.debug {
        context.set_debug(level)?;
    }

    let result = run(&context, command, &config, args.json);
    context.exit();
    result
}

fn run(context: &Context, command: Command, config: &LusbConfig, json: bool) -> Result<()> {
    let default_timeout = config.transfers.default_timeout();

    match command {
        Command::List => commands::list(context, json),
        Command::Describe { device } => commands::describe(context, device.selector()?, json),
        Command::Strings { device } => commands::strings(context, device.selector()?, json),
        Command::Control {
            device,
            request_type,
            request,
            value,
            index,
            length,
            data,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map_or(default_timeout, Duration::from_millis);
            let args = ControlArgs {
                request_type,
                request,
                value,
                index,
            };
            let payload = match (request_type & 0x80 != 0, data.as_deref()) {
                (true, _) => Payload::Length(length),
                (false, Some(bytes)) => Payload::Bytes(bytes),
                (false, None) => Payload::Length(0),
            };
            info!(
                "Control request 0x{:02x}/0x{:02x} to {}",
                request_type,
                request,
                device.selector()?
            );
            commands::control(context, device.selector()?, args, payload, timeout, json)
        }
        Command::Read {
            device,
            endpoint,
            length,
        } => commands::read(
            context,
            device.selector()?,
            endpoint.target(default_timeout),
            length,
            json,
        ),
        Command::Write {
            device,
            endpoint,
            data,
        } => commands::write(
            context,
            device.selector()?,
            endpoint.target(default_timeout),
            &data,
            json,
        ),
    }
}
