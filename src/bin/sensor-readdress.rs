//! Sensor Readdress CLI
//!
//! Changes the Modbus unit id of an interlocked RS-485 level sensor.
//!
//! Usage:
//!   sensor-readdress --port /dev/ttyUSB0 update --new 7
//!   sensor-readdress --port /dev/ttyUSB0 update --current 5 --new 7 --yes
//!   sensor-readdress --port COM3 discover
//!   sensor-readdress --port COM3 measure --unit 7
//!   sensor-readdress --simulate 5 update --new 7 --yes

use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sensor_readdress::{
    retry, DistanceProbe, IdUpdateWorkflow, IdentityProbe, ModbusTransport, RetryPolicy,
    SensorSession, SimulatedSensor, StartingUnit, UnitId, WorkflowConfig,
};
use tracing::info;

/// Reassign the unit id of an interlocked RS-485 level sensor.
#[derive(Parser, Debug)]
#[command(name = "sensor-readdress")]
#[command(about = "Safely changes the Modbus unit id of an RS-485 level sensor")]
#[command(version)]
struct Args {
    /// Serial port (/dev/<something> or COM<number>)
    #[arg(short, long, required_unless_present = "simulate")]
    port: Option<String>,

    /// Baud rate
    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Per-call response timeout in milliseconds
    #[arg(long, default_value_t = 100)]
    timeout_ms: u64,

    /// Run against a simulated sensor answering on this id instead of a port
    #[arg(long, conflicts_with = "port")]
    simulate: Option<UnitId>,

    /// Log every RTU frame
    #[arg(long)]
    packet_log: bool,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Move the sensor to a new unit id
    Update {
        /// Current unit id (0-254); scans the bus when omitted
        #[arg(long)]
        current: Option<UnitId>,

        /// New unit id (0-254)
        #[arg(long)]
        new: UnitId,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Delay between attempts of a stage, in milliseconds
        #[arg(long, default_value_t = 100)]
        retry_delay_ms: u64,

        /// Skip the distance read after a successful update
        #[arg(long)]
        no_measure: bool,
    },

    /// Scan unit ids 0-254 for the sensor
    Discover,

    /// Read the distance register, retrying like the post-update check
    Measure {
        /// Unit id to address
        #[arg(long)]
        unit: UnitId,
    },
}

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

fn open_transport(args: &Args) -> Result<Box<dyn ModbusTransport>> {
    if let Some(unit) = args.simulate {
        info!(unit = unit.get(), "Using simulated sensor");
        return Ok(Box::new(SimulatedSensor::new(unit)));
    }

    let port = args.port.as_deref().context("--port is required")?;
    open_port(port, args)
}

#[cfg(feature = "rtu")]
fn open_port(port: &str, args: &Args) -> Result<Box<dyn ModbusTransport>> {
    let config = sensor_readdress::SerialConfig::new(port)
        .with_baud_rate(args.baud)
        .with_timeout(Duration::from_millis(args.timeout_ms));
    let mut transport = sensor_readdress::open_serial(&config)
        .with_context(|| format!("Could not connect to {} port", port))?;
    transport.set_packet_logging(args.packet_log);
    Ok(Box::new(transport))
}

#[cfg(not(feature = "rtu"))]
fn open_port(port: &str, _args: &Args) -> Result<Box<dyn ModbusTransport>> {
    bail!("Cannot open {}: built without the `rtu` feature", port)
}

/// Scan the bus for the sensor. The session closes before returning.
fn discover(transport: &mut Box<dyn ModbusTransport>) -> Result<UnitId> {
    let mut session =
        SensorSession::open(transport).context("Could not connect to the transport")?;
    Ok(IdentityProbe::find_unit_id(session.transport())?)
}

fn confirm(port: &str, current: StartingUnit, new: UnitId) -> Result<bool> {
    let mut stdout = std::io::stdout();
    write!(
        stdout,
        "\nConfirm:\n\tPort={}\n\tCurrent unit id={}\n\tNew unit id={}\nOk? (y/n): ",
        port, current, new
    )?;
    stdout.flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let port_label = args
        .port
        .clone()
        .unwrap_or_else(|| "<simulated>".to_string());

    match args.command.clone() {
        Command::Update {
            current,
            new,
            yes,
            retry_delay_ms,
            no_measure,
        } => {
            info!("Initializing...");
            let mut transport = open_transport(&args)?;
            let current = match current {
                Some(unit) => unit,
                None => {
                    let found = discover(&mut transport)?;
                    println!("Sensor found on unit id {}", found);
                    found
                }
            };
            let current = StartingUnit::Known(current);
            if !yes && !confirm(&port_label, current, new)? {
                info!("Aborted by operator, nothing was written");
                return Ok(());
            }

            let config = WorkflowConfig::new()
                .with_retry_delay(Duration::from_millis(retry_delay_ms))
                .with_sanity_measurement(!no_measure);

            let report = IdUpdateWorkflow::new(config).run(transport, current, new);

            info!(
                elapsed_ms = report.elapsed().num_milliseconds(),
                requests = report.stats.requests_sent,
                "Run finished"
            );
            if !report.outcome.is_success() {
                bail!("Unit id update {}", report.outcome);
            }
            println!("Finished: {}", report.outcome);
        }

        Command::Discover => {
            let unit = discover(&mut open_transport(&args)?)?;
            println!("Sensor found on unit id {}", unit);
        }

        Command::Measure { unit } => {
            let mut session = SensorSession::open(open_transport(&args)?)
                .context("Could not connect to the transport")?;
            let distance = retry(&RetryPolicy::default(), |_| {
                DistanceProbe::measure(session.transport(), unit)
            })
            .with_context(|| format!("Could not read distance from unit {}", unit))?;
            println!("Distance = {:.1} cm", distance);
        }
    }

    Ok(())
}
