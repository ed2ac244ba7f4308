//! Command-line entry points for the two telemetry peers.
//!
//! The `companion` role binds the telemetry port, echoes stamped packets back
//! to the motor controller, and feeds the encoder rates into the particle
//! filter; the `controller` role simulates the motor-controller side of the
//! link by running transactions against a companion at a fixed rate. Running
//! both roles on one machine gives a full closed loop over loopback.

use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};

use groundtrack::particle::{DEFAULT_NUM_SAMPLES, ParticleFilter};
use groundtrack::sim::{EstimateRecord, drive_profile};
use groundtrack::telemetry::{
    PACKET_SIZE, START_SIGNAL, STOP_SIGNAL, TELEMETRY_PORT, TelemetryPacket,
};
use groundtrack::udp::{TransportError, UdpTelemetryClient, UdpTelemetryServer};
use groundtrack::{ChassisGeometry, DEFAULT_TRACK_WIDTH, EncoderData, RobotState};

const LONG_ABOUT: &str = "GROUNDTRACK: particle-filter localization over encoder telemetry.

This program runs either peer of the telemetry link:

- companion: binds the telemetry port, stamps and echoes each encoder packet
  back to its sender, and advances the particle filter with the received
  rates. The estimate history can be written to a CSV trace for analysis.

- controller: simulates the real-time motor controller by driving a canned
  wheel-speed profile through telemetry transactions at a fixed rate and
  reporting the measured one-way latency.";

/// Command line arguments
#[derive(Parser)]
#[command(
    name = "groundtrack",
    about = "Particle-filter localization over encoder telemetry.",
    long_about = LONG_ABOUT
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand)]
enum Command {
    #[command(about = "Run the companion-node estimator loop")]
    Companion(CompanionArgs),
    #[command(about = "Run the controller-side telemetry loop")]
    Controller(ControllerArgs),
}

#[derive(Args)]
struct CompanionArgs {
    /// Number of particles in the filter population
    #[arg(long, default_value_t = DEFAULT_NUM_SAMPLES)]
    particles: usize,

    /// Random seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Drive base track width in meters
    #[arg(long, default_value_t = DEFAULT_TRACK_WIDTH)]
    track_width: f64,

    /// UDP port to listen on
    #[arg(long, default_value_t = TELEMETRY_PORT)]
    port: u16,

    /// Receive timeout per telemetry cycle in seconds
    #[arg(long, default_value_t = 0.1)]
    timeout: f64,

    /// Block until a start signal arrives before entering the periodic loop
    #[arg(long)]
    wait_for_start: bool,

    /// Write the estimate history to this CSV file on shutdown
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ControllerArgs {
    /// Companion node hostname
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Companion node port
    #[arg(long, default_value_t = TELEMETRY_PORT)]
    port: u16,

    /// Telemetry rate in Hz
    #[arg(long, default_value_t = 50.0)]
    rate: f64,

    /// How long to drive the profile, in seconds
    #[arg(long, default_value_t = 12.0)]
    duration: f64,

    /// Receive timeout per transaction in seconds
    #[arg(long, default_value_t = 1.0)]
    timeout: f64,

    /// Send start/stop control signals around the telemetry session
    #[arg(long)]
    send_signals: bool,
}

/// Initialize the logger with the specified configuration.
///
/// # Errors
/// Returns an error if the log file cannot be opened or logger
/// initialization fails.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Companion-node estimator loop: echo stamped telemetry, advance the filter.
fn run_companion(args: &CompanionArgs) -> Result<(), Box<dyn Error>> {
    if args.timeout <= 0.0 {
        return Err("the periodic telemetry loop requires a positive --timeout".into());
    }

    let server = UdpTelemetryServer::bind_to(args.port)?;
    info!("telemetry server listening on {}", server.local_addr()?);

    if args.wait_for_start {
        // A one-shot control-signal wait may block indefinitely; the
        // periodic loop below may not
        server.set_timeout(None)?;
        info!("waiting for start signal");
        let mut signal = [0u8; 1];
        loop {
            let (received, peer) = server.read(&mut signal)?;
            if received == 1 && signal[0] == START_SIGNAL {
                info!("start signal from {}", peer);
                break;
            }
        }
    }
    server.set_timeout(Some(Duration::from_secs_f64(args.timeout)))?;

    let geometry = ChassisGeometry::new(args.track_width);
    let mut filter = match args.seed {
        Some(seed) => ParticleFilter::new_with_seed(args.particles, geometry, seed),
        None => ParticleFilter::new(args.particles, geometry),
    };
    info!(
        "filter initialized with {} particles, track width {} m",
        args.particles, args.track_width
    );

    let mut last_control = EncoderData::new();
    let mut last_send_time: Option<f64> = None;
    let mut latency = 0.0;
    let mut records = Vec::new();
    let mut buffer = [0u8; 2 * PACKET_SIZE];

    loop {
        let (control, dt) = match server.read(&mut buffer) {
            Ok((1, peer)) => match buffer[0] {
                STOP_SIGNAL => {
                    info!("stop signal from {}", peer);
                    break;
                }
                START_SIGNAL => continue,
                other => {
                    warn!("unknown control signal {:#04x} from {}", other, peer);
                    continue;
                }
            },
            Ok((received, peer)) if received == PACKET_SIZE => {
                let mut bytes = [0u8; PACKET_SIZE];
                bytes.copy_from_slice(&buffer[..PACKET_SIZE]);
                let mut packet = TelemetryPacket::from_bytes(&bytes);
                packet.stamp_recv_time();
                if let Err(err) = server.send_to(&packet.to_bytes(), peer) {
                    warn!("failed to echo telemetry to {}: {}", peer, err);
                }
                latency = packet.one_way_latency();

                // Cycle period from consecutive controller clocks, immune to
                // companion-side scheduling jitter
                let control = EncoderData::from(&packet);
                match last_send_time.replace(packet.controller_send_time) {
                    Some(previous) => {
                        let dt = packet.controller_send_time - previous;
                        if dt <= 0.0 {
                            warn!("out-of-order telemetry (dt = {:.4} s), skipping cycle", dt);
                            continue;
                        }
                        (control, dt)
                    }
                    None => {
                        // First packet establishes the time base
                        last_control = control;
                        continue;
                    }
                }
            }
            Ok((received, peer)) => {
                warn!(
                    "discarding {}-byte datagram from {} (expected {} or 1)",
                    received, peer, PACKET_SIZE
                );
                continue;
            }
            Err(TransportError::Timeout) => {
                // No reading this cycle: coast on the previous control for
                // one nominal period
                debug!("telemetry timeout, predicting with previous control");
                (last_control, args.timeout)
            }
            Err(err) => {
                error!("receive failed: {}", err);
                continue;
            }
        };

        if control.is_stationary() {
            // Both wheels idle: pin the derivative states instead of letting
            // process noise diffuse the population
            filter.zero_velocity_update();
        } else {
            filter.predict(&control, dt);
        }
        last_control = control;

        let estimate = RobotState::from_vector(&filter.get_estimate());
        debug!("{}", estimate);
        records.push(EstimateRecord::from_estimate(
            Utc::now(),
            &estimate,
            &control,
            filter.effective_sample_size(),
            latency,
        ));
    }

    if let Some(path) = &args.output {
        EstimateRecord::to_csv(&records, path)?;
        info!("wrote {} estimate rows to {}", records.len(), path.display());
    }
    Ok(())
}

/// Controller-side loop: drive the canned profile through transactions.
fn run_controller(args: &ControllerArgs) -> Result<(), Box<dyn Error>> {
    if args.rate <= 0.0 {
        return Err("--rate must be positive".into());
    }

    let client = UdpTelemetryClient::connect(&args.host, args.port)?;
    // A periodic transaction loop must never block indefinitely
    client.set_timeout(Some(Duration::from_secs_f64(args.timeout)))?;
    info!("sending telemetry to {}", client.companion_addr());

    if args.send_signals {
        client.send(&[START_SIGNAL])?;
    }

    let period = Duration::from_secs_f64(1.0 / args.rate);
    let cycles = (args.duration * args.rate).ceil() as usize;
    let mut missed = 0usize;
    for cycle in 0..cycles {
        let elapsed = cycle as f64 * period.as_secs_f64();
        let control = drive_profile(elapsed);
        let packet = TelemetryPacket::new(control.left_rate, control.right_rate);
        match client.transaction(packet) {
            Ok(reply) => {
                debug!(
                    "cycle {}: one-way latency {:.2} ms",
                    cycle,
                    reply.one_way_latency() * 1e3
                );
            }
            Err(TransportError::Timeout) => {
                missed += 1;
                debug!("cycle {}: no echo", cycle);
            }
            Err(TransportError::SizeMismatch { expected, received }) => {
                warn!(
                    "cycle {}: invalid reply size ({} bytes, expected {})",
                    cycle, received, expected
                );
            }
            Err(err) => {
                warn!("cycle {}: transaction failed: {}", cycle, err);
            }
        }
        thread::sleep(period);
    }

    if args.send_signals {
        client.send(&[STOP_SIGNAL])?;
    }
    info!("completed {} cycles, {} without an echo", cycles, missed);
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logger(&cli.log_level, cli.log_file.as_ref()) {
        eprintln!("failed to initialize logger: {}", err);
    }

    let result = match &cli.command {
        Command::Companion(args) => run_companion(args),
        Command::Controller(args) => run_controller(args),
    };
    if let Err(err) = result {
        error!("{}", err);
        std::process::exit(1);
    }
}
