use clap::{value_t, values_t, App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use cycler_spoofer::channel::ScheduleName;
use cycler_spoofer::protocol::ChannelAck;
use cycler_spoofer::telemetry::SequenceCheck;
use cycler_spoofer::{
    ChannelId, ChannelState, ChannelStatus, ClientError, CyclerInterface, CyclerInterfaceConfig,
    FaultKind, SetPoint, Subscription, SystemInfo, TelemetryFrame,
};
use serde::Serialize;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_JSON_PORT: &str = "8001";
const DEFAULT_TCP_PORT: &str = "8002";
const DEFAULT_BUFFER_SIZE: &str = "4096";
const DEFAULT_TIMEOUT_MS: &str = "5000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Table,
    Json,
    Compact,
}

impl Format {
    fn parse(name: &str) -> Self {
        match name {
            "json" => Format::Json,
            "compact" => Format::Compact,
            _ => Format::Table,
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = app().get_matches();
    if let Err(e) = run(&matches).await {
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}

fn app() -> App<'static, 'static> {
    let channel_arg = || {
        Arg::with_name("channel")
            .help("Channel id")
            .required(true)
            .validator(|v| v.parse::<ChannelId>().map(|_| ()).map_err(|e| e.to_string()))
    };

    App::new("cyclerctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Command line client for a battery cycler")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Instrument address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("json-port")
                .long("json-port")
                .value_name("PORT")
                .help("JSON command port")
                .takes_value(true)
                .default_value(DEFAULT_JSON_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("tcp-port")
                .long("tcp-port")
                .value_name("PORT")
                .help("Binary telemetry port")
                .takes_value(true)
                .default_value(DEFAULT_TCP_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("buffer-size")
                .long("buffer-size")
                .value_name("BYTES")
                .help("Telemetry read buffer size")
                .takes_value(true)
                .default_value(DEFAULT_BUFFER_SIZE)
                .global(true),
        )
        .arg(
            Arg::with_name("timeout-ms")
                .long("timeout-ms")
                .value_name("MS")
                .help("Request timeout")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_MS)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("info").about("Show instrument identity and channel counts"))
        .subcommand(
            SubCommand::with_name("start")
                .about("Start or resume a channel")
                .arg(channel_arg())
                .arg(
                    Arg::with_name("current")
                        .long("current")
                        .value_name("AMPS")
                        .help("Set-point current; negative discharges")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("voltage-limit")
                        .long("voltage-limit")
                        .value_name("VOLTS")
                        .help("Voltage at which charging tapers")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("capacity-limit")
                        .long("capacity-limit")
                        .value_name("AH")
                        .help("Capacity at which the step ends")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("schedule")
                        .long("schedule")
                        .value_name("NAME")
                        .help("Schedule name recorded with the test")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("pause").about("Pause a running channel").arg(channel_arg()))
        .subcommand(SubCommand::with_name("stop").about("Stop a channel").arg(channel_arg()))
        .subcommand(
            SubCommand::with_name("reset")
                .about("Return a channel to Idle and clear its fault")
                .arg(channel_arg()),
        )
        .subcommand(
            SubCommand::with_name("fault")
                .about("Fault a channel")
                .arg(channel_arg())
                .arg(
                    Arg::with_name("kind")
                        .help("Fault kind")
                        .possible_values(&FaultKind::NAMES)
                        .default_value("external"),
                ),
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("Read a channel's state and latest measurement")
                .arg(channel_arg()),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream telemetry")
                .arg(
                    Arg::with_name("channels")
                        .help("Channels to watch; all when omitted")
                        .multiple(true),
                )
                .arg(
                    Arg::with_name("count")
                        .short("c")
                        .long("count")
                        .value_name("FRAMES")
                        .help("Stop after this many frames")
                        .takes_value(true),
                ),
        )
}

async fn run(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let config = CyclerInterfaceConfig {
        request_timeout_ms: value_t!(matches, "timeout-ms", u64)?,
        ..CyclerInterfaceConfig::new(
            matches.value_of("host").unwrap_or(DEFAULT_HOST),
            value_t!(matches, "json-port", u16)?,
            value_t!(matches, "tcp-port", u16)?,
            value_t!(matches, "buffer-size", usize)?,
        )
    };
    let format = Format::parse(matches.value_of("format").unwrap_or("table"));

    let mut cycler = CyclerInterface::connect(&config).await?;

    match matches.subcommand() {
        ("info", _) => print_system_info(&cycler.read_system_info().await?, format),
        ("start", Some(sub)) => {
            let channel = value_t!(sub, "channel", ChannelId)?;
            let ack = cycler.start_channel(channel, set_point(sub)?).await?;
            print_ack("start", &ack, format);
        }
        ("pause", Some(sub)) => {
            let ack = cycler.pause_channel(value_t!(sub, "channel", ChannelId)?).await?;
            print_ack("pause", &ack, format);
        }
        ("stop", Some(sub)) => {
            let ack = cycler.stop_channel(value_t!(sub, "channel", ChannelId)?).await?;
            print_ack("stop", &ack, format);
        }
        ("reset", Some(sub)) => {
            let ack = cycler.reset_channel(value_t!(sub, "channel", ChannelId)?).await?;
            print_ack("reset", &ack, format);
        }
        ("fault", Some(sub)) => {
            let channel = value_t!(sub, "channel", ChannelId)?;
            let kind: FaultKind = sub.value_of("kind").unwrap_or("external").parse()?;
            let ack = cycler.inject_fault(channel, kind).await?;
            print_ack("fault", &ack, format);
        }
        ("status", Some(sub)) => {
            let status = cycler.read_measurement(value_t!(sub, "channel", ChannelId)?).await?;
            print_status(&status, format);
        }
        ("monitor", Some(sub)) => monitor(&mut cycler, sub, format).await?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }

    Ok(())
}

fn set_point(matches: &ArgMatches<'_>) -> Result<SetPoint, Box<dyn std::error::Error>> {
    let mut set_point = SetPoint::constant_current(value_t!(matches, "current", f64)?);
    if matches.is_present("voltage-limit") {
        set_point = set_point.with_voltage_limit(value_t!(matches, "voltage-limit", f64)?);
    }
    if matches.is_present("capacity-limit") {
        set_point = set_point.with_capacity_limit(value_t!(matches, "capacity-limit", f64)?);
    }
    if let Some(name) = matches.value_of("schedule") {
        let schedule = ScheduleName::from(name)
            .map_err(|_| format!("schedule name `{name}` is too long"))?;
        set_point = set_point.with_schedule(schedule);
    }
    set_point.validate()?;
    Ok(set_point)
}

async fn monitor(
    cycler: &mut CyclerInterface,
    matches: &ArgMatches<'_>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let subscription = if matches.is_present("channels") {
        Subscription::Channels(values_t!(matches, "channels", ChannelId)?)
    } else {
        Subscription::All
    };
    let limit = if matches.is_present("count") {
        Some(value_t!(matches, "count", u64)?)
    } else {
        None
    };

    cycler.subscribe(&subscription).await?;
    if format == Format::Table {
        println!("{}", "Monitoring telemetry (Ctrl+C to stop)".bright_blue().bold());
        println!(
            "{:>4} {:>8} {:>8} {:>10} {:>9} {:>9} {:>10} {:>10} {:>6} {:>4}",
            "CH", "STATE", "SEQ", "TIME_S", "VOLTS", "AMPS", "AH", "WH", "CYCLE", "STEP"
        );
    }

    let mut received = 0u64;
    while limit.map_or(true, |limit| received < limit) {
        let (frame, check) = match cycler.next_frame().await {
            Ok(next) => next,
            // Nothing is running; keep waiting.
            Err(ClientError::Timeout(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        received += 1;
        print_frame(&frame, check, format)?;
    }

    let tracker = cycler.sequence_tracker();
    if format == Format::Table {
        println!(
            "{} {} frames, {} gaps ({} missed), {} stale",
            "Summary:".bright_white(),
            received,
            tracker.gap_count(),
            tracker.missed_count(),
            tracker.stale_count()
        );
    }
    Ok(())
}

fn colored_state(state: ChannelState) -> ColoredString {
    match state {
        ChannelState::Idle => state.as_str().dimmed(),
        ChannelState::Running => state.as_str().bright_green(),
        ChannelState::Paused => state.as_str().yellow(),
        ChannelState::Faulted => state.as_str().bright_red().bold(),
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("{} {}", "error:".bright_red(), e),
    }
}

fn print_ack(action: &str, ack: &ChannelAck, format: Format) {
    match format {
        Format::Json => print_json(ack),
        Format::Compact => println!("{} {} {}", ack.channel_id, action, ack.state),
        Format::Table => println!(
            "{} {} channel {} -> {}",
            "✅".green(),
            action.bright_white(),
            ack.channel_id,
            colored_state(ack.state)
        ),
    }
}

fn print_system_info(info: &SystemInfo, format: Format) {
    match format {
        Format::Json => print_json(info),
        Format::Compact => println!(
            "{} {} fw={} channels={} idle={} running={} paused={} faulted={}",
            info.model,
            info.serial_number,
            info.firmware_version,
            info.num_channels,
            info.channels.idle,
            info.channels.running,
            info.channels.paused,
            info.channels.faulted
        ),
        Format::Table => {
            println!("{}", "Instrument".bright_blue().bold());
            println!("  {:<18} {}", "Model:".bright_white(), info.model);
            println!("  {:<18} {}", "Serial:".bright_white(), info.serial_number);
            println!("  {:<18} {}", "Firmware:".bright_white(), info.firmware_version);
            println!("  {:<18} {}", "JSON port:".bright_white(), info.json_port);
            println!("  {:<18} {}", "Telemetry port:".bright_white(), info.tcp_port);
            println!(
                "  {:<18} {} bytes",
                "Message buffer:".bright_white(),
                info.msg_buffer_size_bytes
            );
            println!("{}", "Channels".bright_blue().bold());
            println!("  {:<18} {}", "Total:".bright_white(), info.num_channels);
            println!("  {:<18} {}", "Idle:".bright_white(), info.channels.idle);
            println!("  {:<18} {}", "Running:".bright_white(), info.channels.running.to_string().bright_green());
            println!("  {:<18} {}", "Paused:".bright_white(), info.channels.paused.to_string().yellow());
            println!("  {:<18} {}", "Faulted:".bright_white(), info.channels.faulted.to_string().bright_red());
        }
    }
}

fn print_status(status: &ChannelStatus, format: Format) {
    let m = &status.measurement;
    match format {
        Format::Json => print_json(status),
        Format::Compact => println!(
            "{} {} seq={} t={}ms v={:.4} i={:.4} ah={:.6} wh={:.6} cycle={} step={}",
            status.channel_id,
            status.state,
            status.sequence,
            m.test_time_ms,
            m.voltage_v,
            m.current_a,
            m.capacity_ah,
            m.energy_wh,
            m.cycle,
            m.step
        ),
        Format::Table => {
            println!("{} {}", "Channel".bright_blue().bold(), status.channel_id.to_string().bright_blue().bold());
            println!("  {:<14} {}", "State:".bright_white(), colored_state(status.state));
            if let Some(fault) = status.fault {
                println!("  {:<14} {}", "Fault:".bright_white(), fault.as_str().bright_red());
            }
            println!("  {:<14} {}", "Faults seen:".bright_white(), status.fault_count);
            if let Some(set_point) = &status.set_point {
                println!("  {:<14} {:.3} A", "Set-point:".bright_white(), set_point.current_a);
                if let Some(limit) = set_point.voltage_limit_v {
                    println!("  {:<14} {:.3} V", "Voltage limit:".bright_white(), limit);
                }
                if let Some(limit) = set_point.capacity_limit_ah {
                    println!("  {:<14} {:.3} Ah", "Capacity limit:".bright_white(), limit);
                }
                if let Some(schedule) = &set_point.schedule {
                    println!("  {:<14} {}", "Schedule:".bright_white(), schedule);
                }
            }
            println!("  {:<14} {}", "Sequence:".bright_white(), status.sequence);
            println!("  {:<14} {:.1} s", "Test time:".bright_white(), m.test_time_ms as f64 / 1000.0);
            println!("  {:<14} {:.4} V", "Voltage:".bright_white(), m.voltage_v);
            println!("  {:<14} {:.4} A", "Current:".bright_white(), m.current_a);
            println!("  {:<14} {:.6} Ah", "Capacity:".bright_white(), m.capacity_ah);
            println!("  {:<14} {:.6} Wh", "Energy:".bright_white(), m.energy_wh);
            println!("  {:<14} {} / step {}", "Cycle:".bright_white(), m.cycle, m.step);
        }
    }
}

#[derive(Serialize)]
struct FrameView<'a> {
    channel_id: ChannelId,
    state: ChannelState,
    sequence: u32,
    missed: u32,
    measurement: &'a cycler_spoofer::Measurement,
}

fn print_frame(
    frame: &TelemetryFrame,
    check: SequenceCheck,
    format: Format,
) -> Result<(), serde_json::Error> {
    let missed = match check {
        SequenceCheck::Gap { missed } => missed,
        _ => 0,
    };
    let m = &frame.measurement;
    match format {
        Format::Json => {
            let view = FrameView {
                channel_id: frame.channel_id,
                state: frame.state,
                sequence: frame.sequence,
                missed,
                measurement: m,
            };
            println!("{}", serde_json::to_string(&view)?);
        }
        Format::Compact => println!(
            "{} {} {} {:.4} {:.4} {:.6}",
            frame.channel_id, frame.sequence, m.test_time_ms, m.voltage_v, m.current_a, m.capacity_ah
        ),
        Format::Table => {
            let sequence = if missed > 0 {
                frame.sequence.to_string().yellow()
            } else {
                frame.sequence.to_string().normal()
            };
            println!(
                "{:>4} {:>8} {:>8} {:>10.1} {:>9.4} {:>9.4} {:>10.6} {:>10.6} {:>6} {:>4}",
                frame.channel_id,
                colored_state(frame.state),
                sequence,
                m.test_time_ms as f64 / 1000.0,
                m.voltage_v,
                m.current_a,
                m.capacity_ah,
                m.energy_wh,
                m.cycle,
                m.step
            );
        }
    }
    Ok(())
}
