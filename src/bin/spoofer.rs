use clap::{value_t, App, Arg, ArgMatches};
use cycler_spoofer::config::SpooferConfigBuilder;
use cycler_spoofer::CyclerSpoofer;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cycler-spoofer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Battery cycler emulator serving JSON commands and binary telemetry")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; flags override its values")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("server-ip")
                .long("server-ip")
                .value_name("IP")
                .help("Address both servers bind to")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("json-port")
                .long("json-port")
                .value_name("PORT")
                .help("JSON command port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tcp-port")
                .long("tcp-port")
                .value_name("PORT")
                .help("Binary telemetry port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("num-channels")
                .short("n")
                .long("num-channels")
                .value_name("COUNT")
                .help("Number of emulated channels")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("msg-buffer-size")
                .long("msg-buffer-size")
                .value_name("BYTES")
                .help("Largest telemetry batch in bytes")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Simulation tick period")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("telemetry-ms")
                .long("telemetry-ms")
                .value_name("MS")
                .help("Telemetry send period")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("write-timeout-ms")
                .long("write-timeout-ms")
                .value_name("MS")
                .help("Drop clients whose writes stall this long")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let base = match matches.value_of("config") {
        Some(path) => SpooferConfigBuilder::from_file(path)?,
        None => SpooferConfigBuilder::new(),
    };
    let config = base.overlay(overrides(&matches)?).build()?;

    let handle = CyclerSpoofer::new(config)?.start().await?;
    println!("cycler-spoofer listening");
    println!("  json commands:    {}", handle.json_addr);
    println!("  binary telemetry: {}", handle.telemetry_addr);

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    handle.shutdown().await;

    Ok(())
}

fn overrides(matches: &ArgMatches<'_>) -> Result<SpooferConfigBuilder, clap::Error> {
    Ok(SpooferConfigBuilder {
        server_ip: optional(matches, "server-ip", || value_t!(matches, "server-ip", std::net::IpAddr))?,
        json_port: optional(matches, "json-port", || value_t!(matches, "json-port", u16))?,
        tcp_port: optional(matches, "tcp-port", || value_t!(matches, "tcp-port", u16))?,
        num_channels: optional(matches, "num-channels", || value_t!(matches, "num-channels", u16))?,
        msg_buffer_size_bytes: optional(matches, "msg-buffer-size", || {
            value_t!(matches, "msg-buffer-size", usize)
        })?,
        tick_period_ms: optional(matches, "tick-ms", || value_t!(matches, "tick-ms", u64))?,
        telemetry_period_ms: optional(matches, "telemetry-ms", || {
            value_t!(matches, "telemetry-ms", u64)
        })?,
        write_timeout_ms: optional(matches, "write-timeout-ms", || {
            value_t!(matches, "write-timeout-ms", u64)
        })?,
        fault_injection: None,
    })
}

fn optional<T>(
    matches: &ArgMatches<'_>,
    name: &str,
    parse: impl FnOnce() -> Result<T, clap::Error>,
) -> Result<Option<T>, clap::Error> {
    if matches.is_present(name) {
        parse().map(Some)
    } else {
        Ok(None)
    }
}
