use breaker_panel::protocol::{encode_command, Command, WireFormat};
use breaker_panel::telemetry::{TelemetryDecoder, TelemetryFrame};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const BREAKER_COLUMNS: usize = 3;
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let index_arg = || {
        Arg::with_name("index")
            .help("Breaker index (0 is the overall breaker)")
            .required(true)
            .validator(|v| match v.parse::<u8>() {
                Ok(_) => Ok(()),
                Err(_) => Err("Index must be a number between 0 and 255".into()),
            })
    };
    let amps_arg = || {
        Arg::with_name("amps")
            .help("Threshold in amps")
            .required(true)
            .validator(|v| match v.parse::<f32>() {
                Ok(a) if a.is_finite() => Ok(()),
                _ => Err("Threshold must be a finite number".into()),
            })
    };

    let matches = App::new("breaker-panel")
        .version("0.1.0")
        .author("Power Systems Engineering Team")
        .about("⚡ Breaker panel supervisor - send commands and monitor telemetry")
        .setting(AppSettings::AllowNegativeNumbers)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Panel host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Panel port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Wire format spoken by the panel")
                .takes_value(true)
                .possible_values(&["text", "binary"])
                .default_value("text")
                .global(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("OUTPUT")
                .help("Output style")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("toggle")
                .about("🔌 Switch a breaker on or off")
                .arg(index_arg())
                .arg(
                    Arg::with_name("state")
                        .help("Desired state")
                        .required(true)
                        .possible_values(&["on", "off", "1", "0"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("max")
                .about("📈 Set a load breaker's maximum current")
                .arg(index_arg())
                .arg(amps_arg()),
        )
        .subcommand(
            SubCommand::with_name("min")
                .about("📉 Set a load breaker's minimum current (text format only)")
                .arg(index_arg())
                .arg(amps_arg()),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📡 Stream panel telemetry")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("N")
                        .help("Stop after N frames")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("text").parse::<WireFormat>()?;
    let output = matches.value_of("output").unwrap_or("table");

    match matches.subcommand() {
        ("toggle", Some(sub)) => {
            let on = matches!(sub.value_of("state"), Some("on") | Some("1"));
            let command = Command::Toggle { index: parse_index(sub)?, on };
            handle_command(host, port, format, output, command).await?;
        }
        ("max", Some(sub)) => {
            let command = Command::SetMaxCurrent {
                index: parse_index(sub)?,
                amps: parse_amps(sub)?,
            };
            handle_command(host, port, format, output, command).await?;
        }
        ("min", Some(sub)) => {
            let command = Command::SetMinCurrent {
                index: parse_index(sub)?,
                amps: parse_amps(sub)?,
            };
            handle_command(host, port, format, output, command).await?;
        }
        ("monitor", Some(sub)) => {
            let count = sub.value_of("count").map(str::parse::<usize>).transpose()?;
            handle_monitor(host, port, format, output, count).await?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the simulator", "breaker-panel-sim".bright_cyan());
            println!("  {} Close the overall breaker", "breaker-panel toggle 0 on".bright_cyan());
            println!("  {} Monitor telemetry", "breaker-panel monitor".bright_cyan());
        }
    }

    Ok(())
}

fn parse_index(matches: &ArgMatches<'_>) -> Result<u8, Box<dyn std::error::Error>> {
    Ok(matches.value_of("index").unwrap_or_default().parse::<u8>()?)
}

fn parse_amps(matches: &ArgMatches<'_>) -> Result<f32, Box<dyn std::error::Error>> {
    Ok(matches.value_of("amps").unwrap_or_default().parse::<f32>()?)
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to breaker panel at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Nothing is listening. Start the simulator with:", "💡".yellow());
                eprintln!("   {}", "breaker-panel-sim".bright_cyan());
            }
            Err(e.into())
        }
    }
}

/// The protocol has no acknowledgement: send the frame, then report the
/// status carried by the next telemetry frame.
async fn handle_command(
    host: &str,
    port: u16,
    format: WireFormat,
    output: &str,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let frame = match encode_command(format, &command) {
        Ok(frame) => frame,
        Err(e) => {
            eprintln!("{} Cannot send {:?} in {:?} format: {}", "❌".red(), command, format, e);
            return Err(e.into());
        }
    };

    let mut stream = connect(host, port).await?;
    let mut decoder = TelemetryDecoder::new(format);
    let mut buffer = vec![0u8; 1024];

    // Whatever was in flight before the command goes through the decoder so
    // binary framing stays aligned; a frame already underway is stale too.
    let mut stale = 0usize;
    if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buffer)).await {
        let _ = decoder.feed(&buffer[..n]);
        stale = usize::from(decoder.pending() > 0);
    }
    stream.write_all(&frame).await?;

    let reply = tokio::time::timeout(REPLY_TIMEOUT, async {
        loop {
            let n = stream.read(&mut buffer).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Panel closed connection",
                ));
            }
            let mut frames = decoder.feed(&buffer[..n]);
            let skip = stale.min(frames.len());
            stale -= skip;
            frames.drain(..skip);
            if let Some(Ok(frame)) = frames.into_iter().last() {
                return Ok(frame);
            }
        }
    })
    .await;

    match reply {
        Ok(Ok(frame)) => {
            println!("{} Sent {}", "✅".green(), describe(&command).bright_white());
            print_frame(&frame, output);
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            println!("{} Sent {}", "✅".green(), describe(&command).bright_white());
            eprintln!("{} No telemetry within {:?}", "⏰".yellow(), REPLY_TIMEOUT);
            Ok(())
        }
    }
}

async fn handle_monitor(
    host: &str,
    port: u16,
    format: WireFormat,
    output: &str,
    count: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = connect(host, port).await?;
    let mut decoder = TelemetryDecoder::new(format);
    let mut buffer = vec![0u8; 4096];
    let mut seen = 0usize;

    if output == "table" {
        println!("{}", "📡 Monitoring panel telemetry (Press Ctrl+C to stop)...".bright_blue().bold());
        print_table_header();
    }

    loop {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            break;
        }

        for result in decoder.feed(&buffer[..n]) {
            match result {
                Ok(frame) => {
                    if output == "table" {
                        print_table_row(&frame);
                    } else {
                        print_frame(&frame, output);
                    }
                    seen += 1;
                    if count.map_or(false, |limit| seen >= limit) {
                        return Ok(());
                    }
                }
                Err(e) => eprintln!("{} Bad telemetry frame: {}", "⚠️".yellow(), e),
            }
        }
    }

    Ok(())
}

fn describe(command: &Command) -> String {
    match *command {
        Command::Toggle { index, on } => format!("breaker {} {}", index, if on { "ON" } else { "OFF" }),
        Command::SetMaxCurrent { index, amps } => format!("breaker {} max current {:.2}A", index, amps),
        Command::SetMinCurrent { index, amps } => format!("breaker {} min current {:.2}A", index, amps),
    }
}

fn print_frame(frame: &TelemetryFrame, output: &str) {
    match output {
        "json" => match serde_json::to_string(frame) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{} Failed to encode frame: {}", "❌".red(), e),
        },
        "compact" => {
            let states: String = (0..BREAKER_COLUMNS)
                .map(|i| if frame.is_on(i) { '1' } else { '0' })
                .collect();
            println!(
                "{} | sys {:.2}A | load {:.2}A ({:.2} / {:.2})",
                states, frame.system_current, frame.total_load_current, frame.load1_current, frame.load2_current
            );
        }
        _ => {
            println!("{}", "⚡ Panel Status".bright_blue().bold());
            for index in 0..BREAKER_COLUMNS {
                let name = if index == 0 { "Overall".to_string() } else { format!("Load {}", index) };
                println!("  {:<8} {}", name, state_str(frame.is_on(index)));
            }
            println!("  System current: {:.2}A", frame.system_current);
            println!("  Load current:   {:.2}A", frame.total_load_current);
            println!("  Load 1:         {:.2}A", frame.load1_current);
            println!("  Load 2:         {:.2}A", frame.load2_current);
        }
    }
}

fn state_str(on: bool) -> ColoredString {
    if on {
        "  ON".bright_green()
    } else {
        " OFF".bright_red()
    }
}

fn print_table_header() {
    println!("{}", "┌─────────┬────────┬────────┬──────────┬──────────┬──────────┬──────────┐".bright_white());
    println!("{}", "│ Overall │ Load 1 │ Load 2 │  System  │  Loads   │  Load 1  │  Load 2  │".bright_white());
    println!("{}", "├─────────┼────────┼────────┼──────────┼──────────┼──────────┼──────────┤".bright_white());
}

fn print_table_row(frame: &TelemetryFrame) {
    println!(
        "│    {} │   {} │   {} │ {:>7.2}A │ {:>7.2}A │ {:>7.2}A │ {:>7.2}A │",
        state_str(frame.is_on(0)),
        state_str(frame.is_on(1)),
        state_str(frame.is_on(2)),
        frame.system_current,
        frame.total_load_current,
        frame.load1_current,
        frame.load2_current
    );
}
