use breaker_panel::channel::BufferedChannel;
use breaker_panel::config::PanelConfig;
use breaker_panel::control::ControlLoop;
use breaker_panel::hal::MonotonicClock;
use breaker_panel::protocol::WireFormat;
use breaker_panel::sim::SimulatedPlant;
use clap::{App, Arg};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_PORT: &str = "8080";
const DEFAULT_TICK_MS: &str = "10";
const OUTPUT_BROADCAST_BUFFER_SIZE: usize = 256;
const INBOUND_QUEUE_SIZE: usize = 64;
const STATS_PERIOD: Duration = Duration::from_secs(10);

type Panel = ControlLoop<SimulatedPlant, BufferedChannel, MonotonicClock>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("breaker-panel-sim")
        .version("0.1.0")
        .author("Power Systems Engineering Team")
        .about("⚡ Breaker panel simulator - control loop against a simulated plant, served over TCP")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port to listen on")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Panel configuration (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Wire format, overrides the configuration")
                .takes_value(true)
                .possible_values(&["text", "binary"]),
        )
        .arg(
            Arg::with_name("policy")
                .long("policy")
                .value_name("POLICY")
                .help("Built-in panel to simulate when no configuration file is given")
                .takes_value(true)
                .possible_values(&["current", "hysteresis"])
                .default_value("current"),
        )
        .arg(
            Arg::with_name("tick")
                .long("tick-ms")
                .value_name("MS")
                .help("Control loop period")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS),
        )
        .arg(
            Arg::with_name("demand")
                .long("demand")
                .value_name("INDEX=AMPS")
                .help("Current drawn by a load breaker while it is on")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("voltage")
                .long("voltage")
                .value_name("VOLTS")
                .help("Supply voltage seen by the voltage sensor")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rail")
                .long("rail")
                .value_name("VOLTS")
                .help("Controller supply rail seen by the supply-voltage sensor")
                .takes_value(true),
        )
        .get_matches();

    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let tick_ms = matches.value_of("tick").unwrap_or(DEFAULT_TICK_MS).parse::<u64>()?;

    let mut config = match matches.value_of("config") {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            serde_json::from_str::<PanelConfig>(&json)?
        }
        None => match matches.value_of("policy") {
            Some("hysteresis") => PanelConfig::voltage_monitor(),
            _ => PanelConfig::default(),
        },
    };
    if let Some(format) = matches.value_of("format") {
        config.wire_format = format.parse::<WireFormat>()?;
    }

    let mut plant = SimulatedPlant::from_config(&config);
    if let Some(demands) = matches.values_of("demand") {
        for demand in demands {
            let (index, amps) = parse_demand(demand)?;
            plant.set_load_demand(index, amps);
        }
    }
    if let Some(volts) = matches.value_of("voltage") {
        plant.set_supply_voltage(volts.parse::<f32>()?);
    }
    if let Some(volts) = matches.value_of("rail") {
        plant.set_rail_voltage(volts.parse::<f32>()?);
    }

    let mut panel: Panel = ControlLoop::new(&config, plant, BufferedChannel::new(), MonotonicClock::new())?;

    println!("⚡ Breaker Panel Simulator");
    println!("==========================");
    for breaker in panel.hierarchy().iter() {
        println!(
            "   [{}] {:<10} pin {:>2}  {}",
            breaker.index,
            breaker.name,
            breaker.drive_pin,
            if breaker.is_on { "ON" } else { "OFF" }
        );
    }
    println!("   Format: {:?}  Policy: {:?}", config.wire_format, config.trip_policy);
    println!("📡 Listening on TCP port {}", port);

    let (output_tx, _) = broadcast::channel::<Vec<u8>>(OUTPUT_BROADCAST_BUFFER_SIZE);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Vec<u8>>(INBOUND_QUEUE_SIZE);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let tcp_output_tx = output_tx.clone();
    let tcp_server = tokio::spawn(async move {
        accept_clients(listener, inbound_tx, tcp_output_tx).await;
    });

    let mut ticker = time::interval(Duration::from_millis(tick_ms.max(1)));
    let mut stats_ticker = time::interval(STATS_PERIOD);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Ok(bytes) = inbound_rx.try_recv() {
                    if let Err(e) = panel.channel_mut().inject(&bytes) {
                        warn!("Dropped {} inbound bytes: {}", bytes.len(), e);
                    }
                }

                let report = panel.tick();
                for event in &report.trip_events {
                    info!("🔌 breaker {} {}: {:.2}", event.breaker, event.cause.describe(), event.value);
                }

                let output = panel.channel_mut().take_output();
                // No subscribers is fine
                if !output.is_empty() {
                    let _ = output_tx.send(output);
                }
            }
            _ = stats_ticker.tick() => {
                match serde_json::to_string(panel.stats()) {
                    Ok(stats) => info!("📊 STATS: {}", stats),
                    Err(e) => warn!("Failed to serialize stats: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    tcp_server.abort();
    println!("🛑 Breaker Panel Simulator stopped");

    Ok(())
}

fn parse_demand(value: &str) -> Result<(usize, f32), Box<dyn std::error::Error>> {
    let (index, amps) = value
        .split_once('=')
        .ok_or_else(|| format!("demand must look like INDEX=AMPS, got '{}'", value))?;
    Ok((index.trim().parse()?, amps.trim().parse()?))
}

async fn accept_clients(
    listener: TcpListener,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    output_tx: broadcast::Sender<Vec<u8>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 New client connected: {}", addr);
                let client_inbound = inbound_tx.clone();
                let client_output = output_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_inbound, client_output).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("🔌 Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    mut output_rx: broadcast::Receiver<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = stream.into_split();

    let output_task = tokio::spawn(async move {
        loop {
            match output_rx.recv().await {
                Ok(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        warn!("Failed to send panel output: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Client lagging, skipped {} output chunks", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut buffer = vec![0u8; 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        if inbound_tx.send(buffer[..n].to_vec()).await.is_err() {
            break;
        }
    }

    output_task.abort();
    Ok(())
}
