use breaker_panel::channel::BufferedChannel;
use breaker_panel::config::{BreakerConfig, PanelConfig};
use breaker_panel::control::{ControlLoop, MAX_BYTES_PER_TICK};
use breaker_panel::hal::{ManualClock, PinLevel};
use breaker_panel::protocol::{encode_f32, WireFormat, OP_SET_MAX_CURRENT, OP_TOGGLE};
use breaker_panel::safety::TripCause;
use breaker_panel::sensor::{Calibration, SensorChannel};
use breaker_panel::sim::SimulatedPlant;
use breaker_panel::telemetry::{parse_voltage_report, TelemetryDecoder, TelemetryFrame, BINARY_TELEMETRY_LEN};

type Panel<'a> = ControlLoop<SimulatedPlant, BufferedChannel, &'a ManualClock>;

fn start<'a>(config: &PanelConfig, clock: &'a ManualClock) -> Panel<'a> {
    let plant = SimulatedPlant::from_config(config);
    ControlLoop::new(config, plant, BufferedChannel::new(), clock).unwrap()
}

fn output_text(panel: &mut Panel<'_>) -> String {
    String::from_utf8(panel.channel_mut().take_output()).unwrap()
}

/// Current panel whose load sensors read `raw * 0.01` amps.
fn linear_panel() -> PanelConfig {
    let linear = Calibration::Linear { slope: 0.01, intercept: 0.0 };
    let mut config = PanelConfig::default();
    config.breakers[1].load_sensor = Some(SensorChannel::new(5, linear));
    config.breakers[2].load_sensor = Some(SensorChannel::new(6, linear));
    config.system_current_sensor = Some(SensorChannel::new(7, linear));
    config
}

#[test]
fn test_end_to_end_overcurrent_trip() {
    let clock = ManualClock::new(0);
    let mut panel = start(&linear_panel(), &clock);

    panel.channel_mut().inject(b"T,0,1\nT,1,1\n").unwrap();
    let report = panel.tick();
    assert_eq!(report.commands_applied, 2);
    assert_eq!(report.status_mask, 0b011);

    panel.io_mut().set_load_demand(1, 5.0 + 0.01);
    clock.advance(10);
    let report = panel.tick();

    assert_eq!(report.trip_events.len(), 1);
    assert_eq!(report.trip_events[0].cause, TripCause::OverCurrent);
    assert_eq!(report.status_mask, 0b001);
    assert_eq!(panel.io().pin_level(2), Some(PinLevel::High));
    assert_eq!(panel.stats().trips, 1);

    // Latched: stays open once the load stops drawing
    panel.io_mut().set_load_demand(1, 1.0);
    clock.advance(10);
    assert_eq!(panel.tick().status_mask, 0b001);

    panel.channel_mut().inject(b"T,1,1\n").unwrap();
    let report = panel.tick();
    assert!(report.trip_events.is_empty());
    assert_eq!(report.status_mask, 0b011);
    assert!(!panel.hierarchy().get(1).unwrap().trip_latched);
}

#[test]
fn test_reclose_into_fault_trips_in_same_tick() {
    let clock = ManualClock::new(0);
    let mut panel = start(&linear_panel(), &clock);
    panel.io_mut().set_load_demand(2, 8.0);

    panel.channel_mut().inject(b"T,0,1\nT,2,1\n").unwrap();
    let report = panel.tick();

    assert_eq!(report.commands_applied, 2);
    assert_eq!(report.trip_events.len(), 1);
    assert_eq!(report.trip_events[0].breaker, 2);
    assert_eq!(report.status_mask, 0b001);
}

#[test]
fn test_root_off_cascades_within_one_tick() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::default(), &clock);

    panel.channel_mut().inject(b"T,0,1\nT,1,1\nT,2,1\n").unwrap();
    assert_eq!(panel.tick().status_mask, 0b111);

    panel.channel_mut().inject(b"T,0,0\n").unwrap();
    assert_eq!(panel.tick().status_mask, 0);
    for pin in [3, 2, 4] {
        assert_eq!(panel.io().pin_level(pin), Some(PinLevel::High));
    }

    // A load cannot come back without the overall breaker
    panel.channel_mut().inject(b"T,2,1\n").unwrap();
    let report = panel.tick();
    assert_eq!(report.commands_refused, 1);
    assert_eq!(report.status_mask, 0);
}

#[test]
fn test_telemetry_interval() {
    let clock = ManualClock::new(1_000);
    let mut panel = start(&PanelConfig::default(), &clock);

    assert!(!panel.tick().telemetry_sent);
    clock.advance(99);
    assert!(!panel.tick().telemetry_sent);
    clock.advance(1);
    assert!(panel.tick().telemetry_sent);
    assert!(!panel.tick().telemetry_sent);

    clock.advance(250);
    assert!(panel.tick().telemetry_sent);
    clock.advance(99);
    assert!(!panel.tick().telemetry_sent);

    assert_eq!(panel.stats().telemetry_frames, 2);
    assert_eq!(output_text(&mut panel), "0|0.00|0.00|0.00|0.00\n".repeat(2));
}

#[test]
fn test_text_telemetry_reflects_loads() {
    let clock = ManualClock::new(0);
    let mut panel = start(&linear_panel(), &clock);
    panel.io_mut().set_load_demand(1, 1.25);
    panel.io_mut().set_load_demand(2, 0.5);
    panel.channel_mut().inject(b"T,0,1\nT,1,1\nT,2,1\n").unwrap();

    clock.advance(100);
    panel.tick();

    assert_eq!(output_text(&mut panel), "7|1.75|1.75|1.25|0.50\n");
}

#[test]
fn test_binary_panel_end_to_end() {
    let clock = ManualClock::new(0);
    let mut config = linear_panel();
    config.wire_format = WireFormat::Binary;
    let mut panel = start(&config, &clock);
    panel.io_mut().set_load_demand(1, 2.0);

    panel
        .channel_mut()
        .inject(&[OP_TOGGLE, 0, 1, OP_TOGGLE, 1, 1])
        .unwrap();
    clock.advance(100);
    panel.tick();

    let output = panel.channel_mut().take_output();
    assert_eq!(output.len(), BINARY_TELEMETRY_LEN);
    let frame = TelemetryFrame::decode_binary(&output).unwrap();
    assert_eq!(frame.status_mask, 0b011);
    assert_eq!(frame.load1_current, 2.0);
    // Single-sensor layout mirrors load 1
    assert_eq!(frame.total_load_current, 2.0);
    assert_eq!(frame.load2_current, 2.0);
    assert_eq!(frame.system_current, 2.0);
}

#[test]
fn test_truncated_binary_command_applies_when_complete() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::binary_panel(), &clock);

    panel.channel_mut().inject(&[OP_SET_MAX_CURRENT, 0x01]).unwrap();
    let report = panel.tick();
    assert_eq!(report.commands_applied, 0);
    assert_eq!(panel.hierarchy().get(1).unwrap().max_current, Some(5.0));

    panel.channel_mut().inject(&encode_f32(3.5)).unwrap();
    let report = panel.tick();
    assert_eq!(report.commands_applied, 1);
    assert_eq!(panel.hierarchy().get(1).unwrap().max_current, Some(3.5));
}

#[test]
fn test_unknown_opcode_is_dropped_and_stream_resyncs() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::binary_panel(), &clock);

    panel.channel_mut().inject(&[0x7F, OP_TOGGLE, 0, 1]).unwrap();
    let report = panel.tick();

    assert_eq!(report.frames_dropped, 1);
    assert_eq!(report.commands_applied, 1);
    assert_eq!(report.status_mask, 0b001);
}

#[test]
fn test_threshold_commands_reach_the_hierarchy() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::default(), &clock);

    panel.channel_mut().inject(b"M,1,4.5\nm,2,0.3\nm,1,4.5\n").unwrap();
    let report = panel.tick();

    assert_eq!(report.commands_applied, 2);
    assert_eq!(report.commands_refused, 1);
    assert_eq!(panel.hierarchy().get(1).unwrap().max_current, Some(4.5));
    assert_eq!(panel.hierarchy().get(1).unwrap().min_current, Some(0.1));
    assert_eq!(panel.hierarchy().get(2).unwrap().min_current, Some(0.3));
}

#[test]
fn test_inbound_drain_is_bounded() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::default(), &clock);

    let flood = vec![b'x'; MAX_BYTES_PER_TICK * 3];
    panel.channel_mut().inject(&flood).unwrap();

    assert_eq!(panel.tick().bytes_read, MAX_BYTES_PER_TICK);
    assert_eq!(panel.channel_mut().take_output().len(), 0);
    assert_eq!(panel.tick().bytes_read, MAX_BYTES_PER_TICK);
}

#[test]
fn test_voltage_monitor_with_notices() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::voltage_monitor(), &clock);
    assert_eq!(panel.io().pin_level(2), Some(PinLevel::Low));

    let samples = [4.0, 5.2, 4.9, 4.5, 3.1, 2.9, 3.5, 5.0];
    let expected = [1, 0, 0, 0, 0, 1, 1, 0];
    for (volts, mask) in samples.iter().zip(expected) {
        panel.io_mut().set_supply_voltage(*volts);
        clock.advance(100);
        assert_eq!(panel.tick().status_mask, mask, "at {}V", volts);
    }

    let output = output_text(&mut panel);
    let notices: Vec<&str> = output.lines().filter(|l| l.starts_with("# breaker")).collect();
    assert_eq!(notices.len(), 3);
    assert!(notices[0].starts_with("# breaker 0 tripped: over-voltage"));
    assert!(notices[1].starts_with("# breaker 0 re-closed: voltage recovered"));
    assert!(notices[2].starts_with("# breaker 0 tripped: over-voltage"));

    let frames: Vec<_> = TelemetryDecoder::new(WireFormat::Text)
        .feed(output.as_bytes())
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(frames.len(), samples.len());
    assert_eq!(panel.engine().get_history().len(), 3);
}

#[test]
fn test_voltage_monitor_reports_both_rails() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::voltage_monitor(), &clock);
    panel.io_mut().set_supply_voltage(4.2);
    panel.io_mut().set_rail_voltage(4.8);

    clock.advance(100);
    assert!(panel.tick().telemetry_sent);
    // Not due: neither frame nor voltage line
    panel.tick();

    let output = output_text(&mut panel);
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "1|0.00|0.00|0.00|0.00");

    let (load, supply) = parse_voltage_report(lines[1]).unwrap();
    assert!((load - 4.2).abs() < 0.03, "load {}", load);
    assert!((supply - 4.8).abs() < 0.03, "supply {}", supply);
    assert!((panel.stats().last_readings.voltage - 4.2).abs() < 0.03);

    // Frame readers skip the voltage line
    let frames = TelemetryDecoder::new(WireFormat::Text).feed(output.as_bytes());
    assert_eq!(frames.len(), 1);
}

#[test]
fn test_voltage_report_only_on_text_link() {
    let clock = ManualClock::new(0);
    let mut config = PanelConfig::voltage_monitor();
    config.wire_format = WireFormat::Binary;
    let mut panel = start(&config, &clock);

    clock.advance(100);
    panel.tick();
    assert_eq!(panel.channel_mut().take_output().len(), BINARY_TELEMETRY_LEN);
}

#[test]
fn test_voltage_band_set_over_the_wire() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::voltage_monitor(), &clock);

    panel.channel_mut().inject(b"M,0,6.0\nm,0,7.0\n").unwrap();
    let report = panel.tick();
    assert_eq!(report.commands_applied, 1);
    assert_eq!(report.commands_refused, 1);

    let band = panel.hierarchy().band().unwrap();
    assert_eq!((band.high, band.low), (6.0, 3.0));

    panel.io_mut().set_supply_voltage(5.5);
    assert_eq!(panel.tick().status_mask, 1);
    panel.io_mut().set_supply_voltage(6.0);
    assert_eq!(panel.tick().status_mask, 0);
}

#[test]
fn test_manual_trip_on_voltage_monitor() {
    let clock = ManualClock::new(0);
    let mut panel = start(&PanelConfig::voltage_monitor(), &clock);
    panel.io_mut().set_supply_voltage(2.5);
    assert_eq!(panel.tick().status_mask, 1);

    panel.channel_mut().inject(b"T,0,0\n").unwrap();
    let report = panel.tick();
    assert_eq!(report.status_mask, 0);
    assert!(report.trip_events.is_empty());
    assert!(!panel.engine().is_tripped());

    // No further commands: the breaker stays open whatever the voltage does
    for volts in [2.5, 0.0, 5.5, 2.0] {
        panel.io_mut().set_supply_voltage(volts);
        clock.advance(10);
        let report = panel.tick();
        assert_eq!(report.status_mask, 0, "at {}V", volts);
        assert!(report.trip_events.is_empty());
    }
    assert_eq!(panel.io().pin_level(2), Some(PinLevel::High));

    panel.channel_mut().inject(b"T,0,1\n").unwrap();
    assert_eq!(panel.tick().status_mask, 1);
}

#[test]
fn test_extra_breakers_in_config() {
    let clock = ManualClock::new(0);
    let mut config = PanelConfig::default();
    config.breakers.push(BreakerConfig {
        max_current: Some(2.0),
        ..BreakerConfig::new("Load 3", 5)
    });
    let mut panel = start(&config, &clock);

    panel.channel_mut().inject(b"T,0,1\nT,3,1\n").unwrap();
    assert_eq!(panel.tick().status_mask, 0b1001);
}
