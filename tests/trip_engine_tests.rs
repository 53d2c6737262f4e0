use breaker_panel::breaker::{Breaker, BreakerHierarchy, DrivePolarity, HysteresisBand, ThresholdKind};
use breaker_panel::hal::{Actuator, PinLevel};
use breaker_panel::safety::*;
use breaker_panel::sensor::{Calibration, Readings, SensorChannel};

#[derive(Default)]
struct PinLog {
    writes: Vec<(u8, PinLevel)>,
}

impl Actuator for PinLog {
    fn drive(&mut self, pin: u8, level: PinLevel) {
        self.writes.push((pin, level));
    }
}

fn voltage_monitor() -> (TripEngine, BreakerHierarchy) {
    let sensor = SensorChannel::new(0, Calibration::voltage_divider());
    let engine = TripEngine::new(TripPolicy::Hysteresis { breaker: 0, sensor });
    let mut mosfet = Breaker::new(0, "Load", 2);
    mosfet.is_on = true;
    let hierarchy = BreakerHierarchy::new([mosfet], DrivePolarity::ActiveLow)
        .with_band(HysteresisBand::new(5.0, 3.0).unwrap());
    (engine, hierarchy)
}

fn current_panel(windowed: bool) -> (TripEngine, BreakerHierarchy, PinLog) {
    let engine = TripEngine::new(TripPolicy::CurrentWindow { windowed });
    let mut hierarchy = BreakerHierarchy::new(
        [
            Breaker::new(0, "Overall", 3),
            Breaker::new(1, "Load 1", 2).with_current_window(5.0, 0.1),
            Breaker::new(2, "Load 2", 4).with_current_window(5.0, 0.1),
        ],
        DrivePolarity::ActiveLow,
    );
    let mut io = PinLog::default();
    hierarchy.set_state(0, true, &mut io);
    hierarchy.set_state(1, true, &mut io);
    hierarchy.set_state(2, true, &mut io);
    io.writes.clear();
    (engine, hierarchy, io)
}

fn with_voltage(volts: f32) -> Readings {
    Readings {
        voltage: volts,
        ..Readings::default()
    }
}

fn with_loads(load1: f32, load2: f32) -> Readings {
    let mut readings = Readings::default();
    readings.load_current[1] = load1;
    readings.load_current[2] = load2;
    readings
}

#[test]
fn test_hysteresis_does_not_chatter() {
    let (mut engine, mut hierarchy) = voltage_monitor();
    let mut io = PinLog::default();

    let samples = [4.0, 5.2, 4.9, 4.5, 3.1, 2.9, 3.5, 5.0];
    let expected_on = [true, false, false, false, false, true, true, false];

    let mut transitions = Vec::new();
    for (tick, (volts, on)) in samples.iter().zip(expected_on).enumerate() {
        let events = engine.evaluate(tick as u64, &with_voltage(*volts), &mut hierarchy, &mut io);
        assert_eq!(hierarchy.is_on(0), on, "tick {} at {}V", tick, volts);
        transitions.extend(events.iter().map(|e| (tick, e.cause)));
    }

    assert_eq!(
        transitions,
        vec![
            (1, TripCause::OverVoltage),
            (5, TripCause::VoltageRecovered),
            (7, TripCause::OverVoltage),
        ]
    );
    // One pin write per transition, never more
    assert_eq!(io.writes, vec![(2, PinLevel::High), (2, PinLevel::Low), (2, PinLevel::High)]);
}

#[test]
fn test_hysteresis_thresholds_are_inclusive() {
    let (mut engine, mut hierarchy) = voltage_monitor();
    let mut io = PinLog::default();

    engine.evaluate(0, &with_voltage(5.0), &mut hierarchy, &mut io);
    assert!(engine.is_tripped());
    assert!(!hierarchy.is_on(0));
    assert!(hierarchy.get(0).unwrap().trip_latched);

    engine.evaluate(1, &with_voltage(3.0), &mut hierarchy, &mut io);
    assert!(!engine.is_tripped());
    assert!(hierarchy.is_on(0));
    assert!(!hierarchy.get(0).unwrap().trip_latched);
}

#[test]
fn test_hysteresis_band_change_applies_next_evaluation() {
    let (mut engine, mut hierarchy) = voltage_monitor();
    let mut io = PinLog::default();

    assert!(hierarchy.set_threshold(0, ThresholdKind::HighVoltage, 6.0));
    engine.evaluate(0, &with_voltage(5.5), &mut hierarchy, &mut io);
    assert!(hierarchy.is_on(0));

    engine.evaluate(1, &with_voltage(6.1), &mut hierarchy, &mut io);
    assert!(!hierarchy.is_on(0));
}

#[test]
fn test_manual_open_is_never_auto_reclosed() {
    let (mut engine, mut hierarchy) = voltage_monitor();
    let mut io = PinLog::default();

    hierarchy.command_state(0, false, &mut io);
    engine.on_operator_command(0);
    assert!(!engine.is_tripped());

    for (tick, volts) in [2.5, 0.0, 5.5, 2.0].iter().enumerate() {
        let events = engine.evaluate(tick as u64, &with_voltage(*volts), &mut hierarchy, &mut io);
        assert!(events.is_empty(), "at {}V", volts);
        assert!(!hierarchy.is_on(0));
    }
    assert_eq!(io.writes, vec![(2, PinLevel::High)]);
}

#[test]
fn test_manual_open_cancels_pending_reclose() {
    let (mut engine, mut hierarchy) = voltage_monitor();
    let mut io = PinLog::default();

    engine.evaluate(0, &with_voltage(5.5), &mut hierarchy, &mut io);
    assert!(engine.is_tripped());

    // Operator closes then opens again while the voltage is still high
    hierarchy.command_state(0, true, &mut io);
    engine.on_operator_command(0);
    hierarchy.command_state(0, false, &mut io);
    engine.on_operator_command(0);

    let events = engine.evaluate(1, &with_voltage(2.0), &mut hierarchy, &mut io);
    assert!(events.is_empty());
    assert!(!hierarchy.is_on(0));
}

#[test]
fn test_manual_close_rearms_hysteresis() {
    let (mut engine, mut hierarchy) = voltage_monitor();
    let mut io = PinLog::default();

    engine.evaluate(0, &with_voltage(5.5), &mut hierarchy, &mut io);
    assert!(!hierarchy.is_on(0));

    // Manual reset with the voltage still high: next evaluation trips again
    hierarchy.command_state(0, true, &mut io);
    engine.on_operator_command(0);
    assert!(!engine.is_tripped());

    let events = engine.evaluate(1, &with_voltage(5.5), &mut hierarchy, &mut io);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cause, TripCause::OverVoltage);
    assert!(!hierarchy.is_on(0));
}

#[test]
fn test_current_window_trips_and_latches() {
    let (mut engine, mut hierarchy, mut io) = current_panel(false);

    let events = engine.evaluate(10, &with_loads(5.01, 1.0), &mut hierarchy, &mut io);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].breaker, 1);
    assert_eq!(events[0].cause, TripCause::OverCurrent);
    assert_eq!(events[0].threshold, 5.0);
    assert_eq!(hierarchy.status_mask(), 0b101);
    assert_eq!(io.writes, vec![(2, PinLevel::High)]);

    // Current falls back in range: the engine never re-closes
    for tick in 11..20 {
        let events = engine.evaluate(tick, &with_loads(0.5, 1.0), &mut hierarchy, &mut io);
        assert!(events.is_empty());
    }
    assert_eq!(hierarchy.status_mask(), 0b101);
    assert!(hierarchy.get(1).unwrap().trip_latched);

    // Only the operator clears it
    assert!(hierarchy.command_state(1, true, &mut io));
    assert!(!hierarchy.get(1).unwrap().trip_latched);
    assert_eq!(hierarchy.status_mask(), 0b111);
}

#[test]
fn test_current_window_minimum_only_when_windowed() {
    let (mut engine, mut hierarchy, mut io) = current_panel(false);
    engine.evaluate(0, &with_loads(0.05, 0.0), &mut hierarchy, &mut io);
    assert_eq!(hierarchy.status_mask(), 0b111);

    let (mut engine, mut hierarchy, mut io) = current_panel(true);
    let events = engine.evaluate(0, &with_loads(0.05, 0.0), &mut hierarchy, &mut io);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cause, TripCause::UnderCurrent);
    // Zero current means nothing attached, not an under-current fault
    assert_eq!(hierarchy.status_mask(), 0b101);
}

#[test]
fn test_current_window_skips_open_breakers() {
    let (mut engine, mut hierarchy, mut io) = current_panel(true);
    hierarchy.set_state(2, false, &mut io);

    let events = engine.evaluate(0, &with_loads(1.0, 9.0), &mut hierarchy, &mut io);
    assert!(events.is_empty());
    assert_eq!(engine.get_stats().evaluations, 1);
}

#[test]
fn test_simultaneous_trips_are_recorded_in_order() {
    let (mut engine, mut hierarchy, mut io) = current_panel(true);

    let events = engine.evaluate(42, &with_loads(6.0, 7.0), &mut hierarchy, &mut io);
    assert_eq!(events.iter().map(|e| e.breaker).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(hierarchy.status_mask(), 0b001);

    let history = engine.get_history();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.timestamp_ms == 42));
    assert_eq!(engine.get_stats().over_current_trips, 2);
}
