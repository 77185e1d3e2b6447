//! PWM channel driver on the software timer.

use approx::assert_relative_eq;
use periphio::sim::SimBoard;
use periphio::{
    Error, ErrorKind, GpioLevel, GpioMode, LineConfig, LineDriver, Owner, PinMode, PwmLimits,
    PwmSettings, PwmTimer, Runtime, RuntimeConfig, SoftPwm,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup() -> (Arc<SimBoard>, Runtime) {
    init_logging();
    let board = Arc::new(SimBoard::new(16));
    let runtime = Runtime::new(board.clone());
    (board, runtime)
}

#[test]
fn test_extreme_duties_emit_no_pulses() {
    let (board, runtime) = setup();
    let mut pwm = runtime.pwm_open(0, 5, 5000.0, 0.0).unwrap();
    thread::sleep(Duration::from_millis(5));
    assert_eq!(board.level(5), GpioLevel::Low);

    pwm.set_duty(1.0).unwrap();
    thread::sleep(Duration::from_millis(5));
    assert_eq!(board.level(5), GpioLevel::High);

    pwm.set_duty(0.0).unwrap();
    thread::sleep(Duration::from_millis(5));
    assert_eq!(board.level(5), GpioLevel::Low);
    pwm.close();

    // One step up and one step down, nothing in between
    let levels: Vec<_> = board.transitions(5).iter().map(|t| t.level).collect();
    assert_eq!(levels, vec![GpioLevel::High, GpioLevel::Low]);
}

#[test]
fn test_out_of_range_duty_rejected() {
    let (_board, runtime) = setup();
    let mut pwm = runtime.pwm_open(0, 5, 5000.0, 0.5).unwrap();
    for duty in [1.5, -0.1, f64::NAN] {
        let err = pwm.set_duty(duty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }
    assert_relative_eq!(pwm.duty(), 0.5);

    assert_eq!(
        runtime.pwm_open(1, 6, 5000.0, 1.5).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(
        runtime.pwm_open(1, 6, 0.0, 0.5).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(
        runtime.pwm_open(1, 6, -50.0, 0.5).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    // Nothing was claimed by the rejected opens
    assert_eq!(runtime.pin_info(6).unwrap().mode, PinMode::Unclaimed);
}

#[test]
fn test_close_twice_is_noop() {
    let (board, runtime) = setup();
    let mut pwm = runtime.pwm_open(2, 7, 1000.0, 0.5).unwrap();
    assert_eq!(runtime.pin_info(7).unwrap().owner, Some(Owner::Pwm { channel: 2 }));

    pwm.close();
    assert_eq!(runtime.pin_info(7).unwrap().mode, PinMode::Unclaimed);
    assert_eq!(board.level(7), GpioLevel::Low);
    pwm.close();
    assert!(!pwm.is_running());

    match pwm.set_duty(0.3) {
        Err(Error::Closed(_)) => {}
        other => panic!("expected Closed, got {:?}", other),
    }
    assert_eq!(pwm.set_frequency(50.0).unwrap_err().kind(), ErrorKind::Closed);

    // Channel and pin are free again
    runtime.pwm_open(2, 7, 1000.0, 0.5).unwrap().close();
}

#[test]
fn test_channel_and_pin_busy() {
    let (_board, runtime) = setup();
    let _first = runtime.pwm_open(0, 5, 1000.0, 0.5).unwrap();
    assert_eq!(
        runtime.pwm_open(0, 6, 1000.0, 0.5).unwrap_err().kind(),
        ErrorKind::Busy
    );
    assert_eq!(runtime.pin_info(6).unwrap().mode, PinMode::Unclaimed);

    runtime.gpio_set_mode(8, GpioMode::Output).unwrap();
    assert_eq!(
        runtime.pwm_open(1, 8, 1000.0, 0.5).unwrap_err().kind(),
        ErrorKind::Busy
    );
    // The refused open did not keep channel 1
    runtime.pwm_open(1, 9, 1000.0, 0.5).unwrap().close();

    assert_eq!(
        runtime.pwm_open(16, 10, 1000.0, 0.5).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
}

#[test]
fn test_duty_change_waits_for_period_boundary() {
    let (board, runtime) = setup();
    // 10 Hz: 100 ms periods, 50 ms high
    let mut pwm = runtime.pwm_open(3, 4, 10.0, 0.5).unwrap();
    thread::sleep(Duration::from_millis(130));
    // Mid-way through the high phase of the second period
    pwm.set_duty(0.2).unwrap();
    thread::sleep(Duration::from_millis(260));
    pwm.close();

    let edges = board.transitions(4);
    assert!(edges.len() >= 6, "too few edges: {}", edges.len());
    assert_eq!(edges[0].level, GpioLevel::High);
    let high_ms = |i: usize| (edges[i + 1].at - edges[i].at).as_secs_f64() * 1000.0;
    let period_ms = |i: usize| (edges[i + 2].at - edges[i].at).as_secs_f64() * 1000.0;

    // The period in progress keeps the old duty
    assert!(high_ms(2) > 40.0, "second pulse cut short: {:.1} ms", high_ms(2));
    // The next one starts with the new duty
    assert!(high_ms(4) < 35.0, "third pulse too long: {:.1} ms", high_ms(4));
    // Periods stay anchored to the original schedule
    assert_relative_eq!(period_ms(2), 100.0, epsilon = 15.0);
    assert_relative_eq!(pwm.duty(), 0.2);
}

#[test]
fn test_frequency_change() {
    let (_board, runtime) = setup();
    let mut pwm = runtime.pwm_open(0, 5, 100.0, 0.5).unwrap();
    pwm.set_frequency(250.0).unwrap();
    assert_relative_eq!(pwm.frequency(), 250.0);
    assert_eq!(
        pwm.set_frequency(0.0).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(
        pwm.set_frequency(1e9).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_relative_eq!(pwm.frequency(), 250.0);
}

#[test]
fn test_custom_limits_and_timer() {
    init_logging();
    let board = Arc::new(SimBoard::new(8));
    let config = RuntimeConfig::default()
        .with_pwm_channel_count(2)
        .with_pwm_limits(PwmLimits {
            min_freq_hz: 10.0,
            max_freq_hz: 2000.0,
        });
    let timer = Arc::new(SoftPwm::new(
        board.clone(),
        periphio::Clock::new(),
        config.pwm_channel_count,
    ));
    let runtime = Runtime::with_timer(board.clone(), timer.clone(), config);

    assert_eq!(
        runtime.pwm_open(0, 1, 5.0, 0.5).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    let mut pwm = runtime.pwm_open(0, 1, 1000.0, 0.5).unwrap();
    thread::sleep(Duration::from_millis(50));
    let periods = timer.periods_elapsed(0).unwrap();
    assert!(periods >= 20, "only {} periods in 50 ms", periods);
    pwm.close();
    assert_eq!(timer.periods_elapsed(0), None);
    assert_eq!(board.level(1), GpioLevel::Low);
}

#[test]
fn test_drop_stops_generation() {
    let (board, runtime) = setup();
    {
        let _pwm = runtime.pwm_open(1, 3, 2000.0, 0.5).unwrap();
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(runtime.pin_info(3).unwrap().mode, PinMode::Unclaimed);
    let settled = board.transitions(3).len();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(board.transitions(3).len(), settled);
    assert_eq!(board.level(3), GpioLevel::Low);
}

#[test]
fn test_line_error_stops_generation_and_is_reported() {
    let (board, runtime) = setup();
    let mut pwm = runtime.pwm_open(0, 5, 1000.0, 0.5).unwrap();
    thread::sleep(Duration::from_millis(5));

    board.fail_line(5, true);
    thread::sleep(Duration::from_millis(20));
    board.fail_line(5, false);
    let edges = board.transitions(5).len();
    thread::sleep(Duration::from_millis(10));
    // The generator is gone: no further edges
    assert_eq!(board.transitions(5).len(), edges);

    let err = pwm.set_duty(0.9).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HardwareFault);
    assert!(!pwm.is_running());
    assert_relative_eq!(pwm.duty(), 0.5);
    assert_eq!(
        pwm.set_frequency(500.0).unwrap_err().kind(),
        ErrorKind::HardwareFault
    );

    // Closing still releases the pin and frees the channel
    pwm.close();
    assert_eq!(runtime.pin_info(5).unwrap().mode, PinMode::Unclaimed);
    assert_eq!(board.level(5), GpioLevel::Low);
    runtime.pwm_open(0, 5, 1000.0, 0.5).unwrap().close();
}

#[test]
fn test_soft_timer_reports_dead_generator() {
    init_logging();
    let board = Arc::new(SimBoard::new(4));
    let timer = SoftPwm::new(board.clone(), periphio::Clock::new(), 2);
    let settings = PwmSettings {
        freq_hz: 1000.0,
        duty: 0.5,
    };
    board.configure(2, LineConfig::PushPull).unwrap();
    timer.start(1, 2, settings).unwrap();
    assert!(timer.is_generating(1));

    board.fail_line(2, true);
    thread::sleep(Duration::from_millis(20));
    assert!(!timer.is_generating(1));
    assert_eq!(
        timer.update(1, settings).unwrap_err().kind(),
        ErrorKind::HardwareFault
    );

    board.fail_line(2, false);
    timer.stop(1).unwrap();
    assert_eq!(timer.periods_elapsed(1), None);
}

#[test]
fn test_unrepresentable_period_rejected() {
    init_logging();
    let board = Arc::new(SimBoard::new(8));
    let config = RuntimeConfig::default().with_pwm_limits(PwmLimits {
        min_freq_hz: 0.0,
        max_freq_hz: 1000.0,
    });
    let runtime = Runtime::with_config(board, config);

    let err = runtime.pwm_open(0, 1, 1e-300, 0.5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(runtime.pin_info(1).unwrap().mode, PinMode::Unclaimed);

    let mut pwm = runtime.pwm_open(0, 1, 1.0, 0.5).unwrap();
    assert_eq!(
        pwm.set_frequency(1e-300).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_relative_eq!(pwm.frequency(), 1.0);
    pwm.close();
}
