use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dio_seq::bench::{BenchPins, BenchReport, TestBench};
use dio_seq::http::parse_test_request;
use dio_seq::sim::SimBoard;
use dio_seq::{DiSeq, Dio, DispatchMode, DoSeq, Level, Pulse, TimeUnit};

const OUT: i32 = 5;
const IN: i32 = 6;
const DHT: i32 = 4;

fn engine() -> (SimBoard, Dio) {
    let board = SimBoard::new();
    let dio = Dio::new(Arc::new(board.clone())).unwrap();
    (board, dio)
}

fn loopback_bench() -> (SimBoard, Dio, TestBench) {
    let (board, dio) = engine();
    board.wire(OUT, IN);
    let bench = TestBench::new(
        dio.clone(),
        BenchPins {
            out: OUT,
            input: IN,
            dht: DHT,
        },
    );
    (board, dio, bench)
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (count.clone(), count)
}

fn durations(pulses: &[Pulse]) -> Vec<u32> {
    pulses.iter().map(|p| p.duration).collect()
}

fn input_report(reports: &[BenchReport]) -> (bool, Vec<Pulse>) {
    reports
        .iter()
        .find_map(|report| match report {
            BenchReport::InputDone {
                ended_by_timeout,
                pulses,
                ..
            } => Some((*ended_by_timeout, pulses.clone())),
            _ => None,
        })
        .expect("no input report")
}

#[test]
fn output_levels_follow_the_steps() {
    let (board, dio) = engine();
    let seq = DoSeq::new(&dio, OUT, 3).unwrap();
    seq.add(Level::Low, 1000).unwrap();
    seq.add(Level::High, 1500).unwrap();
    seq.add(Level::Low, 2000).unwrap();
    let (done, seen) = counter();
    seq.set_callback(
        move |_: &DoSeq| {
            seen.fetch_add(1, Ordering::SeqCst);
        },
        DispatchMode::Direct,
    );

    seq.start_ms().unwrap();
    assert_eq!(board.level(OUT), Level::Low);
    board.advance_ms(999);
    assert_eq!(board.level(OUT), Level::Low);
    board.advance_ms(1);
    assert_eq!(board.level(OUT), Level::High);
    board.advance_ms(1_499);
    assert_eq!(board.level(OUT), Level::High);
    board.advance_ms(1);
    assert_eq!(board.level(OUT), Level::Low);
    board.advance_ms(1_999);
    assert_eq!(done.load(Ordering::SeqCst), 0);
    board.advance_ms(1);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(board.timer_fires("do_seq"), 3);
    assert!(!seq.is_running());
    assert_eq!(
        board.trace_of(OUT),
        vec![
            (0, Level::Low),
            (1_000_000, Level::High),
            (2_500_000, Level::Low)
        ]
    );

    board.advance_ms(10_000);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn microsecond_step_completes_once() {
    let (board, dio) = engine();
    let seq = DoSeq::new(&dio, OUT, 1).unwrap();
    seq.add(Level::Low, 5).unwrap();
    let (done, seen) = counter();
    seq.set_callback(
        move |_: &DoSeq| {
            seen.fetch_add(1, Ordering::SeqCst);
        },
        DispatchMode::Task,
    );

    seq.start_us().unwrap();
    board.advance_us(4);
    assert_eq!(dio.run_pending(), 0);
    board.advance_us(1);
    assert_eq!(dio.run_pending(), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(seq.unit(), TimeUnit::Micros);
}

#[test]
fn dropped_handle_still_completes() {
    let (board, dio) = engine();
    let (done, seen) = counter();
    {
        let seq = DoSeq::new(&dio, OUT, 2).unwrap();
        seq.add(Level::Low, 10).unwrap();
        seq.add(Level::High, 10).unwrap();
        seq.set_callback(
            move |seq: &DoSeq| {
                assert_eq!(seq.cursor(), 2);
                seen.fetch_add(1, Ordering::SeqCst);
            },
            DispatchMode::Task,
        );
        seq.start_ms().unwrap();
    }
    board.advance_ms(20);
    dio.run_pending();
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn short_capture_ends_by_timeout() {
    let (board, dio) = engine();
    let capture = DiSeq::new(&dio, IN, 9, 20, TimeUnit::Millis).unwrap();
    let result = Arc::new(Mutex::new(Vec::new()));
    let sink = result.clone();
    capture.set_callback(
        move |seq: &DiSeq| {
            sink.lock()
                .unwrap()
                .push((seq.ended_by_timeout(), seq.pulses()));
        },
        DispatchMode::Direct,
    );

    capture.start().unwrap();
    board.drive_at(IN, Level::Low, 2_000);
    board.drive_at(IN, Level::High, 5_000);
    board.drive_at(IN, Level::Low, 9_000);
    board.advance_ms(25);

    let result = result.lock().unwrap();
    assert_eq!(result.len(), 1);
    let (ended_by_timeout, pulses) = &result[0];
    assert!(*ended_by_timeout);
    assert!(pulses.len() < capture.target_len());
    assert_eq!(durations(pulses), vec![2_000, 3_000, 4_000]);
    assert_eq!(
        pulses.iter().map(|p| p.level).collect::<Vec<_>>(),
        vec![Level::High, Level::Low, Level::High]
    );
    assert!(!board.edge_enabled(IN));
}

#[test]
fn full_capture_is_not_a_timeout() {
    let (board, dio) = engine();
    let capture = DiSeq::new(&dio, IN, 4, 50, TimeUnit::Millis).unwrap();
    let (done, seen) = counter();
    capture.set_callback(
        move |seq: &DiSeq| {
            assert_eq!(seq.pulse_count(), seq.target_len());
            assert!(!seq.ended_by_timeout());
            seen.fetch_add(1, Ordering::SeqCst);
        },
        DispatchMode::Direct,
    );

    capture.start().unwrap();
    for (i, at) in [1_000u64, 2_000, 3_000, 4_000, 5_000, 6_000].iter().enumerate() {
        board.drive_at(IN, Level::from(i % 2 == 1), *at);
    }
    board.advance_ms(100);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(capture.pulse_count(), 4);
    assert_eq!(board.timer_fires("di_seq"), 0);
}

#[test]
fn restart_after_clear_is_a_fresh_capture() {
    let (board, dio) = engine();
    let capture = DiSeq::new(&dio, IN, 3, 10, TimeUnit::Millis).unwrap();
    capture.set_callback(|_: &DiSeq| {}, DispatchMode::Direct);

    capture.start().unwrap();
    board.drive_at(IN, Level::Low, 1_000);
    board.advance_ms(10);
    assert!(capture.ended_by_timeout());
    assert_eq!(capture.pulse_count(), 1);

    board.release(IN);
    capture.clear().unwrap();
    assert_eq!(capture.pulse_count(), 0);
    capture.start().unwrap();
    let t0 = board.now_us();
    board.drive_at(IN, Level::Low, t0 + 300);
    board.drive_at(IN, Level::High, t0 + 700);
    board.drive_at(IN, Level::Low, t0 + 1_200);
    board.advance_ms(2);

    assert!(!capture.ended_by_timeout());
    assert_eq!(durations(&capture.pulses()), vec![300, 400, 500]);
}

#[test]
fn edge_at_the_timeout_instant_completes_once() {
    let (board, dio) = engine();
    let capture = DiSeq::new(&dio, IN, 1, 20, TimeUnit::Millis).unwrap();
    let (done, seen) = counter();
    capture.set_callback(
        move |_: &DiSeq| {
            seen.fetch_add(1, Ordering::SeqCst);
        },
        DispatchMode::Task,
    );

    board.drive_at(IN, Level::Low, 20_000);
    capture.start().unwrap();
    board.advance_ms(40);
    dio.run_pending();

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!capture.ended_by_timeout());
    assert_eq!(capture.pulse_count(), 1);
}

#[test]
fn timeout_at_the_edge_instant_completes_once() {
    let (board, dio) = engine();
    let capture = DiSeq::new(&dio, IN, 1, 20, TimeUnit::Millis).unwrap();
    let (done, seen) = counter();
    capture.set_callback(
        move |_: &DiSeq| {
            seen.fetch_add(1, Ordering::SeqCst);
        },
        DispatchMode::Task,
    );

    capture.start().unwrap();
    board.drive_at(IN, Level::Low, 20_000);
    board.advance_ms(40);

    assert_eq!(dio.run_pending(), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(capture.ended_by_timeout());
    assert_eq!(capture.pulse_count(), 0);
}

#[test]
fn a_dropped_capture_does_not_silence_its_pin() {
    let (board, dio) = engine();
    let capture = DiSeq::new(&dio, DHT, 2, 20, TimeUnit::Millis).unwrap();
    let (done, seen) = counter();
    capture.set_callback(
        move |_: &DiSeq| {
            seen.fetch_add(1, Ordering::SeqCst);
        },
        DispatchMode::Direct,
    );
    drop(DiSeq::new(&dio, DHT, 82, 1_000, TimeUnit::Millis).unwrap());

    capture.start().unwrap();
    board.drive_at(DHT, Level::Low, 500);
    board.drive_at(DHT, Level::High, 900);
    board.advance_ms(5);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!capture.ended_by_timeout());
    assert_eq!(durations(&capture.pulses()), vec![500, 400]);
}

#[test]
fn bench_6_loops_back_microsecond_steps() {
    let (board, dio, bench) = loopback_bench();
    assert!(bench.run_test(6).unwrap());
    board.advance_ms(20);
    dio.run_pending();

    let reports = bench.reports();
    assert!(reports.contains(&BenchReport::OutputDone { pin: OUT }));
    let (ended_by_timeout, pulses) = input_report(&reports);
    assert!(!ended_by_timeout);
    assert_eq!(pulses.len(), 9);
    assert_eq!(pulses[0], Pulse::new(Level::High, 0));
    assert!(pulses[1..].iter().all(|p| p.duration == 1_000));
    assert_eq!(pulses[1].level, Level::Low);
}

#[test]
fn bench_7_captures_millisecond_steps() {
    let (board, dio, bench) = loopback_bench();
    bench.run_test(7).unwrap();
    board.advance_ms(60);
    dio.run_pending();

    let (ended_by_timeout, pulses) = input_report(&bench.reports());
    assert!(!ended_by_timeout);
    assert_eq!(durations(&pulses), vec![0, 5_000, 5_000, 5_000, 5_000, 5_000, 5_000, 5_000, 5_000]);
}

#[test]
fn bench_9_times_out_against_seven_steps() {
    let (board, dio, bench) = loopback_bench();
    bench.run_test(9).unwrap();
    board.advance_ms(49);
    dio.run_pending();
    assert_eq!(bench.reports(), vec![BenchReport::OutputDone { pin: OUT }]);

    board.advance_ms(1);
    dio.run_pending();
    let (ended_by_timeout, pulses) = input_report(&bench.reports());
    assert!(ended_by_timeout);
    assert_eq!(pulses.len(), 7);
}

#[test]
fn bench_10_times_out_without_a_sensor() {
    let (board, dio, bench) = loopback_bench();
    bench.run_test(10).unwrap();
    assert_eq!(board.level(DHT), Level::Low);
    board.advance_us(1_500);
    dio.run_pending();
    assert_eq!(board.level(DHT), Level::High);

    board.advance_ms(1_000);
    dio.run_pending();
    assert_eq!(
        bench.reports(),
        vec![BenchReport::DhtRaw {
            start_to_capture_us: 1_500,
            ended_by_timeout: true,
            pulses: Vec::new(),
        }]
    );
}

#[test]
fn http_body_selects_the_scenario() {
    let (board, dio, bench) = loopback_bench();
    let number = parse_test_request(br#"{"test_number": 1}"#).unwrap();
    assert!(bench.run_test(number).unwrap());
    board.advance_ms(1_000);
    dio.run_pending();
    assert_eq!(bench.reports(), vec![BenchReport::OutputDone { pin: OUT }]);

    let number = parse_test_request(br#"{"test_number": 42}"#).unwrap();
    assert!(!bench.run_test(number).unwrap());
}
