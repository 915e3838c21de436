//! Throughput benchmarks

use aquatest_core::core::queue;
use aquatest_core::{clean_line, Dispatcher, LogLine, MarkerTest, RecordingSink, TestCase};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn device_log(cycles: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for cycle in 0..cycles {
        lines.push(format!("\x1B[0m[{cycle}] reset cause: POR"));
        lines.push("\x1B[32mAquana SV Bootloader v2.1\x1B[0m".to_string());
        for i in 0..20 {
            lines.push(format!("flash sector {i} verified"));
        }
        lines.push("AQSV Started".to_string());
        lines.push("START_APPLICATION_EVT".to_string());
        lines.push(format!("Calibrated temp: {}C", 20 + cycle % 5));
        lines.push("WAN_COMMS_TIMER_EVT".to_string());
        lines.push("WAN power supply enabled".to_string());
        lines.push("WAN power-up complete".to_string());
        lines.push("cellular_net_registration, Activated IP: 10.0.0.2".to_string());
        lines.push("POST OK".to_string());
        lines.push("Wan_Comms_Timeout_Timer_Stop".to_string());
    }
    lines
}

fn ingest_benchmark(c: &mut Criterion) {
    let raw = device_log(50);

    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Elements(raw.len() as u64));

    group.bench_function("clean_line", |b| {
        b.iter(|| {
            for line in &raw {
                black_box(clean_line(black_box(line)));
            }
        })
    });

    group.bench_function("queue_push_pull", |b| {
        b.iter(|| {
            let (tx, rx) = queue::channel();
            for line in &raw {
                tx.push(line.as_str());
            }
            drop(tx);
            let mut count = 0usize;
            while let Some(line) = rx.pull() {
                count += line.text().len();
            }
            black_box(count)
        })
    });

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let lines: Vec<LogLine> = device_log(50)
        .iter()
        .map(|raw| clean_line(raw))
        .zip(0u64..)
        .map(|(text, seq)| LogLine::new(seq, text))
        .collect();

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(lines.len() as u64));

    group.bench_function("marker_test", |b| {
        let mut sink = RecordingSink::new();
        let mut test = MarkerTest::bootup();
        b.iter(|| {
            test.reset();
            for line in &lines {
                if test.process_line(black_box(line), &mut sink).is_terminal() {
                    test.reset();
                }
            }
            sink.clear();
        })
    });

    group.bench_function("dispatcher_step", |b| {
        b.iter(|| {
            let mut dispatcher = Dispatcher::new(RecordingSink::new());
            dispatcher.register(MarkerTest::bootup()).unwrap();
            dispatcher.register(MarkerTest::checkin()).unwrap();
            for line in &lines {
                black_box(dispatcher.step(line));
            }
            black_box(dispatcher.report())
        })
    });

    group.finish();
}

criterion_group!(benches, ingest_benchmark, dispatch_benchmark);
criterion_main!(benches);
