use criterion::{black_box, criterion_group, criterion_main, Criterion};
use listenstat::event::validate::Validator;

const SESSION: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn heartbeat_batch(n: usize) -> Vec<u8> {
    let entries: Vec<_> = (0..n)
        .map(|i| {
            serde_json::json!({
                "event_type": "heartbeat",
                "track_stem": format!("album-{}/track", i % 7).replace('/', "-"),
                "position_seconds": (i % 600) as f64 + 0.25,
                "metadata": {"client": "web", "bitrate": 320, "buffer_ms": i % 1000},
            })
        })
        .collect();
    serde_json::to_vec(&entries).expect("encode")
}

fn mixed_batch() -> Vec<u8> {
    let raw = r#"[
        {"event_type": "session_start", "track_stem": null, "metadata": {"ua": "firefox"}},
        {"event_type": "play", "track_stem": "intro", "position_seconds": 0},
        {"event_type": "seek", "track_stem": "intro", "position_seconds": 42.5,
         "metadata": "{\"from_position\": 10, \"to_position\": 42.5}"},
        {"event_type": "pause", "track_stem": "intro", "position_seconds": 43},
        {"event_type": "dropout", "track_stem": "../escape", "position_seconds": 44},
        {"event_type": "complete", "track_stem": "intro", "position_seconds": 180},
        {"event_type": "session_end"}
    ]"#;
    raw.as_bytes().to_vec()
}

fn bench_validator(c: &mut Criterion) {
    let validator = Validator::default();

    let small = mixed_batch();
    c.bench_function("validate_mixed_7", |b| {
        b.iter(|| {
            let out = validator
                .validate_batch(black_box(SESSION), black_box(&small))
                .expect("valid batch");
            black_box(out.events.len());
        });
    });

    let full = heartbeat_batch(500);
    c.bench_function("validate_heartbeats_500", |b| {
        b.iter(|| {
            let out = validator
                .validate_batch(black_box(SESSION), black_box(&full))
                .expect("valid batch");
            black_box(out.events.len());
        });
    });
}

criterion_group!(benches, bench_validator);
criterion_main!(benches);
