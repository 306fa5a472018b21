use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use redis_weave::protocol::{Resp3Decoder, Resp3Encoder};
use redis_weave::{calculate_slot, Command, Message};
use std::io::Cursor;

fn bench_encode_command(c: &mut Criterion) {
    c.bench_function("encode_command", |b| {
        let cmd = Command::builder("SET").key("mykey").arg("myvalue").build();
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(64);
            Resp3Encoder::encode_command(black_box(cmd.args()), &mut buf);
            black_box(buf);
        });
    });
}

fn bench_encode_pipeline(c: &mut Criterion) {
    c.bench_function("encode_pipeline_100", |b| {
        let cmds: Vec<Command> = (0..100)
            .map(|i| Command::builder("GET").key(format!("key:{}", i)).build())
            .collect();
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(4096);
            for cmd in &cmds {
                Resp3Encoder::encode_command(cmd.args(), &mut buf);
            }
            black_box(buf);
        });
    });
}

fn bench_encode_message(c: &mut Criterion) {
    c.bench_function("encode_map", |b| {
        let msg = Message::map(vec![
            (Message::blob("server"), Message::blob("valkey")),
            (Message::blob("version"), Message::blob("8.0.1")),
            (Message::blob("proto"), Message::int(3)),
        ]);
        b.iter(|| {
            let mut buf = BytesMut::new();
            Resp3Encoder::encode_message(black_box(&msg), &mut buf);
            black_box(buf);
        });
    });
}

fn bench_decode_simple_string(c: &mut Criterion) {
    c.bench_function("decode_simple_string", |b| {
        let data = b"+OK\r\n";
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(&data[..]));
            Resp3Decoder::decode(&mut cursor).unwrap();
        });
    });
}

fn bench_decode_blob_string(c: &mut Criterion) {
    c.bench_function("decode_blob_string", |b| {
        let data = b"$13\r\nHello, Redis!\r\n";
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(&data[..]));
            Resp3Decoder::decode(&mut cursor).unwrap();
        });
    });
}

fn bench_decode_invalidation(c: &mut Criterion) {
    c.bench_function("decode_invalidate_push", |b| {
        let data = b">2\r\n$10\r\ninvalidate\r\n*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(&data[..]));
            Resp3Decoder::decode(&mut cursor).unwrap();
        });
    });
}

fn bench_decode_partial(c: &mut Criterion) {
    c.bench_function("decode_partial_frame", |b| {
        let data = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nval";
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(&data[..]));
            assert!(Resp3Decoder::decode(&mut cursor).unwrap().is_none());
        });
    });
}

fn bench_slot(c: &mut Criterion) {
    c.bench_function("calculate_slot_hash_tag", |b| {
        let key = Bytes::from_static(b"user:{1000}:profile");
        b.iter(|| calculate_slot(black_box(&key)));
    });
}

criterion_group!(
    benches,
    bench_encode_command,
    bench_encode_pipeline,
    bench_encode_message,
    bench_decode_simple_string,
    bench_decode_blob_string,
    bench_decode_invalidation,
    bench_decode_partial,
    bench_slot,
);
criterion_main!(benches);
