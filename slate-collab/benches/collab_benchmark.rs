use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use slate_collab::auth::{sign_token, verify_token};
use slate_collab::broadcast::BroadcastGroup;
use slate_collab::protocol::{ClientFrame, Message, ServerEvent, ServerFrame};
use slate_collab::store::{Room, RoomStore, StoreConfig};
use slate_collab::RoomData;
use std::sync::Arc;

fn bench_frame_decode_cursor_move(c: &mut Criterion) {
    let text = r#"{"event":"cursorMove","data":{"roomId":"room-1","x":120.5,"y":340.25}}"#;

    c.bench_function("frame_decode_cursor_move", |b| {
        b.iter(|| {
            black_box(ClientFrame::decode(black_box(text)).unwrap());
        })
    });
}

fn bench_frame_encode_cursor_update(c: &mut Criterion) {
    c.bench_function("frame_encode_cursor_update", |b| {
        b.iter(|| {
            let frame = ServerFrame::push(ServerEvent::CursorUpdate {
                user_id: black_box("user-1".to_string()),
                x: black_box(120.5),
                y: black_box(340.25),
            });
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_frame_encode_drawing_100_elements(c: &mut Criterion) {
    let elements: Vec<_> = (0..100)
        .map(|i| json!({"id": i, "kind": "line", "points": [[0, 0], [i, i]]}))
        .collect();

    c.bench_function("frame_encode_drawing_100_elements", |b| {
        b.iter(|| {
            let frame = ServerFrame::push(ServerEvent::DrawingUpdate(black_box(
                elements.clone(),
            )));
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_conns", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100u64 {
                    let rx = group.join(i, format!("user-{i}")).await;
                    receivers.push(rx);
                }

                let frame = Arc::new(r#"{"event":"cursorUpdate","data":{}}"#.to_string());
                let count = group.send(black_box(Some(1)), black_box(frame));
                black_box(count);
            });
        })
    });
}

fn bench_broadcast_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_frames_100_conns", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100u64 {
                    let rx = group.join(i, format!("user-{i}")).await;
                    receivers.push(rx);
                }

                let frame = Arc::new(r#"{"event":"cursorUpdate","data":{}}"#.to_string());
                for _ in 0..1000 {
                    group.send(black_box(None), black_box(frame.clone()));
                }
            });
        })
    });
}

fn bench_token_verify(c: &mut Criterion) {
    let token = sign_token("user-1", "user-1@example.com", "bench-secret", Some(3600));

    c.bench_function("token_verify", |b| {
        b.iter(|| {
            black_box(verify_token(black_box(&token), black_box("bench-secret")).unwrap());
        })
    });
}

fn bench_store_insert_and_find(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    let mut n = 0u64;
    c.bench_function("store_insert_room", |b| {
        b.iter(|| {
            n += 1;
            let room = Room::create(
                format!("Room {n}"),
                "owner",
                true,
                RoomData::default(),
            );
            black_box(store.insert_room(black_box(&room)).unwrap());
        })
    });

    let room = Room::create("Lookup Target", "owner", true, RoomData::default());
    store.insert_room(&room).unwrap();

    c.bench_function("store_find_room", |b| {
        b.iter(|| {
            black_box(store.find_room(black_box(&room.room_id)).unwrap());
        })
    });
}

fn bench_store_append_message(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let room = Room::create("Chat", "owner", true, RoomData::default());
    store.insert_room(&room).unwrap();

    c.bench_function("store_append_message", |b| {
        b.iter(|| {
            let msg = Message::new("owner", "benchmark message");
            store.append_message(black_box(&room.room_id), black_box(&msg)).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_frame_decode_cursor_move,
    bench_frame_encode_cursor_update,
    bench_frame_encode_drawing_100_elements,
    bench_broadcast_raw,
    bench_broadcast_1000_frames,
    bench_token_verify,
    bench_store_insert_and_find,
    bench_store_append_message,
);
criterion_main!(benches);
