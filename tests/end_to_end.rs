//! End-to-end scenarios over real loopback TCP sockets, with [`LocalGroup`]
//! standing in for the external group primitive (spec.md §8's S1, S4, S5,
//! S6; S2/S3's redistribution math is covered by `src/redistribution.rs`'s
//! own unit tests instead of being re-driven through full engines here).

use std::net::IpAddr;
use std::sync::mpsc;
use std::thread;

use bytes::Bytes;

use pxstream::format::{PixelDataType, PixelFormat};
use pxstream::geometry::Rect;
use pxstream::group::LocalGroup;
use pxstream::net::MessageStream;
use pxstream::producer::{Producer, StreamBehavior};
use pxstream::wire;
use pxstream::Consumer;

const LOCALHOST: &str = "127.0.0.1";

fn localhost() -> IpAddr {
    LOCALHOST.parse().unwrap()
}

/// S1 — 1x1 fabric, RGBA u8, 16x16: three frames, each byte equal to the
/// frame index, delivered unchanged end to end.
#[test]
fn s1_single_producer_single_consumer_delivers_frame_bytes() {
    let (port_tx, port_rx) = mpsc::channel();

    let producer_thread = thread::spawn(move || {
        let group = LocalGroup::new_fleet(1).remove(0);
        let mut producer = Producer::new(localhost(), 15000, 15100, Box::new(group)).unwrap();
        producer.set_image_format(PixelFormat::Rgba, PixelDataType::U8).unwrap();
        producer.set_global_image_size(16, 16);
        producer.set_local_image_size(16, 16);
        producer.set_local_image_offset(0, 0);
        port_tx.send(producer.master_port().unwrap()).unwrap();

        producer.listen(StreamBehavior::WaitForAll, 1).unwrap();
        for frame in 0u8..3 {
            producer.set_frame_image(Bytes::from(vec![frame; 16 * 16 * 4]));
            producer.write().unwrap();
            producer.advance_to_next_frame().unwrap();
        }
        producer.finalize().unwrap();
    });

    let port = port_rx.recv().unwrap();
    let consumer_thread = thread::spawn(move || {
        let group = LocalGroup::new_fleet(1).remove(0);
        let consumer = Consumer::new(localhost(), port, Box::new(group)).unwrap();
        assert_eq!(consumer.global_dimensions(), (16, 16));
        assert_eq!(consumer.pixel_format(), PixelFormat::Rgba);

        let desc = consumer.create_global_pixel_selection(Rect::new(16, 16, 0, 0)).unwrap();
        assert_eq!(desc.output_len(), 16 * 16 * 4);

        for frame in 0u8..3 {
            consumer.read().unwrap();
            let mut out = vec![0u8; desc.output_len()];
            consumer.fill_selection(&desc, &mut out).unwrap();
            assert!(out.iter().all(|&b| b == frame), "frame {frame}: expected all bytes == {frame}");
        }
        consumer
    });

    producer_thread.join().unwrap();
    let consumer = consumer_thread.join().unwrap();
    // S5 — after Finalize, ServerFinished() is true once the consumer has
    // observed TAG_FINISHED on its one connection.
    consumer.read().unwrap(); // drain the reader thread past TAG_FINISHED
    assert!(consumer.server_finished());
}

/// S2 — two producers tiling a 32x16 image horizontally, one consumer
/// selecting the straddling middle 16 columns.
#[test]
fn s2_two_producers_one_consumer_horizontal_split() {
    let fleet = LocalGroup::new_fleet(2);
    let (port_tx, port_rx) = mpsc::channel();

    let producers: Vec<_> = fleet
        .into_iter()
        .enumerate()
        .map(|(rank, group)| {
            let port_tx = port_tx.clone();
            thread::spawn(move || {
                let mut producer = Producer::new(localhost(), 15200, 15300, Box::new(group)).unwrap();
                producer.set_image_format(PixelFormat::Rgba, PixelDataType::U8).unwrap();
                producer.set_global_image_size(32, 16);
                producer.set_local_image_size(16, 16);
                producer.set_local_image_offset(rank as u32 * 16, 0);
                if rank == 0 {
                    port_tx.send(producer.master_port().unwrap()).unwrap();
                }
                producer.listen(StreamBehavior::WaitForAll, 1).unwrap();

                let marker = if rank == 0 { 0xAAu8 } else { 0xBBu8 };
                producer.set_frame_image(Bytes::from(vec![marker; 16 * 16 * 4]));
                producer.write().unwrap();
                producer.advance_to_next_frame().unwrap();
                producer.finalize().unwrap();
            })
        })
        .collect();

    let port = port_rx.recv().unwrap();
    let group = LocalGroup::new_fleet(1).remove(0);
    let consumer = Consumer::new(localhost(), port, Box::new(group)).unwrap();
    assert_eq!(consumer.global_dimensions(), (32, 16));

    let desc = consumer.create_global_pixel_selection(Rect::new(16, 16, 8, 0)).unwrap();
    consumer.read().unwrap();
    let mut out = vec![0u8; desc.output_len()];
    consumer.fill_selection(&desc, &mut out).unwrap();

    for row in 0..16usize {
        for col in 0..8usize {
            assert_eq!(out[(row * 16 + col) * 4], 0xAA, "left half should come from producer 0");
        }
        for col in 8..16usize {
            assert_eq!(out[(row * 16 + col) * 4], 0xBB, "right half should come from producer 1");
        }
    }

    for p in producers {
        p.join().unwrap();
    }
}

/// S4 — a second consumer joins mid-stream, after `Write` has already been
/// called for the current frame but before `AdvanceToNextFrame`. The late
/// joiner does not gate advancement of the in-flight frame and is only
/// caught up starting with the next one.
#[test]
fn s4_late_join_does_not_block_in_flight_frame() {
    let (port_tx, port_rx) = mpsc::channel();
    let (frame2_written_tx, frame2_written_rx) = mpsc::channel();

    let producer_thread = thread::spawn(move || {
        let group = LocalGroup::new_fleet(1).remove(0);
        let mut producer = Producer::new(localhost(), 15400, 15500, Box::new(group)).unwrap();
        producer.set_image_format(PixelFormat::Rgba, PixelDataType::U8).unwrap();
        producer.set_global_image_size(4, 4);
        producer.set_local_image_size(4, 4);
        producer.set_local_image_offset(0, 0);
        port_tx.send(producer.master_port().unwrap()).unwrap();

        // Wait for consumer A only.
        producer.listen(StreamBehavior::WaitForAll, 1).unwrap();

        for frame in 0u8..2 {
            producer.set_frame_image(Bytes::from(vec![frame; 4 * 4 * 4]));
            producer.write().unwrap();
            producer.advance_to_next_frame().unwrap();
        }

        // Frame 2: Write happens before consumer B connects.
        producer.set_frame_image(Bytes::from(vec![2u8; 4 * 4 * 4]));
        producer.write().unwrap();
        frame2_written_tx.send(()).unwrap();
        producer.advance_to_next_frame().unwrap();

        // Bring B up to Streaming before the next Write.
        producer.listen(StreamBehavior::WaitForAll, 2).unwrap();

        producer.set_frame_image(Bytes::from(vec![3u8; 4 * 4 * 4]));
        producer.write().unwrap();
        producer.advance_to_next_frame().unwrap();
        producer.finalize().unwrap();
    });

    let port = port_rx.recv().unwrap();
    let consumer_a = thread::spawn(move || {
        let group = LocalGroup::new_fleet(1).remove(0);
        let consumer = Consumer::new(localhost(), port, Box::new(group)).unwrap();
        let desc = consumer.create_global_pixel_selection(Rect::new(4, 4, 0, 0)).unwrap();
        let mut seen = Vec::new();
        for _ in 0u8..4 {
            consumer.read().unwrap();
            let mut out = vec![0u8; desc.output_len()];
            consumer.fill_selection(&desc, &mut out).unwrap();
            seen.push(out[0]);
        }
        seen
    });

    // Only dial in after frame 2's Write has already gone out to A.
    frame2_written_rx.recv().unwrap();
    let consumer_b = thread::spawn(move || {
        let group = LocalGroup::new_fleet(1).remove(0);
        let consumer = Consumer::new(localhost(), port, Box::new(group)).unwrap();
        let desc = consumer.create_global_pixel_selection(Rect::new(4, 4, 0, 0)).unwrap();
        consumer.read().unwrap();
        let mut out = vec![0u8; desc.output_len()];
        consumer.fill_selection(&desc, &mut out).unwrap();
        out[0]
    });

    producer_thread.join().unwrap();
    let a_frames = consumer_a.join().unwrap();
    let b_first_frame = consumer_b.join().unwrap();

    assert_eq!(a_frames, vec![0, 1, 2, 3], "A sees every frame in order");
    assert_eq!(b_first_frame, 3, "B's first Read() surfaces frame 3, not an earlier one");
}

/// S6 — a consumer reporting a different endianness than the producer
/// still completes the handshake, and geometry bytes transit unchanged
/// (host byte order is independent of the declared endianness flag).
#[test]
fn s6_endianness_mismatch_does_not_block_handshake() {
    let group = LocalGroup::new_fleet(1).remove(0);
    let mut producer = Producer::new(localhost(), 15600, 15700, Box::new(group)).unwrap();
    producer.set_image_format(PixelFormat::Rgba, PixelDataType::U8).unwrap();
    producer.set_global_image_size(8, 8);
    producer.set_local_image_size(8, 8);
    producer.set_local_image_offset(0, 0);
    let port = producer.master_port().unwrap();

    let producer_thread = thread::spawn(move || {
        producer.listen(StreamBehavior::WaitForAll, 1).unwrap();
        producer
    });

    let mut raw = MessageStream::connect((localhost(), port)).unwrap();
    for _ in 0..7 {
        raw.recv().unwrap(); // drain the seven bootstrap messages
    }

    let opposite_endianness = 1 - wire::native_endianness();
    let handshake = wire::encode_handshake(1, 0x7f00_0001_0000, opposite_endianness);
    raw.send(&handshake).unwrap();

    let reply = raw.recv().unwrap();
    let geometry = wire::decode_geometry_reply(&reply).unwrap();
    assert_eq!(geometry.width, 8);
    assert_eq!(geometry.height, 8);
    assert_eq!(geometry.offset_x, 0);
    assert_eq!(geometry.offset_y, 0);

    let producer = producer_thread.join().unwrap();
    drop(producer);
}
