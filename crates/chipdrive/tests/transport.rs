use chipdrive::pcm::MemoryBudget;
use chipdrive::player::{CommandStream, Step};
use chipdrive::sink::{CaptureSink, ChipWrite};
use chipdrive::source::ByteSource;
use chipdrive::transport::{BridgeEvent, BridgeReceiver, ChunkReceiver, Reply, RingBuffer};
use chipdrive::vgm::VgmInterpreter;

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(payload.len() as u8, |acc, b| acc ^ b)
}

/// Feed a complete frame, returning the replies produced along the way.
fn feed_frame(rx: &mut ChunkReceiver, payload: &[u8], now: u32) -> Vec<Reply> {
    let mut frame = vec![0x01, payload.len() as u8];
    frame.extend_from_slice(payload);
    frame.push(checksum(payload));
    frame.iter().filter_map(|&b| rx.receive(b, now)).collect()
}

fn drain(rx: &ChunkReceiver) -> Vec<u8> {
    let mut src = rx.source();
    let mut out = Vec::new();
    while let Some(b) = src.read() {
        out.push(b);
    }
    out
}

#[test]
fn ring_capacity_rounds_to_power_of_two() {
    assert_eq!(RingBuffer::new(100).capacity(), 128);
    assert_eq!(RingBuffer::new(128).capacity(), 128);
    assert_eq!(RingBuffer::new(1).capacity(), 2);
}

#[test]
fn ring_len_plus_free_is_constant() {
    let mut ring = RingBuffer::new(16);
    for fill in 0..ring.capacity() - 1 {
        assert_eq!(ring.len(), fill);
        assert_eq!(ring.len() + ring.free(), ring.capacity() - 1);
        assert!(ring.push(fill as u8));
    }
    // One slot stays empty even when "full".
    assert_eq!(ring.free(), 0);
    assert!(!ring.push(0xFF));
}

#[test]
fn ring_is_fifo_across_wraparound() {
    let mut ring = RingBuffer::new(8);
    for round in 0..5u8 {
        for i in 0..6 {
            assert!(ring.push(round * 10 + i));
        }
        for i in 0..6 {
            assert_eq!(ring.pop(), Some(round * 10 + i));
        }
    }
    assert_eq!(ring.pop(), None);
}

#[test]
fn ring_position_counts_consumed_bytes() {
    let mut ring = RingBuffer::new(8);
    assert!(ring.push_all(&[1, 2, 3]));
    assert_eq!(ring.position(), 0);
    assert_eq!(ring.read(), Some(1));
    assert_eq!(ring.read(), Some(2));
    assert_eq!(ring.position(), 2);
}

#[test]
fn ring_push_all_is_all_or_nothing() {
    let mut ring = RingBuffer::new(8);
    assert!(!ring.push_all(&[0; 10]));
    assert!(ring.is_empty());
    assert!(ring.push_all(&[0; 7]));
    assert_eq!(ring.len(), 7);
}

#[test]
fn ping_answers_with_handshake() {
    let mut rx = ChunkReceiver::new(64, 0x42);
    assert_eq!(rx.receive(0x00, 0), Some(Reply::Handshake(0x42)));

    let mut wire = Vec::new();
    Reply::Handshake(0x42).encode(&mut wire);
    assert_eq!(wire, vec![0x0F, 0x42, 0x06]);
}

#[test]
fn valid_chunk_is_acknowledged_and_buffered() {
    let mut rx = ChunkReceiver::new(64, 0);
    let replies = feed_frame(&mut rx, &[0xAA, 0xBB, 0xCC], 0);
    assert_eq!(replies, vec![Reply::Ready]);
    assert_eq!(drain(&rx), vec![0xAA, 0xBB, 0xCC]);
}

#[test]
fn corrupted_chunk_is_rejected_without_side_effects() {
    let mut rx = ChunkReceiver::new(64, 0);
    let frame = [0x01, 0x03, 0xAA, 0xBB, 0xCC, 0x00]; // wrong checksum
    let mut replies = Vec::new();
    for &b in &frame {
        if let Some(r) = rx.receive(b, 0) {
            replies.push(r);
        }
    }
    assert_eq!(replies, vec![Reply::Nak]);
    assert_eq!(rx.buffered(), 0);

    // The sender retries the same frame and succeeds.
    let replies = feed_frame(&mut rx, &[0xAA, 0xBB, 0xCC], 0);
    assert_eq!(replies, vec![Reply::Ready]);
    assert_eq!(drain(&rx), vec![0xAA, 0xBB, 0xCC]);
}

#[test]
fn single_flipped_payload_bit_is_detected() {
    let payload = [0x10, 0x20, 0x30, 0x40];
    let mut frame = vec![0x01, payload.len() as u8];
    frame.extend_from_slice(&payload);
    frame.push(checksum(&payload));
    frame[3] ^= 0x04;

    let mut rx = ChunkReceiver::new(64, 0);
    let replies: Vec<Reply> = frame.iter().filter_map(|&b| rx.receive(b, 0)).collect();
    assert_eq!(replies, vec![Reply::Nak]);
}

#[test]
fn corrupted_length_byte_is_detected() {
    let payload = [0xAA, 0xBB, 0xCC];
    let mut frame = vec![0x01, payload.len() as u8];
    frame.extend_from_slice(&payload);
    frame.push(checksum(&payload));
    // Length shrinks to 2: the checksum is computed over fewer bytes and
    // the comparison happens one byte early, against payload data.
    frame[1] = 2;

    let mut rx = ChunkReceiver::new(64, 0);
    let replies: Vec<Reply> = frame[..5].iter().filter_map(|&b| rx.receive(b, 0)).collect();
    assert_eq!(replies, vec![Reply::Nak]);
    assert_eq!(rx.buffered(), 0);
}

#[test]
fn chunk_that_does_not_fit_is_rejected() {
    // Capacity 8 leaves 7 usable bytes.
    let mut rx = ChunkReceiver::new(8, 0);
    assert_eq!(feed_frame(&mut rx, &[1, 2, 3, 4, 5], 0), vec![Reply::Ready]);
    // Buffer now holds 5 of 7; another 5 bytes cannot fit.
    assert_eq!(feed_frame(&mut rx, &[6, 7, 8, 9, 10], 0), vec![Reply::Nak]);
    assert_eq!(rx.buffered(), 5);

    // After the consumer drains, the retry goes through.
    drain(&rx);
    assert_eq!(feed_frame(&mut rx, &[6, 7, 8, 9, 10], 0), vec![Reply::Ready]);
}

#[test]
fn empty_chunk_is_valid() {
    let mut rx = ChunkReceiver::new(64, 0);
    assert_eq!(feed_frame(&mut rx, &[], 0), vec![Reply::Ready]);
    assert_eq!(rx.buffered(), 0);
}

#[test]
fn stream_end_marker_is_latched() {
    let mut rx = ChunkReceiver::new(64, 0);
    feed_frame(&mut rx, &[1, 2], 0);
    assert!(!rx.is_ended());
    assert_eq!(rx.receive(0x02, 0), None);
    assert!(rx.is_ended());
}

#[test]
fn silence_mid_stream_times_out_and_mutes() {
    let mut rx = ChunkReceiver::new(64, 0);
    let mut sink = CaptureSink::new();
    feed_frame(&mut rx, &[1, 2, 3], 0);

    // Quiet but within the window: nothing happens.
    rx.check_timeout(500_000, &mut sink);
    assert_eq!(sink.mutes, 0);
    assert_eq!(rx.buffered(), 3);

    rx.check_timeout(1_500_000, &mut sink);
    assert_eq!(sink.mutes, 1);
    assert_eq!(rx.buffered(), 0);

    // Only one reset per abandonment.
    rx.check_timeout(3_000_000, &mut sink);
    assert_eq!(sink.mutes, 1);

    // A fresh stream is accepted afterwards.
    assert_eq!(feed_frame(&mut rx, &[9], 4_000_000), vec![Reply::Ready]);
    assert_eq!(drain(&rx), vec![9]);
}

#[test]
fn timeout_does_not_fire_before_any_traffic() {
    let mut rx = ChunkReceiver::new(64, 0);
    let mut sink = CaptureSink::new();
    rx.check_timeout(10_000_000, &mut sink);
    assert_eq!(sink.mutes, 0);
}

#[test]
fn partial_frame_survives_interleaved_polling() {
    // Bytes arrive one at a time with replies only at frame boundaries.
    let mut rx = ChunkReceiver::new(64, 0);
    let payload = [0x55, 0x66];
    let mut frame = vec![0x01, 2];
    frame.extend_from_slice(&payload);
    frame.push(checksum(&payload));

    for (i, &b) in frame.iter().enumerate() {
        let reply = rx.receive(b, i as u32);
        if i < frame.len() - 1 {
            assert_eq!(reply, None);
        } else {
            assert_eq!(reply, Some(Reply::Ready));
        }
    }
}

/// Minimal playable header: PSG only, data at 0x40.
fn vgm_header(total_samples: u32) -> Vec<u8> {
    let mut raw = vec![0u8; 0x40];
    raw[0..4].copy_from_slice(b"Vgm ");
    raw[0x08..0x0C].copy_from_slice(&0x0171u32.to_le_bytes());
    raw[0x0C..0x10].copy_from_slice(&3_579_545u32.to_le_bytes());
    raw[0x18..0x1C].copy_from_slice(&total_samples.to_le_bytes());
    raw[0x34..0x38].copy_from_slice(&0x0Cu32.to_le_bytes());
    raw
}

#[test]
fn interpreter_plays_from_receiver_while_frames_arrive() {
    let mut rx = ChunkReceiver::new(256, 0);
    assert_eq!(feed_frame(&mut rx, &vgm_header(1000), 0), vec![Reply::Ready]);

    let mut stream = VgmInterpreter::open(Box::new(rx.source()), MemoryBudget::default())
        .expect("header should open");
    let mut sink = CaptureSink::new();

    // Nothing buffered yet: the session stays alive and waits for more.
    assert_eq!(stream.process_one(&mut sink), Step::NeedData);
    assert!(!stream.is_finished());

    assert_eq!(feed_frame(&mut rx, &[0x70], 0), vec![Reply::Ready]);
    assert_eq!(stream.process_one(&mut sink), Step::Wait(1));

    // A command split across frames resumes without losing operands.
    assert_eq!(feed_frame(&mut rx, &[0x61, 0x00], 0), vec![Reply::Ready]);
    assert_eq!(stream.process_one(&mut sink), Step::NeedData);
    assert!(!stream.is_finished());
    assert_eq!(feed_frame(&mut rx, &[0xAC], 0), vec![Reply::Ready]);
    assert_eq!(stream.process_one(&mut sink), Step::Wait(0xAC00));

    assert_eq!(feed_frame(&mut rx, &[0x50], 0), vec![Reply::Ready]);
    assert_eq!(stream.process_one(&mut sink), Step::NeedData);
    assert_eq!(feed_frame(&mut rx, &[0x9F], 0), vec![Reply::Ready]);
    assert_eq!(stream.process_one(&mut sink), Step::Continue);
    assert_eq!(sink.writes, vec![ChipWrite::Psg(0x9F)]);

    // The end marker turns the next underrun into a real end of stream.
    assert_eq!(rx.receive(0x02, 0), None);
    assert_eq!(stream.process_one(&mut sink), Step::End);
    assert!(stream.is_finished());
}

#[test]
fn data_block_payload_split_across_frames() {
    let mut rx = ChunkReceiver::new(256, 0);
    feed_frame(&mut rx, &vgm_header(100), 0);

    let mut stream = VgmInterpreter::open(Box::new(rx.source()), MemoryBudget::default())
        .expect("header should open");
    let mut sink = CaptureSink::new();

    // Block introducer plus half the payload in one frame.
    feed_frame(
        &mut rx,
        &[0x67, 0x66, 0x00, 0x04, 0x00, 0x00, 0x00, 0x10, 0x20],
        0,
    );
    assert_eq!(stream.process_one(&mut sink), Step::NeedData);

    // Rest of the payload, then a DAC write command.
    feed_frame(&mut rx, &[0x30, 0x40, 0x81], 0);
    assert_eq!(stream.process_one(&mut sink), Step::Continue);
    assert_eq!(stream.pcm().stored_len(), 4);
    assert_eq!(stream.process_one(&mut sink), Step::Wait(1));
    assert_eq!(sink.writes, vec![ChipWrite::Dac(0x10)]);
}

#[test]
fn bridge_decodes_psg_write() {
    let mut rx = BridgeReceiver::new();
    let mut events = Vec::new();
    for &b in &[0x10, 0x00, 0x50, 0x9F] {
        if let Some(e) = rx.receive(b) {
            events.push(e);
        }
    }
    assert_eq!(
        events,
        vec![BridgeEvent::Write {
            delay_us: 0x10,
            write: ChipWrite::Psg(0x9F),
        }]
    );
}

#[test]
fn bridge_decodes_fm_writes_on_both_ports() {
    let mut rx = BridgeReceiver::new();
    let bytes = [
        0xE8, 0x03, 0x52, 0x28, 0xF0, // port 0 after 1000 us
        0x00, 0x00, 0x53, 0xB4, 0xC0, // port 1 immediately
    ];
    let events: Vec<BridgeEvent> = bytes.iter().filter_map(|&b| rx.receive(b)).collect();
    assert_eq!(
        events,
        vec![
            BridgeEvent::Write {
                delay_us: 1000,
                write: ChipWrite::ChipA { port: 0, reg: 0x28, value: 0xF0 },
            },
            BridgeEvent::Write {
                delay_us: 0,
                write: ChipWrite::ChipA { port: 1, reg: 0xB4, value: 0xC0 },
            },
        ]
    );
}

#[test]
fn bridge_end_marker() {
    let mut rx = BridgeReceiver::new();
    let events: Vec<BridgeEvent> = [0x00, 0x00, 0x66]
        .iter()
        .filter_map(|&b| rx.receive(b))
        .collect();
    assert_eq!(events, vec![BridgeEvent::End]);
}

#[test]
fn bridge_recovers_after_unknown_opcode() {
    let mut rx = BridgeReceiver::new();
    // Unknown opcode aborts its event; the next event decodes normally.
    let bytes = [0x00, 0x00, 0x70, 0x00, 0x00, 0x50, 0x11];
    let events: Vec<BridgeEvent> = bytes.iter().filter_map(|&b| rx.receive(b)).collect();
    assert_eq!(
        events,
        vec![BridgeEvent::Write {
            delay_us: 0,
            write: ChipWrite::Psg(0x11),
        }]
    );
}
