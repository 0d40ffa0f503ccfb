use std::cell::Cell;
use std::rc::Rc;

use chipdrive::pcm::MemoryBudget;
use chipdrive::player::{Clock, CommandStream, Player, PlayerState, Step};
use chipdrive::sink::{CaptureSink, ChipSink};
use chipdrive::source::MemorySource;
use chipdrive::vgm::VgmInterpreter;

/// Clock the test advances by hand.
#[derive(Clone)]
struct TestClock {
    now: Rc<Cell<u32>>,
}

impl TestClock {
    fn new(start: u32) -> (Self, Rc<Cell<u32>>) {
        let now = Rc::new(Cell::new(start));
        (Self { now: now.clone() }, now)
    }
}

impl Clock for TestClock {
    fn now_micros(&mut self) -> u32 {
        self.now.get()
    }
}

/// Stream that replays a fixed list of steps.
struct ScriptStream {
    steps: Vec<Step>,
    idx: usize,
    looping: bool,
}

impl ScriptStream {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            idx: 0,
            looping: false,
        }
    }

    fn with_loop(steps: Vec<Step>) -> Self {
        Self {
            steps,
            idx: 0,
            looping: true,
        }
    }
}

impl CommandStream for ScriptStream {
    fn process_one(&mut self, _sink: &mut dyn ChipSink) -> Step {
        match self.steps.get(self.idx) {
            Some(&step) => {
                self.idx += 1;
                step
            }
            None => Step::End,
        }
    }

    fn seek_to_loop(&mut self) -> bool {
        if self.looping {
            self.idx = 0;
            true
        } else {
            false
        }
    }

    fn has_loop(&self) -> bool {
        self.looping
    }

    fn total_samples(&self) -> u32 {
        self.steps
            .iter()
            .map(|s| match s {
                Step::Wait(n) => *n,
                _ => 0,
            })
            .sum()
    }
}

fn player_at(start: u32) -> (Player<TestClock>, Rc<Cell<u32>>) {
    let (clock, now) = TestClock::new(start);
    (Player::with_clock(clock), now)
}

#[test]
fn scheduler_tracks_wall_clock_at_441_per_10ms() {
    let (mut player, now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.play(Box::new(ScriptStream::new(vec![Step::Wait(100_000)])), &mut sink);

    now.set(10_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 441);

    now.set(20_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 882);

    now.set(1_000_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 44_100);
}

#[test]
fn play_mutes_chips_first() {
    let (mut player, _now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.play(Box::new(ScriptStream::new(vec![Step::Wait(10)])), &mut sink);
    assert_eq!(sink.mutes, 1);
    assert!(player.is_playing());
}

#[test]
fn finishing_resets_the_hardware() {
    let (mut player, now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.play(Box::new(ScriptStream::new(vec![Step::Wait(10)])), &mut sink);

    now.set(1_000_000);
    player.poll(&mut sink);
    assert_eq!(player.state(), PlayerState::Finished);
    assert_eq!(sink.resets, 1);
    assert_eq!(player.current_sample(), 10);
}

#[test]
fn looping_restarts_instead_of_finishing() {
    let (mut player, now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.set_looping(true);
    player.play(
        Box::new(ScriptStream::with_loop(vec![Step::Wait(10)])),
        &mut sink,
    );

    now.set(10_000);
    player.poll(&mut sink);
    assert!(player.is_playing());
    // Position restarts each pass through the 10-sample body.
    assert!(player.current_sample() <= 10);
    assert_eq!(sink.resets, 0);
}

#[test]
fn pause_and_resume_preserve_position() {
    let (mut player, now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.play(Box::new(ScriptStream::new(vec![Step::Wait(100_000)])), &mut sink);

    now.set(10_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 441);

    player.pause(&mut sink);
    assert!(player.is_paused());
    assert_eq!(sink.mutes, 2);

    // A long pause must not advance the position.
    now.set(500_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 441);

    player.resume();
    assert!(player.is_playing());
    now.set(510_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 882);
}

#[test]
fn counter_wraparound_keeps_time() {
    let (mut player, now) = player_at(u32::MAX - 0x0FFF);
    let mut sink = CaptureSink::new();
    player.play(Box::new(ScriptStream::new(vec![Step::Wait(100_000)])), &mut sink);

    // 0x2000 microseconds later the counter has wrapped through zero.
    now.set(0x1000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 8192 * 441 / 10_000);
    assert!(player.is_playing());
}

#[test]
fn implausible_elapsed_resets_time_base() {
    let (mut player, now) = player_at(1_000_000);
    let mut sink = CaptureSink::new();
    player.play(Box::new(ScriptStream::new(vec![Step::Wait(100_000)])), &mut sink);

    // The counter jumping backwards reads as a huge elapsed span; the base
    // resets and position is kept.
    now.set(0);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 0);
    assert!(player.is_playing());

    now.set(10_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 441);
}

#[test]
fn input_starvation_freezes_the_timeline() {
    let (mut player, now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.play(
        Box::new(ScriptStream::new(vec![
            Step::Wait(441),
            Step::NeedData,
            Step::Wait(441),
        ])),
        &mut sink,
    );

    now.set(10_000);
    player.poll(&mut sink);
    assert_eq!(player.current_sample(), 441);

    // The stream starves; the session stays alive and holds position.
    now.set(60_000);
    player.poll(&mut sink);
    assert!(player.is_playing());
    assert_eq!(player.current_sample(), 441);

    // Data arrives; progress resumes from where it stopped instead of
    // bursting through the starved interval.
    now.set(70_000);
    player.poll(&mut sink);
    assert!(player.is_playing());
    assert_eq!(player.current_sample(), 882);
}

#[test]
fn stop_resets_and_clears_stream() {
    let (mut player, now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.play(Box::new(ScriptStream::new(vec![Step::Wait(100)])), &mut sink);

    player.stop(&mut sink);
    assert!(player.is_stopped());
    assert_eq!(sink.resets, 1);
    assert_eq!(player.total_samples(), 0);

    // Polling a stopped player does nothing.
    now.set(1_000_000);
    player.poll(&mut sink);
    assert!(player.is_stopped());
}

#[test]
fn stop_when_already_stopped_is_a_no_op() {
    let (mut player, _now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.stop(&mut sink);
    assert_eq!(sink.resets, 0);
}

#[test]
fn plays_a_vgm_stream_to_completion() {
    let mut bytes = vec![0u8; 0x40];
    bytes[0..4].copy_from_slice(b"Vgm ");
    bytes[0x08..0x0C].copy_from_slice(&0x171u32.to_le_bytes());
    bytes[0x18..0x1C].copy_from_slice(&44_100u32.to_le_bytes());
    bytes[0x2C..0x30].copy_from_slice(&7_670_453u32.to_le_bytes());
    // One 44032-sample wait, then end.
    bytes.extend_from_slice(&[0x61, 0x00, 0xAC, 0x66]);

    let stream =
        VgmInterpreter::open(Box::new(MemorySource::new(bytes)), MemoryBudget::default())
            .unwrap();

    let (mut player, now) = player_at(0);
    let mut sink = CaptureSink::new();
    player.play(Box::new(stream), &mut sink);
    assert_eq!(player.total_samples(), 44_100);

    // Just short of the wait: still playing.
    now.set(998_000);
    player.poll(&mut sink);
    assert!(player.is_playing());

    now.set(1_000_000);
    player.poll(&mut sink);
    assert!(player.is_finished());
    assert_eq!(player.current_sample(), 44_032);
    assert_eq!(sink.resets, 1);
}
