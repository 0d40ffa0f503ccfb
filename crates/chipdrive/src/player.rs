//! Real-time playback scheduler.
//!
//! The player maps elapsed wall-clock time onto the 44.1 kHz virtual sample
//! timeline and drains interpreter commands accordingly. It is driven by
//! repeated non-blocking [`Player::poll`] calls from the application's main
//! loop; nothing here blocks or spawns threads.
//!
//! Timing policy: target sample counts are computed with integer
//! multiply-then-divide only, so there is no cumulative float drift. When
//! the wall clock outruns the virtual timeline (after a stall), the pending
//! wait debt is simply consumed up to "now" and never replayed at burst
//! rate; playback snaps to the present rather than ever running ahead of or
//! catching up on schedule.

use std::time::Instant;

use crate::sink::ChipSink;

/// One step of interpreter output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Hold playback for this many samples before the next command.
    Wait(u32),
    /// A command was dispatched; more follow immediately.
    Continue,
    /// A live source ran dry mid-stream; retry once more bytes arrive.
    NeedData,
    /// The stream is exhausted.
    End,
}

/// A decoded command stream the player can drain.
///
/// Implemented by both interpreters. `process_one` decodes exactly one
/// command, dispatches any chip writes to `sink`, and reports how playback
/// time advances.
pub trait CommandStream {
    /// Decode and dispatch the next command.
    ///
    /// Streams fed by a live source return [`Step::NeedData`] when input is
    /// momentarily exhausted; the call is re-entrant and resumes the same
    /// command later without losing bytes.
    fn process_one(&mut self, sink: &mut dyn ChipSink) -> Step;

    /// Reposition at the stream's loop point. Returns `false` when the
    /// stream has no loop or the underlying source cannot get there.
    fn seek_to_loop(&mut self) -> bool;

    /// `true` when the stream declares a loop point.
    fn has_loop(&self) -> bool;

    /// Declared length of the stream in samples.
    fn total_samples(&self) -> u32;

    /// Advance any in-progress DAC sample streaming by `advanced` samples.
    ///
    /// Called while wait time is being consumed, so sampled audio can play
    /// out at its own rate between commands. Streams without that facility
    /// ignore it.
    fn tick_dac(&mut self, _advanced: u32, _sink: &mut dyn ChipSink) {}
}

/// Monotonic microsecond counter behind the scheduler.
///
/// The counter is free-running and allowed to wrap; the player detects
/// wraparound and resets its time base. Production code uses [`StdClock`],
/// tests substitute a manual clock.
pub trait Clock {
    fn now_micros(&mut self) -> u32;
}

/// [`Clock`] backed by `std::time::Instant`.
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_micros(&mut self) -> u32 {
        // Deliberately truncating: the scheduler is built for a wrapping
        // 32-bit counter.
        self.origin.elapsed().as_micros() as u32
    }
}

/// Playback session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Playing,
    Paused,
    Finished,
}

/// Sample-accurate playback driver.
///
/// ```no_run
/// use chipdrive::{MemoryBudget, MemorySource, Player, VgmInterpreter};
/// use chipdrive::sink::NullSink;
///
/// # fn load_song() -> Vec<u8> { Vec::new() }
/// let source = MemorySource::new(load_song());
/// let stream = VgmInterpreter::open(Box::new(source), MemoryBudget::default())
///     .expect("not a playable stream");
///
/// let mut sink = NullSink;
/// let mut player = Player::new();
/// player.play(Box::new(stream), &mut sink);
/// while !player.is_finished() {
///     player.poll(&mut sink);
///     // run UI, transport, etc.
/// }
/// ```
pub struct Player<C: Clock = StdClock> {
    clock: C,
    state: PlayerState,
    looping: bool,
    stream: Option<Box<dyn CommandStream>>,
    start_time: u32,
    wait_samples: u32,
    samples_played: u32,
    current_sample: u32,
}

impl Player<StdClock> {
    pub fn new() -> Self {
        Self::with_clock(StdClock::new())
    }
}

impl Default for Player<StdClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Player<C> {
    /// Build a player over an explicit clock.
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: PlayerState::Stopped,
            looping: false,
            stream: None,
            start_time: 0,
            wait_samples: 0,
            samples_played: 0,
            current_sample: 0,
        }
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state == PlayerState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state == PlayerState::Stopped
    }

    pub fn is_finished(&self) -> bool {
        self.state == PlayerState::Finished
    }

    /// Virtual sample position within the current playthrough.
    pub fn current_sample(&self) -> u32 {
        self.current_sample
    }

    /// Declared stream length in samples, or 0 with no stream loaded.
    pub fn total_samples(&self) -> u32 {
        self.stream.as_ref().map_or(0, |s| s.total_samples())
    }

    /// Start playing `stream`. Any session in progress is stopped first.
    pub fn play(&mut self, stream: Box<dyn CommandStream>, sink: &mut dyn ChipSink) {
        self.stop(sink);
        self.stream = Some(stream);
        self.wait_samples = 0;
        self.samples_played = 0;
        self.current_sample = 0;
        self.start_time = self.clock.now_micros();
        sink.mute_all();
        self.state = PlayerState::Playing;
        log::debug!("playback started");
    }

    /// Stop playback and reset the hardware. Synchronous and idempotent.
    pub fn stop(&mut self, sink: &mut dyn ChipSink) {
        if self.state == PlayerState::Stopped {
            return;
        }
        sink.reset();
        self.stream = None;
        self.state = PlayerState::Stopped;
        self.wait_samples = 0;
        self.samples_played = 0;
        self.current_sample = 0;
        log::debug!("playback stopped");
    }

    pub fn pause(&mut self, sink: &mut dyn ChipSink) {
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
            sink.mute_all();
            log::debug!("playback paused");
        }
    }

    /// Resume from pause, recomputing the time base from the samples already
    /// played so position is preserved exactly.
    pub fn resume(&mut self) {
        if self.state == PlayerState::Paused {
            let elapsed = (self.samples_played as u64 * 10_000 / 441) as u32;
            self.start_time = self.clock.now_micros().wrapping_sub(elapsed);
            self.state = PlayerState::Playing;
            log::debug!("playback resumed at sample {}", self.samples_played);
        }
    }

    /// Advance playback to "now". Non-blocking; call from the main loop as
    /// often as possible.
    pub fn poll(&mut self, sink: &mut dyn ChipSink) {
        if self.state != PlayerState::Playing {
            return;
        }

        let now = self.clock.now_micros();
        let mut elapsed = now.wrapping_sub(self.start_time);

        // An implausibly large reading means the counter wrapped. Reset the
        // time base; samples_played keeps the position intact.
        if elapsed > 0x8000_0000 {
            self.start_time = now;
            elapsed = 0;
        }

        // samples = elapsed_us * 44100 / 1_000_000 = elapsed_us * 441 / 10_000
        let target = (elapsed / 10_000) * 441 + (elapsed % 10_000) * 441 / 10_000;

        while self.samples_played < target {
            if self.wait_samples > 0 {
                let advance = (target - self.samples_played).min(self.wait_samples);

                if let Some(stream) = self.stream.as_mut() {
                    stream.tick_dac(advance, sink);
                }

                self.wait_samples -= advance;
                self.samples_played += advance;
                self.current_sample += advance;

                if self.wait_samples > 0 {
                    return;
                }
            }

            if !self.process_commands(sink) {
                // Live input starved. Freeze the virtual timeline at the
                // current position so arriving data resumes in step
                // instead of bursting through the missed interval.
                let behind = (self.samples_played as u64 * 10_000 / 441) as u32;
                self.start_time = self.clock.now_micros().wrapping_sub(behind);
                return;
            }

            if self.state != PlayerState::Playing {
                return;
            }
        }
    }

    /// Run the interpreter until it produces a wait, loops, or finishes.
    /// Returns `false` when the stream's input starved.
    fn process_commands(&mut self, sink: &mut dyn ChipSink) -> bool {
        self.wait_samples = 0;

        let Some(stream) = self.stream.as_mut() else {
            self.state = PlayerState::Finished;
            return true;
        };

        loop {
            match stream.process_one(sink) {
                Step::Wait(n) if n > 0 => {
                    self.wait_samples = n;
                    return true;
                }
                Step::Wait(_) | Step::Continue => continue,
                Step::NeedData => return false,
                Step::End => {
                    if self.looping && stream.has_loop() && stream.seek_to_loop() {
                        log::debug!("looping at sample {}", self.current_sample);
                        self.current_sample = 0;
                        continue;
                    }
                    // Full reset clears any hanging notes.
                    sink.reset();
                    self.state = PlayerState::Finished;
                    log::debug!("playback finished");
                    return true;
                }
            }
        }
    }
}
