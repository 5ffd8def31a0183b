//! Lights command building and pacing
//!
//! A panel's lights are updated with up to three wire commands:
//!
//! - `4`: the 3x3 inner grid of all nine panels (firmware 4 and up)
//! - `2`: the top two rows of the 4x4 grid of all nine panels
//! - `3`: the bottom two rows of the 4x4 grid
//!
//! The panels don't update until a whole frame has been received, so the
//! commands of one frame must never interleave with another's. Firmware
//! before version 4 processes host commands as soon as they arrive, so the
//! `3` command has to be delayed to give the master time to flush the `2`
//! command to the panels; if it isn't, the master blocks on its TX queue
//! instead of processing HID input, which hurts input timing. Firmware 4
//! holds host commands until the panel data is flushed, so all three
//! commands can be queued at once and the master paces itself.
//!
//! Frames are capped at 30 per second. Submissions that arrive faster
//! overwrite the queued frame in place rather than growing the queue, so an
//! in-progress frame always finishes and the newest submission is what goes
//! on the wire next.

use std::time::{Duration, Instant};

use crate::types::PANEL_COUNT;

/// Bytes per pad of a legacy 4x4-only submission (9 panels, 16 LEDs, RGB).
pub(crate) const PAD_LIGHT_BYTES_4X4: usize = PANEL_COUNT * 16 * 3;

/// Bytes per pad of a current submission (9 panels, 25 LEDs, RGB).
pub(crate) const PAD_LIGHT_BYTES_25: usize = PANEL_COUNT * 25 * 3;

/// Delay between the `2` and `3` commands on firmware below 4 (60 Hz).
const INTERLACE_DELAY: Duration = Duration::from_micros(16_667);

/// Minimum spacing between frames (30 Hz cap).
const MIN_FRAME_INTERVAL: Duration = Duration::from_micros(33_333);

/// Apply color scaling. Values over about 170 don't make the LEDs any
/// brighter, so this gives better contrast and draws less power.
fn scale_light(color: u8) -> u8 {
    (color as f32 * (2.0 / 3.0)).round() as u8
}

/// Split one pad's light data into the three wire commands, scaled and
/// newline terminated, as `['4', '2', '3']` command payloads.
///
/// `data` is `PAD_LIGHT_BYTES_4X4` or `PAD_LIGHT_BYTES_25` bytes; the legacy
/// size is zero padded up to the 25-light size first. All three commands are
/// always built; the caller drops the `4` command for pads that don't
/// support it.
pub(crate) fn build_pad_commands(data: &[u8]) -> [Vec<u8>; 3] {
    debug_assert!(data.len() == PAD_LIGHT_BYTES_4X4 || data.len() == PAD_LIGHT_BYTES_25);

    let mut padded;
    let data = if data.len() < PAD_LIGHT_BYTES_25 {
        padded = data.to_vec();
        padded.resize(PAD_LIGHT_BYTES_25, 0);
        &padded[..]
    } else {
        data
    };

    let mut command4 = vec![b'4'];
    let mut command2 = vec![b'2'];
    let mut command3 = vec![b'3'];

    let mut next = 0;
    for _panel in 0..PANEL_COUNT {
        // The 4x4 grid: rows 0-1 go to the '2' command, rows 2-3 to '3'.
        for byte in 0..4 * 4 * 3 {
            let color = scale_light(data[next]);
            next += 1;
            if byte < 4 * 2 * 3 {
                command2.push(color);
            } else {
                command3.push(color);
            }
        }

        // The 3x3 inner grid goes to the '4' command.
        for _byte in 0..3 * 3 * 3 {
            command4.push(scale_light(data[next]));
            next += 1;
        }
    }

    command4.push(b'\n');
    command2.push(b'\n');
    command3.push(b'\n');

    [command4, command2, command3]
}

/// One scheduled wire command, carrying the payload for each pad. An empty
/// payload means nothing is sent to that pad.
pub(crate) struct PendingLightsCommand {
    pub send_at: Instant,
    pub pad_commands: [Vec<u8>; 2],
}

/// The pacing queue. Holds at most one frame (three entries) beyond
/// whatever tail of the previous frame is still unsent.
#[derive(Default)]
pub(crate) struct LightsScheduler {
    pending: Vec<PendingLightsCommand>,
    /// Earliest time the next frame may start, enforcing the 30 Hz cap.
    delay_until: Option<Instant>,
    /// Commands handed to a device queue whose completion hasn't come back
    /// yet. No further entries are released while this is nonzero.
    commands_in_progress: usize,
}

impl LightsScheduler {
    /// Make sure three trailing entries exist for a new frame, creating
    /// them with fire times for the given pacing mode. If three or more
    /// entries are already queued, updates are arriving faster than they
    /// can be sent; the existing entries are reused (and their payloads
    /// overwritten in place) instead of growing the queue.
    pub fn queue_frame(&mut self, now: Instant, immediate: bool) {
        if self.pending.len() >= 3 {
            return;
        }

        let start_at = match self.delay_until {
            Some(at) if at > now => at,
            _ => now,
        };

        let mut times = [now, now, now];
        if !immediate {
            // The '4' entry stays at `now`; it carries no payload on this
            // firmware so its time is never waited on.
            times[1] = start_at;
            times[2] = start_at + INTERLACE_DELAY;
        }

        self.delay_until = Some(start_at + MIN_FRAME_INTERVAL);

        for send_at in times {
            self.pending.push(PendingLightsCommand {
                send_at,
                pad_commands: [Vec::new(), Vec::new()],
            });
        }
    }

    /// Store one pad's commands into the three trailing entries, replacing
    /// whatever was there. `commands` is `['4', '2', '3']` order; pass an
    /// empty `4` payload for pads that don't support it.
    pub fn set_pad_commands(&mut self, pad: usize, commands: [Vec<u8>; 3]) {
        let len = self.pending.len();
        debug_assert!(len >= 3);
        for (slot, command) in self.pending[len - 3..].iter_mut().zip(commands) {
            slot.pad_commands[pad] = command;
        }
    }

    /// Pop the next entry if its time has come. The caller checks
    /// `commands_in_progress` before releasing a batch.
    pub fn pop_due(&mut self, now: Instant) -> Option<PendingLightsCommand> {
        if self.pending.first()?.send_at > now {
            return None;
        }
        Some(self.pending.remove(0))
    }

    /// When the next queued entry wants to fire, for sleep computation.
    pub fn next_send_time(&self) -> Option<Instant> {
        self.pending.first().map(|cmd| cmd.send_at)
    }

    pub fn queued_len(&self) -> usize {
        self.pending.len()
    }

    pub fn commands_in_progress(&self) -> usize {
        self.commands_in_progress
    }

    /// Record that an entry's pad command was handed to a device queue.
    pub fn note_command_sent(&mut self) {
        self.commands_in_progress += 1;
    }

    /// A previously released command completed (or its device closed).
    pub fn command_finished(&mut self) {
        self.commands_in_progress = self.commands_in_progress.saturating_sub(1);
    }

    /// Drop everything scheduled. Used when re-enabling auto-lights so a
    /// queued command can't immediately re-disable them, and when
    /// provisioning serials.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
