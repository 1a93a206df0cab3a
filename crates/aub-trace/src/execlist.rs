//! Reassembles execlist submissions from the register writes that carry them.
//!
//! Pre-gen11 hardware takes a submission as four consecutive writes to the submit port, the
//! last two holding the descriptor's high and low dwords. Gen11+ stages the descriptor in the
//! submission queue registers and commits it with a write to the control register.

use crate::format::{Engine, ExeclistSubmit};

#[derive(Debug, Clone, Copy, Default)]
struct EngineState {
    elsp: [u32; 4],
    index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExeclistTracker {
    engines: [EngineState; 3],
}

impl ExeclistTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one register write. Returns a submission when the write completes one.
    pub fn register_write(&mut self, offset: u32, value: u32) -> Option<ExeclistSubmit> {
        for engine in Engine::ALL {
            let state = &mut self.engines[engine.index()];

            if offset == engine.execlist_submit_port() {
                state.elsp[state.index] = value;
                state.index += 1;
                if state.index < 4 {
                    return None;
                }
                state.index = 0;
                let context_descriptor =
                    ((state.elsp[2] as u64) << 32) | state.elsp[3] as u64;
                return Some(ExeclistSubmit {
                    engine,
                    context_descriptor,
                });
            }

            let sq = engine.execlist_sq_contents();
            if offset == sq {
                state.elsp[0] = value;
                return None;
            }
            if offset == sq + 4 {
                state.elsp[1] = value;
                return None;
            }

            if offset == engine.execlist_control() {
                state.index = 0;
                let context_descriptor =
                    ((state.elsp[1] as u64) << 32) | state.elsp[0] as u64;
                return Some(ExeclistSubmit {
                    engine,
                    context_descriptor,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_port_needs_four_writes() {
        let mut tracker = ExeclistTracker::new();
        let port = Engine::Render.execlist_submit_port();

        assert_eq!(tracker.register_write(port, 0), None);
        assert_eq!(tracker.register_write(port, 0), None);
        assert_eq!(tracker.register_write(port, 0xa000_0000), None);
        assert_eq!(
            tracker.register_write(port, 0x0000_1339),
            Some(ExeclistSubmit {
                engine: Engine::Render,
                context_descriptor: 0xa000_0000_0000_1339,
            })
        );

        // The counter wrapped: a fifth write starts a new group.
        assert_eq!(tracker.register_write(port, 1), None);
    }

    #[test]
    fn submission_queue_commits_on_control() {
        let mut tracker = ExeclistTracker::new();
        let engine = Engine::Copy;
        let sq = engine.execlist_sq_contents();

        assert_eq!(tracker.register_write(sq, 0x0000_3339), None);
        assert_eq!(tracker.register_write(sq + 4, 0x4000_0000), None);
        assert_eq!(
            tracker.register_write(engine.execlist_control(), 1),
            Some(ExeclistSubmit {
                engine,
                context_descriptor: 0x4000_0000_0000_3339,
            })
        );
    }

    #[test]
    fn engines_accumulate_independently() {
        let mut tracker = ExeclistTracker::new();
        let render = Engine::Render.execlist_submit_port();
        let video = Engine::Video.execlist_submit_port();

        tracker.register_write(render, 0);
        tracker.register_write(video, 0);
        tracker.register_write(render, 0);
        tracker.register_write(video, 0);
        tracker.register_write(render, 0x2000_0000);
        tracker.register_write(video, 0x6000_0000);
        let video_submit = tracker.register_write(video, 0x5339);
        let render_submit = tracker.register_write(render, 0x4339);

        assert_eq!(
            video_submit.map(|s| (s.engine, s.context_descriptor)),
            Some((Engine::Video, 0x6000_0000_0000_5339))
        );
        assert_eq!(
            render_submit.map(|s| (s.engine, s.context_descriptor)),
            Some((Engine::Render, 0x2000_0000_0000_4339))
        );
    }

    #[test]
    fn unrelated_registers_are_ignored() {
        let mut tracker = ExeclistTracker::new();
        assert_eq!(tracker.register_write(0x2234, 0xffff_ffff), None);
        assert_eq!(tracker.register_write(Engine::Render.gfx_mode(), 0x8000_8000), None);
    }
}
