//! C4: stack/FPI depth tracker (§4.4).
//!
//! Grounded on `bitcode.rs::RecordIter`'s internal `Ops::{Abbrev, Full}`
//! state machine: a small mutable counter (`state: usize`) threaded through
//! every decode call there. Here the counters are the running stack depth
//! and the open-FPI-region stack, threaded through every encode call.

/// One still-open FPI region: the byte offset of the `fpush` opcode and the
/// stack depth at the moment it was opened (§3 "FPI region (derived)").
#[derive(Debug, Clone, Copy)]
struct FpiOpen {
    fpush_off: u32,
    fp_delta: i32,
}

/// A finished FPI region, ready to be copied into a function's FPI table.
#[derive(Debug, Clone, Copy)]
pub struct ClosedFpi {
    pub fpush_off: u32,
    pub fpi_end_off: u32,
    pub fp_delta: i32,
}

#[derive(Debug, Clone, Default)]
pub struct DepthTracker {
    current: i64,
    max: i64,
    fpi_stack: Vec<FpiOpen>,
    max_fpi_depth: usize,
}

impl DepthTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> i64 {
        self.current
    }

    #[must_use]
    pub fn max(&self) -> i64 {
        self.max
    }

    #[must_use]
    pub fn fpi_depth(&self) -> usize {
        self.fpi_stack.len()
    }

    #[must_use]
    pub fn max_fpi_depth(&self) -> usize {
        self.max_fpi_depth
    }

    /// Apply an opcode's declared `(pop, push)` effect. Returns `false` on
    /// underflow (Invariant 4: depth must stay non-negative) and leaves the
    /// counters unchanged.
    #[must_use]
    pub fn apply(&mut self, pop: u16, push: u16) -> bool {
        if self.current < i64::from(pop) {
            return false;
        }
        self.current = self.current - i64::from(pop) + i64::from(push);
        if self.current > self.max {
            self.max = self.current;
        }
        true
    }

    /// Force the depth to a known value, used when entering a block whose
    /// expected depth was computed independently (§4.3 back-patching
    /// protocol, step 2).
    pub fn set_current(&mut self, value: i64) {
        self.current = value;
        if value > self.max {
            self.max = value;
        }
    }

    /// `fpush` post-effect: open a new FPI region at the current depth.
    pub fn open_fpi(&mut self, fpush_off: u32) {
        self.fpi_stack.push(FpiOpen {
            fpush_off,
            fp_delta: self.current as i32,
        });
        if self.fpi_stack.len() > self.max_fpi_depth {
            self.max_fpi_depth = self.fpi_stack.len();
        }
    }

    /// `fcall` post-effect, and the block-entry region-closing step: pop
    /// the most recently opened FPI region and stamp its end offset. `None`
    /// if no region is open — callers trust the IR invariant (§3 Invariant
    /// 3) rather than re-validating it (§1 Non-goals: no IR validation).
    pub fn close_top_fpi(&mut self, end_offset: u32) -> Option<ClosedFpi> {
        self.fpi_stack.pop().map(|open| ClosedFpi {
            fpush_off: open.fpush_off,
            fpi_end_off: end_offset,
            fp_delta: open.fp_delta,
        })
    }

    /// Terminal-opcode post-effect: reset depth to 0 for the unreachable
    /// code that may follow until the next jump target.
    pub fn reset_terminal(&mut self) {
        self.current = 0;
    }

    /// §4.4 peak-cell computation, finalized by the unit driver.
    #[must_use]
    pub fn max_stack_cells(
        &self,
        num_locals: u32,
        num_iters: u32,
        num_iter_cells: u32,
        cls_ref_cells: u32,
        num_act_rec_cells: u32,
    ) -> u32 {
        self.max as u32
            + num_locals
            + num_iters * num_iter_cells
            + cls_ref_cells
            + (self.max_fpi_depth as u32) * num_act_rec_cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underflow_is_rejected_without_mutating_state() {
        let mut d = DepthTracker::new();
        assert!(!d.apply(1, 0));
        assert_eq!(d.current(), 0);
    }

    #[test]
    fn fpi_regions_nest_and_close_in_lifo_order() {
        let mut d = DepthTracker::new();
        d.open_fpi(10);
        d.open_fpi(20);
        assert_eq!(d.fpi_depth(), 2);
        assert_eq!(d.max_fpi_depth(), 2);
        let inner = d.close_top_fpi(30).unwrap();
        assert_eq!(inner.fpush_off, 20);
        let outer = d.close_top_fpi(40).unwrap();
        assert_eq!(outer.fpush_off, 10);
        assert_eq!(d.fpi_depth(), 0);
    }

    #[test]
    fn terminal_reset_does_not_lower_the_recorded_peak() {
        let mut d = DepthTracker::new();
        d.apply(0, 3);
        assert_eq!(d.max(), 3);
        d.reset_terminal();
        assert_eq!(d.current(), 0);
        assert_eq!(d.max(), 3);
    }
}
