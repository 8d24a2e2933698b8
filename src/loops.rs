//! Loop bound tracking for static unrolling.
//!
//! While a frame's blocks are walked, a `Loop` context follows the innermost
//! loop: the block comments open and close it, the induction phi (a merge of
//! an integer constant with a ±1 self-update) moves it to `Enter`, and the
//! comparison against a constant classifies the bound.  A `Static` bound lets
//! the `If` on the loop condition be unrolled instead of synthesised as a
//! MiGo conditional; every other shape falls through to the generic
//! if-synthesis.

use crate::ssa::{BinOpKind, ConstValue, FuncData, InstrKind, SsaProgram, ValueId, ValueKind};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoopBound {
    Unknown,
    Static,
    Dynamic,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoopState {
    NonLoop,
    Enter,
    Exit,
}

/// The innermost loop context of a block walk.
#[derive(Clone, Debug)]
pub struct Loop {
    pub state: LoopState,
    pub bound: LoopBound,
    /// Block index of the loop header this context was opened for.
    pub header: Option<usize>,
    /// The induction phi value.
    pub ind_var: Option<ValueId>,
    /// The comparison result driving the loop `If`.
    pub cond_var: Option<ValueId>,
    pub start: i64,
    pub end: i64,
    pub index: i64,
    pub step: i64,
}

impl Default for Loop {
    fn default() -> Loop {
        Loop {
            state: LoopState::NonLoop,
            bound: LoopBound::Unknown,
            header: None,
            ind_var: None,
            cond_var: None,
            start: 0,
            end: 0,
            index: 0,
            step: 0,
        }
    }
}

impl Loop {
    /// A fresh context for the loop headed by `header`.
    pub fn at_header(header: usize) -> Loop {
        Loop { header: Some(header), ..Loop::default() }
    }

    /// Records the induction phi; the loop is now being entered.
    pub fn set_init(&mut self, phi: ValueId, start: i64, step: i64) {
        self.state = LoopState::Enter;
        self.ind_var = Some(phi);
        self.start = start;
        self.index = start;
        self.step = step;
    }

    /// Records the loop condition value and the (inclusive) end bound.
    pub fn set_cond(&mut self, cond: ValueId, end: i64) {
        self.cond_var = Some(cond);
        self.end = end;
    }

    /// Whether another iteration remains.
    pub fn has_next(&self) -> bool {
        if self.step >= 0 {
            self.index <= self.end
        } else {
            self.index >= self.end
        }
    }

    /// Advances the iteration index; called when the induction phi is
    /// re-evaluated on re-entry.
    pub fn next(&mut self) {
        self.index += self.step;
    }
}

impl fmt::Display for Loop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "loop[{:?}/{:?} {}..{} i={}]",
            self.state, self.bound, self.start, self.end, self.index
        )
    }
}

fn const_int(prog: &SsaProgram, v: ValueId) -> Option<i64> {
    match &prog.value(v).kind {
        ValueKind::Const(ConstValue::Int(i)) => Some(*i),
        _ => None,
    }
}

/// Looks for the ±1 self-update pattern: `edge` must be the result of
/// `phi ± 1`.  Returns the step on a match.
fn self_update_step(func: &FuncData, phi: ValueId, edge: ValueId, prog: &SsaProgram) -> Option<i64> {
    for blk in &func.blocks {
        for instr in &blk.instrs {
            if let InstrKind::BinOp { result, op, x, y } = &instr.kind {
                if *result != edge || *x != phi {
                    continue;
                }
                if const_int(prog, *y) != Some(1) {
                    continue;
                }
                return match op {
                    BinOpKind::Add => Some(1),
                    BinOpKind::Sub => Some(-1),
                    _ => None,
                };
            }
        }
    }
    None
}

/// Recognises an induction phi: one predecessor is an integer constant (the
/// start value), another is a ±1 self-update.  Returns `(start, step)`.
pub fn detect_induction(
    prog: &SsaProgram,
    func: &FuncData,
    phi: ValueId,
    edges: &[ValueId],
) -> Option<(i64, i64)> {
    let start = edges.iter().find_map(|&e| const_int(prog, e))?;
    let step = edges.iter().find_map(|&e| self_update_step(func, phi, e, prog))?;
    Some((start, step))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_bound() {
        let mut l = Loop::at_header(1);
        l.set_init(ValueId(0), 0, 1);
        l.set_cond(ValueId(1), 2);
        assert_eq!(l.state, LoopState::Enter);
        assert!(l.has_next());
        l.next();
        l.next();
        assert!(l.has_next()); // index == end is still an iteration
        l.next();
        assert!(!l.has_next());
    }

    #[test]
    fn descending_bound() {
        let mut l = Loop::at_header(1);
        l.set_init(ValueId(0), 3, -1);
        l.set_cond(ValueId(1), 1);
        assert!(l.has_next());
        l.next();
        l.next();
        assert!(l.has_next());
        l.next();
        assert!(!l.has_next());
    }
}
