//! Per-activation frames and the shared analysis environment.
//!
//! A [`Frame`] holds everything local to one activation of a function under
//! analysis: value bindings, frame-scoped aggregate shape handles, tuple and
//! select bookkeeping, deferred calls, return values, the per-block visit
//! counters and the MiGo function currently receiving statements.  Frames for
//! spawned goroutines are queued on the [`Env`] and drained after the main
//! flow finishes.
//!
//! The [`Env`] is the single shared state of an analysis: the MiGo program,
//! the instance store, heap-scoped shape handles, globals, closure captures,
//! external value types and the goroutine queue.  Analysis is strictly
//! sequential, so no synchronisation is involved.

use crate::migo::{MigoId, Program, SelectCases};
use crate::ssa::{CallCommon, FuncId, SelectState, SsaProgram, TypeId, ValueId, ValueKind};
use crate::store::{ElemsId, FieldsId, InstanceId, MapId, Store};
use fnv::FnvHashMap;
use std::collections::VecDeque;
use tinyvec::TinyVec;

/// Lazily filled tuple slots of a multi-valued instance.
pub type TupleSlots = TinyVec<[Option<InstanceId>; 4]>;

/// Makes a tuple with `n` empty slots.
pub fn empty_tuple(n: usize) -> TupleSlots {
    let mut t = TupleSlots::default();
    t.resize(n, None);
    t
}

/// The concurrent participant a frame belongs to.
#[derive(Clone, Debug)]
pub struct Goroutine {
    pub role: String,
}

/// A select statement under reconstruction: the skeleton has been emitted,
/// the branch bodies are still being discovered.
#[derive(Clone, Debug)]
pub struct SelectInFlight {
    pub states: Vec<SelectState>,
    pub blocking: bool,
    /// Shared handle into the emitted select statement's case lists.
    pub cases: SelectCases,
    /// The value extracted at tuple slot 0 (the chosen-branch index).
    pub index_value: Option<ValueId>,
}

/// A comma-ok producer whose ok-extract has not been consumed yet.
#[derive(Clone, Debug, Default)]
pub struct CommaOk {
    pub ok_cond: Option<InstanceId>,
}

/// Analysis state of one function activation.
#[derive(Debug)]
pub struct Frame {
    pub func: FuncId,
    pub locals: FnvHashMap<ValueId, InstanceId>,
    /// Frame-scoped array/slice tables for stack-allocated aggregates.
    pub arrays: FnvHashMap<InstanceId, ElemsId>,
    pub structs: FnvHashMap<InstanceId, FieldsId>,
    pub maps: FnvHashMap<InstanceId, MapId>,
    pub tuples: FnvHashMap<InstanceId, TupleSlots>,
    pub selects: FnvHashMap<InstanceId, SelectInFlight>,
    pub commaok: FnvHashMap<InstanceId, CommaOk>,
    /// Phi candidate lists: result value to its predecessor values.
    pub phis: FnvHashMap<ValueId, Vec<ValueId>>,
    pub defers: Vec<CallCommon>,
    pub retvals: Vec<InstanceId>,
    /// Per-block visit counter; bounds the depth-first walk.
    pub visited: FnvHashMap<usize, u32>,
    /// The activation chain including this frame's function, innermost last.
    pub call_stack: Vec<FuncId>,
    pub goroutine: Goroutine,
    /// The MiGo function statements are currently appended to.
    pub migo: MigoId,
    /// Channel instance to the value it is known by in this frame (creation
    /// register, parameter or capture); used to name channel statements.
    pub chan_names: FnvHashMap<InstanceId, ValueId>,
    serial: u32,
}

impl Frame {
    pub fn new(func: FuncId, migo: MigoId, role: &str) -> Frame {
        Frame {
            func,
            locals: FnvHashMap::default(),
            arrays: FnvHashMap::default(),
            structs: FnvHashMap::default(),
            maps: FnvHashMap::default(),
            tuples: FnvHashMap::default(),
            selects: FnvHashMap::default(),
            commaok: FnvHashMap::default(),
            phis: FnvHashMap::default(),
            defers: Vec::new(),
            retvals: Vec::new(),
            visited: FnvHashMap::default(),
            call_stack: vec![func],
            goroutine: Goroutine { role: role.to_owned() },
            migo,
            chan_names: FnvHashMap::default(),
            serial: 0,
        }
    }

    /// A callee frame sharing the caller's goroutine.
    pub fn child(&self, func: FuncId, migo: MigoId) -> Frame {
        let mut f = Frame::new(func, migo, &self.goroutine.role);
        f.call_stack = self.call_stack.clone();
        f.call_stack.push(func);
        f
    }

    /// A frame for a spawned goroutine with its own role.
    pub fn spawned(&self, func: FuncId, migo: MigoId, role: &str) -> Frame {
        let mut f = self.child(func, migo);
        f.goroutine = Goroutine { role: role.to_owned() };
        f
    }

    /// Next per-function instance serial number.
    pub fn next_serial(&mut self) -> u32 {
        let n = self.serial;
        self.serial += 1;
        n
    }

    /// Resolves a value to its instance: locals first, then globals, then a
    /// lazily boxed constant, then the phi candidates (first predecessor with
    /// a bound instance wins).
    pub fn resolve(&mut self, v: ValueId, prog: &SsaProgram, env: &mut Env) -> Option<InstanceId> {
        if let Some(&inst) = self.locals.get(&v) {
            return Some(inst);
        }
        match &prog.value(v).kind {
            ValueKind::Global => {
                return env.globals.get(&v).copied();
            }
            ValueKind::Const(_) => {
                let inst = env.store.fresh_const(v);
                self.locals.insert(v, inst);
                return Some(inst);
            }
            _ => {}
        }
        if let Some(edges) = self.phis.get(&v) {
            for e in edges {
                if let Some(&inst) = self.locals.get(e) {
                    return Some(inst);
                }
            }
        }
        None
    }

    /// Whether visiting this frame's function would re-enter a call cycle
    /// already on the stack.  Immediate self-calls are recursive; longer
    /// cycles are recursive once the tail of the stack repeats the preceding
    /// activations exactly.
    pub fn is_recursive(&self) -> bool {
        let stack = &self.call_stack;
        let k = stack.len() - 1;
        if k == 0 {
            return false;
        }
        let callee = stack[k];
        if stack[k - 1] == callee {
            return true;
        }
        let mut trace = Vec::new();
        let mut found = None;
        for i in (0..k).rev() {
            trace.push(stack[i]);
            if stack[i] == callee {
                found = Some(i);
                break;
            }
        }
        let i = match found {
            Some(i) => i,
            None => return false,
        };
        for (j, &fnid) in trace.iter().enumerate() {
            match i.checked_sub(j + 1) {
                Some(idx) if stack[idx] == fnid => {}
                _ => return false,
            }
        }
        true
    }

    /// Logs the activation chain for recursion diagnostics.
    pub fn log_call_stack(&self, prog: &SsaProgram) {
        for f in self.call_stack.iter().rev() {
            log::info!("called by: {}()", prog.func(*f).name);
        }
    }
}

/// Shared state of one analysis run.
#[derive(Debug, Default)]
pub struct Env {
    pub migo: Program,
    pub store: Store,
    pub globals: FnvHashMap<ValueId, InstanceId>,
    /// Heap-scoped aggregate shape handles.
    pub arrays: FnvHashMap<InstanceId, ElemsId>,
    pub structs: FnvHashMap<InstanceId, FieldsId>,
    /// Values returned from body-less functions, keyed to their result types.
    pub extern_vals: FnvHashMap<ValueId, Vec<TypeId>>,
    /// Closure instance to its captured instances.
    pub closures: FnvHashMap<InstanceId, Vec<InstanceId>>,
    /// Closure instance to the function it closes over.
    pub closure_fn: FnvHashMap<InstanceId, FuncId>,
    /// Deferred goroutine frames, drained after the main flow.
    pub go_queue: VecDeque<Frame>,
    role_serial: u32,
}

impl Env {
    pub fn new() -> Env {
        Env::default()
    }

    /// A unique role name for a spawn of `callee`.
    pub fn next_role(&mut self, callee: &str) -> String {
        let n = self.role_serial;
        self.role_serial += 1;
        format!("{}_{}", callee, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::FuncId;

    fn frame_with_stack(stack: &[u32]) -> Frame {
        let mut f = Frame::new(FuncId(stack[stack.len() - 1]), MigoId(0), "main");
        f.call_stack = stack.iter().map(|&i| FuncId(i)).collect();
        f
    }

    #[test]
    fn direct_recursion() {
        assert!(frame_with_stack(&[0, 1, 1]).is_recursive());
        assert!(!frame_with_stack(&[0, 1]).is_recursive());
    }

    #[test]
    fn mutual_recursion_detected_after_full_cycle() {
        // main -> f -> g -> f: one cycle, not yet a repeated tail
        assert!(!frame_with_stack(&[0, 1, 2, 1]).is_recursive());
        // main -> f -> g -> f -> g -> f: tail repeats the preceding cycle
        assert!(frame_with_stack(&[0, 1, 2, 1, 2, 1]).is_recursive());
    }

    #[test]
    fn unrelated_calls_are_not_recursive() {
        assert!(!frame_with_stack(&[0, 1, 2, 3]).is_recursive());
    }

    #[test]
    fn role_names_are_unique() {
        let mut env = Env::new();
        assert_eq!(env.next_role("main.work"), "main.work_0");
        assert_eq!(env.next_role("main.work"), "main.work_1");
    }
}
