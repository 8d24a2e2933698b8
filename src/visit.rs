//! The symbolic SSA interpreter.
//!
//! One dispatch over the instruction variants of the provider, updating the
//! instance store and appending MiGo statements whenever an instruction has
//! observable communication effect.  Control flow is re-synthesised here as
//! well: blocks are walked depth-first with per-frame visit counters, a jump
//! into a join point splits the current MiGo function into a block-function,
//! statically bounded loops are unrolled, and `If` instructions are rebuilt
//! into MiGo conditionals or spliced into pending select cases.
//!
//! The walk is strictly sequential; spawned goroutine frames are queued on
//! the environment and drained by the driver after the main flow returns.

use crate::errors::AnalysisError;
use crate::frame::{empty_tuple, CommaOk, Env, Frame, SelectInFlight};
use crate::loops::{self, Loop, LoopBound, LoopState};
use crate::migo::{ChanVar, MigoId, Parameter, Statement};
use crate::ssa::{
    BinOpKind, ChanDir, ConstValue, Instr, InstrKind, Pos, SelectState, SsaProgram, TypeData,
    UnOpKind, ValueId, ValueKind,
};
use crate::store::{Instance, InstanceId};
use log::{debug, warn};
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) type Result<T> = std::result::Result<T, AnalysisError>;

/// Context of one basic-block visit: the block index and the candidate MiGo
/// function the block would own if it becomes a join split.
pub(crate) struct BlockCtx {
    pub block: usize,
    pub migo_def: MigoId,
}

/// The interpreter: a view of the program plus the shared environment.
pub(crate) struct Interp<'a> {
    pub prog: &'a SsaProgram,
    pub env: &'a mut Env,
}

fn const_int(prog: &SsaProgram, v: ValueId) -> Option<i64> {
    match &prog.value(v).kind {
        ValueKind::Const(ConstValue::Int(i)) => Some(*i),
        _ => None,
    }
}

fn is_nil_const(prog: &SsaProgram, v: ValueId) -> bool {
    matches!(&prog.value(v).kind, ValueKind::Const(ConstValue::Nil))
}

impl<'a> Interp<'a> {
    pub fn new(prog: &'a SsaProgram, env: &'a mut Env) -> Interp<'a> {
        Interp { prog, env }
    }

    /// Analyses a function body; returns whether a body was available.
    pub fn visit_func(&mut self, f: &mut Frame) -> Result<bool> {
        let prog = self.prog;
        self.env.migo.add_function(f.migo);
        let func = prog.func(f.func);
        debug!("───── func {} ─────", func.name);
        if func.short_name() == "init" {
            // Package initialisers carry no communication of their own.
            return Ok(true);
        }
        for (val, inst) in &f.locals {
            debug!("  param {} = {}", prog.value_name(*val), self.label(*inst));
        }
        if !func.has_body() {
            debug!("  « no function body »");
            return Ok(false);
        }
        let ctx = self.new_block(f, 0);
        self.visit_block(f, ctx, &mut Loop::default())?;
        Ok(true)
    }

    pub(crate) fn new_block(&mut self, f: &Frame, block: usize) -> BlockCtx {
        let name = format!("{}#{}", self.prog.func(f.func).name, block);
        BlockCtx { block, migo_def: self.env.migo.create_function(&name) }
    }

    fn visit_block(&mut self, f: &mut Frame, ctx: BlockCtx, l: &mut Loop) -> Result<()> {
        let prog = self.prog;
        let comment = prog.func(f.func).blocks[ctx.block].comment.clone();
        if comment == "for.loop" && l.header != Some(ctx.block) {
            // A loop header not tracked yet opens a nested loop context.
            let mut inner = Loop::at_header(ctx.block);
            return self.visit_block_body(f, ctx, &mut inner);
        }
        if comment == "for.done" {
            l.state = LoopState::Exit;
        }
        self.visit_block_body(f, ctx, l)
    }

    fn visit_block_body(&mut self, f: &mut Frame, ctx: BlockCtx, l: &mut Loop) -> Result<()> {
        let prog = self.prog;
        if l.bound == LoopBound::Static && l.has_next() {
            debug!("block {} (loop i={})", ctx.block, l.index);
            // Unrolling may re-enter, so the block is not marked visited.
        } else {
            if let Some(n) = f.visited.get_mut(&ctx.block) {
                *n += 1;
                debug!("block {} (visited)", ctx.block);
                return Ok(());
            }
            f.visited.insert(ctx.block, 0);
        }
        let blk = &prog.func(f.func).blocks[ctx.block];
        debug!("block {}; {}", ctx.block, blk.comment);
        for instr in &blk.instrs {
            self.visit_instr(f, &ctx, instr, l)?;
        }
        Ok(())
    }

    fn visit_instr(&mut self, f: &mut Frame, b: &BlockCtx, instr: &Instr, l: &mut Loop) -> Result<()> {
        match &instr.kind {
            InstrKind::Alloc { result, heap } => self.visit_alloc(f, *result, *heap, l),
            InstrKind::BinOp { result, op, x, y } => self.visit_binop(f, *result, *op, *x, *y, l),
            InstrKind::Call { result, call } => self.call(f, l, *result, call),
            InstrKind::ChangeInterface { result, x } => self.visit_alias(f, *result, *x, "changeiface"),
            InstrKind::ChangeType { result, x } => self.visit_alias(f, *result, *x, "changetype"),
            InstrKind::Convert { result, x } => self.visit_convert(f, *result, *x),
            InstrKind::DebugRef { .. } => Ok(()),
            InstrKind::Defer { call } => {
                f.defers.push(call.clone());
                Ok(())
            }
            InstrKind::Extract { result, tuple, index } => {
                self.visit_extract(f, *result, *tuple, *index, l)
            }
            InstrKind::Field { result, x, field } => {
                self.visit_field(f, *result, *x, *field, l, false)
            }
            InstrKind::FieldAddr { result, x, field } => {
                self.visit_field(f, *result, *x, *field, l, true)
            }
            InstrKind::Go { call } => self.go_spawn(f, call),
            InstrKind::If { cond } => self.visit_if(f, b, *cond, l),
            InstrKind::Index { result, x, index } => {
                self.visit_index(f, *result, *x, *index, l, false)
            }
            InstrKind::IndexAddr { result, x, index } => {
                self.visit_index(f, *result, *x, *index, l, true)
            }
            InstrKind::Jump => self.visit_jump(f, b, l),
            InstrKind::Lookup { result, x, index, comma_ok } => {
                self.visit_lookup(f, *result, *x, *index, *comma_ok, l)
            }
            InstrKind::MakeChan { result, size } => self.visit_makechan(f, *result, *size, instr.pos, l),
            InstrKind::MakeClosure { result, func, bindings } => {
                self.visit_makeclosure(f, *result, *func, bindings, l)
            }
            InstrKind::MakeInterface { result, x } => self.visit_makeiface(f, *result, *x),
            InstrKind::MakeMap { result } => {
                let inst = self.bind_fresh(f, *result, l);
                let m = self.env.store.new_map();
                f.maps.insert(inst, m);
                debug!("{} = make-map", self.label(inst));
                Ok(())
            }
            InstrKind::MakeSlice { result } => {
                let inst = self.bind_fresh(f, *result, l);
                let t = self.env.store.new_elems();
                f.arrays.insert(inst, t);
                debug!("{} = make-slice", self.label(inst));
                Ok(())
            }
            InstrKind::MapUpdate { map, key, value } => self.visit_mapupdate(f, *map, *key, *value, l),
            InstrKind::Next { result, .. } => {
                let inst = self.bind_fresh(f, *result, l);
                f.tuples.insert(inst, empty_tuple(3)); // (ok, k, v)
                debug!("{} (ok, k, v) = next", self.label(inst));
                Ok(())
            }
            InstrKind::Phi { result, edges } => self.visit_phi(f, b, *result, edges, l),
            InstrKind::Return { results } => self.visit_return(f, b, results),
            InstrKind::RunDefers => self.run_defers(f),
            InstrKind::Select { result, states, blocking } => {
                self.visit_select(f, *result, states, *blocking, l)
            }
            InstrKind::Send { chan, .. } => self.visit_send(f, *chan),
            InstrKind::Slice { result, x } => self.visit_slice(f, *result, *x, l),
            InstrKind::Store { addr, value } => self.visit_store(f, *addr, *value, l),
            InstrKind::TypeAssert { result, x, asserted, comma_ok } => {
                self.visit_typeassert(f, *result, *x, *asserted, *comma_ok, l)
            }
            InstrKind::UnOp { result, op, x, comma_ok } => match op {
                UnOpKind::Recv => self.visit_recv(f, *result, *x, *comma_ok, l),
                UnOpKind::Deref => self.visit_deref(f, *result, *x, l),
                UnOpKind::Other => {
                    debug!("skip unop {}", self.prog.value_name(*result));
                    Ok(())
                }
            },
        }
    }

    // Small helpers shared by the handlers.

    pub(crate) fn bind_fresh(&mut self, f: &mut Frame, v: ValueId, l: &Loop) -> InstanceId {
        let serial = f.next_serial();
        let inst = self.env.store.fresh(v, serial, l.index);
        f.locals.insert(v, inst);
        inst
    }

    pub(crate) fn label(&self, inst: InstanceId) -> String {
        match self.env.store.instance(inst) {
            Instance::Concrete { value, id, .. } => {
                format!("{}_{}", self.prog.value_name(*value), id)
            }
            Instance::Const { value } => format!("const:{}", self.prog.value_name(*value)),
            Instance::External { value } => format!("ext:{}", self.prog.value_name(*value)),
        }
    }

    pub(crate) fn unknown(&self, instr: &str, v: ValueId) -> AnalysisError {
        AnalysisError::UnknownValue {
            instr: instr.to_owned(),
            value: self.prog.value_name(v).to_owned(),
        }
    }

    /// The value a channel instance is known by in this frame, falling back
    /// to the operand it was reached through.
    pub(crate) fn chan_var(&self, f: &Frame, inst: InstanceId, operand: ValueId) -> ChanVar {
        let v = f.chan_names.get(&inst).copied().unwrap_or(operand);
        ChanVar::new(v, self.prog.value_name(v))
    }

    pub(crate) fn emit(&mut self, f: &Frame, stmt: Statement) {
        self.env.migo.func_mut(f.migo).add_stmts(&[stmt]);
    }

    pub(crate) fn add_chan_param(&mut self, f: &Frame, cv: &ChanVar) {
        let p = Parameter { caller: cv.clone(), callee: cv.clone() };
        self.env.migo.func_mut(f.migo).add_params(&[p]);
    }

    /// Lazily sets up the slot table of an aggregate reached through a
    /// pointer read; `heap` selects the scope.
    pub(crate) fn init_nested(&mut self, f: &mut Frame, inst: InstanceId, heap: bool) {
        let prog = self.prog;
        if !matches!(self.env.store.instance(inst), Instance::Concrete { .. }) {
            return;
        }
        let v = self.env.store.value_of(inst);
        let t = prog.deref(prog.value(v).ty);
        if prog.array_len(t).is_some() || prog.is_slice(t) {
            if !f.arrays.contains_key(&inst) && !self.env.arrays.contains_key(&inst) {
                let table = self.env.store.new_elems();
                if heap {
                    self.env.arrays.insert(inst, table);
                } else {
                    f.arrays.insert(inst, table);
                }
                debug!("{} init nested array/slice", self.label(inst));
            }
        } else if let Some(fields) = prog.struct_fields(t) {
            if !f.structs.contains_key(&inst) && !self.env.structs.contains_key(&inst) {
                let table = self.env.store.new_fields(fields.len());
                if heap {
                    self.env.structs.insert(inst, table);
                } else {
                    f.structs.insert(inst, table);
                }
                debug!("{} init nested struct", self.label(inst));
            }
        }
    }

    // Instruction handlers.

    fn visit_alloc(&mut self, f: &mut Frame, result: ValueId, heap: bool, l: &Loop) -> Result<()> {
        let prog = self.prog;
        let alloc_ty = prog.deref(prog.value(result).ty);
        let under = prog.underlying(alloc_ty);
        let inst = self.bind_fresh(f, result, l);
        match prog.ty(under).clone() {
            TypeData::Array { len, .. } => {
                let table = self.env.store.new_elems();
                if heap {
                    self.env.arrays.insert(inst, table);
                } else {
                    f.arrays.insert(inst, table);
                }
                debug!("{} = alloc (array@{}) {} elems", self.label(inst), scope(heap), len);
            }
            TypeData::Struct { fields } => {
                let table = self.env.store.new_fields(fields.len());
                if heap {
                    self.env.structs.insert(inst, table);
                } else {
                    f.structs.insert(inst, table);
                }
                debug!("{} = alloc (struct@{}) {} fields", self.label(inst), scope(heap), fields.len());
            }
            TypeData::Pointer { elem } => match prog.ty(prog.underlying(elem)).clone() {
                TypeData::Array { len, .. } => {
                    let table = self.env.store.new_elems();
                    if heap {
                        self.env.arrays.insert(inst, table);
                    } else {
                        f.arrays.insert(inst, table);
                    }
                    debug!("{} = alloc/indirect (array@{}) {} elems", self.label(inst), scope(heap), len);
                }
                TypeData::Struct { fields } => {
                    let table = self.env.store.new_fields(fields.len());
                    if heap {
                        self.env.structs.insert(inst, table);
                    } else {
                        f.structs.insert(inst, table);
                    }
                    debug!("{} = alloc/indirect (struct@{})", self.label(inst), scope(heap));
                }
                _ => debug!("{} = alloc/indirect", self.label(inst)),
            },
            _ => debug!("{} = alloc", self.label(inst)),
        }
        Ok(())
    }

    fn visit_binop(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        op: BinOpKind,
        x: ValueId,
        y: ValueId,
        l: &mut Loop,
    ) -> Result<()> {
        if l.state == LoopState::Enter && l.bound == LoopBound::Unknown {
            if let Some(end0) = const_int(self.prog, y) {
                if f.phis.contains_key(&x) {
                    let end = match op {
                        BinOpKind::Lss => Some(end0 - 1),
                        BinOpKind::Leq => Some(end0),
                        BinOpKind::Gtr => Some(end0 + 1),
                        BinOpKind::Geq => Some(end0),
                        _ => None,
                    };
                    if let Some(end) = end {
                        l.set_cond(result, end);
                        let forward = match op {
                            BinOpKind::Lss | BinOpKind::Leq => l.start < l.end,
                            _ => l.start > l.end,
                        };
                        let induction = l.ind_var == Some(x);
                        if induction && forward {
                            l.bound = LoopBound::Static;
                            debug!("loop bound static: i .. {}", l.end);
                        } else {
                            l.bound = LoopBound::Dynamic;
                        }
                        return Ok(());
                    }
                }
            }
        }
        let inst = self.bind_fresh(f, result, l);
        debug!("{} = binop {:?}", self.label(inst), op);
        Ok(())
    }

    fn visit_alias(&mut self, f: &mut Frame, result: ValueId, x: ValueId, tag: &str) -> Result<()> {
        let inst = *f.locals.get(&x).ok_or_else(|| self.unknown(tag, x))?;
        f.locals.insert(result, inst);
        debug!("{} {}= {}", self.prog.value_name(result), tag, self.prog.value_name(x));
        Ok(())
    }

    fn visit_convert(&mut self, f: &mut Frame, result: ValueId, x: ValueId) -> Result<()> {
        let prog = self.prog;
        if !f.locals.contains_key(&x) {
            match &prog.value(x).kind {
                ValueKind::Const(_) => {
                    let inst = self.env.store.fresh_const(x);
                    f.locals.insert(x, inst);
                }
                ValueKind::Global => {
                    let inst = *self
                        .env
                        .globals
                        .get(&x)
                        .ok_or_else(|| self.unknown("convert (global)", x))?;
                    f.locals.insert(x, inst);
                }
                _ => return Err(self.unknown("convert", x)),
            }
        }
        let inst = f.locals[&x];
        f.locals.insert(result, inst);
        debug!("{} convert= {}", prog.value_name(result), prog.value_name(x));
        Ok(())
    }

    fn visit_deref(&mut self, f: &mut Frame, result: ValueId, x: ValueId, l: &Loop) -> Result<()> {
        let prog = self.prog;
        if matches!(prog.value(x).kind, ValueKind::Global) {
            let inst = *self.env.globals.get(&x).ok_or_else(|| self.unknown("deref (global)", x))?;
            f.locals.insert(x, inst);
            f.locals.insert(result, inst);
            debug!("{} deref= {} (global)", self.label(inst), prog.value_name(x));
            self.init_nested(f, inst, true);
            return Ok(());
        }
        if prog.is_byte(prog.deref(prog.value(x).ty)) {
            // Bytes need no explicit allocation.
            self.bind_fresh(f, x, l);
        }
        let inst = *f.locals.get(&x).ok_or_else(|| self.unknown("deref", x))?;
        f.locals.insert(result, inst);
        debug!("{} deref= {}", self.label(inst), prog.value_name(x));
        self.init_nested(f, inst, false);
        Ok(())
    }

    fn visit_extract(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        tuple: ValueId,
        index: usize,
        l: &Loop,
    ) -> Result<()> {
        let tuple_inst = match f.locals.get(&tuple) {
            Some(&i) => i,
            None => {
                if self.env.extern_vals.contains_key(&tuple) {
                    // Multi-return of a body-less callee: slot reads stay
                    // external, nothing synthetic is invented.
                    let inst = self.env.store.fresh_external(result);
                    f.locals.insert(result, inst);
                    debug!("{} = extract external tuple {{{}}}", self.label(inst), index);
                } else {
                    debug!("skip extract of unbound {}", self.prog.value_name(tuple));
                }
                return Ok(());
            }
        };
        if !f.tuples.contains_key(&tuple_inst) {
            if self.env.store.is_external(tuple_inst) {
                let inst = self.env.store.fresh_external(result);
                f.locals.insert(result, inst);
                debug!("{} = extract external {{{}}}", self.label(inst), index);
                return Ok(());
            }
            return Err(AnalysisError::UninitializedTuple {
                instr: "extract".to_owned(),
                value: self.prog.value_name(tuple).to_owned(),
            });
        }
        let size = f.tuples[&tuple_inst].len();
        if index >= size {
            return Err(AnalysisError::UninitializedTuple {
                instr: "extract".to_owned(),
                value: self.prog.value_name(tuple).to_owned(),
            });
        }
        if f.tuples[&tuple_inst][index].is_none() {
            let serial = f.next_serial();
            let fresh = self.env.store.fresh(result, serial, l.index);
            f.tuples.get_mut(&tuple_inst).unwrap()[index] = Some(fresh);
        }
        let inst = f.tuples[&tuple_inst][index].unwrap();
        f.locals.insert(result, inst);
        self.init_nested(f, inst, false);
        if let Some(sel) = f.selects.get_mut(&tuple_inst) {
            if index == 0 {
                sel.index_value = Some(result);
                debug!("{} = extract select{{0}} (select-index)", self.prog.value_name(result));
            } else {
                debug!("{} = extract select{{{}}}", self.prog.value_name(result), index);
            }
            return Ok(());
        }
        if let Some(ok) = f.commaok.get_mut(&tuple_inst) {
            if index == 1 {
                ok.ok_cond = Some(inst);
                debug!("{} = extract commaOk{{1}} (ok-test)", self.prog.value_name(result));
            } else {
                debug!("{} = extract commaOk{{{}}}", self.prog.value_name(result), index);
            }
            return Ok(());
        }
        debug!("{} = tuple {}[{}] of {}", self.label(inst), self.label(tuple_inst), index, size);
        Ok(())
    }

    fn visit_field(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        x: ValueId,
        field: usize,
        l: &Loop,
        addr: bool,
    ) -> Result<()> {
        let prog = self.prog;
        let tag = if addr { "field-addr" } else { "field" };
        let struct_ty = if addr { prog.deref(prog.value(x).ty) } else { prog.value(x).ty };
        if prog.struct_fields(struct_ty).is_none() {
            return Err(AnalysisError::InvalidVarRead {
                instr: tag.to_owned(),
                value: prog.value_name(x).to_owned(),
            });
        }
        let s_inst = match f.locals.get(&x).copied().or_else(|| self.env.globals.get(&x).copied()) {
            Some(i) => i,
            None => return Err(self.unknown(tag, x)),
        };
        match self.env.store.instance(s_inst) {
            Instance::Concrete { .. } => {}
            Instance::External { .. } => {
                debug!("{}: {} is external", tag, self.label(s_inst));
                f.locals.insert(result, s_inst);
                return Ok(());
            }
            Instance::Const { value } => {
                debug!("{}: {} is a constant", tag, self.label(s_inst));
                if is_nil_const(prog, *value) {
                    f.locals.insert(result, s_inst);
                }
                return Ok(());
            }
        }
        let table = match f.structs.get(&s_inst).copied().or_else(|| self.env.structs.get(&s_inst).copied()) {
            Some(t) => t,
            None => return Err(self.unknown(tag, x)),
        };
        debug!("{} = {}.{{{}}}", prog.value_name(result), self.label(s_inst), field);
        if field >= self.env.store.fields(table).len() {
            return Err(AnalysisError::InvalidVarRead {
                instr: tag.to_owned(),
                value: prog.value_name(x).to_owned(),
            });
        }
        if self.env.store.fields(table).get(field).copied().flatten().is_none() {
            let serial = f.next_serial();
            let fresh = self.env.store.fresh(result, serial, l.index);
            self.env.store.fields_mut(table)[field] = Some(fresh);
            debug!("  field uninitialised, set to {}", prog.value_name(result));
        }
        let inst = self.env.store.fields(table)[field].unwrap();
        self.init_nested(f, inst, false);
        f.locals.insert(result, inst);
        Ok(())
    }

    fn visit_index(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        x: ValueId,
        index: ValueId,
        l: &Loop,
        addr: bool,
    ) -> Result<()> {
        let prog = self.prog;
        let tag = if addr { "index-addr" } else { "index" };
        let xt = if addr { prog.deref(prog.value(x).ty) } else { prog.value(x).ty };
        let is_array = prog.array_len(xt).is_some();
        let is_slice = addr && prog.is_slice(xt);
        if !is_array && !is_slice {
            return Err(AnalysisError::InvalidVarRead {
                instr: tag.to_owned(),
                value: prog.value_name(x).to_owned(),
            });
        }
        let a_inst = match f.locals.get(&x).copied().or_else(|| self.env.globals.get(&x).copied()) {
            Some(i) => i,
            None => return Err(self.unknown(tag, x)),
        };
        match self.env.store.instance(a_inst) {
            Instance::Concrete { .. } => {
                if is_slice {
                    if let Some(elem) = prog.slice_elem(xt) {
                        if prog.is_byte(elem) {
                            // Byte-level indexing is not modelled.
                            f.locals.insert(result, a_inst);
                            return Ok(());
                        }
                    }
                }
            }
            Instance::External { .. } => {
                debug!("{}: {} is external", tag, self.label(a_inst));
                f.locals.insert(result, a_inst);
                return Ok(());
            }
            Instance::Const { value } => {
                debug!("{}: {} is a constant", tag, self.label(a_inst));
                if is_nil_const(prog, *value) {
                    f.locals.insert(result, a_inst);
                }
                return Ok(());
            }
        }
        let table = match f.arrays.get(&a_inst).copied().or_else(|| self.env.arrays.get(&a_inst).copied()) {
            Some(t) => t,
            None => return Err(self.unknown(tag, x)),
        };
        debug!("{} = {}[{}]", prog.value_name(result), self.label(a_inst), prog.value_name(index));
        if !self.env.store.elems(table).contains_key(&index) {
            let serial = f.next_serial();
            let fresh = self.env.store.fresh(result, serial, l.index);
            self.env.store.elems_mut(table).insert(index, fresh);
            debug!("  elem uninitialised, set to {}", prog.value_name(result));
        }
        let inst = self.env.store.elems(table)[&index];
        self.init_nested(f, inst, false);
        f.locals.insert(result, inst);
        Ok(())
    }

    fn visit_if(&mut self, f: &mut Frame, b: &BlockCtx, cond: ValueId, l: &mut Loop) -> Result<()> {
        let prog = self.prog;
        let succs = prog.func(f.func).blocks[b.block].succs.clone();
        if succs.len() != 2 {
            return Err(AnalysisError::InvalidIfSucc {
                func: prog.func(f.func).name.clone(),
                block: b.block,
            });
        }
        // Unroll a statically bounded loop at its condition.
        if l.state != LoopState::NonLoop && l.bound == LoopBound::Static && Some(cond) == l.cond_var {
            let target = if l.has_next() {
                debug!("loop continue {}", l);
                succs[0]
            } else {
                debug!("loop exit {}", l);
                succs[1]
            };
            let ctx = self.new_block(f, target);
            return self.visit_block(f, ctx, l);
        }
        // A comparison of a select's chosen-branch index routes the branch
        // into the corresponding case of the select skeleton.
        if let Some((x, case)) = self.defining_eq_const(f, cond) {
            let found = f.selects.iter().find_map(|(_, s)| {
                if s.index_value == Some(x) {
                    Some((s.blocking, s.states.len(), s.cases.clone()))
                } else {
                    None
                }
            });
            if let Some((blocking, nstates, cases)) = found {
                let par = f.migo;
                self.env.migo.func_mut(par).put_away();
                let ctx = self.new_block(f, succs[0]);
                self.visit_block(f, ctx, l)?;
                self.env.migo.func_mut(f.migo).put_away();
                let sel_case = self
                    .env
                    .migo
                    .func_mut(f.migo)
                    .restore()
                    .map_err(|_| AnalysisError::StackMismatch { context: "select-case" })?;
                {
                    let mut cs = cases.borrow_mut();
                    let idx = case as usize;
                    if idx < cs.len() {
                        cs[idx].extend(sel_case);
                    }
                }
                let parent = self
                    .env
                    .migo
                    .func_mut(par)
                    .restore()
                    .map_err(|_| AnalysisError::StackMismatch { context: "select-parent" })?;
                self.env.migo.func_mut(par).add_stmts(&parent);

                if !blocking && case as usize == nstates - 1 {
                    // Non-blocking select: the else side is the default case.
                    debug!("select default");
                    let par = f.migo;
                    self.env.migo.func_mut(par).put_away();
                    let ctx = self.new_block(f, succs[1]);
                    self.visit_block(f, ctx, l)?;
                    self.env.migo.func_mut(f.migo).put_away();
                    let def_case = self
                        .env
                        .migo
                        .func_mut(f.migo)
                        .restore()
                        .map_err(|_| AnalysisError::StackMismatch { context: "select-default" })?;
                    if let Some(last) = cases.borrow_mut().last_mut() {
                        last.extend(def_case);
                    }
                    let parent = self
                        .env
                        .migo
                        .func_mut(par)
                        .restore()
                        .map_err(|_| AnalysisError::StackMismatch { context: "select-parent" })?;
                    self.env.migo.func_mut(par).add_stmts(&parent);
                } else {
                    debug!("select-else → block {}", succs[1]);
                    let ctx = self.new_block(f, succs[1]);
                    self.visit_block(f, ctx, l)?;
                }
                return Ok(());
            }
        }

        let cond_desc = if self.is_comma_ok_cond(f, cond) {
            format!("comma-ok {}", prog.value_name(cond))
        } else {
            prog.value_name(cond).to_owned()
        };

        self.env.migo.func_mut(f.migo).put_away();
        self.env.migo.func_mut(f.migo).add_stmts(&[Statement::Tau]);
        debug!("if {} then → block {}", cond_desc, succs[0]);
        let ctx = self.new_block(f, succs[0]);
        self.visit_block(f, ctx, l)?;
        self.env.migo.func_mut(f.migo).put_away();
        self.env.migo.func_mut(f.migo).add_stmts(&[Statement::Tau]);
        debug!("if {} else → block {}", cond_desc, succs[1]);
        let ctx = self.new_block(f, succs[1]);
        self.visit_block(f, ctx, l)?;
        self.env.migo.func_mut(f.migo).put_away();

        let els = self
            .env
            .migo
            .func_mut(f.migo)
            .restore()
            .map_err(|_| AnalysisError::StackMismatch { context: "restore else" })?;
        let then = self
            .env
            .migo
            .func_mut(f.migo)
            .restore()
            .map_err(|_| AnalysisError::StackMismatch { context: "restore then" })?;
        let parent = self
            .env
            .migo
            .func_mut(f.migo)
            .restore()
            .map_err(|_| AnalysisError::StackMismatch { context: "restore if-then-else parent" })?;
        self.env.migo.func_mut(f.migo).add_stmts(&parent);

        let empty = then.len() == 1 && then[0].is_tau() && els.len() == 1 && els[0].is_tau();
        if empty {
            self.env.migo.func_mut(f.migo).add_stmts(&[Statement::Tau]);
        } else {
            self.env.migo.func_mut(f.migo).add_stmts(&[Statement::If { then, els }]);
        }
        Ok(())
    }

    fn defining_eq_const(&self, f: &Frame, cond: ValueId) -> Option<(ValueId, i64)> {
        for blk in &self.prog.func(f.func).blocks {
            for instr in &blk.instrs {
                if let InstrKind::BinOp { result, op: BinOpKind::Eql, x, y } = &instr.kind {
                    if *result == cond {
                        return const_int(self.prog, *y).map(|c| (*x, c));
                    }
                }
            }
        }
        None
    }

    fn is_comma_ok_cond(&self, f: &Frame, cond: ValueId) -> bool {
        match f.locals.get(&cond) {
            Some(&inst) => f.commaok.values().any(|c| c.ok_cond == Some(inst)),
            None => false,
        }
    }

    fn visit_jump(&mut self, f: &mut Frame, b: &BlockCtx, l: &mut Loop) -> Result<()> {
        let prog = self.prog;
        let succs = &prog.func(f.func).blocks[b.block].succs;
        if succs.len() != 1 {
            return Err(AnalysisError::InvalidJumpSucc {
                func: prog.func(f.func).name.clone(),
                block: b.block,
            });
        }
        let next = succs[0];
        debug!("block {} → {}", b.block, next);
        if l.state == LoopState::Exit {
            l.state = LoopState::NonLoop;
        }
        if prog.func(f.func).blocks[next].preds.len() > 1 {
            // Join point: split into a block-function and call it.
            let in_loop = l.bound == LoopBound::Static && l.has_next();
            let name = if in_loop {
                format!("{}#{}_loop{}", prog.func(f.func).name, next, l.index)
            } else {
                format!("{}#{}", prog.func(f.func).name, next)
            };
            debug!("split at jump ({} → {}) {}", b.block, next, l);
            let mut stmt = Statement::Call { name: name.clone(), params: Vec::new() };
            let mut pass: Vec<Parameter> = Vec::new();
            {
                let cur = self.env.migo.func(f.migo);
                for s in &cur.stmts {
                    if let Statement::NewChan { name: cv, .. } = s {
                        pass.push(Parameter { caller: cv.clone(), callee: cv.clone() });
                    }
                }
                for p in &cur.params {
                    pass.push(Parameter { caller: p.callee.clone(), callee: p.callee.clone() });
                }
            }
            stmt.add_params(&pass);
            let stmt_params = match &stmt {
                Statement::Call { params, .. } => params.clone(),
                _ => Vec::new(),
            };
            self.env.migo.func_mut(f.migo).add_stmts(&[stmt]);
            if !f.visited.contains_key(&next) {
                let ctx = self.new_block(f, next);
                let new_func = if in_loop { self.env.migo.create_function(&name) } else { ctx.migo_def };
                let callee_params: Vec<Parameter> = stmt_params
                    .iter()
                    .map(|p| Parameter { caller: p.callee.clone(), callee: p.callee.clone() })
                    .collect();
                self.env.migo.func_mut(new_func).add_params(&callee_params);
                let old = f.migo;
                f.migo = new_func;
                self.env.migo.add_function(new_func);
                self.visit_block(f, ctx, l)?;
                f.migo = old;
                return Ok(());
            }
        }
        let ctx = self.new_block(f, next);
        self.visit_block(f, ctx, l)
    }

    fn visit_lookup(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        x: ValueId,
        index: ValueId,
        comma_ok: bool,
        l: &Loop,
    ) -> Result<()> {
        let prog = self.prog;
        let v = match f.resolve(x, prog, self.env) {
            Some(i) => i,
            None => return Err(self.unknown("lookup", x)),
        };
        let idx = match f.resolve(index, prog, self.env) {
            Some(i) => i,
            None => {
                let serial = f.next_serial();
                let i = self.env.store.fresh(index, serial, l.index);
                f.locals.insert(index, i);
                i
            }
        };
        let inst = self.bind_fresh(f, result, l);
        self.init_nested(f, inst, false);
        if comma_ok {
            f.commaok.insert(inst, CommaOk::default());
            f.tuples.insert(inst, empty_tuple(2)); // (elem, lookupOk)
        }
        debug!("{} = lookup {}[{}]", self.label(inst), self.label(v), self.label(idx));
        Ok(())
    }

    fn visit_makechan(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        size: ValueId,
        pos: Pos,
        l: &Loop,
    ) -> Result<()> {
        let prog = self.prog;
        let inst = self.bind_fresh(f, result, l);
        f.chan_names.insert(inst, result);
        let elem = prog.chan_elem(prog.value(result).ty).ok_or_else(|| {
            AnalysisError::MakeChanNonChan { value: prog.value_name(result).to_owned() }
        })?;
        let buf = const_int(prog, size).ok_or_else(|| AnalysisError::NonConstChanBuf {
            value: prog.value_name(size).to_owned(),
        })?;
        let role = f.goroutine.role.clone();
        let cid = self.env.store.register_chan(inst, elem, buf, pos, &role, false);
        let chan_name = self.env.store.channel(cid).name.clone();
        debug!(
            "{} = chan {{buf:{}}} @ {}",
            self.label(inst),
            buf,
            prog.decode_pos(pos)
        );
        let cv = ChanVar::new(result, prog.value_name(result));
        self.emit(f, Statement::NewChan { name: cv, chan: chan_name, size: buf });
        Ok(())
    }

    fn visit_makeclosure(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        func: crate::ssa::FuncId,
        bindings: &[ValueId],
        l: &Loop,
    ) -> Result<()> {
        let inst = self.bind_fresh(f, result, l);
        let mut caps = Vec::with_capacity(bindings.len());
        for &b in bindings {
            match f.resolve(b, self.prog, self.env) {
                Some(i) => caps.push(i),
                None => return Err(self.unknown("makeclosure", b)),
            }
        }
        self.env.closures.insert(inst, caps);
        self.env.closure_fn.insert(inst, func);
        debug!("{} = make closure", self.label(inst));
        Ok(())
    }

    fn visit_makeiface(&mut self, f: &mut Frame, result: ValueId, x: ValueId) -> Result<()> {
        if !f.locals.contains_key(&x) {
            if matches!(self.prog.value(x).kind, ValueKind::Const(_)) {
                let inst = self.env.store.fresh_const(x);
                f.locals.insert(x, inst);
            } else {
                return Err(self.unknown("make-iface", x));
            }
        }
        let inst = f.locals[&x];
        f.locals.insert(result, inst);
        debug!("{} = make-iface {}", self.label(inst), self.prog.value_name(x));
        Ok(())
    }

    fn visit_mapupdate(
        &mut self,
        f: &mut Frame,
        map: ValueId,
        key: ValueId,
        value: ValueId,
        l: &Loop,
    ) -> Result<()> {
        let prog = self.prog;
        let m_inst = match f.resolve(map, prog, self.env) {
            Some(i) => i,
            None => return Err(self.unknown("map-update", map)),
        };
        let table = match f.maps.get(&m_inst) {
            Some(&t) => t,
            None => {
                // The map was made somewhere the walk skipped.
                warn!("map-update: uninitialised map {}", prog.value_name(map));
                let t = self.env.store.new_map();
                f.maps.insert(m_inst, t);
                t
            }
        };
        let k = match f.resolve(key, prog, self.env) {
            Some(i) => i,
            None => {
                let serial = f.next_serial();
                let i = self.env.store.fresh(key, serial, l.index);
                f.locals.insert(key, i);
                i
            }
        };
        let v = match f.resolve(value, prog, self.env) {
            Some(i) => i,
            None => {
                let serial = f.next_serial();
                let i = self.env.store.fresh(value, serial, l.index);
                f.locals.insert(value, i);
                i
            }
        };
        self.env.store.map_mut(table).insert(k, v);
        debug!("{}[{}] = {}", self.label(m_inst), self.label(k), self.label(v));
        Ok(())
    }

    fn visit_phi(
        &mut self,
        f: &mut Frame,
        b: &BlockCtx,
        result: ValueId,
        edges: &[ValueId],
        l: &mut Loop,
    ) -> Result<()> {
        f.phis.insert(result, edges.to_vec());
        if l.ind_var == Some(result) {
            // Re-evaluated on loop re-entry: the iteration advances.
            l.next();
            debug!("phi {} loop index {}", self.prog.value_name(result), l.index);
            return Ok(());
        }
        let is_join = self.prog.func(f.func).blocks[b.block].preds.len() > 1;
        if l.state != LoopState::Exit && l.ind_var.is_none() && is_join {
            if let Some((start, step)) =
                loops::detect_induction(self.prog, self.prog.func(f.func), result, edges)
            {
                l.set_init(result, start, step);
                debug!("phi {} induction start {} step {}", self.prog.value_name(result), start, step);
                return Ok(());
            }
        }
        debug!("phi {} {} edges", self.prog.value_name(result), edges.len());
        Ok(())
    }

    fn visit_return(&mut self, f: &mut Frame, b: &BlockCtx, results: &[ValueId]) -> Result<()> {
        if self.env.migo.func(b.migo_def).is_empty() {
            self.env.migo.func_mut(b.migo_def).add_stmts(&[Statement::Tau]);
        }
        match results.len() {
            0 => debug!("return"),
            _ => {
                for &res in results {
                    match f.resolve(res, self.prog, self.env) {
                        Some(inst) => f.retvals.push(inst),
                        None => {
                            warn!("returning uninitialised value {}", self.prog.value_name(res));
                        }
                    }
                }
                debug!("return[{}]", results.len());
            }
        }
        Ok(())
    }

    fn visit_select(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        states: &[SelectState],
        blocking: bool,
        l: &Loop,
    ) -> Result<()> {
        let prog = self.prog;
        let inst = self.bind_fresh(f, result, l);
        let mut case_lists: Vec<Vec<Statement>> = Vec::with_capacity(states.len() + 1);
        for state in states {
            let name = match f.resolve(state.chan, prog, self.env) {
                Some(ch) => {
                    let cv = self.chan_var(f, ch, state.chan);
                    self.add_chan_param(f, &cv);
                    cv.name
                }
                None => {
                    warn!("select found an unknown channel {}", prog.value_name(state.chan));
                    prog.value_name(state.chan).to_owned()
                }
            };
            let stmt = match state.dir {
                ChanDir::Send => Statement::Send { chan: name },
                ChanDir::Recv => Statement::Recv { chan: name },
            };
            case_lists.push(vec![stmt]);
        }
        if !blocking {
            // Trailing default case.
            case_lists.push(vec![Statement::Tau]);
        }
        let ncases = case_lists.len();
        let cases: crate::migo::SelectCases = Rc::new(RefCell::new(case_lists));
        f.selects.insert(
            inst,
            SelectInFlight {
                states: states.to_vec(),
                blocking,
                cases: cases.clone(),
                index_value: None,
            },
        );
        f.tuples.insert(inst, empty_tuple(2 + ncases)); // index + recvok + cases
        self.emit(f, Statement::Select { cases });
        debug!("select {} cases {}", ncases, self.label(inst));
        Ok(())
    }

    fn visit_send(&mut self, f: &mut Frame, chan: ValueId) -> Result<()> {
        let prog = self.prog;
        let ch = match f.resolve(chan, prog, self.env) {
            Some(i) => i,
            None => return Err(self.unknown("send", chan)),
        };
        if self.env.store.chan_of(ch).is_none() {
            // Channel reached through an unanalysed path (external field).
            let elem = prog.chan_elem(prog.value(chan).ty).unwrap_or(prog.value(chan).ty);
            let role = f.goroutine.role.clone();
            self.env.store.register_chan(ch, elem, 0, Pos::NONE, &role, true);
            warn!("send on unregistered channel {}", prog.value_name(chan));
        }
        let cv = self.chan_var(f, ch, chan);
        debug!("send {} ({})", cv.name, self.label(ch));
        self.emit(f, Statement::Send { chan: cv.name.clone() });
        self.add_chan_param(f, &cv);
        Ok(())
    }

    fn visit_recv(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        x: ValueId,
        comma_ok: bool,
        l: &Loop,
    ) -> Result<()> {
        let prog = self.prog;
        let ch = match f.resolve(x, prog, self.env) {
            Some(i) => i,
            None => return Err(self.unknown("recv", x)),
        };
        let inst = self.bind_fresh(f, result, l);
        if comma_ok {
            f.commaok.insert(inst, CommaOk::default());
            f.tuples.insert(inst, empty_tuple(2)); // (recvVal, recvOk)
        }
        if self.env.store.chan_of(ch).is_none() {
            let elem = prog.chan_elem(prog.value(x).ty).unwrap_or(prog.value(x).ty);
            let role = f.goroutine.role.clone();
            self.env.store.register_chan(ch, elem, 0, Pos::NONE, &role, true);
            warn!("recv on unregistered channel {}", prog.value_name(x));
        }
        let cv = self.chan_var(f, ch, x);
        debug!("{} = recv {}", self.label(inst), cv.name);
        self.emit(f, Statement::Recv { chan: cv.name.clone() });
        self.add_chan_param(f, &cv);
        self.init_nested(f, inst, false);
        Ok(())
    }

    fn visit_slice(&mut self, f: &mut Frame, result: ValueId, x: ValueId, l: &Loop) -> Result<()> {
        let prog = self.prog;
        let inst = self.bind_fresh(f, result, l);
        let x_inst = match f.resolve(x, prog, self.env) {
            Some(i) => i,
            None => return Err(self.unknown("slice", x)),
        };
        let rt = prog.value(result).ty;
        if prog.is_string(rt) {
            debug!("{} = slice on string, skipping", self.label(inst));
            return Ok(());
        }
        if let Some(elem) = prog.slice_elem(rt) {
            if prog.is_byte(elem) {
                debug!("{} = slice on bytes, skipping", self.label(inst));
                return Ok(());
            }
        }
        if let Some(&table) = f.arrays.get(&x_inst) {
            f.arrays.insert(inst, table);
            debug!("{} = slice {}", self.label(inst), self.label(x_inst));
            return Ok(());
        }
        if let Some(&table) = self.env.arrays.get(&x_inst) {
            self.env.arrays.insert(inst, table);
            debug!("{} = slice {} (heap)", self.label(inst), self.label(x_inst));
            return Ok(());
        }
        if self.env.store.is_const(x_inst) {
            let table = self.env.store.new_elems();
            f.arrays.insert(x_inst, table);
            debug!("slice: const {}", prog.value_name(x));
            return Ok(());
        }
        Err(self.unknown("slice", x))
    }

    fn visit_store(&mut self, f: &mut Frame, addr: ValueId, value: ValueId, l: &Loop) -> Result<()> {
        let prog = self.prog;
        let aggregate = {
            let vt = prog.underlying(prog.value(value).ty);
            matches!(
                prog.ty(vt),
                TypeData::Array { .. } | TypeData::Slice { .. } | TypeData::Struct { .. } | TypeData::Map { .. }
            )
        };
        if matches!(prog.value(addr).kind, ValueKind::Global) {
            let dst = *self.env.globals.get(&addr).ok_or_else(|| self.unknown("store (global)", addr))?;
            let inst = match f.resolve(value, prog, self.env) {
                Some(i) => i,
                None => return Err(self.unknown("store (global)", value)),
            };
            self.env.globals.insert(addr, inst);
            if aggregate {
                self.env.store.update_instances(dst, inst);
            }
            debug!("{} = {} (global)", prog.value_name(addr), self.label(inst));
            return Ok(());
        }
        if prog.is_byte(prog.deref(prog.value(addr).ty)) {
            self.bind_fresh(f, addr, l);
        }
        let dst = *f.locals.get(&addr).ok_or_else(|| self.unknown("store: addr", addr))?;
        let inst = match f.resolve(value, prog, self.env) {
            Some(i) => i,
            None => {
                warn!("store: val {}: unknown value", prog.value_name(value));
                return Ok(());
            }
        };
        f.locals.insert(addr, inst);
        if aggregate {
            self.env.store.update_instances(dst, inst);
        }
        debug!("*{} store= {}", prog.value_name(addr), self.label(inst));
        Ok(())
    }

    fn visit_typeassert(
        &mut self,
        f: &mut Frame,
        result: ValueId,
        x: ValueId,
        asserted: crate::ssa::TypeId,
        comma_ok: bool,
        l: &Loop,
    ) -> Result<()> {
        let prog = self.prog;
        if prog.is_interface(asserted) {
            if let Some(missing) = prog.missing_method(prog.value(x).ty, asserted) {
                return Err(AnalysisError::MethodNotFound {
                    method: missing.to_owned(),
                    value: prog.value_name(x).to_owned(),
                });
            }
        }
        let inst = *f.locals.get(&x).ok_or_else(|| self.unknown("typeassert", x))?;
        if comma_ok {
            let fresh = self.bind_fresh(f, result, l);
            f.commaok.insert(fresh, CommaOk::default());
            f.tuples.insert(fresh, empty_tuple(2));
            debug!("{} = typeassert {} commaok", self.label(fresh), self.label(inst));
            return Ok(());
        }
        f.locals.insert(result, inst);
        debug!("{} = typeassert {}", self.label(inst), prog.value_name(x));
        Ok(())
    }
}

fn scope(heap: bool) -> &'static str {
    if heap {
        "heap"
    } else {
        "local"
    }
}
