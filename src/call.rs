//! Interprocedural flow: calls, spawns, deferred calls, return routing.
//!
//! A call pushes a fresh frame sharing the environment, binds formal
//! parameters to the actual argument instances, propagates aggregate shape
//! handles (by reference, so slot updates are visible to the caller) and
//! copies closure captures into the callee's free-variable slots.  Recursive
//! activations are cut off by the frame's call-stack cycle check and only the
//! call site is emitted.
//!
//! Spawns mirror the call preparation but allocate a new role and queue the
//! frame on the environment instead of visiting it; the driver drains the
//! queue after the main flow.

use crate::errors::AnalysisError;
use crate::frame::{empty_tuple, Frame};
use crate::loops::Loop;
use crate::migo::{ChanVar, Parameter, Statement};
use crate::ssa::{CallCommon, FuncId, Pos, ValueId, ValueKind};
use crate::visit::{Interp, Result};
use log::{debug, info, warn};

impl Interp<'_> {
    /// Resolves a call site to its callee variant and dispatches.
    pub(crate) fn call(
        &mut self,
        f: &mut Frame,
        l: &Loop,
        result: Option<ValueId>,
        call: &CallCommon,
    ) -> Result<()> {
        let prog = self.prog;
        match prog.value(call.value).kind.clone() {
            ValueKind::Builtin(name) => self.call_builtin(f, l, result, &name, call),
            ValueKind::Function(fid) => self.call_fn(f, l, result, call, fid),
            _ if call.is_invoke() => self.call_invoke(f, l, result, call),
            _ => {
                // A closure value called through its register.
                let closure = f
                    .resolve(call.value, prog, self.env)
                    .and_then(|inst| self.env.closure_fn.get(&inst).copied());
                match closure {
                    Some(fid) => self.call_fn(f, l, result, call, fid),
                    None => {
                        warn!("unknown call type {}", prog.value_name(call.value));
                        Ok(())
                    }
                }
            }
        }
    }

    fn call_builtin(
        &mut self,
        f: &mut Frame,
        _l: &Loop,
        result: Option<ValueId>,
        name: &str,
        call: &CallCommon,
    ) -> Result<()> {
        let prog = self.prog;
        match name {
            "close" => {
                let arg = match call.args.first() {
                    Some(&a) => a,
                    None => return Ok(()),
                };
                let ch = match f.resolve(arg, prog, self.env) {
                    Some(i) => i,
                    None => return Err(self.unknown("close", arg)),
                };
                if self.env.store.chan_of(ch).is_none() {
                    return Err(AnalysisError::InvalidVarRead {
                        instr: "close".to_owned(),
                        value: prog.value_name(arg).to_owned(),
                    });
                }
                let cv = self.chan_var(f, ch, arg);
                debug!("close {}", cv.name);
                self.emit(f, Statement::Close { chan: cv.name.clone() });
                self.add_chan_param(f, &cv);
                Ok(())
            }
            "copy" => {
                if call.args.len() < 2 {
                    return Ok(());
                }
                let (dst, src) = (call.args[0], call.args[1]);
                let inst = match f.resolve(src, prog, self.env) {
                    Some(i) => i,
                    None => return Err(self.unknown("copy", src)),
                };
                f.locals.insert(dst, inst);
                debug!("copy {} <- {}", prog.value_name(dst), prog.value_name(src));
                Ok(())
            }
            _ => {
                warn!("builtin {} unsupported, no communication effect", name);
                if let Some(res) = result {
                    let inst = self.env.store.fresh_external(res);
                    f.locals.insert(res, inst);
                }
                Ok(())
            }
        }
    }

    /// A static call: prepare the callee frame, visit unless recursive,
    /// route return values, emit the call site.
    fn call_fn(
        &mut self,
        f: &mut Frame,
        l: &Loop,
        result: Option<ValueId>,
        call: &CallCommon,
        fid: FuncId,
    ) -> Result<()> {
        let prog = self.prog;
        let name = prog.func(fid).name.clone();
        debug!("call {}()", name);
        let callee_migo = self.env.migo.create_function(&name);
        let mut callee = f.child(fid, callee_migo);
        self.translate(f, &mut callee, call, fid)?;
        if callee.is_recursive() {
            info!("recursive {}(), emitting call site only", name);
            callee.log_call_stack(prog);
            let stmt = self.call_stmt(f, call, fid);
            self.emit(f, stmt);
            return Ok(());
        }
        let has_body = self.visit_func(&mut callee)?;
        if has_body {
            self.store_retvals(f, l, result, &callee);
            let stmt = self.call_stmt(f, call, fid);
            self.emit(f, stmt);
        } else {
            self.ext_retvals(f, result, fid);
        }
        debug!("return from {} ({} retvals)", name, callee.retvals.len());
        Ok(())
    }

    /// Dynamic interface dispatch on a struct receiver.
    fn call_invoke(
        &mut self,
        f: &mut Frame,
        l: &Loop,
        result: Option<ValueId>,
        call: &CallCommon,
    ) -> Result<()> {
        let prog = self.prog;
        let method = match &call.method {
            Some(m) => m.clone(),
            None => return Ok(()),
        };
        let recv = call.value;
        let r_inst = match f.resolve(recv, prog, self.env) {
            Some(i) => i,
            None => return Err(self.unknown("invoke", recv)),
        };
        let concrete = prog.deref(prog.value(self.env.store.value_of(r_inst)).ty);
        if prog.struct_fields(concrete).is_none() {
            warn!("invoke {}.{} on non-struct receiver", prog.value_name(recv), method);
            return Ok(());
        }
        let iface = prog.value(recv).ty;
        if !prog.is_interface(iface) {
            warn!("method {}.{} does not exist", prog.value_name(recv), method);
            return Ok(());
        }
        if let Some(missing) = prog.missing_method(concrete, iface) {
            warn!("interface not fully implemented: {} missing {}", prog.value_name(recv), missing);
            return Ok(());
        }
        let mid = match prog.lookup_method(concrete, &method) {
            Some(m) => m,
            None => return Err(AnalysisError::AbstractMethod { method }),
        };
        debug!("invoke resolved to {}", prog.func(mid).name);
        // A fresh argument vector with the receiver prepended; the SSA
        // instruction itself stays untouched.
        let mut direct = call.clone();
        direct.method = None;
        direct.args.insert(0, recv);
        self.call_fn(f, l, result, &direct, mid)
    }

    /// Queues a goroutine frame for the spawned callee and emits `spawn`.
    pub(crate) fn go_spawn(&mut self, f: &mut Frame, call: &CallCommon) -> Result<()> {
        let prog = self.prog;
        let fid = match call.static_callee(prog) {
            Some(fid) => fid,
            None => {
                let closure = f
                    .resolve(call.value, prog, self.env)
                    .and_then(|inst| self.env.closure_fn.get(&inst).copied());
                match closure {
                    Some(fid) => fid,
                    None => {
                        warn!("spawn of unknown callee {}", prog.value_name(call.value));
                        return Ok(());
                    }
                }
            }
        };
        let name = prog.func(fid).name.clone();
        let role = self.env.next_role(&name);
        let callee_migo = self.env.migo.create_function(&name);
        let mut g = f.spawned(fid, callee_migo, &role);
        self.translate(f, &mut g, call, fid)?;
        let params = self.chan_params(f, call, fid);
        let mut stmt = Statement::Spawn { name: name.clone(), params: Vec::new() };
        stmt.add_params(&params);
        debug!("spawn {} as role {}", name, role);
        self.emit(f, stmt);
        self.env.go_queue.push_back(g);
        Ok(())
    }

    /// Visits deferred calls in reverse insertion order and emits their call
    /// sites into the current flow.
    pub(crate) fn run_defers(&mut self, f: &mut Frame) -> Result<()> {
        let defers = f.defers.clone();
        for call in defers.iter().rev() {
            let fid = match call.static_callee(self.prog) {
                Some(fid) => fid,
                None => {
                    warn!("defer of unknown callee {}", self.prog.value_name(call.value));
                    continue;
                }
            };
            let name = self.prog.func(fid).name.clone();
            let callee_migo = self.env.migo.create_function(&name);
            let mut callee = f.child(fid, callee_migo);
            self.translate(f, &mut callee, call, fid)?;
            if callee.is_recursive() {
                info!("recursive deferred {}(), skipping body", name);
                continue;
            }
            let has_body = self.visit_func(&mut callee)?;
            if has_body {
                let params = self.chan_params(f, call, fid);
                let mut stmt = Statement::Call { name, params: Vec::new() };
                stmt.add_params(&params);
                self.emit(f, stmt);
            }
        }
        Ok(())
    }

    /// Binds formal parameters from actual argument instances, propagates
    /// aggregate shape handles and closure captures.
    fn translate(
        &mut self,
        caller: &mut Frame,
        callee: &mut Frame,
        call: &CallCommon,
        fid: FuncId,
    ) -> Result<()> {
        let prog = self.prog;
        let params = prog.func(fid).params.clone();
        for (i, &param) in params.iter().enumerate() {
            let arg = match call.args.get(i) {
                Some(&a) => a,
                None => break,
            };
            match caller.resolve(arg, prog, self.env) {
                Some(inst) => {
                    callee.locals.insert(param, inst);
                    if let Some(&t) = caller.arrays.get(&inst) {
                        callee.arrays.insert(inst, t);
                    }
                    if let Some(&t) = caller.structs.get(&inst) {
                        callee.structs.insert(inst, t);
                    }
                    if let Some(&t) = caller.maps.get(&inst) {
                        callee.maps.insert(inst, t);
                    }
                    if self.env.store.chan_of(inst).is_some() {
                        callee.chan_names.insert(inst, param);
                    }
                    debug!("  {} = caller[{}] {}", prog.value_name(param), prog.value_name(arg), self.label(inst));
                }
                None => {
                    debug!("  {} = caller[{}] unbound", prog.value_name(param), prog.value_name(arg));
                }
            }
        }
        // Captures recorded at the closure's construction site.
        if let Some(inst) = caller.resolve(call.value, prog, self.env) {
            if let Some(caps) = self.env.closures.get(&inst).cloned() {
                let fvs = prog.func(fid).free_vars.clone();
                for (i, &fv) in fvs.iter().enumerate() {
                    if let Some(&cap) = caps.get(i) {
                        callee.locals.insert(fv, cap);
                        if self.env.store.chan_of(cap).is_some() {
                            callee.chan_names.insert(cap, fv);
                        }
                        debug!("  capture {} = {}", prog.value_name(fv), self.label(cap));
                    }
                }
            }
        }
        Ok(())
    }

    /// The channel-typed caller-to-callee parameter pairs of a call site.
    fn chan_params(&mut self, f: &mut Frame, call: &CallCommon, fid: FuncId) -> Vec<Parameter> {
        let prog = self.prog;
        let params = prog.func(fid).params.clone();
        let mut out = Vec::new();
        for (i, &arg) in call.args.iter().enumerate() {
            if !prog.is_chan(prog.value(arg).ty) {
                continue;
            }
            let callee_p = match params.get(i) {
                Some(&p) => p,
                None => continue,
            };
            let caller_cv = match f.resolve(arg, prog, self.env) {
                Some(inst) => self.chan_var(f, inst, arg),
                None => ChanVar::new(arg, prog.value_name(arg)),
            };
            out.push(Parameter {
                caller: caller_cv,
                callee: ChanVar::new(callee_p, prog.value_name(callee_p)),
            });
        }
        out
    }

    fn call_stmt(&mut self, f: &mut Frame, call: &CallCommon, fid: FuncId) -> Statement {
        let params = self.chan_params(f, call, fid);
        let mut stmt =
            Statement::Call { name: self.prog.func(fid).name.clone(), params: Vec::new() };
        stmt.add_params(&params);
        stmt
    }

    /// Routes return values of a visited callee to the call's result value.
    fn store_retvals(&mut self, f: &mut Frame, l: &Loop, result: Option<ValueId>, callee: &Frame) {
        if callee.retvals.is_empty() {
            return;
        }
        let res = match result {
            Some(r) => r,
            None => return,
        };
        if callee.retvals.len() == 1 {
            f.locals.insert(res, callee.retvals[0]);
        } else {
            let serial = f.next_serial();
            let inst = self.env.store.fresh(res, serial, l.index);
            f.locals.insert(res, inst);
            let mut slots = empty_tuple(callee.retvals.len());
            for (i, &r) in callee.retvals.iter().enumerate() {
                slots[i] = Some(r);
            }
            f.tuples.insert(inst, slots);
        }
    }

    /// A body-less callee: record the result in the external table; fabricate
    /// an external channel when the single result is channel-typed.
    fn ext_retvals(&mut self, f: &mut Frame, result: Option<ValueId>, fid: FuncId) {
        let prog = self.prog;
        let results = prog.func(fid).results.clone();
        if results.is_empty() {
            return;
        }
        let res = match result {
            Some(r) => r,
            None => return,
        };
        self.env.extern_vals.insert(res, results.clone());
        let inst = self.env.store.fresh_external(res);
        f.locals.insert(res, inst);
        if results.len() == 1 && prog.is_chan(results[0]) {
            let elem = prog.chan_elem(results[0]).unwrap_or(results[0]);
            let role = f.goroutine.role.clone();
            self.env.store.register_chan(inst, elem, 0, Pos::NONE, &role, true);
            f.chan_names.insert(inst, res);
            debug!("return value of {} is an external channel", prog.func(fid).name);
        } else {
            debug!("return from {} (external, {} results)", prog.func(fid).name, results.len());
        }
    }
}
