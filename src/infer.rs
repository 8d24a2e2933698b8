//! Analysis driver.
//!
//! A `MigoExtract` owns the SSA program and the shared environment, seeds the
//! top-level frame with the package globals, walks `init` and `main`, then
//! drains the goroutine queue.  Queued goroutine frames run through the same
//! call-stack cycle check as ordinary calls, so a goroutine spawning itself
//! (directly or through a cycle) terminates with only its spawn sites
//! emitted.

use crate::errors::AnalysisError;
use crate::frame::{Env, Frame};
use crate::migo::Program;
use crate::ssa::{FuncId, SsaProgram, TypeData};
use crate::visit::Interp;
use log::{debug, info};
use std::time::{Duration, Instant};

/// The extraction pass over one SSA program.
pub struct MigoExtract {
    prog: SsaProgram,
    env: Env,
    /// Wall-clock duration of the last `run`.
    pub time: Duration,
}

impl MigoExtract {
    /// Creates the analysis and seeds the environment with package globals:
    /// arrays and structs get a heap shape table, channels and scalars a
    /// plain instance (a channel table entry materialises at first use).
    pub fn new(prog: SsaProgram) -> MigoExtract {
        let mut env = Env::new();
        let mut serial = 0u32;
        for pkg in &prog.packages {
            for &g in &pkg.globals {
                let inst = env.store.fresh(g, serial, 0);
                serial += 1;
                let t = prog.underlying(prog.deref(prog.value(g).ty));
                match prog.ty(t) {
                    TypeData::Array { .. } | TypeData::Slice { .. } => {
                        let table = env.store.new_elems();
                        env.arrays.insert(inst, table);
                    }
                    TypeData::Struct { fields } => {
                        let table = env.store.new_fields(fields.len());
                        env.structs.insert(inst, table);
                    }
                    _ => {}
                }
                env.globals.insert(g, inst);
                debug!("global {} seeded", prog.value_name(g));
            }
        }
        MigoExtract { prog, env, time: Duration::default() }
    }

    fn find_main(&self) -> Result<FuncId, AnalysisError> {
        if let Some(f) = self.prog.func_by_name("main.main") {
            return Ok(f);
        }
        self.prog
            .funcs()
            .find(|(_, f)| f.short_name() == "main")
            .map(|(id, _)| id)
            .ok_or(AnalysisError::NoMainFunction)
    }

    /// Runs the analysis: `init`, `main`, then the goroutine queue.
    pub fn run(&mut self) -> Result<(), AnalysisError> {
        let started = Instant::now();
        let main = self.find_main()?;
        let prog = &self.prog;
        let env = &mut self.env;

        if let Some(init) = prog.func_by_name("main.init") {
            let migo = env.migo.create_function(&prog.func(init).name);
            let mut frame = Frame::new(init, migo, "main");
            Interp::new(prog, env).visit_func(&mut frame)?;
        }

        let migo = env.migo.create_function(&prog.func(main).name);
        let mut frame = Frame::new(main, migo, "main");
        Interp::new(prog, env).visit_func(&mut frame)?;

        // Drain spawned goroutines; visits may queue more.
        while let Some(mut g) = env.go_queue.pop_front() {
            info!("goroutine {} ({})", prog.func(g.func).name, g.goroutine.role);
            if g.is_recursive() {
                info!("recursive goroutine {}, not visited", prog.func(g.func).name);
                g.log_call_stack(prog);
                continue;
            }
            Interp::new(prog, env).visit_func(&mut g)?;
        }

        self.time = started.elapsed();
        info!("analysis finished in {}ms", self.time.as_millis());
        Ok(())
    }

    /// The emitted MiGo program.
    pub fn migo(&self) -> &Program {
        &self.env.migo
    }

    pub fn migo_mut(&mut self) -> &mut Program {
        &mut self.env.migo
    }

    pub fn into_migo(self) -> Program {
        self.env.migo
    }
}
