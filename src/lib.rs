//! Static extraction of MiGo behavioural types from SSA programs.
//!
//! The analyzer walks a program in Static Single Assignment form
//! symbolically and emits a program in MiGo, a small behavioural language
//! whose terms describe channel creation, sends, receives, closes,
//! goroutine spawns, selects, conditionals and recursive call structure.
//! Downstream tools consume the MiGo output to look for communication
//! anomalies such as deadlocks and unsafe sends or closes.
//!
//! The pipeline is: build an [`ssa::SsaProgram`] (the CLI uses the textual
//! frontend in [`ssabuild`]), hand it to [`infer::MigoExtract`], `run` the
//! analysis, and print the [`migo::Program`].
//!
//! ```no_run
//! use migo_extract::infer::MigoExtract;
//! use migo_extract::ssabuild;
//!
//! let prog = ssabuild::parse_source("example.ssa", "package main\n...").unwrap();
//! let mut extract = MigoExtract::new(prog);
//! extract.run().unwrap();
//! extract.migo_mut().cleanup();
//! println!("{}", extract.migo());
//! ```
//!
//! ## How the extraction works
//!
//! Every SSA value the walk touches is bound to an *instance* in a store of
//! abstract values (`store`); aggregate shapes (array slots, struct fields,
//! map entries), tuples and closure captures are tracked there as well.
//! Each function activation gets a frame (`frame`) holding its bindings and
//! bookkeeping; all frames share one environment carrying the channel
//! registry, the heap tables, the goroutine queue and the MiGo program under
//! construction.  The interpreter (`visit`, `call`) dispatches on the
//! instruction variants, modelling interprocedural flow by pushing frames,
//! detecting recursion by call-stack cycles, and queueing spawned goroutine
//! frames for later.  Block-structured control flow is re-synthesised from
//! the branch graph: joins split the emitted function into block-functions,
//! statically bounded loops (`loops`) are unrolled, and `if`/`select`
//! shapes are rebuilt via a statement stack on the emitted function
//! (`migo`).
//!
//! The analysis is flow-sensitive but deliberately not path-sensitive, and
//! it does not attempt sound treatment of arbitrary aliasing; see the
//! module documentation of `store` for the shape-level discipline it does
//! maintain.

pub mod errors;
pub mod frame;
pub mod infer;
pub mod loops;
pub mod migo;
pub mod ssa;
pub mod ssabuild;
pub mod store;

mod call;
mod visit;

#[cfg(test)]
mod visit_tests;
