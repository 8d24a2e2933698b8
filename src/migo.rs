//! The MiGo program being emitted.
//!
//! MiGo is a small behavioural language capturing channel creation, sends,
//! receives, closes, spawns, selects, conditionals and (recursive) calls.
//! This module is a data structure, not a formatter: the analysis appends
//! statements and parameters as it walks the SSA, and the `Display` impls at
//! the bottom serialise the finished program in the concrete syntax consumed
//! by downstream checkers.
//!
//! A [`Function`] owns a private statement stack used while conditionals and
//! select branches are being reconstructed; pushes and pops must balance, and
//! an unbalanced pop surfaces as an error rather than silently corrupting the
//! output.

use crate::ssa::ValueId;
use fnv::{FnvHashMap, FnvHashSet};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

lazy_static! {
    static ref NAME_FILTER: Regex = Regex::new(r"[()*]").unwrap();
}

/// Sanitises a function or channel name for the MiGo concrete syntax:
/// parentheses and stars are removed, slashes become underscores.
pub fn simple_name(name: &str) -> String {
    NAME_FILTER.replace_all(name, "").replace('/', "_")
}

/// A named value as it appears in MiGo parameter lists and statements.
///
/// Identity (for deduplication) is the SSA value; the name is what gets
/// printed.
#[derive(Clone, Debug)]
pub struct ChanVar {
    pub value: ValueId,
    pub name: String,
}

impl ChanVar {
    pub fn new(value: ValueId, name: &str) -> ChanVar {
        ChanVar { value, name: name.to_owned() }
    }
}

impl PartialEq for ChanVar {
    fn eq(&self, other: &ChanVar) -> bool {
        self.value == other.value
    }
}

/// A translation from a caller-side value to the callee-side value.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub caller: ChanVar,
    pub callee: ChanVar,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{} → {}]", self.caller.name, self.callee.name)
    }
}

fn caller_params(params: &[Parameter]) -> String {
    params.iter().map(|p| p.caller.name.as_str()).join(", ")
}

fn callee_params(params: &[Parameter]) -> String {
    params.iter().map(|p| p.callee.name.as_str()).join(", ")
}

/// Shared, in-place-extendable case lists of a select statement.
///
/// The select skeleton is appended to the function body as soon as the SSA
/// `Select` is visited; the branch bodies are discovered later while the
/// if-chain testing the chosen index is walked, and are spliced into the
/// already-emitted statement through this shared handle.
pub type SelectCases = Rc<RefCell<Vec<Vec<Statement>>>>;

/// MiGo statement variants.
#[derive(Clone, Debug)]
pub enum Statement {
    /// `let name = newchan chan, size`
    NewChan { name: ChanVar, chan: String, size: i64 },
    Send { chan: String },
    Recv { chan: String },
    Close { chan: String },
    Call { name: String, params: Vec<Parameter> },
    Spawn { name: String, params: Vec<Parameter> },
    If { then: Vec<Statement>, els: Vec<Statement> },
    Select { cases: SelectCases },
    /// Inaction.
    Tau,
}

impl Statement {
    pub fn is_tau(&self) -> bool {
        matches!(self, Statement::Tau)
    }

    /// Adds parameters to a call or spawn, skipping exact duplicates.
    pub fn add_params(&mut self, new: &[Parameter]) {
        if let Statement::Call { params, .. } | Statement::Spawn { params, .. } = self {
            for p in new {
                if !params.contains(p) {
                    params.push(p.clone());
                }
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Statement::NewChan { name, chan, size } => {
                write!(f, "let {} = newchan {}, {}", name.name, simple_name(chan), size)
            }
            Statement::Send { chan } => write!(f, "send {}", chan),
            Statement::Recv { chan } => write!(f, "recv {}", chan),
            Statement::Close { chan } => write!(f, "close {}", chan),
            Statement::Call { name, params } => {
                write!(f, "call {}({})", simple_name(name), caller_params(params))
            }
            Statement::Spawn { name, params } => {
                write!(f, "spawn {}({})", simple_name(name), caller_params(params))
            }
            Statement::If { then, els } => {
                write!(f, "if ")?;
                for s in then {
                    write!(f, "{}; ", s)?;
                }
                write!(f, "else ")?;
                for s in els {
                    write!(f, "{}; ", s)?;
                }
                write!(f, "endif")
            }
            Statement::Select { cases } => {
                write!(f, "select")?;
                for case in cases.borrow().iter() {
                    write!(f, "\n      case ")?;
                    for s in case {
                        write!(f, "{}; ", s)?;
                    }
                }
                write!(f, "\n    endselect")
            }
            Statement::Tau => write!(f, "tau"),
        }
    }
}

/// Error returned by [`Function::restore`] when pops outnumber pushes.
#[derive(Debug, PartialEq, Eq)]
pub struct EmptyStackError;

impl fmt::Display for EmptyStackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "statement stack is empty")
    }
}

impl std::error::Error for EmptyStackError {}

/// LIFO stack of statement lists for nested conditional reconstruction.
#[derive(Debug, Default)]
pub struct StmtStack {
    stack: Vec<Vec<Statement>>,
}

impl StmtStack {
    pub fn push(&mut self, stmts: Vec<Statement>) {
        self.stack.push(stmts);
    }

    pub fn pop(&mut self) -> Result<Vec<Statement>, EmptyStackError> {
        self.stack.pop().ok_or(EmptyStackError)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Handle of a function in the emitted program.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MigoId(pub usize);

/// A block of statements sharing the same parameters.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<Parameter>,
    pub stmts: Vec<Statement>,
    /// Set by [`Program::mark_comm`]; the printer elides functions that are
    /// empty or communication-free.
    pub has_comm: bool,
    stack: StmtStack,
}

impl Function {
    pub fn new(name: &str) -> Function {
        Function {
            name: name.to_owned(),
            params: Vec::new(),
            stmts: Vec::new(),
            has_comm: false,
            stack: StmtStack::default(),
        }
    }

    pub fn simple_name(&self) -> String {
        simple_name(&self.name)
    }

    /// Appends parameters, deduplicating by caller or callee value identity.
    pub fn add_params(&mut self, params: &[Parameter]) {
        for param in params {
            let found = self
                .params
                .iter()
                .any(|p| p.callee == param.callee || p.caller == param.caller);
            if !found {
                self.params.push(param.clone());
            }
        }
    }

    /// Appends statements.  A trailing `tau` is a placeholder: it is dropped
    /// when a non-tau statement follows, and never duplicated.
    pub fn add_stmts(&mut self, stmts: &[Statement]) {
        for s in stmts {
            let last_is_tau = self.stmts.last().map_or(false, Statement::is_tau);
            if s.is_tau() {
                if !last_is_tau {
                    self.stmts.push(Statement::Tau);
                }
                continue; // at most one trailing tau
            }
            if last_is_tau {
                self.stmts.pop();
            }
            self.stmts.push(s.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// Pushes the current statement list onto the private stack and starts a
    /// fresh one.
    pub fn put_away(&mut self) {
        let stmts = std::mem::take(&mut self.stmts);
        self.stack.push(stmts);
    }

    /// Pops the most recently saved statement list.
    pub fn restore(&mut self) -> Result<Vec<Statement>, EmptyStackError> {
        self.stack.pop()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "def {}({}):", self.simple_name(), callee_params(&self.params))?;
        for stmt in &self.stmts {
            writeln!(f, "    {};", stmt)?;
        }
        Ok(())
    }
}

/// The set of functions in an emitted MiGo program.
///
/// Every function ever created lives in the arena; the registry is unique by
/// name with first-seen-wins semantics, so a late duplicate keeps receiving
/// statements but never reaches the printed program.
#[derive(Debug, Default)]
pub struct Program {
    funcs: Vec<Function>,
    order: Vec<MigoId>,
    registered: FnvHashMap<String, MigoId>,
}

impl Program {
    pub fn new() -> Program {
        Program::default()
    }

    /// Allocates a function in the arena without registering it.
    pub fn create_function(&mut self, name: &str) -> MigoId {
        let id = MigoId(self.funcs.len());
        self.funcs.push(Function::new(name));
        id
    }

    /// Registers a function in the program; no-op if the name is taken.
    pub fn add_function(&mut self, id: MigoId) {
        let name = self.funcs[id.0].name.clone();
        if self.registered.contains_key(&name) {
            return;
        }
        self.registered.insert(name, id);
        self.order.push(id);
    }

    /// Looks up a registered function by its sanitised name.
    pub fn function_by_simple_name(&self, name: &str) -> Option<MigoId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.funcs[id.0].simple_name() == name)
    }

    pub fn func(&self, id: MigoId) -> &Function {
        &self.funcs[id.0]
    }

    pub fn func_mut(&mut self, id: MigoId) -> &mut Function {
        &mut self.funcs[id.0]
    }

    pub fn registered(&self) -> impl Iterator<Item = &Function> {
        self.order.iter().map(move |&id| &self.funcs[id.0])
    }

    /// Propagates the has-communication flag from `main.main` through calls
    /// and spawns.
    pub fn mark_comm(&mut self) {
        if let Some(main) = self.function_by_simple_name("main.main") {
            let mut visited = FnvHashSet::default();
            self.mark_comm_fn(main, &mut visited);
        }
    }

    fn mark_comm_fn(&mut self, id: MigoId, visited: &mut FnvHashSet<MigoId>) -> bool {
        if !visited.insert(id) {
            return self.funcs[id.0].has_comm;
        }
        let stmts = self.funcs[id.0].stmts.clone();
        let has = self.mark_comm_stmts(id, &stmts, visited);
        self.funcs[id.0].has_comm = has;
        has
    }

    fn mark_comm_stmts(
        &mut self,
        id: MigoId,
        stmts: &[Statement],
        visited: &mut FnvHashSet<MigoId>,
    ) -> bool {
        let mut has = self.funcs[id.0].has_comm;
        for s in stmts {
            match s {
                Statement::NewChan { .. }
                | Statement::Send { .. }
                | Statement::Recv { .. }
                | Statement::Close { .. }
                | Statement::Select { .. } => has = true,
                Statement::Call { name, .. } => {
                    if let Some(callee) = self.function_by_simple_name(&simple_name(name)) {
                        has |= self.mark_comm_fn(callee, visited);
                    }
                }
                Statement::Spawn { name, .. } => {
                    if let Some(callee) = self.function_by_simple_name(&simple_name(name)) {
                        self.funcs[callee.0].has_comm = true;
                        self.mark_comm_fn(callee, visited);
                    }
                    has = true;
                }
                Statement::If { then, els } => {
                    has |= self.mark_comm_stmts(id, then, visited);
                    has |= self.mark_comm_stmts(id, els, visited);
                }
                Statement::Tau => {}
            }
        }
        has
    }

    /// Final fixup before printing; the printer only emits non-empty
    /// functions marked as communicating.
    pub fn cleanup(&mut self) {
        self.mark_comm();
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for func in self.registered() {
            if !func.is_empty() && func.has_comm {
                write!(f, "{}", func)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::ValueId;

    fn var(i: u32, name: &str) -> ChanVar {
        ChanVar::new(ValueId(i), name)
    }

    fn param(i: u32, name: &str) -> Parameter {
        Parameter { caller: var(i, name), callee: var(i, name) }
    }

    #[test]
    fn stack_is_lifo() {
        let mut ns = StmtStack::default();
        ns.push(vec![Statement::Send { chan: "a".to_owned() }]);
        ns.push(vec![Statement::Recv { chan: "b".to_owned() }]);
        ns.push(vec![Statement::Tau]);
        assert!(ns.pop().unwrap()[0].is_tau());
        assert!(matches!(&ns.pop().unwrap()[0], Statement::Recv { chan } if chan == "b"));
        assert!(matches!(&ns.pop().unwrap()[0], Statement::Send { chan } if chan == "a"));
        assert!(ns.pop().is_err());
    }

    #[test]
    fn put_away_restore_balance() {
        let mut f = Function::new("main.main");
        f.add_stmts(&[Statement::Send { chan: "t0".to_owned() }]);
        f.put_away();
        assert!(f.is_empty());
        f.add_stmts(&[Statement::Tau]);
        let inner = f.restore().unwrap();
        assert_eq!(inner.len(), 1);
        assert!(f.restore().is_err());
    }

    #[test]
    fn add_function_is_idempotent() {
        let mut p = Program::new();
        let a = p.create_function("main.main");
        let b = p.create_function("main.main");
        p.add_function(a);
        p.add_function(b);
        p.add_function(a);
        assert_eq!(p.registered().count(), 1);
        assert_eq!(p.function_by_simple_name("main.main"), Some(a));
    }

    #[test]
    fn params_dedup_commutes() {
        let ps = [param(0, "t0"), param(1, "t1"), param(0, "t0")];
        let mut f1 = Function::new("f");
        f1.add_params(&ps);
        let mut f2 = Function::new("f");
        for p in ps.iter().rev() {
            f2.add_params(std::slice::from_ref(p));
        }
        assert_eq!(f1.params.len(), 2);
        assert_eq!(f2.params.len(), 2);
    }

    #[test]
    fn tau_collapse() {
        let mut f = Function::new("f");
        f.add_stmts(&[Statement::Tau]);
        assert_eq!(f.stmts.len(), 1);
        f.add_stmts(&[Statement::Tau]);
        assert_eq!(f.stmts.len(), 1);
        f.add_stmts(&[Statement::Send { chan: "t0".to_owned() }]);
        assert_eq!(f.stmts.len(), 1);
        assert!(!f.stmts[0].is_tau());
    }

    #[test]
    fn display_grammar() {
        let mut f = Function::new("main.main");
        f.add_params(&[param(0, "t0")]);
        f.add_stmts(&[
            Statement::NewChan { name: var(0, "t0"), chan: "ch0".to_owned(), size: 1 },
            Statement::If {
                then: vec![Statement::Tau],
                els: vec![Statement::Send { chan: "t0".to_owned() }],
            },
        ]);
        let out = f.to_string();
        assert_eq!(
            out,
            "def main.main(t0):\n    let t0 = newchan ch0, 1;\n    if tau; else send t0; endif;\n"
        );
    }

    #[test]
    fn display_select() {
        let cases: SelectCases = Rc::new(RefCell::new(vec![
            vec![Statement::Recv { chan: "ch".to_owned() }],
            vec![Statement::Tau],
        ]));
        let s = Statement::Select { cases };
        assert_eq!(s.to_string(), "select\n      case recv ch; \n      case tau; \n    endselect");
    }

    #[test]
    fn name_sanitisation() {
        assert_eq!(simple_name("(*main.T).Run"), "main.T.Run");
        assert_eq!(simple_name("golang.org/x/f"), "golang.org_x_f");
    }

    #[test]
    fn mark_comm_reaches_spawned() {
        let mut p = Program::new();
        let main = p.create_function("main.main");
        let work = p.create_function("main.work");
        p.add_function(main);
        p.add_function(work);
        p.func_mut(main).add_stmts(&[Statement::Spawn {
            name: "main.work".to_owned(),
            params: vec![],
        }]);
        p.func_mut(work).add_stmts(&[Statement::Send { chan: "ch".to_owned() }]);
        p.mark_comm();
        assert!(p.func(main).has_comm);
        assert!(p.func(work).has_comm);
    }
}
