//! Textual SSA frontend.
//!
//! The analysis consumes an SSA program from a provider; this module is the
//! build step behind the CLI: it reads a list of source files forming one
//! main package and parses them into an [`SsaProgram`].  The format is
//! line-oriented and mirrors the provider's data model one instruction per
//! line:
//!
//! ```text
//! package main
//!
//! global main.done chan int
//! type T struct{int}
//! method T Run main.T.Run
//!
//! func main.main() {
//! b0:
//!     t0 = makechan int, 1
//!     send t0, 1
//!     t1 = recv t0
//!     call close(t0)
//!     jump b1
//! b1 for.loop:
//!     return
//! }
//! ```
//!
//! Functions declared without a body (`func main.ext() chan int` with no
//! brace) model externals.  Free variables of closures are listed in square
//! brackets after the parameters.  Block successors come from the
//! terminators (`jump bN`, `if c goto bT else bF`, `return ...`);
//! predecessors are computed when the closing brace seals the function.
//! Register result types are inferred per instruction so the interpreter can
//! consult element and field structure exactly as the provider would surface
//! it.  Type declarations must precede the functions that use them.

use crate::errors::BuildError;
use crate::ssa::{
    BasicKind, BinOpKind, BlockData, CallCommon, ChanDir, ConstValue, FuncId, Instr, InstrKind,
    SelectState, SsaProgram, TypeData, TypeId, UnOpKind, ValueData, ValueId, ValueKind,
};
use fnv::FnvHashMap;
use log::debug;
use std::fs;
use std::path::Path;

const BUILTINS: &[&str] =
    &["close", "copy", "len", "cap", "append", "delete", "print", "println", "panic", "recover"];

/// Build configuration: the source files of one main package.
pub struct Config {
    files: Vec<(String, String)>,
}

impl Config {
    /// Reads the given files; I/O failures abort the build.
    pub fn new<P: AsRef<Path>>(paths: &[P]) -> Result<Config, BuildError> {
        let mut files = Vec::new();
        for p in paths {
            let name = p.as_ref().display().to_string();
            let text = fs::read_to_string(p.as_ref())
                .map_err(|err| BuildError::Io { path: name.clone(), err })?;
            files.push((name, text));
        }
        Ok(Config { files })
    }

    /// A configuration over in-memory sources.
    pub fn from_source(name: &str, text: &str) -> Config {
        Config { files: vec![(name.to_owned(), text.to_owned())] }
    }

    /// Parses the sources into one SSA program.
    pub fn build(self) -> Result<SsaProgram, BuildError> {
        let mut p = Parser::new();
        for (file, text) in &self.files {
            p.pass_decls(file, text)?;
        }
        p.resolve_methods()?;
        for (file, text) in &self.files {
            p.pass_bodies(file, text)?;
        }
        debug!("ssabuild: {} packages", p.prog.packages.len());
        Ok(p.prog)
    }
}

/// Convenience used by tests and tools: parse a single in-memory source.
pub fn parse_source(name: &str, text: &str) -> Result<SsaProgram, BuildError> {
    Config::from_source(name, text).build()
}

struct FuncSig {
    id: FuncId,
    params: Vec<(String, ValueId)>,
    frees: Vec<(String, ValueId)>,
}

struct Parser {
    prog: SsaProgram,
    named_types: FnvHashMap<String, TypeId>,
    globals: FnvHashMap<String, ValueId>,
    func_values: FnvHashMap<String, ValueId>,
    builtins: FnvHashMap<String, ValueId>,
    sigs: FnvHashMap<String, FuncSig>,
    raw_methods: Vec<(String, String, String)>,
    method_results: FnvHashMap<String, Vec<TypeId>>,
}

impl Parser {
    fn new() -> Parser {
        Parser {
            prog: SsaProgram::new(),
            named_types: FnvHashMap::default(),
            globals: FnvHashMap::default(),
            func_values: FnvHashMap::default(),
            builtins: FnvHashMap::default(),
            sigs: FnvHashMap::default(),
            raw_methods: Vec::new(),
            method_results: FnvHashMap::default(),
        }
    }

    fn err(file: &str, line: u32, msg: impl Into<String>) -> BuildError {
        BuildError::Parse { file: file.to_owned(), line, msg: msg.into() }
    }

    fn package_index(&mut self, name: &str) -> usize {
        if let Some(i) = self.prog.packages.iter().position(|p| p.name == name) {
            return i;
        }
        self.prog.packages.push(crate::ssa::Package {
            name: name.to_owned(),
            globals: Vec::new(),
            funcs: Vec::new(),
        });
        self.prog.packages.len() - 1
    }

    /// First pass: packages, globals, type and method declarations, function
    /// signatures.  Body lines are ignored here.
    fn pass_decls(&mut self, file: &str, text: &str) -> Result<(), BuildError> {
        let mut pkg = self.package_index("main");
        for (n, raw) in text.lines().enumerate() {
            let lineno = n as u32 + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            let mut cur = Cursor::new(line);
            let word = cur.ident();
            match word {
                "package" => {
                    let name = cur.ident().to_owned();
                    pkg = self.package_index(&name);
                }
                "global" => {
                    let name = cur.ident().to_owned();
                    let t = self
                        .parse_type(&mut cur)
                        .map_err(|m| Parser::err(file, lineno, m))?;
                    let ptr = self.prog.intern_type(TypeData::Pointer { elem: t });
                    let v = self.prog.add_value(ValueData {
                        name: name.clone(),
                        ty: ptr,
                        kind: ValueKind::Global,
                    });
                    self.globals.insert(name, v);
                    self.prog.packages[pkg].globals.push(v);
                }
                "type" => {
                    let name = cur.ident().to_owned();
                    let under = self
                        .parse_type(&mut cur)
                        .map_err(|m| Parser::err(file, lineno, m))?;
                    let id = self
                        .prog
                        .intern_type(TypeData::Named { name: name.clone(), underlying: under });
                    self.named_types.insert(name, id);
                }
                "method" => {
                    let t = cur.ident().to_owned();
                    let m = cur.ident().to_owned();
                    let f = cur.ident().to_owned();
                    self.raw_methods.push((t, m, f));
                }
                "func" => {
                    self.parse_func_header(file, lineno, &mut cur, pkg)?;
                }
                _ => {} // body line, handled in the second pass
            }
        }
        Ok(())
    }

    fn parse_func_header(
        &mut self,
        file: &str,
        lineno: u32,
        cur: &mut Cursor,
        pkg: usize,
    ) -> Result<(), BuildError> {
        let name = cur.ident().to_owned();
        if name.is_empty() {
            return Err(Parser::err(file, lineno, "func: missing name"));
        }
        let pos = self.prog.add_pos(file, lineno);
        let id = self.prog.add_func(&name, pos);
        let mut params = Vec::new();
        let mut frees = Vec::new();
        if !cur.eat('(') {
            return Err(Parser::err(file, lineno, "func: expected '('"));
        }
        while !cur.eat(')') {
            let pname = cur.ident().to_owned();
            if pname.is_empty() {
                return Err(Parser::err(file, lineno, "func: bad parameter"));
            }
            let t = self.parse_type(cur).map_err(|m| Parser::err(file, lineno, m))?;
            let v = self.prog.add_value(ValueData {
                name: pname.clone(),
                ty: t,
                kind: ValueKind::Param,
            });
            params.push((pname, v));
            cur.eat(',');
        }
        if cur.eat('[') {
            while !cur.eat(']') {
                let fname = cur.ident().to_owned();
                let t = self.parse_type(cur).map_err(|m| Parser::err(file, lineno, m))?;
                let v = self.prog.add_value(ValueData {
                    name: fname.clone(),
                    ty: t,
                    kind: ValueKind::FreeVar,
                });
                frees.push((fname, v));
                cur.eat(',');
            }
        }
        let mut results = Vec::new();
        let paren = cur.eat('(');
        loop {
            cur.skip_ws();
            match cur.peek() {
                None | Some('{') => break,
                Some(')') if paren => {
                    cur.bump();
                    break;
                }
                Some(',') => {
                    cur.bump();
                }
                _ => {
                    let t = self.parse_type(cur).map_err(|m| Parser::err(file, lineno, m))?;
                    results.push(t);
                }
            }
        }
        {
            let f = self.prog.func_mut(id);
            f.params = params.iter().map(|(_, v)| *v).collect();
            f.free_vars = frees.iter().map(|(_, v)| *v).collect();
            f.results = results.clone();
        }
        let fty = self.prog.intern_type(TypeData::Func { params: Vec::new(), results });
        let fv = self.prog.add_value(ValueData {
            name: name.clone(),
            ty: fty,
            kind: ValueKind::Function(id),
        });
        self.func_values.insert(name.clone(), fv);
        self.prog.packages[pkg].funcs.push(id);
        self.sigs.insert(name, FuncSig { id, params, frees });
        Ok(())
    }

    fn resolve_methods(&mut self) -> Result<(), BuildError> {
        for (t, m, f) in self.raw_methods.clone() {
            let ty = match self.named_types.get(&t) {
                Some(&ty) => ty,
                None => return Err(Parser::err("-", 0, format!("method on unknown type {}", t))),
            };
            let fid = match self.sigs.get(&f) {
                Some(sig) => sig.id,
                None => return Err(Parser::err("-", 0, format!("method {} of unknown func {}", m, f))),
            };
            self.prog.register_method(ty, &m, fid);
            self.method_results.insert(m.clone(), self.prog.func(fid).results.clone());
        }
        Ok(())
    }

    /// Second pass: function bodies.
    fn pass_bodies(&mut self, file: &str, text: &str) -> Result<(), BuildError> {
        let mut scope: FnvHashMap<String, ValueId> = FnvHashMap::default();
        let mut current: Option<FuncId> = None;
        let mut block: usize = 0;
        for (n, raw) in text.lines().enumerate() {
            let lineno = n as u32 + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if current.is_none() {
                if line.starts_with("func ") && line.ends_with('{') {
                    let mut cur = Cursor::new(&line[5..]);
                    let name = cur.ident().to_owned();
                    let sig = match self.sigs.get(&name) {
                        Some(s) => s,
                        None => return Err(Parser::err(file, lineno, "undeclared function")),
                    };
                    scope.clear();
                    for (pname, v) in &sig.params {
                        scope.insert(pname.clone(), *v);
                    }
                    for (fname, v) in &sig.frees {
                        scope.insert(fname.clone(), *v);
                    }
                    current = Some(sig.id);
                    block = 0;
                }
                continue;
            }
            let func = current.unwrap();
            if line == "}" {
                self.prog.seal_func(func);
                current = None;
                continue;
            }
            if let Some(hdr) = block_header(line) {
                let (idx, comment) = hdr;
                let blocks = &mut self.prog.func_mut(func).blocks;
                while blocks.len() <= idx {
                    blocks.push(BlockData::default());
                }
                blocks[idx].comment = comment;
                block = idx;
                continue;
            }
            let pos = self.prog.add_pos(file, lineno);
            let mut cur = Cursor::new(line);
            let (kind, succs) = self
                .parse_instr(&mut cur, &mut scope)
                .map_err(|m| Parser::err(file, lineno, m))?;
            let blocks = &mut self.prog.func_mut(func).blocks;
            while blocks.len() <= block {
                blocks.push(BlockData::default());
            }
            if let Some(s) = succs {
                blocks[block].succs = s;
            }
            blocks[block].instrs.push(Instr { kind, pos });
        }
        Ok(())
    }

    /// Parses one instruction; returns the kind and, for terminators, the
    /// successor list of the enclosing block.
    fn parse_instr(
        &mut self,
        cur: &mut Cursor,
        scope: &mut FnvHashMap<String, ValueId>,
    ) -> Result<(InstrKind, Option<Vec<usize>>), String> {
        let first = cur.ident().to_owned();
        if cur.eat('=') {
            let (kind, _ty) = self.parse_assign(cur, scope, &first)?;
            return Ok((kind, None));
        }
        match first.as_str() {
            "call" | "invoke" => {
                let call = self.parse_call(cur, scope, first == "invoke")?;
                Ok((InstrKind::Call { result: None, call }, None))
            }
            "defer" => {
                let call = self.parse_call(cur, scope, false)?;
                Ok((InstrKind::Defer { call }, None))
            }
            "go" => {
                let call = self.parse_call(cur, scope, false)?;
                Ok((InstrKind::Go { call }, None))
            }
            "send" => {
                let chan = self.operand(cur, scope)?;
                cur.eat(',');
                let value = self.operand(cur, scope)?;
                Ok((InstrKind::Send { chan, value }, None))
            }
            "store" => {
                let addr = self.operand(cur, scope)?;
                cur.eat(',');
                let value = self.operand(cur, scope)?;
                Ok((InstrKind::Store { addr, value }, None))
            }
            "mapupdate" => {
                let map = self.operand(cur, scope)?;
                cur.eat(',');
                let key = self.operand(cur, scope)?;
                cur.eat(',');
                let value = self.operand(cur, scope)?;
                Ok((InstrKind::MapUpdate { map, key, value }, None))
            }
            "debugref" => {
                let x = self.operand(cur, scope)?;
                Ok((InstrKind::DebugRef { x }, None))
            }
            "rundefers" => Ok((InstrKind::RunDefers, None)),
            "jump" => {
                let b = block_ref(cur)?;
                Ok((InstrKind::Jump, Some(vec![b])))
            }
            "if" => {
                let cond = self.operand(cur, scope)?;
                if cur.ident() != "goto" {
                    return Err("if: expected 'goto'".to_owned());
                }
                let t = block_ref(cur)?;
                if cur.ident() != "else" {
                    return Err("if: expected 'else'".to_owned());
                }
                let e = block_ref(cur)?;
                Ok((InstrKind::If { cond }, Some(vec![t, e])))
            }
            "return" => {
                let mut results = Vec::new();
                loop {
                    cur.skip_ws();
                    if cur.peek().is_none() {
                        break;
                    }
                    results.push(self.operand(cur, scope)?);
                    cur.eat(',');
                }
                Ok((InstrKind::Return { results }, None))
            }
            other => Err(format!("unknown instruction '{}'", other)),
        }
    }

    /// Parses the right-hand side of `name = op ...`, creating the result
    /// register with its inferred type.
    fn parse_assign(
        &mut self,
        cur: &mut Cursor,
        scope: &mut FnvHashMap<String, ValueId>,
        name: &str,
    ) -> Result<(InstrKind, TypeId), String> {
        let op = cur.ident().to_owned();
        let int = self.prog.basic(BasicKind::Int);
        let boolean = self.prog.basic(BasicKind::Bool);
        let (kind, ty) = match op.as_str() {
            "alloc" => {
                let heap = cur.eat_word("heap");
                let t = self.parse_type(cur)?;
                let ptr = self.prog.intern_type(TypeData::Pointer { elem: t });
                let result = self.define(scope, name, ptr);
                (InstrKind::Alloc { result, heap }, ptr)
            }
            "binop" => {
                let opname = cur.ident().to_owned();
                let bop = binop_kind(&opname)?;
                let x = self.operand(cur, scope)?;
                cur.eat(',');
                let y = self.operand(cur, scope)?;
                let ty = if bop.is_comparison() { boolean } else { self.prog.value(x).ty };
                let result = self.define(scope, name, ty);
                (InstrKind::BinOp { result, op: bop, x, y }, ty)
            }
            "call" | "invoke" => {
                let call = self.parse_call(cur, scope, op == "invoke")?;
                let ty = self.call_result_type(&call);
                let result = self.define(scope, name, ty);
                (InstrKind::Call { result: Some(result), call }, ty)
            }
            "changetype" | "changeiface" | "convert" | "slice" => {
                let x = self.operand(cur, scope)?;
                let ty = self.prog.value(x).ty;
                let result = self.define(scope, name, ty);
                let kind = match op.as_str() {
                    "changetype" => InstrKind::ChangeType { result, x },
                    "changeiface" => InstrKind::ChangeInterface { result, x },
                    "convert" => InstrKind::Convert { result, x },
                    _ => InstrKind::Slice { result, x },
                };
                (kind, ty)
            }
            "makeiface" => {
                // `makeiface x, I` gives the result the interface type.
                let x = self.operand(cur, scope)?;
                let ty = if cur.eat(',') { self.parse_type(cur)? } else { self.prog.value(x).ty };
                let result = self.define(scope, name, ty);
                (InstrKind::MakeInterface { result, x }, ty)
            }
            "extract" => {
                let x = self.operand(cur, scope)?;
                cur.eat(',');
                let idx = cur.int()? as usize;
                let ty = self
                    .prog
                    .tuple_elems(self.prog.value(x).ty)
                    .and_then(|e| e.get(idx).copied())
                    .unwrap_or(int);
                let result = self.define(scope, name, ty);
                (InstrKind::Extract { result, tuple: x, index: idx }, ty)
            }
            "field" | "fieldaddr" => {
                let x = self.operand(cur, scope)?;
                cur.eat(',');
                let idx = cur.int()? as usize;
                let base = if op == "fieldaddr" {
                    self.prog.deref(self.prog.value(x).ty)
                } else {
                    self.prog.value(x).ty
                };
                let fty = self
                    .prog
                    .struct_fields(base)
                    .and_then(|fs| fs.get(idx).copied())
                    .unwrap_or(int);
                let ty = if op == "fieldaddr" {
                    self.prog.intern_type(TypeData::Pointer { elem: fty })
                } else {
                    fty
                };
                let result = self.define(scope, name, ty);
                let kind = if op == "fieldaddr" {
                    InstrKind::FieldAddr { result, x, field: idx }
                } else {
                    InstrKind::Field { result, x, field: idx }
                };
                (kind, ty)
            }
            "index" | "indexaddr" => {
                let x = self.operand(cur, scope)?;
                cur.eat(',');
                let k = self.operand(cur, scope)?;
                let base = if op == "indexaddr" {
                    self.prog.deref(self.prog.value(x).ty)
                } else {
                    self.prog.value(x).ty
                };
                let elem = match self.prog.ty(self.prog.underlying(base)) {
                    TypeData::Array { elem, .. } | TypeData::Slice { elem } => *elem,
                    _ => int,
                };
                let ty = if op == "indexaddr" {
                    self.prog.intern_type(TypeData::Pointer { elem })
                } else {
                    elem
                };
                let result = self.define(scope, name, ty);
                let kind = if op == "indexaddr" {
                    InstrKind::IndexAddr { result, x, index: k }
                } else {
                    InstrKind::Index { result, x, index: k }
                };
                (kind, ty)
            }
            "lookup" => {
                let x = self.operand(cur, scope)?;
                cur.eat(',');
                let k = self.operand(cur, scope)?;
                let comma_ok = cur.eat_word("ok");
                let vty = match self.prog.ty(self.prog.underlying(self.prog.value(x).ty)) {
                    TypeData::Map { value, .. } => *value,
                    _ => int,
                };
                let ty = if comma_ok {
                    self.prog.intern_type(TypeData::Tuple { elems: vec![vty, boolean] })
                } else {
                    vty
                };
                let result = self.define(scope, name, ty);
                (InstrKind::Lookup { result, x, index: k, comma_ok }, ty)
            }
            "makechan" => {
                let elem = self.parse_type(cur)?;
                cur.eat(',');
                let size = self.operand(cur, scope)?;
                let ty = self.prog.intern_type(TypeData::Chan { elem });
                let result = self.define(scope, name, ty);
                (InstrKind::MakeChan { result, size }, ty)
            }
            "makeclosure" => {
                let fname = cur.ident().to_owned();
                let sig = self.sigs.get(&fname).ok_or("makeclosure: unknown function")?;
                let fid = sig.id;
                let mut bindings = Vec::new();
                if cur.eat('[') {
                    while !cur.eat(']') {
                        bindings.push(self.operand(cur, scope)?);
                        cur.eat(',');
                    }
                }
                let results = self.prog.func(fid).results.clone();
                let ty = self.prog.intern_type(TypeData::Func { params: Vec::new(), results });
                let result = self.define(scope, name, ty);
                (InstrKind::MakeClosure { result, func: fid, bindings }, ty)
            }
            "makemap" => {
                let ty = self.parse_type(cur)?;
                let result = self.define(scope, name, ty);
                (InstrKind::MakeMap { result }, ty)
            }
            "makeslice" => {
                let ty = self.parse_type(cur)?;
                let result = self.define(scope, name, ty);
                (InstrKind::MakeSlice { result }, ty)
            }
            "next" => {
                let x = self.operand(cur, scope)?;
                let (k, v) = match self.prog.ty(self.prog.underlying(self.prog.value(x).ty)) {
                    TypeData::Map { key, value } => (*key, *value),
                    _ => (int, int),
                };
                let ty = self.prog.intern_type(TypeData::Tuple { elems: vec![boolean, k, v] });
                let result = self.define(scope, name, ty);
                (InstrKind::Next { result, iter: x }, ty)
            }
            "phi" => {
                if !cur.eat('[') {
                    return Err("phi: expected '['".to_owned());
                }
                let mut edges = Vec::new();
                while !cur.eat(']') {
                    edges.push(self.operand(cur, scope)?);
                    cur.eat(',');
                }
                let ty = edges.first().map(|&e| self.prog.value(e).ty).unwrap_or(int);
                let result = self.define(scope, name, ty);
                (InstrKind::Phi { result, edges }, ty)
            }
            "recv" => {
                let x = self.operand(cur, scope)?;
                let comma_ok = cur.eat_word("ok");
                let elem = self.prog.chan_elem(self.prog.value(x).ty).unwrap_or(int);
                let ty = if comma_ok {
                    self.prog.intern_type(TypeData::Tuple { elems: vec![elem, boolean] })
                } else {
                    elem
                };
                let result = self.define(scope, name, ty);
                (InstrKind::UnOp { result, op: UnOpKind::Recv, x, comma_ok }, ty)
            }
            "deref" => {
                let x = self.operand(cur, scope)?;
                let ty = self.prog.deref(self.prog.value(x).ty);
                let result = self.define(scope, name, ty);
                (InstrKind::UnOp { result, op: UnOpKind::Deref, x, comma_ok: false }, ty)
            }
            "select" => {
                let blocking = match cur.ident() {
                    "blocking" => true,
                    "nonblocking" => false,
                    _ => return Err("select: expected blocking/nonblocking".to_owned()),
                };
                if !cur.eat('[') {
                    return Err("select: expected '['".to_owned());
                }
                let mut states = Vec::new();
                let mut elems = vec![int, boolean];
                while !cur.eat(']') {
                    let dir = match cur.ident() {
                        "send" => ChanDir::Send,
                        "recv" => ChanDir::Recv,
                        _ => return Err("select: expected send/recv".to_owned()),
                    };
                    let chan = self.operand(cur, scope)?;
                    if dir == ChanDir::Recv {
                        elems.push(self.prog.chan_elem(self.prog.value(chan).ty).unwrap_or(int));
                    }
                    states.push(SelectState { chan, dir });
                    cur.eat(',');
                }
                let ty = self.prog.intern_type(TypeData::Tuple { elems });
                let result = self.define(scope, name, ty);
                (InstrKind::Select { result, states, blocking }, ty)
            }
            "typeassert" => {
                let x = self.operand(cur, scope)?;
                cur.eat(',');
                let asserted = self.parse_type(cur)?;
                let comma_ok = cur.eat_word("ok");
                let ty = if comma_ok {
                    self.prog.intern_type(TypeData::Tuple { elems: vec![asserted, boolean] })
                } else {
                    asserted
                };
                let result = self.define(scope, name, ty);
                (InstrKind::TypeAssert { result, x, asserted, comma_ok }, ty)
            }
            other => return Err(format!("unknown instruction '{}'", other)),
        };
        Ok((kind, ty))
    }

    /// Creates (or completes a forward-referenced placeholder of) a result
    /// register.
    fn define(&mut self, scope: &mut FnvHashMap<String, ValueId>, name: &str, ty: TypeId) -> ValueId {
        if let Some(&v) = scope.get(name) {
            self.prog.value_mut(v).ty = ty;
            return v;
        }
        let v = self.prog.add_value(ValueData {
            name: name.to_owned(),
            ty,
            kind: ValueKind::Register,
        });
        scope.insert(name.to_owned(), v);
        v
    }

    fn call_result_type(&mut self, call: &CallCommon) -> TypeId {
        let int = self.prog.basic(BasicKind::Int);
        if let Some(m) = &call.method {
            let results = self.method_results.get(m).cloned().unwrap_or_default();
            return match results.len() {
                0 => int,
                1 => results[0],
                _ => self.prog.intern_type(TypeData::Tuple { elems: results }),
            };
        }
        let results = match &self.prog.value(call.value).kind {
            ValueKind::Function(fid) => self.prog.func(*fid).results.clone(),
            _ => match self.prog.ty(self.prog.value(call.value).ty) {
                TypeData::Func { results, .. } => results.clone(),
                _ => Vec::new(),
            },
        };
        match results.len() {
            0 => int,
            1 => results[0],
            _ => self.prog.intern_type(TypeData::Tuple { elems: results }),
        }
    }

    /// `callee(args)` or, for invoke, `recv Method(args)`.
    fn parse_call(
        &mut self,
        cur: &mut Cursor,
        scope: &mut FnvHashMap<String, ValueId>,
        invoke: bool,
    ) -> Result<CallCommon, String> {
        let (value, method) = if invoke {
            let recv = self.operand(cur, scope)?;
            let m = cur.ident().to_owned();
            (recv, Some(m))
        } else {
            (self.operand(cur, scope)?, None)
        };
        if !cur.eat('(') {
            return Err("call: expected '('".to_owned());
        }
        let mut args = Vec::new();
        while !cur.eat(')') {
            args.push(self.operand(cur, scope)?);
            cur.eat(',');
        }
        Ok(CallCommon { value, method, args })
    }

    /// An operand: literal, register, parameter, global, function or builtin.
    /// Unknown register-looking names become placeholders so phis can refer
    /// forward.
    fn operand(
        &mut self,
        cur: &mut Cursor,
        scope: &mut FnvHashMap<String, ValueId>,
    ) -> Result<ValueId, String> {
        cur.skip_ws();
        match cur.peek() {
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let i = cur.int()?;
                let int = self.prog.basic(BasicKind::Int);
                Ok(self.prog.add_value(ValueData {
                    name: i.to_string(),
                    ty: int,
                    kind: ValueKind::Const(ConstValue::Int(i)),
                }))
            }
            Some('"') => {
                let s = cur.string_lit()?;
                let st = self.prog.basic(BasicKind::Str);
                Ok(self.prog.add_value(ValueData {
                    name: format!("{:?}", s),
                    ty: st,
                    kind: ValueKind::Const(ConstValue::Str(s)),
                }))
            }
            _ => {
                let word = cur.ident().to_owned();
                if word.is_empty() {
                    return Err("expected operand".to_owned());
                }
                match word.as_str() {
                    "true" | "false" => {
                        let b = self.prog.basic(BasicKind::Bool);
                        return Ok(self.prog.add_value(ValueData {
                            name: word.clone(),
                            ty: b,
                            kind: ValueKind::Const(ConstValue::Bool(word == "true")),
                        }));
                    }
                    "nil" => {
                        let t = self.prog.basic(BasicKind::UntypedNil);
                        return Ok(self.prog.add_value(ValueData {
                            name: word,
                            ty: t,
                            kind: ValueKind::Const(ConstValue::Nil),
                        }));
                    }
                    _ => {}
                }
                if let Some(&v) = scope.get(&word) {
                    return Ok(v);
                }
                if let Some(&v) = self.globals.get(&word) {
                    return Ok(v);
                }
                if let Some(&v) = self.func_values.get(&word) {
                    return Ok(v);
                }
                if BUILTINS.contains(&word.as_str()) {
                    if let Some(&v) = self.builtins.get(&word) {
                        return Ok(v);
                    }
                    let int = self.prog.basic(BasicKind::Int);
                    let v = self.prog.add_value(ValueData {
                        name: word.clone(),
                        ty: int,
                        kind: ValueKind::Builtin(word.clone()),
                    });
                    self.builtins.insert(word, v);
                    return Ok(v);
                }
                // Forward reference to a register defined later in the body.
                let int = self.prog.basic(BasicKind::Int);
                let v = self.prog.add_value(ValueData {
                    name: word.clone(),
                    ty: int,
                    kind: ValueKind::Register,
                });
                scope.insert(word, v);
                Ok(v)
            }
        }
    }

    fn parse_type(&mut self, cur: &mut Cursor) -> Result<TypeId, String> {
        cur.skip_ws();
        if cur.eat_str("chan ") {
            let elem = self.parse_type(cur)?;
            return Ok(self.prog.intern_type(TypeData::Chan { elem }));
        }
        if cur.eat('*') {
            let elem = self.parse_type(cur)?;
            return Ok(self.prog.intern_type(TypeData::Pointer { elem }));
        }
        if cur.eat_str("map[") {
            let key = self.parse_type(cur)?;
            if !cur.eat(']') {
                return Err("map: expected ']'".to_owned());
            }
            let value = self.parse_type(cur)?;
            return Ok(self.prog.intern_type(TypeData::Map { key, value }));
        }
        if cur.eat_str("struct{") {
            let mut fields = Vec::new();
            loop {
                cur.skip_ws();
                if cur.eat('}') {
                    break;
                }
                fields.push(self.parse_type(cur)?);
                cur.eat(',');
            }
            return Ok(self.prog.intern_type(TypeData::Struct { fields }));
        }
        if cur.eat_str("iface{") {
            let mut methods = Vec::new();
            loop {
                cur.skip_ws();
                if cur.eat('}') {
                    break;
                }
                methods.push(cur.ident().to_owned());
                cur.eat(',');
            }
            return Ok(self.prog.intern_type(TypeData::Interface { methods }));
        }
        if cur.eat('[') {
            if cur.eat(']') {
                let elem = self.parse_type(cur)?;
                return Ok(self.prog.intern_type(TypeData::Slice { elem }));
            }
            let len = cur.int()? as usize;
            if !cur.eat(']') {
                return Err("array: expected ']'".to_owned());
            }
            let elem = self.parse_type(cur)?;
            return Ok(self.prog.intern_type(TypeData::Array { elem, len }));
        }
        let word = cur.ident().to_owned();
        match word.as_str() {
            "int" => Ok(self.prog.basic(BasicKind::Int)),
            "bool" => Ok(self.prog.basic(BasicKind::Bool)),
            "byte" => Ok(self.prog.basic(BasicKind::Byte)),
            "string" => Ok(self.prog.basic(BasicKind::Str)),
            "" => Err("expected type".to_owned()),
            _ => self
                .named_types
                .get(&word)
                .copied()
                .ok_or_else(|| format!("unknown type '{}'", word)),
        }
    }
}

fn binop_kind(name: &str) -> Result<BinOpKind, String> {
    Ok(match name {
        "add" => BinOpKind::Add,
        "sub" => BinOpKind::Sub,
        "mul" => BinOpKind::Mul,
        "div" => BinOpKind::Div,
        "rem" => BinOpKind::Rem,
        "lss" => BinOpKind::Lss,
        "leq" => BinOpKind::Leq,
        "gtr" => BinOpKind::Gtr,
        "geq" => BinOpKind::Geq,
        "eql" => BinOpKind::Eql,
        "neq" => BinOpKind::Neq,
        _ => return Err(format!("unknown binop '{}'", name)),
    })
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

/// `bN:` or `bN comment:`
fn block_header(line: &str) -> Option<(usize, String)> {
    let body = line.strip_suffix(':')?;
    let mut parts = body.split_whitespace();
    let label = parts.next()?;
    let idx: usize = label.strip_prefix('b')?.parse().ok()?;
    let comment = parts.next().unwrap_or("").to_owned();
    Some((idx, comment))
}

fn block_ref(cur: &mut Cursor) -> Result<usize, String> {
    let word = cur.ident();
    word.strip_prefix('b')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| format!("expected block label, got '{}'", word))
}

/// A byte cursor over one source line.
struct Cursor<'l> {
    s: &'l str,
    pos: usize,
}

impl<'l> Cursor<'l> {
    fn new(s: &'l str) -> Cursor<'l> {
        Cursor { s, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.s.len() && self.s.as_bytes()[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.s[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if self.pos < self.s.len() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, pat: &str) -> bool {
        self.skip_ws();
        if self.s[self.pos..].starts_with(pat) {
            self.pos += pat.len();
            true
        } else {
            false
        }
    }

    /// Consumes an identifier-like word; returns "" at a non-ident position.
    fn ident(&mut self) -> &'l str {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.s.len() {
            let b = self.s.as_bytes()[self.pos];
            if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'$' | b'#' | b'/') {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.s[start..self.pos]
    }

    /// Consumes a word only if it matches exactly.
    fn eat_word(&mut self, word: &str) -> bool {
        self.skip_ws();
        let save = self.pos;
        if self.ident() == word {
            true
        } else {
            self.pos = save;
            false
        }
    }

    fn int(&mut self) -> Result<i64, String> {
        self.skip_ws();
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while self.pos < self.s.len() && self.s.as_bytes()[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        self.s[start..self.pos].parse().map_err(|_| "expected integer".to_owned())
    }

    fn string_lit(&mut self) -> Result<String, String> {
        self.skip_ws();
        if !self.eat('"') {
            return Err("expected string".to_owned());
        }
        let start = self.pos;
        while self.pos < self.s.len() && self.s.as_bytes()[self.pos] != b'"' {
            self.pos += 1;
        }
        let out = self.s[start..self.pos].to_owned();
        self.bump(); // closing quote
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::TypeData;

    #[test]
    fn parses_a_minimal_program() {
        let prog = parse_source(
            "min.ssa",
            r#"
package main

func main.main() {
b0:
    t0 = makechan int, 1
    send t0, 1
    t1 = recv t0
    return
}
"#,
        )
        .unwrap();
        let main = prog.func_by_name("main.main").unwrap();
        let f = prog.func(main);
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.blocks[0].instrs.len(), 4);
        match &f.blocks[0].instrs[0].kind {
            InstrKind::MakeChan { result, .. } => {
                assert!(prog.is_chan(prog.value(*result).ty));
            }
            other => panic!("expected makechan, got {}", other.tag()),
        }
        match &f.blocks[0].instrs[2].kind {
            InstrKind::UnOp { result, op: UnOpKind::Recv, .. } => {
                assert!(matches!(prog.ty(prog.value(*result).ty), TypeData::Basic(_)));
            }
            other => panic!("expected recv, got {}", other.tag()),
        }
    }

    #[test]
    fn terminators_shape_the_graph() {
        let prog = parse_source(
            "cfg.ssa",
            r#"
package main

func main.main() {
b0:
    jump b1
b1 for.loop:
    t0 = phi [0, t2]
    t1 = binop lss t0, 2
    if t1 goto b2 else b3
b2 for.body:
    t2 = binop add t0, 1
    jump b1
b3 for.done:
    return
}
"#,
        )
        .unwrap();
        let f = prog.func(prog.func_by_name("main.main").unwrap());
        assert_eq!(f.blocks[0].succs, vec![1]);
        assert_eq!(f.blocks[1].succs, vec![2, 3]);
        assert_eq!(f.blocks[1].preds, vec![0, 2]);
        assert_eq!(f.blocks[1].comment, "for.loop");
        assert_eq!(f.blocks[3].comment, "for.done");
    }

    #[test]
    fn bodyless_functions_are_external() {
        let prog = parse_source(
            "ext.ssa",
            r#"
package main

func main.mkchan() chan int

func main.main() {
b0:
    t0 = call main.mkchan()
    return
}
"#,
        )
        .unwrap();
        let ext = prog.func(prog.func_by_name("main.mkchan").unwrap());
        assert!(!ext.has_body());
        assert_eq!(ext.results.len(), 1);
        assert!(prog.is_chan(ext.results[0]));
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let err = parse_source("bad.ssa", "package main\nglobal main.x wibble\n").unwrap_err();
        assert!(err.to_string().contains("unknown type"));
    }

    #[test]
    fn types_nest() {
        let prog = parse_source(
            "ty.ssa",
            r#"
package main
global main.g [2]chan int
global main.m map[int]chan int
"#,
        )
        .unwrap();
        let g = prog.packages[0].globals[0];
        let t = prog.deref(prog.value(g).ty);
        assert_eq!(prog.array_len(t), Some(2));
        let m = prog.packages[0].globals[1];
        let mt = prog.deref(prog.value(m).ty);
        assert!(matches!(prog.ty(prog.underlying(mt)), TypeData::Map { .. }));
    }
}
