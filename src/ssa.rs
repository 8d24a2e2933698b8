//! In-memory SSA program representation consumed by the analysis.
//!
//! The analyzer does not build SSA itself; it walks a program supplied by a
//! frontend (see `ssabuild`).  The representation here is deliberately
//! arena-flavoured: functions, values, types and source positions live in
//! vectors owned by [`SsaProgram`] and are referred to by small copyable
//! handles.  Aggregate tables elsewhere in the analyzer store these handles
//! rather than references, which keeps the mutable symbolic store free of
//! ownership cycles.
//!
//! Only the structure the interpreter consults is modelled: packages with
//! global members, functions with ordered parameters, free variables and
//! basic blocks, per-block instruction and successor lists, and types that
//! surface element/field/channel/pointer shape plus a `byte` basic kind.

use fnv::FnvHashMap;
use std::fmt;

/// Handle of a function in a program.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FuncId(pub u32);

/// Handle of an SSA value (register, parameter, global, constant, ...).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ValueId(pub u32);

/// Handle of an interned type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeId(pub u32);

/// Handle of a source position; decode with [`SsaProgram::decode_pos`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Pos(pub u32);

impl Pos {
    /// Position of values with no originating source location.
    pub const NONE: Pos = Pos(u32::MAX);
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Basic (non-composite) type kinds the analysis distinguishes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BasicKind {
    Bool,
    Int,
    Byte,
    Str,
    /// The type of an untyped `nil` literal.
    UntypedNil,
}

/// Structural type information.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeData {
    Basic(BasicKind),
    Chan { elem: TypeId },
    Pointer { elem: TypeId },
    Array { elem: TypeId, len: usize },
    Slice { elem: TypeId },
    Map { key: TypeId, value: TypeId },
    Struct { fields: Vec<TypeId> },
    Interface { methods: Vec<String> },
    Named { name: String, underlying: TypeId },
    Tuple { elems: Vec<TypeId> },
    Func { params: Vec<TypeId>, results: Vec<TypeId> },
}

/// What an SSA value is, beyond its type.
#[derive(Clone, PartialEq, Debug)]
pub enum ValueKind {
    /// An instruction result register.
    Register,
    /// A function parameter.
    Param,
    /// A free variable of a closure.
    FreeVar,
    /// A package-level variable; the value denotes its address.
    Global,
    /// A literal constant.
    Const(ConstValue),
    /// A function used as a value (call targets, closures).
    Function(FuncId),
    /// A built-in function such as `close` or `copy`.
    Builtin(String),
}

/// Constant payloads.
#[derive(Clone, PartialEq, Debug)]
pub enum ConstValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Nil,
}

/// An SSA value: name, type and kind.
#[derive(Clone, Debug)]
pub struct ValueData {
    pub name: String,
    pub ty: TypeId,
    pub kind: ValueKind,
}

/// Channel endpoint direction in a select state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChanDir {
    Send,
    Recv,
}

/// One communication alternative of a `select`.
#[derive(Clone, Debug)]
pub struct SelectState {
    pub chan: ValueId,
    pub dir: ChanDir,
}

/// The callee/argument bundle shared by `Call`, `Defer` and `Go`.
#[derive(Clone, Debug)]
pub struct CallCommon {
    /// Callee value: a `Function`, a `Builtin`, a closure register, or the
    /// receiver when `method` is set.
    pub value: ValueId,
    /// Interface method name for dynamic dispatch; `None` for ordinary calls.
    pub method: Option<String>,
    pub args: Vec<ValueId>,
}

impl CallCommon {
    /// The statically known callee function, if any.
    pub fn static_callee(&self, prog: &SsaProgram) -> Option<FuncId> {
        match prog.value(self.value).kind {
            ValueKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_invoke(&self) -> bool {
        self.method.is_some()
    }
}

/// Binary operators; only the comparison subset matters to loop detection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lss,
    Leq,
    Gtr,
    Geq,
    Eql,
    Neq,
}

impl BinOpKind {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOpKind::Lss
                | BinOpKind::Leq
                | BinOpKind::Gtr
                | BinOpKind::Geq
                | BinOpKind::Eql
                | BinOpKind::Neq
        )
    }
}

/// Unary operators the interpreter distinguishes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnOpKind {
    /// Channel receive (`<-ch`).
    Recv,
    /// Pointer dereference (`*p`).
    Deref,
    /// Anything else (negation etc.); skipped by the analysis.
    Other,
}

/// The instruction variants of the SSA provider.
#[derive(Clone, Debug)]
pub enum InstrKind {
    Alloc { result: ValueId, heap: bool },
    BinOp { result: ValueId, op: BinOpKind, x: ValueId, y: ValueId },
    Call { result: Option<ValueId>, call: CallCommon },
    ChangeInterface { result: ValueId, x: ValueId },
    ChangeType { result: ValueId, x: ValueId },
    Convert { result: ValueId, x: ValueId },
    DebugRef { x: ValueId },
    Defer { call: CallCommon },
    Extract { result: ValueId, tuple: ValueId, index: usize },
    Field { result: ValueId, x: ValueId, field: usize },
    FieldAddr { result: ValueId, x: ValueId, field: usize },
    Go { call: CallCommon },
    If { cond: ValueId },
    Index { result: ValueId, x: ValueId, index: ValueId },
    IndexAddr { result: ValueId, x: ValueId, index: ValueId },
    Jump,
    Lookup { result: ValueId, x: ValueId, index: ValueId, comma_ok: bool },
    MakeChan { result: ValueId, size: ValueId },
    MakeClosure { result: ValueId, func: FuncId, bindings: Vec<ValueId> },
    MakeInterface { result: ValueId, x: ValueId },
    MakeMap { result: ValueId },
    MakeSlice { result: ValueId },
    MapUpdate { map: ValueId, key: ValueId, value: ValueId },
    Next { result: ValueId, iter: ValueId },
    Phi { result: ValueId, edges: Vec<ValueId> },
    Return { results: Vec<ValueId> },
    RunDefers,
    Select { result: ValueId, states: Vec<SelectState>, blocking: bool },
    Send { chan: ValueId, value: ValueId },
    Slice { result: ValueId, x: ValueId },
    Store { addr: ValueId, value: ValueId },
    TypeAssert { result: ValueId, x: ValueId, asserted: TypeId, comma_ok: bool },
    UnOp { result: ValueId, op: UnOpKind, x: ValueId, comma_ok: bool },
}

impl InstrKind {
    /// Short tag used in diagnostics and the trace log.
    pub fn tag(&self) -> &'static str {
        match self {
            InstrKind::Alloc { .. } => "alloc",
            InstrKind::BinOp { .. } => "binop",
            InstrKind::Call { .. } => "call",
            InstrKind::ChangeInterface { .. } => "changeiface",
            InstrKind::ChangeType { .. } => "changetype",
            InstrKind::Convert { .. } => "convert",
            InstrKind::DebugRef { .. } => "debugref",
            InstrKind::Defer { .. } => "defer",
            InstrKind::Extract { .. } => "extract",
            InstrKind::Field { .. } => "field",
            InstrKind::FieldAddr { .. } => "field-addr",
            InstrKind::Go { .. } => "go",
            InstrKind::If { .. } => "if",
            InstrKind::Index { .. } => "index",
            InstrKind::IndexAddr { .. } => "index-addr",
            InstrKind::Jump => "jump",
            InstrKind::Lookup { .. } => "lookup",
            InstrKind::MakeChan { .. } => "makechan",
            InstrKind::MakeClosure { .. } => "makeclosure",
            InstrKind::MakeInterface { .. } => "make-iface",
            InstrKind::MakeMap { .. } => "make-map",
            InstrKind::MakeSlice { .. } => "make-slice",
            InstrKind::MapUpdate { .. } => "map-update",
            InstrKind::Next { .. } => "next",
            InstrKind::Phi { .. } => "phi",
            InstrKind::Return { .. } => "return",
            InstrKind::RunDefers => "rundefers",
            InstrKind::Select { .. } => "select",
            InstrKind::Send { .. } => "send",
            InstrKind::Slice { .. } => "slice",
            InstrKind::Store { .. } => "store",
            InstrKind::TypeAssert { .. } => "typeassert",
            InstrKind::UnOp { .. } => "unop",
        }
    }
}

/// An instruction together with its source position.
#[derive(Clone, Debug)]
pub struct Instr {
    pub kind: InstrKind,
    pub pos: Pos,
}

/// A basic block: ordered instructions plus successor/predecessor indices.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    pub instrs: Vec<Instr>,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
    /// Builder annotation such as `for.loop` or `for.done`.
    pub comment: String,
}

/// A function: qualified name, parameters, free variables, results, blocks.
#[derive(Clone, Debug)]
pub struct FuncData {
    pub name: String,
    pub params: Vec<ValueId>,
    pub free_vars: Vec<ValueId>,
    pub results: Vec<TypeId>,
    pub blocks: Vec<BlockData>,
    pub pos: Pos,
}

impl FuncData {
    /// Functions without blocks have no body available for analysis.
    pub fn has_body(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Bare name after the last `.` of the qualified name.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

/// A package: name plus its global members and functions.
#[derive(Clone, Debug, Default)]
pub struct Package {
    pub name: String,
    pub globals: Vec<ValueId>,
    pub funcs: Vec<FuncId>,
}

/// A decoded source location.
#[derive(Clone, Debug)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

/// The SSA program: arenas for packages, functions, values, types, positions,
/// plus the method table for named types.
#[derive(Debug, Default)]
pub struct SsaProgram {
    pub packages: Vec<Package>,
    funcs: Vec<FuncData>,
    values: Vec<ValueData>,
    types: Vec<TypeData>,
    type_ids: FnvHashMap<TypeData, TypeId>,
    positions: Vec<SourceLoc>,
    methods: FnvHashMap<(TypeId, String), FuncId>,
    func_by_name: FnvHashMap<String, FuncId>,
}

impl SsaProgram {
    pub fn new() -> SsaProgram {
        SsaProgram::default()
    }

    /// Interns a type, returning the existing handle for structurally equal
    /// types.
    pub fn intern_type(&mut self, data: TypeData) -> TypeId {
        if let Some(&id) = self.type_ids.get(&data) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(data.clone());
        self.type_ids.insert(data, id);
        id
    }

    pub fn basic(&mut self, kind: BasicKind) -> TypeId {
        self.intern_type(TypeData::Basic(kind))
    }

    pub fn ty(&self, id: TypeId) -> &TypeData {
        &self.types[id.0 as usize]
    }

    pub fn add_value(&mut self, data: ValueData) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(data);
        id
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut ValueData {
        &mut self.values[id.0 as usize]
    }

    pub fn value_name(&self, id: ValueId) -> &str {
        &self.values[id.0 as usize].name
    }

    pub fn add_func(&mut self, name: &str, pos: Pos) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(FuncData {
            name: name.to_owned(),
            params: Vec::new(),
            free_vars: Vec::new(),
            results: Vec::new(),
            blocks: Vec::new(),
            pos,
        });
        self.func_by_name.insert(name.to_owned(), id);
        id
    }

    pub fn func(&self, id: FuncId) -> &FuncData {
        &self.funcs[id.0 as usize]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut FuncData {
        &mut self.funcs[id.0 as usize]
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_by_name.get(name).copied()
    }

    pub fn funcs(&self) -> impl Iterator<Item = (FuncId, &FuncData)> {
        self.funcs.iter().enumerate().map(|(i, f)| (FuncId(i as u32), f))
    }

    pub fn add_pos(&mut self, file: &str, line: u32) -> Pos {
        let id = Pos(self.positions.len() as u32);
        self.positions.push(SourceLoc { file: file.to_owned(), line });
        id
    }

    /// Decodes a position handle to `file:line`, or `"-"` when unknown.
    pub fn decode_pos(&self, pos: Pos) -> String {
        match self.positions.get(pos.0 as usize) {
            Some(loc) => format!("{}:{}", loc.file, loc.line),
            None => "-".to_owned(),
        }
    }

    pub fn register_method(&mut self, ty: TypeId, name: &str, func: FuncId) {
        self.methods.insert((ty, name.to_owned()), func);
    }

    /// Concrete method lookup used by dynamic dispatch.
    pub fn lookup_method(&self, ty: TypeId, name: &str) -> Option<FuncId> {
        self.methods.get(&(ty, name.to_owned())).copied()
    }

    /// Whether every method of the interface exists on the concrete type.
    /// Returns the first missing method name otherwise.
    pub fn missing_method(&self, concrete: TypeId, iface: TypeId) -> Option<&str> {
        if let TypeData::Interface { methods } = self.ty(self.underlying(iface)) {
            for m in methods {
                if !self.methods.contains_key(&(concrete, m.clone())) {
                    return Some(m.as_str());
                }
            }
        }
        None
    }

    /// Fills in predecessor lists of a function from its successor lists.
    pub fn seal_func(&mut self, id: FuncId) {
        let nblocks = self.funcs[id.0 as usize].blocks.len();
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); nblocks];
        for (i, blk) in self.funcs[id.0 as usize].blocks.iter().enumerate() {
            for &s in &blk.succs {
                preds[s].push(i);
            }
        }
        for (blk, p) in self.funcs[id.0 as usize].blocks.iter_mut().zip(preds) {
            blk.preds = p;
        }
    }

    // Type inspection helpers.

    /// Resolves named types to their underlying structure.
    pub fn underlying(&self, t: TypeId) -> TypeId {
        let mut t = t;
        while let TypeData::Named { underlying, .. } = self.ty(t) {
            t = *underlying;
        }
        t
    }

    /// One pointer indirection, identity on non-pointers.
    pub fn deref(&self, t: TypeId) -> TypeId {
        match self.ty(self.underlying(t)) {
            TypeData::Pointer { elem } => *elem,
            _ => t,
        }
    }

    pub fn is_chan(&self, t: TypeId) -> bool {
        matches!(self.ty(self.underlying(t)), TypeData::Chan { .. })
    }

    pub fn chan_elem(&self, t: TypeId) -> Option<TypeId> {
        match self.ty(self.underlying(t)) {
            TypeData::Chan { elem } => Some(*elem),
            _ => None,
        }
    }

    pub fn is_byte(&self, t: TypeId) -> bool {
        matches!(self.ty(self.underlying(t)), TypeData::Basic(BasicKind::Byte))
    }

    pub fn is_string(&self, t: TypeId) -> bool {
        matches!(self.ty(self.underlying(t)), TypeData::Basic(BasicKind::Str))
    }

    pub fn struct_fields(&self, t: TypeId) -> Option<&[TypeId]> {
        match self.ty(self.underlying(t)) {
            TypeData::Struct { fields } => Some(fields),
            _ => None,
        }
    }

    pub fn array_len(&self, t: TypeId) -> Option<usize> {
        match self.ty(self.underlying(t)) {
            TypeData::Array { len, .. } => Some(*len),
            _ => None,
        }
    }

    pub fn is_slice(&self, t: TypeId) -> bool {
        matches!(self.ty(self.underlying(t)), TypeData::Slice { .. })
    }

    pub fn slice_elem(&self, t: TypeId) -> Option<TypeId> {
        match self.ty(self.underlying(t)) {
            TypeData::Slice { elem } => Some(*elem),
            _ => None,
        }
    }

    pub fn tuple_elems(&self, t: TypeId) -> Option<&[TypeId]> {
        match self.ty(self.underlying(t)) {
            TypeData::Tuple { elems } => Some(elems),
            _ => None,
        }
    }

    pub fn is_interface(&self, t: TypeId) -> bool {
        matches!(self.ty(self.underlying(t)), TypeData::Interface { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_structural() {
        let mut p = SsaProgram::new();
        let int = p.basic(BasicKind::Int);
        let c1 = p.intern_type(TypeData::Chan { elem: int });
        let c2 = p.intern_type(TypeData::Chan { elem: int });
        assert_eq!(c1, c2);
        assert!(p.is_chan(c1));
        assert_eq!(p.chan_elem(c1), Some(int));
    }

    #[test]
    fn seal_computes_preds() {
        let mut p = SsaProgram::new();
        let f = p.add_func("main.main", Pos::NONE);
        p.func_mut(f).blocks = vec![
            BlockData { succs: vec![1], ..BlockData::default() },
            BlockData { succs: vec![1, 2], ..BlockData::default() },
            BlockData::default(),
        ];
        p.seal_func(f);
        assert_eq!(p.func(f).blocks[1].preds, vec![0, 1]);
        assert_eq!(p.func(f).blocks[2].preds, vec![1]);
    }

    #[test]
    fn named_type_resolution() {
        let mut p = SsaProgram::new();
        let int = p.basic(BasicKind::Int);
        let st = p.intern_type(TypeData::Struct { fields: vec![int, int] });
        let named = p.intern_type(TypeData::Named { name: "main.T".to_owned(), underlying: st });
        let ptr = p.intern_type(TypeData::Pointer { elem: named });
        assert_eq!(p.struct_fields(named).map(<[TypeId]>::len), Some(2));
        assert_eq!(p.deref(ptr), named);
    }
}
