//! Lowering from the rasa AST to the shared instruction stream.
//!
//! The compiler walks the tree once, mutating three tables as it goes: the
//! label and address allocators, the method registry (filled eagerly at
//! definition sites, drained lazily at the first call site that resolves a
//! name), and the dispatch table of resolved `(class, name)` targets.
//! Method bodies and runtime support routines are lowered into their own
//! buffers and appended after the main program's `EXIT`, so the emitted
//! stream is: init prologue, top-level statements, `EXIT`, method and
//! routine definitions.
//!
//! # Value discipline
//!
//! Every expression lowers to code that leaves exactly one wrapped value on
//! the stack. Statements discard theirs. Bodies with no statements push nil.
//! Call sites save `(address, value)` pairs for every live local of the
//! current frame before the arguments, and restore them around the return
//! value, which rides through the TMP cell.

pub mod support;
pub mod value;

use itertools::Itertools;
use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use crate::ast::{BinOp, Node, Target, WhenArm};
use crate::error::{location_of, CompileError, Diagnostic, Error, Source};
use crate::ir::Instruction;
use crate::parser::{Parser, Span};
use crate::prelude;

use support::SupportRoutine;
use value::{
    wrap_char, wrap_int, ClassId, FALSE, HEAP_COUNT, NIL, NONE, TAG_ARRAY, TMP,
    TRUE,
};

/// The owner of a method: a built-in class, or the top level.
pub type Owner = Option<ClassId>;

/// A resolved, emitted method or primitive.
#[derive(Debug, Clone, Copy)]
struct MethodSig {
    label: i64,
    arity: usize,
    /// Support routines never touch user locals, so call sites skip the
    /// save/restore protocol for them.
    builtin: bool,
}

/// A definition registered but not yet lowered. Definitions that are never
/// called produce no code.
#[derive(Debug, Clone)]
struct PendingDef {
    owner: Owner,
    name: String,
    params: Vec<String>,
    body: Vec<Node>,
    src: usize,
}

/// The compile-time frame of the method currently being lowered: its local
/// addresses, self slot, and the lexical class of `self`.
#[derive(Debug)]
struct Frame {
    vars: FxHashMap<String, i64>,
    self_addr: Option<i64>,
    self_class: Owner,
    in_method: bool,
    src: usize,
}

pub struct Compiler {
    /// Next fresh label. Starts at 1; the wire format cannot carry 0.
    label_count: i64,
    /// Next fresh static heap address. 0..=2 are reserved.
    addr_count: i64,
    consts: FxHashMap<String, i64>,
    frames: Vec<Frame>,
    registry: FxHashMap<String, Vec<PendingDef>>,
    dispatch: FxHashMap<(Owner, String), MethodSig>,
    support_labels: FxHashMap<SupportRoutine, i64>,
    /// Scratch cells shared between `key_to_addr` and the hash accessors,
    /// filled in when `key_to_addr` is emitted.
    pub(crate) hash_cells: Option<(i64, i64)>,
    /// Buffer stack: the main program at the bottom, then one buffer per
    /// method or routine currently being lowered.
    bufs: Vec<Vec<Instruction>>,
    /// Finished out-of-line code.
    defs: Vec<Instruction>,
    sources: Vec<(Source, String)>,
}

/// Compiles a rasa program to an instruction stream.
pub fn compile(source: &str, file: Source) -> Result<Vec<Instruction>, Diagnostic> {
    let program = Parser::parse(source, file.clone())?;
    let mut compiler = Compiler::new();
    compiler.register_prelude()?;
    compiler.lower_program(&program, source, file)
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            label_count: 1,
            addr_count: 3,
            consts: FxHashMap::default(),
            frames: Vec::new(),
            registry: FxHashMap::default(),
            dispatch: FxHashMap::default(),
            support_labels: FxHashMap::default(),
            hash_cells: None,
            bufs: Vec::new(),
            defs: Vec::new(),
            sources: Vec::new(),
        }
    }

    //===------------------------------------------------------------------===//
    // Allocators and emission
    //===------------------------------------------------------------------===//

    pub(crate) fn new_label(&mut self) -> i64 {
        let label = self.label_count;
        self.label_count += 1;
        label
    }

    pub(crate) fn new_addr(&mut self) -> i64 {
        let addr = self.addr_count;
        self.addr_count += 1;
        addr
    }

    pub(crate) fn emit(&mut self, inst: Instruction) {
        self.bufs.last_mut().expect("an open buffer").push(inst);
    }

    pub(crate) fn push_i(&mut self, n: i64) {
        self.emit(Instruction::Push(BigInt::from(n)));
    }

    fn push_big(&mut self, n: BigInt) {
        self.emit(Instruction::Push(n));
    }

    pub(crate) fn mark(&mut self, label: i64) {
        self.emit(Instruction::Mark(BigInt::from(label)));
    }

    pub(crate) fn call(&mut self, label: i64) {
        self.emit(Instruction::Call(BigInt::from(label)));
    }

    pub(crate) fn jump(&mut self, label: i64) {
        self.emit(Instruction::Jump(BigInt::from(label)));
    }

    pub(crate) fn jump_zero(&mut self, label: i64) {
        self.emit(Instruction::JumpZero(BigInt::from(label)));
    }

    pub(crate) fn jump_negative(&mut self, label: i64) {
        self.emit(Instruction::JumpNegative(BigInt::from(label)));
    }

    /// Pushes the value of a heap cell.
    pub(crate) fn load(&mut self, addr: i64) {
        self.push_i(addr);
        self.emit(Instruction::Retrieve);
    }

    /// Stores the value on top of the stack into a heap cell.
    pub(crate) fn stash(&mut self, addr: i64) {
        self.push_i(addr);
        self.emit(Instruction::Swap);
        self.emit(Instruction::Store);
    }

    /// Payload of a wrapped value; exact for every tag because machine
    /// division floors.
    pub(crate) fn emit_unwrap(&mut self) {
        self.push_i(4);
        self.emit(Instruction::Div);
    }

    /// Rewraps an integer payload.
    pub(crate) fn emit_wrap_int(&mut self) {
        self.push_i(4);
        self.emit(Instruction::Mul);
        self.push_i(1);
        self.emit(Instruction::Add);
    }

    /// Bump-allocates a constant number of cells, leaving the address of the
    /// first on the stack.
    pub(crate) fn emit_alloc(&mut self, cells: i64) {
        self.push_i(HEAP_COUNT);
        self.emit(Instruction::Retrieve);
        self.push_i(cells);
        self.emit(Instruction::Add);
        self.emit(Instruction::Dup);
        self.push_i(HEAP_COUNT);
        self.emit(Instruction::Swap);
        self.emit(Instruction::Store);
        self.push_i(cells - 1);
        self.emit(Instruction::Sub);
    }

    //===------------------------------------------------------------------===//
    // Frames, sources, diagnostics
    //===------------------------------------------------------------------===//

    fn add_source(&mut self, file: Source, text: &str) -> usize {
        self.sources.push((file, text.to_string()));
        self.sources.len() - 1
    }

    fn frame(&self) -> &Frame {
        self.frames.last().expect("an open frame")
    }

    fn local_addr(&mut self, name: &str) -> i64 {
        if let Some(addr) = self.frame().vars.get(name) {
            return *addr;
        }
        let addr = self.new_addr();
        self.frames
            .last_mut()
            .expect("an open frame")
            .vars
            .insert(name.to_string(), addr);
        addr
    }

    fn const_addr(&mut self, name: &str) -> i64 {
        if let Some(addr) = self.consts.get(name) {
            return *addr;
        }
        let addr = self.new_addr();
        self.consts.insert(name.to_string(), addr);
        addr
    }

    /// Every live local of the current frame, self slot included, in a
    /// deterministic order for the save/restore protocol.
    fn frame_save_addrs(&self) -> Vec<i64> {
        let frame = self.frame();
        frame
            .vars
            .values()
            .copied()
            .chain(frame.self_addr)
            .sorted_unstable()
            .collect()
    }

    fn err(&self, error: CompileError, span: &Span) -> Diagnostic {
        let (file, text) = &self.sources[self.frame().src];
        Diagnostic::new(
            Error::CompileError(error),
            span.clone(),
            text.clone(),
            file.clone(),
        )
    }

    fn err_at(&self, src: usize, error: CompileError, span: &Span) -> Diagnostic {
        let (file, text) = &self.sources[src];
        Diagnostic::new(
            Error::CompileError(error),
            span.clone(),
            text.clone(),
            file.clone(),
        )
    }

    //===------------------------------------------------------------------===//
    // Registration
    //===------------------------------------------------------------------===//

    fn register_prelude(&mut self) -> Result<(), Diagnostic> {
        let src = self.add_source(Source::Prelude, prelude::SOURCE);
        for node in prelude::ast() {
            match node {
                Node::Class { span, name, body } => {
                    self.register_class(name, body, span, src)?
                }
                Node::Def { name, params, body, .. } => {
                    self.register_def(None, name, params, body, src)
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn register_def(
        &mut self,
        owner: Owner,
        name: &str,
        params: &[String],
        body: &[Node],
        src: usize,
    ) {
        self.registry.entry(name.to_string()).or_default().push(PendingDef {
            owner,
            name: name.to_string(),
            params: params.to_vec(),
            body: body.to_vec(),
            src,
        });
    }

    fn register_class(
        &mut self,
        name: &str,
        body: &[Node],
        span: &Span,
        src: usize,
    ) -> Result<(), Diagnostic> {
        let class = ClassId::from_name(name).ok_or_else(|| {
            self.err_at(src, CompileError::UnknownClass { name: name.to_string() }, span)
        })?;
        for node in body {
            match node {
                Node::Def { name, params, body, .. } => {
                    self.register_def(Some(class), name, params, body, src)
                }
                other => {
                    return Err(self.err_at(
                        src,
                        CompileError::ClassBodyNotADefinition,
                        other.span(),
                    ))
                }
            }
        }
        Ok(())
    }

    //===------------------------------------------------------------------===//
    // Resolution and method emission
    //===------------------------------------------------------------------===//

    /// Drains every queued definition of `name` and lowers them, so all
    /// dispatch arms of the requesting call site can be wired in one pass.
    fn resolve_name(&mut self, name: &str) -> Result<(), Diagnostic> {
        if let Some(pending) = self.registry.remove(name) {
            for def in pending {
                self.emit_method(def)?;
            }
        }
        Ok(())
    }

    /// The resolved target for `(owner, name)`, materializing the built-in
    /// primitive if no user definition took the slot.
    fn target_for(&mut self, owner: Owner, name: &str) -> Option<MethodSig> {
        if let Some(sig) = self.dispatch.get(&(owner, name.to_string())) {
            return Some(*sig);
        }
        let (routine, arity) = support::builtin_for(owner, name)?;
        let label = self.support(routine);
        let sig = MethodSig { label, arity, builtin: true };
        self.dispatch.insert((owner, name.to_string()), sig);
        Some(sig)
    }

    fn emit_method(&mut self, def: PendingDef) -> Result<(), Diagnostic> {
        let label = self.new_label();
        // Visible before the body lowers, so recursion resolves to it.
        self.dispatch.insert(
            (def.owner, def.name.clone()),
            MethodSig { label, arity: def.params.len(), builtin: false },
        );

        let self_addr = self.new_addr();
        let mut vars = FxHashMap::default();
        let param_addrs: Vec<i64> =
            def.params.iter().map(|_| self.new_addr()).collect();
        for (param, addr) in def.params.iter().zip(&param_addrs) {
            vars.insert(param.clone(), *addr);
        }

        self.frames.push(Frame {
            vars,
            self_addr: Some(self_addr),
            self_class: def.owner,
            in_method: true,
            src: def.src,
        });
        self.bufs.push(Vec::new());

        self.mark(label);
        // Prologue: receiver into the self slot, then arguments into their
        // cells, deepest-last.
        self.stash(self_addr);
        for addr in param_addrs.iter().rev() {
            self.stash(*addr);
        }
        self.lower_body(&def.body)?;
        self.emit(Instruction::Return);

        let code = self.bufs.pop().expect("method buffer");
        self.defs.extend(code);
        self.frames.pop();
        Ok(())
    }

    //===------------------------------------------------------------------===//
    // Program lowering
    //===------------------------------------------------------------------===//

    fn lower_program(
        mut self,
        program: &[Node],
        source: &str,
        file: Source,
    ) -> Result<Vec<Instruction>, Diagnostic> {
        let src = self.add_source(file, source);
        self.frames.push(Frame {
            vars: FxHashMap::default(),
            self_addr: None,
            self_class: None,
            in_method: false,
            src,
        });
        self.bufs.push(Vec::new());

        for node in program {
            self.lower_expr(node)?;
            self.emit(Instruction::Discard);
        }
        self.emit(Instruction::Exit);

        let main = self.bufs.pop().expect("main buffer");

        // Init prologue: HEAP_COUNT starts past the last static address, so
        // dynamic allocation never collides with variables.
        let mut out = Vec::with_capacity(main.len() + self.defs.len() + 3);
        out.push(Instruction::Push(BigInt::from(HEAP_COUNT)));
        out.push(Instruction::Push(BigInt::from(self.addr_count - 1)));
        out.push(Instruction::Store);
        out.extend(main);
        out.extend(std::mem::take(&mut self.defs));
        Ok(out)
    }

    fn lower_body(&mut self, body: &[Node]) -> Result<(), Diagnostic> {
        if body.is_empty() {
            self.push_i(NIL);
            return Ok(());
        }
        for (i, node) in body.iter().enumerate() {
            self.lower_expr(node)?;
            if i + 1 != body.len() {
                self.emit(Instruction::Discard);
            }
        }
        Ok(())
    }

    /// Lowers one expression; the emitted code leaves exactly one wrapped
    /// value on the stack.
    fn lower_expr(&mut self, node: &Node) -> Result<(), Diagnostic> {
        match node {
            Node::Int { value, .. } => self.push_big(wrap_int(value)),
            Node::Str { span, value } => {
                let mut chars = value.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => self.push_big(wrap_char(c)),
                    _ => {
                        return Err(self.err(
                            CompileError::MultiCharString { value: value.clone() },
                            span,
                        ))
                    }
                }
            }
            Node::True { .. } => self.push_i(TRUE),
            Node::False { .. } => self.push_i(FALSE),
            Node::Nil { .. } => self.push_i(NIL),
            Node::SelfRef { .. } => match self.frame().self_addr {
                Some(addr) => self.load(addr),
                None => self.push_i(NONE),
            },

            Node::Ident { span, name } => {
                match self.frame().vars.get(name).copied() {
                    Some(addr) => self.load(addr),
                    None => self.lower_call(span, None, name, &[])?,
                }
            }
            Node::Const { span, name } => {
                if let Some(class) = ClassId::from_name(name) {
                    self.push_i(class.code());
                } else if let Some(addr) = self.consts.get(name).copied() {
                    self.load(addr);
                } else {
                    return Err(self.err(
                        CompileError::UndefinedName { name: name.clone() },
                        span,
                    ));
                }
            }

            Node::Assign { span, target, value } => match target.as_ref() {
                Target::Local { name, .. } => {
                    self.lower_expr(value)?;
                    let addr = self.local_addr(name);
                    self.emit(Instruction::Dup);
                    self.stash(addr);
                }
                Target::Const { name, .. } => {
                    self.lower_expr(value)?;
                    let addr = self.const_addr(name);
                    self.emit(Instruction::Dup);
                    self.stash(addr);
                }
                Target::Index { recv, index, .. } => {
                    let args = vec![index.clone(), value.as_ref().clone()];
                    self.lower_call(span, Some(recv), "[]=", &args)?;
                }
            },

            Node::ArrayLit { elements, .. } => self.lower_array_lit(elements)?,
            Node::HashLit { pairs, .. } => self.lower_hash_lit(pairs)?,

            Node::Binary { span, op, lhs, rhs } => match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                    self.lower_arith(*op, lhs, rhs)?
                }
                BinOp::Eq => {
                    self.lower_expr(lhs)?;
                    self.lower_expr(rhs)?;
                    let req = self.support(SupportRoutine::Req);
                    self.call(req);
                }
                BinOp::Ne => {
                    self.lower_expr(lhs)?;
                    self.lower_expr(rhs)?;
                    let req = self.support(SupportRoutine::Req);
                    let rnot = self.support(SupportRoutine::Rnot);
                    self.call(req);
                    self.call(rnot);
                }
                BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Cmp => {
                    self.lower_dispatch(
                        span,
                        lhs,
                        op.symbol(),
                        std::slice::from_ref(rhs),
                    )?
                }
            },

            Node::Not { expr, .. } => {
                self.lower_expr(expr)?;
                let rnot = self.support(SupportRoutine::Rnot);
                self.call(rnot);
            }
            Node::Neg { expr, .. } => {
                // 0 - x on the unwrapped payloads.
                self.push_i(0);
                self.lower_expr(expr)?;
                self.emit_unwrap();
                self.emit(Instruction::Sub);
                self.emit_wrap_int();
            }

            Node::If { cond, then_body, else_body, .. } => {
                self.lower_if(cond, then_body, else_body)?
            }
            Node::While { cond, body, .. } => self.lower_while(cond, body)?,
            Node::Case { subject, whens, else_body, .. } => {
                self.lower_case(subject, whens, else_body)?
            }

            Node::Call { span, recv, name, args } => {
                self.lower_call(span, recv.as_deref(), name, args)?
            }

            Node::Return { span, value } => {
                if !self.frame().in_method {
                    return Err(self.err(CompileError::ReturnOutsideMethod, span));
                }
                match value {
                    Some(v) => self.lower_expr(v)?,
                    None => self.push_i(NIL),
                }
                // Early return by tail execution.
                self.emit(Instruction::Return);
                self.push_i(NIL);
            }
            Node::Raise { span, message } => {
                self.emit_raise(span, message);
                self.push_i(NIL);
            }

            Node::Def { span, name, params, body } => {
                if self.frames.len() > 1 {
                    return Err(self.err(
                        CompileError::MisplacedDefinition { name: name.clone() },
                        span,
                    ));
                }
                let src = self.frame().src;
                self.register_def(None, name, params, body, src);
                self.push_i(NIL);
            }
            Node::Class { span, name, body } => {
                if self.frames.len() > 1 {
                    return Err(self.err(CompileError::NestedClass, span));
                }
                let src = self.frame().src;
                self.register_class(name, body, span, src)?;
                self.push_i(NIL);
            }
        }
        Ok(())
    }

    //===------------------------------------------------------------------===//
    // Literals
    //===------------------------------------------------------------------===//

    fn lower_array_lit(&mut self, elements: &[Node]) -> Result<(), Diagnostic> {
        for element in elements {
            self.lower_expr(element)?;
        }
        let size = elements.len() as i64;
        let cap = (size * 2).max(10);

        self.emit_alloc(3 + cap);
        // Elements are above the base on the stack; ride the base through
        // TMP while they pop off into their cells, last first.
        self.stash(TMP);
        for i in (0..size).rev() {
            self.load(TMP);
            self.push_i(3 + i);
            self.emit(Instruction::Add);
            self.emit(Instruction::Swap);
            self.emit(Instruction::Store);
        }
        // Descriptor: element pointer, size, capacity.
        self.load(TMP);
        self.emit(Instruction::Dup);
        self.emit(Instruction::Dup);
        self.push_i(3);
        self.emit(Instruction::Add);
        self.emit(Instruction::Store);
        self.emit(Instruction::Dup);
        self.push_i(1);
        self.emit(Instruction::Add);
        self.push_i(size);
        self.emit(Instruction::Store);
        self.emit(Instruction::Dup);
        self.push_i(2);
        self.emit(Instruction::Add);
        self.push_i(cap);
        self.emit(Instruction::Store);
        // Wrap the base as an array value.
        self.push_i(4);
        self.emit(Instruction::Mul);
        self.push_i(TAG_ARRAY);
        self.emit(Instruction::Add);
        Ok(())
    }

    fn lower_hash_lit(&mut self, pairs: &[(Node, Node)]) -> Result<(), Diagnostic> {
        let hash_new = self.support(SupportRoutine::HashNew);
        let hash_set = self.support(SupportRoutine::HashSet);
        self.call(hash_new);
        for (key, value) in pairs {
            // [h] -> [h, k, v, h] by pure stack shuffling, so nested
            // literals in keys or values cannot clobber anything.
            self.emit(Instruction::Dup);
            self.lower_expr(key)?;
            self.emit(Instruction::Swap);
            self.lower_expr(value)?;
            self.emit(Instruction::Swap);
            self.call(hash_set);
            self.emit(Instruction::Discard);
        }
        Ok(())
    }

    //===------------------------------------------------------------------===//
    // Arithmetic and control flow
    //===------------------------------------------------------------------===//

    fn lower_arith(
        &mut self,
        op: BinOp,
        lhs: &Node,
        rhs: &Node,
    ) -> Result<(), Diagnostic> {
        self.lower_expr(lhs)?;
        self.emit_unwrap();
        self.lower_expr(rhs)?;
        self.emit_unwrap();
        self.emit(match op {
            BinOp::Add => Instruction::Add,
            BinOp::Sub => Instruction::Sub,
            BinOp::Mul => Instruction::Mul,
            BinOp::Div => Instruction::Div,
            BinOp::Mod => Instruction::Mod,
            _ => unreachable!("not an arithmetic operator"),
        });
        self.emit_wrap_int();
        Ok(())
    }

    /// Lowers a condition as a branch to `l_true` when truthy. Comparisons
    /// against literal zero shortcut straight onto the conditional jumps;
    /// this is only sound because such conditions are INT-valued in any
    /// program the surface language admits.
    fn lower_condition(&mut self, cond: &Node, l_true: i64) -> Result<(), Diagnostic> {
        if let Node::Binary { op, lhs, rhs, .. } = cond {
            match op {
                BinOp::Eq if rhs.is_int_literal(0) => {
                    self.lower_expr(lhs)?;
                    self.emit_unwrap();
                    self.jump_zero(l_true);
                    return Ok(());
                }
                BinOp::Eq if lhs.is_int_literal(0) => {
                    self.lower_expr(rhs)?;
                    self.emit_unwrap();
                    self.jump_zero(l_true);
                    return Ok(());
                }
                BinOp::Lt if rhs.is_int_literal(0) => {
                    self.lower_expr(lhs)?;
                    self.emit_unwrap();
                    self.jump_negative(l_true);
                    return Ok(());
                }
                BinOp::Lt if lhs.is_int_literal(0) => {
                    // 0 < x holds exactly when -x is negative.
                    self.push_i(0);
                    self.lower_expr(rhs)?;
                    self.emit_unwrap();
                    self.emit(Instruction::Sub);
                    self.jump_negative(l_true);
                    return Ok(());
                }
                _ => {}
            }
        }
        self.lower_expr(cond)?;
        let rtest = self.support(SupportRoutine::Rtest);
        self.call(rtest);
        self.jump_zero(l_true);
        Ok(())
    }

    fn lower_if(
        &mut self,
        cond: &Node,
        then_body: &[Node],
        else_body: &[Node],
    ) -> Result<(), Diagnostic> {
        let l_then = self.new_label();
        let l_end = self.new_label();
        self.lower_condition(cond, l_then)?;
        self.lower_body(else_body)?;
        self.jump(l_end);
        self.mark(l_then);
        self.lower_body(then_body)?;
        self.mark(l_end);
        Ok(())
    }

    fn lower_while(&mut self, cond: &Node, body: &[Node]) -> Result<(), Diagnostic> {
        if matches!(cond, Node::True { .. }) {
            // `while true` needs no test at all.
            let l_body = self.new_label();
            self.mark(l_body);
            for stmt in body {
                self.lower_expr(stmt)?;
                self.emit(Instruction::Discard);
            }
            self.jump(l_body);
            self.push_i(NIL);
            return Ok(());
        }

        let l_cond = self.new_label();
        let l_body = self.new_label();
        let l_end = self.new_label();
        self.mark(l_cond);
        self.lower_condition(cond, l_body)?;
        self.jump(l_end);
        self.mark(l_body);
        for stmt in body {
            self.lower_expr(stmt)?;
            self.emit(Instruction::Discard);
        }
        self.jump(l_cond);
        self.mark(l_end);
        // A loop's value is always nil.
        self.push_i(NIL);
        Ok(())
    }

    fn lower_case(
        &mut self,
        subject: &Node,
        whens: &[WhenArm],
        else_body: &[Node],
    ) -> Result<(), Diagnostic> {
        self.lower_expr(subject)?;
        let l_end = self.new_label();
        let arm_labels: Vec<i64> = whens.iter().map(|_| self.new_label()).collect();

        // Test every pattern against one duped copy of the scrutinee.
        for (arm, l_arm) in whens.iter().zip(&arm_labels) {
            for pattern in &arm.patterns {
                self.emit(Instruction::Dup);
                self.lower_expr(pattern)?;
                self.emit(Instruction::Sub);
                self.jump_zero(*l_arm);
            }
        }
        self.emit(Instruction::Discard);
        self.lower_body(else_body)?;
        self.jump(l_end);

        for (arm, l_arm) in whens.iter().zip(&arm_labels) {
            self.mark(*l_arm);
            self.emit(Instruction::Discard);
            self.lower_body(&arm.body)?;
            self.jump(l_end);
        }
        self.mark(l_end);
        Ok(())
    }

    //===------------------------------------------------------------------===//
    // Calls and dispatch
    //===------------------------------------------------------------------===//

    fn lower_call(
        &mut self,
        span: &Span,
        recv: Option<&Node>,
        name: &str,
        args: &[Node],
    ) -> Result<(), Diagnostic> {
        match recv {
            None => {
                if self.lower_io_builtin(name, args)? {
                    return Ok(());
                }
                self.lower_bareword(span, name, args)
            }
            Some(recv) => {
                if name == "is_a?" && args.len() == 1 {
                    return self.lower_is_a(recv, &args[0]);
                }
                self.lower_dispatch(span, recv, name, args)
            }
        }
    }

    /// The I/O builtins and `exit` map straight onto IR primitives. Returns
    /// false when `name` is not one of them.
    fn lower_io_builtin(
        &mut self,
        name: &str,
        args: &[Node],
    ) -> Result<bool, Diagnostic> {
        match (name, args.len()) {
            ("put_as_number", 1) => {
                self.lower_expr(&args[0])?;
                self.emit_unwrap();
                self.emit(Instruction::PutNum);
                self.push_i(NIL);
            }
            ("put_as_char", 1) => {
                self.lower_expr(&args[0])?;
                self.emit_unwrap();
                self.emit(Instruction::PutChar);
                self.push_i(NIL);
            }
            ("get_as_number", 0) => {
                self.push_i(TMP);
                self.emit(Instruction::GetNum);
                self.load(TMP);
                self.emit_wrap_int();
            }
            ("get_as_char", 0) => {
                self.push_i(TMP);
                self.emit(Instruction::GetChar);
                self.load(TMP);
                self.emit_wrap_int();
            }
            ("exit", 0) => {
                self.emit(Instruction::Exit);
                self.push_i(NIL);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// `x.is_a?(K)`: the class code's low nibble is 8 plus the instance
    /// tag, so the test is one subtraction.
    fn lower_is_a(&mut self, recv: &Node, class: &Node) -> Result<(), Diagnostic> {
        self.lower_expr(recv)?;
        self.push_i(4);
        self.emit(Instruction::Mod);
        self.lower_expr(class)?;
        self.emit_unwrap();
        self.push_i(8);
        self.emit(Instruction::Sub);
        self.emit(Instruction::Sub);
        let l_true = self.new_label();
        let l_end = self.new_label();
        self.jump_zero(l_true);
        self.push_i(FALSE);
        self.jump(l_end);
        self.mark(l_true);
        self.push_i(TRUE);
        self.mark(l_end);
        Ok(())
    }

    fn check_arity(
        &self,
        span: &Span,
        name: &str,
        sig: &MethodSig,
        got: usize,
    ) -> Result<(), Diagnostic> {
        if sig.arity != got {
            return Err(self.err(
                CompileError::WrongArity {
                    name: name.to_string(),
                    expected: sig.arity,
                    got,
                },
                span,
            ));
        }
        Ok(())
    }

    /// A bareword resolves statically: the class of `self` is lexically
    /// known, so the dispatch-table decision happens at compile time. A name
    /// the receiver's class does not own falls back to the top level with
    /// NONE as receiver.
    fn lower_bareword(
        &mut self,
        span: &Span,
        name: &str,
        args: &[Node],
    ) -> Result<(), Diagnostic> {
        self.resolve_name(name)?;
        let owner = self.frame().self_class;

        if let Some(class) = owner {
            if let Some(sig) = self.target_for(Some(class), name) {
                self.check_arity(span, name, &sig, args.len())?;
                return self.emit_direct_call(&sig, args, true);
            }
        }
        if let Some(sig) = self.target_for(None, name) {
            self.check_arity(span, name, &sig, args.len())?;
            return self.emit_direct_call(&sig, args, false);
        }
        Err(self.err(CompileError::UndefinedName { name: name.to_string() }, span))
    }

    /// Emits a statically resolved call: saves, arguments, receiver (self
    /// or NONE), CALL, restores.
    fn emit_direct_call(
        &mut self,
        sig: &MethodSig,
        args: &[Node],
        self_receiver: bool,
    ) -> Result<(), Diagnostic> {
        let saved = if sig.builtin { Vec::new() } else { self.frame_save_addrs() };
        self.emit_saves(&saved);
        for arg in args {
            self.lower_expr(arg)?;
        }
        if self_receiver {
            match self.frame().self_addr {
                Some(addr) => self.load(addr),
                None => self.push_i(NONE),
            }
        } else {
            self.push_i(NONE);
        }
        self.call(sig.label);
        self.emit_restores(&saved);
        Ok(())
    }

    /// An explicit-receiver call branches on the receiver's tag at run
    /// time; each arm's target comes from the compile-time dispatch table.
    /// Arms with no target (and the special arm, since NONE can never reach
    /// user code) raise.
    fn lower_dispatch(
        &mut self,
        span: &Span,
        recv: &Node,
        name: &str,
        args: &[Node],
    ) -> Result<(), Diagnostic> {
        self.resolve_name(name)?;
        let mut arms: Vec<Option<MethodSig>> = Vec::with_capacity(3);
        for class in [ClassId::Integer, ClassId::Array, ClassId::Hash] {
            let target = self.target_for(Some(class), name);
            if let Some(sig) = &target {
                self.check_arity(span, name, sig, args.len())?;
            }
            arms.push(target);
        }

        let needs_save = arms
            .iter()
            .any(|arm| matches!(arm, Some(sig) if !sig.builtin));
        let saved = if needs_save { self.frame_save_addrs() } else { Vec::new() };

        self.emit_saves(&saved);
        for arg in args {
            self.lower_expr(arg)?;
        }
        self.lower_expr(recv)?;

        let l_special = self.new_label();
        let l_int = self.new_label();
        let l_array = self.new_label();
        let l_hash = self.new_label();
        let l_err = self.new_label();
        let l_done = self.new_label();

        // Classify the tag, peeling one candidate per test.
        self.emit(Instruction::Dup);
        self.push_i(4);
        self.emit(Instruction::Mod);
        self.emit(Instruction::Dup);
        self.jump_zero(l_special);
        self.push_i(1);
        self.emit(Instruction::Sub);
        self.emit(Instruction::Dup);
        self.jump_zero(l_int);
        self.push_i(1);
        self.emit(Instruction::Sub);
        self.emit(Instruction::Dup);
        self.jump_zero(l_array);
        self.push_i(1);
        self.emit(Instruction::Sub);
        self.jump_zero(l_hash);
        self.jump(l_err);

        self.mark(l_special);
        self.emit(Instruction::Discard);
        self.mark(l_err);
        self.emit_raise(span, "Unknown type of receiver");

        for (arm, l_arm, discard) in [
            (arms[0], l_int, true),
            (arms[1], l_array, true),
            (arms[2], l_hash, false),
        ] {
            self.mark(l_arm);
            if discard {
                self.emit(Instruction::Discard);
            }
            match arm {
                Some(sig) => {
                    self.call(sig.label);
                    self.jump(l_done);
                }
                None => self.jump(l_err),
            }
        }

        self.mark(l_done);
        self.emit_restores(&saved);
        Ok(())
    }

    /// Pushes `(address, value)` pairs for the frame's live locals.
    fn emit_saves(&mut self, addrs: &[i64]) {
        for addr in addrs {
            self.push_i(*addr);
            self.load(*addr);
        }
    }

    /// Restores saved locals around the return value, which rides through
    /// TMP.
    fn emit_restores(&mut self, addrs: &[i64]) {
        if addrs.is_empty() {
            return;
        }
        self.stash(TMP);
        for _ in addrs {
            self.emit(Instruction::Store);
        }
        self.load(TMP);
    }

    /// `raise` and dispatch failures print `path:line:col: msg (Error)` and
    /// halt. The location is baked in at compile time, byte by byte.
    fn emit_raise(&mut self, span: &Span, message: &str) {
        let formatted = {
            let (file, text) = &self.sources[self.frame().src];
            let (line, col, _, _) = location_of(text, span.start);
            format!("{}:{}:{}: {} (Error)\n", file.display(), line, col, message)
        };
        for byte in formatted.bytes() {
            self.push_i(byte as i64);
            self.emit(Instruction::PutChar);
        }
        self.emit(Instruction::Exit);
    }

    //===------------------------------------------------------------------===//
    // Support routines
    //===------------------------------------------------------------------===//

    /// The label of a runtime support routine, emitting it on first use.
    pub(crate) fn support(&mut self, routine: SupportRoutine) -> i64 {
        if let Some(label) = self.support_labels.get(&routine) {
            return *label;
        }
        let label = self.new_label();
        self.support_labels.insert(routine, label);

        self.bufs.push(Vec::new());
        self.emit_support(routine, label);
        let code = self.bufs.pop().expect("routine buffer");
        self.defs.extend(code);
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Instruction::*;

    fn compile_inline(source: &str) -> Vec<Instruction> {
        compile(source, Source::Inline).unwrap()
    }

    fn compile_err(source: &str) -> Diagnostic {
        compile(source, Source::Inline).unwrap_err()
    }

    #[test]
    fn trivial_program_is_prologue_and_exit() {
        let ir = compile_inline("");
        // HEAP_COUNT := last static address (nothing allocated: 2), then exit.
        assert_eq!(
            ir,
            vec![
                Push(BigInt::from(2)),
                Push(BigInt::from(2)),
                Store,
                Exit
            ]
        );
    }

    #[test]
    fn literals_wrap_with_int_tag() {
        let ir = compile_inline("put_as_number 3 + 2");
        assert!(ir.contains(&Push(BigInt::from(13))));
        assert!(ir.contains(&Push(BigInt::from(9))));
        assert!(ir.contains(&PutNum));
    }

    #[test]
    fn uncalled_methods_emit_no_code() {
        let with_def = compile_inline("def unused(a, b) a + b end\nput_as_number 1");
        let without = compile_inline("put_as_number 1");
        // The def statement itself lowers to a nil push and a discard;
        // nothing of the body is emitted.
        assert_eq!(with_def.len(), without.len() + 2);
        assert!(!with_def.contains(&Return));
    }

    #[test]
    fn called_methods_emit_after_exit() {
        let ir = compile_inline("def f(n) n end\nput_as_number f(1)");
        let exit_at = ir.iter().position(|i| *i == Exit).unwrap();
        let ret_at = ir.iter().position(|i| *i == Return).unwrap();
        assert!(ret_at > exit_at, "method body must sit after the main EXIT");
    }

    #[test]
    fn zero_comparison_shortcuts_to_conditional_jump() {
        let ir = compile_inline("x = 1\nif x == 0 then put_as_number 1 end");
        assert!(ir.iter().any(|i| matches!(i, JumpZero(_))));
        // No rtest call for the shortcut shape: the only Calls would be
        // support routines, and this program needs none.
        assert!(!ir.iter().any(|i| matches!(i, Call(_))));
    }

    #[test]
    fn negative_comparison_shortcuts_to_jump_negative() {
        let ir = compile_inline("x = 1\nwhile x < 0 do x = x + 1 end");
        assert!(ir.iter().any(|i| matches!(i, JumpNegative(_))));
        assert!(!ir.iter().any(|i| matches!(i, Call(_))));
    }

    #[test]
    fn general_conditions_go_through_rtest() {
        let ir = compile_inline("if true then put_as_number 1 end");
        assert!(ir.iter().any(|i| matches!(i, Call(_))));
    }

    #[test]
    fn while_true_is_an_unconditional_jump() {
        let ir = compile_inline("while true do exit end");
        assert!(ir.iter().any(|i| matches!(i, Jump(_))));
        assert!(!ir.iter().any(|i| matches!(i, JumpZero(_) | JumpNegative(_))));
    }

    #[test]
    fn undefined_bareword_is_a_compile_error() {
        let err = compile_err("put_as_number missing(1)");
        assert!(matches!(
            err.error,
            Error::CompileError(CompileError::UndefinedName { .. })
        ));
    }

    #[test]
    fn arity_mismatch_is_a_compile_error() {
        let err = compile_err("def f(a) a end\nput_as_number f(1, 2)");
        assert!(matches!(
            err.error,
            Error::CompileError(CompileError::WrongArity { expected: 1, got: 2, .. })
        ));
    }

    #[test]
    fn dispatch_arity_mismatch_is_a_compile_error() {
        let err = compile_err("x = [1]\nx.push(1, 2)");
        assert!(matches!(
            err.error,
            Error::CompileError(CompileError::WrongArity { expected: 1, got: 2, .. })
        ));

        let err = compile_err("class Integer\n  def double\n    self * 2\n  end\nend\nput_as_number 3.double(1)");
        assert!(matches!(
            err.error,
            Error::CompileError(CompileError::WrongArity { expected: 0, got: 1, .. })
        ));
    }

    #[test]
    fn multichar_string_is_a_compile_error() {
        let err = compile_err("x = 'ab'");
        assert!(matches!(
            err.error,
            Error::CompileError(CompileError::MultiCharString { .. })
        ));
    }

    #[test]
    fn return_at_top_level_is_a_compile_error() {
        let err = compile_err("return 1");
        assert!(matches!(
            err.error,
            Error::CompileError(CompileError::ReturnOutsideMethod)
        ));
    }

    #[test]
    fn reopening_unknown_class_is_a_compile_error() {
        let err = compile_err("class Foo\n  def f\n    1\n  end\nend");
        assert!(matches!(
            err.error,
            Error::CompileError(CompileError::UnknownClass { .. })
        ));
    }

    #[test]
    fn raise_bakes_location_and_message() {
        let ir = compile_inline("raise \"boom\"");
        let printed: String = ir
            .iter()
            .zip(ir.iter().skip(1))
            .filter_map(|(a, b)| match (a, b) {
                (Push(n), PutChar) => {
                    char::from_u32(u32::try_from(n.clone()).ok()?)
                }
                _ => None,
            })
            .collect();
        assert_eq!(printed, "<inline>:1:1: boom (Error)\n");
    }

    #[test]
    fn labels_start_at_one() {
        let ir = compile_inline("if true then put_as_number 1 end");
        for inst in &ir {
            if let Mark(l) | Call(l) | Jump(l) | JumpZero(l) | JumpNegative(l) = inst
            {
                assert!(*l >= BigInt::from(1));
            }
        }
    }
}
