//! Single-pass compiler: AST to bytecode.
//!
//! The compiler walks the tree once, emitting into the current function's
//! chunk while it discovers scope structure. Function literals push a new
//! frame onto the frame stack; upvalue resolution recurses through the
//! enclosing frames, marking captured locals so scope exit knows whether
//! to emit `Pop` or `CloseUpvalue`.
//!
//! In-progress functions are registered with the VM as GC roots: compiling
//! interns strings, interning allocates, and allocation may collect.

use rivet_syntax::ast::{BinaryOp, FnLiteral, MatchArm, Node, NodeKind, UnaryOp};

use crate::permission::perm_kind_to_byte;

use super::chunk::Op;
use super::object::{function_mut, Obj, UpvalueDesc};
use super::value::Value;
use super::vm::Vm;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_BREAKS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Lambda,
}

struct Local {
    name: String,
    depth: u32,
    captured: bool,
}

struct LoopState {
    start: usize,
    depth: u32,
    break_jumps: Vec<usize>,
}

/// Per-function compilation state. The vector of these in [`Compiler`] is
/// the enclosing-function chain used for upvalue resolution.
struct FnState {
    function: *mut Obj,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
    current_loop: Option<LoopState>,
}

pub struct Compiler<'vm> {
    vm: &'vm mut Vm,
    states: Vec<FnState>,
    had_error: bool,
}

/// Compile a program into a script function. Returns `None` (after
/// reporting every diagnostic to stderr) if anything failed; the caller
/// must treat that as a compile-error exit.
pub fn compile(vm: &mut Vm, program: &Node) -> Option<*mut Obj> {
    let mut compiler = Compiler {
        vm,
        states: Vec::new(),
        had_error: false,
    };
    compiler.begin_function(FunctionKind::Script, None, &[], 0);
    compiler.compile_node(program);
    let function = compiler.finish_function(last_line(program));
    compiler.vm.compiler_roots.pop();

    if compiler.had_error {
        None
    } else {
        Some(function)
    }
}

fn last_line(node: &Node) -> u32 {
    match &node.kind {
        NodeKind::Program(stmts) | NodeKind::Block(stmts) => {
            stmts.last().map(last_line).unwrap_or(node.line)
        }
        _ => node.line,
    }
}

impl<'vm> Compiler<'vm> {
    // -----------------------------------------------------------------------
    // Function frames
    // -----------------------------------------------------------------------

    fn begin_function(
        &mut self,
        kind: FunctionKind,
        name: Option<&str>,
        params: &[String],
        line: u32,
    ) {
        let function = self.vm.alloc_function();
        self.vm.compiler_roots.push(function);

        let mut state = FnState {
            function,
            kind,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            current_loop: None,
        };
        // Slot 0 holds the callee; the compiler never resolves it.
        state.locals.push(Local {
            name: String::new(),
            depth: 0,
            captured: false,
        });
        self.states.push(state);

        if let Some(name) = name {
            let name_obj = self.vm.intern(name);
            function_mut(function).name = name_obj;
        }

        if !params.is_empty() {
            self.begin_scope();
            if params.len() > u8::MAX as usize {
                self.error(line, "Can't have more than 255 parameters.");
            }
            function_mut(function).arity = params.len().min(u8::MAX as usize) as u8;
            for param in params {
                self.add_local(param, line);
            }
        } else if kind != FunctionKind::Script {
            self.begin_scope();
        }
    }

    /// Emit the implicit `nil` return, install the collected upvalue
    /// descriptors, and pop the frame. The function stays rooted; the
    /// caller unroots after it has stored the function somewhere reachable.
    fn finish_function(&mut self, line: u32) -> *mut Obj {
        self.emit(Op::Nil, line);
        self.emit(Op::Return, line);
        let state = self.states.pop().expect("function frame underflow");
        function_mut(state.function).upvalues = state.upvalues;
        state.function
    }

    fn state(&self) -> &FnState {
        self.states.last().expect("no active function frame")
    }

    fn state_mut(&mut self) -> &mut FnState {
        self.states.last_mut().expect("no active function frame")
    }

    fn is_script_frame(&self) -> bool {
        self.states.len() == 1
    }

    // -----------------------------------------------------------------------
    // Emit helpers
    // -----------------------------------------------------------------------

    fn emit(&mut self, op: Op, line: u32) -> usize {
        let function = self.state().function;
        function_mut(function).chunk.emit(op, line)
    }

    fn code_len(&self) -> usize {
        function_mut(self.state().function).chunk.code.len()
    }

    fn make_constant(&mut self, value: Value, line: u32) -> u16 {
        let function = self.state().function;
        match function_mut(function).chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error(line, "Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value, line: u32) {
        let index = self.make_constant(value, line);
        self.emit(Op::Constant(index), line);
    }

    fn identifier_constant(&mut self, name: &str, line: u32) -> u16 {
        let name_obj = self.vm.intern(name);
        self.make_constant(Value::object(name_obj), line)
    }

    fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.emit(op, line)
    }

    fn patch_jump(&mut self, offset: usize, line: u32) {
        let function = self.state().function;
        if function_mut(function).chunk.patch_jump(offset).is_err() {
            self.error(line, "Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) {
        let distance = self.code_len() - loop_start + 1;
        if distance > u16::MAX as usize {
            self.error(line, "Loop body too large.");
        }
        self.emit(Op::Loop(distance as u16), line);
    }

    fn error(&mut self, line: u32, message: &str) {
        eprintln!("[line {}] Error: {}", line, message);
        self.had_error = true;
    }

    // -----------------------------------------------------------------------
    // Scopes and name resolution
    // -----------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let state = self.state_mut();
        state.scope_depth -= 1;
        let depth = state.scope_depth;
        while state
            .locals
            .last()
            .map(|local| local.depth > depth)
            .unwrap_or(false)
        {
            let captured = state.locals.pop().unwrap().captured;
            let function = state.function;
            let op = if captured { Op::CloseUpvalue } else { Op::Pop };
            function_mut(function).chunk.emit(op, line);
        }
    }

    fn add_local(&mut self, name: &str, line: u32) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error(line, "Too many local variables in function.");
            return;
        }
        let depth = self.state().scope_depth;
        self.state_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
        });
    }

    fn resolve_local(&self, state_index: usize, name: &str) -> Option<u8> {
        let state = &self.states[state_index];
        for (slot, local) in state.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some(slot as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool, line: u32) -> u8 {
        let upvalues = &self.states[state_index].upvalues;
        for (i, upvalue) in upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() == MAX_UPVALUES {
            self.error(line, "Too many closure variables in function.");
            return 0;
        }
        let upvalues = &mut self.states[state_index].upvalues;
        upvalues.push(UpvalueDesc { index, is_local });
        (upvalues.len() - 1) as u8
    }

    /// Find `name` in an enclosing function, threading an upvalue chain
    /// down to `state_index`. Marks the originating local as captured.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str, line: u32) -> Option<u8> {
        if state_index == 0 {
            return None;
        }
        let enclosing = state_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(state_index, local, true, line));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name, line) {
            return Some(self.add_upvalue(state_index, upvalue, false, line));
        }
        None
    }

    /// Emit a get or set for a name, resolving local, then upvalue, then
    /// global.
    fn compile_named_access(&mut self, name: &str, for_get: bool, line: u32) {
        let top = self.states.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            let op = if for_get {
                Op::GetLocal(slot)
            } else {
                Op::SetLocal(slot)
            };
            self.emit(op, line);
        } else if let Some(slot) = self.resolve_upvalue(top, name, line) {
            let op = if for_get {
                Op::GetUpvalue(slot)
            } else {
                Op::SetUpvalue(slot)
            };
            self.emit(op, line);
        } else {
            let index = self.identifier_constant(name, line);
            let op = if for_get {
                Op::GetGlobal(index)
            } else {
                Op::SetGlobal(index)
            };
            self.emit(op, line);
        }
    }

    // -----------------------------------------------------------------------
    // Statement lists and `on failure` lowering
    // -----------------------------------------------------------------------

    /// Compile a statement sequence. An `on failure` statement turns every
    /// *following* statement in the sequence into the protected region:
    ///
    ///   PUSH_HANDLER -> handler
    ///   <rest of the statements>
    ///   POP_HANDLER
    ///   JUMP -> end
    /// handler:
    ///   (error value pushed by the unwinder, bound as local `error`)
    ///   <handler body>
    /// end:
    fn compile_statements(&mut self, stmts: &[Node]) {
        for (i, stmt) in stmts.iter().enumerate() {
            if let NodeKind::OnFailure { body } = &stmt.kind {
                let line = stmt.line;
                let handler_jump = self.emit_jump(Op::PushHandler(0xffff), line);

                for protected in &stmts[i + 1..] {
                    self.compile_node(protected);
                }

                self.emit(Op::PopHandler, line);
                let end_jump = self.emit_jump(Op::Jump(0xffff), line);

                self.patch_jump(handler_jump, line);
                self.begin_scope();
                self.add_local("error", line);
                match &body.kind {
                    NodeKind::Block(handler_stmts) => self.compile_statements(handler_stmts),
                    _ => self.compile_node(body),
                }
                self.end_scope(line);
                self.patch_jump(end_jump, line);
                return;
            }
            self.compile_node(stmt);
        }
    }

    fn compile_block(&mut self, node: &Node) {
        match &node.kind {
            NodeKind::Block(stmts) => {
                self.begin_scope();
                self.compile_statements(stmts);
                self.end_scope(node.line);
            }
            _ => self.compile_node(node),
        }
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    fn compile_node(&mut self, node: &Node) {
        let line = node.line;
        match &node.kind {
            NodeKind::Number(n) => self.emit_constant(Value::number(*n), line),
            NodeKind::Str(s) => {
                let obj = self.vm.intern(s);
                self.emit_constant(Value::object(obj), line);
            }
            NodeKind::Bool(true) => {
                self.emit(Op::True, line);
            }
            NodeKind::Bool(false) => {
                self.emit(Op::False, line);
            }
            NodeKind::Nil => {
                self.emit(Op::Nil, line);
            }

            NodeKind::Variable(name) => self.compile_named_access(name, true, line),

            NodeKind::Unary { op, operand } => {
                self.compile_node(operand);
                match op {
                    UnaryOp::Negate => self.emit(Op::Negate, line),
                    UnaryOp::Not => self.emit(Op::Not, line),
                };
            }

            NodeKind::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs, line),

            NodeKind::Assign { name, value } => {
                self.compile_node(value);
                self.compile_named_access(name, false, line);
            }

            NodeKind::CompoundAssign { name, op, value } => {
                self.compile_named_access(name, true, line);
                self.compile_node(value);
                let op = match op {
                    BinaryOp::Add => Op::Add,
                    BinaryOp::Sub => Op::Subtract,
                    BinaryOp::Mul => Op::Multiply,
                    BinaryOp::Div => Op::Divide,
                    _ => Op::Add,
                };
                self.emit(op, line);
                self.compile_named_access(name, false, line);
            }

            NodeKind::Call { callee, args } => {
                self.compile_node(callee);
                for arg in args {
                    self.compile_node(arg);
                }
                self.emit(Op::Call(args.len().min(255) as u8), line);
            }

            NodeKind::Index { object, index } => {
                self.compile_node(object);
                self.compile_node(index);
                self.emit(Op::IndexGet, line);
            }

            NodeKind::IndexSet {
                object,
                index,
                value,
            } => {
                self.compile_node(object);
                self.compile_node(index);
                self.compile_node(value);
                self.emit(Op::IndexSet, line);
            }

            NodeKind::Dot { object, name } => {
                self.compile_node(object);
                let index = self.identifier_constant(name, line);
                self.emit(Op::GetProperty(index), line);
            }

            NodeKind::DotSet {
                object,
                name,
                value,
            } => {
                self.compile_node(object);
                self.compile_node(value);
                let index = self.identifier_constant(name, line);
                self.emit(Op::SetProperty(index), line);
            }

            NodeKind::List(elements) => {
                if elements.len() > u8::MAX as usize {
                    self.error(line, "Can't have more than 255 list elements.");
                }
                for element in elements {
                    self.compile_node(element);
                }
                self.emit(Op::BuildList(elements.len().min(255) as u8), line);
            }

            NodeKind::Map(entries) => {
                if entries.len() > u8::MAX as usize {
                    self.error(line, "Can't have more than 255 map entries.");
                }
                for (key, value) in entries {
                    self.compile_node(key);
                    self.compile_node(value);
                }
                self.emit(Op::BuildMap(entries.len().min(255) as u8), line);
            }

            NodeKind::Lambda(literal) => self.compile_function(literal, FunctionKind::Lambda, line),

            NodeKind::Pipe { lhs, rhs } => {
                // `a | f` is `f(a)`: callee first, then the argument.
                self.compile_node(rhs);
                self.compile_node(lhs);
                self.emit(Op::Call(1), line);
            }

            NodeKind::Range { start, end } => {
                let index = self.identifier_constant("range", line);
                self.emit(Op::GetGlobal(index), line);
                self.compile_node(start);
                self.compile_node(end);
                self.emit(Op::Call(2), line);
            }

            NodeKind::ExprStmt(expr) => {
                self.compile_node(expr);
                self.emit(Op::Pop, line);
            }

            NodeKind::Block(_) => self.compile_block(node),

            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_node(condition);
                let then_jump = self.emit_jump(Op::JumpIfFalse(0xffff), line);
                self.emit(Op::Pop, line);
                self.compile_block(then_branch);
                let else_jump = self.emit_jump(Op::Jump(0xffff), line);
                self.patch_jump(then_jump, line);
                self.emit(Op::Pop, line);
                if let Some(else_branch) = else_branch {
                    self.compile_block(else_branch);
                }
                self.patch_jump(else_jump, line);
            }

            NodeKind::While { condition, body } => self.compile_while(condition, body, line),

            NodeKind::For {
                var,
                iterable,
                body,
            } => self.compile_for(var, iterable, body, line),

            NodeKind::Return(value) => {
                if self.state().kind == FunctionKind::Script {
                    self.error(line, "Can't return from top-level code.");
                }
                match value {
                    Some(value) => self.compile_node(value),
                    None => {
                        self.emit(Op::Nil, line);
                    }
                }
                self.emit(Op::Return, line);
            }

            NodeKind::Break => {
                if self.state().current_loop.is_none() {
                    self.error(line, "Can't use 'break' outside a loop.");
                    return;
                }
                self.emit_loop_scope_cleanup(line);
                if self.state().current_loop.as_ref().unwrap().break_jumps.len() >= MAX_BREAKS {
                    self.error(line, "Too many break statements in loop.");
                    return;
                }
                let jump = self.emit_jump(Op::Jump(0xffff), line);
                self.state_mut()
                    .current_loop
                    .as_mut()
                    .unwrap()
                    .break_jumps
                    .push(jump);
            }

            NodeKind::Continue => {
                match self.state().current_loop.as_ref().map(|l| l.start) {
                    Some(start) => {
                        self.emit_loop_scope_cleanup(line);
                        self.emit_loop(start, line);
                    }
                    None => self.error(line, "Can't use 'continue' outside a loop."),
                }
            }

            NodeKind::VarDecl { name, initializer } => self.compile_var_decl(name, initializer, line),

            NodeKind::FnDecl(literal) => {
                self.compile_function(literal, FunctionKind::Function, line);
                let name = literal.name.as_deref().unwrap_or("");
                if self.state().scope_depth > 0 {
                    self.add_local(name, line);
                } else {
                    let index = self.identifier_constant(name, line);
                    self.emit(Op::DefineGlobal(index), line);
                }
            }

            NodeKind::Allow { perm, target } => {
                let target_obj = self.vm.intern(target);
                let index = self.make_constant(Value::object(target_obj), line);
                self.emit(Op::Allow(perm_kind_to_byte(*perm), index), line);
            }

            NodeKind::Parallel(tasks) => {
                // The block form runs sequentially; real concurrency comes
                // from the parallel_exec native over sub-processes.
                for task in tasks {
                    self.compile_node(task);
                }
            }

            NodeKind::OnFailure { .. } => {
                // Only meaningful inside a statement sequence; a bare
                // handler protects nothing.
            }

            NodeKind::Exec { command } => {
                let index = self.identifier_constant("exec", line);
                self.emit(Op::GetGlobal(index), line);
                self.compile_node(command);
                self.emit(Op::Call(1), line);
            }

            NodeKind::Import { path, alias } => {
                let path_obj = self.vm.intern(path);
                let path_index = self.make_constant(Value::object(path_obj), line);
                let name = match alias {
                    Some(alias) => alias.clone(),
                    None => module_name_from_path(path),
                };
                let name_index = self.identifier_constant(&name, line);
                self.emit(Op::Import(path_index, name_index), line);
            }

            NodeKind::Match { subject, arms } => self.compile_match(subject, arms, line),

            NodeKind::Program(stmts) => self.compile_statements(stmts),
        }
    }

    fn compile_binary(&mut self, op: BinaryOp, lhs: &Node, rhs: &Node, line: u32) {
        // Short-circuit forms first; JumpIfFalse leaving the condition on
        // the stack is what makes these three-instruction lowerings work.
        if op == BinaryOp::And {
            self.compile_node(lhs);
            let end_jump = self.emit_jump(Op::JumpIfFalse(0xffff), line);
            self.emit(Op::Pop, line);
            self.compile_node(rhs);
            self.patch_jump(end_jump, line);
            return;
        }
        if op == BinaryOp::Or {
            self.compile_node(lhs);
            let else_jump = self.emit_jump(Op::JumpIfFalse(0xffff), line);
            let end_jump = self.emit_jump(Op::Jump(0xffff), line);
            self.patch_jump(else_jump, line);
            self.emit(Op::Pop, line);
            self.compile_node(rhs);
            self.patch_jump(end_jump, line);
            return;
        }

        self.compile_node(lhs);
        self.compile_node(rhs);
        let op = match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Subtract,
            BinaryOp::Mul => Op::Multiply,
            BinaryOp::Div => Op::Divide,
            BinaryOp::Mod => Op::Modulo,
            BinaryOp::Eq => Op::Equal,
            BinaryOp::Ne => Op::NotEqual,
            BinaryOp::Lt => Op::Less,
            BinaryOp::Le => Op::LessEqual,
            BinaryOp::Gt => Op::Greater,
            BinaryOp::Ge => Op::GreaterEqual,
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        self.emit(op, line);
    }

    fn compile_while(&mut self, condition: &Node, body: &Node, line: u32) {
        let previous_loop = self.state_mut().current_loop.take();
        let loop_start = self.code_len();
        self.state_mut().current_loop = Some(LoopState {
            start: loop_start,
            depth: self.state().scope_depth,
            break_jumps: Vec::new(),
        });

        self.compile_node(condition);
        let exit_jump = self.emit_jump(Op::JumpIfFalse(0xffff), line);
        self.emit(Op::Pop, line);

        self.compile_block(body);

        self.emit_loop(loop_start, line);
        self.patch_jump(exit_jump, line);
        self.emit(Op::Pop, line);

        let finished = self.state_mut().current_loop.take().unwrap();
        for jump in finished.break_jumps {
            self.patch_jump(jump, line);
        }
        self.state_mut().current_loop = previous_loop;
    }

    /// `for v in iterable` desugars to an index walk over a hidden iterable
    /// local: `v = iterable[i]` while `i < iterable.length`.
    fn compile_for(&mut self, var: &str, iterable: &Node, body: &Node, line: u32) {
        let previous_loop = self.state_mut().current_loop.take();
        self.begin_scope();

        self.compile_node(iterable);
        self.add_local(" iterable", line);
        let iter_slot = (self.state().locals.len() - 1) as u8;

        self.emit_constant(Value::number(0.0), line);
        self.add_local(" index", line);
        let index_slot = (self.state().locals.len() - 1) as u8;

        self.emit(Op::Nil, line);
        self.add_local(var, line);
        let var_slot = (self.state().locals.len() - 1) as u8;

        let loop_start = self.code_len();
        self.state_mut().current_loop = Some(LoopState {
            start: loop_start,
            depth: self.state().scope_depth,
            break_jumps: Vec::new(),
        });

        // index < iterable.length
        self.emit(Op::GetLocal(index_slot), line);
        self.emit(Op::GetLocal(iter_slot), line);
        let length_const = self.identifier_constant("length", line);
        self.emit(Op::GetProperty(length_const), line);
        self.emit(Op::Less, line);
        let exit_jump = self.emit_jump(Op::JumpIfFalse(0xffff), line);
        self.emit(Op::Pop, line);

        // v = iterable[index]
        self.emit(Op::GetLocal(iter_slot), line);
        self.emit(Op::GetLocal(index_slot), line);
        self.emit(Op::IndexGet, line);
        self.emit(Op::SetLocal(var_slot), line);
        self.emit(Op::Pop, line);

        match &body.kind {
            NodeKind::Block(stmts) => {
                self.begin_scope();
                self.compile_statements(stmts);
                self.end_scope(line);
            }
            _ => self.compile_node(body),
        }

        // index = index + 1
        self.emit(Op::GetLocal(index_slot), line);
        self.emit_constant(Value::number(1.0), line);
        self.emit(Op::Add, line);
        self.emit(Op::SetLocal(index_slot), line);
        self.emit(Op::Pop, line);

        self.emit_loop(loop_start, line);
        self.patch_jump(exit_jump, line);
        self.emit(Op::Pop, line);

        let finished = self.state_mut().current_loop.take().unwrap();
        for jump in finished.break_jumps {
            self.patch_jump(jump, line);
        }

        self.end_scope(line);
        self.state_mut().current_loop = previous_loop;
    }

    /// Pop block-scoped locals before a break/continue jump so the runtime
    /// stack matches the loop's entry depth no matter where the jump fires.
    fn emit_loop_scope_cleanup(&mut self, line: u32) {
        let loop_depth = match self.state().current_loop.as_ref() {
            Some(current) => current.depth,
            None => return,
        };
        let state = self.state();
        let ops: Vec<Op> = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_depth)
            .map(|local| {
                if local.captured {
                    Op::CloseUpvalue
                } else {
                    Op::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit(op, line);
        }
    }

    fn compile_var_decl(&mut self, name: &str, initializer: &Node, line: u32) {
        self.compile_node(initializer);

        if self.state().scope_depth > 0 {
            // Assign-or-declare: update an existing binding when one is in
            // scope, otherwise create one.
            let top = self.states.len() - 1;
            if let Some(slot) = self.resolve_local(top, name) {
                self.emit(Op::SetLocal(slot), line);
                self.emit(Op::Pop, line);
                return;
            }
            if let Some(slot) = self.resolve_upvalue(top, name, line) {
                self.emit(Op::SetUpvalue(slot), line);
                self.emit(Op::Pop, line);
                return;
            }
            if !self.is_script_frame() {
                self.add_local(name, line);
            } else {
                // Top-level code inside a block: the script itself is the
                // enclosing function, and users expect `x = 1` inside an
                // if/for at top level to survive the block. Define-or-update
                // the global.
                let index = self.identifier_constant(name, line);
                self.emit(Op::SetGlobal(index), line);
                self.emit(Op::Pop, line);
            }
        } else {
            let index = self.identifier_constant(name, line);
            self.emit(Op::DefineGlobal(index), line);
        }
    }

    fn compile_function(&mut self, literal: &FnLiteral, kind: FunctionKind, line: u32) {
        self.begin_function(kind, literal.name.as_deref(), &literal.params, line);

        match &literal.body.kind {
            NodeKind::Block(stmts) => self.compile_statements(stmts),
            _ => self.compile_node(&literal.body),
        }

        let function = self.finish_function(last_line(&literal.body));
        let index = self.make_constant(Value::object(function), line);
        self.emit(Op::Closure(index), line);
        // Now reachable through the enclosing chunk's constant pool.
        self.vm.compiler_roots.pop();
    }

    /// Lower a match expression. The subject lives in a hidden local so
    /// every arm re-reads it without re-evaluating; at the end the result
    /// overwrites that slot and the scope collapses without popping, so the
    /// result *is* the expression value.
    fn compile_match(&mut self, subject: &Node, arms: &[MatchArm], line: u32) {
        self.begin_scope();
        self.compile_node(subject);
        self.add_local(" match", line);
        let subject_slot = (self.state().locals.len() - 1) as u8;

        let mut end_jumps = Vec::with_capacity(arms.len());
        for arm in arms {
            match &arm.pattern {
                None => {
                    // Wildcard: always matches.
                    self.compile_arm_body(&arm.body, line);
                    end_jumps.push(self.emit_jump(Op::Jump(0xffff), line));
                }
                Some(pattern) => {
                    self.emit(Op::GetLocal(subject_slot), line);
                    self.compile_node(pattern);
                    self.emit(Op::Equal, line);
                    let next_arm = self.emit_jump(Op::JumpIfFalse(0xffff), line);
                    self.emit(Op::Pop, line);

                    self.compile_arm_body(&arm.body, line);
                    end_jumps.push(self.emit_jump(Op::Jump(0xffff), line));

                    self.patch_jump(next_arm, line);
                    self.emit(Op::Pop, line);
                }
            }
        }

        // No arm matched.
        self.emit(Op::Nil, line);

        for jump in end_jumps {
            self.patch_jump(jump, line);
        }

        // Park the result in the subject slot and collapse the scope by
        // hand; an end_scope here would pop the result off the stack.
        self.emit(Op::SetLocal(subject_slot), line);
        self.emit(Op::Pop, line);
        let state = self.state_mut();
        state.scope_depth -= 1;
        state.locals.pop();
    }

    fn compile_arm_body(&mut self, body: &Node, line: u32) {
        match &body.kind {
            NodeKind::Block(_) => {
                // Block arms evaluate for effect; every arm must leave
                // exactly one value.
                self.compile_block(body);
                self.emit(Op::Nil, line);
            }
            _ => self.compile_node(body),
        }
    }
}

/// Default module binding name: last path segment, extension stripped.
fn module_name_from_path(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    let base = base.strip_suffix(".rvt").unwrap_or(base);
    base.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object::function_ref;
    use crate::vm::Vm;

    fn compile_source(vm: &mut Vm, source: &str) -> *mut Obj {
        let program = rivet_syntax::parse(source).expect("parse failed");
        compile(vm, &program).expect("compile failed")
    }

    fn ops(function: *mut Obj) -> Vec<Op> {
        function_ref(function).chunk.code.clone()
    }

    #[test]
    fn module_name_defaults() {
        assert_eq!(module_name_from_path("lib/utils.rvt"), "utils");
        assert_eq!(module_name_from_path("m"), "m");
        assert_eq!(module_name_from_path("a/b/c"), "c");
    }

    #[test]
    fn top_level_assignment_defines_global() {
        let mut vm = Vm::new();
        let function = compile_source(&mut vm, "x = 1");
        assert!(ops(function).contains(&Op::DefineGlobal(1)));
    }

    #[test]
    fn top_level_block_assignment_sets_global() {
        // Inside a block at top level the binding must escape the block,
        // so it compiles as a global store, not a local.
        let mut vm = Vm::new();
        let function = compile_source(&mut vm, "if true {\n  y = 1\n}");
        let code = ops(function);
        assert!(code.iter().any(|op| matches!(op, Op::SetGlobal(_))));
        assert!(!code.iter().any(|op| matches!(op, Op::SetLocal(_))));
    }

    #[test]
    fn function_block_assignment_is_local() {
        let mut vm = Vm::new();
        let function = compile_source(&mut vm, "fn f() {\n  y = 1\n  return y\n}");
        // The inner function is a constant of the script chunk.
        let inner = function_ref(function)
            .chunk
            .constants
            .iter()
            .find(|c| c.is_function())
            .copied()
            .expect("inner function constant");
        let code = function_ref(inner.as_obj()).chunk.code.clone();
        assert!(code.iter().any(|op| matches!(op, Op::GetLocal(_))));
        assert!(!code.iter().any(|op| matches!(op, Op::SetGlobal(_))));
    }

    #[test]
    fn and_lowering_shape() {
        let mut vm = Vm::new();
        let function = compile_source(&mut vm, "r = a and b");
        let code = ops(function);
        // a; JumpIfFalse; Pop; b — the jump must precede a single pop.
        let jump_at = code
            .iter()
            .position(|op| matches!(op, Op::JumpIfFalse(_)))
            .expect("and compiles a conditional jump");
        assert_eq!(code[jump_at + 1], Op::Pop);
    }

    #[test]
    fn closure_captures_enclosing_local() {
        let source = "fn mk() {\n  n = 0\n  return fn() {\n    n = n + 1\n    return n\n  }\n}";
        let mut vm = Vm::new();
        let script = compile_source(&mut vm, source);
        let mk = function_ref(script)
            .chunk
            .constants
            .iter()
            .find(|c| c.is_function())
            .copied()
            .expect("mk function");
        let inner = function_ref(mk.as_obj())
            .chunk
            .constants
            .iter()
            .find(|c| c.is_function())
            .copied()
            .expect("inner lambda");
        let desc = &function_ref(inner.as_obj()).upvalues;
        assert_eq!(desc.len(), 1);
        assert!(desc[0].is_local);
        // The lambda reads and writes through the upvalue.
        let code = function_ref(inner.as_obj()).chunk.code.clone();
        assert!(code.contains(&Op::GetUpvalue(0)));
        assert!(code.contains(&Op::SetUpvalue(0)));
    }

    #[test]
    fn upvalues_deduplicate() {
        let source = "fn mk() {\n  n = 0\n  return fn() { return n + n }\n}";
        let mut vm = Vm::new();
        let script = compile_source(&mut vm, source);
        let mk = function_ref(script)
            .chunk
            .constants
            .iter()
            .find(|c| c.is_function())
            .copied()
            .unwrap();
        let inner = function_ref(mk.as_obj())
            .chunk
            .constants
            .iter()
            .find(|c| c.is_function())
            .copied()
            .unwrap();
        assert_eq!(function_ref(inner.as_obj()).upvalues.len(), 1);
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        let mut vm = Vm::new();
        let program = rivet_syntax::parse("return 1").unwrap();
        assert!(compile(&mut vm, &program).is_none());
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let mut vm = Vm::new();
        let program = rivet_syntax::parse("break").unwrap();
        assert!(compile(&mut vm, &program).is_none());
    }

    #[test]
    fn on_failure_emits_handler_pair() {
        let mut vm = Vm::new();
        let function = compile_source(&mut vm, "on failure {\n  print(error)\n}\nx = 1 / 0");
        let code = ops(function);
        assert!(code.iter().any(|op| matches!(op, Op::PushHandler(_))));
        assert!(code.contains(&Op::PopHandler));
    }
}
