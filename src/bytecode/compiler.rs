// =============================================================================
// COMPILER - Single-pass Pratt parser emitting bytecode directly
// =============================================================================

use arrayvec::ArrayVec;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::Op;
use crate::frontend::scanner::{Scanner, Token, TokenKind};
use crate::lang::value::Value;
use crate::runtime::object::{FunctionProto, Handle, Heap, Obj};

pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = 256;
const MAX_ARITY: usize = 255;

/// Compile a source string into the top-level script function.
///
/// There is no syntax tree: the parser emits instructions as it recognizes
/// each construct. On error it recovers at the next statement boundary and
/// keeps parsing, so the `Err` side carries every diagnostic found in one
/// pass. Nothing is executed either way.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Handle, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

/// Binding strength, weakest first. Each infix rule parses its right operand
/// at one level above its own, which makes the binary operators
/// left-associative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    /// Captured locals close into a heap cell when they leave scope instead
    /// of being popped.
    captured: bool,
}

/// How an enclosed function reaches one captured variable: either a local
/// slot of the directly enclosing function, or one of the enclosing
/// function's own upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CaptureSpec {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Per-function compilation state. Nested function declarations push a fresh
/// context; finishing one pops it and emits the closure into the enclosing
/// context.
struct FuncCtx<'src> {
    proto: FunctionProto,
    kind: FunctionKind,
    locals: ArrayVec<Local<'src>, MAX_LOCALS>,
    upvalues: ArrayVec<CaptureSpec, MAX_UPVALUES>,
    scope_depth: i32,
}

impl<'src> FuncCtx<'src> {
    fn new(proto: FunctionProto, kind: FunctionKind) -> Self {
        let mut locals = ArrayVec::new();
        // Slot 0 holds the function object itself; methods expose it as
        // `this`, elsewhere the empty name keeps it unresolvable.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        locals.push(Local {
            name: slot_zero,
            depth: 0,
            captured: false,
        });
        FuncCtx {
            proto,
            kind,
            locals,
            upvalues: ArrayVec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    heap: &'h mut Heap,
    ctxs: Vec<FuncCtx<'src>>,
    classes: Vec<ClassCtx>,
    errors: Vec<CompileError>,
    /// Set on the first error of a statement; suppresses the cascade until
    /// the parser resynchronizes.
    panic_mode: bool,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let script_name = heap.intern("");
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Compiler {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            heap,
            ctxs: vec![FuncCtx::new(
                FunctionProto::new(script_name),
                FunctionKind::Script,
            )],
            classes: Vec::new(),
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    fn finish(mut self) -> Result<Handle, Vec<CompileError>> {
        self.emit_return();
        let ctx = self.ctxs.pop().expect("script context missing");
        if self.errors.is_empty() {
            Ok(self.heap.alloc(Obj::Function(ctx.proto)))
        } else {
            Err(self.errors)
        }
    }

    // ------------------------------------------------------------------ tokens

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            // Error tokens carry their diagnostic as the lexeme.
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            let token = self.current;
            self.error_at(token, message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------ errors

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let message = match token.kind {
            TokenKind::Eof => format!("at end: {}", message),
            TokenKind::Error => message.to_string(),
            _ => format!("at '{}': {}", token.lexeme, message),
        };
        self.errors.push(CompileError::new(token.line, message));
    }

    /// Skip forward to the next statement boundary so one mistake produces
    /// one diagnostic.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---------------------------------------------------------------- emitting

    fn ctx(&self) -> &FuncCtx<'src> {
        self.ctxs.last().expect("no active function context")
    }

    fn ctx_mut(&mut self) -> &mut FuncCtx<'src> {
        self.ctxs.last_mut().expect("no active function context")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.ctx_mut().proto.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, a: Op, b: Op) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_return(&mut self) {
        if self.ctx().kind == FunctionKind::Initializer {
            // An initializer always returns its receiver.
            self.emit_op(Op::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        // Reuse an existing pool entry with the same value.
        if let Some(idx) = self
            .chunk()
            .constants
            .iter()
            .position(|existing| *existing == value)
        {
            return idx as u8;
        }
        if self.chunk().constants.len() >= MAX_CONSTANTS {
            self.error("too many constants in one function");
            return 0;
        }
        self.chunk().add_constant(value) as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op(Op::Constant);
        self.emit_byte(idx);
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // The offset is measured from just past the two operand bytes.
        let distance = self.chunk().len() - offset - 2;
        if distance > u16::MAX as usize {
            self.error("too much code to jump over");
            return;
        }
        self.chunk().patch_u16(offset, distance as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let distance = self.chunk().len() - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("loop body too large");
            return;
        }
        let [hi, lo] = (distance as u16).to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
    }

    // --------------------------------------------------------------- variables

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Str(interned))
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.ctx().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn declare_variable(&mut self) {
        if self.ctx().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        let ctx = self.ctx();
        for local in ctx.locals.iter().rev() {
            if local.depth != -1 && local.depth < ctx.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("already a variable with this name in this scope");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.ctx().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        self.ctx_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let ctx = self.ctx_mut();
        if ctx.scope_depth == 0 {
            return;
        }
        if let Some(local) = ctx.locals.last_mut() {
            local.depth = ctx.scope_depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.ctx().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(Op::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, ctx_idx: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (slot, local) in self.ctxs[ctx_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((slot, local.depth));
                break;
            }
        }
        match found {
            Some((_, -1)) => {
                self.error("cannot read local variable in its own initializer");
                Some(0)
            }
            Some((slot, _)) => Some(slot as u8),
            None => None,
        }
    }

    /// Walk outward through the enclosing functions looking for `name`,
    /// threading a capture through every function on the way in. Returns the
    /// upvalue index in context `ctx_idx`.
    fn resolve_upvalue(&mut self, ctx_idx: usize, name: &str) -> Option<u8> {
        if ctx_idx == 0 {
            return None;
        }
        let enclosing = ctx_idx - 1;
        if let Some(slot) = self.resolve_local(enclosing, name) {
            self.ctxs[enclosing].locals[slot as usize].captured = true;
            return Some(self.add_upvalue(ctx_idx, slot, true));
        }
        if let Some(index) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(ctx_idx, index, false));
        }
        None
    }

    fn add_upvalue(&mut self, ctx_idx: usize, index: u8, is_local: bool) -> u8 {
        let spec = CaptureSpec { index, is_local };
        let ctx = &mut self.ctxs[ctx_idx];
        // A variable captured twice gets one cell.
        if let Some(existing) = ctx.upvalues.iter().position(|up| *up == spec) {
            return existing as u8;
        }
        if ctx.upvalues.len() >= MAX_UPVALUES {
            self.error("too many closure variables in function");
            return 0;
        }
        ctx.upvalues.push(spec);
        ctx.proto.upvalue_count = ctx.upvalues.len();
        (ctx.upvalues.len() - 1) as u8
    }

    /// Resolution order is local, then upvalue, then global; a name that
    /// resolves to nothing at compile time is assumed global and checked at
    /// run time.
    fn named_variable(&mut self, name_token: Token<'src>, can_assign: bool) {
        let name = name_token.lexeme;
        let top = self.ctxs.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (Op::GetLocal, Op::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (Op::GetUpvalue, Op::SetUpvalue, index)
        } else {
            let idx = self.identifier_constant(name);
            (Op::GetGlobal, Op::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_byte(arg);
    }

    fn synthetic(&self, lexeme: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Identifier,
            lexeme,
            line: self.previous.line,
        }
    }

    // ------------------------------------------------------------ declarations

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("expected variable name");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "expected ';' after variable declaration",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("expected function name");
        // Initialized before the body compiles so the function can recurse.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.ctxs.push(FuncCtx::new(FunctionProto::new(name), kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.ctx().proto.arity as usize >= MAX_ARITY {
                    self.error_at_current("cannot have more than 255 parameters");
                } else {
                    self.ctx_mut().proto.arity += 1;
                }
                let constant = self.parse_variable("expected parameter name");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();

        // No end_scope: the VM discards the whole frame on return.
        self.emit_return();
        let ctx = self.ctxs.pop().expect("function context missing");
        let handle = self.heap.alloc(Obj::Function(ctx.proto));
        let idx = self.make_constant(Value::Obj(handle));
        self.emit_op(Op::Closure);
        self.emit_byte(idx);
        for up in &ctx.upvalues {
            let is_local = if up.is_local { 1 } else { 0 };
            let index = up.index;
            self.emit_byte(is_local);
            self.emit_byte(index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable();

        self.emit_op(Op::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCtx {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let superclass = self.previous;
            self.named_variable(superclass, false);
            if name_token.lexeme == superclass.lexeme {
                self.error("a class cannot inherit from itself");
            }

            // `super` lives in a hidden scope around the class body so every
            // method closes over the superclass seen at definition time.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(name_token, false);
            self.emit_op(Op::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(name_token, false);
        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(Op::Pop);

        let had_superclass = self
            .classes
            .pop()
            .map(|class| class.has_superclass)
            .unwrap_or(false);
        if had_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "expected method name");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op(Op::Method);
        self.emit_byte(constant);
    }

    // -------------------------------------------------------------- statements

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx_mut().scope_depth -= 1;
        loop {
            let ctx = self.ctx();
            let Some(local) = ctx.locals.last() else {
                break;
            };
            if local.depth <= ctx.scope_depth {
                break;
            }
            let captured = local.captured;
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
            self.ctx_mut().locals.pop();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    /// Desugared to initializer, condition, body, increment with plain jumps;
    /// the increment clause compiles before the body but runs after it.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.ctx().kind == FunctionKind::Script {
            self.error("cannot return from top-level code");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.ctx().kind == FunctionKind::Initializer {
                self.error("cannot return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(Op::Return);
        }
    }

    // ------------------------------------------------------------- expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt core: one prefix rule for the leading token, then infix
    /// rules while the next operator binds at least as strongly as `prec`.
    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("expected expression");
            return;
        };

        // Assignment is only valid when nothing stronger has bound the left
        // side first.
        let can_assign = prec <= Precedence::Assignment;
        prefix(self, can_assign);

        while prec <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'h>>,
            Option<ParseFn<'src, 'h>>,
            Precedence,
        ) = match kind {
            TokenKind::LeftParen => (
                Some(Self::grouping),
                Some(Self::call),
                Precedence::Call,
            ),
            TokenKind::Dot => (None, Some(Self::dot), Precedence::Call),
            TokenKind::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => (None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Star => {
                (None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::Bang => (Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                (None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => (None, Some(Self::binary), Precedence::Comparison),
            TokenKind::Identifier => (Some(Self::variable), None, Precedence::None),
            TokenKind::String => (Some(Self::string), None, Precedence::None),
            TokenKind::Number => (Some(Self::number), None, Precedence::None),
            TokenKind::And => (None, Some(Self::and), Precedence::And),
            TokenKind::Or => (None, Some(Self::or), Precedence::Or),
            TokenKind::Nil | TokenKind::True | TokenKind::False => {
                (Some(Self::literal), None, Precedence::None)
            }
            TokenKind::This => (Some(Self::this), None, Precedence::None),
            TokenKind::Super => (Some(Self::super_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner produced a malformed number lexeme");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(content);
        self.emit_constant(Value::Str(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(Op::Nil),
            TokenKind::True => self.emit_op(Op::True),
            TokenKind::False => self.emit_op(Op::False),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let token = self.previous;
        self.named_variable(token, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::BangEqual => self.emit_ops(Op::Equal, Op::Not),
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => self.emit_ops(Op::Less, Op::Not),
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => self.emit_ops(Op::Greater, Op::Not),
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        // Left operand is already on the stack; skip the right operand when
        // it is falsey, leaving the left operand as the result.
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(Op::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Op::SetProperty);
            self.emit_byte(name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property-call: looks the method up and calls it without
            // materializing a bound method.
            let arg_count = self.argument_list();
            self.emit_op(Op::Invoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(Op::GetProperty);
            self.emit_byte(name);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("cannot use 'this' outside of a class");
            return;
        }
        let token = self.previous;
        self.named_variable(token, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("cannot use 'super' outside of a class"),
            Some(class) if !class.has_superclass => {
                self.error("cannot use 'super' in a class with no superclass");
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "expected '.' after 'super'");
        self.consume(TokenKind::Identifier, "expected superclass method name");
        let name = self.identifier_constant(self.previous.lexeme);

        let this_token = self.synthetic("this");
        let super_token = self.synthetic("super");
        self.named_variable(this_token, false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_op(Op::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(super_token, false);
            self.emit_op(Op::GetSuper);
            self.emit_byte(name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARITY {
                    self.error("cannot have more than 255 arguments");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        count as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::new();
        let handle = compile(source, &mut heap).expect("compilation failed");
        (heap, handle)
    }

    fn compile_errors(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("compilation unexpectedly succeeded")
    }

    #[test]
    fn test_expression_statement_bytecode() {
        let (heap, handle) = compile_ok("1 + 2;");
        let chunk = &heap.function(handle).chunk;
        assert_eq!(
            chunk.code,
            vec![
                Op::Constant as u8,
                0,
                Op::Constant as u8,
                1,
                Op::Add as u8,
                Op::Pop as u8,
                Op::Nil as u8,
                Op::Return as u8,
            ]
        );
        assert_eq!(chunk.constants[0], Value::Number(1.0));
        assert_eq!(chunk.constants[1], Value::Number(2.0));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let source = "fun f(a, b) { return a + b; } print f(1, 2);";
        let (heap_a, a) = compile_ok(source);
        let (heap_b, b) = compile_ok(source);
        assert_eq!(heap_a.function(a).chunk.code, heap_b.function(b).chunk.code);
    }

    #[test]
    fn test_precedence_orders_multiplication_before_addition() {
        let (heap, handle) = compile_ok("1 + 2 * 3;");
        let chunk = &heap.function(handle).chunk;
        // 2 * 3 reduces before the addition.
        let mul = chunk
            .code
            .iter()
            .position(|&b| b == Op::Multiply as u8)
            .unwrap();
        let add = chunk.code.iter().position(|&b| b == Op::Add as u8).unwrap();
        assert!(mul < add);
    }

    #[test]
    fn test_comparison_compound_operators_rewrite() {
        let (heap, handle) = compile_ok("1 <= 2;");
        let chunk = &heap.function(handle).chunk;
        // a <= b compiles to !(a > b)
        assert!(chunk.code.contains(&(Op::Greater as u8)));
        assert!(chunk.code.contains(&(Op::Not as u8)));
    }

    #[test]
    fn test_function_declaration_emits_closure() {
        let (heap, handle) = compile_ok("fun f() {}");
        let chunk = &heap.function(handle).chunk;
        assert!(chunk.code.contains(&(Op::Closure as u8)));
        // the nested prototype sits in the constant pool
        assert!(chunk
            .constants
            .iter()
            .any(|c| matches!(c, Value::Obj(_))));
    }

    #[test]
    fn test_method_call_fuses_into_invoke() {
        let (heap, handle) = compile_ok("klass.method(1);");
        let chunk = &heap.function(handle).chunk;
        assert!(chunk.code.contains(&(Op::Invoke as u8)));
        assert!(!chunk.code.contains(&(Op::GetProperty as u8)));
    }

    #[test]
    fn test_property_read_without_call_is_not_fused() {
        let (heap, handle) = compile_ok("var m = klass.method;");
        let chunk = &heap.function(handle).chunk;
        assert!(chunk.code.contains(&(Op::GetProperty as u8)));
        assert!(!chunk.code.contains(&(Op::Invoke as u8)));
    }

    #[test]
    fn test_one_pass_reports_multiple_errors() {
        let errors = compile_errors("print;\nprint;");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[1].line, 2);
        assert!(errors[0].message.contains("expected expression"));
    }

    #[test]
    fn test_duplicate_local_in_same_scope_is_an_error() {
        let errors = compile_errors("{ var a = 1; var a = 2; }");
        assert!(errors[0]
            .message
            .contains("already a variable with this name in this scope"));
    }

    #[test]
    fn test_shadowing_in_inner_scope_is_allowed() {
        compile_ok("{ var a = 1; { var a = 2; } }");
    }

    #[test]
    fn test_local_reading_itself_in_initializer_is_an_error() {
        let errors = compile_errors("{ var a = a; }");
        assert!(errors[0]
            .message
            .contains("cannot read local variable in its own initializer"));
    }

    #[test]
    fn test_global_initializer_may_reference_shadowed_global() {
        // At global scope the name resolves at run time, so this compiles.
        compile_ok("var a = a;");
    }

    #[test]
    fn test_invalid_assignment_target_is_an_error() {
        let errors = compile_errors("1 + 2 = 3;");
        assert!(errors[0].message.contains("invalid assignment target"));
    }

    #[test]
    fn test_return_outside_function_is_an_error() {
        let errors = compile_errors("return 1;");
        assert!(errors[0].message.contains("cannot return from top-level code"));
    }

    #[test]
    fn test_return_with_value_from_initializer_is_an_error() {
        let errors = compile_errors("class A { init() { return 1; } }");
        assert!(errors[0]
            .message
            .contains("cannot return a value from an initializer"));
    }

    #[test]
    fn test_bare_return_from_initializer_is_allowed() {
        compile_ok("class A { init() { return; } }");
    }

    #[test]
    fn test_this_outside_class_is_an_error() {
        let errors = compile_errors("print this;");
        assert!(errors[0].message.contains("cannot use 'this' outside of a class"));
    }

    #[test]
    fn test_super_outside_class_is_an_error() {
        let errors = compile_errors("print super.m;");
        assert!(errors[0]
            .message
            .contains("cannot use 'super' outside of a class"));
    }

    #[test]
    fn test_super_without_superclass_is_an_error() {
        let errors = compile_errors("class A { m() { return super.m(); } }");
        assert!(errors[0]
            .message
            .contains("cannot use 'super' in a class with no superclass"));
    }

    #[test]
    fn test_class_inheriting_from_itself_is_an_error() {
        let errors = compile_errors("class A < A {}");
        assert!(errors[0].message.contains("a class cannot inherit from itself"));
    }

    #[test]
    fn test_too_many_constants_in_one_function() {
        // 256 distinct literals overflow the one-byte pool index.
        let mut source = String::new();
        for i in 0..260 {
            source.push_str(&format!("print {}.{};\n", i, i));
        }
        let errors = compile_errors(&source);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("too many constants in one function")));
    }

    #[test]
    fn test_repeated_literal_shares_one_constant() {
        let (heap, handle) = compile_ok("print 7; print 7; print 7;");
        let chunk = &heap.function(handle).chunk;
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn test_too_many_arguments_is_an_error() {
        let args = (0..256).map(|_| "1").collect::<Vec<_>>().join(", ");
        let errors = compile_errors(&format!("f({});", args));
        assert!(errors[0]
            .message
            .contains("cannot have more than 255 arguments"));
    }

    #[test]
    fn test_too_many_parameters_is_an_error() {
        let params = (0..256)
            .map(|i| format!("p{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let errors = compile_errors(&format!("fun f({}) {{}}", params));
        assert!(errors
            .iter()
            .any(|e| e.message.contains("cannot have more than 255 parameters")));
    }

    #[test]
    fn test_too_many_locals_in_one_function_is_an_error() {
        // Slot zero is reserved, so the 256th declaration overflows.
        let mut source = String::from("{\n");
        for i in 0..300 {
            source.push_str(&format!("var l{} = 0;\n", i));
        }
        source.push('}');
        let errors = compile_errors(&source);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("too many local variables in function")));
    }

    #[test]
    fn test_too_many_upvalues_in_one_function_is_an_error() {
        // No single function can hold 257 locals, so the innermost function
        // overflows by capturing across two enclosing scopes.
        let mut source = String::from("fun outer() {\n");
        for i in 0..200 {
            source.push_str(&format!("var a{} = 0;\n", i));
        }
        source.push_str("fun middle() {\n");
        for i in 0..100 {
            source.push_str(&format!("var b{} = 0;\n", i));
        }
        source.push_str("fun inner() {\n");
        for i in 0..200 {
            source.push_str(&format!("a{};\n", i));
        }
        for i in 0..100 {
            source.push_str(&format!("b{};\n", i));
        }
        source.push_str("}\n}\n}\n");
        let errors = compile_errors(&source);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("too many closure variables in function")));
    }

    #[test]
    fn test_jump_distance_overflowing_u16_is_an_error() {
        // A then-branch longer than 65535 bytes cannot be backpatched.
        let mut source = String::from("var a = 0;\nif (true) {\n");
        for _ in 0..15000 {
            source.push_str("a = 1;\n");
        }
        source.push('}');
        let errors = compile_errors(&source);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("too much code to jump over")));
    }

    #[test]
    fn test_scanner_errors_surface_as_compile_errors() {
        let errors = compile_errors("var a = @;");
        assert!(errors[0].message.contains("unexpected character"));
    }

    #[test]
    fn test_error_recovery_continues_past_bad_statement() {
        // the second statement is fine, the first and third are not
        let errors = compile_errors("print;\nprint 1;\nvar = 2;");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_upvalue_capture_emits_capture_specs() {
        let (heap, handle) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let script = &heap.function(handle).chunk;
        let outer_handle = script
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(h) => Some(*h),
                _ => None,
            })
            .unwrap();
        let outer = heap.function(outer_handle);
        let inner_handle = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(h) => Some(*h),
                _ => None,
            })
            .unwrap();
        assert_eq!(heap.function(inner_handle).upvalue_count, 1);
        // outer's Closure instruction is followed by (is_local, index) pairs
        assert!(outer.chunk.code.contains(&(Op::Closure as u8)));
    }

    #[test]
    fn test_transitive_capture_threads_through_middle_function() {
        let (heap, handle) = compile_ok(
            "fun a() { var x = 1; fun b() { fun c() { return x; } return c; } return b; }",
        );
        fn first_proto(chunk: &Chunk) -> Handle {
            chunk
                .constants
                .iter()
                .find_map(|c| match c {
                    Value::Obj(h) => Some(*h),
                    _ => None,
                })
                .unwrap()
        }
        let a = first_proto(&heap.function(handle).chunk);
        let b = first_proto(&heap.function(a).chunk);
        let c = first_proto(&heap.function(b).chunk);
        // both the middle and inner functions carry one capture
        assert_eq!(heap.function(b).upvalue_count, 1);
        assert_eq!(heap.function(c).upvalue_count, 1);
    }

    #[test]
    fn test_captured_local_closes_instead_of_popping() {
        let (heap, handle) = compile_ok(
            "{ var x = 1; fun f() { return x; } }",
        );
        let chunk = &heap.function(handle).chunk;
        assert!(chunk.code.contains(&(Op::CloseUpvalue as u8)));
    }

    #[test]
    fn test_jump_operands_are_patched() {
        let (heap, handle) = compile_ok("if (true) { print 1; } else { print 2; }");
        let chunk = &heap.function(handle).chunk;
        let jif = chunk
            .code
            .iter()
            .position(|&b| b == Op::JumpIfFalse as u8)
            .unwrap();
        // the placeholder must have been overwritten with a real offset
        let offset = chunk.read_u16(jif + 1);
        assert_ne!(offset, 0xFFFF);
        assert!((offset as usize) < chunk.len());
    }

    #[test]
    fn test_empty_source_compiles_to_bare_return() {
        let (heap, handle) = compile_ok("");
        let chunk = &heap.function(handle).chunk;
        assert_eq!(chunk.code, vec![Op::Nil as u8, Op::Return as u8]);
    }
}
