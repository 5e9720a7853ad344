//! The single-pass compiler: a Pratt parser that emits bytecode
//! directly into the function under construction.
//!
//! Parsing and code generation are fused. A stack of function compilers
//! tracks nesting; each frame owns its locals, upvalues, scope depth and
//! loop scaffolding. A parallel stack of class compilers tracks `this`
//! and `super` validity. On error the parser enters panic mode and
//! suppresses further diagnostics until a statement boundary.

use std::rc::Rc;

use fer_core::{
    Chunk, CompileError, CompileErrors, ErrorAt, GcRef, Heap, Obj, ObjFunction, Op, Value,
};

use crate::disasm;
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

/// Maximum locals and upvalues per function: operands are one byte.
const UINT8_COUNT: usize = u8::MAX as usize + 1;

/// Compile a source buffer into the top-level function. On failure,
/// every diagnostic gathered before synchronization gave up.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    trace_code: bool,
) -> Result<ObjFunction, CompileErrors> {
    let mut parser = Parser::new(source, heap, trace_code);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();
    if parser.had_error {
        Err(CompileErrors(parser.errors))
    } else {
        Ok(function)
    }
}

/// Binding strength, weakest first. `parse_precedence(p)` consumes
/// every infix operator whose precedence is at least `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    /// One level tighter; used for left-associative infix operands.
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
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = for<'src, 'h> fn(&mut Parser<'src, 'h>, bool);

/// One row of the Pratt table.
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// The table is indexed by `TokenKind` discriminant; the rows must stay
/// in declaration order.
#[rustfmt::skip]
static RULES: [ParseRule; TokenKind::COUNT] = [
    ParseRule { prefix: Some(grouping), infix: Some(call),   precedence: Precedence::Call },       // LeftParen
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // RightParen
    ParseRule { prefix: Some(dict),     infix: None,         precedence: Precedence::None },       // LeftBrace
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // RightBrace
    ParseRule { prefix: Some(list),     infix: Some(index),  precedence: Precedence::Call },       // LeftBracket
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // RightBracket
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Comma
    ParseRule { prefix: None,           infix: Some(dot),    precedence: Precedence::Call },       // Dot
    ParseRule { prefix: Some(unary),    infix: Some(binary), precedence: Precedence::Term },       // Minus
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Term },       // Plus
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Semicolon
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Colon
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Factor },     // Slash
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Factor },     // Star
    ParseRule { prefix: Some(unary),    infix: None,         precedence: Precedence::None },       // Bang
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Equality },   // BangEqual
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Equal
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Equality },   // EqualEqual
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Comparison }, // Greater
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Comparison }, // GreaterEqual
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Comparison }, // Less
    ParseRule { prefix: None,           infix: Some(binary), precedence: Precedence::Comparison }, // LessEqual
    ParseRule { prefix: Some(variable), infix: None,         precedence: Precedence::None },       // Identifier
    ParseRule { prefix: Some(string),   infix: None,         precedence: Precedence::None },       // String
    ParseRule { prefix: Some(number),   infix: None,         precedence: Precedence::None },       // Number
    ParseRule { prefix: None,           infix: Some(and_),   precedence: Precedence::And },        // And
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Break
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Class
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Continue
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Else
    ParseRule { prefix: Some(literal),  infix: None,         precedence: Precedence::None },       // False
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // For
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Fun
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // If
    ParseRule { prefix: Some(literal),  infix: None,         precedence: Precedence::None },       // Nil
    ParseRule { prefix: None,           infix: Some(or_),    precedence: Precedence::Or },         // Or
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Perm
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Print
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Return
    ParseRule { prefix: Some(super_),   infix: None,         precedence: Precedence::None },       // Super
    ParseRule { prefix: Some(this_),    infix: None,         precedence: Precedence::None },       // This
    ParseRule { prefix: Some(literal),  infix: None,         precedence: Precedence::None },       // True
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Var
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // While
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Error
    ParseRule { prefix: None,           infix: None,         precedence: Precedence::None },       // Eof
];

fn rule(kind: TokenKind) -> &'static ParseRule {
    &RULES[kind as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still running.
    depth: i32,
    is_captured: bool,
    is_perm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Scaffolding for the innermost enclosing loop: where `continue` jumps
/// back to, the scope depth whose locals a jump must discard, and the
/// `break` jumps waiting to be patched past the loop end.
#[derive(Debug)]
struct LoopState {
    start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

/// One function being compiled.
struct FnCompiler<'src> {
    fn_type: FunctionType,
    name: Option<GcRef>,
    arity: usize,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
    loops: Vec<LoopState>,
}

struct ClassCompiler {
    has_superclass: bool,
}

pub struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    compilers: Vec<FnCompiler<'src>>,
    classes: Vec<ClassCompiler>,
    trace_code: bool,
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap, trace_code: bool) -> Self {
        let mut parser = Parser {
            scanner: Scanner::new(source),
            heap,
            current: Token::none(),
            previous: Token::none(),
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            compilers: Vec::new(),
            classes: Vec::new(),
            trace_code,
        };
        parser.begin_compiler(FunctionType::Script);
        parser
    }

    // ── Token plumbing ────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ── Errors ────────────────────────────────────────────────────

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => ErrorAt::End,
            TokenKind::Error => ErrorAt::Hidden,
            _ => ErrorAt::Lexeme(token.lexeme.to_string()),
        };
        self.errors.push(CompileError {
            line: token.line,
            at,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

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
                | TokenKind::Perm
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

    // ── Compiler stack ────────────────────────────────────────────

    fn begin_compiler(&mut self, fn_type: FunctionType) {
        let name = if fn_type == FunctionType::Script {
            None
        } else {
            Some(self.heap.intern(self.previous.lexeme))
        };
        let mut compiler = FnCompiler {
            fn_type,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: Vec::with_capacity(8),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        };
        // Slot 0 is reserved: the callee in functions, `this` in
        // methods and initializers.
        compiler.locals.push(Local {
            name: if fn_type == FunctionType::Function {
                ""
            } else {
                "this"
            },
            depth: 0,
            is_captured: false,
            is_perm: false,
        });
        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> (ObjFunction, Vec<CompilerUpvalue>) {
        self.emit_return();
        let compiler = self.compilers.pop().expect("compiler stack underflow");
        let function = ObjFunction {
            arity: compiler.arity,
            upvalue_count: compiler.upvalues.len(),
            name: compiler.name,
            chunk: Rc::new(compiler.chunk),
        };
        if self.trace_code && !self.had_error {
            let name = match function.name {
                Some(name) => self.heap.string(name).chars.to_string(),
                None => "<script>".to_string(),
            };
            eprint!("{}", disasm::disassemble_chunk(self.heap, &function.chunk, &name));
        }
        (function, compiler.upvalues)
    }

    fn compiler(&self) -> &FnCompiler<'src> {
        self.compilers.last().expect("compiler stack underflow")
    }

    fn compiler_mut(&mut self) -> &mut FnCompiler<'src> {
        self.compilers.last_mut().expect("compiler stack underflow")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.compiler_mut().chunk
    }

    fn chunk_len(&self) -> usize {
        self.compiler().chunk.code.len()
    }

    // ── Bytecode emission ─────────────────────────────────────────

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: Op, second: Op) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    /// Emit a backward jump to `loop_start`. The operand counts from
    /// after its own two bytes.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emit a forward jump with a placeholder offset; returns the
    /// placeholder position for `patch_jump`.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_return(&mut self) {
        if self.compiler().fn_type == FunctionType::Initializer {
            self.emit_op_byte(Op::GetLocal, 0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(Op::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.heap.intern(name);
        self.make_constant(Value::object(string))
    }

    // ── Scopes, locals and upvalues ───────────────────────────────

    fn begin_scope(&mut self) {
        self.compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler_mut().scope_depth -= 1;
        loop {
            let pop_captured = {
                let compiler = self.compiler();
                match compiler.locals.last() {
                    Some(local) if local.depth > compiler.scope_depth => Some(local.is_captured),
                    _ => None,
                }
            };
            match pop_captured {
                Some(true) => self.emit_op(Op::CloseUpvalue),
                Some(false) => self.emit_op(Op::Pop),
                None => break,
            }
            self.compiler_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str, is_perm: bool) {
        if self.compiler().locals.len() == UINT8_COUNT {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
            is_perm,
        });
    }

    fn declare_variable(&mut self, is_perm: bool) {
        if self.compiler().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut clashes = false;
        {
            let compiler = self.compiler();
            for local in compiler.locals.iter().rev() {
                // Skip uninitialized placeholders; stop once we reach an
                // enclosing scope.
                if local.depth != -1 && local.depth < compiler.scope_depth {
                    break;
                }
                if local.name == name {
                    clashes = true;
                    break;
                }
            }
        }
        if clashes {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name, is_perm);
    }

    fn parse_variable(&mut self, message: &str, is_perm: bool) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(is_perm);
        if self.compiler().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let compiler = self.compiler_mut();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        if let Some(local) = compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8, is_perm: bool) {
        if self.compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if is_perm {
            self.emit_op_byte(Op::DefineGlobalPerm, global);
        } else {
            self.emit_op_byte(Op::DefineGlobal, global);
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (slot, local) in self.compilers[compiler_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((slot, local.depth));
                break;
            }
        }
        let (slot, depth) = found?;
        if depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u8, is_local: bool) -> u8 {
        let candidate = CompilerUpvalue { index, is_local };
        let compiler = &mut self.compilers[compiler_index];
        for (i, upvalue) in compiler.upvalues.iter().enumerate() {
            if *upvalue == candidate {
                return i as u8;
            }
        }
        if compiler.upvalues.len() == UINT8_COUNT {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let compiler = &mut self.compilers[compiler_index];
        compiler.upvalues.push(candidate);
        (compiler.upvalues.len() - 1) as u8
    }

    /// Resolve `name` as a capture from an enclosing function: first as
    /// a local of the parent (marking it captured), else transitively
    /// as an upvalue of the parent.
    fn resolve_upvalue(&mut self, compiler_index: usize, name: &str) -> Option<u8> {
        if compiler_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(compiler_index - 1, name) {
            self.compilers[compiler_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(compiler_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(compiler_index - 1, name) {
            return Some(self.add_upvalue(compiler_index, upvalue, false));
        }
        None
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg, perm_local) = if let Some(slot) = self.resolve_local(top, name) {
            let perm = self.compilers[top].locals[slot as usize].is_perm;
            (Op::GetLocal, Op::SetLocal, slot, perm)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (Op::GetUpvalue, Op::SetUpvalue, index, false)
        } else {
            let arg = self.identifier_constant(name);
            (Op::GetGlobal, Op::SetGlobal, arg, false)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            if perm_local {
                self.error("Can't reassign to permanent variable.");
            }
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ── Expressions ───────────────────────────────────────────────

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    // ── Declarations and statements ───────────────────────────────

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Perm) {
            self.var_declaration(true);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self, is_perm: bool) {
        let global = self.parse_variable("Expect variable name.", is_perm);

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else if is_perm {
            self.error("Permanent variable must be initialized.");
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, is_perm);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", false);
        // Initialized before the body so the function can recurse.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global, false);
    }

    fn function(&mut self, fn_type: FunctionType) {
        self.begin_compiler(fn_type);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = {
                    let compiler = self.compiler_mut();
                    compiler.arity += 1;
                    compiler.arity
                };
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.", false);
                self.define_variable(constant, false);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let function = self.heap.allocate(Obj::Function(function));
        let constant = self.make_constant(Value::object(function));
        self.emit_op_byte(Op::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);
        let fn_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_op_byte(Op::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable(false);

        self.emit_op_byte(Op::Class, name_constant);
        self.define_variable(name_constant, false);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            variable(self, false);

            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super", false);
            self.define_variable(0, false);

            self.named_variable(class_name.lexeme, false);
            self.emit_op(Op::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Op::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn return_statement(&mut self) {
        if self.compiler().fn_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler().fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);

        self.patch_jump(then_jump);
        // The condition is still on the stack on the false path.
        self.emit_op(Op::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        let scope_depth = self.compiler().scope_depth;
        self.compiler_mut().loops.push(LoopState {
            start: loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);

        let finished = self.compiler_mut().loops.pop().unwrap();
        for jump in finished.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // The increment runs after the body: jump over it now, run
            // it on the way back around.
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.compiler().scope_depth;
        self.compiler_mut().loops.push(LoopState {
            start: loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Op::Pop);
        }

        let finished = self.compiler_mut().loops.pop().unwrap();
        for jump in finished.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
    }

    /// Pop the locals declared inside the loop body without forgetting
    /// them: a `break`/`continue` leaves the scope at runtime but the
    /// compiler keeps tracking those locals for the code that follows.
    fn discard_loop_locals(&mut self) {
        let loop_depth = match self.compiler().loops.last() {
            Some(state) => state.scope_depth,
            None => return,
        };
        let captured: Vec<bool> = self
            .compiler()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_depth)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        if self.compiler().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.compiler().loops.is_empty() {
            return;
        }

        self.discard_loop_locals();
        let jump = self.emit_jump(Op::Jump);
        self.compiler_mut()
            .loops
            .last_mut()
            .unwrap()
            .break_jumps
            .push(jump);
    }

    fn continue_statement(&mut self) {
        if self.compiler().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.compiler().loops.is_empty() {
            return;
        }

        self.discard_loop_locals();
        let start = self.compiler().loops.last().unwrap().start;
        self.emit_loop(start);
    }
}

// ── Parse functions (the Pratt table points here) ─────────────────

fn grouping(p: &mut Parser, _can_assign: bool) {
    p.expression();
    p.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(p: &mut Parser, _can_assign: bool) {
    let value: f64 = match p.previous.lexeme.parse() {
        Ok(value) => value,
        Err(_) => {
            p.error("Invalid number literal.");
            0.0
        }
    };
    p.emit_constant(Value::number(value));
}

fn string(p: &mut Parser, _can_assign: bool) {
    // Trim the surrounding quotes; the bytes between them are kept
    // verbatim, escapes included.
    let lexeme = p.previous.lexeme;
    let content = &lexeme[1..lexeme.len() - 1];
    let string = p.heap.intern(content);
    p.emit_constant(Value::object(string));
}

fn literal(p: &mut Parser, _can_assign: bool) {
    match p.previous.kind {
        TokenKind::False => p.emit_op(Op::False),
        TokenKind::Nil => p.emit_op(Op::Nil),
        TokenKind::True => p.emit_op(Op::True),
        _ => unreachable!("literal rule on non-literal token"),
    }
}

fn unary(p: &mut Parser, _can_assign: bool) {
    let operator = p.previous.kind;
    p.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Bang => p.emit_op(Op::Not),
        TokenKind::Minus => p.emit_op(Op::Negate),
        _ => unreachable!("unary rule on non-unary token"),
    }
}

fn binary(p: &mut Parser, _can_assign: bool) {
    let operator = p.previous.kind;
    p.parse_precedence(rule(operator).precedence.next());

    match operator {
        TokenKind::BangEqual => p.emit_ops(Op::Equal, Op::Not),
        TokenKind::EqualEqual => p.emit_op(Op::Equal),
        TokenKind::Greater => p.emit_op(Op::Greater),
        TokenKind::GreaterEqual => p.emit_ops(Op::Less, Op::Not),
        TokenKind::Less => p.emit_op(Op::Less),
        TokenKind::LessEqual => p.emit_ops(Op::Greater, Op::Not),
        TokenKind::Plus => p.emit_op(Op::Add),
        TokenKind::Minus => p.emit_op(Op::Subtract),
        TokenKind::Star => p.emit_op(Op::Multiply),
        TokenKind::Slash => p.emit_op(Op::Divide),
        _ => unreachable!("binary rule on non-binary token"),
    }
}

fn call(p: &mut Parser, _can_assign: bool) {
    let argc = p.argument_list();
    p.emit_op_byte(Op::Call, argc);
}

fn dot(p: &mut Parser, can_assign: bool) {
    p.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let name = p.previous.lexeme;
    let constant = p.identifier_constant(name);

    if can_assign && p.matches(TokenKind::Equal) {
        p.expression();
        p.emit_op_byte(Op::SetProperty, constant);
    } else if p.matches(TokenKind::LeftParen) {
        let argc = p.argument_list();
        p.emit_op_byte(Op::Invoke, constant);
        p.emit_byte(argc);
    } else {
        p.emit_op_byte(Op::GetProperty, constant);
    }
}

/// `[` as an infix operator: indexed access, with assignment when the
/// index expression is an assignment target.
fn index(p: &mut Parser, can_assign: bool) {
    p.expression();
    p.consume(TokenKind::RightBracket, "Expect ']' after index.");

    if can_assign && p.matches(TokenKind::Equal) {
        p.expression();
        p.emit_op(Op::SetItem);
    } else {
        p.emit_op(Op::GetItem);
    }
}

/// `[` as a prefix: a list literal.
fn list(p: &mut Parser, _can_assign: bool) {
    let mut count: usize = 0;
    if !p.check(TokenKind::RightBracket) {
        loop {
            p.expression();
            if count == 255 {
                p.error("Can't have more than 255 elements in one list.");
            }
            count += 1;
            if !p.matches(TokenKind::Comma) {
                break;
            }
        }
    }
    p.consume(TokenKind::RightBracket, "Expect ']' after list.");
    p.emit_op_byte(Op::List, count.min(255) as u8);
}

/// `{` as a prefix: a dictionary literal.
fn dict(p: &mut Parser, _can_assign: bool) {
    let mut count: usize = 0;
    if !p.check(TokenKind::RightBrace) {
        loop {
            p.expression();
            p.consume(TokenKind::Colon, "Expect ':' after key.");
            p.expression();
            if count == 255 {
                p.error("Can't have more than 255 elements in dictionary.");
            }
            count += 1;
            if !p.matches(TokenKind::Comma) {
                break;
            }
        }
    }
    p.consume(TokenKind::RightBrace, "Expect '}' after dictionary.");
    p.emit_op_byte(Op::Dictionary, count.min(255) as u8);
}

fn variable(p: &mut Parser, can_assign: bool) {
    let name = p.previous.lexeme;
    p.named_variable(name, can_assign);
}

fn and_(p: &mut Parser, _can_assign: bool) {
    let end_jump = p.emit_jump(Op::JumpIfFalse);
    p.emit_op(Op::Pop);
    p.parse_precedence(Precedence::And);
    p.patch_jump(end_jump);
}

fn or_(p: &mut Parser, _can_assign: bool) {
    let else_jump = p.emit_jump(Op::JumpIfFalse);
    let end_jump = p.emit_jump(Op::Jump);

    p.patch_jump(else_jump);
    p.emit_op(Op::Pop);

    p.parse_precedence(Precedence::Or);
    p.patch_jump(end_jump);
}

fn this_(p: &mut Parser, _can_assign: bool) {
    if p.classes.is_empty() {
        p.error("Can't use 'this' outside of a class.");
        return;
    }
    variable(p, false);
}

fn super_(p: &mut Parser, _can_assign: bool) {
    let misuse = match p.classes.last() {
        None => Some("Can't use 'super' outside of a class."),
        Some(class) if !class.has_superclass => {
            Some("Can't use 'super' in a class with no superclass.")
        }
        Some(_) => None,
    };
    if let Some(message) = misuse {
        p.error(message);
    }

    p.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    p.consume(TokenKind::Identifier, "Expect superclass method name.");
    let name = p.previous.lexeme;
    let constant = p.identifier_constant(name);

    p.named_variable("this", false);
    if p.matches(TokenKind::LeftParen) {
        let argc = p.argument_list();
        p.named_variable("super", false);
        p.emit_op_byte(Op::SuperInvoke, constant);
        p.emit_byte(argc);
    } else {
        p.named_variable("super", false);
        p.emit_op_byte(Op::GetSuper, constant);
    }
}
