//! compiler.rs — compilateur Pratt une-seule-passe : source vers bytecode,
//! sans étape AST intermédiaire.
//!
//! Chaque fonction Lox (y compris le script de plus haut niveau) a son
//! propre [`FunctionState`] ; ces états forment une pile qui reflète
//! l'imbrication lexicale des `fun`/méthodes en cours de compilation.
//! Les locales et les upvalues se résolvent en remontant cette pile, comme
//! l'implémentation de référence remonte sa chaîne de compilateurs
//! englobants.
//!
//! Le compilateur n'est volontairement pas une racine GC : il n'appelle
//! jamais `Heap::collect_garbage` lui-même (seule la VM collecte, lors de
//! ses propres allocations). Tant qu'aucune collecte ne peut survenir
//! pendant une compilation, les objets alloués ici (noms internés,
//! `Function` en construction) n'ont pas besoin d'être marqués comme
//! racines tant qu'ils ne sont pas encore atteignables.

use lox_core::object::Function;
use lox_core::ops::UpvalueCapture;
use lox_core::{Heap, Obj, ObjHandle, Op, Value};

use crate::error::{CompileError, ErrorLocation};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `None` tant que l'initialiseur de la variable n'a pas fini de se
    /// compiler (empêche `var a = a;` de lire une variable non définie).
    depth: Option<i32>,
    is_captured: bool,
}

struct FunctionState<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueCapture>,
    scope_depth: i32,
}

struct ClassState {
    has_superclass: bool,
}

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
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'src, 'heap> = fn(&mut Compiler<'src, 'heap>, bool);

struct ParseRule<'src, 'heap> {
    prefix: Option<ParseFn<'src, 'heap>>,
    infix: Option<ParseFn<'src, 'heap>>,
    precedence: Precedence,
}

/// Compile une unité de source Lox directement en bytecode.
pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    heap: &'heap mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    states: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

/// Compile `source` en une fonction script de plus haut niveau.
///
/// En cas d'erreur, renvoie la liste complète des diagnostics plutôt que de
/// s'arrêter au premier : le compilateur se resynchronise après chaque
/// erreur pour continuer à en rapporter d'autres dans la même passe.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjHandle, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _upvalues) = compiler.end_function_state();

    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(compiler.heap.alloc(Obj::Function(function)))
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 1 };
        let mut compiler = Self {
            scanner: Scanner::new(source),
            heap,
            previous: dummy,
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            states: Vec::new(),
            classes: Vec::new(),
        };
        compiler.push_function_state(FunctionKind::Script, None);
        compiler
    }

    // ----- infrastructure de tokens -----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::AtEnd,
            TokenKind::Error => ErrorLocation::Lexical,
            _ => ErrorLocation::At(token.lexeme.to_string()),
        };
        self.errors.push(CompileError { line: token.line, location, message: message.to_string() });
        self.had_error = true;
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
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ----- émission de bytecode -----

    fn current_state(&self) -> &FunctionState<'src> {
        self.states.last().expect("compiler always has a current function state")
    }

    fn current_state_mut(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().expect("compiler always has a current function state")
    }

    fn emit(&mut self, op: Op) -> usize {
        let line = self.previous.line;
        self.current_state_mut().function.chunk.write(op, line)
    }

    fn emit_return(&mut self) {
        if self.current_state().kind == FunctionKind::Initializer {
            self.emit(Op::GetLocal(0));
        } else {
            self.emit(Op::Nil);
        }
        self.emit(Op::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let result = self.current_state_mut().function.chunk.add_constant(value);
        match result {
            Ok(index) => {
                self.emit(Op::Constant(index));
            }
            Err(err) => self.error(&err.to_string()),
        }
    }

    fn emit_jump(&mut self, make_placeholder: fn(u32) -> Op) -> usize {
        self.emit(make_placeholder(0))
    }

    fn patch_jump(&mut self, offset: usize) {
        let target = self.current_state().function.chunk.len();
        let distance = target.saturating_sub(offset + 1);
        if distance > u16::MAX as usize {
            self.error(&lox_core::Error::JumpTooLarge.to_string());
        }
        let patched = match self.current_state().function.chunk.op(offset) {
            Some(Op::Jump(_)) => Op::Jump(target as u32),
            Some(Op::JumpIfFalse(_)) => Op::JumpIfFalse(target as u32),
            _ => unreachable!("patch_jump called on a non-jump instruction"),
        };
        self.current_state_mut().function.chunk.patch(offset, patched);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let current = self.current_state().function.chunk.len();
        if current.saturating_sub(loop_start) > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit(Op::Loop(loop_start as u32));
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        match self.current_state_mut().function.chunk.add_constant(Value::Obj(handle)) {
            Ok(index) => index,
            Err(err) => {
                self.error(&err.to_string());
                0
            }
        }
    }

    // ----- scopes et variables -----

    fn push_function_state(&mut self, kind: FunctionKind, name: Option<ObjHandle>) {
        let reserved_name =
            if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) { "this" } else { "" };
        self.states.push(FunctionState {
            function: Function::new(name),
            kind,
            locals: vec![Local { name: reserved_name, depth: Some(0), is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    fn end_function_state(&mut self) -> (Function, Vec<UpvalueCapture>) {
        self.emit_return();
        let state = self.states.pop().expect("function state stack must not be empty");
        (state.function, state.upvalues)
    }

    fn begin_scope(&mut self) {
        self.current_state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_state_mut().scope_depth -= 1;
        let depth = self.current_state().scope_depth;
        loop {
            let should_pop =
                matches!(self.current_state().locals.last(), Some(local) if local.depth.is_some_and(|d| d > depth));
            if !should_pop {
                break;
            }
            if self.current_state().locals.last().expect("checked above").is_captured {
                self.emit(Op::CloseUpvalue);
            } else {
                self.emit(Op::Pop);
            }
            self.current_state_mut().locals.pop();
        }
    }

    fn declare_variable(&mut self) {
        if self.current_state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let scope_depth = self.current_state().scope_depth;
        let mut conflict = false;
        for local in self.current_state().locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < scope_depth {
                    break;
                }
            }
            if local.name == name {
                conflict = true;
                break;
            }
        }
        if conflict {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_state().locals.len() >= u8::MAX as usize + 1 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_state_mut().locals.push(Local { name, depth: None, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.current_state().scope_depth == 0 {
            return;
        }
        let depth = self.current_state().scope_depth;
        let state = self.current_state_mut();
        let last = state.locals.len() - 1;
        state.locals[last].depth = Some(depth);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Op::DefineGlobal(global));
    }

    fn resolve_local_at(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth.is_some()));
                break;
            }
        }
        match found {
            Some((i, true)) => Some(i as u8),
            Some((_, false)) => {
                self.error("Can't read local variable in its own initializer.");
                None
            }
            None => None,
        }
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &self.states[state_index].upvalues;
        for (i, existing) in upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= u8::MAX as usize + 1 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_index].upvalues.push(UpvalueCapture { is_local, index });
        let count = self.states[state_index].upvalues.len() as u8;
        self.states[state_index].function.upvalue_count = count;
        count - 1
    }

    fn resolve_upvalue_at(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }
        let enclosing = state_index - 1;
        if let Some(local_index) = self.resolve_local_at(enclosing, name) {
            self.states[enclosing].locals[local_index as usize].is_captured = true;
            return Some(self.add_upvalue(state_index, local_index, true));
        }
        if let Some(upvalue_index) = self.resolve_upvalue_at(enclosing, name) {
            return Some(self.add_upvalue(state_index, upvalue_index, false));
        }
        None
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        self.resolve_local_at(self.states.len() - 1, name)
    }

    fn resolve_upvalue(&mut self, name: &str) -> Option<u8> {
        self.resolve_upvalue_at(self.states.len() - 1, name)
    }

    // ----- grammaire : déclarations et statements -----

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

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit(Op::Class(name_constant));
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expected superclass name.");
            let superclass_name = self.previous.lexeme;
            self.named_variable(superclass_name, false);
            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit(Op::Inherit);
            self.classes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body.");
        self.emit(Op::Pop);

        if self.classes.last().expect("class being compiled").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, name);
        self.emit(Op::Method(constant));
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        self.mark_initialized();
        let name = self.previous.lexeme;
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: &'src str) {
        let name_handle = self.heap.intern(name);
        self.push_function_state(kind, Some(name_handle));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_state().function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_state_mut().function.arity += 1;
                }
                let constant = self.parse_variable("Expected parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function_state();
        let handle = self.heap.alloc(Obj::Function(function));
        let constant = match self.current_state_mut().function.chunk.add_constant(Value::Obj(handle)) {
            Ok(index) => index,
            Err(err) => {
                self.error(&err.to_string());
                0
            }
        };
        self.emit(Op::Closure(constant, upvalues));
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(Op::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
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
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after value.");
        self.emit(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
        self.emit(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement();

        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit(Op::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_state().function.chunk.len();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // pas d'initialiseur
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_state().function.chunk.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit(Op::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.current_state().function.chunk.len();
            self.expression();
            self.emit(Op::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Op::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_state().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
            self.emit(Op::Return);
        }
    }

    // ----- grammaire : expressions -----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let rule = self.get_rule(self.previous.kind);
        let Some(prefix) = rule.prefix else {
            self.error("Expected expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= self.get_rule(self.current.kind).precedence {
            self.advance();
            let infix = self.get_rule(self.previous.kind).infix.expect("precedence table guarantees infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg): (fn(u8) -> Op, fn(u8) -> Op, u8) =
            if let Some(local) = self.resolve_local(name) {
                (Op::GetLocal, Op::SetLocal, local)
            } else if let Some(upvalue) = self.resolve_upvalue(name) {
                (Op::GetUpvalue, Op::SetUpvalue, upvalue)
            } else {
                let constant = self.identifier_constant(name);
                (Op::GetGlobal, Op::SetGlobal, constant)
            };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(set_op(arg));
        } else {
            self.emit(get_op(arg));
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments.");
        count as u8
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after expression.");
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit(Op::Call(arg_count));
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(Op::SetProperty(constant));
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit(Op::Invoke(constant, arg_count));
        } else {
            self.emit(Op::GetProperty(constant));
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => {
                self.emit(Op::Negate);
            }
            TokenKind::Bang => {
                self.emit(Op::Not);
            }
            _ => unreachable!("unary rule only registered for '-' and '!'"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = self.get_rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenKind::Plus => {
                self.emit(Op::Add);
            }
            TokenKind::Minus => {
                self.emit(Op::Subtract);
            }
            TokenKind::Star => {
                self.emit(Op::Multiply);
            }
            TokenKind::Slash => {
                self.emit(Op::Divide);
            }
            TokenKind::BangEqual => {
                self.emit(Op::Equal);
                self.emit(Op::Not);
            }
            TokenKind::EqualEqual => {
                self.emit(Op::Equal);
            }
            TokenKind::Greater => {
                self.emit(Op::Greater);
            }
            TokenKind::GreaterEqual => {
                self.emit(Op::Less);
                self.emit(Op::Not);
            }
            TokenKind::Less => {
                self.emit(Op::Less);
            }
            TokenKind::LessEqual => {
                self.emit(Op::Greater);
                self.emit(Op::Not);
            }
            _ => unreachable!("binary rule only registered for arithmetic/comparison operators"),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => {
                self.emit(Op::False);
            }
            TokenKind::Nil => {
                self.emit(Op::Nil);
            }
            TokenKind::True => {
                self.emit(Op::True);
            }
            _ => unreachable!("literal rule only registered for false/nil/true"),
        };
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner only produces valid float lexemes");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let content = &raw[1..raw.len() - 1];
        let handle = self.heap.intern(content);
        self.emit_constant(Value::Obj(handle));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expected superclass method name.");
        let method_name = self.previous.lexeme;
        let constant = self.identifier_constant(method_name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit(Op::SuperInvoke(constant, arg_count));
        } else {
            self.named_variable("super", false);
            self.emit(Op::GetSuper(constant));
        }
    }

    fn get_rule(&self, kind: TokenKind) -> ParseRule<'src, 'heap> {
        use TokenKind::*;
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'heap>>,
            Option<ParseFn<'src, 'heap>>,
            Precedence,
        ) = match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            Dot => (None, Some(Self::dot), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Slash | Star => (None, Some(Self::binary), Precedence::Factor),
            Bang => (Some(Self::unary), None, Precedence::None),
            BangEqual | EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => (None, Some(Self::binary), Precedence::Comparison),
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            And => (None, Some(Self::and), Precedence::And),
            Or => (None, Some(Self::or), Precedence::Or),
            False | Nil | True => (Some(Self::literal), None, Precedence::None),
            Super => (Some(Self::super_), None, Precedence::None),
            This => (Some(Self::this), None, Precedence::None),
            RightParen | LeftBrace | RightBrace | Comma | Semicolon | Equal | Class | Else | For
            | Fun | If | Print | Return | Var | While | Error | Eof => (None, None, Precedence::None),
        };
        ParseRule { prefix, infix, precedence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use lox_core::heap::render;

    fn compile_ok(source: &str) -> (ObjHandle, Heap) {
        let mut heap = Heap::new();
        let handle = compile(source, &mut heap).unwrap_or_else(|errors| {
            panic!("unexpected compile errors: {errors:?}");
        });
        (handle, heap)
    }

    fn compile_err(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("expected compile error")
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let (handle, heap) = compile_ok("1 + 2 * 3;");
        let Obj::Function(function) = heap.get(handle).expect("function object") else {
            panic!("expected function object");
        };
        assert!(function.chunk.code().iter().any(|op| *op == Op::Multiply));
        assert!(function.chunk.code().iter().any(|op| *op == Op::Add));
    }

    #[test]
    fn reports_missing_semicolon() {
        let errors = compile_err("1 + 2");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Expected ';'"));
    }

    #[test]
    fn reports_multiple_errors_after_resynchronizing() {
        let errors = compile_err(indoc! {"
            var = 1;
            var = 2;
        "});
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn global_variable_roundtrips() {
        let (handle, heap) = compile_ok("var x = 10; print x;");
        let Obj::Function(function) = heap.get(handle).expect("function object") else {
            panic!("expected function object");
        };
        assert!(function.chunk.code().iter().any(|op| matches!(op, Op::DefineGlobal(_))));
        assert!(function.chunk.code().iter().any(|op| matches!(op, Op::GetGlobal(_))));
    }

    #[test]
    fn function_declaration_emits_closure() {
        let (handle, heap) = compile_ok("fun greet() { print \"hi\"; } greet();");
        let Obj::Function(function) = heap.get(handle).expect("function object") else {
            panic!("expected function object");
        };
        assert!(function.chunk.code().iter().any(|op| matches!(op, Op::Closure(_, _))));
    }

    #[test]
    fn closure_captures_enclosing_local_as_upvalue() {
        let (handle, heap) = compile_ok(indoc! {"
            fun outer() {
                var x = 1;
                fun inner() { return x; }
                return inner;
            }
        "});
        let Obj::Function(script) = heap.get(handle).expect("function object") else {
            panic!("expected function object");
        };
        let closure_op = script.chunk.code().iter().find(|op| matches!(op, Op::Closure(_, _)));
        let Some(Op::Closure(outer_fn_index, _)) = closure_op else {
            panic!("expected outer closure instruction");
        };
        let Value::Obj(outer_handle) = script.chunk.constants()[*outer_fn_index as usize] else {
            panic!("constant should be an object");
        };
        let Obj::Function(outer_fn) = heap.get(outer_handle).expect("outer function") else {
            panic!("expected function object");
        };
        let inner_closure = outer_fn.chunk.code().iter().find(|op| matches!(op, Op::Closure(_, _)));
        let Some(Op::Closure(_, upvalues)) = inner_closure else {
            panic!("expected inner closure instruction");
        };
        assert_eq!(upvalues.len(), 1);
        assert!(upvalues[0].is_local);
    }

    #[test]
    fn class_with_superclass_emits_inherit() {
        let (handle, heap) = compile_ok(indoc! {"
            class Animal { speak() { print \"...\"; } }
            class Dog < Animal {}
        "});
        let Obj::Function(function) = heap.get(handle).expect("function object") else {
            panic!("expected function object");
        };
        assert!(function.chunk.code().iter().any(|op| *op == Op::Inherit));
    }

    #[test]
    fn render_helper_is_reachable_from_compiled_constants() {
        let (handle, heap) = compile_ok("\"hello\";");
        let Obj::Function(function) = heap.get(handle).expect("function object") else {
            panic!("expected function object");
        };
        let Value::Obj(string_handle) = function.chunk.constants()[0] else {
            panic!("expected string constant");
        };
        assert_eq!(render(&Value::Obj(string_handle), &heap), "hello");
    }

    #[test]
    fn using_this_outside_class_is_an_error() {
        let errors = compile_err("print this;");
        assert!(errors.iter().any(|e| e.message.contains("'this' outside of a class")));
    }

    #[test]
    fn returning_a_value_at_top_level_is_an_error() {
        let errors = compile_err("return 1;");
        assert!(errors.iter().any(|e| e.message.contains("Can't return from top-level code.")));
    }
}
