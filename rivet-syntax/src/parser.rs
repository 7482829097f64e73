//! Recursive-descent parser with precedence climbing for expressions.
//!
//! Statements are newline-terminated (`;` also accepted). The parser is
//! error-tolerant: it records every diagnostic, synchronizes at statement
//! boundaries, and returns the full error list so callers can report more
//! than the first problem.

use crate::ast::{BinaryOp, FnLiteral, MatchArm, Node, NodeKind, PermKind, UnaryOp};
use crate::lexer::{unescape, Lexer};
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.line, self.col, self.message)
    }
}

/// Parse a complete script into a `Program` node.
pub fn parse(source: &str) -> Result<Node, Vec<ParseError>> {
    let mut parser = Parser::new(source);
    let program = parser.program();
    if parser.errors.is_empty() {
        Ok(program)
    } else {
        Err(parser.errors)
    }
}

// Binding power for binary operators, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Pipe,
    Or,
    And,
    Equality,
    Comparison,
    Range,
    Term,
    Factor,
    Unary,
}

fn binary_prec(kind: TokenKind) -> Prec {
    match kind {
        TokenKind::Pipe => Prec::Pipe,
        TokenKind::Or | TokenKind::PipePipe => Prec::Or,
        TokenKind::And | TokenKind::AmpAmp => Prec::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Prec::Equality,
        TokenKind::Less
        | TokenKind::LessEqual
        | TokenKind::Greater
        | TokenKind::GreaterEqual => Prec::Comparison,
        TokenKind::DotDot => Prec::Range,
        TokenKind::Plus | TokenKind::Minus => Prec::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Prec::Factor,
        _ => Prec::None,
    }
}

fn next_prec(prec: Prec) -> Prec {
    match prec {
        Prec::None => Prec::Pipe,
        Prec::Pipe => Prec::Or,
        Prec::Or => Prec::And,
        Prec::And => Prec::Equality,
        Prec::Equality => Prec::Comparison,
        Prec::Comparison => Prec::Range,
        Prec::Range => Prec::Term,
        Prec::Term => Prec::Factor,
        Prec::Factor => Prec::Unary,
        Prec::Unary => Prec::Unary,
    }
}

struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    errors: Vec<ParseError>,
    panic_mode: bool,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        let mut lexer = Lexer::new(source);
        let first = lexer.next_token();
        Parser {
            lexer,
            current: first,
            previous: Token::synthetic(TokenKind::Eof),
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
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

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    /// Peek one token past `current` without committing the lexer.
    fn peek_next_kind(&self) -> TokenKind {
        let mut look = self.lexer.clone();
        loop {
            let tok = look.next_token();
            if tok.kind != TokenKind::Error {
                return tok.kind;
            }
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    /// Statements end at a newline, `;`, `}` or EOF.
    fn expect_terminator(&mut self) {
        if self.matches(TokenKind::Newline) || self.matches(TokenKind::Semicolon) {
            self.skip_newlines();
            return;
        }
        if self.check(TokenKind::Eof) || self.check(TokenKind::RightBrace) {
            return;
        }
        self.error_at_current("Expected newline or ';' after statement.");
    }

    /// Allow `else` (and match arms) to sit on the line after a `}`.
    fn skip_newlines_if_followed_by(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            return true;
        }
        if !self.check(TokenKind::Newline) {
            return false;
        }
        let mut look = self.lexer.clone();
        let mut tok = self.current;
        while tok.kind == TokenKind::Newline {
            tok = look.next_token();
        }
        if tok.kind == kind {
            self.skip_newlines();
            true
        } else {
            false
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let (line, col) = (self.current.line, self.current.col);
        self.error_at(line, col, message);
    }

    fn error_at(&mut self, line: u32, col: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(ParseError {
            message: message.to_string(),
            line,
            col,
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Newline
                || self.previous.kind == TokenKind::Semicolon
            {
                return;
            }
            match self.current.kind {
                TokenKind::Fn
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Let
                | TokenKind::Match
                | TokenKind::Import
                | TokenKind::Allow
                | TokenKind::On
                | TokenKind::Parallel => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn node(&self, kind: NodeKind, at: Token) -> Node {
        Node::new(kind, at.line, at.col)
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn program(&mut self) -> Node {
        let first = self.current;
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::Eof) {
            stmts.push(self.declaration());
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_newlines();
        }
        self.node(NodeKind::Program(stmts), first)
    }

    fn declaration(&mut self) -> Node {
        if self.check(TokenKind::Fn) && self.peek_next_kind() == TokenKind::Identifier {
            return self.fn_declaration();
        }
        self.statement()
    }

    fn fn_declaration(&mut self) -> Node {
        let at = self.current;
        self.advance(); // fn
        self.consume(TokenKind::Identifier, "Expected function name after 'fn'.");
        let name = self.previous.lexeme.to_string();
        let params = self.fn_params();
        let body = self.block();
        self.expect_terminator();
        self.node(
            NodeKind::FnDecl(FnLiteral {
                name: Some(name),
                params,
                body: Box::new(body),
            }),
            at,
        )
    }

    fn fn_params(&mut self) -> Vec<String> {
        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        let mut params = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "Expected parameter name.");
                params.push(self.previous.lexeme.to_string());
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.");
        if params.len() > 255 {
            let (line, col) = (self.previous.line, self.previous.col);
            self.error_at(line, col, "Can't have more than 255 parameters.");
        }
        params
    }

    fn statement(&mut self) -> Node {
        match self.current.kind {
            TokenKind::Let => self.let_statement(),
            TokenKind::If => {
                let stmt = self.if_statement();
                self.expect_terminator();
                stmt
            }
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => {
                let at = self.current;
                self.advance();
                self.expect_terminator();
                self.node(NodeKind::Break, at)
            }
            TokenKind::Continue => {
                let at = self.current;
                self.advance();
                self.expect_terminator();
                self.node(NodeKind::Continue, at)
            }
            TokenKind::On => self.on_failure_statement(),
            TokenKind::Allow => self.allow_statement(),
            TokenKind::Parallel => self.parallel_statement(),
            TokenKind::Import => self.import_statement(),
            TokenKind::LeftBrace => {
                let stmt = self.block();
                self.expect_terminator();
                stmt
            }
            _ => self.expression_statement(),
        }
    }

    fn let_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // let
        self.consume(TokenKind::Identifier, "Expected variable name after 'let'.");
        let name = self.previous.lexeme.to_string();
        self.consume(TokenKind::Equal, "Expected '=' after variable name.");
        let value = self.expression();
        self.expect_terminator();
        self.node(
            NodeKind::VarDecl {
                name,
                initializer: Box::new(value),
            },
            at,
        )
    }

    fn if_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // if
        let condition = self.expression();
        let then_branch = self.block();
        let else_branch = if self.skip_newlines_if_followed_by(TokenKind::Else) {
            self.advance(); // else
            if self.check(TokenKind::If) {
                Some(Box::new(self.if_statement()))
            } else {
                Some(Box::new(self.block()))
            }
        } else {
            None
        };
        self.node(
            NodeKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch,
            },
            at,
        )
    }

    fn while_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // while
        let condition = self.expression();
        let body = self.block();
        self.expect_terminator();
        self.node(
            NodeKind::While {
                condition: Box::new(condition),
                body: Box::new(body),
            },
            at,
        )
    }

    fn for_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // for
        self.consume(TokenKind::Identifier, "Expected loop variable after 'for'.");
        let var = self.previous.lexeme.to_string();
        self.consume(TokenKind::In, "Expected 'in' after loop variable.");
        let iterable = self.expression();
        let body = self.block();
        self.expect_terminator();
        self.node(
            NodeKind::For {
                var,
                iterable: Box::new(iterable),
                body: Box::new(body),
            },
            at,
        )
    }

    fn return_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // return
        let value = if self.check(TokenKind::Newline)
            || self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RightBrace)
            || self.check(TokenKind::Eof)
        {
            None
        } else {
            Some(Box::new(self.expression()))
        };
        self.expect_terminator();
        self.node(NodeKind::Return(value), at)
    }

    fn on_failure_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // on
        self.consume(TokenKind::Failure, "Expected 'failure' after 'on'.");
        let body = self.block();
        self.expect_terminator();
        self.node(
            NodeKind::OnFailure {
                body: Box::new(body),
            },
            at,
        )
    }

    fn allow_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // allow
        let perm = match self.current.kind {
            TokenKind::Exec => PermKind::Exec,
            TokenKind::Net => PermKind::Net,
            TokenKind::Read => PermKind::Read,
            TokenKind::Write => PermKind::Write,
            TokenKind::Env => PermKind::Env,
            _ => {
                self.error_at_current(
                    "Expected permission kind (exec, net, read, write, env) after 'allow'.",
                );
                PermKind::Exec
            }
        };
        self.advance();
        let target = if self.matches(TokenKind::Str) || self.matches(TokenKind::RawStr) {
            unescape(self.previous.lexeme)
        } else {
            self.error_at_current("Expected permission target string.");
            String::new()
        };
        self.expect_terminator();
        self.node(NodeKind::Allow { perm, target }, at)
    }

    fn parallel_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // parallel
        self.consume(TokenKind::LeftBrace, "Expected '{' after 'parallel'.");
        let mut tasks = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            tasks.push(self.declaration());
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after parallel block.");
        self.expect_terminator();
        self.node(NodeKind::Parallel(tasks), at)
    }

    fn import_statement(&mut self) -> Node {
        let at = self.current;
        self.advance(); // import
        let path = if self.matches(TokenKind::Str) || self.matches(TokenKind::RawStr) {
            unescape(self.previous.lexeme)
        } else {
            self.error_at_current("Expected module path string after 'import'.");
            String::new()
        };
        let alias = if self.matches(TokenKind::As) {
            self.consume(TokenKind::Identifier, "Expected module alias after 'as'.");
            Some(self.previous.lexeme.to_string())
        } else {
            None
        };
        self.expect_terminator();
        self.node(NodeKind::Import { path, alias }, at)
    }

    fn block(&mut self) -> Node {
        let at = self.current;
        self.consume(TokenKind::LeftBrace, "Expected '{'.");
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            stmts.push(self.declaration());
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
        self.node(NodeKind::Block(stmts), at)
    }

    /// Expression statement, including the assignment forms. Assignment is
    /// a statement in Rivet, not an expression: `x = v` declares-or-updates,
    /// `xs[i] = v` and `m.k = v` store through the target.
    fn expression_statement(&mut self) -> Node {
        let at = self.current;
        let expr = self.expression();

        if self.matches(TokenKind::Equal) {
            let value = self.expression();
            let stmt = match expr.kind {
                NodeKind::Variable(name) => self.node(
                    NodeKind::VarDecl {
                        name,
                        initializer: Box::new(value),
                    },
                    at,
                ),
                NodeKind::Index { object, index } => {
                    let set = self.node(
                        NodeKind::IndexSet {
                            object,
                            index,
                            value: Box::new(value),
                        },
                        at,
                    );
                    self.node(NodeKind::ExprStmt(Box::new(set)), at)
                }
                NodeKind::Dot { object, name } => {
                    let set = self.node(
                        NodeKind::DotSet {
                            object,
                            name,
                            value: Box::new(value),
                        },
                        at,
                    );
                    self.node(NodeKind::ExprStmt(Box::new(set)), at)
                }
                _ => {
                    self.error_at(at.line, at.col, "Invalid assignment target.");
                    self.node(NodeKind::ExprStmt(Box::new(value)), at)
                }
            };
            self.expect_terminator();
            return stmt;
        }

        for (token, op) in [
            (TokenKind::PlusEqual, BinaryOp::Add),
            (TokenKind::MinusEqual, BinaryOp::Sub),
            (TokenKind::StarEqual, BinaryOp::Mul),
            (TokenKind::SlashEqual, BinaryOp::Div),
        ] {
            if self.matches(token) {
                let value = self.expression();
                let stmt = match expr.kind {
                    NodeKind::Variable(name) => {
                        let assign = self.node(
                            NodeKind::CompoundAssign {
                                name,
                                op,
                                value: Box::new(value),
                            },
                            at,
                        );
                        self.node(NodeKind::ExprStmt(Box::new(assign)), at)
                    }
                    _ => {
                        self.error_at(at.line, at.col, "Invalid compound assignment target.");
                        self.node(NodeKind::ExprStmt(Box::new(value)), at)
                    }
                };
                self.expect_terminator();
                return stmt;
            }
        }

        self.expect_terminator();
        self.node(NodeKind::ExprStmt(Box::new(expr)), at)
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expression(&mut self) -> Node {
        self.parse_precedence(Prec::Pipe)
    }

    fn parse_precedence(&mut self, min_prec: Prec) -> Node {
        let at = self.current;
        let mut lhs = if self.matches(TokenKind::Minus) {
            let operand = self.parse_precedence(Prec::Unary);
            self.node(
                NodeKind::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(operand),
                },
                at,
            )
        } else if self.matches(TokenKind::Bang) || self.matches(TokenKind::Not) {
            let operand = self.parse_precedence(Prec::Unary);
            self.node(
                NodeKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                at,
            )
        } else {
            self.postfix()
        };

        loop {
            let op_token = self.current;
            let prec = binary_prec(op_token.kind);
            if prec == Prec::None || prec < min_prec {
                break;
            }
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_precedence(next_prec(prec));
            lhs = match op_token.kind {
                TokenKind::Pipe => self.node(
                    NodeKind::Pipe {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    op_token,
                ),
                TokenKind::DotDot => self.node(
                    NodeKind::Range {
                        start: Box::new(lhs),
                        end: Box::new(rhs),
                    },
                    op_token,
                ),
                _ => {
                    let op = match op_token.kind {
                        TokenKind::Plus => BinaryOp::Add,
                        TokenKind::Minus => BinaryOp::Sub,
                        TokenKind::Star => BinaryOp::Mul,
                        TokenKind::Slash => BinaryOp::Div,
                        TokenKind::Percent => BinaryOp::Mod,
                        TokenKind::EqualEqual => BinaryOp::Eq,
                        TokenKind::BangEqual => BinaryOp::Ne,
                        TokenKind::Less => BinaryOp::Lt,
                        TokenKind::LessEqual => BinaryOp::Le,
                        TokenKind::Greater => BinaryOp::Gt,
                        TokenKind::GreaterEqual => BinaryOp::Ge,
                        TokenKind::And | TokenKind::AmpAmp => BinaryOp::And,
                        TokenKind::Or | TokenKind::PipePipe => BinaryOp::Or,
                        _ => unreachable!("non-binary token in precedence loop"),
                    };
                    self.node(
                        NodeKind::Binary {
                            op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        op_token,
                    )
                }
            };
        }
        lhs
    }

    fn postfix(&mut self) -> Node {
        let mut expr = self.primary();
        loop {
            if self.matches(TokenKind::LeftParen) {
                let at = self.previous;
                let args = self.call_args();
                expr = self.node(
                    NodeKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    at,
                );
            } else if self.matches(TokenKind::LeftBracket) {
                let at = self.previous;
                self.skip_newlines();
                let index = self.expression();
                self.skip_newlines();
                self.consume(TokenKind::RightBracket, "Expected ']' after index.");
                expr = self.node(
                    NodeKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    at,
                );
            } else if self.matches(TokenKind::Dot) {
                let at = self.previous;
                let name = self.property_name();
                expr = self.node(
                    NodeKind::Dot {
                        object: Box::new(expr),
                        name,
                    },
                    at,
                );
            } else {
                return expr;
            }
        }
    }

    /// Property names may collide with keywords (`result.exec`, `m.match`),
    /// so any word token is accepted after `.`.
    fn property_name(&mut self) -> String {
        if self.check(TokenKind::Identifier) || self.current.lexeme.chars().all(|c| c.is_ascii_alphabetic()) && !self.current.lexeme.is_empty() {
            let name = self.current.lexeme.to_string();
            self.advance();
            name
        } else {
            self.error_at_current("Expected property name after '.'.");
            String::new()
        }
    }

    fn call_args(&mut self) -> Vec<Node> {
        let mut args = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.expression());
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments.");
        if args.len() > 255 {
            let (line, col) = (self.previous.line, self.previous.col);
            self.error_at(line, col, "Can't have more than 255 arguments.");
        }
        args
    }

    fn primary(&mut self) -> Node {
        let at = self.current;
        match self.current.kind {
            TokenKind::Number => {
                self.advance();
                let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
                self.node(NodeKind::Number(value), at)
            }
            TokenKind::Str => {
                self.advance();
                self.node(NodeKind::Str(unescape(self.previous.lexeme)), at)
            }
            TokenKind::RawStr => {
                self.advance();
                self.node(NodeKind::Str(self.previous.lexeme.to_string()), at)
            }
            TokenKind::FStr => {
                self.advance();
                self.fstring_expr(at)
            }
            TokenKind::True => {
                self.advance();
                self.node(NodeKind::Bool(true), at)
            }
            TokenKind::False => {
                self.advance();
                self.node(NodeKind::Bool(false), at)
            }
            TokenKind::Nil => {
                self.advance();
                self.node(NodeKind::Nil, at)
            }
            TokenKind::Identifier => {
                self.advance();
                self.node(NodeKind::Variable(self.previous.lexeme.to_string()), at)
            }
            TokenKind::LeftParen => {
                self.advance();
                self.skip_newlines();
                let expr = self.expression();
                self.skip_newlines();
                self.consume(TokenKind::RightParen, "Expected ')' after expression.");
                expr
            }
            TokenKind::LeftBracket => self.list_literal(),
            TokenKind::LeftBrace => self.map_literal(),
            TokenKind::Fn => self.lambda(),
            TokenKind::Match => self.match_expression(),
            TokenKind::Exec => {
                self.advance();
                let command = self.parse_precedence(Prec::Unary);
                self.node(
                    NodeKind::Exec {
                        command: Box::new(command),
                    },
                    at,
                )
            }
            _ => {
                self.error_at_current("Expected expression.");
                self.advance();
                self.node(NodeKind::Nil, at)
            }
        }
    }

    fn list_literal(&mut self) -> Node {
        let at = self.current;
        self.advance(); // [
        let mut elements = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RightBracket) {
            loop {
                elements.push(self.expression());
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after list elements.");
        self.node(NodeKind::List(elements), at)
    }

    fn map_literal(&mut self) -> Node {
        let at = self.current;
        self.advance(); // {
        let mut entries = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RightBrace) {
            loop {
                // Bare identifiers before ':' are shorthand for string keys.
                let key = if self.check(TokenKind::Identifier)
                    && self.peek_next_kind() == TokenKind::Colon
                {
                    let key_at = self.current;
                    self.advance();
                    self.node(NodeKind::Str(self.previous.lexeme.to_string()), key_at)
                } else {
                    self.expression()
                };
                self.consume(TokenKind::Colon, "Expected ':' after map key.");
                self.skip_newlines();
                let value = self.expression();
                entries.push((key, value));
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after map entries.");
        self.node(NodeKind::Map(entries), at)
    }

    fn lambda(&mut self) -> Node {
        let at = self.current;
        self.advance(); // fn
        let params = self.fn_params();
        let body = self.block();
        self.node(
            NodeKind::Lambda(FnLiteral {
                name: None,
                params,
                body: Box::new(body),
            }),
            at,
        )
    }

    fn match_expression(&mut self) -> Node {
        let at = self.current;
        self.advance(); // match
        let subject = self.expression();
        self.consume(TokenKind::LeftBrace, "Expected '{' after match subject.");
        self.skip_newlines();
        let mut arms = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            let pattern = if self.check(TokenKind::Identifier) && self.current.lexeme == "_" {
                self.advance();
                None
            } else {
                Some(self.expression())
            };
            self.consume(TokenKind::Arrow, "Expected '->' after match pattern.");
            self.skip_newlines();
            let body = if self.check(TokenKind::LeftBrace) {
                self.block()
            } else {
                self.expression()
            };
            arms.push(MatchArm { pattern, body });
            if !self.matches(TokenKind::Comma) && !self.check(TokenKind::Newline) {
                break;
            }
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after match arms.");
        self.node(
            NodeKind::Match {
                subject: Box::new(subject),
                arms,
            },
            at,
        )
    }

    /// Desugar an f-string into `"text" + str(expr) + ...` concatenation.
    fn fstring_expr(&mut self, at: Token) -> Node {
        let raw = self.previous.lexeme;
        let mut parts: Vec<Node> = Vec::new();
        let mut text = String::new();
        let bytes = raw.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    text.push(bytes[i] as char);
                    text.push(bytes[i + 1] as char);
                    i += 2;
                }
                b'{' => {
                    // Find the matching close brace (expressions may contain
                    // nested braces from map literals).
                    let mut depth = 1;
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && depth > 0 {
                        match bytes[end] {
                            b'{' => depth += 1,
                            b'}' => depth -= 1,
                            _ => {}
                        }
                        if depth > 0 {
                            end += 1;
                        }
                    }
                    if depth != 0 {
                        self.error_at(at.line, at.col, "Unclosed '{' in f-string.");
                        break;
                    }
                    if !text.is_empty() {
                        parts.push(self.node(NodeKind::Str(unescape(&text)), at));
                        text.clear();
                    }
                    let inner = &raw[start..end];
                    match parse_embedded_expression(inner) {
                        Ok(expr) => {
                            // Wrap in str() so concatenation always sees strings.
                            let callee =
                                self.node(NodeKind::Variable("str".to_string()), at);
                            parts.push(self.node(
                                NodeKind::Call {
                                    callee: Box::new(callee),
                                    args: vec![expr],
                                },
                                at,
                            ));
                        }
                        Err(message) => self.error_at(at.line, at.col, &message),
                    }
                    i = end + 1;
                }
                c => {
                    text.push(c as char);
                    i += 1;
                }
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(self.node(NodeKind::Str(unescape(&text)), at));
        }

        let mut iter = parts.into_iter();
        let mut expr = iter.next().expect("f-string has at least one part");
        for part in iter {
            expr = self.node(
                NodeKind::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(expr),
                    rhs: Box::new(part),
                },
                at,
            );
        }
        expr
    }
}

/// Parse a single expression embedded in an f-string.
fn parse_embedded_expression(source: &str) -> Result<Node, String> {
    let mut parser = Parser::new(source);
    let expr = parser.expression();
    if !parser.check(TokenKind::Eof) {
        return Err("Unexpected trailing input in f-string expression.".to_string());
    }
    match parser.errors.into_iter().next() {
        Some(err) => Err(err.message),
        None => Ok(expr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Node {
        parse(source).unwrap_or_else(|errs| panic!("parse failed: {:?}", errs))
    }

    fn program_stmts(node: Node) -> Vec<Node> {
        match node.kind {
            NodeKind::Program(stmts) => stmts,
            other => panic!("expected program, got {:?}", other),
        }
    }

    #[test]
    fn parses_fn_declaration() {
        let stmts = program_stmts(parse_ok("fn add(a, b) { return a + b }"));
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            NodeKind::FnDecl(f) => {
                assert_eq!(f.name.as_deref(), Some("add"));
                assert_eq!(f.params, vec!["a", "b"]);
            }
            other => panic!("expected fn decl, got {:?}", other),
        }
    }

    #[test]
    fn assignment_is_var_decl() {
        let stmts = program_stmts(parse_ok("x = 1"));
        assert!(matches!(stmts[0].kind, NodeKind::VarDecl { .. }));
    }

    #[test]
    fn index_assignment_becomes_index_set() {
        let stmts = program_stmts(parse_ok("xs[0] = 5"));
        match &stmts[0].kind {
            NodeKind::ExprStmt(inner) => {
                assert!(matches!(inner.kind, NodeKind::IndexSet { .. }))
            }
            other => panic!("expected expr stmt, got {:?}", other),
        }
    }

    #[test]
    fn dot_assignment_becomes_dot_set() {
        let stmts = program_stmts(parse_ok("config.env = \"prod\""));
        match &stmts[0].kind {
            NodeKind::ExprStmt(inner) => {
                assert!(matches!(inner.kind, NodeKind::DotSet { .. }))
            }
            other => panic!("expected expr stmt, got {:?}", other),
        }
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let stmts = program_stmts(parse_ok("r = 1 + 2 * 3"));
        match &stmts[0].kind {
            NodeKind::VarDecl { initializer, .. } => match &initializer.kind {
                NodeKind::Binary { op, rhs, .. } => {
                    assert_eq!(*op, BinaryOp::Add);
                    assert!(matches!(
                        rhs.kind,
                        NodeKind::Binary {
                            op: BinaryOp::Mul,
                            ..
                        }
                    ));
                }
                other => panic!("expected binary, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn pipe_parses_lowest() {
        let stmts = program_stmts(parse_ok("r = 1 + 2 | inc"));
        match &stmts[0].kind {
            NodeKind::VarDecl { initializer, .. } => {
                assert!(matches!(initializer.kind, NodeKind::Pipe { .. }))
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn match_with_wildcard() {
        let src = "r = match x {\n  1 -> \"a\",\n  _ -> \"z\"\n}";
        let stmts = program_stmts(parse_ok(src));
        match &stmts[0].kind {
            NodeKind::VarDecl { initializer, .. } => match &initializer.kind {
                NodeKind::Match { arms, .. } => {
                    assert_eq!(arms.len(), 2);
                    assert!(arms[0].pattern.is_some());
                    assert!(arms[1].pattern.is_none());
                }
                other => panic!("expected match, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn on_failure_block() {
        let stmts = program_stmts(parse_ok("on failure {\n  print(error)\n}\nx = 1"));
        assert!(matches!(stmts[0].kind, NodeKind::OnFailure { .. }));
        assert!(matches!(stmts[1].kind, NodeKind::VarDecl { .. }));
    }

    #[test]
    fn allow_statement_forms() {
        let stmts = program_stmts(parse_ok("allow exec \"git*\"\nallow read \"/tmp/*\""));
        match &stmts[0].kind {
            NodeKind::Allow { perm, target } => {
                assert_eq!(*perm, PermKind::Exec);
                assert_eq!(target, "git*");
            }
            other => panic!("expected allow, got {:?}", other),
        }
        assert!(matches!(
            stmts[1].kind,
            NodeKind::Allow {
                perm: PermKind::Read,
                ..
            }
        ));
    }

    #[test]
    fn import_with_alias() {
        let stmts = program_stmts(parse_ok("import \"lib/utils\" as u"));
        match &stmts[0].kind {
            NodeKind::Import { path, alias } => {
                assert_eq!(path, "lib/utils");
                assert_eq!(alias.as_deref(), Some("u"));
            }
            other => panic!("expected import, got {:?}", other),
        }
    }

    #[test]
    fn fstring_desugars_to_concat() {
        let stmts = program_stmts(parse_ok("s = f\"n = {n}!\""));
        match &stmts[0].kind {
            NodeKind::VarDecl { initializer, .. } => {
                // ("n = " + str(n)) + "!"
                assert!(matches!(
                    initializer.kind,
                    NodeKind::Binary {
                        op: BinaryOp::Add,
                        ..
                    }
                ));
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn lambda_expression() {
        let stmts = program_stmts(parse_ok("f = fn(x) { return x }"));
        match &stmts[0].kind {
            NodeKind::VarDecl { initializer, .. } => {
                assert!(matches!(initializer.kind, NodeKind::Lambda(_)))
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn exec_expression() {
        let stmts = program_stmts(parse_ok("r = exec \"ls\""));
        match &stmts[0].kind {
            NodeKind::VarDecl { initializer, .. } => {
                assert!(matches!(initializer.kind, NodeKind::Exec { .. }))
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn else_on_next_line() {
        let src = "if x {\n  a()\n}\nelse {\n  b()\n}";
        let stmts = program_stmts(parse_ok(src));
        match &stmts[0].kind {
            NodeKind::If { else_branch, .. } => assert!(else_branch.is_some()),
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn reports_error_with_location() {
        let errs = parse("x = ").unwrap_err();
        assert!(!errs.is_empty());
        assert_eq!(errs[0].line, 1);
    }

    #[test]
    fn map_literal_shorthand_keys() {
        let stmts = program_stmts(parse_ok("m = {name: \"a\", \"age\": 3}"));
        match &stmts[0].kind {
            NodeKind::VarDecl { initializer, .. } => match &initializer.kind {
                NodeKind::Map(entries) => assert_eq!(entries.len(), 2),
                other => panic!("expected map, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }
}
