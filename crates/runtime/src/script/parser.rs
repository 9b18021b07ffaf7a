//! Recursive-descent parser for fragment functions.
//!
//! A fragment must consist of exactly one function literal:
//!
//! ```text
//! fn(payload) {
//!     let total = payload.total ?? 0;
//!     db.insert("visits", { total: total });
//! }
//! ```

use serde_json::Value;

use super::SyntaxError;
use super::ast::{Accessor, BinaryOp, Expr, Function, Place, Stmt, UnaryOp};
use super::lexer::{Token, TokenKind, tokenize};

/// Maximum nesting depth for blocks and expressions.
const MAX_DEPTH: usize = 64;

/// Parse source text into a single function literal.
pub fn parse_function(source: &str) -> Result<Function, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let function = parser.function()?;
    parser.expect(&TokenKind::Eof, "after the function body")?;
    Ok(function)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token stream always ends with Eof and we never advance past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(token.line, token.col, message)
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> Result<Token, SyntaxError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!(
                "expected {} {context}, found {}",
                kind.describe(),
                self.peek_kind().describe()
            )))
        }
    }

    fn ident(&mut self, context: &str) -> Result<String, SyntaxError> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!(
                "expected identifier {context}, found {}",
                other.describe()
            ))),
        }
    }

    fn enter(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error_here("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn function(&mut self) -> Result<Function, SyntaxError> {
        if !self.check(&TokenKind::Fn) {
            return Err(self.error_here(format!(
                "fragment must be a single function literal `fn(...) {{ ... }}`, found {}",
                self.peek_kind().describe()
            )));
        }
        self.advance();
        self.expect(&TokenKind::LParen, "to open the parameter list")?;

        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let name = self.ident("in parameter list")?;
                if params.contains(&name) {
                    return Err(self.error_here(format!("duplicate parameter '{name}'")));
                }
                params.push(name);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "to close the parameter list")?;
        let body = self.block()?;
        Ok(Function { params, body })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.enter()?;
        self.expect(&TokenKind::LBrace, "to open a block")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.error_here("unexpected end of input, missing '}'"));
            }
            stmts.push(self.statement()?);
        }
        self.advance();
        self.leave();
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        match self.peek_kind() {
            TokenKind::Let => {
                self.advance();
                let name = self.ident("after 'let'")?;
                self.expect(&TokenKind::Assign, "in let binding")?;
                let value = self.expression()?;
                self.expect(&TokenKind::Semi, "after let binding")?;
                Ok(Stmt::Let { name, value })
            }
            TokenKind::If => self.if_statement(),
            TokenKind::For => {
                self.advance();
                let binding = self.ident("after 'for'")?;
                self.expect(&TokenKind::In, "in for loop")?;
                let iterable = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    binding,
                    iterable,
                    body,
                })
            }
            TokenKind::Return => {
                self.advance();
                if self.eat(&TokenKind::Semi) {
                    return Ok(Stmt::Return(None));
                }
                let value = self.expression()?;
                self.expect(&TokenKind::Semi, "after return value")?;
                Ok(Stmt::Return(Some(value)))
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.expression()?;
                self.expect(&TokenKind::Semi, "after throw")?;
                Ok(Stmt::Throw(value))
            }
            TokenKind::Break => {
                self.advance();
                self.expect(&TokenKind::Semi, "after 'break'")?;
                Ok(Stmt::Break)
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(&TokenKind::Semi, "after 'continue'")?;
                Ok(Stmt::Continue)
            }
            TokenKind::Fn => Err(self.error_here("nested function definitions are not allowed")),
            _ => {
                let start = self.peek().clone();
                let expr = self.expression()?;
                if self.check(&TokenKind::Assign) {
                    let target = into_place(expr).ok_or_else(|| {
                        SyntaxError::new(start.line, start.col, "invalid assignment target")
                    })?;
                    self.advance();
                    let value = self.expression()?;
                    self.expect(&TokenKind::Semi, "after assignment")?;
                    return Ok(Stmt::Assign { target, value });
                }
                self.expect(&TokenKind::Semi, "after expression")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect(&TokenKind::If, "")?;
        let cond = self.expression()?;
        let then_branch = self.block()?;
        let else_branch = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                Some(vec![self.if_statement()?])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        self.enter()?;
        let expr = self.binary(0);
        self.leave();
        expr
    }

    /// Precedence climbing over binary operators.
    ///
    /// Every operator folded into `left` deepens the tree by one level, so it
    /// counts against the nesting limit like an explicit parenthesis.
    fn binary(&mut self, min_prec: u8) -> Result<Expr, SyntaxError> {
        let mut left = self.unary()?;
        let mut folded = 0;
        while let Some((op, prec)) = binary_op(self.peek_kind()) {
            if prec < min_prec {
                break;
            }
            self.enter()?;
            folded += 1;
            let line = self.advance().line;
            let right = self.binary(prec + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                line,
            };
        }
        self.depth -= folded;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.peek_kind() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        let mut folded = 0;
        loop {
            if matches!(
                self.peek_kind(),
                TokenKind::Dot | TokenKind::LBracket | TokenKind::LParen
            ) {
                self.enter()?;
                folded += 1;
            }
            match self.peek_kind() {
                TokenKind::Dot => {
                    let line = self.advance().line;
                    let field = self.ident("after '.'")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        field,
                        line,
                    };
                }
                TokenKind::LBracket => {
                    let line = self.advance().line;
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "to close index")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                TokenKind::LParen => {
                    let open = self.advance();
                    let args = self.arguments()?;
                    expr = match expr {
                        Expr::Var { name, line } => Expr::Call {
                            function: name,
                            args,
                            line,
                        },
                        Expr::Member {
                            object,
                            field,
                            line,
                        } => match *object {
                            Expr::Var { name, .. } => Expr::Capability {
                                object: name,
                                method: field,
                                args,
                                line,
                            },
                            _ => {
                                return Err(SyntaxError::new(
                                    open.line,
                                    open.col,
                                    "only builtin functions and capability methods can be called",
                                ));
                            }
                        },
                        _ => {
                            return Err(SyntaxError::new(
                                open.line,
                                open.col,
                                "only builtin functions and capability methods can be called",
                            ));
                        }
                    };
                }
                _ => {
                    self.depth -= folded;
                    return Ok(expr);
                }
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "to close argument list")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.advance();
        let expr = match token.kind {
            TokenKind::Int(n) => Expr::Literal(Value::from(n)),
            TokenKind::Float(n) => Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            TokenKind::Str(s) => Expr::Literal(Value::String(s)),
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::Null => Expr::Literal(Value::Null),
            TokenKind::Ident(name) => Expr::Var {
                name,
                line: token.line,
            },
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "to close parenthesis")?;
                inner
            }
            TokenKind::LBracket => {
                self.enter()?;
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.expression()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket, "to close array literal")?;
                self.leave();
                Expr::Array(items)
            }
            TokenKind::LBrace => {
                self.enter()?;
                let mut fields = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let key = match self.peek_kind().clone() {
                        TokenKind::Ident(name) => name,
                        TokenKind::Str(s) => s,
                        other => {
                            return Err(self.error_here(format!(
                                "expected object key, found {}",
                                other.describe()
                            )));
                        }
                    };
                    let key_token = self.advance();
                    let value = if self.eat(&TokenKind::Colon) {
                        self.expression()?
                    } else {
                        // Shorthand `{ email }`.
                        Expr::Var {
                            name: key.clone(),
                            line: key_token.line,
                        }
                    };
                    fields.push((key, value));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "to close object literal")?;
                self.leave();
                Expr::Object(fields)
            }
            TokenKind::Fn => {
                return Err(SyntaxError::new(
                    token.line,
                    token.col,
                    "nested function definitions are not allowed",
                ));
            }
            other => {
                return Err(SyntaxError::new(
                    token.line,
                    token.col,
                    format!("unexpected {}", other.describe()),
                ));
            }
        };
        Ok(expr)
    }
}

fn binary_op(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
    let op = match kind {
        TokenKind::Coalesce => (BinaryOp::Coalesce, 1),
        TokenKind::OrOr => (BinaryOp::Or, 2),
        TokenKind::AndAnd => (BinaryOp::And, 3),
        TokenKind::Eq => (BinaryOp::Eq, 4),
        TokenKind::NotEq => (BinaryOp::NotEq, 4),
        TokenKind::Lt => (BinaryOp::Lt, 5),
        TokenKind::LtEq => (BinaryOp::LtEq, 5),
        TokenKind::Gt => (BinaryOp::Gt, 5),
        TokenKind::GtEq => (BinaryOp::GtEq, 5),
        TokenKind::Plus => (BinaryOp::Add, 6),
        TokenKind::Minus => (BinaryOp::Sub, 6),
        TokenKind::Star => (BinaryOp::Mul, 7),
        TokenKind::Slash => (BinaryOp::Div, 7),
        TokenKind::Percent => (BinaryOp::Rem, 7),
        _ => return None,
    };
    Some(op)
}

/// Convert a parsed expression into an assignment target.
fn into_place(expr: Expr) -> Option<Place> {
    let mut path = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Var { name, line } => {
                path.reverse();
                return Some(Place {
                    root: name,
                    path,
                    line,
                });
            }
            Expr::Member { object, field, .. } => {
                path.push(Accessor::Field(field));
                current = *object;
            }
            Expr::Index { object, index, .. } => {
                path.push(Accessor::Index(*index));
                current = *object;
            }
            _ => return None,
        }
    }
}
