//! Compile-time scope resolution.
//!
//! Every identifier must resolve to a parameter or a `let` binding in an
//! enclosing block. Calls must name a builtin or a method on one of the
//! capability objects. Capability objects are not values: they cannot be
//! read, assigned, rebound or passed around.

use std::collections::HashSet;

use super::SyntaxError;
use super::ast::{Accessor, Expr, Function, Place, Stmt};
use super::builtins;

/// Capability objects and their callable methods.
pub type Surface = [(&'static str, &'static [&'static str])];

/// Validate a parsed function against the builtin table and capability surface.
pub fn check_function(function: &Function, surface: &Surface) -> Result<(), SyntaxError> {
    let mut checker = Checker {
        surface,
        scopes: vec![HashSet::new()],
        loop_depth: 0,
    };
    for param in &function.params {
        checker.declare(param, 1)?;
    }
    checker.block(&function.body)
}

struct Checker<'a> {
    surface: &'a Surface,
    scopes: Vec<HashSet<String>>,
    loop_depth: usize,
}

impl Checker<'_> {
    fn is_capability(&self, name: &str) -> bool {
        self.surface.iter().any(|(object, _)| *object == name)
    }

    fn declare(&mut self, name: &str, line: usize) -> Result<(), SyntaxError> {
        if self.is_capability(name) {
            return Err(SyntaxError::at_line(
                line,
                format!("'{name}' is a capability and cannot be rebound"),
            ));
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
        Ok(())
    }

    fn is_defined(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.contains(name))
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), SyntaxError> {
        self.scopes.push(HashSet::new());
        let result = stmts.iter().try_for_each(|stmt| self.statement(stmt));
        self.scopes.pop();
        result
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<(), SyntaxError> {
        match stmt {
            Stmt::Let { name, value } => {
                self.expr(value)?;
                self.declare(name, expr_line(value))
            }
            Stmt::Assign { target, value } => {
                self.place(target)?;
                self.expr(value)
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond)?;
                self.block(then_branch)?;
                if let Some(else_branch) = else_branch {
                    self.block(else_branch)?;
                }
                Ok(())
            }
            Stmt::For {
                binding,
                iterable,
                body,
            } => {
                self.expr(iterable)?;
                self.scopes.push(HashSet::new());
                self.loop_depth += 1;
                let result = self
                    .declare(binding, expr_line(iterable))
                    .and_then(|()| self.block(body));
                self.loop_depth -= 1;
                self.scopes.pop();
                result
            }
            Stmt::Return(value) => value.as_ref().map_or(Ok(()), |v| self.expr(v)),
            Stmt::Throw(value) | Stmt::Expr(value) => self.expr(value),
            Stmt::Break | Stmt::Continue => {
                if self.loop_depth == 0 {
                    return Err(SyntaxError::at_line(0, "'break'/'continue' outside of a loop"));
                }
                Ok(())
            }
        }
    }

    fn place(&mut self, place: &Place) -> Result<(), SyntaxError> {
        if self.is_capability(&place.root) {
            return Err(SyntaxError::at_line(
                place.line,
                format!("cannot assign to capability '{}'", place.root),
            ));
        }
        if !self.is_defined(&place.root) {
            return Err(SyntaxError::at_line(
                place.line,
                format!("assignment to undeclared variable '{}'", place.root),
            ));
        }
        for accessor in &place.path {
            if let Accessor::Index(index) = accessor {
                self.expr(index)?;
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), SyntaxError> {
        match expr {
            Expr::Literal(_) => Ok(()),
            Expr::Var { name, line } => {
                if self.is_capability(name) {
                    return Err(SyntaxError::at_line(
                        *line,
                        format!("capability '{name}' can only be used to call its methods"),
                    ));
                }
                if !self.is_defined(name) {
                    return Err(SyntaxError::at_line(
                        *line,
                        format!("unknown identifier '{name}'"),
                    ));
                }
                Ok(())
            }
            Expr::Array(items) => items.iter().try_for_each(|item| self.expr(item)),
            Expr::Object(fields) => fields.iter().try_for_each(|(_, value)| self.expr(value)),
            Expr::Member { object, .. } => self.expr(object),
            Expr::Index { object, index, .. } => {
                self.expr(object)?;
                self.expr(index)
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Binary { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::Call {
                function,
                args,
                line,
            } => {
                let Some((min, max)) = builtins::arity(function) else {
                    return Err(SyntaxError::at_line(
                        *line,
                        format!("unknown function '{function}'"),
                    ));
                };
                if args.len() < min || args.len() > max {
                    return Err(SyntaxError::at_line(
                        *line,
                        format!(
                            "'{function}' takes {} arguments, got {}",
                            describe_arity(min, max),
                            args.len()
                        ),
                    ));
                }
                args.iter().try_for_each(|arg| self.expr(arg))
            }
            Expr::Capability {
                object,
                method,
                args,
                line,
            } => {
                let Some((_, methods)) = self.surface.iter().find(|(o, _)| *o == object.as_str()) else {
                    if self.is_defined(object) {
                        return Err(SyntaxError::at_line(
                            *line,
                            format!("'{object}.{method}' is not callable"),
                        ));
                    }
                    return Err(SyntaxError::at_line(
                        *line,
                        format!("unknown capability '{object}'"),
                    ));
                };
                if !methods.contains(&method.as_str()) {
                    return Err(SyntaxError::at_line(
                        *line,
                        format!(
                            "capability '{object}' has no method '{method}' (available: {})",
                            methods.join(", ")
                        ),
                    ));
                }
                args.iter().try_for_each(|arg| self.expr(arg))
            }
        }
    }
}

fn describe_arity(min: usize, max: usize) -> String {
    if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    }
}

fn expr_line(expr: &Expr) -> usize {
    match expr {
        Expr::Var { line, .. }
        | Expr::Member { line, .. }
        | Expr::Index { line, .. }
        | Expr::Binary { line, .. }
        | Expr::Call { line, .. }
        | Expr::Capability { line, .. } => *line,
        Expr::Unary { operand, .. } => expr_line(operand),
        Expr::Literal(_) | Expr::Array(_) | Expr::Object(_) => 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::script::parse_function;

    const SURFACE: &Surface = &[("db", &["insert", "query"]), ("log", &["info"])];

    fn check(src: &str) -> Result<(), SyntaxError> {
        check_function(&parse_function(src).unwrap(), SURFACE)
    }

    #[test]
    fn accepts_params_locals_and_capabilities() {
        check(
            r#"fn(payload) {
                let rows = db.query("visits", {});
                for row in rows { log.info(str(row)); }
                return len(rows) + payload.total;
            }"#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_unknown_identifiers() {
        let err = check("fn() { return process; }").unwrap_err();
        assert!(err.message.contains("unknown identifier 'process'"));
    }

    #[test]
    fn rejects_unknown_functions() {
        let err = check("fn() { require(\"fs\"); }").unwrap_err();
        assert!(err.message.contains("unknown function 'require'"));
    }

    #[test]
    fn rejects_unknown_capability_methods() {
        let err = check("fn() { db.drop(\"visits\"); }").unwrap_err();
        assert!(err.message.contains("no method 'drop'"));
    }

    #[test]
    fn rejects_unknown_capability_objects() {
        let err = check("fn() { fs.read(\"/etc/passwd\"); }").unwrap_err();
        assert!(err.message.contains("unknown capability 'fs'"));
    }

    #[test]
    fn capabilities_are_not_values() {
        assert!(check("fn() { let d = db; }").is_err());
        assert!(check("fn() { db = 1; }").is_err());
        assert!(check("fn(db) { }").is_err());
        assert!(check("fn() { let log = 1; }").is_err());
    }

    #[test]
    fn block_scoping_is_enforced() {
        let err = check("fn() { if true { let x = 1; } return x; }").unwrap_err();
        assert!(err.message.contains("unknown identifier 'x'"));
    }

    #[test]
    fn builtin_arity_is_checked() {
        let err = check("fn() { return len(); }").unwrap_err();
        assert!(err.message.contains("'len' takes 1 arguments"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(check("fn() { break; }").is_err());
        check("fn(xs) { for x in xs { break; } }").unwrap();
    }

    #[test]
    fn assignment_requires_declaration() {
        assert!(check("fn() { total = 1; }").is_err());
        check("fn() { let total = 0; total = total + 1; }").unwrap();
    }
}
