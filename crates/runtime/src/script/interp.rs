//! Async tree-walking interpreter.
//!
//! Every statement and loop iteration consumes one step from the budget, and
//! every value the fragment builds is billed by size on top of that. The
//! interpreter yields to the scheduler periodically so a surrounding
//! `tokio::time::timeout` can abandon a long-running fragment.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::ast::{Accessor, BinaryOp, Expr, Function, Place, Stmt, UnaryOp};
use super::value::{self, truthy, type_name};
use super::{ExecError, builtins};

/// Steps between cooperative yields.
const YIELD_EVERY: u64 = 256;

/// Size units of a built value that cost one extra step.
const SIZE_PER_STEP: usize = 256;

/// Resource bounds for one run.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    /// Steps before the run is aborted.
    pub steps: u64,
    /// Largest value the run may build, in [`value::size_within`] units.
    pub value_size: usize,
}

/// Host side of capability calls (`db.insert(...)`, `log.info(...)`).
#[async_trait]
pub trait HostBridge: Send + Sync {
    async fn invoke(&self, object: &str, method: &str, args: Vec<Value>)
    -> Result<Value, ExecError>;
}

type Eval<'a, T> = Pin<Box<dyn Future<Output = Result<T, ExecError>> + Send + 'a>>;

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Run a compiled function with positional arguments.
///
/// Missing arguments are bound to `null`; extra arguments are ignored.
pub async fn execute(
    function: &Function,
    args: Vec<Value>,
    host: &dyn HostBridge,
    budget: Budget,
) -> Result<Value, ExecError> {
    let mut frame = HashMap::new();
    let mut args = args.into_iter();
    for param in &function.params {
        frame.insert(param.clone(), args.next().unwrap_or(Value::Null));
    }

    let mut interp = Interpreter {
        host,
        budget,
        steps: 0,
        since_yield: 0,
        scopes: vec![frame],
    };

    match interp.block(&function.body).await? {
        Flow::Return(value) => Ok(value),
        Flow::Normal | Flow::Break | Flow::Continue => Ok(Value::Null),
    }
}

struct Interpreter<'h> {
    host: &'h dyn HostBridge,
    budget: Budget,
    steps: u64,
    since_yield: u64,
    scopes: Vec<HashMap<String, Value>>,
}

impl<'h> Interpreter<'h> {
    async fn tick(&mut self) -> Result<(), ExecError> {
        self.consume(1)?;
        if self.since_yield >= YIELD_EVERY {
            self.since_yield = 0;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn consume(&mut self, steps: u64) -> Result<(), ExecError> {
        self.steps = self.steps.saturating_add(steps);
        self.since_yield = self.since_yield.saturating_add(steps);
        if self.steps > self.budget.steps {
            return Err(ExecError::BudgetExhausted(self.budget.steps));
        }
        Ok(())
    }

    /// Bill a freshly built value against the budget, rejecting it outright
    /// past the size limit.
    fn charge(&mut self, value: Value) -> Result<Value, ExecError> {
        let size = value::size_within(&value, self.budget.value_size)
            .ok_or(ExecError::ValueTooLarge(self.budget.value_size))?;
        self.consume(u64::try_from(size / SIZE_PER_STEP).unwrap_or(u64::MAX))?;
        Ok(value)
    }

    fn lookup(&self, name: &str) -> Result<Value, ExecError> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
            .ok_or_else(|| ExecError::Type(format!("unknown identifier '{name}'")))
    }

    fn bind(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn block<'a>(&'a mut self, stmts: &'a [Stmt]) -> Eval<'a, Flow> {
        Box::pin(async move {
            self.scopes.push(HashMap::new());
            let result = self.statements(stmts).await;
            self.scopes.pop();
            result
        })
    }

    async fn statements(&mut self, stmts: &[Stmt]) -> Result<Flow, ExecError> {
        for stmt in stmts {
            match self.statement(stmt).await? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn statement<'a>(&'a mut self, stmt: &'a Stmt) -> Eval<'a, Flow> {
        Box::pin(async move {
            self.tick().await?;
            match stmt {
                Stmt::Let { name, value } => {
                    let value = self.eval(value).await?;
                    self.bind(name, value);
                    Ok(Flow::Normal)
                }
                Stmt::Assign { target, value } => {
                    let mut keys = Vec::new();
                    for accessor in &target.path {
                        if let Accessor::Index(index) = accessor {
                            keys.push(self.eval(index).await?);
                        }
                    }
                    let value = self.eval(value).await?;
                    let value = self.charge(value)?;
                    self.assign(target, keys, value)?;
                    Ok(Flow::Normal)
                }
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    if truthy(&self.eval(cond).await?) {
                        self.block(then_branch).await
                    } else if let Some(else_branch) = else_branch {
                        self.block(else_branch).await
                    } else {
                        Ok(Flow::Normal)
                    }
                }
                Stmt::For {
                    binding,
                    iterable,
                    body,
                } => {
                    let items = match self.eval(iterable).await? {
                        Value::Array(items) => items,
                        Value::Object(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
                        Value::Null => Vec::new(),
                        other => {
                            return Err(ExecError::Type(format!(
                                "cannot iterate over {}",
                                type_name(&other)
                            )));
                        }
                    };
                    for item in items {
                        self.tick().await?;
                        self.scopes.push(HashMap::from([(binding.clone(), item)]));
                        let flow = self.block(body).await;
                        self.scopes.pop();
                        match flow? {
                            Flow::Normal | Flow::Continue => {}
                            Flow::Break => break,
                            ret @ Flow::Return(_) => return Ok(ret),
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Return(value) => {
                    let value = match value {
                        Some(expr) => self.eval(expr).await?,
                        None => Value::Null,
                    };
                    Ok(Flow::Return(value))
                }
                Stmt::Throw(value) => Err(ExecError::Thrown(self.eval(value).await?)),
                Stmt::Break => Ok(Flow::Break),
                Stmt::Continue => Ok(Flow::Continue),
                Stmt::Expr(expr) => {
                    self.eval(expr).await?;
                    Ok(Flow::Normal)
                }
            }
        })
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> Eval<'a, Value> {
        Box::pin(async move {
            match expr {
                Expr::Literal(value) => Ok(value.clone()),
                Expr::Var { name, .. } => self.lookup(name),
                Expr::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item).await?);
                    }
                    self.charge(Value::Array(out))
                }
                Expr::Object(fields) => {
                    let mut out = Map::new();
                    for (key, value) in fields {
                        let value = self.eval(value).await?;
                        out.insert(key.clone(), value);
                    }
                    self.charge(Value::Object(out))
                }
                Expr::Member {
                    object,
                    field,
                    line,
                } => {
                    let object = self.eval(object).await?;
                    member(&object, field, *line)
                }
                Expr::Index {
                    object,
                    index,
                    line,
                } => {
                    let object = self.eval(object).await?;
                    let index = self.eval(index).await?;
                    index_into(&object, &index, *line)
                }
                Expr::Unary { op, operand } => {
                    let operand = self.eval(operand).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!truthy(&operand))),
                        UnaryOp::Neg => negate(&operand),
                    }
                }
                Expr::Binary {
                    op, left, right, ..
                } => {
                    let left = self.eval(left).await?;
                    match op {
                        BinaryOp::And if !truthy(&left) => Ok(left),
                        BinaryOp::Or if truthy(&left) => Ok(left),
                        BinaryOp::Coalesce if !left.is_null() => Ok(left),
                        BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => {
                            self.eval(right).await
                        }
                        _ => {
                            let right = self.eval(right).await?;
                            let result = value::binary(*op, &left, &right)?;
                            self.charge(result)
                        }
                    }
                }
                Expr::Call { function, args, .. } => {
                    let args = self.arguments(args).await?;
                    let result = builtins::call(function, args)?;
                    self.charge(result)
                }
                Expr::Capability {
                    object,
                    method,
                    args,
                    ..
                } => {
                    let args = self.arguments(args).await?;
                    self.host.invoke(object, method, args).await
                }
            }
        })
    }

    async fn arguments(&mut self, args: &[Expr]) -> Result<Vec<Value>, ExecError> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(self.eval(arg).await?);
        }
        Ok(out)
    }

    fn assign(&mut self, place: &Place, keys: Vec<Value>, value: Value) -> Result<(), ExecError> {
        let mut keys = keys.into_iter();
        let mut target = self
            .scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(&place.root))
            .ok_or_else(|| ExecError::Type(format!("unknown identifier '{}'", place.root)))?;

        for accessor in &place.path {
            target = match accessor {
                Accessor::Field(name) => match target {
                    Value::Object(map) => map.entry(name.clone()).or_insert(Value::Null),
                    other => {
                        return Err(ExecError::Type(format!(
                            "line {}: cannot set property '{name}' on {}",
                            place.line,
                            type_name(other)
                        )));
                    }
                },
                Accessor::Index(_) => {
                    let key = keys.next().unwrap_or(Value::Null);
                    match (target, key) {
                        (Value::Array(items), Value::Number(n)) => {
                            let len = items.len();
                            let index = n
                                .as_u64()
                                .and_then(|i| usize::try_from(i).ok())
                                .filter(|i| *i <= len)
                                .ok_or_else(|| {
                                    ExecError::Type(format!(
                                        "line {}: array index {n} out of bounds (length {len})",
                                        place.line
                                    ))
                                })?;
                            if index == len {
                                items.push(Value::Null);
                            }
                            &mut items[index]
                        }
                        (Value::Object(map), Value::String(key)) => {
                            map.entry(key).or_insert(Value::Null)
                        }
                        (other, key) => {
                            return Err(ExecError::Type(format!(
                                "line {}: cannot index {} with {}",
                                place.line,
                                type_name(other),
                                type_name(&key)
                            )));
                        }
                    }
                }
            };
        }

        *target = value;
        Ok(())
    }
}

fn member(object: &Value, field: &str, line: usize) -> Result<Value, ExecError> {
    match object {
        Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if field == "length" => Ok(Value::from(items.len())),
        Value::String(s) if field == "length" => Ok(Value::from(s.chars().count())),
        other => Err(ExecError::Type(format!(
            "line {line}: cannot read property '{field}' of {}",
            type_name(other)
        ))),
    }
}

fn index_into(object: &Value, index: &Value, line: usize) -> Result<Value, ExecError> {
    match (object, index) {
        (Value::Array(items), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::String(s), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (object, index) => Err(ExecError::Type(format!(
            "line {line}: cannot index {} with {}",
            type_name(object),
            type_name(index)
        ))),
    }
}

fn negate(value: &Value) -> Result<Value, ExecError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(i64::checked_neg) {
                Ok(Value::from(i))
            } else {
                value::float(-n.as_f64().unwrap_or(f64::NAN))
            }
        }
        other => Err(ExecError::Type(format!("cannot negate {}", type_name(other)))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::script::{Surface, compile};
    use parking_lot::Mutex;
    use serde_json::json;

    const SURFACE: &Surface = &[("db", &["insert"]), ("log", &["info"])];

    /// Records capability calls and echoes the last argument back.
    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<(String, String, Vec<Value>)>>,
    }

    #[async_trait]
    impl HostBridge for RecordingHost {
        async fn invoke(
            &self,
            object: &str,
            method: &str,
            args: Vec<Value>,
        ) -> Result<Value, ExecError> {
            let last = args.last().cloned().unwrap_or(Value::Null);
            self.calls
                .lock()
                .push((object.to_string(), method.to_string(), args));
            Ok(last)
        }
    }

    fn budget(steps: u64) -> Budget {
        Budget {
            steps,
            value_size: 1024 * 1024,
        }
    }

    async fn run(src: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        let function = compile(src, SURFACE).unwrap();
        execute(&function, args, &RecordingHost::default(), budget(10_000)).await
    }

    #[tokio::test]
    async fn returns_computed_value() {
        let v = run("fn(a, b) { return a * 10 + b; }", vec![json!(4), json!(2)])
            .await
            .unwrap();
        assert_eq!(v, json!(42));
    }

    #[tokio::test]
    async fn missing_arguments_are_null() {
        let v = run("fn(a, b) { return b ?? \"default\"; }", vec![json!(1)])
            .await
            .unwrap();
        assert_eq!(v, json!("default"));
    }

    #[tokio::test]
    async fn no_return_yields_null() {
        assert_eq!(run("fn() { let x = 1; }", vec![]).await.unwrap(), json!(null));
    }

    #[tokio::test]
    async fn loops_and_control_flow() {
        let src = r#"fn(items) {
            let total = 0;
            for item in items {
                if item.skip { continue; }
                if item.price > 100 { break; }
                total = total + item.price;
            }
            return total;
        }"#;
        let items = json!([
            {"price": 10},
            {"price": 5, "skip": true},
            {"price": 20},
            {"price": 500},
            {"price": 1}
        ]);
        assert_eq!(run(src, vec![items]).await.unwrap(), json!(30));
    }

    #[tokio::test]
    async fn nested_assignment_mutates_locals() {
        let src = r#"fn(value) {
            value.meta.seen = true;
            value.tags[1] = "b";
            value.tags[2] = "c";
            return value;
        }"#;
        let v = run(src, vec![json!({"meta": {}, "tags": ["a", "x"]})])
            .await
            .unwrap();
        assert_eq!(v, json!({"meta": {"seen": true}, "tags": ["a", "b", "c"]}));
    }

    #[tokio::test]
    async fn throw_surfaces_the_value() {
        let err = run("fn() { throw \"bad input\"; }", vec![]).await.unwrap_err();
        assert!(matches!(err, ExecError::Thrown(Value::String(ref s)) if s == "bad input"));
    }

    #[tokio::test]
    async fn reading_property_of_null_is_a_type_error() {
        let err = run("fn(p) { return p.items.length; }", vec![json!({})])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot read property 'length' of null"));
    }

    #[tokio::test]
    async fn short_circuit_skips_capability_calls() {
        let host = RecordingHost::default();
        let function = compile("fn() { false && db.insert(\"x\", {}); }", SURFACE).unwrap();
        execute(&function, vec![], &host, budget(1_000)).await.unwrap();
        assert!(host.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn capability_calls_reach_the_host() {
        let host = RecordingHost::default();
        let function = compile(
            r#"fn(p) { return db.insert("visits", { total: p.total }); }"#,
            SURFACE,
        )
        .unwrap();
        let v = execute(&function, vec![json!({"total": 42})], &host, budget(1_000))
            .await
            .unwrap();
        assert_eq!(v, json!({"total": 42}));
        let calls = host.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "db");
        assert_eq!(calls[0].1, "insert");
        assert_eq!(calls[0].2[0], json!("visits"));
    }

    #[tokio::test]
    async fn step_budget_is_enforced() {
        let function = compile(
            "fn(xs) { let n = 0; for x in xs { for y in xs { n = n + 1; } } return n; }",
            SURFACE,
        )
        .unwrap();
        let xs = Value::Array((0..100).map(Value::from).collect());
        let err = execute(&function, vec![xs], &RecordingHost::default(), budget(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::BudgetExhausted(500)));
    }

    #[tokio::test]
    async fn runaway_values_hit_the_size_limit() {
        let doubling = [
            ("fn(s) { for i in range { s = concat(s, s); } return len(s); }", json!("ab")),
            ("fn(s) { for i in range { s = concat(s, s); } return len(s); }", json!([1, 2])),
            ("fn(a) { for i in range { a = [a, a]; } return a; }", json!(1)),
            ("fn(a) { for i in range { a.x = a; a.y = a; } return a; }", json!({})),
            ("fn(a) { for i in range { a = [a]; } return a; }", json!(1)),
        ];
        let range = format!(
            "[{}]",
            (1..=200).map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
        );
        for (body, seed) in doubling {
            let src = body.replace("range", &range);
            let function = compile(&src, SURFACE).unwrap();
            let err = execute(&function, vec![seed], &RecordingHost::default(), budget(1_000_000))
                .await
                .unwrap_err();
            assert!(matches!(err, ExecError::ValueTooLarge(_)), "{src}: {err}");
        }
    }

    #[tokio::test]
    async fn large_values_cost_steps() {
        let function = compile("fn(s) { return s + s; }", SURFACE).unwrap();
        let big = Value::String("x".repeat(100_000));
        let err = execute(&function, vec![big], &RecordingHost::default(), budget(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::BudgetExhausted(100)));
    }

    #[tokio::test]
    async fn block_locals_do_not_leak() {
        let src = r#"fn(x) {
            let out = "outer";
            if x { let out = "inner"; }
            return out;
        }"#;
        assert_eq!(run(src, vec![json!(true)]).await.unwrap(), json!("outer"));
    }
}
