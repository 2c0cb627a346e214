//! Embedded rule scripts
//!
//! A rule can carry JavaScript in `<js>…</js>` spans or after an `@js:`
//! marker. Scripts are parsed with SWC and run by a small tree-walking
//! interpreter over [`JsValue`]s: no host access beyond the bound `result`
//! and `baseUrl` values and a `context`/`java` object whose `get`/`put`
//! read and write the record's [`Session`].
//!
//! A script's value is its explicit `return`, else its final bare
//! expression statement (assignments excluded), else the final `result`.
//! Every statement, loop iteration and call counts against a step budget.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use swc_common::{sync::Lrc, FileName, SourceMap};
use swc_ecma_ast::*;
use swc_ecma_parser::{lexer::Lexer, Parser, StringInput, Syntax};

use super::js_value::{number_to_string, string_to_number, FunctionBody, JsFunction, JsValue};
use crate::error::{compile_regex, Result, RuleError};
use crate::session::Session;

const MAX_CALL_DEPTH: usize = 64;
const MAX_STRING_LEN: usize = 1 << 24;
const MAX_ARRAY_LEN: usize = 1 << 20;
/// Deepest bracket nesting a script may have before it is parsed.
const MAX_NESTING: usize = 32;

static FLOAT_PREFIX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:Infinity|\d+\.?\d*(?:[eE][+-]?\d+)?|\.\d+(?:[eE][+-]?\d+)?)").ok()
});

/// A piece of a rule: plain rule text or a script body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'r> {
    Rule(&'r str),
    Script(&'r str),
}

/// Split `rule` into rule and script segments in source order. Blank rule
/// text between scripts is dropped.
pub fn segments(rule: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = rule;
    loop {
        let lower = rest.to_ascii_lowercase();
        let span = lower.find("<js>");
        let tail = lower.find("@js:");
        match (span, tail) {
            (Some(open), t) if t.map_or(true, |t| open < t) => {
                let Some(close) = lower[open..].find("</js>").map(|c| open + c) else {
                    push_text(&mut out, rest);
                    break;
                };
                push_text(&mut out, &rest[..open]);
                out.push(Segment::Script(&rest[open + 4..close]));
                rest = &rest[close + 5..];
            }
            (_, Some(at)) => {
                push_text(&mut out, &rest[..at]);
                out.push(Segment::Script(&rest[at + 4..]));
                break;
            }
            _ => {
                push_text(&mut out, rest);
                break;
            }
        }
    }
    out
}

fn push_text<'r>(out: &mut Vec<Segment<'r>>, text: &'r str) {
    if !text.trim().is_empty() {
        out.push(Segment::Rule(text.trim()));
    }
}

/// Run `source` with `result` bound to the base value.
pub fn run_script(
    source: &str,
    result: JsValue,
    base_url: Option<&str>,
    session: &mut Session,
    step_limit: usize,
) -> Result<JsValue> {
    let body = parse_body(source)?;

    let mut globals = HashMap::new();
    globals.insert("result".to_string(), result);
    globals.insert(
        "baseUrl".to_string(),
        base_url.map_or(JsValue::Undefined, JsValue::str),
    );

    let mut interpreter = Interpreter {
        session,
        scopes: vec![globals],
        steps: 0,
        limit: step_limit,
        depth: 0,
    };
    interpreter.run_body(&body)
}

/// Rewrite JavaScript replacement references (`$1`, `$&`, `$<name>`) into
/// the `regex` crate's `${1}` form; other `$` are literal.
pub fn js_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push_str("$$");
            }
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some(d) if d.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    if digits.len() == 2 {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                out.push_str(&format!("${{{digits}}}"));
            }
            Some('<') => {
                let name: String = chars.clone().skip(1).take_while(|c| *c != '>').collect();
                let closed = chars.clone().skip(1 + name.chars().count()).next() == Some('>');
                if closed && !name.is_empty() {
                    for _ in 0..name.chars().count() + 2 {
                        chars.next();
                    }
                    out.push_str(&format!("${{{name}}}"));
                } else {
                    out.push_str("$$");
                }
            }
            _ => out.push_str("$$"),
        }
    }
    out
}

/// Parse a script as the body of a function so a top-level `return` is
/// legal.
fn parse_body(source: &str) -> Result<Vec<Stmt>> {
    if nesting_depth(source) > MAX_NESTING {
        return Err(RuleError::ScriptParse(format!(
            "brackets nested deeper than {MAX_NESTING}"
        )));
    }

    let cm: Lrc<SourceMap> = Default::default();
    let wrapped = format!("function __rule__() {{\n{source}\n}}");
    let fm = cm.new_source_file(FileName::Anon.into(), wrapped);

    let lexer = Lexer::new(
        Syntax::Es(Default::default()),
        Default::default(),
        StringInput::from(&*fm),
        None,
    );
    let mut parser = Parser::new_from(lexer);

    let script = parser
        .parse_script()
        .map_err(|e| RuleError::ScriptParse(format!("{e:?}")))?;

    let mut body = script.body.into_iter();
    match (body.next(), body.next()) {
        (Some(Stmt::Decl(Decl::Fn(decl))), None) => {
            Ok(decl.function.body.map(|b| b.stmts).unwrap_or_default())
        }
        _ => Err(RuleError::ScriptParse("script escapes its body".to_string())),
    }
}

/// Deepest nesting of brackets and template literals in `source`,
/// ignoring quoted strings and comments.
fn nesting_depth(source: &str) -> usize {
    let mut open: Vec<char> = Vec::new();
    let mut deepest = 0;
    let mut quote: Option<char> = None;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            match c {
                '\\' => {
                    chars.next();
                }
                _ if c == q => quote = None,
                _ => {}
            }
            continue;
        }
        if open.last() == Some(&'`') {
            match c {
                '\\' => {
                    chars.next();
                }
                '`' => {
                    open.pop();
                }
                '$' if chars.next_if_eq(&'{').is_some() => open.push('{'),
                _ => {}
            }
            deepest = deepest.max(open.len());
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '/' if chars.peek() == Some(&'/') => {
                while chars.next_if(|&n| n != '\n').is_some() {}
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            '(' | '[' | '{' | '`' => open.push(c),
            ')' | ']' | '}' => {
                open.pop();
            }
            _ => {}
        }
        deepest = deepest.max(open.len());
    }
    deepest
}

/// Fails once a string would grow past [`MAX_STRING_LEN`].
fn check_string_len(len: usize) -> Result<()> {
    if len > MAX_STRING_LEN {
        return Err(RuleError::script("RangeError: string too long"));
    }
    Ok(())
}

fn check_array_len(len: usize) -> Result<()> {
    if len > MAX_ARRAY_LEN {
        return Err(RuleError::script("RangeError: invalid array length"));
    }
    Ok(())
}

enum Flow {
    Normal,
    Return(JsValue),
    Break,
    Continue,
}

struct Interpreter<'s> {
    session: &'s mut Session,
    scopes: Vec<HashMap<String, JsValue>>,
    steps: usize,
    limit: usize,
    depth: usize,
}

impl Interpreter<'_> {
    fn run_body(&mut self, body: &[Stmt]) -> Result<JsValue> {
        self.hoist(body);
        if let Some((last, init)) = body.split_last() {
            for stmt in init {
                if let Flow::Return(v) = self.exec(stmt)? {
                    return Ok(v);
                }
            }
            if let Stmt::Expr(ExprStmt { expr, .. }) = last {
                if !matches!(&**expr, Expr::Assign(_)) {
                    self.tick()?;
                    return self.eval(expr);
                }
            }
            if let Flow::Return(v) = self.exec(last)? {
                return Ok(v);
            }
        }
        Ok(self.lookup("result").unwrap_or_default())
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.limit {
            return Err(RuleError::StepLimit(self.limit));
        }
        Ok(())
    }

    // ---- scopes ----

    fn lookup(&self, name: &str) -> Option<JsValue> {
        self.scopes.iter().rev().find_map(|s| s.get(name).cloned())
    }

    fn declare(&mut self, name: &str, value: JsValue) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn set_var(&mut self, name: &str, value: JsValue) {
        let scope = match self.scopes.iter().rposition(|s| s.contains_key(name)) {
            Some(i) => i,
            None => 0,
        };
        if let Some(s) = self.scopes.get_mut(scope) {
            s.insert(name.to_string(), value);
        }
    }

    /// Bring function declarations into scope before the body runs.
    fn hoist(&mut self, body: &[Stmt]) {
        for stmt in body {
            if let Stmt::Decl(Decl::Fn(decl)) = stmt {
                let f = function_value(&decl.function);
                self.declare(decl.ident.sym.as_str(), f);
            }
        }
    }

    // ---- statements ----

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        self.hoist(stmts);
        for stmt in stmts {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Expr(s) => {
                self.eval(&s.expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Decl(Decl::Var(decl)) => {
                self.declare_vars(decl)?;
                Ok(Flow::Normal)
            }
            Stmt::Decl(Decl::Fn(_)) | Stmt::Empty(_) => Ok(Flow::Normal),
            Stmt::Block(block) => self.exec_block(&block.stmts),
            Stmt::If(s) => {
                if self.eval(&s.test)?.truthy() {
                    self.exec(&s.cons)
                } else if let Some(alt) = &s.alt {
                    self.exec(alt)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::Return(s) => Ok(Flow::Return(match &s.arg {
                Some(arg) => self.eval(arg)?,
                None => JsValue::Undefined,
            })),
            Stmt::Break(_) => Ok(Flow::Break),
            Stmt::Continue(_) => Ok(Flow::Continue),
            Stmt::While(s) => {
                loop {
                    self.tick()?;
                    if !self.eval(&s.test)?.truthy() {
                        break;
                    }
                    match self.exec(&s.body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile(s) => {
                loop {
                    self.tick()?;
                    match self.exec(&s.body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(&s.test)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For(s) => {
                match &s.init {
                    Some(VarDeclOrExpr::VarDecl(decl)) => self.declare_vars(decl)?,
                    Some(VarDeclOrExpr::Expr(e)) => {
                        self.eval(e)?;
                    }
                    None => {}
                }
                loop {
                    self.tick()?;
                    if let Some(test) = &s.test {
                        if !self.eval(test)?.truthy() {
                            break;
                        }
                    }
                    match self.exec(&s.body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = &s.update {
                        self.eval(update)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ForOf(s) => {
                let items = match self.eval(&s.right)? {
                    JsValue::Array(items) => items,
                    JsValue::Str(text) => text.chars().map(|c| JsValue::Str(c.to_string())).collect(),
                    other => {
                        return Err(RuleError::script(format!("{} is not iterable", other.type_of())))
                    }
                };
                self.run_loop(&s.left, items, &s.body)
            }
            Stmt::ForIn(s) => {
                let keys = match self.eval(&s.right)? {
                    JsValue::Object(props) => props.into_iter().map(|(k, _)| JsValue::Str(k)).collect(),
                    JsValue::Array(items) => (0..items.len()).map(|i| JsValue::Str(i.to_string())).collect(),
                    _ => Vec::new(),
                };
                self.run_loop(&s.left, keys, &s.body)
            }
            Stmt::Switch(s) => self.exec_switch(s),
            Stmt::Throw(s) => {
                let value = self.eval(&s.arg)?;
                Err(RuleError::Script(value.to_js_string()))
            }
            Stmt::Try(s) => {
                let outcome = match self.exec_block(&s.block.stmts) {
                    Err(RuleError::StepLimit(n)) => Err(RuleError::StepLimit(n)),
                    Err(e) => match &s.handler {
                        Some(handler) => {
                            if let Some(param) = &handler.param {
                                let message = match &e {
                                    RuleError::Script(msg) => msg.clone(),
                                    other => other.to_string(),
                                };
                                self.bind_pattern(param, JsValue::Str(message), true)?;
                            }
                            self.exec_block(&handler.body.stmts)
                        }
                        None => Err(e),
                    },
                    ok => ok,
                };
                if let Some(finalizer) = &s.finalizer {
                    if let Flow::Return(v) = self.exec_block(&finalizer.stmts)? {
                        return Ok(Flow::Return(v));
                    }
                }
                outcome
            }
            _ => Err(RuleError::script("unsupported statement")),
        }
    }

    fn run_loop(&mut self, head: &ForHead, items: Vec<JsValue>, body: &Stmt) -> Result<Flow> {
        for item in items {
            self.tick()?;
            match head {
                ForHead::VarDecl(decl) => match decl.decls.first() {
                    Some(d) => self.bind_pattern(&d.name, item, true)?,
                    None => return Err(RuleError::script("empty loop declaration")),
                },
                ForHead::Pat(pat) => self.bind_pattern(pat, item, false)?,
                _ => return Err(RuleError::script("unsupported loop head")),
            }
            match self.exec(body)? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_switch(&mut self, s: &SwitchStmt) -> Result<Flow> {
        let value = self.eval(&s.discriminant)?;
        let mut start = None;
        for (i, case) in s.cases.iter().enumerate() {
            if let Some(test) = &case.test {
                if self.eval(test)?.strict_equals(&value) {
                    start = Some(i);
                    break;
                }
            }
        }
        let start = start.or_else(|| s.cases.iter().position(|c| c.test.is_none()));
        let Some(start) = start else {
            return Ok(Flow::Normal);
        };
        for case in &s.cases[start..] {
            match self.exec_block(&case.cons)? {
                Flow::Normal => {}
                Flow::Break => break,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn declare_vars(&mut self, decl: &VarDecl) -> Result<()> {
        for d in &decl.decls {
            let value = match &d.init {
                Some(init) => self.eval(init)?,
                None => JsValue::Undefined,
            };
            self.bind_pattern(&d.name, value, true)?;
        }
        Ok(())
    }

    /// Bind a declaration or assignment pattern, destructuring arrays and
    /// objects.
    fn bind_pattern(&mut self, pat: &Pat, value: JsValue, declare: bool) -> Result<()> {
        match pat {
            Pat::Ident(ident) => {
                if declare {
                    self.declare(ident.sym.as_str(), value);
                } else {
                    self.set_var(ident.sym.as_str(), value);
                }
                Ok(())
            }
            Pat::Array(array) => self.bind_array(array, value, declare),
            Pat::Object(object) => self.bind_object(object, value, declare),
            Pat::Assign(assign) => {
                let value = match value {
                    JsValue::Undefined => self.eval(&assign.right)?,
                    other => other,
                };
                self.bind_pattern(&assign.left, value, declare)
            }
            Pat::Expr(expr) if !declare => self.assign_expr(expr, value),
            _ => Err(RuleError::script("unsupported binding pattern")),
        }
    }

    fn bind_array(&mut self, pat: &ArrayPat, value: JsValue, declare: bool) -> Result<()> {
        for (i, elem) in pat.elems.iter().enumerate() {
            if let Some(p) = elem {
                if let Pat::Rest(rest) = p {
                    let tail = match &value {
                        JsValue::Array(items) => items.iter().skip(i).cloned().collect(),
                        _ => Vec::new(),
                    };
                    return self.bind_pattern(&rest.arg, JsValue::Array(tail), declare);
                }
                self.bind_pattern(p, value.get_property(&i.to_string()), declare)?;
            }
        }
        Ok(())
    }

    fn bind_object(&mut self, pat: &ObjectPat, value: JsValue, declare: bool) -> Result<()> {
        for prop in &pat.props {
            match prop {
                ObjectPatProp::Assign(assign) => {
                    let name = assign.key.sym.to_string();
                    let mut v = value.get_property(&name);
                    if let (JsValue::Undefined, Some(default)) = (&v, &assign.value) {
                        v = self.eval(default)?;
                    }
                    if declare {
                        self.declare(&name, v);
                    } else {
                        self.set_var(&name, v);
                    }
                }
                ObjectPatProp::KeyValue(kv) => {
                    let key = self.prop_name(&kv.key)?;
                    self.bind_pattern(&kv.value, value.get_property(&key), declare)?;
                }
                ObjectPatProp::Rest(_) => {
                    return Err(RuleError::script("unsupported object rest pattern"))
                }
            }
        }
        Ok(())
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &Expr) -> Result<JsValue> {
        match expr {
            Expr::Lit(lit) => eval_lit(lit),
            Expr::Ident(ident) => self.eval_ident(ident.sym.as_str()),
            Expr::Paren(p) => self.eval(&p.expr),
            Expr::Tpl(tpl) => self.eval_tpl(tpl),
            Expr::Array(array) => {
                let mut items = Vec::with_capacity(array.elems.len());
                for elem in &array.elems {
                    match elem {
                        Some(ExprOrSpread { spread, expr }) => {
                            let v = self.eval(expr)?;
                            if spread.is_some() {
                                items.extend(spread_items(v)?);
                            } else {
                                items.push(v);
                            }
                        }
                        None => items.push(JsValue::Undefined),
                    }
                }
                Ok(JsValue::Array(items))
            }
            Expr::Object(object) => self.eval_object(object),
            Expr::Unary(u) => self.eval_unary(u),
            Expr::Update(u) => {
                let old = self.eval(&u.arg)?.to_number();
                let new = match u.op {
                    UpdateOp::PlusPlus => old + 1.0,
                    UpdateOp::MinusMinus => old - 1.0,
                };
                self.assign_expr(&u.arg, JsValue::Num(new))?;
                Ok(JsValue::Num(if u.prefix { new } else { old }))
            }
            Expr::Bin(b) => self.eval_binary(b),
            Expr::Assign(a) => self.eval_assign(a),
            Expr::Cond(c) => {
                if self.eval(&c.test)?.truthy() {
                    self.eval(&c.cons)
                } else {
                    self.eval(&c.alt)
                }
            }
            Expr::Seq(seq) => {
                let mut last = JsValue::Undefined;
                for e in &seq.exprs {
                    last = self.eval(e)?;
                }
                Ok(last)
            }
            Expr::Member(m) => self.eval_member(m),
            Expr::Call(call) => self.eval_call(call),
            Expr::New(new) => {
                let args = match &new.args {
                    Some(args) => self.eval_args(args)?,
                    None => Vec::new(),
                };
                match &*new.callee {
                    Expr::Ident(ident) => self.call_global(ident.sym.as_str(), args),
                    _ => Err(RuleError::script("unsupported constructor")),
                }
            }
            Expr::Arrow(arrow) => {
                let body = match &*arrow.body {
                    BlockStmtOrExpr::BlockStmt(block) => FunctionBody::Block(block.clone()),
                    BlockStmtOrExpr::Expr(e) => FunctionBody::Expr(e.clone()),
                };
                Ok(JsValue::Function(Rc::new(JsFunction {
                    params: arrow.params.clone(),
                    body,
                })))
            }
            Expr::Fn(f) => Ok(function_value(&f.function)),
            _ => Err(RuleError::script("unsupported expression")),
        }
    }

    fn eval_ident(&self, name: &str) -> Result<JsValue> {
        if let Some(v) = self.lookup(name) {
            return Ok(v);
        }
        match name {
            "undefined" => Ok(JsValue::Undefined),
            "NaN" => Ok(JsValue::Num(f64::NAN)),
            "Infinity" => Ok(JsValue::Num(f64::INFINITY)),
            _ => Err(RuleError::script(format!("{name} is not defined"))),
        }
    }

    fn eval_tpl(&mut self, tpl: &Tpl) -> Result<JsValue> {
        let mut out = String::new();
        for (i, quasi) in tpl.quasis.iter().enumerate() {
            out.push_str(&unescape(quasi.raw.as_str()));
            if let Some(e) = tpl.exprs.get(i) {
                let part = self.eval(e)?.to_js_string();
                check_string_len(out.len() + part.len())?;
                out.push_str(&part);
            }
        }
        Ok(JsValue::Str(out))
    }

    fn eval_object(&mut self, object: &ObjectLit) -> Result<JsValue> {
        let mut obj = JsValue::Object(Vec::new());
        for prop in &object.props {
            match prop {
                PropOrSpread::Spread(spread) => match self.eval(&spread.expr)? {
                    JsValue::Object(props) => {
                        for (k, v) in props {
                            obj.set_property(&k, v);
                        }
                    }
                    JsValue::Array(items) => {
                        for (i, v) in items.into_iter().enumerate() {
                            obj.set_property(&i.to_string(), v);
                        }
                    }
                    _ => {}
                },
                PropOrSpread::Prop(prop) => match &**prop {
                    Prop::KeyValue(kv) => {
                        let key = self.prop_name(&kv.key)?;
                        let value = self.eval(&kv.value)?;
                        obj.set_property(&key, value);
                    }
                    Prop::Shorthand(ident) => {
                        let value = self.eval_ident(ident.sym.as_str())?;
                        obj.set_property(ident.sym.as_str(), value);
                    }
                    Prop::Method(method) => {
                        let key = self.prop_name(&method.key)?;
                        obj.set_property(&key, function_value(&method.function));
                    }
                    _ => return Err(RuleError::script("unsupported object property")),
                },
            }
        }
        Ok(obj)
    }

    fn prop_name(&mut self, name: &PropName) -> Result<String> {
        match name {
            PropName::Ident(ident) => Ok(ident.sym.to_string()),
            PropName::Str(s) => Ok(s.value.as_str().unwrap_or("").to_string()),
            PropName::Num(n) => Ok(number_to_string(n.value)),
            PropName::Computed(c) => Ok(self.eval(&c.expr)?.to_js_string()),
            _ => Err(RuleError::script("unsupported property name")),
        }
    }

    fn eval_unary(&mut self, u: &UnaryExpr) -> Result<JsValue> {
        if u.op == UnaryOp::TypeOf {
            if let Expr::Ident(ident) = &*u.arg {
                if self.lookup(ident.sym.as_str()).is_none() {
                    return Ok(JsValue::str(match ident.sym.as_str() {
                        "NaN" | "Infinity" => "number",
                        "JSON" | "Math" | "context" | "java" | "console" => "object",
                        _ => "undefined",
                    }));
                }
            }
        }
        if u.op == UnaryOp::Delete {
            if let Expr::Member(m) = &*u.arg {
                let key = self.member_key(&m.prop)?;
                let mut container = self.eval(&m.obj)?;
                if let JsValue::Object(props) = &mut container {
                    props.retain(|(k, _)| *k != key);
                    if is_lvalue(&m.obj) {
                        self.assign_expr(&m.obj, container)?;
                    }
                }
            }
            return Ok(JsValue::Bool(true));
        }

        let v = self.eval(&u.arg)?;
        Ok(match u.op {
            UnaryOp::Bang => JsValue::Bool(!v.truthy()),
            UnaryOp::Minus => JsValue::Num(-v.to_number()),
            UnaryOp::Plus => JsValue::Num(v.to_number()),
            UnaryOp::Tilde => JsValue::Num(f64::from(!to_int32(v.to_number()))),
            UnaryOp::TypeOf => JsValue::str(v.type_of()),
            UnaryOp::Void | UnaryOp::Delete => JsValue::Undefined,
        })
    }

    fn eval_binary(&mut self, b: &BinExpr) -> Result<JsValue> {
        match b.op {
            BinaryOp::LogicalAnd => {
                let left = self.eval(&b.left)?;
                return if left.truthy() { self.eval(&b.right) } else { Ok(left) };
            }
            BinaryOp::LogicalOr => {
                let left = self.eval(&b.left)?;
                return if left.truthy() { Ok(left) } else { self.eval(&b.right) };
            }
            BinaryOp::NullishCoalescing => {
                let left = self.eval(&b.left)?;
                return if left.is_nullish() { self.eval(&b.right) } else { Ok(left) };
            }
            _ => {}
        }
        let left = self.eval(&b.left)?;
        let right = self.eval(&b.right)?;
        binary_op(b.op, left, right)
    }

    fn eval_assign(&mut self, a: &AssignExpr) -> Result<JsValue> {
        let value = match a.op {
            AssignOp::Assign => self.eval(&a.right)?,
            AssignOp::AndAssign | AssignOp::OrAssign | AssignOp::NullishAssign => {
                let current = self.read_target(&a.left)?;
                let keep = match a.op {
                    AssignOp::AndAssign => !current.truthy(),
                    AssignOp::OrAssign => current.truthy(),
                    _ => !current.is_nullish(),
                };
                if keep {
                    return Ok(current);
                }
                self.eval(&a.right)?
            }
            op => {
                let current = self.read_target(&a.left)?;
                let right = self.eval(&a.right)?;
                binary_op(compound_op(op)?, current, right)?
            }
        };
        self.write_target(&a.left, value.clone())?;
        Ok(value)
    }

    fn read_target(&mut self, target: &AssignTarget) -> Result<JsValue> {
        match target {
            AssignTarget::Simple(SimpleAssignTarget::Ident(ident)) => {
                self.eval_ident(ident.sym.as_str())
            }
            AssignTarget::Simple(SimpleAssignTarget::Member(m)) => self.eval_member(m),
            AssignTarget::Simple(SimpleAssignTarget::Paren(p)) => self.eval(&p.expr),
            _ => Err(RuleError::script("unsupported assignment target")),
        }
    }

    fn write_target(&mut self, target: &AssignTarget, value: JsValue) -> Result<()> {
        match target {
            AssignTarget::Simple(SimpleAssignTarget::Ident(ident)) => {
                self.set_var(ident.sym.as_str(), value);
                Ok(())
            }
            AssignTarget::Simple(SimpleAssignTarget::Member(m)) => self.assign_member(m, value),
            AssignTarget::Simple(SimpleAssignTarget::Paren(p)) => self.assign_expr(&p.expr, value),
            AssignTarget::Pat(AssignTargetPat::Array(array)) => self.bind_array(array, value, false),
            AssignTarget::Pat(AssignTargetPat::Object(object)) => {
                self.bind_object(object, value, false)
            }
            _ => Err(RuleError::script("unsupported assignment target")),
        }
    }

    fn assign_expr(&mut self, expr: &Expr, value: JsValue) -> Result<()> {
        match expr {
            Expr::Ident(ident) => {
                self.set_var(ident.sym.as_str(), value);
                Ok(())
            }
            Expr::Member(m) => self.assign_member(m, value),
            Expr::Paren(p) => self.assign_expr(&p.expr, value),
            _ => Err(RuleError::script("invalid assignment target")),
        }
    }

    /// Set `obj[key]` and write the updated container back to `obj`.
    fn assign_member(&mut self, m: &MemberExpr, value: JsValue) -> Result<()> {
        let key = self.member_key(&m.prop)?;
        let mut container = self.eval(&m.obj)?;
        if !container.set_property(&key, value) {
            return Err(RuleError::script(format!(
                "cannot set property '{key}' of {}",
                container.type_of()
            )));
        }
        if is_lvalue(&m.obj) {
            self.assign_expr(&m.obj, container)?;
        }
        Ok(())
    }

    fn member_key(&mut self, prop: &MemberProp) -> Result<String> {
        match prop {
            MemberProp::Ident(ident) => Ok(ident.sym.to_string()),
            MemberProp::Computed(c) => Ok(self.eval(&c.expr)?.to_js_string()),
            _ => Err(RuleError::script("unsupported member access")),
        }
    }

    fn eval_member(&mut self, m: &MemberExpr) -> Result<JsValue> {
        if let Expr::Ident(obj) = &*m.obj {
            if obj.sym.as_str() == "Math" && self.lookup("Math").is_none() {
                let key = self.member_key(&m.prop)?;
                return Ok(match key.as_str() {
                    "PI" => JsValue::Num(std::f64::consts::PI),
                    "E" => JsValue::Num(std::f64::consts::E),
                    _ => JsValue::Undefined,
                });
            }
        }
        let target = self.eval(&m.obj)?;
        let key = self.member_key(&m.prop)?;
        if target.is_nullish() {
            return Err(RuleError::script(format!(
                "cannot read property '{key}' of {}",
                target.to_js_string()
            )));
        }
        Ok(target.get_property(&key))
    }

    fn eval_args(&mut self, args: &[ExprOrSpread]) -> Result<Vec<JsValue>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.eval(&arg.expr)?;
            if arg.spread.is_some() {
                out.extend(spread_items(v)?);
            } else {
                out.push(v);
            }
        }
        Ok(out)
    }

    fn eval_call(&mut self, call: &CallExpr) -> Result<JsValue> {
        let Callee::Expr(callee) = &call.callee else {
            return Err(RuleError::script("unsupported call"));
        };

        match &**callee {
            Expr::Member(m) => {
                let name = self.member_key(&m.prop)?;
                if let Expr::Ident(obj) = &*m.obj {
                    let ns = obj.sym.as_str();
                    if is_namespace(ns) && self.lookup(ns).is_none() {
                        let args = self.eval_args(&call.args)?;
                        return self.call_namespace(ns, &name, args);
                    }
                }
                let target = self.eval(&m.obj)?;
                let args = self.eval_args(&call.args)?;
                let (ret, updated) = self.call_method(target, &name, args)?;
                if let Some(updated) = updated {
                    if is_lvalue(&m.obj) {
                        self.assign_expr(&m.obj, updated)?;
                    }
                }
                Ok(ret)
            }
            Expr::Ident(ident) if self.lookup(ident.sym.as_str()).is_none() => {
                let args = self.eval_args(&call.args)?;
                self.call_global(ident.sym.as_str(), args)
            }
            other => {
                let f = self.eval(other)?;
                let args = self.eval_args(&call.args)?;
                match f {
                    JsValue::Function(f) => self.call_function(&f, args),
                    v => Err(RuleError::script(format!("{} is not a function", v.type_of()))),
                }
            }
        }
    }

    fn call_function(&mut self, f: &JsFunction, args: Vec<JsValue>) -> Result<JsValue> {
        self.tick()?;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuleError::script("maximum call depth exceeded"));
        }
        self.depth += 1;
        self.scopes.push(HashMap::new());
        let outcome = self.invoke(f, args);
        self.scopes.pop();
        self.depth -= 1;
        outcome
    }

    fn invoke(&mut self, f: &JsFunction, args: Vec<JsValue>) -> Result<JsValue> {
        let mut args = args.into_iter();
        for param in &f.params {
            if let Pat::Rest(rest) = param {
                let tail = JsValue::Array(args.by_ref().collect());
                self.bind_pattern(&rest.arg, tail, true)?;
                break;
            }
            let value = args.next().unwrap_or_default();
            self.bind_pattern(param, value, true)?;
        }
        match &f.body {
            FunctionBody::Expr(e) => self.eval(e),
            FunctionBody::Block(block) => match self.exec_block(&block.stmts)? {
                Flow::Return(v) => Ok(v),
                _ => Ok(JsValue::Undefined),
            },
        }
    }

    fn callback(&mut self, args: &[JsValue]) -> Result<Rc<JsFunction>> {
        match args.first() {
            Some(JsValue::Function(f)) => Ok(Rc::clone(f)),
            _ => Err(RuleError::script("callback is not a function")),
        }
    }

    // ---- built-ins ----

    fn call_global(&mut self, name: &str, args: Vec<JsValue>) -> Result<JsValue> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        Ok(match name {
            "parseInt" => {
                let radix = args.get(1).map(|r| r.to_number()).filter(|r| *r != 0.0);
                JsValue::Num(parse_int(&arg(0).to_js_string(), radix))
            }
            "parseFloat" => JsValue::Num(parse_float(&arg(0).to_js_string())),
            "String" => JsValue::Str(args.first().map_or_else(String::new, JsValue::to_js_string)),
            "Number" => JsValue::Num(args.first().map_or(0.0, JsValue::to_number)),
            "Boolean" => JsValue::Bool(arg(0).truthy()),
            "isNaN" => JsValue::Bool(arg(0).to_number().is_nan()),
            "isFinite" => JsValue::Bool(arg(0).to_number().is_finite()),
            "encodeURIComponent" => {
                JsValue::Str(urlencoding::encode(&arg(0).to_js_string()).into_owned())
            }
            "decodeURIComponent" => match urlencoding::decode(&arg(0).to_js_string()) {
                Ok(decoded) => JsValue::Str(decoded.into_owned()),
                Err(_) => return Err(RuleError::script("URIError: malformed URI sequence")),
            },
            "RegExp" => JsValue::Regex {
                source: match arg(0) {
                    JsValue::Regex { source, .. } => source,
                    other => other.to_js_string(),
                },
                flags: match args.get(1) {
                    Some(f) if !f.is_nullish() => f.to_js_string(),
                    _ => String::new(),
                },
            },
            "Array" => {
                if let [JsValue::Num(n)] = args.as_slice() {
                    if *n < 0.0 || *n > MAX_ARRAY_LEN as f64 || n.fract() != 0.0 {
                        return Err(RuleError::script("RangeError: invalid array length"));
                    }
                    return Ok(JsValue::Array(vec![JsValue::Undefined; *n as usize]));
                }
                JsValue::Array(args)
            }
            "Object" => JsValue::Object(Vec::new()),
            _ => return Err(RuleError::script(format!("{name} is not defined"))),
        })
    }

    fn call_namespace(&mut self, ns: &str, name: &str, args: Vec<JsValue>) -> Result<JsValue> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        match (ns, name) {
            ("context" | "java", "get") => Ok(JsValue::str(
                self.session.get(&arg(0).to_js_string()).unwrap_or_default(),
            )),
            ("context" | "java", "put") => {
                let value = arg(1);
                self.session.put(arg(0).to_js_string(), value.to_output());
                Ok(value)
            }
            ("context" | "java" | "console", "log" | "warn" | "error") => {
                let line = args.iter().map(JsValue::to_js_string).collect::<Vec<_>>().join(" ");
                tracing::debug!("script log: {}", line);
                Ok(JsValue::Undefined)
            }
            ("JSON", "parse") => {
                let value: serde_json::Value = serde_json::from_str(&arg(0).to_js_string())?;
                Ok(JsValue::from_json(&value))
            }
            ("JSON", "stringify") => {
                let Some(value) = arg(0).to_json() else {
                    return Ok(JsValue::Undefined);
                };
                let pretty = match args.get(2) {
                    Some(JsValue::Num(n)) => *n >= 1.0,
                    Some(JsValue::Str(s)) => !s.is_empty(),
                    _ => false,
                };
                let text = if pretty {
                    serde_json::to_string_pretty(&value)?
                } else {
                    serde_json::to_string(&value)?
                };
                Ok(JsValue::Str(text))
            }
            ("Math", _) => math(name, &args),
            ("Object", "keys") => Ok(match arg(0) {
                JsValue::Object(props) => {
                    JsValue::Array(props.into_iter().map(|(k, _)| JsValue::Str(k)).collect())
                }
                JsValue::Array(items) => {
                    JsValue::Array((0..items.len()).map(|i| JsValue::Str(i.to_string())).collect())
                }
                _ => JsValue::Array(Vec::new()),
            }),
            ("Object", "values") => Ok(match arg(0) {
                JsValue::Object(props) => JsValue::Array(props.into_iter().map(|(_, v)| v).collect()),
                JsValue::Array(items) => JsValue::Array(items),
                _ => JsValue::Array(Vec::new()),
            }),
            ("Array", "isArray") => Ok(JsValue::Bool(matches!(arg(0), JsValue::Array(_)))),
            ("Array", "from") => Ok(JsValue::Array(match arg(0) {
                JsValue::Array(items) => items,
                JsValue::Str(s) => s.chars().map(|c| JsValue::Str(c.to_string())).collect(),
                _ => Vec::new(),
            })),
            ("Number", "isInteger") => Ok(JsValue::Bool(
                matches!(arg(0), JsValue::Num(n) if n.is_finite() && n.fract() == 0.0),
            )),
            ("Number", "parseInt" | "parseFloat") => self.call_global(name, args),
            ("String", "fromCharCode") => Ok(JsValue::Str(
                args.iter()
                    .filter_map(|v| char::from_u32(v.to_number() as u32))
                    .collect(),
            )),
            _ => Err(RuleError::script(format!("{ns}.{name} is not a function"))),
        }
    }

    /// Call a method on a value. The second element is the receiver's new
    /// value when the method mutates it.
    fn call_method(
        &mut self,
        target: JsValue,
        name: &str,
        args: Vec<JsValue>,
    ) -> Result<(JsValue, Option<JsValue>)> {
        match target {
            JsValue::Str(s) => Ok((string_method(&s, name, &args, self)?, None)),
            JsValue::Array(items) => self.array_method(items, name, args),
            JsValue::Regex { source, flags } => {
                let re = build_regex(&source, &flags)?;
                let text = args.first().map(JsValue::to_js_string).unwrap_or_default();
                match name {
                    "test" => Ok((JsValue::Bool(re.is_match(&text)), None)),
                    "exec" => Ok((match_once(&re, &text), None)),
                    "toString" => Ok((JsValue::Str(format!("/{source}/{flags}")), None)),
                    _ => Err(RuleError::script(format!("regex has no method {name}"))),
                }
            }
            JsValue::Num(n) => match name {
                "toFixed" => {
                    let digits = args.first().map_or(0.0, JsValue::to_number).clamp(0.0, 100.0);
                    Ok((JsValue::Str(format!("{:.*}", digits as usize, n)), None))
                }
                "toString" => {
                    let radix = args.first().map_or(10.0, JsValue::to_number) as u32;
                    Ok((JsValue::Str(number_to_radix(n, radix)), None))
                }
                _ => Err(RuleError::script(format!("number has no method {name}"))),
            },
            JsValue::Object(props) => {
                if let Some((_, JsValue::Function(f))) = props.iter().find(|(k, _)| k == name) {
                    let f = Rc::clone(f);
                    return Ok((self.call_function(&f, args)?, None));
                }
                match name {
                    "hasOwnProperty" => {
                        let key = args.first().map(JsValue::to_js_string).unwrap_or_default();
                        Ok((JsValue::Bool(props.iter().any(|(k, _)| *k == key)), None))
                    }
                    "toString" => Ok((JsValue::str("[object Object]"), None)),
                    _ => Err(RuleError::script(format!("{name} is not a function"))),
                }
            }
            JsValue::Function(f) if name == "call" => {
                let args = args.into_iter().skip(1).collect();
                Ok((self.call_function(&f, args)?, None))
            }
            other if name == "toString" && !other.is_nullish() => {
                Ok((JsValue::Str(other.to_js_string()), None))
            }
            other => Err(RuleError::script(format!(
                "cannot call {name} on {}",
                other.to_js_string()
            ))),
        }
    }

    fn array_method(
        &mut self,
        mut items: Vec<JsValue>,
        name: &str,
        args: Vec<JsValue>,
    ) -> Result<(JsValue, Option<JsValue>)> {
        let len = items.len();
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let plain = |v: JsValue| -> Result<(JsValue, Option<JsValue>)> { Ok((v, None)) };

        match name {
            "push" => {
                check_array_len(items.len() + args.len())?;
                items.extend(args);
                let n = JsValue::Num(items.len() as f64);
                Ok((n, Some(JsValue::Array(items))))
            }
            "pop" => {
                let last = items.pop().unwrap_or_default();
                Ok((last, Some(JsValue::Array(items))))
            }
            "shift" => {
                let first = if items.is_empty() { JsValue::Undefined } else { items.remove(0) };
                Ok((first, Some(JsValue::Array(items))))
            }
            "unshift" => {
                check_array_len(items.len() + args.len())?;
                let mut next = args;
                next.extend(items);
                let n = JsValue::Num(next.len() as f64);
                Ok((n, Some(JsValue::Array(next))))
            }
            "reverse" => {
                items.reverse();
                Ok((JsValue::Array(items.clone()), Some(JsValue::Array(items))))
            }
            "sort" => {
                let sorted = self.sort(items, args.first())?;
                Ok((JsValue::Array(sorted.clone()), Some(JsValue::Array(sorted))))
            }
            "join" => {
                let sep = match args.first() {
                    Some(v) if !matches!(v, JsValue::Undefined) => v.to_js_string(),
                    _ => ",".to_string(),
                };
                let parts: Vec<String> = items
                    .iter()
                    .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                    .collect();
                let total = parts.iter().map(String::len).sum::<usize>()
                    + sep.len().saturating_mul(parts.len().saturating_sub(1));
                check_string_len(total)?;
                plain(JsValue::Str(parts.join(&sep)))
            }
            "toString" => plain(JsValue::Str(JsValue::Array(items).to_js_string())),
            "slice" => {
                let start = relative_index(args.first(), len, 0);
                let end = relative_index(args.get(1), len, len);
                let out = if start < end { items[start..end].to_vec() } else { Vec::new() };
                plain(JsValue::Array(out))
            }
            "indexOf" => {
                let needle = arg(0);
                let pos = items.iter().position(|v| v.strict_equals(&needle));
                plain(JsValue::Num(pos.map_or(-1.0, |p| p as f64)))
            }
            "includes" => {
                let needle = arg(0);
                plain(JsValue::Bool(items.iter().any(|v| v.strict_equals(&needle))))
            }
            "concat" => {
                for a in args {
                    match a {
                        JsValue::Array(more) => {
                            check_array_len(items.len() + more.len())?;
                            items.extend(more);
                        }
                        other => {
                            check_array_len(items.len() + 1)?;
                            items.push(other);
                        }
                    }
                }
                plain(JsValue::Array(items))
            }
            "map" | "filter" | "forEach" | "find" | "findIndex" | "some" | "every" => {
                let f = self.callback(&args)?;
                let whole = JsValue::Array(items.clone());
                let mut mapped = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    let out = self.call_function(
                        &f,
                        vec![item.clone(), JsValue::Num(i as f64), whole.clone()],
                    )?;
                    match name {
                        "map" => mapped.push(out),
                        "filter" if out.truthy() => mapped.push(item),
                        "find" if out.truthy() => return plain(item),
                        "findIndex" if out.truthy() => return plain(JsValue::Num(i as f64)),
                        "some" if out.truthy() => return plain(JsValue::Bool(true)),
                        "every" if !out.truthy() => return plain(JsValue::Bool(false)),
                        _ => {}
                    }
                }
                plain(match name {
                    "map" | "filter" => JsValue::Array(mapped),
                    "find" => JsValue::Undefined,
                    "findIndex" => JsValue::Num(-1.0),
                    "some" => JsValue::Bool(false),
                    "every" => JsValue::Bool(true),
                    _ => JsValue::Undefined,
                })
            }
            "reduce" => {
                let f = self.callback(&args)?;
                let mut iter = items.into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(init) => init.clone(),
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(RuleError::script("reduce of empty array with no initial value"))
                        }
                    },
                };
                for (i, item) in iter {
                    acc = self.call_function(&f, vec![acc, item, JsValue::Num(i as f64)])?;
                }
                plain(acc)
            }
            _ => Err(RuleError::script(format!("array has no method {name}"))),
        }
    }

    /// Stable insertion sort; comparator calls count against the budget.
    fn sort(&mut self, items: Vec<JsValue>, comparator: Option<&JsValue>) -> Result<Vec<JsValue>> {
        let mut sorted: Vec<JsValue> = Vec::with_capacity(items.len());
        for item in items {
            let mut pos = sorted.len();
            while pos > 0 {
                let ord = match comparator {
                    Some(JsValue::Function(f)) => {
                        let f = Rc::clone(f);
                        let r = self.call_function(&f, vec![sorted[pos - 1].clone(), item.clone()])?;
                        r.to_number().partial_cmp(&0.0).unwrap_or(Ordering::Equal)
                    }
                    _ => {
                        self.tick()?;
                        sorted[pos - 1].to_js_string().cmp(&item.to_js_string())
                    }
                };
                if ord != Ordering::Greater {
                    break;
                }
                pos -= 1;
            }
            sorted.insert(pos, item);
        }
        Ok(sorted)
    }
}

fn string_method(
    s: &str,
    name: &str,
    args: &[JsValue],
    interp: &mut Interpreter<'_>,
) -> Result<JsValue> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let arg_str = |i: usize| args.get(i).map(JsValue::to_js_string).unwrap_or_default();
    let slice = |a: usize, b: usize| -> String {
        if a < b { chars[a..b].iter().collect() } else { String::new() }
    };

    Ok(match name {
        "toUpperCase" | "toLocaleUpperCase" => JsValue::Str(s.to_uppercase()),
        "toLowerCase" | "toLocaleLowerCase" => JsValue::Str(s.to_lowercase()),
        "trim" => JsValue::str(s.trim()),
        "trimStart" | "trimLeft" => JsValue::str(s.trim_start()),
        "trimEnd" | "trimRight" => JsValue::str(s.trim_end()),
        "toString" | "valueOf" => JsValue::str(s),
        "charAt" => {
            let i = args.first().map_or(0.0, JsValue::to_number);
            JsValue::Str(
                (i >= 0.0)
                    .then(|| chars.get(i as usize))
                    .flatten()
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            )
        }
        "charCodeAt" => {
            let i = args.first().map_or(0.0, JsValue::to_number);
            match (i >= 0.0).then(|| chars.get(i as usize)).flatten() {
                Some(c) => JsValue::Num(f64::from(u32::from(*c))),
                None => JsValue::Num(f64::NAN),
            }
        }
        "indexOf" | "lastIndexOf" | "includes" => {
            let needle = arg_str(0);
            let found = if name == "lastIndexOf" { s.rfind(&needle) } else { s.find(&needle) };
            let pos = found.map(|b| s[..b].chars().count());
            match name {
                "includes" => JsValue::Bool(pos.is_some()),
                _ => JsValue::Num(pos.map_or(-1.0, |p| p as f64)),
            }
        }
        "startsWith" => {
            let from = relative_index(args.get(1), len, 0);
            JsValue::Bool(slice(from, len).starts_with(&arg_str(0)))
        }
        "endsWith" => JsValue::Bool(s.ends_with(&arg_str(0))),
        "slice" => {
            let start = relative_index(args.first(), len, 0);
            let end = relative_index(args.get(1), len, len);
            JsValue::Str(slice(start, end))
        }
        "substring" => {
            let clamp = |v: Option<&JsValue>, default: usize| match v {
                Some(v) if !matches!(v, JsValue::Undefined) => {
                    let n = v.to_number();
                    if n.is_nan() { 0 } else { n.clamp(0.0, len as f64) as usize }
                }
                _ => default,
            };
            let (a, b) = (clamp(args.first(), 0), clamp(args.get(1), len));
            JsValue::Str(slice(a.min(b), a.max(b)))
        }
        "substr" => {
            let start = relative_index(args.first(), len, 0);
            let count = match args.get(1) {
                Some(v) if !matches!(v, JsValue::Undefined) => v.to_number().max(0.0) as usize,
                _ => len,
            };
            JsValue::Str(slice(start, start.saturating_add(count).min(len)))
        }
        "split" => {
            let limit = match args.get(1) {
                Some(v) if !matches!(v, JsValue::Undefined) => v.to_number().max(0.0) as usize,
                _ => usize::MAX,
            };
            let parts: Vec<String> = match args.first() {
                None | Some(JsValue::Undefined) => vec![s.to_string()],
                Some(JsValue::Regex { source, flags }) => build_regex(source, flags)?
                    .split(s)
                    .map(String::from)
                    .collect(),
                Some(sep) => {
                    let sep = sep.to_js_string();
                    if sep.is_empty() {
                        chars.iter().map(|c| c.to_string()).collect()
                    } else {
                        s.split(sep.as_str()).map(String::from).collect()
                    }
                }
            };
            JsValue::Array(parts.into_iter().take(limit).map(JsValue::Str).collect())
        }
        "replace" | "replaceAll" => {
            let (re, global) = match args.first() {
                Some(JsValue::Regex { source, flags }) => {
                    (build_regex(source, flags)?, name == "replaceAll" || flags.contains('g'))
                }
                _ => (compile_regex(&regex::escape(&arg_str(0)))?, name == "replaceAll"),
            };
            match args.get(1) {
                Some(JsValue::Function(f)) => {
                    let f = Rc::clone(f);
                    replace_with(&re, s, global, |caps| {
                        let mut call_args: Vec<JsValue> = caps
                            .iter()
                            .map(|m| m.map_or(JsValue::Undefined, |m| JsValue::str(m.as_str())))
                            .collect();
                        let offset = caps.get(0).map_or(0, |m| s[..m.start()].chars().count());
                        call_args.push(JsValue::Num(offset as f64));
                        call_args.push(JsValue::str(s));
                        Ok(interp.call_function(&f, call_args)?.to_js_string())
                    })?
                }
                _ => {
                    let replacement = js_replacement(&arg_str(1));
                    let out = if global {
                        re.replace_all(s, replacement.as_str())
                    } else {
                        re.replace(s, replacement.as_str())
                    };
                    JsValue::Str(out.into_owned())
                }
            }
        }
        "match" => {
            let (re, global) = match args.first() {
                Some(JsValue::Regex { source, flags }) => (build_regex(source, flags)?, flags.contains('g')),
                _ => (build_regex(&arg_str(0), "")?, false),
            };
            if global {
                let all: Vec<JsValue> = re.find_iter(s).map(|m| JsValue::str(m.as_str())).collect();
                if all.is_empty() { JsValue::Null } else { JsValue::Array(all) }
            } else {
                match_once(&re, s)
            }
        }
        "search" => {
            let re = match args.first() {
                Some(JsValue::Regex { source, flags }) => build_regex(source, flags)?,
                _ => build_regex(&arg_str(0), "")?,
            };
            JsValue::Num(re.find(s).map_or(-1.0, |m| s[..m.start()].chars().count() as f64))
        }
        "padStart" | "padEnd" => {
            let target = args.first().map_or(0.0, JsValue::to_number).max(0.0) as usize;
            if target > MAX_STRING_LEN {
                return Err(RuleError::script("RangeError: invalid string length"));
            }
            let fill = match args.get(1) {
                Some(v) if !matches!(v, JsValue::Undefined) => v.to_js_string(),
                _ => " ".to_string(),
            };
            if target <= len || fill.is_empty() {
                JsValue::str(s)
            } else {
                let pad: String = fill.chars().cycle().take(target - len).collect();
                JsValue::Str(if name == "padStart" { pad + s } else { format!("{s}{pad}") })
            }
        }
        "repeat" => {
            let n = args.first().map_or(0.0, JsValue::to_number);
            if n < 0.0 || !n.is_finite() || (n as usize).saturating_mul(s.len()) > MAX_STRING_LEN {
                return Err(RuleError::script("RangeError: invalid count value"));
            }
            JsValue::Str(s.repeat(n as usize))
        }
        "concat" => {
            let mut out = s.to_string();
            for v in args {
                let part = v.to_js_string();
                check_string_len(out.len() + part.len())?;
                out.push_str(&part);
            }
            JsValue::Str(out)
        }
        "localeCompare" => JsValue::Num(match s.cmp(arg_str(0).as_str()) {
            Ordering::Less => -1.0,
            Ordering::Equal => 0.0,
            Ordering::Greater => 1.0,
        }),
        "at" => {
            let i = args.first().map_or(0.0, JsValue::to_number);
            let idx = if i < 0.0 { len as f64 + i } else { i };
            match (idx >= 0.0).then(|| chars.get(idx as usize)).flatten() {
                Some(c) => JsValue::Str(c.to_string()),
                None => JsValue::Undefined,
            }
        }
        _ => return Err(RuleError::script(format!("string has no method {name}"))),
    })
}

/// Replace matches of `re` with the output of a fallible callback.
fn replace_with<F>(re: &Regex, s: &str, global: bool, mut f: F) -> Result<JsValue>
where
    F: FnMut(&regex::Captures<'_>) -> Result<String>,
{
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&s[last..m.start()]);
        out.push_str(&f(&caps)?);
        last = m.end();
        if !global {
            break;
        }
    }
    out.push_str(&s[last..]);
    Ok(JsValue::Str(out))
}

fn match_once(re: &Regex, s: &str) -> JsValue {
    match re.captures(s) {
        Some(caps) => JsValue::Array(
            caps.iter()
                .map(|m| m.map_or(JsValue::Undefined, |m| JsValue::str(m.as_str())))
                .collect(),
        ),
        None => JsValue::Null,
    }
}

/// Compile a JavaScript regex literal body with its flags.
fn build_regex(source: &str, flags: &str) -> Result<Regex> {
    let inline: String = flags.chars().filter(|c| matches!(c, 'i' | 'm' | 's')).collect();
    let source = source.replace("\\/", "/");
    if inline.is_empty() {
        compile_regex(&source)
    } else {
        compile_regex(&format!("(?{inline}){source}"))
    }
}

fn eval_lit(lit: &Lit) -> Result<JsValue> {
    Ok(match lit {
        Lit::Str(s) => JsValue::str(s.value.as_str().unwrap_or("")),
        Lit::Num(n) => JsValue::Num(n.value),
        Lit::Bool(b) => JsValue::Bool(b.value),
        Lit::Null(_) => JsValue::Null,
        Lit::Regex(r) => JsValue::Regex {
            source: r.exp.to_string(),
            flags: r.flags.to_string(),
        },
        _ => return Err(RuleError::script("unsupported literal")),
    })
}

fn function_value(function: &Function) -> JsValue {
    JsValue::Function(Rc::new(JsFunction {
        params: function.params.iter().map(|p| p.pat.clone()).collect(),
        body: FunctionBody::Block(function.body.clone().unwrap_or_default()),
    }))
}

fn is_namespace(name: &str) -> bool {
    matches!(
        name,
        "context" | "java" | "console" | "JSON" | "Math" | "Object" | "Array" | "Number" | "String"
    )
}

fn is_lvalue(expr: &Expr) -> bool {
    match expr {
        Expr::Ident(_) => true,
        Expr::Member(m) => is_lvalue(&m.obj),
        Expr::Paren(p) => is_lvalue(&p.expr),
        _ => false,
    }
}

fn spread_items(value: JsValue) -> Result<Vec<JsValue>> {
    match value {
        JsValue::Array(items) => Ok(items),
        JsValue::Str(s) => Ok(s.chars().map(|c| JsValue::Str(c.to_string())).collect()),
        other => Err(RuleError::script(format!("{} is not iterable", other.type_of()))),
    }
}

fn binary_op(op: BinaryOp, left: JsValue, right: JsValue) -> Result<JsValue> {
    use BinaryOp::*;

    let num = |f: fn(f64, f64) -> f64| JsValue::Num(f(left.to_number(), right.to_number()));
    let int = |f: fn(i32, i32) -> i32| {
        JsValue::Num(f64::from(f(to_int32(left.to_number()), to_int32(right.to_number()))))
    };

    Ok(match op {
        Add => {
            let stringy = |v: &JsValue| {
                matches!(v, JsValue::Str(_) | JsValue::Array(_) | JsValue::Object(_) | JsValue::Regex { .. })
            };
            if stringy(&left) || stringy(&right) {
                let (l, r) = (left.to_js_string(), right.to_js_string());
                check_string_len(l.len() + r.len())?;
                JsValue::Str(l + r.as_str())
            } else {
                num(|a, b| a + b)
            }
        }
        Sub => num(|a, b| a - b),
        Mul => num(|a, b| a * b),
        Div => num(|a, b| a / b),
        Mod => num(|a, b| a % b),
        Exp => num(f64::powf),
        EqEq => JsValue::Bool(left.loose_equals(&right)),
        NotEq => JsValue::Bool(!left.loose_equals(&right)),
        EqEqEq => JsValue::Bool(left.strict_equals(&right)),
        NotEqEq => JsValue::Bool(!left.strict_equals(&right)),
        Lt | LtEq | Gt | GtEq => {
            let ord = match (&left, &right) {
                (JsValue::Str(a), JsValue::Str(b)) => Some(a.cmp(b)),
                _ => left.to_number().partial_cmp(&right.to_number()),
            };
            JsValue::Bool(match (op, ord) {
                (_, None) => false,
                (Lt, Some(o)) => o == Ordering::Less,
                (LtEq, Some(o)) => o != Ordering::Greater,
                (Gt, Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            })
        }
        BitAnd => int(|a, b| a & b),
        BitOr => int(|a, b| a | b),
        BitXor => int(|a, b| a ^ b),
        LShift => int(|a, b| a.wrapping_shl(b as u32 & 31)),
        RShift => int(|a, b| a.wrapping_shr(b as u32 & 31)),
        ZeroFillRShift => {
            let a = to_int32(left.to_number()) as u32;
            let b = to_int32(right.to_number()) as u32 & 31;
            JsValue::Num(f64::from(a >> b))
        }
        In => {
            let key = left.to_js_string();
            JsValue::Bool(match &right {
                JsValue::Object(props) => props.iter().any(|(k, _)| *k == key),
                JsValue::Array(items) => key.parse::<usize>().is_ok_and(|i| i < items.len()),
                _ => return Err(RuleError::script("'in' needs an object")),
            })
        }
        _ => return Err(RuleError::script("unsupported operator")),
    })
}

fn compound_op(op: AssignOp) -> Result<BinaryOp> {
    Ok(match op {
        AssignOp::AddAssign => BinaryOp::Add,
        AssignOp::SubAssign => BinaryOp::Sub,
        AssignOp::MulAssign => BinaryOp::Mul,
        AssignOp::DivAssign => BinaryOp::Div,
        AssignOp::ModAssign => BinaryOp::Mod,
        AssignOp::ExpAssign => BinaryOp::Exp,
        AssignOp::LShiftAssign => BinaryOp::LShift,
        AssignOp::RShiftAssign => BinaryOp::RShift,
        AssignOp::ZeroFillRShiftAssign => BinaryOp::ZeroFillRShift,
        AssignOp::BitOrAssign => BinaryOp::BitOr,
        AssignOp::BitXorAssign => BinaryOp::BitXor,
        AssignOp::BitAndAssign => BinaryOp::BitAnd,
        _ => return Err(RuleError::script("unsupported assignment operator")),
    })
}

fn math(name: &str, args: &[JsValue]) -> Result<JsValue> {
    let x = args.first().map_or(f64::NAN, JsValue::to_number);
    Ok(JsValue::Num(match name {
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "round" => (x + 0.5).floor(),
        "trunc" => x.trunc(),
        "abs" => x.abs(),
        "sqrt" => x.sqrt(),
        "sign" => {
            if x.is_nan() || x == 0.0 { x } else { x.signum() }
        }
        "pow" => x.powf(args.get(1).map_or(f64::NAN, JsValue::to_number)),
        "max" => args
            .iter()
            .map(JsValue::to_number)
            .fold(f64::NEG_INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }),
        "min" => args
            .iter()
            .map(JsValue::to_number)
            .fold(f64::INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }),
        _ => return Err(RuleError::script(format!("Math.{name} is not a function"))),
    }))
}

fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64) as i32
}

/// Resolve a slice-style index: negative counts from the end, missing
/// gives `default`, the result is clamped to `0..=len`.
fn relative_index(v: Option<&JsValue>, len: usize, default: usize) -> usize {
    let n = match v {
        Some(v) if !matches!(v, JsValue::Undefined) => v.to_number(),
        _ => return default,
    };
    if n.is_nan() {
        0
    } else if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        n.min(len as f64) as usize
    }
}

fn parse_int(text: &str, radix: Option<f64>) -> f64 {
    let t = text.trim_start();
    let (negative, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    let hex = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"));
    let (radix, digits) = match (radix, hex) {
        (None, Some(rest)) => (16, rest),
        (Some(r), Some(rest)) if r as u32 == 16 => (16, rest),
        (None, None) => (10, t),
        (Some(r), _) if (2.0..=36.0).contains(&r) => (r as u32, t),
        _ => return f64::NAN,
    };
    let valid: Vec<u32> = digits.chars().map_while(|c| c.to_digit(radix)).collect();
    if valid.is_empty() {
        return f64::NAN;
    }
    let value = valid.iter().fold(0.0, |acc, d| acc * f64::from(radix) + f64::from(*d));
    if negative { -value } else { value }
}

fn parse_float(text: &str) -> f64 {
    let t = text.trim_start();
    FLOAT_PREFIX
        .as_ref()
        .and_then(|re| re.find(t))
        .map_or(f64::NAN, |m| string_to_number(m.as_str()))
}

fn number_to_radix(n: f64, radix: u32) -> String {
    if radix == 10 || !(2..=36).contains(&radix) || n.fract() != 0.0 || !n.is_finite() {
        return number_to_string(n);
    }
    let negative = n < 0.0;
    let mut v = n.abs() as u64;
    let mut digits = Vec::new();
    loop {
        digits.push(std::char::from_digit((v % u64::from(radix)) as u32, radix).unwrap_or('0'));
        v /= u64::from(radix);
        if v == 0 {
            break;
        }
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

/// Resolve the escapes a template literal's raw text may contain.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
