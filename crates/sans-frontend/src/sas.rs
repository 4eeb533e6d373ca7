//! Legacy SAS-subset front-end.
//!
//! A macro preprocessor is explicitly out of scope (any surviving `%token`
//! is caught as a leaked macro token and refused, not expanded) — this
//! module only ever sees already-expanded SAS text. Beyond that its job is
//! four stages: split the text into `;`-terminated statements
//! ([`split_statements`]), group statements into `data …`/`proc …` blocks
//! terminated by `run`/`quit` or an implicit successor block
//! ([`segment_blocks`]), recognize each block against the closed set of
//! supported forms, and lower the recognized forms to the same
//! [`sans_core::ir::IrDoc`] the native `.sans` dialect produces.
//!
//! Standard SAS has no `save`/`assert` construct, so this front-end adopts
//! the native dialect's trailer syntax (`save t to "path";`, `assert expr;`)
//! for those two — a script is otherwise indistinguishable from the SAS it
//! imitates.

use sans_core::diagnostic::Loc;
use sans_core::expr::{BinOp, BoolOp, Expr, UnOp};
use sans_core::ir::*;
use sans_core::types::Literal;
use std::collections::BTreeSet;

use crate::error::FrontendError;

type PResult<T> = Result<T, FrontendError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub loc: Loc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    Proc,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub header: Statement,
    pub body: Vec<Statement>,
    pub loc_span: Loc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Normal,
    InDq,
    InSq,
    InBlockComment,
    InStarComment,
}

/// Splits raw SAS text into `;`-terminated statements, tracking quotes and
/// both comment forms (`/* … */`, and a line-leading `* …;`). Ported
/// statement-for-statement from the reference splitter; only the token
/// representation (owned `Statement` structs instead of a generator) is
/// idiomatic-Rust rather than a direct transliteration.
pub fn split_statements(text: &str, file: &str) -> Vec<Statement> {
    let mut out = Vec::new();
    let mut state = SplitState::Normal;
    let mut buf = String::new();
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut i = 0usize;
    let mut line: u32 = 1;
    let mut at_line_start = true;
    let mut stmt_start_line: Option<u32> = None;
    let mut stmt_end_line: Option<u32> = None;

    macro_rules! flush {
        () => {{
            let s = buf.trim().to_string();
            if !s.is_empty() {
                let start = stmt_start_line.unwrap_or(line);
                let end = stmt_end_line.unwrap_or(start);
                out.push(Statement { text: s, loc: Loc::new(file, start, end) });
            }
            buf.clear();
            stmt_start_line = None;
            stmt_end_line = None;
        }};
    }

    while i < n {
        let ch = chars[i];
        let nxt = if i + 1 < n { chars[i + 1] } else { '\0' };

        if ch == '\n' {
            if matches!(state, SplitState::Normal | SplitState::InDq | SplitState::InSq) {
                buf.push(ch);
            }
            line += 1;
            at_line_start = true;
            i += 1;
            continue;
        }

        match state {
            SplitState::InBlockComment => {
                if ch == '*' && nxt == '/' {
                    state = SplitState::Normal;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            SplitState::InStarComment => {
                if ch == ';' {
                    state = SplitState::Normal;
                }
                i += 1;
                continue;
            }
            SplitState::InDq => {
                buf.push(ch);
                if ch == '"' {
                    state = SplitState::Normal;
                }
                if stmt_start_line.is_none() {
                    stmt_start_line = Some(line);
                }
                stmt_end_line = Some(line);
                at_line_start = false;
                i += 1;
                continue;
            }
            SplitState::InSq => {
                buf.push(ch);
                if ch == '\'' {
                    state = SplitState::Normal;
                }
                if stmt_start_line.is_none() {
                    stmt_start_line = Some(line);
                }
                stmt_end_line = Some(line);
                at_line_start = false;
                i += 1;
                continue;
            }
            SplitState::Normal => {}
        }

        if at_line_start {
            if ch.is_whitespace() {
                buf.push(ch);
                i += 1;
                continue;
            }
            if ch == '*' {
                state = SplitState::InStarComment;
                at_line_start = false;
                i += 1;
                continue;
            }
        }

        if ch == '/' && nxt == '*' {
            state = SplitState::InBlockComment;
            at_line_start = false;
            i += 2;
            continue;
        }

        if ch == '"' {
            state = SplitState::InDq;
            buf.push(ch);
            if stmt_start_line.is_none() {
                stmt_start_line = Some(line);
            }
            stmt_end_line = Some(line);
            at_line_start = false;
            i += 1;
            continue;
        }

        if ch == '\'' {
            state = SplitState::InSq;
            buf.push(ch);
            if stmt_start_line.is_none() {
                stmt_start_line = Some(line);
            }
            stmt_end_line = Some(line);
            at_line_start = false;
            i += 1;
            continue;
        }

        if ch == ';' {
            flush!();
            at_line_start = false;
            i += 1;
            continue;
        }

        buf.push(ch);
        if !ch.is_whitespace() {
            if stmt_start_line.is_none() {
                stmt_start_line = Some(line);
            }
            stmt_end_line = Some(line);
        }
        at_line_start = false;
        i += 1;
    }
    flush!();
    out
}

/// Groups statements into `data`/`proc` blocks, each terminated by an
/// explicit `run`/`quit` statement or implicitly by the next block header.
/// Every other statement becomes its own single-statement `Other` block.
pub fn segment_blocks(statements: &[Statement]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut i = 0usize;
    while i < statements.len() {
        let stmt = &statements[i];
        let lower = stmt.text.to_ascii_lowercase();
        if lower.starts_with("data ") || lower.starts_with("proc ") {
            let kind = if lower.starts_with("data ") { BlockKind::Data } else { BlockKind::Proc };
            let header = stmt.clone();
            let mut body = Vec::new();
            let mut j = i + 1;
            let mut end_loc = header.loc.clone();
            while j < statements.len() {
                let cur = &statements[j];
                let cur_lower = cur.text.to_ascii_lowercase();
                if cur_lower == "run" || cur_lower == "quit" {
                    end_loc = cur.loc.clone();
                    j += 1;
                    break;
                }
                if cur_lower.starts_with("data ") || cur_lower.starts_with("proc ") {
                    break;
                }
                end_loc = cur.loc.clone();
                body.push(cur.clone());
                j += 1;
            }
            let loc_span = Loc::new(header.loc.file.clone(), header.loc.line_start, end_loc.line_end);
            blocks.push(Block { kind, header, body, loc_span });
            i = j;
        } else {
            blocks.push(Block {
                kind: BlockKind::Other,
                header: stmt.clone(),
                body: Vec::new(),
                loc_span: stmt.loc.clone(),
            });
            i += 1;
        }
    }
    blocks
}

fn starts_with_token(s: &str, token: &str, extra_follow: &str) -> bool {
    if !s.starts_with(token) {
        return false;
    }
    if s.len() == token.len() {
        return true;
    }
    let next = s[token.len()..].chars().next().unwrap_or(' ');
    next.is_whitespace() || extra_follow.contains(next)
}

/// Closed list of statement-leading tokens that force a hard refusal inside
/// a `data` step body — anything stateful (`retain`, `lag`, arrays, `call`
/// routines, raw `infile`/`input`) or that would require a macro
/// preprocessor or nested proc. `by`/`merge` are handled separately in
/// [`recognize_data_block`] — together they lower to a `data_step` merge;
/// either alone is still a refusal.
fn find_forbidden_token(stmt_text: &str) -> Option<&'static str> {
    let s = stmt_text.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    if s.starts_with('%') {
        return Some("%");
    }
    if starts_with_token(&s, "proc", "") {
        return Some("proc");
    }
    if starts_with_token(&s, "do", "") {
        return Some("do");
    }
    if starts_with_token(&s, "end", "") {
        return Some("end");
    }
    if starts_with_token(&s, "retain", "") {
        return Some("retain");
    }
    if starts_with_token(&s, "lag", "(") {
        return Some("lag");
    }
    if s.starts_with("first.") {
        return Some("first.");
    }
    if s.starts_with("last.") {
        return Some("last.");
    }
    if starts_with_token(&s, "array", "") {
        return Some("array");
    }
    if starts_with_token(&s, "call", "") {
        return Some("call");
    }
    if starts_with_token(&s, "output", "") {
        return Some("output");
    }
    if starts_with_token(&s, "infile", "") {
        return Some("infile");
    }
    if starts_with_token(&s, "input", "") {
        return Some("input");
    }
    None
}

// ---------------------------------------------------------------------
// SAS expression grammar: `=`/`^=`/`~=`/`eq`/`ne`/`lt`/`le`/`gt`/`ge` are
// genuine SAS comparison spellings (unlike the native `.sans` dialect,
// which deliberately refuses them), plus `.` as a null literal.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Decimal(String),
    Str(String),
    Null,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Eof,
}

fn sas_lex(s: &str, loc: &Loc) -> PResult<Vec<Tok>> {
    let mut toks = Vec::new();
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    let mut i = 0usize;
    while i < n {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < n && chars[i] != quote {
                    i += 1;
                }
                if i >= n {
                    return Err(FrontendError::Parse("unterminated string literal".to_string(), loc.clone()));
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Str(text));
                i += 1;
            }
            '.' if !(i + 1 < n && chars[i + 1].is_ascii_digit()) => {
                toks.push(Tok::Null);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut is_decimal = false;
                while i < n && (chars[i].is_ascii_digit() || (chars[i] == '.' && !is_decimal)) {
                    if chars[i] == '.' {
                        is_decimal = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_decimal {
                    toks.push(Tok::Decimal(text));
                } else {
                    let v: i64 = text
                        .parse()
                        .map_err(|_| FrontendError::Parse(format!("invalid integer literal '{text}'"), loc.clone()))?;
                    toks.push(Tok::Int(v));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_lowercase().as_str() {
                    "eq" => toks.push(Tok::Eq),
                    "ne" => toks.push(Tok::Ne),
                    "lt" => toks.push(Tok::Lt),
                    "le" => toks.push(Tok::Le),
                    "gt" => toks.push(Tok::Gt),
                    "ge" => toks.push(Tok::Ge),
                    "null" => toks.push(Tok::Null),
                    _ => toks.push(Tok::Ident(word)),
                }
            }
            '^' | '~' if i + 1 < n && chars[i + 1] == '=' => {
                toks.push(Tok::Ne);
                i += 2;
            }
            '<' if i + 1 < n && chars[i + 1] == '=' => {
                toks.push(Tok::Le);
                i += 2;
            }
            '>' if i + 1 < n && chars[i + 1] == '=' => {
                toks.push(Tok::Ge);
                i += 2;
            }
            '=' => {
                toks.push(Tok::Eq);
                i += 1;
            }
            '<' => {
                toks.push(Tok::Lt);
                i += 1;
            }
            '>' => {
                toks.push(Tok::Gt);
                i += 1;
            }
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            other => {
                return Err(FrontendError::Parse(format!("unexpected character '{other}' in expression"), loc.clone()))
            }
        }
    }
    toks.push(Tok::Eof);
    Ok(toks)
}

struct ExprParser<'a> {
    toks: Vec<Tok>,
    pos: usize,
    loc: &'a Loc,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut args = vec![self.parse_and()?];
        while matches!(self.peek(), Tok::Ident(s) if s.eq_ignore_ascii_case("or")) {
            self.advance();
            args.push(self.parse_and()?);
        }
        Ok(if args.len() == 1 { args.pop().unwrap() } else { Expr::boolop(BoolOp::Or, args) })
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut args = vec![self.parse_not()?];
        while matches!(self.peek(), Tok::Ident(s) if s.eq_ignore_ascii_case("and")) {
            self.advance();
            args.push(self.parse_not()?);
        }
        Ok(if args.len() == 1 { args.pop().unwrap() } else { Expr::boolop(BoolOp::And, args) })
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if matches!(self.peek(), Tok::Ident(s) if s.eq_ignore_ascii_case("not")) {
            self.advance();
            return Ok(Expr::unop(UnOp::Not, self.parse_not()?));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> PResult<Expr> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Tok::Eq => Some(BinOp::Eq),
            Tok::Ne => Some(BinOp::Ne),
            Tok::Lt => Some(BinOp::Lt),
            Tok::Le => Some(BinOp::Le),
            Tok::Gt => Some(BinOp::Gt),
            Tok::Ge => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_add()?;
            return Ok(Expr::binop(op, left, right));
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> PResult<Expr> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => Some(BinOp::Add),
                Tok::Minus => Some(BinOp::Sub),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    left = Expr::binop(op, left, self.parse_mul()?);
                }
                None => break,
            }
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> PResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => Some(BinOp::Mul),
                Tok::Slash => Some(BinOp::Div),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    left = Expr::binop(op, left, self.parse_unary()?);
                }
                None => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        match self.peek() {
            Tok::Plus => {
                self.advance();
                Ok(Expr::unop(UnOp::Pos, self.parse_unary()?))
            }
            Tok::Minus => {
                self.advance();
                Ok(Expr::unop(UnOp::Neg, self.parse_unary()?))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        match self.advance() {
            Tok::Int(n) => Ok(Expr::lit(Literal::Int(n))),
            Tok::Decimal(s) => {
                let d: rust_decimal::Decimal = s
                    .parse()
                    .map_err(|_| FrontendError::BadExpr(format!("invalid decimal literal '{s}'"), self.loc.clone()))?;
                Ok(Expr::lit(Literal::Decimal(d)))
            }
            Tok::Str(s) => Ok(Expr::lit(Literal::String(s))),
            Tok::Null => Ok(Expr::lit(Literal::Null)),
            Tok::LParen => {
                let e = self.parse_expr()?;
                if !matches!(self.peek(), Tok::RParen) {
                    return Err(FrontendError::Parse("expected ')'".to_string(), self.loc.clone()));
                }
                self.advance();
                Ok(e)
            }
            Tok::Ident(name) => {
                if matches!(self.peek(), Tok::LParen) {
                    let lower = name.to_ascii_lowercase();
                    if !matches!(lower.as_str(), "coalesce" | "if" | "put" | "input" | "row_count") {
                        return Err(FrontendError::BadExpr(
                            format!("'{name}' is not a recognized function"),
                            self.loc.clone(),
                        ));
                    }
                    self.advance();
                    let mut args = Vec::new();
                    while !matches!(self.peek(), Tok::RParen) {
                        args.push(self.parse_expr()?);
                        if matches!(self.peek(), Tok::Comma) {
                            self.advance();
                        }
                    }
                    self.advance();
                    Ok(Expr::call(lower, args))
                } else {
                    Ok(Expr::col(name))
                }
            }
            other => Err(FrontendError::BadExpr(format!("unexpected token {other:?} in expression"), self.loc.clone())),
        }
    }
}

fn parse_sas_expr(text: &str, loc: &Loc) -> PResult<Expr> {
    let toks = sas_lex(text, loc)?;
    let mut p = ExprParser { toks, pos: 0, loc };
    let e = p.parse_expr()?;
    if !matches!(p.peek(), Tok::Eof) {
        return Err(FrontendError::Parse(format!("trailing input after expression: '{text}'"), loc.clone()));
    }
    Ok(e)
}

fn split_ws(s: &str) -> Vec<String> {
    s.split_whitespace().map(|t| t.to_string()).collect()
}

struct IdGen {
    seq: u32,
}

impl IdGen {
    fn next(&mut self, op: &str) -> String {
        self.seq += 1;
        format!("{op}:{}", self.seq)
    }
}

/// Recognizes and lowers a single `data … run` block, producing the fixed
/// `rename? -> compute? -> filter? -> select?` pipeline and the matching
/// `<out>__1, <out>__2, …` temp names.
fn recognize_data_block(block: &Block, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let header_lower = block.header.text.to_ascii_lowercase();
    let header_parts = split_ws(&header_lower);
    if header_parts.len() < 2 || header_parts[0] != "data" {
        return Err(FrontendError::Parse(
            format!("malformed data block header: '{}'", block.header.text),
            block.header.loc.clone(),
        ));
    }
    let final_output = header_parts[1].trim_end_matches(';').to_string();

    for stmt in &block.body {
        if let Some(token) = find_forbidden_token(&stmt.text) {
            return Err(FrontendError::ForbiddenToken { token: token.to_string(), loc: block.loc_span.clone() });
        }
    }

    let merge_stmts: Vec<&Statement> =
        block.body.iter().filter(|s| starts_with_token(&s.text.to_ascii_lowercase(), "merge", "")).collect();
    let by_stmts: Vec<&Statement> =
        block.body.iter().filter(|s| starts_with_token(&s.text.to_ascii_lowercase(), "by", "")).collect();

    let mut current = if !merge_stmts.is_empty() {
        if merge_stmts.len() != 1 {
            return Err(FrontendError::Parse("at most one MERGE statement is supported".to_string(), block.loc_span.clone()));
        }
        if by_stmts.len() != 1 {
            return Err(FrontendError::Parse("MERGE requires exactly one BY statement".to_string(), block.loc_span.clone()));
        }
        let merge_tables: Vec<String> = split_ws(&merge_stmts[0].text)[1..].iter().map(|t| t.to_ascii_lowercase()).collect();
        if merge_tables.len() < 2 {
            return Err(FrontendError::Parse("MERGE requires at least two input tables".to_string(), merge_stmts[0].loc.clone()));
        }
        let by: Vec<String> = split_ws(&by_stmts[0].text)[1..].iter().map(|c| c.to_ascii_lowercase()).collect();
        if by.is_empty() {
            return Err(FrontendError::Parse("BY requires at least one column".to_string(), by_stmts[0].loc.clone()));
        }
        let out = format!("{final_output}__{}", ids.seq + 1);
        let id = ids.next("data_step");
        steps.push(Step {
            id,
            inputs: merge_tables,
            outputs: vec![out.clone()],
            params: OpParams::DataStep(DataStepParams { mode: DataStepMode::Merge, by }),
            loc: Some(block.loc_span.clone()),
        });
        out
    } else {
        if !by_stmts.is_empty() {
            return Err(FrontendError::Parse("BY without MERGE is not supported in a data step".to_string(), block.loc_span.clone()));
        }
        let set_stmts: Vec<&Statement> = block
            .body
            .iter()
            .filter(|s| s.text.to_ascii_lowercase().starts_with("set"))
            .collect();
        if set_stmts.len() != 1 {
            return Err(FrontendError::Parse(
                "data step must contain exactly one SET statement".to_string(),
                block.loc_span.clone(),
            ));
        }
        let set_parts = split_ws(&set_stmts[0].text.to_ascii_lowercase());
        if set_parts.len() != 2 {
            return Err(FrontendError::Parse(
                format!("malformed SET statement: '{}'", set_stmts[0].text),
                set_stmts[0].loc.clone(),
            ));
        }
        set_parts[1].clone()
    };

    let rename_stmts: Vec<&Statement> =
        block.body.iter().filter(|s| s.text.to_ascii_lowercase().starts_with("rename ")).collect();
    if rename_stmts.len() > 1 {
        return Err(FrontendError::Parse("at most one RENAME statement is supported".to_string(), block.loc_span.clone()));
    }
    if let Some(stmt) = rename_stmts.first() {
        let map_str = &stmt.text[stmt.text.to_ascii_lowercase().find("rename ").unwrap() + "rename ".len()..];
        let mut mapping = Vec::new();
        for pair in split_ws(map_str) {
            let parts: Vec<&str> = pair.split('=').collect();
            if parts.len() != 2 {
                return Err(FrontendError::Parse(format!("malformed RENAME pair: '{pair}'"), stmt.loc.clone()));
            }
            mapping.push(RenameEntry { from: parts[0].to_string(), to: parts[1].to_string() });
        }
        let out = format!("{final_output}__{}", ids.seq + 1);
        let id = ids.next("rename");
        steps.push(Step {
            id,
            inputs: vec![current.clone()],
            outputs: vec![out.clone()],
            params: OpParams::Rename(RenameParams { mapping }),
            loc: Some(block.loc_span.clone()),
        });
        current = out;
    }

    let assign_stmts: Vec<&Statement> = block
        .body
        .iter()
        .filter(|s| {
            let t = s.text.trim();
            let lower = t.to_ascii_lowercase();
            !lower.starts_with("set") && !lower.starts_with("rename ") && !lower.starts_with("if ") && t.contains('=')
        })
        .collect();
    if !assign_stmts.is_empty() {
        let mut assignments = Vec::new();
        for stmt in &assign_stmts {
            let eq_pos = stmt.text.find('=').unwrap();
            let target = stmt.text[..eq_pos].trim().to_string();
            if target.is_empty() || !target.chars().next().unwrap().is_alphabetic() && target.chars().next() != Some('_') {
                return Err(FrontendError::Parse(format!("malformed assignment: '{}'", stmt.text), stmt.loc.clone()));
            }
            let expr_str = stmt.text[eq_pos + 1..].trim();
            let expr = parse_sas_expr(expr_str, &stmt.loc)?;
            assignments.push(Assignment { target, expr });
        }
        let out = format!("{final_output}__{}", ids.seq + 1);
        let id = ids.next("compute");
        steps.push(Step {
            id,
            inputs: vec![current.clone()],
            outputs: vec![out.clone()],
            params: OpParams::Compute(ComputeParams { mode: ComputeMode::Derive, assignments }),
            loc: Some(block.loc_span.clone()),
        });
        current = out;
    }

    let filter_stmts: Vec<&Statement> =
        block.body.iter().filter(|s| s.text.to_ascii_lowercase().starts_with("if ")).collect();
    if filter_stmts.len() > 1 {
        return Err(FrontendError::Parse("at most one IF statement is supported".to_string(), block.loc_span.clone()));
    }
    let has_filter = !filter_stmts.is_empty();
    if let Some(stmt) = filter_stmts.first() {
        let predicate_str = stmt.text[3..].trim();
        let predicate = parse_sas_expr(predicate_str, &stmt.loc)?;
        let out = format!("{final_output}__{}", ids.seq + 1);
        let id = ids.next("filter");
        steps.push(Step {
            id,
            inputs: vec![current.clone()],
            outputs: vec![out.clone()],
            params: OpParams::Filter(FilterParams { predicate }),
            loc: Some(block.loc_span.clone()),
        });
        current = out;
    }

    let select_stmts: Vec<&Statement> = block
        .body
        .iter()
        .filter(|s| {
            let l = s.text.to_ascii_lowercase();
            l.starts_with("keep ") || l.starts_with("drop ")
        })
        .collect();
    if select_stmts.len() > 1 {
        return Err(FrontendError::Parse("at most one KEEP or DROP statement is supported".to_string(), block.loc_span.clone()));
    }
    let has_select = !select_stmts.is_empty();
    if let Some(stmt) = select_stmts.first() {
        let lower = stmt.text.to_ascii_lowercase();
        let is_keep = lower.starts_with("keep ");
        let cols_str = &stmt.text[if is_keep { 5 } else { 5 }..];
        let cols = split_ws(cols_str);
        let params = if is_keep {
            OpParams::Select(SelectParams::Cols { cols })
        } else {
            OpParams::Select(SelectParams::Drop { drop: cols })
        };
        let id = ids.next("select");
        steps.push(Step {
            id,
            inputs: vec![current.clone()],
            outputs: vec![final_output.clone()],
            params,
            loc: Some(block.loc_span.clone()),
        });
        current = final_output.clone();
    }

    // accounted statements: set, merge/by, rename, assignments, if, keep/drop.
    for stmt in &block.body {
        let lower = stmt.text.to_ascii_lowercase();
        let accounted = lower.starts_with("set")
            || lower.starts_with("merge ")
            || lower.starts_with("by ")
            || lower.starts_with("rename ")
            || lower.starts_with("if ")
            || lower.starts_with("keep ")
            || lower.starts_with("drop ")
            || assign_stmts.iter().any(|s| s.text == stmt.text);
        if !accounted {
            return Err(FrontendError::Parse(
                format!("unsupported statement in data step: '{}'", stmt.text),
                stmt.loc.clone(),
            ));
        }
    }

    if !has_filter && !has_select && steps.last().map(|s| s.outputs.first().cloned()) != Some(Some(final_output.clone())) {
        if let Some(last) = steps.last_mut() {
            if last.outputs.first().map(|o| o == &current).unwrap_or(false) {
                last.outputs = vec![final_output.clone()];
            } else {
                let id = ids.next("identity");
                steps.push(Step {
                    id,
                    inputs: vec![current],
                    outputs: vec![final_output],
                    params: OpParams::Identity(IdentityParams {}),
                    loc: Some(block.loc_span.clone()),
                });
            }
        } else {
            let id = ids.next("identity");
            steps.push(Step {
                id,
                inputs: vec![current],
                outputs: vec![final_output],
                params: OpParams::Identity(IdentityParams {}),
                loc: Some(block.loc_span.clone()),
            });
        }
    }

    Ok(())
}

fn header_option(header_lower: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    header_lower.find(&needle).map(|pos| {
        header_lower[pos + needle.len()..]
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string()
    })
}

fn recognize_proc_sort_block(block: &Block, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let header_lower = block.header.text.to_ascii_lowercase();
    let input = header_option(&header_lower, "data")
        .ok_or_else(|| FrontendError::Parse("PROC SORT requires a DATA= option".to_string(), block.header.loc.clone()))?;
    let output = header_option(&header_lower, "out")
        .ok_or_else(|| FrontendError::Parse("PROC SORT requires an OUT= option".to_string(), block.header.loc.clone()))?;

    let by_stmts: Vec<&Statement> = block.body.iter().filter(|s| s.text.to_ascii_lowercase().starts_with("by")).collect();
    if by_stmts.len() != 1 {
        return Err(FrontendError::Parse("PROC SORT requires exactly one BY statement".to_string(), block.loc_span.clone()));
    }
    let by_text = by_stmts[0].text.trim();
    let by_vars_str = by_text[2..].trim();
    let by = split_ws(by_vars_str)
        .into_iter()
        .map(|col| {
            if let Some(stripped) = col.strip_prefix('-') {
                SortKey { col: stripped.to_string(), desc: true }
            } else {
                SortKey { col, desc: false }
            }
        })
        .collect();

    for stmt in &block.body {
        if stmt.text.to_ascii_lowercase().starts_with("by") {
            continue;
        }
        return Err(FrontendError::Parse(
            format!("unsupported statement in PROC SORT body: '{}'", stmt.text),
            stmt.loc.clone(),
        ));
    }

    let id = ids.next("sort");
    steps.push(Step {
        id,
        inputs: vec![input],
        outputs: vec![output],
        params: OpParams::Sort(SortParams { by, nodupkey: None }),
        loc: Some(block.loc_span.clone()),
    });
    Ok(())
}

fn recognize_proc_transpose_block(block: &Block, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let header_lower = block.header.text.to_ascii_lowercase();
    let input = header_option(&header_lower, "data")
        .ok_or_else(|| FrontendError::Parse("PROC TRANSPOSE requires a DATA= option".to_string(), block.header.loc.clone()))?;
    let output = header_option(&header_lower, "out")
        .ok_or_else(|| FrontendError::Parse("PROC TRANSPOSE requires an OUT= option".to_string(), block.header.loc.clone()))?;

    let mut by = Vec::new();
    let mut id_col = None;
    let mut var_cols = Vec::new();
    for stmt in &block.body {
        let lower = stmt.text.to_ascii_lowercase();
        if lower.starts_with("by") {
            by = split_ws(stmt.text.trim()[2..].trim());
        } else if lower.starts_with("id ") {
            id_col = split_ws(stmt.text.trim()[3..].trim()).into_iter().next();
        } else if lower.starts_with("var ") {
            var_cols = split_ws(stmt.text.trim()[4..].trim());
        } else {
            return Err(FrontendError::Parse(
                format!("unsupported statement in PROC TRANSPOSE body: '{}'", stmt.text),
                stmt.loc.clone(),
            ));
        }
    }
    let id_col = id_col
        .ok_or_else(|| FrontendError::Parse("PROC TRANSPOSE requires an ID statement".to_string(), block.loc_span.clone()))?;

    let id = ids.next("transpose");
    steps.push(Step {
        id,
        inputs: vec![input],
        outputs: vec![output],
        params: OpParams::Transpose(TransposeParams { by, id_col, var_cols }),
        loc: Some(block.loc_span.clone()),
    });
    Ok(())
}

/// `proc summary data=<in>; class a b; var c d; output out=<out> mean=c_mean sum=d_sum; run;`
fn recognize_proc_summary_block(block: &Block, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let header_lower = block.header.text.to_ascii_lowercase();
    let input = header_option(&header_lower, "data")
        .ok_or_else(|| FrontendError::Parse("PROC SUMMARY requires a DATA= option".to_string(), block.header.loc.clone()))?;

    let mut group_by = Vec::new();
    let mut var_cols = Vec::new();
    let mut output_stmt: Option<&Statement> = None;
    for stmt in &block.body {
        let lower = stmt.text.to_ascii_lowercase();
        if lower.starts_with("class ") {
            group_by = split_ws(stmt.text.trim()[6..].trim());
        } else if lower.starts_with("var ") {
            var_cols = split_ws(stmt.text.trim()[4..].trim());
        } else if lower.starts_with("output ") {
            output_stmt = Some(stmt);
        } else {
            return Err(FrontendError::Parse(
                format!("unsupported statement in PROC SUMMARY body: '{}'", stmt.text),
                stmt.loc.clone(),
            ));
        }
    }
    let output_stmt = output_stmt
        .ok_or_else(|| FrontendError::Parse("PROC SUMMARY requires an OUTPUT statement".to_string(), block.loc_span.clone()))?;
    let out_lower = output_stmt.text.to_ascii_lowercase();
    let output = header_option(&out_lower, "out")
        .ok_or_else(|| FrontendError::Parse("OUTPUT statement requires an OUT= option".to_string(), output_stmt.loc.clone()))?;

    let mut metrics = Vec::new();
    for tok in split_ws(&output_stmt.text["output ".len().min(output_stmt.text.len())..]) {
        if let Some((stat, cols)) = tok.split_once('=') {
            let op = match stat.to_ascii_lowercase().as_str() {
                "mean" => AggOp::Mean,
                "sum" => AggOp::Sum,
                "min" => AggOp::Min,
                "max" => AggOp::Max,
                "n" => AggOp::N,
                _ => continue,
            };
            for name in cols.split('=').next().unwrap_or("").split(' ').filter(|s| !s.is_empty()) {
                let col = var_cols.first().cloned().unwrap_or_default();
                metrics.push(Metric { name: name.to_string(), op, col });
            }
        }
    }
    if metrics.is_empty() {
        for col in &var_cols {
            metrics.push(Metric { name: format!("{col}_mean"), op: AggOp::Mean, col: col.clone() });
        }
    }

    let id = ids.next("aggregate");
    steps.push(Step {
        id,
        inputs: vec![input],
        outputs: vec![output],
        params: OpParams::Aggregate(AggregateParams { group_by, metrics }),
        loc: Some(block.loc_span.clone()),
    });
    Ok(())
}

/// `proc format; value <name> <value>='<label>' ...; run;` — a single
/// VALUE statement per block, consistent with the native dialect's one
/// entry list per `format` step.
fn recognize_proc_format_block(block: &Block, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let value_stmt = block
        .body
        .iter()
        .find(|s| s.text.to_ascii_lowercase().starts_with("value "))
        .ok_or_else(|| FrontendError::Parse("PROC FORMAT requires a VALUE statement".to_string(), block.loc_span.clone()))?;
    let rest = value_stmt.text.trim()[6..].trim();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts
        .next()
        .ok_or_else(|| FrontendError::Parse("malformed VALUE statement".to_string(), value_stmt.loc.clone()))?
        .to_string();
    let body = parts.next().unwrap_or("");
    let mut entries = Vec::new();
    for pair in body.split_whitespace() {
        let (value_str, label) = pair
            .split_once('=')
            .ok_or_else(|| FrontendError::Parse(format!("malformed format entry '{pair}'"), value_stmt.loc.clone()))?;
        let value = if let Ok(n) = value_str.parse::<i64>() {
            Literal::Int(n)
        } else {
            Literal::String(value_str.trim_matches(|c| c == '\'' || c == '"').to_string())
        };
        entries.push(FormatEntry { value, label: label.trim_matches(|c| c == '\'' || c == '"').to_string() });
    }
    let id = ids.next("format");
    let output = format!("__format__{name}");
    steps.push(Step {
        id,
        inputs: vec![],
        outputs: vec![output],
        params: OpParams::Format(FormatParams { name, entries }),
        loc: Some(block.loc_span.clone()),
    });
    Ok(())
}

/// `proc sql; create table <out> as select <cols> from <in> [where <expr>] [group by <cols>]; quit;`
fn recognize_proc_sql_block(block: &Block, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let create_stmt = block
        .body
        .iter()
        .find(|s| s.text.to_ascii_lowercase().starts_with("create table "))
        .ok_or_else(|| FrontendError::Parse("PROC SQL requires a CREATE TABLE ... AS SELECT statement".to_string(), block.loc_span.clone()))?;
    let lower = create_stmt.text.to_ascii_lowercase();
    let after_create = &create_stmt.text[13..];
    let as_pos = lower["create table ".len()..]
        .find(" as ")
        .ok_or_else(|| FrontendError::Parse("malformed CREATE TABLE ... AS SELECT statement".to_string(), create_stmt.loc.clone()))?;
    let out_name = after_create[..as_pos].trim().to_string();
    let select_body = after_create[as_pos + 4..].trim();
    let select_lower = select_body.to_ascii_lowercase();
    if !select_lower.starts_with("select ") {
        return Err(FrontendError::Parse("expected SELECT after AS".to_string(), create_stmt.loc.clone()));
    }
    let from_pos = select_lower
        .find(" from ")
        .ok_or_else(|| FrontendError::Parse("SELECT requires a FROM clause".to_string(), create_stmt.loc.clone()))?;
    let select_list = select_body[7..from_pos].trim();
    let rest = select_body[from_pos + 6..].trim();

    let where_pos = rest.to_ascii_lowercase().find(" where ");
    let group_pos = rest.to_ascii_lowercase().find(" group by ");
    let cut = [where_pos, group_pos].into_iter().flatten().min().unwrap_or(rest.len());
    let from_table = rest[..cut].trim().to_string();

    let mut where_expr = None;
    if let Some(wp) = where_pos {
        let end = group_pos.filter(|g| *g > wp).unwrap_or(rest.len());
        let where_str = rest[wp + 7..end].trim();
        where_expr = Some(parse_sas_expr(where_str, &create_stmt.loc)?);
    }
    let mut group_by = Vec::new();
    if let Some(gp) = group_pos {
        let group_str = rest[gp + 10..].trim();
        group_by = group_str.split(',').map(|s| s.trim().to_string()).collect();
    }

    let cols: Vec<&str> = select_list.split(',').map(|s| s.trim()).collect();
    let mut select = Vec::new();
    let mut metrics = Vec::new();
    for col in cols {
        if col == "*" {
            continue;
        }
        let col_lower = col.to_ascii_lowercase();
        let agg_fn = ["mean", "sum", "min", "max", "count"].into_iter().find(|f| col_lower.starts_with(&format!("{f}(")));
        if let Some(f) = agg_fn {
            let inner_start = f.len() + 1;
            let inner_end = col.rfind(')').unwrap_or(col.len());
            let mut inner = col[inner_start..inner_end].trim().to_string();
            let alias = if let Some(as_idx) = col_lower.find(" as ") {
                let a = col[as_idx + 4..].trim().to_string();
                inner = inner;
                a
            } else {
                format!("{inner}_{f}")
            };
            let op = match f {
                "mean" => AggOp::Mean,
                "sum" => AggOp::Sum,
                "min" => AggOp::Min,
                "max" => AggOp::Max,
                _ => AggOp::Count,
            };
            metrics.push(Metric { name: alias, op, col: inner });
        } else {
            select.push(col.to_string());
        }
    }

    let id = ids.next("sql_select");
    steps.push(Step {
        id,
        inputs: vec![from_table],
        outputs: vec![out_name],
        params: OpParams::SqlSelect(SqlSelectParams {
            from: from_table.clone(),
            joins: Vec::new(),
            select,
            where_: where_expr,
            group_by,
            metrics,
        }),
        loc: Some(block.loc_span.clone()),
    });
    Ok(())
}

fn parse_save_directive(stmt: &Statement, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let rest = stmt.text.trim()[5..].trim();
    let to_pos = rest
        .to_ascii_lowercase()
        .find(" to ")
        .ok_or_else(|| FrontendError::Parse("malformed save directive: expected 'save <table> to \"<path>\"'".to_string(), stmt.loc.clone()))?;
    let table = rest[..to_pos].trim().to_string();
    let after_to = rest[to_pos + 4..].trim();
    let (path, name) = parse_quoted_with_optional_as(after_to, &stmt.loc)?;
    let id = ids.next("save");
    steps.push(Step {
        id,
        inputs: vec![table],
        outputs: vec![],
        params: OpParams::Save(SaveParams { path, name }),
        loc: Some(stmt.loc.clone()),
    });
    Ok(())
}

fn parse_quoted_with_optional_as(s: &str, loc: &Loc) -> PResult<(String, Option<String>)> {
    let s = s.trim();
    if !s.starts_with('"') {
        return Err(FrontendError::Parse(format!("expected a quoted path, found '{s}'"), loc.clone()));
    }
    let end = s[1..]
        .find('"')
        .ok_or_else(|| FrontendError::Parse("unterminated string".to_string(), loc.clone()))?
        + 1;
    let path = s[1..end].to_string();
    let rest = s[end + 1..].trim();
    if rest.is_empty() {
        return Ok((path, None));
    }
    let lower = rest.to_ascii_lowercase();
    if !lower.starts_with("as ") {
        return Err(FrontendError::Parse(format!("unexpected trailing text '{rest}'"), loc.clone()));
    }
    let name_part = rest[3..].trim();
    let (name, _) = parse_quoted_with_optional_as(name_part, loc)?;
    Ok((path, Some(name)))
}

fn parse_assert_directive(stmt: &Statement, ids: &mut IdGen, steps: &mut Vec<Step>) -> PResult<()> {
    let expr_str = stmt.text.trim()[6..].trim();
    let predicate = parse_sas_expr(expr_str, &stmt.loc)?;
    let id = ids.next("assert");
    steps.push(Step {
        id,
        inputs: vec![],
        outputs: vec![],
        params: OpParams::Assert(AssertParams { predicate, severity: None }),
        loc: Some(stmt.loc.clone()),
    });
    Ok(())
}

/// Parses, segments, recognizes, and lowers a full SAS script to IR.
/// Every table referenced as a `SET`/`DATA=`/`FROM` source that this script
/// never produces is treated as an implicit CSV datasource named after that
/// table, conventionally backed by `<name>.csv` under the caller's inputs
/// directory.
pub fn lower_sas_source(source: &str, file: &str) -> PResult<(IrDoc, Vec<sans_core::Diagnostic>)> {
    let statements = split_statements(source, file);
    let blocks = segment_blocks(&statements);

    let mut steps = Vec::new();
    let mut ids = IdGen { seq: 0 };
    let mut produced: BTreeSet<String> = BTreeSet::new();

    for block in &blocks {
        match block.kind {
            BlockKind::Data => {
                recognize_data_block(block, &mut ids, &mut steps)?;
            }
            BlockKind::Proc => {
                let lower = block.header.text.to_ascii_lowercase();
                if lower.starts_with("proc sort") {
                    recognize_proc_sort_block(block, &mut ids, &mut steps)?;
                } else if lower.starts_with("proc transpose") {
                    recognize_proc_transpose_block(block, &mut ids, &mut steps)?;
                } else if lower.starts_with("proc summary") || lower.starts_with("proc means") {
                    recognize_proc_summary_block(block, &mut ids, &mut steps)?;
                } else if lower.starts_with("proc format") {
                    recognize_proc_format_block(block, &mut ids, &mut steps)?;
                } else if lower.starts_with("proc sql") {
                    recognize_proc_sql_block(block, &mut ids, &mut steps)?;
                } else {
                    return Err(FrontendError::Parse(
                        format!("unsupported PROC: '{}'", block.header.text),
                        block.header.loc.clone(),
                    ));
                }
            }
            BlockKind::Other => {
                let lower = block.header.text.to_ascii_lowercase();
                if lower.starts_with("save ") {
                    parse_save_directive(&block.header, &mut ids, &mut steps)?;
                } else if lower.starts_with("assert ") {
                    parse_assert_directive(&block.header, &mut ids, &mut steps)?;
                } else if let Some(token) = find_forbidden_token(&block.header.text) {
                    return Err(FrontendError::ForbiddenToken { token: token.to_string(), loc: block.header.loc.clone() });
                } else {
                    return Err(FrontendError::Parse(
                        format!("unsupported top-level statement: '{}'", block.header.text),
                        block.header.loc.clone(),
                    ));
                }
            }
        }
        for out in &steps.last().map(|s| s.outputs.clone()).unwrap_or_default() {
            produced.insert(out.clone());
        }
    }
    // All outputs across all steps, not just the last — recompute cleanly.
    produced.clear();
    for s in &steps {
        for o in &s.outputs {
            produced.insert(o.clone());
        }
    }

    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for s in &steps {
        for i in &s.inputs {
            referenced.insert(i.clone());
        }
    }
    let implicit: Vec<String> = referenced.difference(&produced).cloned().collect();

    let mut ir = IrDoc::new();
    for name in &implicit {
        ir.datasources.insert(name.clone(), DatasourceDecl::csv(format!("{name}.csv")));
        let id = ids.next("datasource");
        ir.steps.push(Step {
            id,
            inputs: vec![],
            outputs: vec![ds_input(name)],
            params: OpParams::Datasource(DatasourceParams {
                name: name.clone(),
                kind: DatasourceKind::Csv,
                path: Some(format!("{name}.csv")),
                columns: None,
                inline_text: None,
                inline_sha256: None,
            }),
            loc: None,
        });
    }
    for step in &mut steps {
        for i in &mut step.inputs {
            if implicit.contains(i) {
                *i = ds_input(i);
            }
        }
    }
    ir.steps.extend(steps);
    Ok((ir, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_statements_on_semicolons_and_tracks_lines() {
        let stmts = split_statements("data out;\n  set in;\nrun;", "t.sas");
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].text, "data out");
        assert_eq!(stmts[1].text, "set in");
    }

    #[test]
    fn star_comment_is_skipped_only_at_line_start() {
        let stmts = split_statements("* this is a comment;\ndata out;\nset in;\nrun;", "t.sas");
        assert_eq!(stmts[0].text, "data out");
    }

    #[test]
    fn segments_data_block_terminated_by_run() {
        let stmts = split_statements("data out;\nset in;\nrun;\ndata out2;\nset out;\nrun;", "t.sas");
        let blocks = segment_blocks(&stmts);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, BlockKind::Data);
        assert_eq!(blocks[0].body.len(), 1);
    }

    #[test]
    fn forbidden_retain_token_is_rejected() {
        let src = "data out;\nset in;\nretain x 0;\nrun;\nsave out to \"out/o.csv\";";
        let result = lower_sas_source(src, "t.sas");
        assert!(matches!(result, Err(FrontendError::ForbiddenToken { ref token, .. }) if token == "retain"));
    }

    #[test]
    fn data_step_lowers_to_compute_then_filter_then_select() {
        let src = "data out;\nset in;\nc = a + b;\nif a > 0;\nkeep a c;\nrun;\nsave out to \"o/out.csv\";";
        let (ir, _) = lower_sas_source(src, "t.sas").unwrap();
        let ops: Vec<&str> = ir.steps.iter().map(|s| s.op()).collect();
        assert_eq!(ops, vec!["datasource", "compute", "filter", "select", "save"]);
        assert!(ir.datasources.contains_key("in"));
    }

    #[test]
    fn proc_sort_lowers_with_descending_key() {
        let src = "proc sort data=in out=sorted;\nby -a;\nrun;\nsave sorted to \"o/out.csv\";";
        let (ir, _) = lower_sas_source(src, "t.sas").unwrap();
        let sort_step = ir.steps.iter().find(|s| s.op() == "sort").unwrap();
        match &sort_step.params {
            OpParams::Sort(p) => assert_eq!(p.by, vec![SortKey { col: "a".to_string(), desc: true }]),
            _ => panic!("expected sort"),
        }
    }

    #[test]
    fn proc_sql_select_parses_aggregate_function() {
        let src = "proc sql;\ncreate table totals as select grp, sum(amount) as amount_sum from in group by grp;\nquit;\nsave totals to \"o/out.csv\";";
        let (ir, _) = lower_sas_source(src, "t.sas").unwrap();
        let step = ir.steps.iter().find(|s| s.op() == "sql_select").unwrap();
        match &step.params {
            OpParams::SqlSelect(p) => {
                assert_eq!(p.group_by, vec!["grp".to_string()]);
                assert_eq!(p.metrics[0].name, "amount_sum");
            }
            _ => panic!("expected sql_select"),
        }
    }

    #[test]
    fn leaked_macro_token_is_refused() {
        let src = "%let x = 1;\ndata out;\nset in;\nrun;";
        let result = lower_sas_source(src, "t.sas");
        assert!(matches!(result, Err(FrontendError::ForbiddenToken { ref token, .. }) if token == "%"));
    }
}
