//! Recursive-descent parser: token stream → AST.
//!
//! Expressions use precedence climbing over the table in [`crate::ast`].
//! The parser performs no name resolution; identifiers stay symbolic until
//! code generation.

use crate::ast::{
    Ast, BinOp, Block, Expr, FuncBody, FuncName, Stat, TableItem, UnOp, UNARY_PRIORITY,
};
use crate::lexer::Tokens;
use crate::token::{SpannedToken, Token};
use lunac_core::limits::MAX_NESTING;
use lunac_core::string::StringId;
use std::fmt;

/// Syntax error.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parse a token stream into the AST of one chunk.
pub fn parse(tokens: Tokens) -> Result<Ast, ParseError> {
    let mut parser = Parser::new(tokens.tokens);
    // The main chunk is a vararg function.
    parser.func_vararg.push(true);
    let block = parser.block()?;
    parser.expect(&Token::Eof)?;
    Ok(Ast {
        block,
        strings: tokens.strings,
    })
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    /// Recursion depth across expressions and nested blocks.
    depth: usize,
    /// Vararg-ness of each enclosing function, innermost last.
    func_vararg: Vec<bool>,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>) -> Self {
        Parser {
            tokens,
            pos: 0,
            depth: 0,
            func_vararg: Vec::new(),
        }
    }

    // ---- Token helpers ----

    fn current(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].span.line
    }

    fn peek_next(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|st| &st.token)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.current() == expected
    }

    fn test_next(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        if self.check(expected) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("'{expected}' expected near '{}'", self.current())))
        }
    }

    /// Expect a closer token, pointing back at the opening line when the
    /// construct spans lines ("'end' expected (to close 'if' at line 3)").
    fn expect_match(
        &mut self,
        expected: &Token,
        opener: &str,
        opener_line: u32,
    ) -> Result<(), ParseError> {
        if self.check(expected) {
            self.advance();
            Ok(())
        } else if self.line() == opener_line {
            Err(self.error(format!("'{expected}' expected near '{}'", self.current())))
        } else {
            Err(self.error(format!(
                "'{expected}' expected (to close '{opener}' at line {opener_line}) near '{}'",
                self.current()
            )))
        }
    }

    fn expect_name(&mut self) -> Result<StringId, ParseError> {
        match self.current() {
            Token::Name(id) => {
                let id = *id;
                self.advance();
                Ok(id)
            }
            other => Err(self.error(format!("<name> expected near '{other}'"))),
        }
    }

    fn error(&self, msg: impl Into<String>) -> ParseError {
        ParseError {
            message: msg.into(),
            line: self.line(),
        }
    }

    fn enter_level(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    // ---- Blocks and statements ----

    fn block_follow(&self) -> bool {
        matches!(
            self.current(),
            Token::End | Token::Else | Token::ElseIf | Token::Until | Token::Eof
        )
    }

    fn block(&mut self) -> Result<Block, ParseError> {
        self.enter_level()?;
        let mut stats = Vec::new();
        while !self.block_follow() {
            if self.check(&Token::Semi) {
                self.advance();
                continue;
            }
            let is_last = matches!(self.current(), Token::Return | Token::Break);
            stats.push(self.statement()?);
            if is_last {
                // return/break close the block
                break;
            }
        }
        self.leave_level();
        Ok(Block { stats })
    }

    fn statement(&mut self) -> Result<Stat, ParseError> {
        match self.current() {
            Token::If => self.if_stat(),
            Token::While => self.while_stat(),
            Token::Do => self.do_stat(),
            Token::For => self.for_stat(),
            Token::Repeat => self.repeat_stat(),
            Token::Function => self.function_stat(),
            Token::Local => self.local_stat(),
            Token::Return => self.return_stat(),
            Token::Break => {
                let line = self.line();
                self.advance();
                Ok(Stat::Break { line })
            }
            _ => self.expr_stat(),
        }
    }

    /// `if exp then block {elseif exp then block} [else block] end`
    fn if_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'if'
        let mut arms = Vec::new();

        let cond = self.expression()?;
        self.expect(&Token::Then)?;
        arms.push((cond, self.block()?));

        while self.check(&Token::ElseIf) {
            self.advance();
            let cond = self.expression()?;
            self.expect(&Token::Then)?;
            arms.push((cond, self.block()?));
        }

        let else_body = if self.test_next(&Token::Else) {
            Some(self.block()?)
        } else {
            None
        };

        self.expect_match(&Token::End, "if", line)?;
        Ok(Stat::If {
            arms,
            else_body,
            line,
        })
    }

    /// `while exp do block end`
    fn while_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'while'
        let cond = self.expression()?;
        self.expect(&Token::Do)?;
        let body = self.block()?;
        self.expect_match(&Token::End, "while", line)?;
        Ok(Stat::While { cond, body, line })
    }

    /// `do block end`
    fn do_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'do'
        let body = self.block()?;
        self.expect_match(&Token::End, "do", line)?;
        Ok(Stat::Do { body, line })
    }

    /// `repeat block until exp`
    fn repeat_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'repeat'
        let body = self.block()?;
        self.expect_match(&Token::Until, "repeat", line)?;
        // Locals of the body stay in scope for the condition.
        let cond = self.expression()?;
        Ok(Stat::Repeat { body, cond, line })
    }

    /// `for name '=' exp ',' exp [',' exp] do block end`  (numeric)
    /// `for namelist in explist do block end`  (generic)
    fn for_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'for'
        let first = self.expect_name()?;

        match self.current() {
            Token::Assign => {
                self.advance();
                let start = self.expression()?;
                self.expect(&Token::Comma)?;
                let limit = self.expression()?;
                let step = if self.test_next(&Token::Comma) {
                    Some(self.expression()?)
                } else {
                    None
                };
                self.expect(&Token::Do)?;
                let body = self.block()?;
                self.expect_match(&Token::End, "for", line)?;
                Ok(Stat::NumericFor {
                    var: first,
                    start,
                    limit,
                    step,
                    body,
                    line,
                })
            }
            Token::Comma | Token::In => {
                let mut names = vec![first];
                while self.test_next(&Token::Comma) {
                    names.push(self.expect_name()?);
                }
                self.expect(&Token::In)?;
                let mut exprs = vec![self.expression()?];
                while self.test_next(&Token::Comma) {
                    exprs.push(self.expression()?);
                }
                self.expect(&Token::Do)?;
                let body = self.block()?;
                self.expect_match(&Token::End, "for", line)?;
                Ok(Stat::GenericFor {
                    names,
                    exprs,
                    body,
                    line,
                })
            }
            other => Err(self.error(format!("'=' or 'in' expected near '{other}'"))),
        }
    }

    /// `function name {'.' name} [':' name] funcbody`
    fn function_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'function'
        let base = self.expect_name()?;
        let mut fields = Vec::new();
        let mut method = None;
        loop {
            if self.test_next(&Token::Dot) {
                fields.push(self.expect_name()?);
            } else if self.test_next(&Token::Colon) {
                method = Some(self.expect_name()?);
                break;
            } else {
                break;
            }
        }
        let body = self.func_body(line)?;
        Ok(Stat::Function {
            name: FuncName {
                base,
                fields,
                method,
            },
            body,
            line,
        })
    }

    /// `local function name funcbody` | `local namelist ['=' explist]`
    fn local_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'local'

        if self.test_next(&Token::Function) {
            let name = self.expect_name()?;
            let body = self.func_body(line)?;
            return Ok(Stat::LocalFunction { name, body, line });
        }

        let mut names = vec![self.expect_name()?];
        while self.test_next(&Token::Comma) {
            names.push(self.expect_name()?);
        }
        let values = if self.test_next(&Token::Assign) {
            self.expression_list()?
        } else {
            Vec::new()
        };
        Ok(Stat::Local {
            names,
            values,
            line,
        })
    }

    /// `return [explist] [';']`
    fn return_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        self.advance(); // 'return'
        let exprs = if self.block_follow() || self.check(&Token::Semi) {
            Vec::new()
        } else {
            self.expression_list()?
        };
        self.test_next(&Token::Semi);
        Ok(Stat::Return { exprs, line })
    }

    /// Expression statement: either an assignment or a call.
    fn expr_stat(&mut self) -> Result<Stat, ParseError> {
        let line = self.line();
        let first = self.suffixed_expression()?;

        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.test_next(&Token::Comma) {
                targets.push(self.suffixed_expression()?);
            }
            for t in &targets {
                if !matches!(t, Expr::Name { .. } | Expr::Index { .. } | Expr::Field { .. }) {
                    return Err(ParseError {
                        message: "cannot assign to this expression".into(),
                        line: t.line(),
                    });
                }
            }
            self.expect(&Token::Assign)?;
            let values = self.expression_list()?;
            return Ok(Stat::Assign {
                targets,
                values,
                line,
            });
        }

        match first {
            call @ Expr::Call { .. } => Ok(Stat::Call { call, line }),
            _ => Err(self.error("syntax error: expression is not a statement")),
        }
    }

    // ---- Expressions ----

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.enter_level()?;
        let e = self.sub_expression(0);
        self.leave_level();
        e
    }

    fn expression_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = vec![self.expression()?];
        while self.test_next(&Token::Comma) {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    /// Precedence-climbing expression parser.
    fn sub_expression(&mut self, limit: u8) -> Result<Expr, ParseError> {
        self.enter_level()?;
        let line = self.line();
        let mut expr = if let Some(unop) = self.check_unary_op() {
            self.advance();
            let operand = self.sub_expression(UNARY_PRIORITY)?;
            Expr::Unary {
                op: unop,
                operand: Box::new(operand),
                line,
            }
        } else {
            self.simple_expression()?
        };

        while let Some(binop) = self.check_binary_op() {
            let (left_prec, right_prec) = binop.priority();
            if left_prec <= limit {
                break;
            }
            let op_line = self.line();
            self.advance();
            let rhs = self.sub_expression(right_prec)?;
            expr = Expr::Binary {
                op: binop,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                line: op_line,
            };
        }

        self.leave_level();
        Ok(expr)
    }

    fn check_unary_op(&self) -> Option<UnOp> {
        match self.current() {
            Token::Minus => Some(UnOp::Neg),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        }
    }

    fn check_binary_op(&self) -> Option<BinOp> {
        match self.current() {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::Percent => Some(BinOp::Mod),
            Token::Caret => Some(BinOp::Pow),
            Token::DotDot => Some(BinOp::Concat),
            Token::Equal => Some(BinOp::Eq),
            Token::NotEqual => Some(BinOp::NotEq),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::LtEq),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::GtEq),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        }
    }

    fn simple_expression(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.current().clone() {
            Token::Number(value) => {
                self.advance();
                Ok(Expr::Number { value, line })
            }
            Token::Str(value) => {
                self.advance();
                Ok(Expr::Str { value, line })
            }
            Token::Nil => {
                self.advance();
                Ok(Expr::Nil { line })
            }
            Token::True => {
                self.advance();
                Ok(Expr::True { line })
            }
            Token::False => {
                self.advance();
                Ok(Expr::False { line })
            }
            Token::DotDotDot => {
                if !self.func_vararg.last().copied().unwrap_or(false) {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                self.advance();
                Ok(Expr::Vararg { line })
            }
            Token::LBrace => self.table_constructor(),
            Token::Function => {
                self.advance();
                let body = self.func_body(line)?;
                Ok(Expr::Function {
                    body: Box::new(body),
                    line,
                })
            }
            _ => self.suffixed_expression(),
        }
    }

    /// Name or parenthesized expression.
    fn primary_expression(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.current().clone() {
            Token::Name(name) => {
                self.advance();
                Ok(Expr::Name { name, line })
            }
            Token::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                // Parentheses clip a multi-value producer to one value;
                // for anything else they are transparent.
                if inner.is_multi_value() {
                    Ok(Expr::Paren {
                        inner: Box::new(inner),
                        line,
                    })
                } else {
                    Ok(inner)
                }
            }
            other => Err(self.error(format!("unexpected symbol near '{other}'"))),
        }
    }

    /// Primary expression with suffix chain: `.name [expr] :name(args) (args) {t} "s"`.
    fn suffixed_expression(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary_expression()?;
        loop {
            let line = self.line();
            match self.current().clone() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    expr = Expr::Field {
                        object: Box::new(expr),
                        name,
                        line,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        key: Box::new(key),
                        line,
                    };
                }
                Token::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        method: Some(method),
                        args,
                        line,
                    };
                }
                Token::LParen | Token::LBrace | Token::Str(_) => {
                    let args = self.call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        method: None,
                        args,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Call arguments: `(explist)` | table constructor | string literal.
    fn call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let line = self.line();
        match self.current().clone() {
            Token::LParen => {
                self.advance();
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                self.expect_match(&Token::RParen, "(", line)?;
                Ok(args)
            }
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            Token::Str(value) => {
                self.advance();
                Ok(vec![Expr::Str { value, line }])
            }
            other => Err(self.error(format!("function arguments expected near '{other}'"))),
        }
    }

    /// `'(' [parlist] ')' block 'end'` — the `function` keyword is consumed.
    fn func_body(&mut self, line: u32) -> Result<FuncBody, ParseError> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                match self.current().clone() {
                    Token::Name(name) => {
                        self.advance();
                        params.push(name);
                    }
                    Token::DotDotDot => {
                        self.advance();
                        is_vararg = true;
                        break;
                    }
                    other => {
                        return Err(self.error(format!("<name> expected near '{other}'")));
                    }
                }
                if !self.test_next(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        self.func_vararg.push(is_vararg);
        let body = self.block()?;
        self.func_vararg.pop();

        let end_line = self.line();
        self.expect_match(&Token::End, "function", line)?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
            end_line,
        })
    }

    /// `'{' [field {sep field} [sep]] '}'` where sep is ',' or ';'.
    fn table_constructor(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        self.expect(&Token::LBrace)?;
        let mut items = Vec::new();

        while !self.check(&Token::RBrace) {
            match self.current().clone() {
                Token::LBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    let value = self.expression()?;
                    items.push(TableItem::Keyed { key, value });
                }
                Token::Name(name) if self.peek_next() == Some(&Token::Assign) => {
                    self.advance(); // name
                    self.advance(); // '='
                    let value = self.expression()?;
                    items.push(TableItem::Named { name, value });
                }
                _ => {
                    items.push(TableItem::Array(self.expression()?));
                }
            }
            if !self.test_next(&Token::Comma) && !self.test_next(&Token::Semi) {
                break;
            }
        }

        self.expect_match(&Token::RBrace, "{", line)?;
        Ok(Expr::Table { items, line })
    }
}
