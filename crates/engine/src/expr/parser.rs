// Arithmetic parser - converts substituted formula text into an AST
// Supports: decimal numbers, + - * / with unary signs, parentheses, and the
// allow-listed functions in `functions.rs`. Nothing else tokenizes.

use super::functions::Function;
use super::EvalLimits;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Function {
        func: Function,
        args: Vec<Expr>,
    },
    BinaryOp {
        op: Op,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Func(Function),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

/// Parse with default limits.
pub fn parse(text: &str) -> EngineResult<Expr> {
    parse_with_limits(text, &EvalLimits::default())
}

pub fn parse_with_limits(text: &str, limits: &EvalLimits) -> EngineResult<Expr> {
    if text.len() > limits.max_length {
        return Err(EngineError::UnsafeExpression(format!(
            "expression longer than {} bytes",
            limits.max_length
        )));
    }
    let depth = check_balanced(text)?;
    if depth > limits.max_nesting {
        return Err(EngineError::UnsafeExpression(format!(
            "nesting deeper than {}",
            limits.max_nesting
        )));
    }

    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(EngineError::Evaluation("empty expression".to_string()));
    }
    let (expr, pos) = parse_add_sub(&tokens, 0)?;
    if pos != tokens.len() {
        return Err(EngineError::Evaluation(format!(
            "unexpected token at position {}",
            pos
        )));
    }
    Ok(expr)
}

/// Parenthesis balance check. Returns the maximum nesting depth.
pub fn check_balanced(text: &str) -> EngineResult<usize> {
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' => {
                depth = depth.checked_sub(1).ok_or(EngineError::UnbalancedExpression)?;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(EngineError::UnbalancedExpression);
    }
    Ok(max_depth)
}

pub(crate) fn tokenize(input: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => { chars.next(); }
            '+' => { tokens.push(Token::Plus); chars.next(); }
            '-' => { tokens.push(Token::Minus); chars.next(); }
            '*' => { tokens.push(Token::Star); chars.next(); }
            '/' => { tokens.push(Token::Slash); chars.next(); }
            '(' => { tokens.push(Token::LParen); chars.next(); }
            ')' => { tokens.push(Token::RParen); chars.next(); }
            ',' => { tokens.push(Token::Comma); chars.next(); }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = num.parse().map_err(|_| {
                    EngineError::UnsafeExpression(format!("malformed number '{}'", num))
                })?;
                tokens.push(Token::Number(value));
            }
            'a'..='z' | 'A'..='Z' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match Function::from_name(&ident) {
                    Some(func) => tokens.push(Token::Func(func)),
                    None => {
                        return Err(EngineError::UnsafeExpression(format!(
                            "unknown identifier '{}'",
                            ident
                        )))
                    }
                }
            }
            _ => {
                return Err(EngineError::UnsafeExpression(format!(
                    "unexpected character '{}'",
                    c.escape_default()
                )))
            }
        }
    }

    Ok(tokens)
}

fn parse_add_sub(tokens: &[Token], pos: usize) -> EngineResult<(Expr, usize)> {
    let (mut left, mut pos) = parse_mul_div(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Plus => Op::Add,
            Token::Minus => Op::Sub,
            _ => break,
        };
        let (right, new_pos) = parse_mul_div(tokens, pos + 1)?;
        left = Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = new_pos;
    }

    Ok((left, pos))
}

fn parse_mul_div(tokens: &[Token], pos: usize) -> EngineResult<(Expr, usize)> {
    let (mut left, mut pos) = parse_unary(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Star => Op::Mul,
            Token::Slash => Op::Div,
            _ => break,
        };
        let (right, new_pos) = parse_unary(tokens, pos + 1)?;
        left = Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = new_pos;
    }

    Ok((left, pos))
}

// Leading signs are folded iteratively; a negation becomes (0 - expr).
fn parse_unary(tokens: &[Token], pos: usize) -> EngineResult<(Expr, usize)> {
    let mut pos = pos;
    let mut negate = false;
    while let Some(tok) = tokens.get(pos) {
        match tok {
            Token::Minus => negate = !negate,
            Token::Plus => {}
            _ => break,
        }
        pos += 1;
    }

    let (expr, pos) = parse_primary(tokens, pos)?;
    if negate {
        let negated = Expr::BinaryOp {
            op: Op::Sub,
            left: Box::new(Expr::Number(0.0)),
            right: Box::new(expr),
        };
        return Ok((negated, pos));
    }
    Ok((expr, pos))
}

fn parse_primary(tokens: &[Token], pos: usize) -> EngineResult<(Expr, usize)> {
    let Some(token) = tokens.get(pos) else {
        return Err(EngineError::Evaluation("unexpected end of expression".to_string()));
    };

    match token {
        Token::Number(n) => Ok((Expr::Number(*n), pos + 1)),
        Token::LParen => {
            let (expr, next) = parse_add_sub(tokens, pos + 1)?;
            match tokens.get(next) {
                Some(Token::RParen) => Ok((expr, next + 1)),
                _ => Err(EngineError::UnbalancedExpression),
            }
        }
        Token::Func(func) => {
            if tokens.get(pos + 1) != Some(&Token::LParen) {
                return Err(EngineError::UnsafeExpression(format!(
                    "function '{}' must be called",
                    func.name()
                )));
            }
            let (args, next) = parse_function_args(tokens, pos + 2)?;
            Ok((Expr::Function { func: *func, args }, next))
        }
        _ => Err(EngineError::Evaluation(format!(
            "unexpected token at position {}",
            pos
        ))),
    }
}

fn parse_function_args(tokens: &[Token], pos: usize) -> EngineResult<(Vec<Expr>, usize)> {
    let mut args = Vec::new();
    if tokens.get(pos) == Some(&Token::RParen) {
        return Ok((args, pos + 1));
    }

    let mut pos = pos;
    loop {
        let (arg, next) = parse_add_sub(tokens, pos)?;
        args.push(arg);
        match tokens.get(next) {
            Some(Token::Comma) => pos = next + 1,
            Some(Token::RParen) => return Ok((args, next + 1)),
            Some(_) => {
                return Err(EngineError::Evaluation(
                    "expected comma or closing parenthesis".to_string(),
                ))
            }
            None => return Err(EngineError::UnbalancedExpression),
        }
    }
}
