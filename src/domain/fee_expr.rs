//! Commission expression compiler and evaluator.
//!
//! Recursive descent parser for user-supplied fee formulas. Compiled once at
//! startup; compile failures surface as configuration errors with character
//! offsets before any run begins.
//!
//! Grammar (lowest to highest precedence):
//!   ternary    := comparison ('?' ternary ':' ternary)?
//!   comparison := additive (('<'|'<='|'>'|'>='|'=='|'!=') additive)?
//!   additive   := multiplicative (('+'|'-') multiplicative)*
//!   multiply   := unary (('*'|'/'|'%') unary)*
//!   unary      := '-' unary | primary
//!   primary    := number | string | variable | func '(' args ')' | '(' ternary ')'
//!
//! Variables: quantity, price, total, symbol, side.
//! Functions: max, min, abs, sqrt, pow, ceil, floor, round.
//!
//! Comparisons yield 1.0 or 0.0; the ternary condition treats any non-zero
//! number as true. `symbol` and `side` are strings and only support equality.

use crate::domain::commission::FeeInput;
use crate::domain::error::{EngineError, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    Quantity,
    Price,
    Total,
    Symbol,
    Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Max,
    Min,
    Abs,
    Sqrt,
    Pow,
    Ceil,
    Floor,
    Round,
}

impl Function {
    fn arity(&self) -> usize {
        match self {
            Function::Max | Function::Min | Function::Pow => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Text(String),
    Var(Variable),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

/// Runtime value during evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Num(f64),
    Str(String),
}

/// A compiled commission expression.
#[derive(Debug, Clone)]
pub struct FeeExpr {
    source: String,
    ast: Expr,
}

impl FeeExpr {
    /// Compile an expression string. Errors carry the offending position.
    pub fn compile(source: &str) -> Result<FeeExpr, ParseError> {
        let mut parser = Parser::new(source);
        let ast = parser.parse_ternary()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(ParseError {
                message: format!("unexpected trailing input '{}'", parser.peek_word()),
                position: parser.pos,
            });
        }
        Ok(FeeExpr {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one order. A non-numeric or non-finite result rejects
    /// the order; it is never treated as a zero fee.
    pub fn evaluate(&self, input: &FeeInput) -> Result<f64, EngineError> {
        match eval(&self.ast, input)? {
            Value::Num(n) if n.is_finite() => Ok(n),
            Value::Num(n) => Err(EngineError::CommissionEval {
                symbol: input.symbol.to_string(),
                reason: format!("expression produced non-finite value {n}"),
            }),
            Value::Str(s) => Err(EngineError::CommissionEval {
                symbol: input.symbol.to_string(),
                reason: format!("expression produced string '{s}', expected a number"),
            }),
        }
    }
}

fn eval(expr: &Expr, input: &FeeInput) -> Result<Value, EngineError> {
    let non_numeric = |what: &str| EngineError::CommissionEval {
        symbol: input.symbol.to_string(),
        reason: format!("{what} requires numeric operands"),
    };

    match expr {
        Expr::Number(n) => Ok(Value::Num(*n)),
        Expr::Text(s) => Ok(Value::Str(s.clone())),
        Expr::Var(v) => Ok(match v {
            Variable::Quantity => Value::Num(input.quantity),
            Variable::Price => Value::Num(input.price),
            Variable::Total => Value::Num(input.quantity * input.price),
            Variable::Symbol => Value::Str(input.symbol.to_string()),
            Variable::Side => Value::Str(input.side.as_str().to_string()),
        }),
        Expr::Neg(inner) => match eval(inner, input)? {
            Value::Num(n) => Ok(Value::Num(-n)),
            Value::Str(_) => Err(non_numeric("negation")),
        },
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, input)?;
            let r = eval(rhs, input)?;
            match op {
                BinaryOp::Eq => Ok(Value::Num(bool_to_num(values_equal(&l, &r)))),
                BinaryOp::Ne => Ok(Value::Num(bool_to_num(!values_equal(&l, &r)))),
                _ => {
                    let (Value::Num(a), Value::Num(b)) = (l, r) else {
                        return Err(non_numeric("arithmetic"));
                    };
                    Ok(Value::Num(match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                        BinaryOp::Rem => a % b,
                        BinaryOp::Lt => bool_to_num(a < b),
                        BinaryOp::Le => bool_to_num(a <= b),
                        BinaryOp::Gt => bool_to_num(a > b),
                        BinaryOp::Ge => bool_to_num(a >= b),
                        BinaryOp::Eq | BinaryOp::Ne => unreachable!(),
                    }))
                }
            }
        }
        Expr::Ternary(cond, then, otherwise) => match eval(cond, input)? {
            Value::Num(n) => {
                if n != 0.0 {
                    eval(then, input)
                } else {
                    eval(otherwise, input)
                }
            }
            Value::Str(_) => Err(non_numeric("ternary condition")),
        },
        Expr::Call(func, args) => {
            let mut nums = Vec::with_capacity(args.len());
            for arg in args {
                match eval(arg, input)? {
                    Value::Num(n) => nums.push(n),
                    Value::Str(_) => return Err(non_numeric("function argument")),
                }
            }
            Ok(Value::Num(match func {
                Function::Max => nums[0].max(nums[1]),
                Function::Min => nums[0].min(nums[1]),
                Function::Abs => nums[0].abs(),
                Function::Sqrt => nums[0].sqrt(),
                Function::Pow => nums[0].powf(nums[1]),
                Function::Ceil => nums[0].ceil(),
                Function::Floor => nums[0].floor(),
                Function::Round => nums[0].round(),
            }))
        }
    }
}

fn bool_to_num(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Num(a), Value::Num(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        _ => false,
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn consume_str(&mut self, token: &str) -> bool {
        if self.remaining().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(ParseError {
                message: format!("expected '{}', found '{}'", expected, ch),
                position: self.pos,
            }),
            None => Err(ParseError {
                message: format!("expected '{}', found end of input", expected),
                position: self.pos,
            }),
        }
    }

    fn peek_word(&self) -> String {
        let mut word = String::new();
        for ch in self.remaining().chars() {
            if ch.is_alphanumeric() || ch == '_' {
                word.push(ch);
            } else {
                break;
            }
        }
        if word.is_empty() {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            word
        }
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_comparison()?;
        self.skip_whitespace();
        if self.peek() == Some('?') {
            self.advance();
            let then = self.parse_ternary()?;
            self.expect_char(':')?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_additive()?;
        self.skip_whitespace();

        // Two-character operators must be tried before their one-character prefixes.
        let op = if self.consume_str("<=") {
            Some(BinaryOp::Le)
        } else if self.consume_str(">=") {
            Some(BinaryOp::Ge)
        } else if self.consume_str("==") {
            Some(BinaryOp::Eq)
        } else if self.consume_str("!=") {
            Some(BinaryOp::Ne)
        } else if self.peek() == Some('<') {
            self.advance();
            Some(BinaryOp::Lt)
        } else if self.peek() == Some('>') {
            self.advance();
            Some(BinaryOp::Gt)
        } else {
            None
        };

        match op {
            Some(op) => {
                let rhs = self.parse_additive()?;
                Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
            }
            None => Ok(lhs),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        if self.peek() == Some('-') {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some('(') => {
                self.advance();
                let inner = self.parse_ternary()?;
                self.expect_char(')')?;
                Ok(inner)
            }
            Some('"') | Some('\'') => self.parse_string(),
            Some(ch) if ch.is_ascii_digit() || ch == '.' => self.parse_number(),
            Some(ch) if ch.is_alphabetic() || ch == '_' => self.parse_identifier(),
            Some(ch) => Err(ParseError {
                message: format!("unexpected character '{}'", ch),
                position: self.pos,
            }),
            None => Err(ParseError {
                message: "unexpected end of input".to_string(),
                position: self.pos,
            }),
        }
    }

    fn parse_number(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        let mut has_dot = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>().map(Expr::Number).map_err(|_| ParseError {
            message: format!("invalid number '{}'", text),
            position: start,
        })
    }

    fn parse_string(&mut self) -> Result<Expr, ParseError> {
        let quote = self.advance().unwrap_or('"');
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch == quote {
                let text = self.input[start..self.pos].to_string();
                self.advance();
                return Ok(Expr::Text(text));
            }
            self.advance();
        }
        Err(ParseError {
            message: "unterminated string literal".to_string(),
            position: start,
        })
    }

    fn parse_identifier(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let word = &self.input[start..self.pos];

        if let Some(var) = match word {
            "quantity" => Some(Variable::Quantity),
            "price" => Some(Variable::Price),
            "total" => Some(Variable::Total),
            "symbol" => Some(Variable::Symbol),
            "side" => Some(Variable::Side),
            _ => None,
        } {
            return Ok(Expr::Var(var));
        }

        let func = match word {
            "max" => Function::Max,
            "min" => Function::Min,
            "abs" => Function::Abs,
            "sqrt" => Function::Sqrt,
            "pow" => Function::Pow,
            "ceil" => Function::Ceil,
            "floor" => Function::Floor,
            "round" => Function::Round,
            _ => {
                return Err(ParseError {
                    message: format!("unknown identifier '{}'", word),
                    position: start,
                });
            }
        };

        self.expect_char('(')?;
        let mut args = vec![self.parse_ternary()?];
        loop {
            self.skip_whitespace();
            if self.peek() == Some(',') {
                self.advance();
                args.push(self.parse_ternary()?);
            } else {
                break;
            }
        }
        self.expect_char(')')?;

        if args.len() != func.arity() {
            return Err(ParseError {
                message: format!(
                    "{} takes {} argument(s), got {}",
                    word,
                    func.arity(),
                    args.len()
                ),
                position: start,
            });
        }

        Ok(Expr::Call(func, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Side;

    fn input(quantity: f64, price: f64) -> FeeInput<'static> {
        FeeInput {
            quantity,
            price,
            symbol: "AAPL",
            side: Side::Buy,
        }
    }

    fn eval_ok(source: &str, quantity: f64, price: f64) -> f64 {
        FeeExpr::compile(source)
            .unwrap()
            .evaluate(&input(quantity, price))
            .unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval_ok("1 + 2 * 3", 0.0, 0.0), 7.0);
        assert_eq!(eval_ok("(1 + 2) * 3", 0.0, 0.0), 9.0);
        assert_eq!(eval_ok("10 - 4 - 3", 0.0, 0.0), 3.0);
        assert_eq!(eval_ok("7 % 4", 0.0, 0.0), 3.0);
    }

    #[test]
    fn unary_minus() {
        assert_eq!(eval_ok("-5 + 10", 0.0, 0.0), 5.0);
        assert_eq!(eval_ok("--5", 0.0, 0.0), 5.0);
    }

    #[test]
    fn variables_bind_order_fields() {
        assert_eq!(eval_ok("quantity", 42.0, 0.0), 42.0);
        assert_eq!(eval_ok("price", 0.0, 9.5), 9.5);
        assert_eq!(eval_ok("total", 10.0, 2.5), 25.0);
    }

    #[test]
    fn tiered_fee_via_ternary() {
        // Interactive-broker style: max(1.0, 0.005 * quantity).
        let expr = FeeExpr::compile("0.005 * quantity < 1.0 ? 1.0 : 0.005 * quantity").unwrap();
        assert_eq!(expr.evaluate(&input(100.0, 0.0)).unwrap(), 1.0);
        assert_eq!(expr.evaluate(&input(1000.0, 0.0)).unwrap(), 5.0);
    }

    #[test]
    fn functions() {
        assert_eq!(eval_ok("max(2, 3)", 0.0, 0.0), 3.0);
        assert_eq!(eval_ok("min(2, 3)", 0.0, 0.0), 2.0);
        assert_eq!(eval_ok("abs(-4)", 0.0, 0.0), 4.0);
        assert_eq!(eval_ok("sqrt(16)", 0.0, 0.0), 4.0);
        assert_eq!(eval_ok("pow(2, 10)", 0.0, 0.0), 1024.0);
        assert_eq!(eval_ok("ceil(1.2)", 0.0, 0.0), 2.0);
        assert_eq!(eval_ok("floor(1.8)", 0.0, 0.0), 1.0);
        assert_eq!(eval_ok("round(1.5)", 0.0, 0.0), 2.0);
    }

    #[test]
    fn comparisons_yield_zero_or_one() {
        assert_eq!(eval_ok("3 > 2", 0.0, 0.0), 1.0);
        assert_eq!(eval_ok("3 < 2", 0.0, 0.0), 0.0);
        assert_eq!(eval_ok("2 >= 2", 0.0, 0.0), 1.0);
        assert_eq!(eval_ok("2 <= 1", 0.0, 0.0), 0.0);
        assert_eq!(eval_ok("2 == 2", 0.0, 0.0), 1.0);
        assert_eq!(eval_ok("2 != 2", 0.0, 0.0), 0.0);
    }

    #[test]
    fn string_equality_on_side() {
        let expr = FeeExpr::compile("side == \"BUY\" ? 1.5 : 0.5").unwrap();
        assert_eq!(expr.evaluate(&input(1.0, 1.0)).unwrap(), 1.5);

        let sell = FeeInput {
            quantity: 1.0,
            price: 1.0,
            symbol: "AAPL",
            side: Side::Sell,
        };
        assert_eq!(expr.evaluate(&sell).unwrap(), 0.5);
    }

    #[test]
    fn compile_error_unknown_identifier() {
        let err = FeeExpr::compile("quantity * spread").unwrap_err();
        assert!(err.message.contains("spread"));
        assert_eq!(err.position, 11);
    }

    #[test]
    fn compile_error_wrong_arity() {
        let err = FeeExpr::compile("max(1)").unwrap_err();
        assert!(err.message.contains("2 argument(s)"));
    }

    #[test]
    fn compile_error_trailing_input() {
        let err = FeeExpr::compile("1 + 2 extra").unwrap_err();
        assert!(err.message.contains("trailing"));
    }

    #[test]
    fn compile_error_unterminated_string() {
        let err = FeeExpr::compile("symbol == \"AAPL").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn string_result_rejects_order() {
        let expr = FeeExpr::compile("symbol").unwrap();
        let err = expr.evaluate(&input(1.0, 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::CommissionEval { .. }));
    }

    #[test]
    fn non_finite_result_rejects_order() {
        let expr = FeeExpr::compile("1 / 0 - 1 / 0").unwrap();
        let err = expr.evaluate(&input(1.0, 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::CommissionEval { .. }));
    }
}
