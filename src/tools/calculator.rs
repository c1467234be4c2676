//! 计算器工具：递归下降求值，不执行任意代码
//!
//! 语法：`+ - * / %`、`^` 或 `**`（乘方，右结合）、括号、一元负号，
//! 以及函数 `abs round sqrt min max pow`。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{ParamType, Tool, ToolContext, ToolContract, ToolError, ToolOutput, ToolParameter};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new(
            "calculator",
            "Performs mathematical calculations. Supports +, -, *, /, %, exponentiation \
             (^ or **), parentheses and abs/round/sqrt/min/max/pow. Example: '(10 + 5) ^ 2'",
        )
        .parameter(ToolParameter::required(
            "expression",
            ParamType::String,
            "The mathematical expression to evaluate",
        ))
    }

    async fn invoke(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let expression = input
            .get("expression")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if expression.trim().is_empty() {
            return Err(ToolError::Fatal("Missing required parameter: expression".into()));
        }
        let value = evaluate(expression).map_err(ToolError::Fatal)?;
        let text = format_number(value);
        Ok(ToolOutput::new(
            json!({ "expression": expression, "result": value }),
            text,
        ))
    }
}

/// 整数结果不带小数点
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// 表达式最大长度（字符）
const MAX_EXPRESSION_CHARS: usize = 4096;
/// 括号、一元运算与乘方的最大嵌套层数
const MAX_DEPTH: usize = 64;

pub fn evaluate(expression: &str) -> Result<f64, String> {
    if expression.chars().count() > MAX_EXPRESSION_CHARS {
        return Err(format!(
            "Expression too long: more than {MAX_EXPRESSION_CHARS} characters"
        ));
    }
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(token) = parser.peek() {
        return Err(format!("Invalid expression syntax: unexpected '{token:?}'"));
    }
    if !value.is_finite() {
        return Err("Calculation error: result is not a finite number".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid expression syntax: bad number '{literal}'"))?;
                tokens.push(Token::Num(n));
            }
            'a'..='z' | 'A'..='Z' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Op('^'));
                i += 2;
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => return Err(format!("Invalid expression syntax: unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(format!(
                "Invalid expression syntax: expected {expected:?}, found {other:?}"
            )),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            if op != '*' && rhs == 0.0 {
                return Err("Division by zero".into());
            }
            value = match op {
                '*' => value * rhs,
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    // 所有递归路径都经过 unary，在这里计数
    fn unary(&mut self) -> Result<f64, String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!(
                "Expression nested too deeply: more than {MAX_DEPTH} levels"
            ));
        }
        let value = self.signed();
        self.depth -= 1;
        value
    }

    // unary := '-' unary | '+' unary | power
    fn signed(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := primary ('^' unary)?
    fn power(&mut self) -> Result<f64, String> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                self.expect(Token::LParen)?;
                let mut args = vec![self.expr()?];
                while let Some(Token::Comma) = self.peek() {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                call(&name, &args)
            }
            other => Err(format!("Invalid expression syntax: unexpected {other:?}")),
        }
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, String> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("{name}() takes {n} argument(s), got {}", args.len()))
        }
    };
    match name {
        "abs" => arity(1).map(|_| args[0].abs()),
        "round" => arity(1).map(|_| args[0].round()),
        "sqrt" => {
            arity(1)?;
            if args[0] < 0.0 {
                return Err("Calculation error: sqrt of negative number".into());
            }
            Ok(args[0].sqrt())
        }
        "pow" => arity(2).map(|_| args[0].powf(args[1])),
        "min" => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        other => Err(format!("Calculation error: unknown function '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_and_parens() {
        assert_eq!(evaluate("2 + 2 * 3").unwrap(), 8.0);
        assert_eq!(evaluate("(10 + 5) ** 2").unwrap(), 225.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("7 % 4 - -1").unwrap(), 4.0);
    }

    #[test]
    fn test_functions() {
        assert_eq!(evaluate("max(1, 9, 3) + abs(-2)").unwrap(), 11.0);
        assert_eq!(evaluate("sqrt(16) * pow(2, 3)").unwrap(), 32.0);
        assert!(evaluate("nope(1)").is_err());
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate("1 / 0").unwrap_err(), "Division by zero");
        assert!(evaluate("1 +").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("__import__('os')").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let ok = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(evaluate(&ok).unwrap(), 1.0);

        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(evaluate(&deep).unwrap_err().contains("nested too deeply"));
        assert!(evaluate(&"-".repeat(500)).unwrap_err().contains("nested too deeply"));
        assert!(evaluate(&vec!["2"; 300].join("^")).is_err());
    }

    #[test]
    fn test_overlong_expression_rejected() {
        let long = vec!["1"; 3000].join("+");
        assert!(evaluate(&long).unwrap_err().contains("too long"));
        assert_eq!(evaluate(&vec!["1"; 1000].join("+")).unwrap(), 1000.0);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(8.0), "8");
        assert_eq!(format_number(2.5), "2.5");
    }
}
