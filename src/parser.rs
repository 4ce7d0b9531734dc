//! lambda 谓词与查询管道的语法分析器
//!
//! ## 解析流程图
//!
//! ```text
//! parse_pipeline()
//!   ├─ 解析数据源 (Identifier)
//!   └─ 循环: '.' Method '(' parse_argument()* ')'
//!                         ├─ Identifier "=>" → parse_lambda()
//!                         └─ 其他          → parse_expression()
//!
//! parse_lambda()
//!   ├─ 解析参数名 (Identifier)
//!   ├─ 期望 "=>"
//!   └─ parse_expression() (递归下降解析)
//!        └─ parse_or_else()          ||
//!             └─ parse_and_also()    &&
//!                  └─ parse_or()     |
//!                       └─ parse_and()           &
//!                            └─ parse_equality()       == !=
//!                                 └─ parse_relational()  < <= > >=
//!                                      └─ parse_unary()    ! -
//!                                           └─ parse_postfix()  .Member / .Method(..)
//!                                                └─ parse_primary()
//!                                                     ├─ 字面值
//!                                                     ├─ "(" → 分组表达式
//!                                                     ├─ "[" → 列表
//!                                                     └─ Identifier ["(" 参数 ")"]
//! ```
//!
//! ## 语法优先级（从高到低）
//!
//! 1. **成员访问 / 方法调用** `x.Shelf.City`, `ids.Contains(x.Id)`
//! 2. **一元操作** `!x.IsAvailable`, `-1`
//! 3. **关系比较** `<`, `<=`, `>`, `>=`
//! 4. **相等比较** `==`, `!=`
//! 5. **按位与 / 或** `&`, `|` (与 `&&` / `||` 语义相同, 仅保留写法)
//! 6. **AND操作** `&&`
//! 7. **OR操作** `||`
//!
//! ## 解析示例
//!
//! ```text
//! // 简单谓词
//! x => x.Id == 1 && x.Author == "Charlie"
//!
//! // 分组与嵌套成员
//! x => (x.Id == 1 || x.Shelf.Geo.Lat > 59.5) && !x.IsAvailable
//!
//! // 集合包含
//! x => ids.Contains(x.Id)
//!
//! // 管道
//! Book.Where(x => x.Author == "Scott").OrderBy(x => x.Id).Skip(1).Take(5)
//! ```

use crate::expr::{Argument, BinaryOp, Expr, Lambda, MemberPath, MethodInvocation, Pipeline};
use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};
use crate::value::Value;
use std::str::FromStr;
use thiserror::Error;

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

impl ParseError {
    fn new(message: String, span: Option<Span>) -> Self {
        Self { message, span }
    }

    fn at_position(message: String, span: Span) -> Self {
        Self { message, span: Some(span) }
    }
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回下一个 token，不推进位置
    fn peek_next(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position + 1)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    /// 期望特定类型的 token 并推进，否则返回错误
    fn expect(&mut self, expected: TokenKind) -> Result<&'a Token<'a>, ParseError> {
        match self.tokens.get(self.position) {
            Some(token) if std::mem::discriminant(&token.kind) == std::mem::discriminant(&expected) => {
                self.position += 1;
                Ok(token)
            }
            Some(token) => Err(ParseError::at_position(
                format!("Expected {:?}, found {:?}", expected, token.kind),
                token.span,
            )),
            None => Err(ParseError::new(
                format!("Expected {:?}, but reached end of input", expected),
                None,
            )),
        }
    }

    /// 检查当前 token 是否匹配给定类型
    fn match_token(&self, kind: &TokenKind) -> bool {
        if let Some(token) = self.peek() {
            std::mem::discriminant(&token.kind) == std::mem::discriminant(kind)
        } else {
            false
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        let token = self.expect(TokenKind::Identifier(""))?;
        match token.kind {
            TokenKind::Identifier(name) => Ok(name.to_string()),
            _ => Err(ParseError::at_position("Expected identifier".to_string(), token.span)),
        }
    }

    /// 确认所有 token 都已被消费
    fn expect_end(&self) -> Result<(), ParseError> {
        match self.peek() {
            Some(token) => Err(ParseError::at_position(
                format!("Unexpected token: {:?}", token.kind),
                token.span,
            )),
            None => Ok(()),
        }
    }

    /// 当前位置是否为 `ident =>`
    fn at_lambda(&self) -> bool {
        matches!(
            (self.peek().map(|t| &t.kind), self.peek_next().map(|t| &t.kind)),
            (Some(TokenKind::Identifier(_)), Some(TokenKind::Arrow))
        )
    }

    /// 解析完整的 lambda 输入: `x => body`
    pub fn parse_lambda(&mut self) -> Result<Lambda, ParseError> {
        let lambda = self.lambda()?;
        self.expect_end()?;
        Ok(lambda)
    }

    /// 解析完整的管道输入: `Source.Method(args)...`
    pub fn parse_pipeline(&mut self) -> Result<Pipeline, ParseError> {
        let source = self.expect_identifier()?;
        let mut steps = Vec::new();

        while self.match_token(&TokenKind::Dot) {
            self.advance(); // 消费 .
            let method = self.expect_identifier()?;
            self.expect(TokenKind::LParen)?;
            let args = self.comma_separated(TokenKind::RParen, Self::argument)?;
            steps.push(MethodInvocation::new(method, args));
        }

        self.expect_end()?;
        Ok(Pipeline { source, steps })
    }

    fn lambda(&mut self) -> Result<Lambda, ParseError> {
        let parameter = self.expect_identifier()?;
        self.expect(TokenKind::Arrow)?;
        let body = self.parse_expression()?;
        Ok(Lambda::new(parameter, body))
    }

    fn argument(&mut self) -> Result<Argument, ParseError> {
        if self.at_lambda() {
            self.lambda().map(Argument::Lambda)
        } else {
            self.parse_expression().map(Argument::Value)
        }
    }

    /// 解析逗号分隔的列表, 直到 `close` (会消费 `close`)
    /// 不允许尾随逗号
    fn comma_separated<T>(
        &mut self,
        close: TokenKind,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ParseError> {
        let mut items = Vec::new();
        if !self.match_token(&close) {
            loop {
                items.push(item(self)?);
                if self.match_token(&close) {
                    break;
                }
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    /// 解析表达式的入口点
    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_or_else()
    }

    /// 按优先级解析一层左结合的二元运算
    fn binary_level(
        &mut self,
        operator: impl Fn(&TokenKind) -> Option<BinaryOp>,
        next: impl Fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;
        while let Some(op) = self.peek().and_then(|t| operator(&t.kind)) {
            self.advance(); // 消费运算符
            let right = next(self)?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    /// 语法: `and_also (|| and_also)*`
    fn parse_or_else(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            |k| matches!(k, TokenKind::OrOr).then_some(BinaryOp::OrElse),
            Self::parse_and_also,
        )
    }

    /// 语法: `or (&& or)*`
    fn parse_and_also(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            |k| matches!(k, TokenKind::AndAnd).then_some(BinaryOp::AndAlso),
            Self::parse_or,
        )
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(|k| matches!(k, TokenKind::Pipe).then_some(BinaryOp::Or), Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            |k| matches!(k, TokenKind::Amp).then_some(BinaryOp::And),
            Self::parse_equality,
        )
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            |k| match k {
                TokenKind::EqEq => Some(BinaryOp::Equal),
                TokenKind::NotEq => Some(BinaryOp::NotEqual),
                _ => None,
            },
            Self::parse_relational,
        )
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            |k| match k {
                TokenKind::Lt => Some(BinaryOp::LessThan),
                TokenKind::Lte => Some(BinaryOp::LessThanOrEqual),
                TokenKind::Gt => Some(BinaryOp::GreaterThan),
                TokenKind::Gte => Some(BinaryOp::GreaterThanOrEqual),
                _ => None,
            },
            Self::parse_unary,
        )
    }

    /// 语法: `! unary | - number | postfix`
    /// 负号只用于数字字面值
    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.match_token(&TokenKind::Bang) {
            self.advance(); // 消费 !
            let inner = self.parse_unary()?; // 允许 !! 链式调用
            return Ok(!inner);
        }

        if self.match_token(&TokenKind::Minus) {
            let minus_span = self.advance().map(|t| t.span).unwrap_or_default();
            return match self.advance().map(|t| (&t.kind, t.span)) {
                Some((TokenKind::Int(n), _)) => Ok(Expr::lit(-*n)),
                Some((TokenKind::Float(f), _)) => Ok(Expr::lit(-*f)),
                Some((kind, span)) => Err(ParseError::at_position(
                    format!("Expected number after '-', found {:?}", kind),
                    span,
                )),
                None => Err(ParseError::at_position(
                    "Expected number after '-', but reached end of input".to_string(),
                    minus_span,
                )),
            };
        }

        self.parse_postfix()
    }

    /// 解析成员访问与方法调用链
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        while self.match_token(&TokenKind::Dot) {
            let dot_span = self.advance().map(|t| t.span).unwrap_or_default();
            let name = self.expect_identifier()?;

            if self.match_token(&TokenKind::LParen) {
                self.advance(); // 消费 (
                let args = self.comma_separated(TokenKind::RParen, Self::parse_expression)?;
                expr = Expr::call(Some(expr), name, args);
                continue;
            }

            expr = match expr {
                Expr::Variable(root) => Expr::Member(MemberPath::new(root, [name])),
                Expr::Member(mut path) => {
                    path.segments.push(name);
                    Expr::Member(path)
                }
                other => {
                    return Err(ParseError::at_position(
                        format!("Member access `.{}` is only supported on variables, not on `{}`", name, other),
                        dot_span,
                    ))
                }
            };
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.advance() else {
            return Err(ParseError::new("Unexpected end of input".to_string(), None));
        };
        let span = token.span;

        match &token.kind {
            TokenKind::True => Ok(Expr::lit(true)),
            TokenKind::False => Ok(Expr::lit(false)),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Int(n) => Ok(Expr::lit(*n)),
            TokenKind::Float(f) => Ok(Expr::lit(*f)),
            TokenKind::String(s) => unescape(s, span).map(Expr::lit),
            TokenKind::LParen => {
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                let items = self.comma_separated(TokenKind::RBracket, Self::parse_expression)?;
                Ok(Expr::List(items))
            }
            TokenKind::Identifier(name) => {
                let name = name.to_string();
                if !self.match_token(&TokenKind::LParen) {
                    return Ok(Expr::Variable(name));
                }
                self.advance(); // 消费 (
                let mut args = self.comma_separated(TokenKind::RParen, Self::parse_expression)?;
                // Convert(e) 是类型转换包装, 不是函数调用
                if name == "Convert" && args.len() == 1 {
                    if let Some(inner) = args.pop() {
                        return Ok(Expr::Convert(Box::new(inner)));
                    }
                }
                Ok(Expr::call(None, name, args))
            }
            other => Err(ParseError::at_position(
                format!("Unexpected token: {:?}", other),
                span,
            )),
        }
    }
}

/// 处理字符串中的反斜杠转义
fn unescape(raw: &str, span: Span) -> Result<String, ParseError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            other => {
                return Err(ParseError::at_position(
                    format!("Invalid escape sequence: \\{}", other.map(String::from).unwrap_or_default()),
                    span,
                ))
            }
        }
    }
    Ok(out)
}

fn tokenize(input: &str) -> Vec<Token<'_>> {
    Lexer::new(input).collect()
}

impl FromStr for Expr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s);
        let mut parser = Parser::new(&tokens);
        let expr = parser.parse_expression()?;
        parser.expect_end()?;
        Ok(expr)
    }
}

impl FromStr for Lambda {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s);
        Parser::new(&tokens).parse_lambda()
    }
}

impl FromStr for Pipeline {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s);
        Parser::new(&tokens).parse_pipeline()
    }
}
