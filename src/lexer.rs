//! lambda 表达式与查询管道的词法分析器

use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    /// 输入字符串中的当前位置（字节索引）
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, position: 0 }
    }

    /// 返回当前位置的字符，不推进位置
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// 返回下一个位置的字符，不推进位置
    fn peek_next(&self) -> Option<char> {
        self.input[self.position..].chars().nth(1)
    }

    /// 推进位置一个字符并返回该字符
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    /// 如果下一个字符是 `expected` 则消费它
    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// 跳过空白字符
    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn token(&self, kind: TokenKind<'a>, start: usize) -> Token<'a> {
        Token {
            kind,
            span: Span::new(start, self.position),
        }
    }

    /// 读取数字字面量, 带小数点的读成浮点数
    fn read_number(&mut self, start: usize) -> Token<'a> {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        // `1.Equals(..)` 这种不是小数
        let is_float = self.peek() == Some('.') && matches!(self.peek_next(), Some(c) if c.is_ascii_digit());
        if is_float {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }

        let text = &self.input[start..self.position];
        let kind = if is_float {
            text.parse::<f64>().map(TokenKind::Float).unwrap_or(TokenKind::Illegal)
        } else {
            // 超出 i64 范围时返回 Illegal
            text.parse::<i64>().map(TokenKind::Int).unwrap_or(TokenKind::Illegal)
        };
        self.token(kind, start)
    }

    /// 读取双引号包围的字符串字面量
    /// 注意：开始的引号已经被调用者消费; 反斜杠转义原样保留, 由 parser 处理
    fn read_string(&mut self, start: usize) -> Token<'a> {
        let content_start = self.position;
        let mut escaped = false;
        while let Some(c) = self.peek() {
            if c == '"' && !escaped {
                break;
            }
            escaped = c == '\\' && !escaped;
            self.bump();
        }
        let content_end = self.position;
        if !self.eat('"') {
            // 没有结束引号
            return self.token(TokenKind::Illegal, start);
        }

        let content = &self.input[content_start..content_end];
        self.token(TokenKind::String(content), start)
    }

    /// 读取标识符或关键字
    /// 标识符可以包含字母、数字和下划线
    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.input[start..self.position];
        self.token(match_keyword(literal), start)
    }
}

fn match_keyword(s: &str) -> TokenKind<'_> {
    match s {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        _ => TokenKind::Identifier(s),
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        let start = self.position;

        let Some(c) = self.bump() else {
            return None; // 到达输入末尾
        };

        let token = match c {
            '=' if self.eat('>') => self.token(TokenKind::Arrow, start),
            '=' if self.eat('=') => self.token(TokenKind::EqEq, start),
            '!' if self.eat('=') => self.token(TokenKind::NotEq, start),
            '!' => self.token(TokenKind::Bang, start),
            '<' if self.eat('=') => self.token(TokenKind::Lte, start),
            '<' => self.token(TokenKind::Lt, start),
            '>' if self.eat('=') => self.token(TokenKind::Gte, start),
            '>' => self.token(TokenKind::Gt, start),
            '&' if self.eat('&') => self.token(TokenKind::AndAnd, start),
            '&' => self.token(TokenKind::Amp, start),
            '|' if self.eat('|') => self.token(TokenKind::OrOr, start),
            '|' => self.token(TokenKind::Pipe, start),
            '.' => self.token(TokenKind::Dot, start),
            ',' => self.token(TokenKind::Comma, start),
            '(' => self.token(TokenKind::LParen, start),
            ')' => self.token(TokenKind::RParen, start),
            '[' => self.token(TokenKind::LBracket, start),
            ']' => self.token(TokenKind::RBracket, start),
            '-' => self.token(TokenKind::Minus, start),
            '"' => self.read_string(start),
            c if c.is_ascii_digit() => self.read_number(start),
            c if c.is_alphabetic() || c == '_' => self.read_identifier(start),
            _ => self.token(TokenKind::Illegal, start),
        };
        Some(token)
    }
}
