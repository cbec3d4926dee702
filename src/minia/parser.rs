use super::ast::{Assignment, BinaryOp, Expr};
use super::error::ParseError;
use super::lexer::{Lexer, Token};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParseError> {
        let tokens = Lexer::new(input).tokenize()?;
        Ok(Self { tokens, pos: 0 })
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        let token = self.advance();
        if std::mem::discriminant(&token) == std::mem::discriminant(&expected) {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: format!("{:?}", expected),
                found: format!("{:?}", token),
            })
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.advance() {
            Token::Ident(s) => Ok(s),
            t => Err(ParseError::UnexpectedToken {
                expected: "identifier".to_string(),
                found: format!("{:?}", t),
            }),
        }
    }

    /// Parses `name = expr;` lines until end of input.
    pub fn parse(&mut self) -> Result<Vec<Assignment>, ParseError> {
        let mut out = Vec::new();
        while !matches!(self.peek(), Token::Eof) {
            out.push(self.parse_assignment()?);
        }
        Ok(out)
    }

    fn parse_assignment(&mut self) -> Result<Assignment, ParseError> {
        let name = self.expect_ident()?;
        self.expect(Token::Eq)?;
        let expr = self.parse_expr()?;
        self.expect(Token::Semicolon)?;
        Ok(Assignment { name, expr })
    }

    // expr := term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    // term := factor (('*' | '/') factor)*
    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_factor()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    // factor := '-' factor | primary
    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Token::Minus) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.parse_factor()?)));
        }
        self.parse_primary()
    }

    // primary := int | float | string | ident '(' args ')' | ident | '(' expr ')'
    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::IntLit(n)),
            Token::Float(f) => Ok(Expr::FloatLit(f)),
            Token::Str(s) => Ok(Expr::StrLit(s)),
            Token::Ident(name) => {
                if matches!(self.peek(), Token::LParen) {
                    self.advance();
                    let args = self.parse_args()?;
                    Ok(Expr::Call { func: name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            t => Err(ParseError::UnexpectedToken {
                expected: "expression".to_string(),
                found: format!("{:?}", t),
            }),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.advance() {
                Token::Comma => continue,
                Token::RParen => break,
                t => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "',' or ')'".to_string(),
                        found: format!("{:?}", t),
                    })
                }
            }
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_assignment() {
        let assigns = Parser::new("x = 1 + 2;").unwrap().parse().unwrap();
        assert_eq!(assigns.len(), 1);
        assert_eq!(assigns[0].name, "x");
    }

    #[test]
    fn parses_call_and_multiple_lines() {
        let assigns = Parser::new(r#"a = hash(id); b = a * 2;"#)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(assigns.len(), 2);
        assert!(matches!(assigns[0].expr, Expr::Call { .. }));
    }

    #[test]
    fn precedence_mul_before_add() {
        let assigns = Parser::new("x = 1 + 2 * 3;").unwrap().parse().unwrap();
        match &assigns[0].expr {
            Expr::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }
}
