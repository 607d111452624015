/// S-expression lexer and parser for the tree text format.
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LParen,
    RParen,
    Symbol(String),
    Str(String),
    Int(i64),
    Float(f64),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Symbol(s) => write!(f, "{}", s),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Int(i) => write!(f, "{}", i),
            Token::Float(fl) => write!(f, "{}", fl),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

fn is_symbol_char(ch: char) -> bool {
    ch.is_alphanumeric()
        || matches!(ch, '_' | '-' | '+' | '*' | '/' | '%' | '<' | '>' | '=' | '!' | '?')
}

/// Hand-written lexer for the tree text format.
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn here(&self) -> String {
        format!("line {}, column {}", self.line, self.column)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.current() {
            self.advance();
            if ch == '\n' {
                break;
            }
        }
    }

    fn read_string(&mut self) -> Result<String, String> {
        let start = self.here();
        let mut result = String::new();
        self.advance(); // consume opening quote

        while let Some(ch) = self.current() {
            if ch == '"' {
                self.advance(); // consume closing quote
                return Ok(result);
            } else if ch == '\\' {
                self.advance();
                match self.current() {
                    Some('n') => {
                        result.push('\n');
                        self.advance();
                    }
                    Some('t') => {
                        result.push('\t');
                        self.advance();
                    }
                    Some('\\') => {
                        result.push('\\');
                        self.advance();
                    }
                    Some('"') => {
                        result.push('"');
                        self.advance();
                    }
                    Some(c) => {
                        result.push(c);
                        self.advance();
                    }
                    None => return Err(format!("{}: unexpected end of string", start)),
                }
            } else {
                result.push(ch);
                self.advance();
            }
        }
        Err(format!("{}: unclosed string literal", start))
    }

    /// Read an integer or float token starting at the current position.
    fn read_number_token(&mut self) -> Result<Token, String> {
        let start = self.here();
        let mut result = String::new();

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if self.current() == Some('.') && self.peek(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            result.push('.');
            self.advance();

            while let Some(ch) = self.current() {
                if ch.is_ascii_digit() {
                    result.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }

            result
                .parse()
                .map(Token::Float)
                .map_err(|_| format!("{}: invalid float literal: {}", start, result))
        } else {
            result
                .parse()
                .map(Token::Int)
                .map_err(|_| format!("{}: integer literal out of range: {}", start, result))
        }
    }

    fn read_symbol(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    pub fn next_token(&mut self) -> Result<Token, String> {
        self.skip_whitespace();

        while self.current() == Some(';') {
            self.skip_line_comment();
            self.skip_whitespace();
        }

        match self.current() {
            None => Ok(Token::Eof),
            Some('(') => {
                self.advance();
                Ok(Token::LParen)
            }
            Some(')') => {
                self.advance();
                Ok(Token::RParen)
            }
            Some('"') => Ok(Token::Str(self.read_string()?)),
            Some('-') if self.peek(1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                self.advance();
                match self.read_number_token()? {
                    Token::Int(n) => Ok(Token::Int(-n)),
                    Token::Float(f) => Ok(Token::Float(-f)),
                    _ => unreachable!(),
                }
            }
            Some(ch) if ch.is_ascii_digit() => self.read_number_token(),
            Some(ch) if is_symbol_char(ch) => Ok(Token::Symbol(self.read_symbol())),
            Some(ch) => {
                let at = self.here();
                self.advance();
                Err(format!("{}: unexpected character: '{}'", at, ch))
            }
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(tokens)
    }
}

/// Parsed s-expression, one level above tokens and one level below the
/// tree node model.
#[derive(Debug, Clone, PartialEq)]
pub enum SExpr {
    Atom(String),
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<SExpr>),
}

impl fmt::Display for SExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExpr::Atom(s) => write!(f, "{}", s),
            SExpr::Str(s) => write!(f, "\"{}\"", s),
            SExpr::Int(i) => write!(f, "{}", i),
            SExpr::Float(fl) => write!(f, "{}", fl),
            SExpr::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Recursive-descent parser over the token stream.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    pub fn parse_sexpr(&mut self) -> Result<SExpr, String> {
        match self.current() {
            Token::LParen => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    match self.current() {
                        Token::RParen => {
                            self.advance();
                            break;
                        }
                        Token::Eof => return Err("unexpected EOF, expected )".to_string()),
                        _ => items.push(self.parse_sexpr()?),
                    }
                }
                Ok(SExpr::List(items))
            }
            Token::Symbol(s) => {
                let sym = s.clone();
                self.advance();
                Ok(SExpr::Atom(sym))
            }
            Token::Str(s) => {
                let str = s.clone();
                self.advance();
                Ok(SExpr::Str(str))
            }
            Token::Int(i) => {
                let num = *i;
                self.advance();
                Ok(SExpr::Int(num))
            }
            Token::Float(f) => {
                let num = *f;
                self.advance();
                Ok(SExpr::Float(num))
            }
            Token::RParen => Err("unexpected )".to_string()),
            Token::Eof => Err("unexpected end of input".to_string()),
        }
    }

    pub fn parse(&mut self) -> Result<Vec<SExpr>, String> {
        let mut exprs = Vec::new();
        while self.current() != &Token::Eof {
            exprs.push(self.parse_sexpr()?);
        }
        Ok(exprs)
    }
}

/// Tokenize and parse a whole input.
pub fn parse(input: &str) -> Result<Vec<SExpr>, String> {
    let mut lexer = Lexer::new(input);
    let tokens = lexer.tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexer_basic() {
        let mut lexer = Lexer::new("(assign x 1)");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens.len(), 6); // (, assign, x, 1, ), EOF
        assert_eq!(tokens[0], Token::LParen);
        assert_eq!(tokens[1], Token::Symbol("assign".to_string()));
        assert_eq!(tokens[2], Token::Symbol("x".to_string()));
        assert_eq!(tokens[3], Token::Int(1));
        assert_eq!(tokens[4], Token::RParen);
        assert_eq!(tokens[5], Token::Eof);
    }

    #[test]
    fn test_lexer_operator_symbols() {
        let mut lexer = Lexer::new("+ - * / % == != < <= > >= and or");
        let tokens = lexer.tokenize().unwrap();
        let syms: Vec<_> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Symbol(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            syms,
            vec!["+", "-", "*", "/", "%", "==", "!=", "<", "<=", ">", ">=", "and", "or"]
        );
    }

    #[test]
    fn test_lexer_numbers() {
        let mut lexer = Lexer::new("0 42 -7 3.25 -2.5");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Int(0));
        assert_eq!(tokens[1], Token::Int(42));
        assert_eq!(tokens[2], Token::Int(-7));
        assert_eq!(tokens[3], Token::Float(3.25));
        assert_eq!(tokens[4], Token::Float(-2.5));
    }

    #[test]
    fn test_lexer_minus_symbol_vs_negative_number() {
        let mut lexer = Lexer::new("- -3 my-name");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Symbol("-".to_string()));
        assert_eq!(tokens[1], Token::Int(-3));
        assert_eq!(tokens[2], Token::Symbol("my-name".to_string()));
    }

    #[test]
    fn test_lexer_string_escapes() {
        let mut lexer = Lexer::new(r#""say \"hi\"\n""#);
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Str("say \"hi\"\n".to_string()));
    }

    #[test]
    fn test_lexer_string_unclosed() {
        let mut lexer = Lexer::new(r#""hello"#);
        let result = lexer.tokenize();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("unclosed string"));
    }

    #[test]
    fn test_lexer_comments() {
        let mut lexer = Lexer::new("; comment\n(return 1) ; trailing\n");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::LParen);
        assert_eq!(tokens[1], Token::Symbol("return".to_string()));
        assert_eq!(tokens[2], Token::Int(1));
    }

    #[test]
    fn test_lexer_error_has_position() {
        let mut lexer = Lexer::new("(assign x \n #)");
        let err = lexer.tokenize().unwrap_err();
        assert!(err.contains("line 2"), "{}", err);
    }

    #[test]
    fn test_lexer_empty_input() {
        let mut lexer = Lexer::new("");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens, vec![Token::Eof]);
    }

    #[test]
    fn test_parser_basic() {
        let exprs = parse("(binop + 1 2)").unwrap();
        assert_eq!(exprs.len(), 1);
        match &exprs[0] {
            SExpr::List(items) => {
                assert_eq!(items.len(), 4);
                assert_eq!(items[0], SExpr::Atom("binop".to_string()));
                assert_eq!(items[1], SExpr::Atom("+".to_string()));
                assert_eq!(items[2], SExpr::Int(1));
                assert_eq!(items[3], SExpr::Int(2));
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_parser_nested() {
        let exprs = parse("(block (assign x (binop * 2 3)))").unwrap();
        assert_eq!(exprs.len(), 1);
        let printed = format!("{}", exprs[0]);
        assert_eq!(printed, "(block (assign x (binop * 2 3)))");
    }

    #[test]
    fn test_parser_multiple_top_level() {
        let exprs = parse("(assign x 1) (return x)").unwrap();
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn test_parser_unclosed_paren() {
        let result = parse("(assign x 1");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("EOF"));
    }

    #[test]
    fn test_parser_stray_close_paren() {
        let result = parse(")");
        assert!(result.is_err());
    }

    #[test]
    fn test_parser_empty_input() {
        let exprs = parse("").unwrap();
        assert!(exprs.is_empty());
    }

    #[test]
    fn test_display_token() {
        assert_eq!(format!("{}", Token::LParen), "(");
        assert_eq!(format!("{}", Token::Symbol("for".to_string())), "for");
        assert_eq!(format!("{}", Token::Int(42)), "42");
    }
}
