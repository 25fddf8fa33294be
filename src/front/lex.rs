//! The lexer: byte stream to token stream, with source positions.
//!
//! Whitespace and comments are skipped between tokens. Multi-character
//! operators are matched greedy-longest-first.

use crate::common::{intern, Id, Pos, Span};
use derive_more::Display;

/// Token classes. `Display` gives the human-readable spelling used in
/// diagnostics and in the `--out tokens` CLI dump.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    Id,
    IntLit,
    FloatLit,
    StrLit,
    Eof,

    // keywords
    #[display("int")]
    KwInt,
    #[display("char")]
    KwChar,
    #[display("short")]
    KwShort,
    #[display("long")]
    KwLong,
    #[display("void")]
    KwVoid,
    #[display("float")]
    KwFloat,
    #[display("double")]
    KwDouble,
    #[display("unsigned")]
    KwUnsigned,
    #[display("signed")]
    KwSigned,
    #[display("struct")]
    KwStruct,
    #[display("union")]
    KwUnion,
    #[display("enum")]
    KwEnum,
    #[display("typedef")]
    KwTypedef,
    #[display("static")]
    KwStatic,
    #[display("extern")]
    KwExtern,
    #[display("const")]
    KwConst,
    #[display("volatile")]
    KwVolatile,
    #[display("sizeof")]
    KwSizeof,
    #[display("if")]
    KwIf,
    #[display("else")]
    KwElse,
    #[display("while")]
    KwWhile,
    #[display("do")]
    KwDo,
    #[display("for")]
    KwFor,
    #[display("break")]
    KwBreak,
    #[display("continue")]
    KwContinue,
    #[display("return")]
    KwReturn,
    #[display("goto")]
    KwGoto,
    #[display("switch")]
    KwSwitch,
    #[display("case")]
    KwCase,
    #[display("default")]
    KwDefault,
    #[display("asm")]
    KwAsm,

    // punctuators
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    #[display(";")]
    Semi,
    #[display(",")]
    Comma,
    #[display(":")]
    Colon,
    #[display("?")]
    Question,
    #[display("...")]
    Ellipsis,
    #[display(".")]
    Dot,
    #[display("->")]
    Arrow,
    #[display("=")]
    Assign,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("%")]
    Percent,
    #[display("&")]
    Amp,
    #[display("|")]
    Pipe,
    #[display("^")]
    Caret,
    #[display("~")]
    Tilde,
    #[display("!")]
    Bang,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("<=")]
    Le,
    #[display(">=")]
    Ge,
    #[display("==")]
    EqEq,
    #[display("!=")]
    Ne,
    #[display("&&")]
    AmpAmp,
    #[display("||")]
    PipePipe,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
    #[display("++")]
    PlusPlus,
    #[display("--")]
    MinusMinus,
    #[display("+=")]
    PlusEq,
    #[display("-=")]
    MinusEq,
    #[display("*=")]
    StarEq,
    #[display("/=")]
    SlashEq,
    #[display("%=")]
    PercentEq,
    #[display("&=")]
    AmpEq,
    #[display("|=")]
    PipeEq,
    #[display("^=")]
    CaretEq,
    #[display("<<=")]
    ShlEq,
    #[display(">>=")]
    ShrEq,
}

#[derive(Clone, Debug)]
pub enum Literal {
    None,
    Int { value: i64, unsigned: bool, long: bool },
    Float { value: f64, is_float: bool },
    Str(Vec<u8>),
    Name(Id),
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub literal: Literal,
    pub span: Span,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kind: '{}', part of input: '{}'", self.kind, self.text)
    }
}

#[derive(Debug)]
pub struct LexError {
    pub pos: Pos,
    pub ch: char,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lexer error: unexpected character {:?} at {}", self.ch, self.pos)
    }
}

impl std::error::Error for LexError {}

fn keyword(s: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match s {
        "int" => KwInt,
        "char" => KwChar,
        "short" => KwShort,
        "long" => KwLong,
        "void" => KwVoid,
        "float" => KwFloat,
        "double" => KwDouble,
        "unsigned" => KwUnsigned,
        "signed" => KwSigned,
        "struct" => KwStruct,
        "union" => KwUnion,
        "enum" => KwEnum,
        "typedef" => KwTypedef,
        "static" => KwStatic,
        "extern" => KwExtern,
        "const" => KwConst,
        "volatile" => KwVolatile,
        "sizeof" => KwSizeof,
        "if" => KwIf,
        "else" => KwElse,
        "while" => KwWhile,
        "do" => KwDo,
        "for" => KwFor,
        "break" => KwBreak,
        "continue" => KwContinue,
        "return" => KwReturn,
        "goto" => KwGoto,
        "switch" => KwSwitch,
        "case" => KwCase,
        "default" => KwDefault,
        "asm" => KwAsm,
        _ => return None,
    })
}

/// Multi-character punctuators, longest first, so the lexer never commits to
/// a short match that a longer one would have shadowed.
const PUNCT: &[(&str, TokenKind)] = {
    use TokenKind::*;
    &[
        ("...", Ellipsis),
        ("<<=", ShlEq),
        (">>=", ShrEq),
        ("==", EqEq),
        ("!=", Ne),
        ("<=", Le),
        (">=", Ge),
        ("&&", AmpAmp),
        ("||", PipePipe),
        ("<<", Shl),
        (">>", Shr),
        ("++", PlusPlus),
        ("--", MinusMinus),
        ("->", Arrow),
        ("+=", PlusEq),
        ("-=", MinusEq),
        ("*=", StarEq),
        ("/=", SlashEq),
        ("%=", PercentEq),
        ("&=", AmpEq),
        ("|=", PipeEq),
        ("^=", CaretEq),
        ("(", LParen),
        (")", RParen),
        ("{", LBrace),
        ("}", RBrace),
        ("[", LBracket),
        ("]", RBracket),
        (";", Semi),
        (",", Comma),
        (":", Colon),
        ("?", Question),
        (".", Dot),
        ("=", Assign),
        ("+", Plus),
        ("-", Minus),
        ("*", Star),
        ("/", Slash),
        ("%", Percent),
        ("&", Amp),
        ("|", Pipe),
        ("^", Caret),
        ("~", Tilde),
        ("!", Bang),
        ("<", Lt),
        (">", Gt),
    ]
};

pub struct Lexer<'input> {
    input: &'input str,
    bytes: &'input [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        Lexer {
            input,
            bytes: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn end_of_input(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn cur_pos(&self) -> Pos {
        Pos { line: self.line, col: self.col }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(0x0b) | Some(0x0c) => {
                    self.advance();
                }
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while !matches!(self.peek_byte(), None | Some(b'\n')) {
                        self.advance();
                    }
                }
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek_byte() {
                            None => break,
                            Some(b'*') if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn is_ident_start(b: u8) -> bool {
        b.is_ascii_alphabetic() || b == b'_'
    }

    fn is_ident_cont(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_'
    }

    fn lex_ident_or_keyword(&mut self, start: usize, start_pos: Pos) -> Token {
        while matches!(self.peek_byte(), Some(b) if Self::is_ident_cont(b)) {
            self.advance();
        }
        let text = &self.input[start..self.pos];
        let span = self.span_from(start, start_pos);
        if let Some(kind) = keyword(text) {
            Token { kind, text: text.to_string(), literal: Literal::None, span }
        } else {
            Token {
                kind: TokenKind::Id,
                text: text.to_string(),
                literal: Literal::Name(intern(text)),
                span,
            }
        }
    }

    fn span_from(&self, start: usize, start_pos: Pos) -> Span {
        Span { start: start_pos, byte_start: start, byte_end: self.pos }
    }

    fn lex_number(&mut self, start: usize, start_pos: Pos) -> Result<Token, LexError> {
        let mut is_float = false;
        let mut is_hex = false;
        if self.peek_byte() == Some(b'0')
            && matches!(self.bytes.get(self.pos + 1), Some(b'x') | Some(b'X'))
        {
            is_hex = true;
            self.advance();
            self.advance();
            while matches!(self.peek_byte(), Some(b) if b.is_ascii_hexdigit()) {
                self.advance();
            }
        } else {
            while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                self.advance();
            }
            if self.peek_byte() == Some(b'.') {
                is_float = true;
                self.advance();
                while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                    self.advance();
                }
            }
            if matches!(self.peek_byte(), Some(b'e') | Some(b'E')) {
                is_float = true;
                self.advance();
                if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
                    self.advance();
                }
                while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                    self.advance();
                }
            }
        }

        if is_float {
            let mut is_f32 = false;
            if matches!(self.peek_byte(), Some(b'f') | Some(b'F')) {
                is_f32 = true;
                self.advance();
            }
            let text = &self.input[start..self.pos];
            let numeric_end = text.trim_end_matches(['f', 'F']);
            let value: f64 = numeric_end.parse().map_err(|_| LexError { pos: start_pos, ch: '?' })?;
            return Ok(Token {
                kind: TokenKind::FloatLit,
                text: text.to_string(),
                literal: Literal::Float { value, is_float: is_f32 },
                span: self.span_from(start, start_pos),
            });
        }

        let mut unsigned = false;
        let mut long = false;
        loop {
            match self.peek_byte() {
                Some(b'u') | Some(b'U') => {
                    unsigned = true;
                    self.advance();
                }
                Some(b'l') | Some(b'L') => {
                    long = true;
                    self.advance();
                    if matches!(self.peek_byte(), Some(b'l') | Some(b'L')) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
        let suffix_len = self.input[start..self.pos]
            .chars()
            .rev()
            .take_while(|c| matches!(c, 'u' | 'U' | 'l' | 'L'))
            .count();
        let digits_end = self.pos - suffix_len;
        let digits = &self.input[start..digits_end];
        let value: i64 = if is_hex {
            i64::from_str_radix(digits.trim_start_matches("0x").trim_start_matches("0X"), 16)
                .map_err(|_| LexError { pos: start_pos, ch: '?' })?
        } else if digits.starts_with('0') && digits.len() > 1 {
            i64::from_str_radix(digits, 8).map_err(|_| LexError { pos: start_pos, ch: '?' })?
        } else {
            digits.parse().map_err(|_| LexError { pos: start_pos, ch: '?' })?
        };
        let text = &self.input[start..self.pos];
        Ok(Token {
            kind: TokenKind::IntLit,
            text: text.to_string(),
            literal: Literal::Int { value, unsigned, long },
            span: self.span_from(start, start_pos),
        })
    }

    fn lex_string(&mut self, start: usize, start_pos: Pos) -> Result<Token, LexError> {
        self.advance(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                None => return Err(LexError { pos: start_pos, ch: '"' }),
                Some(b'"') => break,
                Some(b'\\') => bytes.push(self.lex_escape(start_pos)?),
                Some(b) => bytes.push(b),
            }
        }
        bytes.push(0);
        let text = self.input[start..self.pos].to_string();
        Ok(Token {
            kind: TokenKind::StrLit,
            text,
            literal: Literal::Str(bytes),
            span: self.span_from(start, start_pos),
        })
    }

    fn lex_escape(&mut self, start_pos: Pos) -> Result<u8, LexError> {
        match self.advance() {
            Some(b'n') => Ok(b'\n'),
            Some(b't') => Ok(b'\t'),
            Some(b'r') => Ok(b'\r'),
            Some(b'0') => Ok(0),
            Some(b'"') => Ok(b'"'),
            Some(b'\\') => Ok(b'\\'),
            Some(b'\'') => Ok(b'\''),
            Some(b'x') => {
                let mut v: u32 = 0;
                while matches!(self.peek_byte(), Some(b) if b.is_ascii_hexdigit()) {
                    let b = self.advance().unwrap();
                    v = v * 16 + (b as char).to_digit(16).unwrap();
                }
                Ok(v as u8)
            }
            Some(b) if (b'0'..=b'7').contains(&b) => {
                let mut v = (b - b'0') as u32;
                for _ in 0..2 {
                    if matches!(self.peek_byte(), Some(b) if (b'0'..=b'7').contains(&b)) {
                        let b = self.advance().unwrap();
                        v = v * 8 + (b - b'0') as u32;
                    }
                }
                Ok(v as u8)
            }
            Some(b) => Ok(b),
            None => Err(LexError { pos: start_pos, ch: '\\' }),
        }
    }

    /// Get the next token, or `None` at end of input.
    pub fn next(&mut self) -> Result<Option<Token>, LexError> {
        self.skip_whitespace();
        let start = self.pos;
        let start_pos = self.cur_pos();
        let Some(b) = self.peek_byte() else {
            return Ok(None);
        };
        if Self::is_ident_start(b) {
            return Ok(Some(self.lex_ident_or_keyword(start, start_pos)));
        }
        if b.is_ascii_digit() {
            return Ok(Some(self.lex_number(start, start_pos)?));
        }
        if b == b'"' {
            return Ok(Some(self.lex_string(start, start_pos)?));
        }
        let rest = &self.input[self.pos..];
        for (sym, kind) in PUNCT {
            if rest.starts_with(sym) {
                for _ in 0..sym.len() {
                    self.advance();
                }
                return Ok(Some(Token {
                    kind: *kind,
                    text: sym.to_string(),
                    literal: Literal::None,
                    span: self.span_from(start, start_pos),
                }));
            }
        }
        Err(LexError { pos: start_pos, ch: b as char })
    }

    /// Lex the entire input into a vector, stopping at the first error.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut out = Vec::new();
        while let Some(tok) = self.next()? {
            out.push(tok);
        }
        out.push(Token {
            kind: TokenKind::Eof,
            text: String::new(),
            literal: Literal::None,
            span: self.span_from(self.pos, self.cur_pos()),
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_keywords_and_idents() {
        let toks = Lexer::new("int main ( ) { return 0 ; }").tokenize().unwrap();
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::KwInt,
                TokenKind::Id,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::KwReturn,
                TokenKind::IntLit,
                TokenKind::Semi,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn greedy_longest_match_for_operators() {
        let toks = Lexer::new("a <<= b").tokenize().unwrap();
        assert_eq!(toks[1].kind, TokenKind::ShlEq);
    }

    #[test]
    fn hex_and_octal_literals() {
        let toks = Lexer::new("0x1F 017").tokenize().unwrap();
        match toks[0].literal {
            Literal::Int { value, .. } => assert_eq!(value, 31),
            _ => panic!(),
        }
        match toks[1].literal {
            Literal::Int { value, .. } => assert_eq!(value, 15),
            _ => panic!(),
        }
    }

    #[test]
    fn string_escapes() {
        let toks = Lexer::new(r#""a\nb\x41""#).tokenize().unwrap();
        match &toks[0].literal {
            Literal::Str(bytes) => assert_eq!(bytes, &vec![b'a', b'\n', b'b', 0x41, 0]),
            _ => panic!(),
        }
    }

    #[test]
    fn unknown_char_is_lex_error() {
        assert!(Lexer::new("@").tokenize().is_err());
    }

    #[test]
    fn skips_line_and_block_comments() {
        let toks = Lexer::new("int /* c */ x; // trailing\n").tokenize().unwrap();
        assert_eq!(toks[0].kind, TokenKind::KwInt);
        assert_eq!(toks[1].kind, TokenKind::Id);
    }
}
