//! Splits one line of AT&T assembly text into a label, a mnemonic or
//! directive, and its comma-separated operands.

/// One parsed source line. At most one of `label`/`mnemonic` is expected to
/// be absent on a well-formed line, but both empty is a blank or
/// comment-only line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Line {
    pub label: Option<String>,
    pub mnemonic: Option<String>,
    pub operands: Vec<String>,
}

pub fn lex_line(raw: &str) -> Line {
    let without_comment = match raw.find('#') {
        Some(i) => &raw[..i],
        None => raw,
    };
    let mut line = Line::default();
    let mut rest = without_comment.trim();

    if let Some(colon) = rest.find(':') {
        let (label, after) = rest.split_at(colon);
        if !label.trim().is_empty() && label.trim().chars().all(is_label_char) {
            line.label = Some(label.trim().to_string());
            rest = after[1..].trim();
        }
    }

    if rest.is_empty() {
        return line;
    }

    let (mnemonic, operand_text) = match rest.find(char::is_whitespace) {
        Some(i) => (&rest[..i], rest[i..].trim()),
        None => (rest, ""),
    };
    line.mnemonic = Some(mnemonic.to_string());
    if !operand_text.is_empty() {
        line.operands = split_operands(operand_text);
    }
    line
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$'
}

/// Splits on top-level commas only: an operand like `8(%rbp,%rax,4)` has
/// commas that must not split it.
fn split_operands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(text[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(text[start..].trim().to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_a_label_and_instruction() {
        let l = lex_line("foo: movq %rax, %rbx");
        assert_eq!(l.label.as_deref(), Some("foo"));
        assert_eq!(l.mnemonic.as_deref(), Some("movq"));
        assert_eq!(l.operands, vec!["%rax", "%rbx"]);
    }

    #[test]
    fn strips_comments() {
        let l = lex_line("\taddq $1, %rax # bump");
        assert_eq!(l.mnemonic.as_deref(), Some("addq"));
        assert_eq!(l.operands, vec!["$1", "%rax"]);
    }

    #[test]
    fn keeps_parenthesised_commas_inside_one_operand() {
        let l = lex_line("\tmovq 8(%rbp,%rax,4), %rcx");
        assert_eq!(l.operands, vec!["8(%rbp,%rax,4)", "%rcx"]);
    }

    #[test]
    fn directive_with_no_label() {
        let l = lex_line("\t.globl main");
        assert_eq!(l.label, None);
        assert_eq!(l.mnemonic.as_deref(), Some(".globl"));
        assert_eq!(l.operands, vec!["main"]);
    }
}
