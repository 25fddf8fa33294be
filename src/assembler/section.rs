//! Per-section intermediate representation: what a parsed line becomes once
//! its section is known.

use crate::assembler::lexer::Line;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Text,
    Data,
    Rodata,
    Bss,
}

/// Whether a jump instruction currently occupies its short (rel8) or long
/// (rel32) encoding. Starts `Short`; [`crate::assembler::resolve`] only ever
/// upgrades, never downgrades, which is what makes the fixpoint terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpForm {
    Short,
    Long,
}

#[derive(Debug, Clone)]
pub enum Record {
    Label(String),
    /// A conditional or unconditional jump to a label, still unresolved.
    /// `mnemonic` is `"jmp"` or one of the `jcc` forms the backend emits
    /// (`je`, `jne`, `jl`, `jle`, `jg`, `jge`).
    Jump { mnemonic: String, target: String, form: JumpForm },
    /// Any other instruction. `len` is its encoded size in bytes, from
    /// [`instruction_len`] — approximate (no immediate-size refinement) but
    /// fixed once computed, which is all the resolver needs.
    Instr { mnemonic: String, len: u32 },
    Bytes(Vec<u8>),
    Zero(u32),
    Align(u32),
}

impl Record {
    /// Current encoded length, given where upgraded jumps stand.
    pub fn len(&self) -> u32 {
        match self {
            Record::Label(_) => 0,
            Record::Jump { mnemonic, form, .. } => jump_len(mnemonic, *form),
            Record::Instr { len, .. } => *len,
            Record::Bytes(b) => b.len() as u32,
            Record::Zero(n) => *n,
            Record::Align(_) => 0, // resolved separately, against the running address
        }
    }
}

pub fn jump_len(mnemonic: &str, form: JumpForm) -> u32 {
    let conditional = mnemonic != "jmp";
    match (conditional, form) {
        (false, JumpForm::Short) => 2,
        (false, JumpForm::Long) => 5,
        (true, JumpForm::Short) => 2,
        (true, JumpForm::Long) => 6, // 0F prefix + opcode + rel32
    }
}

/// A rough but fixed per-mnemonic instruction length, standing in for a real
/// x86-64 encoder (the assembler's resolution algorithm below doesn't care
/// about exact bytes, only that each record has *some* fixed, known length).
pub fn instruction_len(mnemonic: &str, n_operands: usize) -> u32 {
    let base: u32 = match mnemonic {
        "ret" | "cqto" | "leave" => 1,
        "pushq" | "popq" => 1,
        "call" => 5,
        m if m.starts_with("set") => 3,
        m if m.starts_with("cvt") => 4,
        "movzbl" | "movzbq" | "movsbl" => 3,
        _ => 3,
    };
    base + (n_operands as u32).saturating_sub(1)
}

/// Turns one lexed line into zero or more records, given the section it was
/// lexed inside (a directive line may itself change the active section,
/// which the caller handles before calling this).
pub fn line_to_records(line: &Line) -> Vec<Record> {
    let mut out = Vec::new();
    if let Some(label) = &line.label {
        out.push(Record::Label(label.clone()));
    }
    let Some(mnemonic) = &line.mnemonic else {
        return out;
    };
    match mnemonic.as_str() {
        ".text" | ".data" | ".section" | ".globl" | ".extern" | ".comm" => {}
        ".align" | ".p2align" => {
            if let Some(n) = line.operands.first().and_then(|o| o.parse::<u32>().ok()) {
                out.push(Record::Align(1 << n.min(12)));
            }
        }
        ".byte" => out.push(Record::Bytes(parse_int_list(&line.operands, 1))),
        ".word" => out.push(Record::Bytes(parse_int_list(&line.operands, 2))),
        ".long" => out.push(Record::Bytes(parse_int_list(&line.operands, 4))),
        ".quad" => out.push(Record::Bytes(parse_int_list(&line.operands, 8))),
        ".zero" | ".skip" => {
            if let Some(n) = line.operands.first().and_then(|o| o.parse::<u32>().ok()) {
                out.push(Record::Zero(n));
            }
        }
        ".ascii" | ".asciz" | ".string" => {
            if let Some(text) = line.operands.first() {
                let mut bytes = unquote(text).into_bytes();
                if mnemonic != ".ascii" {
                    bytes.push(0);
                }
                out.push(Record::Bytes(bytes));
            }
        }
        "jmp" | "je" | "jne" | "jl" | "jle" | "jg" | "jge" => {
            if let Some(target) = line.operands.first() {
                out.push(Record::Jump { mnemonic: mnemonic.clone(), target: target.clone(), form: JumpForm::Short });
            }
        }
        _ => out.push(Record::Instr { mnemonic: mnemonic.clone(), len: instruction_len(mnemonic, line.operands.len()) }),
    }
    out
}

fn parse_int_list(operands: &[String], size: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(operands.len() * size);
    for op in operands {
        let v: i64 = op.trim().parse().unwrap_or(0);
        bytes.extend_from_slice(&v.to_le_bytes()[..size]);
    }
    bytes
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::lexer::lex_line;

    #[test]
    fn byte_directive_becomes_bytes_record() {
        let line = lex_line("\t.byte 1,2,3");
        let recs = line_to_records(&line);
        assert!(matches!(&recs[0], Record::Bytes(b) if b == &vec![1, 2, 3]));
    }

    #[test]
    fn jmp_starts_short() {
        let line = lex_line("\tjmp .Lfoo_3");
        let recs = line_to_records(&line);
        assert!(matches!(&recs[0], Record::Jump { form: JumpForm::Short, .. }));
    }
}
