//! Address resolution: lays out each section's records and upgrades a jump
//! from its short (rel8) encoding to long (rel32) whenever its target falls
//! out of range, iterating to a fixpoint: upgrades only grow a record's
//! length, which can only push later addresses further out, never closer,
//! so the loop terminates in at most one pass per jump in the section.

use derive_more::Display;

use crate::assembler::lexer::lex_line;
use crate::assembler::section::{jump_len, line_to_records, JumpForm, Record, Section};
use crate::common::Map;

#[derive(Display, Debug, Clone)]
#[display("assembler error: {}", self.0)]
pub struct AssembleError(pub String);

#[derive(Debug, Default)]
pub struct SectionLayout {
    pub size: u32,
    /// Concrete bytes for sections made only of data directives. `None` for
    /// `.text`, since this assembler does not encode real machine code (see
    /// module docs); callers needing executable bytes must go elsewhere.
    pub bytes: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct AssembledProgram {
    pub layout: Map<Section, SectionLayout>,
    pub symbols: Map<String, (Section, u32)>,
}

/// Parses `source`, resolves every section independently, and returns the
/// combined layout and symbol table.
pub fn assemble(source: &str) -> Result<AssembledProgram, AssembleError> {
    let mut cur = Section::Text;
    let mut by_section: Map<Section, Vec<Record>> = Map::new();

    for raw in source.lines() {
        let line = lex_line(raw);
        if let Some(m) = &line.mnemonic {
            match m.as_str() {
                ".text" => { cur = Section::Text; continue; }
                ".data" => { cur = Section::Data; continue; }
                ".section" => {
                    cur = match line.operands.first().map(|s| s.as_str()) {
                        Some(".rodata") => Section::Rodata,
                        Some(".bss") => Section::Bss,
                        Some(".data") => Section::Data,
                        _ => Section::Text,
                    };
                    continue;
                }
                ".comm" => {
                    let bss = by_section.entry(Section::Bss).or_default();
                    if let Some(name) = line.operands.first() {
                        bss.push(Record::Label(name.clone()));
                    }
                    if let Some(size) = line.operands.get(1).and_then(|s| s.trim().parse::<u32>().ok()) {
                        bss.push(Record::Zero(size));
                    }
                    continue;
                }
                _ => {}
            }
        }
        by_section.entry(cur).or_default().extend(line_to_records(&line));
    }

    let mut layout = Map::new();
    let mut symbols: Map<String, (Section, u32)> = Map::new();
    for (&section, records) in by_section.iter_mut() {
        let local_symbols = resolve_section(records)?;
        for (name, addr) in local_symbols {
            symbols.insert(name, (section, addr));
        }
        let size = records.iter().map(Record::len).sum();
        let bytes = if section == Section::Text { None } else { Some(concrete_bytes(records)) };
        layout.insert(section, SectionLayout { size, bytes });
    }
    Ok(AssembledProgram { layout, symbols })
}

/// Resolves one section's records in place, returning its label->offset map.
fn resolve_section(records: &mut [Record]) -> Result<Map<String, u32>, AssembleError> {
    loop {
        let mut addr = 0u32;
        let mut positions = Vec::with_capacity(records.len());
        let mut symbols: Map<String, u32> = Map::new();
        for r in records.iter() {
            if let Record::Label(name) = r {
                symbols.insert(name.clone(), addr);
            }
            if let Record::Align(a) = r {
                addr = round_up(addr, *a);
            }
            positions.push(addr);
            addr += r.len();
        }

        let mut changed = false;
        for (i, r) in records.iter_mut().enumerate() {
            if let Record::Jump { mnemonic, target, form } = r {
                if *form == JumpForm::Long {
                    continue;
                }
                let end_of_insn = positions[i] + jump_len(mnemonic, *form);
                let to = *symbols
                    .get(target)
                    .ok_or_else(|| AssembleError(format!("undefined label '{target}'")))?;
                let delta = to as i64 - end_of_insn as i64;
                if !(-128..=127).contains(&delta) {
                    *form = JumpForm::Long;
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(symbols);
        }
    }
}

fn concrete_bytes(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::new();
    for r in records {
        match r {
            Record::Bytes(b) => out.extend_from_slice(b),
            Record::Zero(n) => out.extend(std::iter::repeat(0u8).take(*n as usize)),
            Record::Align(a) => {
                let pad = round_up(out.len() as u32, *a) as usize - out.len();
                out.extend(std::iter::repeat(0u8).take(pad));
            }
            Record::Label(_) | Record::Jump { .. } | Record::Instr { .. } => {}
        }
    }
    out
}

fn round_up(v: u32, align: u32) -> u32 {
    if align <= 1 {
        return v;
    }
    (v + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_a_jump_whose_target_is_far_away() {
        let mut src = String::from("\t.text\nstart:\n\tjmp far\n");
        for i in 0..200 {
            src.push_str(&format!("pad{i}:\n\taddq $1, %rax\n"));
        }
        src.push_str("far:\n\tret\n");
        let prog = assemble(&src).unwrap();
        let (section, _) = prog.symbols["far"];
        assert_eq!(section, Section::Text);
    }

    #[test]
    fn short_jump_to_a_nearby_label_stays_short() {
        let src = "\t.text\nstart:\n\tjmp near\nnear:\n\tret\n";
        let prog = assemble(src).unwrap();
        assert!(prog.symbols.contains_key("near"));
    }

    #[test]
    fn undefined_jump_target_is_an_error() {
        let src = "\t.text\nstart:\n\tjmp nowhere\n";
        assert!(assemble(src).is_err());
    }

    #[test]
    fn data_section_collects_concrete_bytes() {
        let src = "\t.data\nfoo:\n\t.byte 1,2,3\n";
        let prog = assemble(src).unwrap();
        let layout = &prog.layout[&Section::Data];
        assert_eq!(layout.bytes.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
