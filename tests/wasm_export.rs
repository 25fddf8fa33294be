//! Scenario 6: a WebAssembly module exporting a scalar function, checked by
//! decoding the binary module structure rather than by running it in a
//! WebAssembly host.

use xcc::back;
use xcc::back::leb128;
use xcc::front;

#[test]
fn exported_function_module_has_a_valid_header_and_export() {
    let (program, _types) = front::parse("int add(int a,int b){return a+b;}", 4).expect("parse");
    let bytes = back::emit_module(&program).expect("emit wasm module");

    assert_eq!(&bytes[0..4], &[0x00, 0x61, 0x73, 0x6d], "magic number");
    assert_eq!(&bytes[4..8], &[0x01, 0x00, 0x00, 0x00], "version");

    // Walk the section table looking for the export section (id 7) and
    // confirm it names "add".
    let mut pos = 8usize;
    let mut found_export_of_add = false;
    while pos < bytes.len() {
        let id = bytes[pos];
        pos += 1;
        let (len, next) = leb128::read_u(&bytes, pos);
        pos = next;
        let body = &bytes[pos..pos + len as usize];
        if id == 7 {
            // export count, then (name_len, name_bytes, kind, index) repeated
            let (count, mut p) = leb128::read_u(body, 0);
            for _ in 0..count {
                let (name_len, after_len) = leb128::read_u(body, p);
                let name = &body[after_len..after_len + name_len as usize];
                if name == b"add" {
                    found_export_of_add = true;
                }
                p = after_len + name_len as usize + 1; // kind byte
                let (_, after_idx) = leb128::read_u(body, p);
                p = after_idx;
            }
        }
        pos += len as usize;
    }
    assert!(found_export_of_add, "expected an export named 'add'");
}

#[test]
fn function_body_contains_the_i32_add_opcode() {
    let (program, _types) = front::parse("int add(int a,int b){return a+b;}", 4).expect("parse");
    let bytes = back::emit_module(&program).expect("emit wasm module");
    // 0x6a is i32.add; a function computing `a+b` must emit it somewhere in
    // the code section.
    assert!(bytes.windows(1).any(|w| w[0] == 0x6a));
}

#[test]
fn non_scalar_feature_is_rejected_with_a_descriptive_error() {
    let (program, _types) = front::parse("int f(int*p){ return *p; }", 4).expect("parse");
    let err = back::emit_module(&program).unwrap_err();
    assert!(!err.to_string().is_empty());
}
