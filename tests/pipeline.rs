//! End-to-end coverage through the full x86-64 pipeline: parse, validate,
//! build IR, allocate registers, emit. Since nothing here links or executes
//! the emitted assembly, these check structural properties of the output
//! that would only hold if each stage did its job correctly, rather than
//! literal process exit codes.

use xcc::front;
use xcc::middle;

fn compile(src: &str) -> String {
    let (program, types) = front::parse(src, 8).expect("parse");
    let diags = front::lower(&program);
    assert!(!diags.has_errors(), "unexpected diagnostics: {:?}", diags.errors());
    let mut ir = middle::build_program(&program, &types).expect("build IR");
    for f in ir.functions.iter_mut() {
        middle::allocate(f);
    }
    xcc::back::emit_program(&ir, "x86_64-unknown-linux-gnu")
}

#[test]
fn returns_a_constant() {
    // int main(){ return 42; }
    let text = compile("int main(){ return 42; }");
    assert!(text.contains("main:"));
    assert!(text.contains("$42"));
    assert!(text.contains("\tret"));
}

#[test]
fn recursive_factorial_calls_itself() {
    // int fact(int n){ return n<=1 ? 1 : n*fact(n-1); } int main(){ return fact(5); }
    let text = compile("int fact(int n){ return n<=1 ? 1 : n*fact(n-1); } int main(){ return fact(5); }");
    assert!(text.contains("fact:"));
    assert!(text.contains("call fact"));
    // the ternary's condition materialises a `cmp` against the `<=` test
    assert!(text.contains("\tcmp"));
    assert!(text.contains("$5"));
}

#[test]
fn array_loop_indexes_with_a_scaled_offset() {
    // int main(){ int a[5]; for(int i=0;i<5;i++) a[i]=i*i; return a[3]; }
    let text = compile("int main(){ int a[5]; for(int i=0;i<5;i++) a[i]=i*i; return a[3]; }");
    // each `a[i]` store scales the index by the element size (4 bytes)
    assert!(text.contains("$4"));
    assert!(text.contains("imul"));
    // reading back a[3] needs the constant 3 scaled the same way
    assert!(text.contains("$3") || text.contains("$12"));
}

#[test]
fn struct_member_access_uses_field_offsets() {
    // struct P{int x,y;}; int main(){ struct P p={3,4}; return p.x+p.y; }
    let text = compile("struct P{int x,y;}; int main(){ struct P p={3,4}; return p.x+p.y; }");
    // `y` sits at offset 4 in `struct P { int x, y; }`
    assert!(text.contains("$4"));
    assert!(text.contains("\tadd"));
}

#[test]
fn global_pointer_increment_reads_and_writes_through_an_address() {
    // int g=10; int f(int*p){ *p+=5; return *p; } int main(){ return f(&g); }
    let text = compile("int g=10; int f(int*p){ *p+=5; return *p; } int main(){ return f(&g); }");
    assert!(text.contains("g:") || text.contains("g,"));
    assert!(text.contains("\tcall f"));
    assert!(text.contains("$5"));
}

#[test]
fn unsigned_comparison_picks_the_unsigned_branch_mnemonic() {
    let text = compile("int main(){ unsigned int a=1,b=2; if(a<b) return 1; return 0; }");
    // signed `<` would pick `jl`/`setl`; unsigned operands must pick `jb`/`setb`.
    assert!(text.contains("jb") || text.contains("setb"));
}

#[test]
fn bitfield_store_then_load_round_trips() {
    let text = compile(
        "struct F { unsigned int a:3; unsigned int b:5; }; \
         int main(){ struct F f; f.a=5; f.b=20; return f.a+f.b; }",
    );
    assert!(text.contains("\tand"));
    assert!(text.contains("\tor"));
}
