mod common;

use baretk_core::decomp::structure_all;
use baretk_core::decoder::FlowKind;
use baretk_core::disasm::EdgeKind;
use baretk_core::{disassemble, load, AnalysisConfig, Disassembly};
use common::{elf64, riscv_code, BASE, EM_ARM, EM_X86_64};

fn disassemble_x86(code: &[u8]) -> Disassembly {
    disassemble(load(&elf64(EM_X86_64, code)).unwrap()).unwrap()
}

#[test]
fn clone_is_deep_and_equal() {
    let program = load(&elf64(EM_X86_64, &[0x90, 0xc3])).unwrap();
    let copy = program.clone();
    assert_eq!(copy.endianness(), program.endianness());
    assert_eq!(copy.machine(), program.machine());
    assert_eq!(copy.segments(), program.segments());

    let original = program.section(".text").unwrap();
    let cloned = copy.section(".text").unwrap();
    assert_eq!(cloned.addr, original.addr);
    assert_eq!(cloned.data, original.data);
    assert_ne!(cloned.data.as_ptr(), original.data.as_ptr());

    drop(program);
    assert_eq!(copy.section_data(".text"), &[0x90, 0xc3]);
}

#[test]
fn section_miss_is_empty() {
    let program = load(&elf64(EM_X86_64, &[0xc3])).unwrap();
    assert!(program.section(".rodata").is_none());
    assert!(program.section_data(".rodata").is_empty());
    assert_eq!(program.section(".text").map(|s| s.addr), Some(BASE));
}

#[test]
fn valid_code_is_covered_exactly() {
    // push rbp; mov rbp, rsp; mov eax, 7; add eax, 3; pop rbp; ret
    let code = [
        0x55, 0x48, 0x89, 0xe5, 0xb8, 0x07, 0x00, 0x00, 0x00, 0x83, 0xc0, 0x03, 0x5d, 0xc3,
    ];
    let d = disassemble_x86(&code);
    let mut expected: u64 = BASE;
    let mut total: usize = 0;
    for insn in d.instructions() {
        assert_eq!(insn.address, expected, "gap or overlap at 0x{:x}", insn.address);
        assert!(!insn.is_invalid());
        expected = insn.end();
        total += insn.length as usize;
    }
    assert_eq!(total, code.len());
}

#[test]
fn resyncs_after_bad_opcode() {
    // nop; (bad); ret
    let d = disassemble_x86(&[0x90, 0xd6, 0xc3]);
    let got: Vec<(u64, u8, bool)> = d
        .instructions()
        .map(|i| (i.address, i.length, i.is_invalid()))
        .collect();
    assert_eq!(
        got,
        vec![(BASE, 1, false), (BASE + 1, 1, true), (BASE + 2, 1, false)]
    );
}

/// Every block is non-empty and every block that does not return has an
/// outgoing edge.
fn assert_well_formed(d: &Disassembly) {
    let cfg = d.cfg();
    assert!(!cfg.is_empty());
    for block in cfg.blocks() {
        assert!(!block.instructions.is_empty(), "empty block {}", block.id);
        if block.exit_flow() != FlowKind::Return {
            assert!(
                cfg.edges_from(block.id).next().is_some(),
                "block at 0x{:x} ({:?}) has no outgoing edge",
                block.start,
                block.exit_flow()
            );
        }
    }
}

#[test]
fn cfg_is_well_formed() {
    // 0: test edi, edi ; 2: je 0xb ; 4: call 9 ; 9: jmp rax ; b: ret
    let code = [
        0x85, 0xff, 0x74, 0x07, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xff, 0xe0, 0xc3,
    ];
    let d = disassemble_x86(&code);
    assert_well_formed(&d);
    assert!(d
        .cfg()
        .edges()
        .iter()
        .any(|e| e.kind == EdgeKind::IndirectUnresolved && e.to.is_none()));
}

#[test]
fn cfg_is_well_formed_on_edge_shapes() {
    let samples: [&[u8]; 6] = [
        // runs off the segment end
        &[0x90, 0x90],
        // (bad) as the last byte
        &[0x90, 0xd6],
        // (bad) between valid instructions
        &[0x90, 0xd6, 0xc3],
        // conditional branch as the last instruction
        &[0x85, 0xc0, 0x74, 0x00],
        // call as the last instruction
        &[0xe8, 0x00, 0x00, 0x00, 0x00],
        // overlapping stream: jmp into the immediate of a mov
        &[0xb8, 0xc3, 0x90, 0x00, 0x00, 0xeb, 0xfa],
    ];
    for code in samples {
        assert_well_formed(&disassemble_x86(code));
    }
}

#[test]
fn fallthrough_off_the_segment_end_is_unresolved() {
    let d = disassemble_x86(&[0x90, 0x90]);
    let cfg = d.cfg();
    assert_eq!(cfg.len(), 1);
    let edges: Vec<EdgeKind> = cfg.edges_from(0).map(|e| e.kind).collect();
    assert_eq!(edges, vec![EdgeKind::IndirectUnresolved]);
}

#[test]
fn arm_cfg_is_well_formed_after_a_bad_word() {
    // (bad) word ; mov r0, #1 ; bxeq lr ; mov r0, #2 runs off the end
    let code = riscv_code(&[0xffff_ffff, 0xe3a0_0001, 0x012f_ff1e, 0xe3a0_0002]);
    let d = disassemble(load(&elf64(EM_ARM, &code)).unwrap()).unwrap();
    let invalid: Vec<(u64, u8)> = d
        .instructions()
        .filter(|i| i.is_invalid())
        .map(|i| (i.address, i.length))
        .collect();
    assert_eq!(
        invalid,
        vec![(BASE, 1), (BASE + 1, 1), (BASE + 2, 1), (BASE + 3, 1)]
    );
    assert_eq!(
        d.instructions().find(|i| i.address == BASE + 4).map(|i| i.mnemonic),
        Some("mov")
    );
    assert_well_formed(&d);
}

#[test]
fn every_function_structures_to_a_non_empty_tree() {
    // Two entries into one cycle: 0: test edi, edi ; je 6 ; 4: inc eax ;
    // 6: dec eax ; jne 4 ; ret
    let code = [0x85, 0xff, 0x74, 0x02, 0xff, 0xc0, 0xff, 0xc8, 0x75, 0xfa, 0xc3];
    let d = disassemble_x86(&code);
    for parallel in [false, true] {
        let trees = structure_all(d.cfg(), d.functions(), parallel);
        assert_eq!(trees.len(), d.functions().len());
        for tree in &trees {
            assert!(!tree.nodes.is_empty(), "{} structured to nothing", tree.name);
        }
    }
}

#[test]
fn instruction_budget_marks_partial() {
    let config = AnalysisConfig {
        max_instructions: 2,
        ..AnalysisConfig::default()
    };
    let program = load(&elf64(EM_X86_64, &[0x90; 8])).unwrap();
    let d = baretk_core::disassemble_with(program, &config).unwrap();
    assert!(d.is_partial());
    assert_eq!(d.instruction_count(), 2);
    assert_well_formed(&d);

    // Cut inside a loop body: mov eax, 1 ; inc eax ; jmp back
    let config = AnalysisConfig {
        max_instructions: 1,
        ..AnalysisConfig::default()
    };
    let program = load(&elf64(EM_X86_64, &[0xb8, 0x01, 0, 0, 0, 0xff, 0xc0, 0xeb, 0xf7])).unwrap();
    let d = baretk_core::disassemble_with(program, &config).unwrap();
    assert!(d.is_partial());
    assert_well_formed(&d);
}
