mod common;

use byteorder::{LittleEndian, WriteBytesExt};
use common::*;
use riscv_record::{
    elf::{ElfError, MM_TEXT_START},
    riscv::{assemble, OperandSize, RISCVInstruction as I},
    session::{Config, RecordingSession},
    static_analysis::Rv64Analyzer,
    target::{Direction, HistoryEdge, ProcessControl, Signal, StopReason, WaitStatus},
    vm::{self, Vm, VmError},
};

const TEXT_ADDR: u64 = 0x1_0000;
const DATA_ADDR: u64 = 0x2_0000;
const EM_X86_64: u16 = 62;

struct Segment {
    flags: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Minimal ELF64 little endian executable without section headers
fn build_elf(machine: u16, entry: u64, segments: &[Segment]) -> Vec<u8> {
    let phoff = 64u64;
    let mut offset = phoff + 56 * segments.len() as u64;
    let mut elf = Vec::new();
    elf.extend_from_slice(b"\x7fELF");
    elf.extend_from_slice(&[2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    elf.write_u16::<LittleEndian>(2).unwrap();
    elf.write_u16::<LittleEndian>(machine).unwrap();
    elf.write_u32::<LittleEndian>(1).unwrap();
    elf.write_u64::<LittleEndian>(entry).unwrap();
    elf.write_u64::<LittleEndian>(phoff).unwrap();
    elf.write_u64::<LittleEndian>(0).unwrap();
    elf.write_u32::<LittleEndian>(0).unwrap();
    elf.write_u16::<LittleEndian>(64).unwrap();
    elf.write_u16::<LittleEndian>(56).unwrap();
    elf.write_u16::<LittleEndian>(segments.len() as u16).unwrap();
    elf.write_u16::<LittleEndian>(64).unwrap();
    elf.write_u16::<LittleEndian>(0).unwrap();
    elf.write_u16::<LittleEndian>(0).unwrap();
    assert_eq!(elf.len() as u64, phoff);

    for segment in segments {
        elf.write_u32::<LittleEndian>(1).unwrap();
        elf.write_u32::<LittleEndian>(segment.flags).unwrap();
        elf.write_u64::<LittleEndian>(offset).unwrap();
        elf.write_u64::<LittleEndian>(segment.vaddr).unwrap();
        elf.write_u64::<LittleEndian>(segment.vaddr).unwrap();
        elf.write_u64::<LittleEndian>(segment.data.len() as u64).unwrap();
        elf.write_u64::<LittleEndian>(segment.memsz).unwrap();
        elf.write_u64::<LittleEndian>(0x1000).unwrap();
        offset += segment.data.len() as u64;
    }
    for segment in segments {
        elf.extend_from_slice(&segment.data);
    }
    elf
}

fn program_segments() -> Vec<Segment> {
    let text = assemble(&[
        I::lui(OperandSize::S64, (DATA_ADDR >> 12) as i64, 6),
        I::load(OperandSize::S64, 6, 0, 7),
        I::addi(OperandSize::S64, 7, 1, 7),
        I::store(OperandSize::S64, 6, 7, 8),
        I::ebreak(),
    ]);
    let text_len = text.len() as u64;
    vec![
        Segment {
            flags: 5,
            vaddr: TEXT_ADDR,
            data: text,
            memsz: text_len,
        },
        Segment {
            flags: 6,
            vaddr: DATA_ADDR,
            data: 41u64.to_le_bytes().to_vec(),
            memsz: 16,
        },
    ]
}

#[test]
fn test_record_and_rewind_elf_program() {
    let elf = build_elf(243, TEXT_ADDR, &program_segments());
    let vm = Vm::from_elf(&elf, vm::Config::default()).unwrap();
    assert_eq!(vm.pc(), TEXT_ADDR);
    let mut session = RecordingSession::open(vm, Rv64Analyzer::new(), Config::default());

    assert_eq!(read_u64(&mut session, DATA_ADDR), 41);
    assert_eq!(read_u64(&mut session, DATA_ADDR + 8), 0);
    assert_eq!(
        run(&mut session, Direction::Forward, false),
        WaitStatus::stopped(StopReason::SoftwareBreakpoint, Signal::TRAP)
    );
    assert_eq!(read_u64(&mut session, DATA_ADDR + 8), 42);
    assert_eq!(session.log().count_resident(), 5);

    assert_eq!(
        run(&mut session, Direction::Reverse, false),
        WaitStatus::NoHistory(HistoryEdge::Begin)
    );
    assert_eq!(read_u64(&mut session, DATA_ADDR + 8), 0);
    assert_eq!(session.target().pc(), TEXT_ADDR);
}

#[test]
fn test_text_segment_is_read_only() {
    let elf = build_elf(243, TEXT_ADDR, &program_segments());
    let mut vm = Vm::from_elf(&elf, vm::Config::default()).unwrap();
    vm.set_gpr(6, TEXT_ADDR).unwrap();
    vm.set_pc(TEXT_ADDR + 12);
    vm.resume(true, Signal::NONE).unwrap();
    assert_eq!(
        vm.wait().unwrap(),
        WaitStatus::stopped(StopReason::None, Signal::SEGV)
    );
    assert_eq!(vm.pc(), TEXT_ADDR + 12);
}

#[test]
fn test_rejects_foreign_machine() {
    let elf = build_elf(EM_X86_64, TEXT_ADDR, &program_segments());
    assert_eq!(
        Vm::from_elf(&elf, vm::Config::default()).err(),
        Some(VmError::Elf(ElfError::WrongMachine))
    );
}

#[test]
fn test_rejects_entry_outside_code() {
    let elf = build_elf(243, DATA_ADDR, &program_segments());
    assert_eq!(
        Vm::from_elf(&elf, vm::Config::default()).err(),
        Some(VmError::Elf(ElfError::EntrypointOutOfBounds))
    );
}

#[test]
fn test_flat_binary_fallback() {
    let text = assemble(&counter(3));
    let vm = Vm::from_elf(&text, vm::Config::default()).unwrap();
    assert_eq!(vm.pc(), MM_TEXT_START);
    let mut session = RecordingSession::open(vm, Rv64Analyzer::new(), Config::default());
    run(&mut session, Direction::Forward, false);
    assert_eq!(gpr(&session, 5), 3);
}
