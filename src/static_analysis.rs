//! Decides, before an RV64IM instruction executes, which registers and which
//! memory it is going to change.

use crate::{
    riscv::{self, opcode, DecodedInstruction, INSN_SIZE},
    target::{AnalyzeError, InstructionAnalyzer, InstructionEffects, MemoryRange, ProcessControl},
};

/// Number of general purpose registers
pub const GPR_COUNT: u32 = 32;
/// Register number of the program counter, right after x31
pub const PC_REGISTER: u32 = GPR_COUNT;
/// Width of every register in bytes
pub const REGISTER_SIZE: usize = 8;
/// Return value / first argument register (a0)
pub const A0: u32 = 10;

/// Instruction analyzer for the RV64IM base instruction set
#[derive(Debug, Default, Clone, Copy)]
pub struct Rv64Analyzer;

impl Rv64Analyzer {
    /// Creates a new analyzer
    pub fn new() -> Self {
        Self
    }

    fn fetch(target: &mut dyn ProcessControl, pc: u64) -> Result<u32, AnalyzeError> {
        let mut word = [0u8; INSN_SIZE as usize];
        target.read_memory(pc, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn read_gpr(target: &mut dyn ProcessControl, regno: u8) -> Result<u64, AnalyzeError> {
        let mut value = [0u8; REGISTER_SIZE];
        target.read_register(u32::from(regno), &mut value)?;
        Ok(u64::from_le_bytes(value))
    }

    fn destination(insn: &DecodedInstruction) -> Vec<u32> {
        // Writes to x0 are discarded by the hardware.
        if insn.rd == 0 {
            Vec::new()
        } else {
            vec![u32::from(insn.rd)]
        }
    }
}

impl InstructionAnalyzer for Rv64Analyzer {
    fn analyze(
        &mut self,
        target: &mut dyn ProcessControl,
        pc: u64,
    ) -> Result<InstructionEffects, AnalyzeError> {
        let word = Self::fetch(target, pc)?;
        let insn = riscv::decode(word);
        let unsupported = AnalyzeError::Unsupported { pc, word };
        let mut effects = InstructionEffects::default();
        match insn.opcode {
            opcode::LUI
            | opcode::AUIPC
            | opcode::JAL
            | opcode::JALR
            | opcode::OP_IMM
            | opcode::OP_IMM_32
            | opcode::OP
            | opcode::OP_32 => effects.registers = Self::destination(&insn),
            opcode::LOAD => {
                if insn.memory_size().is_none() {
                    return Err(unsupported);
                }
                effects.registers = Self::destination(&insn);
            }
            opcode::STORE => {
                let size = insn.memory_size().ok_or(unsupported)?;
                let base = Self::read_gpr(target, insn.rs1)?;
                let address = base.wrapping_add(insn.imm_s() as u64);
                log::trace!("Process record: store of {} bytes at {address:#x}", size.bytes());
                effects.memory.push(MemoryRange {
                    address,
                    len: size.bytes(),
                });
            }
            opcode::BRANCH | opcode::MISC_MEM => {}
            opcode::SYSTEM if insn.is_ecall() => effects.registers.push(A0),
            opcode::SYSTEM if insn.is_ebreak() => {}
            _ => return Err(unsupported),
        }
        Ok(effects)
    }

    fn pc_register(&self) -> u32 {
        PC_REGISTER
    }

    fn register_size(&self, regno: u32) -> Option<usize> {
        (regno <= PC_REGISTER).then_some(REGISTER_SIZE)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        riscv::{OperandSize, RISCVInstruction},
        vm::{Config, Vm},
    };

    fn analyze(
        insn: RISCVInstruction,
        setup: impl FnOnce(&mut Vm),
    ) -> Result<InstructionEffects, AnalyzeError> {
        let mut vm = Vm::from_text_bytes(&insn.to_bytes(), Config::default()).unwrap();
        setup(&mut vm);
        let pc = vm.pc();
        Rv64Analyzer::new().analyze(&mut vm, pc)
    }

    #[test]
    fn test_register_destinations() {
        let effects = analyze(RISCVInstruction::addi(OperandSize::S64, 1, 4, 5), |_| {}).unwrap();
        assert_eq!(effects.registers, vec![5]);
        assert!(effects.memory.is_empty());

        let effects = analyze(RISCVInstruction::add(OperandSize::S64, 1, 2, 0), |_| {}).unwrap();
        assert!(effects.registers.is_empty());

        let effects = analyze(RISCVInstruction::jal(8, 1), |_| {}).unwrap();
        assert_eq!(effects.registers, vec![1]);
    }

    #[test]
    fn test_store_range_uses_base_register() {
        let effects = analyze(RISCVInstruction::store(OperandSize::S32, 2, 3, -8), |vm| {
            vm.set_gpr(2, 0x2010).unwrap();
        })
        .unwrap();
        assert_eq!(
            effects.memory,
            vec![MemoryRange {
                address: 0x2008,
                len: 4
            }]
        );
        assert!(effects.registers.is_empty());
    }

    #[test]
    fn test_system_instructions() {
        let effects = analyze(RISCVInstruction::ecall(), |_| {}).unwrap();
        assert_eq!(effects.registers, vec![A0]);
        let effects = analyze(RISCVInstruction::ebreak(), |_| {}).unwrap();
        assert_eq!(effects, InstructionEffects::default());
    }

    #[test]
    fn test_unknown_opcode_is_unsupported() {
        let mut vm = Vm::from_text_bytes(&0xffff_ffffu32.to_le_bytes(), Config::default()).unwrap();
        let pc = vm.pc();
        assert_eq!(
            Rv64Analyzer::new().analyze(&mut vm, pc),
            Err(AnalyzeError::Unsupported {
                pc,
                word: 0xffff_ffff
            })
        );
    }

    #[test]
    fn test_register_sizes() {
        let analyzer = Rv64Analyzer::new();
        assert_eq!(analyzer.register_size(0), Some(8));
        assert_eq!(analyzer.register_size(PC_REGISTER), Some(8));
        assert_eq!(analyzer.register_size(PC_REGISTER + 1), None);
    }
}
