//! RV64IM instruction encoding and decoding.
//!
//! The builders mirror the assembler mnemonics and are used to produce
//! test programs; `decode` splits a fetched word into its fields for the
//! interpreter and the instruction analyzer.

macro_rules! exclude_operand_sizes {
    ($size:expr, $($to_exclude:path)|+ $(,)?) => {
        debug_assert!(match $size {
            $($to_exclude)|+ => false,
            _ => true,
        });
    }
}

/// Size of an encoded instruction in bytes
pub const INSN_SIZE: u64 = 4;

/// Major opcodes
pub mod opcode {
    /// LB/LH/LW/LD/LBU/LHU/LWU
    pub const LOAD: u8 = 0x03;
    /// FENCE
    pub const MISC_MEM: u8 = 0x0F;
    /// ADDI/SLTI/XORI/ORI/ANDI/SLLI/SRLI/SRAI
    pub const OP_IMM: u8 = 0x13;
    /// AUIPC
    pub const AUIPC: u8 = 0x17;
    /// ADDIW/SLLIW/SRLIW/SRAIW
    pub const OP_IMM_32: u8 = 0x1B;
    /// SB/SH/SW/SD
    pub const STORE: u8 = 0x23;
    /// Register-register ALU and M extension
    pub const OP: u8 = 0x33;
    /// LUI
    pub const LUI: u8 = 0x37;
    /// Word-sized register-register ALU and M extension
    pub const OP_32: u8 = 0x3B;
    /// BEQ/BNE/BLT/BGE/BLTU/BGEU
    pub const BRANCH: u8 = 0x63;
    /// JALR
    pub const JALR: u8 = 0x67;
    /// JAL
    pub const JAL: u8 = 0x6F;
    /// ECALL/EBREAK
    pub const SYSTEM: u8 = 0x73;
}

/// Encoding formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RISCVInstructionType {
    /// funct7 rs2 rs1 funct3 rd opcode
    R,
    /// imm[11:0] rs1 funct3 rd opcode
    I,
    /// imm[11:5] rs2 rs1 funct3 imm[4:0] opcode
    S,
    /// imm[12|10:5] rs2 rs1 funct3 imm[4:1|11] opcode
    B,
    /// imm[31:12] rd opcode
    U,
    /// imm[20|10:1|11|19:12] rd opcode
    J,
}

/// Width of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    S0 = 0,
    S8 = 8,
    S16 = 16,
    S32 = 32,
    S64 = 64,
}

impl OperandSize {
    /// Width in bytes
    pub const fn bytes(self) -> usize {
        self as usize / 8
    }

    /// funct3 of the load/store of this width
    const fn memory_funct3(self) -> u8 {
        match self {
            OperandSize::S0 | OperandSize::S8 => 0,
            OperandSize::S16 => 1,
            OperandSize::S32 => 2,
            OperandSize::S64 => 3,
        }
    }
}

/// An instruction ready to be encoded
#[derive(Debug, Clone, Copy)]
pub struct RISCVInstruction {
    inst_type: RISCVInstructionType,
    opcode: u8,
    rd: Option<u8>,
    funct3: Option<u8>,
    rs1: Option<u8>,
    rs2: Option<u8>,
    funct7: Option<u8>,
    /// Sign-extended immediate, the 20-bit field for U-type
    immediate: Option<i64>,
    size: OperandSize,
}

impl RISCVInstruction {
    /// Base for the builders, every field unset
    pub const DEFAULT: RISCVInstruction = RISCVInstruction {
        inst_type: RISCVInstructionType::R,
        opcode: 0,
        rd: None,
        funct3: None,
        rs1: None,
        rs2: None,
        funct7: None,
        immediate: None,
        size: OperandSize::S0,
    };

    /// No operation (ADDI x0, x0, 0)
    #[inline]
    pub const fn noop() -> Self {
        Self {
            inst_type: RISCVInstructionType::I,
            opcode: opcode::OP_IMM,
            rd: Some(0),
            funct3: Some(0),
            rs1: Some(0),
            immediate: Some(0),
            size: OperandSize::S32,
            ..Self::DEFAULT
        }
    }

    /// Move source to destination (ADDI rd, rs1, 0)
    #[inline]
    pub const fn mov(size: OperandSize, source: u8, destination: u8) -> Self {
        Self::addi(size, source, 0, destination)
    }

    /// Load Upper Immediate (LUI rd, imm)
    #[inline]
    pub const fn lui(size: OperandSize, immediate: i64, destination: u8) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Self {
            inst_type: RISCVInstructionType::U,
            opcode: opcode::LUI,
            rd: Some(destination),
            immediate: Some(immediate),
            size,
            ..Self::DEFAULT
        }
    }

    /// Add Upper Immediate to PC (AUIPC rd, imm)
    #[inline]
    pub const fn auipc(size: OperandSize, immediate: i64, destination: u8) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Self {
            inst_type: RISCVInstructionType::U,
            opcode: opcode::AUIPC,
            rd: Some(destination),
            immediate: Some(immediate),
            size,
            ..Self::DEFAULT
        }
    }

    const fn alu(
        size: OperandSize,
        funct7: u8,
        funct3: u8,
        source1: u8,
        source2: u8,
        destination: u8,
    ) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Self {
            inst_type: RISCVInstructionType::R,
            opcode: match size {
                OperandSize::S32 => opcode::OP_32,
                _ => opcode::OP,
            },
            rd: Some(destination),
            funct3: Some(funct3),
            rs1: Some(source1),
            rs2: Some(source2),
            funct7: Some(funct7),
            immediate: None,
            size,
        }
    }

    /// Add rs1 and rs2 to destination (ADD/ADDW rd, rs1, rs2)
    #[inline]
    pub const fn add(size: OperandSize, source1: u8, source2: u8, destination: u8) -> Self {
        Self::alu(size, 0, 0, source1, source2, destination)
    }

    /// Subtract rs2 from rs1 (SUB/SUBW rd, rs1, rs2)
    #[inline]
    pub const fn sub(size: OperandSize, source1: u8, source2: u8, destination: u8) -> Self {
        Self::alu(size, 0x20, 0, source1, source2, destination)
    }

    /// Multiply rs1 and rs2 (MUL/MULW rd, rs1, rs2)
    #[inline]
    pub const fn mul(size: OperandSize, source1: u8, source2: u8, destination: u8) -> Self {
        Self::alu(size, 1, 0, source1, source2, destination)
    }

    /// Bitwise or (OR rd, rs1, rs2)
    #[inline]
    pub const fn or(size: OperandSize, source1: u8, source2: u8, destination: u8) -> Self {
        Self::alu(size, 0, 6, source1, source2, destination)
    }

    /// Bitwise exclusive or (XOR rd, rs1, rs2)
    #[inline]
    pub const fn xor(size: OperandSize, source1: u8, source2: u8, destination: u8) -> Self {
        Self::alu(size, 0, 4, source1, source2, destination)
    }

    /// Add imm and rs1 to destination (ADDI rd, rs1, imm)
    #[inline]
    pub const fn addi(size: OperandSize, source1: u8, immediate: i64, destination: u8) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Self {
            inst_type: RISCVInstructionType::I,
            opcode: opcode::OP_IMM,
            rd: Some(destination),
            funct3: Some(0),
            rs1: Some(source1),
            immediate: Some(immediate),
            size,
            ..Self::DEFAULT
        }
    }

    /// Logical left shift (SLLI rd, rs1, imm)
    #[inline]
    pub const fn slli(size: OperandSize, source1: u8, immediate: i64, destination: u8) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Self {
            inst_type: RISCVInstructionType::I,
            opcode: opcode::OP_IMM,
            rd: Some(destination),
            funct3: Some(1),
            rs1: Some(source1),
            immediate: Some(immediate & 0x3F),
            size,
            ..Self::DEFAULT
        }
    }

    /// Add imm and rs1, keeping the sign-extended low 32 bits (ADDIW rd, rs1, imm)
    #[inline]
    pub const fn addiw(size: OperandSize, source1: u8, immediate: i64, destination: u8) -> Self {
        exclude_operand_sizes!(
            size,
            OperandSize::S0 | OperandSize::S8 | OperandSize::S16 | OperandSize::S32
        );
        Self {
            inst_type: RISCVInstructionType::I,
            opcode: opcode::OP_IMM_32,
            rd: Some(destination),
            funct3: Some(0),
            rs1: Some(source1),
            immediate: Some(immediate),
            size,
            ..Self::DEFAULT
        }
    }

    /// Sign-extending load (LB/LH/LW/LD rd, offset(rs1))
    #[inline]
    pub const fn load(size: OperandSize, source1: u8, offset: i64, destination: u8) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0);
        Self {
            inst_type: RISCVInstructionType::I,
            opcode: opcode::LOAD,
            rd: Some(destination),
            funct3: Some(size.memory_funct3()),
            rs1: Some(source1),
            immediate: Some(offset),
            size,
            ..Self::DEFAULT
        }
    }

    /// Store (SB/SH/SW/SD rs2, offset(rs1))
    #[inline]
    pub const fn store(size: OperandSize, source1: u8, source2: u8, offset: i64) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0);
        Self {
            inst_type: RISCVInstructionType::S,
            opcode: opcode::STORE,
            funct3: Some(size.memory_funct3()),
            rs1: Some(source1),
            rs2: Some(source2),
            immediate: Some(offset),
            size,
            ..Self::DEFAULT
        }
    }

    const fn branch(funct3: u8, source1: u8, source2: u8, offset: i64) -> Self {
        Self {
            inst_type: RISCVInstructionType::B,
            opcode: opcode::BRANCH,
            funct3: Some(funct3),
            rs1: Some(source1),
            rs2: Some(source2),
            immediate: Some(offset),
            size: OperandSize::S64,
            ..Self::DEFAULT
        }
    }

    /// Branch if equal (BEQ rs1, rs2, offset)
    #[inline]
    pub const fn beq(source1: u8, source2: u8, offset: i64) -> Self {
        Self::branch(0, source1, source2, offset)
    }

    /// Branch if not equal (BNE rs1, rs2, offset)
    #[inline]
    pub const fn bne(source1: u8, source2: u8, offset: i64) -> Self {
        Self::branch(1, source1, source2, offset)
    }

    /// Branch if less than, signed (BLT rs1, rs2, offset)
    #[inline]
    pub const fn blt(source1: u8, source2: u8, offset: i64) -> Self {
        Self::branch(4, source1, source2, offset)
    }

    /// Jump and link (JAL rd, offset)
    #[inline]
    pub const fn jal(offset: i64, destination: u8) -> Self {
        Self {
            inst_type: RISCVInstructionType::J,
            opcode: opcode::JAL,
            rd: Some(destination),
            immediate: Some(offset),
            size: OperandSize::S64,
            ..Self::DEFAULT
        }
    }

    /// Jump and link register (JALR rd, offset(rs1))
    #[inline]
    pub const fn jalr(source1: u8, offset: i64, destination: u8) -> Self {
        Self {
            inst_type: RISCVInstructionType::I,
            opcode: opcode::JALR,
            rd: Some(destination),
            funct3: Some(0),
            rs1: Some(source1),
            immediate: Some(offset),
            size: OperandSize::S64,
            ..Self::DEFAULT
        }
    }

    /// Environment call
    #[inline]
    pub const fn ecall() -> Self {
        Self {
            inst_type: RISCVInstructionType::I,
            opcode: opcode::SYSTEM,
            rd: Some(0),
            funct3: Some(0),
            rs1: Some(0),
            immediate: Some(0),
            ..Self::DEFAULT
        }
    }

    /// Breakpoint trap
    #[inline]
    pub const fn ebreak() -> Self {
        Self {
            immediate: Some(1),
            ..Self::ecall()
        }
    }

    /// Encoding format
    pub fn inst_type(&self) -> RISCVInstructionType {
        self.inst_type
    }

    /// Operation width
    pub fn size(&self) -> OperandSize {
        self.size
    }

    /// Encodes the instruction. Missing fields encode as zero.
    pub fn emit(&self) -> u32 {
        let imm = self.immediate.unwrap_or(0) as u32;
        let rd = u32::from(self.rd.unwrap_or(0) & 0x1F) << 7;
        let rs1 = u32::from(self.rs1.unwrap_or(0) & 0x1F) << 15;
        let rs2 = u32::from(self.rs2.unwrap_or(0) & 0x1F) << 20;
        let funct3 = u32::from(self.funct3.unwrap_or(0) & 0x07) << 12;
        let funct7 = u32::from(self.funct7.unwrap_or(0) & 0x7F) << 25;
        let opcode = u32::from(self.opcode & 0x7F);
        match self.inst_type {
            RISCVInstructionType::R => funct7 | rs2 | rs1 | funct3 | rd | opcode,
            RISCVInstructionType::I => ((imm & 0xFFF) << 20) | rs1 | funct3 | rd | opcode,
            RISCVInstructionType::S => {
                ((imm >> 5 & 0x7F) << 25) | rs2 | rs1 | funct3 | ((imm & 0x1F) << 7) | opcode
            }
            RISCVInstructionType::B => {
                ((imm >> 12 & 1) << 31)
                    | ((imm >> 5 & 0x3F) << 25)
                    | rs2
                    | rs1
                    | funct3
                    | ((imm >> 1 & 0xF) << 8)
                    | ((imm >> 11 & 1) << 7)
                    | opcode
            }
            RISCVInstructionType::U => ((imm & 0xFFFFF) << 12) | rd | opcode,
            RISCVInstructionType::J => {
                ((imm >> 20 & 1) << 31)
                    | ((imm >> 1 & 0x3FF) << 21)
                    | ((imm >> 11 & 1) << 20)
                    | ((imm >> 12 & 0xFF) << 12)
                    | rd
                    | opcode
            }
        }
    }

    /// Little-endian bytes of the encoding
    pub fn to_bytes(&self) -> [u8; 4] {
        self.emit().to_le_bytes()
    }
}

/// Concatenates the encodings of `instructions`
pub fn assemble(instructions: &[RISCVInstruction]) -> Vec<u8> {
    instructions.iter().flat_map(|insn| insn.to_bytes()).collect()
}

/// Fields of a fetched instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub word: u32,
    /// Major opcode
    pub opcode: u8,
    pub rd: u8,
    pub funct3: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub funct7: u8,
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((u64::from(value) << shift) as i64) >> shift
}

impl DecodedInstruction {
    pub fn imm_i(&self) -> i64 {
        sign_extend(self.word >> 20, 12)
    }

    pub fn imm_s(&self) -> i64 {
        sign_extend(((self.word >> 25) << 5) | ((self.word >> 7) & 0x1F), 12)
    }

    pub fn imm_b(&self) -> i64 {
        let w = self.word;
        let imm = ((w >> 31 & 1) << 12)
            | ((w >> 7 & 1) << 11)
            | ((w >> 25 & 0x3F) << 5)
            | ((w >> 8 & 0xF) << 1);
        sign_extend(imm, 13)
    }

    /// U-type immediate, already shifted into place
    pub fn imm_u(&self) -> i64 {
        i64::from((self.word & 0xFFFF_F000) as i32)
    }

    /// J-type immediate
    pub fn imm_j(&self) -> i64 {
        let w = self.word;
        let imm = ((w >> 31 & 1) << 20)
            | ((w >> 12 & 0xFF) << 12)
            | ((w >> 20 & 1) << 11)
            | ((w >> 21 & 0x3FF) << 1);
        sign_extend(imm, 21)
    }

    /// Width of a load or store, `None` for an invalid funct3
    pub fn memory_size(&self) -> Option<OperandSize> {
        match (self.opcode, self.funct3) {
            (opcode::STORE, 4..) => None,
            (_, 0 | 4) => Some(OperandSize::S8),
            (_, 1 | 5) => Some(OperandSize::S16),
            (_, 2 | 6) => Some(OperandSize::S32),
            (_, 3) => Some(OperandSize::S64),
            _ => None,
        }
    }

    /// Whether this is ECALL
    pub fn is_ecall(&self) -> bool {
        self.word == RISCVInstruction::ecall().emit()
    }

    /// Whether this is EBREAK
    pub fn is_ebreak(&self) -> bool {
        self.word == RISCVInstruction::ebreak().emit()
    }
}

/// Splits an instruction word into its fields
pub fn decode(word: u32) -> DecodedInstruction {
    DecodedInstruction {
        word,
        opcode: (word & 0x7F) as u8,
        rd: (word >> 7 & 0x1F) as u8,
        funct3: (word >> 12 & 0x7) as u8,
        rs1: (word >> 15 & 0x1F) as u8,
        rs2: (word >> 20 & 0x1F) as u8,
        funct7: (word >> 25) as u8,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(RISCVInstruction::noop().emit(), 0x0000_0013);
        assert_eq!(RISCVInstruction::addi(OperandSize::S64, 0, 5, 10).emit(), 0x0050_0513);
        assert_eq!(RISCVInstruction::add(OperandSize::S64, 11, 12, 10).emit(), 0x00c5_8533);
        assert_eq!(RISCVInstruction::sub(OperandSize::S64, 11, 12, 10).emit(), 0x40c5_8533);
        assert_eq!(RISCVInstruction::lui(OperandSize::S64, 0x12345, 5).emit(), 0x1234_52b7);
        assert_eq!(RISCVInstruction::store(OperandSize::S64, 2, 1, 8).emit(), 0x0011_3423);
        assert_eq!(RISCVInstruction::load(OperandSize::S32, 2, -4, 5).emit(), 0xffc1_2283);
        assert_eq!(RISCVInstruction::ecall().emit(), 0x0000_0073);
        assert_eq!(RISCVInstruction::ebreak().emit(), 0x0010_0073);
        assert_eq!(RISCVInstruction::jal(8, 1).emit(), 0x0080_00ef);
    }

    #[test]
    fn test_immediates_decode_back() {
        let store = decode(RISCVInstruction::store(OperandSize::S16, 3, 4, -20).emit());
        assert_eq!(store.imm_s(), -20);
        assert_eq!(store.memory_size(), Some(OperandSize::S16));

        let branch = decode(RISCVInstruction::bne(5, 6, -4094).emit());
        assert_eq!((branch.rs1, branch.rs2, branch.imm_b()), (5, 6, -4094));

        let jump = decode(RISCVInstruction::jal(-1_048_574, 0).emit());
        assert_eq!(jump.imm_j(), -1_048_574);

        let upper = decode(RISCVInstruction::lui(OperandSize::S64, 0xFFFFF, 1).emit());
        assert_eq!(upper.imm_u(), -4096);

        let load = decode(RISCVInstruction::load(OperandSize::S64, 2, 2047, 7).emit());
        assert_eq!((load.imm_i(), load.memory_size()), (2047, Some(OperandSize::S64)));
    }

    #[test]
    fn test_system_instructions() {
        assert!(decode(0x0000_0073).is_ecall());
        assert!(decode(0x0010_0073).is_ebreak());
        assert!(!decode(0x0000_0013).is_ecall());
    }
}
