//! Reference RV64IM machine used as the debuggee.
//!
//! The machine implements [`ProcessControl`], so a recording session can
//! sit on top of it exactly as it would on top of a real process.
//! `resume` runs eagerly; the resulting stop is then withheld from `wait`
//! for [`Config::wait_latency`] polls to model an asynchronous target.

use crate::{
    breakpoints::BreakpointSite,
    elf::{ElfError, Executable},
    memory_region::{AccessType, MemoryMapping, MemoryRegion},
    riscv::{self, opcode, DecodedInstruction, INSN_SIZE},
    static_analysis::{A0, GPR_COUNT, PC_REGISTER, REGISTER_SIZE},
    target::{
        AddressSpaceId, MemoryRange, ProcessControl, Signal, StopReason, TargetError, WaitStatus,
    },
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Start of the stack region
pub const MM_STACK_START: u64 = 0x3fff_0000;
/// Magic of a machine snapshot
const SNAPSHOT_MAGIC: u32 = 0x5256_534e;

/// Syscall number register (a7)
const A7: usize = 17;
const SYS_WRITE: u64 = 64;
const SYS_EXIT: u64 = 93;
const ENOSYS: i64 = 38;
const MAX_WRITE_LEN: usize = 0x10_0000;

/// VM configuration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of instructions a single continue may execute, 0 for no limit
    pub instruction_meter: u64,
    /// Number of `wait` polls that report "not ready" before each stop
    pub wait_latency: u32,
    /// Size of the stack region in bytes
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instruction_meter: 0,
            wait_latency: 0,
            stack_size: 0x1_0000,
        }
    }
}

impl Config {
    /// One past the highest stack address, the initial stack pointer
    pub fn stack_top(&self) -> u64 {
        MM_STACK_START + self.stack_size as u64
    }
}

/// Control flow after one instruction
enum Flow {
    Next,
    Jump(u64),
    Break,
    Exit(i32),
}

/// Stop withheld from `wait`
#[derive(Debug, Clone, Copy)]
struct PendingStop {
    status: WaitStatus,
    polls_left: u32,
}

/// The reference machine
#[derive(Debug, Clone)]
pub struct Vm {
    config: Config,
    registers: [u64; GPR_COUNT as usize],
    pc: u64,
    memory: MemoryMapping,
    breakpoints: Vec<BreakpointSite>,
    watchpoints: Vec<MemoryRange>,
    pending: Option<PendingStop>,
    watchpoint_hit: bool,
    exit_code: Option<i32>,
    instruction_count: u64,
    output: Vec<u8>,
}

impl Vm {
    /// Maps `executable` and a stack, ready to run from its entry point
    pub fn new(executable: Executable, config: Config) -> Result<Self, TargetError> {
        let entry = executable.entry();
        let mut regions = executable.into_regions();
        regions.push(MemoryRegion::new_zeroed(config.stack_size, MM_STACK_START));
        let mut registers = [0; GPR_COUNT as usize];
        registers[2] = config.stack_top();
        Ok(Self {
            config,
            registers,
            pc: entry,
            memory: MemoryMapping::new(regions)?,
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            pending: None,
            watchpoint_hit: false,
            exit_code: None,
            instruction_count: 0,
            output: Vec::new(),
        })
    }

    /// Creates a machine from raw machine code mapped at the default text address
    pub fn from_text_bytes(text: &[u8], config: Config) -> Result<Self, TargetError> {
        let executable = Executable::from_text_bytes(text, crate::elf::MM_TEXT_START)
            .map_err(|_| TargetError::MemoryAccess {
                address: crate::elf::MM_TEXT_START,
                len: text.len(),
            })?;
        Self::new(executable, config)
    }

    /// Creates a machine from an ELF file or a flat binary
    pub fn from_elf(bytes: &[u8], config: Config) -> Result<Self, VmError> {
        let executable = Executable::from_bytes(bytes)?;
        Ok(Self::new(executable, config)?)
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// General purpose register `regno`, `None` past x31
    pub fn gpr(&self, regno: usize) -> Option<u64> {
        self.registers.get(regno).copied()
    }

    /// Sets a general purpose register; x0 stays zero
    pub fn set_gpr(&mut self, regno: usize, value: u64) -> Result<(), TargetError> {
        if regno >= GPR_COUNT as usize {
            return Err(TargetError::RegisterUnavailable(regno as u32));
        }
        self.write_gpr(regno, value);
        Ok(())
    }

    fn write_gpr(&mut self, regno: usize, value: u64) {
        if regno == 0 {
            return;
        }
        if let Some(slot) = self.registers.get_mut(regno) {
            *slot = value;
        }
    }

    pub fn registers(&self) -> &[u64; GPR_COUNT as usize] {
        &self.registers
    }

    pub fn memory(&self) -> &MemoryMapping {
        &self.memory
    }

    /// Exit status once the program has exited
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Number of instructions retired so far
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Bytes the program wrote to its standard output
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Installs a hardware watchpoint on stores into the range
    pub fn insert_watchpoint(&mut self, address: u64, len: usize) -> Result<(), TargetError> {
        if !self.memory.is_accessible(AccessType::Load, address, len) {
            return Err(TargetError::MemoryAccess { address, len });
        }
        let range = MemoryRange { address, len };
        if !self.watchpoints.contains(&range) {
            self.watchpoints.push(range);
        }
        Ok(())
    }

    /// Removes a watchpoint installed with [`Self::insert_watchpoint`]
    pub fn remove_watchpoint(&mut self, address: u64, len: usize) -> Result<(), TargetError> {
        let range = MemoryRange { address, len };
        let index = self
            .watchpoints
            .iter()
            .position(|watch| *watch == range)
            .ok_or(TargetError::MemoryAccess { address, len })?;
        self.watchpoints.remove(index);
        Ok(())
    }

    fn watched(&self, address: u64, len: usize) -> bool {
        let end = address.saturating_add(len as u64);
        self.watchpoints.iter().any(|watch| {
            address < watch.address.saturating_add(watch.len as u64) && watch.address < end
        })
    }

    fn load(&self, address: u64, len: usize) -> Result<u64, Signal> {
        let mut buf = [0u8; 8];
        self.memory
            .load(address, &mut buf[..len])
            .map_err(|_| Signal::SEGV)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn store(&mut self, address: u64, len: usize, value: u64) -> Result<(), Signal> {
        let bytes = value.to_le_bytes();
        self.memory
            .store(AccessType::Store, address, &bytes[..len])
            .map_err(|_| Signal::SEGV)?;
        if self.watched(address, len) {
            self.watchpoint_hit = true;
        }
        Ok(())
    }

    fn syscall(&mut self) -> Result<Flow, Signal> {
        let a0 = self.registers[A0 as usize];
        match self.registers[A7] {
            SYS_EXIT => return Ok(Flow::Exit(a0 as i32)),
            SYS_WRITE => {
                let address = self.registers[11];
                let len = self.registers[12] as usize;
                if len > MAX_WRITE_LEN {
                    return Err(Signal::SEGV);
                }
                let mut buf = vec![0u8; len];
                self.memory
                    .load(address, &mut buf)
                    .map_err(|_| Signal::SEGV)?;
                self.output.extend_from_slice(&buf);
                self.write_gpr(A0 as usize, len as u64);
            }
            number => {
                log::debug!("VM: unknown syscall {number}");
                self.write_gpr(A0 as usize, (-ENOSYS) as u64);
            }
        }
        Ok(Flow::Next)
    }

    fn alu(funct7: u8, funct3: u8, a: u64, b: u64) -> Result<u64, Signal> {
        let shamt = (b & 0x3F) as u32;
        let result = match (funct7, funct3) {
            (0x00, 0) => a.wrapping_add(b),
            (0x20, 0) => a.wrapping_sub(b),
            (0x00, 1) => a << shamt,
            (0x00, 2) => u64::from((a as i64) < (b as i64)),
            (0x00, 3) => u64::from(a < b),
            (0x00, 4) => a ^ b,
            (0x00, 5) => a >> shamt,
            (0x20, 5) => ((a as i64) >> shamt) as u64,
            (0x00, 6) => a | b,
            (0x00, 7) => a & b,
            (0x01, 0) => a.wrapping_mul(b),
            (0x01, 1) => ((i128::from(a as i64) * i128::from(b as i64)) >> 64) as u64,
            (0x01, 2) => ((i128::from(a as i64) * i128::from(b)) >> 64) as u64,
            (0x01, 3) => ((u128::from(a) * u128::from(b)) >> 64) as u64,
            (0x01, 4) if b == 0 => u64::MAX,
            (0x01, 4) => (a as i64).wrapping_div(b as i64) as u64,
            (0x01, 5) => a.checked_div(b).unwrap_or(u64::MAX),
            (0x01, 6) if b == 0 => a,
            (0x01, 6) => (a as i64).wrapping_rem(b as i64) as u64,
            (0x01, 7) => a.checked_rem(b).unwrap_or(a),
            _ => return Err(Signal::ILL),
        };
        Ok(result)
    }

    fn alu_word(funct7: u8, funct3: u8, a: u64, b: u64) -> Result<u64, Signal> {
        let (a, b) = (a as u32, b as u32);
        let shamt = b & 0x1F;
        let result = match (funct7, funct3) {
            (0x00, 0) => a.wrapping_add(b),
            (0x20, 0) => a.wrapping_sub(b),
            (0x00, 1) => a << shamt,
            (0x00, 5) => a >> shamt,
            (0x20, 5) => ((a as i32) >> shamt) as u32,
            (0x01, 0) => a.wrapping_mul(b),
            (0x01, 4) if b == 0 => u32::MAX,
            (0x01, 4) => (a as i32).wrapping_div(b as i32) as u32,
            (0x01, 5) => a.checked_div(b).unwrap_or(u32::MAX),
            (0x01, 6) if b == 0 => a,
            (0x01, 6) => (a as i32).wrapping_rem(b as i32) as u32,
            (0x01, 7) => a.checked_rem(b).unwrap_or(a),
            _ => return Err(Signal::ILL),
        };
        Ok(i64::from(result as i32) as u64)
    }

    fn execute(&mut self, insn: &DecodedInstruction) -> Result<Flow, Signal> {
        let rd = usize::from(insn.rd);
        let rs1 = self.registers[usize::from(insn.rs1)];
        let rs2 = self.registers[usize::from(insn.rs2)];
        match insn.opcode {
            opcode::LUI => self.write_gpr(rd, insn.imm_u() as u64),
            opcode::AUIPC => self.write_gpr(rd, self.pc.wrapping_add(insn.imm_u() as u64)),
            opcode::JAL => {
                self.write_gpr(rd, self.pc.wrapping_add(INSN_SIZE));
                return Ok(Flow::Jump(self.pc.wrapping_add(insn.imm_j() as u64)));
            }
            opcode::JALR if insn.funct3 == 0 => {
                let target = rs1.wrapping_add(insn.imm_i() as u64) & !1;
                self.write_gpr(rd, self.pc.wrapping_add(INSN_SIZE));
                return Ok(Flow::Jump(target));
            }
            opcode::BRANCH => {
                let taken = match insn.funct3 {
                    0 => rs1 == rs2,
                    1 => rs1 != rs2,
                    4 => (rs1 as i64) < (rs2 as i64),
                    5 => (rs1 as i64) >= (rs2 as i64),
                    6 => rs1 < rs2,
                    7 => rs1 >= rs2,
                    _ => return Err(Signal::ILL),
                };
                if taken {
                    return Ok(Flow::Jump(self.pc.wrapping_add(insn.imm_b() as u64)));
                }
            }
            opcode::LOAD => {
                let size = insn.memory_size().ok_or(Signal::ILL)?.bytes();
                let address = rs1.wrapping_add(insn.imm_i() as u64);
                let raw = self.load(address, size)?;
                let value = match insn.funct3 {
                    0 => i64::from(raw as i8) as u64,
                    1 => i64::from(raw as i16) as u64,
                    2 => i64::from(raw as i32) as u64,
                    _ => raw,
                };
                self.write_gpr(rd, value);
            }
            opcode::STORE => {
                let size = insn.memory_size().ok_or(Signal::ILL)?.bytes();
                let address = rs1.wrapping_add(insn.imm_s() as u64);
                self.store(address, size, rs2)?;
            }
            opcode::OP_IMM => {
                let imm = insn.imm_i() as u64;
                let value = match insn.funct3 {
                    1 if insn.funct7 >> 1 == 0 => Self::alu(0, 1, rs1, imm)?,
                    5 if insn.funct7 >> 1 == 0 => Self::alu(0, 5, rs1, imm)?,
                    5 if insn.funct7 >> 1 == 0x10 => Self::alu(0x20, 5, rs1, imm)?,
                    1 | 5 => return Err(Signal::ILL),
                    funct3 => Self::alu(0, funct3, rs1, imm)?,
                };
                self.write_gpr(rd, value);
            }
            opcode::OP_IMM_32 => {
                let imm = insn.imm_i() as u64;
                let value = match (insn.funct3, insn.funct7) {
                    (0, _) => Self::alu_word(0, 0, rs1, imm)?,
                    (1, 0) | (5, 0) | (5, 0x20) => {
                        Self::alu_word(insn.funct7, insn.funct3, rs1, imm)?
                    }
                    _ => return Err(Signal::ILL),
                };
                self.write_gpr(rd, value);
            }
            opcode::OP => {
                let value = Self::alu(insn.funct7, insn.funct3, rs1, rs2)?;
                self.write_gpr(rd, value);
            }
            opcode::OP_32 => {
                let value = Self::alu_word(insn.funct7, insn.funct3, rs1, rs2)?;
                self.write_gpr(rd, value);
            }
            opcode::MISC_MEM => {}
            opcode::SYSTEM if insn.is_ecall() => return self.syscall(),
            opcode::SYSTEM if insn.is_ebreak() => return Ok(Flow::Break),
            _ => return Err(Signal::ILL),
        }
        Ok(Flow::Next)
    }

    /// Executes one instruction, returning the stop it causes if any
    fn step_instruction(&mut self) -> Option<WaitStatus> {
        let word = match self.load(self.pc, INSN_SIZE as usize) {
            Ok(word) => word as u32,
            Err(signal) => return Some(WaitStatus::stopped(StopReason::None, signal)),
        };
        let insn = riscv::decode(word);
        let flow = match self.execute(&insn) {
            Ok(flow) => flow,
            Err(signal) => {
                log::debug!("VM: {signal} at {:#x} ({word:#010x})", self.pc);
                return Some(WaitStatus::stopped(StopReason::None, signal));
            }
        };
        self.instruction_count += 1;
        match flow {
            Flow::Next => self.pc = self.pc.wrapping_add(INSN_SIZE),
            Flow::Jump(target) => self.pc = target,
            Flow::Break => {
                self.pc = self.pc.wrapping_add(INSN_SIZE);
                return Some(WaitStatus::stopped(
                    StopReason::SoftwareBreakpoint,
                    Signal::TRAP,
                ));
            }
            Flow::Exit(code) => {
                log::debug!("VM: exited with status {code}");
                self.exit_code = Some(code);
                return Some(WaitStatus::Exited(code));
            }
        }
        if self.watchpoint_hit {
            return Some(WaitStatus::stopped(StopReason::Watchpoint, Signal::TRAP));
        }
        None
    }

    fn run(&mut self, step: bool) -> WaitStatus {
        let mut executed = 0;
        loop {
            if let Some(status) = self.step_instruction() {
                return status;
            }
            executed += 1;
            if step {
                return WaitStatus::stopped(StopReason::SingleStep, Signal::TRAP);
            }
            let here = BreakpointSite::new(self.pc);
            if self.breakpoints.contains(&here) {
                return WaitStatus::stopped(StopReason::SoftwareBreakpoint, Signal::TRAP);
            }
            if self.config.instruction_meter != 0 && executed >= self.config.instruction_meter {
                return WaitStatus::stopped(StopReason::None, Signal::XCPU);
            }
        }
    }

    fn check_register(regno: u32, len: usize) -> Result<(), TargetError> {
        if regno > PC_REGISTER || len != REGISTER_SIZE {
            return Err(TargetError::RegisterUnavailable(regno));
        }
        Ok(())
    }

    fn snapshot_error(err: io::Error) -> TargetError {
        TargetError::Snapshot(err.to_string())
    }
}

/// Failures while creating a machine from a program file
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VmError {
    /// The program could not be loaded
    #[error(transparent)]
    Elf(#[from] ElfError),
    /// The program could not be mapped
    #[error(transparent)]
    Target(#[from] TargetError),
}

impl ProcessControl for Vm {
    fn resume(&mut self, step: bool, signal: Signal) -> Result<(), TargetError> {
        if self.exit_code.is_some() {
            return Err(TargetError::NotRunning);
        }
        if self.pending.is_some() {
            return Err(TargetError::AlreadyRunning);
        }
        if signal.is_some() {
            log::debug!("VM: no handler for {signal}, discarded");
        }
        self.watchpoint_hit = false;
        let status = self.run(step);
        self.pending = Some(PendingStop {
            status,
            polls_left: self.config.wait_latency,
        });
        Ok(())
    }

    fn wait(&mut self) -> Result<WaitStatus, TargetError> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(TargetError::NotRunning);
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(WaitStatus::Ignore);
        }
        let status = pending.status;
        self.pending = None;
        Ok(status)
    }

    fn read_register(&mut self, regno: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        Self::check_register(regno, buf.len())?;
        let value = if regno == PC_REGISTER {
            self.pc
        } else {
            self.registers[regno as usize]
        };
        buf.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write_register(&mut self, regno: u32, value: &[u8]) -> Result<(), TargetError> {
        Self::check_register(regno, value.len())?;
        let mut bytes = [0u8; REGISTER_SIZE];
        bytes.copy_from_slice(value);
        let value = u64::from_le_bytes(bytes);
        if regno == PC_REGISTER {
            self.pc = value;
        } else {
            self.write_gpr(regno as usize, value);
        }
        Ok(())
    }

    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        self.memory.load(address, buf)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), TargetError> {
        self.memory.store(AccessType::Patch, address, data)
    }

    fn read_pc(&mut self) -> Result<u64, TargetError> {
        Ok(self.pc)
    }

    fn insert_breakpoint(&mut self, site: BreakpointSite) -> Result<(), TargetError> {
        if !self
            .memory
            .is_accessible(AccessType::Load, site.address, INSN_SIZE as usize)
        {
            return Err(TargetError::Breakpoint(site.address));
        }
        if !self.breakpoints.contains(&site) {
            self.breakpoints.push(site);
        }
        Ok(())
    }

    fn remove_breakpoint(&mut self, site: BreakpointSite) -> Result<(), TargetError> {
        let index = self
            .breakpoints
            .iter()
            .position(|installed| *installed == site)
            .ok_or(TargetError::Breakpoint(site.address))?;
        self.breakpoints.remove(index);
        Ok(())
    }

    fn stopped_by_watchpoint(&mut self) -> bool {
        self.watchpoint_hit
    }

    fn watchpoint_in_range(&self, address_space: AddressSpaceId, address: u64, len: usize) -> bool {
        address_space == self.address_space() && self.watched(address, len)
    }

    fn inserted_breakpoints(&self) -> Vec<BreakpointSite> {
        self.breakpoints.clone()
    }

    fn write_snapshot(&mut self, writer: &mut dyn io::Write) -> Result<(), TargetError> {
        writer
            .write_u32::<LittleEndian>(SNAPSHOT_MAGIC)
            .map_err(Self::snapshot_error)?;
        for value in self.registers.iter().chain([self.pc].iter()) {
            writer
                .write_u64::<LittleEndian>(*value)
                .map_err(Self::snapshot_error)?;
        }
        self.memory.write_to(writer).map_err(Self::snapshot_error)
    }

    fn read_snapshot(&mut self, reader: &mut dyn io::Read) -> Result<(), TargetError> {
        let magic = reader
            .read_u32::<LittleEndian>()
            .map_err(Self::snapshot_error)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(TargetError::Snapshot(format!(
                "bad machine snapshot magic {magic:#x}"
            )));
        }
        let mut registers = [0u64; GPR_COUNT as usize];
        for value in registers.iter_mut() {
            *value = reader
                .read_u64::<LittleEndian>()
                .map_err(Self::snapshot_error)?;
        }
        let pc = reader
            .read_u64::<LittleEndian>()
            .map_err(Self::snapshot_error)?;
        let memory = MemoryMapping::read_from(reader).map_err(Self::snapshot_error)?;
        registers[0] = 0;
        self.registers = registers;
        self.pc = pc;
        self.memory = memory;
        self.pending = None;
        self.exit_code = None;
        self.watchpoint_hit = false;
        log::debug!("VM: snapshot restored at pc {pc:#x}");
        Ok(())
    }
}
