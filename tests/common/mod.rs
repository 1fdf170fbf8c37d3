#![allow(dead_code)]

use rand::{rngs::SmallRng, Rng};
use riscv_record::{
    memory_region::MemoryMapping,
    riscv::{assemble, OperandSize, RISCVInstruction as I},
    session::{Config, RecordingSession},
    static_analysis::Rv64Analyzer,
    target::{Direction, ProcessControl, Signal, WaitStatus},
    vm::{self, Vm},
};
use std::{cell::RefCell, rc::Rc};

pub type Session = RecordingSession<Vm, Rv64Analyzer>;

/// Registers, pc and memory of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub registers: [u64; 32],
    pub pc: u64,
    pub memory: MemoryMapping,
}

pub fn state(session: &Session) -> MachineState {
    let vm = session.target();
    MachineState {
        registers: *vm.registers(),
        pc: vm.pc(),
        memory: vm.memory().clone(),
    }
}

pub fn machine(program: &[I]) -> Vm {
    machine_with(program, vm::Config::default())
}

pub fn machine_with(program: &[I], config: vm::Config) -> Vm {
    Vm::from_text_bytes(&assemble(program), config).unwrap()
}

pub fn session(program: &[I], config: Config) -> Session {
    RecordingSession::open(machine(program), Rv64Analyzer::new(), config)
}

/// Resumes and polls `wait` until something other than "not ready" arrives
pub fn run(session: &mut Session, direction: Direction, step: bool) -> WaitStatus {
    session.resume(direction, step, Signal::NONE).unwrap();
    loop {
        match session.wait().unwrap() {
            WaitStatus::Ignore => continue,
            status => return status,
        }
    }
}

pub fn step(session: &mut Session) -> WaitStatus {
    run(session, Direction::Forward, true)
}

pub fn reverse_step(session: &mut Session) -> WaitStatus {
    run(session, Direction::Reverse, true)
}

pub fn record(session: &mut Session, count: usize) {
    for _ in 0..count {
        step(session);
    }
}

pub fn gpr(session: &Session, regno: usize) -> u64 {
    session.target().gpr(regno).unwrap()
}

pub fn read_u64(session: &mut Session, address: u64) -> u64 {
    let mut buf = [0u8; 8];
    session.target_mut().read_memory(address, &mut buf).unwrap();
    u64::from_le_bytes(buf)
}

/// `count` instructions, the n-th one writing `n` into x(5 + n % 20)
pub fn distinct_writes(count: usize) -> Vec<I> {
    let mut program: Vec<I> = (1..=count)
        .map(|n| I::addi(OperandSize::S64, 0, n as i64, 5 + (n % 20) as u8))
        .collect();
    program.push(I::ebreak());
    program
}

/// Increments x5 `count` times
pub fn counter(count: usize) -> Vec<I> {
    let mut program = vec![I::addi(OperandSize::S64, 5, 1, 5); count];
    program.push(I::ebreak());
    program
}

/// A straight-line program of register arithmetic and stack stores
pub fn random_program(rng: &mut SmallRng, len: usize) -> Vec<I> {
    let mut program = Vec::with_capacity(len + 1);
    for _ in 0..len {
        let rd = rng.gen_range(5..16u8);
        let rs1 = rng.gen_range(5..16u8);
        let rs2 = rng.gen_range(5..16u8);
        let insn = match rng.gen_range(0..7) {
            0 => I::addi(OperandSize::S64, rs1, rng.gen_range(-2048..2048), rd),
            1 => I::add(OperandSize::S64, rs1, rs2, rd),
            2 => I::mul(OperandSize::S64, rs1, rs2, rd),
            3 => I::xor(OperandSize::S64, rs1, rs2, rd),
            4 => I::lui(OperandSize::S64, rng.gen_range(0..0x10_0000), rd),
            5 => {
                let size = [OperandSize::S8, OperandSize::S16, OperandSize::S32, OperandSize::S64]
                    [rng.gen_range(0..4)];
                I::store(size, 2, rs2, -8 * rng.gen_range(1..64))
            }
            _ => I::load(OperandSize::S64, 2, -8 * rng.gen_range(1..64), rd),
        };
        program.push(insn);
    }
    program.push(I::ebreak());
    program
}

/// Confirmation capability that answers from a script and keeps the questions
#[derive(Clone, Default)]
pub struct Scripted {
    pub answers: Rc<RefCell<Vec<bool>>>,
    pub questions: Rc<RefCell<Vec<String>>>,
}

impl Scripted {
    pub fn new(answers: &[bool]) -> Self {
        let mut answers = answers.to_vec();
        answers.reverse();
        Self {
            answers: Rc::new(RefCell::new(answers)),
            questions: Rc::default(),
        }
    }

    pub fn asked(&self) -> usize {
        self.questions.borrow().len()
    }

    pub fn install(&self, session: &mut Session) {
        let script = self.clone();
        session.set_confirm(move |question: &str| {
            script.questions.borrow_mut().push(question.to_string());
            script.answers.borrow_mut().pop().unwrap_or(false)
        });
    }
}
