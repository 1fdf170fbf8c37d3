use clap::Parser;
use riscv_record::{
    breakpoints::BreakpointSite,
    session::{Config, RecordingSession, DEFAULT_CAPACITY},
    static_analysis::{Rv64Analyzer, GPR_COUNT, PC_REGISTER},
    target::{Direction, HistoryEdge, ProcessControl, Signal, WaitStatus},
    vm::{self, Vm},
    RecordError,
};
use std::{
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
    process::ExitCode,
};

type Session = RecordingSession<Vm, Rv64Analyzer>;

#[derive(Parser, Debug)]
#[command(name = "riscv-record")]
#[command(about = "Record, replay and rewind RV64IM programs")]
struct Args {
    /// ELF executable or flat binary to debug
    program: PathBuf,
    /// Maximum number of logged instructions, 0 for unlimited
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,
    /// Evict old instructions without asking when the log is full
    #[arg(long, default_value_t = false)]
    no_stop_at_limit: bool,
    /// Discard recorded history on direct writes without asking
    #[arg(long, default_value_t = false)]
    no_confirm_divergence: bool,
    /// Ask before logging a memory change that cannot be read
    #[arg(long, default_value_t = false)]
    memory_query: bool,
    /// Answer every question with yes
    #[arg(long, short = 'y', default_value_t = false)]
    yes: bool,
    /// Load a saved recording before reading commands
    #[arg(long)]
    restore: Option<PathBuf>,
    /// Polls the machine answers with "not ready" before each stop
    #[arg(long, default_value_t = 0)]
    wait_latency: u32,
}

fn ask(question: &str) -> bool {
    print!("{question} (y or n) ");
    let _ = io::stdout().flush();
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}

fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text
            .parse::<u64>()
            .ok()
            .or_else(|| text.parse::<i64>().ok().map(|value| value as u64)),
    }
}

fn parse_register(text: &str) -> Option<u32> {
    if text == "pc" {
        return Some(PC_REGISTER);
    }
    let regno = text.strip_prefix('x').unwrap_or(text).parse::<u32>().ok()?;
    (regno <= PC_REGISTER).then_some(regno)
}

fn parse_switch(text: Option<&str>) -> Option<bool> {
    match text? {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// Resumes and polls until the session reports something
fn run(session: &mut Session, direction: Direction, step: bool) -> Result<WaitStatus, RecordError> {
    session.resume(direction, step, Signal::NONE)?;
    loop {
        match session.wait()? {
            WaitStatus::Ignore => std::thread::yield_now(),
            status => return Ok(status),
        }
    }
}

fn report(session: &mut Session, status: WaitStatus) {
    let pc = session.target_mut().read_pc().unwrap_or_default();
    match status {
        WaitStatus::Stopped(event) => {
            println!("Stopped at {pc:#x}: {} ({:?})", event.signal, event.reason)
        }
        WaitStatus::Exited(code) => println!("Program exited with code {code}"),
        WaitStatus::NoHistory(HistoryEdge::Begin) => {
            println!("No more reverse-execution history.\n{pc:#x} (beginning of log)")
        }
        WaitStatus::NoHistory(HistoryEdge::End) => {
            println!("No more reverse-execution history.\n{pc:#x} (end of log)")
        }
        WaitStatus::Ignore => {}
    }
}

fn print_registers(session: &mut Session) -> Result<(), RecordError> {
    for regno in 0..GPR_COUNT {
        let value = session.read_register(regno)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&value);
        print!("x{regno:<2} {:#018x}", u64::from_le_bytes(bytes));
        if regno % 4 == 3 {
            println!();
        } else {
            print!("  ");
        }
    }
    println!("pc  {:#018x}", session.target_mut().read_pc()?);
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

fn usage(text: &str) -> Result<Flow, RecordError> {
    println!("Usage: {text}");
    Ok(Flow::Continue)
}

fn execute(session: &mut Session, line: &str) -> Result<Flow, RecordError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["quit" | "q"] => return Ok(Flow::Quit),
        ["stepi" | "si"] => {
            let status = run(session, Direction::Forward, true)?;
            report(session, status);
        }
        ["continue" | "c"] => {
            let status = run(session, Direction::Forward, false)?;
            report(session, status);
        }
        ["reverse-stepi" | "rsi"] => {
            let status = run(session, Direction::Reverse, true)?;
            report(session, status);
        }
        ["reverse-continue" | "rc"] => {
            let status = run(session, Direction::Reverse, false)?;
            report(session, status);
        }
        ["info", "record"] => println!("{}", session.info()),
        ["regs"] => print_registers(session)?,
        ["x", address, len] => {
            let (Some(address), Some(len)) = (parse_number(address), parse_number(len)) else {
                return usage("x ADDR LEN");
            };
            let bytes = session.read_memory(address, len as usize)?;
            for (row, chunk) in bytes.chunks(16).enumerate() {
                print!("{:#x}:", address + row as u64 * 16);
                for byte in chunk {
                    print!(" {byte:02x}");
                }
                println!();
            }
        }
        ["set", "reg", regno, value] => {
            let (Some(regno), Some(value)) = (parse_register(regno), parse_number(value)) else {
                return usage("set reg N VALUE");
            };
            session.store_register(regno, &value.to_le_bytes())?;
        }
        ["break" | "b", address] => {
            let Some(address) = parse_number(address) else {
                return usage("break ADDR");
            };
            session.insert_breakpoint(BreakpointSite::new(address))?;
            println!("Breakpoint at {address:#x}");
        }
        ["delete", address] => {
            let Some(address) = parse_number(address) else {
                return usage("delete ADDR");
            };
            session.remove_breakpoint(BreakpointSite::new(address))?;
        }
        ["watch", address, len] => {
            let (Some(address), Some(len)) = (parse_number(address), parse_number(len)) else {
                return usage("watch ADDR LEN");
            };
            session
                .target_mut()
                .insert_watchpoint(address, len as usize)?;
            println!("Watchpoint on {address:#x} ({len} bytes)");
        }
        ["set", "capacity", "unlimited"] => session.set_capacity(0)?,
        ["set", "capacity", capacity] => {
            let Some(capacity) = parse_number(capacity) else {
                return usage("set capacity N|unlimited");
            };
            session.set_capacity(capacity as usize)?;
        }
        ["show", "capacity"] => match session.config().capacity {
            0 => println!("Record/replay buffer limit is unlimited."),
            capacity => println!("Record/replay buffer limit is {capacity}."),
        },
        ["set", "stop-at-limit", rest @ ..] => match parse_switch(rest.first().copied()) {
            Some(value) => session.set_stop_at_limit(value),
            None => return usage("set stop-at-limit on|off"),
        },
        ["show", "stop-at-limit"] => println!(
            "Whether record/replay stops when record/replay buffer becomes full is {}.",
            on_off(session.config().stop_at_limit)
        ),
        ["set", "confirm-divergence", rest @ ..] => match parse_switch(rest.first().copied()) {
            Some(value) => session.set_confirm_divergence(value),
            None => return usage("set confirm-divergence on|off"),
        },
        ["show", "confirm-divergence"] => println!(
            "Confirmation before discarding recorded history is {}.",
            on_off(session.config().confirm_divergence)
        ),
        ["set", "memory-query", rest @ ..] => match parse_switch(rest.first().copied()) {
            Some(value) => session.set_memory_query(value),
            None => return usage("set memory-query on|off"),
        },
        ["show", "memory-query"] => println!(
            "Whether to query if PREC cannot record memory change of next instruction is {}.",
            on_off(session.config().memory_query)
        ),
        ["save", path] => {
            session.save(path)?;
            println!("Saved recording to {path}");
        }
        ["restore", path] => {
            session.restore(path)?;
            println!("Restored recording from {path}");
        }
        ["goto", "begin" | "start"] => {
            let sequence = session.goto_begin()?;
            println!("Now at instruction {sequence}");
        }
        ["goto", "end"] => {
            let sequence = session.goto_end()?;
            println!("Now at instruction {sequence}");
        }
        ["goto", sequence] => {
            let Some(sequence) = parse_number(sequence) else {
                return usage("goto N|begin|end");
            };
            session.goto_sequence(sequence)?;
            println!("Now at instruction {sequence}");
        }
        ["bookmark"] => println!("Bookmark: {}", session.bookmark()),
        ["goto-bookmark", token @ ..] if !token.is_empty() => {
            let sequence = session.goto_bookmark(&token.join(" "))?;
            println!("Now at instruction {sequence}");
        }
        ["delete-forward"] => {
            let removed = session.delete_forward();
            println!("Deleted {removed} instructions after the current position");
        }
        _ => println!("Undefined command: \"{line}\""),
    }
    Ok(Flow::Continue)
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env().init();
    let args = Args::parse();

    let bytes = match fs::read(&args.program) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{}: {err}", args.program.display());
            return ExitCode::FAILURE;
        }
    };
    let machine = vm::Config {
        wait_latency: args.wait_latency,
        ..vm::Config::default()
    };
    let vm = match Vm::from_elf(&bytes, machine) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("{}: {err}", args.program.display());
            return ExitCode::FAILURE;
        }
    };
    let config = Config {
        capacity: args.capacity,
        stop_at_limit: !args.no_stop_at_limit,
        confirm_divergence: !args.no_confirm_divergence,
        memory_query: args.memory_query,
    };
    let mut session = RecordingSession::open(vm, Rv64Analyzer::new(), config);
    if args.yes {
        session.set_confirm(|_: &str| true);
    } else {
        session.set_confirm(ask);
    }
    if let Some(path) = &args.restore {
        if let Err(err) = session.restore(path) {
            eprintln!("{}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    }

    let mut printed = 0;
    let stdin = io::stdin();
    loop {
        print!("(rr) ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        }
        let result = execute(&mut session, line.trim());

        let output = session.target().output();
        if output.len() > printed {
            print!("{}", String::from_utf8_lossy(&output[printed..]));
            printed = output.len();
        }
        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => eprintln!("{err}"),
        }
    }
    session.close();
    ExitCode::SUCCESS
}
