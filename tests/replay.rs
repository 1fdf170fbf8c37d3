mod common;

use common::*;
use rand::{rngs::SmallRng, SeedableRng};
use riscv_record::{
    breakpoints::BreakpointSite,
    riscv::{OperandSize, RISCVInstruction as I, INSN_SIZE},
    session::Config,
    target::{Direction, HistoryEdge, ProcessControl, Signal, StopReason, WaitStatus},
    vm, RecordError,
};

fn unlimited() -> Config {
    Config {
        capacity: 0,
        ..Config::default()
    }
}

#[test]
fn test_reverse_then_forward_single_steps() {
    let mut session = session(&counter(2), Config::default());
    record(&mut session, 2);
    assert_eq!(gpr(&session, 5), 2);
    assert!(!session.is_replaying());

    assert_eq!(
        reverse_step(&mut session),
        WaitStatus::stopped(StopReason::SingleStep, Signal::TRAP)
    );
    assert_eq!(gpr(&session, 5), 1);
    assert!(session.is_replaying());

    // Landing on the first state is an ordinary step.
    assert_eq!(
        reverse_step(&mut session),
        WaitStatus::stopped(StopReason::SingleStep, Signal::TRAP)
    );
    assert_eq!(gpr(&session, 5), 0);
    assert_eq!(session.log().cursor_sequence(), 0);
    assert_eq!(
        reverse_step(&mut session),
        WaitStatus::NoHistory(HistoryEdge::Begin)
    );
    assert_eq!(gpr(&session, 5), 0);

    assert_eq!(
        step(&mut session),
        WaitStatus::stopped(StopReason::SingleStep, Signal::TRAP)
    );
    assert_eq!(gpr(&session, 5), 1);
    assert_eq!(
        step(&mut session),
        WaitStatus::stopped(StopReason::SingleStep, Signal::TRAP)
    );
    assert_eq!(gpr(&session, 5), 2);
    assert!(!session.is_replaying());
    assert_eq!(session.log().count_resident(), 2);
}

#[test]
fn test_continue_reports_history_edges() {
    let mut session = session(&counter(3), Config::default());
    record(&mut session, 3);
    session.goto_sequence(1).unwrap();

    assert_eq!(
        run(&mut session, Direction::Reverse, false),
        WaitStatus::NoHistory(HistoryEdge::Begin)
    );
    assert_eq!(gpr(&session, 5), 0);
    assert_eq!(
        run(&mut session, Direction::Reverse, false),
        WaitStatus::NoHistory(HistoryEdge::Begin)
    );

    session.goto_sequence(2).unwrap();
    assert_eq!(
        run(&mut session, Direction::Forward, false),
        WaitStatus::NoHistory(HistoryEdge::End)
    );
    assert_eq!(gpr(&session, 5), 3);
    assert!(!session.is_replaying());
}

#[test]
fn test_replay_restores_every_recorded_state() {
    for seed in 0..8 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let program = random_program(&mut rng, 40);
        let mut session = session(&program, unlimited());

        let mut states = vec![state(&session)];
        for _ in 0..40 {
            step(&mut session);
            states.push(state(&session));
        }

        for expected in states.iter().rev().skip(1) {
            reverse_step(&mut session);
            assert_eq!(&state(&session), expected, "seed {seed}");
        }
        for expected in states.iter().skip(1) {
            step(&mut session);
            assert_eq!(&state(&session), expected, "seed {seed}");
        }
        assert!(!session.is_replaying());
    }
}

#[test]
fn test_reverse_continue_stops_at_breakpoint() {
    let mut session = session(&counter(10), Config::default());
    let start = session.target().pc();
    run(&mut session, Direction::Forward, false);

    let site = BreakpointSite::new(start + 3 * INSN_SIZE);
    session.insert_breakpoint(site).unwrap();
    assert_eq!(
        run(&mut session, Direction::Reverse, false),
        WaitStatus::stopped(StopReason::SoftwareBreakpoint, Signal::TRAP)
    );
    assert_eq!(session.target().pc(), site.address);
    assert_eq!(gpr(&session, 5), 3);
    assert_eq!(session.stop_reason(), StopReason::SoftwareBreakpoint);

    assert_eq!(
        run(&mut session, Direction::Forward, false),
        WaitStatus::NoHistory(HistoryEdge::End)
    );
    assert_eq!(gpr(&session, 5), 10);
}

#[test]
fn test_reverse_continue_reaches_begin() {
    let mut session = session(&counter(5), Config::default());
    record(&mut session, 5);
    assert_eq!(
        run(&mut session, Direction::Reverse, false),
        WaitStatus::NoHistory(HistoryEdge::Begin)
    );
    assert_eq!(gpr(&session, 5), 0);
    assert_eq!(session.log().cursor_sequence(), 0);
}

#[test]
fn test_breakpoints_set_while_replaying_stay_in_shadow() {
    let mut session = session(&counter(6), Config::default());
    let start = session.target().pc();
    record(&mut session, 6);
    session.goto_begin().unwrap();

    let site = BreakpointSite::new(start + 2 * INSN_SIZE);
    session.insert_breakpoint(site).unwrap();
    assert!(!session.breakpoints().is_physically_inserted(site));
    assert!(session.target().inserted_breakpoints().is_empty());

    assert_eq!(
        run(&mut session, Direction::Forward, false),
        WaitStatus::stopped(StopReason::SoftwareBreakpoint, Signal::TRAP)
    );
    assert_eq!(gpr(&session, 5), 2);

    session.remove_breakpoint(site).unwrap();
    assert!(session.breakpoints().is_empty());
}

#[test]
fn test_watchpoint_hit_while_replaying() {
    let program = [
        I::addi(OperandSize::S64, 0, 9, 6),
        I::noop(),
        I::store(OperandSize::S64, 2, 6, -16),
        I::noop(),
        I::noop(),
        I::ebreak(),
    ];
    let mut session = session(&program, Config::default());
    let start = session.target().pc();
    let top = vm::Config::default().stack_top();
    record(&mut session, 5);

    session.target_mut().insert_watchpoint(top - 16, 8).unwrap();
    assert_eq!(
        run(&mut session, Direction::Reverse, false),
        WaitStatus::stopped(StopReason::Watchpoint, Signal::TRAP)
    );
    assert_eq!(session.target().pc(), start + 2 * INSN_SIZE);
    assert_eq!(read_u64(&mut session, top - 16), 0);
    assert_eq!(session.log().cursor_sequence(), 2);
}

#[test]
fn test_replay_stops_at_recorded_signal() {
    let mut session = session(&counter(6), Config::default());
    record(&mut session, 2);
    session
        .resume(Direction::Forward, true, Signal::TERM)
        .unwrap();
    session.wait().unwrap();
    record(&mut session, 2);

    session.goto_begin().unwrap();
    assert_eq!(
        run(&mut session, Direction::Forward, false),
        WaitStatus::stopped(StopReason::None, Signal::TERM)
    );
    assert_eq!(session.log().cursor_sequence(), 2);

    assert_eq!(
        run(&mut session, Direction::Forward, true),
        WaitStatus::stopped(StopReason::SingleStep, Signal::TRAP)
    );
}

#[test]
fn test_interrupt_during_replay() {
    let mut session = session(&counter(5), Config::default());
    record(&mut session, 5);
    session.goto_begin().unwrap();
    session.interrupt_handle().interrupt();
    assert_eq!(
        run(&mut session, Direction::Forward, false),
        WaitStatus::stopped(StopReason::None, Signal::INT)
    );
    assert_eq!(session.log().cursor_sequence(), 0);
}

#[test]
fn test_register_write_while_replaying_discards_future() {
    let mut session = session(&distinct_writes(5), Config::default());
    record(&mut session, 5);
    session.goto_sequence(1).unwrap();
    assert!(session.is_replaying());

    session.store_register(20, &42u64.to_le_bytes()).unwrap();
    assert!(!session.is_replaying());
    assert_eq!(session.log().count_resident(), 1);
    assert_eq!(session.log().total_committed(), 5);
    assert!(session.log().seek_by_sequence(2).is_none());
    assert_eq!(gpr(&session, 20), 42);
    assert_eq!(gpr(&session, 6), 1);
    assert_eq!(gpr(&session, 7), 0);

    step(&mut session);
    let numbers: Vec<u64> = session.log().boundaries().map(|(_, seq)| seq).collect();
    assert_eq!(numbers, vec![1, 6]);
}

#[test]
fn test_declined_write_keeps_history() {
    let mut session = session(&distinct_writes(5), Config::default());
    record(&mut session, 5);
    session.goto_sequence(2).unwrap();

    let script = Scripted::new(&[false]);
    script.install(&mut session);
    assert!(matches!(
        session.write_memory(vm::Config::default().stack_top() - 8, &[1]),
        Err(RecordError::OperationCancelled)
    ));
    assert_eq!(script.asked(), 1);
    assert!(session.is_replaying());
    assert_eq!(session.log().count_resident(), 5);

    session.set_confirm_divergence(false);
    session.store_register(20, &7u64.to_le_bytes()).unwrap();
    assert_eq!(script.asked(), 1);
    assert_eq!(session.log().count_resident(), 2);
}

#[test]
fn test_write_while_recording_is_not_logged() {
    let mut session = session(&counter(3), Config::default());
    let script = Scripted::new(&[]);
    script.install(&mut session);
    record(&mut session, 1);
    session.store_register(5, &100u64.to_le_bytes()).unwrap();
    assert_eq!(script.asked(), 0);
    assert_eq!(session.log().count_resident(), 1);

    step(&mut session);
    assert_eq!(gpr(&session, 5), 101);
    reverse_step(&mut session);
    assert_eq!(gpr(&session, 5), 100);
}

#[test]
fn test_goto_positions() {
    let mut session = session(&distinct_writes(5), Config::default());
    let initial = state(&session);
    record(&mut session, 5);
    let end = state(&session);

    assert_eq!(session.goto_sequence(2).unwrap(), 2);
    assert_eq!(gpr(&session, 7), 2);
    assert_eq!(gpr(&session, 8), 0);
    assert_eq!(session.goto_sequence(4).unwrap(), 4);
    assert_eq!(gpr(&session, 9), 4);
    assert!(matches!(
        session.goto_sequence(4),
        Err(RecordError::AlreadyThere(4))
    ));
    assert!(matches!(
        session.goto_sequence(9),
        Err(RecordError::InstructionNotFound(9))
    ));

    assert_eq!(session.goto_begin().unwrap(), 0);
    assert_eq!(state(&session), initial);
    assert!(matches!(
        session.goto_begin(),
        Err(RecordError::AlreadyThere(0))
    ));
    assert_eq!(session.goto_end().unwrap(), 5);
    assert_eq!(state(&session), end);
    assert!(!session.is_replaying());
    session.stop_replaying().unwrap();
}

#[test]
fn test_bookmarks() {
    let mut session = session(&distinct_writes(5), Config::default());
    record(&mut session, 3);
    let bookmark = session.bookmark();
    assert_eq!(bookmark, "3");
    let at_bookmark = state(&session);
    record(&mut session, 2);

    assert_eq!(session.goto_bookmark(&bookmark).unwrap(), 3);
    assert_eq!(state(&session), at_bookmark);
    assert_eq!(session.goto_bookmark("'5'").unwrap(), 5);
    assert_eq!(session.goto_bookmark("\"3\"").unwrap(), 3);

    assert!(matches!(
        session.goto_bookmark("\"3"),
        Err(RecordError::UnbalancedQuotes(_))
    ));
    assert!(matches!(
        session.goto_bookmark("'"),
        Err(RecordError::UnbalancedQuotes(_))
    ));
    assert!(matches!(
        session.goto_bookmark("three"),
        Err(RecordError::InvalidBookmark(_))
    ));
    assert_eq!(session.log().cursor_sequence(), 3);
}

#[test]
fn test_delete_forward() {
    let mut session = session(&distinct_writes(5), Config::default());
    record(&mut session, 5);
    assert_eq!(session.delete_forward(), 0);

    session.goto_sequence(2).unwrap();
    assert_eq!(session.delete_forward(), 3);
    assert!(!session.is_replaying());
    assert_eq!(session.log().count_resident(), 2);
    assert!((3..=5).all(|seq| session.log().seek_by_sequence(seq).is_none()));
    assert_eq!(gpr(&session, 7), 2);
}

#[test]
fn test_shrinking_capacity_while_at_begin() {
    let mut session = session(&distinct_writes(5), unlimited());
    record(&mut session, 5);
    let end = state(&session);
    session.goto_begin().unwrap();

    session.set_capacity(2).unwrap();
    assert_eq!(session.config().capacity, 2);
    assert_eq!(session.log().count_resident(), 2);
    assert_eq!(session.log().cursor_sequence(), 0);
    assert_eq!(gpr(&session, 8), 3);
    assert_eq!(gpr(&session, 9), 0);

    assert_eq!(session.goto_end().unwrap(), 5);
    assert_eq!(state(&session), end);
}

#[test]
fn test_info_while_replaying() {
    let mut session = session(&distinct_writes(5), Config::default());
    let info = session.info();
    assert!(!info.replaying);
    assert_eq!(info.lowest, None);
    assert!(info
        .to_string()
        .contains("No instructions have been logged."));

    record(&mut session, 3);
    session.goto_sequence(1).unwrap();
    let info = session.info();
    assert!(info.replaying);
    assert_eq!(info.lowest, Some(1));
    assert_eq!(info.current, Some(1));
    assert_eq!(info.total_committed, 3);
    let text = info.to_string();
    assert!(text.starts_with("Replay mode:"));
    assert!(text.contains("Current instruction number is 1."));
    assert!(text.contains("Max logged instructions is 200000."));
}
