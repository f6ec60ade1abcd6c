use proptest::prelude::*;
use qvm_vdbe::{
    Connection, ErrorCode, Insn, Label, Opcode, StepResult, Value, VdbeConfig, VdbeError,
    VdbeState,
};

fn conn() -> Connection {
    Connection::open_in_memory()
}

// ── Assembly and readiness ──────────────────────────────────────────────────

#[test]
fn test_new_builder_holds_only_init() {
    let b = conn().new_program();
    assert_eq!(b.state(), VdbeState::Init);
    assert_eq!(b.op_count(), 1);
    assert_eq!(b.current_addr(), 1);
    assert_eq!(b.register_count(), 0);
    assert_eq!(b.cursor_count(), 0);
}

#[test]
fn test_append_returns_consecutive_addresses() {
    let mut b = conn().new_program();
    let a = b.append(Opcode::Noop, 0, 0, 0);
    let c = b.append(Opcode::Noop, 0, 0, 0);
    assert_eq!((a, c), (1, 2));
    assert_eq!(b.op_count(), 3);
}

#[test]
fn test_make_ready_sizes_and_nulls_registers() {
    let vm = conn().new_program().make_ready(8, 3).unwrap();
    assert_eq!(vm.state(), VdbeState::Ready);
    assert_eq!(vm.register_count(), 8);
    assert_eq!(vm.cursor_count(), 3);
    assert_eq!(vm.open_cursor_count(), 0);
    assert_eq!(vm.op_count(), 1);
    assert!((1..=8).all(|r| vm.is_null(r)));
}

#[test]
fn test_empty_program_is_done_without_rows() {
    let mut vm = conn().new_program().make_ready(0, 0).unwrap();
    let mut rows = 0;
    loop {
        match vm.step().unwrap() {
            StepResult::Row => rows += 1,
            StepResult::Done => break,
            StepResult::Continue | StepResult::Busy => {}
        }
    }
    assert_eq!(rows, 0);
    assert_eq!(vm.state(), VdbeState::Halted);
}

#[test]
fn test_load_42_yields_one_row_then_halts() {
    let mut b = conn().new_program();
    let r = b.alloc_register();
    assert_eq!(r, 1);
    b.add(Insn::Integer { value: 42, dest: r });
    b.add(Insn::ResultRow { start: r, count: 1 });
    b.add(Insn::Halt);
    let mut vm = b.finish().unwrap();

    let rows = vm.collect_rows().unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(42)]]);
    assert_eq!(vm.state(), VdbeState::Halted);
    assert_eq!(vm.get_int(1), 42);
}

// ── Labels ──────────────────────────────────────────────────────────────────

#[test]
fn test_forward_jump_skips_poison() {
    let mut b = conn().new_program();
    let r = b.alloc_register();
    let over = b.create_label();
    b.add(Insn::Goto {
        target: over.into(),
    });
    let poison = b.add(Insn::HaltWithError {
        code: ErrorCode::Internal,
        message: "poison executed".to_owned(),
    });
    b.resolve_label(over).unwrap();
    let landing = b.add(Insn::Integer { value: 7, dest: r });
    b.add(Insn::ResultRow { start: r, count: 1 });
    let mut vm = b.finish().unwrap();

    assert_eq!(vm.program().ops()[1].p2, i32::try_from(landing).unwrap());
    assert_eq!(landing, poison + 1);
    assert_eq!(vm.collect_rows().unwrap(), vec![vec![Value::Integer(7)]]);
}

#[test]
fn test_label_referenced_before_and_after_resolution() {
    let mut b = conn().new_program();
    let r = b.alloc_register();
    let target = b.create_label();
    b.add(Insn::Goto {
        target: target.into(),
    });
    b.add(Insn::Halt);
    b.resolve_label(target).unwrap();
    let addr = b.add(Insn::Integer { value: 1, dest: r });
    b.add(Insn::IfPos {
        reg: r,
        target: target.into(),
        decrement: 1,
    });
    let vm = b.finish().unwrap();
    let want = i32::try_from(addr).unwrap();
    assert_eq!(vm.program().ops()[1].p2, want);
    assert_eq!(vm.program().ops()[4].p2, want);
}

#[test]
fn test_resolving_twice_is_rejected() {
    let mut b = conn().new_program();
    let l = b.create_label();
    b.resolve_label(l).unwrap();
    b.append(Opcode::Noop, 0, 0, 0);
    assert!(matches!(
        b.resolve_label(l),
        Err(VdbeError::LabelAlreadyResolved { addr: 1, .. })
    ));
}

#[test]
fn test_foreign_label_is_rejected() {
    let c = conn();
    let mut a = c.new_program();
    let mut b = c.new_program();
    let foreign: Label = a.create_label();
    assert!(matches!(
        b.resolve_label(foreign),
        Err(VdbeError::UnknownLabel { .. })
    ));
}

#[test]
fn test_unresolved_label_blocks_readiness() {
    let mut b = conn().new_program();
    let l = b.create_label();
    b.add(Insn::Goto { target: l.into() });
    b.add(Insn::Goto { target: l.into() });
    let err = b.make_ready(0, 0).unwrap_err();
    assert_eq!(
        err,
        VdbeError::UnresolvedLabel {
            label: l.raw(),
            refs: 2
        }
    );
}

#[test]
fn test_labels_are_negative_and_distinct() {
    let mut b = conn().new_program();
    let l1 = b.create_label();
    let l2 = b.create_label();
    assert!(l1.raw() < 0 && l2.raw() < 0);
    assert_ne!(l1.raw(), l2.raw());
}

// ── Validation ──────────────────────────────────────────────────────────────

#[test]
fn test_validation_catches_undersized_register_file() {
    let c = conn().with_config(VdbeConfig::default().with_validation(true));
    let mut b = c.new_program();
    b.add(Insn::Integer { value: 1, dest: 4 });
    assert!(matches!(
        b.make_ready(3, 0),
        Err(VdbeError::OperandOutOfRange {
            opcode: "Integer",
            value: 4,
            limit: 3,
            ..
        })
    ));
}

#[test]
fn test_without_validation_bounds_are_checked_per_access() {
    let c = conn().with_config(VdbeConfig::default().with_validation(false));
    let mut b = c.new_program();
    b.add(Insn::Integer { value: 1, dest: 4 });
    let mut vm = b.make_ready(3, 0).unwrap();
    assert_eq!(vm.step().unwrap(), StepResult::Continue);
    let err = vm.step().unwrap_err();
    assert_eq!(err, VdbeError::RegisterOutOfBounds { index: 4, max: 3 });
    assert_eq!(err.error_code(), ErrorCode::Range);
    assert_eq!(vm.state(), VdbeState::Halted);
    assert_eq!(vm.step().unwrap_err(), err);
}

#[test]
fn test_cursor_out_of_bounds_halts() {
    let c = conn().with_config(VdbeConfig::default().with_validation(false));
    let mut b = c.new_program();
    b.add(Insn::OpenEphemeral {
        cursor: 2,
        key_fields: None,
    });
    let mut vm = b.make_ready(0, 1).unwrap();
    vm.step().unwrap();
    assert_eq!(
        vm.step().unwrap_err(),
        VdbeError::CursorOutOfBounds { index: 2, max: 1 }
    );
}

#[test]
fn test_bad_jump_target_leaves_registers_untouched() {
    let c = conn().with_config(VdbeConfig::default().with_validation(false));
    for opcode in [Opcode::Gosub, Opcode::InitCoroutine] {
        let mut b = c.new_program();
        b.append(opcode, 1, -5, 0);
        let mut vm = b.make_ready(1, 0).unwrap();
        vm.set_int(1, 777).unwrap();
        assert_eq!(vm.step().unwrap(), StepResult::Continue);
        assert_eq!(
            vm.step().unwrap_err(),
            VdbeError::InvalidAddress { addr: -5, len: 2 }
        );
        assert_eq!(vm.get_int(1), 777, "{opcode}");
    }
}

#[test]
fn test_bad_cursor_jump_target_fails_before_moving() {
    let c = conn().with_config(VdbeConfig::default().with_validation(false));
    for opcode in [Opcode::Rewind, Opcode::Last, Opcode::Next, Opcode::Prev] {
        let mut b = c.new_program();
        b.add(Insn::OpenEphemeral {
            cursor: 0,
            key_fields: None,
        });
        b.append(opcode, 0, -1, 0);
        let mut vm = b.make_ready(0, 1).unwrap();
        vm.step().unwrap();
        vm.step().unwrap();
        assert_eq!(
            vm.step().unwrap_err(),
            VdbeError::InvalidAddress { addr: -1, len: 3 },
            "{opcode}"
        );
    }
}

// ── Register access ─────────────────────────────────────────────────────────

#[test]
fn test_out_of_range_setters_do_not_mutate() {
    let mut vm = conn().new_program().make_ready(2, 0).unwrap();
    vm.set_int(1, 10).unwrap();
    vm.set_int(2, 20).unwrap();
    for bad in [-1, 0, 3, i32::MAX] {
        assert!(vm.set_int(bad, 99).is_err());
        assert!(vm.set_double(bad, 9.9).is_err());
        assert!(vm.set_null(bad).is_err());
    }
    assert_eq!(vm.get_int(1), 10);
    assert_eq!(vm.get_int(2), 20);
}

#[test]
fn test_out_of_range_getters_return_defaults() {
    let vm = conn().new_program().make_ready(1, 0).unwrap();
    assert_eq!(vm.get_int(0), 0);
    assert!(vm.get_double(2).abs() < f64::EPSILON);
    assert!(vm.is_null(-5));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_register_round_trip(
        reg in 1_i32..=16,
        i in any::<i64>(),
        d in any::<f64>().prop_filter("finite", |d| d.is_finite()),
    ) {
        let mut vm = Connection::open_in_memory().new_program().make_ready(16, 0).unwrap();
        vm.set_int(reg, i).unwrap();
        prop_assert_eq!(vm.get_int(reg), i);
        prop_assert!(!vm.is_null(reg));
        vm.set_double(reg, d).unwrap();
        prop_assert_eq!(vm.get_double(reg).to_bits(), d.to_bits());
        vm.set_null(reg).unwrap();
        prop_assert!(vm.is_null(reg));
    }

    #[test]
    fn prop_out_of_range_never_mutates(reg in prop_oneof![i32::MIN..=0, 9_i32..=i32::MAX], v in any::<i64>()) {
        let mut vm = Connection::open_in_memory().new_program().make_ready(8, 0).unwrap();
        prop_assert!(vm.set_int(reg, v).is_err());
        prop_assert_eq!(vm.get_int(reg), 0);
        prop_assert!((1..=8).all(|r| vm.is_null(r)));
    }
}

// ── Finalization ────────────────────────────────────────────────────────────

#[test]
fn test_finalize_from_any_state() {
    let c = conn();
    c.new_program().make_ready(1, 1).unwrap().finalize().unwrap();

    let mut b = c.new_program();
    let cur = b.alloc_cursor();
    b.add(Insn::OpenEphemeral {
        cursor: cur,
        key_fields: None,
    });
    b.add(Insn::Halt);
    let mut vm = b.finish().unwrap();
    vm.step().unwrap();
    vm.step().unwrap();
    assert_eq!(vm.state(), VdbeState::Running);
    assert_eq!(vm.open_cursor_count(), 1);
    vm.finalize().unwrap();
}

#[test]
fn test_finalize_does_not_disturb_other_instances() {
    let c = conn();
    let build = |value: i32| {
        let mut b = c.new_program();
        let r = b.alloc_register();
        b.add(Insn::Integer { value, dest: r });
        b.add(Insn::ResultRow { start: r, count: 1 });
        b.finish().unwrap()
    };
    let mut first = build(1);
    let mut second = build(2);
    assert_eq!(first.step_row().unwrap(), StepResult::Row);
    assert_eq!(second.step_row().unwrap(), StepResult::Row);
    first.finalize().unwrap();
    assert_eq!(second.column_int64(0), 2);
    assert_eq!(second.step().unwrap(), StepResult::Done);
}

#[test]
fn test_finalize_reports_halting_error() {
    let mut b = conn().new_program();
    b.add(Insn::HaltWithError {
        code: ErrorCode::Constraint,
        message: "CHECK constraint failed".to_owned(),
    });
    let mut vm = b.finish().unwrap();
    let err = vm.collect_rows().unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Constraint);
    assert_eq!(vm.finalize(), Err(err));
}

#[test]
fn test_finalize_releases_write_lock() {
    let c = conn();
    let mut b = c.new_program();
    b.add(Insn::Transaction { write: true });
    b.add(Insn::Noop);
    let mut vm = b.finish().unwrap();
    vm.step().unwrap();
    vm.step().unwrap();
    assert_eq!(vm.state(), VdbeState::Running);

    let mut other = c.new_program();
    other.add(Insn::Transaction { write: true });
    let mut blocked = other.finish().unwrap();
    blocked.step().unwrap();
    assert_eq!(blocked.step().unwrap(), StepResult::Busy);

    vm.finalize().unwrap();
    assert_eq!(blocked.step().unwrap(), StepResult::Done);
}

// ── Introspection ───────────────────────────────────────────────────────────

#[test]
fn test_explain_lists_resolved_program() {
    let mut b = conn().new_program();
    let r = b.alloc_register();
    let end = b.create_label();
    b.add_with_comment(Insn::Integer { value: 5, dest: r }, "r1 = 5");
    b.add(Insn::Goto { target: end.into() });
    b.resolve_label(end).unwrap();
    b.add(Insn::ResultRow { start: r, count: 1 });
    let vm = b.finish().unwrap();
    let listing = vm.explain();
    assert!(listing.contains("Init"));
    assert!(listing.contains("r1 = 5"));
    let goto = listing
        .lines()
        .find(|l| l.contains("Goto"))
        .unwrap_or_default()
        .to_owned();
    assert!(goto.split_whitespace().any(|t| t == "3"), "{goto}");
}
