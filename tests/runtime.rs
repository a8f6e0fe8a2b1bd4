mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{init_tracing, Asm, FAIL, SUSPEND, YIELD};
use strand::bytecode::Opcode;
use strand::error::{Fault, TraceFormat};
use strand::vm::{CoroutineKind, FiberTask, Status, TaskManager, Value, Vm};
use strand::VmConfig;

fn globals(vm: &Vm, module: &str) -> Vec<Value> {
    vm.globals(module).unwrap().to_vec()
}

#[test]
fn test_execute_add() {
    init_tracing();
    let mut a = Asm::new("calc");
    a.func("add", 2, 1);
    a.frame(2, 1).get_var(0).get_var(1).op(Opcode::Add).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let out = vm.execute("add", vec![Value::num(3.0), Value::num(4.0)]).unwrap();
    assert_eq!(out, vec![Value::num(7.0)]);
    assert_eq!(vm.pool_stats().executors.busy, 0);
}

#[test]
fn test_loop_and_local_call() {
    let mut a = Asm::new("calc");
    let sum = a.func("sum", 1, 1);
    a.frame(2, 1).num(0.0).set_var(1);
    let top = a.offset();
    a.num(0.0).get_var(0).op(Opcode::Lt);
    let exit = a.jump(Opcode::JumpZ);
    a.get_var(1).get_var(0).op(Opcode::Add).set_var(1);
    a.get_var(0).num(1.0).op(Opcode::Sub).set_var(0);
    a.jump_back(top);
    a.patch(exit);
    a.get_var(1).ret();

    a.func("main", 0, 1);
    a.frame(0, 1).num(4.0).call_local(sum, 1).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    assert_eq!(vm.execute("main", vec![]).unwrap(), vec![Value::num(10.0)]);
    assert_eq!(
        vm.execute("calc.sum", vec![Value::num(5.0)]).unwrap(),
        vec![Value::num(15.0)]
    );

    let stats = vm.pool_stats().executors;
    assert_eq!(stats.miss, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_unknown_function() {
    let mut vm = Vm::new();
    let err = vm.execute("nope", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::FuncNotFound("nope".to_string()));
    assert!(err.trace.is_empty());
}

#[test]
fn test_module_init_sets_globals() {
    let mut a = Asm::new("g");
    a.gvars(1);
    a.init_code().num(10.0).set_gvar(0).ret();
    a.main_code();
    a.func("get", 0, 1);
    a.frame(0, 1).get_gvar(0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    assert_eq!(globals(&vm, "g"), vec![Value::num(10.0)]);
    assert_eq!(vm.execute("get", vec![]).unwrap(), vec![Value::num(10.0)]);
}

#[test]
fn test_defers_run_in_reverse_and_restore_ip() {
    let mut a = Asm::new("d");
    a.gvars(3);
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.scope(|a| {
        a.defer(|a| {
            a.mark(0, 1.0);
        });
        a.defer(|a| {
            let skip = a.jump(Opcode::Jump);
            a.mark(0, 99.0);
            a.patch(skip);
            a.mark(0, 2.0).mark(1, 5.0);
        });
        a.mark(2, 1.0);
    });
    // runs once both defers are done
    a.get_gvar(0).num(10.0).op(Opcode::Add).set_gvar(2);
    a.ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    vm.execute("main", vec![]).unwrap();
    assert_eq!(
        globals(&vm, "d"),
        vec![Value::num(1.0), Value::num(5.0), Value::num(11.0)]
    );
}

#[test]
fn test_defer_runs_on_frame_exit() {
    let mut a = Asm::new("d");
    a.gvars(1);
    a.func("f", 0, 1);
    a.frame(0, 1);
    a.defer(|a| {
        a.mark(0, 3.0);
    });
    a.num(8.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    assert_eq!(vm.execute("f", vec![]).unwrap(), vec![Value::num(8.0)]);
    assert_eq!(globals(&vm, "d"), vec![Value::num(3.0)]);
}

#[test]
fn test_defer_must_complete_synchronously() {
    let mut a = Asm::new("d");
    a.func("bad", 0, 0);
    a.frame(0, 0);
    a.defer(|a| {
        a.call_native(SUSPEND, 0);
    });
    a.ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let err = vm.execute("bad", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::DeferStatus(Status::Running));
    assert_eq!(vm.coroutines().busy(), 0);
}

#[test]
fn test_execute_left_running_is_an_error() {
    let mut a = Asm::new("s");
    a.func("main", 0, 0);
    a.frame(0, 0).call_native(SUSPEND, 0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let err = vm.execute("main", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::StillRunning("main".to_string()));
    assert_eq!(vm.coroutines().busy(), 0);
}

#[test]
fn test_paral_first_branch_decides() {
    init_tracing();
    let mut a = Asm::new("p");
    a.gvars(2);
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.paral(|a| {
        a.scope(|a| {
            a.call_native(SUSPEND, 0);
        });
        a.scope(|a| {
            a.call_native(YIELD, 0).mark(0, 1.0);
        });
        a.scope(|a| {
            a.call_native(SUSPEND, 0);
        });
    });
    a.mark(1, 2.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let id = vm.start("main", vec![]).unwrap();
    assert!(vm.tick_fiber(id).unwrap());
    assert_eq!(globals(&vm, "p"), vec![Value::nil(), Value::nil()]);
    assert!(!vm.tick_fiber(id).unwrap());

    let result = vm.take_result(id).unwrap();
    assert_eq!(result.status, Status::Success);
    assert_eq!(globals(&vm, "p"), vec![Value::num(1.0), Value::num(2.0)]);

    let coroutines = vm.coroutines();
    let branches = coroutines.stats(CoroutineKind::Branch);
    assert_eq!(branches.miss, 3);
    assert_eq!(branches.idle, 3);
    assert_eq!(coroutines.stats(CoroutineKind::Suspend).idle, 2);
    assert_eq!(coroutines.busy(), 0);
    assert_eq!(coroutines.news(), coroutines.dels());
}

#[test]
fn test_paral_all_waits_for_every_branch() {
    let mut a = Asm::new("p");
    a.gvars(3);
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.paral_all(|a| {
        a.scope(|a| {
            a.call_native(YIELD, 0).mark(0, 1.0);
        });
        a.scope(|a| {
            a.call_native(YIELD, 0).call_native(YIELD, 0).mark(1, 2.0);
        });
    });
    a.mark(2, 3.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let id = vm.start("main", vec![]).unwrap();
    assert!(vm.tick_fiber(id).unwrap());
    assert!(vm.tick_fiber(id).unwrap());
    assert_eq!(
        globals(&vm, "p"),
        vec![Value::num(1.0), Value::nil(), Value::nil()]
    );
    assert!(!vm.tick_fiber(id).unwrap());
    assert_eq!(
        globals(&vm, "p"),
        vec![Value::num(1.0), Value::num(2.0), Value::num(3.0)]
    );
    assert_eq!(vm.coroutines().busy(), 0);
}

#[test]
fn test_paral_all_fails_with_a_branch() {
    let mut a = Asm::new("p");
    a.gvars(1);
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.paral_all(|a| {
        a.scope(|a| {
            a.call_native(SUSPEND, 0);
        });
        a.scope(|a| {
            a.call_native(YIELD, 0).call_native(FAIL, 0);
        });
    });
    a.mark(0, 1.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let id = vm.start("main", vec![]).unwrap();
    assert!(vm.tick_fiber(id).unwrap());
    assert!(!vm.tick_fiber(id).unwrap());

    assert_eq!(vm.take_result(id).unwrap().status, Status::Failure);
    assert_eq!(globals(&vm, "p"), vec![Value::nil()]);
    assert_eq!(vm.coroutines().busy(), 0);
    assert_eq!(vm.coroutines().stats(CoroutineKind::Branch).idle, 2);
}

#[test]
fn test_empty_paral_all_completes_at_once() {
    let mut a = Asm::new("p");
    a.gvars(1);
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.paral_all(|_| {});
    a.mark(0, 1.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    vm.execute("main", vec![]).unwrap();
    assert_eq!(globals(&vm, "p"), vec![Value::num(1.0)]);
}

#[test]
fn test_return_inside_branch() {
    let mut a = Asm::new("p");
    a.func("f", 0, 1);
    a.frame(0, 1);
    a.paral(|a| {
        a.scope(|a| {
            a.call_native(SUSPEND, 0);
        });
        a.scope(|a| {
            a.num(42.0).ret();
        });
    });
    a.num(0.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    assert_eq!(vm.execute("f", vec![]).unwrap(), vec![Value::num(42.0)]);
    assert_eq!(vm.coroutines().busy(), 0);
}

#[test]
fn test_paral_defer_runs_on_cleanup() {
    let mut a = Asm::new("p");
    a.gvars(1);
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.paral(|a| {
        a.defer(|a| {
            a.mark(0, 7.0);
        });
        a.scope(|a| {
            a.call_native(YIELD, 0);
        });
    });
    a.ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let id = vm.start("main", vec![]).unwrap();
    assert!(vm.tick_fiber(id).unwrap());
    assert_eq!(globals(&vm, "p"), vec![Value::nil()]);
    assert!(!vm.tick_fiber(id).unwrap());
    assert_eq!(globals(&vm, "p"), vec![Value::num(7.0)]);
}

#[test]
fn test_trace_innermost_first() {
    let mut vm = Vm::new();
    let boom = vm.register_native("boom", 0, |_, _, _| Err(Fault::Native("boom".to_string())));

    let mut a = Asm::new("a");
    let foo = a.func("foo", 0, 0);
    a.line(10).frame(0, 0).call_native(boom, 0).ret();
    a.func("main", 0, 0);
    a.line(2).frame(0, 0);
    a.line(3).call_local(foo, 0);
    a.line(4).ret();
    vm.load_module(a.build()).unwrap();

    let err = vm.execute("main", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::Native("boom".to_string()));
    assert_eq!(
        err.trace_string(TraceFormat::Compact),
        "at foo(..) in a.bhl:10\nat main(..) in a.bhl:3\n"
    );

    let report = err.report(TraceFormat::Compact);
    assert_eq!(report.file, "a.bhl");
    assert_eq!(report.line, 10);
}

#[test]
fn test_trace_descends_into_branches() {
    let mut vm = Vm::new();
    let boom = vm.register_native("boom", 0, |_, _, _| Err(Fault::Native("boom".to_string())));

    let mut a = Asm::new("a");
    let foo = a.func("foo", 0, 0);
    a.line(10).frame(0, 0).call_native(boom, 0).ret();
    a.func("main", 0, 0);
    a.line(2).frame(0, 0);
    a.line(3).paral(|a| {
        a.scope(|a| {
            a.call_native(SUSPEND, 0);
        });
        a.scope(|a| {
            a.call_local(foo, 0);
        });
    });
    a.line(4).ret();
    vm.load_module(a.build()).unwrap();

    let id = vm.start("main", vec![]).unwrap();
    let err = vm.tick_fiber(id).unwrap_err();
    assert_eq!(
        err.trace_string(TraceFormat::Compact),
        "at foo(..) in a.bhl:10\nat main(..) in a.bhl:3\n"
    );
    assert!(!vm.is_running(id));
    assert_eq!(vm.coroutines().busy(), 0);
    assert_eq!(vm.pool_stats().fibers.busy, 0);
}

#[test]
fn test_call_depth_limit() {
    let config = VmConfig {
        max_call_depth: 8,
        ..VmConfig::default()
    };
    let mut a = Asm::new("r");
    let f = a.func("f", 0, 0);
    a.frame(0, 0).call_local(f, 0).ret();

    let mut vm = Vm::with_config(config);
    vm.load_module(a.build()).unwrap();
    let err = vm.execute("f", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::StackOverflow(8));
    assert_eq!(err.trace.len(), 8);
}

#[test]
fn test_closure_with_upvalue() {
    let mut a = Asm::new("c");
    let adder = a.func("adder", 1, 1);
    a.frame(2, 1).get_var(0).get_var(1).op(Opcode::Add).ret();

    a.func("main", 0, 1);
    a.frame(1, 1).num(10.0).set_var(0);
    a.num(5.0).func_ptr(adder).set_upval(0, 1).call_func_ptr(1);
    a.ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    assert_eq!(vm.execute("main", vec![]).unwrap(), vec![Value::num(15.0)]);
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn test_captured_list_released() {
    let mut a = Asm::new("c");
    let f = a.func("f", 0, 0);
    a.frame(1, 0).ret();

    a.func("main", 0, 0);
    a.frame(1, 0).new_list(0).set_var(0);
    a.func_ptr(f).set_upval(0, 0).call_func_ptr(0);
    a.ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    vm.execute("main", vec![]).unwrap();
    assert_eq!(vm.heap().live(), 0);
    let stats = vm.heap().stats();
    assert_eq!(stats.lists.miss, 1);
    assert_eq!(stats.closures.idle, 1);
}

#[test]
fn test_returned_list_is_owned_by_caller() {
    let mut a = Asm::new("c");
    a.func("make", 0, 1);
    a.frame(0, 1).num(1.0).num(2.0).new_list(2).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let mut out = vm.execute("make", vec![]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(vm.heap().live(), 1);
    vm.release(&mut out[0]);
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn test_native_pointer_call_yields() {
    let mut a = Asm::new("n");
    a.gvars(1);
    a.func("main", 0, 0);
    a.frame(0, 0).native_ptr(YIELD).call_func_ptr(0).mark(0, 1.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let id = vm.start("main", vec![]).unwrap();
    assert!(vm.tick_fiber(id).unwrap());
    assert!(!vm.tick_fiber(id).unwrap());
    assert_eq!(globals(&vm, "n"), vec![Value::num(1.0)]);
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn test_closure_call_overflow_releases_captures() {
    let config = VmConfig {
        max_call_depth: 1,
        ..VmConfig::default()
    };
    let mut a = Asm::new("c");
    let f = a.func("f", 0, 0);
    a.frame(1, 0).ret();

    a.func("main", 0, 0);
    a.frame(1, 0).new_list(0).set_var(0);
    a.func_ptr(f).set_upval(0, 0).call_func_ptr(0);
    a.ret();

    let mut vm = Vm::with_config(config);
    vm.load_module(a.build()).unwrap();
    let err = vm.execute("main", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::StackOverflow(1));
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn test_native_pointer_fault_releases_pointer() {
    let mut vm = Vm::new();
    let boom = vm.register_native("boom", 0, |_, _, _| Err(Fault::Native("boom".to_string())));

    let mut a = Asm::new("n");
    a.func("main", 0, 0);
    a.frame(0, 0).native_ptr(boom).call_func_ptr(0).ret();

    vm.load_module(a.build()).unwrap();
    let err = vm.execute("main", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::Native("boom".to_string()));
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn test_bad_local_store_releases_value() {
    let mut a = Asm::new("l");
    a.func("main", 0, 0);
    a.frame(1, 0).new_list(0).set_var(5).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let err = vm.execute("main", vec![]).unwrap_err();
    assert_eq!(err.cause, Fault::BadLocal(5));
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn test_stop_runs_pending_defers() {
    let mut a = Asm::new("s");
    a.gvars(1);
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.defer(|a| {
        a.mark(0, 1.0);
    });
    a.call_native(SUSPEND, 0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let id = vm.start("main", vec![]).unwrap();
    assert!(vm.tick_fiber(id).unwrap());
    vm.stop(id).unwrap();

    assert_eq!(globals(&vm, "s"), vec![Value::num(1.0)]);
    assert!(vm.take_result(id).is_none());
    assert_eq!(vm.coroutines().busy(), 0);
    assert!(matches!(vm.stop(id), Err(e) if e.cause == Fault::FiberNotFound(id)));
}

#[test]
fn test_task_stop_survives_failing_defer() {
    init_tracing();
    let mut a = Asm::new("t");
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.defer(|a| {
        a.call_native(FAIL, 0);
    });
    a.call_native(SUSPEND, 0).ret();

    let vm = Rc::new(RefCell::new(Vm::new()));
    vm.borrow_mut().load_module(a.build()).unwrap();
    let task = FiberTask::start(vm.clone(), "main").unwrap();
    let id = task.id();

    let mut tm = TaskManager::new(false);
    tm.add(Box::new(task));
    tm.tick().unwrap();
    assert!(vm.borrow().is_running(id));

    tm.stop();
    assert!(tm.is_empty());
    assert!(!vm.borrow().is_running(id));
    assert_eq!(vm.borrow().coroutines().busy(), 0);
}

#[test]
fn test_fibers_recycled() {
    let mut a = Asm::new("f");
    a.func("main", 0, 1);
    a.frame(0, 1).num(1.0).ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    for _ in 0..3 {
        let id = vm.start("main", vec![]).unwrap();
        assert_eq!(vm.tick().unwrap(), 0);
        assert_eq!(vm.take_result(id).unwrap().values, vec![Value::num(1.0)]);
    }
    let stats = vm.pool_stats().fibers;
    assert_eq!(stats.miss, 1);
    assert_eq!(stats.hits, 2);
}

#[test]
fn test_dump_running_fiber() {
    let mut a = Asm::new("p");
    a.func("main", 0, 0);
    a.frame(0, 0);
    a.paral_all(|a| {
        a.scope(|a| {
            a.call_native(SUSPEND, 0);
        });
        a.scope(|a| {
            a.call_native(SUSPEND, 0);
        });
    });
    a.ret();

    let mut vm = Vm::new();
    vm.load_module(a.build()).unwrap();
    let id = vm.start("main", vec![]).unwrap();
    vm.tick().unwrap();

    let dump = vm.dump_fiber(id).unwrap();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("ParalAll "));
    assert!(lines[1].starts_with("  Branch "));
    assert_eq!(lines[2], "    Suspend");

    vm.stop_all().unwrap();
    assert_eq!(vm.fibers_count(), 0);
    assert_eq!(vm.coroutines().busy(), 0);
}
