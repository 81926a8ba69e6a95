//! Scenarios against real worker processes spawned from the `task_worker`
//! binary, which serves the demo registry.
#![cfg(unix)]

use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use taskmaster::task::TaskError;
use taskmaster::{Task, Taskmaster, Worker, WorkerStatus};

fn master_with_workers(count: usize) -> Taskmaster {
    let mut master = Taskmaster::new();
    master.set_executable(env!("CARGO_BIN_EXE_task_worker"));
    master.set_socket_wait_time(Duration::from_micros(1000));
    master.set_start_timeout(Duration::from_secs(30));
    master
        .add_workers(&Worker::process(), count)
        .expect("process workers enroll without a proxy");
    master
}

#[test]
fn process_worker_echoes_in_order() {
    let mut master = master_with_workers(1);
    let results = Rc::new(RefCell::new(Vec::new()));
    for n in [1, 2, 3] {
        let results = results.clone();
        master.add_task(
            Task::new("echo", json!(n)).on_result(move |v| results.borrow_mut().push(v)),
        );
    }
    master.wait();
    master.stop();
    assert_eq!(*results.borrow(), vec![json!(1), json!(2), json!(3)]);
}

#[test]
fn child_calls_back_into_the_parent_across_the_process_boundary() {
    let mut master = master_with_workers(1);
    let results = Rc::new(RefCell::new(Vec::new()));
    let results_in = results.clone();
    master.add_task(
        Task::new("double_via_parent", json!(7))
            .with_callback("computeHelper", |args| {
                let n = args[0].as_i64().ok_or("expected a number")?;
                Ok(json!(n * 2))
            })
            .on_result(move |v| results_in.borrow_mut().push(v)),
    );
    master.wait();
    master.stop();
    assert_eq!(*results.borrow(), vec![json!(14)]);
}

#[test]
fn crashed_child_fails_its_task_and_the_other_worker_continues() {
    let mut master = master_with_workers(2);

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors_in = errors.clone();
    master.add_task(
        Task::new("crash", json!(null)).on_error(move |e| errors_in.borrow_mut().push(e)),
    );
    let results = Rc::new(RefCell::new(Vec::new()));
    let results_in = results.clone();
    master.add_task(
        Task::new("echo", json!("survivor")).on_result(move |v| results_in.borrow_mut().push(v)),
    );

    master.wait();

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        TaskError::WorkerFailed { reason } => assert!(!reason.is_empty()),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(*results.borrow(), vec![json!("survivor")]);

    // the crashed worker is failed, the survivor is still serviceable
    let statuses: Vec<WorkerStatus> = master.workers().iter().map(|w| w.status()).collect();
    assert!(statuses.contains(&WorkerStatus::Failed));
    assert!(statuses.contains(&WorkerStatus::Available));
    master.stop();
}

#[test]
fn failed_instance_respawns_within_budget() {
    let mut master = Taskmaster::new();
    master.set_executable(env!("CARGO_BIN_EXE_task_worker"));
    master.set_start_timeout(Duration::from_secs(30));
    master
        .add_worker(Worker::process().with_max_respawns(1))
        .expect("process workers enroll without a proxy");

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors_in = errors.clone();
    master.add_task(
        Task::new("crash", json!(null)).on_error(move |e| errors_in.borrow_mut().push(e)),
    );
    let results = Rc::new(RefCell::new(Vec::new()));
    let results_in = results.clone();
    master.add_task(
        Task::new("echo", json!("after respawn"))
            .on_result(move |v| results_in.borrow_mut().push(v)),
    );

    master.wait();
    master.stop();
    assert_eq!(errors.borrow().len(), 1);
    assert_eq!(*results.borrow(), vec![json!("after respawn")]);
}
