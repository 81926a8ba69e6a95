//! End-to-end scenarios on synchronous workers: the full protocol runs over
//! in-process loopback sockets, so these are deterministic and fast.

use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use taskmaster::task::TaskError;
use taskmaster::{Task, TaskFactory, TaskRegistry, Taskmaster, Worker, WorkerStatus};

fn echo_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("echo", |payload, _ctx| Ok(payload.clone()));
    registry
}

#[test]
fn sync_echo_completes_tasks_in_order() {
    let mut master = Taskmaster::new();
    master
        .add_worker(Worker::synchronous(echo_registry()))
        .unwrap();

    let results = Rc::new(RefCell::new(Vec::new()));
    for n in [1, 2, 3] {
        let results = results.clone();
        master.add_task(
            Task::new("echo", json!(n)).on_result(move |v| results.borrow_mut().push(v)),
        );
    }

    master.wait();
    assert_eq!(*results.borrow(), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(master.pending_tasks(), 0);
}

#[test]
fn child_callback_into_parent_returns_its_value() {
    let mut registry = TaskRegistry::new();
    registry.register("double_via_parent", |payload, ctx| {
        ctx.call_parent("computeHelper", std::slice::from_ref(payload))
    });

    let mut master = Taskmaster::new();
    master.add_worker(Worker::synchronous(registry)).unwrap();

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
    assert_eq!(*results.borrow(), vec![json!(14)]);
}

#[test]
fn unknown_parent_function_fails_the_task() {
    let mut registry = TaskRegistry::new();
    registry.register("bad_call", |_payload, ctx| ctx.call_parent("missing", &[]));

    let mut master = Taskmaster::new();
    master.add_worker(Worker::synchronous(registry)).unwrap();

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors_in = errors.clone();
    master.add_task(
        Task::new("bad_call", Value::Null).on_error(move |e| errors_in.borrow_mut().push(e)),
    );

    master.wait();
    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        TaskError::Exception { message, .. } => {
            assert!(message.contains("unknown function missing"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn entry_failure_routes_to_the_error_hook() {
    let mut registry = TaskRegistry::new();
    registry.register("boom", |_payload, _ctx| {
        Err(taskmaster::task::TaskFailure::new("division by zero"))
    });

    let mut master = Taskmaster::new();
    master.add_worker(Worker::synchronous(registry)).unwrap();

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors_in = errors.clone();
    master.add_task(
        Task::new("boom", Value::Null).on_error(move |e| errors_in.borrow_mut().push(e)),
    );

    master.wait();
    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        TaskError::Exception { message, .. } => assert_eq!(message, "division by zero"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn unknown_entry_routes_to_the_error_hook() {
    let mut master = Taskmaster::new();
    master
        .add_worker(Worker::synchronous(echo_registry()))
        .unwrap();

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors_in = errors.clone();
    master.add_task(
        Task::new("no_such_entry", Value::Null)
            .on_error(move |e| errors_in.borrow_mut().push(e)),
    );

    master.wait();
    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], TaskError::Error(msg) if msg.contains("no_such_entry")));
}

#[test]
fn groups_segregate_tasks_per_worker_in_submission_order() {
    // each worker records what it observed through its own registry
    let observed_a = Rc::new(RefCell::new(Vec::new()));
    let observed_b = Rc::new(RefCell::new(Vec::new()));

    let mut registry_a = TaskRegistry::new();
    {
        let observed = observed_a.clone();
        registry_a.register("observe", move |payload, _ctx| {
            observed.borrow_mut().push(payload.clone());
            Ok(Value::Null)
        });
    }
    let mut registry_b = TaskRegistry::new();
    {
        let observed = observed_b.clone();
        registry_b.register("observe", move |payload, _ctx| {
            observed.borrow_mut().push(payload.clone());
            Ok(Value::Null)
        });
    }

    let mut master = Taskmaster::new();
    master
        .add_worker(Worker::synchronous(registry_a).with_group("A"))
        .unwrap();
    master
        .add_worker(Worker::synchronous(registry_b).with_group("B"))
        .unwrap();

    for (n, group) in [(1, "A"), (2, "A"), (3, "B"), (4, "A"), (5, "B")] {
        master.add_task(Task::new("observe", json!(n)).with_group(group));
    }

    master.wait();
    assert_eq!(*observed_a.borrow(), vec![json!(1), json!(2), json!(4)]);
    assert_eq!(*observed_b.borrow(), vec![json!(3), json!(5)]);
}

struct OneShotFactory {
    task: Option<Task>,
}

impl TaskFactory for OneShotFactory {
    fn create_next_task(&mut self, group: Option<&str>) -> Option<Task> {
        if group.is_some() {
            return None;
        }
        self.task.take()
    }
}

#[test]
fn factory_tasks_run_before_queued_tasks() {
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut registry = TaskRegistry::new();
    {
        let order = order.clone();
        registry.register("mark", move |payload, _ctx| {
            order.borrow_mut().push(payload.clone());
            Ok(Value::Null)
        });
    }

    let mut master = Taskmaster::new();
    master.add_worker(Worker::synchronous(registry)).unwrap();
    master.add_task(Task::new("mark", json!("queued")));
    master.add_task_factory(OneShotFactory {
        task: Some(Task::new("mark", json!("factory"))),
    });

    master.wait();
    assert_eq!(*order.borrow(), vec![json!("factory"), json!("queued")]);
}

#[test]
fn wait_until_all_tasks_are_assigned_drains_the_queue_only() {
    let mut master = Taskmaster::new();
    master
        .add_worker(Worker::synchronous(echo_registry()))
        .unwrap();
    for n in 0..5 {
        master.add_task(Task::new("echo", json!(n)));
    }
    master.wait_until_all_tasks_are_assigned();
    assert_eq!(master.pending_tasks(), 0);
    master.wait();
}

#[test]
fn cloned_workers_share_the_load() {
    let mut master = Taskmaster::new();
    let template = Worker::synchronous(echo_registry());
    master.add_workers(&template, 3).unwrap();

    let count = Rc::new(RefCell::new(0));
    for n in 0..9 {
        let count = count.clone();
        master.add_task(
            Task::new("echo", json!(n)).on_result(move |_| *count.borrow_mut() += 1),
        );
    }
    master.wait();
    assert_eq!(*count.borrow(), 9);
}

#[test]
fn stop_finishes_every_worker() {
    let mut master = Taskmaster::new();
    master
        .add_worker(Worker::synchronous(echo_registry()))
        .unwrap();
    master.add_task(Task::new("echo", json!(1)));
    master.wait();
    master.stop();
    assert!(master
        .workers()
        .iter()
        .all(|w| w.status() == WorkerStatus::Finished));
}

struct CountingFactory {
    produced: u32,
    limit: u32,
    groups: Option<Vec<String>>,
}

impl TaskFactory for CountingFactory {
    fn groups(&self) -> Option<&[String]> {
        self.groups.as_deref()
    }

    fn create_next_task(&mut self, _group: Option<&str>) -> Option<Task> {
        if self.produced == self.limit {
            return None;
        }
        self.produced += 1;
        Some(Task::new("echo", json!(self.produced)))
    }
}

#[test]
fn factories_feed_workers_until_exhausted() {
    let mut master = Taskmaster::new();
    master
        .add_worker(Worker::synchronous(echo_registry()))
        .unwrap();
    master.add_task_factory(CountingFactory {
        produced: 0,
        limit: 4,
        groups: None,
    });

    master.wait();
    assert_eq!(master.pending_tasks(), 0);
}
