//! The fork-via-proxy switch: auto-detected workers route through one shared
//! proxy runtime, which hosts every instance over a single multiplexed
//! socket.
//!
//! Kept alone in this file because it mutates process environment.
#![cfg(unix)]

use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use taskmaster::{Task, Taskmaster, WorkerStatus};

#[test]
fn proxied_workers_fan_out_and_terminate_cleanly() {
    // SAFETY: this is the only test in this binary, so nothing races the
    // environment mutation.
    unsafe { std::env::set_var("TASKMASTER_FORK_PROXY", "1") };

    let mut master = Taskmaster::new();
    master.set_executable(env!("CARGO_BIN_EXE_task_worker"));
    master.set_proxy_executable(env!("CARGO_BIN_EXE_task_proxy"));
    master.set_socket_wait_time(Duration::from_micros(1000));
    master.set_start_timeout(Duration::from_secs(30));
    master
        .auto_detect_workers(3)
        .expect("proxied process workers");

    let results = Rc::new(RefCell::new(Vec::new()));
    for n in 0..9 {
        let results = results.clone();
        master.add_task(
            Task::new("echo", json!(n)).on_result(move |v| results.borrow_mut().push(v)),
        );
    }

    master.wait();

    let mut seen: Vec<i64> = results
        .borrow()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    seen.sort();
    assert_eq!(seen, (0..9).collect::<Vec<i64>>());

    master.stop();
    assert!(master
        .workers()
        .iter()
        .all(|w| w.status() == WorkerStatus::Finished));
}
