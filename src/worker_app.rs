fn main() {
    // real deployments link the library from their own binary and register
    // their own entries; this one serves the demo registry
    if let Err(e) = taskmaster::host::run_worker_from_env(taskmaster::host::demo_registry()) {
        eprintln!("task_worker: {}", e);
        std::process::exit(1);
    }
}
