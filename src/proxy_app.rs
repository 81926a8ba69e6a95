fn main() {
    if let Err(e) = taskmaster::host::run_proxy_from_env() {
        eprintln!("task_proxy: {}", e);
        std::process::exit(1);
    }
}
