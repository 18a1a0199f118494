fn main() {
    if let Err(err) = lockstep_lib::run_listener() {
        log::error!("{err}");
        eprintln!("listener: {err}");
        std::process::exit(1);
    }
}
