fn main() {
    if let Err(err) = lockstep_lib::run() {
        log::error!("{err}");
        eprintln!("lockstep: {err}");
        std::process::exit(1);
    }
}
