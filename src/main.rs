fn main() {
    if let Err(err) = picorder::run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}
