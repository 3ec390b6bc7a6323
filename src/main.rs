fn main() {
    if let Err(error) = market_pulse_lib::run() {
        eprintln!("market-pulse: {error}");
        std::process::exit(1);
    }
}
