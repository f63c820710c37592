fn main() {
    if let Err(e) = pisonet_ledger_lib::run() {
        eprintln!("pisonet-ledger: {e:#}");
        std::process::exit(1);
    }
}
