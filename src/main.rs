fn main() {
    if let Err(e) = shielded_wallet_lib::run() {
        eprintln!("shielded-wallet: {:#}", e);
        std::process::exit(1);
    }
}
