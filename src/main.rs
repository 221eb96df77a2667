fn main() {
    tracing_subscriber::fmt::init();
    println!("mini-quiche {}", mini_quiche::MINI_QUICHE_VERSION);
}
