fn main() {
    // ESP-IDF build system only runs for device targets (xtensa or riscv espidf).
    // Build scripts run on the host, so we check the TARGET env var
    if let Ok(target) = std::env::var("TARGET") {
        if target.contains("espidf") {
            embuild::espidf::sysenv::output();
        }
    }
}
