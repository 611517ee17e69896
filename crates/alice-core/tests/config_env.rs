//! Environment overrides. Kept in its own test binary because it mutates process env.

use alice_core::AliceConfig;
use std::io::Write;

#[test]
fn environment_overrides_file_and_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[bus]\nport = 9000\n\n[skills]\nmax_reload_attempts = 7\n").unwrap();

    std::env::set_var("ALICE__BUS__PORT", "9100");
    std::env::set_var("ALICE__DISPATCH__ACCEPTANCE_THRESHOLD", "0.65");
    let loaded = AliceConfig::load_from(dir.path().join("alice").to_str().unwrap());
    std::env::remove_var("ALICE__BUS__PORT");
    std::env::remove_var("ALICE__DISPATCH__ACCEPTANCE_THRESHOLD");

    let config = loaded.unwrap();
    assert_eq!(config.bus.port, 9100);
    assert_eq!(config.dispatch.acceptance_threshold, 0.65);
    assert_eq!(config.skills.max_reload_attempts, 7);
    assert_eq!(config.bus.route, "/core");
}
