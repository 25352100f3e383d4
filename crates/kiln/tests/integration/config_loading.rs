use kiln::config::Config;
use kiln::{EXAMPLE_CONFIG, Language};

#[test]
fn test_example_config_parses() {
    let config = Config::parse_toml(EXAMPLE_CONFIG).expect("example config should parse");
    assert_eq!(config.monitor.poll_interval_ms, 100);
    assert_eq!(config.scheduler.compile_attempts, 2);
    assert_eq!(config.toolchains.cpp.compiler, "g++");
}

#[test]
fn test_config_from_file_overrides_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("kiln.toml");
    std::fs::write(
        &path,
        "[limits]\nexecution_timeout = 2.5\n\n[toolchains.c]\ncompiler = \"clang\"\n",
    )
    .unwrap();

    let config = Config::from_file(&path).expect("config should load");
    assert_eq!(config.limits.execution_timeout(), std::time::Duration::from_secs_f64(2.5));
    assert_eq!(config.toolchains.c.compiler, "clang");
    // Untouched sections keep their defaults
    assert_eq!(config.toolchains.cpp.compiler, "g++");
    assert_eq!(config.sessions.idle_timeout(), std::time::Duration::from_secs(1800));
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = Config::parse_toml("[limits]\nexecution_timeout = 0.0\n");
    assert!(result.is_err());
}

#[test]
fn test_language_ids_round_trip() {
    for language in Language::ALL {
        assert_eq!(language.id().parse::<Language>().unwrap(), language);
    }
}
