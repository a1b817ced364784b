//! Coverage for config parsing, env overrides and credential resolution.

use std::collections::HashMap;

use matrix_relay::channel::ChannelError;
use matrix_relay::config::{data_dir, Config, MatrixConfig};
use matrix_relay::matrix::Credentials;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

fn parse(toml_str: &str) -> Config {
    match Config::from_toml(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("config should parse: {err:#}"),
    }
}

#[test]
fn parse_full_config() {
    let config = parse(
        r#"
[matrix]
homeserver_url = "https://matrix.example.org"
username = "andy"
password = "hunter2"
initial_sync_timeout_secs = 10

[assistant]
name = "Nova"

[groups."mx:!ops:example.org"]
name = "Ops"
folder = "ops"
trigger = "@Nova"
"#,
    );
    assert_eq!(config.matrix.homeserver_url.as_deref(), Some("https://matrix.example.org"));
    assert_eq!(config.matrix.initial_sync_timeout_secs, 10);
    assert_eq!(config.assistant.name, "Nova");

    let groups = config.registered_groups();
    let ops = match groups.get("mx:!ops:example.org") {
        Some(group) => group,
        None => panic!("group should be registered"),
    };
    assert_eq!(ops.folder, "ops");
    assert_eq!(ops.trigger.as_deref(), Some("@Nova"));
    assert!(ops.requires_trigger);
}

#[test]
fn invalid_toml_is_an_error() {
    assert!(Config::from_toml("[matrix\nhomeserver_url = 1").is_err());
}

#[test]
fn env_overrides_file_values() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(
        &path,
        "[matrix]\nhomeserver_url = \"https://file.example.org\"\n[assistant]\nname = \"File\"\n",
    )
    .expect("write config");

    let config = Config::load_with(
        Some(path.as_path()),
        env_of(&[
            ("MATRIX_HOMESERVER", "https://env.example.org"),
            ("MATRIX_ACCESS_TOKEN", "syt_env"),
            ("ASSISTANT_NAME", "Env"),
        ]),
    )
    .expect("load");

    assert_eq!(config.matrix.homeserver_url.as_deref(), Some("https://env.example.org"));
    assert_eq!(config.matrix.access_token.as_deref(), Some("syt_env"));
    assert_eq!(config.assistant.name, "Env");
}

#[test]
fn blank_assistant_name_keeps_default() {
    let config = Config::load_with(
        Some(std::path::Path::new("/nonexistent/matrix-relay.toml")),
        env_of(&[("ASSISTANT_NAME", "  ")]),
    )
    .expect("missing file yields defaults");
    assert_eq!(config.assistant.name, "Andy");
}

#[test]
fn config_path_comes_from_env_when_not_given() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("relay.toml");
    std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").expect("write config");
    let path_str = path.to_string_lossy().into_owned();

    let config =
        Config::load_with(None, env_of(&[("MATRIX_RELAY_CONFIG", path_str.as_str())])).expect("load");
    assert_eq!(config.logging.level, "debug");
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

fn matrix(token: Option<&str>, username: Option<&str>, password: Option<&str>) -> MatrixConfig {
    MatrixConfig {
        homeserver_url: Some("https://matrix.example.org".to_owned()),
        access_token: token.map(str::to_owned),
        user_id: token.map(|_| "@andy:example.org".to_owned()),
        username: username.map(str::to_owned),
        password: password.map(str::to_owned),
        ..MatrixConfig::default()
    }
}

#[test]
fn token_wins_over_password() {
    let creds = matrix(Some("syt"), Some("andy"), Some("pw"))
        .credentials()
        .expect("credentials");
    assert_eq!(
        creds,
        Credentials::AccessToken {
            token: "syt".to_owned(),
            user_id: "@andy:example.org".to_owned(),
        }
    );
}

#[test]
fn token_requires_its_user_id() {
    let mut config = matrix(Some("syt"), Some("andy"), Some("pw"));
    config.user_id = Some("  ".to_owned());
    assert!(matches!(config.credentials(), Err(ChannelError::Config(_))));
}

#[test]
fn password_needs_both_halves() {
    assert!(matches!(
        matrix(None, Some("andy"), Some("pw")).credentials(),
        Ok(Credentials::Password { .. })
    ));
    assert!(matches!(
        matrix(None, Some("andy"), None).credentials(),
        Err(ChannelError::Config(_))
    ));
    assert!(matches!(
        matrix(Some("  "), None, Some("pw")).credentials(),
        Err(ChannelError::Config(_))
    ));
}

#[test]
fn blank_homeserver_is_rejected() {
    let mut config = matrix(Some("syt"), None, None);
    config.homeserver_url = Some("   ".to_owned());
    assert!(matches!(config.homeserver_url(), Err(ChannelError::Config(_))));
}

#[test]
fn data_dir_resolves() {
    let path = match data_dir() {
        Ok(path) => path,
        Err(err) => panic!("data dir should resolve: {err}"),
    };
    assert!(path.ends_with(".matrix-relay"));
}
