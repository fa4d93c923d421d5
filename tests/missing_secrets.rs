use std::process::Command;

const SECRETS: [&str; 4] = [
    "RATE_LIMIT_SALT",
    "AUDIT_SALT",
    "AUDIT_SECRET",
    "MASTER_KEY_ENCRYPTION_KEY",
];

fn host() -> Command {
    let exe = env!("CARGO_BIN_EXE_aegis");
    let mut command = Command::new(exe);
    // Keep a stray .env in the working directory out of the picture.
    command.current_dir(env!("CARGO_TARGET_TMPDIR"));
    for var in SECRETS {
        command.env_remove(var).env_remove(format!("{var}_FILE"));
    }
    command
}

#[test]
fn fails_without_any_secrets() {
    let output = host().output().expect("failed to run aegis binary");
    assert!(!output.status.success());
}

#[test]
fn fails_when_one_secret_is_missing() {
    let output = host()
        .env("RATE_LIMIT_SALT", "salt-a")
        .env("AUDIT_SALT", "salt-b")
        .env("AUDIT_SECRET", "secret")
        .output()
        .expect("failed to run aegis binary");
    assert!(!output.status.success());
}

#[test]
fn fails_on_short_master_key() {
    let output = host()
        .env("RATE_LIMIT_SALT", "salt-a")
        .env("AUDIT_SALT", "salt-b")
        .env("AUDIT_SECRET", "secret")
        .env("MASTER_KEY_ENCRYPTION_KEY", "abcd")
        .output()
        .expect("failed to run aegis binary");
    assert!(!output.status.success());
}
