use std::process::Command;

use tempfile::tempdir;

const PASSPHRASE: &str = "a long enough passphrase";

fn seal_config() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_seal-config"));
    command.current_dir(env!("CARGO_TARGET_TMPDIR"));
    command
}

#[test]
fn seals_and_opens_a_file() {
    let dir = tempdir().unwrap();
    let input = dir.path().join(".env");
    std::fs::write(&input, "MASTER_KEY_ENCRYPTION_KEY=deadbeef\n").unwrap();

    let status = seal_config()
        .env("CONFIG_PASSPHRASE", PASSPHRASE)
        .arg("seal")
        .arg(&input)
        .status()
        .expect("failed to run seal-config");
    assert!(status.success());

    let sealed = dir.path().join(".env.encrypted");
    let contents = std::fs::read_to_string(&sealed).unwrap();
    assert!(!contents.contains("deadbeef"));
    assert!(contents.contains("\"version\": 1"));
    let backups = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with(".env.backup.") && name.ends_with(".enc")
        })
        .count();
    assert_eq!(backups, 1);

    let restored = dir.path().join("restored.env");
    let status = seal_config()
        .env("CONFIG_PASSPHRASE", PASSPHRASE)
        .arg("open")
        .arg(&sealed)
        .arg("--output")
        .arg(&restored)
        .status()
        .expect("failed to run seal-config");
    assert!(status.success());
    assert_eq!(
        std::fs::read_to_string(&restored).unwrap(),
        "MASTER_KEY_ENCRYPTION_KEY=deadbeef\n"
    );
}

#[test]
fn refuses_short_passphrase() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("app.conf");
    std::fs::write(&input, "x=1\n").unwrap();

    let output = seal_config()
        .env("CONFIG_PASSPHRASE", "short")
        .arg("seal")
        .arg(&input)
        .output()
        .expect("failed to run seal-config");
    assert!(!output.status.success());
    assert!(!dir.path().join("app.conf.encrypted").exists());
}

#[test]
fn wrong_passphrase_does_not_open() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("app.conf");
    std::fs::write(&input, "x=1\n").unwrap();
    let status = seal_config()
        .env("CONFIG_PASSPHRASE", PASSPHRASE)
        .arg("seal")
        .arg(&input)
        .status()
        .expect("failed to run seal-config");
    assert!(status.success());

    let output = seal_config()
        .env("CONFIG_PASSPHRASE", "a different passphrase")
        .arg("open")
        .arg(dir.path().join("app.conf.encrypted"))
        .output()
        .expect("failed to run seal-config");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
