use std::io::BufRead;
use std::path::{Path, PathBuf};

use aegis::crypto::CryptoPrimitives;
use aegis::envelope::{self, ConfigEnvelope};
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use zeroize::Zeroizing;

/// Seals configuration files under a passphrase and opens them again.
#[derive(Parser)]
#[command(name = "seal-config", version)]
struct Cli {
    /// Read from the environment; prompted on stdin when unset.
    #[arg(long, env = "CONFIG_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt a plaintext file into `<input>.encrypted` plus a timestamped backup.
    Seal {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decrypt an envelope back to plaintext.
    Open {
        envelope: PathBuf,
        /// Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    dotenv().ok();

    let cli = Cli::parse();
    let passphrase = match cli.passphrase {
        Some(value) => Zeroizing::new(value),
        None => prompt_passphrase()?,
    };
    envelope::check_passphrase(&passphrase)?;

    let crypto = CryptoPrimitives::new();
    match cli.command {
        Command::Seal { input, output } => seal(&crypto, &input, output, &passphrase),
        Command::Open { envelope, output } => open(&crypto, &envelope, output, &passphrase),
    }
}

fn seal(
    crypto: &CryptoPrimitives,
    input: &Path,
    output: Option<PathBuf>,
    passphrase: &str,
) -> anyhow::Result<()> {
    let plaintext = Zeroizing::new(
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?,
    );
    let sealed = ConfigEnvelope::seal(crypto, &plaintext, passphrase, Utc::now())?;
    let paths = match output {
        Some(primary) => sealed.write_as(input, primary)?,
        None => sealed.write(input)?,
    };
    info!(
        primary = %paths.primary.display(),
        backup = %paths.backup.display(),
        "configuration sealed"
    );
    Ok(())
}

fn open(
    crypto: &CryptoPrimitives,
    path: &Path,
    output: Option<PathBuf>,
    passphrase: &str,
) -> anyhow::Result<()> {
    let sealed =
        ConfigEnvelope::read(path).with_context(|| format!("reading {}", path.display()))?;
    let plaintext = sealed.open(crypto, passphrase)?;
    match output {
        Some(target) => {
            envelope::write_private(&target, &plaintext)?;
            info!(output = %target.display(), "configuration opened");
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&plaintext)?;
        }
    }
    Ok(())
}

fn prompt_passphrase() -> anyhow::Result<Zeroizing<String>> {
    eprint!("passphrase: ");
    let mut line = Zeroizing::new(String::new());
    std::io::stdin().lock().read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(Zeroizing::new(trimmed.to_string()))
}
