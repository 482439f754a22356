//! Hush CLI tools: identity keys, file encryption, diagnostics.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use hush_common::config::load_config_or_default;
use hush_common::helpers::constant_time_eq;
use hush_crypto::{
    cipher, EncryptedFile, EncryptedKeyBlob, HandshakeEngine, HandshakeRegistry,
    IdentityKeyManager, PrincipalId, PublicIdentity, ReplayGuard, SecureChannel, SecurityConfig,
    SessionKey, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "hush")]
#[command(about = "Hush CLI tools")]
struct Args {
    /// JSON security config (missing fields use defaults)
    #[arg(long, global = true, env = "HUSH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new identity and store it wrapped under a passphrase
    Keygen {
        /// Output file path (without extension)
        #[arg(short, long, default_value = "hush")]
        output: String,

        #[arg(long, env = "HUSH_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },

    /// Show the principal id from a public key file
    ShowId {
        /// Public key file path
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Change the passphrase protecting an identity key file
    Passwd {
        #[arg(short, long)]
        key: PathBuf,

        #[arg(long, env = "HUSH_PASSPHRASE", hide_env_values = true)]
        passphrase: String,

        #[arg(long, env = "HUSH_NEW_PASSPHRASE", hide_env_values = true)]
        new_passphrase: String,

        /// Repeat of the new passphrase
        #[arg(long, env = "HUSH_NEW_PASSPHRASE_CONFIRM", hide_env_values = true)]
        confirm: String,
    },

    /// Encrypt a file with an exported session key
    EncryptFile {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Base64 session key
        #[arg(long, env = "HUSH_SESSION_KEY", hide_env_values = true)]
        session_key: String,
    },

    /// Decrypt a file produced by `encrypt-file`
    DecryptFile {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Base64 session key
        #[arg(long, env = "HUSH_SESSION_KEY", hide_env_values = true)]
        session_key: String,
    },

    /// Run a local handshake and message exchange between two fresh identities
    Selftest {
        /// Print the negotiated session key (base64) for use with encrypt-file
        #[arg(long)]
        export_key: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    hush_common::init_tracing();

    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref())
        .context("failed to load security config")?;

    match args.command {
        Command::Keygen { output, passphrase } => {
            let manager = IdentityKeyManager::new(config.key_wrap);
            let keypair = manager.generate()?;
            let blob = manager.wrap(&keypair, &passphrase)?;

            let private_path = PathBuf::from(format!("{}.key", output));
            let public_path = PathBuf::from(format!("{}.pub", output));

            write_key_blob(&private_path, &blob)?;
            fs::write(&public_path, format!("{}\n", keypair.principal_id()))
                .with_context(|| format!("failed to write {}", public_path.display()))?;

            println!("Private key:  {}", private_path.display());
            println!("Public key:   {}", public_path.display());
            println!("Principal ID: {}", keypair.principal_id());
        }
        Command::ShowId { key } => {
            let identity = read_public_identity(&key)?;
            println!("{}", identity.principal_id());
            println!("Fingerprint:  {}", hex::encode(identity.as_bytes()));
        }
        Command::Passwd {
            key,
            passphrase,
            new_passphrase,
            confirm,
        } => {
            if !constant_time_eq(&new_passphrase, &confirm) {
                bail!("new passphrase and confirmation do not match");
            }

            let manager = IdentityKeyManager::new(config.key_wrap);
            let blob = read_key_blob(&key)?;
            let rewrapped = manager.rewrap(&blob, &passphrase, &new_passphrase)?;
            write_key_blob(&key, &rewrapped)?;

            println!("Passphrase changed for {}", key.display());
        }
        Command::EncryptFile {
            input,
            output,
            session_key,
        } => {
            let key = parse_session_key(&session_key)?;
            let data = fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;

            let file = encrypt_file(&key, &data, &config)?;
            fs::write(&output, serde_json::to_vec_pretty(&file)?)
                .with_context(|| format!("failed to write {}", output.display()))?;

            info!(chunks = file.total_chunks, bytes = file.total_size, "file encrypted");
            println!("Encrypted {} -> {}", input.display(), output.display());
        }
        Command::DecryptFile {
            input,
            output,
            session_key,
        } => {
            let key = parse_session_key(&session_key)?;
            let raw = fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let file: EncryptedFile =
                serde_json::from_slice(&raw).context("not an encrypted file")?;

            let data = cipher::decrypt_chunked(&key, &file)?;
            fs::write(&output, &data)
                .with_context(|| format!("failed to write {}", output.display()))?;

            println!("Decrypted {} -> {}", input.display(), output.display());
        }
        Command::Selftest { export_key } => {
            let key = selftest(&config)?;
            println!("Selftest passed");
            if export_key {
                println!("Session key:  {}", key.to_base64());
            }
        }
        Command::Version => {
            println!("hush {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn write_key_blob(path: &Path, blob: &EncryptedKeyBlob) -> Result<()> {
    let json = serde_json::to_vec_pretty(blob)?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        file.write_all(&json)?;
    }

    #[cfg(not(unix))]
    fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

fn read_key_blob(path: &Path) -> Result<EncryptedKeyBlob> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).context("not a Hush key file")
}

fn read_public_identity(path: &Path) -> Result<PublicIdentity> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let id = PrincipalId::parse(raw.trim()).context("not a Hush public key file")?;
    Ok(PublicIdentity::from_principal_id(&id)?)
}

fn parse_session_key(encoded: &str) -> Result<SessionKey> {
    match SessionKey::from_base64(encoded) {
        Some(key) => Ok(key),
        None => bail!("session key must be 32 bytes of base64"),
    }
}

fn encrypt_file(key: &SessionKey, data: &[u8], config: &SecurityConfig) -> Result<EncryptedFile> {
    Ok(cipher::encrypt_chunked(key, data, config.cipher.chunk_size)?)
}

/// Handshake, one message each way and a replay attempt, all in memory.
fn selftest(config: &SecurityConfig) -> Result<SessionKey> {
    let manager = IdentityKeyManager::new(config.key_wrap);
    let alice = manager.generate()?;
    let bob = manager.generate()?;
    let alice_id = alice.principal_id();
    let bob_id = bob.principal_id();

    let mut alice_registry =
        HandshakeRegistry::new(HandshakeEngine::new(config.handshake, SystemClock));
    let mut bob_registry =
        HandshakeRegistry::new(HandshakeEngine::new(config.handshake, SystemClock));

    let init = alice_registry.initiate(&bob_id, &alice)?;
    let (bob_key, response) =
        bob_registry.respond(&alice_id, &init, &alice.public_identity(), &bob)?;
    let alice_key = alice_registry.complete(&bob_id, &response, &bob.public_identity())?;

    if !alice_key.ct_eq(&bob_key) {
        bail!("handshake produced mismatched session keys");
    }
    info!(initiator = %alice_id, responder = %bob_id, "handshake ok");

    let mut alice_channel = SecureChannel::new(
        alice_key.clone(),
        alice_id.clone(),
        bob_id.clone(),
        Arc::new(ReplayGuard::new(config.replay)),
        SystemClock,
    );
    let mut bob_channel = SecureChannel::new(
        bob_key,
        bob_id,
        alice_id,
        Arc::new(ReplayGuard::new(config.replay)),
        SystemClock,
    );

    let envelope = alice_channel.seal(b"ping")?;
    if bob_channel.open(&envelope)? != b"ping" {
        bail!("message corrupted in transit");
    }
    if bob_channel.open(&envelope).is_ok() {
        bail!("replayed envelope was accepted");
    }

    let reply = bob_channel.seal(b"pong")?;
    if alice_channel.open(&reply)? != b"pong" {
        bail!("reply corrupted in transit");
    }
    info!("message exchange ok");

    Ok(alice_key)
}
