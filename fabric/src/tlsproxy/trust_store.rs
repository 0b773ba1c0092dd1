//! One-shot OS trust-store import for the MITM root CA (spec §4.I, §9 wormhole note: "assume
//! the fabric provides an HTTP control plane... to accept them" — the cert import itself still
//! has to land in the OS trust store somehow, and on macOS that is the `security` command-line
//! tool, not a library call). Runs once, bounded, best-effort: a failed import just means the
//! host browser will show a cert warning on the first `*.local` visit, not that the proxy stops
//! working.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

const IMPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Imports `cert_pem` into the login keychain's trust settings via `security add-trusted-cert`.
/// No-op (logged) on non-macOS targets, since there is no equivalent single command — this
/// fabric does not attempt to guess a Linux distribution's CA bundle layout.
pub async fn import(cert_pem: &str) {
    if cfg!(not(target_os = "macos")) {
        warn!("tls proxy root CA was minted but automatic trust-store import is only implemented for macOS");
        return;
    }
    let result = tokio::time::timeout(IMPORT_TIMEOUT, import_macos(cert_pem)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "failed to import tls proxy root CA into the system trust store"),
        Err(_) => warn!("importing tls proxy root CA into the system trust store timed out"),
    }
}

#[cfg(target_os = "macos")]
async fn import_macos(cert_pem: &str) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new()?;
    use std::io::Write;
    tmp.write_all(cert_pem.as_bytes())?;
    tmp.flush()?;

    let mut child = Command::new("security")
        .args(["add-trusted-cert", "-d", "-r", "trustRoot", "-k"])
        .arg(login_keychain_path())
        .arg(tmp.path())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.shutdown().await;
    }
    let status = child.wait().await?;
    if !status.success() {
        return Err(std::io::Error::other(format!("security add-trusted-cert exited with {status}")));
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
async fn import_macos(_cert_pem: &str) -> std::io::Result<()> {
    Ok(())
}

#[cfg(target_os = "macos")]
fn login_keychain_path() -> std::path::PathBuf {
    let home = std::env::var_os("HOME").map(std::path::PathBuf::from).unwrap_or_default();
    home.join("Library/Keychains/login.keychain-db")
}
