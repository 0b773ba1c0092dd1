//! Optional SFTP service: TCP/22323, gated behind the `sftp` Cargo feature. Built on
//! `russh`/`russh-sftp`, the SSH/SFTP crates this workspace depends on for talking to guest-side
//! agents over SSH — reused here server-side to serve `cfg.sftp_root` to the guest.
//!
//! `russh`'s server runner wants a real `AsyncRead + AsyncWrite` stream, which `VirtTcp` does
//! not implement directly (it only implements the fabric's own `FullDuplex`, see `pump.rs`).
//! Rather than hand-roll a second adapter, each accepted connection is bridged onto one half of
//! a `tokio::io::duplex` with the existing `pump` helper, and `russh` drives the other half.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Config as SshConfig, Handler as SshHandlerTrait, Msg, Session};
use russh::{Channel, ChannelId};
use russh_sftp::protocol::{Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode};
use tracing::{debug, warn};

use crate::config::FabricConfig;
use crate::stack::{NetStack, VirtTcp};

const SFTP_PORT: u16 = 22323;
const BRIDGE_BUF: usize = 256 * 1024;

pub async fn run(cfg: Arc<FabricConfig>, stack: Arc<NetStack>) -> std::io::Result<()> {
    let ssh_config = Arc::new(sshd_config());
    let addr_v4 = SocketAddr::new(IpAddr::V4(cfg.service_v4), SFTP_PORT);
    let addr_v6 = SocketAddr::new(IpAddr::V6(cfg.service_v6), SFTP_PORT);

    let mut conns_v4 = stack
        .bind_tcp_service(addr_v4)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut conns_v6 = stack
        .bind_tcp_service(addr_v6)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let root_v6 = cfg.sftp_root.clone();
    let ssh_config_v6 = ssh_config.clone();
    tokio::spawn(async move {
        while let Some(conn) = conns_v6.recv().await {
            tokio::spawn(serve_connection(conn, ssh_config_v6.clone(), root_v6.clone()));
        }
    });

    while let Some(conn) = conns_v4.recv().await {
        tokio::spawn(serve_connection(conn, ssh_config.clone(), cfg.sftp_root.clone()));
    }
    Ok(())
}

fn sshd_config() -> SshConfig {
    SshConfig {
        auth_rejection_time: std::time::Duration::from_millis(0),
        keys: vec![russh::keys::PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
            .expect("generate sftp host key")],
        ..Default::default()
    }
}

async fn serve_connection(virt: VirtTcp, ssh_config: Arc<SshConfig>, root: PathBuf) {
    let (mut local, remote) = tokio::io::duplex(BRIDGE_BUF);
    let mut virt = virt;
    tokio::spawn(async move {
        if let Err(e) = crate::pump::pump(&mut virt, &mut local).await {
            debug!(error = %e, "sftp bridge pump ended");
        }
    });

    let handler = SshSession { root, channels: HashMap::new() };
    if let Err(e) = russh::server::run_stream(ssh_config, remote, handler).await {
        warn!(error = %e, "sftp ssh session ended with error");
    }
}

/// SSH-level handler: accepts the one channel and `sftp` subsystem request the guest opens,
/// then hands the raw channel stream off to `russh_sftp` to speak the actual protocol (§4.G).
/// Credentials are not meaningful here — the fabric's link endpoint is already a private,
/// single-peer channel between this process and the one guest it serves.
struct SshSession {
    root: PathBuf,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SshHandlerTrait for SshSession {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id);
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);
        let root = self.root.clone();
        tokio::spawn(async move {
            let stream = channel.into_stream();
            if let Err(e) = russh_sftp::server::run(stream, SftpFiles::new(root)).await {
                warn!(error = %e, "sftp protocol session ended");
            }
        });
        Ok(())
    }
}

/// Protocol-level handler: implements the subset of SFTP operations needed to browse and read
/// `root` (§4.G: "serves files"). Writes, renames, and symlinks are intentionally unsupported —
/// this listener is a read-only diagnostic file share, not a general-purpose SSH/SFTP server.
struct SftpFiles {
    root: PathBuf,
    next_handle: u64,
    open_files: HashMap<String, tokio::fs::File>,
    open_dirs: HashMap<String, Vec<PathBuf>>,
}

impl SftpFiles {
    fn new(root: PathBuf) -> Self {
        SftpFiles { root, next_handle: 0, open_files: HashMap::new(), open_dirs: HashMap::new() }
    }

    fn new_handle(&mut self) -> String {
        self.next_handle += 1;
        self.next_handle.to_string()
    }

    fn resolve(&self, requested: &str) -> Result<PathBuf, StatusCode> {
        root_relative(&self.root, requested).ok_or(StatusCode::PermissionDenied)
    }
}

#[async_trait]
impl russh_sftp::server::Handler for SftpFiles {
    type Error = StatusCode;

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = self.resolve(&path)?;
        let display = resolved.strip_prefix(&self.root).unwrap_or(&resolved);
        Ok(Name {
            id,
            files: vec![File::new(format!("/{}", display.display()), FileAttributes::default())],
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.stat(id, path).await
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let resolved = self.resolve(&path)?;
        let meta = tokio::fs::metadata(&resolved).await.map_err(|_| StatusCode::NoSuchFile)?;
        Ok(Attrs { id, attrs: attrs_from_metadata(&meta) })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let resolved = self.resolve(&path)?;
        let mut entries = tokio::fs::read_dir(&resolved).await.map_err(|_| StatusCode::NoSuchFile)?;
        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            paths.push(entry.path());
        }
        let handle = self.new_handle();
        self.open_dirs.insert(handle.clone(), paths);
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entries = self.open_dirs.get_mut(&handle).ok_or(StatusCode::Failure)?;
        if entries.is_empty() {
            return Err(StatusCode::Eof);
        }
        let mut files = Vec::new();
        for path in entries.drain(..) {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let attrs = match tokio::fs::metadata(&path).await {
                Ok(meta) => attrs_from_metadata(&meta),
                Err(_) => FileAttributes::default(),
            };
            files.push(File::new(name, attrs));
        }
        Ok(Name { id, files })
    }

    async fn open(&mut self, id: u32, filename: String, pflags: OpenFlags, _attrs: FileAttributes) -> Result<Handle, Self::Error> {
        if pflags.contains(OpenFlags::WRITE) || pflags.contains(OpenFlags::CREATE) {
            return Err(StatusCode::PermissionDenied);
        }
        let resolved = self.resolve(&filename)?;
        let file = tokio::fs::File::open(&resolved).await.map_err(|_| StatusCode::NoSuchFile)?;
        let handle = self.new_handle();
        self.open_files.insert(handle.clone(), file);
        Ok(Handle { id, handle })
    }

    async fn read(&mut self, id: u32, handle: String, offset: u64, len: u32) -> Result<Data, Self::Error> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let file = self.open_files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| StatusCode::Failure)?;
        let mut buf = vec![0u8; len as usize];
        let n = file.read(&mut buf).await.map_err(|_| StatusCode::Failure)?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        buf.truncate(n);
        Ok(Data { id, data: buf })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.open_files.remove(&handle);
        self.open_dirs.remove(&handle);
        Ok(Status { id, status_code: StatusCode::Ok, error_message: "ok".into(), language_tag: "en-US".into() })
    }
}

fn attrs_from_metadata(meta: &std::fs::Metadata) -> FileAttributes {
    let mut attrs = FileAttributes::default();
    attrs.size = Some(meta.len());
    attrs
}

/// Confines an SFTP-requested path underneath the configured root (§4.G), rejecting `..`
/// components so a client cannot escape the served tree.
fn root_relative(root: &Path, requested: &str) -> Option<PathBuf> {
    let requested = requested.trim_start_matches('/');
    let mut depth: i32 = 0;
    for component in Path::new(requested).components() {
        use std::path::Component;
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return None;
        }
    }
    Some(root.join(requested))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_relative_confines_to_root() {
        let root = Path::new("/srv/shared");
        assert_eq!(root_relative(root, "docs/readme.txt"), Some(PathBuf::from("/srv/shared/docs/readme.txt")));
    }

    #[test]
    fn root_relative_rejects_parent_traversal() {
        let root = Path::new("/srv/shared");
        assert_eq!(root_relative(root, "../../etc/passwd"), None);
    }
}
