//! Client side of `cmid`'s control socket.
use std::env;
use std::fs;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail};
use uuid::Uuid;

use cmi::control::{Request, Response, ResponseKind};

const MAX_MSG_LEN: usize = 65536;

const DEFAULT_CMI_PREFIX: &str = "/tmp/cmi";
const DEFAULT_CMI_CONTROL: &str = "control.sock";

lazy_static::lazy_static! {
    pub static ref CMI_PREFIX: PathBuf = {
        env::var("CMI_PREFIX").map_or_else(|_| PathBuf::from(DEFAULT_CMI_PREFIX), PathBuf::from)
    };

    pub static ref CMI_CONTROL_SOCK: PathBuf = {
        env::var("CMI_CONTROL")
            .map_or_else(|_| PathBuf::from(DEFAULT_CMI_CONTROL), PathBuf::from)
    };
}

/// Removes the client socket file when done.
struct ClientSock {
    sock: UnixDatagram,
    path: PathBuf,
}

impl ClientSock {
    fn bind() -> anyhow::Result<Self> {
        if !CMI_PREFIX.is_dir() {
            bail!("{:?} is not a directory, is cmid running?", *CMI_PREFIX);
        }
        let arg0 = env::args().next().unwrap_or_else(|| "cmictl".to_string());
        let appname = Path::new(&arg0)
            .file_name()
            .map_or_else(|| "cmictl".into(), |n| n.to_string_lossy());
        let path = CMI_PREFIX.join(format!("cmi-client-{}_{}.sock", appname, Uuid::new_v4()));
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let sock = UnixDatagram::bind(&path)?;
        Ok(ClientSock { sock, path })
    }
}

impl Drop for ClientSock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Sends one request to the daemon and waits for its answer.
pub fn request(req: &Request, timeout: Duration) -> anyhow::Result<ResponseKind> {
    let client = ClientSock::bind()?;
    client.sock.set_read_timeout(Some(timeout))?;

    let buf = bincode::serialize(req)?;
    assert!(buf.len() < MAX_MSG_LEN);
    let service_path = CMI_PREFIX.join(CMI_CONTROL_SOCK.as_path());
    client
        .sock
        .send_to(&buf, &service_path)
        .map_err(|e| anyhow!("cannot reach cmid at {:?}: {}", service_path, e))?;

    let mut buf = vec![0u8; MAX_MSG_LEN];
    let (n, sender) = client.sock.recv_from(buf.as_mut_slice())?;
    if sender.as_pathname() != Some(service_path.as_ref()) {
        bail!("unexpected reply from {:?}", sender);
    }
    let res: Response = bincode::deserialize(&buf[..n])?;
    res.0.map_err(|e| anyhow!("cmid: {}", e))
}

/// Reply timeout for a request that itself waits up to `inner_ms`.
pub fn reply_timeout(inner_ms: u64) -> Duration {
    Duration::from_millis(inner_ms) + Duration::from_secs(2)
}
