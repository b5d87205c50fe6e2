//! Admin control socket. Each datagram carries one bincode `Request`; the `Response`
//! goes back to the sender's bound path.
use std::fs;
use std::io;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use cmi::control::{Request, Response};
use cmi::CmiService;

use crate::config::ControlConfig;

const MAX_MSG_LEN: usize = 65536;

pub struct Control {
    sock: UnixDatagram,
    path: PathBuf,
    service: Arc<CmiService>,
}

impl Control {
    pub fn new(service: Arc<CmiService>, config: &ControlConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.prefix)
            .map_err(|e| anyhow!("failed to create directory {:?}: {}", config.prefix, e))?;

        let path = config.socket_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let sock = UnixDatagram::bind(&path)
            .map_err(|e| anyhow!("cannot bind domain socket at {:?}: {}", path, e))?;
        sock.set_read_timeout(Some(Duration::from_millis(100)))?;
        sock.set_write_timeout(Some(Duration::from_millis(100)))?;
        tracing::info!("control socket at {:?}", path);

        Ok(Control {
            sock,
            path,
            service,
        })
    }

    pub fn mainloop(&mut self, exit_flag: &AtomicBool) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_MSG_LEN];
        while !exit_flag.load(Ordering::Relaxed) {
            match self.sock.recv_from(buf.as_mut_slice()) {
                Ok((size, sender)) => {
                    tracing::debug!("received {} bytes from {:?}", size, sender);
                    if let Err(e) = self.dispatch(&buf[..size], &sender) {
                        tracing::warn!("Control dispatch: {}", e);
                    }
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    if exit_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    tracing::warn!("recv failed: {:?}", e)
                }
            }
        }
        tracing::info!("exiting...");
        Ok(())
    }

    fn dispatch(&self, buf: &[u8], sender: &SocketAddr) -> anyhow::Result<()> {
        let reply_to = sender
            .as_pathname()
            .ok_or_else(|| anyhow!("peer is unnamed, cannot reply"))?;
        let res = match bincode::deserialize::<Request>(buf) {
            Ok(req) => {
                tracing::debug!("control request: {:?}", req);
                self.service.handle_request(req)
            }
            Err(e) => Response(Err(format!("malformed request: {}", e))),
        };
        let buf = bincode::serialize(&res)?;
        self.sock.send_to(&buf, reply_to)?;
        Ok(())
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!("remove {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use cmi::config::{CmiConfig, PoolConfig};
    use cmi::control::ResponseKind;
    use cmi::transport::{LoopbackTransport, Transport};

    use super::*;
    use crate::config::VolumeConfig;
    use crate::volume::Volume;

    #[test]
    fn serves_requests_over_the_socket() {
        let dir = std::env::temp_dir().join(format!("cmid-control-{}", std::process::id()));
        let config = ControlConfig {
            prefix: dir.clone(),
            path: PathBuf::from("control.sock"),
        };

        let (transport, _peer) = LoopbackTransport::pair();
        let volume = Volume::new(VolumeConfig::default()).unwrap();
        let cmi_config = CmiConfig {
            io_conduits: 1,
            pools: PoolConfig {
                large_slot_len: 64 * 1024,
                large_slots: 1,
                small_slot_len: 4096,
                small_slots: 2,
            },
            ..Default::default()
        };
        let service =
            CmiService::new(cmi_config, transport as Arc<dyn Transport>, volume).unwrap();
        service.start().unwrap();

        let mut control = Control::new(Arc::clone(&service), &config).unwrap();
        let exit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exit);
        let server = thread::spawn(move || control.mainloop(&flag));

        let client_path = dir.join("client.sock");
        let client = UnixDatagram::bind(&client_path).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let req = bincode::serialize(&Request::State).unwrap();
        client.send_to(&req, config.socket_path()).unwrap();
        let mut buf = vec![0u8; 4096];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        let res: Response = bincode::deserialize(&buf[..n]).unwrap();
        assert!(matches!(res.0, Ok(ResponseKind::State(cmi::ServiceState::Running))));

        client.send_to(&[0xff, 0xff, 0xff], config.socket_path()).unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        let res: Response = bincode::deserialize(&buf[..n]).unwrap();
        assert!(res.0.is_err());

        exit.store(true, Ordering::Relaxed);
        server.join().unwrap().unwrap();
        service.destroy();
        let _ = fs::remove_dir_all(&dir);
    }
}
