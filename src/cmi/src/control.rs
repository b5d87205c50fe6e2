//! Administrative requests served by a running node, carried by `cmid`'s control socket.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conduit::ConduitId;
use crate::service::{CmiInfo, CmiService, ServiceState};
use crate::stats::ConduitStatistics;

pub type IResult<T> = Result<T, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Info,
    State,
    /// Statistics of one SepIo conduit, or of all of them.
    Stats(Option<ConduitId>),
    ClearStats(ConduitId),
    EnableTraffic,
    DisableTraffic { timeout_ms: u64 },
    EnterServiceMode,
    LeaveServiceMode,
    RequestPanic { timeout_ms: u64 },
    ReleasePanic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseKind {
    Info(CmiInfo),
    State(ServiceState),
    Stats(Vec<(ConduitId, ConduitStatistics)>),
    PanicGranted(bool),
    Ok,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response(pub IResult<ResponseKind>);

impl CmiService {
    pub fn handle_request(&self, req: Request) -> Response {
        tracing::debug!("control request: {:?}", req);
        let res = match req {
            Request::Info => Ok(ResponseKind::Info(self.info())),
            Request::State => Ok(ResponseKind::State(self.state())),
            Request::Stats(Some(conduit)) => self
                .stats(conduit)
                .map(|stats| ResponseKind::Stats(vec![(conduit, stats)])),
            Request::Stats(None) => Ok(ResponseKind::Stats(self.stats_snapshot())),
            Request::ClearStats(conduit) => self.clear_stats(conduit).map(|_| ResponseKind::Ok),
            Request::EnableTraffic => {
                self.enable_traffic();
                Ok(ResponseKind::Ok)
            }
            Request::DisableTraffic { timeout_ms } => self
                .disable_traffic(Duration::from_millis(timeout_ms))
                .map(|_| ResponseKind::Ok),
            Request::EnterServiceMode => {
                self.enter_service_mode();
                Ok(ResponseKind::Ok)
            }
            Request::LeaveServiceMode => {
                self.leave_service_mode();
                Ok(ResponseKind::Ok)
            }
            Request::RequestPanic { timeout_ms } => self
                .request_panic_permission(Duration::from_millis(timeout_ms))
                .map(ResponseKind::PanicGranted),
            Request::ReleasePanic => {
                self.release_panic_permission();
                Ok(ResponseKind::Ok)
            }
        };
        Response(res.map_err(|e| e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{CmiConfig, PoolConfig};
    use crate::io::{IoConsumer, Operation, StatusCode};
    use crate::message;
    use crate::transport::{LoopbackTransport, Transport};

    struct Refuse;

    impl IoConsumer for Refuse {
        fn submit(&self, op: Operation) {
            op.complete_with(StatusCode::Failed);
        }
    }

    fn lone_service() -> Arc<CmiService> {
        let (l, _r) = LoopbackTransport::pair();
        let config = CmiConfig {
            io_conduits: 2,
            pools: PoolConfig {
                large_slot_len: 64 * 1024,
                large_slots: 2,
                small_slot_len: 4096,
                small_slots: 4,
            },
            ..Default::default()
        };
        let service =
            CmiService::new(config, l as Arc<dyn Transport>, Arc::new(Refuse)).unwrap();
        service.start().unwrap();
        service
    }

    #[test]
    fn info_of_a_lone_node() {
        let service = lone_service();
        let res = service.handle_request(Request::Info);
        match res.0.unwrap() {
            ResponseKind::Info(info) => {
                assert_eq!(info.role, crate::Role::Active);
                assert!(!info.peer_alive);
                assert_eq!(info.state, ServiceState::Running);
                assert!(info.io_ready);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        service.destroy();
    }

    #[test]
    fn stats_of_unknown_conduit_is_an_error() {
        let service = lone_service();
        let res = service.handle_request(Request::Stats(Some(ConduitId::Job)));
        assert!(res.0.is_err());
        match service.handle_request(Request::Stats(None)).0.unwrap() {
            ResponseKind::Stats(all) => assert_eq!(all.len(), 2),
            other => panic!("unexpected response: {:?}", other),
        }
        service.destroy();
    }

    #[test]
    fn disable_then_enable_traffic() {
        let service = lone_service();
        let res = service.handle_request(Request::DisableTraffic { timeout_ms: 100 });
        assert!(res.0.is_ok());
        assert_eq!(service.state(), ServiceState::Disabled);
        service.handle_request(Request::EnableTraffic).0.unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        service.destroy();
    }

    #[test]
    fn lone_node_may_panic() {
        let service = lone_service();
        match service
            .handle_request(Request::RequestPanic { timeout_ms: 100 })
            .0
            .unwrap()
        {
            ResponseKind::PanicGranted(granted) => assert!(granted),
            other => panic!("unexpected response: {:?}", other),
        }
        service.handle_request(Request::ReleasePanic).0.unwrap();
        service.destroy();
    }

    #[test]
    fn requests_survive_the_codec() {
        let bytes = message::encode(&Request::DisableTraffic { timeout_ms: 5 }).unwrap();
        match message::decode::<Request>(&bytes).unwrap() {
            Request::DisableTraffic { timeout_ms } => assert_eq!(timeout_ms, 5),
            other => panic!("unexpected request: {:?}", other),
        }
    }
}
