//! In-process media engine.
//!
//! Tracks workers, routers, transports, producers and consumers as plain
//! records with the same ownership rules as a real SFU: closing a parent
//! closes its children, and a dead worker takes everything it hosts with
//! it. No packets flow. The binary runs on it by default and the tests use
//! it with injected faults to simulate slow or failing engines.

use super::types::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate,
    IceParameters, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TransportId, TransportOptions,
    TransportParams, TransportProtocol, WorkerId,
};
use super::{
    ConsumerHandle, EngineEvent, EngineHandle, MediaEngine, ProducerHandle, RouterHandle,
    TransportHandle, WorkerHandle,
};
use crate::errors::EngineError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;
const FIRST_PORT: u16 = 40_000;

/// Engine operations a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOperation {
    CreateWorker,
    CreateRouter,
    CreateTransport,
    ConnectTransport,
    Produce,
    Consume,
    /// `close` of a transport; only `Delay` and `Stall` apply.
    CloseTransport,
}

/// Injected misbehaviour, consumed by the next matching call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail with the given error.
    Fail(EngineError),
    /// Never answer.
    Stall,
    /// Answer normally after a delay.
    Delay(Duration),
}

/// Number of open objects per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounts {
    pub workers: usize,
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Debug)]
struct RouterRecord {
    worker_id: WorkerId,
    rtp_capabilities: RtpCapabilities,
}

#[derive(Debug)]
struct TransportRecord {
    router_id: RouterId,
    dtls_state: DtlsState,
}

#[derive(Debug)]
struct ProducerRecord {
    transport_id: TransportId,
    router_id: RouterId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug)]
struct ConsumerRecord {
    transport_id: TransportId,
    producer_id: ProducerId,
}

#[derive(Debug, Default)]
struct EngineState {
    workers: HashSet<WorkerId>,
    routers: HashMap<RouterId, RouterRecord>,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    close_calls: HashMap<EngineHandle, usize>,
    faults: HashMap<EngineOperation, VecDeque<Fault>>,
    next_port: u16,
    next_ssrc: u32,
}

impl EngineState {
    fn close_router(&mut self, id: &RouterId) -> bool {
        if self.routers.remove(id).is_none() {
            return false;
        }
        let transports: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|(_, t)| &t.router_id == id)
            .map(|(tid, _)| tid.clone())
            .collect();
        for transport_id in &transports {
            self.close_transport(transport_id);
        }
        true
    }

    fn close_transport(&mut self, id: &TransportId) -> bool {
        if self.transports.remove(id).is_none() {
            return false;
        }
        self.consumers.retain(|_, c| &c.transport_id != id);
        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == id)
            .map(|(pid, _)| pid.clone())
            .collect();
        for producer_id in &producers {
            self.close_producer(producer_id);
        }
        true
    }

    fn close_producer(&mut self, id: &ProducerId) -> bool {
        if self.producers.remove(id).is_none() {
            return false;
        }
        self.consumers.retain(|_, c| &c.producer_id != id);
        true
    }

    /// Remove a worker and everything it hosts.
    fn close_worker(&mut self, id: &WorkerId) -> bool {
        if !self.workers.remove(id) {
            return false;
        }
        let routers: Vec<RouterId> = self
            .routers
            .iter()
            .filter(|(_, r)| &r.worker_id == id)
            .map(|(rid, _)| rid.clone())
            .collect();
        for router_id in &routers {
            self.close_router(router_id);
        }
        true
    }

    fn allocate_port(&mut self) -> u16 {
        let port = FIRST_PORT.saturating_add(self.next_port);
        self.next_port = self.next_port.wrapping_add(1);
        port
    }
}

/// In-memory [`MediaEngine`] implementation.
#[derive(Debug)]
pub struct InMemoryEngine {
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(EngineState::default()),
            events,
        }
    }

    /// Queue a fault for the next call of `operation`.
    pub async fn inject(&self, operation: EngineOperation, fault: Fault) {
        self.state
            .lock()
            .await
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Simulate an unexpected worker termination.
    ///
    /// Everything the worker hosts disappears and `WorkerDied` is emitted.
    pub async fn kill_worker(&self, worker_id: &WorkerId) {
        let removed = self.state.lock().await.close_worker(worker_id);
        if removed {
            error!(target: "rc.media", worker_id = %worker_id, "Media worker died");
            let _ = self.events.send(EngineEvent::WorkerDied {
                worker_id: worker_id.clone(),
            });
        }
    }

    /// Simulate a DTLS state change reported by the engine.
    pub async fn set_dtls_state(&self, transport_id: &TransportId, state: DtlsState) {
        let changed = {
            let mut guard = self.state.lock().await;
            match guard.transports.get_mut(transport_id) {
                Some(record) => {
                    record.dtls_state = state;
                    true
                }
                None => false,
            }
        };
        if changed {
            let _ = self.events.send(EngineEvent::TransportStateChanged {
                transport_id: transport_id.clone(),
                state,
            });
        }
    }

    pub async fn counts(&self) -> EngineCounts {
        let state = self.state.lock().await;
        EngineCounts {
            workers: state.workers.len(),
            routers: state.routers.len(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    /// How many times `close` was called for `handle`.
    pub async fn close_calls(&self, handle: &EngineHandle) -> usize {
        self.state
            .lock()
            .await
            .close_calls
            .get(handle)
            .copied()
            .unwrap_or(0)
    }

    /// Whether the object behind `handle` is still open.
    pub async fn is_open(&self, handle: &EngineHandle) -> bool {
        let state = self.state.lock().await;
        match handle {
            EngineHandle::Worker(id) => state.workers.contains(id),
            EngineHandle::Router(id) => state.routers.contains_key(id),
            EngineHandle::Transport(id) => state.transports.contains_key(id),
            EngineHandle::Producer(id) => state.producers.contains_key(id),
            EngineHandle::Consumer(id) => state.consumers.contains_key(id),
        }
    }

    pub async fn router_ids_on(&self, worker_id: &WorkerId) -> Vec<RouterId> {
        self.state
            .lock()
            .await
            .routers
            .iter()
            .filter(|(_, r)| &r.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Apply the next queued fault for `operation`, if any.
    ///
    /// Runs without holding the state lock so stalled calls never block
    /// other callers.
    async fn apply_fault(&self, operation: EngineOperation) -> Result<(), EngineError> {
        let fault = self
            .state
            .lock()
            .await
            .faults
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);

        match fault {
            None => Ok(()),
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Stall) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

fn random_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn fingerprint() -> DtlsFingerprint {
    let bytes = Uuid::new_v4().into_bytes();
    let value = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

/// Build router capabilities from the declared codec set.
fn router_capabilities(
    media_codecs: &[RtpCodecCapability],
) -> Result<RtpCapabilities, EngineError> {
    if media_codecs.is_empty() {
        return Err(EngineError::InvalidParameters(
            "router requires at least one media codec".to_string(),
        ));
    }

    let mut next_payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
    let mut codecs = Vec::with_capacity(media_codecs.len());
    for codec in media_codecs {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
            return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
        }
        let mut codec = codec.clone();
        if codec.preferred_payload_type.is_none() {
            codec.preferred_payload_type = Some(next_payload_type);
            next_payload_type = next_payload_type.saturating_add(1);
        }
        codecs.push(codec);
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: Vec::new(),
    })
}

/// Codecs of `producer` the endpoint described by `caps` can receive.
fn consumable_codecs(
    producer: &RtpParameters,
    caps: &RtpCapabilities,
) -> Vec<RtpCodecParameters> {
    producer
        .codecs
        .iter()
        .filter_map(|codec| {
            caps.codecs
                .iter()
                .find(|cap| cap.matches(&codec.mime_type, codec.clock_rate, codec.channels))
                .map(|cap| RtpCodecParameters {
                    payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                    ..codec.clone()
                })
        })
        .collect()
}

#[async_trait]
impl MediaEngine for InMemoryEngine {
    async fn create_worker(&self) -> Result<WorkerHandle, EngineError> {
        self.apply_fault(EngineOperation::CreateWorker).await?;

        let id = WorkerId::new();
        self.state.lock().await.workers.insert(id.clone());
        info!(target: "rc.media", worker_id = %id, "Media worker created");
        Ok(WorkerHandle { id })
    }

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterHandle, EngineError> {
        self.apply_fault(EngineOperation::CreateRouter).await?;

        let rtp_capabilities = router_capabilities(media_codecs)?;
        let mut state = self.state.lock().await;
        if !state.workers.contains(worker_id) {
            return Err(EngineError::WorkerDied(worker_id.clone()));
        }

        let id = RouterId::new();
        state.routers.insert(
            id.clone(),
            RouterRecord {
                worker_id: worker_id.clone(),
                rtp_capabilities: rtp_capabilities.clone(),
            },
        );
        debug!(target: "rc.media", router_id = %id, worker_id = %worker_id, "Router created");

        Ok(RouterHandle {
            id,
            worker_id: worker_id.clone(),
            rtp_capabilities,
        })
    }

    async fn create_transport(
        &self,
        router_id: &RouterId,
        options: &TransportOptions,
    ) -> Result<TransportHandle, EngineError> {
        self.apply_fault(EngineOperation::CreateTransport).await?;

        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidParameters(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if !state.routers.contains_key(router_id) {
            return Err(EngineError::NotFound {
                kind: "router",
                id: router_id.to_string(),
            });
        }

        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let port = state.allocate_port();
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_302_079, 1_076_276_479)
        } else {
            (1_076_276_479, 1_076_302_079)
        };

        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                ip: ip.clone(),
                protocol: TransportProtocol::Udp,
                port,
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                ip,
                protocol: TransportProtocol::Tcp,
                port,
            });
        }

        let id = TransportId::new();
        state.transports.insert(
            id.clone(),
            TransportRecord {
                router_id: router_id.clone(),
                dtls_state: DtlsState::New,
            },
        );

        Ok(TransportHandle {
            id: id.clone(),
            router_id: router_id.clone(),
            params: TransportParams {
                id,
                ice_parameters: IceParameters {
                    username_fragment: random_token(),
                    password: random_token(),
                    ice_lite: true,
                },
                ice_candidates,
                dtls_parameters: DtlsParameters {
                    role: Some(DtlsRole::Auto),
                    fingerprints: vec![fingerprint()],
                },
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.apply_fault(EngineOperation::ConnectTransport).await?;

        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters must carry at least one fingerprint".to_string(),
            ));
        }

        {
            let mut state = self.state.lock().await;
            let record = state
                .transports
                .get_mut(transport_id)
                .ok_or_else(|| EngineError::NotFound {
                    kind: "transport",
                    id: transport_id.to_string(),
                })?;
            if record.dtls_state != DtlsState::New {
                return Err(EngineError::Request(format!(
                    "transport {transport_id} already connected"
                )));
            }
            record.dtls_state = DtlsState::Connected;
        }

        let _ = self.events.send(EngineEvent::TransportStateChanged {
            transport_id: transport_id.clone(),
            state: DtlsState::Connected,
        });
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerHandle, EngineError> {
        self.apply_fault(EngineOperation::Produce).await?;

        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "rtpParameters.codecs must not be empty".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| EngineError::NotFound {
                kind: "transport",
                id: transport_id.to_string(),
            })?;
        let router = state
            .routers
            .get(&router_id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "router",
                id: router_id.to_string(),
            })?;

        for codec in &rtp_parameters.codecs {
            if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
                return Err(EngineError::InvalidParameters(format!(
                    "codec {} does not match kind {kind}",
                    codec.mime_type
                )));
            }
            let supported = router
                .rtp_capabilities
                .codecs
                .iter()
                .any(|cap| cap.matches(&codec.mime_type, codec.clock_rate, codec.channels));
            if !supported {
                return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }

        let id = ProducerId::new();
        state.producers.insert(
            id.clone(),
            ProducerRecord {
                transport_id: transport_id.clone(),
                router_id,
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );

        Ok(ProducerHandle {
            id,
            transport_id: transport_id.clone(),
            kind,
            rtp_parameters: rtp_parameters.clone(),
        })
    }

    async fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let state = self.state.lock().await;
        match state.producers.get(producer_id) {
            Some(producer) if &producer.router_id == router_id => {
                !consumable_codecs(&producer.rtp_parameters, rtp_capabilities).is_empty()
            }
            _ => false,
        }
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerHandle, EngineError> {
        self.apply_fault(EngineOperation::Consume).await?;

        let mut state = self.state.lock().await;
        let transport_router = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| EngineError::NotFound {
                kind: "transport",
                id: transport_id.to_string(),
            })?;
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;
        if producer.router_id != transport_router {
            return Err(EngineError::InvalidParameters(format!(
                "producer {producer_id} is not on the transport's router"
            )));
        }

        let codecs = consumable_codecs(&producer.rtp_parameters, rtp_capabilities);
        if codecs.is_empty() {
            return Err(EngineError::UnsupportedCodec(
                "no codec in common with producer".to_string(),
            ));
        }
        let kind = producer.kind;

        state.next_ssrc = state.next_ssrc.wrapping_add(1);
        let rtp_parameters = RtpParameters {
            mid: None,
            codecs,
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(state.next_ssrc),
                rid: None,
            }],
        };

        let id = ConsumerId::new();
        state.consumers.insert(
            id.clone(),
            ConsumerRecord {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
            },
        );

        Ok(ConsumerHandle {
            id,
            producer_id: producer_id.clone(),
            transport_id: transport_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn close(&self, handle: EngineHandle) {
        if matches!(handle, EngineHandle::Transport(_)) {
            let _ = self.apply_fault(EngineOperation::CloseTransport).await;
        }
        let mut state = self.state.lock().await;
        *state.close_calls.entry(handle.clone()).or_insert(0) += 1;
        let closed = match &handle {
            EngineHandle::Worker(id) => state.close_worker(id),
            EngineHandle::Router(id) => state.close_router(id),
            EngineHandle::Transport(id) => state.close_transport(id),
            EngineHandle::Producer(id) => state.close_producer(id),
            EngineHandle::Consumer(id) => state.consumers.remove(id).is_some(),
        };
        if closed {
            debug!(target: "rc.media", %handle, "Engine object closed");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::types::default_media_codecs;
    use std::collections::BTreeMap;

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: BTreeMap::new(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                rid: None,
            }],
        }
    }

    async fn router(engine: &InMemoryEngine) -> (WorkerHandle, RouterHandle) {
        let worker = engine.create_worker().await.unwrap();
        let router = engine
            .create_router(&worker.id, &default_media_codecs())
            .await
            .unwrap();
        (worker, router)
    }

    #[tokio::test]
    async fn test_router_assigns_payload_types() {
        let engine = InMemoryEngine::new();
        let (_, router) = router(&engine).await;

        let pts: Vec<_> = router
            .rtp_capabilities
            .codecs
            .iter()
            .map(|c| c.preferred_payload_type)
            .collect();
        assert_eq!(pts, vec![Some(100), Some(101)]);
    }

    #[tokio::test]
    async fn test_create_router_rejects_empty_codecs_and_dead_worker() {
        let engine = InMemoryEngine::new();
        let worker = engine.create_worker().await.unwrap();

        let err = engine.create_router(&worker.id, &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameters(_)));

        engine.kill_worker(&worker.id).await;
        let err = engine
            .create_router(&worker.id, &default_media_codecs())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::WorkerDied(worker.id));
    }

    #[tokio::test]
    async fn test_transport_candidates_follow_options() {
        let engine = InMemoryEngine::new();
        let (_, router) = router(&engine).await;

        let options = TransportOptions {
            announced_ip: Some("203.0.113.10".to_string()),
            enable_tcp: false,
            ..TransportOptions::default()
        };
        let transport = engine.create_transport(&router.id, &options).await.unwrap();
        assert_eq!(transport.params.ice_candidates.len(), 1);
        let candidate = transport.params.ice_candidates.first().unwrap();
        assert_eq!(candidate.ip, "203.0.113.10");
        assert_eq!(candidate.protocol, TransportProtocol::Udp);

        let options = TransportOptions {
            enable_udp: false,
            enable_tcp: false,
            ..TransportOptions::default()
        };
        assert!(engine.create_transport(&router.id, &options).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_validates_kind_and_codec() {
        let engine = InMemoryEngine::new();
        let (_, router) = router(&engine).await;
        let transport = engine
            .create_transport(&router.id, &TransportOptions::default())
            .await
            .unwrap();

        let err = engine
            .produce(&transport.id, MediaKind::Audio, &vp8_parameters())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameters(_)));

        let mut h264 = vp8_parameters();
        h264.codecs.first_mut().unwrap().mime_type = "video/H264".to_string();
        let err = engine
            .produce(&transport.id, MediaKind::Video, &h264)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedCodec(_)));

        let producer = engine
            .produce(&transport.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();
        assert_eq!(producer.kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn test_consume_checks_capabilities_and_producer() {
        let engine = InMemoryEngine::new();
        let (_, router) = router(&engine).await;
        let send = engine
            .create_transport(&router.id, &TransportOptions::default())
            .await
            .unwrap();
        let recv = engine
            .create_transport(&router.id, &TransportOptions::default())
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();

        let audio_only = RtpCapabilities {
            codecs: default_media_codecs()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: vec![],
        };
        assert!(
            !engine
                .can_consume(&router.id, &producer.id, &audio_only)
                .await
        );
        assert!(
            engine
                .can_consume(&router.id, &producer.id, &router.rtp_capabilities)
                .await
        );

        let consumer = engine
            .consume(&recv.id, &producer.id, &router.rtp_capabilities)
            .await
            .unwrap();
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(
            consumer.rtp_parameters.codecs.first().unwrap().payload_type,
            101
        );

        engine
            .close(EngineHandle::Producer(producer.id.clone()))
            .await;
        let err = engine
            .consume(&recv.id, &producer.id, &router.rtp_capabilities)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::ProducerNotFound(producer.id));
    }

    #[tokio::test]
    async fn test_close_cascades_and_counts_calls() {
        let engine = InMemoryEngine::new();
        let (_, router) = router(&engine).await;
        let send = engine
            .create_transport(&router.id, &TransportOptions::default())
            .await
            .unwrap();
        let recv = engine
            .create_transport(&router.id, &TransportOptions::default())
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();
        engine
            .consume(&recv.id, &producer.id, &router.rtp_capabilities)
            .await
            .unwrap();

        let handle = EngineHandle::Router(router.id.clone());
        engine.close(handle.clone()).await;
        engine.close(handle.clone()).await;

        let counts = engine.counts().await;
        assert_eq!(counts.routers, 0);
        assert_eq!(counts.transports, 0);
        assert_eq!(counts.producers, 0);
        assert_eq!(counts.consumers, 0);
        assert_eq!(engine.close_calls(&handle).await, 2);
    }

    #[tokio::test]
    async fn test_kill_worker_emits_event_and_removes_routers() {
        let engine = InMemoryEngine::new();
        let mut events = engine.subscribe();
        let (worker, router) = router(&engine).await;
        let other = engine.create_worker().await.unwrap();
        let survivor = engine
            .create_router(&other.id, &default_media_codecs())
            .await
            .unwrap();

        engine.kill_worker(&worker.id).await;

        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::WorkerDied {
                worker_id: worker.id.clone()
            }
        );
        assert!(!engine.is_open(&EngineHandle::Router(router.id)).await);
        assert!(engine.is_open(&EngineHandle::Router(survivor.id)).await);
        assert!(engine.router_ids_on(&worker.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_transport_emits_connected() {
        let engine = InMemoryEngine::new();
        let (_, router) = router(&engine).await;
        let transport = engine
            .create_transport(&router.id, &TransportOptions::default())
            .await
            .unwrap();
        let mut events = engine.subscribe();

        engine
            .connect_transport(&transport.id, &transport.params.dtls_parameters)
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::TransportStateChanged {
                transport_id: transport.id.clone(),
                state: DtlsState::Connected,
            }
        );

        let err = engine
            .connect_transport(&transport.id, &transport.params.dtls_parameters)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Request(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let engine = InMemoryEngine::new();
        engine
            .inject(
                EngineOperation::CreateWorker,
                Fault::Fail(EngineError::ResourceExhausted("no cpu".to_string())),
            )
            .await;

        assert!(engine.create_worker().await.is_err());
        assert!(engine.create_worker().await.is_ok());
    }
}
