//! Session supervisor
//!
//! A [`Session`] owns the configuration, the sockets and the background tasks
//! of one connection to a host. It moves through
//! `Uninitialized → Initializing → Connected → ShuttingDown → Uninitialized`
//! and can be started again after a shutdown.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::command::{CommandChannel, FrameView, Response};
use crate::config::{SessionConfig, resolve_host, resolve_nic};
use crate::distribution::{ClientRequestHandler, DistributionConfig, DistributionServer, UnrecognizedRequests};
use crate::logging::{LogCallbackLayer, VerbosityLevel};
use crate::stream::ThrottleExt;
use crate::subscriber::{FrameHandler, MulticastSource, Subscriber};
use crate::types::{BodyDefinitionSet, Frame, Hierarchy, HostInfo, SegmentData, SkyReturn, UpdateRate};
use crate::{CortexError, Result, SDK_VERSION};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    /// Sockets are up but the host has not been heard from yet.
    Initializing,
    Connected,
    ShuttingDown,
}

/// Resources that only exist while the session runs.
struct Running {
    command: CommandChannel,
    subscriber: Subscriber,
    distribution: Option<Arc<DistributionServer>>,
}

/// One client connection to a host.
///
/// ```rust,no_run
/// use cortex_stream::{Frame, Session, SessionConfig};
/// use std::time::Duration;
///
/// # async fn run() -> cortex_stream::Result<()> {
/// let config = SessionConfig::default().host("10.1.1.20");
/// let mut session = Session::new(config).with_data_handler(|frame: &Frame| {
///     println!("frame {} with {} bodies", frame.frame_number, frame.bodies.len());
/// });
///
/// session.start().await?;
/// let defs = session.body_definitions(Duration::from_secs(1)).await?;
/// println!("tracking {} bodies", defs.bodies.len());
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    data_handler: Option<Arc<dyn FrameHandler>>,
    client_handler: Arc<dyn ClientRequestHandler>,
    host_info: Arc<watch::Sender<HostInfo>>,
    running: Option<Running>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (host_info, _) = watch::channel(HostInfo::default());
        Self {
            config,
            state: SessionState::Uninitialized,
            data_handler: None,
            client_handler: Arc::new(UnrecognizedRequests),
            host_info: Arc::new(host_info),
            running: None,
        }
    }

    /// Called for every frame the host streams.
    pub fn with_data_handler(mut self, handler: impl FrameHandler) -> Self {
        self.data_handler = Some(Arc::new(handler));
        self
    }

    /// Answers commands from downstream clients when client communication is on.
    pub fn with_client_request_handler(mut self, handler: impl ClientRequestHandler) -> Self {
        self.client_handler = Arc::new(handler);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Initializing if self.host_info.borrow().found => SessionState::Connected,
            state => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Snapshot of what is known about the host.
    pub fn host_info(&self) -> HostInfo {
        self.host_info.borrow().clone()
    }

    /// Notified whenever the host is heard from.
    pub fn watch_host(&self) -> watch::Receiver<HostInfo> {
        self.host_info.subscribe()
    }

    /// A log layer filtered at the configured verbosity.
    pub fn log_layer<F>(&self, callback: F) -> LogCallbackLayer<F>
    where
        F: Fn(VerbosityLevel, &str) + Send + Sync + 'static,
    {
        LogCallbackLayer::new(self.config.verbosity, callback)
    }

    /// Bind sockets, start the background tasks and look for the host.
    ///
    /// On error nothing stays bound and the session remains uninitialized.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(CortexError::api_misuse("session already started; shut it down first"));
        }
        self.config.validate()?;

        let config = &self.config;
        let ports = &config.ports;
        let priorities = config.thread_priorities;
        debug!(?priorities, "Thread priorities are scheduling hints only on the async runtime");

        let host_nic = resolve_nic(config.addresses.talk_to_host_nic()).await?;
        let host = resolve_host(config).await?;
        let clients_nic = match config.client_communication {
            true => Some(resolve_nic(config.addresses.talk_to_clients_nic()).await?),
            false => None,
        };

        self.host_info.send_replace(HostInfo::default());

        let command = CommandChannel::bind(
            SocketAddrV4::new(host_nic, ports.talk_to_host_port()),
            host,
            ports.host_port(),
            config.min_timeout,
            self.host_info.clone(),
        )
        .await?;

        let source =
            MulticastSource::bind(host_nic, config.addresses.host_multicast, ports.host_multicast_port()).await?;

        let distribution = match clients_nic {
            Some(nic) => {
                let identity = HostInfo {
                    machine_name: nic.to_string(),
                    machine_address: nic,
                    program_name: config.relay_identity.clone(),
                    program_version: SDK_VERSION,
                    ..Default::default()
                };
                let server = DistributionServer::start(
                    DistributionConfig {
                        nic,
                        request_port: ports.talk_to_clients_request_port(),
                        send_port: ports.talk_to_clients_multicast_port(),
                        destination: SocketAddrV4::new(
                            config.addresses.clients_multicast,
                            ports.clients_multicast_port(),
                        ),
                        identity,
                    },
                    self.client_handler.clone(),
                )
                .await?;
                Some(Arc::new(server))
            }
            None => None,
        };

        let relay = distribution.clone().filter(|_| config.relay_host_frames);
        let subscriber = Subscriber::spawn(source, self.data_handler.clone(), self.host_info.clone(), relay);

        info!(
            host = ?host,
            group = %config.addresses.host_multicast,
            clients = config.client_communication,
            "Session started"
        );

        match command.discover_host(config.min_timeout).await {
            Ok(found) => info!(name = %found.machine_name, program = %found.program_name, version = %found.version_string(), "Host answered"),
            Err(e) => warn!(error = %e, "Host did not answer discovery; waiting for frames"),
        }

        self.running = Some(Running { command, subscriber, distribution });
        self.state = SessionState::Initializing;
        Ok(())
    }

    /// Stop the background tasks and release sockets and buffers.
    ///
    /// Idempotent; the configuration is kept so the session can start again.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        self.state = SessionState::ShuttingDown;
        info!("Session shutting down");

        running.subscriber.stop().await;
        if let Some(distribution) = &running.distribution {
            distribution.stop().await;
        }
        running.command.release_buffers().await;
        drop(running);

        self.host_info.send_replace(HostInfo::default());
        self.state = SessionState::Uninitialized;
        info!("Session shut down");
        Ok(())
    }

    fn running(&self) -> Result<&Running> {
        self.running.as_ref().ok_or_else(|| CortexError::api_misuse("session is not started"))
    }

    /// Command channel with a known host, discovering it first if needed.
    async fn command(&self) -> Result<&CommandChannel> {
        let command = &self.running()?.command;
        if command.host().await.is_none() {
            command.discover_host(self.config.min_timeout).await?;
        }
        Ok(command)
    }

    /// Send a text command to the host.
    ///
    /// The reply borrows the session's receive buffer: further commands wait
    /// until it is dropped.
    pub async fn request(&self, command: &str, timeout: Duration) -> Result<Response<'_>> {
        self.command().await?.request(command, timeout).await
    }

    pub async fn sky_command(&self, command: &str, timeout: Duration) -> Result<SkyReturn> {
        self.command().await?.sky_command(command, timeout).await
    }

    pub async fn body_definitions(&self, timeout: Duration) -> Result<BodyDefinitionSet> {
        let defs = self.command().await?.body_definitions(timeout).await?;
        if defs.bodies.len() > self.config.max_bodies {
            warn!(
                bodies = defs.bodies.len(),
                max_bodies = self.config.max_bodies,
                "Host defines more bodies than the configured limit"
            );
        }
        Ok(defs)
    }

    /// Poll the host's current frame.
    pub async fn current_frame(&self, timeout: Duration) -> Result<FrameView<'_>> {
        self.command().await?.current_frame(timeout).await
    }

    /// Push a skeleton definition to the host.
    pub async fn send_htr(&self, hierarchy: &Hierarchy, segments: &[SegmentData], timeout: Duration) -> Result<()> {
        self.command().await?.send_htr(hierarchy, segments, timeout).await
    }

    /// Send a frame to downstream subscribers.
    pub fn send_data_to_clients(&self, frame: &Frame) -> Result<usize> {
        let distribution = self.running()?.distribution.as_ref().ok_or_else(|| {
            CortexError::api_misuse("client communication is disabled in this session's configuration")
        })?;
        distribution.send_frame(frame)
    }

    /// Stream of owned frame snapshots at up to `rate`.
    pub fn frames(&self, rate: UpdateRate) -> Result<BoxStream<'static, Arc<Frame>>> {
        let frames = self.running()?.subscriber.frames();
        Ok(match rate.throttle_interval(None) {
            None => frames.boxed(),
            Some(interval) => frames.throttle(interval).boxed(),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            debug!("Session dropped while running, cancelling background tasks");
            running.subscriber.cancel();
            if let Some(server) = &running.distribution {
                server.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortSetting;
    use crate::test_utils::{FakeHost, Reply, sample_body_defs, sample_frame};
    use crate::types::SkyValue;

    fn config_for(host: &FakeHost) -> SessionConfig {
        SessionConfig::default()
            .host("127.0.0.1")
            .host_port(PortSetting::Fixed(host.addr().port()))
            .talk_to_host_nic("127.0.0.1")
            .host_multicast_port(PortSetting::Any)
            .min_timeout(Duration::from_millis(100))
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn start_connects_on_discovery_reply() {
        let _ = tracing_subscriber::fmt::try_init();
        let host = FakeHost::standard().await.unwrap();
        let mut session = Session::new(config_for(&host));
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_connected());
        assert_eq!(session.host_info().machine_name, "capture-rig");

        session.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(!session.host_info().found);
    }

    #[tokio::test]
    async fn silent_host_leaves_session_initializing() {
        let host = FakeHost::spawn(|_, _| Reply::Silent).await.unwrap();
        let mut session = Session::new(config_for(&host));

        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Initializing);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn starting_twice_is_api_misuse() {
        let host = FakeHost::standard().await.unwrap();
        let mut session = Session::new(config_for(&host));

        session.start().await.unwrap();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CortexError::Api { .. }));
        assert!(session.is_connected());
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_fails_before_binding() {
        let config = SessionConfig::default().host_multicast("10.0.0.1".parse().unwrap());
        let mut session = Session::new(config);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CortexError::Api { .. }));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn unresolvable_host_is_network_error() {
        let config = SessionConfig::default()
            .host("no-such-host.invalid")
            .host_multicast_port(PortSetting::Any);
        let mut session = Session::new(config);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CortexError::Network { .. }));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn commands_flow_through_the_session() {
        let _ = tracing_subscriber::fmt::try_init();
        let host = FakeHost::standard().await.unwrap();
        let mut session = Session::new(config_for(&host));
        session.start().await.unwrap();

        let reply = session.request("LiveMode", Duration::from_millis(500)).await.unwrap();
        assert_eq!(reply.as_str().unwrap(), "LiveMode");
        drop(reply);

        let err = session.request("BogusCommand", Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, CortexError::Unrecognized { .. }));
        assert!(session.is_connected());

        let ret = session.sky_command("Stop", Duration::from_millis(500)).await.unwrap();
        assert_eq!(ret.value, SkyValue::Int(4));

        assert_eq!(session.body_definitions(Duration::from_millis(500)).await.unwrap(), sample_body_defs());
        assert_eq!(*session.current_frame(Duration::from_millis(500)).await.unwrap(), sample_frame(77));

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn operations_need_a_running_session() {
        let host = FakeHost::standard().await.unwrap();
        let mut session = Session::new(config_for(&host));

        assert!(matches!(session.request("Pause", Duration::ZERO).await, Err(CortexError::Api { .. })));
        assert!(matches!(session.frames(UpdateRate::Native), Err(CortexError::Api { .. })));

        session.start().await.unwrap();
        session.shutdown().await.unwrap();
        assert!(matches!(session.request("Pause", Duration::ZERO).await, Err(CortexError::Api { .. })));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_restart_works() {
        let _ = tracing_subscriber::fmt::try_init();
        let host = FakeHost::standard().await.unwrap();
        let mut session = Session::new(config_for(&host));

        session.shutdown().await.unwrap();
        session.start().await.unwrap();
        session.shutdown().await.unwrap();
        session.shutdown().await.unwrap();

        session.start().await.unwrap();
        assert!(session.is_connected());
        assert_eq!(session.config().min_timeout, Duration::from_millis(100));
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn client_data_requires_client_communication() {
        let host = FakeHost::standard().await.unwrap();

        let mut plain = Session::new(config_for(&host));
        plain.start().await.unwrap();
        assert!(matches!(plain.send_data_to_clients(&sample_frame(1)), Err(CortexError::Api { .. })));
        plain.shutdown().await.unwrap();

        let config = config_for(&host).client_communication(true).talk_to_clients_nic("127.0.0.1");
        let mut relay = Session::new(config);
        relay.start().await.unwrap();
        assert_eq!(relay.send_data_to_clients(&sample_frame(1)).unwrap(), 0);
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn frame_streams_end_with_the_session() {
        let host = FakeHost::standard().await.unwrap();
        let mut session = Session::new(config_for(&host));
        session.start().await.unwrap();

        let mut frames = session.frames(UpdateRate::Max(30)).unwrap();
        session.shutdown().await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(2), frames.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn slow_data_handler_does_not_delay_command_timeouts() {
        use crate::protocol::{PacketKind, codec};
        use crate::test_utils::{frame_datagram, sample_host_info};
        use std::sync::atomic::{AtomicBool, Ordering};
        use tokio::time::Instant;

        let host = FakeHost::spawn(|kind, _| {
            if kind != PacketKind::HostQuery {
                return Reply::Silent;
            }
            let mut buf = bytes::BytesMut::new();
            codec::encode_host_info(&sample_host_info(), &mut buf).unwrap();
            Reply::now(PacketKind::HostInfo, buf.to_vec())
        })
        .await
        .unwrap();
        let frame_port = free_udp_port();
        let config = config_for(&host).host_multicast_port(PortSetting::Fixed(frame_port));

        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        let mut session = Session::new(config).with_data_handler(move |_: &Frame| {
            flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1500));
        });
        session.start().await.unwrap();

        let sender = tokio::net::UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(&frame_datagram(&sample_frame(1), 0), (std::net::Ipv4Addr::LOCALHOST, frame_port))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !entered.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let started = Instant::now();
        let err = session.request("Anything", Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, CortexError::Timeout { .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(100 + 250), "timed out after {:?}", elapsed);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_running_session_stops_its_receiver() {
        let host = FakeHost::standard().await.unwrap();
        let mut session = Session::new(config_for(&host));
        session.start().await.unwrap();

        let mut frames = session.frames(UpdateRate::Native).unwrap();
        drop(session);

        let end = tokio::time::timeout(Duration::from_secs(2), frames.next()).await.unwrap();
        assert!(end.is_none());
    }
}
