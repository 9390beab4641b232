//! # Relay Listener
//!
//! Accepts device links, discovers how many units sit behind each one, and
//! routes global device ids to the link that owns them.
//!
//! Discovery probes unit ids from 1 with Init requests. Status 0 means the unit
//! exists and scanning continues; the first nonzero status ends the scan. The
//! link then receives a contiguous range of global ids, one per unit found.
//!
//! ```no_run
//! use smartport_relay::{Listener, RelayConfig};
//!
//! # async fn run() -> smartport_relay::error::Result<()> {
//! let listener = Listener::new(&RelayConfig::default());
//! let addr = listener.start("0.0.0.0", 1985).await?;
//! println!("listening on {addr}");
//! // ... later
//! listener.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{parse_listen_address, RelayConfig};
use crate::constants::SP_STATUS_CODE_DIB;
use crate::error::{RelayError, Result};
use crate::registry::{DeviceRange, DeviceRegistry};
use crate::smartport::command::{InitRequest, Request, Response, StatusRequest};
use crate::smartport::connection::Connection;
use crate::smartport::requestor::Requestor;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Listening,
}

/// The first two online disk-like devices, by global id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskDevices {
    pub first: Option<u8>,
    pub second: Option<u8>,
}

/// State shared with the acceptor task.
struct ListenerInner {
    registry: Mutex<DeviceRegistry<Arc<Connection>>>,
    /// Held from the first probe of a link until it is registered, so the
    /// free id space seen while scanning is the space it is granted.
    discovery: tokio::sync::Mutex<()>,
    listening: AtomicBool,
    requestor: Arc<Requestor>,
    request_timeout: Duration,
    settle_timeout: Duration,
    accept_poll: Duration,
}

impl ListenerInner {
    fn registry(&self) -> MutexGuard<'_, DeviceRegistry<Arc<Connection>>> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Opens the link, counts its units and registers it.
    ///
    /// A link that fails to settle or errors mid-probe is closed and not
    /// registered.
    async fn discover(&self, connection: Arc<Connection>) -> Result<Option<DeviceRange>> {
        let _discovering = self.discovery.lock().await;
        let units = match self.probe(&connection).await {
            Ok(units) => units,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        let range = self.registry().register(Arc::clone(&connection), units);
        let granted = range.map_or(0, |range| range.len());
        if granted < units {
            warn!(
                "[{}] {}, {} of {units} unit(s) unreachable",
                connection.peer(),
                RelayError::CapacityExceeded { requested: units },
                units - granted
            );
        }
        match range {
            Some(range) => info!(
                "[{}] {} unit(s) assigned device ids {}",
                connection.peer(),
                range.len(),
                range
            ),
            None => info!("[{}] link has no units", connection.peer()),
        }
        Ok(range)
    }

    async fn probe(&self, connection: &Connection) -> Result<usize> {
        connection.open()?;
        connection.wait_connected(self.settle_timeout).await?;

        let mut found = 0usize;
        loop {
            let unit = found + 1;
            if unit > self.registry().remaining() {
                let err = RelayError::CapacityExceeded { requested: unit };
                warn!(
                    "[{}] {err}, keeping {found} unit(s)",
                    connection.peer()
                );
                break;
            }

            let request = InitRequest::new(self.requestor.next_sequence_number(), unit as u8);
            let response =
                Requestor::send_request(&request, connection, self.request_timeout).await?;
            if !response.is_ok() {
                debug!(
                    "[{}] unit {unit} answered status 0x{:02X}, scan complete",
                    connection.peer(),
                    response.status
                );
                break;
            }
            found = unit;
        }
        Ok(found)
    }
}

struct Acceptor {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Accepts links and maps global device ids onto them.
pub struct Listener {
    inner: Arc<ListenerInner>,
    acceptor: tokio::sync::Mutex<Option<Acceptor>>,
    disk_cache: tokio::sync::Mutex<Option<DiskDevices>>,
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new(&RelayConfig::default())
    }
}

impl Listener {
    /// A stopped listener using the process-wide requestor.
    pub fn new(config: &RelayConfig) -> Self {
        Listener::with_requestor(config, Requestor::global())
    }

    pub fn with_requestor(config: &RelayConfig, requestor: Arc<Requestor>) -> Self {
        Listener {
            inner: Arc::new(ListenerInner {
                registry: Mutex::new(DeviceRegistry::new()),
                discovery: tokio::sync::Mutex::new(()),
                listening: AtomicBool::new(false),
                requestor,
                request_timeout: config.request_timeout(),
                settle_timeout: config.settle_timeout(),
                accept_poll: config.accept_poll(),
            }),
            acceptor: tokio::sync::Mutex::new(None),
            disk_cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Builds a listener and starts it if `start_on_init` is set.
    pub async fn launch(config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = Listener::new(config);
        if config.start_on_init {
            listener.start(&config.address, config.port).await?;
        }
        Ok(listener)
    }

    /// Binds `address:port` and starts accepting links in the background.
    ///
    /// A malformed address falls back to `0.0.0.0`. Port 0 binds an ephemeral
    /// port; the bound address is returned.
    pub async fn start(&self, address: &str, port: u16) -> Result<SocketAddr> {
        let mut acceptor = self.acceptor.lock().await;
        if acceptor.is_some() {
            return Err(RelayError::AlreadyListening);
        }

        let (ip, _) = parse_listen_address(address);
        let socket = TcpListener::bind((ip, port)).await?;
        let local_addr = socket.local_addr()?;

        self.disk_cache.lock().await.take();
        self.inner.listening.store(true, Ordering::SeqCst);
        let task = tokio::spawn(accept_loop(Arc::clone(&self.inner), socket));
        *acceptor = Some(Acceptor { task, local_addr });

        info!("Listening on {local_addr}");
        Ok(local_addr)
    }

    /// Stops accepting, closes every link and resets the device-id space.
    /// Calling it on a stopped listener does nothing.
    ///
    /// A discovery already running is allowed to finish first, and its link
    /// is closed with the rest.
    pub async fn stop(&self) {
        self.inner.listening.store(false, Ordering::SeqCst);

        let acceptor = self.acceptor.lock().await.take();
        if let Some(acceptor) = acceptor {
            if let Err(e) = acceptor.task.await {
                warn!("acceptor task ended abnormally: {e}");
            }
        }

        let _discovering = self.inner.discovery.lock().await;
        let connections = self.inner.registry().drain();
        let closed = connections.len();
        for connection in connections {
            connection.close().await;
        }
        self.disk_cache.lock().await.take();

        if closed > 0 {
            info!("Listener stopped, closed {closed} link(s)");
        }
    }

    pub fn state(&self) -> ListenerState {
        if self.is_listening() {
            ListenerState::Listening
        } else {
            ListenerState::Stopped
        }
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// The bound socket address while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().await.as_ref().map(|a| a.local_addr)
    }

    /// Runs discovery on an already established channel and registers it.
    /// Discoveries run one at a time.
    ///
    /// Returns the assigned range, or `None` for a link with no units.
    pub async fn attach_link<T>(&self, io: T, label: impl Into<String>) -> Result<Option<DeviceRange>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Arc::new(Connection::new(io, label));
        self.inner.discover(connection).await
    }

    pub fn next_sequence_number(&self) -> u8 {
        self.inner.requestor.next_sequence_number()
    }

    /// The link owning `device_id` and the unit id the device knows itself by.
    pub fn find_connection_for_device(&self, device_id: u8) -> Option<(u8, Arc<Connection>)> {
        self.inner.registry().find(device_id)
    }

    /// Like [`Listener::find_connection_for_device`], with `Unroutable` for
    /// ids outside every range.
    pub fn resolve(&self, device_id: u8) -> Result<(u8, Arc<Connection>)> {
        self.find_connection_for_device(device_id)
            .ok_or(RelayError::Unroutable(device_id))
    }

    /// Sends `request` to the global `device_id`, rewriting its device id to
    /// the local unit id first.
    pub async fn call<R: Request>(
        &self,
        device_id: u8,
        mut request: R,
        timeout: Duration,
    ) -> Result<R::Response> {
        let (unit, connection) = self.resolve(device_id)?;
        request.set_device_id(unit);
        Requestor::send_request(&request, &connection, timeout).await
    }

    /// [`Listener::call`] with the configured request timeout.
    pub async fn call_default<R: Request>(&self, device_id: u8, request: R) -> Result<R::Response> {
        self.call(device_id, request, self.inner.request_timeout).await
    }

    /// Every global id with its link, in id order.
    pub fn all_connections(&self) -> Vec<(u8, Arc<Connection>)> {
        self.inner.registry().all()
    }

    pub fn enumerate_devices(&self) -> Vec<u8> {
        self.all_connections().into_iter().map(|(id, _)| id).collect()
    }

    pub fn device_ranges(&self) -> Vec<DeviceRange> {
        self.inner.registry().ranges()
    }

    pub fn total_device_count(&self) -> u8 {
        self.inner.registry().total_device_count()
    }

    /// Links tracked, including those with no units.
    pub fn connection_count(&self) -> usize {
        self.inner.registry().owner_count()
    }

    /// The first two devices reporting an online disk in their DIB.
    ///
    /// The result is cached until the listener is stopped and started again;
    /// devices attached or removed in between are not seen.
    pub async fn first_two_disk_devices(&self) -> DiskDevices {
        let mut cache = self.disk_cache.lock().await;
        if let Some(disks) = *cache {
            return disks;
        }

        let mut found = Vec::with_capacity(2);
        for device_id in 1..=self.total_device_count() {
            let Some((unit, connection)) = self.find_connection_for_device(device_id) else {
                continue;
            };
            let request = StatusRequest::new(self.next_sequence_number(), unit, SP_STATUS_CODE_DIB);
            match Requestor::send_request(&request, &connection, self.inner.request_timeout).await {
                Ok(response) if response.is_online_disk() => {
                    found.push(device_id);
                    if found.len() == 2 {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("device {device_id} status probe failed: {e}"),
            }
        }

        let disks = DiskDevices {
            first: found.first().copied(),
            second: found.get(1).copied(),
        };
        *cache = Some(disks);
        disks
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.listening.store(false, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.get_mut().take() {
            acceptor.task.abort();
        }
    }
}

async fn accept_loop(inner: Arc<ListenerInner>, socket: TcpListener) {
    while inner.listening.load(Ordering::SeqCst) {
        let accepted = match tokio::time::timeout(inner.accept_poll, socket.accept()).await {
            Err(_) => continue,
            Ok(accepted) => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                if !inner.listening.load(Ordering::SeqCst) {
                    debug!("dropping link from {addr} accepted during shutdown");
                    break;
                }
                info!("Accepted link from {addr}");
                let connection = Arc::new(Connection::from_tcp(stream));
                if let Err(e) = inner.discover(connection).await {
                    warn!("[{addr}] skipping link: {e}");
                }
            }
            Err(e) => {
                error!("accept failed: {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("acceptor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smartport::sim::SimulatedDevice;
    use tokio::io::duplex;

    fn test_config() -> RelayConfig {
        RelayConfig {
            request_timeout_ms: 500,
            settle_timeout_ms: 500,
            accept_poll_ms: 20,
            ..RelayConfig::default()
        }
    }

    fn listener() -> Listener {
        Listener::with_requestor(&test_config(), Arc::new(Requestor::new()))
    }

    async fn attach_sim(listener: &Listener, units: usize) -> Option<DeviceRange> {
        let (near, far) = duplex(4096);
        let _sim = SimulatedDevice::with_disks(units).spawn(far);
        listener.attach_link(near, format!("sim-{units}")).await.unwrap()
    }

    #[tokio::test]
    async fn test_discovery_assigns_contiguous_ranges() {
        let listener = listener();
        assert_eq!(attach_sim(&listener, 2).await, Some(DeviceRange { start: 1, end: 2 }));
        assert_eq!(attach_sim(&listener, 3).await, Some(DeviceRange { start: 3, end: 5 }));
        assert_eq!(listener.total_device_count(), 5);
        assert_eq!(listener.enumerate_devices(), vec![1, 2, 3, 4, 5]);
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_resets_device_space() {
        let listener = listener();
        attach_sim(&listener, 2).await;
        listener.stop().await;
        assert_eq!(listener.total_device_count(), 0);
        assert_eq!(listener.connection_count(), 0);
        assert!(listener.find_connection_for_device(1).is_none());
    }

    #[tokio::test]
    async fn test_resolve_unknown_device_is_unroutable() {
        let listener = listener();
        assert!(matches!(listener.resolve(7), Err(RelayError::Unroutable(7))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let listener = listener();
        listener.start("127.0.0.1", 0).await.unwrap();
        assert_eq!(listener.state(), ListenerState::Listening);
        assert!(matches!(
            listener.start("127.0.0.1", 0).await,
            Err(RelayError::AlreadyListening)
        ));
        listener.stop().await;
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(listener.local_addr().await.is_none());
    }
}
