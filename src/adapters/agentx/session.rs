use crate::adapters::agentx::pdu::{
    error_code, CloseReason, Header, Packet, Pdu, PduType, HEADER_LEN,
};
use crate::core::registry::MibRegistry;
use crate::core::shutdown::Shutdown;
use crate::domain::model::{Oid, Value, VarBind};
use crate::utils::error::{AgentError, CodecError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_AGENTX_SOCKET: &str = "/var/agentx/master";
pub const DEFAULT_PRIORITY: u8 = 127;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Where the master agent listens for AgentX connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentxAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for AgentxAddress {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        let target = s.strip_prefix("tcp:").unwrap_or(s);
        if target.chars().all(|c| c.is_ascii_digit()) && !target.is_empty() {
            return Ok(Self::Tcp(format!("localhost:{}", target)));
        }
        if target.rsplit_once(':').is_some_and(|(host, port)| {
            !host.is_empty() && port.parse::<u16>().is_ok()
        }) {
            return Ok(Self::Tcp(target.to_string()));
        }
        Err(AgentError::InvalidConfigValueError {
            field: "agent.agentx_socket".to_string(),
            value: s.to_string(),
            reason: "expected a socket path, unix:PATH or tcp:HOST:PORT".to_string(),
        })
    }
}

impl fmt::Display for AgentxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl AgentxAddress {
    async fn connect(&self) -> std::io::Result<(BoxReader, BoxWriter)> {
        match self {
            Self::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub description: String,
    pub timeout: Duration,
    pub retries: u32,
    pub ping_interval: Duration,
    pub max_getbulk_repeats: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            description: "libvirtGuestTable".to_string(),
            timeout: Duration::from_secs(1),
            retries: 5,
            ping_interval: Duration::from_secs(15),
            max_getbulk_repeats: 100,
        }
    }
}

/// What the reader task hands to the session.
#[derive(Debug)]
pub enum Incoming {
    Packet(Packet),
    /// Header was valid but the payload was not.
    Malformed(Header, CodecError),
}

/// Reads one AgentX message. Header errors are returned as errors since the
/// stream cannot be re-synchronised after them.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Incoming> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    let (header, payload_len) = Header::decode(&raw)?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok(match Packet::decode(header, &payload) {
        Ok(packet) => Incoming::Packet(packet),
        Err(e) => Incoming::Malformed(header, e),
    })
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop(mut reader: BoxReader, tx: mpsc::Sender<Incoming>) {
    loop {
        match read_packet(&mut reader).await {
            Ok(incoming) => {
                if tx.send(incoming).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(target: "agentx", "reader stopped: {}", e);
                return;
            }
        }
    }
}

struct Connection {
    session_id: u32,
    writer: BoxWriter,
    incoming: mpsc::Receiver<Incoming>,
    reader: JoinHandle<()>,
    next_ping: Instant,
    /// When the oldest unanswered ping went out.
    ping_outstanding_since: Option<Instant>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// A subagent session with an AgentX master.
pub struct AgentxSession {
    address: AgentxAddress,
    settings: SessionSettings,
    conn: Option<Connection>,
    next_packet_id: u32,
    reported_unreachable: bool,
}

impl AgentxSession {
    pub fn new(address: AgentxAddress, settings: SessionSettings) -> Self {
        Self {
            address,
            settings,
            conn: None,
            next_packet_id: 1,
            reported_unreachable: false,
        }
    }

    pub fn address(&self) -> &AgentxAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.conn.as_ref().map(|c| c.session_id)
    }

    fn packet_id(&mut self) -> u32 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    /// Opens the session and registers every subtree in `registry`.
    pub async fn connect(&mut self, registry: &MibRegistry) -> Result<()> {
        self.conn = None;
        let (reader, mut writer) = self
            .address
            .connect()
            .await
            .map_err(|e| AgentError::transport(self.address.to_string(), e))?;

        let (tx, mut incoming) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_loop(reader, tx));

        let open = Pdu::Open {
            timeout: self.settings.timeout.as_secs().min(255) as u8,
            id: Oid::default(),
            description: self.settings.description.clone(),
        };
        let packet_id = self.packet_id();
        let response = self
            .request(&mut writer, &mut incoming, Header::new(PduType::Open, 0, 0, packet_id), open)
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                reader_task.abort();
                return Err(e);
            }
        };
        let session_id = response.header.session_id;

        let mut conn = Connection {
            session_id,
            writer,
            incoming,
            reader: reader_task,
            next_ping: Instant::now() + self.settings.ping_interval,
            ping_outstanding_since: None,
        };

        for subtree in registry.subtrees() {
            let packet_id = self.packet_id();
            let register = Pdu::Register {
                timeout: 0,
                priority: DEFAULT_PRIORITY,
                range_subid: 0,
                subtree: subtree.clone(),
                upper_bound: None,
            };
            let header = Header::new(PduType::Register, session_id, 0, packet_id);
            self.request(&mut conn.writer, &mut conn.incoming, header, register)
                .await
                .map_err(|e| AgentError::protocol(format!("registering {}: {}", subtree, e)))?;
            tracing::debug!(target: "agentx", "registered {} in session {}", subtree, session_id);
        }

        tracing::info!(
            "AgentX session {} open with master at {}",
            session_id,
            self.address
        );
        self.reported_unreachable = false;
        self.conn = Some(conn);
        Ok(())
    }

    /// Like [`connect`](Self::connect), but a failure is only logged. The
    /// first failure in a row is a warning, the rest go to debug.
    pub async fn try_connect(&mut self, registry: &MibRegistry) -> bool {
        match self.connect(registry).await {
            Ok(()) => true,
            Err(e) if self.reported_unreachable => {
                tracing::debug!(target: "agentx", "reconnect failed: {}", e);
                false
            }
            Err(e) => {
                tracing::warn!(
                    "cannot reach AgentX master at {}: {}; retrying every {:?}",
                    self.address,
                    e,
                    self.settings.ping_interval
                );
                self.reported_unreachable = true;
                false
            }
        }
    }

    pub fn reported_unreachable(&self) -> bool {
        self.reported_unreachable
    }

    /// Sends `pdu` and waits for the matching Response, resending on timeout.
    async fn request(
        &self,
        writer: &mut BoxWriter,
        incoming: &mut mpsc::Receiver<Incoming>,
        header: Header,
        pdu: Pdu,
    ) -> Result<Packet> {
        let packet = Packet::new(header, pdu);
        let attempts = self.settings.retries.max(1);

        for attempt in 1..=attempts {
            write_packet(writer, &packet).await?;
            let deadline = Instant::now() + self.settings.timeout;

            loop {
                match tokio::time::timeout_at(deadline, incoming.recv()).await {
                    Err(_) => {
                        tracing::debug!(
                            target: "agentx",
                            "no response to {:?} (attempt {}/{})",
                            header.pdu_type,
                            attempt,
                            attempts
                        );
                        break;
                    }
                    Ok(None) => {
                        return Err(AgentError::transport(
                            self.address.to_string(),
                            "connection closed by master",
                        ))
                    }
                    Ok(Some(Incoming::Packet(reply)))
                        if reply.header.packet_id == header.packet_id =>
                    {
                        if let Pdu::Response { error, .. } = reply.pdu {
                            if error != error_code::NO_ERROR {
                                return Err(AgentError::protocol(format!(
                                    "master refused {:?} with error {}",
                                    header.pdu_type, error
                                )));
                            }
                            return Ok(reply);
                        }
                    }
                    Ok(Some(other)) => {
                        tracing::debug!(target: "agentx", "ignoring {:?} while waiting", other)
                    }
                }
            }
        }

        Err(AgentError::transport(
            self.address.to_string(),
            format!("no response to {:?}", header.pdu_type),
        ))
    }

    /// Handles one unit of work: a request from the master, an idle ping, or
    /// a reconnect attempt.
    pub async fn process_one(
        &mut self,
        registry: &MibRegistry,
        shutdown: &mut Shutdown,
        sys_uptime: u32,
    ) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.ping_interval) => {}
                _ = shutdown.wait() => return Ok(()),
            }
            self.try_connect(registry).await;
            return Ok(());
        };

        let next_ping = conn.next_ping;
        let incoming = tokio::select! {
            incoming = conn.incoming.recv() => incoming,
            _ = tokio::time::sleep_until(next_ping) => {
                self.ping().await;
                return Ok(());
            }
            _ = shutdown.wait() => return Ok(()),
        };

        let Some(incoming) = incoming else {
            tracing::warn!("lost AgentX connection to {}", self.address);
            self.conn = None;
            return Ok(());
        };

        let max_repeats = self.settings.max_getbulk_repeats;
        let reply = match incoming {
            Incoming::Packet(packet) => match &packet.pdu {
                Pdu::Close { reason } => {
                    tracing::warn!("master closed AgentX session ({:?})", reason);
                    self.conn = None;
                    return Ok(());
                }
                Pdu::Response { .. } => {
                    // Any response proves the master is alive.
                    if let Some(conn) = self.conn.as_mut() {
                        conn.ping_outstanding_since = None;
                    }
                    None
                }
                _ => handle_request(registry, &packet, sys_uptime, max_repeats).await,
            },
            Incoming::Malformed(header, e) => {
                tracing::debug!(target: "agentx", "malformed {:?}: {}", header.pdu_type, e);
                Some(response_to(&header, sys_uptime, error_code::PARSE_ERROR, 0, Vec::new()))
            }
        };

        if let Some(reply) = reply {
            self.send(&reply).await;
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.next_ping = Instant::now() + self.settings.ping_interval;
        }
        Ok(())
    }

    async fn ping(&mut self) {
        let timeout = self.settings.timeout * self.settings.retries.max(1);
        let interval = self.settings.ping_interval;
        let packet_id = self.packet_id();
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        if let Some(sent) = conn.ping_outstanding_since {
            if sent.elapsed() >= timeout {
                tracing::warn!("AgentX master at {} stopped answering pings", self.address);
                self.conn = None;
                return;
            }
        }

        let header = Header::new(PduType::Ping, conn.session_id, 0, packet_id);
        conn.ping_outstanding_since.get_or_insert_with(Instant::now);
        conn.next_ping = Instant::now() + interval;
        self.send(&Packet::new(header, Pdu::Ping)).await;
    }

    async fn send(&mut self, packet: &Packet) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if let Err(e) = write_packet(&mut conn.writer, packet).await {
            tracing::warn!("AgentX write to {} failed: {}", self.address, e);
            self.conn = None;
        }
    }

    /// Sends Close and drops the connection.
    pub async fn close(&mut self, reason: CloseReason) {
        let packet_id = self.packet_id();
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let header = Header::new(PduType::Close, conn.session_id, 0, packet_id);
        let result = self
            .request(&mut conn.writer, &mut conn.incoming, header, Pdu::Close { reason })
            .await;
        match result {
            Ok(_) => tracing::info!("AgentX session {} closed", conn.session_id),
            Err(e) => tracing::debug!(target: "agentx", "close of session {}: {}", conn.session_id, e),
        }
    }
}

fn response_to(
    header: &Header,
    sys_uptime: u32,
    error: u16,
    index: u16,
    varbinds: Vec<VarBind>,
) -> Packet {
    let header = Header::new(
        PduType::Response,
        header.session_id,
        header.transaction_id,
        header.packet_id,
    );
    Packet::new(
        header,
        Pdu::Response {
            sys_uptime,
            error,
            index,
            varbinds,
        },
    )
}

/// Builds the Response for a request from the master. `None` means the PDU
/// takes no response.
pub async fn handle_request(
    registry: &MibRegistry,
    packet: &Packet,
    sys_uptime: u32,
    max_getbulk_repeats: u16,
) -> Option<Packet> {
    let header = &packet.header;
    let reply = |error, index, varbinds| Some(response_to(header, sys_uptime, error, index, varbinds));

    if packet.context.is_some() {
        return reply(error_code::UNSUPPORTED_CONTEXT, 0, Vec::new());
    }

    match &packet.pdu {
        Pdu::Get { ranges } => {
            let mut varbinds = Vec::with_capacity(ranges.len());
            for range in ranges {
                let value = registry.get(&range.start).await;
                varbinds.push(VarBind::new(range.start.clone(), value));
            }
            tracing::debug!(target: "agentx", "Get of {} varbinds", varbinds.len());
            reply(error_code::NO_ERROR, 0, varbinds)
        }
        Pdu::GetNext { ranges } => {
            let mut varbinds = Vec::with_capacity(ranges.len());
            for range in ranges {
                varbinds.push(registry.get_next(range).await);
            }
            tracing::debug!(target: "agentx", "GetNext of {} varbinds", varbinds.len());
            reply(error_code::NO_ERROR, 0, varbinds)
        }
        Pdu::GetBulk {
            non_repeaters,
            max_repetitions,
            ranges,
        } => {
            let repetitions = (*max_repetitions).min(max_getbulk_repeats);
            let varbinds = registry
                .get_bulk(ranges, usize::from(*non_repeaters), usize::from(repetitions))
                .await;
            reply(error_code::NO_ERROR, 0, varbinds)
        }
        Pdu::TestSet { varbinds } => {
            let echoed = varbinds
                .iter()
                .map(|vb| VarBind::new(vb.oid.clone(), Value::Null))
                .collect();
            reply(error_code::NOT_WRITABLE, 1, echoed)
        }
        Pdu::CommitSet | Pdu::UndoSet | Pdu::Ping => reply(error_code::NO_ERROR, 0, Vec::new()),
        Pdu::CleanupSet => None,
        Pdu::Response { .. } | Pdu::Close { .. } => None,
        Pdu::Open { .. }
        | Pdu::Register { .. }
        | Pdu::Unregister { .. }
        | Pdu::Notify { .. }
        | Pdu::Unsupported(_) => {
            tracing::debug!(target: "agentx", "refusing {:?} from master", header.pdu_type);
            reply(error_code::PROCESSING_ERROR, 0, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agentx_addresses() {
        assert_eq!(
            "/var/agentx/master".parse::<AgentxAddress>().unwrap(),
            AgentxAddress::Unix(PathBuf::from("/var/agentx/master"))
        );
        assert_eq!(
            "unix:/tmp/agentx".parse::<AgentxAddress>().unwrap(),
            AgentxAddress::Unix(PathBuf::from("/tmp/agentx"))
        );
        assert_eq!(
            "tcp:localhost:705".parse::<AgentxAddress>().unwrap(),
            AgentxAddress::Tcp("localhost:705".to_string())
        );
        assert_eq!(
            "705".parse::<AgentxAddress>().unwrap(),
            AgentxAddress::Tcp("localhost:705".to_string())
        );
        assert!("nonsense".parse::<AgentxAddress>().is_err());
    }

    #[test]
    fn test_session_is_shareable_across_await_points() {
        // `request` borrows the session while writing, inside Send futures.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AgentxSession>();
    }

    #[tokio::test]
    async fn test_context_requests_are_refused() {
        let registry = MibRegistry::new();
        let mut packet = Packet::new(
            Header::new(PduType::Get, 9, 2, 3),
            Pdu::Get { ranges: Vec::new() },
        );
        packet.context = Some(b"other".to_vec());

        let reply = handle_request(&registry, &packet, 0, 10).await.unwrap();
        assert_eq!(reply.header.packet_id, 3);
        assert!(matches!(
            reply.pdu,
            Pdu::Response {
                error: error_code::UNSUPPORTED_CONTEXT,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_test_set_is_not_writable_and_cleanup_is_silent() {
        let registry = MibRegistry::new();
        let oid: Oid = "1.3.6.1.4.1.12345.1.1.1.3".parse().unwrap();
        let packet = Packet::new(
            Header::new(PduType::TestSet, 1, 1, 1),
            Pdu::TestSet {
                varbinds: vec![VarBind::new(oid, Value::Integer(5))],
            },
        );
        let reply = handle_request(&registry, &packet, 0, 10).await.unwrap();
        assert!(matches!(
            reply.pdu,
            Pdu::Response {
                error: error_code::NOT_WRITABLE,
                index: 1,
                ..
            }
        ));

        let cleanup = Packet::new(Header::new(PduType::CleanupSet, 1, 1, 2), Pdu::CleanupSet);
        assert!(handle_request(&registry, &cleanup, 0, 10).await.is_none());
    }
}
