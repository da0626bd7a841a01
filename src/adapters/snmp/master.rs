use crate::adapters::snmp::message::{error_status, Message, PduKind, Version};
use crate::core::registry::MibRegistry;
use crate::core::shutdown::Shutdown;
use crate::domain::model::{SearchRange, Value, VarBind};
use crate::utils::error::{AgentError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_LISTEN_ADDRESS: &str = "udp:161";
const DEFAULT_PORT: u16 = 161;

/// Largest response we send; GetBulk answers are trimmed to fit.
pub const MAX_RESPONSE_SIZE: usize = 1472;
const RECV_BUFFER_SIZE: usize = 65_535;
/// The message, PDU and varbind-list lengths each grow from one byte to at
/// most three once varbinds are added.
const LENGTH_GROWTH: usize = 3 * 2;

/// One entry of the listening-address specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub spec: String,
    pub bind: String,
}

impl ListenAddress {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let unsupported = |reason: &str| AgentError::InvalidConfigValueError {
            field: "agent.agentaddress".to_string(),
            value: spec.to_string(),
            reason: reason.to_string(),
        };

        let (ipv6, rest) = if let Some(rest) = spec.strip_prefix("udp6:") {
            (true, rest)
        } else if let Some(rest) = spec.strip_prefix("udp:") {
            (false, rest)
        } else if ["tcp:", "tcp6:", "unix:", "dtls", "tls"]
            .iter()
            .any(|p| spec.starts_with(p))
        {
            return Err(unsupported("only UDP transports are supported"));
        } else {
            (false, spec)
        };

        if rest.is_empty() {
            return Err(unsupported("empty address"));
        }

        let bind = if let Ok(port) = rest.parse::<u16>() {
            if ipv6 {
                format!("[::]:{}", port)
            } else {
                format!("0.0.0.0:{}", port)
            }
        } else if rest.starts_with('[') {
            if rest.contains("]:") {
                rest.to_string()
            } else {
                format!("{}:{}", rest, DEFAULT_PORT)
            }
        } else if let Some((host, port)) = rest.rsplit_once(':') {
            port.parse::<u16>()
                .map_err(|_| unsupported("invalid port"))?;
            format!("{}:{}", host, port)
        } else {
            format!("{}:{}", rest, DEFAULT_PORT)
        };

        Ok(Self {
            spec: spec.to_string(),
            bind,
        })
    }

    /// Parses a comma-separated specification such as `udp:161,localhost:1161`.
    pub fn parse_list(spec: &str) -> Result<Vec<Self>> {
        spec.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }
}

struct Datagram {
    data: Vec<u8>,
    peer: SocketAddr,
    socket: usize,
}

async fn receive_loop(index: usize, socket: Arc<UdpSocket>, tx: mpsc::Sender<Datagram>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let datagram = Datagram {
                    data: buf[..len].to_vec(),
                    peer,
                    socket: index,
                };
                if tx.send(datagram).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::debug!(target: "snmp", "recv on socket {} failed: {}", index, e),
        }
    }
}

/// SNMPv1/v2c agent answering from the registry over UDP.
pub struct MasterListener {
    sockets: Vec<Arc<UdpSocket>>,
    incoming: mpsc::Receiver<Datagram>,
    tasks: Vec<JoinHandle<()>>,
    community: String,
    max_getbulk_repeats: u16,
}

impl MasterListener {
    pub async fn bind(
        addresses: &[ListenAddress],
        community: impl Into<String>,
        max_getbulk_repeats: u16,
    ) -> Result<Self> {
        let (tx, incoming) = mpsc::channel(128);
        let mut sockets = Vec::with_capacity(addresses.len());
        let mut tasks = Vec::with_capacity(addresses.len());

        for (index, address) in addresses.iter().enumerate() {
            let socket = UdpSocket::bind(address.bind.as_str())
                .await
                .map_err(|e| AgentError::transport(address.spec.clone(), e))?;
            let socket = Arc::new(socket);
            tracing::info!(
                "listening for SNMP requests on {} ({})",
                address.spec,
                socket.local_addr()?
            );
            tasks.push(tokio::spawn(receive_loop(index, socket.clone(), tx.clone())));
            sockets.push(socket);
        }

        Ok(Self {
            sockets,
            incoming,
            tasks,
            community: community.into(),
            max_getbulk_repeats,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    pub async fn process_one(
        &mut self,
        registry: &MibRegistry,
        shutdown: &mut Shutdown,
    ) -> Result<()> {
        let datagram = tokio::select! {
            datagram = self.incoming.recv() => datagram,
            _ = shutdown.wait() => return Ok(()),
        };
        let Some(datagram) = datagram else {
            return Err(AgentError::protocol("all SNMP listeners stopped"));
        };

        let request = match Message::decode(&datagram.data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(target: "snmp", "dropping packet from {}: {}", datagram.peer, e);
                return Ok(());
            }
        };

        if let Some(response) = handle_message(
            registry,
            &request,
            self.community.as_bytes(),
            self.max_getbulk_repeats,
        )
        .await
        {
            let socket = &self.sockets[datagram.socket];
            if let Err(e) = socket.send_to(&response.encode(), datagram.peer).await {
                tracing::warn!("failed to answer {}: {}", datagram.peer, e);
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.sockets.clear();
    }
}

impl Drop for MasterListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn v1_representable(value: &Value) -> bool {
    !value.is_exception() && !matches!(value, Value::Counter64(_))
}

/// Answers one decoded request. `None` means nothing is sent back.
pub async fn handle_message(
    registry: &MibRegistry,
    request: &Message,
    community: &[u8],
    max_getbulk_repeats: u16,
) -> Option<Message> {
    if request.community != community {
        tracing::debug!(target: "snmp", "dropping request with unknown community");
        return None;
    }
    let pdu = &request.pdu;
    let v1 = request.version == Version::V1;

    let response = match pdu.kind {
        PduKind::Get => {
            let mut varbinds = Vec::with_capacity(pdu.varbinds.len());
            for (i, vb) in pdu.varbinds.iter().enumerate() {
                let value = registry.get(&vb.oid).await;
                if v1 && !v1_representable(&value) {
                    return Some(request.reply(
                        error_status::NO_SUCH_NAME,
                        i as i32 + 1,
                        pdu.varbinds.clone(),
                    ));
                }
                varbinds.push(VarBind::new(vb.oid.clone(), value));
            }
            request.reply(error_status::NO_ERROR, 0, varbinds)
        }
        PduKind::GetNext => {
            let mut varbinds = Vec::with_capacity(pdu.varbinds.len());
            for (i, vb) in pdu.varbinds.iter().enumerate() {
                let mut next = registry.get_next(&SearchRange::after(vb.oid.clone())).await;
                // Counter64 has no v1 encoding; step over it.
                while v1 && matches!(next.value, Value::Counter64(_)) {
                    next = registry.get_next(&SearchRange::after(next.oid.clone())).await;
                }
                if v1 && !v1_representable(&next.value) {
                    return Some(request.reply(
                        error_status::NO_SUCH_NAME,
                        i as i32 + 1,
                        pdu.varbinds.clone(),
                    ));
                }
                varbinds.push(next);
            }
            request.reply(error_status::NO_ERROR, 0, varbinds)
        }
        PduKind::GetBulk if !v1 => {
            let non_repeaters = pdu.error_status.max(0) as usize;
            let repetitions = pdu.error_index.clamp(0, i32::from(max_getbulk_repeats)) as usize;
            let ranges: Vec<SearchRange> = pdu
                .varbinds
                .iter()
                .map(|vb| SearchRange::after(vb.oid.clone()))
                .collect();

            let mut response = request.reply(error_status::NO_ERROR, 0, Vec::new());
            let mut room = MAX_RESPONSE_SIZE
                .saturating_sub(response.encode().len())
                .saturating_sub(LENGTH_GROWTH);
            response.pdu.varbinds = registry
                .get_bulk_within(&ranges, non_repeaters, repetitions, |varbind| {
                    let len = Message::varbind_len(varbind);
                    if len > room {
                        return false;
                    }
                    room -= len;
                    true
                })
                .await;
            response
        }
        PduKind::Set => {
            let (status, index) = if v1 {
                (error_status::NO_SUCH_NAME, 1)
            } else {
                (error_status::NOT_WRITABLE, 1)
            };
            request.reply(status, index, pdu.varbinds.clone())
        }
        PduKind::GetBulk | PduKind::Response | PduKind::Other(_) => {
            tracing::debug!(target: "snmp", "ignoring {:?} PDU", pdu.kind);
            return None;
        }
    };

    if response.encode().len() > MAX_RESPONSE_SIZE {
        return Some(request.reply(error_status::TOO_BIG, 0, Vec::new()));
    }
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addresses() {
        let cases = [
            ("161", "0.0.0.0:161"),
            ("udp:161", "0.0.0.0:161"),
            ("udp:127.0.0.1:1161", "127.0.0.1:1161"),
            ("localhost:1161", "localhost:1161"),
            ("udp6:[::1]:1161", "[::1]:1161"),
            ("udp6:161", "[::]:161"),
            ("agent.example.com", "agent.example.com:161"),
        ];
        for (spec, bind) in cases {
            assert_eq!(ListenAddress::parse(spec).unwrap().bind, bind, "spec {}", spec);
        }
        assert!(ListenAddress::parse("tcp:161").is_err());
        assert!(ListenAddress::parse("udp:host:notaport").is_err());
    }

    #[test]
    fn test_parse_listen_list() {
        let list = ListenAddress::parse_list("udp:161, localhost:1161,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].spec, "localhost:1161");
    }

    #[tokio::test]
    async fn test_wrong_community_is_dropped() {
        let registry = MibRegistry::new();
        let request = Message::request(Version::V2c, "private", PduKind::Get, 1, &[]);
        assert!(handle_message(&registry, &request, b"public", 10).await.is_none());
    }

    #[tokio::test]
    async fn test_v1_get_of_missing_object_is_no_such_name() {
        let registry = MibRegistry::new();
        let oid = "1.3.6.1.2.1.1.1.0".parse().unwrap();
        let request = Message::request(Version::V1, "public", PduKind::Get, 5, &[oid]);
        let response = handle_message(&registry, &request, b"public", 10).await.unwrap();
        assert_eq!(response.pdu.error_status, error_status::NO_SUCH_NAME);
        assert_eq!(response.pdu.error_index, 1);
    }

    struct Sequence {
        subtree: crate::domain::model::Oid,
        count: u32,
    }

    #[async_trait::async_trait]
    impl crate::domain::ports::MibModule for Sequence {
        fn name(&self) -> &str {
            "sequence"
        }

        fn subtree(&self) -> &crate::domain::model::Oid {
            &self.subtree
        }

        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn get(&self, _oid: &crate::domain::model::Oid) -> Value {
            Value::NoSuchInstance
        }

        async fn get_next(
            &self,
            oid: &crate::domain::model::Oid,
            include: bool,
        ) -> Option<VarBind> {
            let start = match oid.as_slice().strip_prefix(self.subtree.as_slice()) {
                Some([n, ..]) if include => *n,
                Some([n, ..]) => n + 1,
                _ => 0,
            };
            (start < self.count).then(|| {
                VarBind::new(
                    self.subtree.child(&[start]),
                    Value::OctetString(vec![b'x'; 24]),
                )
            })
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_large_get_bulk_is_trimmed_to_fit() {
        let subtree: crate::domain::model::Oid = "1.3.6.1.4.1.12345.9".parse().unwrap();
        let mut registry = MibRegistry::new();
        registry.register(Arc::new(Sequence {
            subtree: subtree.clone(),
            count: 100_000,
        }));

        let oids = vec![subtree.clone(); 400];
        let mut request = Message::request(Version::V2c, "public", PduKind::GetBulk, 3, &oids);
        request.pdu.error_index = 100;

        let started = std::time::Instant::now();
        let response = handle_message(&registry, &request, b"public", 100).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        assert_eq!(response.pdu.error_status, error_status::NO_ERROR);
        assert!(!response.pdu.varbinds.is_empty());
        assert!(response.encode().len() <= MAX_RESPONSE_SIZE);

        // Nothing more would have fitted.
        let mut grown = response.clone();
        grown.pdu.varbinds.push(response.pdu.varbinds[0].clone());
        assert!(grown.encode().len() > MAX_RESPONSE_SIZE - LENGTH_GROWTH);
    }

    #[tokio::test]
    async fn test_v2c_set_is_not_writable() {
        let registry = MibRegistry::new();
        let oid = "1.3.6.1.4.1.12345.1.1.1.3".parse().unwrap();
        let request = Message::request(Version::V2c, "public", PduKind::Set, 5, &[oid]);
        let response = handle_message(&registry, &request, b"public", 10).await.unwrap();
        assert_eq!(response.pdu.error_status, error_status::NOT_WRITABLE);
    }
}
