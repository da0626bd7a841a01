use libvirt_snmp::adapters::agentx::session::{AgentxAddress, SessionSettings};
use libvirt_snmp::adapters::inventory::InventorySource;
use libvirt_snmp::adapters::snmp::master::ListenAddress;
use libvirt_snmp::adapters::snmp::message::{error_status, Message, PduKind, Version};
use libvirt_snmp::core::guest_table::{
    COLUMN_CPU_COUNT, COLUMN_CPU_TIME, COLUMN_MEMORY_CURRENT, COLUMN_NAME, COLUMN_ROW_STATUS,
    COLUMN_STATE, LIBVIRT_GUEST_TABLE_OID,
};
use libvirt_snmp::core::shutdown::{self, Shutdown};
use libvirt_snmp::domain::model::{Guest, GuestState, Oid, Value};
use libvirt_snmp::domain::ports::RequestProcessor;
use libvirt_snmp::{Agent, AgentRole, AgentSettings, GuestTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use uuid::Uuid;

fn guests() -> Vec<Guest> {
    vec![
        Guest {
            uuid: Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap(),
            name: "db01".to_string(),
            state: GuestState::Running,
            cpu_count: 4,
            memory_current_kib: 4_194_304,
            memory_limit_kib: 8_388_608,
            cpu_time_ns: 99_000_000_000,
        },
        Guest {
            uuid: Uuid::parse_str("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee").unwrap(),
            name: "build".to_string(),
            state: GuestState::Shutoff,
            cpu_count: 1,
            memory_current_kib: 0,
            memory_limit_kib: 524_288,
            cpu_time_ns: 0,
        },
    ]
}

struct Fixture {
    agent: Agent,
    table: Arc<GuestTable>,
    client: UdpSocket,
    agent_addr: SocketAddr,
    shutdown: Shutdown,
    _trigger: shutdown::ShutdownTrigger,
}

async fn start_master() -> Fixture {
    let settings = AgentSettings {
        role: AgentRole::Master,
        agentx_address: AgentxAddress::Unix("/nonexistent".into()),
        listen_addresses: ListenAddress::parse_list("udp:127.0.0.1:0").unwrap(),
        session: SessionSettings {
            max_getbulk_repeats: 10,
            ..SessionSettings::default()
        },
        community: "public".to_string(),
    };
    let table = Arc::new(GuestTable::new(
        Arc::new(InventorySource::from_guests(guests())),
        Duration::from_secs(60),
    ));

    let mut agent = Agent::new("libvirtGuestTable", settings);
    agent.register(table.clone());
    agent.start().await.unwrap();
    let agent_addr = agent.local_addrs()[0];

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_trigger, shutdown) = shutdown::channel();
    Fixture {
        agent,
        table,
        client,
        agent_addr,
        shutdown,
        _trigger,
    }
}

impl Fixture {
    async fn exchange(&mut self, request: &Message) -> Message {
        self.client
            .send_to(&request.encode(), self.agent_addr)
            .await
            .unwrap();
        self.agent
            .check_and_process(&mut self.shutdown)
            .await
            .unwrap();

        let mut buf = vec![0u8; 65_535];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), self.client.recv_from(&mut buf))
            .await
            .expect("agent did not answer")
            .unwrap();
        Message::decode(&buf[..len]).unwrap()
    }
}

#[tokio::test]
async fn test_get_returns_guest_columns() {
    let mut fx = start_master().await;
    let uuid = guests()[0].uuid;
    let oids = vec![
        fx.table.instance_oid(COLUMN_NAME, &uuid),
        fx.table.instance_oid(COLUMN_CPU_COUNT, &uuid),
        fx.table.instance_oid(COLUMN_MEMORY_CURRENT, &uuid),
        fx.table.instance_oid(COLUMN_CPU_TIME, &uuid),
        fx.table.instance_oid(COLUMN_ROW_STATUS, &uuid),
    ];
    let request = Message::request(Version::V2c, "public", PduKind::Get, 1001, &oids);
    let response = fx.exchange(&request).await;

    assert_eq!(response.pdu.kind, PduKind::Response);
    assert_eq!(response.pdu.request_id, 1001);
    assert_eq!(response.pdu.error_status, error_status::NO_ERROR);
    let values: Vec<Value> = response.pdu.varbinds.into_iter().map(|vb| vb.value).collect();
    assert_eq!(
        values,
        vec![
            Value::OctetString(b"db01".to_vec()),
            Value::Gauge32(4),
            Value::Gauge32(4096),
            Value::Counter64(99_000_000_000),
            Value::Integer(1),
        ]
    );
}

#[tokio::test]
async fn test_get_of_unknown_row_is_no_such_instance() {
    let mut fx = start_master().await;
    let missing = fx.table.instance_oid(COLUMN_NAME, &Uuid::nil());
    let request = Message::request(Version::V2c, "public", PduKind::Get, 5, &[missing]);
    let response = fx.exchange(&request).await;
    assert_eq!(response.pdu.varbinds[0].value, Value::NoSuchInstance);
}

#[tokio::test]
async fn test_get_next_walks_column_major() {
    let mut fx = start_master().await;
    let [first, second] = [guests()[0].uuid, guests()[1].uuid];

    let table_oid = Oid::from_slice(LIBVIRT_GUEST_TABLE_OID);
    let request = Message::request(Version::V2c, "public", PduKind::GetNext, 2, &[table_oid]);
    let response = fx.exchange(&request).await;
    assert_eq!(
        response.pdu.varbinds[0].oid,
        fx.table.instance_oid(COLUMN_NAME, &first)
    );

    let request = Message::request(
        Version::V2c,
        "public",
        PduKind::GetNext,
        3,
        &[fx.table.instance_oid(COLUMN_NAME, &second)],
    );
    let response = fx.exchange(&request).await;
    assert_eq!(
        response.pdu.varbinds[0].oid,
        fx.table.instance_oid(COLUMN_STATE, &first)
    );
    assert_eq!(
        response.pdu.varbinds[0].value,
        Value::Integer(GuestState::Running.as_i32())
    );
}

#[tokio::test]
async fn test_get_next_past_table_is_end_of_mib_view() {
    let mut fx = start_master().await;
    let last = fx.table.instance_oid(COLUMN_ROW_STATUS, &guests()[1].uuid);
    let request = Message::request(Version::V2c, "public", PduKind::GetNext, 4, &[last]);
    let response = fx.exchange(&request).await;
    assert_eq!(response.pdu.varbinds[0].value, Value::EndOfMibView);
}

#[tokio::test]
async fn test_get_bulk_is_capped() {
    let mut fx = start_master().await;
    let mut request = Message::request(
        Version::V2c,
        "public",
        PduKind::GetBulk,
        6,
        &[Oid::from_slice(LIBVIRT_GUEST_TABLE_OID)],
    );
    request.pdu.error_status = 0;
    request.pdu.error_index = 500;
    let response = fx.exchange(&request).await;

    // 7 columns x 2 rows, then endOfMibView; max_getbulk_repeats is 10.
    assert_eq!(response.pdu.varbinds.len(), 10);
    assert_eq!(
        response.pdu.varbinds[1].oid,
        fx.table.instance_oid(COLUMN_NAME, &guests()[1].uuid)
    );
}

#[tokio::test]
async fn test_v1_get_next_skips_counter64() {
    let mut fx = start_master().await;
    let uuid = guests()[1].uuid;
    let request = Message::request(
        Version::V1,
        "public",
        PduKind::GetNext,
        7,
        &[fx.table.instance_oid(COLUMN_MEMORY_CURRENT, &uuid)],
    );
    let response = fx.exchange(&request).await;
    // Next after column 5 of the last row is column 6 of the first row.
    assert_eq!(
        response.pdu.varbinds[0].oid,
        fx.table.instance_oid(COLUMN_MEMORY_CURRENT + 1, &guests()[0].uuid)
    );

    let request = Message::request(
        Version::V1,
        "public",
        PduKind::GetNext,
        8,
        &[fx.table.instance_oid(COLUMN_MEMORY_CURRENT + 1, &uuid)],
    );
    let response = fx.exchange(&request).await;
    // Both cpu time instances are Counter64 and are skipped.
    assert_eq!(
        response.pdu.varbinds[0].oid,
        fx.table.instance_oid(COLUMN_ROW_STATUS, &guests()[0].uuid)
    );
}

#[tokio::test]
async fn test_wrong_community_gets_no_answer() {
    let mut fx = start_master().await;
    let request = Message::request(
        Version::V2c,
        "private",
        PduKind::Get,
        9,
        &[Oid::from_slice(LIBVIRT_GUEST_TABLE_OID)],
    );
    fx.client
        .send_to(&request.encode(), fx.agent_addr)
        .await
        .unwrap();
    fx.agent.check_and_process(&mut fx.shutdown).await.unwrap();

    let mut buf = [0u8; 1500];
    let answer = tokio::time::timeout(Duration::from_millis(200), fx.client.recv_from(&mut buf)).await;
    assert!(answer.is_err());
}
