use super::*;
use crate::decision::{
    CapacityLookup, CostLookup, EngineConfig, LiveMigrator, MigrationDecisionEngine, PeerCost,
    VmInventory,
};
use crate::error::TokenError;
use crate::flows::SharedFlowTable;
use crate::models::{Capacity, FlowEntry};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

const VM: Ipv4Addr = Ipv4Addr::new(10, 2, 0, 1);
const VM_MAC: &str = "00:16:3e:0a:02:01";
const PEER: Ipv4Addr = Ipv4Addr::new(10, 3, 0, 1);
const PEER_HV: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 3);
const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;
const IO_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn test_basic_encoding_is_big_endian_ids() {
    let token = MigrationToken::basic([ipv4_str_to_int("10.2.0.1").unwrap(), 0x0a030001]);
    assert_eq!(token.encode(), vec![10, 2, 0, 1, 10, 3, 0, 1]);
}

#[test]
fn test_cost_encoding_appends_one_byte() {
    let token = MigrationToken::with_costs([(0x0a020001, 7), (0x0a030001, 255)]);
    assert_eq!(token.encode(), vec![10, 2, 0, 1, 7, 10, 3, 0, 1, 255]);
}

#[test]
fn test_encoded_length_has_no_slack() {
    assert_eq!(RecordLayout::Basic.encoded_len(0), 0);
    assert_eq!(RecordLayout::Basic.encoded_len(3), 12);
    assert_eq!(RecordLayout::WithCost.encoded_len(3), 15);

    let token = MigrationToken::with_costs([(1, 1), (2, 2), (3, 3)]);
    assert_eq!(token.encode().len(), RecordLayout::WithCost.encoded_len(token.len()));
}

#[test]
fn test_empty_token() {
    let token = MigrationToken::basic(Vec::new());
    assert!(token.encode().is_empty());

    let decoded = MigrationToken::decode(&[], RecordLayout::WithCost).unwrap();
    assert!(decoded.is_empty());
    assert_eq!(decoded.head(), None);
}

#[test]
fn test_decode_rejects_partial_records() {
    assert_eq!(
        MigrationToken::decode(&[10, 2, 0], RecordLayout::Basic),
        Err(TokenError::Misaligned { len: 3, width: 4 })
    );
    assert_eq!(
        MigrationToken::decode(&[10, 2, 0, 1, 10], RecordLayout::Basic),
        Err(TokenError::Misaligned { len: 5, width: 4 })
    );
    assert_eq!(
        MigrationToken::decode(&[10, 2, 0, 1], RecordLayout::WithCost),
        Err(TokenError::Misaligned { len: 4, width: 5 })
    );
    // One byte past a whole record is still malformed
    assert!(MigrationToken::decode(&[0; 11], RecordLayout::WithCost).is_err());
}

#[test]
fn test_decode_then_encode_preserves_bytes() {
    let bytes = [192, 168, 0, 1, 0, 10, 0, 0, 1, 200];
    let token = MigrationToken::decode(&bytes, RecordLayout::WithCost).unwrap();

    assert_eq!(token.len(), 2);
    assert_eq!(token.head_addr(), Some(Ipv4Addr::new(192, 168, 0, 1)));
    assert_eq!(token.records()[1].cost, 200);
    assert_eq!(token.encode(), bytes);
}

#[test]
fn test_encode_then_decode_preserves_records() {
    let token = MigrationToken::from_addrs([VM, PEER, LOCALHOST]);
    let decoded = MigrationToken::decode(&token.encode(), RecordLayout::Basic).unwrap();
    assert_eq!(decoded, token);
}

#[test]
fn test_strip_head_shrinks_in_order() {
    let token = MigrationToken::with_costs([(1, 10), (2, 20), (3, 30)]);

    let once = token.strip_head();
    assert_eq!(once.layout(), RecordLayout::WithCost);
    assert_eq!(once.records(), &[TokenRecord::new(2, 20), TokenRecord::new(3, 30)]);
    assert_eq!(token.len(), 3);

    let emptied = once.strip_head().strip_head();
    assert!(emptied.is_empty());
    assert_eq!(emptied.strip_head(), emptied);
}

#[test]
fn test_saturating_cost() {
    assert_eq!(saturating_cost(0), 0);
    assert_eq!(saturating_cost(255), 255);
    assert_eq!(saturating_cost(256), 255);
    assert_eq!(saturating_cost(u64::MAX), 255);
}

#[test]
fn test_algorithm_selects_layout() {
    assert_eq!(Algorithm::RoundRobin.layout(), RecordLayout::Basic);
    assert_eq!(Algorithm::Distributed.layout(), RecordLayout::WithCost);
    assert_eq!(
        serde_json::from_str::<Algorithm>("\"distributed\"").unwrap(),
        Algorithm::Distributed
    );
}

struct FixedCosts;

#[async_trait::async_trait]
impl CostLookup for FixedCosts {
    async fn communication_cost(&self, peer: Ipv4Addr) -> anyhow::Result<Option<PeerCost>> {
        Ok((peer == PEER).then_some(PeerCost {
            hypervisor: PEER_HV,
            cost: 10,
        }))
    }
}

struct Roomy;

#[async_trait::async_trait]
impl CapacityLookup for Roomy {
    async fn capacity_of(&self, _hypervisor: Ipv4Addr) -> anyhow::Result<Option<Capacity>> {
        Ok(Some(Capacity {
            vm_count: 0,
            available_memory: u64::MAX,
        }))
    }
}

#[async_trait::async_trait]
impl VmInventory for Roomy {
    async fn memory_footprint_of(&self, _vm_mac: &str) -> anyhow::Result<u64> {
        Ok(512 << 20)
    }

    async fn capacity(&self) -> anyhow::Result<Capacity> {
        Ok(Capacity {
            vm_count: 1,
            available_memory: 1 << 30,
        })
    }
}

struct RecordingMigrator {
    tx: mpsc::UnboundedSender<(String, Ipv4Addr)>,
}

#[async_trait::async_trait]
impl LiveMigrator for RecordingMigrator {
    async fn live_migrate(&self, vm_mac: &str, target: Ipv4Addr) -> anyhow::Result<()> {
        let _ = self.tx.send((vm_mac.to_string(), target));
        Ok(())
    }
}

struct Harness {
    server: Arc<TokenServer>,
    migrations: mpsc::UnboundedReceiver<(String, Ipv4Addr)>,
}

async fn harness(algorithm: Algorithm, forward_port: u16) -> Harness {
    let table = SharedFlowTable::new();
    table
        .apply(&[FlowEntry::new(VM_MAC, "00:16:3e:0a:03:01", VM, PEER, 1_000)])
        .await;

    let engine = MigrationDecisionEngine::new(
        table,
        Arc::new(FixedCosts),
        Arc::new(Roomy),
        Arc::new(Roomy),
        EngineConfig::default(),
    );
    let (tx, migrations) = mpsc::unbounded_channel();
    let server = TokenServer::new(
        Arc::new(engine),
        Arc::new(RecordingMigrator { tx }),
        TokenServerConfig {
            port: forward_port,
            algorithm,
            io_timeout: IO_TIMEOUT,
        },
    );

    Harness {
        server: Arc::new(server),
        migrations,
    }
}

async fn next_migration(
    migrations: &mut mpsc::UnboundedReceiver<(String, Ipv4Addr)>,
) -> (String, Ipv4Addr) {
    tokio::time::timeout(IO_TIMEOUT, migrations.recv())
        .await
        .expect("migration not triggered")
        .expect("migrator dropped")
}

#[tokio::test]
async fn test_malformed_token_is_dropped_unevaluated() {
    let mut h = harness(Algorithm::RoundRobin, 1).await;

    let outcome = h.server.handle_token(&[10, 2, 0, 1, 10, 3]).await;

    assert_eq!(outcome, TokenOutcome::Dropped);
    assert!(h.migrations.try_recv().is_err());
}

#[tokio::test]
async fn test_empty_token_completes() {
    let h = harness(Algorithm::RoundRobin, 1).await;
    assert_eq!(h.server.handle_token(&[]).await, TokenOutcome::Completed);
}

#[tokio::test]
async fn test_last_record_triggers_migration_and_completes() {
    let mut h = harness(Algorithm::RoundRobin, 1).await;
    let token = MigrationToken::from_addrs([VM]);

    let outcome = h.server.handle_token(&token.encode()).await;

    assert_eq!(outcome, TokenOutcome::Completed);
    assert_eq!(next_migration(&mut h.migrations).await, (VM_MAC.to_string(), PEER_HV));
}

#[tokio::test]
async fn test_remainder_is_forwarded_to_next_head() {
    let downstream = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = downstream.local_addr().unwrap().port();
    let mut h = harness(Algorithm::RoundRobin, port).await;
    let token = MigrationToken::from_addrs([VM, LOCALHOST, PEER]);

    let outcome = h.server.handle_token(&token.encode()).await;
    assert_eq!(outcome, TokenOutcome::Forwarded { next: LOCALHOST });

    let (stream, _) = downstream.accept().await.unwrap();
    let forwarded = read_to_eof(stream, IO_TIMEOUT).await.unwrap();
    assert_eq!(forwarded, token.strip_head().encode());
    assert_eq!(next_migration(&mut h.migrations).await.1, PEER_HV);
}

#[tokio::test]
async fn test_unknown_vm_is_still_forwarded() {
    let downstream = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = downstream.local_addr().unwrap().port();
    let mut h = harness(Algorithm::RoundRobin, port).await;
    let token = MigrationToken::from_addrs([Ipv4Addr::new(10, 9, 9, 9), LOCALHOST]);

    let outcome = h.server.handle_token(&token.encode()).await;

    assert_eq!(outcome, TokenOutcome::Forwarded { next: LOCALHOST });
    assert!(h.migrations.try_recv().is_err());
}

#[tokio::test]
async fn test_unreachable_next_host() {
    let closed = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let h = harness(Algorithm::RoundRobin, port).await;
    let token = MigrationToken::from_addrs([VM, LOCALHOST]);

    let outcome = h.server.handle_token(&token.encode()).await;
    assert_eq!(outcome, TokenOutcome::Undeliverable { next: LOCALHOST });
}

#[tokio::test]
async fn test_distributed_threshold_holds_vm_back() {
    let downstream = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = downstream.local_addr().unwrap().port();
    let mut h = harness(Algorithm::Distributed, port).await;
    let token = MigrationToken::with_costs([(u32::from(VM), u8::MAX), (u32::from(LOCALHOST), 3)]);

    let outcome = h.server.handle_token(&token.encode()).await;
    assert_eq!(outcome, TokenOutcome::Forwarded { next: LOCALHOST });

    let (stream, _) = downstream.accept().await.unwrap();
    let forwarded = read_to_eof(stream, IO_TIMEOUT).await.unwrap();
    assert_eq!(forwarded, vec![127, 0, 0, 1, 3]);
    assert!(h.migrations.try_recv().is_err());
}

#[tokio::test]
async fn test_distributed_zero_threshold_migrates() {
    let mut h = harness(Algorithm::Distributed, 1).await;
    let token = MigrationToken::with_costs([(u32::from(VM), 0)]);

    assert_eq!(h.server.handle_token(&token.encode()).await, TokenOutcome::Completed);
    assert_eq!(next_migration(&mut h.migrations).await.1, PEER_HV);
}

#[tokio::test]
async fn test_serve_receives_and_forwards() {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let downstream = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = downstream.local_addr().unwrap().port();

    let mut h = harness(Algorithm::RoundRobin, port).await;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = h.server.clone();
    let serving = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    let token = MigrationToken::from_addrs([VM, LOCALHOST]);
    send_token(server_addr, &token, IO_TIMEOUT).await.unwrap();

    let (stream, _) = downstream.accept().await.unwrap();
    let forwarded = read_to_eof(stream, IO_TIMEOUT).await.unwrap();
    assert_eq!(forwarded, vec![127, 0, 0, 1]);
    assert_eq!(next_migration(&mut h.migrations).await.0, VM_MAC);

    shutdown_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_read_to_eof_times_out_on_open_stream() {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();

    let result = read_to_eof(stream, Duration::from_millis(50)).await;
    assert!(result.is_err());
}
