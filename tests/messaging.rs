//! End-to-end tests driving two messaging services over loopback sockets.
//!
//! Every test gets its own pair of loopback addresses so the suite can run
//! in parallel on one fixed port pair.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use messaging_service::{
    ClientIdentity, ClientInfo, Config, CredentialsBuilder, EncryptWhat, Error, Gossip,
    GossipDigest, GossipDigestSyn, MessagingService, PeerId, Verb,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_PORT: u16 = 4100;
const TEST_SSL_PORT: u16 = 4101;

fn node_config(ip: &str) -> Config {
    Config {
        listen_address: ip.parse().unwrap(),
        port: TEST_PORT,
        ssl_port: TEST_SSL_PORT,
        ..Config::default()
    }
}

fn node(ip: &str) -> MessagingService {
    MessagingService::new(node_config(ip), &prometheus::Registry::new()).unwrap()
}

fn peer(ip: &str) -> PeerId {
    PeerId::new(ip.parse::<IpAddr>().unwrap(), 0)
}

fn client_count(service: &MessagingService) -> usize {
    let mut count = 0;
    service.foreach_client(|_, _| count += 1);
    count
}

#[tokio::test]
async fn oneway_gossip_syn_reaches_the_handler() {
    let a = node("127.0.10.1");
    let b = node("127.0.10.2");
    let id_b = peer("127.0.10.2");

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.register_gossip_digest_syn(move |_info, syn| {
        let tx = tx.clone();
        async move {
            tx.send(syn).unwrap();
            Ok(())
        }
    })
    .unwrap();

    let syn = GossipDigestSyn {
        cluster_id: "test-cluster".to_string(),
        digests: vec![GossipDigest {
            endpoint: "127.0.10.1".parse().unwrap(),
            generation: 1,
            max_version: 3,
        }],
    };
    a.send_gossip_digest_syn(id_b, &syn).await.unwrap();

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler never saw the digest syn")
        .unwrap();
    assert_eq!(received, syn);

    // The class-1 connection towards B is cached and nothing was dropped.
    let mut cached = Vec::new();
    a.foreach_client(|id, _| cached.push(*id));
    assert_eq!(cached, vec![id_b]);
    assert_eq!(a.dropped_for(Verb::GossipDigestSyn), 0);

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn request_response_and_client_identity() {
    let a = node("127.0.18.1");
    let b = node("127.0.18.2");
    let id_b = peer("127.0.18.2");

    b.register_handler(
        Verb::ReadData,
        |_info: Arc<ClientInfo>, key: String| async move { Ok(key.to_uppercase()) },
    )
    .unwrap();

    let reply: String = a
        .send_request(Verb::ReadData, id_b, &"hello".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "HELLO");

    // The CLIENT_ID handshake identified A on B's inbound connection.
    let deadline = Instant::now() + Duration::from_secs(5);
    let expected = peer("127.0.18.1");
    loop {
        let mut sources = Vec::new();
        b.foreach_server_connection(|info, _stats| {
            if let Some(source) = MessagingService::get_source(info) {
                sources.push(source);
            }
        });
        if sources.contains(&expected) {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "peer identity never showed up on the server connection"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn verb_classes_get_their_own_connections() {
    let a = node("127.0.11.1");
    let b = node("127.0.11.2");
    let id_b = peer("127.0.11.2");

    b.register_gossip_echo(|| async { Ok(()) }).unwrap();
    b.register_handler(Verb::ReadData, |_info: Arc<ClientInfo>, n: u64| async move {
        Ok(n + 1)
    })
    .unwrap();

    a.send_gossip_echo(id_b).await.unwrap();
    let reply: u64 = a.send_request(Verb::ReadData, id_b, &41u64).await.unwrap();
    assert_eq!(reply, 42);

    // One connection per verb class, both towards B.
    let mut cached = Vec::new();
    a.foreach_client(|id, _| cached.push(*id));
    assert_eq!(cached.len(), 2);
    assert!(cached.iter().all(|id| *id == id_b));

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn transport_failure_evicts_and_a_fresh_connection_recovers() {
    let a = node("127.0.12.1");
    let b = node("127.0.12.2");
    let id_b = peer("127.0.12.2");

    b.register_handler(Verb::ReadData, |_info: Arc<ClientInfo>, n: u64| async move {
        Ok(n * 2)
    })
    .unwrap();

    let reply: u64 = a.send_request(Verb::ReadData, id_b, &4u64).await.unwrap();
    assert_eq!(reply, 8);
    assert_eq!(client_count(&a), 1);
    let dropped_before = a.dropped_for(Verb::ReadData);

    // Take B down underneath the cached connection.
    b.stop().await;

    let result: Result<u64, Error> = a.send_request(Verb::ReadData, id_b, &4u64).await;
    assert!(
        matches!(result, Err(ref e) if e.is_closed()),
        "expected a transport closure, got {result:?}"
    );
    assert_eq!(a.dropped_for(Verb::ReadData), dropped_before + 1);
    // The broken connection is gone from the cache.
    assert_eq!(client_count(&a), 0);

    // A restarted B is reachable through a freshly built connection.
    let b = node("127.0.12.2");
    b.register_handler(Verb::ReadData, |_info: Arc<ClientInfo>, n: u64| async move {
        Ok(n * 2)
    })
    .unwrap();
    let reply: u64 = a
        .send_request_retry(
            Verb::ReadData,
            id_b,
            &21u64,
            Duration::from_secs(1),
            5,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    assert_eq!(reply, 42);

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn retry_succeeds_once_the_peer_comes_up() {
    let a = node("127.0.13.1");
    let id_b = peer("127.0.13.2");

    // Nobody listens yet; the first attempts fail with transport closures.
    let starter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let b = node("127.0.13.2");
        b.register_handler(Verb::ReadData, |_info: Arc<ClientInfo>, n: u64| async move {
            Ok(n + 1)
        })
        .unwrap();
        b
    });

    let start = Instant::now();
    let reply: u64 = a
        .send_request_retry(
            Verb::ReadData,
            id_b,
            &7u64,
            Duration::from_secs(1),
            10,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
    assert_eq!(reply, 8);
    // At least two failed attempts with their waits happened before B was
    // reachable.
    assert!(start.elapsed() >= Duration::from_millis(400));

    let b = starter.await.unwrap();
    tokio::join!(a.stop(), b.stop());
}

/// Membership view that knows the peer on the first query and has forgotten
/// it on every later one.
#[derive(Default)]
struct Forgetful {
    queried: AtomicBool,
}

impl Gossip for Forgetful {
    fn is_known_endpoint(&self, _endpoint: IpAddr) -> bool {
        !self.queried.swap(true, Ordering::SeqCst)
    }
}

#[tokio::test]
async fn retry_is_abandoned_when_the_peer_leaves_the_cluster() {
    let a = MessagingService::new(
        Config {
            gossip: Arc::new(Forgetful::default()),
            ..node_config("127.0.14.1")
        },
        &prometheus::Registry::new(),
    )
    .unwrap();
    let id_b = peer("127.0.14.2");

    let start = Instant::now();
    let result: Result<u64, Error> = a
        .send_request_retry(
            Verb::ReadData,
            id_b,
            &1u64,
            Duration::from_secs(1),
            10,
            Duration::from_millis(300),
        )
        .await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(ref e) if e.is_closed()));
    // One wait between the first and second attempt, then the loop gave up
    // without burning the remaining budget.
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1500));

    a.stop().await;
}

#[tokio::test]
async fn stop_drains_in_flight_requests() {
    let a = node("127.0.15.1");
    let b = node("127.0.15.2");
    let id_b = peer("127.0.15.2");

    b.register_handler(Verb::Mutation, |_info: Arc<ClientInfo>, n: u64| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(n)
    })
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let mut in_flight = Vec::new();
    for i in 0..100u64 {
        let a = a.clone();
        let completed = completed.clone();
        in_flight.push(tokio::spawn(async move {
            // Success or failure both count as resolved.
            let _ = a.send_request::<u64, u64>(Verb::Mutation, id_b, &i).await;
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Let the requests reach the wire, then pull the plug.
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.stop().await;

    // Every issued future resolves promptly now that stop() finished.
    timeout(Duration::from_secs(5), futures::future::join_all(in_flight))
        .await
        .expect("in-flight sends did not resolve with stop()");
    assert_eq!(completed.load(Ordering::SeqCst), 100);

    b.stop().await;
}

#[tokio::test]
async fn unknown_verbs_are_answered_with_a_protocol_error() {
    let a = node("127.0.19.1");
    let b = node("127.0.19.2");
    let id_b = peer("127.0.19.2");

    let result: Result<u64, Error> = a.send_request(Verb::Truncate, id_b, &1u64).await;
    assert!(matches!(result, Err(Error::HandlerMissing(Verb::Truncate))));
    assert_eq!(a.dropped_for(Verb::Truncate), 1);
    // Not a transport error: the connection stays cached.
    assert_eq!(client_count(&a), 1);

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn handler_failures_propagate_as_server_errors() {
    let a = node("127.0.20.1");
    let b = node("127.0.20.2");
    let id_b = peer("127.0.20.2");

    b.register_handler(Verb::Mutation, |_info: Arc<ClientInfo>, _n: u64| async move {
        Err::<u64, Error>(Error::Server("boom".to_string()))
    })
    .unwrap();

    let result: Result<u64, Error> = a.send_request(Verb::Mutation, id_b, &1u64).await;
    match result {
        Err(Error::Server(message)) => assert!(message.contains("boom")),
        other => panic!("expected a server error, got {other:?}"),
    }
    assert_eq!(a.dropped_for(Verb::Mutation), 1);
    assert_eq!(client_count(&a), 1);

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn slow_handlers_trip_the_request_timeout() {
    let a = node("127.0.21.1");
    let b = node("127.0.21.2");
    let id_b = peer("127.0.21.2");

    b.register_handler(Verb::ReadDigest, |_info: Arc<ClientInfo>, n: u64| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(n)
    })
    .unwrap();

    let result: Result<u64, Error> = a
        .send_request_timeout(Verb::ReadDigest, id_b, &1u64, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(a.dropped_for(Verb::ReadDigest), 1);
    // Timeouts do not evict the connection.
    assert_eq!(client_count(&a), 1);

    tokio::join!(a.stop(), b.stop());
}

fn tls_credentials(ips: &[&str]) -> (CredentialsBuilder, CredentialsBuilder) {
    let sans: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
    let key = rcgen::generate_simple_self_signed(sans).unwrap();
    let cert: CertificateDer<'static> = key.cert.der().clone();
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).unwrap();

    let builder = || CredentialsBuilder {
        certs: vec![cert.clone()],
        key: PrivateKeyDer::Pkcs8(key.key_pair.serialize_der().into()),
        roots: roots.clone(),
    };
    (builder(), builder())
}

#[tokio::test]
async fn encrypted_peers_talk_over_tls() {
    let (creds_a, creds_b) = tls_credentials(&["127.0.16.1", "127.0.16.2"]);
    let a = MessagingService::new(
        Config {
            encrypt: EncryptWhat::All,
            credentials: Some(creds_a),
            ..node_config("127.0.16.1")
        },
        &prometheus::Registry::new(),
    )
    .unwrap();
    let b = MessagingService::new(
        Config {
            encrypt: EncryptWhat::All,
            credentials: Some(creds_b),
            ..node_config("127.0.16.2")
        },
        &prometheus::Registry::new(),
    )
    .unwrap();
    let id_b = peer("127.0.16.2");

    b.register_handler(Verb::ReadData, |_info: Arc<ClientInfo>, s: String| async move {
        Ok(s.chars().rev().collect::<String>())
    })
    .unwrap();

    let reply: String = a
        .send_request(Verb::ReadData, id_b, &"secret".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "terces");

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn compression_is_negotiated_per_connection() {
    use messaging_service::CompressWhat;

    // A compresses everything, B offers nothing: negotiation falls back to
    // plain frames and traffic still flows.
    let a = MessagingService::new(
        Config {
            compress: CompressWhat::All,
            ..node_config("127.0.17.1")
        },
        &prometheus::Registry::new(),
    )
    .unwrap();
    let b = node("127.0.17.2");
    let id_b = peer("127.0.17.2");

    b.register_handler(Verb::Mutation, |_info: Arc<ClientInfo>, blob: Vec<u8>| async move {
        Ok(blob.len() as u64)
    })
    .unwrap();

    let blob = vec![42u8; 64 * 1024];
    let reply: u64 = a.send_request(Verb::Mutation, id_b, &blob).await.unwrap();
    assert_eq!(reply, blob.len() as u64);

    tokio::join!(a.stop(), b.stop());

    // Both sides compress: LZ4 frames end to end.
    let a = MessagingService::new(
        Config {
            compress: CompressWhat::All,
            ..node_config("127.0.17.3")
        },
        &prometheus::Registry::new(),
    )
    .unwrap();
    let b = MessagingService::new(
        Config {
            compress: CompressWhat::All,
            ..node_config("127.0.17.4")
        },
        &prometheus::Registry::new(),
    )
    .unwrap();
    let id_b = peer("127.0.17.4");

    b.register_handler(Verb::Mutation, |_info: Arc<ClientInfo>, blob: Vec<u8>| async move {
        Ok(blob.len() as u64)
    })
    .unwrap();

    let reply: u64 = a.send_request(Verb::Mutation, id_b, &blob).await.unwrap();
    assert_eq!(reply, blob.len() as u64);

    tokio::join!(a.stop(), b.stop());
}

#[tokio::test]
async fn identity_handshake_carries_the_announced_auxiliaries() {
    let a = node("127.0.22.1");
    let b = node("127.0.22.2");
    let id_b = peer("127.0.22.2");

    b.register_gossip_echo(|| async { Ok(()) }).unwrap();
    a.send_gossip_echo(id_b).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let identity = loop {
        let mut identities: Vec<ClientIdentity> = Vec::new();
        b.foreach_server_connection(|info, _| identities.extend(info.identity().copied()));
        if let Some(identity) = identities.first() {
            break *identity;
        }
        assert!(Instant::now() < deadline, "handshake never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(identity.broadcast_address, "127.0.22.1".parse::<IpAddr>().unwrap());
    assert_eq!(identity.src_core_id, 0);
    assert_eq!(identity.max_result_size, messaging_service::MAXIMUM_RESULT_SIZE);

    // Distinct peers stay distinguishable by address only.
    let mut seen = HashSet::new();
    a.foreach_client(|id, _| {
        seen.insert(*id);
    });
    assert_eq!(seen.len(), 1);

    tokio::join!(a.stop(), b.stop());
}
