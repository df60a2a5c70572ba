mod common;

use std::net::IpAddr;

use common::{ARRIVAL, CLIENT_IP, SERVER_IP, allocate_port, fake_tunnel, init_tracing, loopback};
use mvirt_tunnel::TunnelError;
use mvirt_tunnel::bridge::BridgeOptions;
use mvirt_tunnel::config::Role;
use mvirt_tunnel::test_util::packets::{IPV4_HDR_SIZE, UDP_HDR_SIZE, ipv4_tcp_syn, ipv4_udp};
use mvirt_tunnel::transport::{AnyTransport, DnsTransport, Transport};

const ROOT: &str = "t.example";

#[test]
fn test_answers_carry_server_traffic() {
    init_tracing();
    let port = allocate_port();

    let (server, server_device) = fake_tunnel("mvtun0", BridgeOptions::default());
    let (_server_running, sessions) = server
        .start_datagram_server(&DnsTransport::new(loopback(port), ROOT).unwrap())
        .unwrap();

    let (client, client_device) = fake_tunnel("mvtun1", BridgeOptions::default());
    let transport = DnsTransport::new(loopback(port), ROOT).unwrap();
    let _client_running = client
        .start(Role::Client, &AnyTransport::Dns(transport))
        .unwrap();

    let syn = ipv4_tcp_syn(CLIENT_IP, SERVER_IP, 40000, 22);
    client_device.inject(&syn);
    assert_eq!(server_device.next_written(ARRIVAL).unwrap(), syn);
    assert!(sessions.lookup(&IpAddr::V4(CLIENT_IP)).is_some());

    // Server traffic waits in the queue for the next query.
    let reply = ipv4_tcp_syn(SERVER_IP, CLIENT_IP, 22, 40000);
    server_device.inject(&reply);
    std::thread::sleep(std::time::Duration::from_millis(100));

    let ack = ipv4_udp(CLIENT_IP, SERVER_IP, 5000, 7, b"poll");
    client_device.inject(&ack);
    assert_eq!(server_device.next_written(ARRIVAL).unwrap(), ack);
    assert_eq!(client_device.next_written(ARRIVAL).unwrap(), reply);
}

#[test]
fn test_oversized_packet_ends_client() {
    init_tracing();
    let port = allocate_port();

    let (server, _server_device) = fake_tunnel("mvtun0", BridgeOptions::default());
    let _server = server
        .start_datagram_server(&DnsTransport::new(loopback(port), ROOT).unwrap())
        .unwrap();

    let transport = DnsTransport::new(loopback(port), ROOT).unwrap();
    let mtu = transport.max_payload().unwrap();
    assert_eq!(mtu, transport.mtu());

    let (client, client_device) = fake_tunnel("mvtun1", BridgeOptions::default());
    let running = client
        .start(Role::Client, &AnyTransport::Dns(transport))
        .unwrap();

    let data = vec![0x5a; mtu + 1 - IPV4_HDR_SIZE - UDP_HDR_SIZE];
    client_device.inject(&ipv4_udp(CLIENT_IP, SERVER_IP, 5000, 7, &data));

    match running.wait_timeout(ARRIVAL) {
        Some(TunnelError::PayloadTooLong { len, mtu: limit }) => {
            assert_eq!(len, mtu + 1);
            assert_eq!(limit, mtu);
        }
        other => panic!("expected payload too long, got {other:?}"),
    }
}
