//! End-to-end SCRAM-SHA-256 authentication against an in-process mock backend, since no live
//! Postgres server is assumed reachable while testing this core.
mod common;

use postro_protocol::{Config, Connection};
use tokio::io::duplex;

use common::{drain_startup, send_frame, ScramServer};

#[tokio::test]
async fn scram_auth_succeeds_with_correct_password() {
    let (client, mut server) = duplex(64 * 1024);
    let mut config = Config::new("postgres");
    config.set_password("postgres");

    let server_task = tokio::spawn(async move {
        drain_startup(&mut server).await;
        ScramServer::new("postgres").run(&mut server).await.unwrap();
        send_frame(&mut server, b'Z', b"I").await;
        server
    });

    let conn = Connection::handshake(client, &config).await;
    assert!(conn.is_ok(), "expected handshake to succeed: {:?}", conn.err());

    server_task.await.unwrap();
}

#[tokio::test]
async fn scram_auth_rejects_wrong_password() {
    let (client, mut server) = duplex(64 * 1024);
    let mut config = Config::new("postgres");
    config.set_password("not-the-real-password");

    tokio::spawn(async move {
        drain_startup(&mut server).await;
        let _ = ScramServer::new("postgres").run(&mut server).await;
    });

    let err = Connection::handshake(client, &config).await.unwrap_err();
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn unsupported_sasl_mechanism_is_an_authentication_error() {
    let (client, mut server) = duplex(64 * 1024);
    let config = Config::new("postgres");

    tokio::spawn(async move {
        drain_startup(&mut server).await;
        let mut body = bytes::BytesMut::new();
        body.extend_from_slice(&10i32.to_be_bytes());
        body.extend_from_slice(b"SCRAM-SHA-1\0");
        body.push(0);
        send_frame(&mut server, b'R', &body).await;
    });

    let err = Connection::handshake(client, &config).await.unwrap_err();
    assert!(!err.is_recoverable());
}
