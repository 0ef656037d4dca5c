// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::Payload;

#[tokio::test]
async fn round_trips_one_envelope() {
    let (client, server) = tokio::io::duplex(4096);
    let (_read_half, write_half) = tokio::io::split(client);
    let (read_half, _write_half2) = tokio::io::split(server);

    let mut writer = FrameWriter::new(write_half);
    let mut reader = FrameReader::new(read_half, 1024 * 1024);

    let env = Envelope::new(Payload::Ping {}).from("alice");
    writer.write_envelope(&env).await.unwrap();

    let got = reader.next_envelope().await.unwrap().unwrap();
    assert_eq!(got.from.as_deref(), Some("alice"));
    assert!(matches!(got.payload, Payload::Ping {}));
}

#[tokio::test]
async fn clean_eof_returns_none() {
    let (client, server) = tokio::io::duplex(64);
    drop(client);
    let (read_half, _w) = tokio::io::split(server);
    let mut reader = FrameReader::new(read_half, 1024);
    assert!(reader.next_envelope().await.unwrap().is_none());
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let (mut client, server) = tokio::io::duplex(1 << 20);
    let (read_half, _w) = tokio::io::split(server);
    let mut reader = FrameReader::new(read_half, 16);

    let big = "x".repeat(100);
    tokio::io::AsyncWriteExt::write_all(&mut client, format!("{big}\n").as_bytes())
        .await
        .unwrap();

    let result = reader.next_envelope().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let (mut client, server) = tokio::io::duplex(4096);
    let (read_half, _w) = tokio::io::split(server);
    let mut reader = FrameReader::new(read_half, 1024 * 1024);

    let line = r#"{"version":99,"id":"x","ts":0,"type":"PING"}"#;
    tokio::io::AsyncWriteExt::write_all(&mut client, format!("{line}\n").as_bytes())
        .await
        .unwrap();

    let result = reader.next_envelope().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let (mut client, server) = tokio::io::duplex(4096);
    let (read_half, _w) = tokio::io::split(server);
    let mut reader = FrameReader::new(read_half, 1024 * 1024);

    tokio::io::AsyncWriteExt::write_all(&mut client, b"not json at all\n").await.unwrap();

    let result = reader.next_envelope().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn generic_json_frame_round_trips() {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    let (client, server) = tokio::io::duplex(4096);
    let (_read_half, mut write_half) = tokio::io::split(client);
    let (read_half, _write_half2) = tokio::io::split(server);
    let mut reader = tokio::io::BufReader::new(read_half);

    write_json_frame(&mut write_half, &Ping { n: 7 }).await.unwrap();

    let mut buf = Vec::new();
    let got: Ping = read_json_frame(&mut reader, &mut buf, 1024).await.unwrap().unwrap();
    assert_eq!(got, Ping { n: 7 });
}

#[tokio::test]
async fn generic_json_frame_oversized_is_rejected() {
    let (mut client, server) = tokio::io::duplex(1 << 20);
    let (read_half, _w) = tokio::io::split(server);
    let mut reader = tokio::io::BufReader::new(read_half);

    let big = "x".repeat(100);
    tokio::io::AsyncWriteExt::write_all(&mut client, format!("\"{big}\"\n").as_bytes())
        .await
        .unwrap();

    let mut buf = Vec::new();
    let result: anyhow::Result<Option<String>> = read_json_frame(&mut reader, &mut buf, 16).await;
    assert!(result.is_err());
}
