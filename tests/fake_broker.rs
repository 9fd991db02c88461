//! Minimal MQTT v5 broker on a loopback socket
//!
//! Speaks just enough of the protocol for the real client: CONNACK, SUBACK,
//! PINGRESP and DISCONNECT. Every SUBSCRIBE is logged per connection, and all live
//! connections can be dropped at once to simulate a broker outage.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

const CONNACK_ACCEPTED: [u8; 5] = [0x20, 0x03, 0x00, 0x00, 0x00];
const PINGRESP: [u8; 2] = [0xD0, 0x00];
const NOT_AUTHORIZED: u8 = 0x87;

#[derive(Default)]
struct BrokerLog {
    connections: usize,
    /// (connection number, topic filter) for every SUBSCRIBE received
    subscriptions: Vec<(usize, String)>,
    /// Connection numbers that sent DISCONNECT
    disconnects: Vec<usize>,
    refused: HashSet<String>,
}

pub struct FakeBroker {
    port: u16,
    log: Arc<Mutex<BrokerLog>>,
    kick_tx: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        let port = listener.local_addr().expect("listener address").port();
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        let (kick_tx, _) = watch::channel(0u64);

        let accept_log = log.clone();
        let accept_kick = kick_tx.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = {
                    let mut log = accept_log.lock().unwrap();
                    log.connections += 1;
                    log.connections
                };
                tokio::spawn(serve(stream, id, accept_log.clone(), accept_kick.subscribe()));
            }
        });

        Self {
            port,
            log,
            kick_tx,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Answer SUBSCRIBE requests for `topic` with "not authorized"
    pub fn refuse(&self, topic: &str) {
        self.log.lock().unwrap().refused.insert(topic.to_string());
    }

    /// Close every open connection without a DISCONNECT
    pub fn drop_connections(&self) {
        self.kick_tx.send_modify(|generation| *generation += 1);
    }

    /// Connections accepted so far, numbered from 1
    pub fn connections(&self) -> usize {
        self.log.lock().unwrap().connections
    }

    pub fn subscriptions_on(&self, connection: usize) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|(id, _)| *id == connection)
            .map(|(_, topic)| topic.clone())
            .collect()
    }

    pub fn disconnects(&self) -> Vec<usize> {
        self.log.lock().unwrap().disconnects.clone()
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn serve(
    mut stream: TcpStream,
    id: usize,
    log: Arc<Mutex<BrokerLog>>,
    mut kick: watch::Receiver<u64>,
) {
    loop {
        let packet = tokio::select! {
            _ = kick.changed() => return,
            packet = read_packet(&mut stream) => packet,
        };
        let Ok((header, body)) = packet else {
            return;
        };

        let reply = match header >> 4 {
            CONNECT => CONNACK_ACCEPTED.to_vec(),
            SUBSCRIBE => {
                let Some((packet_id, filters)) = parse_subscribe(&body) else {
                    return;
                };
                let mut log = log.lock().unwrap();
                let codes = filters
                    .iter()
                    .map(|(topic, options)| {
                        log.subscriptions.push((id, topic.clone()));
                        if log.refused.contains(topic) {
                            NOT_AUTHORIZED
                        } else {
                            options & 0x03
                        }
                    })
                    .collect::<Vec<_>>();
                suback(packet_id, &codes)
            }
            PINGREQ => PINGRESP.to_vec(),
            DISCONNECT => {
                log.lock().unwrap().disconnects.push(id);
                return;
            }
            _ => continue,
        };

        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        length |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "remaining length"));
        }
    }

    let mut body = vec![0; length];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Packet id and (filter, options) pairs of a v5 SUBSCRIBE body
fn parse_subscribe(body: &[u8]) -> Option<(u16, Vec<(String, u8)>)> {
    let packet_id = u16::from_be_bytes([*body.first()?, *body.get(1)?]);

    let mut cursor = 2;
    let mut properties_len = 0usize;
    let mut shift = 0;
    loop {
        let byte = *body.get(cursor)?;
        cursor += 1;
        properties_len |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    cursor += properties_len;

    let mut filters = Vec::new();
    while cursor < body.len() {
        let len = usize::from(u16::from_be_bytes([*body.get(cursor)?, *body.get(cursor + 1)?]));
        cursor += 2;
        let topic = String::from_utf8(body.get(cursor..cursor + len)?.to_vec()).ok()?;
        cursor += len;
        let options = *body.get(cursor)?;
        cursor += 1;
        filters.push((topic, options));
    }
    Some((packet_id, filters))
}

fn suback(packet_id: u16, codes: &[u8]) -> Vec<u8> {
    let [hi, lo] = packet_id.to_be_bytes();
    let mut packet = vec![0x90, (3 + codes.len()) as u8, hi, lo, 0x00];
    packet.extend_from_slice(codes);
    packet
}
