//! Loopback Modbus TCP device speaking raw MBAP frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use modscan::decode::f32_to_registers;

/// How the device answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Registers holding a big-endian `f32`, padded to the requested quantity.
    Float(f32),
    /// Every requested bit set to the given value.
    Bit(bool),
    /// Exception response with the given code.
    Exception(u8),
    /// Close the connection without answering.
    Close,
}

/// Decides the reply and its delay from the request's arrival index across
/// all connections, its function code and its start address.
pub type Plan = dyn Fn(usize, u8, u16) -> (Duration, Reply) + Send + Sync;

pub struct FakeDevice {
    pub port: u16,
    requests: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
}

impl FakeDevice {
    /// Listen on a loopback port and serve every accepted connection.
    pub async fn spawn<P>(plan: P) -> Self
    where
        P: Fn(usize, u8, u16) -> (Duration, Reply) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let plan: Arc<Plan> = Arc::new(plan);
        let requests = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, plan.clone(), counter.clone()));
            }
        });

        Self {
            port,
            requests,
            connections,
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(mut stream: TcpStream, plan: Arc<Plan>, counter: Arc<AtomicUsize>) {
    loop {
        // Transaction id, protocol id, length, unit id.
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if pdu.len() < 5 || stream.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let function = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = usize::from(u16::from_be_bytes([pdu[3], pdu[4]]));
        let index = counter.fetch_add(1, Ordering::SeqCst);

        let (delay, reply) = (*plan)(index, function, address);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let body = match reply {
            Reply::Close => return,
            Reply::Exception(code) => vec![function | 0x80, code],
            Reply::Float(value) => {
                let mut words = f32_to_registers(value).to_vec();
                words.resize(quantity, 0);
                let mut body = vec![function, (words.len() * 2) as u8];
                for word in words {
                    body.extend_from_slice(&word.to_be_bytes());
                }
                body
            }
            Reply::Bit(bit) => {
                let mut bytes = vec![0u8; quantity.div_ceil(8)];
                if bit {
                    for i in 0..quantity {
                        bytes[i / 8] |= 1 << (i % 8);
                    }
                }
                let mut body = vec![function, bytes.len() as u8];
                body.extend_from_slice(&bytes);
                body
            }
        };

        let mut frame = header[..4].to_vec();
        frame.extend_from_slice(&((body.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend_from_slice(&body);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}
