//! TCP OVSDB sink (§6, §4.11): a listener that accepts a single connection (one managed switch's
//! database per tunnel process) and pipes bytes bidirectionally between it and the
//! `multiplex::Tag::Ovsdb` stream, non-blocking throughout.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::multiplex::Tag;
use crate::result::QuicheResult;

const RECV_BUF_SIZE: usize = 4096;

pub struct OvsdbSink {
    listener: TcpListener,
}

impl OvsdbSink {
    pub async fn bind(local_addr: SocketAddr) -> QuicheResult<Self> {
        Ok(Self { listener: TcpListener::bind(local_addr).await? })
    }

    /// Accepts the one connection this sink ever serves, then pipes bytes in both directions
    /// until the peer closes its half or either channel does.
    pub async fn run(self, to_core: Sender<(Tag, Vec<u8>)>, mut from_core: Receiver<Vec<u8>>) -> QuicheResult<()> {
        let (mut stream, _addr) = self.listener.accept().await?;
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        return Ok(());
                    }
                    if to_core.send((Tag::Ovsdb, buf[..n].to_vec())).await.is_err() {
                        return Ok(());
                    }
                }
                msg = from_core.recv() => {
                    let Some(data) = msg else { return Ok(()) };
                    stream.write_all(&data).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn pipes_bytes_both_directions_until_the_peer_closes() {
        let sink = OvsdbSink::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let listen_addr = sink.listener.local_addr().unwrap();

        let (to_core_tx, mut to_core_rx) = mpsc::channel(4);
        let (from_core_tx, from_core_rx) = mpsc::channel(4);
        let task = tokio::spawn(sink.run(to_core_tx, from_core_rx));

        let mut db = TcpStream::connect(listen_addr).await.unwrap();
        db.write_all(b"ovsdb request").await.unwrap();

        let (tag, data) = to_core_rx.recv().await.unwrap();
        assert_eq!(tag, Tag::Ovsdb);
        assert_eq!(data, b"ovsdb request");

        from_core_tx.send(b"ovsdb response".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = db.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ovsdb response");

        drop(db);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
    }
}
