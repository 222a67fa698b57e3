//! UDP OpenFlow sink (§6, §4.11): binds a local UDP socket, learns the switch's address from the
//! first datagram it receives (there is no prior configuration step that would tell it), and from
//! then on shuttles bytes between that socket and the `multiplex::Tag::OpenFlow` stream.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::multiplex::Tag;
use crate::result::QuicheResult;

const RECV_BUF_SIZE: usize = 2048;

pub struct OpenFlowSink {
    socket: UdpSocket,
    peer_addr: Option<SocketAddr>,
}

impl OpenFlowSink {
    pub async fn bind(local_addr: SocketAddr) -> QuicheResult<Self> {
        Ok(Self { socket: UdpSocket::bind(local_addr).await?, peer_addr: None })
    }

    /// Runs until either channel closes. `to_core` carries datagrams read off the switch socket,
    /// tagged `OpenFlow`, toward the QUIC stream; `from_core` carries bytes the stream delivered,
    /// which get `sendto`'d back to whichever address was learned.
    pub async fn run(mut self, to_core: Sender<(Tag, Vec<u8>)>, mut from_core: Receiver<Vec<u8>>) -> QuicheResult<()> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = result?;
                    self.peer_addr.get_or_insert(addr);
                    if to_core.send((Tag::OpenFlow, buf[..n].to_vec())).await.is_err() {
                        return Ok(());
                    }
                }
                msg = from_core.recv() => {
                    let Some(data) = msg else { return Ok(()) };
                    // No switch has spoken yet: there is nowhere to `sendto`, so this is dropped
                    // rather than queued (§6 names no backpressure policy for the unlearned case).
                    if let Some(addr) = self.peer_addr {
                        self.socket.send_to(&data, addr).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn learns_peer_address_and_forwards_both_ways() {
        let switch = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let switch_addr = switch.local_addr().unwrap();

        let sink = OpenFlowSink::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sink_addr = sink.socket.local_addr().unwrap();

        let (to_core_tx, mut to_core_rx) = mpsc::channel(4);
        let (from_core_tx, from_core_rx) = mpsc::channel(4);
        let task = tokio::spawn(sink.run(to_core_tx, from_core_rx));

        switch.connect(sink_addr).await.unwrap();
        switch.send(b"hello controller").await.unwrap();

        let (tag, data) = to_core_rx.recv().await.unwrap();
        assert_eq!(tag, Tag::OpenFlow);
        assert_eq!(data, b"hello controller");

        from_core_tx.send(b"reply from stream".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = switch.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply from stream");

        drop(from_core_tx);
        task.abort();
    }
}
