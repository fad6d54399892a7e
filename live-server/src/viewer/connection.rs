use axum::extract::ws::Message;
use common::{LiveStreamError, Result, ViewerMessage};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ViewerRegistry;

/// 连接的读写期限
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    /// 读空闲期限，每次成功读取后重置
    pub read: Duration,
    /// 协议层ping间隔
    pub ping_interval: Duration,
    /// 单次写入期限
    pub write: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write: Duration::from_secs(10),
        }
    }
}

/// 服务一个观众连接，直到任一方向结束
pub async fn serve_viewer<S>(socket: S, registry: ViewerRegistry)
where
    S: Stream<Item = std::result::Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + 'static,
{
    serve_viewer_with(socket, registry, ConnectionTimeouts::default()).await
}

pub async fn serve_viewer_with<S>(socket: S, registry: ViewerRegistry, timeouts: ConnectionTimeouts)
where
    S: Stream<Item = std::result::Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + 'static,
{
    let (queue, outbound) = ViewerRegistry::client_queue();
    let id = match registry.register(queue).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Failed to register viewer: {}", e);
            return;
        }
    };

    let (sink, stream) = socket.split();
    let mut write_task = tokio::spawn(write_loop(sink, outbound, timeouts));
    let mut read_task = tokio::spawn(read_loop(stream, registry.clone(), id, timeouts.read));

    let write_finished = tokio::select! {
        _ = &mut write_task => true,
        _ = &mut read_task => false,
    };

    registry.unregister(id).await;

    if write_finished {
        read_task.abort();
    } else {
        // 注销会关闭发送队列，写循环发出Close后自行结束
        if timeout(timeouts.write, &mut write_task).await.is_err() {
            write_task.abort();
        }
    }

    info!("Viewer connection {} closed", id);
}

async fn read_loop<R>(mut stream: R, registry: ViewerRegistry, id: Uuid, idle: Duration)
where
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    loop {
        let message = match timeout(idle, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Viewer {} read error: {}", id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!("Viewer {} idle for {:?}", id, idle);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if ViewerMessage::is_pong(&text) {
                    registry.touch(id).await;
                }
            }
            Message::Close(_) => break,
            // 协议层pong只需重置读期限
            _ => {}
        }
    }
}

async fn write_loop<W>(mut sink: W, mut outbound: mpsc::Receiver<ViewerMessage>, timeouts: ConnectionTimeouts)
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut ping = tokio::time::interval_at(Instant::now() + timeouts.ping_interval, timeouts.ping_interval);

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let frame = Message::Text(message.to_text());
                    if let Err(e) = send_frame(&mut sink, frame, timeouts.write).await {
                        debug!("Viewer write failed: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = send_frame(&mut sink, Message::Close(None), timeouts.write).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = send_frame(&mut sink, Message::Ping(Vec::new()), timeouts.write).await {
                    debug!("Viewer ping failed: {}", e);
                    break;
                }
            }
        }
    }
}

async fn send_frame<W>(sink: &mut W, frame: Message, deadline: Duration) -> Result<()>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    match timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LiveStreamError::ConnectionFailure(e.to_string())),
        Err(_) => Err(LiveStreamError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// 内存中的WebSocket替身
    struct MockSocket {
        incoming: fmpsc::UnboundedReceiver<std::result::Result<Message, axum::Error>>,
        outgoing: fmpsc::UnboundedSender<Message>,
    }

    impl Stream for MockSocket {
        type Item = std::result::Result<Message, axum::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_next_unpin(cx)
        }
    }

    impl Sink<Message> for MockSocket {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> std::result::Result<(), Self::Error> {
            self.outgoing.unbounded_send(item).map_err(|_| {
                axum::Error::new(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
            })
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Peer {
        incoming: fmpsc::UnboundedSender<std::result::Result<Message, axum::Error>>,
        outgoing: fmpsc::UnboundedReceiver<Message>,
    }

    impl Peer {
        async fn next_frame(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(5), self.outgoing.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
        }

        fn send_text(&self, text: &str) {
            self.incoming
                .unbounded_send(Ok(Message::Text(text.to_string())))
                .unwrap();
        }
    }

    fn socket_pair() -> (MockSocket, Peer) {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        (
            MockSocket {
                incoming: in_rx,
                outgoing: out_tx,
            },
            Peer {
                incoming: in_tx,
                outgoing: out_rx,
            },
        )
    }

    fn registry() -> ViewerRegistry {
        let (registry, _task) = ViewerRegistry::spawn_with_heartbeat(Duration::from_secs(3600));
        registry
    }

    async fn wait_for_count(registry: &ViewerRegistry, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.viewer_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("viewer count not reached");
    }

    fn text(message: ViewerMessage) -> Message {
        Message::Text(message.to_text())
    }

    #[tokio::test]
    async fn test_viewer_lifecycle() {
        let registry = registry();
        let (socket, mut peer) = socket_pair();
        let handler = tokio::spawn(serve_viewer(socket, registry.clone()));

        assert_eq!(peer.next_frame().await, text(ViewerMessage::ViewerCount { count: 1 }));
        assert_eq!(registry.viewer_count(), 1);

        // 客户端关闭
        peer.incoming
            .unbounded_send(Ok(Message::Close(None)))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap();
        wait_for_count(&registry, 0).await;
        assert_eq!(peer.next_frame().await, Message::Close(None));
    }

    #[tokio::test]
    async fn test_counts_reach_every_connection() {
        let registry = registry();
        let (first, mut first_peer) = socket_pair();
        let (second, mut second_peer) = socket_pair();

        tokio::spawn(serve_viewer(first, registry.clone()));
        assert_eq!(first_peer.next_frame().await, text(ViewerMessage::ViewerCount { count: 1 }));

        let second_handler = tokio::spawn(serve_viewer(second, registry.clone()));
        assert_eq!(second_peer.next_frame().await, text(ViewerMessage::ViewerCount { count: 2 }));
        assert_eq!(first_peer.next_frame().await, text(ViewerMessage::ViewerCount { count: 2 }));

        // 第二个观众的传输出错，只注销它自己
        second_peer
            .incoming
            .unbounded_send(Err(axum::Error::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))))
            .unwrap();
        second_handler.await.unwrap();

        assert_eq!(first_peer.next_frame().await, text(ViewerMessage::ViewerCount { count: 1 }));
        assert_eq!(registry.viewer_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_read_deadline_disconnects() {
        let registry = registry();
        let (socket, mut peer) = socket_pair();
        let timeouts = ConnectionTimeouts {
            read: Duration::from_millis(200),
            ..ConnectionTimeouts::default()
        };

        let handler = tokio::spawn(serve_viewer_with(socket, registry.clone(), timeouts));
        peer.next_frame().await;

        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap();
        wait_for_count(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let registry = registry();
        let (socket, mut peer) = socket_pair();
        let timeouts = ConnectionTimeouts {
            read: Duration::from_millis(300),
            ..ConnectionTimeouts::default()
        };

        let handler = tokio::spawn(serve_viewer_with(socket, registry.clone(), timeouts));
        peer.next_frame().await;

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            peer.send_text(r#"{"type":"pong"}"#);
        }
        assert!(!handler.is_finished());
        assert_eq!(registry.viewer_count(), 1);

        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap();
        wait_for_count(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_sends_protocol_pings() {
        let registry = registry();
        let (socket, mut peer) = socket_pair();
        let timeouts = ConnectionTimeouts {
            ping_interval: Duration::from_millis(50),
            ..ConnectionTimeouts::default()
        };

        tokio::spawn(serve_viewer_with(socket, registry.clone(), timeouts));
        assert_eq!(peer.next_frame().await, text(ViewerMessage::ViewerCount { count: 1 }));
        assert!(matches!(peer.next_frame().await, Message::Ping(_)));
    }
}
