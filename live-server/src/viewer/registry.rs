use common::{LiveStreamError, Result, ViewerMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 每个观众的发送队列容量
pub const CLIENT_QUEUE_CAPACITY: usize = 256;
/// 心跳周期
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connected,
    Disconnecting,
}

struct ViewerClient {
    sender: mpsc::Sender<ViewerMessage>,
    last_heartbeat: Instant,
    state: ClientState,
}

enum RegistryCommand {
    Register {
        sender: mpsc::Sender<ViewerMessage>,
        reply: oneshot::Sender<Uuid>,
    },
    Unregister(Uuid),
    Touch(Uuid),
}

/// 观众注册表句柄
///
/// 观众集合只由后台任务持有和修改，句柄通过命令队列与之通信；
/// 在线人数单独发布，可以随时并发读取。
#[derive(Clone)]
pub struct ViewerRegistry {
    commands: mpsc::Sender<RegistryCommand>,
    count: Arc<RwLock<usize>>,
}

impl ViewerRegistry {
    /// 启动注册表任务，所有句柄被丢弃后任务退出
    pub fn spawn() -> (Self, JoinHandle<()>) {
        Self::spawn_with_heartbeat(HEARTBEAT_INTERVAL)
    }

    pub fn spawn_with_heartbeat(heartbeat: Duration) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let count = Arc::new(RwLock::new(0));

        let actor = RegistryActor {
            clients: HashMap::new(),
            count: count.clone(),
        };
        let handle = tokio::spawn(actor.run(receiver, heartbeat));

        (Self { commands, count }, handle)
    }

    /// 新建一个观众发送队列
    pub fn client_queue() -> (mpsc::Sender<ViewerMessage>, mpsc::Receiver<ViewerMessage>) {
        mpsc::channel(CLIENT_QUEUE_CAPACITY)
    }

    /// 注册观众，返回分配的id
    pub async fn register(&self, sender: mpsc::Sender<ViewerMessage>) -> Result<Uuid> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Register { sender, reply })
            .await
            .map_err(|_| LiveStreamError::ConnectionFailure("viewer registry stopped".into()))?;

        response
            .await
            .map_err(|_| LiveStreamError::ConnectionFailure("viewer registry stopped".into()))
    }

    /// 注销观众，可重复调用
    pub async fn unregister(&self, id: Uuid) {
        if self.commands.send(RegistryCommand::Unregister(id)).await.is_err() {
            debug!("Viewer registry stopped before unregistering {}", id);
        }
    }

    /// 收到客户端pong，刷新心跳时间
    pub async fn touch(&self, id: Uuid) {
        if self.commands.send(RegistryCommand::Touch(id)).await.is_err() {
            debug!("Viewer registry stopped before refreshing {}", id);
        }
    }

    pub fn viewer_count(&self) -> usize {
        *self.count.read()
    }
}

struct RegistryActor {
    clients: HashMap<Uuid, ViewerClient>,
    count: Arc<RwLock<usize>>,
}

impl RegistryActor {
    async fn run(mut self, mut commands: mpsc::Receiver<RegistryCommand>, heartbeat: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => self.heartbeat(),
            }
        }

        debug!("Viewer registry stopped ({} clients dropped)", self.clients.len());
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register { sender, reply } => {
                let id = Uuid::new_v4();
                self.clients.insert(
                    id,
                    ViewerClient {
                        sender,
                        last_heartbeat: Instant::now(),
                        state: ClientState::Connected,
                    },
                );
                let count = self.publish_count();
                info!("Viewer {} connected, total: {}", id, count);
                self.broadcast_count();

                if reply.send(id).is_err() {
                    // 调用方已放弃，立即清理
                    self.remove(id);
                }
            }
            RegistryCommand::Unregister(id) => self.remove(id),
            RegistryCommand::Touch(id) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.last_heartbeat = Instant::now();
                }
            }
        }
    }

    fn remove(&mut self, id: Uuid) {
        // 移除即丢弃发送端，连接的写循环随之结束
        if self.clients.remove(&id).is_some() {
            let count = self.publish_count();
            info!("Viewer {} disconnected, total: {}", id, count);
            self.broadcast_count();
        }
    }

    /// 给所有观众发ping，队列已满或已关闭的观众在本轮直接剔除
    fn heartbeat(&mut self) {
        let now = Instant::now();
        for (id, client) in self.clients.iter_mut() {
            match client.sender.try_send(ViewerMessage::Ping) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Viewer {} queue full, evicting (last heartbeat {:?} ago)",
                        id,
                        now.duration_since(client.last_heartbeat)
                    );
                    client.state = ClientState::Disconnecting;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Viewer {} queue closed, evicting", id);
                    client.state = ClientState::Disconnecting;
                }
            }
        }

        let before = self.clients.len();
        self.clients
            .retain(|_, client| client.state == ClientState::Connected);
        let evicted = before - self.clients.len();

        if evicted > 0 {
            let count = self.publish_count();
            info!("Evicted {} unresponsive viewers, total: {}", evicted, count);
            self.broadcast_count();
        }
    }

    fn broadcast_count(&self) {
        let message = ViewerMessage::ViewerCount {
            count: self.connected(),
        };
        for (id, client) in &self.clients {
            if client.state != ClientState::Connected {
                continue;
            }
            if let Err(TrySendError::Full(_)) = client.sender.try_send(message.clone()) {
                debug!("Viewer {} queue full, dropping count update", id);
            }
        }
    }

    fn connected(&self) -> usize {
        self.clients
            .values()
            .filter(|client| client.state == ClientState::Connected)
            .count()
    }

    fn publish_count(&self) -> usize {
        let count = self.connected();
        *self.count.write() = count;
        count
    }
}
