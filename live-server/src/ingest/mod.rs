// 推流接入
//
// 会话编排只依赖 `PublishConnection`，不关心具体的推流协议。
// 这里提供一个HTTP-FLV推流适配器：推流端以分块POST的方式把FLV字节流
// 发到 `/live/<key>`。

mod http_push;

pub use http_push::router;

use async_trait::async_trait;
use common::{MediaPacket, Result, TrackInfo};

/// 一个已建立的推流连接
#[async_trait]
pub trait PublishConnection: Send {
    /// 推流路径，形如 `/live/<key>`
    fn path(&self) -> &str;

    /// 读取推流端声明的轨道信息，必须先于第一个媒体包调用
    async fn read_tracks(&mut self) -> Result<TrackInfo>;

    /// 按到达顺序读取下一个媒体包；推流端正常结束时返回 `None`
    async fn read_packet(&mut self) -> Result<Option<MediaPacket>>;

    /// 关闭连接，可重复调用
    async fn close(&mut self);
}
