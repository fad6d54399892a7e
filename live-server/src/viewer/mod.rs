// 观众在线管理
//
// 注册表维护当前连接的观众并广播人数与心跳，
// 每个WebSocket连接由独立的读写循环服务。

mod connection;
mod registry;

pub use connection::serve_viewer;
pub use registry::ViewerRegistry;
