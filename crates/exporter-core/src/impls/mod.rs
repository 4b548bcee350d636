//! Impls - 本番用の外部境界の実装
//!
//! # 含まれる実装
//! - **RumqttTransport**: rumqttc による `Transport` 実装
//! - **HttpServer**: axum による `RequestBridge` のフロントエンド
//!
//! テスト用の fake transport は `ports::transport` 側にある。

pub mod http;
pub mod mqtt;

// 主要な型を再エクスポート
pub use self::http::{HttpServer, ServerConfig, ServerError};
pub use self::mqtt::RumqttTransport;
