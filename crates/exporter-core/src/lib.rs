//! exporter-core
//!
//! MQTT のトピック値を Prometheus 形式で公開するエクスポーターの中核。
//!
//! # モジュール構成
//! - **scheduler**: 単一コンシューマのタスクスケジューラ（priority + FIFO、遅延 requeue）
//! - **state_machine**: スケジューラ上で遷移を評価する汎用ステートマシン
//! - **session**: MQTT 接続のライフサイクル（再接続・再購読・メッセージ配送）
//! - **bridge**: HTTP の接続スレッドからスケジューラへのリクエスト受け渡し
//! - **metrics**: トピック値の履歴と Prometheus テキストへの変換
//! - **config**: JSON 設定ファイル
//! - **ports**: 外部ライブラリへの境界（Transport trait）
//! - **impls**: 本番用実装（rumqttc, axum）
//! - **app**: コンポジションルートと停止手順
//!
//! セッション状態・トピック一覧・メトリクスはスケジューラスレッドからしか
//! 触らない。他スレッド（ネットワーク、HTTP、シグナル）はイベントを
//! dispatch するかタスクを submit するだけ。

pub mod app;
pub mod bridge;
pub mod config;
pub mod impls;
pub mod metrics;
pub mod ports;
pub mod scheduler;
pub mod session;
pub mod state_machine;

// 主要な型を再エクスポート
pub use self::app::{BuildError, Exporter, ExporterBuilder, ShutdownHandle, ShutdownOutcome};
pub use self::config::{ConfigError, Configuration};
pub use self::scheduler::{SchedulerError, TaskScheduler};
