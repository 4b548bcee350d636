//! Ports - 外部ライブラリへの境界
//!
//! コアが依存するのは trait だけ。ネイティブクライアントの実装は `impls` に置く。

pub mod transport;

pub use self::transport::{
    Message, Transport, TransportCallbacks, TransportError, TransportHandle,
};
