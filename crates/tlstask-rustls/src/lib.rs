#![doc = r#"
# tlstask-rustls

## 设计动机（Why）
- **真实网络上的连接任务**：为 `tlstask-core` 的 [`SecureConnector`](tlstask_core::SecureConnector)
  契约提供基于 TCP + TLS 的实现，使 `ConnectionManager` 可以直接连接真实服务端；
- **信任决策外置**：证书校验完全交给调用方注入的钩子，适配指纹固定、自签名证书等场景。

## 核心契约（What）
- [`RustlsConnector`]：解析并建连、驱动 `rustls` 握手，握手期间经 `ValidationGate` 调用钩子；
- [`RustlsTransport`]：握手完成的连接，暴露协商出的版本、ALPN 与对端地址（[`Negotiated`]）；
- [`RustlsConnectorConfig`]：ALPN 列表、SNI 开关与建连超时，可从 TOML 加载。

## 实现策略（How）
- 使用 `rustls` + `tokio-rustls` 完成异步握手与数据加解密，密码学提供者固定为 `ring`；
- 自定义 `ServerCertVerifier` 把叶子证书交给闸门，签名校验仍由提供者完成；
- `tokio::io::split` 拆分读写半部，分别交给核心的读泵与写泵。

## 风险与考量（Trade-offs）
- 不加载任何根证书：钩子接受即信任，调用方需自行组合主机名与有效期检查；
- 对端未发送 `close_notify` 即断开时报告为传输失败，而不是 EOF，以防截断攻击被静默接受。
"#]

mod connector;
mod error;
mod stream;
mod verifier;

pub use connector::{RustlsConnector, RustlsConnectorConfig};
pub use stream::{Negotiated, RustlsReader, RustlsTransport, RustlsWriter};
