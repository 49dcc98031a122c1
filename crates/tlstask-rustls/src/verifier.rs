use std::sync::Arc;

use rustls::{
    CertificateError, DigitallySignedStruct, Error, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tlstask_core::{PeerCertificate, ValidationGate, Verdict};
use tracing::debug;

/// 把 `rustls` 的证书校验回调接到 [`ValidationGate`] 上。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 信任决策完全交给调用方注入的钩子：不加载任何根证书、不做 WebPKI 链校验，
///   指纹固定与自签名证书因此可以直接使用；
/// - 握手签名仍由密码学提供者校验，保证对端确实持有所出示证书的私钥。
///
/// ## 逻辑（How）
/// - `verify_server_cert` 同步调用 `gate.evaluate`，`rustls` 在返回之前不会推进握手；
/// - 拒绝时返回 `ApplicationVerificationFailure`，`rustls` 随即向对端发送告警并终止握手；
/// - 签名校验委托给提供者的 `signature_verification_algorithms`。
///
/// ## 契约（What）
/// - 每个验证器只服务一次握手，闸门保证钩子至多调用一次；
/// - 中间证书、OCSP 与 `rustls` 提供的当前时间均被忽略，时间由闸门的时钟提供。
#[derive(Debug)]
pub(crate) struct GateVerifier {
    gate: Arc<ValidationGate>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl GateVerifier {
    pub(crate) fn new(gate: Arc<ValidationGate>, algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self { gate, algorithms }
    }
}

impl ServerCertVerifier for GateVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        debug!(
            server_name = ?server_name,
            intermediates = intermediates.len(),
            "handing peer certificate to validation gate"
        );
        let certificate = PeerCertificate::from_der(end_entity.as_ref().to_vec());
        match self.gate.evaluate(&certificate) {
            Verdict::Accept => Ok(ServerCertVerified::assertion()),
            Verdict::Reject => Err(Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
