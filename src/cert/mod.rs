//! 证书协作方接口
//!
//! 控制器在节点要求 TLS 时向这里要证书，并按固定节奏续期。
//! ACME 本身是外部协作方（`AcmeProvider`）；file/self 模式只做
//! 文件存在性与到期检查。

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use tracing::{info, warn};

use crate::config::CertConfig;

/// 续期窗口：剩余有效期低于此天数才触发续期
const RENEW_BEFORE_DAYS: i64 = 30;

/// 需要外部签发的模式。none/file/self 不走 ACME。
pub fn mode_requires_acme(mode: &str) -> bool {
    !matches!(mode, "" | "none" | "file" | "self")
}

/// ACME 协作方。实现方负责签发与续期，写入配置指定的文件路径。
#[async_trait]
pub trait AcmeProvider: Send + Sync {
    async fn obtain(&self, config: &CertConfig) -> Result<()>;
    async fn renew(&self, config: &CertConfig) -> Result<()>;
}

pub struct CertService {
    provider: Option<std::sync::Arc<dyn AcmeProvider>>,
}

impl CertService {
    pub fn new(provider: Option<std::sync::Arc<dyn AcmeProvider>>) -> Self {
        Self { provider }
    }

    /// 节点要求 TLS 时调用：确保证书就位
    pub async fn ensure(&self, config: &CertConfig) -> Result<()> {
        match config.cert_mode.as_str() {
            "" | "none" => Ok(()),
            "file" | "self" => {
                if config.cert_file.is_empty() || config.key_file.is_empty() {
                    bail!("cert_mode {} requires cert_file and key_file", config.cert_mode);
                }
                if !Path::new(&config.cert_file).exists() {
                    bail!("cert file not found: {}", config.cert_file);
                }
                if !Path::new(&config.key_file).exists() {
                    bail!("key file not found: {}", config.key_file);
                }
                Ok(())
            }
            _ => {
                if Path::new(&config.cert_file).exists() {
                    // 已有证书且还在续期窗口外就不打扰签发方
                    if let Ok(info) = expiry_of(&config.cert_file) {
                        if info.days_until_expiry > RENEW_BEFORE_DAYS {
                            return Ok(());
                        }
                    }
                }
                let provider = self
                    .provider
                    .as_ref()
                    .context("cert mode requires an ACME provider, none configured")?;
                info!(domain = config.cert_domain.as_str(), mode = config.cert_mode.as_str(), "requesting certificate");
                provider.obtain(config).await
            }
        }
    }

    /// 日常续期：到窗口才续，失败只告警
    pub async fn renew_if_due(&self, config: &CertConfig) -> Result<bool> {
        if !mode_requires_acme(&config.cert_mode) {
            return Ok(false);
        }
        match expiry_of(&config.cert_file) {
            Ok(info) if info.days_until_expiry > RENEW_BEFORE_DAYS => return Ok(false),
            Ok(info) => {
                info!(
                    domain = config.cert_domain.as_str(),
                    days_left = info.days_until_expiry,
                    "certificate due for renewal"
                );
            }
            Err(e) => {
                warn!(cert = config.cert_file.as_str(), error = %e, "cannot read certificate, forcing renewal");
            }
        }
        let provider = self
            .provider
            .as_ref()
            .context("cert mode requires an ACME provider, none configured")?;
        provider.renew(config).await?;
        Ok(true)
    }
}

/// 证书有效期信息
#[derive(Debug, Clone)]
pub struct CertExpiry {
    pub not_after: String,
    pub days_until_expiry: i64,
}

fn expiry_of(path: &str) -> Result<CertExpiry> {
    let pem = std::fs::read(path).with_context(|| format!("read cert {}", path))?;
    check_expiry(&pem)
}

/// 解析 PEM 证书的有效期。
///
/// 取 PEM 信封里的 DER，沿 TBSCertificate 走到 validity 序列，
/// 读 notAfter。
pub fn check_expiry(pem_data: &[u8]) -> Result<CertExpiry> {
    let pem = std::str::from_utf8(pem_data).map_err(|_| anyhow::anyhow!("PEM is not valid UTF-8"))?;
    let der = decode_pem(pem)?;
    let not_after = parse_not_after(&der)?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let expiry = asn1_time_to_epoch(&not_after)? as i64;

    Ok(CertExpiry {
        not_after,
        days_until_expiry: (expiry - now) / 86400,
    })
}

fn decode_pem(pem: &str) -> Result<Vec<u8>> {
    let begin = "-----BEGIN CERTIFICATE-----";
    let end = "-----END CERTIFICATE-----";
    let start = pem.find(begin).context("missing BEGIN CERTIFICATE marker")? + begin.len();
    let stop = pem[start..].find(end).context("missing END CERTIFICATE marker")?;
    let block: String = pem[start..start + stop].chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(&block)
        .map_err(|e| anyhow::anyhow!("base64 decode error: {}", e))
}

/// Certificate → TBSCertificate → (version?) serial, sigalg, issuer →
/// validity { notBefore, notAfter }
fn parse_not_after(der: &[u8]) -> Result<String> {
    let (_, cert) = asn1_sequence(der)?;
    let (_, tbs) = asn1_sequence(cert)?;

    let mut pos = 0;
    // version 是可选的 context tag [0]
    if !tbs.is_empty() && (tbs[0] & 0xE0) == 0xA0 {
        pos += asn1_element(&tbs[pos..])?.0;
    }
    for _ in 0..3 {
        // serialNumber, signature, issuer
        pos += asn1_element(&tbs[pos..])?.0;
    }
    let (_, validity) = asn1_sequence(&tbs[pos..])?;
    let (nb_len, _) = asn1_element(validity)?;
    let (_, not_after) = asn1_element(&validity[nb_len..])?;

    let s = std::str::from_utf8(not_after).map_err(|_| anyhow::anyhow!("ASN.1 time is not UTF-8"))?;
    if s.len() < 13 {
        bail!("unrecognized ASN.1 time: {}", s);
    }
    Ok(s.to_string())
}

/// 读一个 ASN.1 TLV，返回 (总长度, 内容)
fn asn1_element(data: &[u8]) -> Result<(usize, &[u8])> {
    if data.len() < 2 {
        bail!("ASN.1: unexpected end of data");
    }
    let first = data[1];
    let (len, header) = if first < 0x80 {
        (first as usize, 1)
    } else {
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 4 || data.len() < 2 + n {
            bail!("ASN.1: unsupported length encoding");
        }
        let mut len = 0usize;
        for i in 0..n {
            len = (len << 8) | data[2 + i] as usize;
        }
        (len, 1 + n)
    };
    let total = 1 + header + len;
    if total > data.len() {
        bail!("ASN.1: element length exceeds data");
    }
    Ok((total, &data[1 + header..total]))
}

fn asn1_sequence(data: &[u8]) -> Result<(usize, &[u8])> {
    if data.is_empty() || (data[0] & 0x1F) != 0x10 {
        bail!("ASN.1: expected SEQUENCE");
    }
    asn1_element(data)
}

/// UTCTime (YYMMDDHHMMSSZ) / GeneralizedTime (YYYYMMDDHHMMSSZ) → epoch 秒
fn asn1_time_to_epoch(time: &str) -> Result<u64> {
    let s = time.trim_end_matches('Z');
    let (year, rest) = if s.len() >= 14 {
        (s[..4].parse::<u64>().context("invalid year")?, &s[4..])
    } else if s.len() >= 12 {
        let yy: u64 = s[..2].parse().context("invalid year")?;
        (if yy >= 50 { 1900 + yy } else { 2000 + yy }, &s[2..])
    } else {
        bail!("time string too short: {}", time);
    };
    let month: u64 = rest[..2].parse().context("invalid month")?;
    let day: u64 = rest[2..4].parse().context("invalid day")?;
    let hour: u64 = rest[4..6].parse().context("invalid hour")?;
    let minute: u64 = rest[6..8].parse().context("invalid minute")?;
    let second: u64 = if rest.len() >= 10 {
        rest[8..10].parse().context("invalid second")?
    } else {
        0
    };

    let leap = |y: u64| (y % 4 == 0 && y % 100 != 0) || y % 400 == 0;
    let mut days: u64 = 0;
    for y in 1970..year {
        days += if leap(y) { 366 } else { 365 };
    }
    let month_days = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    for m in 1..month {
        days += month_days[(m - 1) as usize];
        if m == 2 && leap(year) {
            days += 1;
        }
    }
    days += day - 1;
    Ok(days * 86400 + hour * 3600 + minute * 60 + second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acme_needed_only_for_issuing_modes() {
        assert!(!mode_requires_acme(""));
        assert!(!mode_requires_acme("none"));
        assert!(!mode_requires_acme("file"));
        assert!(!mode_requires_acme("self"));
        assert!(mode_requires_acme("http"));
        assert!(mode_requires_acme("dns"));
        assert!(mode_requires_acme("tls"));
    }

    #[test]
    fn utctime_epoch_conversion() {
        // 2024-01-01 00:00:00 UTC = 1704067200
        assert_eq!(asn1_time_to_epoch("240101000000Z").unwrap(), 1_704_067_200);
        assert_eq!(asn1_time_to_epoch("20240101000000Z").unwrap(), 1_704_067_200);
    }

    #[test]
    fn decode_pem_roundtrip() {
        let der = vec![0x30u8, 0x03, 0x02, 0x01, 0x05];
        let b64 = base64::engine::general_purpose::STANDARD.encode(&der);
        let pem = format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", b64);
        assert_eq!(decode_pem(&pem).unwrap(), der);
    }

    #[test]
    fn decode_pem_missing_markers() {
        assert!(decode_pem("not a certificate").is_err());
    }

    #[tokio::test]
    async fn ensure_file_mode_checks_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("fullchain.pem");
        let key_path = dir.path().join("key.pem");

        let mut config = CertConfig::default();
        config.cert_mode = "file".to_string();
        config.cert_file = cert_path.to_str().unwrap().to_string();
        config.key_file = key_path.to_str().unwrap().to_string();

        let service = CertService::new(None);
        assert!(service.ensure(&config).await.is_err());

        std::fs::write(&cert_path, "x").unwrap();
        std::fs::write(&key_path, "x").unwrap();
        assert!(service.ensure(&config).await.is_ok());
    }

    #[tokio::test]
    async fn ensure_none_mode_is_noop() {
        let service = CertService::new(None);
        assert!(service.ensure(&CertConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn acme_mode_without_provider_fails() {
        let mut config = CertConfig::default();
        config.cert_mode = "http".to_string();
        config.cert_file = "/nonexistent/cert.pem".to_string();
        let service = CertService::new(None);
        assert!(service.ensure(&config).await.is_err());
    }

    #[tokio::test]
    async fn renew_skips_non_acme_modes() {
        let service = CertService::new(None);
        let config = CertConfig::default();
        assert!(!service.renew_if_due(&config).await.unwrap());
    }
}
