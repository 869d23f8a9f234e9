//! CGMiner API 行协议客户端
//!
//! 请求是一行 JSON：`{"command":"summary+pools+stats"}`。固件不会可靠地
//! 标示消息结束，只能在收到数据后用空闲计时器判断；响应里可能夹带 `\0`，
//! 多命令请求还会返回多个首尾相接的 JSON 对象 `{...}{...}`。

use crate::error::CgminerError;
use serde_json::Value;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// CGMiner API 默认端口
pub const DEFAULT_PORT: u16 = 4028;

/// 默认空闲关闭时间
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// 默认总超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// CGMiner 客户端
#[derive(Debug, Clone)]
pub struct CgminerClient {
    port: u16,
    timeout: Duration,
    idle_timeout: Duration,
}

impl Default for CgminerClient {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, DEFAULT_TIMEOUT, DEFAULT_IDLE_TIMEOUT)
    }
}

impl CgminerClient {
    pub fn new(port: u16, timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            port,
            timeout,
            idle_timeout,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 地址本身带端口时直接使用，否则拼接默认端口；裸 IPv6 加方括号
    pub fn target(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        if let Ok(ip) = address.parse::<Ipv6Addr>() {
            return SocketAddr::new(IpAddr::V6(ip), self.port).to_string();
        }
        // 主机名:端口，只认单个冒号
        if let Some((host, port)) = address.rsplit_once(':') {
            if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() {
                return address.to_string();
            }
        }
        format!("{}:{}", address, self.port)
    }

    /// 发送单条命令，返回累积的原始文本
    pub async fn send_command(&self, address: &str, command: &str) -> Result<String, CgminerError> {
        let target = self.target(address);
        let deadline = Instant::now() + self.timeout;
        let timeout_ms = self.timeout.as_millis() as u64;

        let mut stream = match tokio::time::timeout_at(deadline, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CgminerError::Connection {
                    address: target,
                    error: e.to_string(),
                })
            }
            Err(_) => return Err(CgminerError::Timeout { address: target, timeout_ms }),
        };

        let request = format!("{}\n", serde_json::json!({ "command": command }));
        trace!("→ {} {}", target, request.trim_end());

        match tokio::time::timeout_at(deadline, stream.write_all(request.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(CgminerError::Io {
                    address: target,
                    error: e.to_string(),
                })
            }
            Err(_) => return Err(CgminerError::Timeout { address: target, timeout_ms }),
        }

        let mut received: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(CgminerError::Timeout { address: target, timeout_ms });
            }

            // 首个数据块到达前只受总超时约束
            let wait = if received.is_empty() {
                deadline - now
            } else {
                self.idle_timeout.min(deadline - now)
            };

            match timeout(wait, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => {
                    return Err(CgminerError::Io {
                        address: target,
                        error: e.to_string(),
                    })
                }
                Err(_) => {
                    if received.is_empty() || Instant::now() >= deadline {
                        return Err(CgminerError::Timeout { address: target, timeout_ms });
                    }
                    debug!("{} idle for {:?}, closing", target, self.idle_timeout);
                    break;
                }
            }
        }

        if received.is_empty() {
            return Err(CgminerError::EmptyResponse { address: target });
        }

        Ok(String::from_utf8_lossy(&received).into_owned())
    }

    /// 发送命令并解析响应中的全部 JSON 对象
    pub async fn query(&self, address: &str, command: &str) -> Result<Vec<Value>, CgminerError> {
        let text = self.send_command(address, command).await?;
        Ok(parse_response(&text))
    }
}

/// 解析可能含 `\0` 且由多个对象首尾相接的响应
///
/// 先尝试整体解析；失败时在 `}{` 处切分，逐段补全括号后解析，丢弃无法解析的片段。
pub fn parse_response(text: &str) -> Vec<Value> {
    let cleaned: String = text.chars().filter(|c| *c != '\0').collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Vec::new();
    }

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return vec![value];
    }

    let pieces: Vec<&str> = cleaned.split("}{").collect();
    let last = pieces.len() - 1;

    pieces
        .iter()
        .enumerate()
        .filter_map(|(i, piece)| {
            let mut fragment = String::with_capacity(piece.len() + 2);
            if i > 0 {
                fragment.push('{');
            }
            fragment.push_str(piece);
            if i < last {
                fragment.push('}');
            }
            match serde_json::from_str::<Value>(&fragment) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("Discarding unparseable CGMiner fragment: {}", e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_target_hostname_with_port() {
        let client = CgminerClient::default();
        assert_eq!(client.target("miner.local"), "miner.local:4028");
        assert_eq!(client.target("miner.local:4028"), "miner.local:4028");
        assert_eq!(client.target("miner.local:14028"), "miner.local:14028");
    }

    #[test]
    fn test_target_brackets_ipv6() {
        let client = CgminerClient::default();
        assert_eq!(client.target("fe80::1"), "[fe80::1]:4028");
        assert_eq!(client.target("::1"), "[::1]:4028");
        assert_eq!(client.target("[::1]:4030"), "[::1]:4030");
    }

    #[test]
    fn test_parse_single_object() {
        let values = parse_response("{\"STATUS\":[{\"STATUS\":\"S\"}]}\0");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["STATUS"][0]["STATUS"], "S");
    }

    #[test]
    fn test_parse_concatenated_objects() {
        let values = parse_response(r#"{"SUMMARY":[{"MHS 5s":"1000"}]}{"STATS":[{"temp1":"55"}]}"#);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["SUMMARY"][0]["MHS 5s"], "1000");
        assert_eq!(values[1]["STATS"][0]["temp1"], "55");
    }

    #[test]
    fn test_parse_discards_broken_fragments() {
        let values = parse_response("{\"A\":1}{\"B\":\0{broken}{\"C\":3}");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["A"], 1);
        assert_eq!(values[1]["C"], 3);
        assert!(parse_response("\0\0").is_empty());
    }

    #[test]
    fn test_target_keeps_explicit_port() {
        let client = CgminerClient::default();
        assert_eq!(client.target("192.168.1.20"), "192.168.1.20:4028");
        assert_eq!(client.target("127.0.0.1:14028"), "127.0.0.1:14028");
    }

    #[tokio::test]
    async fn test_idle_timer_closes_open_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();

            socket.write_all(b"{\"SUMMARY\":[{\"MHS 5s\":").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(b"\"1000\"}]}\0").await.unwrap();
            // 保持连接不关闭，靠客户端空闲计时器结束
            tokio::time::sleep(Duration::from_secs(3)).await;
            request
        });

        let client = CgminerClient::new(4028, Duration::from_secs(2), Duration::from_millis(200));
        let text = client.send_command(&addr.to_string(), "summary").await.unwrap();
        let values = parse_response(&text);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["SUMMARY"][0]["MHS 5s"], "1000");

        server.abort();
    }

    #[tokio::test]
    async fn test_request_line_format() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"{\"VERSION\":[{\"CGMiner\":\"4.11.1\"}]}").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let client = CgminerClient::new(4028, Duration::from_secs(2), Duration::from_millis(200));
        let values = client.query(&addr.to_string(), "version").await.unwrap();
        assert_eq!(values[0]["VERSION"][0]["CGMiner"], "4.11.1");

        let request = server.await.unwrap();
        assert_eq!(request, "{\"command\":\"version\"}\n");
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let client = CgminerClient::new(4028, Duration::from_millis(300), Duration::from_millis(100));
        let result = client.send_command(&addr.to_string(), "summary").await;
        assert!(matches!(result, Err(CgminerError::Timeout { .. })));

        server.abort();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // 先绑定再释放，得到一个大概率空闲的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = CgminerClient::new(4028, Duration::from_secs(1), Duration::from_millis(100));
        let result = client.send_command(&addr.to_string(), "summary").await;
        assert!(matches!(result, Err(CgminerError::Connection { .. })));
    }
}
