//! DNS probe implementation.
//!
//! Queries go over UDP to an explicit nameserver, or to the first nameserver
//! of the system resolver configuration when none is given. Either way the
//! raw response message is reported. There is no retry, no TCP fallback
//! and no caching; query errors are returned to the caller unclassified.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use serde::Serialize;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::db::{PingHistory, PingRecord};
use crate::metrics::Metrics;

/// Read timeout for a single UDP query.
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS probe error types.
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("invalid nameserver: {0}")]
    Nameserver(String),
    #[error("{0}")]
    Proto(#[from] ProtoError),
    #[error("no system nameserver configured")]
    NoSystemNameserver,
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("transaction ID mismatch: got {got}, expected {expected}")]
    IdMismatch { got: u16, expected: u16 },
}

/// The raw response to one DNS query.
#[derive(Debug, Clone, Serialize)]
pub struct DnsAnswer {
    pub record_type: String,
    pub id: u16,
    pub response_code: String,
    pub flags: Vec<&'static str>,
    pub question: Vec<String>,
    pub answer: Vec<String>,
    pub authority: Vec<String>,
    pub additional: Vec<String>,
}

impl DnsAnswer {
    fn from_message(record_type: RecordType, message: &Message) -> Self {
        let mut flags = Vec::new();
        if message.message_type() == MessageType::Response {
            flags.push("QR");
        }
        if message.authoritative() {
            flags.push("AA");
        }
        if message.truncated() {
            flags.push("TC");
        }
        if message.recursion_desired() {
            flags.push("RD");
        }
        if message.recursion_available() {
            flags.push("RA");
        }

        Self {
            record_type: record_type.to_string(),
            id: message.id(),
            response_code: message.response_code().to_string(),
            flags,
            question: message.queries().iter().map(format_query).collect(),
            answer: message.answers().iter().map(|r| r.to_string()).collect(),
            authority: message.name_servers().iter().map(|r| r.to_string()).collect(),
            additional: message.additionals().iter().map(|r| r.to_string()).collect(),
        }
    }
}

fn format_query(query: &Query) -> String {
    format!(
        "{} {} {}",
        query.name(),
        query.query_class(),
        query.query_type()
    )
}

impl fmt::Display for DnsAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "id {}", self.id)?;
        writeln!(f, "opcode QUERY")?;
        writeln!(f, "rcode {}", self.response_code)?;
        writeln!(f, "flags {}", self.flags.join(" "))?;
        for (section, lines) in [
            (";QUESTION", &self.question),
            (";ANSWER", &self.answer),
            (";AUTHORITY", &self.authority),
            (";ADDITIONAL", &self.additional),
        ] {
            writeln!(f, "{}", section)?;
            for line in lines {
                writeln!(f, "{}", line)?;
            }
        }
        Ok(())
    }
}

/// The three answers gathered by one DNS check.
#[derive(Debug, Clone, Serialize)]
pub struct DnsReport {
    pub domain: String,
    pub nameserver: Option<String>,
    pub a: DnsAnswer,
    pub ns: DnsAnswer,
    pub mx: DnsAnswer,
}

/// Runs DNS queries and records one summary per check.
pub struct DnsProber {
    /// Nameservers from the system resolver configuration, in order
    system_nameservers: Vec<SocketAddr>,
    history: PingHistory,
    metrics: Arc<Metrics>,
}

impl DnsProber {
    /// Build a prober around the system resolver configuration.
    pub fn new(history: PingHistory, metrics: Arc<Metrics>) -> Self {
        let nameservers = match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, _)) => {
                let mut addrs: Vec<SocketAddr> = Vec::new();
                for ns in config.name_servers() {
                    if !addrs.contains(&ns.socket_addr) {
                        addrs.push(ns.socket_addr);
                    }
                }
                addrs
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not read system resolver config");
                Vec::new()
            }
        };
        tracing::debug!(nameservers = ?nameservers, "System nameservers loaded");
        Self::with_system_nameservers(history, metrics, nameservers)
    }

    pub fn with_system_nameservers(
        history: PingHistory,
        metrics: Arc<Metrics>,
        system_nameservers: Vec<SocketAddr>,
    ) -> Self {
        Self {
            system_nameservers,
            history,
            metrics,
        }
    }

    /// Query `domain` for A, NS and MX records and record the lookup.
    ///
    /// The first failing query aborts the check and nothing is recorded.
    pub async fn check(&self, domain: &str, nameserver: Option<&str>) -> Result<DnsReport, DnsError> {
        self.metrics.dns_checks.inc();

        let a = self.execute(domain, RecordType::A, nameserver).await?;
        let ns = self.execute(domain, RecordType::NS, nameserver).await?;
        let mx = self.execute(domain, RecordType::MX, nameserver).await?;

        let shown_nameserver = nameserver.unwrap_or("None");
        self.history.save(
            domain,
            PingRecord::new(
                format!("dns lookup for {} on {}", domain, shown_nameserver),
                "N/A",
            ),
        );

        Ok(DnsReport {
            domain: domain.to_string(),
            nameserver: nameserver.map(str::to_string),
            a,
            ns,
            mx,
        })
    }

    /// Run a single query of `record_type` for `domain`.
    pub async fn execute(
        &self,
        domain: &str,
        record_type: RecordType,
        nameserver: Option<&str>,
    ) -> Result<DnsAnswer, DnsError> {
        let name = Name::from_str_relaxed(domain)?;

        let addr = match nameserver {
            Some(server) => parse_nameserver(server)?,
            None => *self
                .system_nameservers
                .first()
                .ok_or(DnsError::NoSystemNameserver)?,
        };
        let response = query_udp(addr, name, record_type).await?;
        Ok(DnsAnswer::from_message(record_type, &response))
    }
}

/// Accept `ip` or `ip:port`; the port defaults to 53.
fn parse_nameserver(server: &str) -> Result<SocketAddr, DnsError> {
    let server = server.trim();
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    server
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| DnsError::Nameserver(server.to_string()))
}

/// Build a recursive query message for `name`.
fn build_query(id: u16, name: Name, record_type: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    message
}

/// Send one query over UDP and return the raw response message.
async fn query_udp(addr: SocketAddr, name: Name, record_type: RecordType) -> Result<Message, DnsError> {
    let id: u16 = rand::random();
    let packet = build_query(id, name, record_type).to_vec()?;

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    socket.send(&packet).await?;

    let mut buf = vec![0u8; 65535];
    let n = tokio::time::timeout(DNS_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| DnsError::Timeout(DNS_TIMEOUT))??;

    let response = Message::from_vec(&buf[..n])?;
    if response.id() != id {
        return Err(DnsError::IdMismatch {
            got: response.id(),
            expected: id,
        });
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::{rdata::A, RData, Record};
    use std::net::Ipv4Addr;

    /// Answer authoritatively, with an A record for A queries and one glue
    /// record in the additional section.
    async fn spawn_fake_nameserver() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let query = Message::from_vec(&buf[..n]).unwrap();
                let question = query.queries()[0].clone();

                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_authoritative(true)
                    .set_recursion_desired(query.recursion_desired())
                    .set_recursion_available(false)
                    .add_query(question.clone());
                response.add_additional(Record::from_rdata(
                    Name::from_ascii("extra.example.com.").unwrap(),
                    300,
                    RData::A(A(Ipv4Addr::new(5, 6, 7, 8))),
                ));
                if question.query_type() == RecordType::A {
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        300,
                        RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
                    ));
                }
                let bytes = response.to_vec().unwrap();
                let _ = socket.send_to(&bytes, peer).await;
            }
        });
        addr
    }

    fn prober() -> (DnsProber, PingHistory) {
        let history = PingHistory::new(Arc::new(Store::in_memory().unwrap()));
        let metrics = Arc::new(Metrics::new("test").unwrap());
        (DnsProber::new(history.clone(), metrics), history)
    }

    fn prober_with_system(nameservers: Vec<SocketAddr>) -> (DnsProber, PingHistory) {
        let history = PingHistory::new(Arc::new(Store::in_memory().unwrap()));
        let metrics = Arc::new(Metrics::new("test").unwrap());
        let prober = DnsProber::with_system_nameservers(history.clone(), metrics, nameservers);
        (prober, history)
    }

    #[test]
    fn test_build_query() {
        let name = Name::from_str_relaxed("example.com").unwrap();
        let message = build_query(42, name, RecordType::MX);
        let bytes = message.to_vec().unwrap();
        // 12 byte header, 13 byte name, 4 bytes type/class
        assert!(bytes.len() >= 29);

        let parsed = Message::from_vec(&bytes).unwrap();
        assert_eq!(parsed.id(), 42);
        assert!(parsed.recursion_desired());
        assert_eq!(parsed.queries()[0].query_type(), RecordType::MX);
    }

    #[test]
    fn test_parse_nameserver() {
        assert_eq!(
            parse_nameserver("10.96.0.10").unwrap(),
            "10.96.0.10:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_nameserver("127.0.0.1:5353").unwrap(),
            "127.0.0.1:5353".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            parse_nameserver("ns1.example.com"),
            Err(DnsError::Nameserver(_))
        ));
    }

    #[tokio::test]
    async fn test_query_explicit_nameserver() {
        let addr = spawn_fake_nameserver().await;
        let (prober, _) = prober();

        let answer = prober
            .execute("example.com", RecordType::A, Some(&addr.to_string()))
            .await
            .unwrap();

        assert_eq!(answer.record_type, "A");
        assert_eq!(answer.answer.len(), 1);
        assert!(answer.answer[0].contains("93.184.216.34"));
        assert!(answer.flags.contains(&"QR"));
        assert!(answer.to_string().contains(";ANSWER"));
    }

    #[tokio::test]
    async fn test_system_path_reports_raw_response() {
        let addr = spawn_fake_nameserver().await;
        let (prober, _) = prober_with_system(vec![addr]);

        let direct = prober
            .execute("example.com", RecordType::A, Some(&addr.to_string()))
            .await
            .unwrap();
        let system = prober
            .execute("example.com", RecordType::A, None)
            .await
            .unwrap();

        for answer in [&direct, &system] {
            assert_eq!(answer.flags, vec!["QR", "AA", "RD"]);
            assert_eq!(answer.response_code, ResponseCode::NoError.to_string());
            assert_eq!(answer.additional.len(), 1);
            assert!(answer.additional[0].starts_with("extra.example.com."));
            assert!(answer.additional[0].contains("5.6.7.8"));
            assert_eq!(answer.answer.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_system_path_without_nameservers() {
        let (prober, history) = prober_with_system(Vec::new());

        let result = prober.check("example.com", None).await;

        assert!(matches!(result, Err(DnsError::NoSystemNameserver)));
        assert!(history.get("example.com").is_none());
    }

    #[tokio::test]
    async fn test_check_records_summary() {
        let addr = spawn_fake_nameserver().await;
        let server = addr.to_string();
        let (prober, history) = prober();

        let report = prober.check("example.com", Some(&server)).await.unwrap();

        assert_eq!(report.a.answer.len(), 1);
        assert!(report.ns.answer.is_empty());
        assert!(report.mx.answer.is_empty());

        let record = history.get("example.com").unwrap();
        assert_eq!(
            record,
            PingRecord::new(format!("dns lookup for example.com on {}", server), "N/A")
        );
    }

    #[tokio::test]
    async fn test_invalid_nameserver_propagates() {
        let (prober, history) = prober();

        let result = prober.check("example.com", Some("not-an-ip")).await;

        assert!(matches!(result, Err(DnsError::Nameserver(_))));
        assert!(history.get("example.com").is_none());
    }
}
