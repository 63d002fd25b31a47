//! Authoritative DNS responder.
//!
//! UDP and TCP listeners share one port (both bound with SO_REUSEPORT).
//! Queries are parsed with hickory and answered from the claim store;
//! when the requester sets DO=1 the answer and authority sections are
//! signed online.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::dnssec::rdata::{DNSSECRData, NSEC};
use hickory_proto::rr::rdata::{AAAA, NS};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::signer::{Signer, SignerError};
use crate::store::Store;
use crate::supervisor::FatalError;

/// Maximum UDP datagram we are willing to read (EDNS payload size).
const MAX_UDP_SIZE: usize = 4096;

/// Maximum TCP DNS message size (16-bit length prefix).
const MAX_TCP_SIZE: usize = 65535;

/// TCP read timeout.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL on apex NS records (DNSKEY and SOA carry their own).
const APEX_TTL: u32 = 3600;

/// Authoritative responder for the parent zone.
pub struct DnsServer {
    store: Store,
    signer: Arc<Signer>,
    zone_name: Name,
    ns_hosts: Vec<Name>,
    /// TTL served on AAAA answers, the configured claim lifetime.
    answer_ttl: u32,
}

impl DnsServer {
    pub fn new(config: &Config, store: Store, signer: Arc<Signer>) -> Result<Self, SignerError> {
        let zone_name = abs_name(&config.parent_zone)?;
        let ns_hosts = config
            .dns
            .ns
            .iter()
            .map(|host| abs_name(host))
            .collect::<Result<Vec<_>, _>>()?;
        let answer_ttl = config.ttl.as_secs() as u32;
        Ok(Self {
            store,
            signer,
            zone_name,
            ns_hosts,
            answer_ttl,
        })
    }

    /// Bind both listeners and serve until shutdown. Bind failures are
    /// fatal; so is an accept loop dying outside of shutdown.
    pub async fn run(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), FatalError> {
        let udp = bind_udp(addr).map_err(|source| FatalError::NetworkBind {
            surface: "dns/udp",
            source,
        })?;
        let tcp = bind_tcp(addr).map_err(|source| FatalError::NetworkBind {
            surface: "dns/tcp",
            source,
        })?;
        info!(%addr, "dns server listening on udp and tcp");

        tokio::select! {
            res = self.clone().run_udp(udp, shutdown.clone()) => res,
            res = self.clone().run_tcp(tcp, shutdown) => res,
        }
    }

    async fn run_udp(
        self: Arc<Self>,
        socket: UdpSocket,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FatalError> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_UDP_SIZE];

        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                res = socket.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        // ICMP unreachable surfaces here on some platforms;
                        // the socket itself is still fine.
                        debug!(error = %e, "udp recv error");
                        continue;
                    }
                },
            };

            let query_bytes = buf[..len].to_vec();
            let server = self.clone();
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let query = match Message::from_vec(&query_bytes) {
                    Ok(query) => query,
                    Err(e) => {
                        debug!(%peer, error = %e, "dropping unparseable udp query");
                        return;
                    }
                };
                let response = server.build_response(&query).await;
                match response.to_vec() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, peer).await {
                            warn!(%peer, error = %e, "failed to send udp response");
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "failed to serialize response"),
                }
            });
        }
    }

    async fn run_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FatalError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) if *shutdown.borrow() => {
                        debug!(error = %e, "tcp accept interrupted by shutdown");
                        return Ok(());
                    }
                    Err(source) => {
                        return Err(FatalError::Listener {
                            surface: "dns/tcp",
                            source,
                        })
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_tcp_connection(stream, peer).await {
                    debug!(%peer, error = %e, "tcp connection error");
                }
            });
        }
    }

    /// One TCP connection may carry multiple length-prefixed queries.
    async fn handle_tcp_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> std::io::Result<()> {
        loop {
            let mut len_buf = [0u8; 2];
            match timeout(TCP_TIMEOUT, stream.read_exact(&mut len_buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }

            let msg_len = u16::from_be_bytes(len_buf) as usize;
            if msg_len == 0 || msg_len > MAX_TCP_SIZE {
                warn!(%peer, msg_len, "tcp message length out of range");
                break;
            }

            let mut msg_buf = vec![0u8; msg_len];
            match timeout(TCP_TIMEOUT, stream.read_exact(&mut msg_buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }

            let query = match Message::from_vec(&msg_buf) {
                Ok(query) => query,
                Err(e) => {
                    debug!(%peer, error = %e, "dropping unparseable tcp query");
                    continue;
                }
            };

            let response = self.build_response(&query).await;
            let bytes = match response.to_vec() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to serialize response");
                    continue;
                }
            };

            stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
            stream.write_all(&bytes).await?;
        }
        Ok(())
    }

    /// Build the reply for one request message.
    pub async fn build_response(&self, query: &Message) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(query.op_code());
        response.set_authoritative(true);
        response.set_recursion_desired(query.recursion_desired());
        response.set_recursion_available(false);

        for question in query.queries() {
            response.add_query(question.clone());
        }

        let dnssec_ok = query.edns().map(|edns| edns.dnssec_ok()).unwrap_or(false);
        if query.edns().is_some() {
            let mut edns = Edns::new();
            edns.set_max_payload(MAX_UDP_SIZE as u16);
            edns.set_version(0);
            edns.set_dnssec_ok(dnssec_ok);
            response.set_edns(edns);
        }

        // Only standard queries are answered; everything else gets the
        // bare reply.
        if query.op_code() != OpCode::Query {
            return response;
        }

        for question in query.queries() {
            self.process_question(&mut response, question, dnssec_ok).await;
        }
        response
    }

    async fn process_question(&self, response: &mut Message, question: &Query, dnssec_ok: bool) {
        let qname = question.name().to_lowercase();
        let qtype = question.query_type();
        let at_apex = qname == self.zone_name;

        debug!(qname = %qname, qtype = %qtype, "processing query");

        let mut answers: Vec<Record> = Vec::new();
        match qtype {
            RecordType::DNSKEY if at_apex => answers.push(self.signer.dnskey()),
            RecordType::SOA if at_apex => answers.push(self.signer.soa()),
            RecordType::NS if at_apex => {
                for host in &self.ns_hosts {
                    answers.push(Record::from_rdata(
                        self.zone_name.clone(),
                        APEX_TTL,
                        RData::NS(NS(host.clone())),
                    ));
                }
            }
            RecordType::AAAA => {
                if let Some(label) = leftmost_label(&qname) {
                    match self.store.resolve_by_label(&label).await {
                        Ok(Some(addr)) => answers.push(Record::from_rdata(
                            qname.clone(),
                            self.answer_ttl,
                            RData::AAAA(AAAA(addr)),
                        )),
                        Ok(None) => {}
                        Err(e) => warn!(label, error = %e, "store lookup failed"),
                    }
                }
            }
            _ => {}
        }

        if answers.is_empty() {
            self.answer_negatively(response, &qname, at_apex, dnssec_ok).await;
            return;
        }

        if dnssec_ok {
            match self.signer.sign_rrset(&answers) {
                Ok(rrsig) => {
                    for answer in answers {
                        response.add_answer(answer);
                    }
                    response.add_answer(rrsig);
                }
                Err(e) => {
                    // Degrade to an unsigned answer rather than none.
                    warn!(error = %e, "failed to sign answer rrset");
                    for answer in answers {
                        response.add_answer(answer);
                    }
                }
            }
        } else {
            for answer in answers {
                response.add_answer(answer);
            }
        }
    }

    /// Empty answer: SOA into authority, and under DO=1 an NSEC plus the
    /// RRSIGs over both. RCODE only changes on the unsigned path.
    async fn answer_negatively(
        &self,
        response: &mut Message,
        qname: &Name,
        at_apex: bool,
        dnssec_ok: bool,
    ) {
        let soa = self.signer.soa();

        if dnssec_ok {
            let nsec = self.nsec_record(qname);
            let soa_sig = self.signer.sign_rrset(std::slice::from_ref(&soa));
            let nsec_sig = self.signer.sign_rrset(std::slice::from_ref(&nsec));

            response.add_name_server(soa);
            append_signature(response, soa_sig);
            response.add_name_server(nsec);
            append_signature(response, nsec_sig);
            return;
        }

        response.add_name_server(soa);
        if !at_apex && !self.name_has_claim(qname).await {
            response.set_response_code(ResponseCode::NXDomain);
        }
    }

    /// Whether the queried name falls inside the zone and its leftmost
    /// label carries a live claim.
    async fn name_has_claim(&self, qname: &Name) -> bool {
        if !self.zone_name.zone_of(qname) {
            return false;
        }
        match leftmost_label(qname) {
            Some(label) => matches!(self.store.resolve_by_label(&label).await, Ok(Some(_))),
            None => false,
        }
    }

    /// Minimal denial record: next name is `\000.QNAME`, bitmap NS+SOA.
    fn nsec_record(&self, qname: &Name) -> Record {
        let next = Name::from_labels(std::iter::once(&b"\x00"[..]).chain(qname.iter()))
            .unwrap_or_else(|_| qname.clone());
        let nsec = NSEC::new(next, vec![RecordType::NS, RecordType::SOA]);
        Record::from_rdata(
            qname.clone(),
            APEX_TTL,
            RData::DNSSEC(DNSSECRData::NSEC(nsec)),
        )
    }
}

fn append_signature(response: &mut Message, rrsig: Result<Record, SignerError>) {
    match rrsig {
        Ok(rrsig) => {
            response.add_name_server(rrsig);
        }
        Err(e) => warn!(error = %e, "failed to sign authority rrset"),
    }
}

/// Leftmost label of a name with at least two labels, lowercased.
fn leftmost_label(name: &Name) -> Option<String> {
    if name.num_labels() < 2 {
        return None;
    }
    name.iter()
        .next()
        .map(|label| String::from_utf8_lossy(label).to_lowercase())
}

fn abs_name(host: &str) -> Result<Name, SignerError> {
    let host = host.trim_end_matches('.');
    Name::from_ascii(format!("{host}."))
        .map_err(|e| SignerError::Encoding(format!("bad name {host:?}: {e}")))
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn bind_tcp(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DnsConfig, HttpConfig, NetConfig, ProviderConfig, RandomProviderConfig, StoreConfig,
        WordlistProviderConfig,
    };
    use crate::idprov::RandomId;
    use hickory_proto::rr::dnssec::rdata::DNSSECRData;
    use std::net::Ipv6Addr;
    use tokio::sync::mpsc;

    fn test_config() -> Config {
        Config {
            parent_zone: "example.net".to_string(),
            ttl: Duration::from_secs(48 * 3600),
            provider: ProviderConfig {
                random: RandomProviderConfig {
                    enable: true,
                    id_len: 5,
                },
                wordlist: WordlistProviderConfig { enable: false },
            },
            dns: DnsConfig {
                address: String::new(),
                port: 5354,
                mname: "hostmaster.example.net.".to_string(),
                ns: vec![
                    "ns1.example.net.".to_string(),
                    "ns2.example.net.".to_string(),
                ],
                dnssec_key: None,
            },
            net: NetConfig {
                address: String::new(),
                port: 9999,
            },
            http: HttpConfig {
                address: String::new(),
                port: 8053,
            },
            store: StoreConfig {
                file: "/tmp/unused.db".into(),
                sweep_interval: Duration::from_secs(3600),
            },
        }
    }

    async fn test_server() -> (Arc<DnsServer>, Store) {
        let (tx, _rx) = mpsc::channel(4);
        let config = test_config();
        let store = Store::open_in_memory(
            config.ttl,
            &config.parent_zone,
            vec![Box::new(RandomId::new(5).unwrap())],
            config.store.sweep_interval,
            tx,
        )
        .await
        .unwrap();
        let (signer, _blob) = Signer::generate(
            &config.parent_zone,
            &config.dns.mname,
            &config.dns.ns[0],
            store.clone(),
        )
        .unwrap();
        let server = DnsServer::new(&config, store.clone(), Arc::new(signer)).unwrap();
        (Arc::new(server), store)
    }

    fn query_for(name: &str, qtype: RecordType) -> Message {
        let mut query = Message::new();
        query.set_id(1234);
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        query
    }

    fn with_do_bit(mut query: Message) -> Message {
        let mut edns = Edns::new();
        edns.set_max_payload(4096);
        edns.set_version(0);
        edns.set_dnssec_ok(true);
        query.set_edns(edns);
        query
    }

    fn is_rrsig(record: &Record) -> bool {
        matches!(
            record.data(),
            Some(RData::DNSSEC(DNSSECRData::RRSIG(_)))
        )
    }

    #[tokio::test]
    async fn aaaa_answer_for_claimed_label() {
        let (server, store) = test_server().await;
        let addr: Ipv6Addr = "2001:db8::42".parse().unwrap();
        let (_, fqdn) = store.upsert(addr).await.unwrap();

        let query = query_for(&format!("{fqdn}."), RecordType::AAAA);
        let response = server.build_response(&query).await;

        assert!(response.authoritative());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);

        let answer = &response.answers()[0];
        assert_eq!(answer.ttl(), 172800);
        assert_eq!(answer.data(), Some(&RData::AAAA(AAAA(addr))));
    }

    #[tokio::test]
    async fn aaaa_lookup_is_case_insensitive() {
        let (server, store) = test_server().await;
        let addr: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let (_, fqdn) = store.upsert(addr).await.unwrap();

        let query = query_for(&format!("{}.", fqdn.to_uppercase()), RecordType::AAAA);
        let response = server.build_response(&query).await;
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn unknown_label_is_nxdomain_without_do() {
        let (server, _store) = test_server().await;
        let query = query_for("nonexistent.example.net.", RecordType::AAAA);
        let response = server.build_response(&query).await;

        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
        // SOA for negative caching.
        assert_eq!(response.name_servers().len(), 1);
        assert!(matches!(
            response.name_servers()[0].data(),
            Some(RData::SOA(_))
        ));
    }

    #[tokio::test]
    async fn apex_nodata_keeps_noerror() {
        let (server, _store) = test_server().await;
        let query = query_for("example.net.", RecordType::MX);
        let response = server.build_response(&query).await;

        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
    }

    #[tokio::test]
    async fn known_label_with_foreign_type_is_nodata() {
        let (server, store) = test_server().await;
        let (_, fqdn) = store.upsert("2001:db8::9".parse().unwrap()).await.unwrap();

        let query = query_for(&format!("{fqdn}."), RecordType::TXT);
        let response = server.build_response(&query).await;

        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn name_outside_zone_is_nxdomain() {
        let (server, _store) = test_server().await;
        let query = query_for("something.example.org.", RecordType::AAAA);
        let response = server.build_response(&query).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn signed_nxdomain_has_soa_nsec_and_two_rrsigs() {
        let (server, _store) = test_server().await;
        let query = with_do_bit(query_for("nonexistent.example.net.", RecordType::AAAA));
        let response = server.build_response(&query).await;

        // DNSSEC denial leaves the rcode alone.
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());

        let authority = response.name_servers();
        assert_eq!(authority.len(), 4);
        assert!(matches!(authority[0].data(), Some(RData::SOA(_))));
        assert!(is_rrsig(&authority[1]));
        assert!(is_rrsig(&authority[3]));

        let Some(RData::DNSSEC(DNSSECRData::NSEC(nsec))) = authority[2].data() else {
            panic!("expected NSEC in authority");
        };
        assert_eq!(
            nsec.type_bit_maps(),
            &[RecordType::NS, RecordType::SOA]
        );
        // next = \000.QNAME
        assert_eq!(
            nsec.next_domain_name().num_labels(),
            authority[2].name().num_labels() + 1
        );
    }

    #[tokio::test]
    async fn signed_answer_carries_one_rrsig() {
        let (server, store) = test_server().await;
        let (_, fqdn) = store.upsert("2001:db8::5".parse().unwrap()).await.unwrap();

        let query = with_do_bit(query_for(&format!("{fqdn}."), RecordType::AAAA));
        let response = server.build_response(&query).await;

        assert_eq!(response.answers().len(), 2);
        assert!(matches!(response.answers()[0].data(), Some(RData::AAAA(_))));
        assert!(is_rrsig(&response.answers()[1]));
    }

    #[tokio::test]
    async fn apex_rrsets_are_served() {
        let (server, _store) = test_server().await;

        let response = server
            .build_response(&query_for("example.net.", RecordType::NS))
            .await;
        assert_eq!(response.answers().len(), 2);
        assert!(response
            .answers()
            .iter()
            .all(|r| matches!(r.data(), Some(RData::NS(_)))));

        let response = server
            .build_response(&query_for("example.net.", RecordType::SOA))
            .await;
        assert_eq!(response.answers().len(), 1);

        let response = server
            .build_response(&query_for("example.net.", RecordType::DNSKEY))
            .await;
        assert_eq!(response.answers().len(), 1);
        let Some(RData::DNSSEC(DNSSECRData::DNSKEY(dnskey))) = response.answers()[0].data() else {
            panic!("expected DNSKEY answer");
        };
        assert!(dnskey.zone_key());
        assert!(dnskey.secure_entry_point());
    }

    #[tokio::test]
    async fn apex_types_are_not_served_for_other_names() {
        let (server, _store) = test_server().await;
        let query = query_for("sub.example.net.", RecordType::DNSKEY);
        let response = server.build_response(&query).await;
        assert!(response.answers().is_empty());
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn edns_is_echoed_with_fixed_payload() {
        let (server, _store) = test_server().await;

        let query = with_do_bit(query_for("example.net.", RecordType::SOA));
        let response = server.build_response(&query).await;
        let edns = response.edns().expect("response must carry OPT");
        assert_eq!(edns.max_payload(), 4096);
        assert!(edns.dnssec_ok());

        // No OPT in, no OPT out.
        let response = server
            .build_response(&query_for("example.net.", RecordType::SOA))
            .await;
        assert!(response.edns().is_none());
    }

    #[tokio::test]
    async fn non_query_opcode_gets_empty_reply() {
        let (server, _store) = test_server().await;
        let mut query = query_for("example.net.", RecordType::SOA);
        query.set_op_code(OpCode::Notify);

        let response = server.build_response(&query).await;
        assert!(response.answers().is_empty());
        assert!(response.name_servers().is_empty());
        assert_eq!(response.response_code(), ResponseCode::NoError);
    }

    #[test]
    fn leftmost_label_requires_two_labels() {
        let name = Name::from_ascii("abcde.example.net.").unwrap();
        assert_eq!(leftmost_label(&name).as_deref(), Some("abcde"));

        let name = Name::from_ascii("net.").unwrap();
        assert_eq!(leftmost_label(&name), None);

        let name = Name::from_ascii("AbCdE.example.net.").unwrap();
        assert_eq!(leftmost_label(&name).as_deref(), Some("abcde"));
    }
}
