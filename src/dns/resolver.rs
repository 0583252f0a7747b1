//! hostname resolution over the event loop, with a TTL cache
//!
//! A cache miss starts exactly one wire exchange per hostname; callers
//! arriving while it is in flight are queued on the entry and all see
//! the same outcome. Name servers are walked in order for A records
//! first, then again for AAAA, with a fresh query packet per family.
//! Published entries are never mutated, only evicted when their TTL
//! lapses.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

use crate::aio::{AioError, EventLoop};
use crate::dns::config::{self, ResolverOptions};
use crate::dns::protocol::{self, DnsPacket, QueryType, ResultCode};
use crate::net::{self, RawSock};

/// Cap on how long a record may stay cached, whatever its TTL says.
pub const MAX_TTL_SECONDS: u32 = 3600;

/// How long one name server gets to answer before failover.
pub const DNS_SERVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Failed resolutions are cached this long.
const FAILURE_TTL_SECONDS: u32 = 60;

const RESPONSE_BUF_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Display, Error, From)]
pub enum ResolveError {
    InvalidHostname,
    InvalidResolvConfig,
    UnableToResolve,
    /// The server sent something that does not parse as an answer to
    /// our question.
    ServerError,
    Io(AioError),
}

/// A resolved address and the TTL it arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsAnswer {
    pub addr: IpAddr,
    pub ttl_secs: u32,
}

type ResolveCb = Box<dyn FnOnce(&mut EventLoop, Result<DnsAnswer, ResolveError>)>;

struct CacheEntry {
    answer: Option<DnsAnswer>,
    error: Option<ResolveError>,
    resolving: bool,
    waiters: Vec<ResolveCb>,
    /// Distinguishes this entry from any later one under the same name
    /// when its eviction timeout fires.
    epoch: u64,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn resolving(epoch: u64) -> CacheEntry {
        CacheEntry {
            answer: None,
            error: None,
            resolving: true,
            waiters: Vec::new(),
            epoch,
            expires_at: None,
        }
    }
}

struct Inner {
    name_servers: Vec<SocketAddr>,
    hosts: HashMap<String, IpAddr>,
    cache: HashMap<String, CacheEntry>,
    epochs: u64,
}

impl Inner {
    fn next_epoch(&mut self) -> u64 {
        self.epochs += 1;
        self.epochs
    }
}

/// The resolver. Cheap to clone; clones share the cache and
/// configuration.
#[derive(Clone)]
pub struct Resolver {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Resolver {
    fn default() -> Resolver {
        Resolver::new()
    }
}

impl Resolver {
    /// An unconfigured resolver; call [`Resolver::load`] before
    /// resolving anything that is not a literal or a hosts entry.
    pub fn new() -> Resolver {
        Resolver::with_name_servers(Vec::new())
    }

    pub fn with_name_servers(name_servers: Vec<SocketAddr>) -> Resolver {
        Resolver {
            inner: Rc::new(RefCell::new(Inner {
                name_servers,
                hosts: HashMap::new(),
                cache: HashMap::new(),
                epochs: 0,
            })),
        }
    }

    pub fn name_servers(&self) -> Vec<SocketAddr> {
        self.inner.borrow().name_servers.clone()
    }

    /// Loads the name-server list and the hosts file through the event
    /// loop. The callback receives one error slot per file; a failure
    /// in one does not prevent the other from loading.
    pub fn load(
        &self,
        lp: &mut EventLoop,
        options: ResolverOptions,
        cb: impl FnOnce(&mut EventLoop, Option<ResolveError>, Option<ResolveError>) + 'static,
    ) {
        let resolver = self.clone();
        let hosts_path = options.hosts_path.clone();
        lp.read_entire_file(options.resolv_path, move |lp, result| {
            let resolv_err = match result {
                Ok(bytes) => match config::parse_resolv(&String::from_utf8_lossy(&bytes)) {
                    Ok(servers) => {
                        log::info!("loaded {} name servers", servers.len());
                        resolver.inner.borrow_mut().name_servers = servers;
                        None
                    }
                    Err(err) => Some(err),
                },
                Err(err) => Some(ResolveError::Io(err)),
            };
            let resolver2 = resolver.clone();
            lp.read_entire_file(hosts_path, move |lp, result| {
                let hosts_err = match result {
                    Ok(bytes) => {
                        let hosts = config::parse_hosts(&String::from_utf8_lossy(&bytes));
                        log::info!("loaded {} hosts entries", hosts.len());
                        resolver2.inner.borrow_mut().hosts = hosts;
                        None
                    }
                    Err(err) => Some(ResolveError::Io(err)),
                };
                cb(lp, resolv_err, hosts_err);
            });
        });
    }

    /// Resolves `hostname` to an address. The callback always runs
    /// asynchronously, even for literals and cache hits.
    pub fn resolve(
        &self,
        lp: &mut EventLoop,
        hostname: &str,
        cb: impl FnOnce(&mut EventLoop, Result<DnsAnswer, ResolveError>) + 'static,
    ) {
        let hostname = hostname.trim().trim_end_matches('.').to_ascii_lowercase();

        if let Ok(addr) = hostname.parse::<IpAddr>() {
            let answer = DnsAnswer { addr, ttl_secs: 0 };
            lp.next_tick(move |lp, _| cb(lp, Ok(answer)));
            return;
        }
        if !valid_hostname(&hostname) {
            lp.next_tick(move |lp, _| cb(lp, Err(ResolveError::InvalidHostname)));
            return;
        }
        let hosts_hit = self.inner.borrow().hosts.get(&hostname).copied();
        if let Some(addr) = hosts_hit {
            let answer = DnsAnswer { addr, ttl_secs: 0 };
            lp.next_tick(move |lp, _| cb(lp, Ok(answer)));
            return;
        }

        enum Decision {
            Queue,
            Answer(Result<DnsAnswer, ResolveError>),
            Start,
            FailNoServers,
        }

        let decision = {
            let mut inner = self.inner.borrow_mut();
            let now = Instant::now();
            let stale = matches!(
                inner.cache.get(&hostname),
                Some(entry) if !entry.resolving
                    && entry.expires_at.map_or(false, |at| at <= now)
            );
            if stale {
                inner.cache.remove(&hostname);
            }
            match inner.cache.get(&hostname) {
                Some(entry) if entry.resolving => Decision::Queue,
                Some(entry) => Decision::Answer(match (entry.answer, entry.error.clone()) {
                    (Some(answer), _) => Ok(answer),
                    (None, Some(err)) => Err(err),
                    (None, None) => Err(ResolveError::UnableToResolve),
                }),
                None => {
                    let epoch = inner.next_epoch();
                    inner
                        .cache
                        .insert(hostname.clone(), CacheEntry::resolving(epoch));
                    if inner.name_servers.is_empty() {
                        Decision::FailNoServers
                    } else {
                        Decision::Start
                    }
                }
            }
        };

        match decision {
            Decision::Answer(result) => lp.next_tick(move |lp, _| cb(lp, result)),
            Decision::Queue => {
                self.enqueue_waiter(&hostname, Box::new(cb));
            }
            Decision::FailNoServers => {
                self.enqueue_waiter(&hostname, Box::new(cb));
                let resolver = self.clone();
                lp.next_tick(move |lp, _| {
                    resolver.publish(lp, &hostname, Err(ResolveError::InvalidResolvConfig));
                });
            }
            Decision::Start => {
                self.enqueue_waiter(&hostname, Box::new(cb));
                Lookup::start(self.clone(), hostname, lp);
            }
        }
    }

    /// Drops every settled cache entry; in-flight resolutions keep
    /// their waiters.
    pub fn cache_clear(&self) {
        self.inner.borrow_mut().cache.retain(|_, entry| entry.resolving);
    }

    /// Drops the named entry, unless a resolution is in flight for it.
    pub fn cache_evict(&self, hostname: &str) {
        let hostname = hostname.to_ascii_lowercase();
        let mut inner = self.inner.borrow_mut();
        if inner
            .cache
            .get(&hostname)
            .is_some_and(|entry| !entry.resolving)
        {
            inner.cache.remove(&hostname);
        }
    }

    fn enqueue_waiter(&self, hostname: &str, cb: ResolveCb) {
        if let Some(entry) = self.inner.borrow_mut().cache.get_mut(hostname) {
            entry.waiters.push(cb);
        }
    }

    /// Settles the entry, schedules its eviction and flushes every
    /// queued callback with the shared outcome.
    fn publish(&self, lp: &mut EventLoop, hostname: &str, result: Result<DnsAnswer, ResolveError>) {
        let ttl_secs = match &result {
            Ok(answer) => answer.ttl_secs.min(MAX_TTL_SECONDS),
            Err(_) => FAILURE_TTL_SECONDS,
        };
        let ttl = Duration::from_secs(u64::from(ttl_secs));

        let (waiters, epoch) = {
            let mut inner = self.inner.borrow_mut();
            let entry = match inner.cache.get_mut(hostname) {
                Some(entry) => entry,
                None => return,
            };
            entry.resolving = false;
            entry.expires_at = Some(Instant::now() + ttl);
            match &result {
                Ok(answer) => entry.answer = Some(*answer),
                Err(err) => entry.error = Some(err.clone()),
            }
            (std::mem::take(&mut entry.waiters), entry.epoch)
        };

        match &result {
            Ok(answer) => log::debug!(
                "resolved {:?} to {} (ttl {}s, {} waiters)",
                hostname,
                answer.addr,
                ttl_secs,
                waiters.len()
            ),
            Err(err) => log::debug!(
                "failed to resolve {:?}: {} ({} waiters)",
                hostname,
                err,
                waiters.len()
            ),
        }

        let resolver = self.clone();
        let host = hostname.to_string();
        lp.timeout_detached(ttl, move |_, _| {
            let mut inner = resolver.inner.borrow_mut();
            // a newer entry under the same name stays
            if inner.cache.get(&host).map(|entry| entry.epoch) == Some(epoch) {
                inner.cache.remove(&host);
            }
        });

        for waiter in waiters {
            waiter(lp, result.clone());
        }
    }
}

fn valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

/// One in-flight wire exchange for a hostname.
struct Lookup {
    resolver: Resolver,
    hostname: String,
    id: u16,
    packet: Vec<u8>,
    server: Option<usize>,
    family: QueryType,
    sock: Option<RawSock>,
    last_error: Option<ResolveError>,
}

impl Lookup {
    fn start(resolver: Resolver, hostname: String, lp: &mut EventLoop) {
        let id = rand::random::<u16>();
        let packet = match protocol::build_query(id, &hostname, QueryType::A) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("could not encode query for {:?}: {}", hostname, err);
                let resolver = resolver.clone();
                lp.next_tick(move |lp, _| {
                    resolver.publish(lp, &hostname, Err(ResolveError::InvalidHostname));
                });
                return;
            }
        };
        debug_assert!(packet.len() <= protocol::DNS_PACKET_MIN_LEN);

        let lookup = Rc::new(RefCell::new(Lookup {
            resolver,
            hostname,
            id,
            packet,
            server: None,
            family: QueryType::A,
            sock: None,
            last_error: None,
        }));
        advance(lookup, lp);
    }
}

/// Moves to the next name server; when the list runs out on A, rebuilds
/// the packet for AAAA and starts over; when it runs out on AAAA, the
/// resolution has failed.
fn advance(lookup: Rc<RefCell<Lookup>>, lp: &mut EventLoop) {
    let next_server: Option<SocketAddr> = {
        let mut lk = lookup.borrow_mut();
        let servers = lk.resolver.inner.borrow().name_servers.clone();
        let next = lk.server.map_or(0, |index| index + 1);
        if next < servers.len() {
            lk.server = Some(next);
            Some(servers[next])
        } else if lk.family == QueryType::A && !servers.is_empty() {
            lk.family = QueryType::Aaaa;
            lk.id = rand::random::<u16>();
            match protocol::build_query(lk.id, &lk.hostname, QueryType::Aaaa) {
                Ok(packet) => {
                    lk.packet = packet;
                    lk.server = Some(0);
                    Some(servers[0])
                }
                Err(_) => None,
            }
        } else {
            None
        }
    };

    let server = match next_server {
        Some(server) => server,
        None => {
            finish_failure(lookup, lp);
            return;
        }
    };

    let sock = match net::udp_socket(&server) {
        Ok(sock) => sock,
        Err(err) => {
            lookup.borrow_mut().last_error = Some(ResolveError::Io(err.into()));
            advance(lookup, lp);
            return;
        }
    };
    let previous = lookup.borrow_mut().sock.replace(sock);
    if let Some(old) = previous {
        lp.close(old, |_, _| {});
    }

    let packet = {
        let lk = lookup.borrow();
        log::debug!(
            "querying {} for {:?} ({:?})",
            server,
            lk.hostname,
            lk.family
        );
        lk.packet.clone()
    };

    let on_sent = lookup;
    lp.send_to(sock, packet, server, move |lp, _buf, result| {
        if let Err(err) = result {
            on_sent.borrow_mut().last_error = Some(ResolveError::Io(err));
            advance(on_sent, lp);
            return;
        }
        let on_reply = on_sent.clone();
        lp.recv_timeout(
            sock,
            vec![0u8; RESPONSE_BUF_LEN],
            DNS_SERVER_TIMEOUT,
            move |lp, buf, result| match result {
                Ok(n) => handle_response(on_reply, lp, &buf[..n]),
                Err(err) => {
                    on_reply.borrow_mut().last_error = Some(ResolveError::Io(err));
                    advance(on_reply, lp);
                }
            },
        );
    });
}

fn handle_response(lookup: Rc<RefCell<Lookup>>, lp: &mut EventLoop, bytes: &[u8]) {
    let verdict = {
        let lk = lookup.borrow();
        examine(bytes, lk.id, lk.family)
    };
    match verdict {
        Ok(Some((addr, ttl_secs))) => {
            let (resolver, hostname, sock) = {
                let mut lk = lookup.borrow_mut();
                (lk.resolver.clone(), lk.hostname.clone(), lk.sock.take())
            };
            if let Some(sock) = sock {
                lp.close(sock, |_, _| {});
            }
            resolver.publish(lp, &hostname, Ok(DnsAnswer { addr, ttl_secs }));
        }
        Ok(None) => {
            // a well-formed answer with nothing for this family
            lookup.borrow_mut().last_error = Some(ResolveError::UnableToResolve);
            advance(lookup, lp);
        }
        Err(err) => {
            lookup.borrow_mut().last_error = Some(err);
            advance(lookup, lp);
        }
    }
}

/// Validates a response and extracts the first record of the requested
/// family, in answer, authority, additional order.
fn examine(
    bytes: &[u8],
    id: u16,
    family: QueryType,
) -> Result<Option<(IpAddr, u32)>, ResolveError> {
    if bytes.len() < protocol::HEADER_LEN {
        return Err(ResolveError::ServerError);
    }
    let packet = DnsPacket::from_bytes(bytes).map_err(|err| {
        log::debug!("malformed response: {}", err);
        ResolveError::ServerError
    })?;
    if !packet.header.response || packet.header.id != id {
        return Err(ResolveError::ServerError);
    }
    if packet.header.questions != 1 {
        return Err(ResolveError::ServerError);
    }
    match packet.header.rescode {
        ResultCode::NOERROR => {}
        ResultCode::NXDOMAIN => return Err(ResolveError::UnableToResolve),
        code => {
            log::debug!("server answered {:?}", code);
            return Err(ResolveError::ServerError);
        }
    }
    let result = packet
        .records()
        .find_map(|record| record.address_for(family));
    Ok(result)
}

fn finish_failure(lookup: Rc<RefCell<Lookup>>, lp: &mut EventLoop) {
    let (resolver, hostname, sock, error) = {
        let mut lk = lookup.borrow_mut();
        (
            lk.resolver.clone(),
            lk.hostname.clone(),
            lk.sock.take(),
            lk.last_error
                .take()
                .unwrap_or(ResolveError::UnableToResolve),
        )
    };
    if let Some(sock) = sock {
        lp.close(sock, |_, _| {});
    }
    resolver.publish(lp, &hostname, Err(error));
}
