//! The interactive channel: primary search and request/response with
//! transparent failover.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use palaver_config::{PalaverConfig, ReplicaSpec};
use palaver_types::UserId;
use palaver_wire::{FrameReader, Request, Response, write_frame};

use crate::error::{ClientError, ClientResult};
use crate::subscription::Subscription;

/// Deadline for connecting and for reading the greeting probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for a response to an accepted request. Generous enough to
/// ride out one probe round of failover stall.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between full sweeps of the replica table, so a cluster that is
/// mid-election is not hammered.
const SEARCH_BACKOFF: Duration = Duration::from_millis(200);

struct Channel {
    reader: FrameReader<TcpStream>,
    writer: TcpStream,
}

/// The client's connection to the cluster.
pub struct Connector {
    replicas: Vec<ReplicaSpec>,
    ix: usize,
    primary: Option<usize>,
    channel: Option<Channel>,
    search_limit: Option<u64>,
}

impl Connector {
    /// Builds a connector over the replica table and finds the primary.
    pub fn connect(cfg: &PalaverConfig) -> ClientResult<Connector> {
        Self::connect_with_limit(cfg, None)
    }

    /// As [`Connector::connect`], giving up after `limit` full sweeps of
    /// the table. The protocol itself retries unboundedly; the limit
    /// exists for embedders that need to fail fast.
    pub fn connect_with_limit(cfg: &PalaverConfig, limit: Option<u64>) -> ClientResult<Connector> {
        let replicas: Vec<ReplicaSpec> = cfg.ordered().into_iter().cloned().collect();
        let mut connector = Connector {
            replicas,
            ix: 0,
            primary: None,
            channel: None,
            search_limit: limit,
        };
        connector.attempt_connection()?;
        Ok(connector)
    }

    /// The replica currently believed to be primary.
    pub fn primary(&self) -> Option<&ReplicaSpec> {
        self.primary.map(|ix| &self.replicas[ix])
    }

    /// Walks the replica table from the current index until a gateway's
    /// greeting reports primary.
    fn attempt_connection(&mut self) -> ClientResult<()> {
        self.channel = None;
        self.primary = None;
        let mut attempts: u64 = 0;
        loop {
            let candidate = self.ix;
            let spec = &self.replicas[candidate];
            match probe(spec) {
                Ok(channel) => {
                    info!(replica = %spec.name, "primary found");
                    self.primary = Some(candidate);
                    self.channel = Some(channel);
                    self.ix = (self.ix + 1) % self.replicas.len();
                    return Ok(());
                }
                Err(err) => {
                    debug!(replica = %spec.name, %err, "not the primary");
                }
            }
            self.ix = (self.ix + 1) % self.replicas.len();
            attempts += 1;
            if attempts.is_multiple_of(self.replicas.len() as u64) {
                if let Some(limit) = self.search_limit
                    && attempts >= limit * self.replicas.len() as u64
                {
                    return Err(ClientError::NoPrimary { cycles: limit });
                }
                std::thread::sleep(SEARCH_BACKOFF);
            }
        }
    }

    /// Sends one request and waits for its response.
    ///
    /// On any transport failure the socket is dropped, the primary
    /// search re-runs, and the same request is sent again — unboundedly
    /// (or until the search limit trips).
    pub fn send_request(&mut self, request: &Request) -> ClientResult<Response> {
        let line = request.marshal()?;
        loop {
            if self.channel.is_none() {
                self.attempt_connection()?;
            }
            let channel = self.channel.as_mut().expect("connected above");
            match exchange(channel, &line) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(%err, "request failed in flight; reconnecting");
                    self.channel = None;
                }
            }
        }
    }

    /// Opens the subscription channel for `user` against the current
    /// primary. See [`Subscription`] for the delivery side.
    pub fn subscribe(&mut self, user: &UserId) -> ClientResult<Subscription> {
        let spec = self.primary().ok_or(ClientError::NotConnected)?;
        Subscription::open(spec, user)
    }

    /// One heartbeat round against the current primary's HEALTH port.
    /// `false` means the primary is unreachable and a new search is in
    /// order.
    pub fn ping_primary(&self) -> bool {
        let Some(spec) = self.primary() else {
            return false;
        };
        let Ok(addr) = spec
            .health_addr()
            .to_socket_addrs()
            .map(|mut addrs| addrs.next())
        else {
            return false;
        };
        let Some(addr) = addr else {
            return false;
        };
        let Ok(mut stream) = TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) else {
            return false;
        };
        if stream.set_read_timeout(Some(PROBE_TIMEOUT)).is_err() {
            return false;
        }
        let Ok(line) = Response::Ping.marshal() else {
            return false;
        };
        if write_frame(&mut stream, &line).is_err() {
            return false;
        }
        let mut scratch = [0u8; 64];
        matches!(stream.read(&mut scratch), Ok(n) if n > 0)
    }
}

/// Connects to one replica's CLIENT port and reads its greeting probe.
fn probe(spec: &ReplicaSpec) -> ClientResult<Channel> {
    let addr = spec
        .client_addr()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::other("unresolvable replica address"))?;
    let stream = TcpStream::connect_timeout(&addr, PROBE_TIMEOUT)?;
    stream.set_read_timeout(Some(PROBE_TIMEOUT))?;
    let writer = stream.try_clone()?;
    let mut reader = FrameReader::new(stream);

    let line = reader
        .read_frame()?
        .ok_or_else(|| std::io::Error::other("gateway closed before greeting"))?;
    let greeting = Response::unmarshal(&line)?;
    if !greeting.success() {
        return Err(std::io::Error::other("replica is not primary").into());
    }

    writer.set_read_timeout(Some(REQUEST_TIMEOUT))?;
    Ok(Channel { reader, writer })
}

fn exchange(channel: &mut Channel, line: &str) -> ClientResult<Response> {
    write_frame(&mut channel.writer, line)?;
    let answer = channel
        .reader
        .read_frame()?
        .ok_or_else(|| std::io::Error::other("server closed connection"))?;
    Ok(Response::unmarshal(&answer)?)
}
