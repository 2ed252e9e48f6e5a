//! Tests for the runtime services, driven through mock capabilities
//! (transport, DNS, clock) so no sockets are involved.

mod bootstrap_tests;
mod presence_tests;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use p2pos_net::{DialTarget, NetError, Transport};
use p2pos_types::{FixedClock, PeerId, SharedClock};

/// The pinned "now" every test clock returns.
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 21, 11, 11, 1).unwrap()
}

pub fn test_clock() -> SharedClock {
    Arc::new(FixedClock(test_now()))
}

/// A scripted reply for one transport operation.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Respond with these bytes (requests) or succeed (notifies).
    Ok(Vec<u8>),
    /// Fail with [`NetError::ProtocolUnsupported`].
    Unsupported,
    /// Fail with a connect error.
    Fail(String),
}

type OpKey = (PeerId, Vec<u8>);

/// In-memory [`Transport`] with scripted responses and recorded calls.
pub struct MockTransport {
    local: PeerId,
    connected: Mutex<Vec<PeerId>>,
    responses: Mutex<HashMap<OpKey, VecDeque<MockReply>>>,
    /// Recorded `request` calls: (peer, alpn, body).
    pub requests: Mutex<Vec<(PeerId, Vec<u8>, Vec<u8>)>>,
    /// Recorded `notify` calls: (peer, alpn, body).
    pub notifies: Mutex<Vec<(PeerId, Vec<u8>, Vec<u8>)>>,
    /// Recorded `dial` calls.
    pub dials: Mutex<Vec<DialTarget>>,
    /// When set, dials fail with a connect error.
    pub fail_dials: Mutex<bool>,
}

impl MockTransport {
    pub fn new(local: PeerId) -> Arc<Self> {
        Arc::new(Self {
            local,
            connected: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            notifies: Mutex::new(Vec::new()),
            dials: Mutex::new(Vec::new()),
            fail_dials: Mutex::new(false),
        })
    }

    /// Mark `peer` as connected.
    pub fn add_connected(&self, peer: PeerId) {
        let mut connected = self.connected.lock().unwrap();
        if !connected.contains(&peer) {
            connected.push(peer);
        }
    }

    /// Queue a reply for the next operation on `(peer, alpn)`.
    pub fn script(&self, peer: PeerId, alpn: &[u8], reply: MockReply) {
        self.responses
            .lock()
            .unwrap()
            .entry((peer, alpn.to_vec()))
            .or_default()
            .push_back(reply);
    }

    fn next_reply(&self, peer: &PeerId, alpn: &[u8]) -> Option<MockReply> {
        self.responses
            .lock()
            .unwrap()
            .get_mut(&(*peer, alpn.to_vec()))
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.lock().unwrap().clone()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.lock().unwrap().contains(peer)
    }

    async fn dial(&self, target: &DialTarget, _timeout: Duration) -> Result<(), NetError> {
        self.dials.lock().unwrap().push(target.clone());
        if *self.fail_dials.lock().unwrap() {
            return Err(NetError::Connect("dial refused".to_string()));
        }
        self.add_connected(target.peer_id);
        Ok(())
    }

    async fn request(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
        body: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, NetError> {
        self.requests
            .lock()
            .unwrap()
            .push((*peer, alpn.to_vec(), body.to_vec()));
        match self.next_reply(peer, alpn) {
            Some(MockReply::Ok(bytes)) => Ok(bytes),
            Some(MockReply::Unsupported) => Err(NetError::ProtocolUnsupported),
            Some(MockReply::Fail(msg)) => Err(NetError::Connect(msg)),
            None => Err(NetError::Connect("no scripted response".to_string())),
        }
    }

    async fn notify(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
        body: &[u8],
        _timeout: Duration,
    ) -> Result<(), NetError> {
        match self.next_reply(peer, alpn) {
            Some(MockReply::Unsupported) => Err(NetError::ProtocolUnsupported),
            Some(MockReply::Fail(msg)) => Err(NetError::Connect(msg)),
            _ => {
                self.notifies
                    .lock()
                    .unwrap()
                    .push((*peer, alpn.to_vec(), body.to_vec()));
                Ok(())
            }
        }
    }

    async fn close(&self) {}
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 2s: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
