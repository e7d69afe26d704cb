//! Pending-Request Store: indexes in-flight public-side requests by id so
//! asynchronous protocol replies from the client route back to the correct
//! sink (`spec.md` §4.5). One entry per in-flight HTTP request, WebSocket
//! bridge, or raw TCP connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use sellia_proto::{HeaderList, WsOpcode};

/// One event delivered to a pending HTTP request's sink, in the order the
/// client sent the corresponding `response_*` messages.
#[derive(Debug, Clone)]
pub enum HttpEvent {
    ResponseStart { status: u16, headers: HeaderList },
    ResponseBody { chunk: Vec<u8> },
    ResponseEnd,
    /// Synthetic event raised by the store itself (timeout, tunnel gone),
    /// never sent by a client.
    GatewayError { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub enum WsEvent {
    UpgradeOk { headers: HeaderList },
    UpgradeError { status: u16 },
    Frame { opcode: WsOpcode, payload: Vec<u8>, fin: bool },
    Close { code: Option<u16>, reason: Option<String> },
}

#[derive(Debug, Clone)]
pub enum TcpEvent {
    OpenOk,
    OpenError { message: String },
    Data { data: Vec<u8> },
    Close { reason: Option<String> },
}

/// The sink a [`PendingRequest`] delivers events to. One variant per
/// ingress kind; each ingress only ever constructs the variant it needs.
pub enum PendingSink {
    Http(mpsc::Sender<HttpEvent>),
    Ws(mpsc::Sender<WsEvent>),
    Tcp(mpsc::Sender<TcpEvent>),
}

/// An in-flight public-side request awaiting replies from a client over its
/// control channel. Owned by the tunnel that will answer it, so
/// `remove_by_tunnel` can fail every request a disconnecting client owed an
/// answer to.
pub struct PendingRequest {
    pub id: String,
    pub tunnel_id: String,
    sink: PendingSink,
    /// Set once the first reply byte is observed. `spec.md` §4.5: writes
    /// after this point must not alter status; they only append body bytes
    /// and are silently discarded on delivery failure.
    first_byte_written: AtomicBool,
}

impl PendingRequest {
    pub fn new(id: String, tunnel_id: String, sink: PendingSink) -> Self {
        Self {
            id,
            tunnel_id,
            sink,
            first_byte_written: AtomicBool::new(false),
        }
    }

    fn mark_started(&self) -> bool {
        !self.first_byte_written.swap(true, Ordering::AcqRel)
    }

    pub fn has_started(&self) -> bool {
        self.first_byte_written.load(Ordering::Acquire)
    }

    /// Deliver an HTTP event. Returns `false` if this request is not an
    /// HTTP pending request or the sink has gone away.
    pub fn deliver_http(&self, event: HttpEvent) -> bool {
        let PendingSink::Http(tx) = &self.sink else {
            return false;
        };
        if matches!(event, HttpEvent::ResponseStart { .. }) {
            self.mark_started();
        }
        tx.try_send(event).is_ok()
    }

    pub fn deliver_ws(&self, event: WsEvent) -> bool {
        let PendingSink::Ws(tx) = &self.sink else {
            return false;
        };
        if matches!(event, WsEvent::UpgradeOk { .. } | WsEvent::UpgradeError { .. }) {
            self.mark_started();
        }
        tx.try_send(event).is_ok()
    }

    pub fn deliver_tcp(&self, event: TcpEvent) -> bool {
        let PendingSink::Tcp(tx) = &self.sink else {
            return false;
        };
        if matches!(event, TcpEvent::OpenOk | TcpEvent::OpenError { .. }) {
            self.mark_started();
        }
        tx.try_send(event).is_ok()
    }
}

/// Indexes [`PendingRequest`]s by id, with a secondary index by owning
/// tunnel so a tunnel's disconnect can fail every request it owed an answer
/// to in one pass.
#[derive(Default)]
pub struct PendingStore {
    by_id: DashMap<String, Arc<PendingRequest>>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, request: Arc<PendingRequest>) {
        self.by_id.insert(request.id.clone(), request);
    }

    /// Removes and returns the pending request, or `None` if it already
    /// completed, timed out, or was never registered (e.g. it arrived after
    /// the public caller gave up).
    pub fn take(&self, id: &str) -> Option<Arc<PendingRequest>> {
        self.by_id.remove(id).map(|(_, v)| v)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PendingRequest>> {
        self.by_id.get(id).map(|e| e.value().clone())
    }

    /// Fails every request owned by `tunnel_id` with a gateway error
    /// (status 502), per `spec.md` §4.5, and removes them from the store.
    /// Returns the count removed.
    pub fn remove_by_tunnel(&self, tunnel_id: &str) -> usize {
        let ids: Vec<String> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().tunnel_id == tunnel_id)
            .map(|entry| entry.key().clone())
            .collect();

        let count = ids.len();
        for id in ids {
            if let Some((_, request)) = self.by_id.remove(&id) {
                fail_request(&request, 502, "tunnel client disconnected");
            }
        }
        if count > 0 {
            debug!(tunnel_id, count, "failed pending requests for disconnected tunnel");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Delivers a synthetic gateway-error event to whichever sink `request`
/// holds. Used for timeouts and tunnel-gone cleanup, never for a real
/// client reply.
fn fail_request(request: &PendingRequest, status: u16, message: &str) {
    match &request.sink {
        PendingSink::Http(_) => {
            request.deliver_http(HttpEvent::GatewayError {
                status,
                message: message.to_string(),
            });
        }
        PendingSink::Ws(_) => {
            request.deliver_ws(WsEvent::UpgradeError { status });
        }
        PendingSink::Tcp(_) => {
            request.deliver_tcp(TcpEvent::OpenError {
                message: message.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_request(id: &str, tunnel_id: &str) -> (Arc<PendingRequest>, mpsc::Receiver<HttpEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let request = Arc::new(PendingRequest::new(
            id.to_string(),
            tunnel_id.to_string(),
            PendingSink::Http(tx),
        ));
        (request, rx)
    }

    #[test]
    fn add_then_take_removes_it() {
        let store = PendingStore::new();
        let (request, _rx) = http_request("r1", "t1");
        store.add(request);

        assert_eq!(store.len(), 1);
        assert!(store.take("r1").is_some());
        assert!(store.take("r1").is_none());
    }

    #[test]
    fn get_does_not_remove() {
        let store = PendingStore::new();
        let (request, _rx) = http_request("r1", "t1");
        store.add(request);

        assert!(store.get("r1").is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn deliver_http_marks_started_on_response_start() {
        let (request, mut rx) = http_request("r1", "t1");
        assert!(!request.has_started());

        assert!(request.deliver_http(HttpEvent::ResponseStart {
            status: 200,
            headers: vec![],
        }));
        assert!(request.has_started());

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HttpEvent::ResponseStart { status: 200, .. }));
    }

    #[tokio::test]
    async fn remove_by_tunnel_fails_owned_requests_with_502() {
        let store = PendingStore::new();
        let (r1, mut rx1) = http_request("r1", "t1");
        let (r2, _rx2) = http_request("r2", "t2");
        store.add(r1);
        store.add(r2);

        let removed = store.remove_by_tunnel("t1");
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);

        let event = rx1.recv().await.unwrap();
        match event {
            HttpEvent::GatewayError { status, .. } => assert_eq!(status, 502),
            other => panic!("expected GatewayError, got {other:?}"),
        }
    }

    #[test]
    fn deliver_wrong_kind_returns_false() {
        let (request, _rx) = http_request("r1", "t1");
        assert!(!request.deliver_ws(WsEvent::UpgradeOk { headers: vec![] }));
        assert!(!request.deliver_tcp(TcpEvent::OpenOk));
    }
}
